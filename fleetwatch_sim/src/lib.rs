//! FleetWatch Deterministic Simulation Harness
//!
//! Drives the route pipeline and the fleet reconciler against scripted
//! backends on tokio's paused clock, so a seed fully determines a run.
//!
//! # What Is Simulated
//!
//! - **Time**: tokio's timer is paused and auto-advances when every task is
//!   idle; the wall clock is a fixed epoch plus elapsed virtual time
//! - **Backend**: [`SimFleet`] serves snapshots, histories and latest
//!   positions, with latency and per-call failure injection
//! - **Push hub**: [`SimLiveTransport`] opens channels that test code can
//!   feed, drop or fail
//! - **Randomness**: every trip and fleet layout derives from the seed
//!
//! # Architecture
//!
//! ```text
//!  TripGenerator ──records──► process_route / fetch_route ◄── SimFleet
//!                                                               ▲
//!                                               snapshot / poll │
//!  SimLiveTransport ──frames──► FleetReconciler ────────────────┘
//!                                     │
//!                                     └──alerts──► RecordingAlertSink
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleetwatch_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 6).run_blocking(ScenarioId::ChannelDrop);
//! assert!(result.passed);
//! ```

mod alerts;
mod context;
mod fleet;
mod network;
mod runner;
pub mod scenarios;
pub mod trips;

pub use alerts::RecordingAlertSink;
pub use context::SimContext;
pub use fleet::{FetchStats, SimFleet};
pub use network::SimLiveTransport;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use trips::{GeneratedTrip, TripGenerator};
