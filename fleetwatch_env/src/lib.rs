//! FleetWatch Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the fleet
//! reconciler to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept: Owned Resources
//!
//! Everything that would make a live subscription non-deterministic is
//! routed through this crate:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Background work (`spawn()` returning an owned `TaskHandle`)
//! - The push channel (`LiveTransport::open_live_channel()`)
//!
//! A subscription owns its timer task and its channel, so tearing it down
//! cancels both and nothing keeps ticking behind its back.
//!
//! # Example
//!
//! ```ignore
//! use fleetwatch_env::{FleetContext, LiveTransport};
//!
//! async fn pump<Ctx: FleetContext, T: LiveTransport>(ctx: &Ctx, transport: &T, agency: &AgencyId) {
//!     let mut channel = transport.open_live_channel(agency).await?;
//!     while let Some(frame) = channel.recv().await {
//!         handle(frame);
//!     }
//!     ctx.sleep(Duration::from_secs(5)).await;
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::{FleetContext, TaskHandle};
pub use network::{LiveChannel, LiveFrame, LiveSender, LiveTransport};
pub use types::{AgencyId, SubscriptionId, VehicleId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
