//! Named simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// FW-001: generated stop-and-go trips, stops match the parked dwells
    StopAndGo,

    /// FW-002: sentinel, NaN, out-of-range and untimed records mixed in
    SentinelNoise,

    /// FW-003: live hub unreachable, reconciler falls back to polling
    PollFailover,

    /// FW-004: live channel drops mid-stream and is reopened once
    ChannelDrop,

    /// FW-005: slow backend, poll ticks overlap, then teardown
    OverlappingTicks,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StopAndGo,
            ScenarioId::SentinelNoise,
            ScenarioId::PollFailover,
            ScenarioId::ChannelDrop,
            ScenarioId::OverlappingTicks,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StopAndGo => "stop_and_go",
            ScenarioId::SentinelNoise => "sentinel_noise",
            ScenarioId::PollFailover => "poll_failover",
            ScenarioId::ChannelDrop => "channel_drop",
            ScenarioId::OverlappingTicks => "overlapping_ticks",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StopAndGo => "Seeded trips with parked dwells; detected stops must match ground truth",
            ScenarioId::SentinelNoise => "20% corrupted records; pipeline completes and data quality drops",
            ScenarioId::PollFailover => "Live hub refuses connections; one reconnect, then poll every 30s",
            ScenarioId::ChannelDrop => "Channel closes mid-stream; single reconnect after 5s restores push",
            ScenarioId::OverlappingTicks => "45s fetch latency vs 30s ticks; overlap tolerated, teardown discards late results",
        }
    }

    /// True for scenarios that exercise the live reconciler rather than routes.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ScenarioId::PollFailover | ScenarioId::ChannelDrop | ScenarioId::OverlappingTicks
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stop_and_go" | "stopandgo" | "fw-001" => Ok(ScenarioId::StopAndGo),
            "sentinel_noise" | "sentinelnoise" | "fw-002" => Ok(ScenarioId::SentinelNoise),
            "poll_failover" | "pollfailover" | "fw-003" => Ok(ScenarioId::PollFailover),
            "channel_drop" | "channeldrop" | "fw-004" => Ok(ScenarioId::ChannelDrop),
            "overlapping_ticks" | "overlappingticks" | "fw-005" => Ok(ScenarioId::OverlappingTicks),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
