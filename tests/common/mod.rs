#![allow(dead_code)]

use fetchgate::telemetry::MemorySink;
use fetchgate::{AdvancingSleeper, GovernanceConfig, GovernanceLayer, ManualClock};
use std::sync::Arc;

/// A realistic epoch timestamp to start manual clocks at.
pub const T0: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Layer on a manual clock whose backoff waits advance that clock instead of sleeping.
pub struct Harness {
    pub clock: ManualClock,
    pub sleeper: AdvancingSleeper,
    pub sink: MemorySink,
    pub layer: GovernanceLayer<String, MemorySink>,
}

pub fn harness(config: GovernanceConfig) -> Harness {
    let clock = ManualClock::starting_at(T0);
    let sleeper = AdvancingSleeper::new(clock.clone());
    let sink = MemorySink::new();
    let layer = GovernanceLayer::builder()
        .config(config)
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(sleeper.clone()))
        .telemetry(sink.clone())
        .build()
        .expect("valid config");
    Harness { clock, sleeper, sink, layer }
}
