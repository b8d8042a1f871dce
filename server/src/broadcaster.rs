use crate::hub::HubBroadcast;
use crate::registry::PeerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Pushes a full positions snapshot to every session on a fixed period,
/// regardless of how often clients report their own pose.
pub struct TickBroadcaster {
    period: Duration,
    ticks: u64,
}

impl TickBroadcaster {
    pub fn new(period: Duration) -> Self {
        Self { period, ticks: 0 }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Timer for the hub loop. A late tick is skipped rather than bunched:
    /// the next snapshot supersedes it anyway.
    pub fn interval(&self) -> Interval {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Take one snapshot and fan it out. Returns how many sessions were
    /// subscribed at send time; slow ones lag on their own receiver and never
    /// hold up the rest.
    pub fn tick(&mut self, registry: &PeerRegistry, tx: &broadcast::Sender<HubBroadcast>) -> usize {
        self.ticks += 1;
        let positions = registry.snapshot().to_positions();
        tx.send(HubBroadcast::Positions(Arc::new(positions)))
            .unwrap_or(0)
    }
}
