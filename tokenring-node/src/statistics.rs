use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the ring system.
pub struct RingStatistics(Arc<RingStatisticsInner>);

impl Deref for RingStatistics {
    type Target = RingStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct RingStatisticsInner {
    /// The number of tokens received from the predecessor.
    pub(crate) tokens_received: Counter,
    /// The number of tokens successfully forwarded to the successor.
    pub(crate) tokens_forwarded: Counter,
    /// The number of elections this node has started.
    pub(crate) elections_started: Counter,
    /// The number of elections this node has seen conclude.
    pub(crate) elections_concluded: Counter,
    /// The number of times this node replaced a lost successor.
    pub(crate) successor_repairs: Counter,
}

impl RingStatisticsInner {
    /// The number of tokens received from the predecessor.
    pub fn tokens_received(&self) -> u64 {
        self.tokens_received.load(Ordering::Relaxed)
    }

    /// The number of tokens successfully forwarded to the successor.
    pub fn tokens_forwarded(&self) -> u64 {
        self.tokens_forwarded.load(Ordering::Relaxed)
    }

    /// The number of elections this node has started.
    pub fn elections_started(&self) -> u64 {
        self.elections_started.load(Ordering::Relaxed)
    }

    /// The number of elections this node has seen conclude.
    pub fn elections_concluded(&self) -> u64 {
        self.elections_concluded.load(Ordering::Relaxed)
    }

    /// The number of times this node replaced a lost successor.
    pub fn successor_repairs(&self) -> u64 {
        self.successor_repairs.load(Ordering::Relaxed)
    }
}

pub(crate) fn increment(counter: &Counter) {
    counter.fetch_add(1, Ordering::Relaxed);
}
