//! Metrics instruments for the forwarder.
//!
//! Plain atomic counters and gauges; cheap enough to update on every
//! message without further plumbing.

use std::sync::atomic::{AtomicU64, Ordering};

/* ---------------------------------------------------------------- *
 * Simple Counter
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        let c = Counter::new();
        c.value.store(self.value(), Ordering::Relaxed);
        c
    }
}

/* ---------------------------------------------------------------- *
 * Gauge
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Clone for Gauge {
    fn clone(&self) -> Self {
        let g = Gauge::new();
        g.value.store(self.value(), Ordering::Relaxed);
        g
    }
}

/* ---------------------------------------------------------------- *
 * Aggregate metrics for the forwarder
 * ---------------------------------------------------------------- */

#[derive(Debug, Default, Clone)]
pub struct ForwarderMetrics {
    pub interests_accepted: Counter,
    pub interests_dropped: Counter,
    pub interests_sent: Counter,
    pub interests_stuffed: Counter,
    pub content_items_sent: Counter,
    pub content_dups_recvd: Counter,
    pub oldformat_content: Counter,

    pub cs_size: Gauge,
    pub pit_size: Gauge,
    pub face_count: Gauge,

    pub bytes_received: Counter,
    pub bytes_sent: Counter,
}

impl ForwarderMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
