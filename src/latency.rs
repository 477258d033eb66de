//! Round-trip latency tracking with a bounded sample window.
//!
//! ## Guarantees
//! - Bounded: the sample ring evicts its oldest entry when full.
//! - Keyed timers are overwritten on reuse (`ping`) and must be cancelled
//!   explicitly for one-shot keys that never see a response.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Default number of samples kept for percentile estimates.
pub const DEFAULT_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// Rolling ring buffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer of `f64` samples.
///
/// Evicts the oldest entry when full. Push is O(1).
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<f64>,
    head: usize,
    len: usize,
    cap: usize,
}

impl RingBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            buf: vec![0.0; cap],
            head: 0,
            len: 0,
            cap,
        }
    }

    /// Push a sample, evicting the oldest when full.
    pub fn push(&mut self, value: f64) {
        self.buf[self.head] = value;
        self.head = (self.head + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn capacity(&self) -> usize { self.cap }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Iterate samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.len == self.cap {
            self.head
        } else {
            0
        };
        (0..self.len).map(move |i| self.buf[(start + i) % self.cap])
    }

    /// Most recently pushed sample.
    pub fn last(&self) -> Option<f64> {
        if self.is_empty() { return None; }
        Some(self.buf[(self.head + self.cap - 1) % self.cap])
    }

    /// Value at sorted index `floor(len * q)`, clamped to the last element.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.is_empty() { return None; }
        let mut v: Vec<f64> = self.iter().collect();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((v.len() as f64 * q).floor() as usize).min(v.len() - 1);
        Some(v[idx])
    }
}

// ---------------------------------------------------------------------------
// LatencyTracker
// ---------------------------------------------------------------------------

/// Derived latency figures, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub last_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

/// Matches outbound timers to their responses and keeps the rolling sample.
#[derive(Debug)]
pub struct LatencyTracker {
    pending: HashMap<String, Instant>,
    samples: RingBuffer,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            pending: HashMap::new(),
            samples: RingBuffer::new(window),
        }
    }

    /// Start (or restart) the timer for `key`.
    pub fn begin(&mut self, key: impl Into<String>) {
        self.pending.insert(key.into(), Instant::now());
    }

    /// Stop the timer for `key` and record the elapsed time.
    ///
    /// Returns the measured latency, or `None` when no timer was running.
    pub fn complete(&mut self, key: &str) -> Option<f64> {
        let started = self.pending.remove(key)?;
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.samples.push(ms);
        Some(ms)
    }

    /// Drop the timer for `key` without recording a sample.
    pub fn cancel(&mut self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record an externally measured sample.
    pub fn record(&mut self, ms: f64) {
        self.samples.push(ms);
    }

    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            count: self.samples.len(),
            last_ms: self.samples.last(),
            p50_ms: self.samples.percentile(0.50),
            p95_ms: self.samples.percentile(0.95),
        }
    }

    /// Forget samples and running timers.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut r = RingBuffer::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            r.push(v);
        }
        assert_eq!(r.len(), 3);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(r.last(), Some(4.0));
    }

    #[test]
    fn test_ring_buffer_zero_capacity_bumped() {
        let r = RingBuffer::new(0);
        assert_eq!(r.capacity(), 1);
    }

    #[test]
    fn test_percentiles_on_hundred_samples() {
        let mut t = LatencyTracker::new(100);
        // pushed in reverse to prove sorting happens
        for i in (1..=100).rev() {
            t.record(i as f64 * 10.0);
        }
        let s = t.stats();
        assert_eq!(s.count, 100);
        assert_eq!(s.p50_ms, Some(510.0));
        assert_eq!(s.p95_ms, Some(960.0));
        assert_eq!(s.last_ms, Some(10.0));
    }

    #[test]
    fn test_percentiles_single_sample() {
        let mut t = LatencyTracker::default();
        t.record(42.0);
        assert_eq!(t.stats().p50_ms, Some(42.0));
        assert_eq!(t.stats().p95_ms, Some(42.0));
    }

    #[test]
    fn test_empty_stats() {
        let t = LatencyTracker::default();
        assert_eq!(t.stats(), LatencyStats::default());
    }

    #[test]
    fn test_window_bounded() {
        let mut t = LatencyTracker::new(100);
        for i in 0..250 {
            t.record(i as f64);
        }
        assert_eq!(t.stats().count, 100);
    }

    #[test]
    fn test_begin_complete_records_sample() {
        let mut t = LatencyTracker::default();
        t.begin("ping");
        let ms = t.complete("ping").expect("timer was running");
        assert!(ms >= 0.0);
        assert_eq!(t.stats().count, 1);
        assert!(!t.is_pending("ping"));
    }

    #[test]
    fn test_complete_unknown_key_is_none() {
        let mut t = LatencyTracker::default();
        assert!(t.complete("nope").is_none());
        assert_eq!(t.stats().count, 0);
    }

    #[test]
    fn test_reused_key_overwrites() {
        let mut t = LatencyTracker::default();
        t.begin("ping");
        t.begin("ping");
        assert_eq!(t.pending_len(), 1);
    }

    #[test]
    fn test_cancel_drops_timer_without_sample() {
        let mut t = LatencyTracker::default();
        t.begin("turn:1");
        assert!(t.cancel("turn:1"));
        assert!(!t.cancel("turn:1"));
        assert_eq!(t.pending_len(), 0);
        assert_eq!(t.stats().count, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut t = LatencyTracker::default();
        t.record(1.0);
        t.begin("ping");
        t.reset();
        assert_eq!(t.pending_len(), 0);
        assert_eq!(t.stats().count, 0);
    }
}
