use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde_json::json;

use crate::{timestamp_millis, TimestampMillis};

/// Monotonic event counter that can report the per-second rate since the previous sample.
pub struct Counter {
    count: AtomicU64,
    sampled: AtomicU64,
    sampled_at: AtomicI64,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter {
            count: AtomicU64::new(self.count.load(Ordering::SeqCst)),
            sampled: AtomicU64::new(self.sampled.load(Ordering::SeqCst)),
            sampled_at: AtomicI64::new(self.sampled_at.load(Ordering::SeqCst)),
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{} }}"#, self.count())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::new_at(timestamp_millis())
    }

    #[inline]
    fn new_at(now: TimestampMillis) -> Self {
        Counter { count: AtomicU64::new(0), sampled: AtomicU64::new(0), sampled_at: AtomicI64::new(now) }
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: u64) {
        self.count.fetch_add(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Events per second since the previous call, and starts a new sampling window.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate_at(timestamp_millis())
    }

    fn rate_at(&self, now: TimestampMillis) -> f64 {
        let count = self.count();
        let prev = self.sampled.swap(count, Ordering::SeqCst);
        let prev_at = self.sampled_at.swap(now, Ordering::SeqCst);
        let elapsed = now - prev_at;
        if elapsed <= 0 {
            return 0.0;
        }
        count.saturating_sub(prev) as f64 * 1000.0 / elapsed as f64
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
        })
    }
}
