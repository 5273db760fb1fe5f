use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde_json::json;

/// A gauge that also remembers the highest value it reached, used for queue depths.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter").field("count", &self.count()).field("max", &self.max()).finish()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the gauge by `delta`.
    #[inline]
    pub fn add(&self, delta: isize) {
        let now = self.current.fetch_add(delta, Ordering::SeqCst) + delta;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    #[inline]
    pub fn set(&self, value: isize) {
        self.current.store(value, Ordering::SeqCst);
        self.peak.fetch_max(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "count": self.count(), "max": self.max() })
    }
}
