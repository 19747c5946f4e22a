use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMillis)
        .unwrap_or_default()
}

/// Concurrent counter with a high-water mark.
#[derive(Clone, Default)]
pub struct Counter(Arc<CounterInner>);

#[derive(Default)]
struct CounterInner {
    curr: AtomicIsize,
    max: AtomicIsize,
}

impl Counter {
    pub fn new() -> Self {
        Counter::default()
    }

    #[inline]
    pub fn inc(&self) {
        let curr = self.0.curr.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max.fetch_max(curr, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.curr.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.0.curr.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.0.max.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ count: {}, max: {} }}", self.count(), self.max())
    }
}
