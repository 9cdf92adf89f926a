use std::sync::atomic::{AtomicU64, Ordering};

/// Issues step sequence numbers for one workflow run, starting at 0.
///
/// Never persisted: a resumed run rebuilds the same numbering by issuing the
/// same calls in the same order.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next: AtomicU64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number.
    pub fn reserve(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The number the next `reserve` will return.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
