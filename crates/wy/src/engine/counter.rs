use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime source of request ids for the success route.
///
/// Ids start at 1 and are handed out exactly once each, no matter how many
/// workers call [`RequestCounter::next_id`] at the same time.
#[derive(Debug, Default)]
pub struct RequestCounter {
    issued: AtomicU64,
}

impl RequestCounter {
    pub const fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}
