use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe source of increasing 16-bit tags for correlating broker
/// requests with responses. Tags start at 1 and wrap from 65535 back to 1;
/// zero is reserved for broadcast messages and never emitted. (Hopefully no
/// client will have more than 65535 requests in flight.)
#[derive(Default)]
pub struct MonotoneTags {
    counter: AtomicU64,
}

impl MonotoneTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u16 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n % 65535) as u16 + 1
    }
}
