use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source.
///
/// One allocator is created per scenario run; nothing is process-global.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id, starting from 1.
    pub fn alloc(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently allocated id (0 when nothing was allocated).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Ensures every later allocation is strictly above `floor`.
    pub fn reset_above(&self, floor: u64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_monotonic_and_resettable() {
        let ids = IdAllocator::new();
        assert_eq!(ids.alloc(), 1);
        assert_eq!(ids.alloc(), 2);
        ids.reset_above(10);
        assert_eq!(ids.alloc(), 11);
        // Lower floors never move the allocator backwards.
        ids.reset_above(3);
        assert_eq!(ids.alloc(), 12);
        assert_eq!(ids.current(), 12);
    }
}
