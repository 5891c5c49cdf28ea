//! Cooperative interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A shared flag used to interrupt a blocked waiter.
///
/// Clones share the same underlying flag, so one clone can be handed to the
/// waiting thread and another kept by whoever decides to interrupt it.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create a flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and return the previous value.
    pub fn interrupt(&self) -> bool {
        self.flag.swap(true, Ordering::SeqCst)
    }

    /// Whether the flag is raised.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Lower the flag and return the previous value.
    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// Wait for the flag to be raised, returning true if it was raised
    /// within the timeout.
    pub fn wait_for_interrupt(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while !self.is_interrupted() {
            if start.elapsed() >= timeout {
                return false;
            }

            std::thread::sleep(Duration::from_micros(50));
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interrupt_and_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_interrupted());

        assert!(!flag.interrupt());
        assert!(flag.is_interrupted());
        assert!(flag.interrupt());

        assert!(flag.clear());
        assert!(!flag.is_interrupted());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = InterruptFlag::new();
        let remote = flag.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.interrupt();
        });

        assert!(flag.wait_for_interrupt(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let flag = InterruptFlag::new();
        assert!(!flag.wait_for_interrupt(Duration::from_millis(5)));
    }
}
