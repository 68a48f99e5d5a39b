//! Process-wide count of generation runs currently being watched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// The watched value is the count itself; every update goes through
/// `send_modify` so readers never see a value older than a finished update.
#[derive(Debug)]
struct Inner {
    count: watch::Sender<usize>,
    idle_transitions: AtomicU64,
}

/// Cloneable handle; every clone shares the same counter.
#[derive(Debug, Clone)]
pub struct ActiveGenerations {
    inner: Arc<Inner>,
}

impl ActiveGenerations {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                count,
                idle_transitions: AtomicU64::new(0),
            }),
        }
    }

    /// Increment the counter; it is decremented exactly once when the guard
    /// is dropped.
    pub fn acquire(&self) -> ActiveGenerationGuard {
        self.inner.count.send_modify(|count| *count += 1);
        ActiveGenerationGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// How many times the counter has dropped back to zero.
    pub fn idle_transitions(&self) -> u64 {
        self.inner.idle_transitions.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }
}

impl Default for ActiveGenerations {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ActiveGenerationGuard {
    inner: Arc<Inner>,
}

impl Drop for ActiveGenerationGuard {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.count.send_modify(|count| {
            if *count == 1 {
                inner.idle_transitions.fetch_add(1, Ordering::SeqCst);
            }
            *count = count.saturating_sub(1);
        });
    }
}
