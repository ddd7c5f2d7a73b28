use std::sync::atomic::{AtomicUsize, Ordering};

/// Sessions currently between accept and close, across all listeners
static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Active session count above which the monitor warns
pub const HIGH_LOAD_THRESHOLD: usize = 10_000;

/// RAII guard that keeps a session counted while it is alive
pub struct SessionGuard {
    released: bool,
}

impl SessionGuard {
    pub fn new() -> Self {
        ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed);
        Self { released: false }
    }

    /// Stop counting this session before the guard is dropped
    pub fn release(&mut self) {
        if !self.released {
            ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
            self.released = true;
        }
    }

    pub fn active_count() -> usize {
        ACTIVE_SESSIONS.load(Ordering::Relaxed)
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
