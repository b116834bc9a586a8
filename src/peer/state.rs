use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Prevents overlapping reconnection attempts.
#[derive(Debug, Clone, Default)]
pub struct ReconnectGuard {
    active: Arc<AtomicBool>,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another attempt holds the guard.
    pub fn try_acquire(&self) -> Option<ReconnectToken> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconnectToken {
                active: Arc::clone(&self.active),
            })
    }

    pub fn is_set(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Clears the guard when dropped, whichever way the attempt ended.
#[derive(Debug)]
pub struct ReconnectToken {
    active: Arc<AtomicBool>,
}

impl Drop for ReconnectToken {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_token_dropped() {
        let guard = ReconnectGuard::new();
        let token = guard.try_acquire().unwrap();
        assert!(guard.is_set());
        assert!(guard.try_acquire().is_none());
        drop(token);
        assert!(!guard.is_set());
        assert!(guard.try_acquire().is_some());
    }
}
