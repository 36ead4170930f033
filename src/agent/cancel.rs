use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    token: Option<CancellationToken>,
}

type Shared = Arc<Mutex<Slot>>;

fn lock(inner: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the cancellation token of the turn in flight, if any.
#[derive(Debug, Clone, Default)]
pub struct AbortSlot {
    inner: Shared,
}

impl AbortSlot {
    /// Installs a fresh token for a new turn. The slot is cleared when the
    /// returned guard is dropped.
    pub fn arm(&self) -> TurnGuard {
        let token = CancellationToken::new();
        let mut slot = lock(&self.inner);
        slot.generation += 1;
        slot.token = Some(token.clone());
        TurnGuard {
            inner: self.inner.clone(),
            generation: slot.generation,
            token,
        }
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.inner).token.is_some()
    }

    pub fn handle(&self) -> AbortHandle {
        AbortHandle {
            inner: self.inner.clone(),
        }
    }
}

/// Keeps the slot armed for the lifetime of one turn.
#[derive(Debug)]
pub struct TurnGuard {
    inner: Shared,
    generation: u64,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.inner);
        // A newer turn may already own the slot.
        if slot.generation == self.generation {
            slot.token = None;
        }
    }
}

/// Cancels whatever turn is currently in flight on the owning engine.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    inner: Shared,
}

impl AbortHandle {
    /// Returns `true` when a turn was in flight.
    pub fn abort(&self) -> bool {
        match lock(&self.inner).token.as_ref() {
            Some(token) => {
                debug!("aborting in-flight turn");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_without_turn_is_noop() {
        let slot = AbortSlot::default();
        assert!(!slot.handle().abort());
    }

    #[test]
    fn abort_cancels_armed_token_and_guard_clears() {
        let slot = AbortSlot::default();
        let handle = slot.handle();
        let guard = slot.arm();
        let token = guard.token();
        assert!(slot.is_armed());
        assert!(handle.abort());
        assert!(token.is_cancelled());
        drop(guard);
        assert!(!slot.is_armed());
        assert!(!handle.abort());
    }

    #[test]
    fn each_turn_gets_a_fresh_token() {
        let slot = AbortSlot::default();
        let first = slot.arm();
        slot.handle().abort();
        assert!(first.token().is_cancelled());
        drop(first);

        let second = slot.arm();
        assert!(!second.token().is_cancelled());
    }

    #[test]
    fn stale_guard_does_not_clear_newer_turn() {
        let slot = AbortSlot::default();
        let old = slot.arm();
        let new = slot.arm();
        drop(old);
        assert!(slot.is_armed());
        drop(new);
        assert!(!slot.is_armed());
    }
}
