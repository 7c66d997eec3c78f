//! The single arbiter of whether in-flight async work is still allowed to act.
//!
//! Every async callback dispatched by a user action captures [`InterruptEpoch::snapshot`] at
//! dispatch time and checks [`InterruptEpoch::is_current`] before every externally-visible
//! effect. [`InterruptEpoch::bump`] is the one atomic primitive that invalidates all of them at
//! once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct InterruptEpoch {
    inner: Arc<AtomicU64>,
}

impl InterruptEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current epoch. Store this alongside any async work dispatched "now".
    pub fn snapshot(&self) -> u64 {
        self.inner.load(Ordering::SeqCst)
    }

    /// True if no [`bump`](Self::bump) happened since `epoch` was captured.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.inner.load(Ordering::SeqCst) == epoch
    }

    /// Invalidate every outstanding callback. Returns the new epoch.
    pub fn bump(&self, reason: &str) -> u64 {
        let new = self.inner.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(reason, new_epoch = new, "interrupt epoch bumped");
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_current_until_bumped() {
        let epoch = InterruptEpoch::new();
        let snap = epoch.snapshot();
        assert!(epoch.is_current(snap));

        epoch.bump("test");
        assert!(!epoch.is_current(snap));
        assert!(epoch.is_current(epoch.snapshot()));
    }

    #[test]
    fn bump_is_monotonic_and_unique_per_call() {
        let epoch = InterruptEpoch::new();
        let a = epoch.bump("a");
        let b = epoch.bump("b");
        assert!(b > a);
    }

    #[test]
    fn concurrent_snapshots_all_invalidated_by_one_bump() {
        let epoch = InterruptEpoch::new();
        let snaps: Vec<_> = (0..8).map(|_| epoch.snapshot()).collect();
        epoch.bump("single bump");
        assert!(snaps.iter().all(|s| !epoch.is_current(*s)));
    }
}
