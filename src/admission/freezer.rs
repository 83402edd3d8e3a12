// src/admission/freezer.rs
// =============================================================================
// The freeze gate.
//
// While frozen, wait() parks the caller on a one-shot channel registered
// under the lock. unfreeze() flips the flag and drains every registered
// waiter in the same critical section, so each waiter is woken exactly once
// per freeze cycle. A woken waiter re-checks the flag: if someone froze the
// gate again before it got to run, it registers a fresh waiter and sleeps.
// =============================================================================

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct State {
    frozen: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
pub struct Freezer {
    state: Mutex<State>,
}

impl Freezer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the gate was already frozen.
    pub fn freeze(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.frozen, true)
    }

    /// Opens the gate and wakes every waiter. Returns false if it was already open.
    pub fn unfreeze(&self) -> bool {
        let mut state = self.state.lock();
        if !state.frozen {
            return false;
        }
        state.frozen = false;
        for waiter in state.waiters.drain(..) {
            // The receiver may be gone if its task was cancelled.
            let _ = waiter.send(());
        }
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    /// Returns once the gate is open.
    pub async fn wait(&self) {
        loop {
            let woken = {
                let mut state = self.state.lock();
                if !state.frozen {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };
            let _ = woken.await;
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_waiter(freezer: &Arc<Freezer>) -> tokio::task::JoinHandle<()> {
        let freezer = Arc::clone(freezer);
        tokio::spawn(async move { freezer.wait().await })
    }

    #[tokio::test]
    async fn test_open_gate_does_not_block() {
        let freezer = Freezer::new();
        assert!(!freezer.is_frozen());
        freezer.wait().await;
    }

    #[tokio::test]
    async fn test_freeze_and_unfreeze_report_transitions() {
        let freezer = Freezer::new();
        assert!(freezer.freeze());
        assert!(!freezer.freeze());
        assert!(freezer.unfreeze());
        assert!(!freezer.unfreeze());
    }

    #[tokio::test]
    async fn test_unfreeze_releases_all_waiters() {
        let freezer = Arc::new(Freezer::new());
        freezer.freeze();

        let waiters: Vec<_> = (0..5).map(|_| spawn_waiter(&freezer)).collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(freezer.waiting(), 5);
        assert!(waiters.iter().all(|w| !w.is_finished()));

        freezer.unfreeze();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(freezer.waiting(), 0);
    }

    #[tokio::test]
    async fn test_refrozen_before_wakeup_waits_again() {
        let freezer = Arc::new(Freezer::new());
        freezer.freeze();
        let waiter = spawn_waiter(&freezer);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Single-threaded runtime: the waiter cannot run between these two calls.
        freezer.unfreeze();
        freezer.freeze();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(freezer.waiting(), 1);

        freezer.unfreeze();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
