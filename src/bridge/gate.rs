use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    held: bool,
    /// Bumped on every acquisition, so a waiter can tell a new holder from the one it waited on.
    epoch: u64,
}

/// Instance-wide exclusion for provisioning sequences.
///
/// Holders are served in FIFO order. Relays that only need provisioning to be
/// finished use [`SerializationGate::barrier`] instead of taking the lock.
pub struct SerializationGate {
    lock: Arc<Mutex<()>>,
    state: Arc<watch::Sender<GateState>>,
}

impl Default for SerializationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializationGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self {
            lock: Arc::new(Mutex::new(())),
            state: Arc::new(state),
        }
    }

    pub async fn acquire(&self) -> GateGuard {
        let permit = self.lock.clone().lock_owned().await;
        self.state.send_modify(|state| {
            state.held = true;
            state.epoch += 1;
        });
        trace!("serialization gate acquired");
        GateGuard {
            state: self.state.clone(),
            _permit: permit,
        }
    }

    /// Waits for the current holder to release, without taking the gate.
    pub async fn barrier(&self) {
        let mut rx = self.state.subscribe();
        let current = *rx.borrow_and_update();
        if !current.held {
            return;
        }
        let _ = rx
            .wait_for(|state| !state.held || state.epoch != current.epoch)
            .await;
    }

    pub fn is_held(&self) -> bool {
        self.state.borrow().held
    }
}

/// Proof that the gate is held. Released on drop.
pub struct GateGuard {
    state: Arc<watch::Sender<GateState>>,
    _permit: OwnedMutexGuard<()>,
}

impl GateGuard {
    pub fn release(self) {}
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.state.send_modify(|state| state.held = false);
        trace!("serialization gate released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::SerializationGate;

    #[tokio::test]
    async fn barrier_returns_immediately_when_unheld() {
        let gate = SerializationGate::new();
        tokio::time::timeout(Duration::from_millis(100), gate.barrier())
            .await
            .expect("barrier should not block");
    }

    #[tokio::test]
    async fn barrier_waits_for_release() {
        let gate = Arc::new(SerializationGate::new());
        let guard = gate.acquire().await;
        assert!(gate.is_held());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.barrier().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        guard.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier released")
            .expect("join");
        assert!(!gate.is_held());
    }

    #[tokio::test]
    async fn guard_is_released_on_error_paths() {
        let gate = SerializationGate::new();

        async fn failing(gate: &SerializationGate) -> anyhow::Result<()> {
            let _guard = gate.acquire().await;
            anyhow::bail!("provisioning failed")
        }

        assert!(failing(&gate).await.is_err());
        assert!(!gate.is_held());
        tokio::time::timeout(Duration::from_millis(100), gate.acquire())
            .await
            .expect("gate is free again");
    }

    #[tokio::test]
    async fn holders_never_overlap_and_run_in_order() {
        let gate = Arc::new(SerializationGate::new());
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = gate.acquire().await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let gate = gate.clone();
            let active = active.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let guard = gate.acquire().await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                guard.release();
            }));
            // let each task enqueue before the next one is spawned
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first.release();

        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
