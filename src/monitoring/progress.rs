//! Execution Progress Channel
//!
//! Push alternative to polling: the orchestrator publishes a fresh
//! [`ExecutionSnapshot`] after every persist and subscribers observe the
//! latest one. Intermediate snapshots may be coalesced; the terminal one
//! is always delivered because it is published before the channel closes.

use tokio::sync::watch;

use crate::execution::state::ExecutionSnapshot;

/// Sending half, owned by an execution's registry entry.
#[derive(Debug)]
pub struct ProgressChannel {
    tx: watch::Sender<ExecutionSnapshot>,
}

impl ProgressChannel {
    pub fn new(initial: ExecutionSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replaces the current snapshot, waking subscribers.
    pub fn publish(&self, snapshot: ExecutionSnapshot) {
        self.tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        ProgressReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half handed to callers.
#[derive(Debug, Clone)]
pub struct ProgressReceiver {
    rx: watch::Receiver<ExecutionSnapshot>,
}

impl ProgressReceiver {
    /// Latest published snapshot.
    pub fn current(&self) -> ExecutionSnapshot {
        self.rx.borrow().clone()
    }

    /// Waits for the next unseen snapshot.
    ///
    /// Returns `None` once the channel has closed and every snapshot has
    /// been seen.
    pub async fn next(&mut self) -> Option<ExecutionSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Waits until the execution reaches a terminal state.
    ///
    /// Returns `None` if the channel closed without a terminal snapshot.
    pub async fn wait_terminal(&mut self) -> Option<ExecutionSnapshot> {
        loop {
            let snapshot = self.rx.borrow_and_update().clone();
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return last.status.is_terminal().then_some(last);
            }
        }
    }
}
