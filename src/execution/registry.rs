//! Active Execution Registry
//!
//! Tracks which executions currently have a live orchestrator. Each entry
//! carries the execution's cancellation token and its progress channel.
//! An execution can be claimed by at most one orchestrator; the claim is
//! released when the returned [`ExecutionLease`] is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::monitoring::progress::{ProgressChannel, ProgressReceiver};

use super::state::{ExecutionId, ExecutionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("execution {0} already has an active orchestrator")]
    AlreadyActive(ExecutionId),
}

struct Entry {
    cancel: CancellationToken,
    progress: Arc<ProgressChannel>,
}

type Entries = Arc<Mutex<HashMap<ExecutionId, Entry>>>;

/// Process-wide table of in-flight executions.
#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    entries: Entries,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, Entry>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims an execution for exclusive orchestration.
    ///
    /// `initial` seeds the progress channel.
    pub fn claim(
        &self,
        id: ExecutionId,
        initial: ExecutionSnapshot,
    ) -> Result<ExecutionLease, RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(RegistryError::AlreadyActive(id));
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(ProgressChannel::new(initial));

        entries.insert(
            id,
            Entry {
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
        );
        debug!("Claimed execution {}", id);

        Ok(ExecutionLease {
            id,
            cancel,
            progress,
            entries: self.entries.clone(),
        })
    }

    /// Requests cooperative cancellation. Returns false if `id` is not active.
    pub fn cancel(&self, id: ExecutionId) -> bool {
        match self.lock().get(&id) {
            Some(entry) => {
                info!("Cancellation requested for execution {}", id);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: ExecutionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Returns a progress receiver for an active execution.
    pub fn subscribe(&self, id: ExecutionId) -> Option<ProgressReceiver> {
        self.lock().get(&id).map(|entry| entry.progress.subscribe())
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Exclusive claim on one execution, released on drop.
pub struct ExecutionLease {
    id: ExecutionId,
    cancel: CancellationToken,
    progress: Arc<ProgressChannel>,
    entries: Entries,
}

impl ExecutionLease {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Reads the cancellation flag as of now.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publishes the latest snapshot to every subscriber.
    pub fn publish(&self, snapshot: ExecutionSnapshot) {
        self.progress.publish(snapshot);
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&self.id);
        debug!("Released execution {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::{RunStatus, WorkflowExecution};
    use crate::test_support::two_step_workflow;
    use crate::workflow::InitialInput;

    fn snapshot() -> (ExecutionId, ExecutionSnapshot) {
        let execution = WorkflowExecution::new(&two_step_workflow(), InitialInput::new());
        let snapshot = ExecutionSnapshot::project(&execution, &[]);
        (execution.id, snapshot)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = ExecutionRegistry::new();
        let (id, snap) = snapshot();

        let lease = registry.claim(id, snap.clone()).unwrap();
        assert!(registry.is_active(id));
        assert_eq!(
            registry.claim(id, snap.clone()).err(),
            Some(RegistryError::AlreadyActive(id))
        );

        drop(lease);
        assert!(!registry.is_active(id));
        assert!(registry.claim(id, snap).is_ok());
    }

    #[test]
    fn test_cancel_reaches_lease() {
        let registry = ExecutionRegistry::new();
        let (id, snap) = snapshot();
        let lease = registry.claim(id, snap).unwrap();

        assert!(!lease.is_cancelled());
        assert!(registry.cancel(id));
        assert!(lease.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_is_false() {
        let registry = ExecutionRegistry::new();
        assert!(!registry.cancel(uuid::Uuid::new_v4()));
    }

    #[test]
    fn test_subscribers_see_latest_snapshot() {
        let registry = ExecutionRegistry::new();
        let (id, mut snap) = snapshot();
        let lease = registry.claim(id, snap.clone()).unwrap();

        let rx = registry.subscribe(id).unwrap();
        assert_eq!(rx.current().status, RunStatus::Pending);

        snap.status = RunStatus::Running;
        lease.publish(snap);
        assert_eq!(rx.current().status, RunStatus::Running);
        assert_eq!(lease.id(), id);

        drop(lease);
        assert!(registry.subscribe(id).is_none());
        assert_eq!(registry.active_count(), 0);
    }
}
