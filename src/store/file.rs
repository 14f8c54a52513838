//! File-backed record store.
//!
//! Layout under the store directory:
//!
//! ```text
//! workflows/{percent-encoded workflow_id}.json
//! executions/{execution_id}.json
//! steps/{execution_id}/{step_execution_id}.json
//! ```
//!
//! Records are written to a temporary file and renamed into place, so a
//! reader never sees a half-written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::execution::state::{ExecutionId, StepExecution, WorkflowExecution};
use crate::workflow::WorkflowDefinition;

use super::{PersistenceStore, StoreError};

const WORKFLOWS_DIR: &str = "workflows";
const EXECUTIONS_DIR: &str = "executions";
const STEPS_DIR: &str = "steps";

/// Store persisting each record as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [WORKFLOWS_DIR, EXECUTIONS_DIR, STEPS_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        info!("Using file store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_path(&self, id: &str) -> PathBuf {
        self.root
            .join(WORKFLOWS_DIR)
            .join(format!("{}.json", urlencoding::encode(id)))
    }

    fn execution_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join(EXECUTIONS_DIR).join(format!("{}.json", id))
    }

    fn steps_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.root.join(STEPS_DIR).join(execution_id.to_string())
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;

    debug!("Wrote {}", path.display());
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads every `*.json` record in a directory.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = read_json(&path).await? {
            records.push(record);
        }
    }
    Ok(records)
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn put_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        write_json(&self.workflow_path(&workflow.id), workflow).await
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        read_json(&self.workflow_path(id)).await
    }

    async fn put_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        write_json(&self.execution_path(execution.id), execution).await
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        read_json(&self.execution_path(id)).await
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions: Vec<WorkflowExecution> =
            read_all::<WorkflowExecution>(&self.root.join(EXECUTIONS_DIR))
                .await?
                .into_iter()
                .filter(|e| e.workflow_id == workflow_id)
                .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    async fn put_step(&self, step: &StepExecution) -> Result<(), StoreError> {
        let path = self
            .steps_dir(step.execution_id)
            .join(format!("{}.json", step.id));
        write_json(&path, step).await
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepExecution>, StoreError> {
        let file_name = format!("{}.json", id);
        let mut dirs = fs::read_dir(self.root.join(STEPS_DIR)).await?;

        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let candidate = entry.path().join(&file_name);
            if let Some(step) = read_json(&candidate).await? {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepExecution>, StoreError> {
        let mut steps: Vec<StepExecution> = read_all(&self.steps_dir(execution_id)).await?;
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::{RunStatus, StepStatus};
    use crate::workflow::{InitialInput, SourceRef, StepDefinition};
    use tempfile::tempdir;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "summarize/translate",
            vec![
                StepDefinition::new("a", 0, "{{text}}"),
                StepDefinition::new("b", 1, "{{prev}}").map_input("prev", SourceRef::StepOutput(0)),
            ],
        )
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).await.unwrap();

        assert!(store.root().join("workflows").is_dir());
        assert!(store.root().join("executions").is_dir());
        assert!(store.root().join("steps").is_dir());
    }

    #[tokio::test]
    async fn test_workflow_roundtrip_with_unsafe_id() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.put_workflow(&workflow()).await.unwrap();
        assert!(dir.path().join("workflows/summarize%2Ftranslate.json").exists());

        let loaded = store.get_workflow("summarize/translate").await.unwrap();
        assert_eq!(loaded, Some(workflow()));
        assert!(store.get_workflow("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similar_workflow_ids_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let slashed = WorkflowDefinition::from_steps("team/a", vec![StepDefinition::new("a", 0, "x")]);
        store.put_workflow(&slashed).await.unwrap();
        assert!(store.get_workflow("team_a").await.unwrap().is_none());
        assert!(store.get_workflow("team%2Fa").await.unwrap().is_none());

        let underscored = WorkflowDefinition::from_steps("team_a", vec![StepDefinition::new("b", 0, "y")]);
        store.put_workflow(&underscored).await.unwrap();

        assert_eq!(store.get_workflow("team/a").await.unwrap(), Some(slashed));
        assert_eq!(store.get_workflow("team_a").await.unwrap(), Some(underscored));
    }

    #[tokio::test]
    async fn test_execution_overwrite_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let mut input = InitialInput::new();
        input.insert("text".to_string(), "hello".to_string());
        let mut execution = WorkflowExecution::new(&workflow(), input);
        store.put_execution(&execution).await.unwrap();

        execution.transition(RunStatus::Running).unwrap();
        store.put_execution(&execution).await.unwrap();

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.initial_input["text"], "hello");

        let tmp = dir
            .path()
            .join("executions")
            .join(format!("{}.json.tmp", execution.id));
        assert!(!tmp.exists());

        let listed = store.list_executions("summarize/translate").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_executions("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_steps_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let definition = workflow();
        let execution = WorkflowExecution::new(&definition, InitialInput::new());

        let mut first = StepExecution::new(execution.id, &definition.steps[0]);
        first.transition(StepStatus::Running).unwrap();
        let second = StepExecution::new(execution.id, &definition.steps[1]);

        store.put_step(&second).await.unwrap();
        store.put_step(&first).await.unwrap();

        let steps = store.list_steps(execution.id).await.unwrap();
        assert_eq!(steps.iter().map(|s| s.position).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(steps[0].status, StepStatus::Running);

        assert_eq!(store.get_step(second.id).await.unwrap(), Some(second));
        assert!(store.get_step(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.list_steps(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("executions/{}.json", id)), "{not json").unwrap();

        let err = store.get_execution(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
