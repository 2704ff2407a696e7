use crate::types::TaskRecord;
use async_trait::async_trait;
use concord_core::{ConcordError, ConcordResult};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Write-through mirror of task records and the pending queue.
///
/// The orchestrator never reads its own state back from a store; failures
/// are logged by the caller and do not affect the task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the record for `id`.
    async fn save_record(&self, id: Uuid, record: &TaskRecord) -> ConcordResult<()>;
    /// Record for `id`, if one was saved.
    async fn load_record(&self, id: Uuid) -> ConcordResult<Option<TaskRecord>>;
    /// Add `id` to the front of the queue mirror.
    async fn push_queue(&self, id: Uuid) -> ConcordResult<()>;
    /// Drop `id` from the queue mirror. Absent ids are ignored.
    async fn remove_queue(&self, id: Uuid) -> ConcordResult<()>;
    /// Queue mirror, most recently pushed first.
    async fn queued_ids(&self) -> ConcordResult<Vec<Uuid>>;
}

/// In-process store, the default when no other store is configured.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<Uuid, TaskRecord>>,
    queue: RwLock<VecDeque<Uuid>>,
}

impl MemoryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task records held.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save_record(&self, id: Uuid, record: &TaskRecord) -> ConcordResult<()> {
        self.records.write().insert(id, record.clone());
        Ok(())
    }

    async fn load_record(&self, id: Uuid) -> ConcordResult<Option<TaskRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn push_queue(&self, id: Uuid) -> ConcordResult<()> {
        self.queue.write().push_front(id);
        Ok(())
    }

    async fn remove_queue(&self, id: Uuid) -> ConcordResult<()> {
        self.queue.write().retain(|queued| *queued != id);
        Ok(())
    }

    async fn queued_ids(&self) -> ConcordResult<Vec<Uuid>> {
        Ok(self.queue.read().iter().copied().collect())
    }
}

/// JSON files on disk: `tasks/<id>.json` per record plus a `queue.json` id list.
pub struct FileTaskStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on queue.json.
    queue_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Store rooted at `dir`, creating `dir/tasks` if needed.
    pub async fn new(dir: PathBuf) -> ConcordResult<Self> {
        tokio::fs::create_dir_all(dir.join("tasks")).await?;
        Ok(Self {
            dir,
            queue_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("tasks").join(format!("{id}.json"))
    }

    fn queue_path(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    async fn read_queue(&self) -> ConcordResult<Vec<Uuid>> {
        let path = self.queue_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&data)
            .map_err(|e| ConcordError::Store(format!("Failed to parse queue: {e}")))
    }

    async fn write_queue(&self, ids: &[Uuid]) -> ConcordResult<()> {
        let json = serde_json::to_string(ids)?;
        tokio::fs::write(self.queue_path(), json).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save_record(&self, id: Uuid, record: &TaskRecord) -> ConcordResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.record_path(id), json).await?;
        Ok(())
    }

    async fn load_record(&self, id: Uuid) -> ConcordResult<Option<TaskRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let record = serde_json::from_str(&data)
            .map_err(|e| ConcordError::Store(format!("Failed to parse task {id}: {e}")))?;
        Ok(Some(record))
    }

    async fn push_queue(&self, id: Uuid) -> ConcordResult<()> {
        let _guard = self.queue_lock.lock().await;
        let mut ids = self.read_queue().await?;
        ids.insert(0, id);
        self.write_queue(&ids).await
    }

    async fn remove_queue(&self, id: Uuid) -> ConcordResult<()> {
        let _guard = self.queue_lock.lock().await;
        let mut ids = self.read_queue().await?;
        ids.retain(|queued| *queued != id);
        self.write_queue(&ids).await
    }

    async fn queued_ids(&self) -> ConcordResult<Vec<Uuid>> {
        let _guard = self.queue_lock.lock().await;
        self.read_queue().await
    }
}
