//! JSONL checkpoint store.
//!
//! One append-only file per workflow at `{root}/{workflow_id}.jsonl`, one
//! checkpoint object per line. Only complete, parseable lines count: a torn
//! tail (no trailing newline, or not valid JSON) is ignored by readers and
//! truncated before the next append. A failed append is rolled back to the
//! last complete line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use trellis_core::repository::checkpoint::{CheckpointStore, CheckpointStream};
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{Checkpoint, WorkflowState};
use uuid::Uuid;

/// Per-workflow append state, loaded from disk on first append.
#[derive(Debug, Default)]
struct LogState {
    loaded: bool,
    last_seq: u64,
    terminal: bool,
    /// Byte length of the complete lines on disk.
    len: u64,
}

/// Complete checkpoints of a log and the byte length they occupy.
struct ValidPrefix {
    checkpoints: Vec<Checkpoint>,
    len: u64,
}

/// Filesystem-backed [`CheckpointStore`] writing JSON lines.
///
/// Appends for one workflow are serialised by a per-ID `tokio::sync::Mutex`;
/// different IDs never share a lock. Readers take no lock.
#[derive(Debug)]
pub struct JsonlCheckpointStore {
    root: PathBuf,
    logs: DashMap<Uuid, Arc<Mutex<LogState>>>,
}

impl JsonlCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logs: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, workflow_id: &Uuid) -> PathBuf {
        self.root.join(format!("{workflow_id}.jsonl"))
    }

    fn lock_for(&self, workflow_id: Uuid) -> Arc<Mutex<LogState>> {
        Arc::clone(self.logs.entry(workflow_id).or_default().value())
    }

    /// IDs of all workflows with a checkpoint file, sorted.
    pub async fn workflow_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Uuid>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load the append state, truncating a torn tail if there is one.
    async fn load(&self, path: &Path, log: &mut LogState) -> Result<(), RepositoryError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let prefix = valid_prefix(&content);
        if prefix.len < content.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = prefix.len,
                total_bytes = content.len(),
                "truncating torn checkpoint tail"
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(prefix.len).await?;
            file.sync_data().await?;
        }

        let last = prefix.checkpoints.last();
        *log = LogState {
            loaded: true,
            last_seq: last.map(|c| c.sequence_number).unwrap_or(0),
            terminal: last.is_some_and(|c| c.status().is_terminal()),
            len: prefix.len,
        };
        Ok(())
    }
}

/// Parse the leading run of complete, valid lines.
fn valid_prefix(content: &str) -> ValidPrefix {
    let mut checkpoints = Vec::new();
    let mut len = 0u64;
    for line in content.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break;
        }
        match serde_json::from_str::<Checkpoint>(line.trim_end()) {
            Ok(checkpoint) => {
                checkpoints.push(checkpoint);
                len += line.len() as u64;
            }
            Err(_) => break,
        }
    }
    ValidPrefix { checkpoints, len }
}

/// Lazily read complete checkpoints from `path`, stopping at a torn line.
fn read_checkpoints(path: PathBuf) -> impl Stream<Item = Result<Checkpoint, RepositoryError>> + Send {
    async_stream::try_stream! {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => Some(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => Err(RepositoryError::from(e))?,
        };
        if let Some(file) = file {
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            loop {
                line.clear();
                let read = reader.read_line(&mut line).await?;
                if read == 0 || !line.ends_with('\n') {
                    break;
                }
                match serde_json::from_str::<Checkpoint>(line.trim_end()) {
                    Ok(checkpoint) => yield checkpoint,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint tail");
                        break;
                    }
                }
            }
        }
    }
}

impl CheckpointStore for JsonlCheckpointStore {
    async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
        let workflow_id = state.workflow_id;
        let path = self.log_path(&workflow_id);
        let lock = self.lock_for(workflow_id);
        let mut log = lock.lock().await;

        if !log.loaded {
            self.load(&path, &mut log).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let on_disk = file.metadata().await?.len();
        if on_disk != log.len {
            tracing::warn!(
                path = %path.display(),
                expected_bytes = log.len,
                actual_bytes = on_disk,
                "checkpoint log changed since last append, reloading"
            );
            self.load(&path, &mut log).await?;
        }
        if log.terminal {
            return Err(RepositoryError::Conflict(format!(
                "workflow {workflow_id} already has a terminal checkpoint"
            )));
        }

        let checkpoint = Checkpoint {
            sequence_number: log.last_seq + 1,
            timestamp: Utc::now(),
            state: state.clone(),
        };
        let mut line = serde_json::to_string(&checkpoint)?;
        line.push('\n');

        let written: std::io::Result<()> = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            // Drop whatever part of the line reached the file.
            if let Err(truncate) = file.set_len(log.len).await {
                tracing::warn!(path = %path.display(), error = %truncate, "failed to roll back torn append");
            }
            log.loaded = false;
            return Err(e.into());
        }

        log.last_seq = checkpoint.sequence_number;
        log.terminal = state.status.is_terminal();
        log.len += line.len() as u64;
        Ok(checkpoint.sequence_number)
    }

    async fn latest(&self, workflow_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let content = match tokio::fs::read_to_string(self.log_path(workflow_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(valid_prefix(&content).checkpoints.pop())
    }

    fn all(&self, workflow_id: Uuid) -> CheckpointStream<'_> {
        Box::pin(read_checkpoints(self.log_path(&workflow_id)))
    }
}
