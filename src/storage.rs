//! Durable storage for the knowledge graph.
//!
//! The whole graph lives in one pretty-printed JSON file. Writes go through
//! a temp file and rename so a crashed save never leaves a half-written
//! graph behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::StorageError;
use crate::graph::KnowledgeGraph;

const STORAGE_DIR: &str = ".kiro";
const STORAGE_FILE: &str = "knowledge-graph.json";

/// Load/save port consumed by the manager. Injected so tests can run
/// against an in-memory fake.
#[async_trait]
pub trait GraphStorage: Send + Sync {
    /// Load the persisted graph. A missing backing file yields an empty
    /// graph; malformed content fails distinguishably from other I/O.
    async fn load(&self) -> Result<KnowledgeGraph, StorageError>;

    /// Persist the full graph, creating missing parent directories.
    async fn save(&self, graph: &KnowledgeGraph) -> Result<(), StorageError>;
}

/// JSON-file-backed storage.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Store under `<project>/.kiro/knowledge-graph.json`, falling back to
    /// the home directory when no project directory is given.
    pub fn new(project_dir: Option<&Path>) -> Self {
        let base = match project_dir {
            Some(dir) => dir.to_path_buf(),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        };
        Self {
            path: base.join(STORAGE_DIR).join(STORAGE_FILE),
        }
    }

    /// Store at an explicit file path.
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, err: std::io::Error) -> StorageError {
        match err.kind() {
            ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path: self.path.clone(),
            },
            ErrorKind::StorageFull => StorageError::StorageFull {
                path: self.path.clone(),
            },
            _ => StorageError::Write {
                path: self.path.clone(),
                source: err,
            },
        }
    }
}

#[async_trait]
impl GraphStorage for JsonFileStorage {
    async fn load(&self) -> Result<KnowledgeGraph, StorageError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(KnowledgeGraph::default());
            }
            Err(err) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source: err,
                });
            }
        };

        serde_json::from_slice(&data).map_err(|err| StorageError::Malformed {
            path: self.path.clone(),
            source: err,
        })
    }

    async fn save(&self, graph: &KnowledgeGraph) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(graph)
            .map_err(|err| self.write_error(err.into()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.write_error(err))?;
        }

        let tmp = self.path.with_extension("tmp_graph_write");
        fs::write(&tmp, &data)
            .await
            .map_err(|err| self.write_error(err))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| self.write_error(err))?;
        Ok(())
    }
}
