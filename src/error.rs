//! Typed errors for graph operations and persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by knowledge graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Entity name cannot be empty")]
    EmptyName,

    #[error("Entity with name \"{0}\" already exists")]
    DuplicateEntity(String),

    #[error("Entities not found: [{}]", quote_names(.0))]
    EntitiesNotFound(Vec<String>),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the persistence backend. Read and write failures are kept
/// apart, and malformed content is distinguishable from plain I/O.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to load graph: malformed JSON in {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to load graph: {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save graph: permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Failed to save graph: no space left on device: {}", .path.display())]
    StorageFull { path: PathBuf },

    #[error("Failed to save graph: {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn quote_names(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
