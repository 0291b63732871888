//! Where a state store's slatedb files live.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::ObjectStore;
use slatedb::{Db, Error as SlateError};
use thiserror::Error;

use crate::settings::{Backend, DatabaseConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] SlateError),
    #[error("can't prepare local root {path}: {source}")]
    LocalRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local object store at {path}: {message}")]
    LocalStore { path: String, message: String },
}

/// An object store and the path slatedb opens inside it.
pub struct DbLocation {
    pub store: Arc<dyn ObjectStore>,
    pub path: String,
}

impl DbLocation {
    pub fn resolve(db: &DatabaseConfig) -> Result<Self, StorageError> {
        match db.backend {
            Backend::Fs => Self::local(Path::new(&db.path)),
            Backend::Memory => Ok(Self {
                store: Arc::new(InMemory::new()),
                path: db.path.clone(),
            }),
            // s3://bucket/prefix, gs://bucket/prefix, ...
            Backend::Url => Ok(Self {
                store: Db::resolve_object_store(&db.path)?,
                path: db.path.clone(),
            }),
        }
    }

    fn local(root: &Path) -> Result<Self, StorageError> {
        let root_err = |source| StorageError::LocalRoot {
            path: root.display().to_string(),
            source,
        };
        fs::create_dir_all(root).map_err(root_err)?;
        // "./db" and "db" must name the same store once slatedb URL-encodes the path
        let root = root.canonicalize().map_err(root_err)?;
        let path = root.to_string_lossy().into_owned();
        let store = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
            StorageError::LocalStore {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            store: Arc::new(store),
            path,
        })
    }
}
