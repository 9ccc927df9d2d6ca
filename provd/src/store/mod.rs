//! Embedded metadata store.
//!
//! A thin wrapper over a single rusqlite connection shared behind a mutex.
//! The connection is opened against a file under the working-directory
//! layout; the schema script runs only when the file is first created.
//!
//! Every operation takes a cancellation token and fails fast with
//! [`ProvdError::Cancelled`] once the owning run has been cancelled, so a
//! shutting-down step never starts new writes.

mod activations;
mod blobs;
mod images;
pub mod locks;

pub use activations::{Activation, ActivationStore};
pub use blobs::{Blob, BlobStore};
pub use images::{Image, ImageStore};
pub use locks::{HeldLock, LockStore};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

/// Schema script executed when the domain store file is first created.
pub const DOMAIN_SCHEMA: &str = include_str!("schema.sql");

/// Shared handle to an embedded sqlite database.
///
/// Cheaply cloneable; all clones serialise through the same connection.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at `path`, creating it from `schema` if absent.
    ///
    /// The parent directory is created first. An existing file is opened
    /// as-is; the schema script is not re-executed.
    pub fn open(path: &Path, schema: &str) -> ProvdResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProvdError::Store(format!(
                    "failed to create db directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let fresh = !path.exists();
        let conn = Connection::open(path)?;
        if fresh {
            conn.execute_batch(schema)?;
            tracing::info!(path = %path.display(), "created metadata store");
        } else {
            tracing::info!(path = %path.display(), "opened existing metadata store");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory(schema: &str) -> ProvdResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

/// Bail out with [`ProvdError::Cancelled`] once the token has fired.
pub(crate) fn ensure_live(cancel: &CancellationToken) -> ProvdResult<()> {
    if cancel.is_cancelled() {
        return Err(ProvdError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    Database::open_in_memory(DOMAIN_SCHEMA).expect("open in-memory store")
}
