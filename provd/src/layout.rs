//! Working-directory layout for the provisioning agent.
//!
//! All host-local artifacts (blob cache, staging rootfs, thin-pool backing
//! files, metadata store, results file) live under a single root directory.
//! Mount points are deliberately not part of the layout: they are absolute
//! paths fixed by the device-mapper conventions in [`crate::volumes`].

use std::path::{Path, PathBuf};

/// Filesystem layout rooted at the agent's working directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of downloaded objects, one file per remote key.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Staging tree the layer tarballs are unpacked into.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// Domain metadata store (blobs, images, activations, locks).
    pub fn db_path(&self) -> PathBuf {
        self.root.join("db").join("flyd.db")
    }

    /// Workflow-runner persistence (runs and per-step outputs).
    pub fn runs_db_path(&self) -> PathBuf {
        self.root.join("db").join("runs.db")
    }

    /// Thin-pool metadata backing file (1 MiB sparse).
    pub fn pool_meta_path(&self) -> PathBuf {
        self.root.join("pool_meta")
    }

    /// Thin-pool data backing file (2 GiB sparse).
    pub fn pool_data_path(&self) -> PathBuf {
        self.root.join("pool_data")
    }

    /// Final run output handed to external consumers.
    pub fn results_path(&self) -> PathBuf {
        self.root.join("results.json")
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(".")
    }
}
