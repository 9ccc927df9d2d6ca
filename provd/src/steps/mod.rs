//! The provisioning pipeline steps.
//!
//! Five steps run in a fixed order over a shared [`AppContext`]:
//!
//! ```text
//! fetch → unpack → register → activate → write
//! ```
//!
//! Fetch, register and activate serialise per image family through the
//! advisory lock manager; unpack and write need no lock. Each step is
//! idempotent against re-execution after a resume.

mod activate;
mod fetch;
mod register;
mod unpack;
mod write_results;

pub use activate::ActivateStep;
pub use fetch::FetchStep;
pub use register::RegisterStep;
pub use unpack::UnpackStep;
pub use write_results::WriteResultsStep;

use std::sync::Arc;
use std::time::Duration;

use crate::layout::Layout;
use crate::objstore::ObjectStore;
use crate::store::{ActivationStore, BlobStore, Database, ImageStore, LockStore};
use crate::volumes::VolumeBackend;
use crate::workflow::Step;

/// Workflow kind the provisioning chain registers under.
pub const WORKFLOW_KIND: &str = "provision";

/// How long a step waits for its per-image advisory lock.
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared dependencies for the pipeline steps.
pub struct AppContext {
    pub blobs: BlobStore,
    pub images: ImageStore,
    pub activations: ActivationStore,
    pub locks: LockStore,
    pub remote: Arc<dyn ObjectStore>,
    pub volumes: Arc<dyn VolumeBackend>,
    pub layout: Layout,
}

impl AppContext {
    pub fn new(
        db: Database,
        remote: Arc<dyn ObjectStore>,
        volumes: Arc<dyn VolumeBackend>,
        layout: Layout,
    ) -> Self {
        Self {
            blobs: BlobStore::new(db.clone()),
            images: ImageStore::new(db.clone()),
            activations: ActivationStore::new(db.clone()),
            locks: LockStore::new(db),
            remote,
            volumes,
            layout,
        }
    }
}

/// The provisioning chain, in execution order.
pub fn provision_chain() -> Vec<Arc<dyn Step<AppContext>>> {
    vec![
        Arc::new(FetchStep),
        Arc::new(UnpackStep),
        Arc::new(RegisterStep),
        Arc::new(ActivateStep),
        Arc::new(WriteResultsStep),
    ]
}

/// Owner token for advisory locks held by this process.
pub(crate) fn lock_owner() -> String {
    format!("pid-{}", std::process::id())
}
