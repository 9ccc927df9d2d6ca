//! provd provisioning library.
//!
//! This crate implements the per-host provisioning pipeline: it materialises
//! layered image tarballs from a remote object store into a local blob cache,
//! unpacks them into a staging rootfs, registers the tree as a base thin
//! logical volume inside a device-mapper thin pool, and activates mounted
//! copy-on-write snapshots for runtimes to consume.

pub mod layout;
pub mod objstore;
pub mod steps;
pub mod store;
pub mod volumes;
pub mod workflow;

mod cmd;

pub use layout::Layout;
pub use steps::{AppContext, WORKFLOW_KIND, provision_chain};
pub use workflow::{ProvisionRequest, StepOutput, WorkflowRunner};

pub use provd_shared::errors::{ProvdError, ProvdResult};
