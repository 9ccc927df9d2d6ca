//! Shared types for the provd provisioning agent.

pub mod errors;

pub use errors::{ProvdError, ProvdResult};
