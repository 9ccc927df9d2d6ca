//! Workflow contract types.
//!
//! Steps share a single polymorphic signature: a capability record
//! ([`StepContext`]) carrying the run id, the immutable request, the
//! previous step's output, the shared application context, and the run's
//! cancellation token. The runner serialises [`StepOutput`] between steps
//! and persists it per `(run_id, step)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use provd_shared::errors::ProvdResult;

/// Request that starts a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(rename = "ImageName")]
    pub image_name: String,
    #[serde(rename = "BucketName")]
    pub bucket_name: String,
}

/// Output threaded from step to step and handed to external consumers.
///
/// Field names are a wire contract shared with the fleet scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(rename = "LocalPath")]
    pub local_path: String,
    #[serde(rename = "BaseDir")]
    pub base_dir: String,
    #[serde(rename = "ImageID")]
    pub image_id: i64,
    #[serde(rename = "SnapshotRef")]
    pub snapshot_ref: i64,
}

/// Everything a step is allowed to touch.
pub struct StepContext<'a, A> {
    pub run_id: &'a str,
    pub request: &'a ProvisionRequest,
    /// Output of the previous step; default for the first step.
    pub last: &'a StepOutput,
    pub app: &'a A,
    pub cancel: &'a CancellationToken,
}

/// One named step in a workflow chain.
#[async_trait]
pub trait Step<A: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: StepContext<'_, A>) -> ProvdResult<StepOutput>;
}

/// Lifecycle state of a run.
///
/// `Done` and `Failed` are terminal; `Pending` and `Running` are in-flight
/// and replayed by `resume()` after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_output_serialises_with_wire_field_names() {
        let output = StepOutput {
            local_path: "/dev/mapper/snap_lv_7".into(),
            base_dir: "/mnt/images/7".into(),
            image_id: 3,
            snapshot_ref: 11,
        };

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["LocalPath"], "/dev/mapper/snap_lv_7");
        assert_eq!(json["BaseDir"], "/mnt/images/7");
        assert_eq!(json["ImageID"], 3);
        assert_eq!(json["SnapshotRef"], 11);
    }

    #[test]
    fn request_roundtrips() {
        let request = ProvisionRequest {
            image_name: "golang".into(),
            bucket_name: "some-bucket".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"ImageName\""));
        assert_eq!(
            serde_json::from_str::<ProvisionRequest>(&json).unwrap(),
            request
        );
    }

    #[test]
    fn status_roundtrips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Done,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
        assert!(RunStatus::Done.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
