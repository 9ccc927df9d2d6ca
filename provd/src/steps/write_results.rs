//! Step: emit the final run output for external consumers.

use async_trait::async_trait;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::workflow::{Step, StepContext, StepOutput};

use super::AppContext;

pub struct WriteResultsStep;

#[async_trait]
impl Step<AppContext> for WriteResultsStep {
    fn name(&self) -> &'static str {
        "write"
    }

    async fn run(&self, ctx: StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
        let path = ctx.app.layout.results_path();

        // serde_json pretty-prints with 2-space indentation, the format the
        // fleet scheduler consumes.
        let json = serde_json::to_string_pretty(ctx.last)?;
        tokio::fs::write(&path, &json).await.map_err(|e| {
            ProvdError::Internal(format!("failed to write {}: {}", path.display(), e))
        })?;

        tracing::info!(run_id = ctx.run_id, path = %path.display(), "results written");
        Ok(ctx.last.clone())
    }
}
