//! Step: register the unpacked rootfs as a base thin volume.
//!
//! On first execution this initialises the thin pool, allocates a unique
//! base LV id, creates and formats the volume, copies the rootfs in, and
//! persists the id. Re-entry short-circuits on the persisted id, which is
//! what makes the step idempotent across retries and concurrent workers.
//! dm state created by a failure after allocation is left for operator
//! cleanup.

use std::path::Path;

use async_trait::async_trait;
use rand::Rng;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::volumes::{BASE_MOUNT_ROOT, base_device};
use crate::workflow::{Step, StepContext, StepOutput};

use super::{AppContext, LOCK_TIMEOUT, lock_owner};

/// LV ids are sampled uniformly from [1, 10^6], the 20-bit dm identifier
/// convention.
pub(crate) const LV_ID_RANGE: std::ops::RangeInclusive<i64> = 1..=1_000_000;

pub struct RegisterStep;

#[async_trait]
impl Step<AppContext> for RegisterStep {
    fn name(&self) -> &'static str {
        "register"
    }

    async fn run(&self, ctx: StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
        let image = &ctx.request.image_name;
        tracing::info!(run_id = ctx.run_id, image = %image, image_id = ctx.last.image_id, "registering base volume");

        let key = format!("register:{}", image);
        let lock = ctx
            .app
            .locks
            .acquire(&key, &lock_owner(), LOCK_TIMEOUT, ctx.cancel)
            .await?;

        let result = register_locked(&ctx).await;
        lock.release().await;
        result
    }
}

async fn register_locked(ctx: &StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
    let app = ctx.app;
    let image_id = ctx.last.image_id;

    let image = app
        .images
        .get_image_by_id(ctx.cancel, image_id)?
        .ok_or_else(|| ProvdError::Precondition(format!("image {} not found", image_id)))?;

    // Another worker (or an earlier attempt) already registered this image.
    if let Some(base_lv_id) = image.base_lv_id {
        tracing::info!(image_id, base_lv_id, "image already registered, skipping");
        return Ok(StepOutput {
            local_path: base_device(base_lv_id),
            base_dir: BASE_MOUNT_ROOT.to_string(),
            image_id,
            snapshot_ref: 0,
        });
    }

    app.volumes.ensure_pool(ctx.cancel).await?;

    let base_lv_id = allocate_base_lv_id(ctx)?;
    tracing::info!(image_id, base_lv_id, "allocated base LV id");

    let device = app.volumes.create_base_volume(base_lv_id, ctx.cancel).await?;
    app.volumes
        .install_rootfs(&device, Path::new(&ctx.last.base_dir), ctx.cancel)
        .await?;

    app.images
        .update_base_lv_id(ctx.cancel, image_id, base_lv_id)?;
    tracing::info!(image_id, base_lv_id, %device, "base volume registered");

    Ok(StepOutput {
        local_path: device,
        base_dir: BASE_MOUNT_ROOT.to_string(),
        image_id,
        snapshot_ref: 0,
    })
}

/// Sample-and-check allocation of a base LV id no image row owns yet.
fn allocate_base_lv_id(ctx: &StepContext<'_, AppContext>) -> ProvdResult<i64> {
    loop {
        let candidate = rand::rng().random_range(LV_ID_RANGE);
        if ctx
            .app
            .images
            .get_image_by_base_lv_id(ctx.cancel, candidate)?
            .is_none()
        {
            return Ok(candidate);
        }
        tracing::debug!(candidate, "base LV id collision, retrying");
    }
}
