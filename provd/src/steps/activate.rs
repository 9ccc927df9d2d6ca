//! Step: activate a copy-on-write snapshot of the base volume.
//!
//! Each activation clones a fresh snapshot LV from the image's base LV,
//! maps and mounts it under `/mnt/images/<snap_lv_id>`, and records the
//! activation row. Activating the same image repeatedly yields distinct
//! snapshot ids and mount paths.

use std::path::PathBuf;

use async_trait::async_trait;
use rand::Rng;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::volumes::SNAP_MOUNT_ROOT;
use crate::workflow::{Step, StepContext, StepOutput};

use super::register::LV_ID_RANGE;
use super::{AppContext, LOCK_TIMEOUT, lock_owner};

pub struct ActivateStep;

#[async_trait]
impl Step<AppContext> for ActivateStep {
    fn name(&self) -> &'static str {
        "activate"
    }

    async fn run(&self, ctx: StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
        let image = &ctx.request.image_name;
        tracing::info!(run_id = ctx.run_id, image = %image, image_id = ctx.last.image_id, "activating snapshot");

        let key = format!("activate:{}", image);
        let lock = ctx
            .app
            .locks
            .acquire(&key, &lock_owner(), LOCK_TIMEOUT, ctx.cancel)
            .await?;

        let result = activate_locked(&ctx).await;
        lock.release().await;
        result
    }
}

async fn activate_locked(ctx: &StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
    let app = ctx.app;
    let image_id = ctx.last.image_id;

    let image = app
        .images
        .get_image_by_id(ctx.cancel, image_id)?
        .ok_or_else(|| ProvdError::Precondition(format!("image {} not found", image_id)))?;
    let base_lv_id = image.base_lv_id.ok_or_else(|| {
        ProvdError::Precondition(format!(
            "image {} has no base volume, registration must run first",
            image_id
        ))
    })?;

    let snap_lv_id = allocate_snap_lv_id(ctx)?;
    tracing::info!(image_id, base_lv_id, snap_lv_id, "allocated snapshot LV id");

    let device = app
        .volumes
        .activate_snapshot(snap_lv_id, base_lv_id, ctx.cancel)
        .await?;

    let mount_path = PathBuf::from(SNAP_MOUNT_ROOT).join(snap_lv_id.to_string());
    app.volumes
        .mount_snapshot(&device, &mount_path, ctx.cancel)
        .await?;

    let mount_str = mount_path.display().to_string();
    let activation_id = match app
        .activations
        .insert_activation(ctx.cancel, image_id, snap_lv_id, &mount_str)
    {
        Ok(id) => id,
        Err(e) => {
            // The snapshot row is the source of truth; without it the mount
            // must not outlive the step.
            if let Err(umount_err) = app.volumes.unmount(&mount_path).await {
                tracing::warn!("failed to unmount after insert failure: {}", umount_err);
            }
            return Err(e);
        }
    };

    tracing::info!(
        image_id,
        snap_lv_id,
        activation_id,
        %device,
        mount = %mount_str,
        "snapshot activated"
    );

    Ok(StepOutput {
        local_path: device,
        base_dir: mount_str,
        image_id,
        snapshot_ref: activation_id,
    })
}

/// Sample-and-check allocation of a snapshot LV id no activation owns yet.
fn allocate_snap_lv_id(ctx: &StepContext<'_, AppContext>) -> ProvdResult<i64> {
    loop {
        let candidate = rand::rng().random_range(LV_ID_RANGE);
        if ctx
            .app
            .activations
            .get_activation_by_snap_lv_id(ctx.cancel, candidate)?
            .is_none()
        {
            return Ok(candidate);
        }
        tracing::debug!(candidate, "snapshot LV id collision, retrying");
    }
}
