//! Device-mapper thin-pool backend.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::cmd::{self, CmdFailure};
use crate::layout::Layout;

use super::{
    BASE_MOUNT_ROOT, POOL_DEVICE, VolumeBackend, base_device, snap_device, thin_pool_table,
    thin_volume_table,
};

/// Production [`VolumeBackend`] over the host's device-mapper.
///
/// The pool (backing files, loop devices, dm target) is a process-wide
/// resource initialised lazily on the first registration and never torn
/// down by the agent.
pub struct DmThinPool {
    layout: Layout,
    pool: OnceCell<()>,
}

impl DmThinPool {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            pool: OnceCell::new(),
        }
    }

    async fn init_pool(&self, cancel: &CancellationToken) -> ProvdResult<()> {
        let meta_file = self.layout.pool_meta_path();
        let data_file = self.layout.pool_data_path();

        // Sparse backing files: 1 MiB of pool metadata, 2 GiB of data.
        if !meta_file.exists() {
            tracing::info!(path = %meta_file.display(), "creating pool metadata backing file");
            run_device(cancel, "fallocate", &["-l", "1M", &path_str(&meta_file)]).await?;
        }
        if !data_file.exists() {
            tracing::info!(path = %data_file.display(), "creating pool data backing file");
            run_device(cancel, "fallocate", &["-l", "2G", &path_str(&data_file)]).await?;
        }

        let meta_loop =
            run_device(cancel, "losetup", &["-f", "--show", &path_str(&meta_file)]).await?;
        let data_loop =
            run_device(cancel, "losetup", &["-f", "--show", &path_str(&data_file)]).await?;
        tracing::info!(%meta_loop, %data_loop, "attached loop devices");

        if !Path::new(POOL_DEVICE).exists() {
            tracing::info!(device = POOL_DEVICE, "creating thin pool");
            let table = thin_pool_table(&meta_loop, &data_loop);
            run_device(cancel, "dmsetup", &["create", "pool", "--table", &table]).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl VolumeBackend for DmThinPool {
    async fn ensure_pool(&self, cancel: &CancellationToken) -> ProvdResult<()> {
        self.pool
            .get_or_try_init(|| self.init_pool(cancel))
            .await?;
        Ok(())
    }

    async fn create_base_volume(
        &self,
        lv_id: i64,
        cancel: &CancellationToken,
    ) -> ProvdResult<String> {
        let message = format!("create_thin {}", lv_id);
        run_device(cancel, "dmsetup", &["message", POOL_DEVICE, "0", &message]).await?;

        let name = format!("base_lv_{}", lv_id);
        let table = thin_volume_table(lv_id);
        run_device(cancel, "dmsetup", &["create", &name, "--table", &table]).await?;

        let device = base_device(lv_id);
        tracing::info!(%device, "formatting base volume");
        run_device(cancel, "mkfs.ext4", &[device.as_str()]).await?;

        Ok(device)
    }

    async fn install_rootfs(
        &self,
        device: &str,
        src: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()> {
        tokio::fs::create_dir_all(BASE_MOUNT_ROOT)
            .await
            .map_err(|e| {
                ProvdError::Device(format!("failed to create {}: {}", BASE_MOUNT_ROOT, e))
            })?;
        run_device(cancel, "mount", &[device, BASE_MOUNT_ROOT]).await?;

        // Copy the tree contents, preserving attributes. The mount must not
        // leak past a failed copy.
        let src_contents = format!("{}/.", src.display());
        let copied = run_device(cancel, "cp", &["-a", &src_contents, BASE_MOUNT_ROOT]).await;
        if let Err(e) = copied {
            if let Err(umount_err) = cmd::run(cancel, "umount", &[BASE_MOUNT_ROOT]).await {
                tracing::warn!("failed to unmount after copy failure: {}", umount_err);
            }
            return Err(e);
        }

        run_device(cancel, "umount", &[BASE_MOUNT_ROOT]).await?;
        Ok(())
    }

    async fn activate_snapshot(
        &self,
        snap_lv_id: i64,
        base_lv_id: i64,
        cancel: &CancellationToken,
    ) -> ProvdResult<String> {
        let message = format!("create_snap {} {}", snap_lv_id, base_lv_id);
        run_device(cancel, "dmsetup", &["message", POOL_DEVICE, "0", &message]).await?;

        let name = format!("snap_lv_{}", snap_lv_id);
        let table = thin_volume_table(snap_lv_id);
        run_device(cancel, "dmsetup", &["create", &name, "--table", &table]).await?;

        Ok(snap_device(snap_lv_id))
    }

    async fn mount_snapshot(
        &self,
        device: &str,
        mount_path: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()> {
        tokio::fs::create_dir_all(mount_path).await.map_err(|e| {
            ProvdError::Device(format!("failed to create {}: {}", mount_path.display(), e))
        })?;
        run_device(cancel, "mount", &[device, &path_str(mount_path)]).await?;
        Ok(())
    }

    async fn unmount(&self, mount_path: &Path) -> ProvdResult<()> {
        // Failure-path cleanup must not be blocked by a cancelled run.
        let fresh = CancellationToken::new();
        run_device(&fresh, "umount", &[&path_str(mount_path)]).await?;
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

async fn run_device(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
) -> ProvdResult<String> {
    cmd::run(cancel, program, args).await.map_err(to_device)
}

fn to_device(failure: CmdFailure) -> ProvdError {
    if failure.is_cancelled() {
        ProvdError::Cancelled
    } else {
        ProvdError::Device(failure.to_string())
    }
}
