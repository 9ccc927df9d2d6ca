//! Thin-provisioned volume management.
//!
//! The pipeline's device plumbing sits behind [`VolumeBackend`] so the
//! registration and activation steps can be exercised without root or a
//! device-mapper target; production uses [`DmThinPool`], which shells out to
//! `fallocate`, `losetup`, `dmsetup`, `mkfs.ext4`, `mount`, `umount` and
//! `cp -a`.
//!
//! The dm table strings are a wire contract: a 2 GiB pool (4194304 sectors)
//! at 4 KiB blocks (2048 sectors) with the default 32768-block low-water
//! mark. The builders below are the single source of those strings.

mod thinpool;

pub use thinpool::DmThinPool;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::ProvdResult;

/// Pool device node, fixed by convention.
pub const POOL_DEVICE: &str = "/dev/mapper/pool";

/// Mount point used while installing a rootfs into a base volume.
pub const BASE_MOUNT_ROOT: &str = "/mnt/base_lv";

/// Parent directory of per-snapshot mount points.
pub const SNAP_MOUNT_ROOT: &str = "/mnt/images";

/// Device node of a base thin volume.
pub fn base_device(lv_id: i64) -> String {
    format!("/dev/mapper/base_lv_{}", lv_id)
}

/// Device node of a snapshot thin volume.
pub fn snap_device(snap_lv_id: i64) -> String {
    format!("/dev/mapper/snap_lv_{}", snap_lv_id)
}

/// dm table for the thin pool over the two loop devices.
pub(crate) fn thin_pool_table(meta_loop: &str, data_loop: &str) -> String {
    format!("0 4194304 thin-pool {} {} 2048 32768", meta_loop, data_loop)
}

/// dm table for a thin volume (base or snapshot) inside the pool.
pub(crate) fn thin_volume_table(lv_id: i64) -> String {
    format!("0 4194304 thin {} {}", POOL_DEVICE, lv_id)
}

/// Block-device operations needed by the registration and activation steps.
///
/// None of these roll anything back on failure: partially created dm state
/// is left for operator cleanup, and the steps rely on their own
/// idempotence short-circuits on re-entry.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Ensure the thin pool exists: backing files, loop devices, dm target.
    /// Idempotent and lazily initialised once per process.
    async fn ensure_pool(&self, cancel: &CancellationToken) -> ProvdResult<()>;

    /// Create and format a base thin volume; returns its device node.
    async fn create_base_volume(&self, lv_id: i64, cancel: &CancellationToken)
    -> ProvdResult<String>;

    /// Copy an unpacked rootfs into a formatted base volume.
    ///
    /// Mounts the device, copies preserving attributes, unmounts. If the
    /// copy fails the mount is released before the error propagates.
    async fn install_rootfs(
        &self,
        device: &str,
        src: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()>;

    /// Clone a snapshot from a base volume and map it; returns the snapshot
    /// device node.
    async fn activate_snapshot(
        &self,
        snap_lv_id: i64,
        base_lv_id: i64,
        cancel: &CancellationToken,
    ) -> ProvdResult<String>;

    /// Create the mount point and mount a snapshot device on it.
    async fn mount_snapshot(
        &self,
        device: &str,
        mount_path: &Path,
        cancel: &CancellationToken,
    ) -> ProvdResult<()>;

    /// Unmount a mount point. Used on activation failure paths.
    async fn unmount(&self, mount_path: &Path) -> ProvdResult<()>;
}
