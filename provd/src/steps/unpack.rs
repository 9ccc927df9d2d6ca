//! Step: unpack layer tarballs into the staging rootfs.
//!
//! Layers are numbered `images_<family>_<i>.tar` with `i` in 1..=5 and are
//! extracted in strictly ascending order so higher-numbered layers overwrite
//! lower-numbered ones. Missing layers are silently skipped.

use std::path::Path;

use async_trait::async_trait;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::cmd;
use crate::workflow::{Step, StepContext, StepOutput};

use super::AppContext;

/// Highest layer index an image family may carry.
const MAX_LAYERS: u32 = 5;

pub struct UnpackStep;

#[async_trait]
impl Step<AppContext> for UnpackStep {
    fn name(&self) -> &'static str {
        "unpack"
    }

    async fn run(&self, ctx: StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
        let src_dir = Path::new(&ctx.last.local_path);
        let dest_dir = Path::new(&ctx.last.base_dir);
        let image = &ctx.request.image_name;

        tracing::info!(
            run_id = ctx.run_id,
            image = %image,
            src = %src_dir.display(),
            dest = %dest_dir.display(),
            "unpacking layers"
        );

        tokio::fs::create_dir_all(dest_dir).await.map_err(|e| {
            ProvdError::Unpack(format!("failed to create {}: {}", dest_dir.display(), e))
        })?;

        for i in 1..=MAX_LAYERS {
            let tar_path = src_dir.join(format!("images_{}_{}.tar", image, i));
            if !tar_path.exists() {
                tracing::debug!(layer = i, path = %tar_path.display(), "layer not found, skipping");
                continue;
            }

            tracing::info!(layer = i, path = %tar_path.display(), "extracting layer");
            extract_tar(&ctx, &tar_path, dest_dir).await?;
        }

        Ok(StepOutput {
            local_path: ctx.last.local_path.clone(),
            base_dir: ctx.last.base_dir.clone(),
            image_id: ctx.last.image_id,
            snapshot_ref: ctx.last.snapshot_ref,
        })
    }
}

/// Extract one tarball with the system tar, preserving attributes.
async fn extract_tar(
    ctx: &StepContext<'_, AppContext>,
    tar_path: &Path,
    dest_dir: &Path,
) -> ProvdResult<()> {
    let tar = tar_path.display().to_string();
    let dest = dest_dir.display().to_string();
    cmd::run(ctx.cancel, "tar", &["-xf", &tar, "-C", &dest])
        .await
        .map(|_| ())
        .map_err(|e| {
            if e.is_cancelled() {
                ProvdError::Cancelled
            } else {
                ProvdError::Unpack(e.to_string())
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::objstore::{BucketListing, ObjectStore};
    use crate::store::{DOMAIN_SCHEMA, Database};
    use crate::volumes::VolumeBackend;
    use crate::workflow::ProvisionRequest;
    use std::fs::File;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct NoRemote;

    #[async_trait]
    impl ObjectStore for NoRemote {
        async fn list(&self, _cancel: &CancellationToken) -> ProvdResult<BucketListing> {
            unreachable!("unpack must not touch the object store")
        }

        async fn fetch_object(
            &self,
            _key: &str,
            _dest: &Path,
            _cancel: &CancellationToken,
        ) -> ProvdResult<()> {
            unreachable!("unpack must not touch the object store")
        }
    }

    struct NoVolumes;

    #[async_trait]
    impl VolumeBackend for NoVolumes {
        async fn ensure_pool(&self, _cancel: &CancellationToken) -> ProvdResult<()> {
            unreachable!("unpack must not touch the volume backend")
        }

        async fn create_base_volume(
            &self,
            _lv_id: i64,
            _cancel: &CancellationToken,
        ) -> ProvdResult<String> {
            unreachable!()
        }

        async fn install_rootfs(
            &self,
            _device: &str,
            _src: &Path,
            _cancel: &CancellationToken,
        ) -> ProvdResult<()> {
            unreachable!()
        }

        async fn activate_snapshot(
            &self,
            _snap_lv_id: i64,
            _base_lv_id: i64,
            _cancel: &CancellationToken,
        ) -> ProvdResult<String> {
            unreachable!()
        }

        async fn mount_snapshot(
            &self,
            _device: &str,
            _mount_path: &Path,
            _cancel: &CancellationToken,
        ) -> ProvdResult<()> {
            unreachable!()
        }

        async fn unmount(&self, _mount_path: &Path) -> ProvdResult<()> {
            unreachable!()
        }
    }

    fn test_app(layout: Layout) -> AppContext {
        let db = Database::open_in_memory(DOMAIN_SCHEMA).unwrap();
        AppContext::new(db, Arc::new(NoRemote), Arc::new(NoVolumes), layout)
    }

    /// Write `files` as `(path, contents)` pairs into a tarball.
    fn build_layer(tar_path: &Path, files: &[(&str, &str)]) {
        let file = File::create(tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, contents) in files {
            let bytes = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, bytes).unwrap();
        }
        builder.finish().unwrap();
    }

    #[tokio::test]
    async fn extracts_layers_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let blobs = layout.blobs_dir();
        std::fs::create_dir_all(&blobs).unwrap();

        // Layer 1 and layer 2 both carry etc/version; layer 2 must win.
        build_layer(
            &blobs.join("images_golang_1.tar"),
            &[("etc/version", "one"), ("bin/go", "binary")],
        );
        build_layer(
            &blobs.join("images_golang_2.tar"),
            &[("etc/version", "two"), ("usr/lib/extra", "lib")],
        );

        let app = test_app(layout.clone());
        let cancel = CancellationToken::new();
        let request = ProvisionRequest {
            image_name: "golang".into(),
            bucket_name: "bucket".into(),
        };
        let last = StepOutput {
            local_path: blobs.display().to_string(),
            base_dir: layout.rootfs_dir().display().to_string(),
            image_id: 1,
            snapshot_ref: 0,
        };

        let output = UnpackStep
            .run(StepContext {
                run_id: "run-1",
                request: &request,
                last: &last,
                app: &app,
                cancel: &cancel,
            })
            .await
            .unwrap();

        assert_eq!(output.image_id, 1);
        assert_eq!(output.base_dir, last.base_dir);

        let rootfs = layout.rootfs_dir();
        assert_eq!(
            std::fs::read_to_string(rootfs.join("etc/version")).unwrap(),
            "two"
        );
        assert!(rootfs.join("bin/go").exists());
        assert!(rootfs.join("usr/lib/extra").exists());
    }

    #[tokio::test]
    async fn missing_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let blobs = layout.blobs_dir();
        std::fs::create_dir_all(&blobs).unwrap();

        // Only layer 3 exists.
        build_layer(&blobs.join("images_golang_3.tar"), &[("etc/os", "three")]);

        let app = test_app(layout.clone());
        let cancel = CancellationToken::new();
        let request = ProvisionRequest {
            image_name: "golang".into(),
            bucket_name: "bucket".into(),
        };
        let last = StepOutput {
            local_path: blobs.display().to_string(),
            base_dir: layout.rootfs_dir().display().to_string(),
            image_id: 1,
            snapshot_ref: 0,
        };

        UnpackStep
            .run(StepContext {
                run_id: "run-1",
                request: &request,
                last: &last,
                app: &app,
                cancel: &cancel,
            })
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(layout.rootfs_dir().join("etc/os")).unwrap(),
            "three"
        );
    }

    #[tokio::test]
    async fn corrupt_tarball_aborts_with_unpack_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let blobs = layout.blobs_dir();
        std::fs::create_dir_all(&blobs).unwrap();

        std::fs::write(blobs.join("images_golang_1.tar"), b"not a tarball").unwrap();

        let app = test_app(layout.clone());
        let cancel = CancellationToken::new();
        let request = ProvisionRequest {
            image_name: "golang".into(),
            bucket_name: "bucket".into(),
        };
        let last = StepOutput {
            local_path: blobs.display().to_string(),
            base_dir: layout.rootfs_dir().display().to_string(),
            image_id: 1,
            snapshot_ref: 0,
        };

        let err = UnpackStep
            .run(StepContext {
                run_id: "run-1",
                request: &request,
                last: &last,
                app: &app,
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::Unpack(_)));
    }
}
