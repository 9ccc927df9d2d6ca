//! Step: fetch image layers into the local blob cache.
//!
//! Lists the bucket, pulls every layer of the requested family whose etag is
//! not already cached complete, records blob rows and image linkage, and
//! updates the image's completion flag. Re-running against an unchanged
//! listing downloads nothing and yields the same image row.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use provd_shared::errors::{ProvdError, ProvdResult};

use crate::objstore::{BucketListing, RemoteObject, compute_file_digest};
use crate::workflow::{Step, StepContext, StepOutput};

use super::{AppContext, LOCK_TIMEOUT, lock_owner};

pub struct FetchStep;

#[async_trait]
impl Step<AppContext> for FetchStep {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn run(&self, ctx: StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
        let image = &ctx.request.image_name;
        tracing::info!(run_id = ctx.run_id, image = %image, "fetching image layers");

        let key = format!("fetch:{}", image);
        let lock = ctx
            .app
            .locks
            .acquire(&key, &lock_owner(), LOCK_TIMEOUT, ctx.cancel)
            .await?;

        let result = fetch_locked(&ctx).await;
        lock.release().await;
        result
    }
}

async fn fetch_locked(ctx: &StepContext<'_, AppContext>) -> ProvdResult<StepOutput> {
    let app = ctx.app;
    let image = &ctx.request.image_name;

    let blobs_dir = app.layout.blobs_dir();
    tokio::fs::create_dir_all(&blobs_dir).await.map_err(|e| {
        ProvdError::Fetch(format!("failed to create {}: {}", blobs_dir.display(), e))
    })?;

    let listing = app.remote.list(ctx.cancel).await?;
    let seen = app.blobs.all_complete_etags(ctx.cancel)?;
    let wanted = select_layers(&listing, image, &seen);
    tracing::info!(
        image = %image,
        total = listing.contents.len(),
        selected = wanted.len(),
        "processed bucket listing"
    );

    // Pull each selected object, skipping the GET when the file is already
    // on disk from an earlier interrupted run.
    let mut pulled: Vec<(PathBuf, String)> = Vec::with_capacity(wanted.len());
    for object in wanted {
        let dest = blobs_dir.join(object.key.replace('/', "_"));
        if !dest.exists() {
            app.remote.fetch_object(&object.key, &dest, ctx.cancel).await?;
        } else {
            tracing::debug!(key = %object.key, "blob file already present, skipping download");
        }
        pulled.push((dest, object.etag.clone()));
    }

    // Hash and record every pulled object. A file that vanished between
    // download and hashing is recorded incomplete under its etag and the
    // step carries on; the image simply stays incomplete.
    let mut linked: Vec<String> = Vec::with_capacity(pulled.len());
    let mut last_digest: Option<String> = None;
    let mut last_path = String::new();
    let mut total_bytes: i64 = 0;

    for (path, etag) in &pulled {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(_) => {
                tracing::warn!(etag = %etag, "blob file missing, recording as incomplete");
                app.blobs.insert_blob(ctx.cancel, etag, etag, 0, "", false)?;
                linked.push(etag.clone());
                continue;
            }
        };

        let digest = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || compute_file_digest(&path))
                .await
                .map_err(|e| ProvdError::Fetch(format!("digest task failed: {}", e)))??
        };

        let path_str = path.display().to_string();
        app.blobs.insert_blob(
            ctx.cancel,
            &digest,
            etag,
            meta.len() as i64,
            &path_str,
            true,
        )?;

        total_bytes += meta.len() as i64;
        linked.push(digest.clone());
        last_digest = Some(digest);
        last_path = path_str;
    }

    // Upsert the image row and link every pulled blob to it. An empty pull
    // still refreshes the row so downstream steps have an image id.
    let image_id = app.images.insert_image(
        ctx.cancel,
        image,
        last_digest.as_deref(),
        total_bytes,
        &last_path,
    )?;

    for digest in &linked {
        app.blobs.insert_image_blob(ctx.cancel, image_id, digest)?;
    }

    let complete = app.blobs.update_image_completion(ctx.cancel, image_id)?;
    tracing::info!(image = %image, image_id, complete, pulled = pulled.len(), "image recorded");

    Ok(StepOutput {
        local_path: blobs_dir.display().to_string(),
        base_dir: app.layout.rootfs_dir().display().to_string(),
        image_id,
        snapshot_ref: 0,
    })
}

/// Layers of `family` that are not yet cached, in listing order.
///
/// Selection is by key prefix `images/<family>/`; dedup is exact-string on
/// the remote etag.
fn select_layers<'a>(
    listing: &'a BucketListing,
    family: &str,
    seen: &HashSet<String>,
) -> Vec<&'a RemoteObject> {
    let prefix = format!("images/{}/", family);
    listing
        .contents
        .iter()
        .filter(|object| object.key.starts_with(&prefix))
        .filter(|object| !seen.contains(&object.etag))
        .collect()
}
