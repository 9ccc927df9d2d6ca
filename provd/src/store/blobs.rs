//! Blob and image-blob linkage operations.

use std::collections::HashSet;

use rusqlite::{OptionalExtension, params};
use tokio_util::sync::CancellationToken;

use provd_shared::errors::ProvdResult;

use super::{Database, ensure_live};

/// A row in the `blobs` table.
#[derive(Debug, Clone)]
pub struct Blob {
    pub digest: String,
    pub etag: String,
    pub size_bytes: i64,
    pub local_path: String,
    pub complete: bool,
    pub created_at: String,
}

/// Blob operations wrapping [`Database`].
///
/// Blobs are immutable byte sequences identified by content digest; the
/// remote etag is an alternate key, so an upsert by either identity
/// overwrites the other columns.
#[derive(Clone)]
pub struct BlobStore {
    db: Database,
}

impl BlobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a blob record by digest or etag.
    pub fn insert_blob(
        &self,
        cancel: &CancellationToken,
        digest: &str,
        etag: &str,
        size_bytes: i64,
        local_path: &str,
        complete: bool,
    ) -> ProvdResult<()> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        conn.execute(
            r#"
            INSERT INTO blobs (digest, etag, size_bytes, local_path, complete)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(digest) DO UPDATE SET
                etag       = excluded.etag,
                size_bytes = excluded.size_bytes,
                local_path = excluded.local_path,
                complete   = excluded.complete
            ON CONFLICT(etag) DO UPDATE SET
                digest     = excluded.digest,
                size_bytes = excluded.size_bytes,
                local_path = excluded.local_path,
                complete   = excluded.complete
            "#,
            params![digest, etag, size_bytes, local_path, complete],
        )?;
        Ok(())
    }

    /// Look up a blob by its remote etag.
    pub fn get_blob_by_etag(
        &self,
        cancel: &CancellationToken,
        etag: &str,
    ) -> ProvdResult<Option<Blob>> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let blob = conn
            .query_row(
                r#"
                SELECT digest, etag, size_bytes, local_path, complete, created_at
                FROM blobs WHERE etag = ?1
                "#,
                params![etag],
                |row| {
                    Ok(Blob {
                        digest: row.get(0)?,
                        etag: row.get(1)?,
                        size_bytes: row.get(2)?,
                        local_path: row.get(3)?,
                        complete: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    /// Load all etags of complete blobs for dedup during fetch.
    pub fn all_complete_etags(&self, cancel: &CancellationToken) -> ProvdResult<HashSet<String>> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT etag FROM blobs WHERE complete = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut seen = HashSet::new();
        for etag in rows {
            seen.insert(etag?);
        }
        Ok(seen)
    }

    /// Link a blob to an image. Duplicate links are silently ignored.
    pub fn insert_image_blob(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
        blob_digest: &str,
    ) -> ProvdResult<()> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO image_blobs (image_id, blob_digest) VALUES (?1, ?2)",
            params![image_id, blob_digest],
        )?;
        Ok(())
    }

    /// Count linked blobs of an image that are not yet complete.
    pub fn count_missing_blobs(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
    ) -> ProvdResult<i64> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let missing: i64 = conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM image_blobs ib
            LEFT JOIN blobs b ON ib.blob_digest = b.digest AND b.complete = 1
            WHERE ib.image_id = ?1 AND b.digest IS NULL
            "#,
            params![image_id],
            |row| row.get(0),
        )?;
        Ok(missing)
    }

    /// Set the image's `complete` flag iff every linked blob is complete.
    ///
    /// Returns the flag that was written.
    pub fn update_image_completion(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
    ) -> ProvdResult<bool> {
        let missing = self.count_missing_blobs(cancel, image_id)?;
        let complete = missing == 0;

        let conn = self.db.conn();
        conn.execute(
            "UPDATE images SET complete = ?1 WHERE id = ?2",
            params![complete, image_id],
        )?;
        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::images::ImageStore;
    use crate::store::test_db;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn insert_blob_upserts_by_digest() {
        let store = BlobStore::new(test_db());
        let cancel = token();

        store
            .insert_blob(&cancel, "d1", "e1", 10, "blobs/a", true)
            .unwrap();
        store
            .insert_blob(&cancel, "d1", "e1", 20, "blobs/b", false)
            .unwrap();

        let blob = store.get_blob_by_etag(&cancel, "e1").unwrap().unwrap();
        assert_eq!(blob.digest, "d1");
        assert_eq!(blob.size_bytes, 20);
        assert_eq!(blob.local_path, "blobs/b");
        assert!(!blob.complete);
    }

    #[test]
    fn insert_blob_upserts_by_etag() {
        let store = BlobStore::new(test_db());
        let cancel = token();

        // First pass records the blob under its etag before bytes are hashed.
        store.insert_blob(&cancel, "e1", "e1", 0, "", false).unwrap();
        // Second pass replaces the placeholder digest with the real one.
        store
            .insert_blob(&cancel, "d1", "e1", 100, "blobs/a", true)
            .unwrap();

        let blob = store.get_blob_by_etag(&cancel, "e1").unwrap().unwrap();
        assert_eq!(blob.digest, "d1");
        assert!(blob.complete);
    }

    #[test]
    fn all_complete_etags_skips_incomplete() {
        let store = BlobStore::new(test_db());
        let cancel = token();

        store
            .insert_blob(&cancel, "d1", "e1", 1, "a", true)
            .unwrap();
        store
            .insert_blob(&cancel, "d2", "e2", 1, "b", false)
            .unwrap();

        let seen = store.all_complete_etags(&cancel).unwrap();
        assert!(seen.contains("e1"));
        assert!(!seen.contains("e2"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn image_blob_links_are_idempotent() {
        let db = test_db();
        let store = BlobStore::new(db.clone());
        let cancel = token();

        store.insert_image_blob(&cancel, 7, "d1").unwrap();
        store.insert_image_blob(&cancel, 7, "d1").unwrap();

        let n: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM image_blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn completion_tracks_linked_blobs() {
        let db = test_db();
        let blobs = BlobStore::new(db.clone());
        let images = ImageStore::new(db);
        let cancel = token();

        let image_id = images
            .insert_image(&cancel, "golang", Some("d1"), 0, "")
            .unwrap();

        blobs.insert_blob(&cancel, "d1", "e1", 1, "a", true).unwrap();
        blobs.insert_blob(&cancel, "d2", "e2", 1, "b", false).unwrap();
        blobs.insert_image_blob(&cancel, image_id, "d1").unwrap();
        blobs.insert_image_blob(&cancel, image_id, "d2").unwrap();

        assert_eq!(blobs.count_missing_blobs(&cancel, image_id).unwrap(), 1);
        assert!(!blobs.update_image_completion(&cancel, image_id).unwrap());

        blobs.insert_blob(&cancel, "d2", "e2", 1, "b", true).unwrap();
        assert!(blobs.update_image_completion(&cancel, image_id).unwrap());

        let img = images.get_image_by_id(&cancel, image_id).unwrap().unwrap();
        assert!(img.complete);
    }
}
