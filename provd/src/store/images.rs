//! Image family operations.

use rusqlite::{OptionalExtension, Row, params};
use tokio_util::sync::CancellationToken;

use provd_shared::errors::ProvdResult;

use super::{Database, ensure_live};

/// A row in the `images` table.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub digest: Option<String>,
    pub base_lv_id: Option<i64>,
    pub size_bytes: i64,
    pub local_path: String,
    pub complete: bool,
    pub created_at: String,
}

impl Image {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Image {
            id: row.get(0)?,
            name: row.get(1)?,
            digest: row.get(2)?,
            base_lv_id: row.get(3)?,
            size_bytes: row.get(4)?,
            local_path: row.get(5)?,
            complete: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

const IMAGE_COLUMNS: &str =
    "id, name, digest, base_lv_id, size_bytes, local_path, complete, created_at";

/// Image operations wrapping [`Database`].
#[derive(Clone)]
pub struct ImageStore {
    db: Database,
}

impl ImageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert an image family row, returning the surviving row's id.
    ///
    /// The family `name` is the upsert key; `digest` is a mutable summary of
    /// the last-linked blob and is only overwritten when a new value is
    /// present, so a fetch that pulled nothing keeps the previous digest.
    pub fn insert_image(
        &self,
        cancel: &CancellationToken,
        name: &str,
        digest: Option<&str>,
        size_bytes: i64,
        local_path: &str,
    ) -> ProvdResult<i64> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let id: i64 = conn.query_row(
            r#"
            INSERT INTO images (name, digest, size_bytes, local_path)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                digest     = COALESCE(excluded.digest, images.digest),
                size_bytes = excluded.size_bytes,
                local_path = excluded.local_path
            RETURNING id
            "#,
            params![name, digest, size_bytes, local_path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_image_by_id(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
    ) -> ProvdResult<Option<Image>> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let image = conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
                params![image_id],
                Image::from_row,
            )
            .optional()?;
        Ok(image)
    }

    /// Look up the image owning a base LV id, if any.
    ///
    /// Used by the sample-and-check allocation loop during registration.
    pub fn get_image_by_base_lv_id(
        &self,
        cancel: &CancellationToken,
        base_lv_id: i64,
    ) -> ProvdResult<Option<Image>> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let image = conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE base_lv_id = ?1"),
                params![base_lv_id],
                Image::from_row,
            )
            .optional()?;
        Ok(image)
    }

    /// Persist the base LV id assigned to an image.
    pub fn update_base_lv_id(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
        base_lv_id: i64,
    ) -> ProvdResult<()> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        conn.execute(
            "UPDATE images SET base_lv_id = ?1 WHERE id = ?2",
            params![base_lv_id, image_id],
        )?;
        Ok(())
    }
}
