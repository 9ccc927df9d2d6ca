//! Activation (live snapshot mount) operations.

use rusqlite::{OptionalExtension, params};
use tokio_util::sync::CancellationToken;

use provd_shared::errors::ProvdResult;

use super::{Database, ensure_live};

/// A row in the `activations` table.
#[derive(Debug, Clone)]
pub struct Activation {
    pub id: i64,
    pub image_id: i64,
    pub snap_lv_id: i64,
    pub mount_path: String,
    pub activated_at: String,
}

#[derive(Clone)]
pub struct ActivationStore {
    db: Database,
}

impl ActivationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a new activation, returning its row id.
    pub fn insert_activation(
        &self,
        cancel: &CancellationToken,
        image_id: i64,
        snap_lv_id: i64,
        mount_path: &str,
    ) -> ProvdResult<i64> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO activations (image_id, snap_lv_id, mount_path) VALUES (?1, ?2, ?3)",
            params![image_id, snap_lv_id, mount_path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up the activation owning a snapshot LV id, if any.
    ///
    /// Used by the sample-and-check allocation loop during activation.
    pub fn get_activation_by_snap_lv_id(
        &self,
        cancel: &CancellationToken,
        snap_lv_id: i64,
    ) -> ProvdResult<Option<Activation>> {
        ensure_live(cancel)?;
        let conn = self.db.conn();
        let activation = conn
            .query_row(
                r#"
                SELECT id, image_id, snap_lv_id, mount_path, activated_at
                FROM activations WHERE snap_lv_id = ?1
                "#,
                params![snap_lv_id],
                |row| {
                    Ok(Activation {
                        id: row.get(0)?,
                        image_id: row.get(1)?,
                        snap_lv_id: row.get(2)?,
                        mount_path: row.get(3)?,
                        activated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_db;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn insert_and_lookup_by_snap_lv_id() {
        let store = ActivationStore::new(test_db());
        let cancel = token();

        let id = store
            .insert_activation(&cancel, 1, 555, "/mnt/images/555")
            .unwrap();

        let act = store
            .get_activation_by_snap_lv_id(&cancel, 555)
            .unwrap()
            .unwrap();
        assert_eq!(act.id, id);
        assert_eq!(act.image_id, 1);
        assert_eq!(act.mount_path, "/mnt/images/555");

        assert!(
            store
                .get_activation_by_snap_lv_id(&cancel, 556)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn snap_lv_id_is_unique() {
        let store = ActivationStore::new(test_db());
        let cancel = token();

        store
            .insert_activation(&cancel, 1, 9, "/mnt/images/9")
            .unwrap();
        assert!(
            store
                .insert_activation(&cancel, 2, 9, "/mnt/images/9b")
                .is_err()
        );
    }
}
