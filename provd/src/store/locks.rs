//! Database-backed advisory locks.
//!
//! A lock is a row in `locks(k, v)`: `k` is the lock name, `v` the owner
//! token. Row present means held; absence means free. Acquisition retries a
//! conflicting insert every 100 ms until the caller's deadline. There is no
//! deadlock detection; timeouts are the only liveness mechanism.
//!
//! Release deletes the row matching both key and owner, so a stale owner
//! cannot free somebody else's lock, and runs under its own 2-second budget
//! that ignores the step's cancellation token: a shutdown that cancels the
//! parent must not orphan the row.

use std::time::Duration;

use rusqlite::params;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

use super::{Database, ensure_live};

/// Interval between acquisition attempts while the lock is held elsewhere.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Budget for the release path, independent of any cancellation token.
const RELEASE_BUDGET: Duration = Duration::from_secs(2);

/// Advisory lock operations wrapping [`Database`].
#[derive(Clone, Debug)]
pub struct LockStore {
    db: Database,
}

/// A held advisory lock.
///
/// Call [`HeldLock::release`] on every exit path. Dropping without releasing
/// falls back to a best-effort synchronous delete and logs a warning.
#[derive(Debug)]
pub struct HeldLock {
    store: LockStore,
    key: String,
    owner: String,
    released: bool,
}

impl LockStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Acquire `key` for `owner`, polling until `timeout` elapses.
    ///
    /// Returns [`ProvdError::LockContention`] once the deadline passes and
    /// [`ProvdError::Cancelled`] if the token fires while waiting.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProvdResult<HeldLock> {
        let deadline = Instant::now() + timeout;
        tracing::debug!(key, owner, ?timeout, "acquiring lock");

        loop {
            ensure_live(cancel)?;

            if self.try_insert(key, owner)? {
                tracing::info!(key, owner, "lock acquired");
                return Ok(HeldLock {
                    store: self.clone(),
                    key: key.to_string(),
                    owner: owner.to_string(),
                    released: false,
                });
            }

            if Instant::now() >= deadline {
                tracing::warn!(key, owner, ?timeout, "lock not acquired within timeout");
                return Err(ProvdError::LockContention(key.to_string()));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvdError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// One insert attempt; `false` means the row already exists.
    fn try_insert(&self, key: &str, owner: &str) -> ProvdResult<bool> {
        let conn = self.db.conn();
        let inserted = conn.execute(
            "INSERT INTO locks (k, v) VALUES (?1, ?2) ON CONFLICT(k) DO NOTHING",
            params![key, owner],
        )?;
        Ok(inserted > 0)
    }

    /// Delete the row matching both key and owner. Returns whether a row
    /// was actually removed.
    pub(crate) fn delete(&self, key: &str, owner: &str) -> ProvdResult<bool> {
        let conn = self.db.conn();
        let removed = conn.execute(
            "DELETE FROM locks WHERE k = ?1 AND v = ?2",
            params![key, owner],
        )?;
        Ok(removed > 0)
    }
}

impl HeldLock {
    /// Release the lock under a fresh 2-second budget.
    ///
    /// Deliberately takes no cancellation token. Errors are logged and
    /// swallowed: a failed release only delays contenders until an operator
    /// clears the row, and must not mask the step's own result.
    pub async fn release(mut self) {
        self.released = true;

        let store = self.store.clone();
        let key = self.key.clone();
        let owner = self.owner.clone();
        let delete = tokio::task::spawn_blocking(move || store.delete(&key, &owner));

        match tokio::time::timeout(RELEASE_BUDGET, delete).await {
            Ok(Ok(Ok(true))) => tracing::info!(key = %self.key, "lock released"),
            Ok(Ok(Ok(false))) => {
                tracing::warn!(key = %self.key, owner = %self.owner, "lock row already gone")
            }
            Ok(Ok(Err(e))) => tracing::warn!(key = %self.key, "failed to release lock: {}", e),
            Ok(Err(e)) => tracing::warn!(key = %self.key, "lock release task failed: {}", e),
            Err(_) => tracing::warn!(key = %self.key, "lock release timed out"),
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(key = %self.key, "lock dropped without release, deleting row");
        if let Err(e) = self.store.delete(&self.key, &self.owner) {
            tracing::warn!(key = %self.key, "fallback lock release failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_db;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let store = LockStore::new(test_db());
        let cancel = token();

        let lock = store
            .acquire("fetch:golang", "pid-1", Duration::from_millis(200), &cancel)
            .await
            .unwrap();
        lock.release().await;

        // Free again: a second acquisition succeeds immediately.
        let lock = store
            .acquire("fetch:golang", "pid-2", Duration::from_millis(200), &cancel)
            .await
            .unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let store = LockStore::new(test_db());
        let cancel = token();

        let held = store
            .acquire("register:golang", "pid-1", Duration::from_millis(100), &cancel)
            .await
            .unwrap();

        let err = store
            .acquire("register:golang", "pid-2", Duration::from_millis(250), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::LockContention(_)));

        held.release().await;
    }

    #[tokio::test]
    async fn release_requires_matching_owner() {
        let store = LockStore::new(test_db());
        let cancel = token();

        let held = store
            .acquire("activate:golang", "pid-1", Duration::from_millis(100), &cancel)
            .await
            .unwrap();

        // A stale owner cannot free the row.
        assert!(!store.delete("activate:golang", "pid-other").unwrap());
        assert!(store.delete("activate:golang", "pid-1").unwrap());

        // Row is already gone; release just logs.
        held.release().await;
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let store = LockStore::new(test_db());
        let cancel = token();

        let held = store
            .acquire("fetch:node", "pid-1", Duration::from_millis(100), &cancel)
            .await
            .unwrap();

        let contender = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .acquire("fetch:node", "pid-2", Duration::from_secs(5), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        held.release().await;

        let lock = contender.await.unwrap().unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn cancellation_aborts_waiters() {
        let store = LockStore::new(test_db());
        let cancel = token();

        let held = store
            .acquire("fetch:python", "pid-1", Duration::from_millis(100), &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let err = store
            .acquire("fetch:python", "pid-2", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::Cancelled));

        // Release ignores the cancelled token.
        held.release().await;
        let fresh = token();
        let lock = store
            .acquire("fetch:python", "pid-3", Duration::from_millis(100), &fresh)
            .await
            .unwrap();
        lock.release().await;
    }
}
