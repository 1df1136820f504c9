//! Distributed release lock: enforces that at most one mutator drives a
//! given release tag's state at a time.
//!
//! The lock is a small JSON object stored through a [`StorageBackend`] at a
//! well-known key per tag. Acquisition uses the backend's conditional-create
//! (`write_if_absent`); on a backend without a true atomic conditional-put
//! (see `releasectl-storage`'s S3 note) a narrow acquire race is possible, so
//! release always re-reads and compares `holder_id` before deleting rather
//! than assuming the holder that thinks it owns the lock actually does.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use releasectl_retry::{RetryStrategyConfig, calculate_delay};
use releasectl_storage::StorageBackend;
use releasectl_types::LockInfo;
use thiserror::Error;

/// Whether a storage-layer I/O failure surfaced through [`LockError::Storage`]
/// is worth retrying. Mirrors the same handful of `io::Error` kinds the
/// storage backends themselves treat as transient.
fn storage_error_is_transient(err: &anyhow::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.downcast_ref::<std::io::Error>().map(|e| e.kind()),
        Some(
            ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused,
        )
    )
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock for tag {tag} already held by {holder_id} since {acquired_at}")]
    AlreadyHeld {
        tag: String,
        holder_id: String,
        acquired_at: chrono::DateTime<Utc>,
    },
    #[error("lock for tag {tag} was stolen or released by another holder before we released it")]
    LostRace { tag: String },
    #[error("storage error while operating on lock: {0}")]
    Storage(#[from] anyhow::Error),
}

fn lock_key(tag: &str) -> String {
    format!("locks/{tag}/lock")
}

/// A held lock. Callers must call [`LockHandle::release`] explicitly;
/// `Drop` only logs a warning on a leaked handle since release is an async
/// network operation that cannot run from a synchronous destructor.
pub struct LockHandle {
    storage: Arc<dyn StorageBackend>,
    tag: String,
    info: LockInfo,
    released: bool,
    retry: RetryStrategyConfig,
}

impl LockHandle {
    pub fn holder_id(&self) -> &str {
        &self.info.holder_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn acquired_at(&self) -> chrono::DateTime<Utc> {
        self.info.acquired_at
    }

    /// Release the lock, but only if we still appear to hold it.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        let key = lock_key(&self.tag);
        let mut attempt = 1;
        loop {
            let lookup = read_lock_info(&self.storage, &self.tag).await;
            let outcome: Result<(), LockError> = match lookup {
                Ok(Some(current)) if current.holder_id == self.info.holder_id => {
                    match self.storage.delete(&key).await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(LockError::Storage(e)),
                    }
                }
                Ok(Some(_)) | Ok(None) => Err(LockError::LostRace {
                    tag: self.tag.clone(),
                }),
                Err(e) => Err(LockError::Storage(e)),
            };

            match outcome {
                Ok(()) => {
                    self.released = true;
                    return Ok(());
                }
                Err(LockError::Storage(e))
                    if storage_error_is_transient(&e) && attempt < self.retry.max_attempts =>
                {
                    let delay = calculate_delay(&self.retry, attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(LockError::LostRace { tag }) => {
                    self.released = true;
                    return Err(LockError::LostRace { tag });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                tag = %self.tag,
                holder_id = %self.info.holder_id,
                "release lock handle dropped without explicit release; lock will remain held until ttl expiry"
            );
        }
    }
}

async fn read_lock_info(
    storage: &Arc<dyn StorageBackend>,
    tag: &str,
) -> anyhow::Result<Option<LockInfo>> {
    let key = lock_key(tag);
    if !storage.exists(&key).await? {
        return Ok(None);
    }
    let bytes = storage.read(&key).await?;
    let info: LockInfo = serde_json::from_slice(&bytes)?;
    Ok(Some(info))
}

/// Acquire the release lock for `tag`, failing immediately if another
/// holder already has it (even if stale — use [`acquire_with_ttl`] to allow
/// stale takeover).
///
/// Contention against another holder is classified transient (SPEC_FULL.md
/// §7: "lock contention with ttl ... retried with exponential backoff by
/// the client layer") — `retry` bounds how many times this waits out a
/// holder that may release momentarily before giving up with
/// [`LockError::AlreadyHeld`].
pub async fn acquire(
    storage: Arc<dyn StorageBackend>,
    tag: &str,
    holder_id: &str,
    retry: RetryStrategyConfig,
) -> Result<LockHandle, LockError> {
    acquire_inner(storage, tag, holder_id, None, retry).await
}

/// Acquire the release lock for `tag`, taking it over if the existing lock
/// is older than `ttl`. A stolen takeover still re-checks at release time,
/// so the original (stale) holder's eventual `release` call will correctly
/// observe [`LockError::LostRace`] rather than deleting the new holder's
/// lock out from under it.
pub async fn acquire_with_ttl(
    storage: Arc<dyn StorageBackend>,
    tag: &str,
    holder_id: &str,
    ttl: Duration,
    retry: RetryStrategyConfig,
) -> Result<LockHandle, LockError> {
    acquire_inner(storage, tag, holder_id, Some(ttl), retry).await
}

async fn acquire_inner(
    storage: Arc<dyn StorageBackend>,
    tag: &str,
    holder_id: &str,
    ttl: Option<Duration>,
    retry: RetryStrategyConfig,
) -> Result<LockHandle, LockError> {
    let mut attempt = 1;
    loop {
        match try_acquire_once(storage.clone(), tag, holder_id, ttl, retry.clone()).await {
            Ok(handle) => return Ok(handle),
            Err(LockError::AlreadyHeld { .. }) if attempt < retry.max_attempts => {
                let delay = calculate_delay(&retry, attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_acquire_once(
    storage: Arc<dyn StorageBackend>,
    tag: &str,
    holder_id: &str,
    ttl: Option<Duration>,
    retry: RetryStrategyConfig,
) -> Result<LockHandle, LockError> {
    let key = lock_key(tag);
    let info = LockInfo {
        holder_id: holder_id.to_string(),
        acquired_at: Utc::now(),
        tag: tag.to_string(),
    };
    let payload = serde_json::to_vec(&info).map_err(|e| LockError::Storage(e.into()))?;

    if storage
        .write_if_absent(&key, &payload)
        .await
        .map_err(LockError::Storage)?
    {
        return Ok(LockHandle {
            storage,
            tag: tag.to_string(),
            info,
            released: false,
            retry,
        });
    }

    let existing = read_lock_info(&storage, tag)
        .await
        .map_err(LockError::Storage)?
        .ok_or_else(|| LockError::Storage(anyhow::anyhow!("lock disappeared mid-acquire")))?;

    if let Some(ttl) = ttl {
        let age = Utc::now().signed_duration_since(existing.acquired_at);
        if age.num_seconds().max(0) as u64 > ttl.as_secs() {
            storage.delete(&key).await.map_err(LockError::Storage)?;
            if storage
                .write_if_absent(&key, &payload)
                .await
                .map_err(LockError::Storage)?
            {
                return Ok(LockHandle {
                    storage,
                    tag: tag.to_string(),
                    info,
                    released: false,
                    retry,
                });
            }
        }
    }

    Err(LockError::AlreadyHeld {
        tag: tag.to_string(),
        holder_id: existing.holder_id,
        acquired_at: existing.acquired_at,
    })
}

/// Check whether a lock currently exists for `tag`, without acquiring it.
pub async fn is_locked(storage: &Arc<dyn StorageBackend>, tag: &str) -> anyhow::Result<bool> {
    storage.exists(&lock_key(tag)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use releasectl_storage::FileStorage;
    use tempfile::tempdir;

    fn backend(dir: &std::path::Path) -> Arc<dyn StorageBackend> {
        Arc::new(FileStorage::new(dir.to_path_buf()))
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());
        let handle = acquire(storage.clone(), "v1.2.3", "host-a", RetryStrategyConfig::default())
            .await
            .expect("acquire");
        assert!(is_locked(&storage, "v1.2.3").await.expect("is_locked"));
        handle.release().await.expect("release");
        assert!(!is_locked(&storage, "v1.2.3").await.expect("is_locked"));
    }

    #[tokio::test]
    async fn second_acquire_fails_with_already_held() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());
        let _h1 = acquire(storage.clone(), "v1.2.3", "host-a", RetryStrategyConfig::default())
            .await
            .expect("acquire");

        let err = acquire(
            storage.clone(),
            "v1.2.3",
            "host-b",
            RetryStrategyConfig {
                max_attempts: 1,
                ..RetryStrategyConfig::default()
            },
        )
        .await
        .expect_err("should fail");
        match err {
            LockError::AlreadyHeld { holder_id, .. } => assert_eq!(holder_id, "host-a"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_with_ttl_takes_over_stale_lock() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());

        let stale = LockInfo {
            holder_id: "host-a".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            tag: "v1.2.3".to_string(),
        };
        storage
            .write(&lock_key("v1.2.3"), &serde_json::to_vec(&stale).unwrap())
            .await
            .expect("seed stale lock");

        let handle = acquire_with_ttl(
            storage.clone(),
            "v1.2.3",
            "host-b",
            Duration::from_secs(60),
            RetryStrategyConfig::default(),
        )
        .await
        .expect("acquire should take over stale lock");
        assert_eq!(handle.holder_id(), "host-b");
    }

    #[tokio::test]
    async fn acquire_with_ttl_fails_on_fresh_lock() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());
        let _h1 = acquire(storage.clone(), "v1.2.3", "host-a", RetryStrategyConfig::default())
            .await
            .expect("acquire");

        let err = acquire_with_ttl(
            storage.clone(),
            "v1.2.3",
            "host-b",
            Duration::from_secs(3600),
            RetryStrategyConfig {
                max_attempts: 1,
                ..RetryStrategyConfig::default()
            },
        )
        .await
        .expect_err("fresh lock should not be taken over");
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn release_after_losing_race_reports_lost_race() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());
        let handle = acquire(storage.clone(), "v1.2.3", "host-a", RetryStrategyConfig::default())
            .await
            .expect("acquire");

        // Simulate another holder stealing the lock out from under host-a.
        storage.delete(&lock_key("v1.2.3")).await.expect("delete");
        let other = LockInfo {
            holder_id: "host-b".to_string(),
            acquired_at: Utc::now(),
            tag: "v1.2.3".to_string(),
        };
        storage
            .write(&lock_key("v1.2.3"), &serde_json::to_vec(&other).unwrap())
            .await
            .expect("seed other holder");

        let err = handle.release().await.expect_err("should detect lost race");
        assert!(matches!(err, LockError::LostRace { .. }));
        // host-b's lock must remain intact.
        assert!(is_locked(&storage, "v1.2.3").await.expect("still locked"));
    }

    #[tokio::test]
    async fn is_locked_false_when_no_lock_exists() {
        let td = tempdir().expect("tempdir");
        let storage = backend(td.path());
        assert!(!is_locked(&storage, "v1.2.3").await.expect("is_locked"));
    }
}
