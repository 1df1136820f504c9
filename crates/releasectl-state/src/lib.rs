//! Resumable release state: load/save a [`ReleaseState`] document through a
//! [`StorageBackend`], with schema-version tolerance and a force-rebuild
//! reset primitive.
//!
//! Every `save` writes [`ReleaseState::stripped_for_persistence`] rather than
//! the live in-memory value, so ephemeral fields never reach the backend
//! (invariant 4 of the data model). A dry run never calls into storage at
//! all — `save` becomes a no-op whenever the store was built with
//! `dry_run: true`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use releasectl_storage::StorageBackend;
use releasectl_types::{ReleaseState, SCHEMA_VERSION};
use tracing::{info, warn};

fn state_key(tag: &str) -> String {
    format!("releases/{tag}/state.json")
}

/// What to force-rebuild via [`StateStore::reset`].
#[derive(Debug, Clone)]
pub enum ResetSelector {
    All,
    Packages(Vec<String>),
}

pub struct StateStore {
    storage: Arc<dyn StorageBackend>,
    dry_run: bool,
}

impl StateStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            dry_run: false,
        }
    }

    pub fn dry_run(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            dry_run: true,
        }
    }

    /// Load the state document for `tag`, or `None` if no release has ever
    /// run for it. Tolerates a future `schema_version` (logged at `warn`)
    /// but rejects one newer than this binary understands structurally,
    /// since there is no migration path forward in that direction.
    pub async fn load(&self, tag: &str) -> Result<Option<ReleaseState>> {
        let key = state_key(tag);
        if !self.storage.exists(&key).await? {
            return Ok(None);
        }
        let bytes = self
            .storage
            .read(&key)
            .await
            .with_context(|| format!("failed to read release state for tag {tag}"))?;
        let state: ReleaseState = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse release state JSON for tag {tag}"))?;

        if state.meta.schema_version > SCHEMA_VERSION {
            warn!(
                tag,
                found = state.meta.schema_version,
                supported = SCHEMA_VERSION,
                "release state schema version is newer than this binary supports; proceeding best-effort"
            );
        }

        Ok(Some(state))
    }

    /// Persist `state`, stripped of ephemeral fields. No-op under dry run.
    pub async fn save(&self, state: &ReleaseState) -> Result<()> {
        if self.dry_run {
            info!(tag = %state.tag, "dry run: skipping state persistence");
            return Ok(());
        }
        let key = state_key(&state.tag);
        let stripped = state.stripped_for_persistence();
        let bytes = serde_json::to_vec_pretty(&stripped)
            .context("failed to serialize release state JSON")?;
        self.storage
            .write(&key, &bytes)
            .await
            .with_context(|| format!("failed to write release state for tag {}", state.tag))
    }

    /// Delete the persisted state document for `tag` entirely. Used to
    /// start a release over from scratch, not for ordinary package resets
    /// (see [`StateStore::reset`]).
    pub async fn clear(&self, tag: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.storage.delete(&state_key(tag)).await
    }

    pub async fn exists(&self, tag: &str) -> Result<bool> {
        self.storage.exists(&state_key(tag)).await
    }

    /// Force-rebuild the selected packages in an already-loaded state: reset
    /// their build/publish phases, clear artifacts, and reset `result` to
    /// `Pending`. Does not persist — callers call [`StateStore::save`]
    /// afterward so the reset participates in the same save path as any
    /// other mutation.
    pub fn reset(&self, state: &mut ReleaseState, selector: &ResetSelector) -> Result<()> {
        match selector {
            ResetSelector::All => {
                for pkg in state.packages.values_mut() {
                    pkg.force_rebuild();
                }
            }
            ResetSelector::Packages(names) => {
                for name in names {
                    let pkg = state
                        .packages
                        .get_mut(name)
                        .with_context(|| format!("unknown package {name} in release {}", state.tag))?;
                    pkg.force_rebuild();
                }
            }
        }
        if !state.is_consistent() {
            bail!(
                "release state for {} became inconsistent after reset; refusing to proceed",
                state.tag
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use releasectl_storage::FileStorage;
    use releasectl_types::{PackageState, PhaseState, ReleaseType};
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> StateStore {
        StateStore::new(Arc::new(FileStorage::new(dir.to_path_buf())))
    }

    fn sample_state() -> ReleaseState {
        let mut state = ReleaseState::new("v1.2.3", ReleaseType::Ga);
        state.packages.insert(
            "widget".to_string(),
            PackageState::new(
                PhaseState::new("build-widget", "main"),
                PhaseState::new("publish-widget", "main"),
            ),
        );
        state
    }

    #[tokio::test]
    async fn load_returns_none_when_no_state_exists() {
        let td = tempdir().expect("tempdir");
        let s = store(td.path());
        assert!(s.load("v1.2.3").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let td = tempdir().expect("tempdir");
        let s = store(td.path());
        let state = sample_state();
        s.save(&state).await.expect("save");

        let loaded = s.load("v1.2.3").await.expect("load").expect("present");
        assert_eq!(loaded.tag, "v1.2.3");
        assert_eq!(loaded.packages.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_save_never_persists() {
        let td = tempdir().expect("tempdir");
        let s = StateStore::dry_run(Arc::new(FileStorage::new(td.path().to_path_buf())));
        s.save(&sample_state()).await.expect("save");
        assert!(!s.exists("v1.2.3").await.expect("exists"));
    }

    #[tokio::test]
    async fn reset_all_clears_artifacts_and_result() {
        let td = tempdir().expect("tempdir");
        let s = store(td.path());
        let mut state = sample_state();
        let pkg = state.packages.get_mut("widget").unwrap();
        pkg.result = releasectl_types::PackageResult::Failed;
        pkg.build.status = releasectl_types::PhaseStatus::Failed;

        s.reset(&mut state, &ResetSelector::All).expect("reset");

        let pkg = state.packages.get("widget").unwrap();
        assert_eq!(pkg.result, releasectl_types::PackageResult::Pending);
        assert!(pkg.artifacts.is_empty());
    }

    #[tokio::test]
    async fn reset_unknown_package_fails() {
        let td = tempdir().expect("tempdir");
        let s = store(td.path());
        let mut state = sample_state();
        let err = s
            .reset(&mut state, &ResetSelector::Packages(vec!["missing".to_string()]))
            .expect_err("unknown package must fail");
        assert!(err.to_string().contains("unknown package"));
    }

    #[tokio::test]
    async fn clear_removes_state() {
        let td = tempdir().expect("tempdir");
        let s = store(td.path());
        s.save(&sample_state()).await.expect("save");
        assert!(s.exists("v1.2.3").await.expect("exists"));
        s.clear("v1.2.3").await.expect("clear");
        assert!(!s.exists("v1.2.3").await.expect("exists"));
    }
}
