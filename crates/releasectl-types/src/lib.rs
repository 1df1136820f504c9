//! Core state-model types shared by every `releasectl` crate.
//!
//! This crate is a pure data module: constructors, defaults, and the
//! consistency predicates that back the release-state invariants. It holds
//! no I/O and no behavior-tree logic — those live in `releasectl-tree` and
//! `releasectl` respectively.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod duration {
    //! Serde helpers for `std::time::Duration`, accepting either a
    //! human-readable string (`"10s"`, `"2m"`) or a raw millisecond count.

    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DurationHelper {
            String(String),
            U64(u64),
        }

        match DurationHelper::deserialize(deserializer)? {
            DurationHelper::String(s) => humantime::parse_duration(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
            DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Helper {
                None,
                Some(String),
            }
            let raw: Option<String> = Option::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
            }
        }

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }
    }
}

/// One of the four release shapes the controller recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Rc,
    Ga,
    Maintenance,
    Milestone,
}

/// Derive a [`ReleaseType`] from a tag string, following the rules in
/// SPEC_FULL.md §4.3. Operators may override the result via
/// `force_release_type`, which is applied by the caller, not here.
pub fn derive_release_type(tag: &str) -> ReleaseType {
    let core = tag.split('-').next().unwrap_or(tag);
    let segments: Vec<&str> = core.split('.').collect();

    if let Some(suffix) = tag.strip_prefix(&format!("{core}-")) {
        if suffix.starts_with("rc") && suffix[2..].chars().all(|c| c.is_ascii_digit()) {
            return ReleaseType::Rc;
        }
        if segments.len() == 2 {
            if let Some(mver) = suffix.strip_prefix('m') {
                if mver.chars().all(|c| c.is_ascii_digit()) {
                    return ReleaseType::Milestone;
                }
            }
        }
        return ReleaseType::Maintenance;
    }

    if segments.len() == 3 && segments.iter().all(|s| s.chars().all(|c| c.is_ascii_digit())) {
        return ReleaseType::Ga;
    }

    ReleaseType::Maintenance
}

/// Lifecycle status of a single build or publish phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    Triggered,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseStatus::Succeeded
                | PhaseStatus::Failed
                | PhaseStatus::Cancelled
                | PhaseStatus::TimedOut
        )
    }
}

/// The conclusion reported by the workflow host for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

impl RunConclusion {
    pub fn to_phase_status(self) -> PhaseStatus {
        match self {
            RunConclusion::Success => PhaseStatus::Succeeded,
            RunConclusion::Failure => PhaseStatus::Failed,
            RunConclusion::Cancelled => PhaseStatus::Cancelled,
            RunConclusion::TimedOut => PhaseStatus::TimedOut,
        }
    }
}

/// A handle to a dispatched workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<RunConclusion>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named output of a completed build run, handed off to the publish phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub source_run_id: u64,
    pub download_url: String,
    pub sha256: String,
    pub size: u64,
}

/// Build or publish phase of a package's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub workflow: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<WorkflowRun>,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Wall-clock time of the last `dispatch` call; bounds the `since`
    /// window for `find_run_by_uuid` and anchors the `MonitorRun` backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl PhaseState {
    pub fn new(workflow: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            reference: reference.into(),
            inputs: BTreeMap::new(),
            run: None,
            status: PhaseStatus::NotStarted,
            attempts: 0,
            uuid: None,
            dispatched_at: None,
        }
    }

    /// Reset for a fresh attempt; invariant 2 of SPEC_FULL.md §3.
    pub fn reset_for_retry(&mut self) {
        self.run = None;
        self.status = PhaseStatus::NotStarted;
        self.uuid = None;
        self.dispatched_at = None;
        self.attempts += 1;
    }
}

/// Terminal outcome of a package's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageResult {
    #[default]
    Pending,
    Success,
    Failed,
    Skipped,
}

/// Per-downstream-package state: enablement, both phases, collected
/// artifacts, and the terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageState {
    pub enabled: bool,
    pub build: PhaseState,
    pub publish: PhaseState,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    #[serde(default)]
    pub result: PackageResult,
}

impl PackageState {
    pub fn new(build: PhaseState, publish: PhaseState) -> Self {
        Self {
            enabled: true,
            build,
            publish,
            artifacts: BTreeMap::new(),
            result: PackageResult::default(),
        }
    }

    /// Invariant 1 of SPEC_FULL.md §3.
    pub fn is_consistent(&self) -> bool {
        let success_implies_both = self.result != PackageResult::Success
            || (self.build.status == PhaseStatus::Succeeded
                && self.publish.status == PhaseStatus::Succeeded);
        let artifacts_require_build_succeeded = self.artifacts.is_empty()
            || (self.build.status == PhaseStatus::Succeeded
                && self
                    .artifacts
                    .values()
                    .all(|a| Some(a.source_run_id) == self.build.run.as_ref().map(|r| r.id)));
        success_implies_both && artifacts_require_build_succeeded
    }

    /// Reset build, publish, artifacts, and result to defaults, incrementing
    /// both phases' attempt counters. Used by the `reset(tag, pkg)` primitive.
    pub fn force_rebuild(&mut self) {
        self.build.reset_for_retry();
        self.publish.reset_for_retry();
        self.artifacts.clear();
        self.result = PackageResult::Pending;
    }
}

/// Values that live only for the duration of one controller run and are
/// never written to the persisted document (invariant 4 of SPEC_FULL.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EphemeralMeta {
    pub status_channel: Option<String>,
    pub status_thread_ts: Option<String>,
}

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseMeta {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub ephemeral: EphemeralMeta,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for ReleaseMeta {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: Utc::now(),
            ephemeral: EphemeralMeta::default(),
        }
    }
}

/// The root, persisted document for a single release tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseState {
    pub tag: String,
    pub release_type: ReleaseType,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageState>,
    #[serde(default)]
    pub meta: ReleaseMeta,
}

impl ReleaseState {
    pub fn new(tag: impl Into<String>, release_type: ReleaseType) -> Self {
        Self {
            tag: tag.into(),
            release_type,
            packages: BTreeMap::new(),
            meta: ReleaseMeta::default(),
        }
    }

    /// `save(load(x)) = x` modulo ephemeral stripping: produce the document
    /// exactly as it would be written to the object store.
    pub fn stripped_for_persistence(&self) -> Self {
        let mut copy = self.clone();
        copy.meta.ephemeral = EphemeralMeta::default();
        copy
    }

    pub fn is_consistent(&self) -> bool {
        self.packages.values().all(PackageState::is_consistent)
    }

    /// Root terminal status: `Some(true)` all enabled packages succeeded,
    /// `Some(false)` at least one enabled package failed, `None` still
    /// running.
    pub fn root_status(&self) -> Option<bool> {
        let enabled: Vec<&PackageState> = self.packages.values().filter(|p| p.enabled).collect();
        if enabled.is_empty() {
            return Some(true);
        }
        if enabled.iter().any(|p| p.result == PackageResult::Failed) {
            return Some(false);
        }
        if enabled
            .iter()
            .all(|p| matches!(p.result, PackageResult::Success | PackageResult::Skipped))
        {
            return Some(true);
        }
        None
    }
}

/// Read-only per-package projection consumed by the status renderer.
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub build_status: PhaseStatus,
    pub publish_status: PhaseStatus,
    pub result: PackageResult,
    pub blocking_reason: Option<String>,
}

impl ReleaseState {
    pub fn package_summaries(&self) -> Vec<PackageSummary> {
        self.packages
            .iter()
            .map(|(name, pkg)| PackageSummary {
                name: name.clone(),
                build_status: pkg.build.status,
                publish_status: pkg.publish.status,
                result: pkg.result,
                blocking_reason: blocking_reason(pkg),
            })
            .collect()
    }
}

fn blocking_reason(pkg: &PackageState) -> Option<String> {
    if pkg.build.status == PhaseStatus::Failed {
        Some(format!("build failed: {}", pkg.build.workflow))
    } else if pkg.publish.status == PhaseStatus::Failed {
        Some(format!("publish failed: {}", pkg.publish.workflow))
    } else {
        None
    }
}

/// Coarse classification of a client-observed error, used by leaves to
/// decide retry vs. terminal failure (SPEC_FULL.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Ambiguous,
}

/// Errors surfaced by any of the three client traits.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Http { status, .. } if (500..600).contains(status) => {
                ErrorClass::Transient
            }
            ClientError::Http { status, .. } if *status == 429 => ErrorClass::Transient,
            ClientError::Http { .. } => ErrorClass::Permanent,
            ClientError::Transport(_) => ErrorClass::Transient,
            ClientError::RateLimited => ErrorClass::Transient,
            ClientError::NotFound => ErrorClass::Permanent,
            ClientError::Other(_) => ErrorClass::Ambiguous,
        }
    }
}

/// Metadata stored in the release lock object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ga_from_plain_semver() {
        assert_eq!(derive_release_type("8.2.0"), ReleaseType::Ga);
    }

    #[test]
    fn derives_rc_from_full_semver_suffix() {
        assert_eq!(derive_release_type("8.2.0-rc1"), ReleaseType::Rc);
    }

    #[test]
    fn derives_rc_from_two_part_suffix() {
        assert_eq!(derive_release_type("8.2-rc3"), ReleaseType::Rc);
    }

    #[test]
    fn derives_milestone_from_two_part_m_suffix() {
        assert_eq!(derive_release_type("8.2-m1"), ReleaseType::Milestone);
    }

    #[test]
    fn derives_maintenance_from_other_suffix() {
        assert_eq!(derive_release_type("8.2.0-hotfix1"), ReleaseType::Maintenance);
    }

    #[test]
    fn package_state_consistent_when_pending() {
        let pkg = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        assert!(pkg.is_consistent());
    }

    #[test]
    fn package_state_inconsistent_if_success_without_succeeded_phases() {
        let mut pkg = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        pkg.result = PackageResult::Success;
        assert!(!pkg.is_consistent());
    }

    #[test]
    fn force_rebuild_resets_and_bumps_attempts() {
        let mut pkg = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        pkg.build.status = PhaseStatus::Succeeded;
        pkg.result = PackageResult::Success;
        pkg.force_rebuild();
        assert_eq!(pkg.build.status, PhaseStatus::NotStarted);
        assert_eq!(pkg.build.attempts, 1);
        assert_eq!(pkg.result, PackageResult::Pending);
    }

    #[test]
    fn stripped_for_persistence_clears_ephemeral() {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        state.meta.ephemeral.status_channel = Some("C123".to_string());
        let stripped = state.stripped_for_persistence();
        assert!(stripped.meta.ephemeral.status_channel.is_none());
    }

    #[test]
    fn root_status_none_when_packages_pending() {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        state.packages.insert(
            "docker".to_string(),
            PackageState::new(
                PhaseState::new("build.yml", "main"),
                PhaseState::new("publish.yml", "main"),
            ),
        );
        assert_eq!(state.root_status(), None);
    }

    #[test]
    fn root_status_success_when_all_succeed_or_skip() {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        let mut pkg = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        pkg.result = PackageResult::Success;
        state.packages.insert("docker".to_string(), pkg);
        assert_eq!(state.root_status(), Some(true));
    }

    #[test]
    fn root_status_failure_when_any_enabled_package_fails() {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        let mut ok = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        ok.result = PackageResult::Success;
        let mut bad = PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        );
        bad.result = PackageResult::Failed;
        state.packages.insert("docker".to_string(), ok);
        state.packages.insert("debian".to_string(), bad);
        assert_eq!(state.root_status(), Some(false));
    }

    #[test]
    fn client_error_classifies_5xx_as_transient() {
        let err = ClientError::Http {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn client_error_classifies_404_as_permanent() {
        let err = ClientError::Http {
            status: 404,
            message: "missing".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn release_state_roundtrips_through_json() {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        state.packages.insert(
            "docker".to_string(),
            PackageState::new(
                PhaseState::new("build.yml", "main"),
                PhaseState::new("publish.yml", "main"),
            ),
        );
        let json = serde_json::to_string(&state.stripped_for_persistence()).expect("serialize");
        let parsed: ReleaseState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.tag, state.tag);
        assert_eq!(parsed.packages.len(), 1);
    }
}
