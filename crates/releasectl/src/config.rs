//! Configuration loading for `releasectl`.
//!
//! Two files, two jobs, mirroring the split called out in SPEC_FULL.md §10:
//! `.release.toml` (`ReleaseConfig`) carries ambient runtime knobs (lock
//! timeout, retry defaults, storage backend, status sink) the way the
//! teacher's `.shipper.toml` does; a YAML pipeline file (`PipelineConfig`)
//! declares the release shape itself — which downstream packages exist and
//! how to build/publish each one. `CliOverrides` follows the teacher's
//! `Option`-per-flag merge idiom: `None`/`false` means "the user did not
//! pass this flag", never "explicitly disabled".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use releasectl_retry::{PerErrorConfig, RetryPolicy, RetryStrategyConfig, RetryStrategyType};
use releasectl_storage::StorageType;
use releasectl_types::{ArtifactRef, ReleaseType};
use serde::{Deserialize, Serialize};

/// Nested lock configuration; same shape as the teacher's `LockConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "releasectl_types::duration", default = "default_lock_timeout")]
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
        }
    }
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}

/// Nested retry configuration. `policy` picks a preset; explicit fields
/// override it only when `policy = "custom"`, matching the teacher's
/// `RetryConfig`/`build_runtime_options` precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(with = "releasectl_types::duration::option", default)]
    pub base_delay: Option<Duration>,
    #[serde(with = "releasectl_types::duration::option", default)]
    pub max_delay: Option<Duration>,
    #[serde(default)]
    pub strategy: Option<RetryStrategyType>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub per_error: PerErrorConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: None,
            base_delay: None,
            max_delay: None,
            strategy: None,
            jitter: None,
            per_error: PerErrorConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn to_strategy(&self) -> RetryStrategyConfig {
        let preset = self.policy.to_config();
        if self.policy != RetryPolicy::Custom {
            return preset;
        }
        RetryStrategyConfig {
            strategy: self.strategy.unwrap_or(preset.strategy),
            max_attempts: self.max_attempts.unwrap_or(preset.max_attempts),
            base_delay: self.base_delay.unwrap_or(preset.base_delay),
            max_delay: self.max_delay.unwrap_or(preset.max_delay),
            jitter: self.jitter.unwrap_or(preset.jitter),
        }
    }
}

/// Nested storage configuration; same fields as the teacher's
/// `StorageConfigInner`, generalized to the merged state+lock backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    pub fn to_cloud_config(&self) -> releasectl_storage::CloudStorageConfig {
        let bucket = self.bucket.clone().unwrap_or_default();
        let mut config = releasectl_storage::CloudStorageConfig::new(self.storage_type, bucket);
        config.region = self
            .region
            .clone()
            .or_else(|| std::env::var("RELEASECTL_STORAGE_REGION").ok());
        config.base_path = self.base_path.clone().unwrap_or_default();
        config.endpoint = self
            .endpoint
            .clone()
            .or_else(|| std::env::var("RELEASECTL_STORAGE_ENDPOINT").ok());
        config.access_key_id = self
            .access_key_id
            .clone()
            .or_else(|| std::env::var("RELEASECTL_STORAGE_ACCESS_KEY_ID").ok());
        config.secret_access_key = self
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("RELEASECTL_STORAGE_SECRET_ACCESS_KEY").ok());
        config
    }
}

/// Status-sink selection: which channel the renderer posts to, and whether
/// rendering is active at all (a release with no status config still runs;
/// it just never posts).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Top-level runtime config, `.release.toml`. Unknown top-level keys are
/// rejected; nested sections stay open (`#[serde(default)]`) so a partial
/// file is valid, matching the teacher's top-level-only strictness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseConfig {
    /// Path to the YAML pipeline definition, relative to this file's
    /// directory if relative.
    #[serde(default = "default_pipeline_file")]
    pub pipeline_file: PathBuf,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

fn default_pipeline_file() -> PathBuf {
    PathBuf::from("release.yaml")
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            pipeline_file: default_pipeline_file(),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl ReleaseConfig {
    /// Load `.release.toml` from the working directory. Returns the default
    /// configuration if the file does not exist — absence is not an error.
    pub fn load_default() -> Result<Self> {
        let path = PathBuf::from(".release.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock.timeout.is_zero() {
            bail!("lock.timeout must be greater than 0");
        }
        let retry = self.retry.to_strategy();
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }
        if retry.base_delay.is_zero() {
            bail!("retry.base_delay must be greater than 0");
        }
        if retry.max_delay < retry.base_delay {
            bail!("retry.max_delay must be greater than or equal to retry.base_delay");
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

/// One build or publish step: the workflow file to dispatch, the git-ref
/// template to resolve it against, extra dispatch inputs (also templated),
/// and an overall timeout for the phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub workflow: String,
    pub ref_template: String,
    #[serde(default)]
    pub inputs_template: BTreeMap<String, String>,
    #[serde(with = "releasectl_types::duration", default = "default_phase_timeout")]
    pub timeout: Duration,
    /// Artifact names to retain after a build run; empty means "keep
    /// everything the workflow produced". Meaningless for `publish`, kept
    /// here rather than split into two structs so config authors can use
    /// one schema for both phases.
    #[serde(default)]
    pub artifacts_whitelist: Vec<String>,
}

fn default_phase_timeout() -> Duration {
    Duration::from_secs(1800)
}

/// One downstream package's pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    /// `owner/repo` on the workflow host.
    pub repo: String,
    pub build: PhaseConfig,
    pub publish: PhaseConfig,
    /// Package names that must reach a terminal, successful result before
    /// this package's branch starts. Rare in practice — most pipelines have
    /// no cross-package edges.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The YAML pipeline definition: which packages exist and how to release
/// each one, plus optional per-release overrides of the ambient sections
/// that `ReleaseConfig` also carries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub packages: Vec<PackageConfig>,
    #[serde(default)]
    pub release_type_overrides: BTreeMap<String, ReleaseType>,
    #[serde(default)]
    pub retry: Option<RetryStrategyConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub status: Option<StatusConfig>,
}

impl PipelineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline file: {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse pipeline file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.packages.is_empty() {
            bail!("pipeline must declare at least one package");
        }
        let mut seen = std::collections::BTreeSet::new();
        for pkg in &self.packages {
            if pkg.name.is_empty() {
                bail!("package name cannot be empty");
            }
            if !seen.insert(pkg.name.as_str()) {
                bail!("duplicate package name: {}", pkg.name);
            }
            if !pkg.repo.contains('/') {
                bail!(
                    "package {}: repo must be in owner/repo form, got {}",
                    pkg.name,
                    pkg.repo
                );
            }
            for dep in &pkg.depends_on {
                if dep == &pkg.name {
                    bail!("package {} cannot depend on itself", pkg.name);
                }
            }
        }
        for pkg in &self.packages {
            for dep in &pkg.depends_on {
                if !seen.contains(dep.as_str()) {
                    bail!(
                        "package {} depends on unknown package {}",
                        pkg.name,
                        dep
                    );
                }
            }
        }
        Ok(())
    }
}

/// What to force-rebuild, mirroring the `--force-rebuild all|<pkg>` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceRebuild {
    All,
    Package(String),
}

/// CLI overrides. `None`/empty means "the user did not pass this flag";
/// same convention as the teacher's `CliOverrides`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub force_rebuild: Option<ForceRebuild>,
    pub only_packages: Vec<String>,
    pub force_release_type: Option<ReleaseType>,
    pub dry_run: bool,
}

/// Resolve `{tag}`, `{release_type}`, and `{artifact_url[name]}` in a
/// template string. Unknown `artifact_url` names substitute an empty
/// string rather than erroring — a template referencing an artifact this
/// package never produces is a configuration smell the preflight logs, not
/// a reason to abort an in-flight release.
pub fn render_template(
    template: &str,
    tag: &str,
    release_type: ReleaseType,
    artifacts: &BTreeMap<String, ArtifactRef>,
) -> String {
    let mut out = template
        .replace("{tag}", tag)
        .replace("{release_type}", release_type_token(release_type));

    while let Some(start) = out.find("{artifact_url[") {
        let Some(close_bracket) = out[start..].find(']') else {
            break;
        };
        let close_bracket = start + close_bracket;
        let Some(close_brace) = out[close_bracket..].find('}') else {
            break;
        };
        let close_brace = close_bracket + close_brace;
        let name_start = start + "{artifact_url[".len();
        let name = out[name_start..close_bracket].to_string();
        let url = artifacts
            .get(&name)
            .map(|a| a.download_url.clone())
            .unwrap_or_default();
        out.replace_range(start..=close_brace, &url);
    }

    out
}

pub fn render_inputs(
    templates: &BTreeMap<String, String>,
    tag: &str,
    release_type: ReleaseType,
    artifacts: &BTreeMap<String, ArtifactRef>,
) -> BTreeMap<String, String> {
    templates
        .iter()
        .map(|(k, v)| (k.clone(), render_template(v, tag, release_type, artifacts)))
        .collect()
}

fn release_type_token(release_type: ReleaseType) -> &'static str {
    match release_type {
        ReleaseType::Rc => "rc",
        ReleaseType::Ga => "ga",
        ReleaseType::Maintenance => "maintenance",
        ReleaseType::Milestone => "milestone",
    }
}
