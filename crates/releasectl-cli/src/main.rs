use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use releasectl::config::{ForceRebuild as ConfigForceRebuild, ReleaseConfig};
use releasectl::{Clients, ControllerError, PipelineConfig, ReleaseOutcome, ReleaseOverrides};
use releasectl_status::StatusRenderer;
use releasectl_storage::{build_storage_backend, StorageBackend};
use releasectl_types::ReleaseType;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "releasectl", version)]
#[command(about = "Behavior-tree release orchestrator for downstream package pipelines")]
struct Cli {
    /// Path to the runtime config file.
    #[arg(long, default_value = ".release.toml", global = true)]
    config: PathBuf,

    /// Tracing filter level, e.g. info, debug, releasectl=debug.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a release tag's build/publish pipeline to completion.
    Release {
        tag: String,

        /// Force-rebuild "all" packages or one named package.
        #[arg(long)]
        force_rebuild: Option<String>,

        /// Restrict this run to the named packages (repeatable).
        #[arg(long = "only-packages")]
        only_packages: Vec<String>,

        /// Override the release type derived from the tag.
        #[arg(long, value_enum)]
        force_release_type: Option<CliReleaseType>,

        /// Do not dispatch real workflow runs or persist state.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the persisted status of a release tag.
    Status { tag: String },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliReleaseType {
    Rc,
    Ga,
    Maintenance,
    Milestone,
}

impl From<CliReleaseType> for ReleaseType {
    fn from(value: CliReleaseType) -> Self {
        match value {
            CliReleaseType::Rc => ReleaseType::Rc,
            CliReleaseType::Ga => ReleaseType::Ga,
            CliReleaseType::Maintenance => ReleaseType::Maintenance,
            CliReleaseType::Milestone => ReleaseType::Milestone,
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    fmt().with_env_filter(filter).init();
}

fn parse_force_rebuild(raw: &str) -> ConfigForceRebuild {
    if raw.eq_ignore_ascii_case("all") {
        ConfigForceRebuild::All
    } else {
        ConfigForceRebuild::Package(raw.to_string())
    }
}

fn holder_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    format!("{hostname}:{}", std::process::id())
}

async fn build_clients(config: &ReleaseConfig, dry_run: bool) -> Result<Clients> {
    let cloud_config = releasectl_storage::config_from_env().unwrap_or_else(|| config.storage.to_cloud_config());
    let storage: Arc<dyn StorageBackend> = Arc::from(build_storage_backend(&cloud_config).await?);

    let workflow_token = std::env::var("RELEASECTL_WORKFLOW_TOKEN").unwrap_or_default();
    let status_token = std::env::var("RELEASECTL_STATUS_TOKEN").ok();
    let status: Option<Arc<StatusRenderer>> = Clients::build_status_renderer(
        config.status.enabled,
        config.status.channel.as_deref(),
        status_token,
    );

    Ok(Clients::new(
        "https://api.github.com",
        workflow_token,
        storage,
        status,
        config.retry.to_strategy(),
        dry_run,
    ))
}

fn pipeline_path(config: &ReleaseConfig, config_path: &std::path::Path) -> PathBuf {
    if config.pipeline_file.is_absolute() {
        return config.pipeline_file.clone();
    }
    let base = config_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    base.join(&config.pipeline_file)
}

/// Exit codes per the external interface contract: 0 success, 1 a package
/// failed, 2 usage error, 3 lock held, 4 unexpected internal failure.
fn exit_code_for(result: &Result<ReleaseOutcome, ControllerError>) -> u8 {
    match result {
        Ok(ReleaseOutcome::Succeeded) => 0,
        Ok(ReleaseOutcome::Failed) => 1,
        Err(ControllerError::LockHeld { .. }) => 3,
        Err(ControllerError::Configuration(_)) => 2,
        Err(ControllerError::Internal(_)) => 4,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %err, "releasectl failed");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = if cli.config.exists() {
        ReleaseConfig::load_from_file(&cli.config)?
    } else {
        ReleaseConfig::default()
    };
    config.validate().context("invalid release configuration")?;

    let pipeline_path = pipeline_path(&config, &cli.config);
    let pipeline = PipelineConfig::load_from_file(&pipeline_path)
        .with_context(|| format!("failed to load pipeline file {}", pipeline_path.display()))?;

    match cli.cmd {
        Commands::Release {
            tag,
            force_rebuild,
            only_packages,
            force_release_type,
            dry_run,
        } => {
            let clients = build_clients(&config, dry_run).await?;
            let state_store = if dry_run {
                releasectl_state::StateStore::dry_run(clients.storage.clone())
            } else {
                releasectl_state::StateStore::new(clients.storage.clone())
            };

            let overrides = ReleaseOverrides {
                force_rebuild: force_rebuild.as_deref().map(parse_force_rebuild),
                only_packages,
                force_release_type: force_release_type.map(Into::into),
                dry_run,
            };

            let holder_id = holder_id();
            let result = releasectl::run_release(
                &tag,
                &holder_id,
                &pipeline,
                &clients,
                &state_store,
                config.lock.timeout,
                overrides,
            )
            .await;

            let code = exit_code_for(&result);
            match &result {
                Ok(outcome) => println!("release {tag}: {outcome:?}"),
                Err(err) => eprintln!("release {tag} failed: {err}"),
            }
            Ok(code)
        }
        Commands::Status { tag } => {
            let clients = build_clients(&config, false).await?;
            let state_store = releasectl_state::StateStore::new(clients.storage.clone());
            match releasectl::controller::load_status(&state_store, &tag).await? {
                Some(state) => {
                    print_status(&state);
                    Ok(0)
                }
                None => {
                    println!("no release state found for tag {tag}");
                    Ok(1)
                }
            }
        }
    }
}

fn print_status(state: &releasectl_types::ReleaseState) {
    println!("tag: {}", state.tag);
    println!("release_type: {:?}", state.release_type);
    println!("updated_at: {}", state.meta.updated_at);
    println!();
    for summary in state.package_summaries() {
        println!(
            "{}: build={:?} publish={:?} result={:?}{}",
            summary.name,
            summary.build_status,
            summary.publish_status,
            summary.result,
            summary
                .blocking_reason
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_force_rebuild_all_is_case_insensitive() {
        assert!(matches!(parse_force_rebuild("ALL"), ConfigForceRebuild::All));
    }

    #[test]
    fn parse_force_rebuild_package_name() {
        match parse_force_rebuild("widget") {
            ConfigForceRebuild::Package(name) => assert_eq!(name, "widget"),
            ConfigForceRebuild::All => panic!("expected package variant"),
        }
    }

    #[test]
    fn exit_code_maps_success_to_zero() {
        assert_eq!(exit_code_for(&Ok(ReleaseOutcome::Succeeded)), 0);
    }

    #[test]
    fn exit_code_maps_package_failure_to_one() {
        assert_eq!(exit_code_for(&Ok(ReleaseOutcome::Failed)), 1);
    }

    #[test]
    fn exit_code_maps_lock_held_to_three() {
        let err = ControllerError::LockHeld {
            tag: "8.2.0".to_string(),
            holder_id: "host-a:123".to_string(),
            acquired_at: chrono::Utc::now(),
        };
        assert_eq!(exit_code_for(&Err(err)), 3);
    }

    #[test]
    fn exit_code_maps_internal_error_to_four() {
        let err = ControllerError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(exit_code_for(&Err(err)), 4);
    }
}
