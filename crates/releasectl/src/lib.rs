//! Behavior-tree release orchestrator.
//!
//! A release run walks a tree of per-package build/publish pipelines,
//! dispatching and monitoring workflow runs on downstream repos, handing
//! build artifacts off to the publish phase, and persisting resumable state
//! after every tick. [`controller::run_release`] is the entry point; the
//! `releasectl-cli` binary is a thin wrapper around it.

pub mod clients;
pub mod config;
pub mod controller;
pub mod leaves;
pub mod tree;

pub use clients::Clients;
pub use config::{
    CliOverrides, ForceRebuild, PackageConfig, PhaseConfig, PipelineConfig, ReleaseConfig,
};
pub use controller::{run_release, run_release_locked, ControllerError, ReleaseOutcome, ReleaseOverrides};
