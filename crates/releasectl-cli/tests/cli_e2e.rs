use std::fs;
use std::path::Path;

use assert_cmd::Command;
use insta::assert_snapshot;
use predicates::str::contains;
use releasectl_state::StateStore;
use releasectl_storage::FileStorage;
use releasectl_types::{PackageResult, PackageState, PhaseState, PhaseStatus, ReleaseState, ReleaseType};
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

fn write_fixture(root: &Path, storage_dir: &Path) -> std::path::PathBuf {
    let config_path = root.join(".release.toml");
    write_file(
        &config_path,
        &format!(
            r#"
pipeline_file = "release.yaml"

[storage]
storage_type = "file"
base_path = "{}"
"#,
            storage_dir.display().to_string().replace('\\', "/")
        ),
    );
    write_file(
        &root.join("release.yaml"),
        r#"
packages:
  - name: widget
    repo: acme/widget
    build:
      workflow: build.yml
      ref_template: "main"
    publish:
      workflow: publish.yml
      ref_template: "main"
"#,
    );
    config_path
}

fn normalize_output(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            if line.starts_with("updated_at: ") {
                "updated_at: <UPDATED_AT>".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn releasectl_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("releasectl"))
}

#[tokio::test]
async fn status_command_reports_missing_state() {
    let td = tempdir().expect("tempdir");
    let storage_dir = td.path().join("storage");
    let config_path = write_fixture(td.path(), &storage_dir);

    let out = releasectl_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .arg("8.2.0")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(out).expect("utf8");
    assert_snapshot!(stdout.trim_end(), @"no release state found for tag 8.2.0");
}

#[tokio::test]
async fn status_command_prints_seeded_state() {
    let td = tempdir().expect("tempdir");
    let storage_dir = td.path().join("storage");
    let config_path = write_fixture(td.path(), &storage_dir);

    let storage = std::sync::Arc::new(FileStorage::new(storage_dir.clone()));
    let state_store = StateStore::new(storage);

    let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
    let mut build = PhaseState::new("build.yml", "main");
    build.status = PhaseStatus::Succeeded;
    let publish = PhaseState::new("publish.yml", "main");
    let mut pkg = PackageState::new(build, publish);
    pkg.result = PackageResult::Pending;
    state.packages.insert("widget".to_string(), pkg);
    state_store.save(&state).await.expect("seed state");

    let out = releasectl_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .arg("8.2.0")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(out).expect("utf8");
    assert_snapshot!(
        normalize_output(&stdout),
        @r#"
tag: 8.2.0
release_type: Ga
updated_at: <UPDATED_AT>

widget: build=Succeeded publish=NotStarted result=Pending
"#
    );
}

/// All declared packages disabled via `--only-packages` makes every branch
/// trivially succeed (`Node::skip_when`), so the tree reaches quiescence
/// immediately without ever dispatching a workflow — this keeps the test
/// fast while still exercising `release --dry-run` end-to-end and
/// confirming dry-run's documented no-persistence behavior.
#[tokio::test]
async fn release_dry_run_with_no_enabled_packages_does_not_persist_state() {
    let td = tempdir().expect("tempdir");
    let storage_dir = td.path().join("storage");
    let config_path = write_fixture(td.path(), &storage_dir);

    releasectl_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("release")
        .arg("8.2.0")
        .arg("--only-packages")
        .arg("nonexistent")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(contains("release 8.2.0: Succeeded"));

    let storage = std::sync::Arc::new(FileStorage::new(storage_dir));
    let state_store = StateStore::new(storage);
    assert!(
        releasectl::controller::load_status(&state_store, "8.2.0")
            .await
            .expect("load_status")
            .is_none(),
        "dry run must not leave persisted state behind"
    );
}

#[test]
fn missing_pipeline_file_fails_with_usage_error() {
    let td = tempdir().expect("tempdir");
    let storage_dir = td.path().join("storage");
    let config_path = td.path().join(".release.toml");
    write_file(
        &config_path,
        &format!(
            r#"
pipeline_file = "does-not-exist.yaml"

[storage]
storage_type = "file"
base_path = "{}"
"#,
            storage_dir.display().to_string().replace('\\', "/")
        ),
    );

    releasectl_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .arg("8.2.0")
        .assert()
        .failure()
        .stderr(contains("failed to load pipeline file"));
}
