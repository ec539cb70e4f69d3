#![forbid(unsafe_code)]
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("dkcm_runner_{test_name}_{pid}_{nonce}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn runner(dir: &Path, stub: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dkcm_runner"));
    cmd.env_remove("CI")
        .env_remove("ARTIFACTS")
        .env_remove("DKCM_CLUSTER_CONFIG")
        .env("RUST_LOG", "info")
        .arg("--kubetest2-bin")
        .arg(stub)
        .arg("--work-dir")
        .arg(dir.join("work"))
        .arg("--gcp-project-id")
        .arg("proj-1");
    cmd
}

#[test]
fn stockout_in_primary_region_falls_back_to_backup() {
    let dir = temp_dir("stockout_fallback");
    let calls = dir.join("calls.txt");
    let stub = dir.join("kubetest2");
    write_script(
        &stub,
        &format!(
            r#"echo "$@" >> "{calls}"
case "$*" in
  *--region=us-central1*) echo "zone does not have enough resources available to fulfill the request"; exit 1 ;;
esac
echo created"#,
            calls = calls.display()
        ),
    );

    let out = runner(&dir, &stub).output().expect("run dkcm_runner");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let recorded = fs::read_to_string(&calls).expect("calls");
    let lines: Vec<&str> = recorded.lines().collect();
    assert_eq!(lines.len(), 2, "calls: {recorded}");
    assert!(lines[0].contains("--region=us-central1"));
    assert!(lines[1].contains("--region=us-west1"));
    assert!(!lines[1].contains("--region=us-central1"));
    assert!(lines[1].contains("--project=proj-1"));
}

#[test]
fn fatal_failure_exits_non_zero_without_fallback() {
    let dir = temp_dir("fatal_no_fallback");
    let calls = dir.join("calls.txt");
    let stub = dir.join("kubetest2");
    write_script(
        &stub,
        &format!(
            r#"echo "$@" >> "{calls}"
echo "ERROR: permission denied"
exit 2"#,
            calls = calls.display()
        ),
    );

    let out = runner(&dir, &stub).output().expect("run dkcm_runner");
    assert!(!out.status.success());
    let recorded = fs::read_to_string(&calls).expect("calls");
    assert_eq!(recorded.lines().count(), 1);
}

#[test]
fn dry_run_prints_yaml_config() {
    let dir = temp_dir("dry_run");
    let config = dir.join("cluster.yaml");
    fs::write(&config, "region: europe-west1\nmax_nodes: 6\n").expect("write config");

    let out = Command::new(env!("CARGO_BIN_EXE_dkcm_runner"))
        .env_remove("DKCM_CLUSTER_CONFIG")
        .arg("--config")
        .arg(&config)
        .arg("--machine")
        .arg("n1-standard-8")
        .arg("--dry-run")
        .output()
        .expect("run dkcm_runner");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("region: europe-west1"));
    assert!(stdout.contains("max_nodes: 6"));
    assert!(stdout.contains("machine: n1-standard-8"));
}

#[test]
fn missing_project_outside_ci_is_rejected() {
    let dir = temp_dir("missing_project");
    let stub = dir.join("kubetest2");
    write_script(&stub, "exit 0");

    let out = Command::new(env!("CARGO_BIN_EXE_dkcm_runner"))
        .env_remove("CI")
        .env_remove("DKCM_CLUSTER_CONFIG")
        .arg("--kubetest2-bin")
        .arg(&stub)
        .arg("--work-dir")
        .arg(dir.join("work"))
        .output()
        .expect("run dkcm_runner");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("gcp_project_id"));
}
