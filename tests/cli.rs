use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn foundry(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("foundry").expect("binary present");
    cmd.current_dir(dir).env("RUST_LOG", "info");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf8 stdout")
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn init_and_generate(dir: &Path) {
    foundry(dir).arg("init").assert().success();
    foundry(dir).arg("generate").assert().success();
}

#[test]
fn version_prints_banner() {
    let temp = tempdir().unwrap();
    let out = stdout_of(foundry(temp.path()).arg("version"));
    assert_eq!(
        out,
        format!(
            "ImageFoundry v{}\nA powerful container image builder with E2E CI/CD\n",
            env!("CARGO_PKG_VERSION")
        )
    );
}

#[test]
fn no_command_prints_help() {
    let temp = tempdir().unwrap();
    let out = stdout_of(&mut foundry(temp.path()));
    assert!(out.contains("Usage:"));
    assert!(out.contains("matrix"));
}

#[test]
fn missing_config_fails_with_status_one() {
    let temp = tempdir().unwrap();
    let assert = foundry(temp.path()).arg("validate").assert().code(1);
    let stderr = stderr_of(assert.get_output());
    assert!(stderr.contains("config file not found"), "{stderr}");
}

#[test]
fn init_generate_validate_workflow() {
    let temp = tempdir().unwrap();
    let out = stdout_of(foundry(temp.path()).arg("init"));
    assert!(out.contains("Next steps:"));
    assert!(temp.path().join("compliance/pci-dss.rego").is_file());
    assert!(temp.path().join("tests/structure-tests.yaml").is_file());

    // The base Dockerfile does not exist yet.
    let assert = foundry(temp.path()).arg("validate").assert().code(1);
    assert!(stderr_of(assert.get_output()).contains("template 'ubuntu-24.04' not found"));

    let out = stdout_of(foundry(temp.path()).arg("generate"));
    assert_eq!(out.lines().count(), 3);
    let ubuntu =
        fs::read_to_string(temp.path().join("templates/base/ubuntu-24.04.Dockerfile")).unwrap();
    assert!(ubuntu.contains("FROM ubuntu:24.04 AS base"));
    assert!(ubuntu.contains("ARG GO_VERSION=1.22.0"));
    assert!(!ubuntu.contains("{{"));
    let alpine =
        fs::read_to_string(temp.path().join("templates/base/alpine-3.20.Dockerfile")).unwrap();
    assert!(alpine.contains("RUN apk add --no-cache curl"));

    let out = stdout_of(foundry(temp.path()).arg("validate"));
    assert!(out.contains("Configuration is valid"));
}

#[test]
fn init_does_not_clobber_config() {
    let temp = tempdir().unwrap();
    foundry(temp.path()).arg("init").assert().success();
    foundry(temp.path()).arg("init").assert().code(1);
    foundry(temp.path())
        .args(["init", "--preset", "minimal", "--force"])
        .assert()
        .success();
    let config = fs::read_to_string(temp.path().join("image-foundry.yaml")).unwrap();
    assert!(config.contains("alpine-3.20"));
}

#[test]
fn generate_selected_base_with_project_dir() {
    let temp = tempdir().unwrap();
    let project = temp.path().join("svc");
    fs::create_dir_all(&project).unwrap();
    foundry(temp.path())
        .args(["-C", "svc", "init", "--preset", "devops"])
        .assert()
        .success();
    foundry(temp.path())
        .args(["-C", "svc", "generate", "alpine-3.20"])
        .assert()
        .success();

    assert!(project.join("templates/base/alpine-3.20.Dockerfile").is_file());
    assert!(!project.join("templates/base/ubuntu-24.04.Dockerfile").exists());
    let alpine = fs::read_to_string(project.join("templates/base/alpine-3.20.Dockerfile")).unwrap();
    assert!(alpine.contains("ARG KUBECTL_VERSION=1.29.0"));
    assert!(alpine.contains("docker-cli"));
}

#[test]
fn generate_uses_custom_skeleton() {
    let temp = tempdir().unwrap();
    foundry(temp.path()).arg("init").assert().success();
    fs::write(
        temp.path().join("custom.tmpl"),
        "FROM {{ .BaseImage }} AS base\nLABEL org.foundry.base=\"{{ .Base }}\"\nFROM base AS final\n",
    )
    .unwrap();

    let out = stdout_of(foundry(temp.path()).args([
        "generate",
        "--template",
        "custom.tmpl",
        "ubuntu-22.04",
    ]));
    assert_eq!(out, "templates/base/ubuntu-22.04.Dockerfile\n");

    let dockerfile =
        fs::read_to_string(temp.path().join("templates/base/ubuntu-22.04.Dockerfile")).unwrap();
    assert!(dockerfile.contains("FROM ubuntu:22.04 AS base"));
    assert!(dockerfile.contains("LABEL org.foundry.base=\"ubuntu-22.04\""));
    assert!(!dockerfile.contains("AS tools"));
    assert!(!temp.path().join("templates/base/ubuntu-24.04.Dockerfile").exists());
}

#[test]
fn dry_run_build_prints_buildx_commands() {
    let temp = tempdir().unwrap();
    init_and_generate(temp.path());

    let assert = foundry(temp.path())
        .args(["--dry-run", "build", "--arch", "arm64"])
        .assert()
        .success();
    let stderr = stderr_of(assert.get_output());
    assert!(
        stderr.contains("docker buildx build --platform linux/arm64 --file templates/base/ubuntu-24.04.Dockerfile --tag ghcr.io/myorg/my-custom-image:latest-arm64"),
        "{stderr}"
    );
    assert!(!stderr.contains("linux/amd64"));
    assert!(!temp.path().join(".foundry").exists());
}

#[test]
fn build_rejects_unknown_architecture() {
    let temp = tempdir().unwrap();
    init_and_generate(temp.path());
    let assert = foundry(temp.path())
        .args(["--dry-run", "build", "--arch", "s390x"])
        .assert()
        .code(1);
    assert!(stderr_of(assert.get_output()).contains("architecture 's390x' is not configured"));
}

#[test]
fn dry_run_build_writes_metrics() {
    let temp = tempdir().unwrap();
    init_and_generate(temp.path());

    foundry(temp.path())
        .args([
            "--dry-run",
            "build",
            "--metrics-json",
            "out/metrics.json",
            "--metrics-prometheus",
            "out/metrics.prom",
        ])
        .assert()
        .success();

    let json: Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("out/metrics.json")).unwrap())
            .unwrap();
    assert_eq!(json["steps"]["build:amd64"]["calls"], 1);
    assert_eq!(json["steps"]["build:arm64"]["failures"], 0);
    let prom = fs::read_to_string(temp.path().join("out/metrics.prom")).unwrap();
    assert!(prom.contains("foundry_step_calls_total{step=\"build:arm64\"} 1"));
}

#[test]
fn dry_run_scan_and_test_use_first_architecture() {
    let temp = tempdir().unwrap();
    foundry(temp.path())
        .args(["init", "--preset", "security"])
        .assert()
        .success();
    foundry(temp.path()).arg("generate").assert().success();

    let assert = foundry(temp.path())
        .args(["--dry-run", "scan"])
        .assert()
        .success();
    let stderr = stderr_of(assert.get_output());
    assert!(stderr.contains("trivy image --severity HIGH,CRITICAL --exit-code 1 --ignore-unfixed ghcr.io/myorg/secure-base:latest-amd64"));
    assert!(stderr.contains("compliance/nist-800-53.rego"));
    assert!(stderr.contains("hadolint templates/base/ubuntu-24.04.Dockerfile"));

    let assert = foundry(temp.path())
        .args(["--dry-run", "test", "--arch", "arm64"])
        .assert()
        .success();
    let stderr = stderr_of(assert.get_output());
    assert!(stderr.contains("container-structure-test test --image ghcr.io/myorg/secure-base:latest-arm64"));
}

#[test]
fn matrix_all_mode_prints_json() {
    let temp = tempdir().unwrap();
    foundry(temp.path()).arg("init").assert().success();

    let out = stdout_of(foundry(temp.path()).args(["matrix", "--mode", "all"]));
    let matrix: Value = serde_json::from_str(out.trim()).unwrap();
    let include = matrix["include"].as_array().unwrap();
    assert_eq!(include.len(), 4);
    assert_eq!(include[0]["base"], "ubuntu-24.04");
    assert_eq!(include[0]["priority"], "high");
    assert_eq!(include[1]["arch"], "arm64");
    assert_eq!(matrix["max-parallel"], 2);
}

#[test]
fn matrix_select_mode_writes_file_and_summary() {
    let temp = tempdir().unwrap();
    let out = stdout_of(foundry(temp.path()).args([
        "matrix",
        "--mode",
        "select",
        "--images",
        "alpine-3.20",
        "ubuntu-22.04",
        "--output",
        "matrix.json",
        "--summary",
    ]));
    assert!(out.contains("Would build: alpine-3.20, ubuntu-22.04"), "{out}");
    assert!(out.contains("Matrix: 3 jobs"));

    let matrix: Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("matrix.json")).unwrap())
            .unwrap();
    assert_eq!(matrix["include"][2]["priority"], "medium");
}

#[test]
fn matrix_empty_results_carry_reason() {
    let temp = tempdir().unwrap();
    let out = stdout_of(foundry(temp.path()).args(["--dry-run", "matrix"]));
    let value: Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(value["reason"], "no_changes");
    assert_eq!(value["images"].as_array().unwrap().len(), 0);

    foundry(temp.path())
        .args(["init", "--preset", "minimal"])
        .assert()
        .success();
    let out = stdout_of(foundry(temp.path()).args(["matrix", "--mode", "config"]));
    let value: Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(value["reason"], "no_images");
}

#[test]
fn lock_writes_yaml_lockfile() {
    let temp = tempdir().unwrap();
    init_and_generate(temp.path());

    foundry(temp.path()).arg("lock").assert().success();
    let lock: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(temp.path().join("foundry.lock")).unwrap())
            .unwrap();
    assert_eq!(lock["name"], "my-project");
    assert_eq!(lock["architectures"][1]["platform"], "linux/arm64");
    assert_eq!(
        lock["dockerfile"]["path"],
        "templates/base/ubuntu-24.04.Dockerfile"
    );
}

#[test]
fn completions_are_generated() {
    let temp = tempdir().unwrap();
    let out = stdout_of(foundry(temp.path()).args(["completions", "bash"]));
    assert!(out.contains("foundry"));
    assert!(out.contains("matrix"));
}
