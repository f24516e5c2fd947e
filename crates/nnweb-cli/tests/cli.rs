use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn nnweb(state_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("nnweb").unwrap();
    cmd.arg("--state-file").arg(state_dir.join("state.json"));
    cmd
}

/// A fallback model computing `y = 2 * (x + w) + 1` with `w = [1, 1, 1]`.
fn write_fallback_model(dir: &Path) {
    let descriptor = r#"{
        "inputs": ["x"],
        "outputs": ["y"],
        "memory_layout": {
            "total_size": 12,
            "static_size": 3,
            "allocations": {
                "w": {"offset": 0, "size": 3},
                "x": {"offset": 3, "size": 3},
                "h": {"offset": 6, "size": 3},
                "y": {"offset": 9, "size": 3}
            }
        },
        "weight_encoding": "raw",
        "exec_infos": [
            {"entry_func_name": "add", "inputs": ["x", "w"], "outputs": ["h"]},
            {"entry_func_name": "scalar_affine", "inputs": ["h"], "outputs": ["y"],
             "call_option": {"scale": 2.0, "bias": 1.0}}
        ]
    }"#;
    let weights: Vec<u8> = [1.0f32, 1.0, 1.0].iter().flat_map(|v| v.to_le_bytes()).collect();

    fs::write(dir.join("graph_fallback.json"), descriptor).unwrap();
    fs::write(dir.join("weight_fallback.bin"), weights).unwrap();
}

#[test]
fn test_help() {
    Command::cargo_bin("nnweb")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("probe"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_probe_reports_fallback() {
    let state = tempfile::tempdir().unwrap();
    nnweb(state.path())
        .args(["probe", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"fallback\": true"))
        .stdout(predicate::str::contains("\"gpu\": false"));
}

#[test]
fn test_run_fallback_model() {
    let state = tempfile::tempdir().unwrap();
    let model = tempfile::tempdir().unwrap();
    write_fallback_model(model.path());

    let input = state.path().join("input.json");
    fs::write(&input, r#"{"x": [0, 1, 2]}"#).unwrap();

    nnweb(state.path())
        .arg("run")
        .arg(model.path())
        .args(["--backend", "fallback", "--no-cache", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"backend\": \"fallback\""))
        .stdout(predicate::str::contains("3.0"))
        .stdout(predicate::str::contains("7.0"));
}

#[test]
fn test_run_missing_model_fails() {
    let state = tempfile::tempdir().unwrap();
    let model = tempfile::tempdir().unwrap();

    nnweb(state.path())
        .arg("run")
        .arg(model.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no backend available"));
}

#[test]
fn test_run_rejects_unknown_backend() {
    let state = tempfile::tempdir().unwrap();
    let model = tempfile::tempdir().unwrap();

    nnweb(state.path())
        .arg("run")
        .arg(model.path())
        .args(["--backend", "webgl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend"));
}

#[test]
fn test_crash_status_and_reset() {
    let state = tempfile::tempdir().unwrap();
    fs::write(
        state.path().join("state.json"),
        r#"{"nnweb.gpu.crash_status": "crashed"}"#,
    )
    .unwrap();

    nnweb(state.path())
        .args(["crash", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("crashed"));

    nnweb(state.path()).args(["crash", "reset"]).assert().success();

    nnweb(state.path())
        .args(["crash", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("none"));
}

#[test]
fn test_config_init_set_get() {
    let state = tempfile::tempdir().unwrap();
    let config = state.path().join("config.json");
    let nnweb_config = || {
        let mut cmd = nnweb(state.path());
        cmd.arg("--config").arg(&config);
        cmd
    };

    nnweb_config().args(["config", "init"]).assert().success();
    assert!(config.exists());

    nnweb_config()
        .args(["config", "set", "backends.ignore_cache", "true"])
        .assert()
        .success();

    nnweb_config()
        .args(["config", "get", "backends.ignore_cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));

    nnweb_config()
        .args(["config", "set", "backends.order", r#"["webgl"]"#])
        .assert()
        .failure();
}
