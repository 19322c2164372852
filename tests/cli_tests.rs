//! Integration tests for the backendai-jupyter command line.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_backendai-jupyter"));
    cmd.env_remove("BACKEND_ACCESS_KEY").env_remove("BACKEND_SECRET_KEY");
    cmd
}

fn run_install(data_dir: &Path, extra: &[&str]) -> Output {
    bin()
        .env("JUPYTER_DATA_DIR", data_dir.join("user"))
        .env("JUPYTER_SYSTEM_DATA_DIR", data_dir.join("system"))
        .args(["install", "--prefix"])
        .arg(data_dir.join("prefix"))
        .args(["-q"])
        .args(extra)
        .output()
        .unwrap()
}

#[test]
fn list_shows_every_flavor() {
    let out = bin().arg("list").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert_eq!(text.lines().count(), 13);
    assert!(text.contains("python-tensorflow:1.8-gpu"));
    assert!(text.contains("Lua 5.3 on Backend.AI"));
}

#[test]
fn install_writes_kernelspecs_under_prefix() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_install(temp.path(), &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let kernels = temp.path().join("prefix/share/jupyter/kernels");
    let spec: Value =
        serde_json::from_str(&fs::read_to_string(kernels.join("backendai-java/kernel.json")).unwrap()).unwrap();
    assert_eq!(spec["display_name"], "Java8 on Backend.AI");
    assert_eq!(spec["language"], "java");
    assert_eq!(spec["argv"][1], "kernel");
    assert_eq!(spec["argv"][5], "backendai-java");
    assert_eq!(fs::read_dir(&kernels).unwrap().count(), 13);

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Installing Backend.AI Jupyter kernel spec"));
}

#[test]
fn clean_only_removes_previous_install() {
    let temp = tempfile::tempdir().unwrap();
    assert!(run_install(temp.path(), &[]).status.success());

    let out = run_install(temp.path(), &["--clean-only"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Removing existing Backend.AI kernel"));
    assert!(!stdout.contains("Installing"));

    let kernels = temp.path().join("prefix/share/jupyter/kernels");
    assert_eq!(fs::read_dir(&kernels).unwrap().count(), 0);
}

#[test]
fn install_sweeps_other_registries() {
    let temp = tempfile::tempdir().unwrap();
    let system = temp.path().join("system/kernels");
    let stale = system.join("backend-python3");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("kernel.json"), r#"{"display_name": "Old Backend Python"}"#).unwrap();
    fs::create_dir_all(system.join("python3")).unwrap();

    let out = run_install(temp.path(), &["--clean-only"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Removing existing Backend.AI kernel"));
    assert!(stdout.contains("Old Backend Python"));
    assert!(!stale.exists());
    assert!(system.join("python3").exists());
}

#[test]
fn kernel_rejects_unknown_flavor() {
    let out = bin()
        .args(["kernel", "-f", "/nonexistent/kernel.json", "-k", "backendai-cobol"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown kernel flavor"));
}

#[test]
fn kernel_requires_api_keypair() {
    let temp = tempfile::tempdir().unwrap();
    let conn = temp.path().join("kernel.json");
    fs::write(
        &conn,
        r#"{"ip":"127.0.0.1","transport":"tcp","shell_port":1,"iopub_port":2,"stdin_port":3,
            "control_port":4,"hb_port":5,"key":"","signature_scheme":"hmac-sha256"}"#,
    )
    .unwrap();
    let out = bin()
        .env("HOME", temp.path())
        .env("XDG_CONFIG_HOME", temp.path())
        .args(["kernel", "-f"])
        .arg(&conn)
        .args(["-k", "backendai-python"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("BACKEND_ACCESS_KEY"));
}
