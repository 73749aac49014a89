use std::collections::BTreeMap;
use std::fs;

use assert_cmd::Command;
use stackwright::fits::write_header;
use tempfile::tempdir;

fn stackwright(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("stackwright").expect("binary present");
    cmd.env_remove("STACKWRIGHT_HOME")
        .env("RUST_LOG", "warn")
        .arg("--config-dir")
        .arg(config);
    cmd
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn validate_passes_with_packaged_defaults() {
    let temp = tempdir().unwrap();
    stackwright(temp.path()).arg("validate").assert().success();
}

#[test]
fn validate_fails_on_unknown_tool() {
    let temp = tempdir().unwrap();
    let recipe = temp.path().join("recipe");
    stackwright(temp.path())
        .args(["repo", "new", "--kind", "recipe"])
        .arg(&recipe)
        .assert()
        .success();
    let doc = recipe.join("stackwright.toml");
    let broken = fs::read_to_string(&doc)
        .unwrap()
        .replace("tool = \"siril\"", "tool = \"photoshop\"");
    fs::write(&doc, broken).unwrap();

    stackwright(temp.path())
        .args(["repo", "add"])
        .arg(&recipe)
        .assert()
        .success();
    stackwright(temp.path()).arg("validate").assert().failure();
}

#[test]
fn repo_new_refuses_unknown_kind() {
    let temp = tempdir().unwrap();
    stackwright(temp.path())
        .args(["repo", "new", "--kind", "darks"])
        .arg(temp.path().join("darks"))
        .assert()
        .failure();
}

#[test]
fn added_repo_is_listed_and_indexed() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("config");
    let raw = temp.path().join("raw");
    stackwright(&config)
        .args(["repo", "new", "--kind", "raw"])
        .arg(&raw)
        .assert()
        .success();
    let cards = BTreeMap::from([
        ("IMAGETYP".to_string(), "Light".to_string()),
        ("OBJECT".to_string(), "M33".to_string()),
        ("FILTER".to_string(), "L".to_string()),
        ("DATE-OBS".to_string(), "2025-10-01T21:00:00".to_string()),
        ("EXPTIME".to_string(), "60".to_string()),
    ]);
    write_header(&raw.join("m33_001.fits"), &cards).unwrap();

    let added = stdout(stackwright(&config).args(["repo", "add"]).arg(&raw));
    assert!(added.contains("1 scanned, 1 added"), "{added}");

    let listed = stdout(stackwright(&config).args(["repo", "list"]));
    assert!(listed.contains("pkg://defaults"));
    assert!(listed.contains(&format!("file://{}", raw.display())));

    stackwright(&config)
        .args(["select", "target", "M33"])
        .assert()
        .success();
    let sessions = stdout(stackwright(&config).args(["select", "list"]));
    assert!(sessions.contains("2025-10-01"), "{sessions}");
    assert!(sessions.contains("M33"));
}

#[test]
fn info_stages_lists_packaged_stages() {
    let temp = tempdir().unwrap();
    let listed = stdout(stackwright(temp.path()).args(["info", "stages"]));
    assert!(listed.contains("master-bias"));
    assert!(listed.contains("stack"));
}

#[test]
fn completions_are_generated() {
    let temp = tempdir().unwrap();
    let script = stdout(stackwright(temp.path()).args(["completions", "bash"]));
    assert!(script.contains("stackwright"));
}

#[test]
fn sweep_on_empty_scratch_succeeds() {
    let temp = tempdir().unwrap();
    stackwright(temp.path()).arg("sweep").assert().success();
}
