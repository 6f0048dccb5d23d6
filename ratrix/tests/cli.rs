use std::path::Path;

use assert_cmd::Command;

fn ratrix(dir: &Path) -> Command {
    let mut command = Command::cargo_bin("ratrix").unwrap();
    command
        .current_dir(dir)
        .arg("--config")
        .arg(dir.join("ratrix.json"))
        .arg("--logs")
        .arg(dir.join("logs"));
    command
}

#[test]
fn init_writes_config_once() {
    let dir = tempfile::tempdir().unwrap();

    ratrix(dir.path()).args(["init", "--cameras", "2", "--rack", "rack7"]).assert().success();

    let text = std::fs::read_to_string(dir.path().join("ratrix.json")).unwrap();
    let config: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(config["rack_name"], "rack7");
    assert_eq!(config["cameras"].as_array().unwrap().len(), 2);
    assert!(dir.path().join("offline.png").is_file());

    ratrix(dir.path()).args(["init", "--cameras", "3"]).assert().failure();
    ratrix(dir.path()).args(["init", "--cameras", "3", "--force"]).assert().success();
    let text = std::fs::read_to_string(dir.path().join("ratrix.json")).unwrap();
    let config: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(config["cameras"].as_array().unwrap().len(), 3);
}

#[test]
fn transfer_moves_segment_into_place() {
    let dir = tempfile::tempdir().unwrap();
    ratrix(dir.path()).args(["init", "--cameras", "1"]).assert().success();
    let source = dir.path().join("temp").join("01").join("study_cam01_20240306_12-00-00.mp4");
    std::fs::create_dir_all(source.parent().unwrap()).unwrap();
    std::fs::write(&source, b"segment").unwrap();
    let destination = dir
        .path()
        .join("videos")
        .join("study_cam01_20240306")
        .join("study_cam01_20240306_12-00-00.mp4");

    ratrix(dir.path())
        .arg("transfer")
        .arg("--source")
        .arg(&source)
        .arg("--destination")
        .arg(&destination)
        .assert()
        .success();

    assert!(!source.exists());
    assert_eq!(std::fs::read(destination).unwrap(), b"segment");
}

#[test]
fn camera_outside_config_is_a_setup_failure() {
    let dir = tempfile::tempdir().unwrap();
    ratrix(dir.path()).args(["init", "--cameras", "1"]).assert().success();

    ratrix(dir.path()).args(["camera", "--index", "5"]).assert().code(1);
}

#[test]
fn run_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();

    ratrix(dir.path()).arg("run").assert().failure();
    assert!(!dir.path().join("ratrix.json").exists());
}
