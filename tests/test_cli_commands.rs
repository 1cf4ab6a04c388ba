mod common;

use common::{routed_tape, run_cli, stored_chapter};
use tapedeck::p4::Sequence;
use tapedeck::tape::persist::write_tape;

#[test]
fn version_json_output() {
    let output = run_cli(&["version", "--format", "json"]);
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("output should be valid JSON");
    assert_eq!(parsed["name"], "tapedeck");
    assert_eq!(parsed["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn check_valid_script() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ok.p4");
    std::fs::write(&path, "// capture\nresponse:body->seen\n").unwrap();

    let output = run_cli(&["check", path.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "check should pass: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn check_invalid_script_fails_with_config_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.p4");
    std::fs::write(&path, "this is not p4\n").unwrap();

    let output = run_cli(&["check", "--format", "json", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report[0]["issues"][0]["kind"], "invalid");
}

#[test]
fn check_tape_file_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api.json");
    let chapter = stored_chapter("/api/x", "x").with_sequence(Sequence::from_script(
        Some("rewrite".to_string()),
        "response:body->{changed}",
    ));
    write_tape(&path, &routed_tape("api", "/api").with_chapter(chapter)).unwrap();

    let output = run_cli(&["check", "--format", "json", path.to_str().unwrap()]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report[0]["commands"], 1);
}

#[test]
fn check_missing_file() {
    let output = run_cli(&["check", "/tmp/nonexistent_tapedeck_script.p4"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn serve_rejects_bad_bind() {
    let output = run_cli(&["serve", "--bind", "not an address"]);
    assert_eq!(output.status.code(), Some(64));
}
