use std::process::Command;

#[test]
fn cli_help_lists_optimize() {
    let output = Command::new(env!("CARGO_BIN_EXE_lapidary"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("optimize"));
}

#[test]
fn optimize_requires_a_config_argument() {
    let output = Command::new(env!("CARGO_BIN_EXE_lapidary"))
        .arg("optimize")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn missing_config_file_fails_cleanly() {
    let output = Command::new(env!("CARGO_BIN_EXE_lapidary"))
        .args(["optimize", "/nonexistent/pipeline.yaml"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"));
}
