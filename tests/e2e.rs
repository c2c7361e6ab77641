use std::io::Write;
use std::process::Command;

const PROGRAM: &str = r#"
[[unit]]
name = "main"
locals = 1
code = """
    ldc.int 0x12345678
    store 0
head:
    load 0
    ifeq done
    load 0
    invoke dec 1
    store 0
    goto head
done:
    return
"""

[[unit]]
name = "dec"
locals = 1
code = """
    load 0
    iconst -1
    add
    vreturn
"""
"#;

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn run_kiln(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute kiln");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str]) -> String {
    let (stdout, stderr, success) = run_kiln(args);
    assert!(success, "kiln should succeed, stderr:\n{}", stderr);
    stdout
}

fn assert_failure(args: &[&str]) -> String {
    let (_, stderr, success) = run_kiln(args);
    assert!(!success, "kiln should fail");
    stderr
}

#[test]
fn test_compile_listing() {
    let program = write_temp(PROGRAM);
    let stdout = assert_success(&["compile", program.path().to_str().unwrap()]);

    assert!(stdout.starts_with("unit #0 (arm32):"), "{}", stdout);
    assert!(stdout.contains("; entry"));
    assert!(stdout.contains("; osr @6"));
    assert!(stdout.contains("12345678  ; data"));
    assert!(stdout.contains("inlined calls: 1"));
}

#[test]
fn test_compile_named_unit_aarch64() {
    let program = write_temp(PROGRAM);
    let stdout = assert_success(&[
        "compile",
        program.path().to_str().unwrap(),
        "--unit",
        "dec",
        "--backend",
        "aarch64",
    ]);

    assert!(stdout.starts_with("unit #1 (aarch64):"), "{}", stdout);
    // ret
    assert!(stdout.contains("d65f03c0"));
}

#[test]
fn test_sliced_compile_matches_unsliced() {
    let program = write_temp(PROGRAM);
    let path = program.path().to_str().unwrap();
    let whole = assert_success(&["compile", path, "--json"]);
    let sliced = assert_success(&["compile", path, "--json", "--slice", "1"]);

    let whole: serde_json::Value = serde_json::from_str(&whole).unwrap();
    let sliced: serde_json::Value = serde_json::from_str(&sliced).unwrap();
    assert_eq!(whole["lines"], sliced["lines"]);
    assert_eq!(whole["backend"], "arm32");
    assert_eq!(whole["stats"]["suspensions"], 0);
    assert!(sliced["stats"]["suspensions"].as_u64().unwrap() > 0);
}

#[test]
fn test_compile_with_config_file() {
    let program = write_temp(PROGRAM);
    let config = write_temp("inline_max_bytes = 0\n");
    let stdout = assert_success(&[
        "compile",
        program.path().to_str().unwrap(),
        "--config",
        config.path().to_str().unwrap(),
    ]);
    assert!(stdout.contains("inlined calls: 0"));
}

#[test]
fn test_trace_goes_to_stderr() {
    let program = write_temp(PROGRAM);
    let (stdout, stderr, success) =
        run_kiln(&["compile", program.path().to_str().unwrap(), "--trace"]);
    assert!(success);
    assert!(stdout.starts_with("unit #0"));
    assert!(stderr.contains("session started"), "{}", stderr);
}

#[test]
fn test_check() {
    let program = write_temp(PROGRAM);
    let stdout = assert_success(&["check", program.path().to_str().unwrap()]);
    assert_eq!(
        stdout,
        "#0 main: 30 bytes, 1 locals, 3 blocks, loops, throws\n#1 dec: 10 bytes, 1 locals, 1 blocks\n"
    );
}

#[test]
fn test_unknown_unit_fails() {
    let program = write_temp(PROGRAM);
    let stderr = assert_failure(&[
        "compile",
        program.path().to_str().unwrap(),
        "--unit",
        "nope",
    ]);
    assert!(stderr.contains("no unit named 'nope'"));
}

#[test]
fn test_syntax_error_fails() {
    let program = write_temp("[[unit]]\nname = \"x\"\ncode = \"\"\"\nbogus\n\"\"\"\n");
    let stderr = assert_failure(&["check", program.path().to_str().unwrap()]);
    assert!(stderr.contains("unknown instruction 'bogus'"), "{}", stderr);
}

#[test]
fn test_bad_config_fails() {
    let program = write_temp(PROGRAM);
    let config = write_temp("increment_ops = 0\n");
    let stderr = assert_failure(&[
        "compile",
        program.path().to_str().unwrap(),
        "--config",
        config.path().to_str().unwrap(),
    ]);
    assert!(stderr.contains("increment_ops"));
}
