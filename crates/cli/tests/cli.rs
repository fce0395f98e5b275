use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use tempfile::TempDir;

fn wireit(dir: &Path) -> Command {
    let mut command = Command::cargo_bin("wireit").unwrap();
    command
        .current_dir(dir)
        .env_remove("npm_lifecycle_event")
        .env_remove("WIREIT_PARALLEL")
        .env_remove("WIREIT_FAILURES")
        .env("WIREIT_CACHE", "none");
    command
}

fn write_manifest(dir: &Path, contents: &str) {
    std::fs::write(dir.join("package.json"), contents).unwrap();
}

#[test]
fn no_script_argument_is_launched_incorrectly() {
    let temp = TempDir::new().unwrap();
    wireit(temp.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("launched-incorrectly"));
}

#[test]
fn missing_manifest_is_reported() {
    let temp = TempDir::new().unwrap();
    wireit(temp.path())
        .arg("build")
        .assert()
        .failure()
        .stderr(predicates::str::contains("missing-package-json"));
}

#[test]
fn runs_a_script_and_then_skips_it_when_fresh() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"build": "wireit"},
            "wireit": {
                "build": {
                    "command": "cp a.ts a.js",
                    "files": ["a.ts"],
                    "output": ["a.js"],
                    "packageLocks": []
                }
            }
        }"#,
    );
    std::fs::write(temp.path().join("a.ts"), "export {};").unwrap();

    wireit(temp.path()).arg("build").assert().success();
    assert_eq!(
        std::fs::read_to_string(temp.path().join("a.js")).unwrap(),
        "export {};"
    );

    wireit(temp.path())
        .arg("build")
        .assert()
        .success()
        .stderr(predicates::str::contains("already fresh"));
}

#[test]
fn failing_script_sets_the_exit_code() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"bad": "wireit"},
            "wireit": {"bad": {"command": "exit 7"}}
        }"#,
    );

    wireit(temp.path())
        .arg("bad")
        .assert()
        .code(1)
        .stderr(predicates::str::contains("exited with status 7"));
}

#[test]
fn cycle_renders_a_diagnostic_with_positions() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"a": "wireit", "b": "wireit"},
            "wireit": {
                "a": {"command": "true", "dependencies": ["b"]},
                "b": {"command": "true", "dependencies": ["a"]}
            }
        }"#,
    );

    wireit(temp.path())
        .arg("a")
        .assert()
        .failure()
        .stderr(predicates::str::contains("[cycle]"))
        .stderr(predicates::str::contains("package.json:"));
}

#[test]
fn non_wireit_scripts_entry_warns_but_runs() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{
            "scripts": {"build": "echo direct"},
            "wireit": {"build": {"command": "echo configured"}}
        }"#,
    );

    wireit(temp.path())
        .arg("build")
        .assert()
        .success()
        .stderr(predicates::str::contains("script-not-wireit"));
}

#[test]
fn invalid_parallel_value_is_invalid_usage() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{"scripts": {"a": "true"}}"#,
    );

    wireit(temp.path())
        .arg("a")
        .env("WIREIT_PARALLEL", "zero")
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid-usage"));
}

#[test]
fn script_name_can_come_from_the_npm_lifecycle_event() {
    let temp = TempDir::new().unwrap();
    write_manifest(
        temp.path(),
        r#"{"scripts": {"hello": "echo hi > hello.txt"}}"#,
    );

    wireit(temp.path())
        .env("npm_lifecycle_event", "hello")
        .assert()
        .success();
    assert!(temp.path().join("hello.txt").exists());
}
