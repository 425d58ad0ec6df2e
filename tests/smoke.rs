//! Smoke tests -- verify the binary runs and the offline commands work.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sessionkeeper").unwrap();
    cmd.env_remove("SESSIONKEEPER_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(dir.path().join("smoke.db"));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("sessionkeeper")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Keeps website sessions alive"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("sessionkeeper")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sessionkeeper"));
}

#[test]
fn test_check_script_accepts_valid_script() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("login.txt");
    std::fs::write(&script, "openUrl('https://x/login')\nfillUsername()\nwait(250)\nclickSubmitButton()\n").unwrap();

    cli(&dir)
        .arg("check-script")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn test_check_script_reports_position() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("broken.txt");
    std::fs::write(&script, "fillUsername()\nwait(soon)\n").unwrap();

    cli(&dir)
        .arg("check-script")
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn test_find_form_prints_locators() {
    let dir = TempDir::new().unwrap();
    let page = dir.path().join("login.html");
    std::fs::write(
        &page,
        r#"<html><body><form>
            <input name="email"><input type="password" name="pw">
            <button>Log in</button>
        </form></body></html>"#,
    )
    .unwrap();

    cli(&dir)
        .arg("find-form")
        .arg(&page)
        .arg("--candidates")
        .assert()
        .success()
        .stdout(predicate::str::contains("username").and(predicate::str::contains("/input")))
        .stdout(predicate::str::contains("not found").not());
}

#[test]
fn test_site_lifecycle() {
    let dir = TempDir::new().unwrap();

    cli(&dir)
        .args(["site", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sites configured."));

    cli(&dir)
        .args([
            "site",
            "add",
            "--name",
            "forum",
            "--url",
            "https://forum.example/login",
            "--success-url",
            "https://forum.example/",
            "--username",
            "alice",
        ])
        .env("SESSIONKEEPER_PASSWORD", "hunter2")
        .assert()
        .success()
        .stdout(predicate::str::contains("added with id 1"));

    cli(&dir)
        .args(["site", "pause", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("paused"));

    cli(&dir)
        .args(["site", "trigger", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("paused"));

    cli(&dir)
        .args(["site", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"paused\": true"))
        .stdout(predicate::str::contains("hunter2").not());

    cli(&dir)
        .args(["history", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No history for site 1."));

    cli(&dir)
        .args(["site", "log", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Manual login recorded for 'forum'"));

    cli(&dir)
        .args(["history", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged in manually"));

    cli(&dir).args(["site", "remove", "1"]).assert().success();
    cli(&dir).args(["site", "remove", "1"]).assert().failure();
}

#[test]
fn test_site_add_rejects_bad_policy() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args([
            "site",
            "add",
            "--name",
            "x",
            "--url",
            "https://x/",
            "--success-url",
            "https://x/",
            "--username",
            "u",
            "--password",
            "p",
            "--date-minutes-start",
            "10",
            "--allowed-start",
            "600",
            "--allowed-end",
            "660",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("multiple of 1440"));
}
