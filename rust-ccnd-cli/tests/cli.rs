use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("ccnc")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("interest").and(predicate::str::contains("publish")),
        );
}

#[test]
fn interest_fails_cleanly_without_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("absent.sock");
    Command::cargo_bin("ccnc")
        .unwrap()
        .env("CCN_LOCAL_SOCKNAME", &sock)
        .env_remove("CCN_LOCAL_PORT")
        .args(["interest", "/nobody/home"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot reach ccnd"));
}

#[test]
fn rejects_malformed_name() {
    Command::cargo_bin("ccnc")
        .unwrap()
        .args(["publish", "/bad%zz", "content"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));
}
