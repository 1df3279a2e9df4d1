use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_displays_usage() {
    Command::cargo_bin("repoctx")
        .expect("binary exists")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("--deselect"));
}

#[test]
fn list_prints_selection_without_fetching() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("src")).expect("mkdir");
    std::fs::write(temp.path().join("src/main.rs"), "fn main() {}\n").expect("write");
    std::fs::write(temp.path().join("notes.txt"), "todo\n").expect("write");

    Command::cargo_bin("repoctx")
        .expect("binary exists")
        .current_dir(temp.path())
        .arg(temp.path())
        .args(["--list", "-x", "notes.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[x] main.rs"))
        .stdout(predicate::str::contains("[ ] notes.txt"));
}

#[test]
fn missing_source_reports_hint() {
    Command::cargo_bin("repoctx")
        .expect("binary exists")
        .arg("/definitely/not/a/repoctx/source")
        .assert()
        .failure()
        .stderr(predicate::str::contains("hint:"));
}
