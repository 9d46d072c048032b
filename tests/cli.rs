use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

/// Binary with its data directory redirected into `dir`.
fn scratchvm(dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("scratchvm").into();
    cmd.env("XDG_DATA_HOME", dir.path().join("data"))
        .env("HOME", dir.path());
    cmd
}

/// A config whose hypervisor tooling does not exist, so nothing real is
/// ever touched.
fn write_test_config(dir: &tempfile::TempDir, extra: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("scratchvm.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
[hypervisor]
utmctl = "{root}/no-such-utmctl"
documents_dir = "{root}/documents"
restart_settle_s = 0

[ssh]
key_dir = "{root}/keys"

[results]
dir = "{root}/results"
{extra}
"#,
        root = dir.path().display()
    )
    .unwrap();
    config_path
}

fn write_record(dir: &std::path::Path, name: &str, status: &str, exit_code: i32, command: &str) {
    let record = dir.join(name);
    std::fs::create_dir_all(&record).unwrap();
    std::fs::write(record.join("status"), format!("{status}\n")).unwrap();
    std::fs::write(record.join("exit_code"), format!("{exit_code}\n")).unwrap();
    std::fs::write(record.join("output.log"), "").unwrap();
    std::fs::write(
        record.join("metadata.json"),
        format!(
            r#"{{"vm":"ci-1","ip":"192.168.64.5","repo":null,"command":"{command}","timestamp":"2026-01-02T03-04-05","exit_code":{exit_code},"status":"{status}","duration_s":4}}"#
        ),
    )
    .unwrap();
}

#[test]
fn help_works() {
    let dir = tempfile::tempdir().unwrap();
    scratchvm(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Disposable test VMs"))
        .stdout(predicate::str::contains("create-template"))
        .stdout(predicate::str::contains("provision-for-testing"));
}

#[test]
fn missing_explicit_config_shows_error() {
    let dir = tempfile::tempdir().unwrap();
    scratchvm(&dir)
        .args(["--config", "/nonexistent/scratchvm.toml", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_rejects_zero_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "[template]\ncpus = 0\n");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("template.cpus must be at least 1"));
}

#[test]
fn validation_rejects_clashing_ports() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "[install]\nserial_port = 8000\nanswer_port = 8000\n");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must differ"));
}

#[test]
fn list_without_hypervisor_is_a_prerequisite_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("missing prerequisite"));
}

#[test]
fn create_template_failure_names_stage_and_vm() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "create-template", "--name", "base-1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("base-1"))
        .stderr(predicate::str::contains("Stage 'Validate inputs' failed for VM 'base-1'"));
}

#[test]
fn clone_rejects_unsafe_names_before_touching_the_hypervisor() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "clone", "../escape"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Stage 'Check template' failed"))
        .stderr(predicate::str::contains("validation error"));
}

#[test]
fn clone_rejects_bad_memory_size() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "clone", "ci-1", "--ram", "4X"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown size suffix"));
}

#[test]
fn provision_without_key_is_a_prerequisite_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "provision-for-testing",
            "--name",
            "ci-1",
            "--ip",
            "192.168.64.5",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("SSH"));
}

#[test]
fn results_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "results"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No test runs recorded"));
}

#[test]
fn results_lists_and_filters_records() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir, "");
    let results = dir.path().join("results");
    write_record(&results, "2026-01-02T03-04-05_ci-1", "PASSED", 0, "make test");
    write_record(&results, "2026-01-02T04-00-00_ci-1", "FAILED", 7, "exit 7");

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "results"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[ OK ] 2026-01-02T03-04-05_ci-1 exit=0 `make test`"))
        .stdout(predicate::str::contains("[FAIL] 2026-01-02T04-00-00_ci-1 exit=7 `exit 7`"));

    scratchvm(&dir)
        .args(["--config", config_path.to_str().unwrap(), "results", "--failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exit=7"))
        .stdout(predicate::str::contains("make test").not());
}
