//! Binary-level checks: argument validation and fatal startup errors.

use assert_cmd::Command;

fn cmd() -> Command {
    Command::cargo_bin("filemesh").unwrap()
}

#[test]
fn no_arguments_prints_help_and_fails() {
    cmd().assert().failure();
}

#[test]
fn server_and_client_flags_conflict() {
    cmd()
        .args([
            "--id",
            "1",
            "--port",
            "4000",
            "--props_file",
            "cluster.properties",
            "--server",
            "--client",
        ])
        .assert()
        .failure();
}

#[test]
fn missing_properties_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "--id",
            "1",
            "--port",
            "4000",
            "--props_file",
            dir.path().join("absent.properties").to_str().unwrap(),
            "--client",
        ])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn server_without_root_dir_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let props = dir.path().join("cluster.properties");
    std::fs::write(&props, "password=sesame\n").unwrap();
    cmd()
        .args([
            "--id",
            "1",
            "--port",
            "4001",
            "--props_file",
            props.to_str().unwrap(),
            "--server",
        ])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn client_without_servers_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let props = dir.path().join("cluster.properties");
    std::fs::write(&props, "password=sesame\n").unwrap();
    cmd()
        .args([
            "--id",
            "1",
            "--port",
            "4002",
            "--props_file",
            props.to_str().unwrap(),
            "--client",
        ])
        .assert()
        .failure()
        .code(1);
}
