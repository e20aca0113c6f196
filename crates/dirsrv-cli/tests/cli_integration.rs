//! CLI subprocess integration tests.
//!
//! These tests invoke the `ns-slapd` binary as a subprocess and verify
//! exit codes and the messages each mode prints.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn slapd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ns-slapd"));
    cmd.env_remove("DIRSRV_LOG");
    cmd
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const ENTRIES: &str = "\
dn: dc=example,dc=com
objectClass: domain
dc: example

dn: uid=alice,dc=example,dc=com
objectClass: person
uid: alice
cn: Alice
";

/// A config directory whose backends are served by `plugin`.
fn write_config(root: &Path, plugin: &str) -> PathBuf {
    let config_dir = root.join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::create_dir_all(root.join("run")).unwrap();
    std::fs::write(
        config_dir.join("dse.toml"),
        format!(
            r#"[server]
rundir = "{run}"

[[mapping_tree]]
suffix = "dc=example,dc=com"
backend = "userRoot"

[[mapping_tree]]
suffix = "ou=groups,dc=example,dc=com"
backend = "groupRoot"

{plugin}
"#,
            run = root.join("run").display(),
        ),
    )
    .unwrap();
    config_dir
}

const MOCK: &str = r#"[[plugin]]
name = "ldbm database"
kind = "mock"
instances = ["userRoot", "groupRoot"]
"#;

#[test]
fn unknown_mode_prints_usage() {
    let output = slapd().arg("frobnicate").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("usage:"));
}

#[test]
fn debug_help_lists_levels_and_fails() {
    let output = slapd().args(["-d", "?"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Debug levels"));
}

#[test]
fn bad_debug_level_is_rejected() {
    let output = slapd().args(["-D", "/nonexistent", "-d", "bogus"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Unrecognized debug level \"bogus\""));
}

#[test]
fn version_flag_exits_zero() {
    let output = slapd().arg("-v").output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("389 Project"), "{stdout}");
}

#[test]
fn config_dir_is_required() {
    let output = slapd().args(["db2ldif", "-n", "userRoot"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("-D configdir"));
}

#[test]
fn flags_of_another_mode_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let output = slapd()
        .arg("db2archive")
        .arg("-D")
        .arg(&config_dir)
        .args(["-a", "/tmp/bak", "-n", "userRoot"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn relative_ldif_input_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let output = slapd()
        .arg("ldif2db")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-i", "relative.ldif"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_import_target_prints_the_mode_usage() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let output = slapd()
        .arg("ldif2db")
        .arg("-D")
        .arg(&config_dir)
        .arg("-i")
        .arg(dir.path().join("in.ldif"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("a backend instance (-n)"), "{err}");
    assert!(err.contains("Usage: ns-slapd ldif2db -D configdir"), "{err}");
}

#[test]
fn suffix2instance_prints_the_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let output = slapd()
        .arg("suffix2instance")
        .arg("-D")
        .arg(&config_dir)
        .args(["-s", "dc=example,dc=com"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let err = stderr(&output);
    assert!(err.contains("instance name \"userRoot\""), "{err}");
    assert!(err.contains("instance name \"groupRoot\""), "{err}");
}

#[test]
fn export_reports_the_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let out = dir.path().join("dump.ldif");
    let output = slapd()
        .arg("db2ldif")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-a"])
        .arg(&out)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert!(stderr(&output).contains(&format!("ldiffile: {}", out.display())));
}

#[test]
fn quiet_export_prints_nothing_about_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = write_config(dir.path(), MOCK);
    let output = slapd()
        .arg("db2ldif")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-q", "-a"])
        .arg(dir.path().join("dump.ldif"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert!(!stderr(&output).contains("ldiffile:"));
}

#[test]
fn backend_failure_code_becomes_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = format!("{MOCK}options = {{ \"fail.groupRoot\" = \"42\" }}\n");
    let config_dir = write_config(dir.path(), &plugin);
    let output = slapd()
        .arg("db2ldif")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-n", "groupRoot"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(42), "{}", stderr(&output));
}

#[test]
fn ldbm_import_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = format!(
        "[[plugin]]\nname = \"ldbm database\"\nkind = \"ldbm\"\ndb_dir = \"{}\"\ninstances = [\"userRoot\", \"groupRoot\"]\n",
        dir.path().join("db").display()
    );
    let config_dir = write_config(dir.path(), &plugin);
    let input = dir.path().join("in.ldif");
    std::fs::write(&input, ENTRIES).unwrap();

    let output = slapd()
        .arg("ldif2db")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-i"])
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));

    let out = dir.path().join("out.ldif");
    let output = slapd()
        .arg("db2ldif")
        .arg("-D")
        .arg(&config_dir)
        .args(["-n", "userRoot", "-a"])
        .arg(&out)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let exported = std::fs::read_to_string(&out).unwrap();
    assert!(exported.contains("dn: uid=alice,dc=example,dc=com"), "{exported}");
}
