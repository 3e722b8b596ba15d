//! End-to-end tests for the modhost binary
//!
//! Gated behind the `integration` feature flag. Run with:
//!
//! ```sh
//! cargo test -p modhost-cli --features integration
//! ```

#![cfg(feature = "integration")]

use std::process::Command;

fn modhost(args: &[&str], project_dir: &std::path::Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_modhost"))
        .args(args)
        .env("MODHOST_PROJECT_CONFIG_DIR", project_dir)
        .output()
        .expect("Failed to run modhost")
}

#[test]
fn modhost_help_lists_commands() {
    let tmp = tempfile::TempDir::new().unwrap();
    let output = modhost(&["--help"], tmp.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("list"));
    assert!(stdout.contains("lock"));
}

#[test]
fn modhost_list_reports_empty_root() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("plugins");
    let output = modhost(&["list", "--root", root.to_str().unwrap()], tmp.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No plugins loaded"));
    assert!(root.is_dir());
}

#[test]
fn modhost_lock_reads_project_feed_lock() {
    let tmp = tempfile::TempDir::new().unwrap();
    let lock = tmp.path().join("feed.lock.json");
    std::fs::write(&lock, r#"[{ "id": "greeter", "version": "1.2.0" }]"#).unwrap();
    std::fs::write(
        tmp.path().join("config.toml"),
        format!(
            "[feed]\nsource = \"{}\"\nlock_file = \"{}\"\n",
            tmp.path().display(),
            lock.display()
        ),
    )
    .unwrap();

    let output = modhost(&["lock"], tmp.path());
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("greeter"));
    assert!(stdout.contains("1.2.0"));
}
