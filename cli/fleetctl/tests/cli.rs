//! Runs the fleetctl binary against small world files.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

const WORLD: &str = r#"
[[servers]]
hostname = "home"
max_ram_gb = 16

[[servers]]
hostname = "pserv-0"
max_ram_gb = 8

[[scripts]]
name = "share.js"
ram_gb = 4

[[scripts]]
name = "hack.js"
ram_gb = 1.7
kind = "hack"

[[scripts]]
name = "grow.js"
ram_gb = 1.75
kind = "grow"

[[scripts]]
name = "weaken.js"
ram_gb = 1.75
kind = "weaken"

[[targets]]
hostname = "n00dles"
max_money = 1750000
min_security = 1
growth = 3000
base_hack_ms = 200
"#;

const CONFIG: &str = r#"
log_level = "error"

[memory]
set_aside_gb = { home = 4 }

[batch]
batch_interval_ms = 100
hack_fraction = 0.02
"#;

fn fleetctl(dir: &Path, args: &[&str]) -> Output {
    std::fs::write(dir.join("world.toml"), WORLD).unwrap();
    std::fs::write(dir.join("fleet.toml"), CONFIG).unwrap();
    Command::new(env!("CARGO_BIN_EXE_fleetctl"))
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .args(["--world", "world.toml", "--format", "json"])
        .args(args)
        .output()
        .unwrap()
}

fn data(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["schemaVersion"], "fleet.cli.v1");
    value["data"].clone()
}

#[test]
fn test_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let output = fleetctl(
        dir.path(),
        &["offsets", "--hack", "1000", "--grow", "3200", "--weaken", "4000"],
    );
    let rows = data(&output);

    let starts: Vec<u64> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["start_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(starts, vec![2_840, 720, 0]);
    assert_eq!(rows[2]["phase"], "weaken");
}

#[test]
fn test_capacity_honors_set_aside() {
    let dir = tempfile::tempdir().unwrap();
    let output = fleetctl(dir.path(), &["capacity", "--chunk-size", "4", "--count", "4"]);
    let report = data(&output);

    assert_eq!(report["satisfiable"], 5);
    let plan = report["plan"].as_array().unwrap();
    assert_eq!(plan[0]["hostname"], "home");
    assert_eq!(plan[0]["chunks"], 3);
    assert_eq!(plan[1]["hostname"], "pserv-0");
    assert_eq!(plan[1]["chunks"], 1);
}

#[test]
fn test_launch_spreads_threads() {
    let dir = tempfile::tempdir().unwrap();
    let output = fleetctl(dir.path(), &["launch", "share.js", "--threads", "4"]);
    let result = data(&output);

    let placements = result["placements"].as_array().unwrap();
    let threads: u64 = placements.iter().map(|p| p["threads"].as_u64().unwrap()).sum();
    assert_eq!(threads, 4);
    assert!(placements.iter().all(|p| p["pid"].is_number()));
    assert_eq!(placements[0]["hostname"], "home");
}

#[test]
fn test_launch_beyond_capacity_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = fleetctl(dir.path(), &["launch", "share.js", "--threads", "9"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("5 satisfiable"), "{stderr}");
}

#[test]
fn test_run_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let output = fleetctl(dir.path(), &["run", "n00dles"]);
    let rows = data(&output);

    assert_eq!(rows[0]["target"], "n00dles");
    assert_eq!(rows[0]["total"], 1);
    assert_eq!(rows[0]["completed"], 1);
}

#[test]
fn test_invalid_arguments_exit_nonzero() {
    let dir = tempfile::tempdir().unwrap();

    let output = fleetctl(dir.path(), &["launch", "share.js", "--threads", "0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--threads"));

    let output = fleetctl(dir.path(), &["capacity"]);
    assert!(!output.status.success());
}
