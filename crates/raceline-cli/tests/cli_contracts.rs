#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn rl_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_rl") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/rl");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "raceline-cli", "--bin", "rl"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build rl binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn rl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(rl_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run rl command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_workspace(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("raceline-cli-{label}-{}", Ulid::new()));
    if let Err(err) = fs::create_dir_all(&dir) {
        panic!("failed to create temp dir {}: {err}", dir.display());
    }
    dir
}

fn write_bundle(path: &Path, value: &Value) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(err) => panic!("failed to encode bundle: {err}"),
    };
    if let Err(err) = fs::write(path, raw) {
        panic!("failed to write bundle {}: {err}", path.display());
    }
}

fn bundle(event_id: &str, date: &str, participant: &str, rank: u32) -> Value {
    json!({
        "event": {"event_id": event_id, "event_date": date, "race_no": 1},
        "outcomes": [
            {"participant": {"id": participant, "name": format!("Runner {participant}")}, "rank": rank}
        ]
    })
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(rl_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "load", "link", "views", "failures", "fetch", "report"] {
        assert!(stdout.contains(required), "help is missing `{required}`:\n{stdout}");
    }
}

#[test]
fn load_with_rejected_bundle_exits_non_zero_and_reports_counts() {
    let dir = temp_workspace("load");
    let db_path = dir.join("raceline.sqlite3");
    let good = dir.join("good.json");
    let bad = dir.join("bad.json");
    write_bundle(&good, &bundle("E1", "2024-01-01", "P1", 1));
    write_bundle(
        &bad,
        &json!({
            "event": {"event_id": "E2", "event_date": "2024-01-08", "race_no": 1},
            "outcomes": [{"participant": {"id": "P1", "name": "Runner P1"}, "status": "finished"}]
        }),
    );

    let output = rl_output(
        &db_path,
        &[
            "load",
            &good.display().to_string(),
            &bad.display().to_string(),
            "--json",
        ],
    );
    assert!(!output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["processed"], json!(2));
    assert_eq!(report["committed"], json!(1));
    assert_eq!(report["rejected"], json!(1));
    assert_eq!(report["rejected_sources"], json!(["E2"]));

    let failures = rl_output(&db_path, &["failures", "list", "--phase", "load", "--json"]);
    assert!(failures.status.success());
    let entries = stdout_json(&failures);
    assert_eq!(entries[0]["source_id"], json!("E2"));
    assert_eq!(entries[0]["error_kind"], json!("validation"));
    assert_eq!(entries[0]["run_id"], report["run_id"]);
}

#[test]
fn link_check_fails_until_linkage_has_run() {
    let dir = temp_workspace("link");
    let db_path = dir.join("raceline.sqlite3");
    write_bundle(&dir.join("a.json"), &bundle("E1", "2024-01-01", "P1", 1));
    write_bundle(&dir.join("b.json"), &bundle("E2", "2024-02-15", "P1", 3));

    let load = rl_output(&db_path, &["load", &dir.display().to_string()]);
    assert!(load.status.success(), "{}", String::from_utf8_lossy(&load.stderr));

    let stale = rl_output(&db_path, &["link", "check", "--json"]);
    assert!(!stale.status.success());
    assert_eq!(stdout_json(&stale)["healthy"], json!(false));

    let run = rl_output(&db_path, &["link", "run", "--non-finish", "null-metrics", "--json"]);
    assert!(run.status.success());
    let report = stdout_json(&run);
    assert_eq!(report["rows_linked"], json!(1));
    assert_eq!(report["non_finish_policy"], json!("null_metrics"));

    let fresh = rl_output(&db_path, &["link", "check", "--non-finish", "null-metrics", "--json"]);
    assert!(fresh.status.success());
    assert_eq!(stdout_json(&fresh)["contract_version"], json!("linkage_check.v1"));

    let joined = rl_output(&db_path, &["views", "joined", "--participant", "P1", "--json"]);
    let rows = stdout_json(&joined);
    assert_eq!(rows[1]["prev_event_id"], json!("E1"));
    assert_eq!(rows[1]["days_since_last"], json!(45));
}

#[test]
fn fetch_pending_contract_skips_settled_sources() {
    let dir = temp_workspace("fetch");
    let db_path = dir.join("raceline.sqlite3");

    for (source, state) in [("R1", "fetched"), ("R2", "failed"), ("R3", "skipped")] {
        let output = rl_output(
            &db_path,
            &["fetch", "mark", "--source-id", source, "--state", state],
        );
        assert!(output.status.success());
    }

    let pending = rl_output(
        &db_path,
        &[
            "fetch",
            "pending",
            "--source-id",
            "R1",
            "--source-id",
            "R2",
            "--source-id",
            "R3",
            "--source-id",
            "R4",
            "--json",
        ],
    );
    assert!(pending.status.success());
    assert_eq!(stdout_json(&pending), json!(["R2", "R4"]));
}
