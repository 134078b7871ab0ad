//! E2E tests for the tree commands: init, apply, inspect, validate, merge.
//!
//! Each test runs the `weft` binary in an isolated temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn weft(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("weft"));
    cmd.current_dir(dir);
    cmd.env("WEFT_LOG", "error");
    cmd.env_remove("WEFT_FORMAT");
    cmd.env_remove("WEFT_GC");
    cmd
}

fn init(dir: &Path, file: &str, site: u32, root: bool) {
    let site = site.to_string();
    let mut args = vec!["init", file, "--site", site.as_str()];
    if root {
        args.push("--root");
    }
    weft(dir).args(&args).assert().success();
}

fn apply(dir: &Path, file: &str, events: &Value) {
    let events_path = dir.join("events.json");
    fs::write(&events_path, events.to_string()).expect("write events");
    weft(dir)
        .args(["apply", file, "events.json"])
        .assert()
        .success();
}

fn inspect(dir: &Path, file: &str) -> Value {
    let output = weft(dir)
        .args(["inspect", file, "--atoms", "--json"])
        .output()
        .expect("inspect should not crash");
    assert!(
        output.status.success(),
        "inspect failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("inspect --json should produce valid JSON")
}

fn add_bot(dir: &Path, file: &str) {
    apply(
        dir,
        file,
        &serde_json::json!([
            {"event": "add", "id": "bot", "tags": {"title": "hello", "color": "red"}}
        ]),
    );
}

// ---------------------------------------------------------------------------
// init / apply / inspect
// ---------------------------------------------------------------------------

#[test]
fn init_apply_inspect_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "doc.json", 1, true);
    add_bot(dir.path(), "doc.json");

    let json = inspect(dir.path(), "doc.json");
    assert_eq!(json["site"], 1);
    assert_eq!(json["entities"]["bot"]["title"], "hello");
    assert_eq!(json["entities"]["bot"]["color"], "red");
    // root, entity, two tags, two values
    assert_eq!(json["atoms"], 6);
    assert_eq!(json["time"], 6);
    assert_eq!(json["weave"][0]["kind"], "root");
    assert!(
        json["version"]["hash"]
            .as_str()
            .is_some_and(|h| h.starts_with("blake3:"))
    );
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "doc.json", 1, true);
    weft(dir.path())
        .args(["init", "doc.json", "--site", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    weft(dir.path())
        .args(["init", "doc.json", "--site", "1", "--force"])
        .assert()
        .success();
}

#[test]
fn update_and_remove_events() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "doc.json", 1, true);
    add_bot(dir.path(), "doc.json");
    apply(
        dir.path(),
        "doc.json",
        &serde_json::json!([
            {"event": "update", "id": "bot", "tags": {"title": "bye", "color": null}},
            {"event": "add", "id": "note", "tags": {"pinned": true}},
            {"event": "remove", "id": "note"}
        ]),
    );

    let json = inspect(dir.path(), "doc.json");
    let bot = &json["entities"]["bot"];
    assert_eq!(bot["title"], "bye");
    assert!(bot.get("color").is_none(), "null values are omitted");
    assert!(json["entities"].get("note").is_none());
}

#[test]
fn apply_without_root_creates_nothing() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "peer.json", 2, false);
    fs::write(
        dir.path().join("events.json"),
        r#"[{"event": "add", "id": "bot"}]"#,
    )
    .expect("write");

    weft(dir.path())
        .args(["apply", "peer.json", "events.json", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("atoms_created=0"));
}

#[test]
fn inspect_text_lists_tags() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "doc.json", 1, true);
    add_bot(dir.path(), "doc.json");
    weft(dir.path())
        .args(["inspect", "doc.json", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tag entity=bot name=title value=\"hello\""));
}

// ---------------------------------------------------------------------------
// Garbage collection switches
// ---------------------------------------------------------------------------

fn retitle(dir: &Path, extra: &[&str], env_gc: Option<&str>) -> Value {
    init(dir, "doc.json", 1, true);
    add_bot(dir, "doc.json");
    fs::write(
        dir.join("events.json"),
        r#"[{"event": "update", "id": "bot", "tags": {"title": "bye"}}]"#,
    )
    .expect("write");
    let mut cmd = weft(dir);
    cmd.args(["apply", "doc.json", "events.json"]).args(extra);
    if let Some(value) = env_gc {
        cmd.env("WEFT_GC", value);
    }
    cmd.assert().success();
    inspect(dir, "doc.json")
}

#[test]
fn superseded_values_are_collected_by_default() {
    let dir = TempDir::new().expect("tempdir");
    let json = retitle(dir.path(), &[], None);
    assert_eq!(json["entities"]["bot"]["title"], "bye");
    assert_eq!(json["atoms"], 6);
}

#[test]
fn config_file_can_disable_collection() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(
        dir.path().join("weft.toml"),
        "[tree]\ngarbage_collection = false\n",
    )
    .expect("write config");
    let json = retitle(dir.path(), &["--config", "weft.toml"], None);
    assert_eq!(json["entities"]["bot"]["title"], "bye");
    assert_eq!(json["atoms"], 7);
}

#[test]
fn env_override_disables_collection() {
    let dir = TempDir::new().expect("tempdir");
    let json = retitle(dir.path(), &[], Some("off"));
    assert_eq!(json["atoms"], 7);
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[test]
fn validate_accepts_healthy_trees() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "doc.json", 1, true);
    add_bot(dir.path(), "doc.json");
    weft(dir.path())
        .args(["validate", "doc.json", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("OK   doc.json"));
}

#[test]
fn validate_reports_second_root_with_code() {
    let dir = TempDir::new().expect("tempdir");
    let two_roots = serde_json::json!({
        "site": {"id": 1},
        "knownSites": [{"id": 1}, {"id": 2}],
        "weave": [
            {"id": {"site": 1, "timestamp": 1}, "cause": null, "value": {"type": 0}},
            {"id": {"site": 2, "timestamp": 1}, "cause": null, "value": {"type": 0}}
        ]
    });
    fs::write(dir.path().join("bad.json"), two_roots.to_string()).expect("write");

    let output = weft(dir.path())
        .args(["validate", "bad.json", "--json"])
        .output()
        .expect("validate should not crash");
    assert!(!output.status.success());
    let reports: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(reports[0]["ok"], false);
    assert_eq!(reports[0]["code"], "E3001");
    assert!(reports[0]["hint"].is_string());
}

#[test]
fn validate_flags_orphans() {
    let dir = TempDir::new().expect("tempdir");
    let orphan = serde_json::json!({
        "site": {"id": 1},
        "weave": [
            {"id": {"site": 1, "timestamp": 1}, "cause": null, "value": {"type": 0}},
            {"id": {"site": 1, "timestamp": 3}, "cause": {"site": 1, "timestamp": 2},
             "value": {"type": 2, "name": "lost"}}
        ]
    });
    fs::write(dir.path().join("orphan.json"), orphan.to_string()).expect("write");
    weft(dir.path())
        .args(["validate", "orphan.json", "--format", "text"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("missing from the file"));

    let inspected = inspect(dir.path(), "orphan.json");
    assert_eq!(inspected["atoms"], 1);
    assert_eq!(inspected["pending"], 1);
}

fn tag_atom(timestamp: u64, cause: u64, name: &str) -> Value {
    serde_json::json!({
        "id": {"site": 1, "timestamp": timestamp},
        "cause": {"site": 1, "timestamp": cause},
        "value": {"type": 2, "name": name}
    })
}

#[test]
fn validate_checks_the_stored_order() {
    let dir = TempDir::new().expect("tempdir");
    let root = serde_json::json!({"id": {"site": 1, "timestamp": 1}, "cause": null, "value": {"type": 0}});
    let files = [
        // Oldest sibling stored first.
        ("swapped.json", vec![root.clone(), tag_atom(2, 1, "a"), tag_atom(3, 1, "b")]),
        // 1@4 stored outside the block of its cause 1@3.
        (
            "detached.json",
            vec![root.clone(), tag_atom(3, 1, "b"), tag_atom(2, 1, "a"), tag_atom(4, 3, "c")],
        ),
        ("placed.json", vec![root, tag_atom(3, 1, "b"), tag_atom(4, 3, "c"), tag_atom(2, 1, "a")]),
    ];
    for (name, weave) in &files {
        let tree = serde_json::json!({"site": {"id": 1}, "weave": weave});
        fs::write(dir.path().join(name), tree.to_string()).expect("write");
    }

    let output = weft(dir.path())
        .args(["validate", "swapped.json", "detached.json", "placed.json", "--json"])
        .output()
        .expect("validate should not crash");
    assert!(!output.status.success());

    let reports: Value = serde_json::from_slice(&output.stdout).expect("json");
    for (index, needle) in [(0, "out of order"), (1, "separated from the block")] {
        let report = &reports[index];
        assert_eq!(report["ok"], false);
        assert_eq!(report["code"], "E3001");
        let error = report["error"].as_str().expect("error message");
        assert!(error.starts_with("stored order: "), "{error}");
        assert!(error.contains(needle), "{error}");
    }
    assert_eq!(reports[2]["ok"], true);
    assert_eq!(reports[2]["atoms"], 4);
}

#[test]
fn malformed_tree_reports_decode_code() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("junk.json"), "{ not json").expect("write");
    weft(dir.path())
        .args(["inspect", "junk.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2001"));
}

#[test]
fn unknown_op_type_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let weird = serde_json::json!({
        "site": {"id": 1},
        "weave": [{"id": {"site": 1, "timestamp": 1}, "cause": null, "value": {"type": 42}}]
    });
    fs::write(dir.path().join("weird.json"), weird.to_string()).expect("write");
    weft(dir.path())
        .args(["validate", "weird.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2001"));
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

#[test]
fn merge_brings_a_peer_up_to_date() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "a.json", 1, true);
    add_bot(dir.path(), "a.json");
    init(dir.path(), "b.json", 2, false);

    weft(dir.path())
        .args(["merge", "b.json", "a.json", "-o", "b.json", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"imported\": 6"));

    let merged = inspect(dir.path(), "b.json");
    assert_eq!(merged["site"], 2);
    assert_eq!(merged["entities"]["bot"]["title"], "hello");
    assert_eq!(merged["known_sites"], serde_json::json!([2, 1]));
}

#[test]
fn concurrent_edits_merge_to_the_same_version() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "a.json", 1, true);
    add_bot(dir.path(), "a.json");
    init(dir.path(), "b.json", 2, false);
    weft(dir.path())
        .args(["merge", "b.json", "a.json", "-o", "b.json"])
        .assert()
        .success();

    apply(
        dir.path(),
        "a.json",
        &serde_json::json!([{"event": "update", "id": "bot", "tags": {"title": "from a"}}]),
    );
    apply(
        dir.path(),
        "b.json",
        &serde_json::json!([
            {"event": "update", "id": "bot", "tags": {"color": "blue"}},
            {"event": "add", "id": "note", "tags": {"body": "hi"}}
        ]),
    );

    weft(dir.path())
        .args(["merge", "a.json", "b.json", "-o", "ab.json"])
        .assert()
        .success();
    weft(dir.path())
        .args(["merge", "b.json", "a.json", "-o", "ba.json"])
        .assert()
        .success();

    let ab = inspect(dir.path(), "ab.json");
    let ba = inspect(dir.path(), "ba.json");
    assert_eq!(ab["version"]["hash"], ba["version"]["hash"]);
    assert_eq!(ab["entities"], ba["entities"]);
    assert_eq!(ab["entities"]["bot"]["title"], "from a");
    assert_eq!(ab["entities"]["bot"]["color"], "blue");
    assert_eq!(ab["entities"]["note"]["body"], "hi");
}

#[test]
fn merge_without_output_prints_the_tree() {
    let dir = TempDir::new().expect("tempdir");
    init(dir.path(), "a.json", 1, true);
    init(dir.path(), "b.json", 2, false);
    let output = weft(dir.path())
        .args(["merge", "b.json", "a.json"])
        .output()
        .expect("merge should not crash");
    assert!(output.status.success());
    let stored: Value = serde_json::from_slice(&output.stdout).expect("stored tree JSON");
    assert_eq!(stored["site"]["id"], 2);
    assert_eq!(stored["weave"].as_array().map(Vec::len), Some(1));
}
