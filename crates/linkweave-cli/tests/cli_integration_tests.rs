//! CLI integration tests for linkweave
//!
//! Tests the linkweave CLI commands end-to-end using assert_cmd. Every test
//! gets its own config directory and database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("graph.db")
    }

    fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    /// Command isolated from the user's config, database and API keys
    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("linkweave").unwrap();
        cmd.env("LINKWEAVE_CONFIG_DIR", self.config_dir());
        cmd.env_remove("LINKWEAVE_NARRATIVE_API_KEY");
        cmd.env_remove("OPENROUTER_API_KEY");
        cmd.current_dir(self.dir.path());
        cmd.arg("--db").arg(self.db());
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().args(args).args(["--format", "json"]).output().unwrap();
        assert!(
            output.status.success(),
            "command {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_commands() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("review"))
        .stdout(predicate::str::contains("related"));
}

#[test]
fn test_config_path_uses_config_dir() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"))
        .stdout(predicate::str::contains(path_str(&ws.config_dir())));
}

#[test]
fn test_config_set_get_and_reset() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "set", "cache.max_items", "25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set cache.max_items = 25"));

    ws.cmd()
        .args(["config", "get", "cache.max_items"])
        .assert()
        .success()
        .stdout(predicate::str::diff("25\n"));

    ws.cmd().args(["config", "reset"]).assert().success();

    ws.cmd()
        .args(["config", "get", "cache.max_items"])
        .assert()
        .success()
        .stdout(predicate::str::diff("10\n"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "set", "narrative.api_key", "secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("environment variable"));

    ws.cmd()
        .args(["config", "set", "scoring.medium_threshold", "0.95"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("strictly decreasing"));

    ws.cmd()
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_config_list_json() {
    let ws = Workspace::new();
    let list = ws.json(&["config", "list"]);
    assert_eq!(list["scoring.high_threshold"], "0.8");
    assert!(
        list["narrative.api_key"]
            .as_str()
            .unwrap()
            .contains("not set")
    );
}

#[test]
fn test_rules_seed_is_idempotent() {
    let ws = Workspace::new();
    let installed = ws.json(&["rules", "seed"]);
    assert_eq!(installed.as_array().unwrap().len(), 5);

    let again = ws.json(&["rules", "seed"]);
    assert!(again.as_array().unwrap().is_empty());

    let rules = ws.json(&["rules", "list"]);
    let rules = rules.as_array().unwrap();
    assert_eq!(rules.len(), 5);
    assert_eq!(rules[0]["key"], "doc_sector_tag");
}

#[test]
fn test_rule_enable_disable_by_key() {
    let ws = Workspace::new();
    ws.cmd().args(["rules", "seed"]).assert().success();

    ws.cmd()
        .args(["rules", "disable", "doc_entity_mention"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled"));

    let enabled = ws.json(&["rules", "list", "--enabled"]);
    assert_eq!(enabled.as_array().unwrap().len(), 4);

    ws.cmd()
        .args(["rules", "show", "missing_rule"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_node_upsert_and_show() {
    let ws = Workspace::new();
    let file = ws.write(
        "bank.json",
        r#"{"node_type":"entity","node_id":"bank-x","label":"Bank X","metadata":{"name":"Bank X"}}"#,
    );
    ws.cmd()
        .args(["node", "upsert", path_str(&file)])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 new"));

    let shown = ws.json(&["node", "show", "entity", "bank-x"]);
    assert_eq!(shown["label"], "Bank X");

    ws.cmd()
        .args(["node", "show", "entity", "nobody"])
        .assert()
        .failure();

    ws.cmd()
        .args(["node", "show", "planet", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid node type"));
}

#[test]
fn test_ingest_links_document_to_sector() {
    let ws = Workspace::new();
    ws.cmd().args(["rules", "seed"]).assert().success();
    let sector = ws.write("sector.json", r#"{"node_type":"sector","node_id":"banking"}"#);
    ws.cmd()
        .args(["node", "upsert", path_str(&sector)])
        .assert()
        .success();

    let doc = ws.write(
        "doc.json",
        r#"[{"node_type":"document","node_id":"q3","label":"Q3 Report","tags":["Banking"]}]"#,
    );
    let summaries = ws.json(&["ingest", path_str(&doc)]);
    assert_eq!(summaries[0]["enrichment"]["links_created"], 1);

    let links = ws.json(&["links", "list", "document", "q3", "--link-type", "related_to"]);
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["status"], "active");
    assert_eq!(links[0]["dst"]["node_id"], "banking");

    let related = ws.json(&["related", "sector", "banking"]);
    assert_eq!(related["documents"].as_array().unwrap().len(), 1);
    assert_eq!(related["documents"][0]["label"], "Q3 Report");

    // Re-ingesting the same record refreshes instead of duplicating
    let again = ws.json(&["ingest", path_str(&doc)]);
    assert_eq!(again[0]["enrichment"]["links_created"], 0);
    let links = ws.json(&["links", "list", "document", "q3", "--link-type", "related_to"]);
    assert_eq!(links.as_array().unwrap().len(), 1);

    // Publication and link discovery both reached the timeline
    let events = ws.json(&["timeline", "document", "q3"]);
    assert_eq!(events.as_array().unwrap().len(), 2);
}

#[test]
fn test_manual_link_lifecycle() {
    let ws = Workspace::new();
    let link = ws.json(&[
        "links",
        "create",
        "document",
        "q3",
        "entity",
        "bank-x",
        "--link-type",
        "mentions",
        "--strength",
        "0.9",
        "--evidence",
        "Bank X reported earnings",
    ]);
    let id = link["id"].as_str().unwrap().to_string();
    assert_eq!(link["method"], "manual");
    assert_eq!(link["status"], "active");

    let deprecated = ws.json(&["links", "deprecate", &id, "--reason", "stale"]);
    assert_eq!(deprecated["status"], "deprecated");

    ws.cmd()
        .args(["links", "status", &id, "rejected"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid status transition"));

    ws.cmd()
        .args([
            "links", "create", "entity", "bank-x", "entity", "bank-x", "--link-type", "mentions",
        ])
        .assert()
        .failure();
}

#[test]
fn test_review_queue_flow() {
    let ws = Workspace::new();
    ws.cmd().args(["rules", "seed"]).assert().success();
    let bank = ws.write("bank.json", r#"{"node_type":"entity","node_id":"bank-x","label":"Bank X"}"#);
    ws.cmd()
        .args(["node", "upsert", path_str(&bank)])
        .assert()
        .success();

    // doc_entity_mention does not auto-approve, so the candidate is queued
    let doc = ws.write(
        "doc.json",
        r#"{"node_type":"document","node_id":"q3","label":"Q3 Report",
            "anchors":[{"anchor_type":"entity_mention","target":{"node_type":"entity","node_id":"bank-x"}}]}"#,
    );
    let summaries = ws.json(&["ingest", path_str(&doc)]);
    assert_eq!(summaries[0]["enrichment"]["links_queued"], 1);

    let pending = ws.json(&["review", "list"]);
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    let review_id = pending[0]["id"].as_str().unwrap().to_string();

    let resolution = ws.json(&["review", "approve", &review_id, "--reviewer", "analyst"]);
    assert_eq!(resolution["changed"], true);
    assert_eq!(resolution["entry"]["status"], "approved");

    assert!(ws.json(&["review", "list"]).as_array().unwrap().is_empty());
    let links = ws.json(&["links", "list", "entity", "bank-x"]);
    assert_eq!(links.as_array().unwrap().len(), 1);

    // Approving again is a no-op
    let again = ws.json(&["review", "approve", &review_id]);
    assert_eq!(again["changed"], false);
}

#[test]
fn test_health_calculate_and_summary() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["health", "latest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshots yet"));

    let snapshot = ws.json(&["health", "calculate"]);
    assert_eq!(snapshot["total_links"], 0);

    let summary = ws.json(&["health", "summary"]);
    assert_eq!(summary["active_links"], 0);
    assert_eq!(ws.json(&["health", "history"]).as_array().unwrap().len(), 1);
}

#[test]
fn test_batch_and_rule_runs() {
    let ws = Workspace::new();
    ws.cmd().args(["rules", "seed"]).assert().success();
    let records = ws.write(
        "records.json",
        r#"[{"node_type":"sector","node_id":"energy"},
            {"node_type":"update","node_id":"u1","label":"Oil output","sectors":["energy"]}]"#,
    );
    ws.cmd()
        .args(["node", "upsert", path_str(&records)])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 new"));

    let summary = ws.json(&["batch", "--types", "update", "--workers", "2"]);
    assert_eq!(summary["records_selected"], 1);
    assert_eq!(summary["links_created"], 1);

    let runs = ws.json(&["rules", "runs", "--limit", "50"]);
    assert!(
        runs.as_array()
            .unwrap()
            .iter()
            .any(|r| r["rule_key"] == "update_signal_sector" && r["links_created"] == 1)
    );
}

#[test]
fn test_story_generation_without_api_key_fails_cleanly() {
    let ws = Workspace::new();
    let story = ws.json(&["stories", "generate", "--title", "Weekly overview"]);
    assert_eq!(story["status"], "failed");
    assert!(
        story["error"]
            .as_str()
            .unwrap()
            .contains("LINKWEAVE_NARRATIVE_API_KEY")
    );

    let id = story["id"].as_str().unwrap().to_string();
    ws.cmd()
        .args(["stories", "publish", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be published"));
}

#[test]
fn test_signals_empty() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["signals"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active sector signals"));
}

#[test]
fn test_signals_by_sector_stats_and_expiry() {
    let ws = Workspace::new();
    let update = ws.write(
        "update.json",
        r#"[{"node_type":"update","node_id":"fx","label":"Exchange rate","sectors":["currency"],
             "metadata":{"change_percent":30.0}}]"#,
    );
    let summaries = ws.json(&["ingest", path_str(&update)]);
    assert_eq!(summaries[0]["observed"]["sector_signals"].as_array().unwrap().len(), 1);

    let currency = ws.json(&["signals", "--sector", "currency"]);
    assert_eq!(currency.as_array().unwrap().len(), 1);
    assert_eq!(currency[0]["sector"], "currency");
    let banking = ws.json(&["signals", "--sector", "banking"]);
    assert!(banking.as_array().unwrap().is_empty());

    let stats = ws.json(&["signals", "stats"]);
    assert_eq!(stats["total_signals"], 1);
    assert_eq!(stats["active_signals"], 1);

    let expired = ws.json(&["signals", "expire", "--older-than-days", "0"]);
    assert_eq!(expired["expired"], 1);
    assert_eq!(ws.json(&["signals", "stats"])["active_signals"], 0);
    ws.cmd()
        .args(["signals"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active sector signals"));
}

#[test]
fn test_quiet_mode_suppresses_text() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["--quiet", "rules", "seed"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_doctor_reports_database() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["doctor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Database"))
        .stdout(predicate::str::contains("Narrative API key: Not configured"));
}
