//! Binary smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn leadstudio() -> Command {
    Command::cargo_bin("leadstudio").expect("binary builds")
}

#[test]
fn help_lists_subcommands() {
    leadstudio()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn version_prints() {
    leadstudio().arg("--version").assert().success();
}

#[test]
fn init_creates_the_database_file() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("campaigns.db");
    leadstudio()
        .arg("--db")
        .arg(&db)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized database"));
    assert!(db.exists());
}

#[test]
fn status_of_unknown_campaign_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("campaigns.db");
    leadstudio()
        .arg("--db")
        .arg(&db)
        .arg("status")
        .arg("00000000-0000-0000-0000-000000000000")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn create_rejects_invalid_params() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("campaigns.db");
    let params = dir.path().join("params.json");
    std::fs::write(
        &params,
        r#"{
            "name": "bad campaign",
            "domain_generation": {
                "pattern_type": "prefix",
                "variable_length": 1,
                "character_set": "ab",
                "constant_string": "test",
                "tld": ".com",
                "num_domains_to_generate": 100
            },
            "dns_validation": {"persona_ids": ["11111111-1111-1111-1111-111111111111"]},
            "http_keyword": {"persona_ids": ["22222222-2222-2222-2222-222222222222"]}
        }"#,
    )
    .unwrap();
    leadstudio()
        .arg("--db")
        .arg(&db)
        .arg("create")
        .arg("--params")
        .arg(&params)
        .assert()
        .failure()
        .stderr(predicate::str::contains("only spans"));
}
