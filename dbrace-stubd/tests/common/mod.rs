//! Shared setup for dbrace-stubd end-to-end scenarios.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use dbrace_common::testing::init_global_test_logging;
use dbrace_common::{HarnessConfig, HarnessResult, ScenarioReport, ServerClient};
use serde_json::{Value, json};

#[ctor::ctor]
fn init_test_logging() {
    init_global_test_logging();
}

/// Path of the fixture server built alongside these tests.
pub fn server_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dbrace-stubd"))
}

/// Harness configuration pointing at the freshly built server.
pub fn config() -> HarnessConfig {
    HarnessConfig {
        temp_dir: std::env::temp_dir().join("dbrace_stubd_e2e"),
        server_binary: server_binary(),
        stop_timeout: Duration::from_secs(15),
        ..HarnessConfig::default()
    }
}

/// Panic with the scenario's failure unless it verified.
pub fn assert_verified(report: &ScenarioReport) {
    assert!(
        report.is_verified(),
        "scenario {} ended {}: {}",
        report.name,
        report.state,
        report.failure().unwrap_or_default()
    );
}

/// Insert `n` documents with `_id` 0..n in batches.
pub fn insert_sequential(client: &mut dyn ServerClient, ns: &str, n: u64) -> HarnessResult<u64> {
    let mut inserted = 0;
    let ids: Vec<u64> = (0..n).collect();
    for chunk in ids.chunks(500) {
        let docs: Vec<Value> = chunk.iter().map(|id| json!({ "_id": id })).collect();
        inserted += client.insert(ns, docs)?;
    }
    Ok(inserted)
}
