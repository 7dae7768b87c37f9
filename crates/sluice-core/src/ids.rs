//! Prefixed random identifiers for orchestrator-owned rows.
//!
//! Format: `<prefix>_<24 lowercase hex chars>`. Service, task, and pipeline
//! ids are caller-supplied strings and never minted here.

use std::collections::BTreeSet;

use rand::Rng;

/// Prefix carried by temp-upload ids; dispatch scans inputs for it.
pub const TEMP_UPLOAD_PREFIX: &str = "tmp_";

fn random_suffix() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Mint a pipeline run id (`prun_…`).
pub fn pipeline_run_id() -> String {
    format!("prun_{}", random_suffix())
}

/// Mint a task run id (`trun_…`).
pub fn task_run_id() -> String {
    format!("trun_{}", random_suffix())
}

/// Mint a dead-letter item id (`dlq_…`).
pub fn dlq_id() -> String {
    format!("dlq_{}", random_suffix())
}

/// Mint a temp-upload id (`tmp_…`).
pub fn temp_upload_id() -> String {
    format!("{TEMP_UPLOAD_PREFIX}{}", random_suffix())
}

/// Whether a string looks like a temp-upload id.
pub fn is_temp_upload_id(s: &str) -> bool {
    s.strip_prefix(TEMP_UPLOAD_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Recursively collect every temp-upload id appearing as a string value
/// anywhere in a JSON tree. Dispatch uses this to claim uploads referenced
/// by a run's input.
pub fn collect_temp_upload_ids(value: &serde_json::Value, out: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::String(s) => {
            if is_temp_upload_id(s) {
                out.insert(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_temp_upload_ids(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_temp_upload_ids(item, out);
            }
        }
        _ => {}
    }
}
