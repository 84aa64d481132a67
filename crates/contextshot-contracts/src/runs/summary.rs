use std::path::Path;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::batch::BatchSummary;

/// Writes a finished batch as pretty JSON.
///
/// `batch_id` and `ts` are stamped on top of the serialized summary and the
/// caller's `extra` keys are merged last, so they win on collision.
pub fn write_batch_summary(
    path: &Path,
    batch_id: &str,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        other => anyhow::bail!("batch summary serialized to non-object JSON: {other}"),
    };
    payload.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    payload.insert("complete".to_string(), Value::Bool(summary.is_complete()));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
