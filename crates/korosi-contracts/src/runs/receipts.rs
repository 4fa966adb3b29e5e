use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::prediction::Prediction;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSource {
    pub path: String,
    pub url: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// `generated`, `missing_credential` or `failed`.
    pub status: String,
    pub path: Option<String>,
    pub model: Option<String>,
}

/// Summary of one detection run, written as `detection.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReceipt {
    pub run_id: String,
    pub image_path: String,
    pub prediction: Prediction,
    pub model: ModelSource,
    pub report: Option<ReportSummary>,
    pub started_at: String,
    pub finished_at: String,
}

pub fn build_receipt(receipt: &DetectionReceipt, extra: Option<&Map<String, Value>>) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    if let Value::Object(fields) = serde_json::to_value(receipt).unwrap_or(Value::Null) {
        root.extend(fields);
    }
    root.insert(
        "confidence_text".to_string(),
        Value::String(receipt.prediction.confidence_text()),
    );
    root.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            root.insert(key.clone(), value.clone());
        }
    }
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}
