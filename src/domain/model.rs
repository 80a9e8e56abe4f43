use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of input data. `Named` when the source carries field names (CSV
/// header or warehouse schema), `Positional` for headerless CSV rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Named(Map<String, Value>),
    Positional(Vec<Value>),
}

impl Record {
    /// The JSON value bound as `row` during template rendering, and used
    /// verbatim as the request item when no template is configured.
    pub fn into_value(self) -> Value {
        match self {
            Record::Named(fields) => Value::Object(fields),
            Record::Positional(fields) => Value::Array(fields),
        }
    }
}

/// The API-shaped payload derived from one record.
pub type RequestItem = Value;

/// Per-item outcome reported by the Salesforce collections API.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveResult {
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<SaveError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveError {
    #[serde(rename = "statusCode")]
    pub status_code: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// One record the API rejected, located by its 1-based source position.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub record: usize,
    pub errors: Vec<String>,
}

/// Aggregated outcome of a run. Nothing is persisted locally; this is what
/// gets printed at the end.
#[derive(Debug, Default, Serialize)]
pub struct DispatchSummary {
    pub batches_sent: usize,
    pub records_sent: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}
