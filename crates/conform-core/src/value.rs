//! Scalar values carried by records, plus the JSON markers used at the
//! substrate boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key of the object that marks a calculated field as not yet computed.
pub const UNSET_KEY: &str = "$unset";

/// Key of the object that records a judge failure in fuzzy output.
pub const JUDGE_ERROR_KEY: &str = "$judge_error";

/// A typed field value.
///
/// `Absent` is the rulebook's "no value" sentinel (JSON `null`). It is a
/// real value, distinct from a calculated field that was never set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Absent,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    /// Absent or empty text.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Absent => true,
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Convert a JSON scalar. Returns `None` for arrays, objects and
    /// non-integral numbers.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Absent),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(Value::Int),
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Absent => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Text coercion used by concatenation and string functions.
    pub fn coerce_text(&self) -> String {
        match self {
            Value::Absent => String::new(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// String form used to match primary keys across files.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Value::Absent => None,
            other => Some(other.coerce_text()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => write!(f, "null"),
            Value::Text(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.coerce_text()),
        }
    }
}

/// One record: field name to value. Calculated fields that have not been
/// evaluated are simply not present.
pub type Record = BTreeMap<String, Value>;

/// The JSON object `{"$unset": true}`.
pub fn unset_marker() -> serde_json::Value {
    serde_json::json!({ UNSET_KEY: true })
}

/// The JSON object `{"$judge_error": reason}`.
pub fn judge_error_marker(reason: &str) -> serde_json::Value {
    serde_json::json!({ JUDGE_ERROR_KEY: reason })
}

/// A field value as reported by a substrate, before comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Reported {
    /// Field key not present in the record
    Missing,
    /// Field still carries the unset marker
    Unset,
    /// Fuzzy judge could not produce a value
    JudgeError(String),
    /// Any other JSON value
    Json(serde_json::Value),
}

impl Reported {
    pub fn classify(json: Option<&serde_json::Value>) -> Self {
        let Some(json) = json else {
            return Reported::Missing;
        };
        if let serde_json::Value::Object(map) = json {
            if map.get(UNSET_KEY) == Some(&serde_json::Value::Bool(true)) {
                return Reported::Unset;
            }
            if let Some(reason) = map.get(JUDGE_ERROR_KEY) {
                let reason = reason
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| reason.to_string());
                return Reported::JudgeError(reason);
            }
        }
        Reported::Json(json.clone())
    }
}
