//! Per-task metrics summaries and their aggregation.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Session record plus every metrics summary written for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Value>,
    /// Sum of every numeric `accumulated_usage` field.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub total_accumulated_usage: BTreeMap<String, f64>,
    /// Sum of every numeric `accumulated_metrics` field.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub total_accumulated_metrics: BTreeMap<String, f64>,
}

impl SessionInfo {
    pub fn new(session_id: &str, session_data: Option<Value>, metrics: Vec<Value>) -> Self {
        let timestamp = |field: &str| {
            session_data
                .as_ref()
                .and_then(|data| data.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let created_at = timestamp("created_at");
        let updated_at = timestamp("updated_at");

        let mut total_accumulated_usage = BTreeMap::new();
        let mut total_accumulated_metrics = BTreeMap::new();
        for summary in &metrics {
            accumulate(&mut total_accumulated_usage, summary.get("accumulated_usage"));
            accumulate(&mut total_accumulated_metrics, summary.get("accumulated_metrics"));
        }

        Self {
            session_id: session_id.to_string(),
            session_data,
            created_at,
            updated_at,
            metrics,
            total_accumulated_usage,
            total_accumulated_metrics,
        }
    }

    pub fn metrics_count(&self) -> usize {
        self.metrics.len()
    }
}

/// Remove the bulky `traces` field from an engine summary.
pub fn strip_traces(mut summary: Value) -> Value {
    if let Some(obj) = summary.as_object_mut() {
        obj.remove("traces");
    }
    summary
}

fn accumulate(totals: &mut BTreeMap<String, f64>, section: Option<&Value>) {
    let Some(fields) = section.and_then(Value::as_object) else {
        return;
    };
    for (key, value) in fields {
        // Non-numeric fields are not summable.
        if let Some(n) = value.as_f64() {
            *totals.entry(key.clone()).or_insert(0.0) += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn non_numeric_fields_are_ignored() {
        let info = SessionInfo::new(
            "s1",
            None,
            vec![
                json!({"accumulated_usage": {"inputTokens": 10, "model": "x"}}),
                json!({"accumulated_usage": {"inputTokens": 2.5}}),
                json!({"cycle_count": 3}),
            ],
        );
        assert_eq!(info.total_accumulated_usage.len(), 1);
        assert_eq!(info.total_accumulated_usage["inputTokens"], 12.5);
        assert!(info.total_accumulated_metrics.is_empty());
    }

    #[test]
    fn empty_sections_are_not_serialized() {
        let info = SessionInfo::new("s1", None, Vec::new());
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"session_id": "s1"}));
    }

    #[test]
    fn strip_traces_leaves_other_fields() {
        let stripped = strip_traces(json!({"traces": [], "total_cycles": 2}));
        assert_eq!(stripped, json!({"total_cycles": 2}));
        assert_eq!(strip_traces(json!("not an object")), json!("not an object"));
    }
}
