//! Decision payload helpers: extraction from event payloads, key domains.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A keyed choice, as carried by `decision.proposed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionPayload {
    pub decision_id: String,
    /// Logical slot being decided, e.g. `"merge.strategy"`.
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Decision id this one explicitly replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl DecisionPayload {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Extract a `DecisionPayload` from an event payload. Empty optional
/// strings are normalized to `None`.
pub fn extract_decision(payload: &Value) -> Option<DecisionPayload> {
    let mut decision: DecisionPayload = serde_json::from_value(payload.clone()).ok()?;
    if decision.key.is_empty() || decision.decision_id.is_empty() {
        return None;
    }
    for field in [
        &mut decision.selected,
        &mut decision.rationale,
        &mut decision.supersedes,
    ] {
        if field.as_deref().is_some_and(str::is_empty) {
            *field = None;
        }
    }
    Some(decision)
}

/// Extract domain from a decision key: `"db.engine"` → `"db"`.
pub fn extract_domain(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_full_payload() {
        let payload = json!({
            "decision_id": "d1",
            "key": "merge.strategy",
            "title": "How to merge",
            "options": ["rebase", "squash"],
            "selected": "rebase",
            "rationale": "linear history"
        });
        let d = extract_decision(&payload).unwrap();
        assert_eq!(d.key, "merge.strategy");
        assert_eq!(d.options, vec!["rebase", "squash"]);
        assert_eq!(d.selected.as_deref(), Some("rebase"));
        assert!(d.supersedes.is_none());
    }

    #[test]
    fn empty_optionals_become_none() {
        let payload = json!({
            "decision_id": "d1", "key": "k", "title": "t",
            "rationale": "", "supersedes": ""
        });
        let d = extract_decision(&payload).unwrap();
        assert!(d.rationale.is_none());
        assert!(d.supersedes.is_none());
        assert!(d.options.is_empty());
    }

    #[test]
    fn missing_key_is_not_a_decision() {
        assert!(extract_decision(&json!({"decision_id": "d1", "title": "t"})).is_none());
        assert!(extract_decision(&json!({"decision_id": "d1", "key": "", "title": "t"})).is_none());
    }

    #[test]
    fn payload_round_trip() {
        let d = DecisionPayload {
            decision_id: "d9".into(),
            key: "auth.method".into(),
            title: "Auth".into(),
            options: vec!["jwt".into()],
            selected: None,
            rationale: None,
            supersedes: Some("d1".into()),
        };
        assert_eq!(extract_decision(&d.to_payload()), Some(d));
    }

    #[test]
    fn domains() {
        assert_eq!(extract_domain("db.engine"), "db");
        assert_eq!(extract_domain("auth"), "auth");
        assert_eq!(extract_domain("api.v2.style"), "api");
    }
}
