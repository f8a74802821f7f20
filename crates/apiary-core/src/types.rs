use crate::kind::{decode_kind, DecodedKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current schema version for new events.
pub const SCHEMA_VERSION: u32 = 1;

/// Event ID format: `evt_<ulid>`
pub type EventId = String;

/// Run id naming a Run-scoped segment.
pub type ScopeId = String;

/// Actor id reserved for the safety monitor's privileged writes.
pub const SAFETY_MONITOR_ACTOR: &str = "safety-monitor";

/// Actor id used for events the kernel emits on its own behalf
/// (aggregate completion, synthetic cancellations, timeouts).
pub const SYSTEM_ACTOR: &str = "system";

/// A single ledger event (one JSONL line in a segment).
///
/// `hash` covers the canonical JSON of every other field, `schema_version`
/// included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    pub kind: String,
    pub ts: String,
    pub actor: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<EventId>,
    pub prev_hash: Option<String>,
    pub hash: String,
    #[serde(default)]
    pub schema_version: u32,
}

impl Event {
    pub fn decoded_kind(&self) -> DecodedKind<'_> {
        decode_kind(&self.kind)
    }

    /// String payload field, or `""` when absent.
    pub fn payload_str(&self, key: &str) -> &str {
        self.payload.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn timestamp(&self) -> Option<time::OffsetDateTime> {
        parse_ts(&self.ts)
    }
}

pub fn parse_ts(ts: &str) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339).ok()
}

/// Access mode of a resource claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    Exclusive,
}

impl AccessMode {
    pub fn is_mutating(self) -> bool {
        !matches!(self, AccessMode::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "exclusive" => Ok(AccessMode::Exclusive),
            other => Err(format!(
                "invalid access mode: {other}. Expected: read, write, exclusive"
            )),
        }
    }
}

/// Conflict severity. Ordered so thresholds compare with `<=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("invalid severity: {other}. Expected: low, medium, high")),
        }
    }
}

/// How a detected conflict gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Highest configured Group precedence wins.
    StaticPriority,
    /// The earliest registered claim wins.
    FirstClaimWins,
    /// Hand the conflict to a Conference or to the user.
    Escalate,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::StaticPriority => "static_priority",
            ResolutionStrategy::FirstClaimWins => "first_claim_wins",
            ResolutionStrategy::Escalate => "escalate",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_without_optional_fields_deserializes() {
        let json = r#"{
            "id": "evt_01",
            "kind": "project.created",
            "ts": "2026-01-01T00:00:00Z",
            "actor": "alice",
            "payload": {"project_id": "p1", "name": "demo"},
            "prev_hash": null,
            "hash": "abc"
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert!(event.scope_id.is_none());
        assert!(event.parents.is_empty());
        assert_eq!(event.schema_version, 0);
        assert_eq!(event.payload_str("name"), "demo");
        assert!(event.timestamp().is_some());
    }

    #[test]
    fn severity_orders_low_to_high() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
    }

    #[test]
    fn only_read_is_non_mutating() {
        assert!(!AccessMode::Read.is_mutating());
        assert!(AccessMode::Write.is_mutating());
        assert!(AccessMode::Exclusive.is_mutating());
    }
}
