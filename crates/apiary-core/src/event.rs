use crate::canon::canonical_bytes_without;
use crate::error::{KernelError, Result};
use crate::hash::{is_sha256_hex, sha256_hex};
use crate::kind::{DecodedKind, EventKind, SegmentClass};
use crate::types::{parse_ts, Event, EventId, ScopeId, SCHEMA_VERSION};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Compute the hash for an event: canonical JSON of every field except
/// `hash`, then SHA-256.
pub fn compute_event_hash(event: &Event) -> Result<String> {
    let value = serde_json::to_value(event)?;
    Ok(sha256_hex(&canonical_bytes_without(&value, &["hash"])))
}

/// Recompute and compare. `false` also covers unserializable events.
pub fn verify_event_hash(event: &Event) -> bool {
    compute_event_hash(event).is_ok_and(|h| h == event.hash)
}

/// Monotonic within the process, lexically sortable across processes.
pub fn new_event_id() -> EventId {
    static GENERATOR: OnceLock<Mutex<ulid::Generator>> = OnceLock::new();
    let ulid = GENERATOR
        .get_or_init(|| Mutex::new(ulid::Generator::new()))
        .lock()
        .ok()
        .and_then(|mut gen| gen.generate().ok())
        .unwrap_or_else(ulid::Ulid::new);
    format!("evt_{}", ulid.to_string().to_lowercase())
}

pub fn now_rfc3339() -> String {
    format_ts(time::OffsetDateTime::now_utc())
}

fn format_ts(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .expect("RFC3339 formatting should not fail")
}

/// An event before it is chained: everything the submitter decides.
/// `id`, `ts`, `prev_hash` and `hash` are assigned when sealing.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub scope_id: Option<ScopeId>,
    pub kind: String,
    pub actor: String,
    pub payload: serde_json::Value,
    pub parents: Vec<EventId>,
}

impl EventDraft {
    pub fn new(kind: EventKind, actor: &str, payload: serde_json::Value) -> Self {
        Self::raw(kind.as_str(), actor, payload)
    }

    /// Draft with an arbitrary kind string, known or not.
    pub fn raw(kind: &str, actor: &str, payload: serde_json::Value) -> Self {
        Self {
            scope_id: None,
            kind: kind.to_string(),
            actor: actor.to_string(),
            payload,
            parents: Vec::new(),
        }
    }

    pub fn in_run(mut self, run_id: &str) -> Self {
        self.scope_id = Some(run_id.to_string());
        self
    }

    pub fn in_scope(mut self, scope_id: Option<&str>) -> Self {
        self.scope_id = scope_id.map(str::to_string);
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EventId>,
    {
        for p in parents {
            let p = p.into();
            if !self.parents.contains(&p) {
                self.parents.push(p);
            }
        }
        self
    }
}

/// Seal a draft onto a chain tip.
///
/// The timestamp is clamped to `not_before` (the tip's timestamp) so that
/// chain order within a segment is also timestamp order.
pub fn seal(draft: EventDraft, prev_hash: Option<&str>, not_before: Option<&str>) -> Result<Event> {
    let now = time::OffsetDateTime::now_utc();
    let ts = match not_before.and_then(parse_ts) {
        Some(floor) if floor > now => format_ts(floor),
        _ => format_ts(now),
    };
    let mut event = Event {
        id: new_event_id(),
        scope_id: draft.scope_id,
        kind: draft.kind,
        ts,
        actor: draft.actor,
        payload: draft.payload,
        parents: draft.parents,
        prev_hash: prev_hash.map(str::to_string),
        hash: String::new(),
        schema_version: SCHEMA_VERSION,
    };
    event.hash = compute_event_hash(&event)?;
    Ok(event)
}

/// Structural validation of a candidate event: required fields, payload
/// schema for known kinds, scope rule, parent set shape.
///
/// Unknown kinds only get the envelope checks so that newer writers'
/// events still round-trip.
pub fn validate_event(event: &Event) -> Result<()> {
    if !event.id.starts_with("evt_") || event.id.len() <= 4 {
        return Err(KernelError::validation(format!(
            "event id `{}` is not of the form evt_<ulid>",
            event.id
        )));
    }
    if event.kind.trim().is_empty() {
        return Err(KernelError::validation(format!("{}: empty kind", event.id)));
    }
    if event.actor.trim().is_empty() {
        return Err(KernelError::validation(format!("{}: empty actor", event.id)));
    }
    if !is_sha256_hex(&event.hash) {
        return Err(KernelError::validation(format!("{}: hash is not a sha256 digest", event.id)));
    }
    if let Some(prev) = event.prev_hash.as_deref().filter(|p| !is_sha256_hex(p)) {
        return Err(KernelError::validation(format!(
            "{}: prev_hash `{prev}` is not a sha256 digest",
            event.id
        )));
    }
    if parse_ts(&event.ts).is_none() {
        return Err(KernelError::validation(format!(
            "{}: timestamp `{}` is not RFC 3339",
            event.id, event.ts
        )));
    }
    let Some(payload) = event.payload.as_object() else {
        return Err(KernelError::validation(format!(
            "{}: payload must be a JSON object",
            event.id
        )));
    };

    let mut seen = HashSet::new();
    for parent in &event.parents {
        if parent == &event.id {
            return Err(KernelError::validation(format!(
                "{}: event lists itself as a parent",
                event.id
            )));
        }
        if !seen.insert(parent.as_str()) {
            return Err(KernelError::validation(format!(
                "{}: duplicate parent {parent}",
                event.id
            )));
        }
    }

    let DecodedKind::Known(kind) = event.decoded_kind() else {
        return Ok(());
    };

    match (kind.segment(), event.scope_id.as_deref()) {
        (SegmentClass::Run, None) => {
            return Err(KernelError::validation(format!(
                "{}: `{kind}` must be scoped to a run",
                event.id
            )));
        }
        (SegmentClass::Project, Some(scope)) => {
            return Err(KernelError::validation(format!(
                "{}: `{kind}` belongs to the project segment, not run `{scope}`",
                event.id
            )));
        }
        (_, Some(scope)) if scope.trim().is_empty() => {
            return Err(KernelError::validation(format!("{}: empty scope id", event.id)));
        }
        _ => {}
    }

    for field in kind.spec().required {
        match payload.get(field.name) {
            Some(value) if field.ty.matches(value) => {}
            Some(_) => {
                return Err(KernelError::validation(format!(
                    "{}: `{kind}` payload field `{}` must be a {}",
                    event.id,
                    field.name,
                    field.ty.as_str()
                )));
            }
            None => {
                return Err(KernelError::validation(format!(
                    "{}: `{kind}` payload is missing `{}`",
                    event.id, field.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_started(run: &str) -> EventDraft {
        EventDraft::new(EventKind::RunStarted, "alice", json!({"group_id": "g1"})).in_run(run)
    }

    #[test]
    fn sealed_event_has_id_and_hash() {
        let event = seal(run_started("r1"), None, None).unwrap();
        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.hash.len(), 64);
        assert!(event.prev_hash.is_none());
        assert_eq!(event.schema_version, SCHEMA_VERSION);
        assert!(verify_event_hash(&event));
        validate_event(&event).unwrap();
    }

    #[test]
    fn prev_hash_is_covered_by_hash() {
        let e1 = seal(run_started("r1"), None, None).unwrap();
        let mut e2 = seal(run_started("r1"), Some(&e1.hash), None).unwrap();
        assert_eq!(e2.prev_hash.as_deref(), Some(e1.hash.as_str()));
        e2.prev_hash = None;
        assert!(!verify_event_hash(&e2));
    }

    #[test]
    fn any_field_mutation_breaks_hash() {
        let event = seal(
            run_started("r1").with_parents(["evt_parent"]),
            None,
            None,
        )
        .unwrap();
        let mut a = event.clone();
        a.actor = "mallory".into();
        let mut b = event.clone();
        b.payload["group_id"] = json!("g2");
        let mut c = event.clone();
        c.parents.clear();
        let mut d = event.clone();
        d.schema_version = 99;
        for tampered in [a, b, c, d] {
            assert!(!verify_event_hash(&tampered));
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let ids: Vec<String> = (0..50).map(|_| new_event_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn timestamp_clamped_to_tip() {
        let future = "2999-01-01T00:00:00Z";
        let event = seal(run_started("r1"), None, Some(future)).unwrap();
        assert_eq!(event.timestamp(), parse_ts(future));
    }

    #[test]
    fn missing_required_field_rejected() {
        let event = seal(
            EventDraft::new(EventKind::TaskCreated, "alice", json!({"task_id": "t1"})).in_run("r1"),
            None,
            None,
        )
        .unwrap();
        let err = validate_event(&event).unwrap_err();
        assert!(err.to_string().contains("missing `title`"), "{err}");
    }

    #[test]
    fn wrong_field_type_rejected() {
        let event = seal(
            EventDraft::new(
                EventKind::DecisionProposed,
                "alice",
                json!({"decision_id": "d1", "key": "k", "title": "t", "options": "a,b"}),
            ),
            None,
            None,
        )
        .unwrap();
        let err = validate_event(&event).unwrap_err();
        assert!(err.to_string().contains("must be a array"), "{err}");
    }

    #[test]
    fn scope_rules_enforced() {
        let unscoped_run = seal(
            EventDraft::new(EventKind::RunStarted, "alice", json!({"group_id": "g1"})),
            None,
            None,
        )
        .unwrap();
        assert!(validate_event(&unscoped_run).is_err());

        let scoped_group = seal(
            EventDraft::new(
                EventKind::GroupCreated,
                "alice",
                json!({"group_id": "g1", "project_id": "p1", "name": "n"}),
            )
            .in_run("r1"),
            None,
            None,
        )
        .unwrap();
        assert!(validate_event(&scoped_group).is_err());
    }

    #[test]
    fn unknown_kind_only_needs_envelope() {
        let event = seal(
            EventDraft::raw("swarm.formed", "alice", json!({"anything": 1})),
            None,
            None,
        )
        .unwrap();
        validate_event(&event).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(verify_event_hash(&back));
    }

    #[test]
    fn self_parent_rejected() {
        let mut event = seal(run_started("r1"), None, None).unwrap();
        event.parents.push(event.id.clone());
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn non_object_payload_rejected() {
        let event = seal(EventDraft::raw("custom", "alice", json!([1, 2])), None, None).unwrap();
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn malformed_digests_rejected() {
        let mut event = seal(run_started("r1"), Some(&"0".repeat(64)), None).unwrap();
        validate_event(&event).unwrap();
        event.prev_hash = Some("not-a-digest".into());
        let err = validate_event(&event).unwrap_err();
        assert!(err.to_string().contains("prev_hash"), "{err}");
        event.prev_hash = None;
        event.hash = event.hash.to_uppercase();
        assert!(validate_event(&event).is_err());
    }
}
