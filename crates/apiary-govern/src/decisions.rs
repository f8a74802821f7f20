//! Keyed decisions: propose, vote, apply, supersede.
//!
//! At most one Decision per key is applied at any time. Applying a new one
//! supersedes the old in the same batch, so readers never see two.

use crate::conference::ConferenceSpec;
use crate::intent::Intent;
use crate::kernel::{single, Kernel};
use apiary_core::decision::DecisionPayload;
use apiary_core::{EntityKind, Event, EventKind, KernelError, Result};
use apiary_derive::projection::DecisionView;
use serde_json::json;

impl Kernel {
    pub fn propose_decision(&self, actor: &str, proposal: &DecisionPayload) -> Result<Event> {
        if proposal.decision_id.is_empty() || proposal.key.is_empty() {
            return Err(KernelError::validation("decision needs an id and a key"));
        }
        single(self.submit(Intent::new(
            EventKind::DecisionProposed,
            actor,
            proposal.to_payload(),
        ))?)
    }

    /// Put a proposed Decision to a Conference of `participants`, voting
    /// over its options.
    pub fn open_vote(
        &self,
        actor: &str,
        decision_id: &str,
        participants: Vec<String>,
        quorum_percentage: Option<u32>,
    ) -> Result<Event> {
        let decision = self.decision(decision_id)?;
        let spec = ConferenceSpec {
            topic: decision.title.clone(),
            participants,
            options: decision.options.clone(),
            quorum_percentage,
            decision_id: Some(decision_id.to_string()),
            ..ConferenceSpec::default()
        };
        self.open_conference(actor, spec)
    }

    /// Apply `selected`. Returns the stored events: a `decision.superseded`
    /// for the key's previous Decision, if any, then `decision.applied`.
    pub fn apply_decision(
        &self,
        actor: &str,
        decision_id: &str,
        selected: &str,
        rationale: Option<&str>,
    ) -> Result<Vec<Event>> {
        self.submit(self.apply_intent(actor, decision_id, selected, rationale))
    }

    pub(crate) fn apply_intent(
        &self,
        actor: &str,
        decision_id: &str,
        selected: &str,
        rationale: Option<&str>,
    ) -> Intent {
        let mut payload = json!({"decision_id": decision_id, "selected": selected});
        if let Some(rationale) = rationale {
            payload["rationale"] = json!(rationale);
        }
        Intent::new(EventKind::DecisionApplied, actor, payload)
    }

    pub fn reject_decision(&self, actor: &str, decision_id: &str, reason: &str) -> Result<Event> {
        single(self.submit(Intent::new(
            EventKind::DecisionRejected,
            actor,
            json!({"decision_id": decision_id, "reason": reason}),
        ))?)
    }

    pub fn decision(&self, decision_id: &str) -> Result<DecisionView> {
        self.world()?
            .decisions
            .remove(decision_id)
            .ok_or_else(|| KernelError::NotFound {
                entity: EntityKind::Decision,
                id: decision_id.to_string(),
            })
    }

    /// Applied Decisions, one per key, ordered by key.
    pub fn active_decisions(&self) -> Result<Vec<DecisionView>> {
        Ok(self.world()?.active_decisions().into_iter().cloned().collect())
    }

    /// Applied Decisions whose key starts with `domain.`.
    pub fn decisions_in_domain(&self, domain: &str) -> Result<Vec<DecisionView>> {
        Ok(self
            .world()?
            .decisions_in_domain(domain)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::kernel::tests::{config, open, seed, LEAD};
    use apiary_core::decision::DecisionPayload;
    use apiary_derive::machine::DecisionState;

    pub(crate) fn proposal(id: &str, key: &str) -> DecisionPayload {
        DecisionPayload {
            decision_id: id.into(),
            key: key.into(),
            title: format!("pick {key}"),
            options: vec!["sqlite".into(), "postgres".into()],
            selected: None,
            rationale: None,
            supersedes: None,
        }
    }

    #[test]
    fn applying_second_decision_supersedes_first() {
        let (_tmp, k) = open(config());
        seed(&k);
        k.propose_decision(LEAD, &proposal("d1", "db.engine")).unwrap();
        k.apply_decision(LEAD, "d1", "sqlite", Some("simple")).unwrap();
        let d2 = k.propose_decision(LEAD, &proposal("d2", "db.engine")).unwrap();
        let stored = k.apply_decision(LEAD, "d2", "postgres", None).unwrap();

        let kinds: Vec<&str> = stored.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["decision.superseded", "decision.applied"]);
        assert_eq!(stored[1].parents, vec![d2.id]);

        let active = k.active_decisions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, "d2");
        assert_eq!(active[0].selected.as_deref(), Some("postgres"));
        let d1 = k.decision("d1").unwrap();
        assert_eq!(d1.state, DecisionState::Superseded);
        assert_eq!(d1.superseded_by.as_deref(), Some("d2"));
    }

    #[test]
    fn domain_query_and_invalid_option() {
        let (_tmp, k) = open(config());
        seed(&k);
        k.propose_decision(LEAD, &proposal("d1", "db.engine")).unwrap();
        k.propose_decision(LEAD, &proposal("d2", "api.style")).unwrap();
        assert!(k.apply_decision(LEAD, "d1", "mongo", None).is_err());
        k.apply_decision(LEAD, "d1", "sqlite", None).unwrap();
        k.apply_decision(LEAD, "d2", "postgres", None).unwrap();
        let db = k.decisions_in_domain("db").unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db[0].key, "db.engine");
        assert!(k.decisions_in_domain("ui").unwrap().is_empty());
    }

    #[test]
    fn standard_actor_needs_approval_to_apply() {
        let (_tmp, k) = open(config());
        seed(&k);
        k.propose_decision("alice", &proposal("d1", "db.engine")).unwrap();
        let err = k.apply_decision("alice", "d1", "sqlite", None).unwrap_err();
        assert_eq!(err.code(), "approval_required");
        k.reject_decision("alice", "d1", "not now").unwrap();
        assert_eq!(k.decision("d1").unwrap().state, DecisionState::Rejected);
    }
}
