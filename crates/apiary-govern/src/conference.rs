//! Conferences: structured deliberation between participants.
//!
//! A conference gathers one opinion per participant and concludes once a
//! single option holds a quorum of approvals, or with `no_decision` when the
//! vote times out. A decided conference applies its linked Decision or
//! settles its linked Conflict in the same batch as the conclusion.

use crate::intent::Intent;
use crate::kernel::{fresh_id, millis, single, Kernel};
use crate::resolver::claims_of;
use apiary_core::{EntityKind, Event, EventKind, KernelError, Result, SYSTEM_ACTOR};
use apiary_derive::machine::{ConferenceState, ConflictState};
use apiary_derive::projection::ConferenceView;
use apiary_derive::Stance;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

/// What to deliberate on and who takes part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConferenceSpec {
    /// Generated when absent.
    pub conference_id: Option<String>,
    pub topic: String,
    pub participants: Vec<String>,
    /// Empty means free-form: any option is accepted.
    pub options: Vec<String>,
    /// Configured default when absent.
    pub quorum_percentage: Option<u32>,
    pub conflict_id: Option<String>,
    pub decision_id: Option<String>,
}

/// A conference that reached quorum.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceOutcome {
    pub conference_id: String,
    pub selected: String,
    /// Events written on conclusion, `conference.concluded` first.
    pub events: Vec<Event>,
}

impl Kernel {
    /// Open a conference. A linked Decision moves to voting and a linked,
    /// still-open Conflict is escalated to it, in the same batch.
    pub fn open_conference(&self, actor: &str, spec: ConferenceSpec) -> Result<Event> {
        let conference_id = spec.conference_id.unwrap_or_else(|| fresh_id("cnf"));
        let quorum = spec
            .quorum_percentage
            .unwrap_or(self.config().conference.quorum_percentage);
        let mut payload = json!({
            "conference_id": conference_id,
            "topic": spec.topic,
            "participants": spec.participants,
            "options": spec.options,
            "quorum_percentage": quorum,
        });
        let mut follow_ups = Vec::new();
        if let Some(decision_id) = spec.decision_id.as_deref() {
            payload["decision_id"] = json!(decision_id);
            follow_ups.push(Intent::new(
                EventKind::DecisionVotingOpened,
                actor,
                json!({"decision_id": decision_id, "conference_id": conference_id}),
            ));
        }
        if let Some(conflict_id) = spec.conflict_id.as_deref() {
            payload["conflict_id"] = json!(conflict_id);
            if self.open_conflict(conflict_id)?.state == ConflictState::Open {
                follow_ups.push(Intent::new(
                    EventKind::ConflictEscalated,
                    actor,
                    json!({
                        "conflict_id": conflict_id,
                        "target": "conference",
                        "conference_id": conference_id,
                    }),
                ));
            }
        }
        let mut intents = vec![Intent::new(EventKind::ConferenceOpened, actor, payload)];
        intents.extend(follow_ups);
        let stored = self.submit_batch(intents)?;
        tracing::info!(conference = %conference_id, "conference opened");
        stored
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::validation("nothing was appended"))
    }

    /// Hand an escalated Conflict to a conference of `participants`, voting
    /// over the claimant Groups.
    pub fn conference_for_conflict(
        &self,
        actor: &str,
        conflict_id: &str,
        participants: Vec<String>,
    ) -> Result<Event> {
        let conflict = self.open_conflict(conflict_id)?;
        let mut options: Vec<String> = conflict.claims.iter().map(|c| c.group_id.clone()).collect();
        options.dedup();
        self.open_conference(
            actor,
            ConferenceSpec {
                topic: format!("conflict on {}", conflict.resource),
                participants,
                options,
                conflict_id: Some(conflict_id.to_string()),
                ..ConferenceSpec::default()
            },
        )
    }

    /// Record (or replace) a participant's opinion. The participant is the actor.
    pub fn record_opinion(
        &self,
        conference_id: &str,
        participant: &str,
        stance: Stance,
        option: Option<&str>,
        rationale: Option<&str>,
    ) -> Result<Event> {
        let mut payload = json!({
            "conference_id": conference_id,
            "participant": participant,
            "stance": stance.as_str(),
        });
        if let Some(option) = option {
            payload["option"] = json!(option);
        }
        if let Some(rationale) = rationale {
            payload["rationale"] = json!(rationale);
        }
        single(self.submit(Intent::new(EventKind::ConferenceOpinion, participant, payload))?)
    }

    pub fn conference(&self, conference_id: &str) -> Result<ConferenceView> {
        self.world()?
            .conferences
            .remove(conference_id)
            .ok_or_else(|| KernelError::NotFound {
                entity: EntityKind::Conference,
                id: conference_id.to_string(),
            })
    }

    /// Wait for quorum and conclude. On timeout the conference ends with
    /// `no_decision`: a linked Conflict surfaces as `ConflictUnresolved`,
    /// anything else as `QuorumNotReached`.
    pub async fn await_quorum(
        &self,
        conference_id: &str,
        timeout: Duration,
    ) -> Result<ConferenceOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let conference = self.conference(conference_id)?;
            if conference.state != ConferenceState::Open {
                return concluded_outcome(&conference);
            }
            if conference.tally().reached() {
                return self.conclude_decided(&conference);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.conclude_without_decision(&conference, timeout));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// [`Kernel::await_quorum`] with the configured voting timeout, capped
    /// by the conference time budget.
    pub async fn conclude_conference(&self, conference_id: &str) -> Result<ConferenceOutcome> {
        let conference = &self.config().conference;
        let timeout = Duration::from_secs(conference.voting_timeout_secs.min(conference.time_budget_secs));
        self.await_quorum(conference_id, timeout).await
    }

    fn conclude_decided(&self, conference: &ConferenceView) -> Result<ConferenceOutcome> {
        let tally = conference.tally();
        let selected = tally.leading.clone().unwrap_or_default();
        let id = &conference.conference_id;
        let mut intents = vec![Intent::new(
            EventKind::ConferenceConcluded,
            SYSTEM_ACTOR,
            json!({
                "conference_id": id,
                "outcome": "decided",
                "selected": selected,
                "affirmative": tally.affirmative,
                "required": tally.required,
            }),
        )
        .with_parents(conference.opinion_events())];
        if let Some(decision_id) = conference.decision_id.as_deref() {
            let rationale = format!("conference `{id}` reached quorum");
            intents.push(self.apply_intent(SYSTEM_ACTOR, decision_id, &selected, Some(&rationale)));
        }
        if let Some(conflict_id) = conference.conflict_id.as_deref() {
            let conflict = self.open_conflict(conflict_id)?;
            intents.extend(self.resolution_intents(
                conflict_id,
                "escalate",
                &selected,
                &claims_of(&conflict),
                Some(id),
            ));
        }
        let events = self.record(None, intents)?;
        tracing::info!(conference = %id, %selected, affirmative = tally.affirmative, "conference decided");
        Ok(ConferenceOutcome {
            conference_id: id.clone(),
            selected,
            events,
        })
    }

    fn conclude_without_decision(&self, conference: &ConferenceView, waited: Duration) -> KernelError {
        let id = &conference.conference_id;
        let tally = conference.tally();
        let recorded = self.record(
            None,
            vec![
                Intent::new(
                    EventKind::OperationTimeout,
                    SYSTEM_ACTOR,
                    json!({
                        "target_id": id,
                        "operation": "conference.vote",
                        "timeout_ms": millis(waited),
                    }),
                ),
                Intent::new(
                    EventKind::ConferenceConcluded,
                    SYSTEM_ACTOR,
                    json!({
                        "conference_id": id,
                        "outcome": "no_decision",
                        "affirmative": tally.affirmative,
                        "required": tally.required,
                    }),
                )
                .with_parents(conference.opinion_events()),
            ],
        );
        if let Err(e) = recorded {
            return e;
        }
        tracing::warn!(conference = %id, affirmative = tally.affirmative, required = tally.required, "conference timed out");
        match conference.conflict_id.as_deref() {
            Some(conflict_id) => KernelError::ConflictUnresolved {
                conflict_id: conflict_id.to_string(),
                reason: format!("conference `{id}` ended without a decision; user intervention required"),
            },
            None => KernelError::QuorumNotReached {
                conference_id: id.clone(),
                affirmative: tally.affirmative,
                required: tally.required,
            },
        }
    }
}

/// Outcome of a conference some other waiter already concluded.
fn concluded_outcome(conference: &ConferenceView) -> Result<ConferenceOutcome> {
    match (&conference.state, &conference.selected) {
        (ConferenceState::Decided, Some(selected)) => Ok(ConferenceOutcome {
            conference_id: conference.conference_id.clone(),
            selected: selected.clone(),
            events: Vec::new(),
        }),
        _ => {
            let tally = conference.tally();
            Err(match conference.conflict_id.as_deref() {
                Some(conflict_id) => KernelError::ConflictUnresolved {
                    conflict_id: conflict_id.to_string(),
                    reason: format!("conference `{}` ended without a decision", conference.conference_id),
                },
                None => KernelError::QuorumNotReached {
                    conference_id: conference.conference_id.clone(),
                    affirmative: tally.affirmative,
                    required: tally.required,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decisions::tests::proposal;
    use crate::kernel::tests::{config, open, seed, LEAD};
    use apiary_core::AccessMode;
    use apiary_derive::machine::DecisionState;
    use apiary_ledger::Direction;

    fn voters() -> Vec<String> {
        ["ann", "bob", "cy", "dee"].map(String::from).to_vec()
    }

    #[tokio::test]
    async fn quorum_applies_linked_decision() {
        let (_tmp, k) = open(config());
        seed(&k);
        let proposed = k.propose_decision(LEAD, &proposal("d1", "db.engine")).unwrap();
        let opened = k.open_vote(LEAD, "d1", voters(), Some(50)).unwrap();
        let cid = opened.payload_str("conference_id").to_string();
        assert_eq!(k.decision("d1").unwrap().state, DecisionState::Voting);

        let votes = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            k.record_opinion(&cid, "ann", Stance::Approve, Some("postgres"), None).unwrap();
            k.record_opinion(&cid, "bob", Stance::Reject, None, Some("too heavy")).unwrap();
            k.record_opinion(&cid, "cy", Stance::Approve, Some("postgres"), None).unwrap();
        };
        let (outcome, ()) = tokio::join!(k.await_quorum(&cid, Duration::from_secs(5)), votes);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.selected, "postgres");
        let kinds: Vec<&str> = outcome.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["conference.concluded", "decision.applied"]);

        let decision = k.decision("d1").unwrap();
        assert_eq!(decision.state, DecisionState::Applied);
        assert_eq!(decision.selected.as_deref(), Some("postgres"));

        // The applied decision traces back to its proposal and every opinion.
        let applied = &outcome.events[1];
        let up = k.lineage(&applied.id, Direction::Ancestors, 1).unwrap();
        assert!(up.ids.contains(&proposed.id));
        assert_eq!(up.ids.len(), 4);
    }

    #[tokio::test]
    async fn single_approval_times_out_without_decision() {
        let (_tmp, k) = open(config());
        seed(&k);
        let opened = k
            .open_conference(
                LEAD,
                ConferenceSpec {
                    topic: "naming".into(),
                    participants: voters(),
                    options: vec!["a".into(), "b".into()],
                    quorum_percentage: Some(50),
                    ..ConferenceSpec::default()
                },
            )
            .unwrap();
        let cid = opened.payload_str("conference_id").to_string();
        k.record_opinion(&cid, "ann", Stance::Approve, Some("a"), None).unwrap();
        assert!(k.record_opinion(&cid, "zed", Stance::Approve, Some("a"), None).is_err());

        let err = k.await_quorum(&cid, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::QuorumNotReached { affirmative: 1, required: 2, .. }
        ));
        assert_eq!(k.conference(&cid).unwrap().state, ConferenceState::NoDecision);
        let events = k.store().events(None).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == "operation.timeout" && e.payload_str("target_id") == cid));
        // Waiting again reports the same outcome without writing anything.
        let before = k.store().len();
        assert!(k.await_quorum(&cid, Duration::from_millis(1)).await.is_err());
        assert_eq!(k.store().len(), before);
    }

    #[tokio::test]
    async fn escalated_conflict_settled_by_conference() {
        let (_tmp, k) = open(config());
        seed(&k);
        k.create_group(LEAD, "p1", "g2", "docs", None, false).unwrap();
        k.register_claim(LEAD, "g1", "schema.sql", AccessMode::Exclusive).unwrap();
        let outcome = k.register_claim(LEAD, "g2", "schema.sql", AccessMode::Exclusive).unwrap();
        let conflict_id = outcome.conflict.unwrap().conflict_id;

        let opened = k.conference_for_conflict(LEAD, &conflict_id, vec!["ann".into(), "bob".into()]).unwrap();
        let cid = opened.payload_str("conference_id").to_string();
        k.record_opinion(&cid, "ann", Stance::Approve, Some("g2"), None).unwrap();
        let settled = k.await_quorum(&cid, Duration::from_secs(1)).await.unwrap();
        assert_eq!(settled.selected, "g2");

        let world = k.world().unwrap();
        let conflict = &world.conflicts[&conflict_id];
        assert_eq!(conflict.state, ConflictState::Resolved);
        assert_eq!(conflict.winner.as_deref(), Some("g2"));
        let claims = k.active_claims();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].group_id, "g2");
    }

    #[tokio::test]
    async fn deadlocked_conflict_goes_to_user() {
        let (_tmp, k) = open(config());
        seed(&k);
        k.create_group(LEAD, "p1", "g2", "docs", None, false).unwrap();
        k.register_claim(LEAD, "g1", "schema.sql", AccessMode::Write).unwrap();
        let outcome = k.register_claim(LEAD, "g2", "schema.sql", AccessMode::Write).unwrap();
        let conflict_id = outcome.conflict.unwrap().conflict_id;

        let opened = k.conference_for_conflict(LEAD, &conflict_id, voters()).unwrap();
        let cid = opened.payload_str("conference_id").to_string();
        k.record_opinion(&cid, "ann", Stance::Abstain, None, None).unwrap();
        let err = k.await_quorum(&cid, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "conflict_unresolved");
        k.resolve_conflict(LEAD, &conflict_id, "g1").unwrap();
    }
}
