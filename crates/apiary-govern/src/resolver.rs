//! Claim registration and the conflict lifecycle as seen by callers.
//!
//! Detection runs inside the commit that stores a `claim.registered` event
//! (see [`Kernel::submit`]); these helpers wrap that and report what
//! happened.

use crate::claims::Claim;
use crate::conflict::pick_winner;
use crate::intent::Intent;
use crate::kernel::{single, Kernel, Origin};
use apiary_core::{
    AccessMode, EntityKind, Event, EventKind, KernelError, ResolutionStrategy, Result, SYSTEM_ACTOR,
};
use apiary_derive::machine::ConflictState;
use apiary_derive::projection::ConflictView;
use serde_json::json;

/// What became of a claim after detection ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    pub event: Event,
    /// The claim is still active.
    pub granted: bool,
    /// Conflict the claim took part in, if any.
    pub conflict: Option<ConflictView>,
}

impl Kernel {
    pub fn register_claim(
        &self,
        actor: &str,
        group_id: &str,
        resource: &str,
        mode: AccessMode,
    ) -> Result<ClaimOutcome> {
        // A collision appends its conflict record behind the claim.
        let event = self
            .submit(Intent::new(
                EventKind::ClaimRegistered,
                actor,
                json!({"group_id": group_id, "resource": resource, "mode": mode.as_str()}),
            ))?
            .into_iter()
            .find(|e| e.kind == EventKind::ClaimRegistered.as_str())
            .ok_or_else(|| KernelError::validation("claim was not appended"))?;
        let granted = self.active_claims().iter().any(|c| c.event_id == event.id);
        let conflict = self
            .world()?
            .conflicts
            .into_values()
            .find(|c| c.claims.iter().any(|r| r.event_id == event.id));
        Ok(ClaimOutcome {
            event,
            granted,
            conflict,
        })
    }

    pub fn release_claim(&self, actor: &str, group_id: &str, resource: &str) -> Result<Event> {
        let held = self
            .active_claims()
            .iter()
            .any(|c| c.group_id == group_id && c.resource == resource);
        if !held {
            return Err(KernelError::NotFound {
                entity: EntityKind::Group,
                id: format!("{group_id} claim on {resource}"),
            });
        }
        single(self.submit(Intent::new(
            EventKind::ClaimReleased,
            actor,
            json!({"group_id": group_id, "resource": resource}),
        ))?)
    }

    /// User intervention on an escalated conflict: `winner` keeps its
    /// claim, every other Group in the conflict is denied.
    pub fn resolve_conflict(&self, actor: &str, conflict_id: &str, winner: &str) -> Result<Vec<Event>> {
        let conflict = self.open_conflict(conflict_id)?;
        let claims = claims_of(&conflict);
        if !claims.iter().any(|c| c.group_id == winner) {
            return Err(KernelError::validation(format!(
                "`{winner}` holds no claim in conflict `{conflict_id}`"
            )));
        }
        self.settle(actor, conflict_id, "user", winner, &claims)
    }

    /// Settle an open conflict now by `strategy`, which is recorded on the
    /// `conflict.resolved` event. `escalate` hands it to a conference.
    pub fn resolve(
        &self,
        actor: &str,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Vec<Event>> {
        let conflict = self.open_conflict(conflict_id)?;
        if strategy == ResolutionStrategy::Escalate {
            return Ok(vec![self.escalate_conflict(conflict_id, "conference")?]);
        }
        let claims = claims_of(&conflict);
        let registry = self.claim_registry();
        let winner = pick_winner(&claims, strategy, &registry, &self.config().conflict)
            .ok_or_else(|| {
                KernelError::validation(format!("conflict `{conflict_id}` has no claims to rank"))
            })?;
        tracing::info!(conflict = %conflict_id, %strategy, %winner, "conflict resolved by strategy");
        self.settle(actor, conflict_id, strategy.as_str(), &winner, &claims)
    }

    /// The verdict is the actor's and passes the policy gate; the denials
    /// follow from it.
    fn settle(
        &self,
        actor: &str,
        conflict_id: &str,
        strategy: &str,
        winner: &str,
        claims: &[Claim],
    ) -> Result<Vec<Event>> {
        let mut items: Vec<(Intent, Origin)> = Vec::new();
        for (i, intent) in self
            .resolution_intents(conflict_id, strategy, winner, claims, None)
            .into_iter()
            .enumerate()
        {
            if i == 0 {
                let mut verdict = intent;
                verdict.draft.actor = actor.to_string();
                items.push((verdict, Origin::External));
            } else {
                items.push((intent, Origin::Internal));
            }
        }
        self.commit(None, items)
    }

    /// Hand an open conflict to a human.
    pub fn escalate_conflict(&self, conflict_id: &str, target: &str) -> Result<Event> {
        let conflict = self.open_conflict(conflict_id)?;
        if conflict.state != ConflictState::Open {
            return Err(KernelError::InvalidStateTransition {
                entity: EntityKind::Conflict,
                entity_id: conflict_id.to_string(),
                from: conflict.state.to_string(),
                kind: EventKind::ConflictEscalated.as_str().to_string(),
                detail: "already escalated".to_string(),
            });
        }
        single(self.record(
            None,
            vec![Intent::new(
                EventKind::ConflictEscalated,
                SYSTEM_ACTOR,
                json!({"conflict_id": conflict_id, "target": target}),
            )],
        )?)
    }

    /// A conflict that is not yet resolved.
    pub(crate) fn open_conflict(&self, conflict_id: &str) -> Result<ConflictView> {
        let conflict = self
            .world()?
            .conflicts
            .remove(conflict_id)
            .ok_or_else(|| KernelError::NotFound {
                entity: EntityKind::Conflict,
                id: conflict_id.to_string(),
            })?;
        if conflict.state == ConflictState::Resolved {
            return Err(KernelError::InvalidStateTransition {
                entity: EntityKind::Conflict,
                entity_id: conflict_id.to_string(),
                from: conflict.state.to_string(),
                kind: EventKind::ConflictResolved.as_str().to_string(),
                detail: format!("already won by {}", conflict.winner.as_deref().unwrap_or("?")),
            });
        }
        Ok(conflict)
    }
}

pub(crate) fn claims_of(conflict: &ConflictView) -> Vec<Claim> {
    conflict
        .claims
        .iter()
        .map(|r| Claim {
            group_id: r.group_id.clone(),
            resource: r.resource.clone(),
            mode: r.mode,
            event_id: r.event_id.clone(),
        })
        .collect()
}
