//! Intents: what a collaborator asks the kernel to record.

use apiary_core::event::EventDraft;
use apiary_core::policy::TrustLevel;
use apiary_core::{EventId, EventKind};
use serde_json::Value;

/// A request to append one event, before policy and state checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub draft: EventDraft,
    /// Trust asserted by the caller. It can lower the actor's configured
    /// trust for this intent, never raise it.
    pub trust: Option<TrustLevel>,
    /// Approved request that unlocks an action the policy gate holds.
    pub approval_id: Option<String>,
}

impl Intent {
    pub fn new(kind: EventKind, actor: &str, payload: Value) -> Self {
        Self::from_draft(EventDraft::new(kind, actor, payload))
    }

    /// Intent for a kind this build may not know.
    pub fn raw(kind: &str, actor: &str, payload: Value) -> Self {
        Self::from_draft(EventDraft::raw(kind, actor, payload))
    }

    pub fn from_draft(draft: EventDraft) -> Self {
        Self {
            draft,
            trust: None,
            approval_id: None,
        }
    }

    pub fn in_run(mut self, run_id: &str) -> Self {
        self.draft = self.draft.in_run(run_id);
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EventId>,
    {
        self.draft = self.draft.with_parents(parents);
        self
    }

    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn with_approval(mut self, approval_id: &str) -> Self {
        self.approval_id = Some(approval_id.to_string());
        self
    }

    pub fn actor(&self) -> &str {
        &self.draft.actor
    }

    pub fn kind(&self) -> &str {
        &self.draft.kind
    }

    pub fn scope(&self) -> Option<&str> {
        self.draft.scope_id.as_deref()
    }
}
