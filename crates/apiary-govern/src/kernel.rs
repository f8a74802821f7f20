//! The governance kernel: every mutation goes intent → policy gate →
//! state-machine admission → segment append, under the segment's writer
//! lock, so check-then-act is atomic.
//!
//! A colliding claim is stored in the same batch as its conflict record.
//! Other reactions to stored events (safety alerts, group auto-completion)
//! are submitted back through the same path after the commit.

use crate::claims::{Claim, ClaimRegistry};
use crate::conflict::{detect, plan_resolution, DetectedConflict, Resolution};
use crate::intent::Intent;
use crate::safety::{Alert, SafetyMonitor};
use apiary_core::config::GovernanceConfig;
use apiary_core::event::{new_event_id, seal, validate_event, EventDraft};
use apiary_core::policy::{authorize, ActionClass, PolicyOutcome, TrustLevel};
use apiary_core::{
    EntityKind, Event, EventKind, KernelError, Result, SAFETY_MONITOR_ACTOR, SYSTEM_ACTOR,
};
use apiary_derive::machine::{ApprovalState, GroupState};
use apiary_derive::{Limits, Projection, World};
use apiary_ledger::{
    ApiaryPaths, ChainReport, Direction, EventStore, LineageIndex, LineageResult, RetryPolicy,
};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

const BROADCAST_CAPACITY: usize = 1024;

/// Who an item of a commit comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A collaborator's intent: gated by policy.
    External,
    /// Written by the kernel on its own behalf: admitted, never gated.
    Internal,
}

/// Id for a kernel-created entity, e.g. `cfl_01h...`.
pub(crate) fn fresh_id(prefix: &str) -> String {
    let id = new_event_id();
    format!("{prefix}_{}", id.trim_start_matches("evt_"))
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct Kernel {
    store: EventStore,
    config: GovernanceConfig,
    limits: Limits,
    claims: Mutex<ClaimRegistry>,
    safety: SafetyMonitor,
    events: broadcast::Sender<Event>,
    changed: Notify,
}

impl Kernel {
    /// Open a workspace, reading `.apiary/governance.yaml` when present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let paths = ApiaryPaths::discover(root.clone());
        let config = GovernanceConfig::load(&paths.config_yaml)
            .map_err(|e| KernelError::validation(format!("{e:#}")))?;
        Self::with_config(root, config)
    }

    pub fn with_config(root: impl Into<PathBuf>, config: GovernanceConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KernelError::validation(format!("{e:#}")))?;
        let store = EventStore::open(root, RetryPolicy::from_config(&config.thresholds))?;
        let claims = ClaimRegistry::rebuild(&store.replay_all()?);
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        tracing::info!(
            root = %store.paths().root.display(),
            events = store.len(),
            claims = claims.len(),
            "kernel opened"
        );
        Ok(Self {
            limits: Limits::from_config(&config),
            safety: SafetyMonitor::new(&config.safety, &config.thresholds),
            claims: Mutex::new(claims),
            store,
            config,
            events,
            changed: Notify::new(),
        })
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Every event appended from now on, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ── Queries ──

    /// Fresh fold of the whole ledger.
    pub fn world(&self) -> Result<World> {
        Ok(World::fold(&self.store.replay_all()?))
    }

    pub fn projection(&self, entity: EntityKind, id: &str) -> Result<Projection> {
        self.world()?
            .projection(entity, id)
            .ok_or_else(|| KernelError::NotFound {
                entity,
                id: id.to_string(),
            })
    }

    /// Causal neighbourhood of an event. Unknown ids give an empty result.
    pub fn lineage(&self, id: &str, direction: Direction, max_depth: usize) -> Result<LineageResult> {
        let events = self.store.replay_all()?;
        Ok(LineageIndex::from_events(&events).lineage(id, direction, max_depth))
    }

    pub fn verify(&self) -> Result<Vec<ChainReport>> {
        self.store.verify_all()
    }

    pub(crate) fn claim_registry(&self) -> ClaimRegistry {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn active_claims(&self) -> Vec<Claim> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active()
            .to_vec()
    }

    // ── Submission ──

    /// Gate, admit and append one intent. Returns the stored events, which
    /// include any synthetic events the intent implies (forced completion
    /// cancellations, decision supersession) in append order.
    pub fn submit(&self, intent: Intent) -> Result<Vec<Event>> {
        let scope = intent.scope().map(str::to_string);
        self.commit(scope.as_deref(), vec![(intent, Origin::External)])
    }

    /// Several intents for one segment, appended all-or-nothing.
    pub fn submit_batch(&self, intents: Vec<Intent>) -> Result<Vec<Event>> {
        let Some(first) = intents.first() else {
            return Ok(Vec::new());
        };
        let scope = first.scope().map(str::to_string);
        if let Some(stray) = intents.iter().find(|i| i.scope() != scope.as_deref()) {
            return Err(KernelError::validation(format!(
                "batch mixes segments: `{}` is scoped to {:?}, batch to {:?}",
                stray.kind(),
                stray.scope(),
                scope
            )));
        }
        let items = intents.into_iter().map(|i| (i, Origin::External)).collect();
        self.commit(scope.as_deref(), items)
    }

    /// Append events on the kernel's own behalf.
    pub(crate) fn record(&self, scope: Option<&str>, intents: Vec<Intent>) -> Result<Vec<Event>> {
        let items = intents.into_iter().map(|i| (i, Origin::Internal)).collect();
        self.commit(scope, items)
    }

    pub(crate) fn commit(
        &self,
        scope: Option<&str>,
        items: Vec<(Intent, Origin)>,
    ) -> Result<Vec<Event>> {
        for (intent, origin) in &items {
            if *origin == Origin::External && intent.actor() == SAFETY_MONITOR_ACTOR {
                tracing::warn!(kind = intent.kind(), "reserved actor rejected");
                return Err(KernelError::PolicyDenied {
                    actor: intent.actor().to_string(),
                    kind: intent.kind().to_string(),
                    action: action_class(intent.kind()),
                    reason: format!("actor `{SAFETY_MONITOR_ACTOR}` is reserved for the safety monitor"),
                });
            }
        }

        let (stored, world) = self.store.with_segment(scope, |writer| {
            let mut world = World::fold(&self.store.replay_all()?);
            let mut registry = self.claims.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let mut sealed: Vec<Event> = Vec::new();
            let mut pending: VecDeque<(Intent, Origin)> = items.into();
            while let Some((intent, origin)) = pending.pop_front() {
                for (intent, origin) in self.expand(&world, intent, origin) {
                    if origin == Origin::External {
                        self.gate(&world, &intent)?;
                    }
                    let mut draft = intent.draft;
                    self.stamp(&world, &mut draft);
                    let prev = sealed.last().or(writer.tip());
                    let event = seal(
                        draft,
                        prev.map(|e| e.hash.as_str()),
                        prev.map(|e| e.ts.as_str()),
                    )?;
                    validate_event(&event)?;
                    world.admit(&event, &self.limits)?;
                    world.apply(&event)?;
                    registry.observe(&event);
                    // A colliding claim is stored together with its conflict record.
                    if let Some(conflict) = Claim::from_event(&event)
                        .and_then(|claim| detect(&claim, registry.active()))
                    {
                        let plan = plan_resolution(&conflict, &registry, &self.config.conflict);
                        for reaction in self.conflict_intents(conflict, plan).into_iter().rev() {
                            pending.push_front((reaction, Origin::Internal));
                        }
                    }
                    sealed.push(event);
                }
            }
            let stored = writer.append_events(sealed)?;
            let mut live = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            for event in &stored {
                live.observe(event);
            }
            Ok((stored, world))
        })?;

        if let Some(first) = stored.first() {
            tracing::info!(
                kind = %first.kind,
                actor = %first.actor,
                scope = first.scope_id.as_deref().unwrap_or("project"),
                events = stored.len(),
                "intent accepted"
            );
        }
        self.after_commit(&stored, &world)?;
        Ok(stored)
    }

    /// Policy gate for one external intent.
    fn gate(&self, world: &World, intent: &Intent) -> Result<()> {
        let kind = intent.kind();
        let action = action_class(kind);
        let configured = self.config.policy.trust_of(intent.actor());
        let trust: TrustLevel = intent.trust.map_or(configured, |asserted| asserted.min(configured));
        let deny = |reason: String| {
            tracing::warn!(actor = intent.actor(), kind, %action, %trust, %reason, "policy denied");
            KernelError::PolicyDenied {
                actor: intent.actor().to_string(),
                kind: kind.to_string(),
                action,
                reason,
            }
        };
        match authorize(trust, action) {
            PolicyOutcome::Allow => Ok(()),
            PolicyOutcome::Deny { reason } => Err(deny(reason.to_string())),
            PolicyOutcome::RequireApproval { reason } => {
                let verdict = matches!(
                    EventKind::parse(kind),
                    Some(EventKind::ApprovalApproved | EventKind::ApprovalRejected)
                );
                if verdict {
                    return Err(deny(format!("approval verdicts cannot wait on approval: {reason}")));
                }
                let Some(approval_id) = intent.approval_id.as_deref() else {
                    return Err(KernelError::ApprovalRequired {
                        kind: kind.to_string(),
                        approval_id: "none".to_string(),
                        state: "not requested".to_string(),
                    });
                };
                let Some(approval) = world.approvals.get(approval_id) else {
                    return Err(KernelError::NotFound {
                        entity: EntityKind::ApprovalRequest,
                        id: approval_id.to_string(),
                    });
                };
                if approval.action != kind {
                    return Err(KernelError::validation(format!(
                        "approval `{approval_id}` covers `{}`, not `{kind}`",
                        approval.action
                    )));
                }
                if approval.state != ApprovalState::Approved {
                    return Err(KernelError::ApprovalRequired {
                        kind: kind.to_string(),
                        approval_id: approval_id.to_string(),
                        state: approval.state.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Synthetic events an intent implies, in append order, ending with
    /// the intent itself.
    fn expand(&self, world: &World, intent: Intent, origin: Origin) -> Vec<(Intent, Origin)> {
        let mut out = Vec::new();
        match EventKind::parse(intent.kind()) {
            Some(EventKind::RunCompleted) if intent.draft.payload["force"] == true => {
                let run_id = intent.scope().unwrap_or_default().to_string();
                let plan = world.completion_plan(&run_id);
                for task_id in plan.tasks {
                    out.push((
                        Intent::new(
                            EventKind::TaskCancelled,
                            SYSTEM_ACTOR,
                            json!({"task_id": task_id, "reason": "forced run completion"}),
                        )
                        .in_run(&run_id),
                        Origin::Internal,
                    ));
                }
                for approval_id in plan.approvals {
                    out.push((
                        Intent::new(
                            EventKind::ApprovalCancelled,
                            SYSTEM_ACTOR,
                            json!({"approval_id": approval_id, "reason": "forced run completion"}),
                        )
                        .in_run(&run_id),
                        Origin::Internal,
                    ));
                }
                out.push((intent, origin));
            }
            Some(EventKind::DecisionApplied) => {
                let decision_id = intent.draft.payload["decision_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let Some(decision) = world.decisions.get(&decision_id) else {
                    return vec![(intent, origin)];
                };
                let mut parents = vec![decision.proposal_event.clone()];
                if let Some(conference) = decision
                    .conference_id
                    .as_deref()
                    .and_then(|c| world.conferences.get(c))
                {
                    parents.extend(conference.opinion_events());
                }
                if let Some(prior) = world
                    .applied_decision(&decision.key)
                    .filter(|d| d.decision_id != decision_id)
                {
                    out.push((
                        Intent::new(
                            EventKind::DecisionSuperseded,
                            intent.actor(),
                            json!({"decision_id": prior.decision_id, "superseded_by": decision_id}),
                        )
                        .with_parents([prior.proposal_event.clone()]),
                        Origin::Internal,
                    ));
                }
                out.push((intent.with_parents(parents), origin));
            }
            _ => out.push((intent, origin)),
        }
        out
    }

    /// Kernel-owned payload fields.
    fn stamp(&self, world: &World, draft: &mut EventDraft) {
        if draft.kind != EventKind::TaskFailed.as_str() {
            return;
        }
        let Some(payload) = draft.payload.as_object_mut() else {
            return;
        };
        let wants_retry = ["retry", "retryable"]
            .iter()
            .any(|k| payload.get(*k).and_then(|v| v.as_bool()) == Some(true));
        let task_id = payload.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
        let budget_left = world
            .tasks
            .get(task_id)
            .is_some_and(|t| t.retries < self.limits.max_retries);
        payload.insert("retry".into(), json!(wants_retry && budget_left));
    }

    // ── Reactions ──

    /// Broadcast, wake waiters, then react. The events are already stored
    /// when this fails; the error names the reaction that could not be
    /// recorded.
    fn after_commit(&self, stored: &[Event], world: &World) -> Result<()> {
        if stored.is_empty() {
            return Ok(());
        }
        for event in stored {
            // No receivers is fine.
            let _ = self.events.send(event.clone());
        }
        self.changed.notify_waiters();

        let mut alerts: Vec<Alert> = Vec::new();
        for event in stored {
            let run_group = event
                .scope_id
                .as_deref()
                .and_then(|run| world.runs.get(run))
                .map(|r| r.group_id.as_str());
            alerts.extend(self.safety.observe(event, run_group));
        }
        let mut failure: Option<KernelError> = None;
        for alert in alerts {
            if let Err(e) = self.raise_alert(&alert, world) {
                tracing::error!(alert = %alert.kind, error = %e, "safety alert could not be recorded");
                failure.get_or_insert(e);
            }
        }

        for event in stored {
            let Some(kind) = EventKind::parse(&event.kind) else {
                continue;
            };
            if kind.entity() != Some(EntityKind::Run) || !kind.is_terminal_for_scope() {
                continue;
            }
            let Some(run) = event.scope_id.as_deref().and_then(|r| world.runs.get(r)) else {
                continue;
            };
            if world.group_ready_to_complete(&run.group_id) {
                let intent = Intent::new(
                    EventKind::GroupCompleted,
                    SYSTEM_ACTOR,
                    json!({"group_id": run.group_id, "reason": "all runs terminal"}),
                )
                .with_parents([event.id.clone()]);
                match self.record(None, vec![intent]) {
                    Ok(_) => tracing::info!(group = %run.group_id, "group auto-completed"),
                    Err(e) => tracing::warn!(group = %run.group_id, error = %e, "group auto-completion rejected"),
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// The conflict record for a colliding claim and, when it can be
    /// settled now, its resolution and the losing claims' denials.
    fn conflict_intents(&self, conflict: DetectedConflict, plan: Resolution) -> Vec<Intent> {
        let conflict_id = fresh_id("cfl");
        let claim_events: Vec<String> = conflict.claims.iter().map(|c| c.event_id.clone()).collect();
        let refs: Vec<_> = conflict.claims.iter().map(Claim::to_ref).collect();
        tracing::warn!(
            conflict = %conflict_id,
            resource = %conflict.resource,
            severity = %conflict.severity,
            claims = refs.len(),
            "resource conflict detected"
        );
        let mut intents = vec![Intent::new(
            EventKind::ConflictDetected,
            SYSTEM_ACTOR,
            json!({
                "conflict_id": conflict_id,
                "resource": conflict.resource,
                "severity": conflict.severity.as_str(),
                "claims": refs,
            }),
        )
        .with_parents(claim_events)];
        match plan {
            Resolution::Auto { strategy, winner } => {
                intents.extend(self.resolution_intents(
                    &conflict_id,
                    strategy.as_str(),
                    &winner,
                    &conflict.claims,
                    None,
                ));
            }
            Resolution::Escalate { target } => {
                intents.push(Intent::new(
                    EventKind::ConflictEscalated,
                    SYSTEM_ACTOR,
                    json!({"conflict_id": conflict_id, "target": target}),
                ));
            }
        }
        intents
    }

    /// `conflict.resolved` plus a `claim.denied` per losing claim.
    pub(crate) fn resolution_intents(
        &self,
        conflict_id: &str,
        strategy: &str,
        winner: &str,
        claims: &[Claim],
        conference_id: Option<&str>,
    ) -> Vec<Intent> {
        let mut resolved = json!({
            "conflict_id": conflict_id,
            "strategy": strategy,
            "winner": winner,
        });
        if let Some(conference_id) = conference_id {
            resolved["conference_id"] = json!(conference_id);
        }
        let mut intents = vec![Intent::new(EventKind::ConflictResolved, SYSTEM_ACTOR, resolved)];
        for loser in claims.iter().filter(|c| c.group_id != winner) {
            intents.push(
                Intent::new(
                    EventKind::ClaimDenied,
                    SYSTEM_ACTOR,
                    json!({
                        "group_id": loser.group_id,
                        "resource": loser.resource,
                        "reason": format!("lost conflict `{conflict_id}` to `{winner}`"),
                        "conflict_id": conflict_id,
                    }),
                )
                .with_parents([loser.event_id.clone()]),
            );
        }
        intents
    }

    fn raise_alert(&self, alert: &Alert, world: &World) -> Result<Vec<Event>> {
        let mut intents = vec![Intent::new(EventKind::SafetyAlert, SAFETY_MONITOR_ACTOR, alert.payload())
            .with_parents([alert.trigger.clone()])];
        if self.config.safety.auto_suspend {
            if let Some(group_id) = alert
                .group_id
                .as_deref()
                .filter(|g| world.groups.get(*g).is_some_and(|v| v.state == GroupState::Active))
            {
                intents.push(Intent::new(
                    EventKind::GroupSuspended,
                    SAFETY_MONITOR_ACTOR,
                    json!({
                        "group_id": group_id,
                        "reason": format!("safety: {} ({})", alert.kind, alert.detail),
                    }),
                ));
            }
        }
        self.record(None, intents)
    }

    // ── Hierarchy helpers ──

    /// Create a Group, optionally staffed from a configured swarm template.
    pub fn create_group(
        &self,
        actor: &str,
        project_id: &str,
        group_id: &str,
        name: &str,
        template: Option<&str>,
        auto_complete: bool,
    ) -> Result<Event> {
        let mut payload = json!({
            "group_id": group_id,
            "project_id": project_id,
            "name": name,
            "auto_complete": auto_complete,
        });
        if let Some(template) = template {
            let roles = self.config.swarm_template(template).ok_or_else(|| {
                KernelError::validation(format!("unknown swarm template `{template}`"))
            })?;
            payload["template"] = json!(template);
            payload["roles"] = serde_json::to_value(roles)?;
        }
        single(self.submit(Intent::new(EventKind::GroupCreated, actor, payload))?)
    }

    /// Complete a Run. With `force`, non-terminal Tasks and pending
    /// approvals are cancelled in the same batch.
    pub fn complete_run(&self, actor: &str, run_id: &str, force: bool) -> Result<Vec<Event>> {
        let payload = if force { json!({"force": true}) } else { json!({}) };
        self.submit(Intent::new(EventKind::RunCompleted, actor, payload).in_run(run_id))
    }
}

/// The last stored event of a commit: the intent itself.
pub(crate) fn single(mut stored: Vec<Event>) -> Result<Event> {
    stored
        .pop()
        .ok_or_else(|| KernelError::validation("nothing was appended"))
}

/// Unknown kinds are gated as reversible.
fn action_class(kind: &str) -> ActionClass {
    EventKind::parse(kind)
        .map(EventKind::action_class)
        .unwrap_or(ActionClass::Reversible)
}
