//! Arena of every entity projection, keyed by id, with parent-id
//! back-references. Built by folding events; aggregates are recomputed on
//! demand rather than stored as counters.

use crate::machine::{
    validate_transition, ApprovalState, ConferenceState, ConflictState, DecisionState,
    GroupState, Lifecycle, ProjectState, RunState, TaskState,
};
use crate::projection::{
    ApprovalView, ClaimRef, ConferenceView, ConflictView, DecisionView, GroupView, OpinionView,
    Projection, ProjectView, RunView, Stance, TaskView,
};
use apiary_core::config::GovernanceConfig;
use apiary_core::decision::{extract_decision, extract_domain};
use apiary_core::{
    AccessMode, DecodedKind, EntityKind, Event, EventKind, KernelError, Result, Severity,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Thresholds consulted by admission rules.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_retries: u32,
    pub concurrency_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&GovernanceConfig::default())
    }
}

impl Limits {
    pub fn from_config(config: &GovernanceConfig) -> Self {
        Self {
            max_retries: config.thresholds.max_retries,
            concurrency_limit: config.thresholds.concurrency_limit,
        }
    }
}

/// A stored event the fold could not apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub event_id: String,
    pub kind: String,
    pub error: String,
}

/// Non-terminal children a forced Run completion has to cancel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionPlan {
    pub tasks: Vec<String>,
    pub approvals: Vec<String>,
}

impl CompletionPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.approvals.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct World {
    pub projects: BTreeMap<String, ProjectView>,
    pub groups: BTreeMap<String, GroupView>,
    pub runs: BTreeMap<String, RunView>,
    pub tasks: BTreeMap<String, TaskView>,
    pub approvals: BTreeMap<String, ApprovalView>,
    pub decisions: BTreeMap<String, DecisionView>,
    pub conflicts: BTreeMap<String, ConflictView>,
    pub conferences: BTreeMap<String, ConferenceView>,
    unknown_events: usize,
    anomalies: Vec<Anomaly>,
}

fn not_found(entity: EntityKind, id: &str) -> KernelError {
    KernelError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn blocked<S: Lifecycle>(id: &str, from: Option<S>, kind: EventKind, detail: String) -> KernelError {
    KernelError::InvalidStateTransition {
        entity: S::ENTITY,
        entity_id: id.to_string(),
        from: from.map(S::as_str).unwrap_or("absent").to_string(),
        kind: kind.as_str().to_string(),
        detail,
    }
}

/// Run-scope kinds still admitted while the owning Group is suspended.
fn winds_down(kind: EventKind) -> bool {
    kind.is_terminal_for_scope()
        || matches!(
            kind,
            EventKind::TaskCancelled
                | EventKind::ApprovalRejected
                | EventKind::ApprovalExpired
                | EventKind::ApprovalCancelled
        )
}

fn opt_str(event: &Event, key: &str) -> Option<String> {
    Some(event.payload_str(key))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_array(event: &Event, key: &str) -> Result<Vec<String>> {
    match event.payload.get(key) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
            KernelError::validation(format!(
                "{}: `{key}` must be an array of strings",
                event.id
            ))
        }),
    }
}

/// Entity id an event targets: its subject field, or the scope for Runs.
pub fn subject_id(kind: EventKind, event: &Event) -> Option<String> {
    match kind.spec().subject {
        Some(field) => opt_str(event, field),
        None if kind.entity() == Some(EntityKind::Run) => event.scope_id.clone(),
        None => None,
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a stream in order. Events that do not apply are recorded as
    /// anomalies and skipped; unknown kinds are counted and skipped.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut world = Self::new();
        for event in events {
            if let Err(e) = world.apply(event) {
                tracing::warn!(id = %event.id, kind = %event.kind, error = %e, "event skipped during fold");
                world.anomalies.push(Anomaly {
                    event_id: event.id.clone(),
                    kind: event.kind.clone(),
                    error: e.to_string(),
                });
            }
        }
        world
    }

    pub fn unknown_events(&self) -> usize {
        self.unknown_events
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    // ── Transition check ──

    /// State-machine check only: the event's target entity accepts `kind`
    /// in its current state.
    pub fn check_transition(&self, event: &Event) -> Result<()> {
        let DecodedKind::Known(kind) = event.decoded_kind() else {
            return Ok(());
        };
        let Some(entity) = kind.entity() else {
            return Ok(());
        };
        let id = subject_id(kind, event)
            .ok_or_else(|| KernelError::validation(format!("{}: no target id", event.id)))?;
        let p = &event.payload;
        match entity {
            EntityKind::Project => {
                validate_transition(&id, self.projects.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Group => {
                validate_transition(&id, self.groups.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Run => {
                validate_transition(&id, self.runs.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Task => {
                validate_transition(&id, self.tasks.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::ApprovalRequest => {
                validate_transition(&id, self.approvals.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Decision => {
                validate_transition(&id, self.decisions.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Conflict => {
                validate_transition(&id, self.conflicts.get(&id).map(|v| v.state), kind, p)?;
            }
            EntityKind::Conference => {
                validate_transition(&id, self.conferences.get(&id).map(|v| v.state), kind, p)?;
            }
        }
        Ok(())
    }

    // ── Admission ──

    /// Full admission check for a candidate: state machine plus the rules
    /// that span entities. Does not mutate.
    pub fn admit(&self, event: &Event, limits: &Limits) -> Result<()> {
        self.check_transition(event)?;
        let DecodedKind::Known(kind) = event.decoded_kind() else {
            return Ok(());
        };
        let id = subject_id(kind, event).unwrap_or_default();

        if kind.entity() == Some(EntityKind::Task)
            || kind.entity() == Some(EntityKind::ApprovalRequest)
        {
            self.require_running_run(event, kind)?;
        }
        let run_scoped = matches!(
            kind.entity(),
            Some(EntityKind::Run | EntityKind::Task | EntityKind::ApprovalRequest)
        );
        if run_scoped && kind != EventKind::RunStarted && !winds_down(kind) {
            self.require_unsuspended_group(event, kind)?;
        }

        match kind {
            EventKind::GroupCreated => {
                let project_id = event.payload_str("project_id");
                let project = self
                    .projects
                    .get(project_id)
                    .ok_or_else(|| not_found(EntityKind::Project, project_id))?;
                if project.state != ProjectState::Active {
                    return Err(blocked::<GroupState>(
                        &id,
                        None,
                        kind,
                        format!("project `{project_id}` is {}", project.state),
                    ));
                }
            }
            EventKind::RunStarted => {
                let group_id = event.payload_str("group_id");
                let group = self
                    .groups
                    .get(group_id)
                    .ok_or_else(|| not_found(EntityKind::Group, group_id))?;
                if group.state != GroupState::Active {
                    return Err(blocked::<RunState>(
                        &id,
                        None,
                        kind,
                        format!("group `{group_id}` is {}", group.state),
                    ));
                }
                if let Some(project) = self.projects.get(&group.project_id) {
                    if project.state != ProjectState::Active {
                        return Err(blocked::<RunState>(
                            &id,
                            None,
                            kind,
                            format!("project `{}` is {}", project.project_id, project.state),
                        ));
                    }
                }
                let running = self.running_runs(group_id);
                if running >= limits.concurrency_limit as usize {
                    return Err(blocked::<RunState>(
                        &id,
                        None,
                        kind,
                        format!(
                            "group `{group_id}` already has {running} running run(s) (limit {})",
                            limits.concurrency_limit
                        ),
                    ));
                }
            }
            EventKind::RunCompleted => {
                let plan = self.completion_plan(&id);
                if !plan.is_empty() {
                    let mut parts = Vec::new();
                    if !plan.tasks.is_empty() {
                        parts.push(format!(
                            "{} task(s) not terminal: {}",
                            plan.tasks.len(),
                            plan.tasks.join(", ")
                        ));
                    }
                    if !plan.approvals.is_empty() {
                        parts.push(format!(
                            "{} approval(s) pending: {}",
                            plan.approvals.len(),
                            plan.approvals.join(", ")
                        ));
                    }
                    return Err(blocked(
                        &id,
                        self.runs.get(&id).map(|r| r.state),
                        kind,
                        parts.join("; "),
                    ));
                }
            }
            EventKind::GroupCompleted => {
                let open: Vec<&str> = self
                    .runs_of_group(&id)
                    .filter(|r| !r.state.is_terminal())
                    .map(|r| r.run_id.as_str())
                    .collect();
                if !open.is_empty() {
                    return Err(blocked(
                        &id,
                        self.groups.get(&id).map(|g| g.state),
                        kind,
                        format!("{} run(s) not terminal: {}", open.len(), open.join(", ")),
                    ));
                }
            }
            EventKind::ProjectCompleted => {
                let open: Vec<&str> = self
                    .groups
                    .values()
                    .filter(|g| g.project_id == id && !g.state.is_terminal())
                    .map(|g| g.group_id.as_str())
                    .collect();
                if !open.is_empty() {
                    return Err(blocked(
                        &id,
                        self.projects.get(&id).map(|p| p.state),
                        kind,
                        format!("{} group(s) not terminal: {}", open.len(), open.join(", ")),
                    ));
                }
            }
            EventKind::TaskFailed => {
                if event.payload_bool("retry") {
                    if let Some(task) = self.tasks.get(&id) {
                        if task.retries >= limits.max_retries {
                            return Err(blocked(
                                &id,
                                Some(task.state),
                                kind,
                                format!(
                                    "retry budget exhausted ({}/{})",
                                    task.retries, limits.max_retries
                                ),
                            ));
                        }
                    }
                }
            }
            EventKind::DecisionProposed => {
                if let Some(prior) = opt_str(event, "supersedes") {
                    if !self.decisions.contains_key(&prior) {
                        return Err(not_found(EntityKind::Decision, &prior));
                    }
                }
            }
            EventKind::DecisionApplied => {
                if let Some(decision) = self.decisions.get(&id) {
                    let selected = event.payload_str("selected");
                    if !decision.options.is_empty()
                        && !decision.options.iter().any(|o| o == selected)
                    {
                        return Err(KernelError::validation(format!(
                            "decision `{id}`: `{selected}` is not one of its options ({})",
                            decision.options.join(", ")
                        )));
                    }
                    if let Some(current) = self.applied_decision(&decision.key) {
                        if current.decision_id != id {
                            return Err(blocked(
                                &id,
                                Some(decision.state),
                                kind,
                                format!(
                                    "key `{}` already has applied decision `{}`; supersede it first",
                                    decision.key, current.decision_id
                                ),
                            ));
                        }
                    }
                }
            }
            EventKind::DecisionSuperseded => {
                let by = event.payload_str("superseded_by");
                let successor = self
                    .decisions
                    .get(by)
                    .ok_or_else(|| not_found(EntityKind::Decision, by))?;
                if let Some(decision) = self.decisions.get(&id) {
                    if successor.key != decision.key {
                        return Err(KernelError::validation(format!(
                            "decision `{by}` has key `{}`, cannot supersede `{id}` on key `{}`",
                            successor.key, decision.key
                        )));
                    }
                }
            }
            EventKind::ConferenceOpened => {
                if str_array(event, "participants")?.is_empty() {
                    return Err(KernelError::validation(format!(
                        "conference `{id}` has no participants"
                    )));
                }
                if let Some(pct) = event.payload.get("quorum_percentage") {
                    if !pct.as_u64().is_some_and(|p| (1..=100).contains(&p)) {
                        return Err(KernelError::validation(format!(
                            "conference `{id}`: quorum_percentage must be within 1..=100"
                        )));
                    }
                }
            }
            EventKind::ConferenceOpinion => {
                if let Some(conference) = self.conferences.get(&id) {
                    let participant = event.payload_str("participant");
                    if !conference.participants.iter().any(|p| p == participant) {
                        return Err(KernelError::validation(format!(
                            "`{participant}` is not a participant of conference `{id}`"
                        )));
                    }
                    event
                        .payload_str("stance")
                        .parse::<Stance>()
                        .map_err(KernelError::Validation)?;
                    if let Some(option) = opt_str(event, "option") {
                        if !conference.options.is_empty() && !conference.options.contains(&option) {
                            return Err(KernelError::validation(format!(
                                "conference `{id}`: `{option}` is not one of its options"
                            )));
                        }
                    }
                }
            }
            EventKind::ClaimRegistered => {
                let group_id = event.payload_str("group_id");
                let group = self
                    .groups
                    .get(group_id)
                    .ok_or_else(|| not_found(EntityKind::Group, group_id))?;
                if group.state != GroupState::Active {
                    return Err(KernelError::validation(format!(
                        "group `{group_id}` is {} and cannot claim resources",
                        group.state
                    )));
                }
                event
                    .payload_str("mode")
                    .parse::<AccessMode>()
                    .map_err(KernelError::Validation)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn require_running_run(&self, event: &Event, kind: EventKind) -> Result<()> {
        let run_id = event.scope_id.as_deref().unwrap_or_default();
        let run = self
            .runs
            .get(run_id)
            .ok_or_else(|| not_found(EntityKind::Run, run_id))?;
        if run.state != RunState::Running {
            return Err(KernelError::InvalidStateTransition {
                entity: kind.entity().unwrap_or(EntityKind::Run),
                entity_id: subject_id(kind, event).unwrap_or_default(),
                from: "-".to_string(),
                kind: kind.as_str().to_string(),
                detail: format!("run `{run_id}` is {}", run.state),
            });
        }
        let id = subject_id(kind, event).unwrap_or_default();
        let owner = match kind.entity() {
            Some(EntityKind::Task) => self.tasks.get(&id).map(|t| t.run_id.as_str()),
            _ => self.approvals.get(&id).map(|a| a.run_id.as_str()),
        };
        if let Some(owner) = owner {
            if owner != run_id {
                return Err(KernelError::validation(format!(
                    "`{id}` belongs to run `{owner}`, not `{run_id}`"
                )));
            }
        }
        Ok(())
    }

    /// A suspended Group's Runs only accept events that wind work down.
    fn require_unsuspended_group(&self, event: &Event, kind: EventKind) -> Result<()> {
        let run_id = event.scope_id.as_deref().unwrap_or_default();
        let Some(group) = self.runs.get(run_id).and_then(|r| self.groups.get(&r.group_id)) else {
            return Ok(());
        };
        if group.state == GroupState::Suspended {
            return Err(KernelError::InvalidStateTransition {
                entity: kind.entity().unwrap_or(EntityKind::Run),
                entity_id: subject_id(kind, event).unwrap_or_default(),
                from: "-".to_string(),
                kind: kind.as_str().to_string(),
                detail: format!("group `{}` is suspended", group.group_id),
            });
        }
        Ok(())
    }

    // ── Fold ──

    /// Apply one event. Checks happen before any mutation, so a failed
    /// apply leaves the world unchanged.
    pub fn apply(&mut self, event: &Event) -> Result<()> {
        let kind = match event.decoded_kind() {
            DecodedKind::Known(kind) => kind,
            DecodedKind::Unknown(_) => {
                self.unknown_events += 1;
                return Ok(());
            }
        };
        self.check_transition(event)?;
        let id = subject_id(kind, event).unwrap_or_default();
        let p = &event.payload;
        let ts = event.ts.clone();

        match kind {
            // Project
            EventKind::ProjectCreated => {
                self.projects.insert(
                    id.clone(),
                    ProjectView {
                        project_id: id,
                        name: event.payload_str("name").to_string(),
                        state: ProjectState::Active,
                        group_ids: Vec::new(),
                        created_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::ProjectCompleted | EventKind::ProjectArchived => {
                if let Some(v) = self.projects.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    v.updated_at = ts;
                }
            }

            // Group
            EventKind::GroupCreated => {
                let project_id = event.payload_str("project_id").to_string();
                if let Some(project) = self.projects.get_mut(&project_id) {
                    project.group_ids.push(id.clone());
                }
                self.groups.insert(
                    id.clone(),
                    GroupView {
                        group_id: id,
                        project_id,
                        name: event.payload_str("name").to_string(),
                        state: GroupState::Active,
                        auto_complete: event.payload_bool("auto_complete"),
                        template: opt_str(event, "template"),
                        suspended_reason: None,
                        run_ids: Vec::new(),
                        created_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::GroupSuspended
            | EventKind::GroupResumed
            | EventKind::GroupCompleted
            | EventKind::GroupFailed
            | EventKind::GroupCancelled => {
                if let Some(v) = self.groups.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    v.suspended_reason = match kind {
                        EventKind::GroupSuspended => opt_str(event, "reason"),
                        _ => None,
                    };
                    v.updated_at = ts;
                }
            }

            // Run
            EventKind::RunStarted => {
                let group_id = event.payload_str("group_id").to_string();
                if let Some(group) = self.groups.get_mut(&group_id) {
                    group.run_ids.push(id.clone());
                }
                self.runs.insert(
                    id.clone(),
                    RunView {
                        run_id: id,
                        group_id,
                        state: RunState::Running,
                        forced: false,
                        task_ids: Vec::new(),
                        approval_ids: Vec::new(),
                        cost_usd: 0.0,
                        started_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::RunCompleted | EventKind::RunFailed | EventKind::RunAborted => {
                if let Some(v) = self.runs.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    v.forced = kind == EventKind::RunCompleted && event.payload_bool("force");
                    v.updated_at = ts;
                }
            }

            // Task
            EventKind::TaskCreated => {
                let run_id = event.scope_id.clone().unwrap_or_default();
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.task_ids.push(id.clone());
                }
                self.tasks.insert(
                    id.clone(),
                    TaskView {
                        task_id: id,
                        run_id,
                        title: event.payload_str("title").to_string(),
                        state: TaskState::Pending,
                        assignee: None,
                        retries: 0,
                        last_error: None,
                        created_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::TaskAssigned
            | EventKind::TaskStarted
            | EventKind::TaskCompleted
            | EventKind::TaskFailed
            | EventKind::TaskCancelled => {
                if let Some(v) = self.tasks.get_mut(&id) {
                    let next = validate_transition(&id, Some(v.state), kind, p)?;
                    match kind {
                        EventKind::TaskAssigned => v.assignee = opt_str(event, "assignee"),
                        EventKind::TaskFailed => {
                            v.last_error = opt_str(event, "error");
                            if next == TaskState::Pending {
                                v.retries += 1;
                                v.assignee = None;
                            }
                        }
                        _ => {}
                    }
                    v.state = next;
                    v.updated_at = ts;
                }
            }

            // ApprovalRequest
            EventKind::ApprovalRequested => {
                let run_id = event.scope_id.clone().unwrap_or_default();
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.approval_ids.push(id.clone());
                }
                self.approvals.insert(
                    id.clone(),
                    ApprovalView {
                        approval_id: id,
                        run_id,
                        action: event.payload_str("action").to_string(),
                        requested_by: event.actor.clone(),
                        state: ApprovalState::Pending,
                        decided_by: None,
                        reason: opt_str(event, "reason"),
                        requested_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::ApprovalApproved
            | EventKind::ApprovalRejected
            | EventKind::ApprovalExpired
            | EventKind::ApprovalCancelled => {
                if let Some(v) = self.approvals.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    v.decided_by = Some(event.actor.clone());
                    if let Some(reason) = opt_str(event, "reason") {
                        v.reason = Some(reason);
                    }
                    v.updated_at = ts;
                }
            }

            // Decision
            EventKind::DecisionProposed => {
                let d = extract_decision(p).ok_or_else(|| {
                    KernelError::validation(format!("{}: malformed decision payload", event.id))
                })?;
                self.decisions.insert(
                    id,
                    DecisionView {
                        decision_id: d.decision_id,
                        key: d.key,
                        title: d.title,
                        options: d.options,
                        state: DecisionState::Proposed,
                        selected: None,
                        rationale: d.rationale,
                        supersedes: d.supersedes,
                        superseded_by: None,
                        conference_id: None,
                        proposed_by: event.actor.clone(),
                        proposal_event: event.id.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::DecisionVotingOpened
            | EventKind::DecisionApplied
            | EventKind::DecisionSuperseded
            | EventKind::DecisionRejected => {
                if let Some(v) = self.decisions.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    match kind {
                        EventKind::DecisionVotingOpened => {
                            v.conference_id = opt_str(event, "conference_id")
                        }
                        EventKind::DecisionApplied => {
                            v.selected = opt_str(event, "selected");
                            if let Some(r) = opt_str(event, "rationale") {
                                v.rationale = Some(r);
                            }
                        }
                        EventKind::DecisionSuperseded => {
                            v.superseded_by = opt_str(event, "superseded_by")
                        }
                        _ => {}
                    }
                    v.updated_at = ts;
                }
            }

            // Conflict
            EventKind::ConflictDetected => {
                let severity: Severity = event
                    .payload_str("severity")
                    .parse()
                    .map_err(KernelError::Validation)?;
                let claims: Vec<ClaimRef> = p
                    .get("claims")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        KernelError::validation(format!("{}: malformed claims: {e}", event.id))
                    })?
                    .unwrap_or_default();
                self.conflicts.insert(
                    id.clone(),
                    ConflictView {
                        conflict_id: id,
                        resource: event.payload_str("resource").to_string(),
                        severity,
                        claims,
                        state: ConflictState::Open,
                        strategy: None,
                        winner: None,
                        decision_id: None,
                        conference_id: None,
                        escalated_to: None,
                        detected_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::ConflictResolved | EventKind::ConflictEscalated => {
                if let Some(v) = self.conflicts.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    if kind == EventKind::ConflictResolved {
                        v.strategy = opt_str(event, "strategy");
                        v.winner = opt_str(event, "winner");
                        v.decision_id = opt_str(event, "decision_id");
                    } else {
                        v.escalated_to = opt_str(event, "target");
                        v.conference_id = opt_str(event, "conference_id");
                    }
                    v.updated_at = ts;
                }
            }

            // Conference
            EventKind::ConferenceOpened => {
                let participants = str_array(event, "participants")?;
                let options = str_array(event, "options")?;
                let quorum_percentage = p
                    .get("quorum_percentage")
                    .and_then(|v| v.as_u64())
                    .map(|v| v.clamp(1, 100) as u32)
                    .unwrap_or(50);
                self.conferences.insert(
                    id.clone(),
                    ConferenceView {
                        conference_id: id,
                        topic: event.payload_str("topic").to_string(),
                        participants,
                        options,
                        quorum_percentage,
                        opinions: BTreeMap::new(),
                        state: ConferenceState::Open,
                        selected: None,
                        conflict_id: opt_str(event, "conflict_id"),
                        decision_id: opt_str(event, "decision_id"),
                        opened_at: ts.clone(),
                        updated_at: ts,
                    },
                );
            }
            EventKind::ConferenceOpinion => {
                let stance: Stance = event
                    .payload_str("stance")
                    .parse()
                    .map_err(KernelError::Validation)?;
                if let Some(v) = self.conferences.get_mut(&id) {
                    v.opinions.insert(
                        event.payload_str("participant").to_string(),
                        OpinionView {
                            stance,
                            option: opt_str(event, "option"),
                            event_id: event.id.clone(),
                        },
                    );
                    v.updated_at = ts;
                }
            }
            EventKind::ConferenceConcluded => {
                if let Some(v) = self.conferences.get_mut(&id) {
                    v.state = validate_transition(&id, Some(v.state), kind, p)?;
                    v.selected = opt_str(event, "selected");
                    v.updated_at = ts;
                }
            }

            EventKind::ClaimRegistered
            | EventKind::ClaimReleased
            | EventKind::ClaimDenied
            | EventKind::SafetyAlert
            | EventKind::OperationTimeout => {}
        }

        if let (Some(run_id), Some(cost)) = (
            event.scope_id.as_deref(),
            p.get("cost_usd").and_then(|v| v.as_f64()),
        ) {
            if let Some(run) = self.runs.get_mut(run_id) {
                run.cost_usd += cost;
            }
        }
        Ok(())
    }

    // ── Queries ──

    pub fn projection(&self, entity: EntityKind, id: &str) -> Option<Projection> {
        match entity {
            EntityKind::Project => self.projects.get(id).cloned().map(Projection::Project),
            EntityKind::Group => self.groups.get(id).cloned().map(Projection::Group),
            EntityKind::Run => self.runs.get(id).cloned().map(Projection::Run),
            EntityKind::Task => self.tasks.get(id).cloned().map(Projection::Task),
            EntityKind::ApprovalRequest => self
                .approvals
                .get(id)
                .cloned()
                .map(Projection::ApprovalRequest),
            EntityKind::Decision => self.decisions.get(id).cloned().map(Projection::Decision),
            EntityKind::Conflict => self.conflicts.get(id).cloned().map(Projection::Conflict),
            EntityKind::Conference => {
                self.conferences.get(id).cloned().map(Projection::Conference)
            }
        }
    }

    pub fn runs_of_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a RunView> {
        self.runs.values().filter(move |r| r.group_id == group_id)
    }

    pub fn running_runs(&self, group_id: &str) -> usize {
        self.runs_of_group(group_id)
            .filter(|r| r.state == RunState::Running)
            .count()
    }

    pub fn tasks_of_run<'a>(&'a self, run_id: &'a str) -> impl Iterator<Item = &'a TaskView> {
        self.tasks.values().filter(move |t| t.run_id == run_id)
    }

    /// Non-terminal tasks and pending approvals of a Run.
    pub fn completion_plan(&self, run_id: &str) -> CompletionPlan {
        CompletionPlan {
            tasks: self
                .tasks_of_run(run_id)
                .filter(|t| !t.state.is_terminal())
                .map(|t| t.task_id.clone())
                .collect(),
            approvals: self
                .approvals
                .values()
                .filter(|a| a.run_id == run_id && a.state == ApprovalState::Pending)
                .map(|a| a.approval_id.clone())
                .collect(),
        }
    }

    /// An auto-completing, active Group whose runs are all terminal.
    pub fn group_ready_to_complete(&self, group_id: &str) -> bool {
        let Some(group) = self.groups.get(group_id) else {
            return false;
        };
        group.auto_complete
            && group.state == GroupState::Active
            && !group.run_ids.is_empty()
            && self.runs_of_group(group_id).all(|r| r.state.is_terminal())
    }

    pub fn groups_ready_to_complete(&self) -> Vec<String> {
        self.groups
            .keys()
            .filter(|g| self.group_ready_to_complete(g))
            .cloned()
            .collect()
    }

    /// The applied Decision for a key, if any. At most one exists.
    pub fn applied_decision(&self, key: &str) -> Option<&DecisionView> {
        self.decisions
            .values()
            .find(|d| d.key == key && d.state == DecisionState::Applied)
    }

    /// Applied Decisions, one per key, ordered by key.
    pub fn active_decisions(&self) -> Vec<&DecisionView> {
        let mut active: Vec<&DecisionView> = self
            .decisions
            .values()
            .filter(|d| d.state == DecisionState::Applied)
            .collect();
        active.sort_by(|a, b| a.key.cmp(&b.key));
        active
    }

    pub fn decisions_in_domain(&self, domain: &str) -> Vec<&DecisionView> {
        self.active_decisions()
            .into_iter()
            .filter(|d| extract_domain(&d.key) == domain)
            .collect()
    }
}

/// Fold `events` and return the snapshot of one entity.
pub fn build_projection<'a>(
    events: impl IntoIterator<Item = &'a Event>,
    entity: EntityKind,
    id: &str,
) -> Option<Projection> {
    World::fold(events).projection(entity, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Script;
    use serde_json::json;

    fn base() -> Script {
        let mut s = Script::new();
        s.push(None, EventKind::ProjectCreated, json!({"project_id": "p1", "name": "demo"}));
        s.push(
            None,
            EventKind::GroupCreated,
            json!({"group_id": "g1", "project_id": "p1", "name": "core", "auto_complete": true}),
        );
        s.push(Some("r1"), EventKind::RunStarted, json!({"group_id": "g1"}));
        s.push(Some("r1"), EventKind::TaskCreated, json!({"task_id": "t1", "title": "build"}));
        s
    }

    #[test]
    fn fold_builds_hierarchy() {
        let s = base();
        let world = World::fold(&s.events);
        assert!(world.anomalies().is_empty());
        assert_eq!(world.projects["p1"].group_ids, vec!["g1"]);
        assert_eq!(world.groups["g1"].run_ids, vec!["r1"]);
        assert_eq!(world.runs["r1"].task_ids, vec!["t1"]);
        assert_eq!(world.tasks["t1"].state, TaskState::Pending);
    }

    #[test]
    fn double_replay_is_byte_identical() {
        let mut s = base();
        s.push(Some("r1"), EventKind::TaskAssigned, json!({"task_id": "t1", "assignee": "bot"}));
        s.push(Some("r1"), EventKind::TaskStarted, json!({"task_id": "t1", "cost_usd": 0.25}));
        for (entity, id) in [
            (EntityKind::Project, "p1"),
            (EntityKind::Group, "g1"),
            (EntityKind::Run, "r1"),
            (EntityKind::Task, "t1"),
        ] {
            let a = build_projection(&s.events, entity, id).unwrap();
            let b = build_projection(&s.events, entity, id).unwrap();
            assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        }
        let run = World::fold(&s.events).runs["r1"].clone();
        assert_eq!(run.cost_usd, 0.25);
    }

    #[test]
    fn unknown_kinds_are_counted_not_raised() {
        let mut s = base();
        s.push_raw(None, "swarm.formed", json!({"size": 3}));
        let world = World::fold(&s.events);
        assert_eq!(world.unknown_events(), 1);
        assert!(world.anomalies().is_empty());
    }

    #[test]
    fn illegal_stored_event_becomes_anomaly() {
        let mut s = base();
        s.push(Some("r1"), EventKind::TaskCompleted, json!({"task_id": "t1"}));
        let world = World::fold(&s.events);
        assert_eq!(world.anomalies().len(), 1);
        assert_eq!(world.tasks["t1"].state, TaskState::Pending);
    }

    #[test]
    fn run_completion_blocked_by_open_task() {
        let s = base();
        let world = World::fold(&s.events);
        let completion = s.draft(Some("r1"), EventKind::RunCompleted, json!({}));
        let err = world.admit(&completion, &Limits::default()).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert!(err.to_string().contains("t1"), "{err}");

        let plan = world.completion_plan("r1");
        assert_eq!(plan.tasks, vec!["t1"]);
        assert!(plan.approvals.is_empty());
    }

    #[test]
    fn forced_sequence_admits_in_order() {
        let mut s = base();
        s.push(Some("r1"), EventKind::ApprovalRequested, json!({"approval_id": "a1", "action": "run.aborted"}));
        let mut world = World::fold(&s.events);
        let limits = Limits::default();
        let cancel_task = s.draft(Some("r1"), EventKind::TaskCancelled, json!({"task_id": "t1"}));
        let cancel_approval =
            s.draft(Some("r1"), EventKind::ApprovalCancelled, json!({"approval_id": "a1"}));
        let complete = s.draft(Some("r1"), EventKind::RunCompleted, json!({"force": true}));
        for e in [&cancel_task, &cancel_approval, &complete] {
            world.admit(e, &limits).unwrap();
            world.apply(e).unwrap();
        }
        assert_eq!(world.runs["r1"].state, RunState::Completed);
        assert!(world.runs["r1"].forced);
        assert_eq!(world.tasks["t1"].state, TaskState::Cancelled);
        assert!(world.group_ready_to_complete("g1"));
    }

    #[test]
    fn run_needs_active_group_and_capacity() {
        let mut s = base();
        s.push(None, EventKind::GroupSuspended, json!({"group_id": "g1", "reason": "runaway"}));
        let world = World::fold(&s.events);
        let start = s.draft(Some("r2"), EventKind::RunStarted, json!({"group_id": "g1"}));
        let err = world.admit(&start, &Limits::default()).unwrap_err();
        assert!(err.to_string().contains("suspended"), "{err}");

        let world = World::fold(&base().events);
        let limits = Limits { max_retries: 3, concurrency_limit: 1 };
        assert!(world.admit(&start, &limits).is_err());
        let missing = s.draft(Some("r3"), EventKind::RunStarted, json!({"group_id": "nope"}));
        assert_eq!(world.admit(&missing, &limits).unwrap_err().code(), "not_found");
    }

    #[test]
    fn tasks_only_in_running_runs() {
        let mut s = base();
        s.push(Some("r1"), EventKind::TaskCancelled, json!({"task_id": "t1"}));
        s.push(Some("r1"), EventKind::RunAborted, json!({}));
        let world = World::fold(&s.events);
        let late = s.draft(Some("r1"), EventKind::TaskCreated, json!({"task_id": "t2", "title": "x"}));
        let err = world.admit(&late, &Limits::default()).unwrap_err();
        assert!(err.to_string().contains("run `r1` is aborted"), "{err}");
    }

    #[test]
    fn suspended_group_only_winds_down() {
        let mut s = base();
        s.push(None, EventKind::GroupSuspended, json!({"group_id": "g1", "reason": "runaway"}));
        let world = World::fold(&s.events);
        let limits = Limits::default();

        let more = s.draft(Some("r1"), EventKind::TaskCreated, json!({"task_id": "t99", "title": "x"}));
        let err = world.admit(&more, &limits).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert!(err.to_string().contains("group `g1` is suspended"), "{err}");
        let assign = s.draft(Some("r1"), EventKind::TaskAssigned, json!({"task_id": "t1", "assignee": "bot"}));
        assert!(world.admit(&assign, &limits).is_err());

        let cancel = s.draft(Some("r1"), EventKind::TaskCancelled, json!({"task_id": "t1"}));
        world.admit(&cancel, &limits).unwrap();
        let abort = s.draft(Some("r1"), EventKind::RunAborted, json!({}));
        world.admit(&abort, &limits).unwrap();

        s.push(None, EventKind::GroupResumed, json!({"group_id": "g1"}));
        let world = World::fold(&s.events);
        let more = s.draft(Some("r1"), EventKind::TaskCreated, json!({"task_id": "t99", "title": "x"}));
        world.admit(&more, &limits).unwrap();
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut s = base();
        let limits = Limits { max_retries: 1, concurrency_limit: 8 };
        s.push(Some("r1"), EventKind::TaskAssigned, json!({"task_id": "t1", "assignee": "bot"}));
        s.push(Some("r1"), EventKind::TaskStarted, json!({"task_id": "t1"}));
        s.push(Some("r1"), EventKind::TaskFailed, json!({"task_id": "t1", "retry": true, "error": "flaky"}));
        let world = World::fold(&s.events);
        let task = &world.tasks["t1"];
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retries, 1);
        assert_eq!(task.last_error.as_deref(), Some("flaky"));

        s.push(Some("r1"), EventKind::TaskAssigned, json!({"task_id": "t1", "assignee": "bot"}));
        s.push(Some("r1"), EventKind::TaskStarted, json!({"task_id": "t1"}));
        let world = World::fold(&s.events);
        let again = s.draft(Some("r1"), EventKind::TaskFailed, json!({"task_id": "t1", "retry": true}));
        assert!(world.admit(&again, &limits).is_err());
        let terminal = s.draft(Some("r1"), EventKind::TaskFailed, json!({"task_id": "t1"}));
        world.admit(&terminal, &limits).unwrap();
    }

    #[test]
    fn one_applied_decision_per_key() {
        let mut s = base();
        s.push(None, EventKind::DecisionProposed, json!({"decision_id": "d1", "key": "merge.strategy", "title": "t", "options": ["rebase", "squash"]}));
        s.push(None, EventKind::DecisionApplied, json!({"decision_id": "d1", "selected": "rebase"}));
        s.push(None, EventKind::DecisionProposed, json!({"decision_id": "d2", "key": "merge.strategy", "title": "t", "options": ["rebase", "squash"], "supersedes": "d1"}));
        let mut world = World::fold(&s.events);
        let limits = Limits::default();

        let premature = s.draft(None, EventKind::DecisionApplied, json!({"decision_id": "d2", "selected": "squash"}));
        assert!(world.admit(&premature, &limits).is_err());

        let supersede = s.draft(None, EventKind::DecisionSuperseded, json!({"decision_id": "d1", "superseded_by": "d2"}));
        world.admit(&supersede, &limits).unwrap();
        world.apply(&supersede).unwrap();
        world.admit(&premature, &limits).unwrap();
        world.apply(&premature).unwrap();

        let active = world.active_decisions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, "d2");
        assert_eq!(world.decisions["d1"].state, DecisionState::Superseded);
        assert_eq!(world.decisions_in_domain("merge").len(), 1);
        assert!(world.decisions_in_domain("db").is_empty());
    }

    #[test]
    fn selected_option_must_exist() {
        let mut s = base();
        s.push(None, EventKind::DecisionProposed, json!({"decision_id": "d1", "key": "k", "title": "t", "options": ["a"]}));
        let world = World::fold(&s.events);
        let bad = s.draft(None, EventKind::DecisionApplied, json!({"decision_id": "d1", "selected": "b"}));
        assert_eq!(world.admit(&bad, &Limits::default()).unwrap_err().code(), "validation");
    }

    #[test]
    fn conference_opinions_are_tallied() {
        let mut s = base();
        s.push(None, EventKind::ConferenceOpened, json!({"conference_id": "c1", "topic": "merge", "participants": ["a", "b", "c", "d"], "options": ["x", "y"], "quorum_percentage": 50}));
        s.push(None, EventKind::ConferenceOpinion, json!({"conference_id": "c1", "participant": "a", "stance": "approve", "option": "x"}));
        s.push(None, EventKind::ConferenceOpinion, json!({"conference_id": "c1", "participant": "b", "stance": "approve", "option": "x"}));
        let world = World::fold(&s.events);
        let conf = &world.conferences["c1"];
        assert!(conf.tally().reached());
        assert_eq!(conf.opinion_events().len(), 2);

        let outsider = s.draft(None, EventKind::ConferenceOpinion, json!({"conference_id": "c1", "participant": "z", "stance": "approve"}));
        assert!(world.admit(&outsider, &Limits::default()).is_err());
    }
}
