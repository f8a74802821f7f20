use apiary_core::{EntityKind, EventKind, KernelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed state enum with its transition table.
///
/// Rows are `(from, kind, to)`; `from = None` is creation. A missing row is
/// an illegal transition. States with no outgoing row are terminal.
pub trait Lifecycle: Copy + Eq + fmt::Debug + 'static {
    const ENTITY: EntityKind;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)];

    fn as_str(self) -> &'static str;

    /// Target state for `kind` applied at `from`, refined by the payload
    /// where one kind can land in several states.
    fn target(from: Option<Self>, kind: EventKind, _payload: &serde_json::Value) -> Option<Self> {
        Self::TRANSITIONS
            .iter()
            .find(|(f, k, _)| *f == from && *k == kind)
            .map(|(_, _, to)| *to)
    }

    fn is_terminal(self) -> bool {
        !Self::TRANSITIONS.iter().any(|(f, _, _)| *f == Some(self))
    }
}

/// Validate one proposed step for entity `id`, returning the next state.
pub fn validate_transition<S: Lifecycle>(
    id: &str,
    current: Option<S>,
    kind: EventKind,
    payload: &serde_json::Value,
) -> Result<S> {
    S::target(current, kind, payload).ok_or_else(|| KernelError::InvalidStateTransition {
        entity: S::ENTITY,
        entity_id: id.to_string(),
        from: current.map(S::as_str).unwrap_or("absent").to_string(),
        kind: kind.as_str().to_string(),
        detail: match current {
            None => "entity does not exist".to_string(),
            Some(s) if s.is_terminal() => format!("`{}` is terminal", s.as_str()),
            Some(_) => "no such transition".to_string(),
        },
    })
}

macro_rules! state_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Lifecycle::as_str(*self))
            }
        }
    };
}

// ── Project ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Active,
    Completed,
    Archived,
}

impl Lifecycle for ProjectState {
    const ENTITY: EntityKind = EntityKind::Project;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::ProjectCreated, Self::Active),
        (Some(Self::Active), EventKind::ProjectCompleted, Self::Completed),
        (Some(Self::Active), EventKind::ProjectArchived, Self::Archived),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }
}

// ── Group ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Active,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl Lifecycle for GroupState {
    const ENTITY: EntityKind = EntityKind::Group;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::GroupCreated, Self::Active),
        (Some(Self::Active), EventKind::GroupSuspended, Self::Suspended),
        (Some(Self::Suspended), EventKind::GroupResumed, Self::Active),
        (Some(Self::Active), EventKind::GroupCompleted, Self::Completed),
        (Some(Self::Active), EventKind::GroupFailed, Self::Failed),
        (Some(Self::Active), EventKind::GroupCancelled, Self::Cancelled),
        (Some(Self::Suspended), EventKind::GroupCancelled, Self::Cancelled),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ── Run ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl Lifecycle for RunState {
    const ENTITY: EntityKind = EntityKind::Run;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::RunStarted, Self::Running),
        (Some(Self::Running), EventKind::RunCompleted, Self::Completed),
        (Some(Self::Running), EventKind::RunFailed, Self::Failed),
        (Some(Self::Running), EventKind::RunAborted, Self::Aborted),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

// ── Task ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl Lifecycle for TaskState {
    const ENTITY: EntityKind = EntityKind::Task;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::TaskCreated, Self::Pending),
        (Some(Self::Pending), EventKind::TaskAssigned, Self::Assigned),
        (Some(Self::Assigned), EventKind::TaskStarted, Self::InProgress),
        (Some(Self::InProgress), EventKind::TaskCompleted, Self::Completed),
        (Some(Self::InProgress), EventKind::TaskFailed, Self::Failed),
        (Some(Self::Pending), EventKind::TaskCancelled, Self::Cancelled),
        (Some(Self::Assigned), EventKind::TaskCancelled, Self::Cancelled),
        (Some(Self::InProgress), EventKind::TaskCancelled, Self::Cancelled),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// A `task.failed` stamped with `"retry": true` sends the task back to
    /// `pending` instead of failing it.
    fn target(from: Option<Self>, kind: EventKind, payload: &serde_json::Value) -> Option<Self> {
        let next = Self::TRANSITIONS
            .iter()
            .find(|(f, k, _)| *f == from && *k == kind)
            .map(|(_, _, to)| *to)?;
        let retry = payload.get("retry").and_then(|v| v.as_bool()) == Some(true);
        if next == Self::Failed && retry {
            Some(Self::Pending)
        } else {
            Some(next)
        }
    }
}

// ── ApprovalRequest ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl Lifecycle for ApprovalState {
    const ENTITY: EntityKind = EntityKind::ApprovalRequest;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::ApprovalRequested, Self::Pending),
        (Some(Self::Pending), EventKind::ApprovalApproved, Self::Approved),
        (Some(Self::Pending), EventKind::ApprovalRejected, Self::Rejected),
        (Some(Self::Pending), EventKind::ApprovalExpired, Self::Expired),
        (Some(Self::Pending), EventKind::ApprovalCancelled, Self::Cancelled),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

// ── Decision ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Proposed,
    Voting,
    Applied,
    Superseded,
    Rejected,
}

impl Lifecycle for DecisionState {
    const ENTITY: EntityKind = EntityKind::Decision;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::DecisionProposed, Self::Proposed),
        (Some(Self::Proposed), EventKind::DecisionVotingOpened, Self::Voting),
        (Some(Self::Proposed), EventKind::DecisionApplied, Self::Applied),
        (Some(Self::Voting), EventKind::DecisionApplied, Self::Applied),
        (Some(Self::Proposed), EventKind::DecisionRejected, Self::Rejected),
        (Some(Self::Voting), EventKind::DecisionRejected, Self::Rejected),
        (Some(Self::Applied), EventKind::DecisionSuperseded, Self::Superseded),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Voting => "voting",
            Self::Applied => "applied",
            Self::Superseded => "superseded",
            Self::Rejected => "rejected",
        }
    }
}

// ── Conflict ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Open,
    Escalated,
    Resolved,
}

impl Lifecycle for ConflictState {
    const ENTITY: EntityKind = EntityKind::Conflict;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::ConflictDetected, Self::Open),
        (Some(Self::Open), EventKind::ConflictResolved, Self::Resolved),
        (Some(Self::Open), EventKind::ConflictEscalated, Self::Escalated),
        (Some(Self::Escalated), EventKind::ConflictResolved, Self::Resolved),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
        }
    }
}

// ── Conference ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConferenceState {
    Open,
    Decided,
    NoDecision,
}

impl Lifecycle for ConferenceState {
    const ENTITY: EntityKind = EntityKind::Conference;
    const TRANSITIONS: &'static [(Option<Self>, EventKind, Self)] = &[
        (None, EventKind::ConferenceOpened, Self::Open),
        (Some(Self::Open), EventKind::ConferenceOpinion, Self::Open),
        (Some(Self::Open), EventKind::ConferenceConcluded, Self::Decided),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Decided => "decided",
            Self::NoDecision => "no_decision",
        }
    }

    /// `conference.concluded` lands in `no_decision` when its outcome says so.
    fn target(from: Option<Self>, kind: EventKind, payload: &serde_json::Value) -> Option<Self> {
        let next = Self::TRANSITIONS
            .iter()
            .find(|(f, k, _)| *f == from && *k == kind)
            .map(|(_, _, to)| *to)?;
        let outcome = payload.get("outcome").and_then(|v| v.as_str());
        if kind == EventKind::ConferenceConcluded && outcome == Some("no_decision") {
            Some(Self::NoDecision)
        } else {
            Some(next)
        }
    }
}

state_display!(ProjectState);
state_display!(GroupState);
state_display!(RunState);
state_display!(TaskState);
state_display!(ApprovalState);
state_display!(DecisionState);
state_display!(ConflictState);
state_display!(ConferenceState);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step<S: Lifecycle>(from: Option<S>, kind: EventKind) -> Result<S> {
        validate_transition("x", from, kind, &json!({}))
    }

    fn assert_table_sound<S: Lifecycle>() {
        for (from, kind, _) in S::TRANSITIONS {
            assert_eq!(kind.entity(), Some(S::ENTITY), "{kind} targets another entity");
            if let Some(f) = from {
                assert!(!f.is_terminal());
            }
        }
        let creations = S::TRANSITIONS.iter().filter(|(f, _, _)| f.is_none()).count();
        assert_eq!(creations, 1);
    }

    #[test]
    fn tables_are_sound() {
        assert_table_sound::<ProjectState>();
        assert_table_sound::<GroupState>();
        assert_table_sound::<RunState>();
        assert_table_sound::<TaskState>();
        assert_table_sound::<ApprovalState>();
        assert_table_sound::<DecisionState>();
        assert_table_sound::<ConflictState>();
        assert_table_sound::<ConferenceState>();
    }

    #[test]
    fn task_happy_path() {
        let s = step::<TaskState>(None, EventKind::TaskCreated).unwrap();
        let s = step(Some(s), EventKind::TaskAssigned).unwrap();
        let s = step(Some(s), EventKind::TaskStarted).unwrap();
        let s = step(Some(s), EventKind::TaskCompleted).unwrap();
        assert_eq!(s, TaskState::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let err = step(Some(TaskState::Pending), EventKind::TaskCompleted).unwrap_err();
        match err {
            KernelError::InvalidStateTransition { entity, from, kind, detail, .. } => {
                assert_eq!(entity, EntityKind::Task);
                assert_eq!(from, "pending");
                assert_eq!(kind, "task.completed");
                assert_eq!(detail, "no such transition");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        let err = step(Some(RunState::Completed), EventKind::RunAborted).unwrap_err();
        assert!(err.to_string().contains("`completed` is terminal"), "{err}");
        assert!(RunState::Aborted.is_terminal());
        assert!(GroupState::Cancelled.is_terminal());
        assert!(!GroupState::Suspended.is_terminal());
        assert!(!DecisionState::Applied.is_terminal());
    }

    #[test]
    fn creation_needs_absence() {
        assert!(step(Some(ProjectState::Active), EventKind::ProjectCreated).is_err());
        let err = step::<RunState>(None, EventKind::RunCompleted).unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn retry_returns_task_to_pending() {
        let retried = validate_transition(
            "t1",
            Some(TaskState::InProgress),
            EventKind::TaskFailed,
            &json!({"retry": true}),
        )
        .unwrap();
        assert_eq!(retried, TaskState::Pending);
        assert_eq!(
            step(Some(TaskState::InProgress), EventKind::TaskFailed).unwrap(),
            TaskState::Failed
        );
    }

    #[test]
    fn group_suspend_resume_cycle() {
        let s = step(Some(GroupState::Active), EventKind::GroupSuspended).unwrap();
        assert!(step(Some(s), EventKind::GroupCompleted).is_err());
        let s = step(Some(s), EventKind::GroupResumed).unwrap();
        assert_eq!(s, GroupState::Active);
    }

    #[test]
    fn conference_outcomes() {
        let decided = validate_transition(
            "c1",
            Some(ConferenceState::Open),
            EventKind::ConferenceConcluded,
            &json!({"outcome": "decided"}),
        )
        .unwrap();
        assert_eq!(decided, ConferenceState::Decided);
        let none = validate_transition(
            "c1",
            Some(ConferenceState::Open),
            EventKind::ConferenceConcluded,
            &json!({"outcome": "no_decision"}),
        )
        .unwrap();
        assert_eq!(none, ConferenceState::NoDecision);
        assert!(none.is_terminal());
    }

    #[test]
    fn decision_supersession_only_after_apply() {
        assert!(step(Some(DecisionState::Proposed), EventKind::DecisionSuperseded).is_err());
        assert_eq!(
            step(Some(DecisionState::Applied), EventKind::DecisionSuperseded).unwrap(),
            DecisionState::Superseded
        );
    }
}
