//! Event kinds: an open string on the wire, decoded through a closed table.
//!
//! Every known kind has one row in [`KIND_TABLE`] carrying the entity it
//! targets, the payload field naming that entity, the segment it is written
//! to, its policy class, and its required payload fields. Kinds missing from
//! the table decode to [`DecodedKind::Unknown`] and pass through untouched.

use crate::policy::ActionClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds that have a projection and a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Group,
    Run,
    Task,
    ApprovalRequest,
    Decision,
    Conflict,
    Conference,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Group => "group",
            EntityKind::Run => "run",
            EntityKind::Task => "task",
            EntityKind::ApprovalRequest => "approval_request",
            EntityKind::Decision => "decision",
            EntityKind::Conflict => "conflict",
            EntityKind::Conference => "conference",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(EntityKind::Project),
            "group" => Ok(EntityKind::Group),
            "run" => Ok(EntityKind::Run),
            "task" => Ok(EntityKind::Task),
            "approval_request" | "approval" => Ok(EntityKind::ApprovalRequest),
            "decision" => Ok(EntityKind::Decision),
            "conflict" => Ok(EntityKind::Conflict),
            "conference" => Ok(EntityKind::Conference),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Which physical segment a kind is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    /// The shared project/group-level segment (`scope_id` must be absent).
    Project,
    /// A Run's own segment (`scope_id` must name the Run).
    Run,
    /// Either, depending on what the event is about.
    Any,
}

/// Expected JSON type of a required payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Bool,
    Array,
    Number,
}

impl FieldType {
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::Str => value.as_str().is_some_and(|s| !s.is_empty()),
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Number => value.is_number(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Str => "non-empty string",
            FieldType::Bool => "boolean",
            FieldType::Array => "array",
            FieldType::Number => "number",
        }
    }
}

/// One required payload field.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn s(name: &'static str) -> Field {
    Field { name, ty: FieldType::Str }
}

const fn arr(name: &'static str) -> Field {
    Field { name, ty: FieldType::Array }
}

/// Closed set of kinds this build understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ProjectCreated,
    ProjectCompleted,
    ProjectArchived,
    GroupCreated,
    GroupSuspended,
    GroupResumed,
    GroupCompleted,
    GroupFailed,
    GroupCancelled,
    RunStarted,
    RunCompleted,
    RunFailed,
    RunAborted,
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
    ApprovalCancelled,
    DecisionProposed,
    DecisionVotingOpened,
    DecisionApplied,
    DecisionSuperseded,
    DecisionRejected,
    ClaimRegistered,
    ClaimReleased,
    ClaimDenied,
    ConflictDetected,
    ConflictResolved,
    ConflictEscalated,
    ConferenceOpened,
    ConferenceOpinion,
    ConferenceConcluded,
    SafetyAlert,
    OperationTimeout,
}

/// Static facts about one kind.
#[derive(Debug)]
pub struct KindSpec {
    pub kind: EventKind,
    pub name: &'static str,
    pub entity: Option<EntityKind>,
    /// Payload field carrying the target entity id. `None` for Run kinds,
    /// whose target is the event's `scope_id`.
    pub subject: Option<&'static str>,
    pub segment: SegmentClass,
    pub action: ActionClass,
    pub required: &'static [Field],
}

use self::EntityKind as E;
use self::SegmentClass as Seg;
use crate::policy::ActionClass::{Irreversible, ReadOnly, Reversible};

macro_rules! row {
    ($kind:ident, $name:literal, $entity:expr, $subject:expr, $seg:expr, $action:expr, [$($f:expr),* $(,)?]) => {
        KindSpec {
            kind: EventKind::$kind,
            name: $name,
            entity: $entity,
            subject: $subject,
            segment: $seg,
            action: $action,
            required: &[$($f),*],
        }
    };
}

/// Indexed by `EventKind as usize`; `kind_table_is_indexed_by_discriminant`
/// guards the ordering.
pub const KIND_TABLE: &[KindSpec] = &[
    row!(ProjectCreated, "project.created", Some(E::Project), Some("project_id"), Seg::Project, Reversible, [s("project_id"), s("name")]),
    row!(ProjectCompleted, "project.completed", Some(E::Project), Some("project_id"), Seg::Project, Irreversible, [s("project_id")]),
    row!(ProjectArchived, "project.archived", Some(E::Project), Some("project_id"), Seg::Project, Irreversible, [s("project_id")]),
    row!(GroupCreated, "group.created", Some(E::Group), Some("group_id"), Seg::Project, Reversible, [s("group_id"), s("project_id"), s("name")]),
    row!(GroupSuspended, "group.suspended", Some(E::Group), Some("group_id"), Seg::Project, Reversible, [s("group_id"), s("reason")]),
    row!(GroupResumed, "group.resumed", Some(E::Group), Some("group_id"), Seg::Project, Reversible, [s("group_id")]),
    row!(GroupCompleted, "group.completed", Some(E::Group), Some("group_id"), Seg::Project, Irreversible, [s("group_id")]),
    row!(GroupFailed, "group.failed", Some(E::Group), Some("group_id"), Seg::Project, Irreversible, [s("group_id")]),
    row!(GroupCancelled, "group.cancelled", Some(E::Group), Some("group_id"), Seg::Project, Irreversible, [s("group_id")]),
    row!(RunStarted, "run.started", Some(E::Run), None, Seg::Run, Reversible, [s("group_id")]),
    row!(RunCompleted, "run.completed", Some(E::Run), None, Seg::Run, Irreversible, []),
    row!(RunFailed, "run.failed", Some(E::Run), None, Seg::Run, Irreversible, []),
    row!(RunAborted, "run.aborted", Some(E::Run), None, Seg::Run, Irreversible, []),
    row!(TaskCreated, "task.created", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id"), s("title")]),
    row!(TaskAssigned, "task.assigned", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id"), s("assignee")]),
    row!(TaskStarted, "task.started", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id")]),
    row!(TaskCompleted, "task.completed", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id")]),
    row!(TaskFailed, "task.failed", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id")]),
    row!(TaskCancelled, "task.cancelled", Some(E::Task), Some("task_id"), Seg::Run, Reversible, [s("task_id")]),
    row!(ApprovalRequested, "approval.requested", Some(E::ApprovalRequest), Some("approval_id"), Seg::Run, ReadOnly, [s("approval_id"), s("action")]),
    row!(ApprovalApproved, "approval.approved", Some(E::ApprovalRequest), Some("approval_id"), Seg::Run, Irreversible, [s("approval_id")]),
    row!(ApprovalRejected, "approval.rejected", Some(E::ApprovalRequest), Some("approval_id"), Seg::Run, Irreversible, [s("approval_id")]),
    row!(ApprovalExpired, "approval.expired", Some(E::ApprovalRequest), Some("approval_id"), Seg::Run, Reversible, [s("approval_id")]),
    row!(ApprovalCancelled, "approval.cancelled", Some(E::ApprovalRequest), Some("approval_id"), Seg::Run, Reversible, [s("approval_id")]),
    row!(DecisionProposed, "decision.proposed", Some(E::Decision), Some("decision_id"), Seg::Project, Reversible, [s("decision_id"), s("key"), s("title"), arr("options")]),
    row!(DecisionVotingOpened, "decision.voting_opened", Some(E::Decision), Some("decision_id"), Seg::Project, Reversible, [s("decision_id"), s("conference_id")]),
    row!(DecisionApplied, "decision.applied", Some(E::Decision), Some("decision_id"), Seg::Project, Irreversible, [s("decision_id"), s("selected")]),
    row!(DecisionSuperseded, "decision.superseded", Some(E::Decision), Some("decision_id"), Seg::Project, Irreversible, [s("decision_id"), s("superseded_by")]),
    row!(DecisionRejected, "decision.rejected", Some(E::Decision), Some("decision_id"), Seg::Project, Reversible, [s("decision_id")]),
    row!(ClaimRegistered, "claim.registered", None, Some("group_id"), Seg::Project, Reversible, [s("group_id"), s("resource"), s("mode")]),
    row!(ClaimReleased, "claim.released", None, Some("group_id"), Seg::Project, Reversible, [s("group_id"), s("resource")]),
    row!(ClaimDenied, "claim.denied", None, Some("group_id"), Seg::Project, Reversible, [s("group_id"), s("resource"), s("reason")]),
    row!(ConflictDetected, "conflict.detected", Some(E::Conflict), Some("conflict_id"), Seg::Project, ReadOnly, [s("conflict_id"), s("resource"), s("severity"), arr("claims")]),
    row!(ConflictResolved, "conflict.resolved", Some(E::Conflict), Some("conflict_id"), Seg::Project, Reversible, [s("conflict_id"), s("strategy")]),
    row!(ConflictEscalated, "conflict.escalated", Some(E::Conflict), Some("conflict_id"), Seg::Project, Reversible, [s("conflict_id"), s("target")]),
    row!(ConferenceOpened, "conference.opened", Some(E::Conference), Some("conference_id"), Seg::Project, ReadOnly, [s("conference_id"), s("topic"), arr("participants")]),
    row!(ConferenceOpinion, "conference.opinion", Some(E::Conference), Some("conference_id"), Seg::Project, ReadOnly, [s("conference_id"), s("participant"), s("stance")]),
    row!(ConferenceConcluded, "conference.concluded", Some(E::Conference), Some("conference_id"), Seg::Project, Reversible, [s("conference_id"), s("outcome")]),
    row!(SafetyAlert, "safety.alert", None, None, Seg::Project, ReadOnly, [s("alert"), s("scope")]),
    row!(OperationTimeout, "operation.timeout", None, Some("target_id"), Seg::Any, Reversible, [s("target_id"), s("operation")]),
];

impl EventKind {
    pub fn spec(self) -> &'static KindSpec {
        &KIND_TABLE[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.spec().name
    }

    pub fn entity(self) -> Option<EntityKind> {
        self.spec().entity
    }

    pub fn action_class(self) -> ActionClass {
        self.spec().action
    }

    pub fn segment(self) -> SegmentClass {
        self.spec().segment
    }

    /// Decode a wire name. `None` for kinds this build does not know.
    pub fn parse(name: &str) -> Option<EventKind> {
        KIND_TABLE.iter().find(|row| row.name == name).map(|row| row.kind)
    }

    pub fn all() -> impl Iterator<Item = EventKind> {
        KIND_TABLE.iter().map(|row| row.kind)
    }

    /// Kinds that move an entity into a terminal state. Used by aggregates
    /// and the safety monitor's registry eviction.
    pub fn is_terminal_for_scope(self) -> bool {
        matches!(
            self,
            EventKind::RunCompleted
                | EventKind::RunFailed
                | EventKind::RunAborted
                | EventKind::GroupCompleted
                | EventKind::GroupFailed
                | EventKind::GroupCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding the open `kind` string of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedKind<'a> {
    Known(EventKind),
    /// A kind from a newer writer. Preserved verbatim, folded as a no-op.
    Unknown(&'a str),
}

pub fn decode_kind(raw: &str) -> DecodedKind<'_> {
    match EventKind::parse(raw) {
        Some(kind) => DecodedKind::Known(kind),
        None => DecodedKind::Unknown(raw),
    }
}
