//! Entity snapshots. Recomputed by folding events, never persisted.

use crate::machine::{
    ApprovalState, ConferenceState, ConflictState, DecisionState, GroupState, ProjectState,
    RunState, TaskState,
};
use apiary_core::canon::canonical_json_bytes;
use apiary_core::{AccessMode, EntityKind, EventId, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectView {
    pub project_id: String,
    pub name: String,
    pub state: ProjectState,
    pub group_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupView {
    pub group_id: String,
    pub project_id: String,
    pub name: String,
    pub state: GroupState,
    /// Complete the group once every owned run is terminal.
    #[serde(default)]
    pub auto_complete: bool,
    /// Swarm template the group was staffed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_reason: Option<String>,
    pub run_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: String,
    pub group_id: String,
    pub state: RunState,
    #[serde(default)]
    pub forced: bool,
    pub task_ids: Vec<String>,
    pub approval_ids: Vec<String>,
    #[serde(default)]
    pub cost_usd: f64,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub run_id: String,
    pub title: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Retryable failures consumed so far.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalView {
    pub approval_id: String,
    pub run_id: String,
    /// Event kind the approval unlocks.
    pub action: String,
    pub requested_by: String,
    pub state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionView {
    pub decision_id: String,
    pub key: String,
    pub title: String,
    pub options: Vec<String>,
    pub state: DecisionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_id: Option<String>,
    pub proposed_by: String,
    /// The `decision.proposed` event, parent of the eventual application.
    pub proposal_event: EventId,
    pub updated_at: String,
}

/// One side of a conflict, as recorded in `conflict.detected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRef {
    pub group_id: String,
    pub resource: String,
    pub mode: AccessMode,
    /// `claim.registered` event that created the claim.
    pub event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictView {
    pub conflict_id: String,
    pub resource: String,
    pub severity: Severity,
    pub claims: Vec<ClaimRef>,
    pub state: ConflictState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_to: Option<String>,
    pub detected_at: String,
    pub updated_at: String,
}

/// A participant's position in a conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Approve,
    Reject,
    Abstain,
}

impl Stance {
    pub fn as_str(self) -> &'static str {
        match self {
            Stance::Approve => "approve",
            Stance::Reject => "reject",
            Stance::Abstain => "abstain",
        }
    }
}

impl std::str::FromStr for Stance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Stance::Approve),
            "reject" => Ok(Stance::Reject),
            "abstain" => Ok(Stance::Abstain),
            other => Err(format!(
                "invalid stance: {other}. Expected: approve, reject, abstain"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpinionView {
    pub stance: Stance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    pub event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceView {
    pub conference_id: String,
    pub topic: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
    pub quorum_percentage: u32,
    /// Latest opinion per participant.
    pub opinions: BTreeMap<String, OpinionView>,
    pub state: ConferenceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    pub opened_at: String,
    pub updated_at: String,
}

/// Affirmative opinions counted against the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub required: usize,
    /// Option with the most affirmative opinions (ties: lexically first).
    pub leading: Option<String>,
    pub affirmative: usize,
}

impl Tally {
    pub fn reached(&self) -> bool {
        self.affirmative >= self.required && self.leading.is_some()
    }
}

/// `ceil(participants * pct / 100)`, at least one.
pub fn quorum_size(participants: usize, quorum_percentage: u32) -> usize {
    let needed = (participants * quorum_percentage as usize).div_ceil(100);
    needed.max(1)
}

impl ConferenceView {
    pub fn tally(&self) -> Tally {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for opinion in self.opinions.values() {
            if opinion.stance != Stance::Approve {
                continue;
            }
            if let Some(option) = opinion.option.as_deref() {
                *counts.entry(option).or_default() += 1;
            }
        }
        let mut leading: Option<(&str, usize)> = None;
        for (option, n) in counts {
            if leading.map_or(true, |(_, best)| n > best) {
                leading = Some((option, n));
            }
        }
        Tally {
            required: quorum_size(self.participants.len(), self.quorum_percentage),
            leading: leading.map(|(o, _)| o.to_string()),
            affirmative: leading.map_or(0, |(_, n)| n),
        }
    }

    /// Event ids of every recorded opinion, in participant order.
    pub fn opinion_events(&self) -> Vec<EventId> {
        self.opinions.values().map(|o| o.event_id.clone()).collect()
    }
}

/// Snapshot of any one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Projection {
    Project(ProjectView),
    Group(GroupView),
    Run(RunView),
    Task(TaskView),
    ApprovalRequest(ApprovalView),
    Decision(DecisionView),
    Conflict(ConflictView),
    Conference(ConferenceView),
}

impl Projection {
    pub fn entity(&self) -> EntityKind {
        match self {
            Projection::Project(_) => EntityKind::Project,
            Projection::Group(_) => EntityKind::Group,
            Projection::Run(_) => EntityKind::Run,
            Projection::Task(_) => EntityKind::Task,
            Projection::ApprovalRequest(_) => EntityKind::ApprovalRequest,
            Projection::Decision(_) => EntityKind::Decision,
            Projection::Conflict(_) => EntityKind::Conflict,
            Projection::Conference(_) => EntityKind::Conference,
        }
    }

    pub fn state(&self) -> &'static str {
        use crate::machine::Lifecycle;
        match self {
            Projection::Project(v) => v.state.as_str(),
            Projection::Group(v) => v.state.as_str(),
            Projection::Run(v) => v.state.as_str(),
            Projection::Task(v) => v.state.as_str(),
            Projection::ApprovalRequest(v) => v.state.as_str(),
            Projection::Decision(v) => v.state.as_str(),
            Projection::Conflict(v) => v.state.as_str(),
            Projection::Conference(v) => v.state.as_str(),
        }
    }

    /// Canonical JSON bytes; equal for equal snapshots.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match serde_json::to_value(self) {
            Ok(value) => canonical_json_bytes(&value),
            Err(_) => Vec::new(),
        }
    }
}
