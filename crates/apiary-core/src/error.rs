//! Kernel error taxonomy.
//!
//! Every rejected mutation surfaces as one of these, synchronously, with the
//! specific kind and reason intact. Collaborators map them to transport
//! responses through [`KernelError::code`] and [`KernelError::status_hint`].

use crate::kind::EntityKind;
use crate::policy::ActionClass;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Hash or `prev_hash` mismatch. Fatal to the segment; never auto-repaired.
    #[error("chain integrity violated in segment `{segment}` at {event_id}: {reason}")]
    ChainIntegrity {
        segment: String,
        event_id: String,
        reason: String,
    },

    /// Malformed event, rejected before anything is persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition for {entity} `{entity_id}`: {from} --{kind}--> {detail}")]
    InvalidStateTransition {
        entity: EntityKind,
        entity_id: String,
        from: String,
        kind: String,
        detail: String,
    },

    #[error("policy denied {action} action `{kind}` for `{actor}`: {reason}")]
    PolicyDenied {
        actor: String,
        kind: String,
        action: ActionClass,
        reason: String,
    },

    /// The action is held until the named approval request is approved.
    #[error("`{kind}` requires approval: request `{approval_id}` is {state}")]
    ApprovalRequired {
        kind: String,
        approval_id: String,
        state: String,
    },

    #[error("conflict `{conflict_id}` unresolved: {reason}")]
    ConflictUnresolved { conflict_id: String, reason: String },

    #[error("conference `{conference_id}` ended without quorum ({affirmative}/{required} affirmative)")]
    QuorumNotReached {
        conference_id: String,
        affirmative: usize,
        required: usize,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("segment `{segment}` still locked after {attempts} attempts")]
    LockContention { segment: String, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        KernelError::Validation(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::ChainIntegrity { .. } => "chain_integrity",
            KernelError::Validation(_) => "validation",
            KernelError::InvalidStateTransition { .. } => "invalid_transition",
            KernelError::PolicyDenied { .. } => "policy_denied",
            KernelError::ApprovalRequired { .. } => "approval_required",
            KernelError::ConflictUnresolved { .. } => "conflict_unresolved",
            KernelError::QuorumNotReached { .. } => "quorum_not_reached",
            KernelError::NotFound { .. } => "not_found",
            KernelError::LockContention { .. } => "lock_contention",
            KernelError::Io(_) => "io",
            KernelError::Serialization(_) => "serialization",
        }
    }

    /// Suggested HTTP status for collaborators that speak HTTP.
    pub fn status_hint(&self) -> u16 {
        match self {
            KernelError::Validation(_) => 422,
            KernelError::PolicyDenied { .. } => 403,
            KernelError::ApprovalRequired { .. } => 202,
            KernelError::InvalidStateTransition { .. }
            | KernelError::ConflictUnresolved { .. }
            | KernelError::ChainIntegrity { .. } => 409,
            KernelError::QuorumNotReached { .. } => 408,
            KernelError::NotFound { .. } => 404,
            KernelError::LockContention { .. } => 503,
            KernelError::Io(_) | KernelError::Serialization(_) => 500,
        }
    }

    /// Transient errors the kernel itself retries before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::LockContention { .. })
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
