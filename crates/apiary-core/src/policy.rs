//! Policy gate: a pure table from (ActionClass, TrustLevel) to a verdict.
//!
//! No I/O and no side effects. Callers turn `RequireApproval` into an
//! approval request and hold the gated action until it is approved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered actor privilege tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Limited,
    Standard,
    Elevated,
    Full,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Untrusted,
        TrustLevel::Limited,
        TrustLevel::Standard,
        TrustLevel::Elevated,
        TrustLevel::Full,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Limited => "limited",
            TrustLevel::Standard => "standard",
            TrustLevel::Elevated => "elevated",
            TrustLevel::Full => "full",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustLevel::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown trust level: {s}. Expected: untrusted, limited, standard, elevated, full"
                )
            })
    }
}

/// How far-reaching an action is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    ReadOnly,
    Reversible,
    Irreversible,
}

impl ActionClass {
    pub const ALL: [ActionClass; 3] = [
        ActionClass::ReadOnly,
        ActionClass::Reversible,
        ActionClass::Irreversible,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionClass::ReadOnly => "read_only",
            ActionClass::Reversible => "reversible",
            ActionClass::Irreversible => "irreversible",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allow,
    Deny,
    Approve,
}

// Rows: ActionClass in declaration order. Columns: TrustLevel in ascending order.
const POLICY_TABLE: [[Verdict; 5]; 3] = {
    use Verdict::{Allow as A, Approve as R, Deny as D};
    [
        [A, A, A, A, A], // read_only
        [D, R, A, A, A], // reversible
        [D, D, R, A, A], // irreversible
    ]
};

fn verdict(trust: TrustLevel, action: ActionClass) -> Verdict {
    POLICY_TABLE[action as usize][trust as usize]
}

/// Why the gate refused outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyReason {
    pub trust: TrustLevel,
    pub action: ActionClass,
    /// Lowest tier that could perform the action at all (possibly with approval).
    pub minimum_trust: Option<TrustLevel>,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trust level `{}` may not perform {} actions",
            self.trust, self.action
        )?;
        if let Some(min) = self.minimum_trust {
            write!(f, " (requires at least `{min}`)")?;
        }
        Ok(())
    }
}

/// Outcome of [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyOutcome {
    Allow,
    Deny { reason: DenyReason },
    RequireApproval { reason: String },
}

impl PolicyOutcome {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyOutcome::Allow)
    }
}

/// Decide whether an actor at `trust` may perform an action of class `action`.
pub fn authorize(trust: TrustLevel, action: ActionClass) -> PolicyOutcome {
    match verdict(trust, action) {
        Verdict::Allow => PolicyOutcome::Allow,
        Verdict::Approve => PolicyOutcome::RequireApproval {
            reason: format!(
                "{action} actions by `{trust}` actors need an approved request (allowed outright from `{}`)",
                minimum_trust_for(action, false)
                    .map(|t| t.as_str())
                    .unwrap_or("nobody")
            ),
        },
        Verdict::Deny => PolicyOutcome::Deny {
            reason: DenyReason {
                trust,
                action,
                minimum_trust: minimum_trust_for(action, true),
            },
        },
    }
}

/// Lowest tier the table does not deny. With `with_approval = false`, the
/// lowest tier allowed outright.
pub fn minimum_trust_for(action: ActionClass, with_approval: bool) -> Option<TrustLevel> {
    TrustLevel::ALL.into_iter().find(|t| match verdict(*t, action) {
        Verdict::Allow => true,
        Verdict::Approve => with_approval,
        Verdict::Deny => false,
    })
}
