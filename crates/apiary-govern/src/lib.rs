//! Governance kernel: the single write path for the Apiary ledger.
//!
//! Collaborators submit [`Intent`]s to a [`Kernel`]; each one is gated by
//! trust policy, admitted against the folded state machines and appended to
//! its segment under that segment's writer lock.

pub mod approval;
pub mod claims;
pub mod conference;
pub mod conflict;
pub mod decisions;
pub mod intent;
pub mod kernel;
pub mod resolver;
pub mod safety;

pub use claims::{overlap, Claim, ClaimRegistry, Overlap};
pub use conference::{ConferenceOutcome, ConferenceSpec};
pub use conflict::{detect, pick_winner, plan_resolution, DetectedConflict, Resolution};
pub use intent::Intent;
pub use kernel::Kernel;
pub use resolver::ClaimOutcome;
pub use safety::{Alert, AlertKind, SafetyMonitor, ScopeKey};
