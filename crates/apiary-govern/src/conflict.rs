//! Conflict detection and resolution planning over resource claims.
//!
//! Everything here is pure; the kernel records what it decides.

use crate::claims::{overlap, Claim, ClaimRegistry, Overlap};
use apiary_core::config::ConflictConfig;
use apiary_core::{AccessMode, ResolutionStrategy, Severity};

/// A conflict found when a new claim meets the active set.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub resource: String,
    pub severity: Severity,
    /// The new claim first, then every active claim it collides with.
    pub claims: Vec<Claim>,
}

fn pair_severity(relation: Overlap, a: AccessMode, b: AccessMode) -> Option<Severity> {
    match (relation, a.is_mutating(), b.is_mutating()) {
        (_, false, false) => None,
        (Overlap::Near, _, _) => Some(Severity::Low),
        (Overlap::Exact, true, true) => Some(Severity::High),
        (Overlap::Exact, _, _) => Some(Severity::Medium),
    }
}

/// Check a new claim against active ones. Claims from the claimant's own
/// Group never conflict. Severity is the worst pairwise severity.
pub fn detect(new: &Claim, active: &[Claim]) -> Option<DetectedConflict> {
    let mut severity: Option<Severity> = None;
    let mut claims = vec![new.clone()];
    for other in active {
        if other.group_id == new.group_id || other.event_id == new.event_id {
            continue;
        }
        let Some(relation) = overlap(&new.resource, &other.resource) else {
            continue;
        };
        if let Some(s) = pair_severity(relation, new.mode, other.mode) {
            severity = severity.max(Some(s));
            claims.push(other.clone());
        }
    }
    severity.map(|severity| DetectedConflict {
        resource: new.resource.clone(),
        severity,
        claims,
    })
}

/// What to do with a detected conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Settle now: `winner` keeps its claim, every other Group's is denied.
    Auto {
        strategy: ResolutionStrategy,
        winner: String,
    },
    /// Hand off. `target` is `conference` or `user`.
    Escalate { target: &'static str },
}

/// Pick the strategy for a conflict under the configured thresholds.
pub fn plan_resolution(
    conflict: &DetectedConflict,
    registry: &ClaimRegistry,
    config: &ConflictConfig,
) -> Resolution {
    if !config.auto_resolve {
        return Resolution::Escalate { target: "user" };
    }
    if conflict.severity > config.auto_resolve_max_severity
        || config.default_strategy == ResolutionStrategy::Escalate
    {
        return Resolution::Escalate { target: "conference" };
    }
    match pick_winner(&conflict.claims, config.default_strategy, registry, config) {
        Some(winner) => Resolution::Auto {
            strategy: config.default_strategy,
            winner,
        },
        None => Resolution::Escalate { target: "user" },
    }
}

/// The Group that keeps its claim under `strategy`. `None` for
/// `escalate`, which names no winner, or for an empty claim set.
///
/// Claims no longer in the registry rank after registered ones, in id
/// order, which is registration order for `evt_<ulid>` ids.
pub fn pick_winner(
    claims: &[Claim],
    strategy: ResolutionStrategy,
    registry: &ClaimRegistry,
    config: &ConflictConfig,
) -> Option<String> {
    match strategy {
        ResolutionStrategy::FirstClaimWins => first_claim(claims, registry),
        ResolutionStrategy::StaticPriority => by_priority(claims, registry, config),
        ResolutionStrategy::Escalate => None,
    }
}

fn first_claim(claims: &[Claim], registry: &ClaimRegistry) -> Option<String> {
    claims
        .iter()
        .min_by_key(|c| (registry.rank(&c.event_id).unwrap_or(usize::MAX), c.event_id.as_str()))
        .map(|c| c.group_id.clone())
}

/// Highest configured precedence wins; ties fall back to first claim.
fn by_priority(claims: &[Claim], registry: &ClaimRegistry, config: &ConflictConfig) -> Option<String> {
    let priority = |c: &Claim| config.group_priority.get(&c.group_id).copied().unwrap_or(0);
    let best = claims.iter().map(priority).max()?;
    let tied: Vec<Claim> = claims.iter().filter(|c| priority(c) == best).cloned().collect();
    first_claim(&tied, registry)
}
