//! Registry of active resource claims held by Groups.
//!
//! The only shared mutable state outside the ledger. It is rebuilt from
//! `claim.*` and terminal `group.*` events at startup and kept current as
//! they are recorded. A Group that ends holds no claims.

use apiary_core::{AccessMode, Event, EventId, EventKind};
use apiary_derive::projection::ClaimRef;
use globset::Glob;

/// How two resource names relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Same resource.
    Exact,
    /// Different names that may touch the same artifact: one is a glob
    /// matching the other, or one is a path prefix of the other.
    Near,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub group_id: String,
    pub resource: String,
    pub mode: AccessMode,
    pub event_id: EventId,
}

impl Claim {
    /// Read a claim from a `claim.registered` event.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != EventKind::ClaimRegistered.as_str() {
            return None;
        }
        Some(Self {
            group_id: event.payload_str("group_id").to_string(),
            resource: event.payload_str("resource").to_string(),
            mode: event.payload_str("mode").parse().ok()?,
            event_id: event.id.clone(),
        })
    }

    pub fn to_ref(&self) -> ClaimRef {
        ClaimRef {
            group_id: self.group_id.clone(),
            resource: self.resource.clone(),
            mode: self.mode,
            event_id: self.event_id.clone(),
        }
    }
}

fn is_glob(resource: &str) -> bool {
    resource.contains(|c| matches!(c, '*' | '?' | '[' | '{'))
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(candidate))
        .unwrap_or(false)
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    !prefix.is_empty()
        && path.len() > prefix.len()
        && path.starts_with(prefix)
        && path[prefix.len()..].starts_with('/')
}

/// Relation between two resource names, if any.
pub fn overlap(a: &str, b: &str) -> Option<Overlap> {
    let a = a.replace('\\', "/");
    let b = b.replace('\\', "/");
    if a == b {
        return Some(Overlap::Exact);
    }
    let near = (is_glob(&a) && glob_matches(&a, &b))
        || (is_glob(&b) && glob_matches(&b, &a))
        || is_path_prefix(&a, &b)
        || is_path_prefix(&b, &a);
    near.then_some(Overlap::Near)
}

/// Active claims in registration order.
#[derive(Debug, Clone, Default)]
pub struct ClaimRegistry {
    claims: Vec<Claim>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `claim.*` events in order.
    pub fn rebuild<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut registry = Self::new();
        for event in events {
            registry.observe(event);
        }
        registry
    }

    /// Keep the registry in step with one stored event.
    pub fn observe(&mut self, event: &Event) {
        match EventKind::parse(&event.kind) {
            Some(EventKind::ClaimRegistered) => {
                if let Some(claim) = Claim::from_event(event) {
                    self.register(claim);
                }
            }
            Some(EventKind::ClaimReleased) | Some(EventKind::ClaimDenied) => {
                self.remove(event.payload_str("group_id"), event.payload_str("resource"));
            }
            Some(EventKind::GroupCompleted | EventKind::GroupFailed | EventKind::GroupCancelled) => {
                self.release_group(event.payload_str("group_id"));
            }
            _ => {}
        }
    }

    /// Add a claim; a Group re-claiming a resource replaces its old mode.
    pub fn register(&mut self, claim: Claim) {
        self.remove(&claim.group_id, &claim.resource);
        self.claims.push(claim);
    }

    pub fn remove(&mut self, group_id: &str, resource: &str) -> Option<Claim> {
        let pos = self
            .claims
            .iter()
            .position(|c| c.group_id == group_id && c.resource == resource)?;
        Some(self.claims.remove(pos))
    }

    /// Drop every claim a Group holds. Returns how many were dropped.
    pub fn release_group(&mut self, group_id: &str) -> usize {
        let before = self.claims.len();
        self.claims.retain(|c| c.group_id != group_id);
        before - self.claims.len()
    }

    pub fn active(&self) -> &[Claim] {
        &self.claims
    }

    pub fn of_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a Claim> {
        self.claims.iter().filter(move |c| c.group_id == group_id)
    }

    /// Position in registration order; earlier claims rank first.
    pub fn rank(&self, event_id: &str) -> Option<usize> {
        self.claims.iter().position(|c| c.event_id == event_id)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
