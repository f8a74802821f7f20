//! Safety monitor: per-scope anomaly detection on the live event stream.
//!
//! Each Run and Group gets a registry entry on its first event. Entries
//! are marked when the scope reaches a terminal state and evicted once
//! `retention_secs` have passed since.

use apiary_core::config::{SafetyConfig, Thresholds};
use apiary_core::{DecodedKind, Event, EventKind, SAFETY_MONITOR_ACTOR};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use time::{Duration, OffsetDateTime};

/// What a safety alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Too many events inside one window.
    Runaway,
    /// The same entity re-entered the same step too often.
    Oscillation,
    /// Cumulative cost crossed the configured ceiling.
    CostExceeded,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Runaway => "runaway",
            AlertKind::Oscillation => "oscillation",
            AlertKind::CostExceeded => "cost_exceeded",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitored scope: a Run segment or a Group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Run(String),
    Group(String),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Run(id) => write!(f, "run:{id}"),
            ScopeKey::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// One threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub scope: String,
    /// Group to suspend when auto-suspend is on.
    pub group_id: Option<String>,
    pub observed: f64,
    pub limit: f64,
    pub detail: String,
    /// Event that tipped the threshold.
    pub trigger: String,
}

impl Alert {
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "alert": self.kind.as_str(),
            "scope": self.scope,
            "observed": self.observed,
            "limit": self.limit,
            "detail": self.detail,
        });
        if let Some(group_id) = &self.group_id {
            payload["group_id"] = serde_json::Value::String(group_id.clone());
        }
        payload
    }
}

#[derive(Debug)]
struct ScopeState {
    window: VecDeque<OffsetDateTime>,
    visits: HashMap<(String, EventKind), u32>,
    cost_usd: f64,
    raised: HashSet<AlertKind>,
    group_id: Option<String>,
    terminal_at: Option<OffsetDateTime>,
}

impl ScopeState {
    fn new(group_id: Option<String>) -> Self {
        Self {
            window: VecDeque::new(),
            visits: HashMap::new(),
            cost_usd: 0.0,
            raised: HashSet::new(),
            group_id,
            terminal_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    window: Duration,
    max_events: u32,
    max_loops: u32,
    max_cost: Option<f64>,
    retention: Duration,
}

pub struct SafetyMonitor {
    limits: Limits,
    scopes: Mutex<HashMap<ScopeKey, ScopeState>>,
}

/// Kinds whose repetition on one entity counts as a revisit.
fn counts_as_visit(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::TaskAssigned
            | EventKind::TaskStarted
            | EventKind::TaskFailed
            | EventKind::GroupSuspended
            | EventKind::GroupResumed
            | EventKind::ApprovalRequested
    )
}

impl SafetyMonitor {
    pub fn new(safety: &SafetyConfig, thresholds: &Thresholds) -> Self {
        Self {
            limits: Limits {
                window: Duration::seconds(safety.window_secs as i64),
                max_events: safety.max_events_per_window,
                max_loops: thresholds.max_loop_count,
                max_cost: safety.max_cost_usd,
                retention: Duration::seconds(safety.retention_secs as i64),
            },
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Scope an event is counted under, with its owning Group if known.
    fn scope_of(
        event: &Event,
        kind: Option<EventKind>,
        run_group: Option<&str>,
    ) -> Option<(ScopeKey, Option<String>)> {
        if let Some(run_id) = &event.scope_id {
            return Some((ScopeKey::Run(run_id.clone()), run_group.map(str::to_string)));
        }
        let group_id = event.payload_str("group_id");
        if group_id.is_empty() || kind == Some(EventKind::SafetyAlert) {
            return None;
        }
        Some((ScopeKey::Group(group_id.to_string()), Some(group_id.to_string())))
    }

    /// Feed one stored event. `run_group` is the Group owning the event's
    /// Run, when it has one. Returns newly crossed thresholds.
    ///
    /// The monitor's own writes are not counted.
    pub fn observe(&self, event: &Event, run_group: Option<&str>) -> Vec<Alert> {
        if event.actor == SAFETY_MONITOR_ACTOR {
            return Vec::new();
        }
        let now = event.timestamp().unwrap_or_else(OffsetDateTime::now_utc);
        let kind = match event.decoded_kind() {
            DecodedKind::Known(kind) => Some(kind),
            DecodedKind::Unknown(_) => None,
        };
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_locked(&mut scopes, now);

        let Some((key, group_id)) = Self::scope_of(event, kind, run_group) else {
            return Vec::new();
        };
        let state = scopes
            .entry(key.clone())
            .or_insert_with(|| ScopeState::new(group_id));
        let mut alerts = Vec::new();
        let limits = self.limits;
        let mut raise = |state: &mut ScopeState,
                         kind: AlertKind,
                         observed: f64,
                         limit: f64,
                         detail: String| {
            if state.raised.insert(kind) {
                alerts.push(Alert {
                    kind,
                    scope: key.to_string(),
                    group_id: state.group_id.clone(),
                    observed,
                    limit,
                    detail,
                    trigger: event.id.clone(),
                });
            }
        };

        // Runaway
        state.window.push_back(now);
        while state
            .window
            .front()
            .is_some_and(|t| now - *t > limits.window)
        {
            state.window.pop_front();
        }
        let in_window = state.window.len() as u32;
        if in_window > limits.max_events {
            raise(
                state,
                AlertKind::Runaway,
                in_window as f64,
                limits.max_events as f64,
                format!("{in_window} events within {}s", limits.window.whole_seconds()),
            );
        } else {
            state.raised.remove(&AlertKind::Runaway);
        }

        // Oscillation
        if let Some(kind) = kind.filter(|k| counts_as_visit(*k)) {
            let subject = kind
                .spec()
                .subject
                .map(|field| event.payload_str(field).to_string())
                .unwrap_or_default();
            let visits = state.visits.entry((subject.clone(), kind)).or_default();
            *visits += 1;
            let visits = *visits;
            if visits > limits.max_loops {
                raise(
                    state,
                    AlertKind::Oscillation,
                    visits as f64,
                    limits.max_loops as f64,
                    format!("`{subject}` hit {kind} {visits} times"),
                );
            }
        }

        // Cost
        if let Some(cost) = event.payload.get("cost_usd").and_then(|v| v.as_f64()) {
            state.cost_usd += cost;
            if let Some(max) = limits.max_cost {
                if state.cost_usd > max {
                    let spent = state.cost_usd;
                    raise(
                        state,
                        AlertKind::CostExceeded,
                        spent,
                        max,
                        format!("spent ${spent:.2} of ${max:.2}"),
                    );
                }
            }
        }

        if kind.is_some_and(EventKind::is_terminal_for_scope) {
            state.terminal_at = Some(now);
        }

        for alert in &alerts {
            tracing::warn!(
                alert = %alert.kind,
                scope = %alert.scope,
                observed = alert.observed,
                limit = alert.limit,
                "safety threshold crossed"
            );
        }
        alerts
    }

    fn evict_locked(&self, scopes: &mut HashMap<ScopeKey, ScopeState>, now: OffsetDateTime) {
        let retention = self.limits.retention;
        scopes.retain(|key, state| {
            let keep = state.terminal_at.map_or(true, |at| now - at <= retention);
            if !keep {
                tracing::debug!(scope = %key, "safety scope evicted");
            }
            keep
        });
    }

    /// Drop terminal scopes older than the retention period.
    pub fn evict(&self, now: OffsetDateTime) {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_locked(&mut scopes, now);
    }

    pub fn is_tracked(&self, key: &ScopeKey) -> bool {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn tracked(&self) -> usize {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
