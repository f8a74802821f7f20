use apiary_core::event::{seal, EventDraft};
use apiary_core::{Event, EventKind};
use serde_json::Value;

/// Chained in-memory event sequence for fold tests.
pub struct Script {
    pub events: Vec<Event>,
}

impl Script {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Seal an event on the current tip without recording it.
    pub fn draft(&self, scope: Option<&str>, kind: EventKind, payload: Value) -> Event {
        self.seal_raw(scope, kind.as_str(), payload)
    }

    pub fn push(&mut self, scope: Option<&str>, kind: EventKind, payload: Value) -> &Event {
        self.push_raw(scope, kind.as_str(), payload)
    }

    pub fn push_raw(&mut self, scope: Option<&str>, kind: &str, payload: Value) -> &Event {
        let event = self.seal_raw(scope, kind, payload);
        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    fn seal_raw(&self, scope: Option<&str>, kind: &str, payload: Value) -> Event {
        let tip = self.events.last();
        seal(
            EventDraft::raw(kind, "tester", payload).in_scope(scope),
            tip.map(|e| e.hash.as_str()),
            tip.map(|e| e.ts.as_str()),
        )
        .unwrap()
    }
}
