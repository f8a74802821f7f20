//! Derived causal index over `parents`: who an event came from, and what
//! followed from it.

use apiary_core::{Event, EventId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ancestors,
    Descendants,
    Both,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ancestors" | "up" => Ok(Direction::Ancestors),
            "descendants" | "down" => Ok(Direction::Descendants),
            "both" => Ok(Direction::Both),
            other => Err(format!(
                "invalid direction: {other}. Expected: ancestors, descendants, both"
            )),
        }
    }
}

/// Traversal result in breadth-first order, the start id excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageResult {
    pub ids: Vec<EventId>,
    /// More events lie beyond `max_depth`.
    pub truncated: bool,
}

#[derive(Debug, Default)]
pub struct LineageIndex {
    parents: HashMap<EventId, Vec<EventId>>,
    children: HashMap<EventId, Vec<EventId>>,
}

impl LineageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut index = Self::new();
        for event in events {
            index.insert(event);
        }
        index
    }

    /// Idempotent: re-inserting an event does not duplicate edges.
    pub fn insert(&mut self, event: &Event) {
        if self.parents.contains_key(&event.id) {
            return;
        }
        self.parents.insert(event.id.clone(), event.parents.clone());
        for parent in &event.parents {
            let kids = self.children.entry(parent.clone()).or_default();
            if !kids.contains(&event.id) {
                kids.push(event.id.clone());
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parents_of(&self, id: &str) -> &[EventId] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children_of(&self, id: &str) -> &[EventId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ancestors(&self, id: &str, max_depth: usize) -> LineageResult {
        self.walk(id, max_depth, |n| self.parents_of(n))
    }

    pub fn descendants(&self, id: &str, max_depth: usize) -> LineageResult {
        self.walk(id, max_depth, |n| self.children_of(n))
    }

    pub fn lineage(&self, id: &str, direction: Direction, max_depth: usize) -> LineageResult {
        match direction {
            Direction::Ancestors => self.ancestors(id, max_depth),
            Direction::Descendants => self.descendants(id, max_depth),
            Direction::Both => {
                let up = self.ancestors(id, max_depth);
                let down = self.descendants(id, max_depth);
                let mut seen: HashSet<EventId> = up.ids.iter().cloned().collect();
                let mut ids = up.ids;
                ids.extend(down.ids.into_iter().filter(|d| seen.insert(d.clone())));
                LineageResult {
                    ids,
                    truncated: up.truncated || down.truncated,
                }
            }
        }
    }

    /// Breadth-first walk with a visited set; cycles in malformed input
    /// terminate. Never fails: unknown ids yield an empty result.
    fn walk<'a, F>(&'a self, start: &str, max_depth: usize, next: F) -> LineageResult
    where
        F: Fn(&str) -> &'a [EventId],
    {
        let mut result = LineageResult::default();
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(start, 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            for neighbour in next(current) {
                if visited.contains(neighbour.as_str()) {
                    continue;
                }
                if depth >= max_depth {
                    result.truncated = true;
                    break;
                }
                visited.insert(neighbour.as_str());
                result.ids.push(neighbour.clone());
                queue.push_back((neighbour.as_str(), depth + 1));
            }
        }
        result
    }
}
