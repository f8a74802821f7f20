//! Offline chain verification. Reports, never repairs.

use crate::paths::segment_name;
use crate::segment;
use crate::store::EventStore;
use apiary_core::event::verify_event_hash;
use apiary_core::hash::HASH_ALG;
use apiary_core::{Event, KernelError, Result};
use serde::Serialize;

/// One integrity failure, attributed to the event that was altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub event_id: String,
    /// 1-based line in the segment file; 0 when the event is missing.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub segment: String,
    pub events_checked: usize,
    pub breaks: Vec<ChainBreak>,
    /// Events written after the tip anchor was last refreshed (a crash
    /// between append and anchor write leaves a lag).
    pub anchor_lag: usize,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.breaks.is_empty()
    }

    /// The first break as a `ChainIntegrity` error.
    pub fn into_result(self) -> Result<Self> {
        match self.breaks.first() {
            None => Ok(self),
            Some(b) => Err(KernelError::ChainIntegrity {
                segment: self.segment.clone(),
                event_id: b.event_id.clone(),
                reason: b.reason.clone(),
            }),
        }
    }

    fn flag(&mut self, event_id: &str, line: usize, reason: impl Into<String>) {
        if self.breaks.iter().any(|b| b.event_id == event_id) {
            return;
        }
        self.breaks.push(ChainBreak {
            event_id: event_id.to_string(),
            line,
            reason: reason.into(),
        });
    }
}

impl EventStore {
    /// Recompute every hash and every link of one segment, then compare the
    /// final event against the tip anchor.
    ///
    /// A broken link between two self-consistent events is attributed by
    /// looking one link further: if the successor's own outgoing link (or
    /// the anchor, at the tail) no longer matches its hash, the successor
    /// was rewritten; otherwise the predecessor was.
    pub fn verify_chain(&self, scope: Option<&str>) -> Result<ChainReport> {
        let (file, anchor_path) = self.segment_paths(scope)?;
        let mut report = ChainReport {
            segment: segment_name(scope),
            events_checked: 0,
            breaks: Vec::new(),
            anchor_lag: 0,
        };

        // `None` marks an unparseable line; links across it cannot be judged.
        let mut entries: Vec<(usize, Option<Event>)> = Vec::new();
        for (line, text) in segment::read_lines(&file)? {
            report.events_checked += 1;
            match serde_json::from_str::<Event>(&text) {
                Ok(event) => entries.push((line, Some(event))),
                Err(e) => {
                    report.flag(&format!("line {line}"), line, format!("unparseable: {e}"));
                    entries.push((line, None));
                }
            }
        }
        let anchor = segment::read_anchor(&anchor_path)?;

        for (i, (line, event)) in entries.iter().enumerate() {
            let Some(event) = event else { continue };
            let own_ok = verify_event_hash(event);
            if !own_ok {
                report.flag(&event.id, *line, "stored hash does not match recomputed hash");
            }
            let predecessor = i.checked_sub(1).map(|p| &entries[p]);
            if own_ok && link(&entries, i) == Link::Broken {
                match predecessor {
                    None => report.flag(&event.id, *line, "first event of segment has a prev_hash"),
                    Some((p_line, Some(p))) if verify_event_hash(p) => {
                        let successor_rewritten = if i + 1 < entries.len() {
                            link(&entries, i + 1) == Link::Broken
                        } else {
                            anchor
                                .as_ref()
                                .is_some_and(|a| a.event_id == event.id && a.hash != event.hash)
                        };
                        if successor_rewritten {
                            report.flag(
                                &event.id,
                                *line,
                                format!("prev_hash does not match hash of predecessor {}", p.id),
                            );
                        } else {
                            report.flag(
                                &p.id,
                                *p_line,
                                format!("hash no longer matches prev_hash of successor {}", event.id),
                            );
                        }
                    }
                    // Predecessor already flagged.
                    _ => {}
                }
            }
            if let Some((_, Some(p))) = predecessor {
                if event.timestamp() < p.timestamp() {
                    report.flag(&event.id, *line, format!("timestamp precedes {}", p.id));
                }
            }
        }

        if let Some(anchor) = anchor {
            let parsed: Vec<(usize, &Event)> = entries
                .iter()
                .filter_map(|(line, e)| e.as_ref().map(|e| (*line, e)))
                .collect();
            if anchor.alg != HASH_ALG {
                report.flag(
                    &anchor.event_id,
                    0,
                    format!("tip anchor uses unsupported digest `{}`", anchor.alg),
                );
            }
            match parsed.iter().position(|(_, e)| e.id == anchor.event_id) {
                None => report.flag(
                    &anchor.event_id,
                    0,
                    "tip anchor names an event missing from the segment",
                ),
                Some(idx) => {
                    let (line, event) = parsed[idx];
                    if event.hash != anchor.hash {
                        report.flag(&event.id, line, "hash differs from tip anchor");
                    }
                    report.anchor_lag = parsed.len() - 1 - idx;
                }
            }
        }

        if report.is_intact() {
            tracing::debug!(segment = %report.segment, events = report.events_checked, "chain verified");
        } else {
            for b in &report.breaks {
                tracing::warn!(segment = %report.segment, event_id = %b.event_id, line = b.line, reason = %b.reason, "chain break");
            }
        }
        Ok(report)
    }

    /// Verify every segment.
    pub fn verify_all(&self) -> Result<Vec<ChainReport>> {
        self.segments()?
            .iter()
            .map(|scope| self.verify_chain(scope.as_deref()))
            .collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Link {
    Intact,
    Broken,
    Unknown,
}

/// State of the link into entry `i`.
fn link(entries: &[(usize, Option<Event>)], i: usize) -> Link {
    let Some(event) = &entries[i].1 else {
        return Link::Unknown;
    };
    let expected = match i.checked_sub(1) {
        None => None,
        Some(p) => match &entries[p].1 {
            Some(p) => Some(p.hash.as_str()),
            None => return Link::Unknown,
        },
    };
    if event.prev_hash.as_deref() == expected {
        Link::Intact
    } else {
        Link::Broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::RetryPolicy;
    use apiary_core::event::{compute_event_hash, EventDraft};
    use apiary_core::EventKind;
    use serde_json::json;

    fn populated(n: usize) -> (tempfile::TempDir, EventStore, Vec<Event>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
        let events = (0..n)
            .map(|i| {
                store
                    .append_draft(
                        EventDraft::new(
                            EventKind::TaskCreated,
                            "alice",
                            json!({"task_id": format!("t{i}"), "title": "work"}),
                        )
                        .in_run("r1"),
                    )
                    .unwrap()
            })
            .collect();
        (tmp, store, events)
    }

    fn rewrite(store: &EventStore, events: &[Event]) {
        let (file, _) = store.segment_paths(Some("r1")).unwrap();
        let mut text = String::new();
        for e in events {
            text.push_str(&serde_json::to_string(e).unwrap());
            text.push('\n');
        }
        std::fs::write(file, text).unwrap();
    }

    #[test]
    fn accepted_sequence_verifies() {
        let (_tmp, store, _) = populated(5);
        let report = store.verify_chain(Some("r1")).unwrap();
        assert!(report.is_intact(), "{report:?}");
        assert_eq!(report.events_checked, 5);
        assert_eq!(report.anchor_lag, 0);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn rehashed_middle_event_is_blamed() {
        let (_tmp, store, mut events) = populated(5);
        events[2].payload["title"] = json!("forged");
        events[2].hash = compute_event_hash(&events[2]).unwrap();
        rewrite(&store, &events);

        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1, "{report:?}");
        assert_eq!(report.breaks[0].event_id, events[2].id);
        match report.into_result() {
            Err(KernelError::ChainIntegrity { event_id, .. }) => assert_eq!(event_id, events[2].id),
            other => panic!("expected chain error, got {other:?}"),
        }
    }

    #[test]
    fn relinked_event_is_blamed_not_its_predecessor() {
        let (_tmp, store, mut events) = populated(5);
        events[2].prev_hash = Some(events[0].hash.clone());
        events[2].hash = compute_event_hash(&events[2]).unwrap();
        rewrite(&store, &events);

        let report = store.verify_chain(Some("r1")).unwrap();
        let ids: Vec<&str> = report.breaks.iter().map(|b| b.event_id.as_str()).collect();
        assert_eq!(ids, vec![events[2].id.as_str()], "{report:?}");
        assert_eq!(report.breaks[0].line, 3);
    }

    #[test]
    fn relinked_tail_is_blamed() {
        let (_tmp, store, mut events) = populated(3);
        events[2].prev_hash = Some(events[0].hash.clone());
        events[2].hash = compute_event_hash(&events[2]).unwrap();
        rewrite(&store, &events);

        let report = store.verify_chain(Some("r1")).unwrap();
        let ids: Vec<&str> = report.breaks.iter().map(|b| b.event_id.as_str()).collect();
        assert_eq!(ids, vec![events[2].id.as_str()], "{report:?}");
    }

    #[test]
    fn rehashed_penultimate_event_is_blamed() {
        let (_tmp, store, mut events) = populated(3);
        events[1].payload["title"] = json!("forged");
        events[1].hash = compute_event_hash(&events[1]).unwrap();
        rewrite(&store, &events);

        let report = store.verify_chain(Some("r1")).unwrap();
        let ids: Vec<&str> = report.breaks.iter().map(|b| b.event_id.as_str()).collect();
        assert_eq!(ids, vec![events[1].id.as_str()], "{report:?}");
    }

    #[test]
    fn unhashed_mutation_is_blamed() {
        let (_tmp, store, mut events) = populated(4);
        events[1].actor = "mallory".into();
        rewrite(&store, &events);
        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1);
        assert_eq!(report.breaks[0].event_id, events[1].id);
        assert_eq!(report.breaks[0].line, 2);
    }

    #[test]
    fn rehashed_tail_caught_by_anchor() {
        let (_tmp, store, mut events) = populated(3);
        events[2].payload["title"] = json!("forged");
        events[2].hash = compute_event_hash(&events[2]).unwrap();
        rewrite(&store, &events);
        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1);
        assert_eq!(report.breaks[0].event_id, events[2].id);
    }

    #[test]
    fn truncation_caught_by_anchor() {
        let (_tmp, store, events) = populated(3);
        rewrite(&store, &events[..2]);
        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1);
        assert_eq!(report.breaks[0].event_id, events[2].id);
        assert_eq!(report.breaks[0].line, 0);
    }

    #[test]
    fn foreign_anchor_digest_reported() {
        let (_tmp, store, events) = populated(2);
        let (_, anchor_path) = store.segment_paths(Some("r1")).unwrap();
        let mut anchor = segment::TipAnchor::of(&events[1]);
        anchor.alg = "blake3".into();
        segment::write_anchor(&anchor_path, &anchor).unwrap();
        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1);
        assert!(report.breaks[0].reason.contains("blake3"), "{report:?}");
    }

    #[test]
    fn garbage_line_reported() {
        let (_tmp, store, _) = populated(2);
        let (file, _) = store.segment_paths(Some("r1")).unwrap();
        let mut text = std::fs::read_to_string(&file).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&file, text).unwrap();
        let report = store.verify_chain(Some("r1")).unwrap();
        assert_eq!(report.breaks.len(), 1);
        assert_eq!(report.breaks[0].event_id, "line 3");
    }

    #[test]
    fn empty_segment_is_intact() {
        let (_tmp, store, _) = populated(0);
        assert!(store.verify_chain(Some("r1")).unwrap().is_intact());
        assert!(store.verify_all().unwrap().is_empty());
    }
}
