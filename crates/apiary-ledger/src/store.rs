//! The event store: one append-only, hash-chained JSONL segment per scope.
//!
//! Writers to a segment are serialized by an in-process mutex plus an
//! advisory file lock; readers never lock and only see complete lines.

use crate::lock::{RetryPolicy, SegmentLock};
use crate::paths::{segment_name, sidecar, ApiaryPaths};
use crate::segment::{self, TipAnchor};
use apiary_core::event::{compute_event_hash, seal, validate_event, EventDraft};
use apiary_core::{Event, EventId, KernelError, Result, ScopeId};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub struct EventStore {
    paths: ApiaryPaths,
    retry: RetryPolicy,
    writers: Mutex<HashMap<Option<ScopeId>, Arc<Mutex<()>>>>,
    ids: RwLock<HashSet<EventId>>,
}

impl EventStore {
    /// Open (creating the layout if needed) and index every stored id.
    pub fn open(root: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let paths = ApiaryPaths::discover(root);
        paths.ensure_layout()?;
        let store = Self {
            paths,
            retry,
            writers: Mutex::new(HashMap::new()),
            ids: RwLock::new(HashSet::new()),
        };
        let mut ids = HashSet::new();
        for scope in store.segments()? {
            let file = store.paths.segment_file(scope.as_deref())?;
            for (line_no, line) in segment::read_lines(&file)? {
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        ids.insert(event.id);
                    }
                    Err(e) => tracing::warn!(
                        segment = %segment_name(scope.as_deref()),
                        line = line_no,
                        error = %e,
                        "unparseable ledger line"
                    ),
                }
            }
        }
        tracing::debug!(events = ids.len(), root = %store.paths.root.display(), "event store opened");
        *store.ids.write().unwrap_or_else(PoisonError::into_inner) = ids;
        Ok(store)
    }

    pub fn paths(&self) -> &ApiaryPaths {
        &self.paths
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every segment on disk: `None` for the project segment, then Run ids
    /// in lexical order.
    pub fn segments(&self) -> Result<Vec<Option<ScopeId>>> {
        let mut out = Vec::new();
        if self.paths.project_segment.exists() {
            out.push(None);
        }
        let mut runs = Vec::new();
        if self.paths.runs_dir.is_dir() {
            for entry in std::fs::read_dir(&self.paths.runs_dir)? {
                let name = entry?.file_name();
                if let Some(run_id) = name.to_str().and_then(|n| n.strip_suffix(".jsonl")) {
                    runs.push(run_id.to_string());
                }
            }
        }
        runs.sort();
        out.extend(runs.into_iter().map(Some));
        Ok(out)
    }

    /// Current tip of a segment, read from durable data.
    pub fn tip(&self, scope: Option<&str>) -> Result<Option<Event>> {
        segment::last_event(&self.paths.segment_file(scope)?)
    }

    /// Run `f` as the exclusive writer of one segment. Validation done in
    /// `f` and the appends it makes are atomic with respect to other writers.
    ///
    /// Calls must not be nested across segments.
    pub fn with_segment<T>(
        &self,
        scope: Option<&str>,
        f: impl FnOnce(&mut SegmentWriter<'_>) -> Result<T>,
    ) -> Result<T> {
        let file = self.paths.segment_file(scope)?;
        let name = segment_name(scope);
        let gate = {
            let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers
                .entry(scope.map(str::to_string))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = SegmentLock::acquire(&sidecar(&file, "lock"), &name, self.retry)?;
        let tip = segment::last_event(&file)?;
        let mut writer = SegmentWriter {
            store: self,
            scope: scope.map(str::to_string),
            name,
            file,
            tip,
        };
        f(&mut writer)
    }

    /// Append a fully formed candidate to the segment named by its `scope_id`.
    pub fn append(&self, candidate: Event) -> Result<Event> {
        let scope = candidate.scope_id.clone();
        self.with_segment(scope.as_deref(), |w| w.append(candidate))
    }

    /// Seal a draft against the current tip of its segment and append it.
    pub fn append_draft(&self, draft: EventDraft) -> Result<Event> {
        let scope = draft.scope_id.clone();
        self.with_segment(scope.as_deref(), |w| w.append_draft(draft))
    }

    /// Seal and append several drafts in one write: all or nothing.
    pub fn append_batch(&self, scope: Option<&str>, drafts: Vec<EventDraft>) -> Result<Vec<Event>> {
        self.with_segment(scope, |w| w.append_batch(drafts))
    }

    /// Lazy replay of one segment in chain order. `kinds` filters by wire
    /// name; empty means every kind.
    pub fn replay(&self, scope: Option<&str>, kinds: &[&str]) -> Result<Replay> {
        Replay::open(
            self.paths.segment_file(scope)?,
            kinds.iter().map(|k| k.to_string()).collect(),
        )
    }

    /// Every event of one segment, in chain order.
    pub fn events(&self, scope: Option<&str>) -> Result<Vec<Event>> {
        segment::read_events(&self.paths.segment_file(scope)?)
    }

    /// Every event of every segment, merged by (timestamp, id).
    pub fn replay_all(&self) -> Result<Vec<Event>> {
        let mut all = Vec::new();
        for scope in self.segments()? {
            all.extend(self.events(scope.as_deref())?);
        }
        all.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(all)
    }

    pub(crate) fn segment_paths(&self, scope: Option<&str>) -> Result<(PathBuf, PathBuf)> {
        let file = self.paths.segment_file(scope)?;
        let anchor = sidecar(&file, "tip");
        Ok((file, anchor))
    }
}

/// Exclusive handle on one segment, valid for the duration of
/// [`EventStore::with_segment`].
pub struct SegmentWriter<'a> {
    store: &'a EventStore,
    scope: Option<ScopeId>,
    name: String,
    file: PathBuf,
    tip: Option<Event>,
}

impl SegmentWriter<'_> {
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn tip(&self) -> Option<&Event> {
        self.tip.as_ref()
    }

    /// Current durable contents of this segment.
    pub fn events(&self) -> Result<Vec<Event>> {
        segment::read_events(&self.file)
    }

    pub fn store(&self) -> &EventStore {
        self.store
    }

    pub fn append(&mut self, candidate: Event) -> Result<Event> {
        let mut stored = self.commit(vec![candidate])?;
        stored.pop().ok_or_else(|| KernelError::validation("empty append"))
    }

    pub fn append_draft(&mut self, draft: EventDraft) -> Result<Event> {
        let mut stored = self.append_batch(vec![draft])?;
        stored.pop().ok_or_else(|| KernelError::validation("empty append"))
    }

    pub fn append_batch(&mut self, drafts: Vec<EventDraft>) -> Result<Vec<Event>> {
        let mut sealed: Vec<Event> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let prev = sealed.last().or(self.tip.as_ref());
            let event = seal(
                draft,
                prev.map(|e| e.hash.as_str()),
                prev.map(|e| e.ts.as_str()),
            )?;
            sealed.push(event);
        }
        self.commit(sealed)
    }

    /// Append events already sealed on this writer's tip, in one write.
    pub fn append_events(&mut self, events: Vec<Event>) -> Result<Vec<Event>> {
        self.commit(events)
    }

    /// Check every candidate against the running tip, then write them in a
    /// single fsynced append.
    fn commit(&mut self, events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(events);
        }
        {
            let known = self.store.ids.read().unwrap_or_else(PoisonError::into_inner);
            let mut batch_ids: HashSet<&str> = HashSet::new();
            let mut prev = self.tip.as_ref();
            for event in &events {
                self.check_candidate(event, prev, &known, &batch_ids)?;
                batch_ids.insert(event.id.as_str());
                prev = Some(event);
            }
        }

        segment::append_lines(&self.file, &events)?;
        {
            let mut known = self.store.ids.write().unwrap_or_else(PoisonError::into_inner);
            known.extend(events.iter().map(|e| e.id.clone()));
        }
        for event in &events {
            tracing::debug!(segment = %self.name, id = %event.id, kind = %event.kind, actor = %event.actor, "event appended");
        }
        if let Some(last) = events.last() {
            let anchor = sidecar(&self.file, "tip");
            if let Err(e) = segment::write_anchor(&anchor, &TipAnchor::of(last)) {
                tracing::warn!(segment = %self.name, error = %e, "tip anchor not updated");
            }
            self.tip = Some(last.clone());
        }
        Ok(events)
    }

    fn check_candidate(
        &self,
        event: &Event,
        prev: Option<&Event>,
        known: &HashSet<EventId>,
        batch_ids: &HashSet<&str>,
    ) -> Result<()> {
        if event.scope_id != self.scope {
            return Err(KernelError::validation(format!(
                "{}: scoped to {:?} but appended to segment `{}`",
                event.id, event.scope_id, self.name
            )));
        }
        validate_event(event)?;
        if compute_event_hash(event)? != event.hash {
            return Err(KernelError::ChainIntegrity {
                segment: self.name.clone(),
                event_id: event.id.clone(),
                reason: "hash does not recompute".into(),
            });
        }
        let tip_hash = prev.map(|e| e.hash.as_str());
        if event.prev_hash.as_deref() != tip_hash {
            return Err(KernelError::ChainIntegrity {
                segment: self.name.clone(),
                event_id: event.id.clone(),
                reason: format!(
                    "prev_hash {} does not match tip {}",
                    event.prev_hash.as_deref().unwrap_or("null"),
                    tip_hash.unwrap_or("null")
                ),
            });
        }
        if let Some(prev) = prev {
            if event.timestamp() < prev.timestamp() {
                return Err(KernelError::validation(format!(
                    "{}: timestamp {} precedes tip {}",
                    event.id, event.ts, prev.ts
                )));
            }
        }
        if known.contains(&event.id) || batch_ids.contains(event.id.as_str()) {
            return Err(KernelError::validation(format!(
                "duplicate event id {}",
                event.id
            )));
        }
        if let Some(unknown) = event
            .parents
            .iter()
            .find(|p| !known.contains(*p) && !batch_ids.contains(p.as_str()))
        {
            return Err(KernelError::validation(format!(
                "{}: unknown parent {unknown}",
                event.id
            )));
        }
        Ok(())
    }
}

/// Lazy, finite, restartable iterator over one segment.
///
/// Bounded by the file length at open time, so events appended while
/// iterating are not observed until [`Replay::rewind`].
pub struct Replay {
    path: PathBuf,
    kinds: Vec<String>,
    lines: Option<std::io::Lines<BufReader<std::io::Take<File>>>>,
}

impl Replay {
    fn open(path: PathBuf, kinds: Vec<String>) -> Result<Self> {
        let mut replay = Self {
            path,
            kinds,
            lines: None,
        };
        replay.rewind()?;
        Ok(replay)
    }

    /// Start over from the first event, observing everything durable now.
    pub fn rewind(&mut self) -> Result<()> {
        self.lines = match File::open(&self.path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                Some(BufReader::new(file.take(len)).lines())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for Replay {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => return Some(Err(e.into())),
            };
            if self.kinds.is_empty() || self.kinds.iter().any(|k| *k == event.kind) {
                return Some(Ok(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::EventKind;
    use serde_json::json;

    fn open_tmp() -> (tempfile::TempDir, EventStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
        (tmp, store)
    }

    fn task(id: &str) -> EventDraft {
        EventDraft::new(
            EventKind::TaskCreated,
            "alice",
            json!({"task_id": id, "title": "do it"}),
        )
        .in_run("r1")
    }

    #[test]
    fn drafts_chain_onto_tip() {
        let (_tmp, store) = open_tmp();
        let e1 = store.append_draft(task("t1")).unwrap();
        let e2 = store.append_draft(task("t2")).unwrap();
        assert!(e1.prev_hash.is_none());
        assert_eq!(e2.prev_hash.as_deref(), Some(e1.hash.as_str()));
        assert_eq!(store.tip(Some("r1")).unwrap(), Some(e2.clone()));
        assert_eq!(store.events(Some("r1")).unwrap(), vec![e1, e2]);
        assert_eq!(store.segments().unwrap(), vec![Some("r1".to_string())]);
    }

    #[test]
    fn stale_prev_hash_is_a_chain_error() {
        let (_tmp, store) = open_tmp();
        store.append_draft(task("t1")).unwrap();
        let stale = seal(task("t2"), None, None).unwrap();
        match store.append(stale) {
            Err(KernelError::ChainIntegrity { reason, .. }) => {
                assert!(reason.contains("prev_hash"), "{reason}")
            }
            other => panic!("expected chain error, got {other:?}"),
        }
        assert_eq!(store.events(Some("r1")).unwrap().len(), 1);
    }

    #[test]
    fn forged_hash_rejected() {
        let (_tmp, store) = open_tmp();
        let mut event = seal(task("t1"), None, None).unwrap();
        event.actor = "mallory".into();
        assert!(matches!(
            store.append(event),
            Err(KernelError::ChainIntegrity { .. })
        ));
    }

    #[test]
    fn unknown_parent_rejected_then_accepted() {
        let (_tmp, store) = open_tmp();
        let err = store
            .append_draft(task("t1").with_parents(["evt_nope"]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown parent"), "{err}");

        let root = store.append_draft(task("t1")).unwrap();
        let child = store
            .append_draft(task("t2").with_parents([root.id.clone()]))
            .unwrap();
        assert_eq!(child.parents, vec![root.id]);
    }

    #[test]
    fn parents_may_cross_segments() {
        let (_tmp, store) = open_tmp();
        let project = store
            .append_draft(EventDraft::new(
                EventKind::ProjectCreated,
                "alice",
                json!({"project_id": "p1", "name": "demo"}),
            ))
            .unwrap();
        let run_event = store
            .append_draft(task("t1").with_parents([project.id.clone()]))
            .unwrap();
        assert!(run_event.prev_hash.is_none());
        assert_eq!(run_event.parents, vec![project.id]);
    }

    #[test]
    fn invalid_batch_writes_nothing() {
        let (_tmp, store) = open_tmp();
        let bad = EventDraft::new(EventKind::TaskCreated, "alice", json!({"task_id": "t2"}))
            .in_run("r1");
        assert!(store.append_batch(Some("r1"), vec![task("t1"), bad]).is_err());
        assert!(store.events(Some("r1")).unwrap().is_empty());
        assert!(store.is_empty());

        let stored = store
            .append_batch(Some("r1"), vec![task("t1"), task("t2")])
            .unwrap();
        assert_eq!(stored[1].prev_hash.as_deref(), Some(stored[0].hash.as_str()));
    }

    #[test]
    fn batch_scope_must_match_segment() {
        let (_tmp, store) = open_tmp();
        let err = store.append_batch(Some("r2"), vec![task("t1")]).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn replay_filters_and_restarts() {
        let (_tmp, store) = open_tmp();
        store.append_draft(task("t1")).unwrap();
        store
            .append_draft(
                EventDraft::new(EventKind::TaskStarted, "alice", json!({"task_id": "t1"}))
                    .in_run("r1"),
            )
            .unwrap();
        let mut replay = store.replay(Some("r1"), &["task.started"]).unwrap();
        let first: Vec<Event> = replay.by_ref().map(|e| e.unwrap()).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, "task.started");

        store.append_draft(task("t2")).unwrap();
        replay.rewind().unwrap();
        assert_eq!(replay.count(), 1);
        assert_eq!(store.replay(Some("r1"), &[]).unwrap().count(), 3);
        assert_eq!(store.replay(Some("nothing"), &[]).unwrap().count(), 0);
    }

    #[test]
    fn replay_is_bounded_at_open() {
        let (_tmp, store) = open_tmp();
        store.append_draft(task("t1")).unwrap();
        let replay = store.replay(Some("r1"), &[]).unwrap();
        store.append_draft(task("t2")).unwrap();
        assert_eq!(replay.count(), 1);
    }

    #[test]
    fn reopen_restores_id_index() {
        let tmp = tempfile::tempdir().unwrap();
        let id = {
            let store = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
            store.append_draft(task("t1")).unwrap().id
        };
        let store = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replay_all_merges_segments_by_time() {
        let (_tmp, store) = open_tmp();
        let a = store.append_draft(task("t1")).unwrap();
        let b = store
            .append_draft(EventDraft::new(
                EventKind::ProjectCreated,
                "alice",
                json!({"project_id": "p1", "name": "demo"}),
            ))
            .unwrap();
        let c = store
            .append_draft(task("t2").in_run("r2"))
            .unwrap();
        let ids: Vec<String> = store.replay_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn concurrent_writers_keep_one_chain() {
        let (_tmp, store) = open_tmp();
        std::thread::scope(|s| {
            for w in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..10 {
                        store.append_draft(task(&format!("t{w}_{i}"))).unwrap();
                    }
                });
            }
        });
        let events = store.events(Some("r1")).unwrap();
        assert_eq!(events.len(), 40);
        for pair in events.windows(2) {
            assert_eq!(pair[1].prev_hash.as_deref(), Some(pair[0].hash.as_str()));
        }
        assert!(store.verify_chain(Some("r1")).unwrap().is_intact());
    }
}
