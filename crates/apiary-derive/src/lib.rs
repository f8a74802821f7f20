pub mod machine;
pub mod projection;
pub mod world;

#[cfg(test)]
mod test_support;

pub use machine::{
    validate_transition, ApprovalState, ConferenceState, ConflictState, DecisionState,
    GroupState, Lifecycle, ProjectState, RunState, TaskState,
};
pub use projection::{quorum_size, Projection, Stance, Tally};
pub use world::{build_projection, subject_id, Anomaly, CompletionPlan, Limits, World};

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::event::EventDraft;
    use apiary_core::{EntityKind, EventKind};
    use apiary_ledger::{EventStore, RetryPolicy};
    use serde_json::json;

    #[test]
    fn fold_of_stored_ledger_is_reproducible() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
        store
            .append_draft(EventDraft::new(
                EventKind::ProjectCreated,
                "alice",
                json!({"project_id": "p1", "name": "demo"}),
            ))
            .unwrap();
        store
            .append_draft(EventDraft::new(
                EventKind::GroupCreated,
                "alice",
                json!({"group_id": "g1", "project_id": "p1", "name": "core"}),
            ))
            .unwrap();
        store
            .append_draft(
                EventDraft::new(EventKind::RunStarted, "alice", json!({"group_id": "g1"}))
                    .in_run("r1"),
            )
            .unwrap();

        let first = World::fold(&store.replay_all().unwrap());
        let reopened = EventStore::open(tmp.path(), RetryPolicy::default()).unwrap();
        let second = World::fold(&reopened.replay_all().unwrap());
        for (entity, id) in [
            (EntityKind::Project, "p1"),
            (EntityKind::Group, "g1"),
            (EntityKind::Run, "r1"),
        ] {
            let a = first.projection(entity, id).unwrap();
            let b = second.projection(entity, id).unwrap();
            assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        }
        assert_eq!(second.groups["g1"].run_ids, vec!["r1"]);
    }
}
