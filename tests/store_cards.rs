use ardf_results::{
    core::store::{EventStore, StoreError},
    engine::traits::DataSource,
    entity::{Category, CompetitorDraft, CompetitorPatch, ControlPointSpec, Event},
    error::{CourseError, EngineError},
    op::Op,
    punch::{RawPunch, ReadoutBatch},
    types::{CategoryId, EventId, PunchKind, PunchStatus, ScoringMode, SiNumber},
};

fn seeded() -> EventStore {
    let mut store = EventStore::new();
    for id in [1, 2] {
        store
            .upsert_event(Event {
                id,
                name: format!("Event {id}"),
                zero_time_unix: 1_700_000_000,
            })
            .expect("event");
        store.upsert_category(category(id * 10, id)).expect("category");
    }
    store
}

fn category(id: CategoryId, event_id: EventId) -> Category {
    Category {
        id,
        event_id,
        name: "M21".to_string(),
        control_points: vec![ControlPointSpec::control(1, 31), ControlPointSpec::control(2, 32)],
        time_limit: None,
        scoring: ScoringMode::TimeBased,
    }
}

fn draft(event_id: EventId, name: &str, si: Option<SiNumber>) -> CompetitorDraft {
    CompetitorDraft {
        event_id,
        category_id: event_id * 10,
        name: name.to_string(),
        si_number: si,
        start_time: None,
    }
}

fn readout(event_id: EventId, si_number: SiNumber) -> ReadoutBatch {
    let raw = |kind, code, time| RawPunch { code, kind, time };
    ReadoutBatch {
        event_id,
        si_number,
        punches: vec![
            raw(PunchKind::Clear, None, -30),
            raw(PunchKind::Start, None, 0),
            raw(PunchKind::Control, Some(31), 120),
            raw(PunchKind::Control, Some(32), 240),
            raw(PunchKind::Finish, None, 300),
        ],
    }
}

#[test]
fn reused_card_is_rejected_within_an_event() {
    let mut store = seeded();
    assert!(store.check_si_card_unique(8_001, 1));
    store.insert_competitor(draft(1, "Ana", Some(8_001))).expect("first");
    assert!(!store.check_si_card_unique(8_001, 1));
    assert!(!DataSource::check_si_card_unique(&store, 8_001, 1));

    let err = store
        .insert_competitor(draft(1, "Bo", Some(8_001)))
        .expect_err("duplicate card");
    assert_eq!(
        err,
        StoreError::DuplicateSiNumber {
            si_number: 8_001,
            event_id: 1
        }
    );
    assert_eq!(store.competitors_in_category(10).len(), 1);

    // Another event may reuse the number.
    store.insert_competitor(draft(2, "Cy", Some(8_001))).expect("other event");
}

#[test]
fn patching_onto_a_taken_card_is_rejected() {
    let mut store = seeded();
    let (ana, _) = store.insert_competitor(draft(1, "Ana", Some(8_001))).expect("ana");
    let (bo, _) = store.insert_competitor(draft(1, "Bo", Some(8_002))).expect("bo");

    let steal = CompetitorPatch {
        si_number: Some(Some(8_001)),
        ..CompetitorPatch::default()
    };
    assert!(matches!(
        store.patch_competitor(bo, steal),
        Err(StoreError::DuplicateSiNumber { si_number: 8_001, .. })
    ));

    let keep = CompetitorPatch {
        si_number: Some(Some(8_001)),
        name: Some("Ana K.".to_string()),
        ..CompetitorPatch::default()
    };
    store.patch_competitor(ana, keep).expect("own card");

    let clear = CompetitorPatch {
        si_number: Some(None),
        ..CompetitorPatch::default()
    };
    store.patch_competitor(ana, clear).expect("clear");
    assert!(store.check_si_card_unique(8_001, 1));
}

#[test]
fn readout_binds_to_the_single_card_owner() {
    let mut store = seeded();
    let (ana, _) = store.insert_competitor(draft(1, "Ana", Some(8_001))).expect("ana");
    store.insert_competitor(draft(1, "Bo", Some(8_002))).expect("bo");
    store.drain_pending_ops();

    let (owner, stored) = store.assign_readout(readout(1, 8_001)).expect("assign");
    assert_eq!(owner, ana);
    assert!(matches!(stored.op, Op::ReplacePunches { competitor_id, category_id: 10, .. } if competitor_id == ana));

    let punches = store.punches(ana);
    assert_eq!(punches.len(), 5);
    assert!(punches.iter().all(|p| p.competitor_id == ana && p.event_id == 1));
    assert!(punches.iter().all(|p| p.status == PunchStatus::Valid));

    // A second readout replaces the first rather than appending.
    store.assign_readout(readout(1, 8_001)).expect("re-read");
    assert_eq!(store.punches(ana).len(), 5);
    assert_eq!(store.drain_pending_ops().len(), 2);
}

#[test]
fn readout_without_a_single_owner_is_ambiguous() {
    let mut store = seeded();

    let err = store.assign_readout(readout(1, 9_999)).expect_err("no owner");
    assert_eq!(
        err,
        StoreError::Engine(EngineError::AmbiguousCardAssignment {
            si_number: 9_999,
            matches: Vec::new(),
        })
    );

    // Replayed history can still carry a shared card.
    let (a, op_a) = store.insert_competitor(draft(1, "Ana", Some(7_000))).expect("ana");
    let mut twin = op_a.clone();
    if let Op::InsertCompetitor { competitor } = &mut twin.op {
        competitor.id = a + 100;
    }
    twin.seq += 1;
    store.apply_replayed_op(twin).expect("replay");

    match store.assign_readout(readout(1, 7_000)) {
        Err(StoreError::Engine(EngineError::AmbiguousCardAssignment { matches, .. })) => {
            assert_eq!(matches.len(), 2);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn invalid_course_never_reaches_the_store() {
    let mut store = seeded();
    let mut broken = category(11, 1);
    broken.control_points = vec![ControlPointSpec::separator(1, 31), ControlPointSpec::control(2, 32)];

    let err = store.upsert_category(broken).expect_err("separator first");
    assert_eq!(
        err,
        StoreError::Engine(EngineError::InvalidCourseDefinition(
            CourseError::SeparatorAtBoundary { code: 31 }
        ))
    );
    assert!(store.category(11).is_none());
}

#[test]
fn deleting_a_category_cascades() {
    let mut store = seeded();
    let (ana, _) = store.insert_competitor(draft(1, "Ana", Some(8_001))).expect("ana");
    store.assign_readout(readout(1, 8_001)).expect("assign");

    store.delete_category(10).expect("delete");
    assert!(store.competitor(ana).is_none());
    assert!(store.punches(ana).is_empty());
    assert!(store.check_si_card_unique(8_001, 1));
    assert!(matches!(store.fetch_competitors(10), Err(StoreError::MissingCategory(10))));
}

#[test]
fn competitor_must_share_its_category_event() {
    let mut store = seeded();

    let mut stray = draft(1, "Ana", Some(500));
    stray.event_id = 2;
    assert_eq!(
        store.insert_competitor(stray).expect_err("foreign event"),
        StoreError::EventMismatch {
            category_id: 10,
            expected: 1,
            found: 2
        }
    );
    let (ana, _) = store.insert_competitor(draft(1, "Ana", Some(500))).expect("ana");
    assert_eq!(store.competitors_in_category(10).len(), 1);

    // Event 2 has its own card 500; moving it into event 1's category is refused.
    let (cy, _) = store.insert_competitor(draft(2, "Cy", Some(500))).expect("cy");
    let hop = CompetitorPatch {
        category_id: Some(10),
        ..CompetitorPatch::default()
    };
    assert!(matches!(
        store.patch_competitor(cy, hop),
        Err(StoreError::EventMismatch { category_id: 10, .. })
    ));
    assert_eq!(store.competitor(cy).map(|c| c.category_id), Some(20));
    assert_eq!(store.competitors_with_card(500, 1), vec![ana]);

    // A populated category cannot be handed to another event.
    assert!(matches!(
        store.upsert_category(category(10, 2)),
        Err(StoreError::EventMismatch { category_id: 10, .. })
    ));
    assert_eq!(store.category(10).map(|c| c.event_id), Some(1));
}

#[test]
fn deleting_an_event_cascades() {
    let mut store = seeded();
    store.upsert_category(category(11, 1)).expect("second category");
    let (ana, _) = store.insert_competitor(draft(1, "Ana", Some(8_001))).expect("ana");
    store.assign_readout(readout(1, 8_001)).expect("assign");
    let (cy, _) = store.insert_competitor(draft(2, "Cy", Some(8_001))).expect("cy");
    store.drain_pending_ops();

    let stored = store.delete_event(1).expect("delete");
    assert!(matches!(&stored.op, Op::DeleteEvent { id: 1, categories } if categories == &vec![10, 11]));
    assert_eq!(stored.op.affected_categories(), vec![10, 11]);

    assert!(store.event(1).is_none());
    assert!(store.category(10).is_none() && store.category(11).is_none());
    assert!(store.competitor(ana).is_none());
    assert!(store.punches(ana).is_empty());
    assert!(store.check_si_card_unique(8_001, 1));

    assert!(store.competitor(cy).is_some());
    assert_eq!(store.category_ids(), vec![20]);
    assert_eq!(store.delete_event(1).expect_err("gone"), StoreError::MissingEvent(1));
}
