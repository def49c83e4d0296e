use super::*;
use crate::directory::{RoomInfo, StaticDirectory};
use crate::model::*;
use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta, Utc};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 6, d).unwrap()
}

fn this_year(seq: u32) -> BookingId {
    BookingId::new(Utc::now().year(), seq)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn directory() -> Arc<StaticDirectory> {
    let dir = StaticDirectory::new();
    dir.add_room(
        "everest",
        RoomInfo {
            name: "Everest".into(),
            capacity: 10,
            is_active: true,
        },
    );
    dir.add_user("alice", "Alice");
    dir.add_user("bob", "Bob");
    Arc::new(dir)
}

fn open(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), directory(), Duration::from_secs(5)).unwrap()
}

fn engine(name: &str) -> Engine {
    open(&test_wal_path(name))
}

fn request(user: &str, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> NewBooking {
    NewBooking {
        user_id: user.into(),
        room_id: "everest".into(),
        date,
        start_time: start,
        end_time: end,
        title: "Planning".into(),
        attendees: 4,
        description: None,
        priority: Priority::Medium,
        equipment: vec!["projector".into()],
    }
}

async fn create(engine: &Engine, user: &str, start: NaiveTime, end: NaiveTime) -> BookingId {
    engine
        .create_booking(request(user, day(1), start, end))
        .await
        .unwrap()
        .id
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn create_returns_pending_booking_with_sequential_ids() {
    let engine = engine("create_pending.wal");
    let first = engine
        .create_booking(request("alice", day(1), t(9, 0), t(10, 0)))
        .await
        .unwrap();
    assert_eq!(first.id, this_year(1));
    assert_eq!(first.status, BookingStatus::Pending);
    assert_eq!(first.notes, None);
    assert_eq!(first.equipment, vec!["projector".to_string()]);
    assert_eq!(first.created_at, first.updated_at);

    let second = create(&engine, "bob", t(11, 0), t(12, 0)).await;
    assert_eq!(second, this_year(2));
    assert_eq!(engine.booking_count(), 2);
    assert_eq!(engine.schedule_count(), 1);
}

#[tokio::test]
async fn create_rejects_invalid_slot_without_touching_state() {
    let engine = engine("create_invalid.wal");
    let err = engine
        .create_booking(request("alice", day(1), t(10, 0), t(10, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));
    assert_eq!(engine.booking_count(), 0);
    assert_eq!(engine.schedule_count(), 0);
}

#[tokio::test]
async fn pending_bookings_never_block() {
    let engine = engine("pending_no_block.wal");
    create(&engine, "alice", t(9, 0), t(10, 0)).await;
    create(&engine, "bob", t(9, 0), t(10, 0)).await;
    create(&engine, "bob", t(9, 30), t(10, 30)).await;
    assert_eq!(engine.booking_count(), 3);
}

#[tokio::test]
async fn create_conflicts_with_approved_booking() {
    let engine = engine("create_conflict.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();

    let err = engine
        .create_booking(request("bob", day(1), t(9, 30), t(10, 30)))
        .await
        .unwrap_err();
    let EngineError::Conflict(conflicts) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, a);
    assert_eq!(conflicts[0].user_id, "alice");
    assert_eq!(conflicts[0].user_name.as_deref(), Some("Alice"));
    assert_eq!(conflicts[0].slot, TimeSlot::new(t(9, 0), t(10, 0)));
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn adjacent_and_elsewhere_bookings_are_allowed() {
    let engine = engine("adjacent.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();

    // Touching either edge.
    create(&engine, "bob", t(10, 0), t(11, 0)).await;
    create(&engine, "bob", t(8, 0), t(9, 0)).await;
    // Same slot, other day and other room.
    engine
        .create_booking(request("bob", day(2), t(9, 0), t(10, 0)))
        .await
        .unwrap();
    let mut other_room = request("bob", day(1), t(9, 0), t(10, 0));
    other_room.room_id = "k2".into();
    engine.create_booking(other_room).await.unwrap();

    assert_eq!(engine.booking_count(), 5);
    assert_eq!(engine.schedule_count(), 3);
}

#[tokio::test]
async fn cancelled_and_rejected_bookings_do_not_block() {
    let engine = engine("terminal_no_block.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();
    engine.cancel_booking(&a, None).await.unwrap();

    let b = create(&engine, "bob", t(9, 0), t(10, 0)).await;
    engine.reject_booking(&b, None).await.unwrap();
    let c = create(&engine, "bob", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&c, false).await.unwrap();
}

#[tokio::test]
async fn find_conflicts_reports_only_approved_overlaps() {
    let engine = engine("find_conflicts.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "bob", t(10, 0), t(11, 0)).await;
    create(&engine, "bob", t(9, 15), t(9, 45)).await;
    engine.approve_booking(&a, false).await.unwrap();
    engine.approve_booking(&b, false).await.unwrap();

    let slot = TimeSlot::new(t(9, 30), t(10, 30));
    let ids: Vec<BookingId> = engine
        .find_conflicts("everest", day(1), &slot, None)
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![a.clone(), b.clone()]);

    let ids: Vec<BookingId> = engine
        .find_conflicts("everest", day(1), &slot, Some(&a))
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![b]);

    assert!(engine.find_conflicts("nowhere", day(1), &slot, None).await.is_empty());
    assert!(engine.find_conflicts("everest", day(9), &slot, None).await.is_empty());
}

// ── Approve ──────────────────────────────────────────────

#[tokio::test]
async fn approve_without_conflict() {
    let engine = engine("approve_plain.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let approval = engine.approve_booking(&a, false).await.unwrap();
    assert_eq!(approval.approved.status, BookingStatus::Approved);
    assert!(approval.cancelled.is_empty());
    assert!(approval.approved.updated_at >= approval.approved.created_at);
    assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Approved);
}

#[tokio::test]
async fn approve_conflict_without_cancel_changes_nothing() {
    let engine = engine("approve_conflict.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "bob", t(9, 30), t(10, 30)).await;
    engine.approve_booking(&a, false).await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let err = engine.approve_booking(&b, false).await.unwrap_err();
    let EngineError::Conflict(conflicts) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, a);

    assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(engine.get_booking(&b).await.unwrap().status, BookingStatus::Pending);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn approve_with_cancel_overrides_every_conflict_atomically() {
    let engine = engine("approve_override.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let c = create(&engine, "alice", t(10, 0), t(11, 0)).await;
    let free = create(&engine, "alice", t(11, 0), t(12, 0)).await;
    let b = create(&engine, "bob", t(9, 30), t(10, 30)).await;
    for id in [&a, &c, &free] {
        engine.approve_booking(id, false).await.unwrap();
    }
    let appends = engine.wal_appends_since_compact().await;

    let approval = engine.approve_booking(&b, true).await.unwrap();
    assert_eq!(approval.approved.id, b);
    assert_eq!(approval.approved.status, BookingStatus::Approved);
    let cancelled: Vec<BookingId> = approval.cancelled.iter().map(|b| b.id.clone()).collect();
    assert_eq!(cancelled, vec![a.clone(), c.clone()]);

    let note = format!("Revoked by Admin for Priority Override by Bob (booking {b})");
    for id in [&a, &c] {
        let loser = engine.get_booking(id).await.unwrap();
        assert_eq!(loser.status, BookingStatus::Cancelled);
        assert_eq!(loser.notes.as_deref(), Some(note.as_str()));
        assert_eq!(loser.updated_at, approval.approved.updated_at);
    }
    assert_eq!(engine.get_booking(&free).await.unwrap().status, BookingStatus::Approved);
    // Winner and losers share one WAL record.
    assert_eq!(engine.wal_appends_since_compact().await, appends + 1);
}

#[tokio::test]
async fn override_note_falls_back_to_user_id() {
    let engine = engine("override_unknown_user.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "carol", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();
    engine.approve_booking(&b, true).await.unwrap();
    let loser = engine.get_booking(&a).await.unwrap();
    assert!(loser.notes.unwrap().contains("Priority Override by carol"));
}

#[tokio::test]
async fn approve_with_cancel_and_no_conflict_is_a_plain_approval() {
    let engine = engine("approve_cancel_noop.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let approval = engine.approve_booking(&a, true).await.unwrap();
    assert!(approval.cancelled.is_empty());
    assert_eq!(approval.approved.notes, None);
}

#[tokio::test]
async fn approve_twice_is_invalid() {
    let engine = engine("approve_twice.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();
    let err = engine.approve_booking(&a, true).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Approved,
            action: "approve",
            ..
        }
    ));
}

#[tokio::test]
async fn concurrent_approvals_have_one_winner() {
    let engine = Arc::new(engine("concurrent_approve.wal"));
    let mut ids = Vec::new();
    for i in 0..8 {
        let user = if i % 2 == 0 { "alice" } else { "bob" };
        ids.push(create(&engine, user, t(9, 0), t(10, 0)).await);
    }

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.approve_booking(&id, false).await })
        })
        .collect();

    let mut approved = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => approved += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(approved, 1);
    assert_eq!(conflicts, 7);

    let filter = BookingFilter {
        status: Some(BookingStatus::Approved),
        ..Default::default()
    };
    assert_eq!(engine.list_bookings(&filter).await.len(), 1);
}

#[tokio::test]
async fn concurrent_creates_get_distinct_ids() {
    let engine = Arc::new(engine("concurrent_create.wal"));
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut req = request("alice", day(1 + i % 4), t(9, 0), t(10, 0));
                req.room_id = format!("room-{}", i % 3);
                engine.create_booking(req).await.unwrap().id
            })
        })
        .collect();
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(engine.booking_count(), 16);
}

// ── Reject, cancel, delete ───────────────────────────────

#[tokio::test]
async fn reject_and_cancel_record_reasons() {
    let engine = engine("reasons.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "bob", t(11, 0), t(12, 0)).await;
    let c = create(&engine, "bob", t(13, 0), t(14, 0)).await;

    let rejected = engine
        .reject_booking(&a, Some("room under repair".into()))
        .await
        .unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    assert_eq!(rejected.notes.as_deref(), Some("room under repair"));

    engine.approve_booking(&b, false).await.unwrap();
    let cancelled = engine.cancel_booking(&b, None).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.notes, None);

    let cancelled = engine
        .cancel_booking(&c, Some("no longer needed".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.notes.as_deref(), Some("no longer needed"));
}

#[tokio::test]
async fn terminal_bookings_refuse_every_transition() {
    let engine = engine("terminal.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "alice", t(11, 0), t(12, 0)).await;
    engine.reject_booking(&a, None).await.unwrap();
    engine.cancel_booking(&b, None).await.unwrap();

    for id in [&a, &b] {
        assert!(matches!(
            engine.approve_booking(id, false).await,
            Err(EngineError::InvalidTransition { action: "approve", .. })
        ));
        assert!(matches!(
            engine.reject_booking(id, None).await,
            Err(EngineError::InvalidTransition { action: "reject", .. })
        ));
        assert!(matches!(
            engine.cancel_booking(id, None).await,
            Err(EngineError::InvalidTransition { action: "cancel", .. })
        ));
    }
}

#[tokio::test]
async fn approved_booking_cannot_be_rejected() {
    let engine = engine("reject_approved.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    engine.approve_booking(&a, false).await.unwrap();
    let err = engine.reject_booking(&a, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Approved,
            action: "reject",
            ..
        }
    ));
    assert_eq!(
        err.to_string(),
        format!("cannot reject booking {a}: status is Approved")
    );
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let engine = engine("unknown.wal");
    let id = this_year(42);
    assert!(matches!(engine.get_booking(&id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.approve_booking(&id, true).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.reject_booking(&id, None).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.cancel_booking(&id, None).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_booking(&id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.list_conflicts(&id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn delete_only_terminal_bookings() {
    let engine = engine("delete.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let err = engine.delete_booking(&a).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { action: "delete", .. }));
    engine.approve_booking(&a, false).await.unwrap();
    assert!(engine.delete_booking(&a).await.is_err());

    engine.cancel_booking(&a, None).await.unwrap();
    let deleted = engine.delete_booking(&a).await.unwrap();
    assert_eq!(deleted.id, a);
    assert!(matches!(engine.get_booking(&a).await, Err(EngineError::NotFound(_))));
    assert_eq!(engine.booking_count(), 0);
    assert_eq!(engine.schedule_count(), 0);
}

#[tokio::test]
async fn reason_length_is_checked() {
    let engine = engine("long_reason.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let long = "x".repeat(crate::limits::MAX_TEXT_LEN + 1);
    assert!(matches!(
        engine.reject_booking(&a, Some(long)).await,
        Err(EngineError::BadRequest(_))
    ));
    assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Pending);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_orders_newest_first_and_filters() {
    let engine = engine("list.wal");
    let early = engine
        .create_booking(request("alice", day(1), t(9, 0), t(10, 0)))
        .await
        .unwrap()
        .id;
    let late_morning = engine
        .create_booking(request("bob", day(2), t(9, 0), t(10, 0)))
        .await
        .unwrap()
        .id;
    let late_afternoon = engine
        .create_booking(request("alice", day(2), t(15, 0), t(16, 0)))
        .await
        .unwrap()
        .id;
    engine.approve_booking(&late_morning, false).await.unwrap();

    let all: Vec<BookingId> = engine
        .list_bookings(&BookingFilter::default())
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(all, vec![late_afternoon.clone(), late_morning.clone(), early.clone()]);

    let alice = BookingFilter {
        user_id: Some("alice".into()),
        ..Default::default()
    };
    let ids: Vec<BookingId> = engine.list_bookings(&alice).await.into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![late_afternoon.clone(), early.clone()]);

    let approved = BookingFilter {
        status: Some(BookingStatus::Approved),
        ..Default::default()
    };
    let ids: Vec<BookingId> = engine.list_bookings(&approved).await.into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![late_morning]);

    let first_day = BookingFilter {
        room_id: Some("everest".into()),
        date_to: Some(day(1)),
        ..Default::default()
    };
    let ids: Vec<BookingId> = engine.list_bookings(&first_day).await.into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![early]);

    let other_room = BookingFilter {
        room_id: Some("k2".into()),
        ..Default::default()
    };
    assert!(engine.list_bookings(&other_room).await.is_empty());
}

#[tokio::test]
async fn list_conflicts_names_blocking_owners() {
    let engine = engine("list_conflicts.wal");
    let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let b = create(&engine, "bob", t(9, 30), t(10, 30)).await;
    assert!(engine.list_conflicts(&b).await.unwrap().is_empty());

    engine.approve_booking(&a, false).await.unwrap();
    let conflicts = engine.list_conflicts(&b).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, a);
    assert_eq!(conflicts[0].user_name.as_deref(), Some("Alice"));
    // An approved booking never conflicts with itself.
    assert!(engine.list_conflicts(&a).await.unwrap().is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_statuses_notes_and_sequence() {
    let path = test_wal_path("replay.wal");
    let (a, b, c, d) = {
        let engine = open(&path);
        let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
        let b = create(&engine, "bob", t(9, 0), t(10, 0)).await;
        let c = create(&engine, "bob", t(12, 0), t(13, 0)).await;
        let d = create(&engine, "alice", t(14, 0), t(15, 0)).await;
        engine.approve_booking(&a, false).await.unwrap();
        engine.approve_booking(&b, true).await.unwrap();
        engine.reject_booking(&c, Some("too early".into())).await.unwrap();
        engine.cancel_booking(&d, None).await.unwrap();
        engine.delete_booking(&d).await.unwrap();
        (a, b, c, d)
    };

    let engine = open(&path);
    assert_eq!(engine.booking_count(), 3);
    let a_after = engine.get_booking(&a).await.unwrap();
    assert_eq!(a_after.status, BookingStatus::Cancelled);
    assert!(a_after.notes.unwrap().starts_with("Revoked by Admin for Priority Override by Bob"));
    assert_eq!(engine.get_booking(&b).await.unwrap().status, BookingStatus::Approved);
    let c_after = engine.get_booking(&c).await.unwrap();
    assert_eq!(c_after.status, BookingStatus::Rejected);
    assert_eq!(c_after.notes.as_deref(), Some("too early"));
    assert!(matches!(engine.get_booking(&d).await, Err(EngineError::NotFound(_))));

    // The approved winner still blocks after restart.
    assert!(matches!(
        engine
            .create_booking(request("alice", day(1), t(9, 0), t(9, 30)))
            .await,
        Err(EngineError::Conflict(_))
    ));
    let next = create(&engine, "alice", t(16, 0), t(17, 0)).await;
    assert_eq!(next, this_year(5));
}

#[tokio::test]
async fn compaction_keeps_state_and_id_floor() {
    let path = test_wal_path("compact.wal");
    let kept = {
        let engine = open(&path);
        let kept = create(&engine, "bob", t(14, 0), t(15, 0)).await;
        engine.approve_booking(&kept, false).await.unwrap();
        // The highest ids are deleted, so only the sequence floor remembers them.
        for h in 8..11 {
            let id = create(&engine, "alice", t(h, 0), t(h + 1, 0)).await;
            engine.cancel_booking(&id, None).await.unwrap();
            engine.delete_booking(&id).await.unwrap();
        }
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        kept
    };

    let engine = open(&path);
    assert_eq!(engine.booking_count(), 1);
    assert_eq!(engine.get_booking(&kept).await.unwrap().status, BookingStatus::Approved);
    let next = create(&engine, "alice", t(16, 0), t(17, 0)).await;
    assert_eq!(next, this_year(5));
}

#[tokio::test]
async fn purge_removes_processed_before_cutoff_in_one_record() {
    let engine = engine("purge.wal");
    let pending = create(&engine, "alice", t(8, 0), t(9, 0)).await;
    let approved = create(&engine, "alice", t(9, 0), t(10, 0)).await;
    let rejected = engine
        .create_booking(request("bob", day(2), t(9, 0), t(10, 0)))
        .await
        .unwrap()
        .id;
    engine.approve_booking(&approved, false).await.unwrap();
    engine.reject_booking(&rejected, None).await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let counts = engine
        .purge_processed(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(
        counts,
        PurgeCounts {
            approved: 1,
            rejected: 1,
            cancelled: 0
        }
    );
    assert_eq!(engine.wal_appends_since_compact().await, appends + 1);
    assert_eq!(engine.booking_count(), 1);
    assert!(engine.get_booking(&pending).await.is_ok());
    // The day-2 schedule emptied out and is gone.
    assert_eq!(engine.schedule_count(), 1);

    let again = engine
        .purge_processed(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(again.total(), 0);
    assert_eq!(engine.wal_appends_since_compact().await, appends + 1);
}

#[tokio::test]
async fn torn_wal_tail_is_dropped() {
    let path = test_wal_path("torn.wal");
    let a = {
        let engine = open(&path);
        create(&engine, "alice", t(9, 0), t(10, 0)).await
    };
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x40, 0x00, 0x00, 0x00, 0xde, 0xad]).unwrap();
    }
    let b = {
        let engine = open(&path);
        assert_eq!(engine.booking_count(), 1);
        assert!(engine.get_booking(&a).await.is_ok());
        create(&engine, "bob", t(11, 0), t(12, 0)).await
    };

    // Records written after the torn tail must survive the next restart.
    let engine = open(&path);
    assert_eq!(engine.booking_count(), 2);
    assert!(engine.get_booking(&b).await.is_ok());
}

// ── Store failures ───────────────────────────────────────

/// An engine that gives up on the WAL quickly, for stalled-writer tests.
fn impatient(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), directory(), Duration::from_millis(250)).unwrap()
}

#[tokio::test]
async fn timed_out_approval_is_never_written() {
    let path = test_wal_path("approve_timeout.wal");
    let (a, b) = {
        let engine = impatient(&path);
        let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
        let b = create(&engine, "bob", t(9, 30), t(10, 30)).await;

        let resume = engine.stall_writer().await;
        let err = engine.approve_booking(&a, false).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)), "got {err:?}");
        let _ = resume.send(());
        assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Pending);

        // Nothing holds the slot, so the other request may take it.
        engine.approve_booking(&b, false).await.unwrap();
        (a, b)
    };

    let engine = open(&path);
    assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Pending);
    assert_eq!(engine.get_booking(&b).await.unwrap().status, BookingStatus::Approved);
    assert!(matches!(
        engine.approve_booking(&a, false).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn timed_out_override_changes_nothing() {
    let path = test_wal_path("override_timeout.wal");
    let (a, b) = {
        let engine = impatient(&path);
        let a = create(&engine, "alice", t(9, 0), t(10, 0)).await;
        let b = create(&engine, "bob", t(9, 30), t(10, 30)).await;
        engine.approve_booking(&a, false).await.unwrap();
        let appends = engine.wal_appends_since_compact().await;

        let resume = engine.stall_writer().await;
        assert!(matches!(
            engine.approve_booking(&b, true).await,
            Err(EngineError::StoreUnavailable(_))
        ));
        drop(resume);

        assert_eq!(engine.get_booking(&a).await.unwrap().status, BookingStatus::Approved);
        assert_eq!(engine.get_booking(&b).await.unwrap().status, BookingStatus::Pending);
        assert_eq!(engine.wal_appends_since_compact().await, appends);
        (a, b)
    };

    let engine = open(&path);
    let a_after = engine.get_booking(&a).await.unwrap();
    assert_eq!(a_after.status, BookingStatus::Approved);
    assert_eq!(a_after.notes, None);
    assert_eq!(engine.get_booking(&b).await.unwrap().status, BookingStatus::Pending);
}

#[tokio::test]
async fn timed_out_create_leaves_no_trace() {
    let path = test_wal_path("create_timeout.wal");
    {
        let engine = impatient(&path);
        let resume = engine.stall_writer().await;
        let err = engine
            .create_booking(request("alice", day(1), t(9, 0), t(10, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)), "got {err:?}");
        assert_eq!(engine.booking_count(), 0);
        assert_eq!(engine.schedule_count(), 0);
        let _ = resume.send(());

        let b = create(&engine, "bob", t(9, 0), t(10, 0)).await;
        assert_eq!(engine.booking_count(), 1);
        assert!(engine.get_booking(&b).await.is_ok());
    }

    let engine = open(&path);
    assert_eq!(engine.booking_count(), 1);
    let only = engine.list_bookings(&BookingFilter::default()).await;
    assert_eq!(only[0].user_id, "bob");
}
