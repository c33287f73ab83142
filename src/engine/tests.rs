use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::clock::FixedClock;
use crate::model::*;
use crate::notify::NotifyHub;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("toolsync_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 4, day).unwrap()
}

fn w(start: u32, end: u32) -> DateWindow {
    DateWindow::new(d(start), d(end))
}

fn admin() -> Actor {
    Actor {
        user_id: None,
        name: "admin".into(),
        role: Role::Admin,
    }
}

/// Engine whose clock reads 2026-04-01.
struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<FixedClock>,
    path: PathBuf,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let path = test_wal_path(name);
        let clock = Arc::new(FixedClock::on(d(1)));
        let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap());
        Self { engine, clock, path }
    }

    /// Fresh engine over the same WAL, as after a restart.
    fn reopen(&self) -> Arc<Engine> {
        Arc::new(Engine::new(self.path.clone(), Arc::new(NotifyHub::new()), self.clock.clone()).unwrap())
    }

    async fn tool(&self, quantity: u32) -> Ulid {
        let id = Ulid::new();
        self.engine
            .create_tool(id, "Cordless drill".into(), None, quantity, ToolCondition::Good, &admin())
            .await
            .unwrap();
        id
    }

    async fn member(&self, name: &str) -> (Ulid, Actor) {
        let id = Ulid::new();
        let user = self
            .engine
            .register_user(id, name.into(), Role::Member, Some("Facilities".into()), &admin())
            .await
            .unwrap();
        (id, Actor::for_user(&user))
    }

    async fn quantity(&self, tool_id: Ulid) -> u32 {
        self.engine.get_tool(tool_id).await.unwrap().quantity
    }

    async fn status(&self, tool_id: Ulid) -> ToolStatus {
        self.engine.get_tool(tool_id).await.unwrap().status()
    }
}

fn conflict(err: EngineError) -> ConflictReason {
    match err {
        EngineError::Conflict(reason) => reason,
        other => panic!("expected conflict, got {other:?}"),
    }
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_tool() {
    let fx = Fixture::new("create_tool.wal");
    let id = fx.tool(3).await;

    let tool = fx.engine.get_tool(id).await.unwrap();
    assert_eq!(tool.quantity, 3);
    assert_eq!(tool.status(), ToolStatus::Available);
    assert_eq!(fx.engine.list_tools().await.len(), 1);

    let dup = fx
        .engine
        .create_tool(id, "Again".into(), None, 1, ToolCondition::New, &admin())
        .await;
    assert!(matches!(conflict(assert_err!(dup)), ConflictReason::AlreadyExists { .. }));
}

#[tokio::test]
async fn catalog_writes_need_admin() {
    let fx = Fixture::new("catalog_admin.wal");
    let (_, member) = fx.member("mira").await;

    let err = fx
        .engine
        .create_tool(Ulid::new(), "Saw".into(), None, 1, ToolCondition::Good, &member)
        .await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));

    let err = fx
        .engine
        .register_user(Ulid::new(), "eve".into(), Role::Admin, None, &member)
        .await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));
}

#[tokio::test]
async fn blank_name_is_rejected() {
    let fx = Fixture::new("blank_name.wal");
    let err = fx
        .engine
        .create_tool(Ulid::new(), "   ".into(), None, 1, ToolCondition::Good, &admin())
        .await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));
}

#[tokio::test]
async fn user_names_are_unique() {
    let fx = Fixture::new("unique_users.wal");
    fx.member("sam").await;
    let err = fx
        .engine
        .register_user(Ulid::new(), "sam".into(), Role::Member, None, &admin())
        .await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::AlreadyExists { entity: "user", .. }));
}

#[tokio::test]
async fn update_tool_keeps_quantity() {
    let fx = Fixture::new("update_tool.wal");
    let tool = fx.tool(2).await;
    let (user, _) = fx.member("ana").await;
    assert_ok!(fx.engine.borrow(Ulid::new(), tool, user, w(1, 2), &admin()).await);

    let updated = assert_ok!(
        fx.engine
            .update_tool(tool, "Hammer drill".into(), Some(Ulid::new()), ToolCondition::Fair, &admin())
            .await
    );
    assert_eq!(updated.name, "Hammer drill");
    assert_eq!(updated.condition, ToolCondition::Fair);
    assert_eq!(updated.quantity, 1);
}

#[tokio::test]
async fn delete_tool_in_use_conflicts() {
    let fx = Fixture::new("delete_in_use.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("lee").await;
    let allocation = fx.engine.borrow(Ulid::new(), tool, user, w(1, 3), &admin()).await.unwrap();

    let err = fx.engine.delete_tool(tool, &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::ToolInUse { .. }));

    assert_ok!(fx.engine.return_allocation(allocation.id, &admin()).await);
    assert_ok!(fx.engine.delete_tool(tool, &admin()).await);
    assert!(matches!(
        fx.engine.get_tool(tool).await,
        Err(EngineError::NotFound { entity: "tool", .. })
    ));
    assert!(matches!(
        fx.engine.get_allocation(allocation.id).await,
        Err(EngineError::NotFound { .. })
    ));
}

// ── Borrow / Return ──────────────────────────────────────

#[tokio::test]
async fn borrow_flips_status_when_pool_empties() {
    let fx = Fixture::new("borrow_status.wal");
    let tool = fx.tool(2).await;
    let (user, _) = fx.member("kai").await;

    let a = assert_ok!(fx.engine.borrow(Ulid::new(), tool, user, w(1, 3), &admin()).await);
    assert_eq!(a.status, AllocationStatus::Borrowed);
    assert!(a.is_consistent());
    assert_eq!(fx.quantity(tool).await, 1);
    assert_eq!(fx.status(tool).await, ToolStatus::Available);

    assert_ok!(fx.engine.borrow(Ulid::new(), tool, user, w(1, 3), &admin()).await);
    assert_eq!(fx.quantity(tool).await, 0);
    assert_eq!(fx.status(tool).await, ToolStatus::Borrowed);

    let err = fx.engine.borrow(Ulid::new(), tool, user, w(5, 6), &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::ToolUnavailable { .. }));
}

#[tokio::test]
async fn concurrent_borrows_respect_capacity() {
    let fx = Fixture::new("concurrent_borrows.wal");
    let tool = fx.tool(3).await;
    let (user, _) = fx.member("pat").await;

    let mut handles = Vec::new();
    for _ in 0..12 {
        let engine = fx.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.borrow(Ulid::new(), tool, user, w(2, 4), &admin()).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(conflicts, 9);
    assert_eq!(fx.quantity(tool).await, 0);
    assert_eq!(fx.status(tool).await, ToolStatus::Borrowed);
    assert_eq!(fx.engine.allocations(Some(tool)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn return_is_idempotent() {
    let fx = Fixture::new("idempotent_return.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("ola").await;
    let a = fx.engine.borrow(Ulid::new(), tool, user, w(1, 3), &admin()).await.unwrap();

    fx.clock.set_today(d(3));
    let first = assert_ok!(fx.engine.return_allocation(a.id, &admin()).await);
    assert_eq!(first.status, AllocationStatus::Returned);
    assert_eq!(first.actual_return_date, Some(d(3)));
    assert_eq!(fx.quantity(tool).await, 1);

    fx.clock.set_today(d(4));
    let second = assert_ok!(fx.engine.return_allocation(a.id, &admin()).await);
    assert_eq!(second, first);
    assert_eq!(fx.quantity(tool).await, 1);
    assert_eq!(fx.status(tool).await, ToolStatus::Available);
}

#[tokio::test]
async fn return_of_unknown_allocation_is_not_found() {
    let fx = Fixture::new("return_unknown.wal");
    let err = fx.engine.return_allocation(Ulid::new(), &admin()).await;
    assert!(matches!(assert_err!(err), EngineError::NotFound { entity: "allocation", .. }));
}

#[tokio::test]
async fn borrow_with_unknown_references_is_validation() {
    let fx = Fixture::new("borrow_unknown.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("uma").await;

    let err = fx.engine.borrow(Ulid::new(), tool, Ulid::new(), w(1, 2), &admin()).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));
    let err = fx.engine.borrow(Ulid::new(), Ulid::new(), user, w(1, 2), &admin()).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));

    let reversed = DateWindow { start: d(5), end: d(2) };
    let err = fx.engine.borrow(Ulid::new(), tool, user, reversed, &admin()).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));
    assert_eq!(fx.quantity(tool).await, 1);
}

#[tokio::test]
async fn duplicate_allocation_id_is_rejected() {
    let fx = Fixture::new("duplicate_allocation.wal");
    let tool = fx.tool(2).await;
    let (user, _) = fx.member("ivo").await;
    let id = Ulid::new();
    assert_ok!(fx.engine.borrow(id, tool, user, w(1, 2), &admin()).await);
    let err = fx.engine.borrow(id, tool, user, w(1, 2), &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::AlreadyExists { .. }));
    assert_eq!(fx.quantity(tool).await, 1);
}

#[tokio::test]
async fn same_allocation_id_on_two_tools_commits_once() {
    let fx = Fixture::new("duplicate_allocation_race.wal");
    let first = fx.tool(20).await;
    let second = fx.tool(20).await;
    let (user, _) = fx.member("noor").await;

    for _ in 0..20 {
        let id = Ulid::new();
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|tool| {
                let engine = fx.engine.clone();
                tokio::spawn(async move { engine.borrow(id, tool, user, w(2, 3), &admin()).await })
            })
            .collect();

        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(a) => winners.push(a.tool_id),
                Err(e) => assert!(matches!(conflict(e), ConflictReason::AlreadyExists { .. })),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(fx.engine.tool_for_entity(&id), Some(winners[0]));

        assert_ok!(fx.engine.return_allocation(id, &admin()).await);
    }

    assert_eq!(fx.quantity(first).await, 20);
    assert_eq!(fx.quantity(second).await, 20);
    assert_ok!(fx.engine.delete_tool(first, &admin()).await);
}

#[tokio::test]
async fn failed_borrow_releases_its_id() {
    let fx = Fixture::new("released_id.wal");
    let serviced = fx.tool(1).await;
    let free = fx.tool(1).await;
    let (user, member) = fx.member("otto").await;
    fx.engine.set_maintenance(serviced, true, &admin()).await.unwrap();

    let id = Ulid::new();
    let err = fx.engine.borrow(id, serviced, user, w(1, 2), &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::ToolUnavailable { .. }));
    assert_eq!(fx.engine.tool_for_entity(&id), None);

    let a = assert_ok!(fx.engine.borrow(id, free, user, w(1, 2), &admin()).await);
    assert_eq!(a.tool_id, free);

    // Allocation and reservation ids share one namespace.
    let err = fx.engine.reserve(id, serviced, user, w(5, 6), None, &member).await;
    assert!(matches!(
        conflict(assert_err!(err)),
        ConflictReason::AlreadyExists { entity: "reservation", .. }
    ));
}

#[tokio::test]
async fn members_cannot_borrow_directly() {
    let fx = Fixture::new("member_borrow.wal");
    let tool = fx.tool(1).await;
    let (user, member) = fx.member("noa").await;
    let err = fx.engine.borrow(Ulid::new(), tool, user, w(1, 2), &member).await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));
}

// ── Maintenance ──────────────────────────────────────────

#[tokio::test]
async fn maintenance_wins_over_quantity() {
    let fx = Fixture::new("maintenance_sticky.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("bo").await;
    let a = fx.engine.borrow(Ulid::new(), tool, user, w(1, 3), &admin()).await.unwrap();

    assert_ok!(fx.engine.set_maintenance(tool, true, &admin()).await);
    assert_eq!(fx.status(tool).await, ToolStatus::Maintenance);

    assert_ok!(fx.engine.return_allocation(a.id, &admin()).await);
    assert_eq!(fx.quantity(tool).await, 1);
    assert_eq!(fx.status(tool).await, ToolStatus::Maintenance);

    let err = fx.engine.borrow(Ulid::new(), tool, user, w(4, 5), &admin()).await;
    assert!(matches!(
        conflict(assert_err!(err)),
        ConflictReason::ToolUnavailable {
            status: ToolStatus::Maintenance,
            ..
        }
    ));

    assert_ok!(fx.engine.set_maintenance(tool, false, &admin()).await);
    assert_eq!(fx.status(tool).await, ToolStatus::Available);
}

#[tokio::test]
async fn status_changes_are_broadcast() {
    let fx = Fixture::new("status_broadcast.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("cy").await;
    let mut rx = fx.engine.notify.subscribe_status_changes();

    let a = fx.engine.borrow(Ulid::new(), tool, user, w(1, 2), &admin()).await.unwrap();
    let change = rx.recv().await.unwrap();
    assert_eq!(change.tool_id, tool);
    assert_eq!(change.old, ToolStatus::Available);
    assert_eq!(change.new, ToolStatus::Borrowed);
    assert_eq!(change.changed_by, "admin");

    fx.engine.return_allocation(a.id, &admin()).await.unwrap();
    let change = rx.recv().await.unwrap();
    assert_eq!((change.old, change.new), (ToolStatus::Borrowed, ToolStatus::Available));
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn member_reserves_for_self_only() {
    let fx = Fixture::new("member_reserve.wal");
    let tool = fx.tool(2).await;
    let (me, member) = fx.member("jo").await;
    let (other, _) = fx.member("al").await;

    let r = assert_ok!(fx.engine.reserve(Ulid::new(), tool, me, w(3, 4), None, &member).await);
    assert_eq!(r.status, ReservationStatus::Pending);

    let err = fx.engine.reserve(Ulid::new(), tool, other, w(3, 4), None, &member).await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));

    let by_admin = assert_ok!(fx.engine.reserve(Ulid::new(), tool, other, w(5, 6), None, &admin()).await);
    assert_eq!(by_admin.status, ReservationStatus::Upcoming);
}

#[tokio::test]
async fn reservation_may_not_start_in_the_past() {
    let fx = Fixture::new("reserve_past.wal");
    fx.clock.set_today(d(10));
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("vi").await;
    let err = fx.engine.reserve(Ulid::new(), tool, me, w(9, 12), None, &member).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));
    assert_ok!(fx.engine.reserve(Ulid::new(), tool, me, w(10, 12), None, &member).await);
}

#[tokio::test]
async fn recurrence_is_validated_and_stored() {
    let fx = Fixture::new("recurrence.wal");
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("rae").await;

    let bad = Recurrence {
        frequency: Frequency::Weekly,
        interval: 0,
        until: None,
    };
    let err = fx.engine.reserve(Ulid::new(), tool, me, w(2, 3), Some(bad), &member).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));

    let good = Recurrence {
        frequency: Frequency::Weekly,
        interval: 1,
        until: Some(d(30)),
    };
    let r = assert_ok!(
        fx.engine
            .reserve(Ulid::new(), tool, me, w(2, 3), Some(good.clone()), &member)
            .await
    );
    assert_eq!(r.recurrence, Some(good));
}

#[tokio::test]
async fn overlapping_reservation_conflicts_disjoint_succeeds() {
    let fx = Fixture::new("reserve_overlap.wal");
    let tool = fx.tool(1).await;
    let (a, alice) = fx.member("alice").await;
    let (b, bob) = fx.member("bob").await;

    assert_ok!(fx.engine.reserve(Ulid::new(), tool, a, w(1, 3), None, &alice).await);

    // Shares day 3 with the first window.
    let err = fx.engine.reserve(Ulid::new(), tool, b, w(3, 5), None, &bob).await;
    assert!(matches!(
        conflict(assert_err!(err)),
        ConflictReason::NoCapacity { available: 0, .. }
    ));

    assert_ok!(fx.engine.reserve(Ulid::new(), tool, b, w(4, 6), None, &bob).await);
}

#[tokio::test]
async fn reservations_fill_capacity_in_shared_window() {
    let fx = Fixture::new("reserve_capacity.wal");
    let tool = fx.tool(2).await;
    let (a, alice) = fx.member("ali").await;
    let (b, bob) = fx.member("bea").await;
    let (c, cid) = fx.member("cid").await;

    assert_ok!(fx.engine.reserve(Ulid::new(), tool, a, w(2, 5), None, &alice).await);
    assert_ok!(fx.engine.reserve(Ulid::new(), tool, b, w(4, 8), None, &bob).await);
    let err = fx.engine.reserve(Ulid::new(), tool, c, w(5, 5), None, &cid).await;
    assert!(err.unwrap_err().is_conflict());

    let a = fx.engine.get_availability(tool, Some(w(5, 5))).await.unwrap();
    assert_eq!((a.total, a.borrowed, a.reserved, a.available), (2, 0, 2, 0));
    let a = fx.engine.get_availability(tool, Some(w(9, 10))).await.unwrap();
    assert_eq!(a.available, 2);
}

#[tokio::test]
async fn approve_creates_exactly_one_allocation() {
    let fx = Fixture::new("approve_once.wal");
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("dee").await;
    let r = fx.engine.reserve(Ulid::new(), tool, me, w(2, 4), None, &member).await.unwrap();

    let before = fx.engine.get_availability(tool, Some(w(2, 4))).await.unwrap();
    assert_eq!((before.reserved, before.available), (1, 0));

    let allocation = assert_ok!(fx.engine.approve_reservation(r.id, &admin()).await);
    assert_eq!(allocation.reservation_id, Some(r.id));
    assert_eq!(allocation.window, r.window);
    assert_eq!(allocation.user_id, me);

    let reservation = fx.engine.get_reservation(r.id).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Completed);
    assert_eq!(reservation.allocation_id, Some(allocation.id));

    let after = fx.engine.get_availability(tool, Some(w(2, 4))).await.unwrap();
    assert_eq!((after.total, after.borrowed, after.reserved, after.available), (1, 1, 0, 0));
    assert_eq!(fx.quantity(tool).await, 0);
    assert_eq!(fx.status(tool).await, ToolStatus::Borrowed);
    assert_eq!(fx.engine.allocations(Some(tool)).await.unwrap().len(), 1);

    let err = fx.engine.approve_reservation(r.id, &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::AlreadyResolved { .. }));
    assert_eq!(fx.engine.allocations(Some(tool)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn approve_on_maintenance_tool_leaves_reservation_pending() {
    let fx = Fixture::new("approve_maintenance.wal");
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("eli").await;
    let r = fx.engine.reserve(Ulid::new(), tool, me, w(2, 4), None, &member).await.unwrap();
    fx.engine.set_maintenance(tool, true, &admin()).await.unwrap();

    let err = fx.engine.approve_reservation(r.id, &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::ToolUnavailable { .. }));
    assert_eq!(
        fx.engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(fx.quantity(tool).await, 1);
}

#[tokio::test]
async fn approve_rechecks_capacity_against_other_holds() {
    let fx = Fixture::new("approve_capacity.wal");
    let tool = fx.tool(2).await;
    let (me, member) = fx.member("pia").await;

    let r1 = fx.engine.reserve(Ulid::new(), tool, me, w(3, 5), None, &member).await.unwrap();
    fx.engine.reserve(Ulid::new(), tool, me, w(4, 6), None, &member).await.unwrap();
    // A loan in a disjoint window still takes a unit out of the pool.
    fx.engine.borrow(Ulid::new(), tool, me, w(8, 9), &admin()).await.unwrap();
    assert_eq!(fx.quantity(tool).await, 1);

    let err = fx.engine.approve_reservation(r1.id, &admin()).await;
    assert!(matches!(
        conflict(assert_err!(err)),
        ConflictReason::NoCapacity { available: 0, .. }
    ));
    assert_eq!(
        fx.engine.get_reservation(r1.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(fx.quantity(tool).await, 1);
    assert_eq!(fx.engine.allocations(Some(tool)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn approve_requires_admin_and_pending() {
    let fx = Fixture::new("approve_rules.wal");
    let tool = fx.tool(2).await;
    let (me, member) = fx.member("fay").await;
    let r = fx.engine.reserve(Ulid::new(), tool, me, w(2, 4), None, &member).await.unwrap();

    let err = fx.engine.approve_reservation(r.id, &member).await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));

    assert_ok!(fx.engine.confirm_reservation(r.id, &admin()).await);
    let err = fx.engine.approve_reservation(r.id, &admin()).await;
    assert!(matches!(
        conflict(assert_err!(err)),
        ConflictReason::InvalidTransition {
            from: ReservationStatus::Upcoming,
            ..
        }
    ));

    let err = fx.engine.approve_reservation(Ulid::new(), &admin()).await;
    assert!(matches!(assert_err!(err), EngineError::NotFound { entity: "reservation", .. }));
}

#[tokio::test]
async fn confirm_then_decline() {
    let fx = Fixture::new("confirm_decline.wal");
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("gus").await;
    let r = fx.engine.reserve(Ulid::new(), tool, me, w(2, 4), None, &member).await.unwrap();

    let confirmed = assert_ok!(fx.engine.confirm_reservation(r.id, &admin()).await);
    assert_eq!(confirmed.status, ReservationStatus::Upcoming);
    let err = fx.engine.confirm_reservation(r.id, &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::InvalidTransition { .. }));

    let declined = assert_ok!(fx.engine.decline_reservation(r.id, &admin()).await);
    assert_eq!(declined.status, ReservationStatus::Cancelled);
    let err = fx.engine.decline_reservation(r.id, &admin()).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::AlreadyResolved { .. }));

    // Declining released the hold.
    let a = fx.engine.get_availability(tool, Some(w(2, 4))).await.unwrap();
    assert_eq!(a.available, 1);
}

#[tokio::test]
async fn cancel_by_owner_frees_capacity() {
    let fx = Fixture::new("cancel_owner.wal");
    let tool = fx.tool(1).await;
    let (a, alice) = fx.member("amy").await;
    let (b, bob) = fx.member("ben").await;
    let r = fx.engine.reserve(Ulid::new(), tool, a, w(2, 4), None, &alice).await.unwrap();

    let err = fx.engine.cancel_reservation(r.id, &bob).await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));

    assert_ok!(fx.engine.cancel_reservation(r.id, &alice).await);
    assert_ok!(fx.engine.reserve(Ulid::new(), tool, b, w(3, 3), None, &bob).await);
}

// ── Return requests ──────────────────────────────────────

#[tokio::test]
async fn return_request_flow() {
    let fx = Fixture::new("return_request.wal");
    let tool = fx.tool(1).await;
    let (me, member) = fx.member("hal").await;
    let (_, stranger) = fx.member("ira").await;
    let a = fx.engine.borrow(Ulid::new(), tool, me, w(1, 3), &admin()).await.unwrap();

    let err = fx.engine.request_return(a.id, &stranger).await;
    assert!(matches!(assert_err!(err), EngineError::Unauthorized(_)));

    let flagged = assert_ok!(fx.engine.request_return(a.id, &member).await);
    assert!(flagged.return_requested);
    assert_eq!(flagged.status, AllocationStatus::Borrowed);
    assert_eq!(fx.quantity(tool).await, 0);

    let declined = assert_ok!(fx.engine.decline_return(a.id, &admin()).await);
    assert!(!declined.return_requested);
    assert_eq!(declined.status, AllocationStatus::Borrowed);

    assert_ok!(fx.engine.request_return(a.id, &member).await);
    let returned = assert_ok!(fx.engine.return_allocation(a.id, &admin()).await);
    assert!(!returned.return_requested);

    let err = fx.engine.request_return(a.id, &member).await;
    assert!(matches!(conflict(assert_err!(err)), ConflictReason::AlreadyReturned { .. }));
}

// ── Activation ───────────────────────────────────────────

#[tokio::test]
async fn activation_skips_and_continues() {
    let fx = Fixture::new("activation_skip.wal");
    let free = fx.tool(1).await;
    let serviced = fx.tool(1).await;
    let (user, _) = fx.member("jan").await;

    let r1 = fx.engine.reserve(Ulid::new(), free, user, w(3, 5), None, &admin()).await.unwrap();
    let r2 = fx.engine.reserve(Ulid::new(), serviced, user, w(3, 5), None, &admin()).await.unwrap();
    fx.engine.set_maintenance(serviced, true, &admin()).await.unwrap();

    let report = fx.engine.activate_due_reservations(d(3)).await;
    assert_eq!(report.activated.len(), 1);
    assert_eq!(report.activated[0].reservation_id, r1.id);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reservation_id, r2.id);

    assert_eq!(
        fx.engine.get_reservation(r1.id).await.unwrap().status,
        ReservationStatus::Completed
    );
    assert_eq!(
        fx.engine.get_reservation(r2.id).await.unwrap().status,
        ReservationStatus::Upcoming
    );
    assert_eq!(fx.status(free).await, ToolStatus::Borrowed);
    assert_eq!(fx.quantity(serviced).await, 1);

    // Same day again: nothing new is allocated.
    let again = fx.engine.activate_due_reservations(d(3)).await;
    assert!(again.activated.is_empty());
    assert_eq!(fx.engine.allocations(Some(free)).await.unwrap().len(), 1);

    // Out of maintenance, the next sweep picks it up.
    fx.engine.set_maintenance(serviced, false, &admin()).await.unwrap();
    let later = fx.engine.activate_due_reservations(d(4)).await;
    assert_eq!(later.activated.len(), 1);
    assert_eq!(later.activated[0].reservation_id, r2.id);
}

#[tokio::test]
async fn activation_skips_when_capacity_is_gone() {
    let fx = Fixture::new("activation_capacity.wal");
    let tool = fx.tool(2).await;
    let (user, _) = fx.member("quin").await;

    let r1 = fx.engine.reserve(Ulid::new(), tool, user, w(3, 5), None, &admin()).await.unwrap();
    let r2 = fx.engine.reserve(Ulid::new(), tool, user, w(4, 6), None, &admin()).await.unwrap();
    fx.engine.borrow(Ulid::new(), tool, user, w(8, 9), &admin()).await.unwrap();

    let report = fx.engine.activate_due_reservations(d(3)).await;
    assert!(report.activated.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reservation_id, r1.id);
    assert!(report.skipped[0].reason.contains("no free unit"));

    for id in [r1.id, r2.id] {
        assert_eq!(
            fx.engine.get_reservation(id).await.unwrap().status,
            ReservationStatus::Upcoming
        );
    }
    assert_eq!(fx.quantity(tool).await, 1);
}

#[tokio::test]
async fn activation_ignores_pending_and_future() {
    let fx = Fixture::new("activation_filter.wal");
    let tool = fx.tool(3).await;
    let (me, member) = fx.member("kim").await;

    let pending = fx.engine.reserve(Ulid::new(), tool, me, w(2, 3), None, &member).await.unwrap();
    let future = fx.engine.reserve(Ulid::new(), tool, me, w(9, 10), None, &admin()).await.unwrap();
    let due = fx.engine.reserve(Ulid::new(), tool, me, w(1, 2), None, &admin()).await.unwrap();

    let listed = fx.engine.due_reservations(d(2)).await;
    assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![due.id]);

    let report = fx.engine.activate_due_reservations(d(2)).await;
    assert_eq!(report.activated.len(), 1);
    assert_eq!(
        fx.engine.get_reservation(pending.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(
        fx.engine.get_reservation(future.id).await.unwrap().status,
        ReservationStatus::Upcoming
    );
}

#[tokio::test]
async fn activation_counts_own_hold_as_free() {
    let fx = Fixture::new("activation_self.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("lou").await;
    let r = fx.engine.reserve(Ulid::new(), tool, user, w(2, 2), None, &admin()).await.unwrap();

    let report = fx.engine.activate_due_reservations(d(2)).await;
    assert_eq!(report.activated.len(), 1);
    assert_eq!(report.activated[0].reservation_id, r.id);
    assert!(report.skipped.is_empty());
}

// ── Walkthrough ──────────────────────────────────────────

#[tokio::test]
async fn borrow_reserve_return_walkthrough() {
    let fx = Fixture::new("walkthrough.wal");
    let tool = fx.tool(1).await;
    let (a, _) = fx.member("user_a").await;
    let (b, user_b) = fx.member("user_b").await;

    let allocation = assert_ok!(fx.engine.borrow(Ulid::new(), tool, a, w(1, 3), &admin()).await);
    assert_eq!(fx.quantity(tool).await, 0);
    assert_eq!(fx.status(tool).await, ToolStatus::Borrowed);

    let err = fx.engine.reserve(Ulid::new(), tool, b, w(2, 4), None, &user_b).await;
    assert!(assert_err!(err).is_conflict());

    assert_ok!(fx.engine.return_allocation(allocation.id, &admin()).await);
    assert_eq!(fx.quantity(tool).await, 1);
    assert_eq!(fx.status(tool).await, ToolStatus::Available);

    let r = assert_ok!(fx.engine.reserve(Ulid::new(), tool, b, w(2, 4), None, &user_b).await);
    assert_eq!(r.status, ReservationStatus::Pending);
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn availability_query_checks_window() {
    let fx = Fixture::new("availability_query.wal");
    let tool = fx.tool(1).await;

    let err = fx.engine.get_availability(tool, Some(DateWindow { start: d(5), end: d(1) })).await;
    assert!(matches!(assert_err!(err), EngineError::Validation(_)));

    let err = fx.engine.get_availability(Ulid::new(), None).await;
    assert!(matches!(assert_err!(err), EngineError::NotFound { entity: "tool", .. }));

    let a = assert_ok!(fx.engine.get_availability(tool, None).await);
    assert_eq!((a.total, a.available), (1, 1));
}

#[tokio::test]
async fn overdue_and_dashboard() {
    let fx = Fixture::new("overdue_dashboard.wal");
    let drill = fx.tool(2).await;
    let saw = fx.tool(1).await;
    let (user, member) = fx.member("max").await;

    let late = fx.engine.borrow(Ulid::new(), drill, user, w(1, 2), &admin()).await.unwrap();
    fx.engine.borrow(Ulid::new(), drill, user, w(1, 9), &admin()).await.unwrap();
    fx.engine.reserve(Ulid::new(), saw, user, w(6, 7), None, &member).await.unwrap();
    fx.engine.reserve(Ulid::new(), saw, user, w(8, 9), None, &admin()).await.unwrap();
    fx.engine.set_maintenance(saw, true, &admin()).await.unwrap();

    let overdue = fx.engine.overdue_allocations(d(5)).await;
    assert_eq!(overdue.iter().map(|a| a.id).collect::<Vec<_>>(), vec![late.id]);

    let summary = fx.engine.dashboard(d(5)).await;
    assert_eq!(summary.tools, 2);
    assert_eq!(summary.units_total, 3);
    assert_eq!(summary.tools_in_maintenance, 1);
    assert_eq!(summary.active_allocations, 2);
    assert_eq!(summary.overdue_allocations, 1);
    assert_eq!(summary.pending_reservations, 1);
    assert_eq!(summary.upcoming_reservations, 1);
}

#[tokio::test]
async fn overdue_skips_tool_being_deleted() {
    let fx = Fixture::new("overdue_deleted.wal");
    let tool = fx.tool(1).await;
    let (user, _) = fx.member("rae").await;
    fx.engine.borrow(Ulid::new(), tool, user, w(1, 2), &admin()).await.unwrap();
    assert_eq!(fx.engine.overdue_allocations(d(5)).await.len(), 1);

    // Deletion marks the state before the map entry goes away.
    let handle = fx.engine.tool_handle(&tool).unwrap();
    handle.write().await.deleted = true;
    assert!(fx.engine.overdue_allocations(d(5)).await.is_empty());
}

#[tokio::test]
async fn resolve_actor_by_session_name() {
    let fx = Fixture::new("resolve_actor.wal");
    let (id, _) = fx.member("nell").await;
    let admins = vec!["root".to_string(), "nell".to_string()];

    let nell = fx.engine.resolve_actor("nell", &admins);
    assert_eq!(nell.user_id, Some(id));
    assert!(nell.is_admin());

    let root = fx.engine.resolve_actor("root", &admins);
    assert_eq!(root.user_id, None);
    assert!(root.is_admin());

    let nobody = fx.engine.resolve_actor("guest", &admins);
    assert!(!nobody.is_admin());
    assert!(!nobody.acts_for(id));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let fx = Fixture::new("replay.wal");
    let tool = fx.tool(2).await;
    let (me, member) = fx.member("ona").await;
    let returned = fx.engine.borrow(Ulid::new(), tool, me, w(1, 2), &admin()).await.unwrap();
    fx.engine.return_allocation(returned.id, &admin()).await.unwrap();
    let out = fx.engine.borrow(Ulid::new(), tool, me, w(1, 5), &admin()).await.unwrap();
    let approved = fx.engine.reserve(Ulid::new(), tool, me, w(6, 7), None, &member).await.unwrap();
    fx.engine.approve_reservation(approved.id, &admin()).await.unwrap();
    fx.engine.set_maintenance(tool, true, &admin()).await.unwrap();

    let before = fx.engine.get_availability(tool, None).await.unwrap();
    let restarted = fx.reopen();

    let after = restarted.get_availability(tool, None).await.unwrap();
    assert_eq!(after, before);
    let t = restarted.get_tool(tool).await.unwrap();
    assert_eq!(t.quantity, 0);
    assert_eq!(t.status(), ToolStatus::Maintenance);
    assert_eq!(
        restarted.get_allocation(out.id).await.unwrap().status,
        AllocationStatus::Borrowed
    );
    assert_eq!(
        restarted.get_reservation(approved.id).await.unwrap().status,
        ReservationStatus::Completed
    );
    assert_eq!(restarted.get_user(me).unwrap().name, "ona");
    // The entity index is rebuilt too.
    assert_ok!(restarted.return_allocation(out.id, &admin()).await);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let fx = Fixture::new("compaction.wal");
    let tool = fx.tool(3).await;
    let gone = fx.tool(1).await;
    let (me, member) = fx.member("pia").await;
    for _ in 0..5 {
        let a = fx.engine.borrow(Ulid::new(), tool, me, w(1, 2), &admin()).await.unwrap();
        fx.engine.return_allocation(a.id, &admin()).await.unwrap();
    }
    let out = fx.engine.borrow(Ulid::new(), tool, me, w(1, 4), &admin()).await.unwrap();
    let pending = fx.engine.reserve(Ulid::new(), tool, me, w(3, 4), None, &member).await.unwrap();
    fx.engine.delete_tool(gone, &admin()).await.unwrap();

    let size_before = std::fs::metadata(&fx.path).unwrap().len();
    assert_ok!(fx.engine.compact_wal().await);
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);
    let size_after = std::fs::metadata(&fx.path).unwrap().len();
    assert!(size_after < size_before);

    let restarted = fx.reopen();
    assert_eq!(restarted.list_tools().await.len(), 1);
    assert_eq!(restarted.get_tool(tool).await.unwrap().quantity, 2);
    assert_eq!(restarted.allocations(Some(tool)).await.unwrap().len(), 6);
    assert_eq!(
        restarted.get_reservation(pending.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(
        restarted.get_availability(tool, Some(w(3, 4))).await.unwrap(),
        fx.engine.get_availability(tool, Some(w(3, 4))).await.unwrap()
    );

    // Restored records still go through the normal paths.
    assert_ok!(restarted.return_allocation(out.id, &admin()).await);
    assert_eq!(restarted.get_tool(tool).await.unwrap().quantity, 3);
    assert_ok!(restarted.approve_reservation(pending.id, &admin()).await);
}
