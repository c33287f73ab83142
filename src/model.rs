use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Inclusive calendar-date range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateWindow start must not be after end");
        Self { start, end }
    }

    /// `None` when `end` precedes `start`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: windows sharing a single day overlap.
    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_date(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ── Tools ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolStatus {
    Available,
    Borrowed,
    Maintenance,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Available => "AVAILABLE",
            ToolStatus::Borrowed => "BORROWED",
            ToolStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolCondition {
    New,
    Good,
    Fair,
    Poor,
    Damaged,
}

impl ToolCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCondition::New => "new",
            ToolCondition::Good => "good",
            ToolCondition::Fair => "fair",
            ToolCondition::Poor => "poor",
            ToolCondition::Damaged => "damaged",
        }
    }
}

impl FromStr for ToolCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(ToolCondition::New),
            "good" => Ok(ToolCondition::Good),
            "fair" => Ok(ToolCondition::Fair),
            "poor" => Ok(ToolCondition::Poor),
            "damaged" => Ok(ToolCondition::Damaged),
            other => Err(format!("unknown condition: {other}")),
        }
    }
}

/// A catalog entry. `quantity` counts units in the pool, not units out on loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub id: Ulid,
    pub name: String,
    pub category_id: Option<Ulid>,
    pub quantity: u32,
    pub condition: ToolCondition,
    /// Set by the maintenance workflow. Wins over quantity.
    pub under_maintenance: bool,
}

impl Tool {
    /// Derived, never stored: maintenance first, then an empty pool.
    pub fn status(&self) -> ToolStatus {
        if self.under_maintenance {
            ToolStatus::Maintenance
        } else if self.quantity == 0 {
            ToolStatus::Borrowed
        } else {
            ToolStatus::Available
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.status() == ToolStatus::Available && self.quantity >= 1
    }
}

// ── Allocations ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Borrowed,
    Returned,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Borrowed => "BORROWED",
            AllocationStatus::Returned => "RETURNED",
        }
    }
}

/// A realized borrow. `window` runs from the borrow date to the expected return date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub tool_id: Ulid,
    pub user_id: Ulid,
    pub window: DateWindow,
    pub actual_return_date: Option<NaiveDate>,
    pub status: AllocationStatus,
    /// Reservation this allocation materialized from, if any.
    pub reservation_id: Option<Ulid>,
    /// Borrower asked to hand the unit back; cleared on return or decline.
    pub return_requested: bool,
}

impl Allocation {
    pub fn borrowed(
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
        reservation_id: Option<Ulid>,
    ) -> Self {
        Self {
            id,
            tool_id,
            user_id,
            window,
            actual_return_date: None,
            status: AllocationStatus::Borrowed,
            reservation_id,
            return_requested: false,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.status == AllocationStatus::Borrowed
    }

    /// BORROWED → RETURNED. Returns false (and changes nothing) when already returned.
    pub fn mark_returned(&mut self, on: NaiveDate) -> bool {
        if !self.is_outstanding() {
            return false;
        }
        self.actual_return_date.get_or_insert(on);
        self.status = AllocationStatus::Returned;
        self.return_requested = false;
        true
    }

    pub fn is_overdue(&self, as_of: NaiveDate) -> bool {
        self.is_outstanding() && self.window.end < as_of
    }

    /// Status and return date must agree.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            AllocationStatus::Borrowed => self.actual_return_date.is_none(),
            AllocationStatus::Returned => self.actual_return_date.is_some(),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Upcoming,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Upcoming => "UPCOMING",
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    /// Non-terminal reservations count against the tool's capacity.
    pub fn holds_capacity(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (*self, next),
            (Pending, Upcoming)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (Upcoming, Active)
                | (Upcoming, Cancelled)
                | (Active, Completed)
                | (Active, Cancelled)
        )
    }

    /// Steps walked when the reservation materializes into an allocation.
    /// Empty for states that cannot be fulfilled.
    pub fn fulfilment_path(&self) -> &'static [ReservationStatus] {
        match self {
            ReservationStatus::Pending => &[ReservationStatus::Completed],
            ReservationStatus::Upcoming => &[ReservationStatus::Active, ReservationStatus::Completed],
            ReservationStatus::Active => &[ReservationStatus::Completed],
            ReservationStatus::Completed | ReservationStatus::Cancelled => &[],
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Repeat pattern attached to a reservation. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub interval: u32,
    pub until: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub tool_id: Ulid,
    pub user_id: Ulid,
    pub window: DateWindow,
    pub status: ReservationStatus,
    pub recurrence: Option<Recurrence>,
    /// Allocation created when this reservation was fulfilled.
    pub allocation_id: Option<Ulid>,
}

impl Reservation {
    pub fn holds_capacity(&self) -> bool {
        self.status.holds_capacity()
    }
}

// ── Users & actors ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "member" | "user" => Ok(Role::Member),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    pub department: Option<String>,
}

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<Ulid>,
    pub name: String,
    pub role: Role,
}

impl Actor {
    /// Identity used by background jobs.
    pub fn system() -> Self {
        Self {
            user_id: None,
            name: "system".into(),
            role: Role::Admin,
        }
    }

    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: Some(user.id),
            name: user.name.clone(),
            role: user.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act for anyone; members only for themselves.
    pub fn acts_for(&self, user_id: Ulid) -> bool {
        self.is_admin() || self.user_id == Some(user_id)
    }
}

// ── Derived views ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub tool_id: Ulid,
    pub total: u32,
    pub borrowed: u32,
    pub reserved: u32,
    pub available: u32,
}

/// Audit record for a change of `Tool::status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub tool_id: Ulid,
    pub old: ToolStatus,
    pub new: ToolStatus,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardSummary {
    pub tools: usize,
    pub units_total: u64,
    pub units_available: u64,
    pub tools_in_maintenance: usize,
    pub active_allocations: usize,
    pub overdue_allocations: usize,
    pub pending_reservations: usize,
    pub upcoming_reservations: usize,
}

// ── Per-tool state (the unit of locking) ─────────────────────────

#[derive(Debug, Clone)]
pub struct ToolState {
    pub tool: Tool,
    /// Sorted by `window.start`.
    pub allocations: Vec<Allocation>,
    /// Sorted by `window.start`.
    pub reservations: Vec<Reservation>,
    /// Set when the tool is deleted while another task still holds its handle.
    pub deleted: bool,
}

impl ToolState {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            allocations: Vec::new(),
            reservations: Vec::new(),
            deleted: false,
        }
    }

    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .partition_point(|a| a.window.start <= allocation.window.start);
        self.allocations.insert(pos, allocation);
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.window.start <= reservation.window.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn allocation(&self, id: &Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == *id)
    }

    pub fn allocation_mut(&mut self, id: &Ulid) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == *id)
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn borrowed_count(&self) -> u32 {
        self.allocations.iter().filter(|a| a.is_outstanding()).count() as u32
    }

    /// Nominal capacity: units in the pool plus units out on loan.
    pub fn total_quantity(&self) -> u32 {
        self.tool.quantity + self.borrowed_count()
    }

    /// True while anything still holds or may hold a unit of this tool.
    pub fn has_open_records(&self) -> bool {
        self.allocations.iter().any(Allocation::is_outstanding)
            || self.reservations.iter().any(Reservation::holds_capacity)
    }

    pub fn record_count(&self) -> usize {
        self.allocations.len() + self.reservations.len()
    }
}

/// WAL record. One event is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ToolCreated {
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        quantity: u32,
        condition: ToolCondition,
    },
    ToolUpdated {
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        condition: ToolCondition,
    },
    ToolDeleted {
        id: Ulid,
    },
    MaintenanceChanged {
        tool_id: Ulid,
        under_maintenance: bool,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        role: Role,
        department: Option<String>,
    },
    AllocationCreated {
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
    },
    AllocationReturned {
        id: Ulid,
        tool_id: Ulid,
        returned_on: NaiveDate,
    },
    ReturnRequested {
        id: Ulid,
        tool_id: Ulid,
    },
    ReturnDeclined {
        id: Ulid,
        tool_id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
        status: ReservationStatus,
        recurrence: Option<Recurrence>,
    },
    ReservationStatusChanged {
        id: Ulid,
        tool_id: Ulid,
        status: ReservationStatus,
    },
    /// Reservation materialized: allocation inserted, one unit taken from
    /// the pool and the reservation completed, all at once.
    ReservationFulfilled {
        reservation_id: Ulid,
        allocation_id: Ulid,
        tool_id: Ulid,
    },
    /// Compaction snapshot of an allocation; no quantity side effects.
    AllocationRestored(Allocation),
    /// Compaction snapshot of a reservation.
    ReservationRestored(Reservation),
}

impl Event {
    /// Tool the event applies to; `None` for events handled outside a tool's state.
    pub fn tool_id(&self) -> Option<Ulid> {
        match self {
            Event::ToolUpdated { id, .. } => Some(*id),
            Event::MaintenanceChanged { tool_id, .. }
            | Event::AllocationCreated { tool_id, .. }
            | Event::AllocationReturned { tool_id, .. }
            | Event::ReturnRequested { tool_id, .. }
            | Event::ReturnDeclined { tool_id, .. }
            | Event::ReservationCreated { tool_id, .. }
            | Event::ReservationStatusChanged { tool_id, .. }
            | Event::ReservationFulfilled { tool_id, .. } => Some(*tool_id),
            Event::AllocationRestored(a) => Some(a.tool_id),
            Event::ReservationRestored(r) => Some(r.tool_id),
            Event::ToolCreated { .. } | Event::ToolDeleted { .. } | Event::UserRegistered { .. } => {
                None
            }
        }
    }

    /// Short name for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ToolCreated { .. } => "tool_created",
            Event::ToolUpdated { .. } => "tool_updated",
            Event::ToolDeleted { .. } => "tool_deleted",
            Event::MaintenanceChanged { .. } => "maintenance_changed",
            Event::UserRegistered { .. } => "user_registered",
            Event::AllocationCreated { .. } => "allocation_created",
            Event::AllocationReturned { .. } => "allocation_returned",
            Event::ReturnRequested { .. } => "return_requested",
            Event::ReturnDeclined { .. } => "return_declined",
            Event::ReservationCreated { .. } => "reservation_created",
            Event::ReservationStatusChanged { .. } => "reservation_status_changed",
            Event::ReservationFulfilled { .. } => "reservation_fulfilled",
            Event::AllocationRestored(_) => "allocation_restored",
            Event::ReservationRestored(_) => "reservation_restored",
        }
    }
}
