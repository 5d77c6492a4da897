use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Monetary amount in minor units (cents).
pub type Cents = i64;

/// One day in ms.
pub const DAY: Ms = 86_400_000;

/// Half-open date-range intersection. Touching ranges (`end_a == start_b`) do not overlap.
///
/// Every date-conflict check in the crate goes through this function.
pub fn overlaps(start_a: Ms, end_a: Ms, start_b: Ms, end_b: Ms) -> bool {
    start_a < end_b && end_a > start_b
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

// ── Inventory ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetStatus {
    Available,
    Reserved,
    InUse,
    InTransitToEvent,
    InTransitToStock,
    Damaged,
    Maintenance,
    Lost,
}

impl AssetStatus {
    /// Conditions set by an operator. Scan transitions never overwrite them.
    pub fn is_manual_condition(self) -> bool {
        matches!(self, AssetStatus::Damaged | AssetStatus::Maintenance | AssetStatus::Lost)
    }
}

/// One physical, individually tracked unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Ulid,
    pub sku: String,
    pub serial_number: Option<String>,
    pub status: AssetStatus,
    pub current_location_id: Option<Ulid>,
    pub needs_maintenance: bool,
    pub value: Cents,
}

/// SKU-level definition. Quantities are always derived by counting assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub unit_weight_kg: f64,
    pub unit_volume_m3: f64,
    pub unit_price: Cents,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Loaded,
    Delivered,
    Returned,
    Cancelled,
}

/// Binds one asset to one event for one date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub event_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
}

impl Reservation {
    /// Anything but Cancelled still claims the asset for its window.
    pub fn is_active(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }

    /// Still ahead of or in the middle of its physical cycle.
    pub fn is_open(&self) -> bool {
        !matches!(self.status, ReservationStatus::Cancelled | ReservationStatus::Returned)
    }

    /// Active, overlapping `window`, and owned by an event other than `event_id`.
    pub fn conflicts_with(&self, event_id: Ulid, window: &Span) -> bool {
        self.is_active() && self.event_id != event_id && self.span.overlaps(window)
    }
}

// ── Events and quotes ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truck {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Planned,
    Validated,
    InProgress,
    Completed,
    Cancelled,
}

/// A time-bound job. `span` is the operative window used for every conflict check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub name: String,
    pub span: Span,
    pub truck_id: Option<Ulid>,
    pub status: EventStatus,
}

/// One SKU requested for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLine {
    pub id: Ulid,
    pub event_id: Ulid,
    pub sku: String,
    pub quantity: u32,
    /// Ordered; the tail holds the most recently added assets.
    pub assigned_assets: Vec<Ulid>,
}

// ── Scan lists ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanDirection {
    StockToTruck,
    TruckToEvent,
    EventToTruck,
    TruckToStock,
}

impl ScanDirection {
    /// Physical order of the four movements.
    pub const ALL: [ScanDirection; 4] = [
        ScanDirection::StockToTruck,
        ScanDirection::TruckToEvent,
        ScanDirection::EventToTruck,
        ScanDirection::TruckToStock,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ScanDirection::StockToTruck => "stock_to_truck",
            ScanDirection::TruckToEvent => "truck_to_event",
            ScanDirection::EventToTruck => "event_to_truck",
            ScanDirection::TruckToStock => "truck_to_stock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanListStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanList {
    pub id: Ulid,
    pub event_id: Ulid,
    pub direction: ScanDirection,
    pub status: ScanListStatus,
    pub task_id: Option<Ulid>,
    pub completed_at: Option<Ms>,
}

// ── Tasks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    LoadTruck,
    DeliverToEvent,
    ReloadTruck,
    ReturnToStock,
    Custom,
}

impl TaskKind {
    pub fn for_direction(direction: ScanDirection) -> Self {
        match direction {
            ScanDirection::StockToTruck => TaskKind::LoadTruck,
            ScanDirection::TruckToEvent => TaskKind::DeliverToEvent,
            ScanDirection::EventToTruck => TaskKind::ReloadTruck,
            ScanDirection::TruckToStock => TaskKind::ReturnToStock,
        }
    }
}

/// Position of a task inside its chain. Neighbours are derived from the chain's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub chain_id: Ulid,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Ulid,
    pub event_id: Ulid,
    pub title: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub chain: Option<ChainLink>,
    /// None means claimable by any team member.
    pub assigned_user_id: Option<Ulid>,
    pub created_by: Ulid,
    pub trigger_notification: bool,
    pub completed_at: Option<Ms>,
    pub completed_by: Option<Ulid>,
    pub cancel_reason: Option<String>,
}

/// Ordered sequence of tasks for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChain {
    pub id: Ulid,
    pub event_id: Ulid,
    pub task_ids: Vec<Ulid>,
}

impl TaskChain {
    pub fn previous_of(&self, position: usize) -> Option<Ulid> {
        position.checked_sub(1).and_then(|p| self.task_ids.get(p).copied())
    }

    pub fn next_of(&self, position: usize) -> Option<Ulid> {
        self.task_ids.get(position + 1).copied()
    }
}

/// Input to chain construction, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub title: String,
    pub kind: TaskKind,
    pub assigned_user_id: Option<Ulid>,
    pub trigger_notification: bool,
    /// Head task waits on something outside the chain.
    pub externally_blocked: bool,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            title: title.into(),
            kind,
            assigned_user_id: None,
            trigger_notification: false,
            externally_blocked: false,
        }
    }

    pub fn assigned_to(mut self, user_id: Ulid) -> Self {
        self.assigned_user_id = Some(user_id);
        self
    }

    pub fn notify_on_completion(mut self) -> Self {
        self.trigger_notification = true;
        self
    }
}

/// One state change. A commit is a list of these and is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    CatalogItemUpserted(CatalogItem),
    AssetUpserted(Asset),
    TruckUpserted(Truck),
    EventUpserted(Event),
    QuoteLineUpserted(QuoteLine),
    QuoteLineRemoved { id: Ulid },
    ReservationUpserted(Reservation),
    ReservationDeleted { id: Ulid },
    ScanListUpserted(ScanList),
    TaskUpserted(Task),
    ChainCreated(TaskChain),
}
