use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    UnknownSku(String),
    AssetNotFound(Ulid),
    InsufficientStock {
        available: u32,
        requested: u32,
    },
    TruckNotFound(Ulid),
    TruckUnavailable {
        truck_name: String,
        conflicting_event: String,
    },
    /// Persistence failed part-way through an allocation; nothing was committed.
    ReservationFailed(String),
    /// A commit would leave one asset actively booked by two overlapping events.
    ConflictDetected {
        asset_id: Ulid,
        event_id: Ulid,
    },
    InvalidTransition {
        id: Ulid,
        from: String,
    },
    AlreadyFinalized(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownSku(sku) => write!(f, "unknown sku: {sku}"),
            EngineError::AssetNotFound(id) => write!(f, "asset not found: {id}"),
            EngineError::InsufficientStock {
                available,
                requested,
            } => write!(
                f,
                "insufficient stock: {available} available, {requested} requested"
            ),
            EngineError::TruckNotFound(id) => write!(f, "truck not found: {id}"),
            EngineError::TruckUnavailable {
                truck_name,
                conflicting_event,
            } => write!(
                f,
                "truck {truck_name} is already assigned to overlapping event {conflicting_event}"
            ),
            EngineError::ReservationFailed(e) => write!(f, "reservation failed: {e}"),
            EngineError::ConflictDetected { asset_id, event_id } => write!(
                f,
                "asset {asset_id} already booked by overlapping event {event_id}"
            ),
            EngineError::InvalidTransition { id, from } => {
                write!(f, "invalid transition for {id} from status {from}")
            }
            EngineError::AlreadyFinalized(id) => write!(f, "quote already finalized for event {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownSku(_) => "unknown_sku",
            EngineError::AssetNotFound(_) => "asset_not_found",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::TruckNotFound(_) => "truck_not_found",
            EngineError::TruckUnavailable { .. } => "truck_unavailable",
            EngineError::ReservationFailed(_) => "reservation_failed",
            EngineError::ConflictDetected { .. } => "conflict_detected",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyFinalized(_) => "already_finalized",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Persistence errors inside an allocation surface as `ReservationFailed`.
    pub(crate) fn into_reservation_failure(self) -> Self {
        match self {
            EngineError::WalError(e) => EngineError::ReservationFailed(e),
            other => other,
        }
    }
}
