use ulid::Ulid;

use crate::model::{ReservationStatus, ToolStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

/// Why a capacity or state check rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictReason {
    #[error("tool {tool_id} is not available (status {status}, {quantity} in pool)")]
    ToolUnavailable {
        tool_id: Ulid,
        status: ToolStatus,
        quantity: u32,
    },

    #[error("no free unit of tool {tool_id} in the requested window ({available} available)")]
    NoCapacity { tool_id: Ulid, available: u32 },

    #[error("reservation {id} already resolved ({status})")]
    AlreadyResolved { id: Ulid, status: ReservationStatus },

    #[error("reservation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("allocation {id} is already returned")]
    AlreadyReturned { id: Ulid },

    #[error("tool {tool_id} still has open allocations or reservations")]
    ToolInUse { tool_id: Ulid },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: Ulid },
}

impl ConflictReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::ToolUnavailable { .. } => "tool_unavailable",
            ConflictReason::NoCapacity { .. } => "no_capacity",
            ConflictReason::AlreadyResolved { .. } => "already_resolved",
            ConflictReason::InvalidTransition { .. } => "invalid_transition",
            ConflictReason::AlreadyReturned { .. } => "already_returned",
            ConflictReason::ToolInUse { .. } => "tool_in_use",
            ConflictReason::AlreadyExists { .. } => "already_exists",
        }
    }
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<ConflictReason> for EngineError {
    fn from(reason: ConflictReason) -> Self {
        EngineError::Conflict(reason)
    }
}
