use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_units;
use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn validate_window(window: &DateWindow) -> Result<(), EngineError> {
    if window.end < window.start {
        return Err(EngineError::Validation(format!(
            "window {window} ends before it starts"
        )));
    }
    if window.days() > MAX_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Reservations are for today or later.
pub(crate) fn validate_not_past(window: &DateWindow, today: NaiveDate) -> Result<(), EngineError> {
    if window.start < today {
        return Err(EngineError::Validation(format!(
            "window {window} starts before today ({today})"
        )));
    }
    Ok(())
}

pub(crate) fn validate_recurrence(
    recurrence: Option<&Recurrence>,
    window: &DateWindow,
) -> Result<(), EngineError> {
    let Some(r) = recurrence else { return Ok(()) };
    if r.interval == 0 || r.interval > MAX_RECURRENCE_INTERVAL {
        return Err(EngineError::Validation(format!(
            "recurrence interval must be between 1 and {MAX_RECURRENCE_INTERVAL}"
        )));
    }
    if let Some(until) = r.until
        && until < window.end
    {
        return Err(EngineError::Validation(format!(
            "recurrence ends {until}, before the first occurrence ends"
        )));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn require_admin(actor: &Actor, operation: &str) -> Result<(), EngineError> {
    if !actor.is_admin() {
        return Err(EngineError::Unauthorized(format!(
            "{operation} requires the admin role ({} is a {})",
            actor.name,
            actor.role.as_str()
        )));
    }
    Ok(())
}

pub(crate) fn require_acts_for(actor: &Actor, user_id: Ulid, operation: &str) -> Result<(), EngineError> {
    if !actor.acts_for(user_id) {
        return Err(EngineError::Unauthorized(format!(
            "{} may not {operation} on behalf of user {user_id}",
            actor.name
        )));
    }
    Ok(())
}

/// The tool must be AVAILABLE with at least one unit in the pool.
pub(crate) fn ensure_bookable(tool: &Tool) -> Result<(), EngineError> {
    if !tool.is_bookable() {
        return Err(ConflictReason::ToolUnavailable {
            tool_id: tool.id,
            status: tool.status(),
            quantity: tool.quantity,
        }
        .into());
    }
    Ok(())
}

/// Recompute availability for `window` under the caller's lock and require a free unit.
pub(crate) fn check_capacity(
    state: &ToolState,
    window: &DateWindow,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let available = free_units(state, window, exclude);
    if available < 1 {
        return Err(ConflictReason::NoCapacity {
            tool_id: state.tool.id,
            available,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn ensure_transition(
    reservation: &Reservation,
    next: ReservationStatus,
) -> Result<(), EngineError> {
    if reservation.status.is_terminal() {
        return Err(ConflictReason::AlreadyResolved {
            id: reservation.id,
            status: reservation.status,
        }
        .into());
    }
    if !reservation.status.can_transition_to(next) {
        return Err(ConflictReason::InvalidTransition {
            id: reservation.id,
            from: reservation.status,
            to: next,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn ensure_record_room(state: &ToolState) -> Result<(), EngineError> {
    if state.record_count() >= MAX_RECORDS_PER_TOOL {
        return Err(EngineError::LimitExceeded("too many records on tool"));
    }
    Ok(())
}

/// The reservation must be in one of `accepted` and able to walk its fulfilment path to COMPLETED.
pub(crate) fn ensure_fulfillable(
    reservation: &Reservation,
    accepted: &[ReservationStatus],
) -> Result<(), EngineError> {
    if reservation.status.is_terminal() {
        return Err(ConflictReason::AlreadyResolved {
            id: reservation.id,
            status: reservation.status,
        }
        .into());
    }
    let path = reservation.status.fulfilment_path();
    if !accepted.contains(&reservation.status) || path.is_empty() {
        return Err(ConflictReason::InvalidTransition {
            id: reservation.id,
            from: reservation.status,
            to: ReservationStatus::Completed,
        }
        .into());
    }
    let mut current = reservation.status;
    for &next in path {
        if !current.can_transition_to(next) {
            return Err(ConflictReason::InvalidTransition {
                id: reservation.id,
                from: current,
                to: next,
            }
            .into());
        }
        current = next;
    }
    Ok(())
}

pub(crate) fn validate_department(department: Option<&str>) -> Result<(), EngineError> {
    if department.is_some_and(|d| d.len() > MAX_DEPARTMENT_LEN) {
        return Err(EngineError::LimitExceeded("department too long"));
    }
    Ok(())
}
