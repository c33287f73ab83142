use ulid::Ulid;

use crate::model::*;

// ── Availability Calculator ───────────────────────────────────────

/// Derive `{total, borrowed, reserved, available}` for one tool.
///
/// - `borrowed`: every BORROWED allocation, whatever its window. A unit out
///   on loan is held until it comes back.
/// - `reserved`: non-terminal reservations overlapping `window`, or all of
///   them when no window is given. `exclude` leaves one reservation out,
///   used when that reservation is the one being fulfilled.
/// - `total`: units in the pool plus units on loan.
///
/// Pure; the caller decides whether the snapshot is locked.
pub fn availability(
    state: &ToolState,
    window: Option<&DateWindow>,
    exclude: Option<Ulid>,
) -> Availability {
    let borrowed = state.borrowed_count();
    let reserved = overlapping_reservations(state, window.copied(), exclude).count() as u32;
    let total = state.tool.quantity + borrowed;

    Availability {
        tool_id: state.tool.id,
        total,
        borrowed,
        reserved,
        available: total.saturating_sub(borrowed).saturating_sub(reserved),
    }
}

/// Capacity-holding reservations whose window overlaps `window`.
/// Reservations are sorted by start, so everything past the query end is skipped.
pub fn overlapping_reservations<'a>(
    state: &'a ToolState,
    window: Option<DateWindow>,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Reservation> + 'a {
    let right_bound = match window {
        Some(w) => state.reservations.partition_point(|r| r.window.start <= w.end),
        None => state.reservations.len(),
    };
    state.reservations[..right_bound]
        .iter()
        .filter(move |r| r.holds_capacity())
        .filter(move |r| Some(r.id) != exclude)
        .filter(move |r| window.is_none_or(|w| r.window.end >= w.start))
}

/// Free units in `window` after allocations and other reservations.
pub fn free_units(state: &ToolState, window: &DateWindow, exclude: Option<Ulid>) -> u32 {
    availability(state, Some(window), exclude).available
}
