use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;

use super::Engine;

// ── Scheduled Activation Job ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activated {
    pub reservation_id: Ulid,
    pub allocation_id: Ulid,
    pub tool_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub reservation_id: Ulid,
    pub tool_id: Ulid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub as_of: NaiveDate,
    pub activated: Vec<Activated>,
    pub skipped: Vec<Skipped>,
}

impl Engine {
    /// UPCOMING reservations with `start <= as_of`, oldest start first.
    /// Advisory snapshot: each candidate is re-checked under its tool lock.
    pub async fn due_reservations(&self, as_of: NaiveDate) -> Vec<Reservation> {
        let mut due = Vec::new();
        for handle in self.tool_handles() {
            let state = handle.read().await;
            if state.deleted {
                continue;
            }
            due.extend(
                state
                    .reservations
                    .iter()
                    .take_while(|r| r.window.start <= as_of)
                    .filter(|r| r.status == ReservationStatus::Upcoming)
                    .cloned(),
            );
        }
        due.sort_by_key(|r| (r.window.start, r.id));
        due
    }

    /// Promote every due UPCOMING reservation into an allocation.
    ///
    /// Each reservation is its own transaction. A failure (tool in maintenance,
    /// no free unit) is recorded as skipped and the reservation stays UPCOMING;
    /// the sweep carries on. Completed reservations are never picked up again,
    /// so a second run on the same day allocates nothing new.
    pub async fn activate_due_reservations(&self, as_of: NaiveDate) -> ActivationReport {
        let actor = Actor::system();
        let mut report = ActivationReport {
            as_of,
            activated: Vec::new(),
            skipped: Vec::new(),
        };

        for reservation in self.due_reservations(as_of).await {
            let outcome = self
                .fulfil(reservation.id, &actor, &[ReservationStatus::Upcoming])
                .await;
            match outcome {
                Ok(allocation) => {
                    metrics::counter!(crate::observability::ACTIVATIONS_TOTAL, "outcome" => "activated").increment(1);
                    report.activated.push(Activated {
                        reservation_id: reservation.id,
                        allocation_id: allocation.id,
                        tool_id: allocation.tool_id,
                    });
                }
                Err(e) => {
                    metrics::counter!(crate::observability::ACTIVATIONS_TOTAL, "outcome" => "skipped").increment(1);
                    warn!(
                        reservation_id = %reservation.id,
                        tool_id = %reservation.tool_id,
                        error = %e,
                        "activation skipped"
                    );
                    report.skipped.push(Skipped {
                        reservation_id: reservation.id,
                        tool_id: reservation.tool_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        metrics::counter!(crate::observability::ACTIVATION_RUNS_TOTAL).increment(1);
        info!(
            %as_of,
            activated = report.activated.len(),
            skipped = report.skipped.len(),
            "activation sweep finished"
        );
        report
    }
}
