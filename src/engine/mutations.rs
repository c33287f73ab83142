use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::*;
use super::error::ConflictReason;
use super::{forget_entities, Engine, EngineError, WalCommand};

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_tool(
        &self,
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        quantity: u32,
        condition: ToolCondition,
        actor: &Actor,
    ) -> Result<Tool, EngineError> {
        require_admin(actor, "create tool")?;
        validate_name(&name)?;

        let _gate = self.catalog_gate.lock().await;
        if self.tools.len() >= MAX_TOOLS {
            return Err(EngineError::LimitExceeded("too many tools"));
        }
        if self.tools.contains_key(&id) {
            return Err(ConflictReason::AlreadyExists { entity: "tool", id }.into());
        }

        let event = Event::ToolCreated {
            id,
            name: name.clone(),
            category_id,
            quantity,
            condition,
        };
        self.wal_append(&event).await?;
        let tool = Tool {
            id,
            name,
            category_id,
            quantity,
            condition,
            under_maintenance: false,
        };
        self.tools.insert(id, Arc::new(RwLock::new(ToolState::new(tool.clone()))));
        self.notify.send(id, &event);
        info!(tool_id = %id, quantity, actor = %actor.name, "tool created");
        Ok(tool)
    }

    /// Rename or recategorize. Quantity belongs to the booking paths and is never touched here.
    pub async fn update_tool(
        &self,
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        condition: ToolCondition,
        actor: &Actor,
    ) -> Result<Tool, EngineError> {
        require_admin(actor, "update tool")?;
        validate_name(&name)?;
        let mut guard = self
            .lock_tool(&id)
            .await
            .ok_or(EngineError::not_found("tool", id))?;

        let event = Event::ToolUpdated {
            id,
            name,
            category_id,
            condition,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        Ok(guard.tool.clone())
    }

    pub async fn delete_tool(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        require_admin(actor, "delete tool")?;
        let _gate = self.catalog_gate.lock().await;
        let mut guard = self
            .lock_tool(&id)
            .await
            .ok_or(EngineError::not_found("tool", id))?;
        if guard.has_open_records() {
            return Err(ConflictReason::ToolInUse { tool_id: id }.into());
        }

        let event = Event::ToolDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        forget_entities(&guard, &self.entity_to_tool);
        self.tools.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(tool_id = %id, actor = %actor.name, "tool deleted");
        Ok(())
    }

    /// Maintenance collaborator hook. Pins or releases MAINTENANCE regardless of quantity.
    pub async fn set_maintenance(&self, tool_id: Ulid, on: bool, actor: &Actor) -> Result<Tool, EngineError> {
        require_admin(actor, "set maintenance")?;
        let mut guard = self
            .lock_tool(&tool_id)
            .await
            .ok_or(EngineError::not_found("tool", tool_id))?;
        if guard.tool.under_maintenance == on {
            return Ok(guard.tool.clone());
        }

        let event = Event::MaintenanceChanged {
            tool_id,
            under_maintenance: on,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        Ok(guard.tool.clone())
    }

    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        role: Role,
        department: Option<String>,
        actor: &Actor,
    ) -> Result<User, EngineError> {
        require_admin(actor, "register user")?;
        validate_name(&name)?;
        validate_department(department.as_deref())?;

        let _gate = self.catalog_gate.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(ConflictReason::AlreadyExists { entity: "user", id }.into());
        }
        // Session names resolve to users, so names are unique.
        if let Some(existing) = self.find_user_by_name(&name) {
            return Err(ConflictReason::AlreadyExists {
                entity: "user",
                id: existing.id,
            }
            .into());
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            role,
            department: department.clone(),
        };
        self.wal_append(&event).await?;
        let user = User {
            id,
            name,
            role,
            department,
        };
        self.users.insert(id, user.clone());
        info!(user_id = %id, role = role.as_str(), actor = %actor.name, "user registered");
        Ok(user)
    }

    // ── Allocations ──────────────────────────────────────────

    /// Direct borrow. Admin only; takes one unit out of the pool.
    pub async fn borrow(
        &self,
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
        actor: &Actor,
    ) -> Result<Allocation, EngineError> {
        require_admin(actor, "borrow")?;
        validate_window(&window)?;
        self.require_known_user(user_id)?;
        let mut guard = self
            .lock_tool(&tool_id)
            .await
            .ok_or_else(|| EngineError::Validation(format!("unknown tool {tool_id}")))?;
        let claim = self.claim_entity("allocation", id, tool_id)?;
        ensure_record_room(&guard)?;

        ensure_bookable(&guard.tool)?;
        check_capacity(&guard, &window, None)?;

        let event = Event::AllocationCreated {
            id,
            tool_id,
            user_id,
            window,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        claim.commit();
        guard
            .allocation(&id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", id))
    }

    /// BORROWED → RETURNED, putting the unit back in the pool.
    /// Returning twice is a no-op that hands back the already returned allocation.
    pub async fn return_allocation(&self, allocation_id: Ulid, actor: &Actor) -> Result<Allocation, EngineError> {
        require_admin(actor, "return")?;
        let mut guard = self.resolve_entity_write("allocation", &allocation_id).await?;
        let allocation = guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))?;
        if !allocation.is_outstanding() {
            debug!(allocation_id = %allocation_id, "already returned");
            return Ok(allocation);
        }

        let event = Event::AllocationReturned {
            id: allocation_id,
            tool_id: allocation.tool_id,
            returned_on: self.today(),
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))
    }

    /// Borrower flags an outstanding allocation as ready to hand back.
    pub async fn request_return(&self, allocation_id: Ulid, actor: &Actor) -> Result<Allocation, EngineError> {
        let mut guard = self.resolve_entity_write("allocation", &allocation_id).await?;
        let allocation = guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))?;
        require_acts_for(actor, allocation.user_id, "request a return")?;
        if !allocation.is_outstanding() {
            return Err(ConflictReason::AlreadyReturned { id: allocation_id }.into());
        }
        if allocation.return_requested {
            return Ok(allocation);
        }

        let event = Event::ReturnRequested {
            id: allocation_id,
            tool_id: allocation.tool_id,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))
    }

    /// Reject a pending return request; the allocation stays BORROWED.
    pub async fn decline_return(&self, allocation_id: Ulid, actor: &Actor) -> Result<Allocation, EngineError> {
        require_admin(actor, "decline return")?;
        let mut guard = self.resolve_entity_write("allocation", &allocation_id).await?;
        let allocation = guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))?;
        if !allocation.return_requested {
            return Ok(allocation);
        }

        let event = Event::ReturnDeclined {
            id: allocation_id,
            tool_id: allocation.tool_id,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))
    }

    // ── Reservations ─────────────────────────────────────────

    /// Hold a future window. Members reserve for themselves and land PENDING;
    /// admins may reserve for anyone and the reservation is pre-approved (UPCOMING).
    pub async fn reserve(
        &self,
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
        recurrence: Option<Recurrence>,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        require_acts_for(actor, user_id, "reserve")?;
        validate_window(&window)?;
        validate_not_past(&window, self.today())?;
        validate_recurrence(recurrence.as_ref(), &window)?;
        self.require_known_user(user_id)?;
        let mut guard = self
            .lock_tool(&tool_id)
            .await
            .ok_or_else(|| EngineError::Validation(format!("unknown tool {tool_id}")))?;
        let claim = self.claim_entity("reservation", id, tool_id)?;
        ensure_record_room(&guard)?;

        ensure_bookable(&guard.tool)?;
        check_capacity(&guard, &window, None)?;

        let status = if actor.is_admin() {
            ReservationStatus::Upcoming
        } else {
            ReservationStatus::Pending
        };
        let event = Event::ReservationCreated {
            id,
            tool_id,
            user_id,
            window,
            status,
            recurrence,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        claim.commit();
        guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))
    }

    /// PENDING → allocation. On conflict the reservation stays PENDING.
    pub async fn approve_reservation(&self, reservation_id: Ulid, actor: &Actor) -> Result<Allocation, EngineError> {
        require_admin(actor, "approve reservation")?;
        self.fulfil(reservation_id, actor, &[ReservationStatus::Pending])
            .await
    }

    /// Materialize a reservation into a BORROWED allocation in one event:
    /// allocation inserted, unit taken, reservation COMPLETED.
    /// Availability is re-derived under the lock with the reservation itself left out.
    pub(super) async fn fulfil(
        &self,
        reservation_id: Ulid,
        actor: &Actor,
        accepted: &[ReservationStatus],
    ) -> Result<Allocation, EngineError> {
        let mut guard = self.resolve_entity_write("reservation", &reservation_id).await?;
        let reservation = guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        ensure_fulfillable(&reservation, accepted)?;
        ensure_record_room(&guard)?;

        ensure_bookable(&guard.tool)?;
        check_capacity(&guard, &reservation.window, Some(reservation_id))?;

        let allocation_id = Ulid::new();
        let event = Event::ReservationFulfilled {
            reservation_id,
            allocation_id,
            tool_id: reservation.tool_id,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        guard
            .allocation(&allocation_id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", allocation_id))
    }

    /// PENDING → UPCOMING. The activation job picks it up once its start date arrives.
    pub async fn confirm_reservation(&self, reservation_id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        require_admin(actor, "confirm reservation")?;
        self.transition_reservation(reservation_id, ReservationStatus::Upcoming, actor, None)
            .await
    }

    /// Administrative rejection: non-terminal → CANCELLED. Capacity is released, never taken.
    pub async fn decline_reservation(&self, reservation_id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        require_admin(actor, "decline reservation")?;
        self.transition_reservation(reservation_id, ReservationStatus::Cancelled, actor, None)
            .await
    }

    /// Owner or admin withdraws a reservation.
    pub async fn cancel_reservation(&self, reservation_id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition_reservation(
            reservation_id,
            ReservationStatus::Cancelled,
            actor,
            Some("cancel reservation"),
        )
        .await
    }

    /// Status-only transition. `owner_check` names the operation when the owner may act too.
    async fn transition_reservation(
        &self,
        reservation_id: Ulid,
        next: ReservationStatus,
        actor: &Actor,
        owner_check: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write("reservation", &reservation_id).await?;
        let reservation = guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        if let Some(operation) = owner_check {
            require_acts_for(actor, reservation.user_id, operation)?;
        }
        ensure_transition(&reservation, next)?;

        let event = Event::ReservationStatusChanged {
            id: reservation_id,
            tool_id: reservation.tool_id,
            status: next,
        };
        self.persist_and_apply(&mut guard, event, actor).await?;
        guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", reservation_id))
    }

    fn require_known_user(&self, user_id: Ulid) -> Result<(), EngineError> {
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::Validation(format!("unknown user {user_id}")));
        }
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the catalog gate and a read guard on every tool (taken in id order)
    /// until the compacted file is swapped in, so no commit can slip between
    /// snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.catalog_gate.lock().await;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserRegistered {
                id: u.id,
                name: u.name.clone(),
                role: u.role,
                department: u.department.clone(),
            })
            .collect();

        let mut tool_ids: Vec<Ulid> = self.tools.iter().map(|e| *e.key()).collect();
        tool_ids.sort();
        let mut guards = Vec::with_capacity(tool_ids.len());
        for id in &tool_ids {
            if let Some(handle) = self.tool_handle(id) {
                guards.push(handle.read_owned().await);
            }
        }

        for state in guards.iter().filter(|g| !g.deleted) {
            let tool = &state.tool;
            events.push(Event::ToolCreated {
                id: tool.id,
                name: tool.name.clone(),
                category_id: tool.category_id,
                quantity: tool.quantity,
                condition: tool.condition,
            });
            if tool.under_maintenance {
                events.push(Event::MaintenanceChanged {
                    tool_id: tool.id,
                    under_maintenance: true,
                });
            }
            events.extend(state.allocations.iter().cloned().map(Event::AllocationRestored));
            events.extend(state.reservations.iter().cloned().map(Event::ReservationRestored));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, tools = tool_ids.len(), "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
