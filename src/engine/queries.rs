use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::availability;
use super::{Engine, EngineError, SharedToolState};

impl Engine {
    /// Handles for every live tool, in id order.
    pub(super) fn tool_handles(&self) -> Vec<SharedToolState> {
        let mut entries: Vec<(Ulid, SharedToolState)> = self
            .tools
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Display-grade availability. Write paths never trust this; they recompute under the lock.
    pub async fn get_availability(
        &self,
        tool_id: Ulid,
        window: Option<DateWindow>,
    ) -> Result<Availability, EngineError> {
        if let Some(w) = &window {
            if w.end < w.start {
                return Err(EngineError::Validation(format!("window {w} ends before it starts")));
            }
            if w.days() > MAX_QUERY_WINDOW_DAYS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        let state = self
            .read_tool(&tool_id)
            .await
            .ok_or(EngineError::not_found("tool", tool_id))?;
        Ok(availability(&state, window.as_ref(), None))
    }

    pub async fn get_tool(&self, id: Ulid) -> Result<Tool, EngineError> {
        let state = self
            .read_tool(&id)
            .await
            .ok_or(EngineError::not_found("tool", id))?;
        Ok(state.tool.clone())
    }

    pub async fn list_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::with_capacity(self.tools.len());
        for handle in self.tool_handles() {
            let state = handle.read().await;
            if !state.deleted {
                tools.push(state.tool.clone());
            }
        }
        tools
    }

    pub async fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let state = self.read_entity_tool("allocation", id).await?;
        state
            .allocation(&id)
            .cloned()
            .ok_or(EngineError::not_found("allocation", id))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let state = self.read_entity_tool("reservation", id).await?;
        state
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))
    }

    /// Allocations for one tool, or for every tool when `tool_id` is `None`.
    pub async fn allocations(&self, tool_id: Option<Ulid>) -> Result<Vec<Allocation>, EngineError> {
        let mut out = Vec::new();
        for handle in self.scoped_handles(tool_id)? {
            let state = handle.read().await;
            if !state.deleted {
                out.extend(state.allocations.iter().cloned());
            }
        }
        Ok(out)
    }

    /// Reservations for one tool, or for every tool when `tool_id` is `None`.
    pub async fn reservations(&self, tool_id: Option<Ulid>) -> Result<Vec<Reservation>, EngineError> {
        let mut out = Vec::new();
        for handle in self.scoped_handles(tool_id)? {
            let state = handle.read().await;
            if !state.deleted {
                out.extend(state.reservations.iter().cloned());
            }
        }
        Ok(out)
    }

    /// BORROWED allocations whose expected return date is before `as_of`, most overdue first.
    pub async fn overdue_allocations(&self, as_of: NaiveDate) -> Vec<Allocation> {
        let mut out = Vec::new();
        for handle in self.tool_handles() {
            let state = handle.read().await;
            if state.deleted {
                continue;
            }
            out.extend(state.allocations.iter().filter(|a| a.is_overdue(as_of)).cloned());
        }
        out.sort_by_key(|a| (a.window.end, a.id));
        out
    }

    /// Counts across the whole catalog. Each tool is read under its own lock;
    /// the totals are not a single atomic snapshot.
    pub async fn dashboard(&self, as_of: NaiveDate) -> DashboardSummary {
        let mut summary = DashboardSummary::default();
        for handle in self.tool_handles() {
            let state = handle.read().await;
            if state.deleted {
                continue;
            }
            let a = availability(&state, None, None);
            summary.tools += 1;
            summary.units_total += u64::from(a.total);
            summary.units_available += u64::from(a.available);
            if state.tool.under_maintenance {
                summary.tools_in_maintenance += 1;
            }
            for allocation in state.allocations.iter().filter(|a| a.is_outstanding()) {
                summary.active_allocations += 1;
                if allocation.is_overdue(as_of) {
                    summary.overdue_allocations += 1;
                }
            }
            for r in &state.reservations {
                match r.status {
                    ReservationStatus::Pending => summary.pending_reservations += 1,
                    ReservationStatus::Upcoming => summary.upcoming_reservations += 1,
                    _ => {}
                }
            }
        }
        summary
    }

    // ── Users ────────────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::not_found("user", id))
    }

    pub fn find_user_by_name(&self, name: &str) -> Option<User> {
        self.users
            .iter()
            .find(|u| u.name == name)
            .map(|u| u.value().clone())
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Map a session name to an actor. Registered users carry their role;
    /// names in `admins` are admins even when unregistered; anyone else is a member
    /// without a user id, able to read but not to act for any user.
    pub fn resolve_actor(&self, name: &str, admins: &[String]) -> Actor {
        let listed_admin = admins.iter().any(|a| a == name);
        match self.find_user_by_name(name) {
            Some(user) => {
                let mut actor = Actor::for_user(&user);
                if listed_admin {
                    actor.role = Role::Admin;
                }
                actor
            }
            None => Actor {
                user_id: None,
                name: name.to_string(),
                role: if listed_admin { Role::Admin } else { Role::Member },
            },
        }
    }

    async fn read_entity_tool(
        &self,
        entity: &'static str,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<ToolState>, EngineError> {
        let tool_id = self
            .tool_for_entity(&id)
            .ok_or(EngineError::not_found(entity, id))?;
        self.read_tool(&tool_id)
            .await
            .ok_or(EngineError::not_found(entity, id))
    }

    fn scoped_handles(&self, tool_id: Option<Ulid>) -> Result<Vec<SharedToolState>, EngineError> {
        match tool_id {
            Some(id) => self
                .tool_handle(&id)
                .map(|h| vec![h])
                .ok_or(EngineError::not_found("tool", id)),
            None => Ok(self.tool_handles()),
        }
    }
}
