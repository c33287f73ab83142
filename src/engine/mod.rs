mod activation;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use activation::{Activated, ActivationReport, Skipped};
pub use availability::{availability, free_units, overlapping_reservations};
pub use error::{ConflictReason, EngineError};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedToolState = Arc<RwLock<ToolState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. One flush_sync for the whole batch.
/// 5. Answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) tools: DashMap<Ulid, SharedToolState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Reverse lookup: allocation/reservation id → tool id.
    pub(super) entity_to_tool: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    /// Serializes catalog writes (tools, users) with compaction. Taken before any tool lock.
    pub(super) catalog_gate: Mutex<()>,
}

/// Apply an event to one tool's state. Caller holds the write lock.
/// Catalog-level events (create/delete tool, register user) are handled by the engine.
fn apply_to_tool(state: &mut ToolState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ToolUpdated {
            name,
            category_id,
            condition,
            ..
        } => {
            state.tool.name = name.clone();
            state.tool.category_id = *category_id;
            state.tool.condition = *condition;
        }
        Event::MaintenanceChanged { under_maintenance, .. } => {
            state.tool.under_maintenance = *under_maintenance;
        }
        Event::AllocationCreated {
            id,
            tool_id,
            user_id,
            window,
        } => {
            state.insert_allocation(Allocation::borrowed(*id, *tool_id, *user_id, *window, None));
            state.tool.quantity = state.tool.quantity.saturating_sub(1);
            entity_map.insert(*id, *tool_id);
        }
        Event::AllocationReturned { id, returned_on, .. } => {
            if let Some(a) = state.allocation_mut(id)
                && a.mark_returned(*returned_on)
            {
                state.tool.quantity += 1;
            }
        }
        Event::ReturnRequested { id, .. } => {
            if let Some(a) = state.allocation_mut(id) {
                a.return_requested = a.is_outstanding();
            }
        }
        Event::ReturnDeclined { id, .. } => {
            if let Some(a) = state.allocation_mut(id) {
                a.return_requested = false;
            }
        }
        Event::ReservationCreated {
            id,
            tool_id,
            user_id,
            window,
            status,
            recurrence,
        } => {
            state.insert_reservation(Reservation {
                id: *id,
                tool_id: *tool_id,
                user_id: *user_id,
                window: *window,
                status: *status,
                recurrence: recurrence.clone(),
                allocation_id: None,
            });
            entity_map.insert(*id, *tool_id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = state.reservation_mut(id) {
                r.status = *status;
            }
        }
        Event::ReservationFulfilled {
            reservation_id,
            allocation_id,
            tool_id,
        } => {
            let Some(r) = state.reservation_mut(reservation_id) else {
                return;
            };
            r.status = ReservationStatus::Completed;
            r.allocation_id = Some(*allocation_id);
            let allocation = Allocation::borrowed(*allocation_id, *tool_id, r.user_id, r.window, Some(*reservation_id));
            state.insert_allocation(allocation);
            state.tool.quantity = state.tool.quantity.saturating_sub(1);
            entity_map.insert(*allocation_id, *tool_id);
        }
        Event::AllocationRestored(a) => {
            entity_map.insert(a.id, a.tool_id);
            state.insert_allocation(a.clone());
        }
        Event::ReservationRestored(r) => {
            entity_map.insert(r.id, r.tool_id);
            state.insert_reservation(r.clone());
        }
        Event::ToolCreated { .. } | Event::ToolDeleted { .. } | Event::UserRegistered { .. } => {}
    }
}

fn tool_from_event(event: &Event) -> Option<Tool> {
    match event {
        Event::ToolCreated {
            id,
            name,
            category_id,
            quantity,
            condition,
        } => Some(Tool {
            id: *id,
            name: name.clone(),
            category_id: *category_id,
            quantity: *quantity,
            condition: *condition,
            under_maintenance: false,
        }),
        _ => None,
    }
}

fn user_from_event(event: &Event) -> Option<User> {
    match event {
        Event::UserRegistered {
            id,
            name,
            role,
            department,
        } => Some(User {
            id: *id,
            name: name.clone(),
            role: *role,
            department: department.clone(),
        }),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_tool = DashMap::new();
        let users = DashMap::new();

        // Replay into plain maps; nothing is shared yet, so no locks.
        let mut states: HashMap<Ulid, ToolState> = HashMap::new();
        for event in &events {
            match event {
                Event::ToolCreated { id, .. } => {
                    if let Some(tool) = tool_from_event(event) {
                        states.insert(*id, ToolState::new(tool));
                    }
                }
                Event::ToolDeleted { id } => {
                    if let Some(state) = states.remove(id) {
                        forget_entities(&state, &entity_to_tool);
                    }
                }
                Event::UserRegistered { id, .. } => {
                    if let Some(user) = user_from_event(event) {
                        users.insert(*id, user);
                    }
                }
                other => {
                    if let Some(tool_id) = other.tool_id()
                        && let Some(state) = states.get_mut(&tool_id)
                    {
                        apply_to_tool(state, other, &entity_to_tool);
                    }
                }
            }
        }

        let tools = DashMap::with_capacity(states.len());
        for (id, state) in states {
            tools.insert(id, Arc::new(RwLock::new(state)));
        }
        tracing::info!(
            events = events.len(),
            tools = tools.len(),
            users = users.len(),
            path = %wal_path.display(),
            "WAL replayed"
        );

        Ok(Self {
            tools,
            users,
            entity_to_tool,
            wal_tx,
            notify,
            clock,
            catalog_gate: Mutex::new(()),
        })
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn tool_handle(&self, id: &Ulid) -> Option<SharedToolState> {
        self.tools.get(id).map(|e| e.value().clone())
    }

    /// Claim a new allocation/reservation id for `tool_id`, or `AlreadyExists`.
    pub(super) fn claim_entity(
        &self,
        entity: &'static str,
        id: Ulid,
        tool_id: Ulid,
    ) -> Result<EntityClaim<'_>, EngineError> {
        EntityClaim::take(&self.entity_to_tool, id, tool_id)
            .ok_or_else(|| ConflictReason::AlreadyExists { entity, id }.into())
    }

    pub fn tool_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_tool.get(entity_id).map(|e| *e.value())
    }

    /// Exclusive row lock on a live tool. `None` if unknown or deleted meanwhile.
    pub(super) async fn lock_tool(&self, id: &Ulid) -> Option<OwnedRwLockWriteGuard<ToolState>> {
        let handle = self.tool_handle(id)?;
        let guard = handle.write_owned().await;
        (!guard.deleted).then_some(guard)
    }

    pub(super) async fn read_tool(&self, id: &Ulid) -> Option<OwnedRwLockReadGuard<ToolState>> {
        let handle = self.tool_handle(id)?;
        let guard = handle.read_owned().await;
        (!guard.deleted).then_some(guard)
    }

    /// Lookup entity → tool, then take that tool's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity: &'static str,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ToolState>, EngineError> {
        let tool_id = self
            .tool_for_entity(entity_id)
            .ok_or(EngineError::not_found(entity, *entity_id))?;
        self.lock_tool(&tool_id)
            .await
            .ok_or(EngineError::not_found(entity, *entity_id))
    }

    /// WAL-append, apply, notify. Emits a status change when the event moved `Tool::status()`.
    /// Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut ToolState,
        event: Event,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let before = state.tool.status();
        self.wal_append(&event).await?;
        apply_to_tool(state, &event, &self.entity_to_tool);
        let after = state.tool.status();

        let tool_id = state.tool.id;
        metrics::counter!(crate::observability::EVENTS_COMMITTED_TOTAL, "kind" => event.kind()).increment(1);
        tracing::info!(
            kind = event.kind(),
            tool_id = %tool_id,
            actor = %actor.name,
            quantity = state.tool.quantity,
            "committed"
        );
        self.notify.send(tool_id, &event);

        if before != after {
            metrics::counter!(
                crate::observability::STATUS_CHANGES_TOTAL,
                "from" => before.as_str(),
                "to" => after.as_str()
            )
            .increment(1);
            self.notify.status_changed(StatusChange {
                tool_id,
                old: before,
                new: after,
                changed_by: actor.name.clone(),
                changed_at: self.clock.now(),
            });
        }
        Ok(())
    }
}

/// An allocation or reservation id held in the reverse index before its event commits.
/// Dropped uncommitted, the id is released again.
pub(super) struct EntityClaim<'a> {
    map: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl<'a> EntityClaim<'a> {
    /// Insert `id → tool_id` unless the id is taken. Ids are global across tools.
    fn take(map: &'a DashMap<Ulid, Ulid>, id: Ulid, tool_id: Ulid) -> Option<Self> {
        match map.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(tool_id);
                Some(Self {
                    map,
                    id,
                    committed: false,
                })
            }
        }
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for EntityClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.map.remove(&self.id);
        }
    }
}

fn forget_entities(state: &ToolState, entity_map: &DashMap<Ulid, Ulid>) {
    for a in &state.allocations {
        entity_map.remove(&a.id);
    }
    for r in &state.reservations {
        entity_map.remove(&r.id);
    }
}
