use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::model::{Event, StatusChange};

const CHANNEL_CAPACITY: usize = 256;

/// Best-effort fan-out of committed events. Sends never block and never fail a commit;
/// slow receivers lag and lose messages.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    status_changes: broadcast::Sender<StatusChange>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            status_changes: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to committed events for a tool. Creates the channel if needed.
    pub fn subscribe(&self, tool_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(tool_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, tool_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&tool_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, tool_id: &Ulid) {
        self.channels.remove(tool_id);
    }

    /// Feed of tool status transitions across every tool.
    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.status_changes.subscribe()
    }

    pub fn status_changed(&self, change: StatusChange) {
        let _ = self.status_changes.send(change);
    }
}

/// Activity-log consumer: writes every status change to the `toolsync::audit` target
/// until cancelled or the hub goes away.
pub async fn run_audit_log(mut rx: broadcast::Receiver<StatusChange>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(change) => {
                    tracing::info!(
                        target: "toolsync::audit",
                        tool_id = %change.tool_id,
                        old = change.old.as_str(),
                        new = change.new.as_str(),
                        changed_by = %change.changed_by,
                        changed_at = %change.changed_at,
                        "tool status changed"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(target: "toolsync::audit", missed, "audit log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
