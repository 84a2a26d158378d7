//! Fire-and-forget progress notifications, fanned out per task.
//!
//! Each task id maps to a broadcast channel ("room"). Publishing to a room
//! with no subscribers drops the event; nothing is queued for late joiners.
//! Subscription lifetime is independent of the task lifecycle.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{LogEntry, StageName, TaskStatus};

const ROOM_CAPACITY: usize = 64;

/// Events published over the per-task notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    StageStarted {
        task_id: Uuid,
        stage: StageName,
    },
    StageCompleted {
        task_id: Uuid,
        stage: StageName,
        progress: u8,
    },
    StageFailed {
        task_id: Uuid,
        stage: StageName,
        error: String,
    },
    StatusChanged {
        task_id: Uuid,
        status: TaskStatus,
    },
    TaskCompleted {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
    },
    LogAppended {
        task_id: Uuid,
        entry: LogEntry,
    },
}

#[derive(Default)]
pub struct NotificationBridge {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<String>>>,
}

impl NotificationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the room for a task, creating it if needed. The receiver stays
    /// valid whether or not the task exists or has finished.
    pub fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<String> {
        let mut rooms = match self.rooms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rooms
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a task's room. Best-effort: no room or no
    /// subscribers means the event is dropped. Rooms left without
    /// subscribers are pruned here.
    pub fn notify(&self, task_id: Uuid, event: &TaskEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Failed to serialize task event");
                return;
            }
        };
        let mut rooms = match self.rooms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = rooms.get(&task_id) {
            if tx.receiver_count() == 0 {
                rooms.remove(&task_id);
                return;
            }
            // A send error means the last receiver dropped between the count
            // check and the send; still best-effort.
            let _ = tx.send(payload);
        }
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.lock().map(|r| r.len()).unwrap_or(0)
    }
}
