use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Where an invocation's worker is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Spawning,
    ChannelOpen,
    AwaitingExit,
    Settled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: Uuid,
    pub step: String,
    pub trace_id: String,
    pub phase: WorkerPhase,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Live worker handles keyed by invocation id.
#[derive(Clone, Default)]
pub struct WorkerArena {
    workers: Arc<Mutex<HashMap<Uuid, WorkerRecord>>>,
}

impl WorkerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new invocation. The entry lives exactly as long as the returned guard.
    pub fn admit(&self, step: impl Into<String>, trace_id: impl Into<String>) -> WorkerGuard {
        let id = Uuid::new_v4();
        let record = WorkerRecord {
            id,
            step: step.into(),
            trace_id: trace_id.into(),
            phase: WorkerPhase::Spawning,
            pid: None,
            started_at: Utc::now(),
        };
        self.workers.lock().insert(id, record);
        WorkerGuard {
            id,
            arena: self.clone(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<WorkerRecord> {
        self.workers.lock().get(id).cloned()
    }

    /// Live workers, oldest first.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.workers.lock().values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn update(&self, id: &Uuid, f: impl FnOnce(&mut WorkerRecord)) {
        if let Some(record) = self.workers.lock().get_mut(id) {
            f(record);
        }
    }
}

/// Removes its arena entry on drop, whichever way the invocation ends.
pub struct WorkerGuard {
    id: Uuid,
    arena: WorkerArena,
}

impl WorkerGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn advance(&self, phase: WorkerPhase) {
        tracing::trace!(worker = %self.id, ?phase, "worker phase");
        self.arena.update(&self.id, |r| r.phase = phase);
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.arena.update(&self.id, |r| r.pid = pid);
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.arena.workers.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_phases_and_cleans_up() {
        let arena = WorkerArena::new();
        let guard = arena.admit("steps/a.py", "t1");
        guard.advance(WorkerPhase::AwaitingExit);

        let snapshot = arena.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].phase, WorkerPhase::AwaitingExit);
        assert_eq!(snapshot[0].trace_id, "t1");

        drop(guard);
        assert_eq!(arena.active_count(), 0);
    }
}
