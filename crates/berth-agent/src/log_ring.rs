//! Per-workload console log rings.
//!
//! One bounded ring per workload id, fed by the supervisor (subprocess
//! output) and the orchestrator (lifecycle narration). Appends broadcast the
//! entry on the bus; reads return a snapshot. Entries are never persisted
//! and are lost on control-plane restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use berth_workload::{ConsoleLogEntry, StreamKind, WorkloadId};
use tokio::sync::Mutex;

use crate::events::{Bus, Event};

#[derive(Debug)]
struct RingBuffer {
    capacity: usize,
    entries: VecDeque<ConsoleLogEntry>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, entry: ConsoleLogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

/// Owner of every workload's console ring. All mutation goes through this
/// type; the orchestrator and supervisor hold clones but never touch the
/// buffers directly.
#[derive(Clone)]
pub struct LogRing {
    capacity: usize,
    rings: Arc<Mutex<HashMap<WorkloadId, RingBuffer>>>,
    bus: Bus,
}

impl LogRing {
    pub fn new(capacity: usize, bus: Bus) -> Self {
        Self {
            capacity,
            rings: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Append one line and broadcast it. Creates the ring on first append.
    pub async fn append(&self, id: &WorkloadId, stream: StreamKind, message: impl Into<String>) {
        let entry = ConsoleLogEntry::now(stream, message);
        {
            let mut rings = self.rings.lock().await;
            rings
                .entry(id.clone())
                .or_insert_with(|| RingBuffer::new(self.capacity))
                .push(entry.clone());
        }
        self.bus.publish(Event::LogLine {
            id: id.clone(),
            entry,
        });
    }

    /// Snapshot of the ring contents, oldest first.
    pub async fn snapshot(&self, id: &WorkloadId) -> Vec<ConsoleLogEntry> {
        let rings = self.rings.lock().await;
        rings
            .get(id)
            .map(|r| r.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, id: &WorkloadId) {
        let mut rings = self.rings.lock().await;
        if let Some(r) = rings.get_mut(id) {
            r.entries.clear();
        }
    }

    /// Drop the ring entirely (workload deleted).
    pub async fn remove(&self, id: &WorkloadId) {
        let mut rings = self.rings.lock().await;
        rings.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> LogRing {
        LogRing::new(capacity, Bus::new(16))
    }

    #[tokio::test]
    async fn overflow_drops_oldest_entries() {
        let logs = ring(500);
        let id = WorkloadId("w1".to_string());

        for i in 0..501 {
            logs.append(&id, StreamKind::Stdout, format!("line {i}")).await;
        }

        let snap = logs.snapshot(&id).await;
        assert_eq!(snap.len(), 500);
        assert_eq!(snap.first().unwrap().message, "line 1");
        assert_eq!(snap.last().unwrap().message, "line 500");
        assert!(!snap.iter().any(|e| e.message == "line 0"));
    }

    #[tokio::test]
    async fn entries_keep_append_order() {
        let logs = ring(10);
        let id = WorkloadId("w1".to_string());

        logs.append(&id, StreamKind::System, "a").await;
        logs.append(&id, StreamKind::Stdout, "b").await;
        logs.append(&id, StreamKind::Stderr, "c").await;

        let snap = logs.snapshot(&id).await;
        let messages: Vec<&str> = snap.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["a", "b", "c"]);
        assert_eq!(snap[0].stream, StreamKind::System);
        assert_eq!(snap[2].stream, StreamKind::Stderr);
    }

    #[tokio::test]
    async fn clear_empties_but_keeps_the_ring() {
        let logs = ring(10);
        let id = WorkloadId("w1".to_string());

        logs.append(&id, StreamKind::Stdout, "a").await;
        logs.clear(&id).await;
        assert!(logs.snapshot(&id).await.is_empty());

        logs.append(&id, StreamKind::Stdout, "b").await;
        assert_eq!(logs.snapshot(&id).await.len(), 1);
    }

    #[tokio::test]
    async fn appends_are_broadcast() {
        let bus = Bus::new(16);
        let logs = LogRing::new(10, bus.clone());
        let mut rx = bus.subscribe();
        let id = WorkloadId("w1".to_string());

        logs.append(&id, StreamKind::Stdout, "hello").await;

        match rx.recv().await.unwrap() {
            Event::LogLine { id: got, entry } => {
                assert_eq!(got, id);
                assert_eq!(entry.message, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
