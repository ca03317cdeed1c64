//! Notification sink: a broadcast bus carrying status-change and log-line
//! events to whoever is subscribed (the WebSocket fan-out in the transport
//! layer, tests, nobody at all). Delivery is fire-and-forget; a missing or
//! lagging subscriber simply misses events.

use berth_workload::{ConsoleLogEntry, WorkloadId, WorkloadStatus};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        id: WorkloadId,
        status: WorkloadStatus,
    },
    LogLine {
        id: WorkloadId,
        entry: ConsoleLogEntry,
    },
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. A send error only means there is
    /// no subscriber, which is fine.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_workload::StreamKind;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(Event::StatusChanged {
            id: WorkloadId("w1".to_string()),
            status: WorkloadStatus::Running,
        });
        bus.publish(Event::LogLine {
            id: WorkloadId("w1".to_string()),
            entry: ConsoleLogEntry::now(StreamKind::System, "hello"),
        });

        match rx.recv().await.unwrap() {
            Event::StatusChanged { status, .. } => assert_eq!(status, WorkloadStatus::Running),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::LogLine { entry, .. } => assert_eq!(entry.message, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = Bus::new(8);
        bus.publish(Event::StatusChanged {
            id: WorkloadId("w1".to_string()),
            status: WorkloadStatus::Stopped,
        });
    }
}
