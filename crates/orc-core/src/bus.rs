//! Event bus (§4.8): appends structured events to the per-project
//! document and fans each one out, out-of-band, to in-process stream
//! subscribers. Bridging the broadcast channel onto an actual WebSocket
//! is the external HTTP layer's job (§6 "Change stream").

use orc_store::models::{Event, EventLevel};
use tokio::sync::broadcast;

/// Envelope pushed to subscribers, mirroring §6's `{type, task?|event?|worker?, project_id?}`
/// wire shape without committing to a concrete transport.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event { project_id: String, event: Event },
    TaskUpdated { project_id: String, task_id: String },
    WorkerUpdated { worker_id: String },
}

/// In-process fan-out. Connection loss on the subscriber side (a dropped
/// receiver) silently drops that subscriber — `broadcast::Sender::send`
/// only errors when there are zero receivers, which this bus treats as a
/// no-op rather than a failure.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    fn publish(&self, msg: BusMessage) {
        let _ = self.tx.send(msg);
    }

    /// Build an event, append it to the in-memory document mutation the
    /// caller is already holding (it is the caller's job to push the
    /// mutated document through the store), and publish it to
    /// subscribers. Returns the constructed event so callers can also
    /// append a matching timeline entry.
    pub fn emit(
        &self,
        doc: &mut orc_store::models::ProjectDocument,
        project_id: &str,
        event_type: &str,
        level: EventLevel,
        task_id: Option<&str>,
        worker_id: Option<&str>,
        message: impl Into<String>,
        meta: serde_json::Value,
    ) -> Event {
        let mut event = Event::new(event_type, level, message).with_meta(meta);
        if let Some(t) = task_id {
            event = event.with_task(t);
        }
        if let Some(w) = worker_id {
            event = event.with_worker(w);
        }
        doc.events.push(event.clone());
        self.publish(BusMessage::Event {
            project_id: project_id.to_string(),
            event: event.clone(),
        });
        event
    }

    pub fn task_updated(&self, project_id: &str, task_id: &str) {
        self.publish(BusMessage::TaskUpdated {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
        });
    }

    pub fn worker_updated(&self, worker_id: &str) {
        self.publish(BusMessage::WorkerUpdated {
            worker_id: worker_id.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_appends_to_document_and_publishes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut doc = orc_store::models::ProjectDocument::default();
        bus.emit(
            &mut doc,
            "proj-1",
            "task_dispatched",
            EventLevel::Info,
            Some("task-1"),
            Some("worker-0"),
            "dispatched",
            serde_json::Value::Null,
        );
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].event_type, "task_dispatched");

        let msg = rx.try_recv().unwrap();
        match msg {
            BusMessage::Event { project_id, event } => {
                assert_eq!(project_id, "proj-1");
                assert_eq!(event.task_id.as_deref(), Some("task-1"));
            }
            _ => panic!("wrong message variant"),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        let mut doc = orc_store::models::ProjectDocument::default();
        bus.emit(
            &mut doc,
            "proj-1",
            "alert_triggered",
            EventLevel::Critical,
            None,
            None,
            "no idle workers",
            serde_json::Value::Null,
        );
        assert_eq!(doc.events.len(), 1);
    }
}
