use std::{path::PathBuf, time::Duration};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::Stage;

/// Progress and audit notifications emitted while a run is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StageStarted {
        run_id: Uuid,
        stage: Stage,
    },
    StageReused {
        run_id: Uuid,
        stage: Stage,
        path: PathBuf,
    },
    StageCompleted {
        run_id: Uuid,
        stage: Stage,
        path: PathBuf,
    },
    StageFailed {
        run_id: Uuid,
        stage: Stage,
        message: String,
    },
    BackendSkipped {
        pass: u32,
        position: usize,
        backend: String,
        reason: String,
    },
    BackendRetrying {
        pass: u32,
        backend: String,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    BackendFailed {
        pass: u32,
        position: Option<usize>,
        backend: String,
        reason: String,
    },
    FallbackActivated {
        pass: u32,
        backend: String,
        reason: String,
    },
    PassCompleted {
        pass: u32,
        backend: String,
    },
    PassFailed {
        pass: u32,
        reason: String,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::StageStarted { .. } => "stage.started",
            Event::StageReused { .. } => "stage.reused",
            Event::StageCompleted { .. } => "stage.completed",
            Event::StageFailed { .. } => "stage.failed",
            Event::BackendSkipped { .. } => "backend.skipped",
            Event::BackendRetrying { .. } => "backend.retrying",
            Event::BackendFailed { .. } => "backend.failed",
            Event::FallbackActivated { .. } => "backend.fallback_activated",
            Event::PassCompleted { .. } => "pass.completed",
            Event::PassFailed { .. } => "pass.failed",
        }
    }
}

/// Fire-and-forget publisher. A sink without a subscriber, or whose
/// subscriber went away, silently drops events.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn publish(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscriber_is_a_no_op() {
        let sink = EventSink::default();
        sink.publish(Event::PassFailed {
            pass: 2,
            reason: "boom".into(),
        });
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.publish(Event::PassCompleted {
            pass: 1,
            backend: "a".into(),
        });
        sink.publish(Event::PassCompleted {
            pass: 2,
            backend: "b".into(),
        });
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "pass.completed");
        assert!(matches!(rx.recv().await, Some(Event::PassCompleted { pass: 2, .. })));
        assert!(rx.recv().await.is_none());
    }
}
