use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::types::{SentenceLabel, TrainingProgress};

/// Something a controller wants the surrounding session to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    LiveInferenceApplied {
        sequence: u64,
    },
    LiveInferenceFailed {
        sequence: u64,
        reason: String,
    },
    LabelConfirmed {
        item_id: String,
        label: SentenceLabel,
    },
    /// `rolled_back` is false when a newer decision had already replaced the failed one.
    LabelSubmitFailed {
        item_id: String,
        label: SentenceLabel,
        rolled_back: bool,
        reason: String,
    },
    BatchCompleted {
        job_id: Uuid,
        rows: usize,
        failed: usize,
    },
    BatchFailed {
        job_id: Uuid,
        reason: String,
    },
    TrainingProgressed(TrainingProgress),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub occurred_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

/// Cloneable producer half handed to each controller.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<EventRecord>,
}

impl EventSender {
    pub fn emit(&self, event: WorkflowEvent) {
        let record = EventRecord {
            occurred_at: Utc::now(),
            event,
        };
        if let Err(e) = self.sender.send(record) {
            debug!("No event listener, dropping {:?}", e.0.event);
        }
    }
}

pub struct EventBus {
    sender: mpsc::UnboundedSender<EventRecord>,
    receiver: Arc<RwLock<mpsc::UnboundedReceiver<EventRecord>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(RwLock::new(receiver)),
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Get the next event if one is already queued
    pub async fn next_event(&self) -> Option<EventRecord> {
        let mut receiver = self.receiver.write().await;
        receiver.try_recv().ok()
    }

    /// Take everything queued so far
    pub async fn drain(&self) -> Vec<WorkflowEvent> {
        let mut receiver = self.receiver.write().await;
        let mut events = Vec::new();
        while let Ok(record) = receiver.try_recv() {
            events.push(record.event);
        }
        events
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
