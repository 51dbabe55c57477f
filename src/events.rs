use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::cache::CacheStatistics;

/// Status messages from the resolution worker to whatever presents them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Stage {
        message: String,
    },
    DuplicatesRemoved {
        count: usize,
    },
    ReferencesIndexed {
        resolved: usize,
        total: usize,
    },
    Progress {
        processed: usize,
        total: usize,
        matched: usize,
    },
    CheckpointSaved {
        entries: usize,
    },
    PersistFailed {
        reason: String,
    },
    CacheStatus {
        statistics: CacheStatistics,
    },
    Cancelled {
        processed: usize,
    },
}

/// Fire-and-forget sender. Emitting never blocks and a dropped receiver is ignored.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn stage(&self, message: impl Into<String>) {
        self.emit(RunEvent::Stage {
            message: message.into(),
        });
    }
}
