//! Per-item outcome events
//!
//! Every event is mirrored to `tracing` and broadcast to subscribers. A slow
//! or absent subscriber never blocks the pipeline: broadcast drops the oldest
//! events for lagging receivers.

use crate::state::FailureClass;
use std::time::Duration;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the oldest are dropped
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something that happened to one work item
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Fetched {
        identifier: String,
        host: String,
        attempt: u32,
        bytes: usize,
    },
    Retried {
        identifier: String,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Deferred {
        identifier: String,
        host: String,
        delay: Duration,
    },
    Persisted {
        identifier: String,
        inserted: usize,
        updated: usize,
        unchanged: usize,
        conflicts: usize,
        discovered: usize,
    },
    DeadLettered {
        identifier: String,
        class: FailureClass,
        reason: String,
    },
}

/// Fan-out point for pipeline events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::Fetched {
                identifier,
                host,
                attempt,
                bytes,
            } => {
                tracing::debug!(identifier = %identifier, host = %host, attempt, bytes, "fetched");
            }
            PipelineEvent::Retried {
                identifier,
                attempt,
                delay,
                reason,
            } => {
                tracing::info!(
                    identifier = %identifier,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "retry scheduled"
                );
            }
            PipelineEvent::Deferred {
                identifier,
                host,
                delay,
            } => {
                tracing::debug!(
                    identifier = %identifier,
                    host = %host,
                    delay_ms = delay.as_millis() as u64,
                    "host circuit open, deferring"
                );
            }
            PipelineEvent::Persisted {
                identifier,
                inserted,
                updated,
                unchanged,
                conflicts,
                discovered,
            } => {
                tracing::info!(
                    identifier = %identifier,
                    inserted,
                    updated,
                    unchanged,
                    conflicts,
                    discovered,
                    "persisted"
                );
            }
            PipelineEvent::DeadLettered {
                identifier,
                class,
                reason,
            } => {
                tracing::warn!(
                    identifier = %identifier,
                    class = %class,
                    reason = %reason,
                    "dead-lettered"
                );
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
