//! Event log for marketplace lifecycle transitions
//!
//! Keeps the most recent events in a bounded ring buffer and fans each one
//! out to subscribers over bounded channels. Delivery never blocks: a full
//! subscriber misses the event, a closed one is dropped from the list.
//!
//! Events are appended only after a store mutation has committed. They are
//! for observers (audit views, dashboards) and never gate a transition.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default ring buffer size
pub const DEFAULT_CAPACITY: usize = 200;

/// Default per-subscriber channel size
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ContractCreated,
    ContractUpdated,
    TaskCreated,
    TaskClaimed,
    WorkSubmitted,
    SubmissionReviewed,
    ProposalCreated,
    ProposalApproved,
    ProposalPublished,
    ProofUpdated,
    IngestionProcessed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ContractCreated => "contract_created",
            EventType::ContractUpdated => "contract_updated",
            EventType::TaskCreated => "task_created",
            EventType::TaskClaimed => "task_claimed",
            EventType::WorkSubmitted => "work_submitted",
            EventType::SubmissionReviewed => "submission_reviewed",
            EventType::ProposalCreated => "proposal_created",
            EventType::ProposalApproved => "proposal_approved",
            EventType::ProposalPublished => "proposal_published",
            EventType::ProofUpdated => "proof_updated",
            EventType::IngestionProcessed => "ingestion_processed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity_id: String,
    pub actor: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            entity_id: entity_id.into(),
            actor: actor.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Bounded, append-only event log with non-blocking fan-out
pub struct EventLog {
    recent: Mutex<VecDeque<Event>>,
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    subscriber_buffer: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_capacity(capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    /// Append an event and deliver it to every subscriber that has room
    pub fn record(&self, event: Event) {
        trace!(event_type = %event.event_type, entity_id = %event.entity_id, "Recording event");

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(event_type = %event.event_type, "Subscriber full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Convenience wrapper around [`EventLog::record`]
    pub fn emit(
        &self,
        event_type: EventType,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.record(Event::new(event_type, entity_id, actor, message));
    }

    /// Most recent events, newest last
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        match self.recent.lock() {
            Ok(recent) => {
                let skip = recent.len().saturating_sub(limit);
                recent.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.recent.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to events recorded from now on
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Number of subscribers still attached (closed ones are pruned lazily)
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that mirrors all events into tracing
pub fn spawn_logging_listener(events: Arc<EventLog>) -> tokio::task::JoinHandle<()> {
    let mut receiver = events.subscribe();

    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event.event_type {
                EventType::TaskClaimed | EventType::WorkSubmitted | EventType::ProposalApproved
                | EventType::ProposalPublished => {
                    debug!(
                        event_type = %event.event_type,
                        entity_id = %event.entity_id,
                        actor = %event.actor,
                        "{}",
                        event.message
                    );
                }
                _ => {
                    trace!(event = ?event, "Marketplace event");
                }
            }
        }
        debug!("Event log closed, stopping listener");
    })
}
