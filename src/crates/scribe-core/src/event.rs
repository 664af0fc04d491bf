//! Append-only event log with fan-out subscription.
//!
//! Every lifecycle event of a run flows through one [`EventBus`]. Events
//! get a contiguous sequence number assigned under the log lock, so the
//! stream is a total order consistent with the graph's causal order: an
//! effect is always recorded after the event that produced it.
//!
//! Subscribers may join mid-run and request replay from any sequence
//! number; the replayed prefix is spliced with the live broadcast feed and
//! deduplicated by sequence number, so the splice point never repeats or
//! skips an event. Delivery never blocks the producer: a subscriber that
//! falls behind the broadcast buffer receives a terminal
//! [`SubscriberItem::Lagged`] marker and is expected to re-subscribe with
//! replay.

use crate::node::{ActionName, NodeKind, NodeStatus, TaskType};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Identifier of a run, unique per process lifetime.
pub type RunId = String;

/// Token accounting reported by LLM-backed capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFinishReason {
    Success,
    Error,
    Cancelled,
}

/// Terminal state of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolCallState {
    Success,
    Error,
}

/// Typed payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        goal: String,
        mode: String,
    },
    RunFinished {
        reason: RunFinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failing_node_nid: Option<String>,
    },
    StepStarted {
        nid: String,
        action: ActionName,
    },
    StepFinished {
        nid: String,
        action: ActionName,
        status: NodeStatus,
    },
    NodeCreated {
        nid: String,
        kind: NodeKind,
        task_type: TaskType,
        goal: String,
    },
    NodeAdded {
        parent_nid: String,
        nid: String,
    },
    EdgeAdded {
        from_nid: String,
        to_nid: String,
    },
    InnerGraphBuilt {
        nid: String,
        nodes: usize,
        edges: usize,
    },
    NodeStatusChanged {
        nid: String,
        old: NodeStatus,
        new: NodeStatus,
    },
    PlanReceived {
        nid: String,
        plan: serde_json::Value,
    },
    NodeResultAvailable {
        nid: String,
    },
    LlmCallStarted {
        call_id: String,
        nid: String,
        model: String,
    },
    LlmCallCompleted {
        call_id: String,
        nid: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolInvoked {
        call_id: String,
        nid: String,
        api: String,
    },
    ToolReturned {
        call_id: String,
        nid: String,
        api: String,
        state: ToolCallState,
        duration_ms: u64,
    },
}

impl EventPayload {
    /// Short tag used in logs and progress displays.
    pub fn tag(&self) -> &'static str {
        match self {
            EventPayload::RunStarted { .. } => "run_started",
            EventPayload::RunFinished { .. } => "run_finished",
            EventPayload::StepStarted { .. } => "step_started",
            EventPayload::StepFinished { .. } => "step_finished",
            EventPayload::NodeCreated { .. } => "node_created",
            EventPayload::NodeAdded { .. } => "node_added",
            EventPayload::EdgeAdded { .. } => "edge_added",
            EventPayload::InnerGraphBuilt { .. } => "inner_graph_built",
            EventPayload::NodeStatusChanged { .. } => "node_status_changed",
            EventPayload::PlanReceived { .. } => "plan_received",
            EventPayload::NodeResultAvailable { .. } => "node_result_available",
            EventPayload::LlmCallStarted { .. } => "llm_call_started",
            EventPayload::LlmCallCompleted { .. } => "llm_call_completed",
            EventPayload::ToolInvoked { .. } => "tool_invoked",
            EventPayload::ToolReturned { .. } => "tool_returned",
        }
    }
}

/// One record in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic sequence number, contiguous from 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Item observed by a subscriber.
#[derive(Debug, Clone)]
pub enum SubscriberItem {
    /// An event, in sequence order.
    Event(Arc<EventRecord>),
    /// The subscriber fell behind and was disconnected; `missed` events
    /// were dropped. Re-subscribe with replay to recover.
    Lagged { missed: u64 },
}

/// Ordered, append-only broadcast of lifecycle events.
pub struct EventBus {
    run_id: RunId,
    log: RwLock<Vec<Arc<EventRecord>>>,
    tx: broadcast::Sender<Arc<EventRecord>>,
}

/// Broadcast buffer per subscriber. Slow consumers beyond this window are
/// disconnected rather than allowed to stall the scheduler.
const SUBSCRIBER_BUFFER: usize = 1024;

impl EventBus {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            run_id: run_id.into(),
            log: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append an event and fan it out. Returns the assigned sequence.
    pub fn emit(&self, payload: EventPayload) -> u64 {
        let record = {
            let mut log = self.log.write();
            let record = Arc::new(EventRecord {
                seq: log.len() as u64,
                timestamp: Utc::now(),
                run_id: self.run_id.clone(),
                payload,
            });
            log.push(record.clone());
            record
        };
        // No receivers is fine; the log still grows.
        let _ = self.tx.send(record.clone());
        record.seq
    }

    /// Number of events emitted so far.
    pub fn len(&self) -> u64 {
        self.log.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Point-in-time copy of the log from `from_seq` onward.
    pub fn snapshot(&self, from_seq: u64) -> Vec<Arc<EventRecord>> {
        let log = self.log.read();
        let start = (from_seq as usize).min(log.len());
        log[start..].to_vec()
    }

    /// Subscribe with replay from `from_seq`, then live delivery.
    ///
    /// The returned stream yields every event with `seq >= from_seq`
    /// exactly once and in order, then follows the live feed until the bus
    /// is dropped or the subscriber lags.
    pub fn subscribe(&self, from_seq: u64) -> impl Stream<Item = SubscriberItem> + Send {
        // Order matters: register the receiver before snapshotting the log
        // so no event can fall between backlog and live feed.
        let mut rx = self.tx.subscribe();
        let backlog = self.snapshot(from_seq);

        async_stream::stream! {
            let mut next = from_seq;
            for record in backlog {
                if record.seq >= next {
                    next = record.seq + 1;
                    yield SubscriberItem::Event(record);
                }
            }
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        // Events already delivered from the backlog.
                        if record.seq < next {
                            continue;
                        }
                        next = record.seq + 1;
                        yield SubscriberItem::Event(record);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield SubscriberItem::Lagged { missed };
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
