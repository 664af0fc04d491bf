//! Scripted capabilities.
//!
//! Deterministic [`Capability`] implementations that make the engine
//! drivable end-to-end without network providers: fixtures for tests, and
//! an offline planner/writer/aggregator trio the CLI uses for demos.

use crate::capability::{
    ActionResult, Capability, CapabilityReply, CapabilityRegistry, CapabilityRequest, SubtaskSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::ErrorClass;
use crate::node::{ActionName, TaskType};

type DefaultFn = dyn Fn(&CapabilityRequest) -> CapabilityReply + Send + Sync;

/// A capability that replays queued responses per `(nid, action)`.
///
/// Responses queue in FIFO order, so successive attempts on the same node
/// observe successive entries; this is how transient-then-success and
/// invalid-then-valid scripts are expressed in tests. Requests with no
/// queued response fall through to the default function, or fail fatally
/// when none is set.
pub struct ScriptedCapability {
    name: String,
    class: String,
    responses: Mutex<HashMap<(String, ActionName), VecDeque<CapabilityReply>>>,
    default: Option<Box<DefaultFn>>,
}

impl ScriptedCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: "llm".into(),
            responses: Mutex::new(HashMap::new()),
            default: None,
        }
    }

    /// Mark this capability as a search tool.
    pub fn as_search(mut self) -> Self {
        self.class = "search".into();
        self
    }

    /// Queue a response for the next matching request.
    pub fn on(self, nid: &str, action: ActionName, result: ActionResult) -> Self {
        self.responses
            .lock()
            .entry((nid.to_string(), action))
            .or_default()
            .push_back(result.into());
        self
    }

    /// Fallback for requests with no queued response.
    pub fn with_default<F>(mut self, default: F) -> Self
    where
        F: Fn(&CapabilityRequest) -> CapabilityReply + Send + Sync + 'static,
    {
        self.default = Some(Box::new(default));
        self
    }

    /// Shared handle, ready for registration.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &str {
        &self.class
    }

    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply {
        let scripted = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&(request.nid.clone(), request.action))
                .and_then(|queue| queue.pop_front())
        };
        if let Some(reply) = scripted {
            return reply;
        }
        if let Some(default) = &self.default {
            return default(&request);
        }
        ActionResult::error(
            ErrorClass::Fatal,
            format!(
                "no scripted response for node {} action {}",
                request.nid, request.action
            ),
        )
        .into()
    }
}

/// Offline planner: decomposes the root goal into a fixed number of
/// linearly dependent sections, and answers deeper plan requests with
/// direct text.
pub struct OfflinePlanner {
    name: String,
    sections: usize,
}

impl OfflinePlanner {
    pub fn new(name: impl Into<String>, sections: usize) -> Self {
        Self {
            name: name.into(),
            sections: sections.max(1),
        }
    }
}

#[async_trait]
impl Capability for OfflinePlanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply {
        if request.layer > 0 {
            return ActionResult::Write {
                text: format!("{}.", request.goal),
            }
            .into();
        }
        let titles = ["Introduction", "Development", "Analysis", "Conclusion"];
        let subtasks: Vec<SubtaskSpec> = (0..self.sections)
            .map(|i| {
                let title = titles.get(i).copied().unwrap_or("Section");
                let mut spec = SubtaskSpec::new(
                    TaskType::Composition,
                    format!("{title}: {}", request.goal),
                );
                if i > 0 {
                    spec = spec.depends_on(i - 1);
                }
                spec
            })
            .collect();
        ActionResult::Plan { subtasks }.into()
    }
}

/// Offline writer: produces deterministic prose from the goal.
pub struct OfflineWriter {
    name: String,
}

impl OfflineWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Capability for OfflineWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply {
        match request.action {
            ActionName::Reason => ActionResult::Reason {
                conclusion: format!("Considered: {}.", request.goal),
            }
            .into(),
            ActionName::Reflect => match request.draft {
                Some(draft) => ActionResult::Write { text: draft }.into(),
                None => ActionResult::Write {
                    text: format!("{}.", request.goal),
                }
                .into(),
            },
            _ => ActionResult::Write {
                text: format!("{}.", request.goal),
            }
            .into(),
        }
    }
}

/// Offline aggregator: concatenates children results in order.
pub struct OfflineAggregator {
    name: String,
}

impl OfflineAggregator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Capability for OfflineAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply {
        let text = request
            .context
            .child_results
            .iter()
            .map(|(_, text)| text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        ActionResult::Aggregate { text }.into()
    }
}

/// Registry wired with the offline trio under the default model names.
pub fn offline_registry() -> CapabilityRegistry {
    CapabilityRegistry::new()
        .with(Arc::new(OfflinePlanner::new("planner", 3)))
        .with(Arc::new(OfflineWriter::new("writer")))
        .with(Arc::new(OfflineAggregator::new("aggregator")))
}
