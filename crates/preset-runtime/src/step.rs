//! Streaming steps and their results.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::Bus;
use crate::event::{Event, StepMetadata};
use crate::supervisor::CancelSignal;

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// Running output of a started step.
///
/// Results arrive on a channel; [`StepResult::return_all`] collects them
/// until the step closes it.
pub struct StepResult {
    results: mpsc::UnboundedReceiver<anyhow::Result<Value>>,
    cancel: Option<CancelFn>,
    metadata: Option<StepMetadata>,
}

impl StepResult {
    pub fn new(results: mpsc::UnboundedReceiver<anyhow::Result<Value>>) -> Self {
        Self {
            results,
            cancel: None,
            metadata: None,
        }
    }

    /// A result whose values are already known.
    pub fn resolved(values: impl IntoIterator<Item = anyhow::Result<Value>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for value in values {
            // receiver is alive until this function returns
            let _ = tx.send(value);
        }
        Self::new(rx)
    }

    pub fn with_cancel(mut self, cancel: impl FnOnce() + Send + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Result channel, for callers that consume values as they arrive.
    pub fn channel(&mut self) -> &mut mpsc::UnboundedReceiver<anyhow::Result<Value>> {
        &mut self.results
    }

    pub fn metadata(&self) -> Option<&StepMetadata> {
        self.metadata.as_ref()
    }

    /// Ask the step to stop producing. Runs the cancel hook at most once.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Collect every remaining result, then release the step.
    pub async fn return_all(&mut self) -> Vec<anyhow::Result<Value>> {
        let mut out = Vec::new();
        while let Some(result) = self.results.recv().await {
            out.push(result);
        }
        self.cancel();
        out
    }
}

impl std::fmt::Debug for StepResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepResult")
            .field("metadata", &self.metadata)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// A unit of streaming work the engine can drive.
#[async_trait]
pub trait Step: Send + Sync {
    /// Publish this step's events on `topic` of `bus` from now on.
    fn add_published_topic(&self, bus: &Bus, topic: &str) -> anyhow::Result<()>;

    /// Start work on `input`. Must not wait for the work to finish.
    async fn start(&self, cancel: CancelSignal, input: Value) -> anyhow::Result<StepResult>;
}

/// Replays a recorded event stream and returns the last final text.
///
/// Each event is stamped with the step metadata, if set, before publishing.
/// Topics added before a run are consumed by it, so a reused step only
/// publishes to the topics added for its current run.
pub struct ReplayStep {
    events: Vec<Event>,
    metadata: Option<StepMetadata>,
    topics: Mutex<Vec<(Bus, String)>>,
}

impl ReplayStep {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            metadata: None,
            topics: Mutex::new(Vec::new()),
        }
    }

    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn publish(topics: &[(Bus, String)], event: &Event) -> anyhow::Result<()> {
        for (bus, topic) in topics {
            bus.publish_event(topic, event)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for ReplayStep {
    fn add_published_topic(&self, bus: &Bus, topic: &str) -> anyhow::Result<()> {
        let mut topics = self.topics.lock();
        if !topics.iter().any(|(_, t)| t == topic) {
            topics.push((bus.clone(), topic.to_string()));
        }
        Ok(())
    }

    async fn start(&self, cancel: CancelSignal, _input: Value) -> anyhow::Result<StepResult> {
        let topics = std::mem::take(&mut *self.topics.lock());
        let mut last_text = None;
        for event in &self.events {
            if cancel.is_cancelled() {
                anyhow::bail!("replay cancelled");
            }
            let event = match &self.metadata {
                Some(meta) => event.clone().with_step_metadata(meta.clone()),
                None => event.clone(),
            };
            Self::publish(&topics, &event)?;
            if let crate::event::EventPayload::Final { text } = &event.payload {
                last_text = Some(text.clone());
            }
        }

        let result = StepResult::resolved(last_text.map(|text| Ok(Value::String(text))));
        Ok(match &self.metadata {
            Some(meta) => result.with_metadata(meta.clone()),
            None => result,
        })
    }
}

impl std::fmt::Debug for ReplayStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayStep")
            .field("events", &self.events.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}
