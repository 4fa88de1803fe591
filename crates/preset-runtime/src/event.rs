//! Streaming step events.
//!
//! Events travel over the bus as JSON tagged by `type`. Before a script sees
//! one it is reshaped into a flat table: `type`, `meta`, `step` and the
//! fields of its kind.

use preset_core::{ResolvedProfile, StepSettings};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::FieldNaming;

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub cached_tokens: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Inference metadata carried by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub message_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub engine: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl EventMetadata {
    /// Fresh metadata with a random message id.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            engine: engine.into(),
            ..Default::default()
        }
    }

    /// Engine and sampling parameters taken from the `chat` settings section.
    pub fn from_step_settings(settings: &StepSettings) -> Self {
        let mut meta = Self::new(
            settings
                .get("chat", "engine")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        meta.temperature = settings.get("chat", "temperature").and_then(Value::as_f64);
        meta.top_p = settings.get("chat", "top_p").and_then(Value::as_f64);
        meta.max_tokens = settings
            .get("chat", "max_response_tokens")
            .and_then(Value::as_u64);
        meta
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    fn to_script_value(&self, naming: FieldNaming) -> Value {
        let key = |camel: &'static str, snake: &'static str| match naming {
            FieldNaming::Camel => camel,
            FieldNaming::Snake => snake,
        };

        let mut meta = Map::new();
        meta.insert(key("messageId", "message_id").into(), json!(self.message_id));
        meta.insert(key("parentId", "parent_id").into(), json!(self.parent_id));
        meta.insert("engine".into(), json!(self.engine));
        if let Some(t) = self.temperature {
            meta.insert("temperature".into(), json!(t));
        }
        if let Some(p) = self.top_p {
            meta.insert(key("topP", "top_p").into(), json!(p));
        }
        if let Some(n) = self.max_tokens {
            meta.insert(key("maxTokens", "max_tokens").into(), json!(n));
        }
        if let Some(reason) = &self.stop_reason {
            meta.insert(key("stopReason", "stop_reason").into(), json!(reason));
        }
        if let Some(usage) = &self.usage {
            meta.insert(
                "usage".into(),
                json!({
                    key("inputTokens", "input_tokens"): usage.input_tokens,
                    key("outputTokens", "output_tokens"): usage.output_tokens,
                    key("cachedTokens", "cached_tokens"): usage.cached_tokens,
                }),
            );
        }
        Value::Object(meta)
    }
}

/// Which step produced an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step_id: String,

    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl StepMetadata {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Step metadata tagged with the profile a step runs under.
    ///
    /// Carries the profile identity, runtime key and fingerprint, plus the
    /// flattened effective step settings.
    pub fn for_profile(
        step_id: impl Into<String>,
        step_type: impl Into<String>,
        resolved: &ResolvedProfile,
    ) -> Self {
        let mut metadata = resolved.effective_step_settings.metadata();
        metadata.insert("profile.registry".into(), json!(resolved.registry_slug.as_str()));
        metadata.insert("profile.slug".into(), json!(resolved.profile_slug.as_str()));
        metadata.insert("runtime_key".into(), json!(resolved.runtime_key.as_str()));
        metadata.insert("runtime_fingerprint".into(), json!(resolved.runtime_fingerprint));
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            metadata,
        }
    }

    fn to_script_value(&self, naming: FieldNaming) -> Value {
        let step_id = match naming {
            FieldNaming::Camel => "stepId",
            FieldNaming::Snake => "step_id",
        };
        json!({
            step_id: self.step_id,
            "type": self.step_type,
            "metadata": self.metadata,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    #[serde(default)]
    pub result: String,
}

/// Kind-specific part of an event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Start,
    Partial {
        #[serde(default)]
        delta: String,
        #[serde(default)]
        completion: String,
    },
    Final {
        #[serde(default)]
        text: String,
    },
    Error {
        #[serde(default)]
        error: String,
    },
    Interrupt {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        tool_call: ToolCall,
    },
    ToolResult {
        tool_result: ToolResult,
    },
}

/// One streaming event published by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,

    #[serde(default)]
    pub metadata: EventMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_metadata: Option<StepMetadata>,
}

impl Event {
    pub fn new(payload: EventPayload, metadata: EventMetadata) -> Self {
        Self {
            payload,
            metadata,
            step_metadata: None,
        }
    }

    pub fn start(metadata: EventMetadata) -> Self {
        Self::new(EventPayload::Start, metadata)
    }

    pub fn partial(metadata: EventMetadata, delta: impl Into<String>, completion: impl Into<String>) -> Self {
        Self::new(
            EventPayload::Partial {
                delta: delta.into(),
                completion: completion.into(),
            },
            metadata,
        )
    }

    pub fn final_text(metadata: EventMetadata, text: impl Into<String>) -> Self {
        Self::new(EventPayload::Final { text: text.into() }, metadata)
    }

    pub fn error(metadata: EventMetadata, error: impl Into<String>) -> Self {
        Self::new(EventPayload::Error { error: error.into() }, metadata)
    }

    pub fn with_step_metadata(mut self, step: StepMetadata) -> Self {
        self.step_metadata = Some(step);
        self
    }

    /// Wire name of the event kind.
    pub fn event_type(&self) -> &'static str {
        match self.payload {
            EventPayload::Start => "start",
            EventPayload::Partial { .. } => "partial",
            EventPayload::Final { .. } => "final",
            EventPayload::Error { .. } => "error",
            EventPayload::Interrupt { .. } => "interrupt",
            EventPayload::ToolCall { .. } => "tool-call",
            EventPayload::ToolResult { .. } => "tool-result",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Shape handed to script callbacks.
    pub fn to_script_value(&self, naming: FieldNaming) -> Value {
        let camel = naming == FieldNaming::Camel;
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.event_type()));
        obj.insert("meta".into(), self.metadata.to_script_value(naming));
        if let Some(step) = &self.step_metadata {
            obj.insert("step".into(), step.to_script_value(naming));
        }

        match &self.payload {
            EventPayload::Start => {}
            EventPayload::Partial { delta, completion } => {
                obj.insert("delta".into(), json!(delta));
                obj.insert("completion".into(), json!(completion));
            }
            EventPayload::Final { text } | EventPayload::Interrupt { text } => {
                obj.insert("text".into(), json!(text));
            }
            EventPayload::Error { error } => {
                obj.insert("error".into(), json!(error));
            }
            EventPayload::ToolCall { tool_call } => {
                let key = if camel { "toolCall" } else { "tool_call" };
                obj.insert(
                    key.into(),
                    json!({"id": tool_call.id, "name": tool_call.name, "input": tool_call.input}),
                );
            }
            EventPayload::ToolResult { tool_result } => {
                let key = if camel { "toolResult" } else { "tool_result" };
                obj.insert(
                    key.into(),
                    json!({"id": tool_result.id, "result": tool_result.result}),
                );
            }
        }
        Value::Object(obj)
    }
}
