//! # preset-runtime
//!
//! Streaming step runtime for resolved profiles.
//!
//! One embedded Lua VM runs on a dedicated loop thread. Steps publish their
//! events onto a shared in-process bus; a router subscribes per step and
//! schedules every event onto the loop, where the script callback for that
//! step sees it as a plain table.
//!
//! ## Important
//!
//! All VM access goes through the loop's task queue. Nothing outside the
//! loop thread ever touches the `mlua::Lua` value.
//!
//! ## Example
//!
//! ```rust,ignore
//! use preset_runtime::{EngineConfig, RuntimeEngine};
//!
//! let engine = RuntimeEngine::new(EngineConfig::default()).await?;
//! engine.start(Vec::new())?;
//!
//! let on_event = engine
//!     .eval_callback("return function(ev) console.log(ev.type, ev.text) end")
//!     .await?;
//! let run = engine.run_step(step, "chat-1", input, on_event).await?;
//! engine.close().await?;
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bus;
pub mod engine;
pub mod event;
pub mod router;
pub mod script_loop;
pub mod step;
pub mod supervisor;

pub use bus::{Bus, Message};
pub use engine::{RuntimeEngine, StepRun};
pub use event::{Event, EventMetadata, EventPayload, StepMetadata, ToolCall, ToolResult, Usage};
pub use router::{HandlerHandle, Router};
pub use script_loop::{ScriptCallback, ScriptLoop, SetupFn};
pub use step::{ReplayStep, Step, StepResult};
pub use supervisor::{CancelSignal, Supervisor};

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("script loop already started")]
    AlreadyStarted,

    #[error("script loop is stopped")]
    LoopStopped,

    #[error("script error: {0}")]
    Script(String),

    #[error("decode event: {0}")]
    Event(#[from] serde_json::Error),

    #[error("message bus is closed")]
    BusClosed,

    #[error("router is closed")]
    RouterClosed,

    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("step {0} is already running")]
    StepAlreadyRunning(String),

    #[error("step {step_id} failed: {reason}")]
    Step { step_id: String, reason: String },

    #[error("task {name} failed: {reason}")]
    Task { name: String, reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl RuntimeError {
    pub(crate) fn script(err: impl std::fmt::Display) -> Self {
        RuntimeError::Script(err.to_string())
    }
}

/// Key spelling used when events are handed to scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldNaming {
    /// `messageId`, `toolCall`, ...
    #[default]
    Camel,
    /// Keys keep their wire spelling
    Snake,
}

/// Configuration for [`RuntimeEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key spelling of script event tables
    pub field_naming: FieldNaming,

    /// Prefix of per-step router handler names
    pub handler_name_prefix: String,

    /// Prefix of per-step bus topics
    pub topic_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_naming: FieldNaming::Camel,
            handler_name_prefix: "into-vm-".to_string(),
            topic_prefix: "step.".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_field_naming(mut self, naming: FieldNaming) -> Self {
        self.field_naming = naming;
        self
    }

    /// Bus topic for one step.
    pub fn step_topic(&self, step_id: &str) -> String {
        format!("{}{}", self.topic_prefix, step_id)
    }

    /// Router handler name for one step.
    pub fn handler_name(&self, step_id: &str) -> String {
        format!("{}{}", self.handler_name_prefix, step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.step_topic("abc"), "step.abc");
        assert_eq!(config.handler_name("abc"), "into-vm-abc");
        assert_eq!(config.field_naming, FieldNaming::Camel);
    }

    #[test]
    fn test_config_partial_deserialize() {
        let config: EngineConfig = serde_json::from_str(r#"{"field_naming": "snake"}"#).unwrap();
        assert_eq!(config.field_naming, FieldNaming::Snake);
        assert_eq!(config.topic_prefix, "step.");
    }
}
