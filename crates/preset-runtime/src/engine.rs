//! The runtime engine: one script loop, one bus, one router.

use mlua::LuaSerdeExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::Bus;
use crate::event::{Event, StepMetadata};
use crate::router::Router;
use crate::script_loop::{vm_field_naming, ScriptCallback, ScriptLoop, SetupFn};
use crate::step::Step;
use crate::supervisor::Supervisor;
use crate::{EngineConfig, RuntimeError};

/// Bookkeeping for one step in flight.
struct Runner {
    step_id: String,
    on_event: ScriptCallback,
    finished: watch::Sender<bool>,
}

type RunningSteps = Arc<RwLock<HashMap<String, Runner>>>;

/// What a finished step handed back.
#[derive(Debug)]
pub struct StepRun {
    pub step_id: String,
    pub results: Vec<anyhow::Result<Value>>,
    pub metadata: Option<StepMetadata>,
}

impl StepRun {
    /// Successful result values, in order.
    pub fn values(&self) -> Vec<&Value> {
        self.results.iter().filter_map(|r| r.as_ref().ok()).collect()
    }
}

/// Drives steps and routes their events into the script loop.
///
/// Events of one step reach its callback in publication order, and all of
/// them have been delivered by the time [`RuntimeEngine::run_step`] returns.
pub struct RuntimeEngine {
    config: EngineConfig,
    script: Arc<ScriptLoop>,
    bus: Bus,
    router: Router,
    supervisor: Supervisor,
    running: RunningSteps,
    setup_fns: Mutex<Vec<SetupFn>>,
}

impl RuntimeEngine {
    /// Start the router under supervision and wait until it serves.
    ///
    /// The script loop is not started; call [`RuntimeEngine::start`].
    pub async fn new(config: EngineConfig) -> Result<Self, RuntimeError> {
        let bus = Bus::new();
        let router = Router::new(bus.clone());
        let supervisor = Supervisor::new();

        let served = router.clone();
        supervisor.spawn("router", move |signal| async move { served.run(signal).await });
        router.running().await;

        tracing::debug!(naming = ?config.field_naming, "Runtime engine created");
        Ok(Self {
            script: Arc::new(ScriptLoop::new(config.field_naming)),
            config,
            bus,
            router,
            supervisor,
            running: Arc::new(RwLock::new(HashMap::new())),
            setup_fns: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn script(&self) -> &ScriptLoop {
        &self.script
    }

    /// Queue a setup function for [`RuntimeEngine::start`].
    pub fn add_setup_function(&self, setup: SetupFn) {
        self.setup_fns.lock().push(setup);
    }

    /// Start the script loop. Setup functions added earlier run first,
    /// then `setup_fns`.
    pub fn start(&self, setup_fns: Vec<SetupFn>) -> Result<(), RuntimeError> {
        let mut all = std::mem::take(&mut *self.setup_fns.lock());
        all.extend(setup_fns);
        tracing::debug!(setup_functions = all.len(), "Starting script loop");
        self.script.start(all)
    }

    pub async fn run_script(&self, source: impl Into<String>) -> Result<(), RuntimeError> {
        self.script.run_script(source).await
    }

    pub async fn eval_callback(&self, source: impl Into<String>) -> Result<ScriptCallback, RuntimeError> {
        self.script.eval_callback(source).await
    }

    /// Ids of steps currently in flight, sorted.
    pub fn running_steps(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Names of the router handlers currently installed.
    pub fn handler_names(&self) -> Vec<String> {
        self.router.handler_names()
    }

    /// Completion flag of a running step; `None` if it is not running.
    pub fn watch_step(&self, step_id: &str) -> Option<watch::Receiver<bool>> {
        self.running.read().get(step_id).map(|r| r.finished.subscribe())
    }

    /// Run `step` to completion, streaming its events to `on_event`.
    ///
    /// A blank `step_id` gets a random one.
    pub async fn run_step(
        &self,
        step: Arc<dyn Step>,
        step_id: &str,
        input: Value,
        on_event: ScriptCallback,
    ) -> Result<StepRun, RuntimeError> {
        let step_id = match step_id.trim() {
            "" => uuid::Uuid::new_v4().to_string(),
            id => id.to_string(),
        };

        {
            let mut running = self.running.write();
            if running.contains_key(&step_id) {
                return Err(RuntimeError::StepAlreadyRunning(step_id));
            }
            let (finished, _) = watch::channel(false);
            running.insert(
                step_id.clone(),
                Runner {
                    step_id: step_id.clone(),
                    on_event,
                    finished,
                },
            );
        }
        tracing::debug!(step_id = %step_id, "Step runner registered");

        let topic = self.config.step_topic(&step_id);
        let handler = self.router.add_handler(
            &self.config.handler_name(&step_id),
            &topic,
            self.event_handler(step_id.clone()),
        );
        let mut handler = match handler {
            Ok(handler) => handler,
            Err(e) => {
                self.release(&step_id);
                return Err(e);
            }
        };

        let outcome = self.drive(step.as_ref(), &step_id, &topic, input).await;

        handler.stop();
        handler.stopped().await;
        // event callbacks were queued before the drain finished
        if self.script.is_started() {
            if let Err(e) = self.script.barrier().await {
                tracing::warn!(step_id = %step_id, error = %e, "Script loop unavailable while draining step");
            }
        }
        self.release(&step_id);

        let (results, metadata) = outcome?;
        tracing::debug!(step_id = %step_id, results = results.len(), "Step finished");
        Ok(StepRun {
            step_id,
            results,
            metadata,
        })
    }

    async fn drive(
        &self,
        step: &dyn Step,
        step_id: &str,
        topic: &str,
        input: Value,
    ) -> Result<(Vec<anyhow::Result<Value>>, Option<StepMetadata>), RuntimeError> {
        let step_error = |e: anyhow::Error| {
            tracing::error!(step_id = %step_id, error = %e, "Step failed");
            RuntimeError::Step {
                step_id: step_id.to_string(),
                reason: format!("{:#}", e),
            }
        };

        step.add_published_topic(&self.bus, topic).map_err(step_error)?;
        let mut result = step
            .start(self.supervisor.signal(), input)
            .await
            .map_err(step_error)?;
        let results = result.return_all().await;
        Ok((results, result.metadata().cloned()))
    }

    /// Bus handler for one step: decode, look up the runner, schedule the
    /// callback on the loop.
    fn event_handler(&self, step_id: String) -> impl Fn(crate::bus::Message) -> anyhow::Result<()> + Send + Sync + 'static {
        let running = self.running.clone();
        let script = self.script.clone();
        move |message| {
            let event = Event::from_json(&message.payload)?;
            let callback = {
                let running = running.read();
                match running.get(&step_id) {
                    Some(runner) if !*runner.finished.borrow() => runner.on_event.clone(),
                    _ => {
                        tracing::debug!(step_id = %step_id, "Step already finished, dropping event");
                        return Ok(());
                    }
                }
            };

            let id = step_id.clone();
            script.post(move |lua| {
                let value = event.to_script_value(vm_field_naming(lua));
                let result = lua
                    .to_value(&value)
                    .and_then(|arg| callback.invoke(lua, arg));
                if let Err(e) = result {
                    tracing::warn!(step_id = %id, event_type = event.event_type(), error = %e, "Script event callback failed");
                }
            })?;
            Ok(())
        }
    }

    fn release(&self, step_id: &str) {
        if let Some(runner) = self.running.write().remove(step_id) {
            runner.finished.send_replace(true);
            tracing::debug!(step_id = %runner.step_id, "Step runner released");
        }
    }

    /// Cancel in-flight work, stop the loop, close the router and join
    /// every supervised task.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.supervisor.cancel();
        self.script.stop().await;
        self.router.close().await;
        self.bus.close();
        self.supervisor.wait().await
    }
}

impl std::fmt::Debug for RuntimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEngine")
            .field("config", &self.config)
            .field("running", &self.running_steps())
            .field("router", &self.router)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::step::ReplayStep;
    use crate::FieldNaming;

    async fn engine() -> RuntimeEngine {
        let engine = RuntimeEngine::new(EngineConfig::default()).await.unwrap();
        engine.start(Vec::new()).unwrap();
        engine.run_script("seen = {}").await.unwrap();
        engine
    }

    async fn collector(engine: &RuntimeEngine) -> ScriptCallback {
        engine
            .eval_callback("return function(ev) table.insert(seen, ev.type) end")
            .await
            .unwrap()
    }

    async fn seen(engine: &RuntimeEngine) -> Vec<String> {
        engine
            .script()
            .call(|lua| lua.globals().get::<Vec<String>>("seen"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_step_delivers_events_before_returning() {
        let engine = engine().await;
        let meta = EventMetadata::new("e");
        let step = Arc::new(ReplayStep::new(vec![
            Event::start(meta.clone()),
            Event::partial(meta.clone(), "a", "a"),
            Event::partial(meta.clone(), "b", "ab"),
            Event::final_text(meta, "ab"),
        ]));

        let run = engine
            .run_step(step, "s1", Value::Null, collector(&engine).await)
            .await
            .unwrap();
        assert_eq!(run.step_id, "s1");
        assert_eq!(run.values(), vec![&Value::from("ab")]);
        assert_eq!(seen(&engine).await, vec!["start", "partial", "partial", "final"]);
        assert!(engine.running_steps().is_empty());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_errors_are_contained() {
        let engine = engine().await;
        let failing = engine
            .eval_callback("return function(ev) error('bad callback') end")
            .await
            .unwrap();
        let step = Arc::new(ReplayStep::new(vec![Event::final_text(EventMetadata::new("e"), "done")]));

        let run = engine.run_step(step, "", Value::Null, failing).await.unwrap();
        assert!(!run.step_id.is_empty());
        assert_eq!(run.values(), vec![&Value::from("done")]);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snake_naming_reaches_scripts() {
        let engine = RuntimeEngine::new(EngineConfig::default().with_field_naming(FieldNaming::Snake))
            .await
            .unwrap();
        engine.start(Vec::new()).unwrap();
        let callback = engine
            .eval_callback("return function(ev) last_id = ev.meta.message_id end")
            .await
            .unwrap();
        let mut meta = EventMetadata::new("e");
        meta.message_id = "m-7".into();
        let step = Arc::new(ReplayStep::new(vec![Event::start(meta)]));

        engine.run_step(step, "s", Value::Null, callback).await.unwrap();
        let last: String = engine
            .script()
            .call(|lua| lua.globals().get("last_id"))
            .await
            .unwrap();
        assert_eq!(last, "m-7");
        engine.close().await.unwrap();
    }
}
