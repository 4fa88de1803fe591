//! Single-threaded Lua event loop.
//!
//! The VM lives on one dedicated OS thread. Everything that touches it is a
//! task posted to a FIFO queue; tasks run one at a time in posting order.
//! Tasks posted before [`ScriptLoop::start`] wait in the queue and run after
//! setup.

use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Variadic};
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};

use crate::{FieldNaming, RuntimeError};

/// Work scheduled onto the loop thread.
pub type LoopTask = Box<dyn FnOnce(&Lua) + Send + 'static>;

/// Environment setup run once on the loop before any queued task.
pub type SetupFn = Box<dyn FnOnce(&Lua) -> mlua::Result<()> + Send + 'static>;

/// A Lua function pinned in the VM registry.
///
/// Only usable from inside a loop task.
#[derive(Clone)]
pub struct ScriptCallback {
    key: Arc<RegistryKey>,
}

impl ScriptCallback {
    pub(crate) fn invoke(&self, lua: &Lua, arg: mlua::Value) -> mlua::Result<()> {
        let f: Function = lua.registry_value(&self.key)?;
        f.call::<()>(arg)
    }

    /// Call with a JSON value converted to a Lua value.
    pub fn call_json(&self, lua: &Lua, value: &Value) -> mlua::Result<()> {
        let arg = lua.to_value(value)?;
        self.invoke(lua, arg)
    }
}

impl std::fmt::Debug for ScriptCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScriptCallback")
    }
}

/// Handle to the loop thread.
pub struct ScriptLoop {
    naming: FieldNaming,
    tx: Mutex<Option<mpsc::UnboundedSender<LoopTask>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LoopTask>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ScriptLoop {
    /// Create the queue. No thread runs until [`ScriptLoop::start`].
    pub fn new(naming: FieldNaming) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            naming,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the loop thread: install `console`, record the field naming,
    /// run `setup_fns` in order, then serve queued tasks.
    pub fn start(&self, setup_fns: Vec<SetupFn>) -> Result<(), RuntimeError> {
        let mut rx = self.rx.lock().take().ok_or(RuntimeError::AlreadyStarted)?;
        let naming = self.naming;

        let handle = thread::Builder::new()
            .name("preset-script-loop".into())
            .spawn(move || {
                let lua = Lua::new();
                lua.set_app_data(naming);
                if let Err(e) = install_console(&lua) {
                    tracing::error!(error = %e, "Console setup failed");
                }
                for (index, setup) in setup_fns.into_iter().enumerate() {
                    if let Err(e) = setup(&lua) {
                        tracing::warn!(index, error = %e, "Setup function failed");
                    }
                }
                tracing::debug!("Script loop started");

                while let Some(task) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(|| task(&lua))).is_err() {
                        tracing::error!("Script loop task panicked");
                    }
                }
                tracing::debug!("Script loop finished");
            })
            .map_err(|e| RuntimeError::Task {
                name: "script-loop".into(),
                reason: e.to_string(),
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.rx.lock().is_none()
    }

    pub fn field_naming(&self) -> FieldNaming {
        self.naming
    }

    /// Queue `task`. Never blocks.
    pub fn post(&self, task: impl FnOnce(&Lua) + Send + 'static) -> Result<(), RuntimeError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(RuntimeError::LoopStopped)?;
        tx.send(Box::new(task)).map_err(|_| RuntimeError::LoopStopped)
    }

    /// Run `f` on the loop and wait for its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(&Lua) -> mlua::Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move |lua| {
            let _ = tx.send(f(lua).map_err(RuntimeError::script));
        })?;
        rx.await.map_err(|_| RuntimeError::LoopStopped)?
    }

    /// Execute a Lua chunk.
    pub async fn run_script(&self, source: impl Into<String>) -> Result<(), RuntimeError> {
        let source = source.into();
        self.call(move |lua| lua.load(source.as_str()).set_name("=script").exec())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Script execution failed"))
    }

    /// Evaluate a chunk that returns a function and keep it as a callback.
    pub async fn eval_callback(&self, source: impl Into<String>) -> Result<ScriptCallback, RuntimeError> {
        let source = source.into();
        self.call(move |lua| {
            let f: Function = lua.load(source.as_str()).set_name("=callback").eval()?;
            Ok(ScriptCallback {
                key: Arc::new(lua.create_registry_value(f)?),
            })
        })
        .await
    }

    /// Wait until every task queued so far has run.
    pub async fn barrier(&self) -> Result<(), RuntimeError> {
        self.call(|_| Ok(())).await
    }

    /// Close the queue, let queued tasks finish and join the thread.
    pub async fn stop(&self) {
        self.tx.lock().take();
        // never started: queued tasks are dropped with the receiver
        self.rx.lock().take();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("Script loop thread panicked"),
            Err(e) => tracing::warn!(error = %e, "Failed to join script loop thread"),
        }
    }
}

impl std::fmt::Debug for ScriptLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptLoop")
            .field("naming", &self.naming)
            .field("started", &self.is_started())
            .field("stopped", &self.tx.lock().is_none())
            .finish()
    }
}

/// Field naming recorded on the VM at start.
pub(crate) fn vm_field_naming(lua: &Lua) -> FieldNaming {
    lua.app_data_ref::<FieldNaming>()
        .map(|naming| *naming)
        .unwrap_or_default()
}

fn render_args(lua: &Lua, args: Variadic<mlua::Value>) -> mlua::Result<String> {
    let tostring: Function = lua.globals().get("tostring")?;
    let mut parts = Vec::with_capacity(args.len());
    for arg in args.iter() {
        parts.push(tostring.call::<String>(arg.clone())?);
    }
    Ok(parts.join(" "))
}

fn install_console(lua: &Lua) -> mlua::Result<()> {
    let console = lua.create_table()?;
    console.set(
        "log",
        lua.create_function(|lua, args: Variadic<mlua::Value>| {
            let line = render_args(lua, args)?;
            tracing::info!(target: "preset::console", "{}", line);
            Ok(())
        })?,
    )?;
    console.set(
        "error",
        lua.create_function(|lua, args: Variadic<mlua::Value>| {
            let line = render_args(lua, args)?;
            tracing::error!(target: "preset::console", "{}", line);
            Ok(())
        })?,
    )?;
    lua.globals().set("console", console)
}
