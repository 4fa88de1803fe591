//! Routes bus topics to named handlers.
//!
//! Each handler runs on its own task and sees its topic's messages one at a
//! time, in publication order. Handlers can be added while the router is
//! running and stopped independently; stopping drains what was already
//! delivered.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::{Bus, Message};
use crate::supervisor::CancelSignal;
use crate::RuntimeError;

type HandlerFn = dyn Fn(Message) -> anyhow::Result<()> + Send + Sync;

struct HandlerEntry {
    topic: String,
    subscription: u64,
    done: watch::Receiver<bool>,
}

struct RouterInner {
    bus: Bus,
    handlers: Mutex<HashMap<String, HandlerEntry>>,
    running: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// Message router over a [`Bus`]. Clones refer to the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Control handle for one installed handler.
#[derive(Debug)]
pub struct HandlerHandle {
    name: String,
    router: Router,
    done: watch::Receiver<bool>,
}

impl HandlerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unsubscribe the handler. Messages already queued are still handled.
    pub fn stop(&self) {
        self.router.detach(&self.name);
    }

    /// Wait until the handler has processed its last message.
    pub async fn stopped(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

impl Router {
    pub fn new(bus: Bus) -> Self {
        let (running, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(RouterInner {
                bus,
                handlers: Mutex::new(HashMap::new()),
                running,
                closed,
            }),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Install a handler for `topic` under a unique `name`.
    pub fn add_handler<F>(&self, name: &str, topic: &str, handler: F) -> Result<HandlerHandle, RuntimeError>
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if *self.inner.closed.borrow() {
            return Err(RuntimeError::RouterClosed);
        }

        let mut handlers = self.inner.handlers.lock();
        if handlers.contains_key(name) {
            return Err(RuntimeError::DuplicateHandler(name.to_string()));
        }

        let (subscription, mut rx) = self.inner.bus.subscribe(topic)?;
        let (done_tx, done_rx) = watch::channel(false);
        let handler: Arc<HandlerFn> = Arc::new(handler);
        let task_name = name.to_string();
        let task_topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = handler(message) {
                    tracing::warn!(handler = %task_name, topic = %task_topic, error = %e, "Message handler failed");
                }
            }
            tracing::debug!(handler = %task_name, "Handler drained");
            done_tx.send_replace(true);
        });

        handlers.insert(
            name.to_string(),
            HandlerEntry {
                topic: topic.to_string(),
                subscription,
                done: done_rx.clone(),
            },
        );
        tracing::debug!(handler = %name, topic = %topic, "Handler added");

        Ok(HandlerHandle {
            name: name.to_string(),
            router: self.clone(),
            done: done_rx,
        })
    }

    fn detach(&self, name: &str) -> Option<HandlerEntry> {
        let entry = self.inner.handlers.lock().remove(name)?;
        self.inner.bus.unsubscribe(&entry.topic, entry.subscription);
        Some(entry)
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Serve until `cancel` fires, then close.
    pub async fn run(&self, mut cancel: CancelSignal) -> Result<(), RuntimeError> {
        if *self.inner.closed.borrow() {
            return Err(RuntimeError::RouterClosed);
        }
        self.inner.running.send_replace(true);
        tracing::debug!("Router running");

        cancel.cancelled().await;
        self.close().await;
        Err(RuntimeError::Cancelled)
    }

    /// Resolve once [`Router::run`] has started serving.
    pub async fn running(&self) {
        let mut rx = self.inner.running.subscribe();
        let _ = rx.wait_for(|running| *running).await;
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Detach every handler and wait for each to drain. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.running.send_replace(false);

        let names: Vec<String> = self.inner.handlers.lock().keys().cloned().collect();
        let drains = names.into_iter().filter_map(|name| {
            let mut entry = self.detach(&name)?;
            Some(async move {
                if entry.done.wait_for(|done| *done).await.is_err() {
                    tracing::warn!(handler = %name, "Handler task ended without draining");
                }
            })
        });
        futures::future::join_all(drains).await;
        tracing::debug!("Router closed");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.handler_names())
            .field("running", &self.is_running())
            .finish()
    }
}
