//! Supervised background tasks sharing one cancellation signal.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::RuntimeError;

/// Read side of the supervisor's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested, or when the supervisor is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Owns a set of tasks; the first real failure wins.
pub struct Supervisor {
    tasks: Mutex<JoinSet<(String, Result<(), RuntimeError>)>>,
    cancel: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            cancel,
        }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.cancel.subscribe(),
        }
    }

    /// Run `task` under supervision. It receives the shared cancel signal.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<(), RuntimeError>> + Send + 'static,
    {
        let name = name.into();
        let fut = task(self.signal());
        tracing::debug!(task = %name, "Supervised task spawned");
        self.tasks.lock().spawn(async move { (name, fut.await) });
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Join every task. Cancellation is not a failure; any other error is
    /// returned after all tasks have finished.
    pub async fn wait(&self) -> Result<(), RuntimeError> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(error = %e, "Supervised task aborted");
                    first_error.get_or_insert(RuntimeError::Task {
                        name: "unknown".into(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match result {
                Ok(()) | Err(RuntimeError::Cancelled) => {
                    tracing::debug!(task = %name, "Supervised task finished");
                }
                Err(e) => {
                    tracing::warn!(task = %name, error = %e, "Supervised task failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tasks", &self.tasks.lock().len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
