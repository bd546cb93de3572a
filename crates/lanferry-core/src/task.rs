//! Restartable loop tasks.
//!
//! A [`Looper`] runs at most one long-lived task at a time. The loop
//! body is supplied at construction as a factory taking a fresh
//! [`CancellationToken`] per run; bodies must observe the token at
//! every natural suspension point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type LoopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Harness for one cooperative long-running task.
pub struct Looper {
    body: Box<dyn Fn(CancellationToken) -> LoopFuture + Send + Sync>,
    state: Mutex<LooperState>,
}

#[derive(Default)]
struct LooperState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    disposed: bool,
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        f.debug_struct("Looper")
            .field("running", &state.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl Looper {
    /// Create a harness around a loop body factory.
    ///
    /// The factory is invoked once per [`run`](Self::run) with the
    /// cancellation token governing that run.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            body: Box::new(move |token| Box::pin(body(token))),
            state: Mutex::new(LooperState::default()),
        }
    }

    /// Start the task unless one is already running.
    ///
    /// Idempotent under concurrent calls: exactly one task runs. A
    /// stopped harness can be run again with a fresh token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`close`](Self::close).
    pub fn run(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.disposed {
            return Err(Error::Disposed);
        }
        if state.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let future = (self.body)(token.clone());
        state.cancel = Some(token);
        state.handle = Some(tokio::spawn(future));
        Ok(())
    }

    /// Signal cancellation to the current run. Non-blocking and safe to
    /// call repeatedly or with no task running.
    pub fn stop(&self) {
        let state = self.state.lock().expect("lock poisoned");
        if let Some(token) = &state.cancel {
            token.cancel();
        }
    }

    /// Signal cancellation, release the token, and refuse further runs.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        state.disposed = true;
    }

    /// Wait for the current task, if any, to finish.
    pub async fn wait(&self) {
        let handle = self.state.lock().expect("lock poisoned").handle.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether a task is currently running.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
