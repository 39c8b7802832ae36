//! Pipeline shutdown signalling.
//!
//! The plugin is the sole owner of one [`ShutdownSignal`]; every downstream
//! component only reads it. Requesting shutdown is idempotent and safe from
//! any task: the first request wins, records the error, fires the
//! termination callback, and wakes every waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::info;

/// The error a pipeline terminates with, shared across tasks.
pub type PipelineError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Invoked exactly once, on the first shutdown request, with the error that
/// caused it (`None` for an orderly stop).
pub type ShutdownCallback = Box<dyn FnOnce(Option<PipelineError>) + Send>;

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    terminating: AtomicBool,
    error: Mutex<Option<PipelineError>>,
    callback: Mutex<Option<ShutdownCallback>>,
    notify: watch::Sender<bool>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

impl ShutdownSignal {
    pub fn new(callback: Option<ShutdownCallback>) -> Self {
        let (notify, _) = watch::channel(false);
        ShutdownSignal {
            inner: Arc::new(Inner {
                terminating: AtomicBool::new(false),
                error: Mutex::new(None),
                callback: Mutex::new(callback),
                notify,
            }),
        }
    }

    /// Requests shutdown. Only the first call has any effect.
    pub fn shutdown(&self, error: Option<PipelineError>) {
        if self
            .inner
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match &error {
            Some(error) => info!(message = "Shutting down pipeline.", %error),
            None => info!(message = "Shutting down pipeline."),
        }

        *self.inner.error.lock().expect("shutdown error lock poisoned") = error.clone();
        let callback = self
            .inner
            .callback
            .lock()
            .expect("shutdown callback lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback(error);
        }
        let _ = self.inner.notify.send(true);
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.terminating.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<PipelineError> {
        self.inner
            .error
            .lock()
            .expect("shutdown error lock poisoned")
            .clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.notify.subscribe();
        if *receiver.borrow() {
            return;
        }
        // An Err means the sender dropped, which cannot outlive `self`.
        let _ = receiver.changed().await;
    }
}
