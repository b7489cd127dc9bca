//! Scripted consumer handlers.

use composable_outbox_core::{ConsumerHandler, HandlerError, HandlerFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a [`ScriptedHandler`] does when invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Always succeed
    Succeed,
    /// Always fail with this reason
    Fail(String),
    /// Fail the first `n` invocations, then succeed
    FailTimes(usize),
    /// Panic on every invocation
    Panic,
    /// Sleep before succeeding
    Delay(Duration),
}

#[derive(Debug)]
struct Inner {
    script: Mutex<Script>,
    invocations: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

/// Consumer handler that follows a [`Script`] and records every call.
///
/// Clones share their counters, so a test can register one clone and assert on
/// another.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    inner: Arc<Inner>,
}

impl ScriptedHandler {
    /// Create a handler following `script`.
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script),
                invocations: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A handler that always succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new(Script::Succeed)
    }

    /// A handler that always fails with `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(Script::Fail(reason.into()))
    }

    /// A handler that fails `times` times, then succeeds.
    #[must_use]
    pub fn failing_times(times: usize) -> Self {
        Self::new(Script::FailTimes(times))
    }

    /// A handler that panics.
    #[must_use]
    pub fn panicking() -> Self {
        Self::new(Script::Panic)
    }

    /// A handler that sleeps for `delay`, then succeeds.
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self::new(Script::Delay(delay))
    }

    /// Change the script for subsequent invocations.
    pub fn set_script(&self, script: Script) {
        *self.inner.script.lock().unwrap() = script;
    }

    /// Number of times the handler has been invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    /// Every `(message_type, content)` the handler was invoked with, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.inner.calls.lock().unwrap().clone()
    }
}

impl ConsumerHandler for ScriptedHandler {
    #[allow(clippy::panic)] // Script::Panic exists to exercise panic containment
    fn handle<'a>(&'a self, message_type: &'a str, content: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move {
            let attempt = self.inner.invocations.fetch_add(1, Ordering::SeqCst);
            self.inner
                .calls
                .lock()
                .unwrap()
                .push((message_type.to_string(), content.to_string()));

            let script = self.inner.script.lock().unwrap().clone();
            match script {
                Script::Succeed => Ok(()),
                Script::Fail(reason) => Err(HandlerError::Failed(reason)),
                Script::FailTimes(times) if attempt < times => {
                    Err(HandlerError::Failed(format!("scripted failure {}", attempt + 1)))
                }
                Script::FailTimes(_) => Ok(()),
                Script::Panic => panic!("scripted panic in {message_type} handler"),
                Script::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            }
        })
    }
}
