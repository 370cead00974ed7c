//! # Resource Session
//!
//! Tracks every external resource a test creates as a stack of async cleanup
//! actions. Draining runs the stack in reverse registration order, runs every
//! action exactly once and collects failures instead of stopping at the first.

use crate::error::HarnessError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct CleanupAction {
    label: String,
    run: CleanupFn,
}

/// A single cleanup action that failed or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Label the action was registered under
    pub label: String,
    /// Rendered error chain or panic payload
    pub message: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.message)
    }
}

/// Every failure collected while draining one session
#[derive(Error, Debug, Clone)]
#[error(
    "{count} cleanup action(s) failed in session {session}: {summary}",
    count = .failures.len(),
    summary = summarize(.failures)
)]
pub struct CleanupError {
    pub session: String,
    pub failures: Vec<CleanupFailure>,
}

fn summarize(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

struct SessionInner {
    name: String,
    actions: Mutex<Vec<CleanupAction>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let pending = self
            .actions
            .get_mut()
            .map_or_else(|poisoned| poisoned.into_inner().len(), |actions| actions.len());
        if pending > 0 {
            warn!(
                session = %self.name,
                pending,
                "Session dropped without cleanup; resources may leak"
            );
        }
    }
}

/// Ordered stack of cleanup actions owning the resources of a test or sub-test.
///
/// Clones share the same stack, so a session can be handed to concurrent tasks
/// that each register their own resources.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Session {
    /// Create a new, empty session
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(session = %name, "Opened session");
        Self {
            inner: Arc::new(SessionInner {
                name,
                actions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Session name, used in logs and error reports
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of cleanup actions still waiting to run
    #[must_use]
    pub fn pending(&self) -> usize {
        self.actions().len()
    }

    /// Create a child session whose drain is registered on this one.
    ///
    /// Anything the child owns is released before the actions this session
    /// registered earlier. Draining the child explicitly first is fine; the
    /// parent's later drain of it is then a no-op.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let child = Self::new(format!("{}/{}", self.inner.name, name.into()));
        let handle = child.clone();
        self.defer(format!("session {}", child.name()), move || async move {
            handle.cleanup().await.map_err(anyhow::Error::from)
        });
        child
    }

    /// Register a cleanup action. Actions run in reverse registration order.
    pub fn defer<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(session = %self.inner.name, action = %label, "Registered cleanup action");
        self.actions().push(CleanupAction {
            label,
            run: Box::new(move || action().boxed()),
        });
    }

    /// Drain the stack, running every action exactly once.
    ///
    /// A failing or panicking action is recorded and the drain continues with
    /// the next one. Actions registered while draining are drained as well.
    pub async fn cleanup(&self) -> Result<(), CleanupError> {
        let mut failures = Vec::new();
        let mut ran = 0_usize;

        loop {
            let next = self.actions().pop();
            let Some(action) = next else {
                break;
            };
            ran += 1;

            let CleanupAction { label, run } = action;
            let outcome = AssertUnwindSafe(async move { run().await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(session = %self.inner.name, action = %label, "Cleanup action completed");
                }
                Ok(Err(e)) => {
                    warn!(
                        session = %self.inner.name,
                        action = %label,
                        error = %format!("{e:#}"),
                        "Cleanup action failed"
                    );
                    failures.push(CleanupFailure {
                        label,
                        message: format!("{e:#}"),
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        session = %self.inner.name,
                        action = %label,
                        panic = %message,
                        "Cleanup action panicked"
                    );
                    failures.push(CleanupFailure {
                        label,
                        message: format!("panicked: {message}"),
                    });
                }
            }
        }

        if ran > 0 {
            info!(
                session = %self.inner.name,
                actions = ran,
                failed = failures.len(),
                "Session drained"
            );
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError {
                session: self.inner.name.clone(),
                failures,
            })
        }
    }

    /// Run `body` with this session and always drain it afterwards.
    ///
    /// The drain happens whether the body returns `Ok`, returns `Err` or
    /// panics. A panic is resumed once cleanup has finished.
    pub async fn scope<T, F, Fut>(self, body: F) -> crate::Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let session = self.clone();
        let outcome = AssertUnwindSafe(async move { body(session).await })
            .catch_unwind()
            .await;
        let cleanup = self.cleanup().await;

        match (outcome, cleanup) {
            (Err(panic), cleanup) => {
                if let Err(e) = cleanup {
                    error!(session = %self.inner.name, error = %e, "Cleanup failed after panic");
                }
                std::panic::resume_unwind(panic)
            }
            (Ok(Ok(value)), Ok(())) => Ok(value),
            (Ok(Ok(_)), Err(cleanup)) => Err(HarnessError::Cleanup(cleanup)),
            (Ok(Err(primary)), Ok(())) => Err(primary),
            (Ok(Err(primary)), Err(cleanup)) => Err(HarnessError::CleanupAfterFailure {
                primary: Box::new(primary),
                cleanup,
            }),
        }
    }

    fn actions(&self) -> MutexGuard<'_, Vec<CleanupAction>> {
        self.inner
            .actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_empty_session_drains_cleanly() {
        let session = Session::new("empty");
        assert_eq!(session.pending(), 0);
        assert!(session.cleanup().await.is_ok());
    }

    #[tokio::test]
    async fn test_second_cleanup_is_noop() {
        let session = Session::new("twice");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        session.defer("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        session.cleanup().await.unwrap();
        session.cleanup().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_cleanup_error_display_lists_failures() {
        let err = CleanupError {
            session: "s".to_string(),
            failures: vec![
                CleanupFailure {
                    label: "delete cluster".to_string(),
                    message: "boom".to_string(),
                },
                CleanupFailure {
                    label: "delete pod".to_string(),
                    message: "gone".to_string(),
                },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("2 cleanup action(s) failed in session s"));
        assert!(rendered.contains("delete cluster: boom; delete pod: gone"));
    }
}
