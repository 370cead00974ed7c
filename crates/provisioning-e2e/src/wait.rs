//! # Readiness Watch/Wait Engine
//!
//! Subscribes to change events for one resource and blocks until a predicate
//! over the observed object holds or a deadline passes. This is the only
//! place the harness suspends on the system under test.
//!
//! Events are handed to the predicate in the order they arrive. Nothing is
//! reordered or de-duplicated, so predicates must tolerate seeing the same
//! state more than once.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Server-side watch timeout ceiling; the API server rejects 295s and above.
/// Longer waits are covered by the watcher re-establishing the watch.
pub const MAX_SERVER_WATCH_SECS: u32 = 290;

/// A change observed on the watched resource
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> ChangeEvent<K> {
    #[must_use]
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Field selector narrowing a watch, e.g. `metadata.name=<cluster-name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSelector {
    fields: String,
}

impl WatchSelector {
    /// Select a single object by name
    #[must_use]
    pub fn name(name: &str) -> Self {
        Self {
            fields: format!("metadata.name={name}"),
        }
    }

    #[must_use]
    pub fn fields(fields: impl Into<String>) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.fields
    }
}

impl fmt::Display for WatchSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("Timed out after {elapsed:?} waiting on {selector} ({events} event(s) observed{})", last_error_suffix(.last_error))]
    Timeout {
        selector: String,
        elapsed: Duration,
        events: usize,
        last_error: Option<String>,
    },

    #[error("Watch on {selector} closed after {events} event(s) without the condition being met")]
    StreamClosed { selector: String, events: usize },

    /// A transient watch failure; reported through the stream, never returned
    /// by `wait_until` on its own
    #[error("Watch on {selector} failed: {message}")]
    Stream { selector: String, message: String },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(", last watch error: {e}"))
        .unwrap_or_default()
}

impl WaitError {
    /// Both a passed deadline and a closed stream count as "never converged"
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::StreamClosed { .. })
    }
}

/// Change events for one selector, bounded by a deadline
pub struct EventStream<K> {
    selector: String,
    timeout: Duration,
    deadline: Instant,
    events: BoxStream<'static, Result<ChangeEvent<K>, WaitError>>,
}

impl<K> fmt::Debug for EventStream<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("selector", &self.selector)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<K: Send + 'static> EventStream<K> {
    /// Wrap any event source. The deadline starts now.
    pub fn new<S>(selector: &WatchSelector, timeout: Duration, events: S) -> Self
    where
        S: Stream<Item = Result<ChangeEvent<K>, WaitError>> + Send + 'static,
    {
        Self {
            selector: selector.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            events: events.boxed(),
        }
    }
}

/// Open a watch on the objects of `api` matching `selector`.
///
/// The watch is re-established transparently until `timeout` elapses; watch
/// errors are retried with backoff and surface as `WaitError::Stream` items.
pub fn watch<K>(api: Api<K>, selector: &WatchSelector, timeout: Duration) -> EventStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let server_timeout = u32::try_from(timeout.as_secs())
        .unwrap_or(u32::MAX)
        .clamp(1, MAX_SERVER_WATCH_SECS);
    let config = watcher::Config::default()
        .fields(selector.as_str())
        .timeout(server_timeout);

    debug!(selector = %selector, timeout = ?timeout, server_timeout, "Opening watch");

    let label = selector.to_string();
    let events = watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let label = label.clone();
            async move {
                match event {
                    Ok(watcher::Event::InitApply(obj)) => Some(Ok(ChangeEvent::Added(obj))),
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(ChangeEvent::Modified(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(ChangeEvent::Deleted(obj))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(WaitError::Stream {
                        selector: label,
                        message: e.to_string(),
                    })),
                }
            }
        });

    EventStream::new(selector, timeout, events)
}

/// Consume `stream` until `predicate` holds for an added or modified object.
///
/// Returns the first satisfying object. Deleted objects are never offered to
/// the predicate. The stream is dropped on every return path, so a timeout
/// releases the underlying watch.
pub async fn wait_until<K, P>(stream: EventStream<K>, mut predicate: P) -> Result<K, WaitError>
where
    P: FnMut(&K) -> bool,
{
    let EventStream {
        selector,
        timeout,
        deadline,
        mut events,
    } = stream;
    let started = Instant::now();
    let mut observed = 0_usize;
    let mut last_error: Option<String> = None;

    let outcome = tokio::time::timeout_at(deadline, async {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    observed += 1;
                    debug!(selector = %selector, event = event.kind(), observed, "Observed change event");
                    match event {
                        ChangeEvent::Added(obj) | ChangeEvent::Modified(obj) => {
                            if predicate(&obj) {
                                return Some(obj);
                            }
                        }
                        ChangeEvent::Deleted(_) => {
                            warn!(selector = %selector, "Watched object was deleted while waiting");
                        }
                    }
                }
                Err(e) => {
                    warn!(selector = %selector, error = %e, "Watch error, retrying");
                    last_error = Some(e.to_string());
                }
            }
        }
        None
    })
    .await;
    drop(events);

    match outcome {
        Ok(Some(obj)) => {
            info!(
                selector = %selector,
                observed,
                elapsed = ?started.elapsed(),
                "Wait condition satisfied"
            );
            Ok(obj)
        }
        Ok(None) => Err(WaitError::StreamClosed {
            selector,
            events: observed,
        }),
        Err(_) => {
            warn!(selector = %selector, timeout = ?timeout, observed, "Wait deadline elapsed");
            Err(WaitError::Timeout {
                selector,
                elapsed: started.elapsed(),
                events: observed,
                last_error,
            })
        }
    }
}
