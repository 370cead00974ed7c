//! Watch/Wait Engine Tests
//!
//! Drives `wait_until` with synthetic event streams: first match wins,
//! duplicates and deletions are tolerated, and a timeout releases the stream.
//!
//! Run with:
//! ```sh
//! cargo test -p provisioning-e2e --test wait_tests
//! ```

#![allow(clippy::doc_markdown)]

use futures::stream::{self, Stream, StreamExt};
use provisioning_e2e::{wait_until, ChangeEvent, EventStream, WaitError, WatchSelector};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Phase {
    generation: u32,
    ready: bool,
}

fn phase(generation: u32, ready: bool) -> Phase {
    Phase { generation, ready }
}

fn selector() -> WatchSelector {
    WatchSelector::name("test-cluster-abcde")
}

/// Never yields; flips `dropped` when released
struct PendingForever {
    dropped: Arc<AtomicBool>,
}

impl Stream for PendingForever {
    type Item = Result<ChangeEvent<Phase>, WaitError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

impl Drop for PendingForever {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn returns_first_object_satisfying_predicate() {
    let events = stream::iter(vec![
        Ok(ChangeEvent::Added(phase(1, false))),
        Ok(ChangeEvent::Modified(phase(2, true))),
        Ok(ChangeEvent::Modified(phase(3, true))),
    ]);

    let found = wait_until(
        EventStream::new(&selector(), Duration::from_secs(5), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap();

    assert_eq!(found, phase(2, true));
}

#[tokio::test]
async fn duplicate_events_are_tolerated() {
    let mut seen = 0;
    let events = stream::iter(vec![
        Ok(ChangeEvent::Modified(phase(1, false))),
        Ok(ChangeEvent::Modified(phase(1, false))),
        Ok(ChangeEvent::Modified(phase(1, false))),
        Ok(ChangeEvent::Modified(phase(1, true))),
    ]);

    let found = wait_until(
        EventStream::new(&selector(), Duration::from_secs(5), events),
        |p: &Phase| {
            seen += 1;
            p.ready
        },
    )
    .await
    .unwrap();

    assert!(found.ready);
    assert_eq!(seen, 4);
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_the_stream() {
    let dropped = Arc::new(AtomicBool::new(false));
    let events = PendingForever {
        dropped: dropped.clone(),
    };

    let err = wait_until(
        EventStream::new(&selector(), Duration::from_secs(1800), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap_err();

    match &err {
        WaitError::Timeout {
            selector, events, last_error, ..
        } => {
            assert_eq!(selector, "metadata.name=test-cluster-abcde");
            assert_eq!(*events, 0);
            assert!(last_error.is_none());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.is_timeout());
    assert!(dropped.load(Ordering::SeqCst), "watch stream was not released");
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_events_seen_before_the_deadline() {
    let events = stream::iter(vec![
        Ok(ChangeEvent::Added(phase(1, false))),
        Ok(ChangeEvent::Modified(phase(2, false))),
    ])
    .chain(stream::pending());

    let err = wait_until(
        EventStream::new(&selector(), Duration::from_secs(300), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, WaitError::Timeout { events: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn stream_errors_are_retried_and_reported_on_timeout() {
    let events = stream::iter(vec![
        Err(WaitError::Stream {
            selector: selector().to_string(),
            message: "410 Gone: too old resource version".to_string(),
        }),
        Ok(ChangeEvent::Modified(phase(1, false))),
        Err(WaitError::Stream {
            selector: selector().to_string(),
            message: "connection reset".to_string(),
        }),
    ])
    .chain(stream::pending());

    let err = wait_until(
        EventStream::new(&selector(), Duration::from_secs(60), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap_err();

    match err {
        WaitError::Timeout {
            events, last_error, ..
        } => {
            assert_eq!(events, 1);
            assert_eq!(
                last_error.as_deref(),
                Some("Watch on metadata.name=test-cluster-abcde failed: connection reset")
            );
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_error_does_not_end_the_wait() {
    let events = stream::iter(vec![
        Err(WaitError::Stream {
            selector: selector().to_string(),
            message: "connection reset".to_string(),
        }),
        Ok(ChangeEvent::Modified(phase(4, true))),
    ]);

    let found = wait_until(
        EventStream::new(&selector(), Duration::from_secs(5), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap();

    assert_eq!(found.generation, 4);
}

#[tokio::test]
async fn closed_stream_without_match_is_timeout_class() {
    let events = stream::iter(vec![
        Ok(ChangeEvent::Added(phase(1, false))),
        Ok(ChangeEvent::Deleted(phase(1, true))),
    ]);

    let err = wait_until(
        EventStream::new(&selector(), Duration::from_secs(5), events),
        |p: &Phase| p.ready,
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        WaitError::StreamClosed {
            selector: "metadata.name=test-cluster-abcde".to_string(),
            events: 2,
        }
    );
    assert!(err.is_timeout());
}

#[test]
fn change_event_accessors() {
    let event = ChangeEvent::Deleted(phase(9, true));
    assert_eq!(event.kind(), "deleted");
    assert_eq!(event.object().generation, 9);
    assert_eq!(ChangeEvent::Added(1).kind(), "added");
    assert_eq!(ChangeEvent::Modified(1).kind(), "modified");
}
