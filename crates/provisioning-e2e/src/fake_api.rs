//! Scripted API server for unit tests.
//!
//! Every request goes through a handler that picks the reply; each call is
//! recorded as `METHOD /path` so tests can assert what was sent and in which
//! order.

use http::{Method, Request, Response, StatusCode, Uri};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

/// What the fake server answers with
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    status: StatusCode,
    body: String,
}

impl Reply {
    pub(crate) fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.to_string(),
        }
    }

    pub(crate) fn created(body: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            body: body.to_string(),
        }
    }

    /// A failed `Status` with the given code
    pub(crate) fn error(code: u16, reason: &str) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap(),
            body: json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": format!("scripted {reason}"),
                "reason": reason,
                "code": code
            })
            .to_string(),
        }
    }

    pub(crate) fn deleted() -> Self {
        Self::ok(json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Success",
            "code": 200
        }))
    }

    pub(crate) fn list(api_version: &str, kind: &str, items: Vec<Value>) -> Self {
        Self::ok(json!({
            "apiVersion": api_version,
            "kind": format!("{kind}List"),
            "metadata": {"resourceVersion": "1"},
            "items": items
        }))
    }

    /// A watch response carrying `MODIFIED` events, one JSON object per line
    pub(crate) fn watch_modified(objects: Vec<Value>) -> Self {
        let body = objects
            .into_iter()
            .map(|object| format!("{}\n", json!({"type": "MODIFIED", "object": object})))
            .collect();
        Self {
            status: StatusCode::OK,
            body,
        }
    }
}

/// Calls seen by the fake server, in arrival order
#[derive(Debug, Clone, Default)]
pub(crate) struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub(crate) fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }
}

pub(crate) fn is_watch(uri: &Uri) -> bool {
    uri.query().is_some_and(|q| q.split('&').any(|p| p == "watch=true"))
}

/// A client whose requests are answered by `handler`
pub(crate) fn fake_client<F>(handler: F) -> (Client, Calls)
where
    F: Fn(&Method, &Uri) -> Reply + Send + 'static,
{
    let calls = Calls::default();
    let recorded = calls.clone();
    let service = tower::service_fn(move |request: Request<Body>| {
        let reply = handler(request.method(), request.uri());
        recorded.push(format!("{} {}", request.method(), request.uri().path()));
        async move {
            Ok::<_, Infallible>(
                Response::builder()
                    .status(reply.status)
                    .header("content-type", "application/json")
                    .body(Body::from(reply.body.into_bytes()))
                    .unwrap(),
            )
        }
    });
    (Client::new(service, "default"), calls)
}
