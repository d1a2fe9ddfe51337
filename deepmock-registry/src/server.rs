//! HTTP listener: accepts connections, routes each request to the admin
//! surface (C10) or, failing that, the mock traffic [`Dispatcher`] (C8).
//!
//! Grounded on `inspiration-fan-pingora-waf`'s `pingora-waf/src/metrics/service.rs`
//! accept loop — `TcpListener::accept` in a loop, `TokioIo::new` +
//! `hyper::server::conn::http1::Builder` per connection, each connection's
//! requests handled by a `service_fn` closure spawned onto its own task.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use tokio::net::TcpListener;

use deepmock_engine::MockRequest;

use crate::admin::AdminHandler;
use crate::dispatcher::{DispatchOutcome, Dispatcher};

pub struct HttpServer {
    admin: Arc<AdminHandler>,
    dispatcher: Arc<Dispatcher>,
}

impl HttpServer {
    pub fn new(admin: Arc<AdminHandler>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { admin, dispatcher }
    }

    /// Binds `addr` and serves connections until the process exits. A bind
    /// failure here is the one fatal error in the taxonomy (SPEC_FULL.md §7)
    /// — the caller should let it propagate and exit the process.
    pub async fn serve(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {addr}");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req).await }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, svc)
                    .await
                {
                    warn!("connection error from {peer}: {e}");
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match self.admin.handle(req).await {
            Ok(admin_response) => Ok(admin_response),
            Err(req) => {
                let mock_request = into_mock_request(req).await;
                Ok(self.dispatch_mock_request(mock_request).await)
            }
        }
    }

    async fn dispatch_mock_request(&self, request: MockRequest) -> Response<Full<Bytes>> {
        match self.dispatcher.dispatch(&request) {
            DispatchOutcome::Rendered(rendered) => {
                let mut builder = Response::builder().status(
                    StatusCode::from_u16(rendered.status_code).unwrap_or(StatusCode::OK),
                );
                for (name, value) in &rendered.header {
                    builder = builder.header(name, value);
                }
                builder
                    .body(Full::new(Bytes::from(rendered.body)))
                    .unwrap_or_else(|e| {
                        error!("failed to build rendered response: {e}");
                        Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Full::new(Bytes::new()))
                            .expect("fallback response always builds")
                    })
            }
            DispatchOutcome::Envelope(envelope) => {
                let body = serde_json::to_vec(&envelope).unwrap_or_else(|_| b"{\"code\":400}".to_vec());
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .expect("building a response from a fixed status/header set never fails")
            }
        }
    }
}

/// Converts a hyper request into the engine's transport-agnostic
/// [`MockRequest`], consuming the body. `header`/`query` keep the first value
/// seen for a repeated key, matching the specification's "first value wins"
/// rule.
pub async fn into_mock_request(req: Request<Incoming>) -> MockRequest {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut header = std::collections::HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            header.entry(name.to_string()).or_insert_with(|| value.to_string());
        }
    }

    let mut query = std::collections::HashMap::new();
    if let Some(raw_query) = req.uri().query() {
        for pair in raw_query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let mut parts = pair.splitn(2, '=');
            let key = deepmock_engine::request::decode_percent(parts.next().unwrap_or_default());
            let value = deepmock_engine::request::decode_percent(parts.next().unwrap_or_default());
            query.entry(key).or_insert(value);
        }
    }

    let body = req
        .collect()
        .await
        .map(|collected| collected.to_bytes().to_vec())
        .unwrap_or_default();

    MockRequest {
        method,
        path,
        header,
        query,
        content_type,
        body,
    }
}
