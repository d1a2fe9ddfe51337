//! Request Dispatcher (C8): the entry point for mock traffic. Locates the
//! executor, invokes it, and surfaces every failure mode as the envelope
//! format the admin wire also uses — `code = 400` is the *application*-level
//! error code, not the HTTP status; the transport layer always returns 200
//! for these envelopes, matching the admin surface's wire compatibility
//! contract.
//!
//! Grounded on `enforcement_engine.rs`'s fail-closed dispatch loop (there:
//! iterate rules, block on first deny; here: look up one executor, envelope
//! on first miss).

use std::sync::atomic::{AtomicU64, Ordering};

use deepmock_engine::{MockRequest, RenderedResponse};

use crate::api_types::Envelope;
use crate::registry::ExecutorRegistry;

/// What the dispatcher produced for one request: either a rendered mock
/// response, or an always-200 envelope describing why none could be produced.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Rendered(RenderedResponse),
    Envelope(Envelope<()>),
}

pub struct Dispatcher {
    registry: std::sync::Arc<ExecutorRegistry>,
    request_count: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: std::sync::Arc<ExecutorRegistry>) -> Self {
        Self {
            registry,
            request_count: AtomicU64::new(0),
        }
    }

    /// Total requests dispatched since process start. Observability only —
    /// never gates behavior.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn dispatch(&self, request: &MockRequest) -> DispatchOutcome {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let Some(executor) = self.registry.find(&request.method, &request.path) else {
            return DispatchOutcome::Envelope(Envelope::error("no rule match your request"));
        };

        let Some(regulation) = executor.select_regulation(request) else {
            return DispatchOutcome::Envelope(Envelope::error(
                "missing matched response regulation",
            ));
        };

        match executor.render(regulation, request) {
            Ok(response) => DispatchOutcome::Rendered(response),
            Err(e) => DispatchOutcome::Envelope(Envelope::error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepmock_engine::compile_rule;
    use deepmock_engine::wire::{Regulation, Rule, Template};
    use std::sync::Arc;

    fn ping_rule() -> Rule {
        Rule {
            id: None,
            path: "/api/v[0-9]+/ping".to_string(),
            method: "GET".to_string(),
            variable: None,
            weight: None,
            responses: vec![Regulation {
                is_default: true,
                filter: None,
                response: Template {
                    body: Some("pong".to_string()),
                    ..Default::default()
                },
            }],
            version: 1,
        }
    }

    #[test]
    fn dispatch_renders_matching_request() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry.import_all(vec![compile_rule(&ping_rule()).unwrap()]);
        let dispatcher = Dispatcher::new(registry);

        let request = MockRequest::new("GET", "/api/v10/ping");
        match dispatcher.dispatch(&request) {
            DispatchOutcome::Rendered(response) => assert_eq!(response.body, b"pong"),
            DispatchOutcome::Envelope(_) => panic!("expected a rendered response"),
        }
        assert_eq!(dispatcher.request_count(), 1);
    }

    #[test]
    fn dispatch_envelopes_no_match() {
        let registry = Arc::new(ExecutorRegistry::new());
        registry.import_all(vec![compile_rule(&ping_rule()).unwrap()]);
        let dispatcher = Dispatcher::new(registry);

        let request = MockRequest::new("GET", "/api/va/ping");
        match dispatcher.dispatch(&request) {
            DispatchOutcome::Envelope(envelope) => {
                assert_eq!(envelope.code, 400);
                assert_eq!(envelope.err_msg.as_deref(), Some("no rule match your request"));
            }
            DispatchOutcome::Rendered(_) => panic!("expected an envelope"),
        }
    }
}
