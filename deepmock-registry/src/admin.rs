//! Admin HTTP Surface (C10): thin REST handlers over the [`RuleRepository`] —
//! CRUD plus bulk export/import. Every response is the [`Envelope`] wire
//! format at HTTP 200; admin writes only touch the repository, the registry
//! converges asynchronously on the reconciler's next tick (SPEC_FULL.md §9).
//!
//! Grounded on `inspiration-fan-pingora-waf`'s `pingora-waf/src/metrics/service.rs`
//! `hyper::service::service_fn` + `Full<Bytes>` handler shape for the HTTP
//! plumbing, and `grpc_server.rs`'s
//! `DataPlaneService` for the "thin handler calling into the shared
//! repository, building a response type" shape — translated from
//! tonic/gRPC service methods to hyper handlers since the admin surface is
//! specified as plain HTTP+JSON, not gRPC.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::api_types::{
    DeleteRuleRequest, Envelope, ExportRulesResponse, ImportRulesRequest, PatchRuleRequest,
};
use crate::repository::RuleRepository;
use deepmock_engine::wire::Rule;

pub struct AdminHandler {
    repository: Arc<dyn RuleRepository>,
}

impl AdminHandler {
    pub fn new(repository: Arc<dyn RuleRepository>) -> Self {
        Self { repository }
    }

    /// Dispatch one admin HTTP request. Returns `Err(req)` — handing the
    /// request back unconsumed — for any path this handler doesn't own, so
    /// the caller can fall through to the mock traffic dispatcher.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Request<Incoming>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let response = match (method.clone(), path.as_str()) {
            (Method::GET, "/api/v1/rules") => self.export_rules().await,
            (Method::POST, "/api/v1/rules") => self.import_rules(req).await,
            (Method::GET, p) if p.starts_with("/api/v1/rule/") => {
                let id = p.trim_start_matches("/api/v1/rule/").to_string();
                self.get_rule(&id).await
            }
            (Method::POST, "/api/v1/rule") => self.create_rule(req).await,
            (Method::PUT, "/api/v1/rule") => self.replace_rule(req).await,
            (Method::PATCH, "/api/v1/rule") => self.patch_rule(req).await,
            (Method::DELETE, "/api/v1/rule") => self.delete_rule(req).await,
            _ => return Err(req),
        };

        Ok(response)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(
        req: Request<Incoming>,
    ) -> Result<T, String> {
        let bytes = req
            .collect()
            .await
            .map_err(|e| format!("failed to read request body: {e}"))?
            .to_bytes();
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))
    }

    async fn export_rules(&self) -> Response<Full<Bytes>> {
        match self.repository.export().await {
            Ok(rules) => envelope_response(Envelope::ok(ExportRulesResponse { rules })),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    async fn import_rules(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: ImportRulesRequest = match Self::body_json(req).await {
            Ok(b) => b,
            Err(e) => return envelope_response(Envelope::<()>::error(e)),
        };
        match self.repository.import(body.rules).await {
            Ok(()) => envelope_response(Envelope::ok_empty()),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    async fn get_rule(&self, id: &str) -> Response<Full<Bytes>> {
        match self.repository.get_rule_by_id(id).await {
            Ok(Some(rule)) => envelope_response(Envelope::ok(rule)),
            Ok(None) => envelope_response(Envelope::<()>::error(format!("rule {id} not found"))),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    async fn create_rule(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let rule: Rule = match Self::body_json(req).await {
            Ok(b) => b,
            Err(e) => return envelope_response(Envelope::<()>::error(e)),
        };
        match self.repository.create_rule(rule).await {
            Ok(created) => envelope_response(Envelope::ok(created)),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    async fn replace_rule(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let rule: Rule = match Self::body_json(req).await {
            Ok(b) => b,
            Err(e) => return envelope_response(Envelope::<()>::error(e)),
        };
        match self.repository.update_rule(rule).await {
            Ok(updated) => envelope_response(Envelope::ok(updated)),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    /// PATCH merges onto the currently stored rule: scalar fields overwrite
    /// when present, `weight` channels merge deeply (handled by
    /// [`deepmock_engine::WeightPicker::patch`] once the merged rule is
    /// recompiled on the next reconciliation tick), and `responses` replaces
    /// the whole array when provided — both settled per the specification's
    /// open questions (SPEC_FULL.md §9, DESIGN.md).
    async fn patch_rule(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let patch: PatchRuleRequest = match Self::body_json(req).await {
            Ok(b) => b,
            Err(e) => return envelope_response(Envelope::<()>::error(e)),
        };

        let existing = match self.repository.get_rule_by_id(&patch.id).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                return envelope_response(Envelope::<()>::error(format!(
                    "rule {} not found",
                    patch.id
                )))
            }
            Err(e) => return envelope_response(Envelope::<()>::error(e.to_string())),
        };

        let merged = apply_patch(existing, patch);
        match self.repository.update_rule(merged).await {
            Ok(updated) => envelope_response(Envelope::ok(updated)),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }

    async fn delete_rule(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let body: DeleteRuleRequest = match Self::body_json(req).await {
            Ok(b) => b,
            Err(e) => return envelope_response(Envelope::<()>::error(e)),
        };
        match self.repository.delete_rule(&body.id).await {
            Ok(()) => envelope_response(Envelope::ok_empty()),
            Err(e) => envelope_response(Envelope::<()>::error(e.to_string())),
        }
    }
}

/// Merge a [`PatchRuleRequest`] onto `existing`. Weight channels merge
/// per-outcome (deep merge); `path`/`method`/`variable` overwrite wholesale
/// when present; `responses` replaces the whole array when present.
fn apply_patch(mut existing: Rule, patch: PatchRuleRequest) -> Rule {
    existing.version = patch.version;
    if let Some(path) = patch.path {
        existing.path = path;
    }
    if let Some(method) = patch.method {
        existing.method = method;
    }
    if let Some(variable) = patch.variable {
        existing.variable = Some(variable);
    }
    if let Some(patch_weight) = patch.weight {
        let mut merged = existing.weight.unwrap_or_default();
        for (channel, outcomes) in patch_weight {
            let entry = merged.entry(channel).or_default();
            for (outcome, weight) in outcomes {
                entry.insert(outcome, weight);
            }
        }
        existing.weight = Some(merged);
    }
    if let Some(responses) = patch.responses {
        existing.responses = responses;
    }
    existing
}

fn envelope_response<T: Serialize>(envelope: Envelope<T>) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&envelope).unwrap_or_else(|_| b"{\"code\":400}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("building a response from a fixed status/header set never fails")
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepmock_engine::wire::{Regulation, Template, Weight};

    fn base_rule() -> Rule {
        Rule {
            id: Some("irrelevant".to_string()),
            path: "/ping".to_string(),
            method: "GET".to_string(),
            variable: None,
            weight: Some(Weight::from([(
                "outcome".to_string(),
                std::collections::HashMap::from([
                    ("success".to_string(), 3u64),
                    ("failure".to_string(), 1u64),
                ]),
            )])),
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
    fn patch_merges_weight_channel_deeply() {
        let patch = PatchRuleRequest {
            id: "x".to_string(),
            version: 1,
            path: None,
            method: None,
            variable: None,
            weight: Some(Weight::from([(
                "outcome".to_string(),
                std::collections::HashMap::from([("failure".to_string(), 5u64)]),
            )])),
            responses: None,
        };
        let merged = apply_patch(base_rule(), patch);
        let outcome = &merged.weight.unwrap()["outcome"];
        assert_eq!(outcome.get("success"), Some(&3));
        assert_eq!(outcome.get("failure"), Some(&5));
    }

    #[test]
    fn patch_replaces_responses_wholesale() {
        let patch = PatchRuleRequest {
            id: "x".to_string(),
            version: 1,
            path: None,
            method: None,
            variable: None,
            weight: None,
            responses: Some(vec![
                Regulation {
                    is_default: true,
                    filter: None,
                    response: Template {
                        body: Some("new".to_string()),
                        ..Default::default()
                    },
                },
            ]),
        };
        let merged = apply_patch(base_rule(), patch);
        assert_eq!(merged.responses.len(), 1);
        assert_eq!(merged.responses[0].response.body.as_deref(), Some("new"));
    }
}
