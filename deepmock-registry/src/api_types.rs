//! Admin wire-format shapes: the always-200 `{code, data?, err_msg?}` envelope
//! and the request/response bodies the admin REST surface (C10) speaks.
//!
//! Grounded on the teacher's `IntentEvent`/`ComparisonResult` wire-struct +
//! roundtrip-test idiom (field-by-field `serde` structs, a roundtrip test per
//! type) — the shapes themselves come from the specification's §6/§7, which
//! this crate's admin surface is the only thing that needs to see.

use serde::{Deserialize, Serialize};

use deepmock_engine::wire::Rule;

/// The admin wire format's universal response envelope. HTTP status is always
/// 200; `code` carries the logical status (`200` success, `400` failure).
/// Preserved verbatim for client compatibility — not "fixed" to map onto HTTP
/// statuses (SPEC_FULL.md §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            data: Some(data),
            err_msg: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            data: None,
            err_msg: Some(message.into()),
        }
    }
}

impl Envelope<()> {
    pub fn ok_empty() -> Self {
        Self {
            code: 200,
            data: None,
            err_msg: None,
        }
    }
}

/// `POST /api/v1/rule` and `PUT /api/v1/rule` request body.
pub type CreateOrReplaceRuleRequest = Rule;

/// `PATCH /api/v1/rule` request body: a partial rule merged onto the stored
/// one. `id` is required to locate the target; all other fields are
/// optional-overwrite except `responses`, which (per the specification's open
/// question resolution) replaces the whole array when present rather than
/// merging element-wise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchRuleRequest {
    pub id: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<std::collections::HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<deepmock_engine::wire::Weight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<deepmock_engine::wire::Regulation>>,
}

/// `DELETE /api/v1/rule` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteRuleRequest {
    pub id: String,
}

/// `POST /api/v1/rules` (import-replace) request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportRulesRequest {
    pub rules: Vec<Rule>,
}

/// `GET /api/v1/rules` (export) response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRulesResponse {
    pub rules: Vec<Rule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_has_no_err_msg_field() {
        let envelope = Envelope::ok(42);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({ "code": 200, "data": 42 }));
    }

    #[test]
    fn error_envelope_has_no_data_field() {
        let envelope: Envelope<()> = Envelope::error("no rule match your request");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({ "code": 400, "err_msg": "no rule match your request" })
        );
    }

    #[test]
    fn patch_request_roundtrips_through_json() {
        let value = json!({
            "id": "abc123",
            "version": 3,
            "weight": {"outcome": {"failure": 2}}
        });
        let patch: PatchRuleRequest = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(patch.id, "abc123");
        assert!(patch.path.is_none());
        let back = serde_json::to_value(&patch).unwrap();
        let reparsed: PatchRuleRequest = serde_json::from_value(back).unwrap();
        assert_eq!(patch, reparsed);
    }
}
