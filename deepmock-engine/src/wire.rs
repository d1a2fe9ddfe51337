//! Wire-format (persisted / JSON) shapes. These are the declarative documents an
//! admin API call or a repository row carries; [`crate::compiler::compile_rule`]
//! turns them into a [`crate::Executor`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for one sub-filter, keyed by mode-specific field name plus the
/// arbitrary `key -> value` pairs used by `exact`/`keyword`/`regular`.
pub type FilterParams = HashMap<String, String>;

/// `{ header?, query?, body? }`; each absent sub-filter compiles to `always_true`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<FilterParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<FilterParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<FilterParams>,
}

/// `{ outcome -> weight }` for one named channel.
pub type WeightFactor = HashMap<String, u64>;

/// `{ channel -> { outcome -> weight } }`.
pub type Weight = HashMap<String, WeightFactor>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_header_template: bool,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(
        default,
        rename = "base64encoded_body",
        skip_serializing_if = "Option::is_none"
    )]
    pub b64_body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Regulation {
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    pub response: Template,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Weight>,
    pub responses: Vec<Regulation>,
    #[serde(default)]
    pub version: i64,
}
