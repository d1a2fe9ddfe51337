//! Compiled request filters (C1). Each sub-filter compiles once, at rule-compile
//! time, from its wire-format parameter map; matching at serve time never compiles
//! a regex or allocates beyond the match itself.

use std::collections::HashMap;

use regex::bytes::Regex as BytesRegex;
use thiserror::Error;

use crate::request::MockRequest;
use crate::wire::{Filter as WireFilter, FilterParams};

pub const MODE_FIELD: &str = "mode";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    AlwaysTrue,
    Exact,
    Keyword,
    Regular,
    /// Present but not one of the four recognized modes. Compiles successfully
    /// (the rule is not rejected for it) but never matches at serve time — the
    /// source logs a warning and returns false rather than failing compilation.
    Unknown(String),
}

impl FilterMode {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => FilterMode::AlwaysTrue,
            Some("exact") => FilterMode::Exact,
            Some("keyword") => FilterMode::Keyword,
            Some("regular") => FilterMode::Regular,
            Some(other) => FilterMode::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterCompileError {
    #[error("failed to compile regular expression {pattern:?} for key {key:?}: {source}")]
    BadRegex {
        key: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("body filter in regular mode is missing the required 'regular' parameter")]
    MissingBodyRegular,
    #[error("body filter in keyword mode is missing the required 'keyword' parameter")]
    MissingBodyKeyword,
}

/// Split a raw parameter map into its `mode` and the remaining key/value pairs,
/// exactly as the source does: "mode is extracted first; remaining keys become
/// the parameter set."
fn split_mode(params: Option<&FilterParams>) -> (FilterMode, FilterParams) {
    match params {
        None => (FilterMode::AlwaysTrue, FilterParams::new()),
        Some(params) => {
            let mode = FilterMode::parse(params.get(MODE_FIELD).map(String::as_str));
            let mut rest = params.clone();
            rest.remove(MODE_FIELD);
            (mode, rest)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeaderFilter {
    mode: Option<FilterModeInner>,
}

#[derive(Debug, Clone)]
enum FilterModeInner {
    AlwaysTrue,
    Exact(FilterParams),
    Keyword(FilterParams),
    Regular(HashMap<String, BytesRegex>),
    Unknown(String),
}

impl HeaderFilter {
    pub fn compile(params: Option<&FilterParams>) -> Result<Self, FilterCompileError> {
        let (mode, rest) = split_mode(params);
        let inner = match mode {
            FilterMode::AlwaysTrue => FilterModeInner::AlwaysTrue,
            FilterMode::Exact => FilterModeInner::Exact(rest),
            FilterMode::Keyword => FilterModeInner::Keyword(rest),
            FilterMode::Regular => {
                let mut regulars = HashMap::with_capacity(rest.len());
                for (key, pattern) in rest {
                    let compiled = BytesRegex::new(&pattern).map_err(|source| {
                        FilterCompileError::BadRegex {
                            key: key.clone(),
                            pattern: pattern.clone(),
                            source,
                        }
                    })?;
                    regulars.insert(key, compiled);
                }
                FilterModeInner::Regular(regulars)
            }
            FilterMode::Unknown(name) => FilterModeInner::Unknown(name),
        };
        Ok(Self { mode: Some(inner) })
    }

    pub fn passes(&self, req: &MockRequest) -> bool {
        match self.mode.as_ref() {
            None | Some(FilterModeInner::AlwaysTrue) => true,
            Some(FilterModeInner::Exact(params)) => params
                .iter()
                .all(|(k, v)| req.header_value(k) == v.as_str()),
            Some(FilterModeInner::Keyword(params)) => params
                .iter()
                .all(|(k, v)| req.header_value(k).contains(v.as_str())),
            Some(FilterModeInner::Regular(regulars)) => regulars
                .iter()
                .all(|(k, re)| re.is_match(req.header_value(k).as_bytes())),
            Some(FilterModeInner::Unknown(name)) => {
                log::warn!("found unsupported filter mode {name:?} in header filter");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    mode: Option<FilterModeInner>,
}

impl QueryFilter {
    pub fn compile(params: Option<&FilterParams>) -> Result<Self, FilterCompileError> {
        let (mode, rest) = split_mode(params);
        let inner = match mode {
            FilterMode::AlwaysTrue => FilterModeInner::AlwaysTrue,
            FilterMode::Exact => FilterModeInner::Exact(rest),
            FilterMode::Keyword => FilterModeInner::Keyword(rest),
            FilterMode::Regular => {
                let mut regulars = HashMap::with_capacity(rest.len());
                for (key, pattern) in rest {
                    let compiled = BytesRegex::new(&pattern).map_err(|source| {
                        FilterCompileError::BadRegex {
                            key: key.clone(),
                            pattern: pattern.clone(),
                            source,
                        }
                    })?;
                    regulars.insert(key, compiled);
                }
                FilterModeInner::Regular(regulars)
            }
            FilterMode::Unknown(name) => FilterModeInner::Unknown(name),
        };
        Ok(Self { mode: Some(inner) })
    }

    pub fn passes(&self, req: &MockRequest) -> bool {
        match self.mode.as_ref() {
            None | Some(FilterModeInner::AlwaysTrue) => true,
            Some(FilterModeInner::Exact(params)) => params
                .iter()
                .all(|(k, v)| req.query_value(k) == v.as_str()),
            Some(FilterModeInner::Keyword(params)) => params
                .iter()
                .all(|(k, v)| req.query_value(k).contains(v.as_str())),
            Some(FilterModeInner::Regular(regulars)) => regulars
                .iter()
                .all(|(k, re)| re.is_match(req.query_value(k).as_bytes())),
            Some(FilterModeInner::Unknown(name)) => {
                log::warn!("found unsupported filter mode {name:?} in query filter");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BodyFilter {
    mode: BodyFilterMode,
}

#[derive(Debug, Clone, Default)]
enum BodyFilterMode {
    #[default]
    AlwaysTrue,
    Keyword(Vec<u8>),
    Regular(BytesRegex),
    Unknown(String),
}

impl BodyFilter {
    pub fn compile(params: Option<&FilterParams>) -> Result<Self, FilterCompileError> {
        let (mode, rest) = split_mode(params);
        let mode = match mode {
            FilterMode::AlwaysTrue => BodyFilterMode::AlwaysTrue,
            FilterMode::Keyword => {
                let keyword = rest
                    .get("keyword")
                    .ok_or(FilterCompileError::MissingBodyKeyword)?;
                BodyFilterMode::Keyword(keyword.clone().into_bytes())
            }
            FilterMode::Regular => {
                let pattern = rest
                    .get("regular")
                    .ok_or(FilterCompileError::MissingBodyRegular)?;
                let compiled =
                    BytesRegex::new(pattern).map_err(|source| FilterCompileError::BadRegex {
                        key: "regular".to_string(),
                        pattern: pattern.clone(),
                        source,
                    })?;
                BodyFilterMode::Regular(compiled)
            }
            FilterMode::Exact => BodyFilterMode::Unknown("exact".to_string()),
            FilterMode::Unknown(name) => BodyFilterMode::Unknown(name),
        };
        Ok(Self { mode })
    }

    pub fn passes(&self, body: &[u8]) -> bool {
        match &self.mode {
            BodyFilterMode::AlwaysTrue => true,
            BodyFilterMode::Keyword(keyword) => contains_subslice(body, keyword),
            BodyFilterMode::Regular(re) => re.is_match(body),
            BodyFilterMode::Unknown(name) => {
                log::warn!("found unsupported filter mode {name:?} in body filter");
                false
            }
        }
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// The composite per-regulation filter: passes iff header, query and body all pass.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub header: HeaderFilter,
    pub query: QueryFilter,
    pub body: BodyFilter,
}

impl RequestFilter {
    pub fn compile(filter: Option<&WireFilter>) -> Result<Self, FilterCompileError> {
        let (header, query, body) = match filter {
            None => (None, None, None),
            Some(f) => (f.header.as_ref(), f.query.as_ref(), f.body.as_ref()),
        };
        Ok(Self {
            header: HeaderFilter::compile(header)?,
            query: QueryFilter::compile(query)?,
            body: BodyFilter::compile(body)?,
        })
    }

    pub fn passes(&self, req: &MockRequest) -> bool {
        self.header.passes(req) && self.query.passes(req) && self.body.passes(&req.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> FilterParams {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn absent_filter_is_always_true() {
        let filter = RequestFilter::compile(None).unwrap();
        let req = MockRequest::new("GET", "/x");
        assert!(filter.passes(&req));
    }

    #[test]
    fn header_exact_requires_byte_equality() {
        let hf = HeaderFilter::compile(Some(&params(&[("mode", "exact"), ("X-Id", "abc")])))
            .unwrap();
        let req = MockRequest::new("GET", "/x").with_header("X-Id", "abc");
        assert!(hf.passes(&req));
        let req = MockRequest::new("GET", "/x").with_header("X-Id", "xyz");
        assert!(!hf.passes(&req));
    }

    #[test]
    fn header_keyword_is_substring_match() {
        let hf = HeaderFilter::compile(Some(&params(&[("mode", "keyword"), ("X-Id", "bc")])))
            .unwrap();
        let req = MockRequest::new("GET", "/x").with_header("X-Id", "abcd");
        assert!(hf.passes(&req));
    }

    #[test]
    fn header_regular_compiles_and_matches() {
        let hf =
            HeaderFilter::compile(Some(&params(&[("mode", "regular"), ("X-Id", "^[0-9]+$")])))
                .unwrap();
        let req = MockRequest::new("GET", "/x").with_header("X-Id", "12345");
        assert!(hf.passes(&req));
        let req = MockRequest::new("GET", "/x").with_header("X-Id", "abc");
        assert!(!hf.passes(&req));
    }

    #[test]
    fn body_keyword_and_regular() {
        let bf = BodyFilter::compile(Some(&params(&[("mode", "keyword"), ("keyword", "createStore")])))
            .unwrap();
        assert!(bf.passes(br#"{"op":"createStore"}"#));
        assert!(!bf.passes(br#"{"op":"deleteStore"}"#));

        let bf =
            BodyFilter::compile(Some(&params(&[("mode", "regular"), ("regular", r"^\{.*\}$")])))
                .unwrap();
        assert!(bf.passes(br#"{"a":1}"#));
    }

    #[test]
    fn composite_filter_is_and_of_all_three() {
        let filter = RequestFilter {
            header: HeaderFilter::compile(Some(&params(&[("mode", "exact"), ("X-Id", "abc")])))
                .unwrap(),
            query: QueryFilter::compile(None).unwrap(),
            body: BodyFilter::compile(Some(&params(&[("mode", "keyword"), ("keyword", "ok")])))
                .unwrap(),
        };

        let req = MockRequest::new("GET", "/x")
            .with_header("X-Id", "abc")
            .with_body("text/plain", b"all ok here".to_vec());
        assert!(filter.passes(&req));

        let req = MockRequest::new("GET", "/x")
            .with_header("X-Id", "abc")
            .with_body("text/plain", b"nope".to_vec());
        assert!(!filter.passes(&req));
    }

    #[test]
    fn unknown_mode_compiles_but_never_matches() {
        let hf = HeaderFilter::compile(Some(&params(&[("mode", "bogus")]))).unwrap();
        let req = MockRequest::new("GET", "/x");
        assert!(!hf.passes(&req));
    }
}
