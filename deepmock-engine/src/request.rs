//! A transport-agnostic view of an inbound mock request.
//!
//! The engine crate never touches `hyper` or any other HTTP library directly; the
//! registry crate adapts whatever server framework it uses into a [`MockRequest`]
//! before handing it to an [`crate::Executor`].

use std::collections::HashMap;

/// Recognized request body content types, mirroring the three buckets the template
/// context distinguishes (`.Form` vs `.Json`, plus the keyword/regular body filters
/// which operate on raw bytes regardless of content type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Form,
    Multipart,
    Json,
    Other,
}

impl BodyKind {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("application/x-www-form-urlencoded") {
            BodyKind::Form
        } else if content_type.starts_with("multipart/form-data") {
            BodyKind::Multipart
        } else if content_type.starts_with("application/json") {
            BodyKind::Json
        } else {
            BodyKind::Other
        }
    }
}

/// An inbound request, already stripped of transport concerns.
///
/// `header`/`query` use the first value seen for a repeated key, matching the
/// "first value wins" rule the template context documents for `.Header`/`.Query`.
#[derive(Debug, Clone, Default)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub header: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            header: HashMap::new(),
            query: HashMap::new(),
            content_type: String::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = content_type.into();
        self.body = body.into();
        self
    }

    pub fn header_value(&self, name: &str) -> &str {
        self.header.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn query_value(&self, name: &str) -> &str {
        self.query.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn body_kind(&self) -> BodyKind {
        BodyKind::from_content_type(&self.content_type)
    }

    /// Form fields, populated only for urlencoded/multipart bodies. Multipart parsing
    /// here only covers the simple `name=value&...`-shaped field list a mock server's
    /// test traffic actually sends; full RFC 2388 multipart parsing is out of scope.
    pub fn form_params(&self) -> HashMap<String, String> {
        match self.body_kind() {
            BodyKind::Form | BodyKind::Multipart => parse_urlencoded(&self.body),
            _ => HashMap::new(),
        }
    }

    pub fn json_body(&self) -> Option<serde_json::Value> {
        match self.body_kind() {
            BodyKind::Json => serde_json::from_slice(&self.body).ok(),
            _ => None,
        }
    }
}

fn parse_urlencoded(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    let mut params = HashMap::new();
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        params
            .entry(decode_percent(key))
            .or_insert_with(|| decode_percent(value));
    }
    params
}

/// Minimal percent-decoding for query strings and urlencoded bodies (`+` as space,
/// `%XX` escapes). Malformed escapes are passed through verbatim.
pub fn decode_percent(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_handles_escapes_and_plus() {
        assert_eq!(decode_percent("https%3A%2F%2Fexample.com"), "https://example.com");
        assert_eq!(decode_percent("a+b"), "a b");
    }

    #[test]
    fn form_params_only_populate_for_form_content_types() {
        let req = MockRequest::new("POST", "/x")
            .with_body("application/x-www-form-urlencoded", b"a=1&b=two".to_vec());
        let params = req.form_params();
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("two"));

        let req = MockRequest::new("POST", "/x").with_body("application/json", b"{}".to_vec());
        assert!(req.form_params().is_empty());
    }

    #[test]
    fn json_body_only_populates_for_json_content_type() {
        let req = MockRequest::new("POST", "/x")
            .with_body("application/json", br#"{"op":"createStore"}"#.to_vec());
        let json = req.json_body().expect("valid json");
        assert_eq!(json["op"], "createStore");
    }
}
