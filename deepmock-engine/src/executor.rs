//! The compiled, immutable per-rule runtime (C5): `match`, `select_regulation`,
//! `render`. An [`Executor`] owns everything it needs to serve traffic — no
//! reference back to the wire-format rule it was compiled from, no shared
//! mutable state — so concurrent `match`/`render` calls need no synchronization
//! beyond what their inputs already require (the weight picker's shared RNG).

use regex::bytes::Regex as BytesRegex;
use thiserror::Error;

use crate::filter::RequestFilter;
use crate::request::MockRequest;
use crate::template::{RenderContext, Template, TemplateError};
use crate::weight::WeightPicker;

/// One compiled regulation: its filter and its compiled template.
#[derive(Debug)]
pub struct CompiledRegulation {
    pub is_default: bool,
    pub filter: RequestFilter,
    pub template: CompiledTemplate,
}

/// A regulation's response, fully parsed at compile time.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub is_template: bool,
    pub is_header_template: bool,
    /// Literal header values, written first regardless of `is_header_template`.
    pub static_header: std::collections::HashMap<String, String>,
    /// Present only when `is_header_template`; overlaid onto `static_header` at
    /// render time.
    pub header_templates: Option<Vec<(String, Template)>>,
    pub status_code: u16,
    /// Present when `base64encoded_body` was non-empty; takes precedence over
    /// `literal_body` but yields to `body_template` when `is_template` is set.
    pub binary_body: Option<Vec<u8>>,
    pub literal_body: String,
    /// Present whenever `is_template` is set, regardless of binary-ness; takes
    /// precedence over `binary_body` at render time.
    pub body_template: Option<Template>,
}

/// A compiled rule, immutable after construction.
#[derive(Debug)]
pub struct Executor {
    pub id: String,
    pub method: String,
    pub path_regex: BytesRegex,
    pub variable: std::collections::HashMap<String, serde_json::Value>,
    pub weight: WeightPicker,
    pub regulations: Vec<CompiledRegulation>,
    pub version: i64,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to render response body: {0}")]
    Body(#[source] TemplateError),
    #[error("failed to render header {name:?}: {source}")]
    Header {
        name: String,
        #[source]
        source: TemplateError,
    },
}

/// The rendered result of [`Executor::render`]; transport-agnostic, so the
/// registry crate's HTTP layer writes it out however its framework requires.
#[derive(Debug, Clone, Default)]
pub struct RenderedResponse {
    pub status_code: u16,
    pub header: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Executor {
    /// `method` byte-equal to the stored upper-cased method and `path_regex`
    /// matches `path`. Unanchored: `path=/api` matches `/api/v1/extra`.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method == method && self.path_regex.is_match(path.as_bytes())
    }

    /// Iterate regulations in declared order, remembering the default as it is
    /// passed, and return the first whose filter passes. Falls back to the
    /// remembered default if none pass (a default always exists by construction,
    /// since [`crate::compiler::compile_rule`] rejects rules without exactly one).
    pub fn select_regulation<'a>(&'a self, request: &MockRequest) -> Option<&'a CompiledRegulation> {
        let mut default = None;
        for regulation in &self.regulations {
            if regulation.is_default {
                default = Some(regulation);
            }
            if regulation.filter.passes(request) {
                return Some(regulation);
            }
        }
        default
    }

    fn render_context(&self, request: &MockRequest) -> RenderContext {
        RenderContext {
            variable: self.variable.clone(),
            weight: self.weight.dice_all(),
            header: request.header.clone(),
            query: request.query.clone(),
            form: request.form_params(),
            json: request.json_body(),
        }
    }

    /// Render a regulation's response against `request`. Execution order:
    /// write the static header, overlay the rendered header template if
    /// present, then pick the body: execute the body template if
    /// `is_template` is set (regardless of binary-ness), else write the
    /// binary body verbatim, else write the literal body.
    pub fn render(
        &self,
        regulation: &CompiledRegulation,
        request: &MockRequest,
    ) -> Result<RenderedResponse, RenderError> {
        let ctx = self.render_context(request);
        let template = &regulation.template;

        let mut header = template.static_header.clone();
        if let Some(header_templates) = &template.header_templates {
            for (name, tmpl) in header_templates {
                let rendered = tmpl
                    .render(&ctx)
                    .map_err(|source| RenderError::Header {
                        name: name.clone(),
                        source,
                    })?;
                header.insert(name.clone(), rendered);
            }
        }

        let body = if let Some(body_template) = &template.body_template {
            body_template
                .render(&ctx)
                .map_err(RenderError::Body)?
                .into_bytes()
        } else if let Some(binary) = &template.binary_body {
            binary.clone()
        } else {
            template.literal_body.clone().into_bytes()
        };

        Ok(RenderedResponse {
            status_code: template.status_code,
            header,
            body,
        })
    }
}
