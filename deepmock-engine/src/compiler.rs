//! Rule Compiler (C4): turns a persisted [`crate::wire::Rule`] into an immutable,
//! always request-servable [`crate::Executor`]. Every fallible step (regex
//! compile, filter compile, weight compile, template parse, base64 decode)
//! happens here, once, so the serving path never sees a compile error.

use regex::bytes::Regex as BytesRegex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::executor::{CompiledRegulation, CompiledTemplate, Executor};
use crate::filter::{FilterCompileError, RequestFilter};
use crate::template::{Template, TemplateError};
use crate::weight::{WeightCompileError, WeightPicker};
use crate::wire::Rule;

/// Fixed salt mixed into the stable-hash id derivation. Matches the upstream
/// implementation's constant; changing it would orphan every previously
/// persisted rule id.
const ID_SALT: &str = "deepmock-rule-id-salt-v1";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("rule path must not be empty")]
    EmptyPath,
    #[error("rule method must not be empty")]
    EmptyMethod,
    #[error("rule must declare at least one regulation")]
    EmptyRegulations,
    #[error("rule must have exactly one default regulation, found {0}")]
    DefaultCount(usize),
    #[error("non-default regulation at index {0} is missing a filter")]
    MissingFilter(usize),
    #[error("invalid path regular expression {path:?}: {source}")]
    BadPathRegex {
        path: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule id mismatch: stored id {stored:?} does not match derived id {derived:?}")]
    IdMismatch { stored: String, derived: String },
    #[error("regulation {index} filter is invalid: {source}")]
    Filter {
        index: usize,
        #[source]
        source: FilterCompileError,
    },
    #[error("weight channel is invalid: {0}")]
    Weight(#[from] WeightCompileError),
    #[error("regulation {index} template is invalid: {source}")]
    Template {
        index: usize,
        #[source]
        source: TemplateError,
    },
    #[error("regulation {index} has invalid base64 body: {source}")]
    BadBase64 {
        index: usize,
        #[source]
        source: base64::DecodeError,
    },
}

/// `id = stable_hash(upper(method) || path || fixed_salt)`.
pub fn stable_hash(method: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_uppercase().as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(ID_SALT.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Compile a wire-format [`Rule`] into a servable [`Executor`].
///
/// Steps follow the specification's compiler order: normalize, structurally
/// validate, compile the path regex, compile filters and weight channels,
/// parse templates, then wrap everything immutably under the rule's version.
pub fn compile_rule(rule: &Rule) -> Result<Executor, CompileError> {
    if rule.path.is_empty() {
        return Err(CompileError::EmptyPath);
    }
    if rule.method.is_empty() {
        return Err(CompileError::EmptyMethod);
    }
    if rule.responses.is_empty() {
        return Err(CompileError::EmptyRegulations);
    }

    let method = rule.method.to_uppercase();
    let derived_id = stable_hash(&method, &rule.path);
    if let Some(stored) = &rule.id {
        if !stored.is_empty() && stored != &derived_id {
            return Err(CompileError::IdMismatch {
                stored: stored.clone(),
                derived: derived_id,
            });
        }
    }

    let default_count = rule.responses.iter().filter(|r| r.is_default).count();
    if default_count != 1 {
        return Err(CompileError::DefaultCount(default_count));
    }
    for (index, regulation) in rule.responses.iter().enumerate() {
        if !regulation.is_default && regulation.filter.is_none() {
            return Err(CompileError::MissingFilter(index));
        }
    }

    let path_regex =
        BytesRegex::new(&rule.path).map_err(|source| CompileError::BadPathRegex {
            path: rule.path.clone(),
            source,
        })?;

    let weight = WeightPicker::compile(rule.weight.as_ref())?;

    let mut compiled_regulations = Vec::with_capacity(rule.responses.len());
    for (index, regulation) in rule.responses.iter().enumerate() {
        let filter = RequestFilter::compile(regulation.filter.as_ref())
            .map_err(|source| CompileError::Filter { index, source })?;
        let compiled_template = compile_template(&regulation.response, index)?;
        compiled_regulations.push(CompiledRegulation {
            is_default: regulation.is_default,
            filter,
            template: compiled_template,
        });
    }

    Ok(Executor {
        id: derived_id,
        method,
        path_regex,
        variable: rule.variable.clone().unwrap_or_default(),
        weight,
        regulations: compiled_regulations,
        version: rule.version,
    })
}

fn compile_template(
    template: &crate::wire::Template,
    index: usize,
) -> Result<CompiledTemplate, CompileError> {
    let binary_body = match &template.b64_body {
        Some(encoded) if !encoded.is_empty() => {
            let decoded = base64::decode(encoded)
                .map_err(|source| CompileError::BadBase64 { index, source })?;
            Some(decoded)
        }
        _ => None,
    };

    let literal_body = template.body.clone().unwrap_or_default();

    let body_template = if template.is_template {
        Some(
            Template::compile(&literal_body)
                .map_err(|source| CompileError::Template { index, source })?,
        )
    } else {
        None
    };

    let header_templates = if template.is_header_template {
        let mut compiled = Vec::with_capacity(template.header.len());
        for (name, value) in &template.header {
            let parsed =
                Template::compile(value).map_err(|source| CompileError::Template { index, source })?;
            compiled.push((name.clone(), parsed));
        }
        Some(compiled)
    } else {
        None
    };

    Ok(CompiledTemplate {
        is_template: template.is_template,
        is_header_template: template.is_header_template,
        static_header: template.header.clone(),
        header_templates,
        status_code: if template.status_code == 0 {
            200
        } else {
            template.status_code
        },
        binary_body,
        literal_body,
        body_template,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Regulation, Template as WireTemplate};

    fn default_rule(path: &str, body: &str) -> Rule {
        Rule {
            id: None,
            path: path.to_string(),
            method: "get".to_string(),
            variable: None,
            weight: None,
            responses: vec![Regulation {
                is_default: true,
                filter: None,
                response: WireTemplate {
                    body: Some(body.to_string()),
                    ..Default::default()
                },
            }],
            version: 1,
        }
    }

    #[test]
    fn method_is_uppercased() {
        let executor = compile_rule(&default_rule("/ping", "pong")).unwrap();
        assert_eq!(executor.method, "GET");
    }

    #[test]
    fn id_is_pure_function_of_method_and_path() {
        let a = compile_rule(&default_rule("/ping", "pong")).unwrap();
        let b = compile_rule(&default_rule("/ping", "different body")).unwrap();
        assert_eq!(a.id, b.id);

        let c = compile_rule(&default_rule("/pong", "pong")).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn mismatched_stored_id_is_rejected() {
        let mut rule = default_rule("/ping", "pong");
        rule.id = Some("not-the-real-id".to_string());
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::IdMismatch { .. }));
    }

    #[test]
    fn missing_default_is_rejected() {
        let mut rule = default_rule("/ping", "pong");
        rule.responses[0].is_default = false;
        rule.responses[0].filter = Some(crate::wire::Filter::default());
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::DefaultCount(0)));
    }

    #[test]
    fn multiple_defaults_are_rejected() {
        let mut rule = default_rule("/ping", "pong");
        rule.responses.push(rule.responses[0].clone());
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::DefaultCount(2)));
    }

    #[test]
    fn non_default_without_filter_is_rejected() {
        let mut rule = default_rule("/ping", "pong");
        rule.responses.push(Regulation {
            is_default: false,
            filter: None,
            response: WireTemplate::default(),
        });
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::MissingFilter(1)));
    }

    #[test]
    fn invalid_path_regex_is_rejected() {
        let rule = default_rule("/ping(", "pong");
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::BadPathRegex { .. }));
    }

    #[test]
    fn bad_template_fails_compilation_not_serving() {
        let mut rule = default_rule("/ping", "{{not_a_real_fn}}");
        rule.responses[0].response.is_template = true;
        let err = compile_rule(&rule).unwrap_err();
        assert!(matches!(err, CompileError::Template { .. }));
    }

    #[test]
    fn binary_body_decodes_base64() {
        let mut rule = default_rule("/ping", "");
        rule.responses[0].response.b64_body = Some(base64::encode(b"pong"));
        let executor = compile_rule(&rule).unwrap();
        assert_eq!(
            executor.regulations[0].template.binary_body.as_deref(),
            Some(&b"pong"[..])
        );
    }

    #[test]
    fn status_code_zero_becomes_200() {
        let executor = compile_rule(&default_rule("/ping", "pong")).unwrap();
        assert_eq!(executor.regulations[0].template.status_code, 200);
    }
}
