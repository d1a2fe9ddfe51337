//! The response template engine (C3): `{{ }}`-interpolated text templates over a
//! request-derived context, executed against a fixed, process-wide function
//! library built once at startup.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{Duration, Months, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unterminated template action starting at byte {0}")]
    UnterminatedAction(usize),
    #[error("empty template action")]
    EmptyAction,
    #[error("unknown template function {0:?}")]
    UnknownFunction(String),
    #[error("template function {0:?} called with wrong argument count")]
    ArgCount(String),
    #[error("a function named {0:?} already exists")]
    AlreadyRegistered(String),
}

/// A resolved value flowing through expression evaluation. `Safe` values (produced
/// by `html_unescaped`) are written verbatim; everything else is HTML-escaped on
/// the way out, matching `html/template`'s auto-escaping default.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    Json(Value),
    Safe(String),
}

impl TemplateValue {
    fn stringify_unescaped(&self) -> String {
        match self {
            TemplateValue::Safe(s) => s.clone(),
            TemplateValue::Json(Value::String(s)) => s.clone(),
            TemplateValue::Json(Value::Null) => String::new(),
            TemplateValue::Json(v) => v.to_string(),
        }
    }

    fn render(&self) -> String {
        match self {
            TemplateValue::Safe(s) => s.clone(),
            other => html_escape(&other.stringify_unescaped()),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            TemplateValue::Json(Value::Number(n)) => n.as_i64(),
            TemplateValue::Json(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// The rendering context: `.Variable`, `.Weight`, `.Header`, `.Query`, `.Form`,
/// `.Json`. Exactly one of `.Form`/`.Json` is populated for a given request.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub variable: HashMap<String, Value>,
    pub weight: HashMap<String, String>,
    pub header: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub form: HashMap<String, String>,
    pub json: Option<Value>,
}

impl RenderContext {
    fn resolve(&self, path: &[String]) -> TemplateValue {
        if path.is_empty() {
            return TemplateValue::Json(Value::Null);
        }
        let (root, rest) = (path[0].as_str(), &path[1..]);
        let value = match root {
            "Variable" => rest
                .first()
                .and_then(|k| self.variable.get(k))
                .cloned()
                .unwrap_or(Value::Null),
            "Weight" => rest
                .first()
                .and_then(|k| self.weight.get(k))
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            "Header" => rest
                .first()
                .and_then(|k| self.header.get(k))
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            "Query" => rest
                .first()
                .and_then(|k| self.query.get(k))
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            "Form" => rest
                .first()
                .and_then(|k| self.form.get(k))
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            "Json" => match &self.json {
                Some(root_value) => rest
                    .iter()
                    .try_fold(root_value.clone(), |acc, key| acc.get(key).cloned())
                    .unwrap_or(Value::Null),
                None => Value::Null,
            },
            _ => Value::Null,
        };
        TemplateValue::Json(value)
    }
}

#[derive(Debug, Clone)]
enum Arg {
    Field(Vec<String>),
    StringLit(String),
    IntLit(i64),
}

impl Arg {
    fn eval(&self, ctx: &RenderContext) -> TemplateValue {
        match self {
            Arg::Field(path) => ctx.resolve(path),
            Arg::StringLit(s) => TemplateValue::Json(Value::String(s.clone())),
            Arg::IntLit(n) => TemplateValue::Json(Value::from(*n)),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Field(Vec<String>),
    Call(String, Vec<Arg>),
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Action(Expr),
}

/// A compiled text template: a fixed sequence of literal and interpolated
/// segments. Parsing happens once, at rule-compile time; rendering never
/// reparses.
#[derive(Debug, Clone, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let bytes = source.as_bytes();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            match source[cursor..].find("{{") {
                None => {
                    segments.push(Segment::Literal(source[cursor..].to_string()));
                    break;
                }
                Some(rel_start) => {
                    let start = cursor + rel_start;
                    if start > cursor {
                        segments.push(Segment::Literal(source[cursor..start].to_string()));
                    }
                    let body_start = start + 2;
                    let rel_end = source[body_start..]
                        .find("}}")
                        .ok_or(TemplateError::UnterminatedAction(start))?;
                    let body_end = body_start + rel_end;
                    let action = source[body_start..body_end].trim();
                    segments.push(Segment::Action(parse_action(action)?));
                    cursor = body_end + 2;
                }
            }
        }
        Ok(Self { segments })
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Action(expr) => out.push_str(&eval_expr(expr, ctx)?.render()),
            }
        }
        Ok(out)
    }
}

fn parse_action(action: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(action)?;
    let mut tokens = tokens.into_iter();
    let first = tokens.next().ok_or(TemplateError::EmptyAction)?;

    if let Some(stripped) = first.strip_prefix('.') {
        if tokens.next().is_some() {
            // A bare field reference never takes further arguments.
            return Err(TemplateError::EmptyAction);
        }
        return Ok(Expr::Field(split_path(stripped)));
    }

    if !FUNCTION_TABLE
        .read()
        .expect("function table lock poisoned")
        .contains_key(&first)
    {
        return Err(TemplateError::UnknownFunction(first));
    }

    let mut args = Vec::new();
    for token in tokens {
        args.push(parse_arg(&token)?);
    }
    Ok(Expr::Call(first, args))
}

fn parse_arg(token: &str) -> Result<Arg, TemplateError> {
    if let Some(stripped) = token.strip_prefix('.') {
        Ok(Arg::Field(split_path(stripped)))
    } else if let Some(quoted) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Ok(Arg::StringLit(quoted.to_string()))
    } else if let Ok(n) = token.parse::<i64>() {
        Ok(Arg::IntLit(n))
    } else {
        Ok(Arg::StringLit(token.to_string()))
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

fn tokenize(action: &str) -> Result<Vec<String>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = action.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn eval_expr(expr: &Expr, ctx: &RenderContext) -> Result<TemplateValue, TemplateError> {
    match expr {
        Expr::Field(path) => Ok(ctx.resolve(path)),
        Expr::Call(name, args) => {
            let values: Vec<TemplateValue> = args.iter().map(|a| a.eval(ctx)).collect();
            call_function(name, &values)
        }
    }
}

// --- the fixed built-in function library ---------------------------------

type TemplateFn = fn(&[TemplateValue]) -> Result<TemplateValue, TemplateError>;

static FUNCTION_TABLE: Lazy<RwLock<HashMap<String, TemplateFn>>> = Lazy::new(|| {
    let mut table: HashMap<String, TemplateFn> = HashMap::new();
    table.insert("uuid".to_string(), fn_uuid);
    table.insert("timestamp".to_string(), fn_timestamp);
    table.insert("date".to_string(), fn_date);
    table.insert("date_delta".to_string(), fn_date_delta);
    table.insert("plus".to_string(), fn_plus);
    table.insert("rand_string".to_string(), fn_rand_string);
    table.insert("html_unescaped".to_string(), fn_html_unescaped);
    RwLock::new(table)
});

/// Register an additional template function. Fails if the name already exists —
/// the table is populated once at startup and never overwritten afterwards.
pub fn register_template_func(name: &str, f: TemplateFn) -> Result<(), TemplateError> {
    let mut table = FUNCTION_TABLE.write().expect("function table lock poisoned");
    if table.contains_key(name) {
        return Err(TemplateError::AlreadyRegistered(name.to_string()));
    }
    table.insert(name.to_string(), f);
    Ok(())
}

fn call_function(name: &str, args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    let table = FUNCTION_TABLE.read().expect("function table lock poisoned");
    let f = table
        .get(name)
        .ok_or_else(|| TemplateError::UnknownFunction(name.to_string()))?;
    f(args)
}

fn fn_uuid(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    if !args.is_empty() {
        return Err(TemplateError::ArgCount("uuid".to_string()));
    }
    Ok(TemplateValue::Json(Value::String(
        Uuid::new_v4().to_string(),
    )))
}

fn fn_timestamp(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    let precision = args.first().map(|v| v.stringify_unescaped()).unwrap_or_default();
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let value = match precision.as_str() {
        "mcs" => now_ns / 1_000,
        "ms" => now_ns / 1_000_000,
        "sec" => now_ns / 1_000_000_000,
        _ => now_ns,
    };
    Ok(TemplateValue::Json(Value::from(value)))
}

fn fn_date(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    let layout = args
        .first()
        .map(|v| v.stringify_unescaped())
        .ok_or_else(|| TemplateError::ArgCount("date".to_string()))?;
    let formatted = Utc::now().format(&go_layout_to_strftime(&layout)).to_string();
    Ok(TemplateValue::Json(Value::String(formatted)))
}

fn fn_date_delta(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    if args.len() != 5 {
        return Err(TemplateError::ArgCount("date_delta".to_string()));
    }
    let date = args[0].stringify_unescaped();
    let layout = args[1].stringify_unescaped();
    let years = args[2].as_i64().unwrap_or(0);
    let months = args[3].as_i64().unwrap_or(0);
    let days = args[4].as_i64().unwrap_or(0);

    let strftime = go_layout_to_strftime(&layout);
    let parsed = NaiveDateTime::parse_from_str(&date, &strftime)
        .map(|dt| dt)
        .or_else(|_| {
            NaiveDate::parse_from_str(&date, &strftime).map(|d| d.and_hms_opt(0, 0, 0).unwrap())
        });

    let Ok(parsed) = parsed else {
        // Parse failure: return the input unchanged, matching the source.
        return Ok(TemplateValue::Json(Value::String(date)));
    };

    let total_months = years * 12 + months;
    let shifted = if total_months >= 0 {
        parsed.checked_add_months(Months::new(total_months as u32))
    } else {
        parsed.checked_sub_months(Months::new((-total_months) as u32))
    }
    .and_then(|dt| dt.checked_add_signed(Duration::days(days)));

    match shifted {
        Some(dt) => Ok(TemplateValue::Json(Value::String(
            dt.format(&strftime).to_string(),
        ))),
        None => Ok(TemplateValue::Json(Value::String(date))),
    }
}

fn fn_plus(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    if args.len() != 2 {
        return Err(TemplateError::ArgCount("plus".to_string()));
    }
    let delta = args[1].as_i64().unwrap_or(0);
    let result = match &args[0] {
        TemplateValue::Json(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Value::from(i + delta)
            } else if let Some(f) = n.as_f64() {
                Value::from(f + delta as f64)
            } else {
                Value::String("unsupported type".to_string())
            }
        }
        TemplateValue::Json(Value::String(s)) => match s.parse::<i64>() {
            Ok(i) => Value::from(i + delta),
            Err(_) => Value::String("unsupported type".to_string()),
        },
        _ => Value::String("unsupported type".to_string()),
    };
    Ok(TemplateValue::Json(result))
}

fn fn_rand_string(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    let n = args
        .first()
        .and_then(TemplateValue::as_i64)
        .ok_or_else(|| TemplateError::ArgCount("rand_string".to_string()))?;
    Ok(TemplateValue::Json(Value::String(gen_random_string(
        n.max(0) as usize,
    ))))
}

pub fn gen_random_string(n: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn fn_html_unescaped(args: &[TemplateValue]) -> Result<TemplateValue, TemplateError> {
    let value = args
        .first()
        .ok_or_else(|| TemplateError::ArgCount("html_unescaped".to_string()))?;
    Ok(TemplateValue::Safe(value.stringify_unescaped()))
}

/// Translate a handful of Go reference-time layout tokens into `chrono::format`
/// strftime directives. Covers the layouts this corpus's rules actually use
/// (date-only and date+time, 24h clock); exotic layouts fall back unchanged.
fn go_layout_to_strftime(layout: &str) -> String {
    let replacements: &[(&str, &str)] = &[
        ("2006", "%Y"),
        ("06", "%y"),
        ("January", "%B"),
        ("Jan", "%b"),
        ("Monday", "%A"),
        ("Mon", "%a"),
        ("01", "%m"),
        ("02", "%d"),
        ("15", "%H"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("PM", "%p"),
        ("MST", "%Z"),
    ];
    let mut out = layout.to_string();
    for (pattern, directive) in replacements {
        out = out.replace(pattern, directive);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only_template_renders_verbatim() {
        let tmpl = Template::compile("pong").unwrap();
        let ctx = RenderContext::default();
        assert_eq!(tmpl.render(&ctx).unwrap(), "pong");
    }

    #[test]
    fn variable_and_weight_and_uuid_interpolate() {
        let tmpl = Template::compile("app={{.Variable.app}} result={{.Weight.outcome}} id={{uuid}}")
            .unwrap();
        let mut ctx = RenderContext::default();
        ctx.variable.insert("app".to_string(), Value::String("demo".to_string()));
        ctx.weight.insert("outcome".to_string(), "success".to_string());

        let rendered = tmpl.render(&ctx).unwrap();
        let re = regex::Regex::new(
            r"^app=demo result=success id=[0-9a-f-]{36}$",
        )
        .unwrap();
        assert!(re.is_match(&rendered), "got {rendered:?}");
    }

    #[test]
    fn header_template_renders_query_and_variable() {
        let tmpl = Template::compile("{{.Query.redirect}}?code={{.Variable.code}}").unwrap();
        let mut ctx = RenderContext::default();
        ctx.query
            .insert("redirect".to_string(), "https://example.com".to_string());
        ctx.variable
            .insert("code".to_string(), Value::String("AZ".to_string()));
        assert_eq!(
            tmpl.render(&ctx).unwrap(),
            "https://example.com?code=AZ"
        );
    }

    #[test]
    fn html_unescaped_suppresses_escaping() {
        let mut ctx = RenderContext::default();
        ctx.variable
            .insert("raw".to_string(), Value::String("<b>hi</b>".to_string()));

        let escaped = Template::compile("{{.Variable.raw}}").unwrap();
        assert_eq!(escaped.render(&ctx).unwrap(), "&lt;b&gt;hi&lt;/b&gt;");

        let unescaped = Template::compile("{{html_unescaped .Variable.raw}}").unwrap();
        assert_eq!(unescaped.render(&ctx).unwrap(), "<b>hi</b>");
    }

    #[test]
    fn plus_adds_numbers_and_parses_strings() {
        let mut ctx = RenderContext::default();
        ctx.variable.insert("n".to_string(), Value::from(10));
        ctx.variable
            .insert("s".to_string(), Value::String("5".to_string()));

        let tmpl = Template::compile("{{plus .Variable.n 2}}").unwrap();
        assert_eq!(tmpl.render(&ctx).unwrap(), "12");

        let tmpl = Template::compile("{{plus .Variable.s 2}}").unwrap();
        assert_eq!(tmpl.render(&ctx).unwrap(), "7");
    }

    #[test]
    fn unknown_function_fails_at_compile_time() {
        let err = Template::compile("{{not_a_real_fn}}").unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFunction(_)));
    }

    #[test]
    fn rand_string_has_requested_length() {
        let tmpl = Template::compile("{{rand_string 12}}").unwrap();
        let ctx = RenderContext::default();
        assert_eq!(tmpl.render(&ctx).unwrap().len(), 12);
    }

    #[test]
    fn registering_existing_function_name_fails() {
        let err = register_template_func("uuid", fn_uuid).unwrap_err();
        assert!(matches!(err, TemplateError::AlreadyRegistered(_)));
    }
}
