//! The in-memory rule executor graph: filters, weighted picker, template engine,
//! rule compiler and the compiled executor itself.
//!
//! This crate knows nothing about HTTP transport, persistence or process wiring —
//! it consumes an HTTP-shaped [`request::MockRequest`] and a wire-format
//! [`wire::Rule`], and produces a [`executor::Executor`] plus a rendered response.

pub mod compiler;
pub mod executor;
pub mod filter;
pub mod request;
pub mod template;
pub mod weight;
pub mod wire;

pub use compiler::{compile_rule, stable_hash, CompileError};
pub use executor::{Executor, RenderError, RenderedResponse};
pub use filter::{BodyFilter, FilterMode, HeaderFilter, QueryFilter, RequestFilter};
pub use request::MockRequest;
pub use template::{RenderContext, Template, TemplateError};
pub use weight::{WeightChannel, WeightPicker};
pub use wire::{Regulation, Rule};
