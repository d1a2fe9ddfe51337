//! # DeepMock Registry
//!
//! The executor registry, reconciliation loop, request dispatcher, rule
//! repository, and admin HTTP surface that sit on top of `deepmock-engine`'s
//! pure rule-compilation core, plus the configuration and startup wiring for
//! the `deepmockd` binary.

pub mod admin;
pub mod api_types;
pub mod config;
pub mod dispatcher;
pub mod reconcile;
pub mod registry;
pub mod repository;
pub mod server;
