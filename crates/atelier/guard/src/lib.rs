//! Guardrail engine for Atelier plans
//!
//! Stateless validators that enforce cost, safety and reproducibility
//! policy on plans, independent of any business logic:
//!
//! - cost ceiling (relaxed but still capped for admin overrides)
//! - operation whitelist ([`OperationCatalog`])
//! - step-count and batch-size ceilings
//! - required-parameter presence and type
//! - determinism lock ([`determinism`])
//!
//! Violations are reported as [`GuardrailIssue`](atelier_types::GuardrailIssue)s
//! during review and raised as [`GuardrailError`](atelier_types::GuardrailError)s
//! during enforcement.

#![deny(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod determinism;
pub mod engine;
pub mod rules;

pub use catalog::{OperationCatalog, OperationSpec, ParamKind, ParamSpec, Pricing};
pub use config::GuardrailConfig;
pub use engine::{guarded, GuardrailEngine, GuardrailReport};
