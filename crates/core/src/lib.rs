//! Shared types for the fanout orchestration layer.
//!
//! Zero internal dependencies: identifiers, the core error type, and the
//! workflow normalization / fingerprinting / seed-rewrite pass used by the
//! pool before dispatch.

pub mod error;
pub mod types;
pub mod workflow;
