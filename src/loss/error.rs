//! Typed errors for the loss primitives
//!
//! A malformed batch is a programming or data error, never a transient
//! condition: every variant aborts the training step at the call that detects
//! it. Callers that only care about "the step failed" treat these through
//! `anyhow`; tests and training-loop diagnostics downcast to the variant.

use thiserror::Error;

/// Errors raised by batch layouts, samplers, and loss engines
#[derive(Debug, Error)]
pub enum LossError {
    /// Batch or axis sizes disagree across query/positive/negative/targets
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Flat batch length is not partitionable as `bsz * (K + 2)`
    #[error("invalid candidate batch layout: {0}")]
    InvalidLayout(String),

    /// Mutually exclusive or incoherent options selected together
    #[error("invalid loss configuration: {0}")]
    Configuration(String),
}
