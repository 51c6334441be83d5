//! Typed errors for the recognition pipeline.
//!
//! Most plumbing code uses [`anyhow::Result`]. These are the errors that the
//! pipeline needs to tell apart: they decide whether a page escalates, whether
//! startup aborts, or whether we've hit an internal bug.

use std::time::Duration;

use thiserror::Error;

use crate::recognition::DocumentCategory;

/// Errors raised by recognition components.
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// An adapter ran past its budget and was cancelled.
    #[error("{engine} did not finish within {budget:?}")]
    AdapterTimeout { engine: String, budget: Duration },

    /// An adapter failed internally (crash, bad response, missing binary).
    #[error("{engine} failed: {message}")]
    AdapterFault { engine: String, message: String },

    /// No registered adapter accepts this category. This is a configuration
    /// error, and we detect it before processing any pages.
    #[error("no engine is registered for {0} pages")]
    UnsupportedCategory(DocumentCategory),

    /// An adapter declined a specific page (too large, missing pixel data,
    /// no embedded text, etc).
    #[error("{engine} cannot process this page: {reason}")]
    UnsupportedPage { engine: String, reason: String },

    /// The aggregator was called without any results. The orchestrator should
    /// make this impossible.
    #[error("internal error: tried to aggregate an empty result set")]
    AggregationContractViolation,

    /// The pipeline configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
