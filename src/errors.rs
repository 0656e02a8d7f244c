// src/errors.rs
//
// Error taxonomy. Only Validation and Configuration surface to callers;
// Capability and Data are absorbed at the point of use with a degraded
// result and a diagnostic log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed sample (coordinates or timestamp). Rejected before any
    /// state is mutated.
    #[error("invalid sample: {0}")]
    Validation(String),

    /// Bad startup configuration (fusion weights, grid resolution, ...).
    /// Raised once at startup, never per-request.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An external capability (model, persistence) is unavailable or
    /// erroring. The fusion engine degrades instead of propagating.
    #[error("capability failure: {0}")]
    Capability(String),

    /// Malformed zone or report payload. The offending record is skipped,
    /// the rest of the batch continues.
    #[error("bad data: {0}")]
    Data(String),
}
