//! Crate-level error taxonomy for device fetches.
//!
//! Every failure a fetch can produce is mapped onto one of these variants so
//! that the retry executor can decide retryability without inspecting the
//! transport layer. Cycle-level propagation never throws past the poller:
//! errors end up as per-key miss counts or a snapshot-level diagnostic.

use thiserror::Error;

/// Errors produced while fetching or decoding device data.
///
/// `Clone` is intentional: the last classified error of a cycle is retained
/// in the published snapshot for diagnostics.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Connection-level failure (refused, DNS, reset). Retryable.
    #[error("network error contacting {url}: {detail}")]
    Network { url: String, detail: String },

    /// The request exceeded its individual timeout. Retryable.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// Non-2xx HTTP status. Retryable only for 5xx and rate-limit-like codes.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The device embedded an error marker in an otherwise successful
    /// response body. Retryable only when the marker is a transient one.
    #[error("device reported '{marker}' for {command}")]
    Payload {
        command: String,
        marker: String,
        transient: bool,
    },

    /// Undecodable response body. Permanent for this call, never fatal for
    /// the cycle.
    #[error("undecodable body from {url}: {detail}")]
    Parse { url: String, detail: String },

    /// The command is structurally absent from this firmware variant.
    /// Informational, never retried.
    #[error("command {command} not supported by this firmware")]
    Unsupported { command: String },
}

impl FetchError {
    /// Whether the retry executor may re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } => true,
            FetchError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            FetchError::Payload { transient, .. } => *transient,
            FetchError::Parse { .. } | FetchError::Unsupported { .. } => false,
        }
    }
}
