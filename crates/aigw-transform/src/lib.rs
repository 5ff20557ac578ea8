//! Dialect conversion.
//!
//! Every dialect is lifted into one canonical message model
//! ([`message::CanonicalRequest`] and friends) and lowered back out, so each
//! new dialect costs one lift and one lower instead of a pairwise matrix.
//! Streaming goes through the Claude event grammar as the canonical superset.

pub mod message;
pub mod request;
pub mod response;
pub mod stream;

pub use message::{
    Attachment, CanonicalMessage, CanonicalRequest, CanonicalResponse, Content, Role, ToolSpec,
};
pub use request::{convert_request, lift_request, lower_request};
pub use response::{convert_response, lower_response};
pub use stream::{StreamLift, StreamLower, StreamPiece};

use aigw_protocol::Dialect;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid {dialect} payload: {reason}")]
    Invalid {
        dialect: &'static str,
        reason: String,
    },
    #[error("conversion {from:?} -> {to:?} is not supported")]
    Unsupported { from: Dialect, to: Dialect },
}

impl TransformError {
    pub(crate) fn invalid(dialect: &'static str, reason: impl Into<String>) -> Self {
        TransformError::Invalid {
            dialect,
            reason: reason.into(),
        }
    }
}
