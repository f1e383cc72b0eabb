//! Error types for the Fatmouse client.
//!
//! Local failures (bad input, out-of-order calls, undecodable payloads,
//! deadlines) are kept apart from failures reported by the remote worker,
//! which carry the worker's error record untouched.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::TransportError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, FatmouseError>;

/// Errors that can occur during client operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FatmouseError {
    /// Invalid argument provided by caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation was called out of order (e.g. ack before get).
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// A payload was not valid JSON or not the expected shape.
    #[error("decode failure: {0}")]
    Decode(String),

    /// Nothing arrived before the caller's deadline.
    #[error("timeout {} seconds exceeded while waiting for {context}", after.as_secs_f64())]
    Timeout { context: String, after: Duration },

    /// The remote worker reported a failure.
    #[error(transparent)]
    Remote(RemoteError),

    /// Broker transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Coarse classification of [`FatmouseError`] for branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ProtocolMisuse,
    DecodeFailure,
    Timeout,
    RemoteFailure,
    Transport,
}

impl FatmouseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FatmouseError::InvalidInput(_) => ErrorKind::InvalidInput,
            FatmouseError::ProtocolMisuse(_) => ErrorKind::ProtocolMisuse,
            FatmouseError::Decode(_) => ErrorKind::DecodeFailure,
            FatmouseError::Timeout { .. } => ErrorKind::Timeout,
            FatmouseError::Remote(_) => ErrorKind::RemoteFailure,
            FatmouseError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> String {
        match self {
            FatmouseError::InvalidInput(msg)
            | FatmouseError::ProtocolMisuse(msg)
            | FatmouseError::Decode(msg) => msg.clone(),
            FatmouseError::Remote(remote) => remote.exc_message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns the remote error record if the worker reported a failure.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            FatmouseError::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FatmouseError::Timeout { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FatmouseError::Remote(_))
    }

    pub fn is_protocol_misuse(&self) -> bool {
        matches!(self, FatmouseError::ProtocolMisuse(_))
    }

    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        FatmouseError::ProtocolMisuse(msg.into())
    }

    pub(crate) fn decode(what: &str, err: impl fmt::Display) -> Self {
        FatmouseError::Decode(format!("{}: {}", what, err))
    }
}

/// A failure reported by the remote worker.
///
/// Wire shape: `{"exc_type": "...", "exc_message": "...", "exc_data": {...}|null}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{exc_message}")]
pub struct RemoteError {
    /// Remote error type name (e.g. `"DuplicateError"`).
    pub exc_type: String,
    /// Human-readable message.
    pub exc_message: String,
    /// Structured data attached to the error; shape depends on `exc_type`.
    #[serde(default)]
    pub exc_data: Option<Value>,
}

impl RemoteError {
    pub fn error_type(&self) -> &str {
        &self.exc_type
    }

    pub fn message(&self) -> &str {
        &self.exc_message
    }

    pub fn data(&self) -> Option<&Value> {
        self.exc_data.as_ref().filter(|v| !v.is_null())
    }
}

/// Translate a remote failure payload into a [`FatmouseError::Remote`].
///
/// A payload that does not have the remote error shape is a decode failure;
/// it is never reported as a remote error.
pub fn translate_failure(payload: Value) -> FatmouseError {
    match serde_json::from_value::<RemoteError>(payload) {
        Ok(remote) => FatmouseError::Remote(remote),
        Err(e) => FatmouseError::decode("malformed failure payload", e),
    }
}
