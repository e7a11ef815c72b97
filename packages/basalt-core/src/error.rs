//! Engine-wide error kinds, stable on the wire.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, BasaltError>;

/// Every failure the engine surfaces maps to one of these kinds.
///
/// The wire shape is `{"error": <kind>, "errorMessage": <text>}`; kinds are
/// stable so clients can switch on them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BasaltError {
    /// An input row or expression could not be parsed; carries the offending value.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Lifecycle transition violation.
    #[error("illegal state: from={from},to={to},current={current}")]
    IllegalState {
        from: String,
        to: String,
        current: String,
    },

    /// Bad query shape: arity, unknown function, type mismatch at plan time.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Authorization denied.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller close, timeout, or peer disconnect.
    #[error("query cancelled: {0}")]
    Cancelled(String),

    /// Host-level interrupt observed during a scan.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Index row limit or buffer slab exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Attempted merge of incompatible aggregator factories.
    #[error("not mergeable: {0}")]
    NotMergeable(String),

    /// Failure returned from a data node; wraps the remote kind.
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire form of an error, shared by broker responses and remote unwrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub error: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

impl BasaltError {
    /// Stable kind tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BasaltError::ParseFailure(_) => "parseFailure",
            BasaltError::IllegalState { .. } => "illegalState",
            BasaltError::IllegalArgument(_) => "illegalArgument",
            BasaltError::Unauthorized(_) => "unauthorized",
            BasaltError::Cancelled(_) => "cancelled",
            BasaltError::Interrupted(_) => "interrupted",
            BasaltError::ResourceExhausted(_) => "resourceExhausted",
            BasaltError::NotMergeable(_) => "notMergeable",
            BasaltError::Remote { .. } => "remote",
            BasaltError::Internal(_) => "internal",
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            error: self.kind().to_string(),
            error_message: self.to_string(),
        }
    }

    /// Rebuild a remote failure from its wire form, preserving the inner kind.
    pub fn from_wire(wire: WireError) -> Self {
        BasaltError::Remote {
            kind: wire.error,
            message: wire.error_message,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BasaltError::Internal(msg.into())
    }
}

impl From<std::io::Error> for BasaltError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::Interrupted {
            BasaltError::Interrupted(e.to_string())
        } else {
            BasaltError::Internal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BasaltError {
    fn from(e: serde_json::Error) -> Self {
        BasaltError::ParseFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_state_message() {
        let e = BasaltError::IllegalState {
            from: "AUTHORIZED".into(),
            to: "EXECUTING".into(),
            current: "NEW".into(),
        };
        assert_eq!(
            e.to_string(),
            "illegal state: from=AUTHORIZED,to=EXECUTING,current=NEW"
        );
    }

    #[test]
    fn test_wire_round_trip_keeps_kind() {
        let e = BasaltError::ResourceExhausted("row limit 5000 reached".into());
        let wire = e.to_wire();
        assert_eq!(wire.error, "resourceExhausted");
        let back = BasaltError::from_wire(wire);
        match back {
            BasaltError::Remote { kind, .. } => assert_eq!(kind, "resourceExhausted"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
