// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-error
#![deny(unsafe_code)]
//!
//! Stable, machine-readable error taxonomy shared by every crate in the
//! reliability layer. Every terminal failure the orchestrator surfaces to a
//! caller is a [`ReliabilityError`]; every retry decision inside the engine
//! classifies its cause as one of the six [`ErrorKind`]s.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad classification of a reliability-layer failure.
///
/// Each kind fixes whether the Retry Engine may treat a failure of that
/// kind as retryable at all (`Cancelled` and `InvalidArgument` never are;
/// `Timeout`, `Network`, and `PeerNack` depend on policy and peer hints;
/// `Sequence` is always terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed tool name, oversized message, or out-of-range option.
    InvalidArgument,
    /// Per-attempt or end-to-end deadline elapsed.
    Timeout,
    /// Transport-level failure (connection closed, send/receive error).
    Network,
    /// Malformed or missing reliability metadata, or a duplicate-ack anomaly.
    Sequence,
    /// Peer returned `ack=false` with an error code.
    PeerNack,
    /// Caller cancellation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Sequence => "sequence",
            ErrorKind::PeerNack => "peer_nack",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Stable, machine-readable error code. Each code belongs to exactly one
/// [`ErrorKind`] via [`ErrorCode::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidToolName,
    MessageTooLarge,
    InvalidTimeout,
    InvalidIdempotencyKey,
    InvalidArgument,
    TimeoutPerAttempt,
    TimeoutDeadlineExceeded,
    NetworkSendFailed,
    NetworkConnectionClosed,
    MissingReliabilityMetadata,
    DuplicateAck,
    AckWithoutProcessing,
    PeerNackTransient,
    PeerNackTerminal,
    Cancelled,
}

/// Every code, for exhaustiveness tests and documentation generation.
pub const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::InvalidToolName,
    ErrorCode::MessageTooLarge,
    ErrorCode::InvalidTimeout,
    ErrorCode::InvalidIdempotencyKey,
    ErrorCode::InvalidArgument,
    ErrorCode::TimeoutPerAttempt,
    ErrorCode::TimeoutDeadlineExceeded,
    ErrorCode::NetworkSendFailed,
    ErrorCode::NetworkConnectionClosed,
    ErrorCode::MissingReliabilityMetadata,
    ErrorCode::DuplicateAck,
    ErrorCode::AckWithoutProcessing,
    ErrorCode::PeerNackTransient,
    ErrorCode::PeerNackTerminal,
    ErrorCode::Cancelled,
];

impl ErrorCode {
    /// Stable string form used on the wire and in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToolName => "INVALID_TOOL_NAME",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::InvalidTimeout => "INVALID_TIMEOUT",
            ErrorCode::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::TimeoutPerAttempt => "TIMEOUT_PER_ATTEMPT",
            ErrorCode::TimeoutDeadlineExceeded => "TIMEOUT_DEADLINE_EXCEEDED",
            ErrorCode::NetworkSendFailed => "NETWORK_SEND_FAILED",
            ErrorCode::NetworkConnectionClosed => "NETWORK_CONNECTION_CLOSED",
            ErrorCode::MissingReliabilityMetadata => "MISSING_RELIABILITY_METADATA",
            ErrorCode::DuplicateAck => "DUPLICATE_ACK",
            ErrorCode::AckWithoutProcessing => "ACK_WITHOUT_PROCESSING",
            ErrorCode::PeerNackTransient => "PEER_NACK_TRANSIENT",
            ErrorCode::PeerNackTerminal => "PEER_NACK_TERMINAL",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// The [`ErrorKind`] this code belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::InvalidToolName
            | ErrorCode::MessageTooLarge
            | ErrorCode::InvalidTimeout
            | ErrorCode::InvalidIdempotencyKey
            | ErrorCode::InvalidArgument => ErrorKind::InvalidArgument,
            ErrorCode::TimeoutPerAttempt | ErrorCode::TimeoutDeadlineExceeded => {
                ErrorKind::Timeout
            }
            ErrorCode::NetworkSendFailed | ErrorCode::NetworkConnectionClosed => {
                ErrorKind::Network
            }
            ErrorCode::MissingReliabilityMetadata
            | ErrorCode::DuplicateAck
            | ErrorCode::AckWithoutProcessing => ErrorKind::Sequence,
            ErrorCode::PeerNackTransient | ErrorCode::PeerNackTerminal => ErrorKind::PeerNack,
            ErrorCode::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure surfaced by the reliability layer.
///
/// Carries enough structure for a caller to branch on `kind`/`code`
/// programmatically, log `message`/`details`, and decide whether the
/// failure was, in principle, `retryable` (the Retry Engine had already
/// exhausted or rejected retries by the time this error reaches the
/// caller: `retryable` documents the *classification*, not a promise of
/// future success).
pub struct ReliabilityError {
    code: ErrorCode,
    message: String,
    retryable: bool,
    details: BTreeMap<String, serde_json::Value>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ReliabilityError {
    /// Construct a new error from a code and message. `retryable` defaults
    /// to whatever is conventional for the code's kind and can be
    /// overridden with [`ReliabilityError::retryable`].
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = matches!(
            code.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::PeerNack
        );
        Self {
            code,
            message: message.into(),
            retryable,
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Override the retryable flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach a structured context value. Silently skipped if `value`
    /// fails to serialize.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The error kind (shorthand for `self.code().kind()`).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// The stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure was classified as retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Structured context attached to this error.
    #[must_use]
    pub fn details(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.details
    }

    /// Construct a cancellation error. `Cancelled` is always terminal.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message).retryable(false)
    }
}

impl fmt::Display for ReliabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let ctx = serde_json::to_string(&self.details).unwrap_or_default();
            write!(f, "[{}] {} {}", self.code, self.message, ctx)
        }
    }
}

impl fmt::Debug for ReliabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReliabilityError");
        d.field("code", &self.code)
            .field("kind", &self.kind())
            .field("message", &self.message)
            .field("retryable", &self.retryable);
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if let Some(source) = &self.source {
            d.field("source", &source.to_string());
        }
        d.finish()
    }
}

impl StdError for ReliabilityError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|b| b.as_ref() as &(dyn StdError + 'static))
    }
}

/// Serializable snapshot of a [`ReliabilityError`]. The opaque `source` is
/// flattened into `source_message`, since `dyn Error` is not `Serialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReliabilityErrorDto {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: BTreeMap<String, serde_json::Value>,
    pub source_message: Option<String>,
}

impl From<&ReliabilityError> for ReliabilityErrorDto {
    fn from(err: &ReliabilityError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            retryable: err.retryable,
            details: err.details.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<ReliabilityErrorDto> for ReliabilityError {
    fn from(dto: ReliabilityErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            retryable: dto.retryable,
            details: dto.details,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_codes_has_expected_count() {
        assert_eq!(ALL_CODES.len(), 15);
    }

    #[test]
    fn code_strings_are_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate code string: {code}");
        }
    }

    #[test]
    fn kind_classification_matches_taxonomy() {
        assert_eq!(ErrorCode::InvalidToolName.kind(), ErrorKind::InvalidArgument);
        assert_eq!(ErrorCode::TimeoutDeadlineExceeded.kind(), ErrorKind::Timeout);
        assert_eq!(ErrorCode::NetworkSendFailed.kind(), ErrorKind::Network);
        assert_eq!(ErrorCode::DuplicateAck.kind(), ErrorKind::Sequence);
        assert_eq!(ErrorCode::PeerNackTransient.kind(), ErrorKind::PeerNack);
        assert_eq!(ErrorCode::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn new_defaults_retryable_by_kind() {
        let network = ReliabilityError::new(ErrorCode::NetworkSendFailed, "boom");
        assert!(network.is_retryable());

        let invalid = ReliabilityError::new(ErrorCode::InvalidToolName, "bad name");
        assert!(!invalid.is_retryable());

        let cancelled = ReliabilityError::cancelled("caller cancelled");
        assert!(!cancelled.is_retryable());
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn display_includes_code_and_context() {
        let err = ReliabilityError::new(ErrorCode::InvalidTimeout, "out of range")
            .with_detail("timeout_ms", 10_000_000_i64);
        let s = err.to_string();
        assert!(s.contains("INVALID_TIMEOUT"));
        assert!(s.contains("out of range"));
        assert!(s.contains("timeout_ms"));
    }

    #[test]
    fn debug_includes_source_when_present() {
        #[derive(Debug)]
        struct Cause;
        impl fmt::Display for Cause {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("underlying cause")
            }
        }
        impl StdError for Cause {}

        let err = ReliabilityError::new(ErrorCode::NetworkSendFailed, "send failed")
            .with_source(Cause);
        let debug = format!("{err:?}");
        assert!(debug.contains("underlying cause"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = ReliabilityError::new(ErrorCode::Cancelled, "stop").retryable(false);
        let dto = ReliabilityErrorDto::from(&err);
        let json = serde_json::to_string(&dto).expect("serialize");
        let back: ReliabilityErrorDto = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, dto);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn error_code_serde_roundtrip() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *code);
        }
    }
}
