// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-proto
#![deny(unsafe_code)]
//!
//! The Identity & Metadata Encoder: generates [`RequestIdentity`] values,
//! and serializes/parses the reliability sidecar (`_meta.rmcp`) on MCP
//! request and response envelopes.

use rmcp_reliability_error::{ErrorCode, ReliabilityError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version this crate speaks. Echoed by a compliant peer during
/// capability negotiation and stamped on every sidecar object.
pub const RMCP_VERSION: &str = "0.1";

/// Features advertised in the `experimental.rmcp` capability block.
pub const RMCP_FEATURES: &[&str] = &["ack", "retry", "idempotency"];

/// Immutable identity for one `call_tool` invocation.
///
/// Created once per call and never mutated; the request id is never
/// reused within the lifetime of the owning session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    request_id: Uuid,
    idempotency_key: Option<String>,
    expected_version: String,
}

impl RequestIdentity {
    /// Mint a new identity. `idempotency_key`, when present, must already
    /// have been validated by the caller (length 1..=255).
    #[must_use]
    pub fn new(idempotency_key: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            idempotency_key,
            expected_version: RMCP_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    #[must_use]
    pub fn expected_version(&self) -> &str {
        &self.expected_version
    }
}

/// The `experimental.rmcp` block sent with MCP `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RmcpCapability {
    pub version: String,
    pub features: Vec<String>,
}

impl RmcpCapability {
    #[must_use]
    pub fn advertise() -> Self {
        Self {
            version: RMCP_VERSION.to_string(),
            features: RMCP_FEATURES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether a peer's echoed capability is compatible with this version.
    ///
    /// Compatibility is exact-version match on the major.minor string; there
    /// is no semver-style negotiation range defined for `"0.1"`.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.version == RMCP_VERSION
    }
}

/// Final status of a completed attempt sequence, as reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    Failed,
}

/// The outbound `_meta.rmcp` object, stamped on every underlying MCP
/// tool-invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityMetaRequest {
    pub version: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub attempt: u32,
    pub timeout_ms: u64,
    pub expect_ack: bool,
}

impl ReliabilityMetaRequest {
    #[must_use]
    pub fn new(identity: &RequestIdentity, attempt: u32, timeout_ms: u64) -> Self {
        Self {
            version: RMCP_VERSION.to_string(),
            request_id: identity.request_id().to_string(),
            idempotency_key: identity.idempotency_key().map(str::to_string),
            attempt,
            timeout_ms,
            expect_ack: true,
        }
    }
}

/// The inbound `_meta.rmcp` object, parsed from a peer's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityMetaResponse {
    pub version: String,
    pub request_id: String,
    pub ack: bool,
    pub processed: bool,
    pub final_status: FinalStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReliabilityMetaResponse {
    /// Synthetic metadata returned when the reliability capability is not
    /// negotiated: the call passed straight through and is reported as a
    /// single successful attempt.
    #[must_use]
    pub fn synthetic_success(identity: &RequestIdentity) -> Self {
        Self {
            version: RMCP_VERSION.to_string(),
            request_id: identity.request_id().to_string(),
            ack: true,
            processed: true,
            final_status: FinalStatus::Completed,
            attempts: 1,
            error_code: None,
            error_message: None,
        }
    }

    /// Synthetic metadata for a call that failed before the peer could be
    /// reached at all (e.g. a transport-level error with no response body).
    #[must_use]
    pub fn synthetic_failure(identity: &RequestIdentity, attempts: u32, err: &ReliabilityError) -> Self {
        Self {
            version: RMCP_VERSION.to_string(),
            request_id: identity.request_id().to_string(),
            ack: false,
            processed: false,
            final_status: FinalStatus::Failed,
            attempts,
            error_code: Some(err.code().as_str().to_string()),
            error_message: Some(err.message().to_string()),
        }
    }
}

/// Embed the outbound sidecar into a request envelope at `_meta.rmcp`,
/// creating the `_meta` object if it is not already present.
pub fn embed_request_meta(
    envelope: &mut Value,
    meta: &ReliabilityMetaRequest,
) -> Result<(), ReliabilityError> {
    let meta_value = serde_json::to_value(meta).map_err(|e| {
        ReliabilityError::new(ErrorCode::InvalidArgument, "failed to serialize rmcp metadata")
            .with_source(e)
    })?;
    let obj = envelope.as_object_mut().ok_or_else(|| {
        ReliabilityError::new(ErrorCode::InvalidArgument, "request envelope is not a JSON object")
    })?;
    let meta_obj = obj
        .entry("_meta")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    meta_obj
        .as_object_mut()
        .ok_or_else(|| {
            ReliabilityError::new(ErrorCode::InvalidArgument, "_meta is not a JSON object")
        })?
        .insert("rmcp".to_string(), meta_value);
    Ok(())
}

/// Parse the inbound sidecar from `_meta.rmcp` on a response envelope.
///
/// When the sidecar is absent:
/// - if `enabled` is `true`, this is a protocol violation by the peer and
///   is reported as a terminal [`rmcp_reliability_error::ErrorKind::Sequence`]
///   error (`MISSING_RELIABILITY_METADATA`);
/// - if `enabled` is `false`, the entire response is treated as standard
///   MCP and a synthetic successful metadata is returned instead.
pub fn extract_response_meta(
    envelope: &Value,
    identity: &RequestIdentity,
    enabled: bool,
) -> Result<ReliabilityMetaResponse, ReliabilityError> {
    let found = envelope
        .get("_meta")
        .and_then(|m| m.get("rmcp"))
        .cloned();

    match found {
        Some(raw) => serde_json::from_value(raw).map_err(|e| {
            ReliabilityError::new(
                ErrorCode::MissingReliabilityMetadata,
                "malformed rmcp metadata in response",
            )
            .with_source(e)
        }),
        None if enabled => Err(ReliabilityError::new(
            ErrorCode::MissingReliabilityMetadata,
            "response is missing _meta.rmcp while the reliability capability is enabled",
        )),
        None => Ok(ReliabilityMetaResponse::synthetic_success(identity)),
    }
}
