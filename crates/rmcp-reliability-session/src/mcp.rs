// SPDX-License-Identifier: MIT OR Apache-2.0
//! The narrow capability an underlying MCP session must expose to be
//! wrapped by a [`crate::Session`]. Re-expressed here as a small trait
//! instead of the duck typing a dynamically-typed host would use.

use async_trait::async_trait;
use rmcp_reliability_error::ReliabilityError;
use rmcp_reliability_proto::RmcpCapability;
use serde_json::Value;

/// Anything that can send MCP `initialize` and `tools/call` envelopes and
/// read back their responses.
///
/// Implementations own the actual transport (stdio framing, WebSocket,
/// in-process test double, ...); this crate never constructs one itself.
/// A given session must not be shared between two [`crate::Session`]
/// wrappers: the orchestrator assumes it alone serializes sends against it.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Send the MCP `initialize` request and return the peer's raw
    /// `InitializeResult` envelope. `options` is the caller-supplied
    /// initialize payload before the `experimental.rmcp` block is merged in.
    async fn initialize(&mut self, options: Value) -> Result<Value, ReliabilityError>;

    /// Send one `tools/call` envelope (already carrying `_meta.rmcp`) and
    /// return the peer's raw response envelope.
    async fn call_tool(&mut self, envelope: Value) -> Result<Value, ReliabilityError>;

    /// Close the underlying session, if it has a notion of one. Default is
    /// a no-op for sessions with nothing to close.
    async fn close(&mut self) -> Result<(), ReliabilityError> {
        Ok(())
    }
}

/// Merge `experimental.rmcp` (this side's advertised capability) into an
/// `initialize` request payload.
pub(crate) fn advertise_capability(options: &mut Value, capability: &RmcpCapability) {
    let obj = match options.as_object_mut() {
        Some(obj) => obj,
        None => {
            *options = Value::Object(serde_json::Map::new());
            options.as_object_mut().expect("just constructed as object")
        }
    };
    let experimental = obj
        .entry("experimental")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(experimental_obj) = experimental.as_object_mut() {
        experimental_obj.insert(
            "rmcp".to_string(),
            serde_json::to_value(capability).unwrap_or(Value::Null),
        );
    }
}

/// Whether the peer's `InitializeResult` echoes a compatible `rmcp`
/// capability under `capabilities.experimental.rmcp`.
pub(crate) fn peer_supports_rmcp(peer_result: &Value) -> bool {
    peer_result
        .get("capabilities")
        .and_then(|c| c.get("experimental"))
        .and_then(|e| e.get("rmcp"))
        .and_then(|raw| serde_json::from_value::<RmcpCapability>(raw.clone()).ok())
        .is_some_and(|cap| cap.is_compatible())
}
