// SPDX-License-Identifier: MIT OR Apache-2.0
//! Input validation for `call_tool`. Checked before any resource
//! (semaphore, tracker, dedup entry) is acquired.

use rmcp_reliability_error::{ErrorCode, ReliabilityError};

const MAX_TOOL_NAME_LEN: usize = 128;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const MAX_TIMEOUT_MS: u64 = 600_000;

/// `[A-Za-z0-9_-]+`, length 1..=128.
pub(crate) fn validate_tool_name(name: &str) -> Result<(), ReliabilityError> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(ReliabilityError::new(
            ErrorCode::InvalidToolName,
            format!("tool name length must be in 1..={MAX_TOOL_NAME_LEN}, got {}", name.len()),
        ));
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(ReliabilityError::new(
            ErrorCode::InvalidToolName,
            format!("tool name `{name}` does not match [A-Za-z0-9_-]+"),
        )
        .with_detail("tool_name", name));
    }
    Ok(())
}

pub(crate) fn validate_timeout_ms(timeout_ms: Option<u64>) -> Result<(), ReliabilityError> {
    match timeout_ms {
        Some(ms) if ms == 0 || ms > MAX_TIMEOUT_MS => Err(ReliabilityError::new(
            ErrorCode::InvalidTimeout,
            format!("timeout_ms must be in [1, {MAX_TIMEOUT_MS}], got {ms}"),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn validate_idempotency_key(key: Option<&str>) -> Result<(), ReliabilityError> {
    match key {
        Some(k) if k.is_empty() || k.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(ReliabilityError::new(
            ErrorCode::InvalidIdempotencyKey,
            format!(
                "idempotency_key length must be in 1..={MAX_IDEMPOTENCY_KEY_LEN}, got {}",
                k.len()
            ),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn validate_message_size(
    envelope: &serde_json::Value,
    max_message_size: u64,
) -> Result<(), ReliabilityError> {
    let size = serde_json::to_vec(envelope)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(u64::MAX);
    if size > max_message_size {
        return Err(ReliabilityError::new(
            ErrorCode::MessageTooLarge,
            format!("serialized request is {size} bytes, exceeds max_message_size {max_message_size}"),
        ));
    }
    Ok(())
}
