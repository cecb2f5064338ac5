// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-session
#![deny(unsafe_code)]
//!
//! The Session Orchestrator: the public entry point of the reliability
//! layer. [`Session::initialize`] negotiates the `rmcp` capability with an
//! underlying [`McpSession`]; [`Session::call_tool`] then composes the
//! concurrency semaphore, deduplication cache, request tracker, and retry
//! engine around a single underlying invocation.

mod mcp;
mod session;
mod validate;

pub use mcp::McpSession;
pub use session::{CallOptions, CallResult, CancellationToken, Session};

pub use rmcp_reliability_config::ReliabilityConfig;
pub use rmcp_reliability_error::{ErrorCode, ErrorKind, ReliabilityError, ReliabilityErrorDto};
pub use rmcp_reliability_retry::RetryPolicy;
pub use rmcp_reliability_telemetry::{CallMetrics, CallOutcome, MetricsSummary};
pub use rmcp_reliability_tracker::{Tracker, TrackerStatus};
