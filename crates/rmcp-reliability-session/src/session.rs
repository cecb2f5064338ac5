// SPDX-License-Identifier: MIT OR Apache-2.0
//! The orchestrator itself: composes the concurrency semaphore, the
//! deduplication cache, the tracker registry, and the retry engine around
//! a single [`crate::McpSession`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rmcp_reliability_config::ReliabilityConfig;
use rmcp_reliability_dedup::{DedupCache, DedupTicket};
use rmcp_reliability_error::{ErrorCode, ErrorKind, ReliabilityError, ReliabilityErrorDto};
use rmcp_reliability_proto::{
    ReliabilityMetaRequest, ReliabilityMetaResponse, RequestIdentity, RmcpCapability,
    embed_request_meta, extract_response_meta,
};
use rmcp_reliability_retry::{RetryPolicy, retry_async};
use rmcp_reliability_telemetry::{CallMetrics, CallOutcome, MetricsCollector, MetricsSummary};
use rmcp_reliability_tracker::{Tracker, TrackerRegistry, TrackerStatus};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::mcp::{self, McpSession};
use crate::validate;

pub use rmcp_reliability_retry::cancel::CancellationToken;

/// Recognized peer NACK codes that are always terminal. Any other code,
/// recognized-transient or unrecognized, is treated as retryable, per the
/// error taxonomy's PeerNack rule.
const KNOWN_TERMINAL_PEER_CODES: &[&str] =
    &["invalid_argument", "permission_denied", "unknown_tool", "not_found"];

fn is_transient_nack(code: Option<&str>) -> bool {
    match code {
        Some(c) => !KNOWN_TERMINAL_PEER_CODES.contains(&c),
        None => true,
    }
}

/// Per-call overrides for [`Session::call_tool`]. All fields optional;
/// absent values fall back to the session's configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub idempotency_key: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub cancel: Option<CancellationToken>,
}

/// The tuple `(tool_payload, ReliabilityMeta)` returned by every
/// successful or terminally-failed call.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub payload: Arc<Value>,
    pub meta: ReliabilityMetaResponse,
}

/// The Session Orchestrator. Wraps a single [`McpSession`] and is the
/// public entry point of the reliability layer.
///
/// Cheaply shareable: every field is internally `Arc`-backed or a plain
/// value, so a `Session` is typically held behind an `Arc<Session<S>>` and
/// called concurrently from many tasks.
pub struct Session<S: McpSession> {
    inner: Arc<AsyncMutex<S>>,
    enabled: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
    dedup: DedupCache<CallResult>,
    tracker: Arc<TrackerRegistry>,
    metrics: Arc<MetricsCollector>,
    config: ReliabilityConfig,
}

impl<S: McpSession> Session<S> {
    #[must_use]
    pub fn new(session: S, config: ReliabilityConfig) -> Self {
        let dedup = DedupCache::new(
            Duration::from_millis(config.deduplication_window_ms),
            config.deduplication_capacity,
        );
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests as usize));
        Self {
            inner: Arc::new(AsyncMutex::new(session)),
            enabled: Arc::new(AtomicBool::new(false)),
            semaphore,
            dedup,
            tracker: Arc::new(TrackerRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            config,
        }
    }

    /// Whether the `rmcp` capability was negotiated on the last
    /// [`Session::initialize`] call.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// A read-only snapshot of every in-flight request.
    #[must_use]
    pub fn tracker_snapshot(&self) -> Vec<Tracker> {
        self.tracker.snapshot()
    }

    /// Number of currently in-flight requests.
    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.tracker.active_count()
    }

    /// Aggregate call metrics collected so far.
    #[must_use]
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Negotiate the `rmcp` capability with the peer. Not idempotent in
    /// effect (re-running negotiation can flip `enabled`), but safe to
    /// call more than once.
    pub async fn initialize(&self, mut options: Value) -> Result<Value, ReliabilityError> {
        let capability = RmcpCapability::advertise();
        mcp::advertise_capability(&mut options, &capability);

        let peer_result = {
            let mut session = self.inner.lock().await;
            session.initialize(options).await?
        };

        let compatible = mcp::peer_supports_rmcp(&peer_result);
        self.enabled.store(compatible, Ordering::SeqCst);
        debug!(enabled = compatible, "rmcp capability negotiation complete");
        Ok(peer_result)
    }

    /// Invoke a tool through the reliability layer.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        options: CallOptions,
    ) -> Result<CallResult, ReliabilityError> {
        validate::validate_tool_name(name)?;
        validate::validate_timeout_ms(options.timeout_ms)?;
        validate::validate_idempotency_key(options.idempotency_key.as_deref())?;
        let bare_envelope = serde_json::json!({"name": name, "arguments": Value::Object(arguments.clone())});
        validate::validate_message_size(&bare_envelope, self.config.max_message_size)?;

        if !self.is_enabled() {
            return self.call_tool_passthrough(name, arguments).await;
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let cancel = options.cancel.clone().unwrap_or_default();
        let _permit = self.acquire_permit(&cancel).await?;

        if let Some(key) = options.idempotency_key.clone() {
            return self
                .call_tool_deduplicated(name, arguments, key, timeout_ms, options.retry_policy, &cancel)
                .await;
        }

        let identity = RequestIdentity::new(None);
        self.execute_with_tracking(name, &arguments, &identity, timeout_ms, options.retry_policy, &cancel)
            .await
    }

    /// Wait up to a one second grace period for in-flight calls to finish,
    /// drain the dedup cache, and close the underlying session. Idempotent.
    pub async fn close(&self) -> Result<(), ReliabilityError> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.tracker.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.dedup.clear();
        let mut session = self.inner.lock().await;
        session.close().await
    }

    async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, ReliabilityError> {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::select! {
            permit = semaphore.acquire_owned() => permit.map_err(|_| {
                ReliabilityError::cancelled("concurrency semaphore was closed")
            }),
            () = cancel.cancelled() => Err(ReliabilityError::cancelled(
                "cancelled while waiting for a concurrency slot",
            )),
        }
    }

    async fn call_tool_passthrough(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallResult, ReliabilityError> {
        let envelope = serde_json::json!({"name": name, "arguments": Value::Object(arguments)});
        let response = {
            let mut session = self.inner.lock().await;
            session.call_tool(envelope).await?
        };
        let identity = RequestIdentity::new(None);
        let payload = response.get("result").cloned().unwrap_or_else(|| response.clone());
        Ok(CallResult {
            payload: Arc::new(payload),
            meta: ReliabilityMetaResponse::synthetic_success(&identity),
        })
    }

    async fn call_tool_deduplicated(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        key: String,
        timeout_ms: u64,
        retry_policy: Option<RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<CallResult, ReliabilityError> {
        match self.dedup.acquire(&key) {
            DedupTicket::Follower(follower) => {
                let start = Instant::now();
                let result = follower.wait().await;
                let outcome = match &result {
                    Ok(_) => CallOutcome::Success,
                    Err(err) if err.kind() == ErrorKind::Cancelled => CallOutcome::Cancelled,
                    Err(_) => CallOutcome::TerminalError,
                };
                self.record_metrics(name, 0, start.elapsed(), true, outcome);
                result
            }
            DedupTicket::Leader(leader) => {
                let identity = RequestIdentity::new(Some(key));
                let result = self
                    .execute_with_tracking(name, &arguments, &identity, timeout_ms, retry_policy, cancel)
                    .await;
                match &result {
                    Ok(value) => leader.complete(Ok(value.clone())),
                    Err(err) => leader.complete(Err(ReliabilityErrorDto::from(err).into())),
                }
                result
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_with_tracking(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        identity: &RequestIdentity,
        timeout_ms: u64,
        retry_policy: Option<RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<CallResult, ReliabilityError> {
        let policy = retry_policy.unwrap_or_else(|| RetryPolicy::from_config(&self.config.retry));
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let request_id = identity.request_id();
        self.tracker.register(request_id);
        let start = Instant::now();

        let inner_for_body = Arc::clone(&self.inner);
        let tracker_for_body = Arc::clone(&self.tracker);
        let name_for_body = name.to_string();
        let arguments_for_body = arguments.clone();
        let identity_for_body = identity.clone();

        let outcome = retry_async(
            &policy,
            deadline,
            cancel,
            move |attempt| {
                let inner = Arc::clone(&inner_for_body);
                let tracker = Arc::clone(&tracker_for_body);
                let name = name_for_body.clone();
                let arguments = arguments_for_body.clone();
                let identity = identity_for_body.clone();
                async move {
                    let mut envelope =
                        serde_json::json!({"name": name, "arguments": Value::Object(arguments)});
                    let req_meta = ReliabilityMetaRequest::new(&identity, attempt, timeout_ms);
                    embed_request_meta(&mut envelope, &req_meta)?;

                    let response = {
                        let mut session = inner.lock().await;
                        session.call_tool(envelope).await?
                    };

                    let meta = extract_response_meta(&response, &identity, true)?;
                    if meta.ack && !meta.processed {
                        return Err(ReliabilityError::new(
                            ErrorCode::AckWithoutProcessing,
                            "peer acknowledged the call without processing it",
                        ));
                    }
                    if !meta.ack {
                        let transient = is_transient_nack(meta.error_code.as_deref());
                        let code = if transient {
                            ErrorCode::PeerNackTransient
                        } else {
                            ErrorCode::PeerNackTerminal
                        };
                        return Err(ReliabilityError::new(
                            code,
                            meta.error_message
                                .clone()
                                .unwrap_or_else(|| "peer returned ack=false".to_string()),
                        )
                        .retryable(transient));
                    }

                    tracker.update_status(identity.request_id(), TrackerStatus::Acked, None, None);
                    let payload = response.get("result").cloned().unwrap_or_else(|| response.clone());
                    Ok(CallResult { payload: Arc::new(payload), meta })
                }
            },
            {
                let tracker = Arc::clone(&self.tracker);
                move |attempt| tracker.update_status(request_id, TrackerStatus::Sent, Some(attempt), None)
            },
            {
                let tracker = Arc::clone(&self.tracker);
                move |attempt, _delay| {
                    tracker.update_status(request_id, TrackerStatus::Retrying, Some(attempt), None)
                }
            },
        )
        .await;

        let elapsed = start.elapsed();

        match outcome {
            Ok(retry_outcome) => {
                self.tracker.update_status(
                    request_id,
                    TrackerStatus::Completed,
                    Some(retry_outcome.metadata.attempts),
                    None,
                );
                self.tracker.unregister(request_id);
                self.record_metrics(name, retry_outcome.metadata.attempts, elapsed, false, CallOutcome::Success);
                Ok(retry_outcome.value)
            }
            Err(err) => {
                let attempts = err
                    .details()
                    .get("attempts")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(1) as u32;
                let outcome = if err.kind() == ErrorKind::Cancelled {
                    CallOutcome::Cancelled
                } else {
                    CallOutcome::TerminalError
                };
                let dto = ReliabilityErrorDto::from(&err);
                self.tracker
                    .update_status(request_id, TrackerStatus::Failed, Some(attempts), Some(dto));
                self.tracker.unregister(request_id);
                self.record_metrics(name, attempts, elapsed, false, outcome);
                Err(err)
            }
        }
    }

    fn record_metrics(
        &self,
        name: &str,
        attempts: u32,
        elapsed: Duration,
        dedup_hit: bool,
        outcome: CallOutcome,
    ) {
        self.metrics.record(CallMetrics {
            tool_name: name.to_string(),
            attempts,
            duration_ms: elapsed.as_millis() as u64,
            dedup_hit,
            outcome,
        });
    }
}
