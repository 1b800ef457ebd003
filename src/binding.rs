//! Cluster binding engine.
//!
//! Binds every entry of a profile independently: a failing attribute never
//! stops its siblings. Timeouts and transport errors are retried with bounded
//! exponential backoff; a missing cluster is not.
//!
//! Tuya datapoints cannot be subscribed one at a time. They are bound as a
//! group by asking the device to report every datapoint once; from then on
//! it pushes changes by itself.

use crate::diagnostics::{DiagnosticContext, DiagnosticKind, DiagnosticsSink};
use crate::error::RadioError;
use crate::fingerprint::{DeviceFingerprint, NodeId};
use crate::radio::{AttributeAddress, ClusterAddress, RadioStack, ReportHandle};
use crate::registry::{BindingKey, CapabilityProfile};
use crate::session::{BindingHandle, BindingState, HandleMode, NodeSession, NodeState};
use crate::zcl::tuya::{self, Datapoint, DatapointFrame};
use crate::zcl::{cluster, cluster_name};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of one `bind` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindResult {
    pub bound: Vec<BindingKey>,
    /// Already bound and left untouched.
    pub reused: Vec<BindingKey>,
    pub degraded: Vec<BindingKey>,
    pub unavailable: Vec<BindingKey>,
    /// Handles dropped because the profile no longer contains them.
    pub released: Vec<BindingKey>,
    /// Values read while setting up polled bindings.
    pub initial_values: Vec<(BindingKey, Vec<u8>)>,
    pub cancelled: bool,
}

impl BindResult {
    /// Lifecycle state the session should settle in.
    pub fn node_state(&self) -> NodeState {
        if self.degraded.is_empty() && self.unavailable.is_empty() {
            NodeState::Ready
        } else {
            NodeState::PartiallyReady
        }
    }

    fn record(&mut self, keys: impl IntoIterator<Item = BindingKey>, attempt: &Attempt) {
        let target = match attempt {
            Attempt::Bound(_) => &mut self.bound,
            Attempt::Unavailable => &mut self.unavailable,
            Attempt::Degraded => &mut self.degraded,
            Attempt::Cancelled => {
                self.cancelled = true;
                return;
            }
        };
        target.extend(keys);
    }
}

enum Attempt {
    Bound(Option<Vec<u8>>),
    Unavailable,
    Degraded,
    Cancelled,
}

/// How a retried request ended.
enum Retried<T> {
    Done(T),
    /// The device lacks the cluster; never retried.
    Unsupported(RadioError),
    Exhausted(RadioError),
    Cancelled,
}

/// What a successful attribute bind set up.
enum Subscribed {
    Report(ReportHandle),
    /// Reporting refused; carries the first value read.
    Poll(Vec<u8>),
}

pub struct ClusterBindingManager {
    radio: Arc<dyn RadioStack>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    retry: RetryPolicy,
    call_timeout: Duration,
    in_flight: Arc<Semaphore>,
    /// Tuya frame sequence numbers.
    next_seq: AtomicU16,
}

impl ClusterBindingManager {
    pub fn new(
        radio: Arc<dyn RadioStack>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        retry: RetryPolicy,
        call_timeout: Duration,
        max_concurrent_binds: usize,
    ) -> Self {
        Self {
            radio,
            diagnostics,
            retry,
            call_timeout,
            in_flight: Arc::new(Semaphore::new(max_concurrent_binds.max(1))),
            next_seq: AtomicU16::new(0),
        }
    }

    /// Bring the session's handles in line with `profile`.
    ///
    /// Bound handles for unchanged bindings are reused, handles the profile
    /// no longer contains are released, everything else is (re)bound.
    pub async fn bind(
        &self,
        session: &mut NodeSession,
        profile: &CapabilityProfile,
        cancel: &CancellationToken,
    ) -> BindResult {
        let mut result = BindResult::default();

        let stale: Vec<BindingKey> = session
            .bindings
            .iter()
            .filter(|(key, handle)| profile.binding(**key) != Some(&handle.binding))
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(handle) = session.bindings.remove(&key) {
                self.release(session.node, &handle).await;
                result.released.push(key);
            }
        }

        let mut datapoints: Vec<BindingHandle> = Vec::new();
        for binding in &profile.bindings {
            let key = binding.key();
            if let Some(existing) = session.bindings.get(&key) {
                match existing.state {
                    BindingState::Bound => {
                        result.reused.push(key);
                        continue;
                    }
                    BindingState::Unavailable => {
                        result.unavailable.push(key);
                        continue;
                    }
                    BindingState::Pending | BindingState::Degraded => {}
                }
            }

            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let endpoint = session.endpoint_for(binding.cluster);
            let mut handle = BindingHandle::pending(binding.clone(), endpoint);
            if binding.is_datapoint() {
                datapoints.push(handle);
                continue;
            }

            let address = session.address(endpoint, key);
            let attempt = self.bind_one(&mut handle, address, &session.fingerprint, cancel).await;
            if let Attempt::Bound(Some(raw)) = &attempt {
                result.initial_values.push((key, raw.clone()));
            }
            result.record([key], &attempt);
            session.bindings.insert(key, handle);

            if result.cancelled {
                break;
            }
        }

        if !datapoints.is_empty() && !result.cancelled {
            let attempt = self
                .bind_datapoints(&mut datapoints, session.node, &session.fingerprint, cancel)
                .await;
            result.record(datapoints.iter().map(|h| h.binding.key()), &attempt);
            for handle in datapoints {
                session.bindings.insert(handle.binding.key(), handle);
            }
        }

        info!(
            "[Binding] {} '{}': {} bound, {} reused, {} degraded, {} unavailable, {} released{}",
            session.node,
            profile.name,
            result.bound.len(),
            result.reused.len(),
            result.degraded.len(),
            result.unavailable.len(),
            result.released.len(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
        result
    }

    /// Release every handle. Safe on a session with no or partial bindings.
    pub async fn unbind(&self, session: &mut NodeSession) {
        let handles: Vec<BindingHandle> = session.bindings.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            self.release(session.node, handle).await;
        }
        if !handles.is_empty() {
            info!("[Binding] {} released {} binding(s)", session.node, handles.len());
        }
    }

    /// Read an attribute, bounded by the call timeout.
    pub async fn read(&self, address: AttributeAddress) -> Result<Vec<u8>, RadioError> {
        tokio::time::timeout(self.call_timeout, self.radio.read_attribute(address))
            .await
            .unwrap_or(Err(RadioError::Timeout))
    }

    /// Write an attribute, bounded by the call timeout.
    pub async fn write(&self, address: AttributeAddress, raw: Vec<u8>) -> Result<Vec<u8>, RadioError> {
        tokio::time::timeout(self.call_timeout, self.radio.write_attribute(address, raw))
            .await
            .unwrap_or(Err(RadioError::Timeout))
    }

    /// Send one datapoint as a Tuya data request, bounded by the call timeout.
    ///
    /// The device confirms with a datapoint response carrying the new value.
    pub async fn write_datapoint(&self, address: ClusterAddress, datapoint: Datapoint) -> Result<(), RadioError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!("[Binding] {} seq {} sending {}", address, seq, datapoint);
        let frame = DatapointFrame::new(seq, vec![datapoint]).encode();
        tokio::time::timeout(
            self.call_timeout,
            self.radio.send_command(address, tuya::command::DATA_REQUEST, frame),
        )
        .await
        .unwrap_or(Err(RadioError::Timeout))
    }

    async fn bind_one(
        &self,
        handle: &mut BindingHandle,
        address: AttributeAddress,
        fingerprint: &DeviceFingerprint,
        cancel: &CancellationToken,
    ) -> Attempt {
        let policy = handle.binding.reporting;
        let (outcome, attempts) = self
            .with_retry(address, cancel, move || async move {
                match self.call(cancel, self.radio.subscribe_report(address, policy)).await? {
                    Ok(report) => Some(Ok(Subscribed::Report(report))),
                    Err(RadioError::ReportingUnsupported) => {
                        let read = self.call(cancel, self.radio.read_attribute(address)).await?;
                        Some(read.map(Subscribed::Poll))
                    }
                    Err(e) => Some(Err(e)),
                }
            })
            .await;
        handle.attempts = attempts;

        match outcome {
            Retried::Done(Subscribed::Report(report)) => {
                debug!("[Binding] {} subscribed as {}", address, report);
                handle.state = BindingState::Bound;
                handle.mode = Some(HandleMode::Report(report));
                handle.last_error = None;
                Attempt::Bound(None)
            }
            Retried::Done(Subscribed::Poll(raw)) => {
                let interval = Duration::from_secs(policy.max_interval as u64);
                info!("[Binding] {} cannot report, polling every {:?}", address, interval);
                handle.state = BindingState::Bound;
                handle.mode = Some(HandleMode::Poll {
                    interval,
                    next_due: Instant::now() + interval,
                });
                handle.last_error = None;
                Attempt::Bound(Some(raw))
            }
            Retried::Unsupported(error) => {
                self.mark_unavailable(handle, address, fingerprint, &error);
                Attempt::Unavailable
            }
            Retried::Exhausted(error) => {
                self.mark_degraded(handle, address, fingerprint, &error);
                Attempt::Degraded
            }
            Retried::Cancelled => Attempt::Cancelled,
        }
    }

    /// Bind a profile's datapoints with a single data query.
    async fn bind_datapoints(
        &self,
        handles: &mut [BindingHandle],
        node: NodeId,
        fingerprint: &DeviceFingerprint,
        cancel: &CancellationToken,
    ) -> Attempt {
        let endpoint = handles.first().map(|h| h.endpoint).unwrap_or(1);
        let address = ClusterAddress {
            node,
            endpoint,
            cluster: cluster::TUYA_PRIVATE,
        };
        let (outcome, attempts) = self
            .with_retry(address, cancel, move || async move {
                self.call(
                    cancel,
                    self.radio.send_command(address, tuya::command::DATA_QUERY, Vec::new()),
                )
                .await
            })
            .await;

        for handle in handles.iter_mut() {
            handle.attempts = attempts;
        }
        match outcome {
            Retried::Done(()) => {
                debug!("[Binding] {} queried {} datapoint(s)", address, handles.len());
                for handle in handles.iter_mut() {
                    handle.state = BindingState::Bound;
                    handle.mode = Some(HandleMode::Datapoint);
                    handle.last_error = None;
                }
                Attempt::Bound(None)
            }
            Retried::Unsupported(error) => {
                for handle in handles.iter_mut() {
                    self.mark_unavailable(handle, address, fingerprint, &error);
                }
                Attempt::Unavailable
            }
            Retried::Exhausted(error) => {
                for handle in handles.iter_mut() {
                    self.mark_degraded(handle, address, fingerprint, &error);
                }
                Attempt::Degraded
            }
            Retried::Cancelled => Attempt::Cancelled,
        }
    }

    /// Run `request` until it succeeds, the cluster turns out to be missing,
    /// the retry budget runs out or the session is cancelled.
    ///
    /// `request` yields `None` when it was cancelled mid-call. Also returns
    /// the number of attempts made.
    async fn with_retry<T, F, Fut>(
        &self,
        target: impl fmt::Display,
        cancel: &CancellationToken,
        mut request: F,
    ) -> (Retried<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<Result<T, RadioError>>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match request().await {
                None => return (Retried::Cancelled, attempt),
                Some(Ok(value)) => return (Retried::Done(value), attempt),
                Some(Err(e)) => e,
            };
            if let RadioError::ClusterUnsupported(_) = error {
                return (Retried::Unsupported(error), attempt);
            }
            if attempt >= max_attempts {
                return (Retried::Exhausted(error), attempt);
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                "[Binding] {} attempt {}/{} failed: {}; retrying in {:?}",
                target, attempt, max_attempts, error, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return (Retried::Cancelled, attempt),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn mark_unavailable(
        &self,
        handle: &mut BindingHandle,
        target: impl fmt::Display,
        fingerprint: &DeviceFingerprint,
        error: &RadioError,
    ) {
        let cluster = handle.binding.cluster;
        warn!(
            "[Binding] {} '{}' unavailable: {} cluster 0x{:04X} not on device",
            target,
            handle.binding.capability,
            cluster_name(cluster),
            cluster
        );
        handle.state = BindingState::Unavailable;
        handle.last_error = Some(error.to_string());
        self.diagnostics.record(
            fingerprint,
            DiagnosticContext::new(
                DiagnosticKind::ClusterUnsupported,
                format!("{} for '{}'", error, handle.binding.capability),
            ),
        );
    }

    fn mark_degraded(
        &self,
        handle: &mut BindingHandle,
        target: impl fmt::Display,
        fingerprint: &DeviceFingerprint,
        error: &RadioError,
    ) {
        warn!(
            "[Binding] {} '{}' degraded after {} attempt(s): {}",
            target, handle.binding.capability, handle.attempts, error
        );
        handle.state = BindingState::Degraded;
        handle.last_error = Some(error.to_string());
        self.diagnostics.record(
            fingerprint,
            DiagnosticContext::new(
                DiagnosticKind::BindDegraded,
                format!(
                    "{} '{}' after {} attempt(s): {}",
                    handle.binding.key(),
                    handle.binding.capability,
                    handle.attempts,
                    error
                ),
            ),
        );
    }

    /// Run one radio call under the in-flight limit and the call timeout.
    ///
    /// `None` means the session was cancelled; the call is abandoned.
    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        request: impl Future<Output = Result<T, RadioError>>,
    ) -> Option<Result<T, RadioError>> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = self.in_flight.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return Some(Err(RadioError::Transport("bind limiter closed".into())));
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.call_timeout, request) => {
                Some(result.unwrap_or(Err(RadioError::Timeout)))
            }
        }
    }

    async fn release(&self, node: NodeId, handle: &BindingHandle) {
        let Some(report) = handle.report_handle() else {
            return;
        };
        match tokio::time::timeout(self.call_timeout, self.radio.cancel_report(report)).await {
            Ok(Ok(())) => debug!("[Binding] {} released {}", node, report),
            Ok(Err(e)) => warn!("[Binding] {} failed to release {}: {}", node, report, e),
            Err(_) => warn!("[Binding] {} timed out releasing {}", node, report),
        }
    }
}
