//! Node lifecycle supervision.
//!
//! Every known node gets one session task. The task owns its [`NodeSession`]
//! and is the only place that session is mutated; everything else talks to it
//! through its queues and reads the [`NodeStatus`] snapshot the task publishes
//! after each step.
//!
//! Radio events are handed over without waiting. Control commands go through
//! an unbounded queue that the task keeps draining while it binds; reports go
//! through a bounded queue and are dropped when it is full, so one slow node
//! never holds up the others.

use crate::binding::ClusterBindingManager;
use crate::diagnostics::{DiagnosticContext, DiagnosticKind, DiagnosticsSink};
use crate::error::CapabilityError;
use crate::fingerprint::{DeviceFingerprint, NodeId};
use crate::matcher::FingerprintMatcher;
use crate::radio::{AttributeAddress, ClusterAddress, RadioEvent};
use crate::registry::{BindingKey, RegistryHandle};
use crate::session::{BindingState, HandleMode, NodeSession, NodeState, NodeStatus};
use crate::translate::{CapabilityValue, ValueTranslator};
use crate::zcl::tuya::{self, Datapoint, DatapointFrame};
use crate::zcl::{cluster, cluster_name};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REPORT_QUEUE: usize = 32;
const EVENT_BUFFER: usize = 256;

/// Emitted whenever a capability takes a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEvent {
    pub node: NodeId,
    pub capability: String,
    pub value: CapabilityValue,
}

enum SessionCommand {
    Announce(DeviceFingerprint),
    Offline,
    /// The registry was swapped.
    Rematch,
    Set {
        capability: String,
        value: CapabilityValue,
        reply: oneshot::Sender<Result<(), CapabilityError>>,
    },
}

enum SessionReport {
    Attribute {
        endpoint: u8,
        key: BindingKey,
        raw: Vec<u8>,
    },
    /// Payload of a Tuya report or response.
    Datapoints { endpoint: u8, payload: Vec<u8> },
}

struct SessionEntry {
    control: mpsc::UnboundedSender<SessionCommand>,
    reports: mpsc::Sender<SessionReport>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: Arc<RwLock<NodeStatus>>,
}

/// Collaborators every session task needs.
#[derive(Clone)]
struct SessionContext {
    registry: Arc<RegistryHandle>,
    matcher: FingerprintMatcher,
    binder: Arc<ClusterBindingManager>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    events: broadcast::Sender<CapabilityEvent>,
    poll_tick: Duration,
}

pub struct NodeLifecycleSupervisor {
    context: SessionContext,
    sessions: Mutex<HashMap<NodeId, SessionEntry>>,
}

impl NodeLifecycleSupervisor {
    pub fn new(
        registry: Arc<RegistryHandle>,
        binder: Arc<ClusterBindingManager>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        poll_tick: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            context: SessionContext {
                registry,
                matcher: FingerprintMatcher::new(diagnostics.clone()),
                binder,
                diagnostics,
                events,
                poll_tick,
            },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Consume radio events until the channel closes, then shut down.
    pub async fn run(&self, mut events: mpsc::Receiver<RadioEvent>) {
        info!("[Supervisor] Waiting for radio events");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("[Supervisor] Radio event stream ended");
        self.shutdown().await;
    }

    /// Route one radio event to its session. Never waits on a session.
    pub fn handle_event(&self, event: RadioEvent) {
        let node = event.node();
        match event {
            RadioEvent::NodeAnnounce { fingerprint } => {
                let mut sessions = self.sessions.lock();
                match sessions.get(&node) {
                    Some(entry) => {
                        let _ = entry.control.send(SessionCommand::Announce(fingerprint));
                    }
                    None => {
                        let entry = self.spawn_session(fingerprint);
                        sessions.insert(node, entry);
                    }
                }
            }
            RadioEvent::AttributeReport {
                endpoint,
                cluster,
                attribute,
                raw,
                ..
            } => {
                let key = BindingKey { cluster, attribute };
                self.report(node, SessionReport::Attribute { endpoint, key, raw });
            }
            RadioEvent::ClusterCommand {
                endpoint,
                cluster: cluster_id,
                command,
                payload,
                ..
            } => {
                if cluster_id == cluster::TUYA_PRIVATE && tuya::command::carries_datapoints(command) {
                    self.report(node, SessionReport::Datapoints { endpoint, payload });
                } else {
                    debug!(
                        "[Supervisor] {} command 0x{:02X} on {} cluster ignored",
                        node,
                        command,
                        cluster_name(cluster_id)
                    );
                }
            }
            RadioEvent::NodeOffline { .. } => self.command(node, SessionCommand::Offline),
            RadioEvent::NodeRemoved { .. } => self.detach(node),
        }
    }

    /// Tell every session the registry changed.
    pub fn registry_reloaded(&self) {
        let sessions = self.sessions.lock();
        info!("[Supervisor] Re-matching {} session(s)", sessions.len());
        for entry in sessions.values() {
            let _ = entry.control.send(SessionCommand::Rematch);
        }
    }

    /// Cancel a session, wait for it to release its bindings, forget it.
    pub async fn remove(&self, node: NodeId) {
        let Some(entry) = self.sessions.lock().remove(&node) else {
            debug!("[Supervisor] Remove for unknown node {}", node);
            return;
        };
        info!("[Supervisor] Removing {}", node);
        entry.cancel.cancel();
        if let Err(e) = entry.task.await {
            error!("[Supervisor] Session task for {} failed: {}", node, e);
        }
    }

    /// Tear down every session, releasing bindings concurrently.
    pub async fn shutdown(&self) {
        let entries: Vec<(NodeId, SessionEntry)> = self.sessions.lock().drain().collect();
        if entries.is_empty() {
            return;
        }
        info!("[Supervisor] Shutting down {} session(s)", entries.len());
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        let results = join_all(entries.into_iter().map(|(node, entry)| async move {
            (node, entry.task.await)
        }))
        .await;
        for (node, result) in results {
            if let Err(e) = result {
                error!("[Supervisor] Session task for {} failed: {}", node, e);
            }
        }
    }

    pub fn get_capability_value(&self, node: NodeId, capability: &str) -> Option<CapabilityValue> {
        let sessions = self.sessions.lock();
        let status = sessions.get(&node)?.status.read();
        status.values.get(capability).cloned()
    }

    pub fn get_node_state(&self, node: NodeId) -> Option<NodeStatus> {
        self.sessions.lock().get(&node).map(|e| e.status.read().clone())
    }

    /// Snapshots of every session, ordered by node.
    pub fn nodes(&self) -> Vec<NodeStatus> {
        let mut all: Vec<NodeStatus> = self
            .sessions
            .lock()
            .values()
            .map(|e| e.status.read().clone())
            .collect();
        all.sort_by_key(|s| s.node);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.context.events.subscribe()
    }

    /// Validate, encode and write a capability value.
    ///
    /// A node that is still binding answers `Unavailable` straight away.
    pub async fn set_capability_value(
        &self,
        node: NodeId,
        capability: &str,
        value: CapabilityValue,
    ) -> Result<(), CapabilityError> {
        let control = self
            .sessions
            .lock()
            .get(&node)
            .map(|e| e.control.clone())
            .ok_or_else(|| CapabilityError::UnknownNode(node.to_string()))?;

        let (reply, response) = oneshot::channel();
        control
            .send(SessionCommand::Set {
                capability: capability.to_string(),
                value,
                reply,
            })
            .map_err(|_| CapabilityError::Unavailable(capability.to_string()))?;

        response
            .await
            .unwrap_or_else(|_| Err(CapabilityError::Unavailable(capability.to_string())))
    }

    fn command(&self, node: NodeId, command: SessionCommand) {
        match self.sessions.lock().get(&node) {
            Some(entry) => {
                if entry.control.send(command).is_err() {
                    debug!("[Supervisor] Session for {} already ended", node);
                }
            }
            None => debug!("[Supervisor] Event for unknown node {} ignored", node),
        }
    }

    fn report(&self, node: NodeId, report: SessionReport) {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(&node) else {
            debug!("[Supervisor] Report for unknown node {} ignored", node);
            return;
        };
        match entry.reports.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("[Supervisor] {} report queue full, report dropped", node)
            }
            Err(TrySendError::Closed(_)) => debug!("[Supervisor] Session for {} already ended", node),
        }
    }

    /// Forget a session now; its task releases bindings in the background.
    fn detach(&self, node: NodeId) {
        let Some(entry) = self.sessions.lock().remove(&node) else {
            debug!("[Supervisor] Remove for unknown node {}", node);
            return;
        };
        info!("[Supervisor] Removing {}", node);
        entry.cancel.cancel();
        tokio::spawn(async move {
            if let Err(e) = entry.task.await {
                error!("[Supervisor] Session task for {} failed: {}", node, e);
            }
        });
    }

    fn spawn_session(&self, fingerprint: DeviceFingerprint) -> SessionEntry {
        info!("[Supervisor] New node {} [{}]", fingerprint.node_id, fingerprint);

        let session = NodeSession::new(fingerprint);
        let status = Arc::new(RwLock::new(session.status()));
        let (control, control_rx) = mpsc::unbounded_channel();
        let (reports, reports_rx) = mpsc::channel(REPORT_QUEUE);
        let cancel = CancellationToken::new();

        let task = SessionTask {
            session,
            translators: HashMap::new(),
            context: self.context.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
            control: control_rx,
            reports: reports_rx,
            deferred: VecDeque::new(),
        };
        SessionEntry {
            control,
            reports,
            cancel,
            task: tokio::spawn(task.run()),
            status,
        }
    }
}

struct SessionTask {
    session: NodeSession,
    translators: HashMap<BindingKey, Arc<dyn ValueTranslator>>,
    context: SessionContext,
    status: Arc<RwLock<NodeStatus>>,
    cancel: CancellationToken,
    control: mpsc::UnboundedReceiver<SessionCommand>,
    reports: mpsc::Receiver<SessionReport>,
    /// Commands that arrived while binding.
    deferred: VecDeque<SessionCommand>,
}

impl SessionTask {
    async fn run(mut self) {
        self.connect().await;

        let mut tick = tokio::time::interval(self.context.poll_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if let Some(command) = self.deferred.pop_front() {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.handle(command).await;
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.control.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(report) = self.reports.recv() => self.handle_report(report),
                _ = tick.tick() => self.poll_due().await,
            }
        }

        self.context.binder.unbind(&mut self.session).await;
        self.session.transition(NodeState::Removed);
        self.publish();
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Announce(fingerprint) => {
                self.session.touch();
                if fingerprint != self.session.fingerprint {
                    info!(
                        "[Session] {} fingerprint changed to [{}], rebinding from scratch",
                        self.session.node, fingerprint
                    );
                    self.session.fingerprint = fingerprint;
                    self.reset().await;
                }
                self.connect().await;
            }
            SessionCommand::Offline => {
                if self.session.transition(NodeState::Offline) {
                    self.publish();
                }
            }
            SessionCommand::Rematch => self.rematch().await,
            SessionCommand::Set {
                capability,
                value,
                reply,
            } => {
                let result = self.set(capability, value).await;
                let _ = reply.send(result);
            }
        }
    }

    fn handle_report(&mut self, report: SessionReport) {
        let state = self.session.state();
        if !state.is_operational() {
            debug!("[Session] {} is {}, report dropped", self.session.node, state);
            return;
        }
        self.session.touch();

        match report {
            SessionReport::Attribute { endpoint, key, raw } => {
                if self.bound_on(key, endpoint) {
                    self.apply_raw(key, &raw);
                }
            }
            SessionReport::Datapoints { endpoint, payload } => {
                let frame = match DatapointFrame::parse(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.reject(format!("datapoint frame 0x{}: {}", hex::encode(&payload), e));
                        return;
                    }
                };
                for datapoint in frame.datapoints {
                    let key = BindingKey::datapoint(datapoint.id);
                    if !self.bound_on(key, endpoint) {
                        continue;
                    }
                    let expected = self.translators.get(&key).and_then(|t| t.datapoint_type());
                    if expected != Some(datapoint.dp_type) {
                        self.reject(format!(
                            "{} arrived as {}, profile expects {}",
                            key,
                            datapoint.dp_type,
                            expected.map_or_else(|| "nothing".to_string(), |t| t.to_string())
                        ));
                        continue;
                    }
                    self.apply_raw(key, &datapoint.data);
                }
            }
        }
        self.publish();
    }

    /// Whether `key` has a handle on `endpoint`.
    fn bound_on(&self, key: BindingKey, endpoint: u8) -> bool {
        let expected = self.session.bindings.get(&key).map(|h| h.endpoint);
        if expected != Some(endpoint) {
            debug!(
                "[Session] {} ignoring report {} on endpoint {}",
                self.session.node, key, endpoint
            );
            return false;
        }
        true
    }

    /// One full match and bind cycle against the current registry snapshot.
    async fn connect(&mut self) {
        if !self.session.transition(NodeState::Matching) {
            return;
        }
        self.publish();

        let registry = self.context.registry.snapshot();
        let resolution = self.context.matcher.resolve(&registry, &self.session.fingerprint);

        if let Some(current) = &self.session.profile
            && **current != *resolution.profile
        {
            info!(
                "[Session] {} profile '{}' -> '{}', rebinding from scratch",
                self.session.node, current.name, resolution.profile.name
            );
            self.reset().await;
        }

        self.translators.clear();
        for binding in &resolution.profile.bindings {
            match registry.translator(&binding.translator) {
                Some(translator) => {
                    self.translators.insert(binding.key(), translator);
                }
                None => error!(
                    "[Session] {} profile '{}' names missing translator '{}'",
                    self.session.node, resolution.profile.name, binding.translator
                ),
            }
        }

        info!(
            "[Session] {} resolved to '{}' ({})",
            self.session.node, resolution.profile.name, resolution.kind
        );
        self.session.profile = Some(resolution.profile.clone());
        self.session.match_kind = Some(resolution.kind);
        self.session.transition(NodeState::Binding);
        self.publish();

        let node = self.session.node;
        let binder = self.context.binder.clone();
        let result = {
            let bind = binder.bind(&mut self.session, &resolution.profile, &self.cancel);
            tokio::pin!(bind);
            loop {
                tokio::select! {
                    result = &mut bind => break result,
                    Some(command) = self.control.recv() => match command {
                        SessionCommand::Set { capability, reply, .. } => {
                            debug!("[Session] {} still binding, '{}' unavailable", node, capability);
                            let _ = reply.send(Err(CapabilityError::Unavailable(capability)));
                        }
                        other => self.deferred.push_back(other),
                    },
                }
            }
        };
        if result.cancelled {
            return;
        }

        for (key, raw) in &result.initial_values {
            self.apply_raw(*key, raw);
        }
        self.session.transition(result.node_state());
        self.publish();
    }

    /// Drop every binding and value.
    async fn reset(&mut self) {
        self.context.binder.unbind(&mut self.session).await;
        self.session.values.clear();
        self.translators.clear();
        self.session.profile = None;
    }

    async fn rematch(&mut self) {
        // Offline sessions pick up the new table when they reconnect.
        if !self.session.state().is_operational() {
            return;
        }
        let registry = self.context.registry.snapshot();
        let candidate = FingerprintMatcher::select(&registry, &self.session.fingerprint);
        let unchanged = self
            .session
            .profile
            .as_ref()
            .is_some_and(|p| **p == *candidate.profile);
        if !unchanged {
            self.connect().await;
        }
    }

    fn apply_raw(&mut self, key: BindingKey, raw: &[u8]) {
        let Some(handle) = self.session.bindings.get(&key) else {
            return;
        };
        let capability = handle.binding.capability.clone();
        let Some(translator) = self.translators.get(&key) else {
            return;
        };

        match translator.decode(raw) {
            Ok(value) => {
                if self.session.values.get(&capability) == Some(&value) {
                    return;
                }
                debug!("[Session] {} {} = {}", self.session.node, capability, value);
                self.session.values.insert(capability.clone(), value.clone());
                let _ = self.context.events.send(CapabilityEvent {
                    node: self.session.node,
                    capability,
                    value,
                });
            }
            Err(e) => self.reject(format!("'{}' raw 0x{}: {}", capability, hex::encode(raw), e)),
        }
    }

    fn reject(&self, context: String) {
        warn!("[Session] {} rejected {}", self.session.node, context);
        self.context.diagnostics.record(
            &self.session.fingerprint,
            DiagnosticContext::new(DiagnosticKind::ValueRejected, context),
        );
    }

    async fn set(&mut self, capability: String, value: CapabilityValue) -> Result<(), CapabilityError> {
        let Some(profile) = self.session.profile.clone() else {
            return Err(CapabilityError::Unavailable(capability));
        };
        if profile.bindings_for(&capability).next().is_none() {
            return Err(CapabilityError::UnknownCapability(capability));
        }
        let Some(binding) = profile.bindings_for(&capability).find(|b| b.is_writable()) else {
            return Err(CapabilityError::ReadOnly(capability));
        };
        let key = binding.key();

        let Some(translator) = self.translators.get(&key).cloned() else {
            return Err(CapabilityError::Unavailable(capability));
        };
        if !translator.validate(&value) {
            return Err(CapabilityError::Validation {
                reason: format!("{} is not accepted", value),
                capability,
            });
        }
        let raw = translator
            .encode(&value)
            .map_err(|e| CapabilityError::Validation {
                capability: capability.clone(),
                reason: e.to_string(),
            })?;

        let endpoint = match self.session.bindings.get(&key) {
            Some(handle) if handle.state == BindingState::Bound && self.session.state().is_operational() => {
                handle.endpoint
            }
            _ => return Err(CapabilityError::Unavailable(capability)),
        };
        info!("[Session] {} set {} = {}", self.session.node, capability, value);

        if let Some(dp_type) = translator.datapoint_type() {
            // The device answers with a datapoint response; that sets the value.
            let address = ClusterAddress {
                node: self.session.node,
                endpoint,
                cluster: key.cluster,
            };
            let datapoint = Datapoint::new(key.attribute as u8, dp_type, raw);
            self.context.binder.write_datapoint(address, datapoint).await?;
            return Ok(());
        }

        let address = self.session.address(endpoint, key);
        let echoed = self.context.binder.write(address, raw).await?;
        self.apply_raw(key, &echoed);
        self.publish();
        Ok(())
    }

    async fn poll_due(&mut self) {
        if !self.session.state().is_operational() {
            return;
        }
        let now = Instant::now();
        let due: Vec<(BindingKey, AttributeAddress)> = self
            .session
            .bindings
            .iter()
            .filter_map(|(key, handle)| match &handle.mode {
                Some(HandleMode::Poll { next_due, .. }) if *next_due <= now => {
                    Some((*key, self.session.address(handle.endpoint, *key)))
                }
                _ => None,
            })
            .collect();
        if due.is_empty() {
            return;
        }

        for (key, address) in due {
            let result = self.context.binder.read(address).await;
            if let Some(handle) = self.session.bindings.get_mut(&key)
                && let Some(HandleMode::Poll { interval, next_due }) = &mut handle.mode
            {
                *next_due = Instant::now() + *interval;
            }
            match result {
                Ok(raw) => self.apply_raw(key, &raw),
                Err(e) => warn!("[Session] {} poll of {} failed: {}", self.session.node, address, e),
            }
        }
        self.publish();
    }

    fn publish(&self) {
        *self.status.write() = self.session.status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::RetryPolicy;
    use crate::diagnostics::DiagnosticLog;
    use crate::error::RadioError;
    use crate::input::simulation::{SimOutcome, SimulatedRadio};
    use crate::registry::{CapabilityProfile, ClusterBinding, FingerprintPattern, ProfileSource, Registry};
    use crate::session::CapabilityAvailability;
    use crate::translate::{TranslatorSet, TranslatorSpec};
    use crate::zcl::{ZclDataType, attribute, cluster};

    const CLIMATE: NodeId = NodeId(0x00124b0001a1b2c3);
    const SWITCH: NodeId = NodeId(0x00124b0001d4e5f6);
    const VALVE: NodeId = NodeId(0x00124b0001f7a8b9);

    struct Harness {
        radio: Arc<SimulatedRadio>,
        log: Arc<DiagnosticLog>,
        supervisor: NodeLifecycleSupervisor,
    }

    fn registry() -> Registry {
        let mut translators = std::collections::BTreeMap::new();
        translators.insert(
            "tuya_temperature".to_string(),
            TranslatorSpec::Numeric {
                data_type: ZclDataType::Uint32,
                divisor: 100.0,
                offset: 0.0,
                min: -40.0,
                max: 125.0,
            },
        );
        translators.insert(
            "dp_temperature".to_string(),
            TranslatorSpec::DpValue {
                divisor: 10.0,
                offset: 0.0,
                min: -40.0,
                max: 125.0,
            },
        );
        translators.insert(
            "dp_setpoint".to_string(),
            TranslatorSpec::DpValue {
                divisor: 10.0,
                offset: 0.0,
                min: 5.0,
                max: 35.0,
            },
        );
        Registry::load(ProfileSource {
            version: Some("test".into()),
            translators,
            profiles: vec![
                CapabilityProfile::new("climate", FingerprintPattern::new("_TZE200_test", "TS0601", "*"))
                    .with_binding(ClusterBinding::new(
                        cluster::HUMIDITY_MEASUREMENT,
                        attribute::MEASURED_VALUE,
                        "measure_humidity",
                        TranslatorSet::HUMIDITY,
                    ))
                    .with_binding(ClusterBinding::new(
                        cluster::TEMPERATURE_MEASUREMENT,
                        attribute::MEASURED_VALUE,
                        "measure_temperature",
                        "tuya_temperature",
                    )),
                CapabilityProfile::new("valve", FingerprintPattern::new("_TZE200_valve", "TS0601", "*"))
                    .with_binding(ClusterBinding::datapoint(24, "measure_temperature", "dp_temperature"))
                    .with_binding(
                        ClusterBinding::datapoint(16, "target_temperature", "dp_setpoint").writable(true),
                    ),
                CapabilityProfile::new("switch", FingerprintPattern::new("*", "TS0011", "*")).with_binding(
                    ClusterBinding::new(cluster::ON_OFF, attribute::ON_OFF, "onoff", TranslatorSet::ONOFF),
                ),
            ],
        })
        .unwrap()
    }

    fn harness() -> Harness {
        harness_with(SimulatedRadio::new())
    }

    fn harness_with(radio: SimulatedRadio) -> Harness {
        let radio = Arc::new(radio);
        let log = Arc::new(DiagnosticLog::new());
        let binder = Arc::new(ClusterBindingManager::new(
            radio.clone(),
            log.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
            4,
        ));
        let supervisor = NodeLifecycleSupervisor::new(
            Arc::new(RegistryHandle::new(registry())),
            binder,
            log.clone(),
            Duration::from_secs(1),
        );
        Harness { radio, log, supervisor }
    }

    fn climate() -> DeviceFingerprint {
        DeviceFingerprint::new(CLIMATE, "_TZE200_test", "TS0601")
            .with_cluster(1, cluster::TEMPERATURE_MEASUREMENT)
            .with_cluster(1, cluster::HUMIDITY_MEASUREMENT)
    }

    fn switch() -> DeviceFingerprint {
        DeviceFingerprint::new(SWITCH, "_TZ3000_abc", "TS0011").with_cluster(1, cluster::ON_OFF)
    }

    fn valve() -> DeviceFingerprint {
        DeviceFingerprint::new(VALVE, "_TZE200_valve", "TS0601").with_cluster(1, cluster::TUYA_PRIVATE)
    }

    fn report(node: NodeId, cluster: u16, raw: Vec<u8>) -> RadioEvent {
        RadioEvent::AttributeReport {
            node,
            endpoint: 1,
            cluster,
            attribute: 0,
            raw,
        }
    }

    async fn wait_for(supervisor: &NodeLifecycleSupervisor, node: NodeId, state: NodeState) -> NodeStatus {
        for _ in 0..2000 {
            if let Some(status) = supervisor.get_node_state(node)
                && status.state == state
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}", node, state);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_binds_and_reports_flow_up() {
        let h = harness();
        let mut events = h.supervisor.subscribe();

        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        let status = wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;
        assert_eq!(status.profile.as_deref(), Some("climate"));

        h.supervisor
            .handle_event(report(CLIMATE, cluster::TEMPERATURE_MEASUREMENT, 2150u32.to_le_bytes().to_vec()));
        let event = events.recv().await.unwrap();
        assert_eq!(event.capability, "measure_temperature");
        assert_eq!(event.value, CapabilityValue::Number(21.5));
        assert_eq!(
            h.supervisor.get_capability_value(CLIMATE, "measure_temperature"),
            Some(CapabilityValue::Number(21.5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_report_keeps_last_good_value() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        h.supervisor
            .handle_event(report(CLIMATE, cluster::TEMPERATURE_MEASUREMENT, 2150u32.to_le_bytes().to_vec()));
        h.supervisor
            .handle_event(report(CLIMATE, cluster::TEMPERATURE_MEASUREMENT, 4294967295u32.to_le_bytes().to_vec()));
        settle().await;

        assert_eq!(
            h.supervisor.get_capability_value(CLIMATE, "measure_temperature"),
            Some(CapabilityValue::Number(21.5))
        );
        let rejected = h.log.records_of(DiagnosticKind::ValueRejected);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].last_context.contains("measure_temperature"));
        // Binding unaffected
        assert_eq!(
            h.supervisor.get_node_state(CLIMATE).unwrap().state,
            NodeState::Ready
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_binding_leaves_siblings_available() {
        let h = harness();
        h.radio.script_subscribe(
            cluster::HUMIDITY_MEASUREMENT,
            attribute::MEASURED_VALUE,
            vec![SimOutcome::Fail(RadioError::Timeout); 3],
        );
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });

        let status = wait_for(&h.supervisor, CLIMATE, NodeState::PartiallyReady).await;
        assert_eq!(status.capabilities["measure_humidity"], CapabilityAvailability::Degraded);
        assert_eq!(status.capabilities["measure_temperature"], CapabilityAvailability::Available);
        assert_eq!(h.log.records_of(DiagnosticKind::BindDegraded).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_mid_bind_releases_partial_bindings() {
        let h = harness();
        // Humidity binds first, temperature never answers
        h.radio.script_subscribe(
            cluster::TEMPERATURE_MEASUREMENT,
            attribute::MEASURED_VALUE,
            vec![SimOutcome::Hang],
        );
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Binding).await;
        settle().await;
        assert_eq!(h.radio.active_subscriptions().len(), 1);

        h.supervisor.handle_event(RadioEvent::NodeRemoved { node: CLIMATE });
        assert!(h.supervisor.get_node_state(CLIMATE).is_none());
        settle().await;
        assert!(h.radio.active_subscriptions().is_empty());
        assert_eq!(h.radio.cancelled_reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reuses_bindings() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        h.supervisor.handle_event(RadioEvent::NodeOffline { node: CLIMATE });
        let offline = wait_for(&h.supervisor, CLIMATE, NodeState::Offline).await;
        assert!(offline
            .capabilities
            .values()
            .all(|a| *a == CapabilityAvailability::Unavailable));

        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        settle().await;
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;
        assert_eq!(h.radio.subscribe_calls().len(), 2);
        assert_eq!(h.radio.active_subscriptions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_fingerprint_forces_full_rebind() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        let updated = climate().with_product("v2");
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: updated });
        settle().await;
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        assert_eq!(h.radio.cancelled_reports().len(), 2);
        assert_eq!(h.radio.subscribe_calls().len(), 4);
        assert_eq!(h.radio.active_subscriptions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_validates_before_radio() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        let wrong = h
            .supervisor
            .set_capability_value(SWITCH, "onoff", CapabilityValue::Number(5.0))
            .await;
        assert!(matches!(wrong, Err(CapabilityError::Validation { .. })));
        assert!(h.radio.writes().is_empty());

        let read_only = h
            .supervisor
            .set_capability_value(CLIMATE, "measure_temperature", CapabilityValue::Number(20.0))
            .await;
        assert_eq!(read_only, Err(CapabilityError::ReadOnly("measure_temperature".into())));

        let unknown = h
            .supervisor
            .set_capability_value(SWITCH, "dim", CapabilityValue::Number(0.5))
            .await;
        assert_eq!(unknown, Err(CapabilityError::UnknownCapability("dim".into())));

        let nobody = h
            .supervisor
            .set_capability_value(NodeId(1), "onoff", CapabilityValue::Bool(true))
            .await;
        assert!(matches!(nobody, Err(CapabilityError::UnknownNode(_))));

        h.supervisor
            .set_capability_value(SWITCH, "onoff", CapabilityValue::Bool(true))
            .await
            .unwrap();
        assert_eq!(h.radio.writes().len(), 1);
        assert_eq!(
            h.supervisor.get_capability_value(SWITCH, "onoff"),
            Some(CapabilityValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_on_offline_node_is_unavailable() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        h.supervisor.handle_event(RadioEvent::NodeOffline { node: SWITCH });
        wait_for(&h.supervisor, SWITCH, NodeState::Offline).await;

        let result = h
            .supervisor
            .set_capability_value(SWITCH, "onoff", CapabilityValue::Bool(true))
            .await;
        assert_eq!(result, Err(CapabilityError::Unavailable("onoff".into())));
        assert!(h.radio.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_devices_share_one_diagnostic() {
        let h = harness();
        for node in [NodeId(0xA1), NodeId(0xA2)] {
            let fp = DeviceFingerprint::new(node, "_TZ3000_mystery", "TS0049").with_cluster(1, cluster::ON_OFF);
            h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: fp });
            let status = wait_for(&h.supervisor, node, NodeState::Ready).await;
            assert_eq!(status.match_kind, Some(crate::matcher::MatchKind::Unmatched));
            assert!(status.capabilities.contains_key("onoff"));
        }
        let unmatched = h.log.records_of(DiagnosticKind::UnmatchedFingerprint);
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_binding_is_read_on_tick() {
        let h = harness();
        let fp = switch();
        let address = AttributeAddress {
            node: SWITCH,
            endpoint: 1,
            cluster: cluster::ON_OFF,
            attribute: attribute::ON_OFF,
        };
        h.radio.script_subscribe(cluster::ON_OFF, attribute::ON_OFF, vec![SimOutcome::Fail(RadioError::ReportingUnsupported)]);
        h.radio.set_attribute(address, vec![0]);

        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: fp });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        assert_eq!(
            h.supervisor.get_capability_value(SWITCH, "onoff"),
            Some(CapabilityValue::Bool(false))
        );

        // Device changes state without reporting; picked up after max_interval
        h.radio.set_attribute(address, vec![1]);
        tokio::time::sleep(Duration::from_secs(302)).await;
        assert_eq!(
            h.supervisor.get_capability_value(SWITCH, "onoff"),
            Some(CapabilityValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_every_session() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;

        let nodes: Vec<NodeId> = h.supervisor.nodes().iter().map(|s| s.node).collect();
        assert_eq!(nodes, vec![CLIMATE, SWITCH]);
        assert_eq!(h.radio.active_subscriptions().len(), 3);

        h.supervisor.shutdown().await;
        assert!(h.supervisor.nodes().is_empty());
        assert!(h.radio.active_subscriptions().is_empty());
        assert_eq!(h.radio.cancelled_reports().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_rebinds_when_profile_changes() {
        let h = harness();
        let handle = h.supervisor.context.registry.clone();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;

        handle.replace(Registry::empty());
        h.supervisor.registry_reloaded();
        settle().await;

        let status = wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        assert_eq!(status.profile.as_deref(), Some(crate::matcher::FALLBACK_PROFILE));
        // Same attribute under the fallback profile; the old handle was released
        assert_eq!(h.radio.cancelled_reports().len(), 1);
        assert_eq!(h.radio.active_subscriptions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_bind_does_not_hold_up_other_nodes() {
        let h = harness();
        h.radio.script_subscribe(
            cluster::TEMPERATURE_MEASUREMENT,
            attribute::MEASURED_VALUE,
            vec![SimOutcome::Hang; 3],
        );
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Binding).await;

        // More reports than the queue holds, while the node is busy binding
        for _ in 0..40 {
            h.supervisor
                .handle_event(report(CLIMATE, cluster::HUMIDITY_MEASUREMENT, 5000u16.to_le_bytes().to_vec()));
        }
        let started = std::time::Instant::now();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        assert!(started.elapsed() < Duration::from_secs(1));

        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        assert_eq!(h.supervisor.get_node_state(CLIMATE).unwrap().state, NodeState::Binding);

        let busy = h
            .supervisor
            .set_capability_value(CLIMATE, "measure_humidity", CapabilityValue::Number(10.0))
            .await;
        assert_eq!(busy, Err(CapabilityError::Unavailable("measure_humidity".into())));

        // Three 5s timeouts plus 1s and 2s of backoff
        tokio::time::sleep(Duration::from_secs(20)).await;
        wait_for(&h.supervisor, CLIMATE, NodeState::PartiallyReady).await;
        // Queued reports are applied once bound
        assert_eq!(
            h.supervisor.get_capability_value(CLIMATE, "measure_humidity"),
            Some(CapabilityValue::Number(50.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_during_bind_applies_afterwards() {
        let h = harness();
        h.radio.script_subscribe(
            cluster::TEMPERATURE_MEASUREMENT,
            attribute::MEASURED_VALUE,
            vec![SimOutcome::Hang],
        );
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        wait_for(&h.supervisor, CLIMATE, NodeState::Binding).await;

        h.supervisor.handle_event(RadioEvent::NodeOffline { node: CLIMATE });
        settle().await;
        assert_eq!(h.supervisor.get_node_state(CLIMATE).unwrap().state, NodeState::Binding);

        wait_for(&h.supervisor, CLIMATE, NodeState::Offline).await;
        assert_eq!(h.radio.active_subscriptions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nodes_bind_in_parallel() {
        let h = harness();
        // Each node's first temperature subscribe hangs for the full timeout
        h.radio.script_subscribe(
            cluster::TEMPERATURE_MEASUREMENT,
            attribute::MEASURED_VALUE,
            vec![SimOutcome::Hang; 2],
        );
        let other = NodeId(0x00124b0001a1b2c4);
        let started = Instant::now();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: climate() });
        h.supervisor.handle_event(RadioEvent::NodeAnnounce {
            fingerprint: DeviceFingerprint { node_id: other, ..climate() },
        });

        wait_for(&h.supervisor, CLIMATE, NodeState::Ready).await;
        wait_for(&h.supervisor, other, NodeState::Ready).await;
        // One timeout plus one backoff each, side by side
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(h.radio.active_subscriptions().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_while_offline_are_dropped() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        h.supervisor.handle_event(report(SWITCH, cluster::ON_OFF, vec![1]));
        settle().await;
        assert_eq!(h.supervisor.get_capability_value(SWITCH, "onoff"), Some(CapabilityValue::Bool(true)));

        h.supervisor.handle_event(RadioEvent::NodeOffline { node: SWITCH });
        wait_for(&h.supervisor, SWITCH, NodeState::Offline).await;
        let mut events = h.supervisor.subscribe();
        h.supervisor.handle_event(report(SWITCH, cluster::ON_OFF, vec![0]));
        settle().await;

        assert_eq!(h.supervisor.get_capability_value(SWITCH, "onoff"), Some(CapabilityValue::Bool(true)));
        assert!(events.try_recv().is_err());
        assert_eq!(h.supervisor.get_node_state(SWITCH).unwrap().state, NodeState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_keeps_previous_value() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: switch() });
        wait_for(&h.supervisor, SWITCH, NodeState::Ready).await;
        h.supervisor
            .set_capability_value(SWITCH, "onoff", CapabilityValue::Bool(true))
            .await
            .unwrap();

        h.radio
            .script_write(cluster::ON_OFF, attribute::ON_OFF, vec![SimOutcome::Fail(RadioError::Timeout)]);
        let result = h
            .supervisor
            .set_capability_value(SWITCH, "onoff", CapabilityValue::Bool(false))
            .await;
        assert_eq!(result, Err(CapabilityError::Radio(RadioError::Timeout)));
        assert_eq!(h.supervisor.get_capability_value(SWITCH, "onoff"), Some(CapabilityValue::Bool(true)));
        assert_eq!(h.radio.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_datapoints_report_and_write() {
        let (tx, mut rx) = mpsc::channel(8);
        let h = harness_with(SimulatedRadio::with_events(tx));
        h.radio.set_datapoint(VALVE, 1, Datapoint::value(24, 215));
        h.radio.set_datapoint(VALVE, 1, Datapoint::value(16, 200));

        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: valve() });
        wait_for(&h.supervisor, VALVE, NodeState::Ready).await;
        // The query during bind made the device report every datapoint
        h.supervisor.handle_event(rx.recv().await.unwrap());
        settle().await;
        assert_eq!(
            h.supervisor.get_capability_value(VALVE, "measure_temperature"),
            Some(CapabilityValue::Number(21.5))
        );
        assert_eq!(
            h.supervisor.get_capability_value(VALVE, "target_temperature"),
            Some(CapabilityValue::Number(20.0))
        );

        h.supervisor
            .set_capability_value(VALVE, "target_temperature", CapabilityValue::Number(22.5))
            .await
            .unwrap();
        let (_, command, payload) = h.radio.commands().pop().unwrap();
        assert_eq!(command, tuya::command::DATA_REQUEST);
        assert_eq!(
            DatapointFrame::parse(&payload).unwrap().datapoints,
            vec![Datapoint::value(16, 225)]
        );
        // Not applied until the device answers
        assert_eq!(
            h.supervisor.get_capability_value(VALVE, "target_temperature"),
            Some(CapabilityValue::Number(20.0))
        );
        h.supervisor.handle_event(rx.recv().await.unwrap());
        settle().await;
        assert_eq!(
            h.supervisor.get_capability_value(VALVE, "target_temperature"),
            Some(CapabilityValue::Number(22.5))
        );

        let read_only = h
            .supervisor
            .set_capability_value(VALVE, "measure_temperature", CapabilityValue::Number(20.0))
            .await;
        assert_eq!(read_only, Err(CapabilityError::ReadOnly("measure_temperature".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_datapoint_frames_are_rejected() {
        let h = harness();
        h.supervisor.handle_event(RadioEvent::NodeAnnounce { fingerprint: valve() });
        wait_for(&h.supervisor, VALVE, NodeState::Ready).await;

        let command = |payload: Vec<u8>| RadioEvent::ClusterCommand {
            node: VALVE,
            endpoint: 1,
            cluster: cluster::TUYA_PRIVATE,
            command: tuya::command::DATA_REPORT,
            payload,
        };
        // Truncated header
        h.supervisor.handle_event(command(vec![0x00]));
        // Temperature sent as a bool
        h.supervisor.handle_event(command(
            DatapointFrame::new(1, vec![Datapoint::new(24, crate::zcl::tuya::DpType::Bool, vec![1])]).encode(),
        ));
        // Unknown datapoints are skipped, known ones in the same frame still apply
        h.supervisor.handle_event(command(
            DatapointFrame::new(2, vec![Datapoint::value(99, 1), Datapoint::value(24, 190)]).encode(),
        ));
        settle().await;

        let rejected = h.log.records_of(DiagnosticKind::ValueRejected);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].count, 2);
        assert_eq!(
            h.supervisor.get_capability_value(VALVE, "measure_temperature"),
            Some(CapabilityValue::Number(19.0))
        );
    }
}
