//! Per-device runtime state.
//!
//! A [`NodeSession`] is owned by exactly one session task in the supervisor;
//! nothing else mutates it. The upward API reads [`NodeStatus`] snapshots
//! instead.

use crate::fingerprint::{DeviceFingerprint, NodeId};
use crate::matcher::MatchKind;
use crate::radio::{AttributeAddress, ReportHandle};
use crate::registry::{BindingKey, CapabilityProfile, ClusterBinding};
use crate::translate::CapabilityValue;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeState {
    Discovered,
    Matching,
    Binding,
    Ready,
    PartiallyReady,
    Offline,
    Removed,
}

impl NodeState {
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Removed) => true,
            (Discovered, Matching) => true,
            (Matching, Binding) => true,
            (Binding, Ready | PartiallyReady | Offline) => true,
            (Ready | PartiallyReady, Offline | Matching) => true,
            (Offline, Matching) => true,
            _ => false,
        }
    }

    /// Online and serving capabilities.
    pub fn is_operational(self) -> bool {
        matches!(self, NodeState::Ready | NodeState::PartiallyReady)
    }
}

/// State of one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BindingState {
    Pending,
    Bound,
    /// Retry budget exhausted; retried on the next bind.
    Degraded,
    /// Device does not have the cluster; not retried this session.
    Unavailable,
}

/// How a bound attribute delivers values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleMode {
    Report(ReportHandle),
    Poll { interval: Duration, next_due: Instant },
    /// Tuya datapoint; the device pushes it unasked.
    Datapoint,
}

/// Live link between one attribute and one capability.
#[derive(Clone, Debug)]
pub struct BindingHandle {
    pub binding: ClusterBinding,
    pub endpoint: u8,
    pub state: BindingState,
    pub mode: Option<HandleMode>,
    /// Attempts made by the most recent bind.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl BindingHandle {
    pub fn pending(binding: ClusterBinding, endpoint: u8) -> Self {
        Self {
            binding,
            endpoint,
            state: BindingState::Pending,
            mode: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn report_handle(&self) -> Option<&ReportHandle> {
        match &self.mode {
            Some(HandleMode::Report(handle)) => Some(handle),
            _ => None,
        }
    }
}

/// Availability of a capability as seen by the automation framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityAvailability {
    Available,
    Degraded,
    Unavailable,
}

/// Read-only view published for the upward API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub state: NodeState,
    pub profile: Option<String>,
    pub match_kind: Option<MatchKind>,
    pub capabilities: BTreeMap<String, CapabilityAvailability>,
    pub values: BTreeMap<String, CapabilityValue>,
    pub last_seen: DateTime<Utc>,
}

pub struct NodeSession {
    pub node: NodeId,
    pub fingerprint: DeviceFingerprint,
    pub profile: Option<Arc<CapabilityProfile>>,
    pub match_kind: Option<MatchKind>,
    pub bindings: HashMap<BindingKey, BindingHandle>,
    /// Last known-good value per capability.
    pub values: HashMap<String, CapabilityValue>,
    pub last_seen: DateTime<Utc>,
    state: NodeState,
}

impl NodeSession {
    pub fn new(fingerprint: DeviceFingerprint) -> Self {
        Self {
            node: fingerprint.node_id,
            fingerprint,
            profile: None,
            match_kind: None,
            bindings: HashMap::new(),
            values: HashMap::new(),
            last_seen: Utc::now(),
            state: NodeState::Discovered,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&mut self, next: NodeState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "[Session] {} ignoring invalid transition {} -> {}",
                self.node, self.state, next
            );
            return false;
        }
        info!("[Session] {} {} -> {}", self.node, self.state, next);
        self.state = next;
        true
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Endpoint to address a cluster on; endpoint 1 if the device did not
    /// announce the cluster.
    pub fn endpoint_for(&self, cluster: u16) -> u8 {
        self.fingerprint.endpoint_for(cluster).unwrap_or(1)
    }

    pub fn address(&self, endpoint: u8, key: BindingKey) -> AttributeAddress {
        AttributeAddress {
            node: self.node,
            endpoint,
            cluster: key.cluster,
            attribute: key.attribute,
        }
    }

    /// Availability of each capability from the worst of its bindings.
    pub fn availability(&self) -> BTreeMap<String, CapabilityAvailability> {
        let mut out: BTreeMap<String, CapabilityAvailability> = BTreeMap::new();
        for handle in self.bindings.values() {
            let this = match handle.state {
                BindingState::Bound => CapabilityAvailability::Available,
                BindingState::Unavailable => CapabilityAvailability::Unavailable,
                BindingState::Degraded | BindingState::Pending => CapabilityAvailability::Degraded,
            };
            out.entry(handle.binding.capability.clone())
                .and_modify(|current| {
                    if rank(this) > rank(*current) {
                        *current = this;
                    }
                })
                .or_insert(this);
        }
        if !self.state.is_operational() {
            for availability in out.values_mut() {
                *availability = CapabilityAvailability::Unavailable;
            }
        }
        out
    }

    /// Whether every binding is bound.
    pub fn fully_bound(&self) -> bool {
        self.bindings.values().all(|h| h.state == BindingState::Bound)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.node,
            state: self.state,
            profile: self.profile.as_ref().map(|p| p.name.clone()),
            match_kind: self.match_kind,
            capabilities: self.availability(),
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_seen: self.last_seen,
        }
    }
}

fn rank(a: CapabilityAvailability) -> u8 {
    match a {
        CapabilityAvailability::Available => 0,
        CapabilityAvailability::Degraded => 1,
        CapabilityAvailability::Unavailable => 2,
    }
}
