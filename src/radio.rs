//! Interface to the mesh radio stack.
//!
//! The stack itself (joining, routing, encryption) lives outside this crate.
//! It delivers [`RadioEvent`]s and answers attribute requests through the
//! [`RadioStack`] trait; `input::mqtt` and `input::simulation` provide
//! implementations. Cluster-specific commands (Tuya datapoints) travel as
//! opaque payloads in both directions.

use crate::error::RadioError;
use crate::fingerprint::{DeviceFingerprint, NodeId};
use crate::registry::ReportingPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque id of an active report subscription, issued by the radio stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportHandle(pub String);

impl fmt::Display for ReportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one attribute on one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeAddress {
    pub node: NodeId,
    pub endpoint: u8,
    pub cluster: u16,
    pub attribute: u16,
}

impl fmt::Display for AttributeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/0x{:04X}/0x{:04X}",
            self.node, self.endpoint, self.cluster, self.attribute
        )
    }
}

/// One cluster on one endpoint of one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterAddress {
    pub node: NodeId,
    pub endpoint: u8,
    pub cluster: u16,
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/0x{:04X}", self.node, self.endpoint, self.cluster)
    }
}

/// Events pushed up by the radio stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RadioEvent {
    /// Join or rejoin.
    NodeAnnounce { fingerprint: DeviceFingerprint },
    AttributeReport {
        node: NodeId,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        raw: Vec<u8>,
    },
    /// Cluster-specific command sent by the device.
    ClusterCommand {
        node: NodeId,
        endpoint: u8,
        cluster: u16,
        command: u8,
        payload: Vec<u8>,
    },
    NodeOffline { node: NodeId },
    NodeRemoved { node: NodeId },
}

impl RadioEvent {
    pub fn node(&self) -> NodeId {
        match self {
            RadioEvent::NodeAnnounce { fingerprint } => fingerprint.node_id,
            RadioEvent::AttributeReport { node, .. }
            | RadioEvent::ClusterCommand { node, .. }
            | RadioEvent::NodeOffline { node }
            | RadioEvent::NodeRemoved { node } => *node,
        }
    }
}

/// Requests the binding engine issues to the radio stack.
///
/// Implementations may take arbitrarily long; callers bound every call with
/// their own timeout.
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Configure attribute reporting and start receiving reports.
    async fn subscribe_report(
        &self,
        address: AttributeAddress,
        policy: ReportingPolicy,
    ) -> Result<ReportHandle, RadioError>;

    /// Stop a subscription. Unknown handles are not an error.
    async fn cancel_report(&self, handle: &ReportHandle) -> Result<(), RadioError>;

    async fn read_attribute(&self, address: AttributeAddress) -> Result<Vec<u8>, RadioError>;

    /// Write and return the value the device reports back.
    async fn write_attribute(
        &self,
        address: AttributeAddress,
        raw: Vec<u8>,
    ) -> Result<Vec<u8>, RadioError>;

    /// Send a cluster-specific command. Any answer arrives as a
    /// [`RadioEvent::ClusterCommand`].
    async fn send_command(
        &self,
        address: ClusterAddress,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<(), RadioError>;
}
