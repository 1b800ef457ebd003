//! Device identity as announced by the radio stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 64-bit IEEE address of a mesh node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// One (endpoint, cluster) pair exposed by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointCluster {
    pub endpoint: u8,
    pub cluster: u16,
}

/// Immutable identity snapshot captured when a node announces itself.
///
/// A new fingerprint is taken on every connection attempt; a session never
/// edits the one it holds, it replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub node_id: NodeId,
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub clusters: BTreeSet<EndpointCluster>,
}

impl DeviceFingerprint {
    pub fn new(node_id: NodeId, manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            node_id,
            manufacturer: manufacturer.into(),
            model: model.into(),
            product: None,
            clusters: BTreeSet::new(),
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_cluster(mut self, endpoint: u8, cluster: u16) -> Self {
        self.clusters.insert(EndpointCluster { endpoint, cluster });
        self
    }

    /// True if any endpoint exposes `cluster`.
    pub fn has_cluster(&self, cluster: u16) -> bool {
        self.clusters.iter().any(|ec| ec.cluster == cluster)
    }

    /// Lowest endpoint exposing `cluster`, if any.
    pub fn endpoint_for(&self, cluster: u16) -> Option<u8> {
        self.clusters
            .iter()
            .filter(|ec| ec.cluster == cluster)
            .map(|ec| ec.endpoint)
            .min()
    }

    /// Stable key identifying this device type, independent of node address
    /// and of the order clusters were announced in.
    pub fn normalized_key(&self) -> String {
        let clusters = self
            .clusters
            .iter()
            .map(|ec| format!("{}:{:04x}", ec.endpoint, ec.cluster))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}",
            self.manufacturer.trim(),
            self.model.trim(),
            self.product.as_deref().unwrap_or("*").trim(),
            clusters
        )
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {}",
            self.manufacturer,
            self.model,
            self.product.as_deref().unwrap_or("-")
        )
    }
}
