//! Profile, pattern and binding descriptors.

use crate::fingerprint::DeviceFingerprint;
use crate::zcl::cluster;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One field of a fingerprint pattern: either `*` or an exact string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PatternField {
    #[default]
    Any,
    Exact(String),
}

impl PatternField {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PatternField::Any)
    }

    pub fn exact(&self) -> Option<&str> {
        match self {
            PatternField::Any => None,
            PatternField::Exact(s) => Some(s),
        }
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            PatternField::Any => true,
            PatternField::Exact(expected) => value.is_some_and(|v| v.trim() == expected.as_str()),
        }
    }
}

impl From<String> for PatternField {
    fn from(s: String) -> Self {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            PatternField::Any
        } else {
            PatternField::Exact(s.to_string())
        }
    }
}

impl From<&str> for PatternField {
    fn from(s: &str) -> Self {
        PatternField::from(s.to_string())
    }
}

impl From<PatternField> for String {
    fn from(field: PatternField) -> Self {
        match field {
            PatternField::Any => "*".to_string(),
            PatternField::Exact(s) => s,
        }
    }
}

impl fmt::Display for PatternField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternField::Any => write!(f, "*"),
            PatternField::Exact(s) => write!(f, "{}", s),
        }
    }
}

/// A cluster the device must expose for the pattern to apply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRequirement {
    pub cluster: u16,
    /// Any endpoint when absent.
    #[serde(default)]
    pub endpoint: Option<u8>,
}

/// Score of one pinned manufacturer, model or product field.
pub const FIELD_WEIGHT: usize = 100;

/// Fingerprint-matching half of a profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintPattern {
    #[serde(default)]
    pub manufacturer: PatternField,
    #[serde(default)]
    pub model: PatternField,
    #[serde(default)]
    pub product: PatternField,
    #[serde(default)]
    pub clusters: Vec<ClusterRequirement>,
}

impl FingerprintPattern {
    pub fn new(
        manufacturer: impl Into<PatternField>,
        model: impl Into<PatternField>,
        product: impl Into<PatternField>,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            product: product.into(),
            clusters: Vec::new(),
        }
    }

    pub fn requiring(mut self, cluster: u16, endpoint: Option<u8>) -> Self {
        self.clusters.push(ClusterRequirement { cluster, endpoint });
        self
    }

    /// Manufacturer, model and product are all pinned.
    pub fn is_fully_specific(&self) -> bool {
        !self.manufacturer.is_wildcard() && !self.model.is_wildcard() && !self.product.is_wildcard()
    }

    /// Specificity score if `fingerprint` is compatible with this pattern.
    ///
    /// Each non-wildcard identity field is worth [`FIELD_WEIGHT`]; cluster
    /// requirements add one point each and only break ties between patterns
    /// pinning the same number of fields.
    pub fn score(&self, fingerprint: &DeviceFingerprint) -> Option<usize> {
        if !self.manufacturer.matches(Some(fingerprint.manufacturer.as_str()))
            || !self.model.matches(Some(fingerprint.model.as_str()))
            || !self.product.matches(fingerprint.product.as_deref())
        {
            return None;
        }
        let clusters_present = self.clusters.iter().all(|req| {
            fingerprint
                .clusters
                .iter()
                .any(|ec| ec.cluster == req.cluster && req.endpoint.is_none_or(|e| e == ec.endpoint))
        });
        if !clusters_present {
            return None;
        }
        let fields = [&self.manufacturer, &self.model, &self.product]
            .iter()
            .filter(|f| !f.is_wildcard())
            .count();
        Some(fields * FIELD_WEIGHT + self.clusters.len().min(FIELD_WEIGHT - 1))
    }
}

impl fmt::Display for FingerprintPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.manufacturer, self.model, self.product)
    }
}

fn default_min_interval() -> u16 {
    1
}

fn default_max_interval() -> u16 {
    300
}

/// Attribute reporting configuration sent with a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportingPolicy {
    /// Seconds
    #[serde(default = "default_min_interval")]
    pub min_interval: u16,
    /// Seconds; also the poll period when the device cannot report.
    #[serde(default = "default_max_interval")]
    pub max_interval: u16,
    /// In raw attribute units. Zero reports on every change.
    #[serde(default)]
    pub reportable_change: u32,
}

impl Default for ReportingPolicy {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            reportable_change: 0,
        }
    }
}

/// Binds one cluster attribute, or one Tuya datapoint, to one capability.
///
/// A datapoint binding is keyed as attribute `dp` of cluster 0xEF00. The
/// source may write it as `{"datapoint": 1, ...}` instead of spelling out
/// cluster and attribute.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "BindingSource")]
pub struct ClusterBinding {
    pub cluster: u16,
    pub attribute: u16,
    pub capability: String,
    pub translator: String,
    #[serde(default)]
    pub reporting: ReportingPolicy,
    /// Defaults by cluster when absent, see [`ClusterBinding::is_writable`].
    #[serde(default)]
    pub writable: Option<bool>,
}

impl ClusterBinding {
    pub fn new(
        cluster: u16,
        attribute: u16,
        capability: impl Into<String>,
        translator: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            attribute,
            capability: capability.into(),
            translator: translator.into(),
            reporting: ReportingPolicy::default(),
            writable: None,
        }
    }

    /// Binding for Tuya datapoint `dp`.
    pub fn datapoint(dp: u8, capability: impl Into<String>, translator: impl Into<String>) -> Self {
        Self::new(cluster::TUYA_PRIVATE, dp as u16, capability, translator)
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    pub fn with_reporting(mut self, min_interval: u16, max_interval: u16, reportable_change: u32) -> Self {
        self.reporting = ReportingPolicy {
            min_interval,
            max_interval,
            reportable_change,
        };
        self
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            cluster: self.cluster,
            attribute: self.attribute,
        }
    }

    pub fn is_datapoint(&self) -> bool {
        self.key().is_datapoint()
    }

    /// Datapoints are read-only unless marked writable.
    pub fn is_writable(&self) -> bool {
        self.writable.unwrap_or(matches!(
            self.cluster,
            cluster::ON_OFF
                | cluster::LEVEL_CONTROL
                | cluster::WINDOW_COVERING
                | cluster::THERMOSTAT
                | cluster::DOOR_LOCK
        ))
    }
}

#[derive(Deserialize)]
struct BindingSource {
    #[serde(default)]
    cluster: Option<u16>,
    #[serde(default)]
    attribute: Option<u16>,
    #[serde(default)]
    datapoint: Option<u8>,
    capability: String,
    translator: String,
    #[serde(default)]
    reporting: ReportingPolicy,
    #[serde(default)]
    writable: Option<bool>,
}

impl TryFrom<BindingSource> for ClusterBinding {
    type Error = String;

    fn try_from(source: BindingSource) -> Result<Self, Self::Error> {
        let (cluster, attribute) = match (source.datapoint, source.cluster, source.attribute) {
            (Some(dp), None, None) => (cluster::TUYA_PRIVATE, dp as u16),
            (None, Some(cluster), Some(attribute)) => (cluster, attribute),
            (Some(_), _, _) => {
                return Err(format!(
                    "binding '{}' gives both a datapoint and a cluster attribute",
                    source.capability
                ));
            }
            (None, _, _) => {
                return Err(format!(
                    "binding '{}' needs cluster and attribute, or datapoint",
                    source.capability
                ));
            }
        };
        Ok(Self {
            cluster,
            attribute,
            capability: source.capability,
            translator: source.translator,
            reporting: source.reporting,
            writable: source.writable,
        })
    }
}

/// (cluster, attribute), unique within a profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingKey {
    pub cluster: u16,
    pub attribute: u16,
}

impl BindingKey {
    pub const fn datapoint(dp: u8) -> Self {
        Self {
            cluster: cluster::TUYA_PRIVATE,
            attribute: dp as u16,
        }
    }

    pub fn is_datapoint(&self) -> bool {
        self.cluster == cluster::TUYA_PRIVATE
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_datapoint() {
            write!(f, "dp{}", self.attribute)
        } else {
            write!(f, "0x{:04X}/0x{:04X}", self.cluster, self.attribute)
        }
    }
}

/// A named, immutable entry of the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub name: String,
    #[serde(rename = "match")]
    pub pattern: FingerprintPattern,
    #[serde(default)]
    pub bindings: Vec<ClusterBinding>,
}

impl CapabilityProfile {
    pub fn new(name: impl Into<String>, pattern: FingerprintPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: ClusterBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn binding(&self, key: BindingKey) -> Option<&ClusterBinding> {
        self.bindings.iter().find(|b| b.key() == key)
    }

    /// Bindings feeding `capability`.
    pub fn bindings_for<'a>(&'a self, capability: &'a str) -> impl Iterator<Item = &'a ClusterBinding> + 'a {
        self.bindings.iter().filter(move |b| b.capability == capability)
    }

    /// Capability names in binding order, without duplicates.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.capability.as_str()) {
                seen.push(binding.capability.as_str());
            }
        }
        seen
    }
}
