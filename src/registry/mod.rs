//! Capability profile registry.
//!
//! The registry is built once from a profile source and never mutated
//! afterwards. Sessions share it as an `Arc<Registry>` snapshot obtained from
//! a [`RegistryHandle`]; a hot reload swaps the whole table.
//!
//! # Source format
//! ```json
//! {
//!   "version": "2024.06",
//!   "translators": {
//!     "tuya_temperature": {"kind": "numeric", "data_type": "uint32", "divisor": 10, "min": -40, "max": 125},
//!     "tuya_dp_temperature": {"kind": "dp_value", "divisor": 10, "min": -40, "max": 125}
//!   },
//!   "profiles": [
//!     {
//!       "name": "tuya_climate_sensor",
//!       "match": {"manufacturer": "_TZE200_vvmbj46n", "model": "TS0601", "product": "*"},
//!       "bindings": [
//!         {"cluster": 1026, "attribute": 0, "capability": "measure_temperature",
//!          "translator": "temperature", "reporting": {"min_interval": 10, "max_interval": 600, "reportable_change": 10}}
//!       ]
//!     },
//!     {
//!       "name": "tuya_dp_climate_sensor",
//!       "match": {"manufacturer": "_TZE200_bjawzodf", "model": "TS0601"},
//!       "bindings": [
//!         {"datapoint": 1, "capability": "measure_temperature", "translator": "tuya_dp_temperature"}
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Datapoint bindings must name a `dp_*` translator and attribute bindings
//! must not.

mod handle;
pub mod profile;

pub use handle::RegistryHandle;
pub use profile::{
    BindingKey, CapabilityProfile, ClusterBinding, ClusterRequirement, FingerprintPattern,
    PatternField, ReportingPolicy,
};

use crate::error::RegistryError;
use crate::fingerprint::DeviceFingerprint;
use crate::translate::{TranslatorSet, TranslatorSpec, ValueTranslator};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Deserialized profile source document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileSource {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub translators: BTreeMap<String, TranslatorSpec>,
    #[serde(default)]
    pub profiles: Vec<CapabilityProfile>,
}

/// A profile compatible with a fingerprint, with its specificity score.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub profile: Arc<CapabilityProfile>,
    pub score: usize,
    /// Position in load order.
    pub index: usize,
}

/// Immutable, validated profile table.
#[derive(Debug)]
pub struct Registry {
    version: Option<String>,
    profiles: Vec<Arc<CapabilityProfile>>,
    translators: TranslatorSet,
}

impl Registry {
    /// Registry with no profiles; every device resolves to the fallback.
    pub fn empty() -> Self {
        Self {
            version: None,
            profiles: Vec::new(),
            translators: TranslatorSet::builtin(),
        }
    }

    /// Validate and build a registry.
    pub fn load(source: ProfileSource) -> Result<Self, RegistryError> {
        let translators = TranslatorSet::with_specs(&source.translators)?;

        let mut fully_specific: HashMap<(String, String, String), String> = HashMap::new();
        for profile in &source.profiles {
            validate_profile(profile, &translators)?;

            let pattern = &profile.pattern;
            if let (Some(m), Some(mo), Some(p)) = (
                pattern.manufacturer.exact(),
                pattern.model.exact(),
                pattern.product.exact(),
            ) {
                let key = (m.to_string(), mo.to_string(), p.to_string());
                if let Some(first) = fully_specific.get(&key) {
                    return Err(RegistryError::LoadConflict {
                        first: first.clone(),
                        second: profile.name.clone(),
                        pattern: pattern.to_string(),
                    });
                }
                fully_specific.insert(key, profile.name.clone());
            }
        }

        info!(
            "[Registry] Loaded {} profile(s), {} translator(s), version {}",
            source.profiles.len(),
            translators.len(),
            source.version.as_deref().unwrap_or("unversioned")
        );

        Ok(Self {
            version: source.version,
            profiles: source.profiles.into_iter().map(Arc::new).collect(),
            translators,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let source: ProfileSource = serde_json::from_str(json)?;
        Self::load(source)
    }

    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Every compatible profile, in load order. Ties are left to the matcher.
    pub fn lookup(&self, fingerprint: &DeviceFingerprint) -> Vec<Candidate> {
        self.profiles
            .iter()
            .enumerate()
            .filter_map(|(index, profile)| {
                profile.pattern.score(fingerprint).map(|score| Candidate {
                    profile: profile.clone(),
                    score,
                    index,
                })
            })
            .collect()
    }

    pub fn translator(&self, id: &str) -> Option<Arc<dyn ValueTranslator>> {
        self.translators.get(id)
    }

    pub fn translators(&self) -> &TranslatorSet {
        &self.translators
    }

    pub fn profiles(&self) -> &[Arc<CapabilityProfile>] {
        &self.profiles
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::empty()
    }
}

fn validate_profile(profile: &CapabilityProfile, translators: &TranslatorSet) -> Result<(), RegistryError> {
    let mut keys = HashSet::new();
    for binding in &profile.bindings {
        if !keys.insert(binding.key()) {
            return Err(RegistryError::DuplicateBinding {
                profile: profile.name.clone(),
                cluster: binding.cluster,
                attribute: binding.attribute,
            });
        }
        let Some(translator) = translators.get(&binding.translator) else {
            return Err(RegistryError::UnknownTranslator {
                profile: profile.name.clone(),
                translator: binding.translator.clone(),
            });
        };
        let invalid = |reason: String| RegistryError::InvalidBinding {
            profile: profile.name.clone(),
            key: binding.key().to_string(),
            reason,
        };
        match (binding.is_datapoint(), translator.datapoint_type()) {
            (true, None) => {
                return Err(invalid(format!(
                    "'{}' is not a datapoint translator",
                    binding.translator
                )));
            }
            (false, Some(dp_type)) => {
                return Err(invalid(format!(
                    "'{}' reads {} datapoints, not attributes",
                    binding.translator, dp_type
                )));
            }
            _ => {}
        }
        if binding.is_datapoint() && binding.attribute > u8::MAX as u16 {
            return Err(invalid("datapoint ids are one byte".to_string()));
        }
        let reporting = binding.reporting;
        if reporting.max_interval == 0 || reporting.min_interval > reporting.max_interval {
            return Err(RegistryError::InvalidReporting {
                profile: profile.name.clone(),
                reason: format!(
                    "{}: min {}s / max {}s",
                    binding.key(),
                    reporting.min_interval,
                    reporting.max_interval
                ),
            });
        }
    }
    Ok(())
}
