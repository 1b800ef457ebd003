//! Fingerprint → profile resolution.
//!
//! The highest specificity score wins; equal scores go to the profile loaded
//! first. Devices nothing matches get a generic profile built from the
//! clusters they actually expose.

use crate::diagnostics::{DiagnosticContext, DiagnosticKind, DiagnosticsSink};
use crate::fingerprint::DeviceFingerprint;
use crate::registry::{CapabilityProfile, ClusterBinding, FingerprintPattern, Registry};
use crate::translate::TranslatorSet;
use crate::zcl::{attribute, cluster};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::Display;

/// Name of the built-in profile used for unknown devices.
pub const FALLBACK_PROFILE: &str = "generic_fallback";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchKind {
    /// Manufacturer, model and product all pinned.
    Exact,
    /// At least one wildcard field.
    Pattern,
    /// Nothing matched; generic fallback applied.
    Unmatched,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub profile: Arc<CapabilityProfile>,
    pub kind: MatchKind,
    pub score: usize,
    /// Other candidates that tied with the winner.
    pub ambiguous_with: Vec<String>,
}

/// Resolves fingerprints against a registry snapshot.
#[derive(Clone)]
pub struct FingerprintMatcher {
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl FingerprintMatcher {
    pub fn new(diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self { diagnostics }
    }

    /// Resolve and report unmatched or ambiguous fingerprints.
    pub fn resolve(&self, registry: &Registry, fingerprint: &DeviceFingerprint) -> Resolution {
        let resolution = Self::select(registry, fingerprint);

        match resolution.kind {
            MatchKind::Unmatched => {
                self.diagnostics.record(
                    fingerprint,
                    DiagnosticContext::new(
                        DiagnosticKind::UnmatchedFingerprint,
                        format!(
                            "no profile in registry {}; fallback binds {} attribute(s)",
                            registry.version().unwrap_or("unversioned"),
                            resolution.profile.bindings.len()
                        ),
                    ),
                );
            }
            _ if !resolution.ambiguous_with.is_empty() => {
                warn!(
                    "[Matcher] {} matched '{}' with score {}, tied with {:?}; using load order",
                    fingerprint, resolution.profile.name, resolution.score, resolution.ambiguous_with
                );
                self.diagnostics.record(
                    fingerprint,
                    DiagnosticContext::new(
                        DiagnosticKind::AmbiguousMatch,
                        format!(
                            "'{}' chosen over {:?} at score {}",
                            resolution.profile.name, resolution.ambiguous_with, resolution.score
                        ),
                    ),
                );
            }
            _ => {
                debug!(
                    "[Matcher] {} -> '{}' ({}, score {})",
                    fingerprint, resolution.profile.name, resolution.kind, resolution.score
                );
            }
        }

        resolution
    }

    /// Pure selection: same inputs, same output.
    pub fn select(registry: &Registry, fingerprint: &DeviceFingerprint) -> Resolution {
        let candidates = registry.lookup(fingerprint);

        // Candidates are in load order, so keeping the first maximum breaks ties.
        let Some(best) = candidates
            .iter()
            .fold(None, |best: Option<&crate::registry::Candidate>, c| match best {
                Some(b) if b.score >= c.score => Some(b),
                _ => Some(c),
            })
        else {
            return Resolution {
                profile: Arc::new(fallback_profile(fingerprint)),
                kind: MatchKind::Unmatched,
                score: 0,
                ambiguous_with: Vec::new(),
            };
        };

        let ambiguous_with = candidates
            .iter()
            .filter(|c| c.score == best.score && c.index != best.index)
            .map(|c| c.profile.name.clone())
            .collect();

        let kind = if best.profile.pattern.is_fully_specific() {
            MatchKind::Exact
        } else {
            MatchKind::Pattern
        };

        Resolution {
            profile: best.profile.clone(),
            kind,
            score: best.score,
            ambiguous_with,
        }
    }
}

/// Generic profile for a device no registry entry knows.
///
/// Only binds universally understood clusters, and only those the device
/// announced.
pub fn fallback_profile(fingerprint: &DeviceFingerprint) -> CapabilityProfile {
    let universal = [
        (cluster::ON_OFF, attribute::ON_OFF, "onoff", TranslatorSet::ONOFF),
        (cluster::LEVEL_CONTROL, attribute::CURRENT_LEVEL, "dim", TranslatorSet::LEVEL),
        (
            cluster::TEMPERATURE_MEASUREMENT,
            attribute::MEASURED_VALUE,
            "measure_temperature",
            TranslatorSet::TEMPERATURE,
        ),
        (
            cluster::HUMIDITY_MEASUREMENT,
            attribute::MEASURED_VALUE,
            "measure_humidity",
            TranslatorSet::HUMIDITY,
        ),
        (
            cluster::POWER_CONFIG,
            attribute::BATTERY_PERCENTAGE_REMAINING,
            "measure_battery",
            TranslatorSet::BATTERY_PERCENTAGE,
        ),
    ];

    universal
        .into_iter()
        .filter(|(c, ..)| fingerprint.has_cluster(*c))
        .fold(
            CapabilityProfile::new(FALLBACK_PROFILE, FingerprintPattern::default()),
            |profile, (c, a, capability, translator)| {
                profile.with_binding(ClusterBinding::new(c, a, capability, translator))
            },
        )
}
