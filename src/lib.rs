//! Zigbee capability gateway library.
//!
//! Resolves joining devices to capability profiles by fingerprint, binds the
//! profile's cluster attributes through the radio stack and exposes the
//! resulting capabilities to an automation framework.

pub mod binding;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fingerprint;
pub mod input;
pub mod matcher;
pub mod radio;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod translate;
pub mod zcl;

pub use binding::{BindResult, ClusterBindingManager, RetryPolicy};
pub use diagnostics::{DiagnosticLog, DiagnosticsSink};
pub use fingerprint::{DeviceFingerprint, NodeId};
pub use matcher::{FingerprintMatcher, MatchKind};
pub use radio::{RadioEvent, RadioStack};
pub use registry::{Registry, RegistryHandle};
pub use supervisor::{CapabilityEvent, NodeLifecycleSupervisor};
pub use translate::CapabilityValue;
