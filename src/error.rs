use thiserror::Error as ThisError;

/// Errors raised while loading the capability profile registry.
///
/// All of these are fatal at startup: the gateway refuses to come up with an
/// inconsistent profile table.
#[derive(ThisError, Debug)]
pub enum RegistryError {
    #[error("Profiles '{first}' and '{second}' share the fully-specific pattern {pattern}")]
    LoadConflict {
        first: String,
        second: String,
        pattern: String,
    },

    #[error("Profile '{profile}' binds cluster 0x{cluster:04X} attribute 0x{attribute:04X} twice")]
    DuplicateBinding {
        profile: String,
        cluster: u16,
        attribute: u16,
    },

    #[error("Profile '{profile}' references unknown translator '{translator}'")]
    UnknownTranslator { profile: String, translator: String },

    #[error("Translator '{0}' is defined more than once")]
    DuplicateTranslator(String),

    #[error("Invalid translator '{id}': {reason}")]
    InvalidTranslator { id: String, reason: String },

    #[error("Profile '{profile}' has invalid reporting policy: {reason}")]
    InvalidReporting { profile: String, reason: String },

    #[error("Profile '{profile}' binding {key}: {reason}")]
    InvalidBinding {
        profile: String,
        key: String,
        reason: String,
    },

    #[error("Failed to parse profile source: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures converting between raw attribute payloads and capability values.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum TranslateError {
    #[error("Value {value} outside valid range [{min}, {max}]")]
    ValueOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Unknown enum value {0}")]
    UnknownEnumValue(i64),

    #[error("Invalid payload: expected {expected} bytes, got {actual}")]
    InvalidPayload { expected: usize, actual: usize },

    #[error("Value failed validation: {0}")]
    ValidationFailed(String),
}

/// Malformed Tuya datapoint frames.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated at byte {offset}: need {needed} more, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Datapoint {dp} has unknown type 0x{data_type:02X}")]
    UnknownType { dp: u8, data_type: u8 },
}

/// Errors reported by the radio stack for a single request.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio request timed out")]
    Timeout,

    #[error("Cluster 0x{0:04X} not supported by device")]
    ClusterUnsupported(u16),

    #[error("Attribute reporting not supported by device")]
    ReportingUnsupported,

    #[error("Node is no longer reachable")]
    NodeGone,

    #[error("Radio transport error: {0}")]
    Transport(String),
}

/// Malformed messages from the MQTT radio coordinator.
#[derive(ThisError, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid node address '{0}'")]
    InvalidNode(String),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Unknown event type '{0}'")]
    UnknownEvent(String),
}

/// Errors returned to the automation framework on capability writes.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Unknown node {0}")]
    UnknownNode(String),

    #[error("Unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("Capability '{0}' is read-only")]
    ReadOnly(String),

    #[error("Value rejected for '{capability}': {reason}")]
    Validation { capability: String, reason: String },

    #[error("Capability '{0}' is unavailable")]
    Unavailable(String),

    #[error("Radio write failed: {0}")]
    Radio(#[from] RadioError),
}

#[derive(ThisError, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
