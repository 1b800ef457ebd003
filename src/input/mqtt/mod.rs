//! MQTT link to the radio coordinator.
//!
//! The coordinator owns the mesh and exposes it as JSON messages; see
//! [`protocol`] for the topic layout.

mod client;
mod integration;
pub mod protocol;
mod radio;

pub use client::{MqttClient, MqttMessage};
pub use integration::connect;
pub use radio::MqttRadio;
