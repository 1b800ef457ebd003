//! Radio stack adapters.
//!
//! - `mqtt`: coordinator reached over an MQTT request/response protocol
//! - `simulation`: in-process radio with scripted behaviour

pub mod mqtt;
pub mod simulation;
