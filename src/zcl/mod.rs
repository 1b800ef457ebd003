//! Zigbee Cluster Library constants and wire data types.
//!
//! Only the clusters the engine knows how to bind generically are listed here;
//! everything else is addressed by numeric id from the profile table.
//!
//! Attribute payloads are little-endian byte strings, as they appear in ZCL
//! frames after the data type octet has been stripped by the radio stack.

pub mod tuya;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub mod cluster {
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIG: u16 = 0x0001;
    pub const IDENTIFY: u16 = 0x0003;
    pub const ON_OFF: u16 = 0x0006;
    pub const LEVEL_CONTROL: u16 = 0x0008;
    pub const DOOR_LOCK: u16 = 0x0101;
    pub const WINDOW_COVERING: u16 = 0x0102;
    pub const THERMOSTAT: u16 = 0x0201;
    pub const COLOR_CONTROL: u16 = 0x0300;
    pub const ILLUMINANCE_MEASUREMENT: u16 = 0x0400;
    pub const TEMPERATURE_MEASUREMENT: u16 = 0x0402;
    pub const PRESSURE_MEASUREMENT: u16 = 0x0403;
    pub const HUMIDITY_MEASUREMENT: u16 = 0x0405;
    pub const OCCUPANCY_SENSING: u16 = 0x0406;
    pub const IAS_ZONE: u16 = 0x0500;
    pub const METERING: u16 = 0x0702;
    pub const ELECTRICAL_MEASUREMENT: u16 = 0x0B04;
    pub const TUYA_PRIVATE: u16 = 0xEF00;
}

pub mod attribute {
    /// Basic cluster
    pub const POWER_SOURCE: u16 = 0x0007;
    /// Power configuration cluster, in 100 mV units
    pub const BATTERY_VOLTAGE: u16 = 0x0020;
    /// Power configuration cluster, in 0.5% units
    pub const BATTERY_PERCENTAGE_REMAINING: u16 = 0x0021;
    /// On/Off cluster
    pub const ON_OFF: u16 = 0x0000;
    /// Level control cluster (0-254)
    pub const CURRENT_LEVEL: u16 = 0x0000;
    /// Shared by every measurement cluster
    pub const MEASURED_VALUE: u16 = 0x0000;
    /// Occupancy sensing cluster bitmap
    pub const OCCUPANCY: u16 = 0x0000;
    /// IAS zone status bitmap
    pub const ZONE_STATUS: u16 = 0x0002;
}

/// IAS zone status bits.
pub mod zone_status {
    pub const ALARM1: u64 = 0x0001;
}

/// Wire encoding of an attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ZclDataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Enum8,
    Enum16,
    Bitmap8,
    Bitmap16,
    Bitmap32,
}

impl ZclDataType {
    /// Payload width in bytes.
    pub fn width(self) -> usize {
        match self {
            ZclDataType::Bool
            | ZclDataType::Uint8
            | ZclDataType::Int8
            | ZclDataType::Enum8
            | ZclDataType::Bitmap8 => 1,
            ZclDataType::Uint16
            | ZclDataType::Int16
            | ZclDataType::Enum16
            | ZclDataType::Bitmap16 => 2,
            ZclDataType::Uint32 | ZclDataType::Int32 | ZclDataType::Bitmap32 => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ZclDataType::Int8 | ZclDataType::Int16 | ZclDataType::Int32
        )
    }

    /// Smallest and largest integer representable by this type.
    pub fn bounds(self) -> (i64, i64) {
        let bits = (self.width() * 8) as u32;
        if self.is_signed() {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }

    /// Read a little-endian integer of this type from `raw`.
    ///
    /// Returns `None` if the payload length does not match the type width.
    pub fn read_int(self, raw: &[u8]) -> Option<i64> {
        if raw.len() != self.width() {
            return None;
        }
        let mut unsigned: u64 = 0;
        for (i, byte) in raw.iter().enumerate() {
            unsigned |= (*byte as u64) << (8 * i);
        }
        if self.is_signed() {
            let shift = 64 - 8 * self.width() as u32;
            Some(((unsigned << shift) as i64) >> shift)
        } else {
            Some(unsigned as i64)
        }
    }

    /// Encode `value` as a little-endian payload of this type.
    ///
    /// Returns `None` if the value does not fit.
    pub fn write_int(self, value: i64) -> Option<Vec<u8>> {
        let (min, max) = self.bounds();
        if value < min || value > max {
            return None;
        }
        let bytes = (value as u64).to_le_bytes();
        Some(bytes[..self.width()].to_vec())
    }
}

/// Human-readable cluster name for log lines.
pub fn cluster_name(id: u16) -> &'static str {
    match id {
        cluster::BASIC => "basic",
        cluster::POWER_CONFIG => "power_config",
        cluster::IDENTIFY => "identify",
        cluster::ON_OFF => "on_off",
        cluster::LEVEL_CONTROL => "level_control",
        cluster::DOOR_LOCK => "door_lock",
        cluster::WINDOW_COVERING => "window_covering",
        cluster::THERMOSTAT => "thermostat",
        cluster::COLOR_CONTROL => "color_control",
        cluster::ILLUMINANCE_MEASUREMENT => "illuminance",
        cluster::TEMPERATURE_MEASUREMENT => "temperature",
        cluster::PRESSURE_MEASUREMENT => "pressure",
        cluster::HUMIDITY_MEASUREMENT => "humidity",
        cluster::OCCUPANCY_SENSING => "occupancy",
        cluster::IAS_ZONE => "ias_zone",
        cluster::METERING => "metering",
        cluster::ELECTRICAL_MEASUREMENT => "electrical_measurement",
        cluster::TUYA_PRIVATE => "tuya",
        _ => "unknown",
    }
}
