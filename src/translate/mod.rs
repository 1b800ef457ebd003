//! Conversion between raw attribute payloads and capability values.
//!
//! Every binding names a translator by id. Translators are either built in
//! (see [`TranslatorSet::builtin`]) or defined in the profile source, which is
//! how vendor quirks such as odd scaling or 4-byte Tuya values get registered
//! without code.
//!
//! Datapoint translators (`dp_*` kinds) read big-endian Tuya datapoint values
//! and may only serve datapoint bindings; every other kind serves ZCL
//! attributes.

mod boolean;
pub mod curve;
mod datapoint;
mod enumeration;
mod numeric;

pub use boolean::{BitmaskTranslator, BooleanTranslator};
pub use curve::CurveTranslator;
pub use datapoint::{DatapointBytesTranslator, DatapointTranslator};
pub use enumeration::EnumTranslator;
pub use numeric::NumericTranslator;

use crate::error::{RegistryError, TranslateError};
use crate::zcl::tuya::DpType;
use crate::zcl::{ZclDataType, zone_status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Normalized, application-facing value of a capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Symbol(String),
}

impl CapabilityValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CapabilityValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            CapabilityValue::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{}", b),
            CapabilityValue::Number(n) => write!(f, "{}", n),
            CapabilityValue::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// Bidirectional converter for one kind of attribute.
///
/// `decode(encode(v)) == v` must hold for every `v` accepted by `validate`.
pub trait ValueTranslator: Send + Sync + fmt::Debug {
    /// Convert a raw little-endian payload into a capability value.
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError>;

    /// Convert a capability value into a raw payload.
    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError>;

    /// Whether `value` is acceptable for writing.
    fn validate(&self, value: &CapabilityValue) -> bool;

    /// Datapoint type this translator reads, `None` for ZCL attributes.
    fn datapoint_type(&self) -> Option<DpType> {
        None
    }
}

fn default_bool_type() -> ZclDataType {
    ZclDataType::Bool
}

fn default_divisor() -> f64 {
    1.0
}

fn default_bitmap_width() -> u8 {
    1
}

/// Enum tables are JSON objects, so their raw values arrive as string keys.
fn enum_values<'de, D>(deserializer: D) -> Result<BTreeMap<i64, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let table = BTreeMap::<String, String>::deserialize(deserializer)?;
    table
        .into_iter()
        .map(|(raw, symbol)| {
            raw.trim()
                .parse::<i64>()
                .map(|raw| (raw, symbol))
                .map_err(|_| serde::de::Error::custom(format!("enum key '{}' is not an integer", raw)))
        })
        .collect()
}

/// Translator definition as written in the profile source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranslatorSpec {
    Numeric {
        data_type: ZclDataType,
        #[serde(default = "default_divisor")]
        divisor: f64,
        #[serde(default)]
        offset: f64,
        min: f64,
        max: f64,
    },
    Enum {
        data_type: ZclDataType,
        #[serde(deserialize_with = "enum_values")]
        values: BTreeMap<i64, String>,
    },
    Boolean {
        #[serde(default = "default_bool_type")]
        data_type: ZclDataType,
    },
    Bitmask {
        data_type: ZclDataType,
        mask: u64,
    },
    /// `[x, y]` points, see [`CurveTranslator`].
    Curve {
        data_type: ZclDataType,
        #[serde(default = "default_divisor")]
        divisor: f64,
        points: Vec<(f64, f64)>,
    },
    /// Signed 4-byte datapoint, scaled like `numeric`.
    DpValue {
        #[serde(default = "default_divisor")]
        divisor: f64,
        #[serde(default)]
        offset: f64,
        min: f64,
        max: f64,
    },
    DpBool,
    DpEnum {
        #[serde(deserialize_with = "enum_values")]
        values: BTreeMap<i64, String>,
    },
    DpBitmap {
        /// Bytes: 1, 2 or 4.
        #[serde(default = "default_bitmap_width")]
        width: u8,
        mask: u64,
    },
    DpRaw,
    DpString,
}

impl TranslatorSpec {
    /// Validate the definition and build the translator.
    pub fn build(&self, id: &str) -> Result<Arc<dyn ValueTranslator>, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidTranslator {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let numeric = |data_type: ZclDataType, divisor: f64, offset: f64, min: f64, max: f64| {
            if data_type == ZclDataType::Bool {
                return Err(invalid("numeric translator cannot use bool data type"));
            }
            if !divisor.is_finite() || divisor == 0.0 {
                return Err(invalid("divisor must be finite and non-zero"));
            }
            if !offset.is_finite() || !min.is_finite() || !max.is_finite() || min > max {
                return Err(invalid("range must be finite with min <= max"));
            }
            Ok(NumericTranslator::new(data_type, divisor, offset, min, max))
        };
        let enumeration = |data_type: ZclDataType, values: &BTreeMap<i64, String>| {
            if values.is_empty() {
                return Err(invalid("enum translator needs at least one value"));
            }
            let (lo, hi) = data_type.bounds();
            if values.keys().any(|raw| *raw < lo || *raw > hi) {
                return Err(invalid("enum value does not fit data type"));
            }
            let mut seen = std::collections::HashSet::new();
            if !values.values().all(|symbol| seen.insert(symbol.as_str())) {
                return Err(invalid("enum symbols must be unique"));
            }
            Ok(EnumTranslator::new(data_type, values.clone()))
        };
        let bitmask = |data_type: ZclDataType, mask: u64| {
            let (_, hi) = data_type.bounds();
            if mask == 0 || mask > hi as u64 {
                return Err(invalid("mask must be non-zero and fit the data type"));
            }
            Ok(BitmaskTranslator::new(data_type, mask))
        };
        let datapoint = |dp_type: DpType, inner: Arc<dyn ValueTranslator>| -> Arc<dyn ValueTranslator> {
            Arc::new(DatapointTranslator::new(dp_type, inner))
        };

        match self {
            TranslatorSpec::Numeric {
                data_type,
                divisor,
                offset,
                min,
                max,
            } => Ok(Arc::new(numeric(*data_type, *divisor, *offset, *min, *max)?)),
            TranslatorSpec::Enum { data_type, values } => Ok(Arc::new(enumeration(*data_type, values)?)),
            TranslatorSpec::Boolean { data_type } => Ok(Arc::new(BooleanTranslator::new(*data_type))),
            TranslatorSpec::Bitmask { data_type, mask } => Ok(Arc::new(bitmask(*data_type, *mask)?)),
            TranslatorSpec::Curve {
                data_type,
                divisor,
                points,
            } => {
                if *data_type == ZclDataType::Bool || !divisor.is_finite() || *divisor == 0.0 {
                    return Err(invalid("curve needs an integer data type and a non-zero divisor"));
                }
                if points.len() < 2 || points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return Err(invalid("curve needs at least two finite points"));
                }
                Ok(Arc::new(CurveTranslator::new(*data_type, *divisor, points)))
            }
            TranslatorSpec::DpValue {
                divisor,
                offset,
                min,
                max,
            } => Ok(datapoint(
                DpType::Value,
                Arc::new(numeric(ZclDataType::Int32, *divisor, *offset, *min, *max)?),
            )),
            TranslatorSpec::DpBool => Ok(datapoint(
                DpType::Bool,
                Arc::new(BooleanTranslator::new(ZclDataType::Bool)),
            )),
            TranslatorSpec::DpEnum { values } => Ok(datapoint(
                DpType::Enum,
                Arc::new(enumeration(ZclDataType::Enum8, values)?),
            )),
            TranslatorSpec::DpBitmap { width, mask } => {
                let data_type = match width {
                    1 => ZclDataType::Bitmap8,
                    2 => ZclDataType::Bitmap16,
                    4 => ZclDataType::Bitmap32,
                    _ => return Err(invalid("bitmap width must be 1, 2 or 4 bytes")),
                };
                Ok(datapoint(DpType::Bitmap, Arc::new(bitmask(data_type, *mask)?)))
            }
            TranslatorSpec::DpRaw => Ok(Arc::new(DatapointBytesTranslator::raw())),
            TranslatorSpec::DpString => Ok(Arc::new(DatapointBytesTranslator::string())),
        }
    }
}

/// Translators by id, built-ins first then source-defined ones.
#[derive(Clone, Debug)]
pub struct TranslatorSet {
    translators: HashMap<String, Arc<dyn ValueTranslator>>,
}

impl TranslatorSet {
    pub const ONOFF: &'static str = "onoff";
    pub const LEVEL: &'static str = "level";
    pub const TEMPERATURE: &'static str = "temperature";
    pub const HUMIDITY: &'static str = "humidity";
    pub const PRESSURE: &'static str = "pressure";
    pub const BATTERY_PERCENTAGE: &'static str = "battery_percentage";
    pub const IAS_ALARM: &'static str = "ias_alarm";
    pub const OCCUPANCY: &'static str = "occupancy";
    pub const POWER_SOURCE: &'static str = "power_source";
    pub const BATTERY_VOLTAGE_CR2032: &'static str = "battery_voltage_cr2032";
    pub const BATTERY_VOLTAGE_2XAA: &'static str = "battery_voltage_2xaa";

    /// Translators for the standard ZCL attributes.
    pub fn builtin() -> Self {
        let mut translators: HashMap<String, Arc<dyn ValueTranslator>> = HashMap::new();
        translators.insert(
            Self::ONOFF.into(),
            Arc::new(BooleanTranslator::new(ZclDataType::Bool)),
        );
        // 0-254 -> 0.0-1.0
        translators.insert(
            Self::LEVEL.into(),
            Arc::new(NumericTranslator::new(ZclDataType::Uint8, 254.0, 0.0, 0.0, 1.0)),
        );
        // centidegrees
        translators.insert(
            Self::TEMPERATURE.into(),
            Arc::new(NumericTranslator::new(ZclDataType::Int16, 100.0, 0.0, -40.0, 125.0)),
        );
        // centipercent
        translators.insert(
            Self::HUMIDITY.into(),
            Arc::new(NumericTranslator::new(ZclDataType::Uint16, 100.0, 0.0, 0.0, 100.0)),
        );
        // hPa
        translators.insert(
            Self::PRESSURE.into(),
            Arc::new(NumericTranslator::new(ZclDataType::Int16, 1.0, 0.0, 300.0, 1100.0)),
        );
        // half-percent steps
        translators.insert(
            Self::BATTERY_PERCENTAGE.into(),
            Arc::new(NumericTranslator::new(ZclDataType::Uint8, 2.0, 0.0, 0.0, 100.0)),
        );
        // 100 mV units
        translators.insert(
            Self::BATTERY_VOLTAGE_CR2032.into(),
            Arc::new(CurveTranslator::new(ZclDataType::Uint8, 10.0, curve::CR2032)),
        );
        translators.insert(
            Self::BATTERY_VOLTAGE_2XAA.into(),
            Arc::new(CurveTranslator::new(ZclDataType::Uint8, 10.0, curve::ALKALINE_2X)),
        );
        translators.insert(
            Self::IAS_ALARM.into(),
            Arc::new(BitmaskTranslator::new(ZclDataType::Bitmap16, zone_status::ALARM1)),
        );
        translators.insert(
            Self::OCCUPANCY.into(),
            Arc::new(BitmaskTranslator::new(ZclDataType::Bitmap8, 0x01)),
        );
        let power_sources = [
            (0, "unknown"),
            (1, "mains_single_phase"),
            (2, "mains_three_phase"),
            (3, "battery"),
            (4, "dc_source"),
            (5, "emergency_mains_constant"),
            (6, "emergency_mains_transfer"),
        ]
        .into_iter()
        .map(|(raw, symbol)| (raw, symbol.to_string()))
        .collect();
        translators.insert(
            Self::POWER_SOURCE.into(),
            Arc::new(EnumTranslator::new(ZclDataType::Enum8, power_sources)),
        );
        Self { translators }
    }

    /// Built-ins extended with source-defined translators.
    ///
    /// A source definition may not shadow a built-in id.
    pub fn with_specs(specs: &BTreeMap<String, TranslatorSpec>) -> Result<Self, RegistryError> {
        let mut set = Self::builtin();
        for (id, spec) in specs {
            if set.translators.contains_key(id) {
                return Err(RegistryError::DuplicateTranslator(id.clone()));
            }
            let translator = spec.build(id)?;
            set.translators.insert(id.clone(), translator);
        }
        Ok(set)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ValueTranslator>> {
        self.translators.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.translators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translators.is_empty()
    }
}

impl Default for TranslatorSet {
    fn default() -> Self {
        Self::builtin()
    }
}
