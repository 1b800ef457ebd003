//! Translators for Tuya datapoints.
//!
//! Datapoint values are big-endian; these wrap the little-endian ZCL
//! translators and flip byte order on the way in and out.

use super::{CapabilityValue, ValueTranslator};
use crate::error::TranslateError;
use crate::zcl::tuya::DpType;
use std::sync::Arc;

/// A ZCL translator applied to a fixed-width datapoint value.
#[derive(Clone, Debug)]
pub struct DatapointTranslator {
    dp_type: DpType,
    inner: Arc<dyn ValueTranslator>,
}

impl DatapointTranslator {
    pub fn new(dp_type: DpType, inner: Arc<dyn ValueTranslator>) -> Self {
        Self { dp_type, inner }
    }
}

fn flipped(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

impl ValueTranslator for DatapointTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        self.inner.decode(&flipped(raw))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        self.inner.encode(value).map(|le| flipped(&le))
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        self.inner.validate(value)
    }

    fn datapoint_type(&self) -> Option<DpType> {
        Some(self.dp_type)
    }
}

/// Raw datapoints as hex symbols, string datapoints as text.
#[derive(Clone, Debug)]
pub struct DatapointBytesTranslator {
    dp_type: DpType,
}

impl DatapointBytesTranslator {
    pub fn raw() -> Self {
        Self { dp_type: DpType::Raw }
    }

    pub fn string() -> Self {
        Self {
            dp_type: DpType::String,
        }
    }
}

impl ValueTranslator for DatapointBytesTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        match self.dp_type {
            DpType::String => String::from_utf8(raw.to_vec())
                .map(CapabilityValue::Symbol)
                .map_err(|e| TranslateError::ValidationFailed(e.to_string())),
            _ => Ok(CapabilityValue::Symbol(hex::encode(raw))),
        }
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        let symbol = value.as_symbol().ok_or_else(|| {
            TranslateError::ValidationFailed(format!("expected a symbol, got {}", value))
        })?;
        match self.dp_type {
            DpType::String => Ok(symbol.as_bytes().to_vec()),
            _ => hex::decode(symbol).map_err(|e| TranslateError::ValidationFailed(e.to_string())),
        }
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        match (self.dp_type, value.as_symbol()) {
            (DpType::String, Some(_)) => true,
            (_, Some(symbol)) => hex::decode(symbol).is_ok(),
            (_, None) => false,
        }
    }

    fn datapoint_type(&self) -> Option<DpType> {
        Some(self.dp_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{BitmaskTranslator, BooleanTranslator, NumericTranslator};
    use crate::zcl::ZclDataType;

    fn temperature_x10() -> DatapointTranslator {
        DatapointTranslator::new(
            DpType::Value,
            Arc::new(NumericTranslator::new(ZclDataType::Int32, 10.0, 0.0, -40.0, 125.0)),
        )
    }

    #[test]
    fn test_value_is_read_big_endian() {
        let t = temperature_x10();
        assert_eq!(
            t.decode(&[0x00, 0x00, 0x00, 0xD7]).unwrap(),
            CapabilityValue::Number(21.5)
        );
        assert_eq!(
            t.decode(&(-55i32).to_be_bytes()).unwrap(),
            CapabilityValue::Number(-5.5)
        );
        assert_eq!(
            t.encode(&CapabilityValue::Number(21.5)).unwrap(),
            vec![0x00, 0x00, 0x00, 0xD7]
        );
        assert_eq!(t.datapoint_type(), Some(DpType::Value));
    }

    #[test]
    fn test_value_keeps_range_check() {
        let err = temperature_x10().decode(&[0x00, 0x00, 0x27, 0x10]).unwrap_err();
        assert!(matches!(err, TranslateError::ValueOutOfRange { .. }));
        assert!(matches!(
            temperature_x10().decode(&[0x00, 0xD7]),
            Err(TranslateError::InvalidPayload { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_two_byte_bitmap() {
        let t = DatapointTranslator::new(
            DpType::Bitmap,
            Arc::new(BitmaskTranslator::new(ZclDataType::Bitmap16, 0x0100)),
        );
        assert_eq!(t.decode(&[0x01, 0x00]).unwrap(), CapabilityValue::Bool(true));
        assert_eq!(t.decode(&[0x00, 0x01]).unwrap(), CapabilityValue::Bool(false));
        assert_eq!(t.encode(&CapabilityValue::Bool(true)).unwrap(), vec![0x01, 0x00]);
    }

    #[test]
    fn test_bool_datapoint() {
        let t = DatapointTranslator::new(DpType::Bool, Arc::new(BooleanTranslator::new(ZclDataType::Bool)));
        assert_eq!(t.decode(&[1]).unwrap(), CapabilityValue::Bool(true));
        assert_eq!(t.encode(&CapabilityValue::Bool(false)).unwrap(), vec![0]);
    }

    #[test]
    fn test_raw_and_string() {
        let raw = DatapointBytesTranslator::raw();
        assert_eq!(
            raw.decode(&[0xAB, 0x01]).unwrap(),
            CapabilityValue::Symbol("ab01".into())
        );
        assert!(!raw.validate(&CapabilityValue::Symbol("xyz".into())));
        assert_eq!(raw.encode(&CapabilityValue::Symbol("ab01".into())).unwrap(), vec![0xAB, 0x01]);

        let text = DatapointBytesTranslator::string();
        assert_eq!(text.decode(b"eco").unwrap(), CapabilityValue::Symbol("eco".into()));
        assert!(text.decode(&[0xFF, 0xFE]).is_err());
        assert_eq!(text.datapoint_type(), Some(DpType::String));
    }
}
