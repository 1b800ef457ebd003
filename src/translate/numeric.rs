//! Linear scale/offset translator for measured values.

use super::{CapabilityValue, ValueTranslator};
use crate::error::TranslateError;
use crate::zcl::ZclDataType;

/// `value = raw / divisor + offset`, restricted to `[min, max]`.
///
/// Out-of-range reports are rejected rather than clamped so that sentinel
/// values like `0xFFFFFFFF` never show up as a plausible reading.
#[derive(Clone, Debug)]
pub struct NumericTranslator {
    data_type: ZclDataType,
    divisor: f64,
    offset: f64,
    min: f64,
    max: f64,
}

impl NumericTranslator {
    pub fn new(data_type: ZclDataType, divisor: f64, offset: f64, min: f64, max: f64) -> Self {
        Self {
            data_type,
            divisor,
            offset,
            min,
            max,
        }
    }

    fn scale(&self, raw: i64) -> f64 {
        raw as f64 / self.divisor + self.offset
    }

    /// Raw integer for `value`, if `value` sits exactly on the wire grid.
    fn unscale(&self, value: f64) -> Option<i64> {
        if !value.is_finite() {
            return None;
        }
        let raw = ((value - self.offset) * self.divisor).round();
        let (lo, hi) = self.data_type.bounds();
        if raw < lo as f64 || raw > hi as f64 {
            return None;
        }
        let raw = raw as i64;
        (self.scale(raw) == value).then_some(raw)
    }

    fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl ValueTranslator for NumericTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        let int = self
            .data_type
            .read_int(raw)
            .ok_or(TranslateError::InvalidPayload {
                expected: self.data_type.width(),
                actual: raw.len(),
            })?;
        let value = self.scale(int);
        if !self.in_range(value) {
            return Err(TranslateError::ValueOutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(CapabilityValue::Number(value))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        let n = value.as_f64().ok_or_else(|| {
            TranslateError::ValidationFailed(format!("expected a number, got {}", value))
        })?;
        if !self.in_range(n) {
            return Err(TranslateError::ValueOutOfRange {
                value: n,
                min: self.min,
                max: self.max,
            });
        }
        let raw = self.unscale(n).ok_or_else(|| {
            TranslateError::ValidationFailed(format!("{} is not representable on the wire", n))
        })?;
        self.data_type
            .write_int(raw)
            .ok_or_else(|| TranslateError::ValidationFailed(format!("{} overflows {}", raw, self.data_type)))
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        value
            .as_f64()
            .is_some_and(|n| self.in_range(n) && self.unscale(n).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> NumericTranslator {
        NumericTranslator::new(ZclDataType::Int16, 100.0, 0.0, -40.0, 125.0)
    }

    #[test]
    fn test_decode_centidegrees() {
        let t = temperature();
        assert_eq!(
            t.decode(&2150i16.to_le_bytes()).unwrap(),
            CapabilityValue::Number(21.5)
        );
        assert_eq!(
            t.decode(&(-1050i16).to_le_bytes()).unwrap(),
            CapabilityValue::Number(-10.5)
        );
    }

    #[test]
    fn test_sentinel_is_out_of_range() {
        let t = NumericTranslator::new(ZclDataType::Uint32, 100.0, 0.0, -40.0, 125.0);
        let err = t.decode(&4_294_967_295u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, TranslateError::ValueOutOfRange { .. }));
    }

    #[test]
    fn test_wrong_width_is_invalid_payload() {
        let err = temperature().decode(&[0x01, 0x02, 0x03]).unwrap_err();
        assert_eq!(
            err,
            TranslateError::InvalidPayload {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_validate() {
        let t = temperature();
        assert!(t.validate(&CapabilityValue::Number(21.5)));
        assert!(t.validate(&CapabilityValue::Number(-40.0)));
        assert!(!t.validate(&CapabilityValue::Number(125.01)));
        assert!(!t.validate(&CapabilityValue::Number(f64::NAN)));
        // Finer than the 0.01 wire resolution
        assert!(!t.validate(&CapabilityValue::Number(21.125)));
        assert!(!t.validate(&CapabilityValue::Bool(true)));
    }

    #[test]
    fn test_offset_round_trip() {
        let t = NumericTranslator::new(ZclDataType::Uint8, 2.0, -20.0, -20.0, 100.0);
        for raw in 0u8..=240 {
            let value = t.decode(&[raw]).unwrap();
            assert!(t.validate(&value));
            assert_eq!(t.decode(&t.encode(&value).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn test_encode_rejects_non_number() {
        let err = temperature()
            .encode(&CapabilityValue::Symbol("warm".into()))
            .unwrap_err();
        assert!(matches!(err, TranslateError::ValidationFailed(_)));
    }
}
