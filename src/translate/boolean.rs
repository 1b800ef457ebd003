use super::{CapabilityValue, ValueTranslator};
use crate::error::TranslateError;
use crate::zcl::ZclDataType;

fn read(data_type: ZclDataType, raw: &[u8]) -> Result<i64, TranslateError> {
    data_type.read_int(raw).ok_or(TranslateError::InvalidPayload {
        expected: data_type.width(),
        actual: raw.len(),
    })
}

fn expect_bool(value: &CapabilityValue) -> Result<bool, TranslateError> {
    value.as_bool().ok_or_else(|| {
        TranslateError::ValidationFailed(format!("expected a boolean, got {}", value))
    })
}

/// Zero is `false`, anything else is `true`.
#[derive(Clone, Debug)]
pub struct BooleanTranslator {
    data_type: ZclDataType,
}

impl BooleanTranslator {
    pub fn new(data_type: ZclDataType) -> Self {
        Self { data_type }
    }
}

impl ValueTranslator for BooleanTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        Ok(CapabilityValue::Bool(read(self.data_type, raw)? != 0))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        let on = expect_bool(value)?;
        self.data_type
            .write_int(on as i64)
            .ok_or_else(|| TranslateError::ValidationFailed(format!("{} cannot hold a flag", self.data_type)))
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        matches!(value, CapabilityValue::Bool(_))
    }
}

/// Tests a single flag out of a bitmap attribute, e.g. IAS zone alarm1.
#[derive(Clone, Debug)]
pub struct BitmaskTranslator {
    data_type: ZclDataType,
    mask: u64,
}

impl BitmaskTranslator {
    pub fn new(data_type: ZclDataType, mask: u64) -> Self {
        Self { data_type, mask }
    }
}

impl ValueTranslator for BitmaskTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        let bits = read(self.data_type, raw)? as u64;
        Ok(CapabilityValue::Bool(bits & self.mask != 0))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        let bits = if expect_bool(value)? { self.mask } else { 0 };
        self.data_type
            .write_int(bits as i64)
            .ok_or_else(|| TranslateError::ValidationFailed(format!("mask overflows {}", self.data_type)))
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        matches!(value, CapabilityValue::Bool(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zcl::zone_status;

    #[test]
    fn test_boolean_decode() {
        let t = BooleanTranslator::new(ZclDataType::Bool);
        assert_eq!(t.decode(&[0]).unwrap(), CapabilityValue::Bool(false));
        assert_eq!(t.decode(&[1]).unwrap(), CapabilityValue::Bool(true));
        assert_eq!(t.encode(&CapabilityValue::Bool(true)).unwrap(), vec![1]);
    }

    #[test]
    fn test_boolean_rejects_number() {
        let t = BooleanTranslator::new(ZclDataType::Bool);
        assert!(!t.validate(&CapabilityValue::Number(1.0)));
        assert!(t.encode(&CapabilityValue::Number(1.0)).is_err());
    }

    #[test]
    fn test_ias_alarm_bit() {
        let t = BitmaskTranslator::new(ZclDataType::Bitmap16, zone_status::ALARM1);
        // alarm1 + battery low
        assert_eq!(
            t.decode(&0x0009u16.to_le_bytes()).unwrap(),
            CapabilityValue::Bool(true)
        );
        // tamper only
        assert_eq!(
            t.decode(&0x0004u16.to_le_bytes()).unwrap(),
            CapabilityValue::Bool(false)
        );
        assert_eq!(
            t.encode(&CapabilityValue::Bool(true)).unwrap(),
            vec![0x01, 0x00]
        );
    }
}
