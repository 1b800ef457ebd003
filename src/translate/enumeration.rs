use super::{CapabilityValue, ValueTranslator};
use crate::error::TranslateError;
use crate::zcl::ZclDataType;
use std::collections::BTreeMap;

/// Maps raw integers to a fixed set of symbols.
#[derive(Clone, Debug)]
pub struct EnumTranslator {
    data_type: ZclDataType,
    symbols: BTreeMap<i64, String>,
}

impl EnumTranslator {
    pub fn new(data_type: ZclDataType, symbols: BTreeMap<i64, String>) -> Self {
        Self { data_type, symbols }
    }

    fn raw_for(&self, symbol: &str) -> Option<i64> {
        self.symbols
            .iter()
            .find(|(_, s)| s.as_str() == symbol)
            .map(|(raw, _)| *raw)
    }
}

impl ValueTranslator for EnumTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        let int = self
            .data_type
            .read_int(raw)
            .ok_or(TranslateError::InvalidPayload {
                expected: self.data_type.width(),
                actual: raw.len(),
            })?;
        self.symbols
            .get(&int)
            .map(|symbol| CapabilityValue::Symbol(symbol.clone()))
            .ok_or(TranslateError::UnknownEnumValue(int))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        let symbol = value.as_symbol().ok_or_else(|| {
            TranslateError::ValidationFailed(format!("expected a symbol, got {}", value))
        })?;
        let raw = self
            .raw_for(symbol)
            .ok_or_else(|| TranslateError::ValidationFailed(format!("unknown symbol '{}'", symbol)))?;
        self.data_type
            .write_int(raw)
            .ok_or_else(|| TranslateError::ValidationFailed(format!("{} overflows {}", raw, self.data_type)))
    }

    fn validate(&self, value: &CapabilityValue) -> bool {
        value
            .as_symbol()
            .is_some_and(|symbol| self.raw_for(symbol).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm() -> EnumTranslator {
        let symbols = [(0, "lower_alarm"), (1, "upper_alarm"), (2, "cancel")]
            .into_iter()
            .map(|(raw, s)| (raw, s.to_string()))
            .collect();
        EnumTranslator::new(ZclDataType::Enum8, symbols)
    }

    #[test]
    fn test_known_values() {
        let t = alarm();
        assert_eq!(
            t.decode(&[1]).unwrap(),
            CapabilityValue::Symbol("upper_alarm".into())
        );
        assert_eq!(
            t.encode(&CapabilityValue::Symbol("cancel".into())).unwrap(),
            vec![2]
        );
    }

    #[test]
    fn test_unknown_raw_value() {
        assert_eq!(
            alarm().decode(&[7]).unwrap_err(),
            TranslateError::UnknownEnumValue(7)
        );
    }

    #[test]
    fn test_validate_symbols() {
        let t = alarm();
        assert!(t.validate(&CapabilityValue::Symbol("cancel".into())));
        assert!(!t.validate(&CapabilityValue::Symbol("snooze".into())));
        assert!(!t.validate(&CapabilityValue::Number(2.0)));
    }

    #[test]
    fn test_round_trip_every_symbol() {
        let t = alarm();
        for symbol in ["lower_alarm", "upper_alarm", "cancel"] {
            let v = CapabilityValue::Symbol(symbol.into());
            assert_eq!(t.decode(&t.encode(&v).unwrap()).unwrap(), v);
        }
    }
}
