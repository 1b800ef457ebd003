//! Piecewise-linear lookup, e.g. battery voltage to remaining percentage.

use super::{CapabilityValue, ValueTranslator};
use crate::error::TranslateError;
use crate::zcl::ZclDataType;

/// CR2032 discharge curve, volts to percent.
pub const CR2032: &[(f64, f64)] = &[
    (2.00, 0.0),
    (2.20, 2.0),
    (2.30, 4.0),
    (2.40, 8.0),
    (2.50, 15.0),
    (2.60, 25.0),
    (2.70, 40.0),
    (2.75, 50.0),
    (2.80, 65.0),
    (2.85, 75.0),
    (2.90, 85.0),
    (2.95, 90.0),
    (3.00, 95.0),
    (3.10, 98.0),
    (3.30, 100.0),
];

/// Two alkaline cells in series, volts to percent.
pub const ALKALINE_2X: &[(f64, f64)] = &[
    (1.80, 0.0),
    (2.00, 5.0),
    (2.20, 12.0),
    (2.30, 20.0),
    (2.40, 30.0),
    (2.50, 40.0),
    (2.60, 50.0),
    (2.70, 60.0),
    (2.80, 70.0),
    (2.90, 80.0),
    (3.00, 90.0),
    (3.10, 95.0),
    (3.30, 100.0),
];

/// `x = raw / divisor`, then interpolated between the surrounding points and
/// rounded to a whole number. Inputs beyond either end take the end value.
///
/// Read-only: many inputs share one output, so nothing is written back.
#[derive(Clone, Debug)]
pub struct CurveTranslator {
    data_type: ZclDataType,
    divisor: f64,
    /// Sorted by x, at least two points.
    points: Vec<(f64, f64)>,
}

impl CurveTranslator {
    /// `points` must hold at least two finite points; they are sorted here.
    pub fn new(data_type: ZclDataType, divisor: f64, points: &[(f64, f64)]) -> Self {
        let mut points = points.to_vec();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            data_type,
            divisor,
            points,
        }
    }

    fn lookup(&self, x: f64) -> f64 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return 0.0;
        };
        if x <= first.0 {
            return first.1;
        }
        if x >= last.0 {
            return last.1;
        }
        for pair in self.points.windows(2) {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            if x >= x0 && x <= x1 {
                if x1 == x0 {
                    return y1;
                }
                return y0 + (x - x0) / (x1 - x0) * (y1 - y0);
            }
        }
        last.1
    }
}

impl ValueTranslator for CurveTranslator {
    fn decode(&self, raw: &[u8]) -> Result<CapabilityValue, TranslateError> {
        let int = self
            .data_type
            .read_int(raw)
            .ok_or(TranslateError::InvalidPayload {
                expected: self.data_type.width(),
                actual: raw.len(),
            })?;
        Ok(CapabilityValue::Number(
            self.lookup(int as f64 / self.divisor).round(),
        ))
    }

    fn encode(&self, value: &CapabilityValue) -> Result<Vec<u8>, TranslateError> {
        Err(TranslateError::ValidationFailed(format!(
            "{} cannot be mapped back through a curve",
            value
        )))
    }

    fn validate(&self, _value: &CapabilityValue) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cr2032() -> CurveTranslator {
        // Power configuration battery voltage, 100 mV units
        CurveTranslator::new(ZclDataType::Uint8, 10.0, CR2032)
    }

    fn percent(t: &CurveTranslator, raw: u8) -> f64 {
        t.decode(&[raw]).unwrap().as_f64().unwrap()
    }

    #[test]
    fn test_points_and_interpolation() {
        let t = cr2032();
        assert_eq!(percent(&t, 30), 95.0);
        assert_eq!(percent(&t, 27), 40.0);
        assert_eq!(percent(&t, 25), 15.0);
        // halfway between 3.1 V (98) and 3.3 V (100)
        assert_eq!(percent(&t, 32), 99.0);
    }

    #[test]
    fn test_clamps_outside_curve() {
        let t = cr2032();
        assert_eq!(percent(&t, 36), 100.0);
        assert_eq!(percent(&t, 15), 0.0);
    }

    #[test]
    fn test_millivolt_input_and_unsorted_points() {
        let t = CurveTranslator::new(ZclDataType::Uint16, 1000.0, &[(3.0, 100.0), (2.0, 0.0)]);
        assert_eq!(t.decode(&2500u16.to_le_bytes()).unwrap(), CapabilityValue::Number(50.0));
    }

    #[test]
    fn test_read_only() {
        let t = cr2032();
        assert!(!t.validate(&CapabilityValue::Number(50.0)));
        assert!(t.encode(&CapabilityValue::Number(50.0)).is_err());
        assert!(matches!(
            t.decode(&[1, 2]),
            Err(TranslateError::InvalidPayload { expected: 1, actual: 2 })
        ));
    }
}
