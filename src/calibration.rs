use crate::CalibrationError;

/// Affine ADC-count to voltage transform, `v = raw * scale + offset`.
///
/// The parameters are fixed for a run; applying the transform never fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    scale: f64,
    offset: f64,
    max_raw: u16,
}

impl Calibration {
    /// Full ADC range mapped onto the symmetric interval [-1, +1].
    pub fn from_bits(bits: u32) -> Result<Self, CalibrationError> {
        let max_raw = max_raw_for(bits)?;
        Ok(Self {
            scale: 2.0 / f64::from(max_raw),
            offset: -1.0,
            max_raw,
        })
    }

    /// Full ADC range mapped onto `[-range / 2, +range / 2]`.
    pub fn with_range(bits: u32, range: f64) -> Result<Self, CalibrationError> {
        let max_raw = max_raw_for(bits)?;
        let scale = range / f64::from(max_raw);
        if !scale.is_finite() {
            return Err(CalibrationError::Scale(scale));
        }
        Ok(Self {
            scale,
            offset: -range / 2.0,
            max_raw,
        })
    }

    /// Explicit parameters, for boards calibrated outside this crate.
    pub fn new(bits: u32, scale: f64, offset: f64) -> Result<Self, CalibrationError> {
        let max_raw = max_raw_for(bits)?;
        if !scale.is_finite() || !offset.is_finite() {
            return Err(CalibrationError::Scale(scale));
        }
        Ok(Self {
            scale,
            offset,
            max_raw,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Largest raw code the ADC can produce.
    pub fn max_raw(&self) -> u16 {
        self.max_raw
    }

    #[inline]
    pub fn calibrate(&self, raw: u16) -> f32 {
        (f64::from(raw) * self.scale + self.offset) as f32
    }

    pub fn apply(&self, raw: &[u16]) -> Vec<f32> {
        let mut out = Vec::with_capacity(raw.len());
        self.apply_into(raw, &mut out);
        out
    }

    /// Calibrate `raw` into `out`, reusing its allocation.
    pub fn apply_into(&self, raw: &[u16], out: &mut Vec<f32>) {
        out.clear();
        out.extend(raw.iter().map(|&r| self.calibrate(r)));
    }
}

fn max_raw_for(bits: u32) -> Result<u16, CalibrationError> {
    if !(1..=16).contains(&bits) {
        return Err(CalibrationError::BitDepth(bits));
    }
    Ok(((1u32 << bits) - 1) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bits_spans_symmetric_interval() {
        let cal = Calibration::from_bits(16).unwrap();
        assert_eq!(cal.max_raw(), u16::MAX);
        assert_eq!(cal.calibrate(0), -1.0);
        assert!((cal.calibrate(u16::MAX) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn calibration_is_affine() {
        let cal = Calibration::from_bits(14).unwrap();
        let max = cal.max_raw();
        assert_eq!(cal.calibrate(0) as f64, cal.offset());
        let top = cal.offset() + cal.scale() * f64::from(max);
        assert!((cal.calibrate(max) as f64 - top).abs() < 1e-6);

        // Equal raw steps give equal voltage steps.
        let step = cal.calibrate(1001) - cal.calibrate(1000);
        let other = cal.calibrate(5001) - cal.calibrate(5000);
        assert!((step - other).abs() < 1e-6);
        assert!(step > 0.0);
    }

    #[test]
    fn with_range_centres_on_zero() {
        let cal = Calibration::with_range(12, 2.0).unwrap();
        assert_eq!(cal.calibrate(0), -1.0);
        assert!((cal.calibrate(4095) - 1.0).abs() < 1e-6);

        let mv = Calibration::with_range(12, 2000.0).unwrap();
        assert_eq!(mv.calibrate(0), -1000.0);
    }

    #[test]
    fn apply_only_touches_given_samples() {
        let cal = Calibration::from_bits(16).unwrap();
        let raw = [0u16, 32768, 65535, 1234];
        let out = cal.apply(&raw[..3]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], -1.0);

        let mut reused = vec![9.0; 10];
        cal.apply_into(&raw[..2], &mut reused);
        assert_eq!(reused.len(), 2);
    }

    #[test]
    fn rejects_bad_bit_depth() {
        assert_eq!(Calibration::from_bits(0), Err(CalibrationError::BitDepth(0)));
        assert_eq!(Calibration::from_bits(17), Err(CalibrationError::BitDepth(17)));
        assert!(Calibration::new(14, f64::NAN, 0.0).is_err());
    }
}
