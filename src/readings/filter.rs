//! Exponential moving average smoothing

use anyhow::{anyhow, Result};

/// Default smoothing for oil pressure
pub const PRESSURE_ALPHA: f64 = 0.18;

/// Default smoothing for oil temperature
pub const TEMPERATURE_ALPHA: f64 = 0.1;

/// Exponential moving average over a stream of samples
#[derive(Debug, Clone)]
pub struct EmaFilter {
    alpha: f64,
    last: Option<f64>,
}

impl EmaFilter {
    /// `alpha` must lie in (0, 1]; 1 disables smoothing
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(anyhow!("EMA alpha must be in (0, 1], got {}", alpha));
        }
        Ok(Self { alpha, last: None })
    }

    /// Feed a sample and return the smoothed value
    pub fn filter(&mut self, value: f64) -> f64 {
        let filtered = match self.last {
            Some(last) => self.alpha * value + (1.0 - self.alpha) * last,
            None => value,
        };
        self.last = Some(filtered);
        filtered
    }

    /// Forget history; the next sample passes through unchanged
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_passes_through() {
        let mut ema = EmaFilter::new(PRESSURE_ALPHA).unwrap();
        assert_eq!(ema.filter(45.3), 45.3);
        assert!((ema.filter(45.3) - 45.3).abs() < 1e-9);
    }

    #[test]
    fn test_smoothing() {
        let mut ema = EmaFilter::new(0.5).unwrap();
        ema.filter(10.0);
        assert_eq!(ema.filter(20.0), 15.0);
        assert_eq!(ema.filter(15.0), 15.0);

        let mut ema = EmaFilter::new(TEMPERATURE_ALPHA).unwrap();
        ema.filter(70.0);
        let smoothed = ema.filter(80.0);
        assert!((smoothed - 71.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut ema = EmaFilter::new(0.1).unwrap();
        ema.filter(100.0);
        ema.reset();
        assert_eq!(ema.filter(5.0), 5.0);
    }

    #[test]
    fn test_alpha_bounds() {
        assert!(EmaFilter::new(1.0).is_ok());
        assert!(EmaFilter::new(0.0).is_err());
        assert!(EmaFilter::new(-0.1).is_err());
        assert!(EmaFilter::new(1.5).is_err());
        assert!(EmaFilter::new(f64::NAN).is_err());
    }
}
