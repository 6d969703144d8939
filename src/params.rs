use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-run acquisition parameters, fixed for the duration of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionParameter {
    /// Carrier (larmor) frequency in Hz, also the downconversion frequency
    pub larmor_frequency: f64,
    /// Scaling of the RF pulse amplitudes
    pub b1_scaling: f64,
    /// Scaling of the gradient amplitudes
    pub fov_scaling: f64,
    /// Decimation factor of the downconversion
    pub downsampling_rate: usize,
    /// Output samples kept per gate after decimation
    pub adc_samples: usize,
}

impl Default for AcquisitionParameter {
    fn default() -> Self {
        Self {
            larmor_frequency: 2.0395e6,
            b1_scaling: 1.0,
            fov_scaling: 1.0,
            downsampling_rate: 200,
            adc_samples: 512,
        }
    }
}

impl AcquisitionParameter {
    /// Window length of the downconversion low-pass
    pub fn kernel_size(&self) -> usize {
        2 * self.downsampling_rate
    }

    /// Time between two decimated samples
    pub fn dwell_time(&self, sample_rate_hz: f64) -> f64 {
        self.downsampling_rate as f64 / sample_rate_hz
    }

    pub fn validate(&self) -> Result<()> {
        if self.downsampling_rate == 0 {
            return Err(Error::InvalidInput("downsampling rate must be non-zero".into()));
        }
        if self.adc_samples == 0 {
            return Err(Error::InvalidInput("adc_samples must be non-zero".into()));
        }
        if !(self.larmor_frequency.is_finite() && self.larmor_frequency >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "larmor frequency {} Hz is not valid",
                self.larmor_frequency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dwell_time_from_decimation() {
        let params = AcquisitionParameter {
            downsampling_rate: 400,
            ..Default::default()
        };
        assert_eq!(params.kernel_size(), 800);
        assert!((params.dwell_time(10e6) - 40e-6).abs() < 1e-15);
        assert!((params.dwell_time(9.998e6) - 400.0 / 9.998e6).abs() < 1e-15);
    }

    #[test]
    fn zero_decimation_is_invalid() {
        let params = AcquisitionParameter {
            downsampling_rate: 0,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidInput(_))));
    }
}
