//! Digital downconversion of gated adc records.
//!
//! Each gate is mixed with a complex oscillator at the carrier frequency,
//! low-pass filtered with a Hamming windowed sinc of `kernel_size` taps and
//! decimated by `kernel_size / 2`. Only the decimated output samples are
//! computed.

use std::f64::consts::PI;

use num_complex::Complex64;

use crate::error::{Error, Result};

/// Downconverter with a precomputed low-pass, reused across gates of one run
#[derive(Debug, Clone)]
pub struct Downconverter {
    kernel: Vec<f64>,
    decimation: usize,
    f_0: f64,
    f_spcm: f64,
}

impl Downconverter {
    /// `kernel_size` is twice the decimation factor
    pub fn new(kernel_size: usize, f_0: f64, f_spcm: f64) -> Self {
        let decimation = (kernel_size / 2).max(1);
        Self {
            kernel: lowpass_kernel(kernel_size.max(1), decimation),
            decimation,
            f_0,
            f_spcm,
        }
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    /// Output length for an input of `len` samples
    pub fn output_len(&self, len: usize) -> usize {
        len / self.decimation
    }

    pub fn apply(&self, signal: &[f64]) -> Vec<Complex64> {
        let w = 2.0 * PI * self.f_0 / self.f_spcm;
        // Mix to baseband
        let mixed: Vec<Complex64> = signal
            .iter()
            .enumerate()
            .map(|(n, x)| Complex64::from_polar(*x, -w * n as f64))
            .collect();
        // Filter, evaluated only at the decimated positions
        let half = self.kernel.len() / 2;
        (0..self.output_len(signal.len()))
            .map(|k| {
                let center = k * self.decimation;
                self.kernel
                    .iter()
                    .enumerate()
                    .filter_map(|(j, h)| {
                        (center + j)
                            .checked_sub(half)
                            .and_then(|n| mixed.get(n))
                            .map(|m| *m * *h)
                    })
                    .sum()
            })
            .collect()
    }
}

/// Mix `signal` from `f_0` to baseband, low-pass and decimate by `kernel_size / 2`
pub fn apply_ddc(signal: &[f64], kernel_size: usize, f_0: f64, f_spcm: f64) -> Vec<Complex64> {
    Downconverter::new(kernel_size, f_0, f_spcm).apply(signal)
}

/// Hamming windowed sinc with its cutoff at the decimated Nyquist rate and unity DC gain
pub fn lowpass_kernel(taps: usize, decimation: usize) -> Vec<f64> {
    if taps == 1 {
        return vec![1.0];
    }
    let fc = 0.5 / decimation.max(1) as f64;
    let mid = (taps - 1) as f64 / 2.0;
    let mut kernel: Vec<f64> = (0..taps)
        .map(|i| {
            let x = i as f64 - mid;
            let sinc = if x.abs() < 1e-12 {
                2.0 * fc
            } else {
                (2.0 * PI * fc * x).sin() / (PI * x)
            };
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / (taps - 1) as f64).cos();
            sinc * window
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    if sum.abs() > 1e-15 {
        kernel.iter_mut().for_each(|h| *h /= sum);
    }
    kernel
}

/// The `n` samples centered in `samples`, starting at `floor(len/2 - n/2)`
pub fn truncate_centered<T>(samples: &[T], n: usize) -> Result<&[T]> {
    if samples.len() < n {
        return Err(Error::InsufficientSamples {
            available: samples.len(),
            requested: n,
        });
    }
    let start = (samples.len() - n) / 2;
    Ok(&samples[start..start + n])
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 1e6;
    const F0: f64 = 100e3;
    const DECIMATION: usize = 50;

    fn tone(len: usize, f: f64, phase: f64) -> Vec<f64> {
        (0..len)
            .map(|n| (2.0 * PI * f * n as f64 / FS + phase).cos())
            .collect()
    }

    #[test]
    fn output_length_is_floor() {
        let out = apply_ddc(&tone(5049, F0, 0.0), 2 * DECIMATION, F0, FS);
        assert_eq!(out.len(), 100);
        assert!(apply_ddc(&[], 2 * DECIMATION, F0, FS).is_empty());
    }

    #[test]
    fn kernel_has_unity_dc_gain() {
        let kernel = lowpass_kernel(2 * DECIMATION, DECIMATION);
        assert_eq!(kernel.len(), 100);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(lowpass_kernel(1, 1), vec![1.0]);
    }

    #[test]
    fn carrier_tone_lands_at_baseband() {
        let phase = 0.6;
        let out = apply_ddc(&tone(10_000, F0, phase), 2 * DECIMATION, F0, FS);
        let center = truncate_centered(&out, 150).unwrap();
        for pair in center.windows(2) {
            // Instantaneous frequency in radians per output sample
            let dphi = (pair[1] * pair[0].conj()).arg();
            assert!(dphi.abs() < 1e-2, "residual frequency {dphi}");
        }
        for s in center {
            assert!((s.arg() - phase).abs() < 1e-2);
            assert!((s.norm() - 0.5).abs() < 1e-2);
        }
    }

    #[test]
    fn offset_tone_keeps_its_frequency() {
        let offset = 1e3;
        let out = apply_ddc(&tone(10_000, F0 + offset, 0.0), 2 * DECIMATION, F0, FS);
        let center = truncate_centered(&out, 100).unwrap();
        let expected = 2.0 * PI * offset * DECIMATION as f64 / FS;
        for pair in center.windows(2) {
            let dphi = (pair[1] * pair[0].conj()).arg();
            assert!((dphi - expected).abs() < 1e-2);
        }
    }

    #[test]
    fn out_of_band_tone_is_suppressed() {
        let offset = 4.0 * FS / DECIMATION as f64;
        let out = apply_ddc(&tone(10_000, F0 + offset, 0.0), 2 * DECIMATION, F0, FS);
        let center = truncate_centered(&out, 150).unwrap();
        assert!(center.iter().all(|s| s.norm() < 0.5 * 0.01));
    }

    #[test]
    fn truncation_is_centered() {
        let samples: Vec<usize> = (0..11).collect();
        assert_eq!(truncate_centered(&samples, 4).unwrap(), &[3, 4, 5, 6]);
        let samples: Vec<usize> = (0..10).collect();
        assert_eq!(truncate_centered(&samples, 3).unwrap(), &[3, 4, 5]);
        assert_eq!(truncate_centered(&samples, 10).unwrap().len(), 10);
    }

    #[test]
    fn short_records_are_rejected() {
        let samples = [0u8; 5];
        assert!(matches!(
            truncate_centered(&samples, 6),
            Err(Error::InsufficientSamples {
                available: 5,
                requested: 6
            })
        ));
    }
}
