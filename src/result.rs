//! Post-processing of gate records and the growing acquisition result

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Utc};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    ddc::{truncate_centered, Downconverter},
    error::{Error, Result},
    rx::GateRecord,
};

/// Rows of `samples` complex values, grouped by average.
///
/// Averages may hold different row counts when a partial average was kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComplexCube {
    data: Vec<Complex64>,
    samples: usize,
    rows: Vec<usize>,
}

impl ComplexCube {
    /// Samples per row, zero while empty
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn averages(&self) -> usize {
        self.rows.len()
    }

    /// Total rows across all averages
    pub fn rows(&self) -> usize {
        self.rows.iter().sum()
    }

    /// Row count of every average
    pub fn rows_per_average(&self) -> &[usize] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn as_slice(&self) -> &[Complex64] {
        &self.data
    }

    /// All rows of one average, contiguous
    pub fn average(&self, index: usize) -> Option<&[Complex64]> {
        let rows = *self.rows.get(index)?;
        let offset = self.rows[..index].iter().sum::<usize>() * self.samples;
        Some(&self.data[offset..offset + rows * self.samples])
    }

    pub fn gate(&self, average: usize, gate: usize) -> Option<&[Complex64]> {
        self.average(average)?
            .chunks_exact(self.samples.max(1))
            .nth(gate)
    }

    fn push(&mut self, values: &[Complex64], rows: usize, samples: usize) -> Result<()> {
        if !self.is_empty() && samples != self.samples {
            return Err(Error::ShapeMismatch {
                expected: self.samples,
                actual: samples,
            });
        }
        debug_assert_eq!(values.len(), rows * samples);
        self.samples = samples;
        self.data.extend_from_slice(values);
        self.rows.push(rows);
        Ok(())
    }

    /// Real and imaginary parts, laid out little-endian in memory
    fn interleaved(&self) -> Vec<f64> {
        self.data
            .iter()
            .flat_map(|c| [c.re, c.im])
            .map(|v| f64::from_bits(v.to_bits().to_le()))
            .collect()
    }
}

/// Downconverted data of one average, `gates` rows of `samples` values each
#[derive(Debug, Clone, PartialEq)]
pub struct AverageSlice {
    pub signal: Vec<Complex64>,
    pub reference: Vec<Complex64>,
    pub raw: Vec<Complex64>,
    pub gates: usize,
    pub samples: usize,
}

/// Remove the common phase of the reference from the signal, sample by sample
pub fn phase_correct(signal: &[Complex64], reference: &[Complex64]) -> Vec<Complex64> {
    signal
        .iter()
        .zip(reference)
        .map(|(s, r)| s * Complex64::from_polar(1.0, -r.arg()))
        .collect()
}

/// Scale, downconvert and center-truncate channel 0 (signal) and channel 1 (reference) of every record
pub fn post_process(
    records: &[GateRecord],
    ddc: &Downconverter,
    scaling: &[f64],
    adc_samples: usize,
) -> Result<AverageSlice> {
    if scaling.len() < 2 {
        return Err(Error::InvalidInput(
            "signal and reference need a calibration scalar each".into(),
        ));
    }
    let mut signal = Vec::with_capacity(records.len() * adc_samples);
    let mut reference = Vec::with_capacity(records.len() * adc_samples);
    for record in records {
        if record.channels.len() < 2 {
            return Err(Error::ShapeMismatch {
                expected: 2,
                actual: record.channels.len(),
            });
        }
        for (ch, out) in [(0, &mut signal), (1, &mut reference)] {
            let scaled: Vec<f64> = record.channels[ch]
                .iter()
                .map(|s| *s as f64 * scaling[ch])
                .collect();
            let baseband = ddc.apply(&scaled);
            out.extend_from_slice(truncate_centered(&baseband, adc_samples)?);
        }
    }
    let raw = phase_correct(&signal, &reference);
    debug!(gates = records.len(), adc_samples, "Processed average");
    Ok(AverageSlice {
        signal,
        reference,
        raw,
        gates: records.len(),
        samples: adc_samples,
    })
}

/// Phase corrected, signal and reference data of every average acquired so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionResult {
    raw: ComplexCube,
    signal: ComplexCube,
    reference: ComplexCube,
    dwell_time: Option<f64>,
}

impl AcquisitionResult {
    pub fn raw(&self) -> &ComplexCube {
        &self.raw
    }

    pub fn signal(&self) -> &ComplexCube {
        &self.signal
    }

    pub fn reference(&self) -> &ComplexCube {
        &self.reference
    }

    /// Seconds between decimated samples, set once a run completed
    pub fn dwell_time(&self) -> Option<f64> {
        self.dwell_time
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Readout length of the stored averages
    pub fn adc_samples(&self) -> Option<usize> {
        (!self.is_empty()).then_some(self.raw.samples())
    }

    /// Append one average to all three arrays
    pub fn append(&mut self, slice: AverageSlice) -> Result<()> {
        if let Some(expected) = self.adc_samples() {
            if expected != slice.samples {
                return Err(Error::ShapeMismatch {
                    expected,
                    actual: slice.samples,
                });
            }
        }
        self.raw.push(&slice.raw, slice.gates, slice.samples)?;
        self.signal.push(&slice.signal, slice.gates, slice.samples)?;
        self.reference
            .push(&slice.reference, slice.gates, slice.samples)?;
        Ok(())
    }

    pub fn set_dwell_time(&mut self, dwell_time: f64) {
        self.dwell_time = Some(dwell_time);
    }

    /// Write a YAML header and the binary arrays into `dir`, returning the header path.
    ///
    /// The binary file holds raw, signal and reference one after the other as
    /// interleaved real and imaginary little-endian f64 values.
    pub fn write(&self, dir: impl AsRef<Path>, info: &BTreeMap<String, String>) -> Result<PathBuf> {
        let now = Utc::now();
        let stem = format!("acq-{}", now.format("%Y%m%d-%H%M%S%.3f"));
        let dir = dir.as_ref();
        let data_path = dir.join(format!("{stem}.bin"));
        let header_path = dir.join(format!("{stem}.yaml"));

        let mut data = BufWriter::new(File::create(&data_path)?);
        for cube in [&self.raw, &self.signal, &self.reference] {
            data.write_all(cube.interleaved().as_byte_slice())?;
        }
        data.flush()?;

        let header = ResultHeader::new(self, now, format!("{stem}.bin"), info.clone());
        serde_yaml::to_writer(File::create(&header_path)?, &header)?;
        info!(path = %header_path.display(), rows = self.raw.rows(), "Wrote acquisition result");
        Ok(header_path)
    }
}

/// Metadata stored next to the binary arrays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultHeader {
    pub created: String,
    pub data_file: String,
    pub byte_order: String,
    pub arrays: Vec<String>,
    pub adc_samples: usize,
    pub rows_per_average: Vec<usize>,
    pub dwell_time: Option<f64>,
    pub info: BTreeMap<String, String>,
}

impl ResultHeader {
    fn new(
        result: &AcquisitionResult,
        created: DateTime<Utc>,
        data_file: String,
        info: BTreeMap<String, String>,
    ) -> Self {
        Self {
            created: created.to_rfc3339(),
            data_file,
            byte_order: "little".into(),
            arrays: ["raw", "signal", "reference"].map(String::from).to_vec(),
            adc_samples: result.raw.samples(),
            rows_per_average: result.raw.rows_per_average().to_vec(),
            dwell_time: result.dwell_time,
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use rand::prelude::*;

    use super::*;

    fn noisy_tone(rng: &mut impl Rng, len: usize, amp: f64, phase: f64) -> Vec<i16> {
        let w = 2.0 * PI * 100e3 / 1e6;
        (0..len)
            .map(|n| {
                let noise: f64 = rng.gen_range(-50.0..50.0);
                (amp * (w * n as f64 + phase).cos() + noise) as i16
            })
            .collect()
    }

    fn noisy_record(rng: &mut impl Rng, len: usize, drift: f64) -> GateRecord {
        GateRecord {
            channels: vec![
                noisy_tone(rng, len, 8000.0, drift + 0.4),
                noisy_tone(rng, len, 12000.0, drift),
            ],
            start: 0,
            end: len as u64,
        }
    }

    fn slice(gates: usize, samples: usize, phase: f64) -> AverageSlice {
        let signal: Vec<Complex64> = (0..gates * samples)
            .map(|i| Complex64::from_polar(2.0, 0.3 + phase + i as f64 * 0.01))
            .collect();
        let reference: Vec<Complex64> = (0..gates * samples)
            .map(|i| Complex64::from_polar(5.0, phase + i as f64 * 0.01))
            .collect();
        AverageSlice {
            raw: phase_correct(&signal, &reference),
            signal,
            reference,
            gates,
            samples,
        }
    }

    #[test]
    fn phase_correction_removes_reference_phase() {
        let sig = [Complex64::from_polar(3.0, 1.2), Complex64::from_polar(1.0, -2.0)];
        let reference = [Complex64::from_polar(7.0, 0.9), Complex64::from_polar(0.5, PI / 2.0)];
        let raw = phase_correct(&sig, &reference);
        assert!((raw[0] - Complex64::from_polar(3.0, 0.3)).norm() < 1e-12);
        assert!((raw[1] - Complex64::from_polar(1.0, -2.0 - PI / 2.0)).norm() < 1e-12);
    }

    #[test]
    fn post_process_cancels_gate_drift() {
        let mut rng = StdRng::seed_from_u64(7);
        let records: Vec<GateRecord> = (0..4)
            .map(|k| noisy_record(&mut rng, 2000, 0.9 * k as f64))
            .collect();
        let ddc = Downconverter::new(40, 100e3, 1e6);
        let slice = post_process(&records, &ddc, &[0.5, 0.5], 30).unwrap();
        assert_eq!((slice.gates, slice.samples), (4, 30));
        assert_eq!(slice.raw.len(), 120);
        for s in &slice.raw {
            assert!((s.arg() - 0.4).abs() < 0.02, "{s}");
        }
        // Signal keeps the drift, only the corrected data lines up
        let drift = (slice.signal[30] * slice.signal[0].conj()).arg();
        assert!((drift - 0.9).abs() < 0.02);
    }

    #[test]
    fn post_process_rejects_short_records() {
        let mut rng = StdRng::seed_from_u64(1);
        let records = vec![noisy_record(&mut rng, 500, 0.0)];
        let ddc = Downconverter::new(40, 100e3, 1e6);
        assert!(matches!(
            post_process(&records, &ddc, &[1.0, 1.0], 30),
            Err(Error::InsufficientSamples {
                available: 25,
                requested: 30
            })
        ));
    }

    #[test]
    fn common_drift_cancels() {
        let a = slice(3, 4, 0.0);
        let b = slice(3, 4, 1.7);
        for (x, y) in a.raw.iter().zip(&b.raw) {
            assert!((x - y).norm() < 1e-12);
        }
    }

    #[test]
    fn arrays_grow_by_whole_averages() {
        let mut result = AcquisitionResult::default();
        assert_eq!(result.adc_samples(), None);
        result.append(slice(3, 4, 0.0)).unwrap();
        result.append(slice(2, 4, 0.5)).unwrap();
        for cube in [result.raw(), result.signal(), result.reference()] {
            assert_eq!(cube.averages(), 2);
            assert_eq!(cube.rows(), 5);
            assert_eq!(cube.rows_per_average(), &[3, 2]);
            assert_eq!(cube.as_slice().len(), 20);
        }
        assert_eq!(result.raw().average(1).unwrap().len(), 8);
        assert_eq!(result.raw().gate(1, 1).unwrap(), &slice(2, 4, 0.5).raw[4..]);
        assert!(result.raw().gate(1, 2).is_none());
        assert!(result.raw().average(2).is_none());
    }

    #[test]
    fn readout_length_is_fixed() {
        let mut result = AcquisitionResult::default();
        result.append(slice(1, 4, 0.0)).unwrap();
        assert!(matches!(
            result.append(slice(1, 5, 0.0)),
            Err(Error::ShapeMismatch {
                expected: 4,
                actual: 5
            })
        ));
        assert_eq!(result.raw().rows(), 1);
    }

    #[test]
    fn writes_header_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = AcquisitionResult::default();
        result.append(slice(2, 3, 0.0)).unwrap();
        result.set_dwell_time(5e-6);
        let info = BTreeMap::from([("sequence".to_owned(), "se.seq".to_owned())]);
        let header_path = result.write(dir.path(), &info).unwrap();

        let header: ResultHeader =
            serde_yaml::from_reader(File::open(&header_path).unwrap()).unwrap();
        assert_eq!(header.adc_samples, 3);
        assert_eq!(header.rows_per_average, vec![2]);
        assert_eq!(header.dwell_time, Some(5e-6));
        assert_eq!(header.info["sequence"], "se.seq");
        let data = std::fs::read(dir.path().join(&header.data_file)).unwrap();
        // three arrays of 6 complex f64
        assert_eq!(data.len(), 3 * 6 * 16);
        let first = result.raw().as_slice()[0];
        assert_eq!(&data[..8], &first.re.to_le_bytes());
        assert_eq!(&data[8..16], &first.im.to_le_bytes());
    }
}
