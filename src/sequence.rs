//! Boundary to the sequence compiler.
//!
//! Parsing and unrolling experiment sequences happens elsewhere; the
//! orchestrator only needs the replay waveform, its duration and how many adc
//! gates it will open.

use std::path::Path;

use crate::{
    error::{Error, Result},
    params::AcquisitionParameter,
};

/// File extension of sequence files accepted by [`crate::AcquisitionControl::run`]
pub const SEQUENCE_EXTENSION: &str = "seq";

/// The adc gate is carried in the most significant bit of tx channel 0
pub const GATE_BIT: u16 = 0x8000;

pub trait SequenceProvider: Send {
    /// Load a sequence file
    fn read(&mut self, path: &Path) -> Result<()>;

    /// Compile the loaded sequence into a replay waveform
    fn unroll(&mut self, parameter: &AcquisitionParameter) -> Result<UnrolledSequence>;

    /// Output amplitude of each tx channel in mV, used to scale waveforms
    fn set_max_amplitude(&mut self, _per_channel: &[u32]) {}
}

/// One open adc gate, in tx samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateWindow {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnrolledSequence {
    /// Interleaved tx samples, `channels` per frame
    pub seq: Vec<i16>,
    pub channels: usize,
    /// Sequence duration in seconds
    pub duration: f64,
    /// Number of adc gates, which is the number of gate records expected per average
    pub adc_count: usize,
    pub larmor_frequency: f64,
}

impl UnrolledSequence {
    pub fn new(
        seq: Vec<i16>,
        channels: usize,
        sample_rate_hz: f64,
        larmor_frequency: f64,
    ) -> Result<Self> {
        if channels == 0 || seq.len() % channels != 0 {
            return Err(Error::InvalidInput(format!(
                "{} samples do not form frames of {channels} channels",
                seq.len()
            )));
        }
        if sample_rate_hz <= 0.0 {
            return Err(Error::InvalidInput("tx sample rate must be positive".into()));
        }
        let adc_count = gate_windows(&seq, channels).len();
        Ok(Self {
            duration: (seq.len() / channels) as f64 / sample_rate_hz,
            seq,
            channels,
            adc_count,
            larmor_frequency,
        })
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.seq.len() / self.channels
    }

    pub fn gate_windows(&self) -> Vec<GateWindow> {
        gate_windows(&self.seq, self.channels)
    }
}

/// Pack a 15 bit analog value and the gate flag into one channel 0 sample
pub fn encode_gate_sample(analog: i16, gate: bool) -> i16 {
    let value = ((analog >> 1) as u16) & !GATE_BIT;
    (if gate { value | GATE_BIT } else { value }) as i16
}

/// Runs of set gate bits on channel 0 of an interleaved waveform
pub fn gate_windows(seq: &[i16], channels: usize) -> Vec<GateWindow> {
    let channels = channels.max(1);
    let mut windows = Vec::new();
    let mut open: Option<usize> = None;
    let frames = seq.chunks_exact(channels).map(|f| f[0] as u16 & GATE_BIT != 0);
    for (i, gate) in frames.enumerate() {
        match (gate, open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                windows.push(GateWindow {
                    start,
                    len: i - start,
                });
                open = None;
            }
            _ => (),
        }
    }
    if let Some(start) = open {
        windows.push(GateWindow {
            start,
            len: seq.len() / channels - start,
        });
    }
    windows
}
