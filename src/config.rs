//! YAML instrument configuration

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    hardware::PAGE_SIZE,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub tx: TxConfig,
    pub rx: RxConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Parameters of the simulated backend used by the binary
    #[serde(default)]
    pub sim: Option<SimConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxConfig {
    pub path: String,
    pub channel_enable: Vec<u8>,
    /// Output amplitude per channel in mV
    pub max_amplitude: Vec<u32>,
    #[serde(default)]
    pub filter_type: Vec<u8>,
    /// Sample rate in MHz
    pub sample_rate: u32,
    #[serde(default = "default_tx_notify")]
    pub notify_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RxConfig {
    pub path: String,
    pub channel_enable: Vec<u8>,
    /// Input range per channel in mV
    pub max_amplitude: Vec<u32>,
    /// Sample rate in MHz
    pub sample_rate: u32,
    #[serde(default)]
    pub memory_size: u64,
    #[serde(default)]
    pub loops: u32,
    #[serde(default = "yes")]
    pub timestamp_mode: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default = "default_pre_trigger")]
    pub pre_trigger: u32,
    #[serde(default = "default_post_trigger")]
    pub post_trigger: u32,
    /// Bytes per enabled channel in the sample ring
    #[serde(default = "default_rx_buffer")]
    pub buffer_size: usize,
    #[serde(default = "default_rx_notify")]
    pub notify_size: usize,
    #[serde(default = "default_ts_buffer")]
    pub timestamp_buffer_size: usize,
}

/// What to do with an average that timed out before every gate arrived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialAverages {
    /// Append whatever gates arrived as the average slice
    #[default]
    Keep,
    /// Skip the slice unless every expected gate arrived
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Delay between starting the rx and the tx card
    pub stagger_ms: u64,
    pub poll_interval_ms: u64,
    /// Added to the sequence duration to form the per-average timeout
    pub timeout_margin_s: f64,
    pub partial_averages: PartialAverages,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 500,
            poll_interval_ms: 10,
            timeout_margin_s: 5.0,
            partial_averages: PartialAverages::Keep,
        }
    }
}

impl AcquisitionConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout budget of one average for a sequence lasting `duration` seconds
    pub fn timeout(&self, duration: f64) -> Duration {
        Duration::from_secs_f64((self.timeout_margin_s + duration).max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    pub gates: usize,
    /// Gate length in tx samples
    pub gate_samples: usize,
    /// Idle tx samples before and between gates
    pub gate_spacing: usize,
    /// Frequency of the simulated echo in Hz
    pub signal_frequency: f64,
    pub signal_amplitude: f64,
    pub reference_amplitude: f64,
    /// Stop delivering gates after this many per average
    pub deliver_limit: Option<usize>,
    /// Deviation of the negotiated rx sample rate in parts per million
    pub sample_rate_error_ppm: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gates: 16,
            gate_samples: 120_000,
            gate_spacing: 10_000,
            signal_frequency: 2.0395e6,
            signal_amplitude: 8000.0,
            reference_amplitude: 16000.0,
            deliver_limit: None,
            sample_rate_error_ppm: 0.0,
        }
    }
}

fn yes() -> bool {
    true
}

fn default_timeout_ms() -> u32 {
    5000
}

fn default_pre_trigger() -> u32 {
    8
}

fn default_post_trigger() -> u32 {
    4096
}

fn default_rx_buffer() -> usize {
    204_800
}

fn default_rx_notify() -> usize {
    10 * PAGE_SIZE
}

fn default_ts_buffer() -> usize {
    2 * PAGE_SIZE
}

fn default_tx_notify() -> usize {
    128 * PAGE_SIZE
}

impl RxConfig {
    /// Calibration scalar (mV per LSB) of every enabled channel
    pub fn scaling(&self) -> Vec<f64> {
        self.max_amplitude
            .iter()
            .map(|amp| *amp as f64 / i16::MAX as f64)
            .collect()
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate as f64 * 1e6
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let rx = &self.rx;
        if rx.channel_enable.len() < 2 {
            return invalid("rx needs a signal and a reference channel enabled");
        }
        if rx.max_amplitude.len() < rx.channel_enable.len() {
            return invalid("rx max_amplitude must list every enabled channel");
        }
        if self.tx.channel_enable.is_empty()
            || self.tx.max_amplitude.len() < self.tx.channel_enable.len()
        {
            return invalid("tx max_amplitude must list every enabled channel");
        }
        if rx.channel_enable.iter().chain(&self.tx.channel_enable).any(|ch| *ch > 3) {
            return invalid("channel indices are 0..=3");
        }
        if rx.sample_rate == 0 || self.tx.sample_rate == 0 {
            return invalid("sample rates must be non-zero");
        }
        for (name, size) in [
            ("rx buffer_size", rx.buffer_size),
            ("rx notify_size", rx.notify_size),
            ("rx timestamp_buffer_size", rx.timestamp_buffer_size),
            ("tx notify_size", self.tx.notify_size),
        ] {
            if size == 0 || size % PAGE_SIZE != 0 {
                return invalid(&format!("{name} must be a multiple of {PAGE_SIZE} bytes"));
            }
        }
        if self.acquisition.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be non-zero");
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(Error::InvalidInput(msg.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
tx:
  path: /dev/spcm0
  channel_enable: [0, 1, 2, 3]
  max_amplitude: [200, 6000, 6000, 6000]
  filter_type: [0, 2, 2, 2]
  sample_rate: 20
rx:
  path: /dev/spcm1
  channel_enable: [0, 1]
  max_amplitude: [500, 500]
  sample_rate: 20
  memory_size: 65536
  loops: 0
  timestamp_mode: true
acquisition:
  partial_averages: discard
"#;

    #[test]
    fn parse_with_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.rx.timeout_ms, 5000);
        assert_eq!(config.rx.post_trigger, 4096);
        assert_eq!(config.rx.notify_size, 40960);
        assert_eq!(config.acquisition.stagger_ms, 500);
        assert_eq!(config.acquisition.poll_interval_ms, 10);
        assert_eq!(config.acquisition.partial_averages, PartialAverages::Discard);
        assert!(config.sim.is_none());
        assert_eq!(config.rx.sample_rate_hz(), 20e6);
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = Config::from_yaml(include_str!("../console.yaml")).unwrap();
        let sim = config.sim.unwrap();
        assert_eq!(sim.gates, 16);
        assert_eq!(sim.deliver_limit, None);
        assert_eq!(config.acquisition.partial_averages, PartialAverages::Keep);
    }

    #[test]
    fn scaling_is_mv_per_lsb() {
        let config = Config::from_yaml(YAML).unwrap();
        let scaling = config.rx.scaling();
        assert!((scaling[0] - 500.0 / 32767.0).abs() < 1e-12);
    }

    #[test]
    fn timeout_budget_adds_duration() {
        let acq = AcquisitionConfig::default();
        assert_eq!(acq.timeout(1.5), Duration::from_secs_f64(6.5));
    }

    #[test]
    fn rejects_single_rx_channel() {
        let yaml = YAML.replace("channel_enable: [0, 1]\n", "channel_enable: [0]\n");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_unaligned_buffer() {
        let yaml = YAML.replace("  loops: 0\n", "  loops: 0\n  buffer_size: 5000\n");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(Error::InvalidInput(_))
        ));
    }
}
