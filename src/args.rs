//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::params::AcquisitionParameter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// YAML instrument configuration
    #[clap(short, long)]
    pub config: PathBuf,
    /// Sequence file to replay (must end in .seq)
    #[clap(short, long)]
    pub sequence: PathBuf,
    /// Number of averages to acquire
    #[clap(short = 'n', long, default_value_t = 1)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub averages: u32,
    /// Larmor frequency in Hz
    #[clap(short, long, default_value_t = 2.0395e6)]
    pub larmor_frequency: f64,
    /// Decimation factor of the downconversion
    #[clap(short, long, default_value_t = 200)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub decimation: u32,
    /// Samples kept per gate after decimation
    #[clap(short, long, default_value_t = 512)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub adc_samples: u32,
    #[clap(long, default_value_t = 1.0)]
    pub b1_scaling: f64,
    #[clap(long, default_value_t = 1.0)]
    pub fov_scaling: f64,
    /// Directory the result is written to
    #[clap(short, long, default_value = ".")]
    pub output: PathBuf,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn parameter(&self) -> AcquisitionParameter {
        AcquisitionParameter {
            larmor_frequency: self.larmor_frequency,
            b1_scaling: self.b1_scaling,
            fov_scaling: self.fov_scaling,
            downsampling_rate: self.decimation as usize,
            adc_samples: self.adc_samples as usize,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_arguments() {
        let args = Args::try_parse_from([
            "spcm_console",
            "-c",
            "console.yaml",
            "-s",
            "se.seq",
            "-n",
            "4",
            "--decimation",
            "100",
        ])
        .unwrap();
        assert_eq!(args.averages, 4);
        let p = args.parameter();
        assert_eq!(p.downsampling_rate, 100);
        assert_eq!(p.adc_samples, 512);
        assert_eq!(p.kernel_size(), 200);
    }

    #[test]
    fn zero_averages_are_rejected() {
        assert!(Args::try_parse_from(["spcm_console", "-c", "a.yaml", "-s", "b.seq", "-n", "0"])
            .is_err());
    }

    #[test]
    fn verbosity_maps_to_tracing() {
        assert_eq!(
            convert_filter(log::LevelFilter::Debug),
            tracing_subscriber::filter::LevelFilter::DEBUG
        );
    }
}
