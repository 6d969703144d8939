//! Acquisition control: owns both cards and drives averaged runs.
//!
//! Every average arms the rx card, waits for it to settle, starts the tx
//! replay and polls the gate record channel until all gates of the sequence
//! arrived or the timeout budget ran out. Records are then downconverted,
//! phase corrected and appended to the result, which keeps growing across
//! runs.

use std::{
    ffi::OsStr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, PartialAverages},
    ddc::Downconverter,
    error::{Error, Result, Warning},
    hardware::HardwareChannel,
    params::AcquisitionParameter,
    result::{post_process, AcquisitionResult, ComplexCube},
    rx::{GateRecord, RxCard},
    sequence::{SequenceProvider, UnrolledSequence, SEQUENCE_EXTENSION},
    tx::TxCard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotSetup,
    Setup,
    Armed,
    Polling,
    Processing,
    Idle,
}

/// What happened during one average
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AverageOutcome {
    pub index: usize,
    pub received: usize,
    pub expected: usize,
    pub timed_out: bool,
    /// Whether a slice was appended to the result
    pub appended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub averages: Vec<AverageOutcome>,
    pub dwell_time: f64,
}

impl RunSummary {
    pub fn timed_out(&self) -> bool {
        self.averages.iter().any(|a| a.timed_out)
    }
}

/// Per-run values shared by every average
struct RunContext<'a> {
    sequence: &'a UnrolledSequence,
    ddc: Downconverter,
    scaling: Vec<f64>,
    adc_samples: usize,
    timeout: Duration,
    averages: usize,
}

pub struct AcquisitionControl {
    config: Config,
    provider: Box<dyn SequenceProvider>,
    tx: TxCard,
    rx: RxCard,
    state: State,
    f_spcm: f64,
    warnings: Vec<Warning>,
    result: AcquisitionResult,
    unrolled: Option<UnrolledSequence>,
    interrupt: Arc<AtomicBool>,
}

impl AcquisitionControl {
    pub fn new(config: Config, provider: Box<dyn SequenceProvider>) -> Self {
        Self {
            tx: TxCard::new(config.tx.clone()),
            rx: RxCard::new(config.rx.clone()),
            f_spcm: config.rx.sample_rate_hz(),
            config,
            provider,
            state: State::NotSetup,
            warnings: Vec::new(),
            result: AcquisitionResult::default(),
            unrolled: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect and configure both cards. Returns the non-fatal findings of the setup.
    pub fn connect(
        &mut self,
        tx_hw: Box<dyn HardwareChannel>,
        rx_hw: Box<dyn HardwareChannel>,
    ) -> Result<&[Warning]> {
        self.config.validate()?;
        self.disconnect();
        self.warnings.clear();

        if let Some(w) = self.tx.connect(tx_hw)? {
            self.warnings.push(w);
        }
        match self.rx.connect(rx_hw) {
            Ok(Some(w)) => self.warnings.push(w),
            Ok(None) => (),
            Err(e) => {
                self.tx.disconnect();
                return Err(e);
            }
        }
        self.f_spcm = self.rx.sample_rate_hz();
        self.provider.set_max_amplitude(&self.config.tx.max_amplitude);
        self.state = State::Setup;
        info!(f_spcm = self.f_spcm, "Measurement cards are setup");
        Ok(self.warnings.as_slice())
    }

    pub fn disconnect(&mut self) {
        self.tx.disconnect();
        self.rx.disconnect();
        self.state = State::NotSetup;
    }

    pub fn is_setup(&self) -> bool {
        self.state != State::NotSetup
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Flag that aborts a running acquisition at its next poll
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Rx sample rate used for downconversion
    pub fn sample_rate_hz(&self) -> f64 {
        self.f_spcm
    }

    pub fn result(&self) -> &AcquisitionResult {
        &self.result
    }

    pub fn raw_data(&self) -> &ComplexCube {
        self.result.raw()
    }

    pub fn signal_data(&self) -> &ComplexCube {
        self.result.signal()
    }

    pub fn reference_data(&self) -> &ComplexCube {
        self.result.reference()
    }

    pub fn dwell_time(&self) -> Option<f64> {
        self.result.dwell_time()
    }

    /// Sequence of the most recent run
    pub fn unrolled_sequence(&self) -> Option<&UnrolledSequence> {
        self.unrolled.as_ref()
    }

    /// Drop all acquired data
    pub fn clear(&mut self) {
        self.result = AcquisitionResult::default();
    }

    /// Acquire `num_averages` averages of the sequence at `path`.
    ///
    /// Timeouts are not errors: the summary reports them and, depending on the
    /// partial average policy, what arrived is still appended.
    pub fn run(
        &mut self,
        path: impl AsRef<Path>,
        parameter: &AcquisitionParameter,
        num_averages: usize,
    ) -> Result<RunSummary> {
        if !self.is_setup() {
            return Err(Error::NotReady);
        }
        let path = path.as_ref();
        if path.extension().and_then(OsStr::to_str) != Some(SEQUENCE_EXTENSION) {
            return Err(Error::InvalidInput(format!(
                "{} is not a .{SEQUENCE_EXTENSION} file",
                path.display()
            )));
        }
        parameter.validate()?;
        if let Some(expected) = self.result.adc_samples() {
            if expected != parameter.adc_samples {
                return Err(Error::ShapeMismatch {
                    expected,
                    actual: parameter.adc_samples,
                });
            }
        }
        self.interrupt.store(false, Ordering::Release);

        self.provider.read(path)?;
        let sequence = self.provider.unroll(parameter)?;
        let ctx = RunContext {
            sequence: &sequence,
            ddc: Downconverter::new(parameter.kernel_size(), parameter.larmor_frequency, self.f_spcm),
            scaling: self.rx.scaling(),
            adc_samples: parameter.adc_samples,
            timeout: self.config.acquisition.timeout(sequence.duration),
            averages: num_averages,
        };
        info!(
            sequence = %path.display(),
            duration = sequence.duration,
            adc_count = sequence.adc_count,
            num_averages,
            "Starting acquisition"
        );

        let mut averages = Vec::with_capacity(num_averages);
        let mut outcome = Ok(());
        for index in 0..num_averages {
            match self.average(index, &ctx) {
                Ok(avg) => averages.push(avg),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        drop(ctx);
        self.unrolled = Some(sequence);
        if let Err(e) = outcome {
            self.state = State::Setup;
            return Err(e);
        }

        let dwell_time = parameter.dwell_time(self.f_spcm);
        self.result.set_dwell_time(dwell_time);
        self.state = State::Idle;
        info!(dwell_time, rows = self.result.raw().rows(), "Acquisition finished");
        Ok(RunSummary {
            averages,
            dwell_time,
        })
    }

    fn average(&mut self, index: usize, ctx: &RunContext) -> Result<AverageOutcome> {
        let expected = ctx.sequence.adc_count;
        info!("Acquisition {}/{}", index + 1, ctx.averages);
        self.state = State::Armed;
        let records = self.rx.start_operation()?;
        thread::sleep(self.config.acquisition.stagger());
        if let Err(e) = self.tx.start_operation(ctx.sequence) {
            self.abort();
            return Err(e);
        }

        self.state = State::Polling;
        let (gates, timed_out) = self.poll(&records, expected, ctx.timeout);
        let interrupted = self.interrupt.load(Ordering::Acquire);

        self.state = State::Processing;
        let complete = gates.len() == expected;
        let keep = !interrupted
            && !gates.is_empty()
            && (complete || self.config.acquisition.partial_averages == PartialAverages::Keep);
        let processed = if keep {
            post_process(&gates, &ctx.ddc, &ctx.scaling, ctx.adc_samples).map(Some)
        } else {
            Ok(None)
        };

        let tx_stopped = self.tx.stop_operation();
        let rx_stopped = self.rx.stop_operation();
        tx_stopped?;
        rx_stopped?;
        if timed_out {
            if let Some(status) = self.rx.status() {
                debug!(flags = ?status.flags(), "Rx status after timeout");
            }
        }
        if interrupted {
            warn!(average = index, "Acquisition interrupted");
            return Err(Error::Interrupted);
        }
        let appended = match processed? {
            Some(slice) => {
                self.result.append(slice)?;
                true
            }
            None => false,
        };
        debug!(average = index, received = gates.len(), appended, "Average done");
        Ok(AverageOutcome {
            index,
            received: gates.len(),
            expected,
            timed_out,
            appended,
        })
    }

    /// Collect gate records until `expected` arrived, the stream ended, an
    /// interrupt was raised or `timeout` elapsed. Returns the records and
    /// whether the timeout was hit.
    fn poll(
        &self,
        records: &Receiver<GateRecord>,
        expected: usize,
        timeout: Duration,
    ) -> (Vec<GateRecord>, bool) {
        let started = Instant::now();
        let mut gates = Vec::with_capacity(expected);
        let timed_out = loop {
            gates.extend(records.try_iter());
            if gates.len() >= expected || self.interrupt.load(Ordering::Acquire) {
                break false;
            }
            if !self.rx.is_running() {
                // Stream ended on its own, the error surfaces on stop
                gates.extend(records.try_iter());
                break false;
            }
            if started.elapsed() >= timeout {
                warn!(
                    "Acquisition Timeout: Only received {}/{} adc events",
                    gates.len(),
                    expected
                );
                break true;
            }
            thread::sleep(self.config.acquisition.poll_interval());
        };
        gates.truncate(expected);
        (gates, timed_out)
    }

    fn abort(&mut self) {
        if let Err(e) = self.tx.stop_operation() {
            warn!(error = %e, "Tx stop after failed start");
        }
        if let Err(e) = self.rx.stop_operation() {
            warn!(error = %e, "Rx stop after failed start");
        }
        self.state = State::Setup;
    }
}
