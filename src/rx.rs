//! Receive card and its streaming engine.
//!
//! The stream thread does one thing, as fast as possible: drain the sample
//! ring and the timestamp ring of the card, cut the sample stream into gates
//! using the timestamp pairs and hand each finished gate over a channel to
//! whoever is polling. The card itself moves into the thread while it streams
//! and comes back on join, so nothing else can touch it in the meantime.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::{
    card::Card,
    config::RxConfig,
    error::{Error, Result, Warning},
    hardware::{
        BufferKind, Command, Direction, DmaBuffer, HardwareChannel, Register, Status,
        CARD_MODE_REC_FIFO_GATE, CLOCK_MODE_INTPLL, ERR_TIMEOUT, ERR_VALUE, PAGE_SIZE,
        TIMESTAMP_BYTES, TIMESTAMP_PAIR_BYTES, TRIGGER_MASK_EXT1, TRIGGER_MODE_POS,
        TS_COUNT_INTERNAL, TS_MODE_STARTRESET,
    },
};

/// Samples of every enabled channel captured between two timestamp markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRecord {
    /// One array per enabled channel, in channel order
    pub channels: Vec<Vec<i16>>,
    /// Hardware timestamp of the gate opening, in samples
    pub start: u64,
    /// Hardware timestamp of the gate closing, in samples
    pub end: u64,
}

impl GateRecord {
    /// Samples per channel
    pub fn sample_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// Split an interleaved frame stream into one array per channel
pub fn deinterleave(samples: &[i16], channels: usize) -> Vec<Vec<i16>> {
    let channels = channels.max(1);
    let frames = samples.len() / channels;
    let mut out: Vec<Vec<i16>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for frame in samples.chunks_exact(channels) {
        for (ch, s) in frame.iter().enumerate() {
            out[ch].push(*s);
        }
    }
    out
}

/// Cancellation flag and join handle of a running stream thread
struct Stream {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<(Card, Result<usize>)>,
}

/// Stream thread state. Owns the card for as long as the thread runs.
struct RxStreamEngine {
    card: Card,
    cancel: Arc<AtomicBool>,
    records: Sender<GateRecord>,
    num_channels: usize,
    pre_trigger: u64,
    post_trigger: u64,
    /// Interleaved samples drained from the ring but not yet part of a record
    staging: VecDeque<i16>,
    /// Timestamp pairs whose samples are not complete yet
    gates: VecDeque<(u64, u64)>,
    emitted: usize,
}

impl RxStreamEngine {
    fn run(mut self) -> (Card, Result<usize>) {
        let res = self.stream();
        if let Err(e) = &res {
            error!(error = %e, "Rx stream stopped");
        }
        (self.card, res)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn stream(&mut self) -> Result<usize> {
        while !self.cancelled() {
            match self.card.command(&[Command::WaitDma], "wait dma") {
                Ok(()) => (),
                // Only bounds how long a stop request waits, the orchestrator owns the timeout budget
                Err(Error::HardwareCommand {
                    code: ERR_TIMEOUT, ..
                }) => {
                    trace!("Dma wait timed out");
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.drain_samples()?;
            self.drain_timestamps()?;
            if !self.emit_records() {
                break;
            }
        }
        debug!(emitted = self.emitted, "Rx stream loop exited");
        Ok(self.emitted)
    }

    fn drain_samples(&mut self) -> Result<()> {
        loop {
            let avail = self.card.get(Register::DataAvailUserLen)? as usize;
            if avail == 0 {
                return Ok(());
            }
            let pos = self.card.get(Register::DataAvailUserPos)? as usize;
            let buffer = self
                .card
                .buffer(BufferKind::SampleData)
                .ok_or_else(|| Error::Resource("sample buffer is not registered".into()))?;
            // Never read across the end of the ring, the rest is picked up on the next pass
            let len = avail.min(buffer.len_bytes() - pos);
            let samples = &buffer.samples()[pos / 2..(pos + len) / 2];
            self.staging.extend(samples);
            self.card.set(Register::DataAvailCardLen, len as i64)?;
        }
    }

    fn drain_timestamps(&mut self) -> Result<()> {
        while self.card.get(Register::TsAvailUserLen)? as usize >= TIMESTAMP_PAIR_BYTES {
            let pos = self.card.get(Register::TsAvailUserPos)? as usize;
            let words = self
                .card
                .buffer(BufferKind::Timestamp)
                .ok_or_else(|| Error::Resource("timestamp buffer is not registered".into()))?
                .words();
            let word = |offset: usize| words.get(((pos + offset) % (words.len() * 8)) / 8).copied();
            let (Some(start), Some(end)) = (word(0), word(TIMESTAMP_BYTES)) else {
                return Err(Error::hardware(ERR_VALUE, "timestamp position out of range"));
            };
            if end < start {
                return Err(Error::hardware(
                    ERR_VALUE,
                    format!("timestamp pair out of order ({start}, {end})"),
                ));
            }
            trace!(start, end, "Timestamps");
            self.gates.push_back((start, end));
            self.card
                .set(Register::TsAvailCardLen, TIMESTAMP_PAIR_BYTES as i64)?;
        }
        Ok(())
    }

    /// Emit every gate whose samples are complete. Returns false once nobody listens anymore.
    fn emit_records(&mut self) -> bool {
        while let Some(&(start, end)) = self.gates.front() {
            let frames = (end - start + self.pre_trigger + self.post_trigger) as usize;
            let needed = frames * self.num_channels;
            if self.staging.len() < needed {
                break;
            }
            if self.cancelled() {
                return false;
            }
            let interleaved: Vec<i16> = self.staging.drain(..needed).collect();
            let record = GateRecord {
                channels: deinterleave(&interleaved, self.num_channels),
                start,
                end,
            };
            self.gates.pop_front();
            if self.records.send(record).is_err() {
                return false;
            }
            self.emitted += 1;
            trace!(gate = self.emitted, frames, "Emitted gate record");
        }
        true
    }
}

/// Digitizer card recording gated FIFO data with timestamps
pub struct RxCard {
    config: RxConfig,
    card: Option<Card>,
    stream: Option<Stream>,
    sample_buffer: Option<DmaBuffer>,
    timestamp_buffer: Option<DmaBuffer>,
    num_channels: usize,
    sample_rate_hz: f64,
}

impl RxCard {
    pub fn new(config: RxConfig) -> Self {
        let sample_rate_hz = config.sample_rate_hz();
        Self {
            config,
            card: None,
            stream: None,
            sample_buffer: None,
            timestamp_buffer: None,
            num_channels: 0,
            sample_rate_hz,
        }
    }

    /// Connect and configure the card and allocate both dma buffers
    pub fn connect(&mut self, hw: Box<dyn HardwareChannel>) -> Result<Option<Warning>> {
        if !self.config.timestamp_mode {
            return Err(Error::InvalidInput(
                "gated acquisition requires timestamp mode".into(),
            ));
        }
        let mut card = Card::connect(format!("rx {}", self.config.path), hw)?;
        let warning = self.setup_card(&mut card)?;
        let data_bytes = self.config.buffer_size * self.num_channels;
        if self.config.notify_size > data_bytes {
            return Err(Error::Resource(format!(
                "notify size {} exceeds sample buffer of {data_bytes} bytes",
                self.config.notify_size
            )));
        }
        self.sample_buffer = Some(DmaBuffer::allocate(data_bytes)?);
        self.timestamp_buffer = Some(DmaBuffer::allocate(self.config.timestamp_buffer_size)?);
        self.card = Some(card);
        Ok(warning)
    }

    fn setup_card(&mut self, card: &mut Card) -> Result<Option<Warning>> {
        let mask = self
            .config
            .channel_enable
            .iter()
            .fold(0i64, |mask, ch| mask | 1 << ch);
        card.set(Register::ChannelEnable, mask)?;
        for (ch, amp) in self.config.channel_enable.iter().zip(&self.config.max_amplitude) {
            card.set(Register::Termination(*ch), 0)?;
            card.set(Register::Amplitude(*ch), *amp as i64)?;
        }
        self.num_channels = card.get(Register::ChannelCount)? as usize;
        info!(channels = self.num_channels, "Active rx channels");
        card.set(Register::DigitalBwFilter, 0)?;

        let requested = self.config.sample_rate as i64 * 1_000_000;
        card.set(Register::SampleRate, requested)?;
        let actual = card.get(Register::SampleRate)?;
        self.sample_rate_hz = actual as f64;
        info!(rate_mhz = actual as f64 * 1e-6, "Rx sample rate");
        let warning = (actual != requested).then(|| {
            let warning = Warning::SampleRateMismatch {
                requested: requested as f64,
                actual: actual as f64,
            };
            warn!("Rx: {warning}");
            warning
        });

        card.set(Register::PostTrigger, self.config.post_trigger as i64)?;
        card.set(Register::PreTrigger, self.config.pre_trigger as i64)?;
        // Zero loops records until stopped
        card.set(Register::Loops, 0)?;
        card.set(Register::ClockMode, CLOCK_MODE_INTPLL)?;
        card.set(Register::Timeout, self.config.timeout_ms as i64)?;
        card.set(
            Register::TimestampCmd,
            TS_MODE_STARTRESET | TS_COUNT_INTERNAL,
        )?;
        card.set(Register::TriggerExt1Mode, TRIGGER_MODE_POS)?;
        card.set(Register::TriggerOrMask, TRIGGER_MASK_EXT1)?;
        card.set(Register::CardMode, CARD_MODE_REC_FIFO_GATE)?;
        Ok(warning)
    }

    pub fn is_connected(&self) -> bool {
        self.card.is_some() || self.stream.is_some()
    }

    /// Negotiated sample rate in Hz
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Calibration scalar of every enabled channel
    pub fn scaling(&self) -> Vec<f64> {
        self.config.scaling()
    }

    /// Register both buffers, start the card and launch the stream thread.
    ///
    /// Returns the receiving end of the gate record channel for this acquisition.
    pub fn start_operation(&mut self) -> Result<Receiver<GateRecord>> {
        if self.stream.is_some() {
            return Err(Error::InvalidInput("rx stream is already running".into()));
        }
        let mut card = self.card.take().ok_or(Error::NotReady)?;
        let armed = self.arm(&mut card);
        if let Err(e) = armed {
            let _ = card.command(
                &[Command::Stop, Command::StopDma, Command::ExtraStopDma],
                "stop after failed start",
            );
            self.reclaim_buffers(&mut card);
            self.card = Some(card);
            return Err(e);
        }

        let (sender, receiver) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let engine = RxStreamEngine {
            pre_trigger: self.config.pre_trigger as u64,
            post_trigger: self.config.post_trigger as u64,
            num_channels: self.num_channels.max(1),
            card,
            cancel: cancel.clone(),
            records: sender,
            staging: VecDeque::new(),
            gates: VecDeque::new(),
            emitted: 0,
        };
        let handle = thread::Builder::new()
            .name("rx-stream".into())
            .spawn(move || engine.run())?;
        self.stream = Some(Stream { cancel, handle });
        debug!("Rx stream started");
        Ok(receiver)
    }

    fn arm(&mut self, card: &mut Card) -> Result<()> {
        let samples = self
            .sample_buffer
            .take()
            .ok_or_else(|| Error::Resource("sample buffer not allocated".into()))?;
        let timestamps = self
            .timestamp_buffer
            .take()
            .ok_or_else(|| Error::Resource("timestamp buffer not allocated".into()))?;
        card.define_transfer(
            BufferKind::SampleData,
            Direction::CardToHost,
            self.config.notify_size,
            samples,
        )?;
        card.define_transfer(
            BufferKind::Timestamp,
            Direction::CardToHost,
            PAGE_SIZE,
            timestamps,
        )?;
        card.command(&[Command::ExtraPoll], "timestamp poll")?;
        card.command(
            &[Command::Start, Command::EnableTrigger, Command::StartDma],
            "start",
        )
    }

    fn reclaim_buffers(&mut self, card: &mut Card) {
        if let Some(buf) = card.release(BufferKind::SampleData) {
            self.sample_buffer = Some(buf);
        }
        if let Some(buf) = card.release(BufferKind::Timestamp) {
            self.timestamp_buffer = Some(buf);
        }
    }

    /// Whether the stream thread is alive. False after it failed on its own.
    pub fn is_running(&self) -> bool {
        self.stream
            .as_ref()
            .map_or(false, |s| !s.handle.is_finished())
    }

    /// Signal the stream thread, join it, then stop the card and drain both dma channels.
    ///
    /// Returns the error the stream thread exited with, if any.
    pub fn stop_operation(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            debug!("No active rx process found");
            return Ok(());
        };
        stream.cancel.store(true, Ordering::Release);
        let (mut card, streamed) = stream.handle.join().map_err(|_| Error::WorkerPanicked)?;
        let stopped = card.command(
            &[Command::Stop, Command::StopDma, Command::ExtraStopDma],
            "stop",
        );
        self.reclaim_buffers(&mut card);
        self.card = Some(card);
        let emitted = streamed?;
        stopped?;
        debug!(emitted, "Rx stream stopped");
        Ok(())
    }

    /// Card status, available while no stream is running
    pub fn status(&mut self) -> Option<Status> {
        self.card.as_mut().map(Card::status)
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.stop_operation() {
            warn!(error = %e, "Rx stop during disconnect failed");
        }
        self.card = None;
        self.sample_buffer = None;
        self.timestamp_buffer = None;
    }
}

impl Drop for RxCard {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.disconnect();
        }
    }
}
