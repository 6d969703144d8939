//! Simulated transmit/receive card pair.
//!
//! The tx card decodes the adc gate marker of the uploaded waveform when it is
//! started and forwards every gate window to the linked rx card. The rx card
//! synthesizes an echo for each gate (signal on channel 0, reference on
//! channel 1, both carrying the same per-gate phase drift), pushes it through
//! its sample ring in notify-sized steps and writes the bracketing timestamps,
//! following the same register protocol as the real hardware.

use std::{
    collections::{HashMap, VecDeque},
    f64::consts::PI,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::{
    config::{SimConfig, TxConfig},
    error::{Error, Result},
    hardware::{
        BufferKind, Command, Direction, DmaBuffer, HardwareChannel, Register, ERR_BUFFER, ERR_OK,
        ERR_REGISTER, ERR_SEQUENCE, ERR_TIMEOUT, ERR_VALUE, PAGE_SIZE, STATUS_DATA_BLOCKREADY,
        STATUS_DATA_TRANSFER, STATUS_EXTRA_BLOCKREADY, STATUS_EXTRA_TRANSFER, STATUS_READY,
        STATUS_TRIGGER, TIMESTAMP_PAIR_BYTES,
    },
    params::AcquisitionParameter,
    sequence::{encode_gate_sample, gate_windows, SequenceProvider, UnrolledSequence},
};

const TX_CARD_TYPE: i64 = 0x6_6631;
const RX_CARD_TYPE: i64 = 0x4_4631;

/// A gate window opened by the tx card, in tx samples
#[derive(Debug, Clone, Copy)]
struct TxGate {
    start: usize,
    len: usize,
    rate: f64,
}

/// Echo model of the simulated receive chain
#[derive(Debug, Clone, PartialEq)]
pub struct SimSignal {
    /// Echo frequency in Hz
    pub frequency: f64,
    pub signal_amplitude: f64,
    pub reference_amplitude: f64,
    /// Constant phase of the signal relative to the reference
    pub signal_phase: f64,
    /// Common phase step between consecutive gates
    pub drift_per_gate: f64,
    /// Gates delivered per start of the rx card
    pub deliver_limit: Option<usize>,
    pub sample_rate_error_ppm: f64,
}

impl Default for SimSignal {
    fn default() -> Self {
        Self {
            frequency: 2.0e6,
            signal_amplitude: 8000.0,
            reference_amplitude: 16000.0,
            signal_phase: 0.3,
            drift_per_gate: 0.7,
            deliver_limit: None,
            sample_rate_error_ppm: 0.0,
        }
    }
}

impl SimSignal {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            frequency: config.signal_frequency,
            signal_amplitude: config.signal_amplitude,
            reference_amplitude: config.reference_amplitude,
            deliver_limit: config.deliver_limit,
            sample_rate_error_ppm: config.sample_rate_error_ppm,
            ..Default::default()
        }
    }

    /// Sample `i` of `channel` in the record of gate number `gate`
    pub fn sample(
        &self,
        channel: usize,
        gate: usize,
        start: u64,
        i: usize,
        pre_trigger: u64,
        rate: f64,
    ) -> i16 {
        let n = start as f64 - pre_trigger as f64 + i as f64;
        let phase = 2.0 * PI * self.frequency * n / rate + gate as f64 * self.drift_per_gate;
        let value = match channel {
            0 => self.signal_amplitude * (phase + self.signal_phase).cos(),
            1 => self.reference_amplitude * phase.cos(),
            _ => 0.0,
        };
        value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

/// Linked tx and rx card
pub fn instrument(signal: SimSignal) -> (SimTxCard, SimRxCard) {
    let (link, gates) = unbounded();
    (SimTxCard::new(link), SimRxCard::new(signal, gates))
}

fn popcount(regs: &HashMap<Register, i64>) -> i64 {
    regs.get(&Register::ChannelEnable)
        .map_or(0, |mask| mask.count_ones() as i64)
}

fn failure(fail: &Option<(Command, u32)>, commands: &[Command]) -> Option<u32> {
    fail.and_then(|(cmd, code)| commands.contains(&cmd).then_some(code))
}

pub struct SimTxCard {
    regs: HashMap<Register, i64>,
    buffer: Option<DmaBuffer>,
    dma: bool,
    running: bool,
    link: Sender<TxGate>,
    fail: Option<(Command, u32)>,
}

impl SimTxCard {
    fn new(link: Sender<TxGate>) -> Self {
        Self {
            regs: HashMap::new(),
            buffer: None,
            dma: false,
            running: false,
            link,
            fail: None,
        }
    }

    /// Make every command batch containing `command` return `code`
    pub fn fail_on(&mut self, command: Command, code: u32) -> &mut Self {
        self.fail = Some((command, code));
        self
    }

    fn publish_gates(&self) {
        let Some(buffer) = &self.buffer else { return };
        let channels = popcount(&self.regs).max(1) as usize;
        let frames = self
            .regs
            .get(&Register::MemorySize)
            .map_or(buffer.samples().len() / channels, |m| *m as usize);
        let seq = &buffer.samples()[..(frames * channels).min(buffer.samples().len())];
        let rate = self.regs.get(&Register::SampleRate).copied().unwrap_or(1) as f64;
        let windows = gate_windows(seq, channels);
        debug!(gates = windows.len(), "Sim tx replaying");
        for w in windows {
            let _ = self.link.send(TxGate {
                start: w.start,
                len: w.len,
                rate,
            });
        }
    }
}

impl HardwareChannel for SimTxCard {
    fn set_param(&mut self, reg: Register, value: i64) -> u32 {
        match reg {
            Register::CardType | Register::ChannelCount | Register::Status => ERR_REGISTER,
            _ => {
                self.regs.insert(reg, value);
                ERR_OK
            }
        }
    }

    fn get_param(&mut self, reg: Register) -> std::result::Result<i64, u32> {
        Ok(match reg {
            Register::CardType => TX_CARD_TYPE,
            Register::ChannelCount => popcount(&self.regs),
            Register::Status => self.status() as i64,
            _ => self.regs.get(&reg).copied().unwrap_or(0),
        })
    }

    fn define_transfer(
        &mut self,
        kind: BufferKind,
        direction: Direction,
        _notify_size: usize,
        buffer: DmaBuffer,
    ) -> u32 {
        if kind != BufferKind::SampleData || direction != Direction::HostToCard {
            return ERR_BUFFER;
        }
        self.buffer = Some(buffer);
        ERR_OK
    }

    fn transfer_buffer(&self, kind: BufferKind) -> Option<&DmaBuffer> {
        match kind {
            BufferKind::SampleData => self.buffer.as_ref(),
            BufferKind::Timestamp => None,
        }
    }

    fn release_transfer(&mut self, kind: BufferKind) -> Option<DmaBuffer> {
        match kind {
            BufferKind::SampleData => {
                self.dma = false;
                self.buffer.take()
            }
            BufferKind::Timestamp => None,
        }
    }

    fn command(&mut self, commands: &[Command]) -> u32 {
        if let Some(code) = failure(&self.fail, commands) {
            return code;
        }
        for cmd in commands {
            match cmd {
                Command::Reset => {
                    self.regs.clear();
                    self.dma = false;
                    self.running = false;
                }
                Command::StartDma if self.buffer.is_none() => return ERR_SEQUENCE,
                Command::StartDma => self.dma = true,
                Command::WaitDma if !self.dma => return ERR_SEQUENCE,
                Command::Start if !self.dma => return ERR_SEQUENCE,
                Command::Start => {
                    self.running = true;
                    self.publish_gates();
                }
                Command::Stop => self.running = false,
                Command::StopDma => self.dma = false,
                _ => (),
            }
        }
        ERR_OK
    }

    fn status(&mut self) -> u32 {
        let mut status = 0;
        if !self.running {
            status |= STATUS_READY;
        }
        if self.dma {
            status |= STATUS_DATA_TRANSFER;
        }
        status
    }
}

pub struct SimRxCard {
    regs: HashMap<Register, i64>,
    signal: SimSignal,
    gates: Receiver<TxGate>,
    data: Option<DmaBuffer>,
    timestamps: Option<DmaBuffer>,
    notify_size: usize,
    running: bool,
    dma: bool,
    extra_dma: bool,
    data_pos: usize,
    data_len: usize,
    ts_pos: usize,
    ts_len: usize,
    /// Synthesized samples not yet written to the ring
    pending: VecDeque<i16>,
    /// Timestamp pairs with the total byte count after which their gate is in the ring
    pending_ts: VecDeque<(u64, u64, u64)>,
    pushed: u64,
    written: u64,
    delivered: usize,
    fail: Option<(Command, u32)>,
}

impl SimRxCard {
    fn new(signal: SimSignal, gates: Receiver<TxGate>) -> Self {
        Self {
            regs: HashMap::new(),
            signal,
            gates,
            data: None,
            timestamps: None,
            notify_size: PAGE_SIZE,
            running: false,
            dma: false,
            extra_dma: false,
            data_pos: 0,
            data_len: 0,
            ts_pos: 0,
            ts_len: 0,
            pending: VecDeque::new(),
            pending_ts: VecDeque::new(),
            pushed: 0,
            written: 0,
            delivered: 0,
            fail: None,
        }
    }

    /// Make every command batch containing `command` return `code`
    pub fn fail_on(&mut self, command: Command, code: u32) -> &mut Self {
        self.fail = Some((command, code));
        self
    }

    fn reg(&self, reg: Register) -> i64 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn reset_data(&mut self) {
        self.data_pos = 0;
        self.data_len = 0;
        self.pending.clear();
        self.pushed = 0;
        self.written = 0;
    }

    fn reset_timestamps(&mut self) {
        self.ts_pos = 0;
        self.ts_len = 0;
        self.pending_ts.clear();
    }

    /// Synthesize the record of one gate window
    fn trigger(&mut self, gate: TxGate) {
        if !(self.running && self.dma) {
            return;
        }
        if self
            .signal
            .deliver_limit
            .map_or(false, |limit| self.delivered >= limit)
        {
            return;
        }
        let rate = self.reg(Register::SampleRate) as f64;
        let ratio = rate / gate.rate;
        let start = (gate.start as f64 * ratio).round() as u64;
        let len = (gate.len as f64 * ratio).round() as u64;
        let pre = self.reg(Register::PreTrigger) as u64;
        let post = self.reg(Register::PostTrigger) as u64;
        let channels = popcount(&self.regs).max(1) as usize;
        let frames = (len + pre + post) as usize;
        for i in 0..frames {
            for ch in 0..channels {
                let s = self.signal.sample(ch, self.delivered, start, i, pre, rate);
                self.pending.push_back(s);
            }
        }
        self.pushed += (frames * channels * 2) as u64;
        self.pending_ts.push_back((start, start + len, self.pushed));
        self.delivered += 1;
    }

    /// Move pending samples and finished timestamp pairs into the rings
    fn transfer(&mut self) {
        if let Some(buffer) = self.data.as_mut() {
            let size = buffer.len_bytes();
            let samples = buffer.samples_mut();
            while self.data_len < size {
                let Some(s) = self.pending.pop_front() else { break };
                samples[((self.data_pos + self.data_len) % size) / 2] = s;
                self.data_len += 2;
                self.written += 2;
            }
        }
        if let Some(buffer) = self.timestamps.as_mut() {
            let size = buffer.len_bytes();
            let words = buffer.words_mut();
            while let Some(&(start, end, ready)) = self.pending_ts.front() {
                if ready > self.written || self.ts_len + TIMESTAMP_PAIR_BYTES > size {
                    break;
                }
                let at = ((self.ts_pos + self.ts_len) % size) / 8;
                words[at] = start;
                words[at + 1] = 0;
                words[at + 2] = end;
                words[at + 3] = 0;
                self.ts_len += TIMESTAMP_PAIR_BYTES;
                self.pending_ts.pop_front();
            }
        }
    }

    fn block_ready(&self) -> bool {
        self.data_len >= self.notify_size
            || self.ts_len >= TIMESTAMP_PAIR_BYTES
            || (self.data_len > 0 && self.pending.is_empty())
    }

    fn wait_dma(&mut self) -> u32 {
        if !self.dma {
            return ERR_SEQUENCE;
        }
        let timeout = match self.reg(Register::Timeout) {
            0 => 5000,
            ms => ms as u64,
        };
        let deadline = Instant::now() + Duration::from_millis(timeout);
        loop {
            while let Ok(gate) = self.gates.try_recv() {
                self.trigger(gate);
            }
            self.transfer();
            if self.block_ready() {
                return ERR_OK;
            }
            let now = Instant::now();
            if now >= deadline {
                return ERR_TIMEOUT;
            }
            match self.gates.recv_timeout(deadline - now) {
                Ok(gate) => self.trigger(gate),
                Err(RecvTimeoutError::Timeout) => return ERR_TIMEOUT,
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(deadline - now);
                    return ERR_TIMEOUT;
                }
            }
        }
    }

    fn release(avail: &mut usize, pos: &mut usize, size: usize, value: i64) -> u32 {
        match usize::try_from(value) {
            Ok(n) if n <= *avail && size > 0 => {
                *pos = (*pos + n) % size;
                *avail -= n;
                ERR_OK
            }
            _ => ERR_VALUE,
        }
    }
}

impl HardwareChannel for SimRxCard {
    fn set_param(&mut self, reg: Register, value: i64) -> u32 {
        match reg {
            Register::CardType
            | Register::ChannelCount
            | Register::Status
            | Register::DataAvailUserLen
            | Register::DataAvailUserPos
            | Register::TsAvailUserLen
            | Register::TsAvailUserPos => ERR_REGISTER,
            Register::DataAvailCardLen => {
                let size = self.data.as_ref().map_or(0, DmaBuffer::len_bytes);
                Self::release(&mut self.data_len, &mut self.data_pos, size, value)
            }
            Register::TsAvailCardLen => {
                let size = self.timestamps.as_ref().map_or(0, DmaBuffer::len_bytes);
                Self::release(&mut self.ts_len, &mut self.ts_pos, size, value)
            }
            Register::SampleRate => {
                let actual = value as f64 * (1.0 - self.signal.sample_rate_error_ppm * 1e-6);
                self.regs.insert(reg, actual.round() as i64);
                ERR_OK
            }
            _ => {
                self.regs.insert(reg, value);
                ERR_OK
            }
        }
    }

    fn get_param(&mut self, reg: Register) -> std::result::Result<i64, u32> {
        Ok(match reg {
            Register::CardType => RX_CARD_TYPE,
            Register::ChannelCount => popcount(&self.regs),
            Register::Status => self.status() as i64,
            Register::DataAvailUserLen => self.data_len as i64,
            Register::DataAvailUserPos => self.data_pos as i64,
            Register::TsAvailUserLen => self.ts_len as i64,
            Register::TsAvailUserPos => self.ts_pos as i64,
            _ => self.reg(reg),
        })
    }

    fn define_transfer(
        &mut self,
        kind: BufferKind,
        direction: Direction,
        notify_size: usize,
        buffer: DmaBuffer,
    ) -> u32 {
        if direction != Direction::CardToHost || notify_size > buffer.len_bytes() {
            return ERR_BUFFER;
        }
        match kind {
            BufferKind::SampleData => {
                self.notify_size = notify_size;
                self.data = Some(buffer);
                self.reset_data();
            }
            BufferKind::Timestamp => {
                self.timestamps = Some(buffer);
                self.reset_timestamps();
            }
        }
        ERR_OK
    }

    fn transfer_buffer(&self, kind: BufferKind) -> Option<&DmaBuffer> {
        match kind {
            BufferKind::SampleData => self.data.as_ref(),
            BufferKind::Timestamp => self.timestamps.as_ref(),
        }
    }

    fn release_transfer(&mut self, kind: BufferKind) -> Option<DmaBuffer> {
        match kind {
            BufferKind::SampleData => {
                self.dma = false;
                self.reset_data();
                self.data.take()
            }
            BufferKind::Timestamp => {
                self.extra_dma = false;
                self.reset_timestamps();
                self.timestamps.take()
            }
        }
    }

    fn command(&mut self, commands: &[Command]) -> u32 {
        if let Some(code) = failure(&self.fail, commands) {
            return code;
        }
        for cmd in commands {
            let code = match cmd {
                Command::Reset => {
                    self.regs.clear();
                    self.running = false;
                    self.dma = false;
                    self.extra_dma = false;
                    self.reset_data();
                    self.reset_timestamps();
                    ERR_OK
                }
                Command::Start => {
                    self.running = true;
                    self.delivered = 0;
                    // Gates opened before the card was armed are lost
                    while self.gates.try_recv().is_ok() {}
                    ERR_OK
                }
                Command::StartDma if self.data.is_none() => ERR_SEQUENCE,
                Command::StartDma => {
                    self.dma = true;
                    self.extra_dma = self.timestamps.is_some();
                    ERR_OK
                }
                Command::WaitDma => self.wait_dma(),
                Command::Stop => {
                    self.running = false;
                    ERR_OK
                }
                Command::StopDma => {
                    self.dma = false;
                    self.reset_data();
                    ERR_OK
                }
                Command::ExtraStopDma => {
                    self.extra_dma = false;
                    self.reset_timestamps();
                    ERR_OK
                }
                Command::EnableTrigger | Command::ExtraPoll => ERR_OK,
            };
            if code != ERR_OK {
                return code;
            }
        }
        ERR_OK
    }

    fn status(&mut self) -> u32 {
        let mut status = 0;
        if self.running {
            status |= STATUS_TRIGGER;
        } else {
            status |= STATUS_READY;
        }
        if self.dma {
            status |= STATUS_DATA_TRANSFER;
        }
        if self.extra_dma {
            status |= STATUS_EXTRA_TRANSFER;
        }
        if self.data_len >= self.notify_size {
            status |= STATUS_DATA_BLOCKREADY;
        }
        if self.ts_len >= TIMESTAMP_PAIR_BYTES {
            status |= STATUS_EXTRA_BLOCKREADY;
        }
        status
    }
}

/// Tx configuration matching the simulated card: four channels, gate on channel 0
pub fn tx_config(sample_rate_mhz: u32) -> TxConfig {
    TxConfig {
        path: "sim-tx".into(),
        channel_enable: vec![0, 1, 2, 3],
        max_amplitude: vec![200, 6000, 6000, 6000],
        filter_type: vec![0, 2, 2, 2],
        sample_rate: sample_rate_mhz,
        notify_size: 128 * PAGE_SIZE,
    }
}

/// Waveform with `gates` adc gates of `gate_samples` frames, separated by `spacing` idle frames
pub fn gate_train(
    gates: usize,
    gate_samples: usize,
    spacing: usize,
    channels: usize,
    sample_rate_hz: f64,
) -> Result<UnrolledSequence> {
    let frames = spacing + gates * (gate_samples + spacing);
    let mut seq = vec![0i16; frames * channels.max(1)];
    for g in 0..gates {
        let start = spacing + g * (gate_samples + spacing);
        for f in start..start + gate_samples {
            seq[f * channels] = encode_gate_sample(0, true);
        }
    }
    UnrolledSequence::new(seq, channels, sample_rate_hz, 0.0)
}

/// Sequence provider producing a gate train with an excitation pulse ahead of every gate
pub struct GateTrainProvider {
    config: SimConfig,
    channels: usize,
    sample_rate_hz: f64,
    max_amplitude: Vec<u32>,
    loaded: Option<PathBuf>,
}

impl GateTrainProvider {
    pub fn new(config: SimConfig, tx: &TxConfig) -> Self {
        Self {
            config,
            channels: tx.channel_enable.len(),
            sample_rate_hz: tx.sample_rate as f64 * 1e6,
            max_amplitude: tx.max_amplitude.clone(),
            loaded: None,
        }
    }
}

impl SequenceProvider for GateTrainProvider {
    fn read(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(Error::InvalidInput(format!(
                "sequence file {} not found",
                path.display()
            )));
        }
        self.loaded = Some(path.to_path_buf());
        Ok(())
    }

    fn unroll(&mut self, parameter: &AcquisitionParameter) -> Result<UnrolledSequence> {
        if self.loaded.is_none() {
            return Err(Error::InvalidInput("no sequence loaded".into()));
        }
        let mut unrolled = gate_train(
            self.config.gates,
            self.config.gate_samples,
            self.config.gate_spacing,
            self.channels,
            self.sample_rate_hz,
        )?;
        unrolled.larmor_frequency = parameter.larmor_frequency;
        let channels = self.channels;
        let rf_len = self.config.gate_spacing / 4;
        let rf_amp = parameter.b1_scaling * i16::MAX as f64 * 0.5;
        let readout = (parameter.fov_scaling * 0.25 * i16::MAX as f64)
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        let windows = unrolled.gate_windows();
        for w in &windows {
            // Excitation just before the gate opens
            let rf_start = w.start.saturating_sub(rf_len);
            for f in rf_start..w.start {
                let phase = 2.0 * PI * parameter.larmor_frequency * f as f64 / self.sample_rate_hz;
                let analog = (rf_amp * phase.sin()).clamp(i16::MIN as f64, i16::MAX as f64);
                unrolled.seq[f * channels] = encode_gate_sample(analog as i16, false);
            }
            // Readout gradient while the gate is open
            if channels > 1 {
                for f in w.start..w.start + w.len {
                    unrolled.seq[f * channels + 1] = readout;
                }
            }
        }
        debug!(
            gates = windows.len(),
            max_amplitude = ?self.max_amplitude,
            "Unrolled gate train"
        );
        Ok(unrolled)
    }

    fn set_max_amplitude(&mut self, per_channel: &[u32]) {
        self.max_amplitude = per_channel.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_ring_accounting() {
        let (mut tx, mut rx) = instrument(SimSignal::default());
        rx.set_param(Register::ChannelEnable, 0b11);
        rx.set_param(Register::SampleRate, 10_000_000);
        rx.set_param(Register::Timeout, 50);
        let data = DmaBuffer::allocate(PAGE_SIZE).unwrap();
        let ts = DmaBuffer::allocate(PAGE_SIZE).unwrap();
        assert_eq!(
            rx.define_transfer(BufferKind::SampleData, Direction::CardToHost, 1024, data),
            ERR_OK
        );
        assert_eq!(
            rx.define_transfer(BufferKind::Timestamp, Direction::CardToHost, 1024, ts),
            ERR_OK
        );
        assert_eq!(
            rx.command(&[Command::Start, Command::EnableTrigger, Command::StartDma]),
            ERR_OK
        );

        tx.set_param(Register::ChannelEnable, 0b1111);
        tx.set_param(Register::SampleRate, 10_000_000);
        let seq = gate_train(1, 100, 10, 4, 10e6).unwrap();
        let buf = DmaBuffer::from_samples(&seq.seq).unwrap();
        tx.set_param(Register::MemorySize, seq.frames() as i64);
        tx.define_transfer(BufferKind::SampleData, Direction::HostToCard, 0, buf);
        assert_eq!(tx.command(&[Command::StartDma, Command::Start]), ERR_OK);

        assert_eq!(rx.command(&[Command::WaitDma]), ERR_OK);
        // 100 frames, no pre/post trigger, two channels of i16
        assert_eq!(rx.get_param(Register::DataAvailUserLen), Ok(400));
        assert_eq!(rx.get_param(Register::TsAvailUserLen), Ok(32));
        let words = rx.transfer_buffer(BufferKind::Timestamp).unwrap().words();
        assert_eq!((words[0], words[2]), (10, 110));

        assert_eq!(rx.set_param(Register::DataAvailCardLen, 500), ERR_VALUE);
        assert_eq!(rx.set_param(Register::DataAvailCardLen, 400), ERR_OK);
        assert_eq!(rx.get_param(Register::DataAvailUserPos), Ok(400));
        assert_eq!(rx.get_param(Register::DataAvailUserLen), Ok(0));

        // Nothing more to come
        assert_eq!(rx.set_param(Register::TsAvailCardLen, 32), ERR_OK);
        assert_eq!(rx.command(&[Command::WaitDma]), ERR_TIMEOUT);
    }

    #[test]
    fn delivery_limit_drops_late_gates() {
        let signal = SimSignal {
            deliver_limit: Some(1),
            ..Default::default()
        };
        let (link, gates) = unbounded();
        let mut rx = SimRxCard::new(signal, gates);
        rx.set_param(Register::ChannelEnable, 0b11);
        rx.set_param(Register::SampleRate, 1_000_000);
        rx.define_transfer(
            BufferKind::SampleData,
            Direction::CardToHost,
            PAGE_SIZE,
            DmaBuffer::allocate(PAGE_SIZE).unwrap(),
        );
        rx.command(&[Command::Start, Command::StartDma]);
        for start in [0, 100] {
            link.send(TxGate {
                start,
                len: 10,
                rate: 1e6,
            })
            .unwrap();
        }
        while let Ok(gate) = rx.gates.try_recv() {
            rx.trigger(gate);
        }
        assert_eq!(rx.delivered, 1);
        assert_eq!(rx.pending.len(), 20);
    }

    #[test]
    fn sample_rate_error_is_applied() {
        let signal = SimSignal {
            sample_rate_error_ppm: 200.0,
            ..Default::default()
        };
        let (_tx, mut rx) = instrument(signal);
        rx.set_param(Register::SampleRate, 10_000_000);
        assert_eq!(rx.get_param(Register::SampleRate), Ok(9_998_000));
    }

    #[test]
    fn provider_requires_existing_file() {
        let mut provider = GateTrainProvider::new(SimConfig::default(), &tx_config(10));
        assert!(matches!(
            provider.read(Path::new("/nonexistent/sequence.seq")),
            Err(Error::InvalidInput(_))
        ));
        assert!(provider.unroll(&AcquisitionParameter::default()).is_err());
    }

    #[test]
    fn provider_keeps_gate_count() {
        let file = tempfile::Builder::new().suffix(".seq").tempfile().unwrap();
        let config = SimConfig {
            gates: 3,
            gate_samples: 200,
            gate_spacing: 400,
            ..Default::default()
        };
        let mut provider = GateTrainProvider::new(config, &tx_config(10));
        provider.read(file.path()).unwrap();
        let unrolled = provider.unroll(&AcquisitionParameter::default()).unwrap();
        assert_eq!(unrolled.adc_count, 3);
        assert_eq!(unrolled.channels, 4);
        assert_eq!(unrolled.frames(), 400 + 3 * 600);
    }
}
