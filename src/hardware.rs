//! The register-level contract both card drivers are written against.
//!
//! The vendor binding lives outside this crate. Anything that can set and read
//! registers, accept DMA transfer definitions and execute card commands can sit
//! behind [`HardwareChannel`]; the simulated pair in [`crate::sim`] is one such
//! implementation.

use byte_slice_cast::{AsByteSlice, AsMutByteSlice, AsMutSliceOf, AsSliceOf};

use crate::error::{Error, Result};

/// DMA buffers are registered in page granularity
pub const PAGE_SIZE: usize = 4096;
/// One hardware timestamp is 128 bits: counter word followed by an extra word
pub const TIMESTAMP_BYTES: usize = 16;
/// Each gate is bracketed by a start and an end timestamp
pub const TIMESTAMP_PAIR_BYTES: usize = 2 * TIMESTAMP_BYTES;

// Return codes
pub const ERR_OK: u32 = 0x0000;
pub const ERR_REGISTER: u32 = 0x0101;
pub const ERR_VALUE: u32 = 0x0102;
pub const ERR_SEQUENCE: u32 = 0x0104;
pub const ERR_TIMEOUT: u32 = 0x0107;
pub const ERR_BUFFER: u32 = 0x010c;
pub const ERR_OVERRUN: u32 = 0x0301;
pub const ERR_ABORT: u32 = 0x0303;

// Channel enable mask
pub const CHANNEL0: i64 = 1;
pub const CHANNEL1: i64 = 1 << 1;
pub const CHANNEL2: i64 = 1 << 2;
pub const CHANNEL3: i64 = 1 << 3;

// Register values
pub const CARD_MODE_REC_FIFO_GATE: i64 = 0x2000;
pub const CARD_MODE_REP_STD_SINGLE: i64 = 0x0100;
pub const CLOCK_MODE_INTPLL: i64 = 1;
pub const TS_MODE_STARTRESET: i64 = 0x0004;
pub const TS_COUNT_INTERNAL: i64 = 0x1000;
pub const TRIGGER_MODE_POS: i64 = 1;
pub const TRIGGER_MASK_EXT1: i64 = 1 << 2;

// Status bits
pub const STATUS_PRETRIGGER: u32 = 0x0001;
pub const STATUS_TRIGGER: u32 = 0x0002;
pub const STATUS_READY: u32 = 0x0004;
pub const STATUS_DATA_BLOCKREADY: u32 = 0x0100;
pub const STATUS_DATA_END: u32 = 0x0200;
pub const STATUS_DATA_OVERRUN: u32 = 0x0400;
pub const STATUS_DATA_ERROR: u32 = 0x0800;
pub const STATUS_EXTRA_BLOCKREADY: u32 = 0x1000;
pub const STATUS_EXTRA_END: u32 = 0x2000;
pub const STATUS_EXTRA_OVERRUN: u32 = 0x4000;
pub const STATUS_EXTRA_ERROR: u32 = 0x8000;
pub const STATUS_DATA_TRANSFER: u32 = 0x1_0000;
pub const STATUS_EXTRA_TRANSFER: u32 = 0x2_0000;

const STATUS_TABLE: [(u32, &str, &str); 13] = [
    (STATUS_PRETRIGGER, "PRETRIGGER", "Acquisition pre-trigger filled"),
    (STATUS_TRIGGER, "TRIGGER", "A trigger event has been detected"),
    (STATUS_READY, "READY", "Card finished its run and is ready"),
    (STATUS_DATA_BLOCKREADY, "DATA_BLOCKREADY", "Next data block is available"),
    (STATUS_DATA_END, "DATA_END", "Data transfer has completed"),
    (STATUS_DATA_OVERRUN, "DATA_OVERRUN", "Data buffer overrun in FIFO mode"),
    (STATUS_DATA_ERROR, "DATA_ERROR", "Internal error during data transfer"),
    (STATUS_EXTRA_BLOCKREADY, "EXTRA_BLOCKREADY", "Next timestamp block is available"),
    (STATUS_EXTRA_END, "EXTRA_END", "Timestamp transfer has completed"),
    (STATUS_EXTRA_OVERRUN, "EXTRA_OVERRUN", "Timestamp buffer overrun"),
    (STATUS_EXTRA_ERROR, "EXTRA_ERROR", "Internal error during timestamp transfer"),
    (STATUS_DATA_TRANSFER, "DATA_TRANSFER", "Data DMA transfer is running"),
    (STATUS_EXTRA_TRANSFER, "EXTRA_TRANSFER", "Timestamp DMA transfer is running"),
];

/// Card registers addressed through [`HardwareChannel::set_param`] and [`HardwareChannel::get_param`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    CardType,
    ChannelEnable,
    ChannelCount,
    /// 50 Ohm input termination of one channel
    Termination(u8),
    /// Input range (rx) or output amplitude (tx) of one channel in mV
    Amplitude(u8),
    /// Output filter of one tx channel
    Filter(u8),
    OutputEnable(u8),
    DigitalBwFilter,
    SampleRate,
    MemorySize,
    PreTrigger,
    PostTrigger,
    Loops,
    ClockMode,
    Timeout,
    CardMode,
    TimestampCmd,
    TriggerExt1Mode,
    TriggerOrMask,
    Status,
    DataAvailUserLen,
    DataAvailUserPos,
    DataAvailCardLen,
    TsAvailUserLen,
    TsAvailUserPos,
    TsAvailCardLen,
}

/// Card commands. Several commands can be issued in one call and are executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Reset,
    Start,
    EnableTrigger,
    StartDma,
    WaitDma,
    Stop,
    StopDma,
    ExtraStopDma,
    ExtraPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    SampleData,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CardToHost,
    HostToCard,
}

/// A page-granular DMA region.
///
/// Storage is word aligned so the same bytes can be viewed as 16-bit samples or
/// 64-bit timestamp words without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBuffer {
    words: Vec<u64>,
}

impl DmaBuffer {
    pub fn allocate(bytes: usize) -> Result<Self> {
        if bytes == 0 || bytes % PAGE_SIZE != 0 {
            return Err(Error::Resource(format!(
                "dma buffer of {bytes} bytes is not a non-zero multiple of {PAGE_SIZE}"
            )));
        }
        let len = bytes / std::mem::size_of::<u64>();
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|e| Error::Resource(format!("dma buffer of {bytes} bytes: {e}")))?;
        words.resize(len, 0);
        Ok(Self { words })
    }

    /// Page aligned copy of `samples`, zero padded
    pub fn from_samples(samples: &[i16]) -> Result<Self> {
        let bytes = samples.len() * std::mem::size_of::<i16>();
        let padded = bytes.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let mut buffer = Self::allocate(padded)?;
        buffer.as_bytes_mut()[..bytes].copy_from_slice(samples.as_byte_slice());
        Ok(buffer)
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.words.as_byte_slice()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.words.as_mut_byte_slice()
    }

    /// Typed view of the region as interleaved 16-bit samples
    pub fn samples(&self) -> &[i16] {
        // u64 storage is always aligned and sized for an i16 view
        self.as_bytes()
            .as_slice_of::<i16>()
            .unwrap_or_default()
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        self.as_bytes_mut()
            .as_mut_slice_of::<i16>()
            .unwrap_or_default()
    }

    /// Typed view of the region as 64-bit timestamp words
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }
}

/// Decoded card status register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(pub u32);

impl Status {
    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    /// Whether either DMA channel is still moving data
    pub fn transfer_active(&self) -> bool {
        self.0 & (STATUS_DATA_TRANSFER | STATUS_EXTRA_TRANSFER) != 0
    }

    /// Names of all set bits, lowest first
    pub fn flags(&self) -> Vec<&'static str> {
        STATUS_TABLE
            .iter()
            .filter(|(bit, _, _)| self.contains(*bit))
            .map(|(_, name, _)| *name)
            .collect()
    }
}

/// Human readable status lines, optionally with their description
pub fn translate_status(code: u32, include_desc: bool) -> Vec<String> {
    STATUS_TABLE
        .iter()
        .filter(|(bit, _, _)| code & bit == *bit)
        .map(|(bit, name, desc)| {
            if include_desc {
                format!("0x{bit:05x} {name}: {desc}")
            } else {
                format!("0x{bit:05x} {name}")
            }
        })
        .collect()
}

/// Register access, DMA transfer definition and command execution for one card.
///
/// Every call returns the vendor-style code, [`ERR_OK`] on success. Buffers
/// handed to [`define_transfer`](HardwareChannel::define_transfer) are lent to
/// the card until [`release_transfer`](HardwareChannel::release_transfer); the
/// card writes into them (card to host) or reads from them (host to card).
pub trait HardwareChannel: Send {
    fn set_param(&mut self, reg: Register, value: i64) -> u32;

    fn get_param(&mut self, reg: Register) -> std::result::Result<i64, u32>;

    fn define_transfer(
        &mut self,
        kind: BufferKind,
        direction: Direction,
        notify_size: usize,
        buffer: DmaBuffer,
    ) -> u32;

    fn transfer_buffer(&self, kind: BufferKind) -> Option<&DmaBuffer>;

    fn release_transfer(&mut self, kind: BufferKind) -> Option<DmaBuffer>;

    fn command(&mut self, commands: &[Command]) -> u32;

    /// Raw status register, for diagnostics only
    fn status(&mut self) -> u32 {
        self.get_param(Register::Status).unwrap_or(0) as u32
    }

    /// Close the underlying device handle
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_requires_page_multiple() {
        assert!(matches!(DmaBuffer::allocate(0), Err(Error::Resource(_))));
        assert!(matches!(DmaBuffer::allocate(4000), Err(Error::Resource(_))));
        let buf = DmaBuffer::allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(buf.len_bytes(), 8192);
        assert_eq!(buf.samples().len(), 4096);
        assert_eq!(buf.words().len(), 1024);
    }

    #[test]
    fn typed_views_share_storage() {
        let mut buf = DmaBuffer::allocate(PAGE_SIZE).unwrap();
        buf.samples_mut()[0] = -2;
        buf.samples_mut()[1] = 7;
        assert_eq!(&buf.as_bytes()[..2], &(-2i16).to_ne_bytes());
        assert_eq!(buf.samples()[1], 7);
    }

    #[test]
    fn from_samples_pads_to_page() {
        let samples: Vec<i16> = (0..3000).map(|i| i as i16).collect();
        let buf = DmaBuffer::from_samples(&samples).unwrap();
        assert_eq!(buf.len_bytes(), 2 * PAGE_SIZE);
        assert_eq!(&buf.samples()[..3000], &samples[..]);
        assert!(buf.samples()[3000..].iter().all(|s| *s == 0));
    }

    #[test]
    fn status_decoding() {
        let status = Status(STATUS_READY | STATUS_DATA_TRANSFER);
        assert!(status.transfer_active());
        assert_eq!(status.flags(), vec!["READY", "DATA_TRANSFER"]);
        assert!(!Status(STATUS_READY | STATUS_DATA_END).transfer_active());
        let lines = translate_status(STATUS_TRIGGER, true);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("TRIGGER: A trigger event"));
    }
}
