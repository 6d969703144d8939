//! Scoped handle to one measurement card.
//!
//! A [`Card`] is acquired at connect and owns its [`HardwareChannel`] until it
//! is dropped, at which point the card is stopped, both DMA channels drained and
//! the device handle closed. This holds on every exit path, including unwinding
//! out of the stream thread.

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    hardware::{
        BufferKind, Command, Direction, DmaBuffer, HardwareChannel, Register, Status, ERR_OK,
    },
};

pub struct Card {
    name: String,
    hw: Box<dyn HardwareChannel>,
}

impl Card {
    /// Reset the card and take ownership of its channel
    pub fn connect(name: impl Into<String>, hw: Box<dyn HardwareChannel>) -> Result<Self> {
        let mut card = Self {
            name: name.into(),
            hw,
        };
        card.command(&[Command::Reset], "reset")?;
        let card_type = card.get(Register::CardType)?;
        info!(card = %card.name, card_type = format!("0x{card_type:x}"), "Connected");
        Ok(card)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, reg: Register, value: i64) -> Result<()> {
        match self.hw.set_param(reg, value) {
            ERR_OK => Ok(()),
            code => Err(Error::hardware(code, format!("{} set {reg:?}", self.name))),
        }
    }

    pub fn get(&mut self, reg: Register) -> Result<i64> {
        self.hw
            .get_param(reg)
            .map_err(|code| Error::hardware(code, format!("{} get {reg:?}", self.name)))
    }

    pub fn command(&mut self, commands: &[Command], context: &str) -> Result<()> {
        match self.hw.command(commands) {
            ERR_OK => Ok(()),
            code => Err(Error::hardware(code, format!("{} {context}", self.name))),
        }
    }

    /// Lend `buffer` to the card. A rejected definition is a resource failure.
    pub fn define_transfer(
        &mut self,
        kind: BufferKind,
        direction: Direction,
        notify_size: usize,
        buffer: DmaBuffer,
    ) -> Result<()> {
        let size = buffer.len_bytes();
        match self.hw.define_transfer(kind, direction, notify_size, buffer) {
            ERR_OK => {
                debug!(card = %self.name, ?kind, size, notify_size, "Defined dma transfer");
                Ok(())
            }
            code => Err(Error::Resource(format!(
                "{} rejected {kind:?} transfer of {size} bytes (code 0x{code:04x})",
                self.name
            ))),
        }
    }

    pub fn buffer(&self, kind: BufferKind) -> Option<&DmaBuffer> {
        self.hw.transfer_buffer(kind)
    }

    pub fn release(&mut self, kind: BufferKind) -> Option<DmaBuffer> {
        self.hw.release_transfer(kind)
    }

    pub fn status(&mut self) -> Status {
        Status(self.hw.status())
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card").field("name", &self.name).finish()
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        let code = self
            .hw
            .command(&[Command::Stop, Command::StopDma, Command::ExtraStopDma]);
        if code != ERR_OK {
            warn!(card = %self.name, code, "Stop on disconnect failed");
        }
        self.hw.release_transfer(BufferKind::SampleData);
        self.hw.release_transfer(BufferKind::Timestamp);
        self.hw.close();
        info!(card = %self.name, "Disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::{ERR_ABORT, ERR_REGISTER, PAGE_SIZE},
        sim::{self, SimSignal},
    };

    #[test]
    fn codes_become_hardware_errors() {
        let (tx_hw, _rx_hw) = sim::instrument(SimSignal::default());
        let mut card = Card::connect("tx0", Box::new(tx_hw)).unwrap();
        assert!(matches!(
            card.set(Register::Status, 1),
            Err(Error::HardwareCommand {
                code: ERR_REGISTER,
                ..
            })
        ));
        card.set(Register::SampleRate, 10).unwrap();
        assert_eq!(card.get(Register::SampleRate).unwrap(), 10);
    }

    #[test]
    fn failed_command_keeps_context() {
        let (_tx_hw, mut rx_hw) = sim::instrument(SimSignal::default());
        rx_hw.fail_on(Command::Start, ERR_ABORT);
        let mut card = Card::connect("rx0", Box::new(rx_hw)).unwrap();
        let err = card.command(&[Command::Start], "start").unwrap_err();
        assert!(err.to_string().contains("rx0 start"));
        assert!(err.to_string().contains("0x0303"));
    }

    #[test]
    fn rejected_transfer_is_a_resource_error() {
        let (tx_hw, _rx_hw) = sim::instrument(SimSignal::default());
        let mut card = Card::connect("tx0", Box::new(tx_hw)).unwrap();
        let buffer = DmaBuffer::allocate(PAGE_SIZE).unwrap();
        assert!(matches!(
            card.define_transfer(BufferKind::Timestamp, Direction::CardToHost, 0, buffer),
            Err(Error::Resource(_))
        ));
        let buffer = DmaBuffer::allocate(PAGE_SIZE).unwrap();
        card.define_transfer(BufferKind::SampleData, Direction::HostToCard, 0, buffer)
            .unwrap();
        assert!(card.buffer(BufferKind::SampleData).is_some());
        assert_eq!(card.release(BufferKind::SampleData).unwrap().len_bytes(), PAGE_SIZE);
        assert!(card.buffer(BufferKind::SampleData).is_none());
    }
}
