//! Transmit card replaying an unrolled sequence

use tracing::{debug, info, warn};

use crate::{
    card::Card,
    config::TxConfig,
    error::{Error, Result, Warning},
    hardware::{
        BufferKind, Command, Direction, DmaBuffer, HardwareChannel, Register, Status,
        CARD_MODE_REP_STD_SINGLE, CLOCK_MODE_INTPLL,
    },
    sequence::UnrolledSequence,
};

pub struct TxCard {
    config: TxConfig,
    card: Option<Card>,
    running: bool,
}

impl TxCard {
    pub fn new(config: TxConfig) -> Self {
        Self {
            config,
            card: None,
            running: false,
        }
    }

    pub fn connect(&mut self, hw: Box<dyn HardwareChannel>) -> Result<Option<Warning>> {
        let mut card = Card::connect(format!("tx {}", self.config.path), hw)?;
        let warning = self.setup_card(&mut card)?;
        self.card = Some(card);
        Ok(warning)
    }

    fn setup_card(&self, card: &mut Card) -> Result<Option<Warning>> {
        let mask = self
            .config
            .channel_enable
            .iter()
            .fold(0i64, |mask, ch| mask | 1 << ch);
        card.set(Register::ChannelEnable, mask)?;
        for (i, ch) in self.config.channel_enable.iter().enumerate() {
            card.set(Register::OutputEnable(*ch), 1)?;
            card.set(Register::Amplitude(*ch), self.config.max_amplitude[i] as i64)?;
            if let Some(filter) = self.config.filter_type.get(i) {
                card.set(Register::Filter(*ch), *filter as i64)?;
            }
        }
        let requested = self.config.sample_rate as i64 * 1_000_000;
        card.set(Register::SampleRate, requested)?;
        let actual = card.get(Register::SampleRate)?;
        info!(rate_mhz = actual as f64 * 1e-6, "Tx sample rate");
        card.set(Register::ClockMode, CLOCK_MODE_INTPLL)?;
        card.set(Register::CardMode, CARD_MODE_REP_STD_SINGLE)?;
        card.set(Register::Loops, 1)?;
        Ok((actual != requested).then(|| {
            let warning = Warning::SampleRateMismatch {
                requested: requested as f64,
                actual: actual as f64,
            };
            warn!("Tx: {warning}");
            warning
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Upload the waveform of `sequence` and start replay
    pub fn start_operation(&mut self, sequence: &UnrolledSequence) -> Result<()> {
        let channels = self.config.channel_enable.len();
        let card = self.card.as_mut().ok_or(Error::NotReady)?;
        if sequence.channels != channels {
            return Err(Error::InvalidInput(format!(
                "sequence has {} channels, tx card has {channels} enabled",
                sequence.channels
            )));
        }
        let buffer = DmaBuffer::from_samples(&sequence.seq)?;
        card.set(Register::MemorySize, sequence.frames() as i64)?;
        card.define_transfer(
            BufferKind::SampleData,
            Direction::HostToCard,
            self.config.notify_size.min(buffer.len_bytes()),
            buffer,
        )?;
        self.running = true;
        card.command(&[Command::StartDma, Command::WaitDma], "upload")?;
        card.command(&[Command::Start, Command::EnableTrigger], "start")?;
        debug!(frames = sequence.frames(), "Tx replay started");
        Ok(())
    }

    pub fn stop_operation(&mut self) -> Result<()> {
        if !self.running {
            debug!("No active tx process found");
            return Ok(());
        }
        let card = self.card.as_mut().ok_or(Error::NotReady)?;
        self.running = false;
        let stopped = card.command(&[Command::Stop, Command::StopDma], "stop");
        card.release(BufferKind::SampleData);
        stopped
    }

    pub fn status(&mut self) -> Option<Status> {
        self.card.as_mut().map(Card::status)
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.stop_operation() {
            warn!(error = %e, "Tx stop during disconnect failed");
        }
        self.card = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, SimSignal};

    #[test]
    fn replay_lifecycle() {
        let (tx_hw, _rx_hw) = sim::instrument(SimSignal::default());
        let mut tx = TxCard::new(sim::tx_config(10));
        assert_eq!(tx.connect(Box::new(tx_hw)).unwrap(), None);
        let seq = sim::gate_train(2, 100, 100, 4, 10e6).unwrap();
        tx.start_operation(&seq).unwrap();
        assert!(tx.is_running());
        assert!(tx.status().unwrap().transfer_active());
        tx.stop_operation().unwrap();
        assert!(!tx.is_running());
        assert!(!tx.status().unwrap().transfer_active());
        // Stopping twice is harmless
        tx.stop_operation().unwrap();
    }

    #[test]
    fn channel_count_must_match() {
        let (tx_hw, _rx_hw) = sim::instrument(SimSignal::default());
        let mut tx = TxCard::new(sim::tx_config(10));
        tx.connect(Box::new(tx_hw)).unwrap();
        let seq = sim::gate_train(1, 100, 100, 2, 10e6).unwrap();
        assert!(matches!(
            tx.start_operation(&seq),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn start_requires_connection() {
        let mut tx = TxCard::new(sim::tx_config(10));
        let seq = sim::gate_train(1, 100, 100, 4, 10e6).unwrap();
        assert!(matches!(tx.start_operation(&seq), Err(Error::NotReady)));
    }
}
