//! Error types shared by the card drivers, the stream engine and the orchestrator

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An acquisition was requested before both cards were connected
    #[error("measurement cards are not setup")]
    NotReady,

    /// Malformed sequence reference or acquisition parameter
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A card command or register access returned a non-zero code
    #[error("hardware command failed during {context} (code 0x{code:04x})")]
    HardwareCommand { code: u32, context: String },

    /// DMA buffer allocation or registration failed
    #[error("resource error: {0}")]
    Resource(String),

    /// A downconverted gate is shorter than the requested readout
    #[error("insufficient samples: {available} available, {requested} requested")]
    InsufficientSamples { available: usize, requested: usize },

    /// An average slice does not match the readout length of the stored result
    #[error("shape mismatch: expected {expected} samples per gate, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("acquisition interrupted")]
    Interrupted,

    #[error("rx stream worker panicked")]
    WorkerPanicked,

    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn hardware(code: u32, context: impl Into<String>) -> Self {
        Error::HardwareCommand {
            code,
            context: context.into(),
        }
    }

    /// Errors after which card state can't be trusted for the rest of a run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::NotReady | Error::InvalidInput(_) | Error::Interrupted
        )
    }
}

/// Non-fatal conditions reported next to a successful result
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// The card negotiated a different sample rate than requested (both in Hz)
    SampleRateMismatch { requested: f64, actual: f64 },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::SampleRateMismatch { requested, actual } => write!(
                f,
                "sample rate {} MHz does not match requested {} MHz",
                actual * 1e-6,
                requested * 1e-6
            ),
        }
    }
}
