pub mod acquisition;
pub mod args;
pub mod card;
pub mod config;
pub mod ddc;
pub mod error;
pub mod hardware;
pub mod params;
pub mod result;
pub mod rx;
pub mod sequence;
pub mod sim;
pub mod tx;

pub use acquisition::{AcquisitionControl, AverageOutcome, RunSummary, State};
pub use config::{Config, PartialAverages};
pub use error::{Error, Result, Warning};
pub use params::AcquisitionParameter;
pub use result::{AcquisitionResult, ComplexCube};
pub use rx::GateRecord;
pub use sequence::{SequenceProvider, UnrolledSequence};
