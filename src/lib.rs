//! This crate drives a Modbus RTU bench power supply through a staged anodic oxidation run.
//!
//! A run is a list of stages. Each stage lasts a fixed time and either holds the present
//! voltage or ramps it linearly to a final voltage, while voltage, current and power are
//! sampled at a fixed period and appended to a record sink (CSV by default). The output is
//! switched off and the target voltage zeroed at the end of every run, whether it succeeded
//! or not.
//!
//! Register layout follows the HM310P family (Hanmatek HM305P/HM310P and rebadges):
//! * Name 0x0003, class 0x0004, decimal packing 0x0005
//! * Displayed voltage 0x0010, target voltage 0x0030
//!
//! Any transport implementing [embedded_io::Read] & [embedded_io::Write] can be used, the
//! crate never opens ports itself. The serial port used for PSU comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! ```no_run
//! # fn demo<S: embedded_io::Read + embedded_io::Write>(port: S) -> Result<(), Box<dyn std::error::Error>> {
//! use psu_anodize::{
//!     Duration, PowerSupply, SequencerConfig, StageSequencer, StageSpec, SystemClock, sink::CsvSink,
//! };
//!
//! let psu = PowerSupply::new(port, 0x01).map_err(|e| e.to_string())?;
//! let stages = vec![
//!     StageSpec::new(Duration::secs(60), Some(20.0))?,
//!     StageSpec::hold(Duration::secs(600))?,
//! ];
//! let mut sink = CsvSink::create("run.csv")?;
//! let report = StageSequencer::new(stages, SequencerConfig::new(Duration::secs(1))?)
//!     .run(&psu, &mut sink, &SystemClock::new());
//! assert!(report.teardown.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod profile;
pub mod psu;
pub mod ramp;
pub mod register;
pub mod sequencer;
pub mod sink;

#[cfg(test)]
mod mock_device;

pub use channel::RegisterChannel;
pub use clock::{Clock, Duration, ManualClock, SystemClock};
pub use config::{SequencerConfig, StageSpec};
pub use error::{CommunicationError, ConfigurationError, Error, Operation, OperationError};
pub use profile::DeviceProfile;
pub use psu::PowerSupply;
pub use ramp::RampSession;
pub use sequencer::{SequenceReport, StageSequencer};
