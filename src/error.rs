//! Our error types for the power supply session.

use strum_macros::Display;
use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Failures of a single Modbus transaction.
#[derive(Error, Debug)]
pub enum CommunicationError<I: embedded_io::Error> {
    #[error("Serial communication error")]
    Serial(I),
    #[error("Communication timeout")]
    Timeout,
    #[error("Response checksum mismatch")]
    Checksum,
    #[error("Malformed response: {0}")]
    Framing(rmodbus::ErrorKind),
    /// The slave answered with an exception response.
    #[error("Device rejected the request with exception code {code:#04x}")]
    Exception { code: u8 },
}

impl<I: embedded_io::Error> CommunicationError<I> {
    /// True when nothing usable came back from the device, as opposed to the
    /// device answering with something we could not accept.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Serial(_) | Self::Timeout)
    }
}

/// Invalid parameters supplied by the caller or by a configuration source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Slave address {0} is outside 1-247")]
    InvalidSlaveAddress(u16),
    #[error("Stage duration must be positive")]
    NonPositiveDuration,
    #[error("Voltage {0} is not a valid setpoint")]
    InvalidVoltage(f64),
    #[error("Sample period must be positive")]
    ZeroSamplePeriod,
    #[error("Chunk length must be positive")]
    ZeroChunkLength,
    #[error("Stage plan is empty")]
    EmptyPlan,
    #[error("Could not parse {field} from {input:?}")]
    InvalidInput { field: &'static str, input: String },
}

/// Custom error type for power supply control.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("{0}")]
    Communication(CommunicationError<I>),
    /// The write went through but reading the register back gave a different value.
    #[error("Register {address:#06x} read back {actual} after writing {expected}")]
    VerificationFailed {
        address: u16,
        expected: u32,
        actual: u32,
    },
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Cancelled")]
    Cancelled,
    #[error("Value {value} cannot be encoded in the target register")]
    InvalidRange { value: f64 },
    #[error("Output did not settle at {target} V (last reading {last} V)")]
    NotSettled { target: f64, last: f64 },
    #[error("Record sink rejected a sample: {0}")]
    Sink(Box<dyn std::error::Error + Send + Sync>),
}

impl<I: embedded_io::Error> From<CommunicationError<I>> for Error<I> {
    fn from(err: CommunicationError<I>) -> Self {
        Error::Communication(err)
    }
}

impl<I: embedded_io::Error> Error<I> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Communication(_) => ErrorKind::Communication,
            Error::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidRange { .. } => ErrorKind::InvalidRange,
            Error::NotSettled { .. } => ErrorKind::NotSettled,
            Error::Sink(_) => ErrorKind::Sink,
        }
    }
}

/// Flat classification of [`Error`] for reporting.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Communication,
    VerificationFailed,
    Configuration,
    Cancelled,
    InvalidRange,
    NotSettled,
    Sink,
}

/// The step of a session that was executing when an error surfaced.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    #[strum(to_string = "validate stage plan")]
    ValidatePlan,
    #[strum(to_string = "enable output")]
    EnableOutput,
    #[strum(to_string = "read voltage")]
    ReadVoltage,
    #[strum(to_string = "read current")]
    ReadCurrent,
    #[strum(to_string = "read power")]
    ReadPower,
    #[strum(to_string = "set target voltage")]
    SetTargetVoltage,
    #[strum(to_string = "append sample")]
    AppendSample,
    #[strum(to_string = "chunk boundary")]
    ChunkBoundary,
}

/// An [`Error`] tagged with the [`Operation`] that produced it.
#[derive(Error, Debug)]
#[error("{operation} failed: {error}")]
pub struct OperationError<I: embedded_io::Error> {
    pub operation: Operation,
    pub error: Error<I>,
}

impl<I: embedded_io::Error> OperationError<I> {
    pub fn new(operation: Operation, error: impl Into<Error<I>>) -> Self {
        Self {
            operation,
            error: error.into(),
        }
    }
}

/// Extension used to tag fallible calls with the operation being attempted.
pub(crate) trait OperationContext<T, I: embedded_io::Error> {
    fn during(self, operation: Operation) -> core::result::Result<T, OperationError<I>>;
}

impl<T, I: embedded_io::Error> OperationContext<T, I> for Result<T, I> {
    fn during(self, operation: Operation) -> core::result::Result<T, OperationError<I>> {
        self.map_err(|error| OperationError { operation, error })
    }
}
