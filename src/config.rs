//! Stage plan inputs and sequencer settings.

use crate::{clock::Duration, error::ConfigurationError};

/// Used when a stage is given without a duration.
pub const DEFAULT_STAGE_DURATION: Duration = Duration::secs(500);

/// One phase of the process: run for `duration`, ramping to `target_voltage`
/// if given, otherwise holding whatever voltage is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSpec {
    duration: Duration,
    target_voltage: Option<f64>,
}

impl StageSpec {
    pub fn new(duration: Duration, target_voltage: Option<f64>) -> Result<Self, ConfigurationError> {
        if duration.to_millis() == 0 {
            return Err(ConfigurationError::NonPositiveDuration);
        }
        if let Some(volts) = target_voltage
            && (!volts.is_finite() || volts < 0.0)
        {
            return Err(ConfigurationError::InvalidVoltage(volts));
        }
        Ok(Self {
            duration,
            target_voltage,
        })
    }

    /// A stage that keeps the present voltage for `duration`.
    pub fn hold(duration: Duration) -> Result<Self, ConfigurationError> {
        Self::new(duration, None)
    }

    /// Build a stage from free-form text, as typed at a prompt.
    ///
    /// An empty duration means [`DEFAULT_STAGE_DURATION`], given in whole seconds
    /// otherwise. An empty voltage means hold.
    pub fn parse(duration_input: &str, voltage_input: &str) -> Result<Self, ConfigurationError> {
        let duration = match duration_input.trim() {
            "" => DEFAULT_STAGE_DURATION,
            text => text
                .parse::<u64>()
                .map(Duration::secs)
                .map_err(|_| ConfigurationError::InvalidInput {
                    field: "duration",
                    input: duration_input.to_string(),
                })?,
        };
        let target_voltage = match voltage_input.trim() {
            "" => None,
            text => Some(text.parse::<f64>().map_err(|_| {
                ConfigurationError::InvalidInput {
                    field: "voltage",
                    input: voltage_input.to_string(),
                }
            })?),
        };
        Self::new(duration, target_voltage)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// `None` for a constant-voltage hold.
    pub fn target_voltage(&self) -> Option<f64> {
        self.target_voltage
    }
}

/// Timing settings of a stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    sample_period: Duration,
    chunk_length: Duration,
}

impl SequencerConfig {
    /// Sample every `sample_period`, one chunk per sample period.
    pub fn new(sample_period: Duration) -> Result<Self, ConfigurationError> {
        Self::with_chunk_length(sample_period, sample_period)
    }

    pub fn with_chunk_length(
        sample_period: Duration,
        chunk_length: Duration,
    ) -> Result<Self, ConfigurationError> {
        if sample_period.to_millis() == 0 {
            return Err(ConfigurationError::ZeroSamplePeriod);
        }
        if chunk_length.to_millis() == 0 {
            return Err(ConfigurationError::ZeroChunkLength);
        }
        Ok(Self {
            sample_period,
            chunk_length,
        })
    }

    pub fn sample_period(&self) -> Duration {
        self.sample_period
    }

    /// Scheduling grain: cancellation and progress happen at chunk boundaries.
    pub fn chunk_length(&self) -> Duration {
        self.chunk_length
    }
}
