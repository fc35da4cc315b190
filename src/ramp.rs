//! Linear voltage ramps with periodic sampling.

use log::debug;

use crate::{
    clock::{Clock, Duration, Instant, as_secs_f64},
    error::{ConfigurationError, Error, Operation, OperationContext, OperationError},
    psu::PowerSupply,
    sink::{RecordSink, Sample},
};

/// Target voltage trajectory of one ramp.
///
/// The baseline is fixed at construction, so a stage split into chunks keeps
/// following the same line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    initial_voltage: f64,
    final_voltage: Option<f64>,
    /// Volts per second.
    rate: f64,
}

impl Ramp {
    /// Go from `initial_voltage` to `final_voltage` over `duration`, or hold when no
    /// final voltage is given.
    pub fn new(initial_voltage: f64, final_voltage: Option<f64>, duration: Duration) -> Self {
        let rate = match final_voltage {
            Some(target) if duration.to_millis() > 0 => {
                (target - initial_voltage) / as_secs_f64(duration)
            }
            _ => 0.0,
        };
        Self {
            initial_voltage,
            final_voltage,
            rate,
        }
    }

    pub fn initial_voltage(&self) -> f64 {
        self.initial_voltage
    }

    pub fn final_voltage(&self) -> Option<f64> {
        self.final_voltage
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_hold(&self) -> bool {
        self.final_voltage.is_none()
    }

    /// Scheduled target `elapsed` after the ramp started. `None` while holding.
    pub fn target_at(&self, elapsed: Duration) -> Option<f64> {
        self.final_voltage?;
        let target = self.initial_voltage + as_secs_f64(elapsed) * self.rate;
        Some(target.max(0.0))
    }
}

/// One bounded operation: sample the output every `sample_period` for `duration`,
/// moving the target voltage along a [`Ramp`] towards `final_voltage` if given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSession {
    duration: Duration,
    final_voltage: Option<f64>,
    sample_period: Duration,
}

impl RampSession {
    pub fn new(
        duration: Duration,
        final_voltage: Option<f64>,
        sample_period: Duration,
    ) -> Result<Self, ConfigurationError> {
        if duration.to_millis() == 0 {
            return Err(ConfigurationError::NonPositiveDuration);
        }
        if sample_period.to_millis() == 0 {
            return Err(ConfigurationError::ZeroSamplePeriod);
        }
        Ok(Self {
            duration,
            final_voltage,
            sample_period,
        })
    }

    /// Run the session from the currently displayed voltage. Returns the number of samples taken.
    ///
    /// The target is never snapped to `final_voltage` at the end; the last value
    /// set is the last interpolated step.
    pub fn run<S, K, C>(
        &self,
        psu: &PowerSupply<S>,
        sink: &mut K,
        clock: &C,
    ) -> Result<usize, OperationError<S::Error>>
    where
        S: embedded_io::Read + embedded_io::Write,
        K: RecordSink + ?Sized,
        C: Clock + ?Sized,
    {
        let origin = clock.now();
        let initial_voltage = psu.voltage().during(Operation::ReadVoltage)?;
        let ramp = Ramp::new(initial_voltage, self.final_voltage, self.duration);
        let mut schedule = TickSchedule::new(origin, self.sample_period);
        drive(psu, sink, clock, &ramp, &mut schedule, self.duration)
    }
}

/// Take one sample of the output.
pub fn capture<S, C>(psu: &PowerSupply<S>, clock: &C) -> Result<Sample, OperationError<S::Error>>
where
    S: embedded_io::Read + embedded_io::Write,
    C: Clock + ?Sized,
{
    let timestamp = clock.timestamp();
    Ok(Sample {
        timestamp,
        voltage: psu.voltage().during(Operation::ReadVoltage)?,
        current: psu.current().during(Operation::ReadCurrent)?,
        power: psu.power().during(Operation::ReadPower)?,
    })
}

/// Sampling instants on a fixed grid of `period` from `origin`.
///
/// One schedule is carried across all chunks of a stage, so chunk boundaries
/// never move the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickSchedule {
    origin: Instant,
    period: Duration,
    /// Index of the next tick to take.
    next: u64,
}

impl TickSchedule {
    pub(crate) fn new(origin: Instant, period: Duration) -> Self {
        Self {
            origin,
            period,
            next: 0,
        }
    }

    pub(crate) fn origin(&self) -> Instant {
        self.origin
    }

    /// When the next sample is due.
    pub(crate) fn due(&self) -> Instant {
        self.origin + Duration::millis(self.period.to_millis() * self.next)
    }

    /// Mark the due tick as taken. Ticks that already passed by `now` are skipped.
    pub(crate) fn advance(&mut self, now: Instant) {
        let elapsed = now
            .checked_duration_since(self.origin)
            .map_or(0, |elapsed| elapsed.to_millis());
        let passed = elapsed / self.period.to_millis().max(1);
        self.next = (self.next + 1).max(passed + 1);
    }
}

/// Sample and steer for `length` starting now, taking samples when `schedule`
/// says they are due and following `ramp` from the schedule origin.
pub(crate) fn drive<S, K, C>(
    psu: &PowerSupply<S>,
    sink: &mut K,
    clock: &C,
    ramp: &Ramp,
    schedule: &mut TickSchedule,
    length: Duration,
) -> Result<usize, OperationError<S::Error>>
where
    S: embedded_io::Read + embedded_io::Write,
    K: RecordSink + ?Sized,
    C: Clock + ?Sized,
{
    let end = clock.now() + length;
    let mut taken = 0;

    loop {
        let due = schedule.due();
        let now = clock.now();
        if due >= end {
            if end > now {
                clock.sleep(end - now);
            }
            break;
        }
        if due > now {
            clock.sleep(due - now);
        }

        let sample = capture(psu, clock)?;
        sink.append(&sample)
            .map_err(|err| OperationError::new(Operation::AppendSample, Error::Sink(Box::new(err))))?;

        if let Some(target) = ramp.target_at(clock.elapsed_since(schedule.origin())) {
            debug!("Ramp target {:.3} V", target);
            psu.set_target_voltage(target)
                .during(Operation::SetTargetVoltage)?;
        }

        taken += 1;
        schedule.advance(clock.now());
    }
    Ok(taken)
}
