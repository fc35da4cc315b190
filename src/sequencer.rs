//! Runs an ordered plan of stages against one power supply.
//!
//! Each stage is split into chunks for scheduling and progress reporting. The ramp
//! baseline is taken once per stage, so chunk boundaries do not bend the voltage
//! trajectory. Whatever happens, the output is switched off and the target voltage
//! zeroed before [`StageSequencer::run`] returns.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{error, info, warn};

use crate::{
    clock::{Clock, Duration, as_secs_f64},
    config::{SequencerConfig, StageSpec},
    error::{ConfigurationError, Error, Operation, OperationContext, OperationError},
    psu::{PowerSupply, TeardownReport},
    ramp::{Ramp, TickSchedule, drive},
    sink::RecordSink,
};

/// Where a sequencer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    /// Zero-based index of the stage being executed.
    Running(usize),
    Completed,
    Failed,
}

/// Cooperative cancellation, observed before every chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timing and final readings of a completed stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageResult {
    pub stage: usize,
    pub elapsed: Duration,
    pub final_voltage: f64,
    pub final_current: f64,
    pub final_power: f64,
}

/// What went wrong, and where.
#[derive(Debug)]
pub struct StageFailure<I: embedded_io::Error> {
    /// `None` when no stage had started yet.
    pub stage: Option<usize>,
    pub operation: Operation,
    pub error: Error<I>,
}

impl<I: embedded_io::Error> StageFailure<I> {
    fn at(stage: Option<usize>, err: OperationError<I>) -> Self {
        Self {
            stage,
            operation: err.operation,
            error: err.error,
        }
    }
}

impl<I: embedded_io::Error> core::fmt::Display for StageFailure<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "Stage {}: ", stage + 1)?,
            None => write!(f, "Before the first stage: ")?,
        }
        write!(f, "{} failed: {}", self.operation, self.error)
    }
}

/// Outcome of a whole sequence.
#[derive(Debug)]
pub struct SequenceReport<I: embedded_io::Error> {
    /// One entry per stage that ran to completion, in order.
    pub results: Vec<StageResult>,
    pub failure: Option<StageFailure<I>>,
    pub teardown: TeardownReport<I>,
}

impl<I: embedded_io::Error> SequenceReport<I> {
    pub fn state(&self) -> SequenceState {
        if self.failure.is_some() {
            SequenceState::Failed
        } else {
            SequenceState::Completed
        }
    }
}

/// Progress callbacks. All methods default to doing nothing.
pub trait SequenceObserver {
    fn stage_started(&mut self, _stage: usize, _spec: &StageSpec, _chunks: usize) {}

    fn chunk_completed(&mut self, _stage: usize, _chunk: usize) {}

    fn stage_completed(&mut self, _result: &StageResult) {}
}

impl SequenceObserver for () {}

/// Split `total` into consecutive chunks of `chunk`, the last one possibly shorter.
pub fn chunk_lengths(total: Duration, chunk: Duration) -> Vec<Duration> {
    let total = total.to_millis();
    let chunk = chunk.to_millis().max(1);
    (0..total.div_ceil(chunk))
        .map(|index| Duration::millis(chunk.min(total - index * chunk)))
        .collect()
}

/// Output enabled for the duration of a sequence.
///
/// Teardown runs on [`OutputSession::release`], or on drop if that never happened.
pub struct OutputSession<'a, S: embedded_io::Read + embedded_io::Write> {
    psu: &'a PowerSupply<S>,
    released: bool,
}

impl<'a, S: embedded_io::Read + embedded_io::Write> OutputSession<'a, S> {
    /// Arm teardown for `psu`. Does not talk to the device.
    pub fn new(psu: &'a PowerSupply<S>) -> Self {
        Self {
            psu,
            released: false,
        }
    }

    pub fn enable(&self) -> Result<(), OperationError<S::Error>> {
        self.psu
            .set_operative_mode(true)
            .during(Operation::EnableOutput)
    }

    /// Disable output and zero the target voltage.
    pub fn release(mut self) -> TeardownReport<S::Error> {
        self.released = true;
        self.psu.shutdown()
    }
}

impl<S: embedded_io::Read + embedded_io::Write> Drop for OutputSession<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Output session dropped without release, shutting down");
            let _ = self.psu.shutdown();
        }
    }
}

/// Executes a stage plan.
pub struct StageSequencer {
    stages: Vec<StageSpec>,
    config: SequencerConfig,
    cancel: CancelToken,
    state: SequenceState,
}

impl StageSequencer {
    pub fn new(stages: Vec<StageSpec>, config: SequencerConfig) -> Self {
        Self {
            stages,
            config,
            cancel: CancelToken::new(),
            state: SequenceState::Idle,
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// A token that stops the sequence at the next chunk boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run<S, K, C>(
        &mut self,
        psu: &PowerSupply<S>,
        sink: &mut K,
        clock: &C,
    ) -> SequenceReport<S::Error>
    where
        S: embedded_io::Read + embedded_io::Write,
        K: RecordSink + ?Sized,
        C: Clock + ?Sized,
    {
        self.run_with_observer(psu, sink, clock, &mut ())
    }

    /// Run every stage in order, then tear down.
    ///
    /// The first error ends the sequence. Teardown is attempted exactly once either
    /// way and its outcome is part of the report.
    pub fn run_with_observer<S, K, C, O>(
        &mut self,
        psu: &PowerSupply<S>,
        sink: &mut K,
        clock: &C,
        observer: &mut O,
    ) -> SequenceReport<S::Error>
    where
        S: embedded_io::Read + embedded_io::Write,
        K: RecordSink + ?Sized,
        C: Clock + ?Sized,
        O: SequenceObserver + ?Sized,
    {
        let session = OutputSession::new(psu);
        let mut results = Vec::with_capacity(self.stages.len());
        let failure = self.execute(psu, &session, sink, clock, observer, &mut results).err();
        if let Some(failure) = &failure {
            error!("An error occurred during execution: {}", failure);
        }

        info!("Disconnecting...");
        let teardown = session.release();
        if !teardown.succeeded() {
            error!("Teardown incomplete, check the power supply output");
        }

        self.state = if failure.is_some() {
            SequenceState::Failed
        } else {
            SequenceState::Completed
        };
        SequenceReport {
            results,
            failure,
            teardown,
        }
    }

    fn execute<S, K, C, O>(
        &mut self,
        psu: &PowerSupply<S>,
        session: &OutputSession<'_, S>,
        sink: &mut K,
        clock: &C,
        observer: &mut O,
        results: &mut Vec<StageResult>,
    ) -> Result<(), StageFailure<S::Error>>
    where
        S: embedded_io::Read + embedded_io::Write,
        K: RecordSink + ?Sized,
        C: Clock + ?Sized,
        O: SequenceObserver + ?Sized,
    {
        if self.stages.is_empty() {
            return Err(StageFailure::at(
                None,
                OperationError::new(Operation::ValidatePlan, ConfigurationError::EmptyPlan),
            ));
        }
        session.enable().map_err(|err| StageFailure::at(None, err))?;

        for (index, spec) in self.stages.iter().enumerate() {
            self.state = SequenceState::Running(index);
            let result = run_stage(
                index,
                spec,
                &self.config,
                &self.cancel,
                psu,
                sink,
                clock,
                observer,
            )
            .map_err(|err| StageFailure::at(Some(index), err))?;
            observer.stage_completed(&result);
            results.push(result);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stage<S, K, C, O>(
    index: usize,
    spec: &StageSpec,
    config: &SequencerConfig,
    cancel: &CancelToken,
    psu: &PowerSupply<S>,
    sink: &mut K,
    clock: &C,
    observer: &mut O,
) -> Result<StageResult, OperationError<S::Error>>
where
    S: embedded_io::Read + embedded_io::Write,
    K: RecordSink + ?Sized,
    C: Clock + ?Sized,
    O: SequenceObserver + ?Sized,
{
    info!("Starting stage {}...", index + 1);
    let chunks = chunk_lengths(spec.duration(), config.chunk_length());
    observer.stage_started(index, spec, chunks.len());

    let stage_start = clock.now();
    let initial_voltage = psu.voltage().during(Operation::ReadVoltage)?;
    let ramp = Ramp::new(initial_voltage, spec.target_voltage(), spec.duration());
    let mut schedule = TickSchedule::new(stage_start, config.sample_period());

    for (chunk, length) in chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(OperationError::new(
                Operation::ChunkBoundary,
                Error::Cancelled,
            ));
        }
        drive(psu, sink, clock, &ramp, &mut schedule, *length)?;
        observer.chunk_completed(index, chunk);
    }

    let elapsed = clock.elapsed_since(stage_start);
    let result = StageResult {
        stage: index,
        elapsed,
        final_voltage: psu.voltage().during(Operation::ReadVoltage)?,
        final_current: psu.current().during(Operation::ReadCurrent)?,
        final_power: psu.power().during(Operation::ReadPower)?,
    };
    info!("Stage {} completed...", index + 1);
    info!("Stage runtime: {:.1} seconds", as_secs_f64(elapsed));
    info!("Current displayed voltage: {} V", result.final_voltage);
    info!("Current displayed current: {} A", result.final_current);
    info!("Current displayed power: {} W", result.final_power);
    Ok(result)
}
