//! Interactive TiO2 nanotube anodic oxidation run.
//!
//! Usage: `cargo run --example oxidation [PORT-KEYWORD]`
use std::env;

use anyhow::{Context, bail};
use inquire::{CustomType, Select, Text};
use log::{LevelFilter, info};
use psu_anodize::{
    Duration, PowerSupply, RegisterChannel, SequencerConfig, StageSequencer, StageSpec,
    SystemClock,
    sequencer::{SequenceObserver, StageResult},
    sink::CsvSink,
};
use serialport::SerialPort;

const DEFAULT_BAUD_RATE: u32 = 9600;
// The PSU can take a while to respond, a reasonably large time out is required.
const SERIAL_TIMEOUT_MS: u64 = 300;
const DEFAULT_UNIT_ID: u8 = 0x01;

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

/// Prints a progress line per chunk, in place of a progress bar.
struct Progress {
    chunks: usize,
}

impl SequenceObserver for Progress {
    fn stage_started(&mut self, stage: usize, spec: &StageSpec, chunks: usize) {
        self.chunks = chunks;
        match spec.target_voltage() {
            Some(volts) => println!("Stage {}: ramp to {volts} V", stage + 1),
            None => println!("Stage {}: constant voltage", stage + 1),
        }
    }

    fn chunk_completed(&mut self, stage: usize, chunk: usize) {
        print!("\rStage {}: {}/{}", stage + 1, chunk + 1, self.chunks);
        let _ = std::io::Write::flush(&mut std::io::stdout());
    }

    fn stage_completed(&mut self, _result: &StageResult) {
        println!();
    }
}

/// Pick a port whose name contains `keyword`, or ask.
fn select_port(keyword: Option<String>) -> anyhow::Result<String> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        bail!("No serial ports found!");
    }
    let port_names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();

    if let Some(keyword) = keyword {
        return port_names
            .into_iter()
            .find(|name| name.contains(&keyword))
            .with_context(|| format!("No serial port matching {keyword:?}"));
    }
    Ok(Select::new("Select a serial port:", port_names).prompt()?)
}

fn prompt_stages() -> anyhow::Result<Vec<StageSpec>> {
    let count = CustomType::<usize>::new("Enter the number of stages:").prompt()?;
    let mut stages = Vec::with_capacity(count);
    for stage in 1..=count {
        let duration = Text::new(&format!("Enter the duration of Stage {stage} (seconds):"))
            .with_help_message("Leave empty for 500 seconds")
            .prompt()?;
        let voltage = Text::new(&format!("Enter the final voltage of Stage {stage} (V):"))
            .with_help_message("Leave empty to hold the present voltage")
            .prompt()?;
        stages.push(StageSpec::parse(&duration, &voltage)?);
    }
    Ok(stages)
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    let port_name = select_port(env::args().nth(1))?;
    println!("Using port: {}", port_name);
    let baud_rate = CustomType::<u32>::new("Enter the baud rate:")
        .with_default(DEFAULT_BAUD_RATE)
        .prompt()?;
    let unit_id = CustomType::<u8>::new("Enter the device address:")
        .with_default(DEFAULT_UNIT_ID)
        .prompt()?;

    let port = serialport::new(&port_name, baud_rate)
        .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .context("Failed to open serial port")?;

    let channel = RegisterChannel::new(PortWrapper(port), unit_id)?;
    let psu = PowerSupply::connect(channel)?;
    info!("Device profile: {:?}", psu.profile());

    let file_path = Text::new("Enter the local file path for storing data:").prompt()?;
    let mut sink = CsvSink::create(&file_path)?;
    let period = CustomType::<u64>::new("Enter the time per iteration (in seconds):")
        .with_default(1)
        .prompt()?;
    let config = SequencerConfig::new(Duration::secs(period))?;
    let stages = prompt_stages()?;

    let mut sequencer = StageSequencer::new(stages, config);
    let mut progress = Progress { chunks: 0 };
    let report = sequencer.run_with_observer(&psu, &mut sink, &SystemClock::new(), &mut progress);

    for result in &report.results {
        println!(
            "Stage {}: {:.1} s, {} V, {} A, {} W",
            result.stage + 1,
            psu_anodize::clock::as_secs_f64(result.elapsed),
            result.final_voltage,
            result.final_current,
            result.final_power
        );
    }
    if !report.teardown.succeeded() {
        eprintln!("WARNING: teardown incomplete, switch the output off by hand");
    }
    if let Some(failure) = report.failure {
        bail!("{failure}");
    }
    println!("Samples written to {file_path}");
    Ok(())
}
