//! Sample records and where they go.

use std::{fs::File, io, path::Path};

use chrono::NaiveDateTime;

/// Header row of the CSV log.
pub const CSV_HEADER: [&str; 4] = ["Time", "Voltage (V)", "Current (A)", "Power (W)"];
/// Sortable numeric timestamp format used in the CSV log.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One reading of the output, taken on a sampling tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: NaiveDateTime,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Append-only destination for samples.
///
/// Each call either durably accepts the record or fails. Records are never
/// modified or removed once accepted.
pub trait RecordSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn append(&mut self, sample: &Sample) -> Result<(), Self::Error>;
}

/// Keeps samples in memory.
impl RecordSink for Vec<Sample> {
    type Error = core::convert::Infallible;

    fn append(&mut self, sample: &Sample) -> Result<(), Self::Error> {
        self.push(*sample);
        Ok(())
    }
}

impl<K: RecordSink + ?Sized> RecordSink for &mut K {
    type Error = K::Error;

    fn append(&mut self, sample: &Sample) -> Result<(), Self::Error> {
        (**self).append(sample)
    }
}

/// Writes samples as CSV rows, one header line first.
pub struct CsvSink<W: io::Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    /// Create (or truncate) the file at `path` and write the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, csv::Error> {
        Self::new(File::create(path)?)
    }
}

impl<W: io::Write> CsvSink<W> {
    pub fn new(inner: W) -> Result<Self, csv::Error> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W, csv::Error> {
        self.writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }
}

impl<W: io::Write> RecordSink for CsvSink<W> {
    type Error = csv::Error;

    fn append(&mut self, sample: &Sample) -> Result<(), Self::Error> {
        self.writer.write_record([
            sample.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            sample.voltage.to_string(),
            sample.current.to_string(),
            sample.power.to_string(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}
