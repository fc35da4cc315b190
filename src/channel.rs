use std::sync::{Mutex, MutexGuard, PoisonError};

use embedded_io::Error as _;
use log::{debug, warn};

use crate::{
    error::{CommunicationError, ConfigurationError, Error, Result},
    register::{Register, Width},
};

/// Default for the device is 1 second.
pub const DEFAULT_RESPONSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Large enough for a two register read or write plus framing.
const FRAME_CAPACITY: usize = 32;
/// Set on the function code byte of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;
/// unit_id + function + exception code + 2 CRC.
const EXCEPTION_FRAME_LEN: usize = 5;
/// unit_id + function + address(2) + value or count(2) + 2 CRC.
const WRITE_RESPONSE_LEN: usize = 8;

type Frame = heapless::Vec<u8, FRAME_CAPACITY>;

/// Outcome of a write followed by its read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub address: u16,
    pub expected: u32,
    pub actual: u32,
}

impl Verification {
    pub fn matched(&self) -> bool {
        self.expected == self.actual
    }
}

/// Typed access to the holding registers of one Modbus RTU slave.
///
/// You can create a RegisterChannel using any interface which implements [embedded_io::Read] & [embedded_io::Write].
/// The link is half-duplex with one transaction in flight, so every operation takes the
/// interface lock for its whole request/response exchange. A write and its verifying read
/// happen under the same lock.
pub struct RegisterChannel<S: embedded_io::Read + embedded_io::Write> {
    interface: Mutex<S>,
    /// Default for the device is 0x01.
    unit_id: u8,
    response_timeout: std::time::Duration,
}

impl<S: embedded_io::Read + embedded_io::Write> RegisterChannel<S> {
    /// Bind an already open interface to the slave at `unit_id` (1-247).
    pub fn new(interface: S, unit_id: u8) -> Result<Self, S::Error> {
        validate_unit_id(unit_id as u16)?;
        Ok(Self {
            interface: Mutex::new(interface),
            unit_id,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    /// Give up waiting for a response frame after `timeout`.
    pub fn with_response_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn response_timeout(&self) -> std::time::Duration {
        self.response_timeout
    }

    /// Read one value of `width` registers starting at `address`.
    ///
    /// For [`Width::Double`] the first register is the high half.
    pub fn read(&self, address: u16, width: Width) -> Result<u32, S::Error> {
        let value = self.transaction().read(address, width)?;
        debug!("Read {:#06x} -> {}", address, value);
        Ok(value)
    }

    /// Write a value and read it back. Returns whether the read-back matched.
    ///
    /// No retries are made; what to do with a mismatch is up to the caller.
    pub fn write(&self, address: u16, value: u32, width: Width) -> Result<bool, S::Error> {
        Ok(self.write_and_read_back(address, value, width)?.matched())
    }

    /// Write a value and read it back, failing with [`Error::VerificationFailed`] on mismatch.
    pub fn write_verified(&self, address: u16, value: u32, width: Width) -> Result<(), S::Error> {
        let verification = self.write_and_read_back(address, value, width)?;
        if verification.matched() {
            Ok(())
        } else {
            warn!(
                "Register {:#06x} read back {} after writing {}",
                address, verification.actual, verification.expected
            );
            Err(Error::VerificationFailed {
                address: verification.address,
                expected: verification.expected,
                actual: verification.actual,
            })
        }
    }

    /// Write a value and return both the value written and the value read back.
    pub fn write_and_read_back(
        &self,
        address: u16,
        value: u32,
        width: Width,
    ) -> Result<Verification, S::Error> {
        if value > width.max_value() {
            return Err(Error::InvalidRange {
                value: value as f64,
            });
        }
        let mut transaction = self.transaction();
        transaction.write(address, value, width)?;
        let actual = transaction.read(address, width)?;
        debug!("Wrote {:#06x} <- {}, read back {}", address, value, actual);
        Ok(Verification {
            address,
            expected: value,
            actual,
        })
    }

    /// Change the slave address of the device and re-bind this channel to it.
    ///
    /// The device acknowledges at the old address, so the new value is verified by
    /// reading it back at the new address.
    pub fn set_unit_id(&mut self, unit_id: u8) -> Result<(), S::Error> {
        validate_unit_id(unit_id as u16)?;
        let address = Register::SlaveAddress.address();
        self.transaction()
            .write(address, unit_id as u32, Width::Single)?;
        self.unit_id = unit_id;

        let actual = self.read(address, Width::Single)?;
        if actual != unit_id as u32 {
            return Err(Error::VerificationFailed {
                address,
                expected: unit_id as u32,
                actual,
            });
        }
        Ok(())
    }

    /// Take the interface back.
    pub fn into_interface(self) -> S {
        self.interface
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transaction(&self) -> Transaction<'_, S> {
        Transaction {
            interface: self
                .interface
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            unit_id: self.unit_id,
            response_timeout: self.response_timeout,
        }
    }
}

fn validate_unit_id(unit_id: u16) -> core::result::Result<(), ConfigurationError> {
    // Only 1-247 range is suitable ID for single Modbus device.
    if (1..=247).contains(&unit_id) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidSlaveAddress(unit_id))
    }
}

/// Exclusive use of the interface for one or more request/response exchanges.
struct Transaction<'a, S: embedded_io::Read + embedded_io::Write> {
    interface: MutexGuard<'a, S>,
    unit_id: u8,
    response_timeout: std::time::Duration,
}

impl<S: embedded_io::Read + embedded_io::Write> Transaction<'_, S> {
    fn read(
        &mut self,
        address: u16,
        width: Width,
    ) -> core::result::Result<u32, CommunicationError<S::Error>> {
        let mut req = rmodbus::client::ModbusRequest::new(self.unit_id, rmodbus::ModbusProto::Rtu);
        let mut request = Frame::new();
        req.generate_get_holdings(address, width.count(), &mut request)
            .map_err(CommunicationError::Framing)?;

        // unit_id + function + byte_count + data + 2 CRC
        let expected_len = 5 + 2 * width.count() as usize;
        let response = self.exchange(&request, expected_len)?;

        let mut values: heapless::Vec<u16, 4> = heapless::Vec::new();
        req.parse_u16(&response, &mut values)
            .map_err(|err| classify(&response, err))?;

        match (width, values.as_slice()) {
            (Width::Single, [value, ..]) => Ok(*value as u32),
            (Width::Double, [high, low, ..]) => Ok((*high as u32) << 16 | *low as u32),
            _ => Err(CommunicationError::Framing(rmodbus::ErrorKind::FrameBroken)),
        }
    }

    fn write(
        &mut self,
        address: u16,
        value: u32,
        width: Width,
    ) -> core::result::Result<(), CommunicationError<S::Error>> {
        let mut req = rmodbus::client::ModbusRequest::new(self.unit_id, rmodbus::ModbusProto::Rtu);
        let mut request = Frame::new();
        let generated = match width {
            Width::Single => req.generate_set_holding(address, value as u16, &mut request),
            Width::Double => {
                // Function 0x10, high half then low half.
                let halves = [(value >> 16) as u16, value as u16];
                req.generate_set_holdings_bulk(address, &halves, &mut request)
            }
        };
        generated.map_err(CommunicationError::Framing)?;

        let response = self.exchange(&request, WRITE_RESPONSE_LEN)?;
        req.parse_ok(&response)
            .map_err(|err| classify(&response, err))
    }

    /// Send a request and collect the response frame.
    fn exchange(
        &mut self,
        request: &[u8],
        expected_len: usize,
    ) -> core::result::Result<Frame, CommunicationError<S::Error>> {
        self.interface
            .write_all(request)
            .map_err(CommunicationError::Serial)?;
        self.interface.flush().map_err(CommunicationError::Serial)?;

        let deadline = std::time::Instant::now() + self.response_timeout;
        let mut response = Frame::new();
        let mut expected_len = expected_len;

        // Read exactly one frame, so nothing belonging to a later response is consumed.
        let mut temp_buf = [0u8; 8];
        while response.len() < expected_len {
            let wanted = core::cmp::min(temp_buf.len(), expected_len - response.len());
            match self.interface.read(&mut temp_buf[..wanted]) {
                Ok(bytes_read) => {
                    response
                        .extend_from_slice(&temp_buf[..bytes_read])
                        .map_err(|_| CommunicationError::Framing(rmodbus::ErrorKind::FrameBroken))?;
                }
                Err(e) if matches!(e.kind(), embedded_io::ErrorKind::TimedOut) => {
                    return Err(CommunicationError::Timeout);
                }
                Err(e) if matches!(e.kind(), embedded_io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(CommunicationError::Serial(e)),
            }

            if response.len() >= 2 && response[1] & EXCEPTION_FLAG != 0 {
                expected_len = EXCEPTION_FRAME_LEN;
            }
            if response.len() < expected_len && std::time::Instant::now() >= deadline {
                return Err(CommunicationError::Timeout);
            }
        }
        Ok(response)
    }
}

/// Sort a parse failure into checksum, exception or framing errors.
fn classify<I: embedded_io::Error>(
    response: &[u8],
    err: rmodbus::ErrorKind,
) -> CommunicationError<I> {
    match err {
        rmodbus::ErrorKind::FrameCRCError => CommunicationError::Checksum,
        _ if response.len() >= 3 && response[1] & EXCEPTION_FLAG != 0 => {
            CommunicationError::Exception { code: response[2] }
        }
        other => CommunicationError::Framing(other),
    }
}
