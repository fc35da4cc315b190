//! We use this mocking module in unit tests to emulate a power supply on the other end of a serial port.
//!
//! Requests written to [`MockPsu`] are decoded as Modbus RTU frames and answered from an
//! in-memory register map. The displayed voltage, current and power follow the target
//! voltage while the output is enabled, driving a fixed resistive load.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use crate::register::Register;

/// Decimals register value: voltage 2 decimals, current 3, power 3.
pub const DECIMALS: u16 = 0x0233;
/// Name register value.
pub const NAME_CODE: u16 = 3010;
/// Class register value.
pub const CLASS_CODE: u16 = 0x4b50;
/// Protection state reported at connection time.
pub const CAPABILITIES: u16 = 0b1_1111;
/// Resistance of the simulated load in ohms.
const LOAD_OHMS: f64 = 10.0;

/// Modbus CRC-16 as transmitted, low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Nothing to read, like a serial port hitting its read timeout.
    Timeout,
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

/// A write that should go unanswered.
struct DroppedWrite {
    address: u16,
    /// Number of further writes to `address` to let through first.
    remaining: usize,
}

/// Register map and fault configuration, shared between the mock and its handles.
struct DeviceState {
    unit_id: u8,
    registers: BTreeMap<u16, u16>,
    /// Largest value each register will accept; larger writes are clamped.
    clamps: BTreeMap<u16, u16>,
    requests: Vec<Vec<u8>>,
    dropped_writes: Vec<DroppedWrite>,
    silent: bool,
    corrupt_next: bool,
    write_error: bool,
}

impl DeviceState {
    fn new(unit_id: u8) -> Self {
        let mut registers = BTreeMap::new();
        for register in [
            Register::OperativeMode,
            Register::ProtectionState,
            Register::Voltage,
            Register::Current,
            Register::OverVoltageThreshold,
            Register::OverCurrentThreshold,
            Register::TargetVoltage,
            Register::CurrentLimit,
        ] {
            registers.insert(register.address(), 0);
        }
        for address in [0x0012, 0x0013, 0x0022, 0x0023] {
            registers.insert(address, 0);
        }
        registers.insert(Register::Name.address(), NAME_CODE);
        registers.insert(Register::Class.address(), CLASS_CODE);
        registers.insert(Register::Decimals.address(), DECIMALS);
        registers.insert(Register::ProtectionState.address(), CAPABILITIES);
        registers.insert(Register::SlaveAddress.address(), unit_id as u16);

        Self {
            unit_id,
            registers,
            clamps: BTreeMap::new(),
            requests: Vec::new(),
            dropped_writes: Vec::new(),
            silent: false,
            corrupt_next: false,
            write_error: false,
        }
    }

    /// Decode one complete request and produce the response, if any.
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        self.requests.push(request.to_vec());
        let body_len = request.len() - 2;
        let crc = crc16(&request[..body_len]);
        if request[body_len..] != crc.to_le_bytes() || request[0] != self.unit_id || self.silent {
            return None;
        }

        let function = request[1];
        let address = u16::from_be_bytes([request[2], request[3]]);
        let mut response = vec![request[0], function];
        match function {
            0x03 => {
                let count = u16::from_be_bytes([request[4], request[5]]);
                let mut data = Vec::new();
                for offset in 0..count {
                    let value = self.registers.get(&(address + offset)).copied();
                    match value {
                        Some(value) => data.extend_from_slice(&value.to_be_bytes()),
                        None => return Some(self.exception(request[0], function, 0x02)),
                    }
                }
                response.push(data.len() as u8);
                response.extend_from_slice(&data);
            }
            0x06 => {
                if self.take_dropped_write(address) {
                    return None;
                }
                let value = u16::from_be_bytes([request[4], request[5]]);
                if !self.store(address, value) {
                    return Some(self.exception(request[0], function, 0x02));
                }
                response.extend_from_slice(&request[2..6]);
            }
            0x10 => {
                if self.take_dropped_write(address) {
                    return None;
                }
                let count = u16::from_be_bytes([request[4], request[5]]);
                for offset in 0..count {
                    let at = 7 + offset as usize * 2;
                    let value = u16::from_be_bytes([request[at], request[at + 1]]);
                    if !self.store(address + offset, value) {
                        return Some(self.exception(request[0], function, 0x02));
                    }
                }
                response.extend_from_slice(&request[2..6]);
            }
            _ => return Some(self.exception(request[0], function, 0x01)),
        }

        if address == Register::SlaveAddress.address() && function == 0x06 {
            // Acknowledged at the old address, answers at the new one from now on.
            self.unit_id = self.registers[&address] as u8;
        }
        Some(self.finish(response))
    }

    fn exception(&mut self, unit_id: u8, function: u8, code: u8) -> Vec<u8> {
        self.finish(vec![unit_id, function | 0x80, code])
    }

    fn finish(&mut self, mut response: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        if self.corrupt_next {
            self.corrupt_next = false;
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }
        response
    }

    fn take_dropped_write(&mut self, address: u16) -> bool {
        let Some(index) = self
            .dropped_writes
            .iter()
            .position(|drop| drop.address == address)
        else {
            return false;
        };
        if self.dropped_writes[index].remaining == 0 {
            self.dropped_writes.remove(index);
            true
        } else {
            self.dropped_writes[index].remaining -= 1;
            false
        }
    }

    fn store(&mut self, address: u16, value: u16) -> bool {
        if !self.registers.contains_key(&address) {
            return false;
        }
        let value = match self.clamps.get(&address) {
            Some(max) => value.min(*max),
            None => value,
        };
        self.registers.insert(address, value);
        if address == Register::OperativeMode.address()
            || address == Register::TargetVoltage.address()
        {
            self.update_output();
        }
        true
    }

    /// Recompute the displayed readings from the target voltage and output switch.
    fn update_output(&mut self) {
        let enabled = self.registers[&Register::OperativeMode.address()] != 0;
        let voltage_raw = if enabled {
            self.registers[&Register::TargetVoltage.address()]
        } else {
            0
        };
        let volts = voltage_raw as f64 / 100.0;
        let amps = volts / LOAD_OHMS;
        let power_raw = (volts * amps * 1000.0).round() as u32;

        self.registers.insert(Register::Voltage.address(), voltage_raw);
        self.registers
            .insert(Register::Current.address(), (amps * 1000.0).round() as u16);
        self.registers.insert(0x0012, (power_raw >> 16) as u16);
        self.registers.insert(0x0013, power_raw as u16);
    }
}

/// Our mock type used to emulate a power supply behind a serial port.
pub struct MockPsu {
    state: Rc<RefCell<DeviceState>>,
    /// Request bytes not yet forming a complete frame.
    pending: Vec<u8>,
    /// Response bytes waiting to be read.
    read_buffer: VecDeque<u8>,
}

impl MockPsu {
    pub fn new(unit_id: u8) -> Self {
        Self {
            state: Rc::new(RefCell::new(DeviceState::new(unit_id))),
            pending: Vec::new(),
            read_buffer: VecDeque::new(),
        }
    }

    /// A handle for inspecting and configuring the device after the mock has been moved.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Rc::clone(&self.state),
        }
    }

    /// Length of the request frame at the start of `pending`, once enough of it is known.
    fn frame_len(&self) -> Option<usize> {
        match *self.pending.get(1)? {
            0x10 => self.pending.get(6).map(|byte_count| 9 + *byte_count as usize),
            _ => Some(8),
        }
    }
}

impl embedded_io::ErrorType for MockPsu {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockPsu {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.state.borrow().write_error {
            return Err(MockSerialError::SimulatedError);
        }
        self.pending.extend_from_slice(buf);

        while let Some(len) = self.frame_len() {
            if self.pending.len() < len {
                break;
            }
            let request: Vec<u8> = self.pending.drain(..len).collect();
            if let Some(response) = self.state.borrow_mut().respond(&request) {
                self.read_buffer.extend(response);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Read for MockPsu {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.read_buffer.is_empty() {
            return Err(MockSerialError::Timeout);
        }
        let bytes_to_read = core::cmp::min(buf.len(), self.read_buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.read_buffer.drain(..bytes_to_read)) {
            *slot = byte;
        }
        Ok(bytes_to_read)
    }
}

/// Shared view of a [`MockPsu`] device.
#[derive(Clone)]
pub struct MockHandle {
    state: Rc<RefCell<DeviceState>>,
}

impl MockHandle {
    pub fn register(&self, address: u16) -> u16 {
        self.state.borrow().registers[&address]
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.borrow_mut().registers.insert(address, value);
    }

    pub fn unit_id(&self) -> u8 {
        self.state.borrow().unit_id
    }

    /// Every request frame received so far, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.borrow().requests.clone()
    }

    /// Number of write requests (single or multiple) addressed to `address`.
    pub fn writes_to(&self, address: u16) -> usize {
        let [high, low] = address.to_be_bytes();
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|r| matches!(r[1], 0x06 | 0x10) && r[2] == high && r[3] == low)
            .count()
    }

    /// Values written to `address` with single register writes, in order.
    pub fn written_values(&self, address: u16) -> Vec<u16> {
        let [high, low] = address.to_be_bytes();
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|r| r[1] == 0x06 && r[2] == high && r[3] == low)
            .map(|r| u16::from_be_bytes([r[4], r[5]]))
            .collect()
    }

    /// Store at most `max` in `address`, as a device limiting a setpoint would.
    pub fn clamp_register(&self, address: u16, max: u16) {
        self.state.borrow_mut().clamps.insert(address, max);
    }

    /// Leave one future write to `address` unanswered and unapplied, after letting `skip` through.
    pub fn drop_write(&self, address: u16, skip: usize) {
        self.state.borrow_mut().dropped_writes.push(DroppedWrite {
            address,
            remaining: skip,
        });
    }

    /// Stop answering any request.
    pub fn set_silent(&self, silent: bool) {
        self.state.borrow_mut().silent = silent;
    }

    /// Damage the checksum of the next response.
    pub fn corrupt_next_response(&self) {
        self.state.borrow_mut().corrupt_next = true;
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&self, should_error: bool) {
        self.state.borrow_mut().write_error = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, Write};

    #[test]
    fn test_crc_matches_known_frame() {
        let frame = [0x01, 0x03, 0x00, 0x02, 0x00, 0x01];
        assert_eq!(crc16(&frame).to_le_bytes(), [0x25, 0xCA]);
    }

    #[test]
    fn test_read_timeout_when_no_data() {
        let mut mock = MockPsu::new(1);
        let mut buffer = [0u8; 10];
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::Timeout)));
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let mut mock = MockPsu::new(1);
        let mut request = vec![0x01, 0x03, 0x00, 0x03, 0x00, 0x01];
        let crc = crc16(&request);
        request.extend_from_slice(&crc.to_le_bytes());

        mock.write(&request[..3]).unwrap();
        let mut buffer = [0u8; 16];
        assert!(mock.read(&mut buffer).is_err());

        mock.write(&request[3..]).unwrap();
        let n = mock.read(&mut buffer).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buffer[..5], [0x01, 0x03, 0x02, 0x0B, 0xC2]);
    }

    #[test]
    fn test_output_follows_target() {
        let mock = MockPsu::new(1);
        let handle = mock.handle();
        handle.state.borrow_mut().store(0x0030, 500);
        assert_eq!(handle.register(0x0010), 0);

        handle.state.borrow_mut().store(0x0001, 1);
        assert_eq!(handle.register(0x0010), 500);
        assert_eq!(handle.register(0x0011), 500);
        assert_eq!(handle.register(0x0013), 2500);
    }

    #[test]
    fn test_write_error_simulation() {
        let mut mock = MockPsu::new(1);
        mock.handle().set_write_error(true);
        assert!(matches!(
            mock.write(b"test"),
            Err(MockSerialError::SimulatedError)
        ));
    }
}
