//! This module is used to define the holding registers on the power supply.

use strum_macros::EnumIter;

/// How many consecutive 16-bit registers make up one value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Width {
    /// One register, value is a u16.
    Single = 1,
    /// Two registers, first register holds the high half of a u32.
    Double = 2,
}

impl Width {
    /// Number of registers covered.
    pub const fn count(self) -> u16 {
        self as u16
    }

    /// Largest raw value that fits.
    pub const fn max_value(self) -> u32 {
        match self {
            Width::Single => u16::MAX as u32,
            Width::Double => u32::MAX,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter)]
#[repr(u16)]
pub enum Register {
    /// __R/W__ - Output switch.
    /// * `0` - Output disabled.
    /// * `1` - Output enabled.
    OperativeMode = 0x0001,
    /// __R__ - Protection state.
    ///
    /// See [`ProtectionState`](crate::profile::ProtectionState) for the bit layout.
    ProtectionState = 0x0002,
    /// __R__ - Device name (model code).
    Name = 0x0003,
    /// __R__ - Device class.
    Class = 0x0004,
    /// __R__ - Decimal point positions for power, current and voltage, one nibble each.
    ///
    /// See [`DecimalPacking`](crate::profile::DecimalPacking).
    Decimals = 0x0005,
    /// __R__ - Displayed (measured) output voltage.
    Voltage = 0x0010,
    /// __R__ - Displayed (measured) output current.
    Current = 0x0011,
    /// __R__ - Displayed output power. Two registers, `0x0012` high and `0x0013` low.
    Power = 0x0012,
    /// __R/W__ - Over-voltage protection threshold.
    OverVoltageThreshold = 0x0020,
    /// __R/W__ - Over-current protection threshold.
    OverCurrentThreshold = 0x0021,
    /// __R/W__ - Over-power protection threshold. Two registers, like [`Register::Power`].
    OverPowerThreshold = 0x0022,
    /// __R/W__ - Target voltage setting.
    TargetVoltage = 0x0030,
    /// __R/W__ - Current limit setting.
    CurrentLimit = 0x0031,
    /// __R/W__ - Modbus slave address of the device.
    SlaveAddress = 0x9999,
}

impl Register {
    pub const fn address(self) -> u16 {
        self as u16
    }

    pub const fn width(self) -> Width {
        match self {
            Register::Power | Register::OverPowerThreshold => Width::Double,
            _ => Width::Single,
        }
    }
}
