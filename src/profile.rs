//! Device metadata read once when a session starts.
//!
//! The power supply reports how many decimal places each quantity uses. We turn
//! those into [`Scale`] factors so raw register values can be converted to volts,
//! amps and watts, and back.

use log::debug;
use modular_bitfield::prelude::*;
use strum_macros::{Display, EnumIter};

use crate::{
    channel::RegisterChannel,
    error::Result,
    register::{Register, Width},
};

/// Decimal multiplier relating a raw register value to a physical quantity.
///
/// Always a power of ten. A raw value `R` represents `R / scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale(u64);

impl Scale {
    /// No scaling, raw value equals physical value.
    pub const UNIT: Scale = Scale(1);

    /// Scale for a quantity reported with `decimals` decimal places.
    pub const fn from_decimals(decimals: u8) -> Self {
        Self(10u64.pow(decimals as u32))
    }

    pub const fn factor(self) -> u64 {
        self.0
    }

    /// Convert a raw register value to its physical value.
    #[inline]
    pub fn decode(self, raw: u32) -> f64 {
        raw as f64 / self.0 as f64
    }

    /// Convert a physical value to a raw register value, rounding half up.
    ///
    /// Returns `None` for negative or non-finite values, or when the result does
    /// not fit in `width`.
    pub fn encode(self, value: f64, width: Width) -> Option<u32> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let raw = (value * self.0 as f64 + 0.5).floor();
        if raw > width.max_value() as f64 {
            return None;
        }
        Some(raw as u32)
    }
}

/// Layout of the decimals register: one nibble per quantity.
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalPacking {
    pub power: B4,
    pub current: B4,
    pub voltage: B4,
    #[skip]
    __: B4,
}

impl From<u16> for DecimalPacking {
    fn from(raw: u16) -> Self {
        DecimalPacking::from_bytes(raw.to_le_bytes())
    }
}

/// Protection state register.
///
/// At connection time this tells us which protections the device supports; at
/// runtime the same bits report which protections have tripped.
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionState {
    /// Bit 0: OVP, over-voltage protection.
    pub over_voltage: bool,
    /// Bit 1: OCP, over-current protection.
    pub over_current: bool,
    /// Bit 2: OPP, over-power protection.
    pub over_power: bool,
    /// Bit 3: OTP, over-temperature protection.
    pub over_temperature: bool,
    /// Bit 4: SCP, short-circuit protection.
    pub short_circuit: bool,
    #[skip]
    __: B11,
}

impl From<u16> for ProtectionState {
    fn from(raw: u16) -> Self {
        ProtectionState::from_bytes(raw.to_le_bytes())
    }
}

impl ProtectionState {
    pub fn is_set(&self, protection: Protection) -> bool {
        match protection {
            Protection::OverVoltage => self.over_voltage(),
            Protection::OverCurrent => self.over_current(),
            Protection::OverPower => self.over_power(),
            Protection::OverTemperature => self.over_temperature(),
            Protection::ShortCircuit => self.short_circuit(),
        }
    }

    /// Iterate over the protections whose bit is set.
    pub fn active(self) -> impl Iterator<Item = Protection> {
        use strum::IntoEnumIterator;
        Protection::iter().filter(move |p| self.is_set(*p))
    }
}

/// The protections reported by the protection state register.
#[derive(Debug, Display, EnumIter, PartialEq, Eq, Clone, Copy)]
pub enum Protection {
    #[strum(to_string = "OVP")]
    OverVoltage,
    #[strum(to_string = "OCP")]
    OverCurrent,
    #[strum(to_string = "OPP")]
    OverPower,
    #[strum(to_string = "OTP")]
    OverTemperature,
    #[strum(to_string = "SCP")]
    ShortCircuit,
}

/// Identification and unit scaling of a connected power supply.
///
/// Built once per connection and never changed. If the device is swapped a new
/// profile has to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    name_code: u16,
    class_code: u16,
    voltage_scale: Scale,
    current_scale: Scale,
    power_scale: Scale,
    capabilities: ProtectionState,
}

impl DeviceProfile {
    /// Read the identification registers in order: name, class, decimals, protection state.
    pub fn read<S: embedded_io::Read + embedded_io::Write>(
        channel: &RegisterChannel<S>,
    ) -> Result<Self, S::Error> {
        let name = channel.read(Register::Name.address(), Width::Single)?;
        let class = channel.read(Register::Class.address(), Width::Single)?;
        let decimals = channel.read(Register::Decimals.address(), Width::Single)?;
        let protection = channel.read(Register::ProtectionState.address(), Width::Single)?;

        let profile = Self::decode(name as u16, class as u16, decimals as u16, protection as u16);
        debug!("Device profile: {:?}", profile);
        Ok(profile)
    }

    /// Build a profile from raw register values.
    pub fn decode(name: u16, class: u16, decimals: u16, protection: u16) -> Self {
        let packing = DecimalPacking::from(decimals);
        Self {
            name_code: name,
            class_code: class,
            voltage_scale: Scale::from_decimals(packing.voltage()),
            current_scale: Scale::from_decimals(packing.current()),
            power_scale: Scale::from_decimals(packing.power()),
            capabilities: ProtectionState::from(protection),
        }
    }

    pub fn name_code(&self) -> u16 {
        self.name_code
    }

    pub fn class_code(&self) -> u16 {
        self.class_code
    }

    pub fn voltage_scale(&self) -> Scale {
        self.voltage_scale
    }

    pub fn current_scale(&self) -> Scale {
        self.current_scale
    }

    pub fn power_scale(&self) -> Scale {
        self.power_scale
    }

    /// Protection flags as decoded when the profile was read.
    pub fn capabilities(&self) -> ProtectionState {
        self.capabilities
    }

    pub fn supports_ovp(&self) -> bool {
        self.capabilities.over_voltage()
    }

    pub fn supports_ocp(&self) -> bool {
        self.capabilities.over_current()
    }

    pub fn supports_opp(&self) -> bool {
        self.capabilities.over_power()
    }

    pub fn supports_otp(&self) -> bool {
        self.capabilities.over_temperature()
    }

    pub fn supports_scp(&self) -> bool {
        self.capabilities.short_circuit()
    }
}
