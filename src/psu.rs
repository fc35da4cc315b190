use log::{debug, error, info};

use crate::{
    channel::RegisterChannel,
    clock::{Clock, Duration, as_secs_f64},
    error::{Error, Result},
    profile::{DeviceProfile, ProtectionState, Scale},
    register::{Register, Width},
};

/// How often the displayed voltage is polled while waiting for it to settle.
const SETTLE_POLL_INTERVAL: Duration = Duration::millis(100);

/// Optional protection thresholds. `None` leaves a threshold untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProtectionThresholds {
    /// Over-voltage protection level in volts.
    pub over_voltage: Option<f64>,
    /// Over-current protection level in amps.
    pub over_current: Option<f64>,
    /// Over-power protection level in watts.
    pub over_power: Option<f64>,
}

/// Voltage, current and power read in one go.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readings {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Result of the safety teardown. Both steps are always attempted.
#[derive(Debug)]
pub struct TeardownReport<I: embedded_io::Error> {
    pub output_disabled: Result<(), I>,
    pub voltage_zeroed: Result<(), I>,
}

impl<I: embedded_io::Error> TeardownReport<I> {
    pub fn succeeded(&self) -> bool {
        self.output_disabled.is_ok() && self.voltage_zeroed.is_ok()
    }
}

/// A power supply reached through a [`RegisterChannel`].
///
/// Nothing but the [`DeviceProfile`] is cached: every getter reads the device, every
/// setter writes and verifies. For its methods, "set" writes a setting and a plain
/// name reads a measured value or setting back.
pub struct PowerSupply<S: embedded_io::Read + embedded_io::Write> {
    channel: RegisterChannel<S>,
    profile: DeviceProfile,
}

impl<S: embedded_io::Read + embedded_io::Write> PowerSupply<S> {
    /// Create a PowerSupply on an open interface with the given unit ID.
    pub fn new(interface: S, unit_id: u8) -> Result<Self, S::Error> {
        Self::connect(RegisterChannel::new(interface, unit_id)?)
    }

    /// Read the device profile, then force the target voltage to zero so nothing
    /// from an earlier session carries over.
    pub fn connect(channel: RegisterChannel<S>) -> Result<Self, S::Error> {
        let profile = DeviceProfile::read(&channel)?;
        let psu = Self { channel, profile };
        psu.set_target_voltage(0.0)?;
        info!(
            "Connected to power supply {} (class {:#06x}) at address {}",
            profile.name_code(),
            profile.class_code(),
            psu.channel.unit_id()
        );
        Ok(psu)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn channel(&self) -> &RegisterChannel<S> {
        &self.channel
    }

    /// Return the displayed output voltage in volts.
    pub fn voltage(&self) -> Result<f64, S::Error> {
        self.read_scaled(Register::Voltage, self.profile.voltage_scale())
    }

    /// Return the configured target voltage in volts.
    pub fn target_voltage(&self) -> Result<f64, S::Error> {
        self.read_scaled(Register::TargetVoltage, self.profile.voltage_scale())
    }

    /// Set the output target voltage in volts.
    pub fn set_target_voltage(&self, voltage: f64) -> Result<(), S::Error> {
        debug!("Setting target voltage to {:.3} V", voltage);
        self.write_scaled(Register::TargetVoltage, self.profile.voltage_scale(), voltage)
    }

    /// Return the displayed output current in amps.
    pub fn current(&self) -> Result<f64, S::Error> {
        self.read_scaled(Register::Current, self.profile.current_scale())
    }

    /// Return the configured current limit in amps.
    pub fn current_limit(&self) -> Result<f64, S::Error> {
        self.read_scaled(Register::CurrentLimit, self.profile.current_scale())
    }

    /// Set the output current limit in amps.
    pub fn set_current_limit(&self, current: f64) -> Result<(), S::Error> {
        self.write_scaled(Register::CurrentLimit, self.profile.current_scale(), current)
    }

    /// Return the displayed output power in watts.
    pub fn power(&self) -> Result<f64, S::Error> {
        self.read_scaled(Register::Power, self.profile.power_scale())
    }

    pub fn readings(&self) -> Result<Readings, S::Error> {
        Ok(Readings {
            voltage: self.voltage()?,
            current: self.current()?,
            power: self.power()?,
        })
    }

    /// Write the provided protection thresholds. Omitted ones are left as they are.
    pub fn set_protection(&self, thresholds: ProtectionThresholds) -> Result<(), S::Error> {
        if let Some(volts) = thresholds.over_voltage {
            self.write_scaled(
                Register::OverVoltageThreshold,
                self.profile.voltage_scale(),
                volts,
            )?;
        }
        if let Some(amps) = thresholds.over_current {
            self.write_scaled(
                Register::OverCurrentThreshold,
                self.profile.current_scale(),
                amps,
            )?;
        }
        if let Some(watts) = thresholds.over_power {
            self.write_scaled(
                Register::OverPowerThreshold,
                self.profile.power_scale(),
                watts,
            )?;
        }
        Ok(())
    }

    /// Read all three protection thresholds back.
    pub fn protection_thresholds(&self) -> Result<ProtectionThresholds, S::Error> {
        Ok(ProtectionThresholds {
            over_voltage: Some(self.read_scaled(
                Register::OverVoltageThreshold,
                self.profile.voltage_scale(),
            )?),
            over_current: Some(self.read_scaled(
                Register::OverCurrentThreshold,
                self.profile.current_scale(),
            )?),
            over_power: Some(
                self.read_scaled(Register::OverPowerThreshold, self.profile.power_scale())?,
            ),
        })
    }

    /// Return which protections have tripped. Read fresh from the device every call.
    pub fn protection_state(&self) -> Result<ProtectionState, S::Error> {
        let raw = self.read_raw(Register::ProtectionState)?;
        Ok(ProtectionState::from(raw as u16))
    }

    /// Enable/disable the output. Disabling an already disabled output is fine.
    pub fn set_operative_mode(&self, enabled: bool) -> Result<(), S::Error> {
        debug!("Setting output {}", if enabled { "on" } else { "off" });
        self.channel.write_verified(
            Register::OperativeMode.address(),
            enabled as u32,
            Width::Single,
        )
    }

    /// Read whether the output is enabled or disabled.
    pub fn operative_mode(&self) -> Result<bool, S::Error> {
        Ok(self.read_raw(Register::OperativeMode)? != 0)
    }

    /// Get the current Modbus unit ID of this device.
    pub fn slave_address(&self) -> Result<u8, S::Error> {
        let raw = self.read_raw(Register::SlaveAddress)?;
        Ok(raw as u8)
    }

    /// Set the Modbus unit ID of this device and keep talking to it at the new address.
    pub fn set_slave_address(&mut self, address: u8) -> Result<(), S::Error> {
        self.channel.set_unit_id(address)
    }

    /// Set the target voltage, then wait for the displayed voltage to get within
    /// `tolerance` volts of it. Returns how long that took.
    pub fn set_voltage_and_settle(
        &self,
        voltage: f64,
        tolerance: f64,
        timeout: Duration,
        clock: &impl Clock,
    ) -> Result<Duration, S::Error> {
        let start = clock.now();
        self.set_target_voltage(voltage)?;
        loop {
            let displayed = self.voltage()?;
            let elapsed = clock.elapsed_since(start);
            if (displayed - voltage).abs() <= tolerance {
                info!(
                    "Voltage settled at {:.3} V after {:.1} s",
                    displayed,
                    as_secs_f64(elapsed)
                );
                return Ok(elapsed);
            }
            if elapsed >= timeout {
                return Err(Error::NotSettled {
                    target: voltage,
                    last: displayed,
                });
            }
            clock.sleep(SETTLE_POLL_INTERVAL);
        }
    }

    /// Disable the output, then zero the target voltage.
    ///
    /// The second step is attempted even if the first fails.
    pub fn shutdown(&self) -> TeardownReport<S::Error> {
        let output_disabled = self.set_operative_mode(false);
        if let Err(err) = &output_disabled {
            error!("Failed to disable output: {}", err);
        }
        let voltage_zeroed = self.set_target_voltage(0.0);
        if let Err(err) = &voltage_zeroed {
            error!("Failed to zero target voltage: {}", err);
        }
        TeardownReport {
            output_disabled,
            voltage_zeroed,
        }
    }

    /// Give the interface back.
    pub fn into_interface(self) -> S {
        self.channel.into_interface()
    }

    fn read_raw(&self, register: Register) -> Result<u32, S::Error> {
        self.channel.read(register.address(), register.width())
    }

    fn read_scaled(&self, register: Register, scale: Scale) -> Result<f64, S::Error> {
        Ok(scale.decode(self.read_raw(register)?))
    }

    fn write_scaled(&self, register: Register, scale: Scale, value: f64) -> Result<(), S::Error> {
        let raw = scale
            .encode(value, register.width())
            .ok_or(Error::InvalidRange { value })?;
        self.channel
            .write_verified(register.address(), raw, register.width())
    }
}
