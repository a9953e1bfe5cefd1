pub mod current;
pub mod hub;
pub mod thermal;

use crate::fault::{FaultCategory, FaultCode};
use crate::health::DeviceOps;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEVICE_COUNT: usize = 8;
pub const TEMPERATURE_CHANNELS: usize = 4;
pub const POWER_RAILS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    CurrentMonitor,
    Temperature,
    UsbHub,
}

/// The compiled-in set of peripherals. Nothing outside this set can be
/// addressed, so a descriptor is always valid by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceId {
    Temp1,
    Temp2,
    Temp3,
    Temp4,
    Rail3V3,
    Rail5V,
    RailCam,
    UsbHub,
}

impl DeviceId {
    pub const ALL: [DeviceId; DEVICE_COUNT] = [
        Self::Temp1,
        Self::Temp2,
        Self::Temp3,
        Self::Temp4,
        Self::Rail3V3,
        Self::Rail5V,
        Self::RailCam,
        Self::UsbHub,
    ];

    pub const TEMPERATURE: [DeviceId; TEMPERATURE_CHANNELS] =
        [Self::Temp1, Self::Temp2, Self::Temp3, Self::Temp4];

    pub const RAILS: [DeviceId; POWER_RAILS] = [Self::Rail3V3, Self::Rail5V, Self::RailCam];

    /// Position in [`DeviceId::ALL`]; also the low nibble of narrow fault codes.
    #[must_use]
    pub const fn slot(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_slot(slot: u8) -> Option<Self> {
        Self::ALL.get(usize::from(slot)).copied()
    }

    #[must_use]
    pub const fn class(self) -> DeviceClass {
        match self {
            Self::Temp1 | Self::Temp2 | Self::Temp3 | Self::Temp4 => DeviceClass::Temperature,
            Self::Rail3V3 | Self::Rail5V | Self::RailCam => DeviceClass::CurrentMonitor,
            Self::UsbHub => DeviceClass::UsbHub,
        }
    }

    #[must_use]
    pub const fn address(self) -> u8 {
        match self {
            Self::Temp1 => 0x4C,
            Self::Temp2 => 0x4D,
            Self::Temp3 => 0x4E,
            Self::Temp4 => 0x4F,
            Self::Rail3V3 => 0x45,
            Self::Rail5V => 0x40,
            Self::RailCam => 0x41,
            Self::UsbHub => 0x2C,
        }
    }

    #[must_use]
    pub fn from_address(address: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.address() == address)
    }

    /// Maps a 1-based power-rail selector from a command argument.
    #[must_use]
    pub fn rail(selector: u8) -> Option<Self> {
        selector
            .checked_sub(1)
            .and_then(|index| Self::RAILS.get(usize::from(index)).copied())
    }

    /// Maps a 1-based temperature channel selector from a command argument.
    #[must_use]
    pub fn temperature_channel(selector: u8) -> Option<Self> {
        selector
            .checked_sub(1)
            .and_then(|index| Self::TEMPERATURE.get(usize::from(index)).copied())
    }

    /// Index within the device's own class.
    #[must_use]
    pub const fn class_index(self) -> usize {
        match self {
            Self::Temp1 | Self::Rail3V3 | Self::UsbHub => 0,
            Self::Temp2 | Self::Rail5V => 1,
            Self::Temp3 | Self::RailCam => 2,
            Self::Temp4 => 3,
        }
    }

    #[must_use]
    pub const fn descriptor(self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self,
            address: self.address(),
            class: self.class(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Temp1 => "temperature 1",
            Self::Temp2 => "temperature 2",
            Self::Temp3 => "temperature 3",
            Self::Temp4 => "temperature 4",
            Self::Rail3V3 => "3V3 rail monitor",
            Self::Rail5V => "5V rail monitor",
            Self::RailCam => "camera rail monitor",
            Self::UsbHub => "USB hub",
        };
        f.write_str(name)
    }
}

/// Immutable bus address and class of one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub address: u8,
    pub class: DeviceClass,
}

/// A value that can be read from a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantity {
    Current,
    BusVoltage,
    Power,
    PeakPower,
    Temperature,
}

impl Quantity {
    #[must_use]
    pub const fn class(self) -> DeviceClass {
        match self {
            Self::Temperature => DeviceClass::Temperature,
            Self::Current | Self::BusVoltage | Self::Power | Self::PeakPower => {
                DeviceClass::CurrentMonitor
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("failed to open bus device at 0x{address:02X}")]
    Open { address: u8 },
    #[error("write to register 0x{register:02X} of 0x{address:02X} failed")]
    Write { address: u8, register: u8 },
    #[error("read from register 0x{register:02X} of 0x{address:02X} failed")]
    Read { address: u8, register: u8 },
    #[error("{line:?} line access failed")]
    Line { line: Line },
    #[error("{quantity:?} cannot be read from a {class:?} device")]
    Unsupported { class: DeviceClass, quantity: Quantity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusHandle(pub u32);

/// Register-oriented peripheral bus.
pub trait RegisterBus {
    fn open(&mut self, address: u8) -> Result<BusHandle, DeviceError>;
    fn write_register(&mut self, handle: BusHandle, register: u8, data: &[u8])
        -> Result<(), DeviceError>;
    fn read_register(&mut self, handle: BusHandle, register: u8, buf: &mut [u8])
        -> Result<(), DeviceError>;
    fn close(&mut self, handle: BusHandle);
}

/// One bus transaction. The handle is closed when the session drops, on
/// every exit path.
pub struct BusSession<'a, B: RegisterBus + ?Sized> {
    bus: &'a mut B,
    handle: BusHandle,
    address: u8,
}

impl<'a, B: RegisterBus + ?Sized> BusSession<'a, B> {
    pub fn open(bus: &'a mut B, address: u8) -> Result<Self, DeviceError> {
        let handle = bus.open(address)?;
        Ok(Self {
            bus,
            handle,
            address,
        })
    }

    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    pub fn write_u8(&mut self, register: u8, value: u8) -> Result<(), DeviceError> {
        self.bus.write_register(self.handle, register, &[value])
    }

    /// Sixteen-bit registers are big-endian on the wire.
    pub fn write_u16(&mut self, register: u8, value: u16) -> Result<(), DeviceError> {
        self.bus
            .write_register(self.handle, register, &value.to_be_bytes())
    }

    pub fn read_u8(&mut self, register: u8) -> Result<u8, DeviceError> {
        let mut buf = [0u8; 1];
        self.bus.read_register(self.handle, register, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, register: u8) -> Result<u16, DeviceError> {
        let mut buf = [0u8; 2];
        self.bus.read_register(self.handle, register, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }
}

impl<B: RegisterBus + ?Sized> Drop for BusSession<'_, B> {
    fn drop(&mut self) {
        self.bus.close(self.handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Line {
    /// Active-low hub reset.
    HubReset,
    HubHighSpeedIndicator,
    HubSetupIndicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineLevel {
    Low,
    High,
}

/// Discrete control and indicator lines.
pub trait LineControl {
    fn get(&mut self, line: Line) -> Result<LineLevel, DeviceError>;
    fn set(&mut self, line: Line, level: LineLevel) -> Result<(), DeviceError>;
}

/// Health operations plus measurement reads.
pub trait PeripheralPort: DeviceOps {
    /// Reads a raw measurement word. Bus failures are reported in-band as
    /// the device's wide measurement fault word, so callers must classify
    /// the result with [`classify_word`].
    fn read_word(&mut self, device: &DeviceDescriptor, quantity: Quantity) -> u16;
}

/// Splits a raw measurement word into a value or the fault it encodes.
/// Only the device's own measurement fault word is in-band.
pub fn classify_word(device: DeviceId, word: u16) -> Result<u16, FaultCode> {
    let fault = FaultCode::device(FaultCategory::Measurement, device);
    if word == fault.wide() {
        Err(fault)
    } else {
        Ok(word)
    }
}

/// Real peripherals behind a register bus and discrete lines.
pub struct Peripherals<B, L> {
    bus: B,
    lines: L,
    reset_settle: Duration,
}

impl<B: RegisterBus, L: LineControl> Peripherals<B, L> {
    pub fn new(bus: B, lines: L, reset_settle: Duration) -> Self {
        Self {
            bus,
            lines,
            reset_settle,
        }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    fn read(&mut self, device: &DeviceDescriptor, quantity: Quantity) -> Result<u16, DeviceError> {
        if quantity.class() != device.class {
            return Err(DeviceError::Unsupported {
                class: device.class,
                quantity,
            });
        }
        match device.class {
            DeviceClass::CurrentMonitor => current::read(&mut self.bus, device, quantity),
            DeviceClass::Temperature => thermal::read_temperature(&mut self.bus, device),
            DeviceClass::UsbHub => Err(DeviceError::Unsupported {
                class: device.class,
                quantity,
            }),
        }
    }
}

impl<B: RegisterBus, L: LineControl> DeviceOps for Peripherals<B, L> {
    fn configure(&mut self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        match device.class {
            DeviceClass::CurrentMonitor => current::configure(&mut self.bus, device),
            DeviceClass::Temperature => thermal::configure(&mut self.bus, device),
            DeviceClass::UsbHub => hub::configure(&mut self.bus, device),
        }
    }

    fn validate(&mut self, device: &DeviceDescriptor) -> bool {
        let result = match device.class {
            DeviceClass::CurrentMonitor => current::validate(&mut self.bus, device),
            DeviceClass::Temperature => thermal::validate(&mut self.bus, device),
            DeviceClass::UsbHub => hub::validate(&mut self.bus, &mut self.lines, device),
        };
        match result {
            Ok(valid) => valid,
            Err(e) => {
                debug!("Validation of {} aborted: {}", device.id, e);
                false
            }
        }
    }

    fn reset(&mut self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        match device.class {
            DeviceClass::CurrentMonitor => current::reset(&mut self.bus, device),
            DeviceClass::Temperature => {
                thermal::reset(&mut self.bus, device)?;
                if !self.reset_settle.is_zero() {
                    std::thread::sleep(self.reset_settle);
                }
                Ok(())
            }
            DeviceClass::UsbHub => hub::reset(&mut self.lines),
        }
    }
}

impl<B: RegisterBus, L: LineControl> PeripheralPort for Peripherals<B, L> {
    fn read_word(&mut self, device: &DeviceDescriptor, quantity: Quantity) -> u16 {
        match self.read(device, quantity) {
            Ok(word) => word,
            Err(e @ DeviceError::Unsupported { .. }) => {
                error!("{}", e);
                FaultCode::device(FaultCategory::Measurement, device.id).wide()
            }
            Err(e) => {
                warn!("{:?} read from {} failed: {}", quantity, device.id, e);
                FaultCode::device(FaultCategory::Measurement, device.id).wide()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_are_one_based() {
        assert_eq!(DeviceId::rail(0), None);
        assert_eq!(DeviceId::rail(1), Some(DeviceId::Rail3V3));
        assert_eq!(DeviceId::rail(3), Some(DeviceId::RailCam));
        assert_eq!(DeviceId::rail(4), None);
        assert_eq!(DeviceId::temperature_channel(4), Some(DeviceId::Temp4));
        assert_eq!(DeviceId::temperature_channel(5), None);
    }

    #[test]
    fn test_addresses_are_unique() {
        for id in DeviceId::ALL {
            assert_eq!(DeviceId::from_address(id.address()), Some(id));
            assert_eq!(DeviceId::from_slot(id.slot()), Some(id));
        }
    }

    #[test]
    fn test_classify_only_matches_own_slot() {
        let word = FaultCode::device(FaultCategory::Measurement, DeviceId::Rail5V).wide();
        assert!(classify_word(DeviceId::Rail5V, word).is_err());
        assert_eq!(classify_word(DeviceId::Rail3V3, word), Ok(word));
        assert_eq!(classify_word(DeviceId::Rail5V, 0x1234), Ok(0x1234));
    }

    #[test]
    fn test_classify_reads_other_categories_as_values() {
        for category in [
            FaultCategory::BusSetup,
            FaultCategory::Verification,
            FaultCategory::Reset,
            FaultCategory::Limit,
        ] {
            let word = FaultCode::device(category, DeviceId::Rail3V3).wide();
            assert_eq!(classify_word(DeviceId::Rail3V3, word), Ok(word));
        }
        let measurement = FaultCode::device(FaultCategory::Measurement, DeviceId::Rail3V3);
        assert_eq!(classify_word(DeviceId::Rail3V3, measurement.wide()), Err(measurement));
    }
}
