//! TMP421 remote/local temperature sensor.

use super::{BusSession, DeviceDescriptor, DeviceError, RegisterBus};
use tracing::warn;

pub const REG_LOCAL_HIGH: u8 = 0x00;
pub const REG_REMOTE_HIGH: u8 = 0x01;
pub const REG_STATUS: u8 = 0x08;
pub const REG_CONFIG_1: u8 = 0x09;
pub const REG_CONFIG_2: u8 = 0x0A;
pub const REG_REMOTE_LOW: u8 = 0x11;
pub const REG_SOFTWARE_RESET: u8 = 0xFC;
pub const REG_MANUFACTURER_ID: u8 = 0xFE;

pub const CONFIG_1_DEFAULT: u8 = 0x00;
/// Remote and local channels enabled, resistance correction on.
pub const CONFIG_2_DEFAULT: u8 = 0x1C;
pub const SOFTWARE_RESET: u8 = 0x01;
pub const MANUFACTURER_ID: u8 = 0x55;

/// Remote low byte flags.
pub const FLAG_OPEN_CIRCUIT: u8 = 0b01;
pub const FLAG_LOW_SUPPLY: u8 = 0b10;

pub const CONFIG_IMAGE: [(u8, u8); 2] = [
    (REG_CONFIG_1, CONFIG_1_DEFAULT),
    (REG_CONFIG_2, CONFIG_2_DEFAULT),
];

pub fn configure<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<(), DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    for (register, value) in CONFIG_IMAGE {
        session.write_u8(register, value)?;
    }
    Ok(())
}

/// Readback of the configuration plus the remote diode flags. An open or
/// under-supplied remote channel fails validation even if configured.
pub fn validate<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<bool, DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    for (register, expected) in CONFIG_IMAGE {
        let actual = session.read_u8(register)?;
        if actual != expected {
            warn!(
                "{} register 0x{:02X} reads 0x{:02X}, expected 0x{:02X}",
                device.id, register, actual, expected
            );
            return Ok(false);
        }
    }

    let flags = session.read_u8(REG_REMOTE_LOW)?;
    if flags & FLAG_OPEN_CIRCUIT != 0 {
        warn!("{} remote diode open circuit", device.id);
        return Ok(false);
    }
    if flags & FLAG_LOW_SUPPLY != 0 {
        warn!("{} supply below operating range", device.id);
        return Ok(false);
    }
    Ok(true)
}

pub fn reset<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<(), DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    session.write_u8(REG_SOFTWARE_RESET, SOFTWARE_RESET)
}

/// Remote channel temperature in whole degrees, sign-extended to a word.
pub fn read_temperature<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<u16, DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    let high = session.read_u8(REG_REMOTE_HIGH)?;
    Ok(i16::from(high as i8) as u16)
}

#[must_use]
pub fn celsius(raw: u16) -> i16 {
    raw as i16
}
