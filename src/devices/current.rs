//! INA209 power-rail monitor.
//!
//! Each rail monitor is programmed with an eleven-register image (configuration,
//! alert thresholds and calibration). Validation reads every register of the
//! image back; a reset sets the configuration reset bit, which returns the
//! part to power-on defaults and therefore requires a fresh configure.

use super::{BusSession, DeviceDescriptor, DeviceError, DeviceId, Quantity, RegisterBus};
use tracing::{debug, warn};

pub const REG_CONFIG: u8 = 0x00;
pub const REG_STATUS: u8 = 0x01;
pub const REG_FLAG_CONFIG: u8 = 0x02;
pub const REG_BUS_VOLTAGE: u8 = 0x04;
pub const REG_POWER: u8 = 0x05;
pub const REG_CURRENT: u8 = 0x06;
pub const REG_POWER_PEAK: u8 = 0x0B;
pub const REG_SHUNT_WARN_POS: u8 = 0x0C;
pub const REG_SHUNT_WARN_NEG: u8 = 0x0D;
pub const REG_POWER_WARN: u8 = 0x0E;
pub const REG_BUS_OVER_WARN: u8 = 0x0F;
pub const REG_BUS_UNDER_WARN: u8 = 0x10;
pub const REG_POWER_OVER_LIMIT: u8 = 0x11;
pub const REG_BUS_OVER_LIMIT: u8 = 0x12;
pub const REG_BUS_UNDER_LIMIT: u8 = 0x13;
pub const REG_CALIBRATION: u8 = 0x16;

/// 32 V range, 320 mV shunt range, 12-bit averaging, continuous shunt and bus.
pub const CONFIG_DEFAULT: u16 = 0b0011_0001_1001_1111;
/// Configuration with the reset bit set.
pub const CONFIG_RESET: u16 = 0xB99F;
const FLAG_CONFIG_DEFAULT: u16 = 0b0010_0000_0000_0010;
const BUS_OVER_LIMIT_DEFAULT: u16 = 0xFFF8;

/// Bus voltage register: bits 15..3, 4 mV per count.
pub const BUS_VOLTAGE_LSB_MV: f32 = 4.0;

pub const IMAGE_LEN: usize = 11;

/// Register/value pairs in the order they are written.
pub type ConfigImage = [(u8, u16); IMAGE_LEN];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RailProfile {
    pub power_warn: u16,
    pub power_over_limit: u16,
    pub calibration: u16,
    /// Amps per current-register count.
    pub current_lsb_a: f32,
    pub max_current_ma: f32,
}

impl RailProfile {
    /// Watts per power-register count.
    #[must_use]
    pub fn power_lsb_w(&self) -> f32 {
        self.current_lsb_a * 20.0
    }
}

const RAIL_3V3: RailProfile = RailProfile {
    power_warn: 667,
    power_over_limit: 1250,
    calibration: 27_307 << 1,
    current_lsb_a: 0.000_03,
    max_current_ma: 250.0,
};

const RAIL_5V: RailProfile = RailProfile {
    power_warn: 3334,
    power_over_limit: 6558,
    calibration: 13_430 << 1,
    current_lsb_a: 0.000_061,
    max_current_ma: 600.0,
};

const RAIL_CAM: RailProfile = RailProfile {
    power_warn: 4167,
    power_over_limit: 6558,
    calibration: 13_430 << 1,
    current_lsb_a: 0.000_061,
    max_current_ma: 1000.0,
};

#[must_use]
pub fn profile(id: DeviceId) -> &'static RailProfile {
    match id {
        DeviceId::Rail5V => &RAIL_5V,
        DeviceId::RailCam => &RAIL_CAM,
        _ => &RAIL_3V3,
    }
}

#[must_use]
pub fn config_image(id: DeviceId) -> ConfigImage {
    let rail = profile(id);
    [
        (REG_CONFIG, CONFIG_DEFAULT),
        (REG_FLAG_CONFIG, FLAG_CONFIG_DEFAULT),
        (REG_SHUNT_WARN_POS, 0),
        (REG_SHUNT_WARN_NEG, 0),
        (REG_POWER_WARN, rail.power_warn),
        (REG_BUS_OVER_WARN, 0),
        (REG_BUS_UNDER_WARN, 0),
        (REG_POWER_OVER_LIMIT, rail.power_over_limit),
        (REG_BUS_OVER_LIMIT, BUS_OVER_LIMIT_DEFAULT),
        (REG_BUS_UNDER_LIMIT, 0),
        (REG_CALIBRATION, rail.calibration),
    ]
}

pub fn configure<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<(), DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    for (register, value) in config_image(device.id) {
        session.write_u16(register, value)?;
    }
    debug!("Configured {}", device.id);
    Ok(())
}

pub fn validate<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<bool, DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    for (register, expected) in config_image(device.id) {
        let actual = session.read_u16(register)?;
        if actual != expected {
            warn!(
                "{} register 0x{:02X} reads 0x{:04X}, expected 0x{:04X}",
                device.id, register, actual, expected
            );
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn reset<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
) -> Result<(), DeviceError> {
    let mut session = BusSession::open(bus, device.address)?;
    session.write_u16(REG_CONFIG, CONFIG_RESET)
}

#[must_use]
pub const fn register_for(quantity: Quantity) -> Option<u8> {
    match quantity {
        Quantity::Current => Some(REG_CURRENT),
        Quantity::BusVoltage => Some(REG_BUS_VOLTAGE),
        Quantity::Power => Some(REG_POWER),
        Quantity::PeakPower => Some(REG_POWER_PEAK),
        Quantity::Temperature => None,
    }
}

pub fn read<B: RegisterBus + ?Sized>(
    bus: &mut B,
    device: &DeviceDescriptor,
    quantity: Quantity,
) -> Result<u16, DeviceError> {
    let register = register_for(quantity).ok_or(DeviceError::Unsupported {
        class: device.class,
        quantity,
    })?;
    let mut session = BusSession::open(bus, device.address)?;
    session.read_u16(register)
}

/// Current register is two's complement.
#[must_use]
pub fn current_ma(id: DeviceId, raw: u16) -> f32 {
    f32::from(raw as i16) * profile(id).current_lsb_a * 1000.0
}

#[must_use]
pub fn power_mw(id: DeviceId, raw: u16) -> f32 {
    f32::from(raw) * profile(id).power_lsb_w() * 1000.0
}

#[must_use]
pub fn bus_voltage_mv(raw: u16) -> f32 {
    f32::from(raw >> 3) * BUS_VOLTAGE_LSB_MV
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_starts_with_config_and_ends_with_calibration() {
        for id in DeviceId::RAILS {
            let image = config_image(id);
            assert_eq!(image[0], (REG_CONFIG, CONFIG_DEFAULT));
            assert_eq!(image[IMAGE_LEN - 1].0, REG_CALIBRATION);
        }
        assert_eq!(config_image(DeviceId::Rail3V3)[IMAGE_LEN - 1].1, 54_614);
    }

    #[test]
    fn test_current_conversion_is_signed() {
        let positive = current_ma(DeviceId::Rail3V3, 1000);
        let negative = current_ma(DeviceId::Rail3V3, (-1000i16) as u16);
        assert!((positive - 30.0).abs() < 0.01);
        assert!((negative + 30.0).abs() < 0.01);
    }

    #[test]
    fn test_bus_voltage_drops_status_bits() {
        assert!((bus_voltage_mv((1250 << 3) | 0b011) - 5000.0).abs() < f32::EPSILON);
    }
}
