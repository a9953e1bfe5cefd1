//! USB2512B hub. Only the configuration bytes and indicator lines are
//! checked; the hub's wider register layout is left alone.

use super::{
    BusSession, DeviceDescriptor, DeviceError, Line, LineControl, LineLevel, RegisterBus,
};
use tracing::warn;

pub const REG_CONFIG_1: u8 = 0x06;
pub const REG_CONFIG_2: u8 = 0x07;
pub const REG_CONFIG_3: u8 = 0x08;

pub const CONFIG_IMAGE: [(u8, u8); 3] = [
    (REG_CONFIG_1, 0x9B),
    (REG_CONFIG_2, 0x20),
    (REG_CONFIG_3, 0x02),
];

/// Both indicators idle low once the hub has accepted its configuration.
const INDICATOR_IDLE: LineLevel = LineLevel::Low;

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

pub fn validate<B: RegisterBus + ?Sized, L: LineControl + ?Sized>(
    bus: &mut B,
    lines: &mut L,
    device: &DeviceDescriptor,
) -> Result<bool, DeviceError> {
    {
        let mut session = BusSession::open(bus, device.address)?;
        for (register, expected) in CONFIG_IMAGE {
            let actual = session.read_u8(register)?;
            if actual != expected {
                warn!(
                    "Hub register 0x{:02X} reads 0x{:02X}, expected 0x{:02X}",
                    register, actual, expected
                );
                return Ok(false);
            }
        }
    }

    for line in [Line::HubHighSpeedIndicator, Line::HubSetupIndicator] {
        if lines.get(line)? != INDICATOR_IDLE {
            warn!("Hub {:?} asserted", line);
            return Ok(false);
        }
    }
    Ok(true)
}

/// Pulses the active-low reset line. The line is released even if
/// asserting it fails part-way.
pub fn reset<L: LineControl + ?Sized>(lines: &mut L) -> Result<(), DeviceError> {
    let asserted = lines.set(Line::HubReset, LineLevel::Low);
    let released = lines.set(Line::HubReset, LineLevel::High);
    asserted.and(released)
}
