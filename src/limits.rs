use crate::devices::{
    classify_word, current, thermal, DeviceClass, DeviceId, PeripheralPort, Quantity, POWER_RAILS,
    TEMPERATURE_CHANNELS,
};
use crate::fault::{FaultBuffer, FaultCategory, FaultCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitBand {
    pub min: f32,
    pub max: f32,
}

impl LimitBand {
    #[must_use]
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Symmetric band around zero.
    #[must_use]
    pub fn magnitude(max: f32) -> Self {
        Self { min: -max, max }
    }

    #[must_use]
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Degrees Celsius, per channel.
    pub temperature_c: [LimitBand; TEMPERATURE_CHANNELS],
    /// Milliamps, per rail.
    pub current_ma: [LimitBand; POWER_RAILS],
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            temperature_c: [LimitBand::new(-50.0, 100.0); TEMPERATURE_CHANNELS],
            current_ma: DeviceId::RAILS.map(|id| LimitBand::magnitude(current::profile(id).max_current_ma)),
        }
    }
}

impl LimitConfig {
    #[must_use]
    pub fn band(&self, device: DeviceId) -> Option<LimitBand> {
        match device.class() {
            DeviceClass::Temperature => {
                self.temperature_c.get(device.class_index()).copied()
            }
            DeviceClass::CurrentMonitor => {
                self.current_ma.get(device.class_index()).copied()
            }
            DeviceClass::UsbHub => None,
        }
    }
}

/// Reads each temperature channel and records read failures and excursions.
/// Returns the number of faults raised, accepted by the buffer or not.
pub fn check_temperatures<P: PeripheralPort + ?Sized, const N: usize>(
    port: &mut P,
    limits: &LimitConfig,
    faults: &mut FaultBuffer<N>,
) -> usize {
    check(port, limits, &DeviceId::TEMPERATURE, Quantity::Temperature, faults, |_, raw| {
        f32::from(thermal::celsius(raw))
    })
}

/// Reads each rail's current and records read failures and excursions.
pub fn check_currents<P: PeripheralPort + ?Sized, const N: usize>(
    port: &mut P,
    limits: &LimitConfig,
    faults: &mut FaultBuffer<N>,
) -> usize {
    check(port, limits, &DeviceId::RAILS, Quantity::Current, faults, current::current_ma)
}

fn check<P, F, const N: usize>(
    port: &mut P,
    limits: &LimitConfig,
    devices: &[DeviceId],
    quantity: Quantity,
    faults: &mut FaultBuffer<N>,
    convert: F,
) -> usize
where
    P: PeripheralPort + ?Sized,
    F: Fn(DeviceId, u16) -> f32,
{
    let mut raised = 0;
    for &device in devices {
        let Some(band) = limits.band(device) else {
            continue;
        };
        let raw = port.read_word(&device.descriptor(), quantity);
        let fault = match classify_word(device, raw) {
            Err(code) => Some(code),
            Ok(raw) => {
                let value = convert(device, raw);
                if band.contains(value) {
                    None
                } else {
                    warn!(
                        "{} {:?} {:.1} outside [{:.1}, {:.1}]",
                        device, quantity, value, band.min, band.max
                    );
                    Some(FaultCode::device(FaultCategory::Limit, device))
                }
            }
        };
        if let Some(code) = fault {
            faults.append(code);
            raised += 1;
        }
    }
    raised
}
