//! Device health supervision.
//!
//! Every peripheral runs the same state machine, parameterised only by the
//! [`DeviceOps`] capability of its class:
//!
//! ```text
//! Unconfigured -> Configuring -> Validating -> Healthy
//!                      ^             |
//!                      |             v
//!                      +-------- Resetting        Validating/Resetting -> Faulted
//! ```
//!
//! A call always returns with the device in a resting state
//! (`Unconfigured`, `Healthy` or `Faulted`) and records at most one fault.

use crate::devices::{DeviceDescriptor, DeviceError, DeviceId, DEVICE_COUNT};
use crate::fault::{FaultBuffer, FaultCategory, FaultCode, NO_FAULT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_ATTEMPT_BOUND: u8 = 5;

/// Per-class transport capability injected into the state machine.
pub trait DeviceOps {
    fn configure(&mut self, device: &DeviceDescriptor) -> Result<(), DeviceError>;
    fn validate(&mut self, device: &DeviceDescriptor) -> bool;
    fn reset(&mut self, device: &DeviceDescriptor) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HealthState {
    Unconfigured = 0,
    Configuring = 1,
    Validating = 2,
    Resetting = 3,
    Healthy = 4,
    Faulted = 5,
}

impl HealthState {
    #[must_use]
    pub const fn is_resting(self) -> bool {
        matches!(self, Self::Unconfigured | Self::Healthy | Self::Faulted)
    }

    /// Inverse of the status byte reported by the status opcodes.
    #[must_use]
    pub const fn from_repr(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unconfigured),
            1 => Some(Self::Configuring),
            2 => Some(Self::Validating),
            3 => Some(Self::Resetting),
            4 => Some(Self::Healthy),
            5 => Some(Self::Faulted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthRecord {
    pub device: DeviceId,
    pub state: HealthState,
    pub attempts: u8,
    pub last_fault: Option<FaultCode>,
    pub healthy_transitions: u32,
}

impl HealthRecord {
    const fn new(device: DeviceId) -> Self {
        Self {
            device,
            state: HealthState::Unconfigured,
            attempts: 0,
            last_fault: None,
            healthy_transitions: 0,
        }
    }
}

/// Result of one controller call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub device: DeviceId,
    pub state: HealthState,
    /// The fault raised by this call, whether or not the buffer accepted it.
    pub fault: Option<FaultCode>,
}

impl CycleReport {
    /// Single-byte status echoed to the controller.
    #[must_use]
    pub fn status_byte(&self) -> u8 {
        self.fault.map_or(NO_FAULT, |code| code.narrow())
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    records: [HealthRecord; DEVICE_COUNT],
    attempt_bound: u8,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(attempt_bound: u8) -> Self {
        Self {
            records: DeviceId::ALL.map(HealthRecord::new),
            attempt_bound: attempt_bound.max(1),
        }
    }

    #[must_use]
    pub const fn attempt_bound(&self) -> u8 {
        self.attempt_bound
    }

    #[must_use]
    pub fn record(&self, device: DeviceId) -> &HealthRecord {
        &self.records[usize::from(device.slot())]
    }

    #[must_use]
    pub fn state(&self, device: DeviceId) -> HealthState {
        self.record(device).state
    }

    #[must_use]
    pub fn records(&self) -> &[HealthRecord] {
        &self.records
    }

    /// Externally triggered setup. Starts a fresh attempt budget.
    pub fn setup<O: DeviceOps + ?Sized, const N: usize>(
        &mut self,
        device: DeviceId,
        ops: &mut O,
        faults: &mut FaultBuffer<N>,
    ) -> CycleReport {
        let record = self.record_mut(device);
        record.attempts = 0;
        record.state = HealthState::Configuring;
        self.drive(device, ops, faults)
    }

    /// Periodic or commanded re-validation. A healthy device keeps its
    /// attempt count; an unconfigured or faulted one gets a fresh budget.
    pub fn revalidate<O: DeviceOps + ?Sized, const N: usize>(
        &mut self,
        device: DeviceId,
        ops: &mut O,
        faults: &mut FaultBuffer<N>,
    ) -> CycleReport {
        let record = self.record_mut(device);
        if record.state != HealthState::Healthy {
            record.attempts = 0;
        }
        record.state = HealthState::Validating;
        self.drive(device, ops, faults)
    }

    /// Commanded reset followed by the usual configure and validate.
    pub fn reset<O: DeviceOps + ?Sized, const N: usize>(
        &mut self,
        device: DeviceId,
        ops: &mut O,
        faults: &mut FaultBuffer<N>,
    ) -> CycleReport {
        let record = self.record_mut(device);
        record.attempts = 0;
        record.state = HealthState::Resetting;
        self.drive(device, ops, faults)
    }

    fn record_mut(&mut self, device: DeviceId) -> &mut HealthRecord {
        &mut self.records[usize::from(device.slot())]
    }

    fn drive<O: DeviceOps + ?Sized, const N: usize>(
        &mut self,
        device: DeviceId,
        ops: &mut O,
        faults: &mut FaultBuffer<N>,
    ) -> CycleReport {
        let bound = self.attempt_bound;
        let descriptor = device.descriptor();
        let record = self.record_mut(device);

        loop {
            match record.state {
                HealthState::Configuring => match ops.configure(&descriptor) {
                    Ok(()) => record.state = HealthState::Validating,
                    Err(e) => {
                        warn!("Configuring {} failed: {}", device, e);
                        return settle(record, FaultCategory::BusSetup, HealthState::Unconfigured, faults);
                    }
                },
                HealthState::Validating => {
                    if ops.validate(&descriptor) {
                        record.state = HealthState::Healthy;
                        record.healthy_transitions = record.healthy_transitions.saturating_add(1);
                        debug!("{} healthy after {} failed attempts", device, record.attempts);
                        return CycleReport {
                            device,
                            state: record.state,
                            fault: None,
                        };
                    }
                    record.attempts = record.attempts.saturating_add(1);
                    if record.attempts < bound {
                        info!("{} failed validation ({}/{}), resetting", device, record.attempts, bound);
                        record.state = HealthState::Resetting;
                    } else {
                        return settle(record, FaultCategory::Verification, HealthState::Faulted, faults);
                    }
                }
                HealthState::Resetting => match ops.reset(&descriptor) {
                    Ok(()) => record.state = HealthState::Configuring,
                    Err(e) => {
                        warn!("Resetting {} failed: {}", device, e);
                        return settle(record, FaultCategory::Reset, HealthState::Faulted, faults);
                    }
                },
                HealthState::Unconfigured | HealthState::Healthy | HealthState::Faulted => {
                    return CycleReport {
                        device,
                        state: record.state,
                        fault: None,
                    };
                }
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_BOUND)
    }
}

fn settle<const N: usize>(
    record: &mut HealthRecord,
    category: FaultCategory,
    state: HealthState,
    faults: &mut FaultBuffer<N>,
) -> CycleReport {
    let fault = FaultCode::device(category, record.device);
    record.state = state;
    record.last_fault = Some(fault);
    warn!("{} is {:?}: {}", record.device, state, fault);
    faults.append(fault);

    // NASA Rule 5: Safety assertion for resting state
    debug_assert!(record.state.is_resting(), "Controller left a transient state");

    CycleReport {
        device: record.device,
        state,
        fault: Some(fault),
    }
}
