use iris_payload::devices::{DeviceDescriptor, DeviceError, DeviceId};
use iris_payload::fault::{FaultBuffer, FaultCategory, FaultCode};
use iris_payload::health::{DeviceOps, HealthMonitor, HealthState};

/// Scripted device that counts every call it receives.
#[derive(Default)]
struct ScriptedDevice {
    fail_configure: bool,
    fail_reset: bool,
    /// Validate succeeds from this call onward (1-based); never if `None`.
    passes_from: Option<u32>,
    configures: u32,
    validates: u32,
    resets: u32,
}

impl DeviceOps for ScriptedDevice {
    fn configure(&mut self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        self.configures += 1;
        if self.fail_configure {
            return Err(DeviceError::Write { address: 0x4C, register: 0x09 });
        }
        Ok(())
    }

    fn validate(&mut self, _device: &DeviceDescriptor) -> bool {
        self.validates += 1;
        self.passes_from.is_some_and(|from| self.validates >= from)
    }

    fn reset(&mut self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        self.resets += 1;
        if self.fail_reset {
            return Err(DeviceError::Write { address: 0x4C, register: 0xFC });
        }
        Ok(())
    }
}

#[test]
fn test_setup_healthy_device() {
    let mut monitor = HealthMonitor::new(5);
    let mut device = ScriptedDevice {
        passes_from: Some(1),
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.setup(DeviceId::Temp1, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Healthy);
    assert_eq!(report.fault, None);
    assert_eq!(report.status_byte(), 0);
    assert!(faults.is_empty());
    assert_eq!(device.configures, 1);
    assert_eq!(device.validates, 1);
    assert_eq!(device.resets, 0);
    assert_eq!(monitor.record(DeviceId::Temp1).healthy_transitions, 1);
}

#[test]
fn test_validation_exhaustion_records_one_fault() {
    let mut monitor = HealthMonitor::new(3);
    let mut device = ScriptedDevice::default();
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.setup(DeviceId::Rail5V, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Faulted);
    assert_eq!(device.validates, 3);
    assert_eq!(device.resets, 2);
    assert_eq!(device.configures, 3);

    let expected = FaultCode::device(FaultCategory::Verification, DeviceId::Rail5V);
    assert_eq!(faults.as_slice(), &[expected]);
    assert_eq!(report.fault, Some(expected));

    let record = monitor.record(DeviceId::Rail5V);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.healthy_transitions, 0);
    assert_eq!(record.last_fault, Some(expected));
}

#[test]
fn test_recovers_within_bound() {
    let mut monitor = HealthMonitor::new(5);
    let mut device = ScriptedDevice {
        passes_from: Some(3),
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.setup(DeviceId::Temp2, &mut device, &mut faults);

    assert!(report.is_healthy());
    assert!(faults.is_empty());
    assert_eq!(device.resets, 2);
    assert_eq!(monitor.record(DeviceId::Temp2).attempts, 2);
}

#[test]
fn test_configure_failure_leaves_unconfigured() {
    let mut monitor = HealthMonitor::default();
    let mut device = ScriptedDevice {
        fail_configure: true,
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.setup(DeviceId::UsbHub, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Unconfigured);
    assert_eq!(device.validates, 0);
    assert_eq!(
        faults.as_slice(),
        &[FaultCode::device(FaultCategory::BusSetup, DeviceId::UsbHub)]
    );
}

#[test]
fn test_reset_failure_faults_device() {
    let mut monitor = HealthMonitor::default();
    let mut device = ScriptedDevice {
        fail_reset: true,
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.setup(DeviceId::Temp4, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Faulted);
    assert_eq!(device.validates, 1);
    assert_eq!(device.resets, 1);
    assert_eq!(
        faults.as_slice(),
        &[FaultCode::device(FaultCategory::Reset, DeviceId::Temp4)]
    );
}

#[test]
fn test_revalidate_healthy_skips_configure() {
    let mut monitor = HealthMonitor::default();
    let mut device = ScriptedDevice {
        passes_from: Some(1),
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    monitor.setup(DeviceId::Rail3V3, &mut device, &mut faults);
    let report = monitor.revalidate(DeviceId::Rail3V3, &mut device, &mut faults);

    assert!(report.is_healthy());
    assert_eq!(device.configures, 1);
    assert_eq!(device.validates, 2);
    assert_eq!(monitor.record(DeviceId::Rail3V3).healthy_transitions, 2);
}

#[test]
fn test_revalidate_healthy_keeps_attempt_count() {
    let mut monitor = HealthMonitor::new(3);
    let mut device = ScriptedDevice {
        passes_from: Some(3),
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    monitor.setup(DeviceId::Temp2, &mut device, &mut faults);
    assert_eq!(monitor.state(DeviceId::Temp2), HealthState::Healthy);
    assert_eq!(monitor.record(DeviceId::Temp2).attempts, 2);
    assert!(faults.is_empty());

    device.passes_from = None;
    let (validates, resets, configures) = (device.validates, device.resets, device.configures);
    let report = monitor.revalidate(DeviceId::Temp2, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Faulted);
    assert_eq!(device.validates - validates, 1);
    assert_eq!(device.resets - resets, 0);
    assert_eq!(device.configures - configures, 0);
    assert_eq!(
        faults.as_slice(),
        &[FaultCode::device(FaultCategory::Verification, DeviceId::Temp2)]
    );
    assert_eq!(monitor.record(DeviceId::Temp2).attempts, 3);
}

#[test]
fn test_revalidate_faulted_gets_fresh_budget() {
    let mut monitor = HealthMonitor::new(2);
    let mut device = ScriptedDevice::default();
    let mut faults: FaultBuffer = FaultBuffer::new();

    monitor.setup(DeviceId::Temp3, &mut device, &mut faults);
    assert_eq!(monitor.state(DeviceId::Temp3), HealthState::Faulted);

    device.passes_from = Some(device.validates + 2);
    let report = monitor.revalidate(DeviceId::Temp3, &mut device, &mut faults);

    assert!(report.is_healthy());
    assert_eq!(faults.count(), 1);
    assert_eq!(monitor.record(DeviceId::Temp3).attempts, 1);
}

#[test]
fn test_commanded_reset_runs_full_cycle() {
    let mut monitor = HealthMonitor::default();
    let mut device = ScriptedDevice {
        passes_from: Some(1),
        ..ScriptedDevice::default()
    };
    let mut faults: FaultBuffer = FaultBuffer::new();

    let report = monitor.reset(DeviceId::UsbHub, &mut device, &mut faults);

    assert!(report.is_healthy());
    assert_eq!((device.resets, device.configures, device.validates), (1, 1, 1));
}

#[test]
fn test_full_buffer_still_settles_device() {
    let mut monitor = HealthMonitor::new(1);
    let mut device = ScriptedDevice::default();
    let mut faults: FaultBuffer<1> = FaultBuffer::new();
    faults.append(FaultCode::link_test());

    let report = monitor.setup(DeviceId::Temp1, &mut device, &mut faults);

    assert_eq!(report.state, HealthState::Faulted);
    assert!(report.fault.is_some());
    assert_eq!(faults.as_slice(), &[FaultCode::link_test()]);
    assert_eq!(faults.rejected(), 1);
}

#[test]
fn test_every_call_returns_resting_state() {
    let scripts = [
        ScriptedDevice::default(),
        ScriptedDevice { fail_configure: true, ..ScriptedDevice::default() },
        ScriptedDevice { fail_reset: true, ..ScriptedDevice::default() },
        ScriptedDevice { passes_from: Some(2), ..ScriptedDevice::default() },
    ];
    for mut device in scripts {
        let mut monitor = HealthMonitor::new(3);
        let mut faults: FaultBuffer = FaultBuffer::new();
        for device_id in DeviceId::ALL {
            let before = faults.count();
            let report = monitor.setup(device_id, &mut device, &mut faults);
            assert!(report.state.is_resting());
            assert!(faults.count() - before <= 1);
        }
    }
}
