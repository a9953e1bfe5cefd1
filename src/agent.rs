use crate::config::PayloadConfig;
use crate::devices::{DeviceId, PeripheralPort, DEVICE_COUNT};
use crate::dispatch::{self, DispatchContext, DispatchOutcome, Reply};
use crate::fault::FaultBuffer;
use crate::health::{CycleReport, HealthMonitor};
use crate::limits;
use crate::link::{self, EdgeSource, LinkError, LinkTransport, TransferOutcome};
use crate::protocol::{CommandFrame, ResponseFrame};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub commands: u32,
    pub format_errors: u32,
    pub housekeeping_passes: u32,
    pub faults_transferred: u32,
    pub transfer_failures: u32,
}

/// Outcome of start-up initialisation.
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub devices: Vec<CycleReport, DEVICE_COUNT>,
}

impl InitReport {
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.devices.iter().all(CycleReport::is_healthy)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &CycleReport> {
        self.devices.iter().filter(|report| !report.is_healthy())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HousekeepingReport {
    pub revalidated: Vec<CycleReport, DEVICE_COUNT>,
    /// Faults raised by the limit checks this pass.
    pub limit_faults: usize,
    pub pending_faults: usize,
}

/// Owns every piece of process-wide state: peripherals, health records,
/// the fault buffer and the housekeeping clock.
pub struct PayloadAgent<P> {
    peripherals: P,
    health: HealthMonitor,
    faults: FaultBuffer,
    config: PayloadConfig,
    last_housekeeping: Option<Instant>,
    stats: AgentStats,
}

impl<P: PeripheralPort> PayloadAgent<P> {
    pub fn new(peripherals: P, config: PayloadConfig) -> Self {
        Self {
            peripherals,
            health: HealthMonitor::new(config.attempt_bound),
            faults: FaultBuffer::new(),
            config,
            last_housekeeping: None,
            stats: AgentStats::default(),
        }
    }

    /// Runs a setup cycle for every temperature channel, power rail and the hub.
    pub fn initialize(&mut self) -> InitReport {
        let mut report = InitReport::default();
        let order = DeviceId::TEMPERATURE
            .into_iter()
            .chain(DeviceId::RAILS)
            .chain([DeviceId::UsbHub]);
        for device in order {
            let cycle = self.health.setup(device, &mut self.peripherals, &mut self.faults);
            let _ = report.devices.push(cycle);
        }

        for cycle in report.unhealthy() {
            warn!("{} not ready after init: {:?}", cycle.device, cycle.state);
        }
        info!(
            "Initialised {} devices, {} faults pending",
            report.devices.len(),
            self.faults.count()
        );
        report
    }

    fn context(&mut self) -> DispatchContext<'_, P> {
        DispatchContext {
            health: &mut self.health,
            peripherals: &mut self.peripherals,
            faults: &mut self.faults,
            limits: &self.config.limits,
        }
    }

    pub fn handle_command(&mut self, frame: &CommandFrame) -> Reply {
        self.stats.commands = self.stats.commands.wrapping_add(1);
        let reply = dispatch::handle(frame, &mut self.context());
        if reply == Reply::Frame(ResponseFrame::format_error()) {
            self.stats.format_errors = self.stats.format_errors.wrapping_add(1);
        }
        reply
    }

    /// Decodes and handles a raw frame; an empty frame is a format error.
    pub fn handle_raw(&mut self, raw: &[u8]) -> Reply {
        match CommandFrame::decode(raw) {
            Ok(frame) => self.handle_command(&frame),
            Err(e) => {
                debug!("Undecodable frame: {}", e);
                self.stats.format_errors = self.stats.format_errors.wrapping_add(1);
                Reply::Frame(ResponseFrame::format_error())
            }
        }
    }

    /// Waits a bounded time for one command and answers it on the link.
    pub fn serve<L, E>(
        &mut self,
        link: &mut L,
        edges: &mut E,
    ) -> Result<Option<DispatchOutcome>, LinkError>
    where
        L: LinkTransport + ?Sized,
        E: EdgeSource + ?Sized,
    {
        let Some(raw) = link::await_frame(link, edges, self.config.link_timing())? else {
            return Ok(None);
        };
        let reply = self.handle_raw(&raw);
        let outcome = dispatch::respond(reply, link, &mut self.faults)?;
        if let DispatchOutcome::Transferred(TransferOutcome::Sent { count }) = outcome {
            self.stats.faults_transferred = self.stats.faults_transferred.wrapping_add(count as u32);
        }
        Ok(Some(outcome))
    }

    #[must_use]
    pub fn housekeeping_due(&self, now: Instant) -> bool {
        self.last_housekeeping
            .map_or(true, |last| now.duration_since(last) >= self.config.housekeeping_period())
    }

    /// Re-validates temperature channels then power rails, then runs both
    /// limit checks.
    pub fn run_housekeeping(&mut self, now: Instant) -> HousekeepingReport {
        self.last_housekeeping = Some(now);
        self.stats.housekeeping_passes = self.stats.housekeeping_passes.wrapping_add(1);

        let mut report = HousekeepingReport::default();
        for device in DeviceId::TEMPERATURE.into_iter().chain(DeviceId::RAILS) {
            let cycle = self.health.revalidate(device, &mut self.peripherals, &mut self.faults);
            let _ = report.revalidated.push(cycle);
        }

        report.limit_faults +=
            limits::check_temperatures(&mut self.peripherals, &self.config.limits, &mut self.faults);
        report.limit_faults +=
            limits::check_currents(&mut self.peripherals, &self.config.limits, &mut self.faults);
        report.pending_faults = self.faults.count();

        debug!(
            "Housekeeping pass {}: {} limit faults, {} pending",
            self.stats.housekeeping_passes, report.limit_faults, report.pending_faults
        );
        report
    }

    /// Sends pending faults through the transfer gate.
    pub fn transfer_faults<L: LinkTransport + ?Sized>(
        &mut self,
        link: &mut L,
    ) -> Result<TransferOutcome, LinkError> {
        let outcome = link::try_send_errors(link, &mut self.faults);
        match outcome {
            Ok(TransferOutcome::Sent { count }) => {
                self.stats.faults_transferred = self.stats.faults_transferred.wrapping_add(count as u32);
            }
            Ok(TransferOutcome::Deferred) => {}
            Err(_) => self.stats.transfer_failures = self.stats.transfer_failures.wrapping_add(1),
        }
        outcome
    }

    /// Housekeeping when due, followed by a transfer if anything is pending.
    pub fn tick<L: LinkTransport + ?Sized>(
        &mut self,
        now: Instant,
        link: &mut L,
    ) -> Option<HousekeepingReport> {
        if !self.housekeeping_due(now) {
            return None;
        }
        let report = self.run_housekeeping(now);
        if !self.faults.is_empty() {
            if let Err(e) = self.transfer_faults(link) {
                error!("Fault transfer failed, {} faults kept: {}", self.faults.count(), e);
            }
        }
        Some(report)
    }

    #[must_use]
    pub const fn faults(&self) -> &FaultBuffer {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultBuffer {
        &mut self.faults
    }

    #[must_use]
    pub const fn health(&self) -> &HealthMonitor {
        &self.health
    }

    #[must_use]
    pub const fn config(&self) -> &PayloadConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn peripherals_mut(&mut self) -> &mut P {
        &mut self.peripherals
    }
}
