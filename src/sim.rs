//! In-memory stand-ins for the bus, the discrete lines and the command link.
//!
//! Every simulator is a cheap handle over shared state, so a test or the
//! service binary can keep a clone to inject faults and observe traffic
//! while the controller owns another.

use crate::devices::{
    current, thermal, BusHandle, DeviceClass, DeviceError, DeviceId, Line, LineControl, LineLevel,
    RegisterBus,
};
use crate::link::{EdgeSource, LineState, LinkError, LinkTransport};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

const EDGE_POLL_STEP: Duration = Duration::from_millis(1);

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-address misbehaviour of the simulated bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFaultPlan {
    pub fail_open: bool,
    pub fail_write: bool,
    pub fail_read: bool,
    /// Writes succeed but are not latched, so readback never matches.
    pub ignore_writes: bool,
}

#[derive(Debug, Default)]
struct SimBusState {
    registers: HashMap<(u8, u8), Vec<u8>>,
    plans: HashMap<u8, BusFaultPlan>,
    open: HashMap<u32, u8>,
    next_handle: u32,
    opens: u64,
}

impl SimBusState {
    fn plan(&self, address: u8) -> BusFaultPlan {
        self.plans.get(&address).copied().unwrap_or_default()
    }

    fn address(&self, handle: BusHandle) -> Option<u8> {
        self.open.get(&handle.0).copied()
    }

    /// Power-on reset of the configuration registers of one part.
    fn reset_part(&mut self, address: u8, registers: &[u8]) {
        for register in registers {
            self.registers.remove(&(address, *register));
        }
        debug!("Simulated reset of 0x{:02X}", address);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<SimBusState>>,
}

impl SimBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose sensors report plausible nominal values.
    #[must_use]
    pub fn nominal() -> Self {
        let bus = Self::new();
        for (index, id) in DeviceId::TEMPERATURE.into_iter().enumerate() {
            bus.set_byte(id.address(), thermal::REG_REMOTE_HIGH, 21 + index as u8);
        }
        for (id, milliamps, millivolts) in [
            (DeviceId::Rail3V3, 120.0f32, 3300u16),
            (DeviceId::Rail5V, 300.0, 5000),
            (DeviceId::RailCam, 500.0, 5000),
        ] {
            let lsb_ma = current::profile(id).current_lsb_a * 1000.0;
            let raw_current = (milliamps / lsb_ma) as u16;
            let raw_power = (milliamps * f32::from(millivolts) / 1000.0
                / (current::profile(id).power_lsb_w() * 1000.0)) as u16;
            bus.set_word(id.address(), current::REG_CURRENT, raw_current);
            bus.set_word(id.address(), current::REG_BUS_VOLTAGE, (millivolts / 4) << 3);
            bus.set_word(id.address(), current::REG_POWER, raw_power);
            bus.set_word(id.address(), current::REG_POWER_PEAK, raw_power.saturating_add(raw_power / 10));
        }
        bus
    }

    pub fn set_plan(&self, address: u8, plan: BusFaultPlan) {
        lock(&self.state).plans.insert(address, plan);
    }

    pub fn clear_plan(&self, address: u8) {
        lock(&self.state).plans.remove(&address);
    }

    #[must_use]
    pub fn plan(&self, address: u8) -> BusFaultPlan {
        lock(&self.state).plan(address)
    }

    pub fn set_byte(&self, address: u8, register: u8, value: u8) {
        lock(&self.state).registers.insert((address, register), vec![value]);
    }

    pub fn set_word(&self, address: u8, register: u8, value: u16) {
        lock(&self.state)
            .registers
            .insert((address, register), value.to_be_bytes().to_vec());
    }

    #[must_use]
    pub fn register(&self, address: u8, register: u8) -> Option<Vec<u8>> {
        lock(&self.state).registers.get(&(address, register)).cloned()
    }

    /// Handles opened and not yet closed.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        lock(&self.state).open.len()
    }

    /// Total successful opens since construction.
    #[must_use]
    pub fn opens(&self) -> u64 {
        lock(&self.state).opens
    }
}

impl RegisterBus for SimBus {
    fn open(&mut self, address: u8) -> Result<BusHandle, DeviceError> {
        let mut state = lock(&self.state);
        if state.plan(address).fail_open {
            return Err(DeviceError::Open { address });
        }
        state.next_handle = state.next_handle.wrapping_add(1);
        let handle = state.next_handle;
        state.open.insert(handle, address);
        state.opens += 1;
        Ok(BusHandle(handle))
    }

    fn write_register(
        &mut self,
        handle: BusHandle,
        register: u8,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        let address = state
            .address(handle)
            .ok_or(DeviceError::Write { address: 0, register })?;
        let plan = state.plan(address);
        if plan.fail_write {
            return Err(DeviceError::Write { address, register });
        }
        if plan.ignore_writes {
            return Ok(());
        }

        let class = DeviceId::from_address(address).map(DeviceId::class);
        match (class, register, data) {
            (Some(DeviceClass::CurrentMonitor), current::REG_CONFIG, [hi, _]) if hi & 0x80 != 0 => {
                let registers: Vec<u8> = current::config_image(DeviceId::Rail3V3)
                    .iter()
                    .map(|(register, _)| *register)
                    .collect();
                state.reset_part(address, &registers);
            }
            (Some(DeviceClass::Temperature), thermal::REG_SOFTWARE_RESET, _) => {
                let registers: Vec<u8> =
                    thermal::CONFIG_IMAGE.iter().map(|(register, _)| *register).collect();
                state.reset_part(address, &registers);
            }
            _ => {
                state.registers.insert((address, register), data.to_vec());
            }
        }
        Ok(())
    }

    fn read_register(
        &mut self,
        handle: BusHandle,
        register: u8,
        buf: &mut [u8],
    ) -> Result<(), DeviceError> {
        let state = lock(&self.state);
        let address = state
            .address(handle)
            .ok_or(DeviceError::Read { address: 0, register })?;
        if state.plan(address).fail_read {
            return Err(DeviceError::Read { address, register });
        }
        buf.fill(0);
        if let Some(stored) = state.registers.get(&(address, register)) {
            for (dst, src) in buf.iter_mut().zip(stored) {
                *dst = *src;
            }
        }
        Ok(())
    }

    fn close(&mut self, handle: BusHandle) {
        lock(&self.state).open.remove(&handle.0);
    }
}

#[derive(Debug, Default)]
struct SimLinesState {
    levels: HashMap<Line, LineLevel>,
    failing: HashSet<Line>,
    pulses: HashMap<Line, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct SimLines {
    state: Arc<Mutex<SimLinesState>>,
}

impl SimLines {
    /// Indicators idle low, reset released high.
    #[must_use]
    pub fn new() -> Self {
        let lines = Self::default();
        lines.set_level(Line::HubReset, LineLevel::High);
        lines
    }

    pub fn set_level(&self, line: Line, level: LineLevel) {
        lock(&self.state).levels.insert(line, level);
    }

    pub fn set_failing(&self, line: Line, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(line);
        } else {
            state.failing.remove(&line);
        }
    }

    /// Number of times the line was driven low.
    #[must_use]
    pub fn pulses(&self, line: Line) -> u32 {
        lock(&self.state).pulses.get(&line).copied().unwrap_or(0)
    }
}

impl LineControl for SimLines {
    fn get(&mut self, line: Line) -> Result<LineLevel, DeviceError> {
        let state = lock(&self.state);
        if state.failing.contains(&line) {
            return Err(DeviceError::Line { line });
        }
        Ok(state.levels.get(&line).copied().unwrap_or(LineLevel::Low))
    }

    fn set(&mut self, line: Line, level: LineLevel) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.failing.contains(&line) {
            return Err(DeviceError::Line { line });
        }
        if level == LineLevel::Low {
            *state.pulses.entry(line).or_insert(0) += 1;
        }
        state.levels.insert(line, level);
        Ok(())
    }
}

#[derive(Debug)]
struct SimLinkState {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
    line: LineState,
    fail_writes: bool,
    fail_control_line: bool,
    loopback: bool,
}

/// Command link. Frames injected by the controller side raise an edge;
/// frames written by the payload collect in an outbound log.
#[derive(Debug, Clone)]
pub struct SimLink {
    state: Arc<Mutex<SimLinkState>>,
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimLinkState {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                line: LineState::Idle,
                fail_writes: false,
                fail_control_line: false,
                loopback: false,
            })),
        }
    }

    pub fn inject(&self, frame: &[u8]) {
        lock(&self.state).inbound.push_back(frame.to_vec());
    }

    pub fn take_outbound(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock(&self.state).outbound)
    }

    #[must_use]
    pub fn outbound_len(&self) -> usize {
        lock(&self.state).outbound.len()
    }

    pub fn set_line(&self, line: LineState) {
        lock(&self.state).line = line;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn set_fail_control_line(&self, fail: bool) {
        lock(&self.state).fail_control_line = fail;
    }

    /// Echo every written frame back as inbound traffic.
    pub fn set_loopback(&self, loopback: bool) {
        lock(&self.state).loopback = loopback;
    }

    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        lock(&self.state).inbound.len()
    }
}

impl LinkTransport for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut state = lock(&self.state);
        let Some(frame) = state.inbound.pop_front() else {
            return Ok(0);
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(LinkError::Write);
        }
        if state.loopback {
            state.inbound.push_back(data.to_vec());
        }
        state.outbound.push(data.to_vec());
        Ok(())
    }

    fn control_line(&mut self) -> Result<LineState, LinkError> {
        let state = lock(&self.state);
        if state.fail_control_line {
            return Err(LinkError::ControlLine);
        }
        Ok(state.line)
    }
}

impl EdgeSource for SimLink {
    fn wait_edge(&mut self, timeout: Duration) -> Result<bool, LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !lock(&self.state).inbound.is_empty() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(EDGE_POLL_STEP.min(deadline - now));
        }
    }

    // Edges are modelled by the inbound queue itself.
    fn drain_events(&mut self) {}
}

/// Deterministic random bus misbehaviour for soak runs.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    bus: SimBus,
    /// Chance per device per step, in percent.
    rate_percent: f32,
    /// Steps an injected plan stays active.
    duration_steps: u32,
    active: HashMap<u8, u32>,
    rng_state: u64,
    injected: u32,
}

impl FaultInjector {
    #[must_use]
    pub fn new(bus: SimBus, rate_percent: f32, duration_steps: u32) -> Self {
        Self {
            bus,
            rate_percent,
            duration_steps,
            active: HashMap::new(),
            rng_state: 0x1234_5678_9ABC_DEF0,
            injected: 0,
        }
    }

    /// Expires old plans and rolls for new ones. Returns the devices that
    /// received a plan this step.
    pub fn step(&mut self) -> Vec<DeviceId> {
        let mut expired = Vec::new();
        for (address, remaining) in &mut self.active {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                expired.push(*address);
            }
        }
        for address in expired {
            self.active.remove(&address);
            self.bus.clear_plan(address);
        }

        let mut injected = Vec::new();
        for id in DeviceId::ALL {
            if self.active.contains_key(&id.address()) || !self.roll(self.rate_percent) {
                continue;
            }
            let plan = match self.next_random() % 3 {
                0 => BusFaultPlan { fail_read: true, ..BusFaultPlan::default() },
                1 => BusFaultPlan { ignore_writes: true, ..BusFaultPlan::default() },
                _ => BusFaultPlan { fail_open: true, ..BusFaultPlan::default() },
            };
            self.bus.set_plan(id.address(), plan);
            self.active.insert(id.address(), self.duration_steps.max(1));
            self.injected += 1;
            injected.push(id);
        }
        injected
    }

    #[must_use]
    pub const fn injected(&self) -> u32 {
        self.injected
    }

    fn roll(&mut self, rate_percent: f32) -> bool {
        let value = (self.next_random() >> 40) as f32 / (1u64 << 24) as f32;
        value < rate_percent / 100.0
    }

    // Linear congruential generator, Numerical Recipes parameters
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.rng_state
    }
}
