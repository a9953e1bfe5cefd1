//! Opcode dispatch.
//!
//! Each implemented opcode has exactly one entry in the handler table. Any
//! opcode without an entry, including the reserved image and file slots,
//! falls to a single default branch that answers with a format error.

use crate::devices::{DeviceId, PeripheralPort, Quantity, classify_word};
use crate::fault::{FaultBuffer, FaultCode};
use crate::health::{CycleReport, HealthMonitor};
use crate::limits::{self, LimitConfig};
use crate::link::{self, LinkError, LinkTransport, TransferOutcome};
use crate::protocol::{CommandFrame, Opcode, ResponseFrame, RESPONSE_PAYLOAD_MAX};
use tracing::{debug, warn};

/// Everything a handler may touch.
pub struct DispatchContext<'a, P: ?Sized> {
    pub health: &'a mut HealthMonitor,
    pub peripherals: &'a mut P,
    pub faults: &'a mut FaultBuffer,
    pub limits: &'a LimitConfig,
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Frame(ResponseFrame),
    /// Answer with an error-transfer frame through the transfer gate.
    TransferFaults,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Responded(ResponseFrame),
    Transferred(TransferOutcome),
}

type Handler<P> = fn(&mut DispatchContext<'_, P>, &[u8]) -> Reply;

const HANDLER_COUNT: usize = 19;

fn handler_table<P: PeripheralPort + ?Sized>() -> [(Opcode, Handler<P>); HANDLER_COUNT] {
    [
        (Opcode::CurrentSetup, current_setup::<P>),
        (Opcode::CurrentValidate, current_validate::<P>),
        (Opcode::CurrentStatus, current_status::<P>),
        (Opcode::CurrentReset, current_reset::<P>),
        (Opcode::CurrentReadCurrent, current_read_current::<P>),
        (Opcode::CurrentReadVoltage, current_read_voltage::<P>),
        (Opcode::CurrentReadPower, current_read_power::<P>),
        (Opcode::CurrentReadPeakPower, current_read_peak_power::<P>),
        (Opcode::CurrentReadLimit, current_read_limit::<P>),
        (Opcode::TempSetup, temp_setup::<P>),
        (Opcode::TempValidate, temp_validate::<P>),
        (Opcode::TempStatus, temp_status::<P>),
        (Opcode::TempReset, temp_reset::<P>),
        (Opcode::TempRead, temp_read::<P>),
        (Opcode::TempReadLimit, temp_read_limit::<P>),
        (Opcode::HubSetup, hub_setup::<P>),
        (Opcode::HubValidate, hub_validate::<P>),
        (Opcode::HubReset, hub_reset::<P>),
        (Opcode::ErrorTransfer, error_transfer::<P>),
    ]
}

/// Maps one decoded command to its reply. Never touches the link.
pub fn handle<P: PeripheralPort + ?Sized>(
    frame: &CommandFrame,
    ctx: &mut DispatchContext<'_, P>,
) -> Reply {
    if frame.dropped_args() > 0 {
        warn!("Opcode {} lost {} arguments past the frame limit", frame.opcode(), frame.dropped_args());
    }

    let handler = Opcode::try_from(frame.opcode()).ok().and_then(|opcode| {
        handler_table::<P>()
            .into_iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, handler)| handler)
    });

    match handler {
        Some(handler) => handler(ctx, frame.args()),
        None => {
            debug!("No handler for opcode {}", frame.opcode());
            Reply::Frame(ResponseFrame::format_error())
        }
    }
}

/// Writes the reply to the link: one response frame, or the error-transfer
/// frame when the controller asked for faults.
pub fn respond<L: LinkTransport + ?Sized>(
    reply: Reply,
    link: &mut L,
    faults: &mut FaultBuffer,
) -> Result<DispatchOutcome, LinkError> {
    match reply {
        Reply::Frame(frame) => {
            link.write(frame.as_bytes())?;
            Ok(DispatchOutcome::Responded(frame))
        }
        Reply::TransferFaults => link::try_send_errors(link, faults).map(DispatchOutcome::Transferred),
    }
}

/// Decodes, handles and answers one raw frame. An empty frame is answered
/// with a format error.
pub fn dispatch<P, L>(
    raw: &[u8],
    ctx: &mut DispatchContext<'_, P>,
    link: &mut L,
) -> Result<DispatchOutcome, LinkError>
where
    P: PeripheralPort + ?Sized,
    L: LinkTransport + ?Sized,
{
    let reply = match CommandFrame::decode(raw) {
        Ok(frame) => handle(&frame, ctx),
        Err(e) => {
            debug!("Undecodable frame: {}", e);
            Reply::Frame(ResponseFrame::format_error())
        }
    };
    respond(reply, link, ctx.faults)
}

fn health_reply(report: &CycleReport) -> Reply {
    Reply::Frame(ResponseFrame::status(report.status_byte()))
}

fn status_reply<P: ?Sized>(ctx: &DispatchContext<'_, P>, device: DeviceId) -> Reply {
    let record = ctx.health.record(device);
    Reply::Frame(ResponseFrame::codes(&[0, record.state as u8, record.attempts]))
}

fn read_reply<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    device: DeviceId,
    quantity: Quantity,
) -> Reply {
    let raw = ctx.peripherals.read_word(&device.descriptor(), quantity);
    match classify_word(device, raw) {
        Ok(value) => Reply::Frame(ResponseFrame::word(value)),
        Err(fault) => Reply::Frame(ResponseFrame::status(fault.narrow())),
    }
}

fn limit_reply(found: &FaultBuffer<RESPONSE_PAYLOAD_MAX>) -> Reply {
    let codes: heapless::Vec<u8, RESPONSE_PAYLOAD_MAX> =
        found.iter().map(FaultCode::narrow).collect();
    Reply::Frame(ResponseFrame::codes(&codes))
}

fn with_rail<P: ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
    f: impl FnOnce(&mut DispatchContext<'_, P>, DeviceId) -> Reply,
) -> Reply {
    match args.first().copied().and_then(DeviceId::rail) {
        Some(device) => f(ctx, device),
        None => Reply::Frame(ResponseFrame::format_error()),
    }
}

fn with_channel<P: ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
    f: impl FnOnce(&mut DispatchContext<'_, P>, DeviceId) -> Reply,
) -> Reply {
    match args.first().copied().and_then(DeviceId::temperature_channel) {
        Some(device) => f(ctx, device),
        None => Reply::Frame(ResponseFrame::format_error()),
    }
}

fn setup<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, device: DeviceId) -> Reply {
    health_reply(&ctx.health.setup(device, ctx.peripherals, ctx.faults))
}

fn validate<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, device: DeviceId) -> Reply {
    health_reply(&ctx.health.revalidate(device, ctx.peripherals, ctx.faults))
}

fn reset<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, device: DeviceId) -> Reply {
    health_reply(&ctx.health.reset(device, ctx.peripherals, ctx.faults))
}

fn current_setup<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_rail(ctx, args, setup)
}

fn current_validate<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_rail(ctx, args, validate)
}

fn current_status<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_rail(ctx, args, |ctx, device| status_reply(ctx, device))
}

fn current_reset<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_rail(ctx, args, reset)
}

fn current_read_current<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
) -> Reply {
    with_rail(ctx, args, |ctx, device| read_reply(ctx, device, Quantity::Current))
}

fn current_read_voltage<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
) -> Reply {
    with_rail(ctx, args, |ctx, device| read_reply(ctx, device, Quantity::BusVoltage))
}

fn current_read_power<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
) -> Reply {
    with_rail(ctx, args, |ctx, device| read_reply(ctx, device, Quantity::Power))
}

fn current_read_peak_power<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    args: &[u8],
) -> Reply {
    with_rail(ctx, args, |ctx, device| read_reply(ctx, device, Quantity::PeakPower))
}

fn current_read_limit<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    _args: &[u8],
) -> Reply {
    let mut found = FaultBuffer::<RESPONSE_PAYLOAD_MAX>::new();
    limits::check_currents(ctx.peripherals, ctx.limits, &mut found);
    limit_reply(&found)
}

fn temp_setup<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_channel(ctx, args, setup)
}

fn temp_validate<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_channel(ctx, args, validate)
}

fn temp_status<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_channel(ctx, args, |ctx, device| status_reply(ctx, device))
}

fn temp_reset<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_channel(ctx, args, reset)
}

fn temp_read<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, args: &[u8]) -> Reply {
    with_channel(ctx, args, |ctx, device| read_reply(ctx, device, Quantity::Temperature))
}

fn temp_read_limit<P: PeripheralPort + ?Sized>(
    ctx: &mut DispatchContext<'_, P>,
    _args: &[u8],
) -> Reply {
    let mut found = FaultBuffer::<RESPONSE_PAYLOAD_MAX>::new();
    limits::check_temperatures(ctx.peripherals, ctx.limits, &mut found);
    limit_reply(&found)
}

fn hub_setup<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, _args: &[u8]) -> Reply {
    setup(ctx, DeviceId::UsbHub)
}

fn hub_validate<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, _args: &[u8]) -> Reply {
    validate(ctx, DeviceId::UsbHub)
}

fn hub_reset<P: PeripheralPort + ?Sized>(ctx: &mut DispatchContext<'_, P>, _args: &[u8]) -> Reply {
    reset(ctx, DeviceId::UsbHub)
}

fn error_transfer<P: ?Sized>(_ctx: &mut DispatchContext<'_, P>, _args: &[u8]) -> Reply {
    Reply::TransferFaults
}
