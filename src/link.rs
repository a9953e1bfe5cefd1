//! Synchronous command link collaborators and the transfer gate.

use crate::fault::{FaultBuffer, FaultCode};
use crate::protocol::{ErrorTransferFrame, LINK_RX_LEN, LINK_TEST_MESSAGE};
use arrayvec::ArrayVec;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link could not be opened")]
    Setup,
    #[error("link read failed")]
    Read,
    #[error("link write failed")]
    Write,
    #[error("control line unreadable")]
    ControlLine,
    #[error("edge wait failed")]
    Edge,
}

/// State of the controller-driven control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// The controller is not driving a transfer; the payload may send.
    Idle,
    Driven,
}

pub trait LinkTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;
    fn control_line(&mut self) -> Result<LineState, LinkError>;
}

/// Edge notifications on the control line.
pub trait EdgeSource {
    /// Returns `true` if an edge arrived within `timeout`.
    fn wait_edge(&mut self, timeout: Duration) -> Result<bool, LinkError>;
    /// Discards queued edge events.
    fn drain_events(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    pub edge_timeout: Duration,
    pub max_polls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Sent { count: usize },
    /// The controller was driving the line; nothing was written.
    Deferred,
}

pub type RawFrame = ArrayVec<u8, LINK_RX_LEN>;

/// Sends the accumulated faults if the controller is not driving the line.
///
/// The buffer is cleared only after the write succeeds. A failed write
/// leaves it untouched and the error is returned.
pub fn try_send_errors<L: LinkTransport + ?Sized, const N: usize>(
    link: &mut L,
    faults: &mut FaultBuffer<N>,
) -> Result<TransferOutcome, LinkError> {
    if link.control_line()? == LineState::Driven {
        debug!("Controller driving the link, error transfer deferred");
        return Ok(TransferOutcome::Deferred);
    }

    let frame = ErrorTransferFrame::encode(faults.as_slice());
    if let Err(e) = link.write(frame.as_bytes()) {
        warn!("Error transfer of {} faults failed: {}", faults.count(), e);
        return Err(e);
    }

    let count = faults.count();
    faults.clear();
    if count > 0 {
        info!("Transferred {} faults", count);
    }
    Ok(TransferOutcome::Sent { count })
}

/// Waits for a control-line edge, bounded by `timing`, then reads one frame.
/// Returns `None` if no edge arrived within the poll budget.
pub fn await_frame<L, E>(
    link: &mut L,
    edges: &mut E,
    timing: LinkTiming,
) -> Result<Option<RawFrame>, LinkError>
where
    L: LinkTransport + ?Sized,
    E: EdgeSource + ?Sized,
{
    for _ in 0..timing.max_polls {
        if edges.wait_edge(timing.edge_timeout)? {
            edges.drain_events();
            let mut buf = [0u8; LINK_RX_LEN];
            let len = link.read(&mut buf)?.min(LINK_RX_LEN);
            let mut frame = RawFrame::new();
            frame.extend(buf[..len].iter().copied());
            return Ok(Some(frame));
        }
    }
    Ok(None)
}

/// Opens the link, retrying up to `attempts` times. Exhaustion records a
/// link-setup fault.
pub fn open_with_retry<L, F, const N: usize>(
    mut open: F,
    attempts: u8,
    faults: &mut FaultBuffer<N>,
) -> Option<L>
where
    F: FnMut() -> Result<L, LinkError>,
{
    for attempt in 1..=attempts.max(1) {
        match open() {
            Ok(link) => {
                info!("Link open after {} attempt(s)", attempt);
                return Some(link);
            }
            Err(e) => warn!("Link open attempt {}/{} failed: {}", attempt, attempts, e),
        }
    }
    error!("Link unavailable");
    faults.append(FaultCode::link_setup());
    None
}

/// Writes the fixed test message and expects it echoed back within
/// `timeout`. Any failure records a link-test fault.
pub fn self_test<L, E, const N: usize>(
    link: &mut L,
    edges: &mut E,
    timeout: Duration,
    faults: &mut FaultBuffer<N>,
) -> bool
where
    L: LinkTransport + ?Sized,
    E: EdgeSource + ?Sized,
{
    let passed = run_self_test(link, edges, timeout);
    match passed {
        Ok(true) => {
            info!("Link self test passed");
            true
        }
        Ok(false) => {
            warn!("Link self test echo mismatch");
            faults.append(FaultCode::link_test());
            false
        }
        Err(e) => {
            warn!("Link self test failed: {}", e);
            faults.append(FaultCode::link_test());
            false
        }
    }
}

fn run_self_test<L, E>(link: &mut L, edges: &mut E, timeout: Duration) -> Result<bool, LinkError>
where
    L: LinkTransport + ?Sized,
    E: EdgeSource + ?Sized,
{
    link.write(&LINK_TEST_MESSAGE)?;
    if !edges.wait_edge(timeout)? {
        return Ok(false);
    }
    edges.drain_events();
    let mut echo = [0u8; LINK_TEST_MESSAGE.len()];
    let len = link.read(&mut echo)?;
    Ok(len == echo.len() && echo == LINK_TEST_MESSAGE)
}
