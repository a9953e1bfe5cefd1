//! Process bridge between the link loop and the logic loop.
//!
//! In a split deployment one loop owns the synchronous link and the other
//! owns the peripherals. They exchange [`IpcMessage`]s over a single bounded
//! channel; each receiver takes only messages carrying its own tag.
//!
//! Command relay: raw command frames go link to logic, encoded responses
//! come back. Error relay: the logic side offers its pending faults, the
//! link side pushes them through the transfer gate and acknowledges, and
//! only then does the logic side drop them.

use crate::agent::PayloadAgent;
use crate::devices::PeripheralPort;
use crate::dispatch::Reply;
use crate::fault::{FaultBuffer, FaultCode};
use crate::link::{self, EdgeSource, LinkError, LinkTiming, LinkTransport, TransferOutcome};
use crate::protocol::RESPONSE_FRAME_SIZE;
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const IPC_PAYLOAD_MAX: usize = 1024;
/// Key shared by both loops to find the same channel.
pub const IPC_REFERENCE_VALUE: u8 = 53;
pub const MAX_CHANNEL_DEPTH: usize = 16;
/// Command messages handled per logic cycle.
pub const MAX_COMMANDS_PER_CYCLE: usize = 4;

const ACK_OK: u8 = 0;
const ACK_FAILED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("channel full, message dropped")]
    Full,
    #[error("payload of {0} bytes exceeds the message limit")]
    PayloadTooLarge(usize),
    #[error("malformed {0:?} payload")]
    Malformed(ChannelTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelTag {
    ErrorLogicToLink = 1,
    ErrorLinkToLogic = 2,
    CommandLogicToLink = 3,
    CommandLinkToLogic = 4,
}

impl ChannelTag {
    /// Tag the receiver answers on.
    #[must_use]
    pub const fn reply(self) -> Self {
        match self {
            Self::ErrorLogicToLink => Self::ErrorLinkToLogic,
            Self::ErrorLinkToLogic => Self::ErrorLogicToLink,
            Self::CommandLogicToLink => Self::CommandLinkToLogic,
            Self::CommandLinkToLogic => Self::CommandLogicToLink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    channel: ChannelTag,
    reply: ChannelTag,
    payload: Vec<u8, IPC_PAYLOAD_MAX>,
}

impl IpcMessage {
    pub fn new(channel: ChannelTag, payload: &[u8]) -> Result<Self, BridgeError> {
        let payload =
            Vec::from_slice(payload).map_err(|()| BridgeError::PayloadTooLarge(payload.len()))?;
        Ok(Self {
            channel,
            reply: channel.reply(),
            payload,
        })
    }

    #[must_use]
    pub const fn channel(&self) -> ChannelTag {
        self.channel
    }

    #[must_use]
    pub const fn reply(&self) -> ChannelTag {
        self.reply
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Non-blocking, tag-filtered message channel.
pub trait MessageChannel {
    /// Fails with [`BridgeError::Full`] instead of blocking.
    fn try_send(&self, message: IpcMessage) -> Result<(), BridgeError>;
    /// Takes the oldest message with the given tag. An empty result is not
    /// an error.
    fn try_receive(&self, channel: ChannelTag) -> Option<IpcMessage>;
}

struct ChannelState {
    queue: Deque<IpcMessage, MAX_CHANNEL_DEPTH>,
    depth: usize,
}

/// In-process channel shared by cloning.
#[derive(Clone)]
pub struct LocalChannel {
    key: u8,
    state: Arc<Mutex<ChannelState>>,
}

impl LocalChannel {
    #[must_use]
    pub fn new(key: u8, depth: usize) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(ChannelState {
                queue: Deque::new(),
                depth: depth.clamp(1, MAX_CHANNEL_DEPTH),
            })),
        }
    }

    #[must_use]
    pub const fn key(&self) -> u8 {
        self.key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageChannel for LocalChannel {
    fn try_send(&self, message: IpcMessage) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.queue.len() >= state.depth {
            return Err(BridgeError::Full);
        }
        state.queue.push_back(message).map_err(|_| BridgeError::Full)
    }

    fn try_receive(&self, channel: ChannelTag) -> Option<IpcMessage> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found = None;
        for _ in 0..state.queue.len() {
            let Some(message) = state.queue.pop_front() else {
                break;
            };
            if found.is_none() && message.channel == channel {
                found = Some(message);
            } else {
                // Rotating through the whole queue keeps the order of the rest.
                let _ = state.queue.push_back(message);
            }
        }
        found
    }
}

/// Sends without blocking; a full channel drops the message for this cycle.
fn send_or_drop<C: MessageChannel + ?Sized>(channel: &C, message: IpcMessage) -> bool {
    let tag = message.channel();
    match channel.try_send(message) {
        Ok(()) => true,
        Err(e) => {
            warn!("{:?} message dropped: {}", tag, e);
            false
        }
    }
}

/// Offer payload: `[seq][count][wide code:2]*count`.
fn encode_offer(seq: u8, faults: &[FaultCode]) -> Vec<u8, IPC_PAYLOAD_MAX> {
    let mut payload = Vec::new();
    let _ = payload.push(seq);
    let _ = payload.push(faults.len() as u8);
    for fault in faults {
        let _ = payload.extend_from_slice(&fault.wide().to_be_bytes());
    }
    payload
}

fn decode_offer(payload: &[u8]) -> Result<(u8, FaultBuffer), BridgeError> {
    let malformed = BridgeError::Malformed(ChannelTag::ErrorLogicToLink);
    let [seq, count, codes @ ..] = payload else {
        return Err(malformed);
    };
    let count = usize::from(*count);
    if codes.len() != count * 2 {
        return Err(malformed);
    }
    let mut faults = FaultBuffer::new();
    for pair in codes.chunks_exact(2) {
        let code = FaultCode::from_wide(u16::from_be_bytes([pair[0], pair[1]])).ok_or(malformed)?;
        faults.append(code);
    }
    Ok((*seq, faults))
}

/// Logic-side half of the error relay.
#[derive(Debug, Clone)]
pub struct ErrorRelay {
    seq: u8,
    in_flight: Option<(u8, Instant)>,
    ack_timeout: Duration,
}

impl ErrorRelay {
    #[must_use]
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            seq: 0,
            in_flight: None,
            ack_timeout,
        }
    }

    #[must_use]
    pub fn is_waiting(&self, now: Instant) -> bool {
        self.in_flight
            .is_some_and(|(_, sent)| now.duration_since(sent) < self.ack_timeout)
    }

    /// Offers every pending fault unless a previous offer is still awaiting
    /// its acknowledgement. Returns `true` if a batch was sent.
    pub fn offer<C: MessageChannel + ?Sized, const N: usize>(
        &mut self,
        channel: &C,
        faults: &FaultBuffer<N>,
        now: Instant,
    ) -> bool {
        if faults.is_empty() || self.is_waiting(now) {
            return false;
        }
        if self.in_flight.is_some() {
            warn!("Error batch {} unacknowledged, offering again", self.seq);
        }
        self.send_batch(channel, faults, now)
    }

    /// Answers an error-transfer command. The buffer is offered even when
    /// empty so the link side writes its frame, and any batch still awaiting
    /// acknowledgement is superseded.
    pub fn offer_requested<C: MessageChannel + ?Sized, const N: usize>(
        &mut self,
        channel: &C,
        faults: &FaultBuffer<N>,
        now: Instant,
    ) -> bool {
        if let Some((seq, _)) = self.in_flight {
            debug!("Error batch {} superseded by a transfer request", seq);
        }
        self.send_batch(channel, faults, now)
    }

    fn send_batch<C: MessageChannel + ?Sized, const N: usize>(
        &mut self,
        channel: &C,
        faults: &FaultBuffer<N>,
        now: Instant,
    ) -> bool {
        self.seq = self.seq.wrapping_add(1);
        let payload = encode_offer(self.seq, faults.as_slice());
        let Ok(message) = IpcMessage::new(ChannelTag::ErrorLogicToLink, &payload) else {
            return false;
        };
        if send_or_drop(channel, message) {
            self.in_flight = Some((self.seq, now));
            debug!("Offered {} faults as batch {}", faults.count(), self.seq);
            true
        } else {
            false
        }
    }

    /// Applies acknowledgements for the current batch; stale ones are ignored.
    pub fn poll_ack<C: MessageChannel + ?Sized, const N: usize>(
        &mut self,
        channel: &C,
        faults: &mut FaultBuffer<N>,
    ) -> usize {
        let mut removed = 0;
        while let Some(message) = channel.try_receive(ChannelTag::ErrorLinkToLogic) {
            let &[seq, status, count] = message.payload() else {
                warn!("Malformed error acknowledgement");
                continue;
            };
            match self.in_flight {
                Some((current, _)) if current == seq => {
                    self.in_flight = None;
                    if status == ACK_OK {
                        faults.acknowledge(usize::from(count));
                        removed += usize::from(count);
                    } else {
                        info!("Link side could not send batch {}", seq);
                    }
                }
                _ => debug!("Ignoring stale acknowledgement for batch {}", seq),
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkServiceStats {
    pub commands_forwarded: u32,
    pub commands_dropped: u32,
    pub responses_written: u32,
    pub faults_transferred: u32,
}

/// The loop that owns the link in a split deployment.
pub struct LinkService<L, E, C> {
    link: L,
    edges: E,
    channel: C,
    timing: LinkTiming,
    pending_response: Option<Vec<u8, RESPONSE_FRAME_SIZE>>,
    pending_faults: Option<(u8, FaultBuffer)>,
    stats: LinkServiceStats,
}

impl<L, E, C> LinkService<L, E, C>
where
    L: LinkTransport,
    E: EdgeSource,
    C: MessageChannel,
{
    pub fn new(link: L, edges: E, channel: C, timing: LinkTiming) -> Self {
        Self {
            link,
            edges,
            channel,
            timing,
            pending_response: None,
            pending_faults: None,
            stats: LinkServiceStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &LinkServiceStats {
        &self.stats
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// One pass: relay an incoming command, write a ready response, push
    /// offered faults through the transfer gate.
    pub fn run_cycle(&mut self) -> Result<(), LinkError> {
        if let Some(raw) = link::await_frame(&mut self.link, &mut self.edges, self.timing)? {
            self.forward_command(&raw);
        }
        self.write_response()?;
        self.relay_errors();
        Ok(())
    }

    fn forward_command(&mut self, raw: &[u8]) {
        let forwarded = IpcMessage::new(ChannelTag::CommandLinkToLogic, raw)
            .map(|message| send_or_drop(&self.channel, message))
            .unwrap_or(false);
        if forwarded {
            self.stats.commands_forwarded += 1;
        } else {
            self.stats.commands_dropped += 1;
        }
    }

    fn write_response(&mut self) -> Result<(), LinkError> {
        if self.pending_response.is_none() {
            self.pending_response = self
                .channel
                .try_receive(ChannelTag::CommandLogicToLink)
                .and_then(|message| decode_response(message.payload()));
        }
        let Some(response) = self.pending_response.as_ref() else {
            return Ok(());
        };
        if self.link.control_line()? == link::LineState::Driven {
            return Ok(());
        }
        let result = self.link.write(response);
        // One write attempt per response; a failed one is not retried.
        self.pending_response = None;
        result?;
        self.stats.responses_written += 1;
        Ok(())
    }

    fn relay_errors(&mut self) {
        while let Some(message) = self.channel.try_receive(ChannelTag::ErrorLogicToLink) {
            match decode_offer(message.payload()) {
                Ok(offer) => self.pending_faults = Some(offer),
                Err(e) => warn!("{}", e),
            }
        }

        let Some((seq, faults)) = self.pending_faults.as_mut() else {
            return;
        };
        let seq = *seq;
        let ack = match link::try_send_errors(&mut self.link, faults) {
            Ok(TransferOutcome::Deferred) => return,
            Ok(TransferOutcome::Sent { count }) => {
                self.pending_faults = None;
                self.stats.faults_transferred += count as u32;
                [seq, ACK_OK, count as u8]
            }
            Err(e) => {
                // The logic side re-offers under a new sequence number.
                self.pending_faults = None;
                warn!("Relayed error transfer failed: {}", e);
                [seq, ACK_FAILED, 0]
            }
        };
        if let Ok(message) = IpcMessage::new(ChannelTag::ErrorLinkToLogic, &ack) {
            send_or_drop(&self.channel, message);
        }
    }
}

/// Response payload: `[len][frame...]`.
fn encode_response(frame: &[u8]) -> Vec<u8, { RESPONSE_FRAME_SIZE + 1 }> {
    let mut payload = Vec::new();
    let _ = payload.push(frame.len() as u8);
    let _ = payload.extend_from_slice(&frame[..frame.len().min(RESPONSE_FRAME_SIZE)]);
    payload
}

fn decode_response(payload: &[u8]) -> Option<Vec<u8, RESPONSE_FRAME_SIZE>> {
    let (&len, rest) = payload.split_first()?;
    let frame = rest.get(..usize::from(len))?;
    Vec::from_slice(frame).ok()
}

/// The loop that owns the peripherals in a split deployment.
pub struct LogicService<P, C> {
    agent: PayloadAgent<P>,
    channel: C,
    relay: ErrorRelay,
}

impl<P: PeripheralPort, C: MessageChannel> LogicService<P, C> {
    pub fn new(agent: PayloadAgent<P>, channel: C) -> Self {
        let relay = ErrorRelay::new(agent.config().error_ack_timeout());
        Self {
            agent,
            channel,
            relay,
        }
    }

    #[must_use]
    pub const fn agent(&self) -> &PayloadAgent<P> {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut PayloadAgent<P> {
        &mut self.agent
    }

    /// One pass: settle acknowledgements, answer relayed commands, run
    /// housekeeping when due and offer what is still pending.
    pub fn run_cycle(&mut self, now: Instant) {
        self.relay.poll_ack(&self.channel, self.agent.faults_mut());

        let mut transfer_requested = false;
        for _ in 0..MAX_COMMANDS_PER_CYCLE {
            let Some(message) = self.channel.try_receive(ChannelTag::CommandLinkToLogic) else {
                break;
            };
            match self.agent.handle_raw(message.payload()) {
                Reply::Frame(frame) => {
                    let payload = encode_response(frame.as_bytes());
                    if let Ok(message) = IpcMessage::new(ChannelTag::CommandLogicToLink, &payload) {
                        send_or_drop(&self.channel, message);
                    }
                }
                // The error-transfer frame is the answer; the link side writes
                // it from the offer below.
                Reply::TransferFaults => transfer_requested = true,
            }
        }

        if self.agent.housekeeping_due(now) {
            self.agent.run_housekeeping(now);
        }

        if transfer_requested {
            self.relay.offer_requested(&self.channel, self.agent.faults(), now);
        } else {
            self.relay.offer(&self.channel, self.agent.faults(), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceId;
    use crate::fault::FaultCategory;

    #[test]
    fn test_receive_filters_by_tag() {
        let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 4);
        channel
            .try_send(IpcMessage::new(ChannelTag::ErrorLinkToLogic, &[1]).unwrap())
            .unwrap();
        channel
            .try_send(IpcMessage::new(ChannelTag::CommandLinkToLogic, &[2]).unwrap())
            .unwrap();

        let command = channel.try_receive(ChannelTag::CommandLinkToLogic).unwrap();
        assert_eq!(command.payload(), &[2]);
        assert_eq!(command.reply(), ChannelTag::CommandLogicToLink);
        assert!(channel.try_receive(ChannelTag::CommandLinkToLogic).is_none());
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_full_channel_rejects() {
        let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 1);
        channel
            .try_send(IpcMessage::new(ChannelTag::CommandLinkToLogic, &[1]).unwrap())
            .unwrap();
        let second = IpcMessage::new(ChannelTag::CommandLinkToLogic, &[2]).unwrap();
        assert_eq!(channel.try_send(second), Err(BridgeError::Full));
    }

    #[test]
    fn test_oversize_payload() {
        let big = [0u8; IPC_PAYLOAD_MAX + 1];
        assert_eq!(
            IpcMessage::new(ChannelTag::CommandLinkToLogic, &big),
            Err(BridgeError::PayloadTooLarge(IPC_PAYLOAD_MAX + 1))
        );
    }

    #[test]
    fn test_offer_roundtrip() {
        let faults = [
            FaultCode::device(FaultCategory::Limit, DeviceId::Temp3),
            FaultCode::link_setup(),
        ];
        let payload = encode_offer(7, &faults);
        let (seq, decoded) = decode_offer(&payload).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(decoded.as_slice(), &faults);
        assert!(decode_offer(&payload[..3]).is_err());
    }

    #[test]
    fn test_response_payload() {
        let payload = encode_response(&[12, 0, 1, 2]);
        assert_eq!(payload.as_slice(), &[4, 12, 0, 1, 2]);
        assert_eq!(decode_response(&payload).unwrap().as_slice(), &[12, 0, 1, 2]);
        assert!(decode_response(&[5, 1]).is_none());
    }
}
