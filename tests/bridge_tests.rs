use iris_payload::bridge::{
    ChannelTag, ErrorRelay, IpcMessage, LinkService, LocalChannel, LogicService, MessageChannel,
    IPC_REFERENCE_VALUE,
};
use iris_payload::config::PayloadConfig;
use iris_payload::devices::{DeviceId, Peripherals};
use iris_payload::fault::{FaultBuffer, FaultCategory, FaultCode};
use iris_payload::link::LinkTiming;
use iris_payload::protocol::{Opcode, RETURN_MARKER};
use iris_payload::sim::{SimBus, SimLines, SimLink};
use iris_payload::PayloadAgent;
use std::time::{Duration, Instant};

type SimAgent = PayloadAgent<Peripherals<SimBus, SimLines>>;

fn test_config() -> PayloadConfig {
    PayloadConfig {
        edge_timeout_ms: 1,
        max_edge_polls: 2,
        reset_settle_ms: 0,
        ..PayloadConfig::default()
    }
}

fn split_pair() -> (
    LinkService<SimLink, SimLink, LocalChannel>,
    LogicService<Peripherals<SimBus, SimLines>, LocalChannel>,
    SimLink,
) {
    let config = test_config();
    let mut agent: SimAgent = PayloadAgent::new(
        Peripherals::new(SimBus::nominal(), SimLines::new(), Duration::ZERO),
        config.clone(),
    );
    assert!(agent.initialize().all_healthy());

    let sim_link = SimLink::new();
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, config.channel_depth);
    let link_service = LinkService::new(
        sim_link.clone(),
        sim_link.clone(),
        channel.clone(),
        config.link_timing(),
    );
    (link_service, LogicService::new(agent, channel), sim_link)
}

fn ack(seq: u8, status: u8, count: u8) -> IpcMessage {
    IpcMessage::new(ChannelTag::ErrorLinkToLogic, &[seq, status, count]).unwrap()
}

#[test]
fn test_split_command_round_trip() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();
    let now = Instant::now();

    sim_link.inject(&[Opcode::TempRead as u8, 1, 0xFF]);
    link_service.run_cycle().unwrap();
    assert_eq!(link_service.stats().commands_forwarded, 1);

    logic_service.run_cycle(now);
    link_service.run_cycle().unwrap();

    // Nominal simulator seeds channel 1 at 21 C.
    assert_eq!(sim_link.take_outbound(), vec![vec![RETURN_MARKER, 0, 0, 21]]);
    assert_eq!(link_service.stats().responses_written, 1);
}

#[test]
fn test_split_format_error_round_trip() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();

    sim_link.inject(&[Opcode::FileTransfer as u8, 0xFF]);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(Instant::now());
    link_service.run_cycle().unwrap();

    assert_eq!(sim_link.take_outbound(), vec![vec![RETURN_MARKER, 0x70]]);
    assert_eq!(logic_service.agent().stats().format_errors, 1);
}

#[test]
fn test_response_waits_for_idle_line() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();

    sim_link.inject(&[Opcode::HubValidate as u8, 0xFF]);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(Instant::now());

    sim_link.set_line(iris_payload::link::LineState::Driven);
    link_service.run_cycle().unwrap();
    assert_eq!(sim_link.outbound_len(), 0);

    sim_link.set_line(iris_payload::link::LineState::Idle);
    link_service.run_cycle().unwrap();
    assert_eq!(sim_link.take_outbound(), vec![vec![RETURN_MARKER, 0]]);
}

#[test]
fn test_relayed_faults_are_dropped_only_after_ack() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();
    let fault = FaultCode::device(FaultCategory::Limit, DeviceId::Temp2);
    let now = Instant::now();

    logic_service.agent_mut().faults_mut().append(fault);
    logic_service.run_cycle(now);
    assert_eq!(logic_service.agent().faults().count(), 1);

    link_service.run_cycle().unwrap();
    assert_eq!(sim_link.take_outbound(), vec![vec![73, 1, fault.narrow()]]);
    assert_eq!(logic_service.agent().faults().count(), 1);

    logic_service.run_cycle(now);
    assert!(logic_service.agent().faults().is_empty());
    assert_eq!(link_service.stats().faults_transferred, 1);
}

#[test]
fn test_failed_relay_keeps_faults_for_next_offer() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();
    let fault = FaultCode::device(FaultCategory::Measurement, DeviceId::Rail5V);
    let now = Instant::now();

    logic_service.agent_mut().faults_mut().append(fault);
    logic_service.run_cycle(now);

    sim_link.set_fail_writes(true);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(now);
    assert_eq!(logic_service.agent().faults().as_slice(), &[fault]);

    sim_link.set_fail_writes(false);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(now);
    assert!(logic_service.agent().faults().is_empty());
    assert_eq!(sim_link.take_outbound(), vec![vec![73, 1, fault.narrow()]]);
}

#[test]
fn test_split_error_transfer_with_empty_buffer() {
    let (mut link_service, mut logic_service, sim_link) = split_pair();
    let now = Instant::now();

    sim_link.inject(&[Opcode::ErrorTransfer as u8, 0xFF]);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(now);
    link_service.run_cycle().unwrap();
    logic_service.run_cycle(now);

    assert_eq!(sim_link.take_outbound(), vec![vec![73, 0]]);
    assert_eq!(link_service.stats().faults_transferred, 0);
    assert!(logic_service.agent().faults().is_empty());
}

#[test]
fn test_transfer_request_supersedes_in_flight_batch() {
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 8);
    let mut relay = ErrorRelay::new(Duration::from_secs(60));
    let mut faults: FaultBuffer = FaultBuffer::new();
    faults.append(FaultCode::link_test());
    let now = Instant::now();

    assert!(relay.offer(&channel, &faults, now));
    assert!(!relay.offer(&channel, &faults, now));
    assert!(relay.offer_requested(&channel, &faults, now));

    let first = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    let second = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    assert_eq!(second.payload()[1], 1);

    channel.try_send(ack(first.payload()[0], 0, 1)).unwrap();
    assert_eq!(relay.poll_ack(&channel, &mut faults), 0);
    channel.try_send(ack(second.payload()[0], 0, 1)).unwrap();
    assert_eq!(relay.poll_ack(&channel, &mut faults), 1);
    assert!(faults.is_empty());
}

#[test]
fn test_transfer_request_offers_empty_buffer() {
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 8);
    let mut relay = ErrorRelay::new(Duration::from_secs(60));
    let faults: FaultBuffer = FaultBuffer::new();

    assert!(!relay.offer(&channel, &faults, Instant::now()));
    assert!(relay.offer_requested(&channel, &faults, Instant::now()));

    let offer = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    assert_eq!(offer.payload()[1], 0);
    assert_eq!(offer.payload().len(), 2);
}

#[test]
fn test_relay_ignores_stale_ack() {
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 8);
    let mut relay = ErrorRelay::new(Duration::from_secs(60));
    let mut faults: FaultBuffer = FaultBuffer::new();
    faults.append(FaultCode::link_test());
    faults.append(FaultCode::format());
    let now = Instant::now();

    assert!(relay.offer(&channel, &faults, now));
    let offer = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    let seq = offer.payload()[0];
    assert_eq!(offer.payload()[1], 2);

    // Faults raised while the batch is in flight survive the ack.
    faults.append(FaultCode::link_setup());
    assert!(!relay.offer(&channel, &faults, now));

    channel.try_send(ack(seq.wrapping_add(9), 0, 2)).unwrap();
    assert_eq!(relay.poll_ack(&channel, &mut faults), 0);
    assert_eq!(faults.count(), 3);
    assert!(relay.is_waiting(now));

    channel.try_send(ack(seq, 0, 2)).unwrap();
    assert_eq!(relay.poll_ack(&channel, &mut faults), 2);
    assert_eq!(faults.as_slice(), &[FaultCode::link_setup()]);
    assert!(!relay.is_waiting(now));
}

#[test]
fn test_relay_reoffers_after_ack_timeout() {
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 8);
    let mut relay = ErrorRelay::new(Duration::from_millis(100));
    let mut faults: FaultBuffer = FaultBuffer::new();
    faults.append(FaultCode::link_test());
    let start = Instant::now();

    assert!(relay.offer(&channel, &faults, start));
    assert!(!relay.offer(&channel, &faults, start + Duration::from_millis(50)));
    assert!(relay.offer(&channel, &faults, start + Duration::from_millis(150)));

    let first = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    let second = channel.try_receive(ChannelTag::ErrorLogicToLink).unwrap();
    assert_ne!(first.payload()[0], second.payload()[0]);

    // The late ack for the first batch no longer matches.
    channel.try_send(ack(first.payload()[0], 0, 1)).unwrap();
    assert_eq!(relay.poll_ack(&channel, &mut faults), 0);
    assert_eq!(faults.count(), 1);
}

#[test]
fn test_full_channel_drops_forwarded_command() {
    let sim_link = SimLink::new();
    let channel = LocalChannel::new(IPC_REFERENCE_VALUE, 1);
    let mut link_service = LinkService::new(
        sim_link.clone(),
        sim_link.clone(),
        channel.clone(),
        LinkTiming {
            edge_timeout: Duration::from_millis(1),
            max_polls: 1,
        },
    );

    sim_link.inject(&[Opcode::TempRead as u8, 1, 0xFF]);
    link_service.run_cycle().unwrap();
    sim_link.inject(&[Opcode::TempRead as u8, 2, 0xFF]);
    link_service.run_cycle().unwrap();

    assert_eq!(link_service.stats().commands_forwarded, 1);
    assert_eq!(link_service.stats().commands_dropped, 1);
    assert_eq!(channel.len(), 1);
}
