use clap::{App, Arg};
use iris_payload::bridge::{LinkService, LocalChannel, LogicService};
use iris_payload::config::PayloadConfig;
use iris_payload::devices::Peripherals;
use iris_payload::link::{self, LinkError};
use iris_payload::sim::{FaultInjector, SimBus, SimLines, SimLink};
use iris_payload::PayloadAgent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_PORT: &str = "8080";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const RESPONSE_POLL: Duration = Duration::from_millis(5);
const LOGIC_IDLE: Duration = Duration::from_millis(10);
const INJECTED_FAULT_STEPS: u32 = 3;

type SimAgent = PayloadAgent<Peripherals<SimBus, SimLines>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("iris-payload")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Iris payload controller running against simulated peripherals")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("mode")
                .short("m")
                .long("mode")
                .value_name("MODE")
                .help("Run link and peripheral handling in one loop or two")
                .takes_value(true)
                .possible_values(&["unified", "split"])
                .default_value("unified"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port exposing the simulated command link")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("inject-faults")
                .long("inject-faults")
                .value_name("PERCENT")
                .help("Per-device chance of a bus fault each housekeeping period")
                .takes_value(true)
                .validator(|v| match v.parse::<f32>() {
                    Ok(p) if (0.0..=100.0).contains(&p) => Ok(()),
                    _ => Err("Rate must be a percentage between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => PayloadConfig::load(path)?,
        None => PayloadConfig::default(),
    };
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let fault_rate: Option<f32> = matches
        .value_of("inject-faults")
        .map(str::parse)
        .transpose()?;
    let split = matches.value_of("mode") == Some("split");

    println!("Iris payload controller ({} deployment)", if split { "split" } else { "unified" });

    let bus = SimBus::nominal();
    let lines = SimLines::new();
    let sim_link = SimLink::new();
    let running = Arc::new(AtomicBool::new(true));

    let mut agent = PayloadAgent::new(
        Peripherals::new(bus.clone(), lines, config.reset_settle()),
        config.clone(),
    );
    let injector = fault_rate.map(|rate| FaultInjector::new(bus, rate, INJECTED_FAULT_STEPS));

    let attempts = config.link_setup_attempts;
    let Some(mut link_handle) = link::open_with_retry(
        || Ok::<_, LinkError>(sim_link.clone()),
        attempts,
        agent.faults_mut(),
    ) else {
        error!("Command link unavailable, shutting down");
        return Ok(());
    };
    let mut edges = sim_link.clone();
    sim_link.set_loopback(true);
    link::self_test(&mut link_handle, &mut edges, config.link_test_timeout(), agent.faults_mut());
    sim_link.set_loopback(false);
    sim_link.take_outbound();

    let workers = if split {
        spawn_split(agent, injector, &config, &sim_link, &running)
    } else {
        spawn_unified(agent, injector, link_handle, edges, &running)
    };

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Command link exposed on 127.0.0.1:{}", port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!("Controller connected from {}", addr);
                        let client_link = sim_link.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, client_link).await {
                                warn!("Client error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker ended abnormally: {}", e);
        }
    }
    Ok(())
}

fn spawn_unified(
    mut agent: SimAgent,
    mut injector: Option<FaultInjector>,
    mut link: SimLink,
    mut edges: SimLink,
    running: &Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let running = Arc::clone(running);
    let period = agent.config().housekeeping_period();
    vec![tokio::task::spawn_blocking(move || {
        agent.initialize();
        let mut last_injection = Instant::now();
        while running.load(Ordering::Relaxed) {
            if let Err(e) = agent.serve(&mut link, &mut edges) {
                warn!("Command handling failed: {}", e);
            }
            let now = Instant::now();
            agent.tick(now, &mut link);
            step_injector(&mut injector, &mut last_injection, now, period);
        }
    })]
}

fn spawn_split(
    agent: SimAgent,
    mut injector: Option<FaultInjector>,
    config: &PayloadConfig,
    sim_link: &SimLink,
    running: &Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let channel = LocalChannel::new(config.ipc_reference, config.channel_depth);
    let period = config.housekeeping_period();

    let mut link_service = LinkService::new(
        sim_link.clone(),
        sim_link.clone(),
        channel.clone(),
        config.link_timing(),
    );
    let link_running = Arc::clone(running);
    let link_worker = tokio::task::spawn_blocking(move || {
        while link_running.load(Ordering::Relaxed) {
            if let Err(e) = link_service.run_cycle() {
                warn!("Link cycle failed: {}", e);
            }
        }
        info!("Link loop stopped: {:?}", link_service.stats());
    });

    let mut logic_service = LogicService::new(agent, channel);
    let logic_running = Arc::clone(running);
    let logic_worker = tokio::task::spawn_blocking(move || {
        logic_service.agent_mut().initialize();
        let mut last_injection = Instant::now();
        while logic_running.load(Ordering::Relaxed) {
            let now = Instant::now();
            logic_service.run_cycle(now);
            step_injector(&mut injector, &mut last_injection, now, period);
            std::thread::sleep(LOGIC_IDLE);
        }
        info!("Logic loop stopped: {:?}", logic_service.agent().stats());
    });

    vec![link_worker, logic_worker]
}

fn step_injector(
    injector: &mut Option<FaultInjector>,
    last: &mut Instant,
    now: Instant,
    period: Duration,
) {
    let Some(injector) = injector.as_mut() else {
        return;
    };
    if now.duration_since(*last) < period {
        return;
    }
    *last = now;
    for device in injector.step() {
        warn!("Injected bus fault on {}", device);
    }
}

/// One hex-encoded command frame per line in, one hex-encoded frame per line out.
async fn handle_client(stream: TcpStream, link: SimLink) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let frame = match parse_hex(&line) {
            Ok(frame) if !frame.is_empty() => frame,
            Ok(_) => continue,
            Err(e) => {
                writer.write_all(format!("ERR {}\n", e).as_bytes()).await?;
                continue;
            }
        };

        for stale in link.take_outbound() {
            info!("Unsolicited frame: {}", to_hex(&stale));
        }
        link.inject(&frame);

        let reply = wait_for_frame(&link).await;
        let text = match reply {
            Some(bytes) => format!("{}\n", to_hex(&bytes)),
            None => "ERR timeout\n".to_string(),
        };
        writer.write_all(text.as_bytes()).await?;
    }
    Ok(())
}

async fn wait_for_frame(link: &SimLink) -> Option<Vec<u8>> {
    let deadline = time::Instant::now() + RESPONSE_TIMEOUT;
    while time::Instant::now() < deadline {
        let mut frames = link.take_outbound().into_iter();
        if let Some(first) = frames.next() {
            for extra in frames {
                info!("Unsolicited frame: {}", to_hex(&extra));
            }
            return Some(first);
        }
        time::sleep(RESPONSE_POLL).await;
    }
    None
}

fn parse_hex(line: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
    line.split_whitespace()
        .map(|token| u8::from_str_radix(token.trim_start_matches("0x"), 16))
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
