use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use iris_payload::devices::{current, thermal, DeviceId, Quantity};
use iris_payload::fault::{FaultCode, NO_FAULT};
use iris_payload::health::HealthState;
use iris_payload::protocol::{
    CommandFrame, ErrorTransferFrame, Opcode, ResponseFrame, RETURN_MARKER,
};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How to read the answer to a command.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Status,
    HealthStatus,
    Reading(DeviceId, Quantity),
    Codes,
    Raw,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("irisctl")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Command the Iris payload controller over its command link")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Payload controller host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Payload controller link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Show raw frames")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("rail")
                .about("Power-rail monitors (1=3V3, 2=5V, 3=camera)")
                .arg(
                    Arg::with_name("action")
                        .required(true)
                        .possible_values(&[
                            "setup", "validate", "status", "reset", "current", "voltage", "power",
                            "peak", "limits",
                        ]),
                )
                .arg(Arg::with_name("rail").help("Rail selector").validator(selector(3))),
        )
        .subcommand(
            SubCommand::with_name("temp")
                .about("Temperature channels (1-4)")
                .arg(
                    Arg::with_name("action")
                        .required(true)
                        .possible_values(&["setup", "validate", "status", "reset", "read", "limits"]),
                )
                .arg(Arg::with_name("channel").help("Channel selector").validator(selector(4))),
        )
        .subcommand(
            SubCommand::with_name("hub")
                .about("USB hub")
                .arg(
                    Arg::with_name("action")
                        .required(true)
                        .possible_values(&["setup", "validate", "reset"]),
                ),
        )
        .subcommand(SubCommand::with_name("errors").about("Request the pending fault codes"))
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send raw command bytes (hex)")
                .arg(Arg::with_name("bytes").required(true).multiple(true)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    let (frame, expect) = match matches.subcommand() {
        ("rail", Some(sub)) => rail_command(sub)?,
        ("temp", Some(sub)) => temp_command(sub)?,
        ("hub", Some(sub)) => {
            let opcode = match sub.value_of("action") {
                Some("setup") => Opcode::HubSetup,
                Some("validate") => Opcode::HubValidate,
                _ => Opcode::HubReset,
            };
            (CommandFrame::new(opcode, &[])?, Expect::Status)
        }
        ("errors", Some(_)) => (CommandFrame::new(Opcode::ErrorTransfer, &[])?, Expect::Raw),
        ("raw", Some(sub)) => {
            let bytes = sub
                .values_of("bytes")
                .into_iter()
                .flatten()
                .map(|token| u8::from_str_radix(token.trim_start_matches("0x"), 16))
                .collect::<Result<Vec<u8>, _>>()?;
            (CommandFrame::decode(&bytes)?, Expect::Raw)
        }
        _ => return Ok(()),
    };

    let request = frame.encode();
    if verbose {
        println!("{} {}", "→".bright_black(), to_hex(&request).bright_black());
    }
    let reply = exchange(host, port, &request).await?;
    if verbose {
        println!("{} {}", "←".bright_black(), to_hex(&reply).bright_black());
    }

    match format {
        "json" => print_json(&reply, expect),
        _ => print_table(&reply, expect),
    }
    Ok(())
}

fn selector(max: u8) -> impl Fn(String) -> Result<(), String> {
    move |v| match v.parse::<u8>() {
        Ok(n) if (1..=max).contains(&n) => Ok(()),
        _ => Err(format!("Selector must be between 1 and {}", max)),
    }
}

fn selector_arg(matches: &ArgMatches<'_>, name: &str) -> Result<u8, Box<dyn std::error::Error>> {
    let value = matches
        .value_of(name)
        .ok_or_else(|| format!("{} selector required for this action", name))?;
    Ok(value.parse()?)
}

fn rail_command(
    matches: &ArgMatches<'_>,
) -> Result<(CommandFrame, Expect), Box<dyn std::error::Error>> {
    let action = matches.value_of("action").unwrap_or("status");
    if action == "limits" {
        return Ok((CommandFrame::new(Opcode::CurrentReadLimit, &[])?, Expect::Codes));
    }
    let rail = selector_arg(matches, "rail")?;
    let device = DeviceId::rail(rail).ok_or("unknown rail")?;
    let (opcode, expect) = match action {
        "setup" => (Opcode::CurrentSetup, Expect::Status),
        "validate" => (Opcode::CurrentValidate, Expect::Status),
        "status" => (Opcode::CurrentStatus, Expect::HealthStatus),
        "reset" => (Opcode::CurrentReset, Expect::Status),
        "current" => (Opcode::CurrentReadCurrent, Expect::Reading(device, Quantity::Current)),
        "voltage" => (Opcode::CurrentReadVoltage, Expect::Reading(device, Quantity::BusVoltage)),
        "power" => (Opcode::CurrentReadPower, Expect::Reading(device, Quantity::Power)),
        _ => (Opcode::CurrentReadPeakPower, Expect::Reading(device, Quantity::PeakPower)),
    };
    Ok((CommandFrame::new(opcode, &[rail])?, expect))
}

fn temp_command(
    matches: &ArgMatches<'_>,
) -> Result<(CommandFrame, Expect), Box<dyn std::error::Error>> {
    let action = matches.value_of("action").unwrap_or("status");
    if action == "limits" {
        return Ok((CommandFrame::new(Opcode::TempReadLimit, &[])?, Expect::Codes));
    }
    let channel = selector_arg(matches, "channel")?;
    let device = DeviceId::temperature_channel(channel).ok_or("unknown channel")?;
    let (opcode, expect) = match action {
        "setup" => (Opcode::TempSetup, Expect::Status),
        "validate" => (Opcode::TempValidate, Expect::Status),
        "status" => (Opcode::TempStatus, Expect::HealthStatus),
        "reset" => (Opcode::TempReset, Expect::Status),
        _ => (Opcode::TempRead, Expect::Reading(device, Quantity::Temperature)),
    };
    Ok((CommandFrame::new(opcode, &[channel])?, expect))
}

async fn exchange(host: &str, port: u16, request: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to payload controller at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start it with: {}", "💡".yellow(), "iris-payload".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let line = tokio::time::timeout(COMMAND_TIMEOUT, async {
        writer.write_all(format!("{}\n", to_hex(request)).as_bytes()).await?;
        lines.next_line().await
    })
    .await
    .map_err(|_| "command timed out")??
    .ok_or("connection closed")?;

    if let Some(reason) = line.strip_prefix("ERR ") {
        return Err(reason.to_string().into());
    }
    let bytes = line
        .split_whitespace()
        .map(|token| u8::from_str_radix(token, 16))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(bytes)
}

fn describe(code: u8) -> String {
    if code == NO_FAULT {
        return "ok".to_string();
    }
    FaultCode::from_narrow(code).map_or_else(|| format!("unknown code 0x{:02X}", code), |f| f.to_string())
}

fn reading(device: DeviceId, quantity: Quantity, raw: u16) -> (f64, &'static str) {
    match quantity {
        Quantity::Current => (f64::from(current::current_ma(device, raw)), "mA"),
        Quantity::BusVoltage => (f64::from(current::bus_voltage_mv(raw)), "mV"),
        Quantity::Power | Quantity::PeakPower => (f64::from(current::power_mw(device, raw)), "mW"),
        Quantity::Temperature => (f64::from(thermal::celsius(raw)), "°C"),
    }
}

fn print_table(reply: &[u8], expect: Expect) {
    if reply.first() == Some(&(Opcode::ErrorTransfer as u8)) {
        match ErrorTransferFrame::parse(reply) {
            Ok(frame) if frame.count() == 0 => println!("{} {}", "✅".green(), "No pending faults".bright_green()),
            Ok(frame) => {
                println!("{} {} pending fault(s)", "⚠️ ".yellow(), frame.count());
                for code in frame.codes() {
                    println!("   {} {}", format!("0x{:02X}", code).bright_white(), describe(*code).bright_red());
                }
            }
            Err(e) => println!("{} Malformed error transfer: {}", "❌".red(), e),
        }
        return;
    }

    let frame = match ResponseFrame::parse(reply) {
        Ok(frame) => frame,
        Err(e) => {
            println!("{} Malformed response: {}", "❌".red(), e);
            return;
        }
    };

    if !frame.is_success() && !matches!(expect, Expect::Codes) {
        println!("{} {}", "❌".red(), describe(frame.status_byte()).bright_red());
        return;
    }

    match expect {
        Expect::Status | Expect::Raw => {
            println!("{} {}", "✅".green(), "Command completed".bright_green());
            if !frame.payload().is_empty() {
                println!("   payload {}", to_hex(frame.payload()).bright_cyan());
            }
        }
        Expect::HealthStatus => {
            let state = frame
                .payload()
                .first()
                .and_then(|b| HealthState::from_repr(*b))
                .map_or_else(|| "unknown".to_string(), |s| format!("{:?}", s));
            let attempts = frame.payload().get(1).copied().unwrap_or(0);
            println!("{} state {} after {} attempt(s)", "✅".green(), state.bright_cyan(), attempts);
        }
        Expect::Reading(device, quantity) => match frame.word_value() {
            Some(raw) => {
                let (value, unit) = reading(device, quantity, raw);
                println!(
                    "{} {} {:?}: {} (raw 0x{:04X})",
                    "✅".green(),
                    device.to_string().bright_white(),
                    quantity,
                    format!("{:.1} {}", value, unit).bright_cyan(),
                    raw
                );
            }
            None => println!("{} Response carried no reading", "❌".red()),
        },
        Expect::Codes => {
            if frame.is_success() {
                println!("{} {}", "✅".green(), "All readings within limits".bright_green());
            } else {
                let codes = std::iter::once(frame.status_byte()).chain(frame.payload().iter().copied());
                for code in codes.filter(|c| *c != NO_FAULT) {
                    println!("{} {}", "⚠️ ".yellow(), describe(code).bright_red());
                }
            }
        }
    }
}

fn print_json(reply: &[u8], expect: Expect) {
    let value = if reply.first() == Some(&RETURN_MARKER) {
        match ResponseFrame::parse(reply) {
            Ok(frame) => {
                let measurement = match expect {
                    Expect::Reading(device, quantity) => frame.word_value().map(|raw| {
                        let (value, unit) = reading(device, quantity, raw);
                        json!({ "raw": raw, "value": value, "unit": unit })
                    }),
                    _ => None,
                };
                json!({
                    "kind": "response",
                    "status": frame.status_byte(),
                    "status_text": describe(frame.status_byte()),
                    "payload": frame.payload(),
                    "reading": measurement,
                })
            }
            Err(e) => json!({ "kind": "invalid", "error": e.to_string() }),
        }
    } else {
        match ErrorTransferFrame::parse(reply) {
            Ok(frame) => {
                let faults: Vec<_> = frame
                    .codes()
                    .iter()
                    .map(|code| json!({ "code": code, "text": describe(*code) }))
                    .collect();
                json!({
                    "kind": "error_transfer",
                    "count": frame.count(),
                    "faults": faults,
                })
            }
            Err(e) => json!({ "kind": "invalid", "error": e.to_string() }),
        }
    };
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
