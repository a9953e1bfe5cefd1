//! # Iris Payload Controller
//!
//! Payload-side controller for the Iris instrument. It sits between the
//! spacecraft controller, which talks to it over a synchronous byte link, and
//! the on-board peripherals (power-rail monitors, temperature sensors and a
//! USB hub) reachable over a register bus.
//!
//! ## Features
//!
//! - **Command link**: sentinel-terminated command frames, fixed-size response frames
//! - **Device health**: one generic configure/validate/reset state machine for every peripheral
//! - **Fault reporting**: bounded fault buffer drained opportunistically to the controller
//! - **Split deployment**: link and peripheral ownership in separate loops joined by a message channel
//! - **Simulation**: in-memory bus, lines and link with fault injection
//!
//! ## Quick Start
//!
//! ```rust
//! use iris_payload::config::PayloadConfig;
//! use iris_payload::devices::Peripherals;
//! use iris_payload::sim::{SimBus, SimLines};
//! use iris_payload::PayloadAgent;
//!
//! let config = PayloadConfig::default();
//! let peripherals = Peripherals::new(SimBus::new(), SimLines::new(), config.reset_settle());
//! let mut agent = PayloadAgent::new(peripherals, config);
//!
//! let report = agent.initialize();
//! assert!(report.all_healthy());
//! ```
//!
//! ## Architecture
//!
//! - [`fault`] - fault taxonomy and the bounded fault buffer
//! - [`devices`] - device catalogue, bus and line collaborators, per-class drivers
//! - [`health`] - device health state machine
//! - [`protocol`] - command and response framing
//! - [`dispatch`] - opcode handler table
//! - [`link`] - link collaborators and the transfer gate
//! - [`bridge`] - message channel between the link and logic loops
//! - [`agent`] - housekeeping orchestrator

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod agent;
pub mod bridge;
pub mod config;
pub mod devices;
pub mod dispatch;
pub mod fault;
pub mod health;
pub mod limits;
pub mod link;
pub mod protocol;
pub mod sim;

pub use agent::PayloadAgent;
pub use fault::{FaultBuffer, FaultCategory, FaultCode};
pub use health::{HealthMonitor, HealthState};
pub use protocol::{CommandFrame, Opcode, ResponseFrame};
