//! # wmbus-gateway - A Wireless M-Bus / M-Bus Telemetry Gateway Core
//!
//! This crate ingests raw radio or wired-bus frames from heterogeneous
//! receiver dongles and produces decoded, decrypted, parsed meter
//! telegrams ready for downstream meter-specific drivers.
//!
//! ## Subsystems
//!
//! - **Bus manager** ([`bus_manager`]) - discovers, opens, supervises,
//!   resets and tears down radio/serial devices, and funnels their
//!   telegrams into the parser through duplicate suppression.
//! - **Telegram parser** ([`telegram`]) - a layered binary decoder
//!   (DLL → ELL → NWL → AFL → TPL → data records) that validates CRCs,
//!   verifies AFL CMACs, derives ephemeral keys and decrypts AES-CBC /
//!   AES-CTR payloads, producing a parse tree with byte-level
//!   provenance.
//! - **Wire framers** ([`devices`]) - per-dongle framing (IM871A,
//!   AMB8465, CUL, RC1180, iU880B, rtl_wmbus, raw tty, wired M-Bus,
//!   simulation) on top of the shared frame detectors in [`frame`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wmbus_gateway::alarm::SilentAlarmSink;
//! use wmbus_gateway::bus_manager::{BusManager, BusManagerConfig};
//! use wmbus_gateway::crypto::MeterKeys;
//! use wmbus_gateway::serial::mock::MockSerialManager;
//! use wmbus_gateway::telegram::{About, ParserContext, Telegram};
//!
//! # fn demo(about: About, frame: &[u8]) {
//! let mut ctx = ParserContext::new();
//! let keys = MeterKeys::none();
//! let mut telegram = Telegram::new(about);
//! match telegram.parse(frame, &keys, &mut ctx) {
//!     Ok(outcome) => println!("parsed {:?}: {} records", outcome, telegram.dv_entries_ordered.len()),
//!     Err(e) => eprintln!("unparseable frame: {e}"),
//! }
//! # }
//! ```
//!
//! Serial/TTY I/O, subprocess management, configuration files and
//! publication sinks are collaborators outside this crate; see
//! [`serial`] for the interfaces they implement.

pub mod activity;
pub mod alarm;
pub mod analyze;
pub mod bus_manager;
pub mod constants;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod frame;
pub mod linkmode;
pub mod logging;
pub mod serial;
pub mod telegram;
pub mod util;

pub use crate::error::GatewayError;
pub use crate::logging::{init_logger, log_info};

// Core telegram types
pub use analyze::{render_analysis, render_analysis_ansi, render_analysis_html};
pub use telegram::{About, ParseOutcome, ParserContext, Telegram, TelegramFormat};

// Frame detection shared by the framers
pub use frame::{check_mbus_frame, check_wmbus_frame, FrameFind, FrameStatus};

// Device handling
pub use bus_manager::{BusManager, BusManagerConfig, TelegramListener};
pub use devices::spec::{SendBusContent, SpecifiedDevice};
pub use devices::{BusDeviceFramer, ContentStartsWith, DeviceType, FramedTelegram};
pub use linkmode::LinkModeSet;

// Key material
pub use crypto::{AesKey, MeterKeys};
