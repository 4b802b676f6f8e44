//! # Utility Modules
//!
//! Common helpers shared by the framers, the telegram parser and the bus
//! manager: hex encoding/decoding, the EN 13757 CRC and throttled logging.

pub mod crc;
pub mod hex;
pub mod logging;

pub use crc::crc16_en13757;
pub use hex::{decode_hex, encode_hex, format_hex_compact, hex_to_bytes};
pub use logging::LogThrottle;
