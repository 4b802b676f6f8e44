//! # rtl_wmbus Framer
//!
//! The rtl-sdr path runs `rtl_sdr | rtl_wmbus` as a subprocess and reads
//! its stdout: one semicolon-separated text line per received telegram,
//!
//! ```text
//! T1;1;1;2019-04-03 19:00:42.000;117;102;94740459;0x6e4401...
//! ```
//!
//! starting with the link mode, followed by CRC status columns, a
//! timestamp, signal strength columns and finally the frame in hex.
//! The same line shape is emitted by rtl_433, so that device type
//! shares this framer.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::remove_any_dll_crcs;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};
use crate::util::hex::{decode_hex, is_hex_string};

pub struct RtlWmbusFramer {
    device: String,
    buffer: String,
}

impl RtlWmbusFramer {
    pub fn new(device: &str) -> Self {
        RtlWmbusFramer {
            device: device.to_string(),
            buffer: String::new(),
        }
    }

    fn frame_from_line(&self, line: &str) -> Option<FramedTelegram> {
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 2 {
            return None;
        }

        // The link mode column is informational; anything that is not
        // a telegram line (startup chatter from rtl_sdr) lacks it.
        let mode = fields[0];
        if !matches!(mode, "T1" | "C1" | "S1") {
            return None;
        }

        let hex = fields.last()?.trim();
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        if !is_hex_string(hex) {
            return None;
        }
        let mut frame = decode_hex(hex).ok()?;
        if frame.len() < 11 {
            return None;
        }
        remove_any_dll_crcs(&mut frame);

        // Column 4 carries the signal strength estimate in dBm.
        let rssi_dbm = fields.get(4).and_then(|f| f.trim().parse::<i32>().ok());

        let about = match rssi_dbm {
            Some(dbm) => About::with_rssi(&self.device, TelegramFormat::WMBus, dbm),
            None => About::new(&self.device, TelegramFormat::WMBus),
        };
        Some(FramedTelegram { about, frame })
    }
}

impl BusDeviceFramer for RtlWmbusFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::RtlWmbus
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.push_str(&String::from_utf8_lossy(data));
        let mut out = Vec::new();

        while let Some(nl) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=nl).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.frame_from_line(line) {
                Some(f) => out.push(f),
                None => log::trace!("(rtlwmbus) skipping line: {line}"),
            }
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        // The sdr listens wideband; rtl_wmbus decodes C1 and T1 (and S1)
        // simultaneously.
        (LinkModeSet::C1 | LinkModeSet::T1 | LinkModeSet::S1).contains(lms) && !lms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    const FRAME_HEX: &str = "1f44ae4c5678341203077a6a000000046d3237a92104fd1700000000026da921";

    #[test]
    fn test_t1_line() {
        let mut framer = RtlWmbusFramer::new("rtlwmbus[00000001]");
        let line = format!("T1;1;1;2026-08-01 10:12:00.000;-77;102;94740459;0x{FRAME_HEX}\n");
        let frames = framer.on_bytes(line.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, hex_to_bytes(FRAME_HEX));
        assert_eq!(frames[0].about.rssi_dbm, Some(-77));
    }

    #[test]
    fn test_c1_line_without_0x() {
        let mut framer = RtlWmbusFramer::new("rtlwmbus");
        let line = format!("C1;1;1;2026-08-01 10:12:00.000;117;102;94740459;{FRAME_HEX}\n");
        let frames = framer.on_bytes(line.as_bytes());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_startup_chatter_skipped() {
        let mut framer = RtlWmbusFramer::new("rtlwmbus");
        let frames =
            framer.on_bytes(b"Found 1 device(s):\nUsing device 0: Generic RTL2832U\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut framer = RtlWmbusFramer::new("rtlwmbus");
        let line = format!("T1;1;1;2026-08-01 10:12:00.000;-77;102;94740459;0x{FRAME_HEX}\n");
        let (a, b) = line.as_bytes().split_at(20);
        assert!(framer.on_bytes(a).is_empty());
        assert_eq!(framer.on_bytes(b).len(), 1);
    }
}
