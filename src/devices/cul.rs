//! # CUL Framer
//!
//! The culfw firmware (CUL/CUNO sticks) reports received wM-Bus frames
//! as ASCII lines: a leading `b`, the frame in hex with its DLL CRC
//! blocks still present, and one trailing RSSI byte. Other lines are
//! command responses (version strings and the like) and are skipped.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::remove_any_dll_crcs;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};
use crate::util::hex::decode_hex;

pub struct CulFramer {
    device: String,
    buffer: String,
}

impl CulFramer {
    pub fn new(device: &str) -> Self {
        CulFramer {
            device: device.to_string(),
            buffer: String::new(),
        }
    }

    fn frame_from_line(&self, line: &str) -> Option<FramedTelegram> {
        let line = line.trim_end_matches('\r');
        let hex = line.strip_prefix('b')?;
        let mut bytes = decode_hex(hex).ok()?;
        if bytes.len() < 12 {
            return None;
        }

        // culfw appends the RSSI register value after the frame.
        let raw = bytes.pop().unwrap_or(0) as i32;
        let rssi_dbm = if raw >= 128 { (raw - 256) / 2 - 74 } else { raw / 2 - 74 };

        remove_any_dll_crcs(&mut bytes);

        Some(FramedTelegram {
            about: About::with_rssi(&self.device, TelegramFormat::WMBus, rssi_dbm),
            frame: bytes,
        })
    }
}

impl BusDeviceFramer for CulFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cul
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.push_str(&String::from_utf8_lossy(data));
        let mut out = Vec::new();

        while let Some(nl) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=nl).collect();
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match self.frame_from_line(line) {
                Some(f) => out.push(f),
                None => log::trace!("(cul) skipping line: {line}"),
            }
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        // The CUL radio listens to a single mode at a time.
        lms == LinkModeSet::C1 || lms == LinkModeSet::T1 || lms == LinkModeSet::S1
    }

    fn link_modes_command(&self, lms: LinkModeSet) -> Option<Vec<u8>> {
        let cmd: &[u8] = if lms == LinkModeSet::C1 {
            b"brc\r\n"
        } else if lms == LinkModeSet::T1 {
            b"brt\r\n"
        } else if lms == LinkModeSet::S1 {
            b"brs\r\n"
        } else {
            return None;
        };
        Some(cmd.to_vec())
    }

    fn reset_command(&self) -> Option<Vec<u8>> {
        // Leave wmbus mode and re-query version; the bus manager follows
        // up with the link mode command.
        Some(b"X21\r\nV\r\n".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testutil::insert_format_a_crcs;
    use crate::util::hex::{encode_hex, hex_to_bytes};

    #[test]
    fn test_b_line_with_crcs_and_rssi() {
        let mut framer = CulFramer::new("cul");
        let bare = hex_to_bytes("1e44ae4c5678341203077a6a000000046d3237a92104fd170000000002");
        let framed = insert_format_a_crcs(&bare);
        let line = format!("b{}20\r\n", encode_hex(&framed)); // rssi raw 0x20
        let frames = framer.on_bytes(line.as_bytes());
        assert_eq!(frames.len(), 1);
        // CRCs are gone, length byte rewritten.
        assert_eq!(frames[0].frame[0] as usize, frames[0].frame.len() - 1);
        assert_eq!(&frames[0].frame[1..], &bare[1..]);
        assert_eq!(frames[0].about.rssi_dbm, Some(0x20 / 2 - 74));
    }

    #[test]
    fn test_version_line_skipped() {
        let mut framer = CulFramer::new("cul");
        let frames = framer.on_bytes(b"V 1.67 CUL868\r\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut framer = CulFramer::new("cul");
        let bare = hex_to_bytes("1e44ae4c5678341203077a6a000000046d3237a92104fd170000000002");
        let framed = insert_format_a_crcs(&bare);
        let line = format!("b{}7f\r\n", encode_hex(&framed));
        let (a, b) = line.as_bytes().split_at(10);
        assert!(framer.on_bytes(a).is_empty());
        assert_eq!(framer.on_bytes(b).len(), 1);
    }

    #[test]
    fn test_negative_rssi_register() {
        let mut framer = CulFramer::new("cul");
        let bare = hex_to_bytes("1e44ae4c5678341203077a6a000000046d3237a92104fd170000000002");
        let framed = insert_format_a_crcs(&bare);
        // raw 0xA0 = 160 >= 128 -> (160-256)/2 - 74 = -122
        let line = format!("b{}a0\r\n", encode_hex(&framed));
        let frames = framer.on_bytes(line.as_bytes());
        assert_eq!(frames[0].about.rssi_dbm, Some(-122));
    }
}
