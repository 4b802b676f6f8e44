//! # Simulation Framer
//!
//! Replays telegrams from text: either `telegram=|HEX|` lines as used by
//! simulation files, or bare hex lines (which is also how inline hex
//! device specifications are fed). Timing annotations and comments are
//! ignored; the replay driver itself lives outside the core.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::remove_any_dll_crcs;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};
use crate::util::hex::{decode_hex, is_hex_string};

pub struct SimulationFramer {
    device: String,
    buffer: String,
}

impl SimulationFramer {
    pub fn new(device: &str) -> Self {
        SimulationFramer {
            device: device.to_string(),
            buffer: String::new(),
        }
    }

    fn frame_from_line(&self, line: &str) -> Option<FramedTelegram> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let hex = if let Some(rest) = line.strip_prefix("telegram=") {
            rest.trim_matches('|')
        } else {
            line
        };
        if !is_hex_string(hex) {
            return None;
        }

        let mut frame = decode_hex(hex).ok()?;
        if frame.len() < 11 {
            return None;
        }
        remove_any_dll_crcs(&mut frame);
        Some(FramedTelegram {
            about: About::new(&self.device, TelegramFormat::WMBus),
            frame,
        })
    }
}

impl BusDeviceFramer for SimulationFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Simulation
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.push_str(&String::from_utf8_lossy(data));
        let mut out = Vec::new();

        while let Some(nl) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=nl).collect();
            if let Some(f) = self.frame_from_line(&line) {
                out.push(f);
            }
        }
        // A final line without newline still replays (inline hex specs).
        if !self.buffer.is_empty() && is_hex_string(self.buffer.trim()) {
            let line = std::mem::take(&mut self.buffer);
            if let Some(f) = self.frame_from_line(&line) {
                out.push(f);
            }
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, _lms: LinkModeSet) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    const FRAME_HEX: &str = "1f44ae4c5678341203077a6a000000046d3237a92104fd1700000000026da921";

    #[test]
    fn test_telegram_line() {
        let mut framer = SimulationFramer::new("simulation_x.txt");
        let line = format!("telegram=|{FRAME_HEX}|\n");
        let frames = framer.on_bytes(line.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, hex_to_bytes(FRAME_HEX));
    }

    #[test]
    fn test_bare_hex_without_newline() {
        let mut framer = SimulationFramer::new("hex");
        let frames = framer.on_bytes(FRAME_HEX.as_bytes());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_comments_ignored() {
        let mut framer = SimulationFramer::new("simulation_x.txt");
        let frames = framer.on_bytes(b"# a comment\n\n");
        assert!(frames.is_empty());
    }
}
