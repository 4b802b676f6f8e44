//! # AMB8465 Framer
//!
//! The Amber AMB8465 prefixes every frame with 0xFF and a command byte,
//! followed by a length, the payload and an XOR checksum over everything
//! before it:
//!
//! ```text
//! FF | cmd | len | payload[len] | cs
//! ```
//!
//! Received telegrams arrive as DATA_IND (0x03). When RSSI reporting is
//! enabled in the dongle the payload carries one extra trailing RSSI
//! byte beyond the wM-Bus frame itself.

use super::{BusDeviceFramer, ContentStartsWith, DeviceType, FramedTelegram};
use crate::error::GatewayError;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};
use crate::util::hex::format_hex_compact;
use crate::util::logging::LogThrottle;

const START: u8 = 0xFF;
const CMD_DATA_REQ: u8 = 0x00;
const CMD_DATA_IND: u8 = 0x03;
const CMD_SET_MODE_REQ: u8 = 0x04;
const CMD_RESET_REQ: u8 = 0x05;

// Radio mode codes.
const MODE_S1: u8 = 0x01;
const MODE_T1: u8 = 0x05;
const MODE_C1: u8 = 0x0E;

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |a, &b| a ^ b)
}

fn command(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![START, cmd, payload.len() as u8];
    out.extend_from_slice(payload);
    out.push(xor_checksum(&out));
    out
}

pub struct Amb8465Framer {
    device: String,
    buffer: Vec<u8>,
    error_throttle: LogThrottle,
}

impl Amb8465Framer {
    pub fn new(device: &str) -> Self {
        Amb8465Framer {
            device: device.to_string(),
            buffer: Vec::new(),
            error_throttle: LogThrottle::new(1000, 5),
        }
    }

    fn try_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        while !self.buffer.is_empty() && self.buffer[0] != START {
            self.buffer.remove(0);
        }
        if self.buffer.len() < 4 {
            return None;
        }
        let cmd = self.buffer[1];
        let len = self.buffer[2] as usize;
        let total = 3 + len + 1;
        if self.buffer.len() < total {
            return None;
        }

        let expected = xor_checksum(&self.buffer[..total - 1]);
        let cs = self.buffer[total - 1];
        if cs != expected {
            if self.error_throttle.allow() {
                log::warn!(
                    "(amb8465) checksum mismatch in {}, dropping start byte to resync",
                    format_hex_compact(&self.buffer[..total.min(16)])
                );
            }
            self.buffer.remove(0);
            return self.try_frame();
        }

        let payload = self.buffer[3..3 + len].to_vec();
        self.buffer.drain(..total);
        Some((cmd, payload))
    }
}

impl BusDeviceFramer for Amb8465Framer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Amb8465
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        while let Some((cmd, payload)) = self.try_frame() {
            if cmd != CMD_DATA_IND || payload.is_empty() {
                log::trace!("(amb8465) ignoring command frame {cmd:02x}");
                continue;
            }
            // The wM-Bus frame announces its own length; one byte more
            // in the payload means a trailing RSSI byte.
            let wmbus_len = payload[0] as usize + 1;
            let (frame, rssi) = if payload.len() == wmbus_len + 1 {
                let raw = payload[payload.len() - 1];
                (
                    payload[..wmbus_len].to_vec(),
                    Some((raw as i32) / 2 - 130),
                )
            } else {
                (payload, None)
            };

            let about = match rssi {
                Some(dbm) => About::with_rssi(&self.device, TelegramFormat::WMBus, dbm),
                None => About::new(&self.device, TelegramFormat::WMBus),
            };
            out.push(FramedTelegram { about, frame });
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        // One radio mode at a time.
        matches!(lms, l if l == LinkModeSet::C1 || l == LinkModeSet::T1 || l == LinkModeSet::S1)
    }

    fn link_modes_command(&self, lms: LinkModeSet) -> Option<Vec<u8>> {
        let mode = if lms == LinkModeSet::C1 {
            MODE_C1
        } else if lms == LinkModeSet::T1 {
            MODE_T1
        } else if lms == LinkModeSet::S1 {
            MODE_S1
        } else {
            return None;
        };
        Some(command(CMD_SET_MODE_REQ, &[mode]))
    }

    fn reset_command(&self) -> Option<Vec<u8>> {
        Some(command(CMD_RESET_REQ, &[]))
    }

    fn send_telegram(
        &self,
        starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        if starts_with != ContentStartsWith::CField {
            return Err(GatewayError::SendRejected(
                "amb8465 sends content starting at the C field".to_string(),
            ));
        }
        if content.len() > 0xF8 {
            return Err(GatewayError::SendRejected(
                "amb8465 telegram too long".to_string(),
            ));
        }
        Ok(command(CMD_DATA_REQ, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    #[test]
    fn test_data_ind_without_rssi() {
        let mut framer = Amb8465Framer::new("amb8465");
        let telegram = hex_to_bytes("0a44ae4c56783412030700");
        let frames = framer.on_bytes(&command(CMD_DATA_IND, &telegram));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, telegram);
        assert_eq!(frames[0].about.rssi_dbm, None);
    }

    #[test]
    fn test_data_ind_with_rssi() {
        let mut framer = Amb8465Framer::new("amb8465");
        let telegram = hex_to_bytes("0a44ae4c56783412030700");
        let mut payload = telegram.clone();
        payload.push(100); // rssi raw
        let frames = framer.on_bytes(&command(CMD_DATA_IND, &payload));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, telegram);
        assert_eq!(frames[0].about.rssi_dbm, Some(100 / 2 - 130));
    }

    #[test]
    fn test_bad_checksum_resyncs() {
        let mut framer = Amb8465Framer::new("amb8465");
        let telegram = hex_to_bytes("0a44ae4c56783412030700");
        let mut wire = command(CMD_DATA_IND, &telegram);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF; // corrupt checksum
        assert!(framer.on_bytes(&wire).is_empty());

        // A following intact frame still decodes.
        let frames = framer.on_bytes(&command(CMD_DATA_IND, &telegram));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_split_delivery() {
        let mut framer = Amb8465Framer::new("amb8465");
        let telegram = hex_to_bytes("0a44ae4c56783412030700");
        let wire = command(CMD_DATA_IND, &telegram);
        assert!(framer.on_bytes(&wire[..5]).is_empty());
        assert_eq!(framer.on_bytes(&wire[5..]).len(), 1);
    }

    #[test]
    fn test_single_link_mode_only() {
        let framer = Amb8465Framer::new("amb8465");
        assert!(framer.can_set_link_modes(LinkModeSet::C1));
        assert!(framer.can_set_link_modes(LinkModeSet::T1));
        assert!(!framer.can_set_link_modes(LinkModeSet::C1 | LinkModeSet::T1));
    }
}
