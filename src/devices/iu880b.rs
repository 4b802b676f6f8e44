//! # iU880B Framer
//!
//! The IMST iU880B speaks the WiMOD HCI protocol over SLIP framing:
//! frames are delimited by 0xC0 with the usual 0xDB escapes, and carry
//! `dst | msgid | payload | fcs(2)` where the FCS is the X.25 CRC-16
//! over everything before it. Received telegrams arrive on the radio
//! link endpoint.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::remove_any_dll_crcs;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

const RADIOLINK_ID: u8 = 0x02;
const RADIOLINK_MSG_WMBUSMSG_IND: u8 = 0x03;

/// X.25 CRC-16 (poly 0x8408 reflected, init 0xFFFF, final complement).
fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

pub struct Iu880bFramer {
    device: String,
    buffer: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    current: Vec<u8>,
}

impl Iu880bFramer {
    pub fn new(device: &str) -> Self {
        Iu880bFramer {
            device: device.to_string(),
            buffer: Vec::new(),
            in_frame: false,
            escaped: false,
            current: Vec::new(),
        }
    }

    fn handle_hci(&self, hci: &[u8]) -> Option<FramedTelegram> {
        if hci.len() < 4 {
            return None;
        }
        let (body, fcs) = hci.split_at(hci.len() - 2);
        let received = u16::from_le_bytes([fcs[0], fcs[1]]);
        if crc16_x25(body) != received {
            log::debug!("(iu880b) hci fcs mismatch, dropping frame");
            return None;
        }
        let dst = body[0] & 0x0F;
        let msgid = body[1];
        if dst != RADIOLINK_ID || msgid != RADIOLINK_MSG_WMBUSMSG_IND {
            log::trace!("(iu880b) ignoring hci message dst={dst:02x} msgid={msgid:02x}");
            return None;
        }
        let mut frame = body[2..].to_vec();
        if frame.is_empty() {
            return None;
        }
        remove_any_dll_crcs(&mut frame);
        Some(FramedTelegram {
            about: About::new(&self.device, TelegramFormat::WMBus),
            frame,
        })
    }
}

impl BusDeviceFramer for Iu880bFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Iu880b
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        for i in 0..self.buffer.len() {
            let b = self.buffer[i];
            match b {
                SLIP_END => {
                    if self.in_frame && !self.current.is_empty() {
                        let hci = std::mem::take(&mut self.current);
                        if let Some(f) = self.handle_hci(&hci) {
                            out.push(f);
                        }
                    }
                    self.in_frame = true;
                    self.escaped = false;
                    self.current.clear();
                }
                SLIP_ESC if self.in_frame => {
                    self.escaped = true;
                }
                _ if self.in_frame => {
                    let b = if self.escaped {
                        self.escaped = false;
                        match b {
                            SLIP_ESC_END => SLIP_END,
                            SLIP_ESC_ESC => SLIP_ESC,
                            other => other,
                        }
                    } else {
                        b
                    };
                    self.current.push(b);
                }
                _ => {
                    // Bytes outside any frame are noise.
                }
            }
        }
        self.buffer.clear();
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.current.clear();
        self.in_frame = false;
        self.escaped = false;
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        lms == LinkModeSet::C1 || lms == LinkModeSet::T1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    fn slip_wrap(body: &[u8]) -> Vec<u8> {
        let mut hci = body.to_vec();
        let fcs = crc16_x25(body);
        hci.extend_from_slice(&fcs.to_le_bytes());

        let mut out = vec![SLIP_END];
        for &b in &hci {
            match b {
                SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
                SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                _ => out.push(b),
            }
        }
        out.push(SLIP_END);
        out
    }

    #[test]
    fn test_wmbus_ind_decodes() {
        let mut framer = Iu880bFramer::new("iu880b");
        let telegram = hex_to_bytes("1f44ae4c5678341203077a6a000000046d3237a92104fd1700000000026da921");
        let mut body = vec![RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_IND];
        body.extend_from_slice(&telegram);
        let frames = framer.on_bytes(&slip_wrap(&body));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, telegram);
    }

    #[test]
    fn test_bad_fcs_dropped() {
        let mut framer = Iu880bFramer::new("iu880b");
        let body = vec![RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_IND, 0x01, 0x02];
        let mut wire = slip_wrap(&body);
        // Corrupt one payload byte after wrapping.
        wire[3] ^= 0x55;
        assert!(framer.on_bytes(&wire).is_empty());
    }

    #[test]
    fn test_escaped_delimiter_in_payload() {
        let mut framer = Iu880bFramer::new("iu880b");
        // Telegram containing 0xC0 and 0xDB bytes.
        let telegram = vec![0x0B, 0x44, 0xC0, 0xDB, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut body = vec![RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_IND];
        body.extend_from_slice(&telegram);
        let frames = framer.on_bytes(&slip_wrap(&body));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame, telegram);
    }

    #[test]
    fn test_x25_crc_known_vector() {
        // "123456789" -> 0x906E per the CRC catalogue.
        assert_eq!(crc16_x25(b"123456789"), 0x906E);
    }
}
