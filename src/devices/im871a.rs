//! # IM871A Framer
//!
//! The iM871A (IMST WiMOD) talks a binary HCI protocol at 57600 baud:
//!
//! ```text
//! A5 | ctrl<<4|endpoint | msgid | len | payload[len] | [ts 4] [rssi 1] [fcs 2]
//! ```
//!
//! Received wM-Bus telegrams arrive on the RADIOLINK endpoint as
//! WMBUSMSG_IND with the DLL CRC blocks already stripped by the dongle.
//! The optional trailer fields are announced by control nibble bits.

use super::{BusDeviceFramer, ContentStartsWith, DeviceType, FramedTelegram};
use crate::error::GatewayError;
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};
use crate::util::hex::format_hex_compact;
use crate::util::logging::LogThrottle;

const SOF: u8 = 0xA5;

const DEVMGMT_ID: u8 = 0x01;
const RADIOLINK_ID: u8 = 0x02;

const RADIOLINK_MSG_WMBUSMSG_IND: u8 = 0x03;
const RADIOLINK_MSG_WMBUSMSG_REQ: u8 = 0x01;
const DEVMGMT_MSG_SET_CONFIG_REQ: u8 = 0x03;
const DEVMGMT_MSG_RESET_REQ: u8 = 0x07;

// Control nibble bits announcing trailer fields.
const CTRL_HAS_TIMESTAMP: u8 = 0x02;
const CTRL_HAS_RSSI: u8 = 0x04;
const CTRL_HAS_FCS: u8 = 0x08;

// Link mode codes of the radio configuration.
const LINK_MODE_S1: u8 = 0x00;
const LINK_MODE_T1: u8 = 0x04;
const LINK_MODE_C1A: u8 = 0x06;
const LINK_MODE_CT_NARROW: u8 = 0x09;

pub struct Im871aFramer {
    device: String,
    buffer: Vec<u8>,
    error_throttle: LogThrottle,
}

impl Im871aFramer {
    pub fn new(device: &str) -> Self {
        Im871aFramer {
            device: device.to_string(),
            buffer: Vec::new(),
            error_throttle: LogThrottle::new(1000, 5),
        }
    }

    /// Try to pop one HCI frame off the front of the buffer.
    fn try_frame(&mut self) -> Option<(u8, u8, u8, Vec<u8>, Option<i32>)> {
        // Resync on the SOF byte.
        let skip = self
            .buffer
            .iter()
            .position(|&b| b == SOF)
            .unwrap_or(self.buffer.len());
        if skip > 0 {
            if self.error_throttle.allow() {
                log::warn!(
                    "(im871a) skipping {skip} bytes of noise: {}",
                    format_hex_compact(&self.buffer[..skip.min(16)])
                );
            }
            self.buffer.drain(..skip);
        }
        if self.buffer.len() < 4 {
            return None;
        }

        let ctrl = self.buffer[1] >> 4;
        let endpoint = self.buffer[1] & 0x0F;
        let msgid = self.buffer[2];
        let len = self.buffer[3] as usize;

        let mut total = 4 + len;
        if ctrl & CTRL_HAS_TIMESTAMP != 0 {
            total += 4;
        }
        let rssi_at = total;
        if ctrl & CTRL_HAS_RSSI != 0 {
            total += 1;
        }
        if ctrl & CTRL_HAS_FCS != 0 {
            total += 2;
        }
        if self.buffer.len() < total {
            return None;
        }

        let payload = self.buffer[4..4 + len].to_vec();
        let rssi = if ctrl & CTRL_HAS_RSSI != 0 {
            // Datasheet: RSSI value is in half dBm steps offset by -130.
            Some((self.buffer[rssi_at] as i32) / 2 - 130)
        } else {
            None
        };
        self.buffer.drain(..total);
        Some((endpoint, msgid, ctrl, payload, rssi))
    }

    fn hci(endpoint: u8, msgid: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![SOF, endpoint, msgid, payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }
}

impl BusDeviceFramer for Im871aFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Im871a
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        while let Some((endpoint, msgid, _ctrl, payload, rssi)) = self.try_frame() {
            if endpoint != RADIOLINK_ID || msgid != RADIOLINK_MSG_WMBUSMSG_IND {
                log::trace!(
                    "(im871a) ignoring hci message endpoint={endpoint:02x} msgid={msgid:02x}"
                );
                continue;
            }
            if payload.is_empty() {
                continue;
            }
            let about = match rssi {
                Some(dbm) => About::with_rssi(&self.device, TelegramFormat::WMBus, dbm),
                None => About::new(&self.device, TelegramFormat::WMBus),
            };
            out.push(FramedTelegram {
                about,
                frame: payload,
            });
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        // C1 and T1 can be listened to at the same time; S1 is exclusive.
        let supported = LinkModeSet::C1 | LinkModeSet::T1;
        if lms == LinkModeSet::S1 {
            return true;
        }
        !lms.is_empty() && supported.contains(lms)
    }

    fn link_modes_command(&self, lms: LinkModeSet) -> Option<Vec<u8>> {
        let mode = if lms.contains(LinkModeSet::C1) && lms.contains(LinkModeSet::T1) {
            LINK_MODE_CT_NARROW
        } else if lms.contains(LinkModeSet::C1) {
            LINK_MODE_C1A
        } else if lms.contains(LinkModeSet::T1) {
            LINK_MODE_T1
        } else if lms.contains(LinkModeSet::S1) {
            LINK_MODE_S1
        } else {
            return None;
        };
        // Volatile config write of the link mode field.
        Some(Self::hci(DEVMGMT_ID, DEVMGMT_MSG_SET_CONFIG_REQ, &[0x00, 0x03, mode]))
    }

    fn reset_command(&self) -> Option<Vec<u8>> {
        Some(Self::hci(DEVMGMT_ID, DEVMGMT_MSG_RESET_REQ, &[]))
    }

    fn send_telegram(
        &self,
        starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        if starts_with != ContentStartsWith::CField {
            return Err(GatewayError::SendRejected(
                "im871a sends content starting at the C field".to_string(),
            ));
        }
        if content.len() > 0xF8 {
            return Err(GatewayError::SendRejected(
                "im871a telegram too long".to_string(),
            ));
        }
        Ok(Self::hci(RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_REQ, content))
    }
}
