//! # Wired M-Bus Framer
//!
//! A serial M-Bus master port. Inbound traffic consists of 0xE5
//! acknowledgements and `68 L L 68 ... CS 16` long frames; outbound,
//! this is the only device family where sending is routine (REQ-UD2
//! polling, secondary address selection).

use super::{BusDeviceFramer, ContentStartsWith, DeviceType, FramedTelegram};
use crate::error::GatewayError;
use crate::frame::{check_mbus_frame, FrameFind, FrameStatus};
use bytes::{BufMut, BytesMut};
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};

pub struct MBusFramer {
    device: String,
    buffer: Vec<u8>,
}

impl MBusFramer {
    pub fn new(device: &str) -> Self {
        MBusFramer {
            device: device.to_string(),
            buffer: Vec::new(),
        }
    }
}

fn mbus_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |a, &b| a.wrapping_add(b))
}

impl BusDeviceFramer for MBusFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::MBus
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let mut find = FrameFind::default();
            match check_mbus_frame(&mut self.buffer, &mut find, false) {
                FrameStatus::PartialFrame | FrameStatus::ErrorInFrame => break,
                FrameStatus::FullFrame => {
                    if find.frame_length == 1 {
                        // A bare E5 acknowledgement carries no telegram.
                        log::debug!("(mbus) received E5 ack");
                        self.buffer.drain(..1);
                        continue;
                    }
                    // Hand over the frame without checksum and stop byte.
                    let frame = self.buffer[..find.frame_length - 2].to_vec();
                    self.buffer.drain(..find.frame_length);
                    out.push(FramedTelegram {
                        about: About::new(&self.device, TelegramFormat::MBus),
                        frame,
                    });
                }
            }
        }
        out
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        // Wired bus, no radio link modes.
        lms.is_empty() || lms == LinkModeSet::ANY
    }

    fn send_telegram(
        &self,
        starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        let mut out = BytesMut::with_capacity(content.len() + 6);
        match starts_with {
            ContentStartsWith::ShortFrame => {
                if content.len() != 2 {
                    return Err(GatewayError::SendRejected(
                        "an mbus short frame is C and A, exactly two bytes".to_string(),
                    ));
                }
                out.put_u8(0x10);
                out.put_slice(content);
                out.put_u8(mbus_checksum(content));
                out.put_u8(0x16);
            }
            ContentStartsWith::LongFrame | ContentStartsWith::CField => {
                if content.is_empty() || content.len() > 250 {
                    return Err(GatewayError::SendRejected(
                        "mbus long frame payload must be 1..=250 bytes".to_string(),
                    ));
                }
                out.put_u8(0x68);
                out.put_u8(content.len() as u8);
                out.put_u8(content.len() as u8);
                out.put_u8(0x68);
                out.put_slice(content);
                out.put_u8(mbus_checksum(content));
                out.put_u8(0x16);
            }
            ContentStartsWith::CiField => {
                return Err(GatewayError::SendRejected(
                    "mbus sends start at the C field or a full frame".to_string(),
                ))
            }
        }
        Ok(out.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    fn long_frame(body: &[u8]) -> Vec<u8> {
        let mut wire = vec![0x68, body.len() as u8, body.len() as u8, 0x68];
        wire.extend_from_slice(body);
        wire.push(mbus_checksum(body));
        wire.push(0x16);
        wire
    }

    #[test]
    fn test_long_frame_strips_trailer() {
        let mut framer = MBusFramer::new("/dev/ttyUSB0:mbus");
        let body = hex_to_bytes("0801727856341224400107550000000c78563412");
        let frames = framer.on_bytes(&long_frame(&body));
        assert_eq!(frames.len(), 1);
        // 68 L L 68 + body, checksum and stop removed.
        assert_eq!(frames[0].frame.len(), 4 + body.len());
        assert_eq!(&frames[0].frame[4..], &body[..]);
        assert_eq!(frames[0].about.format, TelegramFormat::MBus);
    }

    #[test]
    fn test_ack_produces_no_telegram() {
        let mut framer = MBusFramer::new("mbus");
        let body = hex_to_bytes("0801727856341224400107550000000c78563412");
        let mut wire = vec![0xE5];
        wire.extend_from_slice(&long_frame(&body));
        let frames = framer.on_bytes(&wire);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_send_short_frame() {
        let framer = MBusFramer::new("mbus");
        // REQ-UD2 to primary address 1.
        let wire = framer
            .send_telegram(ContentStartsWith::ShortFrame, &[0x5B, 0x01])
            .unwrap();
        assert_eq!(wire, vec![0x10, 0x5B, 0x01, 0x5C, 0x16]);
    }

    #[test]
    fn test_send_long_frame() {
        let framer = MBusFramer::new("mbus");
        let content = hex_to_bytes("530151");
        let wire = framer
            .send_telegram(ContentStartsWith::LongFrame, &content)
            .unwrap();
        assert_eq!(wire[0], 0x68);
        assert_eq!(wire[1], 3);
        assert_eq!(wire[2], 3);
        assert_eq!(wire[3], 0x68);
        assert_eq!(*wire.last().unwrap(), 0x16);
    }
}
