//! # RC1180 Framer
//!
//! The Radiocrafts RC1180-MBUS module streams received telegrams as
//! plain length-prefixed wM-Bus frames at 19200 baud, T1 mode only.
//! Frame boundaries are recovered with the shared wM-Bus detector.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::{check_wmbus_frame, remove_any_dll_crcs, FrameFind, FrameStatus};
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};

pub struct Rc1180Framer {
    device: String,
    buffer: Vec<u8>,
}

impl Rc1180Framer {
    pub fn new(device: &str) -> Self {
        Rc1180Framer {
            device: device.to_string(),
            buffer: Vec::new(),
        }
    }
}

impl BusDeviceFramer for Rc1180Framer {
    fn device_type(&self) -> DeviceType {
        DeviceType::Rc1180
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let mut find = FrameFind::default();
            match check_wmbus_frame(&mut self.buffer, &mut find, false) {
                FrameStatus::PartialFrame => break,
                FrameStatus::ErrorInFrame => {
                    // Buffer was flushed by the detector.
                    break;
                }
                FrameStatus::FullFrame => {
                    let mut frame =
                        self.buffer[find.payload_offset - 1..find.frame_length].to_vec();
                    self.buffer.drain(..find.frame_length);
                    remove_any_dll_crcs(&mut frame);
                    out.push(FramedTelegram {
                        about: About::new(&self.device, TelegramFormat::WMBus),
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
        lms == LinkModeSet::T1
    }
}
