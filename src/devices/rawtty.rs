//! # Raw TTY Framer
//!
//! For dongles and converters that forward the bare wM-Bus byte stream
//! with no framing of their own. Frame boundaries come from the shared
//! detector; DLL CRCs are removed when present.

use super::{BusDeviceFramer, DeviceType, FramedTelegram};
use crate::frame::{check_wmbus_frame, remove_any_dll_crcs, FrameFind, FrameStatus};
use crate::linkmode::LinkModeSet;
use crate::telegram::{About, TelegramFormat};

pub struct RawTtyFramer {
    device: String,
    buffer: Vec<u8>,
}

impl RawTtyFramer {
    pub fn new(device: &str) -> Self {
        RawTtyFramer {
            device: device.to_string(),
            buffer: Vec::new(),
        }
    }
}

impl BusDeviceFramer for RawTtyFramer {
    fn device_type(&self) -> DeviceType {
        DeviceType::RawTty
    }

    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let mut find = FrameFind::default();
            match check_wmbus_frame(&mut self.buffer, &mut find, false) {
                FrameStatus::PartialFrame | FrameStatus::ErrorInFrame => break,
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

    fn can_set_link_modes(&self, _lms: LinkModeSet) -> bool {
        // A raw tty has no radio to configure; accept anything.
        true
    }
}
