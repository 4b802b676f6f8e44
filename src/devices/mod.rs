//! # Bus Device Framers
//!
//! Every supported dongle family speaks its own framing around the raw
//! wM-Bus or M-Bus telegram: binary HCI protocols (IM871A, iU880B),
//! checksummed command frames (AMB8465), ASCII lines (CUL, rtl_wmbus),
//! or nothing at all (rawtty, wired M-Bus). A framer consumes the byte
//! stream of one device and emits `(About, frame)` events holding clean
//! telegrams with DLL CRCs already removed.
//!
//! Framers are synchronous and never block: they accumulate partial
//! input and return zero or more complete telegrams per call. All I/O
//! stays in the bus manager.

pub mod amb8465;
pub mod cul;
pub mod detect;
pub mod im871a;
pub mod iu880b;
pub mod mbus;
pub mod rawtty;
pub mod rc1180;
pub mod rtlwmbus;
pub mod simulation;
pub mod spec;

use crate::error::GatewayError;
use crate::linkmode::LinkModeSet;
use crate::telegram::About;

/// The dongle families the gateway can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// Placeholder until auto detection resolves the real type.
    Auto,
    Im871a,
    Amb8465,
    Cul,
    Rc1180,
    Iu880b,
    RawTty,
    RtlWmbus,
    /// Parsed for compatibility; autodetect never selects it.
    Rtl433,
    MBus,
    Simulation,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn parse(s: &str) -> Option<DeviceType> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(DeviceType::Auto),
            "im871a" => Some(DeviceType::Im871a),
            "amb8465" => Some(DeviceType::Amb8465),
            "cul" => Some(DeviceType::Cul),
            "rc1180" => Some(DeviceType::Rc1180),
            "iu880b" => Some(DeviceType::Iu880b),
            "rawtty" => Some(DeviceType::RawTty),
            "rtlwmbus" => Some(DeviceType::RtlWmbus),
            "rtl433" => Some(DeviceType::Rtl433),
            "mbus" => Some(DeviceType::MBus),
            // Inline hex telegrams replay through the simulation framer.
            "simulation" | "hex" => Some(DeviceType::Simulation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Auto => "auto",
            DeviceType::Im871a => "im871a",
            DeviceType::Amb8465 => "amb8465",
            DeviceType::Cul => "cul",
            DeviceType::Rc1180 => "rc1180",
            DeviceType::Iu880b => "iu880b",
            DeviceType::RawTty => "rawtty",
            DeviceType::RtlWmbus => "rtlwmbus",
            DeviceType::Rtl433 => "rtl433",
            DeviceType::MBus => "mbus",
            DeviceType::Simulation => "simulation",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Device types found by probing serial ttys.
    pub fn uses_tty(&self) -> bool {
        matches!(
            self,
            DeviceType::Auto
                | DeviceType::Im871a
                | DeviceType::Amb8465
                | DeviceType::Cul
                | DeviceType::Rc1180
                | DeviceType::Iu880b
                | DeviceType::RawTty
                | DeviceType::MBus
        )
    }

    /// Device types found by enumerating rtl-sdr dongles.
    pub fn uses_rtlsdr(&self) -> bool {
        matches!(self, DeviceType::Auto | DeviceType::RtlWmbus | DeviceType::Rtl433)
    }

    /// The default baud rate the dongle family talks at.
    pub fn default_baud(&self) -> u32 {
        match self {
            DeviceType::Im871a => 57600,
            DeviceType::Amb8465 => 9600,
            DeviceType::Cul => 38400,
            DeviceType::Rc1180 => 19200,
            DeviceType::Iu880b => 115200,
            DeviceType::MBus => 2400,
            _ => 115200,
        }
    }
}

/// Which framing layer outbound content bytes start at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStartsWith {
    CField,
    CiField,
    ShortFrame,
    LongFrame,
}

/// One telegram produced by a framer.
#[derive(Debug, Clone)]
pub struct FramedTelegram {
    pub about: About,
    pub frame: Vec<u8>,
}

/// The common framer contract. See the module docs; everything returned
/// from the command methods is bytes for the bus manager to write.
pub trait BusDeviceFramer: Send {
    fn device_type(&self) -> DeviceType;

    /// Consume freshly received bytes, return completed telegrams.
    fn on_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram>;

    /// Drop any partially accumulated frame (after reset or close).
    fn clear(&mut self);

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool;

    /// Device command that configures the given link modes, if any.
    fn link_modes_command(&self, _lms: LinkModeSet) -> Option<Vec<u8>> {
        None
    }

    /// Device command written after (re)open, if the dongle needs one.
    fn reset_command(&self) -> Option<Vec<u8>> {
        None
    }

    /// Wrap outbound telegram content in device framing. Most dongles
    /// are receive-only.
    fn send_telegram(
        &self,
        _starts_with: ContentStartsWith,
        _content: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        Err(GatewayError::SendRejected(format!(
            "{} devices cannot send telegrams",
            self.device_type().name()
        )))
    }
}

/// Construct the framer for a device type.
///
/// `device` is the human readable source name put into [`About`].
pub fn create_framer(device_type: DeviceType, device: &str) -> Box<dyn BusDeviceFramer> {
    match device_type {
        DeviceType::Im871a => Box::new(im871a::Im871aFramer::new(device)),
        DeviceType::Amb8465 => Box::new(amb8465::Amb8465Framer::new(device)),
        DeviceType::Cul => Box::new(cul::CulFramer::new(device)),
        DeviceType::Rc1180 => Box::new(rc1180::Rc1180Framer::new(device)),
        DeviceType::Iu880b => Box::new(iu880b::Iu880bFramer::new(device)),
        DeviceType::RtlWmbus | DeviceType::Rtl433 => {
            Box::new(rtlwmbus::RtlWmbusFramer::new(device))
        }
        DeviceType::MBus => Box::new(mbus::MBusFramer::new(device)),
        DeviceType::Simulation => Box::new(simulation::SimulationFramer::new(device)),
        // Auto/unknown fall back to raw framing; the bus manager never
        // opens them without resolving the type first.
        DeviceType::RawTty | DeviceType::Auto | DeviceType::Unknown => {
            Box::new(rawtty::RawTtyFramer::new(device))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_parse_roundtrip() {
        for t in [
            DeviceType::Auto,
            DeviceType::Im871a,
            DeviceType::Amb8465,
            DeviceType::Cul,
            DeviceType::Rc1180,
            DeviceType::Iu880b,
            DeviceType::RawTty,
            DeviceType::RtlWmbus,
            DeviceType::Rtl433,
            DeviceType::MBus,
            DeviceType::Simulation,
        ] {
            assert_eq!(DeviceType::parse(t.name()), Some(t));
        }
        assert_eq!(DeviceType::parse("flux-capacitor"), None);
    }

    #[test]
    fn test_tty_vs_rtlsdr_classification() {
        assert!(DeviceType::Im871a.uses_tty());
        assert!(!DeviceType::Im871a.uses_rtlsdr());
        assert!(DeviceType::RtlWmbus.uses_rtlsdr());
        assert!(!DeviceType::RtlWmbus.uses_tty());
        assert!(DeviceType::Auto.uses_tty() && DeviceType::Auto.uses_rtlsdr());
    }
}
