//! # Device Probing
//!
//! Deciding what is behind a serial tty: each candidate dongle family
//! gets one short request/response exchange at its native baud rate.
//! The probe order {AMB8465, IM871A, RC1180, CUL, IU880B} starts with
//! the dongles that are upset the least by a foreign protocol poke.
//!
//! A tty that answers none of the probes lands in the bus manager's
//! negative cache so it is not poked again while it stays plugged in.

use super::spec::SpecifiedDevice;
use super::DeviceType;
use crate::error::GatewayError;
use crate::serial::SerialPort;
use crate::util::hex::encode_hex;
use std::time::Duration;

/// Outcome of probing one device: what was found and where.
#[derive(Debug, Clone, Default)]
pub struct Detected {
    pub specified_device: SpecifiedDevice,
    pub found_type: DeviceType,
    pub found_file: String,
    pub found_device_id: String,
    /// The tty was overridden with a plain file (replay).
    pub found_tty_override: bool,
}

impl Detected {
    pub fn new(specified_device: SpecifiedDevice, found_type: DeviceType, found_file: &str) -> Self {
        Detected {
            specified_device,
            found_type,
            found_file: found_file.to_string(),
            found_device_id: String::new(),
            found_tty_override: false,
        }
    }

    /// Human readable summary for logs.
    pub fn hr(&self) -> String {
        let mut s = format!("{}", self.found_type.name());
        if !self.found_device_id.is_empty() {
            s.push_str(&format!("[{}]", self.found_device_id));
        }
        if !self.found_file.is_empty() {
            s.push_str(&format!(" on {}", self.found_file));
        }
        s
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

async fn exchange(
    port: &mut dyn SerialPort,
    baud: u32,
    request: &[u8],
) -> Result<Vec<u8>, GatewayError> {
    port.set_baud_rate(baud).await?;
    port.write_all(request).await?;
    let mut buf = [0u8; 64];
    let n = port.read_with_timeout(&mut buf, PROBE_TIMEOUT).await?;
    Ok(buf[..n].to_vec())
}

async fn probe_amb8465(port: &mut dyn SerialPort) -> Option<String> {
    // CMD_GET_REQ for the serial number registers; checksum is the XOR
    // of the preceding bytes.
    let request = [0xFF, 0x09, 0x00, 0xF6];
    let resp = exchange(port, DeviceType::Amb8465.default_baud(), &request)
        .await
        .ok()?;
    if resp.len() >= 2 && resp[0] == 0xFF && resp[1] == 0x89 {
        let id = if resp.len() >= 7 {
            encode_hex(&resp[3..7])
        } else {
            String::new()
        };
        return Some(id);
    }
    None
}

async fn probe_im871a(port: &mut dyn SerialPort) -> Option<String> {
    // WiMOD HCI DEVMGMT ping.
    let request = [0xA5, 0x01, 0x01, 0x00];
    let resp = exchange(port, DeviceType::Im871a.default_baud(), &request)
        .await
        .ok()?;
    if resp.len() >= 3 && resp[0] == 0xA5 && resp[1] & 0x0F == 0x01 && resp[2] == 0x02 {
        return Some(String::new());
    }
    None
}

async fn probe_rc1180(port: &mut dyn SerialPort) -> Option<String> {
    // A single zero byte enters configuration mode, answered by '>'.
    let request = [0x00];
    let resp = exchange(port, DeviceType::Rc1180.default_baud(), &request)
        .await
        .ok()?;
    if resp.contains(&b'>') {
        // Leave config mode again.
        let _ = port.write_all(b"X").await;
        return Some(String::new());
    }
    None
}

async fn probe_cul(port: &mut dyn SerialPort) -> Option<String> {
    let request = b"V\r\n";
    let resp = exchange(port, DeviceType::Cul.default_baud(), request)
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&resp);
    if text.contains("CUL") || text.contains("culfw") {
        return Some(String::new());
    }
    None
}

async fn probe_iu880b(port: &mut dyn SerialPort) -> Option<String> {
    // SLIP wrapped WiMOD ping (fcs omitted in the probe; any SLIP
    // delimited answer identifies the dongle).
    let request = [0xC0, 0x01, 0x01, 0xC0];
    let resp = exchange(port, DeviceType::Iu880b.default_baud(), &request)
        .await
        .ok()?;
    if resp.first() == Some(&0xC0) {
        return Some(String::new());
    }
    None
}

/// Probe an unclaimed tty for any supported dongle family.
///
/// Returns None when nothing answered; the caller negative-caches the
/// tty in that case.
pub async fn detect_device_on_tty(
    tty: &str,
    port: &mut dyn SerialPort,
) -> Result<Option<Detected>, GatewayError> {
    port.open().await?;

    let mut result = None;
    if result.is_none() {
        result = probe_amb8465(port).await.map(|id| (DeviceType::Amb8465, id));
    }
    if result.is_none() {
        result = probe_im871a(port).await.map(|id| (DeviceType::Im871a, id));
    }
    if result.is_none() {
        result = probe_rc1180(port).await.map(|id| (DeviceType::Rc1180, id));
    }
    if result.is_none() {
        result = probe_cul(port).await.map(|id| (DeviceType::Cul, id));
    }
    if result.is_none() {
        result = probe_iu880b(port).await.map(|id| (DeviceType::Iu880b, id));
    }

    port.close().await;

    Ok(result.map(|(found_type, found_device_id)| {
        log::debug!("(detect) {tty} answered as {}", found_type.name());
        let mut d = Detected::new(SpecifiedDevice::default(), found_type, tty);
        d.found_device_id = found_device_id;
        d
    }))
}

/// Resolve a specified device that names a file or tty.
///
/// Explicit types are trusted; `auto` and untyped ttys go through the
/// probe sequence.
pub async fn detect_device_with_file(
    spec: &SpecifiedDevice,
    port: &mut dyn SerialPort,
) -> Result<Detected, GatewayError> {
    match spec.device_type {
        DeviceType::Unknown | DeviceType::Auto => {
            if spec.is_tty {
                match detect_device_on_tty(&spec.file, port).await? {
                    Some(mut d) => {
                        d.specified_device = spec.clone();
                        Ok(d)
                    }
                    None => Err(GatewayError::DeviceUnresponsive(spec.file.clone())),
                }
            } else {
                // A plain file replay is raw telegram bytes.
                let mut d = Detected::new(spec.clone(), DeviceType::RawTty, &spec.file);
                d.found_tty_override = true;
                Ok(d)
            }
        }
        t => Ok(Detected::new(spec.clone(), t, &spec.file)),
    }
}

/// Resolve a specified device that runs a subprocess via CMD().
pub fn detect_device_with_command(spec: &SpecifiedDevice) -> Detected {
    let found_type = if spec.device_type == DeviceType::Unknown {
        DeviceType::RtlWmbus
    } else {
        spec.device_type
    };
    Detected::new(spec.clone(), found_type, "")
}
