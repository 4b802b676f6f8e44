//! # Device Specification Grammar
//!
//! Users declare bus devices with a compact colon-separated string:
//!
//! ```text
//! [bus_alias=]{file | CMD(shell)}:{type[ [id] ][(extras)]}:[bps]:[frequency]:[linkmodes]
//! ```
//!
//! All tokens are optional but keep their order. Examples:
//!
//! ```text
//! /dev/ttyUSB0
//! im871a[12345678]
//! auto
//! rtlwmbus(device=0)
//! BUS1=/dev/ttyUSB0:im871a:57600:868.95M:c1,t1
//! /dev/ttyUSB0:mbus:2400
//! CMD(rtl_wmbus -f 868.95M)
//! 1E44AE4C...  (a hex string is an inline simulation telegram)
//! ```
//!
//! Tab characters are rejected outright; only spaces may appear (inside
//! `CMD(...)`).

use super::{ContentStartsWith, DeviceType};
use crate::error::GatewayError;
use crate::linkmode::LinkModeSet;
use crate::util::hex::is_hex_string;

/// A user-declared device, immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecifiedDevice {
    pub bus_alias: String,
    pub file: String,
    pub command: String,
    /// Inline telegram hex when the specification was a bare hex string.
    pub hex_data: String,
    pub device_type: DeviceType,
    pub id: String,
    pub extras: String,
    pub baud: Option<u32>,
    pub frequency: String,
    pub linkmodes: LinkModeSet,
    pub is_tty: bool,
    pub is_stdin: bool,
    pub is_file: bool,
    pub is_simulation: bool,
    pub is_hex: bool,
}

impl SpecifiedDevice {
    /// Parse a device specification string.
    pub fn parse(spec: &str) -> Result<SpecifiedDevice, GatewayError> {
        let invalid =
            |why: &str| GatewayError::ConfigInvalid(format!("\"{spec}\": {why}"));

        if spec.contains('\t') {
            return Err(invalid("tab characters are not valid separators"));
        }
        if spec.is_empty() {
            return Err(invalid("empty device specification"));
        }

        let mut sd = SpecifiedDevice::default();
        let mut rest = spec;

        // Leading alias: BUS1=... where the alias is a plain identifier.
        if let Some(eq) = rest.find('=') {
            let alias = &rest[..eq];
            if !alias.is_empty()
                && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                sd.bus_alias = alias.to_string();
                rest = &rest[eq + 1..];
            }
        }

        for token in split_tokens(rest) {
            sd.apply_token(&token, &invalid)?;
        }

        // A file or inline hex implies how the source behaves.
        if sd.file == "stdin" {
            sd.is_stdin = true;
        } else if !sd.file.is_empty() {
            if sd.device_type == DeviceType::Simulation
                || sd
                    .file
                    .rsplit('/')
                    .next()
                    .map(|f| f.starts_with("simulation"))
                    .unwrap_or(false)
            {
                sd.is_simulation = true;
                sd.device_type = DeviceType::Simulation;
            } else if sd.file.contains('/') {
                sd.is_tty = sd.file.starts_with("/dev/");
                sd.is_file = !sd.is_tty;
            } else {
                sd.is_file = true;
            }
        }

        // Cross-token validation.
        if !sd.file.is_empty() && !sd.command.is_empty() {
            return Err(invalid("a file cannot be combined with CMD()"));
        }
        if sd.device_type == DeviceType::Auto && (!sd.file.is_empty() || !sd.hex_data.is_empty()) {
            return Err(invalid("type auto cannot be combined with a file"));
        }
        if sd.device_type == DeviceType::Unknown
            && sd.file.is_empty()
            && sd.command.is_empty()
            && sd.hex_data.is_empty()
        {
            return Err(invalid("no device file, command or type given"));
        }

        Ok(sd)
    }

    fn apply_token(
        &mut self,
        token: &str,
        invalid: &dyn Fn(&str) -> GatewayError,
    ) -> Result<(), GatewayError> {
        if token.is_empty() {
            return Ok(());
        }

        // CMD(...) shell command.
        if let Some(cmd) = token.strip_prefix("CMD(") {
            let cmd = cmd
                .strip_suffix(')')
                .ok_or_else(|| invalid("CMD( is missing its closing parenthesis"))?;
            if !self.command.is_empty() {
                return Err(invalid("only one CMD() is allowed"));
            }
            self.command = cmd.to_string();
            return Ok(());
        }

        // Device type token, possibly with [id] and (extras).
        if let Some((t, id, extras)) = parse_type_token(token) {
            if self.device_type != DeviceType::Unknown {
                return Err(invalid("device type given twice"));
            }
            self.device_type = t;
            self.id = id;
            self.extras = extras;
            return Ok(());
        }

        // Baud rate.
        if token.chars().all(|c| c.is_ascii_digit()) {
            let baud: u32 = token
                .parse()
                .map_err(|_| invalid("baud rate out of range"))?;
            self.baud = Some(baud);
            return Ok(());
        }

        // Frequency like 868.95M.
        if (token.ends_with('M') || token.ends_with("MHz"))
            && token
                .trim_end_matches("MHz")
                .trim_end_matches('M')
                .parse::<f64>()
                .is_ok()
        {
            self.frequency = token.to_string();
            return Ok(());
        }

        // Link mode list.
        if let Some(lms) = LinkModeSet::parse(token) {
            if !lms.is_empty() {
                self.linkmodes = lms;
                return Ok(());
            }
        }

        // Inline hex telegram.
        if is_hex_string(token) && token.len() >= 20 {
            self.hex_data = token.to_string();
            self.is_hex = true;
            self.is_simulation = true;
            self.device_type = DeviceType::Simulation;
            return Ok(());
        }

        // Anything else is a device file / path.
        if self.file.is_empty() {
            self.file = token.to_string();
            return Ok(());
        }

        Err(invalid("cannot understand token"))
    }

    /// Human readable form for logs.
    pub fn hr(&self) -> String {
        let mut s = String::new();
        if !self.bus_alias.is_empty() {
            s.push_str(&self.bus_alias);
            s.push('=');
        }
        if !self.file.is_empty() {
            s.push_str(&self.file);
        } else if !self.command.is_empty() {
            s.push_str(&format!("CMD({})", self.command));
        }
        if self.device_type != DeviceType::Unknown {
            if !s.is_empty() && !s.ends_with('=') {
                s.push(':');
            }
            s.push_str(self.device_type.name());
            if !self.id.is_empty() {
                s.push_str(&format!("[{}]", self.id));
            }
        }
        s
    }
}

/// Split a specification on `:`, keeping `CMD(...)` contents intact.
fn split_tokens(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ':' if depth == 0 => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}

/// Parse `type[id](extras)` where id and extras are optional.
fn parse_type_token(token: &str) -> Option<(DeviceType, String, String)> {
    let mut name_end = token.len();
    let mut id = String::new();
    let mut extras = String::new();

    if let Some(open) = token.find('[') {
        let close = token.find(']')?;
        if close < open {
            return None;
        }
        id = token[open + 1..close].to_string();
        name_end = name_end.min(open);
    }
    if let Some(open) = token.find('(') {
        let close = token.rfind(')')?;
        if close < open {
            return None;
        }
        extras = token[open + 1..close].to_string();
        name_end = name_end.min(open);
    }

    let t = DeviceType::parse(&token[..name_end])?;
    Some((t, id, extras))
}

/// Outbound content queued for a bus, parsed from the send grammar
/// `send{ci,c,s,l}:<bus>:<hexstring>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBusContent {
    pub bus: String,
    pub starts_with: ContentStartsWith,
    /// Validated later when the queue is drained.
    pub content: String,
}

impl SendBusContent {
    pub fn parse(s: &str) -> Result<SendBusContent, GatewayError> {
        let invalid = |why: &str| GatewayError::ConfigInvalid(format!("\"{s}\": {why}"));

        let mut parts = s.splitn(3, ':');
        let verb = parts.next().ok_or_else(|| invalid("missing send verb"))?;
        let bus = parts.next().ok_or_else(|| invalid("missing bus alias"))?;
        let content = parts.next().ok_or_else(|| invalid("missing hex content"))?;

        let starts_with = match verb {
            "sendci" => ContentStartsWith::CiField,
            "sendc" => ContentStartsWith::CField,
            "sends" => ContentStartsWith::ShortFrame,
            "sendl" => ContentStartsWith::LongFrame,
            _ => return Err(invalid("send verb must be one of sendci/sendc/sends/sendl")),
        };
        if bus.is_empty() {
            return Err(invalid("missing bus alias"));
        }

        Ok(SendBusContent {
            bus: bus.to_string(),
            starts_with,
            content: content.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tty() {
        let sd = SpecifiedDevice::parse("/dev/ttyUSB0").unwrap();
        assert_eq!(sd.file, "/dev/ttyUSB0");
        assert!(sd.is_tty);
        assert_eq!(sd.device_type, DeviceType::Unknown);
    }

    #[test]
    fn test_type_with_id() {
        let sd = SpecifiedDevice::parse("im871a[12345678]").unwrap();
        assert_eq!(sd.device_type, DeviceType::Im871a);
        assert_eq!(sd.id, "12345678");
        assert!(sd.file.is_empty());
    }

    #[test]
    fn test_full_form() {
        let sd = SpecifiedDevice::parse("BUS1=/dev/ttyUSB0:im871a:57600:868.95M:c1,t1").unwrap();
        assert_eq!(sd.bus_alias, "BUS1");
        assert_eq!(sd.file, "/dev/ttyUSB0");
        assert_eq!(sd.device_type, DeviceType::Im871a);
        assert_eq!(sd.baud, Some(57600));
        assert_eq!(sd.frequency, "868.95M");
        assert_eq!(sd.linkmodes, LinkModeSet::C1 | LinkModeSet::T1);
    }

    #[test]
    fn test_mbus_with_baud() {
        let sd = SpecifiedDevice::parse("/dev/ttyUSB0:mbus:2400").unwrap();
        assert_eq!(sd.device_type, DeviceType::MBus);
        assert_eq!(sd.baud, Some(2400));
    }

    #[test]
    fn test_rtlwmbus_with_extras() {
        let sd = SpecifiedDevice::parse("rtlwmbus(device=0)").unwrap();
        assert_eq!(sd.device_type, DeviceType::RtlWmbus);
        assert_eq!(sd.extras, "device=0");
    }

    #[test]
    fn test_cmd_keeps_colons_and_spaces() {
        let sd = SpecifiedDevice::parse("CMD(rtl_wmbus -f 868.95M):rtlwmbus").unwrap();
        assert_eq!(sd.command, "rtl_wmbus -f 868.95M");
        assert_eq!(sd.device_type, DeviceType::RtlWmbus);
    }

    #[test]
    fn test_hex_string_is_simulation() {
        let sd =
            SpecifiedDevice::parse("1E44AE4C5678341203077A6A000000046D3237A92104FD17").unwrap();
        assert!(sd.is_hex);
        assert!(sd.is_simulation);
        assert_eq!(sd.device_type, DeviceType::Simulation);
    }

    #[test]
    fn test_auto_with_file_rejected() {
        assert!(SpecifiedDevice::parse("/dev/ttyUSB0:auto").is_err());
    }

    #[test]
    fn test_file_with_cmd_rejected() {
        assert!(SpecifiedDevice::parse("/dev/ttyUSB0:CMD(foo):rtlwmbus").is_err());
    }

    #[test]
    fn test_tab_rejected() {
        assert!(SpecifiedDevice::parse("/dev/ttyUSB0\t:im871a").is_err());
    }

    #[test]
    fn test_bare_auto() {
        let sd = SpecifiedDevice::parse("auto").unwrap();
        assert_eq!(sd.device_type, DeviceType::Auto);
    }

    #[test]
    fn test_simulation_file() {
        let sd = SpecifiedDevice::parse("simulation_meters.txt").unwrap();
        assert!(sd.is_simulation);
        assert_eq!(sd.device_type, DeviceType::Simulation);
    }

    #[test]
    fn test_send_grammar() {
        let sbc = SendBusContent::parse("sendci:BUS1:aabbcc").unwrap();
        assert_eq!(sbc.bus, "BUS1");
        assert_eq!(sbc.starts_with, ContentStartsWith::CiField);
        assert_eq!(sbc.content, "aabbcc");

        assert_eq!(
            SendBusContent::parse("sendl:main:0102").unwrap().starts_with,
            ContentStartsWith::LongFrame
        );
        assert!(SendBusContent::parse("sendx:main:0102").is_err());
        assert!(SendBusContent::parse("sendci").is_err());
    }
}
