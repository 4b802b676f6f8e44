//! # Value Information Field Tables
//!
//! Resolution of VIF codes to unit, scale and quantity per EN 13757-3.
//! The primary table covers 0x00..0x7F; the 0xFB and 0xFD prefixes open
//! the extension tables. Only the extension codes that show up in real
//! telegrams are spelled out; the rest resolve to an unknown placeholder
//! so parsing never stalls on an exotic meter.

/// Resolved semantics of a VIF (possibly extended).
#[derive(Debug, Clone, PartialEq)]
pub struct VifInfo {
    pub unit: &'static str,
    pub scale: f64,
    pub quantity: &'static str,
}

impl VifInfo {
    const fn new(unit: &'static str, scale: f64, quantity: &'static str) -> Self {
        VifInfo { unit, scale, quantity }
    }

    pub fn unknown() -> Self {
        VifInfo::new("", 1.0, "Unknown")
    }
}

fn pow10(e: i32) -> f64 {
    10f64.powi(e)
}

/// Primary VIF table lookup (code without the extension bit).
pub fn lookup_primary_vif(vif: u8) -> VifInfo {
    let n = (vif & 0x07) as i32;
    match vif {
        0x00..=0x07 => VifInfo::new("Wh", pow10(n - 3), "Energy"),
        0x08..=0x0F => VifInfo::new("J", pow10(n), "Energy"),
        0x10..=0x17 => VifInfo::new("m3", pow10(n - 6), "Volume"),
        0x18..=0x1F => VifInfo::new("kg", pow10(n - 3), "Mass"),
        0x20 | 0x24 => VifInfo::new("s", 1.0, if vif == 0x20 { "On time" } else { "Operating time" }),
        0x21 | 0x25 => VifInfo::new("min", 1.0, if vif == 0x21 { "On time" } else { "Operating time" }),
        0x22 | 0x26 => VifInfo::new("h", 1.0, if vif == 0x22 { "On time" } else { "Operating time" }),
        0x23 | 0x27 => VifInfo::new("d", 1.0, if vif == 0x23 { "On time" } else { "Operating time" }),
        0x28..=0x2F => VifInfo::new("W", pow10(n - 3), "Power"),
        0x30..=0x37 => VifInfo::new("J/h", pow10(n), "Power"),
        0x38..=0x3F => VifInfo::new("m3/h", pow10(n - 6), "Volume flow"),
        0x40..=0x47 => VifInfo::new("m3/min", pow10(n - 7), "Volume flow"),
        0x48..=0x4F => VifInfo::new("m3/s", pow10(n - 9), "Volume flow"),
        0x50..=0x57 => VifInfo::new("kg/h", pow10(n - 3), "Mass flow"),
        0x58..=0x5B => VifInfo::new("°C", pow10(n - 3), "Flow temperature"),
        0x5C..=0x5F => VifInfo::new("°C", pow10((vif & 0x03) as i32 - 3), "Return temperature"),
        0x60..=0x63 => VifInfo::new("K", pow10((vif & 0x03) as i32 - 3), "Temperature difference"),
        0x64..=0x67 => VifInfo::new("°C", pow10((vif & 0x03) as i32 - 3), "External temperature"),
        0x68..=0x6B => VifInfo::new("bar", pow10((vif & 0x03) as i32 - 3), "Pressure"),
        0x6C => VifInfo::new("", 1.0, "Date"),
        0x6D => VifInfo::new("", 1.0, "Date and time"),
        0x6E => VifInfo::new("HCA", 1.0, "Heat cost allocation"),
        0x6F => VifInfo::new("", 1.0, "Reserved"),
        0x70..=0x73 => VifInfo::new("s", 1.0, "Averaging duration"),
        0x74..=0x77 => VifInfo::new("s", 1.0, "Actuality duration"),
        0x78 => VifInfo::new("", 1.0, "Fabrication no"),
        0x79 => VifInfo::new("", 1.0, "Enhanced identification"),
        0x7A => VifInfo::new("", 1.0, "Bus address"),
        0x7C => VifInfo::new("", 1.0, "Custom string"),
        0x7E => VifInfo::new("", 1.0, "Any VIF"),
        0x7F => VifInfo::new("", 1.0, "Manufacturer specific"),
        _ => VifInfo::unknown(),
    }
}

/// Extension table behind prefix 0xFD (main extension).
pub fn lookup_vife_fd(code: u8) -> VifInfo {
    let code = code & 0x7F;
    match code {
        0x00..=0x03 => VifInfo::new("currency", pow10((code & 0x03) as i32 - 3), "Credit"),
        0x04..=0x07 => VifInfo::new("currency", pow10((code & 0x03) as i32 - 3), "Debit"),
        0x08 => VifInfo::new("", 1.0, "Access number"),
        0x09 => VifInfo::new("", 1.0, "Medium"),
        0x0A => VifInfo::new("", 1.0, "Manufacturer"),
        0x0B => VifInfo::new("", 1.0, "Parameter set identification"),
        0x0C => VifInfo::new("", 1.0, "Model/version"),
        0x0D => VifInfo::new("", 1.0, "Hardware version"),
        0x0E => VifInfo::new("", 1.0, "Firmware version"),
        0x10 => VifInfo::new("", 1.0, "Customer location"),
        0x11 => VifInfo::new("", 1.0, "Customer"),
        0x17 => VifInfo::new("", 1.0, "Error flags"),
        0x18 => VifInfo::new("", 1.0, "Error mask"),
        0x1A => VifInfo::new("", 1.0, "Digital output"),
        0x1B => VifInfo::new("", 1.0, "Digital input"),
        0x1C => VifInfo::new("baud", 1.0, "Baudrate"),
        0x20 => VifInfo::new("", 1.0, "First storage number"),
        0x21 => VifInfo::new("", 1.0, "Last storage number"),
        0x40..=0x4F => VifInfo::new("V", pow10((code & 0x0F) as i32 - 9), "Voltage"),
        0x50..=0x5F => VifInfo::new("A", pow10((code & 0x0F) as i32 - 12), "Current"),
        0x60 => VifInfo::new("", 1.0, "Reset counter"),
        0x61 => VifInfo::new("", 1.0, "Cumulation counter"),
        0x6D => VifInfo::new("", 1.0, "Date and time of battery change"),
        0x74 => VifInfo::new("d", 1.0, "Remaining battery life"),
        _ => VifInfo::unknown(),
    }
}

/// Extension table behind prefix 0xFB (alternate units).
pub fn lookup_vife_fb(code: u8) -> VifInfo {
    let code = code & 0x7F;
    match code {
        0x00 | 0x01 => VifInfo::new("MWh", pow10((code & 0x01) as i32 - 1), "Energy"),
        0x08 | 0x09 => VifInfo::new("GJ", pow10((code & 0x01) as i32 - 1), "Energy"),
        0x10 | 0x11 => VifInfo::new("m3", pow10((code & 0x01) as i32 + 2), "Volume"),
        0x18 | 0x19 => VifInfo::new("t", pow10((code & 0x01) as i32 + 2), "Mass"),
        0x21 => VifInfo::new("0.1 ft3", 0.1, "Volume"),
        0x58..=0x5B => VifInfo::new("°F", pow10((code & 0x03) as i32 - 3), "Flow temperature"),
        0x74..=0x77 => VifInfo::new("°C", pow10((code & 0x03) as i32 - 3), "Cold/warm temperature limit"),
        _ => VifInfo::unknown(),
    }
}

/// Resolve a full VIF chain (lead byte plus following extension bytes).
///
/// `0xFB`/`0xFD` escape into the extension tables; `0x7F`/`0xFF` is
/// manufacturer specific; everything else uses the primary table with
/// the extension bit masked off.
pub fn resolve_vif(vif: u8, vifes: &[u8]) -> VifInfo {
    match vif {
        0xFB => vifes
            .first()
            .map(|&v| lookup_vife_fb(v))
            .unwrap_or_else(VifInfo::unknown),
        0xFD => vifes
            .first()
            .map(|&v| lookup_vife_fd(v))
            .unwrap_or_else(VifInfo::unknown),
        0x7F | 0xFF => VifInfo::new("", 1.0, "Manufacturer specific"),
        _ => lookup_primary_vif(vif & 0x7F),
    }
}
