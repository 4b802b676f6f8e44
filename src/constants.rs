//! # Protocol Constants
//!
//! CI-field registry, C-field helpers, manufacturer flag codec and media
//! type names shared by the framers and the telegram parser. The CI
//! registry follows EN 13757-3/-4 with the OMS additions the gateway
//! understands.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Which protocol layer a CI field introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiType {
    Ell,
    Nwl,
    Afl,
    Tpl,
    MfctSpecific,
    Unknown,
}

// TPL CI values
pub const TPL_51: u8 = 0x51;
pub const TPL_72: u8 = 0x72;
pub const TPL_78: u8 = 0x78;
pub const TPL_79: u8 = 0x79;
pub const TPL_7A: u8 = 0x7A;

// ELL CI values
pub const ELL_I: u8 = 0x8C;
pub const ELL_II: u8 = 0x8D;
pub const ELL_III: u8 = 0x8E;
pub const ELL_IV: u8 = 0x8F;
pub const ELL_V: u8 = 0x86;

// NWL CI value
pub const NWL_81: u8 = 0x81;

// AFL CI value
pub const AFL_90: u8 = 0x90;

// Manufacturer specific TPL CI values
pub const MFCT_SPECIFIC_A0: u8 = 0xA0;
pub const MFCT_SPECIFIC_A1: u8 = 0xA1;
pub const MFCT_SPECIFIC_A2: u8 = 0xA2;
pub const MFCT_SPECIFIC_A3: u8 = 0xA3;

/// Classify a CI field.
pub fn ci_type(ci: u8) -> CiType {
    match ci {
        ELL_I | ELL_II | ELL_III | ELL_IV | ELL_V => CiType::Ell,
        NWL_81 => CiType::Nwl,
        AFL_90 => CiType::Afl,
        TPL_51 | TPL_72 | TPL_78 | TPL_79 | TPL_7A => CiType::Tpl,
        MFCT_SPECIFIC_A0..=MFCT_SPECIFIC_A3 => CiType::MfctSpecific,
        _ => CiType::Unknown,
    }
}

/// Human readable name of a CI field, for parse annotations.
pub fn ci_name(ci: u8) -> &'static str {
    match ci {
        TPL_51 => "TPL: APL follows",
        TPL_72 => "TPL: long header APL follows",
        TPL_78 => "TPL: no header APL follows",
        TPL_79 => "TPL: compact APL follows",
        TPL_7A => "TPL: short header APL follows",
        ELL_I => "ELL: I",
        ELL_II => "ELL: II",
        ELL_III => "ELL: III",
        ELL_IV => "ELL: IV",
        ELL_V => "ELL: V",
        NWL_81 => "NWL",
        AFL_90 => "AFL",
        MFCT_SPECIFIC_A0..=MFCT_SPECIFIC_A3 => "MFCT specific",
        _ => "unknown",
    }
}

/// Fixed part of an ELL variant after the CI byte (cc+acc plus optional
/// fields), used to pre-check that enough bytes remain.
pub fn ell_ci_length(ci: u8) -> usize {
    match ci {
        ELL_I => 2,        // cc, acc
        ELL_II => 8,       // cc, acc, sn(4), crc(2)
        ELL_III => 10,     // cc, acc, mfct(2), id(4), ver, type
        ELL_IV => 16,      // cc, acc, mfct(2), id(4), ver, type, sn(4), crc(2)
        ELL_V => 0,        // variable, unsupported
        _ => 0,
    }
}

/// Valid wM-Bus DLL C fields for frames a gateway receives.
///
/// 0x44 SND-NR, 0x46 SND-NR from a repeater, 0x08 RSP-UD relayed.
pub fn is_valid_wmbus_c_field(c: u8) -> bool {
    matches!(c, 0x44 | 0x46 | 0x08)
}

/// Render a wM-Bus DLL C field for parse annotations.
pub fn c_field_name(c: u8) -> &'static str {
    match c {
        0x44 => "SND-NR",
        0x46 => "SND-NR repeated",
        0x48 => "RSP-UD",
        0x08 => "RSP-UD relayed",
        _ => "?",
    }
}

/// Render a wired M-Bus C field.
pub fn mbus_c_field_name(c: u8) -> &'static str {
    match c {
        0x08 | 0x18 | 0x28 | 0x38 => "RSP-UD",
        0x53 | 0x73 => "SND-UD",
        0x40 => "SND-NKE",
        0x5b | 0x7b => "REQ-UD2",
        _ => "?",
    }
}

/// Decode the packed 5-bit-triple manufacturer field to its 3-letter flag.
pub fn manufacturer_flag(m: u16) -> String {
    let a = (((m >> 10) & 0x1f) as u8 + 64) as char;
    let b = (((m >> 5) & 0x1f) as u8 + 64) as char;
    let c = ((m & 0x1f) as u8 + 64) as char;
    format!("{a}{b}{c}")
}

/// Encode a 3-letter manufacturer flag back to the packed field.
///
/// Returns None unless the flag is exactly three chars in A..=Z.
pub fn parse_manufacturer_flag(flag: &str) -> Option<u16> {
    let bytes = flag.as_bytes();
    if bytes.len() != 3 {
        return None;
    }
    let mut m: u16 = 0;
    for &b in bytes {
        if !b.is_ascii_uppercase() {
            return None;
        }
        m = (m << 5) | ((b - 64) as u16);
    }
    Some(m)
}

static MANUFACTURERS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    [
        ("ABB", "ABB"),
        ("AMB", "Amber Wireless"),
        ("APA", "Apator"),
        ("BMT", "BMeters"),
        ("DME", "Diehl Metering"),
        ("EFE", "Engelmann"),
        ("ELS", "Elster"),
        ("HYD", "Hydrometer"),
        ("IST", "Ista"),
        ("ITW", "Itron"),
        ("KAM", "Kamstrup"),
        ("LAS", "Lansen"),
        ("LUG", "Landis+Gyr"),
        ("QDS", "Qundis"),
        ("SAP", "Sappel"),
        ("SEN", "Sensus"),
        ("SON", "Sontex"),
        ("TCH", "Techem"),
        ("WEP", "Weptech"),
        ("ZRI", "Zenner"),
    ]
    .iter()
    .filter_map(|(flag, name)| parse_manufacturer_flag(flag).map(|m| (m, *name)))
    .collect()
});

/// Company name behind a manufacturer field, when known.
pub fn manufacturer_name(m: u16) -> &'static str {
    MANUFACTURERS.get(&m).copied().unwrap_or("Unknown")
}

/// Media/device type names per EN 13757-3 table.
pub fn media_type_name(device_type: u8) -> &'static str {
    match device_type {
        0x00 => "Other",
        0x01 => "Oil meter",
        0x02 => "Electricity meter",
        0x03 => "Gas meter",
        0x04 => "Heat meter",
        0x05 => "Steam meter",
        0x06 => "Warm water meter",
        0x07 => "Water meter",
        0x08 => "Heat cost allocator",
        0x09 => "Compressed air",
        0x0A | 0x0B => "Cooling load meter",
        0x0C => "Heat (inlet)",
        0x0D => "Heat/Cooling combined",
        0x0E => "Bus/System component",
        0x0F => "Unknown",
        0x15 => "Hot water meter",
        0x16 => "Cold water meter",
        0x17 => "Hot/Cold water meter",
        0x18 => "Pressure meter",
        0x19 => "A/D converter",
        0x1A => "Smoke detector",
        0x1B => "Room sensor",
        0x1C => "Gas detector",
        0x20 => "Breaker (electricity)",
        0x21 => "Valve (gas or water)",
        0x25 => "Customer unit (display)",
        0x28 => "Waste water meter",
        0x29 => "Garbage",
        0x31 => "Communication controller",
        0x32 => "Unidirectional repeater",
        0x33 => "Bidirectional repeater",
        0x36 => "Radio converter (system side)",
        0x37 => "Radio converter (meter side)",
        _ => "Reserved",
    }
}

/// Decode the TPL status byte into its standard components.
pub fn tpl_status_name(sts: u8) -> String {
    if sts == 0 {
        return "OK".to_string();
    }
    let mut s = String::new();
    match sts & 0x03 {
        0x01 => s.push_str("BUSY "),
        0x02 => s.push_str("ERROR "),
        0x03 => s.push_str("ALARM "),
        _ => {}
    }
    if sts & 0x04 != 0 {
        s.push_str("POWER_LOW ");
    }
    if sts & 0x08 != 0 {
        s.push_str("PERMANENT_ERROR ");
    }
    if sts & 0x10 != 0 {
        s.push_str("TEMPORARY_ERROR ");
    }
    if sts & 0xe0 != 0 {
        s.push_str(&format!("MFCT_{:02x} ", sts & 0xf8));
    }
    s.trim_end().to_string()
}
