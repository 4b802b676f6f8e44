//! # Data Record Extraction
//!
//! The application payload of a telegram is a sequence of data records:
//! a DIF (with optional DIFE chain), a VIF (with optional VIFE chain)
//! and the value bytes. This module walks that sequence and produces
//! [`DvEntry`] values carrying both the raw bytes and the resolved
//! unit/scale semantics.
//!
//! Compact frames run the same walk, except the DIF/VIF header bytes
//! come from a cached format template while the values come off the
//! wire.

use super::vif::{resolve_vif, VifInfo};
use super::{KindOfData, Telegram, Understanding};
use crate::util::hex::encode_hex;
use chrono::{NaiveDate, NaiveDateTime};

/// Function field of a data record (DIF bits 4-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementType {
    #[default]
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
}

impl MeasurementType {
    pub fn from_dif(dif: u8) -> Self {
        match (dif >> 4) & 0x03 {
            0 => MeasurementType::Instantaneous,
            1 => MeasurementType::Maximum,
            2 => MeasurementType::Minimum,
            _ => MeasurementType::AtError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeasurementType::Instantaneous => "instantaneous",
            MeasurementType::Maximum => "maximum",
            MeasurementType::Minimum => "minimum",
            MeasurementType::AtError => "aterror",
        }
    }
}

/// How the value bytes of a record are encoded, from the DIF low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataEncoding {
    None,
    Int(usize),
    Real32,
    Bcd(usize),
    Variable,
    Special,
}

fn dif_encoding(dif: u8) -> DataEncoding {
    match dif & 0x0F {
        0x0 => DataEncoding::None,
        n @ 0x1..=0x4 => DataEncoding::Int(n as usize),
        0x5 => DataEncoding::Real32,
        0x6 => DataEncoding::Int(6),
        0x7 => DataEncoding::Int(8),
        0x8 => DataEncoding::None, // selection for readout
        n @ 0x9..=0xC => DataEncoding::Bcd(n as usize - 8),
        0xD => DataEncoding::Variable,
        0xE => DataEncoding::Bcd(6),
        _ => DataEncoding::Special,
    }
}

/// One parsed data record.
#[derive(Debug, Clone, Default)]
pub struct DvEntry {
    /// Offset of the DIF within the frame (or of the value bytes for
    /// compact frames).
    pub offset: usize,
    pub dif: u8,
    pub difes: Vec<u8>,
    pub vif: u8,
    pub vifes: Vec<u8>,
    pub storage_nr: u32,
    pub tariff: u32,
    pub sub_unit: u32,
    pub measurement_type: MeasurementType,
    /// Raw value bytes as transmitted.
    pub value: Vec<u8>,
    pub unit: String,
    pub scale: f64,
    pub quantity: String,
}

impl DvEntry {
    /// Lookup key: the DIF/VIF header bytes in hex.
    pub fn key(&self) -> String {
        let mut bytes = vec![self.dif];
        bytes.extend_from_slice(&self.difes);
        bytes.push(self.vif);
        bytes.extend_from_slice(&self.vifes);
        encode_hex(&bytes)
    }

    /// Value as unsigned little-endian integer (binary encodings).
    pub fn as_u64(&self) -> Option<u64> {
        if self.value.is_empty() || self.value.len() > 8 {
            return None;
        }
        let mut v: u64 = 0;
        for (i, &b) in self.value.iter().enumerate() {
            v |= (b as u64) << (8 * i);
        }
        Some(v)
    }

    /// Value of BCD encoded records.
    pub fn as_bcd(&self) -> Option<u64> {
        let mut v: u64 = 0;
        for &b in self.value.iter().rev() {
            let hi = (b >> 4) as u64;
            let lo = (b & 0x0F) as u64;
            if hi > 9 || lo > 9 {
                return None;
            }
            v = v * 100 + hi * 10 + lo;
        }
        Some(v)
    }

    /// Scaled numeric value, honoring the record's encoding.
    pub fn as_f64(&self) -> Option<f64> {
        match dif_encoding(self.dif) {
            DataEncoding::Bcd(_) => self.as_bcd().map(|v| v as f64 * self.scale),
            DataEncoding::Real32 => {
                if self.value.len() != 4 {
                    return None;
                }
                let bits = u32::from_le_bytes([
                    self.value[0],
                    self.value[1],
                    self.value[2],
                    self.value[3],
                ]);
                Some(f32::from_bits(bits) as f64 * self.scale)
            }
            _ => self.as_u64().map(|v| v as f64 * self.scale),
        }
    }

    /// Decode a type F (date+time, 4 bytes) or type I (6 bytes) value.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        if self.value.len() < 4 {
            return None;
        }
        let b = &self.value[self.value.len() - 4..];
        let minute = (b[0] & 0x3F) as u32;
        let hour = (b[1] & 0x1F) as u32;
        let day = (b[2] & 0x1F) as u32;
        let month = (b[3] & 0x0F) as u32;
        let year = (((b[2] & 0xE0) >> 5) | ((b[3] & 0xF0) >> 1)) as i32;
        let year = if year < 81 { 2000 + year } else { 1900 + year };
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)
    }

    /// Decode a type G (date only, 2 bytes) value.
    pub fn as_date(&self) -> Option<NaiveDate> {
        if self.value.len() != 2 {
            return None;
        }
        let day = (self.value[0] & 0x1F) as u32;
        let month = (self.value[1] & 0x0F) as u32;
        let year = (((self.value[0] & 0xE0) >> 5) | ((self.value[1] & 0xF0) >> 1)) as i32;
        let year = if year < 81 { 2000 + year } else { 1900 + year };
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

/// Reads header bytes either off the wire or from a compact-frame
/// format template.
enum HeaderSource<'a> {
    Wire,
    Template { bytes: &'a [u8], cursor: usize },
}

impl Telegram {
    /// Parse data records from `pos` to the end of the frame.
    ///
    /// `format` supplies the DIF/VIF template for compact frames. The
    /// collected header bytes are returned so full frames can register
    /// their layout with the format cache.
    pub(crate) fn parse_dv_records(
        &mut self,
        pos: &mut usize,
        format: Option<&[u8]>,
        diagnostics: bool,
    ) -> Vec<u8> {
        let payload_start = *pos;
        let mut collected_format = Vec::new();
        let mut source = match format {
            None => HeaderSource::Wire,
            Some(bytes) => HeaderSource::Template { bytes, cursor: 0 },
        };

        loop {
            let Some(dif) = self.next_header_byte(&mut source, pos, diagnostics, "dif") else {
                break;
            };

            if dif == 0x2F {
                // Padding/idle filler.
                self.annotate_header(pos, dif, &source, diagnostics, "padding");
                continue;
            }

            if dif == 0x0F || dif == 0x1F {
                // Manufacturer specific data until the end of the frame.
                self.annotate_header(pos, dif, &source, diagnostics, "manufacturer specific data follows");
                self.mfct_0f_index = Some(*pos - payload_start);
                let remaining = self.frame.len() - *pos;
                if remaining > 0 {
                    let info = format!(
                        "{} mfct specific",
                        encode_hex(&self.frame[*pos..])
                    );
                    self.add_explanation(
                        pos,
                        remaining,
                        KindOfData::Content,
                        Understanding::None,
                        info,
                        diagnostics,
                    );
                }
                break;
            }

            if dif & 0x0F == 0x0F {
                // Other special functions end the walk.
                self.annotate_header(pos, dif, &source, diagnostics, "special function dif");
                break;
            }

            let entry_offset = *pos;
            collected_format.push(dif);
            self.annotate_header(pos, dif, &source, diagnostics, "dif");

            // DIFE chain.
            let mut difes = Vec::new();
            let mut ext = dif & 0x80 != 0;
            while ext {
                let Some(dife) = self.next_header_byte(&mut source, pos, diagnostics, "dife") else {
                    break;
                };
                collected_format.push(dife);
                self.annotate_header(pos, dife, &source, diagnostics, "dife");
                ext = dife & 0x80 != 0;
                difes.push(dife);
            }

            // VIF, possibly escaping into an extension table.
            let Some(vif) = self.next_header_byte(&mut source, pos, diagnostics, "vif") else {
                break;
            };
            collected_format.push(vif);
            self.annotate_header(pos, vif, &source, diagnostics, "vif");

            let mut vifes = Vec::new();
            let mut ext = vif & 0x80 != 0;
            while ext {
                let Some(vife) = self.next_header_byte(&mut source, pos, diagnostics, "vife") else {
                    break;
                };
                collected_format.push(vife);
                self.annotate_header(pos, vife, &source, diagnostics, "vife");
                ext = vife & 0x80 != 0;
                vifes.push(vife);
            }

            // Value bytes always come off the wire.
            let encoding = dif_encoding(dif);
            let data_len = match encoding {
                DataEncoding::None => 0,
                DataEncoding::Int(n) | DataEncoding::Bcd(n) => n,
                DataEncoding::Real32 => 4,
                DataEncoding::Variable => {
                    if *pos >= self.frame.len() {
                        break;
                    }
                    let lvar = self.frame[*pos];
                    self.add_explanation(
                        pos,
                        1,
                        KindOfData::Protocol,
                        Understanding::Full,
                        format!("{lvar:02x} lvar"),
                        diagnostics,
                    );
                    lvar as usize
                }
                DataEncoding::Special => 0,
            };

            if *pos + data_len > self.frame.len() {
                log::debug!(
                    "(dvparser) record at {entry_offset} needs {data_len} bytes, only {} remain",
                    self.frame.len() - *pos
                );
                break;
            }

            let value = self.frame[*pos..*pos + data_len].to_vec();
            let info = resolve_vif(vif, &vifes);
            if data_len > 0 {
                let text = format!(
                    "{} {} ({})",
                    encode_hex(&value),
                    info.quantity.to_lowercase(),
                    describe_vif(&info),
                );
                self.add_explanation(
                    pos,
                    data_len,
                    KindOfData::Content,
                    Understanding::Full,
                    text,
                    diagnostics,
                );
            }

            let (storage_nr, tariff, sub_unit) = accumulate_dife_addressing(dif, &difes);

            let entry = DvEntry {
                offset: entry_offset,
                dif,
                difes,
                vif,
                vifes,
                storage_nr,
                tariff,
                sub_unit,
                measurement_type: MeasurementType::from_dif(dif),
                value,
                unit: info.unit.to_string(),
                scale: info.scale,
                quantity: info.quantity.to_string(),
            };

            let mut key = entry.key();
            if self.dv_entries.contains_key(&key) {
                let mut n = 1;
                while self.dv_entries.contains_key(&format!("{key}_{n}")) {
                    n += 1;
                }
                key = format!("{key}_{n}");
            }
            self.dv_entries.insert(key, entry.clone());
            self.dv_entries_ordered.push(entry);

            // Template exhausted and wire exhausted both end the walk via
            // next_header_byte returning None on the next iteration.
            if matches!(source, HeaderSource::Wire) && *pos >= self.frame.len() {
                break;
            }
        }

        collected_format
    }

    /// Fetch the next DIF/DIFE/VIF/VIFE byte from the wire or template.
    fn next_header_byte(
        &mut self,
        source: &mut HeaderSource,
        pos: &mut usize,
        _diagnostics: bool,
        _what: &str,
    ) -> Option<u8> {
        match source {
            HeaderSource::Wire => {
                if *pos >= self.frame.len() {
                    None
                } else {
                    Some(self.frame[*pos])
                }
            }
            HeaderSource::Template { bytes, cursor } => {
                if *cursor >= bytes.len() {
                    None
                } else {
                    let b = bytes[*cursor];
                    *cursor += 1;
                    Some(b)
                }
            }
        }
    }

    /// Consume the header byte: on the wire it occupies a frame byte and
    /// gets an annotation, from a template it is free.
    fn annotate_header(
        &mut self,
        pos: &mut usize,
        byte: u8,
        source: &HeaderSource,
        diagnostics: bool,
        what: &str,
    ) {
        if matches!(source, HeaderSource::Wire) {
            self.add_explanation(
                pos,
                1,
                KindOfData::Protocol,
                Understanding::Full,
                format!("{byte:02x} {what}"),
                diagnostics,
            );
        }
    }
}

fn describe_vif(info: &VifInfo) -> String {
    if info.unit.is_empty() {
        info.quantity.to_string()
    } else {
        format!("{} {}", info.quantity, info.unit)
    }
}

/// Accumulate storage number, tariff and sub-unit from the DIF and its
/// extension chain.
fn accumulate_dife_addressing(dif: u8, difes: &[u8]) -> (u32, u32, u32) {
    let mut storage = ((dif >> 6) & 0x01) as u32;
    let mut tariff = 0u32;
    let mut sub_unit = 0u32;
    for (n, &dife) in difes.iter().enumerate() {
        storage |= ((dife & 0x0F) as u32) << (1 + 4 * n);
        tariff |= (((dife >> 4) & 0x03) as u32) << (2 * n);
        sub_unit |= (((dife >> 6) & 0x01) as u32) << n;
    }
    (storage, tariff, sub_unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{About, TelegramFormat};
    use crate::util::hex::hex_to_bytes;

    fn telegram_with_payload(hex: &str) -> (Telegram, usize) {
        let mut t = Telegram::new(About::new("test", TelegramFormat::WMBus));
        t.frame = hex_to_bytes(hex);
        (t, 0)
    }

    #[test]
    fn test_single_bcd_record() {
        // 0C 13: 8 digit BCD volume in liters, value 12345678.
        let (mut t, mut pos) = telegram_with_payload("0c1378563412");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries_ordered.len(), 1);
        let e = &t.dv_entries_ordered[0];
        assert_eq!(e.dif, 0x0C);
        assert_eq!(e.vif, 0x13);
        assert_eq!(e.as_bcd(), Some(12345678));
        assert!((e.as_f64().unwrap() - 12345.678).abs() < 1e-9);
        assert_eq!(e.quantity, "Volume");
    }

    #[test]
    fn test_datetime_and_error_flag_records() {
        // 04 6D: 4-byte date+time; 04 FD 17: 4-byte error flags.
        let (mut t, mut pos) = telegram_with_payload("046d3237a92104fd1700000000");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries_ordered.len(), 2);

        let dt = &t.dv_entries_ordered[0];
        assert_eq!(dt.quantity, "Date and time");
        let decoded = dt.as_datetime().unwrap();
        // 32 37 a9 21: minute 0x32&0x3f=50, hour 0x37&0x1f=23.
        assert_eq!(decoded.time().format("%H:%M").to_string(), "23:50");

        let err = &t.dv_entries_ordered[1];
        assert_eq!(err.vif, 0xFD);
        assert_eq!(err.vifes, vec![0x17]);
        assert_eq!(err.quantity, "Error flags");
        assert_eq!(err.as_u64(), Some(0));
    }

    #[test]
    fn test_storage_and_tariff_from_dife() {
        // 84 10 13: DIF 0x84 (32-bit int, ext), DIFE 0x10 (tariff 1), VIF 0x13.
        let (mut t, mut pos) = telegram_with_payload("841013a0860100");
        t.parse_dv_records(&mut pos, None, true);
        let e = &t.dv_entries_ordered[0];
        assert_eq!(e.tariff, 1);
        assert_eq!(e.storage_nr, 0);
        assert_eq!(e.as_u64(), Some(0x000186a0));
    }

    #[test]
    fn test_storage_lsb_from_dif_bit6() {
        // 44 13: storage 1 (bit 6), 32-bit int volume.
        let (mut t, mut pos) = telegram_with_payload("441300000000");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries_ordered[0].storage_nr, 1);
    }

    #[test]
    fn test_measurement_types() {
        // 14 13: function field 01, a maximum value.
        let (mut t, mut pos) = telegram_with_payload("141300000000");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(
            t.dv_entries_ordered[0].measurement_type,
            MeasurementType::Maximum
        );

        // 24 13: function field 10, a minimum value.
        let (mut t, mut pos) = telegram_with_payload("241300000000");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(
            t.dv_entries_ordered[0].measurement_type,
            MeasurementType::Minimum
        );
    }

    #[test]
    fn test_padding_is_skipped() {
        let (mut t, mut pos) = telegram_with_payload("2f2f0c13785634122f2f");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries_ordered.len(), 1);
        assert_eq!(t.dv_entries_ordered[0].as_bcd(), Some(12345678));
    }

    #[test]
    fn test_mfct_tail_recorded() {
        let (mut t, mut pos) = telegram_with_payload("0c13785634120f0102deadbeef");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries_ordered.len(), 1);
        // Tail begins right after the 0x0F marker.
        assert_eq!(t.mfct_0f_index, Some(7));
        assert_eq!(t.extract_mfct_data(), hex_to_bytes("0102deadbeef"));
    }

    #[test]
    fn test_compact_template_parse() {
        // Template 02FF20 04 13 44 13: three records, values from wire.
        let template = hex_to_bytes("02ff2004134413");
        let (mut t, mut pos) = telegram_with_payload("110244332211aabbccdd");
        t.parse_dv_records(&mut pos, Some(&template), true);
        assert_eq!(t.dv_entries_ordered.len(), 3);
        assert_eq!(t.dv_entries_ordered[0].as_u64(), Some(0x0211));
        assert_eq!(t.dv_entries_ordered[1].as_u64(), Some(0x11223344));
        assert_eq!(t.dv_entries_ordered[2].as_u64(), Some(0xddccbbaa));
    }

    #[test]
    fn test_duplicate_keys_get_subscripts() {
        let (mut t, mut pos) = telegram_with_payload("0c13785634120c1311111111");
        t.parse_dv_records(&mut pos, None, true);
        assert_eq!(t.dv_entries.len(), 2);
        assert!(t.dv_entries.contains_key("0c13"));
        assert!(t.dv_entries.contains_key("0c13_1"));
    }

    #[test]
    fn test_truncated_record_stops_cleanly() {
        let (mut t, mut pos) = telegram_with_payload("0c1378");
        t.parse_dv_records(&mut pos, None, true);
        assert!(t.dv_entries_ordered.is_empty());
    }

    #[test]
    fn test_date_type_g() {
        // 02 6C: type G date. 0xA9 0x21 -> day 9, month 1, year (101)|(2)... decode sanity.
        let (mut t, mut pos) = telegram_with_payload("026cbe2b");
        t.parse_dv_records(&mut pos, None, true);
        let e = &t.dv_entries_ordered[0];
        let d = e.as_date().unwrap();
        // 0xBE: day 0x1E=30, year-low (0xBE&0xE0)>>5=5; 0x2B: month 11, year-high (0x20)>>1=16.
        assert_eq!(d.format("%Y-%m-%d").to_string(), "2021-11-30");
    }
}
