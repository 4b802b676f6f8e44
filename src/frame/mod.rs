//! # Frame Boundary Detection and DLL CRC Trimming
//!
//! Streaming serial data arrives in arbitrary chunks; these routines find
//! telegram boundaries in an accumulating buffer and strip the data link
//! layer CRC blocks so the telegram parser always sees a clean frame.
//!
//! Two detectors are shared by all framers:
//!
//! - [`check_wmbus_frame`] for wireless telegrams: a length byte whose
//!   value equals the remaining buffer minus one, followed by a valid
//!   wM-Bus C field. When the head of the buffer is noise, the detector
//!   scans forward for a plausible (length, C-field) pair.
//! - [`check_mbus_frame`] for wired telegrams: the single byte 0xE5
//!   acknowledgement and the `68 L L 68 ... CS 16` long frame.
//!
//! CRC trimming handles both EN 13757-4 frame formats: format A carries a
//! CRC after the first ten bytes and after every following 16-byte block;
//! format B carries one CRC at the end (plus one at offset 126 for long
//! frames). The DLL CRCs are stored big-endian on the wire.

use crate::constants::is_valid_wmbus_c_field;
use crate::util::crc::crc16_en13757;

/// Outcome of scanning a byte buffer for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// More bytes are needed; the buffer is retained.
    PartialFrame,
    /// A complete frame is present.
    FullFrame,
    /// The buffer does not contain a recognizable frame.
    ErrorInFrame,
}

/// Where a detected frame sits in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFind {
    pub status_is_full: bool,
    /// Value of the length byte.
    pub payload_len: usize,
    /// Offset of the first byte after the length byte.
    pub payload_offset: usize,
    /// Total bytes of this frame, counted from the buffer start.
    pub frame_length: usize,
}

/// Scan `data` for a wireless M-Bus frame.
///
/// When `only_test` is false and the buffer holds nothing plausible, the
/// buffer is cleared (the framer restarts its search on fresh bytes).
pub fn check_wmbus_frame(data: &mut Vec<u8>, find: &mut FrameFind, only_test: bool) -> FrameStatus {
    if data.len() < 11 {
        return FrameStatus::PartialFrame;
    }

    let mut payload_len = data[0] as usize;
    let mut offset = 1usize;

    if !is_valid_wmbus_c_field(data[1]) {
        // Out of sync with the byte stream. Look for a byte pair where
        // the length maps exactly onto the end of the buffer and the
        // following byte is a plausible C field.
        let mut found = false;
        for i in 0..data.len() - 2 {
            if is_valid_wmbus_c_field(data[i + 1]) {
                let remaining = data.len() - i;
                if data[i] as usize + 1 == remaining && data[i + 1] == 0x44 {
                    payload_len = data[i] as usize;
                    offset = i + 1;
                    found = true;
                    log::debug!("(wmbus) out of sync, skipping {i} bytes");
                    break;
                }
            }
        }
        if !found {
            if !only_test {
                log::debug!("(wmbus) no sensible telegram found, clearing buffer");
                data.clear();
            }
            return FrameStatus::ErrorInFrame;
        }
    }

    find.payload_len = payload_len;
    find.payload_offset = offset;
    find.frame_length = payload_len + offset;

    if data.len() < find.frame_length {
        find.status_is_full = false;
        return FrameStatus::PartialFrame;
    }

    find.status_is_full = true;
    FrameStatus::FullFrame
}

/// Recognize one `68 L L 68 body CS 16` long frame with nom streaming
/// combinators; `Incomplete` maps onto [`FrameStatus::PartialFrame`].
fn mbus_long_frame(input: &[u8]) -> nom::IResult<&[u8], usize> {
    use nom::bytes::streaming::{tag, take};
    use nom::number::streaming::be_u8;

    let verify_failed =
        |i| nom::Err::Error(nom::error::Error::new(i, nom::error::ErrorKind::Verify));

    let (i, _) = tag(&[0x68][..])(input)?;
    let (i, len1) = be_u8(i)?;
    let (i, len2) = be_u8(i)?;
    if len1 != len2 {
        return Err(verify_failed(i));
    }
    let (i, _) = tag(&[0x68][..])(i)?;
    let (i, body) = take(len1 as usize)(i)?;
    let (i, checksum) = be_u8(i)?;
    let (i, _) = tag(&[0x16][..])(i)?;

    // CS is the arithmetic sum of C, A, CI and the data bytes.
    let computed = body.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    if computed != checksum {
        return Err(verify_failed(i));
    }
    Ok((i, len1 as usize))
}

/// Scan `data` for a wired M-Bus frame (0xE5 ack or long frame).
pub fn check_mbus_frame(data: &mut Vec<u8>, find: &mut FrameFind, only_test: bool) -> FrameStatus {
    if !data.is_empty() && data[0] == 0xE5 {
        // Single character confirmation frame. When probing a buffer we
        // require it to be exactly one byte, otherwise a wmbus telegram
        // with length 0xE5 would be mistaken for an mbus ack.
        if only_test && data.len() != 1 {
            return FrameStatus::ErrorInFrame;
        }
        find.payload_len = 0;
        find.payload_offset = 0;
        find.frame_length = 1;
        find.status_is_full = true;
        return FrameStatus::FullFrame;
    }
    if data.len() < 6 {
        // 4 byte start, 1 checksum, 1 stop.
        return FrameStatus::PartialFrame;
    }
    // Summarize the parse before touching the buffer again; the nom
    // result borrows it.
    let parsed: Result<Option<usize>, ()> = match mbus_long_frame(data) {
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(_) => Err(()),
        Ok((_, payload_len)) => Ok(Some(payload_len)),
    };

    match parsed {
        Ok(None) => FrameStatus::PartialFrame,
        Err(()) => {
            if !only_test {
                log::debug!("(mbus) no valid frame in buffer, clearing it");
                data.clear();
            }
            FrameStatus::ErrorInFrame
        }
        Ok(Some(payload_len)) => {
            let frame_length = payload_len + 4 + 1 + 1; // start(4) + cs(1) + stop(1)
            find.payload_len = frame_length - 2; // drop checksum and stop byte
            find.payload_offset = 0;
            find.frame_length = frame_length;
            find.status_is_full = true;
            FrameStatus::FullFrame
        }
    }
}

fn read_crc_be(data: &[u8], pos: usize) -> u16 {
    ((data[pos] as u16) << 8) | data[pos + 1] as u16
}

fn trim_format_a(payload: &mut Vec<u8>, quiet: bool) -> bool {
    if payload.len() < 12 {
        if !quiet {
            log::debug!(
                "(wmbus) not enough bytes, expected at least 12 but got {}",
                payload.len()
            );
        }
        return false;
    }
    let len = payload.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);

    // First block: ten bytes of DLL header.
    let calc = crc16_en13757(&payload[0..10]);
    let check = read_crc_be(payload, 10);
    if calc != check {
        if !quiet {
            log::debug!("(wmbus) frame A first crc calculated {calc:04x} expected {check:04x}");
        }
        return false;
    }
    out.extend_from_slice(&payload[0..10]);

    // Middle blocks of 16 bytes each, followed by their CRC.
    let mut pos = 12;
    while pos + 18 <= len {
        let calc = crc16_en13757(&payload[pos..pos + 16]);
        let check = read_crc_be(payload, pos + 16);
        if calc != check {
            if !quiet {
                log::debug!("(wmbus) frame A mid crc calculated {calc:04x} expected {check:04x}");
            }
            return false;
        }
        out.extend_from_slice(&payload[pos..pos + 16]);
        pos += 18;
    }

    // Final short block.
    if pos < len - 2 {
        let tto = len - 2;
        let calc = crc16_en13757(&payload[pos..tto]);
        let check = read_crc_be(payload, tto);
        if calc != check {
            if !quiet {
                log::debug!("(wmbus) frame A final crc calculated {calc:04x} expected {check:04x}");
            }
            return false;
        }
        out.extend_from_slice(&payload[pos..tto]);
    }

    // The length byte now counts the frame without its CRC pairs.
    out[0] = (out.len() - 1) as u8;
    log::trace!("(wmbus) trimmed {} crc bytes from frame A", len - out.len());
    *payload = out;
    true
}

fn trim_format_b(payload: &mut Vec<u8>, quiet: bool) -> bool {
    if payload.len() < 12 {
        if !quiet {
            log::debug!(
                "(wmbus) not enough bytes, expected at least 12 but got {}",
                payload.len()
            );
        }
        return false;
    }
    let len = payload.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);

    // Short frames carry a single trailing CRC; frames longer than 128
    // bytes have an additional CRC at offset 126.
    let (crc1_pos, crc2_pos) = if len <= 128 { (len - 2, 0) } else { (126, len - 2) };

    let calc = crc16_en13757(&payload[0..crc1_pos]);
    let check = read_crc_be(payload, crc1_pos);
    if calc != check {
        if !quiet {
            log::debug!("(wmbus) frame B crc calculated {calc:04x} expected {check:04x}");
        }
        return false;
    }
    out.extend_from_slice(&payload[0..crc1_pos]);

    if crc2_pos > 0 {
        let calc = crc16_en13757(&payload[crc1_pos + 2..crc2_pos]);
        let check = read_crc_be(payload, crc2_pos);
        if calc != check {
            if !quiet {
                log::debug!("(wmbus) frame B final crc calculated {calc:04x} expected {check:04x}");
            }
            return false;
        }
        out.extend_from_slice(&payload[crc1_pos + 2..crc2_pos]);
    }

    out[0] = (out.len() - 1) as u8;
    log::trace!("(wmbus) trimmed {} crc bytes from frame B", len - out.len());
    *payload = out;
    true
}

/// Validate and remove the format A CRC blocks, rewriting the length
/// byte. Returns false if any CRC fails; the payload is untouched then.
pub fn trim_crcs_frame_format_a(payload: &mut Vec<u8>) -> bool {
    trim_format_a(payload, false)
}

/// Validate and remove the format B CRCs, rewriting the length byte.
pub fn trim_crcs_frame_format_b(payload: &mut Vec<u8>) -> bool {
    trim_format_b(payload, false)
}

/// Try format A, then format B, tolerating failure.
///
/// Used by framers whose dongle may or may not have stripped the CRCs
/// already (rawtty, simulation replays).
pub fn remove_any_dll_crcs(payload: &mut Vec<u8>) {
    let trimmed = trim_format_a(payload, true);
    if !trimmed {
        trim_format_b(payload, true);
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Build a format A frame from a bare (no CRC) frame.
    pub fn insert_format_a_crcs(bare: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&bare[0..10]);
        let crc = crc16_en13757(&bare[0..10]);
        out.extend_from_slice(&crc.to_be_bytes());
        let mut pos = 10;
        while pos < bare.len() {
            let end = (pos + 16).min(bare.len());
            out.extend_from_slice(&bare[pos..end]);
            let crc = crc16_en13757(&bare[pos..end]);
            out.extend_from_slice(&crc.to_be_bytes());
            pos = end;
        }
        out
    }
}
