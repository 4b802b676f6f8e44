//! # Telegram Model
//!
//! The [`Telegram`] is the central entity of the gateway: a single
//! received frame, decoded layer by layer (DLL → ELL → NWL → AFL → TPL →
//! data records) with byte-level provenance. Every consumed byte range
//! is recorded as an [`Explanation`], which drives the analysis output
//! and makes mis-parses diagnosable from logs alone.
//!
//! The parser itself lives in [`parser`]; data-record extraction in
//! [`dv`]; compact-frame format caching in [`format`]; duplicate and
//! warning suppression in [`dedup`].

pub mod dedup;
pub mod dv;
pub mod format;
pub mod parser;
pub mod vif;

use crate::crypto::AesKey;
use dedup::{DedupFifo, WarningThrottle};
use dv::DvEntry;
use format::FormatCache;
use std::collections::BTreeMap;

/// Transport the frame arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelegramFormat {
    #[default]
    WMBus,
    MBus,
    Han,
}

/// Source metadata attached by the framer that produced the frame.
#[derive(Debug, Clone, Default)]
pub struct About {
    /// Human readable device name, e.g. `/dev/ttyUSB0:im871a`.
    pub device: String,
    /// Received signal strength, when the dongle reports it.
    pub rssi_dbm: Option<i32>,
    pub format: TelegramFormat,
}

impl About {
    pub fn new(device: &str, format: TelegramFormat) -> Self {
        About {
            device: device.to_string(),
            rssi_dbm: None,
            format,
        }
    }

    pub fn with_rssi(device: &str, format: TelegramFormat, rssi_dbm: i32) -> Self {
        About {
            device: device.to_string(),
            rssi_dbm: Some(rssi_dbm),
            format,
        }
    }
}

/// Whether an annotated byte range is protocol plumbing or meter content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindOfData {
    Protocol,
    Content,
}

/// How well the parser understood an annotated byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Understanding {
    None,
    Encrypted,
    Compressed,
    Partial,
    Full,
}

/// One annotated byte range of the frame.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub offset: usize,
    pub len: usize,
    pub text: String,
    pub kind: KindOfData,
    pub understanding: Understanding,
}

/// Terminal state of a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseOutcome {
    /// Every layer decoded, data records extracted.
    #[default]
    Complete,
    /// Wrong or missing key; content annotated as encrypted.
    DecryptionFailed,
    /// Compact frame with a signature no full frame has established yet.
    FormatSignatureUnknown,
    /// AFL MAC did not verify; decryption was not attempted.
    MacFailed,
    /// Parse stopped at an unknown CI; headers only.
    ParseError,
}

/// ELL session-number security mode (3 bits of the SN field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EllSecurityMode {
    #[default]
    NoSecurity,
    AesCtr,
    Reserved,
}

impl EllSecurityMode {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => EllSecurityMode::NoSecurity,
            1 => EllSecurityMode::AesCtr,
            _ => EllSecurityMode::Reserved,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EllSecurityMode::NoSecurity => "nosec",
            EllSecurityMode::AesCtr => "aes-ctr",
            EllSecurityMode::Reserved => "reserved",
        }
    }
}

/// TPL security mode (5 bits of the configuration word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TplSecurityMode {
    #[default]
    NoSecurity,
    MfctSpecific,
    DesNoIv,
    DesIv,
    /// Mode 5.
    AesCbcIv,
    /// Mode 7.
    AesCbcNoIv,
    /// Mode 13.
    AesCtr,
    Specific16_31,
    Reserved,
}

impl TplSecurityMode {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => TplSecurityMode::NoSecurity,
            1 => TplSecurityMode::MfctSpecific,
            2 => TplSecurityMode::DesNoIv,
            3 => TplSecurityMode::DesIv,
            5 => TplSecurityMode::AesCbcIv,
            7 => TplSecurityMode::AesCbcNoIv,
            13 => TplSecurityMode::AesCtr,
            16..=31 => TplSecurityMode::Specific16_31,
            _ => TplSecurityMode::Reserved,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TplSecurityMode::NoSecurity => "none",
            TplSecurityMode::MfctSpecific => "mfct-specific",
            TplSecurityMode::DesNoIv => "des-no-iv",
            TplSecurityMode::DesIv => "des-iv",
            TplSecurityMode::AesCbcIv => "aes-cbc-iv",
            TplSecurityMode::AesCbcNoIv => "aes-cbc-no-iv",
            TplSecurityMode::AesCtr => "aes-ctr",
            TplSecurityMode::Specific16_31 => "specific-16-31",
            TplSecurityMode::Reserved => "reserved",
        }
    }
}

/// AFL authentication type, selected by the low nibble of the MCL byte.
/// The value is the truncated CMAC length in bytes.
pub fn afl_auth_type_mac_len(at: u8) -> Option<usize> {
    match at {
        0 => Some(0),
        1 => Some(2),
        2 => Some(4),
        3..=5 => Some(8),
        6 | 7 => Some(12),
        8 => Some(16),
        _ => None,
    }
}

/// Shared parser state that outlives individual telegrams: the duplicate
/// FIFO, the per-meter warning throttle and the compact-format cache.
///
/// Owned by the gateway configuration; wrap in a mutex when telegram
/// listeners run on more than one thread.
#[derive(Debug)]
pub struct ParserContext {
    pub ignore_duplicate_telegrams: bool,
    /// When false, byte-range annotations are skipped for throughput.
    pub diagnostics: bool,
    /// Verbose mode prints warnings the throttle would otherwise drop.
    pub verbose_warnings: bool,
    pub dedup: DedupFifo,
    pub warnings: WarningThrottle,
    pub formats: FormatCache,
}

impl Default for ParserContext {
    fn default() -> Self {
        ParserContext {
            ignore_duplicate_telegrams: false,
            diagnostics: true,
            verbose_warnings: false,
            dedup: DedupFifo::new(),
            warnings: WarningThrottle::new(),
            formats: FormatCache::new(),
        }
    }
}

impl ParserContext {
    pub fn new() -> Self {
        ParserContext::default()
    }
}

/// A single decoded (or partially decoded) telegram.
#[derive(Debug, Default)]
pub struct Telegram {
    pub about: About,

    /// The frame bytes being parsed: CRCs trimmed, decrypted in place as
    /// layers unlock.
    pub frame: Vec<u8>,
    /// Number of bytes consumed so far.
    pub parsed: usize,
    pub explanations: Vec<Explanation>,

    // Data link layer.
    pub dll_len: u8,
    pub dll_c: u8,
    pub dll_mfct_b: [u8; 2],
    pub dll_mfct: u16,
    pub dll_id_b: [u8; 4],
    /// id + version + type, the 6 byte meter identity.
    pub dll_a: [u8; 6],
    pub dll_version: u8,
    pub dll_type: u8,

    // Extended link layer.
    pub ell_ci: u8,
    pub ell_cc: u8,
    pub ell_acc: u8,
    pub ell_sn: u32,
    pub ell_sn_session: u8,
    pub ell_sn_time: u32,
    pub ell_sec_mode: EllSecurityMode,
    pub ell_id_found: bool,
    pub ell_mfct: u16,
    pub ell_id_b: [u8; 4],
    pub ell_version: u8,
    pub ell_type: u8,
    pub ell_pl_crc: u16,

    // Network layer.
    pub nwl_ci: u8,

    // Authentication and fragmentation layer.
    pub afl_ci: u8,
    pub afl_len: u8,
    pub afl_fc: u16,
    pub afl_mcl: u8,
    pub afl_ki: u16,
    pub afl_counter_b: [u8; 4],
    pub afl_counter: u32,
    pub afl_mac: Vec<u8>,
    pub must_check_mac: bool,

    // Transport layer.
    pub tpl_ci: u8,
    /// Offset of the TPL CI byte, the start of the MAC-covered region.
    pub tpl_start: usize,
    pub tpl_acc: u8,
    pub tpl_sts: u8,
    pub tpl_cfg: u16,
    pub tpl_cfg_ext: u8,
    pub tpl_kdf_selection: u8,
    pub tpl_sec_mode: TplSecurityMode,
    pub tpl_num_encr_blocks: usize,
    pub tpl_id_found: bool,
    pub tpl_id_b: [u8; 4],
    pub tpl_mfct_b: [u8; 2],
    pub tpl_mfct: u16,
    pub tpl_version: u8,
    pub tpl_type: u8,
    pub tpl_generated_key: Option<AesKey>,
    pub tpl_generated_mac_key: Option<AesKey>,

    // Wired M-Bus link layer.
    pub mbus_primary_address: u8,
    pub mbus_ci: u8,

    /// Ids collected from DLL, ELL and TPL, in that order.
    pub ids: Vec<String>,

    pub header_size: usize,
    pub suffix_size: usize,

    /// Data records, keyed by DIF/VIF hex (with `_n` subscripts for
    /// repeats) and in wire order.
    pub dv_entries: BTreeMap<String, DvEntry>,
    pub dv_entries_ordered: Vec<DvEntry>,
    /// Offset (relative to the payload) of a 0x0F/0x1F manufacturer data
    /// tail, if present.
    pub mfct_0f_index: Option<usize>,

    pub format_signature: u16,

    pub decryption_failed: bool,
    pub triggered_warning: bool,
    pub outcome: ParseOutcome,

    /// Original first ten DLL bytes when the Diehl address pre-process
    /// rewrote them.
    pub original_dll: Option<Vec<u8>>,
}

impl Telegram {
    pub fn new(about: About) -> Self {
        Telegram {
            about,
            ..Telegram::default()
        }
    }

    /// The meter identity most callers want: the last id wins (TPL over
    /// ELL over DLL).
    pub fn primary_id(&self) -> Option<&str> {
        self.ids.last().map(|s| s.as_str())
    }

    /// Payload between header and suffix.
    pub fn extract_payload(&self) -> Vec<u8> {
        let end = self.frame.len() - self.suffix_size;
        self.frame[self.header_size..end].to_vec()
    }

    /// Manufacturer specific tail bytes, when a 0x0F/0x1F DIF marked one.
    pub fn extract_mfct_data(&self) -> Vec<u8> {
        match self.mfct_0f_index {
            None => Vec::new(),
            Some(idx) => {
                let from = self.header_size + idx;
                let to = self.frame.len() - self.suffix_size;
                self.frame[from..to].to_vec()
            }
        }
    }

    pub(crate) fn add_explanation(
        &mut self,
        pos: &mut usize,
        len: usize,
        kind: KindOfData,
        understanding: Understanding,
        text: String,
        diagnostics: bool,
    ) {
        if diagnostics {
            self.explanations.push(Explanation {
                offset: *pos,
                len,
                text,
                kind,
                understanding,
            });
        }
        *pos += len;
        self.parsed = *pos;
    }

    /// Append detail to the explanation that starts at `offset`.
    pub(crate) fn add_more_explanation(&mut self, offset: usize, extra: &str) {
        if let Some(e) = self.explanations.iter_mut().find(|e| e.offset == offset) {
            e.text.push_str(extra);
        }
    }
}
