//! # Layered Telegram Parsing
//!
//! A single forward pass over the trimmed frame: DLL, then ELL, NWL and
//! AFL when their CI fields announce them, then the TPL dispatch and the
//! data records. Decryption happens in place as soon as the owning layer
//! has been read, so later layers always see plaintext.
//!
//! Layer routines return [`Next`]: `Continue` hands the cursor to the
//! next layer, `Stop` ends the parse with whatever outcome has been
//! recorded on the telegram. Frame-level corruption (a frame too short
//! to even hold its announced DLL) is the only hard error; everything
//! else produces a partial telegram that can still be rendered and
//! matched against meters.

use super::dv::DvEntry;
use super::{
    afl_auth_type_mac_len, EllSecurityMode, KindOfData, ParseOutcome, ParserContext, Telegram,
    TelegramFormat, TplSecurityMode, Understanding,
};
use crate::constants::{
    c_field_name, ci_name, ci_type, ell_ci_length, manufacturer_flag, manufacturer_name,
    mbus_c_field_name, media_type_name, tpl_status_name, CiType, AFL_90, ELL_II, ELL_III, ELL_IV,
    ELL_V, MFCT_SPECIFIC_A0, MFCT_SPECIFIC_A3, NWL_81, TPL_72, TPL_78, TPL_79, TPL_7A,
};
use crate::crypto::{
    aes_cmac, apply_ell_aes_ctr, cbc_iv_mode5, cmac_matches_truncated, decrypt_aes_cbc,
    kdf1_derive, MeterKeys,
};
use crate::error::GatewayError;
use crate::util::crc::crc16_en13757;
use crate::util::hex::encode_hex;

/// Flow control between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Stop,
}

/// Per-parse parameters threaded through the layer routines.
struct ParseRun<'a> {
    keys: &'a MeterKeys,
    ctx: &'a mut ParserContext,
    /// Suppress warnings entirely (header-only pre-parse).
    warn: bool,
}

impl<'a> ParseRun<'a> {
    fn diagnostics(&self) -> bool {
        self.ctx.diagnostics
    }
}

/// Manufacturers whose radio addons scramble the DLL address layout.
const DIEHL_MFCT_FLAGS: [&str; 3] = ["DME", "HYD", "SAP"];

impl Telegram {
    /// Parse a telegram, headers only: enough to extract the ids used
    /// for meter matching. No warnings, no decryption.
    pub fn parse_header(&mut self, input_frame: &[u8]) -> Result<ParseOutcome, GatewayError> {
        let keys = MeterKeys::none();
        let mut ctx = ParserContext::new();
        self.run_parse(input_frame, &keys, &mut ctx, false)
    }

    /// Parse a telegram fully, decrypting with `keys` where the frame
    /// asks for it.
    pub fn parse(
        &mut self,
        input_frame: &[u8],
        keys: &MeterKeys,
        ctx: &mut ParserContext,
    ) -> Result<ParseOutcome, GatewayError> {
        self.run_parse(input_frame, keys, ctx, true)
    }

    fn run_parse(
        &mut self,
        input_frame: &[u8],
        keys: &MeterKeys,
        ctx: &mut ParserContext,
        warn: bool,
    ) -> Result<ParseOutcome, GatewayError> {
        self.frame = input_frame.to_vec();
        self.parsed = 0;
        self.explanations.clear();
        self.ids.clear();
        self.dv_entries.clear();
        self.dv_entries_ordered.clear();
        self.decryption_failed = false;
        self.must_check_mac = false;
        self.tpl_id_found = false;
        self.tpl_sec_mode = TplSecurityMode::NoSecurity;
        self.tpl_num_encr_blocks = 0;
        self.tpl_generated_key = None;
        self.tpl_generated_mac_key = None;
        self.mfct_0f_index = None;
        self.header_size = 0;
        self.suffix_size = 0;
        self.outcome = ParseOutcome::Complete;

        let mut run = ParseRun { keys, ctx, warn };

        match self.about.format {
            TelegramFormat::WMBus => self.parse_wmbus(&mut run)?,
            TelegramFormat::MBus => self.parse_mbus(&mut run)?,
            TelegramFormat::Han => {
                return Err(GatewayError::TelegramParseError(
                    "han telegrams are not supported".to_string(),
                ))
            }
        }

        Ok(self.outcome)
    }

    fn parse_wmbus(&mut self, run: &mut ParseRun) -> Result<(), GatewayError> {
        self.pre_process();

        let mut pos = 0usize;

        self.parse_dll(&mut pos, run)?;

        if self.parse_ell(&mut pos, run)? == Next::Stop {
            return Ok(());
        }
        if self.parse_nwl(&mut pos, run)? == Next::Stop {
            return Ok(());
        }
        if self.parse_afl(&mut pos, run)? == Next::Stop {
            return Ok(());
        }
        self.parse_tpl(&mut pos, run)?;
        Ok(())
    }

    fn parse_mbus(&mut self, run: &mut ParseRun) -> Result<(), GatewayError> {
        let mut pos = 0usize;
        self.parse_mbus_dll_and_tpl(&mut pos, run)
    }

    /// Known non-compliant Diehl radio addons transmit version and type
    /// ahead of the serial number. Rewrite the address into standard
    /// order and keep the original bytes.
    fn pre_process(&mut self) {
        if self.frame.len() < 11 {
            return;
        }
        let mfct = ((self.frame[3] as u16) << 8) | self.frame[2] as u16;
        let flag = manufacturer_flag(mfct);
        if !DIEHL_MFCT_FLAGS.contains(&flag.as_str()) {
            return;
        }
        if self.frame[10] != MFCT_SPECIFIC_A3 {
            return;
        }
        log::debug!("(diehl) address transform for mfct {flag}");
        self.original_dll = Some(self.frame[0..10].to_vec());
        // ver | type | id[4]  ->  id[4] | ver | type
        let mut a = [0u8; 6];
        a.copy_from_slice(&self.frame[4..10]);
        self.frame[4..8].copy_from_slice(&a[2..6]);
        self.frame[8] = a[0];
        self.frame[9] = a[1];
    }

    fn check(&self, pos: usize, needed: usize) -> Result<(), GatewayError> {
        if pos + needed > self.frame.len() {
            return Err(GatewayError::TelegramParseError(format!(
                "expected {needed} more bytes at offset {pos} but frame is {} bytes",
                self.frame.len()
            )));
        }
        Ok(())
    }

    fn parse_dll(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 10)?;

        self.dll_len = self.frame[*pos];
        if self.frame.len() < self.dll_len as usize {
            return Err(GatewayError::TelegramParseError(format!(
                "length field {} exceeds frame size {}",
                self.dll_len,
                self.frame.len()
            )));
        }
        let text = format!("{:02x} length ({} bytes)", self.dll_len, self.dll_len);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.dll_c = self.frame[*pos];
        let text = format!("{:02x} dll-c ({})", self.dll_c, c_field_name(self.dll_c));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.dll_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.dll_mfct = ((self.dll_mfct_b[1] as u16) << 8) | self.dll_mfct_b[0] as u16;
        let text = format!(
            "{:02x}{:02x} dll-mfct ({})",
            self.dll_mfct_b[0],
            self.dll_mfct_b[1],
            manufacturer_flag(self.dll_mfct)
        );
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.dll_id_b
            .copy_from_slice(&self.frame[*pos..*pos + 4]);
        self.dll_a[0..4].copy_from_slice(&self.frame[*pos..*pos + 4]);
        let id = format!(
            "{:02x}{:02x}{:02x}{:02x}",
            self.dll_id_b[3], self.dll_id_b[2], self.dll_id_b[1], self.dll_id_b[0]
        );
        self.ids.push(id.clone());
        let text = format!(
            "{} dll-id ({})",
            encode_hex(&self.dll_id_b),
            id
        );
        self.add_explanation(pos, 4, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.dll_version = self.frame[*pos];
        self.dll_a[4] = self.dll_version;
        let text = format!("{:02x} dll-version", self.dll_version);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.dll_type = self.frame[*pos];
        self.dll_a[5] = self.dll_type;
        let text = format!(
            "{:02x} dll-type ({})",
            self.dll_type,
            media_type_name(self.dll_type)
        );
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        Ok(())
    }

    fn parse_ell(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<Next, GatewayError> {
        let diagnostics = run.diagnostics();
        if *pos >= self.frame.len() {
            return Ok(Next::Stop);
        }
        let ci = self.frame[*pos];
        if ci_type(ci) != CiType::Ell {
            return Ok(Next::Continue);
        }
        self.ell_ci = ci;
        let text = format!("{ci:02x} ell-ci-field ({})", ci_name(ci));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if ci == ELL_V {
            // Declared in the tables, but no meter using it has ever
            // been captured; lengths are unknown.
            log::debug!("(wmbus) ELL V not yet handled");
            self.outcome = ParseOutcome::ParseError;
            return Ok(Next::Stop);
        }

        self.check(*pos, ell_ci_length(ci))?;

        // All ELL variants start with cc and acc.
        self.ell_cc = self.frame[*pos];
        let text = format!("{:02x} ell-cc", self.ell_cc);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.ell_acc = self.frame[*pos];
        let text = format!("{:02x} ell-acc", self.ell_acc);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        let has_target_address = matches!(ci, ELL_III | ELL_IV);
        let has_session_number = matches!(ci, ELL_II | ELL_IV);

        if has_target_address {
            let mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
            self.ell_mfct = ((mfct_b[1] as u16) << 8) | mfct_b[0] as u16;
            let text = format!(
                "{:02x}{:02x} ell-mfct ({})",
                mfct_b[0],
                mfct_b[1],
                manufacturer_flag(self.ell_mfct)
            );
            self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            self.ell_id_found = true;
            self.ell_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            let id = format!(
                "{:02x}{:02x}{:02x}{:02x}",
                self.ell_id_b[3], self.ell_id_b[2], self.ell_id_b[1], self.ell_id_b[0]
            );
            self.ids.push(id);
            let text = format!("{} ell-id", encode_hex(&self.ell_id_b));
            self.add_explanation(pos, 4, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            self.ell_version = self.frame[*pos];
            let text = format!("{:02x} ell-version", self.ell_version);
            self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            self.ell_type = self.frame[*pos];
            let text = format!("{:02x} ell-type", self.ell_type);
            self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        }

        if has_session_number {
            let sn_b: [u8; 4] = [
                self.frame[*pos],
                self.frame[*pos + 1],
                self.frame[*pos + 2],
                self.frame[*pos + 3],
            ];
            self.ell_sn = u32::from_le_bytes(sn_b);
            self.ell_sn_session = (self.ell_sn & 0x0F) as u8;
            self.ell_sn_time = (self.ell_sn >> 4) & 0x01FF_FFFF;
            let sec_bits = ((self.ell_sn >> 29) & 0x07) as u8;
            self.ell_sec_mode = EllSecurityMode::from_bits(sec_bits);
            let text = format!(
                "{} sn ({} session={} time={})",
                encode_hex(&sn_b),
                self.ell_sec_mode.name(),
                self.ell_sn_session,
                self.ell_sn_time
            );
            self.add_explanation(pos, 4, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            if self.ell_sec_mode == EllSecurityMode::AesCtr {
                if let Some(key) = run.keys.confidentiality_key() {
                    // CTR always "succeeds"; a wrong key produces noise
                    // which the payload CRC below catches.
                    let mut iv_prefix = [0u8; 13];
                    iv_prefix[0..2].copy_from_slice(&self.dll_mfct_b);
                    iv_prefix[2..8].copy_from_slice(&self.dll_a);
                    iv_prefix[8] = self.ell_cc;
                    iv_prefix[9..13].copy_from_slice(&sn_b);

                    let mut rest = self.frame[*pos..].to_vec();
                    apply_ell_aes_ctr(key, &iv_prefix, &mut rest);
                    let start = *pos;
                    self.frame[start..].copy_from_slice(&rest);
                }
            }

            self.check(*pos, 2)?;
            let crc_b = [self.frame[*pos], self.frame[*pos + 1]];
            self.ell_pl_crc = ((crc_b[1] as u16) << 8) | crc_b[0] as u16;
            let computed = crc16_en13757(&self.frame[*pos + 2..]);
            let crc_ok = computed == self.ell_pl_crc;
            let text = format!(
                "{:02x}{:02x} payload crc (calculated {:02x}{:02x} {})",
                crc_b[0],
                crc_b[1],
                computed & 0xff,
                computed >> 8,
                if crc_ok { "OK" } else { "ERROR" }
            );
            self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            if !crc_ok {
                // Wrong key, or no key at all, was used for the CTR pass.
                self.decryption_failed = true;
                self.outcome = ParseOutcome::DecryptionFailed;
                let remaining = self.frame.len() - *pos;
                let info = format!(
                    "{} failed decryption. Wrong key?",
                    encode_hex(&self.frame[*pos..])
                );
                self.add_explanation(pos, remaining, KindOfData::Content, Understanding::Encrypted, info, diagnostics);

                if run.keys.has_confidentiality_key() {
                    self.warn_once_per_meter(
                        run,
                        "decrypted payload crc failed check, did you use the correct decryption key?",
                    );
                }
                return Ok(Next::Stop);
            }
        }

        Ok(Next::Continue)
    }

    fn parse_nwl(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<Next, GatewayError> {
        let diagnostics = run.diagnostics();
        if *pos >= self.frame.len() {
            return Ok(Next::Stop);
        }
        let ci = self.frame[*pos];
        if ci != NWL_81 {
            return Ok(Next::Continue);
        }
        self.nwl_ci = ci;
        let text = format!("{ci:02x} nwl-ci-field ({})", ci_name(ci));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.check(*pos, 1)?;
        let nwl = self.frame[*pos];
        let text = format!("{nwl:02x} nwl info");
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        Ok(Next::Continue)
    }

    fn parse_afl(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<Next, GatewayError> {
        let diagnostics = run.diagnostics();
        if *pos >= self.frame.len() {
            return Ok(Next::Stop);
        }
        let ci = self.frame[*pos];
        if ci != AFL_90 {
            return Ok(Next::Continue);
        }
        self.afl_ci = ci;
        let text = format!("{ci:02x} afl-ci-field ({})", ci_name(ci));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.check(*pos, 1)?;
        self.afl_len = self.frame[*pos];
        let text = format!("{:02x} afl-len ({})", self.afl_len, self.afl_len);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.check(*pos, 2)?;
        let fc_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.afl_fc = ((fc_b[1] as u16) << 8) | fc_b[0] as u16;
        let text = format!("{:02x}{:02x} afl-fc", fc_b[0], fc_b[1]);
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        let has_key_info = self.afl_fc & 0x0200 != 0;
        let has_mac = self.afl_fc & 0x0400 != 0;
        let has_counter = self.afl_fc & 0x0800 != 0;
        let has_control = self.afl_fc & 0x2000 != 0;

        if has_control {
            self.check(*pos, 1)?;
            self.afl_mcl = self.frame[*pos];
            let text = format!("{:02x} afl-mcl", self.afl_mcl);
            self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        }

        if has_key_info {
            self.check(*pos, 2)?;
            let ki_b = [self.frame[*pos], self.frame[*pos + 1]];
            self.afl_ki = ((ki_b[1] as u16) << 8) | ki_b[0] as u16;
            let text = format!("{:02x}{:02x} afl-ki", ki_b[0], ki_b[1]);
            self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        }

        if has_counter {
            self.check(*pos, 4)?;
            self.afl_counter_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            self.afl_counter = u32::from_le_bytes(self.afl_counter_b);
            let text = format!(
                "{} afl-counter ({})",
                encode_hex(&self.afl_counter_b),
                self.afl_counter
            );
            self.add_explanation(pos, 4, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        }

        if has_mac {
            let at = self.afl_mcl & 0x0F;
            let Some(mac_len) = afl_auth_type_mac_len(at).filter(|l| *l > 0) else {
                log::warn!("(wmbus) bad mac length in afl");
                self.outcome = ParseOutcome::ParseError;
                return Ok(Next::Stop);
            };
            self.check(*pos, mac_len)?;
            self.afl_mac = self.frame[*pos..*pos + mac_len].to_vec();
            let text = format!("{} afl-mac {} bytes", encode_hex(&self.afl_mac), mac_len);
            self.add_explanation(pos, mac_len, KindOfData::Protocol, Understanding::Full, text, diagnostics);
            self.must_check_mac = true;
        }

        Ok(Next::Continue)
    }

    fn parse_tpl(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        if *pos >= self.frame.len() {
            return Ok(());
        }
        let ci = self.frame[*pos];
        if ci_type(ci) != CiType::Tpl && ci_type(ci) != CiType::MfctSpecific {
            log::warn!("(wmbus) unknown tpl-ci-field {ci:02x}");
            self.header_size = *pos;
            self.outcome = ParseOutcome::ParseError;
            return Ok(());
        }
        self.tpl_ci = ci;
        self.tpl_start = *pos;
        let text = format!("{ci:02x} tpl-ci-field ({})", ci_name(ci));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        match ci {
            TPL_72 => self.parse_tpl_72(pos, run),
            TPL_78 => self.parse_tpl_78(pos, run),
            TPL_79 => self.parse_tpl_79(pos, run),
            TPL_7A => self.parse_tpl_7a(pos, run),
            MFCT_SPECIFIC_A0..=MFCT_SPECIFIC_A3 => {
                self.header_size = *pos;
                self.suffix_size = 0;
                let remaining = self.frame.len() - *pos;
                let info = format!("{} mfct specific", encode_hex(&self.frame[*pos..]));
                self.add_explanation(pos, remaining, KindOfData::Content, Understanding::None, info, diagnostics);
                Ok(())
            }
            _ => {
                self.header_size = *pos;
                self.outcome = ParseOutcome::ParseError;
                log::warn!("(wmbus) not implemented tpl-ci {ci:02x}");
                Ok(())
            }
        }
    }

    fn parse_tpl_72(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        self.parse_long_tpl_header(pos, run)?;
        if self.outcome != ParseOutcome::Complete {
            return Ok(());
        }
        let readable = self.potentially_decrypt(pos, run)?;

        self.header_size = *pos;
        self.suffix_size = 0;

        if readable {
            let format_bytes = self.parse_dv_records(pos, None, run.diagnostics());
            run.ctx.formats.remember(&format_bytes);
        } else {
            self.decryption_failed = true;
        }
        Ok(())
    }

    fn parse_tpl_78(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        self.header_size = *pos;
        self.suffix_size = 0;
        let format_bytes = self.parse_dv_records(pos, None, run.diagnostics());
        run.ctx.formats.remember(&format_bytes);
        Ok(())
    }

    fn parse_tpl_79(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 2)?;
        let ecrc0 = self.frame[*pos];
        let ecrc1 = self.frame[*pos + 1];
        let offset = *pos;
        let text = format!("{ecrc0:02x}{ecrc1:02x} format signature");
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        self.format_signature = ((ecrc1 as u16) << 8) | ecrc0 as u16;

        let Some(format_bytes) = run.ctx.formats.lookup(self.format_signature) else {
            self.add_more_explanation(offset, " (unknown)");
            let remaining = self.frame.len() - *pos;
            let info = format!(
                "{} compressed and signature unknown",
                encode_hex(&self.frame[*pos..])
            );
            self.add_explanation(pos, remaining, KindOfData::Content, Understanding::Compressed, info, diagnostics);
            log::debug!(
                "(wmbus) ignoring compressed telegram since format signature hash 0x{:04x} is yet unknown",
                self.format_signature
            );
            self.outcome = ParseOutcome::FormatSignatureUnknown;
            return Ok(());
        };

        self.check(*pos, 2)?;
        let ecrc2 = self.frame[*pos];
        let ecrc3 = self.frame[*pos + 1];
        let text = format!("{ecrc2:02x}{ecrc3:02x} data crc");
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.header_size = *pos;
        self.suffix_size = 0;
        self.parse_dv_records(pos, Some(&format_bytes), diagnostics);
        Ok(())
    }

    fn parse_tpl_7a(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        self.parse_short_tpl_header(pos, run)?;
        if self.outcome != ParseOutcome::Complete {
            return Ok(());
        }
        let readable = self.potentially_decrypt(pos, run)?;

        self.header_size = *pos;
        self.suffix_size = 0;

        if readable {
            let format_bytes = self.parse_dv_records(pos, None, run.diagnostics());
            run.ctx.formats.remember(&format_bytes);
        } else {
            self.decryption_failed = true;
        }
        Ok(())
    }

    fn parse_long_tpl_header(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 8)?;

        self.tpl_id_found = true;
        self.tpl_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
        let id = format!(
            "{:02x}{:02x}{:02x}{:02x}",
            self.tpl_id_b[3], self.tpl_id_b[2], self.tpl_id_b[1], self.tpl_id_b[0]
        );
        self.ids.push(id.clone());
        let text = format!("{} tpl-id ({})", encode_hex(&self.tpl_id_b), id);
        self.add_explanation(pos, 4, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.tpl_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.tpl_mfct = ((self.tpl_mfct_b[1] as u16) << 8) | self.tpl_mfct_b[0] as u16;
        let text = format!(
            "{:02x}{:02x} tpl-mfct ({})",
            self.tpl_mfct_b[0],
            self.tpl_mfct_b[1],
            manufacturer_flag(self.tpl_mfct)
        );
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.tpl_version = self.frame[*pos];
        let text = format!("{:02x} tpl-version", self.tpl_version);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.tpl_type = self.frame[*pos];
        let text = format!(
            "{:02x} tpl-type ({})",
            self.tpl_type,
            media_type_name(self.tpl_type)
        );
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.parse_short_tpl_header(pos, run)
    }

    fn parse_short_tpl_header(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 4)?;

        self.tpl_acc = self.frame[*pos];
        let text = format!("{:02x} tpl-acc-field", self.tpl_acc);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.tpl_sts = self.frame[*pos];
        let text = format!(
            "{:02x} tpl-sts-field ({})",
            self.tpl_sts,
            tpl_status_name(self.tpl_sts)
        );
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.parse_tpl_config(pos, run)
    }

    fn parse_tpl_config(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 2)?;
        let cfg1 = self.frame[*pos];
        let cfg2 = self.frame[*pos + 1];
        self.tpl_cfg = ((cfg2 as u16) << 8) | cfg1 as u16;

        if self.tpl_cfg & 0x1F00 != 0 {
            let mode_bits = ((self.tpl_cfg >> 8) & 0x1F) as u8;
            self.tpl_sec_mode = TplSecurityMode::from_bits(mode_bits);
        }
        let mut has_cfg_ext = false;
        match self.tpl_sec_mode {
            TplSecurityMode::AesCbcIv => {
                self.tpl_num_encr_blocks = ((self.tpl_cfg >> 4) & 0x0F) as usize;
            }
            TplSecurityMode::AesCbcNoIv => {
                self.tpl_num_encr_blocks = ((self.tpl_cfg >> 4) & 0x0F) as usize;
                has_cfg_ext = true;
            }
            _ => {}
        }
        let text = format!(
            "{cfg1:02x}{cfg2:02x} tpl-cfg {:04x} ({} nb={})",
            self.tpl_cfg,
            self.tpl_sec_mode.name(),
            self.tpl_num_encr_blocks
        );
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if has_cfg_ext {
            self.check(*pos, 1)?;
            self.tpl_cfg_ext = self.frame[*pos];
            self.tpl_kdf_selection = (self.tpl_cfg_ext >> 4) & 0x03;
            let text = format!(
                "{:02x} tpl-cfg-ext (KDFS={})",
                self.tpl_cfg_ext, self.tpl_kdf_selection
            );
            self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

            if self.tpl_kdf_selection == 1 {
                let Some(key) = run.keys.confidentiality_key() else {
                    log::debug!("(wmbus) no key, thus cannot execute kdf");
                    self.decryption_failed = true;
                    self.outcome = ParseOutcome::DecryptionFailed;
                    self.annotate_rest_encrypted(pos, run, "encrypted, no key for kdf");
                    self.warn_once_per_meter(run, "telegram is encrypted but no key has been supplied");
                    return Ok(());
                };
                // Counter from the AFL, id from the TPL when present,
                // otherwise fall back to the DLL.
                let id = if self.tpl_id_found { self.tpl_id_b } else { self.dll_id_b };
                let (kenc, kmac) = kdf1_derive(key, self.afl_counter_b, id);
                self.tpl_generated_key = Some(kenc);
                self.tpl_generated_mac_key = Some(kmac);
            }
        }

        Ok(())
    }

    /// Verify the AFL CMAC and decrypt the TPL payload according to the
    /// configured security mode. Returns true when the bytes at `pos`
    /// are readable plaintext.
    fn potentially_decrypt(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<bool, GatewayError> {
        let diagnostics = run.diagnostics();
        match self.tpl_sec_mode {
            TplSecurityMode::AesCbcIv => {
                if self.already_decrypted_cbc(pos, run)? {
                    return Ok(self.outcome == ParseOutcome::Complete);
                }
                let Some(key) = run.keys.confidentiality_key().cloned() else {
                    self.outcome = ParseOutcome::DecryptionFailed;
                    self.annotate_rest_encrypted(pos, run, "encrypted, no key");
                    self.warn_once_per_meter(run, "telegram is encrypted but no key has been supplied");
                    return Ok(false);
                };

                let Some(region) = self.encrypted_region(*pos) else {
                    self.outcome = ParseOutcome::DecryptionFailed;
                    self.annotate_rest_encrypted(pos, run, "encrypted data extends beyond frame");
                    return Ok(false);
                };

                let (mfct, id, version, device_type) = if self.tpl_id_found {
                    (self.tpl_mfct_b, self.tpl_id_b, self.tpl_version, self.tpl_type)
                } else {
                    (self.dll_mfct_b, self.dll_id_b, self.dll_version, self.dll_type)
                };
                let iv = cbc_iv_mode5(mfct, id, version, device_type, self.tpl_acc);

                let mut data = self.frame[region.clone()].to_vec();
                decrypt_aes_cbc(&key, &iv, &mut data)?;
                self.frame[region].copy_from_slice(&data);

                self.verify_decrypt_check_bytes(pos, run, diagnostics)
            }
            TplSecurityMode::AesCbcNoIv => {
                if self.must_check_mac {
                    let mac_ok = self.check_afl_mac();
                    if !mac_ok {
                        self.decryption_failed = true;
                        self.outcome = ParseOutcome::MacFailed;
                        self.annotate_rest_encrypted(pos, run, "encrypted mac failed");
                        if run.keys.has_confidentiality_key() {
                            self.warn_once_per_meter(
                                run,
                                "telegram mac check failed, did you use the correct decryption key?",
                            );
                        }
                        return Ok(false);
                    }
                }

                let Some(key) = self.tpl_generated_key.clone() else {
                    self.outcome = ParseOutcome::DecryptionFailed;
                    self.annotate_rest_encrypted(pos, run, "encrypted, no derived key");
                    return Ok(false);
                };

                let Some(region) = self.encrypted_region(*pos) else {
                    self.outcome = ParseOutcome::DecryptionFailed;
                    self.annotate_rest_encrypted(pos, run, "encrypted data extends beyond frame");
                    return Ok(false);
                };

                let iv = [0u8; 16];
                let mut data = self.frame[region.clone()].to_vec();
                decrypt_aes_cbc(&key, &iv, &mut data)?;
                self.frame[region].copy_from_slice(&data);

                self.verify_decrypt_check_bytes(pos, run, diagnostics)
            }
            TplSecurityMode::Specific16_31 => {
                // Non-standard vendor scheme (Diehl). Left to the
                // downstream driver; the records parse as-is.
                log::debug!("(wmbus) non-standard security mode 16-31");
                Ok(true)
            }
            _ => {
                if run.keys.has_confidentiality_key() {
                    // A key was configured but the telegram is plaintext.
                    // Refusing it avoids accepting a spoofed telegram.
                    self.warn_once_per_meter(
                        run,
                        "telegram should have been encrypted, but was not!",
                    );
                    self.outcome = ParseOutcome::ParseError;
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// A replayed telegram may already carry plaintext even though the
    /// configuration word still claims encryption.
    fn already_decrypted_cbc(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<bool, GatewayError> {
        if *pos + 2 > self.frame.len() {
            return Ok(false);
        }
        if self.frame[*pos] != 0x2F || self.frame[*pos + 1] != 0x2F {
            return Ok(false);
        }
        if run.keys.has_confidentiality_key() {
            // Not acceptable when a key is configured: someone could
            // strip the encryption and replay.
            self.warn_once_per_meter(
                run,
                "telegram should have been fully encrypted, but was not!",
            );
            self.outcome = ParseOutcome::ParseError;
            return Ok(true);
        }
        let diagnostics = run.diagnostics();
        let text = "2f2f already decrypted check bytes".to_string();
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        Ok(true)
    }

    /// Byte range holding the encrypted TPL payload.
    fn encrypted_region(&self, pos: usize) -> Option<std::ops::Range<usize>> {
        let remaining = self.frame.len().checked_sub(pos)?;
        let len = if self.tpl_num_encr_blocks == 0 {
            (remaining / 16) * 16
        } else {
            self.tpl_num_encr_blocks * 16
        };
        if len == 0 || pos + len > self.frame.len() {
            return None;
        }
        Some(pos..pos + len)
    }

    /// After a CBC decrypt the plaintext must start with 2F 2F.
    fn verify_decrypt_check_bytes(
        &mut self,
        pos: &mut usize,
        run: &mut ParseRun,
        diagnostics: bool,
    ) -> Result<bool, GatewayError> {
        self.check(*pos, 2)?;
        let a = self.frame[*pos];
        let b = self.frame[*pos + 1];
        let ok = a == 0x2F && b == 0x2F;
        let text = format!(
            "{a:02x}{b:02x} decrypt check bytes ({})",
            if ok { "OK" } else { "ERROR should be 2f2f" }
        );
        self.add_explanation(pos, 2, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if !ok {
            // Wrong key supplied.
            self.decryption_failed = true;
            self.outcome = ParseOutcome::DecryptionFailed;
            self.annotate_rest_encrypted(pos, run, "failed decryption. Wrong key?");
            if run.keys.has_confidentiality_key() {
                self.warn_once_per_meter(
                    run,
                    "decrypted content failed check, did you use the correct decryption key?",
                );
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// CMAC over MCL, the AFL counter and the TPL from its CI byte to the
    /// end of the frame, truncated to the received MAC length.
    fn check_afl_mac(&mut self) -> bool {
        let Some(kmac) = self.tpl_generated_mac_key.clone() else {
            return false;
        };
        if self.afl_mac.is_empty() {
            return false;
        }
        let mut input = Vec::with_capacity(5 + self.frame.len() - self.tpl_start);
        input.push(self.afl_mcl);
        input.extend_from_slice(&self.afl_counter_b);
        input.extend_from_slice(&self.frame[self.tpl_start..]);

        let computed = aes_cmac(&kmac, &input);
        let ok = cmac_matches_truncated(&computed, &self.afl_mac);
        if ok {
            log::debug!("(wmbus) mac ok");
        } else {
            log::debug!("(wmbus) mac NOT ok");
        }
        ok
    }

    fn annotate_rest_encrypted(&mut self, pos: &mut usize, run: &ParseRun, why: &str) {
        let diagnostics = run.ctx.diagnostics;
        self.header_size = *pos;
        self.suffix_size = 0;
        let remaining = self.frame.len() - *pos;
        if remaining == 0 {
            return;
        }
        let info = format!("{} {}", encode_hex(&self.frame[*pos..]), why);
        self.add_explanation(pos, remaining, KindOfData::Content, Understanding::Encrypted, info, diagnostics);
    }

    fn warn_once_per_meter(&mut self, run: &mut ParseRun, msg: &str) {
        if !run.warn {
            return;
        }
        let should = run.ctx.verbose_warnings
            || run
                .ctx
                .warnings
                .should_warn(self.dll_a, &mut self.triggered_warning);
        if should {
            log::warn!(
                "(wmbus) {} id: {} mfct: ({}) {} type: {} (0x{:02x}) ver: 0x{:02x}",
                msg,
                self.ids.first().map(|s| s.as_str()).unwrap_or("?"),
                manufacturer_flag(self.dll_mfct),
                manufacturer_name(self.dll_mfct),
                media_type_name(self.dll_type),
                self.dll_type,
                self.dll_version
            );
        }
    }

    /// Wired M-Bus: `68 L L 68 C A CI ...` with the checksum and stop
    /// byte already dropped by the framer.
    fn parse_mbus_dll_and_tpl(&mut self, pos: &mut usize, run: &mut ParseRun) -> Result<(), GatewayError> {
        let diagnostics = run.diagnostics();
        self.check(*pos, 7)?;

        if self.frame[*pos] != 0x68 {
            return Err(GatewayError::TelegramParseError(
                "mbus frame does not start with 0x68".to_string(),
            ));
        }
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, "68 start".to_string(), diagnostics);

        self.dll_len = self.frame[*pos];
        let text = format!("{:02x} length ({} bytes)", self.dll_len, self.dll_len);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if self.frame[*pos] != self.dll_len {
            return Err(GatewayError::TelegramParseError(
                "mbus length bytes do not match".to_string(),
            ));
        }
        let text = format!("{:02x} length again ({} bytes)", self.dll_len, self.dll_len);
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if self.frame[*pos] != 0x68 {
            return Err(GatewayError::TelegramParseError(
                "mbus frame second start byte missing".to_string(),
            ));
        }
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, "68 start".to_string(), diagnostics);

        self.dll_c = self.frame[*pos];
        let text = format!("{:02x} dll-c ({})", self.dll_c, mbus_c_field_name(self.dll_c));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        self.mbus_primary_address = self.frame[*pos];
        let text = format!(
            "{:02x} dll-a primary ({})",
            self.mbus_primary_address, self.mbus_primary_address
        );
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);
        self.ids.push(format!("{:02x}", self.mbus_primary_address));

        self.mbus_ci = self.frame[*pos];
        let text = format!("{:02x} tpl-ci ({})", self.mbus_ci, ci_name(self.mbus_ci));
        self.add_explanation(pos, 1, KindOfData::Protocol, Understanding::Full, text, diagnostics);

        if self.mbus_ci == TPL_72 {
            self.tpl_ci = self.mbus_ci;
            self.tpl_start = *pos - 1;
            return self.parse_tpl_72(pos, run);
        }

        log::warn!("(mbus) unknown mbus ci {:02x}", self.mbus_ci);
        self.header_size = *pos;
        self.outcome = ParseOutcome::ParseError;
        Ok(())
    }

    /// Convenience accessor used by downstream drivers and tests.
    pub fn dv_entry(&self, key: &str) -> Option<&DvEntry> {
        self.dv_entries.get(key)
    }
}
