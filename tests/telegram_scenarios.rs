//! End-to-end telegram parsing scenarios: unencrypted short-header
//! telegrams, mode 5 and mode 7 decryption with right and wrong keys,
//! AFL MAC verification, ELL AES-CTR, compact frame format learning and
//! wired M-Bus long frames.

use wmbus_gateway::crypto::{
    aes_cmac, apply_ell_aes_ctr, cbc_iv_mode5, encrypt_aes_cbc, kdf1_derive, AesKey, MeterKeys,
};
use wmbus_gateway::devices::mbus::MBusFramer;
use wmbus_gateway::devices::BusDeviceFramer;
use wmbus_gateway::telegram::format::FormatCache;
use wmbus_gateway::telegram::{
    About, KindOfData, ParseOutcome, ParserContext, Telegram, TelegramFormat, Understanding,
};
use wmbus_gateway::util::crc::crc16_en13757;
use wmbus_gateway::util::hex::hex_to_bytes;

const T1_FRAME_HEX: &str = "1f44ae4c5678341203077a6a000000046d3237a92104fd1700000000026da921";

fn wmbus_about() -> About {
    About::new("/dev/ttyUSB0:im871a", TelegramFormat::WMBus)
}

fn meter_key() -> AesKey {
    AesKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap()
}

fn wrong_key() -> AesKey {
    AesKey::from_hex("ffeeddccbbaa99887766554433221100").unwrap()
}

#[test]
fn scenario_unencrypted_t1_meter() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::none();
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&hex_to_bytes(T1_FRAME_HEX), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);

    assert_eq!(t.dll_mfct, 0x4CAE);
    assert_eq!(t.ids, vec!["12345678".to_string()]);
    assert_eq!(t.dll_version, 0x03);
    assert_eq!(t.dll_type, 0x07);
    assert_eq!(t.tpl_ci, 0x7A);

    // Date-time record (VIF 0x6D) and error flags (VIF FD 17).
    let dt = t.dv_entry("046d").expect("datetime record");
    assert!(dt.as_datetime().is_some());
    let err = t.dv_entry("04fd17").expect("error flags record");
    assert_eq!(err.as_u64(), Some(0));

    // Header/body/suffix partition covers the frame.
    assert_eq!(t.header_size, 15);
    assert_eq!(t.suffix_size, 0);
    assert_eq!(t.parsed, t.frame.len());
}

#[test]
fn explanations_are_ordered_and_protocol_ranges_disjoint() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::none();
    let mut t = Telegram::new(wmbus_about());
    t.parse(&hex_to_bytes(T1_FRAME_HEX), &keys, &mut ctx).unwrap();

    let mut last_offset = 0;
    let mut last_protocol_end = 0;
    for e in &t.explanations {
        assert!(e.offset >= last_offset, "explanations out of order");
        last_offset = e.offset;
        if e.kind == KindOfData::Protocol {
            assert!(e.offset >= last_protocol_end, "protocol ranges overlap");
            last_protocol_end = e.offset + e.len;
        }
    }
}

fn build_mode5_frame(key: &AesKey) -> Vec<u8> {
    let mut plaintext = hex_to_bytes("2f2f0c7812345678");
    while plaintext.len() < 32 {
        plaintext.push(0x2F);
    }

    let iv = cbc_iv_mode5(
        [0xAE, 0x4C],
        [0x56, 0x78, 0x34, 0x12],
        0x03,
        0x07,
        0x6A,
    );
    let mut ciphertext = plaintext;
    encrypt_aes_cbc(key, &iv, &mut ciphertext).unwrap();

    // tpl-cfg 0x0520: security mode 5, two encrypted blocks.
    let mut frame = hex_to_bytes("2e44ae4c5678341203077a6a002005");
    frame.extend_from_slice(&ciphertext);
    assert_eq!(frame.len(), frame[0] as usize + 1);
    frame
}

#[test]
fn scenario_mode5_decryption_with_correct_key() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(meter_key());
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_mode5_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);
    assert!(!t.decryption_failed);

    // The fabrication number record from the decrypted payload.
    let fab = t.dv_entry("0c78").expect("fabrication record");
    assert_eq!(fab.as_bcd(), Some(78563412));
}

#[test]
fn scenario_mode5_wrong_key_flags_and_warns_once() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(wrong_key());
    let frame = build_mode5_frame(&meter_key());

    let mut first = Telegram::new(wmbus_about());
    let outcome = first.parse(&frame, &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::DecryptionFailed);
    assert!(first.decryption_failed);
    // This telegram triggered the per-meter warning.
    assert!(first.triggered_warning);

    // Ciphertext is annotated as encrypted content.
    assert!(first
        .explanations
        .iter()
        .any(|e| e.understanding == Understanding::Encrypted));

    // A second telegram from the same meter stays silent.
    let mut second = Telegram::new(wmbus_about());
    second.parse(&frame, &keys, &mut ctx).unwrap();
    assert!(second.decryption_failed);
    assert!(!second.triggered_warning);
}

#[test]
fn scenario_mode5_missing_key_marks_encrypted() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::none();
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_mode5_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::DecryptionFailed);
    assert!(t.dv_entries_ordered.is_empty());
    // Headers still parsed: the id is available for matching.
    assert_eq!(t.ids, vec!["12345678".to_string()]);
}

fn build_mode7_frame(key: &AesKey) -> Vec<u8> {
    let counter = [0x01, 0x00, 0x00, 0x00];
    let dll_id = [0x56, 0x78, 0x34, 0x12];
    let (kenc, kmac) = kdf1_derive(key, counter, dll_id);

    let mut plaintext = hex_to_bytes("2f2f0c1344332211");
    while plaintext.len() < 32 {
        plaintext.push(0x2F);
    }
    let mut ciphertext = plaintext;
    encrypt_aes_cbc(&kenc, &[0u8; 16], &mut ciphertext).unwrap();

    // TPL from its CI byte: short header, cfg 0x0720 (mode 7, two
    // blocks), cfg-ext with KDF selection 1.
    let mut tpl = hex_to_bytes("7a6a00200710");
    tpl.extend_from_slice(&ciphertext);

    // MCL: message counter bit plus auth type 8 (16 byte CMAC).
    let mcl = 0x28;
    let mut mac_input = vec![mcl];
    mac_input.extend_from_slice(&counter);
    mac_input.extend_from_slice(&tpl);
    let mac = aes_cmac(&kmac, &mac_input);

    let mut frame = hex_to_bytes("0044ae4c567834120307");
    frame.push(0x90); // afl ci
    frame.push(0x17); // afl len
    frame.extend_from_slice(&[0x00, 0x2C]); // fc: mcl + mac + counter
    frame.push(mcl);
    frame.extend_from_slice(&counter);
    frame.extend_from_slice(&mac);
    frame.extend_from_slice(&tpl);
    frame[0] = (frame.len() - 1) as u8;
    frame
}

#[test]
fn scenario_mode7_mac_verifies_and_decrypts() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(meter_key());
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_mode7_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);
    assert!(t.must_check_mac);
    assert_eq!(t.afl_counter, 1);
    assert_eq!(t.afl_mac.len(), 16);
    assert!(t.tpl_generated_key.is_some());
    assert!(t.tpl_generated_mac_key.is_some());

    let vol = t.dv_entry("0c13").expect("volume record");
    assert_eq!(vol.as_bcd(), Some(11223344));
}

#[test]
fn scenario_mode7_wrong_key_fails_mac_without_decrypting() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(wrong_key());
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_mode7_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::MacFailed);
    assert!(t.decryption_failed);
    // No decrypt attempt: no records, payload annotated encrypted.
    assert!(t.dv_entries_ordered.is_empty());
    assert!(t
        .explanations
        .iter()
        .any(|e| e.understanding == Understanding::Encrypted));
}

#[test]
fn scenario_compact_frame_format_learning() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::none();

    // The header layout of the full frame: datetime + bcd volume.
    let format_bytes = hex_to_bytes("046d0c13");
    let signature = FormatCache::signature(&format_bytes);

    let mut compact = hex_to_bytes("0044ae4c567834120307");
    compact.push(0x79);
    compact.extend_from_slice(&signature.to_le_bytes());
    compact.extend_from_slice(&[0x00, 0x00]); // data crc
    compact.extend_from_slice(&hex_to_bytes("3237a92178563412"));
    compact[0] = (compact.len() - 1) as u8;

    // 1: compact arrives first, the signature is unknown.
    let mut t1 = Telegram::new(wmbus_about());
    let outcome = t1.parse(&compact, &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::FormatSignatureUnknown);
    assert_eq!(t1.format_signature, signature);
    assert!(t1.dv_entries_ordered.is_empty());
    assert!(t1
        .explanations
        .iter()
        .any(|e| e.understanding == Understanding::Compressed));

    // 2: a full frame from the meter establishes the layout.
    let mut full = hex_to_bytes("0044ae4c5678341203077a6a000000");
    full.extend_from_slice(&hex_to_bytes("046d3237a9210c1378563412"));
    full[0] = (full.len() - 1) as u8;
    let mut t2 = Telegram::new(wmbus_about());
    assert_eq!(t2.parse(&full, &keys, &mut ctx).unwrap(), ParseOutcome::Complete);
    assert_eq!(t2.dv_entries_ordered.len(), 2);

    // 3: the same compact frame now parses identically to the full one.
    let mut t3 = Telegram::new(wmbus_about());
    assert_eq!(t3.parse(&compact, &keys, &mut ctx).unwrap(), ParseOutcome::Complete);
    assert_eq!(t3.dv_entries_ordered.len(), 2);
    for (a, b) in t2.dv_entries_ordered.iter().zip(t3.dv_entries_ordered.iter()) {
        assert_eq!(a.dif, b.dif);
        assert_eq!(a.vif, b.vif);
        assert_eq!(a.value, b.value);
        assert_eq!(a.quantity, b.quantity);
    }
}

#[test]
fn scenario_mbus_long_frame() {
    // 68 L L 68 | C A CI | long tpl header | fabrication record | CS 16
    let body = hex_to_bytes("080172785634122440010755000000 0c7878563412");
    let cs: u8 = body.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    let mut wire = vec![0x68, body.len() as u8, body.len() as u8, 0x68];
    wire.extend_from_slice(&body);
    wire.push(cs);
    wire.push(0x16);

    let mut framer = MBusFramer::new("/dev/ttyUSB0:mbus");
    let frames = framer.on_bytes(&wire);
    assert_eq!(frames.len(), 1);

    let mut ctx = ParserContext::new();
    let keys = MeterKeys::none();
    let mut t = Telegram::new(frames[0].about.clone());
    let outcome = t.parse(&frames[0].frame, &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);

    assert_eq!(t.mbus_primary_address, 0x01);
    assert_eq!(t.mbus_ci, 0x72);
    // Primary address and TPL id both land in the id list.
    assert!(t.ids.contains(&"01".to_string()));
    assert!(t.ids.contains(&"12345678".to_string()));
    assert_eq!(t.tpl_mfct, 0x4024);

    let fab = t.dv_entry("0c78").expect("fabrication record");
    assert_eq!(fab.as_bcd(), Some(12345678));
}

fn build_ell_ctr_frame(key: &AesKey) -> Vec<u8> {
    let cc = 0x20u8;
    let acc = 0x33u8;
    // Security mode 1 (AES-CTR) in the top bits, some session/time.
    let sn: u32 = (1 << 29) | (0x1234 << 4) | 0x5;
    let sn_b = sn.to_le_bytes();

    // Plain TPL: no header, one bcd volume record.
    let payload = hex_to_bytes("780c1344332211");
    let crc = crc16_en13757(&payload);
    let mut encrypted = Vec::new();
    encrypted.extend_from_slice(&crc.to_le_bytes());
    encrypted.extend_from_slice(&payload);

    let mut iv_prefix = [0u8; 13];
    iv_prefix[0..2].copy_from_slice(&[0xAE, 0x4C]);
    iv_prefix[2..8].copy_from_slice(&[0x56, 0x78, 0x34, 0x12, 0x03, 0x07]);
    iv_prefix[8] = cc;
    iv_prefix[9..13].copy_from_slice(&sn_b);
    apply_ell_aes_ctr(key, &iv_prefix, &mut encrypted);

    let mut frame = hex_to_bytes("0044ae4c567834120307");
    frame.push(0x8D); // ELL II
    frame.push(cc);
    frame.push(acc);
    frame.extend_from_slice(&sn_b);
    frame.extend_from_slice(&encrypted);
    frame[0] = (frame.len() - 1) as u8;
    frame
}

#[test]
fn scenario_ell_aes_ctr_roundtrip() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(meter_key());
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_ell_ctr_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);
    assert_eq!(t.ell_ci, 0x8D);
    assert_eq!(t.ell_sn_session, 5);
    assert_eq!(t.ell_sn_time, 0x1234);

    let vol = t.dv_entry("0c13").expect("volume record");
    assert_eq!(vol.as_bcd(), Some(11223344));
}

#[test]
fn scenario_ell_aes_ctr_wrong_key() {
    let mut ctx = ParserContext::new();
    let keys = MeterKeys::with_confidentiality_key(wrong_key());
    let mut t = Telegram::new(wmbus_about());

    let outcome = t.parse(&build_ell_ctr_frame(&meter_key()), &keys, &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::DecryptionFailed);
    assert!(t.decryption_failed);
    assert!(t.dv_entries_ordered.is_empty());
}

#[test]
fn manufacturer_specific_tpl_is_opaque_but_accepted() {
    let mut frame = hex_to_bytes("0044ae4c567834120307");
    frame.push(0xA2);
    frame.extend_from_slice(&hex_to_bytes("deadbeefcafe"));
    frame[0] = (frame.len() - 1) as u8;

    let mut ctx = ParserContext::new();
    let mut t = Telegram::new(wmbus_about());
    let outcome = t.parse(&frame, &MeterKeys::none(), &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);
    assert!(t.dv_entries_ordered.is_empty());
    assert!(t
        .explanations
        .iter()
        .any(|e| e.understanding == Understanding::None));
}

#[test]
fn unknown_tpl_ci_yields_partial_headers() {
    let mut frame = hex_to_bytes("0044ae4c567834120307");
    frame.push(0x42); // not a registered CI
    frame.extend_from_slice(&[0x01, 0x02]);
    frame[0] = (frame.len() - 1) as u8;

    let mut ctx = ParserContext::new();
    let mut t = Telegram::new(wmbus_about());
    let outcome = t.parse(&frame, &MeterKeys::none(), &mut ctx).unwrap();
    assert_eq!(outcome, ParseOutcome::ParseError);
    // DLL ids were still extracted.
    assert_eq!(t.ids, vec!["12345678".to_string()]);
}

#[test]
fn header_only_parse_extracts_ids() {
    let mut t = Telegram::new(wmbus_about());
    let outcome = t.parse_header(&build_mode5_frame(&meter_key())).unwrap();
    // Without a key the body stays encrypted, but matching works.
    assert_eq!(outcome, ParseOutcome::DecryptionFailed);
    assert_eq!(t.ids, vec!["12345678".to_string()]);
    assert!(!t.triggered_warning);
}
