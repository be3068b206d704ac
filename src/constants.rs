// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Command templates and card identification tables.
//!
//! Every template here is transmitted either verbatim or with single bytes
//! patched in (record number, PIN reference, length, offset). The byte values
//! follow the EstEID v1.0/v3.5 card specifications and must not be touched
//! without a card to test against.

use hex_literal::hex;

use crate::types::CardVersion;

/// SELECT MF (the card root).
pub const MASTER_FILE: &[u8] = &hex!("00A4000C");
/// SELECT DF EEEE, the EstEID application directory.
pub const ESTEID_DF: &[u8] = &hex!("00A4010C02EEEE");
/// SELECT EF 5044, personal data records.
pub const PERSONAL_DATA: &[u8] = &hex!("00A4020C025044");
/// SELECT EF 0016, PIN/PUK retry counters.
pub const PIN_RETRY: &[u8] = &hex!("00A4020C020016");
/// SELECT EF 0033, key pointer record (which key slot is which).
pub const KEY_POINTER: &[u8] = &hex!("00A4020C020033");
/// SELECT EF 0013, key usage counters.
pub const KEY_USAGE: &[u8] = &hex!("00A4020C020013");
/// SELECT EF AACE, authentication certificate. Returns the FCP template.
pub const AUTH_CERT: &[u8] = &hex!("00A4020402AACE");
/// SELECT EF DDCE, signing certificate. Returns the FCP template.
pub const SIGN_CERT: &[u8] = &hex!("00A4020402DDCE");

/// SELECT the EstEID v3.0 applet ("EstEID ver 1.0" with an F0 prefix).
pub const AID30: &[u8] = &hex!("00A404000FF04573744549442076657220312E30");
/// SELECT the EstEID v3.4 applet.
pub const AID34: &[u8] = &hex!("00A404000FD23300000045737445494420763334");
/// SELECT the EstEID v3.5 applet.
pub const AID35: &[u8] = &hex!("00A404000FD23300000045737445494420763335");
/// SELECT the maintenance (updater) applet.
pub const UPDATER_AID: &[u8] = &hex!("00A404000AD2330000005550643101");

/// READ RECORD; P1 is patched with the record number.
pub const READ_RECORD: &[u8] = &hex!("00B2000400");
/// READ BINARY; P1/P2 are patched with the 16-bit file offset.
pub const READ_BINARY: &[u8] = &hex!("00B0000000");

/// VERIFY; P2 is patched with the PIN reference, Lc with the PIN length.
pub const VERIFY: &[u8] = &hex!("0020000000");
/// CHANGE REFERENCE DATA; patched like [`VERIFY`], data is old PIN + new PIN.
pub const CHANGE: &[u8] = &hex!("0024000000");
/// RESET RETRY COUNTER; patched like [`VERIFY`], data is PUK + new PIN.
pub const REPLACE: &[u8] = &hex!("002C000000");

/// MANAGE SECURITY ENVIRONMENT: restore security environment #1.
pub const SECENV1: &[u8] = &hex!("0022F301");
/// MANAGE SECURITY ENVIRONMENT: select the key reference for signing.
pub const KEY_REFERENCE: &[u8] = &hex!("002241B8028300");
/// PSO: COMPUTE DIGITAL SIGNATURE; Lc is patched with the payload length.
pub const COMPUTE_SIGNATURE: &[u8] = &hex!("0088000000");

/// GET DATA for the applet version bytes.
pub const APPLET_VERSION: &[u8] = &hex!("00CA010000");

/// DigestInfo prefixes prepended to a digest before an RSA card signature.
pub const SHA1_DIGEST_INFO: &[u8] = &hex!("3021300906052b0e03021a05000414");
pub const SHA224_DIGEST_INFO: &[u8] = &hex!("302d300d06096086480165030402040500041c");
pub const SHA256_DIGEST_INFO: &[u8] = &hex!("3031300d060960864801650304020105000420");
pub const SHA384_DIGEST_INFO: &[u8] = &hex!("3041300d060960864801650304020205000430");
pub const SHA512_DIGEST_INFO: &[u8] = &hex!("3051300d060960864801650304020305000440");

/// Known ATRs, uppercase hex, mapped to the card generation.
///
/// The v3.4 warm dev3 ATR is the same byte string as the v3.5 warm ATR;
/// later entries win the lookup, so such cards identify as v3.5 and the
/// applet probe during acquisition settles the rest.
pub const ATR_TABLE: &[(&str, CardVersion)] = &[
    ("3BFE9400FF80B1FA451F034573744549442076657220312E3043", CardVersion::Ver1_0), // v1 cold
    ("3B6E00FF4573744549442076657220312E30", CardVersion::Ver1_0),                 // v1 warm
    ("3BDE18FFC080B1FE451F034573744549442076657220312E302B", CardVersion::Ver1_0_2007), // 2007 cold
    ("3B5E11FF4573744549442076657220312E30", CardVersion::Ver1_0_2007),            // 2007 warm
    ("3B6E00004573744549442076657220312E30", CardVersion::Ver1_1),                 // v1.1 cold
    ("3BFE1800008031FE454573744549442076657220312E30A8", CardVersion::Ver3_4),     // v3 cold dev1
    ("3BFE1800008031FE45803180664090A4561B168301900086", CardVersion::Ver3_4),     // v3 warm dev1
    ("3BFE1800008031FE45803180664090A4162A0083019000E1", CardVersion::Ver3_4),     // v3 warm dev2
    ("3BFE1800008031FE45803180664090A4162A00830F9000EF", CardVersion::Ver3_4),     // v3 warm dev3
    ("3BF9180000C00A31FE4553462D3443432D303181", CardVersion::Ver3_5),             // v3.5 cold dev1
    ("3BF81300008131FE454A434F5076323431B7", CardVersion::Ver3_5),                 // v3.5 cold dev2
    ("3BFA1800008031FE45FE654944202F20504B4903", CardVersion::Ver3_5),             // v3.5 cold dev3
    ("3BFE1800008031FE45803180664090A4162A00830F9000EF", CardVersion::Ver3_5),     // v3.5 warm
    ("3BFE1800008031FE45803180664090A5102E03830F9000EF", CardVersion::Ver3_5),     // updater test cards
];

/// Looks up an ATR (uppercase hex string) in [`ATR_TABLE`].
///
/// Unknown ATRs yield [`CardVersion::Invalid`]; the caller must not guess.
pub fn atr_version(atr: &str) -> CardVersion {
    ATR_TABLE
        .iter()
        .rev()
        .find(|(known, _)| *known == atr)
        .map(|(_, version)| *version)
        .unwrap_or(CardVersion::Invalid)
}
