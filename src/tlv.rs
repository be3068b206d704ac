// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! File control information (FCI/FCP) parsing.
//!
//! EstEID file selection answers with simple TLV: one tag byte, one length
//! byte, value. Constructed tags are *entered* rather than skipped, so their
//! children land in the same map. Input is untrusted card data; truncated
//! values end the parse instead of panicking.

use std::collections::BTreeMap;

/// Tags whose value is a nested TLV sequence.
const CONSTRUCTED: [u8; 4] = [0x6F, 0x62, 0x64, 0xA1];

/// Certificate file length used when the FCP carries no tag `0x85`.
const DEFAULT_FILE_LENGTH: usize = 0x0600;

/// Parses an FCI byte string into a tag -> value map.
pub fn parse_fci(data: &[u8]) -> BTreeMap<u8, Vec<u8>> {
    let mut result = BTreeMap::new();
    let mut i = 0;
    while i + 2 <= data.len() {
        let tag = data[i];
        let len = data[i + 1] as usize;
        let end = (i + 2 + len).min(data.len());
        result.insert(tag, data[i + 2..end].to_vec());
        if CONSTRUCTED.contains(&tag) {
            // descend into the template
            i += 2;
        } else {
            if end < i + 2 + len {
                break; // truncated value
            }
            i = end;
        }
    }
    result
}

/// File length from tag `0x85` (two bytes, big-endian), with the EstEID
/// certificate-file default when absent or short.
pub fn file_length(fci: &BTreeMap<u8, Vec<u8>>) -> usize {
    match fci.get(&0x85) {
        Some(v) if v.len() >= 2 => usize::from(v[0]) << 8 | usize::from(v[1]),
        _ => DEFAULT_FILE_LENGTH,
    }
}
