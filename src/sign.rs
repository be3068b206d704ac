// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! The signing bridge.
//!
//! Adapts an authenticated card session into the sign callbacks a generic
//! cryptographic provider expects. The private key never leaves the card;
//! any transport or status failure yields an empty result, never an error.

use log::warn;

use crate::constants::{
    COMPUTE_SIGNATURE, KEY_REFERENCE, SECENV1, SHA1_DIGEST_INFO, SHA224_DIGEST_INFO,
    SHA256_DIGEST_INFO, SHA384_DIGEST_INFO, SHA512_DIGEST_INFO,
};
use crate::transport::{CardBackend, CardTransport};
use crate::CardSession;

/// Hash algorithm of a digest submitted for an RSA signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Fixed DigestInfo ASN.1 prefix for this algorithm.
    pub fn digest_info(self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha1 => SHA1_DIGEST_INFO,
            DigestAlgorithm::Sha224 => SHA224_DIGEST_INFO,
            DigestAlgorithm::Sha256 => SHA256_DIGEST_INFO,
            DigestAlgorithm::Sha384 => SHA384_DIGEST_INFO,
            DigestAlgorithm::Sha512 => SHA512_DIGEST_INFO,
        }
    }

    /// Digest length the prefix declares, in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }
}

/// An ECDSA signature as the two raw component byte strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcSignature {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

/// Private-key capability registered with a cryptographic provider.
///
/// Implemented by [`CardSession`]; the provider's RSA and EC sign callbacks
/// route here. Both require an authenticated session and perform no PIN
/// prompting themselves.
pub trait CardSigner {
    /// PKCS#1 v1.5 signature input: DigestInfo prefix + digest, signed on
    /// the card. `None` on any failure.
    fn sign_rsa(&mut self, alg: DigestAlgorithm, digest: &[u8]) -> Option<Vec<u8>>;

    /// ECDSA over the raw digest. The card answers `r || s`; the response is
    /// split exactly in half. `None` on any failure.
    fn sign_ec(&mut self, digest: &[u8]) -> Option<EcSignature>;
}

/// The one signing primitive: restore the security environment, select the
/// signing key reference, compute the signature over `data`.
pub(crate) fn sign_raw(reader: &dyn CardTransport, data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() > 0xFF {
        return None;
    }
    for setup in [SECENV1, KEY_REFERENCE] {
        match reader.transfer(setup) {
            Ok(response) if response.ok() => {}
            Ok(response) => {
                warn!("signature setup rejected: 0x{:04X}", response.sw);
                return None;
            }
            Err(err) => {
                warn!("signature setup failed: {err}");
                return None;
            }
        }
    }
    let mut cmd = COMPUTE_SIGNATURE.to_vec();
    cmd[4] = data.len() as u8;
    cmd.extend_from_slice(data);
    match reader.transfer(&cmd) {
        Ok(response) if response.ok() => Some(response.data),
        Ok(response) => {
            warn!("compute signature rejected: 0x{:04X}", response.sw);
            None
        }
        Err(err) => {
            warn!("compute signature failed: {err}");
            None
        }
    }
}

impl<B: CardBackend> CardSigner for CardSession<'_, B> {
    fn sign_rsa(&mut self, alg: DigestAlgorithm, digest: &[u8]) -> Option<Vec<u8>> {
        let mut data = alg.digest_info().to_vec();
        data.extend_from_slice(digest);
        sign_raw(&*self.reader, &data)
    }

    fn sign_ec(&mut self, digest: &[u8]) -> Option<EcSignature> {
        let raw = sign_raw(&*self.reader, digest)?;
        if raw.is_empty() {
            return None;
        }
        let half = raw.len() / 2;
        Some(EcSignature {
            r: raw[..half].to_vec(),
            s: raw[half..].to_vec(),
        })
    }
}
