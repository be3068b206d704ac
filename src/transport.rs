// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Reader transport abstraction.
//!
//! The PC/SC (or other) reader stack lives behind these traits; this crate
//! only builds commands and interprets responses. A transport failure is a
//! [`TransportError`]; a card that answered with a non-success status word is
//! a successful transfer carrying that status word.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The reader stack failed to move bytes (card pulled, reader gone, ...).
    #[error("reader communication failed: {0}")]
    Transfer(String),
    /// The card answered, but with a layout this crate cannot make sense of.
    #[error("malformed response from card")]
    InvalidResponse,
    /// The card rejected a command this crate requires to succeed.
    #[error("card returned status 0x{0:04X}")]
    Status(u16),
}

/// Active transmission protocol of a connected card.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Protocol {
    #[default]
    T0,
    T1,
}

/// Response to a single command APDU.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CardResponse {
    /// Status word, first two trailer bytes as a big-endian value.
    pub sw: u16,
    pub data: Vec<u8>,
}

impl CardResponse {
    pub fn new(sw: u16, data: Vec<u8>) -> Self {
        Self { sw, data }
    }

    pub fn ok(&self) -> bool {
        self.sw == 0x9000
    }
}

pub type TransferResult = Result<CardResponse, TransportError>;

/// A connected reader holding an exclusive transaction on its card.
pub trait CardTransport: Send + Sync {
    /// Transmits a command APDU.
    fn transfer(&self, cmd: &[u8]) -> TransferResult;

    /// Pinpad variant: the reader collects the PIN itself and appends it.
    ///
    /// `verify` selects between the verify and modify control templates,
    /// `lang` is the prompt language LCID, `min_len` the minimum PIN length
    /// the pad accepts.
    fn transfer_ctl(&self, cmd: &[u8], verify: bool, lang: u16, min_len: u8) -> TransferResult;

    /// ATR of the card in this reader.
    fn atr(&self) -> Vec<u8>;

    fn is_pinpad(&self) -> bool;

    fn protocol(&self) -> Protocol;

    fn name(&self) -> String;
}

/// Enumerates readers and opens card transactions.
pub trait CardBackend: Send + Sync {
    /// Names of all attached readers.
    fn readers(&self) -> Vec<String>;

    /// ATR of the card in the named reader, `None` when no card is present.
    fn card_atr(&self, reader: &str) -> Option<Vec<u8>>;

    /// Connects to the named reader and begins an exclusive transaction.
    ///
    /// `Ok(None)` when the reader exists but holds no card.
    fn connect(&self, reader: &str) -> Result<Option<Arc<dyn CardTransport>>, TransportError>;
}
