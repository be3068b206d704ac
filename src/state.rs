// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! The card snapshot.
//!
//! Everything known about the currently selected card lives in one
//! [`CardData`] value. The monitor replaces the published snapshot wholesale
//! behind an `Arc`; nothing ever mutates a snapshot that readers can see.

use std::collections::BTreeMap;

use time::{Date, OffsetDateTime};

use crate::transport::Protocol;
use crate::types::{CardVersion, PersonalDataType, PinType};

/// A personal data field: free text, or a calendar date for the date kinds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PersonalDataValue {
    Text(String),
    Date(Date),
}

/// Immutable snapshot of the selected card.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CardData {
    /// Reader the selected card sits in.
    pub reader: String,
    /// Document number of the selected card, empty when none is selected.
    pub card: String,
    /// Document numbers of all discovered cards, sorted.
    pub cards: Vec<String>,
    /// Names of all attached readers.
    pub readers: Vec<String>,
    pub data: BTreeMap<PersonalDataType, PersonalDataValue>,
    /// Authentication certificate, raw DER. Empty until read.
    pub auth_cert: Vec<u8>,
    /// Signing certificate, raw DER. Empty until read.
    pub sign_cert: Vec<u8>,
    /// Remaining attempts per PIN; 0 means blocked.
    pub retry: BTreeMap<PinType, u8>,
    /// Signatures/authentications performed, per PIN.
    pub usage: BTreeMap<PinType, u32>,
    /// Dot-joined applet version, e.g. "3.5.8".
    pub applet_version: String,
    pub version: CardVersion,
    /// The maintenance applet is present on the card.
    pub has_updater: bool,
    /// The EstEID applet is not selectable; only the updater works.
    pub updater_only: bool,
    pub pinpad: bool,
    pub protocol: Protocol,
}

impl CardData {
    /// Snapshot published at startup, before the first monitor cycle.
    pub(crate) fn loading() -> Self {
        CardData {
            card: "loading".into(),
            cards: vec!["loading".into()],
            ..CardData::default()
        }
    }

    /// No personal data and no certificates read yet.
    pub fn is_null(&self) -> bool {
        self.data.is_empty() && self.auth_cert.is_empty() && self.sign_cert.is_empty()
    }

    /// The card's expiry date is today or later.
    pub fn is_valid(&self) -> bool {
        self.date(PersonalDataType::Expiry)
            .map_or(false, |expiry| expiry >= OffsetDateTime::now_utc().date())
    }

    pub fn text(&self, kind: PersonalDataType) -> Option<&str> {
        match self.data.get(&kind)? {
            PersonalDataValue::Text(text) => Some(text),
            PersonalDataValue::Date(_) => None,
        }
    }

    pub fn date(&self, kind: PersonalDataType) -> Option<Date> {
        match self.data.get(&kind)? {
            PersonalDataValue::Date(date) => Some(*date),
            PersonalDataValue::Text(_) => None,
        }
    }

    /// Remaining attempts; 0 when blocked or not yet read.
    pub fn retry_count(&self, pin: PinType) -> u8 {
        self.retry.get(&pin).copied().unwrap_or(0)
    }

    pub fn usage_count(&self, pin: PinType) -> u32 {
        self.usage.get(&pin).copied().unwrap_or(0)
    }

    /// Readers with their own pad display a prompt; some also shield entry.
    pub fn is_secure_pinpad(&self) -> bool {
        self.reader.to_ascii_uppercase().contains("EZIO SHIELD")
    }
}
