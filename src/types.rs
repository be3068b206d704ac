// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Card-level enumerations shared across the crate.

use core::fmt;

/// PIN references on the card.
///
/// The discriminant doubles as the record number in the retry-counter file.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum PinType {
    Pin1 = 1,
    Pin2 = 2,
    Puk = 3,
}

impl PinType {
    pub const ALL: [PinType; 3] = [PinType::Pin1, PinType::Pin2, PinType::Puk];

    /// Minimum PIN length enforced by the card firmware. Not configurable.
    pub fn min_len(self) -> u8 {
        match self {
            PinType::Pin1 => 4,
            PinType::Pin2 => 5,
            PinType::Puk => 8,
        }
    }

    /// Record number in the retry-counter file.
    pub(crate) fn record(self) -> u8 {
        self as u8
    }

    /// Reference byte (P2) in VERIFY/CHANGE/REPLACE. The PUK is reference 0.
    pub(crate) fn reference(self) -> u8 {
        match self {
            PinType::Puk => 0,
            other => other as u8,
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PinType::Pin1 => "PIN1",
            PinType::Pin2 => "PIN2",
            PinType::Puk => "PUK",
        })
    }
}

/// Outcome classification of a PIN operation.
///
/// Derived from the response status word alone; this crate never surfaces a
/// PIN failure as a Rust error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorType {
    NoError,
    CancelError,
    BlockedError,
    ValidateError,
    DifferentError,
    LengthError,
    OldNewPinSameError,
    UnknownError,
}

impl ErrorType {
    /// Maps a response status word to an error classification.
    pub fn from_status_word(sw: u16) -> Self {
        match sw {
            0x9000 => ErrorType::NoError,
            0x63C0 => ErrorType::BlockedError, // retry count 0
            0x63C1 | 0x63C2 | 0x63C3 => ErrorType::ValidateError, // retries left
            0x6400 => ErrorType::CancelError,  // pinpad timeout
            0x6401 => ErrorType::CancelError,  // pinpad cancel
            0x6402 => ErrorType::DifferentError,
            0x6403 => ErrorType::LengthError,
            0x6983 => ErrorType::BlockedError,
            0x6985 | 0x6A80 => ErrorType::OldNewPinSameError,
            _ => ErrorType::UnknownError,
        }
    }
}

/// Card generation, determined from the ATR and the applet probe.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum CardVersion {
    Ver1_0,
    Ver1_0_2007,
    Ver1_1,
    Ver3_0,
    Ver3_4,
    Ver3_5,
    /// ATR not in the known table; the card is left alone.
    #[default]
    Invalid,
}

impl CardVersion {
    /// Generations above v1.1 carry a selectable applet worth probing.
    pub(crate) fn probes_applet(self) -> bool {
        matches!(
            self,
            CardVersion::Ver3_0 | CardVersion::Ver3_4 | CardVersion::Ver3_5
        )
    }
}

/// Personal data record kinds.
///
/// The discriminant + 1 is the record number in the personal data file for
/// all on-card kinds; `Email` is derived from the authentication certificate.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum PersonalDataType {
    Surname = 0,
    FirstName1,
    FirstName2,
    Sex,
    Citizen,
    BirthDate,
    Id,
    DocumentId,
    Expiry,
    BirthPlace,
    IssueDate,
    ResidencePermit,
    Comment1,
    Comment2,
    Comment3,
    Comment4,
    Email,
}

impl PersonalDataType {
    /// Record kinds read during acquisition, in record order.
    ///
    /// Matches the card layout up to `Comment3`; the last comment record
    /// holds no data on issued cards and is not read.
    pub(crate) const CARD_RECORDS: [PersonalDataType; 15] = [
        PersonalDataType::Surname,
        PersonalDataType::FirstName1,
        PersonalDataType::FirstName2,
        PersonalDataType::Sex,
        PersonalDataType::Citizen,
        PersonalDataType::BirthDate,
        PersonalDataType::Id,
        PersonalDataType::DocumentId,
        PersonalDataType::Expiry,
        PersonalDataType::BirthPlace,
        PersonalDataType::IssueDate,
        PersonalDataType::ResidencePermit,
        PersonalDataType::Comment1,
        PersonalDataType::Comment2,
        PersonalDataType::Comment3,
    ];

    pub(crate) fn record(self) -> u8 {
        self as u8 + 1
    }

    pub(crate) fn is_date(self) -> bool {
        matches!(
            self,
            PersonalDataType::BirthDate | PersonalDataType::Expiry | PersonalDataType::IssueDate
        )
    }
}

/// Prompt language passed to pinpad readers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Language {
    #[default]
    Unset,
    English,
    Estonian,
    Russian,
}

impl Language {
    /// Windows LCID as expected by CCID pinpad control transfers.
    pub(crate) fn code(self) -> u16 {
        match self {
            Language::Unset => 0x0000,
            Language::English => 0x0409,
            Language::Estonian => 0x0425,
            Language::Russian => 0x0419,
        }
    }
}
