// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Data acquisition pipeline.
//!
//! Runs against a freshly connected reader and fills a [`CardData`] value.
//! Any failure aborts the whole acquisition; the monitor keeps the previous
//! snapshot and retries on its next cycle. Nothing here is published
//! half-read.

use log::{debug, info, warn};
// `::` prefixed: the x509-parser prelude also exports a `time` module
use ::time::format_description::FormatItem;
use ::time::macros::format_description;
use ::time::{Date, Month};
use x509_parser::der_parser::oid;
use x509_parser::der_parser::oid::Oid;
use x509_parser::prelude::*;

use crate::constants::{
    atr_version, APPLET_VERSION, AUTH_CERT, ESTEID_DF, KEY_POINTER, KEY_USAGE, MASTER_FILE,
    PERSONAL_DATA, PIN_RETRY, READ_BINARY, READ_RECORD, SIGN_CERT, UPDATER_AID,
};
use crate::constants::{AID30, AID34, AID35};
use crate::state::{CardData, PersonalDataValue};
use crate::tlv;
use crate::transport::{CardResponse, CardTransport, Protocol, TransferResult, TransportError};
use crate::types::{CardVersion, PersonalDataType, PinType};

/// Personal data records carry dates as `31.12.2021`.
const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[day].[month].[year]");

const OID_SURNAME: Oid<'static> = oid!(2.5.4.4);
const OID_SERIAL_NUMBER: Oid<'static> = oid!(2.5.4.5);
const OID_GIVEN_NAME: Oid<'static> = oid!(2.5.4.42);

/// Certificate policy prefixes of the Digi-ID profile (live and test CA).
const DIGI_ID_POLICIES: [&str; 2] = ["1.3.6.1.4.1.10015.1.2", "1.3.6.1.4.1.10015.3.2"];

fn expect_ok(result: TransferResult) -> Result<CardResponse, TransportError> {
    let response = result?;
    if response.ok() {
        Ok(response)
    } else {
        Err(TransportError::Status(response.sw))
    }
}

fn selected(result: TransferResult) -> bool {
    matches!(result, Ok(response) if response.ok())
}

/// Reads everything the snapshot holds for the card in `reader`.
pub(crate) fn read_card(reader: &dyn CardTransport, t: &mut CardData) -> Result<(), TransportError> {
    t.reader = reader.name();
    t.pinpad = reader.is_pinpad();
    t.protocol = reader.protocol();
    t.version = atr_version(&hex::encode_upper(reader.atr()));
    identify_applet(reader, t);
    update_counters(reader, t)?;
    read_personal_data(reader, t)?;
    t.auth_cert = read_certificate(reader, AUTH_CERT, t.protocol)?;
    t.sign_cert = read_certificate(reader, SIGN_CERT, t.protocol)?;
    read_applet_version(reader, t);
    post_process(t);
    info!("card {} acquired ({:?})", t.card, t.version);
    Ok(())
}

/// Refines the ATR generation by probing applet AIDs (§ newer cards answer
/// to several) and detects the maintenance applet.
fn identify_applet(reader: &dyn CardTransport, t: &mut CardData) {
    if !t.version.probes_applet() {
        return;
    }
    if selected(reader.transfer(AID30)) {
        t.version = CardVersion::Ver3_0;
    } else if selected(reader.transfer(AID34)) {
        t.version = CardVersion::Ver3_4;
    } else if selected(reader.transfer(UPDATER_AID)) {
        t.has_updater = true;
        // prefer the EstEID applet whenever it is still usable
        if !selected(reader.transfer(AID35)) || !selected(reader.transfer(MASTER_FILE)) {
            let _ = reader.transfer(UPDATER_AID);
            t.updater_only = true;
        }
    }
}

/// Re-reads the PIN retry counters and the key usage counters.
///
/// Layout per EstEID: the retry byte sits at offset 5 of each retry record;
/// the key pointer record names the signing and authentication key slots by
/// two header bytes each; a usage record keeps a three-byte big-endian
/// countdown from 0xFFFFFF at offset 12.
pub(crate) fn update_counters(
    reader: &dyn CardTransport,
    t: &mut CardData,
) -> Result<(), TransportError> {
    expect_ok(reader.transfer(MASTER_FILE))?;
    expect_ok(reader.transfer(PIN_RETRY))?;

    let mut cmd = READ_RECORD.to_vec();
    for pin in PinType::ALL {
        cmd[2] = pin.record();
        let record = expect_ok(reader.transfer(&cmd))?;
        let count = *record
            .data
            .get(5)
            .ok_or(TransportError::InvalidResponse)?;
        t.retry.insert(pin, count);
    }

    expect_ok(reader.transfer(ESTEID_DF))?;
    expect_ok(reader.transfer(KEY_POINTER))?;
    cmd[2] = 1;
    let pointer = expect_ok(reader.transfer(&cmd))?.data;
    if pointer.len() < 0x15 {
        return Err(TransportError::InvalidResponse);
    }
    // SIGN1 0100 -> record 1, SIGN2 0200 -> record 2
    // AUTH1 1100 -> record 3, AUTH2 1200 -> record 4
    let sign_key = if pointer[0x13] == 0x01 && pointer[0x14] == 0x00 { 1 } else { 2 };
    let auth_key = if pointer[0x09] == 0x11 && pointer[0x0A] == 0x00 { 3 } else { 4 };

    expect_ok(reader.transfer(KEY_USAGE))?;
    for (pin, record) in [(PinType::Pin1, auth_key), (PinType::Pin2, sign_key)] {
        cmd[2] = record;
        let data = expect_ok(reader.transfer(&cmd))?.data;
        if data.len() < 15 {
            return Err(TransportError::InvalidResponse);
        }
        let counter =
            u32::from(data[12]) << 16 | u32::from(data[13]) << 8 | u32::from(data[14]);
        t.usage.insert(pin, 0xFF_FFFF - counter);
    }
    Ok(())
}

fn read_personal_data(reader: &dyn CardTransport, t: &mut CardData) -> Result<(), TransportError> {
    expect_ok(reader.transfer(PERSONAL_DATA))?;
    let mut cmd = READ_RECORD.to_vec();
    for kind in PersonalDataType::CARD_RECORDS {
        cmd[2] = kind.record();
        let record = expect_ok(reader.transfer(&cmd))?;
        let text = String::from_utf8_lossy(&record.data);
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if kind.is_date() {
            match Date::parse(text, DATE_FORMAT) {
                Ok(date) => {
                    t.data.insert(kind, PersonalDataValue::Date(date));
                }
                Err(_) => {
                    t.data.remove(&kind);
                }
            }
        } else {
            t.data.insert(kind, PersonalDataValue::Text(text.to_string()));
        }
    }
    Ok(())
}

/// Selects a certificate file and reassembles its content.
///
/// The select answers with an FCP whose tag `0x85` carries the total byte
/// count; the file is then pulled with successive READ BINARY commands until
/// that count is reached. A select rejection yields no certificate (older
/// cards without one); a failure mid-read aborts the acquisition.
fn read_certificate(
    reader: &dyn CardTransport,
    file: &[u8],
    protocol: Protocol,
) -> Result<Vec<u8>, TransportError> {
    let mut select = file.to_vec();
    if protocol == Protocol::T1 {
        select.push(0x00);
    }
    let response = reader.transfer(&select)?;
    if !response.ok() {
        debug!("certificate file not selectable: 0x{:04X}", response.sw);
        return Ok(Vec::new());
    }
    let size = tlv::file_length(&tlv::parse_fci(&response.data));

    let mut cert = Vec::with_capacity(size);
    while cert.len() < size {
        let mut cmd = READ_BINARY.to_vec();
        cmd[2] = (cert.len() >> 8) as u8;
        cmd[3] = cert.len() as u8;
        let chunk = expect_ok(reader.transfer(&cmd))?;
        if chunk.data.is_empty() {
            // a card that stops answering data would loop forever
            return Err(TransportError::InvalidResponse);
        }
        cert.extend_from_slice(&chunk.data);
    }
    Ok(cert)
}

fn read_applet_version(reader: &dyn CardTransport, t: &mut CardData) {
    match reader.transfer(APPLET_VERSION) {
        Ok(response) if response.ok() => {
            t.applet_version = response
                .data
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".");
        }
        Ok(response) => debug!("no applet version: 0x{:04X}", response.sw),
        Err(err) => warn!("applet version read failed: {err}"),
    }
}

/// Derives fields from the authentication certificate: the e-mail address
/// always, and for Digi-ID profile cards the holder data itself, which
/// overrides the on-card records.
fn post_process(t: &mut CardData) {
    let Ok((_, cert)) = X509Certificate::from_der(&t.auth_cert) else {
        return;
    };

    if let Some(email) = subject_email(&cert) {
        t.data
            .insert(PersonalDataType::Email, PersonalDataValue::Text(email));
    }

    if !is_digi_id(&cert) {
        return;
    }
    debug!("Digi-ID profile, holder data comes from the certificate subject");
    let subject = cert.subject();
    for (kind, oid) in [
        (PersonalDataType::Surname, &OID_SURNAME),
        (PersonalDataType::FirstName1, &OID_GIVEN_NAME),
        (PersonalDataType::Id, &OID_SERIAL_NUMBER),
    ] {
        if let Some(value) = subject_attr(subject, oid) {
            t.data.insert(kind, PersonalDataValue::Text(value));
        }
    }
    t.data.insert(
        PersonalDataType::FirstName2,
        PersonalDataValue::Text(String::new()),
    );
    if let Some(code) = subject_attr(subject, &OID_SERIAL_NUMBER) {
        match birth_date(&code) {
            Some(date) => {
                t.data
                    .insert(PersonalDataType::BirthDate, PersonalDataValue::Date(date));
            }
            None => {
                t.data.remove(&PersonalDataType::BirthDate);
            }
        }
    }
    let validity = cert.validity();
    t.data.insert(
        PersonalDataType::IssueDate,
        PersonalDataValue::Date(validity.not_before.to_datetime().date()),
    );
    t.data.insert(
        PersonalDataType::Expiry,
        PersonalDataValue::Date(validity.not_after.to_datetime().date()),
    );
}

fn subject_attr(name: &X509Name<'_>, oid: &Oid<'_>) -> Option<String> {
    name.iter_by_oid(oid)
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn subject_email(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::RFC822Name(email) => Some(email.to_string()),
        _ => None,
    })
}

fn is_digi_id(cert: &X509Certificate<'_>) -> bool {
    for ext in cert.extensions() {
        if let ParsedExtension::CertificatePolicies(policies) = ext.parsed_extension() {
            for policy in policies {
                let id = policy.policy_id.to_id_string();
                if DIGI_ID_POLICIES.iter().any(|known| id.starts_with(known)) {
                    return true;
                }
            }
        }
    }
    false
}

/// Birth date encoded in an Estonian personal identification code:
/// century+sex digit, then YYMMDD.
fn birth_date(code: &str) -> Option<Date> {
    if code.len() != 11 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let century = match &code[0..1] {
        "1" | "2" => 1800,
        "3" | "4" => 1900,
        "5" | "6" => 2000,
        "7" | "8" => 2100,
        _ => return None,
    };
    let year: i32 = code[1..3].parse().ok()?;
    let month: u8 = code[3..5].parse().ok()?;
    let day: u8 = code[5..7].parse().ok()?;
    Date::from_calendar_date(century + year, Month::try_from(month).ok()?, day).ok()
}
