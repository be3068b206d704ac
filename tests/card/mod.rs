// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! A simulated EstEID card and reader backend for the integration tests.
//!
//! The card keeps real file-selection state: a READ RECORD answers from
//! whichever file the last SELECT picked, PIN verifications decrement retry
//! counters, and every received command is logged for assertions.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hex_literal::hex;
use parking_lot::Mutex;

use esteid_client::{
    CardBackend, CardResponse, CardTransport, PinEntry, PinType, Protocol, TransferResult,
    TransportError,
};

/// v3.5 cold ATR (JavaCard dev2 profile).
pub const ATR_V35: &[u8] = &hex!("3BF81300008131FE454A434F5076323431B7");

/// Test persona PINs as issued with EstEID sample cards.
pub const PIN1: &[u8] = b"0090";
pub const PIN2: &[u8] = b"01497";
pub const PUK: &[u8] = b"17258403";

pub const DOCUMENT_ID: &str = "AA0448165";

pub const EMAIL: &str = "mari-liis.mannik@eesti.ee";

const RETRY_LIMIT: u8 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum File {
    None,
    MasterFile,
    EsteidDf,
    PersonalData,
    PinRetry,
    KeyPointer,
    KeyUsage,
    AuthCert,
    SignCert,
}

pub struct VirtCard {
    pub atr: Vec<u8>,
    pub protocol: Protocol,
    /// Personal data file records 1..=15, in record order.
    pub personal: [String; 15],
    pub auth_cert: Vec<u8>,
    pub sign_cert: Vec<u8>,
    pub applet_version: Vec<u8>,
    /// Keyed by PIN reference: 1 = PIN1, 2 = PIN2, 0 = PUK.
    pins: BTreeMap<u8, Vec<u8>>,
    retries: BTreeMap<u8, u8>,
    pub usage_auth: u32,
    pub usage_sign: u32,
    /// What the simulated pinpad "collects" for control transfers.
    pub pinpad_input: Vec<u8>,
    /// Sleep before answering a control transfer, to race cancellation.
    pub ctl_delay: Duration,
    /// Commands matching this prefix fail with a transport error.
    pub fail_prefix: Option<Vec<u8>>,
    /// The maintenance applet answers its AID.
    pub updater_present: bool,
    /// The EstEID applet is broken: the master file (and the applet AID)
    /// only answer after the updater applet has been selected.
    pub stuck: bool,
    /// Every command APDU received, in order.
    pub log: Vec<Vec<u8>>,
    selected: File,
    updater_selected: bool,
    secenv: bool,
    key_selected: bool,
    verified: bool,
}

impl VirtCard {
    /// A v3.5 card with the standard test persona.
    pub fn esteid() -> Self {
        VirtCard {
            atr: ATR_V35.to_vec(),
            protocol: Protocol::T0,
            personal: [
                "MÄNNIK".into(),
                "MARI-LIIS".into(),
                "".into(),
                "N".into(),
                "EST".into(),
                "01.09.1985".into(),
                "48509010147".into(),
                DOCUMENT_ID.into(),
                "01.09.2029".into(),
                "TALLINN".into(),
                "01.09.2019".into(),
                "".into(),
                "".into(),
                "".into(),
                "".into(),
            ],
            auth_cert: padded(auth_certificate(EMAIL), 1536),
            sign_cert: cert_bytes(0xD1, 1536),
            applet_version: vec![3, 5, 8],
            pins: BTreeMap::from([(1, PIN1.to_vec()), (2, PIN2.to_vec()), (0, PUK.to_vec())]),
            retries: BTreeMap::from([(1, RETRY_LIMIT), (2, RETRY_LIMIT), (0, RETRY_LIMIT)]),
            usage_auth: 5,
            usage_sign: 77,
            pinpad_input: Vec::new(),
            ctl_delay: Duration::ZERO,
            fail_prefix: None,
            updater_present: false,
            stuck: false,
            log: Vec::new(),
            selected: File::None,
            updater_selected: false,
            secenv: false,
            key_selected: false,
            verified: false,
        }
    }

    pub fn set_retries(&mut self, pin: PinType, count: u8) {
        self.retries.insert(reference(pin), count);
    }

    pub fn retries(&self, pin: PinType) -> u8 {
        self.retries[&reference(pin)]
    }

    /// Logged commands with the given INS byte.
    pub fn commands(&self, ins: u8) -> Vec<Vec<u8>> {
        self.log
            .iter()
            .filter(|cmd| cmd.len() > 1 && cmd[1] == ins)
            .cloned()
            .collect()
    }

    fn apdu(&mut self, cmd: &[u8]) -> CardResponse {
        self.log.push(cmd.to_vec());
        if cmd.len() < 4 {
            return sw(0x6700);
        }
        match cmd[1] {
            0xA4 => self.select(cmd),
            0xB2 => self.read_record(cmd),
            0xB0 => self.read_binary(cmd),
            0x20 => self.verify(cmd),
            0x24 => self.change(cmd),
            0x2C => self.replace(cmd),
            0x22 => {
                // MANAGE SECURITY ENVIRONMENT: restore, then key reference
                if cmd[2] == 0xF3 {
                    self.secenv = true;
                } else if self.secenv {
                    self.key_selected = true;
                } else {
                    return sw(0x6985);
                }
                sw(0x9000)
            }
            0x88 => self.compute_signature(cmd),
            0xCA => CardResponse::new(0x9000, self.applet_version.clone()),
            _ => sw(0x6D00),
        }
    }

    fn select(&mut self, cmd: &[u8]) -> CardResponse {
        let data = if cmd.len() > 5 {
            let lc = usize::from(cmd[4]);
            if cmd.len() < 5 + lc {
                return sw(0x6700);
            }
            &cmd[5..5 + lc]
        } else {
            &[]
        };
        match (cmd[2], data) {
            (0x00, _) => {
                if self.stuck && !self.updater_selected {
                    return sw(0x6A82);
                }
                self.selected = File::MasterFile;
                sw(0x9000)
            }
            (0x01, b"\xEE\xEE") => {
                self.selected = File::EsteidDf;
                sw(0x9000)
            }
            (0x02, b"\x50\x44") => {
                self.selected = File::PersonalData;
                sw(0x9000)
            }
            (0x02, b"\x00\x16") => {
                self.selected = File::PinRetry;
                sw(0x9000)
            }
            (0x02, b"\x00\x33") => {
                self.selected = File::KeyPointer;
                sw(0x9000)
            }
            (0x02, b"\x00\x13") => {
                self.selected = File::KeyUsage;
                sw(0x9000)
            }
            (0x02, b"\xAA\xCE") => {
                self.selected = File::AuthCert;
                fcp(self.auth_cert.len())
            }
            (0x02, b"\xDD\xCE") => {
                self.selected = File::SignCert;
                fcp(self.sign_cert.len())
            }
            // the v3.5 applet AID, unless the applet is broken
            (0x04, aid) if aid.ends_with(b"EstEID v35") => {
                if self.stuck {
                    sw(0x6A82)
                } else {
                    self.updater_selected = false;
                    sw(0x9000)
                }
            }
            (0x04, aid) if aid.ends_with(b"UPd1\x01") => {
                if self.updater_present {
                    self.updater_selected = true;
                    sw(0x9000)
                } else {
                    sw(0x6A82)
                }
            }
            (0x04, _) => sw(0x6A82),
            _ => sw(0x6A82),
        }
    }

    fn read_record(&mut self, cmd: &[u8]) -> CardResponse {
        let record = cmd[2];
        match self.selected {
            File::PersonalData => match record
                .checked_sub(1)
                .and_then(|i| self.personal.get(usize::from(i)))
            {
                Some(text) => CardResponse::new(0x9000, text.as_bytes().to_vec()),
                None => sw(0x6A83),
            },
            File::PinRetry => {
                // records 1..=3: PIN1, PIN2, PUK; the counter is byte 5
                let reference = match record {
                    1 => 1,
                    2 => 2,
                    3 => 0,
                    _ => return sw(0x6A83),
                };
                let mut data = vec![0x80, 0x01, 0x00, 0x00, 0x00, self.retries[&reference]];
                data.extend_from_slice(&[0x90, 0x00]);
                CardResponse::new(0x9000, data)
            }
            File::KeyPointer => {
                // SIGN key in slot 1, AUTH key in slot 3
                let mut data = vec![0u8; 0x15];
                data[0x09] = 0x11;
                data[0x0A] = 0x00;
                data[0x13] = 0x01;
                data[0x14] = 0x00;
                CardResponse::new(0x9000, data)
            }
            File::KeyUsage => {
                let usage = match record {
                    1 => self.usage_sign,
                    3 => self.usage_auth,
                    2 | 4 => 0,
                    _ => return sw(0x6A83),
                };
                let counter = 0xFF_FFFF - usage;
                let mut data = vec![0u8; 15];
                data[12] = (counter >> 16) as u8;
                data[13] = (counter >> 8) as u8;
                data[14] = counter as u8;
                CardResponse::new(0x9000, data)
            }
            _ => sw(0x6986),
        }
    }

    fn read_binary(&mut self, cmd: &[u8]) -> CardResponse {
        let file = match self.selected {
            File::AuthCert => &self.auth_cert,
            File::SignCert => &self.sign_cert,
            _ => return sw(0x6986),
        };
        let offset = usize::from(cmd[2]) << 8 | usize::from(cmd[3]);
        if offset >= file.len() {
            return sw(0x6B00);
        }
        let end = (offset + 256).min(file.len());
        CardResponse::new(0x9000, file[offset..end].to_vec())
    }

    fn verify(&mut self, cmd: &[u8]) -> CardResponse {
        let reference = cmd[3];
        let Some(expected) = self.pins.get(&reference).cloned() else {
            return sw(0x6A88);
        };
        if self.retries[&reference] == 0 {
            return sw(0x6983);
        }
        if &cmd[5..] == expected.as_slice() {
            self.retries.insert(reference, RETRY_LIMIT);
            if reference != 0 {
                self.verified = true;
            }
            sw(0x9000)
        } else {
            let left = self.retries[&reference] - 1;
            self.retries.insert(reference, left);
            sw(0x63C0 | u16::from(left))
        }
    }

    fn change(&mut self, cmd: &[u8]) -> CardResponse {
        let reference = cmd[3];
        let Some(current) = self.pins.get(&reference).cloned() else {
            return sw(0x6A88);
        };
        if self.retries[&reference] == 0 {
            return sw(0x6983);
        }
        let data = &cmd[5..];
        if data.len() < current.len() || &data[..current.len()] != current.as_slice() {
            let left = self.retries[&reference] - 1;
            self.retries.insert(reference, left);
            return sw(0x63C0 | u16::from(left));
        }
        let new = &data[current.len()..];
        if new.len() < usize::from(min_len(reference)) {
            return sw(0x6403);
        }
        if new == current.as_slice() {
            return sw(0x6985);
        }
        self.pins.insert(reference, new.to_vec());
        self.retries.insert(reference, RETRY_LIMIT);
        sw(0x9000)
    }

    fn replace(&mut self, cmd: &[u8]) -> CardResponse {
        let reference = cmd[3];
        if !self.pins.contains_key(&reference) || reference == 0 {
            return sw(0x6A88);
        }
        // the firmware only resets a blocked PIN
        if self.retries[&reference] != 0 {
            return sw(0x6985);
        }
        let puk = self.pins[&0].clone();
        let data = &cmd[5..];
        if data.len() < puk.len() || &data[..puk.len()] != puk.as_slice() {
            let left = self.retries[&0].saturating_sub(1);
            self.retries.insert(0, left);
            return sw(0x63C0 | u16::from(left));
        }
        let new = &data[puk.len()..];
        if new.len() < usize::from(min_len(reference)) {
            return sw(0x6403);
        }
        self.pins.insert(reference, new.to_vec());
        self.retries.insert(reference, RETRY_LIMIT);
        sw(0x9000)
    }

    /// Deterministic stand-in signature: the input reversed.
    fn compute_signature(&mut self, cmd: &[u8]) -> CardResponse {
        if !(self.verified && self.secenv && self.key_selected) {
            return sw(0x6982);
        }
        self.secenv = false;
        self.key_selected = false;
        self.usage_sign += 1;
        let mut signature = cmd[5..].to_vec();
        signature.reverse();
        CardResponse::new(0x9000, signature)
    }
}

fn sw(sw: u16) -> CardResponse {
    CardResponse::new(sw, Vec::new())
}

/// FCP template carrying the file length under tag 0x85.
fn fcp(len: usize) -> CardResponse {
    let len = len as u16;
    CardResponse::new(
        0x9000,
        vec![0x6F, 0x04, 0x85, 0x02, (len >> 8) as u8, len as u8],
    )
}

fn cert_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed ^ (i as u8)).collect()
}

/// Pads a file image to the length its FCP will advertise.
pub fn padded(mut file: Vec<u8>, len: usize) -> Vec<u8> {
    file.resize(len, 0);
    file
}

// --- just enough DER to build parseable certificate fixtures ---

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    match content.len() {
        len @ 0..=0x7F => out.push(len as u8),
        len @ 0x80..=0xFF => out.extend([0x81, len as u8]),
        len => out.extend([0x82, (len >> 8) as u8, len as u8]),
    }
    out.extend_from_slice(content);
    out
}

fn der_seq(parts: &[Vec<u8>]) -> Vec<u8> {
    der(0x30, &parts.concat())
}

fn der_oid(body: &[u8]) -> Vec<u8> {
    der(0x06, body)
}

fn der_utf8(text: &str) -> Vec<u8> {
    der(0x0C, text.as_bytes())
}

/// One relative distinguished name: SET { SEQUENCE { oid, UTF8String } }.
fn rdn(oid: &[u8], value: &str) -> Vec<u8> {
    der(0x31, &der_seq(&[der_oid(oid), der_utf8(value)]))
}

/// A syntactically valid, unsigned certificate: fixed issuer and key, an
/// rfc822 subject-alternative-name, and optionally one certificate policy.
fn certificate(
    subject: Vec<u8>,
    not_before: &str,
    not_after: &str,
    email: &str,
    policy: Option<&[u8]>,
) -> Vec<u8> {
    let signature_algorithm = der_seq(&[
        der_oid(&hex!("2A864886F70D01010B")), // sha256WithRSAEncryption
        der(0x05, &[]),
    ]);
    let issuer = der(0x30, &rdn(&hex!("550403"), "TEST of ESTEID-SK 2015"));
    let validity = der_seq(&[
        der(0x17, not_before.as_bytes()),
        der(0x17, not_after.as_bytes()),
    ]);
    let key = der_seq(&[
        der_seq(&[der_oid(&hex!("2A864886F70D010101")), der(0x05, &[])]),
        der(0x03, &hex!("003006020101020103")),
    ]);
    let mut extensions = vec![der_seq(&[
        der_oid(&hex!("551D11")), // subjectAltName
        der(0x04, &der_seq(&[der(0x81, email.as_bytes())])),
    ])];
    if let Some(policy) = policy {
        extensions.push(der_seq(&[
            der_oid(&hex!("551D20")), // certificatePolicies
            der(0x04, &der_seq(&[der_seq(&[der_oid(policy)])])),
        ]));
    }
    let tbs = der_seq(&[
        der(0xA0, &der(0x02, &[0x02])), // v3
        der(0x02, &[0x01]),
        signature_algorithm.clone(),
        issuer,
        validity,
        subject,
        key,
        der(0xA3, &der(0x30, &extensions.concat())),
    ]);
    der_seq(&[tbs, signature_algorithm, der(0x03, &hex!("00D5E1"))])
}

/// The default authentication certificate: plain profile, SAN e-mail only.
pub fn auth_certificate(email: &str) -> Vec<u8> {
    let subject = der(0x30, &rdn(&hex!("550403"), "MÄNNIK,MARI-LIIS,48509010147"));
    certificate(subject, "190901000000Z", "290901000000Z", email, None)
}

/// A Digi-ID profile certificate: holder data in the subject, policy under
/// the Digi-ID prefix, validity distinct from the on-card records.
pub fn digi_id_certificate(surname: &str, given_name: &str, serial: &str) -> Vec<u8> {
    let subject = der(
        0x30,
        &[
            rdn(&hex!("550404"), surname),    // surname
            rdn(&hex!("55042A"), given_name), // givenName
            rdn(&hex!("550405"), serial),     // serialNumber
        ]
        .concat(),
    );
    certificate(
        subject,
        "200315000000Z",
        "250314000000Z",
        EMAIL,
        Some(&hex!("2B06010401CE1F010201")), // 1.3.6.1.4.1.10015.1.2.1
    )
}

fn reference(pin: PinType) -> u8 {
    match pin {
        PinType::Pin1 => 1,
        PinType::Pin2 => 2,
        PinType::Puk => 0,
    }
}

fn min_len(reference: u8) -> u8 {
    match reference {
        1 => 4,
        2 => 5,
        _ => 8,
    }
}

struct VirtTransport {
    name: String,
    pinpad: bool,
    card: Arc<Mutex<VirtCard>>,
}

impl CardTransport for VirtTransport {
    fn transfer(&self, cmd: &[u8]) -> TransferResult {
        let mut card = self.card.lock();
        if let Some(prefix) = &card.fail_prefix {
            if cmd.starts_with(prefix) {
                card.log.push(cmd.to_vec());
                return Err(TransportError::Transfer("injected failure".into()));
            }
        }
        Ok(card.apdu(cmd))
    }

    fn transfer_ctl(&self, cmd: &[u8], _verify: bool, _lang: u16, _min_len: u8) -> TransferResult {
        let (delay, input) = {
            let card = self.card.lock();
            (card.ctl_delay, card.pinpad_input.clone())
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut full = cmd.to_vec();
        full[4] = input.len() as u8;
        full.extend_from_slice(&input);
        Ok(self.card.lock().apdu(&full))
    }

    fn atr(&self) -> Vec<u8> {
        self.card.lock().atr.clone()
    }

    fn is_pinpad(&self) -> bool {
        self.pinpad
    }

    fn protocol(&self) -> Protocol {
        self.card.lock().protocol
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

struct Slot {
    name: String,
    pinpad: bool,
    card: Option<Arc<Mutex<VirtCard>>>,
}

/// Reader backend over simulated cards. Clones share the same reader slots.
#[derive(Clone, Default)]
pub struct VirtBackend {
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl VirtBackend {
    pub fn insert(&self, reader: &str, pinpad: bool, card: VirtCard) -> Arc<Mutex<VirtCard>> {
        let card = Arc::new(Mutex::new(card));
        self.slots.lock().push(Slot {
            name: reader.to_string(),
            pinpad,
            card: Some(card.clone()),
        });
        card
    }

    pub fn empty_reader(&self, reader: &str) {
        self.slots.lock().push(Slot {
            name: reader.to_string(),
            pinpad: false,
            card: None,
        });
    }

    pub fn remove_card(&self, reader: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|slot| slot.name == reader) {
            slot.card = None;
        }
    }
}

impl CardBackend for VirtBackend {
    fn readers(&self) -> Vec<String> {
        self.slots.lock().iter().map(|slot| slot.name.clone()).collect()
    }

    fn card_atr(&self, reader: &str) -> Option<Vec<u8>> {
        let slots = self.slots.lock();
        let slot = slots.iter().find(|slot| slot.name == reader)?;
        let atr = slot.card.as_ref()?.lock().atr.clone();
        Some(atr)
    }

    fn connect(&self, reader: &str) -> Result<Option<Arc<dyn CardTransport>>, TransportError> {
        let slots = self.slots.lock();
        let Some(slot) = slots.iter().find(|slot| slot.name == reader) else {
            return Err(TransportError::Transfer(format!("no reader {reader}")));
        };
        Ok(slot.card.as_ref().map(|card| {
            Arc::new(VirtTransport {
                name: slot.name.clone(),
                pinpad: slot.pinpad,
                card: card.clone(),
            }) as Arc<dyn CardTransport>
        }))
    }
}

/// One reader, one acquired v3.5 test card.
pub fn esteid() -> (
    esteid_client::SmartCard<VirtBackend>,
    VirtBackend,
    Arc<Mutex<VirtCard>>,
) {
    let backend = VirtBackend::default();
    let card = backend.insert("Virt Reader 00", false, VirtCard::esteid());
    let smart_card = esteid_client::SmartCard::new(backend.clone());
    assert!(smart_card.poll_once());
    (smart_card, backend, card)
}

/// Keyboard PIN entry answering with a fixed value; `None` cancels.
pub struct StaticPin(pub Option<Vec<u8>>);

impl StaticPin {
    pub fn new(pin: &[u8]) -> Self {
        StaticPin(Some(pin.to_vec()))
    }
}

impl PinEntry for StaticPin {
    fn ask_pin(&self, _pin: PinType) -> Option<Vec<u8>> {
        self.0.clone()
    }
}

/// Pinpad-side entry: the host must never be asked for the PIN.
#[derive(Default)]
pub struct PadEntry {
    pub started: AtomicBool,
    pub finished: AtomicBool,
    pub cancel: AtomicBool,
}

impl PinEntry for PadEntry {
    fn ask_pin(&self, pin: PinType) -> Option<Vec<u8>> {
        panic!("host prompt for {pin} on a pinpad reader");
    }

    fn pinpad_started(&self, _pin: PinType) {
        self.started.store(true, Ordering::Relaxed);
    }

    fn pinpad_finished(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
