// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Background card monitor.
//!
//! One long-lived loop: scan the readers, diff against the snapshot, acquire
//! a newly selected card, publish. The transaction lock is taken
//! non-blocking; a cycle that loses the race is simply skipped, it never
//! queues behind a foreground PIN operation.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::acquire;
use crate::constants::{
    atr_version, AID35, ESTEID_DF, MASTER_FILE, PERSONAL_DATA, READ_RECORD, UPDATER_AID,
};
use crate::state::CardData;
use crate::transport::{CardBackend, CardTransport, TransportError};
use crate::types::{CardVersion, PersonalDataType};
use crate::Inner;

/// Fixed delay between cycles; also the backoff after a failed scan.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn run<B: CardBackend>(inner: &Inner<B>) {
    while !inner.stop.load(Ordering::Relaxed) {
        poll_cycle(inner);
        let mut slept = Duration::ZERO;
        while slept < POLL_INTERVAL && !inner.stop.load(Ordering::Relaxed) {
            // sliced so stop() returns promptly
            thread::sleep(Duration::from_millis(100));
            slept += Duration::from_millis(100);
        }
    }
}

/// One monitor cycle. Returns whether a snapshot was published.
pub(crate) fn poll_cycle<B: CardBackend>(inner: &Inner<B>) -> bool {
    // never contend with a foreground PIN operation or a held session
    let Some(_guard) = inner.tx.try_lock() else {
        return false;
    };

    let readers = inner.backend.readers();
    let cards = match scan_readers(inner, &readers) {
        Ok(cards) => cards,
        Err(err) => {
            warn!("failed to poll cards, trying again next cycle: {err}");
            return false;
        }
    };

    let mut t = inner.snapshot();
    let order: Vec<String> = cards.keys().cloned().collect();
    let mut update = t.cards != order || t.readers != readers;
    let mut published = false;

    // selected card no longer in any slot
    if !t.card.is_empty() && !order.contains(&t.card) {
        update = true;
        t = CardData::default();
    }
    t.cards = order;
    t.readers = readers;

    // none selected: take the first discovered card
    if t.card.is_empty() && !t.cards.is_empty() {
        t.card = t.cards[0].clone();
        t.data.clear();
        t.applet_version.clear();
        t.auth_cert.clear();
        t.sign_cert.clear();
        update = true;
        published = true;
        inner.publish(t.clone());
    }

    // selected card present but not read yet
    if t.cards.contains(&t.card) && t.is_null() {
        update = true;
        if let Some(reader) = inner.connect(&cards[&t.card]) {
            if let Err(err) = acquire::read_card(&*reader, &mut t) {
                warn!("failed to read card info, trying again next cycle: {err}");
                update = false;
            }
        }
    }

    if update {
        inner.publish(t);
    }
    update || published
}

/// Probes every reader and collects document number -> reader name.
///
/// A rejected select skips that reader; a transport failure aborts the whole
/// scan so a half-seen reader list is never acted upon.
fn scan_readers<B: CardBackend>(
    inner: &Inner<B>,
    readers: &[String],
) -> Result<BTreeMap<String, String>, TransportError> {
    let mut cards = BTreeMap::new();
    for name in readers {
        let Some(atr) = inner.backend.card_atr(name) else {
            continue;
        };
        let atr = hex::encode_upper(atr);
        if atr_version(&atr) == CardVersion::Invalid {
            debug!("unknown ATR {atr}");
            continue;
        }
        debug!("connecting to reader {name}");
        let Some(reader) = inner.backend.connect(name)? else {
            continue;
        };

        if !try_select(&*reader, MASTER_FILE)? {
            // master file gone: is the card stuck in the updater applet?
            if !try_select(&*reader, UPDATER_AID)? {
                continue;
            }
            if !try_select(&*reader, MASTER_FILE)? {
                // updater found but unusable from here, select the applet back
                let _ = reader.transfer(AID35);
                continue;
            }
        }
        if !try_select(&*reader, ESTEID_DF)? {
            continue;
        }
        if !try_select(&*reader, PERSONAL_DATA)? {
            continue;
        }

        let mut cmd = READ_RECORD.to_vec();
        cmd[2] = PersonalDataType::DocumentId.record();
        let record = reader.transfer(&cmd)?;
        if !record.ok() {
            continue;
        }
        let id = String::from_utf8_lossy(&record.data);
        let id = id.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if !id.is_empty() {
            cards.insert(id.to_string(), name.clone());
        }
    }
    Ok(cards)
}

/// `Ok(true)` selected, `Ok(false)` rejected by the card, `Err` transport.
fn try_select(reader: &dyn CardTransport, cmd: &[u8]) -> Result<bool, TransportError> {
    Ok(reader.transfer(cmd)?.ok())
}
