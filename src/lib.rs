// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Host-side driver for the Estonian EstEID identity card.
//!
//! [`SmartCard`] discovers cards over a [`CardBackend`], keeps an immutable
//! [`CardData`] snapshot up to date from a background monitor, runs PIN
//! verification/change/unblock transactions, and exposes the card's private
//! keys as a signing oracle through [`CardSigner`].
//!
//! Concurrency model: one mutual-exclusion lock protects all card transport
//! activity. The monitor takes it non-blocking once per cycle; PIN
//! operations take it for the duration of the call; a successful login
//! returns a [`CardSession`] that *keeps* the lock until it is logged out or
//! dropped, reserving the reader for the authenticated session.

pub mod constants;
mod acquire;
mod monitor;
pub mod pinentry;
pub mod sign;
pub mod state;
pub mod tlv;
pub mod transport;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use constants::{CHANGE, REPLACE, VERIFY};

pub use pinentry::PinEntry;
pub use sign::{CardSigner, DigestAlgorithm, EcSignature};
pub use state::{CardData, PersonalDataValue};
pub use transport::{
    CardBackend, CardResponse, CardTransport, Protocol, TransferResult, TransportError,
};
pub use types::{CardVersion, ErrorType, Language, PersonalDataType, PinType};

type Observer = Box<dyn Fn(&Arc<CardData>) + Send + Sync>;

/// Shared state behind the [`SmartCard`] handle.
pub(crate) struct Inner<B: CardBackend> {
    pub(crate) backend: B,
    /// The single card transaction lock, also serializing snapshot writes.
    pub(crate) tx: Mutex<()>,
    snapshot: RwLock<Arc<CardData>>,
    pub(crate) stop: AtomicBool,
    language: RwLock<Language>,
    observers: RwLock<Vec<Observer>>,
}

impl<B: CardBackend> Inner<B> {
    /// Mutable working copy of the published snapshot.
    pub(crate) fn snapshot(&self) -> CardData {
        (**self.snapshot.read()).clone()
    }

    /// Atomically replaces the published snapshot and notifies observers.
    pub(crate) fn publish(&self, t: CardData) {
        let t = Arc::new(t);
        *self.snapshot.write() = t.clone();
        for observer in self.observers.read().iter() {
            observer(&t);
        }
    }

    /// Connects and begins a transaction; any failure is `None`.
    pub(crate) fn connect(&self, reader: &str) -> Option<Arc<dyn CardTransport>> {
        match self.backend.connect(reader) {
            Ok(Some(transport)) => Some(transport),
            Ok(None) => None,
            Err(err) => {
                warn!("connecting to reader {reader} failed: {err}");
                None
            }
        }
    }

    /// Classifies a PIN operation outcome and keeps the counters honest:
    /// every non-success (or forced) outcome re-reads them before returning.
    fn handle_pin_result(
        &self,
        reader: &dyn CardTransport,
        result: TransferResult,
        force_update: bool,
    ) -> ErrorType {
        let error = match &result {
            Ok(response) => ErrorType::from_status_word(response.sw),
            Err(err) => {
                warn!("PIN transfer failed: {err}");
                ErrorType::UnknownError
            }
        };
        if force_update || error != ErrorType::NoError {
            self.refresh_counters(reader);
        }
        error
    }

    fn refresh_counters(&self, reader: &dyn CardTransport) {
        let mut t = self.snapshot();
        match acquire::update_counters(reader, &mut t) {
            Ok(()) => self.publish(t),
            Err(err) => warn!("counter refresh failed: {err}"),
        }
    }

    fn language(&self) -> u16 {
        self.language.read().code()
    }
}

/// The EstEID card manager.
pub struct SmartCard<B: CardBackend> {
    inner: Arc<Inner<B>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CardBackend + 'static> SmartCard<B> {
    /// Starts the background monitor thread. Idempotent.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        self.inner.stop.store(false, Ordering::Relaxed);
        let inner = self.inner.clone();
        *monitor = Some(thread::spawn(move || monitor::run(&inner)));
    }
}

impl<B: CardBackend> SmartCard<B> {
    pub fn new(backend: B) -> Self {
        let mut initial = CardData::loading();
        initial.readers = backend.readers();
        SmartCard {
            inner: Arc::new(Inner {
                backend,
                tx: Mutex::new(()),
                snapshot: RwLock::new(Arc::new(initial)),
                stop: AtomicBool::new(false),
                language: RwLock::new(Language::default()),
                observers: RwLock::new(Vec::new()),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Requests interruption and joins the monitor thread.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }

    /// The current snapshot. Always complete and internally consistent.
    pub fn data(&self) -> Arc<CardData> {
        self.inner.snapshot.read().clone()
    }

    /// Registers a callback invoked on every snapshot publication.
    pub fn on_data_changed(&self, observer: impl Fn(&Arc<CardData>) + Send + Sync + 'static) {
        self.inner.observers.write().push(Box::new(observer));
    }

    /// Prompt language for pinpad readers.
    pub fn set_language(&self, language: Language) {
        *self.inner.language.write() = language;
    }

    /// Runs a single monitor cycle on the calling thread; returns whether a
    /// snapshot was published. Skipped (returning `false`) while another
    /// operation holds the card.
    pub fn poll_once(&self) -> bool {
        monitor::poll_cycle(&self.inner)
    }

    /// Selects a card by document number; its data is re-read by the next
    /// monitor cycle.
    pub fn select_card(&self, card: &str) {
        let _guard = self.inner.tx.lock();
        let mut t = self.inner.snapshot();
        t.card = card.to_string();
        t.data.clear();
        t.applet_version.clear();
        t.auth_cert.clear();
        t.sign_cert.clear();
        self.inner.publish(t);
    }

    /// Forces a re-read of the selected card.
    pub fn reload(&self) {
        let card = self.data().card.clone();
        self.select_card(&card);
    }

    /// Verifies PIN1 or PIN2 and reserves the reader for the caller.
    ///
    /// On success the transaction lock stays held inside the returned
    /// [`CardSession`]; the monitor and all other PIN operations wait until
    /// it is logged out or dropped. The PUK cannot log in.
    pub fn login(&self, pin: PinType, entry: &dyn PinEntry) -> Result<CardSession<'_, B>, ErrorType> {
        if pin == PinType::Puk {
            return Err(ErrorType::UnknownError);
        }
        let t = self.data();
        let secret = if t.pinpad {
            Vec::new()
        } else {
            entry.ask_pin(pin).ok_or(ErrorType::CancelError)?
        };

        let guard = self.inner.tx.lock();
        let Some(reader) = self.inner.connect(&t.reader) else {
            return Err(ErrorType::UnknownError);
        };

        let mut cmd = VERIFY.to_vec();
        cmd[3] = pin.reference();
        cmd[4] = secret.len() as u8;
        let result = if t.pinpad {
            entry.pinpad_started(pin);
            let worker = reader.clone();
            let (lang, min_len) = (self.inner.language(), pin.min_len());
            let ctl = cmd.clone();
            let (sender, receiver) = mpsc::channel();
            thread::spawn(move || {
                let _ = sender.send(worker.transfer_ctl(&ctl, true, lang, min_len));
            });
            // cooperative wait: resolve on the worker's result or on cancel
            let result = loop {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(result) => break Some(result),
                    Err(mpsc::RecvTimeoutError::Timeout) if entry.cancelled() => break None,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        break Some(Err(TransportError::Transfer("pinpad worker gone".into())))
                    }
                }
            };
            entry.pinpad_finished();
            match result {
                Some(result) => result,
                None => {
                    // the worker's late result is discarded, not aborted
                    self.inner.refresh_counters(&*reader);
                    return Err(ErrorType::CancelError);
                }
            }
        } else {
            cmd.extend_from_slice(&secret);
            reader.transfer(&cmd)
        };

        if let Ok(response) = &result {
            if response.ok() {
                info!("{pin} verified");
                return Ok(CardSession {
                    inner: &*self.inner,
                    reader,
                    _guard: guard,
                });
            }
        }
        Err(self.inner.handle_pin_result(&*reader, result, false))
    }

    /// Changes a PIN or the PUK. Counters are re-read regardless of outcome.
    ///
    /// On pinpad readers both values are collected on the pad and the
    /// arguments are ignored.
    pub fn change(&self, pin: PinType, old: &[u8], new: &[u8]) -> ErrorType {
        let _guard = self.inner.tx.lock();
        let t = self.data();
        let Some(reader) = self.inner.connect(&t.reader) else {
            return ErrorType::UnknownError;
        };
        let mut cmd = CHANGE.to_vec();
        cmd[3] = pin.reference();
        cmd[4] = (old.len() + new.len()) as u8;
        let result = if t.pinpad {
            reader.transfer_ctl(&cmd, false, self.inner.language(), pin.min_len())
        } else {
            cmd.extend_from_slice(old);
            cmd.extend_from_slice(new);
            reader.transfer(&cmd)
        };
        self.inner.handle_pin_result(&*reader, result, true)
    }

    /// Unblocks a PIN with the PUK and sets `new_pin` in its place.
    ///
    /// The card firmware only replaces a *blocked* PIN, so when retries
    /// remain this deliberately burns them with wrong verifications first.
    /// A PIN that is already blocked skips that step.
    pub fn unblock(&self, pin: PinType, puk: &[u8], new_pin: &[u8]) -> ErrorType {
        let _guard = self.inner.tx.lock();
        let t = self.data();
        let Some(reader) = self.inner.connect(&t.reader) else {
            return ErrorType::UnknownError;
        };

        let mut cmd = VERIFY.to_vec();
        if !t.pinpad {
            // pinpad readers verify the PUK inline during the replace step
            cmd[3] = PinType::Puk.reference();
            cmd[4] = puk.len() as u8;
            let mut verify = cmd.clone();
            verify.extend_from_slice(puk);
            let result = reader.transfer(&verify);
            if !matches!(&result, Ok(response) if response.ok()) {
                return self.inner.handle_pin_result(&*reader, result, false);
            }
        }

        let retries = t.retry_count(pin);
        if retries > 0 {
            cmd[3] = pin.reference();
            cmd[4] = (new_pin.len() + 1) as u8;
            for attempt in 0..=retries {
                let mut wrong = cmd.clone();
                wrong.extend(std::iter::repeat(b'0').take(new_pin.len()));
                wrong.extend_from_slice(attempt.to_string().as_bytes());
                let _ = reader.transfer(&wrong);
            }
        }

        let mut cmd = REPLACE.to_vec();
        cmd[3] = pin.reference();
        cmd[4] = (puk.len() + new_pin.len()) as u8;
        let result = if t.pinpad {
            reader.transfer_ctl(&cmd, false, self.inner.language(), pin.min_len())
        } else {
            cmd.extend_from_slice(puk);
            cmd.extend_from_slice(new_pin);
            reader.transfer(&cmd)
        };
        self.inner.handle_pin_result(&*reader, result, true)
    }
}

impl<B: CardBackend> Drop for SmartCard<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An authenticated session holding the reader and the transaction lock.
///
/// Returned by a successful [`SmartCard::login`]. The reader stays reserved
/// until the session is released; release happens exactly once, on
/// [`logout`](CardSession::logout) or on drop, and re-reads the counters
/// first. There is no logout without a session.
pub struct CardSession<'a, B: CardBackend> {
    inner: &'a Inner<B>,
    pub(crate) reader: Arc<dyn CardTransport>,
    _guard: MutexGuard<'a, ()>,
}

impl<B: CardBackend> CardSession<'_, B> {
    /// Releases the reader and the transaction lock. Equivalent to dropping
    /// the session; spelled out for call sites that want to be explicit.
    pub fn logout(self) {}
}

impl<B: CardBackend> Drop for CardSession<'_, B> {
    fn drop(&mut self) {
        self.inner.refresh_counters(&*self.reader);
        // the lock guard drops after this, releasing the card
    }
}
