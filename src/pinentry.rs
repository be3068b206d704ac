// Copyright (C) 2023 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! PIN entry collaborator.
//!
//! The UI (dialog, terminal prompt, agent) implements this trait; the
//! transaction engine drives it. For keyboard readers the collaborator hands
//! over the PIN bytes; for pinpad readers the PIN never transits the host and
//! the collaborator only frames the on-reader prompt and may cancel the wait.

use crate::types::PinType;

pub trait PinEntry: Send + Sync {
    /// Prompts for a PIN on the host. `None` cancels the operation.
    fn ask_pin(&self, pin: PinType) -> Option<Vec<u8>>;

    /// The reader is about to prompt on its own pad.
    fn pinpad_started(&self, _pin: PinType) {}

    /// The on-reader prompt finished (any outcome).
    fn pinpad_finished(&self) {}

    /// Polled while a pinpad transfer is in flight. Returning `true`
    /// abandons the wait: the worker's eventual result is discarded and the
    /// operation reports a cancel. The in-flight card command itself is not
    /// aborted.
    fn cancelled(&self) -> bool {
        false
    }
}
