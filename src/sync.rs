// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Correlation between issued controller commands and their completion
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time;

use crate::nfcc::Status;

/// Operation categories with a dedicated completion slot. The controller
/// delivers completion events in command order within a category, so one
/// outstanding operation per category is sufficient for correlation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SlotKey {
    EeRegister,
    /// First EE topology report after registration.
    EeInfo,
    AidChange,
    /// System-code and default-protocol routing commands.
    Routing,
    Commit,
    ModeSet,
    PwrAndLinkCtrl,
    CeRegister,
}

const ALL_KEYS: [SlotKey; 8] = [
    SlotKey::EeRegister,
    SlotKey::EeInfo,
    SlotKey::AidChange,
    SlotKey::Routing,
    SlotKey::Commit,
    SlotKey::ModeSet,
    SlotKey::PwrAndLinkCtrl,
    SlotKey::CeRegister,
];

/// One-shot completion slots, one per operation category.
///
/// A caller reserves its category before issuing the command. Reservations
/// of the same category queue behind each other, so two concurrent callers
/// can never observe each other's completion.
pub(crate) struct CompletionSlots {
    pending: Mutex<HashMap<SlotKey, oneshot::Sender<Status>>>,
    gates: HashMap<SlotKey, Arc<AsyncMutex<()>>>,
}

impl CompletionSlots {
    pub fn new() -> CompletionSlots {
        CompletionSlots {
            pending: Mutex::new(HashMap::new()),
            gates: ALL_KEYS
                .iter()
                .map(|key| (*key, Arc::new(AsyncMutex::new(()))))
                .collect(),
        }
    }

    /// Reserve `key` and arm its completion channel. Waits for any
    /// in-flight operation of the same category to finish first.
    pub async fn reserve(&self, key: SlotKey) -> SlotReservation<'_> {
        let gate = Arc::clone(&self.gates[&key]).lock_owned().await;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(key, tx);
        SlotReservation {
            slots: self,
            key,
            rx: Some(rx),
            _gate: gate,
        }
    }

    /// Resolve the pending operation of a category, if any. Returns
    /// whether a waiter was actually signalled.
    pub fn resolve(&self, key: SlotKey, status: Status) -> bool {
        match self.pending.lock().unwrap().remove(&key) {
            Some(tx) => tx.send(status).is_ok(),
            None => false,
        }
    }

    /// Fail every pending operation. Used during shutdown to release
    /// blocked callers.
    pub fn release_all(&self, status: Status) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            let _ = tx.send(status);
        }
    }
}

/// An armed completion slot. Dropping the reservation without waiting
/// disarms the slot (used when command issuance itself fails).
pub(crate) struct SlotReservation<'a> {
    slots: &'a CompletionSlots,
    key: SlotKey,
    rx: Option<oneshot::Receiver<Status>>,
    _gate: OwnedMutexGuard<()>,
}

impl SlotReservation<'_> {
    /// Wait for the completion event, bounded by `timeout`. A timeout or
    /// an abandoned slot reports [`Status::Failed`].
    pub async fn wait(mut self, timeout: Duration) -> Status {
        let rx = self.rx.take().expect("completion receiver consumed twice");
        match time::timeout(timeout, rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => Status::Failed,
            Err(_) => Status::Failed,
        }
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        // The per-category gate is still held here, so the only pending
        // entry this can remove is our own (stale after a timeout or a
        // failed issuance).
        self.slots.pending.lock().unwrap().remove(&self.key);
    }
}
