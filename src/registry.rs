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

//! Latest known execution-environment topology.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::nfcc::EeInfo;

/// Registry of the most recent NFCEE discovery snapshot.
///
/// The snapshot is replaced wholesale on every EE discover-request
/// notification. It can change concurrently with routing computations, so
/// readers copy it out under the lock and work on the copy.
#[derive(Default)]
pub struct EeRegistry {
    snapshot: Mutex<Vec<EeInfo>>,
    received: AtomicBool,
}

impl EeRegistry {
    pub fn new() -> EeRegistry {
        Default::default()
    }

    /// Replace the stored snapshot. Invoked only from the controller
    /// event dispatcher.
    pub fn record_discovery(&self, entries: Vec<EeInfo>) {
        *self.snapshot.lock().unwrap() = entries;
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> Vec<EeInfo> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Whether at least one discover-request notification has been
    /// received since registration.
    pub fn received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_received(&self) {
        self.received.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset_received(&self) {
        self.received.store(false, Ordering::SeqCst);
    }
}
