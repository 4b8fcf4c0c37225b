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

//! Listen-mode routing table management for an NCI host stack.
//!
//! The [`routing::RoutingManager`] reconciles asynchronous NFCEE
//! discovery, AID registrations and default technology/protocol/system-code
//! routes into routing table commits against the NFC controller. Commands
//! go out through the [`nfcc::NfccDriver`] trait; the controller reports
//! completions and unsolicited activity back as [`nfcc::NfccEvent`]s,
//! consumed by the manager's dispatch loop. Card-emulation and
//! transaction activity is forwarded to the upper layer through
//! [`listener::HostListener`].

pub mod config;
pub mod listener;
pub mod nfcc;
pub mod registry;
pub mod routing;
mod sync;

pub use crate::config::ConfigStore;
pub use crate::listener::HostListener;
pub use crate::nfcc::{NfccDriver, NfccEvent, Status};
pub use crate::routing::RoutingManager;
