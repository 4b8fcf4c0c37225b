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

//! Upcalls toward the managing application framework.

use anyhow::Result;
use bytes::Bytes;

use crate::nfcc::TechMask;

/// Receiver of routing-manager notifications in the upper layer.
///
/// Methods are invoked from the controller event dispatcher. A returned
/// error is logged and dropped; it never unwinds the dispatcher and does
/// not block later notifications.
pub trait HostListener: Send + Sync {
    /// A remote reader activated card emulation on the device host.
    fn on_host_emulation_activated(&self, tech: TechMask) -> Result<()>;

    /// Card emulation on the device host was deactivated.
    fn on_host_emulation_deactivated(&self, tech: TechMask) -> Result<()>;

    /// A complete data exchange frame arrived for host card emulation.
    fn on_host_emulation_data(&self, tech: TechMask, data: Bytes) -> Result<()>;

    /// Listen-mode activity changed.
    fn on_listen_mode_activated(&self, activated: bool) -> Result<()>;

    /// A remote reader selected an AID routed to the named off-host
    /// execution environment.
    fn on_ee_aid_selected(&self, aid: Bytes, source: &str) -> Result<()>;

    /// A transaction was routed to the named execution environment based
    /// on the RF protocol.
    fn on_ee_protocol_selected(&self, protocol: u8, source: &str) -> Result<()>;

    /// A transaction was routed to the named execution environment based
    /// on the RF technology.
    fn on_ee_tech_selected(&self, tech: u8, source: &str) -> Result<()>;

    /// The set of execution environments or their RF capabilities
    /// changed.
    fn on_ee_list_updated(&self) -> Result<()>;
}
