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

//! Types shared across the NFCC boundary: status codes, routing
//! destinations, technology and protocol masks, NFCEE records, the
//! command surface consumed by the routing engines, and the notification
//! events delivered back by the controller transport.

use bytes::Bytes;

/// NFCEE handles are the NFCEE identifier offset into the EE handle group.
const HANDLE_GROUP_EE: u16 = 0x0400;

/// Reserved AID selector understood by [`NfccDriver::remove_aid_route`] as
/// "remove every AID entry from the routing table".
pub const REMOVE_ALL_AIDS: &[u8] = &[0xff, 0xff];

/// Status reported by the controller, both for synchronous command
/// issuance and inside asynchronous completion notifications.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// More data to follow; only reported inside card-emulation data
    /// notifications.
    Continue,
    Rejected,
    Failed,
    NotSupported,
    SemanticError,
    InvalidParam,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// NCI protocol version negotiated with the controller at reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NciVersion {
    Version11,
    Version20,
}

/// NFCEE identifier as it appears in configuration and in listen-mode
/// routing table entries. `0x00` designates the device host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EeId(pub u8);

impl EeId {
    /// The device host routing destination.
    pub const HOST: EeId = EeId(0x00);

    pub fn is_host(self) -> bool {
        self == EeId::HOST
    }

    /// Controller handle for this NFCEE.
    pub fn handle(self) -> EeHandle {
        EeHandle(HANDLE_GROUP_EE | self.0 as u16)
    }
}

/// Controller-assigned handle for a discovered NFCEE.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EeHandle(pub u16);

impl EeHandle {
    /// NFCEE identifier for this handle, with the handle group stripped.
    pub fn id(self) -> EeId {
        EeId((self.0 & !HANDLE_GROUP_EE) as u8)
    }
}

/// Controller-assigned handle for a card-emulation registration on the
/// device host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CeHandle(pub u16);

/// Listen technology bitmask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TechMask(pub u8);

impl TechMask {
    pub const NONE: TechMask = TechMask(0x00);
    pub const A: TechMask = TechMask(0x01);
    pub const B: TechMask = TechMask(0x02);
    pub const F: TechMask = TechMask(0x04);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: TechMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TechMask {
    type Output = TechMask;
    fn bitor(self, rhs: TechMask) -> TechMask {
        TechMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TechMask {
    fn bitor_assign(&mut self, rhs: TechMask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for TechMask {
    type Output = TechMask;
    fn bitand(self, rhs: TechMask) -> TechMask {
        TechMask(self.0 & rhs.0)
    }
}

/// Listen protocol bitmask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtoMask(pub u8);

impl ProtoMask {
    pub const NONE: ProtoMask = ProtoMask(0x00);
    pub const T3T: ProtoMask = ProtoMask(0x04);
    pub const ISO_DEP: ProtoMask = ProtoMask(0x08);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ProtoMask {
    type Output = ProtoMask;
    fn bitor(self, rhs: ProtoMask) -> ProtoMask {
        ProtoMask(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for ProtoMask {
    type Output = ProtoMask;
    fn bitand(self, rhs: ProtoMask) -> ProtoMask {
        ProtoMask(self.0 & rhs.0)
    }
}

/// Power-state bitmask attached to AID and system-code routing entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PowerState(pub u8);

impl PowerState {
    pub const SWITCHED_ON: PowerState = PowerState(0x01);
    pub const SWITCHED_OFF: PowerState = PowerState(0x02);
    pub const BATTERY_OFF: PowerState = PowerState(0x04);
    pub const SCREEN_OFF_UNLOCKED: PowerState = PowerState(0x08);
    pub const SCREEN_ON_LOCKED: PowerState = PowerState(0x10);
    pub const SCREEN_OFF_LOCKED: PowerState = PowerState(0x20);
}

impl std::ops::BitOr for PowerState {
    type Output = PowerState;
    fn bitor(self, rhs: PowerState) -> PowerState {
        PowerState(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for PowerState {
    type Output = PowerState;
    fn bitand(self, rhs: PowerState) -> PowerState {
        PowerState(self.0 & rhs.0)
    }
}

/// Per-power-mode masks carried by a default technology or protocol
/// routing command. The controller keeps a separate routing decision for
/// every power mode; a route that is only valid while the device is
/// switched on leaves the other masks empty.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingPower<M> {
    pub switch_on: M,
    pub switch_off: M,
    pub battery_off: M,
    pub screen_on_locked: M,
    pub screen_off_unlocked: M,
    pub screen_off_locked: M,
}

/// NFCEE activation status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

/// NCI interface exposed by an NFCEE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeInterface {
    Apdu,
    HciAccess,
    T3tCommandSet,
    Transparent,
}

/// Activation mode requested through [`NfccDriver::set_ee_mode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeMode {
    Activate,
    Deactivate,
}

/// Record describing one NFCEE, as reported both by EE discover-request
/// notifications and by [`NfccDriver::query_ee_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EeInfo {
    pub handle: EeHandle,
    pub status: EeStatus,
    /// NCI interfaces supported by the NFCEE. Empty when the controller
    /// did not report any, which older (pre-2.0) controllers use to mark
    /// an NFCEE as unreachable.
    pub interfaces: Vec<EeInterface>,
    pub tech_a: bool,
    pub tech_b: bool,
    pub tech_f: bool,
}

impl EeInfo {
    /// Record for an NFCEE reachable through the NFCEE-direct interface.
    pub fn direct(
        handle: EeHandle,
        status: EeStatus,
        tech_a: bool,
        tech_b: bool,
        tech_f: bool,
    ) -> EeInfo {
        EeInfo {
            handle,
            status,
            interfaces: vec![EeInterface::Apdu],
            tech_a,
            tech_b,
            tech_f,
        }
    }

    /// Record for an NFCEE reachable only through the HCI access
    /// interface.
    pub fn hci_access(handle: EeHandle, status: EeStatus) -> EeInfo {
        EeInfo {
            handle,
            status,
            interfaces: vec![EeInterface::HciAccess],
            tech_a: false,
            tech_b: false,
            tech_f: false,
        }
    }
}

/// Trigger condition attached to an EE-action notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EeTrigger {
    /// An AID was selected by the remote reader and routed to the NFCEE.
    AidSelected(Bytes),
    /// An NFCEE application initiated the transaction.
    AppInit { aid: Bytes, data: Bytes },
    /// Routing was decided on the RF protocol.
    RfProtocol(u8),
    /// Routing was decided on the RF technology.
    RfTechnology(u8),
}

/// Asynchronous notification delivered by the controller transport.
///
/// Commands of [`NfccDriver`] that are documented as completing
/// asynchronously report their outcome through one of these events. The
/// controller additionally reports unsolicited NFCEE topology changes,
/// transaction triggers, and card-emulation activity on the same channel.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub enum NfccEvent {
    EeRegistered { status: Status },
    EeDeregistered { status: Status },
    EeModeSet { status: Status, handle: EeHandle },
    EeTechConfigSet { status: Status },
    EeTechConfigCleared { status: Status },
    EeProtoConfigSet { status: Status },
    EeProtoConfigCleared { status: Status },
    EeDiscoverRequest { entries: Vec<EeInfo> },
    EeEnabled { status: Status },
    EeAction { handle: EeHandle, trigger: EeTrigger },
    NewEe { handle: EeHandle, status: EeStatus },
    AidAdded { status: Status },
    AidRemoved { status: Status },
    SystemCodeAdded { status: Status },
    SystemCodeRemoved { status: Status },
    RoutingCommitted { status: Status },
    EePowerAndLinkCtrl { status: Status },
    CeRegistered { status: Status, handle: CeHandle },
    CeDeregistered { handle: CeHandle },
    CeActivated { tech: TechMask },
    CeDeactivated { tech: TechMask },
    CeData { tech: TechMask, status: Status, data: Bytes },
}

/// Command surface of the NFC controller consumed by the routing manager.
///
/// Every command validates its parameters synchronously and reports the
/// result through the returned [`Status`]; commands accepted by the
/// controller complete later through an [`NfccEvent`] notification.
/// Implementations enqueue onto the transport and must not block.
pub trait NfccDriver: Send + Sync {
    /// NCI protocol version negotiated with the controller.
    fn nci_version(&self) -> NciVersion;

    /// Register for NFCEE management events. Completion is reported
    /// through [`NfccEvent::EeRegistered`].
    fn ee_register(&self) -> Status;

    /// Deregister from NFCEE management events.
    fn ee_deregister(&self) -> Status;

    /// Synchronous snapshot of the NFCEEs currently known to the
    /// controller.
    fn query_ee_info(&self) -> Result<Vec<EeInfo>, Status>;

    /// Secondary snapshot covering the multi-enabled-profile (MEP) eUICC
    /// profiles.
    fn query_mep_ee_info(&self) -> Result<Vec<EeInfo>, Status>;

    /// Activate or deactivate an NFCEE. Completion is reported through
    /// [`NfccEvent::EeModeSet`].
    fn set_ee_mode(&self, handle: EeHandle, mode: EeMode) -> Status;

    /// Configure the listen technologies answered with ISO-DEP on the
    /// device host.
    fn set_isodep_listen_tech(&self, tech: TechMask) -> Status;

    /// Configure the listen technologies forwarded to an off-host NFCEE.
    fn configure_ee_listen_tech(&self, handle: EeHandle, tech: TechMask) -> Status;

    /// Register the catch-all AID listener on the device host.
    fn register_wildcard_aid_on_host(&self) -> Status;

    /// Add one AID routing table entry. The zero-length AID is the
    /// reserved catch-all entry. Completion is reported through
    /// [`NfccEvent::AidAdded`].
    fn add_aid_route(&self, route: EeId, aid: &[u8], power: PowerState, qualifier: u8) -> Status;

    /// Remove one AID routing table entry ([`REMOVE_ALL_AIDS`] removes
    /// them all). Completion is reported through [`NfccEvent::AidRemoved`].
    fn remove_aid_route(&self, aid: &[u8]) -> Status;

    /// Set the default listen-technology routes for one destination.
    fn set_default_tech_route(&self, route: EeId, power: RoutingPower<TechMask>) -> Status;

    /// Set the default protocol routes for one destination.
    fn set_default_proto_route(&self, route: EeId, power: RoutingPower<ProtoMask>) -> Status;

    /// Add a system-code routing entry. Controllers without system-code
    /// based routing report [`Status::NotSupported`]. Completion is
    /// reported through [`NfccEvent::SystemCodeAdded`].
    fn add_system_code_route(&self, system_code: u16, route: EeId, power: PowerState) -> Status;

    /// Remove a system-code routing entry. Completion is reported through
    /// [`NfccEvent::SystemCodeRemoved`].
    fn remove_system_code_route(&self, system_code: u16) -> Status;

    /// Drop the selected routing table sections.
    fn clear_routing_table(&self, tech: bool, proto: bool, system_code: bool) -> Status;

    /// Apply every staged routing table change. Completion is reported
    /// through [`NfccEvent::RoutingCommitted`].
    fn commit_routing_table(&self) -> Status;

    /// Program the NFCEE power and link control command. Completion is
    /// reported through [`NfccEvent::EePowerAndLinkCtrl`].
    fn power_and_link_ctrl(&self, handle: EeHandle, config: u8) -> Status;

    /// Forward the Secure NFC state to the controller.
    fn set_secure_nfc(&self, enabled: bool) -> Status;

    /// Register an NFC-F system code for card emulation on the device
    /// host. Completion is reported through [`NfccEvent::CeRegistered`]
    /// carrying the assigned handle.
    fn register_felica_system_code_on_host(
        &self,
        system_code: u16,
        nfcid2: [u8; 8],
        pmm: [u8; 8],
    ) -> Status;

    /// Drop an NFC-F system code registration made with
    /// [`Self::register_felica_system_code_on_host`].
    fn deregister_felica_system_code_on_host(&self, handle: CeHandle) -> Status;
}
