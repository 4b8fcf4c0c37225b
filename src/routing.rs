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

//! Management of the listen-mode routing table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::{AidMatchingMode, ConfigStore, RoutingConfig};
use crate::listener::HostListener;
use crate::nfcc::{
    CeHandle, EeHandle, EeId, EeInfo, EeInterface, EeMode, EeStatus, EeTrigger, NciVersion,
    NfccDriver, NfccEvent, PowerState, ProtoMask, RoutingPower, Status, TechMask, REMOVE_ALL_AIDS,
};
use crate::registry::EeRegistry;
use crate::sync::{CompletionSlots, SlotKey};

/// Route qualifier marking an AID entry as a prefix match.
pub const AID_ROUTE_QUAL_PREFIX: u8 = 0x10;

/// Remove every AID entry when clearing.
pub const CLEAR_AID_ENTRIES: u8 = 0x01;
/// Drop the protocol section of the routing table when clearing.
pub const CLEAR_PROTOCOL_ENTRIES: u8 = 0x02;
/// Drop the technology section of the routing table when clearing.
pub const CLEAR_TECHNOLOGY_ENTRIES: u8 = 0x04;
/// Drop the system-code section of the routing table when clearing.
pub const CLEAR_SC_ENTRIES: u8 = 0x08;

/// SCBR from host works only when the application is in the foreground.
const SYS_CODE_POWER_STATE_HOST: PowerState = PowerState(0x01);

/// Power states applied to AID entries routed to the device host:
/// switched on, screen on and locked.
const HOST_AID_POWER: PowerState = PowerState(0x11);

/// Bound on every wait for a controller completion event.
const ROUTING_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Routing destinations that the card-emulation service can replace at
/// runtime, plus the technology mask pushed off host by the last rebuild.
struct RouteTable {
    default_offhost_route: EeId,
    default_felica_route: EeId,
    default_isodep_route: EeId,
    default_sys_code_route: EeId,
    se_tech_mask: TechMask,
}

/// Listen-mode routing table manager.
///
/// Reconciles NFCEE discovery notifications, AID registrations,
/// technology/protocol default routes and system-code routing into
/// routing table commits against the controller. Constructed once at
/// service startup and shared by reference with every consumer; engine
/// calls may be issued from any task while [`RoutingManager::run`]
/// dispatches controller events.
pub struct RoutingManager {
    driver: Arc<dyn NfccDriver>,
    listener: Arc<dyn HostListener>,
    registry: EeRegistry,
    slots: CompletionSlots,
    nci_version: NciVersion,

    default_route: EeId,
    default_sys_code: u16,
    default_sys_code_power: PowerState,
    offhost_aid_power: PowerState,
    aid_matching_mode: AidMatchingMode,
    host_listen_tech: TechMask,
    offhost_listen_tech: TechMask,
    offhost_route_uicc: Vec<u8>,
    offhost_route_ese: Vec<u8>,
    mep_mode: bool,
    rf_discovery_optimized: bool,

    routes: Mutex<RouteTable>,

    // Completion flags are written by the event dispatcher and read by the
    // issuing task only after its wait returns.
    ee_info_changed: AtomicBool,
    aid_routing_configured: AtomicBool,
    default_aid_route_added: AtomicBool,
    scbr_supported: AtomicBool,
    secure_nfc: AtomicBool,
    deinitializing: AtomicBool,

    sync_timeout: Mutex<Duration>,
    ce_data_buffer: Mutex<BytesMut>,
    nfcf_on_host_handle: Mutex<Option<CeHandle>>,
    scbr_handles: Mutex<HashMap<CeHandle, u16>>,
}

/// Leave the mask in place for every power mode unless Secure NFC
/// restricts routing to the switched-on state.
fn power_gated<M: Copy + Default>(mask: M, secure: bool) -> M {
    if secure {
        M::default()
    } else {
        mask
    }
}

impl RoutingManager {
    /// Create a routing manager bound to `driver` for commands and
    /// `listener` for upcalls, with defaults derived from the
    /// configuration store.
    pub fn new(
        driver: Arc<dyn NfccDriver>,
        listener: Arc<dyn HostListener>,
        store: &ConfigStore,
    ) -> RoutingManager {
        let config = RoutingConfig::from_store(store);
        debug!(
            "new: default route {:#04x}, A/B route {:#04x}, active SE for Nfc-F {:#04x}",
            config.default_route.0, config.default_offhost_route.0, config.default_felica_route.0
        );
        let nci_version = driver.nci_version();

        RoutingManager {
            driver,
            listener,
            registry: EeRegistry::new(),
            slots: CompletionSlots::new(),
            nci_version,
            default_route: config.default_route,
            default_sys_code: config.default_sys_code,
            default_sys_code_power: config.default_sys_code_power,
            offhost_aid_power: config.offhost_aid_power,
            aid_matching_mode: config.aid_matching_mode,
            host_listen_tech: config.host_listen_tech,
            offhost_listen_tech: config.offhost_listen_tech,
            offhost_route_uicc: config.offhost_route_uicc,
            offhost_route_ese: config.offhost_route_ese,
            mep_mode: config.mep_mode,
            rf_discovery_optimized: config.rf_discovery_optimized,
            routes: Mutex::new(RouteTable {
                default_offhost_route: config.default_offhost_route,
                default_felica_route: config.default_felica_route,
                default_isodep_route: config.default_isodep_route,
                default_sys_code_route: config.default_sys_code_route,
                se_tech_mask: TechMask::NONE,
            }),
            ee_info_changed: AtomicBool::new(false),
            aid_routing_configured: AtomicBool::new(false),
            default_aid_route_added: AtomicBool::new(false),
            scbr_supported: AtomicBool::new(false),
            secure_nfc: AtomicBool::new(false),
            deinitializing: AtomicBool::new(false),
            sync_timeout: Mutex::new(ROUTING_EVENT_TIMEOUT),
            ce_data_buffer: Mutex::new(BytesMut::new()),
            nfcf_on_host_handle: Mutex::new(None),
            scbr_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register with the controller's NFCEE management and prime the
    /// routing state. [`RoutingManager::run`] must already be consuming
    /// controller events when this is called.
    pub async fn initialize(&self) -> bool {
        self.ce_data_buffer.lock().unwrap().clear();

        {
            let slot = self.slots.reserve(SlotKey::EeRegister).await;
            debug!("initialize: try ee register");
            let status = self.driver.ee_register();
            if !status.is_ok() {
                error!("initialize: fail ee register; status={:?}", status);
                return false;
            }
            if !slot.wait(self.sync_timeout()).await.is_ok() {
                error!("initialize: ee register not confirmed");
                return false;
            }
        }

        let (offhost_route, felica_route) = {
            let routes = self.routes.lock().unwrap();
            (routes.default_offhost_route, routes.default_felica_route)
        };
        if !offhost_route.is_host() || !felica_route.is_host() {
            // Off-host routing is configured: the first topology report
            // is needed before any route can be derived.
            let slot = self.slots.reserve(SlotKey::EeInfo).await;
            if !self.registry.received() {
                info!("initialize: waiting for EE info");
                let _ = slot.wait(self.sync_timeout()).await;
            }
        }

        // Set the host-routed technologies.
        let status = self
            .driver
            .set_isodep_listen_tech(self.host_listen_tech & (TechMask::A | TechMask::B));
        if !status.is_ok() {
            error!("initialize: failed to configure CE IsoDep technologies");
        }

        // Register a wild-card for AIDs routed to the host.
        let status = self.driver.register_wildcard_aid_on_host();
        if !status.is_ok() {
            error!("initialize: failed to register wildcard AID for DH");
        }

        // Force a routing table rebuild on the first commit.
        self.set_ee_info_changed();
        self.default_aid_route_added.store(false, Ordering::SeqCst);

        true
    }

    /// Drive the controller event dispatch loop. Returns only when the
    /// transport closes the event channel.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<NfccEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        Err(anyhow!("controller event channel closed"))
    }

    /// Whether the NFCEE behind `handle` supports listen technology A or
    /// B, per the controller's current EE list. Falls back to the MEP
    /// profile list when multi-enabled-profile mode is configured. A
    /// missing handle or a failed query reads as unsupported, so callers
    /// route to the host instead.
    fn is_tech_ab_supported_in_ee(&self, handle: EeHandle) -> bool {
        let supported = |entries: &[EeInfo]| {
            entries
                .iter()
                .any(|ee| ee.handle == handle && (ee.tech_a || ee.tech_b))
        };

        match self.driver.query_ee_info() {
            Ok(entries) if supported(&entries) => return true,
            Ok(_) => (),
            Err(_) => return false,
        }

        if self.mep_mode {
            match self.driver.query_mep_ee_info() {
                Ok(entries) if supported(&entries) => return true,
                Ok(_) => (),
                Err(_) => return false,
            }
        }

        warn!("is_tech_ab_supported_in_ee: route does not support A/B, using DH as default");
        false
    }

    /// Add an AID to be programmed into the routing table. A destination
    /// without technology A/B support is silently replaced by the device
    /// host. Returns whether the controller confirmed the entry.
    pub async fn add_aid_routing(
        &self,
        aid: &[u8],
        route: EeId,
        qualifier: u8,
        power: Option<PowerState>,
    ) -> bool {
        let route = if !route.is_host() && !self.is_tech_ab_supported_in_ee(route.handle()) {
            EeId::HOST
        } else {
            route
        };

        let mut power_state = PowerState::SWITCHED_ON;
        if !self.secure_nfc.load(Ordering::SeqCst) {
            power_state = match power {
                None if route.is_host() => HOST_AID_POWER,
                None => self.offhost_aid_power,
                Some(hint) if route.is_host() => hint,
                Some(hint) => self.offhost_aid_power & hint,
            };
        }

        if aid.is_empty() {
            debug!(
                "add_aid_routing: default AID on route={:#04x}, qualifier={:#04x}",
                route.0, qualifier
            );
        } else {
            debug!(
                "add_aid_routing: aid={:02x?}, route={:#04x}, qualifier={:#04x}",
                aid, route.0, qualifier
            );
        }

        let slot = self.slots.reserve(SlotKey::AidChange).await;
        self.aid_routing_configured.store(false, Ordering::SeqCst);
        let status = self.driver.add_aid_route(route, aid, power_state, qualifier);
        if status.is_ok() {
            let _ = slot.wait(self.sync_timeout()).await;
        }
        if self.aid_routing_configured.load(Ordering::SeqCst) {
            if aid.is_empty() {
                self.default_aid_route_added.store(true, Ordering::SeqCst);
            }
            true
        } else {
            error!("add_aid_routing: failed to route AID");
            false
        }
    }

    /// Remove an AID from the routing table. Returns whether the
    /// controller confirmed the removal.
    pub async fn remove_aid_routing(&self, aid: &[u8]) -> bool {
        if aid.is_empty() {
            debug!("remove_aid_routing: remove empty aid");
        } else {
            debug!("remove_aid_routing: aid={:02x?}", aid);
        }

        let slot = self.slots.reserve(SlotKey::AidChange).await;
        self.aid_routing_configured.store(false, Ordering::SeqCst);
        let status = self.driver.remove_aid_route(aid);
        if status.is_ok() {
            let _ = slot.wait(self.sync_timeout()).await;
        }
        if self.aid_routing_configured.load(Ordering::SeqCst) {
            true
        } else {
            warn!("remove_aid_routing: failed to remove AID");
            false
        }
    }

    /// Ask the controller for a routing table update.
    ///
    /// When the EE topology or a default route changed since the last
    /// commit, the technology/protocol sections are cleared and fully
    /// rebuilt first; the routing table has no atomic multi-entry replace,
    /// so the rebuild is a clear-then-push sequence. The returned status
    /// is the outcome of the final commit command, or `Ok` when no commit
    /// was needed.
    pub async fn commit_routing(&self) -> Status {
        let ee_changed = self.ee_info_changed.swap(false, Ordering::SeqCst);
        if ee_changed {
            self.clear_routing_entries(CLEAR_PROTOCOL_ENTRIES | CLEAR_TECHNOLOGY_ENTRIES)
                .await;
            self.update_routing_table().await;
        }

        let mut status = Status::Ok;
        if self.aid_routing_configured.load(Ordering::SeqCst) || ee_changed {
            debug!("commit_routing: routing table update needed");
            let slot = self.slots.reserve(SlotKey::Commit).await;
            status = self.driver.commit_routing_table();
            if status.is_ok() {
                status = slot.wait(self.sync_timeout()).await;
            }
        }
        status
    }

    /// Drop the selected sections of the routing table.
    pub async fn clear_routing_entries(&self, flags: u8) {
        debug!("clear_routing_entries: flags={:#04x}", flags);

        if flags & CLEAR_AID_ENTRIES != 0 {
            debug!("clear_routing_entries: clear all of aid based routing");
            self.remove_aid_routing(REMOVE_ALL_AIDS).await;
            self.default_aid_route_added.store(false, Ordering::SeqCst);
        }

        let tech = flags & CLEAR_TECHNOLOGY_ENTRIES != 0;
        let proto = flags & CLEAR_PROTOCOL_ENTRIES != 0;
        let sc = flags & CLEAR_SC_ENTRIES != 0;
        if tech || proto || sc {
            let status = self.driver.clear_routing_table(tech, proto, sc);
            if !status.is_ok() {
                error!("clear_routing_entries: failed to clear routing table");
            }
        }
    }

    /// Full recompute of the technology, default and protocol routes.
    async fn update_routing_table(&self) {
        debug!("update_routing_table: enter");
        let se_tech_mask = self.update_ee_tech_route_setting();
        self.routes.lock().unwrap().se_tech_mask = se_tech_mask;
        self.update_default_route().await;
        self.update_default_protocol_route().await;
        debug!("update_routing_table: exit");
    }

    /// Push the default listen A/B/F technology routes derived from the
    /// current EE topology and return the union of the masks routed off
    /// host. Technologies in the host listen mask that no NFCEE took are
    /// routed to the device host.
    fn update_ee_tech_route_setting(&self) -> TechMask {
        let entries = self.registry.snapshot();
        let (offhost_route, felica_route) = {
            let routes = self.routes.lock().unwrap();
            (routes.default_offhost_route, routes.default_felica_route)
        };
        let secure = self.secure_nfc.load(Ordering::SeqCst);

        debug!(
            "update_ee_tech_route_setting: default route A/B={:#04x} F={:#04x}, {} NFCEE(s)",
            offhost_route.0,
            felica_route.0,
            entries.len()
        );

        let mut all_se_mask = TechMask::NONE;
        for ee in &entries {
            let mut se_mask = TechMask::NONE;
            if !offhost_route.is_host() && ee.handle == offhost_route.handle() {
                if ee.tech_a {
                    se_mask |= TechMask::A;
                }
                if ee.tech_b {
                    se_mask |= TechMask::B;
                }
            }
            if !felica_route.is_host() && ee.handle == felica_route.handle() && ee.tech_f {
                se_mask |= TechMask::F;
            }

            // Filter out the technologies not listed for off-host listening.
            se_mask = se_mask & self.offhost_listen_tech;

            debug!(
                "update_ee_tech_route_setting: EE {:#06x} techA={} techB={} techF={} mask={:#04x}",
                ee.handle.0, ee.tech_a, ee.tech_b, ee.tech_f, se_mask.0
            );

            if !se_mask.is_empty() {
                debug!(
                    "update_ee_tech_route_setting: configuring tech mask {:#04x} on EE {:#06x}",
                    se_mask.0, ee.handle.0
                );
                let status = self.driver.configure_ee_listen_tech(ee.handle, se_mask);
                if !status.is_ok() {
                    error!("update_ee_tech_route_setting: failed to configure listen technologies");
                }
                let status = self.driver.set_default_tech_route(
                    ee.handle.id(),
                    RoutingPower {
                        switch_on: se_mask,
                        switch_off: power_gated(se_mask, secure),
                        battery_off: TechMask::NONE,
                        screen_on_locked: power_gated(se_mask, secure),
                        screen_off_unlocked: power_gated(se_mask, secure),
                        screen_off_locked: power_gated(se_mask, secure),
                    },
                );
                if !status.is_ok() {
                    error!(
                        "update_ee_tech_route_setting: failed to configure {:#06x} tech routing",
                        ee.handle.0
                    );
                }
                all_se_mask |= se_mask;
            }
        }

        // Route to the host whatever host technology no NFCEE claimed.
        let mut host_mask = TechMask::NONE;
        for tech in [TechMask::A, TechMask::B, TechMask::F] {
            if !all_se_mask.contains(tech) && self.host_listen_tech.contains(tech) {
                host_mask |= tech;
            }
        }
        if !host_mask.is_empty() {
            let status = self.driver.set_default_tech_route(
                EeId::HOST,
                RoutingPower {
                    switch_on: host_mask,
                    switch_off: TechMask::NONE,
                    battery_off: TechMask::NONE,
                    screen_on_locked: power_gated(host_mask, secure),
                    screen_off_unlocked: power_gated(host_mask, secure),
                    screen_off_locked: power_gated(host_mask, secure),
                },
            );
            if !status.is_ok() {
                error!("update_ee_tech_route_setting: failed to configure DH tech routing");
            }
        }

        all_se_mask
    }

    /// Push the default ISO-DEP protocol route, and the T3T protocol
    /// route on controllers without system-code based routing. Only the
    /// T3T command is waited for: its outcome gates whether NFC-F listen
    /// frames can be answered at all.
    async fn update_default_protocol_route(&self) {
        let isodep_route = self.routes.lock().unwrap().default_isodep_route;
        let secure = self.secure_nfc.load(Ordering::SeqCst);

        debug!(
            "update_default_protocol_route: default ISO-DEP route={:#04x}",
            isodep_route.0
        );
        let mask = ProtoMask::ISO_DEP;
        let status = if !isodep_route.is_host() && self.is_tech_ab_supported_in_ee(isodep_route.handle())
        {
            self.driver.set_default_proto_route(
                isodep_route,
                RoutingPower {
                    switch_on: mask,
                    switch_off: power_gated(mask, secure),
                    battery_off: ProtoMask::NONE,
                    screen_on_locked: power_gated(mask, secure),
                    screen_off_unlocked: power_gated(mask, secure),
                    screen_off_locked: power_gated(mask, secure),
                },
            )
        } else {
            self.routes.lock().unwrap().default_isodep_route = EeId::HOST;
            self.driver.set_default_proto_route(
                EeId::HOST,
                RoutingPower {
                    switch_on: mask,
                    switch_off: ProtoMask::NONE,
                    battery_off: ProtoMask::NONE,
                    screen_on_locked: power_gated(mask, secure),
                    screen_off_unlocked: ProtoMask::NONE,
                    screen_off_locked: ProtoMask::NONE,
                },
            )
        };
        if !status.is_ok() {
            error!("update_default_protocol_route: failed to register default ISO-DEP route");
        }

        if !self.scbr_supported.load(Ordering::SeqCst) {
            let mask = ProtoMask::T3T;
            let slot = self.slots.reserve(SlotKey::Routing).await;
            let status = if self.default_route.is_host() {
                self.driver.set_default_proto_route(
                    EeId::HOST,
                    RoutingPower {
                        switch_on: mask,
                        ..Default::default()
                    },
                )
            } else {
                self.driver.set_default_proto_route(
                    self.default_route,
                    RoutingPower {
                        switch_on: mask,
                        switch_off: ProtoMask::NONE,
                        battery_off: ProtoMask::NONE,
                        screen_on_locked: power_gated(mask, secure),
                        screen_off_unlocked: power_gated(mask, secure),
                        screen_off_locked: power_gated(mask, secure),
                    },
                )
            };
            if status.is_ok() {
                let _ = slot.wait(self.sync_timeout()).await;
            } else {
                error!("update_default_protocol_route: fail to set default proto routing for T3T");
            }
        }
    }

    /// Refresh the system-code registration and the zero-length default
    /// AID entry. NCI 1.x controllers have neither a system-code nor an
    /// AID routing table, so this is a no-op there.
    async fn update_default_route(&self) {
        if self.nci_version != NciVersion::Version20 {
            return;
        }

        let sys_code_route = self.routes.lock().unwrap().default_sys_code_route;
        debug!(
            "update_default_route: default SC route={:#04x}",
            sys_code_route.0
        );

        // Register the default system code for routing.
        {
            let slot = self.slots.reserve(SlotKey::Routing).await;
            let power = if self.secure_nfc.load(Ordering::SeqCst) {
                PowerState::SWITCHED_ON
            } else {
                self.default_sys_code_power
            };
            let status = self
                .driver
                .add_system_code_route(self.default_sys_code, sys_code_route, power);
            match status {
                Status::NotSupported => {
                    self.scbr_supported.store(false, Ordering::SeqCst);
                    error!("update_default_route: SCBR not supported");
                }
                Status::Ok => {
                    self.scbr_supported.store(true, Ordering::SeqCst);
                    let _ = slot.wait(self.sync_timeout()).await;
                }
                _ => {
                    // Still support SCBR routing for other NFCEEs.
                    self.scbr_supported.store(true, Ordering::SeqCst);
                    error!("update_default_route: fail to register system code");
                }
            }
        }

        // Install the zero-length AID entry exactly once per enablement
        // cycle.
        if !self.default_aid_route_added.load(Ordering::SeqCst) {
            let mut default_aid_route = self.default_route;
            debug!(
                "update_default_route: default AID route={:#04x}",
                default_aid_route.0
            );
            if !default_aid_route.is_host()
                && !self.is_tech_ab_supported_in_ee(default_aid_route.handle())
            {
                default_aid_route = EeId::HOST;
            }

            // Drop any stale zero-length entry before installing the
            // current one.
            self.remove_aid_routing(&[]).await;
            if !self
                .add_aid_routing(&[], default_aid_route, AID_ROUTE_QUAL_PREFIX, None)
                .await
            {
                error!("update_default_route: failed to register zero length AID");
            }
        }
    }

    /// Replace the default A/B and Felica routes; the change takes effect
    /// on the next commit. Returns the technology mask routed off host by
    /// the last rebuild.
    pub fn update_technology_abf_route(&self, route: EeId, felica_route: EeId) -> TechMask {
        debug!(
            "update_technology_abf_route: new default A/B route={:#04x}, F route={:#04x}",
            route.0, felica_route.0
        );
        self.set_ee_info_changed();
        let mut routes = self.routes.lock().unwrap();
        routes.default_offhost_route = route;
        routes.default_felica_route = felica_route;
        routes.se_tech_mask
    }

    /// Replace the default ISO-DEP protocol route; the change takes
    /// effect on the next commit.
    pub fn update_isodep_route(&self, route: EeId) {
        debug!("update_isodep_route: new default ISO-DEP route={:#04x}", route.0);
        self.set_ee_info_changed();
        self.routes.lock().unwrap().default_isodep_route = route;
    }

    /// Replace the default system-code route and re-register it with the
    /// controller immediately.
    pub async fn update_system_code_route(&self, route: EeId) {
        debug!("update_system_code_route: new default SC route={:#04x}", route.0);
        self.set_ee_info_changed();
        self.routes.lock().unwrap().default_sys_code_route = route;
        self.update_default_route().await;
    }

    /// Register an NFC-F system code for card emulation on the device
    /// host and, when the controller supports SCBR, route the system code
    /// to the host. Returns the card-emulation handle to deregister with.
    pub async fn register_t3t_identifier(
        &self,
        system_code: u16,
        nfcid2: [u8; 8],
        pmm: [u8; 8],
    ) -> Option<CeHandle> {
        debug!("register_t3t_identifier: start to register NFC-F system on DH");
        *self.nfcf_on_host_handle.lock().unwrap() = None;

        {
            let slot = self.slots.reserve(SlotKey::CeRegister).await;
            let status = self
                .driver
                .register_felica_system_code_on_host(system_code, nfcid2, pmm);
            if !status.is_ok() {
                error!("register_t3t_identifier: fail to register NFC-F system on DH");
                return None;
            }
            let _ = slot.wait(self.sync_timeout()).await;
        }
        let handle = match *self.nfcf_on_host_handle.lock().unwrap() {
            Some(handle) => handle,
            None => {
                error!("register_t3t_identifier: no registration handle reported");
                return None;
            }
        };
        debug!("register_t3t_identifier: succeed to register NFC-F system on DH");

        if self.scbr_supported.load(Ordering::SeqCst) {
            let slot = self.slots.reserve(SlotKey::Routing).await;
            let status =
                self.driver
                    .add_system_code_route(system_code, EeId::HOST, SYS_CODE_POWER_STATE_HOST);
            let status = if status.is_ok() {
                slot.wait(self.sync_timeout()).await
            } else {
                status
            };
            if !status.is_ok() {
                error!("register_t3t_identifier: fail to register system code on DH");
                return None;
            }
            debug!("register_t3t_identifier: succeed to register system code on DH");
            self.set_ee_info_changed();
            self.scbr_handles.lock().unwrap().insert(handle, system_code);
        } else {
            error!("register_t3t_identifier: SCBR not supported");
        }

        Some(handle)
    }

    /// Drop an NFC-F system code registration made with
    /// [`Self::register_t3t_identifier`] along with its host route.
    pub async fn deregister_t3t_identifier(&self, handle: CeHandle) {
        debug!("deregister_t3t_identifier: start to deregister NFC-F system on DH");
        {
            let slot = self.slots.reserve(SlotKey::CeRegister).await;
            let status = self.driver.deregister_felica_system_code_on_host(handle);
            if status.is_ok() {
                let _ = slot.wait(self.sync_timeout()).await;
                debug!("deregister_t3t_identifier: succeeded in deregistering NFC-F system on DH");
            } else {
                error!("deregister_t3t_identifier: fail to deregister NFC-F system on DH");
            }
        }

        if self.scbr_supported.load(Ordering::SeqCst) {
            let system_code = self.scbr_handles.lock().unwrap().remove(&handle);
            if let Some(system_code) = system_code.filter(|code| *code != 0) {
                let slot = self.slots.reserve(SlotKey::Routing).await;
                let status = self.driver.remove_system_code_route(system_code);
                if status.is_ok() {
                    let _ = slot.wait(self.sync_timeout()).await;
                    self.set_ee_info_changed();
                    debug!("deregister_t3t_identifier: succeeded in deregistering system code");
                } else {
                    error!("deregister_t3t_identifier: fail to deregister system code");
                }
            }
        }
    }

    /// Record the Secure NFC state and forward it to the controller.
    /// While enabled, every route is restricted to the switched-on,
    /// screen-unlocked power state.
    pub fn set_nfc_secure(&self, enable: bool) -> bool {
        info!("set_nfc_secure: enable={}", enable);
        self.secure_nfc.store(enable, Ordering::SeqCst);
        self.driver.set_secure_nfc(enable);
        true
    }

    /// Program the NFCEE power and link control command on the first
    /// configured eSE.
    pub async fn ee_power_and_link_ctrl(&self, config: u8) {
        let Some(&ese) = self.offhost_route_ese.first() else {
            error!("ee_power_and_link_ctrl: no eSE specified");
            return;
        };
        debug!(
            "ee_power_and_link_ctrl: nfceeId={:#04x}, config={:#04x}",
            ese, config
        );

        let slot = self.slots.reserve(SlotKey::PwrAndLinkCtrl).await;
        let status = self.driver.power_and_link_ctrl(EeId(ese).handle(), config);
        if !status.is_ok() {
            error!(
                "ee_power_and_link_ctrl: fail power and link ctrl; status={:?}",
                status
            );
            return;
        }
        let _ = slot.wait(self.sync_timeout()).await;
    }

    /// Deactivate every active off-host NFCEE ahead of controller
    /// power-down, then release every blocked waiter.
    pub async fn on_nfcc_shutdown(&self) {
        let (offhost_route, felica_route) = {
            let routes = self.routes.lock().unwrap();
            (routes.default_offhost_route, routes.default_felica_route)
        };
        if offhost_route.is_host() && felica_route.is_host() {
            return;
        }

        self.deinitializing.store(true, Ordering::SeqCst);

        let entries = match self.driver.query_ee_info() {
            Ok(entries) => entries,
            Err(status) => {
                error!("on_nfcc_shutdown: fail get info; status={:?}", status);
                return;
            }
        };
        if entries.is_empty() {
            debug!("on_nfcc_shutdown: no active EEs found");
        }
        for ee in entries {
            let offhost_present = match self.nci_version {
                NciVersion::Version11 => !ee.interfaces.is_empty(),
                NciVersion::Version20 => {
                    matches!(ee.interfaces.first(), Some(interface) if *interface != EeInterface::HciAccess)
                        && ee.status == EeStatus::Active
                }
            };
            if offhost_present {
                debug!(
                    "on_nfcc_shutdown: handle={:#06x} change status active to inactive",
                    ee.handle.0
                );
                let slot = self.slots.reserve(SlotKey::ModeSet).await;
                let status = self.driver.set_ee_mode(ee.handle, EeMode::Deactivate);
                if status.is_ok() {
                    let _ = slot.wait(self.sync_timeout()).await;
                } else {
                    error!("on_nfcc_shutdown: failed to set EE inactive");
                }
            }
        }

        // Release every caller still blocked on a completion.
        self.slots.release_all(Status::Failed);
    }

    /// Called for NFC disable: shut down off-host routing and deregister
    /// from NFCEE management.
    pub async fn deinitialize(&self) {
        self.on_nfcc_shutdown().await;
        let status = self.driver.ee_deregister();
        if !status.is_ok() {
            error!("deinitialize: fail ee deregister; status={:?}", status);
        }
    }

    /// Resolve an NFCEE handle to its configured reader-facing name
    /// ("eSE1", "SIM2", ...). Handles outside the configured eSE and UICC
    /// lists have no name.
    pub fn ee_name(&self, handle: EeHandle) -> Option<String> {
        let id = handle.id().0;
        if let Some(index) = self.offhost_route_ese.iter().position(|ese| *ese == id) {
            return Some(format!("eSE{}", index + 1));
        }
        if let Some(index) = self.offhost_route_uicc.iter().position(|uicc| *uicc == id) {
            return Some(format!("SIM{}", index + 1));
        }
        warn!("ee_name: incorrect EE id {:#04x}", id);
        None
    }

    /// Request a technology route update on the next commit.
    pub fn set_ee_tech_route_update_required(&self) {
        self.set_ee_info_changed();
    }

    fn set_ee_info_changed(&self) {
        debug!("set_ee_info_changed");
        self.ee_info_changed.store(true, Ordering::SeqCst);
    }

    /// Override the bound applied to waits for controller completions.
    pub fn set_sync_timeout(&self, timeout: Duration) {
        *self.sync_timeout.lock().unwrap() = timeout;
    }

    fn sync_timeout(&self) -> Duration {
        *self.sync_timeout.lock().unwrap()
    }

    // Routing state advertised to the card-emulation service.

    pub fn default_route(&self) -> EeId {
        self.default_route
    }

    pub fn default_offhost_route(&self) -> EeId {
        self.routes.lock().unwrap().default_offhost_route
    }

    pub fn default_felica_route(&self) -> EeId {
        self.routes.lock().unwrap().default_felica_route
    }

    pub fn default_isodep_route(&self) -> EeId {
        self.routes.lock().unwrap().default_isodep_route
    }

    pub fn default_sys_code_route(&self) -> EeId {
        self.routes.lock().unwrap().default_sys_code_route
    }

    pub fn aid_matching_mode(&self) -> AidMatchingMode {
        self.aid_matching_mode
    }

    pub fn offhost_ese_ids(&self) -> &[u8] {
        &self.offhost_route_ese
    }

    pub fn offhost_uicc_ids(&self) -> &[u8] {
        &self.offhost_route_uicc
    }

    pub fn mep_mode(&self) -> bool {
        self.mep_mode
    }

    /// Whether the zero-length catch-all AID entry is currently
    /// installed.
    pub fn default_aid_route_added(&self) -> bool {
        self.default_aid_route_added.load(Ordering::SeqCst)
    }

    /// Route each controller event to the waiting caller or to the shared
    /// routing state. Any event may legally arrive at any time.
    fn handle_event(&self, event: NfccEvent) {
        match event {
            NfccEvent::EeRegistered { status } => {
                debug!("handle_event: EeRegistered; status={:?}", status);
                self.slots.resolve(SlotKey::EeRegister, status);
            }

            NfccEvent::EeDeregistered { status } => {
                debug!("handle_event: EeDeregistered; status={:?}", status);
                self.registry.reset_received();
                self.deinitializing.store(false, Ordering::SeqCst);
            }

            NfccEvent::EeModeSet { status, handle } => {
                debug!(
                    "handle_event: EeModeSet; status={:?} handle={:#06x}",
                    status, handle.0
                );
                self.slots.resolve(SlotKey::ModeSet, status);
            }

            NfccEvent::EeTechConfigSet { status } => {
                debug!("handle_event: EeTechConfigSet; status={:?}", status);
            }

            NfccEvent::EeTechConfigCleared { status } => {
                debug!("handle_event: EeTechConfigCleared; status={:?}", status);
            }

            NfccEvent::EeProtoConfigSet { status } => {
                debug!("handle_event: EeProtoConfigSet; status={:?}", status);
                // Only the T3T protocol route is waited for, and it is
                // pushed only while SCBR is unsupported.
                if !self.scbr_supported.load(Ordering::SeqCst) {
                    self.slots.resolve(SlotKey::Routing, status);
                }
            }

            NfccEvent::EeProtoConfigCleared { status } => {
                debug!("handle_event: EeProtoConfigCleared; status={:?}", status);
            }

            NfccEvent::EeDiscoverRequest { entries } => {
                for ee in &entries {
                    debug!(
                        "handle_event: EeDiscoverRequest; nfceeId={:#06x} techA={} techB={} techF={}",
                        ee.handle.0, ee.tech_a, ee.tech_b, ee.tech_f
                    );
                }
                self.registry.record_discovery(entries);
                if !self.rf_discovery_optimized
                    && self.registry.received()
                    && !self.deinitializing.load(Ordering::SeqCst)
                {
                    self.set_ee_info_changed();
                    self.notify_ee_updated();
                }
                self.registry.mark_received();
                self.slots.resolve(SlotKey::EeInfo, Status::Ok);
            }

            NfccEvent::EeEnabled { status } => {
                debug!("handle_event: EeEnabled; status={:?}", status);
                if self.rf_discovery_optimized
                    && self.registry.received()
                    && !self.deinitializing.load(Ordering::SeqCst)
                {
                    self.set_ee_info_changed();
                    self.notify_ee_updated();
                }
            }

            NfccEvent::EeAction { handle, trigger } => match trigger {
                EeTrigger::AidSelected(aid) => {
                    debug!(
                        "handle_event: EeAction; handle={:#06x}; trigger=select",
                        handle.0
                    );
                    self.notify_ee_aid_selected(aid, handle);
                }
                EeTrigger::AppInit { aid, data } => {
                    debug!(
                        "handle_event: EeAction; handle={:#06x}; trigger=app-init; aid len={} data len={}",
                        handle.0,
                        aid.len(),
                        data.len()
                    );
                }
                EeTrigger::RfProtocol(protocol) => {
                    debug!(
                        "handle_event: EeAction; handle={:#06x}; trigger=rf protocol",
                        handle.0
                    );
                    self.notify_ee_protocol_selected(protocol, handle);
                }
                EeTrigger::RfTechnology(tech) => {
                    debug!(
                        "handle_event: EeAction; handle={:#06x}; trigger=rf tech",
                        handle.0
                    );
                    self.notify_ee_tech_selected(tech, handle);
                }
            },

            NfccEvent::NewEe { handle, status } => {
                debug!(
                    "handle_event: NewEe; handle={:#06x} status={:?}",
                    handle.0, status
                );
            }

            NfccEvent::AidAdded { status } => {
                debug!("handle_event: AidAdded; status={:?}", status);
                self.aid_routing_configured
                    .store(status.is_ok(), Ordering::SeqCst);
                self.slots.resolve(SlotKey::AidChange, status);
            }

            NfccEvent::AidRemoved { status } => {
                debug!("handle_event: AidRemoved; status={:?}", status);
                self.aid_routing_configured
                    .store(status.is_ok(), Ordering::SeqCst);
                self.slots.resolve(SlotKey::AidChange, status);
            }

            NfccEvent::SystemCodeAdded { status } => {
                debug!("handle_event: SystemCodeAdded; status={:?}", status);
                self.slots.resolve(SlotKey::Routing, status);
            }

            NfccEvent::SystemCodeRemoved { status } => {
                debug!("handle_event: SystemCodeRemoved; status={:?}", status);
                self.slots.resolve(SlotKey::Routing, status);
            }

            NfccEvent::RoutingCommitted { status } => {
                debug!("handle_event: RoutingCommitted; status={:?}", status);
                self.aid_routing_configured.store(false, Ordering::SeqCst);
                self.slots.resolve(SlotKey::Commit, status);
            }

            NfccEvent::EePowerAndLinkCtrl { status } => {
                debug!("handle_event: EePowerAndLinkCtrl; status={:?}", status);
                self.slots.resolve(SlotKey::PwrAndLinkCtrl, status);
            }

            NfccEvent::CeRegistered { status, handle } => {
                debug!(
                    "handle_event: CeRegistered; status={:?} handle={:#06x}",
                    status, handle.0
                );
                *self.nfcf_on_host_handle.lock().unwrap() = Some(handle);
                self.slots.resolve(SlotKey::CeRegister, status);
            }

            NfccEvent::CeDeregistered { handle } => {
                debug!("handle_event: CeDeregistered; handle={:#06x}", handle.0);
                self.slots.resolve(SlotKey::CeRegister, Status::Ok);
            }

            NfccEvent::CeActivated { tech } => {
                debug!("handle_event: CeActivated");
                self.notify_activated(tech);
            }

            NfccEvent::CeDeactivated { tech } => {
                debug!("handle_event: CeDeactivated");
                self.notify_deactivated(tech);
            }

            NfccEvent::CeData { tech, status, data } => {
                debug!(
                    "handle_event: CeData; status={:?} data len={}",
                    status,
                    data.len()
                );
                self.handle_ce_data(tech, status, &data);
            }
        }
    }

    fn notify_activated(&self, tech: TechMask) {
        if let Err(err) = self.listener.on_host_emulation_activated(tech) {
            error!("notify_activated: fail notify: {:#}", err);
        }
    }

    fn notify_deactivated(&self, tech: TechMask) {
        self.ce_data_buffer.lock().unwrap().clear();
        if let Err(err) = self.listener.on_listen_mode_activated(false) {
            error!("notify_deactivated: fail to notify listen active status: {:#}", err);
        }
        if let Err(err) = self.listener.on_host_emulation_deactivated(tech) {
            error!("notify_deactivated: fail notify: {:#}", err);
        }
    }

    /// Buffer partial card-emulation payloads until a terminal status is
    /// seen, then flush the whole frame upward.
    fn handle_ce_data(&self, tech: TechMask, status: Status, data: &[u8]) {
        let mut buffer = self.ce_data_buffer.lock().unwrap();
        match status {
            Status::Continue => {
                // More data expected in a following notification.
                buffer.extend_from_slice(data);
                return;
            }
            Status::Ok => {
                buffer.extend_from_slice(data);
            }
            _ => {
                error!("handle_ce_data: read data fail");
                buffer.clear();
                return;
            }
        }
        let frame = buffer.split().freeze();
        drop(buffer);
        if let Err(err) = self.listener.on_host_emulation_data(tech, frame) {
            error!("handle_ce_data: fail notify: {:#}", err);
        }
    }

    fn notify_ee_updated(&self) {
        if let Err(err) = self.listener.on_ee_list_updated() {
            error!("notify_ee_updated: fail notify: {:#}", err);
        }
    }

    fn notify_ee_aid_selected(&self, aid: Bytes, handle: EeHandle) {
        if aid.is_empty() {
            return;
        }
        let Some(source) = self.ee_name(handle) else {
            return;
        };
        if let Err(err) = self.listener.on_ee_aid_selected(aid, &source) {
            error!("notify_ee_aid_selected: fail notify: {:#}", err);
        }
    }

    fn notify_ee_protocol_selected(&self, protocol: u8, handle: EeHandle) {
        let Some(source) = self.ee_name(handle) else {
            return;
        };
        if let Err(err) = self.listener.on_ee_protocol_selected(protocol, &source) {
            error!("notify_ee_protocol_selected: fail notify: {:#}", err);
        }
    }

    fn notify_ee_tech_selected(&self, tech: u8, handle: EeHandle) {
        let Some(source) = self.ee_name(handle) else {
            return;
        };
        if let Err(err) = self.listener.on_ee_tech_selected(tech, &source) {
            error!("notify_ee_tech_selected: fail notify: {:#}", err);
        }
    }
}
