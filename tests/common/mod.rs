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

//! Shared test harness: a scriptable in-memory controller recording every
//! issued command, and a listener recording every upcall.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nfc_routing::config::ConfigStore;
use nfc_routing::listener::HostListener;
use nfc_routing::nfcc::{
    CeHandle, EeHandle, EeId, EeInfo, EeMode, NciVersion, NfccDriver, NfccEvent, PowerState,
    ProtoMask, RoutingPower, Status, TechMask,
};
use nfc_routing::routing::RoutingManager;

/// Command issued to the fake controller, as recorded for assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    EeRegister,
    EeDeregister,
    SetIsoDepListenTech(TechMask),
    ConfigureEeListenTech {
        handle: EeHandle,
        tech: TechMask,
    },
    RegisterWildcardAid,
    AddAidRoute {
        route: EeId,
        aid: Vec<u8>,
        power: PowerState,
        qualifier: u8,
    },
    RemoveAidRoute {
        aid: Vec<u8>,
    },
    SetDefaultTechRoute {
        route: EeId,
        power: RoutingPower<TechMask>,
    },
    SetDefaultProtoRoute {
        route: EeId,
        power: RoutingPower<ProtoMask>,
    },
    AddSystemCodeRoute {
        system_code: u16,
        route: EeId,
        power: PowerState,
    },
    RemoveSystemCodeRoute {
        system_code: u16,
    },
    ClearRoutingTable {
        tech: bool,
        proto: bool,
        system_code: bool,
    },
    CommitRoutingTable,
    SetEeMode {
        handle: EeHandle,
        mode: EeMode,
    },
    PowerAndLinkCtrl {
        handle: EeHandle,
        config: u8,
    },
    SetSecureNfc(bool),
    RegisterFelica {
        system_code: u16,
    },
    DeregisterFelica {
        handle: CeHandle,
    },
}

/// Scripted behavior of the fake controller.
pub struct Behavior {
    pub nci_version: NciVersion,
    /// Result of `query_ee_info` and payload of the discover-request
    /// notification sent after registration.
    pub ee_entries: Vec<EeInfo>,
    pub mep_entries: Vec<EeInfo>,
    /// Issuance status returned by `add_system_code_route`.
    pub syscode_add_status: Status,
    /// Withhold AID add/remove completion events.
    pub mute_aid_completions: bool,
    /// Withhold the routing-committed completion event.
    pub mute_commit_completion: bool,
    /// Withhold EE mode-set completion events.
    pub mute_mode_set_completions: bool,
    /// Send a discover-request notification right after registration.
    pub discover_on_register: bool,
}

impl Default for Behavior {
    fn default() -> Behavior {
        Behavior {
            nci_version: NciVersion::Version20,
            ee_entries: vec![],
            mep_entries: vec![],
            syscode_add_status: Status::Ok,
            mute_aid_completions: false,
            mute_commit_completion: false,
            mute_mode_set_completions: false,
            discover_on_register: true,
        }
    }
}

/// In-memory controller double. Records every command and answers with
/// scripted completion events over the notification channel.
pub struct FakeNfcc {
    events: mpsc::UnboundedSender<NfccEvent>,
    commands: Mutex<Vec<Command>>,
    behavior: Mutex<Behavior>,
}

impl FakeNfcc {
    pub fn new() -> (Arc<FakeNfcc>, mpsc::UnboundedReceiver<NfccEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let nfcc = Arc::new(FakeNfcc {
            events,
            commands: Mutex::new(vec![]),
            behavior: Mutex::new(Behavior::default()),
        });
        (nfcc, rx)
    }

    /// Inject an unsolicited controller notification.
    pub fn send(&self, event: NfccEvent) {
        self.events.send(event).expect("event channel closed");
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn count_matching(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    pub fn set_ee_entries(&self, entries: Vec<EeInfo>) {
        self.behavior.lock().unwrap().ee_entries = entries;
    }

    pub fn set_mep_entries(&self, entries: Vec<EeInfo>) {
        self.behavior.lock().unwrap().mep_entries = entries;
    }

    pub fn set_syscode_add_status(&self, status: Status) {
        self.behavior.lock().unwrap().syscode_add_status = status;
    }

    pub fn mute_aid_completions(&self) {
        self.behavior.lock().unwrap().mute_aid_completions = true;
    }

    pub fn mute_commit_completion(&self) {
        self.behavior.lock().unwrap().mute_commit_completion = true;
    }

    pub fn mute_mode_set_completions(&self) {
        self.behavior.lock().unwrap().mute_mode_set_completions = true;
    }

    pub fn set_discover_on_register(&self, enabled: bool) {
        self.behavior.lock().unwrap().discover_on_register = enabled;
    }

    fn record(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }
}

impl NfccDriver for FakeNfcc {
    fn nci_version(&self) -> NciVersion {
        self.behavior.lock().unwrap().nci_version
    }

    fn ee_register(&self) -> Status {
        self.record(Command::EeRegister);
        self.send(NfccEvent::EeRegistered { status: Status::Ok });
        let behavior = self.behavior.lock().unwrap();
        if behavior.discover_on_register {
            self.send(NfccEvent::EeDiscoverRequest {
                entries: behavior.ee_entries.clone(),
            });
        }
        Status::Ok
    }

    fn ee_deregister(&self) -> Status {
        self.record(Command::EeDeregister);
        self.send(NfccEvent::EeDeregistered { status: Status::Ok });
        Status::Ok
    }

    fn query_ee_info(&self) -> Result<Vec<EeInfo>, Status> {
        Ok(self.behavior.lock().unwrap().ee_entries.clone())
    }

    fn query_mep_ee_info(&self) -> Result<Vec<EeInfo>, Status> {
        Ok(self.behavior.lock().unwrap().mep_entries.clone())
    }

    fn set_ee_mode(&self, handle: EeHandle, mode: EeMode) -> Status {
        self.record(Command::SetEeMode { handle, mode });
        if !self.behavior.lock().unwrap().mute_mode_set_completions {
            self.send(NfccEvent::EeModeSet {
                status: Status::Ok,
                handle,
            });
        }
        Status::Ok
    }

    fn set_isodep_listen_tech(&self, tech: TechMask) -> Status {
        self.record(Command::SetIsoDepListenTech(tech));
        Status::Ok
    }

    fn configure_ee_listen_tech(&self, handle: EeHandle, tech: TechMask) -> Status {
        self.record(Command::ConfigureEeListenTech { handle, tech });
        Status::Ok
    }

    fn register_wildcard_aid_on_host(&self) -> Status {
        self.record(Command::RegisterWildcardAid);
        Status::Ok
    }

    fn add_aid_route(&self, route: EeId, aid: &[u8], power: PowerState, qualifier: u8) -> Status {
        self.record(Command::AddAidRoute {
            route,
            aid: aid.to_vec(),
            power,
            qualifier,
        });
        if !self.behavior.lock().unwrap().mute_aid_completions {
            self.send(NfccEvent::AidAdded { status: Status::Ok });
        }
        Status::Ok
    }

    fn remove_aid_route(&self, aid: &[u8]) -> Status {
        self.record(Command::RemoveAidRoute { aid: aid.to_vec() });
        if !self.behavior.lock().unwrap().mute_aid_completions {
            self.send(NfccEvent::AidRemoved { status: Status::Ok });
        }
        Status::Ok
    }

    fn set_default_tech_route(&self, route: EeId, power: RoutingPower<TechMask>) -> Status {
        self.record(Command::SetDefaultTechRoute { route, power });
        self.send(NfccEvent::EeTechConfigSet { status: Status::Ok });
        Status::Ok
    }

    fn set_default_proto_route(&self, route: EeId, power: RoutingPower<ProtoMask>) -> Status {
        self.record(Command::SetDefaultProtoRoute { route, power });
        self.send(NfccEvent::EeProtoConfigSet { status: Status::Ok });
        Status::Ok
    }

    fn add_system_code_route(&self, system_code: u16, route: EeId, power: PowerState) -> Status {
        self.record(Command::AddSystemCodeRoute {
            system_code,
            route,
            power,
        });
        let status = self.behavior.lock().unwrap().syscode_add_status;
        if status.is_ok() {
            self.send(NfccEvent::SystemCodeAdded { status: Status::Ok });
        }
        status
    }

    fn remove_system_code_route(&self, system_code: u16) -> Status {
        self.record(Command::RemoveSystemCodeRoute { system_code });
        self.send(NfccEvent::SystemCodeRemoved { status: Status::Ok });
        Status::Ok
    }

    fn clear_routing_table(&self, tech: bool, proto: bool, system_code: bool) -> Status {
        self.record(Command::ClearRoutingTable {
            tech,
            proto,
            system_code,
        });
        Status::Ok
    }

    fn commit_routing_table(&self) -> Status {
        self.record(Command::CommitRoutingTable);
        if !self.behavior.lock().unwrap().mute_commit_completion {
            self.send(NfccEvent::RoutingCommitted { status: Status::Ok });
        }
        Status::Ok
    }

    fn power_and_link_ctrl(&self, handle: EeHandle, config: u8) -> Status {
        self.record(Command::PowerAndLinkCtrl { handle, config });
        self.send(NfccEvent::EePowerAndLinkCtrl { status: Status::Ok });
        Status::Ok
    }

    fn set_secure_nfc(&self, enabled: bool) -> Status {
        self.record(Command::SetSecureNfc(enabled));
        Status::Ok
    }

    fn register_felica_system_code_on_host(
        &self,
        system_code: u16,
        _nfcid2: [u8; 8],
        _pmm: [u8; 8],
    ) -> Status {
        self.record(Command::RegisterFelica { system_code });
        self.send(NfccEvent::CeRegistered {
            status: Status::Ok,
            handle: CeHandle(0x0301),
        });
        Status::Ok
    }

    fn deregister_felica_system_code_on_host(&self, handle: CeHandle) -> Status {
        self.record(Command::DeregisterFelica { handle });
        self.send(NfccEvent::CeDeregistered { handle });
        Status::Ok
    }
}

/// Upcall recorded by [`RecordingListener`].
#[derive(Clone, Debug, PartialEq)]
pub enum Upcall {
    HostEmulationActivated(TechMask),
    HostEmulationDeactivated(TechMask),
    HostEmulationData(TechMask, Vec<u8>),
    ListenModeActivated(bool),
    EeAidSelected(Vec<u8>, String),
    EeProtocolSelected(u8, String),
    EeTechSelected(u8, String),
    EeListUpdated,
}

/// Listener double recording every upcall; can be scripted to fail every
/// upcall after recording it.
#[derive(Default)]
pub struct RecordingListener {
    upcalls: Mutex<Vec<Upcall>>,
    fail_upcalls: AtomicBool,
}

impl RecordingListener {
    pub fn upcalls(&self) -> Vec<Upcall> {
        self.upcalls.lock().unwrap().clone()
    }

    pub fn fail_upcalls(&self) {
        self.fail_upcalls.store(true, Ordering::SeqCst);
    }

    fn record(&self, upcall: Upcall) -> Result<()> {
        self.upcalls.lock().unwrap().push(upcall);
        if self.fail_upcalls.load(Ordering::SeqCst) {
            Err(anyhow!("upper layer rejected the notification"))
        } else {
            Ok(())
        }
    }
}

impl HostListener for RecordingListener {
    fn on_host_emulation_activated(&self, tech: TechMask) -> Result<()> {
        self.record(Upcall::HostEmulationActivated(tech))
    }

    fn on_host_emulation_deactivated(&self, tech: TechMask) -> Result<()> {
        self.record(Upcall::HostEmulationDeactivated(tech))
    }

    fn on_host_emulation_data(&self, tech: TechMask, data: Bytes) -> Result<()> {
        self.record(Upcall::HostEmulationData(tech, data.to_vec()))
    }

    fn on_listen_mode_activated(&self, activated: bool) -> Result<()> {
        self.record(Upcall::ListenModeActivated(activated))
    }

    fn on_ee_aid_selected(&self, aid: Bytes, source: &str) -> Result<()> {
        self.record(Upcall::EeAidSelected(aid.to_vec(), source.into()))
    }

    fn on_ee_protocol_selected(&self, protocol: u8, source: &str) -> Result<()> {
        self.record(Upcall::EeProtocolSelected(protocol, source.into()))
    }

    fn on_ee_tech_selected(&self, tech: u8, source: &str) -> Result<()> {
        self.record(Upcall::EeTechSelected(tech, source.into()))
    }

    fn on_ee_list_updated(&self) -> Result<()> {
        self.record(Upcall::EeListUpdated)
    }
}

/// A routing manager wired to the fake controller and listener, with the
/// event dispatch loop running.
pub struct Harness {
    pub rm: Arc<RoutingManager>,
    pub nfcc: Arc<FakeNfcc>,
    pub listener: Arc<RecordingListener>,
    pub dispatcher: JoinHandle<()>,
}

impl Harness {
    pub fn spawn(store: ConfigStore) -> Harness {
        Self::spawn_with(store, |_| {})
    }

    /// Build the harness, letting `script` adjust the fake controller
    /// before the routing manager observes it.
    pub fn spawn_with(store: ConfigStore, script: impl FnOnce(&FakeNfcc)) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let (nfcc, events) = FakeNfcc::new();
        script(&nfcc);
        let listener = Arc::new(RecordingListener::default());
        let driver: Arc<dyn NfccDriver> = nfcc.clone();
        let rm = Arc::new(RoutingManager::new(driver, listener.clone(), &store));
        let dispatcher = tokio::spawn({
            let rm = rm.clone();
            async move {
                let _ = rm.run(events).await;
            }
        });
        Harness {
            rm,
            nfcc,
            listener,
            dispatcher,
        }
    }
}

/// Let the dispatcher drain everything already queued on the event
/// channel.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
