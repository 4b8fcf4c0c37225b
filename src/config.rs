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

//! Static configuration store and the routing defaults derived from it.

use std::collections::HashMap;

use crate::nfcc::{EeId, PowerState, TechMask};

/// Configuration keys understood by the routing manager.
pub mod keys {
    pub const DEFAULT_OFFHOST_ROUTE: &str = "DEFAULT_OFFHOST_ROUTE";
    pub const OFFHOST_ROUTE_UICC: &str = "OFFHOST_ROUTE_UICC";
    pub const OFFHOST_ROUTE_ESE: &str = "OFFHOST_ROUTE_ESE";
    pub const DEFAULT_NFCF_ROUTE: &str = "DEFAULT_NFCF_ROUTE";
    pub const DEFAULT_ROUTE: &str = "DEFAULT_ROUTE";
    pub const AID_MATCHING_MODE: &str = "AID_MATCHING_MODE";
    pub const DEFAULT_SYS_CODE: &str = "DEFAULT_SYS_CODE";
    pub const DEFAULT_SYS_CODE_ROUTE: &str = "DEFAULT_SYS_CODE_ROUTE";
    pub const DEFAULT_SYS_CODE_PWR_STATE: &str = "DEFAULT_SYS_CODE_PWR_STATE";
    pub const OFFHOST_AID_ROUTE_PWR_STATE: &str = "OFFHOST_AID_ROUTE_PWR_STATE";
    pub const DEFAULT_ISODEP_ROUTE: &str = "DEFAULT_ISODEP_ROUTE";
    pub const HOST_LISTEN_TECH_MASK: &str = "HOST_LISTEN_TECH_MASK";
    pub const OFFHOST_LISTEN_TECH_MASK: &str = "OFFHOST_LISTEN_TECH_MASK";
    pub const EUICC_MEP_MODE: &str = "EUICC_MEP_MODE";
    pub const NFCEE_EVENT_RF_DISCOVERY_OPTION: &str = "NFCEE_EVENT_RF_DISCOVERY_OPTION";
}

/// The NFC-F system code registered when the configuration does not
/// provide one.
const DEFAULT_SYS_CODE: u16 = 0xFEFE;

/// Value held for one configuration key.
#[derive(Clone, Debug)]
enum ConfigValue {
    Unsigned(u32),
    Bytes(Vec<u8>),
}

/// Immutable key/value store loaded from the platform configuration files
/// before the stack starts. Queried once at construction time.
#[derive(Clone, Debug, Default)]
pub struct ConfigStore {
    values: HashMap<String, ConfigValue>,
}

impl ConfigStore {
    pub fn new() -> ConfigStore {
        Default::default()
    }

    pub fn set_unsigned(&mut self, key: &str, value: u32) {
        self.values.insert(key.into(), ConfigValue::Unsigned(value));
    }

    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.values.insert(key.into(), ConfigValue::Bytes(value));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Numeric value for `key`, or `default` when the key is absent or
    /// holds a byte value.
    pub fn unsigned(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            Some(ConfigValue::Unsigned(value)) => *value,
            _ => default,
        }
    }

    /// Byte value for `key`, if present.
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.values.get(key) {
            Some(ConfigValue::Bytes(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// AID matching capability advertised to the card-emulation service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AidMatchingMode {
    ExactOnly,
    ExactOrPrefix,
    Prefix,
    ExactOrSubsetOrPrefix,
}

impl AidMatchingMode {
    fn from_config(value: u32) -> AidMatchingMode {
        match value {
            0x01 => AidMatchingMode::ExactOrPrefix,
            0x02 => AidMatchingMode::Prefix,
            0x03 => AidMatchingMode::ExactOrSubsetOrPrefix,
            _ => AidMatchingMode::ExactOnly,
        }
    }
}

/// Routing defaults derived from the configuration store when the routing
/// manager is constructed.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub default_offhost_route: EeId,
    pub default_felica_route: EeId,
    /// Default routing destination for everything without a more specific
    /// rule, including the catch-all AID entry.
    pub default_route: EeId,
    pub default_isodep_route: EeId,
    pub default_sys_code: u16,
    pub default_sys_code_route: EeId,
    pub default_sys_code_power: PowerState,
    /// Power states in which off-host AID routes stay active.
    pub offhost_aid_power: PowerState,
    pub aid_matching_mode: AidMatchingMode,
    pub host_listen_tech: TechMask,
    pub offhost_listen_tech: TechMask,
    /// NFCEE identifiers of the configured UICCs, in naming order.
    pub offhost_route_uicc: Vec<u8>,
    /// NFCEE identifiers of the configured eSEs, in naming order.
    pub offhost_route_ese: Vec<u8>,
    /// Multi-enabled-profile eUICC mode.
    pub mep_mode: bool,
    /// Selects the EE-topology notification point: EE-enabled events when
    /// set, discover-request notifications otherwise. Resolved once here;
    /// the two notification points are mutually exclusive.
    pub rf_discovery_optimized: bool,
}

impl RoutingConfig {
    pub fn from_store(store: &ConfigStore) -> RoutingConfig {
        let default_sys_code = match store.bytes(keys::DEFAULT_SYS_CODE) {
            Some(bytes) if bytes.len() == 2 => u16::from_be_bytes([bytes[0], bytes[1]]),
            _ => DEFAULT_SYS_CODE,
        };

        RoutingConfig {
            default_offhost_route: EeId(store.unsigned(keys::DEFAULT_OFFHOST_ROUTE, 0x00) as u8),
            default_felica_route: EeId(store.unsigned(keys::DEFAULT_NFCF_ROUTE, 0x00) as u8),
            default_route: EeId(store.unsigned(keys::DEFAULT_ROUTE, 0x00) as u8),
            default_isodep_route: EeId(store.unsigned(keys::DEFAULT_ISODEP_ROUTE, 0x00) as u8),
            default_sys_code,
            default_sys_code_route: EeId(store.unsigned(keys::DEFAULT_SYS_CODE_ROUTE, 0xC0) as u8),
            default_sys_code_power: PowerState(
                store.unsigned(keys::DEFAULT_SYS_CODE_PWR_STATE, 0x19) as u8,
            ),
            offhost_aid_power: PowerState(
                store.unsigned(keys::OFFHOST_AID_ROUTE_PWR_STATE, 0x01) as u8
            ),
            aid_matching_mode: AidMatchingMode::from_config(
                store.unsigned(keys::AID_MATCHING_MODE, 0x00),
            ),
            host_listen_tech: TechMask(
                store.unsigned(keys::HOST_LISTEN_TECH_MASK, (TechMask::A | TechMask::F).0 as u32)
                    as u8,
            ),
            offhost_listen_tech: TechMask(store.unsigned(
                keys::OFFHOST_LISTEN_TECH_MASK,
                (TechMask::A | TechMask::B | TechMask::F).0 as u32,
            ) as u8),
            offhost_route_uicc: store.bytes(keys::OFFHOST_ROUTE_UICC).unwrap_or_default(),
            offhost_route_ese: store.bytes(keys::OFFHOST_ROUTE_ESE).unwrap_or_default(),
            mep_mode: store.unsigned(keys::EUICC_MEP_MODE, 0x00) != 0,
            rf_discovery_optimized: store.unsigned(keys::NFCEE_EVENT_RF_DISCOVERY_OPTION, 0x00)
                == 0x01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_keys() {
        let config = RoutingConfig::from_store(&ConfigStore::new());
        assert_eq!(config.default_offhost_route, EeId::HOST);
        assert_eq!(config.default_route, EeId::HOST);
        assert_eq!(config.default_sys_code, 0xFEFE);
        assert_eq!(config.default_sys_code_route, EeId(0xC0));
        assert_eq!(config.default_sys_code_power, PowerState(0x19));
        assert_eq!(config.host_listen_tech, TechMask::A | TechMask::F);
        assert_eq!(
            config.offhost_listen_tech,
            TechMask::A | TechMask::B | TechMask::F
        );
        assert_eq!(config.aid_matching_mode, AidMatchingMode::ExactOnly);
        assert!(config.offhost_route_ese.is_empty());
        assert!(!config.rf_discovery_optimized);
        assert!(!config.mep_mode);
    }

    #[test]
    fn configured_values_override_defaults() {
        let mut store = ConfigStore::new();
        store.set_unsigned(keys::DEFAULT_OFFHOST_ROUTE, 0x81);
        store.set_unsigned(keys::DEFAULT_NFCF_ROUTE, 0x82);
        store.set_bytes(keys::DEFAULT_SYS_CODE, vec![0x40, 0x01]);
        store.set_bytes(keys::OFFHOST_ROUTE_ESE, vec![0x82, 0x83]);
        store.set_unsigned(keys::AID_MATCHING_MODE, 0x02);
        store.set_unsigned(keys::NFCEE_EVENT_RF_DISCOVERY_OPTION, 0x01);

        let config = RoutingConfig::from_store(&store);
        assert_eq!(config.default_offhost_route, EeId(0x81));
        assert_eq!(config.default_felica_route, EeId(0x82));
        assert_eq!(config.default_sys_code, 0x4001);
        assert_eq!(config.offhost_route_ese, vec![0x82, 0x83]);
        assert_eq!(config.aid_matching_mode, AidMatchingMode::Prefix);
        assert!(config.rf_discovery_optimized);
    }

    #[test]
    fn malformed_system_code_falls_back() {
        let mut store = ConfigStore::new();
        store.set_bytes(keys::DEFAULT_SYS_CODE, vec![0x40]);
        let config = RoutingConfig::from_store(&store);
        assert_eq!(config.default_sys_code, 0xFEFE);
    }
}
