// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Node configuration, TOML-based like the teacher's `BTCZSNodeConfig`: one
//! file, a top-level network/data-dir pair, and one section per concern
//! named in spec §6's config table (`[consensus]`, `[btcspv]`,
//! `[masternode]`, `[rpc]`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Network;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("mnoperatorprivatekey is not a valid secp256k1 secret key: {0}")]
    BadOperatorKey(String),
}

/// TOML-facing mirror of `core::Network`; kept distinct so the wire format
/// (lowercase strings) doesn't leak into the consensus-params type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkConfig {
    Mainnet,
    Testnet,
    Regtest,
}

impl From<NetworkConfig> for Network {
    fn from(n: NetworkConfig) -> Network {
        match n {
            NetworkConfig::Mainnet => Network::Mainnet,
            NetworkConfig::Testnet => Network::Testnet,
            NetworkConfig::Regtest => Network::Regtest,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[consensus]`: `btcburnsenabled` seeds the kill switch; `enablemint`
/// bypasses `TX_MINT_M0BTC` validation (spec §6: "test/recovery only").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfigSection {
    #[serde(default = "default_true")]
    pub btcburnsenabled: bool,
    #[serde(default)]
    pub enablemint: bool,
}

impl Default for ConsensusConfigSection {
    fn default() -> Self {
        ConsensusConfigSection { btcburnsenabled: true, enablemint: false }
    }
}

fn default_btcpublishinterval() -> u64 {
    60
}

/// `[btcspv]`: whether and how often this node republishes its SPV tip as
/// `TX_BTC_HEADERS` when it is a confirmed DMN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcSpvConfigSection {
    #[serde(default)]
    pub btcheaderspublish: bool,
    #[serde(default = "default_btcpublishinterval")]
    pub btcpublishinterval: u64,
}

impl Default for BtcSpvConfigSection {
    fn default() -> Self {
        BtcSpvConfigSection { btcheaderspublish: false, btcpublishinterval: default_btcpublishinterval() }
    }
}

impl BtcSpvConfigSection {
    /// Publisher period clamped to [10, 600] seconds (spec §6).
    pub fn clamped_publish_interval(&self) -> u64 {
        self.btcpublishinterval.clamp(10, 600)
    }
}

/// `[masternode]`: the operator identity and HA production delay for a DMN
/// this daemon is acting as (spec §6, §4.H "HA active/standby").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasternodeConfigSection {
    #[serde(default)]
    pub mn_produce_delay: u64,
    /// Hex-encoded secp256k1 secret key. Exactly one per daemon; `None` if
    /// this node does not act as a masternode operator.
    pub mnoperatorprivatekey: Option<String>,
}

impl MasternodeConfigSection {
    pub fn operator_secret_key(&self) -> Result<Option<secp256k1::SecretKey>, ConfigError> {
        let Some(hex_str) = &self.mnoperatorprivatekey else { return Ok(None) };
        let bytes = hex::decode(hex_str).map_err(|e| ConfigError::BadOperatorKey(e.to_string()))?;
        let sk = secp256k1::SecretKey::from_slice(&bytes).map_err(|e| ConfigError::BadOperatorKey(e.to_string()))?;
        Ok(Some(sk))
    }
}

fn default_rpc_bind() -> String {
    "127.0.0.1:8332".to_string()
}

/// `[rpc]`: transport is out of scope (spec §1), but the bind address and
/// the kill-switch RPC's auth toggle still need a home in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfigSection {
    #[serde(default = "default_rpc_bind")]
    pub bind: String,
    #[serde(default)]
    pub authorized_only: bool,
}

impl Default for RpcConfigSection {
    fn default() -> Self {
        RpcConfigSection { bind: default_rpc_bind(), authorized_only: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub consensus: ConsensusConfigSection,
    #[serde(default)]
    pub btcspv: BtcSpvConfigSection,
    #[serde(default)]
    pub masternode: MasternodeConfigSection,
    #[serde(default)]
    pub rpc: RpcConfigSection,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn consensus_network(&self) -> Network {
        self.network.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_every_default() {
        let cfg = NodeConfig::from_toml_str(
            r#"
            network = "regtest"
            data_dir = "/tmp/bathron-regtest"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.network, NetworkConfig::Regtest);
        assert!(cfg.consensus.btcburnsenabled);
        assert!(!cfg.consensus.enablemint);
        assert!(!cfg.btcspv.btcheaderspublish);
        assert_eq!(cfg.btcspv.clamped_publish_interval(), 60);
        assert_eq!(cfg.rpc.bind, "127.0.0.1:8332");
        assert!(cfg.masternode.mnoperatorprivatekey.is_none());
    }

    #[test]
    fn publish_interval_clamps_to_bounds() {
        let mut section = BtcSpvConfigSection::default();
        section.btcpublishinterval = 2;
        assert_eq!(section.clamped_publish_interval(), 10);
        section.btcpublishinterval = 10_000;
        assert_eq!(section.clamped_publish_interval(), 600);
        section.btcpublishinterval = 120;
        assert_eq!(section.clamped_publish_interval(), 120);
    }

    #[test]
    fn full_config_round_trips_every_section() {
        let toml_str = r#"
            network = "mainnet"
            data_dir = "/var/lib/bathron"

            [consensus]
            btcburnsenabled = false
            enablemint = true

            [btcspv]
            btcheaderspublish = true
            btcpublishinterval = 45

            [masternode]
            mn_produce_delay = 3
            mnoperatorprivatekey = "1111111111111111111111111111111111111111111111111111111111111111"

            [rpc]
            bind = "0.0.0.0:9332"
            authorized_only = true
        "#;
        let result = NodeConfig::from_toml_str(toml_str);
        assert!(result.is_ok());
        let cfg = result.unwrap();
        assert!(!cfg.consensus.btcburnsenabled);
        assert!(cfg.consensus.enablemint);
        assert!(cfg.btcspv.btcheaderspublish);
        assert_eq!(cfg.btcspv.btcpublishinterval, 45);
        assert_eq!(cfg.masternode.mn_produce_delay, 3);
        assert_eq!(cfg.rpc.bind, "0.0.0.0:9332");
        assert!(cfg.rpc.authorized_only);
    }

    #[test]
    fn operator_secret_key_parses_valid_hex() {
        let mut section = MasternodeConfigSection::default();
        section.mnoperatorprivatekey = Some("11".repeat(32));
        let sk = section.operator_secret_key().unwrap();
        assert!(sk.is_some());
    }

    #[test]
    fn operator_secret_key_rejects_wrong_length() {
        let mut section = MasternodeConfigSection::default();
        section.mnoperatorprivatekey = Some("1111".to_string());
        assert!(matches!(section.operator_secret_key(), Err(ConfigError::BadOperatorKey(_))));
    }
}
