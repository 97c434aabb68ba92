// Copyright 2025 Stairwell, Inc.
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

//! Node metadata consumed by the connection resolver.

use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Read-only view of the node inventory.
///
/// Only the metadata needed to reach a node is exposed; how it is stored or
/// fetched is up to the implementation.
pub trait Inventory: Send + Sync {
    fn host_ip_of(&self, node: &str) -> Option<String>;
    fn private_ips_of(&self, node: &str) -> Option<Vec<String>>;
    fn hostname_of(&self, node: &str) -> Option<String>;
    fn gateway_of(&self, node: &str) -> Option<String>;
    fn gateway_user_of(&self, node: &str) -> Option<String>;
    fn host_keys_of(&self, node: &str) -> Option<Vec<String>>;

    fn ssh_port_of(&self, _node: &str) -> u16 {
        DEFAULT_SSH_PORT
    }

    /// Extra `Host` aliases, on top of the generated `fleet.<node>` one.
    fn ssh_aliases_of(&self, _node: &str) -> Vec<String> {
        Vec::new()
    }

    fn description_of(&self, _node: &str) -> Option<String> {
        None
    }

    /// Whether the node only accepts password authentication.
    fn password_auth_of(&self, _node: &str) -> bool {
        false
    }

    fn known_nodes(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeMetadata {
    pub host_ip: Option<String>,
    pub private_ips: Option<Vec<String>>,
    pub hostname: Option<String>,
    pub gateway: Option<String>,
    pub gateway_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub host_keys: Option<Vec<String>>,
    pub ssh_aliases: Vec<String>,
    pub description: Option<String>,
    pub password_auth: bool,
}

/// Inventory stored as a TOML document with one `[nodes.<id>]` table per
/// node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlInventory {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeMetadata>,
}

impl TomlInventory {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Error::io(path))?;
        Self::parse(&text).map_err(|e| e.in_file(path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn insert(&mut self, node: impl Into<String>, metadata: NodeMetadata) {
        self.nodes.insert(node.into(), metadata);
    }

    fn get(&self, node: &str) -> Option<&NodeMetadata> {
        self.nodes.get(node)
    }
}

impl Inventory for TomlInventory {
    fn host_ip_of(&self, node: &str) -> Option<String> {
        self.get(node)?.host_ip.clone()
    }

    fn private_ips_of(&self, node: &str) -> Option<Vec<String>> {
        self.get(node)?.private_ips.clone()
    }

    fn hostname_of(&self, node: &str) -> Option<String> {
        self.get(node)?.hostname.clone()
    }

    fn gateway_of(&self, node: &str) -> Option<String> {
        self.get(node)?.gateway.clone()
    }

    fn gateway_user_of(&self, node: &str) -> Option<String> {
        self.get(node)?.gateway_user.clone()
    }

    fn host_keys_of(&self, node: &str) -> Option<Vec<String>> {
        self.get(node)?.host_keys.clone()
    }

    fn ssh_port_of(&self, node: &str) -> u16 {
        self.get(node)
            .and_then(|m| m.ssh_port)
            .unwrap_or(DEFAULT_SSH_PORT)
    }

    fn ssh_aliases_of(&self, node: &str) -> Vec<String> {
        self.get(node)
            .map(|m| m.ssh_aliases.clone())
            .unwrap_or_default()
    }

    fn description_of(&self, node: &str) -> Option<String> {
        self.get(node)?.description.clone()
    }

    fn password_auth_of(&self, node: &str) -> bool {
        self.get(node).is_some_and(|m| m.password_auth)
    }

    fn known_nodes(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}
