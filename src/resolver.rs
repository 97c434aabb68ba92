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

//! Computes how to reach a node from inventory metadata and connection rules.

use crate::{
    error::{Error, Result},
    inventory::Inventory,
    rules::{ConnectionInfo, ConnectionRules},
    settings::Settings,
    ssh_mux::MasterKey,
};

/// A node with a known address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub node: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub gateway: Option<String>,
    pub gateway_user: Option<String>,
}

impl ResolvedNode {
    pub fn master_key(&self) -> MasterKey {
        MasterKey::new(&self.host, self.port, &self.user)
    }
}

/// Nothing is cached: every call reads the inventory and runs the transforms
/// again.
pub struct ConnectionResolver<'a> {
    settings: &'a Settings,
    inventory: &'a dyn Inventory,
    rules: &'a ConnectionRules,
}

impl<'a> ConnectionResolver<'a> {
    pub fn new(settings: &'a Settings, inventory: &'a dyn Inventory, rules: &'a ConnectionRules) -> Self {
        ConnectionResolver {
            settings,
            inventory,
            rules,
        }
    }

    pub fn settings(&self) -> &'a Settings {
        self.settings
    }

    pub fn inventory(&self) -> &'a dyn Inventory {
        self.inventory
    }

    pub fn rules(&self) -> &'a ConnectionRules {
        self.rules
    }

    /// Connection info after transforms; `host` stays `None` for nodes
    /// without any address.
    pub fn connection_info(&self, node: &str) -> ConnectionInfo {
        let host = self
            .inventory
            .host_ip_of(node)
            .or_else(|| {
                self.inventory
                    .private_ips_of(node)
                    .and_then(|ips| ips.into_iter().next())
            })
            .or_else(|| self.inventory.hostname_of(node));
        let gateway = self.inventory.gateway_of(node);
        let gateway_user = gateway.as_ref().map(|_| {
            self.inventory
                .gateway_user_of(node)
                .unwrap_or_else(|| self.settings.ssh_gateway_user.clone())
        });
        let info = ConnectionInfo {
            host,
            user: self.settings.ssh_user.clone(),
            gateway,
            gateway_user,
        };
        self.rules.apply_transforms(node, info)
    }

    pub fn resolve(&self, node: &str) -> Result<ResolvedNode> {
        let info = self.connection_info(node);
        let Some(host) = info.host else {
            return Err(Error::NotConnectable { node: node.into() });
        };
        Ok(ResolvedNode {
            node: node.into(),
            host,
            port: self.inventory.ssh_port_of(node),
            user: info.user,
            gateway: info.gateway,
            gateway_user: info.gateway_user,
        })
    }
}
