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

//! Generation of the ssh client configuration and known-hosts files used by
//! a workspace.

use std::{fmt, path::Path};

use crate::resolver::{ConnectionResolver, ResolvedNode};

pub const ALIAS_PREFIX: &str = "fleet.";

/// `Host` alias under which a node appears in generated configs.
pub fn ssh_alias(node: &str) -> String {
    format!("{}{}", ALIAS_PREFIX, node)
}

/// What the config needs to know about one node.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub node: String,
    /// `None` for nodes without an address.
    pub resolved: Option<ResolvedNode>,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub password_auth: bool,
    pub host_keys: Vec<String>,
}

impl HostEntry {
    pub fn collect(resolver: &ConnectionResolver<'_>, node: &str) -> Self {
        let inventory = resolver.inventory();
        let mut aliases = vec![ssh_alias(node)];
        for alias in inventory.ssh_aliases_of(node) {
            if !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
        HostEntry {
            node: node.into(),
            resolved: resolver.resolve(node).ok(),
            aliases,
            description: inventory.description_of(node),
            password_auth: inventory.password_auth_of(node),
            host_keys: inventory.host_keys_of(node).unwrap_or_default(),
        }
    }
}

pub struct ClientConfig<'a> {
    /// Rendered gateway definitions, placed first.
    pub gateways: String,
    /// Sorted by node id.
    pub entries: &'a [HostEntry],
    /// Used for `ProxyCommand`s through gateways.
    pub ssh_exec: &'a str,
    pub default_user: &'a str,
    /// `None` when control masters are disabled.
    pub control_path: Option<String>,
    pub known_hosts: Option<&'a Path>,
    pub strict_host_key_checking: bool,
}

impl fmt::Display for ClientConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "############\n# GATEWAYS #\n############\n")?;
        if !self.gateways.is_empty() {
            writeln!(f, "{}", self.gateways)?;
        }
        writeln!(f, "#############\n# ENDPOINTS #\n#############\n")?;
        for entry in self.entries {
            let Some(resolved) = &entry.resolved else {
                writeln!(f, "# {} - Not connectable\n", entry.node)?;
                continue;
            };
            write!(f, "# {} - {}", entry.node, resolved.host)?;
            if let Some(description) = &entry.description {
                write!(f, " - {}", description)?;
            }
            writeln!(f)?;
            writeln!(f, "Host {}", entry.aliases.join(" "))?;
            writeln!(f, "  Hostname {}", resolved.host)?;
            writeln!(f, "  User \"{}\"", resolved.user)?;
            if resolved.port != crate::inventory::DEFAULT_SSH_PORT {
                writeln!(f, "  Port {}", resolved.port)?;
            }
            if let Some(gateway) = &resolved.gateway {
                match &resolved.gateway_user {
                    Some(gateway_user) => writeln!(
                        f,
                        "  ProxyCommand {} -q -W %h:%p {}@{}",
                        self.ssh_exec, gateway_user, gateway
                    )?,
                    None => writeln!(f, "  ProxyCommand {} -q -W %h:%p {}", self.ssh_exec, gateway)?,
                }
            }
            if entry.password_auth {
                writeln!(f, "  PreferredAuthentications password")?;
                writeln!(f, "  PubkeyAuthentication no")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "Host *")?;
        writeln!(f, "  User \"{}\"", self.default_user)?;
        if let Some(control_path) = &self.control_path {
            writeln!(f, "  ControlPath {}", control_path)?;
        }
        if let Some(known_hosts) = self.known_hosts {
            writeln!(f, "  UserKnownHostsFile {}", known_hosts.display())?;
        }
        if !self.strict_host_key_checking {
            writeln!(f, "  StrictHostKeyChecking no")?;
        }
        Ok(())
    }
}

/// known_hosts lines for every connectable entry with recorded host keys.
pub fn known_hosts(entries: &[HostEntry]) -> String {
    let mut text = String::new();
    for entry in entries {
        let Some(resolved) = &entry.resolved else {
            continue;
        };
        let host = if resolved.port == crate::inventory::DEFAULT_SSH_PORT {
            resolved.host.clone()
        } else {
            format!("[{}]:{}", resolved.host, resolved.port)
        };
        for key in &entry.host_keys {
            text.push_str(&format!("{} {}\n", host, key.trim()));
        }
    }
    text
}
