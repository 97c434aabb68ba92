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

//! Ephemeral per-batch directories holding the generated ssh configuration,
//! a wrapper around ssh that uses it, and a known-hosts file.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tempfile::TempDir;

use super::{
    config::{self, ClientConfig, HostEntry},
    control_path_template,
};
use crate::{
    error::{Error, Result},
    exec::find_executable,
    resolver::ConnectionResolver,
};

const WRAPPER_NAME: &str = "ssh";
const CONFIG_NAME: &str = "ssh_config";
const KNOWN_HOSTS_NAME: &str = "known_hosts";

/// A generated workspace. The directory and its contents are removed by
/// `drop`.
pub struct Workspace {
    dir: TempDir,
    nodes: Vec<String>,
    entries: Vec<HostEntry>,
    known_hosts: Option<PathBuf>,
}

impl Workspace {
    fn create(resolver: &ConnectionResolver<'_>, nodes: &[String]) -> Result<Self> {
        let settings = resolver.settings();
        let mut nodes = nodes.to_vec();
        nodes.sort();
        nodes.dedup();
        let entries: Vec<HostEntry> = nodes
            .iter()
            .map(|node| HostEntry::collect(resolver, node))
            .collect();

        let sshpass = if entries.iter().any(|e| e.password_auth && e.resolved.is_some()) {
            let found = find_executable(&settings.sshpass_exec).ok_or_else(|| {
                Error::MissingDependency {
                    name: settings.sshpass_exec.display().to_string(),
                }
            })?;
            Some(found)
        } else {
            None
        };

        let mut builder = tempfile::Builder::new();
        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            builder.permissions(Permissions::from_mode(0o700));
        }
        let dir = builder
            .prefix("fleetmux-")
            .tempdir()
            .map_err(Error::io(std::env::temp_dir()))?;

        let mut workspace = Workspace {
            dir,
            nodes,
            entries,
            known_hosts: None,
        };
        if settings.strict_host_key_checking {
            let path = workspace.path().join(KNOWN_HOSTS_NAME);
            fs::write(&path, config::known_hosts(&workspace.entries)).map_err(Error::io(&path))?;
            workspace.known_hosts = Some(path);
        }
        workspace.write_wrapper(&settings.ssh_exec, sshpass.as_deref())?;
        let config_path = workspace.config_path();
        let text = workspace.render_config(resolver);
        fs::write(&config_path, text).map_err(Error::io(&config_path))?;
        Ok(workspace)
    }

    fn write_wrapper(&self, ssh_exec: &Path, sshpass: Option<&Path>) -> Result<()> {
        let mut script = String::from("#!/bin/sh\nexec ");
        if let Some(sshpass) = sshpass {
            // Password comes from the SSHPASS environment variable.
            script.push_str(&format!("{} -e ", shell_quote(sshpass)));
        }
        script.push_str(&format!(
            "{} -F {} \"$@\"\n",
            shell_quote(ssh_exec),
            shell_quote(&self.config_path())
        ));
        let path = self.ssh_exec();
        fs::write(&path, script).map_err(Error::io(&path))?;
        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            fs::set_permissions(&path, Permissions::from_mode(0o755)).map_err(Error::io(&path))?;
        }
        Ok(())
    }

    /// Configuration text for this workspace's nodes.
    pub fn render_config(&self, resolver: &ConnectionResolver<'_>) -> String {
        let settings = resolver.settings();
        let ssh_exec = self.ssh_exec().display().to_string();
        let gateways = settings
            .ssh_gateways_conf
            .as_deref()
            .map(|name| {
                resolver
                    .rules()
                    .gateway_blocks(name, &self.nodes, &ssh_exec, &settings.ssh_user)
            })
            .unwrap_or_default();
        ClientConfig {
            gateways,
            entries: &self.entries,
            ssh_exec: &ssh_exec,
            default_user: &settings.ssh_user,
            control_path: settings
                .use_control_master
                .then(|| control_path_template(&settings.state_dir)),
            known_hosts: self.known_hosts.as_deref(),
            strict_host_key_checking: settings.strict_host_key_checking,
        }
        .to_string()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The wrapper to use in place of ssh.
    pub fn ssh_exec(&self) -> PathBuf {
        self.path().join(WRAPPER_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join(CONFIG_NAME)
    }

    pub fn known_hosts_path(&self) -> Option<&Path> {
        self.known_hosts.as_deref()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn entry(&self, node: &str) -> Option<&HostEntry> {
        self.entries.iter().find(|e| e.node == node)
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// Which workspaces currently cover each node, most recent last.
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    nodes: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a workspace for `nodes`, runs `f` with it, then removes it
    /// whatever `f` returned (or if it panicked).
    pub fn with_workspace<T, F>(
        &self,
        resolver: &ConnectionResolver<'_>,
        nodes: &[String],
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&Workspace) -> Result<T>,
    {
        let workspace = Workspace::create(resolver, nodes)?;
        let _registration = self.register(&workspace);
        log::debug!(
            "workspace {} ready for {} node(s)",
            workspace.path().display(),
            workspace.nodes().len()
        );
        f(&workspace)
    }

    /// The most recently entered workspace covering `node`.
    pub fn workspace_for(&self, node: &str) -> Option<PathBuf> {
        self.lock().get(node).and_then(|dirs| dirs.last().cloned())
    }

    pub fn workspaces_for(&self, node: &str) -> Vec<PathBuf> {
        self.lock().get(node).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PathBuf>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, workspace: &Workspace) -> Registration<'_> {
        let dir = workspace.path().to_path_buf();
        let mut nodes = self.lock();
        for node in workspace.nodes() {
            nodes.entry(node.clone()).or_default().push(dir.clone());
        }
        Registration {
            registry: self,
            dir,
            nodes: workspace.nodes().to_vec(),
        }
    }

    /// Removes only `dir`; entries already gone are fine.
    fn unregister(&self, dir: &Path, nodes: &[String]) {
        let mut map = self.lock();
        for node in nodes {
            if let Some(dirs) = map.get_mut(node) {
                dirs.retain(|d| d != dir);
                if dirs.is_empty() {
                    map.remove(node);
                }
            }
        }
    }
}

struct Registration<'a> {
    registry: &'a WorkspaceRegistry,
    dir: PathBuf,
    nodes: Vec<String>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.dir, &self.nodes);
        log::debug!("workspace {} released", self.dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        inventory::{NodeMetadata, TomlInventory},
        rules::ConnectionRules,
        settings::Settings,
    };

    fn inventory() -> TomlInventory {
        let mut inventory = TomlInventory::default();
        for (node, ip) in [("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")] {
            inventory.insert(
                node,
                NodeMetadata {
                    host_ip: Some(ip.into()),
                    host_keys: Some(vec![format!("ssh-ed25519 KEY{}", node)]),
                    ..Default::default()
                },
            );
        }
        inventory
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn writes_wrapper_config_and_known_hosts() {
        let (settings, inventory, rules) = (Settings::default(), inventory(), ConnectionRules::new());
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        let registry = WorkspaceRegistry::new();
        let dir = registry
            .with_workspace(&resolver, &nodes(&["b", "a"]), |ws| {
                let wrapper = fs::read_to_string(ws.ssh_exec()).unwrap();
                assert!(wrapper.starts_with("#!/bin/sh\nexec 'ssh' -F '"));
                assert!(wrapper.ends_with("ssh_config' \"$@\"\n"));
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = fs::metadata(ws.ssh_exec()).unwrap().permissions().mode();
                    assert_eq!(mode & 0o777, 0o755);
                }
                let config = fs::read_to_string(ws.config_path()).unwrap();
                let a = config.find("Host fleet.a").unwrap();
                let b = config.find("Host fleet.b").unwrap();
                assert!(a < b);
                let known_hosts = fs::read_to_string(ws.known_hosts_path().unwrap()).unwrap();
                assert_eq!(
                    known_hosts,
                    "10.0.0.1 ssh-ed25519 KEYa\n10.0.0.2 ssh-ed25519 KEYb\n"
                );
                Ok(ws.path().to_path_buf())
            })
            .unwrap();
        assert!(!dir.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn no_known_hosts_without_strict_checking() {
        let settings = Settings {
            strict_host_key_checking: false,
            ..Default::default()
        };
        let (inventory, rules) = (inventory(), ConnectionRules::new());
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        WorkspaceRegistry::new()
            .with_workspace(&resolver, &nodes(&["a"]), |ws| {
                assert!(ws.known_hosts_path().is_none());
                let config = fs::read_to_string(ws.config_path()).unwrap();
                assert!(config.contains("StrictHostKeyChecking no"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn nested_workspaces_unwind_in_order() {
        let (settings, inventory, rules) = (Settings::default(), inventory(), ConnectionRules::new());
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        let registry = WorkspaceRegistry::new();
        let outer_result = registry.with_workspace(&resolver, &nodes(&["a", "b"]), |outer| {
            assert_eq!(registry.workspace_for("a").as_deref(), Some(outer.path()));
            let inner_result: Result<()> =
                registry.with_workspace(&resolver, &nodes(&["b", "c"]), |inner| {
                    assert_eq!(registry.workspace_for("b").as_deref(), Some(inner.path()));
                    assert_eq!(registry.workspaces_for("b").len(), 2);
                    assert_eq!(registry.workspace_for("a").as_deref(), Some(outer.path()));
                    Err(Error::Config("inner failure".into()))
                });
            assert!(inner_result.is_err());
            assert_eq!(registry.workspace_for("b").as_deref(), Some(outer.path()));
            assert_eq!(registry.workspace_for("c"), None);
            Ok(())
        });
        assert!(outer_result.is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn cleanup_survives_a_panic() {
        let (settings, inventory, rules) = (Settings::default(), inventory(), ConnectionRules::new());
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        let registry = WorkspaceRegistry::new();
        let dir = std::sync::Mutex::new(None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = registry.with_workspace(&resolver, &nodes(&["a"]), |ws| {
                *dir.lock().unwrap() = Some(ws.path().to_path_buf());
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(!dir.lock().unwrap().take().unwrap().exists());
    }

    #[test]
    fn password_nodes_need_sshpass() {
        let settings = Settings {
            sshpass_exec: "fleetmux-no-such-sshpass".into(),
            ..Default::default()
        };
        let mut inventory = inventory();
        inventory.insert(
            "p",
            NodeMetadata {
                host_ip: Some("10.0.0.9".into()),
                password_auth: true,
                ..Default::default()
            },
        );
        let rules = ConnectionRules::new();
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        let registry = WorkspaceRegistry::new();
        let err = registry
            .with_workspace(&resolver, &nodes(&["a", "p"]), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::MissingDependency { name } if name == "fleetmux-no-such-sshpass"));
        assert!(registry.is_empty());
    }

    #[test]
    fn password_nodes_wrap_ssh_with_sshpass() {
        let settings = Settings {
            sshpass_exec: "sh".into(),
            ..Default::default()
        };
        let mut inventory = inventory();
        inventory.insert(
            "p",
            NodeMetadata {
                host_ip: Some("10.0.0.9".into()),
                password_auth: true,
                ..Default::default()
            },
        );
        let rules = ConnectionRules::new();
        let resolver = ConnectionResolver::new(&settings, &inventory, &rules);
        WorkspaceRegistry::new()
            .with_workspace(&resolver, &nodes(&["p"]), |ws| {
                let wrapper = fs::read_to_string(ws.ssh_exec()).unwrap();
                assert!(wrapper.contains("/sh' -e 'ssh' -F"));
                Ok(())
            })
            .unwrap();
    }
}
