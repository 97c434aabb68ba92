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

//! Connection rules: ordered per-node connection transforms and gateway
//! definitions, registered in code or loaded from a TOML rules file.

use std::{
    fs,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// How to reach one node. `host` is `None` until something provides an
/// address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: Option<String>,
    pub user: String,
    pub gateway: Option<String>,
    pub gateway_user: Option<String>,
}

/// Receives the node id and the current connection info, returns the
/// replacement.
pub type Transform = Arc<dyn Fn(&str, ConnectionInfo) -> ConnectionInfo + Send + Sync>;

#[derive(Debug, Clone)]
pub enum NodeSelector {
    All,
    Exact(Vec<String>),
    Pattern(Regex),
}

impl NodeSelector {
    pub fn matches(&self, node: &str) -> bool {
        match self {
            NodeSelector::All => true,
            NodeSelector::Exact(nodes) => nodes.iter().any(|n| n == node),
            NodeSelector::Pattern(re) => re.is_match(node),
        }
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(NodeSelector::Pattern)
            .map_err(|e| Error::Config(format!("bad node pattern {:?}: {}", pattern, e)))
    }
}

impl From<&str> for NodeSelector {
    fn from(node: &str) -> Self {
        NodeSelector::Exact(vec![node.to_string()])
    }
}

struct TransformRule {
    selector: NodeSelector,
    transform: Transform,
}

#[derive(Debug, Clone)]
struct GatewayRule {
    selector: NodeSelector,
    name: String,
    template: String,
}

/// Registered transforms and gateways, each list behind its own lock.
#[derive(Default)]
pub struct ConnectionRules {
    transforms: RwLock<Vec<TransformRule>>,
    gateways: RwLock<Vec<GatewayRule>>,
}

impl ConnectionRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transform(
        &self,
        selector: NodeSelector,
        transform: impl Fn(&str, ConnectionInfo) -> ConnectionInfo + Send + Sync + 'static,
    ) {
        self.transforms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TransformRule {
                selector,
                transform: Arc::new(transform),
            });
    }

    /// `template` is an ssh_config snippet; `{ssh_exec}` and `{user}` are
    /// substituted when rendered.
    pub fn add_gateway(
        &self,
        selector: NodeSelector,
        name: impl Into<String>,
        template: impl Into<String>,
    ) {
        self.gateways
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(GatewayRule {
                selector,
                name: name.into(),
                template: template.into(),
            });
    }

    /// Applies every transform selecting `node`, in registration order.
    ///
    /// Transforms run without the lock held and may register further rules;
    /// those apply from the next call on.
    pub fn apply_transforms(&self, node: &str, mut info: ConnectionInfo) -> ConnectionInfo {
        let selected: Vec<Transform> = self
            .transforms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.selector.matches(node))
            .map(|r| r.transform.clone())
            .collect();
        for transform in selected {
            info = transform(node, info);
        }
        info
    }

    pub fn gateway_names(&self) -> Vec<String> {
        let gateways = self.gateways.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = Vec::new();
        for gateway in gateways.iter() {
            if !names.contains(&gateway.name) {
                names.push(gateway.name.clone());
            }
        }
        names
    }

    /// Renders the gateway definitions named `name` that select at least one
    /// of `nodes`.
    pub fn gateway_blocks(&self, name: &str, nodes: &[String], ssh_exec: &str, user: &str) -> String {
        let gateways = self.gateways.read().unwrap_or_else(PoisonError::into_inner);
        gateways
            .iter()
            .filter(|g| g.name == name && nodes.iter().any(|n| g.selector.matches(n)))
            .map(|g| {
                let mut block = g
                    .template
                    .replace("{ssh_exec}", ssh_exec)
                    .replace("{user}", user);
                if !block.ends_with('\n') {
                    block.push('\n');
                }
                block
            })
            .collect()
    }

    /// Registers the gateways and transforms of a rules file, in file order.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(Error::io(path))?;
        self.load_str(&text)
            .map_err(|e| e.in_file(path))
    }

    /// Registers nothing unless the whole file is valid.
    pub fn load_str(&self, text: &str) -> Result<()> {
        let file: RulesFile = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        let gateways = file
            .gateway
            .into_iter()
            .map(|g| -> Result<_> { Ok((g.nodes.compile()?, g.name, g.template)) })
            .collect::<Result<Vec<_>>>()?;
        let transforms = file
            .transform
            .into_iter()
            .map(|t| -> Result<_> { Ok((t.nodes.compile()?, t)) })
            .collect::<Result<Vec<_>>>()?;
        for (selector, name, template) in gateways {
            self.add_gateway(selector, name, template);
        }
        for (selector, transform) in transforms {
            self.add_transform(selector, move |node, info| transform.apply(node, info));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    gateway: Vec<GatewaySpec>,
    #[serde(default)]
    transform: Vec<TransformSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectorSpec {
    Keyword(String),
    List(Vec<String>),
    Pattern { pattern: String },
}

impl Default for SelectorSpec {
    fn default() -> Self {
        SelectorSpec::Keyword("all".into())
    }
}

impl SelectorSpec {
    fn compile(&self) -> Result<NodeSelector> {
        match self {
            SelectorSpec::Keyword(k) if k == "all" => Ok(NodeSelector::All),
            SelectorSpec::Keyword(node) => Ok(NodeSelector::Exact(vec![node.clone()])),
            SelectorSpec::List(nodes) => Ok(NodeSelector::Exact(nodes.clone())),
            SelectorSpec::Pattern { pattern } => NodeSelector::pattern(pattern),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewaySpec {
    name: String,
    #[serde(default)]
    nodes: SelectorSpec,
    template: String,
}

/// Declarative transform. `host` may contain `{node}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformSpec {
    #[serde(default)]
    nodes: SelectorSpec,
    host: Option<String>,
    host_suffix: Option<String>,
    user: Option<String>,
    gateway: Option<String>,
    gateway_user: Option<String>,
}

impl TransformSpec {
    fn apply(&self, node: &str, mut info: ConnectionInfo) -> ConnectionInfo {
        if let Some(host) = &self.host {
            info.host = Some(host.replace("{node}", node));
        }
        if let Some(suffix) = &self.host_suffix {
            info.host = info.host.map(|h| format!("{}{}", h, suffix));
        }
        if let Some(user) = &self.user {
            info.user = user.clone();
        }
        if let Some(gateway) = &self.gateway {
            info.gateway = Some(gateway.clone());
        }
        if let Some(gateway_user) = &self.gateway_user {
            info.gateway_user = Some(gateway_user.clone());
        }
        info
    }
}
