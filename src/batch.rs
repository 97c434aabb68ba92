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

//! Connects to a batch of nodes: one workspace around the whole batch, one
//! control master per node acquired in parallel, and every acquired master
//! released on the way out.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    exec::{CommandLine, CommandOutput, CommandRunner, RunOptions},
    inventory::Inventory,
    resolver::{ConnectionResolver, ResolvedNode},
    rules::ConnectionRules,
    settings::Settings,
    ssh_cmd,
    ssh_mux::{
        config::ssh_alias,
        workspace::{Workspace, WorkspaceRegistry},
        ControlMasters, MasterTarget, OwnerToken,
    },
};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Drop nodes that cannot be reached instead of failing the batch.
    pub lenient: bool,
    /// Bound for each ssh command.
    pub timeout: Option<Duration>,
    /// Overrides `Settings::max_threads`.
    pub max_threads: Option<usize>,
}

/// Entry point tying settings, inventory, rules and the command runner
/// together.
pub struct Connector {
    settings: Settings,
    inventory: Arc<dyn Inventory>,
    runner: Arc<dyn CommandRunner>,
    rules: Arc<ConnectionRules>,
    masters: ControlMasters,
    workspaces: WorkspaceRegistry,
}

impl Connector {
    pub fn new(
        settings: Settings,
        inventory: Arc<dyn Inventory>,
        runner: Arc<dyn CommandRunner>,
        rules: Arc<ConnectionRules>,
    ) -> Result<Self> {
        let masters = ControlMasters::new(&settings, runner.clone())?;
        if let Some(name) = &settings.ssh_gateways_conf {
            if !rules.gateway_names().contains(name) {
                warn!("no gateway definitions named {:?}; configs will have no gateways", name);
            }
        }
        Ok(Connector {
            settings,
            inventory,
            runner,
            rules,
            masters,
            workspaces: WorkspaceRegistry::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn rules(&self) -> &ConnectionRules {
        &self.rules
    }

    pub fn masters(&self) -> &ControlMasters {
        &self.masters
    }

    pub fn workspaces(&self) -> &WorkspaceRegistry {
        &self.workspaces
    }

    pub fn resolver(&self) -> ConnectionResolver<'_> {
        ConnectionResolver::new(&self.settings, self.inventory.as_ref(), &self.rules)
    }

    /// Generated ssh configuration for `nodes`, as a batch would see it.
    pub fn ssh_config(&self, nodes: &[String]) -> Result<String> {
        let resolver = self.resolver();
        self.workspaces
            .with_workspace(&resolver, nodes, |ws| Ok(ws.render_config(&resolver)))
    }

    /// Runs `f` with the nodes that could be connected to.
    ///
    /// In strict mode the first failing node aborts the batch before `f` runs;
    /// in lenient mode failing nodes are left out. Masters acquired here are
    /// released when this returns, with the token that acquired them.
    pub fn with_connection_to<T, F>(&self, nodes: &[String], options: &BatchOptions, f: F) -> Result<T>
    where
        F: FnOnce(&Session<'_>) -> Result<T>,
    {
        let resolver = self.resolver();
        self.workspaces.with_workspace(&resolver, nodes, |workspace| {
            let mut reachable = Vec::new();
            for node in workspace.nodes() {
                match resolver.resolve(node) {
                    Ok(resolved) => reachable.push(resolved),
                    Err(e) if options.lenient => warn!("{}; skipping", e),
                    Err(e) => return Err(e),
                }
            }

            let workers = options
                .max_threads
                .unwrap_or(self.settings.max_threads)
                .clamp(1, reachable.len().max(1));
            let held = HeldMasters {
                masters: &self.masters,
                timeout: options.timeout.or(self.settings.command_timeout),
                workers,
                entries: Mutex::new(Vec::new()),
            };
            let connected = if self.masters.enabled() {
                self.acquire_all(reachable, workspace, options, &held, workers)?
            } else {
                reachable
            };
            let session = Session {
                connector: self,
                workspace,
                nodes: connected,
            };
            f(&session)
        })
    }

    fn acquire_all(
        &self,
        reachable: Vec<ResolvedNode>,
        workspace: &Workspace,
        options: &BatchOptions,
        held: &HeldMasters<'_>,
        workers: usize,
    ) -> Result<Vec<ResolvedNode>> {
        let abort = AtomicBool::new(false);
        let ssh_exec = workspace.ssh_exec();
        let outcomes = run_bounded(reachable, workers, |resolved| {
            if abort.load(Ordering::SeqCst) {
                return None;
            }
            let target = MasterTarget::new(&resolved, &ssh_exec, self.batch_mode(workspace, &resolved.node));
            let token = OwnerToken::generate();
            match self.masters.acquire(&target, &token, held.timeout) {
                Ok(()) => {
                    held.push(target, token);
                    Some(Ok(resolved))
                }
                Err(e) => {
                    if !options.lenient {
                        abort.store(true, Ordering::SeqCst);
                    }
                    Some(Err(e))
                }
            }
        });

        let mut connected = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(resolved) => connected.push(resolved),
                Err(e) if options.lenient => warn!("{}; skipping", e),
                Err(e) => return Err(e),
            }
        }
        connected.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(connected)
    }

    fn batch_mode(&self, workspace: &Workspace, node: &str) -> bool {
        !workspace.entry(node).is_some_and(|e| e.password_auth)
    }
}

/// Masters acquired by a batch, released on drop.
struct HeldMasters<'a> {
    masters: &'a ControlMasters,
    timeout: Option<Duration>,
    workers: usize,
    entries: Mutex<Vec<(MasterTarget, OwnerToken)>>,
}

impl HeldMasters<'_> {
    fn push(&self, target: MasterTarget, token: OwnerToken) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, token));
    }
}

impl Drop for HeldMasters<'_> {
    fn drop(&mut self) {
        let entries = std::mem::take(
            self.entries
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if entries.is_empty() {
            return;
        }
        debug!("releasing {} control master(s)", entries.len());
        run_bounded(entries, self.workers, |(target, token)| {
            if let Err(e) = self.masters.release(&target, &token, self.timeout) {
                warn!("[{}] failed to release control master: {}", target.node, e);
            }
            None::<()>
        });
    }
}

/// Feeds `items` to at most `workers` threads and collects what `task`
/// returns, in completion order.
fn run_bounded<T, R, F>(items: Vec<T>, workers: usize, task: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Option<R> + Sync,
{
    let queue = Mutex::new(items.into_iter());
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            let tx = tx.clone();
            let (queue, task) = (&queue, &task);
            scope.spawn(move || loop {
                let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                let Some(item) = next else {
                    break;
                };
                if let Some(result) = task(item) {
                    let _ = tx.send(result);
                }
            });
        }
    });
    drop(tx);
    rx.into_iter().collect()
}

/// What the caller of [`Connector::with_connection_to`] gets to work with.
pub struct Session<'a> {
    connector: &'a Connector,
    workspace: &'a Workspace,
    nodes: Vec<ResolvedNode>,
}

impl Session<'_> {
    /// Connected node ids, sorted.
    pub fn nodes(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node.as_str()).collect()
    }

    pub fn workspace(&self) -> &Workspace {
        self.workspace
    }

    /// ssh command running `remote_command` on `node`, `None` if the node is
    /// not part of the session.
    pub fn command(&self, node: &str, remote_command: &str) -> Option<CommandLine> {
        self.nodes.iter().find(|n| n.node == node)?;
        Some(ssh_cmd::remote(
            &self.workspace.ssh_exec(),
            &ssh_alias(node),
            self.connector.batch_mode(self.workspace, node),
            remote_command,
        ))
    }

    pub fn run(&self, node: &str, remote_command: &str, options: &RunOptions) -> Result<CommandOutput> {
        let command = self
            .command(node, remote_command)
            .ok_or_else(|| Error::NotConnectable { node: node.into() })?;
        Ok(self.connector.runner.run(&command, options)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn run_bounded_never_exceeds_worker_count() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let results = run_bounded((0..20).collect(), 3, |i: i32| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            (i % 2 == 0).then_some(i)
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let mut results = results;
        results.sort();
        assert_eq!(results, (0..20).filter(|i| i % 2 == 0).collect::<Vec<_>>());
    }

    #[test]
    fn run_bounded_with_no_items() {
        let results: Vec<()> = run_bounded(Vec::<()>::new(), 4, |_| Some(()));
        assert!(results.is_empty());
    }
}
