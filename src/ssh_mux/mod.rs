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

//! Shared SSH control masters.
//!
//! One master exists per (host, port, user). Every borrower registers an
//! [`OwnerToken`] in the master's owner file; the first one creates the master
//! and the last one to leave tears it down. Creation, validation and teardown
//! all happen while the owner file lock is held, so two threads or processes
//! can never both decide to create the same master.

pub mod config;
pub mod counter;
pub mod workspace;

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use regex::Regex;

use crate::{
    error::{Error, Result},
    exec::{CommandLine, CommandOutput, CommandRunner, RunOptions},
    interactive::{BackgroundTask, Prompt, StdinPrompt},
    resolver::ResolvedNode,
    settings::Settings,
    ssh_cmd,
};
pub use counter::{CounterFile, OwnerToken};

/// Identifies one control master.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MasterKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl MasterKey {
    pub fn new(host: &str, port: u16, user: &str) -> Self {
        MasterKey {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Must agree with [`control_path_template`] once ssh expands it.
    pub fn socket_path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(format!("mux_{}_{}_{}", self.host, self.port, self.user))
    }

    pub fn owners_path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(format!("mux_{}_{}_{}.owners", self.host, self.port, self.user))
    }
}

/// `ControlPath` value for the generated client config.
pub fn control_path_template(state_dir: &Path) -> String {
    state_dir.join("mux_%h_%p_%r").display().to_string()
}

/// Everything needed to drive the master of one node.
#[derive(Debug, Clone)]
pub struct MasterTarget {
    pub node: String,
    /// `Host` alias of the node in the generated config.
    pub alias: String,
    pub key: MasterKey,
    /// ssh, or the workspace wrapper around it.
    pub ssh_exec: PathBuf,
    /// False for nodes that authenticate with a password.
    pub batch_mode: bool,
}

impl MasterTarget {
    pub fn new(resolved: &ResolvedNode, ssh_exec: &Path, batch_mode: bool) -> Self {
        MasterTarget {
            node: resolved.node.clone(),
            alias: config::ssh_alias(&resolved.node),
            key: resolved.master_key(),
            ssh_exec: ssh_exec.to_path_buf(),
            batch_mode,
        }
    }
}

pub struct ControlMasters {
    runner: Arc<dyn CommandRunner>,
    state_dir: PathBuf,
    enabled: bool,
    boot_retries: u32,
    boot_retry_delay: Duration,
    booting_up: Regex,
    prompt: Option<Arc<dyn Prompt>>,
    prompting: Mutex<()>,
}

impl ControlMasters {
    pub fn new(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let booting_up = Regex::new(ssh_cmd::BOOTING_UP_SIGNATURE)
            .map_err(|e| Error::Config(format!("boot signature: {}", e)))?;
        Ok(ControlMasters {
            runner,
            state_dir: settings.state_dir.clone(),
            enabled: settings.use_control_master,
            boot_retries: settings.boot_retries,
            boot_retry_delay: settings.boot_retry_delay,
            booting_up,
            prompt: settings
                .interactive
                .then(|| Arc::new(StdinPrompt) as Arc<dyn Prompt>),
            prompting: Mutex::new(()),
        })
    }

    /// Enables the interactive fallback with a custom prompt.
    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn counter(&self, key: &MasterKey) -> CounterFile {
        CounterFile::new(key.owners_path(&self.state_dir))
    }

    pub fn owners(&self, key: &MasterKey) -> Result<Vec<String>> {
        self.counter(key).owners()
    }

    /// Makes sure a working master exists for `target` and registers `token`
    /// as one of its owners.
    pub fn acquire(
        &self,
        target: &MasterTarget,
        token: &OwnerToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let socket = target.key.socket_path(&self.state_dir);
        self.counter(&target.key).with_lock(token, |owners, token| {
            if !owners.is_empty() && !socket.exists() {
                warn!(
                    "[{}] {} owner(s) recorded but control socket {} is missing; resetting owners",
                    target.node,
                    owners.len(),
                    socket.display()
                );
                owners.clear();
            }
            if owners.is_empty() {
                if socket.exists() {
                    warn!(
                        "[{}] removing stale control socket {}",
                        target.node,
                        socket.display()
                    );
                    fs::remove_file(&socket).map_err(Error::io(&socket))?;
                }
                self.create(target, timeout)?;
            } else if self.check(target, timeout) {
                debug!(
                    "[{}] reusing control master ({} other owner(s)); new owner {}",
                    target.node,
                    owners.len(),
                    token
                );
            } else {
                warn!(
                    "[{}] control master check failed; replacing control socket {} for {}",
                    target.node,
                    socket.display(),
                    token
                );
                // ssh refuses to bind a master over an existing path.
                if let Err(e) = fs::remove_file(&socket) {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(Error::io(&socket)(e));
                    }
                }
                self.create(target, timeout)?;
                if !self.check(target, timeout) {
                    return Err(Error::ControlMasterCreationFailed {
                        node: target.node.clone(),
                        command: ssh_cmd::check_master(target).to_string(),
                        output: "recreated control master does not answer".into(),
                    });
                }
            }
            Ok(true)
        })?;
        Ok(())
    }

    /// Unregisters `token`; the last owner tears the master down.
    ///
    /// Teardown failures are logged only: the master is considered gone.
    pub fn release(
        &self,
        target: &MasterTarget,
        token: &OwnerToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.counter(&target.key).with_lock(token, |owners, token| {
            if !owners.iter().any(|o| o == token.as_str()) {
                debug!("[{}] {} does not own the control master", target.node, token);
                return Ok(false);
            }
            if owners.len() > 1 {
                debug!(
                    "[{}] keeping control master for {} other owner(s)",
                    target.node,
                    owners.len() - 1
                );
                return Ok(false);
            }
            let command = ssh_cmd::exit_master(target);
            match self.run_suppressed(&command, timeout) {
                Ok(output) if output.success() => {
                    info!("[{}] control master closed", target.node)
                }
                Ok(output) => warn!(
                    "[{}] {}: exit code {:?}: {}",
                    target.node,
                    command,
                    output.exit_code,
                    output.stderr.trim()
                ),
                Err(e) => warn!("[{}] {}", target.node, e),
            }
            Ok(false)
        })?;
        Ok(())
    }

    fn run_suppressed(
        &self,
        command: &CommandLine,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, crate::exec::ExecError> {
        self.runner
            .run(command, &RunOptions::with_timeout(timeout).suppressed())
    }

    fn check(&self, target: &MasterTarget, timeout: Option<Duration>) -> bool {
        match self.run_suppressed(&ssh_cmd::check_master(target), timeout) {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("[{}] {}", target.node, e);
                false
            }
        }
    }

    fn create(&self, target: &MasterTarget, timeout: Option<Duration>) -> Result<()> {
        let command = ssh_cmd::create_master(target);
        let mut retries = 0;
        loop {
            let output = match self.run_suppressed(&command, timeout) {
                Ok(output) => output,
                Err(e) => return self.creation_failed(target, &command, e.to_string(), timeout),
            };
            if output.success() {
                info!(
                    "[{}] control master created for {}@{}:{}",
                    target.node, target.key.user, target.key.host, target.key.port
                );
                return Ok(());
            }
            if !self.booting_up.is_match(&output.stderr) {
                return self.creation_failed(target, &command, describe(&output), timeout);
            }
            if retries >= self.boot_retries {
                return Err(Error::ControlMasterCreationFailed {
                    node: target.node.clone(),
                    command: command.to_string(),
                    output: format!(
                        "still booting up after {} retries\n{}",
                        retries,
                        describe(&output)
                    ),
                });
            }
            retries += 1;
            warn!(
                "[{}] host is booting up; retrying control master creation in {:?} ({}/{})",
                target.node, self.boot_retry_delay, retries, self.boot_retries
            );
            thread::sleep(self.boot_retry_delay);
        }
    }

    fn creation_failed(
        &self,
        target: &MasterTarget,
        command: &CommandLine,
        output: String,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if let Some(prompt) = &self.prompt {
            if self.interactive_session(target, prompt.as_ref(), timeout) {
                return Ok(());
            }
        }
        Err(Error::ControlMasterCreationFailed {
            node: target.node.clone(),
            command: command.to_string(),
            output,
        })
    }

    /// Opens the master on the terminal in the background and waits for the
    /// user to confirm they are done authenticating.
    fn interactive_session(
        &self,
        target: &MasterTarget,
        prompt: &dyn Prompt,
        timeout: Option<Duration>,
    ) -> bool {
        let _serialized = self.prompting.lock().unwrap_or_else(PoisonError::into_inner);
        warn!(
            "[{}] control master creation failed; opening an interactive session",
            target.node
        );
        let runner = self.runner.clone();
        let command = ssh_cmd::interactive_master(target);
        let task = BackgroundTask::spawn(move |cancel| {
            let options = RunOptions {
                interactive: true,
                suppress_errors: true,
                cancel: Some(cancel),
                ..Default::default()
            };
            runner.run(&command, &options)
        });
        prompt.acknowledge(&format!(
            "Authenticate to {} ({}), then press Enter.",
            target.node, target.key.host
        ));
        if !task.is_finished() {
            task.cancel();
        }
        match task.join() {
            Some(Err(e)) => debug!("[{}] interactive session: {}", target.node, e),
            None => warn!("[{}] interactive session panicked", target.node),
            Some(Ok(_)) => {}
        }
        self.check(target, timeout)
    }
}

fn describe(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    match (stderr.is_empty(), stdout.is_empty()) {
        (false, true) | (true, true) => {
            format!("exit code {:?}\n{}", output.exit_code, stderr)
        }
        (true, false) => format!("exit code {:?}\n{}", output.exit_code, stdout),
        (false, false) => format!("exit code {:?}\n{}\n{}", output.exit_code, stderr, stdout),
    }
}
