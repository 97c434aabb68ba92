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

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetmux::{
    exec::{RunOptions, SystemRunner},
    inventory::{Inventory, TomlInventory},
    rules::ConnectionRules,
    settings::{Settings, DEFAULT_MAX_THREADS},
    BatchOptions, Connector,
};

mod logging;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Inventory file with one [nodes.<id>] table per node
    #[arg(short, long, env = "FLEETMUX_INVENTORY")]
    inventory: PathBuf,

    /// Connection rules file declaring gateways and transforms
    #[arg(short, long, env = "FLEETMUX_RULES")]
    rules: Option<PathBuf>,

    /// Default user to connect as
    #[arg(long, env = "FLEETMUX_SSH_USER")]
    ssh_user: Option<String>,

    /// Name of the gateway definitions to use
    #[arg(long, env = "FLEETMUX_SSH_GATEWAYS_CONF")]
    ssh_gateways_conf: Option<String>,

    /// User for gateways that do not specify one
    #[arg(long, env = "FLEETMUX_SSH_GATEWAY_USER")]
    ssh_gateway_user: Option<String>,

    /// Open a new connection for every command instead of sharing masters
    #[arg(long)]
    no_control_master: bool,

    /// Accept unknown host keys
    #[arg(long)]
    no_strict_host_key_checking: bool,

    /// Offer an interactive session when a master cannot be created
    #[arg(long)]
    interactive: bool,

    /// Maximum number of masters created in parallel
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS)]
    max_threads: usize,

    /// Timeout in seconds for each ssh invocation
    #[arg(long)]
    timeout: Option<u64>,

    /// Skip nodes that cannot be reached instead of failing
    #[arg(short, long)]
    lenient: bool,

    #[arg(long, value_enum, env = "FLEETMUX_LOG_LEVEL", default_value_t = logging::LogLevel::Warn)]
    log_level: logging::LogLevel,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command on every node
    Run {
        /// Node ids, or /regex/ to select from the inventory
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Command to run remotely
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the generated ssh configuration
    Config {
        /// Node ids, or /regex/; all known nodes when empty
        nodes: Vec<String>,
    },
}

impl Args {
    fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(user) = &self.ssh_user {
            settings.ssh_user = user.clone();
        }
        if let Some(conf) = &self.ssh_gateways_conf {
            settings.ssh_gateways_conf = Some(conf.clone());
        }
        if let Some(user) = &self.ssh_gateway_user {
            settings.ssh_gateway_user = user.clone();
        }
        settings.use_control_master &= !self.no_control_master;
        settings.strict_host_key_checking &= !self.no_strict_host_key_checking;
        settings.interactive |= self.interactive;
        settings.max_threads = self.max_threads.max(1);
        settings.command_timeout = self.timeout.map(Duration::from_secs);
        settings
    }
}

/// Expands `/regex/` arguments against the inventory.
fn select_nodes(inventory: &dyn Inventory, patterns: &[String]) -> Result<Vec<String>> {
    let known = inventory.known_nodes();
    if patterns.is_empty() {
        return Ok(known);
    }
    let mut selected = Vec::new();
    for pattern in patterns {
        let matched = match pattern
            .strip_prefix('/')
            .and_then(|p| p.strip_suffix('/'))
        {
            Some(re) => {
                let re = regex::Regex::new(re)
                    .with_context(|| format!("invalid node pattern {}", pattern))?;
                known.iter().filter(|n| re.is_match(n)).cloned().collect()
            }
            None => vec![pattern.clone()],
        };
        for node in matched {
            if !selected.contains(&node) {
                selected.push(node);
            }
        }
    }
    Ok(selected)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _logger = logging::setup_logger(args.log_level.into(), args.log_file.as_deref())?;

    let settings = args.settings();
    let inventory = Arc::new(TomlInventory::load(&args.inventory)?);
    let rules = Arc::new(ConnectionRules::new());
    if let Some(path) = &args.rules {
        rules.load_file(path)?;
    }
    let options = BatchOptions {
        lenient: args.lenient,
        timeout: settings.command_timeout,
        max_threads: Some(settings.max_threads),
    };
    let connector = Connector::new(settings, inventory.clone(), Arc::new(SystemRunner), rules)?;

    match &args.command {
        Command::Config { nodes } => {
            let nodes = select_nodes(inventory.as_ref(), nodes)?;
            print!("{}", connector.ssh_config(&nodes)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { nodes, command } => {
            let nodes = select_nodes(inventory.as_ref(), nodes)?;
            if nodes.is_empty() {
                anyhow::bail!("no node matches the selection");
            }
            let remote = command.join(" ");
            let failed = connector.with_connection_to(&nodes, &options, |session| {
                let mut failed = nodes.len() - session.nodes().len();
                let run_options = RunOptions::with_timeout(options.timeout).suppressed();
                for node in session.nodes() {
                    let output = session.run(node, &remote, &run_options)?;
                    for line in output.stdout.lines() {
                        println!("{}: {}", node, line);
                    }
                    for line in output.stderr.lines() {
                        eprintln!("{}: {}", node, line);
                    }
                    if !output.success() {
                        eprintln!("{}: exit code {:?}", node, output.exit_code);
                        failed += 1;
                    }
                }
                Ok(failed)
            })?;
            if failed > 0 {
                eprintln!("{} of {} node(s) failed", failed, nodes.len());
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
