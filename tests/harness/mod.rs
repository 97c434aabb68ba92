#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use fleetmux::{
    exec::{CommandLine, CommandOutput, CommandRunner, ExecError, RunOptions},
    inventory::{NodeMetadata, TomlInventory},
    rules::ConnectionRules,
    settings::Settings,
    ssh_mux::{config::ALIAS_PREFIX, ControlMasters, MasterKey, MasterTarget},
    Connector,
};
use tempfile::TempDir;

pub const BOOTING_UP: &str = "System is booting up. Unprivileged users are not permitted to log in yet.";

/// How a scripted master creation ends.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Up,
    BootingUp,
    Fail(&'static str),
    /// The command outlives its timeout.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Create,
    Check,
    Exit,
    Remote,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub node: String,
    pub kind: Kind,
    pub at: Instant,
}

/// Stands in for ssh: masters are plain files at the control socket path.
pub struct FakeSsh {
    state_dir: PathBuf,
    keys: HashMap<String, MasterKey>,
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    failing_checks: Mutex<HashSet<String>>,
    timeouts: Mutex<HashSet<(String, Kind)>>,
    calls: Mutex<Vec<Call>>,
    create_delay: Duration,
}

impl FakeSsh {
    pub fn new(state_dir: &Path, keys: HashMap<String, MasterKey>) -> Self {
        FakeSsh {
            state_dir: state_dir.to_path_buf(),
            keys,
            scripts: Mutex::new(HashMap::new()),
            failing_checks: Mutex::new(HashSet::new()),
            timeouts: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            create_delay: Duration::from_millis(20),
        }
    }

    /// Outcomes of the next creations for `node`; afterwards creation succeeds.
    pub fn script(&self, node: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// The next `-O check` for `node` fails even if its master is up.
    pub fn fail_next_check(&self, node: &str) {
        self.failing_checks.lock().unwrap().insert(node.to_string());
    }

    /// The next `kind` command for `node` times out.
    pub fn time_out_next(&self, node: &str, kind: Kind) {
        self.timeouts.lock().unwrap().insert((node.to_string(), kind));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, node: &str, kind: Kind) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.node == node && c.kind == kind)
            .count()
    }

    pub fn nodes_with(&self, kind: Kind) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .calls()
            .into_iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.node)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn socket(&self, node: &str) -> PathBuf {
        self.keys[node].socket_path(&self.state_dir)
    }

    fn timed_out(command: &CommandLine, options: &RunOptions) -> ExecError {
        ExecError::TimedOut {
            command: command.to_string(),
            after: options.timeout.unwrap_or(Duration::from_secs(30)),
        }
    }

    fn exit(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

impl CommandRunner for FakeSsh {
    fn run(&self, command: &CommandLine, options: &RunOptions) -> Result<CommandOutput, ExecError> {
        let alias = command
            .args
            .iter()
            .find(|a| a.starts_with(ALIAS_PREFIX))
            .expect("command without a node alias");
        let node = alias.trim_start_matches(ALIAS_PREFIX).to_string();
        let has = |flag: &str| command.args.iter().any(|a| a == flag);
        let kind = if has("-Ocheck") {
            Kind::Check
        } else if has("-Oexit") {
            Kind::Exit
        } else if has("-oControlMaster=yes") {
            Kind::Create
        } else {
            Kind::Remote
        };
        self.calls.lock().unwrap().push(Call {
            node: node.clone(),
            kind,
            at: Instant::now(),
        });
        if self.timeouts.lock().unwrap().remove(&(node.clone(), kind)) {
            return Err(Self::timed_out(command, options));
        }
        let socket = self.socket(&node);
        let output = match kind {
            Kind::Create => {
                thread::sleep(self.create_delay);
                let next = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&node)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Outcome::Up);
                match next {
                    Outcome::Up => {
                        // Like ssh, an existing socket path is left alone.
                        if !socket.exists() {
                            fs::write(&socket, "master").unwrap();
                        }
                        Self::exit(0, "")
                    }
                    Outcome::BootingUp => Self::exit(255, BOOTING_UP),
                    Outcome::Fail(message) => Self::exit(255, message),
                    Outcome::TimedOut => return Err(Self::timed_out(command, options)),
                }
            }
            Kind::Check => {
                let forced_failure = self.failing_checks.lock().unwrap().remove(&node);
                let alive = fs::read_to_string(&socket).is_ok_and(|s| s == "master");
                if alive && !forced_failure {
                    Self::exit(0, "Master running (pid=4242)")
                } else {
                    Self::exit(255, "Control socket connect: No such file or directory")
                }
            }
            Kind::Exit => match fs::remove_file(&socket) {
                Ok(()) => Self::exit(0, "Exit request sent."),
                Err(_) => Self::exit(255, "Control socket connect: No such file or directory"),
            },
            Kind::Remote => CommandOutput {
                exit_code: Some(0),
                stdout: format!("hello from {}\n", node),
                stderr: String::new(),
            },
        };
        if !options.suppress_errors && output.exit_code != Some(options.expected_exit_code) {
            return Err(ExecError::UnexpectedExit {
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// A state dir, an inventory of `10.0.0.x` nodes and a fake ssh wired to it.
pub struct Fixture {
    pub state: TempDir,
    pub settings: Settings,
    pub inventory: Arc<TomlInventory>,
    pub fake: Arc<FakeSsh>,
}

impl Fixture {
    pub fn new(nodes: &[&str]) -> Self {
        let state = TempDir::new().unwrap();
        let settings = Settings {
            ssh_user: "tester".into(),
            state_dir: state.path().to_path_buf(),
            boot_retry_delay: Duration::from_millis(50),
            boot_retries: 5,
            strict_host_key_checking: false,
            ..Default::default()
        };
        let mut inventory = TomlInventory::default();
        let mut keys = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            let ip = format!("10.0.0.{}", i + 1);
            keys.insert(node.to_string(), MasterKey::new(&ip, 22, "tester"));
            inventory.insert(
                *node,
                NodeMetadata {
                    host_ip: Some(ip),
                    ..Default::default()
                },
            );
        }
        let fake = Arc::new(FakeSsh::new(state.path(), keys));
        Fixture {
            state,
            settings,
            inventory: Arc::new(inventory),
            fake,
        }
    }

    pub fn masters(&self) -> ControlMasters {
        ControlMasters::new(&self.settings, self.fake.clone()).unwrap()
    }

    pub fn connector(&self) -> Connector {
        Connector::new(
            self.settings.clone(),
            self.inventory.clone(),
            self.fake.clone(),
            Arc::new(ConnectionRules::new()),
        )
        .unwrap()
    }

    pub fn target(&self, node: &str) -> MasterTarget {
        MasterTarget {
            node: node.to_string(),
            alias: format!("{}{}", ALIAS_PREFIX, node),
            key: self.fake.keys[node].clone(),
            ssh_exec: "ssh".into(),
            batch_mode: true,
        }
    }
}

pub fn nodes(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
