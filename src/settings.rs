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

use std::{env, path::PathBuf, time::Duration};

/// Tool names baked in by `build.rs`.
pub const DEFAULT_SSH_EXEC: &str = env!("FLEETMUX_SSH_EXEC");
pub const DEFAULT_SSHPASS_EXEC: &str = env!("FLEETMUX_SSHPASS_EXEC");

pub const DEFAULT_GATEWAY_USER: &str = "ubuntu";
pub const DEFAULT_MAX_THREADS: usize = 64;
pub const DEFAULT_BOOT_RETRIES: u32 = 10;
pub const DEFAULT_BOOT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Process-wide connection settings.
///
/// [`Settings::from_env`] reads the environment once; every field can be
/// overridden afterwards by the caller (the binary maps its arguments onto
/// them).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default user for every node, before transforms.
    pub ssh_user: String,
    /// Name of the gateway definitions to put in the generated config.
    pub ssh_gateways_conf: Option<String>,
    /// User for gateways that do not name one.
    pub ssh_gateway_user: String,
    pub interactive: bool,
    pub use_control_master: bool,
    pub strict_host_key_checking: bool,
    pub max_threads: usize,
    pub boot_retries: u32,
    pub boot_retry_delay: Duration,
    /// Bound applied to every ssh invocation made by the manager.
    pub command_timeout: Option<Duration>,
    /// Holds control sockets, owner files and their locks.
    pub state_dir: PathBuf,
    pub ssh_exec: PathBuf,
    pub sshpass_exec: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ssh_user: "root".into(),
            ssh_gateways_conf: None,
            ssh_gateway_user: DEFAULT_GATEWAY_USER.into(),
            interactive: false,
            use_control_master: true,
            strict_host_key_checking: true,
            max_threads: DEFAULT_MAX_THREADS,
            boot_retries: DEFAULT_BOOT_RETRIES,
            boot_retry_delay: DEFAULT_BOOT_RETRY_DELAY,
            command_timeout: None,
            state_dir: env::temp_dir().join("fleetmux_ssh"),
            ssh_exec: DEFAULT_SSH_EXEC.into(),
            sshpass_exec: DEFAULT_SSHPASS_EXEC.into(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Settings::default();
        if let Some(user) = lookup("FLEETMUX_SSH_USER")
            .or_else(|| lookup("USER"))
            .filter(|u| !u.is_empty())
        {
            settings.ssh_user = user;
        }
        settings.ssh_gateways_conf = lookup("FLEETMUX_SSH_GATEWAYS_CONF").filter(|g| !g.is_empty());
        if let Some(user) = lookup("FLEETMUX_SSH_GATEWAY_USER").filter(|u| !u.is_empty()) {
            settings.ssh_gateway_user = user;
        }
        let flag = |key: &str| lookup(key).is_some_and(|v| is_truthy(&v));
        settings.interactive = flag("FLEETMUX_INTERACTIVE");
        settings.use_control_master = !flag("FLEETMUX_NO_CONTROL_MASTER");
        settings.strict_host_key_checking = !flag("FLEETMUX_NO_STRICT_HOST_KEY_CHECKING");
        settings
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings_from(vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let settings = settings_from(&[]);
        assert_eq!(settings.ssh_user, "root");
        assert_eq!(settings.ssh_gateway_user, DEFAULT_GATEWAY_USER);
        assert!(settings.use_control_master);
        assert!(settings.strict_host_key_checking);
        assert!(!settings.interactive);
        assert_eq!(settings.boot_retries, DEFAULT_BOOT_RETRIES);
    }

    #[test]
    fn explicit_user_wins_over_login_user() {
        let settings = settings_from(&[("USER", "alice"), ("FLEETMUX_SSH_USER", "deploy")]);
        assert_eq!(settings.ssh_user, "deploy");
        assert_eq!(settings_from(&[("USER", "alice")]).ssh_user, "alice");
    }

    #[test]
    fn switches_are_read_from_environment() {
        let settings = settings_from(&[
            ("FLEETMUX_NO_CONTROL_MASTER", "1"),
            ("FLEETMUX_NO_STRICT_HOST_KEY_CHECKING", "yes"),
            ("FLEETMUX_INTERACTIVE", "true"),
            ("FLEETMUX_SSH_GATEWAYS_CONF", "madrid"),
        ]);
        assert!(!settings.use_control_master);
        assert!(!settings.strict_host_key_checking);
        assert!(settings.interactive);
        assert_eq!(settings.ssh_gateways_conf.as_deref(), Some("madrid"));
    }

    #[test]
    fn falsy_switch_values_are_ignored() {
        let settings = settings_from(&[("FLEETMUX_NO_CONTROL_MASTER", "0")]);
        assert!(settings.use_control_master);
    }
}
