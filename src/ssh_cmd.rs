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

//! Command lines for the ssh client, always run through the workspace
//! wrapper so that they pick up the generated configuration.

use std::path::Path;

use crate::{exec::CommandLine, ssh_mux::MasterTarget};

// cf. scp.c in openssh-portable.
const RESTRICTED: &[&str] = &[
    "-oPermitLocalCommand=no",
    "-oClearAllForwardings=yes",
    "-oRemoteCommand=none",
    "-oForwardAgent=no",
];

/// Output that marks a host still starting up; retried rather than failed.
pub const BOOTING_UP_SIGNATURE: &str = r"(?i)system is booting up";

fn batch_mode(batch: bool) -> Option<&'static str> {
    batch.then_some("-oBatchMode=yes")
}

/// Starts a persistent master. ssh detaches it after `true` has run.
pub fn create_master(target: &MasterTarget) -> CommandLine {
    CommandLine::new(&target.ssh_exec)
        .args(["-xT", "-oControlMaster=yes", "-oControlPersist=yes"])
        .args(RESTRICTED.iter().copied())
        .args(batch_mode(target.batch_mode))
        .args(["--", target.alias.as_str(), "true"])
}

/// Same as [`create_master`] but able to prompt on the terminal.
pub fn interactive_master(target: &MasterTarget) -> CommandLine {
    CommandLine::new(&target.ssh_exec)
        .args(["-x", "-oControlMaster=yes", "-oControlPersist=yes"])
        .args(["--", target.alias.as_str(), "true"])
}

pub fn check_master(target: &MasterTarget) -> CommandLine {
    CommandLine::new(&target.ssh_exec).args(["-Ocheck", "--", target.alias.as_str()])
}

pub fn exit_master(target: &MasterTarget) -> CommandLine {
    CommandLine::new(&target.ssh_exec).args(["-Oexit", "--", target.alias.as_str()])
}

/// Runs `command` on the host behind `alias`, reusing its master if any.
pub fn remote(ssh_exec: &Path, alias: &str, batch: bool, command: &str) -> CommandLine {
    CommandLine::new(ssh_exec)
        .arg("-xT")
        .args(RESTRICTED.iter().copied())
        .args(batch_mode(batch))
        .args(["--", alias, command])
}
