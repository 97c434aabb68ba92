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

//! Error taxonomy shared by the resolver, the control-master manager and the
//! batch orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::exec::ExecError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// No address could be determined for the node.
    #[error("node {node} is not connectable: no host IP, private IP or hostname")]
    NotConnectable { node: String },

    /// The control master could not be established, boot retries included.
    #[error("ssh control master for {node}: {command}\n\n{output}")]
    ControlMasterCreationFailed {
        node: String,
        command: String,
        output: String,
    },

    /// A helper executable needed for this batch is not installed.
    #[error("missing dependency: {name} is needed but was not found in PATH")]
    MissingDependency { name: String },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }

    /// Prefixes a configuration error with the file it came from.
    pub(crate) fn in_file(self, path: &std::path::Path) -> Self {
        match self {
            Error::Config(message) => Error::Config(format!("{}: {}", path.display(), message)),
            other => other,
        }
    }
}
