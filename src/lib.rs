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

//! Shared SSH control masters for fleets of nodes.
//!
//! [`Connector::with_connection_to`] is the entry point: it generates an ssh
//! configuration for a batch of nodes, makes sure each node has a control
//! master (creating or reusing one, across threads and processes), runs the
//! caller's closure and releases the masters again.

pub mod batch;
pub mod error;
pub mod exec;
pub mod interactive;
pub mod inventory;
pub mod resolver;
pub mod rules;
pub mod settings;
pub mod ssh_cmd;
pub mod ssh_mux;

pub use batch::{BatchOptions, Connector, Session};
pub use error::{Error, Result};
