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

use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use flexi_logger::{detailed_format, FileSpec, LogSpecification, Logger, LoggerHandle};
use log::LevelFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    #[value(hide = true)]
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// The returned handle must be kept alive for file logging to keep working.
pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<LoggerHandle> {
    let spec = LogSpecification::builder().default(level).build();
    let logger = Logger::with(spec).format(detailed_format);
    let logger = match log_file {
        Some(path) => logger.log_to_file(FileSpec::try_from(path)?).append(),
        None => logger.log_to_stderr(),
    };
    Ok(logger.start()?)
}
