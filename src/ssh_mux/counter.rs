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

//! File-backed owner sets, one per control master, mutated under an exclusive
//! `flock` so that threads and processes agree on who uses a master.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    process, thread,
};

use fs2::FileExt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque identifier of one borrower of a control master.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// A fresh token naming the current process and thread.
    pub fn generate() -> Self {
        let thread_id: String = format!("{:?}", thread::current().id())
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        OwnerToken(format!(
            "{}.{}.{}",
            process::id(),
            thread_id,
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerToken {
    fn from(token: String) -> Self {
        OwnerToken(token.replace(['\n', '\r'], ""))
    }
}

impl From<&str> for OwnerToken {
    fn from(token: &str) -> Self {
        OwnerToken::from(token.to_string())
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newline-separated owner tokens. A missing file is an empty set.
///
/// The lock lives in a sibling `.lock` file that is never removed, so the
/// owner file itself can be rewritten or deleted while locked.
#[derive(Debug, Clone)]
pub struct CounterFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl CounterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        CounterFile {
            path,
            lock_path: lock_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with the current owners while holding the exclusive lock.
    ///
    /// `f` may edit the owner set (to drop owners it found invalid) and
    /// returns whether `token` should remain an owner. The token is then added
    /// or removed and the file rewritten if anything changed. Blocks until the
    /// lock is available.
    pub fn with_lock<F>(&self, token: &OwnerToken, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<String>, &OwnerToken) -> Result<bool>,
    {
        let _lock = self.lock(true)?;
        let before = self.read()?;
        let mut owners = before.clone();
        let outcome = f(&mut owners, token);
        match &outcome {
            Ok(true) if !owners.iter().any(|o| o == token.as_str()) => {
                owners.push(token.to_string())
            }
            Ok(false) => owners.retain(|o| o != token.as_str()),
            _ => {}
        }
        if owners != before {
            self.write(&owners)?;
        }
        outcome
    }

    /// Current owners, read under a shared lock.
    pub fn owners(&self) -> Result<Vec<String>> {
        let _lock = self.lock(false)?;
        self.read()
    }

    fn lock(&self, exclusive: bool) -> Result<LockGuard> {
        let lock_error = |source| Error::Lock {
            path: self.lock_path.clone(),
            source,
        };
        if let Some(parent) = self.lock_path.parent() {
            create_private_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(lock_error)?;
        if exclusive {
            FileExt::lock_exclusive(&file).map_err(lock_error)?;
        } else {
            FileExt::lock_shared(&file).map_err(lock_error)?;
        }
        Ok(LockGuard(file))
    }

    fn read(&self) -> Result<Vec<String>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.path)(e)),
        };
        let mut owners: Vec<String> = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !owners.iter().any(|o| o == line) {
                owners.push(line.to_string());
            }
        }
        Ok(owners)
    }

    fn write(&self, owners: &[String]) -> Result<()> {
        if owners.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(Error::io(&self.path)(e)),
                _ => Ok(()),
            };
        }
        let mut text = owners.join("\n");
        text.push('\n');
        fs::write(&self.path, text).map_err(Error::io(&self.path))
    }
}

/// Creates `dir` and missing parents readable by the owner only.
fn create_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(Error::io(dir))
}

struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            log::warn!("failed to unlock owner file: {}", e);
        }
    }
}
