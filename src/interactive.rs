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

//! A cancellable background task with an explicit synchronization point, used
//! for interactive master sessions.

use std::{
    io::{self, BufRead, Write},
    thread::{self, JoinHandle},
};

use crate::exec::CancelToken;

/// Blocks until the user acknowledges `message`.
pub trait Prompt: Send + Sync {
    fn acknowledge(&self, message: &str);
}

/// Prints to stderr and waits for a line on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn acknowledge(&self, message: &str) {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{} ", message);
        let _ = stderr.flush();
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
    }
}

pub struct BackgroundTask<T> {
    handle: JoinHandle<T>,
    cancel: CancelToken,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// `f` gets the token to pass down to whatever it runs.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        BackgroundTask {
            handle: thread::spawn(move || f(token)),
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// `None` if the task panicked.
    pub fn join(self) -> Option<T> {
        self.handle.join().ok()
    }
}
