// Copyright 2024 The Obc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod fallback;
#[cfg(unix)]
mod unix;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use thiserror::Error;

#[cfg(not(unix))]
use self::fallback as sys;
#[cfg(unix)]
use self::unix as sys;

#[derive(Debug, Error)]
#[error("{message}: {path}")]
pub struct FileLockError {
    pub message: &'static str,
    pub path: PathBuf,
    #[source]
    pub err: io::Error,
}

/// Lock paths currently held by this process. The OS lock excludes other
/// processes but not a second acquisition through a new file descriptor, so
/// re-entrant use would deadlock silently instead of failing.
static HELD_LOCKS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// An exclusive advisory lock on a file, released when dropped.
///
/// Acquisition blocks until the current holder (another process) releases the
/// lock. Acquiring a lock this process already holds fails fast instead.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _inner: sys::OsFileLock,
}

impl FileLock {
    pub fn lock(path: PathBuf) -> Result<FileLock, FileLockError> {
        {
            let mut held = HELD_LOCKS.lock().unwrap();
            if !held.insert(path.clone()) {
                return Err(FileLockError {
                    message: "Lock is already held by this process",
                    path,
                    err: io::Error::new(io::ErrorKind::WouldBlock, "re-entrant lock acquisition"),
                });
            }
        }
        match sys::OsFileLock::lock(path.clone()) {
            Ok(inner) => Ok(FileLock {
                path,
                _inner: inner,
            }),
            Err(err) => {
                HELD_LOCKS.lock().unwrap().remove(&path);
                Err(err)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS-level lock is released by the inner drop afterwards.
        HELD_LOCKS.lock().unwrap().remove(&self.path);
    }
}
