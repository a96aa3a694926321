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

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use super::FileLockError;

const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Portable lock: whoever manages to create the file owns the lock, everyone
/// else polls with backoff until the file disappears again.
#[derive(Debug)]
pub(super) struct OsFileLock {
    path: PathBuf,
}

impl OsFileLock {
    pub(super) fn lock(path: PathBuf) -> Result<OsFileLock, FileLockError> {
        let mut interval = Duration::from_millis(1);
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(_file) => return Ok(OsFileLock { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(interval);
                    interval = (interval * 2).min(MAX_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(FileLockError {
                        message: "Failed to create lock file",
                        path,
                        err,
                    });
                }
            }
        }
    }
}

impl Drop for OsFileLock {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}
