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

use std::fs::File;
use std::path::PathBuf;

use rustix::fs::FlockOperation;

use super::FileLockError;

#[derive(Debug)]
pub(super) struct OsFileLock {
    path: PathBuf,
    file: File,
}

impl OsFileLock {
    pub(super) fn lock(path: PathBuf) -> Result<OsFileLock, FileLockError> {
        loop {
            // Create the lock file, or open the current holder's.
            let file = File::create(&path).map_err(|err| FileLockError {
                message: "Failed to open lock file",
                path: path.clone(),
                err,
            })?;
            // If the lock is already held, wait for it to be released.
            rustix::fs::flock(&file, FlockOperation::LockExclusive).map_err(|err| {
                FileLockError {
                    message: "Failed to lock lock file",
                    path: path.clone(),
                    err: err.into(),
                }
            })?;

            let stat = rustix::fs::fstat(&file).map_err(|err| FileLockError {
                message: "Failed to stat lock file",
                path: path.clone(),
                err: err.into(),
            })?;
            if stat.st_nlink == 0 {
                // The previous holder unlinked the file while releasing;
                // start over so our ownership is visible on disk rather than
                // hidden in an unlinked inode.
                continue;
            }

            return Ok(OsFileLock { path, file });
        }
    }
}

impl Drop for OsFileLock {
    fn drop(&mut self) {
        // Removing the file isn't strictly necessary, but reduces confusion.
        _ = std::fs::remove_file(&self.path);
        // Unblock any process that queued on the lock while we held it. It is
        // responsible for creating and locking a new file, since we just
        // deleted this one.
        _ = rustix::fs::flock(&self.file, FlockOperation::Unlock);
    }
}
