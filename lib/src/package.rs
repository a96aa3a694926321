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

//! Contract between the project engine and package working copies.
//!
//! The project layer treats a package working copy as a black box: it owns
//! the package directory's lifecycle but never looks inside its state. The
//! package implementation must itself support resuming an interrupted
//! `update()` or `commit()`, since the project engine re-invokes them when it
//! recovers a crashed transaction.

use std::error::Error;
use std::path::Path;

use thiserror::Error as ThisError;

/// Error from a package working copy implementation, passed through opaquely.
#[derive(Debug, ThisError)]
#[error(transparent)]
pub struct PackageError(Box<dyn Error + Send + Sync>);

impl PackageError {
    pub fn new(err: impl Into<Box<dyn Error + Send + Sync>>) -> PackageError {
        PackageError(err.into())
    }
}

/// One package working copy inside a project working copy.
pub trait PackageWorkingCopy {
    /// The package directory.
    fn path(&self) -> &Path;

    /// Brings the working copy up to date with the remote package.
    fn update(&mut self) -> Result<(), PackageError>;

    /// Sends local modifications to the remote package.
    fn commit(&mut self) -> Result<(), PackageError>;

    fn is_updateable(&self) -> bool;

    fn is_commitable(&self) -> bool;

    fn is_modified(&self) -> bool;

    /// Names of the tracked files.
    fn files(&self) -> Result<Vec<String>, PackageError>;

    /// Removes a tracked file from the working copy.
    fn remove(&mut self, filename: &str) -> Result<(), PackageError>;
}

/// Creates and opens package working copies for the project engine.
pub trait PackageFactory: Send + Sync {
    /// Initialises a fresh package working copy at `path`, backed by the
    /// external store directory. Afterwards the package's own store entry
    /// (its hidden metadata directory inside `path`) must point at
    /// `external_store`; the engine re-points it when it moves a staged
    /// working copy into place.
    fn init_package(
        &self,
        path: &Path,
        project: &str,
        name: &str,
        api_url: &str,
        external_store: &Path,
    ) -> Result<Box<dyn PackageWorkingCopy>, PackageError>;

    /// Opens the package working copy at `path`.
    fn load_package(&self, path: &Path) -> Result<Box<dyn PackageWorkingCopy>, PackageError>;

    /// Whether `path` is an initialised package working copy.
    fn is_working_copy(&self, path: &Path) -> bool;
}
