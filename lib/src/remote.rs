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

//! Contract between the project engine and the remote service.
//!
//! The engine is handed a [`RemoteSource`] capability; it never constructs
//! its own HTTP client and there is no process-wide default. Transport
//! concerns (retries, authentication, timeouts) live behind this trait.

use std::error::Error;

use thiserror::Error as ThisError;

/// Error from the remote model layer, passed through opaquely.
#[derive(Debug, ThisError)]
#[error(transparent)]
pub struct RemoteError(Box<dyn Error + Send + Sync>);

impl RemoteError {
    pub fn new(err: impl Into<Box<dyn Error + Send + Sync>>) -> RemoteError {
        RemoteError(err.into())
    }
}

/// Read and write access to the source projects of a build service instance.
pub trait RemoteSource: Send + Sync {
    /// Package names of `project`, in server order.
    fn list_packages(&self, project: &str) -> Result<Vec<String>, RemoteError>;

    fn package_exists(&self, project: &str, package: &str) -> Result<bool, RemoteError>;

    /// Creates an empty remote package.
    fn create_package(&self, project: &str, package: &str) -> Result<(), RemoteError>;

    fn delete_package(&self, project: &str, package: &str) -> Result<(), RemoteError>;
}
