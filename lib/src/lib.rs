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

//! Library for obc - transactional working copies for the Open Build Service.
//!
//! A project working copy mirrors a remote project as a directory of package
//! working copies plus a hidden metadata store. The [`project::Project`]
//! engine drives incremental `update` and `commit` cycles against the remote
//! package list; both operations persist their progress in a transaction
//! record so that they can resume after a crash at any instruction.
//!
//! Package working copies and the remote service are consumed through the
//! [`package`] and [`remote`] traits; this crate owns the project-level state
//! only.

#![deny(unused_must_use)]

pub mod file_util;
pub mod lock;
pub mod manifest;
pub mod notify;
pub mod package;
pub mod project;
pub mod remote;
pub mod store;
pub mod transaction;
