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

//! Lifecycle events of project transactions.

use crate::manifest::EntryState;
use crate::transaction::{TransactionInfo, TransactionKind};

/// Observer of a project transaction's lifecycle. This is the engine's only
/// observability hook; implementations must not panic.
///
/// All methods default to doing nothing.
pub trait TransactionNotifier {
    /// Called with the classified work-lists before the transaction record
    /// is written. Returning `false` vetoes the transaction; the engine then
    /// emits `finished(kind, true)` and returns without mutating anything.
    fn begin(&mut self, kind: TransactionKind, info: &TransactionInfo) -> bool {
        let _ = (kind, info);
        true
    }

    /// A package completed, with the manifest state it will end up in
    /// (`None`: dropped from the manifest). Also emitted per removed file
    /// while a package directory is being deleted.
    fn processed(&mut self, item: &str, new_state: Option<EntryState>) {
        let _ = (item, new_state);
    }

    /// The transaction finished; `aborted` is true only for a vetoed begin.
    fn finished(&mut self, kind: TransactionKind, aborted: bool) {
        let _ = (kind, aborted);
    }
}

/// Discards all events.
pub struct NullNotifier;

impl TransactionNotifier for NullNotifier {}
