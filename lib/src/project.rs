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

//! The project working-copy engine.
//!
//! [`Project`] owns the manifest, the lock and the transaction record of one
//! project working copy, and drives `update`/`commit` over the package
//! working copies inside it. Every mutating operation holds the project lock
//! for its whole duration; `update` and `commit` persist their progress after
//! each package, so an interrupted run resumes when the operation is invoked
//! again.

use std::collections::BTreeMap;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_dir as symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;
use tracing::instrument;

use crate::lock::{FileLock, FileLockError};
use crate::manifest::{EntryState, Manifest};
use crate::notify::{NullNotifier, TransactionNotifier};
use crate::package::{PackageError, PackageFactory, PackageWorkingCopy};
use crate::remote::{RemoteError, RemoteSource};
use crate::store::{is_project, ProjectStore, StoreError, StoreLayout};
use crate::transaction::{
    CommitInfo, TransactionInfo, TransactionKind, TransactionState, TransactionStateError,
    UpdateInfo,
};

/// Status of a package name relative to this working copy, derived from the
/// manifest and disk presence. Total: any string has exactly one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageStatus {
    /// `' '`: tracked and in sync.
    Unchanged,
    /// `'A'`: scheduled for addition.
    Added,
    /// `'D'`: scheduled for deletion.
    Deleted,
    /// `'!'`: tracked, but the directory is gone.
    Missing,
    /// `'?'`: not tracked.
    Untracked,
}

impl PackageStatus {
    pub fn as_char(self) -> char {
        match self {
            PackageStatus::Unchanged => ' ',
            PackageStatus::Added => 'A',
            PackageStatus::Deleted => 'D',
            PackageStatus::Missing => '!',
            PackageStatus::Untracked => '?',
        }
    }
}

impl From<EntryState> for PackageStatus {
    fn from(state: EntryState) -> PackageStatus {
        match state {
            EntryState::Unchanged => PackageStatus::Unchanged,
            EntryState::Added => PackageStatus::Added,
            EntryState::Deleted => PackageStatus::Deleted,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Working copy at {path} is inconsistent (missing: {missing:?})")]
    Inconsistent {
        path: PathBuf,
        /// Store-relative names of the missing required paths.
        missing: Vec<String>,
        /// The manifest bytes, if present but unparseable.
        raw_manifest: Option<Vec<u8>>,
    },
    #[error("A {0} transaction is already in progress")]
    PendingTransaction(TransactionKind),
    #[error("Conflicted packages: {}", .0.join(", "))]
    Conflicts(Vec<String>),
    #[error("Package {0:?} is already tracked")]
    AlreadyTracked(String),
    #[error("Package {0:?} is not under version control")]
    NotTracked(String),
    #[error("Path {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Path {0} is already an initialized working copy")]
    NestedWorkingCopy(PathBuf),
    #[error("Package {0:?} has no usable working copy for this transaction")]
    UnusablePackage(String),
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] FileLockError),
    #[error(transparent)]
    Transaction(#[from] TransactionStateError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

fn io_error(path: PathBuf) -> impl FnOnce(io::Error) -> ProjectError {
    move |source| ProjectError::Io { path, source }
}

/// A project working copy.
pub struct Project {
    store: ProjectStore,
    name: String,
    api_url: String,
    manifest: Manifest,
    remote: Arc<dyn RemoteSource>,
    factory: Arc<dyn PackageFactory>,
    notifier: Box<dyn TransactionNotifier>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("store", &self.store)
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Initialises `path` as a working copy of `project` and opens it.
    pub fn init(
        path: &Path,
        project: &str,
        api_url: &str,
        remote: Arc<dyn RemoteSource>,
        factory: Arc<dyn PackageFactory>,
    ) -> Result<Project, ProjectError> {
        let store = ProjectStore::init(path.to_owned(), StoreLayout::default(), project, api_url)?;
        Project::open_store(store, remote, factory)
    }

    /// Opens the working copy at `path`. Refuses inconsistent stores.
    pub fn open(
        path: &Path,
        remote: Arc<dyn RemoteSource>,
        factory: Arc<dyn PackageFactory>,
    ) -> Result<Project, ProjectError> {
        Project::open_store(ProjectStore::new(path.to_owned()), remote, factory)
    }

    /// Opens a working copy through an explicit store (e.g. a custom layout).
    pub fn open_store(
        store: ProjectStore,
        remote: Arc<dyn RemoteSource>,
        factory: Arc<dyn PackageFactory>,
    ) -> Result<Project, ProjectError> {
        let check = store.check()?;
        if !check.is_consistent() {
            return Err(ProjectError::Inconsistent {
                path: store.root().to_owned(),
                missing: check.missing,
                raw_manifest: check.invalid_manifest,
            });
        }
        let api_url = store.read_api_url()?;
        let name = store.read_project()?;
        let manifest = {
            let _lock = FileLock::lock(store.lock_file())?;
            let data = store.read_manifest_bytes()?;
            Manifest::parse(&data).map_err(|_| ProjectError::Inconsistent {
                path: store.root().to_owned(),
                missing: Vec::new(),
                raw_manifest: Some(data.clone()),
            })?
        };
        Ok(Project {
            store,
            name,
            api_url,
            manifest,
            remote,
            factory,
            notifier: Box::new(NullNotifier),
        })
    }

    /// Replaces the transaction notifier (a no-op one by default).
    pub fn with_notifier(mut self, notifier: Box<dyn TransactionNotifier>) -> Project {
        self.notifier = notifier;
        self
    }

    pub fn path(&self) -> &Path {
        self.store.root()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Tracked package names, in manifest order.
    pub fn packages(&self) -> Vec<String> {
        self.manifest.package_names().map(str::to_owned).collect()
    }

    /// Status of `package`, which can be any string.
    pub fn status(&self, package: &str) -> PackageStatus {
        let Some(entry) = self.manifest.find(package) else {
            return PackageStatus::Untracked;
        };
        let exists = self.store.package_dir(package).exists();
        if !exists && entry.state != EntryState::Deleted {
            return PackageStatus::Missing;
        }
        entry.state.into()
    }

    /// The package working copy for `package`, or `None` if its status is
    /// `Missing`/`Untracked`, or `Deleted` with no working copy on disk.
    pub fn package(
        &self,
        package: &str,
    ) -> Result<Option<Box<dyn PackageWorkingCopy>>, ProjectError> {
        let path = self.store.package_dir(package);
        match self.status(package) {
            PackageStatus::Missing | PackageStatus::Untracked => return Ok(None),
            PackageStatus::Deleted if !self.factory.is_working_copy(&path) => return Ok(None),
            _ => {}
        }
        Ok(Some(self.factory.load_package(&path)?))
    }

    /// Kind of the outstanding transaction record, if any.
    pub fn pending_transaction(&self) -> Result<Option<TransactionKind>, ProjectError> {
        Ok(TransactionState::read(&self.store)?.map(|state| state.kind()))
    }

    /// Whether `update` could run (or resume) right now.
    pub fn is_updateable(&self) -> Result<bool, ProjectError> {
        self.kind_admissible(TransactionKind::Update)
    }

    /// Whether `commit` could run (or resume) right now.
    pub fn is_commitable(&self) -> Result<bool, ProjectError> {
        self.kind_admissible(TransactionKind::Commit)
    }

    fn kind_admissible(&self, kind: TransactionKind) -> Result<bool, ProjectError> {
        Ok(match TransactionState::read(&self.store)? {
            None => true,
            Some(state) => state.kind() == kind || state.can_rollback(),
        })
    }

    /// Starts tracking the existing directory `<path>/<package>` as a new
    /// package, scheduled for addition by the next commit.
    #[instrument(skip_all)]
    pub fn add(&mut self, package: &str) -> Result<(), ProjectError> {
        let _lock = FileLock::lock(self.store.lock_file())?;
        if self.status(package) != PackageStatus::Untracked {
            return Err(ProjectError::AlreadyTracked(package.to_owned()));
        }
        let pkg_path = self.store.package_dir(package);
        if !pkg_path.is_dir() {
            return Err(ProjectError::NotADirectory(pkg_path));
        }
        if is_project(&pkg_path) || self.factory.is_working_copy(&pkg_path) {
            return Err(ProjectError::NestedWorkingCopy(pkg_path));
        }
        let external_store = self.store.data_dir_for(package);
        fs::create_dir_all(&external_store).map_err(io_error(external_store.clone()))?;
        self.factory.init_package(
            &pkg_path,
            &self.name,
            package,
            &self.api_url,
            &external_store,
        )?;
        self.manifest.set(package, EntryState::Added);
        self.store.write_manifest(&self.manifest)?;
        Ok(())
    }

    /// Schedules `package` for deletion. A package still in state `Added` is
    /// dropped from the manifest outright.
    #[instrument(skip_all)]
    pub fn remove(&mut self, package: &str) -> Result<(), ProjectError> {
        let _lock = FileLock::lock(self.store.lock_file())?;
        match self.status(package) {
            PackageStatus::Untracked => {
                return Err(ProjectError::NotTracked(package.to_owned()));
            }
            PackageStatus::Added => {
                self.manifest.remove(package);
            }
            _ => {
                self.manifest.set(package, EntryState::Deleted);
            }
        }
        self.store.write_manifest(&self.manifest)?;
        Ok(())
    }

    /// Updates the working copy against the remote package list. An empty
    /// `selection` means all packages. A leftover compatible transaction is
    /// resumed; an incompatible one is rolled back if it never got anywhere,
    /// otherwise [`ProjectError::PendingTransaction`] is returned.
    #[instrument(skip_all)]
    pub fn update(&mut self, selection: &[&str]) -> Result<(), ProjectError> {
        let _lock = FileLock::lock(self.store.lock_file())?;
        if let Some(state) = self.take_resumable(TransactionKind::Update)? {
            tracing::debug!("resuming interrupted update");
            return self.drive_update(state);
        }
        let info = self.calculate_update_info(selection)?;
        if !info.conflicted.is_empty() {
            return Err(ProjectError::Conflicts(info.conflicted));
        }
        let info = TransactionInfo::Update(info);
        if !self.notifier.begin(TransactionKind::Update, &info) {
            self.notifier.finished(TransactionKind::Update, true);
            return Ok(());
        }
        let state = TransactionState::begin(&self.store, info, self.prior_states())?;
        self.drive_update(state)
    }

    /// Commits local modifications to the remote. An empty `selection` means
    /// all packages. Leftover transactions are handled as in [`Self::update`].
    #[instrument(skip_all)]
    pub fn commit(&mut self, selection: &[&str]) -> Result<(), ProjectError> {
        let _lock = FileLock::lock(self.store.lock_file())?;
        if let Some(state) = self.take_resumable(TransactionKind::Commit)? {
            tracing::debug!("resuming interrupted commit");
            return self.drive_commit(state);
        }
        let info = self.calculate_commit_info(selection)?;
        if !info.conflicted.is_empty() {
            return Err(ProjectError::Conflicts(info.conflicted));
        }
        let info = TransactionInfo::Commit(info);
        if !self.notifier.begin(TransactionKind::Commit, &info) {
            self.notifier.finished(TransactionKind::Commit, true);
            return Ok(());
        }
        let state = TransactionState::begin(&self.store, info, self.prior_states())?;
        self.drive_commit(state)
    }

    /// Resolves a leftover transaction record for an operation of `kind`:
    /// returns the record to resume, erases a record that never progressed
    /// (so the operation reclassifies against current state), or reports the
    /// incompatible pending transaction.
    fn take_resumable(
        &self,
        kind: TransactionKind,
    ) -> Result<Option<TransactionState>, ProjectError> {
        match TransactionState::read(&self.store)? {
            None => Ok(None),
            Some(state) if state.kind() != kind => {
                if state.can_rollback() {
                    let other = state.kind();
                    tracing::debug!("rolling back untouched {other} transaction");
                    state.cleanup()?;
                    Ok(None)
                } else {
                    Err(ProjectError::PendingTransaction(state.kind()))
                }
            }
            Some(state) if state.can_rollback() => {
                // Same kind, but classified against a possibly stale remote
                // and never started; classify afresh.
                state.cleanup()?;
                Ok(None)
            }
            Some(state) => Ok(Some(state)),
        }
    }

    /// Manifest states of all tracked packages, recorded at transaction
    /// begin so the final merge re-asserts untouched entries.
    fn prior_states(&self) -> BTreeMap<String, EntryState> {
        self.manifest
            .entries()
            .iter()
            .map(|entry| (entry.name.clone(), entry.state))
            .collect()
    }

    /// Diffs the remote package list against local state.
    pub fn calculate_update_info(&self, selection: &[&str]) -> Result<UpdateInfo, ProjectError> {
        let remote_pkgs = self.remote.list_packages(&self.name)?;
        let local_pkgs = self.packages();
        let mut candidates: Vec<String> = Vec::new();
        let mut added: Vec<String> = Vec::new();
        let mut deleted: Vec<String> = Vec::new();
        let mut conflicted: Vec<String> = Vec::new();
        for package in &remote_pkgs {
            if local_pkgs.iter().any(|name| name == package) {
                push_unique(&mut candidates, package);
            } else {
                push_unique(&mut added, package);
            }
        }
        for package in &local_pkgs {
            let status = self.status(package);
            let pkg = self.package(package)?;
            if pkg.is_some_and(|pkg| !pkg.is_updateable()) {
                push_unique(&mut conflicted, package);
            } else if status != PackageStatus::Added
                && !remote_pkgs.iter().any(|name| name == package)
            {
                push_unique(&mut deleted, package);
            }
        }
        // A candidate in a state the update could not handle conflicts
        // instead of being driven.
        let mut kept = Vec::with_capacity(candidates.len());
        for package in candidates {
            let updateable = match self.package(&package)? {
                Some(pkg) => pkg.is_updateable(),
                None => true,
            };
            if matches!(
                self.status(&package),
                PackageStatus::Added | PackageStatus::Missing
            ) || !updateable
            {
                push_unique(&mut conflicted, &package);
            } else {
                kept.push(package);
            }
        }
        let candidates = kept;
        // An untracked directory shadowing a package to be added conflicts.
        let mut kept = Vec::with_capacity(added.len());
        for package in added {
            if self.status(&package) == PackageStatus::Untracked
                && self.store.package_dir(&package).exists()
            {
                push_unique(&mut conflicted, &package);
            } else {
                kept.push(package);
            }
        }
        let added = kept;

        let mut info = UpdateInfo {
            candidates,
            added,
            deleted,
            conflicted,
        };
        if !selection.is_empty() {
            for list in [
                &mut info.candidates,
                &mut info.added,
                &mut info.deleted,
                &mut info.conflicted,
            ] {
                list.retain(|package| selection.contains(&package.as_str()));
            }
        }
        info.assert_disjoint();
        Ok(info)
    }

    /// Classifies local per-package state for a commit.
    pub fn calculate_commit_info(&self, selection: &[&str]) -> Result<CommitInfo, ProjectError> {
        let packages: Vec<String> = if selection.is_empty() {
            self.packages()
        } else {
            selection.iter().map(|name| (*name).to_owned()).collect()
        };
        let mut info = CommitInfo::default();
        for package in packages.into_iter().unique() {
            match self.status(&package) {
                PackageStatus::Added => info.added.push(package),
                PackageStatus::Deleted => info.deleted.push(package),
                _ => match self.package(&package)? {
                    None => info.conflicted.push(package),
                    Some(pkg) => {
                        let commitable = pkg.is_commitable();
                        if pkg.is_modified() && commitable {
                            info.modified.push(package);
                        } else if !commitable {
                            info.conflicted.push(package);
                        } else {
                            info.unchanged.push(package);
                        }
                    }
                },
            }
        }
        info.assert_disjoint();
        Ok(info)
    }

    #[instrument(skip_all)]
    fn drive_update(&mut self, mut state: TransactionState) -> Result<(), ProjectError> {
        self.update_adds(&mut state)?;
        self.update_deletes(&mut state)?;
        self.update_candidates(&mut state)?;
        self.finish_transaction(state, TransactionKind::Update)
    }

    /// Checks out each added package into the transaction scratch area, then
    /// moves it into place. The phase guard makes a resumed run skip the
    /// checkout it already performed for the head package.
    fn update_adds(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let added = state
            .update_info()
            .map(|info| info.added.clone())
            .unwrap_or_default();
        for package in added {
            let scratch_dir = state.location_path().join(&package);
            let external_store = self.store.data_dir_for(&package);
            if state.phase().is_initial() {
                fs::create_dir_all(&external_store)
                    .map_err(io_error(external_store.clone()))?;
                let mut pkg = self.factory.init_package(
                    &scratch_dir,
                    &self.name,
                    &package,
                    &self.api_url,
                    &external_store,
                )?;
                pkg.update()?;
                state.advance()?;
            }
            // Point the package store at the external store via a path
            // relative to the final location, then rename the staged copy
            // into place. Skips silently if a resumed run finds the staged
            // copy already moved.
            if scratch_dir.is_dir() {
                let store_link = scratch_dir.join(&self.store.layout().store_dirname);
                if store_link.symlink_metadata().is_ok() {
                    fs::remove_file(&store_link).map_err(io_error(store_link.clone()))?;
                }
                let rel_store = Path::new("..")
                    .join(&self.store.layout().store_dirname)
                    .join(&self.store.layout().data_subdir)
                    .join(&package);
                symlink(&rel_store, &store_link).map_err(io_error(store_link.clone()))?;
                let final_dir = self.store.package_dir(&package);
                fs::rename(&scratch_dir, &final_dir).map_err(io_error(final_dir))?;
            }
            state.processed(&package, Some(EntryState::Unchanged))?;
            self.notifier.processed(&package, Some(EntryState::Unchanged));
        }
        Ok(())
    }

    fn update_deletes(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let deleted = state
            .update_info()
            .map(|info| info.deleted.clone())
            .unwrap_or_default();
        for package in deleted {
            state.advance()?;
            self.remove_wc_dir(&package, true)?;
            state.processed(&package, None)?;
            self.notifier.processed(&package, None);
        }
        Ok(())
    }

    fn update_candidates(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let candidates = state
            .update_info()
            .map(|info| info.candidates.clone())
            .unwrap_or_default();
        for package in candidates {
            let Some(mut pkg) = self.package(&package)? else {
                return Err(ProjectError::UnusablePackage(package));
            };
            pkg.update()?;
            state.processed(&package, Some(EntryState::Unchanged))?;
            self.notifier.processed(&package, Some(EntryState::Unchanged));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn drive_commit(&mut self, mut state: TransactionState) -> Result<(), ProjectError> {
        self.commit_adds(&mut state)?;
        self.commit_deletes(&mut state)?;
        self.commit_modified(&mut state)?;
        self.finish_transaction(state, TransactionKind::Commit)
    }

    fn commit_adds(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let added = state
            .commit_info()
            .map(|info| info.added.clone())
            .unwrap_or_default();
        for package in added {
            if state.phase().is_initial() {
                // The remote package may exist from an earlier interrupted
                // run or a concurrent client.
                if !self.remote.package_exists(&self.name, &package)? {
                    self.remote.create_package(&self.name, &package)?;
                }
                let Some(mut pkg) = self.package(&package)? else {
                    return Err(ProjectError::UnusablePackage(package));
                };
                pkg.commit()?;
                state.advance()?;
            }
            state.processed(&package, Some(EntryState::Unchanged))?;
            self.notifier.processed(&package, Some(EntryState::Unchanged));
        }
        Ok(())
    }

    fn commit_deletes(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let deleted = state
            .commit_info()
            .map(|info| info.deleted.clone())
            .unwrap_or_default();
        for package in deleted {
            if state.phase().is_initial() {
                self.remote.delete_package(&self.name, &package)?;
                state.advance()?;
            }
            self.remove_wc_dir(&package, true)?;
            state.processed(&package, None)?;
            self.notifier.processed(&package, None);
        }
        Ok(())
    }

    fn commit_modified(&mut self, state: &mut TransactionState) -> Result<(), ProjectError> {
        let modified = state
            .commit_info()
            .map(|info| info.modified.clone())
            .unwrap_or_default();
        for package in modified {
            if state.phase().is_initial() {
                let Some(mut pkg) = self.package(&package)? else {
                    return Err(ProjectError::UnusablePackage(package));
                };
                pkg.commit()?;
                state.advance()?;
            }
            state.processed(&package, Some(EntryState::Unchanged))?;
            self.notifier.processed(&package, Some(EntryState::Unchanged));
        }
        Ok(())
    }

    /// Applies the recorded entry states to the manifest, persists it and
    /// erases the record. Safe to repeat: a crash between the manifest write
    /// and the cleanup re-runs the (idempotent) merge on resume.
    fn finish_transaction(
        &mut self,
        state: TransactionState,
        kind: TransactionKind,
    ) -> Result<(), ProjectError> {
        self.manifest.merge(state.entrystates());
        self.store.write_manifest(&self.manifest)?;
        state.cleanup()?;
        self.notifier.finished(kind, false);
        Ok(())
    }

    /// Removes a package directory: tracked files through the package
    /// working copy, then the store link, then the directory if empty, then
    /// the external store. Untracked content is left alone.
    fn remove_wc_dir(&mut self, package: &str, notify: bool) -> Result<(), ProjectError> {
        if let Some(mut pkg) = self.package(package)? {
            for filename in pkg.files()? {
                pkg.remove(&filename)?;
                if notify {
                    self.notifier.processed(&filename, None);
                }
            }
            let pkg_path = pkg.path().to_owned();
            let store_link = pkg_path.join(&self.store.layout().store_dirname);
            let is_link = store_link
                .symlink_metadata()
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if is_link {
                fs::remove_file(&store_link).map_err(io_error(store_link))?;
            }
            let mut entries = fs::read_dir(&pkg_path).map_err(io_error(pkg_path.clone()))?;
            if entries.next().is_none() {
                fs::remove_dir(&pkg_path).map_err(io_error(pkg_path))?;
            }
        }
        let external_store = self.store.data_dir_for(package);
        if external_store.exists() {
            fs::remove_dir_all(&external_store).map_err(io_error(external_store))?;
        }
        Ok(())
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|entry| entry == name) {
        list.push(name.to_owned());
    }
}
