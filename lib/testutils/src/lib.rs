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

//! Shared fixtures for obc-lib tests: a fake package working copy backed by
//! real directories, a fake remote, a recording notifier and store builders.

use std::collections::HashSet;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_dir as symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use obc_lib::manifest::{EntryState, Manifest};
use obc_lib::notify::TransactionNotifier;
use obc_lib::package::{PackageError, PackageFactory, PackageWorkingCopy};
use obc_lib::remote::{RemoteError, RemoteSource};
use obc_lib::transaction::{TransactionInfo, TransactionKind};
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("obc-test-")
        .tempdir()
        .unwrap()
}

/// Asserts that every test module in `test_dir` is declared in `runner.rs`.
pub fn assert_no_forgotten_test_files(test_dir: &Path) {
    let runner_path = test_dir.join("runner.rs");
    let runner = fs::read_to_string(&runner_path).unwrap();
    let entries = fs::read_dir(test_dir).unwrap();
    for entry in entries {
        let path = entry.unwrap().path();
        if let Some(ext) = path.extension() {
            let name = path.file_stem().unwrap();
            if ext == "rs" && name != "runner" {
                let search = format!("mod {};", name.to_str().unwrap());
                assert!(
                    runner.contains(&search),
                    "missing `{search}` declaration in {}",
                    runner_path.display()
                );
            }
        }
    }
}

/// Lays down the store of a project working copy by hand: manifest entries
/// with arbitrary states, plus a package working-copy directory (a tracked
/// file and a store link into `data/`) for each name in `wc_dirs`.
pub fn write_project_fixture(
    root: &Path,
    project: &str,
    api_url: &str,
    entries: &[(&str, char)],
    wc_dirs: &[&str],
) {
    let store = root.join(".osc");
    fs::create_dir_all(store.join("data")).unwrap();
    fs::write(store.join("_project"), format!("{project}\n")).unwrap();
    fs::write(store.join("_apiurl"), format!("{api_url}\n")).unwrap();
    let mut manifest = Manifest::default();
    for (name, state) in entries {
        manifest.set(name, EntryState::from_char(*state).unwrap());
    }
    fs::write(store.join("_packages"), manifest.to_xml()).unwrap();
    for name in wc_dirs {
        write_package_wc_fixture(root, name);
    }
}

/// Creates the directory of one package working copy the way [`TestPackage`]
/// lays it out, with its external store under `<root>/.osc/data/<name>`.
pub fn write_package_wc_fixture(root: &Path, name: &str) {
    let data_dir = root.join(".osc").join("data").join(name);
    let pkg_dir = root.join(name);
    fs::create_dir_all(&data_dir).unwrap();
    fs::create_dir_all(&pkg_dir).unwrap();
    symlink(&data_dir, pkg_dir.join(".osc")).unwrap();
    fs::write(pkg_dir.join(format!("{name}.spec")), b"fixture\n").unwrap();
}

#[derive(Default)]
struct RemoteState {
    packages: Vec<String>,
    log: Vec<String>,
}

/// In-memory remote with a single project's package list and a call log.
#[derive(Clone, Default)]
pub struct TestRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl TestRemote {
    pub fn new(packages: &[&str]) -> TestRemote {
        let remote = TestRemote::default();
        remote.set_packages(packages);
        remote
    }

    pub fn set_packages(&self, packages: &[&str]) {
        self.state.lock().unwrap().packages =
            packages.iter().map(|name| (*name).to_owned()).collect();
    }

    pub fn packages(&self) -> Vec<String> {
        self.state.lock().unwrap().packages.clone()
    }

    /// All calls made so far, e.g. `"create prj/foo"`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
}

impl RemoteSource for TestRemote {
    fn list_packages(&self, project: &str) -> Result<Vec<String>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("list {project}"));
        Ok(state.packages.clone())
    }

    fn package_exists(&self, project: &str, package: &str) -> Result<bool, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("exists {project}/{package}"));
        Ok(state.packages.iter().any(|name| name == package))
    }

    fn create_package(&self, project: &str, package: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("create {project}/{package}"));
        state.packages.push(package.to_owned());
        Ok(())
    }

    fn delete_package(&self, project: &str, package: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("delete {project}/{package}"));
        state.packages.retain(|name| name != package);
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    not_updateable: HashSet<String>,
    not_commitable: HashSet<String>,
    modified: HashSet<String>,
    fail_update: HashSet<String>,
    fail_commit: HashSet<String>,
    log: Vec<String>,
}

/// Factory for [`TestPackage`] working copies, with per-package switches for
/// the status flags and injectable `update`/`commit` failures.
#[derive(Clone, Default)]
pub struct TestPackageFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl TestPackageFactory {
    pub fn new() -> TestPackageFactory {
        TestPackageFactory::default()
    }

    pub fn set_not_updateable(&self, name: &str) {
        self.state.lock().unwrap().not_updateable.insert(name.to_owned());
    }

    pub fn set_not_commitable(&self, name: &str) {
        self.state.lock().unwrap().not_commitable.insert(name.to_owned());
    }

    pub fn set_modified(&self, name: &str) {
        self.state.lock().unwrap().modified.insert(name.to_owned());
    }

    /// Makes `update()` of `name` fail until cleared, simulating a crash
    /// between two processed packages.
    pub fn set_update_failure(&self, name: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_update.insert(name.to_owned());
        } else {
            state.fail_update.remove(name);
        }
    }

    pub fn set_commit_failure(&self, name: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_commit.insert(name.to_owned());
        } else {
            state.fail_commit.remove(name);
        }
    }

    /// `init`/`update`/`commit` calls in order, e.g. `"update foo"`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
}

impl PackageFactory for TestPackageFactory {
    fn init_package(
        &self,
        path: &Path,
        _project: &str,
        name: &str,
        _api_url: &str,
        external_store: &Path,
    ) -> Result<Box<dyn PackageWorkingCopy>, PackageError> {
        fs::create_dir_all(path).map_err(PackageError::new)?;
        let link = path.join(".osc");
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link).map_err(PackageError::new)?;
        }
        symlink(external_store, &link).map_err(PackageError::new)?;
        self.state.lock().unwrap().log.push(format!("init {name}"));
        Ok(Box::new(TestPackage {
            path: path.to_owned(),
            name: name.to_owned(),
            state: self.state.clone(),
        }))
    }

    fn load_package(&self, path: &Path) -> Result<Box<dyn PackageWorkingCopy>, PackageError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| PackageError::new(format!("bad package path {}", path.display())))?;
        Ok(Box::new(TestPackage {
            path: path.to_owned(),
            name,
            state: self.state.clone(),
        }))
    }

    fn is_working_copy(&self, path: &Path) -> bool {
        path.join(".osc").symlink_metadata().is_ok()
    }
}

/// A package working copy made of a real directory: tracked files are the
/// non-hidden entries, `update()` materialises `<name>.spec` like a checkout
/// would, and the status flags come from the factory switches.
pub struct TestPackage {
    path: PathBuf,
    name: String,
    state: Arc<Mutex<FactoryState>>,
}

impl PackageWorkingCopy for TestPackage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn update(&mut self) -> Result<(), PackageError> {
        {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("update {}", self.name));
            if state.fail_update.contains(&self.name) {
                return Err(PackageError::new(format!(
                    "injected update failure for {}",
                    self.name
                )));
            }
        }
        fs::write(self.path.join(format!("{}.spec", self.name)), b"fetched\n")
            .map_err(PackageError::new)
    }

    fn commit(&mut self) -> Result<(), PackageError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("commit {}", self.name));
        if state.fail_commit.contains(&self.name) {
            return Err(PackageError::new(format!(
                "injected commit failure for {}",
                self.name
            )));
        }
        Ok(())
    }

    fn is_updateable(&self) -> bool {
        !self.state.lock().unwrap().not_updateable.contains(&self.name)
    }

    fn is_commitable(&self) -> bool {
        !self.state.lock().unwrap().not_commitable.contains(&self.name)
    }

    fn is_modified(&self) -> bool {
        self.state.lock().unwrap().modified.contains(&self.name)
    }

    fn files(&self) -> Result<Vec<String>, PackageError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(PackageError::new)? {
            let entry = entry.map_err(PackageError::new)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    fn remove(&mut self, filename: &str) -> Result<(), PackageError> {
        fs::remove_file(self.path.join(filename)).map_err(PackageError::new)
    }
}

/// Notifier that records every event as a string, with an optional veto.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<String>>>,
    veto: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new() -> RecordingNotifier {
        RecordingNotifier::default()
    }

    pub fn set_veto(&self, veto: bool) {
        self.veto.store(veto, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TransactionNotifier for RecordingNotifier {
    fn begin(&mut self, kind: TransactionKind, _info: &TransactionInfo) -> bool {
        self.events.lock().unwrap().push(format!("begin {kind}"));
        !self.veto.load(Ordering::SeqCst)
    }

    fn processed(&mut self, item: &str, new_state: Option<EntryState>) {
        let state = new_state.map(|state| state.as_char()).unwrap_or('-');
        self.events
            .lock()
            .unwrap()
            .push(format!("processed {item} [{state}]"));
    }

    fn finished(&mut self, kind: TransactionKind, aborted: bool) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finished {kind} aborted={aborted}"));
    }
}
