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

use std::fs;
use std::path::Path;
use std::sync::Arc;

use assert_matches::assert_matches;
use maplit::btreemap;
use obc_lib::manifest::EntryState;
use obc_lib::project::{PackageStatus, Project, ProjectError};
use obc_lib::store::{ProjectStore, StoreError};
use obc_lib::transaction::{CommitInfo, TransactionInfo, TransactionKind, TransactionState};
use pretty_assertions::assert_eq;
use testutils::{write_project_fixture, TestPackageFactory, TestRemote};

fn open_project(path: &Path, remote: &TestRemote, factory: &TestPackageFactory) -> Project {
    Project::open(path, Arc::new(remote.clone()), Arc::new(factory.clone())).unwrap()
}

#[test]
fn test_init_creates_store_files() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    let project = Project::init(
        root,
        "openSUSE:Tools",
        "https://api.opensuse.org",
        Arc::new(remote),
        Arc::new(factory),
    )
    .unwrap();

    assert_eq!(
        fs::read_to_string(root.join(".osc/_project")).unwrap(),
        "openSUSE:Tools\n"
    );
    assert_eq!(
        fs::read_to_string(root.join(".osc/_apiurl")).unwrap(),
        "https://api.opensuse.org\n"
    );
    assert_eq!(
        fs::read_to_string(root.join(".osc/_packages")).unwrap(),
        "<packages/>\n"
    );
    assert!(root.join(".osc/data").is_dir());
    assert_eq!(project.name(), "openSUSE:Tools");
    assert_eq!(project.api_url(), "https://api.opensuse.org");
    assert_eq!(project.packages(), Vec::<String>::new());
}

#[test]
fn test_init_refuses_existing_working_copy() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    Project::init(
        root,
        "prj",
        "http://localhost",
        Arc::new(remote.clone()),
        Arc::new(factory.clone()),
    )
    .unwrap();
    assert_matches!(
        Project::init(
            root,
            "other",
            "http://localhost",
            Arc::new(remote),
            Arc::new(factory),
        ),
        Err(ProjectError::Store(StoreError::AlreadyInitialized(_)))
    );
}

#[test]
fn test_reopen_equals_initial_state() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    {
        Project::init(
            root,
            "prj",
            "http://localhost",
            Arc::new(remote.clone()),
            Arc::new(factory.clone()),
        )
        .unwrap();
    }
    let project = open_project(root, &remote, &factory);
    assert_eq!(project.name(), "prj");
    assert_eq!(project.api_url(), "http://localhost");
    assert_eq!(project.packages(), Vec::<String>::new());
}

#[test]
fn test_open_reports_missing_store_paths() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[], &[]);
    fs::remove_file(root.join(".osc/_packages")).unwrap();
    let err = Project::open(
        root,
        Arc::new(TestRemote::default()),
        Arc::new(TestPackageFactory::new()),
    )
    .unwrap_err();
    assert_matches!(
        err,
        ProjectError::Inconsistent { missing, raw_manifest: None, .. } if missing == ["_packages"]
    );
}

#[test]
fn test_open_reports_corrupt_manifest() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[], &[]);
    fs::write(root.join(".osc/_packages"), b"<invalid").unwrap();
    let err = Project::open(
        root,
        Arc::new(TestRemote::default()),
        Arc::new(TestPackageFactory::new()),
    )
    .unwrap_err();
    assert_matches!(
        err,
        ProjectError::Inconsistent { missing, raw_manifest: Some(raw), .. }
            if missing.is_empty() && raw == b"<invalid"
    );
}

fn status_fixture(root: &Path) {
    write_project_fixture(
        root,
        "prj",
        "http://localhost",
        &[
            ("foo", ' '),
            ("bar", 'A'),
            ("abc", 'D'),
            ("xxx", ' '),
            ("del", 'D'),
        ],
        &["foo", "bar", "abc"],
    );
    fs::create_dir(root.join("asdf")).unwrap();
}

#[test]
fn test_status_ladder() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let project = open_project(root, &TestRemote::default(), &TestPackageFactory::new());
    assert_eq!(project.status("foo"), PackageStatus::Unchanged);
    assert_eq!(project.status("bar"), PackageStatus::Added);
    assert_eq!(project.status("abc"), PackageStatus::Deleted);
    assert_eq!(project.status("xxx"), PackageStatus::Missing);
    // del is not missing because it is also marked for deletion.
    assert_eq!(project.status("del"), PackageStatus::Deleted);
    assert_eq!(project.status("asdf"), PackageStatus::Untracked);
}

#[test]
fn test_status_is_total() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let project = open_project(root, &TestRemote::default(), &TestPackageFactory::new());
    for name in ["", "no-such-package", "with/slash", "..", "_packages"] {
        assert_eq!(project.status(name), PackageStatus::Untracked, "{name:?}");
    }
}

#[test]
fn test_package_handles() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let project = open_project(root, &TestRemote::default(), &TestPackageFactory::new());
    assert!(project.package("foo").unwrap().is_some());
    // Deleted with a working copy still on disk.
    assert!(project.package("abc").unwrap().is_some());
    // Missing and untracked have no handle; neither does a deleted package
    // whose directory is already gone.
    assert!(project.package("xxx").unwrap().is_none());
    assert!(project.package("asdf").unwrap().is_none());
    assert!(project.package("del").unwrap().is_none());
}

#[test]
fn test_add_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    Project::init(
        root,
        "prj",
        "http://localhost",
        Arc::new(remote.clone()),
        Arc::new(factory.clone()),
    )
    .unwrap();
    fs::create_dir(root.join("newpkg")).unwrap();

    let mut project = open_project(root, &remote, &factory);
    project.add("newpkg").unwrap();
    assert_eq!(project.status("newpkg"), PackageStatus::Added);
    assert_eq!(project.packages(), ["newpkg"]);
    assert!(root.join(".osc/data/newpkg").is_dir());
    assert!(root.join("newpkg/.osc").symlink_metadata().is_ok());
    assert_eq!(factory.log(), ["init newpkg"]);

    // Reopening sees the persisted manifest.
    let project = open_project(root, &remote, &factory);
    assert_eq!(project.status("newpkg"), PackageStatus::Added);
}

#[test]
fn test_add_then_remove_drops_entry() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    Project::init(
        root,
        "prj",
        "http://localhost",
        Arc::new(remote.clone()),
        Arc::new(factory.clone()),
    )
    .unwrap();
    fs::create_dir(root.join("newpkg")).unwrap();

    let mut project = open_project(root, &remote, &factory);
    project.add("newpkg").unwrap();
    project.remove("newpkg").unwrap();
    assert_eq!(project.packages(), Vec::<String>::new());
    assert_eq!(project.status("newpkg"), PackageStatus::Untracked);
}

#[test]
fn test_add_misuse() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let factory = TestPackageFactory::new();
    let mut project = open_project(root, &TestRemote::default(), &factory);

    assert_matches!(
        project.add("foo"),
        Err(ProjectError::AlreadyTracked(name)) if name == "foo"
    );
    assert_matches!(project.add("no-dir"), Err(ProjectError::NotADirectory(_)));

    // An untracked directory that is already a package working copy.
    testutils::write_package_wc_fixture(root, "rogue");
    assert_matches!(
        project.add("rogue"),
        Err(ProjectError::NestedWorkingCopy(_))
    );
}

#[test]
fn test_remove_marks_deleted() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let mut project = open_project(root, &TestRemote::default(), &TestPackageFactory::new());
    project.remove("foo").unwrap();
    assert_eq!(project.status("foo"), PackageStatus::Deleted);
    // The directory is left alone until the deletion is committed.
    assert!(root.join("foo").is_dir());

    assert_matches!(
        project.remove("asdf"),
        Err(ProjectError::NotTracked(name)) if name == "asdf"
    );
}

#[test]
fn test_remove_missing_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    status_fixture(root);
    let mut project = open_project(root, &TestRemote::default(), &TestPackageFactory::new());
    project.remove("xxx").unwrap();
    assert_eq!(project.status("xxx"), PackageStatus::Deleted);
}

#[test]
fn test_pending_transaction_queries() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::default();
    let factory = TestPackageFactory::new();
    Project::init(
        root,
        "prj",
        "http://localhost",
        Arc::new(remote.clone()),
        Arc::new(factory.clone()),
    )
    .unwrap();
    let project = open_project(root, &remote, &factory);
    assert_eq!(project.pending_transaction().unwrap(), None);
    assert!(project.is_updateable().unwrap());
    assert!(project.is_commitable().unwrap());

    let store = ProjectStore::new(root.to_owned());
    let info = TransactionInfo::Commit(CommitInfo {
        added: vec!["x".to_owned()],
        ..CommitInfo::default()
    });
    let mut state = TransactionState::begin(&store, info, btreemap! {}).unwrap();
    assert_eq!(
        project.pending_transaction().unwrap(),
        Some(TransactionKind::Commit)
    );
    // Untouched records of the other kind can be rolled back, so both
    // operations are still admissible.
    assert!(project.is_updateable().unwrap());
    assert!(project.is_commitable().unwrap());

    state.processed("x", Some(EntryState::Unchanged)).unwrap();
    assert!(!project.is_updateable().unwrap());
    assert!(project.is_commitable().unwrap());
}
