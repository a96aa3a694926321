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
use obc_lib::project::{PackageStatus, Project, ProjectError};
use obc_lib::store::ProjectStore;
use obc_lib::transaction::{
    CommitInfo, TransactionInfo, TransactionKind, TransactionState, UpdateInfo,
};
use pretty_assertions::assert_eq;
use testutils::{write_project_fixture, RecordingNotifier, TestPackageFactory, TestRemote};

fn open_fixture(root: &Path, remote: &TestRemote, factory: &TestPackageFactory) -> Project {
    Project::open(root, Arc::new(remote.clone()), Arc::new(factory.clone())).unwrap()
}

fn count_in_log(log: &[String], entry: &str) -> usize {
    log.iter().filter(|line| *line == entry).count()
}

/// A working copy with one freshly added package (`newpkg`, state `A`).
fn added_package_fixture(root: &Path, remote: &TestRemote, factory: &TestPackageFactory) -> Project {
    Project::init(
        root,
        "prj",
        "http://localhost",
        Arc::new(remote.clone()),
        Arc::new(factory.clone()),
    )
    .unwrap();
    fs::create_dir(root.join("newpkg")).unwrap();
    fs::write(root.join("newpkg/newpkg.spec"), b"local\n").unwrap();
    let mut project = open_fixture(root, remote, factory);
    project.add("newpkg").unwrap();
    project
}

#[test]
fn test_commit_added_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::new(&[]);
    let factory = TestPackageFactory::new();
    let mut project = added_package_fixture(root, &remote, &factory);

    project.commit(&[]).unwrap();

    assert_eq!(project.status("newpkg"), PackageStatus::Unchanged);
    assert_eq!(count_in_log(&remote.log(), "exists prj/newpkg"), 1);
    assert_eq!(count_in_log(&remote.log(), "create prj/newpkg"), 1);
    assert_eq!(count_in_log(&factory.log(), "commit newpkg"), 1);
    assert_eq!(project.pending_transaction().unwrap(), None);
}

#[test]
fn test_commit_add_skips_existing_remote_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::new(&["newpkg"]);
    let factory = TestPackageFactory::new();
    let mut project = added_package_fixture(root, &remote, &factory);

    project.commit(&[]).unwrap();

    assert_eq!(count_in_log(&remote.log(), "create prj/newpkg"), 0);
    assert_eq!(count_in_log(&factory.log(), "commit newpkg"), 1);
    assert_eq!(project.status("newpkg"), PackageStatus::Unchanged);
}

#[test]
fn test_commit_deleted_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[("gone", ' ')], &["gone"]);
    let remote = TestRemote::new(&["gone"]);
    let factory = TestPackageFactory::new();
    let mut project = open_fixture(root, &remote, &factory);
    project.remove("gone").unwrap();

    project.commit(&[]).unwrap();

    assert_eq!(count_in_log(&remote.log(), "delete prj/gone"), 1);
    assert_eq!(project.packages(), Vec::<String>::new());
    assert!(!root.join("gone").exists());
    assert!(!root.join(".osc/data/gone").exists());
}

#[test]
fn test_commit_modified_package() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[("foo", ' ')], &["foo"]);
    let remote = TestRemote::new(&["foo"]);
    let factory = TestPackageFactory::new();
    factory.set_modified("foo");
    let mut project = open_fixture(root, &remote, &factory);

    project.commit(&[]).unwrap();

    assert_eq!(count_in_log(&factory.log(), "commit foo"), 1);
    assert_eq!(project.status("foo"), PackageStatus::Unchanged);
    assert_eq!(project.pending_transaction().unwrap(), None);
}

#[test]
fn test_commit_unchanged_package_is_noop() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[("foo", ' ')], &["foo"]);
    let remote = TestRemote::new(&["foo"]);
    let factory = TestPackageFactory::new();
    let mut project = open_fixture(root, &remote, &factory);

    project.commit(&[]).unwrap();

    assert_eq!(count_in_log(&factory.log(), "commit foo"), 0);
    assert_eq!(project.status("foo"), PackageStatus::Unchanged);
    assert_eq!(project.pending_transaction().unwrap(), None);
}

#[test]
fn test_commit_rejects_conflicts() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[("foo", ' ')], &["foo"]);
    let remote = TestRemote::new(&["foo"]);
    let factory = TestPackageFactory::new();
    factory.set_modified("foo");
    factory.set_not_commitable("foo");
    let mut project = open_fixture(root, &remote, &factory);

    assert_matches!(
        project.commit(&[]),
        Err(ProjectError::Conflicts(names)) if names == ["foo"]
    );
    assert_eq!(project.pending_transaction().unwrap(), None);
    assert_eq!(count_in_log(&factory.log(), "commit foo"), 0);
}

#[test]
fn test_commit_resumes_after_interruption() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(
        root,
        "prj",
        "http://localhost",
        &[("m1", ' '), ("m2", ' ')],
        &["m1", "m2"],
    );
    let remote = TestRemote::new(&["m1", "m2"]);
    let factory = TestPackageFactory::new();
    factory.set_modified("m1");
    factory.set_modified("m2");
    let mut project = open_fixture(root, &remote, &factory);

    factory.set_commit_failure("m2", true);
    assert_matches!(project.commit(&[]), Err(ProjectError::Package(_)));
    assert_eq!(
        project.pending_transaction().unwrap(),
        Some(TransactionKind::Commit)
    );

    factory.set_commit_failure("m2", false);
    project.commit(&[]).unwrap();

    let log = factory.log();
    assert_eq!(count_in_log(&log, "commit m1"), 1);
    assert_eq!(count_in_log(&log, "commit m2"), 2);
    assert_eq!(project.status("m1"), PackageStatus::Unchanged);
    assert_eq!(project.status("m2"), PackageStatus::Unchanged);
    assert_eq!(project.pending_transaction().unwrap(), None);
}

#[test]
fn test_commit_resume_skips_transferred_head() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[("done", 'A')], &["done"]);
    let remote = TestRemote::new(&["done"]);
    let factory = TestPackageFactory::new();

    // A record whose head already reached the remote (the phase is advanced)
    // but crashed before being marked processed.
    let store = ProjectStore::new(root.to_owned());
    let info = TransactionInfo::Commit(CommitInfo {
        added: vec!["done".to_owned()],
        ..CommitInfo::default()
    });
    let mut state = TransactionState::begin(
        &store,
        info,
        btreemap! {"done".to_owned() => obc_lib::manifest::EntryState::Added},
    )
    .unwrap();
    state.advance().unwrap();
    drop(state);

    let mut project = open_fixture(root, &remote, &factory);
    project.commit(&[]).unwrap();

    // Neither the remote nor the package working copy is touched again.
    assert_eq!(remote.log(), Vec::<String>::new());
    assert_eq!(count_in_log(&factory.log(), "commit done"), 0);
    assert_eq!(project.status("done"), PackageStatus::Unchanged);
    assert_eq!(project.pending_transaction().unwrap(), None);
}

#[test]
fn test_commit_blocked_by_progressed_update() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(root, "prj", "http://localhost", &[], &[]);
    let remote = TestRemote::new(&[]);
    let factory = TestPackageFactory::new();

    let store = ProjectStore::new(root.to_owned());
    let info = TransactionInfo::Update(UpdateInfo {
        added: vec!["x".to_owned()],
        ..UpdateInfo::default()
    });
    let mut state = TransactionState::begin(&store, info, btreemap! {}).unwrap();
    state.processed("x", Some(obc_lib::manifest::EntryState::Unchanged)).unwrap();
    drop(state);

    let mut project = open_fixture(root, &remote, &factory);
    assert_matches!(
        project.commit(&[]),
        Err(ProjectError::PendingTransaction(TransactionKind::Update))
    );
}

#[test]
fn test_commit_selection() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    write_project_fixture(
        root,
        "prj",
        "http://localhost",
        &[("one", 'A'), ("two", ' ')],
        &["one", "two"],
    );
    let remote = TestRemote::new(&["two"]);
    let factory = TestPackageFactory::new();
    factory.set_modified("two");
    let mut project = open_fixture(root, &remote, &factory);

    project.commit(&["two"]).unwrap();

    assert_eq!(count_in_log(&factory.log(), "commit two"), 1);
    assert_eq!(count_in_log(&factory.log(), "commit one"), 0);
    // The unselected scheduled add keeps its state.
    assert_eq!(project.status("one"), PackageStatus::Added);
    assert_eq!(project.status("two"), PackageStatus::Unchanged);
}

#[test]
fn test_commit_notifier_events() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::new(&[]);
    let factory = TestPackageFactory::new();
    let notifier = RecordingNotifier::new();
    let mut project =
        added_package_fixture(root, &remote, &factory).with_notifier(Box::new(notifier.clone()));

    project.commit(&[]).unwrap();

    assert_eq!(
        notifier.events(),
        [
            "begin commit",
            "processed newpkg [ ]",
            "finished commit aborted=false"
        ]
    );
}

#[test]
fn test_commit_vetoed_by_notifier() {
    let temp_dir = testutils::new_temp_dir();
    let root = temp_dir.path();
    let remote = TestRemote::new(&[]);
    let factory = TestPackageFactory::new();
    let notifier = RecordingNotifier::new();
    notifier.set_veto(true);
    let mut project =
        added_package_fixture(root, &remote, &factory).with_notifier(Box::new(notifier.clone()));

    project.commit(&[]).unwrap();

    assert_eq!(project.status("newpkg"), PackageStatus::Added);
    assert_eq!(project.pending_transaction().unwrap(), None);
    assert_eq!(
        notifier.events(),
        ["begin commit", "finished commit aborted=true"]
    );
}
