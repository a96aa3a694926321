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

//! The persistent record of an in-flight `update` or `commit`.
//!
//! The record is rewritten atomically after every phase change and every
//! processed package, so a crashed transaction can be resumed: the on-disk
//! lists always name exactly the packages still to be driven, and
//! `entrystates` the manifest changes to apply at the end.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str;

use itertools::Itertools;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::file_util::write_file_atomic;
use crate::manifest::EntryState;
use crate::store::ProjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Update,
    Commit,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Update => "update",
            TransactionKind::Commit => "commit",
        }
    }

    fn parse(value: &str) -> Option<TransactionKind> {
        match value {
            "update" => Some(TransactionKind::Update),
            "commit" => Some(TransactionKind::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase tag of a transaction record.
///
/// Each kind has two phases: the initial one, in which no irreversible work
/// has happened for the package currently at the head of a work-list, and the
/// advanced one, entered once it has. `processed` drops the record back to
/// the initial phase so that the next package is always driven from its own
/// beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Initial update phase: nothing irreversible yet for the current head.
    Prepare,
    /// The current head package's filesystem transition has begun.
    Updating,
    /// Initial commit phase: nothing has been sent for the current head.
    Transfer,
    /// The current head package has been transferred to the remote.
    Committing,
}

impl TransactionPhase {
    pub fn initial(kind: TransactionKind) -> TransactionPhase {
        match kind {
            TransactionKind::Update => TransactionPhase::Prepare,
            TransactionKind::Commit => TransactionPhase::Transfer,
        }
    }

    pub fn advanced(kind: TransactionKind) -> TransactionPhase {
        match kind {
            TransactionKind::Update => TransactionPhase::Updating,
            TransactionKind::Commit => TransactionPhase::Committing,
        }
    }

    pub fn is_initial(self) -> bool {
        matches!(self, TransactionPhase::Prepare | TransactionPhase::Transfer)
    }

    pub fn kind(self) -> TransactionKind {
        match self {
            TransactionPhase::Prepare | TransactionPhase::Updating => TransactionKind::Update,
            TransactionPhase::Transfer | TransactionPhase::Committing => TransactionKind::Commit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionPhase::Prepare => "prepare",
            TransactionPhase::Updating => "updating",
            TransactionPhase::Transfer => "transfer",
            TransactionPhase::Committing => "committing",
        }
    }

    fn parse(value: &str) -> Option<TransactionPhase> {
        match value {
            "prepare" => Some(TransactionPhase::Prepare),
            "updating" => Some(TransactionPhase::Updating),
            "transfer" => Some(TransactionPhase::Transfer),
            "committing" => Some(TransactionPhase::Committing),
            _ => None,
        }
    }
}

/// Work-lists of an update, in processing order: adds, deletes, candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Exist both remotely and locally; eligible for a plain update.
    pub candidates: Vec<String>,
    /// Exist remotely but not locally; will be checked out.
    pub added: Vec<String>,
    /// Tracked locally but gone remotely; will be removed.
    pub deleted: Vec<String>,
    /// Refused until the caller resolves them.
    pub conflicted: Vec<String>,
}

impl UpdateInfo {
    /// The buckets partition the classified packages; overlap is a bug.
    pub fn assert_disjoint(&self) {
        assert_disjoint(&[&self.candidates, &self.added, &self.deleted, &self.conflicted]);
    }
}

/// Work-lists of a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub unchanged: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<String>,
    pub conflicted: Vec<String>,
}

impl CommitInfo {
    pub fn assert_disjoint(&self) {
        assert_disjoint(&[
            &self.unchanged,
            &self.added,
            &self.deleted,
            &self.modified,
            &self.conflicted,
        ]);
    }
}

fn assert_disjoint(lists: &[&Vec<String>]) {
    let duplicates: Vec<_> = lists.iter().flat_map(|list| list.iter()).duplicates().collect();
    assert!(
        duplicates.is_empty(),
        "classification produced overlapping buckets: {duplicates:?}"
    );
}

/// Classified work-lists of either transaction kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionInfo {
    Update(UpdateInfo),
    Commit(CommitInfo),
}

impl TransactionInfo {
    pub fn kind(&self) -> TransactionKind {
        match self {
            TransactionInfo::Update(_) => TransactionKind::Update,
            TransactionInfo::Commit(_) => TransactionKind::Commit,
        }
    }

    pub fn conflicted(&self) -> &[String] {
        match self {
            TransactionInfo::Update(info) => &info.conflicted,
            TransactionInfo::Commit(info) => &info.conflicted,
        }
    }

    pub fn as_update(&self) -> Option<&UpdateInfo> {
        match self {
            TransactionInfo::Update(info) => Some(info),
            TransactionInfo::Commit(_) => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitInfo> {
        match self {
            TransactionInfo::Commit(info) => Some(info),
            TransactionInfo::Update(_) => None,
        }
    }

    fn lists(&self) -> Vec<(&'static str, &Vec<String>)> {
        match self {
            TransactionInfo::Update(info) => vec![
                ("candidates", &info.candidates),
                ("added", &info.added),
                ("deleted", &info.deleted),
                ("conflicted", &info.conflicted),
            ],
            TransactionInfo::Commit(info) => vec![
                ("unchanged", &info.unchanged),
                ("added", &info.added),
                ("deleted", &info.deleted),
                ("modified", &info.modified),
                ("conflicted", &info.conflicted),
            ],
        }
    }

    fn lists_mut(&mut self) -> Vec<(&'static str, &mut Vec<String>)> {
        match self {
            TransactionInfo::Update(info) => vec![
                ("candidates", &mut info.candidates),
                ("added", &mut info.added),
                ("deleted", &mut info.deleted),
                ("conflicted", &mut info.conflicted),
            ],
            TransactionInfo::Commit(info) => vec![
                ("unchanged", &mut info.unchanged),
                ("added", &mut info.added),
                ("deleted", &mut info.deleted),
                ("modified", &mut info.modified),
                ("conflicted", &mut info.conflicted),
            ],
        }
    }

    fn remove(&mut self, package: &str) -> bool {
        for (_, list) in self.lists_mut() {
            if let Some(pos) = list.iter().position(|name| name == package) {
                list.remove(pos);
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Error)]
pub enum TransactionStateError {
    #[error("Reading transaction state from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Writing transaction state to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Creating directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Removing {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Decoding transaction state from {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("A transaction is already recorded at {path}")]
    AlreadyExists { path: PathBuf },
    #[error("Package {package:?} is not part of this transaction")]
    UnknownPackage { package: String },
}

/// The typed, persistent record of an in-flight transaction.
#[derive(Debug)]
pub struct TransactionState {
    record_path: PathBuf,
    store_dir: PathBuf,
    kind: TransactionKind,
    phase: TransactionPhase,
    /// Store-relative scratch directory for staged package adds.
    location: String,
    info: TransactionInfo,
    processed: Vec<String>,
    entrystates: BTreeMap<String, Option<EntryState>>,
}

impl TransactionState {
    /// Reads the current record, or `None` if no transaction is in flight.
    pub fn read(store: &ProjectStore) -> Result<Option<TransactionState>, TransactionStateError> {
        let path = store.transaction_file();
        let data = match fs::read(&path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(TransactionStateError::Read { path, source }),
            Ok(data) => data,
        };
        let decode_err = |reason: String| TransactionStateError::Decode {
            path: path.clone(),
            reason,
        };
        let text = str::from_utf8(&data).map_err(|err| decode_err(err.to_string()))?;
        let state = Self::parse(text, store).map_err(decode_err)?;
        Ok(Some(state))
    }

    /// Writes a fresh record for a classified transaction. `prior_states` is
    /// the manifest state of every tracked package; a package the transaction
    /// never touches keeps its state at the final merge.
    pub fn begin(
        store: &ProjectStore,
        info: TransactionInfo,
        prior_states: BTreeMap<String, EntryState>,
    ) -> Result<TransactionState, TransactionStateError> {
        let record_path = store.transaction_file();
        if record_path.exists() {
            return Err(TransactionStateError::AlreadyExists { path: record_path });
        }
        let kind = info.kind();
        let state = TransactionState {
            record_path,
            store_dir: store.store_dir(),
            kind,
            phase: TransactionPhase::initial(kind),
            location: store.layout().scratch_subdir.clone(),
            info,
            processed: Vec::new(),
            entrystates: prior_states
                .into_iter()
                .map(|(name, state)| (name, Some(state)))
                .collect(),
        };
        let scratch = state.location_path();
        fs::create_dir_all(&scratch).map_err(|source| TransactionStateError::CreateDir {
            path: scratch,
            source,
        })?;
        state.save()?;
        Ok(state)
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    pub fn update_info(&self) -> Option<&UpdateInfo> {
        self.info.as_update()
    }

    pub fn commit_info(&self) -> Option<&CommitInfo> {
        self.info.as_commit()
    }

    /// Absolute path of the scratch directory for staged adds.
    pub fn location_path(&self) -> PathBuf {
        self.store_dir.join(&self.location)
    }

    /// Manifest states to apply when the transaction completes. `None` means
    /// the entry is removed.
    pub fn entrystates(&self) -> &BTreeMap<String, Option<EntryState>> {
        &self.entrystates
    }

    pub fn processed_packages(&self) -> &[String] {
        &self.processed
    }

    /// Whether any package has completed; once one has, the record can no
    /// longer be rolled back.
    pub fn has_progress(&self) -> bool {
        !self.processed.is_empty()
    }

    /// Moves the record into the kind's advanced phase. Idempotent, so a
    /// resumed drive may re-assert it.
    pub fn advance(&mut self) -> Result<(), TransactionStateError> {
        self.phase = TransactionPhase::advanced(self.kind);
        self.save()
    }

    /// Marks `package` done: drops it from its work-list, records the
    /// manifest state it must end up with, and resets the phase so the next
    /// package is driven from its own beginning.
    pub fn processed(
        &mut self,
        package: &str,
        new_state: Option<EntryState>,
    ) -> Result<(), TransactionStateError> {
        if !self.info.remove(package) {
            return Err(TransactionStateError::UnknownPackage {
                package: package.to_owned(),
            });
        }
        self.processed.push(package.to_owned());
        self.entrystates.insert(package.to_owned(), new_state);
        self.phase = TransactionPhase::initial(self.kind);
        self.save()
    }

    /// Discards `package` from its work-list without recording a manifest
    /// change for it, and resets the phase. This drops a package from the
    /// transaction entirely; its prior manifest state still applies.
    pub fn clear_info(&mut self, package: &str) -> Result<(), TransactionStateError> {
        self.info.remove(package);
        self.phase = TransactionPhase::initial(self.kind);
        self.save()
    }

    /// Whether erasing the record would lose anything: only an untouched
    /// record in its initial phase can be rolled back.
    pub fn can_rollback(&self) -> bool {
        self.phase.is_initial() && !self.has_progress()
    }

    /// Erases the record if nothing irreversible has happened yet. Returns
    /// whether a record was erased.
    pub fn rollback(store: &ProjectStore) -> Result<bool, TransactionStateError> {
        match TransactionState::read(store)? {
            Some(state) if state.can_rollback() => {
                state.cleanup()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes the record and the scratch area.
    pub fn cleanup(self) -> Result<(), TransactionStateError> {
        let scratch = self.location_path();
        if scratch.is_dir() {
            fs::remove_dir_all(&scratch).map_err(|source| TransactionStateError::Remove {
                path: scratch,
                source,
            })?;
        }
        match fs::remove_file(&self.record_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TransactionStateError::Remove {
                path: self.record_path,
                source,
            }),
        }
    }

    fn save(&self) -> Result<(), TransactionStateError> {
        write_file_atomic(&self.store_dir, &self.record_path, &self.to_xml()).map_err(|source| {
            TransactionStateError::Write {
                path: self.record_path.clone(),
                source,
            }
        })
    }

    fn to_xml(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        writer
            .create_element("transaction")
            .with_attribute(("name", self.kind.as_str()))
            .with_attribute(("state", self.phase.as_str()))
            .with_attribute(("location", self.location.as_str()))
            .write_inner_content(|writer| -> io::Result<()> {
                let lists = self
                    .info
                    .lists()
                    .into_iter()
                    .chain([("processed", &self.processed)]);
                for (name, packages) in lists {
                    let elem = writer.create_element("list").with_attribute(("name", name));
                    if packages.is_empty() {
                        elem.write_empty()?;
                    } else {
                        elem.write_inner_content(|writer| -> io::Result<()> {
                            for package in packages {
                                writer
                                    .create_element("package")
                                    .write_text_content(BytesText::new(package))?;
                            }
                            Ok(())
                        })?;
                    }
                }
                for (package, state) in &self.entrystates {
                    let elem = writer
                        .create_element("state")
                        .with_attribute(("package", package.as_str()));
                    match state {
                        Some(state) => {
                            elem.write_text_content(BytesText::new(state.as_attr()))?;
                        }
                        None => {
                            elem.write_empty()?;
                        }
                    }
                }
                Ok(())
            })
            .expect("in-memory XML write cannot fail");
        let mut out = writer.into_inner();
        out.push(b'\n');
        out
    }

    fn parse(text: &str, store: &ProjectStore) -> Result<TransactionState, String> {
        let mut reader = Reader::from_str(text);
        let root = loop {
            match reader.read_event().map_err(|err| err.to_string())? {
                Event::Decl(_) | Event::Comment(_) => {}
                Event::Text(text) => {
                    if !is_ignorable(&text)? {
                        return Err("unexpected content before <transaction>".to_owned());
                    }
                }
                Event::Start(elem) if elem.name().as_ref() == b"transaction" => {
                    break elem.into_owned();
                }
                Event::Eof => return Err("no <transaction> element".to_owned()),
                _ => return Err("unexpected content before <transaction>".to_owned()),
            }
        };
        let kind = require_attr(&root, "transaction", "name")?;
        let kind =
            TransactionKind::parse(&kind).ok_or_else(|| format!("unknown kind {kind:?}"))?;
        let phase = require_attr(&root, "transaction", "state")?;
        let phase =
            TransactionPhase::parse(&phase).ok_or_else(|| format!("unknown phase {phase:?}"))?;
        if phase.kind() != kind {
            return Err(format!(
                "phase {:?} does not belong to a {kind} transaction",
                phase.as_str()
            ));
        }
        let location =
            attr(&root, "location")?.unwrap_or_else(|| store.layout().scratch_subdir.clone());

        let mut info = match kind {
            TransactionKind::Update => TransactionInfo::Update(UpdateInfo::default()),
            TransactionKind::Commit => TransactionInfo::Commit(CommitInfo::default()),
        };
        let mut processed = Vec::new();
        let mut entrystates = BTreeMap::new();
        loop {
            match reader.read_event().map_err(|err| err.to_string())? {
                Event::Text(text) => {
                    if !is_ignorable(&text)? {
                        return Err("unexpected content in <transaction>".to_owned());
                    }
                }
                Event::Start(elem) if elem.name().as_ref() == b"list" => {
                    let name = require_attr(&elem, "list", "name")?;
                    let packages = parse_list(&mut reader)?;
                    assign_list(&mut info, &mut processed, &name, packages)?;
                }
                Event::Empty(elem) if elem.name().as_ref() == b"list" => {
                    let name = require_attr(&elem, "list", "name")?;
                    assign_list(&mut info, &mut processed, &name, Vec::new())?;
                }
                Event::Start(elem) if elem.name().as_ref() == b"state" => {
                    let package = require_attr(&elem, "state", "package")?;
                    let text = read_text(&mut reader)?;
                    let state = if text.is_empty() {
                        None
                    } else {
                        Some(
                            EntryState::from_attr(&text)
                                .ok_or_else(|| format!("invalid entry state {text:?}"))?,
                        )
                    };
                    entrystates.insert(package, state);
                }
                Event::Empty(elem) if elem.name().as_ref() == b"state" => {
                    let package = require_attr(&elem, "state", "package")?;
                    entrystates.insert(package, None);
                }
                Event::End(elem) if elem.name().as_ref() == b"transaction" => break,
                Event::Eof => return Err("unexpected end of transaction record".to_owned()),
                _ => return Err("unexpected content in <transaction>".to_owned()),
            }
        }
        Ok(TransactionState {
            record_path: store.transaction_file(),
            store_dir: store.store_dir(),
            kind,
            phase,
            location,
            info,
            processed,
            entrystates,
        })
    }
}

fn assign_list(
    info: &mut TransactionInfo,
    processed: &mut Vec<String>,
    name: &str,
    packages: Vec<String>,
) -> Result<(), String> {
    if name == "processed" {
        *processed = packages;
        return Ok(());
    }
    for (list_name, list) in info.lists_mut() {
        if list_name == name {
            *list = packages;
            return Ok(());
        }
    }
    Err(format!("unknown work-list {name:?}"))
}

fn parse_list(reader: &mut Reader<&[u8]>) -> Result<Vec<String>, String> {
    let mut packages = Vec::new();
    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Text(text) => {
                if !is_ignorable(&text)? {
                    return Err("unexpected content in <list>".to_owned());
                }
            }
            Event::Start(elem) if elem.name().as_ref() == b"package" => {
                packages.push(read_text(reader)?);
            }
            Event::End(elem) if elem.name().as_ref() == b"list" => break,
            Event::Eof => return Err("unexpected end of <list>".to_owned()),
            _ => return Err("unexpected content in <list>".to_owned()),
        }
    }
    Ok(packages)
}

/// Reads the text content of the element just opened, up to its end tag.
/// Whitespace is significant here: `<state>` carries `' '` as content.
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, String> {
    let mut content = String::new();
    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Text(text) => {
                content.push_str(&text.unescape().map_err(|err| err.to_string())?);
            }
            Event::End(_) => return Ok(content),
            Event::Eof => return Err("unexpected end of element text".to_owned()),
            _ => return Err("unexpected content in text element".to_owned()),
        }
    }
}

fn is_ignorable(text: &BytesText) -> Result<bool, String> {
    Ok(text
        .unescape()
        .map_err(|err| err.to_string())?
        .trim()
        .is_empty())
}

fn attr(elem: &BytesStart, name: &str) -> Result<Option<String>, String> {
    for attr in elem.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr.unescape_value().map_err(|err| err.to_string())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn require_attr(elem: &BytesStart, elem_name: &str, name: &str) -> Result<String, String> {
    attr(elem, name)?.ok_or_else(|| format!("missing {name:?} attribute on <{elem_name}>"))
}
