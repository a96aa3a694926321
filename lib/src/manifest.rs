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

//! The packages manifest: the authoritative list of tracked packages.
//!
//! The manifest is plain value types; the `_packages` XML document is parsed
//! into and serialised from them at the edge. Disk presence of a package
//! directory is never authoritative.

use std::collections::BTreeMap;
use std::fmt;
use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Manifest state of a tracked package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryState {
    /// `' '`: in sync with the last update.
    Unchanged,
    /// `'A'`: scheduled to be added by the next commit.
    Added,
    /// `'D'`: scheduled to be deleted by the next commit.
    Deleted,
}

impl EntryState {
    pub fn as_char(self) -> char {
        match self {
            EntryState::Unchanged => ' ',
            EntryState::Added => 'A',
            EntryState::Deleted => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<EntryState> {
        match c {
            ' ' => Some(EntryState::Unchanged),
            'A' => Some(EntryState::Added),
            'D' => Some(EntryState::Deleted),
            _ => None,
        }
    }

    pub(crate) fn as_attr(self) -> &'static str {
        match self {
            EntryState::Unchanged => " ",
            EntryState::Added => "A",
            EntryState::Deleted => "D",
        }
    }

    pub(crate) fn from_attr(value: &str) -> Option<EntryState> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => EntryState::from_char(c),
            _ => None,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub state: EntryState,
}

#[derive(Debug, Error)]
pub enum ManifestParseError {
    #[error("Manifest is not valid UTF-8")]
    Utf8(#[from] str::Utf8Error),
    #[error("Malformed manifest XML")]
    Xml(#[from] quick_xml::Error),
    #[error("Malformed escape sequence in manifest")]
    Escape(#[from] quick_xml::escape::EscapeError),
    #[error("Malformed attribute in manifest")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("Unexpected element <{0}> in manifest")]
    UnexpectedElement(String),
    #[error("Unexpected text content in manifest")]
    UnexpectedText,
    #[error("Manifest has no <packages> element")]
    MissingRoot,
    #[error("Package entry is missing the {0:?} attribute")]
    MissingAttribute(&'static str),
    #[error("Invalid package state {0:?}")]
    InvalidState(String),
}

/// The ordered collection of tracked packages, as stored in `_packages`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<PackageEntry>,
}

impl Manifest {
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    /// Package names in manifest order.
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn find(&self, name: &str) -> Option<&PackageEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Sets `name` to `state`, appending a new entry if it isn't tracked yet.
    pub fn set(&mut self, name: &str, state: EntryState) {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.state = state,
            None => self.entries.push(PackageEntry {
                name: name.to_owned(),
                state,
            }),
        }
    }

    /// Drops `name` from the manifest. Returns whether it was tracked.
    pub fn remove(&mut self, name: &str) -> bool {
        let len = self.entries.len();
        self.entries.retain(|entry| entry.name != name);
        self.entries.len() != len
    }

    /// Applies the entry states recorded by a finished transaction: `None`
    /// removes the entry, anything else becomes the new state. Reapplying the
    /// same states is a no-op, which is what makes the end-of-transaction
    /// manifest write safe to repeat after a crash.
    pub fn merge(&mut self, entrystates: &BTreeMap<String, Option<EntryState>>) {
        for (name, state) in entrystates {
            match state {
                Some(state) => self.set(name, *state),
                None => {
                    self.remove(name);
                }
            }
        }
    }

    pub fn parse(data: &[u8]) -> Result<Manifest, ManifestParseError> {
        let text = str::from_utf8(data)?;
        let mut reader = Reader::from_str(text);
        let mut entries = Vec::new();
        // Nesting level inside <packages>; only two shapes are legal:
        // <packages/> and <packages><package …/>*</packages>.
        let mut in_packages = false;
        let mut seen_root = false;
        loop {
            match reader.read_event()? {
                Event::Decl(_) | Event::Comment(_) => {}
                Event::Text(text) => {
                    if !text.unescape()?.trim().is_empty() {
                        return Err(ManifestParseError::UnexpectedText);
                    }
                }
                Event::Start(elem) if !seen_root => {
                    Self::expect_packages_root(&elem)?;
                    seen_root = true;
                    in_packages = true;
                }
                Event::Empty(elem) if !seen_root => {
                    Self::expect_packages_root(&elem)?;
                    seen_root = true;
                }
                Event::Empty(elem) if in_packages && elem.name().as_ref() == b"package" => {
                    entries.push(Self::entry_from_element(&elem)?);
                }
                Event::End(_) if in_packages => {
                    in_packages = false;
                }
                Event::Eof if seen_root && !in_packages => break,
                Event::Eof => return Err(ManifestParseError::MissingRoot),
                Event::Start(elem) | Event::Empty(elem) => {
                    return Err(ManifestParseError::UnexpectedElement(
                        String::from_utf8_lossy(elem.name().as_ref()).into_owned(),
                    ));
                }
                _ => {
                    return Err(ManifestParseError::UnexpectedText);
                }
            }
        }
        Ok(Manifest { entries })
    }

    fn expect_packages_root(elem: &BytesStart) -> Result<(), ManifestParseError> {
        if elem.name().as_ref() == b"packages" {
            Ok(())
        } else {
            Err(ManifestParseError::UnexpectedElement(
                String::from_utf8_lossy(elem.name().as_ref()).into_owned(),
            ))
        }
    }

    fn entry_from_element(elem: &BytesStart) -> Result<PackageEntry, ManifestParseError> {
        let mut name = None;
        let mut state = None;
        for attr in elem.attributes() {
            let attr = attr?;
            match attr.key.as_ref() {
                b"name" => name = Some(attr.unescape_value()?.into_owned()),
                b"state" => state = Some(attr.unescape_value()?.into_owned()),
                // Tolerate attributes written by other client generations.
                _ => {}
            }
        }
        let name = name.ok_or(ManifestParseError::MissingAttribute("name"))?;
        let state = state.ok_or(ManifestParseError::MissingAttribute("state"))?;
        let state =
            EntryState::from_attr(&state).ok_or(ManifestParseError::InvalidState(state))?;
        Ok(PackageEntry { name, state })
    }

    /// Serialises the manifest. The empty manifest is exactly `<packages/>\n`.
    pub fn to_xml(&self) -> Vec<u8> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        if self.entries.is_empty() {
            writer
                .create_element("packages")
                .write_empty()
                .expect("in-memory XML write cannot fail");
        } else {
            writer
                .create_element("packages")
                .write_inner_content(|writer| -> std::io::Result<()> {
                    for entry in &self.entries {
                        writer
                            .create_element("package")
                            .with_attribute(("name", entry.name.as_str()))
                            .with_attribute(("state", entry.state.as_attr()))
                            .write_empty()?;
                    }
                    Ok(())
                })
                .expect("in-memory XML write cannot fail");
        }
        let mut out = writer.into_inner();
        out.push(b'\n');
        out
    }
}
