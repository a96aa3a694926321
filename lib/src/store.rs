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

//! Layout of the hidden metadata store and I/O on its files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::file_util::write_file_atomic;
use crate::manifest::Manifest;

/// Names of the files and directories making up a metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub store_dirname: String,
    pub data_subdir: String,
    pub manifest_file: String,
    pub lock_file: String,
    pub transaction_file: String,
    pub scratch_subdir: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        StoreLayout {
            store_dirname: ".osc".to_owned(),
            data_subdir: "data".to_owned(),
            manifest_file: "_packages".to_owned(),
            lock_file: "_lock".to_owned(),
            transaction_file: "_transaction".to_owned(),
            scratch_subdir: "tmp".to_owned(),
        }
    }
}

impl StoreLayout {
    /// Whether `path` looks like a project working copy under this layout.
    pub fn is_project_wc(&self, path: &Path) -> bool {
        let store = path.join(&self.store_dirname);
        store.is_dir() && store.join("_project").is_file()
    }
}

/// Whether `path` is a project working copy under the default layout.
pub fn is_project(path: &Path) -> bool {
    StoreLayout::default().is_project_wc(path)
}

/// Consistency check of the working copy at `path` (default layout).
pub fn wc_check(path: &Path) -> Result<WcCheck, StoreError> {
    ProjectStore::new(path.to_owned()).check()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Reading {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Writing {path}")]
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
    #[error("The directory {0} is already a project working copy")]
    AlreadyInitialized(PathBuf),
}

/// Result of a consistency check on a working-copy directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WcCheck {
    /// Store-relative names of required paths that are missing.
    pub missing: Vec<String>,
    /// Raw manifest bytes, if present but not parseable.
    pub invalid_manifest: Option<Vec<u8>>,
}

impl WcCheck {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.invalid_manifest.is_none()
    }
}

/// Paths and small-file I/O of one project working copy's metadata store.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    layout: StoreLayout,
}

impl ProjectStore {
    pub fn new(root: PathBuf) -> ProjectStore {
        ProjectStore::with_layout(root, StoreLayout::default())
    }

    pub fn with_layout(root: PathBuf, layout: StoreLayout) -> ProjectStore {
        ProjectStore { root, layout }
    }

    /// Creates the store layout for a fresh project working copy: the store
    /// directory, `_project`, `_apiurl`, an empty manifest and the external
    /// data area. Fails if `root` already carries a store.
    pub fn init(
        root: PathBuf,
        layout: StoreLayout,
        project: &str,
        api_url: &str,
    ) -> Result<ProjectStore, StoreError> {
        let store = ProjectStore { root, layout };
        if store.store_dir().exists() {
            return Err(StoreError::AlreadyInitialized(store.root.clone()));
        }
        for dir in [store.root.clone(), store.store_dir(), store.data_dir()] {
            fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir { path: dir, source })?;
        }
        store.write_single_line(&store.project_file(), project)?;
        store.write_single_line(&store.apiurl_file(), api_url)?;
        store.write_manifest(&Manifest::default())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join(&self.layout.store_dirname)
    }

    pub fn project_file(&self) -> PathBuf {
        self.store_dir().join("_project")
    }

    pub fn apiurl_file(&self) -> PathBuf {
        self.store_dir().join("_apiurl")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.store_dir().join(&self.layout.manifest_file)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(&self.layout.lock_file)
    }

    pub fn transaction_file(&self) -> PathBuf {
        self.store_dir().join(&self.layout.transaction_file)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.store_dir().join(&self.layout.data_subdir)
    }

    /// External store directory backing the package working copy `package`.
    pub fn data_dir_for(&self, package: &str) -> PathBuf {
        self.data_dir().join(package)
    }

    /// Directory of the package working copy `package`.
    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    pub fn read_project(&self) -> Result<String, StoreError> {
        self.read_single_line(&self.project_file())
    }

    pub fn read_api_url(&self) -> Result<String, StoreError> {
        self.read_single_line(&self.apiurl_file())
    }

    pub fn read_manifest_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let path = self.manifest_file();
        fs::read(&path).map_err(|source| StoreError::Read { path, source })
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let path = self.manifest_file();
        write_file_atomic(&self.store_dir(), &path, &manifest.to_xml())
            .map_err(|source| StoreError::Write { path, source })
    }

    /// Checks that all required store paths exist and that the manifest
    /// parses. Neither condition is auto-repaired.
    pub fn check(&self) -> Result<WcCheck, StoreError> {
        let mut missing = Vec::new();
        for (name, path, want_dir) in [
            ("_project", self.project_file(), false),
            ("_apiurl", self.apiurl_file(), false),
            (
                self.layout.manifest_file.as_str(),
                self.manifest_file(),
                false,
            ),
            (self.layout.data_subdir.as_str(), self.data_dir(), true),
        ] {
            let present = if want_dir { path.is_dir() } else { path.is_file() };
            if !present {
                missing.push(name.to_owned());
            }
        }
        let mut invalid_manifest = None;
        if !missing.iter().any(|name| *name == self.layout.manifest_file) {
            let data = self.read_manifest_bytes()?;
            if Manifest::parse(&data).is_err() {
                invalid_manifest = Some(data);
            }
        }
        Ok(WcCheck {
            missing,
            invalid_manifest,
        })
    }

    fn read_single_line(&self, path: &Path) -> Result<String, StoreError> {
        let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_owned(),
            source,
        })?;
        Ok(content.strip_suffix('\n').unwrap_or(&content).to_owned())
    }

    fn write_single_line(&self, path: &Path, value: &str) -> Result<(), StoreError> {
        write_file_atomic(&self.store_dir(), path, format!("{value}\n").as_bytes()).map_err(
            |source| StoreError::Write {
                path: path.to_owned(),
                source,
            },
        )
    }
}
