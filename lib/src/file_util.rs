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

use std::io;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Writes `contents` to `target` atomically: the bytes go to a temporary
/// sibling in `dir`, which is then renamed over `target`. A reader never
/// observes a half-written file.
///
/// `dir` must be on the same filesystem as `target` (in practice, the
/// metadata store directory).
pub fn write_file_atomic(dir: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.as_file_mut().write_all(contents)?;
    temp_file
        .persist(target)
        .map_err(|tempfile::PersistError { error, file: _ }| error)?;
    Ok(())
}
