// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use retrovfs_ds::DataStorage;
use retrovfs_err::{Result, VfsError};

/// A disk image opened read/write on the host file system.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Opens `path` as a volume, resolving a symlink first. The size check
    /// is left to the individual drivers because it depends on the file
    /// system.
    pub fn open(path: &Path) -> Result<Self> {
        let path = resolve_symlink(path)?;

        if !path.exists() {
            return Err(VfsError::NonexistantDisk.into());
        }
        if !path.is_file() {
            return Err(VfsError::NotAFile.into());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| VfsError::CantOpenDisk)?;

        Ok(Self { file })
    }
}

fn resolve_symlink(path: &Path) -> Result<PathBuf> {
    if path.is_symlink() {
        std::fs::read_link(path).map_err(|_| VfsError::NonexistantDisk.into())
    } else {
        Ok(path.to_path_buf())
    }
}

impl DataStorage for FileStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, offset)
            .map_err(|_| VfsError::IoError.into())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buffer, offset)
            .map_err(|_| VfsError::IoError.into())
    }

    fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|metadata| metadata.len())
            .map_err(|_| VfsError::IoError.into())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data().map_err(|_| VfsError::IoError.into())
    }
}
