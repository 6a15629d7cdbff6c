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

pub use retrovfs_err::*;

use std::{fmt, io::SeekFrom, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Symlink,
    BlkDev,
    CharDev,
    Pipe,
    Socket,
    Unknown,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::File => "file",
            FileType::Dir => "dir",
            FileType::Symlink => "symlink",
            FileType::BlkDev => "block device",
            FileType::CharDev => "character device",
            FileType::Pipe => "pipe",
            FileType::Socket => "socket",
            FileType::Unknown => "unknown",
        })
    }
}

/// Directory-entry view returned by [`FileSystem::list`]. Timestamps are
/// Unix seconds; drivers without them report zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub fname: String,
    pub fsize: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub ftype: FileType,
}

/// Splits a driver-relative path into its components, skipping empty ones,
/// so `"/a//b/"` and `"a/b"` are the same path.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|comp| !comp.is_empty()).collect()
}

/// Opaque reference into a driver's open-file table. The key is stable for
/// the whole lifetime of the open, no matter what else gets opened or
/// closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    key: String,
}

impl FileHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A mounted file system driver. Paths are absolute relative to the
/// driver's own root, never to the global one.
///
/// Drivers guard their mutable state internally, so all operations take
/// `&self`; `read` and `write` may release the lock between transferred
/// clusters so large transfers do not stall other streams.
pub trait FileSystem: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn open_file_count(&self) -> u64;

    fn can_unmount(&self) -> bool;

    fn free_space(&self) -> u64;

    fn list(&self, path: &str, get_dir: bool) -> Result<Vec<Dentry>>;

    fn mkdir(&self, path: &str) -> Result<()>;

    fn ftruncate(&self, path: &str, new_size: u64) -> Result<()>;

    fn rename(&self, cur_path: &str, new_path: &str) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;

    fn fopen(&self, path: &str) -> Result<FileHandle>;

    fn fclose(&self, file: &FileHandle) -> Result<()>;

    /// Reads at `pos`, advancing it by the bytes transferred. Requests
    /// reaching past the recorded file size transfer what is there and
    /// report [`VfsError::EndOfFile`].
    fn read(&self, file: &FileHandle, pos: &mut u64, dst: &mut [u8]) -> Result<()>;

    /// Writes at `pos`, advancing it and growing the file as needed. A
    /// zero-length write never grows the file.
    fn write(&self, file: &FileHandle, pos: &mut u64, src: &[u8]) -> Result<()>;

    fn flush(&self, file: &FileHandle) -> Result<()>;
}

struct StreamInner {
    fs: Arc<dyn FileSystem>,
    file: FileHandle,
}

/// Position-carrying handle over an open file. Dropping the stream closes
/// it; closing twice is an error.
pub struct Stream {
    inner: Option<StreamInner>,
    pos: u64,
}

impl Stream {
    pub fn new(fs: Arc<dyn FileSystem>, file: FileHandle) -> Self {
        Self {
            inner: Some(StreamInner { fs, file }),
            pos: 0,
        }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(VfsError::InvalidState)?;
        inner.fs.read(&inner.file, &mut self.pos, dst)
    }

    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(VfsError::InvalidState)?;
        inner.fs.write(&inner.file, &mut self.pos, src)
    }

    /// Seeking from the end is unsupported: not every driver can answer the
    /// file size without a directory walk.
    pub fn seek(&mut self, from: SeekFrom) -> Result<()> {
        match from {
            SeekFrom::Start(pos) => {
                self.pos = pos;
                Ok(())
            }
            SeekFrom::Current(off) => {
                self.pos = if off < 0 {
                    self.pos.saturating_sub(off.unsigned_abs())
                } else {
                    self.pos.saturating_add(off as u64)
                };
                Ok(())
            }
            SeekFrom::End(_) => Err(VfsError::UnsupportedOperation.into()),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(VfsError::InvalidState)?;
        inner.fs.flush(&inner.file)
    }

    pub fn close(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(VfsError::InvalidState)?;
        inner.fs.fclose(&inner.file)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.fs.fclose(&inner.file);
        }
    }
}
