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

//! Pass-through driver over the host file system, so unmanaged paths
//! answer the same operations as mounted sampler images. It receives
//! absolute host paths from the dispatch layer.

use std::{
    collections::HashMap,
    fs::{File, Metadata, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::UNIX_EPOCH,
};

use retrovfs_err::{Result, VfsError};
use retrovfs_fs::{Dentry, FileHandle, FileSystem, FileType};

/// Maps host I/O failures into the error taxonomy.
fn io_error(err: io::Error) -> VfsError {
    match err.kind() {
        io::ErrorKind::NotFound => VfsError::NotFound,
        io::ErrorKind::PermissionDenied => VfsError::NoPerm,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted => VfsError::IoError,
        _ => VfsError::UnknownError,
    }
}

fn host_ftype(metadata: &Metadata) -> FileType {
    let ftype = metadata.file_type();

    if ftype.is_file() {
        FileType::File
    } else if ftype.is_dir() {
        FileType::Dir
    } else if ftype.is_symlink() {
        FileType::Symlink
    } else {
        use std::os::unix::fs::FileTypeExt;

        if ftype.is_block_device() {
            FileType::BlkDev
        } else if ftype.is_char_device() {
            FileType::CharDev
        } else if ftype.is_fifo() {
            FileType::Pipe
        } else if ftype.is_socket() {
            FileType::Socket
        } else {
            FileType::Unknown
        }
    }
}

fn host_dentry(path: &Path) -> Result<Dentry> {
    let metadata = path.symlink_metadata().map_err(io_error)?;

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_secs() as i64)
        .unwrap_or(0);

    Ok(Dentry {
        fname: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        fsize: if metadata.is_file() { metadata.len() } else { 0 },
        ctime: 0, //not provided portably
        mtime,
        atime: 0,
        ftype: host_ftype(&metadata),
    })
}

struct OpenHostFile {
    file: File,
    refcount: u64,
}

/// The host driver. One instance backs every unmounted path; it is never
/// itself unmountable.
#[derive(Default)]
pub struct FileSystemServer {
    open_files: Mutex<HashMap<String, OpenHostFile>>,
}

impl FileSystemServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn open_files(&self) -> MutexGuard<'_, HashMap<String, OpenHostFile>> {
        self.open_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for FileSystemServer {
    fn type_name(&self) -> &'static str {
        "Host"
    }

    fn open_file_count(&self) -> u64 {
        self.open_files().len() as u64
    }

    fn can_unmount(&self) -> bool {
        false
    }

    fn free_space(&self) -> u64 {
        0
    }

    fn list(&self, path: &str, get_dir: bool) -> Result<Vec<Dentry>> {
        let path = Path::new(path);

        if !get_dir && path.is_dir() {
            let mut dentries = Vec::new();

            for dir_entry in std::fs::read_dir(path).map_err(io_error)? {
                let dir_entry = dir_entry.map_err(io_error)?;
                dentries.push(host_dentry(&dir_entry.path())?);
            }

            Ok(dentries)
        } else {
            if !path.exists() && !path.is_symlink() {
                return Err(VfsError::NotFound.into());
            }

            Ok(vec![host_dentry(path)?])
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        if Path::new(path).exists() {
            return Err(VfsError::AlreadyExists.into());
        }

        std::fs::create_dir(path).map_err(io_error)?;
        Ok(())
    }

    fn ftruncate(&self, path: &str, new_size: u64) -> Result<()> {
        let host_path = Path::new(path);

        if !host_path.exists() {
            File::create(host_path).map_err(io_error)?;
        } else if !host_path.is_file() {
            return Err(VfsError::NotAFile.into());
        }

        let file = OpenOptions::new()
            .write(true)
            .open(host_path)
            .map_err(io_error)?;
        file.set_len(new_size).map_err(io_error)?;

        Ok(())
    }

    fn rename(&self, cur_path: &str, new_path: &str) -> Result<()> {
        std::fs::rename(cur_path, new_path).map_err(io_error)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let host_path = Path::new(path);

        if host_path.is_dir() {
            std::fs::remove_dir_all(host_path).map_err(io_error)?;
        } else {
            std::fs::remove_file(host_path).map_err(io_error)?;
        }

        Ok(())
    }

    fn fopen(&self, path: &str) -> Result<FileHandle> {
        let host_path = Path::new(path);
        let key = path.to_string();

        let mut open_files = self.open_files();

        if let Some(open_file) = open_files.get_mut(&key) {
            open_file.refcount += 1;
            return Ok(FileHandle::new(key));
        }

        if host_path.is_dir() {
            return Err(VfsError::NotAFile.into());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(host_path)
            .map_err(|_| VfsError::FailedToOpenFile)?;

        open_files.insert(key.clone(), OpenHostFile { file, refcount: 1 });

        Ok(FileHandle::new(key))
    }

    fn fclose(&self, file: &FileHandle) -> Result<()> {
        let mut open_files = self.open_files();

        let open_file = open_files
            .get_mut(file.key())
            .ok_or(VfsError::InvalidState)?;

        if open_file.refcount == 1 {
            open_files.remove(file.key());
        } else {
            open_file.refcount -= 1;
        }

        Ok(())
    }

    fn read(&self, file: &FileHandle, pos: &mut u64, dst: &mut [u8]) -> Result<()> {
        let open_files = self.open_files();
        let open_file = open_files.get(file.key()).ok_or(VfsError::InvalidState)?;

        let mut transferred = 0;
        while transferred < dst.len() {
            let got = open_file
                .file
                .read_at(&mut dst[transferred..], *pos + transferred as u64)
                .map_err(io_error)?;

            if got == 0 {
                *pos += transferred as u64;
                return Err(VfsError::EndOfFile.into());
            }

            transferred += got;
        }

        *pos += transferred as u64;
        Ok(())
    }

    fn write(&self, file: &FileHandle, pos: &mut u64, src: &[u8]) -> Result<()> {
        let open_files = self.open_files();
        let open_file = open_files.get(file.key()).ok_or(VfsError::InvalidState)?;

        open_file.file.write_all_at(src, *pos).map_err(io_error)?;

        *pos += src.len() as u64;
        Ok(())
    }

    fn flush(&self, file: &FileHandle) -> Result<()> {
        let open_files = self.open_files();
        let open_file = open_files.get(file.key()).ok_or(VfsError::InvalidState)?;

        open_file.file.sync_data().map_err(io_error)?;
        Ok(())
    }
}
