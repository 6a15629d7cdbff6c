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

//! Mount table and dispatch: every path-addressed operation resolves to
//! either a mounted sampler image or the host file system, receiving the
//! path relative to the chosen root. Cross-driver renames degrade to copy
//! plus remove.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::debug;

use retrovfs_ds_std::FileStorage;
use retrovfs_err::{Error, Result, VfsError};
use retrovfs_fs::{Dentry, FileSystem, FileType, Stream};
use retrovfs_fs_emu3 as emu3;
use retrovfs_fs_host as host;

struct Mount {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStats {
    pub path: PathBuf,
    pub fs_type: String,
    pub open_files: u64,
}

type MountFn = fn(&Path) -> Result<Arc<dyn FileSystem>>;

fn mount_emu3(path: &Path) -> Result<Arc<dyn FileSystem>> {
    let storage = FileStorage::open(path)?;
    Ok(Arc::new(emu3::FileSystemServer::new(storage)?))
}

// probed in order; the Roland drivers slot in here once they exist
const MOUNT_FUNCS: &[MountFn] = &[mount_emu3];

type FsckFn = fn(&Path) -> Result<u16>;

fn fsck_emu3(path: &Path) -> Result<u16> {
    let storage = FileStorage::open(path)?;
    emu3::fsck(&storage)
}

const FSCK_FUNCS: &[FsckFn] = &[fsck_emu3];

/// The copy loop moves whole blocks, which both sides speak natively.
const COPY_BUFFER_SIZE: usize = 512;

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn join_path(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
        None => String::new(),
    }
}

fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(index) => trimmed[index + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Resolves a disk path for mount-style entry points: it must exist, a
/// symlink is followed once, and the result is absolute.
fn resolve_disk_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(VfsError::NonexistantDisk.into());
    }

    let path = if path.is_symlink() {
        std::fs::read_link(path).map_err(|_| VfsError::NonexistantDisk)?
    } else {
        path.to_path_buf()
    };

    if !path.exists() {
        return Err(VfsError::NonexistantDisk.into());
    }

    std::path::absolute(&path).map_err(|_| VfsError::IoError.into())
}

/// Walks the absolute form of `path` root-to-leaf, resolving symlinked
/// prefixes, and picks the first prefix present in the mount table. The
/// suffix past the mount point becomes the driver-relative path.
fn find_fs<'mounts>(
    mounts: &'mounts [Mount],
    path: &Path,
) -> Result<(Option<(&'mounts Mount, String)>, PathBuf)> {
    let abs = std::path::absolute(path).map_err(|_| VfsError::IoError)?;

    let components: Vec<_> = abs.components().collect();
    let mut prefix = PathBuf::new();

    for (depth, component) in components.iter().enumerate() {
        prefix.push(component);

        if prefix.is_symlink() {
            if let Ok(target) = std::fs::read_link(&prefix) {
                if let Ok(canonical) = std::fs::canonicalize(&target) {
                    prefix = canonical;
                }
            }
        }

        if let Some(mount) = mounts.iter().find(|mount| mount.path == prefix) {
            let mut remainder = String::new();
            for component in &components[depth + 1..] {
                remainder.push('/');
                remainder.push_str(&component.as_os_str().to_string_lossy());
            }

            return Ok((Some((mount, remainder)), abs));
        }
    }

    Ok((None, abs))
}

/// The process-wide mount registry and unified operation surface. One
/// instance per process is the expected shape; embedders and tests may
/// hold several.
pub struct Vfs {
    mounts: RwLock<Vec<Mount>>,
    host: Arc<host::FileSystemServer>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
            host: Arc::new(host::FileSystemServer::new()),
        }
    }

    fn mounts(&self) -> RwLockReadGuard<'_, Vec<Mount>> {
        self.mounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mounts_mut(&self) -> RwLockWriteGuard<'_, Vec<Mount>> {
        self.mounts.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_fs(&self) -> Arc<dyn FileSystem> {
        self.host.clone()
    }

    /// Tries every installed driver until one accepts the image; only
    /// "not mine" verdicts move on to the next driver.
    pub fn mount(&self, path: impl AsRef<Path>) -> Result<()> {
        let disk_path = resolve_disk_path(path.as_ref())?;

        let mut mounts = self.mounts_mut();

        let (found, abs) = find_fs(&mounts, &disk_path)?;
        if found.is_some() {
            return Err(VfsError::AlreadyOpen.into());
        }

        for mount_fn in MOUNT_FUNCS {
            match mount_fn(&abs) {
                Ok(fs) => {
                    debug!("Mounted {} as {}", abs.display(), fs.type_name());
                    mounts.push(Mount { path: abs, fs });
                    return Ok(());
                }
                Err(err)
                    if err == Error::Vfs(VfsError::WrongFs)
                        || err == Error::Vfs(VfsError::DiskTooSmall) => {}
                Err(err) => return Err(err),
            }
        }

        //no appropriate driver
        Err(VfsError::WrongFs.into())
    }

    pub fn umount(&self, path: impl AsRef<Path>) -> Result<()> {
        let disk_path = resolve_disk_path(path.as_ref())?;

        let mut mounts = self.mounts_mut();

        let mount_path = {
            let (found, _) = find_fs(&mounts, &disk_path)?;
            let Some((mount, _)) = found else {
                return Err(VfsError::NotFound.into());
            };

            if !mount.fs.can_unmount() {
                return Err(VfsError::FsBusy.into());
            }

            mount.path.clone()
        };

        debug!("Unmounted {}", mount_path.display());
        mounts.retain(|mount| mount.path != mount_path);

        Ok(())
    }

    pub fn lsmount(&self) -> Vec<MountStats> {
        self.mounts()
            .iter()
            .map(|mount| MountStats {
                path: mount.path.clone(),
                fs_type: mount.fs.type_name().to_string(),
                open_files: mount.fs.open_file_count(),
            })
            .collect()
    }

    /// Runs each driver's repair pass until one recognises the image, and
    /// returns its status bitmask.
    pub fn fsck(&self, path: impl AsRef<Path>) -> Result<u16> {
        let disk_path = resolve_disk_path(path.as_ref())?;

        for fsck_fn in FSCK_FUNCS {
            match fsck_fn(&disk_path) {
                Err(err) if err == Error::Vfs(VfsError::WrongFs) => {}
                result => return result,
            }
        }

        Err(VfsError::WrongFs.into())
    }

    pub fn list(&self, path: impl AsRef<Path>, get_dir: bool) -> Result<Vec<Dentry>> {
        let mounts = self.mounts();
        let (found, abs) = find_fs(&mounts, path.as_ref())?;

        if abs.exists() {
            // a mounted image's own path lists the image root, not the
            // image file's dentry
            return match found {
                Some((mount, _)) => mount.fs.list("", get_dir),
                None => self.host.list(&path_str(&abs), get_dir),
            };
        }

        match found {
            Some((mount, remainder)) => mount.fs.list(&remainder, get_dir),
            None => Err(VfsError::NotFound.into()),
        }
    }

    pub fn mkdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let mounts = self.mounts();
        let abs = std::path::absolute(path.as_ref()).map_err(|_| VfsError::IoError)?;

        if let Some(parent) = abs.parent() {
            if parent.is_dir() {
                let (parent_found, _) = find_fs(&mounts, parent)?;
                if parent_found.is_none() {
                    return self.host.mkdir(&path_str(&abs));
                }
            }
        }

        let (found, _) = find_fs(&mounts, &abs)?;
        match found {
            Some((mount, remainder)) => mount.fs.mkdir(&remainder),
            None => Err(VfsError::NotFound.into()),
        }
    }

    pub fn ftruncate(&self, path: impl AsRef<Path>, new_size: u64) -> Result<()> {
        let mounts = self.mounts();
        let abs = std::path::absolute(path.as_ref()).map_err(|_| VfsError::IoError)?;

        if let Some(parent) = abs.parent() {
            if parent.exists() {
                let (parent_found, _) = find_fs(&mounts, parent)?;
                if parent_found.is_none() {
                    return self.host.ftruncate(&path_str(&abs), new_size);
                }
            }
        }

        let (found, _) = find_fs(&mounts, &abs)?;
        match found {
            Some((mount, remainder)) => mount.fs.ftruncate(&remainder, new_size),
            None => Err(VfsError::NotFound.into()),
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let mounts = self.mounts();
        let (found, abs) = find_fs(&mounts, path.as_ref())?;

        if abs.exists() {
            if mounts.iter().any(|mount| mount.path == abs) {
                return Err(VfsError::CantRemove.into());
            }

            return self.host.remove(&path_str(&abs));
        }

        match found {
            Some((mount, remainder)) => mount.fs.remove(&remainder),
            None => Err(VfsError::NotFound.into()),
        }
    }

    pub fn rename(&self, cur_path: impl AsRef<Path>, new_path: impl AsRef<Path>) -> Result<()> {
        let mounts = self.mounts();

        let (cur_found, cur_abs) = find_fs(&mounts, cur_path.as_ref())?;
        let (new_found, new_abs) = find_fs(&mounts, new_path.as_ref())?;

        if cur_abs == new_abs {
            return Ok(());
        }

        //mount roots stay where they are
        if let Some((_, remainder)) = &cur_found {
            if remainder.is_empty() {
                return Err(VfsError::CantMove.into());
            }
        }

        match (&cur_found, &new_found) {
            (Some((src, src_remainder)), Some((dst, dst_remainder)))
                if Arc::ptr_eq(&src.fs, &dst.fs) =>
            {
                src.fs.rename(src_remainder, dst_remainder)
            }
            (None, None) => self.host.rename(&path_str(&cur_abs), &path_str(&new_abs)),
            _ => {
                let (src_fs, src_path) = self.target(&cur_found, &cur_abs);
                let (dst_fs, dst_path) = self.target(&new_found, &new_abs);

                // the source survives any copy failure
                copy_inner(&src_fs, &src_path, &dst_fs, &dst_path)?;
                src_fs.remove(&src_path)
            }
        }
    }

    pub fn copy(&self, cur_path: impl AsRef<Path>, new_path: impl AsRef<Path>) -> Result<()> {
        let mounts = self.mounts();

        let (cur_found, cur_abs) = find_fs(&mounts, cur_path.as_ref())?;
        let (new_found, new_abs) = find_fs(&mounts, new_path.as_ref())?;

        if cur_abs == new_abs {
            return Ok(());
        }

        let (src_fs, src_path) = self.target(&cur_found, &cur_abs);
        let (dst_fs, dst_path) = self.target(&new_found, &new_abs);

        copy_inner(&src_fs, &src_path, &dst_fs, &dst_path)
    }

    pub fn fopen(&self, path: impl AsRef<Path>) -> Result<Stream> {
        let mounts = self.mounts();
        let (found, abs) = find_fs(&mounts, path.as_ref())?;

        match found {
            Some((mount, remainder)) => {
                let handle = mount.fs.fopen(&remainder)?;
                Ok(Stream::new(mount.fs.clone(), handle))
            }
            None => {
                let handle = self.host.fopen(&path_str(&abs))?;
                Ok(Stream::new(self.host_fs(), handle))
            }
        }
    }

    fn target(
        &self,
        found: &Option<(&Mount, String)>,
        abs: &Path,
    ) -> (Arc<dyn FileSystem>, String) {
        match found {
            Some((mount, remainder)) => (mount.fs.clone(), remainder.clone()),
            None => (self.host_fs(), path_str(abs)),
        }
    }
}

fn copy_file(
    src_fs: &Arc<dyn FileSystem>,
    src_path: &str,
    dst_fs: &Arc<dyn FileSystem>,
    dst_path: &str,
) -> Result<()> {
    let mut src_stream = Stream::new(src_fs.clone(), src_fs.fopen(src_path)?);
    let mut dst_stream = Stream::new(dst_fs.clone(), dst_fs.fopen(dst_path)?);

    let size = src_fs
        .list(src_path, false)?
        .into_iter()
        .next()
        .ok_or(VfsError::NotFound)?
        .fsize;

    let mut buffer = [0; COPY_BUFFER_SIZE];

    for _ in 0..size / COPY_BUFFER_SIZE as u64 {
        src_stream.read(&mut buffer)?;
        dst_stream.write(&buffer)?;
    }

    let remainder = (size % COPY_BUFFER_SIZE as u64) as usize;
    if remainder != 0 {
        src_stream.read(&mut buffer[..remainder])?;
        dst_stream.write(&buffer[..remainder])?;
    }

    Ok(())
}

/// Depth-first directory copy over an explicit work stack, so the
/// recursion depth is bounded no matter how deep the host tree goes.
fn copy_dir_hierarchy(
    src_fs: &Arc<dyn FileSystem>,
    src_root: &str,
    dst_fs: &Arc<dyn FileSystem>,
    dst_root: &str,
) -> Result<()> {
    let mut stack = vec![(src_root.to_string(), dst_root.to_string())];

    while let Some((src_dir, dst_dir)) = stack.pop() {
        match dst_fs.list(&dst_dir, true) {
            Ok(_) => {}
            Err(err) if err == Error::Vfs(VfsError::NotFound) => dst_fs.mkdir(&dst_dir)?,
            Err(err) => return Err(err),
        }

        for dentry in src_fs.list(&src_dir, false)? {
            let src_child = join_path(&src_dir, &dentry.fname);
            let dst_child = join_path(&dst_dir, &dentry.fname);

            if dentry.ftype == FileType::Dir {
                stack.push((src_child, dst_child));
            } else {
                copy_file(src_fs, &src_child, dst_fs, &dst_child)?;
            }
        }
    }

    Ok(())
}

fn copy_inner(
    src_fs: &Arc<dyn FileSystem>,
    src_path: &str,
    dst_fs: &Arc<dyn FileSystem>,
    dst_path: &str,
) -> Result<()> {
    let src_dentry = src_fs
        .list(src_path, true)?
        .into_iter()
        .next()
        .ok_or(VfsError::NotFound)?;

    let dst_dentry = match dst_fs.list(dst_path, true) {
        Ok(dentries) => dentries.into_iter().next(),
        Err(err) if err == Error::Vfs(VfsError::NotFound) => None,
        Err(err) => return Err(err),
    };

    if src_dentry.ftype == FileType::Dir {
        match dst_dentry {
            // destination named a fresh directory: its parent must exist
            None => {
                let parent = parent_path(dst_path);
                let parent_dentry = dst_fs
                    .list(&parent, true)?
                    .into_iter()
                    .next()
                    .ok_or(VfsError::NotFound)?;
                if parent_dentry.ftype != FileType::Dir {
                    return Err(VfsError::NotADir.into());
                }

                copy_dir_hierarchy(src_fs, src_path, dst_fs, dst_path)
            }
            Some(dentry) => {
                if dentry.ftype != FileType::Dir {
                    return Err(VfsError::NotADir.into());
                }

                let dst_path = join_path(dst_path, &base_name(src_path));
                copy_dir_hierarchy(src_fs, src_path, dst_fs, &dst_path)
            }
        }
    } else {
        let final_dst_path = match dst_dentry {
            None => {
                let parent = parent_path(dst_path);
                let parent_dentry = dst_fs
                    .list(&parent, true)?
                    .into_iter()
                    .next()
                    .ok_or(VfsError::NotFound)?;
                if parent_dentry.ftype != FileType::Dir {
                    return Err(VfsError::InvalidPath.into());
                }

                dst_path.to_string()
            }
            Some(dentry) if dentry.ftype == FileType::Dir => {
                join_path(dst_path, &src_dentry.fname)
            }
            Some(_) => dst_path.to_string(),
        };

        copy_file(src_fs, src_path, dst_fs, &final_dst_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("", "b"), "/b");
        assert_eq!(join_path("/a/", "b"), "/a/b");

        assert_eq!(parent_path("/a/b"), "/a");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("a"), "");

        assert_eq!(base_name("/a/b"), "b");
        assert_eq!(base_name("b"), "b");
    }
}
