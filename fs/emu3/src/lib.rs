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

//! Read/write driver for E-MU EMU3 sampler volumes.
//!
//! The on-disk layout is a superblock with an additive checksum, a root
//! directory table whose entries point at up to seven content blocks of
//! file entries each, a 16-bit FAT, and a cluster data section. Files are
//! addressed by name or by their bank number, which is unique within a
//! directory.

mod fsck;

pub use fsck::{fsck, mkfs, status};

use std::{
    collections::{hash_map::Entry as MapEntry, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::error;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use retrovfs_ds::DataStorage;
use retrovfs_err::{Emu3Error, Error, FatError, Result, VfsError};
use retrovfs_fat as fat;
use retrovfs_fat::{Endianness, FatAttrs, FatDynAttrs};
use retrovfs_fs::{split_path, Dentry, FileHandle, FileSystem, FileType};

pub const MAGIC: [u8; 4] = *b"EMU3";
pub const FS_NAME: &str = "EMU3";
pub const BLK_SIZE: u64 = 512;
pub const MIN_CLUSTER_SHIFT: u8 = 15;
pub const MAX_CLUSTER_SHIFT: u8 = 24;
pub const FIRST_NON_RESERVED_BLK: u32 = 2;

pub const DIR_ENTRY_SIZE: u64 = 32;
pub const FILE_ENTRY_SIZE: u64 = 32;
pub const DIRS_PER_BLOCK: usize = (BLK_SIZE / DIR_ENTRY_SIZE) as usize;
pub const FILES_PER_BLOCK: usize = (BLK_SIZE / FILE_ENTRY_SIZE) as usize;
pub const MAX_BLOCKS_PER_DIR: usize = 7;
pub const MAX_FILES_PER_DIR: usize = FILES_PER_BLOCK * MAX_BLOCKS_PER_DIR;
pub const MAX_BANK: u8 = 0x7F;

pub const FAT_ATTRS: FatAttrs<u16> =
    FatAttrs::new(Endianness::Little, 0x0000, 0x0001, 0x7FFE, 0x7FFF, 0x8000);

pub const MAX_CLUSTER_CNT: u16 = FAT_ATTRS.data_max;
pub const MAX_FAT_BLOCKS: u16 =
    (MAX_CLUSTER_CNT as u32 * 2 / BLK_SIZE as u32) as u16 + ((MAX_CLUSTER_CNT as u32 * 2 % BLK_SIZE as u32) != 0) as u16;

pub mod dir_type {
    pub const DEL: u8 = 0x00;
    pub const LAST: u8 = 0x40;
    pub const NORMAL: u8 = 0x80;
}

pub mod file_type {
    pub const DEL: u8 = 0x00;
    pub const PADDING: u8 = 0x42;
    pub const SYS: u8 = 0x80;
    pub const STD: u8 = 0x81;
    pub const UPD: u8 = 0x83;
}

pub const fn calc_cluster_size(cluster_shift: u8) -> u32 {
    1 << (MIN_CLUSTER_SHIFT + cluster_shift)
}

pub const fn is_valid_dir(dtype: u8) -> bool {
    dtype == dir_type::NORMAL || dtype == dir_type::LAST
}

pub const fn is_valid_file(ftype: u8) -> bool {
    ftype == file_type::STD || ftype == file_type::UPD || ftype == file_type::SYS
}

/// Superblock, block 0 of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub block_cnt: u32,
    pub dir_list_blk_addr: u32,
    pub dir_list_blk_cnt: u32,
    pub file_list_blk_addr: u32,
    pub file_list_blk_cnt: u32,
    pub fat_blk_addr: u32,
    pub fat_blk_cnt: u32,
    pub data_sctn_blk_addr: u32,
    pub cluster_cnt: u16,
    pub cluster_shift: u8,
}

/// Root-directory-table entry, with its absolute address on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    pub name: [u8; 16],
    pub dtype: u8,
    pub blocks: [u16; MAX_BLOCKS_PER_DIR],
    pub addr: u64,
}

/// Content-block file entry. `bank_num` must be unique within the owning
/// directory; the name does not have to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileEntry {
    pub name: [u8; 16],
    pub bank_num: u8,
    pub start_cluster: u16,
    pub cluster_cnt: u16,
    /// Blocks used in the last cluster.
    pub block_cnt: u16,
    /// Bytes used in the last block.
    pub byte_cnt: u16,
    pub ftype: u8,
    pub props: [u8; 5],
    pub addr: u64,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawSuperblock {
    magic: [u8; 4],
    block_cnt: U32,
    dir_list_blk_addr: U32,
    dir_list_blk_cnt: U32,
    file_list_blk_addr: U32,
    file_list_blk_cnt: U32,
    fat_blk_addr: U32,
    fat_blk_cnt: U32,
    data_sctn_blk_addr: U32,
    cluster_cnt: U16,
    reserved: [u8; 2],
    cluster_shift: u8,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawDirEntry {
    name: [u8; 16],
    unused: u8,
    dtype: u8,
    blocks: [U16; MAX_BLOCKS_PER_DIR],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawFileEntry {
    name: [u8; 16],
    unused: u8,
    bank_num: u8,
    start_cluster: U16,
    cluster_cnt: U16,
    block_cnt: U16,
    byte_cnt: U16,
    ftype: u8,
    props: [u8; 5],
}

/// Sum of the u16 words in `[0, 510)`; the expected value lives at offset
/// 510.
pub fn checksum(block: &[u8; BLK_SIZE as usize]) -> u16 {
    let mut sum = 0u16;

    for word in block[..BLK_SIZE as usize - 2].chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]));
    }

    sum
}

pub fn parse_header(block: &[u8; BLK_SIZE as usize]) -> Result<Header> {
    let (raw, _) =
        RawSuperblock::read_from_prefix(block).map_err(|_| VfsError::InvalidState)?;

    Ok(Header {
        block_cnt: raw.block_cnt.get(),
        dir_list_blk_addr: raw.dir_list_blk_addr.get(),
        dir_list_blk_cnt: raw.dir_list_blk_cnt.get(),
        file_list_blk_addr: raw.file_list_blk_addr.get(),
        file_list_blk_cnt: raw.file_list_blk_cnt.get(),
        fat_blk_addr: raw.fat_blk_addr.get(),
        fat_blk_cnt: raw.fat_blk_cnt.get(),
        data_sctn_blk_addr: raw.data_sctn_blk_addr.get(),
        cluster_cnt: raw.cluster_cnt.get(),
        cluster_shift: raw.cluster_shift,
    })
}

/// Packs `header` into `block` in place, keeping the magic and the two
/// reserved bytes, regenerating the fixed trailer and recomputing the
/// checksum. Callers never set the checksum themselves.
pub fn pack_header(block: &mut [u8; BLK_SIZE as usize], header: &Header) {
    let mut magic = [0; 4];
    magic.copy_from_slice(&block[..4]);
    let mut reserved = [0; 2];
    reserved.copy_from_slice(&block[38..40]);

    let raw = RawSuperblock {
        magic,
        block_cnt: U32::new(header.block_cnt),
        dir_list_blk_addr: U32::new(header.dir_list_blk_addr),
        dir_list_blk_cnt: U32::new(header.dir_list_blk_cnt),
        file_list_blk_addr: U32::new(header.file_list_blk_addr),
        file_list_blk_cnt: U32::new(header.file_list_blk_cnt),
        fat_blk_addr: U32::new(header.fat_blk_addr),
        fat_blk_cnt: U32::new(header.fat_blk_cnt),
        data_sctn_blk_addr: U32::new(header.data_sctn_blk_addr),
        cluster_cnt: U16::new(header.cluster_cnt),
        reserved,
        cluster_shift: header.cluster_shift,
    };
    block[..std::mem::size_of::<RawSuperblock>()].copy_from_slice(raw.as_bytes());

    block[41] = 1;
    block[42..46].copy_from_slice(&header.block_cnt.to_le_bytes());
    block[46..50].fill(0);
    block[50] = 1;
    block[51] = 0x0D;
    block[52..510].fill(0);

    let sum = checksum(block);
    block[510..].copy_from_slice(&sum.to_le_bytes());
}

fn remap_slashes(name: &mut [u8; 16]) {
    for byte in name {
        if *byte == b'/' {
            *byte = b'\\';
        }
    }
}

/// Unpacks a directory entry. `remap` turns `/` bytes in the name into `\`
/// so upstream paths can use `/` as a separator; the transformation is
/// one-way and never reversed on write.
pub fn parse_dir_entry(src: &[u8], remap: bool, addr: u64) -> Result<DirEntry> {
    let (raw, _) = RawDirEntry::read_from_prefix(src).map_err(|_| VfsError::InvalidState)?;

    let mut name = raw.name;
    if remap {
        remap_slashes(&mut name);
    }

    let mut blocks = [0; MAX_BLOCKS_PER_DIR];
    for (block, raw_block) in blocks.iter_mut().zip(raw.blocks.iter()) {
        *block = raw_block.get();
    }

    Ok(DirEntry {
        name,
        dtype: raw.dtype,
        blocks,
        addr,
    })
}

pub fn pack_dir_entry(dir: &DirEntry) -> [u8; DIR_ENTRY_SIZE as usize] {
    let mut blocks = [U16::new(0); MAX_BLOCKS_PER_DIR];
    for (raw_block, block) in blocks.iter_mut().zip(dir.blocks.iter()) {
        *raw_block = U16::new(*block);
    }

    let raw = RawDirEntry {
        name: dir.name,
        unused: 0,
        dtype: dir.dtype,
        blocks,
    };

    let mut packed = [0; DIR_ENTRY_SIZE as usize];
    packed.copy_from_slice(raw.as_bytes());
    packed
}

/// Unpacks a file entry, with the same one-way slash remap as directory
/// entries.
pub fn parse_file_entry(src: &[u8], remap: bool, addr: u64) -> Result<FileEntry> {
    let (raw, _) = RawFileEntry::read_from_prefix(src).map_err(|_| VfsError::InvalidState)?;

    let mut name = raw.name;
    if remap {
        remap_slashes(&mut name);
    }

    Ok(FileEntry {
        name,
        bank_num: raw.bank_num,
        start_cluster: raw.start_cluster.get(),
        cluster_cnt: raw.cluster_cnt.get(),
        block_cnt: raw.block_cnt.get(),
        byte_cnt: raw.byte_cnt.get(),
        ftype: raw.ftype,
        props: raw.props,
        addr,
    })
}

pub fn pack_file_entry(file: &FileEntry) -> [u8; FILE_ENTRY_SIZE as usize] {
    let raw = RawFileEntry {
        name: file.name,
        unused: 0,
        bank_num: file.bank_num,
        start_cluster: U16::new(file.start_cluster),
        cluster_cnt: U16::new(file.cluster_cnt),
        block_cnt: U16::new(file.block_cnt),
        byte_cnt: U16::new(file.byte_cnt),
        ftype: file.ftype,
        props: file.props,
    };

    let mut packed = [0; FILE_ENTRY_SIZE as usize];
    packed.copy_from_slice(raw.as_bytes());
    packed
}

/// Truncates or NUL-pads `name` into the 16-byte on-disk field.
pub fn prepare_name(name: &str) -> [u8; 16] {
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);

    let mut prepared = [0; 16];
    prepared[..len].copy_from_slice(&bytes[..len]);
    prepared
}

fn name_to_string(name: &[u8; 16]) -> String {
    let len = name.iter().position(|&byte| byte == 0).unwrap_or(16);
    String::from_utf8_lossy(&name[..len]).into_owned()
}

/// C-string comparison over the 16-byte name fields: bytes after a NUL
/// shared by both sides do not matter.
fn name_eq(a: &[u8; 16], b: &[u8; 16]) -> bool {
    for i in 0..16 {
        if a[i] != b[i] {
            return false;
        }
        if a[i] == 0 {
            return true;
        }
    }

    true
}

/// Splits a path component into an optional bank number and the prepared
/// name. `"NN-rest"` with `NN` of one to three digits parsing to at most
/// 255 is a bank reference; anything else, including prefixes above 255,
/// is a plain name.
pub fn bank_num_and_name(component: &str) -> (Option<u8>, [u8; 16]) {
    if let Some(dash) = component.find('-') {
        let prefix = &component[..dash];
        if (1..=3).contains(&prefix.len()) && prefix.bytes().all(|byte| byte.is_ascii_digit()) {
            if let Ok(bank_num) = prefix.parse::<u16>() {
                if bank_num <= 0xFF {
                    return (Some(bank_num as u8), prepare_name(&component[dash + 1..]));
                }
            }
        }
    }

    (None, prepare_name(component))
}

pub fn calc_file_size(file: &FileEntry, cluster_size: u32) -> u64 {
    (file.cluster_cnt as u64 - (file.cluster_cnt != 0) as u64) * cluster_size as u64
        + (file.block_cnt as u64 - (file.block_cnt != 0) as u64) * BLK_SIZE
        + file.byte_cnt as u64
}

/// Converts a byte size into `(cluster_cnt, block_cnt, byte_cnt)`. A
/// non-empty file ending exactly on a cluster boundary reports its last
/// cluster as fully used.
pub fn file_size_to_counts(cluster_size: u32, tgt_size: u64) -> (u16, u16, u16) {
    let cluster_size = cluster_size as u64;

    let mut byte_cnt = (tgt_size % BLK_SIZE) as u16;
    let mut block_cnt = ((tgt_size % cluster_size) / BLK_SIZE) as u16 + (byte_cnt != 0) as u16;
    let cluster_cnt = (tgt_size / cluster_size) as u16 + (block_cnt != 0) as u16;
    if block_cnt == 0 && tgt_size != 0 {
        block_cnt = (cluster_size / BLK_SIZE) as u16;
    }
    if byte_cnt == 0 && tgt_size != 0 {
        byte_cnt = BLK_SIZE as u16;
    }

    (cluster_cnt, block_cnt, byte_cnt)
}

fn dir_size(header: &Header, dir: &DirEntry) -> u64 {
    let end_of_file_list = header.file_list_blk_addr + header.file_list_blk_cnt;

    dir.blocks
        .iter()
        .filter(|&&block| (block as u32) >= header.file_list_blk_addr && (block as u32) < end_of_file_list)
        .count() as u64
        * BLK_SIZE
}

fn dir_to_dentry(header: &Header, dir: &DirEntry) -> Dentry {
    Dentry {
        fname: name_to_string(&dir.name),
        fsize: dir_size(header, dir),
        ctime: 0,
        mtime: 0,
        atime: 0,
        ftype: FileType::Dir,
    }
}

fn file_to_dentry(cluster_size: u32, file: &FileEntry) -> Dentry {
    Dentry {
        fname: format!("{}-{}", file.bank_num, name_to_string(&file.name)),
        fsize: calc_file_size(file, cluster_size),
        ctime: 0,
        mtime: 0,
        atime: 0,
        ftype: FileType::File,
    }
}

fn check_header(header: &Header) -> Result<()> {
    if header.cluster_cnt == 0 || header.cluster_cnt > FAT_ATTRS.data_max {
        return Err(Emu3Error::BadClusterCnt.into());
    }

    if header.fat_blk_cnt == 0 || header.fat_blk_cnt as u64 * BLK_SIZE / 2 > 0x8000 {
        return Err(Emu3Error::BadFatBlkCnt.into());
    }

    if header.file_list_blk_addr as u64 + header.file_list_blk_cnt as u64 > 0x10000 {
        return Err(Emu3Error::BadFileListAddrOrCnt.into());
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum FindBy<'a> {
    Bank(u8),
    Name(&'a [u8; 16]),
}

struct OpenFile {
    refcount: u64,
    ftype: FileType,
    entry: FileEntry,
    /// File entries point back at their directory entry so closing can
    /// release both.
    dir_key: Option<String>,
}

struct State<DS: DataStorage> {
    storage: DS,
    header: Header,
    next_file_list_blk: u16,
    free_clusters: u16,
    dir_content_block_map: Vec<bool>,
    fat_dyn: FatDynAttrs<u16>,
    fat: Vec<u16>,
    open_files: HashMap<String, OpenFile>,
}

/// A mounted EMU3 volume over any byte-addressed storage.
pub struct FileSystemServer<DS: DataStorage> {
    state: Mutex<State<DS>>,
}

impl<DS: DataStorage> FileSystemServer<DS> {
    pub fn new(storage: DS) -> Result<Self> {
        let blk_count = storage.len()? / BLK_SIZE;
        if blk_count == 0 {
            return Err(VfsError::DiskTooSmall.into());
        }

        let mut block = [0; BLK_SIZE as usize];
        storage.read(0, &mut block)?;

        if block[..4] != MAGIC {
            return Err(VfsError::WrongFs.into());
        }

        let expected = u16::from_le_bytes([block[510], block[511]]);
        if checksum(&block) != expected {
            error!("Superblock checksum mismatch");
            return Err(VfsError::InvalidState.into());
        }

        let header = parse_header(&block)?;
        if let Err(err) = check_header(&header) {
            error!("Bad superblock: {err}");
            return Err(VfsError::InvalidState.into());
        }

        if blk_count < header.block_cnt as u64 {
            return Err(VfsError::DiskTooSmall.into());
        }

        let mut hint = [0; 2];
        storage.read(BLK_SIZE, &mut hint)?;
        let next_file_list_blk = u16::from_le_bytes(hint);

        let fat_dyn = FatDynAttrs {
            length: header.cluster_cnt + 1,
            base_addr: header.fat_blk_addr as u64 * BLK_SIZE,
        };

        let mut raw_fat = vec![0; fat_dyn.length as usize * 2];
        storage.read(fat_dyn.base_addr, &mut raw_fat)?;
        let fat: Vec<u16> = raw_fat
            .chunks_exact(2)
            .map(|cell| u16::from_le_bytes([cell[0], cell[1]]))
            .collect();

        let free_clusters = fat::count_free(&fat, &FAT_ATTRS, fat_dyn.length);

        let map_len = (header.file_list_blk_cnt as usize)
            .min(header.dir_list_blk_cnt as usize * DIRS_PER_BLOCK * MAX_BLOCKS_PER_DIR);

        let mut state = State {
            storage,
            header,
            next_file_list_blk,
            free_clusters,
            dir_content_block_map: vec![false; map_len],
            fat_dyn,
            fat,
            open_files: HashMap::new(),
        };
        state.map_dir_blocks()?;

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, State<DS>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<DS: DataStorage> State<DS> {
    fn read_block(&self, block: u64) -> Result<[u8; BLK_SIZE as usize]> {
        let mut data = [0; BLK_SIZE as usize];
        self.storage.read(block * BLK_SIZE, &mut data)?;
        Ok(data)
    }

    fn write_dir_entry(&self, dir: &DirEntry) -> Result<()> {
        self.storage.write(dir.addr, &pack_dir_entry(dir))
    }

    fn write_file_entry(&self, file: &FileEntry) -> Result<()> {
        self.storage.write(file.addr, &pack_file_entry(file))
    }

    fn in_file_list(&self, block: u16) -> bool {
        (block as u32) >= self.header.file_list_blk_addr
            && (block as u32) < self.header.file_list_blk_addr + self.header.file_list_blk_cnt
    }

    fn map_dir_blocks(&mut self) -> Result<()> {
        let map_len = self.dir_content_block_map.len() as u32;
        let end_of_file_blks = self.header.file_list_blk_addr + map_len;

        for block in 0..self.header.dir_list_blk_cnt {
            let data = self.read_block(self.header.dir_list_blk_addr as u64 + block as u64)?;

            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    continue;
                }

                let dir = parse_dir_entry(&data[offset..], false, 0)?;
                for content_block in dir.blocks {
                    if (content_block as u32) >= self.header.file_list_blk_addr
                        && (content_block as u32) < end_of_file_blks
                    {
                        self.dir_content_block_map
                            [(content_block as u32 - self.header.file_list_blk_addr) as usize] =
                            true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Every valid directory of the root table, in table order.
    fn load_root_dirs(&self) -> Result<Vec<DirEntry>> {
        let mut dirs = Vec::new();

        for block in 0..self.header.dir_list_blk_cnt {
            let block_addr = (self.header.dir_list_blk_addr as u64 + block as u64) * BLK_SIZE;
            let data = self.read_block(self.header.dir_list_blk_addr as u64 + block as u64)?;

            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    continue;
                }

                dirs.push(parse_dir_entry(
                    &data[offset..],
                    true,
                    block_addr + offset as u64,
                )?);
            }
        }

        Ok(dirs)
    }

    fn find_dir(&self, name: &[u8; 16]) -> Result<DirEntry> {
        for block in 0..self.header.dir_list_blk_cnt {
            let block_addr = (self.header.dir_list_blk_addr as u64 + block as u64) * BLK_SIZE;
            let data = self.read_block(self.header.dir_list_blk_addr as u64 + block as u64)?;

            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    continue;
                }

                let dir = parse_dir_entry(&data[offset..], true, block_addr + offset as u64)?;
                if name_eq(&dir.name, name) {
                    return Ok(dir);
                }
            }
        }

        Err(VfsError::NotFound.into())
    }

    /// Files of `dir`, or the single file matched by `find_by`.
    fn load_files_in_dir(&self, dir: &DirEntry, find_by: Option<FindBy>) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();

        for &content_block in &dir.blocks {
            if !self.in_file_list(content_block) {
                continue;
            }

            let block_addr = content_block as u64 * BLK_SIZE;
            let data = self.read_block(content_block as u64)?;

            for slot in 0..FILES_PER_BLOCK {
                let offset = slot * FILE_ENTRY_SIZE as usize;
                if !is_valid_file(data[offset + 0x1A]) {
                    continue;
                }

                let file = parse_file_entry(&data[offset..], true, block_addr + offset as u64)?;

                match find_by {
                    None => files.push(file),
                    Some(FindBy::Bank(bank_num)) => {
                        if file.bank_num == bank_num {
                            files.push(file);
                            return Ok(files);
                        }
                    }
                    Some(FindBy::Name(name)) => {
                        if name_eq(&file.name, name) {
                            files.push(file);
                            return Ok(files);
                        }
                    }
                }
            }
        }

        if find_by.is_some() {
            return Err(VfsError::NotFound.into());
        }

        Ok(files)
    }

    fn find_file(&self, dir: &DirEntry, find_by: FindBy) -> Result<FileEntry> {
        let files = self.load_files_in_dir(dir, Some(find_by))?;
        files.first().copied().ok_or(VfsError::NotFound.into())
    }

    /// Finds the file matched by `find_by`, or prepares `entry` as a fresh
    /// one in the first free slot. With a name search the new entry gets
    /// the lowest unused bank number. Fails [`Emu3Error::TryGrowDir`] when
    /// the directory has no free slot left.
    fn find_file_or_free(
        &self,
        dir: &DirEntry,
        find_by: FindBy,
        entry: &mut FileEntry,
    ) -> Result<()> {
        let mut free_addr = None;
        let mut bank_nums = [false; 256];

        for &content_block in &dir.blocks {
            if !self.in_file_list(content_block) {
                continue;
            }

            let block_addr = content_block as u64 * BLK_SIZE;
            let data = self.read_block(content_block as u64)?;

            for slot in 0..FILES_PER_BLOCK {
                let offset = slot * FILE_ENTRY_SIZE as usize;
                if !is_valid_file(data[offset + 0x1A]) {
                    if free_addr.is_none() {
                        free_addr = Some(block_addr + offset as u64);
                    }
                    continue;
                }

                bank_nums[data[offset + 0x11] as usize] = true;

                let matched = match find_by {
                    FindBy::Bank(bank_num) => data[offset + 0x11] == bank_num,
                    FindBy::Name(name) => {
                        let file = parse_file_entry(&data[offset..], true, 0)?;
                        name_eq(&file.name, name)
                    }
                };
                if matched {
                    *entry = parse_file_entry(&data[offset..], true, block_addr + offset as u64)?;
                    return Ok(());
                }
            }
        }

        entry.start_cluster = FAT_ATTRS.end_of_chain;
        entry.cluster_cnt = 0;
        entry.block_cnt = 0;
        entry.byte_cnt = 0;
        entry.ftype = file_type::DEL;
        entry.props = [0; 5];

        match find_by {
            FindBy::Bank(bank_num) => entry.bank_num = bank_num,
            FindBy::Name(_) => {
                let unused = (0..=MAX_BANK).find(|&bank_num| !bank_nums[bank_num as usize]);
                match unused {
                    Some(bank_num) => entry.bank_num = bank_num,
                    //a directory can't even hold that many files
                    None => return Err(VfsError::NoSpaceLeft.into()),
                }
            }
        }

        match free_addr {
            Some(addr) => entry.addr = addr,
            None => return Err(Emu3Error::TryGrowDir.into()),
        }

        Ok(())
    }

    /// Recomputes and persists the content-block hint at block 1 once the
    /// block it pointed at gets taken.
    fn update_next_file_list_block(&mut self, used: u16) -> Result<()> {
        if used < self.next_file_list_blk {
            return Ok(());
        }

        let base = self.header.file_list_blk_addr;
        let start = (used as u32 - base) as usize;

        let found = (start..self.dir_content_block_map.len())
            .find(|&index| !self.dir_content_block_map[index]);

        self.next_file_list_blk = match found {
            Some(index) => (index as u32 + base) as u16,
            None => (base + self.header.file_list_blk_cnt) as u16,
        };

        self.storage
            .write(BLK_SIZE, &self.next_file_list_blk.to_le_bytes())
    }

    /// Hands `dir` its next content block, taken from the free pool.
    fn extend_dir(&mut self, dir: &mut DirEntry) -> Result<u16> {
        for slot in 0..MAX_BLOCKS_PER_DIR {
            if self.in_file_list(dir.blocks[slot]) {
                continue;
            }

            let free =
                (0..self.dir_content_block_map.len()).find(|&index| !self.dir_content_block_map[index]);

            let Some(index) = free else {
                return Err(VfsError::NoSpaceLeft.into());
            };

            let new_block = (index as u32 + self.header.file_list_blk_addr) as u16;
            dir.blocks[slot] = new_block;
            self.write_dir_entry(dir)?;

            self.dir_content_block_map[index] = true;
            self.update_next_file_list_block(new_block)?;

            return Ok(new_block);
        }

        Err(Emu3Error::DirSizeMaxed.into())
    }

    /// Grows or shrinks `file`'s chain to match `new_size`, updating the
    /// counts, the entry on disk, the FAT on disk and in the mirror, and
    /// the free-cluster accounting.
    fn resize_file(&mut self, file: &mut FileEntry, new_size: u64) -> Result<()> {
        let cluster_size = calc_cluster_size(self.header.cluster_shift);
        let (cluster_cnt, block_cnt, byte_cnt) = file_size_to_counts(cluster_size, new_size);

        let grow = cluster_cnt > file.cluster_cnt;
        let shrink = cluster_cnt < file.cluster_cnt;

        let mut chain = Vec::new();
        let mut old_cluster_cnt = 0;

        if grow {
            match fat::follow(&self.fat, &FAT_ATTRS, self.fat_dyn.length, file.start_cluster) {
                Ok(cur_chain) => chain = cur_chain,
                //zero-length files have no chain yet
                Err(Error::Fat(FatError::BadStart)) => {}
                Err(err) => return Err(err),
            }

            old_cluster_cnt = chain.len() as u16;

            match fat::find_free_chain(
                &self.fat,
                &FAT_ATTRS,
                self.fat_dyn.length,
                cluster_cnt as u64,
                &mut chain,
            ) {
                Ok(()) => {}
                Err(Error::Fat(FatError::NoFreeClusters)) => {
                    return Err(VfsError::NoSpaceLeft.into())
                }
                Err(err) => return Err(err),
            }

            file.start_cluster = chain[0];
        } else if shrink {
            chain = fat::follow(&self.fat, &FAT_ATTRS, self.fat_dyn.length, file.start_cluster)?;
            old_cluster_cnt = chain.len() as u16;

            fat::shrink_chain_at(
                &self.storage,
                &FAT_ATTRS,
                &self.fat_dyn,
                &chain,
                cluster_cnt as usize,
            )?;
            fat::shrink_chain(
                &mut self.fat,
                &FAT_ATTRS,
                self.fat_dyn.length,
                &chain,
                cluster_cnt as usize,
            )?;

            file.start_cluster = if cluster_cnt > 0 {
                chain[0]
            } else {
                FAT_ATTRS.end_of_chain
            };
            self.free_clusters += old_cluster_cnt - cluster_cnt;
        }

        file.cluster_cnt = cluster_cnt;
        file.block_cnt = block_cnt;
        file.byte_cnt = byte_cnt;

        self.write_file_entry(file)?;

        if grow {
            fat::write_chain_at(&self.storage, &FAT_ATTRS, &self.fat_dyn, &chain)?;
            fat::write_chain(&mut self.fat, &FAT_ATTRS, self.fat_dyn.length, &chain)?;

            self.free_clusters -= cluster_cnt - old_cluster_cnt;
        }

        Ok(())
    }

    fn remove_file(&mut self, file: &FileEntry) -> Result<()> {
        let mut chain = Vec::new();

        if file.cluster_cnt != 0 {
            chain = fat::follow(&self.fat, &FAT_ATTRS, self.fat_dyn.length, file.start_cluster)?;

            fat::free_chain_at(&self.storage, &FAT_ATTRS, &self.fat_dyn, &chain)?;
            fat::free_chain(&mut self.fat, &FAT_ATTRS, self.fat_dyn.length, &chain)?;
        }

        self.free_clusters += chain.len() as u16;

        self.storage
            .write(file.addr + 0x1A, &[file_type::DEL])
    }

    /// Removes every file of `dir` and the directory itself. The
    /// non-recursive variant refuses directories that still own files and
    /// backs the replace-on-rename path.
    fn remove_dir(&mut self, dir: &DirEntry, recurse: bool) -> Result<()> {
        let dir_name = name_to_string(&dir.name);

        let mut del_failed = false;
        let mut first_err = None;

        for &content_block in &dir.blocks {
            if !self.in_file_list(content_block) {
                continue;
            }

            let block_addr = content_block as u64 * BLK_SIZE;
            let data = self.read_block(content_block as u64)?;

            for slot in 0..FILES_PER_BLOCK {
                let offset = slot * FILE_ENTRY_SIZE as usize;
                if !is_valid_file(data[offset + 0x1A]) {
                    continue;
                }

                if !recurse {
                    return Err(VfsError::NotEmpty.into());
                }

                let key = format!("{}/{}", dir_name, data[offset + 0x11]);
                if self.open_files.contains_key(&key) {
                    del_failed = true;
                    continue;
                }

                let file = parse_file_entry(&data[offset..], true, block_addr + offset as u64)?;
                if let Err(err) = self.remove_file(&file) {
                    first_err.get_or_insert(err);
                }
            }
        }

        if del_failed {
            return Err(VfsError::AlreadyOpen.into());
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        for &content_block in &dir.blocks {
            if self.in_file_list(content_block) {
                let index = (content_block as u32 - self.header.file_list_blk_addr) as usize;
                if index < self.dir_content_block_map.len() {
                    self.dir_content_block_map[index] = false;
                }
            }
        }

        self.storage.write(dir.addr + 0x11, &[dir_type::DEL])
    }

    /// Single pass over the root table: finds the source by name, clears a
    /// destination-name directory if one exists and is empty, writes the
    /// new name in place.
    fn rename_dir(&mut self, src_name: &[u8; 16], dst_name: &str) -> Result<()> {
        let dst_name_prepared = prepare_name(dst_name);

        let mut src_dir = None;
        let mut found_dst = false;

        'search: for block in 0..self.header.dir_list_blk_cnt {
            let block_addr = (self.header.dir_list_blk_addr as u64 + block as u64) * BLK_SIZE;
            let data = self.read_block(self.header.dir_list_blk_addr as u64 + block as u64)?;

            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    continue;
                }

                let mut entry_name = [0; 16];
                entry_name.copy_from_slice(&data[offset..offset + 16]);

                if src_dir.is_none() && name_eq(&entry_name, src_name) {
                    src_dir =
                        Some(parse_dir_entry(&data[offset..], true, block_addr + offset as u64)?);
                } else if name_eq(&entry_name, &dst_name_prepared) {
                    let dst_dir =
                        parse_dir_entry(&data[offset..], true, block_addr + offset as u64)?;

                    if self.remove_dir(&dst_dir, false).is_err() {
                        return Err(VfsError::AlreadyExists.into());
                    }

                    found_dst = true;
                }
            }

            if src_dir.is_some() && found_dst {
                break 'search;
            }
        }

        let Some(mut dir) = src_dir else {
            return Err(VfsError::NotFound.into());
        };

        dir.name = dst_name_prepared;
        self.write_dir_entry(&dir)
    }

    /// Rehomes `src_file` into `dst_dir`, keeping its data chain. An empty
    /// destination name keeps the source name; a destination bank that is
    /// already taken has its file removed first.
    fn move_file(
        &mut self,
        src_file: &FileEntry,
        dst_dir: &mut DirEntry,
        dst_fname: &str,
    ) -> Result<()> {
        let (dst_bank, dst_name) = bank_num_and_name(dst_fname);
        let dst_bank = dst_bank.unwrap_or(src_file.bank_num);

        let dst_key = format!("{}/{}", name_to_string(&dst_dir.name), dst_bank);
        if self.open_files.contains_key(&dst_key) {
            return Err(VfsError::AlreadyOpen.into());
        }

        let mut dst_file = FileEntry::default();
        match self.find_file_or_free(dst_dir, FindBy::Bank(dst_bank), &mut dst_file) {
            Ok(()) => {
                if dst_file.ftype != file_type::DEL {
                    self.remove_file(&dst_file)?;
                }
            }
            Err(Error::Emu3(Emu3Error::TryGrowDir)) => {
                let new_block = self.extend_dir(dst_dir)?;
                dst_file.addr = new_block as u64 * BLK_SIZE;
            }
            Err(err) => return Err(err),
        }

        dst_file.bank_num = dst_bank;
        dst_file.name = if dst_name[0] != 0 {
            dst_name
        } else {
            src_file.name
        };
        dst_file.start_cluster = src_file.start_cluster;
        dst_file.cluster_cnt = src_file.cluster_cnt;
        dst_file.block_cnt = src_file.block_cnt;
        dst_file.byte_cnt = src_file.byte_cnt;
        dst_file.ftype = src_file.ftype;
        dst_file.props = src_file.props;

        self.write_file_entry(&dst_file)?;

        self.storage
            .write(src_file.addr + 0x1A, &[file_type::DEL])
    }

    /// Single pass locating the rename source (by bank or name) and the
    /// destination bank's current owner, if any.
    fn load_src_and_dst(
        &self,
        dir: &DirEntry,
        find_src_by: FindBy,
        src_file: &mut FileEntry,
        dst_file: &mut FileEntry,
    ) -> Result<(bool, bool)> {
        let mut found_src = false;
        let mut found_dst = false;

        for &content_block in &dir.blocks {
            if !self.in_file_list(content_block) {
                continue;
            }

            let block_addr = content_block as u64 * BLK_SIZE;
            let data = self.read_block(content_block as u64)?;

            for slot in 0..FILES_PER_BLOCK {
                let offset = slot * FILE_ENTRY_SIZE as usize;
                if !is_valid_file(data[offset + 0x1A]) {
                    continue;
                }

                if !found_src {
                    let matched = match find_src_by {
                        FindBy::Bank(bank_num) => data[offset + 0x11] == bank_num,
                        FindBy::Name(name) => {
                            let file = parse_file_entry(&data[offset..], true, 0)?;
                            name_eq(&file.name, name)
                        }
                    };
                    if matched {
                        *src_file =
                            parse_file_entry(&data[offset..], true, block_addr + offset as u64)?;
                        found_src = true;
                    }
                }

                if !found_dst && data[offset + 0x11] == dst_file.bank_num {
                    *dst_file =
                        parse_file_entry(&data[offset..], true, block_addr + offset as u64)?;
                    found_dst = true;
                }
            }

            if found_src && found_dst {
                break;
            }
        }

        Ok((found_src, found_dst))
    }

    /// Renames a file within `dir`, switching its bank number when the
    /// destination carries one and evicting the previous owner of that
    /// bank.
    fn rename_file(&mut self, dir: &DirEntry, src_fname: &str, dst_fname: &str) -> Result<()> {
        let dir_name = name_to_string(&dir.name);

        let (src_bank, src_name) = bank_num_and_name(src_fname);
        let (dst_bank, dst_name) = bank_num_and_name(dst_fname);

        let mut src_file = FileEntry::default();

        if dst_bank.is_some() && src_bank != dst_bank {
            let dst_bank = dst_bank.unwrap_or_default();

            if self
                .open_files
                .contains_key(&format!("{}/{}", dir_name, dst_bank))
            {
                return Err(VfsError::AlreadyOpen.into());
            }

            let mut dst_file = FileEntry {
                bank_num: dst_bank,
                ..FileEntry::default()
            };

            let found_dst;
            match src_bank {
                Some(src_bank) => {
                    if self
                        .open_files
                        .contains_key(&format!("{}/{}", dir_name, src_bank))
                    {
                        return Err(VfsError::AlreadyOpen.into());
                    }

                    src_file.bank_num = src_bank;
                    let (found_src, found) = self.load_src_and_dst(
                        dir,
                        FindBy::Bank(src_bank),
                        &mut src_file,
                        &mut dst_file,
                    )?;
                    found_dst = found;

                    if !found_src {
                        return Err(VfsError::NotFound.into());
                    }
                }
                None => {
                    src_file.name = src_name;
                    let (found_src, found) = self.load_src_and_dst(
                        dir,
                        FindBy::Name(&src_name),
                        &mut src_file,
                        &mut dst_file,
                    )?;
                    found_dst = found;

                    if !found_src {
                        return Err(VfsError::NotFound.into());
                    }

                    if self
                        .open_files
                        .contains_key(&format!("{}/{}", dir_name, src_file.bank_num))
                    {
                        return Err(VfsError::AlreadyOpen.into());
                    }
                }
            }

            if found_dst && src_file.bank_num != dst_bank {
                if self.remove_file(&dst_file).is_err() {
                    return Err(VfsError::AlreadyExists.into());
                }
            }

            src_file.bank_num = dst_bank;
        } else {
            match src_bank {
                Some(src_bank) => {
                    if self
                        .open_files
                        .contains_key(&format!("{}/{}", dir_name, src_bank))
                    {
                        return Err(VfsError::AlreadyOpen.into());
                    }

                    src_file = self.find_file(dir, FindBy::Bank(src_bank))?;
                }
                None => {
                    src_file = self.find_file(dir, FindBy::Name(&src_name))?;

                    if self
                        .open_files
                        .contains_key(&format!("{}/{}", dir_name, src_file.bank_num))
                    {
                        return Err(VfsError::AlreadyOpen.into());
                    }
                }
            }
        }

        if dst_name[0] != 0 {
            src_file.name = dst_name;
        }

        self.write_file_entry(&src_file)
    }

    /// Shared lookup of truncate and open: resolves the target file,
    /// allocating a directory slot (and growing the directory) for a new
    /// one. When the file is already open, reports
    /// [`Emu3Error::FoundInMap`] with the map key in `open_key`.
    fn trunc_open_common(
        &mut self,
        dir: &mut DirEntry,
        bank_num: Option<u8>,
        entry: &mut FileEntry,
        open_key: &mut String,
    ) -> Result<()> {
        let dir_name = name_to_string(&dir.name);

        let find_err = match bank_num {
            Some(bank_num) => {
                let key = format!("{}/{}", dir_name, bank_num);
                if self.open_files.contains_key(&key) {
                    *open_key = key;
                    return Err(Emu3Error::FoundInMap.into());
                }

                self.find_file_or_free(dir, FindBy::Bank(bank_num), entry).err()
            }
            None => {
                let name = entry.name;
                let find_err = self.find_file_or_free(dir, FindBy::Name(&name), entry).err();

                if entry.ftype != file_type::DEL {
                    let key = format!("{}/{}", dir_name, entry.bank_num);
                    if self.open_files.contains_key(&key) {
                        *open_key = key;
                        return Err(Emu3Error::FoundInMap.into());
                    }
                }

                find_err
            }
        };

        if let Some(err) = find_err {
            if err != Error::Emu3(Emu3Error::TryGrowDir) {
                return Err(err);
            }

            let new_block = self.extend_dir(dir)?;
            entry.addr = new_block as u64 * BLK_SIZE;
        }

        Ok(())
    }

    /// Successor of `cur` during a write, allocating a fresh cluster and
    /// persisting the entry's grown counts when the chain ends here.
    fn get_or_alloc_next_cls(&mut self, cur: u16, entry: &mut FileEntry) -> Result<u16> {
        let mut next = 0;

        match fat::get_next_or_free(&self.fat, &FAT_ATTRS, self.fat_dyn.length, cur, &mut next) {
            Ok(()) => Ok(next),
            Err(Error::Fat(FatError::Alloc)) => {
                if next != FAT_ATTRS.end_of_chain {
                    if entry.cluster_cnt == 0 {
                        entry.start_cluster = next;
                    }
                    entry.cluster_cnt += 1;
                    entry.block_cnt = 0;
                    entry.byte_cnt = 0;

                    self.write_file_entry(entry)?;

                    fat::extend_chain(
                        &mut self.fat,
                        &self.storage,
                        &FAT_ATTRS,
                        &self.fat_dyn,
                        cur,
                        next,
                    )
                    .map_err(|_| VfsError::IoError)?;

                    self.free_clusters -= 1;
                }

                Ok(next)
            }
            Err(err) => Err(err),
        }
    }

    /// Cluster holding write position `pos`, growing the file to `pos + 1`
    /// first when the chain is too short; the per-cluster loop extends the
    /// rest.
    fn get_or_alloc_nth_cls(
        &mut self,
        cluster: &mut u16,
        n: u64,
        entry: &mut FileEntry,
        pos: u64,
    ) -> Result<()> {
        match fat::get_nth(&self.fat, &FAT_ATTRS, self.fat_dyn.length, cluster, n) {
            Ok(()) => Ok(()),
            Err(Error::Fat(FatError::ChainOob)) => Err(FatError::ChainOob.into()),
            Err(_) => {
                self.resize_file(entry, pos + 1)?;

                *cluster = entry.start_cluster;
                fat::get_nth(&self.fat, &FAT_ATTRS, self.fat_dyn.length, cluster, n)
            }
        }
    }

    fn open_entry(&self, key: &str) -> Result<&OpenFile> {
        self.open_files.get(key).ok_or(VfsError::InvalidState.into())
    }

    fn store_open_entry(&mut self, key: &str, entry: &FileEntry) {
        if let Some(open_file) = self.open_files.get_mut(key) {
            open_file.entry = *entry;
        }
    }
}

impl<DS: DataStorage> FileSystem for FileSystemServer<DS> {
    fn type_name(&self) -> &'static str {
        FS_NAME
    }

    fn open_file_count(&self) -> u64 {
        self.state().open_files.len() as u64
    }

    fn can_unmount(&self) -> bool {
        self.state().open_files.is_empty()
    }

    fn free_space(&self) -> u64 {
        let state = self.state();
        state.free_clusters as u64 * calc_cluster_size(state.header.cluster_shift) as u64
    }

    fn list(&self, path: &str, get_dir: bool) -> Result<Vec<Dentry>> {
        let state = self.state();
        let components = split_path(path);

        match components.len() {
            0 => {
                if get_dir {
                    return Ok(vec![Dentry {
                        fname: "/".to_string(),
                        fsize: state.header.dir_list_blk_cnt as u64 * BLK_SIZE,
                        ctime: 0,
                        mtime: 0,
                        atime: 0,
                        ftype: FileType::Dir,
                    }]);
                }

                let dirs = state.load_root_dirs()?;
                Ok(dirs
                    .iter()
                    .map(|dir| dir_to_dentry(&state.header, dir))
                    .collect())
            }
            1 => {
                let dir = state.find_dir(&prepare_name(components[0]))?;

                if get_dir {
                    return Ok(vec![dir_to_dentry(&state.header, &dir)]);
                }

                let files = state.load_files_in_dir(&dir, None)?;
                let cluster_size = calc_cluster_size(state.header.cluster_shift);
                Ok(files
                    .iter()
                    .map(|file| file_to_dentry(cluster_size, file))
                    .collect())
            }
            2 => {
                let dir = state.find_dir(&prepare_name(components[0]))?;

                let (bank_num, name) = bank_num_and_name(components[1]);
                let file = match bank_num {
                    Some(bank_num) => state.find_file(&dir, FindBy::Bank(bank_num))?,
                    None => state.find_file(&dir, FindBy::Name(&name))?,
                };

                Ok(vec![file_to_dentry(
                    calc_cluster_size(state.header.cluster_shift),
                    &file,
                )])
            }
            _ => Err(VfsError::InvalidPath.into()),
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let state = self.state();
        let components = split_path(path);

        // the root table is flat, directories don't nest
        if components.len() != 1 {
            return Err(VfsError::InvalidPath.into());
        }

        let search_name = prepare_name(components[0]);

        let mut free_slot_addr = None;
        let mut found = false;

        'search: for block in 0..state.header.dir_list_blk_cnt {
            let block_addr = (state.header.dir_list_blk_addr as u64 + block as u64) * BLK_SIZE;
            let data = state.read_block(state.header.dir_list_blk_addr as u64 + block as u64)?;

            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    if free_slot_addr.is_none() {
                        free_slot_addr = Some(block_addr + offset as u64);
                    }
                    continue;
                }

                let dir = parse_dir_entry(&data[offset..], true, 0)?;
                if name_eq(&dir.name, &search_name) {
                    found = true;
                    break 'search;
                }
            }
        }

        if found {
            return Err(VfsError::AlreadyExists.into());
        }
        let Some(addr) = free_slot_addr else {
            return Err(VfsError::NoSpaceLeft.into());
        };

        let dir = DirEntry {
            name: search_name,
            dtype: dir_type::NORMAL,
            blocks: [0xFFFF; MAX_BLOCKS_PER_DIR],
            addr,
        };

        state.write_dir_entry(&dir)?;
        state.storage.flush()
    }

    fn ftruncate(&self, path: &str, new_size: u64) -> Result<()> {
        let mut state = self.state();

        let max_file_size = state.header.cluster_cnt as u64
            * calc_cluster_size(state.header.cluster_shift) as u64;
        if new_size > max_file_size {
            return Err(VfsError::FileTooLarge.into());
        }

        let components = split_path(path);
        if components.len() != 2 {
            return Err(VfsError::InvalidPath.into());
        }

        let mut dir = state.find_dir(&prepare_name(components[0]))?;
        let (bank_num, name) = bank_num_and_name(components[1]);

        let mut entry = FileEntry {
            name,
            ..FileEntry::default()
        };
        let mut open_key = String::new();

        match state.trunc_open_common(&mut dir, bank_num, &mut entry, &mut open_key) {
            Ok(()) => {
                entry.ftype = file_type::STD;
                state.resize_file(&mut entry, new_size)?;
            }
            Err(Error::Emu3(Emu3Error::FoundInMap)) => {
                let mut entry = state.open_entry(&open_key)?.entry;
                entry.ftype = file_type::STD;
                state.resize_file(&mut entry, new_size)?;
                state.store_open_entry(&open_key, &entry);
            }
            Err(err) => return Err(err),
        }

        state.storage.flush()
    }

    fn rename(&self, cur_path: &str, new_path: &str) -> Result<()> {
        let mut state = self.state();

        let src_components = split_path(cur_path);
        let dst_components = split_path(new_path);

        match src_components.len() {
            //the dispatch layer renames mount points itself
            0 => Err(VfsError::UnsupportedOperation.into()),

            // source is a directory, only a rename is possible
            1 => {
                match dst_components.len() {
                    //move to root, pointless but harmless
                    0 => return Ok(()),
                    1 => {}
                    //can't stuff a directory inside a file
                    2 => return Err(VfsError::UnsupportedOperation.into()),
                    _ => return Err(VfsError::InvalidPath.into()),
                }

                if state.open_files.contains_key(src_components[0]) {
                    return Err(VfsError::AlreadyOpen.into());
                }

                let result =
                    state.rename_dir(&prepare_name(src_components[0]), dst_components[0]);
                state.storage.flush()?;

                result
            }

            // source is a file, both rename and move are possible
            2 => {
                if dst_components.is_empty() {
                    return Err(VfsError::UnsupportedOperation.into());
                }
                if dst_components.len() > 2 {
                    return Err(VfsError::InvalidPath.into());
                }

                // same directory on both sides: plain rename
                if dst_components[0] == src_components[0] {
                    if dst_components.len() != 2 {
                        return Ok(());
                    }

                    let dir = state.find_dir(&prepare_name(src_components[0]))?;
                    return state.rename_file(&dir, src_components[1], dst_components[1]);
                }

                let src_dir = state.find_dir(&prepare_name(src_components[0]))?;
                let mut dst_dir = state.find_dir(&prepare_name(dst_components[0]))?;

                let src_dir_name = name_to_string(&src_dir.name);
                let (src_bank, src_name) = bank_num_and_name(src_components[1]);

                let src_file = match src_bank {
                    Some(src_bank) => {
                        if state
                            .open_files
                            .contains_key(&format!("{}/{}", src_dir_name, src_bank))
                        {
                            return Err(VfsError::AlreadyOpen.into());
                        }

                        state.find_file(&src_dir, FindBy::Bank(src_bank))?
                    }
                    None => {
                        let file = state.find_file(&src_dir, FindBy::Name(&src_name))?;

                        if state
                            .open_files
                            .contains_key(&format!("{}/{}", src_dir_name, file.bank_num))
                        {
                            return Err(VfsError::AlreadyOpen.into());
                        }

                        file
                    }
                };

                let dst_fname = if dst_components.len() < 2 {
                    ""
                } else {
                    dst_components[1]
                };

                let result = state.move_file(&src_file, &mut dst_dir, dst_fname);
                state.storage.flush()?;

                result
            }

            _ => Err(VfsError::InvalidPath.into()),
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.state();
        let components = split_path(path);

        let result = match components.len() {
            0 => {
                let dirs = state.load_root_dirs()?;

                let mut first_err = None;
                for dir in dirs {
                    if let Err(err) = state.remove_dir(&dir, true) {
                        first_err.get_or_insert(err);
                    }
                }

                match first_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            1 => {
                let dir = state.find_dir(&prepare_name(components[0]))?;
                state.remove_dir(&dir, true)
            }
            2 => {
                let dir = state.find_dir(&prepare_name(components[0]))?;
                let dir_name = name_to_string(&dir.name);

                let (bank_num, name) = bank_num_and_name(components[1]);

                let file = match bank_num {
                    Some(bank_num) => {
                        if state
                            .open_files
                            .contains_key(&format!("{}/{}", dir_name, bank_num))
                        {
                            return Err(VfsError::AlreadyOpen.into());
                        }

                        state.find_file(&dir, FindBy::Bank(bank_num))?
                    }
                    None => {
                        let file = state.find_file(&dir, FindBy::Name(&name))?;

                        if state
                            .open_files
                            .contains_key(&format!("{}/{}", dir_name, file.bank_num))
                        {
                            return Err(VfsError::AlreadyOpen.into());
                        }

                        file
                    }
                };

                state.remove_file(&file)
            }
            _ => return Err(VfsError::InvalidPath.into()),
        };

        state.storage.flush()?;
        result
    }

    fn fopen(&self, path: &str) -> Result<FileHandle> {
        let mut state = self.state();

        let components = split_path(path);
        if components.len() != 2 {
            return Err(VfsError::InvalidPath.into());
        }

        let mut dir = state.find_dir(&prepare_name(components[0]))?;
        let (bank_num, name) = bank_num_and_name(components[1]);

        let mut entry = FileEntry {
            name,
            ..FileEntry::default()
        };
        let mut open_key = String::new();

        match state.trunc_open_common(&mut dir, bank_num, &mut entry, &mut open_key) {
            Ok(()) => {}
            Err(Error::Emu3(Emu3Error::FoundInMap)) => {
                if let Some(open_file) = state.open_files.get_mut(&open_key) {
                    open_file.refcount += 1;
                }
                return Ok(FileHandle::new(open_key));
            }
            Err(err) => return Err(err),
        }

        entry.ftype = file_type::STD;
        state.write_file_entry(&entry)?;
        state.storage.flush()?;

        let dir_key = name_to_string(&dir.name);
        match state.open_files.get_mut(&dir_key) {
            Some(open_dir) => open_dir.refcount += 1,
            None => {
                state.open_files.insert(
                    dir_key.clone(),
                    OpenFile {
                        refcount: 1,
                        ftype: FileType::Dir,
                        entry: FileEntry {
                            addr: dir.addr,
                            ..FileEntry::default()
                        },
                        dir_key: None,
                    },
                );
            }
        }

        let file_key = format!("{}/{}", dir_key, entry.bank_num);
        match state.open_files.entry(file_key.clone()) {
            MapEntry::Occupied(_) => Err(VfsError::FailedToOpenFile.into()),
            MapEntry::Vacant(vacant) => {
                vacant.insert(OpenFile {
                    refcount: 1,
                    ftype: FileType::File,
                    entry,
                    dir_key: Some(dir_key),
                });

                Ok(FileHandle::new(file_key))
            }
        }
    }

    fn fclose(&self, file: &FileHandle) -> Result<()> {
        let mut state = self.state();

        let open_file = state.open_entry(file.key())?;
        if open_file.refcount == 1 {
            let dir_key = open_file.dir_key.clone();
            let is_file = open_file.ftype == FileType::File;

            state.open_files.remove(file.key());

            if is_file {
                if let Some(dir_key) = dir_key {
                    if let Some(open_dir) = state.open_files.get_mut(&dir_key) {
                        if open_dir.refcount == 1 {
                            state.open_files.remove(&dir_key);
                        } else {
                            open_dir.refcount -= 1;
                        }
                    }
                }
            }
        } else if let Some(open_file) = state.open_files.get_mut(file.key()) {
            open_file.refcount -= 1;
        }

        Ok(())
    }

    fn read(&self, file: &FileHandle, pos: &mut u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }

        let (cluster_size, max_file_size, data_addr, fat_len, entry) = {
            let state = self.state();
            let entry = state.open_entry(file.key())?.entry;
            let cluster_size = calc_cluster_size(state.header.cluster_shift) as u64;
            (
                cluster_size,
                state.header.cluster_cnt as u64 * cluster_size,
                state.header.data_sctn_blk_addr as u64 * BLK_SIZE,
                state.fat_dyn.length,
                entry,
            )
        };

        if *pos >= max_file_size {
            return Err(VfsError::EndOfFile.into());
        }

        let file_size = calc_file_size(&entry, cluster_size as u32);
        if *pos >= file_size {
            return Err(VfsError::EndOfFile.into());
        }

        let local_len = (file_size - *pos).min(dst.len() as u64);

        let mut cluster = entry.start_cluster;
        {
            let state = self.state();
            fat::get_nth(&state.fat, &FAT_ATTRS, fat_len, &mut cluster, *pos / cluster_size)
                .map_err(|_| VfsError::EndOfFile)?;
        }

        let mut off_in_cluster = *pos % cluster_size;
        let mut transferred = 0;

        while transferred < local_len {
            let state = self.state();

            if transferred > 0 {
                let next = state.fat[cluster as usize];
                if next < FAT_ATTRS.data_min || next > FAT_ATTRS.data_max || next >= fat_len {
                    return Err(VfsError::EndOfFile.into());
                }
                cluster = next;
            }

            let seg_len = (cluster_size - off_in_cluster).min(local_len - transferred);
            let addr = data_addr
                + (cluster - FAT_ATTRS.data_min) as u64 * cluster_size
                + off_in_cluster;
            state
                .storage
                .read(addr, &mut dst[transferred as usize..(transferred + seg_len) as usize])?;
            drop(state);

            transferred += seg_len;
            off_in_cluster = 0;
        }

        *pos += local_len;

        if dst.len() as u64 > local_len {
            return Err(VfsError::EndOfFile.into());
        }

        Ok(())
    }

    fn write(&self, file: &FileHandle, pos: &mut u64, src: &[u8]) -> Result<()> {
        // a zero-length write never grows the file, even past its end
        if src.is_empty() {
            return Ok(());
        }

        let mut state = self.state();

        let mut entry = state.open_entry(file.key())?.entry;
        let cluster_size = calc_cluster_size(state.header.cluster_shift) as u64;
        let max_file_size = state.header.cluster_cnt as u64 * cluster_size;
        let data_addr = state.header.data_sctn_blk_addr as u64 * BLK_SIZE;

        if *pos >= max_file_size {
            return Err(VfsError::FileTooLarge.into());
        }

        let local_len = (max_file_size - *pos).min(src.len() as u64);

        let mut cluster = entry.start_cluster;
        state.get_or_alloc_nth_cls(&mut cluster, *pos / cluster_size, &mut entry, *pos)?;
        state.store_open_entry(file.key(), &entry);
        drop(state);

        let mut off_in_cluster = *pos % cluster_size;
        let mut transferred = 0;

        while transferred < local_len {
            let mut state = self.state();

            if transferred > 0 {
                cluster = state.get_or_alloc_next_cls(cluster, &mut entry)?;
                state.store_open_entry(file.key(), &entry);

                if cluster < FAT_ATTRS.data_min || cluster > FAT_ATTRS.data_max {
                    return Err(VfsError::NoSpaceLeft.into());
                }
            }

            let seg_len = (cluster_size - off_in_cluster).min(local_len - transferred);
            let addr = data_addr
                + (cluster - FAT_ATTRS.data_min) as u64 * cluster_size
                + off_in_cluster;
            state
                .storage
                .write(addr, &src[transferred as usize..(transferred + seg_len) as usize])?;
            drop(state);

            transferred += seg_len;
            off_in_cluster = 0;
        }

        *pos += local_len;

        let mut state = self.state();
        if *pos > calc_file_size(&entry, cluster_size as u32) {
            let (cluster_cnt, block_cnt, byte_cnt) = file_size_to_counts(cluster_size as u32, *pos);
            entry.cluster_cnt = cluster_cnt;
            entry.block_cnt = block_cnt;
            entry.byte_cnt = byte_cnt;

            state.write_file_entry(&entry)?;
            state.store_open_entry(file.key(), &entry);
        }
        drop(state);

        if src.len() as u64 > local_len {
            return Err(VfsError::FileTooLarge.into());
        }

        Ok(())
    }

    fn flush(&self, _file: &FileHandle) -> Result<()> {
        self.state().storage.flush()
    }
}
