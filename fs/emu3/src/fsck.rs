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

//! Check-and-repair pass over an EMU3 volume. Returns a bitmask of the
//! repairs made; a clean volume reports zero, and a second pass right
//! after a repair reports zero as well.

use std::collections::HashMap;

use log::warn;

use retrovfs_ds::DataStorage;
use retrovfs_err::{Result, VfsError};

use crate::{
    calc_cluster_size, checksum, is_valid_dir, is_valid_file, name_to_string, pack_dir_entry,
    pack_file_entry, pack_header, parse_dir_entry, parse_file_entry, parse_header, prepare_name,
    BLK_SIZE, DIRS_PER_BLOCK, DIR_ENTRY_SIZE, FAT_ATTRS, FILES_PER_BLOCK, FILE_ENTRY_SIZE,
    FIRST_NON_RESERVED_BLK, MAGIC, MAX_BLOCKS_PER_DIR, MAX_CLUSTER_CNT, MAX_CLUSTER_SHIFT,
    MAX_FAT_BLOCKS, MIN_CLUSTER_SHIFT,
};

/// Bits of the fsck status word.
pub mod status {
    pub const INVALID_CHECKSUM: u16 = 1 << 0;
    pub const BAD_CLUSTER_SHIFT: u16 = 1 << 1;
    pub const BAD_BLOCK_CNT: u16 = 1 << 2;
    pub const BAD_CLUSTER_CNT: u16 = 1 << 3;
    pub const BAD_ROOT_DIR: u16 = 1 << 4;
    pub const BAD_FILE_LIST: u16 = 1 << 5;
    pub const BAD_FAT_ADDR: u16 = 1 << 6;
    pub const BAD_FAT_BLK_CNT: u16 = 1 << 7;
    pub const FILE_LIST_COLLISION: u16 = 1 << 8;
    pub const FAT_COLLISION: u16 = 1 << 9;
    pub const DATA_COLLISION: u16 = 1 << 10;
    pub const BAD_DIR: u16 = 1 << 11;
    pub const BAD_NEXT_DIR_CONTENT_BLK: u16 = 1 << 12;
    pub const UNMARKED_RESERVED_CLUSTERS: u16 = 1 << 13;
    pub const BAD_FILE: u16 = 1 << 14;
}

/// Formatting fresh volumes is not supported; images come from real
/// hardware or emulators.
pub fn mkfs<DS: DataStorage>(_storage: &DS, _label: &str) -> Result<()> {
    Err(VfsError::UnsupportedOperation.into())
}

fn overlap(addr_a: u64, count_a: u64, addr_b: u64, count_b: u64) -> bool {
    let final_a = addr_a + count_a - (count_a != 0) as u64;
    let final_b = addr_b + count_b - (count_b != 0) as u64;

    (addr_a >= addr_b && addr_a <= final_b)
        || (final_a >= addr_b && final_a <= final_b)
        || (addr_a <= addr_b && final_a >= final_b)
}

pub fn fsck<DS: DataStorage>(storage: &DS) -> Result<u16> {
    let blk_count = storage.len()? / BLK_SIZE;
    if blk_count == 0 {
        return Err(VfsError::WrongFs.into());
    }

    let mut block = [0; BLK_SIZE as usize];
    storage.read(0, &mut block)?;

    /*--------------------------Superblock checks-------------------------*/
    if block[..4] != MAGIC {
        return Err(VfsError::WrongFs.into());
    }

    let mut fsck_status = 0u16;
    let mut should_write = false;
    // collision repairs are ambiguous, they suppress the superblock rewrite
    let mut collision = false;

    let expected_sum = u16::from_le_bytes([block[510], block[511]]);
    if checksum(&block) != expected_sum {
        fsck_status |= status::INVALID_CHECKSUM;

        //writing the superblock back recomputes the checksum
        should_write = true;
    }

    let mut header = parse_header(&block)?;

    if header.cluster_shift as u16 + MIN_CLUSTER_SHIFT as u16 > MAX_CLUSTER_SHIFT as u16 {
        fsck_status |= status::BAD_CLUSTER_SHIFT;
        header.cluster_shift = MAX_CLUSTER_SHIFT - MIN_CLUSTER_SHIFT;
        should_write = true;
    }

    let cluster_size = calc_cluster_size(header.cluster_shift);
    let blocks_per_cluster = (cluster_size as u64 / BLK_SIZE) as u16;

    if header.cluster_cnt == 0 {
        fsck_status |= status::BAD_CLUSTER_CNT;
    } else if header.cluster_cnt > MAX_CLUSTER_CNT {
        fsck_status |= status::BAD_CLUSTER_CNT;
        header.cluster_cnt = MAX_CLUSTER_CNT;
        should_write = true;
    }

    let data_blk_cnt = header.cluster_cnt as u64 * blocks_per_cluster as u64;
    let expected_fat_size = (header.cluster_cnt as u32 + FAT_ATTRS.data_min as u32) * 2;
    let expected_fat_blocks =
        expected_fat_size / BLK_SIZE as u32 + (expected_fat_size % BLK_SIZE as u32 != 0) as u32;

    if header.fat_blk_cnt != expected_fat_blocks {
        header.fat_blk_cnt = expected_fat_blocks;
        fsck_status |= status::BAD_FAT_BLK_CNT;
        should_write = true;
    }

    //mostly redundant with the expected size, but it bounds the FAT read
    if header.fat_blk_cnt > MAX_FAT_BLOCKS as u32 {
        header.fat_blk_cnt = MAX_FAT_BLOCKS as u32;
        fsck_status |= status::BAD_FAT_BLK_CNT;
        should_write = true;
    }

    let min_block_cnt = FIRST_NON_RESERVED_BLK as u64
        + header.dir_list_blk_cnt as u64
        + header.file_list_blk_cnt as u64
        + header.fat_blk_cnt as u64
        + data_blk_cnt;

    if (header.block_cnt as u64) < min_block_cnt {
        header.block_cnt = min_block_cnt as u32;
        fsck_status |= status::BAD_BLOCK_CNT;
        should_write = true;
    }

    if blk_count < header.block_cnt as u64 {
        return Err(VfsError::DiskTooSmall.into());
    }

    if header.dir_list_blk_addr < FIRST_NON_RESERVED_BLK {
        header.dir_list_blk_addr = FIRST_NON_RESERVED_BLK;
        fsck_status |= status::BAD_ROOT_DIR;
        should_write = true;
    }

    if header.file_list_blk_addr < FIRST_NON_RESERVED_BLK {
        header.file_list_blk_addr = FIRST_NON_RESERVED_BLK;
        fsck_status |= status::BAD_FILE_LIST;
        should_write = true;
    } else if header.file_list_blk_addr > 0xFFFF {
        header.file_list_blk_addr = 0xFFFF;
        fsck_status |= status::BAD_FILE_LIST;
        should_write = true;
    }

    if header.fat_blk_addr < FIRST_NON_RESERVED_BLK {
        header.fat_blk_addr = FIRST_NON_RESERVED_BLK;
        fsck_status |= status::BAD_FAT_ADDR;
        should_write = true;
    }

    if header.file_list_blk_addr as u64 + header.file_list_blk_cnt as u64 > 0x10000 {
        header.file_list_blk_cnt = 0x10000 - header.file_list_blk_addr;
        fsck_status |= status::BAD_FILE_LIST;
        should_write = true;
    }

    if overlap(
        header.file_list_blk_addr as u64,
        header.file_list_blk_cnt as u64,
        header.dir_list_blk_addr as u64,
        header.dir_list_blk_cnt as u64,
    ) {
        fsck_status |= status::FILE_LIST_COLLISION;
        collision = true;
    }

    if overlap(
        header.fat_blk_addr as u64,
        header.fat_blk_cnt as u64,
        header.dir_list_blk_addr as u64,
        header.dir_list_blk_cnt as u64,
    ) || overlap(
        header.fat_blk_addr as u64,
        header.fat_blk_cnt as u64,
        header.file_list_blk_addr as u64,
        header.file_list_blk_cnt as u64,
    ) {
        fsck_status |= status::FAT_COLLISION;
        collision = true;
    }

    if overlap(
        header.data_sctn_blk_addr as u64,
        data_blk_cnt,
        header.dir_list_blk_addr as u64,
        header.dir_list_blk_cnt as u64,
    ) || overlap(
        header.data_sctn_blk_addr as u64,
        data_blk_cnt,
        header.file_list_blk_addr as u64,
        header.file_list_blk_cnt as u64,
    ) || overlap(
        header.data_sctn_blk_addr as u64,
        data_blk_cnt,
        header.fat_blk_addr as u64,
        header.fat_blk_cnt as u64,
    ) {
        fsck_status |= status::DATA_COLLISION;
        collision = true;
    }
    /*----------------------End of superblock checks----------------------*/

    if should_write && !collision {
        warn!("Repairing superblock (status {fsck_status:#06X})");
        pack_header(&mut block, &header);
        storage.write(0, &block)?;
    }

    let mut hint = [0; 2];
    storage.read(BLK_SIZE, &mut hint)?;
    let mut next_file_list_blk = u16::from_le_bytes(hint);

    /*---------------------------Root dir checks--------------------------*/
    let end_of_file_blks = header.file_list_blk_addr as u64 + header.file_list_blk_cnt as u64;
    let mut map = vec![false; header.file_list_blk_cnt as usize];

    //name -> (reference count, handled by the dedup pass)
    let mut dir_names: HashMap<String, (u64, bool)> = HashMap::new();
    let mut dupe = false;

    for block_index in 0..header.dir_list_blk_cnt {
        let block_addr = (header.dir_list_blk_addr as u64 + block_index as u64) * BLK_SIZE;
        let mut data = [0; BLK_SIZE as usize];
        storage.read(block_addr, &mut data)?;

        let mut block_dirty = false;
        for slot in 0..DIRS_PER_BLOCK {
            let offset = slot * DIR_ENTRY_SIZE as usize;
            if !is_valid_dir(data[offset + 0x11]) {
                continue;
            }

            let mut dir = parse_dir_entry(&data[offset..], false, block_addr + offset as u64)?;

            //map duplicates only, fix them in a second pass
            let name = name_to_string(&dir.name);
            match dir_names.get_mut(&name) {
                Some(info) => {
                    info.0 += 1;
                    fsck_status |= status::BAD_DIR;
                    dupe = true;
                }
                None => {
                    dir_names.insert(name, (1, false));
                }
            }

            //several directories referencing one content block
            let mut entry_dirty = false;
            for content_block in dir.blocks.iter_mut() {
                if (*content_block as u64) < header.file_list_blk_addr as u64
                    || (*content_block as u64) >= end_of_file_blks
                {
                    continue;
                }

                let index = (*content_block as u64 - header.file_list_blk_addr as u64) as usize;
                if map[index] {
                    *content_block = 0xFFFF;
                    fsck_status |= status::BAD_DIR;
                    entry_dirty = true;
                    block_dirty = true;
                } else {
                    map[index] = true;
                }
            }

            if entry_dirty {
                data[offset..offset + DIR_ENTRY_SIZE as usize]
                    .copy_from_slice(&pack_dir_entry(&dir));
            }
        }

        if block_dirty {
            storage.write(block_addr, &data)?;
        }
    }

    if dupe {
        //second pass over the table to suffix duplicate names
        for block_index in 0..header.dir_list_blk_cnt {
            let block_addr = (header.dir_list_blk_addr as u64 + block_index as u64) * BLK_SIZE;
            let mut data = [0; BLK_SIZE as usize];
            storage.read(block_addr, &mut data)?;

            let mut block_dirty = false;
            for slot in 0..DIRS_PER_BLOCK {
                let offset = slot * DIR_ENTRY_SIZE as usize;
                if !is_valid_dir(data[offset + 0x11]) {
                    continue;
                }

                let mut dir = parse_dir_entry(&data[offset..], false, block_addr + offset as u64)?;
                let name = name_to_string(&dir.name);

                let seen = dir_names.get(&name).map(|info| info.1).unwrap_or(false);
                if !seen {
                    if let Some(info) = dir_names.get_mut(&name) {
                        info.1 = true;
                    }
                    continue;
                }

                for n in 2u64.. {
                    let number = n.to_string();

                    //bare number when the suffixed name would not fit
                    let dedup_name = if number.len() > 14 {
                        number
                    } else {
                        let mut base = name.clone();
                        base.truncate(base.len().min(16 - number.len() - 1));
                        format!("{base}_{number}")
                    };

                    if !dir_names.contains_key(&dedup_name) {
                        warn!("Renaming duplicate directory {name:?} to {dedup_name:?}");
                        dir.name = prepare_name(&dedup_name);
                        data[offset..offset + DIR_ENTRY_SIZE as usize]
                            .copy_from_slice(&pack_dir_entry(&dir));
                        block_dirty = true;

                        dir_names.insert(dedup_name, (0, true));
                        break;
                    }
                }
            }

            if block_dirty {
                storage.write(block_addr, &data)?;
            }
        }
    }

    //the hint names the first unused block after the last used one
    for index in (0..map.len()).rev() {
        if map[index] {
            let expected = (index as u64 + 1 + header.file_list_blk_addr as u64) as u16;
            if next_file_list_blk != expected {
                next_file_list_blk = expected;
                fsck_status |= status::BAD_NEXT_DIR_CONTENT_BLK;
                storage.write(BLK_SIZE, &next_file_list_blk.to_le_bytes())?;
            }

            break;
        }
    }
    /*-----------------------End of root dir checks-----------------------*/

    /*-------------------------Internal FAT checks------------------------*/
    let fat_len = header.fat_blk_cnt as u64 * (BLK_SIZE / 2);
    let mut raw_fat = vec![0; (fat_len * 2) as usize];
    storage.read(header.fat_blk_addr as u64 * BLK_SIZE, &mut raw_fat)?;
    let mut fat: Vec<u16> = raw_fat
        .chunks_exact(2)
        .map(|cell| u16::from_le_bytes([cell[0], cell[1]]))
        .collect();

    let mut fat_dirty = false;

    if fat[0] != FAT_ATTRS.reserved {
        fat[0] = FAT_ATTRS.reserved;
        fsck_status |= status::UNMARKED_RESERVED_CLUSTERS;
        fat_dirty = true;
    }

    for index in (header.cluster_cnt as u64 + FAT_ATTRS.data_min as u64)..fat_len {
        if fat[index as usize] != FAT_ATTRS.reserved {
            fat[index as usize] = FAT_ATTRS.reserved;
            fsck_status |= status::UNMARKED_RESERVED_CLUSTERS;
            fat_dirty = true;
        }
    }

    if fat_dirty {
        let mut raw_fat = Vec::with_capacity((fat_len * 2) as usize);
        for cell in &fat {
            raw_fat.extend_from_slice(&cell.to_le_bytes());
        }
        storage.write(header.fat_blk_addr as u64 * BLK_SIZE, &raw_fat)?;
    }
    /*---------------------End of internal FAT checks---------------------*/

    /*--------------------------File list checks--------------------------*/
    for block_index in 0..header.dir_list_blk_cnt {
        let block_addr = (header.dir_list_blk_addr as u64 + block_index as u64) * BLK_SIZE;
        let mut data = [0; BLK_SIZE as usize];
        storage.read(block_addr, &mut data)?;

        for slot in 0..DIRS_PER_BLOCK {
            let offset = slot * DIR_ENTRY_SIZE as usize;
            if !is_valid_dir(data[offset + 0x11]) {
                continue;
            }

            let dir = parse_dir_entry(&data[offset..], false, block_addr + offset as u64)?;

            let mut bank_counts = [0u64; 256];
            let mut dupe = false;

            for content_index in 0..MAX_BLOCKS_PER_DIR {
                let content_block = dir.blocks[content_index];
                if (content_block as u64) < header.file_list_blk_addr as u64
                    || (content_block as u64) >= end_of_file_blks
                {
                    continue;
                }

                let content_addr = content_block as u64 * BLK_SIZE;
                let mut content = [0; BLK_SIZE as usize];
                storage.read(content_addr, &mut content)?;

                let mut content_dirty = false;
                for file_slot in 0..FILES_PER_BLOCK {
                    let file_offset = file_slot * FILE_ENTRY_SIZE as usize;
                    if !is_valid_file(content[file_offset + 0x1A]) {
                        continue;
                    }

                    let mut file = parse_file_entry(
                        &content[file_offset..],
                        false,
                        content_addr + file_offset as u64,
                    )?;

                    //map duplicate banks only, fix them in a second pass
                    if bank_counts[file.bank_num as usize] > 0 {
                        dupe = true;
                        fsck_status |= status::BAD_FILE;
                    }
                    bank_counts[file.bank_num as usize] += 1;

                    let mut entry_dirty = false;

                    //a start cluster whose successor is neither data nor
                    //a terminator is dangling
                    if file.start_cluster >= FAT_ATTRS.data_min
                        && file.start_cluster < header.cluster_cnt
                        && (file.start_cluster as u64) < fat_len
                        && (fat[file.start_cluster as usize] < FAT_ATTRS.data_min
                            || fat[file.start_cluster as usize] >= header.cluster_cnt)
                        && fat[file.start_cluster as usize] != FAT_ATTRS.end_of_chain
                    {
                        file.start_cluster = FAT_ATTRS.end_of_chain;
                        fsck_status |= status::BAD_FILE;
                        entry_dirty = true;
                    }

                    if file.cluster_cnt > header.cluster_cnt {
                        file.cluster_cnt = header.cluster_cnt;
                        fsck_status |= status::BAD_FILE;
                        entry_dirty = true;
                    }

                    if file.block_cnt > blocks_per_cluster {
                        file.block_cnt = blocks_per_cluster;
                        fsck_status |= status::BAD_FILE;
                        entry_dirty = true;
                    }

                    if file.byte_cnt > BLK_SIZE as u16 {
                        file.byte_cnt = BLK_SIZE as u16;
                        fsck_status |= status::BAD_FILE;
                        entry_dirty = true;
                    }

                    if entry_dirty {
                        content[file_offset..file_offset + FILE_ENTRY_SIZE as usize]
                            .copy_from_slice(&pack_file_entry(&file));
                        content_dirty = true;
                    }
                }

                if content_dirty {
                    storage.write(content_addr, &content)?;
                }
            }

            if dupe {
                let mut seen = [false; 256];

                for content_index in 0..MAX_BLOCKS_PER_DIR {
                    let content_block = dir.blocks[content_index];
                    if (content_block as u64) < header.file_list_blk_addr as u64
                        || (content_block as u64) >= end_of_file_blks
                    {
                        continue;
                    }

                    let content_addr = content_block as u64 * BLK_SIZE;
                    let mut content = [0; BLK_SIZE as usize];
                    storage.read(content_addr, &mut content)?;

                    let mut content_dirty = false;
                    for file_slot in 0..FILES_PER_BLOCK {
                        let file_offset = file_slot * FILE_ENTRY_SIZE as usize;
                        if !is_valid_file(content[file_offset + 0x1A]) {
                            continue;
                        }

                        let mut file = parse_file_entry(
                            &content[file_offset..],
                            false,
                            content_addr + file_offset as u64,
                        )?;

                        if seen[file.bank_num as usize] {
                            for bank_num in 0..0xFF {
                                if bank_counts[bank_num] > 0 {
                                    continue;
                                }

                                file.bank_num = bank_num as u8;
                                bank_counts[bank_num] = 1;
                                break;
                            }

                            content[file_offset..file_offset + FILE_ENTRY_SIZE as usize]
                                .copy_from_slice(&pack_file_entry(&file));
                            content_dirty = true;
                        }

                        seen[file.bank_num as usize] = true;
                    }

                    if content_dirty {
                        storage.write(content_addr, &content)?;
                    }
                }
            }
        }
    }
    /*-----------------------End of file list checks----------------------*/

    Ok(fsck_status)
}
