//! Writes the EMU3 fixture volume (three root directories, two zero-length
//! files) into a scratch directory under the system temp dir.

use std::path::PathBuf;

use retrovfs_fs_emu3::{
    dir_type, file_type, pack_dir_entry, pack_file_entry, pack_header, prepare_name, DirEntry,
    FileEntry, Header, FAT_ATTRS, MAGIC, MAX_BLOCKS_PER_DIR,
};

pub const BLK_SIZE: u64 = 512;
pub const CLUSTER_SIZE: u32 = 1 << 15;
pub const CLUSTER_CNT: u16 = 16;

const DIR_LIST_BLK: u64 = 2;
const FILE_LIST_BLK: u64 = 3;
const FILE_LIST_CNT: u32 = 4;
const FAT_BLK: u64 = 7;
const DATA_BLK: u64 = 8;

const BLOCK_CNT: u32 =
    2 + 1 + FILE_LIST_CNT + 1 + CLUSTER_CNT as u32 * (CLUSTER_SIZE / BLK_SIZE as u32);

fn put_dir(image: &mut [u8], slot: usize, name: &str, content_block: u16) {
    let mut blocks = [0xFFFF; MAX_BLOCKS_PER_DIR];
    blocks[0] = content_block;

    let dir = DirEntry {
        name: prepare_name(name),
        dtype: dir_type::NORMAL,
        blocks,
        addr: 0,
    };

    let offset = (DIR_LIST_BLK * BLK_SIZE) as usize + slot * 32;
    image[offset..offset + 32].copy_from_slice(&pack_dir_entry(&dir));
}

fn put_empty_file(image: &mut [u8], content_block: u64, slot: usize, name: &str, bank_num: u8) {
    let file = FileEntry {
        name: prepare_name(name),
        bank_num,
        start_cluster: FAT_ATTRS.end_of_chain,
        cluster_cnt: 0,
        block_cnt: 0,
        byte_cnt: 0,
        ftype: file_type::STD,
        props: [0; 5],
        addr: 0,
    };

    let offset = (content_block * BLK_SIZE) as usize + slot * 32;
    image[offset..offset + 32].copy_from_slice(&pack_file_entry(&file));
}

fn set_fat(image: &mut [u8], index: usize, value: u16) {
    let offset = (FAT_BLK * BLK_SIZE) as usize + index * 2;
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn build_image() -> Vec<u8> {
    let mut image = vec![0; BLOCK_CNT as usize * BLK_SIZE as usize];

    let header = Header {
        block_cnt: BLOCK_CNT,
        dir_list_blk_addr: DIR_LIST_BLK as u32,
        dir_list_blk_cnt: 1,
        file_list_blk_addr: FILE_LIST_BLK as u32,
        file_list_blk_cnt: FILE_LIST_CNT,
        fat_blk_addr: FAT_BLK as u32,
        fat_blk_cnt: 1,
        data_sctn_blk_addr: DATA_BLK as u32,
        cluster_cnt: CLUSTER_CNT,
        cluster_shift: 0,
    };

    let block: &mut [u8; 512] = (&mut image[..512]).try_into().unwrap();
    block[..4].copy_from_slice(&MAGIC);
    pack_header(block, &header);

    image[BLK_SIZE as usize..BLK_SIZE as usize + 2].copy_from_slice(&6u16.to_le_bytes());

    put_dir(&mut image, 0, "Test dir 1", FILE_LIST_BLK as u16);
    put_dir(&mut image, 1, "Test dir 2", FILE_LIST_BLK as u16 + 1);
    put_dir(&mut image, 2, "Test/dir/3", FILE_LIST_BLK as u16 + 2);

    put_empty_file(&mut image, FILE_LIST_BLK + 1, 0, "Melopuerto pls p", 15);
    put_empty_file(&mut image, FILE_LIST_BLK + 1, 1, "lae dee em cee t", 16);

    set_fat(&mut image, 0, FAT_ATTRS.reserved);
    for index in CLUSTER_CNT as usize + 1..(BLK_SIZE as usize / 2) {
        set_fat(&mut image, index, FAT_ATTRS.reserved);
    }

    image
}

/// Fresh scratch directory holding the fixture image as `sampler.img`.
pub fn scratch(tag: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("retrovfs_vfs_{tag}_{}", std::process::id()));
    if dir.exists() {
        let _ = std::fs::remove_dir_all(&dir);
    }
    std::fs::create_dir_all(&dir).unwrap();

    let image_path = dir.join("sampler.img");
    std::fs::write(&image_path, build_image()).unwrap();

    (dir, image_path)
}
