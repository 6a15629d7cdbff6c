mod common;

use std::sync::Arc;

use retrovfs_ds::MemStorage;
use retrovfs_err::{Error, VfsError};
use retrovfs_fs::{FileSystem, FileType};
use retrovfs_fs_emu3::FileSystemServer;

use common::{build_image, CLUSTER_CNT, CLUSTER_SIZE};

fn mount() -> FileSystemServer<MemStorage> {
    FileSystemServer::new(MemStorage::new(build_image())).unwrap()
}

#[test]
fn mount_rejects_garbage() {
    assert_eq!(
        FileSystemServer::new(MemStorage::with_len(4096)).err(),
        Some(Error::Vfs(VfsError::WrongFs))
    );

    assert_eq!(
        FileSystemServer::new(MemStorage::new(Vec::new())).err(),
        Some(Error::Vfs(VfsError::DiskTooSmall))
    );

    // a flipped byte breaks the superblock checksum
    let mut image = build_image();
    image[20] ^= 0xFF;
    assert_eq!(
        FileSystemServer::new(MemStorage::new(image)).err(),
        Some(Error::Vfs(VfsError::InvalidState))
    );
}

#[test]
fn lists_root_in_table_order() {
    let fs = mount();

    let dentries = fs.list("/", false).unwrap();
    assert_eq!(dentries.len(), 3);
    assert_eq!(dentries[0].fname, "Test dir 1");
    assert_eq!(dentries[0].fsize, 512);
    assert_eq!(dentries[0].ftype, FileType::Dir);
    assert_eq!(dentries[1].fname, "Test dir 2");
    assert_eq!(dentries[2].fname, "Test\\dir\\3");

    let root = fs.list("/", true).unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].fname, "/");
    assert_eq!(root[0].fsize, 512);
    assert_eq!(root[0].ftype, FileType::Dir);
}

#[test]
fn lists_files_by_bank_and_name() {
    let fs = mount();

    let files = fs.list("/Test dir 2", false).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].fname, "15-Melopuerto pls p");
    assert_eq!(files[1].fname, "16-lae dee em cee t");
    assert_eq!(files[1].ftype, FileType::File);

    // bank number alone
    let files = fs.list("/Test dir 2/16-", false).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].fname, "16-lae dee em cee t");

    // name alone
    let files = fs.list("/Test dir 2/lae dee em cee t", false).unwrap();
    assert_eq!(files[0].fname, "16-lae dee em cee t");

    // the bank number wins over a mismatched name
    let files = fs.list("/Test dir 2/16-irrelevant", false).unwrap();
    assert_eq!(files[0].fname, "16-lae dee em cee t");

    // a prefix above 255 is not a bank number but part of the name
    assert_eq!(
        fs.list("/Test dir 2/256-lae dee em cee t", false),
        Err(VfsError::NotFound.into())
    );

    assert_eq!(fs.list("/nx dir", false), Err(VfsError::NotFound.into()));
    assert_eq!(
        fs.list("/Test dir 2/nx file", false),
        Err(VfsError::NotFound.into())
    );
    assert_eq!(
        fs.list("/Test dir 2/16-/deep", false),
        Err(VfsError::InvalidPath.into())
    );
}

#[test]
fn lists_remapped_slash_names() {
    let fs = mount();

    let dentry = fs.list("/Test\\dir\\3", true).unwrap();
    assert_eq!(dentry[0].fname, "Test\\dir\\3");
    assert_eq!(dentry[0].fsize, 512);

    let files = fs.list("/Test\\dir\\3", false).unwrap();
    assert!(files.is_empty());
}

#[test]
fn truncate_creates_and_resizes() {
    let fs = mount();
    let initial_free = fs.free_space();
    assert_eq!(initial_free, CLUSTER_CNT as u64 * CLUSTER_SIZE as u64);

    // one cluster exactly
    fs.ftruncate("/Test dir 1/Trunc_test_1", CLUSTER_SIZE as u64)
        .unwrap();
    assert_eq!(fs.free_space(), initial_free - CLUSTER_SIZE as u64);

    let files = fs.list("/Test dir 1", false).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].fname, "0-Trunc_test_1");
    assert_eq!(files[0].fsize, CLUSTER_SIZE as u64);

    // one block into the next cluster
    fs.ftruncate("/Test dir 1/Trunc_test_1", CLUSTER_SIZE as u64 + 512)
        .unwrap();
    assert_eq!(fs.free_space(), initial_free - 2 * CLUSTER_SIZE as u64);
    let files = fs.list("/Test dir 1/0-", false).unwrap();
    assert_eq!(files[0].fsize, CLUSTER_SIZE as u64 + 512);

    // shrinking returns the clusters
    fs.ftruncate("/Test dir 1/Trunc_test_1", 0).unwrap();
    assert_eq!(fs.free_space(), initial_free);
    let files = fs.list("/Test dir 1/Trunc_test_1", false).unwrap();
    assert_eq!(files[0].fsize, 0);

    assert_eq!(
        fs.ftruncate(
            "/Test dir 1/Trunc_test_1",
            CLUSTER_CNT as u64 * CLUSTER_SIZE as u64 + 1
        ),
        Err(VfsError::FileTooLarge.into())
    );

    assert_eq!(
        fs.ftruncate("/Test dir 1", 10),
        Err(VfsError::InvalidPath.into())
    );
}

#[test]
fn open_file_table_refcounts() {
    let fs = mount();

    // one directory entry plus one file entry, opened twice
    let a = fs.fopen("/Test dir 2/15-Melopuerto pls p").unwrap();
    let b = fs.fopen("/Test dir 2/Melopuerto pls p").unwrap();
    assert_eq!(a, b);
    assert_eq!(fs.open_file_count(), 2);
    assert!(!fs.can_unmount());

    fs.fclose(&a).unwrap();
    assert_eq!(fs.open_file_count(), 2);

    fs.fclose(&b).unwrap();
    assert_eq!(fs.open_file_count(), 0);
    assert!(fs.can_unmount());
}

#[test]
fn open_files_resist_removal_and_rename() {
    let fs = mount();

    let handle = fs.fopen("/Test dir 2/15-Melopuerto pls p").unwrap();

    assert_eq!(
        fs.remove("/Test dir 2/15-"),
        Err(VfsError::AlreadyOpen.into())
    );
    assert_eq!(
        fs.remove("/Test dir 2"),
        Err(VfsError::AlreadyOpen.into())
    );
    assert_eq!(
        fs.rename("/Test dir 2/15-Melopuerto pls p", "/Test dir 2/15-other"),
        Err(VfsError::AlreadyOpen.into())
    );
    assert_eq!(
        fs.rename("/Test dir 2", "/Renamed"),
        Err(VfsError::AlreadyOpen.into())
    );

    fs.fclose(&handle).unwrap();
    fs.remove("/Test dir 2/15-").unwrap();
}

#[test]
fn write_then_read_round_trips() {
    let fs = mount();
    let initial_free = fs.free_space();

    let handle = fs.fopen("/Test dir 1/Data file").unwrap();

    // spans two clusters
    let payload: Vec<u8> = (0..40_000u32).map(|index| index as u8).collect();
    let mut pos = 0;
    fs.write(&handle, &mut pos, &payload).unwrap();
    assert_eq!(pos, 40_000);
    assert_eq!(fs.free_space(), initial_free - 2 * CLUSTER_SIZE as u64);

    let mut data = vec![0; 40_000];
    let mut pos = 0;
    fs.read(&handle, &mut pos, &mut data).unwrap();
    assert_eq!(data, payload);
    assert_eq!(pos, 40_000);

    let files = fs.list("/Test dir 1", false).unwrap();
    assert_eq!(files[0].fsize, 40_000);

    fs.fclose(&handle).unwrap();
}

#[test]
fn read_past_end_reports_eof() {
    let fs = mount();

    let handle = fs.fopen("/Test dir 1/Data file").unwrap();
    let mut pos = 0;
    fs.write(&handle, &mut pos, &[7; 1000]).unwrap();

    // read at the recorded size
    let mut data = [0; 8];
    let mut pos = 1000;
    assert_eq!(
        fs.read(&handle, &mut pos, &mut data),
        Err(VfsError::EndOfFile.into())
    );

    // a read crossing the end transfers the tail first
    let mut data = [0; 20];
    let mut pos = 990;
    assert_eq!(
        fs.read(&handle, &mut pos, &mut data),
        Err(VfsError::EndOfFile.into())
    );
    assert_eq!(pos, 1000);
    assert_eq!(data[..10], [7; 10]);

    fs.fclose(&handle).unwrap();
}

#[test]
fn zero_length_write_never_extends() {
    let fs = mount();
    let initial_free = fs.free_space();

    let handle = fs.fopen("/Test dir 1/Data file").unwrap();

    let mut pos = 5 * CLUSTER_SIZE as u64;
    fs.write(&handle, &mut pos, &[]).unwrap();
    assert_eq!(pos, 5 * CLUSTER_SIZE as u64);
    assert_eq!(fs.free_space(), initial_free);

    let files = fs.list("/Test dir 1/Data file", false).unwrap();
    assert_eq!(files[0].fsize, 0);

    fs.fclose(&handle).unwrap();
}

#[test]
fn sparse_write_grows_through_position() {
    let fs = mount();

    let handle = fs.fopen("/Test dir 1/Data file").unwrap();

    let mut pos = CLUSTER_SIZE as u64 + 100;
    fs.write(&handle, &mut pos, b"tail").unwrap();
    assert_eq!(pos, CLUSTER_SIZE as u64 + 104);

    let files = fs.list("/Test dir 1/Data file", false).unwrap();
    assert_eq!(files[0].fsize, CLUSTER_SIZE as u64 + 104);

    let mut data = [0; 4];
    let mut pos = CLUSTER_SIZE as u64 + 100;
    fs.read(&handle, &mut pos, &mut data).unwrap();
    assert_eq!(&data, b"tail");

    fs.fclose(&handle).unwrap();
}

#[test]
fn mkdir_grows_the_root_table() {
    let fs = mount();

    fs.mkdir("/New dir").unwrap();
    let dentries = fs.list("/", false).unwrap();
    assert_eq!(dentries.len(), 4);
    assert_eq!(dentries[3].fname, "New dir");
    // no content blocks yet
    assert_eq!(dentries[3].fsize, 0);

    assert_eq!(fs.mkdir("/New dir"), Err(VfsError::AlreadyExists.into()));
    assert_eq!(fs.mkdir("/a/b"), Err(VfsError::InvalidPath.into()));

    // the first file pulls a content block from the pool
    fs.ftruncate("/New dir/First", 100).unwrap();
    let dentries = fs.list("/New dir", true).unwrap();
    assert_eq!(dentries[0].fsize, 512);

    let files = fs.list("/New dir", false).unwrap();
    assert_eq!(files[0].fname, "0-First");
    assert_eq!(files[0].fsize, 100);
}

#[test]
fn rename_directory_in_place() {
    let fs = mount();

    fs.rename("/Test dir 1", "/Primary").unwrap();

    let dentries = fs.list("/", false).unwrap();
    assert_eq!(dentries[0].fname, "Primary");

    assert_eq!(
        fs.rename("/nx", "/whatever"),
        Err(VfsError::NotFound.into())
    );
    // a directory cannot move into another directory
    assert_eq!(
        fs.rename("/Primary", "/Test dir 2/sub"),
        Err(VfsError::UnsupportedOperation.into())
    );
    // renaming to root is a no-op
    fs.rename("/Primary", "/").unwrap();
    assert_eq!(fs.list("/", false).unwrap()[0].fname, "Primary");
}

#[test]
fn rename_replaces_empty_directory() {
    let fs = mount();

    // "Test dir 1" holds no files, so the rename clears it first
    fs.rename("/Test dir 2", "/Test dir 1").unwrap();

    let dentries = fs.list("/", false).unwrap();
    assert_eq!(dentries.len(), 2);
    assert_eq!(dentries[0].fname, "Test dir 1");

    // and its files came along
    let files = fs.list("/Test dir 1", false).unwrap();
    assert_eq!(files.len(), 2);
}

#[test]
fn rename_refuses_occupied_directory_name() {
    let fs = mount();
    fs.ftruncate("/Test dir 1/Keeper", 0).unwrap();

    assert_eq!(
        fs.rename("/Test dir 2", "/Test dir 1"),
        Err(VfsError::AlreadyExists.into())
    );
}

#[test]
fn rename_file_name_and_bank() {
    let fs = mount();

    // plain rename, bank unchanged
    fs.rename("/Test dir 2/15-Melopuerto pls p", "/Test dir 2/15-New name")
        .unwrap();
    let files = fs.list("/Test dir 2/15-", false).unwrap();
    assert_eq!(files[0].fname, "15-New name");

    // bank move to a free bank, name unchanged
    fs.rename("/Test dir 2/15-", "/Test dir 2/20-").unwrap();
    let files = fs.list("/Test dir 2/20-", false).unwrap();
    assert_eq!(files[0].fname, "20-New name");
    assert_eq!(
        fs.list("/Test dir 2/15-", false),
        Err(VfsError::NotFound.into())
    );

    // bank move onto an occupied bank evicts the occupant
    fs.rename("/Test dir 2/20-", "/Test dir 2/16-").unwrap();
    let files = fs.list("/Test dir 2", false).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].fname, "16-New name");
}

#[test]
fn move_file_between_directories() {
    let fs = mount();

    // destination name empty keeps the source name
    fs.rename("/Test dir 2/16-lae dee em cee t", "/Test dir 1")
        .unwrap();

    let files = fs.list("/Test dir 1", false).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].fname, "16-lae dee em cee t");

    let files = fs.list("/Test dir 2", false).unwrap();
    assert_eq!(files.len(), 1);

    // move with a rename on top
    fs.rename("/Test dir 2/15-Melopuerto pls p", "/Test dir 1/3-Moved")
        .unwrap();
    let files = fs.list("/Test dir 1/3-", false).unwrap();
    assert_eq!(files[0].fname, "3-Moved");
}

#[test]
fn remove_frees_clusters() {
    let fs = mount();
    let initial_free = fs.free_space();

    fs.ftruncate("/Test dir 1/Doomed", 2 * CLUSTER_SIZE as u64)
        .unwrap();
    assert_eq!(fs.free_space(), initial_free - 2 * CLUSTER_SIZE as u64);

    fs.remove("/Test dir 1/Doomed").unwrap();
    assert_eq!(fs.free_space(), initial_free);
    assert_eq!(
        fs.list("/Test dir 1/Doomed", false),
        Err(VfsError::NotFound.into())
    );
}

#[test]
fn remove_directory_recursively() {
    let fs = mount();

    fs.ftruncate("/Test dir 2/15-Melopuerto pls p", CLUSTER_SIZE as u64)
        .unwrap();

    fs.remove("/Test dir 2").unwrap();
    assert_eq!(fs.list("/Test dir 2", false), Err(VfsError::NotFound.into()));
    assert_eq!(fs.list("/", false).unwrap().len(), 2);
    assert_eq!(fs.free_space(), CLUSTER_CNT as u64 * CLUSTER_SIZE as u64);

    // clearing everything leaves an empty root
    fs.remove("/").unwrap();
    assert!(fs.list("/", false).unwrap().is_empty());
}

#[test]
fn concurrent_writers_share_the_volume() {
    let fs = Arc::new(mount());
    let initial_free = fs.free_space();

    let mut workers = Vec::new();
    for index in 0..2 {
        let fs = fs.clone();
        workers.push(std::thread::spawn(move || {
            let path = format!("/Test dir 1/Worker {index}");
            let handle = fs.fopen(&path).unwrap();

            let payload = vec![index as u8 + 1; CLUSTER_SIZE as usize + 123];
            let mut pos = 0;
            fs.write(&handle, &mut pos, &payload).unwrap();

            let mut data = vec![0; payload.len()];
            let mut pos = 0;
            fs.read(&handle, &mut pos, &mut data).unwrap();
            assert_eq!(data, payload);

            fs.fclose(&handle).unwrap();
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fs.free_space(), initial_free - 4 * CLUSTER_SIZE as u64);
    assert_eq!(fs.list("/Test dir 1", false).unwrap().len(), 2);
}
