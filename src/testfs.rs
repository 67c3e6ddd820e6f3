//! In-memory FAT32 volume formatter for the unit tests.
//!
//! Builds minimal but well-formed FAT32 images on a [`RamDisk`]: a boot
//! sector, two FAT copies with the root directory chain, and a zeroed
//! data region. The geometry matches the scenarios the tests exercise:
//! 512-byte sectors, 4 KiB clusters.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::storage::RamDisk;
use crate::vfat::{vfs_new_fat32, VfatFileSystem};
use crate::SECTOR_SIZE;

/// 32 MiB volume.
pub const TEST_TOTAL_SECTORS: usize = 65536;

const SECTORS_PER_CLUSTER: usize = 8; // 4 KiB clusters
const RESERVED_SECTORS: usize = 32;
const NUM_FATS: usize = 2;
const FAT_ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// End-of-chain value written by the formatter.
const EOC: u32 = 0x0FFF_FFFF;

/// Sectors in each FAT copy for a volume of `total_sectors`.
fn sectors_per_fat(total_sectors: usize) -> usize {
    let max_clusters = total_sectors / SECTORS_PER_CLUSTER + 2;
    max_clusters.div_ceil(FAT_ENTRIES_PER_SECTOR)
}

fn first_data_sector(total_sectors: usize) -> usize {
    RESERVED_SECTORS + NUM_FATS * sectors_per_fat(total_sectors)
}

/// Byte offset of FAT cluster `cluster_id` within the image.
fn cluster_offset(total_sectors: usize, cluster_id: u32) -> usize {
    (first_data_sector(total_sectors) + (cluster_id as usize - 2) * SECTORS_PER_CLUSTER)
        * SECTOR_SIZE
}

/// Write `value` into entry `cluster_id` of every FAT copy.
fn set_fat_entry(image: &mut [u8], total_sectors: usize, cluster_id: u32, value: u32) {
    let spf = sectors_per_fat(total_sectors);
    for copy in 0..NUM_FATS {
        let base = (RESERVED_SECTORS + copy * spf) * SECTOR_SIZE + cluster_id as usize * 4;
        image[base..base + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// A freshly formatted FAT32 image with an empty root directory.
pub fn format_image(total_sectors: usize) -> Vec<u8> {
    let mut image = vec![0u8; total_sectors * SECTOR_SIZE];

    // Boot sector / BPB
    image[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    image[13] = SECTORS_PER_CLUSTER as u8;
    image[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    image[16] = NUM_FATS as u8;
    // root_entry_count (17), total_sectors_16 (19), fat_size_16 (22) stay 0
    image[21] = 0xF8; // media descriptor
    image[32..36].copy_from_slice(&(total_sectors as u32).to_le_bytes());
    image[36..40].copy_from_slice(&(sectors_per_fat(total_sectors) as u32).to_le_bytes());
    image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root directory cluster
    image[510] = 0x55;
    image[511] = 0xAA;

    // Reserved FAT entries and the root directory's one-cluster chain.
    set_fat_entry(&mut image, total_sectors, 0, 0x0FFF_FFF8);
    set_fat_entry(&mut image, total_sectors, 1, EOC);
    set_fat_entry(&mut image, total_sectors, 2, EOC);

    image
}

/// Add `/HELLO.TXT` containing `"hi\n"` to a blank image, as a short
/// 8.3 entry in the first root directory slot.
pub fn install_hello(image: &mut [u8], total_sectors: usize) {
    let root = cluster_offset(total_sectors, 2);
    let entry = &mut image[root..root + 32];
    entry[0..11].copy_from_slice(b"HELLO   TXT");
    entry[11] = 0x20; // ARCHIVE
    entry[20..22].copy_from_slice(&0u16.to_le_bytes());
    entry[26..28].copy_from_slice(&3u16.to_le_bytes());
    entry[28..32].copy_from_slice(&3u32.to_le_bytes());

    set_fat_entry(image, total_sectors, 3, EOC);
    let data = cluster_offset(total_sectors, 3);
    image[data..data + 3].copy_from_slice(b"hi\n");
}

/// Mount a blank volume with writeback enabled.
pub fn mount_blank() -> (Arc<VfatFileSystem>, Arc<RamDisk>) {
    mount_blank_sized(TEST_TOTAL_SECTORS)
}

/// Mount a blank volume of `total_sectors` sectors with writeback
/// enabled. Small volumes are handy for exhaustion tests.
pub fn mount_blank_sized(total_sectors: usize) -> (Arc<VfatFileSystem>, Arc<RamDisk>) {
    let disk = Arc::new(RamDisk::from_image(1, format_image(total_sectors)));
    let fs = vfs_new_fat32(disk.clone()).expect("formatted image must mount");
    fs.enable_writeback();
    (fs, disk)
}

/// Mount a volume pre-seeded with `/HELLO.TXT`.
pub fn mount_hello() -> (Arc<VfatFileSystem>, Arc<RamDisk>) {
    let mut image = format_image(TEST_TOTAL_SECTORS);
    install_hello(&mut image, TEST_TOTAL_SECTORS);
    let disk = Arc::new(RamDisk::from_image(1, image));
    let fs = vfs_new_fat32(disk.clone()).expect("formatted image must mount");
    fs.enable_writeback();
    (fs, disk)
}

/// Flush and drop `fs`, then mount the same disk again. The caller must
/// have dropped every vnode handle first so the old cache tears down.
pub fn remount(fs: Arc<VfatFileSystem>, disk: &Arc<RamDisk>) -> Arc<VfatFileSystem> {
    fs.sync().expect("flush must succeed on a RAM disk");
    drop(fs);
    let fs = vfs_new_fat32(disk.clone()).expect("remount must succeed");
    fs.enable_writeback();
    fs
}
