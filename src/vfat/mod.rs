//! FAT32 filesystem implementation
//!
//! On-disk format per Microsoft's FAT32 specification: a boot sector with
//! BIOS Parameter Block at LBA 0, one or more FAT copies (only copy #0 is
//! used here), then a data area of clusters addressed from 2. Directory
//! entries are 32 bytes; long filenames are chains of 0x0F-attribute
//! entries preceding their 8.3 primary entry.

pub mod boot;
pub mod dirent;
pub mod fat;
pub mod fs;
pub mod vnode;

pub use boot::Fat32Header;
pub use fat::{AllocTable, ChainNext};
pub use fs::{vfs_enable_fat32_writeback, vfs_new_fat32, VfatFileSystem};
pub use vnode::VfatVnode;
