//! FAT32 Virtual Filesystem Layer
//!
//! This crate is the FAT32 filesystem subsystem of a research kernel,
//! packaged as a `no_std + alloc` library so it can also be built and
//! tested on a host.
//!
//! ## Architecture
//!
//! ```text
//! VFS shell (resolve, create, remove)         vfs
//!         │
//! FAT32 vnodes (files & directories)          vfat::vnode
//!         │                 │
//! allocation table          │                 vfat::fat
//!         │                 │
//! cluster cache (write-back, LRU)             cache
//!         │
//! disk (sector-granular, synchronous)         storage
//! ```
//!
//! A mounted volume is a [`vfat::VfatFileSystem`] built over any
//! [`storage::Disk`]. All file and FAT I/O funnels through one bounded
//! [`cache::ClusterCache`]; dirty clusters are written back when their
//! last reference drops, once [`vfat::VfatFileSystem::enable_writeback`]
//! has switched the volume out of read-only mode.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cache;
pub mod storage;
pub mod vfat;
pub mod vfs;

#[cfg(test)]
pub(crate) mod testfs;

// Re-exports for convenience
pub use cache::{Cluster, ClusterCache, PageInfo};
pub use storage::{Disk, RamDisk};
pub use vfat::{vfs_enable_fat32_writeback, vfs_new_fat32, VfatFileSystem, VfatVnode};
pub use vfs::{FileSystem, FsError, Stat, Vnode, VnodeKind};

/// Sector size in bytes. All disk transfers are multiples of this.
pub const SECTOR_SIZE: usize = 512;

/// System page size. Cluster buffers are aligned to and sized in whole
/// pages; mounting fails for volumes whose cluster size is not a
/// multiple of this.
pub const PAGE_SIZE: usize = 4096;
