//! File allocation table
//!
//! The FAT is an array of 32-bit entries, one per cluster, reached through
//! the cluster cache at the FAT region of the disk. The low 28 bits of an
//! entry encode the successor of a cluster in its chain, with sentinels:
//! 0 = free, 0x0FFFFFF7 = bad, anything above = end of chain. The top four
//! bits are reserved and preserved on every store.
//!
//! ## Locking
//!
//! A single allocation lock serializes the free-search-and-claim path so
//! two threads cannot requisition the same entry. Link edits need no
//! global lock: only the owning vnode, under its resize write lock,
//! touches a given chain's interior entries, and each entry is a whole
//! aligned word updated under its backing cluster's write lock.

use alloc::sync::Arc;

use spin::Mutex;

use crate::cache::ClusterCache;
use crate::vfs::FsError;
use crate::SECTOR_SIZE;

/// Low 28 bits of a FAT entry hold the successor cluster id.
const ENTRY_MASK: u32 = 0x0FFF_FFFF;
/// Reserved top nibble, preserved across writes.
const RESERVED_MASK: u32 = 0xF000_0000;
/// A free entry.
const ENTRY_FREE: u32 = 0x0000_0000;
/// A bad cluster; never part of a live chain.
const ENTRY_BAD: u32 = 0x0FFF_FFF7;
/// End-of-chain marker written by this implementation.
const ENTRY_FINAL: u32 = 0x0FFF_FFFF;

/// Successor of a cluster in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainNext {
    /// The chain continues at this cluster id.
    Next(u32),
    /// The queried cluster is the last in its chain.
    End,
}

/// Read/allocate/free/link operations on the FAT, backed by the cluster
/// cache. Cluster ids are FAT ids: valid data clusters are
/// `2..num_data_clusters + 2`.
pub struct AllocTable {
    cache: Arc<ClusterCache>,
    /// Byte offset on disk of FAT copy #0.
    table_base: u64,
    /// One past the highest valid cluster id.
    limit: u32,
    /// Serializes find-free + claim.
    allocation_lock: Mutex<()>,
}

impl AllocTable {
    pub fn new(
        cache: Arc<ClusterCache>,
        first_fat_sector: u64,
        sectors_per_fat: u32,
        num_data_clusters: u32,
    ) -> Self {
        let entries = sectors_per_fat as u64 * (SECTOR_SIZE as u64 / 4);
        let limit = (num_data_clusters as u64 + 2).min(entries) as u32;
        Self {
            cache,
            table_base: first_fat_sector * SECTOR_SIZE as u64,
            limit,
            allocation_lock: Mutex::new(()),
        }
    }

    fn check_cluster_id(&self, cluster_id: u32) {
        assert!(
            (2..self.limit).contains(&cluster_id),
            "cluster id {} is not in the range [2, {})",
            cluster_id,
            self.limit
        );
    }

    /// Read the raw 32-bit entry for `cluster_id`.
    fn read_entry(&self, cluster_id: u32) -> Result<u32, FsError> {
        let (cluster, within) = self
            .cache
            .get_cluster_for_disk_byte_offset(self.table_base + cluster_id as u64 * 4)?;
        Ok(cluster.with(|buf| u32::from_le_bytes(buf[within..within + 4].try_into().unwrap())))
    }

    /// Read-modify-write the entry for `cluster_id`, preserving the
    /// reserved top nibble, and mark the backing cluster dirty.
    fn update_entry(
        &self,
        cluster_id: u32,
        f: impl FnOnce(u32) -> Result<u32, FsError>,
    ) -> Result<(), FsError> {
        let (cluster, within) = self
            .cache
            .get_cluster_for_disk_byte_offset(self.table_base + cluster_id as u64 * 4)?;
        cluster.with_mut(|buf| {
            let slot = &mut buf[within..within + 4];
            let old = u32::from_le_bytes((&slot[..]).try_into().unwrap());
            let new = (old & RESERVED_MASK) | (f(old & ENTRY_MASK)? & ENTRY_MASK);
            slot.copy_from_slice(&new.to_le_bytes());
            Ok(())
        })?;
        cluster.mark_dirty();
        Ok(())
    }

    /// Successor of `cluster_id` in its chain.
    ///
    /// Panics if the entry is free or bad: neither may appear while
    /// walking a live chain, and hitting one means the volume state or
    /// this implementation is corrupt.
    pub fn get_next(&self, cluster_id: u32) -> Result<ChainNext, FsError> {
        self.check_cluster_id(cluster_id);
        let entry = self.read_entry(cluster_id)? & ENTRY_MASK;
        match entry {
            ENTRY_FREE => panic!("free cluster {} encountered while walking a chain", cluster_id),
            ENTRY_BAD => panic!("bad cluster {} encountered while walking a chain", cluster_id),
            next if next > ENTRY_BAD => Ok(ChainNext::End),
            next => {
                self.check_cluster_id(next);
                Ok(ChainNext::Next(next))
            }
        }
    }

    /// Link `to` after `from`. `from` must currently be the end of its
    /// chain; `to` becomes reachable through it.
    pub fn set_next(&self, from: u32, to: u32) -> Result<(), FsError> {
        self.check_cluster_id(from);
        self.check_cluster_id(to);
        self.update_entry(from, |old| {
            match old {
                ENTRY_BAD => panic!("bad cluster {} encountered while relinking a chain", from),
                ENTRY_FREE => panic!("set_next on free cluster {}", from),
                old if old < ENTRY_BAD => {
                    panic!("set_next on cluster {} that already has a successor", from)
                }
                _ => {}
            }
            Ok(to)
        })
    }

    /// Write the end-of-chain marker for `cluster_id`, making it the tail
    /// of its chain.
    pub fn mark_final(&self, cluster_id: u32) -> Result<(), FsError> {
        self.check_cluster_id(cluster_id);
        self.update_entry(cluster_id, |old| {
            if old == ENTRY_BAD {
                panic!("bad cluster {} encountered while finalizing a chain", cluster_id);
            }
            Ok(ENTRY_FINAL)
        })
    }

    /// Mark `cluster_id` free. Only called once the corresponding data
    /// cluster has been released from the cache.
    pub fn mark_free(&self, cluster_id: u32) -> Result<(), FsError> {
        self.check_cluster_id(cluster_id);
        self.update_entry(cluster_id, |old| {
            if old == ENTRY_BAD {
                panic!("bad cluster {} encountered while freeing", cluster_id);
            }
            Ok(ENTRY_FREE)
        })
    }

    /// First cluster id whose entry is free, scanning cluster-by-cluster
    /// through the cache so repeated scans stay cheap.
    pub fn find_first_free(&self) -> Result<Option<u32>, FsError> {
        let mut id = 2u32;
        while id < self.limit {
            let (cluster, within) = self
                .cache
                .get_cluster_for_disk_byte_offset(self.table_base + id as u64 * 4)?;
            let window_entries = (self.cache.meta.cluster_size - within) / 4;
            let span = (window_entries as u32).min(self.limit - id);
            let found = cluster.with(|buf| {
                for j in 0..span as usize {
                    let off = within + j * 4;
                    let entry =
                        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) & ENTRY_MASK;
                    if entry == ENTRY_FREE {
                        return Some(id + j as u32);
                    }
                }
                None
            });
            if found.is_some() {
                return Ok(found);
            }
            id += span;
        }
        Ok(None)
    }

    /// Claim a free cluster under the allocation lock. The claimed entry
    /// is written as end-of-chain, so the result is already a valid
    /// one-cluster chain. Returns `None` when the volume is full.
    pub fn requisition_free(&self) -> Result<Option<u32>, FsError> {
        let _guard = self.allocation_lock.lock();
        let cluster_id = match self.find_first_free()? {
            Some(id) => id,
            None => return Ok(None),
        };
        self.update_entry(cluster_id, |old| {
            if old != ENTRY_FREE {
                panic!(
                    "cluster {} changed from free while holding the allocation lock",
                    cluster_id
                );
            }
            Ok(ENTRY_FINAL)
        })?;
        Ok(Some(cluster_id))
    }

    /// Number of free entries in the table.
    pub fn count_free(&self) -> Result<u32, FsError> {
        let mut count = 0;
        for id in 2..self.limit {
            if self.read_entry(id)? & ENTRY_MASK == ENTRY_FREE {
                count += 1;
            }
        }
        Ok(count)
    }
}
