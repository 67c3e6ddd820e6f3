//! Cluster cache
//!
//! A bounded, write-back cache of whole on-disk clusters, shared by every
//! file on the volume and by the file allocation table itself.
//!
//! Clusters are identified by a *relative cluster index*: index 0 is the
//! first data cluster (FAT cluster id 2). The allocation table lives below
//! the data region and reaches its sectors through
//! [`ClusterCache::get_cluster_for_disk_byte_offset`], which maps onto
//! negative indices; the cache treats both uniformly.
//!
//! ## Lifecycle
//!
//! A cache entry is created lazily on first access and handed out as an
//! `Arc<Cluster>`. The index holds the owning reference; an entry whose
//! strong count is 1 is unreferenced and eligible for eviction. Dropping
//! the last reference to a dirty cluster writes it back (when writeback is
//! enabled) and then, if the cluster was scheduled for release, marks its
//! FAT entry free. This ordering guarantees a cluster is never marked free
//! while dirty bytes are still pending.
//!
//! ## Locking
//!
//! The index is guarded by a single lock. Evicted entries are dropped
//! *after* that lock is released: a drop may reenter the cache (the
//! deferred FAT free reads the table through it).

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

use crate::storage::Disk;
use crate::vfat::fat::AllocTable;
use crate::vfs::FsError;
use crate::PAGE_SIZE;

/// How many eviction passes `get_cluster` makes over a full cache whose
/// entries are all referenced before giving up with `NoSpace`.
pub const EVICT_RETRY_LIMIT: usize = 64;

/// Immutable per-volume cache parameters, shared by the cache and every
/// cluster it hands out.
pub struct CacheMeta {
    disk: Arc<dyn Disk>,
    /// Cluster size in bytes; a nonzero multiple of [`PAGE_SIZE`].
    pub cluster_size: usize,
    /// Byte offset on disk of relative cluster 0 (FAT cluster id 2).
    data_base: u64,
    /// Write dirty clusters back on drop. Off until the volume is
    /// switched out of read-only mode.
    writeback: AtomicBool,
}

impl CacheMeta {
    pub fn writeback_enabled(&self) -> bool {
        self.writeback.load(Ordering::Acquire)
    }

    pub fn devno(&self) -> u32 {
        self.disk.devno()
    }
}

/// Page-aligned heap buffer for one cluster.
struct ClusterBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl ClusterBuf {
    fn new_zeroed(cluster_size: usize) -> Self {
        let layout = Layout::from_size_align(cluster_size, PAGE_SIZE)
            .expect("cluster size must be a nonzero multiple of the page size");
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("out of memory allocating a cluster buffer");
        Self { ptr, layout }
    }
}

impl Deref for ClusterBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for ClusterBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for ClusterBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for ClusterBuf {}
unsafe impl Sync for ClusterBuf {}

/// One cached cluster.
///
/// Byte access goes through a reader/writer lock, so concurrent file
/// handles interleave at cluster granularity. The dirty bit is tracked
/// separately so read paths never take the write side.
pub struct Cluster {
    /// Relative cluster index (may be negative for FAT-region clusters).
    index: i64,
    meta: Arc<CacheMeta>,
    data: RwLock<ClusterBuf>,
    dirty: AtomicBool,
    /// When set, the last drop marks this FAT cluster id free after any
    /// writeback completes.
    free_on_drop: Mutex<Option<(u32, Arc<AllocTable>)>>,
}

impl core::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cluster").field("index", &self.index).finish()
    }
}

impl Cluster {
    /// Read access to the cluster's bytes.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// Write access to the cluster's bytes. The caller is responsible for
    /// calling [`Cluster::mark_dirty`] after modifying them.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Schedule this cluster's FAT entry to be marked free once the last
    /// reference drops (after writeback, if any).
    pub fn mark_free_on_delete(&self, cluster_id: u32, fat: Arc<AllocTable>) {
        *self.free_on_drop.lock() = Some((cluster_id, fat));
    }

    /// Byte offset on disk where this cluster starts. Negative-index
    /// clusters below the data region may start before the beginning of
    /// the disk; [`Cluster::disk_range`] clamps to the valid part.
    fn disk_start(&self) -> i64 {
        self.meta.data_base as i64 + self.index * self.meta.cluster_size as i64
    }

    /// The in-range `(disk_offset, buf_offset, len)` portion of this
    /// cluster. The FAT region below the data area is not in general
    /// cluster-aligned, so the window covering its first bytes may hang
    /// off the front of the disk.
    fn disk_range(&self) -> (u64, usize, usize) {
        let start = self.disk_start();
        let size = self.meta.cluster_size as i64;
        let lo = start.max(0);
        let hi = (start + size).min(self.meta.disk.capacity() as i64);
        ((lo as u64), (lo - start) as usize, (hi - lo).max(0) as usize)
    }

    /// Fill the buffer from disk.
    fn fill(&self) -> Result<(), FsError> {
        let (disk_off, buf_off, len) = self.disk_range();
        if len == 0 {
            return Ok(());
        }
        let mut buf = self.data.write();
        self.meta
            .disk
            .read(&mut buf[buf_off..buf_off + len], disk_off)
            .map_err(|_| FsError::IoError)
    }

    /// Write the buffer to disk and clear the dirty bit. On failure the
    /// dirty bit stays set so a later drop retries.
    fn flush(&self) -> Result<(), FsError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let (disk_off, buf_off, len) = self.disk_range();
        let buf = self.data.read();
        match self.meta.disk.write(&buf[buf_off..buf_off + len], disk_off) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                Ok(())
            }
            Err(_) => {
                log::error!(
                    "cluster {}: writeback failed, leaving dirty for retry",
                    self.index
                );
                Err(FsError::IoError)
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.meta.writeback_enabled() {
            let _ = self.flush();
        }
        // The free is performed even if the flush failed or writeback is
        // off: the on-disk bytes are unreachable once the entry is freed.
        if let Some((cluster_id, fat)) = self.free_on_drop.get_mut().take() {
            if let Err(err) = fat.mark_free(cluster_id) {
                log::error!("deferred free of cluster {} failed: {:?}", cluster_id, err);
            }
        }
    }
}

/// Mapping of one file page for the page-table layer: the pinned cluster
/// holding it and the page's position inside that cluster.
#[derive(Debug)]
pub struct PageInfo {
    pub cluster: Arc<Cluster>,
    pub page_in_cluster: usize,
}

impl PageInfo {
    /// Read access to the page's bytes.
    pub fn with_page<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let off = self.page_in_cluster * PAGE_SIZE;
        self.cluster.with(|buf| f(&buf[off..off + PAGE_SIZE]))
    }
}

struct CacheIndex {
    map: BTreeMap<i64, Arc<Cluster>>,
    /// Cluster indices, least recently used at the front.
    recency: VecDeque<i64>,
}

impl CacheIndex {
    /// Move `index` to the most-recently-used position.
    fn touch(&mut self, index: i64) {
        if let Some(pos) = self.recency.iter().position(|&i| i == index) {
            self.recency.remove(pos);
        }
        self.recency.push_back(index);
    }

    /// Evict the least recently used unreferenced entry, returning it so
    /// the caller can drop it outside the index lock.
    fn evict_one(&mut self) -> Option<Arc<Cluster>> {
        let pos = self
            .recency
            .iter()
            .position(|i| self.map.get(i).is_some_and(|c| Arc::strong_count(c) == 1))?;
        let index = self.recency.remove(pos).unwrap();
        self.map.remove(&index)
    }
}

/// The per-volume cluster cache.
pub struct ClusterCache {
    pub meta: Arc<CacheMeta>,
    max_clusters: usize,
    index: Mutex<CacheIndex>,
}

impl ClusterCache {
    /// Create a cache over `disk`, holding at most `max_clusters` entries
    /// of `cluster_size` bytes each. `data_base` is the byte offset of the
    /// first data cluster (FAT cluster id 2).
    pub fn new(disk: Arc<dyn Disk>, max_clusters: usize, cluster_size: usize, data_base: u64) -> Self {
        assert!(max_clusters >= 1);
        assert!(cluster_size > 0 && cluster_size % PAGE_SIZE == 0);
        Self {
            meta: Arc::new(CacheMeta {
                disk,
                cluster_size,
                data_base,
                writeback: AtomicBool::new(false),
            }),
            max_clusters,
            index: Mutex::new(CacheIndex {
                map: BTreeMap::new(),
                recency: VecDeque::new(),
            }),
        }
    }

    /// Switch the cache from read-only mode to write-back mode.
    pub fn enable_writeback(&self) {
        self.meta.writeback.store(true, Ordering::Release);
    }

    /// Get a reference-counted handle for data cluster `d` (relative
    /// index; FAT cluster id `d + 2`), reading it from disk on a miss.
    pub fn get_cluster(&self, d: u32) -> Result<Arc<Cluster>, FsError> {
        self.get_by_index(d as i64)
    }

    /// Non-fetching lookup of data cluster `d`. Used to assert that a
    /// just-allocated cluster has no lingering in-memory buffer.
    pub fn try_get_cluster(&self, d: u32) -> Option<Arc<Cluster>> {
        self.index.lock().map.get(&(d as i64)).cloned()
    }

    /// Get the cluster covering the arbitrary on-disk byte offset
    /// `byte_offset`, along with the offset within that cluster. The
    /// offset must be 4-byte aligned so FAT entries can be accessed
    /// whole.
    pub fn get_cluster_for_disk_byte_offset(
        &self,
        byte_offset: u64,
    ) -> Result<(Arc<Cluster>, usize), FsError> {
        assert!(
            byte_offset % 4 == 0,
            "FAT-region access at {:#x} is not 4-byte aligned",
            byte_offset
        );
        let rel = byte_offset as i64 - self.meta.data_base as i64;
        let size = self.meta.cluster_size as i64;
        let index = rel.div_euclid(size);
        let within = rel.rem_euclid(size) as usize;
        Ok((self.get_by_index(index)?, within))
    }

    /// Remove the cache entry for data cluster `d`, returning the handle
    /// if one existed. Used during file deletion so residual dirty pages
    /// can be flushed (or dropped) before the on-disk cluster is freed.
    pub fn evict_cluster(&self, d: u32) -> Option<Arc<Cluster>> {
        let mut index = self.index.lock();
        let key = d as i64;
        if let Some(pos) = index.recency.iter().position(|&i| i == key) {
            index.recency.remove(pos);
        }
        index.map.remove(&key)
    }

    /// Flush every dirty cached cluster to disk. No-op while writeback is
    /// disabled.
    pub fn flush_all(&self) -> Result<(), FsError> {
        if !self.meta.writeback_enabled() {
            return Ok(());
        }
        let snapshot: Vec<Arc<Cluster>> = self.index.lock().map.values().cloned().collect();
        let mut result = Ok(());
        for cluster in snapshot {
            if cluster.flush().is_err() {
                result = Err(FsError::IoError);
            }
        }
        result
    }

    fn get_by_index(&self, key: i64) -> Result<Arc<Cluster>, FsError> {
        let mut retries = 0;
        loop {
            // Entries evicted to make room are dropped after the index
            // lock is released; their writeback may reenter the cache.
            let mut evicted: Vec<Arc<Cluster>> = Vec::new();
            let result = {
                let mut index = self.index.lock();
                if let Some(hit) = index.map.get(&key).cloned() {
                    index.touch(key);
                    Some(Ok(hit))
                } else {
                    while index.map.len() >= self.max_clusters {
                        match index.evict_one() {
                            Some(old) => evicted.push(old),
                            None => break,
                        }
                    }
                    if index.map.len() >= self.max_clusters {
                        None // every entry is referenced; retry below
                    } else {
                        let cluster = Arc::new(Cluster {
                            index: key,
                            meta: self.meta.clone(),
                            data: RwLock::new(ClusterBuf::new_zeroed(self.meta.cluster_size)),
                            dirty: AtomicBool::new(false),
                            free_on_drop: Mutex::new(None),
                        });
                        match cluster.fill() {
                            Ok(()) => {
                                index.map.insert(key, cluster.clone());
                                index.touch(key);
                                Some(Ok(cluster))
                            }
                            Err(err) => Some(Err(err)),
                        }
                    }
                }
            };
            drop(evicted);
            match result {
                Some(r) => return r,
                None => {
                    retries += 1;
                    if retries >= EVICT_RETRY_LIMIT {
                        return Err(FsError::NoSpace);
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDisk;
    use crate::SECTOR_SIZE;

    fn test_cache(max_clusters: usize) -> (Arc<RamDisk>, ClusterCache) {
        // 64 data clusters of one page each, data region at 64 KiB.
        let disk = Arc::new(RamDisk::new(0, 64 * 1024 / SECTOR_SIZE + 64 * 8));
        let cache = ClusterCache::new(disk.clone(), max_clusters, PAGE_SIZE, 64 * 1024);
        (disk, cache)
    }

    #[test]
    fn test_hit_returns_same_cluster() {
        let (_disk, cache) = test_cache(4);
        let a = cache.get_cluster(0).unwrap();
        let b = cache.get_cluster(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_fill_reads_disk_contents() {
        let (disk, cache) = test_cache(4);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[7] = 0x5A;
        disk.write(&sector, 64 * 1024 + PAGE_SIZE as u64).unwrap();

        let c = cache.get_cluster(1).unwrap();
        c.with(|buf| assert_eq!(buf[7], 0x5A));
    }

    #[test]
    fn test_dirty_written_back_on_drop() {
        let (disk, cache) = test_cache(2);
        cache.enable_writeback();

        let c = cache.get_cluster(3).unwrap();
        c.with_mut(|buf| buf[0] = 0x77);
        c.mark_dirty();
        drop(c);

        // Evict it so the index reference drops too.
        let evicted = cache.evict_cluster(3).expect("entry should be cached");
        drop(evicted);

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read(&mut sector, 64 * 1024 + 3 * PAGE_SIZE as u64)
            .unwrap();
        assert_eq!(sector[0], 0x77);
    }

    #[test]
    fn test_dirty_discarded_without_writeback() {
        let (disk, cache) = test_cache(2);

        let c = cache.get_cluster(0).unwrap();
        c.with_mut(|buf| buf[0] = 0x99);
        c.mark_dirty();
        drop(c);
        drop(cache.evict_cluster(0).unwrap());

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read(&mut sector, 64 * 1024).unwrap();
        assert_eq!(sector[0], 0, "read-only mode must not write back");
    }

    #[test]
    fn test_capacity_evicts_unreferenced() {
        let (_disk, cache) = test_cache(2);
        let a = cache.get_cluster(0).unwrap();
        drop(a);
        let _b = cache.get_cluster(1).unwrap();
        let _c = cache.get_cluster(2).unwrap(); // evicts cluster 0

        assert!(cache.try_get_cluster(0).is_none());
        assert!(cache.try_get_cluster(1).is_some());
        assert!(cache.try_get_cluster(2).is_some());
    }

    #[test]
    fn test_full_of_referenced_entries_fails() {
        let (_disk, cache) = test_cache(2);
        let _a = cache.get_cluster(0).unwrap();
        let _b = cache.get_cluster(1).unwrap();
        assert_eq!(cache.get_cluster(2).err(), Some(FsError::NoSpace));
    }

    #[test]
    fn test_byte_offset_lookup_spans_fat_region() {
        let (disk, cache) = test_cache(4);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        disk.write(&sector, 16 * 1024).unwrap(); // below the data base

        let (cluster, within) = cache.get_cluster_for_disk_byte_offset(16 * 1024).unwrap();
        let value = cluster.with(|buf| {
            u32::from_le_bytes(buf[within..within + 4].try_into().unwrap())
        });
        assert_eq!(value, 0xDEADBEEF);
    }

    #[test]
    fn test_evict_cluster_returns_live_handle() {
        let (_disk, cache) = test_cache(4);
        let held = cache.get_cluster(5).unwrap();
        let evicted = cache.evict_cluster(5).unwrap();
        assert!(Arc::ptr_eq(&held, &evicted));
        assert!(cache.try_get_cluster(5).is_none());
        assert!(cache.evict_cluster(5).is_none());
    }
}
