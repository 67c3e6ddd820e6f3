//! FAT32 vnode
//!
//! A [`VfatVnode`] is one file or directory on the volume. It owns a
//! materialized copy of its cluster chain (so logical offset → cluster id
//! is an array lookup), grows and truncates that chain through the
//! allocation table, and reads and writes bytes through the cluster
//! cache. Directories additionally own their child vnodes, built lazily
//! from the on-disk entries.
//!
//! ## Locking
//!
//! Three locks per vnode, finest first:
//!
//! - `chain` (the resize lock): short hold, guards the cluster-id array.
//! - `resize_write_lock`: serializes writers across grow/truncate, held
//!   across the whole operation.
//! - `structure`: reader/writer lock over the child list, the populated
//!   flag, and the killed flag.
//!
//! A parent's `structure` lock may be held while acquiring a child's
//! locks, never the reverse.
//!
//! `file_byte_length` is read without any lock; writers publish it with a
//! release store so readers observe either the old or the new value.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, RwLock};

use crate::cache::{Cluster, ClusterCache, PageInfo};
use crate::vfat::dirent::{
    count_filename_entries, is_short_name, Attributes, Dirent, LfnDirent, ATTR_LFN, DIRENT_SIZE,
    ENTRY_END, ENTRY_UNUSED,
};
use crate::vfat::fat::{AllocTable, ChainNext};
use crate::vfat::fs::VfatFileSystem;
use crate::vfs::{FsError, Stat, Vnode, VnodeKind};
use crate::PAGE_SIZE;

/// `dirent_index_in_parent` of the root vnode, which has no directory
/// entry anywhere.
pub const DIRENT_INDEX_NONE: u64 = u64::MAX;

/// Directory state behind the structure lock.
struct DirChildren {
    /// Child vnodes in directory-entry order. Built on first access.
    children: Vec<Arc<VfatVnode>>,
    populated: bool,
    /// Set while the directory is being removed; no new children may be
    /// inserted afterwards.
    killed: bool,
}

/// A FAT32 file or directory.
pub struct VfatVnode {
    me: Weak<VfatVnode>,
    fs: Weak<VfatFileSystem>,
    fat: Arc<AllocTable>,
    cache: Arc<ClusterCache>,

    directory: bool,
    /// Lowercase for 8.3 names, verbatim for long names. Empty for the
    /// root.
    name: String,
    /// Index of the primary directory entry inside the parent's cluster
    /// chain; fixed before the vnode is linked into the parent.
    dirent_index_in_parent: u64,
    /// Back-reference; `None` only for the root. The parent's ownership
    /// of this vnode through its child list keeps the target alive.
    parent: Option<Weak<VfatVnode>>,

    /// Regular files only. Published with a release store, read with an
    /// acquire load, so lockless readers never see a torn value.
    file_byte_length: AtomicU32,

    /// The resize lock: the materialized cluster chain, length >= 1
    /// always, and `chain[0]` never changes (it is the identity the
    /// parent's directory entry refers to).
    chain: Mutex<Vec<u32>>,
    /// Serializes growth and truncation against each other.
    resize_write_lock: Mutex<()>,

    structure: RwLock<DirChildren>,

    /// Set when the file is unlinked; the last reference drop returns
    /// every cluster to the free pool.
    free_clusters_on_drop: AtomicBool,
}

/// Malformed LFN runs are reported once per boot, not once per entry.
static WARNED_INVALID_LFN: AtomicBool = AtomicBool::new(false);

fn warn_invalid_lfn(problem: &str) {
    if !WARNED_INVALID_LFN.swap(true, Ordering::Relaxed) {
        log::warn!(
            "invalid long-filename entry in a directory ({}); further occurrences will not be reported",
            problem
        );
    }
}

impl VfatVnode {
    /// Construct a vnode, materializing its cluster chain by walking the
    /// FAT from `first_cluster_id`.
    pub(crate) fn new(
        fs: &Arc<VfatFileSystem>,
        first_cluster_id: u32,
        directory: bool,
        parent: Option<&Arc<VfatVnode>>,
        name: String,
        file_size: u32,
        dirent_index_in_parent: u64,
    ) -> Result<Arc<Self>, FsError> {
        if directory {
            assert_eq!(file_size, 0, "directories have no byte length of their own");
        }
        if parent.is_none() {
            assert!(directory, "only the root vnode has no parent");
        }

        let fat = fs.fat.clone();
        let cache = fs.cache.clone();

        let mut chain = Vec::new();
        let mut cluster_id = first_cluster_id;
        loop {
            chain.push(cluster_id);
            match fat.get_next(cluster_id)? {
                ChainNext::Next(next) => cluster_id = next,
                ChainNext::End => break,
            }
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            fs: Arc::downgrade(fs),
            fat,
            cache,
            directory,
            name,
            dirent_index_in_parent,
            parent: parent.map(Arc::downgrade),
            file_byte_length: AtomicU32::new(file_size),
            chain: Mutex::new(chain),
            resize_write_lock: Mutex::new(()),
            structure: RwLock::new(DirChildren {
                children: Vec::new(),
                populated: false,
                killed: false,
            }),
            free_clusters_on_drop: AtomicBool::new(false),
        }))
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn is_regular_file(&self) -> bool {
        !self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current byte length. Regular files only.
    pub fn file_size(&self) -> u64 {
        assert!(!self.directory);
        self.file_byte_length.load(Ordering::Acquire) as u64
    }

    /// The chain's first cluster; stable for the life of the vnode.
    pub fn first_cluster_id(&self) -> u32 {
        let chain = self.chain.lock();
        assert!(!chain.is_empty());
        chain[0]
    }

    pub fn cluster_count(&self) -> usize {
        self.chain.lock().len()
    }

    fn arc_self(&self) -> Arc<VfatVnode> {
        self.me.upgrade().expect("a live vnode always has a live self-handle")
    }

    fn parent(&self) -> Option<Arc<VfatVnode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// The parent vnode; the root is its own parent.
    pub fn ref_parent(&self) -> Arc<VfatVnode> {
        self.parent().unwrap_or_else(|| self.arc_self())
    }

    /// Fetch the cluster holding logical cluster `cluster_local_id`, or
    /// `None` past the end of the chain.
    ///
    /// The resize lock is held across the cache fetch: a concurrent
    /// truncate can remove the id from the chain afterwards, but it then
    /// retires the cluster through the cache and the reference returned
    /// here keeps the buffer alive until the caller is done with it.
    fn get_cluster_data(&self, cluster_local_id: usize) -> Result<Option<Arc<Cluster>>, FsError> {
        let chain = self.chain.lock();
        let Some(&cluster_id) = chain.get(cluster_local_id) else {
            return Ok(None);
        };
        assert!(cluster_id >= 2);
        Ok(Some(self.cache.get_cluster(cluster_id - 2)?))
    }

    // ========================================================================
    // Reading and writing
    // ========================================================================

    /// Read into `buf` starting at byte `offset`. Returns the byte count;
    /// 0 at end of file. A read shorter than requested (other than at
    /// EOF) means the file was truncated concurrently, which is benign.
    pub fn read_at(&self, buf: &mut [u8], mut offset: u64) -> Result<usize, FsError> {
        if self.directory {
            return Err(FsError::IsADirectory);
        }
        let file_length = self.file_size();
        if offset >= file_length {
            return Ok(0);
        }
        let end = file_length.min(offset + buf.len() as u64);
        let cluster_size = self.cache.meta.cluster_size as u64;

        let mut total = 0usize;
        while offset < end {
            let local = (offset / cluster_size) as usize;
            let within = (offset % cluster_size) as usize;
            let cluster = match self.get_cluster_data(local) {
                Ok(Some(cluster)) => cluster,
                _ => break, // truncated under us, or the fill failed
            };
            let count = (cluster_size as usize - within).min((end - offset) as usize);
            cluster.with(|data| {
                buf[total..total + count].copy_from_slice(&data[within..within + count])
            });
            total += count;
            offset += count as u64;
        }
        Ok(total)
    }

    /// Write within the existing chain only; returns how much fit. Takes
    /// no resize lock, so this is the lock-free fast path for overwrites.
    fn write_at_nogrow(&self, data: &[u8], mut offset: u64) -> usize {
        let cluster_size = self.cache.meta.cluster_size as u64;
        let mut total = 0usize;
        while total < data.len() {
            let local = (offset / cluster_size) as usize;
            let within = (offset % cluster_size) as usize;
            let cluster = match self.get_cluster_data(local) {
                Ok(Some(cluster)) => cluster,
                _ => break, // chain ends here; the caller grows and retries
            };
            let count = (cluster_size as usize - within).min(data.len() - total);
            cluster.with_mut(|buf| {
                buf[within..within + count].copy_from_slice(&data[total..total + count])
            });
            cluster.mark_dirty();
            total += count;
            offset += count as u64;
        }
        total
    }

    /// Zero `[offset, offset + len)`. Only called with the resize write
    /// lock held and the range known to be covered by the chain.
    fn zero_range_nogrow(&self, mut offset: u64, mut len: u64) {
        let cluster_size = self.cache.meta.cluster_size as u64;
        while len > 0 {
            let local = (offset / cluster_size) as usize;
            let within = (offset % cluster_size) as usize;
            let cluster = self
                .get_cluster_data(local)
                .ok()
                .flatten()
                .expect("zeroed range must be covered by the cluster chain");
            let count = (cluster_size - within as u64).min(len) as usize;
            cluster.with_mut(|buf| buf[within..within + count].fill(0));
            cluster.mark_dirty();
            offset += count as u64;
            len -= count as u64;
        }
    }

    /// Grow the chain to `clusters_needed` clusters. Every new cluster is
    /// linked into the on-disk FAT *before* it is published in `chain`,
    /// so a crash can orphan a cluster but never leave the chain dangling.
    ///
    /// On `NoSpace`, clusters appended so far remain part of the file.
    fn expand_to_cluster_count(&self, clusters_needed: usize) -> Result<(), FsError> {
        loop {
            let (count, tail) = {
                let chain = self.chain.lock();
                (chain.len(), *chain.last().expect("chains are never empty"))
            };
            if count >= clusters_needed {
                return Ok(());
            }
            // A requisitioned cluster arrives already marked end-of-chain.
            let new_cluster = self.fat.requisition_free()?.ok_or(FsError::NoSpace)?;
            assert!(new_cluster >= 2);
            assert!(
                self.cache.try_get_cluster(new_cluster - 2).is_none(),
                "a freshly requisitioned cluster must have no cached buffer"
            );
            self.fat.set_next(tail, new_cluster)?;
            self.chain.lock().push(new_cluster);
        }
    }

    /// Write `data` at `offset`, or at end of file when `append` is set.
    /// Returns the number of bytes written; fewer than `data.len()` only
    /// when the volume ran out of clusters.
    pub fn write_at(&self, data: &[u8], offset: u64, append: bool) -> Result<usize, FsError> {
        if self.directory {
            return Err(FsError::IsADirectory);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if offset.saturating_add(data.len() as u64) > u32::MAX as u64 {
            return Err(FsError::InvalidArgument);
        }

        let mut data = data;
        let mut offset = offset;
        let mut total = 0usize;

        if !append && offset + data.len() as u64 <= self.file_size() {
            // Entirely within the current bounds: optimistic fast path
            // with no resize lock.
            let written = self.write_at_nogrow(data, offset);
            if written == data.len() {
                return Ok(written);
            }
            // Someone shrank the file while we worked; fall through and
            // finish under the write lock.
            total = written;
            data = &data[written..];
            offset += written as u64;
        }

        let _writer = self.resize_write_lock.lock();
        if append {
            offset = self.file_byte_length.load(Ordering::Acquire) as u64;
            if offset.saturating_add(data.len() as u64) > u32::MAX as u64 {
                return Err(FsError::InvalidArgument);
            }
        }

        let cluster_size = self.cache.meta.cluster_size as u64;
        let clusters_needed = (offset + data.len() as u64).div_ceil(cluster_size) as usize;
        if clusters_needed > self.cluster_count() {
            match self.expand_to_cluster_count(clusters_needed) {
                Ok(()) => {}
                // Keep whatever was appended; the write is clamped below.
                Err(FsError::NoSpace) => {}
                Err(err) => return Err(err),
            }
        }

        let capacity = self.cluster_count() as u64 * cluster_size;
        let old_length = self.file_byte_length.load(Ordering::Acquire) as u64;
        if offset >= capacity {
            return Ok(total); // allocation failed before the write offset
        }
        if offset > old_length {
            self.zero_range_nogrow(old_length, offset - old_length);
        }

        let writable = data.len().min((capacity - offset) as usize);
        let written = self.write_at_nogrow(&data[..writable], offset);
        assert!(
            written == writable,
            "writes cannot fail once their clusters are pre-allocated"
        );
        total += written;

        let new_end = offset + written as u64;
        if new_end > old_length {
            self.file_byte_length.store(new_end as u32, Ordering::Release);
            if let Some(parent) = self.parent() {
                parent.update_child_length_on_disk(self, new_end as u32)?;
            }
        }
        Ok(total)
    }

    /// Reset the file to length 0. The first cluster is preserved so the
    /// parent's directory entry (and the vnode's identity) stay valid;
    /// every other cluster is retired.
    pub fn truncate(&self) -> Result<(), FsError> {
        if self.directory {
            return Err(FsError::IsADirectory);
        }
        let _writer = self.resize_write_lock.lock();

        self.file_byte_length.store(0, Ordering::Release);
        if let Some(parent) = self.parent() {
            parent.update_child_length_on_disk(self, 0)?;
        }

        let mut chain = self.chain.lock();
        assert!(!chain.is_empty());
        if chain.len() > 1 {
            self.fat.mark_final(chain[0])?;
            for &cluster_id in &chain[1..] {
                self.retire_one_cluster(cluster_id)?;
            }
            chain.truncate(1);
        }
        Ok(())
    }

    /// Return one cluster to the free pool, via the cache.
    ///
    /// Evicting first closes the re-reference window: the only way to
    /// reach this cluster is through `chain`, which it has already left.
    /// If a buffer was still referenced, the FAT free is deferred to its
    /// last drop (after writeback); otherwise the entry is freed now.
    fn retire_one_cluster(&self, cluster_id: u32) -> Result<(), FsError> {
        match self.cache.evict_cluster(cluster_id - 2) {
            Some(cluster) => {
                self.fat.mark_final(cluster_id)?;
                cluster.mark_free_on_delete(cluster_id, self.fat.clone());
            }
            None => {
                self.fat.mark_final(cluster_id)?;
                self.fat.mark_free(cluster_id)?;
            }
        }
        Ok(())
    }

    /// Map page `page_index` of this file.
    pub fn get_page_info(&self, page_index: u64) -> Result<PageInfo, FsError> {
        let pages_per_cluster = (self.cache.meta.cluster_size / PAGE_SIZE) as u64;
        let local = (page_index / pages_per_cluster) as usize;
        let within = (page_index % pages_per_cluster) as usize;
        let cluster = self
            .get_cluster_data(local)?
            .ok_or(FsError::InvalidArgument)?;
        Ok(PageInfo {
            cluster,
            page_in_cluster: within,
        })
    }

    // ========================================================================
    // Directory entries on disk
    // ========================================================================

    /// The cluster and byte offset holding directory entry `index`, or
    /// `None` past the end of the chain.
    fn get_dirent_ref(&self, index: u64) -> Result<Option<(Arc<Cluster>, usize)>, FsError> {
        let dirents_per_cluster = (self.cache.meta.cluster_size / DIRENT_SIZE) as u64;
        let local = (index / dirents_per_cluster) as usize;
        let within = (index % dirents_per_cluster) as usize * DIRENT_SIZE;
        Ok(self.get_cluster_data(local)?.map(|cluster| (cluster, within)))
    }

    /// Persist a child's new byte length into its directory entry.
    fn update_child_length_on_disk(
        &self,
        child: &VfatVnode,
        new_byte_length: u32,
    ) -> Result<(), FsError> {
        debug_assert!(child
            .parent
            .as_ref()
            .is_some_and(|weak| core::ptr::eq(weak.as_ptr(), self)));
        assert_ne!(child.dirent_index_in_parent, DIRENT_INDEX_NONE);

        let (cluster, within) = self
            .get_dirent_ref(child.dirent_index_in_parent)?
            .expect("a child's directory entry always lies within the parent's chain");
        let updated = cluster.with_mut(|buf| {
            let entry = &mut buf[within..within + DIRENT_SIZE];
            if entry[0] == ENTRY_UNUSED {
                // Unlinked but still open; there is no entry to maintain.
                return false;
            }
            entry[28..32].copy_from_slice(&new_byte_length.to_le_bytes());
            true
        });
        if updated {
            cluster.mark_dirty();
        }
        Ok(())
    }

    /// Mark a child's primary entry unused, then walk backwards marking
    /// its LFN fragments unused, stopping at the first slot that is not a
    /// live LFN entry (those belong to someone else).
    fn remove_child_from_disk(&self, child: &VfatVnode) -> Result<(), FsError> {
        assert_ne!(child.dirent_index_in_parent, DIRENT_INDEX_NONE);
        let (cluster, within) = self
            .get_dirent_ref(child.dirent_index_in_parent)?
            .expect("a child's directory entry always lies within the parent's chain");
        cluster.with_mut(|buf| {
            debug_assert_ne!(buf[within], ENTRY_UNUSED);
            buf[within] = ENTRY_UNUSED;
        });
        cluster.mark_dirty();

        let mut index = child.dirent_index_in_parent;
        while index > 0 {
            index -= 1;
            let (cluster, within) = self
                .get_dirent_ref(index)?
                .expect("entries below a known-present index always exist");
            let cleared = cluster.with_mut(|buf| {
                let entry = &mut buf[within..within + DIRENT_SIZE];
                if entry[0] == ENTRY_UNUSED || entry[0] == ENTRY_END || entry[11] != ATTR_LFN {
                    return false;
                }
                entry[0] = ENTRY_UNUSED;
                true
            });
            if !cleared {
                break;
            }
            cluster.mark_dirty();
        }
        Ok(())
    }

    /// Find `count_needed` consecutive free directory entries, extending
    /// past the end of the chain if necessary (allocation happens later,
    /// in [`VfatVnode::assign_dirent`]). Returns the index of the *last*
    /// entry of the run. Must be called with the structure lock held.
    fn find_consecutive_free_dirents(&self, count_needed: usize) -> Result<u64, FsError> {
        assert!(count_needed >= 1);
        assert!(self.directory);
        let dirents_per_cluster = self.cache.meta.cluster_size / DIRENT_SIZE;

        let mut run_start: Option<u64> = None;
        let mut local = 0usize;
        loop {
            let Some(cluster) = self.get_cluster_data(local)? else {
                // Off the end of the chain: everything from here is free.
                let start = run_start.unwrap_or((local * dirents_per_cluster) as u64);
                return Ok(start + count_needed as u64 - 1);
            };
            let data = cluster.with(|buf| buf.to_vec());
            drop(cluster);

            for i in 0..dirents_per_cluster {
                let index = (local * dirents_per_cluster + i) as u64;
                match data[i * DIRENT_SIZE] {
                    ENTRY_END => {
                        // Nothing was ever written past this point.
                        let start = run_start.unwrap_or(index);
                        return Ok(start + count_needed as u64 - 1);
                    }
                    ENTRY_UNUSED => {
                        let start = *run_start.get_or_insert(index);
                        if index - start + 1 >= count_needed as u64 {
                            return Ok(index);
                        }
                    }
                    _ => run_start = None,
                }
            }
            local += 1;
        }
    }

    /// Write `entry` at directory entry `index`, which must be free.
    /// Extends the directory by one zero-filled cluster when `index` lies
    /// just past the current chain. Must be called with the structure
    /// lock held.
    fn assign_dirent(&self, index: u64, entry: &Dirent) -> Result<(), FsError> {
        assert!(self.directory);
        let dirents_per_cluster = (self.cache.meta.cluster_size / DIRENT_SIZE) as u64;

        let (cluster, within) = match self.get_dirent_ref(index)? {
            Some(found) => found,
            None => {
                let count = self.cluster_count();
                assert_eq!(
                    index / dirents_per_cluster,
                    count as u64,
                    "directory entries extend the chain by at most one cluster"
                );
                self.expand_to_cluster_count(count + 1)?;
                let (cluster, within) = self
                    .get_dirent_ref(index)?
                    .expect("the entry lies within the just-extended chain");
                cluster.with_mut(|buf| buf.fill(0));
                (cluster, within)
            }
        };
        cluster.with_mut(|buf| {
            debug_assert!(buf[within] == ENTRY_UNUSED || buf[within] == ENTRY_END);
            buf[within..within + DIRENT_SIZE].copy_from_slice(&entry.0);
        });
        cluster.mark_dirty();
        Ok(())
    }

    /// Allocate a first cluster and write the directory entries (LFN
    /// fragments plus the primary) for a new child called `name`.
    /// Returns the child's cluster id and primary entry index. Must be
    /// called with the structure lock held.
    fn insert_dirents(&self, name: &str, attributes: u8) -> Result<(u32, u64), FsError> {
        let entry_count = count_filename_entries(name).ok_or(FsError::InvalidArgument)?;

        let cluster_id = self.fat.requisition_free()?.ok_or(FsError::NoSpace)?;
        assert!(cluster_id >= 2);
        assert!(
            self.cache.try_get_cluster(cluster_id - 2).is_none(),
            "a freshly requisitioned cluster must have no cached buffer"
        );

        let dirent_index = self.find_consecutive_free_dirents(entry_count)?;

        let mut primary = if entry_count == 1 {
            Dirent::short_filename(name)
        } else {
            Dirent::guard_filename(name)
        };
        // Fragments land in descending index order just before the
        // primary: the highest fragment sits at the lowest disk offset.
        for i in 0..entry_count - 1 {
            let fragment = LfnDirent::filename_fragment(name, i, primary.checksum());
            self.assign_dirent(dirent_index - 1 - i as u64, &fragment)?;
        }
        primary.set_attributes(attributes);
        primary.set_file_size(0);
        primary.set_cluster_id(cluster_id);
        self.assign_dirent(dirent_index, &primary)?;

        Ok((cluster_id, dirent_index))
    }

    /// Write the `.` and `..` entries of a freshly created directory.
    fn populate_dot_files(&self, parent: &VfatVnode) -> Result<(), FsError> {
        self.assign_dirent(0, &Dirent::dot_entry(self.first_cluster_id()))?;
        // `..` encodes cluster 0 when the parent is the root directory.
        let parent_cluster = if parent.parent.is_none() {
            0
        } else {
            parent.first_cluster_id()
        };
        self.assign_dirent(1, &Dirent::dotdot_entry(parent_cluster))?;
        Ok(())
    }

    // ========================================================================
    // Directory contents in memory
    // ========================================================================

    /// Build the child list from the on-disk entries. Lazy and
    /// idempotent; cheap once populated.
    pub fn populate_children(&self) -> Result<(), FsError> {
        assert!(self.directory);
        if self.structure.read().populated {
            return Ok(());
        }
        let mut guard = self.structure.write();
        if guard.populated {
            // Lost the upgrade race to another thread; its scan stands.
            return Ok(());
        }
        let fs = self.fs.upgrade().ok_or(FsError::IoError)?;
        let me = self.arc_self();
        let dirents_per_cluster = self.cache.meta.cluster_size / DIRENT_SIZE;

        let mut children: Vec<Arc<VfatVnode>> = Vec::new();

        // LFN fragments arrive highest index first; segments are kept in
        // arrival order and joined in reverse once the primary shows up.
        let mut lfn_segments: Vec<String> = Vec::new();
        let mut lfn_active = false;
        let mut lfn_checksum = 0u8;
        let mut lfn_last_index = 0u8;

        let mut local = 0usize;
        'scan: loop {
            let Some(cluster) = self.get_cluster_data(local)? else {
                break;
            };
            let data = cluster.with(|buf| buf.to_vec());
            drop(cluster);

            for i in 0..dirents_per_cluster {
                let raw: [u8; DIRENT_SIZE] =
                    data[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE].try_into().unwrap();
                let entry = Dirent(raw);

                if entry.is_end() {
                    break 'scan;
                }
                if entry.is_unused() {
                    lfn_active = false;
                    lfn_segments.clear();
                    continue;
                }
                // `.` and `..` are synthesized by next_dirent instead.
                if entry.is_dot() {
                    continue;
                }

                if entry.is_lfn() {
                    let lfn = LfnDirent(raw);
                    if !lfn.validate() {
                        warn_invalid_lfn("malformed entry");
                        continue;
                    }
                    if lfn.starts_sequence() {
                        if lfn_active {
                            warn_invalid_lfn("new long filename before the last one was used");
                        }
                        lfn_active = true;
                        lfn_segments.clear();
                        lfn_checksum = lfn.checksum();
                    } else if !lfn_active
                        || lfn.checksum() != lfn_checksum
                        || lfn_last_index <= 1
                        || lfn.index() != lfn_last_index - 1
                    {
                        warn_invalid_lfn("continuation does not match its sequence");
                        lfn_active = false;
                        lfn_segments.clear();
                        continue;
                    }
                    lfn_last_index = lfn.index();
                    lfn_segments.push(lfn.extract_name_segment());
                    continue;
                }

                if Attributes::from_bits_truncate(entry.attributes())
                    .contains(Attributes::VOLUME_ID)
                {
                    lfn_active = false;
                    lfn_segments.clear();
                    continue;
                }

                let name = if lfn_active && lfn_last_index == 1 && lfn_checksum == entry.checksum()
                {
                    let mut joined = String::new();
                    for segment in lfn_segments.iter().rev() {
                        joined.push_str(segment);
                    }
                    joined
                } else {
                    if lfn_active {
                        warn_invalid_lfn("sequence incomplete or checksum mismatch");
                    }
                    entry.extract_filename()
                };
                lfn_active = false;
                lfn_segments.clear();

                let dirent_index = (local * dirents_per_cluster + i) as u64;
                let child = VfatVnode::new(
                    &fs,
                    entry.cluster_id(),
                    entry.is_directory(),
                    Some(&me),
                    name,
                    entry.file_size(),
                    dirent_index,
                )?;
                children.push(child);
            }
            local += 1;
        }

        if lfn_active {
            warn_invalid_lfn("long filename never used by a primary entry");
        }
        guard.children = children;
        guard.populated = true;
        Ok(())
    }

    fn find_child<'a>(
        children: &'a [Arc<VfatVnode>],
        name: &str,
    ) -> Option<(usize, &'a Arc<VfatVnode>)> {
        children
            .iter()
            .enumerate()
            .find(|(_, child)| child.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive child lookup.
    pub fn ref_child(&self, name: &str) -> Result<Option<Arc<VfatVnode>>, FsError> {
        assert!(self.directory);
        self.populate_children()?;
        let guard = self.structure.read();
        Ok(Self::find_child(&guard.children, name).map(|(_, child)| child.clone()))
    }

    pub fn child_exists(&self, name: &str) -> Result<bool, FsError> {
        if name == "." || name == ".." {
            return Ok(true);
        }
        Ok(self.ref_child(name)?.is_some())
    }

    /// Directory iteration: `.`, `..`, then the children. The cursor is
    /// the previously returned name, which makes a full readdir O(n²);
    /// acceptable for the directory sizes this filesystem serves.
    pub fn next_dirent(&self, last: Option<&str>) -> Result<Option<String>, FsError> {
        if !self.directory {
            return Err(FsError::NotADirectory);
        }
        match last {
            None => Ok(Some(".".to_string())),
            Some(".") => Ok(Some("..".to_string())),
            Some("..") => {
                self.populate_children()?;
                let guard = self.structure.read();
                Ok(guard.children.first().map(|child| child.name.clone()))
            }
            Some(last) => {
                self.populate_children()?;
                let guard = self.structure.read();
                let (pos, _) =
                    Self::find_child(&guard.children, last).ok_or(FsError::NotFound)?;
                Ok(guard.children.get(pos + 1).map(|child| child.name.clone()))
            }
        }
    }

    // ========================================================================
    // Creating and removing children
    // ========================================================================

    /// Create a regular file. Without `excl`, an existing regular file of
    /// the same name is returned instead.
    pub fn create_file(&self, name: &str, excl: bool) -> Result<Arc<VfatVnode>, FsError> {
        if !self.directory {
            return Err(FsError::NotADirectory);
        }
        self.populate_children()?;
        let fs = self.fs.upgrade().ok_or(FsError::IoError)?;
        let me = self.arc_self();

        let mut guard = self.structure.write();
        if let Some((_, existing)) = Self::find_child(&guard.children, name) {
            if excl || !existing.is_regular_file() {
                return Err(FsError::AlreadyExists);
            }
            return Ok(existing.clone());
        }
        if guard.killed {
            // Directory is going away; don't give it new children.
            return Err(FsError::NotFound);
        }

        let (cluster_id, dirent_index) =
            self.insert_dirents(name, Attributes::ARCHIVE.bits())?;
        let child = VfatVnode::new(
            &fs,
            cluster_id,
            false,
            Some(&me),
            stored_name(name),
            0,
            dirent_index,
        )?;
        guard.children.push(child.clone());
        Ok(child)
    }

    /// Create a subdirectory with fresh `.` and `..` entries.
    pub fn create_dir(&self, name: &str) -> Result<Arc<VfatVnode>, FsError> {
        if !self.directory {
            return Err(FsError::NotADirectory);
        }
        self.populate_children()?;
        let fs = self.fs.upgrade().ok_or(FsError::IoError)?;
        let me = self.arc_self();

        let mut guard = self.structure.write();
        if Self::find_child(&guard.children, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if guard.killed {
            return Err(FsError::NotFound);
        }

        let (cluster_id, dirent_index) =
            self.insert_dirents(name, Attributes::DIRECTORY.bits())?;

        // The new directory's cluster must read as empty before anything
        // can look at it.
        let cluster = self.cache.get_cluster(cluster_id - 2)?;
        cluster.with_mut(|buf| buf.fill(0));
        cluster.mark_dirty();
        drop(cluster);

        let child = VfatVnode::new(
            &fs,
            cluster_id,
            true,
            Some(&me),
            stored_name(name),
            0,
            dirent_index,
        )?;
        child.populate_dot_files(self)?;
        guard.children.push(child.clone());
        Ok(child)
    }

    /// Refuse future child creation. Returns false (and stays alive) if
    /// the directory still has children.
    fn kill_directory(&self) -> Result<bool, FsError> {
        self.populate_children()?;
        let mut guard = self.structure.write();
        assert!(!guard.killed);
        if !guard.children.is_empty() {
            return Ok(false);
        }
        guard.killed = true;
        Ok(true)
    }

    /// Remove the child `name`. Directories must be empty; their killed
    /// flag closes the race against concurrent creates. The victim's
    /// clusters are returned to the free pool when its last reference
    /// drops.
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        if !self.directory {
            return Err(FsError::NotADirectory);
        }
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        self.populate_children()?;

        let mut guard = self.structure.write();
        let (pos, child) = Self::find_child(&guard.children, name).ok_or(FsError::NotFound)?;
        let child = child.clone();

        if child.is_directory() && !child.kill_directory()? {
            return Err(FsError::DirectoryNotEmpty);
        }

        self.remove_child_from_disk(&child)?;
        guard.children.remove(pos);
        child.free_clusters_on_drop.store(true, Ordering::Release);
        Ok(())
    }
}

/// In-memory name for a new child: 8.3 names fold to lowercase (matching
/// what a later mount decodes), long names keep their case.
fn stored_name(name: &str) -> String {
    if is_short_name(name) {
        name.to_ascii_lowercase()
    } else {
        name.to_string()
    }
}

impl Drop for VfatVnode {
    fn drop(&mut self) {
        if self.free_clusters_on_drop.load(Ordering::Acquire) {
            let chain = core::mem::take(self.chain.get_mut());
            for cluster_id in chain {
                if let Err(err) = self.retire_one_cluster(cluster_id) {
                    log::error!("failed to release cluster {}: {:?}", cluster_id, err);
                }
            }
        }
    }
}

impl Vnode for VfatVnode {
    fn as_any_ref(&self) -> &dyn Any {
        self
    }

    fn stat(&self) -> Result<Stat, FsError> {
        Ok(Stat {
            dev: self.cache.meta.devno(),
            ino: self.first_cluster_id() as u64,
            // FAT32 has no hardlinks; 1 is the only truthful answer.
            nlink: 1,
            size: if self.directory { 0 } else { self.file_size() },
            blksize: PAGE_SIZE,
            kind: if self.directory {
                VnodeKind::Directory
            } else {
                VnodeKind::Regular
            },
        })
    }

    fn is_directory(&self) -> bool {
        self.directory
    }

    fn is_regular_file(&self) -> bool {
        !self.directory
    }

    fn is_same(&self, other: &dyn Vnode) -> bool {
        other
            .as_any_ref()
            .downcast_ref::<VfatVnode>()
            .is_some_and(|other| core::ptr::eq(self, other))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        VfatVnode::read_at(self, buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64, append: bool) -> Result<usize, FsError> {
        VfatVnode::write_at(self, data, offset, append)
    }

    fn truncate(&self) -> Result<(), FsError> {
        VfatVnode::truncate(self)
    }

    fn get_page_info(&self, page_index: u64) -> Result<PageInfo, FsError> {
        VfatVnode::get_page_info(self, page_index)
    }

    fn next_dirent(&self, last: Option<&str>) -> Result<Option<String>, FsError> {
        VfatVnode::next_dirent(self, last)
    }

    fn child_exists(&self, name: &str) -> Result<bool, FsError> {
        VfatVnode::child_exists(self, name)
    }

    fn create_file(&self, name: &str, excl: bool) -> Result<Arc<dyn Vnode>, FsError> {
        VfatVnode::create_file(self, name, excl).map(|child| child as Arc<dyn Vnode>)
    }

    fn create_dir(&self, name: &str) -> Result<Arc<dyn Vnode>, FsError> {
        VfatVnode::create_dir(self, name).map(|child| child as Arc<dyn Vnode>)
    }

    fn create_device(
        &self,
        _name: &str,
        _major: u16,
        _minor: u16,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        // FAT32 has no way to represent device nodes.
        Err(FsError::NotSupported)
    }

    fn create_socket(&self, _name: &str) -> Result<Arc<dyn Vnode>, FsError> {
        Err(FsError::NotSupported)
    }

    fn remove(&self, name: &str) -> Result<(), FsError> {
        VfatVnode::remove(self, name)
    }

    fn hardlink(
        &self,
        _name: &str,
        _olddir: &Arc<dyn Vnode>,
        _oldname: &str,
    ) -> Result<(), FsError> {
        // FAT32 has no hardlinks.
        Err(FsError::NotSupported)
    }

    fn rename(
        &self,
        _newname: &str,
        _olddir: &Arc<dyn Vnode>,
        _oldname: &str,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }
}
