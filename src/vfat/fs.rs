//! Filesystem construction and mount entry points
//!
//! [`VfatFileSystem::mount`] parses the boot sector, builds the cluster
//! cache and the allocation table, and constructs the root vnode. The
//! filesystem owns the root strongly; every vnode reaches back to the
//! filesystem through a `Weak` handle, so an unmounted filesystem is
//! never kept alive by stray vnode references.
//!
//! A fresh mount is read-only: dirty clusters are discarded on drop until
//! [`VfatFileSystem::enable_writeback`] switches the cache into
//! write-back mode.

use alloc::string::String;
use alloc::sync::Arc;

use spin::Once;

use crate::cache::ClusterCache;
use crate::storage::Disk;
use crate::vfat::boot::Fat32Header;
use crate::vfat::fat::AllocTable;
use crate::vfat::vnode::{VfatVnode, DIRENT_INDEX_NONE};
use crate::vfs::{FileSystem, FsError, Vnode};
use crate::SECTOR_SIZE;

/// Cache budget: clusters worth roughly this many bytes stay in memory.
const CACHE_BUDGET_BYTES: usize = 1024 * 1024;

/// A mounted FAT32 volume.
pub struct VfatFileSystem {
    pub(crate) header: Fat32Header,
    pub(crate) cache: Arc<ClusterCache>,
    pub(crate) fat: Arc<AllocTable>,
    root: Once<Arc<VfatVnode>>,
}

impl VfatFileSystem {
    /// Mount a FAT32 volume from `disk`.
    pub fn mount(disk: Arc<dyn Disk>) -> Result<Arc<Self>, FsError> {
        let mut boot = [0u8; SECTOR_SIZE];
        disk.read(&mut boot, 0).map_err(|_| FsError::IoError)?;
        let header = Fat32Header::parse(&boot)?;

        let cluster_size = header.cluster_size();
        let max_clusters = (CACHE_BUDGET_BYTES / cluster_size).max(1);
        log::debug!(
            "mounting FAT32 volume: cluster size {}, {} data clusters, cache of {} clusters",
            cluster_size,
            header.num_data_clusters(),
            max_clusters
        );

        let cache = Arc::new(ClusterCache::new(
            disk,
            max_clusters,
            cluster_size,
            header.first_data_sector() * SECTOR_SIZE as u64,
        ));
        let fat = Arc::new(AllocTable::new(
            cache.clone(),
            header.first_fat_sector(),
            header.sectors_per_fat,
            header.num_data_clusters(),
        ));

        let fs = Arc::new(Self {
            header,
            cache,
            fat,
            root: Once::new(),
        });
        let root = VfatVnode::new(
            &fs,
            header.root_directory_cluster_id,
            true,
            None,
            String::new(),
            0,
            DIRENT_INDEX_NONE,
        )?;
        fs.root.call_once(|| root);
        Ok(fs)
    }

    /// Switch the volume out of read-only mode: dirty clusters are
    /// written back when their last reference drops.
    pub fn enable_writeback(&self) {
        self.cache.enable_writeback();
    }

    /// Flush every dirty cached cluster to disk.
    pub fn sync(&self) -> Result<(), FsError> {
        self.cache.flush_all()
    }

    /// The volume's boot-sector parameters.
    pub fn header(&self) -> &Fat32Header {
        &self.header
    }

    pub(crate) fn root_vnode(&self) -> Arc<VfatVnode> {
        self.root
            .get()
            .expect("the root vnode is constructed during mount")
            .clone()
    }
}

impl FileSystem for VfatFileSystem {
    fn root(&self) -> Arc<dyn Vnode> {
        self.root_vnode()
    }

    fn resolve_child(
        &self,
        dir: &Arc<dyn Vnode>,
        name: &str,
    ) -> Result<Option<Arc<dyn Vnode>>, FsError> {
        let dir = dir
            .as_any_ref()
            .downcast_ref::<VfatVnode>()
            .ok_or(FsError::InvalidArgument)?;
        Ok(dir
            .ref_child(name)?
            .map(|child| child as Arc<dyn Vnode>))
    }

    fn resolve_parent_of(&self, node: &Arc<dyn Vnode>) -> Arc<dyn Vnode> {
        match node.as_any_ref().downcast_ref::<VfatVnode>() {
            Some(vnode) => vnode.ref_parent(),
            None => self.root(),
        }
    }
}

/// Mount entry point: a filesystem handle for the FAT32 volume on
/// `disk`, or an error if there is no mountable volume.
pub fn vfs_new_fat32(disk: Arc<dyn Disk>) -> Result<Arc<VfatFileSystem>, FsError> {
    VfatFileSystem::mount(disk)
}

/// Turn on dirty-cluster writeback for a mounted volume.
pub fn vfs_enable_fat32_writeback(fs: &Arc<VfatFileSystem>) {
    fs.enable_writeback();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDisk;
    use crate::testfs;
    use crate::vfs::FileSystem;

    use alloc::string::ToString;
    use alloc::vec::Vec;

    fn list(dir: &Arc<dyn Vnode>) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor: Option<String> = None;
        while let Some(name) = dir.next_dirent(cursor.as_deref()).unwrap() {
            names.push(name.clone());
            cursor = Some(name);
        }
        names
    }

    #[test]
    fn test_mount_and_list_root() {
        let (fs, _disk) = testfs::mount_hello();

        let root = fs.root();
        assert_eq!(list(&root), [".", "..", "hello.txt"]);

        let file = fs.resolve(None, "/hello.txt").unwrap();
        assert_eq!(file.stat().unwrap().size, 3);

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
    }

    #[test]
    fn test_mount_rejects_blank_disk() {
        let disk = Arc::new(RamDisk::new(0, 1024));
        assert!(vfs_new_fat32(disk).is_err());
    }

    #[test]
    fn test_long_name_survives_remount() {
        let (fs, disk) = testfs::mount_hello();
        fs.create_file(None, "/This is a Long Name.txt", true).unwrap();

        let fs = testfs::remount(fs, &disk);
        let names = list(&fs.root());
        // Case is preserved through the long-filename entries.
        assert!(names.contains(&"This is a Long Name.txt".to_string()));

        // Lookup is case-insensitive regardless.
        let found = fs.resolve(None, "/this is a long name.txt").unwrap();
        assert!(found.is_regular_file());
    }

    #[test]
    fn test_write_survives_remount() {
        let (fs, disk) = testfs::mount_blank();
        {
            let file = fs.create_file(None, "/log", true).unwrap();
            file.write_at(&[b'a'; 5000], 0, false).unwrap();
        }

        let fs = testfs::remount(fs, &disk);
        let file = fs.resolve(None, "/log").unwrap();
        assert_eq!(file.stat().unwrap().size, 5000);
        let mut buf = vec![0u8; 5000];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 5000);
        assert!(buf.iter().all(|&b| b == b'a'));
    }

    #[test]
    fn test_remove_directory_end_to_end() {
        let (fs, disk) = testfs::mount_blank();
        let free_initial = fs.fat.count_free().unwrap();

        fs.create_dir(None, "/d").unwrap();
        fs.create_file(None, "/d/f", true).unwrap();

        assert_eq!(
            fs.remove(None, "/d"),
            Err(FsError::DirectoryNotEmpty)
        );
        fs.remove(None, "/d/f").unwrap();
        fs.remove(None, "/d").unwrap();

        // Both single-cluster chains return to the free pool.
        assert_eq!(fs.fat.count_free().unwrap(), free_initial);

        let fs = testfs::remount(fs, &disk);
        assert_eq!(fs.resolve(None, "/d").err(), Some(FsError::NotFound));
        assert_eq!(list(&fs.root()), [".", ".."]);
    }

    #[test]
    fn test_vnode_operations_fail_after_unmount() {
        let (fs, _disk) = testfs::mount_blank();
        let root = fs.root_vnode();
        root.populate_children().unwrap();
        drop(fs);

        // The weak backlink is dead; operations that need the filesystem
        // fail instead of dereferencing a gone mount.
        assert_eq!(root.create_file("x", false).err(), Some(FsError::IoError));
    }

    #[test]
    fn test_dirty_data_discarded_without_writeback() {
        let (fs, disk) = testfs::mount_hello();
        // Fresh mounts are read-only until writeback is enabled; this one
        // never enables it.
        let fs_ro = vfs_new_fat32(disk.clone()).unwrap();
        drop(fs);

        let file = fs_ro.resolve(None, "/hello.txt").unwrap();
        file.write_at(b"XX", 0, false).unwrap();
        drop(file);
        drop(fs_ro);

        let fs = vfs_new_fat32(disk).unwrap();
        let file = fs.resolve(None, "/hello.txt").unwrap();
        let mut buf = [0u8; 3];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hi\n", "read-only mount must not persist writes");
    }
}
