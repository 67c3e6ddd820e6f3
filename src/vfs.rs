//! Virtual filesystem layer
//!
//! The contract between the rest of the kernel and a concrete filesystem:
//! the [`Vnode`] object interface, the [`FileSystem`] trait whose provided
//! methods implement path resolution, and the error type shared across
//! the whole subsystem.
//!
//! Path walking is deliberately simple: components are split on `/`,
//! empty components and `.` are skipped, `..` resolves to the parent (the
//! root is its own parent). Every create/remove/rename request funnels
//! through [`FileSystem::resolve_parent`] and is then executed by the
//! parent vnode.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::any::Any;

use crate::cache::PageInfo;

/// Filesystem error.
///
/// Five kinds cover the subsystem: lookup misses (`NotFound`), collisions
/// (`AlreadyExists`), caller mistakes (`InvalidArgument` and the
/// type-mismatch variants), exhaustion (`NoSpace`), and device failure
/// (`IoError`). Violated internal invariants do not travel as errors;
/// they panic at the point of detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File not found
    NotFound,
    /// File already exists
    AlreadyExists,
    /// Invalid argument (bad name, bad path, wrong vnode kind)
    InvalidArgument,
    /// Not a directory
    NotADirectory,
    /// Is a directory (operation not valid for directories)
    IsADirectory,
    /// Directory not empty
    DirectoryNotEmpty,
    /// No free cluster, cache slot, or directory slot
    NoSpace,
    /// I/O error
    IoError,
    /// Operation not supported by this filesystem
    NotSupported,
}

/// What a vnode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
}

/// File metadata as reported to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Device number of the backing volume.
    pub dev: u32,
    /// Inode number; stable for the life of the file.
    pub ino: u64,
    /// Link count. FAT32 has no hardlinks, so this is always 1.
    pub nlink: u32,
    /// Byte length for regular files; 0 for directories.
    pub size: u64,
    /// Preferred I/O granularity.
    pub blksize: usize,
    pub kind: VnodeKind,
}

/// A file or directory object.
///
/// All methods take `&self`; vnodes are shared as `Arc<dyn Vnode>` and do
/// their own locking internally.
pub trait Vnode: Send + Sync {
    /// Downcast support for filesystem implementations.
    fn as_any_ref(&self) -> &dyn Any;

    fn stat(&self) -> Result<Stat, FsError>;
    fn is_directory(&self) -> bool;
    fn is_regular_file(&self) -> bool;

    /// Identity comparison: do `self` and `other` name the same object?
    fn is_same(&self, other: &dyn Vnode) -> bool;

    /// Read up to `buf.len()` bytes at byte `offset`. Returns the number
    /// of bytes read; 0 at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError>;

    /// Write `data` at byte `offset` (or at end of file when `append`).
    /// Returns the number of bytes written, which is less than
    /// `data.len()` only when the volume ran out of space.
    fn write_at(&self, data: &[u8], offset: u64, append: bool) -> Result<usize, FsError>;

    /// Reset a regular file to length 0, keeping its identity (first
    /// cluster).
    fn truncate(&self) -> Result<(), FsError>;

    /// Map page `page_index` of this file to its backing store.
    fn get_page_info(&self, page_index: u64) -> Result<PageInfo, FsError>;

    /// Directory iteration cursor. `None` yields the first entry (`.`);
    /// passing the previously returned name yields the next. Returns
    /// `None` when the directory is exhausted.
    fn next_dirent(&self, last: Option<&str>) -> Result<Option<String>, FsError>;

    /// Does `name` exist in this directory? `.` and `..` always do.
    fn child_exists(&self, name: &str) -> Result<bool, FsError>;

    fn create_file(&self, name: &str, excl: bool) -> Result<Arc<dyn Vnode>, FsError>;
    fn create_dir(&self, name: &str) -> Result<Arc<dyn Vnode>, FsError>;
    fn create_device(&self, name: &str, major: u16, minor: u16)
        -> Result<Arc<dyn Vnode>, FsError>;
    fn create_socket(&self, name: &str) -> Result<Arc<dyn Vnode>, FsError>;

    /// Remove the child `name`; directories must be empty.
    fn remove(&self, name: &str) -> Result<(), FsError>;

    /// Link `olddir/oldname` into this directory as `name`.
    fn hardlink(&self, name: &str, olddir: &Arc<dyn Vnode>, oldname: &str)
        -> Result<(), FsError>;

    /// Move `olddir/oldname` into this directory as `newname`.
    fn rename(&self, newname: &str, olddir: &Arc<dyn Vnode>, oldname: &str)
        -> Result<(), FsError>;
}

/// Split a path into components, dropping empty components and `.`.
fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// A mounted filesystem.
///
/// Implementations supply the three primitives (`root`, `resolve_child`,
/// `resolve_parent_of`); the provided methods build path resolution and
/// the top-level operation shells on them.
pub trait FileSystem: Send + Sync {
    /// The root directory vnode.
    fn root(&self) -> Arc<dyn Vnode>;

    /// Look up `name` in `dir`. `Ok(None)` means the name is absent.
    fn resolve_child(
        &self,
        dir: &Arc<dyn Vnode>,
        name: &str,
    ) -> Result<Option<Arc<dyn Vnode>>, FsError>;

    /// The parent of `node`; the root is its own parent.
    fn resolve_parent_of(&self, node: &Arc<dyn Vnode>) -> Arc<dyn Vnode>;

    /// Resolve `path` to a vnode. Absolute paths (leading `/`) start at
    /// the root; relative paths start at `base` (or the root if `base`
    /// is `None`).
    fn resolve(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let mut current = self.walk_start(base, path);
        for component in split_path(path) {
            current = self.walk_step(current, component)?;
        }
        Ok(current)
    }

    /// Resolve all but the last component of `path`, returning the parent
    /// directory and the final name. Fails on paths with no components.
    fn resolve_parent(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
    ) -> Result<(Arc<dyn Vnode>, String), FsError> {
        let components = split_path(path);
        let (last, dirs) = components.split_last().ok_or(FsError::InvalidArgument)?;
        let mut current = self.walk_start(base, path);
        for component in dirs {
            current = self.walk_step(current, component)?;
        }
        if !current.is_directory() {
            return Err(FsError::NotADirectory);
        }
        Ok((current, last.to_string()))
    }

    fn create_file(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
        excl: bool,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let (parent, name) = self.resolve_parent(base, path)?;
        parent.create_file(&name, excl)
    }

    fn create_dir(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let (parent, name) = self.resolve_parent(base, path)?;
        parent.create_dir(&name)
    }

    fn create_device(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
        major: u16,
        minor: u16,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let (parent, name) = self.resolve_parent(base, path)?;
        parent.create_device(&name, major, minor)
    }

    fn create_socket(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        path: &str,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let (parent, name) = self.resolve_parent(base, path)?;
        parent.create_socket(&name)
    }

    fn remove(&self, base: Option<&Arc<dyn Vnode>>, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(base, path)?;
        parent.remove(&name)
    }

    /// Rename `oldpath` to `newpath`. The source must exist and the
    /// target must not; the rest is up to the filesystem.
    fn rename(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        oldpath: &str,
        newpath: &str,
    ) -> Result<(), FsError> {
        let (olddir, oldname) = self.resolve_parent(base, oldpath)?;
        if !olddir.child_exists(&oldname)? {
            return Err(FsError::NotFound);
        }
        let (newdir, newname) = self.resolve_parent(base, newpath)?;
        if newdir.child_exists(&newname)? {
            return Err(FsError::AlreadyExists);
        }
        newdir.rename(&newname, &olddir, &oldname)
    }

    /// Hardlink `oldpath` as `newpath`, with the same preflights as
    /// [`FileSystem::rename`].
    fn hardlink(
        &self,
        base: Option<&Arc<dyn Vnode>>,
        oldpath: &str,
        newpath: &str,
    ) -> Result<(), FsError> {
        let (olddir, oldname) = self.resolve_parent(base, oldpath)?;
        if !olddir.child_exists(&oldname)? {
            return Err(FsError::NotFound);
        }
        let (newdir, newname) = self.resolve_parent(base, newpath)?;
        if newdir.child_exists(&newname)? {
            return Err(FsError::AlreadyExists);
        }
        newdir.hardlink(&newname, &olddir, &oldname)
    }

    /// Starting vnode for a walk of `path` from `base`.
    #[doc(hidden)]
    fn walk_start(&self, base: Option<&Arc<dyn Vnode>>, path: &str) -> Arc<dyn Vnode> {
        if path.starts_with('/') {
            self.root()
        } else {
            base.cloned().unwrap_or_else(|| self.root())
        }
    }

    /// One walk step from `current` through `component`.
    #[doc(hidden)]
    fn walk_step(
        &self,
        current: Arc<dyn Vnode>,
        component: &str,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        if !current.is_directory() {
            return Err(FsError::NotADirectory);
        }
        if component == ".." {
            return Ok(self.resolve_parent_of(&current));
        }
        self.resolve_child(&current, component)?
            .ok_or(FsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/bb/c"), ["a", "bb", "c"]);
        assert_eq!(split_path("///a//bb"), ["a", "bb"]);
        assert_eq!(split_path("a/./b"), ["a", "b"]);
        assert_eq!(split_path("a/../b"), ["a", "..", "b"]);
        assert!(split_path("").is_empty());
        assert!(split_path("////").is_empty());
        assert!(split_path("/.").is_empty());
    }

    #[test]
    fn test_resolve_absolute_and_relative() {
        let (fs, _disk) = testfs::mount_blank();
        let a = fs.create_dir(None, "/a").unwrap();
        let b = fs.create_dir(Some(&a), "b").unwrap();

        let resolved = fs.resolve(None, "/a/b").unwrap();
        assert!(resolved.is_same(b.as_ref()));

        let resolved = fs.resolve(Some(&a), "b").unwrap();
        assert!(resolved.is_same(b.as_ref()));

        // `.` components are no-ops; extra slashes collapse.
        let resolved = fs.resolve(None, "//a/./b/").unwrap();
        assert!(resolved.is_same(b.as_ref()));

        assert_eq!(fs.resolve(None, "/a/missing").err(), Some(FsError::NotFound));
    }

    #[test]
    fn test_resolve_dot_dot() {
        let (fs, _disk) = testfs::mount_blank();
        let a = fs.create_dir(None, "/a").unwrap();
        let b = fs.create_dir(None, "/a/b").unwrap();

        let resolved = fs.resolve(Some(&b), "..").unwrap();
        assert!(resolved.is_same(a.as_ref()));

        let resolved = fs.resolve(None, "/a/b/..").unwrap();
        assert!(resolved.is_same(a.as_ref()));

        // The root is its own parent.
        let resolved = fs.resolve(None, "/..").unwrap();
        assert!(resolved.is_same(fs.root().as_ref()));
    }

    #[test]
    fn test_resolve_through_file_fails() {
        let (fs, _disk) = testfs::mount_blank();
        fs.create_file(None, "/f", true).unwrap();
        assert_eq!(
            fs.resolve(None, "/f/x").err(),
            Some(FsError::NotADirectory)
        );
    }

    #[test]
    fn test_resolve_parent() {
        let (fs, _disk) = testfs::mount_blank();
        let a = fs.create_dir(None, "/a").unwrap();

        let (parent, name) = fs.resolve_parent(None, "/a/newfile").unwrap();
        assert!(parent.is_same(a.as_ref()));
        assert_eq!(name, "newfile");

        // The final component need not exist; the walk stops before it.
        let (parent, name) = fs.resolve_parent(None, "/a/nope").unwrap();
        assert!(parent.is_same(a.as_ref()));
        assert_eq!(name, "nope");

        // A path with no components has no parent to resolve.
        assert_eq!(
            fs.resolve_parent(None, "/").err(),
            Some(FsError::InvalidArgument)
        );
    }

    #[test]
    fn test_create_and_remove_by_path() {
        let (fs, _disk) = testfs::mount_blank();
        fs.create_dir(None, "/etc").unwrap();
        fs.create_file(None, "/etc/conf", true).unwrap();

        assert!(fs.resolve(None, "/etc/conf").is_ok());
        fs.remove(None, "/etc/conf").unwrap();
        assert_eq!(fs.resolve(None, "/etc/conf").err(), Some(FsError::NotFound));
    }

    #[test]
    fn test_rename_preflights() {
        let (fs, _disk) = testfs::mount_blank();
        fs.create_file(None, "/src", true).unwrap();
        fs.create_file(None, "/taken", true).unwrap();

        // Source must exist.
        assert_eq!(
            fs.rename(None, "/missing", "/dst"),
            Err(FsError::NotFound)
        );
        // Target must not.
        assert_eq!(
            fs.rename(None, "/src", "/taken"),
            Err(FsError::AlreadyExists)
        );
        // Preflights pass; FAT32 itself rejects the operation.
        assert_eq!(
            fs.rename(None, "/src", "/dst"),
            Err(FsError::NotSupported)
        );
    }

    #[test]
    fn test_hardlink_preflights() {
        let (fs, _disk) = testfs::mount_blank();
        fs.create_file(None, "/src", true).unwrap();

        assert_eq!(
            fs.hardlink(None, "/missing", "/dst"),
            Err(FsError::NotFound)
        );
        assert_eq!(
            fs.hardlink(None, "/src", "/src"),
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.hardlink(None, "/src", "/dst"),
            Err(FsError::NotSupported)
        );
    }

    #[test]
    fn test_devices_and_sockets_unsupported() {
        let (fs, _disk) = testfs::mount_blank();
        assert_eq!(
            fs.create_device(None, "/dev0", 1, 0).err(),
            Some(FsError::NotSupported)
        );
        assert_eq!(
            fs.create_socket(None, "/sock").err(),
            Some(FsError::NotSupported)
        );
    }
}
