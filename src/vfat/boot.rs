//! Boot sector / BIOS Parameter Block
//!
//! The first 512 bytes of a FAT32 volume. Parsed once at mount; only the
//! fields this implementation consumes are kept.

use crate::vfs::FsError;
use crate::{PAGE_SIZE, SECTOR_SIZE};

/// Boot-sector signature at offset 510.
const BOOT_SIGNATURE: u16 = 0xAA55;

/// Parsed FAT32 boot-sector parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat32Header {
    /// Bytes per sector; this implementation requires 512.
    pub bytes_per_sector: u16,
    /// Sectors per cluster (power of two).
    pub sectors_per_cluster: u8,
    /// Sectors before the first FAT.
    pub reserved_sectors: u16,
    /// Number of FAT copies (only copy #0 is consulted).
    pub number_of_fats: u8,
    /// Total sectors on the volume.
    pub total_sectors: u32,
    /// Size of each FAT in sectors.
    pub sectors_per_fat: u32,
    /// Cluster id of the root directory (normally 2).
    pub root_directory_cluster_id: u32,
}

impl Fat32Header {
    /// Parse and validate a boot sector.
    ///
    /// Rejects sectors without the 0x55AA signature, volumes that are not
    /// FAT32 (a 16-bit FAT size or a nonzero root entry count), and
    /// geometry this implementation does not support: bytes_per_sector
    /// other than 512, or a cluster size that is not a whole number of
    /// pages.
    pub fn parse(sector: &[u8]) -> Result<Self, FsError> {
        assert!(sector.len() >= SECTOR_SIZE);

        let u16_at = |off: usize| u16::from_le_bytes([sector[off], sector[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([sector[off], sector[off + 1], sector[off + 2], sector[off + 3]])
        };

        if u16_at(510) != BOOT_SIGNATURE {
            log::debug!("boot sector signature missing; not a FAT volume");
            return Err(FsError::InvalidArgument);
        }

        let bytes_per_sector = u16_at(11);
        let sectors_per_cluster = sector[13];
        let reserved_sectors = u16_at(14);
        let number_of_fats = sector[16];
        let root_entry_count = u16_at(17);
        let fat_size_16 = u16_at(22);
        let total_sectors = u32_at(32);
        let sectors_per_fat = u32_at(36);
        let root_directory_cluster_id = u32_at(44);

        // FAT32 is distinguished by a zero 16-bit FAT size and no fixed
        // root directory region.
        if fat_size_16 != 0 || sectors_per_fat == 0 || root_entry_count != 0 {
            log::debug!("volume is not FAT32");
            return Err(FsError::InvalidArgument);
        }
        if bytes_per_sector as usize != SECTOR_SIZE {
            log::debug!("unsupported sector size {}", bytes_per_sector);
            return Err(FsError::InvalidArgument);
        }
        if sectors_per_cluster == 0 || number_of_fats == 0 || total_sectors == 0 {
            return Err(FsError::InvalidArgument);
        }

        let header = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            number_of_fats,
            total_sectors,
            sectors_per_fat,
            root_directory_cluster_id,
        };

        if header.cluster_size() % PAGE_SIZE != 0 {
            log::debug!(
                "cannot mount: cluster size {} is not a multiple of the page size {}",
                header.cluster_size(),
                PAGE_SIZE
            );
            return Err(FsError::InvalidArgument);
        }
        if header.num_data_clusters() == 0 {
            return Err(FsError::InvalidArgument);
        }

        Ok(header)
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    /// First sector of FAT copy #0.
    pub fn first_fat_sector(&self) -> u64 {
        self.reserved_sectors as u64
    }

    /// First sector of the data region (cluster id 2).
    pub fn first_data_sector(&self) -> u64 {
        self.reserved_sectors as u64 + self.number_of_fats as u64 * self.sectors_per_fat as u64
    }

    /// Number of clusters in the data region.
    pub fn num_data_clusters(&self) -> u32 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.first_data_sector());
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;

    #[test]
    fn test_parse_formatted_volume() {
        let image = testfs::format_image(testfs::TEST_TOTAL_SECTORS);
        let header = Fat32Header::parse(&image[..SECTOR_SIZE]).unwrap();

        assert_eq!(header.bytes_per_sector as usize, SECTOR_SIZE);
        assert_eq!(header.cluster_size(), 4096);
        assert_eq!(header.root_directory_cluster_id, 2);
        assert!(header.num_data_clusters() > 0);
        assert_eq!(
            header.first_data_sector(),
            header.first_fat_sector()
                + header.number_of_fats as u64 * header.sectors_per_fat as u64
        );
    }

    #[test]
    fn test_reject_missing_signature() {
        let mut image = testfs::format_image(testfs::TEST_TOTAL_SECTORS);
        image[510] = 0;
        assert_eq!(
            Fat32Header::parse(&image[..SECTOR_SIZE]),
            Err(FsError::InvalidArgument)
        );
    }

    #[test]
    fn test_reject_fat16_volume() {
        let mut image = testfs::format_image(testfs::TEST_TOTAL_SECTORS);
        image[22] = 0x20; // nonzero 16-bit FAT size marks FAT12/16
        assert_eq!(
            Fat32Header::parse(&image[..SECTOR_SIZE]),
            Err(FsError::InvalidArgument)
        );
    }

    #[test]
    fn test_reject_sub_page_cluster() {
        // 1 sector per cluster => 512-byte clusters, below the page size.
        let mut image = testfs::format_image(testfs::TEST_TOTAL_SECTORS);
        image[13] = 1;
        assert_eq!(
            Fat32Header::parse(&image[..SECTOR_SIZE]),
            Err(FsError::InvalidArgument)
        );
    }
}
