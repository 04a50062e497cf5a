// Volume geometry and block I/O
// Translates sector and cluster indices into byte offsets on the
// backing device. Cluster 0 and 1 do not exist in the heap; the first
// addressable cluster is 2.

use log::debug;

use fatscope_core::{Device, FatscopeError};

pub const FIRST_CLUSTER: u32 = 2;

/// Geometry of an open volume, shared by both dialects.
pub struct Volume {
    device: Device,
    /// Bytes per sector, power of two, >= 512.
    pub sector_size: u32,
    /// Bytes per cluster, power-of-two multiple of the sector size.
    pub cluster_size: u32,
    /// Number of clusters in the cluster heap.
    pub cluster_count: u32,
    /// First sector of the FAT region.
    pub fat_offset: u32,
    /// Length of the FAT region in sectors (all FAT copies).
    pub fat_sectors: u32,
    /// First sector of the cluster heap.
    pub heap_offset: u32,
    /// First cluster of the root directory; 0 means the root is the
    /// fixed sector run of a FAT12/16 volume.
    pub root_cluster: u32,
    /// Length of the fixed root run in sectors (FAT12/16 only).
    pub root_sectors: u32,
}

impl Volume {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            sector_size: 0,
            cluster_size: 0,
            cluster_count: 0,
            fat_offset: 0,
            fat_sectors: 0,
            heap_offset: 0,
            root_cluster: 0,
            root_sectors: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Entries of 32 bytes per cluster.
    pub fn entries_per_cluster(&self) -> usize {
        self.cluster_size as usize / crate::DENTRY_SIZE
    }

    /// Raw byte window read; used for the boot sector and for FAT12
    /// entries that straddle a sector boundary.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FatscopeError> {
        self.device.read_at(offset, buf)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FatscopeError> {
        self.device.write_at(offset, data)
    }

    pub fn read_sectors(&mut self, sector: u64, count: u32) -> Result<Vec<u8>, FatscopeError> {
        let mut buf = vec![0u8; (count * self.sector_size) as usize];
        self.device.read_at(sector * self.sector_size as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<(), FatscopeError> {
        self.device.write_at(sector * self.sector_size as u64, data)
    }

    fn check_cluster_range(&self, cluster: u32, count: u32) -> Result<(), FatscopeError> {
        if cluster < FIRST_CLUSTER || cluster as u64 + count as u64 > self.cluster_count as u64 {
            return Err(FatscopeError::InvalidCluster(cluster));
        }
        Ok(())
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.heap_offset as u64 * self.sector_size as u64
            + (cluster - FIRST_CLUSTER) as u64 * self.cluster_size as u64
    }

    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, FatscopeError> {
        self.read_clusters(cluster, 1)
    }

    pub fn read_clusters(&mut self, cluster: u32, count: u32) -> Result<Vec<u8>, FatscopeError> {
        self.check_cluster_range(cluster, count)?;
        debug!("read cluster {} (+{})", cluster, count);
        let mut buf = vec![0u8; (count * self.cluster_size) as usize];
        self.device.read_at(self.cluster_offset(cluster), &mut buf)?;
        Ok(buf)
    }

    pub fn write_cluster(&mut self, cluster: u32, data: &[u8]) -> Result<(), FatscopeError> {
        self.check_cluster_range(cluster, 1)?;
        debug!("write cluster {}", cluster);
        self.device
            .write_at(self.cluster_offset(cluster), &data[..self.cluster_size as usize])
    }

    pub fn write_clusters(&mut self, cluster: u32, data: &[u8]) -> Result<(), FatscopeError> {
        let count = (data.len() as u32).div_ceil(self.cluster_size);
        self.check_cluster_range(cluster, count)?;
        debug!("write cluster {} (+{})", cluster, count);
        self.device.write_at(self.cluster_offset(cluster), data)
    }
}

/// Round a byte length up to whole clusters.
pub fn cluster_span(len: u64, cluster_size: u32) -> u32 {
    len.div_ceil(cluster_size as u64) as u32
}
