// FAT12/16/32 dialect
// One implementation covers all three table widths; the differences are
// the entry packing (12-bit entries straddle byte pairs), the
// end-of-chain thresholds, and the fixed root directory run on
// FAT12/16.

pub mod structures;

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use rand::Rng;

use fatscope_core::{Device, FatscopeError};

use crate::dircache::{DirectoryCache, FileRecord};
use crate::fat_common::{
    attributes::*, display_name_checksum, long_names, parse_short_name, short_name_checksum,
    tail_of, timestamps, DENTRY_DELETED, DENTRY_UNUSED,
};
use crate::nls;
use crate::ops::{CreateOptions, DirEntryInfo, FileStat, FilesystemOps};
use crate::volume::{cluster_span, Volume, FIRST_CLUSTER};
use crate::{DENTRY_SIZE, MAX_NAME_LENGTH};

use self::structures::*;

// Cluster-count classification bounds.
const FAT12_MAX_CLUSTERS: u32 = 4084;
const FAT16_MAX_CLUSTERS: u32 = 65524;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    /// Entries at or above this value terminate a chain.
    pub fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub fn bad_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    pub fn last_cluster(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }
}

/// Geometry extracted from a validated FAT boot sector.
pub(crate) struct FatGeometry {
    pub fat_type: FatType,
    pub sector_size: u32,
    pub cluster_size: u32,
    pub cluster_count: u32,
    pub fat_offset: u32,
    pub fat_sectors: u32,
    pub root_sectors: u32,
    pub root_cluster: u32,
}

/// Validate sector 0 as a FAT12/16/32 boot sector and classify the
/// dialect by cluster count. `None` means this is not a FAT image.
pub(crate) fn probe(sector: &[u8]) -> Option<FatGeometry> {
    let boot = read_boot_sector_16(sector);
    let bpb = boot.bpb;

    let bytes_per_sector = bpb.bytes_per_sector;
    let sectors_per_cluster = bpb.sectors_per_cluster;
    let reserved = bpb.reserved_sectors;
    let num_fats = bpb.num_fats;
    let media = bpb.media_descriptor;

    if reserved == 0 {
        debug!("invalid reserved sector count: {}", reserved);
        return None;
    }
    if num_fats == 0 {
        debug!("invalid FAT count: {}", num_fats);
        return None;
    }
    if media != 0xF0 && media < 0xF8 {
        debug!("invalid media descriptor: {:#x}", media);
        return None;
    }
    let sector_units = bytes_per_sector / 512;
    if !sector_units.is_power_of_two() || sector_units > 8 {
        debug!("invalid sector size: {}", bytes_per_sector);
        return None;
    }
    if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128 {
        debug!("invalid cluster size: {}", sectors_per_cluster);
        return None;
    }

    let fat_size = if bpb.sectors_per_fat_16 != 0 {
        bpb.sectors_per_fat_16 as u32
    } else {
        let boot32 = read_boot_sector_32(sector);
        boot32.ext.sectors_per_fat_32
    };
    let total_sectors = if bpb.total_sectors_16 != 0 {
        bpb.total_sectors_16 as u32
    } else {
        bpb.total_sectors_32
    };

    let root_sectors = ((bpb.root_entries as u32 * DENTRY_SIZE as u32)
        + (bytes_per_sector as u32 - 1))
        / bytes_per_sector as u32;
    let fat_sectors = num_fats as u32 * fat_size;
    let data_sectors =
        total_sectors.checked_sub(reserved as u32 + fat_sectors + root_sectors)?;
    let cluster_count = data_sectors / sectors_per_cluster as u32;

    let fat_type = if cluster_count < FAT12_MAX_CLUSTERS {
        FatType::Fat12
    } else if cluster_count < FAT16_MAX_CLUSTERS {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let root_cluster = if fat_type == FatType::Fat32 {
        read_boot_sector_32(sector).ext.root_cluster
    } else {
        0
    };

    Some(FatGeometry {
        fat_type,
        sector_size: bytes_per_sector as u32,
        cluster_size: sectors_per_cluster as u32 * bytes_per_sector as u32,
        cluster_count,
        fat_offset: reserved as u32,
        fat_sectors,
        root_sectors,
        root_cluster,
    })
}

pub struct FatFilesystem {
    vol: Volume,
    fat_type: FatType,
    cache: DirectoryCache,
    volume_label: Option<String>,
}

impl FatFilesystem {
    pub(crate) fn new(device: Device, geo: FatGeometry) -> Self {
        let mut vol = Volume::new(device);
        vol.sector_size = geo.sector_size;
        vol.cluster_size = geo.cluster_size;
        vol.cluster_count = geo.cluster_count;
        vol.fat_offset = geo.fat_offset;
        vol.fat_sectors = geo.fat_sectors;
        vol.heap_offset = geo.fat_offset + geo.fat_sectors + geo.root_sectors;
        vol.root_cluster = geo.root_cluster;
        vol.root_sectors = geo.root_sectors;

        let mut cache = DirectoryCache::new();
        cache.insert(
            geo.root_cluster,
            FileRecord {
                name: "/".to_string(),
                name_len: 1,
                attr: ATTR_DIRECTORY,
                ..Default::default()
            },
        );

        Self {
            vol,
            fat_type: geo.fat_type,
            cache,
            volume_label: None,
        }
    }

    // ---------------------------------------------------------------
    // FAT entries
    // ---------------------------------------------------------------

    fn check_fat_index(&self, cluster: u32) -> Result<(), FatscopeError> {
        if cluster < FIRST_CLUSTER || cluster > self.vol.cluster_count + 1 {
            return Err(FatscopeError::InvalidCluster(cluster));
        }
        Ok(())
    }

    fn fat_entry_offset(&self, cluster: u32) -> u64 {
        let base = self.vol.fat_offset as u64 * self.vol.sector_size as u64;
        match self.fat_type {
            FatType::Fat12 => base + cluster as u64 + cluster as u64 / 2,
            FatType::Fat16 => base + cluster as u64 * 2,
            FatType::Fat32 => base + cluster as u64 * 4,
        }
    }

    fn fat_entry(&mut self, cluster: u32) -> Result<u32, FatscopeError> {
        self.check_fat_index(cluster)?;
        let offset = self.fat_entry_offset(cluster);
        match self.fat_type {
            FatType::Fat12 => {
                // 12-bit entries straddle a byte pair; odd clusters use
                // the high nibble of the first byte.
                let mut pair = [0u8; 2];
                self.vol.read_at(offset, &mut pair)?;
                Ok(if cluster % 2 != 0 {
                    (pair[0] as u32 >> 4) | ((pair[1] as u32) << 4)
                } else {
                    pair[0] as u32 | ((pair[1] as u32 & 0x0F) << 8)
                })
            }
            FatType::Fat16 => {
                let mut raw = [0u8; 2];
                self.vol.read_at(offset, &mut raw)?;
                Ok(LittleEndian::read_u16(&raw) as u32)
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                self.vol.read_at(offset, &mut raw)?;
                Ok(LittleEndian::read_u32(&raw) & 0x0FFF_FFFF)
            }
        }
    }

    fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FatscopeError> {
        self.check_fat_index(cluster)?;
        let offset = self.fat_entry_offset(cluster);
        match self.fat_type {
            FatType::Fat12 => {
                let mut pair = [0u8; 2];
                self.vol.read_at(offset, &mut pair)?;
                if cluster % 2 != 0 {
                    pair[0] = (pair[0] & 0x0F) | ((value as u8) << 4);
                    pair[1] = (value >> 4) as u8;
                } else {
                    pair[0] = value as u8;
                    pair[1] = (pair[1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
                }
                self.vol.write_at(offset, &pair)
            }
            FatType::Fat16 => {
                let mut raw = [0u8; 2];
                LittleEndian::write_u16(&mut raw, value as u16);
                self.vol.write_at(offset, &raw)
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                LittleEndian::write_u32(&mut raw, value & 0x0FFF_FFFF);
                self.vol.write_at(offset, &raw)
            }
        }
    }

    /// Whether a FAT entry value terminates a chain (free, reserved or
    /// end-of-chain).
    fn chain_ended(&self, value: u32) -> bool {
        value < FIRST_CLUSTER || value >= self.fat_type.end_of_chain()
    }

    // ---------------------------------------------------------------
    // Cluster chains
    // ---------------------------------------------------------------

    /// The clusters of a chain, in order, capped at `cluster_count`
    /// hops so a corrupt cyclic chain cannot spin forever.
    fn chain_clusters(&mut self, start: u32) -> Result<Vec<u32>, FatscopeError> {
        let mut clusters = vec![start];
        let mut current = start;
        for _ in 0..self.vol.cluster_count {
            let next = self.fat_entry(current)?;
            if self.chain_ended(next) {
                return Ok(clusters);
            }
            clusters.push(next);
            current = next;
        }
        Err(FatscopeError::Corrupt(format!(
            "cluster chain from {} exceeds the cluster count",
            start
        )))
    }

    fn last_cluster_of_chain(&mut self, start: u32) -> Result<u32, FatscopeError> {
        Ok(*self.chain_clusters(start)?.last().unwrap())
    }

    /// Extend the chain that ends after `first` by `count` clusters,
    /// scanning for free entries from the last cluster upward with
    /// wrap-around. Links are written end-of-chain first.
    fn alloc_clusters(&mut self, first: u32, count: u32) -> Result<u32, FatscopeError> {
        let last = self.last_cluster_of_chain(first)?;
        let mut tail = last;
        let mut remaining = count;
        let mut candidate = last;

        loop {
            candidate += 1;
            if candidate > self.vol.cluster_count - 1 {
                candidate = FIRST_CLUSTER;
            }
            if candidate == last {
                break;
            }
            if self.fat_entry(candidate)? != 0 {
                continue;
            }
            self.set_fat_entry(candidate, self.fat_type.last_cluster())?;
            self.set_fat_entry(tail, candidate)?;
            tail = candidate;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 {
            return Err(FatscopeError::Exhausted);
        }
        Ok(count)
    }

    /// Drop the last `count` clusters of the chain starting at `first`:
    /// the new tail is marked end-of-chain, the dropped entries are
    /// zeroed.
    fn free_clusters(&mut self, first: u32, count: u32) -> Result<(), FatscopeError> {
        let clusters = self.chain_clusters(first)?;
        if count == 0 || clusters.len() <= count as usize {
            return Ok(());
        }
        let keep = clusters.len() - count as usize;
        self.set_fat_entry(clusters[keep - 1], self.fat_type.last_cluster())?;
        for &clu in &clusters[keep..] {
            self.set_fat_entry(clu, 0)?;
        }
        Ok(())
    }

    /// Allocate a fresh chain of `count` clusters not linked to any
    /// file. Returns its first cluster.
    fn new_clusters(&mut self, count: u32) -> Result<u32, FatscopeError> {
        let mut first = 0u32;
        let mut tail = 0u32;
        let mut remaining = count;

        for clu in FIRST_CLUSTER..self.vol.cluster_count {
            if self.fat_entry(clu)? != 0 {
                continue;
            }
            self.set_fat_entry(clu, self.fat_type.last_cluster())?;
            if first == 0 {
                first = clu;
            } else {
                self.set_fat_entry(tail, clu)?;
            }
            tail = clu;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 {
            return Err(FatscopeError::Exhausted);
        }
        Ok(first)
    }

    // ---------------------------------------------------------------
    // Directory extents
    // ---------------------------------------------------------------

    fn root_run_sector(&self) -> u64 {
        (self.vol.fat_offset + self.vol.fat_sectors) as u64
    }

    /// Read a directory's whole extent: the fixed root run when
    /// `cluster` is 0, the concatenated cluster chain otherwise.
    fn read_extent(&mut self, cluster: u32) -> Result<Vec<u8>, FatscopeError> {
        if cluster == 0 {
            let sector = self.root_run_sector();
            let count = self.vol.root_sectors;
            return self.vol.read_sectors(sector, count);
        }
        let clusters = self.chain_clusters(cluster)?;
        let mut data = Vec::with_capacity(clusters.len() * self.vol.cluster_size as usize);
        for clu in clusters {
            data.extend_from_slice(&self.vol.read_cluster(clu)?);
        }
        Ok(data)
    }

    fn write_extent(&mut self, cluster: u32, data: &[u8]) -> Result<(), FatscopeError> {
        if cluster == 0 {
            let sector = self.root_run_sector();
            return self.vol.write_sectors(sector, data);
        }
        let clusters = self.chain_clusters(cluster)?;
        let size = self.vol.cluster_size as usize;
        for (i, clu) in clusters.iter().enumerate() {
            let start = i * size;
            if start >= data.len() {
                break;
            }
            self.vol.write_cluster(*clu, &data[start..start + size])?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Directory decoding
    // ---------------------------------------------------------------

    fn traverse_directory(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        let index = self
            .cache
            .position(cluster)
            .ok_or_else(|| FatscopeError::NotFound(format!("directory cluster {}", cluster)))?;
        if self.cache.chain(index).record.cached {
            debug!("directory {} already traversed", cluster);
            return Ok(());
        }

        let data = self.read_extent(cluster)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut i = 0usize;

        while i < entries {
            let rec = &data[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE];
            let first = rec[0];
            if first == DENTRY_UNUSED {
                break;
            }
            if first == DENTRY_DELETED {
                i += 1;
                continue;
            }

            let attr = rec[11];
            if attr == ATTR_VOLUME_ID as u8 {
                let label: Vec<u8> = rec[..11].to_vec();
                self.volume_label =
                    Some(String::from_utf8_lossy(&label).trim_end().to_string());
                i += 1;
                continue;
            }

            let mut uniname = Vec::new();
            let mut name_len = 0usize;
            if attr == ATTR_LONG_FILE_NAME {
                let ord = (first & !long_names::LAST_LONG_ENTRY) as usize;
                if i + ord >= entries {
                    warn!("long-name set at record {} runs past the directory", i);
                    break;
                }
                // Fragments are stored highest ordinal first; walk them
                // back to front to assemble the name in order.
                for j in 0..ord {
                    let source = (i + ord - j - 1) * DENTRY_SIZE;
                    let frag =
                        long_names::lfn_fragment(&data[source..source + DENTRY_SIZE]);
                    uniname.extend_from_slice(&frag);
                    name_len += long_names::LFN_CHARS;
                }
                i += ord;
            }

            let entry =
                FatDirEntry::from_bytes(&data[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE]);
            self.create_fileinfo(index, &entry, &uniname, name_len);
            i += 1;
        }

        self.cache.chain_mut(index).record.cached = true;
        Ok(())
    }

    fn create_fileinfo(
        &mut self,
        parent: usize,
        entry: &FatDirEntry,
        uniname: &[u16],
        name_len: usize,
    ) {
        let short_display = parse_short_name(&entry.name);
        let key = display_name_checksum(&short_display) as u32;

        let long_name = if name_len > 0 {
            let units: Vec<u16> = uniname
                .iter()
                .copied()
                .take_while(|&u| u != 0x0000 && u != 0xFFFF)
                .collect();
            Some(nls::utf16_to_string(&units))
        } else {
            None
        };

        let record = FileRecord {
            name: long_name.clone().unwrap_or_else(|| short_display.clone()),
            name_len: long_name.as_deref().map_or(0, |n| n.chars().count()),
            short_name: short_display,
            data_len: entry.file_size as u64,
            attr: entry.attributes as u16,
            flags: 0,
            key,
            first_cluster: entry.first_cluster(),
            ctime: timestamps::dos_to_timestamp(
                entry.creation_date,
                entry.creation_time,
                entry.creation_time_tenth,
            ),
            atime: timestamps::dos_to_timestamp(entry.last_access_date, 0, 0),
            mtime: timestamps::dos_to_timestamp(entry.write_date, entry.write_time, 0),
            cached: false,
            parent: Some(parent),
        };

        let is_directory = record.attr & ATTR_DIRECTORY != 0;
        let first_cluster = record.first_cluster;
        let dir_record = record.clone();
        self.cache.chain_mut(parent).children.push(record);

        if is_directory && !self.cache.contains(first_cluster) {
            self.cache.insert(first_cluster, dir_record);
        }
    }

    /// Find a child of the traversed directory at `index` by decoded
    /// name (long name when present, 8.3 display form otherwise).
    fn find_child_by_name(&self, index: usize, name: &str) -> Option<&FileRecord> {
        self.cache
            .chain(index)
            .children
            .iter()
            .find(|c| c.name == name || (!c.short_name.is_empty() && c.short_name == name))
    }

    fn traversed_index(&mut self, cluster: u32) -> Result<usize, FatscopeError> {
        self.traverse_directory(cluster)?;
        Ok(self.cache.position(cluster).unwrap())
    }

    // ---------------------------------------------------------------
    // Entry construction
    // ---------------------------------------------------------------

    fn init_dentry(short: &[u8; 11]) -> FatDirEntry {
        let (now, _) = timestamps::now_utc();
        let (date, time, tenth) = timestamps::timestamp_to_dos(now);
        let mut entry = FatDirEntry::from_bytes(&[0u8; DENTRY_SIZE]);
        entry.name = *short;
        entry.attributes = ATTR_ARCHIVE as u8;
        entry.nt_reserved = 0;
        entry.creation_time_tenth = tenth;
        entry.creation_time = time;
        entry.creation_date = date;
        entry.last_access_date = date;
        entry.write_time = time;
        entry.write_date = date;
        entry.set_first_cluster(0);
        entry.file_size = 0;
        entry
    }

    fn random_short_name() -> [u8; 11] {
        const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut rng = rand::thread_rng();
        let mut name = [0u8; 11];
        for b in name.iter_mut() {
            *b = CHARSET[rng.gen_range(0..CHARSET.len())];
        }
        name
    }

    fn encode_name(name: &str) -> Result<(Vec<u16>, [u8; 11], bool), FatscopeError> {
        let longname = nls::utf8_to_utf16(name.as_bytes());
        if longname.len() > MAX_NAME_LENGTH {
            return Err(FatscopeError::Corrupt(format!(
                "name longer than {} UTF-16 units",
                MAX_NAME_LENGTH
            )));
        }
        let (short, lossy) = long_names::make_short_name(&longname);
        Ok((longname, short, lossy))
    }
}

impl FilesystemOps for FatFilesystem {
    fn statfs(&mut self, out: &mut dyn Write) -> Result<(), FatscopeError> {
        let sector = self.vol.read_sectors(0, 1)?;
        let boot = read_boot_sector_16(&sector);
        let bpb = boot.bpb;

        writeln!(out, "Sector size:     \t{}", self.vol.sector_size)?;
        writeln!(out, "Cluster size:    \t{}", self.vol.cluster_size)?;
        writeln!(out, "FAT offset:      \t{}", { bpb.reserved_sectors })?;
        writeln!(
            out,
            "FAT size:        \t{}",
            self.vol.fat_sectors as u64 * self.vol.sector_size as u64
        )?;
        writeln!(out, "FAT count:       \t{}", { bpb.num_fats })?;
        writeln!(out, "Dentry count:    \t{}", { bpb.root_entries })?;
        let total_sectors = if bpb.total_sectors_16 != 0 {
            bpb.total_sectors_16 as u32
        } else {
            bpb.total_sectors_32
        };
        writeln!(out, "Sector count:    \t{}", total_sectors)?;
        writeln!(out, "Cluster count:   \t{}", self.vol.cluster_count)?;

        match self.fat_type {
            FatType::Fat12 | FatType::Fat16 => {
                let ext = boot.ext;
                let fs_type = String::from_utf8_lossy(&ext.fs_type).into_owned();
                if !fs_type.starts_with("FAT") {
                    warn!("filesystem type field reads {:?}", fs_type);
                } else {
                    writeln!(out, "Filesystem type:\t{}", fs_type)?;
                }
                writeln!(out, "Volume ID:      \t{:08x}", { ext.volume_id })?;
                writeln!(
                    out,
                    "Volume name:    \t{}",
                    String::from_utf8_lossy(&ext.volume_label)
                )?;
            }
            FatType::Fat32 => {
                let boot32 = read_boot_sector_32(&sector);
                let ext = boot32.ext;
                let fs_type = String::from_utf8_lossy(&ext.fs_type).into_owned();
                if !fs_type.starts_with("FAT32") {
                    warn!("filesystem type field reads {:?}", fs_type);
                } else {
                    writeln!(out, "Filesystem type:\t{}", fs_type)?;
                }
                writeln!(out, "Volume ID:      \t{:08x}", { ext.volume_id })?;
                writeln!(
                    out,
                    "Volume name:    \t{}",
                    String::from_utf8_lossy(&ext.volume_label)
                )?;
                writeln!(out, "Sectors per FAT:\t{}", { ext.sectors_per_fat_32 })?;
                writeln!(out, "Root cluster:   \t{}", { ext.root_cluster })?;
                writeln!(out, "FSINFO sector:  \t{}", { ext.fs_info })?;
                writeln!(out, "Backup sector:  \t{}", { ext.backup_boot_sector })?;

                let fsinfo_raw = self.vol.read_sectors(ext.fs_info as u64, 1)?;
                let fsinfo = read_fsinfo(&fsinfo_raw);
                if !fsinfo.signatures_valid() {
                    warn!("FSInfo signatures do not match the expected values");
                }
                writeln!(out, "Free clusters:  \t{}", { fsinfo.free_count })?;
                writeln!(out, "Next free:      \t{}", { fsinfo.next_free })?;
            }
        }
        writeln!(out)?;
        Ok(())
    }

    fn info(&mut self, out: &mut dyn Write) -> Result<(), FatscopeError> {
        self.traverse_directory(self.vol.root_cluster)?;

        match &self.volume_label {
            Some(label) => writeln!(out, "volume Label: {}", label)?,
            None => writeln!(out, "volume Label:")?,
        }

        // Chain leaders: mark every entry destination as reached so the
        // remaining unmarked clusters head the printable chains.
        let count = self.vol.cluster_count;
        let mut reached = vec![false; count as usize];
        for clu in FIRST_CLUSTER..count {
            if reached[clu as usize] {
                continue;
            }
            let entry = self.fat_entry(clu)?;
            if entry == 0 {
                reached[clu as usize] = true;
                continue;
            }
            if entry >= FIRST_CLUSTER && entry < count {
                reached[entry as usize] = true;
                reached[clu as usize] = false;
            } else {
                reached[clu as usize] = true;
            }
        }

        writeln!(out, "FAT:")?;
        for clu in FIRST_CLUSTER..count {
            if reached[clu as usize] {
                continue;
            }
            write!(out, "{}", clu)?;
            let mut current = clu;
            for _ in 0..count {
                let next = self.fat_entry(current)?;
                if self.chain_ended(next) {
                    break;
                }
                write!(out, " -> {}", next)?;
                current = next;
            }
            writeln!(out)?;
        }

        // Derived allocation view: a cluster is free iff its entry is 0.
        writeln!(out, "Allocation Bitmap:")?;
        writeln!(out, "Offset    0 1 2 3 4 5 6 7 8 9 a b c d e f")?;
        write!(out, "{:08x}  - - ", 0)?;
        for clu in FIRST_CLUSTER..count {
            if clu % 0x10 == 0 {
                write!(out, "{:08x}  ", clu)?;
            }
            let used = self.fat_entry(clu)? != 0;
            write!(out, "{} ", if used { 'o' } else { '-' })?;
            if clu % 0x10 == 0xF {
                writeln!(out)?;
            }
        }
        writeln!(out)?;
        Ok(())
    }

    fn lookup(&mut self, dir: u32, path: &str) -> Result<u32, FatscopeError> {
        let mut cluster = if path.starts_with('/') {
            debug!("absolute path {:?}, restarting from the root", path);
            self.vol.root_cluster
        } else {
            dir
        };

        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if components.len() > MAX_NAME_LENGTH {
            return Err(FatscopeError::NotFound(format!(
                "path deeper than {} components",
                MAX_NAME_LENGTH
            )));
        }

        for component in components {
            debug!("lookup {:?} in cluster {}", component, cluster);
            let index = self.traversed_index(cluster)?;
            match self.find_child_by_name(index, component) {
                Some(child) => cluster = child.first_cluster,
                None => return Err(FatscopeError::NotFound(path.to_string())),
            }
        }
        Ok(cluster)
    }

    fn readdir(&mut self, dir: u32) -> Result<Vec<DirEntryInfo>, FatscopeError> {
        let index = self.traversed_index(dir)?;
        Ok(self
            .cache
            .chain(index)
            .children
            .iter()
            .map(|c| DirEntryInfo {
                name: c.name.clone(),
                name_len: if c.name_len > 0 { c.name_len } else { 11 },
                data_len: c.data_len,
                attr: c.attr,
                ctime: c.ctime,
                atime: c.atime,
                mtime: c.mtime,
            })
            .collect())
    }

    fn reload(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let index = self
            .cache
            .position(dir)
            .ok_or_else(|| FatscopeError::NotFound(format!("directory cluster {}", dir)))?;
        self.cache.release_children(index);
        self.traverse_directory(dir)
    }

    fn convert(&mut self, _src: &str) -> Result<String, FatscopeError> {
        Err(FatscopeError::Unimplemented(
            "upcase conversion is an exFAT feature",
        ))
    }

    fn clean(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let index = self
            .cache
            .position(dir)
            .ok_or_else(|| FatscopeError::NotFound(format!("directory cluster {}", dir)))?;
        self.cache.remove_chain(index);
        Ok(())
    }

    fn set_fat(&mut self, cluster: u32, value: u32) -> Result<(), FatscopeError> {
        self.set_fat_entry(cluster, value)
    }

    fn get_fat(&mut self, cluster: u32) -> Result<u32, FatscopeError> {
        self.fat_entry(cluster)
    }

    fn validate_fat(&mut self, value: u32) -> bool {
        if value == self.fat_type.bad_cluster() {
            return false;
        }
        if value == self.fat_type.last_cluster() {
            return true;
        }
        (FIRST_CLUSTER..=self.vol.cluster_count).contains(&value)
    }

    fn dentry(
        &mut self,
        out: &mut dyn Write,
        dir: u32,
        index: usize,
    ) -> Result<(), FatscopeError> {
        self.traverse_directory(dir)?;

        let mut cluster = dir;
        let mut n = index;
        let data = if cluster == 0 {
            self.read_extent(0)?
        } else {
            let per_cluster = self.vol.entries_per_cluster();
            while n >= per_cluster {
                let next = self.fat_entry(cluster)?;
                if self.chain_ended(next) {
                    return Err(FatscopeError::Corrupt(
                        "directory record index exceeds the extent".to_string(),
                    ));
                }
                n -= per_cluster;
                cluster = next;
            }
            self.vol.read_cluster(cluster)?
        };

        if (n + 1) * DENTRY_SIZE > data.len() {
            return Err(FatscopeError::Corrupt(
                "directory record index exceeds the extent".to_string(),
            ));
        }
        let raw = &data[n * DENTRY_SIZE..(n + 1) * DENTRY_SIZE];
        let ord = raw[0];
        if ord == DENTRY_UNUSED || ord == DENTRY_DELETED {
            return Ok(());
        }

        if raw[11] == ATTR_LONG_FILE_NAME {
            let lfn = LfnDirEntry::from_bytes(raw);
            writeln!(out, "LDIR_Ord                        : {:02x}", { lfn.ordinal })?;
            write!(out, "LDIR_Name1                      : ")?;
            for b in &raw[1..11] {
                write!(out, "{:02x}", b)?;
            }
            writeln!(out)?;
            writeln!(out, "LDIR_Attr                       : {:02x}", { lfn.attributes })?;
            writeln!(out, "LDIR_Type                       : {:02x}", { lfn.entry_type })?;
            writeln!(out, "LDIR_Chksum                     : {:02x}", { lfn.checksum })?;
            write!(out, "LDIR_Name2                      : ")?;
            for b in &raw[14..26] {
                write!(out, "{:02x}", b)?;
            }
            writeln!(out)?;
            writeln!(out, "LDIR_FstClusLO                  : {:04x}", {
                lfn.first_cluster_low
            })?;
            write!(out, "LDIR_Name3                      : ")?;
            for b in &raw[28..32] {
                write!(out, "{:02x}", b)?;
            }
            writeln!(out)?;
            return Ok(());
        }

        let entry = FatDirEntry::from_bytes(raw);
        write!(out, "DIR_Name                        : ")?;
        for b in &entry.name {
            write!(out, "{:02x}", b)?;
        }
        writeln!(out)?;
        writeln!(out, "DIR_Attr                        : {:02x}", { entry.attributes })?;
        let attr = entry.attributes as u16;
        for (bit, label) in [
            (ATTR_READ_ONLY, "ReadOnly"),
            (ATTR_HIDDEN, "Hidden"),
            (ATTR_SYSTEM, "System"),
            (ATTR_VOLUME_ID, "Volume"),
            (ATTR_DIRECTORY, "Directory"),
            (ATTR_ARCHIVE, "Archive"),
        ] {
            if attr & bit != 0 {
                writeln!(out, "  * {}", label)?;
            }
        }
        writeln!(out, "DIR_NTRes                       : {:02x}", { entry.nt_reserved })?;
        writeln!(out, "DIR_CrtTimeTenth                : {:02x}", {
            entry.creation_time_tenth
        })?;
        writeln!(out, "DIR_CrtTime                     : {:04x}", { entry.creation_time })?;
        writeln!(out, "DIR_CrtDate                     : {:04x}", { entry.creation_date })?;
        let ctime = timestamps::dos_to_timestamp(
            entry.creation_date,
            entry.creation_time,
            entry.creation_time_tenth,
        );
        writeln!(out, "  {}", ctime)?;
        writeln!(out, "DIR_LstAccDate                  : {:04x}", {
            entry.last_access_date
        })?;
        writeln!(out, "DIR_FstClusHI                   : {:04x}", {
            entry.first_cluster_high
        })?;
        writeln!(out, "DIR_WrtTime                     : {:04x}", { entry.write_time })?;
        writeln!(out, "DIR_WrtDate                     : {:04x}", { entry.write_date })?;
        let mtime = timestamps::dos_to_timestamp(entry.write_date, entry.write_time, 0);
        writeln!(out, "  {}", mtime)?;
        writeln!(out, "DIR_FstClusLO                   : {:04x}", {
            entry.first_cluster_low
        })?;
        writeln!(out, "DIR_FileSize                    : {:08x}", { entry.file_size })?;
        Ok(())
    }

    fn alloc(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        if self.fat_entry(cluster)? != 0 {
            warn!("cluster {} is already allocated", cluster);
            return Ok(());
        }
        self.set_fat_entry(cluster, self.fat_type.last_cluster())
    }

    fn release(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        if self.fat_entry(cluster)? == 0 {
            warn!("cluster {} is already free", cluster);
            return Ok(());
        }
        self.set_fat_entry(cluster, 0)
    }

    fn create(&mut self, name: &str, dir: u32, opts: CreateOptions) -> Result<(), FatscopeError> {
        let (longname, short, lossy) = Self::encode_name(name)?;
        let lfn_records = if lossy {
            long_names::build_lfn_records(&longname, &short)
        } else {
            Vec::new()
        };
        let total_records = lfn_records.len() + 1;

        let index = self.traversed_index(dir)?;
        if self.find_child_by_name(index, name).is_some() {
            return Err(FatscopeError::Exists(name.to_string()));
        }

        let mut data = self.read_extent(dir)?;
        let mut entries = data.len() / DENTRY_SIZE;
        let mut slot = 0;
        while slot < entries && data[slot * DENTRY_SIZE] != DENTRY_UNUSED {
            slot += 1;
        }

        let needed_bytes = (slot + total_records + 1) * DENTRY_SIZE;
        if dir != 0 {
            let have = cluster_span(data.len() as u64, self.vol.cluster_size);
            let need = cluster_span(needed_bytes as u64, self.vol.cluster_size);
            if need > have {
                self.alloc_clusters(dir, need - have)?;
                data = self.read_extent(dir)?;
                entries = data.len() / DENTRY_SIZE;
            }
        } else if needed_bytes > data.len() {
            warn!("no room left in the fixed root directory");
            return Err(FatscopeError::Exhausted);
        }
        debug_assert!(slot + total_records <= entries);

        for (k, rec) in lfn_records.iter().enumerate() {
            let off = (slot + k) * DENTRY_SIZE;
            data[off..off + DENTRY_SIZE].copy_from_slice(rec);
        }

        let mut entry = Self::init_dentry(&short);
        if opts.directory {
            entry.attributes = ATTR_DIRECTORY as u8;
            let first = self.new_clusters(1)?;
            entry.set_first_cluster(first);
        }
        let off = (slot + lfn_records.len()) * DENTRY_SIZE;
        data[off..off + DENTRY_SIZE].copy_from_slice(&entry.to_bytes());

        self.write_extent(dir, &data)
    }

    fn remove(&mut self, name: &str, dir: u32) -> Result<(), FatscopeError> {
        let (_, short, _) = Self::encode_name(name)?;
        let checksum = short_name_checksum(&short);

        let mut data = self.read_extent(dir)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut found = false;
        let mut i = 0usize;

        while i < entries {
            let off = i * DENTRY_SIZE;
            let first = data[off];
            if first == DENTRY_UNUSED {
                break;
            }
            if first == DENTRY_DELETED {
                i += 1;
                continue;
            }

            if data[off + 11] == ATTR_LONG_FILE_NAME {
                let ord = (first & !long_names::LAST_LONG_ENTRY) as usize;
                if data[off + 13] != checksum || i + ord >= entries {
                    i += ord + 1;
                    continue;
                }
                // The whole set goes: every long-name record plus the
                // companion short record.
                for j in 0..=ord {
                    data[(i + j) * DENTRY_SIZE] = DENTRY_DELETED;
                }
                found = true;
                i += ord + 1;
                continue;
            }

            if &data[off..off + 11] == short.as_slice() {
                data[off] = DENTRY_DELETED;
                found = true;
            }
            i += 1;
        }

        if !found {
            return Err(FatscopeError::NotFound(name.to_string()));
        }
        self.write_extent(dir, &data)
    }

    fn trim(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let mut data = self.read_extent(dir)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut kept = 0usize;

        for i in 0..entries {
            let off = i * DENTRY_SIZE;
            if data[off] == DENTRY_UNUSED {
                break;
            }
            if data[off] == DENTRY_DELETED {
                continue;
            }
            if i != kept {
                let (dst, src) = data.split_at_mut(i * DENTRY_SIZE);
                dst[kept * DENTRY_SIZE..kept * DENTRY_SIZE + DENTRY_SIZE]
                    .copy_from_slice(&src[..DENTRY_SIZE]);
            }
            kept += 1;
        }
        for i in kept..entries {
            data[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE].fill(0);
        }

        self.write_extent(dir, &data)?;

        if dir != 0 {
            let have = cluster_span(data.len() as u64, self.vol.cluster_size);
            let used = (kept * DENTRY_SIZE) as u32 / self.vol.cluster_size + 1;
            if have > used {
                self.free_clusters(dir, have - used)?;
            }
        }
        Ok(())
    }

    fn fill(&mut self, dir: u32, count: u32) -> Result<(), FatscopeError> {
        // Bounded to the directory's first extent piece, as a stress
        // helper rather than a grower.
        let mut data = if dir == 0 {
            self.read_extent(0)?
        } else {
            self.vol.read_cluster(dir)?
        };
        let entries = data.len() / DENTRY_SIZE;

        if count as usize > entries {
            warn!("fill supports at most {} records here", entries);
            return Ok(());
        }

        let mut slot = 0;
        while slot < entries && data[slot * DENTRY_SIZE] != DENTRY_UNUSED {
            slot += 1;
        }
        if slot + 1 > count as usize {
            debug!(
                "directory already holds {} records, nothing to fill",
                slot
            );
            return Ok(());
        }

        for i in slot..count as usize {
            let entry = Self::init_dentry(&Self::random_short_name());
            data[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }

        if dir == 0 {
            self.write_extent(0, &data)
        } else {
            self.vol.write_cluster(dir, &data)
        }
    }

    fn contents(&mut self, name: &str, dir: u32) -> Result<String, FatscopeError> {
        let index = self.traversed_index(dir)?;
        let record = self
            .find_child_by_name(index, name)
            .ok_or_else(|| FatscopeError::NotFound(name.to_string()))?
            .clone();

        if record.first_cluster == 0 || record.data_len == 0 {
            return Ok(String::new());
        }

        let clusters = self.chain_clusters(record.first_cluster)?;
        let mut data = Vec::with_capacity(clusters.len() * self.vol.cluster_size as usize);
        for clu in clusters {
            data.extend_from_slice(&self.vol.read_cluster(clu)?);
        }

        let end = (record.data_len as usize).min(data.len());
        Ok(tail_of(&data[..end]))
    }

    fn stat(&mut self, name: &str, dir: u32) -> Result<FileStat, FatscopeError> {
        let index = self.traversed_index(dir)?;
        let record = self
            .find_child_by_name(index, name)
            .ok_or_else(|| FatscopeError::NotFound(name.to_string()))?;

        Ok(FileStat {
            name: record.name.clone(),
            data_len: record.data_len,
            clusters: cluster_span(record.data_len, self.vol.cluster_size),
            first_cluster: record.first_cluster,
            attr: record.attr,
            flags: 0,
            ctime: record.ctime,
            atime: record.atime,
            mtime: record.mtime,
        })
    }

    fn root_cluster(&self) -> u32 {
        self.vol.root_cluster
    }

    fn filesystem_type(&self) -> &'static str {
        self.fat_type.name()
    }

    fn sector_size(&self) -> u32 {
        self.vol.sector_size
    }

    fn cluster_size(&self) -> u32 {
        self.vol.cluster_size
    }

    fn read_sector_raw(&mut self, sector: u64) -> Result<Vec<u8>, FatscopeError> {
        self.vol.read_sectors(sector, 1)
    }

    fn read_cluster_raw(&mut self, cluster: u32) -> Result<Vec<u8>, FatscopeError> {
        self.vol.read_cluster(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(FatType::Fat12.end_of_chain(), 0xFF8);
        assert_eq!(FatType::Fat16.end_of_chain(), 0xFFF8);
        assert_eq!(FatType::Fat32.end_of_chain(), 0x0FFF_FFF8);
    }
}
