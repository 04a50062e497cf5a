// exFAT dialect
// Files carry their allocation state in two places: the FAT (for
// chained files) and the allocation bitmap (always). A stream entry
// flagged NoFatChain owns a contiguous run and the FAT is never
// consulted for it.

pub mod structures;
pub mod upcase;

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use rand::Rng;

use fatscope_core::{Device, FatscopeError};

use crate::dircache::{DirectoryCache, FileRecord};
use crate::fat_common::{attributes::*, tail_of, timestamps};
use crate::nls;
use crate::ops::{CreateOptions, DirEntryInfo, FileStat, FilesystemOps};
use crate::volume::{cluster_span, Volume, FIRST_CLUSTER};
use crate::{DENTRY_SIZE, MAX_NAME_LENGTH};

use self::structures::*;
use self::upcase::{name_hash, UpcaseTable};

/// Whether sector 0 carries the exFAT name field.
pub(crate) fn is_exfat(sector: &[u8]) -> bool {
    sector.len() >= 11 && &sector[3..11] == EXFAT_SIGNATURE
}

pub struct ExFatFilesystem {
    vol: Volume,
    cache: DirectoryCache,
    /// First cluster of the allocation bitmap; 0 until primed.
    bitmap_cluster: u32,
    bitmap_len: u64,
    /// One cluster of the bitmap, held in memory.
    bitmap: Vec<u8>,
    upcase: UpcaseTable,
    volume_label: Vec<u16>,
}

impl ExFatFilesystem {
    pub(crate) fn new(device: Device, sector: &[u8]) -> Result<Self, FatscopeError> {
        let boot = read_boot_sector(sector);

        let mut vol = Volume::new(device);
        vol.sector_size = 1u32 << boot.bytes_per_sector_shift;
        vol.cluster_size = (1u32 << boot.sectors_per_cluster_shift) * vol.sector_size;
        vol.cluster_count = boot.cluster_count;
        vol.fat_offset = boot.fat_offset;
        vol.fat_sectors = boot.number_of_fats as u32 * boot.fat_length;
        vol.heap_offset = boot.cluster_heap_offset;
        vol.root_cluster = boot.first_cluster_of_root;
        vol.root_sectors = 0;

        let mut cache = DirectoryCache::new();
        cache.insert(
            vol.root_cluster,
            FileRecord {
                name: "/".to_string(),
                name_len: 1,
                data_len: vol.cluster_count as u64 * vol.cluster_size as u64,
                attr: ATTR_DIRECTORY,
                ..Default::default()
            },
        );

        let mut fs = Self {
            vol,
            cache,
            bitmap_cluster: 0,
            bitmap_len: 0,
            bitmap: Vec::new(),
            upcase: UpcaseTable::default(),
            volume_label: Vec::new(),
        };
        fs.load_extra_entries()?;
        Ok(fs)
    }

    /// Scan the root directory's first cluster for the Bitmap, Upcase
    /// and Volume-label entries and prime the volume with them.
    fn load_extra_entries(&mut self) -> Result<(), FatscopeError> {
        let data = self.vol.read_cluster(self.vol.root_cluster)?;
        for raw in data.chunks_exact(DENTRY_SIZE) {
            match raw[0] {
                DENTRY_BITMAP => self.load_bitmap_cluster(&BitmapEntry::from_bytes(raw))?,
                DENTRY_UPCASE => self.load_upcase_cluster(&UpcaseEntry::from_bytes(raw))?,
                DENTRY_VOLUME => self.load_volume_label(&VolumeLabelEntry::from_bytes(raw)),
                _ => break,
            }
        }
        Ok(())
    }

    /// Idempotent: a second Bitmap entry is ignored.
    fn load_bitmap_cluster(&mut self, entry: &BitmapEntry) -> Result<(), FatscopeError> {
        if self.bitmap_cluster != 0 {
            return Ok(());
        }
        let first = entry.first_cluster;
        let len = entry.data_length;
        debug!("allocation bitmap at cluster {} ({} bytes)", first, len);
        self.bitmap_cluster = first;
        self.bitmap_len = len;
        self.bitmap = self.vol.read_cluster(first)?;
        Ok(())
    }

    fn load_upcase_cluster(&mut self, entry: &UpcaseEntry) -> Result<(), FatscopeError> {
        if self.upcase.is_loaded() {
            return Ok(());
        }
        let first = entry.first_cluster;
        let len = entry.data_length as u64;
        let expected = entry.table_checksum;
        debug!("up-case table at cluster {} ({} bytes)", first, len);
        let clusters = cluster_span(len, self.vol.cluster_size).max(1);
        let raw = self.vol.read_clusters(first, clusters)?;
        self.upcase.load(&raw, len, expected);
        Ok(())
    }

    fn load_volume_label(&mut self, entry: &VolumeLabelEntry) {
        if !self.volume_label.is_empty() {
            return;
        }
        let count = (entry.character_count as usize).min(VOLUME_LABEL_MAX);
        let label = entry.volume_label;
        self.volume_label = label[..count].to_vec();
    }

    // ---------------------------------------------------------------
    // Allocation bitmap
    // ---------------------------------------------------------------

    fn check_cluster_index(&self, cluster: u32) -> Result<(), FatscopeError> {
        if cluster < FIRST_CLUSTER || cluster > self.vol.cluster_count + 1 {
            return Err(FatscopeError::InvalidCluster(cluster));
        }
        Ok(())
    }

    /// Valid bytes of the in-memory bitmap: bounded by the directory
    /// entry's DataLength and by the single cluster held in memory.
    fn bitmap_limit(&self) -> usize {
        (self.bitmap_len as usize).min(self.bitmap.len())
    }

    /// Whether the bitmap marks `cluster` as allocated.
    fn load_bitmap(&self, cluster: u32) -> Result<bool, FatscopeError> {
        self.check_cluster_index(cluster)?;
        let index = (cluster - FIRST_CLUSTER) as usize;
        if index / 8 >= self.bitmap_limit() {
            return Err(FatscopeError::Corrupt(
                "allocation bitmap is truncated".into(),
            ));
        }
        let byte = self.bitmap[index / 8];
        Ok((byte >> (index % 8)) & 1 != 0)
    }

    /// Flip one bit in memory and write the owning bitmap cluster back.
    fn save_bitmap(&mut self, cluster: u32, allocated: bool) -> Result<(), FatscopeError> {
        self.check_cluster_index(cluster)?;
        let index = (cluster - FIRST_CLUSTER) as usize;
        if index / 8 >= self.bitmap_limit() {
            return Err(FatscopeError::Corrupt(
                "allocation bitmap is truncated".into(),
            ));
        }
        let mask = 1u8 << (index % 8);
        let byte = &mut self.bitmap[index / 8];
        debug!("bitmap bit {}: {:#x} -> {}", index, byte, allocated);
        if allocated {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        let snapshot = self.bitmap.clone();
        self.vol.write_cluster(self.bitmap_cluster, &snapshot)
    }

    // ---------------------------------------------------------------
    // FAT entries
    // ---------------------------------------------------------------

    fn fat_entry(&mut self, cluster: u32) -> Result<u32, FatscopeError> {
        self.check_cluster_index(cluster)?;
        let offset =
            self.vol.fat_offset as u64 * self.vol.sector_size as u64 + cluster as u64 * 4;
        let mut raw = [0u8; 4];
        self.vol.read_at(offset, &mut raw)?;
        Ok(LittleEndian::read_u32(&raw))
    }

    fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FatscopeError> {
        self.check_cluster_index(cluster)?;
        let offset =
            self.vol.fat_offset as u64 * self.vol.sector_size as u64 + cluster as u64 * 4;
        debug!("FAT[{}] = {:#x}", cluster, value);
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, value);
        self.vol.write_at(offset, &raw)
    }

    fn valid_fat_value(&self, value: u32) -> bool {
        if value == EXFAT_BAD_CLUSTER {
            return false;
        }
        if value == EXFAT_LAST_CLUSTER {
            return true;
        }
        if !(FIRST_CLUSTER..=self.vol.cluster_count + 1).contains(&value) {
            return false;
        }
        self.load_bitmap(value).unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Extents
    // ---------------------------------------------------------------

    /// Cluster span of a record's data, never less than one cluster
    /// (directory entries report a zero data length for a freshly
    /// created directory that still owns its first cluster).
    fn span_of(&self, data_len: u64) -> u32 {
        cluster_span(data_len, self.vol.cluster_size).max(1)
    }

    /// The clusters backing a record: a contiguous run under
    /// NoFatChain, the FAT chain otherwise.
    fn extent_clusters(
        &mut self,
        flags: u8,
        data_len: u64,
        first: u32,
    ) -> Result<Vec<u32>, FatscopeError> {
        let span = self.span_of(data_len);

        if flags & ALLOC_NOFATCHAIN != 0 {
            for clu in first + 1..first + span {
                if !self.load_bitmap(clu)? {
                    warn!("cluster {} of a NoFatChain run is not allocated", clu);
                    break;
                }
            }
            return Ok((first..first + span).collect());
        }

        let mut clusters = vec![first];
        let mut current = first;
        for _ in 1..span {
            let next = self.fat_entry(current)?;
            if next == EXFAT_LAST_CLUSTER {
                break;
            }
            if !self.valid_fat_value(next) {
                warn!("invalid FAT entry [{}]: {:#x}", current, next);
                break;
            }
            clusters.push(next);
            current = next;
        }
        Ok(clusters)
    }

    fn concat_extent(
        &mut self,
        flags: u8,
        data_len: u64,
        first: u32,
    ) -> Result<Vec<u8>, FatscopeError> {
        let clusters = self.extent_clusters(flags, data_len, first)?;
        let mut data = Vec::with_capacity(clusters.len() * self.vol.cluster_size as usize);
        for clu in clusters {
            data.extend_from_slice(&self.vol.read_cluster(clu)?);
        }
        Ok(data)
    }

    fn write_extent(
        &mut self,
        flags: u8,
        data_len: u64,
        first: u32,
        data: &[u8],
    ) -> Result<(), FatscopeError> {
        let clusters = self.extent_clusters(flags, data_len, first)?;
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
    // Cluster allocation
    // ---------------------------------------------------------------

    fn last_cluster_of(&mut self, record: &FileRecord) -> Result<u32, FatscopeError> {
        let first = record.first_cluster;
        if record.flags & ALLOC_NOFATCHAIN != 0 {
            return Ok(first + self.span_of(record.data_len) - 1);
        }
        let span = self.span_of(record.data_len);
        let mut current = first;
        for _ in 0..span {
            let next = self.fat_entry(current)?;
            if next == EXFAT_LAST_CLUSTER {
                return Ok(current);
            }
            current = next;
        }
        Ok(current)
    }

    /// Materialise a FAT chain for a contiguous run that is losing its
    /// NoFatChain flag. The run's old tail keeps whatever entry the
    /// caller just linked.
    fn create_fat_chain(&mut self, data_len: u64, first: u32) -> Result<(), FatscopeError> {
        let span = self.span_of(data_len);
        for i in 0..span.saturating_sub(1) {
            self.set_fat_entry(first + i, first + i + 1)?;
        }
        Ok(())
    }

    /// Extend the directory at `dir` by `count` clusters. Free clusters
    /// are scanned upward from the current tail with wrap-around; each
    /// one is FAT-linked before its bitmap bit is set. Losing
    /// contiguity demotes a NoFatChain run to a real chain.
    fn alloc_clusters(&mut self, dir: u32, count: u32) -> Result<u32, FatscopeError> {
        let index = self.chain_index(dir)?;
        let mut record = self.cache.chain(index).record.clone();

        let last = self.last_cluster_of(&record)?;
        let mut tail = last;
        let mut contiguous = true;
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
            if self.load_bitmap(candidate)? {
                continue;
            }
            if contiguous && candidate != tail + 1 {
                contiguous = false;
            }
            self.set_fat_entry(candidate, EXFAT_LAST_CLUSTER)?;
            self.set_fat_entry(tail, candidate)?;
            self.save_bitmap(candidate, true)?;
            tail = candidate;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }

        if record.flags & ALLOC_NOFATCHAIN != 0 && !contiguous {
            record.flags &= !ALLOC_NOFATCHAIN;
            self.create_fat_chain(record.data_len, record.first_cluster)?;
        }

        let allocated = count - remaining;
        record.data_len += allocated as u64 * self.vol.cluster_size as u64;
        self.cache.chain_mut(index).record = record.clone();
        self.update_filesize(&record, dir)?;

        if remaining > 0 {
            return Err(FatscopeError::Exhausted);
        }
        Ok(allocated)
    }

    /// Drop the last `count` clusters of the directory at `dir`.
    fn free_clusters(&mut self, dir: u32, count: u32) -> Result<(), FatscopeError> {
        let index = self.chain_index(dir)?;
        let mut record = self.cache.chain(index).record.clone();
        let span = self.span_of(record.data_len);
        if count == 0 || span <= count {
            return Ok(());
        }

        if record.flags & ALLOC_NOFATCHAIN != 0 {
            for i in span - count..span {
                self.save_bitmap(record.first_cluster + i, false)?;
            }
        } else {
            let clusters = self.extent_clusters(record.flags, record.data_len, record.first_cluster)?;
            let keep = clusters.len().saturating_sub(count as usize);
            if keep == 0 {
                return Ok(());
            }
            self.set_fat_entry(clusters[keep - 1], EXFAT_LAST_CLUSTER)?;
            for &clu in &clusters[keep..] {
                self.set_fat_entry(clu, EXFAT_LAST_CLUSTER)?;
                self.save_bitmap(clu, false)?;
            }
        }

        record.data_len -= count as u64 * self.vol.cluster_size as u64;
        self.cache.chain_mut(index).record = record.clone();
        self.update_filesize(&record, dir)
    }

    /// Allocate a fresh chain of `count` clusters unattached to any
    /// file; used for new subdirectories.
    fn new_clusters(&mut self, count: u32) -> Result<u32, FatscopeError> {
        let mut first = 0u32;
        let mut tail = 0u32;
        let mut remaining = count;

        for clu in FIRST_CLUSTER..self.vol.cluster_count {
            if self.load_bitmap(clu)? {
                continue;
            }
            self.set_fat_entry(clu, EXFAT_LAST_CLUSTER)?;
            if first == 0 {
                first = clu;
            } else {
                self.set_fat_entry(tail, clu)?;
            }
            self.save_bitmap(clu, true)?;
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

    /// Rewrite the stream entry of the file whose data starts at
    /// `first_cluster` with the record's current size and flags. The
    /// root directory has no stream entry anywhere.
    fn update_filesize(
        &mut self,
        record: &FileRecord,
        first_cluster: u32,
    ) -> Result<(), FatscopeError> {
        if first_cluster == self.vol.root_cluster {
            return Ok(());
        }
        let parent_index = self.cache.parent_of(first_cluster).ok_or_else(|| {
            FatscopeError::NotFound(format!(
                "no cached parent directory for cluster {}",
                first_cluster
            ))
        })?;
        let parent = self.cache.chain(parent_index).record.clone();
        let parent_first = self.cache.chain(parent_index).first_cluster;

        let clusters = self.extent_clusters(parent.flags, parent.data_len, parent_first)?;
        for clu in clusters {
            let mut data = self.vol.read_cluster(clu)?;
            for off in (0..data.len()).step_by(DENTRY_SIZE) {
                if data[off] != DENTRY_STREAM {
                    continue;
                }
                let mut stream = StreamEntry::from_bytes(&data[off..off + DENTRY_SIZE]);
                if stream.first_cluster != first_cluster {
                    continue;
                }
                stream.data_length = record.data_len;
                stream.valid_data_length = record.data_len;
                stream.general_secondary_flags = record.flags;
                data[off..off + DENTRY_SIZE].copy_from_slice(&stream.to_bytes());
                return self.vol.write_cluster(clu, &data);
            }
        }
        Err(FatscopeError::Corrupt(format!(
            "no stream entry found for cluster {}",
            first_cluster
        )))
    }

    // ---------------------------------------------------------------
    // Directory decoding
    // ---------------------------------------------------------------

    fn chain_index(&self, cluster: u32) -> Result<usize, FatscopeError> {
        self.cache
            .position(cluster)
            .ok_or_else(|| FatscopeError::NotFound(format!("directory cluster {}", cluster)))
    }

    fn traverse_directory(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        let index = self.chain_index(cluster)?;
        if self.cache.chain(index).record.cached {
            debug!("directory {} already traversed", cluster);
            return Ok(());
        }

        let head = self.cache.chain(index).record.clone();
        let data = self.concat_extent(head.flags, head.data_len, cluster)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut i = 0usize;

        while i < entries {
            let raw = &data[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE];
            match raw[0] {
                DENTRY_BITMAP => {
                    let entry = BitmapEntry::from_bytes(raw);
                    self.load_bitmap_cluster(&entry)?;
                }
                DENTRY_UPCASE => {
                    let entry = UpcaseEntry::from_bytes(raw);
                    self.load_upcase_cluster(&entry)?;
                }
                DENTRY_VOLUME => {
                    let entry = VolumeLabelEntry::from_bytes(raw);
                    self.load_volume_label(&entry);
                }
                DENTRY_FILE => {
                    let file = FileEntry::from_bytes(raw);
                    let secondary_count = file.secondary_count as usize;

                    // Deleted records may sit between the file entry
                    // and its stream entry; skip them.
                    let mut s = i + 1;
                    while s < entries {
                        let t = data[s * DENTRY_SIZE];
                        if t & EXFAT_INUSE != 0 || t == DENTRY_UNUSED {
                            break;
                        }
                        debug!("skipping deleted record ({:#x})", t);
                        s += 1;
                    }
                    if s >= entries || data[s * DENTRY_SIZE] != DENTRY_STREAM {
                        warn!("file entry without a stream entry");
                        i += 1;
                        continue;
                    }
                    let stream =
                        StreamEntry::from_bytes(&data[s * DENTRY_SIZE..(s + 1) * DENTRY_SIZE]);

                    let mut n0 = s + 1;
                    while n0 < entries {
                        let t = data[n0 * DENTRY_SIZE];
                        if t & EXFAT_INUSE != 0 || t == DENTRY_UNUSED {
                            break;
                        }
                        debug!("skipping deleted record ({:#x})", t);
                        n0 += 1;
                    }
                    if n0 >= entries || data[n0 * DENTRY_SIZE] != DENTRY_NAME {
                        warn!("file entry without a name entry");
                        return Err(FatscopeError::Corrupt(
                            "file set is missing its name entries".to_string(),
                        ));
                    }

                    let name_len = stream.name_length as usize;
                    let mut uniname = Vec::with_capacity(name_len);
                    for k in 0..secondary_count.saturating_sub(1) {
                        let pos = n0 + k;
                        if pos >= entries {
                            break;
                        }
                        let take =
                            ENTRY_NAME_MAX.min(name_len.saturating_sub(k * ENTRY_NAME_MAX));
                        let name_entry = NameEntry::from_bytes(
                            &data[pos * DENTRY_SIZE..(pos + 1) * DENTRY_SIZE],
                        );
                        let units = name_entry.file_name;
                        uniname.extend_from_slice(&units[..take]);
                    }

                    self.create_fileinfo(index, &file, &stream, &uniname);
                    i = n0 + secondary_count.saturating_sub(1);
                    continue;
                }
                _ => {}
            }
            i += 1;
        }

        self.cache.chain_mut(index).record.cached = true;
        Ok(())
    }

    fn create_fileinfo(
        &mut self,
        parent: usize,
        file: &FileEntry,
        stream: &StreamEntry,
        uniname: &[u16],
    ) {
        let name_len = stream.name_length as usize;
        let name = nls::utf16_to_string(&uniname[..name_len.min(uniname.len())]);

        let record = FileRecord {
            name,
            name_len,
            short_name: String::new(),
            data_len: stream.data_length,
            attr: file.file_attributes,
            flags: stream.general_secondary_flags,
            key: stream.name_hash as u32,
            first_cluster: stream.first_cluster,
            ctime: timestamps::exfat_to_timestamp(
                file.create_timestamp,
                file.create_10ms_increment,
                file.create_utc_offset,
            ),
            atime: timestamps::exfat_to_timestamp(
                file.last_accessed_timestamp,
                0,
                file.last_accessed_utc_offset,
            ),
            mtime: timestamps::exfat_to_timestamp(
                file.last_modified_timestamp,
                file.last_modified_10ms_increment,
                file.last_modified_utc_offset,
            ),
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

    /// Hash-keyed child search, after upper-casing through the volume's
    /// table.
    fn search_fileinfo(&self, index: usize, name: &str) -> Option<FileRecord> {
        let units = nls::utf8_to_utf16(name.as_bytes());
        let upper = self.upcase.upper_all(&units);
        let hash = name_hash(&upper) as u32;
        self.cache.find_child(index, hash).cloned()
    }

    fn traversed_index(&mut self, cluster: u32) -> Result<usize, FatscopeError> {
        self.traverse_directory(cluster)?;
        self.chain_index(cluster)
    }

    // ---------------------------------------------------------------
    // Entry construction
    // ---------------------------------------------------------------

    fn init_file(units_len: usize) -> FileEntry {
        let (now, tz) = timestamps::now_utc();
        let (packed, subsec) = timestamps::timestamp_to_exfat(now);
        let tz = tz | timestamps::TZ_VALID;
        let mut entry = FileEntry::from_bytes(&[0u8; DENTRY_SIZE]);
        entry.entry_type = DENTRY_FILE;
        entry.secondary_count = (1 + units_len.div_ceil(ENTRY_NAME_MAX)) as u8;
        entry.set_checksum = 0;
        entry.file_attributes = ATTR_ARCHIVE;
        entry.create_timestamp = packed;
        entry.last_modified_timestamp = packed;
        entry.last_accessed_timestamp = packed;
        entry.create_10ms_increment = subsec;
        entry.last_modified_10ms_increment = subsec;
        entry.create_utc_offset = tz;
        entry.last_modified_utc_offset = tz;
        entry.last_accessed_utc_offset = tz;
        entry
    }

    fn init_stream(upper: &[u16], units_len: usize) -> StreamEntry {
        let mut entry = StreamEntry::from_bytes(&[0u8; DENTRY_SIZE]);
        entry.entry_type = DENTRY_STREAM;
        entry.general_secondary_flags = ALLOC_POSSIBLE | ALLOC_NOFATCHAIN;
        entry.name_length = units_len as u8;
        entry.name_hash = name_hash(upper);
        entry.valid_data_length = 0;
        entry.first_cluster = 0;
        entry.data_length = 0;
        entry
    }

    fn init_name(units: &[u16]) -> NameEntry {
        let mut entry = NameEntry::from_bytes(&[0u8; DENTRY_SIZE]);
        entry.entry_type = DENTRY_NAME;
        entry.general_secondary_flags = 0;
        let mut name = [0u16; ENTRY_NAME_MAX];
        name[..units.len()].copy_from_slice(units);
        entry.file_name = name;
        entry
    }

    /// Write a complete file set (File + Stream + Name entries) into a
    /// directory image at record `slot`, checksumming the set.
    fn write_file_set(
        data: &mut [u8],
        slot: usize,
        file: FileEntry,
        stream: StreamEntry,
        units: &[u16],
    ) {
        let mut file = file;
        let name_records = units.len().div_ceil(ENTRY_NAME_MAX).max(1);

        data[slot * DENTRY_SIZE..(slot + 1) * DENTRY_SIZE].copy_from_slice(&file.to_bytes());
        data[(slot + 1) * DENTRY_SIZE..(slot + 2) * DENTRY_SIZE]
            .copy_from_slice(&stream.to_bytes());
        for k in 0..name_records {
            let start = k * ENTRY_NAME_MAX;
            let chunk = &units[start..units.len().min(start + ENTRY_NAME_MAX)];
            let entry = Self::init_name(chunk);
            let off = (slot + 2 + k) * DENTRY_SIZE;
            data[off..off + DENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }

        let set_len = (2 + name_records) * DENTRY_SIZE;
        let checksum =
            entry_set_checksum(&data[slot * DENTRY_SIZE..slot * DENTRY_SIZE + set_len]);
        file.set_checksum = checksum;
        data[slot * DENTRY_SIZE..(slot + 1) * DENTRY_SIZE].copy_from_slice(&file.to_bytes());
    }

    fn encode_name(&self, name: &str) -> Result<(Vec<u16>, Vec<u16>), FatscopeError> {
        let units = nls::utf8_to_utf16(name.as_bytes());
        if units.is_empty() || units.len() > MAX_NAME_LENGTH {
            return Err(FatscopeError::Corrupt(format!(
                "name must be 1..{} UTF-16 units",
                MAX_NAME_LENGTH
            )));
        }
        let upper = self.upcase.upper_all(&units);
        Ok((units, upper))
    }

    fn random_name(len: usize) -> String {
        const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }
}

impl FilesystemOps for ExFatFilesystem {
    fn statfs(&mut self, out: &mut dyn Write) -> Result<(), FatscopeError> {
        let sector = self.vol.read_sectors(0, 1)?;
        let boot = read_boot_sector(&sector);

        writeln!(out, "Sector size:     \t{}", self.vol.sector_size)?;
        writeln!(out, "Cluster size:    \t{}", self.vol.cluster_size)?;
        writeln!(out, "FAT offset:      \t{}", { boot.fat_offset })?;
        writeln!(
            out,
            "FAT size:        \t{}",
            boot.fat_length as u64 * self.vol.sector_size as u64
        )?;
        writeln!(out, "FAT count:       \t{}", { boot.number_of_fats })?;
        writeln!(
            out,
            "Partition offset:\t{}",
            boot.partition_offset * self.vol.sector_size as u64
        )?;
        writeln!(
            out,
            "Volume size:     \t{}",
            boot.volume_length * self.vol.sector_size as u64
        )?;
        writeln!(
            out,
            "Cluster offset:  \t{}",
            boot.cluster_heap_offset as u64 * self.vol.sector_size as u64
        )?;
        writeln!(out, "Cluster count:   \t{}", { boot.cluster_count })?;
        writeln!(out, "First cluster:   \t{}", { boot.first_cluster_of_root })?;
        writeln!(out, "Volume serial:   \t{:#x}", { boot.volume_serial_number })?;
        let revision = boot.file_system_revision;
        writeln!(
            out,
            "Filesystem revision:\t{}.{:02}",
            revision / 0x100,
            revision % 0x100
        )?;
        writeln!(out, "Usage rate:      \t{}", { boot.percent_in_use })?;
        writeln!(out)?;
        Ok(())
    }

    fn info(&mut self, out: &mut dyn Write) -> Result<(), FatscopeError> {
        self.traverse_directory(self.vol.root_cluster)?;

        // Up-case table dump, eight units per row.
        if self.upcase.is_loaded() {
            write!(out, "Offset  ")?;
            for i in 0..8 {
                write!(out, "  +{} ", i)?;
            }
            writeln!(out)?;
            for (row, chunk) in self.upcase.entries().chunks(8).enumerate() {
                write!(out, "{:04x}h:  ", row * 8)?;
                for unit in chunk {
                    write!(out, "{:04x} ", unit)?;
                }
                writeln!(out)?;
            }
        }

        writeln!(out, "volume Label: {}", nls::utf16_to_string(&self.volume_label))?;

        // Chain leaders among allocated clusters.
        let count = self.vol.cluster_count;
        let mut reached = vec![false; count as usize];
        for clu in FIRST_CLUSTER..count {
            if !self.load_bitmap(clu)? {
                reached[clu as usize] = true;
                continue;
            }
            if reached[clu as usize] {
                continue;
            }
            let entry = self.fat_entry(clu)?;
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
                if !(FIRST_CLUSTER..count).contains(&next) {
                    break;
                }
                write!(out, " -> {}", next)?;
                current = next;
            }
            writeln!(out)?;
        }

        writeln!(out, "Allocation Bitmap:")?;
        writeln!(out, "Offset    0 1 2 3 4 5 6 7 8 9 a b c d e f")?;
        write!(out, "{:08x}  - - ", 0)?;
        for clu in FIRST_CLUSTER..count {
            if clu % 0x10 == 0 {
                write!(out, "{:08x}  ", clu)?;
            }
            let used = self.load_bitmap(clu)?;
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
            let child = self
                .cache
                .chain(index)
                .children
                .iter()
                .find(|c| c.name == component);
            match child {
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
                name_len: c.name_len,
                data_len: c.data_len,
                attr: c.attr,
                ctime: c.ctime,
                atime: c.atime,
                mtime: c.mtime,
            })
            .collect())
    }

    fn reload(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let index = self.chain_index(dir)?;
        self.cache.release_children(index);
        self.traverse_directory(dir)
    }

    fn convert(&mut self, src: &str) -> Result<String, FatscopeError> {
        if !self.upcase.is_loaded() {
            return Err(FatscopeError::Corrupt(
                "this volume has no up-case table".to_string(),
            ));
        }
        let units = nls::utf8_to_utf16(src.as_bytes());
        let upper = self.upcase.upper_all(&units);
        let converted = nls::utf16_to_string(&upper);
        debug!("convert {:?} -> {:?}", src, converted);
        Ok(converted)
    }

    fn clean(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let index = self.chain_index(dir)?;
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
        self.valid_fat_value(value)
    }

    fn dentry(
        &mut self,
        out: &mut dyn Write,
        dir: u32,
        index: usize,
    ) -> Result<(), FatscopeError> {
        self.traverse_directory(dir)?;

        let per_cluster = self.vol.entries_per_cluster();
        let mut cluster = dir;
        let mut n = index;
        while n >= per_cluster {
            let next = self.fat_entry(cluster)?;
            if next == EXFAT_LAST_CLUSTER {
                return Err(FatscopeError::Corrupt(
                    "directory record index exceeds the extent".to_string(),
                ));
            }
            if !self.valid_fat_value(next) {
                return Err(FatscopeError::InvalidFatEntry {
                    cluster,
                    value: next,
                });
            }
            n -= per_cluster;
            cluster = next;
        }

        let data = self.vol.read_cluster(cluster)?;
        let raw = &data[n * DENTRY_SIZE..(n + 1) * DENTRY_SIZE];
        let entry_type = raw[0];

        writeln!(out, "EntryType                       : {:02x}", entry_type)?;
        writeln!(out, "  TypeCode                      : {:02x}", entry_type & 0x1F)?;
        writeln!(out, "  TypeImportance                : {:02x}", (entry_type >> 5) & 1)?;
        writeln!(out, "  TypeCategory                  : {:02x}", (entry_type >> 6) & 1)?;
        writeln!(out, "  InUse                         : {:02x}", (entry_type >> 7) & 1)?;

        match entry_type {
            DENTRY_BITMAP => {
                let e = BitmapEntry::from_bytes(raw);
                writeln!(out, "BitmapFlags                     : {:02x}", { e.bitmap_flags })?;
                writeln!(out, "FirstCluster                    : {:08x}", { e.first_cluster })?;
                writeln!(out, "DataLength                      : {:016x}", { e.data_length })?;
            }
            DENTRY_UPCASE => {
                let e = UpcaseEntry::from_bytes(raw);
                writeln!(out, "TableCheckSum                   : {:08x}", { e.table_checksum })?;
                writeln!(out, "FirstCluster                    : {:08x}", { e.first_cluster })?;
                writeln!(out, "DataLength                      : {:016x}", { e.data_length })?;
            }
            DENTRY_VOLUME => {
                let e = VolumeLabelEntry::from_bytes(raw);
                writeln!(out, "CharacterCount                  : {:02x}", { e.character_count })?;
                write!(out, "VolumeLabel                     : ")?;
                for b in &raw[2..24] {
                    write!(out, "{:02x}", b)?;
                }
                writeln!(out)?;
            }
            DENTRY_FILE => {
                let e = FileEntry::from_bytes(raw);
                writeln!(out, "SecondaryCount                  : {:02x}", { e.secondary_count })?;
                writeln!(out, "SetChecksum                     : {:04x}", { e.set_checksum })?;
                writeln!(out, "FileAttributes                  : {:04x}", { e.file_attributes })?;
                let attr = e.file_attributes;
                for (bit, label) in [
                    (ATTR_READ_ONLY, "ReadOnly"),
                    (ATTR_HIDDEN, "Hidden"),
                    (ATTR_SYSTEM, "System"),
                    (ATTR_DIRECTORY, "Directory"),
                    (ATTR_ARCHIVE, "Archive"),
                ] {
                    if attr & bit != 0 {
                        writeln!(out, "  * {}", label)?;
                    }
                }
                writeln!(out, "CreateTimestamp                 : {:08x}", { e.create_timestamp })?;
                writeln!(
                    out,
                    "  {}",
                    timestamps::exfat_to_timestamp(e.create_timestamp, 0, 0)
                )?;
                writeln!(out, "LastModifiedTimestamp           : {:08x}", {
                    e.last_modified_timestamp
                })?;
                writeln!(
                    out,
                    "  {}",
                    timestamps::exfat_to_timestamp(e.last_modified_timestamp, 0, 0)
                )?;
                writeln!(out, "LastAccessedTimestamp           : {:08x}", {
                    e.last_accessed_timestamp
                })?;
                writeln!(
                    out,
                    "  {}",
                    timestamps::exfat_to_timestamp(e.last_accessed_timestamp, 0, 0)
                )?;
                writeln!(out, "Create10msIncrement             : {:02x}", {
                    e.create_10ms_increment
                })?;
                writeln!(out, "LastModified10msIncrement       : {:02x}", {
                    e.last_modified_10ms_increment
                })?;
                for (value, label) in [
                    (e.create_utc_offset, "CreateUtcOffset"),
                    (e.last_modified_utc_offset, "LastModifiedUtcOffset"),
                    (e.last_accessed_utc_offset, "LastAccessdUtcOffset"),
                ] {
                    writeln!(out, "{:<32}: {:02x}", label, value)?;
                    if value & timestamps::TZ_VALID != 0 {
                        let minutes = timestamps::utc_offset_minutes(value);
                        writeln!(out, "  {:02}:{:02}", minutes / 60, (minutes % 60).abs())?;
                    }
                }
            }
            DENTRY_STREAM => {
                let e = StreamEntry::from_bytes(raw);
                writeln!(out, "GeneralSecondaryFlags           : {:02x}", {
                    e.general_secondary_flags
                })?;
                if e.general_secondary_flags & ALLOC_POSSIBLE != 0 {
                    writeln!(out, "  * AllocationPossible")?;
                }
                if e.general_secondary_flags & ALLOC_NOFATCHAIN != 0 {
                    writeln!(out, "  * NoFatChain")?;
                }
                writeln!(out, "NameLength                      : {:02x}", { e.name_length })?;
                writeln!(out, "NameHash                        : {:04x}", { e.name_hash })?;
                writeln!(out, "ValidDataLength                 : {:016x}", {
                    e.valid_data_length
                })?;
                writeln!(out, "FirstCluster                    : {:08x}", { e.first_cluster })?;
                writeln!(out, "DataLength                      : {:016x}", { e.data_length })?;
            }
            DENTRY_NAME => {
                let e = NameEntry::from_bytes(raw);
                writeln!(out, "GeneralSecondaryFlags           : {:02x}", {
                    e.general_secondary_flags
                })?;
                write!(out, "FileName                        : ")?;
                for b in &raw[2..32] {
                    write!(out, "{:02x}", b)?;
                }
                writeln!(out)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn alloc(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        if self.load_bitmap(cluster)? {
            warn!("cluster {} is already allocated", cluster);
            return Ok(());
        }
        self.save_bitmap(cluster, true)
    }

    fn release(&mut self, cluster: u32) -> Result<(), FatscopeError> {
        if !self.load_bitmap(cluster)? {
            warn!("cluster {} is already free", cluster);
            return Ok(());
        }
        self.save_bitmap(cluster, false)
    }

    fn create(&mut self, name: &str, dir: u32, opts: CreateOptions) -> Result<(), FatscopeError> {
        let (units, upper) = self.encode_name(name)?;
        let name_records = units.len().div_ceil(ENTRY_NAME_MAX);
        let secondary_count = name_records + 1;

        let index = self.traversed_index(dir)?;
        if self.search_fileinfo(index, name).is_some() {
            return Err(FatscopeError::Exists(name.to_string()));
        }

        let mut head = self.cache.chain(index).record.clone();
        let mut data = self.concat_extent(head.flags, head.data_len, dir)?;
        let mut slot = 0;
        while slot < data.len() / DENTRY_SIZE && data[slot * DENTRY_SIZE] != DENTRY_UNUSED {
            slot += 1;
        }

        let needed_bytes = (slot + secondary_count + 2) * DENTRY_SIZE;
        let have = cluster_span(data.len() as u64, self.vol.cluster_size);
        let need = cluster_span(needed_bytes as u64, self.vol.cluster_size);
        if need > have {
            self.alloc_clusters(dir, need - have)?;
            head = self.cache.chain(index).record.clone();
            data = self.concat_extent(head.flags, head.data_len, dir)?;
        }

        let mut file = Self::init_file(units.len());
        if opts.directory {
            file.file_attributes = ATTR_DIRECTORY;
        }
        let mut stream = Self::init_stream(&upper, units.len());
        if opts.directory {
            stream.first_cluster = self.new_clusters(1)?;
        }

        Self::write_file_set(&mut data, slot, file, stream, &units);
        self.write_extent(head.flags, head.data_len, dir, &data)
    }

    fn remove(&mut self, name: &str, dir: u32) -> Result<(), FatscopeError> {
        let (units, upper) = self.encode_name(name)?;
        let hash = name_hash(&upper);

        let head_index = self.chain_index(dir)?;
        let head = self.cache.chain(head_index).record.clone();
        let mut data = self.concat_extent(head.flags, head.data_len, dir)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut found = false;
        let mut i = 0usize;

        while i < entries {
            let off = i * DENTRY_SIZE;
            if data[off] == DENTRY_UNUSED {
                break;
            }
            if data[off] != DENTRY_FILE {
                i += 1;
                continue;
            }

            let file = FileEntry::from_bytes(&data[off..off + DENTRY_SIZE]);
            let secondary_count = file.secondary_count as usize;

            let mut s = i + 1;
            while s < entries {
                let t = data[s * DENTRY_SIZE];
                if t & EXFAT_INUSE != 0 || t == DENTRY_UNUSED {
                    break;
                }
                s += 1;
            }
            if s >= entries || data[s * DENTRY_SIZE] != DENTRY_STREAM {
                debug!("file entry without a stream entry");
                i += 1;
                continue;
            }
            let stream = StreamEntry::from_bytes(&data[s * DENTRY_SIZE..(s + 1) * DENTRY_SIZE]);

            if stream.name_hash != hash || stream.name_length as usize != units.len() {
                i = s + 1;
                continue;
            }

            let n0 = s + 1;
            if n0 >= entries || data[n0 * DENTRY_SIZE] != DENTRY_NAME {
                debug!("file entry without a name entry");
                i = s + 1;
                continue;
            }

            let mut stored = Vec::with_capacity(units.len());
            for k in 0..secondary_count.saturating_sub(1) {
                let pos = n0 + k;
                if pos >= entries {
                    break;
                }
                let take = ENTRY_NAME_MAX.min(units.len().saturating_sub(k * ENTRY_NAME_MAX));
                let entry =
                    NameEntry::from_bytes(&data[pos * DENTRY_SIZE..(pos + 1) * DENTRY_SIZE]);
                let file_name = entry.file_name;
                stored.extend_from_slice(&file_name[..take]);
            }

            if stored == units {
                // Clear the InUse bit on every record of the set.
                data[off] &= !EXFAT_INUSE;
                data[s * DENTRY_SIZE] &= !EXFAT_INUSE;
                for k in 0..secondary_count.saturating_sub(1) {
                    let pos = n0 + k;
                    if pos < entries {
                        data[pos * DENTRY_SIZE] &= !EXFAT_INUSE;
                    }
                }
                found = true;
                break;
            }
            i = n0 + secondary_count.saturating_sub(1);
        }

        if !found {
            return Err(FatscopeError::NotFound(name.to_string()));
        }
        self.write_extent(head.flags, head.data_len, dir, &data)
    }

    fn trim(&mut self, dir: u32) -> Result<(), FatscopeError> {
        let head_index = self.chain_index(dir)?;
        let head = self.cache.chain(head_index).record.clone();
        let mut data = self.concat_extent(head.flags, head.data_len, dir)?;
        let entries = data.len() / DENTRY_SIZE;
        let mut kept = 0usize;

        for i in 0..entries {
            let off = i * DENTRY_SIZE;
            if data[off] == DENTRY_UNUSED {
                break;
            }
            if data[off] & EXFAT_INUSE == 0 {
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

        self.write_extent(head.flags, head.data_len, dir, &data)?;

        let have = cluster_span(data.len() as u64, self.vol.cluster_size);
        let used = (kept * DENTRY_SIZE) as u32 / self.vol.cluster_size + 1;
        if have > used {
            self.free_clusters(dir, have - used)?;
        }
        Ok(())
    }

    fn fill(&mut self, dir: u32, count: u32) -> Result<(), FatscopeError> {
        const SET_RECORDS: usize = 3;

        let index = self.chain_index(dir)?;
        let mut head = self.cache.chain(index).record.clone();
        let mut data = self.concat_extent(head.flags, head.data_len, dir)?;

        let mut slot = 0;
        while slot < data.len() / DENTRY_SIZE && data[slot * DENTRY_SIZE] != DENTRY_UNUSED {
            slot += 1;
        }
        if slot + 1 > count as usize {
            debug!("directory already holds {} records, nothing to fill", slot);
            return Ok(());
        }

        let needed = count as usize - slot;
        let have = cluster_span(data.len() as u64, self.vol.cluster_size);
        let need = cluster_span(count as u64 * DENTRY_SIZE as u64, self.vol.cluster_size);
        if need > have {
            self.alloc_clusters(dir, need - have)?;
            head = self.cache.chain(index).record.clone();
            data = self.concat_extent(head.flags, head.data_len, dir)?;
        }

        // The remainder that does not fill a whole set becomes bare
        // not-in-use file tags.
        for _ in 0..needed % SET_RECORDS {
            data[slot * DENTRY_SIZE] = DENTRY_FILE & !EXFAT_INUSE;
            slot += 1;
        }

        for _ in 0..needed / SET_RECORDS {
            let name = Self::random_name(ENTRY_NAME_MAX);
            let units = nls::utf8_to_utf16(name.as_bytes());
            let upper = self.upcase.upper_all(&units);
            let file = Self::init_file(units.len());
            let stream = Self::init_stream(&upper, units.len());
            Self::write_file_set(&mut data, slot, file, stream, &units);
            slot += SET_RECORDS;
        }

        self.write_extent(head.flags, head.data_len, dir, &data)
    }

    fn contents(&mut self, name: &str, dir: u32) -> Result<String, FatscopeError> {
        let index = self.traversed_index(dir)?;
        let record = self
            .search_fileinfo(index, name)
            .ok_or_else(|| FatscopeError::NotFound(name.to_string()))?;

        if record.first_cluster == 0 || record.data_len == 0 {
            return Ok(String::new());
        }

        let data = self.concat_extent(record.flags, record.data_len, record.first_cluster)?;
        let end = (record.data_len as usize).min(data.len());
        Ok(tail_of(&data[..end]))
    }

    fn stat(&mut self, name: &str, dir: u32) -> Result<FileStat, FatscopeError> {
        let index = self.traversed_index(dir)?;
        let record = self
            .search_fileinfo(index, name)
            .ok_or_else(|| FatscopeError::NotFound(name.to_string()))?;

        Ok(FileStat {
            name: record.name.clone(),
            data_len: record.data_len,
            clusters: cluster_span(record.data_len, self.vol.cluster_size),
            first_cluster: record.first_cluster,
            attr: record.attr,
            flags: record.flags,
            ctime: record.ctime,
            atime: record.atime,
            mtime: record.mtime,
        })
    }

    fn root_cluster(&self) -> u32 {
        self.vol.root_cluster
    }

    fn filesystem_type(&self) -> &'static str {
        "exFAT"
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
