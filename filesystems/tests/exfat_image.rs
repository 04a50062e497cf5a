// End-to-end tests over a synthetic exFAT image: 512-byte sectors,
// 4 KiB clusters, 64 clusters, allocation bitmap in cluster 2, root
// directory in cluster 3.

use std::io::Write;

use tempfile::NamedTempFile;

use fatscope_core::FatscopeError;
use fatscope_filesystems::exfat::structures::{
    entry_set_checksum, FileEntry, StreamEntry, ALLOC_NOFATCHAIN, ALLOC_POSSIBLE, DENTRY_BITMAP,
    DENTRY_FILE, DENTRY_NAME, DENTRY_STREAM,
};
use fatscope_filesystems::exfat::upcase::name_hash;
use fatscope_filesystems::fat_common::attributes::{ATTR_ARCHIVE, ATTR_DIRECTORY};
use fatscope_filesystems::nls::utf8_to_utf16;
use fatscope_filesystems::{open_image, CreateOptions, FilesystemOps};

const SECTOR_SIZE: u32 = 512;
const CLUSTER_SIZE: u32 = 4096;
const CLUSTER_COUNT: u32 = 64;
const HEAP_OFFSET_SECTORS: u32 = 8;
const FAT_OFFSET_SECTORS: u32 = 4;
const ROOT_CLUSTER: u32 = 3;
const BITMAP_CLUSTER: u32 = 2;

fn cluster_offset(cluster: u32) -> usize {
    (HEAP_OFFSET_SECTORS * SECTOR_SIZE + (cluster - 2) * CLUSTER_SIZE) as usize
}

fn set_fat(image: &mut [u8], cluster: u32, value: u32) {
    let offset = (FAT_OFFSET_SECTORS * SECTOR_SIZE + cluster * 4) as usize;
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn build_exfat(with_log_file: bool) -> NamedTempFile {
    let _ = env_logger::builder().is_test(true).try_init();

    let total = cluster_offset(2) + (CLUSTER_COUNT * CLUSTER_SIZE) as usize;
    let mut image = vec![0u8; total];

    // Boot sector.
    image[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
    image[3..11].copy_from_slice(b"EXFAT   ");
    image[0x40..0x48].copy_from_slice(&0u64.to_le_bytes()); // partition offset
    image[0x48..0x50].copy_from_slice(&(total as u64 / 512).to_le_bytes());
    image[0x50..0x54].copy_from_slice(&FAT_OFFSET_SECTORS.to_le_bytes());
    image[0x54..0x58].copy_from_slice(&1u32.to_le_bytes()); // FAT length
    image[0x58..0x5C].copy_from_slice(&HEAP_OFFSET_SECTORS.to_le_bytes());
    image[0x5C..0x60].copy_from_slice(&CLUSTER_COUNT.to_le_bytes());
    image[0x60..0x64].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
    image[0x64..0x68].copy_from_slice(&0x12345678u32.to_le_bytes());
    image[0x68..0x6A].copy_from_slice(&0x0100u16.to_le_bytes()); // revision 1.00
    image[0x6C] = 9; // 512-byte sectors
    image[0x6D] = 3; // 8 sectors per cluster
    image[0x6E] = 1; // one FAT
    image[0x6F] = 0x80;
    image[510] = 0x55;
    image[511] = 0xAA;

    // FAT: reserved entries plus chains for the bitmap and the root.
    set_fat(&mut image, 0, 0xFFFF_FFF8);
    set_fat(&mut image, 1, 0xFFFF_FFFF);
    set_fat(&mut image, BITMAP_CLUSTER, 0xFFFF_FFFF);
    set_fat(&mut image, ROOT_CLUSTER, 0xFFFF_FFFF);

    // Allocation bitmap: clusters 2 and 3 in use.
    let bitmap = cluster_offset(BITMAP_CLUSTER);
    image[bitmap] = 0b0000_0011;

    // Root directory: the bitmap entry first.
    let root = cluster_offset(ROOT_CLUSTER);
    image[root] = DENTRY_BITMAP;
    image[root + 20..root + 24].copy_from_slice(&BITMAP_CLUSTER.to_le_bytes());
    image[root + 24..root + 32]
        .copy_from_slice(&(CLUSTER_COUNT as u64 / 8).to_le_bytes());

    if with_log_file {
        // A 20-line text file in cluster 5, stored as a NoFatChain run.
        let mut content = String::new();
        for i in 1..=20 {
            content.push_str(&format!("line {}\n", i));
        }
        let data_cluster = 5u32;
        let data_offset = cluster_offset(data_cluster);
        image[data_offset..data_offset + content.len()]
            .copy_from_slice(content.as_bytes());
        image[bitmap] |= 1 << (data_cluster - 2);

        let units = utf8_to_utf16(b"log");
        let mut file = FileEntry::from_bytes(&[0u8; 32]);
        file.entry_type = DENTRY_FILE;
        file.secondary_count = 2;
        file.file_attributes = ATTR_ARCHIVE;

        let mut stream = StreamEntry::from_bytes(&[0u8; 32]);
        stream.entry_type = DENTRY_STREAM;
        stream.general_secondary_flags = ALLOC_POSSIBLE | ALLOC_NOFATCHAIN;
        stream.name_length = units.len() as u8;
        stream.name_hash = name_hash(&units);
        stream.valid_data_length = content.len() as u64;
        stream.first_cluster = data_cluster;
        stream.data_length = content.len() as u64;

        let mut name = [0u8; 32];
        name[0] = DENTRY_NAME;
        for (i, unit) in units.iter().enumerate() {
            name[2 + 2 * i..4 + 2 * i].copy_from_slice(&unit.to_le_bytes());
        }

        let mut set = Vec::new();
        set.extend_from_slice(&file.to_bytes());
        set.extend_from_slice(&stream.to_bytes());
        set.extend_from_slice(&name);
        file.set_checksum = entry_set_checksum(&set);

        let slot = root + 32;
        image[slot..slot + 32].copy_from_slice(&file.to_bytes());
        image[slot + 32..slot + 64].copy_from_slice(&stream.to_bytes());
        image[slot + 64..slot + 96].copy_from_slice(&name);
    }

    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();
    tmp
}

#[test]
fn detects_exfat_and_empty_root() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), true).unwrap();

    assert_eq!(fs.filesystem_type(), "exFAT");
    assert_eq!(fs.root_cluster(), ROOT_CLUSTER);
    assert_eq!(fs.lookup(ROOT_CLUSTER, "/").unwrap(), ROOT_CLUSTER);
    assert!(fs.readdir(ROOT_CLUSTER).unwrap().is_empty());
}

#[test]
fn create_file_and_stat() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("f.bin", ROOT_CLUSTER, CreateOptions::default())
        .unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();

    let stat = fs.stat("f.bin", ROOT_CLUSTER).unwrap();
    assert_eq!(stat.data_len, 0);
    assert_eq!(stat.first_cluster, 0);
    assert_ne!(stat.attr & ATTR_ARCHIVE, 0);
    assert_ne!(stat.flags & ALLOC_NOFATCHAIN, 0);
}

#[test]
fn create_directory_allocates_one_cluster() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("dir", ROOT_CLUSTER, CreateOptions { directory: true })
        .unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();

    let stat = fs.stat("dir", ROOT_CLUSTER).unwrap();
    assert_ne!(stat.attr & ATTR_DIRECTORY, 0);
    // Clusters 2 and 3 belong to the bitmap and the root; the fresh
    // directory takes the next free one.
    assert_eq!(stat.first_cluster, 4);
    assert_eq!(fs.lookup(ROOT_CLUSTER, "/dir").unwrap(), 4);

    // The new cluster is both FAT-terminated and marked allocated.
    assert_eq!(fs.get_fat(4).unwrap(), 0xFFFF_FFFF);
    assert!(fs.validate_fat(4));
}

#[test]
fn create_remove_trim_listing() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    for name in ["a", "b", "c"] {
        fs.create(name, ROOT_CLUSTER, CreateOptions::default()).unwrap();
        fs.reload(ROOT_CLUSTER).unwrap();
    }
    fs.remove("b", ROOT_CLUSTER).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();
    fs.trim(ROOT_CLUSTER).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();

    let names: Vec<String> = fs
        .readdir(ROOT_CLUSTER)
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
}

#[test]
fn duplicate_create_is_refused() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("twice", ROOT_CLUSTER, CreateOptions::default()).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();
    assert!(matches!(
        fs.create("twice", ROOT_CLUSTER, CreateOptions::default()),
        Err(FatscopeError::Exists(_))
    ));
}

#[test]
fn non_ascii_name_hash_round_trip() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    let name = "r\u{e9}sum\u{e9}.txt";
    fs.create(name, ROOT_CLUSTER, CreateOptions::default()).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();

    // The stored hash matches a fresh computation over the (identity
    // up-cased) UTF-16 name, and lookup resolves the file.
    let stat = fs.stat(name, ROOT_CLUSTER).unwrap();
    assert_eq!(stat.name, name);
    assert!(fs.lookup(ROOT_CLUSTER, "/r\u{e9}sum\u{e9}.txt").is_ok());

    let data = fs.read_cluster_raw(ROOT_CLUSTER).unwrap();
    let expected = name_hash(&utf8_to_utf16(name.as_bytes()));
    let mut seen = false;
    for off in (0..data.len()).step_by(32) {
        if data[off] == DENTRY_STREAM {
            let stream = StreamEntry::from_bytes(&data[off..off + 32]);
            if { stream.name_length } as usize == name.chars().count() {
                assert_eq!({ stream.name_hash }, expected);
                seen = true;
            }
        }
    }
    assert!(seen);
}

#[test]
fn tail_prints_last_ten_lines() {
    let image = build_exfat(true);
    let mut fs = open_image(image.path(), false).unwrap();

    let tail = fs.contents("log", ROOT_CLUSTER).unwrap();
    let lines: Vec<&str> = tail.lines().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "line 11");
    assert_eq!(lines[9], "line 20");
}

#[test]
fn fill_appends_synthetic_sets() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    // Slot 0 holds the bitmap entry; eleven more records are two bare
    // not-in-use tags plus three complete file sets.
    fs.fill(ROOT_CLUSTER, 12).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();

    let entries = fs.readdir(ROOT_CLUSTER).unwrap();
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(entry.name.chars().count(), 15);
    }
}

#[test]
fn bitmap_alloc_and_release() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    assert!(!fs.validate_fat(10));
    fs.alloc(10).unwrap();
    assert!(fs.validate_fat(10));
    fs.release(10).unwrap();
    assert!(!fs.validate_fat(10));
}

#[test]
fn allocation_exhaustion() {
    let image = build_exfat(false);
    let mut fs = open_image(image.path(), false).unwrap();

    for cluster in 4..CLUSTER_COUNT + 2 {
        fs.alloc(cluster).unwrap();
    }
    assert!(matches!(
        fs.create("zzz", ROOT_CLUSTER, CreateOptions { directory: true }),
        Err(FatscopeError::Exhausted)
    ));
}

#[test]
fn statfs_and_info_reports() {
    let image = build_exfat(true);
    let mut fs = open_image(image.path(), false).unwrap();

    let mut out = Vec::new();
    fs.statfs(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("Cluster count:   \t64"));
    assert!(report.contains("First cluster:   \t3"));

    let mut out = Vec::new();
    fs.info(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("Allocation Bitmap:"));

    let mut out = Vec::new();
    fs.dentry(&mut out, ROOT_CLUSTER, 0).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.starts_with("EntryType"));
    assert!(report.contains(": 81"));
    assert!(report.contains("FirstCluster"));
}

#[test]
fn remove_clears_in_use_bits_only() {
    let image = build_exfat(true);
    let mut fs = open_image(image.path(), false).unwrap();

    fs.remove("log", ROOT_CLUSTER).unwrap();
    fs.reload(ROOT_CLUSTER).unwrap();
    assert!(matches!(
        fs.contents("log", ROOT_CLUSTER),
        Err(FatscopeError::NotFound(_))
    ));

    // The records remain, only their InUse bits dropped; the data
    // cluster stays allocated.
    let data = fs.read_cluster_raw(ROOT_CLUSTER).unwrap();
    assert_eq!(data[32], DENTRY_FILE & 0x7F);
    assert_eq!(data[64], DENTRY_STREAM & 0x7F);
    assert_eq!(data[96], DENTRY_NAME & 0x7F);
    assert!(fs.validate_fat(5));
}
