// End-to-end tests over a synthetic FAT12 image: a 103-sector volume
// with one FAT, a 16-entry fixed root and 100 data clusters.

use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use fatscope_core::FatscopeError;
use fatscope_filesystems::{open_image, CreateOptions, FilesystemOps};

const SECTOR_SIZE: usize = 512;
const TOTAL_SECTORS: usize = 103;
const CLUSTER_COUNT: u32 = 100;
const FAT_OFFSET: usize = SECTOR_SIZE; // one reserved sector

fn build_fat12() -> NamedTempFile {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut image = vec![0u8; TOTAL_SECTORS * SECTOR_SIZE];

    // Boot sector.
    image[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    image[3..11].copy_from_slice(b"MSWIN4.1");
    image[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    image[13] = 1; // sectors per cluster
    image[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
    image[16] = 1; // number of FATs
    image[17..19].copy_from_slice(&16u16.to_le_bytes()); // root entries
    image[19..21].copy_from_slice(&(TOTAL_SECTORS as u16).to_le_bytes());
    image[21] = 0xF8; // media descriptor
    image[22..24].copy_from_slice(&1u16.to_le_bytes()); // sectors per FAT
    image[54..62].copy_from_slice(b"FAT12   ");
    image[510] = 0x55;
    image[511] = 0xAA;

    // FAT reserved entries 0 and 1.
    image[FAT_OFFSET..FAT_OFFSET + 3].copy_from_slice(&[0xF8, 0xFF, 0xFF]);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    file
}

fn raw_bytes(file: &NamedTempFile, offset: u64, len: usize) -> Vec<u8> {
    let mut f = file.reopen().unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn detects_fat12() {
    let image = build_fat12();
    let fs = open_image(image.path(), true).unwrap();
    assert_eq!(fs.filesystem_type(), "FAT12");
    assert_eq!(fs.root_cluster(), 0);
}

#[test]
fn fat12_entry_round_trip_preserves_neighbours() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.set_fat(5, 0x123).unwrap();
    assert_eq!(fs.get_fat(5).unwrap(), 0x123);
    assert_eq!(fs.get_fat(4).unwrap(), 0);
    assert_eq!(fs.get_fat(6).unwrap(), 0);

    // Entry 5 is odd: its twelve bits live in the high nibble of byte
    // 7 and all of byte 8 of the FAT.
    drop(fs);
    let fat = raw_bytes(&image, FAT_OFFSET as u64, 16);
    assert_eq!(fat[7], 0x30);
    assert_eq!(fat[8], 0x12);
    assert_eq!(fat[6], 0x00); // entry 4
    assert_eq!(fat[9], 0x00); // entry 6
}

#[test]
fn fat12_even_and_odd_entries_pack_independently() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.set_fat(4, 0xABC).unwrap();
    fs.set_fat(5, 0x123).unwrap();
    assert_eq!(fs.get_fat(4).unwrap(), 0xABC);
    assert_eq!(fs.get_fat(5).unwrap(), 0x123);

    fs.set_fat(4, 0).unwrap();
    assert_eq!(fs.get_fat(5).unwrap(), 0x123);
}

#[test]
fn fat_entry_out_of_range_is_rejected() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    assert!(matches!(
        fs.get_fat(CLUSTER_COUNT + 2),
        Err(FatscopeError::InvalidCluster(_))
    ));
    assert!(matches!(
        fs.set_fat(CLUSTER_COUNT + 2, 0),
        Err(FatscopeError::InvalidCluster(_))
    ));
    assert!(fs.get_fat(CLUSTER_COUNT + 1).is_ok());
}

#[test]
fn create_remove_trim_in_fixed_root() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("ALPHA", 0, CreateOptions::default()).unwrap();
    fs.create("beta.txt", 0, CreateOptions::default()).unwrap();
    fs.reload(0).unwrap();

    let names: Vec<String> = fs.readdir(0).unwrap().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["ALPHA".to_string(), "beta.txt".to_string()]);

    // Long name survives the round trip through LFN records.
    assert!(fs.lookup(0, "beta.txt").is_ok());

    fs.remove("beta.txt", 0).unwrap();
    fs.reload(0).unwrap();
    assert!(matches!(
        fs.lookup(0, "/beta.txt"),
        Err(FatscopeError::NotFound(_))
    ));

    fs.trim(0).unwrap();
    fs.reload(0).unwrap();
    let names: Vec<String> = fs.readdir(0).unwrap().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["ALPHA".to_string()]);
}

#[test]
fn trim_is_idempotent() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("ONE", 0, CreateOptions::default()).unwrap();
    fs.create("TWO", 0, CreateOptions::default()).unwrap();
    fs.reload(0).unwrap();
    fs.remove("ONE", 0).unwrap();
    fs.reload(0).unwrap();

    fs.trim(0).unwrap();
    drop(fs);
    let after_first = std::fs::read(image.path()).unwrap();

    let mut fs = open_image(image.path(), false).unwrap();
    fs.trim(0).unwrap();
    drop(fs);
    let after_second = std::fs::read(image.path()).unwrap();

    assert_eq!(after_first, after_second);
}

#[test]
fn duplicate_create_is_refused() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("ALPHA", 0, CreateOptions::default()).unwrap();
    fs.reload(0).unwrap();
    assert!(matches!(
        fs.create("ALPHA", 0, CreateOptions::default()),
        Err(FatscopeError::Exists(_))
    ));
}

#[test]
fn subdirectory_create_and_extend() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create(
        "DIR1",
        0,
        CreateOptions { directory: true },
    )
    .unwrap();
    fs.reload(0).unwrap();

    let dir_cluster = fs.lookup(0, "/DIR1").unwrap();
    assert_eq!(dir_cluster, 2);
    assert_ne!(fs.get_fat(dir_cluster).unwrap(), 0);

    // One 512-byte cluster holds 16 records; twenty creations force a
    // chain extension.
    for i in 0..20 {
        let name = format!("FILE{:02}", i);
        fs.create(&name, dir_cluster, CreateOptions::default()).unwrap();
    }
    fs.reload(dir_cluster).unwrap();
    assert_eq!(fs.readdir(dir_cluster).unwrap().len(), 20);

    // The directory chain now spans more than one cluster.
    let next = fs.get_fat(dir_cluster).unwrap();
    assert!((2..CLUSTER_COUNT + 2).contains(&next));
}

#[test]
fn allocation_exhaustion() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    for cluster in 2..CLUSTER_COUNT + 2 {
        fs.set_fat(cluster, 0xFFF).unwrap();
    }
    assert!(matches!(
        fs.create("FULL", 0, CreateOptions { directory: true }),
        Err(FatscopeError::Exhausted)
    ));
}

#[test]
fn stat_and_reports() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.create("ALPHA", 0, CreateOptions::default()).unwrap();
    fs.reload(0).unwrap();

    let stat = fs.stat("ALPHA", 0).unwrap();
    assert_eq!(stat.name, "ALPHA");
    assert_eq!(stat.data_len, 0);
    assert_eq!(stat.first_cluster, 0);

    let mut out = Vec::new();
    fs.statfs(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("Sector size"));
    assert!(report.contains("FAT12"));

    let mut out = Vec::new();
    fs.info(&mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("Allocation Bitmap:"));

    let mut out = Vec::new();
    fs.dentry(&mut out, 0, 0).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("DIR_Name"));
}

#[test]
fn fill_appends_bare_short_records() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();

    fs.fill(0, 8).unwrap();
    fs.reload(0).unwrap();
    assert_eq!(fs.readdir(0).unwrap().len(), 8);

    // A count beyond the root's capacity is refused without failing.
    fs.fill(0, 1000).unwrap();
    fs.reload(0).unwrap();
    assert_eq!(fs.readdir(0).unwrap().len(), 8);
}

#[test]
fn convert_is_not_available_on_fat() {
    let image = build_fat12();
    let mut fs = open_image(image.path(), false).unwrap();
    assert!(matches!(
        fs.convert("abc"),
        Err(FatscopeError::Unimplemented(_))
    ));
}
