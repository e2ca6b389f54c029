#![allow(missing_docs)]

use std::{
    fs::{self, File},
    io::{Seek as _, SeekFrom, Write as _},
    path::Path,
};

use hex as _;
use log as _;
use rawimg_bmap::{BmapCreate, Error, DEFAULT_BLOCK_SIZE};
use sha2::{Digest as _, Sha256};
use test_log::test;
use thiserror as _;

const BS: u64 = DEFAULT_BLOCK_SIZE;

fn write_image(path: &Path, size: u64, chunks: &[(u64, &[u8])]) {
    let mut file = File::create(path).unwrap();
    file.set_len(size).unwrap();

    for (offset, data) in chunks {
        file.seek(SeekFrom::Start(*offset)).unwrap();
        file.write_all(data).unwrap();
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[test]
fn test_empty_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("empty.raw");
    let bmap = dir.path().join("empty.bmap");

    write_image(&image, 3 * BS, &[]);

    let map = BmapCreate::new(&image, &bmap).map().unwrap();
    assert_eq!(map.image_size, 3 * BS);
    assert_eq!(map.block_size, BS);
    assert_eq!(map.blocks_count, 3);
    assert_eq!(map.mapped_blocks_count(), 0);
    assert!(map.ranges.is_empty());

    let xml = map.to_xml();
    assert!(xml.contains("<MappedBlocksCount> 0 </MappedBlocksCount>"));
    assert!(xml.contains("<BlocksCount> 3 </BlocksCount>"));
}

#[test]
fn test_ranges_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.raw");
    let bmap = dir.path().join("disk.bmap");

    write_image(
        &image,
        5 * BS,
        &[(0, b"boot"), (2 * BS + 10, b"data"), (3 * BS, b"more")],
    );

    let map = BmapCreate::new(&image, &bmap).map().unwrap();
    assert_eq!(map.blocks_count, 5);
    assert_eq!(map.ranges.len(), 2);
    assert_eq!(map.mapped_blocks_count(), 3);

    assert_eq!(map.ranges[0].first, 0);
    assert_eq!(map.ranges[0].last, 0);
    assert_eq!(map.ranges[0].to_string(), "0");
    assert_eq!(map.ranges[1].first, 2);
    assert_eq!(map.ranges[1].last, 3);
    assert_eq!(map.ranges[1].to_string(), "2-3");

    let content = fs::read(&image).unwrap();
    let first = usize::try_from(BS).unwrap();
    assert_eq!(map.ranges[0].checksum, sha256_hex(&content[..first]));
    assert_eq!(
        map.ranges[1].checksum,
        sha256_hex(&content[2 * first..4 * first])
    );
}

#[test]
fn test_partial_last_block() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("odd.raw");
    let bmap = dir.path().join("odd.bmap");

    write_image(&image, 5000, &[(4500, b"tail")]);

    let map = BmapCreate::new(&image, &bmap).map().unwrap();
    assert_eq!(map.image_size, 5000);
    assert_eq!(map.blocks_count, 2);
    assert_eq!(map.ranges.len(), 1);
    assert_eq!(map.ranges[0].to_string(), "1");

    let content = fs::read(&image).unwrap();
    assert_eq!(map.ranges[0].checksum, sha256_hex(&content[4096..]));
}

#[test]
fn test_custom_block_size() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("small.raw");
    let bmap = dir.path().join("small.bmap");

    write_image(&image, 4096, &[(1024, b"x")]);

    let map = BmapCreate::new(&image, &bmap)
        .block_size(512)
        .map()
        .unwrap();
    assert_eq!(map.blocks_count, 8);
    assert_eq!(map.ranges.len(), 1);
    assert_eq!(map.ranges[0].to_string(), "2");
}

#[test]
fn test_generate_writes_signed_file() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.raw");
    let bmap = dir.path().join("disk.bmap");

    write_image(&image, 4 * BS, &[(BS, b"payload")]);

    let map = BmapCreate::new(&image, &bmap).generate().unwrap();
    assert_eq!(map.mapped_blocks_count(), 1);

    let xml = fs::read_to_string(&bmap).unwrap();
    assert!(xml.starts_with("<?xml version=\"1.0\" ?>"));
    assert!(xml.contains("<bmap version=\"2.0\">"));
    assert!(xml.contains("<ChecksumType> sha256 </ChecksumType>"));
    assert!(xml.contains(&format!(
        "<Range chksum=\"{}\"> 1 </Range>",
        map.ranges[0].checksum
    )));

    let start = xml.find("<BmapFileChecksum> ").unwrap() + "<BmapFileChecksum> ".len();
    let end = xml.find(" </BmapFileChecksum>").unwrap();
    let file_checksum = &xml[start..end];
    assert_eq!(file_checksum.len(), 64);

    let unsigned = xml.replace(file_checksum, &"0".repeat(64));
    assert_eq!(sha256_hex(unsigned.as_bytes()), file_checksum);
}

#[test]
fn test_missing_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("missing.raw");
    let bmap = dir.path().join("missing.bmap");

    let err = BmapCreate::new(&image, &bmap).generate().unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(!bmap.exists());
}

#[test]
fn test_zero_block_size() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.raw");
    let bmap = dir.path().join("disk.bmap");

    write_image(&image, BS, &[]);

    let err = BmapCreate::new(&image, &bmap)
        .block_size(0)
        .map()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidImage(_)));
}
