#![doc = include_str!("../README.md")]

use core::fmt;
use std::{
    fs::{self, File},
    io::{self, BufReader, Read as _},
    path::{Path, PathBuf},
};

use log::{debug, trace};
use sha2::{Digest as _, Sha256};

/// Default size of a block, in bytes
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

const BMAP_VERSION: &str = "2.0";
const CHECKSUM_TYPE: &str = "sha256";
const CHECKSUM_PLACEHOLDER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const READ_BUFFER_SIZE: usize = 1 << 20;

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error has occurred when accessing the image or the block map file
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// The image can't be mapped with the given parameters
    #[error("Invalid Image: {0}")]
    InvalidImage(String),
}

/// A contiguous range of blocks holding data
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MappedRange {
    /// Index of the first block of the range
    pub first: u64,

    /// Index of the last block of the range, inclusive
    pub last: u64,

    /// Hex-encoded SHA-256 of the range content
    pub checksum: String,
}

impl MappedRange {
    /// Number of blocks in this range
    #[must_use]
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Always false, a range holds at least one block
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// The block map of an image
#[derive(Debug, Eq, PartialEq)]
pub struct BlockMap {
    /// Size of the image, in bytes
    pub image_size: u64,

    /// Size of a block, in bytes
    pub block_size: u64,

    /// Number of blocks in the image, the last one possibly partial
    pub blocks_count: u64,

    /// Ranges of blocks holding data, in ascending order
    pub ranges: Vec<MappedRange>,
}

impl BlockMap {
    /// Number of blocks holding data
    #[must_use]
    pub fn mapped_blocks_count(&self) -> u64 {
        self.ranges.iter().map(MappedRange::len).sum()
    }

    /// Renders the bmap document, including its own checksum
    #[must_use]
    pub fn to_xml(&self) -> String {
        let unsigned = BmapDocument {
            map: self,
            file_checksum: CHECKSUM_PLACEHOLDER,
        }
        .to_string();

        let file_checksum = hex::encode(Sha256::digest(unsigned.as_bytes()));
        trace!("Block map file checksum is {file_checksum}");

        BmapDocument {
            map: self,
            file_checksum: &file_checksum,
        }
        .to_string()
    }
}

struct BmapDocument<'a> {
    map: &'a BlockMap,
    file_checksum: &'a str,
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KiB", "MiB", "GiB", "TiB"];

    let mut unit = 0;
    let mut value = bytes;
    while value >= 1024 && unit < UNITS.len() - 1 {
        value /= 1024;
        unit += 1;
    }

    format!("{value} {}", UNITS[unit])
}

impl fmt::Display for BmapDocument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.map;
        let mapped = map.mapped_blocks_count();

        writeln!(f, "<?xml version=\"1.0\" ?>")?;
        writeln!(
            f,
            "<!-- This file contains the block map for an image file. It lists the blocks"
        )?;
        writeln!(
            f,
            "     which hold data and have to be copied to the target device. -->"
        )?;
        writeln!(f)?;
        writeln!(f, "<bmap version=\"{BMAP_VERSION}\">")?;
        writeln!(
            f,
            "    <!-- Image size in bytes: {} -->",
            human_size(map.image_size)
        )?;
        writeln!(f, "    <ImageSize> {} </ImageSize>", map.image_size)?;
        writeln!(f)?;
        writeln!(f, "    <!-- Size of a block in bytes -->")?;
        writeln!(f, "    <BlockSize> {} </BlockSize>", map.block_size)?;
        writeln!(f)?;
        writeln!(f, "    <!-- Count of blocks in the image file -->")?;
        writeln!(f, "    <BlocksCount> {} </BlocksCount>", map.blocks_count)?;
        writeln!(f)?;
        writeln!(
            f,
            "    <!-- Count of mapped blocks: {} -->",
            human_size(mapped * map.block_size)
        )?;
        writeln!(f, "    <MappedBlocksCount> {mapped} </MappedBlocksCount>")?;
        writeln!(f)?;
        writeln!(f, "    <!-- Type of checksum used in this file -->")?;
        writeln!(f, "    <ChecksumType> {CHECKSUM_TYPE} </ChecksumType>")?;
        writeln!(f)?;
        writeln!(
            f,
            "    <!-- The checksum of this bmap file, computed with this field set to zeros -->"
        )?;
        writeln!(
            f,
            "    <BmapFileChecksum> {} </BmapFileChecksum>",
            self.file_checksum
        )?;
        writeln!(f)?;
        writeln!(f, "    <BlockMap>")?;
        for range in &map.ranges {
            writeln!(
                f,
                "        <Range chksum=\"{}\"> {range} </Range>",
                range.checksum
            )?;
        }
        writeln!(f, "    </BlockMap>")?;
        writeln!(f, "</bmap>")
    }
}

struct RangeBuilder {
    first: u64,
    last: u64,
    hasher: Sha256,
}

impl RangeBuilder {
    fn new(block: u64, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);

        Self {
            first: block,
            last: block,
            hasher,
        }
    }

    fn build(self) -> MappedRange {
        MappedRange {
            first: self.first,
            last: self.last,
            checksum: hex::encode(self.hasher.finalize()),
        }
    }
}

/// Block map generator for an image file
#[derive(Debug)]
pub struct BmapCreate {
    image: PathBuf,
    output: PathBuf,
    block_size: u64,
}

impl BmapCreate {
    /// Creates a generator mapping `image` into the bmap file `output`
    #[must_use]
    pub fn new(image: &Path, output: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            output: output.to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Sets the block size used to map the image
    #[must_use]
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Scans the image and computes its block map
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the image can't be read, or if the block size is zero.
    pub fn map(&self) -> Result<BlockMap, Error> {
        if self.block_size == 0 {
            return Err(Error::InvalidImage(String::from("Block size is zero")));
        }

        let block_size = usize::try_from(self.block_size)
            .map_err(|_err| Error::InvalidImage(String::from("Block size too large")))?;

        let file = File::open(&self.image)?;
        let image_size = file.metadata()?.len();
        let blocks_count = image_size.div_ceil(self.block_size);

        debug!(
            "Mapping {} ({image_size} bytes, {blocks_count} blocks of {} bytes)",
            self.image.display(),
            self.block_size
        );

        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let mut block = vec![0_u8; block_size];
        let mut ranges = Vec::new();
        let mut current: Option<RangeBuilder> = None;

        for idx in 0..blocks_count {
            let remaining = image_size - idx * self.block_size;
            let len = usize::try_from(remaining.min(self.block_size))
                .map_err(|_err| Error::InvalidImage(String::from("Block size too large")))?;

            let data = &mut block[..len];
            reader.read_exact(data)?;

            if data.iter().all(|b| *b == 0) {
                if let Some(range) = current.take() {
                    ranges.push(range.build());
                }

                continue;
            }

            match current.as_mut() {
                Some(range) => {
                    range.last = idx;
                    range.hasher.update(&*data);
                }
                None => current = Some(RangeBuilder::new(idx, data)),
            }
        }

        if let Some(range) = current.take() {
            ranges.push(range.build());
        }

        Ok(BlockMap {
            image_size,
            block_size: self.block_size,
            blocks_count,
            ranges,
        })
    }

    /// Maps the image and writes the bmap file
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the image can't be mapped or the bmap file written.
    pub fn generate(&self) -> Result<BlockMap, Error> {
        let map = self.map()?;

        debug!(
            "Writing block map of {} to {}: {} of {} blocks mapped",
            self.image.display(),
            self.output.display(),
            map.mapped_blocks_count(),
            map.blocks_count
        );

        fs::write(&self.output, map.to_xml())?;

        Ok(map)
    }
}
