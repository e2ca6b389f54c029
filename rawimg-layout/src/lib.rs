#![doc = include_str!("../README.md")]
#![allow(missing_docs)]

use core::fmt;

#[cfg(feature = "schema")]
use schemars::JsonSchema;

use serde::{Deserialize, Serialize};
use serde_json as _;

/// Size of the partition created when a description doesn't list any, in bytes.
pub const DEFAULT_PARTITION_SIZE_BYTES: u64 = 1900 << 20;

/// Disk the default partition is created on.
pub const DEFAULT_PARTITION_DISK: &str = "sda";

/// Filesystem of the default partition.
pub const DEFAULT_PARTITION_FS: &str = "ext3";

/// Partition table format written on every disk
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableKind {
    /// DOS / MBR partition table
    #[default]
    Msdos,

    /// GUID Partition Table
    Gpt,
}

impl PartitionTableKind {
    /// Label name, as understood by parted
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msdos => "msdos",
            Self::Gpt => "gpt",
        }
    }
}

impl fmt::Display for PartitionTableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Bootloader {
    #[serde(default)]
    pub ptable: PartitionTableKind,

    /// Extra kernel command line options
    #[serde(default)]
    pub append: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Subvolume {
    pub name: String,
    pub mnt: String,
    pub fsopts: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Partition {
    #[serde(rename = "size-bytes")]
    pub size_bytes: u64,
    pub disk: Option<String>,
    pub mnt: Option<String>,
    pub fs: Option<String>,
    pub label: Option<String>,
    pub fsopts: Option<String>,

    #[serde(default)]
    pub bootable: bool,

    #[serde(rename = "align-kib")]
    pub align_kib: Option<u64>,

    #[serde(rename = "part-type")]
    pub part_type: Option<String>,

    #[serde(default)]
    pub subvolumes: Vec<Subvolume>,
}

impl Partition {
    /// The partition used when a description doesn't provide any: a single
    /// root filesystem on the first disk.
    #[must_use]
    pub fn default_root() -> Self {
        Self {
            size_bytes: DEFAULT_PARTITION_SIZE_BYTES,
            disk: Some(DEFAULT_PARTITION_DISK.to_owned()),
            mnt: Some(String::from("/")),
            fs: Some(DEFAULT_PARTITION_FS.to_owned()),
            label: None,
            fsopts: None,
            bootable: false,
            align_kib: None,
            part_type: None,
            subvolumes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Network {
    pub device: Option<String>,
    pub bootproto: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Packages {
    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub excluded: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ImageDescription {
    pub name: Option<String>,

    #[serde(default)]
    pub bootloader: Bootloader,

    #[serde(default)]
    pub partitions: Vec<Partition>,

    #[serde(default)]
    pub networks: Vec<Network>,

    #[serde(default)]
    pub packages: Packages,
}
