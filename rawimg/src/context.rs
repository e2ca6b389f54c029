use std::path::PathBuf;

use layout::PartitionTableKind;
use serde::Deserialize;
use types::{Architecture, CompressionAlgorithm};

/// How the partitions are referred to in the generated fstab
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FstabEntry {
    /// `UUID=<filesystem uuid>`, when the filesystem has one
    #[default]
    Uuid,

    /// `/dev/<disk><num>`
    Name,
}

/// Everything a single image build needs to know, created once in `main`
#[derive(Clone, Debug)]
pub(crate) struct BuildContext {
    pub(crate) name: String,
    pub(crate) instroot: PathBuf,
    pub(crate) outdir: PathBuf,
    pub(crate) tmpdir: PathBuf,
    pub(crate) ptable: PartitionTableKind,
    pub(crate) arch: Architecture,
    pub(crate) distro_name: String,
    pub(crate) bootloader_append: String,
    pub(crate) vcpu: u32,
    pub(crate) vmem_mib: u64,
    pub(crate) checksum: bool,
    pub(crate) compression: Option<CompressionAlgorithm>,
    pub(crate) pack_to: Option<String>,
    pub(crate) generate_bmap: bool,
    pub(crate) fstab_entry: FstabEntry,
    pub(crate) appliance_version: Option<String>,
    pub(crate) appliance_release: Option<String>,
    pub(crate) networks: usize,
}

impl BuildContext {
    /// File name of a file generated for a given disk, `<name>-<disk>.<ext>`
    pub(crate) fn full_name(&self, disk: &str, ext: &str) -> String {
        format!("{}-{disk}.{ext}", self.name)
    }

    pub(crate) fn disk_file_name(&self, disk: &str) -> String {
        self.full_name(disk, "raw")
    }
}

/// Builds the image name out of the description stem and the optional affixes
pub(crate) fn image_name(stem: &str, prefix: Option<&str>, suffix: Option<&str>) -> String {
    let mut parts = Vec::with_capacity(3);

    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        parts.push(prefix);
    }

    parts.push(stem);

    if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
        parts.push(suffix);
    }

    parts.join("-")
}
