use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use layout::{Partition, PartitionTableKind, Subvolume};
use types::ImagerError;

/// A partition to create, as handed over to the planner
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PartitionRequest {
    pub(crate) disk: String,
    pub(crate) size_bytes: u64,
    pub(crate) mountpoint: Option<String>,
    pub(crate) fstype: Option<String>,
    pub(crate) label: Option<String>,
    pub(crate) fsopts: Option<String>,
    pub(crate) bootable: bool,
    pub(crate) align_kib: Option<u64>,
    pub(crate) part_type: Option<String>,
    pub(crate) subvolumes: Vec<Subvolume>,
}

impl TryFrom<&Partition> for PartitionRequest {
    type Error = ImagerError;

    fn try_from(part: &Partition) -> Result<Self, Self::Error> {
        let disk = part.disk.clone().ok_or(ImagerError::Config(String::from(
            "Failed to create disks, no disk specified for a partition",
        )))?;

        Ok(Self {
            disk,
            size_bytes: part.size_bytes,
            mountpoint: part.mnt.clone(),
            fstype: part.fs.clone(),
            label: part.label.clone(),
            fsopts: part.fsopts.clone(),
            bootable: part.bootable,
            align_kib: part.align_kib,
            part_type: part.part_type.clone(),
            subvolumes: part.subvolumes.clone(),
        })
    }
}

/// A partition as laid out and mounted by the planner
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ResolvedPartition {
    pub(crate) disk_name: String,
    pub(crate) num: u32,
    pub(crate) mountpoint: Option<String>,
    pub(crate) fstype: Option<String>,
    pub(crate) fsopts: Option<String>,
    pub(crate) uuid: Option<String>,
    pub(crate) partuuid: Option<String>,
    pub(crate) subvolumes: Vec<Subvolume>,
}

impl ResolvedPartition {
    /// Kernel device name of the partition, `/dev/<disk><num>`
    pub(crate) fn device_name(&self) -> String {
        format!("/dev/{}{}", self.disk_name, self.num)
    }
}

/// Partitions, attaches and mounts the disks of an image
///
/// Partition table math, loop devices and filesystem creation all live
/// behind this trait.
pub(crate) trait PartitionPlanner {
    fn add_partition(&mut self, request: PartitionRequest);

    /// Computes the partitions offsets and the minimum size of every disk
    fn layout_partitions(&mut self, format: PartitionTableKind) -> Result<(), ImagerError>;

    /// Disks names and their minimum size in bytes, in the order they were first used
    fn disks(&self) -> Vec<(String, u64)>;

    /// Registers the backing file of a disk
    fn add_disk(&mut self, name: &str, path: &Path) -> Result<(), ImagerError>;

    /// Writes the partition tables, creates the filesystems and mounts them
    fn mount(&mut self) -> Result<(), ImagerError>;

    fn unmount(&mut self) -> Result<(), ImagerError>;

    /// Shrinks every backing file, returning their size by disk name
    fn resparse(&mut self, size: Option<u64>) -> Result<BTreeMap<String, u64>, ImagerError>;

    fn partitions(&self) -> &[ResolvedPartition];

    /// Mountpoints, in the order they get mounted
    fn mount_order(&self) -> Vec<String>;

    /// Subvolumes declared on any partition, along with their parent partition
    fn subvolumes(&self) -> Vec<(&ResolvedPartition, &Subvolume)> {
        self.partitions()
            .iter()
            .flat_map(|p| p.subvolumes.iter().map(move |s| (p, s)))
            .collect()
    }

    /// Loop device a disk is attached to, once mounted
    fn disk_device(&self, name: &str) -> Option<PathBuf>;
}
