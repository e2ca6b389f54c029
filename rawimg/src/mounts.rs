use std::{
    collections::BTreeMap,
    fs::{self, DirBuilder},
    io,
    os::unix::fs::DirBuilderExt as _,
    path::{Path, PathBuf},
};

use layout::{Partition, PartitionTableKind, Subvolume};
use log::{debug, info, warn};
use tempfile::TempDir;
use types::ImagerError;

use crate::{
    context::{BuildContext, FstabEntry},
    planner::{PartitionPlanner, PartitionRequest, ResolvedPartition},
    sparse::create_sparse_file,
};

const DEFAULT_FSOPTS: &str = "defaults,noatime";

const FSTAB_TRAILER: &str = "\
devpts     /dev/pts  devpts  gid=5,mode=620   0 0
tmpfs      /dev/shm  tmpfs   defaults         0 0
proc       /proc     proc    defaults         0 0
sysfs      /sys      sysfs   defaults         0 0
";

const MKINITRD_CONFIG: &str = "\
PROBE=\"no\"
MODULES+=\"ext3 ata_piix sd_mod libata scsi_mod\"
rootfs=\"ext3\"
rootopts=\"defaults\"
";

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AttachState {
    Unattached,
    Attached(PathBuf),
    Detached,
}

/// A disk of the image and its backing file
#[derive(Debug)]
pub(crate) struct DiskHandle {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) min_size: u64,
    pub(crate) state: AttachState,
}

impl DiskHandle {
    pub(crate) fn device(&self) -> Option<&Path> {
        match &self.state {
            AttachState::Attached(dev) => Some(dev),
            AttachState::Unattached | AttachState::Detached => None,
        }
    }
}

/// Owns the image directory, the disks backing files and their mounted state
#[derive(Debug)]
pub(crate) struct MountManager<P: PartitionPlanner> {
    planner: P,
    name: String,
    instroot: PathBuf,
    tmpdir: PathBuf,
    image_dir: Option<TempDir>,
    disks: Vec<DiskHandle>,
    mounted: bool,
}

impl<P: PartitionPlanner> MountManager<P> {
    pub(crate) fn new(planner: P, ctx: &BuildContext) -> Self {
        Self {
            planner,
            name: ctx.name.clone(),
            instroot: ctx.instroot.clone(),
            tmpdir: ctx.tmpdir.clone(),
            image_dir: None,
            disks: Vec::new(),
            mounted: false,
        }
    }

    pub(crate) fn planner(&self) -> &P {
        &self.planner
    }

    pub(crate) fn disks(&self) -> &[DiskHandle] {
        &self.disks
    }

    pub(crate) fn image_dir(&self) -> Option<&Path> {
        self.image_dir.as_ref().map(TempDir::path)
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Lays out the partitions, creates one sparse file per disk and mounts
    /// everything into the instroot.
    pub(crate) fn mount_all(
        &mut self,
        specs: &[Partition],
        format: PartitionTableKind,
    ) -> Result<Vec<ResolvedPartition>, ImagerError> {
        for spec in specs {
            self.planner.add_partition(PartitionRequest::try_from(spec)?);
        }

        self.planner.layout_partitions(format)?;

        fs::create_dir_all(&self.tmpdir)?;
        let image_dir = tempfile::Builder::new()
            .prefix("imgcreate-")
            .tempdir_in(&self.tmpdir)?;
        debug!("Image directory is {}", image_dir.path().display());

        for (disk, min_size) in self.planner.disks() {
            let path = image_dir.path().join(format!("{}-{disk}.raw", self.name));

            debug!(
                "Adding disk {disk} as {} with size {min_size} bytes",
                path.display()
            );

            create_sparse_file(&path, min_size)?;
            self.planner.add_disk(&disk, &path)?;
            self.disks.push(DiskHandle {
                name: disk,
                path,
                min_size,
                state: AttachState::Unattached,
            });
        }

        self.image_dir = Some(image_dir);

        fs::create_dir_all(&self.instroot)?;
        self.mounted = true;
        self.planner.mount()?;

        for disk in &mut self.disks {
            let device = self.planner.disk_device(&disk.name).ok_or_else(|| {
                ImagerError::Mount(format!("Disk {} has no loop device", disk.name))
            })?;

            debug!("Disk {} attached to {}", disk.name, device.display());
            disk.state = AttachState::Attached(device);
        }

        self.write_mkinitrd_config()?;

        Ok(self.planner.partitions().to_vec())
    }

    fn write_mkinitrd_config(&self) -> Result<(), io::Error> {
        let dir = self.instroot.join("etc/sysconfig");
        let path = dir.join("mkinitrd");

        debug!("Writing mkinitrd config {}", path.display());

        DirBuilder::new().recursive(true).mode(0o755).create(&dir)?;
        fs::write(path, MKINITRD_CONFIG)
    }

    /// Unmounts and detaches everything. Failures are only logged.
    pub(crate) fn unmount_all(&mut self) {
        if !self.mounted {
            debug!("Nothing mounted, skipping unmount");
            return;
        }

        info!("Unmounting the image partitions");

        if let Err(e) = self.planner.unmount() {
            warn!("Couldn't unmount the image partitions: {e}");
        }

        for disk in &mut self.disks {
            disk.state = AttachState::Detached;
        }

        self.mounted = false;
    }

    /// Shrinks the backing files, once unmounted
    pub(crate) fn resparse(
        &mut self,
        size: Option<u64>,
    ) -> Result<BTreeMap<String, u64>, ImagerError> {
        if self.mounted {
            return Err(ImagerError::Mount(String::from(
                "Can't resparse the disks while they are mounted",
            )));
        }

        self.planner.resparse(size)
    }

    pub(crate) fn render_fstab(&self, entry: FstabEntry) -> String {
        render_fstab(
            self.planner.partitions(),
            &self.planner.subvolumes(),
            &self.planner.mount_order(),
            entry,
        )
    }

    /// Removes the image directory and whatever is left in it
    pub(crate) fn remove_image_dir(&mut self) -> Result<(), io::Error> {
        if let Some(dir) = self.image_dir.take() {
            debug!("Removing image directory {}", dir.path().display());
            dir.close()?;
        }

        Ok(())
    }
}

impl<P: PartitionPlanner> Drop for MountManager<P> {
    fn drop(&mut self) {
        self.unmount_all();
    }
}

fn fstab_line(device: &str, mnt: &str, fstype: &str, fsopts: Option<&str>) -> String {
    format!(
        "{device}  {mnt}  {fstype}  {} 0 0\n",
        fsopts.filter(|o| !o.is_empty()).unwrap_or(DEFAULT_FSOPTS)
    )
}

/// Renders the fstab of the image, one line per mountpoint in mount order
pub(crate) fn render_fstab(
    partitions: &[ResolvedPartition],
    subvolumes: &[(&ResolvedPartition, &Subvolume)],
    mount_order: &[String],
    entry: FstabEntry,
) -> String {
    let mut lines = Vec::new();

    for mnt in mount_order {
        let Some(part) = partitions
            .iter()
            .find(|p| p.mountpoint.as_deref() == Some(mnt.as_str()))
        else {
            warn!("No partition mounted on {mnt}, skipping");
            continue;
        };

        let device = match (entry, &part.uuid) {
            (FstabEntry::Uuid, Some(uuid)) => format!("UUID={uuid}"),
            (FstabEntry::Uuid | FstabEntry::Name, _) => part.device_name(),
        };
        let fstype = part.fstype.as_deref().unwrap_or("auto");

        lines.push(fstab_line(&device, mnt, fstype, part.fsopts.as_deref()));

        if mnt != "/" {
            continue;
        }

        for (_, subvol) in subvolumes
            .iter()
            .filter(|(parent, subvol)| parent.mountpoint.as_deref() == Some("/") && subvol.mnt != "/")
        {
            lines.push(fstab_line(
                &device,
                &subvol.mnt,
                fstype,
                subvol.fsopts.as_deref(),
            ));
        }
    }

    lines.push(FSTAB_TRAILER.to_owned());
    lines.concat()
}
