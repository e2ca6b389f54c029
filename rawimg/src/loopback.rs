use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File},
    io,
    os::fd::AsFd as _,
    path::{Component, Path, PathBuf},
    thread,
    time::Duration,
};

use layout::PartitionTableKind;
use log::{debug, error, info, log_enabled, trace, Level};
use loopdev::LoopControl;
use sys_mount::{FilesystemType, Mount, Unmount as _, UnmountFlags};
use types::ImagerError;
use uuid::Uuid;

use crate::{
    planner::{PartitionPlanner, PartitionRequest, ResolvedPartition},
    runner::CommandRunner,
    sparse::resparse_file,
};

const SECTOR_SIZE: u64 = 512;
const DEFAULT_ALIGN_KIB: u64 = 1024;
const GPT_BACKUP_SECTORS: u64 = 34;
const MSDOS_MAX_PRIMARY: usize = 4;

const DEVICE_WAIT_STEP: Duration = Duration::from_millis(100);
const DEVICE_WAIT_RETRIES: u32 = 50;

#[derive(Debug)]
struct LoopDevice {
    loopdev: loopdev::LoopDevice,
    path: PathBuf,
    attached: bool,
    _file: File,
}

impl LoopDevice {
    fn create(ctrl: &LoopControl, file: File) -> Result<Self, io::Error> {
        let loop_device = ctrl.next_free()?;
        let path = loop_device.path().ok_or(io::Error::new(
            io::ErrorKind::NotFound,
            "Loop Device File Not Found",
        ))?;

        debug!("Using loop device {}", path.display());

        loop_device.with().part_scan(true).attach_fd(file.as_fd())?;

        debug!("Attached the loop device to our file");

        Ok(Self {
            loopdev: loop_device,
            path,
            attached: true,
            _file: file,
        })
    }

    fn detach(&mut self) -> Result<(), io::Error> {
        if self.attached {
            debug!("Detaching loop device {}", self.path.display());

            self.loopdev.detach()?;
            self.attached = false;
        }

        Ok(())
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            error!("Couldn't detach the Loop Device: {}", e);
        }
    }
}

#[derive(Debug)]
struct MountedPartition {
    dev: PathBuf,
    mount: Option<Mount>,
}

impl MountedPartition {
    fn new(dev: &Path, target: &Path, fstype: &str, data: &str) -> Result<Self, io::Error> {
        debug!(
            "Mounting {} ({fstype}) on {}",
            dev.display(),
            target.display()
        );

        fs::create_dir_all(target)?;

        let mut builder = Mount::builder().fstype(FilesystemType::Manual(fstype));
        if !data.is_empty() {
            builder = builder.data(data);
        }

        let mount = builder.mount(dev, target)?;

        trace!("Mount Successful");

        Ok(Self {
            dev: dev.to_path_buf(),
            mount: Some(mount),
        })
    }

    fn unmount(&mut self) -> Result<(), io::Error> {
        if let Some(mnt) = self.mount.take() {
            debug!(
                "Unmounting {} from {}",
                self.dev.display(),
                mnt.target_path().display()
            );

            mnt.unmount(UnmountFlags::empty())?;
        }

        Ok(())
    }
}

impl Drop for MountedPartition {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            error!("Couldn't unmount {}: {e}", self.dev.display());
        }
    }
}

fn is_dir_in_root(root: &Path, path: &Path) -> bool {
    debug!("Checking if {} is in {}", path.display(), root.display());

    if let Ok(p) = path.canonicalize() {
        debug!("File can be canonicalized: {}", p.display());

        return p.starts_with(root);
    }

    if let Some(p) = path.parent() {
        is_dir_in_root(root, p)
    } else {
        false
    }
}

/// Joins a path found in the image to the root of the image on the host,
/// making sure the result doesn't escape the root.
fn join_path(root: &Path, path: &Path) -> Result<PathBuf, io::Error> {
    let joined = if path.is_absolute() {
        let mut joined = root.to_path_buf();

        for part in path.components() {
            match part {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => joined.push(".."),
                Component::Normal(c) => joined.push(c),
            }
        }

        joined
    } else {
        root.join(path)
    };

    let canonical = match joined.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound && is_dir_in_root(root, &joined) {
                debug!(
                    "{} doesn't exist yet but its ancestors are in the root",
                    joined.display()
                );

                return Ok(joined);
            }

            return Err(e);
        }
    };

    if !canonical.starts_with(root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path isn't contained in root",
        ));
    }

    Ok(canonical)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PartitionKind {
    Primary,
    Logical,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct PlannedPartition {
    request: usize,
    num: u32,
    kind: PartitionKind,
    start: u64,
    end: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct PlannedDisk {
    name: String,
    partitions: Vec<PlannedPartition>,
    extended: Option<(u64, u64)>,
    size_bytes: u64,
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn align_sectors(request: &PartitionRequest) -> u64 {
    (request.align_kib.unwrap_or(DEFAULT_ALIGN_KIB) * 1024 / SECTOR_SIZE).max(1)
}

/// Lays out the partitions of a disk one after the other, each on its
/// alignment boundary. Past four partitions, msdos disks get an extended
/// partition holding the remaining ones.
fn plan_disk(
    name: &str,
    requests: &[(usize, &PartitionRequest)],
    format: PartitionTableKind,
) -> PlannedDisk {
    let use_logical =
        format == PartitionTableKind::Msdos && requests.len() > MSDOS_MAX_PRIMARY;

    let mut cursor = 1;
    let mut extended_start = None;
    let mut logical_num = 5;
    let mut partitions = Vec::with_capacity(requests.len());

    for (pos, (request_idx, request)) in requests.iter().enumerate() {
        let align = align_sectors(request);

        let kind = if use_logical && pos >= MSDOS_MAX_PRIMARY - 1 {
            PartitionKind::Logical
        } else {
            PartitionKind::Primary
        };

        let num = match kind {
            PartitionKind::Primary => u32::try_from(pos + 1).unwrap_or(u32::MAX),
            PartitionKind::Logical => {
                if extended_start.is_none() {
                    cursor = align_up(cursor, align);
                    extended_start = Some(cursor);
                }

                // Leave room for the extended boot record
                cursor += 1;

                let num = logical_num;
                logical_num += 1;
                num
            }
        };

        let start = align_up(cursor, align);
        let sectors = request.size_bytes.div_ceil(SECTOR_SIZE).max(1);
        let end = start + sectors - 1;

        trace!(
            "Disk {name}: partition {num} from sector {start} to {end} ({} bytes)",
            request.size_bytes
        );

        partitions.push(PlannedPartition {
            request: *request_idx,
            num,
            kind,
            start,
            end,
        });

        cursor = end + 1;
    }

    let extended = extended_start.map(|start| (start, cursor - 1));

    let mut total = cursor;
    if format == PartitionTableKind::Gpt {
        total += GPT_BACKUP_SECTORS;
    }

    PlannedDisk {
        name: name.to_owned(),
        partitions,
        extended,
        size_bytes: align_up(total, DEFAULT_ALIGN_KIB * 1024 / SECTOR_SIZE) * SECTOR_SIZE,
    }
}

/// Device node of the given partition of a loop device
fn partition_device(loopdev: &Path, num: u32) -> PathBuf {
    let mut path = loopdev.as_os_str().to_owned();
    path.push(format!("p{num}"));
    PathBuf::from(path)
}

fn parted_fs_hint(fstype: Option<&str>) -> Option<&'static str> {
    match fstype? {
        "swap" => Some("linux-swap"),
        "vfat" | "msdos" | "fat" => Some("fat32"),
        _ => None,
    }
}

/// Tool creating filesystems of the given type
pub(crate) fn mkfs_tool(fstype: &str) -> String {
    match fstype {
        "swap" => String::from("mkswap"),
        "vfat" | "msdos" | "fat" => String::from("mkfs.vfat"),
        other => format!("mkfs.{other}"),
    }
}

/// Tool and arguments used to create a filesystem
fn mkfs_command(fstype: &str, label: Option<&str>, dev: &Path) -> (String, Vec<OsString>) {
    let tool = mkfs_tool(fstype);
    let label_flag = match fstype {
        "vfat" | "msdos" | "fat" => "-n",
        _ => "-L",
    };

    let mut args = Vec::new();
    if fstype == "btrfs" {
        args.push(OsString::from("-f"));
    }

    if let Some(label) = label {
        args.push(OsString::from(label_flag));
        args.push(OsString::from(label));
    }

    args.push(dev.as_os_str().to_owned());

    (tool, args)
}

#[derive(Debug)]
struct MountEntry {
    mountpoint: String,
    device: PathBuf,
    fstype: String,
    data: String,
}

/// Partitions disk images with parted, attaches them to loop devices and
/// mounts their filesystems in the instroot.
#[derive(Debug)]
pub(crate) struct LoopbackPlanner<R: CommandRunner> {
    runner: R,
    instroot: PathBuf,
    format: PartitionTableKind,
    requests: Vec<PartitionRequest>,
    disks: Vec<PlannedDisk>,
    files: BTreeMap<String, PathBuf>,
    resolved: Vec<ResolvedPartition>,
    loop_devices: Vec<(String, LoopDevice)>,
    mounts: Vec<MountedPartition>,
}

impl<R: CommandRunner> LoopbackPlanner<R> {
    pub(crate) fn new(runner: R, instroot: &Path) -> Self {
        Self {
            runner,
            instroot: instroot.to_path_buf(),
            format: PartitionTableKind::default(),
            requests: Vec::new(),
            disks: Vec::new(),
            files: BTreeMap::new(),
            resolved: Vec::new(),
            loop_devices: Vec::new(),
            mounts: Vec::new(),
        }
    }

    fn tool(&self, name: &str) -> Result<PathBuf, ImagerError> {
        self.runner
            .find_binary(name)
            .ok_or_else(|| ImagerError::Mount(format!("Couldn't find {name}")))
    }

    fn run_tool(&mut self, name: &str, args: &[OsString], what: &str) -> Result<(), ImagerError> {
        let tool = self.tool(name)?;

        if !self.runner.run(&tool, args)? {
            return Err(ImagerError::Mount(what.to_owned()));
        }

        Ok(())
    }

    fn parted(&mut self, file: &Path, args: &[String]) -> Result<(), ImagerError> {
        let mut full_args = vec![OsString::from("-s"), file.as_os_str().to_owned()];
        full_args.extend(args.iter().map(OsString::from));

        self.run_tool(
            "parted",
            &full_args,
            &format!("Error running parted {} on {}", args.join(" "), file.display()),
        )
    }

    fn partition_disk(&mut self, disk: &PlannedDisk, file: &Path) -> Result<(), ImagerError> {
        info!("Creating {} partition table on {}", self.format, disk.name);

        self.parted(file, &[String::from("mklabel"), self.format.to_string()])?;

        if let Some((start, end)) = disk.extended {
            self.parted(
                file,
                &[
                    String::from("unit"),
                    String::from("s"),
                    String::from("mkpart"),
                    String::from("extended"),
                    format!("{start}s"),
                    format!("{end}s"),
                ],
            )?;
        }

        for part in &disk.partitions {
            let request = self.requests[part.request].clone();

            let part_name = match (self.format, part.kind) {
                (PartitionTableKind::Msdos, PartitionKind::Primary) => String::from("primary"),
                (PartitionTableKind::Msdos, PartitionKind::Logical) => String::from("logical"),
                (PartitionTableKind::Gpt, PartitionKind::Primary | PartitionKind::Logical) => {
                    request.label.clone().unwrap_or_else(|| String::from("primary"))
                }
            };

            let mut args = vec![
                String::from("unit"),
                String::from("s"),
                String::from("mkpart"),
                part_name,
            ];
            if let Some(hint) = parted_fs_hint(request.fstype.as_deref()) {
                args.push(hint.to_owned());
            }
            args.push(format!("{}s", part.start));
            args.push(format!("{}s", part.end));

            self.parted(file, &args)?;

            if request.bootable {
                let flag = match self.format {
                    PartitionTableKind::Msdos => "boot",
                    PartitionTableKind::Gpt => "legacy_boot",
                };

                self.parted(
                    file,
                    &[
                        String::from("set"),
                        part.num.to_string(),
                        flag.to_owned(),
                        String::from("on"),
                    ],
                )?;
            }

            if let (PartitionTableKind::Gpt, Some(part_type)) = (self.format, &request.part_type) {
                self.parted(
                    file,
                    &[String::from("type"), part.num.to_string(), part_type.clone()],
                )?;
            }
        }

        Ok(())
    }

    fn wait_for_device(dev: &Path) -> Result<(), ImagerError> {
        for _ in 0..DEVICE_WAIT_RETRIES {
            if dev.exists() {
                return Ok(());
            }

            thread::sleep(DEVICE_WAIT_STEP);
        }

        Err(ImagerError::Mount(format!(
            "Partition device {} never showed up",
            dev.display()
        )))
    }

    fn blkid_value(&mut self, dev: &Path, low_level: bool, tag: &str) -> Result<Option<String>, ImagerError> {
        let blkid = self.tool("blkid")?;

        let mut args = Vec::new();
        if low_level {
            args.push(OsString::from("-p"));
        }
        args.extend([
            OsString::from("-s"),
            OsString::from(tag),
            OsString::from("-o"),
            OsString::from("value"),
            dev.as_os_str().to_owned(),
        ]);

        Ok(self
            .runner
            .output(&blkid, &args)?
            .filter(|value| !value.is_empty()))
    }

    fn create_subvolumes(&mut self, idx: usize, dev: &Path) -> Result<(), ImagerError> {
        let subvolumes = self.resolved[idx].subvolumes.clone();
        if subvolumes.is_empty() {
            return Ok(());
        }

        let scratch = tempfile::tempdir()?;
        let mut top = MountedPartition::new(dev, scratch.path(), "btrfs", "")?;

        for subvol in &subvolumes {
            debug!("Creating btrfs subvolume {} on {}", subvol.name, dev.display());

            self.run_tool(
                "btrfs",
                &[
                    OsString::from("subvolume"),
                    OsString::from("create"),
                    scratch.path().join(&subvol.name).into_os_string(),
                ],
                &format!("Couldn't create btrfs subvolume {}", subvol.name),
            )?;
        }

        top.unmount()?;
        Ok(())
    }

    fn mount_entries(&self) -> Vec<MountEntry> {
        let mut entries = Vec::new();

        for part in &self.resolved {
            let (Some(mnt), Some(fstype)) = (&part.mountpoint, &part.fstype) else {
                continue;
            };

            if fstype == "swap" || part.subvolumes.iter().any(|s| s.mnt == *mnt) {
                continue;
            }

            let Some(device) = self.device_of(part) else {
                continue;
            };

            entries.push(MountEntry {
                mountpoint: mnt.clone(),
                device,
                fstype: fstype.clone(),
                data: String::new(),
            });
        }

        for (parent, subvol) in self.subvolumes() {
            let (Some(fstype), Some(device)) = (&parent.fstype, self.device_of(parent)) else {
                continue;
            };

            entries.push(MountEntry {
                mountpoint: subvol.mnt.clone(),
                device,
                fstype: fstype.clone(),
                data: format!("subvol={}", subvol.name),
            });
        }

        entries.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
        entries
    }

    fn device_of(&self, part: &ResolvedPartition) -> Option<PathBuf> {
        let loopdev = self.disk_device(&part.disk_name)?;

        Some(partition_device(&loopdev, part.num))
    }

    /// Creates the filesystem of a partition and reads its identifiers back
    fn format_partition(&mut self, idx: usize, dev: &Path) -> Result<(), ImagerError> {
        if let Some(fstype) = self.resolved[idx].fstype.clone() {
            // Resolved partitions follow the requests order
            let label = self.requests[idx].label.clone();

            let (tool, args) = mkfs_command(&fstype, label.as_deref(), dev);

            info!("Creating {fstype} filesystem on {}", dev.display());
            self.run_tool(
                &tool,
                &args,
                &format!("Couldn't create {fstype} filesystem on {}", dev.display()),
            )?;

            self.resolved[idx].uuid = self.blkid_value(dev, false, "UUID")?;
        }

        if self.format == PartitionTableKind::Gpt {
            self.resolved[idx].partuuid = self
                .blkid_value(dev, true, "PART_ENTRY_UUID")?
                .map(|value| {
                    Uuid::parse_str(&value)
                        .map(|uuid| uuid.to_string())
                        .map_err(|e| {
                            ImagerError::Mount(format!(
                                "Invalid partition UUID {value} for {}: {e}",
                                dev.display()
                            ))
                        })
                })
                .transpose()?;
        }

        if log_enabled!(Level::Debug) {
            let part = &self.resolved[idx];
            debug!(
                "Partition {} UUID {} PARTUUID {}",
                dev.display(),
                part.uuid.as_deref().unwrap_or("none"),
                part.partuuid.as_deref().unwrap_or("none")
            );
        }

        Ok(())
    }
}

impl<R: CommandRunner> PartitionPlanner for LoopbackPlanner<R> {
    fn add_partition(&mut self, request: PartitionRequest) {
        debug!(
            "Adding partition of {} bytes on {} for {}",
            request.size_bytes,
            request.disk,
            request.mountpoint.as_deref().unwrap_or("no mountpoint")
        );

        self.requests.push(request);
    }

    fn layout_partitions(&mut self, format: PartitionTableKind) -> Result<(), ImagerError> {
        self.format = format;

        let mut disk_names: Vec<&str> = Vec::new();
        for request in &self.requests {
            if !disk_names.contains(&request.disk.as_str()) {
                disk_names.push(&request.disk);
            }
        }

        let mut resolved: Vec<Option<ResolvedPartition>> = vec![None; self.requests.len()];
        let mut disks = Vec::with_capacity(disk_names.len());

        for name in disk_names {
            let requests: Vec<(usize, &PartitionRequest)> = self
                .requests
                .iter()
                .enumerate()
                .filter(|(_, r)| r.disk == name)
                .collect();

            let disk = plan_disk(name, &requests, format);
            debug!("Disk {name} needs {} bytes", disk.size_bytes);

            for part in &disk.partitions {
                let request = &self.requests[part.request];

                resolved[part.request] = Some(ResolvedPartition {
                    disk_name: name.to_owned(),
                    num: part.num,
                    mountpoint: request.mountpoint.clone(),
                    fstype: request.fstype.clone(),
                    fsopts: request.fsopts.clone(),
                    uuid: None,
                    partuuid: None,
                    subvolumes: request.subvolumes.clone(),
                });
            }

            disks.push(disk);
        }

        self.resolved = resolved.into_iter().flatten().collect();
        self.disks = disks;

        Ok(())
    }

    fn disks(&self) -> Vec<(String, u64)> {
        self.disks
            .iter()
            .map(|d| (d.name.clone(), d.size_bytes))
            .collect()
    }

    fn add_disk(&mut self, name: &str, path: &Path) -> Result<(), ImagerError> {
        if !self.disks.iter().any(|d| d.name == name) {
            return Err(ImagerError::Mount(format!("Unknown disk {name}")));
        }

        self.files.insert(name.to_owned(), path.to_path_buf());
        Ok(())
    }

    fn mount(&mut self) -> Result<(), ImagerError> {
        let disks = self.disks.clone();

        for disk in &disks {
            let file = self.files.get(&disk.name).cloned().ok_or_else(|| {
                ImagerError::Mount(format!("Disk {} has no backing file", disk.name))
            })?;

            self.partition_disk(disk, &file)?;

            let loop_control = LoopControl::open()?;
            let backing = File::options().read(true).write(true).open(&file)?;
            let loop_device = LoopDevice::create(&loop_control, backing)?;
            self.loop_devices.push((disk.name.clone(), loop_device));
        }

        for idx in 0..self.resolved.len() {
            let Some(dev) = self.device_of(&self.resolved[idx]) else {
                continue;
            };

            Self::wait_for_device(&dev)?;
            self.format_partition(idx, &dev)?;

            if self.resolved[idx].fstype.as_deref() == Some("btrfs") {
                self.create_subvolumes(idx, &dev)?;
            }
        }

        let root = self.instroot.canonicalize()?;
        for entry in self.mount_entries() {
            let target = join_path(&root, Path::new(&entry.mountpoint))?;

            let mount = MountedPartition::new(&entry.device, &target, &entry.fstype, &entry.data)
                .map_err(|e| {
                    ImagerError::Mount(format!(
                        "Couldn't mount {} on {}: {e}",
                        entry.device.display(),
                        target.display()
                    ))
                })?;

            self.mounts.push(mount);
        }

        Ok(())
    }

    fn unmount(&mut self) -> Result<(), ImagerError> {
        let mut failures = Vec::new();

        while let Some(mut mount) = self.mounts.pop() {
            if let Err(e) = mount.unmount() {
                failures.push(format!("{}: {e}", mount.dev.display()));
            }
        }

        while let Some((name, mut loop_device)) = self.loop_devices.pop() {
            if let Err(e) = loop_device.detach() {
                failures.push(format!("{name}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ImagerError::Mount(format!(
                "Unmount failed: {}",
                failures.join(", ")
            )))
        }
    }

    fn resparse(&mut self, size: Option<u64>) -> Result<BTreeMap<String, u64>, ImagerError> {
        self.files
            .iter()
            .map(|(name, path)| Ok((name.clone(), resparse_file(path, size)?)))
            .collect()
    }

    fn partitions(&self) -> &[ResolvedPartition] {
        &self.resolved
    }

    fn mount_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .resolved
            .iter()
            .filter(|p| p.fstype.as_deref() != Some("swap"))
            .filter_map(|p| p.mountpoint.clone())
            .collect();

        order.sort();
        order
    }

    fn disk_device(&self, name: &str) -> Option<PathBuf> {
        self.loop_devices
            .iter()
            .find(|(disk, _)| disk == name)
            .map(|(_, dev)| dev.path.clone())
    }
}
