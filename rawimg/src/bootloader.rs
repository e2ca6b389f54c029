use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use layout::PartitionTableKind;
use log::{debug, info};
use nix::unistd::sync;
use types::ImagerError;

use crate::{mounts::DiskHandle, runner::CommandRunner};

const SYSLINUX_DIR: &str = "usr/share/syslinux";
const EXTLINUX_DIR: &str = "boot/extlinux";

/// Whether the instroot ships what's needed to configure and install syslinux
pub(crate) fn bootloader_available(instroot: &Path) -> bool {
    instroot.join(SYSLINUX_DIR).is_dir() && instroot.join(EXTLINUX_DIR).is_dir()
}

fn master_record_path(instroot: &Path, ptable: PartitionTableKind) -> PathBuf {
    let blob = match ptable {
        PartitionTableKind::Gpt => "gptmbr.bin",
        PartitionTableKind::Msdos => "mbr.bin",
    };

    instroot.join(SYSLINUX_DIR).join(blob)
}

/// Copies the syslinux boot record onto the first sectors of the disk
pub(crate) fn write_master_record<R: CommandRunner>(
    runner: &mut R,
    instroot: &Path,
    ptable: PartitionTableKind,
    device: &Path,
) -> Result<(), ImagerError> {
    let record = master_record_path(instroot, ptable);
    let size = fs::metadata(&record)
        .map_err(|e| {
            ImagerError::Mount(format!(
                "Unable to read boot record {}: {e}",
                record.display()
            ))
        })?
        .len();

    debug!(
        "Installing syslinux boot record {} to {}",
        record.display(),
        device.display()
    );

    let dd = runner
        .find_binary("dd")
        .ok_or(ImagerError::Mount(String::from("Couldn't find dd")))?;

    let mut input = OsString::from("if=");
    input.push(&record);

    let mut output = OsString::from("of=");
    output.push(device);

    let success = runner.run(
        &dd,
        &[
            input,
            output,
            OsString::from(format!("bs={size}")),
            OsString::from("count=1"),
            OsString::from("conv=notrunc"),
        ],
    )?;

    if !success {
        return Err(ImagerError::Mount(format!(
            "Unable to set MBR to {}",
            device.display()
        )));
    }

    Ok(())
}

pub(crate) fn install_bootloader<R: CommandRunner>(
    runner: &mut R,
    instroot: &Path,
    device: &Path,
) -> Result<(), ImagerError> {
    let extlinux = runner.find_binary("extlinux").ok_or(ImagerError::Mount(String::from(
        "Couldn't find extlinux",
    )))?;

    let success = runner.run(
        &extlinux,
        &[
            OsString::from("-i"),
            instroot.join(EXTLINUX_DIR).into_os_string(),
        ],
    )?;

    if !success {
        return Err(ImagerError::Mount(format!(
            "Unable to install syslinux bootloader to {}",
            device.display()
        )));
    }

    Ok(())
}

/// Installs the boot record and extlinux on every disk
pub(crate) fn install_on_disks<R: CommandRunner>(
    runner: &mut R,
    instroot: &Path,
    ptable: PartitionTableKind,
    disks: &[DiskHandle],
) -> Result<(), ImagerError> {
    for disk in disks {
        let device = disk.device().ok_or_else(|| {
            ImagerError::Mount(format!("Disk {} isn't attached", disk.name))
        })?;

        info!("Installing the bootloader on {}", disk.name);

        write_master_record(runner, instroot, ptable, device)?;

        // extlinux must see the boot record
        sync();

        install_bootloader(runner, instroot, device)?;
    }

    Ok(())
}
