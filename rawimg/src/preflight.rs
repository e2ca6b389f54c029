use layout::Partition;
use log::debug;
use nix::unistd::Uid;
use types::{Architecture, ImagerError};

use crate::{loopback::mkfs_tool, runner::CommandRunner};

const BASE_TOOLS: [&str; 3] = ["parted", "blkid", "dd"];

/// Host tools needed to build an image with the given partitions
///
/// ARM images don't ship syslinux, so they don't need extlinux either.
pub(crate) fn required_tools(partitions: &[Partition], arch: Architecture) -> Vec<String> {
    let mut tools: Vec<String> = BASE_TOOLS.iter().map(|t| (*t).to_owned()).collect();
    if !arch.is_arm() {
        tools.push(String::from("extlinux"));
    }

    for fs in partitions.iter().filter_map(|p| p.fs.as_deref()) {
        let mut needed = vec![mkfs_tool(fs)];

        if fs == "btrfs" {
            needed.push(String::from("btrfs"));
        }

        for tool in needed {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
    }

    tools
}

pub(crate) fn check_host_tools<R: CommandRunner>(
    runner: &R,
    partitions: &[Partition],
    arch: Architecture,
) -> Result<(), ImagerError> {
    let missing: Vec<String> = required_tools(partitions, arch)
        .into_iter()
        .filter(|tool| {
            let found = runner.find_binary(tool);
            if let Some(path) = &found {
                debug!("Found {tool} at {}", path.display());
            }

            found.is_none()
        })
        .collect();

    if !missing.is_empty() {
        return Err(ImagerError::Config(format!(
            "Missing required host tools: {}",
            missing.join(", ")
        )));
    }

    Ok(())
}

pub(crate) fn check_root() -> Result<(), ImagerError> {
    if !Uid::effective().is_root() {
        return Err(ImagerError::Config(String::from(
            "Building a raw image requires root privileges",
        )));
    }

    Ok(())
}
