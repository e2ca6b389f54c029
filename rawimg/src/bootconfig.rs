use std::{collections::BTreeMap, fs, io, path::Path};

use layout::PartitionTableKind;
use log::debug;
use types::ImagerError;

use crate::planner::ResolvedPartition;

const MENU_COLORS: &str = "\
menu color border 0 #ffffffff #00000000
menu color sel 7 #ffffffff #ff000000
menu color title 0 #ffffffff #00000000
menu color tabmsg 0 #ffffffff #00000000
menu color unsel 0 #ffffffff #00000000
menu color hotsel 0 #ff000000 #ffffffff
menu color hotkey 7 #ffffffff #ff000000
menu color timeout_msg 0 #ffffffff #00000000
menu color timeout 0 #ffffffff #00000000
menu color cmdline 0 #ffffffff #00000000
";

/// The partition mounted on `/`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct RootDevice {
    pub(crate) device: Option<String>,
    pub(crate) partuuid: Option<String>,
}

pub(crate) fn resolve_root_device(
    partitions: &[ResolvedPartition],
    ptable: PartitionTableKind,
) -> RootDevice {
    partitions
        .iter()
        .rfind(|p| p.mountpoint.as_deref() == Some("/"))
        .map(|p| RootDevice {
            device: Some(p.device_name()),
            partuuid: match ptable {
                PartitionTableKind::Gpt => p.partuuid.clone(),
                PartitionTableKind::Msdos => None,
            },
        })
        .unwrap_or_default()
}

/// Kernels the boot menu offers
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum KernelEntries {
    /// `/boot/vmlinuz` links to the kernel of the given version
    Symlink(String),

    /// One entry per installed kernel version
    Versions(Vec<String>),
}

/// Finds the kernels to boot, the `/boot/vmlinuz` link taking precedence
/// over the versions reported by the installer.
pub(crate) fn discover_kernels(
    instroot: &Path,
    installed: &BTreeMap<String, Vec<String>>,
) -> Result<KernelEntries, io::Error> {
    let link = instroot.join("boot/vmlinuz");

    if link.symlink_metadata().is_ok() {
        let target = if link.is_symlink() {
            fs::read_link(&link)?
        } else {
            link.clone()
        };

        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let version = file_name
            .strip_prefix("vmlinuz-")
            .unwrap_or(&file_name)
            .to_owned();

        debug!("Found kernel link {} to version {version}", link.display());
        return Ok(KernelEntries::Symlink(version));
    }

    Ok(KernelEntries::Versions(
        installed.values().flatten().cloned().collect(),
    ))
}

#[derive(Debug)]
pub(crate) struct BootMenuParams<'a> {
    pub(crate) distro_name: &'a str,
    pub(crate) append: &'a str,
    pub(crate) ptable: PartitionTableKind,
    pub(crate) root: &'a RootDevice,
    pub(crate) kernels: &'a KernelEntries,
    pub(crate) splash: bool,
}

fn root_string(params: &BootMenuParams<'_>) -> Result<String, ImagerError> {
    match params.ptable {
        PartitionTableKind::Msdos => params.root.device.clone().ok_or(ImagerError::Mount(
            String::from("Cannot find the root partition"),
        )),
        PartitionTableKind::Gpt => params
            .root
            .partuuid
            .as_ref()
            .map(|uuid| format!("PARTUUID={uuid}"))
            .ok_or(ImagerError::Mount(String::from(
                "Cannot find the root GPT partition UUID",
            ))),
    }
}

/// Renders the extlinux configuration
pub(crate) fn render_boot_menu(params: &BootMenuParams<'_>) -> Result<String, ImagerError> {
    let distro = params.distro_name;
    let label = distro.to_lowercase();
    let root = root_string(params)?;
    let splash = if params.splash {
        "menu background splash.jpg"
    } else {
        ""
    };

    let mut lines = vec![
        String::from("prompt 0\n"),
        String::from("timeout 1\n"),
        String::from("\n"),
        String::from("default vesamenu.c32\n"),
        format!("menu autoboot Starting {distro}...\n"),
        String::from("menu hidden\n"),
        String::from("\n"),
        format!("{splash}\n"),
        format!("menu title Welcome to {distro}!\n"),
        MENU_COLORS.to_owned(),
    ];

    match params.kernels {
        KernelEntries::Symlink(version) => {
            lines.push(format!("label {label}\n"));
            lines.push(format!("\tmenu label {distro} ({version})\n"));
            lines.push(String::from("\tlinux ../vmlinuz\n"));
            lines.push(format!("\tappend ro root={root} {}\n", params.append));
            lines.push(String::from("\tmenu default\n"));
        }
        KernelEntries::Versions(versions) => {
            for (idx, version) in versions.iter().enumerate() {
                lines.push(format!("label {label}{idx}\n"));
                lines.push(format!("\tmenu label {distro} ({version})\n"));
                lines.push(format!("\tlinux ../vmlinuz-{version}\n"));
                lines.push(format!("\tappend ro root={root} {}\n", params.append));

                if idx == 0 {
                    lines.push(String::from("\tmenu default\n"));
                }
            }
        }
    }

    Ok(lines.concat())
}

pub(crate) fn has_splash(instroot: &Path) -> bool {
    instroot.join("boot/extlinux/splash.jpg").exists()
}

pub(crate) fn write_boot_menu(instroot: &Path, menu: &str) -> Result<(), io::Error> {
    let path = instroot.join("boot/extlinux/extlinux.conf");

    debug!("Writing syslinux config {}", path.display());
    fs::write(path, menu)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs, os};

    use layout::PartitionTableKind;
    use test_log::test;
    use types::ImagerError;

    use crate::{
        bootconfig::{
            discover_kernels, has_splash, render_boot_menu, resolve_root_device, BootMenuParams,
            KernelEntries, RootDevice,
        },
        planner::ResolvedPartition,
    };

    fn root_partition(partuuid: Option<&str>) -> ResolvedPartition {
        ResolvedPartition {
            disk_name: String::from("sda"),
            num: 2,
            mountpoint: Some(String::from("/")),
            fstype: Some(String::from("ext4")),
            fsopts: None,
            uuid: Some(String::from("1234")),
            partuuid: partuuid.map(str::to_owned),
            subvolumes: Vec::new(),
        }
    }

    fn params<'a>(
        ptable: PartitionTableKind,
        root: &'a RootDevice,
        kernels: &'a KernelEntries,
    ) -> BootMenuParams<'a> {
        BootMenuParams {
            distro_name: "Tizen",
            append: "quiet",
            ptable,
            root,
            kernels,
            splash: false,
        }
    }

    #[test]
    fn test_resolve_root_msdos() {
        let root = resolve_root_device(
            &[root_partition(Some("abcd"))],
            PartitionTableKind::Msdos,
        );

        assert_eq!(root.device.as_deref(), Some("/dev/sda2"));
        assert_eq!(root.partuuid, None);
    }

    #[test]
    fn test_resolve_root_gpt() {
        let root = resolve_root_device(&[root_partition(Some("abcd"))], PartitionTableKind::Gpt);

        assert_eq!(root.partuuid.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_resolve_no_root() {
        let root = resolve_root_device(&[], PartitionTableKind::Gpt);

        assert_eq!(root, RootDevice::default());
    }

    #[test]
    fn test_menu_msdos_versions() {
        let root = resolve_root_device(&[root_partition(None)], PartitionTableKind::Msdos);
        let kernels = KernelEntries::Versions(vec![
            String::from("6.1.0"),
            String::from("6.6.0"),
        ]);

        let menu = render_boot_menu(&params(PartitionTableKind::Msdos, &root, &kernels)).unwrap();
        assert_eq!(
            menu,
            "prompt 0\n\
             timeout 1\n\
             \n\
             default vesamenu.c32\n\
             menu autoboot Starting Tizen...\n\
             menu hidden\n\
             \n\
             \n\
             menu title Welcome to Tizen!\n\
             menu color border 0 #ffffffff #00000000\n\
             menu color sel 7 #ffffffff #ff000000\n\
             menu color title 0 #ffffffff #00000000\n\
             menu color tabmsg 0 #ffffffff #00000000\n\
             menu color unsel 0 #ffffffff #00000000\n\
             menu color hotsel 0 #ff000000 #ffffffff\n\
             menu color hotkey 7 #ffffffff #ff000000\n\
             menu color timeout_msg 0 #ffffffff #00000000\n\
             menu color timeout 0 #ffffffff #00000000\n\
             menu color cmdline 0 #ffffffff #00000000\n\
             label tizen0\n\
             \tmenu label Tizen (6.1.0)\n\
             \tlinux ../vmlinuz-6.1.0\n\
             \tappend ro root=/dev/sda2 quiet\n\
             \tmenu default\n\
             label tizen1\n\
             \tmenu label Tizen (6.6.0)\n\
             \tlinux ../vmlinuz-6.6.0\n\
             \tappend ro root=/dev/sda2 quiet\n"
        );
    }

    #[test]
    fn test_menu_gpt_partuuid() {
        let root = resolve_root_device(
            &[root_partition(Some("5f0c9e1a-1a2b-4c3d-9e8f-00112233aabb"))],
            PartitionTableKind::Gpt,
        );
        let kernels = KernelEntries::Symlink(String::from("6.6.0"));

        let menu = render_boot_menu(&params(PartitionTableKind::Gpt, &root, &kernels)).unwrap();
        assert!(menu.ends_with(
            "label tizen\n\
             \tmenu label Tizen (6.6.0)\n\
             \tlinux ../vmlinuz\n\
             \tappend ro root=PARTUUID=5f0c9e1a-1a2b-4c3d-9e8f-00112233aabb quiet\n\
             \tmenu default\n"
        ));
    }

    #[test]
    fn test_menu_gpt_versions_partuuid() {
        let root = resolve_root_device(&[root_partition(Some("abcd"))], PartitionTableKind::Gpt);
        let kernels = KernelEntries::Versions(vec![String::from("6.6.0")]);

        let menu = render_boot_menu(&params(PartitionTableKind::Gpt, &root, &kernels)).unwrap();
        assert!(menu.contains("\tappend ro root=PARTUUID=abcd quiet\n"));
    }

    #[test]
    fn test_menu_gpt_missing_partuuid() {
        let root = resolve_root_device(&[root_partition(None)], PartitionTableKind::Gpt);
        let kernels = KernelEntries::Symlink(String::from("6.6.0"));

        let err = render_boot_menu(&params(PartitionTableKind::Gpt, &root, &kernels)).unwrap_err();
        assert!(matches!(err, ImagerError::Mount(_)));
    }

    #[test]
    fn test_menu_splash() {
        let root = resolve_root_device(&[root_partition(None)], PartitionTableKind::Msdos);
        let kernels = KernelEntries::Versions(Vec::new());
        let mut params = params(PartitionTableKind::Msdos, &root, &kernels);
        params.splash = true;

        let menu = render_boot_menu(&params).unwrap();
        assert!(menu.contains("menu hidden\n\nmenu background splash.jpg\nmenu title"));
    }

    #[test]
    fn test_discover_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz-6.6.0"), b"kernel").unwrap();
        os::unix::fs::symlink("vmlinuz-6.6.0", boot.join("vmlinuz")).unwrap();

        let kernels = discover_kernels(dir.path(), &BTreeMap::new()).unwrap();
        assert_eq!(kernels, KernelEntries::Symlink(String::from("6.6.0")));
    }

    #[test]
    fn test_discover_versions() {
        let dir = tempfile::tempdir().unwrap();
        let installed = BTreeMap::from([(
            String::from("kernel"),
            vec![String::from("6.1.0"), String::from("6.6.0")],
        )]);

        let kernels = discover_kernels(dir.path(), &installed).unwrap();
        assert_eq!(
            kernels,
            KernelEntries::Versions(vec![String::from("6.1.0"), String::from("6.6.0")])
        );
    }

    #[test]
    fn test_splash_detection() {
        let dir = tempfile::tempdir().unwrap();
        let extlinux = dir.path().join("boot/extlinux");
        fs::create_dir_all(&extlinux).unwrap();

        assert!(!has_splash(dir.path()));

        fs::write(extlinux.join("splash.jpg"), b"jpeg").unwrap();
        assert!(has_splash(dir.path()));
    }
}
