use core::fmt;
use std::{
    fs::{self, DirBuilder},
    os::unix::fs::DirBuilderExt as _,
    path::PathBuf,
};

use layout::Partition;
use log::{debug, error, info, warn};
use types::ImagerError;

use crate::{
    blockmap::generate_bmaps,
    bootconfig::{
        discover_kernels, has_splash, render_boot_menu, resolve_root_device, write_boot_menu,
        BootMenuParams,
    },
    bootloader::{bootloader_available, install_on_disks},
    context::BuildContext,
    disks::DiskLayout,
    finalize::{check_pack_target, finalize, FinalOutput},
    installer::Installer,
    metadata::write_metadata,
    mounts::MountManager,
    planner::{PartitionPlanner, ResolvedPartition},
    privilege::setuid_xorg,
    runner::CommandRunner,
};

/// The steps of an image build, in the order they run
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Stage {
    Layout,
    Mount,
    Populate,
    Configure,
    BootConfigure,
    BootloaderInstall,
    Unmount,
    Finalize,
    Metadata,
    BlockMap,
}

impl Stage {
    fn first() -> Self {
        Self::Layout
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Layout => Some(Self::Mount),
            Self::Mount => Some(Self::Populate),
            Self::Populate => Some(Self::Configure),
            Self::Configure => Some(Self::BootConfigure),
            Self::BootConfigure => Some(Self::BootloaderInstall),
            Self::BootloaderInstall => Some(Self::Unmount),
            Self::Unmount => Some(Self::Finalize),
            Self::Finalize => Some(Self::Metadata),
            Self::Metadata => Some(Self::BlockMap),
            Self::BlockMap => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Mount => "mount",
            Self::Populate => "populate",
            Self::Configure => "configure",
            Self::BootConfigure => "boot configuration",
            Self::BootloaderInstall => "bootloader installation",
            Self::Unmount => "unmount",
            Self::Finalize => "finalize",
            Self::Metadata => "metadata",
            Self::BlockMap => "block map",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful build left in the output directory
#[derive(Debug)]
pub(crate) struct BuildReport {
    pub(crate) output: FinalOutput,
    pub(crate) descriptor: PathBuf,
    pub(crate) bmaps: Vec<PathBuf>,
}

/// Drives a single image build through its stages
#[derive(Debug)]
pub(crate) struct Pipeline<P: PartitionPlanner, I: Installer, R: CommandRunner> {
    ctx: BuildContext,
    layout: DiskLayout,
    manager: MountManager<P>,
    installer: I,
    runner: R,
    completed: Option<Stage>,
    partitions: Vec<ResolvedPartition>,
    bootable: bool,
    output: Option<FinalOutput>,
    descriptor: Option<PathBuf>,
    bmaps: Vec<PathBuf>,
}

impl<P: PartitionPlanner, I: Installer, R: CommandRunner> Pipeline<P, I, R> {
    pub(crate) fn new(
        ctx: BuildContext,
        partitions: &[Partition],
        planner: P,
        installer: I,
        runner: R,
    ) -> Self {
        let manager = MountManager::new(planner, &ctx);

        Self {
            layout: DiskLayout::new(partitions),
            manager,
            installer,
            runner,
            completed: None,
            partitions: Vec::new(),
            bootable: false,
            output: None,
            descriptor: None,
            bmaps: Vec::new(),
            ctx,
        }
    }

    fn enter(&self, stage: Stage) -> Result<(), ImagerError> {
        let expected = match self.completed {
            None => Some(Stage::first()),
            Some(done) => done.next(),
        };

        if expected != Some(stage) {
            return Err(ImagerError::Build(match expected {
                Some(expected) => format!(
                    "Can't run the {stage} stage, the {expected} stage comes first"
                ),
                None => format!("Can't run the {stage} stage, the build is over"),
            }));
        }

        debug!("Entering the {stage} stage");
        Ok(())
    }

    fn complete(&mut self, stage: Stage) {
        debug!("Stage {stage} done");
        self.completed = Some(stage);
    }

    fn layout(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Layout)?;

        let disks = self.layout.resolve_disks()?;
        info!("Image uses disks {}", disks.join(", "));

        check_pack_target(&self.ctx)?;
        self.installer.check_source()?;

        self.complete(Stage::Layout);
        Ok(())
    }

    fn mount(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Mount)?;

        self.partitions = self
            .manager
            .mount_all(self.layout.partitions(), self.ctx.ptable)?;

        self.complete(Stage::Mount);
        Ok(())
    }

    fn populate(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Populate)?;

        debug!(
            "Required packages: {}",
            self.installer.required_packages().join(", ")
        );
        debug!(
            "Excluded packages: {}",
            self.installer.excluded_packages().join(", ")
        );

        self.installer.populate(&self.ctx.instroot)?;

        self.complete(Stage::Populate);
        Ok(())
    }

    fn configure(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Configure)?;

        let etc = self.ctx.instroot.join("etc");
        DirBuilder::new().recursive(true).mode(0o755).create(&etc)?;

        let fstab = etc.join("fstab");
        debug!("Writing {}", fstab.display());
        fs::write(&fstab, self.manager.render_fstab(self.ctx.fstab_entry))?;

        if let Err(e) = setuid_xorg(&self.ctx.instroot) {
            warn!("Couldn't make the X server setuid: {e}");
        }

        self.complete(Stage::Configure);
        Ok(())
    }

    fn boot_configure(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::BootConfigure)?;

        self.bootable = bootloader_available(&self.ctx.instroot);
        if self.bootable {
            let root = resolve_root_device(&self.partitions, self.ctx.ptable);
            let installed = self.installer.kernel_versions(&self.ctx.instroot)?;
            let kernels = discover_kernels(&self.ctx.instroot, &installed)?;

            let menu = render_boot_menu(&BootMenuParams {
                distro_name: &self.ctx.distro_name,
                append: &self.ctx.bootloader_append,
                ptable: self.ctx.ptable,
                root: &root,
                kernels: &kernels,
                splash: has_splash(&self.ctx.instroot),
            })?;

            write_boot_menu(&self.ctx.instroot, &menu)?;
        } else {
            info!("No syslinux in the image, skipping the bootloader");
        }

        self.complete(Stage::BootConfigure);
        Ok(())
    }

    fn install_bootloader(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::BootloaderInstall)?;

        if self.bootable {
            install_on_disks(
                &mut self.runner,
                &self.ctx.instroot,
                self.ctx.ptable,
                self.manager.disks(),
            )?;
        }

        self.complete(Stage::BootloaderInstall);
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Unmount)?;

        self.manager.unmount_all();

        self.complete(Stage::Unmount);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Finalize)?;

        self.output = Some(finalize(&mut self.manager, &self.ctx)?);
        self.manager.remove_image_dir()?;

        self.complete(Stage::Finalize);
        Ok(())
    }

    fn final_output(&self) -> Result<&FinalOutput, ImagerError> {
        self.output
            .as_ref()
            .ok_or(ImagerError::Build(String::from("The image isn't finalized")))
    }

    fn metadata(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::Metadata)?;

        self.descriptor = Some(write_metadata(&self.ctx, self.final_output()?)?);

        self.complete(Stage::Metadata);
        Ok(())
    }

    fn block_map(&mut self) -> Result<(), ImagerError> {
        self.enter(Stage::BlockMap)?;

        self.bmaps = generate_bmaps(&self.ctx, self.final_output()?)?;

        self.complete(Stage::BlockMap);
        Ok(())
    }

    fn run_stages(&mut self) -> Result<(), ImagerError> {
        self.layout()?;
        self.mount()?;
        self.populate()?;
        self.configure()?;
        self.boot_configure()?;
        self.install_bootloader()?;
        self.unmount()?;
        self.finalize()?;
        self.metadata()?;
        self.block_map()
    }

    /// Unmounts everything and drops the image directory. Never fails.
    fn cleanup(&mut self) {
        self.manager.unmount_all();

        if let Err(e) = self.manager.remove_image_dir() {
            warn!("Couldn't remove the image directory: {e}");
        }
    }

    /// Runs every stage, cleaning up if any of them fails
    pub(crate) fn run(mut self) -> Result<BuildReport, ImagerError> {
        if let Err(e) = self.run_stages() {
            error!("Image build failed: {e}");
            self.cleanup();
            return Err(e);
        }

        let output = self.output.take().ok_or(ImagerError::Build(String::from(
            "The image isn't finalized",
        )))?;
        let descriptor = self.descriptor.take().ok_or(ImagerError::Build(String::from(
            "No image descriptor was written",
        )))?;

        Ok(BuildReport {
            output,
            descriptor,
            bmaps: self.bmaps,
        })
    }
}
