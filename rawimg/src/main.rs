#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::{
    fs::{self, File},
    io::{self, BufReader, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use layout::{ImageDescription, Packages};
use log::{debug, info};
use types::{Architecture, CompressionAlgorithm, ImagerError};

mod blockmap;
mod bootconfig;
mod bootloader;
mod config;
mod context;
mod disks;
mod finalize;
mod installer;
mod loopback;
mod metadata;
mod mounts;
mod pipeline;
mod planner;
mod preflight;
mod privilege;
mod runner;
mod sparse;

use crate::{
    config::{SiteConfig, DEFAULT_CONFIG_PATH},
    context::{image_name, BuildContext, FstabEntry},
    disks::DiskLayout,
    installer::{required_packages, RootTreeInstaller},
    loopback::LoopbackPlanner,
    pipeline::Pipeline,
    preflight::{check_host_tools, check_root},
    runner::HostRunner,
};

#[derive(Debug, Args)]
struct BuildArgs {
    #[arg(help = "Image Description (JSON)")]
    description: PathBuf,

    #[arg(short, long, help = "Installed Root Tree, as a directory or a tarball")]
    source: PathBuf,

    #[arg(short, long, help = "Output Directory")]
    outdir: Option<PathBuf>,

    #[arg(long, help = "Temporary Directory")]
    tmpdir: Option<PathBuf>,

    #[arg(short, long, help = "Image Name")]
    name: Option<String>,

    #[arg(long, help = "Appliance Release")]
    release: Option<String>,

    #[arg(long, help = "Appliance Version")]
    image_version: Option<String>,

    #[arg(long, value_enum, help = "Compress every disk file")]
    compress_image: Option<CompressionAlgorithm>,

    #[arg(long, help = "Pack every disk file into this archive")]
    pack_to: Option<String>,

    #[arg(long, help = "Generate a block map for every disk")]
    generate_bmap: bool,

    #[arg(long, help = "Add the disks checksums to the image descriptor")]
    checksum: bool,

    #[arg(long, value_enum, help = "How the fstab refers to the partitions")]
    fstab_entry: Option<FstabEntry>,

    #[arg(long, help = "Number of virtual CPUs")]
    vcpu: Option<u32>,

    #[arg(long, help = "Virtual Memory Size, in MiB")]
    vmem: Option<u64>,

    #[arg(long, help = "Distribution Name, as displayed in the boot menu")]
    distro_name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CliSubcommand {
    Build(BuildArgs),
    Packages {
        #[arg(help = "Image Description (JSON)")]
        description: PathBuf,
    },
    Bmap {
        #[arg(help = "Raw Image")]
        image: PathBuf,

        #[arg(help = "Output Block Map File")]
        output: PathBuf,

        #[arg(long, default_value_t = bmap::DEFAULT_BLOCK_SIZE, help = "Block Size, in bytes")]
        block_size: u64,
    },
}

#[derive(Parser)]
#[command(version, about = "Partitioned Raw Disk Image Creator")]
struct Cli {
    #[arg(short, long, help = "Site Configuration File")]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, help = "Architecture")]
    arch: Option<Architecture>,

    #[clap(subcommand)]
    command: CliSubcommand,
}

fn load_description(path: &Path) -> Result<ImageDescription, ImagerError> {
    debug!("Loading image description {}", path.display());

    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Merges the site configuration, the image description and the command
/// line into the context of a build. The command line wins.
fn build_context(
    site: &SiteConfig,
    desc: &ImageDescription,
    args: &BuildArgs,
    arch: Architecture,
    instroot: &Path,
) -> BuildContext {
    let stem = desc
        .name
        .clone()
        .or_else(|| {
            args.description
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| String::from("image"));

    let name = args.name.clone().unwrap_or_else(|| {
        image_name(
            &stem,
            site.create.name_prefix.as_deref(),
            site.create.name_suffix.as_deref(),
        )
    });

    BuildContext {
        name,
        instroot: instroot.to_path_buf(),
        outdir: args
            .outdir
            .clone()
            .unwrap_or_else(|| site.create.outdir.clone()),
        tmpdir: args
            .tmpdir
            .clone()
            .unwrap_or_else(|| site.create.tmpdir.clone()),
        ptable: desc.bootloader.ptable,
        arch,
        distro_name: args
            .distro_name
            .clone()
            .unwrap_or_else(|| site.common.distro_name.clone()),
        bootloader_append: desc.bootloader.append.clone(),
        vcpu: args.vcpu.unwrap_or(site.create.vcpu),
        vmem_mib: args.vmem.unwrap_or(site.create.vmem),
        checksum: args.checksum || site.create.checksum,
        compression: args.compress_image.or(site.create.compress_image),
        pack_to: args
            .pack_to
            .clone()
            .or_else(|| site.create.pack_to.clone()),
        generate_bmap: args.generate_bmap || site.create.generate_bmap,
        fstab_entry: args.fstab_entry.unwrap_or(site.create.fstab_entry),
        appliance_version: args.image_version.clone(),
        appliance_release: args
            .release
            .clone()
            .or_else(|| site.create.release.clone()),
        networks: desc.networks.len(),
    }
}

fn build(site: &SiteConfig, arch: Architecture, args: &BuildArgs) -> Result<(), anyhow::Error> {
    let desc = load_description(&args.description)
        .with_context(|| format!("Invalid image description {}", args.description.display()))?;

    let layout = DiskLayout::new(&desc.partitions);
    check_host_tools(&HostRunner, layout.partitions(), arch)?;
    check_root()?;

    if !args.source.exists() {
        bail!("Root tree {} doesn't exist", args.source.display());
    }

    let tmpdir = args
        .tmpdir
        .clone()
        .unwrap_or_else(|| site.create.tmpdir.clone());
    fs::create_dir_all(&tmpdir)
        .with_context(|| format!("Couldn't create {}", tmpdir.display()))?;

    let instroot = tempfile::Builder::new()
        .prefix("install_root-")
        .tempdir_in(&tmpdir)?;

    let ctx = build_context(site, &desc, args, arch, instroot.path());

    info!(
        "Building {} for {arch} with a {} partition table",
        ctx.name, ctx.ptable
    );

    let outdir = ctx.outdir.clone();
    let planner = LoopbackPlanner::new(HostRunner, instroot.path());
    let installer = RootTreeInstaller::new(&args.source, desc.packages.clone(), arch);

    let report = Pipeline::new(ctx, &desc.partitions, planner, installer, HostRunner)
        .run()
        .context("Image build failed")?;

    if let Some(archive) = &report.output.archive {
        info!("Disks packed into {}", archive.display());
    } else {
        for file in &report.output.files {
            info!("Disk {} written to {}", file.disk, outdir.join(&file.file_name).display());
        }
    }

    info!("Image descriptor written to {}", report.descriptor.display());
    for map_file in &report.bmaps {
        info!("Block map written to {}", map_file.display());
    }

    instroot.close()?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config_path = cli.config.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.clone());
    let site = SiteConfig::load(&config_path)
        .with_context(|| format!("Couldn't load {}", config_path.display()))?;

    let arch = match cli.arch.or(site.create.arch) {
        Some(arch) => arch,
        None => Architecture::host()?,
    };

    match &cli.command {
        CliSubcommand::Build(args) => build(&site, arch, args),
        CliSubcommand::Packages { description } => {
            let desc = load_description(description)
                .with_context(|| format!("Invalid image description {}", description.display()))?;

            let packages = Packages {
                required: required_packages(&desc.packages, arch),
                excluded: desc.packages.excluded,
            };

            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", serde_json::to_string_pretty(&packages)?)?;
            Ok(())
        }
        CliSubcommand::Bmap {
            image,
            output,
            block_size,
        } => {
            let map = bmap::BmapCreate::new(image, output)
                .block_size(*block_size)
                .generate()
                .with_context(|| format!("Failed to create bmap file for {}", image.display()))?;

            info!(
                "{} of {} blocks mapped, written to {}",
                map.mapped_blocks_count(),
                map.blocks_count,
                output.display()
            );

            Ok(())
        }
    }
}
