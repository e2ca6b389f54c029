use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File},
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use flate2::bufread::GzDecoder;
use layout::Packages;
use log::{debug, info};
use tar::Archive;
use types::{Architecture, ImagerError};

use crate::runner::{CommandRunner, HostRunner};

const KERNEL_PREFIX: &str = "vmlinuz-";

/// Fills the instroot and reports what it installed
pub(crate) trait Installer {
    fn required_packages(&self) -> Vec<String>;

    fn excluded_packages(&self) -> Vec<String>;

    /// Installed kernel versions, by kernel package
    fn kernel_versions(&self, instroot: &Path)
        -> Result<BTreeMap<String, Vec<String>>, ImagerError>;

    /// Checks the installer can use its source, before anything gets written
    fn check_source(&self) -> Result<(), ImagerError>;

    fn populate(&mut self, instroot: &Path) -> Result<(), ImagerError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SourceKind {
    Directory,
    Tar,
    TarGz,
    TarZstd,
}

impl SourceKind {
    fn detect(source: &Path) -> Result<Self, ImagerError> {
        if source.is_dir() {
            return Ok(Self::Directory);
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.zst") {
            Ok(Self::TarZstd)
        } else {
            Err(ImagerError::Config(format!(
                "Unsupported root tree source {}",
                source.display()
            )))
        }
    }
}

/// Required packages for a raw image, as derived from the description
pub(crate) fn required_packages(packages: &Packages, arch: Architecture) -> Vec<String> {
    let mut required = packages.required.clone();

    if !arch.is_arm() {
        for pkg in ["syslinux", "syslinux-extlinux"] {
            if !required.iter().any(|p| p == pkg) {
                required.push(pkg.to_owned());
            }
        }
    }

    required
}

/// Populates the instroot from an already installed root tree, either a
/// directory or a tarball.
#[derive(Debug)]
pub(crate) struct RootTreeInstaller {
    source: PathBuf,
    packages: Packages,
    arch: Architecture,
    runner: HostRunner,
}

impl RootTreeInstaller {
    pub(crate) fn new(source: &Path, packages: Packages, arch: Architecture) -> Self {
        Self {
            source: source.to_path_buf(),
            packages,
            arch,
            runner: HostRunner,
        }
    }

    fn copy_tree(&mut self, instroot: &Path) -> Result<(), ImagerError> {
        let cp = self
            .runner
            .find_binary("cp")
            .ok_or(ImagerError::Config(String::from("Couldn't find cp")))?;

        let mut source = self.source.clone().into_os_string();
        source.push("/.");

        let mut dest = instroot.to_path_buf().into_os_string();
        dest.push("/");

        if !self
            .runner
            .run(&cp, &[OsString::from("-a"), source, dest])?
        {
            return Err(ImagerError::Build(format!(
                "Couldn't copy {} into {}",
                self.source.display(),
                instroot.display()
            )));
        }

        Ok(())
    }

    fn unpack(&self, kind: SourceKind, instroot: &Path) -> Result<(), ImagerError> {
        let file = BufReader::new(File::open(&self.source)?);

        let reader: Box<dyn Read> = match kind {
            SourceKind::Tar => Box::new(file),
            SourceKind::TarGz => Box::new(GzDecoder::new(file)),
            SourceKind::TarZstd => Box::new(zstd::Decoder::with_buffer(file)?),
            SourceKind::Directory => {
                return Err(ImagerError::Build(String::from(
                    "A directory can't be unpacked",
                )))
            }
        };

        let mut archive = Archive::new(reader);

        for entry in archive.entries()? {
            let mut entry = entry?;

            debug!("Extracting File {}", entry.path()?.display());

            entry.set_preserve_mtime(true);
            entry.set_preserve_permissions(true);
            entry.set_unpack_xattrs(true);

            entry.unpack_in(instroot)?;
        }

        Ok(())
    }
}

impl Installer for RootTreeInstaller {
    fn required_packages(&self) -> Vec<String> {
        required_packages(&self.packages, self.arch)
    }

    fn excluded_packages(&self) -> Vec<String> {
        self.packages.excluded.clone()
    }

    fn kernel_versions(
        &self,
        instroot: &Path,
    ) -> Result<BTreeMap<String, Vec<String>>, ImagerError> {
        let boot = instroot.join("boot");
        let mut versions = Vec::new();

        if boot.is_dir() {
            for entry in fs::read_dir(&boot)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();

                if let Some(version) = name.strip_prefix(KERNEL_PREFIX) {
                    if !version.is_empty() && !entry.path().is_symlink() {
                        versions.push(version.to_owned());
                    }
                }
            }
        }

        versions.sort();
        debug!("Found kernel versions {}", versions.join(", "));

        Ok(BTreeMap::from([(String::from("kernel"), versions)]))
    }

    fn check_source(&self) -> Result<(), ImagerError> {
        if !self.source.exists() {
            return Err(ImagerError::Config(format!(
                "Root tree {} doesn't exist",
                self.source.display()
            )));
        }

        SourceKind::detect(&self.source).map(|_| ())
    }

    fn populate(&mut self, instroot: &Path) -> Result<(), ImagerError> {
        let kind = SourceKind::detect(&self.source)?;

        info!(
            "Populating {} from {}",
            instroot.display(),
            self.source.display()
        );

        match kind {
            SourceKind::Directory => self.copy_tree(instroot),
            SourceKind::Tar | SourceKind::TarGz | SourceKind::TarZstd => {
                self.unpack(kind, instroot)
            }
        }
    }
}
