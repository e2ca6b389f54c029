use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::Deserialize;
use types::{Architecture, CompressionAlgorithm, ImagerError};

use crate::context::FstabEntry;

const CONFIG_SUBPATH: &str = "etc/rawimg/rawimg.toml";

pub(crate) const DEFAULT_DISTRO_NAME: &str = "Default Distribution";
const DEFAULT_TMPDIR: &str = "/var/tmp/rawimg";
const DEFAULT_OUTDIR: &str = "./rawimg-output";

/// Site configuration file location, relative to the installation prefix
pub(crate) static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let prefix = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent()?.parent().map(Path::to_path_buf));

    match prefix {
        Some(prefix) if prefix != Path::new("/usr") => prefix.join(CONFIG_SUBPATH),
        _ => Path::new("/").join(CONFIG_SUBPATH),
    }
});

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CommonSection {
    pub(crate) distro_name: String,
}

impl Default for CommonSection {
    fn default() -> Self {
        Self {
            distro_name: DEFAULT_DISTRO_NAME.to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CreateSection {
    pub(crate) tmpdir: PathBuf,
    pub(crate) outdir: PathBuf,
    pub(crate) name_prefix: Option<String>,
    pub(crate) name_suffix: Option<String>,
    pub(crate) release: Option<String>,
    pub(crate) arch: Option<Architecture>,
    pub(crate) pack_to: Option<String>,
    pub(crate) compress_image: Option<CompressionAlgorithm>,
    pub(crate) fstab_entry: FstabEntry,
    pub(crate) generate_bmap: bool,
    pub(crate) checksum: bool,
    pub(crate) vcpu: u32,
    pub(crate) vmem: u64,
}

impl Default for CreateSection {
    fn default() -> Self {
        Self {
            tmpdir: PathBuf::from(DEFAULT_TMPDIR),
            outdir: PathBuf::from(DEFAULT_OUTDIR),
            name_prefix: None,
            name_suffix: None,
            release: None,
            arch: None,
            pack_to: None,
            compress_image: None,
            fstab_entry: FstabEntry::Uuid,
            generate_bmap: false,
            checksum: false,
            vcpu: 1,
            vmem: 512,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SiteConfig {
    pub(crate) common: CommonSection,
    pub(crate) create: CreateSection,
}

impl SiteConfig {
    pub(crate) fn parse(content: &str) -> Result<Self, ImagerError> {
        toml::from_str(content)
            .map_err(|e| ImagerError::Config(format!("Invalid site configuration: {e}")))
    }

    pub(crate) fn load(path: &Path) -> Result<Self, ImagerError> {
        debug!("Loading site configuration from {}", path.display());

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Site configuration {} not found, using defaults.",
                    path.display()
                );

                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use test_log::test;
    use types::{Architecture, CompressionAlgorithm, ImagerError};

    use crate::{
        config::{SiteConfig, DEFAULT_DISTRO_NAME},
        context::FstabEntry,
    };

    #[test]
    fn test_defaults() {
        let cfg = SiteConfig::parse("").unwrap();

        assert_eq!(cfg.common.distro_name, DEFAULT_DISTRO_NAME);
        assert_eq!(cfg.create.tmpdir, PathBuf::from("/var/tmp/rawimg"));
        assert_eq!(cfg.create.outdir, PathBuf::from("./rawimg-output"));
        assert_eq!(cfg.create.vcpu, 1);
        assert_eq!(cfg.create.vmem, 512);
        assert_eq!(cfg.create.fstab_entry, FstabEntry::Uuid);
        assert!(!cfg.create.checksum);
        assert!(!cfg.create.generate_bmap);
        assert!(cfg.create.compress_image.is_none());
    }

    #[test]
    fn test_full_config() {
        let cfg = SiteConfig::parse(
            r#"
            [common]
            distro_name = "Tizen"

            [create]
            tmpdir = "/srv/tmp"
            outdir = "/srv/images"
            name_prefix = "tizen"
            arch = "arm64"
            compress_image = "zst"
            fstab_entry = "name"
            generate_bmap = true
            checksum = true
            vcpu = 4
            vmem = 2048
            "#,
        )
        .unwrap();

        assert_eq!(cfg.common.distro_name, "Tizen");
        assert_eq!(cfg.create.tmpdir, PathBuf::from("/srv/tmp"));
        assert_eq!(cfg.create.name_prefix.as_deref(), Some("tizen"));
        assert_eq!(cfg.create.arch, Some(Architecture::Arm64));
        assert_eq!(cfg.create.compress_image, Some(CompressionAlgorithm::Zstd));
        assert_eq!(cfg.create.fstab_entry, FstabEntry::Name);
        assert!(cfg.create.generate_bmap);
        assert!(cfg.create.checksum);
        assert_eq!(cfg.create.vcpu, 4);
        assert_eq!(cfg.create.vmem, 2048);
    }

    #[test]
    fn test_unknown_key() {
        let err = SiteConfig::parse("[create]\nshrink = true\n").unwrap_err();
        assert!(matches!(err, ImagerError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = SiteConfig::load(&dir.path().join("rawimg.toml")).unwrap();
        assert_eq!(cfg.common.distro_name, DEFAULT_DISTRO_NAME);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rawimg.toml");
        fs::write(&path, "[common]\ndistro_name = \"Mer\"\n").unwrap();

        let cfg = SiteConfig::load(&path).unwrap();
        assert_eq!(cfg.common.distro_name, "Mer");
    }
}
