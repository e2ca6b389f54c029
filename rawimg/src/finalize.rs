use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use log::{debug, info};
use nix::errno::Errno;
use tar::Builder;
use types::{CompressionAlgorithm, ImagerError};

use crate::{
    context::BuildContext, mounts::MountManager, planner::PartitionPlanner,
    sparse::resparse_file,
};

/// A disk file as it ends up in the output directory
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DiskFile {
    pub(crate) disk: String,
    pub(crate) file_name: String,
}

/// What finalizing the image produced
#[derive(Debug)]
pub(crate) struct FinalOutput {
    pub(crate) files: Vec<DiskFile>,
    pub(crate) compressed: bool,
    pub(crate) archive: Option<PathBuf>,
}

impl FinalOutput {
    pub(crate) fn is_packed(&self) -> bool {
        self.archive.is_some()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ArchiveKind {
    Tar,
    TarGz,
    TarZstd,
}

impl ArchiveKind {
    fn detect(name: &str) -> Result<Self, ImagerError> {
        if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.zst") {
            Ok(Self::TarZstd)
        } else {
            Err(ImagerError::Config(format!(
                "Unsupported archive format for {name}"
            )))
        }
    }
}

/// Fails if the disks are to be packed into an archive format we can't write
pub(crate) fn check_pack_target(ctx: &BuildContext) -> Result<(), ImagerError> {
    if let Some(pack_to) = &ctx.pack_to {
        ArchiveKind::detect(pack_to)?;
    }

    Ok(())
}

fn file_name(path: &Path) -> Result<String, io::Error> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Path has no file name",
        ))
}

/// Compresses a file next to itself and removes the original
fn compress_file(path: &Path, algo: CompressionAlgorithm) -> Result<PathBuf, io::Error> {
    let mut dest = path.as_os_str().to_owned();
    dest.push(".");
    dest.push(algo.extension());
    let dest = PathBuf::from(dest);

    info!("Compressing {} to {}", path.display(), dest.display());

    let mut input = BufReader::new(File::open(path)?);
    let output = BufWriter::new(File::create(&dest)?);

    match algo {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(output, Compression::default());
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(output, 0)?;
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
    }

    fs::remove_file(path)?;
    Ok(dest)
}

fn write_archive<W: Write>(writer: W, files: &[PathBuf]) -> Result<W, io::Error> {
    let mut builder = Builder::new(writer);
    builder.sparse(true);

    for file in files {
        let name = file_name(file)?;

        debug!("Adding {} to the archive as {name}", file.display());
        builder.append_path_with_name(file, name)?;
    }

    builder.into_inner()
}

/// Packs every file into a single archive, whose compression follows its
/// extension, and removes them.
fn pack_files(dest: &Path, files: &[PathBuf]) -> Result<(), ImagerError> {
    let kind = ArchiveKind::detect(&file_name(dest)?)?;

    info!("Packing all raw images to {}", dest.display());

    let output = BufWriter::new(File::create(dest)?);
    match kind {
        ArchiveKind::Tar => write_archive(output, files)?.flush()?,
        ArchiveKind::TarGz => write_archive(GzEncoder::new(output, Compression::default()), files)?
            .finish()?
            .flush()?,
        ArchiveKind::TarZstd => write_archive(zstd::Encoder::new(output, 0)?, files)?
            .finish()?
            .flush()?,
    }

    for file in files {
        fs::remove_file(file)?;
    }

    Ok(())
}

/// Moves a file, copying it over when the destination is on another
/// filesystem.
fn move_file(src: &Path, dst: &Path) -> Result<(), io::Error> {
    debug!("Moving {} to {}", src.display(), dst.display());

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            fs::copy(src, dst)?;
            resparse_file(dst, None)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

/// Stages the disk files into the output directory, compressing them or
/// packing them all into a single archive first if asked to.
pub(crate) fn stage_files(
    ctx: &BuildContext,
    disks: &[(String, PathBuf)],
) -> Result<FinalOutput, ImagerError> {
    fs::create_dir_all(&ctx.outdir)?;

    if let Some(pack_to) = &ctx.pack_to {
        let dest = ctx.outdir.join(pack_to);
        let paths: Vec<PathBuf> = disks.iter().map(|(_, path)| path.clone()).collect();

        pack_files(&dest, &paths)?;

        return Ok(FinalOutput {
            files: disks
                .iter()
                .map(|(disk, _)| DiskFile {
                    disk: disk.clone(),
                    file_name: ctx.disk_file_name(disk),
                })
                .collect(),
            compressed: false,
            archive: Some(dest),
        });
    }

    let mut files = Vec::with_capacity(disks.len());
    for (disk, path) in disks {
        let staged = match ctx.compression {
            Some(algo) => compress_file(path, algo)?,
            None => path.clone(),
        };

        let name = file_name(&staged)?;
        move_file(&staged, &ctx.outdir.join(&name))?;

        files.push(DiskFile {
            disk: disk.clone(),
            file_name: name,
        });
    }

    Ok(FinalOutput {
        files,
        compressed: ctx.compression.is_some(),
        archive: None,
    })
}

/// Resparses the unmounted disks, then stages them into the output directory
pub(crate) fn finalize<P: PartitionPlanner>(
    manager: &mut MountManager<P>,
    ctx: &BuildContext,
) -> Result<FinalOutput, ImagerError> {
    let sizes = manager.resparse(None)?;
    for (disk, size) in &sizes {
        debug!("Disk {disk} is {size} bytes");
    }

    let disks: Vec<(String, PathBuf)> = manager
        .disks()
        .iter()
        .map(|d| (d.name.clone(), d.path.clone()))
        .collect();

    let output = stage_files(ctx, &disks)?;

    if ctx.pack_to.is_some() && ctx.compression.is_some() {
        info!("Disks were packed, per-disk compression was skipped");
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File},
        io::Read as _,
        path::{Path, PathBuf},
    };

    use flate2::read::GzDecoder;
    use layout::{Partition, PartitionTableKind};
    use test_log::test;
    use types::{CompressionAlgorithm, ImagerError};

    use crate::{
        context::tests::test_context,
        finalize::{finalize, stage_files, ArchiveKind, DiskFile},
        mounts::MountManager,
        planner::stub::StubPlanner,
    };

    fn disk_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut content = vec![0_u8; 3 << 20];
        content[..4].copy_from_slice(b"boot");
        fs::write(&path, content).unwrap();
        path
    }

    fn is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_archive_kind() {
        assert_eq!(ArchiveKind::detect("disks.tar").unwrap(), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::detect("disks.tgz").unwrap(), ArchiveKind::TarGz);
        assert_eq!(
            ArchiveKind::detect("disks.tar.zst").unwrap(),
            ArchiveKind::TarZstd
        );
        assert!(matches!(
            ArchiveKind::detect("disks.zip").unwrap_err(),
            ImagerError::Config(_)
        ));
    }

    #[test]
    fn test_move() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let image_dir = tempfile::tempdir().unwrap();
        let sda = disk_file(image_dir.path(), "appliance-sda.raw");
        let sdb = disk_file(image_dir.path(), "appliance-sdb.raw");

        let output = stage_files(
            &ctx,
            &[(String::from("sda"), sda), (String::from("sdb"), sdb)],
        )
        .unwrap();

        assert!(!output.is_packed());
        assert_eq!(
            output.files,
            [
                DiskFile {
                    disk: String::from("sda"),
                    file_name: String::from("appliance-sda.raw")
                },
                DiskFile {
                    disk: String::from("sdb"),
                    file_name: String::from("appliance-sdb.raw")
                },
            ]
        );
        assert_eq!(
            fs::metadata(ctx.outdir.join("appliance-sda.raw")).unwrap().len(),
            3 << 20
        );
        assert!(is_empty(image_dir.path()));
    }

    #[test]
    fn test_compress_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.compression = Some(CompressionAlgorithm::Gzip);

        let image_dir = tempfile::tempdir().unwrap();
        let sda = disk_file(image_dir.path(), "appliance-sda.raw");

        let output = stage_files(&ctx, &[(String::from("sda"), sda)]).unwrap();

        assert!(output.compressed);
        assert_eq!(output.files[0].file_name, "appliance-sda.raw.gz");
        assert!(!ctx.outdir.join("appliance-sda.raw").exists());
        assert!(is_empty(image_dir.path()));

        let mut content = Vec::new();
        GzDecoder::new(File::open(ctx.outdir.join("appliance-sda.raw.gz")).unwrap())
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content.len(), 3 << 20);
        assert_eq!(&content[..4], b"boot");
    }

    #[test]
    fn test_compress_zstd() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.compression = Some(CompressionAlgorithm::Zstd);

        let image_dir = tempfile::tempdir().unwrap();
        let sda = disk_file(image_dir.path(), "appliance-sda.raw");

        let output = stage_files(&ctx, &[(String::from("sda"), sda)]).unwrap();
        assert_eq!(output.files[0].file_name, "appliance-sda.raw.zst");

        let content =
            zstd::decode_all(File::open(ctx.outdir.join("appliance-sda.raw.zst")).unwrap())
                .unwrap();
        assert_eq!(content.len(), 3 << 20);
    }

    #[test]
    fn test_pack_wins_over_compression() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.compression = Some(CompressionAlgorithm::Gzip);
        ctx.pack_to = Some(String::from("appliance.tar.gz"));

        let image_dir = tempfile::tempdir().unwrap();
        let sda = disk_file(image_dir.path(), "appliance-sda.raw");
        let sdb = disk_file(image_dir.path(), "appliance-sdb.raw");

        let output = stage_files(
            &ctx,
            &[(String::from("sda"), sda), (String::from("sdb"), sdb)],
        )
        .unwrap();

        assert!(output.is_packed());
        assert!(!output.compressed);
        assert!(is_empty(image_dir.path()));

        let outdir: Vec<String> = fs::read_dir(&ctx.outdir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(outdir, ["appliance.tar.gz"]);

        let mut archive = tar::Archive::new(GzDecoder::new(
            File::open(ctx.outdir.join("appliance.tar.gz")).unwrap(),
        ));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["appliance-sda.raw", "appliance-sdb.raw"]);
    }

    #[test]
    fn test_finalize_requires_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());

        let mut manager = MountManager::new(StubPlanner::new(), &ctx);
        manager
            .mount_all(&[Partition::default_root()], PartitionTableKind::Msdos)
            .unwrap();

        assert!(matches!(
            finalize(&mut manager, &ctx).unwrap_err(),
            ImagerError::Mount(_)
        ));

        manager.unmount_all();
        let output = finalize(&mut manager, &ctx).unwrap();

        assert_eq!(output.files[0].file_name, "appliance-sda.raw");
        assert!(ctx.outdir.join("appliance-sda.raw").exists());
        assert!(is_empty(manager.image_dir().unwrap()));
    }
}
