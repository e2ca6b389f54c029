use std::{
    fs::File,
    io::{self, BufReader, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
};

use log::{debug, trace};
use tempfile::NamedTempFile;

const CHUNK_SIZE: usize = 1 << 20;

/// Creates a sparse file of `size` bytes
pub(crate) fn create_sparse_file(path: &Path, size: u64) -> Result<(), io::Error> {
    debug!(
        "Creating sparse file {} of {size} bytes",
        path.display()
    );

    let file = File::create_new(path)?;
    file.set_len(size)?;
    file.sync_all()
}

/// Rewrites a file so that every all-zero chunk becomes a hole
///
/// The file is truncated or extended to `size` first if given. Returns the
/// resulting file size. Running it on an already sparse file leaves it as is.
pub(crate) fn resparse_file(path: &Path, size: Option<u64>) -> Result<u64, io::Error> {
    if let Some(size) = size {
        debug!("Resizing {} to {size} bytes", path.display());
        File::options().write(true).open(path)?.set_len(size)?;
    }

    let source = File::open(path)?;
    let meta = source.metadata()?;
    let len = meta.len();
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, source);

    let dir = path.parent().unwrap_or(Path::new("."));
    let mut dest = NamedTempFile::new_in(dir)?;
    dest.as_file().set_permissions(meta.permissions())?;

    debug!("Resparsing {} ({len} bytes)", path.display());

    let mut buffer = vec![0_u8; CHUNK_SIZE];
    let mut offset = 0_u64;
    let mut holes = 0_u64;
    while offset < len {
        let chunk_len = usize::try_from(len - offset)
            .unwrap_or(CHUNK_SIZE)
            .min(CHUNK_SIZE);

        let chunk = &mut buffer[..chunk_len];
        reader.read_exact(chunk)?;

        if chunk.iter().all(|b| *b == 0) {
            dest.as_file_mut()
                .seek(SeekFrom::Current(i64::try_from(chunk_len).map_err(|_err| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Chunk too large")
                })?))?;
            holes += 1;
        } else {
            dest.as_file_mut().write_all(chunk)?;
        }

        offset += chunk_len as u64;
    }

    trace!("Left {holes} holes in {}", path.display());

    let dest_file = dest.as_file_mut();
    dest_file.set_len(len)?;
    dest_file.sync_all()?;

    dest.persist(path).map_err(|e| e.error)?;

    Ok(len)
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File},
        io::{Seek as _, SeekFrom, Write as _},
        os::unix::fs::{MetadataExt as _, PermissionsExt as _},
    };

    use test_log::test;

    use crate::sparse::{create_sparse_file, resparse_file};

    #[test]
    fn test_create_sparse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");

        create_sparse_file(&path, 64 << 20).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 64 << 20);
        assert!(meta.blocks() * 512 < meta.len());
    }

    #[test]
    fn test_create_sparse_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        File::create(&path).unwrap();

        create_sparse_file(&path, 1 << 20).unwrap_err();
    }

    #[test]
    fn test_resparse_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");

        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0_u8; 4 << 20]).unwrap();
        file.seek(SeekFrom::Start(3 << 20)).unwrap();
        file.write_all(b"rootfs").unwrap();
        drop(file);

        let before = fs::read(&path).unwrap();

        assert_eq!(resparse_file(&path, None).unwrap(), 4 << 20);

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4 << 20);
        assert!(meta.blocks() * 512 < meta.len());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_resparse_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");

        create_sparse_file(&path, 8 << 20).unwrap();
        let mut file = File::options().write(true).open(&path).unwrap();
        file.write_all(b"MBR").unwrap();
        drop(file);

        let first = resparse_file(&path, None).unwrap();
        let content = fs::read(&path).unwrap();
        let second = resparse_file(&path, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&path).unwrap(), content);
    }

    #[test]
    fn test_resparse_keeps_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");

        create_sparse_file(&path, 1 << 20).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        resparse_file(&path, None).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o644);
    }

    #[test]
    fn test_resparse_resize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");

        create_sparse_file(&path, 8 << 20).unwrap();

        assert_eq!(resparse_file(&path, Some(2 << 20)).unwrap(), 2 << 20);
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 << 20);
    }
}
