use std::{
    fs::{self, File},
    io::{self, BufReader, Read as _},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use sha2::{Digest as _, Sha256, Sha512};
use types::{DigestAlgorithm, ImagerError};

use crate::{context::BuildContext, finalize::FinalOutput};

const DISK_FORMAT: &str = "raw";
const HASH_BUFFER_SIZE: usize = 1 << 20;

fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }

    escaped
}

/// Hashes a file once, feeding every digest we publish
pub(crate) fn file_checksums(path: &Path) -> Result<Vec<(DigestAlgorithm, String)>, io::Error> {
    debug!("Generating disk signature for {}", path.display());

    let mut reader = BufReader::new(File::open(path)?);
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();

    let mut buffer = vec![0_u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }

        sha256.update(&buffer[..read]);
        sha512.update(&buffer[..read]);
    }

    Ok(vec![
        (DigestAlgorithm::Sha256, hex::encode(sha256.finalize())),
        (DigestAlgorithm::Sha512, hex::encode(sha512.finalize())),
    ])
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct StorageEntry {
    pub(crate) file_name: String,
    pub(crate) checksums: Vec<(DigestAlgorithm, String)>,
}

/// Descriptor of the virtual machine the image is meant for
#[derive(Clone, Debug)]
pub(crate) struct ImageMetadataDoc {
    name: String,
    version: Option<String>,
    release: Option<String>,
    arch: String,
    vcpu: u32,
    memory_kib: u64,
    interfaces: usize,
    storage: Vec<StorageEntry>,
}

impl ImageMetadataDoc {
    pub(crate) fn new(ctx: &BuildContext) -> Self {
        let arch = if ctx.arch.is_arm() {
            String::from("arm")
        } else {
            ctx.arch.as_str().to_owned()
        };

        Self {
            name: ctx.name.clone(),
            version: ctx.appliance_version.clone(),
            release: ctx.appliance_release.clone(),
            arch,
            vcpu: ctx.vcpu,
            memory_kib: ctx.vmem_mib * 1024,
            interfaces: ctx.networks,
            storage: Vec::new(),
        }
    }

    pub(crate) fn add_disk(&mut self, entry: StorageEntry) {
        self.storage.push(entry);
    }

    pub(crate) fn render(&self) -> String {
        let mut name_attrs = String::new();
        if let Some(version) = &self.version {
            name_attrs.push_str(" version='");
            name_attrs.push_str(&xml_escape(version));
            name_attrs.push('\'');
        }
        if let Some(release) = &self.release {
            name_attrs.push_str(" release='");
            name_attrs.push_str(&xml_escape(release));
            name_attrs.push('\'');
        }

        let mut lines = vec![
            String::from("<image>\n"),
            format!("  <name{name_attrs}>{}</name>\n", xml_escape(&self.name)),
            String::from("  <domain>\n"),
            String::from("    <boot type='hvm'>\n"),
            String::from("      <guest>\n"),
            format!("        <arch>{}</arch>\n", self.arch),
            String::from("      </guest>\n"),
            String::from("      <os>\n"),
            String::from("        <loader dev='hd'/>\n"),
            String::from("      </os>\n"),
        ];

        for (letter, disk) in ('a'..='z').zip(&self.storage) {
            lines.push(format!(
                "      <drive disk='{}' target='hd{letter}'/>\n",
                xml_escape(&disk.file_name)
            ));
        }

        lines.push(String::from("    </boot>\n"));
        lines.push(String::from("    <devices>\n"));
        lines.push(format!("      <vcpu>{}</vcpu>\n", self.vcpu));
        lines.push(format!("      <memory>{}</memory>\n", self.memory_kib));
        for _ in 0..self.interfaces {
            lines.push(String::from("      <interface/>\n"));
        }
        lines.push(String::from("      <graphics/>\n"));
        lines.push(String::from("    </devices>\n"));
        lines.push(String::from("  </domain>\n"));
        lines.push(String::from("  <storage>\n"));

        for disk in &self.storage {
            let file = xml_escape(&disk.file_name);

            if disk.checksums.is_empty() {
                lines.push(format!(
                    "    <disk file='{file}' use='system' format='{DISK_FORMAT}'/>\n"
                ));
                continue;
            }

            lines.push(format!(
                "    <disk file='{file}' use='system' format='{DISK_FORMAT}'>\n"
            ));
            for (algo, digest) in &disk.checksums {
                lines.push(format!("      <checksum type='{algo}'>{digest}</checksum>\n"));
            }
            lines.push(String::from("    </disk>\n"));
        }

        lines.push(String::from("  </storage>\n"));
        lines.push(String::from("</image>\n"));
        lines.concat()
    }
}

/// Writes `<outdir>/<name>.xml` describing the finalized disks
///
/// Checksums are computed from the files in the output directory. Packed
/// disks aren't there anymore and get no checksum.
pub(crate) fn write_metadata(
    ctx: &BuildContext,
    output: &FinalOutput,
) -> Result<PathBuf, ImagerError> {
    let with_checksums = ctx.checksum && !output.is_packed();
    if ctx.checksum && output.is_packed() {
        warn!("Disks were packed into an archive, skipping checksums");
    }

    let mut doc = ImageMetadataDoc::new(ctx);

    for file in &output.files {
        let checksums = if with_checksums {
            file_checksums(&ctx.outdir.join(&file.file_name))?
        } else {
            Vec::new()
        };

        doc.add_disk(StorageEntry {
            file_name: file.file_name.clone(),
            checksums,
        });
    }

    let path = ctx.outdir.join(format!("{}.xml", ctx.name));
    info!("Writing image descriptor {}", path.display());

    fs::write(&path, doc.render())?;
    Ok(path)
}
