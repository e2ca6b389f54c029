use layout::Partition;
use log::debug;
use types::ImagerError;

/// Resolves the partitions of an image description into the set of disks to create
#[derive(Debug)]
pub(crate) struct DiskLayout {
    partitions: Vec<Partition>,
    disks: Option<Vec<String>>,
}

impl DiskLayout {
    /// Creates the layout, falling back to a single default root partition if
    /// the description doesn't list any.
    pub(crate) fn new(partitions: &[Partition]) -> Self {
        let partitions = if partitions.is_empty() {
            debug!("No partition given, using the default root partition");
            vec![Partition::default_root()]
        } else {
            partitions.to_vec()
        };

        Self {
            partitions,
            disks: None,
        }
    }

    pub(crate) fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Returns the names of the disks used by the partitions, deduplicated
    /// and in order of first use. The result is computed once.
    pub(crate) fn resolve_disks(&mut self) -> Result<&[String], ImagerError> {
        if self.disks.is_none() {
            let mut disks: Vec<String> = Vec::new();

            for (idx, part) in self.partitions.iter().enumerate() {
                let disk = part.disk.as_ref().ok_or(ImagerError::Config(format!(
                    "Failed to create disks, no disk specified for partition {idx}"
                )))?;

                if let Some(mnt) = &part.mnt {
                    if part.fs.is_none() {
                        return Err(ImagerError::Config(format!(
                            "Failed to create disks, no filesystem type specified for partition with mountpoint '{mnt}'"
                        )));
                    }
                }

                if !disks.contains(disk) {
                    debug!("Partition {idx} adds disk {disk}");
                    disks.push(disk.clone());
                }
            }

            self.disks = Some(disks);
        }

        Ok(self.disks.as_deref().unwrap_or_default())
    }
}
