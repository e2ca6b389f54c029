use std::path::PathBuf;

use bmap::BmapCreate;
use log::{debug, info, warn};
use types::ImagerError;

use crate::{context::BuildContext, finalize::FinalOutput};

/// Generates a block map next to every raw disk file in the output directory
pub(crate) fn generate_bmaps(
    ctx: &BuildContext,
    output: &FinalOutput,
) -> Result<Vec<PathBuf>, ImagerError> {
    if !ctx.generate_bmap {
        return Ok(Vec::new());
    }

    if output.is_packed() || output.compressed {
        warn!("Block maps can only be generated for uncompressed, unpacked disks, skipping");
        return Ok(Vec::new());
    }

    info!("Generating the map file(s)");

    let mut bmaps = Vec::with_capacity(output.files.len());
    for file in &output.files {
        let image = ctx.outdir.join(&file.file_name);
        let bmap_file = ctx.outdir.join(ctx.full_name(&file.disk, "bmap"));

        debug!("Generating block map file '{}'", bmap_file.display());

        let map = BmapCreate::new(&image, &bmap_file)
            .generate()
            .map_err(|e| ImagerError::Build(format!("Failed to create bmap file: {e}")))?;

        debug!(
            "{} maps {} of {} blocks",
            bmap_file.display(),
            map.mapped_blocks_count(),
            map.blocks_count
        );

        bmaps.push(bmap_file);
    }

    Ok(bmaps)
}
