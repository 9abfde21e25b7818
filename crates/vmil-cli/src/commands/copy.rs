//! `vmil copy` — Re-encode an image through a load/store round trip.
//!
//! Useful for normalizing images from other producers: the output carries
//! the canonical pool ordering and synthesized positional names.

use anyhow::Context;
use std::fs::File;
use std::path::Path;

pub fn execute(input: &Path, output: &Path) -> anyhow::Result<()> {
    let program = super::load_image(input)?;

    let mut sink =
        File::create(output).with_context(|| format!("cannot create {}", output.display()))?;
    vmil_engine::write_image(&program, &mut sink)
        .with_context(|| format!("cannot write image {}", output.display()))?;

    println!(
        "{} -> {} ({} classes, {} handlers)",
        input.display(),
        output.display(),
        program.class_count(),
        program.handler_count()
    );
    Ok(())
}
