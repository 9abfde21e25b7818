//! Subcommand implementations

pub mod copy;
pub mod dump;
pub mod mro;
pub mod verify;

use anyhow::Context;
use std::fs::File;
use std::path::Path;
use vmil_engine::program::{ClassId, Program};

/// Open and decode an image file.
pub fn load_image(path: &Path) -> anyhow::Result<Program> {
    let mut file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    vmil_engine::read_image(&mut file)
        .with_context(|| format!("cannot load image {}", path.display()))
}

/// Resolve a possibly dotted class path (`Outer.Inner`) from the roots.
pub fn find_class(program: &Program, path: &str) -> anyhow::Result<ClassId> {
    let mut segments = path.split('.');
    let root_name = segments.next().unwrap_or_default();
    let mut current = program
        .root_named(root_name)
        .ok_or_else(|| anyhow::anyhow!("no top-level class named {root_name:?}"))?;
    for segment in segments {
        let scope = program.class(current).name.clone();
        current = program
            .class(current)
            .inner_named(segment)
            .ok_or_else(|| anyhow::anyhow!("no class named {segment:?} inside {scope:?}"))?;
    }
    Ok(current)
}
