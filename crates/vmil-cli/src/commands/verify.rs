//! `vmil verify` — Load an image and report whether it verifies.
//!
//! Loading already runs every structural check the codec knows; this
//! command adds the whole-hierarchy checks that need the wired program,
//! linearizing every class so inheritance errors surface too.

use std::path::Path;
use vmil_engine::linearize::linearization;

pub fn execute(file: &Path) -> anyhow::Result<()> {
    let program = super::load_image(file)?;

    let mut errors = 0usize;
    for (id, class) in program.classes() {
        if let Err(error) = linearization(&program, &program, id) {
            eprintln!("class {}: {error}", class.name);
            errors += 1;
        }
    }
    if errors > 0 {
        anyhow::bail!("{errors} class(es) failed to linearize");
    }

    println!(
        "{}: ok ({} classes, {} handlers)",
        file.display(),
        program.class_count(),
        program.handler_count()
    );
    Ok(())
}
