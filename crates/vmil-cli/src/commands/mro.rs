//! `vmil mro` — Print the linearization of a class.

use std::path::Path;
use vmil_engine::linearize::{instance_size, linearization};

pub fn execute(file: &Path, class_path: &str) -> anyhow::Result<()> {
    let program = super::load_image(file)?;
    let class = super::find_class(&program, class_path)?;

    let order = linearization(&program, &program, class)?;
    for (position, &id) in order.iter().enumerate() {
        let entry = program.class(id);
        println!(
            "{position:3}  {} ({} fields)",
            entry.name,
            entry.field_count()
        );
    }
    println!(
        "instance size: {} fields",
        instance_size(&program, &program, class)?
    );
    Ok(())
}
