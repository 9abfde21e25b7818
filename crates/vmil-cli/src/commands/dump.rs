//! `vmil dump` — Print an image's classes, handlers, and bodies.

use std::path::Path;
use vmil_engine::program::{Class, HandlerBody, Program, Visibility};

pub fn execute(file: &Path, bodies: bool) -> anyhow::Result<()> {
    let program = super::load_image(file)?;

    println!(
        "{}: {} classes, {} handlers",
        file.display(),
        program.class_count(),
        program.handler_count()
    );
    if let Some(entry) = program.entrypoint {
        let handler = program.handler(entry);
        println!(
            "entrypoint: {}",
            handler.name.as_deref().unwrap_or("(default)")
        );
    }
    println!();

    for &root in program.roots() {
        dump_class(&program, program.class(root), 0, bodies);
    }
    Ok(())
}

fn dump_class(program: &Program, class: &Class, depth: usize, bodies: bool) {
    let pad = "  ".repeat(depth);
    let extends = if class.superclass_names.is_empty() {
        String::new()
    } else {
        format!(" extends {}", class.superclass_names.join(", "))
    };
    println!(
        "{pad}{} class {}{extends}",
        visibility_keyword(class.visibility),
        class.name
    );
    for field in &class.field_names {
        println!("{pad}  field {field}");
    }

    for &id in class.handlers() {
        let handler = program.handler(id);
        let name = handler.name.as_deref().unwrap_or("(default)");
        match &handler.body {
            HandlerBody::External { binding } => {
                println!(
                    "{pad}  {} external {name} -> {binding}",
                    visibility_keyword(handler.visibility)
                );
            }
            HandlerBody::Vmil { instructions, .. } => {
                println!(
                    "{pad}  {} handler {name} ({} args)",
                    visibility_keyword(handler.visibility),
                    handler.argument_count
                );
                if bodies {
                    for instruction in instructions {
                        println!("{pad}    {instruction}");
                    }
                }
            }
        }
    }
    if let Some(id) = class.default_handler {
        let handler = program.handler(id);
        println!("{pad}  default handler ({} args)", handler.argument_count);
        if bodies {
            if let HandlerBody::Vmil { instructions, .. } = &handler.body {
                for instruction in instructions {
                    println!("{pad}    {instruction}");
                }
            }
        }
    }

    for &inner in class.inner_classes() {
        dump_class(program, program.class(inner), depth + 1, bodies);
    }
}

fn visibility_keyword(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "public",
        Visibility::Protected => "protected",
        Visibility::Private => "private",
        Visibility::None => "anonymous",
    }
}
