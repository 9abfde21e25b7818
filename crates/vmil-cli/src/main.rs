//! VMIL image tooling
//!
//! Single command-line interface over compiled VMIL images: inspection,
//! verification, linearization queries, and normalizing copies.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "vmil")]
#[command(about = "VMIL image toolchain", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an image's classes, handlers, and bodies
    Dump {
        /// Image file to dump
        file: PathBuf,
        /// Also disassemble handler bodies
        #[arg(short, long)]
        bodies: bool,
    },

    /// Load an image and report whether it verifies
    Verify {
        /// Image file to check
        file: PathBuf,
    },

    /// Print the linearization of a class
    Mro {
        /// Image file to load
        file: PathBuf,
        /// Class name, dotted for nested classes (Outer.Inner)
        class: String,
    },

    /// Re-encode an image through a load/store round trip
    Copy {
        /// Source image
        input: PathBuf,
        /// Destination image
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Dump { file, bodies } => commands::dump::execute(&file, bodies),
        Commands::Verify { file } => commands::verify::execute(&file),
        Commands::Mro { file, class } => commands::mro::execute(&file, &class),
        Commands::Copy { input, output } => commands::copy::execute(&input, &output),
    }
}
