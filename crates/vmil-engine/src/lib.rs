//! VMIL Runtime Engine
//!
//! This crate provides the VMIL managed-runtime core:
//! - **Heap**: Word-addressed heap with handle indirection and sliding
//!   compaction (`heap` module)
//! - **Program**: Class and handler arena with lexical name resolution
//!   (`program` module)
//! - **Linearization**: Multiple-inheritance class ordering (`linearize`
//!   module)
//! - **Dispatch**: Message resolution with visibility and qualified sends
//!   (`dispatch` module)
//! - **Bytecode**: Compiled image codec and verification (`bytecode` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use vmil_engine::bytecode::read_image;
//! use vmil_engine::dispatch::{resolve, Resolution};
//! use vmil_engine::linearize::linearization;
//!
//! let program = read_image(&mut std::fs::File::open("app.vmb")?)?;
//! let main = program.root_named("Main").unwrap();
//! let order = linearization(&program, &program, main)?;
//! match resolve(&program, &program, main, main, "run:1")? {
//!     Resolution::Handler(id) => println!("dispatches to {id}"),
//!     other => println!("{other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod dispatch;
pub mod heap;
pub mod linearize;
pub mod program;

pub use bytecode::{read_image, write_image, EncodeError, Instruction, LoadError};
pub use dispatch::{resolve, Resolution};
pub use heap::{Heap, HeapError};
pub use linearize::{linearization, LinearizeError};
pub use program::{Class, ClassId, ClassResolver, HandlerId, MessageHandler, Program, Visibility};
