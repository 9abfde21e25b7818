//! VMIL bytecode: instruction model, pools, and the compiled image codec
//!
//! Split mirrors the pipeline: [`instr`] is the symbolic in-memory form,
//! [`opcode`] the wire word layout, [`encoder`] the raw word stream,
//! [`pools`] the literal pools, [`code`] the per-body codec, and [`image`]
//! the whole-program image format.

pub mod code;
pub mod encoder;
pub mod image;
pub mod instr;
pub mod opcode;
pub mod pools;

pub use code::{decode_body, encode_body, DecodedBody, EncodedBody, FieldRef};
pub use encoder::{words_from_bytes, DecodeError, WordReader, WordWriter};
pub use image::{read_image, read_program, write_image, write_program, EncodeError, LoadError};
pub use instr::Instruction;
pub use opcode::Opcode;
pub use pools::{IntegerPool, StringPool};
