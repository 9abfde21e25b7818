//! Compiled image format
//!
//! An image is four pools, in fixed order: integers, strings, handlers,
//! classes. Handlers precede classes so every handler reference a class
//! entry carries points backwards into the already-read pool; classes are
//! written in nesting post-order so inner-class references do too. A class
//! entry opens with its four counts, then the header word, then the
//! reference lists. There is no magic number or version word.
//!
//! Names are policy here: class, superclass, handler, and binding names go
//! through the string pool because loading needs them for resolution and
//! dispatch. Field, argument, and local names do not survive encoding; the
//! wire carries counts and indices, and the loader synthesizes positional
//! names (`field0`, `arg0`, `loc0`).

use super::code::{decode_body, encode_body, FieldRef};
use super::encoder::{words_from_bytes, DecodeError, WordReader, WordWriter};
use super::opcode::OPERAND_MASK;
use super::pools::{IntegerPool, StringPool};
use crate::heap::Word;
use crate::program::{
    Class, ClassId, HandlerBody, HandlerId, MessageHandler, Program, ProgramError, Visibility,
};
use rustc_hash::FxHashMap;
use std::io;
use thiserror::Error;

/// Handler header: name index above four flag/visibility bits.
const HANDLER_NAME_SHIFT: u32 = 4;
const HANDLER_ENTRYPOINT_BIT: u32 = 1 << 3;
const HANDLER_EXTERNAL_BIT: u32 = 1 << 2;
const HANDLER_VISIBILITY_MASK: u32 = 0b11;

/// Class header: name index above three visibility bits.
const CLASS_NAME_SHIFT: u32 = 3;
const CLASS_VISIBILITY_MASK: u32 = 0b111;

/// Image encoding errors
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A label name appears twice in one handler body.
    #[error("duplicate label {label:?}")]
    DuplicateLabel {
        /// The repeated label name
        label: String,
    },

    /// A branch names a label the body never defines.
    #[error("branch to unknown label {label:?}")]
    UnknownLabel {
        /// The missing label name
        label: String,
    },

    /// A branch or region span exceeds the operand range.
    #[error("branch distance {distance} exceeds the operand range")]
    BranchTooFar {
        /// Distance in instructions
        distance: usize,
    },

    /// Try/Catch/EndTryCatch do not nest.
    #[error("unbalanced try/catch at instruction {instruction}")]
    UnbalancedTryCatch {
        /// Index of the offending instruction
        instruction: usize,
    },

    /// A slot name is neither an argument nor a local of its handler.
    #[error("unknown slot {name:?}")]
    UnknownSlot {
        /// The unresolved slot name
        name: String,
    },

    /// A field name is not declared by the owning class.
    #[error("class {class:?} declares no field named {name:?}")]
    UnknownField {
        /// Owning class name
        class: String,
        /// The unresolved field name
        name: String,
    },

    /// A handler is in the arena but attached to no class.
    #[error("handler {name:?} is not attached to any class")]
    UnboundHandler {
        /// Handler name, empty for the anonymous default
        name: String,
    },

    /// A pool grew past what an operand or header can index.
    #[error("pool index {index} does not fit the wire encoding")]
    PoolIndexTooLarge {
        /// The overflowing index
        index: usize,
    },

    /// A class is in the arena but reachable from no root.
    #[error("class {name:?} is not reachable from any root class")]
    UnreachableClass {
        /// The stranded class name
        name: String,
    },

    /// The nesting graph contains a cycle.
    #[error("class {name:?} participates in a nesting cycle")]
    NestingCycle {
        /// A class on the cycle
        name: String,
    },

    /// Sink failure while writing.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Image loading errors
#[derive(Debug, Error)]
pub enum LoadError {
    /// Raw word-stream failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Source failure while reading.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An instruction word carries an unassigned opcode pattern.
    #[error("unknown opcode {bits:#04x} at word {position}")]
    BadOpcode {
        /// The 5-bit pattern
        bits: u8,
        /// Stream word position
        position: usize,
    },

    /// A header carries an unassigned visibility pattern.
    #[error("invalid visibility {bits:#x} at word {position}")]
    BadVisibility {
        /// The raw visibility bits
        bits: u8,
        /// Stream word position
        position: usize,
    },

    /// An anonymous default handler cannot be external.
    #[error("anonymous external handler at word {position}")]
    AnonymousExternal {
        /// Stream word position
        position: usize,
    },

    /// An index points past the pool it indexes.
    #[error("{what} index {index} out of range (pool has {limit}) at word {position}")]
    IndexOutOfRange {
        /// Which pool the index targets
        what: &'static str,
        /// The out-of-range index
        index: usize,
        /// Pool size at decode time
        limit: usize,
        /// Stream word position
        position: usize,
    },

    /// A slot operand exceeds the handler's argument and local counts.
    #[error(
        "slot {index} out of range ({argument_count} arguments, {local_count} locals) at word {position}"
    )]
    SlotOutOfRange {
        /// The out-of-range slot index
        index: u32,
        /// Declared argument count
        argument_count: u32,
        /// Declared local count
        local_count: u32,
        /// Stream word position
        position: usize,
    },

    /// A wide integer literal does not fit the value range.
    #[error("integer literal out of range at word {position}")]
    IntegerOutOfRange {
        /// Stream word position
        position: usize,
    },

    /// A branch target falls outside the handler body.
    #[error("branch at instruction {instruction} targets {target}, outside the body")]
    BranchOutOfBounds {
        /// Index of the branching instruction
        instruction: usize,
        /// The out-of-range target index
        target: i64,
    },

    /// Try/Catch/EndTryCatch do not nest.
    #[error("unbalanced try/catch at instruction {instruction}")]
    UnbalancedTryCatch {
        /// Index of the offending instruction
        instruction: usize,
    },

    /// A Try or Catch operand disagrees with the structural matching.
    #[error("try/catch distance mismatch at instruction {instruction}")]
    TryCatchMismatch {
        /// Index of the lying instruction
        instruction: usize,
    },

    /// A jump crosses its innermost try/catch region boundary.
    #[error("jump at instruction {instruction} targets {target}, escaping its try/catch region")]
    JumpEscapesRegion {
        /// Index of the jumping instruction
        instruction: usize,
        /// The escaping target index
        target: usize,
    },

    /// A field operand exceeds the owning class's declared field block.
    #[error("field index {index} out of range for class {class:?} ({count} fields)")]
    FieldIndexOutOfRange {
        /// Owning class name
        class: String,
        /// The out-of-range field index
        index: u32,
        /// Declared field count
        count: u32,
    },

    /// An inner-class reference points at or past its own entry.
    #[error("forward or null class reference at word {position}")]
    ForwardClassReference {
        /// Stream word position
        position: usize,
    },

    /// More than one handler carries the entrypoint flag.
    #[error("image marks more than one entrypoint")]
    MultipleEntrypoints,

    /// A handler is referenced by no class entry.
    #[error("handler {index} is attached to no class")]
    OrphanHandler {
        /// Handler pool index
        index: usize,
    },

    /// Structurally valid words wire into an inconsistent program.
    #[error("inconsistent program near word {position}: {source}")]
    Wiring {
        /// Stream word position of the class entry being wired
        position: usize,
        /// The underlying wiring failure
        source: ProgramError,
    },

    /// Words remain after the last pool.
    #[error("{words} trailing words after the class pool")]
    TrailingData {
        /// Number of unconsumed words
        words: usize,
    },

    /// A count prefix exceeds the words left in the stream.
    #[error("{what} count {count} exceeds the {remaining} remaining words at word {position}")]
    CountTooLarge {
        /// Which structure carried the count
        what: &'static str,
        /// The claimed count
        count: usize,
        /// Words remaining when it was read
        remaining: usize,
        /// Stream word position
        position: usize,
    },

    /// A declared argument, local, or field count exceeds the operand range.
    #[error("{what} {count} exceeds the operand limit at word {position}")]
    CountOverflow {
        /// Which declared quantity overflowed
        what: &'static str,
        /// The claimed count
        count: u32,
        /// Stream word position
        position: usize,
    },

    /// Packed string words are not valid UTF-16.
    #[error("malformed string near word {position}")]
    MalformedString {
        /// Stream word position
        position: usize,
    },
}

// ============================================================================
// Writing
// ============================================================================

/// Encode a program into image words.
pub fn write_program(program: &Program) -> Result<Vec<Word>, EncodeError> {
    let mut integers = IntegerPool::new();
    let mut strings = StringPool::new();

    // Handler pool body. Interning mutates the pools, so pool sections are
    // assembled last even though they lead the stream.
    let mut handler_words = WordWriter::new();
    for (_, handler) in program.handlers() {
        let owner = handler.owner().ok_or_else(|| EncodeError::UnboundHandler {
            name: handler.name.clone().unwrap_or_default(),
        })?;
        let owner_class = program.class(owner);

        let name_index = match &handler.name {
            Some(name) => checked_index(strings.intern(name), HANDLER_NAME_SHIFT)?,
            None => 0,
        };
        let mut header = (name_index << HANDLER_NAME_SHIFT)
            | (u32::from(handler.visibility.bits()) & HANDLER_VISIBILITY_MASK);
        if handler.is_entrypoint {
            header |= HANDLER_ENTRYPOINT_BIT;
        }
        if matches!(handler.body, HandlerBody::External { .. }) {
            header |= HANDLER_EXTERNAL_BIT;
        }
        handler_words.emit(header);
        handler_words.emit(handler.argument_count);

        match &handler.body {
            HandlerBody::External { binding } => {
                handler_words.emit(strings.intern(binding));
            }
            HandlerBody::Vmil {
                argument_names,
                local_names,
                instructions,
            } => {
                let body = encode_body(
                    instructions,
                    argument_names,
                    local_names,
                    &owner_class.field_names,
                    &owner_class.name,
                    &mut integers,
                    &mut strings,
                )?;
                handler_words.emit(local_names.len() as u32);
                handler_words.emit(body.instruction_count as u32);
                for &word in &body.words {
                    handler_words.emit(word);
                }
            }
        }
    }

    // Class pool body, nesting post-order.
    let order = class_emission_order(program)?;
    let position_of: FxHashMap<ClassId, u32> = order
        .iter()
        .enumerate()
        .map(|(position, &id)| (id, position as u32))
        .collect();
    let mut class_words = WordWriter::new();
    for &id in &order {
        let class = program.class(id);
        let name_index = checked_index(strings.intern(&class.name), CLASS_NAME_SHIFT)?;

        // Counts lead the entry, then the header word, then the
        // reference lists. Handler, default, and inner references are
        // all 1-based so 0 can mean "none".
        class_words.emit(class.superclass_names.len() as u32);
        class_words.emit(class.field_count());
        class_words.emit(class.handlers().len() as u32);
        class_words.emit(class.inner_classes().len() as u32);

        class_words
            .emit((name_index << CLASS_NAME_SHIFT) | u32::from(class.visibility.bits()));

        for name in &class.superclass_names {
            class_words.emit(strings.intern(name));
        }
        class_words.emit(match class.default_handler {
            Some(handler) => handler.0 + 1,
            None => 0,
        });
        for &handler in class.handlers() {
            class_words.emit(handler.0 + 1);
        }
        for &inner in class.inner_classes() {
            class_words.emit(position_of[&inner] + 1);
        }
    }

    let mut writer = WordWriter::new();
    integers.encode(&mut writer);
    strings.encode(&mut writer);
    writer.emit(program.handler_count() as u32);
    for &word in handler_words.words() {
        writer.emit(word);
    }
    writer.emit(order.len() as u32);
    for &word in class_words.words() {
        writer.emit(word);
    }
    Ok(writer.into_words())
}

/// Encode and frame a program little-endian into a byte sink.
pub fn write_image(program: &Program, sink: &mut impl io::Write) -> Result<(), EncodeError> {
    for &word in &write_program(program)? {
        sink.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn checked_index(index: u32, shift: u32) -> Result<u32, EncodeError> {
    if index > u32::MAX >> shift {
        return Err(EncodeError::PoolIndexTooLarge {
            index: index as usize,
        });
    }
    Ok(index)
}

/// Nesting post-order over all classes reachable from the roots: every
/// inner class precedes its enclosing class, so references in the pool
/// point backwards.
fn class_emission_order(program: &Program) -> Result<Vec<ClassId>, EncodeError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        program: &Program,
        id: ClassId,
        marks: &mut [Mark],
        out: &mut Vec<ClassId>,
    ) -> Result<(), EncodeError> {
        match marks[id.0 as usize] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(EncodeError::NestingCycle {
                    name: program.class(id).name.clone(),
                })
            }
            Mark::Unvisited => {}
        }
        marks[id.0 as usize] = Mark::Visiting;
        for &inner in program.class(id).inner_classes() {
            visit(program, inner, marks, out)?;
        }
        marks[id.0 as usize] = Mark::Done;
        out.push(id);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; program.class_count()];
    let mut order = Vec::with_capacity(program.class_count());
    for &root in program.roots() {
        visit(program, root, &mut marks, &mut order)?;
    }
    if order.len() != program.class_count() {
        let stranded = program
            .classes()
            .find(|(id, _)| marks[id.0 as usize] != Mark::Done)
            .map(|(_, class)| class.name.clone())
            .unwrap_or_default();
        return Err(EncodeError::UnreachableClass { name: stranded });
    }
    Ok(order)
}

// ============================================================================
// Reading
// ============================================================================

/// Decode image words into a wired program.
pub fn read_program(words: &[Word]) -> Result<Program, LoadError> {
    let mut reader = WordReader::new(words);
    let integers = IntegerPool::decode(&mut reader)?;
    let strings = StringPool::decode(&mut reader)?;

    let mut program = Program::new();
    let mut entrypoint = None;

    // Handler pool. Field operands cannot be checked yet; the owning class's
    // field count arrives with the class pool, so refs are parked per handler.
    let handler_count = read_count(&mut reader, "handler pool")?;
    let mut parked_field_refs: Vec<Vec<FieldRef>> = Vec::with_capacity(handler_count);
    for index in 0..handler_count {
        let header_position = reader.position();
        let header = reader.read()?;
        let visibility = Visibility::from_bits((header & HANDLER_VISIBILITY_MASK) as u8)
            .ok_or(LoadError::BadVisibility {
                bits: (header & HANDLER_VISIBILITY_MASK) as u8,
                position: header_position,
            })?;
        let is_entrypoint = header & HANDLER_ENTRYPOINT_BIT != 0;
        let is_external = header & HANDLER_EXTERNAL_BIT != 0;
        let name_index = header >> HANDLER_NAME_SHIFT;
        let argument_count = reader.read()?;
        checked_declared_count("argument count", argument_count, reader.position() - 1)?;

        let mut handler = if is_external {
            if visibility == Visibility::None {
                return Err(LoadError::AnonymousExternal {
                    position: header_position,
                });
            }
            let name = pooled_string(&strings, name_index, header_position)?;
            let binding_index = reader.read()?;
            let binding = pooled_string(&strings, binding_index, reader.position() - 1)?;
            parked_field_refs.push(Vec::new());
            MessageHandler::external(visibility, name, argument_count, binding)
        } else {
            let local_count = reader.read()?;
            checked_declared_count("local count", local_count, reader.position() - 1)?;
            let instruction_count = read_count(&mut reader, "handler body")?;
            let body = decode_body(
                &mut reader,
                instruction_count,
                argument_count,
                local_count,
                &integers,
                &strings,
            )?;
            parked_field_refs.push(body.field_refs);
            let argument_names = (0..argument_count).map(|i| format!("arg{i}")).collect();
            let local_names = (0..local_count).map(|i| format!("loc{i}")).collect();
            if visibility == Visibility::None {
                MessageHandler::anonymous_default(argument_names, local_names, body.instructions)
            } else {
                let name = pooled_string(&strings, name_index, header_position)?;
                MessageHandler::vmil(
                    visibility,
                    name,
                    argument_names,
                    local_names,
                    body.instructions,
                )
            }
        };
        if is_entrypoint {
            if entrypoint.is_some() {
                return Err(LoadError::MultipleEntrypoints);
            }
            entrypoint = Some(HandlerId(index as u32));
            handler = handler.entrypoint();
        }
        program.add_handler(handler);
    }

    // Class pool. Entries arrive in nesting post-order; inner references are
    // one-based and must point strictly backwards.
    let class_count = read_count(&mut reader, "class pool")?;
    let mut claimed_as_inner = vec![false; class_count];
    for index in 0..class_count {
        let superclass_count = read_count(&mut reader, "superclass list")?;
        let field_count = reader.read()?;
        checked_declared_count("field count", field_count, reader.position() - 1)?;
        let named_handler_count = read_count(&mut reader, "handler list")?;
        let inner_count = read_count(&mut reader, "inner class list")?;

        let header_position = reader.position();
        let header = reader.read()?;
        let visibility_bits = (header & CLASS_VISIBILITY_MASK) as u8;
        let visibility =
            Visibility::from_bits(visibility_bits).ok_or(LoadError::BadVisibility {
                bits: visibility_bits,
                position: header_position,
            })?;
        let name = pooled_string(&strings, header >> CLASS_NAME_SHIFT, header_position)?;

        let mut superclass_names = Vec::with_capacity(superclass_count);
        for _ in 0..superclass_count {
            let name_index = reader.read()?;
            superclass_names.push(pooled_string(&strings, name_index, reader.position() - 1)?);
        }

        let field_names = (0..field_count).map(|i| format!("field{i}")).collect();

        let id = program.add_class(Class::new(name, visibility, superclass_names, field_names));
        debug_assert_eq!(id.0 as usize, index);

        let default_position = reader.position();
        let default_word = reader.read()? as usize;
        if default_word != 0 {
            let handler = checked_handler(default_word, handler_count, default_position)?;
            check_field_refs(&program, id, &parked_field_refs[handler.0 as usize])?;
            program
                .attach_default_handler(id, handler)
                .map_err(|source| LoadError::Wiring {
                    position: default_position,
                    source,
                })?;
        }

        for _ in 0..named_handler_count {
            let handler_position = reader.position();
            let reference = reader.read()? as usize;
            let handler = checked_handler(reference, handler_count, handler_position)?;
            check_field_refs(&program, id, &parked_field_refs[handler.0 as usize])?;
            program
                .attach_handler(id, handler)
                .map_err(|source| LoadError::Wiring {
                    position: handler_position,
                    source,
                })?;
        }

        for _ in 0..inner_count {
            let reference_position = reader.position();
            let reference = reader.read()? as usize;
            if reference == 0 || reference > index {
                return Err(LoadError::ForwardClassReference {
                    position: reference_position,
                });
            }
            let inner = ClassId(reference as u32 - 1);
            program
                .attach_inner_class(id, inner)
                .map_err(|source| LoadError::Wiring {
                    position: reference_position,
                    source,
                })?;
            claimed_as_inner[reference - 1] = true;
        }
    }

    if !reader.at_end() {
        return Err(LoadError::TrailingData {
            words: reader.remaining(),
        });
    }

    // Classes no entry claimed as inner are the top-level roots; post-order
    // keeps their relative declaration order.
    let last = reader.position();
    for index in 0..class_count {
        if !claimed_as_inner[index] {
            program
                .add_root(ClassId(index as u32))
                .map_err(|source| LoadError::Wiring {
                    position: last,
                    source,
                })?;
        }
    }

    for (id, handler) in program.handlers() {
        if handler.owner().is_none() {
            return Err(LoadError::OrphanHandler {
                index: id.0 as usize,
            });
        }
    }

    program.entrypoint = entrypoint;
    log::debug!(
        "loaded image: {} classes, {} handlers, {} words",
        class_count,
        handler_count,
        words.len()
    );
    Ok(program)
}

/// Read a byte source, deframe little-endian words, decode a program.
pub fn read_image(source: &mut impl io::Read) -> Result<Program, LoadError> {
    let mut bytes = Vec::new();
    source.read_to_end(&mut bytes)?;
    let words = words_from_bytes(&bytes)?;
    read_program(&words)
}

fn read_count(reader: &mut WordReader<'_>, what: &'static str) -> Result<usize, LoadError> {
    let position = reader.position();
    let count = reader.read()? as usize;
    if count > reader.remaining() {
        return Err(LoadError::CountTooLarge {
            what,
            count,
            remaining: reader.remaining(),
            position,
        });
    }
    Ok(count)
}

fn pooled_string(strings: &StringPool, index: u32, position: usize) -> Result<String, LoadError> {
    strings
        .get(index)
        .map(|s| s.to_string())
        .ok_or(LoadError::IndexOutOfRange {
            what: "string pool",
            index: index as usize,
            limit: strings.len(),
            position,
        })
}

fn checked_handler(
    reference: usize,
    handler_count: usize,
    position: usize,
) -> Result<HandlerId, LoadError> {
    if reference == 0 || reference > handler_count {
        return Err(LoadError::IndexOutOfRange {
            what: "handler pool",
            index: reference,
            limit: handler_count,
            position,
        });
    }
    Ok(HandlerId(reference as u32 - 1))
}

// Declared slot and field counts feed name synthesis and allocation long
// before any instruction exercises them, so they are bounded up front by
// what a 27-bit operand could ever address.
fn checked_declared_count(
    what: &'static str,
    count: u32,
    position: usize,
) -> Result<(), LoadError> {
    if count > OPERAND_MASK {
        return Err(LoadError::CountOverflow {
            what,
            count,
            position,
        });
    }
    Ok(())
}

fn check_field_refs(
    program: &Program,
    owner: ClassId,
    refs: &[FieldRef],
) -> Result<(), LoadError> {
    let class = program.class(owner);
    let count = class.field_count();
    for field_ref in refs {
        if field_ref.index >= count {
            return Err(LoadError::FieldIndexOutOfRange {
                class: class.name.clone(),
                index: field_ref.index,
                count,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;

    /// Two classes: `Base` with one field and a protected handler, `Main`
    /// extending it with an entrypoint, an external handler, a default
    /// handler, and one inner class.
    fn sample_program() -> Program {
        let mut program = Program::new();

        let base = program.add_class(Class::new(
            "Base",
            Visibility::Public,
            vec![],
            vec!["field0".into()],
        ));
        let base_get = program.add_handler(MessageHandler::vmil(
            Visibility::Protected,
            "value:0",
            vec![],
            vec![],
            vec![
                Instruction::LoadField("field0".into()),
                Instruction::Return,
            ],
        ));
        program.attach_handler(base, base_get).unwrap();
        program.add_root(base).unwrap();

        let main = program.add_class(Class::new(
            "Main",
            Visibility::Public,
            vec!["Base".into()],
            vec![],
        ));
        let run = program.add_handler(
            MessageHandler::vmil(
                Visibility::Public,
                "run:1",
                vec!["arg0".into()],
                vec!["loc0".into()],
                vec![
                    Instruction::Try,
                    Instruction::PushInt(200_000_000),
                    Instruction::StoreSlot("loc0".into()),
                    Instruction::Label("L0".into()),
                    Instruction::LoadSlot("arg0".into()),
                    Instruction::JumpIfFalse("L1".into()),
                    Instruction::Jump("L0".into()),
                    Instruction::Label("L1".into()),
                    Instruction::Catch,
                    Instruction::Pop,
                    Instruction::EndTryCatch,
                    Instruction::PushNull,
                    Instruction::Return,
                ],
            )
            .entrypoint(),
        );
        program.attach_handler(main, run).unwrap();
        let host = program.add_handler(MessageHandler::external(
            Visibility::Private,
            "print:1",
            1,
            "host_print",
        ));
        program.attach_handler(main, host).unwrap();
        let fallback = program.add_handler(MessageHandler::anonymous_default(
            vec![],
            vec![],
            vec![Instruction::PushNull, Instruction::Return],
        ));
        program.attach_default_handler(main, fallback).unwrap();

        let helper = program.add_class(Class::new("Helper", Visibility::Private, vec![], vec![]));
        program.attach_inner_class(main, helper).unwrap();
        program.add_root(main).unwrap();

        program
    }

    #[test]
    fn test_program_round_trip() {
        let source = sample_program();
        let words = write_program(&source).unwrap();
        let loaded = read_program(&words).unwrap();

        assert_eq!(loaded.class_count(), 3);
        assert_eq!(loaded.handler_count(), 4);
        assert_eq!(loaded.roots().len(), 2);

        let base = loaded.root_named("Base").unwrap();
        let main = loaded.root_named("Main").unwrap();
        assert_eq!(loaded.class(base).field_count(), 1);
        assert_eq!(loaded.class(main).superclass_names, vec!["Base"]);

        let value = loaded.class(base).handler_named("value:0").unwrap();
        assert_eq!(loaded.handler(value).visibility, Visibility::Protected);
        match &loaded.handler(value).body {
            HandlerBody::Vmil { instructions, .. } => {
                assert_eq!(instructions[0], Instruction::LoadField("field0".into()));
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let run = loaded.class(main).handler_named("run:1").unwrap();
        assert_eq!(loaded.entrypoint, Some(run));
        assert!(loaded.handler(run).is_entrypoint);
        match &loaded.handler(run).body {
            HandlerBody::Vmil { instructions, .. } => {
                // Wide literal survives the integer pool; labels come back
                // renamed but with the same shape.
                assert!(instructions.contains(&Instruction::PushInt(200_000_000)));
                assert!(instructions.contains(&Instruction::Jump("L0".into())));
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let print = loaded.class(main).handler_named("print:1").unwrap();
        match &loaded.handler(print).body {
            HandlerBody::External { binding } => assert_eq!(binding, "host_print"),
            other => panic!("unexpected body: {other:?}"),
        }

        let fallback = loaded.class(main).default_handler.unwrap();
        assert_eq!(loaded.handler(fallback).name, None);
        assert_eq!(loaded.handler(fallback).visibility, Visibility::None);

        let helper = loaded.class(main).inner_named("Helper").unwrap();
        assert_eq!(loaded.class(helper).enclosing(), Some(main));
        assert_eq!(loaded.class(helper).visibility, Visibility::Private);
    }

    #[test]
    fn test_byte_framing_round_trip() {
        let source = sample_program();
        let mut bytes = Vec::new();
        write_image(&source, &mut bytes).unwrap();
        assert_eq!(bytes.len() % 4, 0);

        let loaded = read_image(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded.class_count(), source.class_count());
        assert_eq!(loaded.handler_count(), source.handler_count());
    }

    #[test]
    fn test_truncated_image_rejected() {
        let words = write_program(&sample_program()).unwrap();
        let result = read_program(&words[..words.len() - 1]);
        assert!(matches!(
            result,
            Err(LoadError::Decode(DecodeError::UnexpectedEnd { .. }))
                | Err(LoadError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn test_trailing_words_rejected() {
        let mut words = write_program(&sample_program()).unwrap();
        words.push(0);
        assert!(matches!(
            read_program(&words),
            Err(LoadError::TrailingData { words: 1 })
        ));
    }

    #[test]
    fn test_unbound_handler_rejected_on_encode() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("A", Visibility::Public, vec![], vec![]));
        program.add_root(a).unwrap();
        program.add_handler(MessageHandler::external(
            Visibility::Public,
            "stray:0",
            0,
            "x",
        ));
        assert!(matches!(
            write_program(&program),
            Err(EncodeError::UnboundHandler { .. })
        ));
    }

    #[test]
    fn test_unreachable_class_rejected_on_encode() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("A", Visibility::Public, vec![], vec![]));
        program.add_class(Class::new("Stranded", Visibility::Public, vec![], vec![]));
        program.add_root(a).unwrap();
        assert!(matches!(
            write_program(&program),
            Err(EncodeError::UnreachableClass { name }) if name == "Stranded"
        ));
    }

    #[test]
    fn test_nesting_cycle_rejected_on_encode() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("A", Visibility::Public, vec![], vec![]));
        let b = program.add_class(Class::new("B", Visibility::Public, vec![], vec![]));
        program.attach_inner_class(a, b).unwrap();
        program.attach_inner_class(b, a).unwrap();
        program.add_root(a).unwrap();
        assert!(matches!(
            write_program(&program),
            Err(EncodeError::NestingCycle { .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected_on_encode() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("A", Visibility::Public, vec![], vec![]));
        let h = program.add_handler(MessageHandler::vmil(
            Visibility::Public,
            "poke:0",
            vec![],
            vec![],
            vec![
                Instruction::LoadField("missing".into()),
                Instruction::Return,
            ],
        ));
        program.attach_handler(a, h).unwrap();
        program.add_root(a).unwrap();
        assert!(matches!(
            write_program(&program),
            Err(EncodeError::UnknownField { .. })
        ));
    }

    /// Flip the field count in `Base`'s class entry down to zero, leaving the
    /// body's field operand dangling.
    #[test]
    fn test_field_index_out_of_range_rejected_on_load() {
        let source = sample_program();
        let mut words = write_program(&source).unwrap();

        // The class pool is last; Base is its first entry and the field
        // count is the second word (after the superclass count).
        let class_pool_start = {
            let mut probe = WordReader::new(&words);
            IntegerPool::decode(&mut probe).unwrap();
            StringPool::decode(&mut probe).unwrap();
            let handler_count = probe.read().unwrap();
            let mut remaining = handler_count;
            while remaining > 0 {
                let header = probe.read().unwrap();
                probe.read().unwrap(); // argument count
                if header & HANDLER_EXTERNAL_BIT != 0 {
                    probe.read().unwrap(); // binding
                } else {
                    probe.read().unwrap(); // local count
                    let instruction_count = probe.read().unwrap();
                    let mut left = instruction_count;
                    while left > 0 {
                        let word = probe.read().unwrap();
                        let (bits, _) = crate::bytecode::Opcode::unpack(word);
                        if crate::bytecode::Opcode::from_bits(bits)
                            .unwrap()
                            .has_extension_word()
                        {
                            probe.read().unwrap();
                        }
                        left -= 1;
                    }
                }
                remaining -= 1;
            }
            probe.read().unwrap(); // class count
            probe.position()
        };
        let field_count_slot = class_pool_start + 1;
        assert_eq!(words[field_count_slot], 1);
        words[field_count_slot] = 0;

        assert!(matches!(
            read_program(&words),
            Err(LoadError::FieldIndexOutOfRange { index: 0, count: 0, .. })
        ));
    }

    #[test]
    fn test_forward_inner_reference_rejected() {
        // Single class entry claiming itself as inner (reference 1 at
        // index 0 points at, not before, its own entry).
        let mut writer = WordWriter::new();
        IntegerPool::new().encode(&mut writer);
        let mut strings = StringPool::new();
        let name = strings.intern("A");
        strings.encode(&mut writer);
        writer.emit(0); // handler pool count
        writer.emit(1); // class pool count
        writer.emit(0); // superclasses
        writer.emit(0); // fields
        writer.emit(0); // named handlers
        writer.emit(1); // one inner
        writer.emit(name << CLASS_NAME_SHIFT); // header, public
        writer.emit(0); // no default
        writer.emit(1); // self-reference
        assert!(matches!(
            read_program(writer.words()),
            Err(LoadError::ForwardClassReference { .. })
        ));
    }

    #[test]
    fn test_two_entrypoints_rejected_on_load() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("A", Visibility::Public, vec![], vec![]));
        let first = program.add_handler(
            MessageHandler::vmil(
                Visibility::Public,
                "one:0",
                vec![],
                vec![],
                vec![Instruction::Return],
            )
            .entrypoint(),
        );
        let second = program.add_handler(
            MessageHandler::vmil(
                Visibility::Public,
                "two:0",
                vec![],
                vec![],
                vec![Instruction::Return],
            )
            .entrypoint(),
        );
        program.attach_handler(a, first).unwrap();
        program.attach_handler(a, second).unwrap();
        program.add_root(a).unwrap();

        let words = write_program(&program).unwrap();
        assert!(matches!(
            read_program(&words),
            Err(LoadError::MultipleEntrypoints)
        ));
    }

    #[test]
    fn test_handler_claimed_twice_rejected_on_load() {
        // Hand-built image: one handler, two classes both attaching it.
        let mut strings = StringPool::new();
        let handler_name = strings.intern("go:0");
        let binding = strings.intern("host_go");
        let a = strings.intern("A");
        let b = strings.intern("B");

        let mut writer = WordWriter::new();
        IntegerPool::new().encode(&mut writer);
        strings.encode(&mut writer);
        writer.emit(1); // handler pool count
        writer.emit((handler_name << HANDLER_NAME_SHIFT) | HANDLER_EXTERNAL_BIT);
        writer.emit(0); // argument count
        writer.emit(binding);
        writer.emit(2); // class pool count
        for name in [a, b] {
            writer.emit(0); // superclasses
            writer.emit(0); // fields
            writer.emit(1); // one named handler
            writer.emit(0); // no inner classes
            writer.emit(name << CLASS_NAME_SHIFT);
            writer.emit(0); // no default
            writer.emit(1); // handler reference, 1-based
        }
        assert!(matches!(
            read_program(writer.words()),
            Err(LoadError::Wiring {
                source: ProgramError::HandlerRebound { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_orphan_handler_rejected_on_load() {
        let mut strings = StringPool::new();
        let handler_name = strings.intern("go:0");
        let binding = strings.intern("host_go");
        let a = strings.intern("A");

        let mut writer = WordWriter::new();
        IntegerPool::new().encode(&mut writer);
        strings.encode(&mut writer);
        writer.emit(1); // handler pool count
        writer.emit((handler_name << HANDLER_NAME_SHIFT) | HANDLER_EXTERNAL_BIT);
        writer.emit(0);
        writer.emit(binding);
        writer.emit(1); // class pool count
        writer.emit(0); // superclasses
        writer.emit(0); // fields
        writer.emit(0); // no named handlers
        writer.emit(0); // no inner
        writer.emit(a << CLASS_NAME_SHIFT);
        writer.emit(0); // no default
        assert!(matches!(
            read_program(writer.words()),
            Err(LoadError::OrphanHandler { index: 0 })
        ));
    }

    /// A hostile field count must fail cleanly before any per-field
    /// allocation happens.
    #[test]
    fn test_huge_field_count_rejected_on_load() {
        let mut strings = StringPool::new();
        let a = strings.intern("A");

        let mut writer = WordWriter::new();
        IntegerPool::new().encode(&mut writer);
        strings.encode(&mut writer);
        writer.emit(0); // handler pool count
        writer.emit(1); // class pool count
        writer.emit(0); // superclasses
        writer.emit(0xFFFF_FFFF); // fields
        writer.emit(0); // named handlers
        writer.emit(0); // inner
        writer.emit(a << CLASS_NAME_SHIFT);
        writer.emit(0); // no default
        assert!(matches!(
            read_program(writer.words()),
            Err(LoadError::CountOverflow {
                what: "field count",
                count: 0xFFFF_FFFF,
                ..
            })
        ));
    }

    /// Hostile argument and local counts in a handler entry must fail
    /// cleanly before slot names are synthesized.
    #[test]
    fn test_huge_slot_counts_rejected_on_load() {
        let mut strings = StringPool::new();
        let name = strings.intern("go:0");

        let build = |argument_count: u32, local_count: u32| {
            let mut writer = WordWriter::new();
            IntegerPool::new().encode(&mut writer);
            strings.encode(&mut writer);
            writer.emit(1); // handler pool count
            writer.emit(name << HANDLER_NAME_SHIFT); // vmil, public
            writer.emit(argument_count);
            writer.emit(local_count);
            writer.into_words()
        };

        assert!(matches!(
            read_program(&build(0xFFFF_FFFF, 0)),
            Err(LoadError::CountOverflow {
                what: "argument count",
                ..
            })
        ));
        assert!(matches!(
            read_program(&build(0, 0xFFFF_FFFF)),
            Err(LoadError::CountOverflow {
                what: "local count",
                ..
            })
        ));
    }

    /// Pin the class entry layout: counts first, then the header word,
    /// then the reference lists.
    #[test]
    fn test_class_entry_word_order() {
        let mut program = Program::new();
        let a = program.add_class(Class::new(
            "A",
            Visibility::Public,
            vec![],
            vec!["f".into()],
        ));
        let h = program.add_handler(MessageHandler::external(
            Visibility::Public,
            "go:0",
            0,
            "host_go",
        ));
        program.attach_handler(a, h).unwrap();
        program.add_root(a).unwrap();
        let words = write_program(&program).unwrap();

        let mut reader = WordReader::new(&words);
        IntegerPool::decode(&mut reader).unwrap();
        let strings = StringPool::decode(&mut reader).unwrap();
        assert_eq!(reader.read().unwrap(), 1); // handler pool count
        let handler_header = reader.read().unwrap();
        assert_ne!(handler_header & HANDLER_EXTERNAL_BIT, 0);
        reader.read().unwrap(); // argument count
        reader.read().unwrap(); // binding

        assert_eq!(reader.read().unwrap(), 1); // class pool count
        assert_eq!(reader.read().unwrap(), 0); // superclass count
        assert_eq!(reader.read().unwrap(), 1); // field count
        assert_eq!(reader.read().unwrap(), 1); // handler count
        assert_eq!(reader.read().unwrap(), 0); // inner count
        let class_header = reader.read().unwrap();
        assert_eq!(strings.get(class_header >> CLASS_NAME_SHIFT), Some("A"));
        assert_eq!(
            class_header & CLASS_VISIBILITY_MASK,
            u32::from(Visibility::Public.bits())
        );
        assert_eq!(reader.read().unwrap(), 0); // no default handler
        assert_eq!(reader.read().unwrap(), 1); // handler reference, 1-based
        assert!(reader.at_end());
    }

    #[test]
    fn test_class_visibility_none_round_trips() {
        let mut program = Program::new();
        let a = program.add_class(Class::new("Hidden", Visibility::None, vec![], vec![]));
        program.add_root(a).unwrap();

        let words = write_program(&program).unwrap();
        let loaded = read_program(&words).unwrap();
        let hidden = loaded.root_named("Hidden").unwrap();
        assert_eq!(loaded.class(hidden).visibility, Visibility::None);
    }
}
