//! Instruction stream codec
//!
//! Maps the symbolic instruction list onto wire words and back. Labels are
//! resolved to relative branch distances on encode and re-synthesized on
//! decode; try/catch distances are computed by a one-pass stack walk before
//! encoding and re-verified structurally after decoding. The decoder
//! range-checks every index and offset before use and rejects any stream in
//! which a jump escapes its innermost enclosing try/catch region.

use super::encoder::{WordReader, WordWriter};
use super::image::{EncodeError, LoadError};
use super::instr::Instruction;
use super::opcode::{Opcode, BRANCH_BACKWARD_BIT, MAX_BRANCH_DISTANCE, OPERAND_MASK};
use super::pools::{IntegerPool, StringPool};
use crate::heap::Word;
use rustc_hash::FxHashMap;

/// Encoded body words plus the real (label-free) instruction count.
#[derive(Debug)]
pub struct EncodedBody {
    /// Wire words, extension words included.
    pub words: Vec<Word>,
    /// Number of instructions (labels excluded, extension words not counted).
    pub instruction_count: usize,
}

/// A field operand observed while decoding, checked against the owning
/// class's field count once the owner is known.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef {
    /// Declared-field index within the owning class's block.
    pub index: u32,
    /// Stream word position of the instruction, for error reporting.
    pub position: usize,
}

/// Decoded symbolic instructions plus deferred field checks.
#[derive(Debug)]
pub struct DecodedBody {
    /// Symbolic instruction list with synthesized labels.
    pub instructions: Vec<Instruction>,
    /// Field operands awaiting the owner's field count.
    pub field_refs: Vec<FieldRef>,
}

// ============================================================================
// Try/catch structure
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcKind {
    Try,
    Catch,
    End,
    Other,
}

#[derive(Debug, Default)]
struct Regions {
    try_to_catch: FxHashMap<usize, usize>,
    catch_to_end: FxHashMap<usize, usize>,
    /// `(try, end)` index pairs, inclusive.
    spans: Vec<(usize, usize)>,
}

/// One-pass stack walk: every Catch/EndTryCatch closes the innermost
/// unmatched construct. Returns the offending instruction index on
/// imbalance.
fn match_regions(kinds: &[TcKind]) -> Result<Regions, usize> {
    enum Open {
        AwaitingCatch(usize),
        AwaitingEnd { try_index: usize, catch_index: usize },
    }

    let mut regions = Regions::default();
    let mut stack: Vec<Open> = Vec::new();
    for (index, &kind) in kinds.iter().enumerate() {
        match kind {
            TcKind::Try => stack.push(Open::AwaitingCatch(index)),
            TcKind::Catch => match stack.pop() {
                Some(Open::AwaitingCatch(try_index)) => {
                    regions.try_to_catch.insert(try_index, index);
                    stack.push(Open::AwaitingEnd {
                        try_index,
                        catch_index: index,
                    });
                }
                _ => return Err(index),
            },
            TcKind::End => match stack.pop() {
                Some(Open::AwaitingEnd {
                    try_index,
                    catch_index,
                }) => {
                    regions.catch_to_end.insert(catch_index, index);
                    regions.spans.push((try_index, index));
                }
                _ => return Err(index),
            },
            TcKind::Other => {}
        }
    }
    if let Some(open) = stack.last() {
        let index = match open {
            Open::AwaitingCatch(i) => *i,
            Open::AwaitingEnd { try_index, .. } => *try_index,
        };
        return Err(index);
    }
    Ok(regions)
}

impl Regions {
    /// Innermost span containing `index`, if any.
    fn innermost(&self, index: usize) -> Option<(usize, usize)> {
        self.spans
            .iter()
            .filter(|(start, end)| *start <= index && index <= *end)
            .max_by_key(|(start, _)| *start)
            .copied()
    }
}

fn tc_kind_of_instruction(instruction: &Instruction) -> TcKind {
    match instruction {
        Instruction::Try => TcKind::Try,
        Instruction::Catch => TcKind::Catch,
        Instruction::EndTryCatch => TcKind::End,
        _ => TcKind::Other,
    }
}

fn tc_kind_of_opcode(opcode: Opcode) -> TcKind {
    match opcode {
        Opcode::Try => TcKind::Try,
        Opcode::Catch => TcKind::Catch,
        Opcode::EndTryCatch => TcKind::End,
        _ => TcKind::Other,
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a handler body into wire words.
///
/// `owner_fields` are the owning class's declared field names; `class_name`
/// only annotates errors.
pub fn encode_body(
    instructions: &[Instruction],
    argument_names: &[String],
    local_names: &[String],
    owner_fields: &[String],
    class_name: &str,
    integers: &mut IntegerPool,
    strings: &mut StringPool,
) -> Result<EncodedBody, EncodeError> {
    // Pass 1: label positions in real-instruction indices.
    let mut labels: FxHashMap<&str, usize> = FxHashMap::default();
    let mut position = 0usize;
    for instruction in instructions {
        match instruction {
            Instruction::Label(name) => {
                if labels.insert(name.as_str(), position).is_some() {
                    return Err(EncodeError::DuplicateLabel {
                        label: name.clone(),
                    });
                }
            }
            _ => position += 1,
        }
    }
    let instruction_count = position;

    // Pass 2: try/catch matching over real instructions.
    let kinds: Vec<TcKind> = instructions
        .iter()
        .filter(|i| !i.is_label())
        .map(tc_kind_of_instruction)
        .collect();
    let regions = match_regions(&kinds).map_err(|index| EncodeError::UnbalancedTryCatch {
        instruction: index,
    })?;

    // Pass 3: emit.
    let mut writer = WordWriter::new();
    let mut position = 0usize;
    for instruction in instructions {
        match instruction {
            Instruction::Label(_) => continue,
            Instruction::Nop => writer.emit(Opcode::Nop.pack(0)),
            Instruction::PushInt(value) => {
                let magnitude = value.unsigned_abs();
                if magnitude <= MAX_BRANCH_DISTANCE {
                    let sign = if *value < 0 { BRANCH_BACKWARD_BIT } else { 0 };
                    writer.emit(Opcode::PushSmallInt.pack(sign | magnitude));
                } else {
                    let index = pool_index(integers.intern(*value))?;
                    writer.emit(Opcode::PushIntPool.pack(index));
                }
            }
            Instruction::PushString(value) => {
                writer.emit(Opcode::PushString.pack(pool_index(strings.intern(value))?))
            }
            Instruction::PushSelf => writer.emit(Opcode::PushSelf.pack(0)),
            Instruction::PushNull => writer.emit(Opcode::PushNull.pack(0)),
            Instruction::Pop => writer.emit(Opcode::Pop.pack(0)),
            Instruction::Dup => writer.emit(Opcode::Dup.pack(0)),
            Instruction::LoadField(name) | Instruction::StoreField(name) => {
                let index = owner_fields
                    .iter()
                    .position(|f| f == name)
                    .ok_or_else(|| EncodeError::UnknownField {
                        class: class_name.to_string(),
                        name: name.clone(),
                    })? as u32;
                let opcode = if matches!(instruction, Instruction::LoadField(_)) {
                    Opcode::LoadField
                } else {
                    Opcode::StoreField
                };
                writer.emit(opcode.pack(index));
            }
            Instruction::LoadSlot(name) | Instruction::StoreSlot(name) => {
                let index = slot_index(name, argument_names, local_names)?;
                let opcode = if matches!(instruction, Instruction::LoadSlot(_)) {
                    Opcode::LoadSlot
                } else {
                    Opcode::StoreSlot
                };
                writer.emit(opcode.pack(index));
            }
            Instruction::Send(name) => {
                writer.emit(Opcode::Send.pack(pool_index(strings.intern(name))?))
            }
            Instruction::NewInstance(name) => {
                writer.emit(Opcode::NewInstance.pack(pool_index(strings.intern(name))?))
            }
            Instruction::Return => writer.emit(Opcode::Return.pack(0)),
            Instruction::Throw => writer.emit(Opcode::Throw.pack(0)),
            Instruction::Jump(target) | Instruction::JumpIfFalse(target) => {
                let target_position =
                    *labels
                        .get(target.as_str())
                        .ok_or_else(|| EncodeError::UnknownLabel {
                            label: target.clone(),
                        })?;
                let operand = branch_operand(position, target_position)?;
                let opcode = if matches!(instruction, Instruction::Jump(_)) {
                    Opcode::Jump
                } else {
                    Opcode::JumpIfFalse
                };
                writer.emit(opcode.pack(operand));
            }
            Instruction::Try => {
                let catch_position = regions.try_to_catch[&position];
                writer.emit(Opcode::Try.pack(forward_distance(position, catch_position)?));
            }
            Instruction::Catch => {
                let end_position = regions.catch_to_end[&position];
                writer.emit(Opcode::Catch.pack(forward_distance(position, end_position)?));
            }
            Instruction::EndTryCatch => writer.emit(Opcode::EndTryCatch.pack(0)),
        }
        position += 1;
    }

    Ok(EncodedBody {
        words: writer.into_words(),
        instruction_count,
    })
}

fn pool_index(index: u32) -> Result<u32, EncodeError> {
    if index > OPERAND_MASK {
        return Err(EncodeError::PoolIndexTooLarge {
            index: index as usize,
        });
    }
    Ok(index)
}

fn slot_index(
    name: &str,
    argument_names: &[String],
    local_names: &[String],
) -> Result<u32, EncodeError> {
    if let Some(index) = argument_names.iter().position(|n| n == name) {
        return Ok(index as u32);
    }
    if let Some(index) = local_names.iter().position(|n| n == name) {
        return Ok((argument_names.len() + index) as u32);
    }
    Err(EncodeError::UnknownSlot {
        name: name.to_string(),
    })
}

/// Relative distance between instruction indices, with a reserved bit
/// marking backward direction.
fn branch_operand(position: usize, target: usize) -> Result<u32, EncodeError> {
    let (distance, backward) = if target >= position {
        (target - position, false)
    } else {
        (position - target, true)
    };
    if distance > MAX_BRANCH_DISTANCE as usize {
        return Err(EncodeError::BranchTooFar { distance });
    }
    let mut operand = distance as u32;
    if backward {
        operand |= BRANCH_BACKWARD_BIT;
    }
    Ok(operand)
}

/// Unsigned forward distance for Try/Catch operands.
fn forward_distance(position: usize, target: usize) -> Result<u32, EncodeError> {
    let distance = target - position;
    if distance > OPERAND_MASK as usize {
        return Err(EncodeError::BranchTooFar { distance });
    }
    Ok(distance as u32)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decoded wire instruction, pre-symbolization.
#[derive(Debug, Clone)]
struct RawInstruction {
    opcode: Opcode,
    operand: u32,
    extension: Option<Word>,
    /// Stream word position of the instruction word.
    stream_position: usize,
}

/// Decode `instruction_count` instructions from the stream.
///
/// Branch targets become synthesized labels (`L0`, `L1`, …) in positional
/// order; argument and local operands become `arg{i}` / `loc{i}` names using
/// the counts as the split point.
pub fn decode_body(
    reader: &mut WordReader<'_>,
    instruction_count: usize,
    argument_count: u32,
    local_count: u32,
    integers: &IntegerPool,
    strings: &StringPool,
) -> Result<DecodedBody, LoadError> {
    // Read the raw words first; extension words ride along uncounted.
    let mut raw = Vec::with_capacity(instruction_count.min(reader.remaining()));
    for _ in 0..instruction_count {
        let stream_position = reader.position();
        let word = reader.read()?;
        let (bits, operand) = Opcode::unpack(word);
        let opcode = Opcode::from_bits(bits).ok_or(LoadError::BadOpcode {
            bits,
            position: stream_position,
        })?;
        let extension = if opcode.has_extension_word() {
            Some(reader.read()?)
        } else {
            None
        };
        raw.push(RawInstruction {
            opcode,
            operand,
            extension,
            stream_position,
        });
    }

    // Structural try/catch verification.
    let kinds: Vec<TcKind> = raw.iter().map(|r| tc_kind_of_opcode(r.opcode)).collect();
    let regions =
        match_regions(&kinds).map_err(|index| LoadError::UnbalancedTryCatch { instruction: index })?;

    // The encoded Try/Catch distances must agree with the structural
    // matching; disagreement means a corrupt or hand-tampered stream.
    for (index, instruction) in raw.iter().enumerate() {
        match instruction.opcode {
            Opcode::Try => {
                let expected = regions.try_to_catch[&index] - index;
                if instruction.operand as usize != expected {
                    return Err(LoadError::TryCatchMismatch { instruction: index });
                }
            }
            Opcode::Catch => {
                let expected = regions.catch_to_end[&index] - index;
                if instruction.operand as usize != expected {
                    return Err(LoadError::TryCatchMismatch { instruction: index });
                }
            }
            _ => {}
        }
    }

    // Resolve branch targets, bounds- and region-checked.
    let mut targets: Vec<usize> = Vec::new();
    for (index, instruction) in raw.iter().enumerate() {
        if !matches!(instruction.opcode, Opcode::Jump | Opcode::JumpIfFalse) {
            continue;
        }
        let distance = (instruction.operand & MAX_BRANCH_DISTANCE) as usize;
        let backward = instruction.operand & BRANCH_BACKWARD_BIT != 0;
        let target = if backward {
            index
                .checked_sub(distance)
                .ok_or(LoadError::BranchOutOfBounds {
                    instruction: index,
                    target: index as i64 - distance as i64,
                })?
        } else {
            let target = index + distance;
            if target > instruction_count {
                return Err(LoadError::BranchOutOfBounds {
                    instruction: index,
                    target: target as i64,
                });
            }
            target
        };
        if let Some((start, end)) = regions.innermost(index) {
            if target < start || target > end {
                return Err(LoadError::JumpEscapesRegion {
                    instruction: index,
                    target,
                });
            }
        }
        targets.push(target);
    }
    targets.sort_unstable();
    targets.dedup();
    let label_names: FxHashMap<usize, String> = targets
        .iter()
        .enumerate()
        .map(|(ordinal, &target)| (target, format!("L{ordinal}")))
        .collect();

    // Symbolize.
    let mut instructions = Vec::with_capacity(raw.len() + targets.len());
    let mut field_refs = Vec::new();
    for (index, instruction) in raw.iter().enumerate() {
        if let Some(name) = label_names.get(&index) {
            instructions.push(Instruction::Label(name.clone()));
        }
        let position = instruction.stream_position;
        let operand = instruction.operand;
        let symbolic = match instruction.opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::PushSmallInt => {
                let magnitude = (operand & MAX_BRANCH_DISTANCE) as i32;
                if operand & BRANCH_BACKWARD_BIT != 0 {
                    Instruction::PushInt(-magnitude)
                } else {
                    Instruction::PushInt(magnitude)
                }
            }
            Opcode::PushIntExt => {
                // The extension word was read alongside the opcode word.
                let magnitude = instruction.extension.unwrap_or(0) as u64;
                let negative = operand & BRANCH_BACKWARD_BIT != 0;
                let value = if negative {
                    -(magnitude as i64)
                } else {
                    magnitude as i64
                };
                if value < i32::MIN as i64 || value > i32::MAX as i64 {
                    return Err(LoadError::IntegerOutOfRange { position });
                }
                Instruction::PushInt(value as i32)
            }
            Opcode::PushIntPool => {
                let value = integers.get(operand).ok_or(LoadError::IndexOutOfRange {
                    what: "integer pool",
                    index: operand as usize,
                    limit: integers.len(),
                    position,
                })?;
                Instruction::PushInt(value)
            }
            Opcode::PushString => Instruction::PushString(pooled_string(strings, operand, position)?),
            Opcode::PushSelf => Instruction::PushSelf,
            Opcode::PushNull => Instruction::PushNull,
            Opcode::Pop => Instruction::Pop,
            Opcode::Dup => Instruction::Dup,
            Opcode::LoadField | Opcode::StoreField => {
                field_refs.push(FieldRef {
                    index: operand,
                    position,
                });
                let name = format!("field{operand}");
                if instruction.opcode == Opcode::LoadField {
                    Instruction::LoadField(name)
                } else {
                    Instruction::StoreField(name)
                }
            }
            Opcode::LoadSlot | Opcode::StoreSlot => {
                let name = slot_name(operand, argument_count, local_count, position)?;
                if instruction.opcode == Opcode::LoadSlot {
                    Instruction::LoadSlot(name)
                } else {
                    Instruction::StoreSlot(name)
                }
            }
            Opcode::Send => Instruction::Send(pooled_string(strings, operand, position)?),
            Opcode::NewInstance => {
                Instruction::NewInstance(pooled_string(strings, operand, position)?)
            }
            Opcode::Return => Instruction::Return,
            Opcode::Throw => Instruction::Throw,
            Opcode::Jump | Opcode::JumpIfFalse => {
                let distance = (operand & MAX_BRANCH_DISTANCE) as usize;
                let target = if operand & BRANCH_BACKWARD_BIT != 0 {
                    index - distance
                } else {
                    index + distance
                };
                let label = label_names[&target].clone();
                if instruction.opcode == Opcode::Jump {
                    Instruction::Jump(label)
                } else {
                    Instruction::JumpIfFalse(label)
                }
            }
            Opcode::Try => Instruction::Try,
            Opcode::Catch => Instruction::Catch,
            Opcode::EndTryCatch => Instruction::EndTryCatch,
        };
        instructions.push(symbolic);
    }
    // A branch may land one past the final instruction.
    if let Some(name) = label_names.get(&raw.len()) {
        instructions.push(Instruction::Label(name.clone()));
    }

    Ok(DecodedBody {
        instructions,
        field_refs,
    })
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

fn slot_name(
    index: u32,
    argument_count: u32,
    local_count: u32,
    position: usize,
) -> Result<String, LoadError> {
    if index < argument_count {
        Ok(format!("arg{index}"))
    } else if index - argument_count < local_count {
        Ok(format!("loc{}", index - argument_count))
    } else {
        Err(LoadError::SlotOutOfRange {
            index,
            argument_count,
            local_count,
            position,
        })
    }
}
