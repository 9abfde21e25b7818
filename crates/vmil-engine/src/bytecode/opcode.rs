//! VMIL wire opcodes
//!
//! Instructions encode as one 32-bit word: the opcode in the 5 high bits,
//! a 27-bit operand in the low bits. `PushIntExt` is the only opcode followed
//! by an extension word.

/// Number of high bits holding the opcode.
pub const OPCODE_BITS: u32 = 5;
/// Number of low bits holding the operand.
pub const OPERAND_BITS: u32 = 32 - OPCODE_BITS;
/// Mask selecting the operand.
pub const OPERAND_MASK: u32 = (1 << OPERAND_BITS) - 1;
/// Bit within the operand marking a backward branch.
pub const BRANCH_BACKWARD_BIT: u32 = 1 << (OPERAND_BITS - 1);
/// Largest branch distance / inline integer magnitude (26 bits).
pub const MAX_BRANCH_DISTANCE: u32 = BRANCH_BACKWARD_BIT - 1;

/// Wire opcode enumeration
///
/// Operand shapes:
/// - 0x00-0x08: literals and stack (inline value, pool index, or none)
/// - 0x09-0x0C: field and slot access (name/slot index)
/// - 0x0D-0x10: sends, instantiation, returns (string pool index or none)
/// - 0x11-0x15: control flow (relative distance)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// No operation
    Nop = 0x00,
    /// Push a small integer: operand = sign bit | 26-bit magnitude
    PushSmallInt = 0x01,
    /// Push a wide integer: operand = sign bit, magnitude in the next word
    PushIntExt = 0x02,
    /// Push an integer from the integer pool (operand: pool index)
    PushIntPool = 0x03,
    /// Push a string from the string pool (operand: pool index)
    PushString = 0x04,
    /// Push the receiver
    PushSelf = 0x05,
    /// Push the null reference
    PushNull = 0x06,
    /// Pop the top of stack
    Pop = 0x07,
    /// Duplicate the top of stack
    Dup = 0x08,
    /// Load a field of the receiver (operand: field index in the owning class)
    LoadField = 0x09,
    /// Store the top of stack into a field (operand: field index)
    StoreField = 0x0A,
    /// Load an argument or local (operand: slot index, arguments first)
    LoadSlot = 0x0B,
    /// Store into an argument or local (operand: slot index)
    StoreSlot = 0x0C,
    /// Send a message to the receiver on the stack (operand: name pool index)
    Send = 0x0D,
    /// Instantiate a class (operand: class name pool index)
    NewInstance = 0x0E,
    /// Return the top of stack
    Return = 0x0F,
    /// Raise the top of stack as an exception
    Throw = 0x10,
    /// Unconditional branch (operand: direction bit | distance)
    Jump = 0x11,
    /// Branch when the popped value is false (operand: direction bit | distance)
    JumpIfFalse = 0x12,
    /// Open an exception region (operand: forward distance to the matching Catch)
    Try = 0x13,
    /// Start the handler of the innermost Try (operand: forward distance to EndTryCatch)
    Catch = 0x14,
    /// Close the innermost exception region
    EndTryCatch = 0x15,
}

impl Opcode {
    /// Decode an opcode from its 5-bit pattern.
    pub fn from_bits(bits: u8) -> Option<Opcode> {
        Some(match bits {
            0x00 => Opcode::Nop,
            0x01 => Opcode::PushSmallInt,
            0x02 => Opcode::PushIntExt,
            0x03 => Opcode::PushIntPool,
            0x04 => Opcode::PushString,
            0x05 => Opcode::PushSelf,
            0x06 => Opcode::PushNull,
            0x07 => Opcode::Pop,
            0x08 => Opcode::Dup,
            0x09 => Opcode::LoadField,
            0x0A => Opcode::StoreField,
            0x0B => Opcode::LoadSlot,
            0x0C => Opcode::StoreSlot,
            0x0D => Opcode::Send,
            0x0E => Opcode::NewInstance,
            0x0F => Opcode::Return,
            0x10 => Opcode::Throw,
            0x11 => Opcode::Jump,
            0x12 => Opcode::JumpIfFalse,
            0x13 => Opcode::Try,
            0x14 => Opcode::Catch,
            0x15 => Opcode::EndTryCatch,
            _ => return None,
        })
    }

    /// Pack this opcode with a 27-bit operand into one word.
    #[inline]
    pub fn pack(self, operand: u32) -> u32 {
        debug_assert!(operand <= OPERAND_MASK);
        ((self as u32) << OPERAND_BITS) | (operand & OPERAND_MASK)
    }

    /// Split a word into opcode bits and operand.
    #[inline]
    pub fn unpack(word: u32) -> (u8, u32) {
        ((word >> OPERAND_BITS) as u8, word & OPERAND_MASK)
    }

    /// Whether an extension word follows this instruction word.
    #[inline]
    pub fn has_extension_word(self) -> bool {
        self == Opcode::PushIntExt
    }
}
