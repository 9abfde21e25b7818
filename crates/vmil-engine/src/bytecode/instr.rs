//! Logical instruction model
//!
//! The in-memory form is symbolic: fields, slots, and branch targets are
//! named, and a [`Instruction::Label`] is a zero-width marker that exists
//! only until encoding resolves branches to relative distances. The codec in
//! [`image`](super::image) maps this form onto wire words and back.

use std::fmt;

/// One VMIL instruction in symbolic form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Zero-width branch target marker; never serialized.
    Label(String),
    /// No operation
    Nop,
    /// Push an integer literal
    PushInt(i32),
    /// Push a string literal
    PushString(String),
    /// Push the receiver
    PushSelf,
    /// Push the null reference
    PushNull,
    /// Pop the top of stack
    Pop,
    /// Duplicate the top of stack
    Dup,
    /// Load a field of the receiver by declared name
    LoadField(String),
    /// Store the top of stack into a field
    StoreField(String),
    /// Load an argument or local by name
    LoadSlot(String),
    /// Store the top of stack into an argument or local
    StoreSlot(String),
    /// Send a message to the receiver on the stack
    Send(String),
    /// Instantiate a class by name
    NewInstance(String),
    /// Return the top of stack
    Return,
    /// Raise the top of stack as an exception
    Throw,
    /// Unconditional branch to a label
    Jump(String),
    /// Branch to a label when the popped value is false
    JumpIfFalse(String),
    /// Open an exception region
    Try,
    /// Start the handler of the innermost open region
    Catch,
    /// Close the innermost exception region
    EndTryCatch,
}

impl Instruction {
    /// Whether this is a zero-width label marker.
    #[inline]
    pub fn is_label(&self) -> bool {
        matches!(self, Instruction::Label(_))
    }

    /// The branch target name, for `Jump`/`JumpIfFalse`.
    pub fn branch_target(&self) -> Option<&str> {
        match self {
            Instruction::Jump(target) | Instruction::JumpIfFalse(target) => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Label(name) => write!(f, "{name}:"),
            Instruction::Nop => write!(f, "nop"),
            Instruction::PushInt(value) => write!(f, "push-int {value}"),
            Instruction::PushString(value) => write!(f, "push-string {value:?}"),
            Instruction::PushSelf => write!(f, "push-self"),
            Instruction::PushNull => write!(f, "push-null"),
            Instruction::Pop => write!(f, "pop"),
            Instruction::Dup => write!(f, "dup"),
            Instruction::LoadField(name) => write!(f, "load-field {name}"),
            Instruction::StoreField(name) => write!(f, "store-field {name}"),
            Instruction::LoadSlot(name) => write!(f, "load-slot {name}"),
            Instruction::StoreSlot(name) => write!(f, "store-slot {name}"),
            Instruction::Send(name) => write!(f, "send {name}"),
            Instruction::NewInstance(name) => write!(f, "new {name}"),
            Instruction::Return => write!(f, "return"),
            Instruction::Throw => write!(f, "throw"),
            Instruction::Jump(target) => write!(f, "jump {target}"),
            Instruction::JumpIfFalse(target) => write!(f, "jump-if-false {target}"),
            Instruction::Try => write!(f, "try"),
            Instruction::Catch => write!(f, "catch"),
            Instruction::EndTryCatch => write!(f, "end-try-catch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_zero_width_marker() {
        assert!(Instruction::Label("loop".into()).is_label());
        assert!(!Instruction::Jump("loop".into()).is_label());
    }

    #[test]
    fn test_branch_target() {
        assert_eq!(
            Instruction::JumpIfFalse("out".into()).branch_target(),
            Some("out")
        );
        assert_eq!(Instruction::Try.branch_target(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Instruction::PushInt(-3).to_string(), "push-int -3");
        assert_eq!(Instruction::Label("L0".into()).to_string(), "L0:");
        assert_eq!(Instruction::Send("foo:1".into()).to_string(), "send foo:1");
    }
}
