//! Opcode definitions.
//!
//! Each instruction is a 1-byte opcode followed by fixed-length operands:
//! `u8` for small flag/count bytes, `u16` (little-endian) for indices and
//! jump offsets. `CALL_NAMED`, `TUPLE`, `ENUM_CASE`, and `CLOSURE` carry
//! variable-length operand tails whose lengths are given by a leading count.

use strum::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Stack
    Nil,
    True,
    False,
    /// `u16` constant-pool index.
    Constant,
    /// `u16` string-pool index; pushes a fresh String object.
    String,
    Pop,
    Dup,
    /// Replace TOS with a value-semantic copy when it is a struct instance
    /// or tuple; other values pass through.
    CopyValue,

    // Arithmetic / logic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,
    Not,
    And,
    Or,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    LeftShift,
    RightShift,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,

    // Variables
    /// `u16` frame slot.
    GetLocal,
    SetLocal,
    /// `u16` string index of the global's name.
    GetGlobal,
    SetGlobal,
    DefineGlobal,
    /// `u16` upvalue index.
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,

    // Control flow
    /// `u16` forward offset.
    Jump,
    /// `u16` forward offset; pops the tested value.
    JumpIfFalse,
    /// `u16` forward offset; pops the tested value only on the nil branch,
    /// leaving the unwrapped value on the non-nil path.
    JumpIfNil,
    /// `u16` backward offset.
    Loop,
    Return,
    Halt,

    // Calls
    /// `u8` argument count.
    Call,
    /// `u8` argument count, then one `u16` label string index per argument
    /// (`0xFFFF` marks a positional argument).
    CallNamed,

    // Collections and tuples
    RangeInclusive,
    RangeExclusive,
    /// `u16` element count.
    Array,
    /// `u16` entry count.
    Dict,
    /// `u16` element count, then one `u16` label string index per element.
    Tuple,
    GetSubscript,
    SetSubscript,
    /// `u16` element index.
    GetTupleIndex,
    /// `u16` label string index.
    GetTupleLabel,

    // Optionals
    Unwrap,
    /// `u16` property-name string index.
    OptionalChain,
    NilCoalesce,

    // OOP
    /// `u16` name string index.
    Class,
    Inherit,
    Struct,
    Enum,
    /// `u16` case-name string index, `u8` associated count, then one `u16`
    /// label string index per associated value (`0xFFFF` for `_`).
    EnumCase,
    /// `u16` protocol-table index.
    Protocol,
    /// `u16` function-prototype index.
    Function,
    /// `u16` function-prototype index, then per upvalue: `u8 is_local`,
    /// `u16 index`.
    Closure,
    /// `u16` method-name string index, `u8` is_static.
    Method,
    /// `u16` method-name string index, `u8` is_mutating.
    StructMethod,
    /// `u16` name string index, `u8` flags (bit0 let, bit1 static, bit2
    /// lazy, bit3 weak, bit4 unowned).
    DefineProperty,
    /// As `DefineProperty`, then `u16 willSet` fn index, `u16 didSet` fn
    /// index (`0xFFFF` = none).
    DefinePropertyWithObservers,
    /// `u16` name string index, `u16` getter fn index, `u16` setter fn
    /// index (`0xFFFF` = none).
    DefineComputedProperty,
    /// `u16` property-name string index.
    GetProperty,
    SetProperty,
    /// `u16` method-name string index.
    Super,

    // Enum matching and type operations
    /// `u16` case-name string index; pops the tested value, pushes Bool.
    MatchEnumCase,
    /// `u16` associated-value index; pops an enum case, pushes the value.
    GetAssociated,
    /// `u16` type-name string index.
    TypeCast,
    TypeCastOptional,
    TypeCastForced,
    TypeCheck,

    // IO
    Print,
    ReadLine,
    Throw,
}

impl Opcode {
    /// Fixed stack effect (pushes − pops) for opcodes where it does not
    /// depend on operands. `None` means the builder computes it from the
    /// operand (calls, collection builders) or control flow makes it
    /// path-dependent.
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        match self {
            Self::Nil
            | Self::True
            | Self::False
            | Self::Constant
            | Self::String
            | Self::Dup
            | Self::GetLocal
            | Self::GetGlobal
            | Self::GetUpvalue
            | Self::Function
            | Self::Closure
            | Self::Class
            | Self::Struct
            | Self::Enum
            | Self::Protocol
            | Self::ReadLine => Some(1),
            Self::Pop
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Modulo
            | Self::And
            | Self::Or
            | Self::BitwiseAnd
            | Self::BitwiseOr
            | Self::BitwiseXor
            | Self::LeftShift
            | Self::RightShift
            | Self::Equal
            | Self::NotEqual
            | Self::Less
            | Self::Greater
            | Self::LessEqual
            | Self::GreaterEqual
            | Self::DefineGlobal
            | Self::JumpIfFalse
            | Self::RangeInclusive
            | Self::RangeExclusive
            | Self::NilCoalesce
            | Self::Inherit
            | Self::Method
            | Self::StructMethod
            | Self::DefineProperty
            | Self::DefinePropertyWithObservers
            | Self::GetSubscript
            | Self::EnumCase
            | Self::CloseUpvalue
            | Self::Print
            | Self::Throw
            | Self::Return => Some(-1),
            Self::SetSubscript => Some(-2),
            Self::CopyValue
            | Self::Negate
            | Self::Not
            | Self::BitwiseNot
            | Self::SetLocal
            | Self::SetGlobal
            | Self::SetUpvalue
            | Self::Jump
            | Self::Loop
            | Self::Halt
            | Self::Unwrap
            | Self::OptionalChain
            | Self::GetTupleIndex
            | Self::GetTupleLabel
            | Self::DefineComputedProperty
            | Self::GetProperty
            | Self::Super
            | Self::GetAssociated
            | Self::MatchEnumCase
            | Self::TypeCast
            | Self::TypeCastOptional
            | Self::TypeCastForced
            | Self::TypeCheck => Some(0),
            Self::SetProperty => Some(-1),
            Self::JumpIfNil | Self::Call | Self::CallNamed | Self::Array | Self::Dict | Self::Tuple => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_through_repr() {
        let op = Opcode::GetProperty;
        let byte = op as u8;
        assert_eq!(Opcode::from_repr(byte), Some(op));
    }

    #[test]
    fn invalid_byte_is_rejected() {
        assert_eq!(Opcode::from_repr(0xFE), None);
    }
}
