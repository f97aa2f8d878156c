//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the light machine's instruction set. The
//! [`for_each_op!`](crate::for_each_op) macro holds the canonical instruction
//! definitions and invokes a callback macro for code generation, so the VM
//! and the assembler share one table without duplicating it.
//!
//! This module generates:
//! - The [`Op`] enum with its fixed numeric encoding
//! - `TryFrom<ProgramWord>` for decoding opcode words
//! - Mnemonic lookup in both directions
//!
//! # Encoding
//!
//! Every instruction occupies one program word. Instructions whose operand
//! kind is `Inline` are followed by exactly one operand word; `StackArg`
//! instructions take their operand from the stack (the assembler may expand
//! `MNEMONIC x` into `PUSH x` + `MNEMONIC` for those). The numeric opcode
//! values are a compatibility contract with deployed images; changing one is
//! a breaking change.

use crate::machine::errors::MachineError;
use crate::types::words::ProgramWord;

/// Invokes a callback macro with the complete instruction definition list.
///
/// Each entry is `Variant = opcode, "MNEMONIC", operand_kind`.
#[macro_export]
macro_rules! for_each_op {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Stack / data
            // =========================
            /// POP ; discard the top of the stack
            Pop = 0, "POP", None,
            /// PUSH imm ; push one program word, zero-extended
            Push = 1, "PUSH", Inline,
            // =========================
            // Control flow
            // =========================
            /// BRLT ; pop target, lhs, rhs; jump to target if lhs < rhs
            BranchLessThan = 2, "BRLT", StackArg,
            /// BRLTE ; pop target, lhs, rhs; jump to target if lhs <= rhs
            BranchLessThanEq = 3, "BRLTE", StackArg,
            /// BRGT ; pop target, lhs, rhs; jump to target if lhs > rhs
            BranchGreaterThan = 4, "BRGT", StackArg,
            /// BRGTE ; pop target, lhs, rhs; jump to target if lhs >= rhs
            BranchGreaterThanEq = 5, "BRGTE", StackArg,
            /// BREQ ; pop target, lhs, rhs; jump to target if lhs == rhs
            BranchEqual = 6, "BREQ", StackArg,
            // =========================
            // Logical (non-zeroness)
            // =========================
            /// AND ; push 1 if both operands are non-zero
            And = 7, "AND", None,
            /// OR ; push 1 if either operand is non-zero
            Or = 8, "OR", None,
            /// XOR ; push 1 if exactly one operand is non-zero
            Xor = 9, "XOR", None,
            /// NOT ; push 1 if the operand is zero
            Not = 10, "NOT", None,
            // =========================
            // Bitwise
            // =========================
            /// BAND ; bitwise and of the top two stack words
            BitwiseAnd = 11, "BAND", None,
            /// BOR ; bitwise or of the top two stack words
            BitwiseOr = 12, "BOR", None,
            /// BXOR ; bitwise xor of the top two stack words
            BitwiseXor = 13, "BXOR", None,
            /// BNOT ; bitwise complement of the top stack word
            BitwiseNot = 14, "BNOT", None,
            // =========================
            // Arithmetic (wrapping mod 2^32)
            // =========================
            /// MUL ; wrapping multiply
            Multiply = 15, "MUL", None,
            /// DIV ; divide, rhs of zero is a fault
            Divide = 16, "DIV", None,
            /// MOD ; remainder, rhs of zero is a fault
            Mod = 17, "MOD", None,
            /// ADD ; wrapping add
            Add = 18, "ADD", None,
            /// SUB ; wrapping subtract
            Subtract = 19, "SUB", None,
            // =========================
            // Memory
            // =========================
            /// LLOAD off ; push globals[mlp + off]
            LocalLoad = 20, "LLOAD", Inline,
            /// LSTORE off ; pop into globals[mlp + off]
            LocalStore = 21, "LSTORE", Inline,
            /// GLOAD addr ; push globals[addr]
            GlobalLoad = 22, "GLOAD", Inline,
            /// GSTORE addr ; pop into globals[addr]
            GlobalStore = 23, "GSTORE", Inline,
            /// LOAD_STATIC ; pop an image address, push that program word
            LoadStatic = 24, "LOAD_STATIC", StackArg,
            // =========================
            // Control transfer
            // =========================
            /// JUMP ; pop target, set pc
            Jump = 25, "JUMP", StackArg,
            /// EXIT ; end the current run, returning control to the host
            Exit = 26, "EXIT", None,
            /// CALL ; pop func_index, arg_count; call via the type function table
            Call = 27, "CALL", StackArg,
            /// CALL_SHARED ; pop func_index, arg_count; call via the shared table
            CallShared = 28, "CALL_SHARED", StackArg,
            /// SLOAD off ; push stack[fp + off]
            StackLoad = 29, "SLOAD", Inline,
            /// SSTORE off ; pop into stack[fp + off]
            StackStore = 30, "SSTORE", Inline,
            /// DUP ; duplicate the top of the stack
            Dup = 31, "DUP", None,
            /// SWAP ; exchange the top two stack words
            Swap = 32, "SWAP", None,
            /// RET count ; tear down the frame, keep the top `count` values
            Return = 33, "RET", Inline,
        }
    };
}

/// How an instruction receives its operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// No operand.
    None,
    /// One operand word follows the opcode in the image.
    Inline,
    /// The operand is popped from the stack; the assembler accepts an
    /// optional operand and expands it to a preceding `PUSH`.
    StackArg,
}

#[macro_export]
macro_rules! define_ops {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal, $operand:ident
        ),* $(,)?
    ) => {
        /// A decoded instruction.
        ///
        /// The numeric values are the on-image encoding and are stable.
        #[repr(u16)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Op {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<ProgramWord> for Op {
            type Error = MachineError;

            fn try_from(value: ProgramWord) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Op::$name), )*
                    _ => Err(MachineError::InvalidOp(value)),
                }
            }
        }

        impl From<Op> for ProgramWord {
            fn from(op: Op) -> ProgramWord {
                op as ProgramWord
            }
        }

        impl Op {
            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Op::$name => $mnemonic, )*
                }
            }

            /// Returns how this instruction receives its operand.
            pub const fn operand_kind(&self) -> OperandKind {
                match self {
                    $( Op::$name => OperandKind::$operand, )*
                }
            }

            /// Looks up an instruction by mnemonic, case-insensitively.
            pub fn from_mnemonic(token: &str) -> Option<Op> {
                $(
                    if token.eq_ignore_ascii_case($mnemonic) {
                        return Some(Op::$name);
                    }
                )*
                None
            }
        }
    };
}

for_each_op!(define_ops);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_numbers_are_stable() {
        // The numeric table is a compatibility contract.
        let expected: &[(Op, ProgramWord)] = &[
            (Op::Pop, 0),
            (Op::Push, 1),
            (Op::BranchLessThan, 2),
            (Op::BranchLessThanEq, 3),
            (Op::BranchGreaterThan, 4),
            (Op::BranchGreaterThanEq, 5),
            (Op::BranchEqual, 6),
            (Op::And, 7),
            (Op::Or, 8),
            (Op::Xor, 9),
            (Op::Not, 10),
            (Op::BitwiseAnd, 11),
            (Op::BitwiseOr, 12),
            (Op::BitwiseXor, 13),
            (Op::BitwiseNot, 14),
            (Op::Multiply, 15),
            (Op::Divide, 16),
            (Op::Mod, 17),
            (Op::Add, 18),
            (Op::Subtract, 19),
            (Op::LocalLoad, 20),
            (Op::LocalStore, 21),
            (Op::GlobalLoad, 22),
            (Op::GlobalStore, 23),
            (Op::LoadStatic, 24),
            (Op::Jump, 25),
            (Op::Exit, 26),
            (Op::Call, 27),
            (Op::CallShared, 28),
            (Op::StackLoad, 29),
            (Op::StackStore, 30),
            (Op::Dup, 31),
            (Op::Swap, 32),
            (Op::Return, 33),
        ];
        for (op, code) in expected {
            assert_eq!(ProgramWord::from(*op), *code, "{}", op.mnemonic());
            assert_eq!(Op::try_from(*code).unwrap(), *op);
        }
    }

    #[test]
    fn try_from_invalid() {
        assert!(matches!(
            Op::try_from(34),
            Err(MachineError::InvalidOp(34))
        ));
        assert!(matches!(
            Op::try_from(0xFFFF),
            Err(MachineError::InvalidOp(0xFFFF))
        ));
    }

    #[test]
    fn mnemonic_lookup_is_case_insensitive() {
        assert_eq!(Op::from_mnemonic("push"), Some(Op::Push));
        assert_eq!(Op::from_mnemonic("PUSH"), Some(Op::Push));
        assert_eq!(Op::from_mnemonic("Call_Shared"), Some(Op::CallShared));
        assert_eq!(Op::from_mnemonic("nope"), None);
    }

    #[test]
    fn operand_kinds() {
        assert_eq!(Op::Push.operand_kind(), OperandKind::Inline);
        assert_eq!(Op::Return.operand_kind(), OperandKind::Inline);
        assert_eq!(Op::Jump.operand_kind(), OperandKind::StackArg);
        assert_eq!(Op::LoadStatic.operand_kind(), OperandKind::StackArg);
        assert_eq!(Op::Add.operand_kind(), OperandKind::None);
    }
}
