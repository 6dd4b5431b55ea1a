// Stack VM Bytecode
// Instruction set, code units and the assembler

pub mod builder;
pub mod opcode;
pub mod unit;

pub use builder::{BuildError, CodeBuilder, Label};
pub use opcode::{InstructionSet, Opcode, OperandKind, HAVE_ARGUMENT};
pub use unit::{CodeUnit, Constant, LoadError};
