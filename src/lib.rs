// Stack VM
// A stack-based bytecode virtual machine with frames, a block stack, and lexical closures

pub mod builtins;
pub mod bytecode;
pub mod error;
pub mod vm;

pub use bytecode::{CodeBuilder, CodeUnit, Constant, InstructionSet, Opcode};
pub use error::{ExcType, Fault, FaultKind, TraceEntry, VmResult};
pub use vm::{run, Value, ValueCaller, Vm, VmConfig};
