// Stack VM Module
// Values, frames, and the execution engine

pub mod call;
pub mod caller;
pub mod decode;
mod dispatch;
pub mod frame;
pub mod ops;
pub mod unwind;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use call::{bind_arguments, make_function};
pub use caller::ValueCaller;
pub use decode::{Instruction, Operand};
pub use frame::{Block, BlockKind, Frame};
pub use ops::{BinaryOp, CompareOp, StandardModel, UnaryOp, ValueModel};
pub use unwind::Signal;
pub use value::{new_scope, Cell, Function, NativeFunction, Scope, SeqIter, Value};
pub use vm::{run, Diagnostic, Vm, VmConfig};
