// Stack VM Dispatch Engine
// Executes one decoded instruction against the current frame

use crate::bytecode::{InstructionSet, Opcode};
use crate::error::{ExcType, Fault, VmResult};
use crate::vm::call::{make_function, CallOutcome};
use crate::vm::decode::Instruction;
use crate::vm::frame::{BlockKind, Frame};
use crate::vm::ops::{exception_type_of, BinaryOp, CompareOp, UnaryOp, ValueModel};
use crate::vm::unwind::{unwind_block, Signal};
use crate::vm::value::{Cell, Function, Value};
use crate::vm::Vm;
use parking_lot::Mutex;
use std::sync::Arc;

fn no_frame() -> Fault {
    Fault::decode("no active frame")
}

impl<M: ValueModel> Vm<M> {
    /// Execute `ins`, returning the unwind signal it raises, if any
    pub(crate) fn dispatch(&mut self, ins: Instruction) -> VmResult<Option<Signal>> {
        let Some(op) = ins.opcode else {
            self.diagnose(format!("unknown opcode {} ignored", ins.byte));
            return Ok(None);
        };

        if let Some(binary) = BinaryOp::for_opcode(op) {
            return self.binary(binary).map(|_| None);
        }
        if let Some(unary) = UnaryOp::for_opcode(op) {
            let frame = self.frames.last_mut().ok_or_else(no_frame)?;
            let operand = frame.pop()?;
            let result = self.model.unary(unary, &operand)?;
            frame.push(result)?;
            return Ok(None);
        }

        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        match op {
            Opcode::Nop | Opcode::Cache | Opcode::Resume | Opcode::Precall | Opcode::ExtendedArg => {}

            // ==================== Stack ====================
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::RotTwo => {
                let top = frame.pop()?;
                let second = frame.pop()?;
                frame.push(top)?;
                frame.push(second)?;
            }
            Opcode::RotThree => {
                let top = frame.pop()?;
                let second = frame.pop()?;
                let third = frame.pop()?;
                frame.push(top)?;
                frame.push(third)?;
                frame.push(second)?;
            }
            Opcode::DupTop => {
                let top = frame.peek(0)?.clone();
                frame.push(top)?;
            }
            Opcode::DupTopTwo => {
                let top = frame.peek(0)?.clone();
                let second = frame.peek(1)?.clone();
                frame.push(second)?;
                frame.push(top)?;
            }
            Opcode::Copy => {
                let depth = ins.operand.raw()? as usize;
                if depth == 0 {
                    return Err(Fault::decode("COPY with a zero operand"));
                }
                let value = frame.peek(depth - 1)?.clone();
                frame.push(value)?;
            }
            Opcode::Swap => {
                let depth = ins.operand.raw()? as usize;
                if depth == 0 {
                    return Err(Fault::decode("SWAP with a zero operand"));
                }
                frame.peek(depth - 1)?;
                let len = frame.stack.len();
                frame.stack.swap(len - 1, len - depth);
            }

            // ==================== Operators ====================
            Opcode::BinaryOp => {
                let arg = ins.operand.raw()?;
                let binary = BinaryOp::for_binary_op_arg(arg)
                    .ok_or_else(|| Fault::decode(format!("unknown BINARY_OP operand {}", arg)))?;
                self.binary(binary)?;
            }
            Opcode::CompareOp => {
                let arg = ins.operand.raw()?;
                let compare = CompareOp::from_index(arg)
                    .ok_or_else(|| Fault::decode(format!("unknown COMPARE_OP operand {}", arg)))?;
                let right = frame.pop()?;
                let left = frame.pop()?;
                let result = self.model.compare(compare, &left, &right)?;
                frame.push(result)?;
            }

            // ==================== Containers ====================
            Opcode::BinarySubscr => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                let value = self.model.get_item(&target, &key)?;
                frame.push(value)?;
            }
            Opcode::StoreSubscr => {
                let key = frame.pop()?;
                let target = frame.pop()?;
                let value = frame.pop()?;
                self.model.set_item(&target, key, value)?;
            }
            Opcode::StoreMap => {
                let key = frame.pop()?;
                let value = frame.pop()?;
                let map = frame.peek(0)?.clone();
                self.model.set_item(&map, key, value)?;
            }
            Opcode::BuildTuple => {
                let count = ins.operand.raw()? as usize;
                let items = frame.pop_n(count)?;
                frame.push(Value::tuple(items))?;
            }
            Opcode::BuildList => {
                let count = ins.operand.raw()? as usize;
                let items = frame.pop_n(count)?;
                frame.push(Value::list(items))?;
            }
            Opcode::BuildMap => {
                let count = ins.operand.raw()? as usize;
                // Classic treats the operand as a size hint; wordcode pops that many pairs
                let pairs = match frame.code.instruction_set {
                    InstructionSet::Classic => Vec::with_capacity(count),
                    InstructionSet::Wordcode => {
                        let flat = frame.pop_n(count * 2)?;
                        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(count);
                        let mut iter = flat.into_iter();
                        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                            match pairs.iter_mut().find(|(k, _)| *k == key) {
                                Some(slot) => slot.1 = value,
                                None => pairs.push((key, value)),
                            }
                        }
                        pairs
                    }
                };
                frame.push(Value::Dict(Arc::new(Mutex::new(pairs))))?;
            }
            Opcode::ListAppend => {
                let depth = ins.operand.raw()? as usize;
                let value = frame.pop()?;
                if depth == 0 {
                    return Err(Fault::decode("LIST_APPEND with a zero operand"));
                }
                match frame.peek(depth - 1)? {
                    Value::List(items) => items.lock().push(value),
                    other => {
                        return Err(Fault::unsupported(format!(
                            "LIST_APPEND target is '{}', not a list",
                            other.type_name()
                        )))
                    }
                }
            }
            Opcode::UnpackSequence => {
                let count = ins.operand.raw()? as usize;
                let sequence = frame.pop()?;
                let items = self.collect_items(&sequence)?;
                if items.len() != count {
                    return Err(if items.len() < count {
                        Fault::value_error(format!(
                            "not enough values to unpack (expected {}, got {})",
                            count,
                            items.len()
                        ))
                    } else {
                        Fault::value_error(format!("too many values to unpack (expected {})", count))
                    });
                }
                let frame = self.frames.last_mut().ok_or_else(no_frame)?;
                for item in items.into_iter().rev() {
                    frame.push(item)?;
                }
            }

            // ==================== Attributes ====================
            Opcode::LoadAttr => {
                let name = ins.operand.name()?;
                let target = frame.pop()?;
                let value = self.model.get_attr(&target, name)?;
                frame.push(value)?;
            }
            Opcode::StoreAttr => {
                let name = ins.operand.name()?;
                let target = frame.pop()?;
                let value = frame.pop()?;
                self.model.set_attr(&target, name, value)?;
            }

            // ==================== Names ====================
            Opcode::LoadConst => {
                let value = ins.operand.constant()?;
                frame.push(value)?;
            }
            Opcode::LoadName => {
                let value = frame.load_name(ins.operand.name()?)?;
                frame.push(value)?;
            }
            Opcode::StoreName => {
                let value = frame.pop()?;
                frame.store_name(ins.operand.name()?, value);
            }
            Opcode::DeleteName => frame.delete_name(ins.operand.name()?)?,
            Opcode::LoadGlobal => {
                let value = frame.load_global(ins.operand.name()?)?;
                frame.push(value)?;
            }
            Opcode::StoreGlobal => {
                let value = frame.pop()?;
                frame.store_global(ins.operand.name()?, value);
            }
            Opcode::LoadFast => {
                let value = frame.load_local(ins.operand.local()?)?;
                frame.push(value)?;
            }
            Opcode::LoadFastLoadFast => {
                let (first, second) = ins.operand.local_pair()?;
                let first = frame.load_local(first)?;
                let second = frame.load_local(second)?;
                frame.push(first)?;
                frame.push(second)?;
            }
            Opcode::StoreFast => {
                let value = frame.pop()?;
                frame.store_local(ins.operand.local()?, value);
            }
            Opcode::DeleteFast => frame.delete_local(ins.operand.local()?)?,
            Opcode::LoadClosure => {
                let cell = frame.cell(ins.operand.free()?)?.clone();
                frame.push(Value::Cell(cell))?;
            }
            Opcode::LoadDeref => {
                let value = frame.load_deref(ins.operand.free()?)?;
                frame.push(value)?;
            }
            Opcode::StoreDeref => {
                let value = frame.pop()?;
                frame.store_deref(ins.operand.free()?, value)?;
            }

            // ==================== Jumps ====================
            Opcode::JumpForward | Opcode::JumpAbsolute => frame.ip = ins.operand.target()?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let target = ins.operand.target()?;
                let condition = frame.pop()?;
                if self.model.truthy(&condition) == (op == Opcode::PopJumpIfTrue) {
                    frame.ip = target;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let target = ins.operand.target()?;
                let condition = self.model.truthy(frame.peek(0)?);
                if condition == (op == Opcode::JumpIfTrueOrPop) {
                    frame.ip = target;
                } else {
                    frame.pop()?;
                }
            }

            // ==================== Loops ====================
            Opcode::SetupLoop => frame.push_block(BlockKind::Loop, ins.operand.target()?),
            Opcode::GetIter => {
                let value = frame.pop()?;
                let iterator = self.model.iter(&value)?;
                frame.push(iterator)?;
            }
            Opcode::ForIter => {
                let target = ins.operand.target()?;
                let next = self.model.next(frame.peek(0)?)?;
                match next {
                    Some(item) => frame.push(item)?,
                    None => {
                        frame.pop()?;
                        frame.ip = target;
                    }
                }
            }
            Opcode::BreakLoop => return Ok(Some(Signal::Break)),
            Opcode::ContinueLoop => return Ok(Some(Signal::Continue(ins.operand.target()?))),
            Opcode::PopBlock => {
                frame.pop_block()?;
            }

            // ==================== Exceptions ====================
            Opcode::SetupExcept => frame.push_block(BlockKind::ExceptGuard, ins.operand.target()?),
            Opcode::SetupFinally => frame.push_block(BlockKind::Finally, ins.operand.target()?),
            Opcode::PopExcept => {
                let block = frame.pop_block()?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(Fault::decode("POP_EXCEPT outside an exception handler"));
                }
                unwind_block(frame, &mut self.regs, block, false);
            }
            Opcode::EndFinally => return self.end_finally(),
            Opcode::RaiseVarargs => {
                let count = ins.operand.raw()?;
                return Err(self.raise_varargs(count)?);
            }

            // ==================== Functions ====================
            Opcode::ReturnValue => {
                self.regs.return_value = frame.stack.pop().unwrap_or_default();
                return Ok(Some(Signal::Return));
            }
            Opcode::MakeFunction | Opcode::MakeClosure => {
                let default_count = (ins.operand.raw()? & 0xFF) as usize;
                let function = build_function(frame, op == Opcode::MakeClosure, default_count)?;
                frame.push(Value::Function(Arc::new(function)))?;
            }
            Opcode::CallFunction => {
                let arg = ins.operand.raw()?;
                let positional = (arg & 0xFF) as usize;
                let keyword = ((arg >> 8) & 0xFF) as usize;
                self.call_from_stack(positional, keyword)?;
            }
            Opcode::Call => {
                let positional = ins.operand.raw()? as usize;
                self.call_from_stack(positional, 0)?;
            }

            // Routed through the operator tables above
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert
            | Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide => {}
        }

        Ok(None)
    }

    fn binary(&mut self, op: BinaryOp) -> VmResult<()> {
        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        let right = frame.pop()?;
        let left = frame.pop()?;
        let result = self.model.binary(op, &left, &right)?;
        frame.push(result)
    }

    fn collect_items(&self, sequence: &Value) -> VmResult<Vec<Value>> {
        match sequence {
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::List(items) => Ok(items.lock().clone()),
            other => {
                let iterator = self.model.iter(other)?;
                let mut items = Vec::new();
                while let Some(item) = self.model.next(&iterator)? {
                    items.push(item);
                }
                Ok(items)
            }
        }
    }

    /// Pop `[callee, positionals..., (name, value) pairs...]` and perform the call
    fn call_from_stack(&mut self, positional: usize, keyword: usize) -> VmResult<()> {
        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        let flat = frame.pop_n(keyword * 2)?;
        let mut keywords = Vec::with_capacity(keyword);
        let mut pairs = flat.into_iter();
        while let (Some(name), Some(value)) = (pairs.next(), pairs.next()) {
            match name {
                Value::Str(name) => keywords.push((name, value)),
                other => {
                    return Err(Fault::unsupported(format!(
                        "keywords must be strings, not '{}'",
                        other.type_name()
                    )))
                }
            }
        }
        let args = frame.pop_n(positional)?;
        let callee = frame.pop()?;

        match self.call_value(callee, args, keywords)? {
            CallOutcome::Value(value) => {
                let frame = self.frames.last_mut().ok_or_else(no_frame)?;
                frame.push(value)
            }
            CallOutcome::Frame => Ok(()),
        }
    }

    /// END_FINALLY: resume whatever unwind the finally body interrupted
    fn end_finally(&mut self) -> VmResult<Option<Signal>> {
        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        match frame.pop()? {
            Value::None => Ok(None),
            Value::Signal(Signal::Return) => {
                self.regs.return_value = frame.pop()?;
                Ok(Some(Signal::Return))
            }
            Value::Signal(Signal::Continue(_)) => {
                let target = frame.pop()?;
                let target = target
                    .as_int()
                    .and_then(|t| usize::try_from(t).ok())
                    .ok_or_else(|| Fault::decode("END_FINALLY found a malformed continue target"))?;
                Ok(Some(Signal::Continue(target)))
            }
            Value::Signal(signal) => Ok(Some(signal)),
            Value::ExceptionType(_) => {
                let value = frame.pop()?;
                frame.pop()?;
                if let Value::Exception(fault) = value {
                    self.regs.last_fault = Some(fault);
                }
                Ok(Some(Signal::Exception))
            }
            other => Err(Fault::decode(format!(
                "END_FINALLY found unexpected '{}'",
                other.type_name()
            ))),
        }
    }

    /// RAISE_VARARGS: build the fault to raise
    fn raise_varargs(&mut self, count: u32) -> VmResult<Fault> {
        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        let raised = match count {
            0 => {
                return Ok(match &self.regs.handled {
                    Some(fault) => (**fault).clone(),
                    None => Fault::raised(ExcType::RuntimeError, "No active exception to reraise"),
                })
            }
            1 => frame.pop()?,
            2 => {
                // The cause is accepted and dropped
                frame.pop()?;
                frame.pop()?
            }
            other => return Err(Fault::decode(format!("RAISE_VARARGS with {} operands", other))),
        };

        Ok(match raised {
            Value::Exception(fault) => (*fault).clone(),
            other => match exception_type_of(&other) {
                Some(exc_type) => Fault::raised(exc_type, ""),
                None => Fault::unsupported("exceptions must derive from Exception"),
            },
        })
    }
}

/// MAKE_FUNCTION / MAKE_CLOSURE: pop `[defaults..., (closure), code, name]`
fn build_function(
    frame: &mut Frame,
    explicit_closure: bool,
    default_count: usize,
) -> VmResult<Function> {
    let name = frame.pop()?;
    let code = match frame.pop()? {
        Value::Code(code) => code,
        other => {
            return Err(Fault::decode(format!(
                "expected a code object, found '{}'",
                other.type_name()
            )))
        }
    };
    let name = match name {
        Value::Str(name) => name,
        _ => code.name.clone(),
    };

    let closure = if explicit_closure {
        match frame.pop()? {
            Value::Tuple(items) => items
                .iter()
                .map(|item| match item {
                    Value::Cell(cell) => Ok(cell.clone()),
                    other => Err(Fault::decode(format!(
                        "closure tuple holds '{}', not a cell",
                        other.type_name()
                    ))),
                })
                .collect::<VmResult<Vec<Cell>>>()?,
            other => {
                return Err(Fault::decode(format!(
                    "expected a closure tuple, found '{}'",
                    other.type_name()
                )))
            }
        }
    } else {
        // Free variables bind to the defining frame's cells of the same name
        code.freevars
            .iter()
            .map(|free| {
                frame
                    .cell_named(free)
                    .cloned()
                    .ok_or_else(|| Fault::undefined_name(free))
            })
            .collect::<VmResult<Vec<Cell>>>()?
    };

    let defaults = frame.pop_n(default_count)?;
    make_function(name, code, defaults, closure, frame.globals.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CodeUnit};
    use crate::error::FaultKind;
    use crate::vm::value::new_scope;

    fn run_module(b: CodeBuilder) -> (Vm, VmResult<Value>) {
        let mut vm = Vm::new();
        let result = vm.run_code(Arc::new(b.build().unwrap()), Vec::new(), None);
        (vm, result)
    }

    #[test]
    fn test_stack_rotations() {
        let mut b = CodeBuilder::new("<module>");
        b.load_const(1i64)
            .load_const(2i64)
            .load_const(3i64)
            .op(Opcode::RotThree)
            .op_arg(Opcode::BuildTuple, 3)
            .op(Opcode::ReturnValue);
        let (_, result) = run_module(b);
        assert_eq!(
            result.unwrap(),
            Value::tuple(vec![Value::Int(3), Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_unpack_sequence_pushes_first_on_top() {
        let mut b = CodeBuilder::new("<module>");
        b.load_const(1i64)
            .load_const(2i64)
            .op_arg(Opcode::BuildList, 2)
            .op_arg(Opcode::UnpackSequence, 2)
            .op(Opcode::BinarySubtract)
            .op(Opcode::ReturnValue);
        let (_, result) = run_module(b);
        // a, b = [1, 2]; TOS is a, so TOS1 - TOS is b - a
        assert_eq!(result.unwrap(), Value::Int(1));
    }

    #[test]
    fn test_unknown_opcode_is_a_noop() {
        let mut code = CodeUnit::new("<module>", vec![100, 0, 0, 7, 83]);
        code.constants.push(crate::bytecode::Constant::Int(4));
        let mut vm = Vm::new();
        let result = vm.run_code(Arc::new(code), Vec::new(), None).unwrap();
        assert_eq!(result, Value::Int(4));
        assert_eq!(vm.diagnostics().len(), 1);
        assert!(vm.diagnostics()[0].message.contains("unknown opcode 7"));
    }

    #[test]
    fn test_classic_build_map_then_store_map() {
        let mut b = CodeBuilder::new("<module>");
        b.op_arg(Opcode::BuildMap, 1)
            .load_const(10i64)
            .load_const("k")
            .op(Opcode::StoreMap)
            .load_const("k")
            .op(Opcode::BinarySubscr)
            .op(Opcode::ReturnValue);
        let (_, result) = run_module(b);
        assert_eq!(result.unwrap(), Value::Int(10));
    }

    #[test]
    fn test_raise_without_active_exception() {
        let mut b = CodeBuilder::new("<module>");
        b.op_arg(Opcode::RaiseVarargs, 0);
        let (_, result) = run_module(b);
        let fault = result.unwrap_err();
        assert_eq!(fault.exc_type, ExcType::RuntimeError);
        assert_eq!(fault.kind, FaultKind::UserException);
    }

    #[test]
    fn test_raise_non_exception_is_type_error() {
        let mut b = CodeBuilder::new("<module>");
        b.load_const(3i64).op_arg(Opcode::RaiseVarargs, 1);
        let (_, result) = run_module(b);
        assert_eq!(result.unwrap_err().exc_type, ExcType::TypeError);
    }

    #[test]
    fn test_make_function_captures_cells_by_name() {
        let mut inner = CodeBuilder::new("inner");
        inner.freevars(&["n"]).closure(Opcode::LoadDeref, "n").op(Opcode::ReturnValue);
        let inner = inner.build().unwrap();

        let mut outer = CodeBuilder::with_params("outer", &["n"]);
        outer
            .cellvars(&["n"])
            .load_const(inner)
            .load_const("inner")
            .op_arg(Opcode::MakeFunction, 0)
            .op_arg(Opcode::CallFunction, 0)
            .op(Opcode::ReturnValue);
        let outer = Arc::new(outer.build().unwrap());

        let result = Vm::new()
            .run_code(outer, vec![(Arc::from("n"), Value::Int(11))], Some(new_scope()))
            .unwrap();
        assert_eq!(result, Value::Int(11));
    }
}
