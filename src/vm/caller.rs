// Stack VM Value Caller
// Lets host code invoke guest callables on a VM

use crate::error::{Fault, VmResult};
use crate::vm::call::CallOutcome;
use crate::vm::ops::ValueModel;
use crate::vm::value::Value;
use crate::vm::Vm;
use std::sync::Arc;

/// Trait for calling values (functions, natives, exception types) from the host
pub trait ValueCaller {
    /// Call a callable value with positional and keyword arguments
    fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> Result<Value, Fault>;
}

impl<M: ValueModel> ValueCaller for Vm<M> {
    fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(Arc<str>, Value)>,
    ) -> VmResult<Value> {
        // Run until the frame count drops back to where it was
        let base = self.frames.len();
        let outcome = self.call_value(callee.clone(), args, kwargs).map_err(|fault| {
            let fault = fault.with_traceback(self.traceback());
            self.regs.last_fault = Some(Arc::new(fault.clone()));
            fault
        })?;
        match outcome {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Frame => self.run_until(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, Opcode};
    use crate::error::FaultKind;
    use crate::vm::value::new_scope;

    fn define_double(vm: &mut Vm) -> Value {
        let mut body = CodeBuilder::with_params("double", &["x"]);
        body.local(Opcode::LoadFast, "x")
            .load_const(2i64)
            .op(Opcode::BinaryMultiply)
            .op(Opcode::ReturnValue);
        let mut module = CodeBuilder::new("<module>");
        module
            .load_const(body.build().unwrap())
            .load_const("double")
            .op_arg(Opcode::MakeFunction, 0)
            .name(Opcode::StoreName, "double");
        let globals = new_scope();
        vm.run_code(Arc::new(module.build().unwrap()), Vec::new(), Some(globals.clone()))
            .unwrap();
        let double = globals.lock().get("double").cloned();
        double.unwrap()
    }

    #[test]
    fn test_host_calls_guest_function() {
        let mut vm = Vm::new();
        let double = define_double(&mut vm);
        assert_eq!(vm.call(&double, vec![Value::Int(21)], Vec::new()).unwrap(), Value::Int(42));
        assert_eq!(
            vm.call(&double, Vec::new(), vec![(Arc::from("x"), Value::Int(4))]).unwrap(),
            Value::Int(8)
        );
    }

    #[test]
    fn test_host_call_faults_are_returned() {
        let mut vm = Vm::new();
        let double = define_double(&mut vm);
        let fault = vm.call(&double, Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(fault.kind, FaultKind::CallArity);
        assert_eq!(vm.last_fault().map(|f| f.kind), Some(FaultKind::CallArity));

        let fault = vm.call(&double, vec![Value::str("a"), Value::None], Vec::new()).unwrap_err();
        assert_eq!(fault.kind, FaultKind::CallArity);
    }

    #[test]
    fn test_host_calls_native() {
        let mut vm = Vm::new();
        let len = vm.builtins.lock().get("len").cloned().unwrap();
        let list = Value::list(vec![Value::None, Value::None]);
        assert_eq!(vm.call(&len, vec![list], Vec::new()).unwrap(), Value::Int(2));
    }
}
