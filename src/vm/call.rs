// Stack VM Calls and Closures
// Function construction, argument binding, and frame entry

use crate::bytecode::CodeUnit;
use crate::error::{Fault, VmResult};
use crate::vm::frame::Frame;
use crate::vm::ops::ValueModel;
use crate::vm::value::{Cell, Function, Scope, Value};
use crate::vm::Vm;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// What a call produced
pub(crate) enum CallOutcome {
    /// A native or constructor call finished immediately
    Value(Value),
    /// A guest frame was pushed and will produce the value when it finishes
    Frame,
}

/// Build a function value.
///
/// `closure` must hold one cell per free variable of `code`.
pub fn make_function(
    name: Arc<str>,
    code: Arc<CodeUnit>,
    defaults: Vec<Value>,
    closure: Vec<Cell>,
    globals: Scope,
) -> VmResult<Function> {
    if closure.len() != code.freevars.len() {
        return Err(Fault::decode(format!(
            "'{}' has {} free variables but {} closure cells were supplied",
            code.name,
            code.freevars.len(),
            closure.len()
        )));
    }
    Ok(Function {
        name,
        code,
        defaults,
        closure,
        globals,
    })
}

/// Bind call arguments to the parameters of `code`.
///
/// Positionals fill parameters left to right, keywords match by name, and `defaults` cover the
/// trailing parameters that are still unbound.
pub fn bind_arguments(
    code: &CodeUnit,
    defaults: &[Value],
    positional: Vec<Value>,
    keywords: Vec<(Arc<str>, Value)>,
) -> VmResult<FxHashMap<Arc<str>, Value>> {
    let params = code.parameters();
    if positional.len() > params.len() {
        return Err(Fault::call_arity(format!(
            "{}() takes {} positional argument{} but {} {} given",
            code.name,
            params.len(),
            if params.len() == 1 { "" } else { "s" },
            positional.len(),
            if positional.len() == 1 { "was" } else { "were" }
        )));
    }

    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in slots.iter_mut().zip(positional) {
        *slot = Some(value);
    }

    for (name, value) in keywords {
        let Some(index) = params.iter().position(|p| *p == name) else {
            return Err(Fault::call_arity(format!(
                "{}() got an unexpected keyword argument '{}'",
                code.name, name
            )));
        };
        if slots[index].is_some() {
            return Err(Fault::call_arity(format!(
                "{}() got multiple values for argument '{}'",
                code.name, name
            )));
        }
        slots[index] = Some(value);
    }

    let mut missing = Vec::new();
    let mut bound = FxHashMap::default();
    for (index, (param, slot)) in params.iter().zip(slots).enumerate() {
        let from_end = params.len() - index;
        let value = slot.or_else(|| {
            defaults
                .len()
                .checked_sub(from_end)
                .and_then(|i| defaults.get(i).cloned())
        });
        match value {
            Some(value) => {
                bound.insert(param.clone(), value);
            }
            None => missing.push(format!("'{}'", param)),
        }
    }

    if !missing.is_empty() {
        return Err(Fault::call_arity(format!(
            "{}() missing {} required argument{}: {}",
            code.name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            missing.join(", ")
        )));
    }

    Ok(bound)
}

impl<M: ValueModel> Vm<M> {
    /// Invoke a callable. Guest functions get a new frame; everything else completes at once.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        positional: Vec<Value>,
        keywords: Vec<(Arc<str>, Value)>,
    ) -> VmResult<CallOutcome> {
        match callee {
            Value::Function(function) => {
                self.enter_function(&function, positional, keywords)?;
                Ok(CallOutcome::Frame)
            }
            Value::Native(native) => {
                if !keywords.is_empty() {
                    return Err(Fault::call_arity(format!(
                        "{}() takes no keyword arguments",
                        native.name
                    )));
                }
                (native.func)(&positional).map(CallOutcome::Value)
            }
            Value::ExceptionType(exc_type) => {
                if !keywords.is_empty() {
                    return Err(Fault::call_arity(format!(
                        "{}() takes no keyword arguments",
                        exc_type
                    )));
                }
                let message = match positional.as_slice() {
                    [] => String::new(),
                    [single] => single.to_string(),
                    many => many.iter().map(Value::repr).collect::<Vec<_>>().join(", "),
                };
                let exception = Fault::raised(exc_type, message);
                Ok(CallOutcome::Value(Value::Exception(Arc::new(exception))))
            }
            other => Err(Fault::unsupported(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn enter_function(
        &mut self,
        function: &Function,
        positional: Vec<Value>,
        keywords: Vec<(Arc<str>, Value)>,
    ) -> VmResult<()> {
        if self.frames.len() >= self.config.max_depth {
            return Err(Fault::stack_overflow(format!(
                "maximum call depth of {} exceeded calling '{}'",
                self.config.max_depth, function.name
            )));
        }

        let bound = bind_arguments(&function.code, &function.defaults, positional, keywords)?;
        let frame = Frame::new(
            function.code.clone(),
            Arc::new(Mutex::new(bound)),
            function.globals.clone(),
            self.builtins.clone(),
        )
        .with_closure(function.closure.clone())
        .with_parent(self.frames.len().checked_sub(1))
        .with_stack_limit(self.config.stack_limit);

        log::debug!("entering '{}' at depth {}", function.name, self.frames.len() + 1);
        self.frames.push(frame);
        Ok(())
    }
}
