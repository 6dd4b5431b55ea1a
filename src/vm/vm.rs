// Stack VM Execution Driver
// Owns the frame arena and runs the fetch -> decode -> dispatch -> unwind loop
// Calls push frames onto the arena instead of recursing on the native stack

use crate::builtins;
use crate::bytecode::CodeUnit;
use crate::error::{ExcType, Fault, FaultKind, TraceEntry, VmResult};
use crate::vm::call::bind_arguments;
use crate::vm::frame::Frame;
use crate::vm::ops::{StandardModel, ValueModel};
use crate::vm::unwind::{unwind, Registers, Signal};
use crate::vm::value::{new_scope, Scope, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_MAX_DEPTH: usize = 1000;
const DEFAULT_STACK_LIMIT: usize = 65536;

/// Limits applied to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum number of active frames
    pub max_depth: usize,
    /// Instructions a run may execute; unbounded when `None`
    pub instruction_budget: Option<u64>,
    /// Operand slots per frame
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            instruction_budget: None,
            stack_limit: DEFAULT_STACK_LIMIT,
        }
    }
}

impl VmConfig {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = Some(budget);
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }
}

/// A tolerated irregularity observed while running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub function: Arc<str>,
    pub offset: usize,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (@{}): {}", self.function, self.offset, self.message)
    }
}

/// The virtual machine
pub struct Vm<M: ValueModel = StandardModel> {
    pub(crate) model: M,
    pub(crate) config: VmConfig,
    /// Active frames; the last one is executing
    pub(crate) frames: Vec<Frame>,
    pub(crate) builtins: Scope,
    pub(crate) regs: Registers,
    executed: u64,
    diagnostics: Vec<Diagnostic>,
}

impl Vm<StandardModel> {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_model(StandardModel, config)
    }
}

impl Default for Vm<StandardModel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ValueModel> Vm<M> {
    /// Build a VM over a custom value model
    pub fn with_model(model: M, config: VmConfig) -> Self {
        Self {
            model,
            config,
            frames: Vec::new(),
            builtins: builtins::create_builtins(),
            regs: Registers::default(),
            executed: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Add or replace a builtin visible to every frame
    pub fn define_builtin(&mut self, name: &str, value: Value) {
        self.builtins.lock().insert(Arc::from(name), value);
    }

    /// Fault from the most recent run, if one is still active
    pub fn last_fault(&self) -> Option<&Fault> {
        self.regs.last_fault.as_deref()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Execute a code unit to completion.
    ///
    /// `args` bind to the unit's parameters by name. Without `globals` a fresh global scope is
    /// used; a unit with no parameters runs at module scope, where locals are the globals.
    pub fn run_code(
        &mut self,
        code: Arc<CodeUnit>,
        args: Vec<(Arc<str>, Value)>,
        globals: Option<Scope>,
    ) -> VmResult<Value> {
        self.regs = Registers::default();
        self.executed = 0;
        self.diagnostics.clear();

        let globals = globals.unwrap_or_else(new_scope);
        let bound = bind_arguments(&code, &[], Vec::new(), args)?;
        let locals = if code.argcount == 0 {
            globals.clone()
        } else {
            Arc::new(parking_lot::Mutex::new(bound))
        };

        let base = self.frames.len();
        let parent = base.checked_sub(1);
        let frame = Frame::new(code, locals, globals, self.builtins.clone())
            .with_parent(parent)
            .with_stack_limit(self.config.stack_limit);
        log::debug!("entering '{}'", frame.name());
        self.frames.push(frame);
        self.run_until(base)
    }

    /// Run until the frame count drops back to `base`, returning the value of the frame at `base`
    pub(crate) fn run_until(&mut self, base: usize) -> VmResult<Value> {
        loop {
            match self.step(base) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(fault) => {
                    self.frames.truncate(base);
                    return Err(fault);
                }
            }
        }
    }

    /// Execute one instruction. `Some` carries the result once the frame at `base` finishes.
    pub(crate) fn step(&mut self, base: usize) -> VmResult<Option<Value>> {
        if let Some(budget) = self.config.instruction_budget {
            if self.executed >= budget {
                let fault = Fault::new(
                    FaultKind::BudgetExhausted,
                    format!("instruction budget of {} exhausted", budget),
                );
                return Err(self.with_trace(fault));
            }
        }
        self.executed += 1;

        let decoded = match self.frames.last_mut() {
            Some(frame) => frame.decode(),
            None => return Ok(Some(Value::None)),
        };
        let instruction = match decoded {
            Ok(instruction) => instruction,
            Err(fault) => return Err(self.with_trace(fault)),
        };

        let signal = match self.dispatch(instruction) {
            Ok(signal) => signal,
            Err(fault) if fault.is_fatal() => return Err(self.with_trace(fault)),
            Err(fault) => {
                self.raise(fault);
                Some(Signal::Exception)
            }
        };

        match signal {
            Some(signal) => self.propagate(signal, base),
            None => Ok(None),
        }
    }

    /// Route a signal through the current frame's blocks, finishing frames it escapes from
    fn propagate(&mut self, mut signal: Signal, base: usize) -> VmResult<Option<Value>> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(Some(Value::None));
            };
            let Some(escaped) = unwind(frame, &mut self.regs, signal) else {
                return Ok(None);
            };

            let result = match escaped {
                Signal::Return => Ok(std::mem::take(&mut self.regs.return_value)),
                Signal::Break | Signal::Continue(_) => {
                    let word = if escaped == Signal::Break { "break" } else { "continue" };
                    self.diagnose(format!("'{}' outside loop ends the frame", word));
                    Ok(Value::None)
                }
                Signal::Exception => Err(self.current_fault()),
            };

            if let Some(finished) = self.frames.pop() {
                log::debug!("leaving '{}'", finished.name());
            }

            if self.frames.len() <= base {
                return result.map(Some);
            }

            match result {
                Ok(value) => {
                    let pushed = match self.frames.last_mut() {
                        Some(caller) => caller.push(value),
                        None => Ok(()),
                    };
                    match pushed {
                        Ok(()) => return Ok(None),
                        Err(fault) => {
                            self.raise(fault);
                            signal = Signal::Exception;
                        }
                    }
                }
                // The caller sees the callee's fault as its own exception
                Err(_) => signal = Signal::Exception,
            }
        }
    }

    fn current_fault(&self) -> Fault {
        match &self.regs.last_fault {
            Some(fault) => (**fault).clone(),
            None => Fault::raised(ExcType::RuntimeError, "exception signal without an active fault"),
        }
    }

    /// Make `fault` the active fault, stamping it with the current frame chain
    pub(crate) fn raise(&mut self, fault: Fault) {
        let fault = self.with_trace(fault);
        self.regs.last_fault = Some(Arc::new(fault));
    }

    fn with_trace(&self, fault: Fault) -> Fault {
        if fault.traceback.is_empty() {
            let trace = self.traceback();
            fault.with_traceback(trace)
        } else {
            fault
        }
    }

    /// Frame chain from the executing frame outwards
    pub(crate) fn traceback(&self) -> Vec<TraceEntry> {
        let mut trace = Vec::new();
        let mut index = self.frames.len().checked_sub(1);
        while let Some(i) = index {
            let Some(frame) = self.frames.get(i) else { break };
            trace.push(TraceEntry::new(frame.name().clone(), frame.last_offset));
            index = frame.parent;
        }
        trace
    }

    /// Record a tolerated irregularity at the current instruction
    pub(crate) fn diagnose(&mut self, message: String) {
        let (function, offset) = match self.frames.last() {
            Some(frame) => (frame.name().clone(), frame.last_offset),
            None => (Arc::from("<host>"), 0),
        };
        log::warn!("{} (@{}): {}", function, offset, message);
        self.diagnostics.push(Diagnostic {
            function,
            offset,
            message,
        });
    }
}

/// Run a code unit on a fresh VM with default configuration
pub fn run(
    code: Arc<CodeUnit>,
    args: Vec<(Arc<str>, Value)>,
    globals: Option<Scope>,
) -> VmResult<Value> {
    Vm::new().run_code(code, args, globals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, Constant, Opcode};
    use crate::vm::frame::BlockKind;

    fn module(build: impl FnOnce(&mut CodeBuilder)) -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("<module>");
        build(&mut b);
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_empty_unit_returns_none() {
        let code = Arc::new(CodeUnit::new("<module>", Vec::new()));
        assert_eq!(run(code, Vec::new(), None).unwrap(), Value::None);
    }

    #[test]
    fn test_module_scope_writes_globals() {
        let code = module(|b| {
            b.load_const(3i64).name(Opcode::StoreName, "x").load_const(Constant::None);
            b.op(Opcode::ReturnValue);
        });
        let globals = new_scope();
        run(code, Vec::new(), Some(globals.clone())).unwrap();
        assert_eq!(globals.lock().get("x"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_loop_is_stack_neutral() {
        // for i in range(3): total = total + i
        let code = module(|b| {
            let after = b.label();
            let top = b.label();
            let exit = b.label();
            b.load_const(0i64).name(Opcode::StoreName, "total");
            b.load_const("marker");
            b.jump(Opcode::SetupLoop, after)
                .name(Opcode::LoadName, "range")
                .load_const(3i64)
                .op_arg(Opcode::CallFunction, 1)
                .op(Opcode::GetIter)
                .bind(top)
                .jump(Opcode::ForIter, exit)
                .name(Opcode::StoreName, "i")
                .name(Opcode::LoadName, "total")
                .name(Opcode::LoadName, "i")
                .op(Opcode::InplaceAdd)
                .name(Opcode::StoreName, "total")
                .jump(Opcode::JumpAbsolute, top)
                .bind(exit)
                .op(Opcode::PopBlock)
                .bind(after)
                .op(Opcode::Nop)
                .op(Opcode::ReturnValue);
        });

        let mut vm = Vm::new();
        let globals = new_scope();
        let frame = Frame::new(code, globals.clone(), globals.clone(), vm.builtins.clone());
        vm.frames.push(frame);

        let mut height_before_loop = None;
        loop {
            let frame = &vm.frames[0];
            let next = frame.code.code.get(frame.ip).copied();
            if next == Some(120) {
                // SETUP_LOOP is about to run
                height_before_loop = Some(frame.stack.len());
            }
            if next == Some(9) {
                assert_eq!(Some(frame.stack.len()), height_before_loop);
                assert!(frame.blocks.iter().all(|b| b.kind != BlockKind::Loop));
            }
            if let Some(result) = vm.step(0).unwrap() {
                assert_eq!(result, Value::str("marker"));
                break;
            }
        }
        assert_eq!(globals.lock().get("total"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_continue_and_break_through_finally_leave_no_blocks() {
        // for i in [1, 2, 3]:
        //     try:
        //         if i == 1: continue
        //         break
        //     finally:
        //         runs += 1
        let code = module(|b| {
            let after = b.label();
            let top = b.label();
            let exit = b.label();
            let cleanup = b.label();
            let not_one = b.label();
            b.load_const(0i64).name(Opcode::StoreName, "runs");
            b.load_const("marker");
            b.jump(Opcode::SetupLoop, after)
                .load_const(1i64)
                .load_const(2i64)
                .load_const(3i64)
                .op_arg(Opcode::BuildList, 3)
                .op(Opcode::GetIter)
                .bind(top)
                .jump(Opcode::ForIter, exit)
                .name(Opcode::StoreName, "i")
                .jump(Opcode::SetupFinally, cleanup)
                .name(Opcode::LoadName, "i")
                .load_const(1i64)
                .op_arg(Opcode::CompareOp, 2)
                .jump(Opcode::PopJumpIfFalse, not_one)
                .jump(Opcode::ContinueLoop, top)
                .bind(not_one)
                .op(Opcode::BreakLoop)
                .op(Opcode::PopBlock)
                .load_const(Constant::None)
                .bind(cleanup)
                .name(Opcode::LoadName, "runs")
                .load_const(1i64)
                .op(Opcode::BinaryAdd)
                .name(Opcode::StoreName, "runs")
                .op(Opcode::EndFinally)
                .jump(Opcode::JumpAbsolute, top)
                .bind(exit)
                .op(Opcode::PopBlock)
                .bind(after)
                .op(Opcode::Nop)
                .op(Opcode::ReturnValue);
        });

        let mut vm = Vm::new();
        let globals = new_scope();
        let frame = Frame::new(code, globals.clone(), globals.clone(), vm.builtins.clone());
        vm.frames.push(frame);

        let mut reached_end = false;
        loop {
            let frame = &vm.frames[0];
            if frame.code.code.get(frame.ip) == Some(&9) {
                reached_end = true;
                assert!(frame.blocks.is_empty());
                assert_eq!(frame.stack, vec![Value::str("marker")]);
            }
            if let Some(result) = vm.step(0).unwrap() {
                assert_eq!(result, Value::str("marker"));
                break;
            }
        }
        assert!(reached_end);
        assert_eq!(globals.lock().get("runs"), Some(&Value::Int(2)));
        assert_eq!(globals.lock().get("i"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_budget_exhaustion_is_fatal() {
        let code = module(|b| {
            let top = b.label();
            b.load_const(Constant::None);
            b.jump(Opcode::SetupExcept, top);
            b.bind(top).jump(Opcode::JumpAbsolute, top);
        });
        let mut vm = Vm::with_config(VmConfig::default().with_instruction_budget(50));
        let fault = vm.run_code(code, Vec::new(), None).unwrap_err();
        assert_eq!(fault.kind, FaultKind::BudgetExhausted);
        assert_eq!(vm.instructions_executed(), 50);
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn test_stray_break_records_diagnostic() {
        let code = module(|b| {
            b.op(Opcode::BreakLoop);
        });
        let mut vm = Vm::new();
        assert_eq!(vm.run_code(code, Vec::new(), None).unwrap(), Value::None);
        assert_eq!(vm.diagnostics().len(), 1);
        assert!(vm.diagnostics()[0].message.contains("break"));
    }

    #[test]
    fn test_run_binds_named_arguments() {
        let mut b = CodeBuilder::with_params("add", &["a", "b"]);
        b.local(Opcode::LoadFast, "a")
            .local(Opcode::LoadFast, "b")
            .op(Opcode::BinaryAdd)
            .op(Opcode::ReturnValue);
        let code = Arc::new(b.build().unwrap());
        let args = vec![(Arc::from("b"), Value::Int(5)), (Arc::from("a"), Value::Int(2))];
        assert_eq!(run(code.clone(), args, None).unwrap(), Value::Int(7));

        let err = run(code, vec![(Arc::from("a"), Value::Int(2))], None).unwrap_err();
        assert_eq!(err.kind, FaultKind::CallArity);
    }
}
