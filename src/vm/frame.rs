// Stack VM Frames
// Activation records: operand stack, block stack, and the local -> global -> builtin scope chain

use crate::bytecode::CodeUnit;
use crate::error::{ExcType, Fault, VmResult};
use crate::vm::value::{Cell, Scope, Value};
use smallvec::SmallVec;
use std::sync::Arc;

/// Kinds of pending structured-control contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Loop,
    ExceptGuard,
    Finally,
    /// An `except`/`finally` body is running; three slots above `level` hold the fault to restore
    ExceptHandler,
}

/// A pending structured-control context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    /// Offset to resume at when the block consumes a signal
    pub handler: usize,
    /// Operand stack height when the block was pushed
    pub level: usize,
}

/// One function activation
pub struct Frame {
    pub code: Arc<CodeUnit>,
    pub ip: usize,
    /// Offset of the instruction being executed
    pub last_offset: usize,
    pub stack: Vec<Value>,
    pub blocks: SmallVec<[Block; 8]>,
    pub locals: Scope,
    pub globals: Scope,
    pub builtins: Scope,
    /// Cell variables followed by free variables
    pub cells: Vec<Cell>,
    /// Index of the calling frame in the VM's frame arena
    pub parent: Option<usize>,
    stack_limit: usize,
}

impl Frame {
    pub fn new(code: Arc<CodeUnit>, locals: Scope, globals: Scope, builtins: Scope) -> Self {
        let cells = {
            let locals = locals.lock();
            code.cellvars
                .iter()
                .map(|name| Cell::new(locals.get(name).cloned()))
                .collect()
        };
        Self {
            code,
            ip: 0,
            last_offset: 0,
            stack: Vec::new(),
            blocks: SmallVec::new(),
            locals,
            globals,
            builtins,
            cells,
            parent: None,
            stack_limit: usize::MAX,
        }
    }

    /// Append the cells captured for the code unit's free variables
    pub fn with_closure(mut self, closure: Vec<Cell>) -> Self {
        self.cells.extend(closure);
        self
    }

    pub fn with_parent(mut self, parent: Option<usize>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn name(&self) -> &Arc<str> {
        &self.code.name
    }

    // ==================== Operand Stack ====================

    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.stack_limit {
            return Err(Fault::stack_overflow("operand stack overflow")
                .with_exc_type(ExcType::RuntimeError));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop the top value; an empty stack means the instruction stream is malformed
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Fault::decode(format!("operand stack underflow in '{}'", self.code.name)))
    }

    /// Pop `count` values, returned in push order
    pub fn pop_n(&mut self, count: usize) -> VmResult<Vec<Value>> {
        if count > self.stack.len() {
            return Err(Fault::decode(format!(
                "operand stack underflow in '{}'",
                self.code.name
            )));
        }
        let start = self.stack.len() - count;
        Ok(self.stack.split_off(start))
    }

    pub fn peek(&self, distance: usize) -> VmResult<&Value> {
        let index = self
            .stack
            .len()
            .checked_sub(1 + distance)
            .ok_or_else(|| Fault::decode(format!("operand stack underflow in '{}'", self.code.name)))?;
        Ok(&self.stack[index])
    }

    // ==================== Block Stack ====================

    pub fn push_block(&mut self, kind: BlockKind, handler: usize) {
        let level = self.stack.len();
        self.blocks.push(Block {
            kind,
            handler,
            level,
        });
    }

    pub fn pop_block(&mut self) -> VmResult<Block> {
        self.blocks
            .pop()
            .ok_or_else(|| Fault::decode(format!("block stack underflow in '{}'", self.code.name)))
    }

    // ==================== Scope Resolution ====================

    /// Resolve a name through locals, then globals, then builtins
    pub fn load_name(&self, name: &str) -> VmResult<Value> {
        if let Some(value) = self.locals.lock().get(name) {
            return Ok(value.clone());
        }
        self.load_global(name)
    }

    /// Resolve a name through globals, then builtins
    pub fn load_global(&self, name: &str) -> VmResult<Value> {
        if let Some(value) = self.globals.lock().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.builtins.lock().get(name) {
            return Ok(value.clone());
        }
        Err(Fault::undefined_name(name))
    }

    pub fn load_local(&self, name: &str) -> VmResult<Value> {
        self.locals
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Fault::unbound_local(name))
    }

    pub fn store_name(&self, name: &Arc<str>, value: Value) {
        self.locals.lock().insert(name.clone(), value);
    }

    pub fn store_local(&self, name: &Arc<str>, value: Value) {
        self.locals.lock().insert(name.clone(), value);
    }

    pub fn store_global(&self, name: &Arc<str>, value: Value) {
        self.globals.lock().insert(name.clone(), value);
    }

    pub fn delete_name(&self, name: &str) -> VmResult<()> {
        self.locals
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Fault::undefined_name(name))
    }

    pub fn delete_local(&self, name: &str) -> VmResult<()> {
        self.locals
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Fault::unbound_local(name))
    }

    // ==================== Closure Cells ====================

    pub fn cell(&self, index: usize) -> VmResult<&Cell> {
        self.cells.get(index).ok_or_else(|| {
            Fault::decode(format!(
                "closure index {} out of range in '{}'",
                index, self.code.name
            ))
        })
    }

    /// Cell bound to `name`, for capturing by a nested function
    pub fn cell_named(&self, name: &str) -> Option<&Cell> {
        self.code
            .cellvars
            .iter()
            .chain(self.code.freevars.iter())
            .position(|candidate| &**candidate == name)
            .and_then(|index| self.cells.get(index))
    }

    pub fn load_deref(&self, index: usize) -> VmResult<Value> {
        if let Some(value) = self.cell(index)?.get() {
            return Ok(value);
        }
        let name = self
            .code
            .closure_name(index)
            .map(|n| n.to_string())
            .unwrap_or_default();
        if index < self.code.cellvars.len() {
            Err(Fault::unbound_local(&name))
        } else {
            Err(Fault::undefined_name(&name).with_message(format!(
                "free variable '{}' referenced before assignment in enclosing scope",
                name
            )))
        }
    }

    pub fn store_deref(&self, index: usize, value: Value) -> VmResult<()> {
        self.cell(index)?.set(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::vm::value::new_scope;

    fn frame_with(code: CodeUnit) -> Frame {
        Frame::new(Arc::new(code), new_scope(), new_scope(), new_scope())
    }

    #[test]
    fn test_scope_chain_order() {
        let frame = frame_with(CodeUnit::new("f", Vec::new()));
        let x: Arc<str> = Arc::from("x");
        frame.builtins.lock().insert(x.clone(), Value::Int(3));
        assert_eq!(frame.load_name("x").unwrap(), Value::Int(3));
        frame.store_global(&x, Value::Int(2));
        assert_eq!(frame.load_name("x").unwrap(), Value::Int(2));
        frame.store_name(&x, Value::Int(1));
        assert_eq!(frame.load_name("x").unwrap(), Value::Int(1));
        assert_eq!(frame.load_global("x").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_unbound_local_is_distinct_from_undefined_name() {
        let frame = frame_with(CodeUnit::new("f", Vec::new()));
        assert_eq!(frame.load_local("y").unwrap_err().kind, FaultKind::UnboundLocal);
        assert_eq!(frame.load_name("y").unwrap_err().kind, FaultKind::UndefinedName);
    }

    #[test]
    fn test_module_scope_shares_locals_and_globals() {
        let globals = new_scope();
        let frame = Frame::new(
            Arc::new(CodeUnit::new("<module>", Vec::new())),
            globals.clone(),
            globals,
            new_scope(),
        );
        frame.store_name(&Arc::from("k"), Value::Int(5));
        assert_eq!(frame.load_global("k").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_cells_seeded_from_arguments() {
        let mut code = CodeUnit::new("outer", Vec::new());
        code.cellvars = vec!["n".into(), "m".into()];
        let locals = new_scope();
        locals.lock().insert(Arc::from("n"), Value::Int(4));
        let frame = Frame::new(Arc::new(code), locals, new_scope(), new_scope());
        assert_eq!(frame.load_deref(0).unwrap(), Value::Int(4));
        assert_eq!(frame.load_deref(1).unwrap_err().kind, FaultKind::UnboundLocal);
        assert!(frame.cell_named("m").is_some());
        assert_eq!(frame.load_deref(7).unwrap_err().kind, FaultKind::Decode);
    }

    #[test]
    fn test_stack_limit_and_underflow() {
        let mut frame = frame_with(CodeUnit::new("f", Vec::new())).with_stack_limit(1);
        frame.push(Value::None).unwrap();
        assert_eq!(frame.push(Value::None).unwrap_err().kind, FaultKind::StackOverflow);
        frame.pop().unwrap();
        assert!(frame.pop().unwrap_err().is_fatal());
    }
}
