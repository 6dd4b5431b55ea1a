// Stack VM Runtime Values
// Reference-counted values shared between the operand stacks, scopes and closure cells

use crate::bytecode::{CodeUnit, Constant};
use crate::error::{ExcType, Fault, TraceEntry, VmResult};
use crate::vm::unwind::Signal;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

thread_local! {
    /// Containers currently being rendered or compared on this thread
    static VISITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Visit(usize);

impl Drop for Visit {
    fn drop(&mut self) {
        VISITING.with(|visiting| {
            let mut visiting = visiting.borrow_mut();
            let keep = visiting.len().saturating_sub(self.0);
            visiting.truncate(keep);
        });
    }
}

/// Run `f` while the containers `ids` are marked as visited.
///
/// Returns `None` without calling `f` when one of them is already being visited, meaning the
/// value graph loops back on itself. Container locks are not reentrant, so callers use this
/// before locking a list or dict whose elements they walk.
pub fn visit<T>(ids: &[usize], f: impl FnOnce() -> T) -> Option<T> {
    let entered = VISITING.with(|visiting| {
        let mut visiting = visiting.borrow_mut();
        if ids.iter().any(|id| visiting.contains(id)) {
            return false;
        }
        visiting.extend_from_slice(ids);
        true
    });
    if !entered {
        return None;
    }
    let _visit = Visit(ids.len());
    Some(f())
}

/// A variable scope: locals, globals or builtins
pub type Scope = Arc<Mutex<FxHashMap<Arc<str>, Value>>>;

/// Create an empty scope
pub fn new_scope() -> Scope {
    Arc::new(Mutex::new(FxHashMap::default()))
}

/// Native function type
pub type NativeFn = fn(&[Value]) -> VmResult<Value>;

/// A builtin implemented in Rust
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

/// A shared, mutable binding for a captured variable
#[derive(Clone, Default)]
pub struct Cell(Arc<Mutex<Option<Value>>>);

impl Cell {
    pub fn new(value: Option<Value>) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> Option<Value> {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = Some(value);
    }

    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A callable built by MAKE_FUNCTION / MAKE_CLOSURE
pub struct Function {
    pub name: Arc<str>,
    pub code: Arc<CodeUnit>,
    /// Defaults for the trailing parameters
    pub defaults: Vec<Value>,
    /// Cells for `code.freevars`, in order
    pub closure: Vec<Cell>,
    /// Global scope in effect when the function was created
    pub globals: Scope,
}

/// Iteration state for GET_ITER / FOR_ITER
pub struct SeqIter {
    pub items: Vec<Value>,
    pub position: usize,
}

impl SeqIter {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, position: 0 }
    }

    pub fn next_item(&mut self) -> Option<Value> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        item
    }
}

/// Runtime value types
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    List(Arc<Mutex<Vec<Value>>>),
    /// Insertion-ordered key/value pairs
    Dict(Arc<Mutex<Vec<(Value, Value)>>>),
    Iterator(Arc<Mutex<SeqIter>>),
    Code(Arc<CodeUnit>),
    Function(Arc<Function>),
    Native(NativeFunction),
    Cell(Cell),
    ExceptionType(ExcType),
    Exception(Arc<Fault>),
    Traceback(Arc<[TraceEntry]>),
    /// Pending unwind tag parked on the stack while a finally body runs
    Signal(Signal),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::from(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Iterator(_) => "iterator",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Native(_) => "builtin_function",
            Value::Cell(_) => "cell",
            Value::ExceptionType(_) => "type",
            Value::Exception(f) => f.exc_type.name(),
            Value::Traceback(_) => "traceback",
            Value::Signal(_) => "signal",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Identity comparison (`is`)
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Arc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.name == b.name,
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Signal(a), Value::Signal(b)) => a == b,
            _ => false,
        }
    }

    /// Identity of a mutable container, for cycle detection
    pub fn container_id(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(Arc::as_ptr(items) as usize),
            Value::Dict(pairs) => Some(Arc::as_ptr(pairs) as usize),
            _ => None,
        }
    }

    /// Python-style repr, used for elements inside containers
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s),
            other => other.to_string(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl From<&Constant> for Value {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Tuple(items) => Value::tuple(items.iter().map(Value::from).collect()),
            Constant::Code(code) => Value::Code(code.clone()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a[..] == b[..],
            (Value::List(a), Value::List(b)) => {
                // Comparing a list with itself must not lock it twice
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let ids = [Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize];
                visit(&ids, || *a.lock() == *b.lock()).unwrap_or(false)
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let ids = [Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize];
                visit(&ids, || {
                    let a = a.lock();
                    let b = b.lock();
                    a.len() == b.len()
                        && a.iter().all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v == v2))
                })
                .unwrap_or(false)
            }
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (a @ (Value::Int(_) | Value::Bool(_) | Value::Float(_)), b @ (Value::Int(_) | Value::Bool(_) | Value::Float(_))) => {
                match (a.as_float(), b.as_float()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => self.is(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                if parts.len() == 1 {
                    write!(f, "({},)", parts[0])
                } else {
                    write!(f, "({})", parts.join(", "))
                }
            }
            Value::List(items) => {
                let rendered = visit(&[Arc::as_ptr(items) as usize], || {
                    let parts: Vec<String> = items.lock().iter().map(Value::repr).collect();
                    format!("[{}]", parts.join(", "))
                });
                f.write_str(rendered.as_deref().unwrap_or("[...]"))
            }
            Value::Dict(pairs) => {
                let rendered = visit(&[Arc::as_ptr(pairs) as usize], || {
                    let parts: Vec<String> = pairs
                        .lock()
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                });
                f.write_str(rendered.as_deref().unwrap_or("{...}"))
            }
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Code(code) => write!(f, "<code {}>", code.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Native(native) => write!(f, "<built-in function {}>", native.name),
            Value::Cell(_) => write!(f, "<cell>"),
            Value::ExceptionType(t) => write!(f, "<class '{}'>", t.name()),
            Value::Exception(fault) => write!(f, "{}", fault),
            Value::Traceback(_) => write!(f, "<traceback>"),
            Value::Signal(signal) => write!(f, "<signal {:?}>", signal),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}
