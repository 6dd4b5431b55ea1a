// Stack VM Builtins
// The outermost scope of every frame: exception types and a handful of natives

mod functions;

use crate::error::ExcType;
use crate::vm::value::{new_scope, NativeFn, NativeFunction, Scope, Value};
use std::sync::Arc;

const NATIVES: &[(&str, NativeFn)] = &[
    ("range", functions::range),
    ("len", functions::len),
    ("abs", functions::abs),
    ("min", functions::min),
    ("max", functions::max),
];

/// Build a fresh builtin scope
pub fn create_builtins() -> Scope {
    let scope = new_scope();
    {
        let mut names = scope.lock();
        for exc_type in ExcType::ALL {
            names.insert(Arc::from(exc_type.name()), Value::ExceptionType(exc_type));
        }
        for &(name, func) in NATIVES {
            names.insert(Arc::from(name), Value::Native(NativeFunction { name, func }));
        }
    }
    scope
}
