// Stack VM Operator Tables
// Operator enums keyed by symbol, and the value model that gives them meaning

use crate::bytecode::Opcode;
use crate::error::{ExcType, Fault, VmResult};
use crate::vm::value::{visit, SeqIter, Value};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// Binary arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    MatMul,
    FloorDiv,
    TrueDiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::MatMul => "@",
            BinaryOp::FloorDiv => "//",
            BinaryOp::TrueDiv => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Lshift => "<<",
            BinaryOp::Rshift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
        }
    }

    /// Operator behind a classic BINARY_* or INPLACE_* opcode
    pub fn for_opcode(op: Opcode) -> Option<BinaryOp> {
        Some(match op {
            Opcode::BinaryAdd | Opcode::InplaceAdd => BinaryOp::Add,
            Opcode::BinarySubtract | Opcode::InplaceSubtract => BinaryOp::Sub,
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinaryOp::Mul,
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => BinaryOp::FloorDiv,
            Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => BinaryOp::TrueDiv,
            Opcode::BinaryModulo | Opcode::InplaceModulo => BinaryOp::Mod,
            Opcode::BinaryPower => BinaryOp::Pow,
            Opcode::BinaryLshift => BinaryOp::Lshift,
            Opcode::BinaryRshift => BinaryOp::Rshift,
            Opcode::BinaryAnd => BinaryOp::And,
            Opcode::BinaryOr => BinaryOp::Or,
            Opcode::BinaryXor => BinaryOp::Xor,
            _ => return None,
        })
    }

    /// Operator selected by a wordcode BINARY_OP operand; 13 and up are the in-place forms
    pub fn for_binary_op_arg(arg: u32) -> Option<BinaryOp> {
        const TABLE: [BinaryOp; 13] = [
            BinaryOp::Add,
            BinaryOp::And,
            BinaryOp::FloorDiv,
            BinaryOp::Lshift,
            BinaryOp::MatMul,
            BinaryOp::Mul,
            BinaryOp::Mod,
            BinaryOp::Or,
            BinaryOp::Pow,
            BinaryOp::Rshift,
            BinaryOp::Sub,
            BinaryOp::TrueDiv,
            BinaryOp::Xor,
        ];
        let index = arg as usize;
        TABLE.get(index % TABLE.len()).copied().filter(|_| index < TABLE.len() * 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

impl UnaryOp {
    pub fn for_opcode(op: Opcode) -> Option<UnaryOp> {
        Some(match op {
            Opcode::UnaryPositive => UnaryOp::Positive,
            Opcode::UnaryNegative => UnaryOp::Negative,
            Opcode::UnaryNot => UnaryOp::Not,
            Opcode::UnaryInvert => UnaryOp::Invert,
            _ => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Positive => "+",
            UnaryOp::Negative => "-",
            UnaryOp::Not => "not",
            UnaryOp::Invert => "~",
        }
    }
}

/// COMPARE_OP operators, in operand order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareOp {
    const TABLE: [CompareOp; 11] = [
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
        CompareOp::In,
        CompareOp::NotIn,
        CompareOp::Is,
        CompareOp::IsNot,
        CompareOp::ExceptionMatch,
    ];

    pub fn from_index(index: u32) -> Option<CompareOp> {
        Self::TABLE.get(index as usize).copied()
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::ExceptionMatch => "exception match",
        }
    }
}

/// Protocols the VM delegates to for values on the operand stack.
///
/// Every method defaults to the standard semantics, so a custom model only overrides
/// the protocols it changes.
pub trait ValueModel {
    fn binary(&self, op: BinaryOp, left: &Value, right: &Value) -> VmResult<Value> {
        binary(op, left, right)
    }

    fn unary(&self, op: UnaryOp, operand: &Value) -> VmResult<Value> {
        unary(op, operand, self.truthy(operand))
    }

    fn compare(&self, op: CompareOp, left: &Value, right: &Value) -> VmResult<Value> {
        compare(op, left, right).map(Value::Bool)
    }

    fn truthy(&self, value: &Value) -> bool {
        truthy(value)
    }

    fn get_attr(&self, target: &Value, name: &str) -> VmResult<Value> {
        get_attr(target, name)
    }

    fn set_attr(&self, target: &Value, name: &str, _value: Value) -> VmResult<()> {
        Err(no_attribute(target, name))
    }

    fn get_item(&self, target: &Value, key: &Value) -> VmResult<Value> {
        get_item(target, key)
    }

    fn set_item(&self, target: &Value, key: Value, value: Value) -> VmResult<()> {
        set_item(target, key, value)
    }

    /// Produce an iterator value for GET_ITER
    fn iter(&self, value: &Value) -> VmResult<Value> {
        iter(value)
    }

    /// Advance an iterator; `None` when exhausted
    fn next(&self, iterator: &Value) -> VmResult<Option<Value>> {
        match iterator {
            Value::Iterator(state) => Ok(state.lock().next_item()),
            other => Err(Fault::unsupported(format!(
                "'{}' object is not an iterator",
                other.type_name()
            ))),
        }
    }
}

/// The built-in value model
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardModel;

impl ValueModel for StandardModel {}

fn unsupported_operands(symbol: &str, left: &Value, right: &Value) -> Fault {
    Fault::unsupported(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        symbol,
        left.type_name(),
        right.type_name()
    ))
}

fn int_overflow() -> Fault {
    Fault::overflow("integer overflow")
}

fn is_numeric(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Bool(_) | Value::Float(_))
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> VmResult<Value> {
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        if let (BinaryOp::And | BinaryOp::Or | BinaryOp::Xor, Value::Bool(x), Value::Bool(y)) =
            (op, left, right)
        {
            return Ok(Value::Bool(match op {
                BinaryOp::And => x & y,
                BinaryOp::Or => x | y,
                _ => x ^ y,
            }));
        }
        return int_binary(op, a, b, left, right);
    }

    if is_numeric(left) && is_numeric(right) {
        if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
            return float_binary(op, a, b, left, right);
        }
    }

    match (op, left, right) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::Str(Arc::from(joined)))
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinaryOp::Mul, Value::Str(s), n) | (BinaryOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let count = repeat_count(n)?;
            Ok(Value::Str(Arc::from(s.repeat(count))))
        }
        (BinaryOp::Mul, Value::List(items), n) | (BinaryOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let count = repeat_count(n)?;
            let source = items.lock().clone();
            let mut repeated = Vec::with_capacity(source.len() * count);
            for _ in 0..count {
                repeated.extend(source.iter().cloned());
            }
            Ok(Value::list(repeated))
        }
        _ => Err(unsupported_operands(op.symbol(), left, right)),
    }
}

fn repeat_count(n: &Value) -> VmResult<usize> {
    let count = n.as_int().unwrap_or(0);
    if count > u32::MAX as i64 {
        return Err(Fault::overflow("repeat count too large"));
    }
    Ok(count.max(0) as usize)
}

fn int_binary(op: BinaryOp, a: i64, b: i64, left: &Value, right: &Value) -> VmResult<Value> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(int_overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(int_overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(int_overflow)?,
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(Fault::division_by_zero("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(int_overflow)?;
            if a % b != 0 && (a < 0) != (b < 0) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(Fault::division_by_zero("integer division or modulo by zero"));
            }
            let r = a.checked_rem(b).unwrap_or(0);
            if r != 0 && (r < 0) != (b < 0) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::TrueDiv => {
            if b == 0 {
                return Err(Fault::division_by_zero("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(Fault::division_by_zero(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| int_overflow())?;
            a.checked_pow(exp).ok_or_else(int_overflow)?
        }
        BinaryOp::Lshift => {
            if b < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            if a == 0 {
                0
            } else if b >= 64 {
                return Err(int_overflow());
            } else {
                let shifted = a << b;
                if shifted >> b != a {
                    return Err(int_overflow());
                }
                shifted
            }
        }
        BinaryOp::Rshift => {
            if b < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::MatMul => return Err(unsupported_operands(op.symbol(), left, right)),
    };
    Ok(Value::Int(result))
}

fn float_binary(op: BinaryOp, a: f64, b: f64, left: &Value, right: &Value) -> VmResult<Value> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b == 0.0 {
                return Err(Fault::division_by_zero("float division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(Fault::division_by_zero("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(Fault::division_by_zero("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Fault::division_by_zero(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
        _ => return Err(unsupported_operands(op.symbol(), left, right)),
    };
    Ok(Value::Float(result))
}

pub fn unary(op: UnaryOp, operand: &Value, truthy: bool) -> VmResult<Value> {
    let unsupported = || {
        Fault::unsupported(format!(
            "bad operand type for unary {}: '{}'",
            op.symbol(),
            operand.type_name()
        ))
    };
    match (op, operand) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!truthy)),
        (UnaryOp::Positive, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Negative, Value::Float(f)) => Ok(Value::Float(-*f)),
        (UnaryOp::Positive, v) => v.as_int().map(Value::Int).ok_or_else(unsupported),
        (UnaryOp::Negative, v) => {
            let i = v.as_int().ok_or_else(unsupported)?;
            i.checked_neg().map(Value::Int).ok_or_else(int_overflow)
        }
        (UnaryOp::Invert, v) => v.as_int().map(|i| Value::Int(!i)).ok_or_else(unsupported),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Tuple(items) => !items.is_empty(),
        Value::List(items) => !items.lock().is_empty(),
        Value::Dict(pairs) => !pairs.lock().is_empty(),
        _ => true,
    }
}

pub fn compare(op: CompareOp, left: &Value, right: &Value) -> VmResult<bool> {
    match op {
        CompareOp::Eq => Ok(left == right),
        CompareOp::Ne => Ok(left != right),
        CompareOp::Is => Ok(left.is(right)),
        CompareOp::IsNot => Ok(!left.is(right)),
        CompareOp::In => contains(right, left),
        CompareOp::NotIn => contains(right, left).map(|found| !found),
        CompareOp::ExceptionMatch => exception_matches(left, right),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = partial_order(left, right).ok_or_else(|| {
                Fault::unsupported(format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            Ok(match ordering {
                // NaN compares false every way
                None => false,
                Some(ordering) => match op {
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            })
        }
    }
}

/// Ordering between two values; the outer `None` means the types are not orderable
fn partial_order(left: &Value, right: &Value) -> Option<Option<Ordering>> {
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return Some(Some(a.cmp(&b)));
    }
    if is_numeric(left) && is_numeric(right) {
        let (a, b) = (left.as_float()?, right.as_float()?);
        return Some(a.partial_cmp(&b));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => sequence_order(a, b),
        (Value::List(a), Value::List(b)) => {
            let ids = [Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize];
            // A list that loops back on itself has no order
            visit(&ids, || {
                let a = a.lock().clone();
                let b = b.lock().clone();
                sequence_order(&a, &b)
            })
            .flatten()
        }
        _ => None,
    }
}

fn sequence_order(a: &[Value], b: &[Value]) -> Option<Option<Ordering>> {
    for (x, y) in a.iter().zip(b.iter()) {
        if x != y {
            return partial_order(x, y);
        }
    }
    Some(Some(a.len().cmp(&b.len())))
}

fn contains(container: &Value, needle: &Value) -> VmResult<bool> {
    match container {
        Value::Tuple(items) => Ok(items.iter().any(|item| item == needle)),
        Value::List(items) => {
            let items = items.lock().clone();
            Ok(items.iter().any(|item| item == needle))
        }
        Value::Dict(pairs) => {
            let pairs = pairs.lock().clone();
            Ok(pairs.iter().any(|(key, _)| key == needle))
        }
        Value::Str(haystack) => match needle {
            Value::Str(sub) => Ok(haystack.contains(&**sub)),
            other => Err(Fault::unsupported(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        other => Err(Fault::unsupported(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// COMPARE_OP 10: does the raised value match an `except` clause
fn exception_matches(raised: &Value, clause: &Value) -> VmResult<bool> {
    let raised_type = match raised {
        Value::ExceptionType(t) => *t,
        Value::Exception(fault) => fault.exc_type,
        _ => return Ok(false),
    };
    match clause {
        Value::ExceptionType(t) => Ok(raised_type.is_subclass_of(*t)),
        Value::Tuple(types) => {
            for t in types.iter() {
                if exception_matches(raised, t)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(Fault::unsupported(format!(
            "catching '{}' that does not inherit from Exception is not allowed",
            other.type_name()
        ))),
    }
}

fn no_attribute(target: &Value, name: &str) -> Fault {
    Fault::attribute_error(format!(
        "'{}' object has no attribute '{}'",
        target.type_name(),
        name
    ))
}

fn get_attr(target: &Value, name: &str) -> VmResult<Value> {
    match (target, name) {
        (Value::Exception(fault), "args") => Ok(Value::tuple(vec![Value::str(&fault.message)])),
        (Value::Exception(fault), "message") => Ok(Value::str(&fault.message)),
        (Value::Function(func), "__name__") => Ok(Value::Str(func.name.clone())),
        (Value::Function(func), "__defaults__") => Ok(Value::tuple(func.defaults.clone())),
        (Value::Native(native), "__name__") => Ok(Value::str(native.name)),
        (Value::Code(code), "co_name") => Ok(Value::Str(code.name.clone())),
        (Value::ExceptionType(t), "__name__") => Ok(Value::str(t.name())),
        _ => Err(no_attribute(target, name)),
    }
}

fn normalize_index(index: &Value, len: usize, kind: &str) -> VmResult<usize> {
    let raw = index.as_int().ok_or_else(|| {
        Fault::unsupported(format!(
            "{} indices must be integers, not {}",
            kind,
            index.type_name()
        ))
    })?;
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    if resolved < 0 || resolved >= len as i64 {
        return Err(Fault::index_error(format!("{} index out of range", kind)));
    }
    Ok(resolved as usize)
}

fn get_item(target: &Value, key: &Value) -> VmResult<Value> {
    match target {
        Value::List(items) => {
            let items = items.lock();
            let index = normalize_index(key, items.len(), "list")?;
            Ok(items[index].clone())
        }
        Value::Tuple(items) => {
            let index = normalize_index(key, items.len(), "tuple")?;
            Ok(items[index].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let index = normalize_index(key, chars.len(), "string")?;
            Ok(Value::Str(Arc::from(chars[index].to_string())))
        }
        Value::Dict(pairs) => {
            // Keys are compared on a snapshot so a key holding this dict cannot relock it
            let pairs = pairs.lock().clone();
            pairs
                .into_iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| Fault::key_error(key.repr()))
        }
        other => Err(Fault::unsupported(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn set_item(target: &Value, key: Value, value: Value) -> VmResult<()> {
    match target {
        Value::List(items) => {
            let mut items = items.lock();
            let index = normalize_index(&key, items.len(), "list")?;
            items[index] = value;
            Ok(())
        }
        Value::Dict(pairs) => {
            let snapshot = pairs.lock().clone();
            let index = snapshot.iter().position(|(k, _)| *k == key);
            let mut pairs = pairs.lock();
            match index.and_then(|i| pairs.get_mut(i)) {
                Some(slot) => slot.1 = value,
                None => pairs.push((key, value)),
            }
            Ok(())
        }
        other => Err(Fault::unsupported(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn iter(value: &Value) -> VmResult<Value> {
    let items = match value {
        Value::Iterator(_) => return Ok(value.clone()),
        Value::List(items) => items.lock().clone(),
        Value::Tuple(items) => items.to_vec(),
        Value::Dict(pairs) => pairs.lock().iter().map(|(k, _)| k.clone()).collect(),
        Value::Str(s) => s.chars().map(|c| Value::Str(Arc::from(c.to_string()))).collect(),
        other => {
            return Err(Fault::unsupported(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    };
    Ok(Value::Iterator(Arc::new(Mutex::new(SeqIter::new(items)))))
}

/// Exception type of a raised value, if it is an exception or exception type
pub fn exception_type_of(value: &Value) -> Option<ExcType> {
    match value {
        Value::ExceptionType(t) => Some(*t),
        Value::Exception(fault) => Some(fault.exc_type),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    fn bin(op: BinaryOp, a: Value, b: Value) -> VmResult<Value> {
        StandardModel.binary(op, &a, &b)
    }

    fn looped_list() -> Value {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.lock().push(list.clone());
        }
        list
    }

    #[test]
    fn test_self_containing_lists_terminate() {
        let (a, b) = (looped_list(), looped_list());
        let err = compare(CompareOp::Lt, &a, &b).unwrap_err();
        assert_eq!(err.kind, FaultKind::UnsupportedOperation);
        assert!(compare(CompareOp::Le, &a, &a).unwrap());
        assert!(compare(CompareOp::In, &a, &a).unwrap());
        assert!(!compare(CompareOp::Eq, &a, &b).unwrap());

        let dict = Value::Dict(Arc::new(Mutex::new(Vec::new())));
        set_item(&dict, a.clone(), Value::Int(7)).unwrap();
        set_item(&dict, a.clone(), Value::Int(8)).unwrap();
        assert_eq!(get_item(&dict, &a).unwrap(), Value::Int(8));
        assert_eq!(get_item(&dict, &b).unwrap_err().kind, FaultKind::Lookup);
    }

    #[test]
    fn test_floor_division_and_modulo_round_down() {
        assert_eq!(bin(BinaryOp::FloorDiv, Value::Int(-7), Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(bin(BinaryOp::Mod, Value::Int(-7), Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(bin(BinaryOp::Mod, Value::Int(7), Value::Int(-2)).unwrap(), Value::Int(-1));
        assert_eq!(
            bin(BinaryOp::FloorDiv, Value::Float(7.0), Value::Int(2)).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = bin(BinaryOp::TrueDiv, Value::Int(1), Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, FaultKind::Arithmetic);
        assert_eq!(err.exc_type, ExcType::ZeroDivisionError);
    }

    #[test]
    fn test_checked_overflow() {
        let err = bin(BinaryOp::Mul, Value::Int(i64::MAX), Value::Int(2)).unwrap_err();
        assert_eq!(err.exc_type, ExcType::OverflowError);
        let err = bin(BinaryOp::Lshift, Value::Int(1), Value::Int(64)).unwrap_err();
        assert_eq!(err.exc_type, ExcType::OverflowError);
    }

    #[test]
    fn test_mixed_types_and_sequences() {
        assert_eq!(bin(BinaryOp::Add, Value::Int(1), Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(bin(BinaryOp::Add, Value::str("ab"), Value::str("c")).unwrap(), Value::str("abc"));
        assert_eq!(bin(BinaryOp::Mul, Value::str("ab"), Value::Int(2)).unwrap(), Value::str("abab"));
        assert_eq!(bin(BinaryOp::Pow, Value::Int(2), Value::Int(-1)).unwrap(), Value::Float(0.5));
        assert_eq!(bin(BinaryOp::And, Value::Bool(true), Value::Bool(false)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_unsupported_operands() {
        let err = bin(BinaryOp::Add, Value::Int(1), Value::str("x")).unwrap_err();
        assert_eq!(err.kind, FaultKind::UnsupportedOperation);
        assert!(err.message.contains("'int' and 'str'"));
    }

    #[test]
    fn test_binary_op_arg_table() {
        assert_eq!(BinaryOp::for_binary_op_arg(0), Some(BinaryOp::Add));
        assert_eq!(BinaryOp::for_binary_op_arg(10), Some(BinaryOp::Sub));
        assert_eq!(BinaryOp::for_binary_op_arg(13), Some(BinaryOp::Add));
        assert_eq!(BinaryOp::for_binary_op_arg(23), Some(BinaryOp::Sub));
        assert_eq!(BinaryOp::for_binary_op_arg(26), None);
    }

    #[test]
    fn test_comparisons() {
        let cmp = |op, a: Value, b: Value| compare(op, &a, &b).unwrap();
        assert!(cmp(CompareOp::Lt, Value::Int(1), Value::Float(1.5)));
        assert!(cmp(CompareOp::Ge, Value::str("b"), Value::str("a")));
        assert!(cmp(CompareOp::In, Value::Int(2), Value::list(vec![Value::Int(1), Value::Int(2)])));
        assert!(cmp(CompareOp::NotIn, Value::str("z"), Value::str("abc")));
        assert!(!cmp(CompareOp::Lt, Value::Float(f64::NAN), Value::Float(1.0)));
        assert!(compare(CompareOp::Lt, &Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn test_exception_match_follows_hierarchy() {
        let raised = Value::Exception(Arc::new(Fault::unbound_local("x")));
        assert!(compare(CompareOp::ExceptionMatch, &raised, &Value::ExceptionType(ExcType::NameError)).unwrap());
        let clause = Value::tuple(vec![
            Value::ExceptionType(ExcType::TypeError),
            Value::ExceptionType(ExcType::Exception),
        ]);
        assert!(compare(CompareOp::ExceptionMatch, &raised, &clause).unwrap());
        assert!(!compare(
            CompareOp::ExceptionMatch,
            &raised,
            &Value::ExceptionType(ExcType::TypeError)
        )
        .unwrap());
    }

    #[test]
    fn test_items_and_iteration() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(StandardModel.get_item(&list, &Value::Int(-1)).unwrap(), Value::Int(2));
        StandardModel.set_item(&list, Value::Int(0), Value::Int(9)).unwrap();
        let iterator = StandardModel.iter(&list).unwrap();
        assert_eq!(StandardModel.next(&iterator).unwrap(), Some(Value::Int(9)));
        assert_eq!(StandardModel.next(&iterator).unwrap(), Some(Value::Int(2)));
        assert_eq!(StandardModel.next(&iterator).unwrap(), None);

        let err = StandardModel.get_item(&list, &Value::Int(5)).unwrap_err();
        assert_eq!(err.exc_type, ExcType::IndexError);
        let dict = Value::Dict(Arc::new(Mutex::new(Vec::new())));
        let err = StandardModel.get_item(&dict, &Value::str("k")).unwrap_err();
        assert_eq!(err.exc_type, ExcType::KeyError);
    }

    #[test]
    fn test_unary() {
        assert_eq!(StandardModel.unary(UnaryOp::Negative, &Value::Int(3)).unwrap(), Value::Int(-3));
        assert_eq!(StandardModel.unary(UnaryOp::Not, &Value::list(vec![])).unwrap(), Value::Bool(true));
        assert_eq!(StandardModel.unary(UnaryOp::Invert, &Value::Int(0)).unwrap(), Value::Int(-1));
        assert!(StandardModel.unary(UnaryOp::Negative, &Value::str("a")).is_err());
    }
}
