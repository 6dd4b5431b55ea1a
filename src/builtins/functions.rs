// Native functions: range, len, abs, min, max

use crate::error::{Fault, VmResult};
use crate::vm::ops::{compare, CompareOp, StandardModel, ValueModel};
use crate::vm::value::Value;

const RANGE_LIMIT: i64 = 10_000_000;

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> VmResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else {
            format!("from {} to {}", min, max)
        };
        return Err(Fault::call_arity(format!(
            "{}() takes {} argument{} ({} given)",
            name,
            expected,
            if max == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn get_int(args: &[Value], idx: usize, name: &str) -> VmResult<i64> {
    args[idx].as_int().ok_or_else(|| {
        Fault::unsupported(format!(
            "{}() argument must be an integer, not '{}'",
            name,
            args[idx].type_name()
        ))
    })
}

/// `range(stop)` or `range(start, stop[, step])`, materialized as a list
pub fn range(args: &[Value]) -> VmResult<Value> {
    expect_args("range", args, 1, 3)?;
    let (start, stop, step) = match args.len() {
        1 => (0, get_int(args, 0, "range")?, 1),
        2 => (get_int(args, 0, "range")?, get_int(args, 1, "range")?, 1),
        _ => (
            get_int(args, 0, "range")?,
            get_int(args, 1, "range")?,
            get_int(args, 2, "range")?,
        ),
    };
    if step == 0 {
        return Err(Fault::value_error("range() arg 3 must not be zero"));
    }

    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    let count = if span <= 0 {
        0
    } else {
        (span - 1) / step.saturating_abs() + 1
    };
    if count > RANGE_LIMIT {
        return Err(Fault::overflow(format!("range of {} items is too large", count)));
    }

    let items = (0..count).map(|i| Value::Int(start + i * step)).collect();
    Ok(Value::list(items))
}

pub fn len(args: &[Value]) -> VmResult<Value> {
    expect_args("len", args, 1, 1)?;
    let length = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.lock().len(),
        Value::Dict(pairs) => pairs.lock().len(),
        other => {
            return Err(Fault::unsupported(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(length as i64))
}

pub fn abs(args: &[Value]) -> VmResult<Value> {
    expect_args("abs", args, 1, 1)?;
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => match other.as_int() {
            Some(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Fault::overflow("integer overflow")),
            None => Err(Fault::unsupported(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        },
    }
}

pub fn min(args: &[Value]) -> VmResult<Value> {
    extreme("min", args, CompareOp::Lt)
}

pub fn max(args: &[Value]) -> VmResult<Value> {
    extreme("max", args, CompareOp::Gt)
}

/// Shared body of min/max: a single iterable argument, or the arguments themselves
fn extreme(name: &str, args: &[Value], better: CompareOp) -> VmResult<Value> {
    if args.is_empty() {
        return Err(Fault::call_arity(format!(
            "{} expected at least 1 argument, got 0",
            name
        )));
    }

    let candidates = if args.len() == 1 {
        let model = StandardModel;
        let iterator = model.iter(&args[0])?;
        let mut items = Vec::new();
        while let Some(item) = model.next(&iterator)? {
            items.push(item);
        }
        items
    } else {
        args.to_vec()
    };

    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = Some(match best {
            Some(current) if !compare(better, &candidate, &current)? => current,
            _ => candidate,
        });
    }
    best.ok_or_else(|| Fault::value_error(format!("{}() arg is an empty sequence", name)))
}
