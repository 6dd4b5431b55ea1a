// Stack VM Block-Stack Unwinder
// Routes return/break/continue/exception signals to the blocks that consume them

use crate::error::{ExcType, Fault};
use crate::vm::frame::{Block, BlockKind, Frame};
use crate::vm::value::Value;
use std::sync::Arc;

/// An unwind directive produced by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Return,
    Break,
    /// Carries the loop's condition-check offset
    Continue(usize),
    Exception,
}

/// Interpreter registers shared by the dispatch engine and the unwinder
#[derive(Default)]
pub struct Registers {
    /// The fault currently propagating or most recently raised
    pub last_fault: Option<Arc<Fault>>,
    /// The fault whose handler body is running
    pub handled: Option<Arc<Fault>>,
    /// Value carried by a pending `return`
    pub return_value: Value,
}

impl Registers {
    /// The `(traceback, value, type)` triple for a fault, pushed type-last
    fn fault_triple(fault: Option<&Arc<Fault>>) -> [Value; 3] {
        match fault {
            Some(fault) => [
                Value::Traceback(Arc::from(fault.traceback.clone())),
                Value::Exception(fault.clone()),
                Value::ExceptionType(fault.exc_type),
            ],
            None => [Value::None, Value::None, Value::None],
        }
    }
}

/// Drive `signal` through the frame's block stack.
///
/// Returns `None` once a block consumes the signal, or the signal itself when the block stack
/// runs out and it must leave the frame.
pub fn unwind(frame: &mut Frame, regs: &mut Registers, signal: Signal) -> Option<Signal> {
    while let Some(block) = frame.blocks.last().copied() {
        // Loops stay in place on continue so their iterator survives
        if let (BlockKind::Loop, Signal::Continue(target)) = (block.kind, signal) {
            frame.ip = target;
            return None;
        }

        frame.blocks.pop();
        unwind_block(frame, regs, block, signal == Signal::Exception);

        match (block.kind, signal) {
            (BlockKind::Loop, Signal::Break) => {
                frame.ip = block.handler;
                return None;
            }
            (BlockKind::ExceptGuard | BlockKind::Finally, Signal::Exception) => {
                enter_handler(frame, regs, block);
                return None;
            }
            (BlockKind::Finally, Signal::Return) => {
                frame.stack.push(std::mem::take(&mut regs.return_value));
                frame.stack.push(Value::Signal(signal));
                frame.ip = block.handler;
                return None;
            }
            (BlockKind::Finally, Signal::Continue(target)) => {
                frame.stack.push(Value::Int(target as i64));
                frame.stack.push(Value::Signal(signal));
                frame.ip = block.handler;
                return None;
            }
            (BlockKind::Finally, Signal::Break) => {
                frame.stack.push(Value::Signal(signal));
                frame.ip = block.handler;
                return None;
            }
            _ => {}
        }
    }
    Some(signal)
}

/// Truncate the operand stack to a popped block's level.
///
/// Leaving an exception handler also restores the fault that was being handled before it; unless
/// an exception is propagating, that restored fault becomes `last_fault` again.
pub fn unwind_block(frame: &mut Frame, regs: &mut Registers, block: Block, exception: bool) {
    if block.kind == BlockKind::ExceptHandler {
        frame.stack.truncate(block.level + 3);
        // Restore triple is type-last: pop type, then value, then traceback
        frame.stack.pop();
        let previous = frame.stack.pop();
        frame.stack.pop();
        regs.handled = match previous {
            Some(Value::Exception(fault)) => Some(fault),
            _ => None,
        };
        if !exception {
            regs.last_fault = regs.handled.clone();
        }
    } else {
        frame.stack.truncate(block.level);
    }
}

fn enter_handler(frame: &mut Frame, regs: &mut Registers, block: Block) {
    let current = regs.last_fault.clone().unwrap_or_else(|| {
        Arc::new(Fault::raised(
            ExcType::RuntimeError,
            "exception signal without an active fault",
        ))
    });

    frame.push_block(BlockKind::ExceptHandler, block.handler);
    frame
        .stack
        .extend(Registers::fault_triple(regs.handled.as_ref()));
    frame
        .stack
        .extend(Registers::fault_triple(Some(&current)));
    regs.handled = Some(current);
    frame.ip = block.handler;
}
