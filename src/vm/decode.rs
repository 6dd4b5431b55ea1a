// Stack VM Instruction Decoder
// Reads one instruction at a frame's instruction pointer and resolves its operand

use crate::bytecode::{InstructionSet, Opcode, OperandKind};
use crate::error::{Fault, VmResult};
use crate::vm::frame::Frame;
use crate::vm::value::Value;
use std::sync::Arc;

/// A resolved operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Const(Value),
    Name(Arc<str>),
    Local(Arc<str>),
    /// Index into the frame's cells
    Free(usize),
    LocalPair(Arc<str>, Arc<str>),
    /// Absolute instruction offset
    Target(usize),
    Raw(u32),
}

/// A decoded instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    pub offset: usize,
    pub byte: u8,
    /// `None` for bytes the frame's instruction set does not define
    pub opcode: Option<Opcode>,
    pub operand: Operand,
}

fn operand_mismatch(expected: &str, found: &Operand) -> Fault {
    Fault::decode(format!("expected {} operand, found {:?}", expected, found))
}

impl Operand {
    pub fn constant(&self) -> VmResult<Value> {
        match self {
            Operand::Const(value) => Ok(value.clone()),
            other => Err(operand_mismatch("constant", other)),
        }
    }

    pub fn name(&self) -> VmResult<&Arc<str>> {
        match self {
            Operand::Name(name) => Ok(name),
            other => Err(operand_mismatch("name", other)),
        }
    }

    pub fn local(&self) -> VmResult<&Arc<str>> {
        match self {
            Operand::Local(name) => Ok(name),
            other => Err(operand_mismatch("local", other)),
        }
    }

    pub fn free(&self) -> VmResult<usize> {
        match self {
            Operand::Free(index) => Ok(*index),
            other => Err(operand_mismatch("closure", other)),
        }
    }

    pub fn local_pair(&self) -> VmResult<(&Arc<str>, &Arc<str>)> {
        match self {
            Operand::LocalPair(first, second) => Ok((first, second)),
            other => Err(operand_mismatch("local pair", other)),
        }
    }

    pub fn target(&self) -> VmResult<usize> {
        match self {
            Operand::Target(target) => Ok(*target),
            other => Err(operand_mismatch("jump", other)),
        }
    }

    pub fn raw(&self) -> VmResult<u32> {
        match self {
            Operand::Raw(value) => Ok(*value),
            other => Err(operand_mismatch("integer", other)),
        }
    }
}

fn table_entry(table: &[Arc<str>], index: u32, what: &str, unit: &str) -> VmResult<Arc<str>> {
    table.get(index as usize).cloned().ok_or_else(|| {
        Fault::decode(format!(
            "{} index {} out of range in '{}'",
            what, index, unit
        ))
    })
}

impl Frame {
    /// Decode the instruction at `ip` and advance past it.
    ///
    /// Past the end of the stream this yields a synthetic RETURN_VALUE. A trailing operand that
    /// is cut short consumes the remaining bytes and reads as `Raw(0)`.
    pub fn decode(&mut self) -> VmResult<Instruction> {
        let code = self.code.clone();
        let bytes = &code.code;
        let offset = self.ip;
        self.last_offset = offset;

        if offset >= bytes.len() {
            return Ok(Instruction {
                offset,
                byte: code.instruction_set.encode(Opcode::ReturnValue).unwrap_or_default(),
                opcode: Some(Opcode::ReturnValue),
                operand: Operand::None,
            });
        }

        let set = code.instruction_set;
        let (byte, raw, complete) = match set {
            InstructionSet::Classic => {
                let byte = bytes[self.ip];
                self.ip += 1;
                if !set.has_operand(byte) {
                    (byte, None, true)
                } else if self.ip + 2 <= bytes.len() {
                    let value = u32::from(bytes[self.ip]) | (u32::from(bytes[self.ip + 1]) << 8);
                    self.ip += 2;
                    (byte, Some(value), true)
                } else {
                    self.ip = bytes.len();
                    (byte, Some(0), false)
                }
            }
            InstructionSet::Wordcode => {
                let mut extended: u32 = 0;
                loop {
                    let byte = bytes[self.ip];
                    let Some(&arg) = bytes.get(self.ip + 1) else {
                        self.ip = bytes.len();
                        break (byte, Some(0), false);
                    };
                    self.ip += 2;
                    if set.opcode(byte) == Some(Opcode::ExtendedArg) {
                        extended = (extended | u32::from(arg)) << 8;
                        if self.ip >= bytes.len() {
                            // Dangling prefix: nothing left to extend
                            break (byte, Some(0), false);
                        }
                        continue;
                    }
                    break (byte, Some(extended | u32::from(arg)), true);
                }
            }
        };

        let opcode = set.opcode(byte);
        let operand = match (opcode, raw) {
            (_, None) => Operand::None,
            (None, Some(value)) => Operand::Raw(value),
            (Some(_), Some(_)) if !complete => Operand::Raw(0),
            (Some(op), Some(value)) => self.resolve(op, value)?,
        };

        Ok(Instruction {
            offset,
            byte,
            opcode,
            operand,
        })
    }

    fn resolve(&self, op: Opcode, value: u32) -> VmResult<Operand> {
        let code = &self.code;
        Ok(match op.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::Const => {
                let constant = code.constants.get(value as usize).ok_or_else(|| {
                    Fault::decode(format!(
                        "constant index {} out of range in '{}'",
                        value, code.name
                    ))
                })?;
                Operand::Const(Value::from(constant))
            }
            OperandKind::Name => Operand::Name(table_entry(&code.names, value, "name", &code.name)?),
            OperandKind::Local => {
                Operand::Local(table_entry(&code.varnames, value, "local", &code.name)?)
            }
            OperandKind::Free => {
                if value as usize >= code.cellvars.len() + code.freevars.len() {
                    return Err(Fault::decode(format!(
                        "closure index {} out of range in '{}'",
                        value, code.name
                    )));
                }
                Operand::Free(value as usize)
            }
            OperandKind::LocalPair => Operand::LocalPair(
                table_entry(&code.varnames, value >> 4, "local", &code.name)?,
                table_entry(&code.varnames, value & 0xF, "local", &code.name)?,
            ),
            OperandKind::RelativeJump => Operand::Target(self.ip + value as usize),
            OperandKind::AbsoluteJump => Operand::Target(value as usize),
            OperandKind::Raw => Operand::Raw(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CodeUnit, Constant};
    use crate::error::FaultKind;
    use crate::vm::value::new_scope;

    fn frame_for(code: CodeUnit) -> Frame {
        Frame::new(Arc::new(code), new_scope(), new_scope(), new_scope())
    }

    #[test]
    fn test_classic_decoding_resolves_operands() {
        let mut b = CodeBuilder::with_params("f", &["a"]);
        let end = b.label();
        b.load_const(7i64)
            .local(Opcode::LoadFast, "a")
            .jump(Opcode::JumpForward, end)
            .op(Opcode::Nop)
            .bind(end)
            .op(Opcode::ReturnValue);
        let mut frame = frame_for(b.build().unwrap());

        let first = frame.decode().unwrap();
        assert_eq!(first.opcode, Some(Opcode::LoadConst));
        assert_eq!(first.operand, Operand::Const(Value::Int(7)));
        assert_eq!(frame.ip, 3);

        let second = frame.decode().unwrap();
        assert_eq!(second.operand, Operand::Local(Arc::from("a")));

        let jump = frame.decode().unwrap();
        assert_eq!(jump.offset, 6);
        assert_eq!(jump.operand, Operand::Target(10));
    }

    #[test]
    fn test_end_of_stream_yields_return() {
        let mut frame = frame_for(CodeUnit::new("f", Vec::new()));
        let ins = frame.decode().unwrap();
        assert_eq!(ins.opcode, Some(Opcode::ReturnValue));
        assert_eq!(frame.ip, 0);
    }

    #[test]
    fn test_short_operand_degrades_to_zero() {
        let mut frame = frame_for(CodeUnit::new("f", vec![100, 5]));
        let ins = frame.decode().unwrap();
        assert_eq!(ins.opcode, Some(Opcode::LoadConst));
        assert_eq!(ins.operand, Operand::Raw(0));
        assert_eq!(frame.ip, 2);
        assert_eq!(ins.operand.constant().unwrap_err().kind, FaultKind::Decode);
    }

    #[test]
    fn test_out_of_range_indices_are_decode_faults() {
        let mut frame = frame_for(CodeUnit::new("f", vec![100, 3, 0]));
        assert_eq!(frame.decode().unwrap_err().kind, FaultKind::Decode);
        let mut frame = frame_for(CodeUnit::new("f", vec![101, 0, 0]));
        assert_eq!(frame.decode().unwrap_err().kind, FaultKind::Decode);
    }

    #[test]
    fn test_unknown_opcode_passes_raw_operand() {
        let mut frame = frame_for(CodeUnit::new("f", vec![250, 1, 2, 7]));
        let ins = frame.decode().unwrap();
        assert_eq!(ins.opcode, None);
        assert_eq!(ins.operand, Operand::Raw(0x0201));
        let ins = frame.decode().unwrap();
        assert_eq!((ins.byte, ins.opcode), (7, None));
        assert_eq!(ins.operand, Operand::None);
    }

    #[test]
    fn test_wordcode_extended_args_accumulate() {
        let mut unit = CodeUnit::new("f", vec![144, 1, 144, 0, 113, 2, 156, 0]);
        unit.instruction_set = crate::bytecode::InstructionSet::Wordcode;
        let mut frame = frame_for(unit);
        let ins = frame.decode().unwrap();
        assert_eq!(ins.opcode, Some(Opcode::JumpAbsolute));
        assert_eq!(ins.offset, 0);
        assert_eq!(ins.operand, Operand::Target(0x010002));
        assert_eq!(frame.ip, 6);
        let ins = frame.decode().unwrap();
        assert_eq!(ins.opcode, Some(Opcode::BinaryOp));
        assert_eq!(ins.operand, Operand::Raw(0));
    }

    #[test]
    fn test_wordcode_local_pair() {
        let mut unit = CodeUnit::new("f", vec![172, 0x10]);
        unit.instruction_set = crate::bytecode::InstructionSet::Wordcode;
        unit.varnames = vec!["x".into(), "y".into()];
        unit.constants.push(Constant::None);
        let mut frame = frame_for(unit);
        let ins = frame.decode().unwrap();
        assert_eq!(ins.operand, Operand::LocalPair(Arc::from("y"), Arc::from("x")));
    }
}
