// Stack VM Code Builder
// Assembles code units with symbolic labels, for hosts that generate code and for tests

use super::opcode::{InstructionSet, Opcode, OperandKind};
use super::unit::{CodeUnit, Constant};
use std::sync::Arc;

/// Errors detected while assembling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("{op} is not part of the {set} instruction set")]
    Unsupported { op: &'static str, set: &'static str },
    #[error("operand {value} does not fit {op}")]
    OperandTooLarge { op: &'static str, value: u32 },
    #[error("label {0} was never bound")]
    UnboundLabel(usize),
    #[error("{op} cannot jump backwards to @{target}")]
    BackwardJump { op: &'static str, target: usize },
    #[error("'{0}' is neither a cell nor a free variable")]
    UnknownClosureName(String),
}

/// A jump target that may be bound after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct Fixup {
    op: Opcode,
    label: Label,
    /// Positions of the operand bytes, low byte first
    low: usize,
    high: usize,
    /// Instruction pointer after the jump has been read
    after: usize,
}

/// Incremental assembler for a single code unit
pub struct CodeBuilder {
    unit: CodeUnit,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    error: Option<BuildError>,
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Constant::Int(value)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Constant::Float(value)
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Constant::Bool(value)
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Constant::Str(value.into())
    }
}

impl From<CodeUnit> for Constant {
    fn from(value: CodeUnit) -> Self {
        Constant::Code(Arc::new(value))
    }
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            unit: CodeUnit::new(name, Vec::new()),
            labels: Vec::new(),
            fixups: Vec::new(),
            error: None,
        }
    }

    /// Builder for a function body whose leading locals are `params`
    pub fn with_params(name: &str, params: &[&str]) -> Self {
        let mut builder = Self::new(name);
        builder.unit.varnames = params.iter().map(|p| Arc::from(*p)).collect();
        builder.unit.argcount = params.len();
        builder
    }

    pub fn instruction_set(&mut self, set: InstructionSet) -> &mut Self {
        self.unit.instruction_set = set;
        self
    }

    pub fn cellvars(&mut self, names: &[&str]) -> &mut Self {
        self.unit.cellvars = names.iter().map(|n| Arc::from(*n)).collect();
        self
    }

    pub fn freevars(&mut self, names: &[&str]) -> &mut Self {
        self.unit.freevars = names.iter().map(|n| Arc::from(*n)).collect();
        self
    }

    /// Current code offset
    pub fn offset(&self) -> usize {
        self.unit.code.len()
    }

    /// Add a constant and return its index
    pub fn constant(&mut self, constant: impl Into<Constant>) -> u32 {
        self.unit.constants.push(constant.into());
        (self.unit.constants.len() - 1) as u32
    }

    /// Emit an instruction without an operand
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(op, 0);
        self
    }

    /// Emit an instruction with a raw operand
    pub fn op_arg(&mut self, op: Opcode, arg: u32) -> &mut Self {
        self.emit(op, arg);
        self
    }

    pub fn load_const(&mut self, constant: impl Into<Constant>) -> &mut Self {
        let index = self.constant(constant);
        self.op_arg(Opcode::LoadConst, index)
    }

    /// Emit a name-table instruction, interning `name`
    pub fn name(&mut self, op: Opcode, name: &str) -> &mut Self {
        let index = intern(&mut self.unit.names, name);
        self.op_arg(op, index)
    }

    /// Emit a local-variable instruction, interning `name`
    pub fn local(&mut self, op: Opcode, name: &str) -> &mut Self {
        let index = intern(&mut self.unit.varnames, name);
        self.op_arg(op, index)
    }

    /// Emit a wordcode LOAD_FAST_LOAD_FAST for two locals
    pub fn local_pair(&mut self, first: &str, second: &str) -> &mut Self {
        let high = intern(&mut self.unit.varnames, first);
        let low = intern(&mut self.unit.varnames, second);
        if high > 0xF || low > 0xF {
            self.fail(BuildError::OperandTooLarge {
                op: Opcode::LoadFastLoadFast.name(),
                value: high.max(low),
            });
            return self;
        }
        self.op_arg(Opcode::LoadFastLoadFast, (high << 4) | low)
    }

    /// Emit a closure instruction referring to a declared cell or free variable
    pub fn closure(&mut self, op: Opcode, name: &str) -> &mut Self {
        let cells = &self.unit.cellvars;
        let frees = &self.unit.freevars;
        let index = cells
            .iter()
            .position(|n| &**n == name)
            .or_else(|| frees.iter().position(|n| &**n == name).map(|i| i + cells.len()));
        match index {
            Some(index) => self.op_arg(op, index as u32),
            None => {
                self.fail(BuildError::UnknownClosureName(name.to_string()));
                self
            }
        }
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.offset());
        self
    }

    /// Emit a jump-class instruction whose target is `label`
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        if !self.check_supported(op) {
            return self;
        }
        let set = self.unit.instruction_set;
        let code = &mut self.unit.code;
        let byte = set.encode(op).unwrap_or_default();
        let (low, high) = match set {
            InstructionSet::Classic => {
                code.extend_from_slice(&[byte, 0, 0]);
                (code.len() - 2, code.len() - 1)
            }
            InstructionSet::Wordcode => {
                let prefix = set.encode(Opcode::ExtendedArg).unwrap_or_default();
                code.extend_from_slice(&[prefix, 0, byte, 0]);
                (code.len() - 1, code.len() - 3)
            }
        };
        let after = code.len();
        self.fixups.push(Fixup {
            op,
            label,
            low,
            high,
            after,
        });
        self
    }

    /// Finish assembly, resolving every label reference
    pub fn build(mut self) -> Result<CodeUnit, BuildError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or(BuildError::UnboundLabel(fixup.label.0))?;
            let value = match fixup.op.operand_kind() {
                OperandKind::RelativeJump => {
                    target
                        .checked_sub(fixup.after)
                        .ok_or(BuildError::BackwardJump {
                            op: fixup.op.name(),
                            target,
                        })?
                }
                _ => target,
            };
            if value > 0xFFFF {
                return Err(BuildError::OperandTooLarge {
                    op: fixup.op.name(),
                    value: value as u32,
                });
            }
            self.unit.code[fixup.low] = (value & 0xFF) as u8;
            self.unit.code[fixup.high] = (value >> 8) as u8;
        }

        Ok(self.unit)
    }

    fn emit(&mut self, op: Opcode, arg: u32) {
        if !self.check_supported(op) {
            return;
        }
        let set = self.unit.instruction_set;
        let byte = set.encode(op).unwrap_or_default();
        match set {
            InstructionSet::Classic => {
                self.unit.code.push(byte);
                if set.has_operand(byte) {
                    if arg > 0xFFFF {
                        self.fail(BuildError::OperandTooLarge { op: op.name(), value: arg });
                        return;
                    }
                    self.unit.code.extend_from_slice(&[(arg & 0xFF) as u8, (arg >> 8) as u8]);
                }
            }
            InstructionSet::Wordcode => {
                let prefix = set.encode(Opcode::ExtendedArg).unwrap_or_default();
                let mut started = false;
                for shift in [24u32, 16, 8] {
                    let part = ((arg >> shift) & 0xFF) as u8;
                    if started || part != 0 {
                        started = true;
                        self.unit.code.extend_from_slice(&[prefix, part]);
                    }
                }
                self.unit.code.extend_from_slice(&[byte, (arg & 0xFF) as u8]);
            }
        }
    }

    fn check_supported(&mut self, op: Opcode) -> bool {
        let set = self.unit.instruction_set;
        if set.encode(op).is_none() {
            self.fail(BuildError::Unsupported {
                op: op.name(),
                set: set.name(),
            });
            return false;
        }
        true
    }

    fn fail(&mut self, error: BuildError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

fn intern(table: &mut Vec<Arc<str>>, name: &str) -> u32 {
    if let Some(index) = table.iter().position(|n| &**n == name) {
        return index as u32;
    }
    table.push(Arc::from(name));
    (table.len() - 1) as u32
}
