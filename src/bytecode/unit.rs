// Stack VM Code Units
// Instruction stream, constant pool and name tables supplied by a program loader

use super::opcode::{InstructionSet, OperandKind};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;

/// Errors raised while loading a code unit
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("malformed code unit: {0}")]
    Json(#[from] serde_json::Error),
    #[error("code unit '{name}' declares {argcount} parameters but only {locals} locals")]
    Parameters {
        name: String,
        argcount: usize,
        locals: usize,
    },
}

/// Constant values stored in the constant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Vec<Constant>),
    Code(Arc<CodeUnit>),
}

/// An immutable unit of compiled code, shared read-only by every frame executing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: Arc<str>,
    #[serde(default)]
    pub instruction_set: InstructionSet,
    pub code: Vec<u8>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    /// Names referenced by name-index instructions
    #[serde(default)]
    pub names: Vec<Arc<str>>,
    /// Local variable names; the first `argcount` are the parameters
    #[serde(default)]
    pub varnames: Vec<Arc<str>>,
    /// Locals captured by nested functions
    #[serde(default)]
    pub cellvars: Vec<Arc<str>>,
    /// Variables captured from enclosing scopes
    #[serde(default)]
    pub freevars: Vec<Arc<str>>,
    #[serde(default)]
    pub argcount: usize,
}

impl CodeUnit {
    pub fn new(name: impl Into<Arc<str>>, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            instruction_set: InstructionSet::Classic,
            code,
            constants: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            argcount: 0,
        }
    }

    /// Load a code unit from its JSON form
    pub fn from_json(source: &str) -> Result<Self, LoadError> {
        let unit: CodeUnit = serde_json::from_str(source)?;
        unit.check_parameters()?;
        Ok(unit)
    }

    fn check_parameters(&self) -> Result<(), LoadError> {
        if self.argcount > self.varnames.len() {
            return Err(LoadError::Parameters {
                name: self.name.to_string(),
                argcount: self.argcount,
                locals: self.varnames.len(),
            });
        }
        for constant in &self.constants {
            if let Constant::Code(nested) = constant {
                nested.check_parameters()?;
            }
        }
        Ok(())
    }

    /// Declared parameter names
    pub fn parameters(&self) -> &[Arc<str>] {
        &self.varnames[..self.argcount.min(self.varnames.len())]
    }

    /// Resolve a closure index: cell variables first, then free variables
    pub fn closure_name(&self, index: usize) -> Option<&Arc<str>> {
        if index < self.cellvars.len() {
            self.cellvars.get(index)
        } else {
            self.freevars.get(index - self.cellvars.len())
        }
    }

    /// Disassemble the unit and every nested code constant
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, indent: usize) {
        let prefix = "  ".repeat(indent);
        let _ = writeln!(
            out,
            "{}--- {} ({}, {} bytes, {} constants) ---",
            prefix,
            self.name,
            self.instruction_set.name(),
            self.code.len(),
            self.constants.len()
        );

        let set = self.instruction_set;
        let mut offset = 0;
        while offset < self.code.len() {
            let start = offset;
            let byte = self.code[offset];
            offset += 1;

            let mut arg: Option<u32> = None;
            if set.has_operand(byte) {
                match set {
                    InstructionSet::Classic => {
                        if offset + 2 <= self.code.len() {
                            arg = Some(
                                u32::from(self.code[offset]) | (u32::from(self.code[offset + 1]) << 8),
                            );
                        }
                        offset = (offset + 2).min(self.code.len());
                    }
                    InstructionSet::Wordcode => {
                        arg = self.code.get(offset).map(|b| u32::from(*b));
                        offset = (offset + 1).min(self.code.len());
                    }
                }
            }

            let Some(op) = set.opcode(byte) else {
                let _ = writeln!(out, "{}{:04} <unknown {}>", prefix, start, byte);
                continue;
            };

            let detail = match (op.operand_kind(), arg) {
                (OperandKind::None, _) | (_, None) => String::new(),
                (OperandKind::Const, Some(i)) => match self.constants.get(i as usize) {
                    Some(c) => format_constant(c),
                    None => format!("???[{}]", i),
                },
                (OperandKind::Name, Some(i)) => self.table_entry(&self.names, i),
                (OperandKind::Local, Some(i)) => self.table_entry(&self.varnames, i),
                (OperandKind::Free, Some(i)) => self
                    .closure_name(i as usize)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("???[{}]", i)),
                (OperandKind::LocalPair, Some(i)) => format!(
                    "{}, {}",
                    self.table_entry(&self.varnames, i >> 4),
                    self.table_entry(&self.varnames, i & 0xF)
                ),
                (OperandKind::RelativeJump, Some(i)) => format!("to @{}", offset + i as usize),
                (OperandKind::AbsoluteJump, Some(i)) => format!("@{}", i),
                (OperandKind::Raw, Some(i)) => i.to_string(),
            };

            let _ = writeln!(out, "{}{:04} {:<22}{}", prefix, start, op.name(), detail);
        }

        for constant in &self.constants {
            if let Constant::Code(nested) = constant {
                out.push('\n');
                nested.disassemble_into(out, indent + 1);
            }
        }
    }

    fn table_entry(&self, table: &[Arc<str>], index: u32) -> String {
        table
            .get(index as usize)
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("???[{}]", index))
    }
}

fn format_constant(constant: &Constant) -> String {
    match constant {
        Constant::None => "None".to_string(),
        Constant::Bool(true) => "True".to_string(),
        Constant::Bool(false) => "False".to_string(),
        Constant::Int(i) => i.to_string(),
        Constant::Float(f) => format!("{:?}", f),
        Constant::Str(s) => {
            // Keep listings on one line
            let char_count = s.chars().count();
            if char_count > 32 {
                let truncated: String = s.chars().take(29).collect();
                format!("'{}...'", truncated)
            } else {
                format!("'{}'", s)
            }
        }
        Constant::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(format_constant).collect();
            format!("({})", inner.join(", "))
        }
        Constant::Code(code) => format!("<code {}>", code.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_defaults() {
        let unit = CodeUnit::from_json(
            r#"{"name": "main", "code": [100, 0, 0, 83], "constants": [{"Int": 7}]}"#,
        )
        .unwrap();
        assert_eq!(unit.instruction_set, InstructionSet::Classic);
        assert_eq!(unit.constants, vec![Constant::Int(7)]);
        assert!(unit.varnames.is_empty());
    }

    #[test]
    fn test_from_json_rejects_missing_parameters() {
        let err = CodeUnit::from_json(r#"{"name": "f", "code": [], "argcount": 2, "varnames": ["a"]}"#)
            .unwrap_err();
        assert!(matches!(err, LoadError::Parameters { argcount: 2, locals: 1, .. }));
    }

    #[test]
    fn test_closure_name_spans_cells_then_frees() {
        let mut unit = CodeUnit::new("f", Vec::new());
        unit.cellvars = vec!["a".into()];
        unit.freevars = vec!["b".into(), "c".into()];
        assert_eq!(unit.closure_name(0).map(|s| &**s), Some("a"));
        assert_eq!(unit.closure_name(2).map(|s| &**s), Some("c"));
        assert_eq!(unit.closure_name(3), None);
    }

    #[test]
    fn test_disassemble_lists_operands() {
        let mut unit = CodeUnit::new("main", vec![100, 0, 0, 124, 0, 0, 23, 83, 250]);
        unit.constants.push(Constant::Int(2));
        unit.varnames.push("x".into());
        let listing = unit.disassemble();
        assert!(listing.contains("LOAD_CONST"));
        assert!(listing.contains("LOAD_FAST"));
        assert!(listing.contains("x"));
        assert!(listing.contains("BINARY_ADD"));
        assert!(listing.contains("<unknown 250>"));
    }
}
