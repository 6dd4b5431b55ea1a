// Stack VM Fault Handling
// Structured faults with a kind, a guest-visible exception type, and the frame chain they came from

use colored::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Categories of faults the VM can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultKind {
    UndefinedName,
    UnboundLocal,
    CallArity,
    Decode,
    UnsupportedOperation,
    Arithmetic,
    Lookup,
    Attribute,
    StackOverflow,
    BudgetExhausted,
    /// Raised by guest code through `RAISE_VARARGS`
    UserException,
}

impl FaultKind {
    /// Fatal faults abort the whole run instead of being routed to guest handlers
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultKind::Decode | FaultKind::BudgetExhausted)
    }

    /// Exception type a fault of this kind presents to guest `except` clauses
    pub fn default_exc_type(&self) -> ExcType {
        match self {
            FaultKind::UndefinedName => ExcType::NameError,
            FaultKind::UnboundLocal => ExcType::UnboundLocalError,
            FaultKind::CallArity | FaultKind::UnsupportedOperation => ExcType::TypeError,
            FaultKind::Arithmetic => ExcType::ZeroDivisionError,
            FaultKind::Lookup => ExcType::IndexError,
            FaultKind::Attribute => ExcType::AttributeError,
            FaultKind::StackOverflow => ExcType::RecursionError,
            FaultKind::Decode | FaultKind::BudgetExhausted | FaultKind::UserException => {
                ExcType::RuntimeError
            }
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::UndefinedName => write!(f, "UndefinedName"),
            FaultKind::UnboundLocal => write!(f, "UnboundLocal"),
            FaultKind::CallArity => write!(f, "CallArity"),
            FaultKind::Decode => write!(f, "DecodeFault"),
            FaultKind::UnsupportedOperation => write!(f, "UnsupportedOperation"),
            FaultKind::Arithmetic => write!(f, "Arithmetic"),
            FaultKind::Lookup => write!(f, "Lookup"),
            FaultKind::Attribute => write!(f, "Attribute"),
            FaultKind::StackOverflow => write!(f, "StackOverflow"),
            FaultKind::BudgetExhausted => write!(f, "BudgetExhausted"),
            FaultKind::UserException => write!(f, "UnhandledUserException"),
        }
    }
}

/// Exception classes visible to guest code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExcType {
    Exception,
    NameError,
    UnboundLocalError,
    TypeError,
    ZeroDivisionError,
    OverflowError,
    IndexError,
    KeyError,
    AttributeError,
    ValueError,
    RuntimeError,
    RecursionError,
}

impl ExcType {
    pub const ALL: [ExcType; 12] = [
        ExcType::Exception,
        ExcType::NameError,
        ExcType::UnboundLocalError,
        ExcType::TypeError,
        ExcType::ZeroDivisionError,
        ExcType::OverflowError,
        ExcType::IndexError,
        ExcType::KeyError,
        ExcType::AttributeError,
        ExcType::ValueError,
        ExcType::RuntimeError,
        ExcType::RecursionError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExcType::Exception => "Exception",
            ExcType::NameError => "NameError",
            ExcType::UnboundLocalError => "UnboundLocalError",
            ExcType::TypeError => "TypeError",
            ExcType::ZeroDivisionError => "ZeroDivisionError",
            ExcType::OverflowError => "OverflowError",
            ExcType::IndexError => "IndexError",
            ExcType::KeyError => "KeyError",
            ExcType::AttributeError => "AttributeError",
            ExcType::ValueError => "ValueError",
            ExcType::RuntimeError => "RuntimeError",
            ExcType::RecursionError => "RecursionError",
        }
    }

    fn parent(&self) -> Option<ExcType> {
        match self {
            ExcType::Exception => None,
            ExcType::UnboundLocalError => Some(ExcType::NameError),
            ExcType::RecursionError => Some(ExcType::RuntimeError),
            _ => Some(ExcType::Exception),
        }
    }

    /// True when `self` is `other` or derives from it
    pub fn is_subclass_of(&self, other: ExcType) -> bool {
        let mut current = Some(*self);
        while let Some(t) = current {
            if t == other {
                return true;
            }
            current = t.parent();
        }
        false
    }
}

impl fmt::Display for ExcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One activation in a fault's originating frame chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub function: Arc<str>,
    pub offset: usize,
}

impl TraceEntry {
    pub fn new(function: impl Into<Arc<str>>, offset: usize) -> Self {
        Self {
            function: function.into(),
            offset,
        }
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} (@{})", self.function, self.offset)
    }
}

/// Main fault type for the VM
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{exc_type}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub exc_type: ExcType,
    pub message: String,
    /// Innermost frame first
    pub traceback: Vec<TraceEntry>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exc_type: kind.default_exc_type(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_exc_type(mut self, exc_type: ExcType) -> Self {
        self.exc_type = exc_type;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_traceback(mut self, traceback: Vec<TraceEntry>) -> Self {
        self.traceback = traceback;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Format the fault for terminal display
    pub fn format(&self) -> String {
        let mut output = format!(
            "{} ({}): {}\n",
            self.kind.to_string().red().bold(),
            self.exc_type,
            self.message.white().bold()
        );

        if !self.traceback.is_empty() {
            output.push_str(&format!("\n{}:\n", "Stack trace".yellow().bold()));
            for entry in &self.traceback {
                output.push_str(&format!("{}\n", entry));
            }
        }

        output
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, Fault>;

// Convenience constructors for common faults
impl Fault {
    pub fn undefined_name(name: &str) -> Self {
        Self::new(
            FaultKind::UndefinedName,
            format!("name '{}' is not defined", name),
        )
    }

    pub fn unbound_local(name: &str) -> Self {
        Self::new(
            FaultKind::UnboundLocal,
            format!("local variable '{}' referenced before assignment", name),
        )
    }

    pub fn call_arity(message: impl Into<String>) -> Self {
        Self::new(FaultKind::CallArity, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Decode, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FaultKind::UnsupportedOperation, message)
    }

    pub fn division_by_zero(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Arithmetic, message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Arithmetic, message).with_exc_type(ExcType::OverflowError)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Lookup, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Lookup, message).with_exc_type(ExcType::KeyError)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::UnsupportedOperation, message).with_exc_type(ExcType::ValueError)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Attribute, message)
    }

    pub fn stack_overflow(message: impl Into<String>) -> Self {
        Self::new(FaultKind::StackOverflow, message)
    }

    pub fn raised(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self::new(FaultKind::UserException, message).with_exc_type(exc_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exc_type_hierarchy() {
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::RecursionError.is_subclass_of(ExcType::RuntimeError));
        assert!(!ExcType::NameError.is_subclass_of(ExcType::UnboundLocalError));
        assert!(!ExcType::TypeError.is_subclass_of(ExcType::ValueError));
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::undefined_name("x");
        assert_eq!(fault.to_string(), "NameError: name 'x' is not defined");
        assert_eq!(fault.kind, FaultKind::UndefinedName);
        assert!(!fault.is_fatal());
        assert!(Fault::decode("bad").is_fatal());
    }

    #[test]
    fn test_fault_format_includes_trace() {
        let fault = Fault::unbound_local("y")
            .with_traceback(vec![TraceEntry::new("inner", 4), TraceEntry::new("<module>", 12)]);
        let text = fault.format();
        assert!(text.contains("inner (@4)"));
        assert!(text.contains("<module> (@12)"));
    }

    #[test]
    fn test_fault_serializes() {
        let fault = Fault::call_arity("too many arguments");
        let json = serde_json::to_string(&fault).unwrap();
        assert!(json.contains("\"kind\":\"CallArity\""));
        assert!(json.contains("\"exc_type\":\"TypeError\""));
    }
}
