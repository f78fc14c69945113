use std::fmt;

/// Classification of a recoverable runtime failure.
///
/// Every kind unwinds the opcode loop the same way; the turn driver only
/// ever looks at the message, the kind exists for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeMismatch,
    InvalidReference,
    StackUnderflow,
    InvalidLocalIndex,
    InvalidStackPosition,
    StaticMutationDenied,
    CircularContainment,
    UnknownOpcode,
    UserError,
}

impl ErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::InvalidReference => "invalid reference",
            ErrorKind::StackUnderflow => "stack underflow",
            ErrorKind::InvalidLocalIndex => "invalid local index",
            ErrorKind::InvalidStackPosition => "invalid stack position",
            ErrorKind::StaticMutationDenied => "static mutation denied",
            ErrorKind::CircularContainment => "circular containment",
            ErrorKind::UnknownOpcode => "unknown opcode",
            ErrorKind::UserError => "user error",
        }
    }
}

/// A recoverable interpreter error: a kind plus a human-readable message.
///
/// Raised errors unwind the opcode loop entirely; there is no per-opcode
/// recovery. The turn driver catches them and renders the message together
/// with a stack dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_reference(what: &str, ident: i32) -> Self {
        Self::new(
            ErrorKind::InvalidReference,
            format!("no {} with ident {}", what, ident),
        )
    }

    pub fn stack_underflow() -> Self {
        Self::new(ErrorKind::StackUnderflow, "operand stack is empty")
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for RuntimeError {}
