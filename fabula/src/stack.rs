use std::fmt::Write as _;

use crate::error::{ErrorKind, RuntimeError};
use crate::value::{Value, ValueTag};

/// One call's execution context: locals, an operand stack, and the two
/// addresses that anchor it in the bytecode segment.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Function ident this frame executes.
    pub function: i32,
    /// Bytecode offset all relative jump targets are resolved against.
    pub base_address: usize,
    /// Caller's instruction pointer to resume at on return.
    pub return_address: usize,
    /// The self binding the call was routed through (object ident, 0 = none).
    pub this: i32,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

impl Frame {
    pub fn new(
        function: i32,
        base_address: usize,
        return_address: usize,
        this: i32,
        locals: Vec<Value>,
    ) -> Self {
        Self {
            function,
            base_address,
            return_address,
            this,
            stack: Vec::new(),
            locals,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(RuntimeError::stack_underflow)
    }

    /// Copy of the value `n` slots below the top (0 = top).
    pub fn peek(&self, n: usize) -> Result<Value, RuntimeError> {
        if n >= self.stack.len() {
            return Err(RuntimeError::new(
                ErrorKind::InvalidStackPosition,
                format!("peek at {} with stack depth {}", n, self.stack.len()),
            ));
        }
        Ok(self.stack[self.stack.len() - 1 - n])
    }

    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), RuntimeError> {
        let depth = self.stack.len();
        if a >= depth || b >= depth {
            return Err(RuntimeError::new(
                ErrorKind::InvalidStackPosition,
                format!("swap of {} and {} with stack depth {}", a, b, depth),
            ));
        }
        self.stack.swap(depth - 1 - a, depth - 1 - b);
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The frame's call result: its top of stack, or None when empty.
    pub fn result(&mut self) -> Value {
        self.stack.pop().unwrap_or_else(Value::none)
    }

    pub fn local(&self, index: usize) -> Result<Value, RuntimeError> {
        self.locals.get(index).copied().ok_or_else(|| {
            RuntimeError::new(
                ErrorKind::InvalidLocalIndex,
                format!("local {} of {}", index, self.locals.len()),
            )
        })
    }

    pub fn set_local(
        &mut self,
        index: usize,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let len = self.locals.len();
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::new(
                ErrorKind::InvalidLocalIndex,
                format!("local {} of {}", index, len),
            )),
        }
    }

    /// Resolve a chain of LocalVar indirections to a concrete value.
    ///
    /// The hop count is bounded by the locals array size, so a slot that
    /// points back at itself errors out instead of spinning.
    pub fn evaluate(&self, value: Value) -> Result<Value, RuntimeError> {
        let mut current = value;
        let mut hops = 0;
        while current.tag == ValueTag::LocalVar {
            if hops > self.locals.len() {
                return Err(RuntimeError::new(
                    ErrorKind::InvalidLocalIndex,
                    "local variable chain does not terminate",
                ));
            }
            let index = usize::try_from(current.payload).map_err(|_| {
                RuntimeError::new(
                    ErrorKind::InvalidLocalIndex,
                    format!("local {} of {}", current.payload, self.locals.len()),
                )
            })?;
            current = self.local(index)?;
            hops += 1;
        }
        Ok(current)
    }

    pub fn stack_values(&self) -> &[Value] {
        &self.stack
    }

    pub fn local_values(&self) -> &[Value] {
        &self.locals
    }
}

/// Copy up to `max_args` supplied arguments into the first local slots,
/// padding the rest up to `total` with None.
pub fn build_locals(
    args: &[Value],
    max_args: usize,
    total: usize,
) -> Vec<Value> {
    let mut locals = Vec::with_capacity(total);
    locals.extend(args.iter().take(max_args).copied());
    while locals.len() < total {
        locals.push(Value::none());
    }
    locals
}

/// The call stack. Only the top frame is directly addressable; the rest is
/// enumerable for diagnostics and as GC roots.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(RuntimeError::stack_underflow)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Diagnostic dump rendered by the turn driver after a runtime error.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let _ = write!(
                out,
                "#{} function {} base {} ret {}\n  stack: [",
                i, frame.function, frame.base_address, frame.return_address
            );
            for (j, v) in frame.stack.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}", v);
            }
            out.push_str("]\n  locals: [");
            for (j, v) in frame.locals.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}", v);
            }
            out.push_str("]\n");
        }
        out
    }
}
