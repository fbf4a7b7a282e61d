use heap::HeapError;
use log::error;
use object::{ClassId, MethodId, Ref};

/// A language-level fault. Interpreted code can catch these; the runtime
/// raises them through [`Vm::create_and_throw`](crate::Vm::create_and_throw).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Fault {
    #[error("null pointer")]
    NullPointer,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("array store type mismatch")]
    ArrayStore,
    #[error("out of memory")]
    OutOfMemory,
    #[error("illegal monitor state")]
    IllegalMonitorState,
}

impl From<HeapError> for Fault {
    fn from(_: HeapError) -> Self {
        Fault::OutOfMemory
    }
}

/// An internal invariant was broken. There is no way to continue safely,
/// so these are never returned: see [`Violation::abort`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("pop from an empty frame chain")]
    EmptyFrameChain,
    #[error("incorrect method header for {0:?}")]
    IncorrectMethodHeader(MethodId),
    #[error("operand stack underflow")]
    OperandStackUnderflow,
    #[error("operand stack overflow")]
    OperandStackOverflow,
    #[error("native stack exhausted")]
    NativeStackExhausted,
    #[error("unknown method {0:?}")]
    UnknownMethod(MethodId),
    #[error("unknown class {0:?}")]
    UnknownClass(ClassId),
    #[error("corrupt chunk {0:?}")]
    CorruptChunk(Ref),
}

impl Violation {
    /// Stable diagnostic code.
    pub fn code(&self) -> u8 {
        match self {
            Violation::EmptyFrameChain => 1,
            Violation::IncorrectMethodHeader(_) => 2,
            Violation::OperandStackUnderflow => 3,
            Violation::OperandStackOverflow => 4,
            Violation::NativeStackExhausted => 5,
            Violation::UnknownMethod(_) => 6,
            Violation::UnknownClass(_) => 7,
            Violation::CorruptChunk(_) => 8,
        }
    }

    #[cold]
    pub fn abort(self) -> ! {
        error!("fatal error {}: {}", self.code(), self);
        panic!("fatal error {}: {}", self.code(), self);
    }
}

/// Errors surfaced to the embedding program.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("uncaught fault: {0}")]
    Fault(#[from] Fault),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_codes_are_stable() {
        let method = MethodId::new(ClassId(1), 0);
        assert_eq!(Violation::EmptyFrameChain.code(), 1);
        assert_eq!(Violation::IncorrectMethodHeader(method).code(), 2);
        assert_eq!(Violation::OperandStackUnderflow.code(), 3);
        assert_eq!(Violation::OperandStackOverflow.code(), 4);
        assert_eq!(Violation::NativeStackExhausted.code(), 5);
        assert_eq!(Violation::UnknownMethod(method).code(), 6);
        assert_eq!(Violation::UnknownClass(ClassId(9)).code(), 7);
        assert_eq!(Violation::CorruptChunk(Ref::NULL).code(), 8);
    }

    #[test]
    #[should_panic(expected = "fatal error 1: pop from an empty frame chain")]
    fn abort_panics_with_code() {
        Violation::EmptyFrameChain.abort();
    }

    #[test]
    fn heap_errors_become_out_of_memory_faults() {
        let err = HeapError::OutOfMemory { requested: 64, available: 8 };
        assert_eq!(Fault::from(err.clone()), Fault::OutOfMemory);
        let wrapped = VmError::from(err);
        assert_eq!(
            wrapped.to_string(),
            "out of memory: requested 64 bytes, 8 available after collection"
        );
        assert_eq!(VmError::from(Fault::ArrayStore).to_string(), "uncaught fault: array store type mismatch");
    }
}
