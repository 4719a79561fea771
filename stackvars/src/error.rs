//! Error types.
//!
//! Stack-variable recovery itself never fails: anything unexpected it runs into is an
//! [`Anomaly`], recorded alongside the results. Only reading the front end's export can fail,
//! with a [`LiftError`].

use thiserror::Error;

/// A non-fatal observation made while recovering one function's stack variables. The affected
/// instruction or offset simply goes unannotated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum Anomaly {
    /// The function has no stack frame, so it has no stack variables.
    #[error("function has no stack frame")]
    MissingFrame,
    /// A frame/stack relative reference whose offset matches no known stack variable (padding,
    /// or a member folded into a larger slot).
    #[error("instruction at {address:#x} references stack offset {offset} that names no variable")]
    UnresolvedOffset { address: u64, offset: i64 },
    /// An operand that looks like a memory reference, but could not be classified.
    #[error("instruction at {address:#x} has unclassifiable operand {index} `{text}`")]
    MalformedOperand {
        address: u64,
        index: usize,
        text: String,
    },
    /// A control-flow edge to a block that is not part of the function.
    #[error("block at {block:#x} has a successor {successor:#x} that is not in the function")]
    DanglingSuccessor { block: u64, successor: u64 },
    /// The traversal stopped early after visiting the configured maximum number of blocks.
    #[error("traversal stopped after {limit} block visits")]
    BlockLimitReached { limit: usize },
}

/// Failure to read the front end's listing export.
#[derive(Debug, Error)]
pub enum LiftError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("unsupported bit width {0}")]
    UnsupportedBitWidth(u32),
    #[error("missing `{0}` section")]
    MissingSection(&'static str),
}

impl LiftError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        LiftError::Syntax {
            line,
            message: message.into(),
        }
    }
}
