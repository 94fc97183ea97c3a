//! Core error types.
//!
//! The engine itself never panics on malformed *input data* — invalid
//! instructions are rejected with [`Error`]. A classification invariant
//! violation (a BASIC node acquiring a second successor, for example) is
//! a programmer error in the classifier, not a data error, and is
//! reported as [`Error::InvariantViolated`] so callers can abort the run
//! without the engine aborting the process itself.

use thiserror::Error;

/// Errors produced by the observed-execution CFG engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An instruction was constructed with no opcode bytes or `size == 0`.
    #[error("instruction construction failed: size={size}, opcodes_len={opcodes_len}")]
    InvalidInstruction { size: u8, opcodes_len: usize },

    /// A node's out-degree exceeded the bound its type tag allows.
    ///
    /// Only raised for BASIC (bound 1) and BRANCH (bound 2); JUMP and RET
    /// are unbounded and CALL grows via the RET fall-through path.
    #[error("classification invariant violated at 0x{address:x}: {type_tag:?} already has out_degree {out_degree}")]
    InvariantViolated {
        address: u64,
        type_tag: crate::instruction::TypeTag,
        out_degree: usize,
    },

    /// Successor list or node allocation failed.
    #[error("allocation failed while growing {context}")]
    AllocationFailed { context: &'static str },
}
