//! Observed-execution control-flow-graph engine.
//!
//! Consumes one executed instruction at a time (address, raw opcode bytes,
//! pre-formatted display text) via [`CfgBuilder::observe`] and incrementally
//! builds a control-flow graph keyed by instruction address, a
//! discovery-ordered function roster, and a shadow call stack used to
//! redirect RET fall-through edges back to their call sites. [`block::synthesize`]
//! then collapses the per-instruction graph into conventional basic blocks
//! for one function root at a time.
//!
//! This crate has no I/O and no knowledge of x86 encoding beyond the coarse
//! opcode-prefix classifier in [`classifier`] — decoding, tracing, and
//! rendering are separate crates in this workspace.

mod block;
mod builder;
mod classifier;
mod error;
mod index;
mod instruction;
mod node;
mod roster;

pub use block::{synthesize, Block, BlockGraph};
pub use builder::CfgBuilder;
pub use classifier::classify;
pub use error::Error;
pub use index::{InstructionIndex, DEFAULT_BUCKET_COUNT};
pub use instruction::{Instruction, TypeTag, MAX_INSTRUCTION_LEN};
pub use node::{CfgNode, NodeId};
pub use roster::FunctionRoster;
