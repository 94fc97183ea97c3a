//! Instruction record: the immutable leaf value the rest of the engine is built on.

use smallvec::SmallVec;

/// Coarse control-flow role of an instruction, as assigned by the classifier.
///
/// `#[repr(u8)]` keeps this to a single byte, the same memory-optimization
/// convention used elsewhere in this codebase for edge/instruction-type enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Straight-line instruction; at most one successor.
    Basic = 0,
    /// Short or near conditional jump; at most two successors.
    Branch = 1,
    /// Near/far/indirect call; fall-through successor is added by the callee's RET.
    Call = 2,
    /// Unconditional or indirect jump; successor count is unbounded.
    Jump = 3,
    /// Return; successor count is unbounded (distinct call sites may return here).
    Ret = 4,
}

/// Maximum x86 instruction length in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// An executed machine instruction, immutable once built.
///
/// Two `Instruction`s are the same iff they share the same `address` — see
/// [`crate::index::InstructionIndex`] for why identity is address-only while
/// the hash still mixes in the opcode bytes.
#[derive(Debug, Clone)]
pub struct Instruction {
    address: u64,
    opcodes: SmallVec<[u8; MAX_INSTRUCTION_LEN]>,
    type_tag: TypeTag,
}

impl Instruction {
    /// Build an instruction from observed opcode bytes.
    ///
    /// `type_tag` must already be the result of [`crate::classifier::classify`]
    /// applied to `opcodes` — this constructor does not re-derive it, so that
    /// callers pay for classification exactly once per first-seen address.
    pub fn new(address: u64, opcodes: &[u8], type_tag: TypeTag) -> Result<Self, crate::Error> {
        if opcodes.is_empty() || opcodes.len() > MAX_INSTRUCTION_LEN {
            return Err(crate::Error::InvalidInstruction {
                size: opcodes.len() as u8,
                opcodes_len: opcodes.len(),
            });
        }
        Ok(Self {
            address,
            opcodes: SmallVec::from_slice(opcodes),
            type_tag,
        })
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.opcodes.len()
    }

    #[inline]
    pub fn opcodes(&self) -> &[u8] {
        &self.opcodes
    }

    #[inline]
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// The address one past the end of this instruction — the usual
    /// fall-through target for a CALL or conditional BRANCH.
    #[inline]
    pub fn fall_through_address(&self) -> u64 {
        self.address.wrapping_add(self.opcodes.len() as u64)
    }
}

impl PartialEq for Instruction {
    /// Identity is address-only; see module docs.
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for Instruction {}
