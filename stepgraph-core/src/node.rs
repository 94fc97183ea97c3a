//! Per-instruction CFG node and its successor list.

use smallvec::SmallVec;

use crate::instruction::Instruction;
use crate::Error;

/// An index into the arena owned by [`crate::index::InstructionIndex`].
///
/// The engine never hands out a real pointer or reference to a node that
/// could outlive the index: the function roster and shadow stack hold
/// `NodeId`s, which are cheap `Copy` handles, not borrows. This is the same
/// "blocks and edges addressed by `u32`, owned by one `Vec`" shape used by
/// this crate's `ControlFlowGraph`/`BasicBlock` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Growable successor list with an explicitly tracked, power-of-two capacity.
///
/// Backed by a `SmallVec` inlining the common case (at most two successors,
/// covering every BASIC and BRANCH node) with heap overflow for JUMP/RET
/// nodes that collect more. Capacity is managed by the CFG builder's
/// successor policy, not by the container's own amortized-doubling growth,
/// so that `capacity()` always reflects the exact value the growth rule
/// produces (1, 2, 4, 4, 8, ... as out-degree crosses each power of two)
/// rather than whatever the allocator happened to round up to.
#[derive(Debug, Clone, Default)]
pub struct SuccessorList {
    items: SmallVec<[NodeId; 2]>,
    capacity: usize,
}

impl SuccessorList {
    fn new() -> Self {
        Self {
            items: SmallVec::new(),
            capacity: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.items
    }

    fn grow_to(&mut self, new_capacity: usize) -> Result<(), Error> {
        if new_capacity > self.capacity {
            log::debug!("growing successor list {} -> {new_capacity}", self.capacity);
            self.items
                .try_reserve_exact(new_capacity - self.items.len())
                .map_err(|_| Error::AllocationFailed {
                    context: "successor list",
                })?;
            self.capacity = new_capacity;
        }
        Ok(())
    }

    /// Place the first successor a node ever acquires (the out-degree-zero
    /// case, shared by BASIC/BRANCH/JUMP/RET).
    pub(crate) fn push_first(&mut self, id: NodeId) -> Result<(), Error> {
        debug_assert!(self.items.is_empty());
        self.grow_to(1)?;
        self.items.push(id);
        Ok(())
    }

    /// Place a BRANCH's second successor (slot 1); requires capacity >= 2.
    pub(crate) fn push_branch_second(&mut self, id: NodeId) -> Result<(), Error> {
        debug_assert_eq!(self.items.len(), 1);
        self.grow_to(2)?;
        self.items.push(id);
        Ok(())
    }

    /// Append under the JUMP/RET growth rule: double capacity whenever the
    /// current out-degree is itself a power of two, otherwise reuse spare
    /// capacity.
    pub(crate) fn push_grow(&mut self, id: NodeId) -> Result<(), Error> {
        let out_degree = self.items.len();
        if out_degree == 0 {
            self.grow_to(1)?;
        } else if out_degree.is_power_of_two() {
            self.grow_to(2 * out_degree)?;
        }
        self.items.push(id);
        Ok(())
    }

    pub(crate) fn contains_address(&self, target_address: u64, arena: &[CfgNode]) -> bool {
        self.items
            .iter()
            .any(|id| arena[id.index()].instruction.address() == target_address)
    }
}

/// One node per unique [`Instruction`], owned by the instruction index.
#[derive(Debug, Clone)]
pub struct CfgNode {
    pub(crate) instruction: Instruction,
    pub(crate) in_degree: u32,
    pub(crate) successors: SuccessorList,
    pub(crate) function_tag: Option<u32>,
    pub(crate) display_text: String,
}

impl CfgNode {
    pub(crate) fn new(instruction: Instruction, display_text: String) -> Self {
        Self {
            instruction,
            in_degree: 0,
            successors: SuccessorList::new(),
            function_tag: None,
            display_text,
        }
    }

    #[inline]
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    #[inline]
    pub fn in_degree(&self) -> u32 {
        self.in_degree
    }

    #[inline]
    pub fn out_degree(&self) -> usize {
        self.successors.len()
    }

    #[inline]
    pub fn successors(&self) -> &[NodeId] {
        self.successors.as_slice()
    }

    #[inline]
    pub fn successor_capacity(&self) -> usize {
        self.successors.capacity()
    }

    /// `None` until a node has been reached at least once from some
    /// predecessor (only the very first node observed, before any edge
    /// exists, can transiently lack a tag).
    #[inline]
    pub fn function_tag(&self) -> Option<u32> {
        self.function_tag
    }

    #[inline]
    pub fn display_text(&self) -> &str {
        &self.display_text
    }
}
