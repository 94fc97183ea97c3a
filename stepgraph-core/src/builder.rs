//! CFG builder: the stateful component driving the `observe` protocol.

use crate::index::InstructionIndex;
use crate::instruction::{Instruction, TypeTag};
use crate::node::NodeId;
use crate::roster::FunctionRoster;
use crate::Error;

/// Drives a linear stream of executed instructions into a growing CFG.
///
/// Holds the currently-installed "previous" node, the shadow call stack of
/// pending CALL sites, the function roster, and the instruction index that
/// owns every node.
pub struct CfgBuilder {
    index: InstructionIndex,
    roster: FunctionRoster,
    shadow_stack: Vec<NodeId>,
    prev: Option<NodeId>,
}

impl CfgBuilder {
    pub fn new() -> Self {
        Self::with_index(InstructionIndex::default())
    }

    pub fn with_bucket_count(bucket_count: usize) -> Self {
        Self::with_index(InstructionIndex::new(bucket_count))
    }

    fn with_index(index: InstructionIndex) -> Self {
        Self {
            index,
            roster: FunctionRoster::new(),
            shadow_stack: Vec::new(),
            prev: None,
        }
    }

    #[inline]
    pub fn index(&self) -> &InstructionIndex {
        &self.index
    }

    #[inline]
    pub fn roster(&self) -> &FunctionRoster {
        &self.roster
    }

    /// Depth of the shadow call stack (pending, unmatched CALL sites).
    #[inline]
    pub fn pending_calls(&self) -> usize {
        self.shadow_stack.len()
    }

    /// The single driving operation: observe one executed instruction.
    ///
    /// `opcodes` must be exactly the bytes the decoder consumed for this
    /// instruction (`opcodes.len()` becomes the Instruction's `size`).
    pub fn observe(
        &mut self,
        address: u64,
        opcodes: &[u8],
        display_text: impl Into<String>,
    ) -> Result<NodeId, Error> {
        let type_tag = crate::classifier::classify(opcodes);
        let instruction = Instruction::new(address, opcodes, type_tag)?;
        let (id, first_seen) = self
            .index
            .insert_or_get(instruction, display_text.into());

        let Some(prev_id) = self.prev else {
            self.index.node_mut(id).function_tag = Some(0);
            self.roster.push(id);
            self.prev = Some(id);
            return Ok(id);
        };

        let prev_type = self.index.node(prev_id).instruction().type_tag();
        let mut promoted_to_function_root = false;

        if prev_type == TypeTag::Call {
            self.shadow_stack.push(prev_id);
            if first_seen {
                let tag = self.roster.len() as u32;
                self.index.node_mut(id).function_tag = Some(tag);
                self.roster.push(id);
                promoted_to_function_root = true;
            }
        }

        self.add_successor_edge(prev_id, id)?;

        if first_seen && !promoted_to_function_root && self.index.node(id).function_tag().is_none() {
            let inherited = self.index.node(prev_id).function_tag();
            self.index.node_mut(id).function_tag = inherited;
        }

        self.prev = Some(id);
        Ok(id)
    }

    /// Successor-installation policy: decide how the edge from `prev_id` to
    /// `new_id` is installed, including the CALL/RET fall-through rewrite.
    fn add_successor_edge(&mut self, prev_id: NodeId, new_id: NodeId) -> Result<(), Error> {
        let prev_type = self.index.node(prev_id).instruction().type_tag();
        let prev_out_degree = self.index.node(prev_id).out_degree();

        if prev_out_degree == 0 && prev_type != TypeTag::Ret {
            return self.link_first(prev_id, new_id);
        }

        match prev_type {
            TypeTag::Basic => Err(Error::InvariantViolated {
                address: self.index.node(prev_id).instruction().address(),
                type_tag: prev_type,
                out_degree: prev_out_degree,
            }),
            TypeTag::Branch => {
                if prev_out_degree >= 2 {
                    Err(Error::InvariantViolated {
                        address: self.index.node(prev_id).instruction().address(),
                        type_tag: prev_type,
                        out_degree: prev_out_degree,
                    })
                } else {
                    self.link_branch_second(prev_id, new_id)
                }
            }
            TypeTag::Jump => self.link_grow(prev_id, new_id),
            // A direct CALL's only successor is its fixed call target,
            // installed the first time it runs (out_degree == 0 above).
            // Re-executing the same CALL afterwards installs no further
            // edge; indirect calls that diverge across invocations aren't
            // modeled here (see the design notes on Open Questions).
            TypeTag::Call => Ok(()),
            TypeTag::Ret => self.link_ret(prev_id, new_id),
        }
    }

    fn link_first(&mut self, from: NodeId, to: NodeId) -> Result<(), Error> {
        let from_tag = self.index.node(from).function_tag();
        {
            let from_node = self.index.node_mut(from);
            from_node.successors.push_first(to)?;
        }
        self.bump_in_degree(to);
        if self.index.node(to).function_tag().is_none() {
            self.index.node_mut(to).function_tag = from_tag;
        }
        Ok(())
    }

    fn link_branch_second(&mut self, from: NodeId, to: NodeId) -> Result<(), Error> {
        self.index.node_mut(from).successors.push_branch_second(to)?;
        self.bump_in_degree(to);
        Ok(())
    }

    fn link_grow(&mut self, from: NodeId, to: NodeId) -> Result<(), Error> {
        let already_present = {
            let arena = self.index.arena();
            arena[from.index()]
                .successors
                .contains_address(arena[to.index()].instruction().address(), arena)
        };
        if already_present {
            return Ok(());
        }
        self.index.node_mut(from).successors.push_grow(to)?;
        self.bump_in_degree(to);
        Ok(())
    }

    /// RET successor policy: match against the shadow call stack's top,
    /// rewriting the effective predecessor to the call site on a normal
    /// fall-through return; otherwise fall back to a plain grow-append from
    /// the RET node itself (an unmatched return).
    fn link_ret(&mut self, ret_id: NodeId, to: NodeId) -> Result<(), Error> {
        if let Some(&call_id) = self.shadow_stack.last() {
            let call = self.index.node(call_id);
            let fall_through = call.instruction().fall_through_address();
            let to_address = self.index.node(to).instruction().address();
            if to_address == fall_through {
                self.shadow_stack.pop();
                self.link_grow(call_id, to)?;
                if self.index.node(to).function_tag().is_none() {
                    let call_tag = self.index.node(call_id).function_tag();
                    self.index.node_mut(to).function_tag = call_tag;
                }
                return Ok(());
            }
        }
        log::warn!(
            "unmatched RET at 0x{:x} (empty or non-matching shadow stack); linking from the RET itself",
            self.index.node(ret_id).instruction().address()
        );
        self.link_grow(ret_id, to)
    }

    fn bump_in_degree(&mut self, id: NodeId) {
        self.index.node_mut(id).in_degree += 1;
    }
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl CfgBuilder {
    /// Rewind `prev` so the next `observe` call installs its edge from
    /// `id` instead of from whatever was last observed. Used by tests
    /// (here and in `block.rs`) to construct a second successor of a node
    /// without a second CfgBuilder; the real driver never needs this since
    /// it always calls `observe` in strict execution order.
    pub(crate) fn rewind_prev_for_test(&mut self, id: NodeId) {
        self.prev = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_linear_basics() {
        let mut b = CfgBuilder::new();
        let n1000 = b.observe(0x1000, &[0x90], "0x1000  90  nop").unwrap();
        let n1001 = b.observe(0x1001, &[0x90], "0x1001  90  nop").unwrap();
        let n1002 = b.observe(0x1002, &[0xC3], "0x1002  c3  ret").unwrap();

        assert_eq!(b.index().entries(), 3);
        assert_eq!(b.roster().len(), 1);
        assert_eq!(b.roster().get(0), Some(n1000));
        assert_eq!(b.index().node(n1000).successors(), &[n1001]);
        assert_eq!(b.index().node(n1001).successors(), &[n1002]);
        assert_eq!(b.index().node(n1002).out_degree(), 0);
    }

    #[test]
    fn s2_call_return() {
        let mut b = CfgBuilder::new();
        let call = b.observe(0x1000, &[0xE8, 0, 0, 0, 0], "call").unwrap();
        let callee = b.observe(0x2000, &[0x90], "nop").unwrap();
        let ret = b.observe(0x2001, &[0xC3], "ret").unwrap();
        let fallthrough = b.observe(0x1005, &[0x90], "nop").unwrap();

        assert_eq!(b.roster().len(), 2);
        assert_eq!(b.roster().get(0), Some(call));
        assert_eq!(b.roster().get(1), Some(callee));
        assert_eq!(b.pending_calls(), 0);

        assert_eq!(b.index().node(call).successors(), &[callee, fallthrough]);
        assert_eq!(b.index().node(callee).successors(), &[ret]);

        // The fall-through belongs to the caller's function, not the callee's,
        // even though it is reached via the RET node during observation.
        assert_eq!(b.index().node(call).function_tag(), Some(0));
        assert_eq!(b.index().node(callee).function_tag(), Some(1));
        assert_eq!(b.index().node(fallthrough).function_tag(), Some(0));
    }

    #[test]
    fn s3_conditional_branch_records_both_successors() {
        let mut b = CfgBuilder::new();
        let a = b.observe(0x3000, &[0x90], "nop A").unwrap();
        let branch = b.observe(0x3001, &[0x74, 0x02], "jz B").unwrap();
        let target = b.observe(0x3005, &[0x90], "nop B").unwrap();
        let fall = b.observe(0x3003, &[0x90], "nop fallthrough").unwrap();

        let _ = a;
        assert_eq!(b.index().node(branch).out_degree(), 2);
        assert_eq!(b.index().node(branch).successors(), &[target, fall]);
    }

    #[test]
    fn s4_indirect_jump_divergence_grows_by_power_of_two() {
        let mut b = CfgBuilder::new();
        let jump = b.observe(0x4000, &[0xFF, 0x25, 0, 0, 0, 0], "jmp [rip]").unwrap();

        b.observe(0x5001, &[0x90], "t1").unwrap();
        assert_eq!(b.index().node(jump).successor_capacity(), 1);

        b.rewind_prev_for_test(jump);
        b.observe(0x5002, &[0x90], "t2").unwrap();
        assert_eq!(b.index().node(jump).successor_capacity(), 2);

        b.rewind_prev_for_test(jump);
        b.observe(0x5003, &[0x90], "t3").unwrap();
        assert_eq!(b.index().node(jump).successor_capacity(), 4);

        b.rewind_prev_for_test(jump);
        b.observe(0x5004, &[0x90], "t4").unwrap();
        assert_eq!(b.index().node(jump).out_degree(), 4);
        assert_eq!(b.index().node(jump).successor_capacity(), 4);
    }

    #[test]
    fn s5_self_loop_basic() {
        let mut b = CfgBuilder::new();
        let a = b.observe(0x6000, &[0x90], "nop A").unwrap();
        b.rewind_prev_for_test(a);
        let a_again = b.observe(0x6000, &[0x90], "nop A").unwrap();
        assert_eq!(a, a_again);
        assert_eq!(b.index().node(a).successors(), &[a]);
        assert_eq!(b.index().node(a).in_degree(), 1);
    }

    #[test]
    fn s6_duplicate_ret_successor_is_idempotent() {
        let mut b = CfgBuilder::new();
        let call = b.observe(0x7000, &[0xE8, 0, 0, 0, 0], "call").unwrap();
        let callee = b.observe(0x8000, &[0x90], "nop").unwrap();
        b.observe(0x8001, &[0xC3], "ret").unwrap();
        b.observe(0x7005, &[0x90], "fallthrough").unwrap();
        assert_eq!(b.index().node(call).out_degree(), 2);
        assert_eq!(b.roster().len(), 2);

        // Re-run the same call/return/fallthrough sequence.
        b.rewind_prev_for_test(call);
        let callee_again = b.observe(0x8000, &[0x90], "nop").unwrap();
        assert_eq!(callee_again, callee);
        b.observe(0x8001, &[0xC3], "ret").unwrap();
        b.observe(0x7005, &[0x90], "fallthrough").unwrap();

        assert_eq!(b.index().node(call).out_degree(), 2);
        assert_eq!(b.roster().len(), 2);
    }

    #[test]
    fn unmatched_ret_still_installs_an_edge() {
        let mut b = CfgBuilder::new();
        let ret = b.observe(0x9000, &[0xC3], "ret").unwrap();
        let after = b.observe(0x9100, &[0x90], "nop").unwrap();
        assert_eq!(b.index().node(ret).successors(), &[after]);
    }

    #[test]
    fn basic_with_two_successors_is_an_invariant_violation() {
        let mut b = CfgBuilder::new();
        b.observe(0x1000, &[0x90], "nop").unwrap();
        b.observe(0x1001, &[0x90], "nop").unwrap();
        b.rewind_prev_for_test(NodeId(0));
        let err = b.observe(0x2000, &[0x90], "nop").unwrap_err();
        assert!(matches!(err, Error::InvariantViolated { .. }));
    }

    #[test]
    fn fifteen_byte_instruction_round_trips() {
        let mut b = CfgBuilder::new();
        let bytes = [0x66u8; 15];
        let id = b.observe(0xA000, &bytes, "long").unwrap();
        assert_eq!(b.index().node(id).instruction().size(), 15);
    }
}
