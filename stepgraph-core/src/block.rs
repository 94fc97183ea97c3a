//! Block synthesizer: collapses the per-instruction CFG into the
//! conventional basic-block view.

use crate::index::InstructionIndex;
use crate::instruction::TypeTag;
use crate::node::NodeId;

/// A synthesized basic block: a straight-line run of instructions with one
/// entry and one exit.
#[derive(Debug, Clone)]
pub struct Block {
    /// Address of the block's first instruction; stable identity for the
    /// purposes of the renderer and for duplicate-edge suppression.
    pub entry_address: u64,
    /// Newline-joined `display_text` of every constituent instruction.
    pub label: String,
    /// Addresses of successor blocks' entries. De-duplicated.
    pub successors: Vec<u64>,
}

/// Block-level graph rooted at a single function root, ready for rendering.
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    pub blocks: Vec<Block>,
}

impl BlockGraph {
    pub fn block(&self, entry_address: u64) -> Option<&Block> {
        self.blocks.iter().find(|b| b.entry_address == entry_address)
    }
}

/// Walk the per-instruction CFG reachable from `root` and emit a [`BlockGraph`].
///
/// Mirrors `ControlFlowAnalyzer::build_cfg`'s join-detection/straight-line
/// pass, but over an already-built instruction-level graph rather than a
/// flat instruction stream, and working from `in_degree` directly instead of
/// a separate leader-address set.
pub fn synthesize(index: &InstructionIndex, root: NodeId) -> BlockGraph {
    let mut graph = BlockGraph::default();
    let mut seen_block_entries = std::collections::HashSet::new();
    let mut worklist = vec![root];

    while let Some(block_root) = worklist.pop() {
        let entry_address = index.node(block_root).instruction().address();
        if !seen_block_entries.insert(entry_address) {
            continue;
        }

        let (block, next_roots) = synthesize_one_block(index, block_root, root);
        graph.blocks.push(block);
        for next in next_roots {
            let next_address = index.node(next).instruction().address();
            if !seen_block_entries.contains(&next_address) {
                worklist.push(next);
            }
        }
    }

    graph
}

/// Straight-line from `block_root` until a join, branch/jump, or self-loop
/// back to the function root. Returns the finished block plus the node(s)
/// that begin the next block(s).
fn synthesize_one_block(
    index: &InstructionIndex,
    block_root: NodeId,
    function_root: NodeId,
) -> (Block, Vec<NodeId>) {
    let entry_address = index.node(block_root).instruction().address();
    let mut lines = Vec::new();
    let mut current = block_root;

    loop {
        let node = index.node(current);
        lines.push(node.display_text().to_string());

        match node.instruction().type_tag() {
            TypeTag::Branch | TypeTag::Jump => {
                let label = lines.join("\n");
                let successors = dedup_addresses(
                    node.successors()
                        .iter()
                        .map(|&s| index.node(s).instruction().address()),
                );
                return (
                    Block {
                        entry_address,
                        label,
                        successors,
                    },
                    node.successors().to_vec(),
                );
            }
            TypeTag::Ret => {
                let label = lines.join("\n");
                return (
                    Block {
                        entry_address,
                        label,
                        successors: Vec::new(),
                    },
                    Vec::new(),
                );
            }
            TypeTag::Call => {
                let call = node.instruction();
                let fall_through_address = call.fall_through_address();
                let fall_through = node
                    .successors()
                    .iter()
                    .copied()
                    .find(|&s| index.node(s).instruction().address() == fall_through_address);

                match fall_through {
                    Some(next) if next != block_root => {
                        if index.node(next).in_degree() > 1 {
                            let label = lines.join("\n");
                            return (
                                Block {
                                    entry_address,
                                    label,
                                    successors: vec![index.node(next).instruction().address()],
                                },
                                vec![next],
                            );
                        }
                        if next == function_root {
                            lines.push(index.node(function_root).display_text().to_string());
                            let label = lines.join("\n");
                            return (
                                Block {
                                    entry_address,
                                    label,
                                    successors: vec![entry_address],
                                },
                                Vec::new(),
                            );
                        }
                        current = next;
                        continue;
                    }
                    // No recorded fall-through yet (tail call observed so
                    // far), or the call target loops back to this very
                    // block: the block ends at the call.
                    _ => {
                        let label = lines.join("\n");
                        let successors = dedup_addresses(
                            node.successors()
                                .iter()
                                .map(|&s| index.node(s).instruction().address()),
                        );
                        return (
                            Block {
                                entry_address,
                                label,
                                successors,
                            },
                            node.successors().to_vec(),
                        );
                    }
                }
            }
            TypeTag::Basic => {
                let Some(&next) = node.successors().first() else {
                    let label = lines.join("\n");
                    return (
                        Block {
                            entry_address,
                            label,
                            successors: Vec::new(),
                        },
                        Vec::new(),
                    );
                };

                if next == function_root {
                    lines.push(index.node(function_root).display_text().to_string());
                    let label = lines.join("\n");
                    return (
                        Block {
                            entry_address,
                            label,
                            successors: vec![entry_address],
                        },
                        Vec::new(),
                    );
                }

                if next == current || index.node(next).in_degree() > 1 {
                    let label = lines.join("\n");
                    return (
                        Block {
                            entry_address,
                            label,
                            successors: vec![index.node(next).instruction().address()],
                        },
                        vec![next],
                    );
                }

                current = next;
            }
        }
    }
}

fn dedup_addresses(addresses: impl Iterator<Item = u64>) -> Vec<u64> {
    let mut out = Vec::new();
    for address in addresses {
        if !out.contains(&address) {
            out.push(address);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CfgBuilder;

    #[test]
    fn straight_line_basics_collapse_into_one_block() {
        let mut b = CfgBuilder::new();
        b.observe(0x1000, &[0x90], "nop 1").unwrap();
        b.observe(0x1001, &[0x90], "nop 2").unwrap();
        let ret = b.observe(0x1002, &[0xC3], "ret").unwrap();
        let _ = ret;

        let graph = synthesize(b.index(), b.roster().get(0).unwrap());
        assert_eq!(graph.blocks.len(), 1);
        assert_eq!(graph.blocks[0].entry_address, 0x1000);
        assert_eq!(graph.blocks[0].successors, Vec::<u64>::new());
    }

    #[test]
    fn branch_splits_into_three_blocks() {
        let mut b = CfgBuilder::new();
        let branch = b.observe(0x2000, &[0x74, 0x02], "jz L1").unwrap();
        b.observe(0x2004, &[0x90], "L1 nop").unwrap();
        b.rewind_prev_for_test(branch);
        b.observe(0x2002, &[0x90], "fallthrough nop").unwrap();

        let graph = synthesize(b.index(), b.roster().get(0).unwrap());
        assert_eq!(graph.blocks.len(), 3);
    }

    #[test]
    fn call_fallthrough_straight_lines_into_same_block() {
        let mut b = CfgBuilder::new();
        b.observe(0x3000, &[0xE8, 0, 0, 0, 0], "call").unwrap();
        b.observe(0x4000, &[0xC3], "callee ret").unwrap();
        let fallthrough = b.observe(0x3005, &[0x90], "after call").unwrap();
        let _ = fallthrough;

        let graph = synthesize(b.index(), b.roster().get(0).unwrap());
        let entry_block = graph.block(0x3000).unwrap();
        assert!(entry_block.label.contains("after call"));
    }

    #[test]
    fn self_loop_emits_tail_node_with_self_edge() {
        let mut b = CfgBuilder::new();
        let a = b.observe(0x5000, &[0x90], "nop A").unwrap();
        b.rewind_prev_for_test(a);
        let a_again = b.observe(0x5000, &[0x90], "nop A").unwrap();
        assert_eq!(a, a_again);

        let graph = synthesize(b.index(), a);
        let block = graph.block(0x5000).unwrap();
        assert_eq!(block.successors, vec![0x5000]);
    }
}
