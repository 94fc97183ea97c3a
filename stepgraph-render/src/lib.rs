//! Graph renderer: writes a [`BlockGraph`] out as Graphviz DOT.

use std::collections::HashMap;
use std::io::Write;

use petgraph::graph::DiGraph;
use stepgraph_core::{synthesize, BlockGraph, FunctionRoster, InstructionIndex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("function root at index {index} not found (roster has {roster_len} entries)")]
    UnknownFunctionRoot { index: usize, roster_len: usize },

    #[error("failed to write DOT output: {0}")]
    Io(#[from] std::io::Error),
}

/// Select a function root by its position in the discovery-ordered roster,
/// synthesize its block graph, and write it out as DOT.
pub fn render_function_by_index(
    index: &InstructionIndex,
    roster: &FunctionRoster,
    function_index: usize,
    writer: &mut impl Write,
) -> Result<(), RenderError> {
    let root = roster
        .get(function_index)
        .ok_or(RenderError::UnknownFunctionRoot {
            index: function_index,
            roster_len: roster.len(),
        })?;
    let block_graph = synthesize(index, root);
    render(&block_graph, writer)
}

/// Select a function root by its entry address and write it out as DOT.
pub fn render_function_by_address(
    index: &InstructionIndex,
    roster: &FunctionRoster,
    address: u64,
    writer: &mut impl Write,
) -> Result<(), RenderError> {
    let position = roster
        .iter()
        .position(|id| index.node(id).instruction().address() == address);
    match position {
        Some(function_index) => render_function_by_index(index, roster, function_index, writer),
        None => Err(RenderError::UnknownFunctionRoot {
            index: usize::MAX,
            roster_len: roster.len(),
        }),
    }
}

/// Build a `petgraph` digraph from a synthesized block graph, keyed by each
/// block's entry address, and write it out as DOT.
pub fn render(graph: &BlockGraph, writer: &mut impl Write) -> Result<(), RenderError> {
    let mut petgraph = DiGraph::<String, ()>::new();
    let mut address_to_index = HashMap::new();

    for block in &graph.blocks {
        let index = petgraph.add_node(escape_label(&block.label));
        address_to_index.insert(block.entry_address, index);
    }

    for block in &graph.blocks {
        let Some(&from) = address_to_index.get(&block.entry_address) else {
            continue;
        };
        for successor_address in &block.successors {
            let Some(&to) = address_to_index.get(successor_address) else {
                log::warn!(
                    "block at 0x{:x} has a successor at 0x{:x} outside the synthesized graph",
                    block.entry_address,
                    successor_address
                );
                continue;
            };
            if petgraph.find_edge(from, to).is_none() {
                petgraph.add_edge(from, to, ());
            }
        }
    }

    let dot = petgraph::dot::Dot::with_config(&petgraph, &[petgraph::dot::Config::EdgeNoLabel]);
    write!(writer, "{dot:?}")?;
    Ok(())
}

/// Escape a multi-line block label for safe embedding in a DOT node label.
fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\l") + "\\l"
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::Block;

    #[test]
    fn renders_two_blocks_with_one_edge() {
        let graph = BlockGraph {
            blocks: vec![
                Block {
                    entry_address: 0x1000,
                    label: "nop\njz 0x1010".to_string(),
                    successors: vec![0x1010],
                },
                Block {
                    entry_address: 0x1010,
                    label: "ret".to_string(),
                    successors: vec![],
                },
            ],
        };

        let mut out = Vec::new();
        render(&graph, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("digraph"));
        assert!(text.contains("nop"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn escapes_newlines_and_quotes() {
        let escaped = escape_label("mov \"x\"\nret");
        assert!(escaped.contains("\\\""));
        assert!(escaped.contains("\\l"));
    }

    #[test]
    fn render_function_by_index_selects_the_right_root() {
        let mut builder = stepgraph_core::CfgBuilder::new();
        builder.observe(0x1000, &[0x90], "nop").unwrap();
        builder.observe(0x1001, &[0xC3], "ret").unwrap();

        let mut out = Vec::new();
        render_function_by_index(builder.index(), builder.roster(), 0, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("nop"));

        let err = render_function_by_index(builder.index(), builder.roster(), 5, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::UnknownFunctionRoot { .. }));
    }

    #[test]
    fn dangling_successor_is_skipped_not_fatal() {
        let graph = BlockGraph {
            blocks: vec![Block {
                entry_address: 0x2000,
                label: "jmp [rax]".to_string(),
                successors: vec![0xdead_beef],
            }],
        };
        let mut out = Vec::new();
        assert!(render(&graph, &mut out).is_ok());
    }
}
