use std::fs;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use stepgraph_core::{Block, CfgBuilder};
use stepgraph_decoder::{InstructionDecoder, Syntax};
use stepgraph_driver::Tracer;

use crate::create_progress_bar;

/// One function root's synthesized block graph, serialized independently so
/// a later `render` invocation doesn't need the full instruction-level CFG.
#[derive(Debug, Serialize, Deserialize)]
struct FunctionSnapshot {
    entry_address: u64,
    blocks: Vec<BlockSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockSnapshot {
    entry_address: u64,
    label: String,
    successors: Vec<u64>,
}

impl From<&Block> for BlockSnapshot {
    fn from(block: &Block) -> Self {
        Self {
            entry_address: block.entry_address,
            label: block.label.clone(),
            successors: block.successors.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    functions: Vec<FunctionSnapshot>,
}

#[allow(clippy::too_many_arguments)]
pub fn trace(
    program: &Path,
    program_args: &[String],
    syntax: Syntax,
    bucket_count: usize,
    max_steps: u64,
    function_index: usize,
    dump: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let pb = create_progress_bar(&format!("Tracing {}...", program.display()));

    let program_path = program
        .to_str()
        .context("program path is not valid UTF-8")?;
    let mut tracer = Tracer::launch(program_path, program_args)
        .with_context(|| format!("failed to launch {}", program.display()))?;

    let decoder = InstructionDecoder::new(64, syntax);
    let mut builder = CfgBuilder::with_bucket_count(bucket_count);

    let mut steps_taken = 0u64;
    while let Some(step) = tracer.step().context("ptrace single-step failed")? {
        steps_taken += 1;
        if steps_taken > max_steps {
            log::warn!("reached --max-steps ({max_steps}); stopping trace early");
            break;
        }
        pb.tick();

        match decoder.decode(step.ip, &step.bytes) {
            Ok(decoded) => {
                let display_text = decoded.display_text(&step.bytes);
                builder
                    .observe(step.ip, &step.bytes[..decoded.len], display_text)
                    .with_context(|| format!("CFG invariant violated at 0x{:x}", step.ip))?;
            }
            Err(e) => {
                // Not fatal: the tracee may have jumped into data, or we
                // raced a self-modifying write. Drop this step from the
                // graph and keep tracing.
                log::warn!("decode failed at 0x{:x}: {e}; skipping this step", step.ip);
            }
        }
    }

    pb.finish_with_message(format!(
        "Trace complete: {} instructions, {} functions",
        builder.index().entries(),
        builder.roster().len()
    ));

    if let Some(dump_path) = dump {
        let snapshot = build_snapshot(&builder);
        let json = serde_json::to_string_pretty(&snapshot).context("failed to serialize snapshot")?;
        fs::write(dump_path, json)
            .with_context(|| format!("failed to write snapshot to {}", dump_path.display()))?;
        log::info!("wrote snapshot to {}", dump_path.display());
        return Ok(());
    }

    let Some(root) = builder.roster().get(function_index) else {
        anyhow::bail!(
            "function index {function_index} not found (roster has {} entries)",
            builder.roster().len()
        );
    };
    let block_graph = stepgraph_core::synthesize(builder.index(), root);
    write_dot(&block_graph, out)
}

pub fn render(snapshot_path: &Path, function_index: usize, out: Option<&Path>) -> Result<()> {
    let json = fs::read_to_string(snapshot_path)
        .with_context(|| format!("failed to read snapshot {}", snapshot_path.display()))?;
    let snapshot: Snapshot =
        serde_json::from_str(&json).context("failed to parse snapshot JSON")?;

    let function = snapshot
        .functions
        .get(function_index)
        .with_context(|| {
            format!(
                "function index {function_index} not found ({} functions in snapshot)",
                snapshot.functions.len()
            )
        })?;

    let block_graph = stepgraph_core::BlockGraph {
        blocks: function
            .blocks
            .iter()
            .map(|b| Block {
                entry_address: b.entry_address,
                label: b.label.clone(),
                successors: b.successors.clone(),
            })
            .collect(),
    };

    write_dot(&block_graph, out)
}

fn build_snapshot(builder: &CfgBuilder) -> Snapshot {
    let functions = builder
        .roster()
        .iter()
        .map(|root| {
            let block_graph = stepgraph_core::synthesize(builder.index(), root);
            FunctionSnapshot {
                entry_address: builder.index().node(root).instruction().address(),
                blocks: block_graph.blocks.iter().map(BlockSnapshot::from).collect(),
            }
        })
        .collect();
    Snapshot { functions }
}

fn write_dot(block_graph: &stepgraph_core::BlockGraph, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            stepgraph_render::render(block_graph, &mut file).context("failed to render DOT")?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stepgraph_render::render(block_graph, &mut stdout).context("failed to render DOT")?;
            stdout.flush().ok();
        }
    }
    Ok(())
}
