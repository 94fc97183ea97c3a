use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "stepgraph")]
#[command(about = "Trace a process under ptrace and reconstruct its observed control-flow graph")]
#[command(version)]
struct Cli {
    /// Instruction text flavor used for display text and DOT labels.
    #[arg(long, value_enum, default_value_t = SyntaxArg::Intel, global = true)]
    syntax: SyntaxArg,

    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease log verbosity; repeatable.
    #[arg(short = 'q', long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,

    /// Instruction index bucket count; must be a power of two.
    #[arg(long, default_value_t = stepgraph_core::DEFAULT_BUCKET_COUNT, global = true)]
    bucket_count: usize,

    /// Safety cap on the number of single-steps a trace run will take.
    #[arg(long, default_value_t = 1_000_000, global = true)]
    max_steps: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SyntaxArg {
    Intel,
    Att,
}

impl From<SyntaxArg> for stepgraph_decoder::Syntax {
    fn from(value: SyntaxArg) -> Self {
        match value {
            SyntaxArg::Intel => stepgraph_decoder::Syntax::Intel,
            SyntaxArg::Att => stepgraph_decoder::Syntax::Att,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Launch and single-step a program, building its control-flow graph.
    Trace {
        /// Path to the program to trace.
        #[arg(short, long)]
        program: PathBuf,

        /// Arguments passed to the traced program.
        #[arg(trailing_var_arg = true)]
        program_args: Vec<String>,

        /// Roster index of the function to render (default: the entry point).
        #[arg(long, default_value_t = 0)]
        function_index: usize,

        /// Dump the full built graph (every function root) as JSON here for
        /// later `render` invocations, instead of rendering immediately.
        #[arg(long)]
        dump: Option<PathBuf>,

        /// DOT output path; stdout if omitted. Ignored when `--dump` is given.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render one function from a previously dumped JSON snapshot.
    Render {
        /// Path to a JSON snapshot produced by `trace --dump`.
        #[arg(long)]
        snapshot: PathBuf,

        /// Roster index of the function to render.
        #[arg(long, default_value_t = 0)]
        function_index: usize,

        /// DOT output path; stdout if omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match &cli.command {
        Commands::Trace {
            program,
            program_args,
            function_index,
            dump,
            out,
        } => commands::trace(
            program,
            program_args,
            cli.syntax.into(),
            cli.bucket_count,
            cli.max_steps,
            *function_index,
            dump.as_deref(),
            out.as_deref(),
        ),
        Commands::Render {
            snapshot,
            function_index,
            out,
        } => commands::render(snapshot, *function_index, out.as_deref()),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => log::LevelFilter::Error,
        -1 => log::LevelFilter::Warn,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

pub(crate) fn create_progress_bar(message: &str) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    pb.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb
}
