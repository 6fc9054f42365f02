//! rvcc CLI.
//!
//! Command-line driver around the `rvcc` library: reads one C source
//! file, runs it through the tokenizer/preprocessor/parser/codegen
//! pipeline, and writes RISC-V64 assembly. Filesystem include-path
//! search, `-D` wiring, and diagnostics formatting live here; invoking
//! the assembler/linker and multi-file dependency tracking are left to
//! the caller (e.g. a Makefile or a wrapper script).

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use rvcc::config::{CompilerConfig, IncludeKind, IncludeResolver};
use rvcc::{CompileError, CompileSession, compile_in_session_full};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

#[derive(ClapParser)]
#[command(name = "rvcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A C99/C11-subset compiler that emits RISC-V64 assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a C source file to RISC-V64 assembly text
    Build {
        /// Input C source file
        input: PathBuf,

        /// Output assembly path (defaults to input filename with a .s extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Additional `#include <...>` search directory (repeatable)
        #[arg(short = 'I', value_name = "DIR")]
        include_dirs: Vec<PathBuf>,

        /// Predefine a macro: `-D NAME` or `-D NAME=VALUE` (repeatable)
        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,

        /// Also write the macro-expanded token stream next to the output, as `<output>.i`
        #[arg(long)]
        keep_pp: bool,

        /// Treat warnings as errors (currently a no-op: this front end raises no warnings yet)
        #[arg(long)]
        deny_warnings: bool,

        /// Suppress `.loc` line directives in the emitted assembly
        #[arg(long)]
        no_line_directives: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            include_dirs,
            defines,
            keep_pp,
            deny_warnings,
            no_line_directives,
        } => run_build(&input, output.as_deref(), &include_dirs, &defines, keep_pp, deny_warnings, no_line_directives),
        Commands::Completions { shell } => run_completions(shell),
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "rvcc", &mut io::stdout());
}

/// Resolves `#include` filenames against the command line's `-I`
/// directories and (for `"..."` includes) the source's own directory.
/// The scan order mirrors a conventional C preprocessor: quoted
/// includes check the current file's directory first.
struct FsIncludeResolver {
    include_dirs: Vec<PathBuf>,
}

impl IncludeResolver for FsIncludeResolver {
    fn resolve(&self, name: &str, kind: IncludeKind, current_dir: &Path) -> io::Result<(String, String)> {
        let mut candidates = Vec::new();
        if kind == IncludeKind::Quoted {
            candidates.push(current_dir.join(name));
        }
        for dir in &self.include_dirs {
            candidates.push(dir.join(name));
        }
        for candidate in &candidates {
            if let Ok(contents) = std::fs::read_to_string(candidate) {
                return Ok((candidate.to_string_lossy().into_owned(), contents));
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{name}: not found in {} search director{}", candidates.len(), if candidates.len() == 1 { "y" } else { "ies" }),
        ))
    }
}

fn parse_define(spec: &str) -> (String, String) {
    match spec.split_once('=') {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => (spec.to_string(), "1".to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    input: &Path,
    output: Option<&Path>,
    include_dirs: &[PathBuf],
    defines: &[String],
    keep_pp: bool,
    deny_warnings: bool,
    no_line_directives: bool,
) {
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| input.with_extension("s"));

    let source = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(path = %input.display(), error = %e, "failed to read input file");
            process::exit(1);
        }
    };

    let mut config = CompilerConfig::new()
        .with_include_resolver(Rc::new(FsIncludeResolver {
            include_dirs: include_dirs.to_vec(),
        }))
        .deny_warnings(deny_warnings)
        .emit_line_directives(!no_line_directives);
    for spec in defines {
        let (name, value) = parse_define(spec);
        config = config.with_define(name, value);
    }

    let current_dir = input.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let mut session = CompileSession::new();
    let file_name = input.to_string_lossy().into_owned();

    match compile_in_session_full(&mut session, &file_name, &source, &current_dir, &config) {
        Ok(result) => {
            if let Err(e) = std::fs::write(&output, &result.assembly) {
                tracing::error!(path = %output.display(), error = %e, "failed to write assembly output");
                process::exit(1);
            }
            tracing::info!(input = %input.display(), output = %output.display(), "compiled");

            if keep_pp {
                let pp_path = output.with_extension("i");
                if let Err(e) = std::fs::write(&pp_path, &result.preprocessed) {
                    tracing::error!(path = %pp_path.display(), error = %e, "failed to write preprocessed output");
                    process::exit(1);
                }
                tracing::info!(path = %pp_path.display(), "wrote preprocessed output");
            }
        }
        Err(err) => {
            report(&err);
            process::exit(1);
        }
    }
}

fn report(err: &CompileError) {
    eprintln!("{err}");
}
