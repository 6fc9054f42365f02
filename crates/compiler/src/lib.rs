//! rvcc: a C99/C11-subset compiler that emits RISC-V64 assembly text.
//!
//! # Extending the compiler
//!
//! Embedders supply include-path resolution and any predefined/dynamic
//! macros (`__FILE__`, `__DATE__`, and the like) through
//! [`CompilerConfig`] — this crate has no opinion on filesystem layout
//! or a predefined-macro dictionary:
//!
//! ```rust,ignore
//! use rvcc::config::CompilerConfig;
//! use rvcc::compile_source;
//! use std::path::Path;
//!
//! let config = CompilerConfig::new();
//! let asm = compile_source("t.c", "int main(){ return 0; }", Path::new("."), &config)?;
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod parser;
pub mod preprocessor;
pub mod scope;
pub mod source;
pub mod token;
pub mod tokenizer;
pub mod types;

pub use ast::{Node, NodeKind, Obj, ObjId};
pub use codegen::emit as emit_asm;
pub use config::CompilerConfig;
pub use error::CompileError;
pub use parser::{ParsedProgram, Parser};
pub use preprocessor::Preprocessor;
pub use source::{SourceFile, SourceFileTable};
pub use token::Token;

use std::path::Path;

/// A single compile session: one source file table shared by the
/// preprocessor (which grows it as `#include`s are resolved) and every
/// diagnostic emitted against it.
///
/// Kept as an explicit, caller-owned context object rather than
/// process-global state, per the Design Notes' "global mutable state"
/// guidance — this is what lets a future multi-file driver run
/// multiple sessions concurrently without any shared mutable statics.
pub struct CompileSession {
    pub source_table: SourceFileTable,
}

impl CompileSession {
    pub fn new() -> Self {
        CompileSession {
            source_table: SourceFileTable::new(),
        }
    }
}

impl Default for CompileSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The library's primary contract: one source file in, RISC-V64
/// assembly text out, written directly to `out` rather than buffered
/// into a `String`. `file_name` is used for `.loc`/diagnostics; include
/// resolution (if `config` configures one) runs against the current
/// working directory.
pub fn compile(
    source: &str,
    file_name: &str,
    config: &CompilerConfig,
    out: &mut dyn std::io::Write,
) -> Result<(), CompileError> {
    let current_dir = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let asm = compile_source(file_name, source, &current_dir, config)?;
    out.write_all(asm.as_bytes()).map_err(|e| {
        let mut table = SourceFileTable::new();
        let placeholder = table.add(file_name, source);
        CompileError::codegen(placeholder, 0, format!("failed to write assembly output: {e}"))
    })
}

/// Run the full pipeline — tokenize, preprocess, parse, generate — over
/// one file's contents already in memory, returning the emitted
/// assembly text.
///
/// `current_dir` is passed through to the configured
/// [`config::IncludeResolver`] for relative `#include` lookups; pass
/// `"."` when there is no meaningful filesystem location (e.g.
/// compiling a string with no include resolver configured).
pub fn compile_source(
    file_name: &str,
    source: &str,
    current_dir: &Path,
    config: &CompilerConfig,
) -> Result<String, CompileError> {
    let mut session = CompileSession::new();
    compile_in_session(&mut session, file_name, source, current_dir, config)
}

/// Like [`compile_source`], but reuses an existing [`CompileSession`]
/// so the caller can inspect the final source-file table (e.g. to
/// report which files were `#include`d) after the compile finishes.
pub fn compile_in_session(
    session: &mut CompileSession,
    file_name: &str,
    source: &str,
    current_dir: &Path,
    config: &CompilerConfig,
) -> Result<String, CompileError> {
    Ok(compile_in_session_full(session, file_name, source, current_dir, config)?.assembly)
}

/// The two observable outputs of a compile: the emitted assembly, and
/// a rendering of the macro-expanded token stream that fed the parser
/// (the `-E`/`--keep-pp` surface), reconstructed from `at_bol`/
/// `has_space` per the tokenizer round-trip invariant.
pub struct CompileOutput {
    pub assembly: String,
    pub preprocessed: String,
}

/// Runs the full pipeline once and returns both outputs, so a caller
/// that wants the preprocessed text (e.g. `--keep-pp`) doesn't have to
/// preprocess twice and risk dynamic macros like `__COUNTER__`
/// observing two different expansion passes.
#[tracing::instrument(level = "debug", skip(session, source, config), fields(file = file_name))]
pub fn compile_in_session_full(
    session: &mut CompileSession,
    file_name: &str,
    source: &str,
    current_dir: &Path,
    config: &CompilerConfig,
) -> Result<CompileOutput, CompileError> {
    let file = session.source_table.add(file_name, source);
    let mut raw_tokens = tracing::debug_span!("tokenize").in_scope(|| tokenizer::tokenize(&file))?;

    if !config.predefined.is_empty() {
        let mut preamble = String::new();
        for (name, value) in &config.predefined {
            preamble.push_str("#define ");
            preamble.push_str(name);
            preamble.push(' ');
            preamble.push_str(value);
            preamble.push('\n');
        }
        let preamble_file = session.source_table.add("<command-line>", preamble);
        let mut preamble_tokens = tokenizer::tokenize(&preamble_file)?;
        preamble_tokens.pop(); // drop its Eof; the main file's Eof terminates the spliced stream.
        preamble_tokens.extend(raw_tokens);
        raw_tokens = preamble_tokens;
    }

    let pp_tokens = tracing::debug_span!("preprocess").in_scope(|| {
        let mut pp = Preprocessor::new(config, &mut session.source_table, current_dir.to_path_buf());
        pp.run(raw_tokens)
    })?;

    let preprocessed = render_tokens(&pp_tokens);

    let mut program = tracing::debug_span!("parse").in_scope(|| Parser::new(&pp_tokens).parse())?;

    let mut assembly = String::new();
    tracing::debug_span!("codegen").in_scope(|| {
        codegen::emit_with_config(&mut program, &pp_tokens, &mut assembly, config.emit_line_directives)
    })?;
    tracing::debug!(bytes = assembly.len(), "compile finished");
    Ok(CompileOutput { assembly, preprocessed })
}

/// Reconstructs source text from a token stream: a newline before
/// every token with `at_bol` set, else a single space before every
/// token with `has_space` set. This is the inverse direction of the
/// tokenizer round-trip property in the Testable Properties.
fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for tok in tokens {
        if tok.is_eof() {
            break;
        }
        if tok.at_bol {
            out.push('\n');
        } else if tok.has_space && !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&tok.text_owned());
    }
    out.push('\n');
    out
}

/// Read `path` from disk and compile it, matching [`compile_source`]'s
/// pipeline. `path`'s parent directory is used as the include
/// resolver's `current_dir`.
pub fn compile_file(path: &Path, config: &CompilerConfig) -> Result<String, CompileError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        let mut table = SourceFileTable::new();
        let placeholder = table.add(path.to_string_lossy().to_string(), "");
        CompileError::include(placeholder, 0, format!("failed to read {}: {e}", path.display()))
    })?;
    let current_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| ".".into());
    compile_source(&path.to_string_lossy(), &contents, &current_dir, config)
}

/// A convenience wrapper over [`compile_file`]: take a source path and
/// an output path, writing the assembly straight to disk.
pub fn compile_file_to(input: &Path, output: &Path, config: &CompilerConfig) -> Result<(), String> {
    let asm = compile_file(input, config).map_err(|e| e.to_string())?;
    std::fs::write(output, asm).map_err(|e| format!("failed to write {}: {e}", output.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_minimal_program() {
        let config = CompilerConfig::default();
        let asm = compile_source("t.c", "int main(){ return 42; }", Path::new("."), &config).unwrap();
        assert!(asm.contains("main:"));
        assert!(asm.contains("li a0, 42"));
    }

    #[test]
    fn reports_parse_error_on_malformed_expression() {
        let config = CompilerConfig::default();
        let err = compile_source("t.c", "int main(){ return 1 + ; }", Path::new("."), &config).unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
    }
}
