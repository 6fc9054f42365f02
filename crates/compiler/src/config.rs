//! Compiler configuration for extensibility.
//!
//! A fluent, validated builder for registering caller-provided
//! extensions: include-path resolution and dynamic/predefined macro
//! handlers. The predefined-macro *dictionary* (`__DATE__`, `__TIME__`,
//! ...) and include-path *filesystem* lookup are deliberately left out
//! of the library — both are supplied by the embedder.

use crate::token::Token;
use std::path::Path;
use std::rc::Rc;

/// Where an `#include` directive's filename came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeKind {
    /// `#include "foo.h"`
    Quoted,
    /// `#include <foo.h>`
    Angled,
}

/// Resolves an `#include` target to file contents. Left abstract so
/// that filesystem layout, search-path ordering, and sandboxing are an
/// embedder concern, not the compiler library's.
pub trait IncludeResolver {
    fn resolve(
        &self,
        name: &str,
        kind: IncludeKind,
        current_dir: &Path,
    ) -> std::io::Result<(String, String)>;
}

/// An `IncludeResolver` that never finds anything, for compiling
/// standalone (already-preprocessed, or include-free) sources.
pub struct NullIncludeResolver;

impl IncludeResolver for NullIncludeResolver {
    fn resolve(&self, name: &str, _kind: IncludeKind, _current_dir: &Path) -> std::io::Result<(String, String)> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no include resolver configured: {name}"),
        ))
    }
}

/// A dynamic ("predefined") macro handler: given the invocation token,
/// produce the single replacement token.
pub type MacroHandler = Rc<dyn Fn(&Token) -> Token>;

/// A named dynamic macro registration, rejecting anything that could
/// not plausibly be a macro name at construction time.
#[derive(Clone)]
pub struct DynamicMacro {
    pub name: String,
    pub handler: MacroHandler,
}

impl DynamicMacro {
    pub fn new(name: impl Into<String>, handler: MacroHandler) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() || !name.chars().next().unwrap().is_ascii_alphabetic() && name.chars().next() != Some('_')
        {
            return Err(format!("invalid macro name: {name}"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid macro name: {name}"));
        }
        Ok(DynamicMacro { name, handler })
    }
}

impl std::fmt::Debug for DynamicMacro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicMacro").field("name", &self.name).finish()
    }
}

/// Top-level knobs for a single compile.
pub struct CompilerConfig {
    pub include_resolver: Rc<dyn IncludeResolver>,
    pub macro_handlers: Vec<DynamicMacro>,
    /// `-D NAME[=value]` style object-like macros, spliced in as a
    /// synthetic `#define` preamble ahead of the main file's tokens.
    pub predefined: Vec<(String, String)>,
    pub warnings_as_errors: bool,
    pub emit_line_directives: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            include_resolver: Rc::new(NullIncludeResolver),
            macro_handlers: Vec::new(),
            predefined: Vec::new(),
            warnings_as_errors: false,
            emit_line_directives: true,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_include_resolver(mut self, resolver: Rc<dyn IncludeResolver>) -> Self {
        self.include_resolver = resolver;
        self
    }

    pub fn with_macro_handler(mut self, handler: DynamicMacro) -> Self {
        self.macro_handlers.push(handler);
        self
    }

    /// Register a `-D NAME=value` (or bare `-D NAME`, value defaulting
    /// to `1`) object-like macro.
    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.predefined.push((name.into(), value.into()));
        self
    }

    pub fn deny_warnings(mut self, deny: bool) -> Self {
        self.warnings_as_errors = deny;
        self
    }

    pub fn emit_line_directives(mut self, emit: bool) -> Self {
        self.emit_line_directives = emit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_macro_name_starting_with_digit() {
        assert!(DynamicMacro::new("1FOO", Rc::new(|t| t.clone())).is_err());
    }

    #[test]
    fn accepts_conventional_macro_name() {
        assert!(DynamicMacro::new("__LINE__", Rc::new(|t| t.clone())).is_ok());
    }
}
