//! Source file table.
//!
//! Each file tokenized during a compile (the main input, plus every
//! `#include`d file) gets a stable, monotonically assigned `file_no`,
//! used both for `.loc` emission and for diagnostics.

use std::rc::Rc;

/// One source file's identity and contents.
///
/// `contents` always ends in `\n`; the loader appends one if the raw
/// file didn't have a trailing newline. A buffer that is guaranteed to
/// end in a line terminator lets the tokenizer scan without a separate
/// end-of-buffer check on every byte.
#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub file_no: u32,
    /// Name used for `.loc`/diagnostics after a `#line` directive, if different from `name`.
    pub display_name: Option<String>,
    pub line_delta: i32,
    pub contents: Rc<str>,
}

impl SourceFile {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Append-only registry of source files, in first-open order.
#[derive(Debug, Default)]
pub struct SourceFileTable {
    files: Vec<Rc<SourceFile>>,
}

impl SourceFileTable {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Register a new file and return its handle. `file_no` is 1-based,
    /// the convention GNU `.loc` directives expect for the file index.
    pub fn add(&mut self, name: impl Into<String>, contents: impl Into<String>) -> Rc<SourceFile> {
        let mut contents = contents.into();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        let file = Rc::new(SourceFile {
            name: name.into(),
            file_no: self.files.len() as u32 + 1,
            display_name: None,
            line_delta: 0,
            contents: Rc::from(contents.as_str()),
        });
        self.files.push(file.clone());
        file
    }

    pub fn files(&self) -> &[Rc<SourceFile>] {
        &self.files
    }
}
