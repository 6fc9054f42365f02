//! Compiler error taxonomy and diagnostic rendering.
//!
//! A single `Diagnostic` shape is shared by every compile phase so
//! that lexical, preprocessor, parse, semantic, and codegen errors all
//! render identically: `file:line:` followed by the offending source
//! line and a caret under the exact column.

use crate::source::SourceFile;
use std::fmt;
use std::rc::Rc;

/// One located error or warning.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub file: Rc<SourceFile>,
    pub offset: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        Self {
            file,
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_diagnostic(&self.file, self.offset, &self.message))
    }
}

/// Render `file:line:\n<source line>\n<spaces>^ <message>`.
///
/// Tabs before the error column count as 8 columns each (`pos =
/// loc-line + indent*(8-1)`), matching a typical terminal's tab stops.
pub fn render_diagnostic(file: &SourceFile, offset: usize, message: &str) -> String {
    let contents = file.contents.as_bytes();
    let offset = offset.min(contents.len());

    let mut line_start = offset;
    while line_start > 0 && contents[line_start - 1] != b'\n' {
        line_start -= 1;
    }
    let mut line_end = offset;
    while line_end < contents.len() && contents[line_end] != b'\n' {
        line_end += 1;
    }

    let line_no = 1 + contents[..line_start].iter().filter(|&&b| b == b'\n').count() as i32
        + file.line_delta;

    let indent_tabs = contents[line_start..offset].iter().filter(|&&b| b == b'\t').count();
    let col = (offset - line_start) + indent_tabs * (8 - 1);

    let line_text = String::from_utf8_lossy(&contents[line_start..line_end]);

    let mut out = String::new();
    out.push_str(&format!("{}:{}:\n", file.display_name(), line_no));
    out.push_str(&line_text);
    out.push('\n');
    for _ in 0..col {
        out.push(' ');
    }
    out.push_str("^ ");
    out.push_str(message);
    out
}

/// A fatal error from any compile phase.
#[derive(Debug, Clone)]
pub enum CompileError {
    Lex(Diagnostic),
    Preprocess(Diagnostic),
    Parse(Diagnostic),
    Semantic(Diagnostic),
    Codegen(Diagnostic),
    Include(Diagnostic),
}

impl CompileError {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            CompileError::Lex(d)
            | CompileError::Preprocess(d)
            | CompileError::Parse(d)
            | CompileError::Semantic(d)
            | CompileError::Codegen(d)
            | CompileError::Include(d) => d,
        }
    }

    pub fn lex(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Lex(Diagnostic::new(file, offset, message))
    }

    pub fn preprocess(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Preprocess(Diagnostic::new(file, offset, message))
    }

    pub fn parse(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Parse(Diagnostic::new(file, offset, message))
    }

    pub fn semantic(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Semantic(Diagnostic::new(file, offset, message))
    }

    pub fn codegen(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Codegen(Diagnostic::new(file, offset, message))
    }

    pub fn include(file: Rc<SourceFile>, offset: usize, message: impl Into<String>) -> Self {
        CompileError::Include(Diagnostic::new(file, offset, message))
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.diagnostic())
    }
}

impl std::error::Error for CompileError {}

impl From<fmt::Error> for CompileError {
    fn from(_: fmt::Error) -> Self {
        // Only ever raised by in-memory `write!` into a `String`, which cannot
        // fail; surfaced as a codegen bug rather than unwrapped.
        CompileError::Codegen(Diagnostic {
            file: Rc::new(SourceFile {
                name: "<codegen>".to_string(),
                file_no: 0,
                display_name: None,
                line_delta: 0,
                contents: Rc::from(""),
            }),
            offset: 0,
            message: "internal error formatting assembly output".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_caret_under_column() {
        let mut table = crate::source::SourceFileTable::new();
        let file = table.add("t.c", "int main() {\n  return x;\n}\n");
        let offset = file.contents.find('x').unwrap();
        let rendered = render_diagnostic(&file, offset, "undefined variable");
        assert!(rendered.contains("t.c:2:"));
        assert!(rendered.contains("return x;"));
        let caret_line = rendered.lines().nth(2).unwrap();
        assert_eq!(caret_line.find('^'), Some(offset - file.contents.rfind('\n').map(|i| i + 1).unwrap_or(0)));
    }
}
