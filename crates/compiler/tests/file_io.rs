//! Exercises the filesystem-facing entry points (`compile_file`,
//! `compile_file_to`) against real files in a scratch directory, and a
//! caller-supplied [`IncludeResolver`] that reads `#include`d headers
//! from that same directory.

use rvcc::config::{CompilerConfig, IncludeKind, IncludeResolver};
use rvcc::compile_file_to;
use std::path::Path;
use std::rc::Rc;

struct DirIncludeResolver {
    dir: std::path::PathBuf,
}

impl IncludeResolver for DirIncludeResolver {
    fn resolve(&self, name: &str, _kind: IncludeKind, _current_dir: &Path) -> std::io::Result<(String, String)> {
        let path = self.dir.join(name);
        let contents = std::fs::read_to_string(&path)?;
        Ok((path.to_string_lossy().into_owned(), contents))
    }
}

#[test]
fn compile_file_to_writes_assembly_next_to_a_real_source_file() {
    let dir = tempfile::tempdir().expect("create scratch dir");
    let input = dir.path().join("t.c");
    std::fs::write(&input, "int main(){ return 42; }").unwrap();
    let output = dir.path().join("t.s");

    let config = CompilerConfig::default();
    compile_file_to(&input, &output, &config).expect("compile_file_to should succeed");

    let asm = std::fs::read_to_string(&output).unwrap();
    assert!(asm.contains("main:"));
    assert!(asm.contains("li a0, 42"));
}

#[test]
fn compile_file_to_resolves_quoted_includes_through_the_configured_resolver() {
    let dir = tempfile::tempdir().expect("create scratch dir");
    std::fs::write(dir.path().join("answer.h"), "#define ANSWER 42\n").unwrap();
    let input = dir.path().join("t.c");
    std::fs::write(&input, "#include \"answer.h\"\nint main(){ return ANSWER; }").unwrap();
    let output = dir.path().join("t.s");

    let config = CompilerConfig::new().with_include_resolver(Rc::new(DirIncludeResolver { dir: dir.path().to_path_buf() }));
    compile_file_to(&input, &output, &config).expect("compile_file_to should resolve the include");

    let asm = std::fs::read_to_string(&output).unwrap();
    assert!(asm.contains("li a0, 42"));
}

#[test]
fn compile_file_to_reports_missing_input_without_panicking() {
    let dir = tempfile::tempdir().expect("create scratch dir");
    let input = dir.path().join("missing.c");
    let output = dir.path().join("missing.s");

    let config = CompilerConfig::default();
    let err = compile_file_to(&input, &output, &config).unwrap_err();
    assert!(err.contains("missing.c"));
}
