//! Macro preprocessor: hideset-based expansion, conditional inclusion,
//! and `#include`.

use crate::config::{CompilerConfig, IncludeKind, MacroHandler};
use crate::error::CompileError;
use crate::source::SourceFileTable;
use crate::token::{HideSet, NumKind, Token, TokenKind};
use crate::tokenizer::tokenize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;

#[derive(Clone)]
struct Macro {
    is_objlike: bool,
    params: Vec<String>,
    is_variadic: bool,
    body: Vec<Token>,
    deleted: bool,
    handler: Option<MacroHandler>,
}

/// Tracks whether the branch currently being scanned should be
/// processed. `active` already folds in whether an enclosing `#if` was
/// itself taken, so callers only ever need to check the top frame.
struct CondFrame {
    any_taken: bool,
    active: bool,
    parent_active: bool,
}

pub struct Preprocessor<'a> {
    macros: HashMap<String, Macro>,
    cond_stack: Vec<CondFrame>,
    config: &'a CompilerConfig,
    source_table: &'a mut SourceFileTable,
    current_dir: std::path::PathBuf,
}

impl<'a> Preprocessor<'a> {
    pub fn new(config: &'a CompilerConfig, source_table: &'a mut SourceFileTable, current_dir: std::path::PathBuf) -> Self {
        let mut macros = HashMap::new();
        for dm in &config.macro_handlers {
            macros.insert(
                dm.name.clone(),
                Macro {
                    is_objlike: true,
                    params: Vec::new(),
                    is_variadic: false,
                    body: Vec::new(),
                    deleted: false,
                    handler: Some(dm.handler.clone()),
                },
            );
        }
        Preprocessor {
            macros,
            cond_stack: Vec::new(),
            config,
            source_table,
            current_dir,
        }
    }

    fn is_enabled(&self) -> bool {
        self.cond_stack.last().map(|f| f.active).unwrap_or(true)
    }

    pub fn run(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let mut out = self.preprocess_stream(tokens)?;
        if let Some(_frame) = self.cond_stack.last() {
            let file = out.last().map(|t| t.file.clone()).unwrap();
            let offset = file.contents.len();
            return Err(CompileError::preprocess(file, offset, "unterminated conditional directive"));
        }
        convert_keywords(&mut out);
        Ok(out)
    }

    /// The main directive-dispatch / macro-expansion loop.
    fn preprocess_stream(&mut self, input: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let mut remaining: VecDeque<Token> = input.into();
        let mut out = Vec::new();

        while let Some(tok) = remaining.pop_front() {
            if tok.is_eof() {
                out.push(tok);
                break;
            }

            if !(tok.is("#") && tok.at_bol) {
                if !self.is_enabled() {
                    continue;
                }
                if self.try_expand(&tok, &mut remaining)? {
                    continue;
                }
                out.push(tok);
                continue;
            }

            // Directive line.
            let Some(directive) = remaining.front().cloned() else {
                break;
            };
            if directive.at_bol {
                // Null directive (a lone '#').
                continue;
            }
            remaining.pop_front();
            let name = directive.text_owned();

            match name.as_str() {
                "include" => self.do_include(&directive, &mut remaining, &mut out)?,
                "define" => {
                    if self.is_enabled() {
                        self.do_define(&mut remaining)?;
                    } else {
                        self.skip_line(&mut remaining);
                    }
                }
                "undef" => {
                    if self.is_enabled() {
                        self.do_undef(&directive, &mut remaining)?;
                    } else {
                        self.skip_line(&mut remaining);
                    }
                }
                "if" => self.do_if(&directive, &mut remaining)?,
                "ifdef" => self.do_ifdef(&directive, &mut remaining, false)?,
                "ifndef" => self.do_ifdef(&directive, &mut remaining, true)?,
                "elif" => self.do_elif(&directive, &mut remaining)?,
                "else" => self.do_else(&directive)?,
                "endif" => self.do_endif(&directive)?,
                _ => {
                    if self.is_enabled() {
                        return Err(CompileError::preprocess(
                            directive.file.clone(),
                            directive.offset,
                            format!("invalid preprocessor directive: {name}"),
                        ));
                    }
                    self.skip_line(&mut remaining);
                }
            }
        }

        Ok(out)
    }

    fn skip_line(&self, remaining: &mut VecDeque<Token>) {
        while let Some(front) = remaining.front() {
            if front.at_bol || front.is_eof() {
                break;
            }
            remaining.pop_front();
        }
    }

    fn take_line(&self, remaining: &mut VecDeque<Token>) -> Vec<Token> {
        let mut line = Vec::new();
        while let Some(front) = remaining.front() {
            if front.at_bol || front.is_eof() {
                break;
            }
            line.push(remaining.pop_front().unwrap());
        }
        line
    }

    // ---- directives ----

    fn do_include(&mut self, hash: &Token, remaining: &mut VecDeque<Token>, out: &mut Vec<Token>) -> Result<(), CompileError> {
        if !self.is_enabled() {
            self.skip_line(remaining);
            return Ok(());
        }
        let line = self.take_line(remaining);
        let (filename, kind) = self.read_include_filename(hash, &line)?;
        let (resolved_name, contents) = self
            .config
            .include_resolver
            .resolve(&filename, kind, &self.current_dir)
            .map_err(|e| CompileError::preprocess(hash.file.clone(), hash.offset, format!("{filename}: {e}")))?;
        let file = self.source_table.add(resolved_name, contents);
        let included_tokens = tokenize(&file)?;
        // drop the included file's own Eof; splice ahead of what remains.
        let mut included_tokens = included_tokens;
        included_tokens.pop();
        let expanded = self.preprocess_stream(append_eof(included_tokens, hash))?;
        out.extend(expanded.into_iter().filter(|t| !t.is_eof()));
        Ok(())
    }

    fn read_include_filename(&mut self, hash: &Token, line: &[Token]) -> Result<(String, IncludeKind), CompileError> {
        if line.is_empty() {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "expected a filename"));
        }
        if line[0].kind == TokenKind::Str {
            let bytes = line[0].str_val.as_ref().unwrap();
            let s = String::from_utf8_lossy(&bytes[..bytes.len().saturating_sub(1)]).to_string();
            return Ok((s, IncludeKind::Quoted));
        }
        if line[0].is("<") {
            let mut name = String::new();
            for t in &line[1..] {
                if t.is(">") {
                    return Ok((name, IncludeKind::Angled));
                }
                if !name.is_empty() && t.has_space {
                    name.push(' ');
                }
                name.push_str(&t.text_owned());
            }
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "expected '>'"));
        }
        // Macro-expand the rest of the line, then recurse.
        let expanded = self.preprocess_stream(append_eof(line.to_vec(), hash))?;
        let expanded: Vec<Token> = expanded.into_iter().filter(|t| !t.is_eof()).collect();
        self.read_include_filename(hash, &expanded)
    }

    fn do_define(&mut self, remaining: &mut VecDeque<Token>) -> Result<(), CompileError> {
        let Some(name_tok) = remaining.pop_front() else {
            return Ok(());
        };
        let name = name_tok.text_owned();
        let is_objlike = !(remaining.front().is_some_and(|t| t.is("(") && !t.has_space));

        if is_objlike {
            let body = self.take_line(remaining);
            self.macros.insert(
                name,
                Macro {
                    is_objlike: true,
                    params: Vec::new(),
                    is_variadic: false,
                    body,
                    deleted: false,
                    handler: None,
                },
            );
            return Ok(());
        }

        remaining.pop_front(); // '('
        let mut params = Vec::new();
        let mut is_variadic = false;
        loop {
            let Some(t) = remaining.pop_front() else { break };
            if t.is(")") {
                break;
            }
            if !params.is_empty() {
                // previous token should have been ','
            }
            if t.is("...") {
                is_variadic = true;
                // next should be ')'
                if let Some(close) = remaining.pop_front() {
                    if !close.is(")") {
                        return Err(CompileError::preprocess(close.file.clone(), close.offset, "expected ')'"));
                    }
                }
                break;
            }
            if t.is(",") {
                continue;
            }
            params.push(t.text_owned());
        }
        let body = self.take_line(remaining);
        self.macros.insert(
            name,
            Macro {
                is_objlike: false,
                params,
                is_variadic,
                body,
                deleted: false,
                handler: None,
            },
        );
        Ok(())
    }

    fn do_undef(&mut self, hash: &Token, remaining: &mut VecDeque<Token>) -> Result<(), CompileError> {
        let Some(name_tok) = remaining.pop_front() else {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "macro name must be an identifier"));
        };
        self.skip_line(remaining);
        let name = name_tok.text_owned();
        self.macros
            .entry(name)
            .or_insert(Macro {
                is_objlike: true,
                params: Vec::new(),
                is_variadic: false,
                body: Vec::new(),
                deleted: false,
                handler: None,
            })
            .deleted = true;
        Ok(())
    }

    fn do_if(&mut self, hash: &Token, remaining: &mut VecDeque<Token>) -> Result<(), CompileError> {
        let parent_active = self.is_enabled();
        let line = self.take_line(remaining);
        let (taken, any_taken) = if parent_active {
            let v = self.eval_directive_expr(hash, line)?;
            (v != 0, v != 0)
        } else {
            (false, true)
        };
        self.cond_stack.push(CondFrame {
            any_taken,
            active: parent_active && taken,
            parent_active,
        });
        Ok(())
    }

    fn do_ifdef(&mut self, hash: &Token, remaining: &mut VecDeque<Token>, negate: bool) -> Result<(), CompileError> {
        let parent_active = self.is_enabled();
        let name_tok = remaining.pop_front();
        self.skip_line(remaining);
        let (taken, any_taken) = if parent_active {
            let name = name_tok
                .as_ref()
                .ok_or_else(|| CompileError::preprocess(hash.file.clone(), hash.offset, "macro name must be an identifier"))?
                .text_owned();
            let defined = self.macros.get(&name).is_some_and(|m| !m.deleted);
            let v = defined != negate;
            (v, v)
        } else {
            (false, true)
        };
        self.cond_stack.push(CondFrame {
            any_taken,
            active: parent_active && taken,
            parent_active,
        });
        Ok(())
    }

    fn do_elif(&mut self, hash: &Token, remaining: &mut VecDeque<Token>) -> Result<(), CompileError> {
        let line = self.take_line(remaining);
        let Some(frame) = self.cond_stack.last_mut() else {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "stray #elif"));
        };
        if !frame.parent_active {
            frame.active = false;
            return Ok(());
        }
        if frame.any_taken {
            frame.active = false;
            return Ok(());
        }
        let v = self.eval_directive_expr(hash, line)?;
        let frame = self.cond_stack.last_mut().unwrap();
        frame.active = v != 0;
        frame.any_taken = v != 0;
        Ok(())
    }

    fn do_else(&mut self, hash: &Token) -> Result<(), CompileError> {
        let Some(frame) = self.cond_stack.last_mut() else {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "stray #else"));
        };
        if !frame.parent_active {
            frame.active = false;
            return Ok(());
        }
        frame.active = !frame.any_taken;
        frame.any_taken = true;
        Ok(())
    }

    fn do_endif(&mut self, hash: &Token) -> Result<(), CompileError> {
        if self.cond_stack.pop().is_none() {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "stray #endif"));
        }
        Ok(())
    }

    /// `#if`/`#elif` expression: substitute `defined`, macro-expand,
    /// fold residual identifiers to 0, then evaluate.
    fn eval_directive_expr(&mut self, hash: &Token, line: Vec<Token>) -> Result<i64, CompileError> {
        let line = self.resolve_defined(line)?;
        let expanded = self.preprocess_stream(append_eof(line, hash))?;
        let mut expanded: Vec<Token> = expanded.into_iter().filter(|t| !t.is_eof()).collect();
        for t in expanded.iter_mut() {
            if t.kind == TokenKind::Ident {
                t.kind = TokenKind::Num;
                t.ival = 0;
                t.num_kind = Some(NumKind::Int);
            }
        }
        if expanded.is_empty() {
            return Err(CompileError::preprocess(hash.file.clone(), hash.offset, "#if with no expression"));
        }
        eval_const_expr(&expanded)
    }

    fn resolve_defined(&self, line: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < line.len() {
            if line[i].is("defined") {
                i += 1;
                let (name, next) = if i < line.len() && line[i].is("(") {
                    let name = line
                        .get(i + 1)
                        .ok_or_else(|| CompileError::preprocess(line[i].file.clone(), line[i].offset, "expected identifier"))?
                        .text_owned();
                    let close = i + 2;
                    (name, close + 1)
                } else {
                    let name = line
                        .get(i)
                        .ok_or_else(|| CompileError::preprocess(line[i - 1].file.clone(), line[i - 1].offset, "expected identifier"))?
                        .text_owned();
                    (name, i + 1)
                };
                let defined = self.macros.get(&name).is_some_and(|m| !m.deleted);
                let mut tok = line[i - 1].clone();
                tok.kind = TokenKind::Num;
                tok.ival = defined as i64;
                tok.num_kind = Some(NumKind::Int);
                out.push(tok);
                i = next;
                continue;
            }
            out.push(line[i].clone());
            i += 1;
        }
        Ok(out)
    }

    // ---- macro expansion ----

    /// Attempts expansion of `tok`. On success, the replacement is
    /// spliced onto the front of `remaining` for rescanning and `true`
    /// is returned; `tok` itself is then never emitted.
    fn try_expand(&mut self, tok: &Token, remaining: &mut VecDeque<Token>) -> Result<bool, CompileError> {
        if tok.kind != TokenKind::Ident {
            return Ok(false);
        }
        let name = tok.text_owned();
        if tok.hideset.contains(&name) {
            return Ok(false);
        }
        let Some(mac) = self.macros.get(&name).cloned() else {
            return Ok(false);
        };
        if mac.deleted {
            return Ok(false);
        }

        if let Some(handler) = &mac.handler {
            let replacement = handler(tok);
            remaining.push_front(replacement);
            return Ok(true);
        }

        if mac.is_objlike {
            let hs = tok.hideset.add(&name);
            let mut body = mac.body.clone();
            for t in body.iter_mut() {
                t.hideset = t.hideset.union(&hs);
            }
            if let Some(first) = body.first_mut() {
                first.at_bol = tok.at_bol;
                first.has_space = tok.has_space;
            }
            splice_front(remaining, body);
            return Ok(true);
        }

        // Function-like: requires '(' with no space restriction on the call site.
        if !remaining.front().is_some_and(|t| t.is("(")) {
            return Ok(false);
        }
        let open_paren = remaining.pop_front().unwrap();
        let (args, close_paren) = self.read_macro_args(remaining, &mac, tok)?;
        let hs = tok
            .hideset
            .intersection(&close_paren.hideset)
            .add(&name);
        let mut arg_map: HashMap<String, Vec<Token>> = HashMap::new();
        for (p, a) in mac.params.iter().zip(args.iter()) {
            arg_map.insert(p.clone(), a.clone());
        }
        if mac.is_variadic {
            let named = mac.params.len();
            let comma_file = self.source_table.add("<paste>", ",");
            let mut varargs = Vec::new();
            for (i, a) in args.iter().enumerate().skip(named) {
                if i > named {
                    varargs.push(Token {
                        kind: TokenKind::Punct,
                        file: comma_file.clone(),
                        offset: 0,
                        len: 1,
                        line_no: open_paren.line_no,
                        at_bol: false,
                        has_space: false,
                        hideset: HideSet::empty(),
                        ival: 0,
                        fval: 0.0,
                        num_kind: None,
                        str_val: None,
                    });
                }
                varargs.extend(a.clone());
            }
            arg_map.insert("__VA_ARGS__".to_string(), varargs);
        }

        let mut result = self.subst(&mac.body, &arg_map)?;
        for t in result.iter_mut() {
            t.hideset = t.hideset.union(&hs);
        }
        if let Some(first) = result.first_mut() {
            first.at_bol = tok.at_bol;
            first.has_space = tok.has_space;
        }
        splice_front(remaining, result);
        Ok(true)
    }

    fn read_macro_args(&mut self, remaining: &mut VecDeque<Token>, mac: &Macro, invocation: &Token) -> Result<(Vec<Vec<Token>>, Token), CompileError> {
        let mut args = Vec::new();
        let mut current = Vec::new();
        let mut level = 0i32;
        let close_paren;
        loop {
            let Some(t) = remaining.pop_front() else {
                return Err(CompileError::preprocess(
                    invocation.file.clone(),
                    invocation.offset,
                    "unterminated macro invocation",
                ));
            };
            if level == 0 && t.is(")") {
                args.push(current);
                close_paren = t;
                break;
            }
            if level == 0 && t.is(",") && !(mac.is_variadic && args.len() >= mac.params.len()) {
                args.push(std::mem::take(&mut current));
                continue;
            }
            if t.is("(") {
                level += 1;
            } else if t.is(")") {
                level -= 1;
            }
            current.push(t);
        }
        Ok((args, close_paren))
    }

    fn subst(&mut self, body: &[Token], args: &HashMap<String, Vec<Token>>) -> Result<Vec<Token>, CompileError> {
        let mut out: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let t = &body[i];

            if t.is("#") && i + 1 < body.len() {
                let param = &body[i + 1];
                let name = param.text_owned();
                if let Some(arg) = args.get(&name) {
                    out.push(stringize(t, arg));
                    i += 2;
                    continue;
                }
            }

            if t.is("##") {
                let rhs_tokens: Vec<Token> = if i + 1 < body.len() {
                    let next = &body[i + 1];
                    let name = next.text_owned();
                    if let Some(arg) = args.get(&name) {
                        arg.clone()
                    } else {
                        vec![next.clone()]
                    }
                } else {
                    Vec::new()
                };
                if let Some(last) = out.pop() {
                    if rhs_tokens.is_empty() {
                        out.push(last);
                    } else {
                        let pasted = self.paste(&last, &rhs_tokens[0])?;
                        out.push(pasted);
                        out.extend_from_slice(&rhs_tokens[1..]);
                    }
                } else {
                    out.extend(rhs_tokens);
                }
                i += 2;
                continue;
            }

            if t.is_ident() {
                let name = t.text_owned();
                // Adjacent-to-## handled above; here handle a bare parameter reference,
                // fully macro-expanding its argument first.
                if let Some(arg) = args.get(&name) {
                    if body.get(i + 1).is_some_and(|n| n.is("##")) {
                        out.push(arg.first().cloned().unwrap_or_else(|| t.clone()));
                        if arg.len() > 1 {
                            out.extend_from_slice(&arg[1..]);
                        }
                        i += 1;
                        continue;
                    }
                    let mut expanded = self.preprocess_stream(append_eof(arg.clone(), t))?;
                    expanded.pop(); // drop synthesized Eof
                    if let Some(first) = expanded.first_mut() {
                        first.at_bol = t.at_bol;
                        first.has_space = t.has_space;
                    }
                    out.extend(expanded);
                    i += 1;
                    continue;
                }
            }

            out.push(t.clone());
            i += 1;
        }
        Ok(out)
    }

    fn paste(&mut self, lhs: &Token, rhs: &Token) -> Result<Token, CompileError> {
        let text = format!("{}{}", lhs.text_owned(), rhs.text_owned());
        let file = self.source_table.add("<paste>", text.clone());
        let mut tokens = tokenize(&file)?;
        tokens.pop(); // Eof
        if tokens.len() != 1 {
            return Err(CompileError::preprocess(lhs.file.clone(), lhs.offset, format!("pasting forms '{text}', an invalid token")));
        }
        let mut tok = tokens.into_iter().next().unwrap();
        tok.at_bol = lhs.at_bol;
        tok.has_space = lhs.has_space;
        Ok(tok)
    }
}

fn splice_front(remaining: &mut VecDeque<Token>, tokens: Vec<Token>) {
    for t in tokens.into_iter().rev() {
        remaining.push_front(t);
    }
}

fn append_eof(mut tokens: Vec<Token>, like: &Token) -> Vec<Token> {
    tokens.push(Token {
        kind: TokenKind::Eof,
        file: like.file.clone(),
        offset: like.offset,
        len: 0,
        line_no: like.line_no,
        at_bol: true,
        has_space: false,
        hideset: HideSet::empty(),
        ival: 0,
        fval: 0.0,
        num_kind: None,
        str_val: None,
    });
    tokens
}

fn stringize(hash: &Token, arg: &[Token]) -> Token {
    let mut s = String::new();
    for (i, t) in arg.iter().enumerate() {
        if i > 0 && t.has_space {
            s.push(' ');
        }
        s.push_str(&t.text_owned());
    }
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    let mut bytes = escaped.into_bytes();
    bytes.push(0);
    Token {
        kind: TokenKind::Str,
        file: hash.file.clone(),
        offset: hash.offset,
        len: hash.len,
        line_no: hash.line_no,
        at_bol: hash.at_bol,
        has_space: hash.has_space,
        hideset: HideSet::empty(),
        ival: 0,
        fval: 0.0,
        num_kind: None,
        str_val: Some(bytes),
    }
}

/// Reclassifies `Ident` tokens whose spelling is a reserved keyword.
fn convert_keywords(tokens: &mut [Token]) {
    for t in tokens.iter_mut() {
        if t.kind == TokenKind::Ident && crate::KEYWORDS.contains(&t.text_owned().as_str()) {
            t.kind = TokenKind::Keyword;
        }
    }
}

/// A small self-contained integer constant-expression evaluator for
/// `#if`/`#elif` lines (the full parser's `const_expr` is unavailable
/// at preprocess time since it runs over raw, not yet type-annotated,
/// tokens).
fn eval_const_expr(tokens: &[Token]) -> Result<i64, CompileError> {
    let mut p = ExprCursor { tokens, pos: 0 };
    let v = p.conditional()?;
    Ok(v)
}

struct ExprCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> ExprCursor<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }
    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }
    fn eat(&mut self, s: &str) -> bool {
        if self.peek().is_some_and(|t| t.is(s)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn conditional(&mut self) -> Result<i64, CompileError> {
        let cond = self.logor()?;
        if self.eat("?") {
            let then = self.conditional()?;
            self.eat(":");
            let els = self.conditional()?;
            return Ok(if cond != 0 { then } else { els });
        }
        Ok(cond)
    }
    fn logor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.logand()?;
        while self.eat("||") {
            let rhs = self.logand()?;
            v = ((v != 0) || (rhs != 0)) as i64;
        }
        Ok(v)
    }
    fn logand(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitor()?;
        while self.eat("&&") {
            let rhs = self.bitor()?;
            v = ((v != 0) && (rhs != 0)) as i64;
        }
        Ok(v)
    }
    fn bitor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitxor()?;
        while self.eat("|") {
            v |= self.bitxor()?;
        }
        Ok(v)
    }
    fn bitxor(&mut self) -> Result<i64, CompileError> {
        let mut v = self.bitand()?;
        while self.eat("^") {
            v ^= self.bitand()?;
        }
        Ok(v)
    }
    fn bitand(&mut self) -> Result<i64, CompileError> {
        let mut v = self.equality()?;
        while self.eat("&") {
            v &= self.equality()?;
        }
        Ok(v)
    }
    fn equality(&mut self) -> Result<i64, CompileError> {
        let mut v = self.relational()?;
        loop {
            if self.eat("==") {
                v = (v == self.relational()?) as i64;
            } else if self.eat("!=") {
                v = (v != self.relational()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }
    fn relational(&mut self) -> Result<i64, CompileError> {
        let mut v = self.shift()?;
        loop {
            if self.eat("<") {
                v = (v < self.shift()?) as i64;
            } else if self.eat("<=") {
                v = (v <= self.shift()?) as i64;
            } else if self.eat(">") {
                v = (v > self.shift()?) as i64;
            } else if self.eat(">=") {
                v = (v >= self.shift()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }
    fn shift(&mut self) -> Result<i64, CompileError> {
        let mut v = self.add()?;
        loop {
            if self.eat("<<") {
                v <<= self.add()?;
            } else if self.eat(">>") {
                v >>= self.add()?;
            } else {
                return Ok(v);
            }
        }
    }
    fn add(&mut self) -> Result<i64, CompileError> {
        let mut v = self.mul()?;
        loop {
            if self.eat("+") {
                v += self.mul()?;
            } else if self.eat("-") {
                v -= self.mul()?;
            } else {
                return Ok(v);
            }
        }
    }
    fn mul(&mut self) -> Result<i64, CompileError> {
        let mut v = self.unary()?;
        loop {
            if self.eat("*") {
                v *= self.unary()?;
            } else if self.eat("/") {
                let rhs = self.unary()?;
                v = if rhs == 0 { 0 } else { v / rhs };
            } else if self.eat("%") {
                let rhs = self.unary()?;
                v = if rhs == 0 { 0 } else { v % rhs };
            } else {
                return Ok(v);
            }
        }
    }
    fn unary(&mut self) -> Result<i64, CompileError> {
        if self.eat("-") {
            return Ok(-self.unary()?);
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("!") {
            return Ok((self.unary()? == 0) as i64);
        }
        if self.eat("~") {
            return Ok(!self.unary()?);
        }
        self.primary()
    }
    fn primary(&mut self) -> Result<i64, CompileError> {
        if self.eat("(") {
            let v = self.conditional()?;
            self.eat(")");
            return Ok(v);
        }
        let Some(t) = self.bump() else {
            return Ok(0);
        };
        if t.is_num() {
            return Ok(t.ival);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::source::SourceFileTable;

    fn run(src: &str) -> Vec<Token> {
        let config = CompilerConfig::default();
        let mut table = SourceFileTable::new();
        let file = table.add("t.c", src);
        let tokens = tokenize(&file).unwrap();
        let mut pp = Preprocessor::new(&config, &mut table, std::env::current_dir().unwrap());
        pp.run(tokens).unwrap()
    }

    #[test]
    fn macro_recursion_stops_at_self_reference() {
        let out = run("#define A B\n#define B A\nA\n");
        let idents: Vec<_> = out.iter().filter(|t| t.is_ident()).map(|t| t.text_owned()).collect();
        assert_eq!(idents, vec!["A"]);
    }

    #[test]
    fn object_like_macro_expands() {
        let out = run("#define N 42\nN\n");
        let nums: Vec<_> = out.iter().filter(|t| t.is_num()).map(|t| t.ival).collect();
        assert_eq!(nums, vec![42]);
    }

    #[test]
    fn function_like_macro_substitutes_arguments() {
        let out = run("#define ADD(a,b) ((a)+(b))\nADD(1,2)\n");
        let nums: Vec<_> = out.iter().filter(|t| t.is_num()).map(|t| t.ival).collect();
        assert_eq!(nums, vec![1, 2]);
    }

    #[test]
    fn conditional_inclusion_with_defined() {
        let out = run("#define X\n#if defined(X) && !defined(Y)\nyes\n#else\nno\n#endif\n");
        let idents: Vec<_> = out.iter().filter(|t| t.is_ident()).map(|t| t.text_owned()).collect();
        assert_eq!(idents, vec!["yes"]);
    }

    #[test]
    fn undef_then_redefine_is_visible() {
        let out = run("#define X 1\n#undef X\n#ifdef X\nyes\n#else\nno\n#endif\n");
        let idents: Vec<_> = out.iter().filter(|t| t.is_ident()).map(|t| t.text_owned()).collect();
        assert_eq!(idents, vec!["no"]);
    }

    #[test]
    fn stringize_operator_quotes_argument_text() {
        let out = run("#define STR(x) #x\nSTR(hello)\n");
        let strs: Vec<_> = out.iter().filter(|t| t.kind == TokenKind::Str).collect();
        assert_eq!(strs.len(), 1);
        let bytes = strs[0].str_val.as_ref().unwrap();
        assert_eq!(&bytes[..bytes.len() - 1], b"hello");
    }
}
