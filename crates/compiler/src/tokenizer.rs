//! Lexical analysis: source bytes to a flat token vector.

use crate::error::CompileError;
use crate::source::SourceFile;
use crate::token::{HideSet, NumKind, Token, TokenKind};
use std::rc::Rc;

const PUNCTUATORS: &[&str] = &[
    "<<=", ">>=", "...", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "++", "--", "%=",
    "&=", "|=", "^=", "&&", "||", "<<", ">>", "::",
];

pub fn tokenize(file: &Rc<SourceFile>) -> Result<Vec<Token>, CompileError> {
    let src = file.contents.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let mut at_bol = true;
    let mut has_space = false;

    macro_rules! push {
        ($kind:expr, $start:expr, $len:expr) => {{
            tokens.push(Token {
                kind: $kind,
                file: file.clone(),
                offset: $start,
                len: $len,
                line_no: 0,
                at_bol,
                has_space,
                hideset: HideSet::empty(),
                ival: 0,
                fval: 0.0,
                num_kind: None,
                str_val: None,
            });
            at_bol = false;
            has_space = false;
        }};
    }

    while i < src.len() {
        let c = src[i];

        if c == b'\n' {
            i += 1;
            at_bol = true;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            has_space = true;
            continue;
        }

        // Line comment.
        if c == b'/' && src.get(i + 1) == Some(&b'/') {
            while i < src.len() && src[i] != b'\n' {
                i += 1;
            }
            has_space = true;
            continue;
        }
        // Block comment.
        if c == b'/' && src.get(i + 1) == Some(&b'*') {
            let start = i;
            i += 2;
            loop {
                if i + 1 >= src.len() {
                    return Err(CompileError::lex(file.clone(), start, "unterminated block comment"));
                }
                if src[i] == b'*' && src[i + 1] == b'/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            has_space = true;
            continue;
        }

        // Numeric literal.
        if c.is_ascii_digit() || (c == b'.' && src.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let start = i;
            let (end, ival, fval, kind) = read_number(src, i, file, start)?;
            tokens.push(Token {
                kind: TokenKind::Num,
                file: file.clone(),
                offset: start,
                len: end - start,
                line_no: 0,
                at_bol,
                has_space,
                hideset: HideSet::empty(),
                ival,
                fval,
                num_kind: Some(kind),
                str_val: None,
            });
            at_bol = false;
            has_space = false;
            i = end;
            continue;
        }

        // String literal.
        if c == b'"' {
            let start = i;
            i += 1;
            let mut bytes = Vec::new();
            while i < src.len() && src[i] != b'"' {
                if src[i] == b'\\' {
                    let (ch, next) = read_escape(src, i + 1, file, start)?;
                    bytes.push(ch);
                    i = next;
                } else {
                    bytes.push(src[i]);
                    i += 1;
                }
            }
            if i >= src.len() {
                return Err(CompileError::lex(file.clone(), start, "unterminated string literal"));
            }
            i += 1; // closing quote
            bytes.push(0);
            tokens.push(Token {
                kind: TokenKind::Str,
                file: file.clone(),
                offset: start,
                len: i - start,
                line_no: 0,
                at_bol,
                has_space,
                hideset: HideSet::empty(),
                ival: 0,
                fval: 0.0,
                num_kind: None,
                str_val: Some(bytes),
            });
            at_bol = false;
            has_space = false;
            continue;
        }

        // Character literal.
        if c == b'\'' {
            let start = i;
            i += 1;
            let ival = if i < src.len() && src[i] == b'\\' {
                let (ch, next) = read_escape(src, i + 1, file, start)?;
                i = next;
                ch as i8 as i64
            } else if i < src.len() {
                let ch = src[i] as i8 as i64;
                i += 1;
                ch
            } else {
                return Err(CompileError::lex(file.clone(), start, "unterminated char literal"));
            };
            if i >= src.len() || src[i] != b'\'' {
                return Err(CompileError::lex(file.clone(), start, "unterminated char literal"));
            }
            i += 1;
            push!(TokenKind::Num, start, i - start);
            let last = tokens.last_mut().unwrap();
            last.ival = ival;
            last.num_kind = Some(NumKind::Int);
            continue;
        }

        // Identifier / keyword (keyword classification happens post-preprocess).
        if c == b'_' || c.is_ascii_alphabetic() || c >= 0x80 {
            let start = i;
            while i < src.len() && (src[i] == b'_' || src[i].is_ascii_alphanumeric() || src[i] >= 0x80) {
                i += 1;
            }
            push!(TokenKind::Ident, start, i - start);
            continue;
        }

        // Punctuator: longest match first.
        let rest = &file.contents[i..];
        if let Some(p) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            let len = p.len();
            push!(TokenKind::Punct, i, len);
            i += len;
            continue;
        }
        if c.is_ascii_punctuation() {
            push!(TokenKind::Punct, i, 1);
            i += 1;
            continue;
        }

        return Err(CompileError::lex(file.clone(), i, "invalid token"));
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        file: file.clone(),
        offset: src.len(),
        len: 0,
        line_no: 0,
        at_bol,
        has_space,
        hideset: HideSet::empty(),
        ival: 0,
        fval: 0.0,
        num_kind: None,
        str_val: None,
    });

    add_line_numbers(&mut tokens, src);
    Ok(tokens)
}

/// Single linear pass stamping `line_no` on every token (parallel scan
/// over the source bytes and the already-built token vector, avoiding
/// a per-token binary search).
fn add_line_numbers(tokens: &mut [Token], src: &[u8]) {
    let mut line = 1i32;
    let mut pos = 0usize;
    for tok in tokens.iter_mut() {
        while pos < tok.offset {
            if src[pos] == b'\n' {
                line += 1;
            }
            pos += 1;
        }
        tok.line_no = line + tok.file.line_delta;
    }
}

fn read_number(
    src: &[u8],
    mut i: usize,
    file: &Rc<SourceFile>,
    start: usize,
) -> Result<(usize, i64, f64, NumKind), CompileError> {
    // Hex / binary / octal integer prefixes.
    if src[i] == b'0' && matches!(src.get(i + 1), Some(b'x') | Some(b'X')) {
        i += 2;
        let digit_start = i;
        while i < src.len() && src[i].is_ascii_hexdigit() {
            i += 1;
        }
        if i == digit_start {
            return Err(CompileError::lex(file.clone(), start, "invalid hex digit"));
        }
        let text = std::str::from_utf8(&src[digit_start..i]).unwrap();
        let val = u64::from_str_radix(text, 16).unwrap_or(0);
        let (end, kind) = read_int_suffix_nondecimal(src, i, val);
        return Ok((end, val as i64, 0.0, kind));
    }
    if src[i] == b'0' && matches!(src.get(i + 1), Some(b'b') | Some(b'B')) {
        i += 2;
        let digit_start = i;
        while i < src.len() && matches!(src[i], b'0' | b'1') {
            i += 1;
        }
        let text = std::str::from_utf8(&src[digit_start..i]).unwrap();
        let val = u64::from_str_radix(text, 2).unwrap_or(0);
        let (end, kind) = read_int_suffix_nondecimal(src, i, val);
        return Ok((end, val as i64, 0.0, kind));
    }
    if src[i] == b'0' && src.get(i + 1).is_some_and(u8::is_ascii_digit) {
        let digit_start = i;
        i += 1;
        while i < src.len() && matches!(src[i], b'0'..=b'7') {
            i += 1;
        }
        let text = std::str::from_utf8(&src[digit_start + 1..i]).unwrap();
        let val = u64::from_str_radix(text, 8).unwrap_or(0);
        let (end, kind) = read_int_suffix_nondecimal(src, i, val);
        return Ok((end, val as i64, 0.0, kind));
    }

    // Decimal integer or floating literal.
    let digit_start = i;
    while i < src.len() && src[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_float = false;
    if i < src.len() && src[i] == b'.' {
        is_float = true;
        i += 1;
        while i < src.len() && src[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < src.len() && matches!(src[i], b'e' | b'E') {
        is_float = true;
        i += 1;
        if i < src.len() && matches!(src[i], b'+' | b'-') {
            i += 1;
        }
        while i < src.len() && src[i].is_ascii_digit() {
            i += 1;
        }
    }

    if is_float {
        let text = std::str::from_utf8(&src[digit_start..i]).unwrap();
        let fval: f64 = text.parse().unwrap_or(0.0);
        let mut kind = NumKind::Double;
        if i < src.len() && matches!(src[i], b'f' | b'F') {
            kind = NumKind::Float;
            i += 1;
        } else if i < src.len() && matches!(src[i], b'l' | b'L') {
            i += 1; // long double folded to double
        }
        return Ok((i, 0, fval, kind));
    }

    let text = std::str::from_utf8(&src[digit_start..i]).unwrap();
    let val: u64 = text.parse().unwrap_or(0);
    let (end, kind) = read_int_suffix_decimal(src, i, val);
    Ok((end, val as i64, 0.0, kind))
}

/// Decimal suffix/width rule from §4.1: `int` unless it doesn't fit.
fn read_int_suffix_decimal(src: &[u8], i: usize, val: u64) -> (usize, NumKind) {
    let (end, has_u, has_l) = read_suffix_letters(src, i);
    let kind = if has_u && has_l {
        NumKind::ULong
    } else if has_l {
        NumKind::Long
    } else if has_u {
        if val > u32::MAX as u64 { NumKind::ULong } else { NumKind::UInt }
    } else if val > i32::MAX as u64 {
        NumKind::Long
    } else {
        NumKind::Int
    };
    (end, kind)
}

/// Hex/octal/binary bases pick width from the bit pattern directly.
fn read_int_suffix_nondecimal(src: &[u8], i: usize, val: u64) -> (usize, NumKind) {
    let (end, has_u, has_l) = read_suffix_letters(src, i);
    let kind = if has_u && has_l {
        NumKind::ULong
    } else if has_l {
        if val & (1u64 << 63) != 0 { NumKind::ULong } else { NumKind::Long }
    } else if has_u {
        if val > u32::MAX as u64 { NumKind::ULong } else { NumKind::UInt }
    } else if val & (1u64 << 63) != 0 {
        NumKind::ULong
    } else if val > u32::MAX as u64 {
        NumKind::Long
    } else if val & (1u64 << 31) != 0 {
        NumKind::UInt
    } else {
        NumKind::Int
    };
    (end, kind)
}

fn read_suffix_letters(src: &[u8], mut i: usize) -> (usize, bool, bool) {
    let mut has_u = false;
    let mut has_l = false;
    loop {
        match src.get(i) {
            Some(b'u') | Some(b'U') if !has_u => {
                has_u = true;
                i += 1;
            }
            Some(b'l') | Some(b'L') if !has_l => {
                has_l = true;
                i += 1;
                // `ll`/`LL` is just `l` width-wise.
                if src.get(i) == Some(&src[i - 1]) {
                    i += 1;
                }
            }
            _ => break,
        }
    }
    (i, has_u, has_l)
}

/// Decode one backslash escape starting just past the `\`. Returns the
/// decoded byte and the index of the first unconsumed byte.
fn read_escape(
    src: &[u8],
    i: usize,
    file: &Rc<SourceFile>,
    start: usize,
) -> Result<(u8, usize), CompileError> {
    if i >= src.len() {
        return Err(CompileError::lex(file.clone(), start, "unterminated escape sequence"));
    }
    let c = src[i];
    let simple = match c {
        b'a' => Some(0x07),
        b'b' => Some(0x08),
        b't' => Some(b'\t'),
        b'n' => Some(b'\n'),
        b'v' => Some(0x0b),
        b'f' => Some(0x0c),
        b'r' => Some(b'\r'),
        b'e' => Some(0x1b),
        b'\\' => Some(b'\\'),
        b'"' => Some(b'"'),
        b'\'' => Some(b'\''),
        b'?' => Some(b'?'),
        _ => None,
    };
    if let Some(v) = simple {
        return Ok((v, i + 1));
    }
    if c == b'x' {
        let mut j = i + 1;
        let mut val: u32 = 0;
        if j >= src.len() || !src[j].is_ascii_hexdigit() {
            return Err(CompileError::lex(file.clone(), start, "invalid hex escape sequence"));
        }
        while j < src.len() && src[j].is_ascii_hexdigit() {
            val = val * 16 + (src[j] as char).to_digit(16).unwrap();
            j += 1;
        }
        return Ok((val as u8, j));
    }
    if (b'0'..=b'7').contains(&c) {
        let mut j = i;
        let mut val: u32 = 0;
        let mut count = 0;
        while j < src.len() && (b'0'..=b'7').contains(&src[j]) && count < 3 {
            val = val * 8 + (src[j] - b'0') as u32;
            j += 1;
            count += 1;
        }
        return Ok((val as u8, j));
    }
    // Unknown escape: pass the character through literally.
    Ok((c, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceFileTable;

    fn toks(src: &str) -> Vec<Token> {
        let mut table = SourceFileTable::new();
        let file = table.add("t.c", src);
        tokenize(&file).unwrap()
    }

    #[test]
    fn tokenizes_arithmetic_expression() {
        let tokens = toks("1+2*3;");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert!(matches!(kinds[0], TokenKind::Num));
        assert_eq!(tokens[0].ival, 1);
        assert!(matches!(kinds.last(), Some(TokenKind::Eof)));
    }

    #[test]
    fn classifies_integer_suffix_widths() {
        let tokens = toks("2147483648 4294967296U 10UL");
        assert_eq!(tokens[0].num_kind, Some(NumKind::Long));
        assert_eq!(tokens[1].num_kind, Some(NumKind::ULong));
        assert_eq!(tokens[2].num_kind, Some(NumKind::ULong));
    }

    #[test]
    fn decodes_string_escapes() {
        let tokens = toks("\"a\\nb\"");
        let bytes = tokens[0].str_val.as_ref().unwrap();
        assert_eq!(bytes, &[b'a', b'\n', b'b', 0]);
    }

    #[test]
    fn rejects_unterminated_string() {
        let mut table = SourceFileTable::new();
        let file = table.add("t.c", "\"abc");
        assert!(tokenize(&file).is_err());
    }

    #[test]
    fn sets_at_bol_and_has_space() {
        let tokens = toks("a\n  b");
        assert!(tokens[0].at_bol);
        assert!(tokens[1].at_bol);
        assert!(tokens[1].has_space);
    }

    #[test]
    fn char_literal_sign_extends_high_byte() {
        let tokens = toks("'\\xff'");
        assert_eq!(tokens[0].ival, -1);
    }
}
