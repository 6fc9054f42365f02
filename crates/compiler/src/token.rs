//! Token representation and hidesets.

use crate::source::SourceFile;
use std::rc::Rc;

/// A persistent, structurally-shared set of macro names forbidden from
/// re-expanding a token. Implemented as a cons-list so that
/// [`hideset_union`] and [`hideset_intersection`] can share tails
/// instead of deep-copying.
#[derive(Debug, Clone, Default)]
pub struct HideSet(Option<Rc<HideSetNode>>);

#[derive(Debug)]
struct HideSetNode {
    name: Rc<str>,
    next: Option<Rc<HideSetNode>>,
}

impl HideSet {
    pub fn empty() -> Self {
        HideSet(None)
    }

    pub fn contains(&self, name: &str) -> bool {
        let mut cur = self.0.as_ref();
        while let Some(node) = cur {
            if &*node.name == name {
                return true;
            }
            cur = node.next.as_ref();
        }
        false
    }

    /// `self ∪ {name}`.
    pub fn add(&self, name: &str) -> HideSet {
        if self.contains(name) {
            return self.clone();
        }
        HideSet(Some(Rc::new(HideSetNode {
            name: Rc::from(name),
            next: self.0.clone(),
        })))
    }

    /// `self ∪ other`.
    pub fn union(&self, other: &HideSet) -> HideSet {
        let mut result = other.clone();
        let mut cur = self.0.as_ref();
        while let Some(node) = cur {
            result = result.add(&node.name);
            cur = node.next.as_ref();
        }
        result
    }

    /// Names present in both sets.
    pub fn intersection(&self, other: &HideSet) -> HideSet {
        let mut result = HideSet::empty();
        let mut cur = self.0.as_ref();
        while let Some(node) = cur {
            if other.contains(&node.name) {
                result = result.add(&node.name);
            }
            cur = node.next.as_ref();
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Punct,
    Ident,
    Keyword,
    Num,
    Str,
    Eof,
}

/// A single lexical token.
///
/// `offset`/`len` index into the owning [`SourceFile`]'s `contents`.
/// `hideset` and `origin` are populated only by the preprocessor;
/// tokens fresh out of the tokenizer carry an empty hideset and no
/// origin.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub file: Rc<SourceFile>,
    pub offset: usize,
    pub len: usize,
    pub line_no: i32,
    pub at_bol: bool,
    pub has_space: bool,
    pub hideset: HideSet,

    pub ival: i64,
    pub fval: f64,
    pub num_kind: Option<NumKind>,
    pub str_val: Option<Vec<u8>>,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.offset..self.offset + self.len]
    }

    pub fn text_owned(&self) -> String {
        self.file.contents[self.offset..self.offset + self.len].to_string()
    }

    pub fn is(&self, s: &str) -> bool {
        matches!(self.kind, TokenKind::Punct | TokenKind::Keyword | TokenKind::Ident)
            && &self.file.contents[self.offset..self.offset + self.len] == s
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Ident)
    }

    pub fn is_num(&self) -> bool {
        matches!(self.kind, TokenKind::Num)
    }
}

/// Index into a [`crate::preprocessor::TokenArena`]-style `Vec<Token>`.
///
/// Streams threaded through the preprocessor and parser are plain
/// `Vec<TokenId>`/slices of indices rather than pointer-linked lists,
/// per the "pointer graphs in tokens" design note.
pub type TokenId = usize;
