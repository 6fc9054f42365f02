//! Recursive-descent parser: declarations, expressions, statements, and
//! the initializer tree, producing a typed AST over a flat object table.
//!
//! The parser walks a flat token slice by index (a [`TokenId`] cursor)
//! rather than a pointer-linked token list, and owns the AST directly
//! (`Box<Node>` children) rather than arena-allocating nodes, following
//! the "pointer graphs in tokens" design note: everything that used to
//! be a C pointer into shared storage becomes either an index or plain
//! ownership.

use crate::ast::{InitDesg, Initializer, Node, NodeKind, Obj, ObjId, Relocation};
use crate::error::CompileError;
use crate::scope::{ScopeStack, VarBinding};
use crate::token::{NumKind, Token, TokenId, TokenKind};
use crate::types::{
    self, Member, Type, align_to, array_of, enum_type, func_type, get_common_type, pointer_to, struct_type,
    ty_bool, ty_char, ty_double, ty_float, ty_int, ty_long, ty_short, ty_uchar, ty_uint, ty_ulong, ty_ushort,
    ty_void, union_type, vla_of,
};
use std::collections::HashSet;
use std::rc::Rc;

const TYPE_KEYWORDS: &[&str] = &[
    "void", "_Bool", "char", "short", "int", "long", "struct", "union", "typedef", "enum", "static",
    "extern", "_Alignas", "signed", "unsigned", "const", "volatile", "register", "restrict",
    "__restrict", "__restrict__", "_Noreturn", "inline",
];

/// Storage-class / alignment attributes gathered alongside a `declspec`.
#[derive(Default, Clone)]
struct VarAttr {
    is_typedef: bool,
    is_static: bool,
    is_extern: bool,
    align: Option<i64>,
}

/// The result of parsing a translation unit: every function and global
/// variable, in declaration order. `codegen` walks this list twice:
/// once for layout, once for emission.
pub struct ParsedProgram {
    pub objs: Vec<Obj>,
    pub program: Vec<ObjId>,
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: TokenId,
    objs: Vec<Obj>,
    program: Vec<ObjId>,
    scopes: ScopeStack,
    func_locals: Vec<ObjId>,
    current_fn_name: String,
    current_fn_variadic: bool,
    brk_label: Option<String>,
    cont_label: Option<String>,
    switch_cases: Option<Vec<(Option<i64>, String)>>,
    switch_has_default: bool,
    unique: u32,
    string_count: u32,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Parser {
            tokens,
            pos: 0,
            objs: Vec::new(),
            program: Vec::new(),
            scopes: ScopeStack::new(),
            func_locals: Vec::new(),
            current_fn_name: String::new(),
            current_fn_variadic: false,
            brk_label: None,
            cont_label: None,
            switch_cases: None,
            switch_has_default: false,
            unique: 0,
            string_count: 0,
        }
    }

    // ---- token cursor -----------------------------------------------

    fn tok(&self, id: TokenId) -> &'a Token {
        &self.tokens[id]
    }

    fn cur(&self) -> &'a Token {
        &self.tokens[self.pos]
    }

    fn text(&self, id: TokenId) -> &'a str {
        let t = &self.tokens[id];
        &t.file.contents[t.offset..t.offset + t.len]
    }

    fn is(&self, s: &str) -> bool {
        self.cur().is(s)
    }

    fn at_eof(&self) -> bool {
        self.cur().is_eof()
    }

    fn advance(&mut self) -> TokenId {
        let id = self.pos;
        if !self.at_eof() {
            self.pos += 1;
        }
        id
    }

    fn err_here(&self, message: impl Into<String>) -> CompileError {
        let t = self.cur();
        CompileError::parse(t.file.clone(), t.offset, message)
    }

    fn err_at(&self, id: TokenId, message: impl Into<String>) -> CompileError {
        let t = self.tok(id);
        CompileError::parse(t.file.clone(), t.offset, message)
    }

    fn skip(&mut self, s: &str) -> Result<TokenId, CompileError> {
        if !self.is(s) {
            return Err(self.err_here(format!("expected '{s}'")));
        }
        Ok(self.advance())
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.is(s) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// `}` or a trailing comma followed by `}`, the shared "end of an
    /// initializer/enum list" check.
    fn consume_end(&mut self) -> bool {
        if self.is("}") {
            self.advance();
            return true;
        }
        if self.is(",") {
            let save = self.pos;
            self.advance();
            if self.is("}") {
                self.advance();
                return true;
            }
            self.pos = save;
        }
        false
    }

    fn is_end(&self) -> bool {
        self.is("}") || (self.is(",") && self.tok(self.pos + 1).is("}"))
    }

    fn new_unique_name(&mut self) -> String {
        self.unique += 1;
        format!(".L..{}", self.unique)
    }

    // ---- object table -------------------------------------------------

    fn new_obj(&mut self, name: impl Into<String>, ty: Type) -> ObjId {
        let align = ty.align();
        let id = self.objs.len();
        self.objs.push(Obj {
            name: name.into(),
            ty,
            tok: self.pos,
            is_local: false,
            is_static: false,
            is_definition: false,
            is_tentative: false,
            align,
            offset: 0,
            init_data: None,
            relocations: Vec::new(),
            params: Vec::new(),
            body: None,
            locals: Vec::new(),
            va_area: None,
            stack_size: 0,
        });
        id
    }

    fn new_lvar(&mut self, name: impl Into<String>, ty: Type) -> ObjId {
        let name = name.into();
        let id = self.new_obj(name.clone(), ty.clone());
        self.objs[id].is_local = true;
        self.func_locals.push(id);
        self.scopes.push_var(name, VarBinding::Var(id));
        id
    }

    fn new_gvar(&mut self, name: impl Into<String>, ty: Type) -> ObjId {
        let name = name.into();
        let id = self.new_obj(name.clone(), ty);
        self.objs[id].is_definition = true;
        self.scopes.push_var(name, VarBinding::Var(id));
        self.program.push(id);
        id
    }

    fn new_anon_gvar(&mut self, ty: Type) -> ObjId {
        let name = self.new_unique_name();
        let id = self.new_obj(name, ty);
        self.objs[id].is_definition = true;
        self.program.push(id);
        id
    }

    fn new_string_literal(&mut self, bytes: Vec<u8>) -> ObjId {
        self.string_count += 1;
        let ty = array_of(ty_char(), bytes.len() as i64);
        let id = self.new_anon_gvar(ty);
        self.objs[id].is_static = true;
        self.objs[id].init_data = Some(bytes);
        id
    }

    /// A `Var` reference node, typed immediately from the object table
    /// (the `add_type` pass can't resolve `Var` on its own since it has
    /// no access to `self.objs`, so every construction site goes
    /// through here rather than a bare `Node::new`).
    fn var_node(&self, id: ObjId, tok: TokenId) -> Node {
        let node = Node::new(NodeKind::Var { var: id }, tok);
        node.set_ty(self.objs[id].ty.clone());
        node
    }

    // ==================================================================
    // Top level
    // ==================================================================

    /// `program = (typedef | function-definition | global-variable)*`
    pub fn parse(mut self) -> Result<ParsedProgram, CompileError> {
        while !self.at_eof() {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            if attr.is_typedef {
                self.parse_typedef(basety)?;
                continue;
            }

            if self.is_function_start() {
                self.function(basety, &attr)?;
                continue;
            }

            self.global_variable(basety, &attr)?;
        }
        Ok(ParsedProgram { objs: self.objs, program: self.program })
    }

    fn parse_typedef(&mut self, basety: Type) -> Result<(), CompileError> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;
            let (ty, name) = self.declarator(basety.clone())?;
            let name = name.ok_or_else(|| self.err_here("typedef name omitted"))?;
            self.scopes.push_var(self.text(name).to_string(), VarBinding::Typedef(ty));
        }
        Ok(())
    }

    /// Peeks far enough past a declarator to tell whether this top-level
    /// declaration is a function (declarator yields a `TY_FUNC`) without
    /// consuming any tokens.
    fn is_function_start(&mut self) -> bool {
        if self.is(";") {
            return false;
        }
        let save = self.pos;
        let dummy = Type { 0: types::dummy_marker() };
        let result = self.declarator(dummy);
        self.pos = save;
        matches!(result, Ok((ty, _)) if ty.kind() == types::TypeKind::Func)
    }

    fn function(&mut self, basety: Type, attr: &VarAttr) -> Result<(), CompileError> {
        let (ty, name_tok) = self.declarator(basety)?;
        let name_tok = name_tok.ok_or_else(|| self.err_here("function name omitted"))?;
        let name = self.text(name_tok).to_string();

        let is_definition = !self.consume(";");

        let id = self.new_gvar(name.clone(), ty.clone());
        self.objs[id].is_static = attr.is_extern;
        self.objs[id].is_definition = is_definition;
        if !is_definition {
            return Ok(());
        }

        self.current_fn_name = name;
        self.current_fn_variadic = ty.is_variadic();
        self.func_locals.clear();
        self.scopes.enter();

        let mut params = Vec::new();
        for pty in ty.params() {
            let pname = pty
                .0
                .borrow()
                .name
                .ok_or_else(|| self.err_here("parameter name omitted"))?;
            let pname = self.text(pname).to_string();
            params.push(self.new_lvar(pname, pty));
        }
        self.objs[id].params = params;

        if ty.is_variadic() {
            let va = self.new_lvar("__va_area__", array_of(ty_char(), 136));
            self.objs[id].va_area = Some(va);
        }

        self.skip("{")?;

        // "__func__" is implicitly declared as a local variable holding the
        // current function's name (C11 6.4.2.2p1); "__FUNCTION__" is the GNU
        // spelling of the same thing.
        let mut fn_name_bytes = self.current_fn_name.clone().into_bytes();
        fn_name_bytes.push(0);
        let func_name_id = self.new_string_literal(fn_name_bytes.clone());
        self.scopes.push_var("__func__", VarBinding::Var(func_name_id));
        let function_name_id = self.new_string_literal(fn_name_bytes);
        self.scopes.push_var("__FUNCTION__", VarBinding::Var(function_name_id));

        let body = self.compound_stmt()?;
        self.check_labels(&body)?;

        self.scopes.leave();
        self.objs[id].body = Some(body);
        self.objs[id].locals = std::mem::take(&mut self.func_locals);
        Ok(())
    }

    fn global_variable(&mut self, basety: Type, attr: &VarAttr) -> Result<(), CompileError> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            let (ty, name_tok) = self.declarator(basety.clone())?;
            let name_tok = name_tok.ok_or_else(|| self.err_here("variable name omitted"))?;
            let name = self.text(name_tok).to_string();

            let id = self.new_gvar(name, ty.clone());
            self.objs[id].is_static = attr.is_static;
            self.objs[id].is_definition = !attr.is_extern;
            if let Some(align) = attr.align {
                self.objs[id].align = align;
            }

            if self.consume("=") {
                self.gvar_initializer(id)?;
            }
        }
        Ok(())
    }

    // ==================================================================
    // Declarations
    // ==================================================================

    /// declspec = ("void" | "_Bool" | "char" | "short" | "int" | "long"
    ///            | "typedef" | "static" | "extern" | "signed" | "unsigned"
    ///            | "_Alignas" ("(" typename | const-expr ")")
    ///            | struct-decl | union-decl | typedef-name
    ///            | enum-specifier)+
    ///
    /// The combination of basic-type keywords is tracked with a bitmask
    /// counter: each keyword bumps a differently-weighted field so that
    /// e.g. `long long int` and `int long long` both land on the same
    /// sum, and invalid combinations (`void int`) fail the final lookup.
    fn declspec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<Type, CompileError> {
        const VOID: i32 = 1 << 0;
        const BOOL: i32 = 1 << 2;
        const CHAR: i32 = 1 << 4;
        const SHORT: i32 = 1 << 6;
        const INT: i32 = 1 << 8;
        const LONG: i32 = 1 << 10;
        const OTHER: i32 = 1 << 12;
        const SIGNED: i32 = 1 << 13;
        const UNSIGNED: i32 = 1 << 14;

        let mut ty = ty_int();
        let mut counter = 0i32;

        loop {
            if !self.is_typename_tok() {
                break;
            }

            if self.is("typedef") || self.is("static") || self.is("extern") {
                let Some(a) = attr.as_deref_mut() else {
                    return Err(self.err_here("storage class specifier is not allowed in this context"));
                };
                if self.consume("typedef") {
                    a.is_typedef = true;
                } else if self.consume("static") {
                    a.is_static = true;
                } else {
                    self.advance();
                    a.is_extern = true;
                }
                if a.is_typedef && (a.is_static || a.is_extern) {
                    return Err(self.err_here("typedef may not be used together with static or extern"));
                }
                continue;
            }

            if self.is("const") || self.is("volatile") || self.is("register") || self.is("restrict")
                || self.is("__restrict") || self.is("__restrict__") || self.is("_Noreturn") || self.is("inline")
            {
                self.advance();
                continue;
            }

            if self.is("_Alignas") {
                let Some(a) = attr.as_deref_mut() else {
                    return Err(self.err_here("_Alignas is not allowed in this context"));
                };
                self.advance();
                self.skip("(")?;
                let align = if self.is_typename_tok() {
                    let ty = self.typename()?;
                    ty.align()
                } else {
                    self.const_expr()?
                };
                self.skip(")")?;
                a.align = Some(align);
                continue;
            }

            if self.is("struct") || self.is("union") {
                ty = self.struct_union_decl()?;
                counter += OTHER;
                continue;
            }
            if self.is("enum") {
                ty = self.enum_specifier()?;
                counter += OTHER;
                continue;
            }

            if let Some(found) = self.find_typedef() {
                ty = found;
                counter += OTHER;
                continue;
            }

            if self.consume("void") {
                counter += VOID;
            } else if self.consume("_Bool") {
                counter += BOOL;
            } else if self.consume("char") {
                counter += CHAR;
            } else if self.consume("short") {
                counter += SHORT;
            } else if self.consume("int") {
                counter += INT;
            } else if self.consume("long") {
                counter += LONG;
            } else if self.consume("signed") {
                counter |= SIGNED;
            } else if self.consume("unsigned") {
                counter |= UNSIGNED;
            } else {
                return Err(self.err_here("invalid type"));
            }

            ty = match counter {
                VOID => ty_void(),
                BOOL => ty_bool(),
                CHAR | SIGNED + CHAR => ty_char(),
                UNSIGNED + CHAR => ty_uchar(),
                SHORT | SHORT + INT | SIGNED + SHORT | SIGNED + SHORT + INT => ty_short(),
                UNSIGNED + SHORT | UNSIGNED + SHORT + INT => ty_ushort(),
                INT | SIGNED | SIGNED + INT => ty_int(),
                UNSIGNED | UNSIGNED + INT => ty_uint(),
                LONG | LONG + INT | LONG + LONG | LONG + LONG + INT | SIGNED + LONG | SIGNED + LONG + INT
                | SIGNED + LONG + LONG | SIGNED + LONG + LONG + INT => ty_long(),
                UNSIGNED + LONG | UNSIGNED + LONG + INT | UNSIGNED + LONG + LONG | UNSIGNED + LONG + LONG + INT => {
                    ty_ulong()
                }
                _ => return Err(self.err_here("invalid type")),
            };
        }

        Ok(ty)
    }

    fn is_typename_tok(&self) -> bool {
        let t = self.cur();
        if matches!(t.kind, TokenKind::Ident) {
            if TYPE_KEYWORDS.contains(&self.text(self.pos)) {
                return true;
            }
            return matches!(self.scopes.find_var(self.text(self.pos)), Some(VarBinding::Typedef(_)));
        }
        TYPE_KEYWORDS.contains(&self.text(self.pos))
    }

    fn find_typedef(&self) -> Option<Type> {
        if !matches!(self.cur().kind, TokenKind::Ident | TokenKind::Keyword) {
            return None;
        }
        match self.scopes.find_var(self.text(self.pos)) {
            Some(VarBinding::Typedef(ty)) => Some(ty.clone()),
            _ => None,
        }
    }

    /// `func-params = ("void" | param ("," param)* ("," "...")?)? ")"`
    fn func_params(&mut self, return_ty: Type) -> Result<Type, CompileError> {
        if self.is("void") && self.tok(self.pos + 1).is(")") {
            self.advance();
            self.advance();
            return Ok(func_type(return_ty, Vec::new(), false));
        }

        let mut params = Vec::new();
        let mut is_variadic = false;
        let mut first = true;
        while !self.is(")") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            if self.consume("...") {
                is_variadic = true;
                break;
            }

            let basety = self.declspec(None)?;
            let (mut ty, name_tok) = self.declarator(basety)?;
            // array/VLA/function parameters decay to pointers.
            if ty.kind() == types::TypeKind::Array || ty.kind() == types::TypeKind::Vla {
                ty = pointer_to(ty.base().unwrap());
            } else if ty.kind() == types::TypeKind::Func {
                ty = pointer_to(ty);
            }
            if let Some(nt) = name_tok {
                ty.set_name(nt);
            }
            params.push(ty);
        }
        self.skip(")")?;
        Ok(func_type(return_ty, params, is_variadic))
    }

    /// `array-dimensions = const-expr? "]" type-suffix`
    ///
    /// A bracketed dimension that isn't a compile-time constant (e.g.
    /// `int a[n]` with `n` a runtime variable) is accepted as a VLA
    /// dimension rather than a parse error; the resulting `Type::Vla`
    /// type-checks but is rejected later, at codegen, since stack
    /// save/restore lowering isn't implemented.
    fn array_dimensions(&mut self, base: Type) -> Result<Type, CompileError> {
        self.skip("[")?;
        if self.is("]") {
            self.advance();
            let base = self.type_suffix(base)?;
            return Ok(array_of(base, -1));
        }
        let dim_tok = self.pos;
        let mut dim = self.conditional()?;
        add_type(&mut dim);
        self.skip("]")?;
        let base = self.type_suffix(base)?;
        match self.eval(&dim) {
            Ok(len) => Ok(array_of(base, len)),
            Err(_) => Ok(vla_of(base, Some(dim_tok))),
        }
    }

    /// `type-suffix = "(" func-params | "[" array-dimensions | ε`
    fn type_suffix(&mut self, base: Type) -> Result<Type, CompileError> {
        if self.consume("(") {
            return self.func_params(base);
        }
        if self.is("[") {
            return self.array_dimensions(base);
        }
        Ok(base)
    }

    /// `declarator = "*"* ("(" declarator ")" | ident) type-suffix`
    ///
    /// Parenthesized declarators are resolved with the classic two-pass
    /// trick: the inner declarator is parsed once against a dummy base
    /// type just to find where the type-suffix starts, then re-parsed
    /// once the real base (built from that suffix) is known.
    fn declarator(&mut self, mut ty: Type) -> Result<(Type, Option<TokenId>), CompileError> {
        while self.consume("*") {
            ty = pointer_to(ty);
            while self.is("const") || self.is("volatile") || self.is("restrict") {
                self.advance();
            }
        }

        if self.consume("(") {
            let save = self.pos;
            let _ = self.declarator(Type(types::dummy_marker()))?;
            self.skip(")")?;
            let suffix_base = self.type_suffix(ty)?;
            let end = self.pos;
            self.pos = save;
            let (real, name) = self.declarator(suffix_base)?;
            self.pos = end;
            return Ok((real, name));
        }

        let name_tok = if matches!(self.cur().kind, TokenKind::Ident) && !TYPE_KEYWORDS.contains(&self.text(self.pos))
        {
            Some(self.advance())
        } else {
            None
        };

        let ty = self.type_suffix(ty)?;
        Ok((ty, name_tok))
    }

    /// `abstract-declarator = "*"* ("(" abstract-declarator ")")? type-suffix`
    fn abstract_declarator(&mut self, mut ty: Type) -> Result<Type, CompileError> {
        while self.consume("*") {
            ty = pointer_to(ty);
        }
        if self.consume("(") {
            let save = self.pos;
            let _ = self.abstract_declarator(Type(types::dummy_marker()))?;
            self.skip(")")?;
            let suffix_base = self.type_suffix(ty)?;
            let end = self.pos;
            self.pos = save;
            let real = self.abstract_declarator(suffix_base)?;
            self.pos = end;
            return Ok(real);
        }
        self.type_suffix(ty)
    }

    /// `typename = declspec abstract-declarator`
    fn typename(&mut self) -> Result<Type, CompileError> {
        let basety = self.declspec(None)?;
        self.abstract_declarator(basety)
    }

    // ---- struct / union / enum ---------------------------------------

    fn struct_union_decl(&mut self) -> Result<Type, CompileError> {
        let is_union = self.is("union");
        self.advance();

        let tag = if matches!(self.cur().kind, TokenKind::Ident) && !self.is("{") {
            Some(self.advance())
        } else {
            None
        };

        if let Some(tag) = tag
            && !self.is("{")
        {
            let name = self.text(tag);
            return self
                .scopes
                .find_tag(name)
                .ok_or_else(|| self.err_at(tag, "unknown struct/union type"));
        }

        self.skip("{")?;
        let ty = if is_union { union_type() } else { struct_type() };
        self.struct_members(&ty)?;

        if let Some(tag) = tag {
            let name = self.text(tag).to_string();
            if let Some(existing) = self.scopes.find_tag_in_current(&name) {
                existing.overwrite_with(&ty);
                self.scopes.push_tag(name, existing.clone());
                return Ok(existing);
            }
            self.scopes.push_tag(name, ty.clone());
        }
        Ok(ty)
    }

    /// `struct-members = (declspec declarator ("," declarator)* ";")*`
    ///
    /// Computes byte offsets (and the struct's own size/alignment) as
    /// members are collected; a trailing incomplete-array member marks
    /// the struct itself flexible.
    fn struct_members(&mut self, ty: &Type) -> Result<(), CompileError> {
        let mut members = Vec::new();
        let mut offset = 0i64;
        let mut max_align = 1i64;

        while !self.is("}") {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;
            let mut first = true;

            while !self.consume(";") {
                if !first {
                    self.skip(",")?;
                }
                first = false;

                let (mem_ty, name_tok) = self.declarator(basety.clone())?;

                if mem_ty.kind() == types::TypeKind::Array && mem_ty.array_len() < 0 {
                    if members.is_empty() {
                        return Err(self.err_here("flexible array member must not be the only member"));
                    }
                    let align = attr.align.unwrap_or_else(|| mem_ty.align());
                    members.push(Member {
                        name: name_tok,
                        ty: array_of(mem_ty.base().unwrap(), 0),
                        offset: 0,
                        align,
                        is_flexible: true,
                        bitfield: None,
                    });
                    continue;
                }

                let mut bitfield = None;
                if self.consume(":") {
                    let width = self.const_expr()? as u32;
                    bitfield = Some((width, mem_ty.clone()));
                }

                let align = attr.align.unwrap_or_else(|| mem_ty.align());
                members.push(Member {
                    name: name_tok,
                    ty: mem_ty,
                    offset: 0,
                    align,
                    is_flexible: false,
                    bitfield: bitfield.map(|(width, _)| crate::types::BitField { offset: 0, width }),
                });
            }
        }
        self.skip("}")?;

        let is_union = ty.kind() == types::TypeKind::Union;
        let mut is_flexible = false;
        let mut bit_cursor = 0u32; // bit position within the current storage unit
        let mut last_storage_offset = -1i64;

        for mem in members.iter_mut() {
            if mem.is_flexible {
                is_flexible = true;
                continue;
            }
            if is_union {
                mem.offset = 0;
                max_align = max_align.max(mem.align);
                continue;
            }
            if let Some(bf) = mem.bitfield.as_mut() {
                let unit = mem.ty.size();
                if last_storage_offset < 0 || bit_cursor + bf.width > (unit as u32 * 8) {
                    offset = crate::types::align_to(offset, mem.align);
                    last_storage_offset = offset;
                    bit_cursor = 0;
                    offset += unit;
                }
                mem.offset = last_storage_offset;
                bf.offset = bit_cursor;
                bit_cursor += bf.width;
                max_align = max_align.max(mem.align);
                continue;
            }
            bit_cursor = 0;
            last_storage_offset = -1;
            offset = crate::types::align_to(offset, mem.align);
            mem.offset = offset;
            offset += mem.ty.size();
            max_align = max_align.max(mem.align);
        }

        let size = if is_union {
            members.iter().map(|m| if m.is_flexible { 0 } else { m.ty.size() }).max().unwrap_or(0)
        } else {
            crate::types::align_to(offset, max_align)
        };

        ty.set_members(members, size, max_align, is_flexible);
        Ok(())
    }

    /// `enum-specifier = ident? "{" enum-list? "}" | ident`
    fn enum_specifier(&mut self) -> Result<Type, CompileError> {
        self.advance(); // "enum"
        let tag = if matches!(self.cur().kind, TokenKind::Ident) && !self.is("{") {
            Some(self.advance())
        } else {
            None
        };

        if let Some(tag) = tag
            && !self.is("{")
        {
            let name = self.text(tag);
            return self.scopes.find_tag(name).ok_or_else(|| self.err_at(tag, "unknown enum type"));
        }

        self.skip("{")?;
        let ty = enum_type();
        let mut val = 0i64;
        let mut first = true;
        while !self.consume_end() {
            if !first {
                self.skip(",")?;
                if self.consume_end() {
                    break;
                }
            }
            first = false;
            if !matches!(self.cur().kind, TokenKind::Ident) {
                return Err(self.err_here("expected an identifier"));
            }
            let name_tok = self.advance();
            if self.consume("=") {
                val = self.const_expr()?;
            }
            let name = self.text(name_tok).to_string();
            self.scopes.push_var(name, VarBinding::EnumConst { ty: ty.clone(), value: val });
            val += 1;
        }

        if let Some(tag) = tag {
            self.scopes.push_tag(self.text(tag).to_string(), ty.clone());
        }
        Ok(ty)
    }

    // ---- local declarations / statements -----------------------------

    /// `declaration = declspec (declarator ("=" initializer)? ("," declarator ("=" initializer)?)*)? ";"`
    fn declaration(&mut self, basety: Type, attr: &VarAttr) -> Result<Node, CompileError> {
        let tok = self.pos;
        let mut decls = Vec::new();
        let mut first = true;

        while !self.is(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            let (ty, name_tok) = self.declarator(basety.clone())?;
            if ty.kind() == types::TypeKind::Void {
                return Err(self.err_here("variable declared void"));
            }
            let name_tok = name_tok.ok_or_else(|| self.err_here("variable name omitted"))?;

            if attr.is_static {
                // function-local static: lives as an anonymous global.
                let id = self.new_anon_gvar(ty.clone());
                self.objs[id].is_static = true;
                self.scopes.push_var(self.text(name_tok).to_string(), VarBinding::Var(id));
                if self.consume("=") {
                    self.gvar_initializer(id)?;
                }
                continue;
            }

            let name = self.text(name_tok).to_string();
            let id = self.new_lvar(name, ty);
            if self.consume("=") {
                decls.push(self.lvar_initializer(id)?);
            }
        }
        self.skip(";")?;

        let mut node = Node::new(NodeKind::NullExpr, tok);
        for d in decls {
            node = Node::new(NodeKind::Comma(Box::new(node), Box::new(d)), tok);
        }
        Ok(node)
    }

    /// `compound-stmt = (typedef | declaration | stmt)* "}"`
    fn compound_stmt(&mut self) -> Result<Node, CompileError> {
        let tok = self.pos;
        self.scopes.enter();
        let mut body = Vec::new();

        while !self.is("}") {
            let mut node = if self.is_typename_tok() && !self.is("case") {
                let mut attr = VarAttr::default();
                let basety = self.declspec(Some(&mut attr))?;
                if attr.is_typedef {
                    self.parse_typedef(basety)?;
                    continue;
                }
                self.declaration(basety, &attr)?
            } else {
                self.stmt()?
            };
            add_type(&mut node);
            body.push(node);
        }
        self.skip("}")?;
        self.scopes.leave();
        Ok(Node::new(NodeKind::Block(body), tok))
    }

    /// `stmt = "return" expr? ";"
    ///       | "if" "(" expr ")" stmt ("else" stmt)?
    ///       | "switch" "(" expr ")" stmt
    ///       | "case" const-expr ":" stmt
    ///       | "default" ":" stmt
    ///       | "for" "(" ... ")" stmt
    ///       | "while" "(" expr ")" stmt
    ///       | "do" stmt "while" "(" expr ")" ";"
    ///       | "goto" ident ";"
    ///       | ident ":" stmt
    ///       | "break" ";" | "continue" ";"
    ///       | "{" compound-stmt
    ///       | expr-stmt`
    fn stmt(&mut self) -> Result<Node, CompileError> {
        let tok = self.pos;

        if self.consume("return") {
            if self.consume(";") {
                return Ok(Node::new(NodeKind::Return(None), tok));
            }
            let e = self.expr()?;
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Return(Some(Box::new(e))), tok));
        }

        if self.consume("if") {
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;
            let then = self.stmt()?;
            let els = if self.consume("else") { Some(Box::new(self.stmt()?)) } else { None };
            return Ok(Node::new(NodeKind::If { cond: Box::new(cond), then: Box::new(then), els }, tok));
        }

        if self.consume("switch") {
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;

            let brk_label = self.new_unique_name();
            let saved_brk = self.brk_label.replace(brk_label.clone());
            let saved_cases = self.switch_cases.replace(Vec::new());
            let saved_default = self.switch_has_default;
            self.switch_has_default = false;

            let body = self.stmt()?;

            let cases = self.switch_cases.take().unwrap();
            self.brk_label = saved_brk;
            self.switch_cases = saved_cases;
            self.switch_has_default = saved_default;

            return Ok(Node::new(
                NodeKind::Switch { cond: Box::new(cond), body: Box::new(body), cases, brk_label },
                tok,
            ));
        }

        if self.consume("case") {
            if self.switch_cases.is_none() {
                return Err(self.err_at(tok, "stray case"));
            }
            let val = self.const_expr()?;
            self.skip(":")?;
            let label = self.new_unique_name();
            let body = self.stmt()?;
            self.switch_cases.as_mut().unwrap().push((Some(val), label.clone()));
            return Ok(Node::new(NodeKind::Case { label, body: Box::new(body) }, tok));
        }

        if self.consume("default") {
            if self.switch_cases.is_none() {
                return Err(self.err_at(tok, "stray default"));
            }
            if self.switch_has_default {
                return Err(self.err_at(tok, "duplicate default label"));
            }
            self.switch_has_default = true;
            self.skip(":")?;
            let label = self.new_unique_name();
            let body = self.stmt()?;
            self.switch_cases.as_mut().unwrap().push((None, label.clone()));
            return Ok(Node::new(NodeKind::Case { label, body: Box::new(body) }, tok));
        }

        if self.consume("for") {
            self.scopes.enter();
            self.skip("(")?;

            let init = if self.is_typename_tok() {
                let mut attr = VarAttr::default();
                let basety = self.declspec(Some(&mut attr))?;
                Some(Box::new(self.declaration(basety, &attr)?))
            } else if !self.is(";") {
                let e = self.expr_stmt()?;
                Some(Box::new(e))
            } else {
                self.skip(";")?;
                None
            };

            let cond = if !self.is(";") { Some(Box::new(self.expr()?)) } else { None };
            self.skip(";")?;
            let inc = if !self.is(")") { Some(Box::new(self.expr()?)) } else { None };
            self.skip(")")?;

            let brk_label = self.new_unique_name();
            let cont_label = self.new_unique_name();
            let saved_brk = self.brk_label.replace(brk_label.clone());
            let saved_cont = self.cont_label.replace(cont_label.clone());

            let body = self.stmt()?;

            self.brk_label = saved_brk;
            self.cont_label = saved_cont;
            self.scopes.leave();

            return Ok(Node::new(
                NodeKind::For { init, cond, inc, body: Box::new(body), brk_label, cont_label },
                tok,
            ));
        }

        if self.consume("while") {
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;

            let brk_label = self.new_unique_name();
            let cont_label = self.new_unique_name();
            let saved_brk = self.brk_label.replace(brk_label.clone());
            let saved_cont = self.cont_label.replace(cont_label.clone());

            let body = self.stmt()?;

            self.brk_label = saved_brk;
            self.cont_label = saved_cont;

            return Ok(Node::new(
                NodeKind::For { init: None, cond: Some(Box::new(cond)), inc: None, body: Box::new(body), brk_label, cont_label },
                tok,
            ));
        }

        if self.consume("do") {
            let brk_label = self.new_unique_name();
            let cont_label = self.new_unique_name();
            let saved_brk = self.brk_label.replace(brk_label.clone());
            let saved_cont = self.cont_label.replace(cont_label.clone());

            let body = self.stmt()?;

            self.brk_label = saved_brk;
            self.cont_label = saved_cont;

            self.skip("while")?;
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;
            self.skip(";")?;

            return Ok(Node::new(NodeKind::Do { body: Box::new(body), cond: Box::new(cond), brk_label, cont_label }, tok));
        }

        if self.consume("goto") {
            if !matches!(self.cur().kind, TokenKind::Ident) {
                return Err(self.err_here("expected a label"));
            }
            let name_tok = self.advance();
            self.skip(";")?;
            let label = self.goto_label(self.text(name_tok));
            return Ok(Node::new(NodeKind::Goto { label }, tok));
        }

        if self.consume("break") {
            let label = self.brk_label.clone().ok_or_else(|| self.err_at(tok, "stray break"))?;
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Goto { label }, tok));
        }

        if self.consume("continue") {
            let label = self.cont_label.clone().ok_or_else(|| self.err_at(tok, "stray continue"))?;
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Goto { label }, tok));
        }

        if matches!(self.cur().kind, TokenKind::Ident) && self.tok(self.pos + 1).is(":") {
            let name_tok = self.advance();
            self.advance(); // ":"
            let label = self.goto_label(self.text(name_tok));
            let body = self.stmt()?;
            return Ok(Node::new(NodeKind::Label { label, body: Box::new(body) }, tok));
        }

        if self.consume("{") {
            return self.compound_stmt();
        }

        self.expr_stmt()
    }

    fn goto_label(&self, user_name: &str) -> String {
        format!(".L.label.{}.{}", self.current_fn_name, user_name)
    }

    /// `expr-stmt = expr? ";"`
    fn expr_stmt(&mut self) -> Result<Node, CompileError> {
        let tok = self.pos;
        if self.consume(";") {
            return Ok(Node::new(NodeKind::NullExpr, tok));
        }
        let e = self.expr()?;
        self.skip(";")?;
        Ok(Node::new(NodeKind::ExprStmt(Box::new(e)), tok))
    }

    /// Every `goto`/`break`/`continue` was resolved to a formatted label
    /// at parse time rather than through a second linked-list pass; this
    /// walk only has to confirm every referenced label was declared
    /// somewhere in the function.
    fn check_labels(&self, body: &Node) -> Result<(), CompileError> {
        let mut declared = HashSet::new();
        collect_labels(body, &mut declared);
        self.check_gotos(body, &declared)
    }

    fn check_gotos(&self, node: &Node, declared: &HashSet<String>) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Goto { label } => {
                if declared.contains(label) || label == self.brk_label.as_deref().unwrap_or("") {
                    return Ok(());
                }
                if label.starts_with(".L.label.") && !declared.contains(label) {
                    return Err(self.err_at(node.tok, "use of undeclared label"));
                }
                Ok(())
            }
            NodeKind::Label { body, .. } | NodeKind::Case { body, .. } | NodeKind::ExprStmt(body) => {
                self.check_gotos(body, declared)
            }
            NodeKind::Block(v) => v.iter().try_for_each(|n| self.check_gotos(n, declared)),
            NodeKind::If { then, els, .. } => {
                self.check_gotos(then, declared)?;
                if let Some(e) = els {
                    self.check_gotos(e, declared)?;
                }
                Ok(())
            }
            NodeKind::For { body, .. } | NodeKind::Do { body, .. } => self.check_gotos(body, declared),
            NodeKind::Switch { body, .. } => self.check_gotos(body, declared),
            _ => Ok(()),
        }
    }

    // ==================================================================
    // Expressions
    // ==================================================================

    /// `expr = assign ("," expr)?`
    fn expr(&mut self) -> Result<Node, CompileError> {
        let node = self.assign()?;
        if self.consume(",") {
            let tok = node.tok;
            let rhs = self.expr()?;
            return Ok(Node::new(NodeKind::Comma(Box::new(node), Box::new(rhs)), tok));
        }
        Ok(node)
    }

    fn const_expr(&mut self) -> Result<i64, CompileError> {
        let mut node = self.conditional()?;
        add_type(&mut node);
        self.eval(&node)
    }

    /// `assign = conditional (assign-op assign)?`
    fn assign(&mut self) -> Result<Node, CompileError> {
        let mut node = self.conditional()?;
        let tok = self.pos;

        macro_rules! compound {
            ($mk:expr) => {{
                self.advance();
                let rhs = self.assign()?;
                node = self.to_assign(binary_from(node, rhs, tok, $mk))?;
            }};
        }

        if self.is("=") {
            self.advance();
            let rhs = self.assign()?;
            node = Node::new(NodeKind::Assign(Box::new(node), Box::new(rhs)), tok);
        } else if self.is("+=") {
            compound!(NodeKind::Add as fn(_, _) -> _);
        } else if self.is("-=") {
            compound!(NodeKind::Sub as fn(_, _) -> _);
        } else if self.is("*=") {
            compound!(NodeKind::Mul as fn(_, _) -> _);
        } else if self.is("/=") {
            compound!(NodeKind::Div as fn(_, _) -> _);
        } else if self.is("%=") {
            compound!(NodeKind::Mod as fn(_, _) -> _);
        } else if self.is("&=") {
            compound!(NodeKind::BitAnd as fn(_, _) -> _);
        } else if self.is("|=") {
            compound!(NodeKind::BitOr as fn(_, _) -> _);
        } else if self.is("^=") {
            compound!(NodeKind::BitXor as fn(_, _) -> _);
        } else if self.is("<<=") {
            compound!(NodeKind::Shl as fn(_, _) -> _);
        } else if self.is(">>=") {
            compound!(NodeKind::Shr as fn(_, _) -> _);
        }
        Ok(node)
    }

    /// Desugars `A op= B` to `tmp = &A; *tmp = *tmp op B`, or, when `A`
    /// is a member access, `tmp = &base; (*tmp).m = (*tmp).m op B` so a
    /// bit-field's read-modify-write happens through one address.
    fn to_assign(&mut self, binary: Node) -> Result<Node, CompileError> {
        let tok = binary.tok;
        let (lhs, op_mk) = match binary.kind {
            NodeKind::Add(l, r) => (*l, BinOp::Add(*r)),
            NodeKind::Sub(l, r) => (*l, BinOp::Sub(*r)),
            NodeKind::Mul(l, r) => (*l, BinOp::Mul(*r)),
            NodeKind::Div(l, r) => (*l, BinOp::Div(*r)),
            NodeKind::Mod(l, r) => (*l, BinOp::Mod(*r)),
            NodeKind::BitAnd(l, r) => (*l, BinOp::BitAnd(*r)),
            NodeKind::BitOr(l, r) => (*l, BinOp::BitOr(*r)),
            NodeKind::BitXor(l, r) => (*l, BinOp::BitXor(*r)),
            NodeKind::Shl(l, r) => (*l, BinOp::Shl(*r)),
            NodeKind::Shr(l, r) => (*l, BinOp::Shr(*r)),
            _ => unreachable!("to_assign called on a non-binary node"),
        };

        let mut lhs = lhs;
        add_type(&mut lhs);

        if let NodeKind::Member { base, member } = &lhs.kind {
            let tmp_ty = pointer_to(lhs_ty_of(&lhs));
            let tmp = self.new_lvar(self.new_unique_name(), tmp_ty);
            let assign_tmp = Node::new(
                NodeKind::Assign(
                    Box::new(self.var_node(tmp, tok)),
                    Box::new(Node::new(NodeKind::Addr(base.clone()), tok)),
                ),
                tok,
            );
            let deref_member = |member: Member| {
                Node::new(
                    NodeKind::Member {
                        base: Box::new(Node::new(NodeKind::Deref(Box::new(self.var_node(tmp, tok))), tok)),
                        member,
                    },
                    tok,
                )
            };
            let new_rhs = make_binary(op_mk, deref_member(member.clone()), tok);
            let assign_member = Node::new(
                NodeKind::Assign(Box::new(deref_member(member.clone())), Box::new(new_rhs)),
                tok,
            );
            return Ok(Node::new(NodeKind::Comma(Box::new(assign_tmp), Box::new(assign_member)), tok));
        }

        let tmp_ty = pointer_to(lhs_ty_of(&lhs));
        let tmp = self.new_lvar(self.new_unique_name(), tmp_ty);
        let assign_tmp = Node::new(
            NodeKind::Assign(
                Box::new(self.var_node(tmp, tok)),
                Box::new(Node::new(NodeKind::Addr(Box::new(lhs)), tok)),
            ),
            tok,
        );
        let deref = || Node::new(NodeKind::Deref(Box::new(self.var_node(tmp, tok))), tok);
        let new_rhs = make_binary(op_mk, deref(), tok);
        let assign_val = Node::new(NodeKind::Assign(Box::new(deref()), Box::new(new_rhs)), tok);
        Ok(Node::new(NodeKind::Comma(Box::new(assign_tmp), Box::new(assign_val)), tok))
    }

    /// `conditional = logor ("?" expr ":" conditional)?`
    fn conditional(&mut self) -> Result<Node, CompileError> {
        let cond = self.logor()?;
        if self.consume("?") {
            let tok = cond.tok;
            let then = self.expr()?;
            self.skip(":")?;
            let els = self.conditional()?;
            return Ok(Node::new(
                NodeKind::Cond { cond: Box::new(cond), then: Box::new(then), els: Box::new(els) },
                tok,
            ));
        }
        Ok(cond)
    }

    fn logor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.logand()?;
        while self.consume("||") {
            let tok = node.tok;
            let rhs = self.logand()?;
            node = Node::new(NodeKind::LogOr(Box::new(node), Box::new(rhs)), tok);
        }
        Ok(node)
    }

    fn logand(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitor()?;
        while self.consume("&&") {
            let tok = node.tok;
            let rhs = self.bitor()?;
            node = Node::new(NodeKind::LogAnd(Box::new(node), Box::new(rhs)), tok);
        }
        Ok(node)
    }

    fn bitor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitxor()?;
        while self.is("|") && !self.is("||") {
            let tok = self.advance();
            let rhs = self.bitxor()?;
            node = Node::new(NodeKind::BitOr(Box::new(node), Box::new(rhs)), tok);
        }
        Ok(node)
    }

    fn bitxor(&mut self) -> Result<Node, CompileError> {
        let mut node = self.bitand()?;
        while self.is("^") {
            let tok = self.advance();
            let rhs = self.bitand()?;
            node = Node::new(NodeKind::BitXor(Box::new(node), Box::new(rhs)), tok);
        }
        Ok(node)
    }

    fn bitand(&mut self) -> Result<Node, CompileError> {
        let mut node = self.equality()?;
        while self.is("&") && !self.is("&&") {
            let tok = self.advance();
            let rhs = self.equality()?;
            node = Node::new(NodeKind::BitAnd(Box::new(node), Box::new(rhs)), tok);
        }
        Ok(node)
    }

    fn equality(&mut self) -> Result<Node, CompileError> {
        let mut node = self.relational()?;
        loop {
            if self.is("==") {
                let tok = self.advance();
                let rhs = self.relational()?;
                node = Node::new(NodeKind::Eq(Box::new(node), Box::new(rhs)), tok);
            } else if self.is("!=") {
                let tok = self.advance();
                let rhs = self.relational()?;
                node = Node::new(NodeKind::Ne(Box::new(node), Box::new(rhs)), tok);
            } else {
                break;
            }
        }
        Ok(node)
    }

    /// `>`/`>=` are implemented by swapping the operands into `<`/`<=`.
    fn relational(&mut self) -> Result<Node, CompileError> {
        let mut node = self.shift()?;
        loop {
            if self.is("<") {
                let tok = self.advance();
                let rhs = self.shift()?;
                node = Node::new(NodeKind::Lt(Box::new(node), Box::new(rhs)), tok);
            } else if self.is("<=") {
                let tok = self.advance();
                let rhs = self.shift()?;
                node = Node::new(NodeKind::Le(Box::new(node), Box::new(rhs)), tok);
            } else if self.is(">") {
                let tok = self.advance();
                let rhs = self.shift()?;
                node = Node::new(NodeKind::Lt(Box::new(rhs), Box::new(node)), tok);
            } else if self.is(">=") {
                let tok = self.advance();
                let rhs = self.shift()?;
                node = Node::new(NodeKind::Le(Box::new(rhs), Box::new(node)), tok);
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn shift(&mut self) -> Result<Node, CompileError> {
        let mut node = self.add()?;
        loop {
            if self.is("<<") {
                let tok = self.advance();
                let rhs = self.add()?;
                node = Node::new(NodeKind::Shl(Box::new(node), Box::new(rhs)), tok);
            } else if self.is(">>") {
                let tok = self.advance();
                let rhs = self.add()?;
                node = Node::new(NodeKind::Shr(Box::new(node), Box::new(rhs)), tok);
            } else {
                break;
            }
        }
        Ok(node)
    }

    /// `add = mul ("+" mul | "-" mul)*`, with pointer-arithmetic scaling
    /// folded in (`new_add`/`new_sub` from the grammar this mirrors).
    fn add(&mut self) -> Result<Node, CompileError> {
        let mut node = self.mul()?;
        loop {
            if self.is("+") {
                let tok = self.advance();
                let rhs = self.mul()?;
                node = self.new_add(node, rhs, tok)?;
            } else if self.is("-") {
                let tok = self.advance();
                let rhs = self.mul()?;
                node = self.new_sub(node, rhs, tok)?;
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn new_add(&mut self, mut lhs: Node, mut rhs: Node, tok: TokenId) -> Result<Node, CompileError> {
        add_type(&mut lhs);
        add_type(&mut rhs);
        let lty = lhs.ty().unwrap();
        let rty = rhs.ty().unwrap();

        if lty.is_numeric() && rty.is_numeric() {
            return Ok(Node::new(NodeKind::Add(Box::new(lhs), Box::new(rhs)), tok));
        }
        if lty.is_ptr_like() && rty.is_ptr_like() {
            return Err(self.err_at(tok, "invalid operands"));
        }
        // canonicalize num + ptr -> ptr + num
        let (ptr, num) = if !lty.is_ptr_like() && rty.is_ptr_like() { (rhs, lhs) } else { (lhs, rhs) };
        let base = ptr.ty().unwrap().base().ok_or_else(|| self.err_at(tok, "invalid operands"))?;
        let scale = Node::new(NodeKind::Num { val: base.size() }, tok);
        let scaled = Node::new(NodeKind::Mul(Box::new(num), Box::new(new_long_node(scale, tok))), tok);
        Ok(Node::new(NodeKind::Add(Box::new(ptr), Box::new(scaled)), tok))
    }

    fn new_sub(&mut self, mut lhs: Node, mut rhs: Node, tok: TokenId) -> Result<Node, CompileError> {
        add_type(&mut lhs);
        add_type(&mut rhs);
        let lty = lhs.ty().unwrap();
        let rty = rhs.ty().unwrap();

        if lty.is_numeric() && rty.is_numeric() {
            return Ok(Node::new(NodeKind::Sub(Box::new(lhs), Box::new(rhs)), tok));
        }
        if lty.is_ptr_like() && rty.is_numeric() {
            let base = lty.base().unwrap();
            let scale = Node::new(NodeKind::Num { val: base.size() }, tok);
            let scaled = Node::new(NodeKind::Mul(Box::new(rhs), Box::new(new_long_node(scale, tok))), tok);
            let mut node = Node::new(NodeKind::Sub(Box::new(lhs), Box::new(scaled)), tok);
            node.set_ty(pointer_to(base));
            return Ok(node);
        }
        if lty.is_ptr_like() && rty.is_ptr_like() {
            let base = lty.base().ok_or_else(|| self.err_at(tok, "invalid operands"))?;
            let diff = Node::new(NodeKind::Sub(Box::new(lhs), Box::new(rhs)), tok);
            let size = Node::new(NodeKind::Num { val: base.size() }, tok);
            let mut node = Node::new(NodeKind::Div(Box::new(diff), Box::new(new_long_node(size, tok))), tok);
            node.set_ty(ty_long());
            return Ok(node);
        }
        Err(self.err_at(tok, "invalid operands"))
    }

    fn mul(&mut self) -> Result<Node, CompileError> {
        let mut node = self.cast()?;
        loop {
            if self.is("*") {
                let tok = self.advance();
                let rhs = self.cast()?;
                node = Node::new(NodeKind::Mul(Box::new(node), Box::new(rhs)), tok);
            } else if self.is("/") {
                let tok = self.advance();
                let rhs = self.cast()?;
                node = Node::new(NodeKind::Div(Box::new(node), Box::new(rhs)), tok);
            } else if self.is("%") {
                let tok = self.advance();
                let rhs = self.cast()?;
                node = Node::new(NodeKind::Mod(Box::new(node), Box::new(rhs)), tok);
            } else {
                break;
            }
        }
        Ok(node)
    }

    /// `cast = "(" typename ")" cast | unary`
    ///
    /// A `(` type-name `)` is disambiguated from a parenthesized
    /// expression by trying a typename parse; a `{` right after the
    /// closing paren means this is a compound literal, handled by
    /// `postfix` instead.
    fn cast(&mut self) -> Result<Node, CompileError> {
        if self.is("(") {
            let save = self.pos;
            self.advance();
            if self.is_typename_tok() {
                let tok = save;
                let ty = self.typename()?;
                self.skip(")")?;
                if self.is("{") {
                    self.pos = save;
                    return self.unary();
                }
                let expr = self.cast()?;
                let mut node = Node::new(NodeKind::Cast(Box::new(expr)), tok);
                node.set_ty(ty);
                return Ok(node);
            }
            self.pos = save;
        }
        self.unary()
    }

    /// `unary = ("+" | "-" | "*" | "&" | "!" | "~") cast | ("++" | "--") unary | postfix`
    fn unary(&mut self) -> Result<Node, CompileError> {
        let tok = self.pos;
        if self.consume("+") {
            return self.cast();
        }
        if self.consume("-") {
            let e = self.cast()?;
            return Ok(Node::new(NodeKind::Neg(Box::new(e)), tok));
        }
        if self.consume("&") {
            let mut e = self.cast()?;
            add_type(&mut e);
            if let NodeKind::Member { member, .. } = &e.kind
                && member.bitfield.is_some()
            {
                return Err(self.err_at(tok, "cannot take address of bit-field"));
            }
            return Ok(Node::new(NodeKind::Addr(Box::new(e)), tok));
        }
        if self.consume("*") {
            let e = self.cast()?;
            return Ok(Node::new(NodeKind::Deref(Box::new(e)), tok));
        }
        if self.consume("!") {
            let e = self.cast()?;
            return Ok(Node::new(NodeKind::Not(Box::new(e)), tok));
        }
        if self.consume("~") {
            let e = self.cast()?;
            return Ok(Node::new(NodeKind::BitNot(Box::new(e)), tok));
        }
        if self.consume("++") {
            let e = self.unary()?;
            return self.to_assign(binary_from(e, Node::new(NodeKind::Num { val: 1 }, tok), tok, NodeKind::Add as fn(_, _) -> _));
        }
        if self.consume("--") {
            let e = self.unary()?;
            return self.to_assign(binary_from(e, Node::new(NodeKind::Num { val: 1 }, tok), tok, NodeKind::Sub as fn(_, _) -> _));
        }
        self.postfix()
    }

    /// `postfix = compound-literal | primary ("[" expr "]" | "." ident | "->" ident | "++" | "--")*`
    fn postfix(&mut self) -> Result<Node, CompileError> {
        if self.is("(") {
            let save = self.pos;
            self.advance();
            if self.is_typename_tok() {
                let tok = save;
                let ty = self.typename()?;
                self.skip(")")?;
                if self.is("{") {
                    return self.compound_literal(ty, tok);
                }
            }
            self.pos = save;
        }

        let mut node = self.primary()?;

        loop {
            if self.consume("[") {
                let tok = node.tok;
                let idx = self.expr()?;
                self.skip("]")?;
                let addr = self.new_add(node, idx, tok)?;
                node = Node::new(NodeKind::Deref(Box::new(addr)), tok);
                continue;
            }
            if self.consume(".") {
                node = self.struct_ref(node)?;
                continue;
            }
            if self.consume("->") {
                let tok = node.tok;
                node = Node::new(NodeKind::Deref(Box::new(node)), tok);
                node = self.struct_ref(node)?;
                continue;
            }
            if self.consume("++") {
                let tok = node.tok;
                node = self.new_postfix_incdec(node, tok, true)?;
                continue;
            }
            if self.consume("--") {
                let tok = node.tok;
                node = self.new_postfix_incdec(node, tok, false)?;
                continue;
            }
            break;
        }
        Ok(node)
    }

    /// Postfix `x++`/`x--`: `(typeof x)((x += 1) - 1)` — increment, then
    /// subtract back so the expression's value is the pre-increment one.
    fn new_postfix_incdec(&mut self, node: Node, tok: TokenId, is_inc: bool) -> Result<Node, CompileError> {
        let mut typed = node.clone_shallow_for_type();
        add_type(&mut typed);
        let ty = typed.ty().unwrap();

        let delta = Node::new(NodeKind::Num { val: 1 }, tok);
        let op: fn(Box<Node>, Box<Node>) -> NodeKind = if is_inc { NodeKind::Add } else { NodeKind::Sub };
        let incremented = self.to_assign(binary_from(node, delta, tok, op))?;

        let back = Node::new(NodeKind::Num { val: 1 }, tok);
        let op2: fn(Box<Node>, Box<Node>) -> NodeKind = if is_inc { NodeKind::Sub } else { NodeKind::Add };
        let adjusted = op2(Box::new(incremented), Box::new(back));
        let mut cast = Node::new(NodeKind::Cast(Box::new(Node::new(adjusted, tok))), tok);
        cast.set_ty(ty);
        Ok(cast)
    }

    fn struct_ref(&mut self, base: Node) -> Result<Node, CompileError> {
        let tok = self.pos;
        if !matches!(self.cur().kind, TokenKind::Ident) {
            return Err(self.err_here("expected a field designator"));
        }
        let name_tok = self.advance();
        let name = self.text(name_tok);

        let mut typed = base.clone_shallow_for_type();
        add_type(&mut typed);
        let ty = typed.ty().ok_or_else(|| self.err_at(tok, "not a struct/union"))?;
        if !ty.is_struct_union() {
            return Err(self.err_at(tok, "not a struct nor a union"));
        }

        let (path, member) = find_member_path(&ty, name).ok_or_else(|| self.err_at(tok, "no such member"))?;

        let mut result = base;
        for m in path {
            result = Node::new(NodeKind::Member { base: Box::new(result), member: m }, tok);
        }
        let _ = member;
        Ok(result)
    }

    /// `funcall = ident "(" (assign ("," assign)*)? ")"`
    fn funcall(&mut self, callee_ty: Type, callee: Node, tok: TokenId) -> Result<Node, CompileError> {
        self.skip("(")?;
        let params = callee_ty.params();
        let mut args = Vec::new();
        let mut i = 0usize;
        let mut first = true;
        while !self.is(")") {
            if !first {
                self.skip(",")?;
            }
            first = false;
            let mut arg = self.assign()?;
            add_type(&mut arg);
            if i < params.len() {
                let pty = &params[i];
                if !pty.is_struct_union() {
                    arg = {
                        let tok = arg.tok;
                        let mut c = Node::new(NodeKind::Cast(Box::new(arg)), tok);
                        c.set_ty(pty.clone());
                        c
                    };
                }
            } else if callee_ty.is_variadic() && arg.ty().map(|t| t.kind() == types::TypeKind::Float).unwrap_or(false) {
                let tok = arg.tok;
                let mut c = Node::new(NodeKind::Cast(Box::new(arg)), tok);
                c.set_ty(ty_double());
                arg = c;
            }
            args.push(arg);
            i += 1;
        }
        self.skip(")")?;
        if !callee_ty.is_variadic() && i != params.len() {
            return Err(self.err_at(tok, "too many/few arguments"));
        }
        Ok(Node::new(NodeKind::Funcall { func_ty: callee_ty, callee: Box::new(callee), args }, tok))
    }

    /// `primary = "(" "{" stmt+ "}" ")" | "(" expr ")" | "sizeof" unary
    ///          | "sizeof" "(" typename ")" | "_Alignof" ("(" typename ")" | unary)
    ///          | ident func-args? | str | num`
    fn primary(&mut self) -> Result<Node, CompileError> {
        let tok = self.pos;

        if self.is("(") && self.tok(self.pos + 1).is("{") {
            self.advance();
            self.advance();
            self.scopes.enter();
            let mut body = Vec::new();
            while !self.is("}") {
                let mut node = if self.is_typename_tok() {
                    let mut attr = VarAttr::default();
                    let basety = self.declspec(Some(&mut attr))?;
                    self.declaration(basety, &attr)?
                } else {
                    self.stmt()?
                };
                add_type(&mut node);
                body.push(node);
            }
            self.scopes.leave();
            self.skip("}")?;
            self.skip(")")?;
            if !matches!(body.last().map(|n| &n.kind), Some(NodeKind::ExprStmt(_))) {
                return Err(self.err_at(tok, "statement expression returning void is not supported"));
            }
            return Ok(Node::new(NodeKind::StmtExpr { body }, tok));
        }

        if self.consume("(") {
            let e = self.expr()?;
            self.skip(")")?;
            return Ok(e);
        }

        if self.consume("sizeof") {
            if self.is("(") {
                let save = self.pos;
                self.advance();
                if self.is_typename_tok() {
                    let ty = self.typename()?;
                    self.skip(")")?;
                    return Ok(Node::new(NodeKind::Num { val: ty.size() }, tok));
                }
                self.pos = save;
            }
            let mut e = self.unary()?;
            add_type(&mut e);
            let size = e.ty().unwrap().size();
            return Ok(Node::new(NodeKind::Num { val: size }, tok));
        }

        if self.consume("_Alignof") {
            if self.is("(") {
                let save = self.pos;
                self.advance();
                if self.is_typename_tok() {
                    let ty = self.typename()?;
                    self.skip(")")?;
                    return Ok(Node::new(NodeKind::Num { val: ty.align() }, tok));
                }
                self.pos = save;
            }
            let mut e = self.unary()?;
            add_type(&mut e);
            let align = e.ty().unwrap().align();
            return Ok(Node::new(NodeKind::Num { val: align }, tok));
        }

        if matches!(self.cur().kind, TokenKind::Ident) {
            let name_tok = self.advance();
            let name = self.text(name_tok);

            if self.is("(") {
                let (id, ty) = match self.scopes.find_var(name) {
                    Some(VarBinding::Var(id)) => (*id, self.objs[*id].ty.clone()),
                    _ => {
                        // implicit declaration: `int f()`.
                        let ty = func_type(ty_int(), Vec::new(), true);
                        let id = self.new_gvar(name.to_string(), ty.clone());
                        (id, ty)
                    }
                };
                let callee = self.var_node(id, tok);
                return self.funcall(ty, callee, tok);
            }

            return match self.scopes.find_var(name).cloned() {
                Some(VarBinding::Var(id)) => Ok(self.var_node(id, tok)),
                Some(VarBinding::EnumConst { value, .. }) => Ok(Node::new(NodeKind::Num { val: value }, tok)),
                Some(VarBinding::Typedef(_)) | None => Err(self.err_at(name_tok, "undefined variable")),
            };
        }

        if matches!(self.cur().kind, TokenKind::Str) {
            let t = self.cur();
            let bytes = t.str_val.clone().unwrap();
            self.advance();
            let id = self.new_string_literal(bytes);
            return Ok(self.var_node(id, tok));
        }

        if matches!(self.cur().kind, TokenKind::Num) {
            let t = self.cur();
            let node = match t.num_kind {
                Some(NumKind::Float) => {
                    let mut n = Node::new(NodeKind::FNum { val: t.fval }, tok);
                    n.set_ty(ty_float());
                    n
                }
                Some(NumKind::Double) => {
                    let mut n = Node::new(NodeKind::FNum { val: t.fval }, tok);
                    n.set_ty(ty_double());
                    n
                }
                _ => Node::new(NodeKind::Num { val: t.ival }, tok),
            };
            self.advance();
            return Ok(node);
        }

        Err(self.err_here("expected an expression"))
    }

    /// `(T){ initializer-list }`
    fn compound_literal(&mut self, ty: Type, tok: TokenId) -> Result<Node, CompileError> {
        if self.scopes.is_global() {
            let id = self.new_anon_gvar(ty);
            self.gvar_initializer(id)?;
            return Ok(self.var_node(id, tok));
        }
        let id = self.new_lvar(self.new_unique_name(), ty);
        let init = self.lvar_initializer(id)?;
        Ok(Node::new(NodeKind::Comma(Box::new(init), Box::new(self.var_node(id, tok))), tok))
    }

    // ==================================================================
    // Initializers
    // ==================================================================

    fn new_initializer(&self, ty: &Type, tok: TokenId, allow_flexible: bool) -> Initializer {
        if ty.kind() == types::TypeKind::Array {
            if allow_flexible && ty.array_len() < 0 {
                return Initializer { ty: ty.clone(), tok, is_flexible: true, expr: None, children: Vec::new(), member: None };
            }
            let base = ty.base().unwrap();
            let children = (0..ty.array_len()).map(|_| self.new_initializer(&base, tok, false)).collect();
            return Initializer { ty: ty.clone(), tok, is_flexible: false, expr: None, children, member: None };
        }
        if ty.is_struct_union() {
            let members = ty.members();
            let is_union = ty.kind() == types::TypeKind::Union;
            let last = members.len().saturating_sub(1);
            let children = members
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    if allow_flexible && ty.is_flexible() && i == last && !is_union {
                        Initializer { ty: m.ty.clone(), tok, is_flexible: true, expr: None, children: Vec::new(), member: None }
                    } else {
                        self.new_initializer(&m.ty, tok, false)
                    }
                })
                .collect();
            return Initializer { ty: ty.clone(), tok, is_flexible: false, expr: None, children, member: None };
        }
        Initializer::scalar(ty.clone(), tok)
    }

    fn skip_excess_element(&mut self) -> Result<(), CompileError> {
        if self.consume("{") {
            self.skip_excess_element()?;
            self.skip("}")?;
            return Ok(());
        }
        self.assign()?;
        Ok(())
    }

    fn array_designator(&mut self, ty: &Type) -> Result<i64, CompileError> {
        let open = self.advance();
        let i = self.const_expr()?;
        if i >= ty.array_len() && ty.array_len() >= 0 {
            return Err(self.err_at(open, "array designator index exceeds array bounds"));
        }
        self.skip("]")?;
        Ok(i)
    }

    fn struct_designator(&mut self, ty: &Type) -> Result<Member, CompileError> {
        self.skip(".")?;
        if !matches!(self.cur().kind, TokenKind::Ident) {
            return Err(self.err_here("expected a field designator"));
        }
        let name_tok = self.advance();
        let name = self.text(name_tok);
        ty.find_member(name).ok_or_else(|| self.err_at(name_tok, "struct has no such member"))
    }

    fn designation(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        if self.is("[") {
            if init.ty.kind() != types::TypeKind::Array {
                return Err(self.err_here("array index in non-array initializer"));
            }
            let i = self.array_designator(&init.ty)?;
            self.designation(&mut init.children[i as usize])?;
            self.array_initializer2(init, i + 1)?;
            return Ok(());
        }
        if self.is(".") && init.ty.is_struct_union() {
            let member = self.struct_designator(&init.ty)?;
            let idx = init.ty.members().iter().position(|m| m.name == member.name).unwrap();
            if init.ty.kind() == types::TypeKind::Union {
                init.member = Some(member);
                self.designation(&mut init.children[idx])?;
                return Ok(());
            }
            self.designation(&mut init.children[idx])?;
            init.expr = None;
            self.struct_initializer2(init, idx + 1)?;
            return Ok(());
        }
        if self.is(".") {
            return Err(self.err_here("field name not in struct or union initializer"));
        }
        self.consume("=");
        self.initializer2(init)
    }

    fn count_array_init_elements(&mut self, ty: &Type) -> Result<i64, CompileError> {
        let mut dummy = self.new_initializer(&ty.base().unwrap(), self.pos, true);
        let save = self.pos;
        let mut i = 0i64;
        let mut max = 0i64;
        let mut first = true;
        while !self.consume_end() {
            if !first {
                self.skip(",")?;
            }
            first = false;
            if self.consume_end() {
                break;
            }
            if self.consume("[") {
                i = self.const_expr()?;
                self.skip("]")?;
                self.designation(&mut dummy)?;
            } else {
                self.initializer2(&mut dummy)?;
            }
            i += 1;
            max = max.max(i);
        }
        self.pos = save;
        Ok(max)
    }

    fn array_initializer1(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        self.skip("{")?;

        if init.is_flexible {
            let len = self.count_array_init_elements(&init.ty)?;
            *init = self.new_initializer(&array_of(init.ty.base().unwrap(), len), init.tok, false);
        }

        let mut i = 0i64;
        let mut first = true;
        while !self.consume_end() {
            if !first {
                self.skip(",")?;
            }
            first = false;

            if self.is("[") {
                i = self.array_designator(&init.ty)?;
                self.designation(&mut init.children[i as usize])?;
                i += 1;
                continue;
            }

            if i < init.ty.array_len() {
                self.initializer2(&mut init.children[i as usize])?;
            } else {
                self.skip_excess_element()?;
            }
            i += 1;
        }
        Ok(())
    }

    fn array_initializer2(&mut self, init: &mut Initializer, mut i: i64) -> Result<(), CompileError> {
        if init.is_flexible {
            let len = self.count_array_init_elements(&init.ty)?;
            *init = self.new_initializer(&array_of(init.ty.base().unwrap(), len), init.tok, false);
        }

        while i < init.ty.array_len() && !self.is_end() {
            if i > 0 {
                self.skip(",")?;
            }
            if self.is("[") || self.is(".") {
                return Ok(());
            }
            self.initializer2(&mut init.children[i as usize])?;
            i += 1;
        }
        Ok(())
    }

    fn struct_initializer1(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        self.skip("{")?;
        let members = init.ty.members();
        let mut idx = 0usize;
        let mut first = true;

        while !self.consume_end() {
            if !first {
                self.skip(",")?;
            }
            first = false;

            if self.is(".") {
                let member = self.struct_designator(&init.ty)?;
                idx = members.iter().position(|m| m.name == member.name).unwrap();
                self.designation(&mut init.children[idx])?;
                idx += 1;
                continue;
            }

            if idx < members.len() {
                self.initializer2(&mut init.children[idx])?;
                idx += 1;
            } else {
                self.skip_excess_element()?;
            }
        }
        Ok(())
    }

    fn struct_initializer2(&mut self, init: &mut Initializer, mut idx: usize) -> Result<(), CompileError> {
        let member_count = init.ty.members().len();
        let mut first = true;
        while idx < member_count && !self.is_end() {
            if !first {
                self.skip(",")?;
            }
            first = false;
            if self.is("[") || self.is(".") {
                return Ok(());
            }
            self.initializer2(&mut init.children[idx])?;
            idx += 1;
        }
        Ok(())
    }

    /// Unlike structs, unions take exactly one initializer (the first
    /// member by default, or whichever member a designator selects).
    fn union_initializer(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        let parens = self.is("{");
        if parens && self.tok(self.pos + 1).is(".") {
            self.advance();
            let member = self.struct_designator(&init.ty)?;
            let idx = init.ty.members().iter().position(|m| m.name == member.name).unwrap();
            init.member = Some(member);
            self.designation(&mut init.children[idx])?;
            self.skip("}")?;
            return Ok(());
        }

        init.member = init.ty.members().first().cloned();
        if parens {
            self.advance();
        }
        self.initializer2(&mut init.children[0])?;
        if parens {
            self.consume(",");
            self.skip("}")?;
        }
        Ok(())
    }

    fn string_initializer(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        let t = self.cur();
        let tok = self.pos;
        let bytes = t.str_val.clone().unwrap();

        if init.is_flexible {
            *init = self.new_initializer(&array_of(init.ty.base().unwrap(), bytes.len() as i64), tok, false);
        }

        let len = init.ty.array_len().min(bytes.len() as i64) as usize;
        for (i, b) in bytes.iter().take(len).enumerate() {
            init.children[i].expr = Some(Node::new(NodeKind::Num { val: *b as i64 }, tok));
        }
        self.advance();
        Ok(())
    }

    /// `initializer = string-initializer | array-initializer
    ///              | struct-initializer | union-initializer | assign`
    fn initializer2(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        if init.ty.kind() == types::TypeKind::Array && matches!(self.cur().kind, TokenKind::Str) {
            return self.string_initializer(init);
        }
        if init.ty.kind() == types::TypeKind::Array {
            if self.is("{") {
                return self.array_initializer1(init);
            }
            return self.array_initializer2(init, 0);
        }
        if init.ty.kind() == types::TypeKind::Struct {
            if self.is("{") {
                return self.struct_initializer1(init);
            }
            // A struct can be initialized from another struct-valued expression.
            let save = self.pos;
            let mut expr = self.assign()?;
            add_type(&mut expr);
            if expr.ty().map(|t| t.kind() == types::TypeKind::Struct).unwrap_or(false) {
                init.expr = Some(expr);
                return Ok(());
            }
            self.pos = save;
            return self.struct_initializer2(init, 0);
        }
        if init.ty.kind() == types::TypeKind::Union {
            return self.union_initializer(init);
        }
        if self.consume("{") {
            self.initializer2(init)?;
            self.skip("}")?;
            return Ok(());
        }
        init.expr = Some(self.assign()?);
        Ok(())
    }

    fn initializer(&mut self, ty: Type, tok: TokenId) -> Result<(Initializer, Type), CompileError> {
        let mut init = self.new_initializer(&ty, tok, true);
        self.initializer2(&mut init)?;

        if ty.is_struct_union() && ty.is_flexible() {
            let members = ty.members();
            let last_idx = members.len() - 1;
            let last_ty = init.children[last_idx].ty.clone();
            let mut new_members = members;
            new_members[last_idx].ty = last_ty.clone();
            let new_ty = ty.copy_type();
            new_ty.set_members(new_members, ty.size() + last_ty.size(), ty.align(), true);
            return Ok((init, new_ty));
        }
        let final_ty = init.ty.clone();
        Ok((init, final_ty))
    }

    fn init_desg_expr(&self, desg: &InitDesg, tok: TokenId) -> Node {
        match desg {
            InitDesg::Var(id) => self.var_node(*id, tok),
            InitDesg::Member { parent, member } => {
                Node::new(NodeKind::Member { base: Box::new(self.init_desg_expr(parent, tok)), member: member.clone() }, tok)
            }
            InitDesg::Index { parent, idx, .. } => {
                let lhs = self.init_desg_expr(parent, tok);
                let rhs = Node::new(NodeKind::Num { val: *idx }, tok);
                let mut added = lhs;
                added = Node::new(NodeKind::Add(Box::new(added), Box::new(rhs)), tok);
                Node::new(NodeKind::Deref(Box::new(added)), tok)
            }
        }
    }

    fn create_lvar_init(&self, init: &Initializer, ty: &Type, desg: InitDesg, tok: TokenId) -> Node {
        if ty.kind() == types::TypeKind::Array {
            let mut node = Node::new(NodeKind::NullExpr, tok);
            let base = ty.base().unwrap();
            for i in 0..ty.array_len() {
                let desg2 = InitDesg::Index { parent: Box::new(desg.clone()), idx: i, elem_ty: base.clone() };
                let rhs = self.create_lvar_init(&init.children[i as usize], &base, desg2, tok);
                node = Node::new(NodeKind::Comma(Box::new(node), Box::new(rhs)), tok);
            }
            return node;
        }
        if ty.kind() == types::TypeKind::Struct && init.expr.is_none() {
            let mut node = Node::new(NodeKind::NullExpr, tok);
            for member in ty.members() {
                let idx = ty.members().iter().position(|m| m.name == member.name).unwrap();
                let desg2 = InitDesg::Member { parent: Box::new(desg.clone()), member: member.clone() };
                let rhs = self.create_lvar_init(&init.children[idx], &member.ty, desg2, tok);
                node = Node::new(NodeKind::Comma(Box::new(node), Box::new(rhs)), tok);
            }
            return node;
        }
        if ty.kind() == types::TypeKind::Union {
            let members = ty.members();
            let member = init.member.clone().or_else(|| members.first().cloned()).unwrap();
            let idx = members.iter().position(|m| m.name == member.name).unwrap();
            let desg2 = InitDesg::Member { parent: Box::new(desg), member: member.clone() };
            return self.create_lvar_init(&init.children[idx], &member.ty, desg2, tok);
        }
        let Some(expr) = init.expr.clone() else {
            return Node::new(NodeKind::NullExpr, tok);
        };
        let lhs = self.init_desg_expr(&desg, tok);
        Node::new(NodeKind::Assign(Box::new(lhs), Box::new(expr)), tok)
    }

    /// `int x[2][2] = {{1,2},{3,4}}` desugars to `memzero(x); x[0][0]=1;
    /// x[0][1]=2; x[1][0]=3; x[1][1]=4;` — zero first so a partial
    /// initializer list leaves the rest at zero, per the standard.
    fn lvar_initializer(&mut self, id: ObjId) -> Result<Node, CompileError> {
        let tok = self.pos;
        let ty = self.objs[id].ty.clone();
        let (init, new_ty) = self.initializer(ty, tok)?;
        self.objs[id].ty = new_ty.clone();

        let lhs = Node::new(NodeKind::Memzero { var: id }, tok);
        let rhs = self.create_lvar_init(&init, &new_ty, InitDesg::Var(id), tok);
        Ok(Node::new(NodeKind::Comma(Box::new(lhs), Box::new(rhs)), tok))
    }

    fn write_gvar_data(&self, init: &Initializer, ty: &Type, buf: &mut [u8], offset: usize, relocations: &mut Vec<Relocation>) -> Result<(), CompileError> {
        if ty.kind() == types::TypeKind::Array {
            let base = ty.base().unwrap();
            let sz = base.size() as usize;
            for (i, child) in init.children.iter().enumerate() {
                self.write_gvar_data(child, &base, buf, offset + sz * i, relocations)?;
            }
            return Ok(());
        }
        if ty.kind() == types::TypeKind::Struct {
            for (i, member) in ty.members().iter().enumerate() {
                if let Some(bf) = &member.bitfield {
                    let Some(expr) = init.children[i].expr.as_ref() else { break };
                    let loc = offset + member.offset as usize;
                    let sz = member.ty.size() as usize;
                    let oldval = read_buf(&buf[loc..loc + sz]);
                    let newval = self.eval(expr)?;
                    let mask = (1i64 << bf.width) - 1;
                    let combined = oldval | ((newval & mask) << bf.offset);
                    write_buf(&mut buf[loc..loc + sz], combined);
                } else {
                    self.write_gvar_data(&init.children[i], &member.ty, buf, offset + member.offset as usize, relocations)?;
                }
            }
            return Ok(());
        }
        if ty.kind() == types::TypeKind::Union {
            let Some(member) = init.member.clone() else { return Ok(()) };
            let idx = ty.members().iter().position(|m| m.name == member.name).unwrap();
            return self.write_gvar_data(&init.children[idx], &member.ty, buf, offset, relocations);
        }

        let Some(expr) = init.expr.as_ref() else { return Ok(()) };
        if ty.kind() == types::TypeKind::Float {
            let v = self.eval_double(expr)? as f32;
            buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            return Ok(());
        }
        if ty.kind() == types::TypeKind::Double || ty.kind() == types::TypeKind::LongDouble {
            let v = self.eval_double(expr)?;
            buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
            return Ok(());
        }

        let mut label = None;
        let val = self.eval2(expr, &mut label)?;
        match label {
            None => write_buf(&mut buf[offset..offset + ty.size() as usize], val),
            Some(label) => relocations.push(Relocation { offset: offset as i64, label, addend: val }),
        }
        Ok(())
    }

    fn gvar_initializer(&mut self, id: ObjId) -> Result<(), CompileError> {
        let tok = self.pos;
        let ty = self.objs[id].ty.clone();
        let (init, new_ty) = self.initializer(ty, tok)?;
        self.objs[id].ty = new_ty.clone();

        let mut buf = vec![0u8; new_ty.size() as usize];
        let mut relocations = Vec::new();
        self.write_gvar_data(&init, &new_ty, &mut buf, 0, &mut relocations)?;
        self.objs[id].init_data = Some(buf);
        self.objs[id].relocations = relocations;
        Ok(())
    }

    // ==================================================================
    // Constant expression evaluation
    // ==================================================================

    fn eval(&self, node: &Node) -> Result<i64, CompileError> {
        let mut label = None;
        let val = self.eval2(node, &mut label)?;
        if label.is_some() {
            return Err(self.err_at(node.tok, "not a compile-time constant"));
        }
        Ok(val)
    }

    fn eval2(&self, node: &Node, label: &mut Option<String>) -> Result<i64, CompileError> {
        match &node.kind {
            NodeKind::Add(l, r) => Ok(self.eval2(l, label)?.wrapping_add(self.eval(r)?)),
            NodeKind::Sub(l, r) => Ok(self.eval2(l, label)?.wrapping_sub(self.eval(r)?)),
            NodeKind::Mul(l, r) => Ok(self.eval(l)?.wrapping_mul(self.eval(r)?)),
            NodeKind::Div(l, r) => {
                let rv = self.eval(r)?;
                if rv == 0 {
                    return Err(self.err_at(node.tok, "division by zero in constant expression"));
                }
                Ok(self.eval(l)?.wrapping_div(rv))
            }
            NodeKind::Mod(l, r) => {
                let rv = self.eval(r)?;
                if rv == 0 {
                    return Err(self.err_at(node.tok, "division by zero in constant expression"));
                }
                Ok(self.eval(l)?.wrapping_rem(rv))
            }
            NodeKind::BitAnd(l, r) => Ok(self.eval(l)? & self.eval(r)?),
            NodeKind::BitOr(l, r) => Ok(self.eval(l)? | self.eval(r)?),
            NodeKind::BitXor(l, r) => Ok(self.eval(l)? ^ self.eval(r)?),
            NodeKind::Shl(l, r) => Ok(self.eval(l)?.wrapping_shl(self.eval(r)? as u32)),
            NodeKind::Shr(l, r) => Ok(self.eval(l)?.wrapping_shr(self.eval(r)? as u32)),
            NodeKind::Eq(l, r) => Ok((self.eval(l)? == self.eval(r)?) as i64),
            NodeKind::Ne(l, r) => Ok((self.eval(l)? != self.eval(r)?) as i64),
            NodeKind::Lt(l, r) => Ok((self.eval(l)? < self.eval(r)?) as i64),
            NodeKind::Le(l, r) => Ok((self.eval(l)? <= self.eval(r)?) as i64),
            NodeKind::Neg(n) => Ok(-self.eval(n)?),
            NodeKind::Not(n) => Ok((self.eval(n)? == 0) as i64),
            NodeKind::BitNot(n) => Ok(!self.eval(n)?),
            NodeKind::LogAnd(l, r) => Ok(((self.eval(l)? != 0) && (self.eval(r)? != 0)) as i64),
            NodeKind::LogOr(l, r) => Ok(((self.eval(l)? != 0) || (self.eval(r)? != 0)) as i64),
            NodeKind::Cond { cond, then, els } => {
                if self.eval(cond)? != 0 {
                    self.eval2(then, label)
                } else {
                    self.eval2(els, label)
                }
            }
            NodeKind::Comma(l, r) => {
                self.eval(l)?;
                self.eval2(r, label)
            }
            NodeKind::Cast(inner) => {
                let val = self.eval2(inner, label)?;
                let Some(ty) = node.ty() else { return Ok(val) };
                Ok(match ty.size() {
                    1 if ty.is_unsigned() => (val as u8) as i64,
                    1 => (val as i8) as i64,
                    2 if ty.is_unsigned() => (val as u16) as i64,
                    2 => (val as i16) as i64,
                    4 if ty.is_unsigned() => (val as u32) as i64,
                    4 => (val as i32) as i64,
                    _ => val,
                })
            }
            NodeKind::Addr(lhs) => self.eval_rval(lhs, label),
            NodeKind::Member { base, member } => {
                if label.is_none() {
                    return Err(self.err_at(node.tok, "invalid initializer"));
                }
                Ok(self.eval_rval(base, label)? + member.offset)
            }
            NodeKind::Var { var } => {
                let obj = &self.objs[*var];
                if label.is_none() || !matches!(obj.ty.kind(), types::TypeKind::Array | types::TypeKind::Func) {
                    return Err(self.err_at(node.tok, "invalid initializer"));
                }
                *label = Some(obj.name.clone());
                Ok(0)
            }
            NodeKind::Num { val } => Ok(*val),
            NodeKind::FNum { val } => Ok(*val as i64),
            _ => Err(self.err_at(node.tok, "not a compile-time constant")),
        }
    }

    fn eval_rval(&self, node: &Node, label: &mut Option<String>) -> Result<i64, CompileError> {
        match &node.kind {
            NodeKind::Var { var } => {
                let obj = &self.objs[*var];
                if obj.is_local {
                    return Err(self.err_at(node.tok, "not a compile-time constant"));
                }
                *label = Some(obj.name.clone());
                Ok(0)
            }
            NodeKind::Deref(n) => self.eval2(n, label),
            NodeKind::Member { base, member } => Ok(self.eval_rval(base, label)? + member.offset),
            _ => Err(self.err_at(node.tok, "invalid initializer")),
        }
    }

    fn eval_double(&self, node: &Node) -> Result<f64, CompileError> {
        match &node.kind {
            NodeKind::FNum { val } => Ok(*val),
            NodeKind::Num { val } => Ok(*val as f64),
            NodeKind::Add(l, r) => Ok(self.eval_double(l)? + self.eval_double(r)?),
            NodeKind::Sub(l, r) => Ok(self.eval_double(l)? - self.eval_double(r)?),
            NodeKind::Mul(l, r) => Ok(self.eval_double(l)? * self.eval_double(r)?),
            NodeKind::Div(l, r) => Ok(self.eval_double(l)? / self.eval_double(r)?),
            NodeKind::Neg(n) => Ok(-self.eval_double(n)?),
            NodeKind::Cast(inner) => {
                let v = self.eval_double(inner)?;
                match node.ty().map(|t| t.is_float()) {
                    Some(true) => Ok(v),
                    _ => Ok(v.trunc()),
                }
            }
            NodeKind::Cond { cond, then, els } => {
                if self.eval(cond)? != 0 {
                    self.eval_double(then)
                } else {
                    self.eval_double(els)
                }
            }
            _ => Ok(self.eval(node)? as f64),
        }
    }
}

// ---- free helper functions -------------------------------------------

enum BinOp {
    Add(Node),
    Sub(Node),
    Mul(Node),
    Div(Node),
    Mod(Node),
    BitAnd(Node),
    BitOr(Node),
    BitXor(Node),
    Shl(Node),
    Shr(Node),
}

fn binary_from(lhs: Node, rhs: Node, tok: TokenId, mk: fn(Box<Node>, Box<Node>) -> NodeKind) -> Node {
    Node::new(mk(Box::new(lhs), Box::new(rhs)), tok)
}

fn make_binary(op: BinOp, lhs: Node, tok: TokenId) -> Node {
    match op {
        BinOp::Add(r) => Node::new(NodeKind::Add(Box::new(lhs), Box::new(r)), tok),
        BinOp::Sub(r) => Node::new(NodeKind::Sub(Box::new(lhs), Box::new(r)), tok),
        BinOp::Mul(r) => Node::new(NodeKind::Mul(Box::new(lhs), Box::new(r)), tok),
        BinOp::Div(r) => Node::new(NodeKind::Div(Box::new(lhs), Box::new(r)), tok),
        BinOp::Mod(r) => Node::new(NodeKind::Mod(Box::new(lhs), Box::new(r)), tok),
        BinOp::BitAnd(r) => Node::new(NodeKind::BitAnd(Box::new(lhs), Box::new(r)), tok),
        BinOp::BitOr(r) => Node::new(NodeKind::BitOr(Box::new(lhs), Box::new(r)), tok),
        BinOp::BitXor(r) => Node::new(NodeKind::BitXor(Box::new(lhs), Box::new(r)), tok),
        BinOp::Shl(r) => Node::new(NodeKind::Shl(Box::new(lhs), Box::new(r)), tok),
        BinOp::Shr(r) => Node::new(NodeKind::Shr(Box::new(lhs), Box::new(r)), tok),
    }
}

fn new_long_node(n: Node, tok: TokenId) -> Node {
    let mut n = n;
    n.tok = tok;
    n.set_ty(ty_long());
    n
}

fn lhs_ty_of(node: &Node) -> Type {
    node.ty().unwrap_or_else(ty_int)
}

fn find_member_path(ty: &Type, name: &str) -> Option<(Vec<Member>, Member)> {
    for m in ty.members() {
        if m.name.as_deref() == Some(name) {
            return Some((vec![m.clone()], m));
        }
        if m.name.is_none() && m.ty.is_struct_union() {
            if let Some((mut path, found)) = find_member_path(&m.ty, name) {
                path.insert(0, m);
                return Some((path, found));
            }
        }
    }
    None
}

fn collect_labels(node: &Node, out: &mut HashSet<String>) {
    match &node.kind {
        NodeKind::Label { label, body } => {
            out.insert(label.clone());
            collect_labels(body, out);
        }
        NodeKind::Case { body, .. } => collect_labels(body, out),
        NodeKind::Block(v) => v.iter().for_each(|n| collect_labels(n, out)),
        NodeKind::If { then, els, .. } => {
            collect_labels(then, out);
            if let Some(e) = els {
                collect_labels(e, out);
            }
        }
        NodeKind::For { body, .. } | NodeKind::Do { body, .. } => collect_labels(body, out),
        NodeKind::Switch { body, .. } => collect_labels(body, out),
        NodeKind::ExprStmt(e) => collect_labels(e, out),
        _ => {}
    }
}

/// Post-order type-filling pass mirroring `add_type`: recurses into
/// every child first, then derives this node's type (and, for
/// arithmetic operators, rewrites operands in place through the usual
/// arithmetic conversions).
pub fn add_type(node: &mut Node) {
    if node.ty().is_some() {
        return;
    }

    macro_rules! arith {
        ($l:ident, $r:ident) => {{
            add_type($l);
            add_type($r);
            let common = get_common_type(&$l.ty().unwrap(), &$r.ty().unwrap());
            wrap_cast($l, common.clone());
            wrap_cast($r, common.clone());
            common
        }};
    }

    let ty = match &mut node.kind {
        NodeKind::Num { .. } => ty_int(),
        NodeKind::FNum { .. } => ty_double(),
        NodeKind::Add(l, r) | NodeKind::Sub(l, r) | NodeKind::Mul(l, r) | NodeKind::Div(l, r) | NodeKind::Mod(l, r)
        | NodeKind::BitAnd(l, r) | NodeKind::BitOr(l, r) | NodeKind::BitXor(l, r) => arith!(l, r),
        NodeKind::Eq(l, r) | NodeKind::Ne(l, r) | NodeKind::Lt(l, r) | NodeKind::Le(l, r) => {
            add_type(l);
            add_type(r);
            let common = get_common_type(&l.ty().unwrap(), &r.ty().unwrap());
            wrap_cast(l, common.clone());
            wrap_cast(r, common);
            ty_int()
        }
        NodeKind::Neg(n) => {
            add_type(n);
            let common = get_common_type(&ty_int(), &n.ty().unwrap());
            wrap_cast(n, common.clone());
            common
        }
        NodeKind::Not(n) => {
            add_type(n);
            ty_int()
        }
        NodeKind::LogAnd(l, r) => {
            add_type(l);
            add_type(r);
            ty_int()
        }
        NodeKind::LogOr(l, r) => {
            add_type(l);
            add_type(r);
            ty_int()
        }
        NodeKind::BitNot(n) => {
            add_type(n);
            n.ty().unwrap()
        }
        NodeKind::Shl(l, r) | NodeKind::Shr(l, r) => {
            add_type(l);
            add_type(r);
            l.ty().unwrap()
        }
        NodeKind::Assign(l, r) => {
            add_type(l);
            let lty = l.ty().unwrap();
            if lty.kind() == types::TypeKind::Array {
                l.set_ty(lty.clone()); // keep as-is; caller already rejected at parse boundary where checked
            }
            if lty.kind() != types::TypeKind::Struct && lty.kind() != types::TypeKind::Union {
                wrap_cast(r, lty.clone());
            } else {
                add_type(r);
            }
            lty
        }
        NodeKind::Cond { cond, then, els } => {
            add_type(cond);
            add_type(then);
            add_type(els);
            let tty = then.ty().unwrap();
            let ety = els.ty().unwrap();
            if tty.kind() == types::TypeKind::Void || ety.kind() == types::TypeKind::Void {
                ty_void()
            } else if tty.is_numeric() && ety.is_numeric() {
                let common = get_common_type(&tty, &ety);
                wrap_cast(then, common.clone());
                wrap_cast(els, common.clone());
                common
            } else {
                tty
            }
        }
        NodeKind::Comma(l, r) => {
            add_type(l);
            add_type(r);
            r.ty().unwrap()
        }
        NodeKind::Member { base, member } => {
            add_type(base);
            member.ty.clone()
        }
        NodeKind::Addr(n) => {
            add_type(n);
            let nty = n.ty().unwrap();
            if nty.kind() == types::TypeKind::Array {
                pointer_to(nty.base().unwrap())
            } else {
                pointer_to(nty)
            }
        }
        NodeKind::Deref(n) => {
            add_type(n);
            let nty = n.ty().unwrap();
            nty.base().unwrap_or_else(ty_int)
        }
        NodeKind::NullExpr => ty_void(),
        NodeKind::Cast(n) => {
            add_type(n);
            node.ty().unwrap_or_else(ty_int)
        }
        NodeKind::Memzero { .. } => ty_void(),
        NodeKind::Var { var: _ } => {
            // Typed at construction time by `Parser::var_node` (add_type has
            // no access to the object table); reaching here with no type
            // set would be a parser bug.
            return;
        }
        NodeKind::Funcall { func_ty, args, callee } => {
            add_type(callee);
            for a in args.iter_mut() {
                add_type(a);
            }
            func_ty.return_ty().unwrap_or_else(ty_void)
        }
        NodeKind::StmtExpr { body } => {
            for n in body.iter_mut() {
                add_type(n);
            }
            body.last().and_then(|n| n.ty()).unwrap_or_else(ty_void)
        }
        NodeKind::ExprStmt(n) => {
            add_type(n);
            return;
        }
        NodeKind::Return(n) => {
            if let Some(n) = n {
                add_type(n);
            }
            return;
        }
        NodeKind::Block(v) => {
            for n in v.iter_mut() {
                add_type(n);
            }
            return;
        }
        NodeKind::If { cond, then, els } => {
            add_type(cond);
            add_type(then);
            if let Some(e) = els {
                add_type(e);
            }
            return;
        }
        NodeKind::For { init, cond, inc, body, .. } => {
            if let Some(n) = init {
                add_type(n);
            }
            if let Some(n) = cond {
                add_type(n);
            }
            if let Some(n) = inc {
                add_type(n);
            }
            add_type(body);
            return;
        }
        NodeKind::Do { body, cond, .. } => {
            add_type(body);
            add_type(cond);
            return;
        }
        NodeKind::Switch { cond, body, .. } => {
            add_type(cond);
            add_type(body);
            return;
        }
        NodeKind::Case { body, .. } | NodeKind::Label { body, .. } => {
            add_type(body);
            return;
        }
        NodeKind::Goto { .. } => return,
    };
    node.set_ty(ty);
}

/// Replaces `*slot` with a `Cast` node wrapping the old contents,
/// tagged with `ty`. Always wraps, even when the node's type already
/// matches `ty` — callers that want to skip a no-op cast check first.
fn wrap_cast(slot: &mut Box<Node>, ty: Type) {
    let tok = slot.tok;
    let inner = std::mem::replace(slot, Box::new(Node::new(NodeKind::NullExpr, tok)));
    let cast = Node::new(NodeKind::Cast(inner), tok);
    cast.set_ty(ty);
    *slot = Box::new(cast);
}

impl Node {
    /// A shallow clone used only to run `add_type` without disturbing
    /// the original (the parser sometimes needs a node's type before
    /// deciding how to consume it further, e.g. postfix `++`/`--` and
    /// member access).
    fn clone_shallow_for_type(&self) -> Node {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::preprocessor::Preprocessor;
    use crate::source::SourceFileTable;

    fn parse_ok(src: &str) -> ParsedProgram {
        let mut table = SourceFileTable::new();
        let file = table.add("t.c", src);
        let tokens = crate::tokenizer::tokenize(&file).unwrap();
        let config = CompilerConfig::default();
        let mut pp_table = SourceFileTable::new();
        let mut pp = Preprocessor::new(&config, &mut pp_table, std::path::PathBuf::from("."));
        let tokens = pp.run(tokens).unwrap();
        Parser::new(&tokens).parse().unwrap()
    }

    #[test]
    fn parses_function_with_return() {
        let prog = parse_ok("int main() { return 1 + 2 * 3; }");
        let main_id = prog.program.iter().find(|&&id| prog.objs[id].name == "main").copied().unwrap();
        assert!(prog.objs[main_id].body.is_some());
    }

    #[test]
    fn global_array_initializer_computes_flexible_length() {
        let prog = parse_ok("int arr[] = {1,2,3,4};");
        let id = prog.program[0];
        assert_eq!(prog.objs[id].ty.array_len(), 4);
    }

    #[test]
    fn struct_offsets_respect_alignment() {
        let prog = parse_ok("struct S { char a; int b; }; struct S s;");
        let id = prog.program.iter().find(|&&id| prog.objs[id].name == "s").copied().unwrap();
        let ty = &prog.objs[id].ty;
        let members = ty.members();
        assert_eq!(members[0].offset, 0);
        assert_eq!(members[1].offset, 4);
        assert_eq!(ty.size(), 8);
    }

    #[test]
    fn undeclared_label_is_rejected() {
        let mut table = SourceFileTable::new();
        let file = table.add("t.c", "int main() { goto nowhere; }");
        let tokens = crate::tokenizer::tokenize(&file).unwrap();
        let config = CompilerConfig::default();
        let mut pp_table = SourceFileTable::new();
        let mut pp = Preprocessor::new(&config, &mut pp_table, std::path::PathBuf::from("."));
        let tokens = pp.run(tokens).unwrap();
        assert!(Parser::new(&tokens).parse().is_err());
    }

    #[test]
    fn variable_length_array_dimension_parses_as_vla_type() {
        let prog = parse_ok("int main(int n) { int a[n]; return 0; }");
        let main_id = prog.program.iter().find(|&&id| prog.objs[id].name == "main").copied().unwrap();
        let a_id = *prog.objs[main_id]
            .locals
            .iter()
            .find(|&&id| prog.objs[id].name == "a")
            .unwrap();
        assert_eq!(prog.objs[a_id].ty.kind(), types::TypeKind::Vla);
    }

    #[test]
    fn variable_length_array_parameter_decays_to_pointer() {
        let prog = parse_ok("void f(int n, int a[n]) {}");
        let f_id = prog.program.iter().find(|&&id| prog.objs[id].name == "f").copied().unwrap();
        let param_id = prog.objs[f_id].params[1];
        assert_eq!(prog.objs[param_id].ty.kind(), types::TypeKind::Ptr);
    }
}
