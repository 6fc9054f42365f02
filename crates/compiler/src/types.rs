//! The C type system: construction, compatibility, and the usual
//! arithmetic conversions.

use crate::token::TokenId;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    LongDouble,
    Enum,
    Ptr,
    Func,
    Array,
    Vla,
    Struct,
    Union,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub ty: Type,
    pub offset: i64,
    pub align: i64,
    pub is_flexible: bool,
    pub bitfield: Option<BitField>,
}

#[derive(Debug, Clone, Copy)]
pub struct BitField {
    pub offset: u32,
    pub width: u32,
}

/// A type handle. `Rc<RefCell<_>>` so that forward-declared struct/union
/// tags can be completed in place ([`overwrite_tag`]-style mutation)
/// without pointer surgery, and so that `pointer_to`/`array_of` can
/// cheaply share a base type.
#[derive(Debug, Clone)]
pub struct Type(pub Rc<RefCell<TypeData>>);

#[derive(Debug)]
pub struct TypeData {
    pub kind: TypeKind,
    pub size: i64,
    pub align: i64,
    pub is_unsigned: bool,
    pub base: Option<Type>,
    pub name: Option<TokenId>,
    pub origin: Option<Type>,

    // Array / VLA
    pub array_len: i64, // -1 = incomplete/flexible
    pub vla_len: Option<TokenId>,

    // Struct / union
    pub members: Vec<Member>,
    pub is_flexible: bool,

    // Function
    pub return_ty: Option<Type>,
    pub params: Vec<Type>,
    pub is_variadic: bool,
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Type {}

impl Type {
    fn new(data: TypeData) -> Type {
        Type(Rc::new(RefCell::new(data)))
    }

    fn basic(kind: TypeKind, size: i64, align: i64, is_unsigned: bool) -> Type {
        Type::new(TypeData {
            kind,
            size,
            align,
            is_unsigned,
            base: None,
            name: None,
            origin: None,
            array_len: 0,
            vla_len: None,
            members: Vec::new(),
            is_flexible: false,
            return_ty: None,
            params: Vec::new(),
            is_variadic: false,
        })
    }

    pub fn kind(&self) -> TypeKind {
        self.0.borrow().kind
    }
    pub fn size(&self) -> i64 {
        self.0.borrow().size
    }
    pub fn align(&self) -> i64 {
        self.0.borrow().align
    }
    pub fn is_unsigned(&self) -> bool {
        self.0.borrow().is_unsigned
    }
    pub fn base(&self) -> Option<Type> {
        self.0.borrow().base.clone()
    }
    pub fn return_ty(&self) -> Option<Type> {
        self.0.borrow().return_ty.clone()
    }
    pub fn params(&self) -> Vec<Type> {
        self.0.borrow().params.clone()
    }
    pub fn is_variadic(&self) -> bool {
        self.0.borrow().is_variadic
    }
    pub fn members(&self) -> Vec<Member> {
        self.0.borrow().members.clone()
    }
    pub fn array_len(&self) -> i64 {
        self.0.borrow().array_len
    }
    pub fn is_flexible(&self) -> bool {
        self.0.borrow().is_flexible
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Bool | TypeKind::Char | TypeKind::Short | TypeKind::Int | TypeKind::Long | TypeKind::Enum
        )
    }
    pub fn is_float(&self) -> bool {
        matches!(self.kind(), TypeKind::Float | TypeKind::Double | TypeKind::LongDouble)
    }
    /// Float/double only — excludes long double, the ABI boundary for
    /// variadic argument promotion.
    pub fn is_float_arg(&self) -> bool {
        matches!(self.kind(), TypeKind::Float | TypeKind::Double)
    }
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }
    pub fn is_struct_union(&self) -> bool {
        matches!(self.kind(), TypeKind::Struct | TypeKind::Union)
    }
    pub fn is_ptr_like(&self) -> bool {
        matches!(self.kind(), TypeKind::Ptr | TypeKind::Array)
    }

    pub fn set_name(&self, name: TokenId) {
        self.0.borrow_mut().name = Some(name);
    }

    /// Shallow copy preserving an `origin` back-pointer, used for
    /// typedef traceability and `is_compatible`'s transitive walk.
    pub fn copy_type(&self) -> Type {
        let data = self.0.borrow();
        let mut new_data = TypeData {
            kind: data.kind,
            size: data.size,
            align: data.align,
            is_unsigned: data.is_unsigned,
            base: data.base.clone(),
            name: data.name,
            origin: Some(self.clone()),
            array_len: data.array_len,
            vla_len: data.vla_len,
            members: data.members.clone(),
            is_flexible: data.is_flexible,
            return_ty: data.return_ty.clone(),
            params: data.params.clone(),
            is_variadic: data.is_variadic,
        };
        new_data.origin = Some(self.clone());
        Type::new(new_data)
    }

    /// In-place completion of a forward-declared struct/union/enum tag:
    /// mirrors `overwrite_tag`'s `*ty2 = *ty` by replacing the shared
    /// `RefCell`'s contents so every existing handle observes the body.
    pub fn overwrite_with(&self, completed: &Type) {
        let data = completed.0.borrow();
        *self.0.borrow_mut() = TypeData {
            kind: data.kind,
            size: data.size,
            align: data.align,
            is_unsigned: data.is_unsigned,
            base: data.base.clone(),
            name: data.name,
            origin: data.origin.clone(),
            array_len: data.array_len,
            vla_len: data.vla_len,
            members: data.members.clone(),
            is_flexible: data.is_flexible,
            return_ty: data.return_ty.clone(),
            params: data.params.clone(),
            is_variadic: data.is_variadic,
        };
    }

    pub fn set_members(&self, members: Vec<Member>, size: i64, align: i64, is_flexible: bool) {
        let mut data = self.0.borrow_mut();
        data.members = members;
        data.size = size;
        data.align = align;
        data.is_flexible = is_flexible;
    }

    pub fn find_member(&self, name: &str) -> Option<Member> {
        self.members().into_iter().find(|m| m.name.as_deref() == Some(name))
    }
}

pub fn ty_void() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Void, 1, 1, false)).clone()
}
pub fn ty_bool() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Bool, 1, 1, false)).clone()
}
pub fn ty_char() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Char, 1, 1, false)).clone()
}
pub fn ty_uchar() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Char, 1, 1, true)).clone()
}
pub fn ty_short() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Short, 2, 2, false)).clone()
}
pub fn ty_ushort() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Short, 2, 2, true)).clone()
}
pub fn ty_int() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Int, 4, 4, false)).clone()
}
pub fn ty_uint() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Int, 4, 4, true)).clone()
}
pub fn ty_long() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Long, 8, 8, false)).clone()
}
pub fn ty_ulong() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Long, 8, 8, true)).clone()
}
pub fn ty_float() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Float, 4, 4, false)).clone()
}
pub fn ty_double() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::Double, 8, 8, false)).clone()
}
/// Long double is folded to double precision (see DESIGN.md Open Questions).
pub fn ty_ldouble() -> Type {
    static T: OnceLock<Type> = OnceLock::new();
    T.get_or_init(|| Type::basic(TypeKind::LongDouble, 8, 8, false)).clone()
}

pub fn align_to(n: i64, align: i64) -> i64 {
    (n + align - 1) / align * align
}

pub fn pointer_to(base: Type) -> Type {
    let mut t = Type::basic(TypeKind::Ptr, 8, 8, true);
    t.0.borrow_mut().base = Some(base);
    t
}

pub fn array_of(base: Type, len: i64) -> Type {
    let size = if len < 0 { 0 } else { base.size() * len };
    let align = base.align();
    let mut t = Type::basic(TypeKind::Array, size, align, false);
    {
        let mut data = t.0.borrow_mut();
        data.base = Some(base);
        data.array_len = len;
    }
    t
}

pub fn vla_of(base: Type, len_node: Option<TokenId>) -> Type {
    let mut t = Type::basic(TypeKind::Vla, 8, 8, false);
    {
        let mut data = t.0.borrow_mut();
        data.base = Some(base);
        data.vla_len = len_node;
    }
    t
}

/// Functions have `sizeof == 1` (a GNU extension to plain C99/C11).
pub fn func_type(return_ty: Type, params: Vec<Type>, is_variadic: bool) -> Type {
    let mut t = Type::basic(TypeKind::Func, 1, 1, false);
    {
        let mut data = t.0.borrow_mut();
        data.return_ty = Some(return_ty);
        data.params = params;
        data.is_variadic = is_variadic;
    }
    t
}

pub fn struct_type() -> Type {
    Type::basic(TypeKind::Struct, 0, 1, false)
}

pub fn union_type() -> Type {
    Type::basic(TypeKind::Union, 0, 1, false)
}

pub fn enum_type() -> Type {
    Type::basic(TypeKind::Enum, 4, 4, false)
}

/// Structural compatibility, following `origin` transitively on either
/// side before comparing shape.
pub fn is_compatible(t1: &Type, t2: &Type) -> bool {
    if Rc::ptr_eq(&t1.0, &t2.0) {
        return true;
    }
    if let Some(origin) = t1.0.borrow().origin.clone() {
        return is_compatible(&origin, t2);
    }
    if let Some(origin) = t2.0.borrow().origin.clone() {
        return is_compatible(t1, &origin);
    }
    if t1.kind() != t2.kind() {
        return false;
    }
    match t1.kind() {
        TypeKind::Ptr => is_compatible(&t1.base().unwrap(), &t2.base().unwrap()),
        TypeKind::Func => {
            let r1 = t1.return_ty().unwrap();
            let r2 = t2.return_ty().unwrap();
            if !is_compatible(&r1, &r2) || t1.is_variadic() != t2.is_variadic() {
                return false;
            }
            let p1 = t1.params();
            let p2 = t2.params();
            p1.len() == p2.len() && p1.iter().zip(p2.iter()).all(|(a, b)| is_compatible(a, b))
        }
        TypeKind::Array => {
            let same_base = is_compatible(&t1.base().unwrap(), &t2.base().unwrap());
            same_base && t1.array_len() >= 0 && t2.array_len() >= 0 && t1.array_len() == t2.array_len()
        }
        _ if t1.is_numeric() => t1.is_unsigned() == t2.is_unsigned(),
        _ => true,
    }
}

/// Usual arithmetic conversion target type for a binary operator's
/// two operand types.
pub fn get_common_type(t1: &Type, t2: &Type) -> Type {
    if t1.base().is_some() {
        return pointer_to(t1.base().unwrap());
    }
    if t2.base().is_some() {
        return pointer_to(t2.base().unwrap());
    }
    if t1.kind() == TypeKind::Func {
        return pointer_to(t1.clone());
    }
    if t2.kind() == TypeKind::Func {
        return pointer_to(t2.clone());
    }
    if t1.kind() == TypeKind::LongDouble || t2.kind() == TypeKind::LongDouble {
        return ty_ldouble();
    }
    if t1.kind() == TypeKind::Double || t2.kind() == TypeKind::Double {
        return ty_double();
    }
    if t1.kind() == TypeKind::Float || t2.kind() == TypeKind::Float {
        return ty_float();
    }
    let t1 = if t1.size() < 4 { ty_int() } else { t1.clone() };
    let t2 = if t2.size() < 4 { ty_int() } else { t2.clone() };
    if t1.size() != t2.size() {
        return if t1.size() < t2.size() { t2 } else { t1 };
    }
    if t2.is_unsigned() {
        t2
    } else {
        t1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_sizeof_multiplies_by_length() {
        let arr = array_of(ty_int(), 5);
        assert_eq!(arr.size(), 20);
    }

    #[test]
    fn common_type_prefers_wider_signed_operand() {
        let common = get_common_type(&ty_int(), &ty_long());
        assert_eq!(common.kind(), TypeKind::Long);
    }

    #[test]
    fn common_type_ties_break_to_unsigned() {
        let common = get_common_type(&ty_int(), &ty_uint());
        assert!(common.is_unsigned());
    }

    #[test]
    fn pointer_compatible_requires_compatible_base() {
        let p1 = pointer_to(ty_int());
        let p2 = pointer_to(ty_int());
        assert!(is_compatible(&p1, &p2));
        let p3 = pointer_to(ty_char());
        assert!(!is_compatible(&p1, &p3));
    }

    #[test]
    fn overwrite_completes_forward_declared_struct() {
        let forward = struct_type();
        let handle_before = forward.clone();
        let completed = struct_type();
        completed.set_members(
            vec![Member {
                name: Some("x".into()),
                ty: ty_int(),
                offset: 0,
                align: 4,
                is_flexible: false,
                bitfield: None,
            }],
            4,
            4,
            false,
        );
        forward.overwrite_with(&completed);
        assert_eq!(handle_before.size(), 4);
        assert_eq!(handle_before.members().len(), 1);
    }
}
