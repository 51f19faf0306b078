//! Type system core for Limit
//!
//! Types are interned: equal types share a [`TypeId`], so equality is
//! handle equality and the intern table is monotonic (entries are never
//! removed). Classes, interfaces, and enums are nominal, keyed by
//! `(module, name)` in their registries.
//!
//! The unified optional/error type `T?E` is [`TypeKind::Optional`]: a
//! success type plus an [`ErrorSet`]. The distinguished empty marker
//! `Absent` models plain `T?` ("value might be absent").

use crate::ast::{PatternKind, Visibility};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub u32);

/// The failure side of `T?E`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorSet {
    /// The distinguished marker: "value might be absent" (`T?`)
    Absent,
    /// One or more error types (`T?E`, E possibly a union), sorted and
    /// deduplicated by handle
    Types(Vec<TypeId>),
}

impl ErrorSet {
    pub fn from_types(mut types: Vec<TypeId>) -> ErrorSet {
        types.sort_by_key(|t| t.0);
        types.dedup();
        ErrorSet::Types(types)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    // Primitives
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str,
    Nil,
    Void,
    Any,

    List(TypeId),
    Dict(TypeId, TypeId),
    Range(TypeId),
    Tuple(Vec<TypeId>),
    Function {
        /// (parameter type, has-default)
        params: Vec<(TypeId, bool)>,
        result: TypeId,
        /// None: cannot fail. Some: may fail with this error set.
        error: Option<ErrorSet>,
    },
    /// Ordered, deduplicated variants
    Union(Vec<TypeId>),
    /// Field order is significant for layout only
    Structural(Vec<(String, TypeId)>),
    Class(ClassId),
    Interface(InterfaceId),
    /// "The concrete runtime class" in inheritance contexts
    SelfType(ClassId),
    /// Transparent for compatibility, nominally distinct for display
    Alias {
        name: String,
        target: TypeId,
    },
    /// The unified `T?` / `T?E`
    Optional {
        success: TypeId,
        error: ErrorSet,
    },
    Enum(EnumId),
    /// Generic instantiation: parsed but unchecked, behaves as `any`
    Unresolved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    Init,
}

#[derive(Debug, Clone)]
pub struct ClassMember {
    pub name: String,
    pub kind: MemberKind,
    pub ty: TypeId,
    pub vis: Visibility,
    pub is_abstract: bool,
    pub overrides: bool,
    pub declaring: ClassId,
    /// Fields only: declaration had a default value
    pub has_default: bool,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub module: String,
    pub superclass: Option<ClassId>,
    pub interfaces: Vec<InterfaceId>,
    pub members: Vec<ClassMember>,
    pub is_final: bool,
    pub is_abstract: bool,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub module: String,
    pub methods: Vec<(String, TypeId)>,
    pub required_fields: Vec<(String, TypeId)>,
}

#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: String,
    pub module: String,
    pub variants: Vec<String>,
}

/// The process-wide type registry, threaded through the passes as part
/// of the `Compilation` value (never an ambient singleton).
#[derive(Debug)]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    lookup: HashMap<TypeKind, TypeId>,
    classes: Vec<ClassInfo>,
    class_lookup: HashMap<(String, String), ClassId>,
    interfaces: Vec<InterfaceInfo>,
    interface_lookup: HashMap<(String, String), InterfaceId>,
    enums: Vec<EnumInfo>,
    enum_lookup: HashMap<(String, String), EnumId>,
}

impl TypeTable {
    pub fn new() -> Self {
        TypeTable {
            kinds: Vec::new(),
            lookup: HashMap::new(),
            classes: Vec::new(),
            class_lookup: HashMap::new(),
            interfaces: Vec::new(),
            interface_lookup: HashMap::new(),
            enums: Vec::new(),
            enum_lookup: HashMap::new(),
        }
    }

    /// Intern a type: structurally equal kinds share a handle
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.lookup.get(&kind) {
            return *id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.lookup.insert(kind, id);
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.kinds[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    // Convenience interners for the primitives
    pub fn int(&mut self) -> TypeId {
        self.intern(TypeKind::I64)
    }
    pub fn float(&mut self) -> TypeId {
        self.intern(TypeKind::F64)
    }
    pub fn bool(&mut self) -> TypeId {
        self.intern(TypeKind::Bool)
    }
    pub fn str(&mut self) -> TypeId {
        self.intern(TypeKind::Str)
    }
    pub fn nil(&mut self) -> TypeId {
        self.intern(TypeKind::Nil)
    }
    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }
    pub fn any(&mut self) -> TypeId {
        self.intern(TypeKind::Any)
    }

    /// Follow alias chains to the underlying type
    pub fn resolve_alias(&self, mut id: TypeId) -> TypeId {
        while let TypeKind::Alias { target, .. } = self.kind(id) {
            id = *target;
        }
        id
    }

    /// Union of the given variants: deduplicated, single variant
    /// collapses to itself
    pub fn union_of(&mut self, mut variants: Vec<TypeId>) -> TypeId {
        variants.dedup();
        if variants.len() == 1 {
            return variants[0];
        }
        self.intern(TypeKind::Union(variants))
    }

    // ----- class / interface / enum registries -----

    pub fn declare_class(&mut self, module: &str, name: &str) -> ClassId {
        if let Some(id) = self.class_lookup.get(&(module.to_string(), name.to_string())) {
            return *id;
        }
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassInfo {
            name: name.to_string(),
            module: module.to_string(),
            superclass: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            is_final: false,
            is_abstract: false,
        });
        self.class_lookup
            .insert((module.to_string(), name.to_string()), id);
        id
    }

    pub fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassInfo {
        &mut self.classes[id.0 as usize]
    }

    pub fn lookup_class(&self, module: &str, name: &str) -> Option<ClassId> {
        self.class_lookup
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    /// Find a class by bare name in any module (used for single-file
    /// programs and same-module references)
    pub fn find_class_named(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| ClassId(i as u32))
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn declare_interface(
        &mut self,
        module: &str,
        name: &str,
        methods: Vec<(String, TypeId)>,
        required_fields: Vec<(String, TypeId)>,
    ) -> InterfaceId {
        if let Some(id) = self
            .interface_lookup
            .get(&(module.to_string(), name.to_string()))
        {
            return *id;
        }
        let id = InterfaceId(self.interfaces.len() as u32);
        self.interfaces.push(InterfaceInfo {
            name: name.to_string(),
            module: module.to_string(),
            methods,
            required_fields,
        });
        self.interface_lookup
            .insert((module.to_string(), name.to_string()), id);
        id
    }

    pub fn interface(&self, id: InterfaceId) -> &InterfaceInfo {
        &self.interfaces[id.0 as usize]
    }

    pub fn declare_enum(&mut self, module: &str, name: &str, variants: Vec<String>) -> EnumId {
        if let Some(id) = self.enum_lookup.get(&(module.to_string(), name.to_string())) {
            return *id;
        }
        let id = EnumId(self.enums.len() as u32);
        self.enums.push(EnumInfo {
            name: name.to_string(),
            module: module.to_string(),
            variants,
        });
        self.enum_lookup
            .insert((module.to_string(), name.to_string()), id);
        id
    }

    pub fn enum_info(&self, id: EnumId) -> &EnumInfo {
        &self.enums[id.0 as usize]
    }

    pub fn find_enum_named(&self, name: &str) -> Option<EnumId> {
        self.enums
            .iter()
            .position(|e| e.name == name)
            .map(|i| EnumId(i as u32))
    }

    /// Find the enum that declares the given variant name
    pub fn enum_of_variant(&self, variant: &str) -> Option<EnumId> {
        self.enums
            .iter()
            .position(|e| e.variants.iter().any(|v| v == variant))
            .map(|i| EnumId(i as u32))
    }

    /// Is `sub` a subclass of (or equal to) `ancestor`?
    pub fn is_subclass(&self, sub: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.class(id).superclass;
        }
        false
    }

    /// Find a member by name on a class or any of its ancestors.
    /// Returns the member and the class that provides it.
    pub fn find_member(&self, class: ClassId, name: &str) -> Option<(&ClassMember, ClassId)> {
        let mut current = Some(class);
        while let Some(id) = current {
            let info = self.class(id);
            if let Some(member) = info.members.iter().find(|m| m.name == name) {
                return Some((member, id));
            }
            current = info.superclass;
        }
        None
    }

    /// Does the class (including inherited members) satisfy an interface?
    pub fn implements(&self, class: ClassId, interface: InterfaceId) -> bool {
        let iface = self.interface(interface);
        for (name, expected) in &iface.methods {
            match self.find_member(class, name) {
                Some((member, _)) if member.kind == MemberKind::Method => {
                    if !self.is_assignable(member.ty, *expected) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        for (name, expected) in &iface.required_fields {
            match self.find_member(class, name) {
                Some((member, _)) if member.kind == MemberKind::Field => {
                    if !self.is_assignable(member.ty, *expected) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }

    // ----- assignability -----

    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        let from = self.resolve_alias(from);
        let to = self.resolve_alias(to);
        if from == to {
            return true;
        }

        use TypeKind::*;
        match (self.kind(from), self.kind(to)) {
            // `any` is compatible in both directions
            (_, Any) | (Any, _) => true,
            (Unresolved(_), _) | (_, Unresolved(_)) => true,

            // Implicit numeric widening within a family; int -> float
            // is never implicit
            (I32, I64) => true,
            (U32, U64) => true,
            (F32, F64) => true,

            // `nil` goes only where a type explicitly contains nil
            (Nil, Union(variants)) => variants
                .iter()
                .any(|v| matches!(self.kind(self.resolve_alias(*v)), Nil)),

            // Union on the left: every variant must fit the target
            (Union(variants), _) => variants
                .iter()
                .all(|v| self.is_assignable(*v, to)),

            // Union on the right: the source must fit some variant
            (_, Union(variants)) => variants
                .iter()
                .any(|v| self.is_assignable(from, *v)),

            (Class(sub), Class(ancestor)) => self.is_subclass(*sub, *ancestor),
            (SelfType(sub), Class(ancestor)) => self.is_subclass(*sub, *ancestor),
            (Class(sub), SelfType(ancestor)) => self.is_subclass(*sub, *ancestor),
            (SelfType(sub), SelfType(ancestor)) => self.is_subclass(*sub, *ancestor),

            (Class(class), Interface(interface)) => self.implements(*class, *interface),

            // Width subtyping: the target's fields are a subset of the
            // source's, with assignable types
            (Structural(source_fields), Structural(target_fields)) => {
                target_fields.iter().all(|(name, target_ty)| {
                    source_fields
                        .iter()
                        .find(|(n, _)| n == name)
                        .is_some_and(|(_, source_ty)| self.is_assignable(*source_ty, *target_ty))
                })
            }

            (List(a), List(b)) => self.is_assignable(*a, *b),
            (Range(a), Range(b)) => self.is_assignable(*a, *b),
            (Dict(ka, va), Dict(kb, vb)) => {
                self.is_assignable(*ka, *kb) && self.is_assignable(*va, *vb)
            }
            (Tuple(a), Tuple(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| self.is_assignable(*x, *y))
            }

            (
                Optional {
                    success: s1,
                    error: e1,
                },
                Optional {
                    success: s2,
                    error: e2,
                },
            ) => self.is_assignable(*s1, *s2) && self.error_subset(e1, e2),

            // Contravariant parameters, covariant result and error set
            (
                Function {
                    params: p1,
                    result: r1,
                    error: e1,
                },
                Function {
                    params: p2,
                    result: r2,
                    error: e2,
                },
            ) => {
                p1.len() == p2.len()
                    && p1
                        .iter()
                        .zip(p2.iter())
                        .all(|((a, _), (b, _))| self.is_assignable(*b, *a))
                    && self.is_assignable(*r1, *r2)
                    && match (e1, e2) {
                        (None, _) => true,
                        (Some(_), None) => false,
                        (Some(a), Some(b)) => self.error_subset(a, b),
                    }
            }

            _ => false,
        }
    }

    /// `Absent` fits any error set; a type set fits when every member
    /// fits some member of the target. A non-empty type set never fits
    /// plain `Absent`.
    pub fn error_subset(&self, from: &ErrorSet, to: &ErrorSet) -> bool {
        match (from, to) {
            (ErrorSet::Absent, _) => true,
            (ErrorSet::Types(_), ErrorSet::Absent) => false,
            (ErrorSet::Types(from), ErrorSet::Types(to)) => from
                .iter()
                .all(|f| to.iter().any(|t| self.is_assignable(*f, *t))),
        }
    }

    // ----- match narrowing -----

    /// Type of the value a pattern binds when matched against `scrutinee`
    pub fn narrow(&self, scrutinee: TypeId, pattern: &PatternKind) -> TypeId {
        let scrutinee = self.resolve_alias(scrutinee);
        match (self.kind(scrutinee), pattern) {
            (TypeKind::Optional { success, .. }, PatternKind::Variant { name, .. })
                if name == "Ok" =>
            {
                *success
            }
            (TypeKind::Optional { error, .. }, PatternKind::Variant { name, .. })
                if name == "Err" =>
            {
                match error {
                    ErrorSet::Absent => scrutinee,
                    ErrorSet::Types(types) if types.len() == 1 => types[0],
                    ErrorSet::Types(_) => scrutinee,
                }
            }
            (TypeKind::Union(variants), PatternKind::Variant { name, .. }) => {
                // A variant pattern over a union of classes narrows to
                // the named class
                for v in variants {
                    if let TypeKind::Class(class) = self.kind(self.resolve_alias(*v))
                        && self.class(*class).name == *name
                    {
                        return *v;
                    }
                }
                scrutinee
            }
            _ => scrutinee,
        }
    }

    /// Variants of `scrutinee` not covered by the given unguarded
    /// patterns. Empty means the match is exhaustive. `None` means the
    /// scrutinee type has no closed variant set (so only a wildcard or
    /// binding makes it total).
    pub fn uncovered_variants(
        &self,
        scrutinee: TypeId,
        patterns: &[&PatternKind],
    ) -> Option<Vec<String>> {
        // A wildcard or bare binding covers everything
        if patterns
            .iter()
            .any(|p| matches!(p, PatternKind::Wildcard | PatternKind::Binding(_)))
        {
            return Some(Vec::new());
        }
        let scrutinee = self.resolve_alias(scrutinee);
        let all: Vec<String> = match self.kind(scrutinee) {
            TypeKind::Optional { .. } => vec!["Ok".to_string(), "Err".to_string()],
            TypeKind::Enum(id) => self.enum_info(*id).variants.clone(),
            TypeKind::Bool => vec!["true".to_string(), "false".to_string()],
            TypeKind::Union(variants) => variants
                .iter()
                .map(|v| self.display(*v))
                .collect(),
            _ => return None,
        };
        let covered: Vec<&str> = patterns
            .iter()
            .filter_map(|p| match p {
                PatternKind::Variant { name, .. } => Some(name.as_str()),
                PatternKind::Bool(true) => Some("true"),
                PatternKind::Bool(false) => Some("false"),
                _ => None,
            })
            .collect();
        Some(
            all.into_iter()
                .filter(|v| !covered.contains(&v.as_str()))
                .collect(),
        )
    }

    // ----- display -----

    pub fn display(&self, id: TypeId) -> String {
        use TypeKind::*;
        match self.kind(id) {
            I32 => "i32".to_string(),
            I64 => "int".to_string(),
            U32 => "u32".to_string(),
            U64 => "uint".to_string(),
            F32 => "f32".to_string(),
            F64 => "float".to_string(),
            Bool => "bool".to_string(),
            Str => "str".to_string(),
            Nil => "nil".to_string(),
            Void => "void".to_string(),
            Any => "any".to_string(),
            List(element) => format!("[{}]", self.display(*element)),
            Dict(key, value) => format!("{{{}: {}}}", self.display(*key), self.display(*value)),
            Range(element) => format!("{0}..{0}", self.display(*element)),
            Tuple(parts) => format!(
                "({})",
                parts
                    .iter()
                    .map(|p| self.display(*p))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Function { params, result, error } => {
                let params = params
                    .iter()
                    .map(|(p, _)| self.display(*p))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut out = format!("fn({}): {}", params, self.display(*result));
                match error {
                    None => {}
                    Some(ErrorSet::Absent) => out.push('?'),
                    Some(ErrorSet::Types(types)) => {
                        out.push('?');
                        out.push_str(
                            &types
                                .iter()
                                .map(|t| self.display(*t))
                                .collect::<Vec<_>>()
                                .join(" | "),
                        );
                    }
                }
                out
            }
            Union(variants) => variants
                .iter()
                .map(|v| self.display(*v))
                .collect::<Vec<_>>()
                .join(" | "),
            Structural(fields) => format!(
                "{{{}}}",
                fields
                    .iter()
                    .map(|(n, t)| format!("{}: {}", n, self.display(*t)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Class(id) => self.class(*id).name.clone(),
            Interface(id) => self.interface(*id).name.clone(),
            SelfType(_) => "Self".to_string(),
            Alias { name, .. } => name.clone(),
            Optional { success, error } => {
                let mut out = self.display(*success);
                out.push('?');
                if let ErrorSet::Types(types) = error {
                    out.push_str(
                        &types
                            .iter()
                            .map(|t| self.display(*t))
                            .collect::<Vec<_>>()
                            .join(" | "),
                    );
                }
                out
            }
            Enum(id) => self.enum_info(*id).name.clone(),
            Unresolved(name) => name.clone(),
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TypeTable {
        TypeTable::new()
    }

    #[test]
    fn test_interning_shares_handles() {
        let mut t = table();
        let a = t.intern(TypeKind::I64);
        let b = t.intern(TypeKind::I64);
        assert_eq!(a, b);

        let int = t.int();
        let list1 = t.intern(TypeKind::List(int));
        let list2 = t.intern(TypeKind::List(int));
        assert_eq!(list1, list2);
    }

    #[test]
    fn test_interning_monotonic() {
        let mut t = table();
        let before = t.len();
        t.int();
        t.int();
        t.str();
        assert_eq!(t.len(), before + 2);
    }

    #[test]
    fn test_assignable_reflexive() {
        let mut t = table();
        let int = t.int();
        let str_ = t.str();
        let list = t.intern(TypeKind::List(int));
        for ty in [int, str_, list] {
            assert!(t.is_assignable(ty, ty));
        }
    }

    #[test]
    fn test_numeric_widening() {
        let mut t = table();
        let i32_ = t.intern(TypeKind::I32);
        let i64_ = t.intern(TypeKind::I64);
        let f64_ = t.intern(TypeKind::F64);
        assert!(t.is_assignable(i32_, i64_));
        assert!(!t.is_assignable(i64_, i32_));
        // int -> float is not implicit
        assert!(!t.is_assignable(i64_, f64_));
    }

    #[test]
    fn test_nil_only_into_nil_unions() {
        let mut t = table();
        let nil = t.nil();
        let int = t.int();
        let with_nil = t.union_of(vec![int, nil]);
        let without_nil = t.str();
        assert!(t.is_assignable(nil, with_nil));
        assert!(!t.is_assignable(nil, without_nil));
    }

    #[test]
    fn test_union_subset() {
        let mut t = table();
        let int = t.int();
        let str_ = t.str();
        let bool_ = t.bool();
        let small = t.union_of(vec![int, str_]);
        let big = t.union_of(vec![int, str_, bool_]);
        assert!(t.is_assignable(small, big));
        assert!(!t.is_assignable(big, small));
        // A member fits its union
        assert!(t.is_assignable(int, big));
    }

    #[test]
    fn test_alias_transparent() {
        let mut t = table();
        let int = t.int();
        let alias = t.intern(TypeKind::Alias {
            name: "Id".to_string(),
            target: int,
        });
        let str_ = t.str();
        assert!(t.is_assignable(alias, int));
        assert!(t.is_assignable(int, alias));
        assert_eq!(t.is_assignable(alias, str_), t.is_assignable(int, str_));
    }

    #[test]
    fn test_class_subtyping_transitive() {
        let mut t = table();
        let a = t.declare_class("m", "A");
        let b = t.declare_class("m", "B");
        let c = t.declare_class("m", "C");
        t.class_mut(b).superclass = Some(a);
        t.class_mut(c).superclass = Some(b);

        let ta = t.intern(TypeKind::Class(a));
        let tb = t.intern(TypeKind::Class(b));
        let tc = t.intern(TypeKind::Class(c));
        assert!(t.is_assignable(tb, ta));
        assert!(t.is_assignable(tc, tb));
        assert!(t.is_assignable(tc, ta)); // transitivity
        assert!(!t.is_assignable(ta, tc));
    }

    #[test]
    fn test_self_type_resolves_to_class() {
        let mut t = table();
        let a = t.declare_class("m", "A");
        let b = t.declare_class("m", "B");
        t.class_mut(b).superclass = Some(a);
        let ta = t.intern(TypeKind::Class(a));
        let self_b = t.intern(TypeKind::SelfType(b));
        assert!(t.is_assignable(self_b, ta));
    }

    #[test]
    fn test_structural_width_subtyping() {
        let mut t = table();
        let int = t.int();
        let str_ = t.str();
        let wide = t.intern(TypeKind::Structural(vec![
            ("x".to_string(), int),
            ("y".to_string(), str_),
        ]));
        let narrow = t.intern(TypeKind::Structural(vec![("x".to_string(), int)]));
        assert!(t.is_assignable(wide, narrow));
        assert!(!t.is_assignable(narrow, wide));
    }

    #[test]
    fn test_optional_assignability() {
        let mut t = table();
        let int = t.int();
        let parse_err = {
            let c = t.declare_class("m", "ParseError");
            t.intern(TypeKind::Class(c))
        };
        let io_err = {
            let c = t.declare_class("m", "IoError");
            t.intern(TypeKind::Class(c))
        };

        let plain = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::Absent,
        });
        let with_parse = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::from_types(vec![parse_err]),
        });
        let with_both = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::from_types(vec![parse_err, io_err]),
        });

        // Absent fits any error set
        assert!(t.is_assignable(plain, with_parse));
        // Error set widening is fine, narrowing is not
        assert!(t.is_assignable(with_parse, with_both));
        assert!(!t.is_assignable(with_both, with_parse));
        // Errors cannot be dropped into a plain `T?`... unless Absent
        assert!(!t.is_assignable(with_parse, plain));
    }

    #[test]
    fn test_function_variance() {
        let mut t = table();
        let a = t.declare_class("m", "A");
        let b = t.declare_class("m", "B");
        t.class_mut(b).superclass = Some(a);
        let ta = t.intern(TypeKind::Class(a));
        let tb = t.intern(TypeKind::Class(b));

        // fn(A): B  is assignable to  fn(B): A
        let general = t.intern(TypeKind::Function {
            params: vec![(ta, false)],
            result: tb,
            error: None,
        });
        let specific = t.intern(TypeKind::Function {
            params: vec![(tb, false)],
            result: ta,
            error: None,
        });
        assert!(t.is_assignable(general, specific));
        assert!(!t.is_assignable(specific, general));
    }

    #[test]
    fn test_interface_implementation() {
        let mut t = table();
        let str_ = t.str();
        let name_fn = t.intern(TypeKind::Function {
            params: vec![],
            result: str_,
            error: None,
        });
        let named = t.declare_interface("m", "Named", vec![("name".to_string(), name_fn)], vec![]);

        let a = t.declare_class("m", "A");
        t.class_mut(a).members.push(ClassMember {
            name: "name".to_string(),
            kind: MemberKind::Method,
            ty: name_fn,
            vis: Visibility::Public,
            is_abstract: false,
            overrides: false,
            declaring: a,
            has_default: false,
        });
        let ta = t.intern(TypeKind::Class(a));
        let ti = t.intern(TypeKind::Interface(named));
        assert!(t.is_assignable(ta, ti));

        let empty = t.declare_class("m", "Empty");
        let tempty = t.intern(TypeKind::Class(empty));
        assert!(!t.is_assignable(tempty, ti));
    }

    #[test]
    fn test_narrow_optional() {
        let mut t = table();
        let int = t.int();
        let opt = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::Absent,
        });
        let ok_pattern = PatternKind::Variant {
            name: "Ok".to_string(),
            bindings: vec!["v".to_string()],
        };
        assert_eq!(t.narrow(opt, &ok_pattern), int);
    }

    #[test]
    fn test_uncovered_variants_enum() {
        let mut t = table();
        let color = t.declare_enum(
            "m",
            "Color",
            vec!["Red".to_string(), "Green".to_string(), "Blue".to_string()],
        );
        let ty = t.intern(TypeKind::Enum(color));
        let red = PatternKind::Variant {
            name: "Red".to_string(),
            bindings: vec![],
        };
        let green = PatternKind::Variant {
            name: "Green".to_string(),
            bindings: vec![],
        };
        let uncovered = t.uncovered_variants(ty, &[&red, &green]).unwrap();
        assert_eq!(uncovered, vec!["Blue".to_string()]);

        let wildcard = PatternKind::Wildcard;
        let uncovered = t.uncovered_variants(ty, &[&red, &wildcard]).unwrap();
        assert!(uncovered.is_empty());
    }

    #[test]
    fn test_uncovered_variants_optional() {
        let mut t = table();
        let int = t.int();
        let opt = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::Absent,
        });
        let ok = PatternKind::Variant {
            name: "Ok".to_string(),
            bindings: vec![],
        };
        let uncovered = t.uncovered_variants(opt, &[&ok]).unwrap();
        assert_eq!(uncovered, vec!["Err".to_string()]);
    }

    #[test]
    fn test_display_forms() {
        let mut t = table();
        let int = t.int();
        let str_ = t.str();
        let opt = t.intern(TypeKind::Optional {
            success: int,
            error: ErrorSet::Absent,
        });
        let union = t.union_of(vec![int, str_]);
        let list = t.intern(TypeKind::List(int));
        assert_eq!(t.display(opt), "int?");
        assert_eq!(t.display(union), "int | str");
        assert_eq!(t.display(list), "[int]");
    }
}
