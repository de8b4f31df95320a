//! Semantic analysis and lowering of a parsed translation unit into an
//! [`IntermediateModule`](crate::module::IntermediateModule).
//!
//! Declarations are processed in source order, so a name is visible from
//! its declaration onwards. Function bodies are lowered to Cranelift IR as
//! soon as they are met; initializers of globals that are not constant
//! expressions are collected and lowered into the module's static
//! initializer at the end.

mod function;

use std::collections::HashMap;

use cranelift_codegen::ir::{AbiParam, Signature};

use crate::ast::{
    ArrayBound, BinaryOp, DeclSpecifiers, Expr, ExprKind, FunctionDecl, Initializer, IntKind,
    Item, StorageClass, TypeExpr, TypeSpec, TypedefDecl, UnaryOp, VariableDecl, display_path,
};
use crate::diagnostic::DiagnosticEngine;
use crate::mangle::{mangle_function, mangle_variable};
use crate::module::{
    DataBody, DataContents, DataRelocation, FunctionBody, ModuleContents, ModuleSymbol,
    SymbolKind, SymbolLinkage, TLS_CONTROL_PREFIX,
};
use crate::span::Span;
use crate::token::IntSuffix;
use crate::types::{CType, TargetLayout, is_signed};

/// Attributes accepted without a warning, after stripping `gnu::`/`clang::`.
const KNOWN_ATTRIBUTES: &[&str] = &[
    "constructor",
    "destructor",
    "used",
    "unused",
    "maybe_unused",
    "nodiscard",
    "noreturn",
    "noinline",
    "always_inline",
    "deprecated",
    "cold",
    "hot",
    "visibility",
    "aligned",
    "likely",
    "unlikely",
];

/// Name of the preamble routine returning the calling thread's instance
/// of a thread-local variable.
pub(crate) const TLS_GET: &str = "__tls_get";
pub(crate) const TLS_RELEASE: &str = "__tls_release";

// ═══════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════

/// A type together with the `const` qualification of the object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QualType {
    pub ty: CType,
    pub is_const: bool,
}

impl QualType {
    pub fn new(ty: CType) -> Self {
        Self {
            ty,
            is_const: false,
        }
    }

    /// The value type when used as an rvalue.
    pub fn decayed(&self) -> CType {
        self.ty.decay(self.is_const)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionEntity {
    pub symbol: usize,
    pub name: String,
    pub params: Vec<CType>,
    pub ret: CType,
    pub variadic: bool,
    pub declared: Span,
    pub defined: Option<Span>,
}

#[derive(Debug, Clone)]
pub(crate) struct VariableEntity {
    /// For thread-locals this is the emulated-TLS control block.
    pub symbol: usize,
    pub qt: QualType,
    pub thread_local: bool,
    pub declared: Span,
    pub defined: Option<Span>,
    /// Value of a `const` scalar with a constant initializer.
    pub constant: Option<ConstValue>,
}

#[derive(Debug, Clone)]
pub(crate) enum Entity {
    Functions(Vec<FunctionEntity>),
    Variable(VariableEntity),
    Typedef(QualType, Span),
}

impl Entity {
    fn declared(&self) -> Span {
        match self {
            Entity::Functions(set) => set.first().map(|f| f.declared).unwrap_or_default(),
            Entity::Variable(v) => v.declared,
            Entity::Typedef(_, span) => *span,
        }
    }
}

/// What a function body knows about one of its local names.
#[derive(Debug, Clone)]
pub(crate) enum LocalName {
    Variable {
        qt: QualType,
        constant: Option<ConstValue>,
    },
    Typedef(QualType),
}

pub(crate) type Locals<'a> = &'a dyn Fn(&str) -> Option<LocalName>;

pub(crate) fn no_locals(_: &str) -> Option<LocalName> {
    None
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConstValue {
    Int(i128),
    Float(f64),
    Address { symbol: usize, addend: i64 },
    Null,
}

impl ConstValue {
    fn truthy(&self) -> bool {
        match self {
            ConstValue::Int(v) => *v != 0,
            ConstValue::Float(f) => *f != 0.0,
            ConstValue::Address { .. } => true,
            ConstValue::Null => false,
        }
    }
}

/// Result of checking an implicit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conversion {
    Ok,
    DiscardsConst,
    Incompatible,
}

pub(crate) fn implicit_conversion(from: &CType, to: &CType, null_constant: bool) -> Conversion {
    if from == to {
        return Conversion::Ok;
    }
    match (from, to) {
        (f, t) if f.is_arithmetic() && t.is_arithmetic() => Conversion::Ok,
        (CType::Pointer { .. }, CType::Bool) => Conversion::Ok,
        (_, CType::Pointer { .. }) if null_constant => Conversion::Ok,
        (
            CType::Pointer {
                pointee: from_pointee,
                pointee_const: from_const,
            },
            CType::Pointer {
                pointee: to_pointee,
                pointee_const: to_const,
            },
        ) => {
            if from_pointee != to_pointee && !to_pointee.is_void() {
                return Conversion::Incompatible;
            }
            if *from_const && !*to_const {
                return Conversion::DiscardsConst;
            }
            Conversion::Ok
        }
        _ => Conversion::Incompatible,
    }
}

/// A null pointer constant: `nullptr` or a literal zero.
pub(crate) fn is_null_constant(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Nullptr | ExprKind::IntLit { value: 0, .. }
    )
}

/// Why a call could not be bound to one overload.
pub(crate) enum OverloadError {
    NoViable,
    Ambiguous,
    /// Only one candidate exists and the argument count is wrong.
    ArgumentCount { expected: usize, variadic: bool },
}

/// Pick the overload with the most exact argument matches.
pub(crate) fn select_overload(
    candidates: &[FunctionEntity],
    args: &[(CType, bool)],
) -> Result<FunctionEntity, OverloadError> {
    if let [only] = candidates {
        let count_ok = if only.variadic {
            args.len() >= only.params.len()
        } else {
            args.len() == only.params.len()
        };
        if !count_ok {
            return Err(OverloadError::ArgumentCount {
                expected: only.params.len(),
                variadic: only.variadic,
            });
        }
        return Ok(only.clone());
    }
    let mut best: Option<(usize, &FunctionEntity)> = None;
    let mut tie = false;
    for candidate in candidates {
        let count_ok = if candidate.variadic {
            args.len() >= candidate.params.len()
        } else {
            args.len() == candidate.params.len()
        };
        if !count_ok {
            continue;
        }
        let mut score = 0;
        let mut viable = true;
        for ((arg, null_constant), param) in args.iter().zip(&candidate.params) {
            if arg == param {
                score += 2;
            } else if implicit_conversion(arg, param, *null_constant) == Conversion::Ok {
                score += 1;
            } else {
                viable = false;
                break;
            }
        }
        if !viable {
            continue;
        }
        match best {
            Some((best_score, _)) if best_score > score => {}
            Some((best_score, _)) if best_score == score => tie = true,
            _ => {
                best = Some((score, candidate));
                tie = false;
            }
        }
    }
    match best {
        Some(_) if tie => Err(OverloadError::Ambiguous),
        Some((_, found)) => Ok(found.clone()),
        None => Err(OverloadError::NoViable),
    }
}

struct DynamicInit {
    symbol: usize,
    qt: QualType,
    init: Initializer,
    namespaces: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════
// ModuleLowerer
// ═══════════════════════════════════════════════════════════════════

pub struct ModuleLowerer<'d, 's> {
    pub(crate) diag: &'d mut DiagnosticEngine<'s>,
    pub(crate) layout: TargetLayout,
    module_name: String,
    symbols: Vec<ModuleSymbol>,
    symbol_ids: HashMap<String, usize>,
    /// Per symbol: defined in this module, and kept module-local.
    defined: Vec<bool>,
    local: Vec<bool>,
    globals: HashMap<String, Entity>,
    functions: Vec<FunctionBody>,
    data: Vec<DataBody>,
    strings: HashMap<String, usize>,
    dynamic_inits: Vec<DynamicInit>,
    thread_locals: Vec<usize>,
    constructors: Vec<usize>,
    destructors: Vec<usize>,
    pub(crate) namespaces: Vec<String>,
    c_linkage: bool,
    from_header: bool,
    static_locals: usize,
}

impl<'d, 's> ModuleLowerer<'d, 's> {
    pub fn new(
        diag: &'d mut DiagnosticEngine<'s>,
        layout: TargetLayout,
        module_name: &str,
    ) -> Self {
        Self {
            diag,
            layout,
            module_name: module_name.to_string(),
            symbols: Vec::new(),
            symbol_ids: HashMap::new(),
            defined: Vec::new(),
            local: Vec::new(),
            globals: HashMap::new(),
            functions: Vec::new(),
            data: Vec::new(),
            strings: HashMap::new(),
            dynamic_inits: Vec::new(),
            thread_locals: Vec::new(),
            constructors: Vec::new(),
            destructors: Vec::new(),
            namespaces: Vec::new(),
            c_linkage: false,
            from_header: false,
            static_locals: 0,
        }
    }

    /// Items of the implicit precompiled header. Definitions stay local to
    /// the module so every module may carry its own copy.
    pub fn lower_header(&mut self, items: &[Item]) {
        self.from_header = true;
        self.lower_items(items);
        self.from_header = false;
    }

    pub fn lower_items(&mut self, items: &[Item]) {
        for item in items {
            if self.diag.is_fatal() {
                return;
            }
            match item {
                Item::Function(decl) => self.function(decl),
                Item::Variable(decl) => self.global_variable(decl),
                Item::Typedef(decl) => self.typedef(decl),
                Item::Namespace { name, items, .. } => {
                    self.namespaces.push(name.clone());
                    self.lower_items(items);
                    self.namespaces.pop();
                }
                Item::CLinkage { items, .. } => {
                    let saved = std::mem::replace(&mut self.c_linkage, true);
                    self.lower_items(items);
                    self.c_linkage = saved;
                }
            }
        }
    }

    pub fn finish(mut self, libraries: Vec<String>) -> ModuleContents {
        let initializer = self.lower_initializer();
        let finalizer = self.lower_finalizer();
        for (index, symbol) in self.symbols.iter_mut().enumerate() {
            symbol.linkage = match (self.defined[index], self.local[index]) {
                (false, _) => SymbolLinkage::Import,
                (true, true) => SymbolLinkage::Local,
                (true, false) => SymbolLinkage::Export,
            };
        }
        log::debug!(
            "lowered module '{}': {} symbols, {} functions, {} data objects",
            self.module_name,
            self.symbols.len(),
            self.functions.len(),
            self.data.len()
        );
        ModuleContents {
            symbols: self.symbols,
            functions: self.functions,
            data: self.data,
            initializer,
            finalizer,
            constructors: self.constructors,
            destructors: self.destructors,
            libraries,
        }
    }

    // ── Names and symbols ─────────────────────────────────────────

    fn qualify(&self, name: &str) -> String {
        if self.namespaces.is_empty() {
            name.to_string()
        } else {
            format!("{}::{name}", self.namespaces.join("::"))
        }
    }

    /// Innermost-first lookup through the enclosing namespaces.
    pub(crate) fn lookup(&self, path: &[String], global: bool) -> Option<&Entity> {
        let joined = path.join("::");
        if !global {
            for depth in (1..=self.namespaces.len()).rev() {
                let key = format!("{}::{joined}", self.namespaces[..depth].join("::"));
                if let Some(entity) = self.globals.get(&key) {
                    return Some(entity);
                }
            }
        }
        self.globals.get(&joined)
    }

    fn declare_symbol(&mut self, name: &str, kind: SymbolKind, span: Span) -> Option<usize> {
        if let Some(&index) = self.symbol_ids.get(name) {
            let existing = &mut self.symbols[index];
            match (&mut existing.kind, &kind) {
                (SymbolKind::Function(old), SymbolKind::Function(new)) => {
                    if old != new {
                        self.diag
                            .error(span, format!("conflicting types for '{name}'"));
                        return None;
                    }
                }
                (SymbolKind::Data { writable }, SymbolKind::Data { writable: new }) => {
                    *writable |= *new;
                }
                _ => {
                    self.diag.error(
                        span,
                        format!("redefinition of '{name}' as different kind of symbol"),
                    );
                    return None;
                }
            }
            return Some(index);
        }
        let index = self.symbols.len();
        self.symbols.push(ModuleSymbol {
            name: name.to_string(),
            kind,
            linkage: SymbolLinkage::Import,
        });
        self.symbol_ids.insert(name.to_string(), index);
        self.defined.push(false);
        self.local.push(false);
        Some(index)
    }

    fn define_symbol(&mut self, index: usize, local: bool) {
        self.defined[index] = true;
        self.local[index] = local;
    }

    /// A module-local data object.
    fn local_data(&mut self, name: &str, writable: bool, body: DataBody) -> usize {
        let index = self
            .declare_symbol(name, SymbolKind::Data { writable }, Span::default())
            .unwrap_or(0);
        self.define_symbol(index, true);
        self.data.push(DataBody {
            symbol: index,
            ..body
        });
        index
    }

    /// Symbol of a NUL-terminated string literal; identical literals share
    /// one object.
    pub(crate) fn string_symbol(&mut self, text: &str) -> usize {
        if let Some(&symbol) = self.strings.get(text) {
            return symbol;
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let name = format!(".str.{}", self.strings.len());
        let symbol = self.local_data(
            &name,
            false,
            DataBody {
                symbol: 0,
                contents: DataContents::Bytes(bytes),
                align: 1,
                relocations: Vec::new(),
            },
        );
        self.strings.insert(text.to_string(), symbol);
        symbol
    }

    pub(crate) fn symbol_name(&self, index: usize) -> &str {
        &self.symbols[index].name
    }

    pub(crate) fn function_signature(&self, index: usize) -> Option<Signature> {
        match &self.symbols[index].kind {
            SymbolKind::Function(signature) => Some(signature.clone()),
            SymbolKind::Data { .. } => None,
        }
    }

    /// Storage for a `static` local, named after its function.
    pub(crate) fn static_local(
        &mut self,
        function: usize,
        name: &str,
        writable: bool,
        contents: DataContents,
        align: u64,
        relocations: Vec<DataRelocation>,
    ) -> usize {
        self.static_locals += 1;
        let symbol_name = format!(
            "{}.{name}.{}",
            self.symbols[function].name, self.static_locals
        );
        self.local_data(
            &symbol_name,
            writable,
            DataBody {
                symbol: 0,
                contents,
                align,
                relocations,
            },
        )
    }

    // ── Types ─────────────────────────────────────────────────────

    pub(crate) fn size_type(&self) -> CType {
        if self.layout.long_bits as u16 == self.layout.pointer_bytes as u16 * 8 {
            CType::Int(IntKind::ULong)
        } else {
            CType::Int(IntKind::ULongLong)
        }
    }

    pub(crate) fn ptrdiff_type(&self) -> CType {
        if self.layout.long_bits as u16 == self.layout.pointer_bytes as u16 * 8 {
            CType::Int(IntKind::Long)
        } else {
            CType::Int(IntKind::LongLong)
        }
    }

    fn int_max(&self, kind: IntKind) -> u64 {
        let bits = self.layout.int_bits(kind) as u32;
        if is_signed(kind) {
            (1u64 << (bits - 1)) - 1
        } else if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    /// Type of an integer literal: the first of the candidate types, picked
    /// by suffix and base, that can hold the value.
    pub(crate) fn int_literal_type(&self, value: u64, suffix: IntSuffix) -> CType {
        use IntKind::*;
        let candidates: &[IntKind] = match (suffix.unsigned, suffix.longs, suffix.decimal) {
            (false, 0, true) => &[Int, Long, LongLong],
            (false, 0, false) => &[Int, UInt, Long, ULong, LongLong, ULongLong],
            (true, 0, _) => &[UInt, ULong, ULongLong],
            (false, 1, true) => &[Long, LongLong],
            (false, 1, false) => &[Long, ULong, LongLong, ULongLong],
            (true, 1, _) => &[ULong, ULongLong],
            (false, _, true) => &[LongLong],
            (false, _, false) => &[LongLong, ULongLong],
            (true, _, _) => &[ULongLong],
        };
        let kind = candidates
            .iter()
            .copied()
            .find(|kind| value <= self.int_max(*kind))
            .unwrap_or(ULongLong);
        CType::Int(kind)
    }

    /// Wrap `value` to the range of `ty`.
    pub(crate) fn normalize(&self, value: i128, ty: &CType) -> i128 {
        let (bits, signed) = match ty {
            CType::Bool => return (value != 0) as i128,
            CType::Int(kind) => (self.layout.int_bits(*kind) as u32, is_signed(*kind)),
            CType::Pointer { .. } => (self.layout.pointer_bytes as u32 * 8, false),
            _ => return value,
        };
        let mask = (1i128 << bits) - 1;
        let unsigned = value & mask;
        if signed && (unsigned >> (bits - 1)) & 1 == 1 {
            unsigned - (1i128 << bits)
        } else {
            unsigned
        }
    }

    /// Resolve a written type. `init` supplies the length of `T x[] = ...`.
    pub(crate) fn resolve_type(
        &mut self,
        ty: &TypeExpr,
        init: Option<&Initializer>,
        locals: Locals,
    ) -> Option<QualType> {
        let mut qt = self.base_type(&ty.spec, ty.span, locals)?;
        qt.is_const |= ty.is_const;
        for pointer_const in &ty.pointers {
            qt = QualType {
                ty: CType::pointer_to(qt.ty, qt.is_const),
                is_const: *pointer_const,
            };
        }
        let Some(bound) = &ty.array else {
            return Some(qt);
        };
        let len = match bound {
            ArrayBound::Sized(expr) => match self.const_eval(expr, locals) {
                Some((ConstValue::Int(n), size_ty)) if size_ty.is_integer() => {
                    if n < 0 {
                        self.diag.error(expr.span, "array size is negative");
                        return None;
                    }
                    n as u64
                }
                _ => {
                    self.diag.error(
                        expr.span,
                        "array size is not an integral constant expression",
                    );
                    return None;
                }
            },
            ArrayBound::Unsized => match init {
                Some(Initializer::List(items, _)) => items.len() as u64,
                Some(Initializer::Expr(Expr {
                    kind: ExprKind::StrLit(text),
                    ..
                })) => text.len() as u64 + 1,
                _ => {
                    self.diag.error(
                        ty.span,
                        "definition of variable with array type needs an explicit size or an initializer",
                    );
                    return None;
                }
            },
        };
        Some(QualType {
            ty: CType::Array {
                element: Box::new(qt.ty),
                len,
            },
            is_const: qt.is_const,
        })
    }

    fn base_type(&mut self, spec: &TypeSpec, span: Span, locals: Locals) -> Option<QualType> {
        let ty = match spec {
            TypeSpec::Void => CType::Void,
            TypeSpec::Bool => CType::Bool,
            TypeSpec::Int(kind) => CType::Int(*kind),
            TypeSpec::Float => CType::Float,
            TypeSpec::Double => CType::Double,
            TypeSpec::Named { path, global } => {
                if !*global && path.len() == 1 {
                    if let Some(LocalName::Typedef(qt)) = locals(&path[0]) {
                        return Some(qt);
                    }
                }
                return match self.lookup(path, *global) {
                    Some(Entity::Typedef(qt, _)) => Some(qt.clone()),
                    _ => {
                        self.diag.error(
                            span,
                            format!("unknown type name '{}'", display_path(path, *global)),
                        );
                        None
                    }
                };
            }
        };
        Some(QualType::new(ty))
    }

    pub(crate) fn abi_param(&self, ty: &CType) -> Option<AbiParam> {
        let ir = ty.ir_type(&self.layout)?;
        let param = AbiParam::new(ir);
        Some(match ty {
            CType::Bool => param.uext(),
            CType::Int(kind) if self.layout.int_bits(*kind) < 32 => {
                if is_signed(*kind) {
                    param.sext()
                } else {
                    param.uext()
                }
            }
            _ => param,
        })
    }

    pub(crate) fn signature(&self, ret: &CType, params: &[CType]) -> Signature {
        let mut signature = Signature::new(self.layout.call_conv);
        for param in params {
            if let Some(abi) = self.abi_param(param) {
                signature.params.push(abi);
            }
        }
        if let Some(abi) = self.abi_param(ret) {
            signature.returns.push(abi);
        }
        signature
    }

    pub(crate) fn check_attributes(&mut self, specifiers: &DeclSpecifiers) {
        for attribute in &specifiers.attributes {
            let name = attribute
                .name
                .strip_prefix("gnu::")
                .or_else(|| attribute.name.strip_prefix("clang::"))
                .unwrap_or(&attribute.name);
            if !KNOWN_ATTRIBUTES.contains(&name) {
                self.diag.warning(
                    attribute.span,
                    format!("unknown attribute '{}' ignored", attribute.name),
                );
            }
        }
    }

    fn has_attribute(specifiers: &DeclSpecifiers, name: &str) -> bool {
        specifiers.has_attribute(name) || specifiers.has_attribute(&format!("gnu::{name}"))
    }

    fn redefinition(&mut self, span: Span, name: &str, previous: Span) {
        self.diag.error(span, format!("redefinition of '{name}'"));
        self.diag.note(previous, "previous definition is here");
    }

    // ── Declarations ──────────────────────────────────────────────

    fn typedef(&mut self, decl: &TypedefDecl) {
        let Some(qt) = self.resolve_type(&decl.ty, None, &no_locals) else {
            return;
        };
        let key = self.qualify(&decl.name);
        match self.globals.get(&key) {
            Some(Entity::Typedef(existing, _)) if *existing == qt => {}
            Some(existing) => {
                let previous = existing.declared();
                self.diag.error(
                    decl.span,
                    format!("typedef redefinition with different types ('{}')", qt.ty),
                );
                self.diag.note(previous, "previous definition is here");
            }
            None => {
                self.globals.insert(key, Entity::Typedef(qt, decl.span));
            }
        }
    }

    fn function(&mut self, decl: &FunctionDecl) {
        self.check_attributes(&decl.specifiers);
        let Some(ret) = self.resolve_type(&decl.return_type, None, &no_locals) else {
            return;
        };
        if matches!(ret.ty, CType::Array { .. }) {
            self.diag
                .error(decl.return_type.span, "function cannot return array type");
            return;
        }
        let mut params = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            let Some(qt) = self.resolve_type(&param.ty, None, &no_locals) else {
                return;
            };
            if qt.ty.is_void() {
                self.diag
                    .error(param.span, "argument may not have 'void' type");
                return;
            }
            params.push(qt);
        }
        let param_types: Vec<CType> = params.iter().map(QualType::decayed).collect();
        let ret = ret.ty;

        let is_main = self.namespaces.is_empty() && decl.name == "main";
        let symbol_name = if self.c_linkage || is_main {
            decl.name.clone()
        } else {
            mangle_function(&self.namespaces, &decl.name, &param_types, decl.variadic)
        };
        let key = self.qualify(&decl.name);
        let body_span = decl.body.as_ref().map(|b| b.span);

        // Find or create the entity.
        let mut existing_defined = None;
        match self.globals.get(&key) {
            Some(Entity::Functions(set)) => {
                if let Some(same) = set
                    .iter()
                    .find(|f| f.params == param_types && f.variadic == decl.variadic)
                {
                    if same.ret != ret {
                        let previous = same.declared;
                        self.diag.error(
                            decl.span,
                            "functions that differ only in their return type cannot be overloaded",
                        );
                        self.diag.note(previous, "previous declaration is here");
                        return;
                    }
                    existing_defined = same.defined;
                } else if self.c_linkage {
                    let previous = set[0].declared;
                    self.diag.error(
                        decl.span,
                        format!("conflicting types for '{}'", decl.name),
                    );
                    self.diag.note(previous, "previous declaration is here");
                    return;
                }
            }
            Some(other) => {
                let previous = other.declared();
                self.diag.error(
                    decl.span,
                    format!(
                        "redefinition of '{}' as different kind of symbol",
                        decl.name
                    ),
                );
                self.diag.note(previous, "previous definition is here");
                return;
            }
            None => {}
        }
        if let (Some(previous), Some(_)) = (existing_defined, body_span) {
            self.redefinition(decl.span, &decl.name, previous);
            return;
        }

        let signature = self.signature(&ret, &param_types);
        let Some(symbol) =
            self.declare_symbol(&symbol_name, SymbolKind::Function(signature), decl.span)
        else {
            return;
        };
        let entity = FunctionEntity {
            symbol,
            name: decl.name.clone(),
            params: param_types,
            ret: ret.clone(),
            variadic: decl.variadic,
            declared: decl.span,
            defined: body_span.map(|_| decl.span).or(existing_defined),
        };
        match self.globals.get_mut(&key) {
            Some(Entity::Functions(set)) => {
                match set.iter_mut().find(|f| f.symbol == symbol) {
                    Some(slot) => slot.defined = entity.defined,
                    None => set.push(entity.clone()),
                }
            }
            _ => {
                self.globals
                    .insert(key, Entity::Functions(vec![entity.clone()]));
            }
        }

        for (attribute, list) in [("constructor", true), ("destructor", false)] {
            if !Self::has_attribute(&decl.specifiers, attribute) {
                continue;
            }
            if !ret.is_void() || !entity.params.is_empty() || decl.variadic {
                self.diag.error(
                    decl.span,
                    format!(
                        "'{attribute}' attribute requires a function of type 'void ()'"
                    ),
                );
                continue;
            }
            if list {
                self.constructors.push(symbol);
            } else {
                self.destructors.push(symbol);
            }
        }

        let Some(body) = &decl.body else {
            return;
        };
        let local = decl.specifiers.storage == StorageClass::Static
            || decl.specifiers.inline
            || self.from_header;
        self.define_symbol(symbol, local);
        if let Some(lowered) = function::lower_definition(self, &entity, decl, &params, body)
        {
            self.functions.push(lowered);
        }
    }

    fn global_variable(&mut self, decl: &VariableDecl) {
        self.check_attributes(&decl.specifiers);
        let Some(qt) = self.resolve_type(&decl.ty, decl.init.as_ref(), &no_locals) else {
            return;
        };
        if qt.ty.is_void() {
            self.diag
                .error(decl.span, "variable has incomplete type 'void'");
            return;
        }
        let specifiers = &decl.specifiers;
        let declaration_only = specifiers.storage == StorageClass::Extern && decl.init.is_none();
        let key = self.qualify(&decl.name);

        let mut previous_definition = None;
        match self.globals.get(&key) {
            Some(Entity::Variable(existing)) => {
                if existing.qt.ty != qt.ty {
                    let previous = existing.declared;
                    self.diag.error(
                        decl.span,
                        format!(
                            "redefinition of '{}' with a different type: '{}' vs '{}'",
                            decl.name, qt.ty, existing.qt.ty
                        ),
                    );
                    self.diag.note(previous, "previous definition is here");
                    return;
                }
                previous_definition = existing.defined;
            }
            Some(other) => {
                let previous = other.declared();
                self.diag.error(
                    decl.span,
                    format!(
                        "redefinition of '{}' as different kind of symbol",
                        decl.name
                    ),
                );
                self.diag.note(previous, "previous definition is here");
                return;
            }
            None => {}
        }
        if let (Some(previous), false) = (previous_definition, declaration_only) {
            self.redefinition(decl.span, &decl.name, previous);
            return;
        }

        let base_name = if self.c_linkage {
            decl.name.clone()
        } else {
            mangle_variable(&self.namespaces, &decl.name)
        };
        let thread_local = specifiers.thread_local;
        let symbol_name = if thread_local {
            format!("{TLS_CONTROL_PREFIX}{base_name}")
        } else {
            base_name.clone()
        };
        let constant_init = match &decl.init {
            Some(init) if !declaration_only => self.constant_data(&qt, init, &no_locals),
            _ => None,
        };
        let writable = !qt.is_const || (decl.init.is_some() && constant_init.is_none());
        let Some(symbol) =
            self.declare_symbol(&symbol_name, SymbolKind::Data { writable }, decl.span)
        else {
            return;
        };
        let constant = match (&constant_init, qt.is_const, &decl.init) {
            (Some(_), true, Some(Initializer::Expr(expr))) if qt.ty.is_scalar() => self
                .const_eval(expr, &no_locals)
                .and_then(|(value, from)| self.const_convert(value, &from, &qt.ty)),
            _ => None,
        };
        let defined = if declaration_only {
            None
        } else {
            Some(decl.span)
        };
        self.globals.insert(
            key,
            Entity::Variable(VariableEntity {
                symbol,
                qt: qt.clone(),
                thread_local,
                declared: decl.span,
                defined,
                constant,
            }),
        );
        if declaration_only {
            return;
        }

        // Namespace-scope `const` objects have internal linkage.
        let local = specifiers.storage == StorageClass::Static
            || self.from_header
            || (qt.is_const && specifiers.storage != StorageClass::Extern);
        self.define_symbol(symbol, local);
        let size = qt.ty.size(&self.layout) as usize;
        let align = qt.ty.align(&self.layout);

        if thread_local {
            let Some((bytes, relocations)) = (match &decl.init {
                None => Some((vec![0; size], Vec::new())),
                Some(_) => constant_init,
            }) else {
                self.diag.error(
                    decl.init.as_ref().map(Initializer::span).unwrap_or(decl.span),
                    "initializer for thread-local variable must be a constant expression",
                );
                return;
            };
            self.emulated_tls(symbol, &base_name, size, align, bytes, relocations);
            return;
        }

        match (constant_init, &decl.init) {
            (Some((bytes, relocations)), _) => self.data.push(DataBody {
                symbol,
                contents: DataContents::Bytes(bytes),
                align,
                relocations,
            }),
            (None, init) => {
                self.data.push(DataBody {
                    symbol,
                    contents: DataContents::Zeroed(size),
                    align,
                    relocations: Vec::new(),
                });
                if let Some(init) = init {
                    self.dynamic_inits.push(DynamicInit {
                        symbol,
                        qt,
                        init: init.clone(),
                        namespaces: self.namespaces.clone(),
                    });
                }
            }
        }
    }

    /// Control block `{size, align, index, template}` plus the template
    /// object holding the initial value of every thread's instance.
    fn emulated_tls(
        &mut self,
        control: usize,
        name: &str,
        size: usize,
        align: u64,
        template: Vec<u8>,
        relocations: Vec<DataRelocation>,
    ) {
        let template_symbol = self.local_data(
            &format!("__emutls_t.{name}"),
            false,
            DataBody {
                symbol: 0,
                contents: DataContents::Bytes(template),
                align,
                relocations,
            },
        );
        let word = self.layout.pointer_bytes as usize;
        let mut bytes = vec![0u8; word * 4];
        bytes[..word].copy_from_slice(&(size as u64).to_le_bytes()[..word]);
        bytes[word..word * 2].copy_from_slice(&align.to_le_bytes()[..word]);
        self.data.push(DataBody {
            symbol: control,
            contents: DataContents::Bytes(bytes),
            align: word as u64,
            relocations: vec![DataRelocation {
                offset: (word * 3) as u32,
                symbol: template_symbol,
                addend: 0,
            }],
        });
        if let Some(symbol) = self.symbols.get_mut(control) {
            symbol.kind = SymbolKind::Data { writable: true };
        }
        self.thread_locals.push(control);
    }

    // ── Constant evaluation ───────────────────────────────────────

    /// Bytes and relocations of a constant initializer, or `None` if the
    /// initializer must run at load time.
    pub(crate) fn constant_data(
        &mut self,
        qt: &QualType,
        init: &Initializer,
        locals: Locals,
    ) -> Option<(Vec<u8>, Vec<DataRelocation>)> {
        let size = qt.ty.size(&self.layout) as usize;
        let mut bytes = vec![0u8; size];
        let mut relocations = Vec::new();
        match (&qt.ty, init) {
            (CType::Array { element, len }, Initializer::Expr(expr)) => {
                let ExprKind::StrLit(text) = &expr.kind else {
                    return None;
                };
                if !matches!(**element, CType::Int(IntKind::Char | IntKind::SChar | IntKind::UChar))
                    || text.len() as u64 > *len
                {
                    return None;
                }
                bytes[..text.len()].copy_from_slice(text.as_bytes());
            }
            (CType::Array { element, len }, Initializer::List(items, _)) => {
                if items.len() as u64 > *len {
                    return None;
                }
                let stride = element.size(&self.layout) as usize;
                for (i, item) in items.iter().enumerate() {
                    let value = self.constant_scalar(item, element, locals)?;
                    self.write_const(&value, element, &mut bytes, i * stride, &mut relocations);
                }
            }
            (ty, Initializer::Expr(expr)) => {
                let value = self.constant_scalar(expr, ty, locals)?;
                self.write_const(&value, ty, &mut bytes, 0, &mut relocations);
            }
            (ty, Initializer::List(items, _)) if items.len() <= 1 => {
                if let Some(item) = items.first() {
                    let value = self.constant_scalar(item, ty, locals)?;
                    self.write_const(&value, ty, &mut bytes, 0, &mut relocations);
                }
            }
            _ => return None,
        }
        Some((bytes, relocations))
    }

    fn constant_scalar(&mut self, expr: &Expr, to: &CType, locals: Locals) -> Option<ConstValue> {
        let (value, from) = self.const_eval(expr, locals)?;
        if implicit_conversion(&from, to, is_null_constant(expr)) != Conversion::Ok {
            return None;
        }
        self.const_convert(value, &from, to)
    }

    fn write_const(
        &self,
        value: &ConstValue,
        ty: &CType,
        bytes: &mut [u8],
        offset: usize,
        relocations: &mut Vec<DataRelocation>,
    ) {
        let size = ty.size(&self.layout) as usize;
        let target = &mut bytes[offset..offset + size];
        match value {
            ConstValue::Int(v) => target.copy_from_slice(&(*v as u64).to_le_bytes()[..size]),
            ConstValue::Float(f) => match ty {
                CType::Float => target.copy_from_slice(&(*f as f32).to_le_bytes()),
                _ => target.copy_from_slice(&f.to_le_bytes()[..size]),
            },
            ConstValue::Null => {}
            ConstValue::Address { symbol, addend } => relocations.push(DataRelocation {
                offset: offset as u32,
                symbol: *symbol,
                addend: *addend,
            }),
        }
    }

    pub(crate) fn const_convert(
        &self,
        value: ConstValue,
        from: &CType,
        to: &CType,
    ) -> Option<ConstValue> {
        Some(match (value, to) {
            (value, CType::Bool) => ConstValue::Int(value.truthy() as i128),
            (ConstValue::Int(v), CType::Int(_)) => ConstValue::Int(self.normalize(v, to)),
            (ConstValue::Float(f), CType::Int(_)) => {
                ConstValue::Int(self.normalize(f as i128, to))
            }
            (ConstValue::Int(v), CType::Float) => ConstValue::Float(v as f32 as f64),
            (ConstValue::Int(v), CType::Double) => ConstValue::Float(v as f64),
            (ConstValue::Float(f), CType::Float) => ConstValue::Float(f as f32 as f64),
            (ConstValue::Float(f), CType::Double) => ConstValue::Float(f),
            (ConstValue::Null, CType::Pointer { .. }) => ConstValue::Null,
            (ConstValue::Null, CType::Int(_)) => ConstValue::Int(0),
            (ConstValue::Int(0), CType::Pointer { .. }) if from.is_integer() => ConstValue::Null,
            (ConstValue::Int(v), CType::Pointer { .. }) => ConstValue::Int(self.normalize(v, to)),
            (address @ ConstValue::Address { .. }, CType::Pointer { .. }) => address,
            _ => return None,
        })
    }

    /// Evaluate a constant expression, returning its value and type.
    pub(crate) fn const_eval(&mut self, expr: &Expr, locals: Locals) -> Option<(ConstValue, CType)> {
        match &expr.kind {
            ExprKind::IntLit { value, suffix } => {
                let ty = self.int_literal_type(*value, *suffix);
                Some((ConstValue::Int(self.normalize(*value as i128, &ty)), ty))
            }
            ExprKind::FloatLit { value, single } => Some(if *single {
                (ConstValue::Float(*value as f32 as f64), CType::Float)
            } else {
                (ConstValue::Float(*value), CType::Double)
            }),
            ExprKind::CharLit(v) => Some((ConstValue::Int(*v as i128), CType::Int(IntKind::Char))),
            ExprKind::BoolLit(b) => Some((ConstValue::Int(*b as i128), CType::Bool)),
            ExprKind::Nullptr => Some((ConstValue::Null, CType::pointer_to(CType::Void, false))),
            ExprKind::StrLit(text) => {
                let symbol = self.string_symbol(text);
                Some((
                    ConstValue::Address { symbol, addend: 0 },
                    CType::pointer_to(CType::Int(IntKind::Char), true),
                ))
            }
            ExprKind::Name { path, global } => {
                if !*global && path.len() == 1 {
                    match locals(&path[0]) {
                        Some(LocalName::Variable { qt, constant }) => {
                            return constant.map(|value| (value, qt.ty));
                        }
                        Some(LocalName::Typedef(_)) => return None,
                        None => {}
                    }
                }
                match self.lookup(path, *global)? {
                    Entity::Variable(var) => {
                        if let Some(value) = &var.constant {
                            return Some((value.clone(), var.qt.ty.clone()));
                        }
                        // Arrays decay to their constant address.
                        if matches!(var.qt.ty, CType::Array { .. }) && !var.thread_local {
                            return Some((
                                ConstValue::Address {
                                    symbol: var.symbol,
                                    addend: 0,
                                },
                                var.qt.decayed(),
                            ));
                        }
                        None
                    }
                    _ => None,
                }
            }
            ExprKind::Unary { op, operand } => self.const_unary(*op, operand, locals),
            ExprKind::Binary { op, lhs, rhs } => self.const_binary(*op, lhs, rhs, locals),
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let (cond, _) = self.const_eval(cond, locals)?;
                let (then_value, then_ty) = self.const_eval(then, locals)?;
                let (else_value, else_ty) = self.const_eval(otherwise, locals)?;
                if then_ty.is_arithmetic() && else_ty.is_arithmetic() {
                    let ty = CType::usual_arithmetic(&then_ty, &else_ty, &self.layout);
                    let chosen = if cond.truthy() {
                        self.const_convert(then_value, &then_ty, &ty)?
                    } else {
                        self.const_convert(else_value, &else_ty, &ty)?
                    };
                    return Some((chosen, ty));
                }
                Some(if cond.truthy() {
                    (then_value, then_ty)
                } else {
                    (else_value, else_ty)
                })
            }
            ExprKind::Cast { ty, operand } => {
                let target = self.resolve_type(ty, None, locals)?.ty;
                let (value, from) = self.const_eval(operand, locals)?;
                let converted = self.const_convert(value, &from, &target)?;
                Some((converted, target))
            }
            ExprKind::SizeofType(ty) => {
                let qt = self.resolve_type(ty, None, locals)?;
                Some((
                    ConstValue::Int(qt.ty.size(&self.layout) as i128),
                    self.size_type(),
                ))
            }
            ExprKind::SizeofExpr(operand) => {
                let ty = self.type_of(operand, locals)?;
                Some((
                    ConstValue::Int(ty.size(&self.layout) as i128),
                    self.size_type(),
                ))
            }
            _ => None,
        }
    }

    fn const_unary(&mut self, op: UnaryOp, operand: &Expr, locals: Locals) -> Option<(ConstValue, CType)> {
        if op == UnaryOp::AddrOf {
            let ExprKind::Name { path, global } = &operand.kind else {
                return None;
            };
            if !*global && path.len() == 1 && locals(&path[0]).is_some() {
                return None;
            }
            return match self.lookup(path, *global)? {
                Entity::Variable(var) if !var.thread_local => {
                    let ty = CType::pointer_to(var.qt.ty.clone(), var.qt.is_const);
                    Some((
                        ConstValue::Address {
                            symbol: var.symbol,
                            addend: 0,
                        },
                        ty,
                    ))
                }
                _ => None,
            };
        }
        let (value, ty) = self.const_eval(operand, locals)?;
        match (op, value) {
            (UnaryOp::Not, value) => Some((ConstValue::Int(!value.truthy() as i128), CType::Bool)),
            (UnaryOp::Neg, ConstValue::Int(v)) => {
                let ty = ty.promoted();
                Some((ConstValue::Int(self.normalize(-v, &ty)), ty))
            }
            (UnaryOp::Neg, ConstValue::Float(f)) => Some((ConstValue::Float(-f), ty)),
            (UnaryOp::Plus, ConstValue::Int(v)) => {
                let ty = ty.promoted();
                Some((ConstValue::Int(self.normalize(v, &ty)), ty))
            }
            (UnaryOp::Plus, value @ ConstValue::Float(_)) => Some((value, ty)),
            (UnaryOp::BitNot, ConstValue::Int(v)) if ty.is_integer() => {
                let ty = ty.promoted();
                Some((ConstValue::Int(self.normalize(!v, &ty)), ty))
            }
            _ => None,
        }
    }

    fn const_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        locals: Locals,
    ) -> Option<(ConstValue, CType)> {
        let (a, a_ty) = self.const_eval(lhs, locals)?;
        if matches!(op, BinaryOp::LogAnd | BinaryOp::LogOr) {
            let short = match op {
                BinaryOp::LogAnd => !a.truthy(),
                _ => a.truthy(),
            };
            if short {
                return Some((ConstValue::Int(a.truthy() as i128), CType::Bool));
            }
            let (b, _) = self.const_eval(rhs, locals)?;
            return Some((ConstValue::Int(b.truthy() as i128), CType::Bool));
        }
        let (b, b_ty) = self.const_eval(rhs, locals)?;

        // Address arithmetic.
        if let (ConstValue::Address { symbol, addend }, ConstValue::Int(n)) = (&a, &b) {
            let stride = a_ty.pointee()?.size(&self.layout).max(1) as i64;
            let delta = (*n as i64).wrapping_mul(stride);
            let addend = match op {
                BinaryOp::Add => addend.wrapping_add(delta),
                BinaryOp::Sub => addend.wrapping_sub(delta),
                _ => return None,
            };
            return Some((
                ConstValue::Address {
                    symbol: *symbol,
                    addend,
                },
                a_ty,
            ));
        }
        if !a_ty.is_arithmetic() || !b_ty.is_arithmetic() {
            return None;
        }
        if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            let (ConstValue::Int(a), ConstValue::Int(b)) = (a, b) else {
                return None;
            };
            let ty = a_ty.promoted();
            let bits = ty.size(&self.layout) as i128 * 8;
            if b < 0 || b >= bits {
                return None;
            }
            let value = match op {
                BinaryOp::Shl => a << b,
                _ => a >> b,
            };
            return Some((ConstValue::Int(self.normalize(value, &ty)), ty));
        }

        let common = CType::usual_arithmetic(&a_ty, &b_ty, &self.layout);
        let a = self.const_convert(a, &a_ty, &common)?;
        let b = self.const_convert(b, &b_ty, &common)?;
        if op.is_comparison() {
            let result = match (a, b) {
                (ConstValue::Int(x), ConstValue::Int(y)) => compare(op, x.cmp(&y)),
                (ConstValue::Float(x), ConstValue::Float(y)) => {
                    compare(op, x.partial_cmp(&y)?)
                }
                _ => return None,
            };
            return Some((ConstValue::Int(result as i128), CType::Bool));
        }
        let value = match (a, b) {
            (ConstValue::Int(x), ConstValue::Int(y)) => {
                let raw = match op {
                    BinaryOp::Add => x.wrapping_add(y),
                    BinaryOp::Sub => x.wrapping_sub(y),
                    BinaryOp::Mul => x.wrapping_mul(y),
                    BinaryOp::Div if y != 0 => x / y,
                    BinaryOp::Rem if y != 0 => x % y,
                    BinaryOp::BitAnd => x & y,
                    BinaryOp::BitOr => x | y,
                    BinaryOp::BitXor => x ^ y,
                    _ => return None,
                };
                ConstValue::Int(self.normalize(raw, &common))
            }
            (ConstValue::Float(x), ConstValue::Float(y)) => {
                let raw = match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    BinaryOp::Mul => x * y,
                    BinaryOp::Div => x / y,
                    _ => return None,
                };
                if common == CType::Float {
                    ConstValue::Float(raw as f32 as f64)
                } else {
                    ConstValue::Float(raw)
                }
            }
            _ => return None,
        };
        Some((value, common))
    }

    // ── Static typing without code generation ─────────────────────

    /// Type of an expression as `sizeof` sees it: arrays do not decay.
    pub(crate) fn type_of(&mut self, expr: &Expr, locals: Locals) -> Option<CType> {
        Some(match &expr.kind {
            ExprKind::IntLit { value, suffix } => self.int_literal_type(*value, *suffix),
            ExprKind::FloatLit { single: true, .. } => CType::Float,
            ExprKind::FloatLit { .. } => CType::Double,
            ExprKind::CharLit(_) => CType::Int(IntKind::Char),
            ExprKind::StrLit(text) => CType::Array {
                element: Box::new(CType::Int(IntKind::Char)),
                len: text.len() as u64 + 1,
            },
            ExprKind::BoolLit(_) => CType::Bool,
            ExprKind::Nullptr => CType::pointer_to(CType::Void, false),
            ExprKind::Name { path, global } => {
                if !*global && path.len() == 1 {
                    if let Some(LocalName::Variable { qt, .. }) = locals(&path[0]) {
                        return Some(qt.ty);
                    }
                }
                match self.lookup(path, *global)? {
                    Entity::Variable(var) => var.qt.ty.clone(),
                    _ => return None,
                }
            }
            ExprKind::Unary { op, operand } => {
                let ty = self.type_of(operand, locals)?;
                match op {
                    UnaryOp::Not => CType::Bool,
                    UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => ty.promoted(),
                    UnaryOp::Deref => ty.decay(false).pointee()?.clone(),
                    UnaryOp::AddrOf => CType::pointer_to(ty, false),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_comparison() || matches!(op, BinaryOp::LogAnd | BinaryOp::LogOr) {
                    return Some(CType::Bool);
                }
                let a = self.type_of(lhs, locals)?.decay(false);
                let b = self.type_of(rhs, locals)?.decay(false);
                match (a.is_pointer(), b.is_pointer()) {
                    (true, true) => self.ptrdiff_type(),
                    (true, false) => a,
                    (false, true) => b,
                    _ if matches!(op, BinaryOp::Shl | BinaryOp::Shr) => a.promoted(),
                    _ => CType::usual_arithmetic(&a, &b, &self.layout),
                }
            }
            ExprKind::Assign { target, .. } => self.type_of(target, locals)?,
            ExprKind::IncDec { operand, .. } => self.type_of(operand, locals)?,
            ExprKind::Conditional {
                then, otherwise, ..
            } => {
                let a = self.type_of(then, locals)?.decay(false);
                let b = self.type_of(otherwise, locals)?.decay(false);
                if a.is_arithmetic() && b.is_arithmetic() {
                    CType::usual_arithmetic(&a, &b, &self.layout)
                } else {
                    a
                }
            }
            ExprKind::Call { callee, args } => {
                let ExprKind::Name { path, global } = &callee.kind else {
                    return None;
                };
                let Some(Entity::Functions(set)) = self.lookup(path, *global).cloned() else {
                    return None;
                };
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args {
                    arg_types.push((self.type_of(arg, locals)?.decay(false), is_null_constant(arg)));
                }
                select_overload(&set, &arg_types).ok()?.ret
            }
            ExprKind::Index { base, .. } => {
                self.type_of(base, locals)?.decay(false).pointee()?.clone()
            }
            ExprKind::Cast { ty, .. } => self.resolve_type(ty, None, locals)?.ty,
            ExprKind::SizeofType(_) | ExprKind::SizeofExpr(_) => self.size_type(),
            ExprKind::Comma { rhs, .. } => self.type_of(rhs, locals)?,
        })
    }

    // ── Static initialization ─────────────────────────────────────

    fn init_symbol_name(&self, prefix: &str) -> String {
        let sanitized: String = self
            .module_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{prefix}{sanitized}")
    }

    fn declare_void_function(&mut self, name: &str) -> Option<usize> {
        let signature = Signature::new(self.layout.call_conv);
        let symbol = self.declare_symbol(name, SymbolKind::Function(signature), Span::default())?;
        self.define_symbol(symbol, true);
        Some(symbol)
    }

    fn lower_initializer(&mut self) -> Option<usize> {
        if self.dynamic_inits.is_empty() {
            return None;
        }
        let name = self.init_symbol_name("_GLOBAL__sub_I_");
        let symbol = self.declare_void_function(&name)?;
        let inits = std::mem::take(&mut self.dynamic_inits);
        let saved = std::mem::take(&mut self.namespaces);
        let targets: Vec<_> = inits
            .into_iter()
            .map(|init| (init.symbol, init.qt, init.init, init.namespaces))
            .collect();
        let body = function::lower_initializer(self, symbol, &targets);
        self.namespaces = saved;
        let body = body?;
        self.functions.push(body);
        Some(symbol)
    }

    fn lower_finalizer(&mut self) -> Option<usize> {
        if self.thread_locals.is_empty() {
            return None;
        }
        let name = self.init_symbol_name("_GLOBAL__sub_D_");
        let symbol = self.declare_void_function(&name)?;
        let controls = self.thread_locals.clone();
        let body = function::lower_finalizer(self, symbol, &controls)?;
        self.functions.push(body);
        Some(symbol)
    }

    pub(crate) fn pointer_type(&self) -> cranelift_codegen::ir::Type {
        self.layout.pointer_type()
    }
}

fn compare(op: BinaryOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinaryOp::Eq => ordering == Equal,
        BinaryOp::Ne => ordering != Equal,
        BinaryOp::Lt => ordering == Less,
        BinaryOp::Gt => ordering == Greater,
        BinaryOp::Le => ordering != Greater,
        BinaryOp::Ge => ordering != Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{CollectingSink, Severity};
    use crate::frontend::TLS_PREAMBLE;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn lower(source: &str) -> (Option<ModuleContents>, CollectingSink) {
        lower_file(source, "test.cpp")
    }

    /// Lowers `source` behind the emulated-TLS routines every compiled
    /// module starts with.
    fn lower_with_runtime(source: &str) -> (Option<ModuleContents>, CollectingSink) {
        lower_file(&format!("{TLS_PREAMBLE}{source}"), "tls.cpp")
    }

    fn lower_file(source: &str, path: &str) -> (Option<ModuleContents>, CollectingSink) {
        let sink = CollectingSink::new();
        let contents = {
            let mut diag = DiagnosticEngine::new(&sink);
            let file = diag.add_file(path);
            let tokens = tokenize(source, file);
            let unit = Parser::new(tokens, &mut diag).parse_translation_unit();
            let mut lowerer = ModuleLowerer::new(&mut diag, TargetLayout::host(), "test");
            lowerer.lower_items(&unit.items);
            let contents = lowerer.finish(Vec::new());
            if diag.has_failed() { None } else { Some(contents) }
        };
        (contents, sink)
    }

    fn linkage(contents: &ModuleContents, name: &str) -> Option<SymbolLinkage> {
        contents.symbol(name).map(|s| s.linkage)
    }

    #[test]
    fn linkage_of_definitions_and_declarations() {
        let (contents, sink) = lower(
            "int add1(int x) { return x + 1; }\n\
             static int helper() { return 2; }\n\
             inline int twice(int x) { return x * 2; }\n\
             extern \"C\" int puts(const char *s);\n\
             int use() { return puts(\"hi\") + helper() + twice(1); }\n",
        );
        let contents = contents.unwrap_or_else(|| panic!("{:?}", sink.snapshot()));
        assert_eq!(linkage(&contents, "_Z4add1i"), Some(SymbolLinkage::Export));
        assert_eq!(linkage(&contents, "_Z6helperv"), Some(SymbolLinkage::Local));
        assert_eq!(linkage(&contents, "_Z5twicei"), Some(SymbolLinkage::Local));
        assert_eq!(linkage(&contents, "puts"), Some(SymbolLinkage::Import));
        assert_eq!(contents.functions.len(), 4);
    }

    #[test]
    fn constant_globals_become_data() {
        let (contents, _) = lower(
            "int answer = 6 * 7;\n\
             const char *greeting = \"hello\";\n\
             int table[] = {1, 2, 3};\n\
             const int limit = sizeof(table) / sizeof(table[0]);\n\
             int copy[limit];\n",
        );
        let contents = contents.unwrap();
        let answer = contents.symbol_index("answer").unwrap();
        let data = contents.data.iter().find(|d| d.symbol == answer).unwrap();
        assert_eq!(data.contents, DataContents::Bytes(42i32.to_le_bytes().to_vec()));

        let greeting = contents.symbol_index("greeting").unwrap();
        let data = contents.data.iter().find(|d| d.symbol == greeting).unwrap();
        assert_eq!(data.relocations.len(), 1);

        let copy = contents.symbol_index("copy").unwrap();
        let data = contents.data.iter().find(|d| d.symbol == copy).unwrap();
        assert_eq!(data.contents.len(), 12);
        assert!(contents.initializer.is_none());
        assert_eq!(linkage(&contents, "limit"), Some(SymbolLinkage::Local));
    }

    #[test]
    fn dynamic_initializers_are_collected() {
        let (contents, _) = lower(
            "int seed() { return 3; }\n\
             int value = seed() + 1;\n",
        );
        let contents = contents.unwrap();
        let init = contents.initializer.unwrap();
        assert_eq!(contents.symbols[init].name, "_GLOBAL__sub_I_test");
        assert_eq!(contents.symbols[init].linkage, SymbolLinkage::Local);
    }

    #[test]
    fn constructor_and_destructor_lists() {
        let (contents, _) = lower(
            "__attribute__((constructor)) void start() {}\n\
             __attribute__((destructor)) void stop() {}\n",
        );
        let contents = contents.unwrap();
        assert_eq!(contents.constructors.len(), 1);
        assert_eq!(contents.destructors.len(), 1);
        assert_eq!(contents.symbols[contents.constructors[0]].name, "_Z5startv");
    }

    #[test]
    fn thread_locals_use_control_blocks() {
        let (contents, sink) = lower_with_runtime("thread_local int counter = 5;\n");
        let contents = contents.unwrap_or_else(|| panic!("{:?}", sink.snapshot()));
        assert_eq!(
            linkage(&contents, "__emutls_v.counter"),
            Some(SymbolLinkage::Export)
        );
        assert_eq!(
            linkage(&contents, "__emutls_t.counter"),
            Some(SymbolLinkage::Local)
        );
        assert!(contents.finalizer.is_some());
    }

    #[test]
    fn redefinition_reports_previous_location() {
        let (contents, sink) = lower("int f() { return 1; }\nint f() { return 2; }\n");
        assert!(contents.is_none());
        assert!(sink.contains(Severity::Error, "redefinition of 'f'"));
        assert!(sink.contains(Severity::Note, "previous definition is here"));
    }

    #[test]
    fn overloads_and_namespaces_mangle() {
        let (contents, _) = lower(
            "namespace math { int scale(int x) { return x; } double scale(double x) { return x; } }\n\
             extern \"C\" int entry() { return math::scale(2); }\n",
        );
        let contents = contents.unwrap();
        assert!(contents.symbol("_ZN4math5scaleEi").is_some());
        assert!(contents.symbol("_ZN4math5scaleEd").is_some());
        assert_eq!(linkage(&contents, "entry"), Some(SymbolLinkage::Export));
    }

    #[test]
    fn unknown_attribute_warns() {
        let (contents, sink) = lower("[[frobnicate]] int x = 1;\n");
        assert!(contents.is_some());
        assert!(sink.contains(Severity::Warning, "unknown attribute 'frobnicate' ignored"));
    }

    #[test]
    fn thread_local_requires_constant() {
        let (contents, sink) = lower("int f() { return 1; }\nthread_local int x = f();\n");
        assert!(contents.is_none());
        assert!(sink.contains(Severity::Error, "thread-local variable must be a constant"));
    }

    #[test]
    fn literal_types() {
        let sink = CollectingSink::new();
        let mut diag = DiagnosticEngine::new(&sink);
        let lowerer = ModuleLowerer::new(&mut diag, TargetLayout::host(), "t");
        let decimal = IntSuffix {
            decimal: true,
            ..Default::default()
        };
        assert_eq!(lowerer.int_literal_type(5, decimal), CType::INT);
        assert_eq!(
            lowerer.int_literal_type(0xffff_ffff, IntSuffix::default()),
            CType::Int(IntKind::UInt)
        );
        assert_eq!(lowerer.normalize(300, &CType::Int(IntKind::UChar)), 44);
        assert_eq!(lowerer.normalize(255, &CType::Int(IntKind::SChar)), -1);
    }
}
