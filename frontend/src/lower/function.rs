//! Lowering of function bodies to Cranelift IR.
//!
//! Every local variable lives in its own explicit stack slot, so taking an
//! address never needs special handling and no SSA construction is done
//! here. After a terminator the builder moves to a fresh block with no
//! predecessors; code lowered there is unreachable and only kept so that
//! its diagnostics are still reported.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::Imm64;
use cranelift_codegen::ir::{
    Block, ExtFuncData, ExternalName, FuncRef, Function, GlobalValue, GlobalValueData,
    InstBuilder, MemFlags, Signature, StackSlot, StackSlotData, StackSlotKind, Type,
    UserExternalName, UserFuncName, Value, types,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

use super::{
    ConstValue, Conversion, Entity, FunctionEntity, LocalName, ModuleLowerer, OverloadError,
    QualType, TLS_GET, TLS_RELEASE, implicit_conversion, is_null_constant, select_overload,
};
use crate::ast::{
    BinaryOp, Block as AstBlock, Expr, ExprKind, FunctionDecl, Initializer, IntKind,
    StorageClass, Stmt, TypeExpr, UnaryOp, VariableDecl, display_path,
};
use crate::module::{DATA_NAMESPACE, DataContents, FUNCTION_NAMESPACE, FunctionBody};
use crate::span::Span;
use crate::types::CType;

#[derive(Debug, Clone)]
enum Local {
    Slot {
        slot: StackSlot,
        qt: QualType,
        constant: Option<ConstValue>,
        span: Span,
    },
    Static {
        symbol: usize,
        qt: QualType,
        span: Span,
    },
    Typedef(QualType, Span),
}

impl Local {
    fn span(&self) -> Span {
        match self {
            Local::Slot { span, .. } | Local::Static { span, .. } | Local::Typedef(_, span) => {
                *span
            }
        }
    }
}

fn local_name(scopes: &[HashMap<String, Local>], name: &str) -> Option<LocalName> {
    let local = scopes.iter().rev().find_map(|scope| scope.get(name))?;
    Some(match local {
        Local::Slot { qt, constant, .. } => LocalName::Variable {
            qt: qt.clone(),
            constant: constant.clone(),
        },
        Local::Static { qt, .. } => LocalName::Variable {
            qt: qt.clone(),
            constant: None,
        },
        Local::Typedef(qt, _) => LocalName::Typedef(qt.clone()),
    })
}

/// A value and its type; `value` is `None` only for `void`.
#[derive(Debug, Clone)]
struct RValue {
    value: Option<Value>,
    ty: CType,
}

/// An object in memory.
#[derive(Debug, Clone)]
struct Place {
    addr: Value,
    ty: CType,
    is_const: bool,
}

#[derive(Debug, Clone, Copy)]
enum ConversionContext {
    Assign,
    Initialize,
    Return,
    Argument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaceUse {
    Assign,
    AddressOf,
    Read,
}

struct LoopTargets {
    continue_to: Block,
    break_to: Block,
    broke: bool,
}

pub(super) struct FunctionLowerer<'a, 'b, 'd, 's> {
    m: &'a mut ModuleLowerer<'d, 's>,
    b: FunctionBuilder<'b>,
    symbol: usize,
    name: String,
    ret: CType,
    ptr: Type,
    scopes: Vec<HashMap<String, Local>>,
    loops: Vec<LoopTargets>,
    func_refs: HashMap<usize, FuncRef>,
    data_refs: HashMap<usize, GlobalValue>,
    callees: Vec<usize>,
    reachable: bool,
}

// ═══════════════════════════════════════════════════════════════════
// Entry points
// ═══════════════════════════════════════════════════════════════════

/// Build one function. `body` lowers the statements and returns the span
/// of the closing brace for user functions, `None` for synthesized ones.
fn build<'d, 's>(
    m: &mut ModuleLowerer<'d, 's>,
    symbol: usize,
    name: &str,
    ret: CType,
    body: impl FnOnce(&mut FunctionLowerer<'_, '_, 'd, 's>, &[Value]) -> Option<Span>,
) -> Option<FunctionBody> {
    let signature = m.function_signature(symbol)?;
    let is_main = m.symbol_name(symbol) == "main";
    let mut func = Function::with_name_signature(
        UserFuncName::user(FUNCTION_NAMESPACE, symbol as u32),
        signature,
    );
    let mut fctx = FunctionBuilderContext::new();
    let callees = {
        let mut builder = FunctionBuilder::new(&mut func, &mut fctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let params = builder.block_params(entry).to_vec();
        let ptr = m.pointer_type();
        let mut lowerer = FunctionLowerer {
            m,
            b: builder,
            symbol,
            name: name.to_string(),
            ret,
            ptr,
            scopes: vec![HashMap::new()],
            loops: Vec::new(),
            func_refs: HashMap::new(),
            data_refs: HashMap::new(),
            callees: Vec::new(),
            reachable: true,
        };
        let end = body(&mut lowerer, &params);
        lowerer.finish(is_main, end)
    };
    Some(FunctionBody {
        symbol,
        function: func,
        callees,
    })
}

pub(super) fn lower_definition(
    m: &mut ModuleLowerer<'_, '_>,
    entity: &FunctionEntity,
    decl: &FunctionDecl,
    params: &[QualType],
    body: &AstBlock,
) -> Option<FunctionBody> {
    build(m, entity.symbol, &entity.name, entity.ret.clone(), |f, values| {
        for ((param, qt), value) in decl.params.iter().zip(params).zip(values) {
            let ty = qt.decayed();
            let slot = f.stack_slot(&ty);
            let addr = f.b.ins().stack_addr(f.ptr, slot, 0);
            f.b.ins().store(MemFlags::new(), *value, addr, 0);
            if let Some(name) = &param.name {
                f.declare_local(
                    name,
                    Local::Slot {
                        slot,
                        qt: QualType {
                            ty,
                            is_const: qt.is_const,
                        },
                        constant: None,
                        span: param.span,
                    },
                );
            }
        }
        for stmt in &body.stmts {
            if f.m.diag.is_fatal() {
                break;
            }
            f.stmt(stmt);
        }
        Some(Span::point(body.span.file, body.span.end))
    })
}

/// The module's static initializer: runs every dynamic initializer in
/// declaration order.
pub(super) fn lower_initializer(
    m: &mut ModuleLowerer<'_, '_>,
    symbol: usize,
    targets: &[(usize, QualType, Initializer, Vec<String>)],
) -> Option<FunctionBody> {
    let name = m.symbol_name(symbol).to_string();
    build(m, symbol, &name, CType::Void, |f, _| {
        for (data, qt, init, namespaces) in targets {
            f.m.namespaces = namespaces.clone();
            let addr = f.data_address(*data);
            f.initialize(addr, qt, init);
        }
        None
    })
}

/// Releases the calling thread's instance of every thread-local.
pub(super) fn lower_finalizer(
    m: &mut ModuleLowerer<'_, '_>,
    symbol: usize,
    controls: &[usize],
) -> Option<FunctionBody> {
    let name = m.symbol_name(symbol).to_string();
    build(m, symbol, &name, CType::Void, |f, _| {
        for control in controls {
            let Some(release) = f.runtime_function(TLS_RELEASE) else {
                break;
            };
            let addr = f.data_address(*control);
            let callee = f.func_ref(release.symbol, None);
            f.b.ins().call(callee, &[addr]);
        }
        None
    })
}

impl FunctionLowerer<'_, '_, '_, '_> {
    fn finish(mut self, is_main: bool, end: Option<Span>) -> Vec<usize> {
        if let Some(end) = end {
            if self.reachable && !self.ret.is_void() && !is_main {
                self.m
                    .diag
                    .warning(end, "non-void function does not return a value");
            }
        }
        // `main` falls off the end with 0.
        self.default_return();
        self.b.seal_all_blocks();
        self.b.finalize();
        self.callees
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn layout_ir(&self, ty: &CType) -> Option<Type> {
        ty.ir_type(&self.m.layout)
    }

    /// `iconst` with the immediate masked to the type's width.
    fn iconst(&mut self, ty: Type, value: i64) -> Value {
        let bits = ty.bits();
        let masked = if bits < 64 {
            value & ((1i64 << bits) - 1)
        } else {
            value
        };
        self.b.ins().iconst(ty, masked)
    }

    fn zero(&mut self, ty: Type) -> Value {
        if ty == types::F32 {
            self.b.ins().f32const(0.0)
        } else if ty == types::F64 {
            self.b.ins().f64const(0.0)
        } else {
            self.iconst(ty, 0)
        }
    }

    fn default_return(&mut self) {
        let values: Vec<Value> = match self.layout_ir(&self.ret.clone()) {
            Some(ty) => vec![self.zero(ty)],
            None => Vec::new(),
        };
        self.b.ins().return_(&values);
    }

    /// Continue in a fresh block after a terminator.
    fn after_terminator(&mut self) {
        let block = self.b.create_block();
        self.b.switch_to_block(block);
        self.reachable = false;
    }

    fn stack_slot(&mut self, ty: &CType) -> StackSlot {
        let size = ty.size(&self.m.layout).max(1) as u32;
        let align = ty.align(&self.m.layout).max(1);
        self.b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            align.trailing_zeros() as u8,
        ))
    }

    fn declare_local(&mut self, name: &str, local: Local) {
        let span = local.span();
        let scope = self.scopes.last_mut();
        let previous = scope
            .as_ref()
            .and_then(|scope| scope.get(name))
            .map(Local::span);
        if let Some(previous) = previous {
            self.m.diag.error(span, format!("redefinition of '{name}'"));
            self.m.diag.note(previous, "previous definition is here");
            return;
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), local);
        }
    }

    fn find_local(&self, name: &str) -> Option<Local> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
    }

    fn resolve_type(&mut self, ty: &TypeExpr, init: Option<&Initializer>) -> Option<QualType> {
        let scopes = &self.scopes;
        let locals = |name: &str| local_name(scopes, name);
        self.m.resolve_type(ty, init, &locals)
    }

    fn static_type(&mut self, expr: &Expr) -> Option<CType> {
        let scopes = &self.scopes;
        let locals = |name: &str| local_name(scopes, name);
        self.m.type_of(expr, &locals)
    }

    fn constant(&mut self, expr: &Expr) -> Option<(ConstValue, CType)> {
        let scopes = &self.scopes;
        let locals = |name: &str| local_name(scopes, name);
        self.m.const_eval(expr, &locals)
    }

    fn data_address(&mut self, symbol: usize) -> Value {
        let gv = match self.data_refs.get(&symbol) {
            Some(gv) => *gv,
            None => {
                let name = self
                    .b
                    .func
                    .declare_imported_user_function(UserExternalName::new(
                        DATA_NAMESPACE,
                        symbol as u32,
                    ));
                let gv = self.b.create_global_value(GlobalValueData::Symbol {
                    name: ExternalName::user(name),
                    offset: Imm64::new(0),
                    colocated: false,
                    tls: false,
                });
                self.data_refs.insert(symbol, gv);
                gv
            }
        };
        self.b.ins().symbol_value(self.ptr, gv)
    }

    /// `signature` overrides the declared one at variadic call sites.
    fn func_ref(&mut self, symbol: usize, signature: Option<Signature>) -> FuncRef {
        if !self.callees.contains(&symbol) {
            self.callees.push(symbol);
        }
        let cached = signature.is_none();
        if cached {
            if let Some(existing) = self.func_refs.get(&symbol) {
                return *existing;
            }
        }
        let signature = signature
            .or_else(|| self.m.function_signature(symbol))
            .unwrap_or_else(|| Signature::new(self.m.layout.call_conv));
        let name = self
            .b
            .func
            .declare_imported_user_function(UserExternalName::new(
                FUNCTION_NAMESPACE,
                symbol as u32,
            ));
        let signature = self.b.import_signature(signature);
        let func_ref = self.b.import_function(ExtFuncData {
            name: ExternalName::user(name),
            signature,
            colocated: false,
        });
        if cached {
            self.func_refs.insert(symbol, func_ref);
        }
        func_ref
    }

    /// A routine from the compile preamble.
    fn runtime_function(&mut self, name: &str) -> Option<FunctionEntity> {
        match self.m.lookup(&[name.to_string()], true) {
            Some(Entity::Functions(set)) => set.first().cloned(),
            _ => {
                self.m.diag.report(
                    crate::diagnostic::Severity::Error,
                    None,
                    format!("thread-local storage runtime routine '{name}' is unavailable"),
                );
                None
            }
        }
    }

    fn tls_address(&mut self, control: usize) -> Option<Value> {
        let get = self.runtime_function(TLS_GET)?;
        let addr = self.data_address(control);
        let callee = self.func_ref(get.symbol, None);
        let call = self.b.ins().call(callee, &[addr]);
        self.b.inst_results(call).first().copied()
    }

    // ═══════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => {
                self.scopes.push(HashMap::new());
                for stmt in &block.stmts {
                    if self.m.diag.is_fatal() {
                        break;
                    }
                    self.stmt(stmt);
                }
                self.scopes.pop();
            }
            Stmt::Decl(decls) => {
                for decl in decls {
                    self.local_declaration(decl);
                }
            }
            Stmt::Typedef(decl) => {
                if let Some(qt) = self.resolve_type(&decl.ty, None) {
                    self.declare_local(&decl.name, Local::Typedef(qt, decl.span));
                }
            }
            Stmt::Expr(expr) => {
                let _ = self.rvalue(expr);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
                ..
            } => self.if_stmt(cond, then, otherwise.as_deref()),
            Stmt::While { cond, body, .. } => self.while_stmt(cond, body),
            Stmt::DoWhile { body, cond, .. } => self.do_while_stmt(body, cond),
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                self.scopes.push(HashMap::new());
                if let Some(init) = init {
                    self.stmt(init);
                }
                self.for_stmt(cond.as_ref(), step.as_ref(), body);
                self.scopes.pop();
            }
            Stmt::Return(value, span) => self.return_stmt(value.as_ref(), *span),
            Stmt::Break(span) => match self.loops.last_mut() {
                Some(targets) => {
                    targets.broke = true;
                    let target = targets.break_to;
                    self.b.ins().jump(target, &[]);
                    self.after_terminator();
                }
                None => self
                    .m
                    .diag
                    .error(*span, "'break' statement not in loop statement"),
            },
            Stmt::Continue(span) => match self.loops.last() {
                Some(targets) => {
                    let target = targets.continue_to;
                    self.b.ins().jump(target, &[]);
                    self.after_terminator();
                }
                None => self
                    .m
                    .diag
                    .error(*span, "'continue' statement not in loop statement"),
            },
            Stmt::Empty(_) => {}
        }
    }

    /// A statement in its own scope, as the branches of `if` and loops.
    fn scoped_stmt(&mut self, stmt: &Stmt) {
        self.scopes.push(HashMap::new());
        self.stmt(stmt);
        self.scopes.pop();
    }

    fn if_stmt(&mut self, cond: &Expr, then: &Stmt, otherwise: Option<&Stmt>) {
        let reachable = self.reachable;
        let c = self.condition(cond);
        let then_block = self.b.create_block();
        let merge = self.b.create_block();
        let else_block = if otherwise.is_some() {
            self.b.create_block()
        } else {
            merge
        };
        self.b.ins().brif(c, then_block, &[], else_block, &[]);

        self.b.switch_to_block(then_block);
        self.b.seal_block(then_block);
        self.scoped_stmt(then);
        let then_reachable = self.reachable;
        self.b.ins().jump(merge, &[]);

        let mut else_reachable = reachable;
        if let Some(otherwise) = otherwise {
            self.b.switch_to_block(else_block);
            self.b.seal_block(else_block);
            self.reachable = reachable;
            self.scoped_stmt(otherwise);
            else_reachable = self.reachable;
            self.b.ins().jump(merge, &[]);
        }

        self.b.switch_to_block(merge);
        self.b.seal_block(merge);
        self.reachable = then_reachable || else_reachable;
    }

    /// `true` for a loop condition that is a nonzero constant.
    fn always_true(&mut self, cond: Option<&Expr>) -> bool {
        match cond {
            None => true,
            Some(expr) => matches!(
                self.constant(expr),
                Some((ConstValue::Int(v), _)) if v != 0
            ),
        }
    }

    fn loop_body(&mut self, body: &Stmt, continue_to: Block, break_to: Block) -> bool {
        self.loops.push(LoopTargets {
            continue_to,
            break_to,
            broke: false,
        });
        self.scoped_stmt(body);
        self.loops.pop().is_some_and(|targets| targets.broke)
    }

    fn while_stmt(&mut self, cond: &Expr, body: &Stmt) {
        let reachable = self.reachable;
        let infinite = self.always_true(Some(cond));
        let header = self.b.create_block();
        let body_block = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(header, &[]);

        self.b.switch_to_block(header);
        let c = self.condition(cond);
        self.b.ins().brif(c, body_block, &[], exit, &[]);

        self.b.switch_to_block(body_block);
        self.b.seal_block(body_block);
        let broke = self.loop_body(body, header, exit);
        self.b.ins().jump(header, &[]);
        self.b.seal_block(header);

        self.b.switch_to_block(exit);
        self.b.seal_block(exit);
        self.reachable = reachable && (!infinite || broke);
    }

    fn do_while_stmt(&mut self, body: &Stmt, cond: &Expr) {
        let reachable = self.reachable;
        let infinite = self.always_true(Some(cond));
        let body_block = self.b.create_block();
        let cond_block = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(body_block, &[]);

        self.b.switch_to_block(body_block);
        let broke = self.loop_body(body, cond_block, exit);
        self.b.ins().jump(cond_block, &[]);

        self.b.switch_to_block(cond_block);
        self.b.seal_block(cond_block);
        let c = self.condition(cond);
        self.b.ins().brif(c, body_block, &[], exit, &[]);
        self.b.seal_block(body_block);

        self.b.switch_to_block(exit);
        self.b.seal_block(exit);
        self.reachable = reachable && (!infinite || broke);
    }

    fn for_stmt(&mut self, cond: Option<&Expr>, step: Option<&Expr>, body: &Stmt) {
        let reachable = self.reachable;
        let infinite = self.always_true(cond);
        let header = self.b.create_block();
        let body_block = self.b.create_block();
        let step_block = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(header, &[]);

        self.b.switch_to_block(header);
        match cond {
            Some(cond) => {
                let c = self.condition(cond);
                self.b.ins().brif(c, body_block, &[], exit, &[]);
            }
            None => {
                self.b.ins().jump(body_block, &[]);
            }
        }

        self.b.switch_to_block(body_block);
        self.b.seal_block(body_block);
        let broke = self.loop_body(body, step_block, exit);
        self.b.ins().jump(step_block, &[]);

        self.b.switch_to_block(step_block);
        self.b.seal_block(step_block);
        if let Some(step) = step {
            let _ = self.rvalue(step);
        }
        self.b.ins().jump(header, &[]);
        self.b.seal_block(header);

        self.b.switch_to_block(exit);
        self.b.seal_block(exit);
        self.reachable = reachable && (!infinite || broke);
    }

    fn return_stmt(&mut self, value: Option<&Expr>, span: Span) {
        let ret = self.ret.clone();
        match (value, ret.is_void()) {
            (Some(expr), true) => {
                if let Some(rv) = self.rvalue(expr) {
                    if !rv.ty.is_void() {
                        self.m.diag.error(
                            expr.span,
                            format!("void function '{}' should not return a value", self.name),
                        );
                    }
                }
                self.b.ins().return_(&[]);
            }
            (None, true) => {
                self.b.ins().return_(&[]);
            }
            (None, false) => {
                self.m.diag.error(
                    span,
                    format!("non-void function '{}' should return a value", self.name),
                );
                self.default_return();
            }
            (Some(expr), false) => {
                let value = self
                    .rvalue(expr)
                    .and_then(|rv| self.implicit(rv, &ret, expr, ConversionContext::Return));
                match value {
                    Some(value) => {
                        self.b.ins().return_(&[value]);
                    }
                    None => self.default_return(),
                }
            }
        }
        self.after_terminator();
    }

    fn local_declaration(&mut self, decl: &VariableDecl) {
        self.m.check_attributes(&decl.specifiers);
        let Some(qt) = self.resolve_type(&decl.ty, decl.init.as_ref()) else {
            return;
        };
        if qt.ty.is_void() {
            self.m
                .diag
                .error(decl.span, "variable has incomplete type 'void'");
            return;
        }
        if decl.specifiers.thread_local {
            self.m.diag.error(
                decl.span,
                "thread_local is only supported on namespace-scope variables",
            );
            return;
        }
        match decl.specifiers.storage {
            StorageClass::Extern => {
                self.m.diag.error(
                    decl.span,
                    "'extern' declarations are only supported at namespace scope",
                );
            }
            StorageClass::Static => self.static_local(decl, qt),
            StorageClass::None => {
                let slot = self.stack_slot(&qt.ty);
                let constant = match (&decl.init, qt.is_const) {
                    (Some(Initializer::Expr(expr)), true) if qt.ty.is_scalar() => self
                        .constant(expr)
                        .and_then(|(value, from)| self.m.const_convert(value, &from, &qt.ty)),
                    _ => None,
                };
                self.declare_local(
                    &decl.name,
                    Local::Slot {
                        slot,
                        qt: qt.clone(),
                        constant,
                        span: decl.span,
                    },
                );
                if let Some(init) = &decl.init {
                    let addr = self.b.ins().stack_addr(self.ptr, slot, 0);
                    self.initialize(addr, &qt, init);
                }
            }
        }
    }

    fn static_local(&mut self, decl: &VariableDecl, qt: QualType) {
        let size = qt.ty.size(&self.m.layout) as usize;
        let align = qt.ty.align(&self.m.layout);
        let (contents, relocations) = match &decl.init {
            None => (DataContents::Zeroed(size), Vec::new()),
            Some(init) => {
                let scopes = &self.scopes;
                let locals = |name: &str| local_name(scopes, name);
                match self.m.constant_data(&qt, init, &locals) {
                    Some((bytes, relocations)) => (DataContents::Bytes(bytes), relocations),
                    None => {
                        self.m.diag.error(
                            init.span(),
                            "initializer for static local variable must be a constant expression",
                        );
                        return;
                    }
                }
            }
        };
        let symbol = self.m.static_local(
            self.symbol,
            &decl.name,
            !qt.is_const,
            contents,
            align,
            relocations,
        );
        self.declare_local(
            &decl.name,
            Local::Static {
                symbol,
                qt,
                span: decl.span,
            },
        );
    }

    /// Store an initializer into the object at `addr`.
    fn initialize(&mut self, addr: Value, qt: &QualType, init: &Initializer) {
        match (&qt.ty, init) {
            (CType::Array { element, len }, Initializer::Expr(expr)) => {
                let ExprKind::StrLit(text) = &expr.kind else {
                    self.m
                        .diag
                        .error(expr.span, "array initializer must be an initializer list");
                    return;
                };
                if !matches!(
                    **element,
                    CType::Int(IntKind::Char | IntKind::SChar | IntKind::UChar)
                ) {
                    self.m.diag.error(
                        expr.span,
                        format!(
                            "initializing an array of type '{}' from a string literal",
                            qt.ty
                        ),
                    );
                    return;
                }
                if text.len() as u64 > *len {
                    self.m
                        .diag
                        .error(expr.span, "initializer-string for char array is too long");
                    return;
                }
                self.zero_fill(addr, *len);
                for (i, byte) in text.bytes().enumerate() {
                    let v = self.iconst(types::I8, byte as i64);
                    self.b.ins().store(MemFlags::new(), v, addr, i as i32);
                }
            }
            (CType::Array { element, len }, Initializer::List(items, span)) => {
                if items.len() as u64 > *len {
                    self.m.diag.error(*span, "excess elements in array initializer");
                    return;
                }
                let size = qt.ty.size(&self.m.layout);
                self.zero_fill(addr, size);
                let stride = element.size(&self.m.layout) as i32;
                for (i, item) in items.iter().enumerate() {
                    let Some(rv) = self.rvalue(item) else {
                        continue;
                    };
                    if let Some(v) = self.implicit(rv, element, item, ConversionContext::Initialize)
                    {
                        self.b
                            .ins()
                            .store(MemFlags::new(), v, addr, stride * i as i32);
                    }
                }
            }
            (ty, Initializer::Expr(expr)) => {
                let Some(rv) = self.rvalue(expr) else {
                    return;
                };
                if let Some(v) = self.implicit(rv, ty, expr, ConversionContext::Initialize) {
                    self.b.ins().store(MemFlags::new(), v, addr, 0);
                }
            }
            (ty, Initializer::List(items, span)) => match items.as_slice() {
                [] => {
                    if let Some(ir) = self.layout_ir(ty) {
                        let zero = self.zero(ir);
                        self.b.ins().store(MemFlags::new(), zero, addr, 0);
                    }
                }
                [item] => {
                    let Some(rv) = self.rvalue(item) else {
                        return;
                    };
                    if let Some(v) = self.implicit(rv, ty, item, ConversionContext::Initialize) {
                        self.b.ins().store(MemFlags::new(), v, addr, 0);
                    }
                }
                _ => self
                    .m
                    .diag
                    .error(*span, "excess elements in scalar initializer"),
            },
        }
    }

    fn zero_fill(&mut self, addr: Value, size: u64) {
        let mut offset = 0u64;
        for (width, ty) in [(8, types::I64), (4, types::I32), (2, types::I16), (1, types::I8)] {
            if offset + width > size {
                continue;
            }
            let zero = self.iconst(ty, 0);
            while offset + width <= size {
                self.b
                    .ins()
                    .store(MemFlags::new(), zero, addr, offset as i32);
                offset += width;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Conversions
    // ═══════════════════════════════════════════════════════════════

    fn to_bool(&mut self, value: Value, ty: &CType) -> Value {
        match ty {
            CType::Bool => value,
            CType::Float => {
                let zero = self.b.ins().f32const(0.0);
                self.b.ins().fcmp(FloatCC::NotEqual, value, zero)
            }
            CType::Double => {
                let zero = self.b.ins().f64const(0.0);
                self.b.ins().fcmp(FloatCC::NotEqual, value, zero)
            }
            _ => self.b.ins().icmp_imm(IntCC::NotEqual, value, 0),
        }
    }

    /// Convert between scalar types. Callers check that the conversion is
    /// allowed.
    fn convert(&mut self, value: Value, from: &CType, to: &CType) -> Value {
        if from == to {
            return value;
        }
        let Some(to_ir) = self.layout_ir(to) else {
            return value;
        };
        let from_ir = self.b.func.dfg.value_type(value);
        if matches!(to, CType::Bool) {
            return self.to_bool(value, from);
        }
        match (from.is_floating(), to.is_floating()) {
            (true, true) => {
                if from_ir == to_ir {
                    value
                } else if to_ir == types::F64 {
                    self.b.ins().fpromote(to_ir, value)
                } else {
                    self.b.ins().fdemote(to_ir, value)
                }
            }
            (false, true) => {
                let signed = from.is_signed();
                let wide = if from_ir.bits() < 32 {
                    if signed {
                        self.b.ins().sextend(types::I32, value)
                    } else {
                        self.b.ins().uextend(types::I32, value)
                    }
                } else {
                    value
                };
                if signed {
                    self.b.ins().fcvt_from_sint(to_ir, wide)
                } else {
                    self.b.ins().fcvt_from_uint(to_ir, wide)
                }
            }
            (true, false) => {
                let wide = if to_ir.bits() < 32 { types::I32 } else { to_ir };
                let converted = if to.is_signed() {
                    self.b.ins().fcvt_to_sint_sat(wide, value)
                } else {
                    self.b.ins().fcvt_to_uint_sat(wide, value)
                };
                if wide == to_ir {
                    converted
                } else {
                    self.b.ins().ireduce(to_ir, converted)
                }
            }
            (false, false) => {
                if from_ir == to_ir {
                    value
                } else if from_ir.bits() > to_ir.bits() {
                    self.b.ins().ireduce(to_ir, value)
                } else if from.is_signed() {
                    self.b.ins().sextend(to_ir, value)
                } else {
                    self.b.ins().uextend(to_ir, value)
                }
            }
        }
    }

    /// Implicit conversion with diagnostics.
    fn implicit(
        &mut self,
        rv: RValue,
        to: &CType,
        expr: &Expr,
        context: ConversionContext,
    ) -> Option<Value> {
        let from = rv.ty.clone();
        let value = match rv.value {
            Some(value) => value,
            None => {
                self.m.diag.error(
                    expr.span,
                    format!("cannot convert 'void' to '{to}'"),
                );
                return None;
            }
        };
        match implicit_conversion(&from, to, is_null_constant(expr)) {
            Conversion::Ok => Some(self.convert(value, &from, to)),
            Conversion::DiscardsConst => {
                self.m.diag.error(
                    expr.span,
                    format!("conversion from '{from}' to '{to}' discards const qualifier"),
                );
                None
            }
            Conversion::Incompatible => {
                let message = match context {
                    ConversionContext::Assign => {
                        format!("assigning to '{to}' from incompatible type '{from}'")
                    }
                    ConversionContext::Initialize => format!(
                        "cannot initialize a variable of type '{to}' with an rvalue of type '{from}'"
                    ),
                    ConversionContext::Return => format!(
                        "cannot initialize return object of type '{to}' with an rvalue of type '{from}'"
                    ),
                    ConversionContext::Argument => format!(
                        "cannot initialize a parameter of type '{to}' with an rvalue of type '{from}'"
                    ),
                };
                self.m.diag.error(expr.span, message);
                None
            }
        }
    }

    /// Contextual conversion to `bool`; errors yield `false`.
    fn condition(&mut self, expr: &Expr) -> Value {
        match self.rvalue(expr) {
            Some(RValue {
                value: Some(value),
                ty,
            }) if ty.is_scalar() => self.to_bool(value, &ty),
            Some(rv) => {
                self.m.diag.error(
                    expr.span,
                    format!(
                        "value of type '{}' is not contextually convertible to 'bool'",
                        rv.ty
                    ),
                );
                self.iconst(types::I8, 0)
            }
            None => self.iconst(types::I8, 0),
        }
    }

    /// Lower and convert, substituting zero after an error.
    fn rvalue_as(&mut self, expr: &Expr, ty: &CType) -> Option<Value> {
        let ir = self.layout_ir(ty)?;
        let value = self.rvalue(expr).and_then(|rv| match rv.value {
            Some(value) => Some(self.convert(value, &rv.ty, ty)),
            None => None,
        });
        Some(value.unwrap_or_else(|| self.zero(ir)))
    }

    // ═══════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════

    fn int_rvalue(&mut self, value: i64, ty: CType) -> RValue {
        let ir = self.layout_ir(&ty).unwrap_or(types::I32);
        RValue {
            value: Some(self.iconst(ir, value)),
            ty,
        }
    }

    fn load(&mut self, place: Place) -> RValue {
        if let CType::Array { element, .. } = &place.ty {
            return RValue {
                value: Some(place.addr),
                ty: CType::pointer_to((**element).clone(), place.is_const),
            };
        }
        let Some(ir) = self.layout_ir(&place.ty) else {
            return RValue {
                value: None,
                ty: place.ty,
            };
        };
        let value = self.b.ins().load(ir, MemFlags::new(), place.addr, 0);
        RValue {
            value: Some(value),
            ty: place.ty,
        }
    }

    fn rvalue(&mut self, expr: &Expr) -> Option<RValue> {
        match &expr.kind {
            ExprKind::IntLit { value, suffix } => {
                let ty = self.m.int_literal_type(*value, *suffix);
                Some(self.int_rvalue(*value as i64, ty))
            }
            ExprKind::FloatLit { value, single } => Some(if *single {
                RValue {
                    value: Some(self.b.ins().f32const(*value as f32)),
                    ty: CType::Float,
                }
            } else {
                RValue {
                    value: Some(self.b.ins().f64const(*value)),
                    ty: CType::Double,
                }
            }),
            ExprKind::CharLit(v) => Some(self.int_rvalue(*v, CType::Int(IntKind::Char))),
            ExprKind::BoolLit(b) => Some(self.int_rvalue(*b as i64, CType::Bool)),
            ExprKind::Nullptr => Some(RValue {
                value: Some(self.iconst(self.ptr, 0)),
                ty: CType::pointer_to(CType::Void, false),
            }),
            ExprKind::StrLit(text) => {
                let symbol = self.m.string_symbol(text);
                Some(RValue {
                    value: Some(self.data_address(symbol)),
                    ty: CType::pointer_to(CType::Int(IntKind::Char), true),
                })
            }
            ExprKind::Name { .. } | ExprKind::Index { .. } => {
                let place = self.place(expr, PlaceUse::Read)?;
                Some(self.load(place))
            }
            ExprKind::Unary { op, operand } => self.unary(*op, operand, expr.span),
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::LogAnd | BinaryOp::LogOr => Some(self.logical(*op, lhs, rhs)),
                _ => {
                    let a = self.rvalue(lhs);
                    let b = self.rvalue(rhs);
                    self.binary_values(
                        *op,
                        a?,
                        b?,
                        is_null_constant(lhs),
                        is_null_constant(rhs),
                        expr.span,
                    )
                }
            },
            ExprKind::Assign { op, target, value } => {
                self.assign(*op, target, value, expr.span)
            }
            ExprKind::IncDec {
                increment,
                prefix,
                operand,
            } => self.inc_dec(*increment, *prefix, operand),
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => self.conditional(cond, then, otherwise, expr.span),
            ExprKind::Call { callee, args } => self.call(callee, args, expr.span),
            ExprKind::Cast { ty, operand } => self.cast(ty, operand, expr.span),
            ExprKind::SizeofType(ty) => {
                let qt = self.resolve_type(ty, None)?;
                if qt.ty.is_void() {
                    self.m.diag.error(
                        ty.span,
                        "invalid application of 'sizeof' to an incomplete type 'void'",
                    );
                    return None;
                }
                let size = qt.ty.size(&self.m.layout) as i64;
                let size_ty = self.m.size_type();
                Some(self.int_rvalue(size, size_ty))
            }
            ExprKind::SizeofExpr(operand) => {
                let Some(ty) = self.static_type(operand) else {
                    // Lower it to surface the real diagnostic.
                    let _ = self.rvalue(operand);
                    return None;
                };
                let size = ty.size(&self.m.layout) as i64;
                let size_ty = self.m.size_type();
                Some(self.int_rvalue(size, size_ty))
            }
            ExprKind::Comma { lhs, rhs } => {
                let _ = self.rvalue(lhs);
                self.rvalue(rhs)
            }
        }
    }

    fn place(&mut self, expr: &Expr, usage: PlaceUse) -> Option<Place> {
        match &expr.kind {
            ExprKind::Name { path, global } => self.name_place(path, *global, expr.span),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let rv = self.rvalue(operand)?;
                self.deref(rv, expr.span)
            }
            ExprKind::Index { base, index } => {
                let a = self.rvalue(base);
                let b = self.rvalue(index);
                let (a, b) = (a?, b?);
                let (pointer, offset) = match (a.ty.is_pointer(), b.ty.is_pointer()) {
                    (true, false) if b.ty.is_integer() => (a, b),
                    (false, true) if a.ty.is_integer() => (b, a),
                    _ => {
                        self.m
                            .diag
                            .error(expr.span, "subscripted value is not an array or pointer");
                        return None;
                    }
                };
                let element = self.pointer_add(pointer, offset, false, expr.span)?;
                self.deref(element, expr.span)
            }
            _ => {
                let message = match usage {
                    PlaceUse::Assign => "expression is not assignable".to_string(),
                    PlaceUse::AddressOf => {
                        let ty = self
                            .static_type(expr)
                            .map(|ty| ty.to_string())
                            .unwrap_or_else(|| "int".to_string());
                        format!("cannot take the address of an rvalue of type '{ty}'")
                    }
                    PlaceUse::Read => "expression does not designate an object".to_string(),
                };
                self.m.diag.error(expr.span, message);
                None
            }
        }
    }

    fn deref(&mut self, rv: RValue, span: Span) -> Option<Place> {
        match (&rv.ty, rv.value) {
            (
                CType::Pointer {
                    pointee,
                    pointee_const,
                },
                Some(addr),
            ) if !pointee.is_void() => Some(Place {
                addr,
                ty: (**pointee).clone(),
                is_const: *pointee_const,
            }),
            _ => {
                self.m.diag.error(
                    span,
                    format!("indirection requires pointer operand ('{}' invalid)", rv.ty),
                );
                None
            }
        }
    }

    fn name_place(&mut self, path: &[String], global: bool, span: Span) -> Option<Place> {
        let display = display_path(path, global);
        if !global && path.len() == 1 {
            match self.find_local(&path[0]) {
                Some(Local::Slot { slot, qt, .. }) => {
                    let addr = self.b.ins().stack_addr(self.ptr, slot, 0);
                    return Some(Place {
                        addr,
                        ty: qt.ty,
                        is_const: qt.is_const,
                    });
                }
                Some(Local::Static { symbol, qt, .. }) => {
                    let addr = self.data_address(symbol);
                    return Some(Place {
                        addr,
                        ty: qt.ty,
                        is_const: qt.is_const,
                    });
                }
                Some(Local::Typedef(..)) => {
                    self.m.diag.error(
                        span,
                        format!("unexpected type name '{display}': expected expression"),
                    );
                    return None;
                }
                None => {}
            }
        }
        match self.m.lookup(path, global).cloned() {
            Some(Entity::Variable(var)) => {
                let addr = if var.thread_local {
                    self.tls_address(var.symbol)?
                } else {
                    self.data_address(var.symbol)
                };
                Some(Place {
                    addr,
                    ty: var.qt.ty,
                    is_const: var.qt.is_const,
                })
            }
            Some(Entity::Functions(_)) => {
                self.m.diag.error(
                    span,
                    format!("function '{display}' can only be called"),
                );
                None
            }
            Some(Entity::Typedef(..)) => {
                self.m.diag.error(
                    span,
                    format!("unexpected type name '{display}': expected expression"),
                );
                None
            }
            None => {
                self.m
                    .diag
                    .error(span, format!("use of undeclared identifier '{display}'"));
                None
            }
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr, span: Span) -> Option<RValue> {
        match op {
            UnaryOp::Deref => {
                let rv = self.rvalue(operand)?;
                let place = self.deref(rv, span)?;
                Some(self.load(place))
            }
            UnaryOp::AddrOf => {
                let place = self.place(operand, PlaceUse::AddressOf)?;
                Some(RValue {
                    value: Some(place.addr),
                    ty: CType::pointer_to(place.ty, place.is_const),
                })
            }
            UnaryOp::Not => {
                let c = self.condition(operand);
                let value = self.b.ins().bxor_imm(c, 1);
                Some(RValue {
                    value: Some(value),
                    ty: CType::Bool,
                })
            }
            UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => {
                let rv = self.rvalue(operand)?;
                let valid = match op {
                    UnaryOp::BitNot => rv.ty.is_integer(),
                    _ => rv.ty.is_arithmetic(),
                };
                let Some(value) = rv.value.filter(|_| valid) else {
                    self.m.diag.error(
                        span,
                        format!("invalid argument type '{}' to unary expression", rv.ty),
                    );
                    return None;
                };
                let ty = rv.ty.promoted();
                let value = self.convert(value, &rv.ty, &ty);
                let value = match op {
                    UnaryOp::Neg if ty.is_floating() => self.b.ins().fneg(value),
                    UnaryOp::Neg => self.b.ins().ineg(value),
                    UnaryOp::BitNot => self.b.ins().bnot(value),
                    _ => value,
                };
                Some(RValue {
                    value: Some(value),
                    ty,
                })
            }
        }
    }

    fn logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> RValue {
        let left = self.condition(lhs);
        let rhs_block = self.b.create_block();
        let merge = self.b.create_block();
        let result = self.b.append_block_param(merge, types::I8);
        match op {
            BinaryOp::LogAnd => self.b.ins().brif(left, rhs_block, &[], merge, &[left]),
            _ => self.b.ins().brif(left, merge, &[left], rhs_block, &[]),
        };
        self.b.switch_to_block(rhs_block);
        self.b.seal_block(rhs_block);
        let right = self.condition(rhs);
        self.b.ins().jump(merge, &[right]);
        self.b.switch_to_block(merge);
        self.b.seal_block(merge);
        RValue {
            value: Some(result),
            ty: CType::Bool,
        }
    }

    /// `pointer ± integer`, scaled by the pointee size.
    fn pointer_add(
        &mut self,
        pointer: RValue,
        offset: RValue,
        subtract: bool,
        span: Span,
    ) -> Option<RValue> {
        let (Some(base), Some(index)) = (pointer.value, offset.value) else {
            return None;
        };
        let Some(pointee) = pointer.ty.pointee() else {
            self.m.diag.error(span, "arithmetic on a non-pointer type");
            return None;
        };
        let size = pointee.size(&self.m.layout).max(1) as i64;
        let ptrdiff = self.m.ptrdiff_type();
        let index = self.convert(index, &offset.ty, &ptrdiff);
        let index = self.convert(index, &ptrdiff, &pointer.ty);
        let stride = self.iconst(self.ptr, size);
        let scaled = self.b.ins().imul(index, stride);
        let value = if subtract {
            self.b.ins().isub(base, scaled)
        } else {
            self.b.ins().iadd(base, scaled)
        };
        Some(RValue {
            value: Some(value),
            ty: pointer.ty,
        })
    }

    fn binary_values(
        &mut self,
        op: BinaryOp,
        a: RValue,
        b: RValue,
        a_null: bool,
        b_null: bool,
        span: Span,
    ) -> Option<RValue> {
        let invalid = |this: &mut Self, a: &RValue, b: &RValue| {
            this.m.diag.error(
                span,
                format!(
                    "invalid operands to binary expression ('{}' and '{}')",
                    a.ty, b.ty
                ),
            );
            None
        };
        let (Some(x), Some(y)) = (a.value, b.value) else {
            return invalid(self, &a, &b);
        };

        // Pointer forms.
        if a.ty.is_pointer() || b.ty.is_pointer() {
            return match op {
                BinaryOp::Add if a.ty.is_pointer() && b.ty.is_integer() => {
                    self.pointer_add(a, b, false, span)
                }
                BinaryOp::Add if b.ty.is_pointer() && a.ty.is_integer() => {
                    self.pointer_add(b, a, false, span)
                }
                BinaryOp::Sub if a.ty.is_pointer() && b.ty.is_integer() => {
                    self.pointer_add(a, b, true, span)
                }
                BinaryOp::Sub if a.ty.is_pointer() && b.ty.is_pointer() => {
                    let (Some(pa), Some(pb)) = (a.ty.pointee(), b.ty.pointee()) else {
                        return invalid(self, &a, &b);
                    };
                    if pa != pb {
                        self.m.diag.error(
                            span,
                            format!(
                                "'{}' and '{}' are not pointers to compatible types",
                                a.ty, b.ty
                            ),
                        );
                        return None;
                    }
                    let size = pa.size(&self.m.layout).max(1) as i64;
                    let diff = self.b.ins().isub(x, y);
                    let stride = self.iconst(self.ptr, size);
                    let value = self.b.ins().sdiv(diff, stride);
                    let ty = self.m.ptrdiff_type();
                    let value = self.convert(value, &a.ty, &ty);
                    Some(RValue {
                        value: Some(value),
                        ty,
                    })
                }
                op if op.is_comparison() => {
                    let comparable = (a.ty.is_pointer() || a_null) && (b.ty.is_pointer() || b_null);
                    if !comparable {
                        return invalid(self, &a, &b);
                    }
                    let x = self.convert(x, &a.ty, &CType::pointer_to(CType::Void, false));
                    let y = self.convert(y, &b.ty, &CType::pointer_to(CType::Void, false));
                    let cc = int_cc(op, false);
                    Some(RValue {
                        value: Some(self.b.ins().icmp(cc, x, y)),
                        ty: CType::Bool,
                    })
                }
                _ => invalid(self, &a, &b),
            };
        }

        if !a.ty.is_arithmetic() || !b.ty.is_arithmetic() {
            return invalid(self, &a, &b);
        }
        let integer_only = matches!(
            op,
            BinaryOp::Rem
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
        );
        if integer_only && (!a.ty.is_integer() || !b.ty.is_integer()) {
            return invalid(self, &a, &b);
        }

        if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            let ty = a.ty.promoted();
            let x = self.convert(x, &a.ty, &ty);
            let y = self.convert(y, &b.ty, &ty);
            let value = match op {
                BinaryOp::Shl => self.b.ins().ishl(x, y),
                _ if ty.is_signed() => self.b.ins().sshr(x, y),
                _ => self.b.ins().ushr(x, y),
            };
            return Some(RValue {
                value: Some(value),
                ty,
            });
        }

        let common = CType::usual_arithmetic(&a.ty, &b.ty, &self.m.layout);
        let x = self.convert(x, &a.ty, &common);
        let y = self.convert(y, &b.ty, &common);
        let signed = common.is_signed();

        if op.is_comparison() {
            let value = if common.is_floating() {
                self.b.ins().fcmp(float_cc(op), x, y)
            } else {
                self.b.ins().icmp(int_cc(op, signed), x, y)
            };
            return Some(RValue {
                value: Some(value),
                ty: CType::Bool,
            });
        }

        let value = if common.is_floating() {
            match op {
                BinaryOp::Add => self.b.ins().fadd(x, y),
                BinaryOp::Sub => self.b.ins().fsub(x, y),
                BinaryOp::Mul => self.b.ins().fmul(x, y),
                BinaryOp::Div => self.b.ins().fdiv(x, y),
                _ => return invalid(self, &a, &b),
            }
        } else {
            match op {
                BinaryOp::Add => self.b.ins().iadd(x, y),
                BinaryOp::Sub => self.b.ins().isub(x, y),
                BinaryOp::Mul => self.b.ins().imul(x, y),
                BinaryOp::Div if signed => self.b.ins().sdiv(x, y),
                BinaryOp::Div => self.b.ins().udiv(x, y),
                BinaryOp::Rem if signed => self.b.ins().srem(x, y),
                BinaryOp::Rem => self.b.ins().urem(x, y),
                BinaryOp::BitAnd => self.b.ins().band(x, y),
                BinaryOp::BitOr => self.b.ins().bor(x, y),
                BinaryOp::BitXor => self.b.ins().bxor(x, y),
                _ => return invalid(self, &a, &b),
            }
        };
        Some(RValue {
            value: Some(value),
            ty: common,
        })
    }

    fn writable_place(&mut self, target: &Expr) -> Option<Place> {
        let place = self.place(target, PlaceUse::Assign)?;
        if place.is_const {
            let message = match &target.kind {
                ExprKind::Name { path, global } => format!(
                    "cannot assign to variable '{}' with const-qualified type 'const {}'",
                    display_path(path, *global),
                    place.ty
                ),
                _ => "read-only variable is not assignable".to_string(),
            };
            self.m.diag.error(target.span, message);
            return None;
        }
        if matches!(place.ty, CType::Array { .. }) {
            self.m.diag.error(
                target.span,
                format!("array type '{}' is not assignable", place.ty),
            );
            return None;
        }
        Some(place)
    }

    fn assign(
        &mut self,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> Option<RValue> {
        let place = self.writable_place(target);
        let rhs = self.rvalue(value);
        let (place, rhs) = (place?, rhs?);
        let stored = match op {
            None => self.implicit(rhs, &place.ty, value, ConversionContext::Assign)?,
            Some(op) => {
                let current = self.load(place.clone());
                let result = self.binary_values(op, current, rhs, false, is_null_constant(value), span)?;
                if implicit_conversion(&result.ty, &place.ty, false) != Conversion::Ok {
                    self.m.diag.error(
                        span,
                        format!(
                            "assigning to '{}' from incompatible type '{}'",
                            place.ty, result.ty
                        ),
                    );
                    return None;
                }
                let raw = result.value?;
                self.convert(raw, &result.ty, &place.ty)
            }
        };
        self.b.ins().store(MemFlags::new(), stored, place.addr, 0);
        Some(RValue {
            value: Some(stored),
            ty: place.ty,
        })
    }

    fn inc_dec(&mut self, increment: bool, prefix: bool, operand: &Expr) -> Option<RValue> {
        let place = self.writable_place(operand)?;
        let old = self.load(place.clone());
        let old_value = old.value?;
        let ty = place.ty.clone();
        let new_value = match &ty {
            CType::Pointer { pointee, .. } => {
                let size = pointee.size(&self.m.layout).max(1) as i64;
                let delta = self.iconst(self.ptr, size);
                if increment {
                    self.b.ins().iadd(old_value, delta)
                } else {
                    self.b.ins().isub(old_value, delta)
                }
            }
            CType::Float | CType::Double => {
                let one = if ty == CType::Float {
                    self.b.ins().f32const(1.0)
                } else {
                    self.b.ins().f64const(1.0)
                };
                if increment {
                    self.b.ins().fadd(old_value, one)
                } else {
                    self.b.ins().fsub(old_value, one)
                }
            }
            CType::Bool => {
                if !increment {
                    self.m.diag.error(
                        operand.span,
                        "cannot decrement expression of type bool",
                    );
                    return None;
                }
                self.iconst(types::I8, 1)
            }
            CType::Int(_) => {
                let ir = self.b.func.dfg.value_type(old_value);
                let one = self.iconst(ir, 1);
                if increment {
                    self.b.ins().iadd(old_value, one)
                } else {
                    self.b.ins().isub(old_value, one)
                }
            }
            other => {
                self.m.diag.error(
                    operand.span,
                    format!("cannot increment value of type '{other}'"),
                );
                return None;
            }
        };
        self.b
            .ins()
            .store(MemFlags::new(), new_value, place.addr, 0);
        Some(RValue {
            value: Some(if prefix { new_value } else { old_value }),
            ty,
        })
    }

    fn conditional(
        &mut self,
        cond: &Expr,
        then: &Expr,
        otherwise: &Expr,
        span: Span,
    ) -> Option<RValue> {
        let then_ty = self.static_type(then).map(|ty| ty.decay(false));
        let else_ty = self.static_type(otherwise).map(|ty| ty.decay(false));
        let (Some(then_ty), Some(else_ty)) = (then_ty, else_ty) else {
            let _ = self.rvalue(then);
            let _ = self.rvalue(otherwise);
            return None;
        };
        let result_ty = if then_ty.is_arithmetic() && else_ty.is_arithmetic() {
            CType::usual_arithmetic(&then_ty, &else_ty, &self.m.layout)
        } else if then_ty == else_ty {
            then_ty.clone()
        } else if then_ty.is_pointer() && is_null_constant(otherwise) {
            then_ty.clone()
        } else if else_ty.is_pointer() && is_null_constant(then) {
            else_ty.clone()
        } else if then_ty.is_pointer()
            && else_ty.is_pointer()
            && then_ty.pointee().map(strip_void) == else_ty.pointee().map(strip_void)
        {
            then_ty.clone()
        } else {
            self.m.diag.error(
                span,
                format!("incompatible operand types ('{then_ty}' and '{else_ty}')"),
            );
            return None;
        };

        let c = self.condition(cond);
        let then_block = self.b.create_block();
        let else_block = self.b.create_block();
        let merge = self.b.create_block();
        let ir = self.layout_ir(&result_ty);
        let result = ir.map(|ir| self.b.append_block_param(merge, ir));
        self.b.ins().brif(c, then_block, &[], else_block, &[]);

        for (block, arm) in [(then_block, then), (else_block, otherwise)] {
            self.b.switch_to_block(block);
            self.b.seal_block(block);
            match self.rvalue_as(arm, &result_ty) {
                Some(value) => self.b.ins().jump(merge, &[value]),
                None => {
                    let _ = self.rvalue(arm);
                    self.b.ins().jump(merge, &[])
                }
            };
        }

        self.b.switch_to_block(merge);
        self.b.seal_block(merge);
        Some(RValue {
            value: result,
            ty: result_ty,
        })
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> Option<RValue> {
        let ExprKind::Name { path, global } = &callee.kind else {
            self.m.diag.error(
                callee.span,
                "called object type is not a function or function pointer",
            );
            return None;
        };
        let display = display_path(path, *global);
        if !*global && path.len() == 1 {
            if let Some(local) = self.find_local(&path[0]) {
                let ty = match local {
                    Local::Slot { qt, .. } | Local::Static { qt, .. } => qt.ty.to_string(),
                    Local::Typedef(qt, _) => qt.ty.to_string(),
                };
                self.m.diag.error(
                    callee.span,
                    format!("called object type '{ty}' is not a function or function pointer"),
                );
                return None;
            }
        }
        let candidates = match self.m.lookup(path, *global).cloned() {
            Some(Entity::Functions(set)) => set,
            Some(_) => {
                self.m.diag.error(
                    callee.span,
                    format!("called object '{display}' is not a function"),
                );
                return None;
            }
            None => {
                self.m.diag.error(
                    callee.span,
                    format!("use of undeclared identifier '{display}'"),
                );
                return None;
            }
        };

        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(self.rvalue(arg));
        }
        let lowered: Option<Vec<RValue>> = lowered.into_iter().collect();
        let lowered = lowered?;
        let arg_types: Vec<(CType, bool)> = lowered
            .iter()
            .zip(args)
            .map(|(rv, arg)| (rv.ty.clone(), is_null_constant(arg)))
            .collect();

        let function = match select_overload(&candidates, &arg_types) {
            Ok(function) => function,
            Err(OverloadError::ArgumentCount { expected, variadic }) => {
                let few = args.len() < expected;
                let message = format!(
                    "too {} arguments to function call, expected {}{expected}, have {}",
                    if few { "few" } else { "many" },
                    if variadic { "at least " } else { "" },
                    args.len()
                );
                self.m.diag.error(span, message);
                let declared = candidates[0].declared;
                self.m
                    .diag
                    .note(declared, format!("'{}' declared here", candidates[0].name));
                return None;
            }
            Err(OverloadError::NoViable) => {
                self.m
                    .diag
                    .error(span, format!("no matching function for call to '{display}'"));
                for candidate in &candidates {
                    self.m
                        .diag
                        .note(candidate.declared, "candidate function not viable");
                }
                return None;
            }
            Err(OverloadError::Ambiguous) => {
                self.m
                    .diag
                    .error(span, format!("call to '{display}' is ambiguous"));
                return None;
            }
        };

        let mut values = Vec::with_capacity(lowered.len());
        let mut extra = Vec::new();
        for (i, (rv, arg)) in lowered.into_iter().zip(args).enumerate() {
            if let Some(param) = function.params.get(i) {
                values.push(self.implicit(rv, param, arg, ConversionContext::Argument)?);
                continue;
            }
            // Default argument promotions.
            let promoted = match &rv.ty {
                CType::Float => CType::Double,
                ty if ty.is_integer() => ty.promoted(),
                ty => ty.clone(),
            };
            let Some(value) = rv.value else {
                self.m
                    .diag
                    .error(arg.span, "cannot pass expression of type 'void' to variadic function");
                return None;
            };
            values.push(self.convert(value, &rv.ty, &promoted));
            extra.push(promoted);
        }

        let signature = if function.variadic {
            let mut params = function.params.clone();
            params.extend(extra);
            Some(self.m.signature(&function.ret, &params))
        } else {
            None
        };
        let callee = self.func_ref(function.symbol, signature);
        let call = self.b.ins().call(callee, &values);
        let value = self.b.inst_results(call).first().copied();
        Some(RValue {
            value,
            ty: function.ret,
        })
    }

    fn cast(&mut self, ty: &TypeExpr, operand: &Expr, span: Span) -> Option<RValue> {
        let target = self.resolve_type(ty, None)?;
        let rv = self.rvalue(operand)?;
        if target.ty.is_void() {
            return Some(RValue {
                value: None,
                ty: CType::Void,
            });
        }
        let allowed = match (&rv.ty, &target.ty) {
            (from, to) if from.is_arithmetic() && to.is_arithmetic() => true,
            (from, to) if from.is_pointer() && (to.is_pointer() || to.is_integer()) => true,
            (from, to) if from.is_integer() && to.is_pointer() => true,
            _ => false,
        };
        let Some(value) = rv.value.filter(|_| allowed) else {
            self.m.diag.error(
                span,
                format!("cannot cast from '{}' to '{}'", rv.ty, target.ty),
            );
            return None;
        };
        let value = self.convert(value, &rv.ty, &target.ty);
        Some(RValue {
            value: Some(value),
            ty: target.ty,
        })
    }
}

/// `void` pointees compare equal to anything.
fn strip_void(ty: &CType) -> Option<&CType> {
    if ty.is_void() { None } else { Some(ty) }
}

fn int_cc(op: BinaryOp, signed: bool) -> IntCC {
    match (op, signed) {
        (BinaryOp::Eq, _) => IntCC::Equal,
        (BinaryOp::Ne, _) => IntCC::NotEqual,
        (BinaryOp::Lt, true) => IntCC::SignedLessThan,
        (BinaryOp::Lt, false) => IntCC::UnsignedLessThan,
        (BinaryOp::Gt, true) => IntCC::SignedGreaterThan,
        (BinaryOp::Gt, false) => IntCC::UnsignedGreaterThan,
        (BinaryOp::Le, true) => IntCC::SignedLessThanOrEqual,
        (BinaryOp::Le, false) => IntCC::UnsignedLessThanOrEqual,
        (BinaryOp::Ge, true) => IntCC::SignedGreaterThanOrEqual,
        (_, _) => IntCC::UnsignedGreaterThanOrEqual,
    }
}

fn float_cc(op: BinaryOp) -> FloatCC {
    match op {
        BinaryOp::Eq => FloatCC::Equal,
        BinaryOp::Ne => FloatCC::NotEqual,
        BinaryOp::Lt => FloatCC::LessThan,
        BinaryOp::Gt => FloatCC::GreaterThan,
        BinaryOp::Le => FloatCC::LessThanOrEqual,
        _ => FloatCC::GreaterThanOrEqual,
    }
}

#[cfg(test)]
mod tests {
    use crate::diagnostic::{CollectingSink, DiagnosticEngine, Severity};
    use crate::lexer::tokenize;
    use crate::lower::ModuleLowerer;
    use crate::module::ModuleContents;
    use crate::parser::Parser;
    use crate::types::TargetLayout;

    fn lower(source: &str) -> (Option<ModuleContents>, CollectingSink) {
        let sink = CollectingSink::new();
        let contents = {
            let mut diag = DiagnosticEngine::new(&sink);
            let file = diag.add_file("body.cpp");
            let unit = Parser::new(tokenize(source, file), &mut diag).parse_translation_unit();
            let mut lowerer = ModuleLowerer::new(&mut diag, TargetLayout::host(), "body");
            lowerer.lower_items(&unit.items);
            let contents = lowerer.finish(Vec::new());
            if diag.has_failed() { None } else { Some(contents) }
        };
        (contents, sink)
    }

    fn errors(source: &str) -> CollectingSink {
        let (contents, sink) = lower(source);
        assert!(contents.is_none(), "expected errors for {source:?}");
        sink
    }

    #[test]
    fn control_flow_lowers() {
        let (contents, sink) = lower(
            "int sum(int n) {\n\
               int total = 0;\n\
               for (int i = 0; i < n; ++i) { if (i % 2) continue; total += i; }\n\
               while (total > 100) total -= 100;\n\
               do { total++; } while (false);\n\
               return total > 0 && n != 3 ? total : -1;\n\
             }\n",
        );
        assert!(contents.is_some(), "{:?}", sink.snapshot());
        assert_eq!(sink.count(Severity::Warning), 0);
    }

    #[test]
    fn pointers_and_arrays() {
        let (contents, sink) = lower(
            "long span(const int *a, const int *b) { return b - a; }\n\
             int third(int *p) { return *(p + 2) + p[1]; }\n\
             int local() { int xs[4] = {1, 2}; char name[] = \"abc\"; return xs[1] + name[0] + (int)sizeof(name); }\n",
        );
        assert!(contents.is_some(), "{:?}", sink.snapshot());
    }

    #[test]
    fn calls_record_callees() {
        let (contents, _) = lower(
            "extern \"C\" int printf(const char *fmt, ...);\n\
             int twice(int x) { return x * 2; }\n\
             int main() { printf(\"%d %f\\n\", twice(2), 1.5f); }\n",
        );
        let contents = contents.unwrap();
        let main = contents.symbol_index("main").unwrap();
        let body = contents.function(main).unwrap();
        assert_eq!(body.callees.len(), 2);
    }

    #[test]
    fn missing_return_warns() {
        let (contents, sink) = lower("int f(int x) { if (x) return 1; }\n");
        assert!(contents.is_some());
        assert!(sink.contains(Severity::Warning, "non-void function does not return a value"));
        let (_, sink) = lower("int g() { while (true) { return 1; } }\n");
        assert_eq!(sink.count(Severity::Warning), 0);
    }

    #[test]
    fn undeclared_identifier() {
        let sink = errors("int f() { return missing + 1; }\n");
        assert!(sink.contains(Severity::Error, "use of undeclared identifier 'missing'"));
    }

    #[test]
    fn type_mismatch() {
        let sink = errors("int f() { int *p = 1.5; return 0; }\n");
        assert!(sink.contains(
            Severity::Error,
            "cannot initialize a variable of type 'int *' with an rvalue of type 'double'"
        ));
    }

    #[test]
    fn wrong_argument_count() {
        let sink = errors("int add(int a, int b) { return a + b; }\nint f() { return add(1); }\n");
        assert!(sink.contains(
            Severity::Error,
            "too few arguments to function call, expected 2, have 1"
        ));
        assert!(sink.contains(Severity::Note, "'add' declared here"));
    }

    #[test]
    fn assignment_to_const() {
        let sink = errors("int f() { const int x = 1; x = 2; return x; }\n");
        assert!(sink.contains(Severity::Error, "cannot assign to variable 'x'"));
    }

    #[test]
    fn local_redefinition() {
        let sink = errors("int f() { int x = 1; int x = 2; return x; }\n");
        assert!(sink.contains(Severity::Error, "redefinition of 'x'"));
        assert!(sink.contains(Severity::Note, "previous definition is here"));
    }

    #[test]
    fn break_outside_loop() {
        let sink = errors("void f() { break; }\n");
        assert!(sink.contains(Severity::Error, "'break' statement not in loop statement"));
    }
}
