/// Syntax tree produced by the parser.
///
/// The tree is purely syntactic: names are unresolved and types are
/// written the way the source spells them. Everything derives
/// `Serialize`/`Deserialize` so parsed headers can be cached.
use serde::{Deserialize, Serialize};

use crate::span::Span;
use crate::token::IntSuffix;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Item {
    Function(FunctionDecl),
    Variable(VariableDecl),
    Typedef(TypedefDecl),
    Namespace {
        name: String,
        items: Vec<Item>,
        span: Span,
    },
    /// `extern "C" { ... }` or an `extern "C"` prefixed declaration.
    CLinkage { items: Vec<Item>, span: Span },
}

// ── Types ─────────────────────────────────────────────────────────

/// Integer type keywords as combined by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntKind {
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeSpec {
    Void,
    Bool,
    Int(IntKind),
    Float,
    Double,
    /// A typedef name, possibly qualified.
    Named { path: Vec<String>, global: bool },
}

/// A type as written: specifier, pointer levels and an optional array
/// bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub spec: TypeSpec,
    pub is_const: bool,
    /// One entry per `*`; `true` when the pointer itself is `const`.
    pub pointers: Vec<bool>,
    pub array: Option<ArrayBound>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayBound {
    /// `[]`, length taken from the initializer.
    Unsized,
    Sized(Box<Expr>),
}

// ── Declarations ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageClass {
    #[default]
    None,
    Static,
    Extern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclSpecifiers {
    pub storage: StorageClass,
    pub thread_local: bool,
    pub inline: bool,
    pub constexpr: bool,
    pub attributes: Vec<Attribute>,
}

impl DeclSpecifiers {
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: Option<String>,
    pub ty: TypeExpr,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub return_type: TypeExpr,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub specifiers: DeclSpecifiers,
    pub body: Option<Block>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Initializer {
    Expr(Expr),
    List(Vec<Expr>, Span),
}

impl Initializer {
    pub fn span(&self) -> Span {
        match self {
            Initializer::Expr(expr) => expr.span,
            Initializer::List(_, span) => *span,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub specifiers: DeclSpecifiers,
    pub init: Option<Initializer>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedefDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub span: Span,
}

// ── Statements ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    Block(Block),
    Decl(Vec<VariableDecl>),
    Typedef(TypedefDecl),
    Expr(Expr),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
        span: Span,
    },
    Return(Option<Expr>, Span),
    Break(Span),
    Continue(Span),
    Empty(Span),
}

// ── Expressions ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    pub fn spelling(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit { value: u64, suffix: IntSuffix },
    FloatLit { value: f64, single: bool },
    CharLit(i64),
    StrLit(String),
    BoolLit(bool),
    Nullptr,
    Name { path: Vec<String>, global: bool },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// `target = value`, or `target op= value` when `op` is set.
    Assign { op: Option<BinaryOp>, target: Box<Expr>, value: Box<Expr> },
    IncDec { increment: bool, prefix: bool, operand: Box<Expr> },
    Conditional { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Index { base: Box<Expr>, index: Box<Expr> },
    Cast { ty: TypeExpr, operand: Box<Expr> },
    SizeofType(TypeExpr),
    SizeofExpr(Box<Expr>),
    Comma { lhs: Box<Expr>, rhs: Box<Expr> },
}

/// Render a possibly qualified name for diagnostics.
pub fn display_path(path: &[String], global: bool) -> String {
    let joined = path.join("::");
    if global { format!("::{joined}") } else { joined }
}
