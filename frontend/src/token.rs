/// Token types produced by the lexer and consumed by the preprocessor and
/// parser.
use serde::{Deserialize, Serialize};

use crate::span::Span;

/// Reserved words of the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Keyword {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Signed,
    Unsigned,
    Float,
    Double,
    Const,
    Volatile,
    Static,
    Extern,
    Inline,
    Constexpr,
    ThreadLocal,
    Typedef,
    Namespace,
    If,
    Else,
    While,
    Do,
    For,
    Return,
    Break,
    Continue,
    Sizeof,
    True,
    False,
    Nullptr,
    Noexcept,
    /// `__attribute__`
    Attribute,
}

impl Keyword {
    pub fn from_word(word: &str) -> Option<Keyword> {
        Some(match word {
            "void" => Keyword::Void,
            "bool" => Keyword::Bool,
            "char" => Keyword::Char,
            "short" => Keyword::Short,
            "int" => Keyword::Int,
            "long" => Keyword::Long,
            "signed" => Keyword::Signed,
            "unsigned" => Keyword::Unsigned,
            "float" => Keyword::Float,
            "double" => Keyword::Double,
            "const" => Keyword::Const,
            "volatile" => Keyword::Volatile,
            "static" => Keyword::Static,
            "extern" => Keyword::Extern,
            "inline" | "__inline" => Keyword::Inline,
            "constexpr" => Keyword::Constexpr,
            "thread_local" | "_Thread_local" => Keyword::ThreadLocal,
            "typedef" => Keyword::Typedef,
            "namespace" => Keyword::Namespace,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "do" => Keyword::Do,
            "for" => Keyword::For,
            "return" => Keyword::Return,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "sizeof" => Keyword::Sizeof,
            "true" => Keyword::True,
            "false" => Keyword::False,
            "nullptr" => Keyword::Nullptr,
            "noexcept" => Keyword::Noexcept,
            "__attribute__" => Keyword::Attribute,
            _ => return None,
        })
    }

    /// Keywords that may begin a type.
    pub fn starts_type(self) -> bool {
        matches!(
            self,
            Keyword::Void
                | Keyword::Bool
                | Keyword::Char
                | Keyword::Short
                | Keyword::Int
                | Keyword::Long
                | Keyword::Signed
                | Keyword::Unsigned
                | Keyword::Float
                | Keyword::Double
                | Keyword::Const
                | Keyword::Volatile
        )
    }
}

/// Punctuators, longest spelling first when lexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Colon,
    ColonColon,
    Question,
    Dot,
    Arrow,
    Ellipsis,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Assign,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AmpAmp,
    PipePipe,
    Shl,
    Shr,
    PlusPlus,
    MinusMinus,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    /// `#`, only meaningful to the preprocessor.
    Hash,
    /// `##`, token pasting inside macro bodies.
    HashHash,
}

impl Punct {
    /// Every punctuator with its spelling, longest first.
    pub const TABLE: &'static [(&'static str, Punct)] = &[
        ("<<=", Punct::ShlAssign),
        (">>=", Punct::ShrAssign),
        ("...", Punct::Ellipsis),
        ("::", Punct::ColonColon),
        ("->", Punct::Arrow),
        ("<=", Punct::Le),
        (">=", Punct::Ge),
        ("==", Punct::EqEq),
        ("!=", Punct::Ne),
        ("&&", Punct::AmpAmp),
        ("||", Punct::PipePipe),
        ("<<", Punct::Shl),
        (">>", Punct::Shr),
        ("++", Punct::PlusPlus),
        ("--", Punct::MinusMinus),
        ("+=", Punct::PlusAssign),
        ("-=", Punct::MinusAssign),
        ("*=", Punct::StarAssign),
        ("/=", Punct::SlashAssign),
        ("%=", Punct::PercentAssign),
        ("&=", Punct::AmpAssign),
        ("|=", Punct::PipeAssign),
        ("^=", Punct::CaretAssign),
        ("##", Punct::HashHash),
        ("(", Punct::LParen),
        (")", Punct::RParen),
        ("{", Punct::LBrace),
        ("}", Punct::RBrace),
        ("[", Punct::LBracket),
        ("]", Punct::RBracket),
        (";", Punct::Semicolon),
        (",", Punct::Comma),
        (":", Punct::Colon),
        ("?", Punct::Question),
        (".", Punct::Dot),
        ("+", Punct::Plus),
        ("-", Punct::Minus),
        ("*", Punct::Star),
        ("/", Punct::Slash),
        ("%", Punct::Percent),
        ("&", Punct::Amp),
        ("|", Punct::Pipe),
        ("^", Punct::Caret),
        ("~", Punct::Tilde),
        ("!", Punct::Bang),
        ("=", Punct::Assign),
        ("<", Punct::Lt),
        (">", Punct::Gt),
        ("#", Punct::Hash),
    ];

    pub fn spelling(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, p)| *p == self)
            .map(|(s, _)| *s)
            .unwrap_or("?")
    }
}

/// Suffix flags of an integer literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntSuffix {
    pub unsigned: bool,
    /// Number of `l`/`L` letters (0, 1 or 2).
    pub longs: u8,
    /// Written in decimal; affects which types a large value may take.
    pub decimal: bool,
}

/// The kind of a lexical token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    /// Identifier that is not a keyword, e.g. `counter`, `_Z3foo`.
    Identifier(String),
    Keyword(Keyword),
    /// Integer literal, e.g. `42`, `0x2aull`.
    Integer { value: u64, suffix: IntSuffix },
    /// Floating literal; `single` for an `f` suffix.
    Float { value: f64, single: bool },
    /// Character literal, already decoded.
    Char(i64),
    /// String literal contents with escapes decoded.
    String(String),
    /// `<path>` in an `#include` directive.
    HeaderName(String),
    Punct(Punct),
    /// End of input.
    Eof,
    /// An unrecognized character or malformed token.
    Error(String),
}

impl TokenKind {
    /// Human-readable name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::Identifier(_) => "identifier",
            TokenKind::Keyword(_) => "keyword",
            TokenKind::Integer { .. } => "integer literal",
            TokenKind::Float { .. } => "floating literal",
            TokenKind::Char(_) => "character literal",
            TokenKind::String(_) => "string literal",
            TokenKind::HeaderName(_) => "header name",
            TokenKind::Punct(_) => "punctuator",
            TokenKind::Eof => "end of file",
            TokenKind::Error(_) => "invalid token",
        }
    }

    pub fn is_punct(&self, punct: Punct) -> bool {
        matches!(self, TokenKind::Punct(p) if *p == punct)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        matches!(self, TokenKind::Keyword(k) if *k == keyword)
    }
}

/// A single lexical token with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Raw source text of the token.
    pub lexeme: String,
    /// First token on its line; `#` only starts a directive here.
    pub line_start: bool,
    /// Whitespace precedes the token.
    pub leading_space: bool,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, lexeme: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            lexeme: lexeme.into(),
            line_start: false,
            leading_space: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    pub fn is_punct(&self, punct: Punct) -> bool {
        self.kind.is_punct(punct)
    }

    /// The word for identifiers and keywords, as the preprocessor sees them.
    pub fn word(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Identifier(name) => Some(name),
            TokenKind::Keyword(_) => Some(&self.lexeme),
            _ => None,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TokenKind::Eof => f.write_str("end of file"),
            _ => f.write_str(&self.lexeme),
        }
    }
}
