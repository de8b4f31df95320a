//! Recursive-descent parser over preprocessed tokens.
//!
//! Errors are reported to the diagnostic engine as they are found and the
//! parser resynchronizes at the next `;` or closing brace, so one compile
//! can report several independent mistakes.

use std::collections::HashSet;

use crate::ast::*;
use crate::diagnostic::DiagnosticEngine;
use crate::span::Span;
use crate::token::{Keyword, Punct, Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    /// Secondary location, e.g. the brace an unclosed block started at.
    pub note: Option<(Span, String)>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            note: None,
        }
    }

    fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.note = Some((span, message.into()));
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl std::error::Error for ParseError {}

type PResult<T> = Result<T, ParseError>;

pub struct Parser<'d, 's> {
    tokens: Vec<Token>,
    pos: usize,
    typedefs: HashSet<String>,
    diag: &'d mut DiagnosticEngine<'s>,
}

impl<'d, 's> Parser<'d, 's> {
    /// `tokens` must end with `Eof`.
    pub fn new(tokens: Vec<Token>, diag: &'d mut DiagnosticEngine<'s>) -> Self {
        Self {
            tokens,
            pos: 0,
            typedefs: HashSet::new(),
            diag,
        }
    }

    /// Make `name` parse as a type, e.g. for typedefs from a cached header.
    pub fn declare_typedef(&mut self, name: &str) {
        self.typedefs.insert(name.to_string());
    }

    pub fn parse_translation_unit(&mut self) -> TranslationUnit {
        let mut items = Vec::new();
        while !self.peek().is_eof() && !self.diag.is_fatal() {
            if self.peek().is_punct(Punct::RBrace) {
                let span = self.advance().span;
                self.diag.error(span, "extraneous closing brace ('}')");
                continue;
            }
            if let Err(err) = self.parse_item(&mut items) {
                self.report(err);
                self.recover();
            }
        }
        TranslationUnit { items }
    }

    fn report(&mut self, err: ParseError) {
        self.diag.error(err.span, err.message);
        if let Some((span, message)) = err.note {
            self.diag.note(span, message);
        }
    }

    /// Skip to just past the next `;` or balanced `}` at the current depth.
    fn recover(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.peek();
            if token.is_eof() {
                return;
            }
            if token.is_punct(Punct::LBrace) {
                depth += 1;
            } else if token.is_punct(Punct::RBrace) {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                if depth == 0 {
                    self.advance();
                    return;
                }
            } else if token.is_punct(Punct::Semicolon) && depth == 0 {
                self.advance();
                return;
            }
            self.advance();
        }
    }

    // ── Token access ──────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Token {
        let index = (self.pos + n).min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !token.is_eof() {
            self.pos += 1;
        }
        token
    }

    fn previous_span(&self) -> Span {
        if self.pos == 0 {
            self.peek().span
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn check(&self, punct: Punct) -> bool {
        self.peek().is_punct(punct)
    }

    fn eat(&mut self, punct: Punct) -> bool {
        if self.check(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.peek().kind.is_keyword(keyword)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: Punct, context: &str) -> PResult<Token> {
        if self.check(punct) {
            return Ok(self.advance());
        }
        let found = self.peek();
        let message = if context.is_empty() {
            format!("expected '{}'", punct.spelling())
        } else {
            format!("expected '{}' {context}", punct.spelling())
        };
        let span = if found.is_eof() || found.line_start {
            Span::point(self.previous_span().file, self.previous_span().end)
        } else {
            found.span
        };
        Err(ParseError::new(message, span))
    }

    fn expect_identifier(&mut self, what: &str) -> PResult<(String, Span)> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok((name, token.span))
            }
            _ => Err(ParseError::new(
                format!("expected {what}, found {}", describe(&token)),
                token.span,
            )),
        }
    }

    // ── Items ─────────────────────────────────────────────────────

    fn parse_item(&mut self, items: &mut Vec<Item>) -> PResult<()> {
        if self.eat(Punct::Semicolon) {
            return Ok(());
        }
        if self.check_keyword(Keyword::Namespace) {
            let start = self.advance().span;
            let (name, _) = self.expect_identifier("namespace name")?;
            let open = self.expect(Punct::LBrace, "after namespace name")?;
            let inner = self.parse_item_list(open.span)?;
            items.push(Item::Namespace {
                name,
                items: inner,
                span: start.merge(self.previous_span()),
            });
            return Ok(());
        }
        if self.check_keyword(Keyword::Extern) {
            if let TokenKind::String(language) = &self.peek_at(1).kind {
                let language = language.clone();
                let start = self.advance().span;
                let lang_span = self.advance().span;
                let inner = if self.check(Punct::LBrace) {
                    let open = self.advance();
                    self.parse_item_list(open.span)?
                } else {
                    let mut single = Vec::new();
                    self.parse_item(&mut single)?;
                    single
                };
                match language.as_str() {
                    "C" => items.push(Item::CLinkage {
                        items: inner,
                        span: start.merge(self.previous_span()),
                    }),
                    "C++" => items.extend(inner),
                    other => {
                        return Err(ParseError::new(
                            format!("unknown linkage language '{other}'"),
                            lang_span,
                        ));
                    }
                }
                return Ok(());
            }
        }
        if self.check_keyword(Keyword::Typedef) {
            let decls = self.parse_typedef()?;
            items.extend(decls.into_iter().map(Item::Typedef));
            return Ok(());
        }
        self.parse_declaration(items)
    }

    /// Items up to the `}` matching `open`.
    fn parse_item_list(&mut self, open: Span) -> PResult<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            if self.eat(Punct::RBrace) {
                return Ok(items);
            }
            if self.peek().is_eof() {
                return Err(ParseError::new("expected '}'", self.peek().span)
                    .with_note(open, "to match this '{'"));
            }
            if self.diag.is_fatal() {
                return Ok(items);
            }
            if let Err(err) = self.parse_item(&mut items) {
                self.report(err);
                self.recover();
            }
        }
    }

    fn parse_typedef(&mut self) -> PResult<Vec<TypedefDecl>> {
        let start = self.advance().span;
        let (_, base) = self.parse_specifiers(false)?;
        let mut decls = Vec::new();
        loop {
            let (name, ty, name_span) = self.parse_declarator_type(&base)?;
            let Some(name) = name else {
                return Err(ParseError::new("typedef requires a name", name_span));
            };
            self.typedefs.insert(name.clone());
            decls.push(TypedefDecl {
                name,
                ty,
                span: start.merge(name_span),
            });
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::Semicolon, "after typedef")?;
        Ok(decls)
    }

    fn parse_declaration(&mut self, items: &mut Vec<Item>) -> PResult<()> {
        let start = self.peek().span;
        let (specifiers, base) = self.parse_specifiers(true)?;
        let mut first = true;
        loop {
            let pointers = self.parse_pointers();
            let (name, name_span) = self.expect_identifier("identifier")?;
            if self.check(Punct::LParen) {
                let mut function = self.parse_function_rest(
                    name,
                    TypeExpr {
                        pointers,
                        ..base.clone()
                    },
                    specifiers.clone(),
                    start,
                )?;
                if first && self.check(Punct::LBrace) {
                    let body = self.parse_block()?;
                    function.span = start.merge(name_span);
                    function.body = Some(body);
                    items.push(Item::Function(function));
                    return Ok(());
                }
                function.span = start.merge(name_span);
                items.push(Item::Function(function));
            } else {
                let ty = self.parse_array_suffix(TypeExpr {
                    pointers,
                    ..base.clone()
                })?;
                let init = self.parse_initializer()?;
                items.push(Item::Variable(VariableDecl {
                    name,
                    ty,
                    specifiers: specifiers.clone(),
                    init,
                    span: name_span,
                }));
            }
            first = false;
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::Semicolon, "after top level declarator")?;
        Ok(())
    }

    fn parse_function_rest(
        &mut self,
        name: String,
        return_type: TypeExpr,
        mut specifiers: DeclSpecifiers,
        start: Span,
    ) -> PResult<FunctionDecl> {
        self.expect(Punct::LParen, "")?;
        let mut params = Vec::new();
        let mut variadic = false;
        let only_void = self.check_keyword(Keyword::Void) && self.peek_at(1).is_punct(Punct::RParen);
        if only_void {
            self.advance();
        }
        if !self.check(Punct::RParen) {
            loop {
                if self.eat(Punct::Ellipsis) {
                    variadic = true;
                    break;
                }
                let param_start = self.peek().span;
                let (_, base) = self.parse_specifiers(false)?;
                let (param_name, ty, end) = self.parse_declarator_type(&base)?;
                params.push(Param {
                    name: param_name,
                    ty,
                    span: param_start.merge(end),
                });
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect(Punct::RParen, "")?;
        loop {
            if self.eat_keyword(Keyword::Noexcept) {
                continue;
            }
            if self.check_keyword(Keyword::Const) {
                let span = self.advance().span;
                return Err(ParseError::new(
                    "non-member function cannot have 'const' qualifier",
                    span,
                ));
            }
            if self.is_attribute_start() {
                self.parse_attributes(&mut specifiers.attributes)?;
                continue;
            }
            break;
        }
        Ok(FunctionDecl {
            name,
            return_type,
            params,
            variadic,
            specifiers,
            body: None,
            span: start,
        })
    }

    fn parse_initializer(&mut self) -> PResult<Option<Initializer>> {
        if self.eat(Punct::Assign) {
            if self.check(Punct::LBrace) {
                return self.parse_init_list().map(Some);
            }
            return Ok(Some(Initializer::Expr(self.parse_assignment()?)));
        }
        if self.check(Punct::LBrace) {
            return self.parse_init_list().map(Some);
        }
        Ok(None)
    }

    fn parse_init_list(&mut self) -> PResult<Initializer> {
        let open = self.expect(Punct::LBrace, "")?;
        let mut values = Vec::new();
        while !self.check(Punct::RBrace) {
            values.push(self.parse_assignment()?);
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        let close = self.expect(Punct::RBrace, "to close initializer list")?;
        Ok(Initializer::List(values, open.span.merge(close.span)))
    }

    // ── Types ─────────────────────────────────────────────────────

    fn is_attribute_start(&self) -> bool {
        self.check_keyword(Keyword::Attribute)
            || (self.check(Punct::LBracket) && self.peek_at(1).is_punct(Punct::LBracket))
    }

    fn parse_attributes(&mut self, out: &mut Vec<Attribute>) -> PResult<()> {
        if self.eat_keyword(Keyword::Attribute) {
            self.expect(Punct::LParen, "after '__attribute__'")?;
            self.expect(Punct::LParen, "after '__attribute__'")?;
            while !self.check(Punct::RParen) {
                let token = self.advance();
                let Some(word) = token.word() else {
                    return Err(ParseError::new("expected attribute name", token.span));
                };
                let name = word.trim_matches('_').to_string();
                out.push(Attribute {
                    name,
                    span: token.span,
                });
                if self.check(Punct::LParen) {
                    self.skip_balanced_parens()?;
                }
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect(Punct::RParen, "after attribute list")?;
            self.expect(Punct::RParen, "after attribute list")?;
            return Ok(());
        }

        // [[ ns::name(args), ... ]]
        self.advance();
        self.advance();
        while !self.check(Punct::RBracket) {
            let token = self.advance();
            let Some(word) = token.word() else {
                return Err(ParseError::new("expected attribute name", token.span));
            };
            let mut name = word.to_string();
            while self.eat(Punct::ColonColon) {
                let (part, _) = self.expect_identifier("attribute name")?;
                name = format!("{name}::{part}");
            }
            out.push(Attribute {
                name,
                span: token.span,
            });
            if self.check(Punct::LParen) {
                self.skip_balanced_parens()?;
            }
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::RBracket, "after attribute")?;
        self.expect(Punct::RBracket, "after attribute")?;
        Ok(())
    }

    fn skip_balanced_parens(&mut self) -> PResult<()> {
        let open = self.expect(Punct::LParen, "")?;
        let mut depth = 1;
        while depth > 0 {
            let token = self.advance();
            if token.is_eof() {
                return Err(ParseError::new("expected ')'", token.span)
                    .with_note(open.span, "to match this '('"));
            }
            if token.is_punct(Punct::LParen) {
                depth += 1;
            } else if token.is_punct(Punct::RParen) {
                depth -= 1;
            }
        }
        Ok(())
    }

    /// Typedef name at the cursor, possibly qualified: returns how many
    /// tokens it spans.
    fn typedef_name_len(&self) -> Option<usize> {
        let mut n = 0;
        if self.peek_at(0).is_punct(Punct::ColonColon) {
            n = 1;
        }
        loop {
            let TokenKind::Identifier(name) = &self.peek_at(n).kind else {
                return None;
            };
            if self.peek_at(n + 1).is_punct(Punct::ColonColon) {
                n += 2;
                continue;
            }
            return self.typedefs.contains(name).then_some(n + 1);
        }
    }

    fn is_type_start(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Keyword(keyword) => keyword.starts_type(),
            TokenKind::Identifier(_) | TokenKind::Punct(Punct::ColonColon) => {
                self.typedef_name_len().is_some()
            }
            _ => false,
        }
    }

    /// A `(` at the cursor opens a type name.
    fn type_follows_paren(&mut self) -> bool {
        let saved = self.pos;
        self.advance();
        let is_type = self.is_type_start();
        self.pos = saved;
        is_type
    }

    fn is_decl_start(&self) -> bool {
        if self.is_type_start() || self.is_attribute_start() {
            return true;
        }
        matches!(
            self.peek().kind,
            TokenKind::Keyword(
                Keyword::Static
                    | Keyword::Extern
                    | Keyword::Inline
                    | Keyword::Constexpr
                    | Keyword::ThreadLocal
            )
        )
    }

    /// Declaration specifiers and the base type they name.
    fn parse_specifiers(&mut self, allow_storage: bool) -> PResult<(DeclSpecifiers, TypeExpr)> {
        let start = self.peek().span;
        let mut specifiers = DeclSpecifiers::default();
        let mut is_const = false;
        let mut words: Vec<(Keyword, Span)> = Vec::new();
        let mut named: Option<TypeSpec> = None;

        loop {
            if self.is_attribute_start() {
                self.parse_attributes(&mut specifiers.attributes)?;
                continue;
            }
            let token = self.peek().clone();
            match &token.kind {
                TokenKind::Keyword(keyword) => match keyword {
                    Keyword::Static | Keyword::Extern if allow_storage => {
                        if specifiers.storage != StorageClass::None {
                            return Err(ParseError::new(
                                "cannot combine with previous storage class specifier",
                                token.span,
                            ));
                        }
                        specifiers.storage = if *keyword == Keyword::Static {
                            StorageClass::Static
                        } else {
                            StorageClass::Extern
                        };
                    }
                    Keyword::Inline if allow_storage => specifiers.inline = true,
                    Keyword::Constexpr if allow_storage => {
                        specifiers.constexpr = true;
                        is_const = true;
                    }
                    Keyword::ThreadLocal if allow_storage => specifiers.thread_local = true,
                    Keyword::Const => is_const = true,
                    Keyword::Volatile => {}
                    k if k.starts_type() => {
                        if named.is_some() {
                            return Err(ParseError::new(
                                format!(
                                    "cannot combine with previous declaration specifier '{}'",
                                    token.lexeme
                                ),
                                token.span,
                            ));
                        }
                        words.push((*k, token.span));
                    }
                    _ => break,
                },
                TokenKind::Identifier(_) | TokenKind::Punct(Punct::ColonColon)
                    if words.is_empty() && named.is_none() =>
                {
                    let Some(len) = self.typedef_name_len() else {
                        break;
                    };
                    let global = self.eat(Punct::ColonColon);
                    let mut path = Vec::new();
                    let mut consumed = global as usize;
                    while consumed < len {
                        let token = self.advance();
                        consumed += 1;
                        if let Some(word) = token.word() {
                            path.push(word.to_string());
                        }
                    }
                    named = Some(TypeSpec::Named { path, global });
                    continue;
                }
                _ => break,
            }
            self.advance();
        }

        let spec = match named {
            Some(spec) => spec,
            None => combine_type_words(&words, start)?,
        };
        let span = start.merge(self.previous_span());
        Ok((
            specifiers,
            TypeExpr {
                spec,
                is_const,
                pointers: Vec::new(),
                array: None,
                span,
            },
        ))
    }

    fn parse_pointers(&mut self) -> Vec<bool> {
        let mut pointers = Vec::new();
        while self.eat(Punct::Star) {
            let mut is_const = false;
            loop {
                if self.eat_keyword(Keyword::Const) {
                    is_const = true;
                } else if !self.eat_keyword(Keyword::Volatile) {
                    break;
                }
            }
            pointers.push(is_const);
        }
        pointers
    }

    fn parse_array_suffix(&mut self, mut ty: TypeExpr) -> PResult<TypeExpr> {
        if self.eat(Punct::LBracket) {
            if self.eat(Punct::RBracket) {
                ty.array = Some(ArrayBound::Unsized);
            } else {
                let bound = self.parse_assignment()?;
                self.expect(Punct::RBracket, "")?;
                ty.array = Some(ArrayBound::Sized(Box::new(bound)));
            }
            if self.check(Punct::LBracket) {
                return Err(ParseError::new(
                    "multi-dimensional arrays are not supported",
                    self.peek().span,
                ));
            }
        }
        Ok(ty)
    }

    /// Pointers, an optional name and an optional array bound.
    fn parse_declarator_type(&mut self, base: &TypeExpr) -> PResult<(Option<String>, TypeExpr, Span)> {
        let pointers = self.parse_pointers();
        let mut end = self.previous_span();
        let name = match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                end = self.advance().span;
                Some(name)
            }
            _ => None,
        };
        let ty = self.parse_array_suffix(TypeExpr {
            pointers,
            ..base.clone()
        })?;
        Ok((name, ty, end))
    }

    fn parse_type_name(&mut self) -> PResult<TypeExpr> {
        let (_, base) = self.parse_specifiers(false)?;
        let (name, ty, span) = self.parse_declarator_type(&base)?;
        if name.is_some() {
            return Err(ParseError::new("unexpected name in type", span));
        }
        Ok(ty)
    }

    // ── Statements ────────────────────────────────────────────────

    fn parse_block(&mut self) -> PResult<Block> {
        let open = self.expect(Punct::LBrace, "")?;
        let mut stmts = Vec::new();
        loop {
            if self.check(Punct::RBrace) {
                let close = self.advance();
                return Ok(Block {
                    stmts,
                    span: open.span.merge(close.span),
                });
            }
            if self.peek().is_eof() {
                return Err(ParseError::new("expected '}'", self.peek().span)
                    .with_note(open.span, "to match this '{'"));
            }
            if self.diag.is_fatal() {
                return Ok(Block {
                    stmts,
                    span: open.span,
                });
            }
            match self.parse_statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.report(err);
                    self.recover_statement();
                }
            }
        }
    }

    /// Skip to past the next `;`, stopping before an unmatched `}`.
    fn recover_statement(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.peek();
            if token.is_eof() {
                return;
            }
            if token.is_punct(Punct::LBrace) {
                depth += 1;
            } else if token.is_punct(Punct::RBrace) {
                if depth == 0 {
                    return;
                }
                depth -= 1;
            } else if token.is_punct(Punct::Semicolon) && depth == 0 {
                self.advance();
                return;
            }
            self.advance();
        }
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Punct(Punct::LBrace) => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Punct(Punct::Semicolon) => {
                self.advance();
                Ok(Stmt::Empty(token.span))
            }
            TokenKind::Keyword(Keyword::If) => {
                self.advance();
                self.expect(Punct::LParen, "after 'if'")?;
                let cond = self.parse_expression()?;
                self.expect(Punct::RParen, "")?;
                let then = Box::new(self.parse_statement()?);
                let otherwise = if self.eat_keyword(Keyword::Else) {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                self.expect(Punct::LParen, "after 'while'")?;
                let cond = self.parse_expression()?;
                self.expect(Punct::RParen, "")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While {
                    cond,
                    body,
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.advance();
                let body = Box::new(self.parse_statement()?);
                if !self.eat_keyword(Keyword::While) {
                    return Err(ParseError::new(
                        "expected 'while' in do/while loop",
                        self.peek().span,
                    ));
                }
                self.expect(Punct::LParen, "after 'while'")?;
                let cond = self.parse_expression()?;
                self.expect(Punct::RParen, "")?;
                self.expect(Punct::Semicolon, "after do/while statement")?;
                Ok(Stmt::DoWhile {
                    body,
                    cond,
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::For) => {
                self.advance();
                self.expect(Punct::LParen, "after 'for'")?;
                let init = if self.eat(Punct::Semicolon) {
                    None
                } else if self.is_decl_start() {
                    Some(Box::new(Stmt::Decl(self.parse_local_declaration()?)))
                } else {
                    let expr = self.parse_expression()?;
                    self.expect(Punct::Semicolon, "in 'for' statement specifier")?;
                    Some(Box::new(Stmt::Expr(expr)))
                };
                let cond = if self.check(Punct::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(Punct::Semicolon, "in 'for' statement specifier")?;
                let step = if self.check(Punct::RParen) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(Punct::RParen, "")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.check(Punct::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(Punct::Semicolon, "after return statement")?;
                Ok(Stmt::Return(value, token.span))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect(Punct::Semicolon, "after 'break'")?;
                Ok(Stmt::Break(token.span))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect(Punct::Semicolon, "after 'continue'")?;
                Ok(Stmt::Continue(token.span))
            }
            TokenKind::Keyword(Keyword::Typedef) => {
                let mut decls = self.parse_typedef()?;
                match decls.len() {
                    1 => Ok(Stmt::Typedef(decls.remove(0))),
                    _ => Err(ParseError::new(
                        "only one typedef name per local typedef is supported",
                        token.span,
                    )),
                }
            }
            _ if self.is_decl_start() => Ok(Stmt::Decl(self.parse_local_declaration()?)),
            _ => {
                let expr = self.parse_expression()?;
                self.expect(Punct::Semicolon, "after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_local_declaration(&mut self) -> PResult<Vec<VariableDecl>> {
        let (specifiers, base) = self.parse_specifiers(true)?;
        let mut decls = Vec::new();
        loop {
            let pointers = self.parse_pointers();
            let (name, span) = self.expect_identifier("identifier")?;
            if self.check(Punct::LParen) {
                return Err(ParseError::new(
                    "function declarations are not allowed inside functions",
                    span,
                ));
            }
            let ty = self.parse_array_suffix(TypeExpr {
                pointers,
                ..base.clone()
            })?;
            let init = self.parse_initializer()?;
            decls.push(VariableDecl {
                name,
                ty,
                specifiers: specifiers.clone(),
                init,
                span,
            });
            if !self.eat(Punct::Comma) {
                break;
            }
        }
        self.expect(Punct::Semicolon, "at end of declaration")?;
        Ok(decls)
    }

    // ── Expressions ───────────────────────────────────────────────

    pub fn parse_expression(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_assignment()?;
        while self.eat(Punct::Comma) {
            let rhs = self.parse_assignment()?;
            let span = expr.span.merge(rhs.span);
            expr = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let target = self.parse_conditional()?;
        let op = match &self.peek().kind {
            TokenKind::Punct(Punct::Assign) => None,
            TokenKind::Punct(p) => match compound_assign_op(*p) {
                Some(op) => Some(op),
                None => return Ok(target),
            },
            _ => return Ok(target),
        };
        self.advance();
        let value = self.parse_assignment()?;
        let span = target.span.merge(value.span);
        Ok(Expr::new(
            ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        ))
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let cond = self.parse_binary(1)?;
        if !self.eat(Punct::Question) {
            return Ok(cond);
        }
        let then = self.parse_expression()?;
        self.expect(Punct::Colon, "in conditional expression")?;
        let otherwise = self.parse_assignment()?;
        let span = cond.span.merge(otherwise.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let TokenKind::Punct(punct) = self.peek().kind else {
                break;
            };
            let Some((op, prec)) = binary_op(punct) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let op = match &token.kind {
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            TokenKind::Punct(Punct::Star) => Some(UnaryOp::Deref),
            TokenKind::Punct(Punct::Amp) => Some(UnaryOp::AddrOf),
            TokenKind::Punct(p @ (Punct::PlusPlus | Punct::MinusMinus)) => {
                let increment = *p == Punct::PlusPlus;
                self.advance();
                let operand = self.parse_unary()?;
                let span = token.span.merge(operand.span);
                return Ok(Expr::new(
                    ExprKind::IncDec {
                        increment,
                        prefix: true,
                        operand: Box::new(operand),
                    },
                    span,
                ));
            }
            TokenKind::Keyword(Keyword::Sizeof) => {
                self.advance();
                if self.check(Punct::LParen) && self.type_follows_paren() {
                    self.advance();
                    let ty = self.parse_type_name()?;
                    let close = self.expect(Punct::RParen, "")?;
                    return Ok(Expr::new(ExprKind::SizeofType(ty), token.span.merge(close.span)));
                }
                let operand = self.parse_unary()?;
                let span = token.span.merge(operand.span);
                return Ok(Expr::new(ExprKind::SizeofExpr(Box::new(operand)), span));
            }
            TokenKind::Punct(Punct::LParen) if self.type_follows_paren() => {
                self.advance();
                let ty = self.parse_type_name()?;
                self.expect(Punct::RParen, "")?;
                let operand = self.parse_unary()?;
                let span = token.span.merge(operand.span);
                return Ok(Expr::new(
                    ExprKind::Cast {
                        ty,
                        operand: Box::new(operand),
                    },
                    span,
                ));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            let span = token.span.merge(operand.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(Punct::LParen) {
                self.advance();
                let mut args = Vec::new();
                if !self.check(Punct::RParen) {
                    loop {
                        args.push(self.parse_assignment()?);
                        if !self.eat(Punct::Comma) {
                            break;
                        }
                    }
                }
                let close = self.expect(Punct::RParen, "")?;
                let span = expr.span.merge(close.span);
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                );
            } else if self.check(Punct::LBracket) {
                self.advance();
                let index = self.parse_expression()?;
                let close = self.expect(Punct::RBracket, "")?;
                let span = expr.span.merge(close.span);
                expr = Expr::new(
                    ExprKind::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else if self.check(Punct::PlusPlus) || self.check(Punct::MinusMinus) {
                let token = self.advance();
                let span = expr.span.merge(token.span);
                expr = Expr::new(
                    ExprKind::IncDec {
                        increment: token.is_punct(Punct::PlusPlus),
                        prefix: false,
                        operand: Box::new(expr),
                    },
                    span,
                );
            } else if self.check(Punct::Dot) || self.check(Punct::Arrow) {
                return Err(ParseError::new(
                    "member access is not supported",
                    self.peek().span,
                ));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let kind = match &token.kind {
            TokenKind::Integer { value, suffix } => ExprKind::IntLit {
                value: *value,
                suffix: *suffix,
            },
            TokenKind::Float { value, single } => ExprKind::FloatLit {
                value: *value,
                single: *single,
            },
            TokenKind::Char(value) => ExprKind::CharLit(*value),
            TokenKind::String(_) => {
                let mut text = String::new();
                let mut span = token.span;
                while let TokenKind::String(part) = &self.peek().kind {
                    text.push_str(part);
                    span = span.merge(self.peek().span);
                    self.advance();
                }
                return Ok(Expr::new(ExprKind::StrLit(text), span));
            }
            TokenKind::Keyword(Keyword::True) => ExprKind::BoolLit(true),
            TokenKind::Keyword(Keyword::False) => ExprKind::BoolLit(false),
            TokenKind::Keyword(Keyword::Nullptr) => ExprKind::Nullptr,
            TokenKind::Identifier(_) | TokenKind::Punct(Punct::ColonColon) => {
                let global = self.eat(Punct::ColonColon);
                let (first, mut span) = self.expect_identifier("identifier")?;
                let mut path = vec![first];
                while self.check(Punct::ColonColon) {
                    self.advance();
                    let (part, part_span) = self.expect_identifier("identifier after '::'")?;
                    path.push(part);
                    span = span.merge(part_span);
                }
                return Ok(Expr::new(ExprKind::Name { path, global }, token.span.merge(span)));
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.parse_expression()?;
                let close = self.expect(Punct::RParen, "")?;
                return Ok(Expr::new(inner.kind, token.span.merge(close.span)));
            }
            TokenKind::Error(message) => {
                return Err(ParseError::new(message.clone(), token.span));
            }
            _ => {
                return Err(ParseError::new(
                    format!("expected expression, found {}", describe(&token)),
                    token.span,
                ));
            }
        };
        self.advance();
        Ok(Expr::new(kind, token.span))
    }
}

fn describe(token: &Token) -> String {
    match &token.kind {
        TokenKind::Eof => "end of file".to_string(),
        _ => format!("'{}'", token.lexeme),
    }
}

fn binary_op(punct: Punct) -> Option<(BinaryOp, u8)> {
    Some(match punct {
        Punct::PipePipe => (BinaryOp::LogOr, 1),
        Punct::AmpAmp => (BinaryOp::LogAnd, 2),
        Punct::Pipe => (BinaryOp::BitOr, 3),
        Punct::Caret => (BinaryOp::BitXor, 4),
        Punct::Amp => (BinaryOp::BitAnd, 5),
        Punct::EqEq => (BinaryOp::Eq, 6),
        Punct::Ne => (BinaryOp::Ne, 6),
        Punct::Lt => (BinaryOp::Lt, 7),
        Punct::Gt => (BinaryOp::Gt, 7),
        Punct::Le => (BinaryOp::Le, 7),
        Punct::Ge => (BinaryOp::Ge, 7),
        Punct::Shl => (BinaryOp::Shl, 8),
        Punct::Shr => (BinaryOp::Shr, 8),
        Punct::Plus => (BinaryOp::Add, 9),
        Punct::Minus => (BinaryOp::Sub, 9),
        Punct::Star => (BinaryOp::Mul, 10),
        Punct::Slash => (BinaryOp::Div, 10),
        Punct::Percent => (BinaryOp::Rem, 10),
        _ => return None,
    })
}

fn compound_assign_op(punct: Punct) -> Option<BinaryOp> {
    Some(match punct {
        Punct::PlusAssign => BinaryOp::Add,
        Punct::MinusAssign => BinaryOp::Sub,
        Punct::StarAssign => BinaryOp::Mul,
        Punct::SlashAssign => BinaryOp::Div,
        Punct::PercentAssign => BinaryOp::Rem,
        Punct::AmpAssign => BinaryOp::BitAnd,
        Punct::PipeAssign => BinaryOp::BitOr,
        Punct::CaretAssign => BinaryOp::BitXor,
        Punct::ShlAssign => BinaryOp::Shl,
        Punct::ShrAssign => BinaryOp::Shr,
        _ => return None,
    })
}

/// Fold `unsigned long long int` style keyword runs into one type.
fn combine_type_words(words: &[(Keyword, Span)], start: Span) -> PResult<TypeSpec> {
    let mut signed = None;
    let mut longs = 0;
    let mut short = false;
    let mut base: Option<(Keyword, Span)> = None;
    for (keyword, span) in words {
        match keyword {
            Keyword::Signed | Keyword::Unsigned => {
                if signed.is_some() {
                    return Err(ParseError::new(
                        "cannot combine with previous signedness specifier",
                        *span,
                    ));
                }
                signed = Some(*keyword == Keyword::Signed);
            }
            Keyword::Long => {
                longs += 1;
                if longs > 2 {
                    return Err(ParseError::new("'long long long' is invalid", *span));
                }
            }
            Keyword::Short => short = true,
            other => {
                if let Some((previous, _)) = base {
                    if !(previous == Keyword::Int || *other == Keyword::Int) || previous == *other {
                        return Err(ParseError::new(
                            "cannot combine with previous declaration specifier",
                            *span,
                        ));
                    }
                    if *other == Keyword::Int {
                        continue;
                    }
                }
                base = Some((*other, *span));
            }
        }
    }

    let invalid = |what: &str, span: Span| {
        Err(ParseError::new(format!("'{what}' cannot be combined here"), span))
    };
    let base_kw = base.map(|(k, _)| k);
    let base_span = base.map(|(_, s)| s).unwrap_or(start);
    match base_kw {
        None | Some(Keyword::Int) => {
            if base_kw.is_none() && signed.is_none() && longs == 0 && !short {
                return Err(ParseError::new(
                    "a type specifier is required for all declarations",
                    start,
                ));
            }
            let unsigned = signed == Some(false);
            let kind = match (short, longs, unsigned) {
                (true, 0, false) => IntKind::Short,
                (true, 0, true) => IntKind::UShort,
                (true, _, _) => return invalid("short long", base_span),
                (false, 0, false) => IntKind::Int,
                (false, 0, true) => IntKind::UInt,
                (false, 1, false) => IntKind::Long,
                (false, 1, true) => IntKind::ULong,
                (false, _, false) => IntKind::LongLong,
                (false, _, true) => IntKind::ULongLong,
            };
            Ok(TypeSpec::Int(kind))
        }
        Some(Keyword::Char) => {
            if short || longs > 0 {
                return invalid("char", base_span);
            }
            Ok(TypeSpec::Int(match signed {
                None => IntKind::Char,
                Some(true) => IntKind::SChar,
                Some(false) => IntKind::UChar,
            }))
        }
        Some(keyword) => {
            if signed.is_some() || short || (longs > 0 && keyword != Keyword::Double) {
                return invalid("type modifier", base_span);
            }
            Ok(match keyword {
                Keyword::Void => TypeSpec::Void,
                Keyword::Bool => TypeSpec::Bool,
                Keyword::Float => TypeSpec::Float,
                // `long double` is treated as `double`.
                _ => TypeSpec::Double,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{CollectingSink, Severity};
    use crate::lexer::tokenize;

    fn parse(src: &str, sink: &CollectingSink) -> TranslationUnit {
        let mut diag = DiagnosticEngine::new(sink);
        let file = diag.add_file("test.cpp");
        let tokens = tokenize(src, file);
        let mut parser = Parser::new(tokens, &mut diag);
        parser.parse_translation_unit()
    }

    #[test]
    fn parses_function_definition() {
        let sink = CollectingSink::new();
        let tu = parse("int add1(int x) { return x + 1; }", &sink);
        assert!(!sink.has_errors(), "{:?}", sink.snapshot());
        let Item::Function(f) = &tu.items[0] else {
            panic!("expected function");
        };
        assert_eq!(f.name, "add1");
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.params[0].name.as_deref(), Some("x"));
        assert_eq!(f.return_type.spec, TypeSpec::Int(IntKind::Int));
        let body = f.body.as_ref().unwrap();
        assert!(matches!(body.stmts[0], Stmt::Return(Some(_), _)));
    }

    #[test]
    fn parses_linkage_namespace_and_attributes() {
        let sink = CollectingSink::new();
        let src = r#"
            extern "C" { int host_value(void); }
            extern "C" int single(int, ...);
            namespace ns { static thread_local int counter = 0; }
            __attribute__((constructor)) void init_me() {}
            [[nodiscard]] unsigned long long big();
        "#;
        let tu = parse(src, &sink);
        assert!(!sink.has_errors(), "{:?}", sink.snapshot());
        assert_eq!(tu.items.len(), 5);
        assert!(matches!(&tu.items[0], Item::CLinkage { items, .. } if items.len() == 1));
        let Item::CLinkage { items, .. } = &tu.items[1] else {
            panic!("expected linkage block");
        };
        let Item::Function(single) = &items[0] else {
            panic!("expected function");
        };
        assert!(single.variadic);
        let Item::Namespace { name, items, .. } = &tu.items[2] else {
            panic!("expected namespace");
        };
        assert_eq!(name, "ns");
        let Item::Variable(counter) = &items[0] else {
            panic!("expected variable");
        };
        assert!(counter.specifiers.thread_local);
        assert_eq!(counter.specifiers.storage, StorageClass::Static);
        let Item::Function(init) = &tu.items[3] else {
            panic!("expected function");
        };
        assert!(init.specifiers.has_attribute("constructor"));
        let Item::Function(big) = &tu.items[4] else {
            panic!("expected function");
        };
        assert_eq!(big.return_type.spec, TypeSpec::Int(IntKind::ULongLong));
        assert!(big.specifiers.has_attribute("nodiscard"));
    }

    #[test]
    fn precedence_and_casts() {
        let sink = CollectingSink::new();
        let tu = parse("int f(int a) { return (long)a * 2 + 1 << 3; }", &sink);
        assert!(!sink.has_errors(), "{:?}", sink.snapshot());
        let Item::Function(f) = &tu.items[0] else {
            panic!("expected function");
        };
        let Stmt::Return(Some(expr), _) = &f.body.as_ref().unwrap().stmts[0] else {
            panic!("expected return");
        };
        let ExprKind::Binary { op: BinaryOp::Shl, lhs, .. } = &expr.kind else {
            panic!("expected shift at the top, got {:?}", expr.kind);
        };
        let ExprKind::Binary { op: BinaryOp::Add, lhs, .. } = &lhs.kind else {
            panic!("expected add");
        };
        let ExprKind::Binary { op: BinaryOp::Mul, lhs, .. } = &lhs.kind else {
            panic!("expected mul");
        };
        assert!(matches!(lhs.kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn typedef_names_start_declarations() {
        let sink = CollectingSink::new();
        let tu = parse(
            "typedef unsigned int u32; u32 twice(u32 v) { u32 * p = &v; return *p * 2; }",
            &sink,
        );
        assert!(!sink.has_errors(), "{:?}", sink.snapshot());
        assert!(matches!(&tu.items[0], Item::Typedef(t) if t.name == "u32"));
        let Item::Function(f) = &tu.items[1] else {
            panic!("expected function");
        };
        assert!(matches!(f.body.as_ref().unwrap().stmts[0], Stmt::Decl(_)));
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let sink = CollectingSink::new();
        parse("int f() { return 1 }", &sink);
        assert!(sink.contains(Severity::Error, "expected ';' after return statement"));
    }

    #[test]
    fn unbalanced_brace_notes_opening() {
        let sink = CollectingSink::new();
        parse("int f() { return 1;", &sink);
        assert!(sink.contains(Severity::Error, "expected '}'"));
        assert!(sink.contains(Severity::Note, "to match this '{'"));
    }

    #[test]
    fn recovers_after_error() {
        let sink = CollectingSink::new();
        let tu = parse("int a = ; int b = 2; }", &sink);
        assert_eq!(sink.count(Severity::Error), 2);
        assert!(tu
            .items
            .iter()
            .any(|item| matches!(item, Item::Variable(v) if v.name == "b")));
    }
}
