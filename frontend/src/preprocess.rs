//! Preprocessor: directives, conditional inclusion and macro expansion.
//!
//! Files are lexed whole, directive lines are handled as they are met and
//! the text between directives is macro-expanded in one batch and appended
//! to the output. Expansion follows the usual hide-set rule: a macro name
//! produced by its own expansion is never expanded again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::diagnostic::{DiagnosticEngine, FatalError};
use crate::lexer::tokenize;
use crate::span::{FileId, Span};
use crate::token::{IntSuffix, Keyword, Punct, Token, TokenKind};
use crate::vfs::{FileSystem, normalize};

/// Deepest `#include` nesting before the compile is stopped.
const MAX_INCLUDE_DEPTH: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    pub name: String,
    /// `None` for object-like macros.
    pub params: Option<Vec<String>>,
    pub variadic: bool,
    pub body: Vec<Token>,
    pub span: Span,
}

impl MacroDef {
    fn same_definition(&self, other: &MacroDef) -> bool {
        self.params == other.params
            && self.variadic == other.variadic
            && self.body.len() == other.body.len()
            && self
                .body
                .iter()
                .zip(&other.body)
                .all(|(a, b)| a.lexeme == b.lexeme && a.leading_space == b.leading_space)
    }

    fn param_index(&self, token: &Token) -> Option<usize> {
        let params = self.params.as_ref()?;
        let word = token.word()?;
        if self.variadic && word == "__VA_ARGS__" {
            return Some(params.len());
        }
        params.iter().position(|p| p == word)
    }
}

#[derive(Debug, Default)]
pub struct PreprocessOutput {
    pub tokens: Vec<Token>,
    /// Libraries requested with `#pragma comment(lib, "...")`.
    pub libraries: Vec<String>,
    pub included: Vec<PathBuf>,
}

/// One level of `#if` nesting.
#[derive(Debug, Clone, Copy)]
struct Conditional {
    /// The current branch is emitting tokens.
    active: bool,
    /// Some branch of this conditional has been taken.
    taken: bool,
    seen_else: bool,
    /// The enclosing region was emitting tokens.
    parent_active: bool,
    span: Span,
}

#[derive(Debug, Clone)]
struct PpToken {
    token: Token,
    hide: Rc<HashSet<String>>,
}

pub struct Preprocessor<'a, 's> {
    fs: &'a dyn FileSystem,
    include_dirs: &'a [PathBuf],
    diag: &'a mut DiagnosticEngine<'s>,
    macros: HashMap<String, MacroDef>,
    once: HashSet<PathBuf>,
    output: PreprocessOutput,
    depth: usize,
    builtin: FileId,
}

impl<'a, 's> Preprocessor<'a, 's> {
    pub fn new(
        fs: &'a dyn FileSystem,
        include_dirs: &'a [PathBuf],
        diag: &'a mut DiagnosticEngine<'s>,
    ) -> Self {
        let builtin = diag.add_file("<built-in>");
        Self {
            fs,
            include_dirs,
            diag,
            macros: HashMap::new(),
            once: HashSet::new(),
            output: PreprocessOutput::default(),
            depth: 0,
            builtin,
        }
    }

    pub fn define(&mut self, def: MacroDef) {
        self.macros.insert(def.name.clone(), def);
    }

    /// Define an object-like macro from command-line style text.
    pub fn define_text(&mut self, name: &str, value: &str) {
        let mut body = tokenize(value, self.builtin);
        body.pop();
        for token in &mut body {
            token.line_start = false;
        }
        let span = body
            .first()
            .map(|t| t.span)
            .unwrap_or_else(|| Span::point(self.builtin, crate::span::Pos::origin()));
        self.define(MacroDef {
            name: name.to_string(),
            params: None,
            variadic: false,
            body,
            span,
        });
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn macros(&self) -> impl Iterator<Item = &MacroDef> {
        self.macros.values()
    }

    /// Preprocess a file found through the file system.
    pub fn process_file(&mut self, path: &Path) -> Result<(), FatalError> {
        let path = normalize(path);
        let text = match self.fs.read(&path) {
            Ok(text) => text,
            Err(err) => {
                return Err(self
                    .diag
                    .fatal(None, format!("cannot open '{}': {err}", path.display())));
            }
        };
        self.process_text(&path, &text)
    }

    /// Preprocess `text` as if it were the contents of `path`.
    pub fn process_text(&mut self, path: &Path, text: &str) -> Result<(), FatalError> {
        let name = path.to_string_lossy().replace('\\', "/");
        let file = self.diag.add_file(&name);
        self.output.included.push(path.to_path_buf());
        let tokens = tokenize(text, file);

        let mut conditionals: Vec<Conditional> = Vec::new();
        let mut pending: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if token.is_eof() {
                break;
            }
            if token.line_start && token.is_punct(Punct::Hash) {
                let mut end = i + 1;
                while end < tokens.len() && !tokens[end].line_start && !tokens[end].is_eof() {
                    end += 1;
                }
                let expanded = self.expand(std::mem::take(&mut pending));
                self.output.tokens.extend(expanded);
                self.directive(&tokens[i + 1..end], token.span, path, &mut conditionals)?;
                if self.diag.is_fatal() {
                    return Err(FatalError);
                }
                i = end;
                continue;
            }
            if conditionals.last().is_none_or(|c| c.active) {
                match &token.kind {
                    TokenKind::Error(message) => self.diag.error(token.span, message.clone()),
                    _ => pending.push(token.clone()),
                }
            }
            i += 1;
        }
        let expanded = self.expand(pending);
        self.output.tokens.extend(expanded);

        if let Some(open) = conditionals.last() {
            self.diag.error(open.span, "unterminated conditional directive");
        }
        if self.diag.is_fatal() {
            return Err(FatalError);
        }
        Ok(())
    }

    /// Finish preprocessing: appends the final `Eof`.
    pub fn finish(mut self) -> (PreprocessOutput, Vec<MacroDef>) {
        let span = self
            .output
            .tokens
            .last()
            .map(|t| Span::point(t.span.file, t.span.end))
            .unwrap_or_else(|| Span::point(self.builtin, crate::span::Pos::origin()));
        self.output.tokens.push(Token::new(TokenKind::Eof, span, ""));
        let mut macros: Vec<MacroDef> = self.macros.into_values().collect();
        macros.sort_by(|a, b| a.name.cmp(&b.name));
        (self.output, macros)
    }

    // ── Directives ────────────────────────────────────────────────

    fn directive(
        &mut self,
        line: &[Token],
        hash: Span,
        path: &Path,
        conditionals: &mut Vec<Conditional>,
    ) -> Result<(), FatalError> {
        let Some(first) = line.first() else {
            return Ok(());
        };
        let name = first.word().unwrap_or("");
        let active = conditionals.last().is_none_or(|c| c.active);
        let args = &line[1..];

        match name {
            "if" | "ifdef" | "ifndef" => {
                let taken = active
                    && match name {
                        "if" => self.evaluate(args, first.span),
                        "ifdef" => self.defined_operand(args, first.span),
                        _ => !self.defined_operand(args, first.span),
                    };
                conditionals.push(Conditional {
                    active: taken,
                    taken: taken || !active,
                    seen_else: false,
                    parent_active: active,
                    span: hash,
                });
            }
            "elif" | "elifdef" | "elifndef" => {
                let Some(top) = conditionals.last().copied() else {
                    self.diag.error(first.span, "#elif without #if");
                    return Ok(());
                };
                if top.seen_else {
                    self.diag.error(first.span, "#elif after #else");
                }
                let taken = !top.taken
                    && top.parent_active
                    && match name {
                        "elif" => self.evaluate(args, first.span),
                        "elifdef" => self.defined_operand(args, first.span),
                        _ => !self.defined_operand(args, first.span),
                    };
                if let Some(top) = conditionals.last_mut() {
                    top.active = taken;
                    top.taken |= taken;
                }
            }
            "else" => match conditionals.last_mut() {
                Some(top) => {
                    if top.seen_else {
                        self.diag.error(first.span, "#else after #else");
                    }
                    top.seen_else = true;
                    top.active = !top.taken && top.parent_active;
                    top.taken = true;
                }
                None => self.diag.error(first.span, "#else without #if"),
            },
            "endif" => {
                if conditionals.pop().is_none() {
                    self.diag.error(first.span, "#endif without #if");
                }
            }
            _ if !active => {}
            "define" => self.define_directive(args, first.span),
            "undef" => match args.first().and_then(Token::word) {
                Some(macro_name) => {
                    self.macros.remove(macro_name);
                }
                None => self.diag.error(first.span, "macro name must be an identifier"),
            },
            "include" | "include_next" | "import" => self.include(args, first.span, path)?,
            "pragma" => self.pragma(args, first.span, path),
            "error" => {
                let text = join_lexemes(args);
                self.diag.error(first.span, text);
            }
            "warning" => {
                let text = join_lexemes(args);
                self.diag.warning(first.span, text);
            }
            "line" => {}
            _ => self
                .diag
                .error(first.span, format!("invalid preprocessing directive '#{}'", first.lexeme)),
        }
        Ok(())
    }

    fn defined_operand(&mut self, args: &[Token], span: Span) -> bool {
        match args.first().and_then(Token::word) {
            Some(name) => self.macros.contains_key(name),
            None => {
                self.diag.error(span, "macro name missing");
                false
            }
        }
    }

    fn define_directive(&mut self, args: &[Token], span: Span) {
        let Some(name_token) = args.first() else {
            self.diag.error(span, "macro name missing");
            return;
        };
        let Some(name) = name_token.word() else {
            self.diag.error(name_token.span, "macro name must be an identifier");
            return;
        };
        if name == "defined" {
            self.diag
                .error(name_token.span, "'defined' cannot be used as a macro name");
            return;
        }

        let mut rest = &args[1..];
        let mut params = None;
        let mut variadic = false;
        if rest
            .first()
            .is_some_and(|t| t.is_punct(Punct::LParen) && !t.leading_space)
        {
            let mut names = Vec::new();
            let mut i = 1;
            loop {
                let Some(t) = rest.get(i) else {
                    self.diag
                        .error(name_token.span, "missing ')' in macro parameter list");
                    return;
                };
                if t.is_punct(Punct::RParen) && names.is_empty() && !variadic {
                    i += 1;
                    break;
                }
                if t.is_punct(Punct::Ellipsis) {
                    variadic = true;
                } else if let Some(param) = t.word() {
                    names.push(param.to_string());
                } else {
                    self.diag.error(t.span, "invalid token in macro parameter list");
                    return;
                }
                i += 1;
                match rest.get(i) {
                    Some(t) if t.is_punct(Punct::Comma) && !variadic => i += 1,
                    Some(t) if t.is_punct(Punct::RParen) => {
                        i += 1;
                        break;
                    }
                    Some(t) => {
                        self.diag.error(t.span, "expected ',' or ')' in macro parameter list");
                        return;
                    }
                    None => {
                        self.diag
                            .error(name_token.span, "missing ')' in macro parameter list");
                        return;
                    }
                }
            }
            params = Some(names);
            rest = &rest[i..];
        }

        let mut body: Vec<Token> = rest.to_vec();
        if let Some(first) = body.first_mut() {
            first.leading_space = false;
        }
        for token in &mut body {
            token.line_start = false;
        }
        let def = MacroDef {
            name: name.to_string(),
            params,
            variadic,
            body,
            span: name_token.span,
        };
        if let Some(previous) = self.macros.get(name) {
            if !previous.same_definition(&def) {
                let previous_span = previous.span;
                self.diag
                    .warning(name_token.span, format!("'{name}' macro redefined"));
                self.diag
                    .note(previous_span, "previous definition is here");
            }
        }
        self.macros.insert(def.name.clone(), def);
    }

    fn include(&mut self, args: &[Token], span: Span, path: &Path) -> Result<(), FatalError> {
        let target = match args.first().map(|t| &t.kind) {
            Some(TokenKind::String(name)) => Some((name.clone(), false)),
            Some(TokenKind::HeaderName(name)) => Some((name.clone(), true)),
            _ => {
                let expanded = self.expand(args.to_vec());
                match expanded.first().map(|t| &t.kind) {
                    Some(TokenKind::String(name)) => Some((name.clone(), false)),
                    _ => None,
                }
            }
        };
        let Some((name, angled)) = target else {
            self.diag
                .error(span, "expected \"FILENAME\" or <FILENAME>");
            return Ok(());
        };

        let Some(resolved) = self.resolve_include(&name, angled, path.parent()) else {
            return Err(self.diag.fatal(Some(span), format!("'{name}' file not found")));
        };
        if self.once.contains(&resolved) {
            return Ok(());
        }
        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(self.diag.fatal(Some(span), "#include nested too deeply"));
        }
        let text = match self.fs.read(&resolved) {
            Ok(text) => text,
            Err(err) => {
                return Err(self
                    .diag
                    .fatal(Some(span), format!("cannot open '{name}': {err}")));
            }
        };
        self.depth += 1;
        let result = self.process_text(&resolved, &text);
        self.depth -= 1;
        result
    }

    /// Search order: the name as given (virtual files first), the including
    /// file's directory for quoted includes, then each header directory.
    fn resolve_include(&self, name: &str, angled: bool, current: Option<&Path>) -> Option<PathBuf> {
        let direct = normalize(Path::new(name));
        if Path::new(name).is_absolute() {
            return self.fs.exists(&direct).then_some(direct);
        }
        if self.fs.exists(&direct) {
            return Some(direct);
        }
        if !angled {
            if let Some(dir) = current {
                let candidate = normalize(&dir.join(name));
                if self.fs.exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
        self.include_dirs
            .iter()
            .map(|dir| normalize(&dir.join(name)))
            .find(|candidate| self.fs.exists(candidate))
    }

    fn pragma(&mut self, args: &[Token], span: Span, path: &Path) {
        match args.first().and_then(Token::word) {
            Some("once") => {
                self.once.insert(normalize(path));
            }
            Some("comment") => {
                // comment ( lib , "name" )
                let kind = args.get(2).and_then(Token::word);
                let value = args.iter().find_map(|t| match &t.kind {
                    TokenKind::String(s) => Some(s.clone()),
                    _ => None,
                });
                match (kind, value) {
                    (Some("lib"), Some(library)) => {
                        if !self.output.libraries.contains(&library) {
                            self.output.libraries.push(library);
                        }
                    }
                    _ => self.diag.ignored(span, "pragma comment ignored"),
                }
            }
            _ => self.diag.ignored(span, "unknown pragma ignored"),
        }
    }

    // ── Conditional expressions ───────────────────────────────────

    fn evaluate(&mut self, args: &[Token], span: Span) -> bool {
        let mut replaced = Vec::with_capacity(args.len());
        let mut i = 0;
        while i < args.len() {
            let token = &args[i];
            if token.word() == Some("defined") {
                let (name, consumed) = match args.get(i + 1) {
                    Some(t) if t.is_punct(Punct::LParen) => {
                        let name = args.get(i + 2).and_then(Token::word);
                        let closed = args.get(i + 3).is_some_and(|t| t.is_punct(Punct::RParen));
                        if !closed {
                            self.diag.error(token.span, "missing ')' after 'defined'");
                            return false;
                        }
                        (name, 4)
                    }
                    Some(t) => (t.word(), 2),
                    None => (None, 1),
                };
                let Some(name) = name else {
                    self.diag.error(token.span, "macro name missing after 'defined'");
                    return false;
                };
                let value = self.macros.contains_key(name) as u64;
                replaced.push(int_token(value, token.span));
                i += consumed;
                continue;
            }
            replaced.push(token.clone());
            i += 1;
        }

        let expanded = self.expand(replaced);
        let mut parser = ConditionParser {
            tokens: &expanded,
            pos: 0,
        };
        match parser.parse_full() {
            Ok(value) => value != 0,
            Err((message, at)) => {
                self.diag.error(at.unwrap_or(span), message);
                false
            }
        }
    }

    // ── Macro expansion ───────────────────────────────────────────

    fn expand(&mut self, tokens: Vec<Token>) -> Vec<Token> {
        if tokens.is_empty() {
            return tokens;
        }
        let empty = Rc::new(HashSet::new());
        let queue = tokens
            .into_iter()
            .map(|token| PpToken {
                token,
                hide: empty.clone(),
            })
            .collect();
        self.expand_queue(queue)
            .into_iter()
            .map(|pp| pp.token)
            .collect()
    }

    fn expand_queue(&mut self, mut queue: VecDeque<PpToken>) -> Vec<PpToken> {
        let mut out = Vec::new();
        while let Some(pp) = queue.pop_front() {
            let Some(word) = pp.token.word().map(str::to_string) else {
                out.push(pp);
                continue;
            };
            match word.as_str() {
                "__LINE__" => {
                    let token = int_token(pp.token.span.start.line as u64, pp.token.span);
                    out.push(PpToken { token, ..pp });
                    continue;
                }
                "__FILE__" => {
                    let name = self.diag.files().name(pp.token.span.file).to_string();
                    let token = string_token(&name, pp.token.span);
                    out.push(PpToken { token, ..pp });
                    continue;
                }
                _ => {}
            }
            let Some(def) = self.macros.get(&word).cloned() else {
                out.push(pp);
                continue;
            };
            if pp.hide.contains(&word) {
                out.push(pp);
                continue;
            }

            let args = if def.params.is_some() {
                if !queue.front().is_some_and(|t| t.token.is_punct(Punct::LParen)) {
                    out.push(pp);
                    continue;
                }
                match self.collect_args(&def, &mut queue, pp.token.span) {
                    Some(args) => args,
                    None => continue,
                }
            } else {
                Vec::new()
            };

            let mut hide = (*pp.hide).clone();
            hide.insert(word);
            let hide = Rc::new(hide);
            let body = self.substitute(&def, &args, &pp.token);
            for (index, mut token) in body.into_iter().enumerate().rev() {
                token.span = pp.token.span;
                token.line_start = false;
                if index == 0 {
                    token.leading_space = pp.token.leading_space;
                }
                queue.push_front(PpToken {
                    token,
                    hide: hide.clone(),
                });
            }
        }
        out
    }

    /// Collect the arguments of a function-like invocation whose `(` is at
    /// the front of `queue`.
    fn collect_args(
        &mut self,
        def: &MacroDef,
        queue: &mut VecDeque<PpToken>,
        site: Span,
    ) -> Option<Vec<Vec<PpToken>>> {
        let params = def.params.as_ref().map(Vec::len).unwrap_or(0);
        queue.pop_front();
        let mut args: Vec<Vec<PpToken>> = vec![Vec::new()];
        let mut depth = 0usize;
        loop {
            let Some(pp) = queue.pop_front() else {
                self.diag.error(
                    site,
                    format!("unterminated function-like macro invocation of '{}'", def.name),
                );
                return None;
            };
            if pp.token.is_punct(Punct::LParen) {
                depth += 1;
            } else if pp.token.is_punct(Punct::RParen) {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            } else if pp.token.is_punct(Punct::Comma) && depth == 0 {
                let in_variadic_tail = def.variadic && args.len() > params;
                if !in_variadic_tail {
                    args.push(Vec::new());
                    continue;
                }
            }
            if let Some(last) = args.last_mut() {
                last.push(pp);
            }
        }

        if params == 0 && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        if def.variadic && args.len() == params {
            args.push(Vec::new());
        }
        let expected = params + def.variadic as usize;
        if args.len() != expected {
            let which = if args.len() > expected { "many" } else { "few" };
            self.diag.error(
                site,
                format!(
                    "too {which} arguments provided to function-like macro invocation of '{}'",
                    def.name
                ),
            );
            return None;
        }
        Some(args)
    }

    fn substitute(&mut self, def: &MacroDef, args: &[Vec<PpToken>], site: &Token) -> Vec<Token> {
        let raw = |index: usize| -> Vec<Token> {
            args.get(index)
                .map(|arg| arg.iter().map(|pp| pp.token.clone()).collect())
                .unwrap_or_default()
        };
        let mut expanded_args: Vec<Option<Vec<Token>>> = vec![None; args.len()];
        let mut out: Vec<Token> = Vec::new();
        let body = &def.body;
        let mut i = 0;
        while i < body.len() {
            let token = &body[i];

            if def.params.is_some() && token.is_punct(Punct::Hash) {
                if let Some(index) = body.get(i + 1).and_then(|t| def.param_index(t)) {
                    out.push(stringify(&raw(index), site.span));
                    i += 2;
                    continue;
                }
            }

            if token.is_punct(Punct::HashHash) && !out.is_empty() && i + 1 < body.len() {
                let next = &body[i + 1];
                let rhs = match def.param_index(next) {
                    Some(index) => raw(index),
                    None => vec![next.clone()],
                };
                i += 2;
                let mut rhs = rhs.into_iter();
                if let (Some(first), Some(lhs)) = (rhs.next(), out.pop()) {
                    out.push(self.paste(&lhs, &first));
                }
                out.extend(rhs);
                continue;
            }

            if let Some(index) = def.param_index(token) {
                let pasted_next = body.get(i + 1).is_some_and(|t| t.is_punct(Punct::HashHash));
                if pasted_next {
                    out.extend(raw(index));
                } else {
                    if expanded_args[index].is_none() {
                        let queue = args[index].iter().cloned().collect();
                        let tokens = self
                            .expand_queue(queue)
                            .into_iter()
                            .map(|pp| pp.token)
                            .collect();
                        expanded_args[index] = Some(tokens);
                    }
                    let mut tokens = expanded_args[index].clone().unwrap_or_default();
                    if let Some(first) = tokens.first_mut() {
                        first.leading_space = token.leading_space;
                    }
                    out.extend(tokens);
                }
                i += 1;
                continue;
            }

            out.push(token.clone());
            i += 1;
        }
        out
    }

    fn paste(&mut self, lhs: &Token, rhs: &Token) -> Token {
        let text = format!("{}{}", lhs.lexeme, rhs.lexeme);
        let mut tokens = tokenize(&text, lhs.span.file);
        if tokens.len() == 2 && !matches!(tokens[0].kind, TokenKind::Error(_)) {
            let mut token = tokens.remove(0);
            token.span = lhs.span;
            token.leading_space = lhs.leading_space;
            token.line_start = false;
            return token;
        }
        self.diag.error(
            lhs.span,
            format!("pasting formed '{text}', an invalid preprocessing token"),
        );
        lhs.clone()
    }
}

fn join_lexemes(tokens: &[Token]) -> String {
    let mut text = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && token.leading_space {
            text.push(' ');
        }
        text.push_str(&token.lexeme);
    }
    text
}

fn stringify(tokens: &[Token], span: Span) -> Token {
    let text = join_lexemes(tokens);
    string_token(&text, span)
}

fn string_token(text: &str, span: Span) -> Token {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    Token::new(
        TokenKind::String(text.to_string()),
        span,
        format!("\"{escaped}\""),
    )
}

fn int_token(value: u64, span: Span) -> Token {
    Token::new(
        TokenKind::Integer {
            value,
            suffix: IntSuffix {
                decimal: true,
                ..IntSuffix::default()
            },
        },
        span,
        value.to_string(),
    )
}

// ═══════════════════════════════════════════════════════════════════
// #if expression evaluation
// ═══════════════════════════════════════════════════════════════════

type CondResult = Result<i64, (String, Option<Span>)>;

struct ConditionParser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl ConditionParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, punct: Punct) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_full(&mut self) -> CondResult {
        if self.tokens.is_empty() {
            return Err(("expected value in expression".into(), None));
        }
        let value = self.ternary()?;
        if let Some(extra) = self.peek() {
            return Err((
                format!(
                    "token '{}' is not a valid binary operator in a preprocessor subexpression",
                    extra.lexeme
                ),
                Some(extra.span),
            ));
        }
        Ok(value)
    }

    fn ternary(&mut self) -> CondResult {
        let cond = self.binary(0)?;
        if self.eat(Punct::Question) {
            let then = self.ternary()?;
            if !self.eat(Punct::Colon) {
                return Err(("expected ':' in conditional expression".into(), self.peek().map(|t| t.span)));
            }
            let otherwise = self.ternary()?;
            return Ok(if cond != 0 { then } else { otherwise });
        }
        Ok(cond)
    }

    fn binary(&mut self, min_prec: u8) -> CondResult {
        let mut lhs = self.unary()?;
        loop {
            let Some(TokenKind::Punct(op)) = self.peek().map(|t| &t.kind) else {
                break;
            };
            let op = *op;
            let Some(prec) = binary_precedence(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let at = self.peek().map(|t| t.span);
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = match op {
                Punct::PipePipe => ((lhs != 0) || (rhs != 0)) as i64,
                Punct::AmpAmp => ((lhs != 0) && (rhs != 0)) as i64,
                Punct::Pipe => lhs | rhs,
                Punct::Caret => lhs ^ rhs,
                Punct::Amp => lhs & rhs,
                Punct::EqEq => (lhs == rhs) as i64,
                Punct::Ne => (lhs != rhs) as i64,
                Punct::Lt => (lhs < rhs) as i64,
                Punct::Gt => (lhs > rhs) as i64,
                Punct::Le => (lhs <= rhs) as i64,
                Punct::Ge => (lhs >= rhs) as i64,
                Punct::Shl => lhs.wrapping_shl(rhs as u32),
                Punct::Shr => lhs.wrapping_shr(rhs as u32),
                Punct::Plus => lhs.wrapping_add(rhs),
                Punct::Minus => lhs.wrapping_sub(rhs),
                Punct::Star => lhs.wrapping_mul(rhs),
                Punct::Slash | Punct::Percent => {
                    if rhs == 0 {
                        return Err(("division by zero in preprocessor expression".into(), at));
                    }
                    if op == Punct::Slash {
                        lhs.wrapping_div(rhs)
                    } else {
                        lhs.wrapping_rem(rhs)
                    }
                }
                _ => break,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> CondResult {
        let Some(token) = self.peek().cloned() else {
            return Err(("expected value in expression".into(), None));
        };
        self.pos += 1;
        match &token.kind {
            TokenKind::Punct(Punct::Bang) => Ok((self.unary()? == 0) as i64),
            TokenKind::Punct(Punct::Tilde) => Ok(!self.unary()?),
            TokenKind::Punct(Punct::Minus) => Ok(self.unary()?.wrapping_neg()),
            TokenKind::Punct(Punct::Plus) => self.unary(),
            TokenKind::Punct(Punct::LParen) => {
                let value = self.ternary()?;
                if !self.eat(Punct::RParen) {
                    return Err(("expected ')' in preprocessor expression".into(), Some(token.span)));
                }
                Ok(value)
            }
            TokenKind::Integer { value, .. } => Ok(*value as i64),
            TokenKind::Char(value) => Ok(*value),
            TokenKind::Keyword(Keyword::True) => Ok(1),
            // Identifiers left after expansion evaluate to zero.
            TokenKind::Identifier(_) | TokenKind::Keyword(_) => Ok(0),
            _ => Err((
                format!("invalid token '{}' at start of a preprocessor expression", token.lexeme),
                Some(token.span),
            )),
        }
    }
}

fn binary_precedence(op: Punct) -> Option<u8> {
    Some(match op {
        Punct::PipePipe => 1,
        Punct::AmpAmp => 2,
        Punct::Pipe => 3,
        Punct::Caret => 4,
        Punct::Amp => 5,
        Punct::EqEq | Punct::Ne => 6,
        Punct::Lt | Punct::Gt | Punct::Le | Punct::Ge => 7,
        Punct::Shl | Punct::Shr => 8,
        Punct::Plus | Punct::Minus => 9,
        Punct::Star | Punct::Slash | Punct::Percent => 10,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{CollectingSink, Severity};
    use crate::vfs::MemoryFileSystem;

    fn run(fs: &MemoryFileSystem, main: &str, sink: &CollectingSink) -> Option<PreprocessOutput> {
        let dirs = vec![PathBuf::from("include")];
        let mut diag = DiagnosticEngine::new(sink);
        let mut pp = Preprocessor::new(fs, &dirs, &mut diag);
        pp.define_text("HOST_FLAG", "1");
        let result = pp.process_text(Path::new("main.cpp"), main);
        let (output, _) = pp.finish();
        result.ok().map(|_| output)
    }

    fn text(output: &PreprocessOutput) -> String {
        output
            .tokens
            .iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.lexeme.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn object_and_function_macros() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(
            &fs,
            "#define N 40\n#define ADD(a, b) ((a) + (b))\nint x = ADD(N, 2);",
            &sink,
        )
        .unwrap();
        assert_eq!(text(&out), "int x = ( ( 40 ) + ( 2 ) ) ;");
        assert!(!sink.has_errors());
    }

    #[test]
    fn self_reference_is_not_reexpanded() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(&fs, "#define foo foo + 1\nfoo", &sink).unwrap();
        assert_eq!(text(&out), "foo + 1");
    }

    #[test]
    fn stringify_and_paste() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(
            &fs,
            "#define STR(x) #x\n#define CAT(a, b) a ## b\nCAT(var, 1) STR(a + b)",
            &sink,
        )
        .unwrap();
        assert_eq!(out.tokens[0].kind, TokenKind::Identifier("var1".into()));
        assert_eq!(out.tokens[1].kind, TokenKind::String("a + b".into()));
    }

    #[test]
    fn variadic_macros() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(&fs, "#define CALL(f, ...) f(__VA_ARGS__)\nCALL(g, 1, 2)", &sink).unwrap();
        assert_eq!(text(&out), "g ( 1 , 2 )");
    }

    #[test]
    fn conditionals() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let src = "\
#if defined(HOST_FLAG) && HOST_FLAG > 0
a
#elif 1
b
#else
c
#endif
#ifdef MISSING
d
#else
e
#endif
#if 0
#if 1
f
#endif
#endif
";
        let out = run(&fs, src, &sink).unwrap();
        assert_eq!(text(&out), "a e");
        assert!(!sink.has_errors());
    }

    #[test]
    fn includes_and_pragma_once() {
        let fs = MemoryFileSystem::new();
        fs.write("include/lib.h", "#pragma once\nint lib;");
        fs.write("local.h", "#include <lib.h>\nint local;");
        let sink = CollectingSink::new();
        let out = run(
            &fs,
            "#include \"local.h\"\n#include <lib.h>\nint main_;",
            &sink,
        )
        .unwrap();
        assert_eq!(text(&out), "int lib ; int local ; int main_ ;");
    }

    #[test]
    fn missing_include_is_fatal() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        assert!(run(&fs, "#include \"nope.h\"\nint x;", &sink).is_none());
        assert!(sink.contains(Severity::Fatal, "'nope.h' file not found"));
    }

    #[test]
    fn pragmas() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(
            &fs,
            "#pragma comment(lib, \"user32\")\n#pragma pack(push)\nint x;",
            &sink,
        )
        .unwrap();
        assert_eq!(out.libraries, vec!["user32".to_string()]);
        assert_eq!(sink.count(Severity::Ignored), 1);
    }

    #[test]
    fn error_and_warning_directives() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        run(&fs, "#warning careful here\n#error stop now\n", &sink).unwrap();
        assert!(sink.contains(Severity::Warning, "careful here"));
        assert!(sink.contains(Severity::Error, "stop now"));
    }

    #[test]
    fn line_macro() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        let out = run(&fs, "\n\n__LINE__", &sink).unwrap();
        assert!(matches!(out.tokens[0].kind, TokenKind::Integer { value: 3, .. }));
    }

    #[test]
    fn unterminated_conditional() {
        let fs = MemoryFileSystem::new();
        let sink = CollectingSink::new();
        run(&fs, "#if 1\nint x;", &sink).unwrap();
        assert!(sink.contains(Severity::Error, "unterminated conditional"));
    }
}
