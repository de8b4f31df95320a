/// Lexer for the C/C++ dialect accepted by the frontend.
///
/// The [`Lexer`] works over one file's text and implements [`Iterator`]
/// over [`Token`]s, ending with a single `Eof`. It tracks byte offset,
/// line and column for every token, and records whether a token starts
/// its line so the preprocessor can recognize directives.
///
/// # Trivia
///
/// | Syntax         | Handling                                   |
/// |----------------|--------------------------------------------|
/// | `// …`         | Skipped to end of line                     |
/// | `/* … */`      | Skipped, counts as a single space          |
/// | `\` + newline  | Line splice, counts as a single space      |
///
/// # Literals
///
/// | Form                  | Token                                  |
/// |-----------------------|----------------------------------------|
/// | `42`, `0x2A`, `052`   | `Integer` with `u`/`l`/`ll` suffixes   |
/// | `0b101`, `1'000`      | `Integer` (binary, digit separators)   |
/// | `1.5`, `2e3`, `1.f`   | `Float`, `single` for an `f` suffix    |
/// | `'a'`, `'\n'`         | `Char`                                 |
/// | `"text"`              | `String` with escapes decoded          |
///
/// After `#include` at the start of a line, `<...>` is lexed as a single
/// `HeaderName`.
use crate::span::{FileId, Pos, Span};
use crate::token::{IntSuffix, Keyword, Punct, Token, TokenKind};

// ═══════════════════════════════════════════════════════════════════
// Lexer
// ═══════════════════════════════════════════════════════════════════

/// Where the lexer is relative to an `#include` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IncludeState {
    None,
    /// Saw `#` at the start of a line.
    Hash,
    /// Saw `# include`; a `<` now starts a header name.
    Include,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    file: FileId,
    offset: usize,
    line: usize,
    column: usize,
    at_line_start: bool,
    include: IncludeState,
    emitted_eof: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str, file: FileId) -> Self {
        Self {
            src: text.as_bytes(),
            text,
            file,
            offset: 0,
            line: 1,
            column: 1,
            at_line_start: true,
            include: IncludeState::None,
            emitted_eof: false,
        }
    }

    fn pos(&self) -> Pos {
        Pos::new(self.offset, self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.offset).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<u8> {
        self.src.get(self.offset + n).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.offset += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn span_from(&self, start: Pos) -> Span {
        Span::new(self.file, start, self.pos())
    }

    fn lexeme_from(&self, start: Pos) -> &'a str {
        self.text.get(start.offset..self.offset).unwrap_or("")
    }

    /// Skip whitespace and comments. Returns `(saw_space, saw_newline)`.
    fn skip_trivia(&mut self) -> (bool, bool) {
        let mut space = false;
        let mut newline = false;
        loop {
            match (self.peek(), self.peek_ahead(1)) {
                (Some(b' ' | b'\t' | b'\r' | b'\x0c' | b'\x0b'), _) => {
                    self.advance();
                    space = true;
                }
                (Some(b'\n'), _) => {
                    self.advance();
                    space = true;
                    newline = true;
                }
                (Some(b'\\'), Some(b'\n')) => {
                    self.advance();
                    self.advance();
                    space = true;
                }
                (Some(b'\\'), Some(b'\r')) if self.peek_ahead(2) == Some(b'\n') => {
                    self.advance();
                    self.advance();
                    self.advance();
                    space = true;
                }
                (Some(b'/'), Some(b'/')) => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                    space = true;
                }
                (Some(b'/'), Some(b'*')) => {
                    self.advance();
                    self.advance();
                    loop {
                        match (self.peek(), self.peek_ahead(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => break,
                        }
                    }
                    space = true;
                }
                _ => return (space, newline),
            }
        }
    }

    fn lex_token(&mut self) -> Token {
        let (space, newline) = self.skip_trivia();
        if newline {
            self.at_line_start = true;
            self.include = IncludeState::None;
        }
        let line_start = self.at_line_start;
        let start = self.pos();

        let kind = match self.peek() {
            None => TokenKind::Eof,
            Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => self.lex_word(),
            Some(b) if b.is_ascii_digit() => self.lex_number(start),
            Some(b'.') if self.peek_ahead(1).is_some_and(|b| b.is_ascii_digit()) => {
                self.lex_number(start)
            }
            Some(b'"') => self.lex_string(),
            Some(b'\'') => self.lex_char(),
            Some(b'<') if self.include == IncludeState::Include => self.lex_header_name(),
            Some(_) => self.lex_punct(),
        };

        self.include = match (&kind, self.include) {
            (TokenKind::Punct(Punct::Hash), _) if line_start => IncludeState::Hash,
            (TokenKind::Identifier(word), IncludeState::Hash)
                if word == "include" || word == "include_next" =>
            {
                IncludeState::Include
            }
            _ => IncludeState::None,
        };
        self.at_line_start = false;

        let lexeme = self.lexeme_from(start).to_string();
        Token {
            kind,
            span: self.span_from(start),
            lexeme,
            line_start,
            leading_space: space,
        }
    }

    fn lex_word(&mut self) -> TokenKind {
        let start = self.offset;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' {
                self.advance();
            } else {
                break;
            }
        }
        let word = self.text.get(start..self.offset).unwrap_or("");
        match Keyword::from_word(word) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier(word.to_string()),
        }
    }

    fn lex_number(&mut self, start: Pos) -> TokenKind {
        // Scan a whole preprocessing number first, then interpret it.
        let hex = matches!(
            (self.peek(), self.peek_ahead(1)),
            (Some(b'0'), Some(b'x' | b'X'))
        );
        while let Some(b) = self.peek() {
            let prev = self.src[self.offset.saturating_sub(1)];
            let exponent_sign = matches!(b, b'+' | b'-')
                && self.offset > start.offset
                && ((matches!(prev, b'e' | b'E') && !hex) || matches!(prev, b'p' | b'P'));
            let separator = b == b'\''
                && self.peek_ahead(1).is_some_and(|n| n.is_ascii_alphanumeric());
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || exponent_sign || separator
            {
                self.advance();
            } else {
                break;
            }
        }
        let raw: String = self
            .lexeme_from(start)
            .chars()
            .filter(|c| *c != '\'')
            .collect();
        parse_number(&raw)
    }

    fn lex_escape(&mut self) -> Result<u32, String> {
        // Leading backslash already consumed.
        let Some(b) = self.advance() else {
            return Err("unterminated escape sequence".into());
        };
        Ok(match b {
            b'n' => 0x0a,
            b't' => 0x09,
            b'r' => 0x0d,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'\\' => 0x5c,
            b'\'' => 0x27,
            b'"' => 0x22,
            b'?' => 0x3f,
            b'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while let Some(d) = self.peek().and_then(|c| (c as char).to_digit(16)) {
                    self.advance();
                    value = value.wrapping_mul(16).wrapping_add(d);
                    digits += 1;
                }
                if digits == 0 {
                    return Err("\\x used with no following hex digits".into());
                }
                value & 0xff
            }
            b'0'..=b'7' => {
                let mut value = (b - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            self.advance();
                            value = value * 8 + (d - b'0') as u32;
                        }
                        _ => break,
                    }
                }
                value & 0xff
            }
            other => return Err(format!("unknown escape sequence '\\{}'", other as char)),
        })
    }

    fn lex_string(&mut self) -> TokenKind {
        self.advance();
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return TokenKind::Error("missing terminating '\"' character".into()),
                Some(b'"') => {
                    self.advance();
                    return TokenKind::String(out);
                }
                Some(b'\\') => {
                    self.advance();
                    match self.lex_escape() {
                        Ok(code) => out.push(char::from_u32(code).unwrap_or('\u{FFFD}')),
                        Err(message) => return TokenKind::Error(message),
                    }
                }
                Some(_) => {
                    let ch = self.text[self.offset..].chars().next().unwrap_or('\u{FFFD}');
                    for _ in 0..ch.len_utf8() {
                        self.advance();
                    }
                    out.push(ch);
                }
            }
        }
    }

    fn lex_char(&mut self) -> TokenKind {
        self.advance();
        let value = match self.peek() {
            None | Some(b'\n') => return TokenKind::Error("missing terminating ' character".into()),
            Some(b'\'') => {
                self.advance();
                return TokenKind::Error("empty character constant".into());
            }
            Some(b'\\') => {
                self.advance();
                match self.lex_escape() {
                    Ok(code) => code as i64,
                    Err(message) => return TokenKind::Error(message),
                }
            }
            Some(_) => {
                let ch = self.text[self.offset..].chars().next().unwrap_or('\u{FFFD}');
                for _ in 0..ch.len_utf8() {
                    self.advance();
                }
                ch as i64
            }
        };
        if self.peek() != Some(b'\'') {
            while let Some(b) = self.peek() {
                if b == b'\'' || b == b'\n' {
                    break;
                }
                self.advance();
            }
            if self.peek() == Some(b'\'') {
                self.advance();
            }
            return TokenKind::Error("multi-character character constant".into());
        }
        self.advance();
        TokenKind::Char(value)
    }

    fn lex_header_name(&mut self) -> TokenKind {
        self.advance();
        let start = self.offset;
        while let Some(b) = self.peek() {
            if b == b'>' || b == b'\n' {
                break;
            }
            self.advance();
        }
        if self.peek() != Some(b'>') {
            return TokenKind::Error("expected '>' after header name".into());
        }
        let name = self.text.get(start..self.offset).unwrap_or("").to_string();
        self.advance();
        TokenKind::HeaderName(name)
    }

    fn lex_punct(&mut self) -> TokenKind {
        let rest = &self.src[self.offset..];
        for (spelling, punct) in Punct::TABLE {
            if rest.starts_with(spelling.as_bytes()) {
                for _ in 0..spelling.len() {
                    self.advance();
                }
                return TokenKind::Punct(*punct);
            }
        }
        let ch = self.text[self.offset..].chars().next().unwrap_or('\u{FFFD}');
        for _ in 0..ch.len_utf8().max(1) {
            self.advance();
        }
        TokenKind::Error(format!("unexpected character '{ch}'"))
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.emitted_eof {
            return None;
        }
        let token = self.lex_token();
        if token.is_eof() {
            self.emitted_eof = true;
        }
        Some(token)
    }
}

/// Lex a whole file, including the trailing `Eof`.
pub fn tokenize(text: &str, file: FileId) -> Vec<Token> {
    Lexer::new(text, file).collect()
}

// ═══════════════════════════════════════════════════════════════════
// Numbers
// ═══════════════════════════════════════════════════════════════════

/// Interpret a preprocessing number with separators already removed.
pub fn parse_number(raw: &str) -> TokenKind {
    let lower = raw.to_ascii_lowercase();
    let hex = lower.starts_with("0x");
    let is_float = if hex {
        lower.contains('.') || lower.contains('p')
    } else {
        lower.contains('.') || lower.contains('e')
    };
    if is_float {
        if hex {
            return TokenKind::Error("hexadecimal floating literals are not supported".into());
        }
        let (digits, single) = match lower.strip_suffix('f') {
            Some(digits) => (digits, true),
            None => (lower.strip_suffix('l').unwrap_or(&lower), false),
        };
        return match digits.parse::<f64>() {
            Ok(value) => TokenKind::Float { value, single },
            Err(_) => TokenKind::Error(format!("invalid floating literal '{raw}'")),
        };
    }

    let (radix, body) = if hex {
        (16, &lower[2..])
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };

    let digits_end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    let (digits, suffix_text) = body.split_at(digits_end);
    let mut suffix = IntSuffix {
        decimal: radix == 10,
        ..IntSuffix::default()
    };
    let mut rest = suffix_text;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("ll") {
            if suffix.longs != 0 {
                return TokenKind::Error(format!("invalid suffix on integer literal '{raw}'"));
            }
            suffix.longs = 2;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('l') {
            if suffix.longs != 0 {
                return TokenKind::Error(format!("invalid suffix on integer literal '{raw}'"));
            }
            suffix.longs = 1;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('u') {
            if suffix.unsigned {
                return TokenKind::Error(format!("invalid suffix on integer literal '{raw}'"));
            }
            suffix.unsigned = true;
            rest = r;
        } else {
            return TokenKind::Error(format!("invalid suffix on integer literal '{raw}'"));
        }
    }
    if digits.is_empty() {
        // A lone `0` parsed as octal with an empty body.
        if radix == 8 {
            return TokenKind::Integer { value: 0, suffix };
        }
        return TokenKind::Error(format!("invalid integer literal '{raw}'"));
    }
    match u64::from_str_radix(digits, radix) {
        Ok(value) => TokenKind::Integer { value, suffix },
        Err(_) => TokenKind::Error(format!("integer literal '{raw}' is too large")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, FileId(0)).into_iter().map(|t| t.kind).collect()
    }

    fn int(value: u64) -> TokenKind {
        TokenKind::Integer {
            value,
            suffix: IntSuffix {
                decimal: true,
                ..IntSuffix::default()
            },
        }
    }

    #[test]
    fn lex_words_and_keywords() {
        assert_eq!(
            kinds("int add1"),
            vec![
                TokenKind::Keyword(Keyword::Int),
                TokenKind::Identifier("add1".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_integers() {
        assert_eq!(kinds("42"), vec![int(42), TokenKind::Eof]);
        assert_eq!(kinds("1'000"), vec![int(1000), TokenKind::Eof]);
        match &kinds("0x2Aull")[0] {
            TokenKind::Integer { value, suffix } => {
                assert_eq!(*value, 42);
                assert!(suffix.unsigned);
                assert_eq!(suffix.longs, 2);
                assert!(!suffix.decimal);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(kinds("017")[0], TokenKind::Integer { value: 15, .. }));
        assert!(matches!(kinds("0b101")[0], TokenKind::Integer { value: 5, .. }));
        assert!(matches!(kinds("0")[0], TokenKind::Integer { value: 0, .. }));
        assert!(matches!(kinds("12abc")[0], TokenKind::Error(_)));
    }

    #[test]
    fn lex_floats() {
        assert_eq!(
            kinds("1.5 2e3 .25f"),
            vec![
                TokenKind::Float { value: 1.5, single: false },
                TokenKind::Float { value: 2000.0, single: false },
                TokenKind::Float { value: 0.25, single: true },
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("1e-2"),
            vec![TokenKind::Float { value: 0.01, single: false }, TokenKind::Eof]
        );
    }

    #[test]
    fn lex_strings_and_chars() {
        assert_eq!(
            kinds(r#""a\tb\x41" '\n' 'z'"#),
            vec![
                TokenKind::String("a\tbA".into()),
                TokenKind::Char(10),
                TokenKind::Char('z' as i64),
                TokenKind::Eof
            ]
        );
        assert!(matches!(kinds("\"open")[0], TokenKind::Error(_)));
        assert!(matches!(kinds("''")[0], TokenKind::Error(_)));
    }

    #[test]
    fn lex_longest_punctuator() {
        assert_eq!(
            kinds("a<<=b::c->d..."),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Punct(Punct::ShlAssign),
                TokenKind::Identifier("b".into()),
                TokenKind::Punct(Punct::ColonColon),
                TokenKind::Identifier("c".into()),
                TokenKind::Punct(Punct::Arrow),
                TokenKind::Identifier("d".into()),
                TokenKind::Punct(Punct::Ellipsis),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_and_splices_are_trivia() {
        assert_eq!(
            kinds("a // line\n/* block\n */ b \\\n c"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Identifier("b".into()),
                TokenKind::Identifier("c".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn line_start_flags() {
        let tokens = tokenize("#define X 1\n  # if X\nint y;", FileId(0));
        let starts: Vec<bool> = tokens.iter().map(|t| t.line_start).collect();
        assert_eq!(
            starts,
            vec![true, false, false, false, true, false, false, true, false, false, false]
        );
        assert_eq!(tokens[4].span.start.line, 2);
        assert_eq!(tokens[4].span.start.column, 3);
    }

    #[test]
    fn header_names_only_after_include() {
        let tokens = kinds("#include <sys/types.h>\na < b");
        assert_eq!(tokens[2], TokenKind::HeaderName("sys/types.h".into()));
        assert_eq!(tokens[4], TokenKind::Punct(Punct::Lt));
    }

    #[test]
    fn unexpected_character() {
        assert!(matches!(&kinds("@")[0], TokenKind::Error(m) if m.contains('@')));
    }
}
