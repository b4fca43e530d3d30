//! Lexer for Python test sources.
//!
//! Handles tokenization including:
//! - Identifiers, numeric and string literals (all prefixes, triple quotes)
//! - Operators and punctuation
//! - Indentation-based blocks (INDENT/DEDENT tokens)
//! - Implicit line continuation inside brackets and explicit `\` continuation
//!
//! Comments and blank lines produce no tokens. Every token carries the byte
//! span it was read from so the parser can slice original source text.

use super::SyntaxError;

// ============================================================================
// TOKEN TYPES
// ============================================================================

/// Byte range into the source the token was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Flavour of a string literal, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFlavor {
    Text,
    Bytes,
    Format,
}

/// Kind of token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number,
    String(StringFlavor),
    /// Operator or punctuation, stored by spelling (`=`, `==`, `(`, `.`, ...).
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

/// A token with its kind and source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn is_op(&self, spelling: &str) -> bool {
        matches!(self.kind, TokenKind::Op(op) if op == spelling)
    }

    pub fn is_name(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Name(n) if n == name)
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }
}

/// Operators, longest first so the scanner can take the first prefix match.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "@=", ":=", "<<", ">>", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ";", ".", "=",
];

// ============================================================================
// LEXER STATE
// ============================================================================

/// Python lexer over a complete source file.
pub struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    indent_stack: Vec<usize>,
    at_line_start: bool,
    /// Bracket depth for implicit line continuation (parens, brackets, braces)
    bracket_depth: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            indent_stack: vec![0],
            at_line_start: true,
            bracket_depth: 0,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the entire source. The stream always ends with `Newline`
    /// (if the last line had content), the pending `Dedent`s, then `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        while self.pos < self.source.len() {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_indentation()?;
                continue;
            }
            self.scan_token()?;
        }

        let end = self.source.len();
        if !matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Dedent) | Some(TokenKind::Indent)
        ) {
            self.tokens
                .push(Token::new(TokenKind::Newline, Span::new(end, end)));
        }
        if self.bracket_depth > 0 {
            return Err(SyntaxError::new("unexpected end of file inside brackets", end));
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.tokens
                .push(Token::new(TokenKind::Dedent, Span::new(end, end)));
        }
        self.tokens.push(Token::new(TokenKind::Eof, Span::new(end, end)));
        Ok(self.tokens)
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(offset)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.tokens.push(Token::new(kind, Span::new(start, self.pos)));
    }

    // ========================================================================
    // Indentation
    // ========================================================================

    /// Measure the indentation of the next line and emit INDENT/DEDENT tokens.
    /// Blank and comment-only lines are consumed without effect.
    fn handle_indentation(&mut self) -> Result<(), SyntaxError> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(()),
            Some('\n') | Some('\r') => {
                self.advance();
                return Ok(());
            }
            Some('#') => {
                self.skip_comment();
                return Ok(());
            }
            Some('\\') if matches!(self.peek_at(1), Some('\n') | Some('\r')) => {
                // A continuation on an otherwise empty line joins nothing.
                self.advance();
                self.skip_line_break();
                return Ok(());
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = self.indent_stack.last().copied().unwrap_or(0);
        if width > current {
            self.indent_stack.push(width);
            self.tokens
                .push(Token::new(TokenKind::Indent, Span::new(self.pos, self.pos)));
        } else if width < current {
            while self.indent_stack.last().copied().unwrap_or(0) > width {
                self.indent_stack.pop();
                self.tokens
                    .push(Token::new(TokenKind::Dedent, Span::new(self.pos, self.pos)));
            }
            if self.indent_stack.last().copied().unwrap_or(0) != width {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    self.pos,
                ));
            }
        }
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_line_break(&mut self) {
        if self.peek() == Some('\r') {
            self.advance();
        }
        if self.peek() == Some('\n') {
            self.advance();
        }
    }

    // ========================================================================
    // Main scanning dispatch
    // ========================================================================

    fn scan_token(&mut self) -> Result<(), SyntaxError> {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\x0c')) {
            self.advance();
        }

        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(());
        };

        match c {
            '#' => self.skip_comment(),
            '\r' | '\n' => {
                self.skip_line_break();
                if self.bracket_depth == 0 {
                    self.tokens
                        .push(Token::new(TokenKind::Newline, Span::new(start, self.pos)));
                    self.at_line_start = true;
                }
            }
            '\\' => {
                self.advance();
                if !matches!(self.peek(), Some('\n') | Some('\r')) {
                    return Err(SyntaxError::new(
                        "unexpected character after line continuation",
                        start,
                    ));
                }
                self.skip_line_break();
            }
            '"' | '\'' => self.scan_string(start, StringFlavor::Text)?,
            '0'..='9' => self.scan_number(start),
            '.' if matches!(self.peek_at(1), Some('0'..='9')) => self.scan_number(start),
            _ if is_ident_start(c) => self.scan_identifier_or_prefixed_string(start)?,
            _ => self.scan_operator(start)?,
        }
        Ok(())
    }

    fn scan_operator(&mut self, start: usize) -> Result<(), SyntaxError> {
        let rest = &self.source[self.pos..];
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            let c = self.peek().unwrap_or('\0');
            return Err(SyntaxError::new(format!("unexpected character '{}'", c), start));
        };
        self.pos += op.len();
        match *op {
            "(" | "[" | "{" => self.bracket_depth += 1,
            ")" | "]" | "}" => {
                if self.bracket_depth == 0 {
                    return Err(SyntaxError::new("unmatched closing bracket", start));
                }
                self.bracket_depth -= 1;
            }
            _ => {}
        }
        self.push(TokenKind::Op(op), start);
        Ok(())
    }

    // ========================================================================
    // Identifiers and literals
    // ========================================================================

    fn scan_identifier_or_prefixed_string(&mut self, start: usize) -> Result<(), SyntaxError> {
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        let spelling = &self.source[start..self.pos];

        if matches!(self.peek(), Some('"') | Some('\'')) {
            if let Some(flavor) = string_prefix_flavor(spelling) {
                return self.scan_string(start, flavor);
            }
        }

        self.push(TokenKind::Name(spelling.to_string()), start);
        Ok(())
    }

    /// Scan a string literal whose prefix (if any) has already been consumed.
    fn scan_string(&mut self, start: usize, flavor: StringFlavor) -> Result<(), SyntaxError> {
        let quote = self.advance().unwrap_or('"');
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        loop {
            let Some(c) = self.advance() else {
                return Err(SyntaxError::new("unterminated string literal", start));
            };
            match c {
                // A backslash always protects the next character from closing
                // the literal, raw strings included.
                '\\' => {
                    self.advance();
                }
                '\n' if !triple => {
                    return Err(SyntaxError::new("unterminated string literal", start));
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.advance();
                        self.advance();
                        break;
                    }
                }
                _ => {}
            }
        }

        self.push(TokenKind::String(flavor), start);
        Ok(())
    }

    fn scan_number(&mut self, start: usize) {
        let radix_prefixed = self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.advance();
                if !radix_prefixed
                    && matches!(c, 'e' | 'E')
                    && matches!(self.peek(), Some('+') | Some('-'))
                {
                    self.advance();
                }
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, start);
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Classify a string prefix (`r`, `b`, `f`, `rb`, `Rf`, ...).
fn string_prefix_flavor(prefix: &str) -> Option<StringFlavor> {
    let lower = prefix.to_ascii_lowercase();
    match lower.as_str() {
        "r" | "u" => Some(StringFlavor::Text),
        "b" | "br" | "rb" => Some(StringFlavor::Bytes),
        "f" | "fr" | "rf" => Some(StringFlavor::Format),
        _ => None,
    }
}

/// Convenience function to lex a source string.
pub fn lex(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lex_simple_assignment() {
        assert_eq!(
            kinds("x = 5\n"),
            vec![
                TokenKind::Name("x".to_string()),
                TokenKind::Op("="),
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_indent_and_dedent() {
        let tokens = kinds("def f():\n    pass\nx = 1\n");
        assert!(tokens.contains(&TokenKind::Indent));
        assert!(tokens.contains(&TokenKind::Dedent));
        let indent = tokens.iter().position(|k| *k == TokenKind::Indent).unwrap();
        let dedent = tokens.iter().position(|k| *k == TokenKind::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn test_lex_skips_comments_and_blank_lines() {
        let tokens = kinds("# header\n\nx = 1  # trailing\n\n   # indented comment\ny = 2\n");
        let newlines = tokens.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newlines, 2);
        assert!(!tokens.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_lex_brackets_join_lines() {
        let tokens = kinds("x = foo(\n    1,\n    2,\n)\n");
        let newlines = tokens.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_lex_backslash_continuation() {
        let tokens = kinds("x = 1 + \\\n    2\n");
        let newlines = tokens.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_lex_string_flavors() {
        assert_eq!(kinds("'a'")[0], TokenKind::String(StringFlavor::Text));
        assert_eq!(kinds("r'a\\''")[0], TokenKind::String(StringFlavor::Text));
        assert_eq!(kinds("b'a'")[0], TokenKind::String(StringFlavor::Bytes));
        assert_eq!(kinds("f\"{x}\"")[0], TokenKind::String(StringFlavor::Format));
        assert_eq!(kinds("Rb'a'")[0], TokenKind::String(StringFlavor::Bytes));
    }

    #[test]
    fn test_lex_triple_quoted_string_spans_lines() {
        let source = "x = \"\"\"line one\nline \"two\"\n\"\"\"\n";
        let tokens = lex(source).unwrap();
        let string = tokens
            .iter()
            .find(|t| matches!(t.kind, TokenKind::String(_)))
            .unwrap();
        assert_eq!(&source[string.span.start..string.span.end], "\"\"\"line one\nline \"two\"\n\"\"\"");
    }

    #[test]
    fn test_lex_numbers() {
        let source = "a = 0x1F + 1_000 + 1.5e-3 + .5 + 3j\n";
        let tokens = lex(source).unwrap();
        let numbers: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Number)
            .map(|t| &source[t.span.start..t.span.end])
            .collect();
        assert_eq!(numbers, vec!["0x1F", "1_000", "1.5e-3", ".5", "3j"]);
    }

    #[test]
    fn test_lex_longest_operator_match() {
        let tokens = kinds("a **= b // c == d\n");
        assert!(tokens.contains(&TokenKind::Op("**=")));
        assert!(tokens.contains(&TokenKind::Op("//")));
        assert!(tokens.contains(&TokenKind::Op("==")));
    }

    #[test]
    fn test_lex_inconsistent_dedent_is_error() {
        let result = lex("if x:\n        a = 1\n    b = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_lex_unterminated_string_is_error() {
        let err = lex("x = 'abc\n").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_lex_unmatched_bracket_is_error() {
        assert!(lex("x = 1)\n").is_err());
        assert!(lex("x = (1\n").is_err());
    }
}
