//! Statement-level parser.
//!
//! Works on the token stream from [`super::lexer`]. Each logical line is
//! either a compound statement header (followed by an indented suite or an
//! inline suite) or a `;`-separated run of simple statements. Expression text
//! is sliced straight out of the source so rewrites never disturb code they
//! do not touch.

use super::ast::{
    Alias, Assign, Block, Clause, Decorator, Expr, FunctionDef, Import, Module, Stmt, With,
    WithItem,
};
use super::lexer::{lex, StringFlavor, Token, TokenKind};
use super::SyntaxError;
use crate::fuzz::PrimitiveKind;

/// Keywords that introduce a continuation clause of the preceding block.
const CONTINUATION_CLAUSES: &[&str] = &["elif", "else", "except", "finally"];

/// Parse a complete source file.
pub fn parse_module(source: &str) -> Result<Module, SyntaxError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(source, &tokens);
    let body = parser.statements_until_end()?;
    Ok(Module { body })
}

/// Parser state.
struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    // ========================================================================
    // Token cursor
    // ========================================================================

    fn peek(&self) -> &'a Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &'a TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> &'a Token {
        let last = self.tokens.len().saturating_sub(1);
        let token = &self.tokens[self.pos.min(last)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.peek().span.start
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), SyntaxError> {
        if *self.peek_kind() == kind {
            self.advance();
            Ok(())
        } else {
            Err(SyntaxError::new(format!("expected {}", what), self.offset()))
        }
    }

    /// Source text covered by `tokens`, from the first start to the last end.
    fn text(&self, tokens: &[Token]) -> String {
        match (tokens.first(), tokens.last()) {
            (Some(first), Some(last)) => self.source[first.span.start..last.span.end].to_string(),
            _ => String::new(),
        }
    }

    /// Tokens up to (not including) the next `Newline` at the current level.
    fn logical_line(&mut self) -> &'a [Token] {
        let start = self.pos;
        while !matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Eof) {
            self.advance();
        }
        &self.tokens[start..self.pos]
    }

    // ========================================================================
    // Statement lists
    // ========================================================================

    fn statements_until_end(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => {
                    return Err(SyntaxError::new("unexpected indent", self.offset()));
                }
                TokenKind::Dedent => {
                    self.advance();
                }
                _ => self.statement(&mut body)?,
            }
        }
        Ok(body)
    }

    /// Parse a suite after a compound header's colon.
    fn suite(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        if *self.peek_kind() != TokenKind::Newline {
            // Inline suite: `if x: return 1`
            let line = self.logical_line();
            self.simple_statements(line, &mut body)?;
            self.expect(TokenKind::Newline, "newline")?;
            return Ok(body);
        }

        self.advance();
        self.expect(TokenKind::Indent, "an indented block")?;
        loop {
            match self.peek_kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => {
                    return Err(SyntaxError::new("unexpected indent", self.offset()));
                }
                _ => self.statement(&mut body)?,
            }
        }
        Ok(body)
    }

    fn statement(&mut self, body: &mut Vec<Stmt>) -> Result<(), SyntaxError> {
        let decorators = self.decorators()?;
        let first = self.peek().clone();
        let keyword = first.name().unwrap_or_default().to_string();
        let is_async = keyword == "async";
        let effective = if is_async {
            self.tokens
                .get(self.pos + 1)
                .and_then(Token::name)
                .unwrap_or_default()
                .to_string()
        } else {
            keyword.clone()
        };

        if effective == "def" {
            body.push(Stmt::FunctionDef(self.function_def(decorators, is_async)?));
            return Ok(());
        }
        if !decorators.is_empty() && effective != "class" {
            return Err(SyntaxError::new(
                "decorator must precede a function or class",
                first.span.start,
            ));
        }

        match effective.as_str() {
            "with" => body.push(Stmt::With(self.with_statement(is_async)?)),
            "if" | "for" | "while" | "try" | "class" => {
                body.push(Stmt::Block(self.block(decorators)?));
            }
            "match" | "case" if self.line_is_compound_header() => {
                body.push(Stmt::Block(self.block(decorators)?));
            }
            "elif" | "else" | "except" | "finally" => {
                return Err(SyntaxError::new(
                    format!("'{}' without a matching block", effective),
                    first.span.start,
                ));
            }
            _ => {
                let line = self.logical_line();
                self.simple_statements(line, body)?;
                self.expect(TokenKind::Newline, "newline")?;
            }
        }
        Ok(())
    }

    fn decorators(&mut self) -> Result<Vec<Decorator>, SyntaxError> {
        let mut decorators = Vec::new();
        while self.peek().is_op("@") {
            self.advance();
            let line = self.logical_line();
            if line.is_empty() {
                return Err(SyntaxError::new("empty decorator", self.offset()));
            }
            decorators.push(Decorator {
                text: self.text(line),
                tail: callee_tail(line),
            });
            self.expect(TokenKind::Newline, "newline after decorator")?;
        }
        Ok(decorators)
    }

    /// Whether the current logical line ends with a depth-0 colon.
    fn line_is_compound_header(&self) -> bool {
        let mut depth = 0usize;
        let mut last_top_level = None;
        for token in &self.tokens[self.pos..] {
            match &token.kind {
                TokenKind::Newline | TokenKind::Eof => break,
                TokenKind::Op("(" | "[" | "{") => depth += 1,
                TokenKind::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                _ => {}
            }
            if depth == 0 {
                last_top_level = Some(token);
            }
        }
        last_top_level.is_some_and(|t| t.is_op(":"))
    }

    // ========================================================================
    // Compound statements
    // ========================================================================

    /// Consume header tokens up to the colon that closes the header.
    fn header(&mut self) -> Result<&'a [Token], SyntaxError> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut pending_lambdas = 0usize;
        loop {
            let token = self.peek();
            match &token.kind {
                TokenKind::Newline | TokenKind::Eof => {
                    return Err(SyntaxError::new("expected ':'", token.span.start));
                }
                TokenKind::Op("(" | "[" | "{") => depth += 1,
                TokenKind::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                TokenKind::Name(n) if n == "lambda" && depth == 0 => pending_lambdas += 1,
                TokenKind::Op(":") if depth == 0 => {
                    if pending_lambdas == 0 {
                        let header = &self.tokens[start..self.pos];
                        self.advance();
                        return Ok(header);
                    }
                    pending_lambdas -= 1;
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn function_def(
        &mut self,
        decorators: Vec<Decorator>,
        is_async: bool,
    ) -> Result<FunctionDef, SyntaxError> {
        if is_async {
            self.advance();
        }
        self.advance(); // def
        let name = match &self.advance().kind {
            TokenKind::Name(n) => n.clone(),
            _ => return Err(SyntaxError::new("expected function name", self.offset())),
        };

        let header = self.header()?;
        let open = header
            .first()
            .filter(|t| t.is_op("("))
            .ok_or_else(|| SyntaxError::new("expected '(' after function name", self.offset()))?;
        let close = matching_close(header, 0)
            .ok_or_else(|| SyntaxError::new("unbalanced parameter list", open.span.start))?;
        let params = self.text(&header[1..close]);
        let returns = match header.get(close + 1) {
            Some(arrow) if arrow.is_op("->") => Some(self.text(&header[close + 2..])),
            Some(other) => {
                return Err(SyntaxError::new("unexpected token after parameters", other.span.start))
            }
            None => None,
        };

        let body = self.suite()?;
        Ok(FunctionDef {
            decorators,
            is_async,
            name,
            params,
            returns,
            body,
        })
    }

    fn with_statement(&mut self, is_async: bool) -> Result<With, SyntaxError> {
        if is_async {
            self.advance();
        }
        self.advance(); // with
        let header = self.header()?;

        // Parenthesized item lists: `with (a as b, c):`
        let items_tokens = match matching_close(header, 0) {
            Some(close) if header[0].is_op("(") && close + 1 == header.len() && has_top_level_as(&header[1..close]) => {
                &header[1..close]
            }
            _ => header,
        };

        let mut items = Vec::new();
        for item in split_top_level(items_tokens, ",") {
            if item.is_empty() {
                continue;
            }
            let as_pos = top_level_position(item, |t| t.is_name("as"));
            let (context, alias) = match as_pos {
                Some(i) => (&item[..i], Some(self.text(&item[i + 1..]))),
                None => (item, None),
            };
            items.push(WithItem {
                context: self.text(context),
                call_attr: call_attribute(context),
                alias,
            });
        }

        let body = self.suite()?;
        Ok(With {
            is_async,
            items,
            body,
        })
    }

    fn block(&mut self, decorators: Vec<Decorator>) -> Result<Block, SyntaxError> {
        let mut clauses = Vec::new();
        let header = self.header()?;
        let header = self.text(header);
        let body = self.suite()?;
        clauses.push(Clause::new(header, body));

        while self
            .peek()
            .name()
            .is_some_and(|keyword| CONTINUATION_CLAUSES.contains(&keyword))
        {
            let header = self.header()?;
            let header = self.text(header);
            let body = self.suite()?;
            clauses.push(Clause::new(header, body));
        }

        Ok(Block {
            decorators,
            clauses,
        })
    }

    // ========================================================================
    // Simple statements
    // ========================================================================

    fn simple_statements(
        &self,
        line: &'a [Token],
        body: &mut Vec<Stmt>,
    ) -> Result<(), SyntaxError> {
        for part in split_top_level(line, ";") {
            if part.is_empty() {
                continue;
            }
            body.push(self.simple_statement(part)?);
        }
        Ok(())
    }

    fn simple_statement(&self, tokens: &'a [Token]) -> Result<Stmt, SyntaxError> {
        let first = &tokens[0];
        if first.is_name("import") {
            return self.plain_import(&tokens[1..]).map(Stmt::Import);
        }
        if first.is_name("from") && tokens.iter().any(|t| t.is_name("import")) {
            return self.from_import(tokens).map(Stmt::Import);
        }
        if first.is_name("assert") {
            return Ok(Stmt::Assert(self.text(&tokens[1..])));
        }

        let assigns: Vec<usize> = top_level_positions(tokens, |t| t.is_op("="));
        if let Some(targets) = simple_targets(tokens, &assigns) {
            let eq = assigns[assigns.len() - 1];
            let value_tokens = &tokens[eq + 1..];
            if value_tokens.is_empty() {
                return Err(SyntaxError::new("expected value after '='", tokens[eq].span.end));
            }
            let literal = literal_kind(self.source, value_tokens);
            // Chained targets only matter for literal sites.
            if targets.len() == 1 || literal.is_some() {
                let value = match literal {
                    Some(kind) => Expr::Literal {
                        kind,
                        text: self.text(value_tokens),
                    },
                    None => Expr::Source(self.text(value_tokens)),
                };
                let mut targets = targets.into_iter();
                let mut assign = Assign::new(targets.next().unwrap_or_default(), value);
                assign.chained = targets.collect();
                return Ok(Stmt::Assign(assign));
            }
        }

        Ok(Stmt::Simple(self.text(tokens)))
    }

    fn plain_import(&self, tokens: &[Token]) -> Result<Import, SyntaxError> {
        let aliases = self.aliases(tokens)?;
        if aliases.is_empty() {
            return Err(SyntaxError::new("expected module name after 'import'", self.offset_of(tokens)));
        }
        Ok(Import::Plain(aliases))
    }

    fn from_import(&self, tokens: &[Token]) -> Result<Import, SyntaxError> {
        let import_at = tokens
            .iter()
            .position(|t| t.is_name("import"))
            .ok_or_else(|| SyntaxError::new("expected 'import'", self.offset_of(tokens)))?;
        let module: String = tokens[1..import_at]
            .iter()
            .map(|t| &self.source[t.span.start..t.span.end])
            .collect();
        if module.is_empty() {
            return Err(SyntaxError::new("expected module after 'from'", tokens[0].span.end));
        }

        let mut names = &tokens[import_at + 1..];
        if names.len() == 1 && names[0].is_op("*") {
            return Ok(Import::From {
                module,
                names: Vec::new(),
                star: true,
            });
        }
        if names.first().is_some_and(|t| t.is_op("(")) && names.last().is_some_and(|t| t.is_op(")")) {
            names = &names[1..names.len() - 1];
        }
        Ok(Import::From {
            module,
            names: self.aliases(names)?,
            star: false,
        })
    }

    fn aliases(&self, tokens: &[Token]) -> Result<Vec<Alias>, SyntaxError> {
        let mut aliases = Vec::new();
        for part in split_top_level(tokens, ",") {
            if part.is_empty() {
                continue;
            }
            let (name_tokens, asname) = match part.iter().position(|t| t.is_name("as")) {
                Some(i) => (
                    &part[..i],
                    part.get(i + 1).and_then(Token::name).map(str::to_string),
                ),
                None => (part, None),
            };
            let name: String = name_tokens
                .iter()
                .map(|t| &self.source[t.span.start..t.span.end])
                .collect();
            if name.is_empty() {
                return Err(SyntaxError::new("expected imported name", part[0].span.start));
            }
            aliases.push(Alias::new(name, asname));
        }
        Ok(aliases)
    }

    fn offset_of(&self, tokens: &[Token]) -> usize {
        tokens.first().map(|t| t.span.start).unwrap_or_else(|| self.offset())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

pub(crate) fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Classify a token run as a primitive literal constant, if it is one.
fn literal_kind(source: &str, tokens: &[Token]) -> Option<PrimitiveKind> {
    match tokens {
        [single] => match &single.kind {
            TokenKind::Name(n) if n == "True" || n == "False" => Some(PrimitiveKind::Bool),
            TokenKind::Number => number_kind(&source[single.span.start..single.span.end]),
            TokenKind::String(StringFlavor::Text) => Some(PrimitiveKind::Str),
            _ => None,
        },
        // Implicit concatenation: "a" "b"
        many if many
            .iter()
            .all(|t| t.kind == TokenKind::String(StringFlavor::Text)) =>
        {
            Some(PrimitiveKind::Str)
        }
        _ => None,
    }
}

/// Int or float from a numeric spelling; imaginary literals are not primitives.
fn number_kind(spelling: &str) -> Option<PrimitiveKind> {
    let lower = spelling.to_ascii_lowercase();
    if lower.ends_with('j') {
        return None;
    }
    if lower.starts_with("0x") || lower.starts_with("0o") || lower.starts_with("0b") {
        return Some(PrimitiveKind::Int);
    }
    if lower.contains('.') || lower.contains('e') {
        Some(PrimitiveKind::Float)
    } else {
        Some(PrimitiveKind::Int)
    }
}

/// Positions of depth-0 tokens matching `pred`.
/// Names bound by `a = b = ... = value` when every target is a plain name.
fn simple_targets(tokens: &[Token], assigns: &[usize]) -> Option<Vec<String>> {
    if assigns.is_empty() {
        return None;
    }
    assigns
        .iter()
        .enumerate()
        .map(|(i, &at)| {
            if at != 2 * i + 1 {
                return None;
            }
            tokens[at - 1]
                .name()
                .filter(|n| !is_keyword(n))
                .map(str::to_string)
        })
        .collect()
}

fn top_level_positions(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Vec<usize> {
    let mut depth = 0usize;
    let mut positions = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match &token.kind {
            TokenKind::Op("(" | "[" | "{") => depth += 1,
            TokenKind::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
            _ if depth == 0 && pred(token) => positions.push(i),
            _ => {}
        }
    }
    positions
}

fn top_level_position(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Option<usize> {
    top_level_positions(tokens, pred).into_iter().next()
}

fn has_top_level_as(tokens: &[Token]) -> bool {
    top_level_position(tokens, |t| t.is_name("as")).is_some()
        || !top_level_positions(tokens, |t| t.is_op(",")).is_empty()
}

/// Split on a depth-0 separator operator.
fn split_top_level<'t>(tokens: &'t [Token], separator: &str) -> Vec<&'t [Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    for i in top_level_positions(tokens, |t| t.is_op(separator)) {
        parts.push(&tokens[start..i]);
        start = i + 1;
    }
    parts.push(&tokens[start..]);
    parts
}

/// Index of the bracket closing the one opened at `open`.
fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match &token.kind {
            TokenKind::Op("(" | "[" | "{") => depth += 1,
            TokenKind::Op(")" | "]" | "}") => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Index of the bracket opening the one closed at the last token.
fn matching_open(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().rev() {
        match &token.kind {
            TokenKind::Op(")" | "]" | "}") => depth += 1,
            TokenKind::Op("(" | "[" | "{") => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `x.attr(...)` ⇒ `Some("attr")`.
fn call_attribute(tokens: &[Token]) -> Option<String> {
    if !tokens.last()?.is_op(")") {
        return None;
    }
    let open = matching_open(tokens)?;
    if open < 2 || !tokens[open - 2].is_op(".") {
        return None;
    }
    tokens[open - 1].name().map(str::to_string)
}

/// Last name of a decorator callee: `a.b.c` or `a.b.c(...)` ⇒ `Some("c")`.
fn callee_tail(tokens: &[Token]) -> Option<String> {
    let callee = if tokens.last()?.is_op(")") {
        &tokens[..matching_open(tokens)?]
    } else {
        tokens
    };
    callee.last()?.name().map(str::to_string)
}
