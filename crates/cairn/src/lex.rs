//! The mode-based buildfile tokenizer.
//!
//! The parser pushes a lexing mode before peeking the next token whenever
//! context changes what is special: value mode turns assignment
//! punctuation back into word characters, eval mode enables comparison
//! and logic operators, variable mode reads exactly one variable name,
//! attribute mode terminates on `]`. Double-quoted text keeps spaces but
//! still stops at `$` so expansions interpolate; single-quoted text is
//! literal. A token records whether it was separated from the previous
//! one (whitespace) and whether any part of it was quoted — name parsing
//! uses both to decide concatenation and pattern-ness.

use strum::Display;

use crate::diag::{self, Error, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TokenKind {
    Eos,
    Newline,
    Word,
    Dollar,
    LParen,
    RParen,
    LCBrace,
    RCBrace,
    LSBrace,
    RSBrace,
    Colon,
    Assign,
    Append,
    Prepend,
    PairSeparator,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    LogAnd,
    LogOr,
    LogNot,
    Comma,
    Question,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: u32,
    pub column: u32,
    /// Preceded by whitespace (or start of line).
    pub separated: bool,
    /// Any part single- or double-quoted; quoted words never expand
    /// wildcards.
    pub quoted: bool,
}

impl Token {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn word(&self) -> &str {
        &self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexMode {
    /// Statement position: assignment operators, colon, braces, and
    /// attributes are special.
    Normal,
    /// Right-hand sides and dependency lists: only names, expansion, and
    /// pairs.
    Value,
    /// Exactly one variable name after `$`.
    Variable,
    /// Inside an evaluation context `(...)`.
    Eval,
    /// Inside an attribute list `[...]`.
    Attributes,
    /// The driver buildspec.
    Buildspec,
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    pub path: String,
    modes: Vec<LexMode>,
    /// Inside an open double-quoted run interrupted by an expansion.
    dquoted: bool,
}

impl Lexer {
    pub fn new(text: &str, path: impl Into<String>) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            path: path.into(),
            modes: vec![LexMode::Normal],
            dquoted: false,
        }
    }

    pub fn mode(&self) -> LexMode {
        *self.modes.last().unwrap_or(&LexMode::Normal)
    }

    pub fn push_mode(&mut self, m: LexMode) {
        self.modes.push(m);
    }

    pub fn pop_mode(&mut self) {
        if self.modes.len() > 1 {
            self.modes.pop();
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.path.clone(), self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Peek whether the very next character (no whitespace skipping) is
    /// `c`; the parser uses this after `$` to distinguish `$(...)` from
    /// `$name`.
    pub fn next_char_is(&self, c: char) -> bool {
        self.peek() == Some(c)
    }

    pub fn next(&mut self) -> diag::Result<Token> {
        // Resume an interrupted double-quoted run without separation.
        if self.dquoted {
            let (line, column) = (self.line, self.column);
            if self.peek() == Some('$') {
                self.bump();
                return Ok(Token {
                    kind: TokenKind::Dollar,
                    value: "$".to_owned(),
                    line,
                    column,
                    separated: false,
                    quoted: true,
                });
            }
            return self.word_dquoted(line, column);
        }

        let mode = self.mode();
        let mut separated = self.pos == 0;

        // Skip whitespace (newlines too in eval and buildspec modes) and
        // comments, tracking separation.
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.bump();
                    separated = true;
                }
                Some('\\') if self.peek_at(1) == Some('\n') => {
                    // Line continuation.
                    self.bump();
                    self.bump();
                    separated = true;
                }
                Some('\n') if matches!(mode, LexMode::Eval | LexMode::Buildspec) => {
                    self.bump();
                    separated = true;
                }
                Some('#') => {
                    self.skip_comment()?;
                    separated = true;
                }
                _ => break,
            }
        }

        let line = self.line;
        let column = self.column;
        let tok = |kind, value: &str| Token {
            kind,
            value: value.to_owned(),
            line,
            column,
            separated,
            quoted: false,
        };

        let Some(c) = self.peek() else { return Ok(tok(TokenKind::Eos, "")) };

        if c == '\n' {
            self.bump();
            // Value mode spans a single logical line.
            if self.mode() == LexMode::Value {
                self.pop_mode();
            }
            return Ok(tok(TokenKind::Newline, "\n"));
        }

        if mode == LexMode::Variable {
            // One name (or `{name}`), then the mode expires.
            self.pop_mode();
            if c == '{' {
                self.bump();
                let mut s = String::new();
                while let Some(c) = self.peek() {
                    if c == '}' {
                        self.bump();
                        let mut t = tok(TokenKind::Word, "");
                        t.value = s;
                        return Ok(t);
                    }
                    s.push(c);
                    self.bump();
                }
                return Err(Error::parse(self.location(), "unterminated variable name"));
            }
            let mut s = String::new();
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' || c == '.' {
                    s.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if s.is_empty() {
                return Err(Error::parse(
                    Location::new(self.path.clone(), line, column),
                    "expected variable name after '$'",
                ));
            }
            let mut t = tok(TokenKind::Word, "");
            t.value = s;
            return Ok(t);
        }

        // Punctuation by mode.
        if let Some(t) = self.punctuation(mode, &tok)? {
            return Ok(t);
        }

        // A word.
        self.word(mode, line, column, separated)
    }

    fn punctuation(
        &mut self,
        mode: LexMode,
        tok: &dyn Fn(TokenKind, &str) -> Token,
    ) -> diag::Result<Option<Token>> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(None),
        };
        let two = self.peek_at(1);
        let loc = self.location();

        let mut take = |n: usize, kind, s: &str| {
            for _ in 0..n {
                self.bump();
            }
            Ok(Some(tok(kind, s)))
        };

        match (mode, c) {
            // Universal specials.
            (_, '$') => take(1, TokenKind::Dollar, "$"),
            (_, '(') => take(1, TokenKind::LParen, "("),
            (_, ')') => take(1, TokenKind::RParen, ")"),

            (LexMode::Normal | LexMode::Value, '{') => take(1, TokenKind::LCBrace, "{"),
            (LexMode::Normal | LexMode::Value, '}') => take(1, TokenKind::RCBrace, "}"),
            (LexMode::Normal | LexMode::Value, '@') => take(1, TokenKind::PairSeparator, "@"),

            (LexMode::Normal, '[') => take(1, TokenKind::LSBrace, "["),
            (LexMode::Normal | LexMode::Attributes, ']') => take(1, TokenKind::RSBrace, "]"),
            (LexMode::Normal, ':') => take(1, TokenKind::Colon, ":"),
            (LexMode::Normal, '=') if two == Some('+') => take(2, TokenKind::Prepend, "=+"),
            (LexMode::Normal, '=') => take(1, TokenKind::Assign, "="),
            (LexMode::Normal, '+') if two == Some('=') => take(2, TokenKind::Append, "+="),

            (LexMode::Attributes, '=') => take(1, TokenKind::Assign, "="),
            (LexMode::Attributes, ',') => take(1, TokenKind::Comma, ","),

            (LexMode::Eval, '{') => take(1, TokenKind::LCBrace, "{"),
            (LexMode::Eval, '}') => take(1, TokenKind::RCBrace, "}"),
            (LexMode::Eval, '@') => take(1, TokenKind::PairSeparator, "@"),
            (LexMode::Eval, '=') if two == Some('=') => take(2, TokenKind::Equal, "=="),
            (LexMode::Eval, '!') if two == Some('=') => take(2, TokenKind::NotEqual, "!="),
            (LexMode::Eval, '!') => take(1, TokenKind::LogNot, "!"),
            (LexMode::Eval, '<') if two == Some('=') => take(2, TokenKind::LessEqual, "<="),
            (LexMode::Eval, '<') => take(1, TokenKind::Less, "<"),
            (LexMode::Eval, '>') if two == Some('=') => take(2, TokenKind::GreaterEqual, ">="),
            (LexMode::Eval, '>') => take(1, TokenKind::Greater, ">"),
            (LexMode::Eval, '&') if two == Some('&') => take(2, TokenKind::LogAnd, "&&"),
            (LexMode::Eval, '&') => Err(Error::parse(loc, "expected '&&'")),
            (LexMode::Eval, '|') if two == Some('|') => take(2, TokenKind::LogOr, "||"),
            (LexMode::Eval, '|') => Err(Error::parse(loc, "expected '||'")),
            (LexMode::Eval, '?') => take(1, TokenKind::Question, "?"),
            (LexMode::Eval, ':') => take(1, TokenKind::Colon, ":"),
            (LexMode::Eval, ',') => take(1, TokenKind::Comma, ","),
            (LexMode::Eval, '=') => Err(Error::parse(loc, "expected '=='")),

            (LexMode::Buildspec, ',') => take(1, TokenKind::Comma, ","),

            _ => Ok(None),
        }
    }

    fn word(&mut self, mode: LexMode, line: u32, column: u32, separated: bool) -> diag::Result<Token> {
        let mut s = String::new();
        let mut quoted = false;

        while let Some(c) = self.peek() {
            match c {
                '\'' => {
                    quoted = true;
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('\'') => break,
                            Some(c) => s.push(c),
                            None => {
                                return Err(Error::parse(
                                    Location::new(self.path.clone(), line, column),
                                    "unterminated single-quoted sequence",
                                ));
                            }
                        }
                    }
                }
                '"' => {
                    quoted = true;
                    self.dquoted = true;
                    self.bump();
                    loop {
                        match self.peek() {
                            Some('"') => {
                                self.bump();
                                self.dquoted = false;
                                break;
                            }
                            Some('$') => {
                                // Stop so the expansion interpolates; the
                                // quoted run resumes on the next call.
                                return Ok(Token {
                                    kind: TokenKind::Word,
                                    value: s,
                                    line,
                                    column,
                                    separated,
                                    quoted,
                                });
                            }
                            Some('\\') => {
                                self.bump();
                                if let Some(c) = self.bump() {
                                    s.push(c);
                                }
                            }
                            Some(c) => {
                                s.push(c);
                                self.bump();
                            }
                            None => {
                                return Err(Error::parse(
                                    Location::new(self.path.clone(), line, column),
                                    "unterminated double-quoted sequence",
                                ));
                            }
                        }
                    }
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') => break, // continuation ends the word
                        Some(c) => s.push(c),
                        None => {
                            return Err(Error::parse(
                                Location::new(self.path.clone(), line, column),
                                "dangling escape at end of file",
                            ));
                        }
                    }
                }
                _ if self.is_special(mode, c) || c == ' ' || c == '\t' || c == '\r' || c == '\n' => break,
                _ => {
                    s.push(c);
                    self.bump();
                }
            }
        }

        if s.is_empty() && !quoted {
            return Err(Error::parse(
                Location::new(self.path.clone(), line, column),
                format!("unexpected character '{}'", self.peek().unwrap_or(' ')),
            ));
        }
        Ok(Token { kind: TokenKind::Word, value: s, line, column, separated, quoted })
    }

    fn is_special(&self, mode: LexMode, c: char) -> bool {
        match mode {
            LexMode::Normal => matches!(c, '$' | '(' | ')' | '{' | '}' | '[' | ']' | ':' | '=' | '@' | '#')
                || (c == '+' && self.peek_at(1) == Some('=')),
            LexMode::Value => matches!(c, '$' | '(' | ')' | '{' | '}' | '@' | '#'),
            LexMode::Eval => matches!(
                c,
                '$' | '(' | ')' | '{' | '}' | '@' | '#' | '=' | '!' | '<' | '>' | '&' | '|' | '?' | ':' | ','
            ),
            LexMode::Attributes => matches!(c, '$' | '(' | ')' | '=' | ',' | ']' | '#'),
            LexMode::Buildspec => matches!(c, '$' | '(' | ')' | ',' | '#'),
            LexMode::Variable => true,
        }
    }

    /// Continuation of a double-quoted run after an expansion.
    fn word_dquoted(&mut self, line: u32, column: u32) -> diag::Result<Token> {
        let mut s = String::new();
        loop {
            match self.peek() {
                Some('"') => {
                    self.bump();
                    self.dquoted = false;
                    break;
                }
                Some('$') => break,
                Some('\\') => {
                    self.bump();
                    if let Some(c) = self.bump() {
                        s.push(c);
                    }
                }
                Some(c) => {
                    s.push(c);
                    self.bump();
                }
                None => {
                    return Err(Error::parse(
                        Location::new(self.path.clone(), line, column),
                        "unterminated double-quoted sequence",
                    ));
                }
            }
        }
        Ok(Token { kind: TokenKind::Word, value: s, line, column, separated: false, quoted: true })
    }

    /// `#` to end of line, or the `#\` multi-line form terminated by a
    /// line consisting of `#\`.
    fn skip_comment(&mut self) -> diag::Result<()> {
        self.bump(); // '#'
        if self.peek() == Some('\\') && matches!(self.peek_at(1), Some('\n') | None) {
            // Multi-line: consume until a line that starts with `#\`.
            self.bump();
            loop {
                match self.bump() {
                    None => {
                        return Err(Error::parse(self.location(), "unterminated multi-line comment"));
                    }
                    Some('\n') => {
                        if self.peek() == Some('#') && self.peek_at(1) == Some('\\') {
                            self.bump();
                            self.bump();
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
        Ok(())
    }
}
