//! Tokenizer for the reference runtime's script subset.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Pos {
    pub(crate) line: u32,
    pub(crate) column: u32,
}

impl Pos {
    pub(crate) const START: Self = Self { line: 1, column: 1 };
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Ident(name) => f.write_str(name),
            Self::Punct(p) => f.write_str(p),
            Self::Eof => f.write_str("end of script"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) pos: Pos,
    /// A line terminator precedes this token (automatic semicolons).
    pub(crate) newline_before: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyntaxError {
    pub(crate) message: String,
    pub(crate) pos: Pos,
}

impl SyntaxError {
    pub(crate) fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

/// Longest first so that `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", "%=",
    "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%", "!", "=", "?",
    ":", ".",
];

struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: u32,
    column: u32,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        index: 0,
        line: 1,
        column: 1,
    };
    lexer.run()
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn run(&mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        let mut newline_before = false;
        loop {
            newline_before |= self.skip_trivia()?;
            let pos = self.pos();
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos,
                    newline_before: true,
                });
                return Ok(tokens);
            };
            let kind = if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                self.number(pos)?
            } else if c == '"' || c == '\'' {
                self.string(pos)?
            } else if is_ident_start(c) {
                let mut name = String::new();
                while let Some(c) = self.peek().filter(|c| is_ident_part(*c)) {
                    name.push(c);
                    self.bump();
                }
                TokenKind::Ident(name)
            } else {
                self.punctuator(pos)?
            };
            tokens.push(Token {
                kind,
                pos,
                newline_before,
            });
            newline_before = false;
        }
    }

    /// Skip whitespace and comments; report whether a newline was crossed.
    fn skip_trivia(&mut self) -> Result<bool, SyntaxError> {
        let mut newline = false;
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some('\n'), _) => {
                    newline = true;
                    self.bump();
                }
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(c), _) => {
                                newline |= c == '\n';
                                self.bump();
                            }
                            (None, _) => {
                                return Err(SyntaxError::new("Expected '*/'", start));
                            }
                        }
                    }
                }
                _ => return Ok(newline),
            }
        }
    }

    fn number(&mut self, pos: Pos) -> Result<TokenKind, SyntaxError> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek().filter(char::is_ascii_hexdigit) {
                digits.push(c);
                self.bump();
            }
            return u64::from_str_radix(&digits, 16)
                .map(|v| TokenKind::Number(v as f64))
                .map_err(|_| SyntaxError::new("Invalid number", pos));
        }
        let mut text = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            text.push(c);
            self.bump();
        }
        if self.peek() == Some('.') {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            text.push('e');
            self.bump();
            if let Some(sign) = self.peek().filter(|c| *c == '+' || *c == '-') {
                text.push(sign);
                self.bump();
            }
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.bump();
            }
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(SyntaxError::new("Invalid number", pos));
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| SyntaxError::new("Invalid number", pos))
    }

    fn string(&mut self, pos: Pos) -> Result<TokenKind, SyntaxError> {
        let quote = self.bump();
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(SyntaxError::new("Unterminated string constant", pos));
            };
            if Some(c) == quote {
                return Ok(TokenKind::Str(value));
            }
            match c {
                '\n' => return Err(SyntaxError::new("Unterminated string constant", pos)),
                '\\' => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| SyntaxError::new("Unterminated string constant", pos))?;
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        'u' => {
                            let mut code = String::new();
                            for _ in 0..4 {
                                if let Some(h) = self.bump() {
                                    code.push(h);
                                }
                            }
                            let ch = u32::from_str_radix(&code, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| {
                                    SyntaxError::new("Invalid unicode escape sequence", pos)
                                })?;
                            value.push(ch);
                        }
                        other => value.push(other),
                    }
                }
                other => value.push(other),
            }
        }
    }

    fn punctuator(&mut self, pos: Pos) -> Result<TokenKind, SyntaxError> {
        let rest = &self.chars[self.index..];
        for punct in PUNCTUATORS {
            let len = punct.chars().count();
            if rest.len() >= len && punct.chars().zip(rest).all(|(a, b)| a == *b) {
                for _ in 0..len {
                    self.bump();
                }
                return Ok(TokenKind::Punct(punct));
            }
        }
        let c = rest.first().copied().unwrap_or(' ');
        Err(SyntaxError::new(format!("Invalid character '{c}'"), pos))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// The trimmed text of line `line` (1-based) in `source`.
pub(crate) fn source_line(source: &str, line: u32) -> String {
    source
        .lines()
        .nth(line.saturating_sub(1) as usize)
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}
