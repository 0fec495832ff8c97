extern crate variant_count;

use colored::Colorize;
use std::{fmt, rc::Rc};
use variant_count::VariantCount;

/// Every lexical category the scanner can produce. Ordering is not
/// meaningful; `VariantCount` is available to size any future lookup table
/// keyed by token type, the way the teacher's own token module exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, VariantCount)]
pub enum TokenType {
    // single-character
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // one or two character
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // literals
    Identifier,
    String,
    Number,

    // reserved words
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

impl TokenType {
    pub fn keyword(word: &str) -> Option<Self> {
        Some(match word {
            "and" => Self::And,
            "class" => Self::Class,
            "else" => Self::Else,
            "false" => Self::False,
            "for" => Self::For,
            "fun" => Self::Fun,
            "if" => Self::If,
            "nil" => Self::Nil,
            "or" => Self::Or,
            "print" => Self::Print,
            "return" => Self::Return,
            "super" => Self::Super,
            "this" => Self::This,
            "true" => Self::True,
            "var" => Self::Var,
            "while" => Self::While,
            _ => return None,
        })
    }
}

/// A lexeme plus its location. `start`/`length` index into `source`, and
/// `source` is shared (never copied) across every token scanned from it.
///
/// `Error` tokens repurpose the lexeme storage to hold a diagnostic message
/// living in its own leaked `Rc<str>` rather than a source slice.
#[derive(Clone)]
pub struct Token {
    typ: TokenType,
    source: Rc<str>,
    start: usize,
    length: usize,
    line: u32,
    error_message: Option<Rc<str>>,
}

impl Token {
    pub fn new(typ: TokenType, source: Rc<str>, start: usize, length: usize, line: u32) -> Self {
        Self {
            typ,
            source,
            start,
            length,
            line,
            error_message: None,
        }
    }

    pub fn error(message: String, source: Rc<str>, line: u32) -> Self {
        Self {
            typ: TokenType::Error,
            source,
            start: 0,
            length: 0,
            line,
            error_message: Some(Rc::from(message)),
        }
    }

    pub fn eof(source: Rc<str>, line: u32) -> Self {
        let len = source.len();
        Self::new(TokenType::Eof, source, len, 0, line)
    }

    /// Builds a token whose lexeme is `text` without it having appeared in
    /// any scanned source. The compiler uses this for the implicit `this`
    /// and `super` references it splices into method bodies.
    pub fn synthetic(typ: TokenType, text: &'static str, line: u32) -> Self {
        let source: Rc<str> = Rc::from(text);
        let length = source.len();
        Self::new(typ, source, 0, length, line)
    }

    pub fn typ(&self) -> TokenType {
        self.typ
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn lexeme(&self) -> &str {
        match &self.error_message {
            Some(msg) => msg,
            None => &self.source[self.start..self.start + self.length],
        }
    }

    fn source_line(&self) -> &str {
        self.source
            .lines()
            .nth(self.line.saturating_sub(1) as usize)
            .unwrap_or("")
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("type", &self.typ)
            .field("lexeme", &self.lexeme())
            .field("line", &self.line)
            .finish()
    }
}

/// Underlines the offending lexeme in its source line; the teacher's
/// `Token` `Display` impl renders diagnostics the same way.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.typ == TokenType::Eof {
            return write!(f, "{}", "at end".dimmed());
        }
        if self.typ == TokenType::Error {
            return write!(f, "{}", self.lexeme());
        }
        let indent = format!("{}", self.line).len();
        writeln!(f, "{}", format!("{} |", " ".repeat(indent)).bright_cyan())?;
        let line_text = self.source_line();
        write!(f, "{}", format!("{} | ", self.line).bright_cyan())?;
        let col = self
            .source
            .get(..self.start)
            .map(|prefix| prefix.rsplit('\n').next().unwrap_or("").chars().count())
            .unwrap_or(0);
        let chars: Vec<char> = line_text.chars().collect();
        let before: String = chars.iter().take(col).collect();
        let lexeme: String = chars.iter().skip(col).take(self.length).collect();
        let after: String = chars.iter().skip(col + self.length).collect();
        writeln!(f, "{before}{}{after}", lexeme.underline().bold())?;
        write!(f, "{}", format!("{} |", " ".repeat(indent)).bright_cyan())
    }
}
