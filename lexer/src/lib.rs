pub mod token;

use std::rc::Rc;
use token::{Token, TokenType};

/// Turns source text into a stream of `Token`s, one `scan_token()` call at a
/// time. The compiler drives it by calling `scan_token()` repeatedly until it
/// sees `TokenType::Eof`, which keeps being returned on every subsequent call
/// rather than panicking once the source is exhausted.
pub struct Scanner {
    source: Rc<str>,
    start: usize,
    current: usize,
    line: u32,
}

impl Scanner {
    pub fn new(source: impl Into<Rc<str>>) -> Self {
        Self {
            source: source.into(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn byte_at(&self, idx: usize) -> u8 {
        self.source.as_bytes()[idx]
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.byte_at(self.current)
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.byte_at(self.current + 1)
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.byte_at(self.current);
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.byte_at(self.current) != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make(&self, typ: TokenType) -> Token {
        Token::new(
            typ,
            Rc::clone(&self.source),
            self.start,
            self.current - self.start,
            self.line,
        )
    }

    fn error(&self, message: impl Into<String>) -> Token {
        Token::error(message.into(), Rc::clone(&self.source), self.line)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.at_end() {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn string(&mut self) -> Token {
        while self.peek() != b'"' && !self.at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.at_end() {
            return self.error("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make(TokenType::String)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenType::Number)
    }

    fn identifier(&mut self) -> Token {
        while is_alnum(self.peek()) {
            self.advance();
        }
        let word = &self.source[self.start..self.current];
        match TokenType::keyword(word) {
            Some(typ) => self.make(typ),
            None => self.make(TokenType::Identifier),
        }
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        if self.at_end() {
            return Token::eof(Rc::clone(&self.source), self.line);
        }

        let c = self.advance();
        if c.is_ascii_digit() {
            return self.number();
        }
        if is_alpha(c) {
            return self.identifier();
        }

        match c {
            b'(' => self.make(TokenType::LeftParen),
            b')' => self.make(TokenType::RightParen),
            b'{' => self.make(TokenType::LeftBrace),
            b'}' => self.make(TokenType::RightBrace),
            b';' => self.make(TokenType::Semicolon),
            b',' => self.make(TokenType::Comma),
            b'.' => self.make(TokenType::Dot),
            b'-' => self.make(TokenType::Minus),
            b'+' => self.make(TokenType::Plus),
            b'/' => self.make(TokenType::Slash),
            b'*' => self.make(TokenType::Star),
            b'!' => {
                let typ = if self.matches(b'=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.make(typ)
            }
            b'=' => {
                let typ = if self.matches(b'=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.make(typ)
            }
            b'<' => {
                let typ = if self.matches(b'=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.make(typ)
            }
            b'>' => {
                let typ = if self.matches(b'=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.make(typ)
            }
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_alnum(c: u8) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut types = vec![];
        loop {
            let token = scanner.scan_token();
            let typ = token.typ();
            types.push(typ);
            if typ == TokenType::Eof {
                break;
            }
        }
        types
    }

    #[test]
    fn scans_punctuation_and_operators() {
        use TokenType::*;
        assert_eq!(
            scan_all("(){};,.+-*!= == <= >="),
            vec![
                LeftParen, RightParen, LeftBrace, RightBrace, Semicolon, Comma, Dot, Plus, Minus,
                Star, BangEqual, EqualEqual, LessEqual, GreaterEqual, Eof
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        use TokenType::*;
        assert_eq!(
            scan_all("var x = nil; class A {}"),
            vec![
                Var, Identifier, Equal, Nil, Semicolon, Class, Identifier, LeftBrace, RightBrace,
                Eof
            ]
        );
    }

    #[test]
    fn scans_numbers_and_strings() {
        use TokenType::*;
        assert_eq!(scan_all("1 2.5 \"hi\""), vec![Number, Number, String, Eof]);
    }

    #[test]
    fn tracks_line_numbers_across_newlines() {
        let mut scanner = Scanner::new("1\n2\n3");
        assert_eq!(scanner.scan_token().line(), 1);
        assert_eq!(scanner.scan_token().line(), 2);
        assert_eq!(scanner.scan_token().line(), 3);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"unterminated");
        assert_eq!(scanner.scan_token().typ(), TokenType::Error);
    }

    #[test]
    fn eof_is_idempotent() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.scan_token().typ(), TokenType::Eof);
        assert_eq!(scanner.scan_token().typ(), TokenType::Eof);
    }

    #[test]
    fn skips_line_comments() {
        use TokenType::*;
        assert_eq!(scan_all("1 // comment\n2"), vec![Number, Number, Eof]);
    }
}
