// File: src/lexer.rs
//
// Scanner for Moss source text.
// Tokens are produced on demand; the compiler pulls one at a time, so the
// whole front end is single-pass. Tokens index into the externally held
// source buffer instead of owning their lexemes.

use ahash::AHashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // === Single-character punctuation ===
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

    // === One- or two-character operators ===
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // === Literals ===
    Identifier,
    String,
    Number,

    // === Reserved words ===
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

    /// Scan failure; the payload is the diagnostic message.
    Error(&'static str),
    Eof,
}

/// One token. `start` and `length` locate the lexeme in the source buffer.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub length: usize,
    pub line: u32,
}

impl Token {
    pub fn lexeme<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.start + self.length]
    }
}

static KEYWORDS: Lazy<AHashMap<&'static str, TokenKind>> = Lazy::new(|| {
    [
        ("and", TokenKind::And),
        ("class", TokenKind::Class),
        ("else", TokenKind::Else),
        ("false", TokenKind::False),
        ("for", TokenKind::For),
        ("fun", TokenKind::Fun),
        ("if", TokenKind::If),
        ("nil", TokenKind::Nil),
        ("or", TokenKind::Or),
        ("print", TokenKind::Print),
        ("return", TokenKind::Return),
        ("super", TokenKind::Super),
        ("this", TokenKind::This),
        ("true", TokenKind::True),
        ("var", TokenKind::Var),
        ("while", TokenKind::While),
    ]
    .into_iter()
    .collect()
});

pub struct Lexer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source, start: 0, current: 0, line: 1 }
    }

    /// Scans and returns the next token. Past the end of input this keeps
    /// returning Eof.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b'-' => self.make(TokenKind::Minus),
            b'+' => self.make(TokenKind::Plus),
            b';' => self.make(TokenKind::Semicolon),
            b'/' => self.make(TokenKind::Slash),
            b'*' => self.make(TokenKind::Star),
            b'!' => self.two_char(b'=', TokenKind::BangEqual, TokenKind::Bang),
            b'=' => self.two_char(b'=', TokenKind::EqualEqual, TokenKind::Equal),
            b'<' => self.two_char(b'=', TokenKind::LessEqual, TokenKind::Less),
            b'>' => self.two_char(b'=', TokenKind::GreaterEqual, TokenKind::Greater),
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            c if is_alpha(c) => self.identifier(),
            _ => {
                // Step over any UTF-8 continuation bytes so the error lexeme
                // stays on a character boundary.
                while !self.is_at_end() && (self.peek() & 0xC0) == 0x80 {
                    self.current += 1;
                }
                self.make(TokenKind::Error("Unexpected character."))
            }
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token {
        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        if self.is_at_end() {
            return self.make(TokenKind::Error("Unterminated string."));
        }
        self.current += 1; // closing quote
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        // A fractional part needs a digit after the dot, so `x.sqrt` still
        // scans as number-dot-identifier.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.current += 1;
        }
        let text = &self.source[self.start..self.current];
        let kind = KEYWORDS.get(text).copied().unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    fn two_char(&mut self, second: u8, matched: TokenKind, single: TokenKind) -> Token {
        if !self.is_at_end() && self.peek() == second {
            self.current += 1;
            self.make(matched)
        } else {
            self.make(single)
        }
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            start: self.start,
            length: self.current - self.start,
            line: self.line,
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        *self.source.as_bytes().get(self.current).unwrap_or(&0)
    }

    fn peek_next(&self) -> u8 {
        *self.source.as_bytes().get(self.current + 1).unwrap_or(&0)
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan_all(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn punctuation_and_operators() {
        assert_eq!(
            kinds("(){};,.-+*/ ! != = == < <= > >="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("var x = fun_stuff and orchid;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Identifier,
                TokenKind::And,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_with_and_without_fractions() {
        let tokens = scan_all("12 3.5 4.");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[1].kind, TokenKind::Number);
        assert_eq!(tokens[1].lexeme("12 3.5 4."), "3.5");
        // trailing dot is its own token
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn strings_span_lines_and_count_them() {
        let source = "\"ab\ncd\" x";
        let tokens = scan_all(source);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme(source), "\"ab\ncd\"");
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let tokens = scan_all("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error("Unterminated string."));
    }

    #[test]
    fn comments_are_skipped_to_end_of_line() {
        assert_eq!(
            kinds("1 // comment with var and class\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn tokens_carry_offsets_into_the_source() {
        let source = "var answer = 42;";
        let tokens = scan_all(source);
        assert_eq!(tokens[1].lexeme(source), "answer");
        assert_eq!(tokens[1].start, 4);
        assert_eq!(tokens[1].length, 6);
        assert_eq!(tokens[3].lexeme(source), "42");
    }

    #[test]
    fn unknown_character_is_reported() {
        let tokens = scan_all("@");
        assert_eq!(tokens[0].kind, TokenKind::Error("Unexpected character."));
    }
}
