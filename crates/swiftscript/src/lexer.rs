//! Hand-written lexer.
//!
//! Scans UTF-8 source left to right, skipping whitespace and `//` / `/* */`
//! comments. Numeric literals are pre-parsed onto the token. Failures are
//! reported as [`TokenKind::Error`] tokens rather than panics or results; the
//! parser turns them into a `ParseError`.
//!
//! String interpolation produces a token sub-stream (see [`TokenKind`]).
//! While inside an interpolation region, `(` and `)` are depth-counted so the
//! outermost `)` closes the interpolation instead of a grouping expression.

use std::collections::VecDeque;

use crate::token::{Token, TokenKind};

pub struct Lexer<'src> {
    source: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
    column: u32,
    token_column: u32,
    /// Sub-stream tokens queued ahead of the scan position.
    pending: VecDeque<Token>,
    /// Inside `"..."` with at least one interpolation seen.
    in_interpolated_string: bool,
    /// Inside a `\( ... )` region.
    in_interpolation: bool,
    interpolation_depth: u32,
}

impl<'src> Lexer<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            column: 0,
            token_column: 0,
            pending: VecDeque::new(),
            in_interpolated_string: false,
            in_interpolation: false,
            interpolation_depth: 0,
        }
    }

    /// Lexes the entire source. Stops after the first `Error` token or `Eof`.
    #[must_use]
    pub fn tokenize_all(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let kind = token.kind;
            tokens.push(token);
            if matches!(kind, TokenKind::Eof | TokenKind::Error) {
                break;
            }
        }
        tokens
    }

    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.pending.pop_front() {
            return token;
        }

        if self.in_interpolated_string && !self.in_interpolation {
            return self.scan_interpolated_segment();
        }

        self.skip_whitespace();
        self.start = self.current;
        self.token_column = self.column;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if c.is_ascii_digit() {
            return self.scan_number();
        }
        if is_identifier_start(c) {
            return self.scan_identifier();
        }

        match c {
            b'(' => {
                if self.in_interpolation {
                    self.interpolation_depth += 1;
                }
                self.make_token(TokenKind::LeftParen)
            }
            b')' => {
                if self.in_interpolation && self.interpolation_depth > 0 {
                    self.interpolation_depth -= 1;
                    if self.interpolation_depth == 0 {
                        self.in_interpolation = false;
                        return self.make_token(TokenKind::InterpolationEnd);
                    }
                }
                self.make_token(TokenKind::RightParen)
            }
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b',' => self.make_token(TokenKind::Comma),
            b';' => self.make_token(TokenKind::Semicolon),
            b':' => self.make_token(TokenKind::Colon),
            b'~' => self.make_token(TokenKind::Tilde),
            b'^' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::CaretEqual
                } else {
                    TokenKind::Caret
                };
                self.make_token(kind)
            }
            b'.' => {
                if self.match_byte(b'.') {
                    // Longest match wins: `...` then `..<` then `..`.
                    let kind = if self.match_byte(b'.') {
                        TokenKind::RangeInclusive
                    } else if self.match_byte(b'<') {
                        TokenKind::RangeExclusive
                    } else {
                        TokenKind::Range
                    };
                    self.make_token(kind)
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            b'+' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                };
                self.make_token(kind)
            }
            b'-' => {
                if self.match_byte(b'>') {
                    return self.make_token(TokenKind::Arrow);
                }
                let kind = if self.match_byte(b'=') {
                    TokenKind::MinusEqual
                } else {
                    TokenKind::Minus
                };
                self.make_token(kind)
            }
            b'*' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::StarEqual
                } else {
                    TokenKind::Star
                };
                self.make_token(kind)
            }
            b'/' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::SlashEqual
                } else {
                    TokenKind::Slash
                };
                self.make_token(kind)
            }
            b'%' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::PercentEqual
                } else {
                    TokenKind::Percent
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::NotEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'<' => {
                if self.match_byte(b'<') {
                    let kind = if self.match_byte(b'=') {
                        TokenKind::LeftShiftEqual
                    } else {
                        TokenKind::LeftShift
                    };
                    return self.make_token(kind);
                }
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                // `>>` always lexes as one right-shift token; the parser
                // rewrites it into two `>` when closing generic brackets.
                if self.match_byte(b'>') {
                    let kind = if self.match_byte(b'=') {
                        TokenKind::RightShiftEqual
                    } else {
                        TokenKind::RightShift
                    };
                    return self.make_token(kind);
                }
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'&' => {
                if self.match_byte(b'&') {
                    return self.make_token(TokenKind::AmpAmp);
                }
                let kind = if self.match_byte(b'=') {
                    TokenKind::AmpEqual
                } else {
                    TokenKind::Amp
                };
                self.make_token(kind)
            }
            b'|' => {
                if self.match_byte(b'|') {
                    return self.make_token(TokenKind::PipePipe);
                }
                let kind = if self.match_byte(b'=') {
                    TokenKind::PipeEqual
                } else {
                    TokenKind::Pipe
                };
                self.make_token(kind)
            }
            b'?' => {
                if self.match_byte(b'?') {
                    return self.make_token(TokenKind::QuestionQuestion);
                }
                if self.match_byte(b'.') {
                    return self.make_token(TokenKind::QuestionDot);
                }
                self.make_token(TokenKind::Question)
            }
            b'"' => self.scan_string(),
            _ => self.error_token("Unexpected character"),
        }
    }

    // ---- Scanners ----

    fn scan_number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut is_float = false;
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let mut token = self.make_token(if is_float { TokenKind::Float } else { TokenKind::Integer });
        if is_float {
            token.float_value = token.lexeme.parse::<f64>().unwrap_or(0.0);
        } else {
            // Out-of-range literals saturate; Int arithmetic itself wraps.
            token.int_value = token.lexeme.parse::<i64>().unwrap_or(i64::MAX);
        }
        token
    }

    fn scan_identifier(&mut self) -> Token {
        while is_identifier_continue(self.peek()) {
            self.advance();
        }
        let text = &self.source[self.start..self.current];
        let kind = keyword_kind(text).unwrap_or(TokenKind::Identifier);
        self.make_token(kind)
    }

    /// Scans a string literal from just after the opening quote. When a `\(`
    /// is found, the token stream switches to the interpolation sub-stream.
    fn scan_string(&mut self) -> Token {
        // No nested interpolated strings inside an interpolation region.
        let allow_interpolation = !self.in_interpolation;
        let string_start = self.start;
        let string_line = self.line;
        let string_column = self.token_column;
        let segment_start = self.current;
        let segment_line = self.line;
        let segment_column = self.column;

        while !self.is_at_end() && self.peek() != b'"' {
            if allow_interpolation && self.peek() == b'\\' && self.peek_next() == b'(' {
                let interp_start = self.current;
                let interp_line = self.line;
                let interp_column = self.column;
                let head = self.token_at(
                    TokenKind::InterpolatedStringStart,
                    string_start,
                    string_start + 1,
                    string_line,
                    string_column,
                );
                if segment_start < self.current {
                    self.pending.push_back(self.token_at(
                        TokenKind::StringSegment,
                        segment_start,
                        self.current,
                        segment_line,
                        segment_column,
                    ));
                }
                self.advance(); // backslash
                self.advance(); // open paren
                self.pending.push_back(self.token_at(
                    TokenKind::InterpolationStart,
                    interp_start,
                    interp_start + 2,
                    interp_line,
                    interp_column,
                ));
                self.in_interpolated_string = true;
                self.in_interpolation = true;
                self.interpolation_depth = 1;
                return head;
            }
            if self.peek() == b'\n' {
                self.line += 1;
                self.column = 0;
            }
            if self.peek() == b'\\' {
                self.advance();
                if !self.is_at_end() {
                    self.advance();
                }
                continue;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    /// Resumes a string after an `InterpolationEnd`, emitting the next
    /// segment and, at the closing quote, `InterpolatedStringEnd`.
    fn scan_interpolated_segment(&mut self) -> Token {
        let segment_start = self.current;
        let segment_line = self.line;
        let segment_column = self.column;

        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\\' && self.peek_next() == b'(' {
                let interp_start = self.current;
                let interp_line = self.line;
                let interp_column = self.column;
                self.advance();
                self.advance();
                self.in_interpolation = true;
                self.interpolation_depth = 1;
                let interp_token =
                    self.token_at(TokenKind::InterpolationStart, interp_start, interp_start + 2, interp_line, interp_column);
                if segment_start < interp_start {
                    let segment =
                        self.token_at(TokenKind::StringSegment, segment_start, interp_start, segment_line, segment_column);
                    self.pending.push_back(interp_token);
                    return segment;
                }
                return interp_token;
            }
            if self.peek() == b'\n' {
                self.line += 1;
                self.column = 0;
            }
            if self.peek() == b'\\' {
                self.advance();
                if !self.is_at_end() {
                    self.advance();
                }
                continue;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        let quote_start = self.current;
        let quote_line = self.line;
        let quote_column = self.column;
        self.advance(); // closing quote
        self.in_interpolated_string = false;
        let end_token = self.token_at(TokenKind::InterpolatedStringEnd, quote_start, quote_start + 1, quote_line, quote_column);
        if segment_start < quote_start {
            let segment = self.token_at(TokenKind::StringSegment, segment_start, quote_start, segment_line, segment_column);
            self.pending.push_back(end_token);
            return segment;
        }
        end_token
    }

    // ---- Whitespace & comments ----

    fn skip_whitespace(&mut self) {
        loop {
            if self.is_at_end() {
                return;
            }
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.column = 0;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while !self.is_at_end() && self.peek() != b'\n' {
                            self.advance();
                        }
                    } else if self.peek_next() == b'*' {
                        self.advance();
                        self.advance();
                        while !self.is_at_end() {
                            if self.peek() == b'\n' {
                                self.line += 1;
                                self.column = 0;
                            }
                            if self.peek() == b'*' && self.peek_next() == b'/' {
                                self.advance();
                                self.advance();
                                break;
                            }
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    // ---- Cursor helpers ----

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.source[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source[self.current + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        self.column += 1;
        true
    }

    // ---- Token constructors ----

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme = self.slice(self.start, self.current);
        let mut token = Token::new(kind, lexeme, self.line, self.token_column, 0);
        token.offset = u32::try_from(self.start).unwrap_or(u32::MAX);
        token
    }

    fn token_at(&self, kind: TokenKind, start: usize, end: usize, line: u32, column: u32) -> Token {
        let lexeme = self.slice(start, end.min(self.source.len()));
        let mut token = Token::new(kind, lexeme, line, column, 0);
        token.offset = u32::try_from(start).unwrap_or(u32::MAX);
        token
    }

    fn error_token(&self, message: &str) -> Token {
        let mut token = Token::new(TokenKind::Error, message, self.line, self.token_column, 0);
        token.offset = u32::try_from(self.start).unwrap_or(u32::MAX);
        token
    }

    fn slice(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.source[start..end]).into_owned()
    }
}

fn is_identifier_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_identifier_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn keyword_kind(text: &[u8]) -> Option<TokenKind> {
    let kind = match text {
        b"func" => TokenKind::Func,
        b"class" => TokenKind::Class,
        b"struct" => TokenKind::Struct,
        b"enum" => TokenKind::Enum,
        b"protocol" => TokenKind::Protocol,
        b"extension" => TokenKind::Extension,
        b"attribute" => TokenKind::Attribute,
        b"var" => TokenKind::Var,
        b"let" => TokenKind::Let,
        b"weak" => TokenKind::Weak,
        b"unowned" => TokenKind::Unowned,
        b"nil" => TokenKind::Nil,
        b"guard" => TokenKind::Guard,
        b"if" => TokenKind::If,
        b"else" => TokenKind::Else,
        b"switch" => TokenKind::Switch,
        b"case" => TokenKind::Case,
        b"default" => TokenKind::Default,
        b"for" => TokenKind::For,
        b"while" => TokenKind::While,
        b"repeat" => TokenKind::Repeat,
        b"break" => TokenKind::Break,
        b"continue" => TokenKind::Continue,
        b"return" => TokenKind::Return,
        b"in" => TokenKind::In,
        b"import" => TokenKind::Import,
        b"public" => TokenKind::Public,
        b"private" => TokenKind::Private,
        b"internal" => TokenKind::Internal,
        b"fileprivate" => TokenKind::Fileprivate,
        b"static" => TokenKind::Static,
        b"override" => TokenKind::Override,
        b"init" => TokenKind::Init,
        b"deinit" => TokenKind::Deinit,
        b"self" => TokenKind::SelfKw,
        b"super" => TokenKind::Super,
        b"mutating" => TokenKind::Mutating,
        b"get" => TokenKind::Get,
        b"set" => TokenKind::Set,
        b"willSet" => TokenKind::WillSet,
        b"didSet" => TokenKind::DidSet,
        b"lazy" => TokenKind::Lazy,
        b"as" => TokenKind::As,
        b"is" => TokenKind::Is,
        b"where" => TokenKind::Where,
        b"try" => TokenKind::Try,
        b"catch" => TokenKind::Catch,
        b"throw" => TokenKind::Throw,
        b"throws" => TokenKind::Throws,
        b"do" => TokenKind::Do,
        b"true" => TokenKind::True,
        b"false" => TokenKind::False,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).tokenize_all().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_numbers_with_values() {
        let tokens = Lexer::new("42 3.5").tokenize_all();
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[0].int_value, 42);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert!((tokens[1].float_value - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn range_operators_longest_match() {
        assert_eq!(
            kinds("a..b a..<b a...b"),
            vec![
                TokenKind::Identifier,
                TokenKind::Range,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::RangeExclusive,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::RangeInclusive,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn right_shift_is_single_token() {
        assert_eq!(kinds("a >> b"), vec![
            TokenKind::Identifier,
            TokenKind::RightShift,
            TokenKind::Identifier,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(kinds("1 // two\n/* three\nfour */ 5"), vec![
            TokenKind::Integer,
            TokenKind::Integer,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn plain_string() {
        let tokens = Lexer::new("\"hi\\n\"").tokenize_all();
        assert_eq!(tokens[0].kind, TokenKind::String);
        // Escapes stay un-decoded in the lexeme.
        assert_eq!(tokens[0].lexeme, "\"hi\\n\"");
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let tokens = Lexer::new("\"oops").tokenize_all();
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unterminated string");
    }

    #[test]
    fn interpolation_sub_stream() {
        assert_eq!(kinds(r#""a\(x)b""#), vec![
            TokenKind::InterpolatedStringStart,
            TokenKind::StringSegment,
            TokenKind::InterpolationStart,
            TokenKind::Identifier,
            TokenKind::InterpolationEnd,
            TokenKind::StringSegment,
            TokenKind::InterpolatedStringEnd,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn interpolation_counts_nested_parens() {
        assert_eq!(kinds(r#""v=\(f(1, (2)))""#), vec![
            TokenKind::InterpolatedStringStart,
            TokenKind::StringSegment,
            TokenKind::InterpolationStart,
            TokenKind::Identifier,
            TokenKind::LeftParen,
            TokenKind::Integer,
            TokenKind::Comma,
            TokenKind::LeftParen,
            TokenKind::Integer,
            TokenKind::RightParen,
            TokenKind::RightParen,
            TokenKind::InterpolationEnd,
            TokenKind::InterpolatedStringEnd,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn adjacent_interpolations() {
        assert_eq!(kinds(r#""\(a)\(b)""#), vec![
            TokenKind::InterpolatedStringStart,
            TokenKind::InterpolationStart,
            TokenKind::Identifier,
            TokenKind::InterpolationEnd,
            TokenKind::InterpolationStart,
            TokenKind::Identifier,
            TokenKind::InterpolationEnd,
            TokenKind::InterpolatedStringEnd,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn keywords_and_positions() {
        let tokens = Lexer::new("let x = true\nvar y").tokenize_all();
        assert_eq!(tokens[0].kind, TokenKind::Let);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[4].kind, TokenKind::Var);
        assert_eq!(tokens[4].line, 2);
    }

    #[test]
    fn unexpected_character() {
        let tokens = Lexer::new("let $x").tokenize_all();
        assert_eq!(tokens[1].kind, TokenKind::Error);
        assert_eq!(tokens[1].lexeme, "Unexpected character");
    }
}
