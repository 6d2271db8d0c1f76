//! Lexer: source text to a spanned token stream.
//!
//! Whitespace- and newline-sensitive: newlines are tokens (declarations are
//! line-oriented and newlines separate record/list elements), `#` starts a
//! line comment, and duration literals like `5s` or `250ms` are single
//! tokens. String literals are pre-split into literal and `${...}`
//! interpolation segments; the parser re-parses each segment.

use std::time::Duration;

use crate::error::ParseError;
use crate::span::Span;

/// A raw segment of a string literal.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPart {
    Lit(String),
    /// The text between `${` and `}` plus its byte offset in the source,
    /// so re-parsed spans stay accurate.
    Expr { text: String, offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Newline,
    Ident(String),
    KwIn,
    KwOut,
    KwType,
    KwUse,
    KwIf,
    KwThen,
    KwElse,
    KwBranch,
    KwMatch,
    KwOtherwise,
    KwWhen,
    KwAnd,
    KwOr,
    KwNot,
    KwWith,
    KwAs,
    KwTrue,
    KwFalse,
    Int(i64),
    Float(f64),
    Duration(Duration),
    Str(Vec<RawPart>),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Plus,
    Question,
    QuestionQuestion,
    Arrow,
    FatArrow,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    At,
    Slash,
    Pipe,
}

impl Tok {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Newline => "end of line".into(),
            Tok::Ident(name) => format!("'{name}'"),
            Tok::KwIn => "'in'".into(),
            Tok::KwOut => "'out'".into(),
            Tok::KwType => "'type'".into(),
            Tok::KwUse => "'use'".into(),
            Tok::KwIf => "'if'".into(),
            Tok::KwThen => "'then'".into(),
            Tok::KwElse => "'else'".into(),
            Tok::KwBranch => "'branch'".into(),
            Tok::KwMatch => "'match'".into(),
            Tok::KwOtherwise => "'otherwise'".into(),
            Tok::KwWhen => "'when'".into(),
            Tok::KwAnd => "'and'".into(),
            Tok::KwOr => "'or'".into(),
            Tok::KwNot => "'not'".into(),
            Tok::KwWith => "'with'".into(),
            Tok::KwAs => "'as'".into(),
            Tok::KwTrue => "'true'".into(),
            Tok::KwFalse => "'false'".into(),
            Tok::Int(i) => format!("'{i}'"),
            Tok::Float(x) => format!("'{x}'"),
            Tok::Duration(_) => "duration".into(),
            Tok::Str(_) => "string".into(),
            Tok::LParen => "'('".into(),
            Tok::RParen => "')'".into(),
            Tok::LBrace => "'{'".into(),
            Tok::RBrace => "'}'".into(),
            Tok::LBracket => "'['".into(),
            Tok::RBracket => "']'".into(),
            Tok::Comma => "','".into(),
            Tok::Colon => "':'".into(),
            Tok::Dot => "'.'".into(),
            Tok::Plus => "'+'".into(),
            Tok::Question => "'?'".into(),
            Tok::QuestionQuestion => "'??'".into(),
            Tok::Arrow => "'->'".into(),
            Tok::FatArrow => "'=>'".into(),
            Tok::Assign => "'='".into(),
            Tok::EqEq => "'=='".into(),
            Tok::NotEq => "'!='".into(),
            Tok::Lt => "'<'".into(),
            Tok::Gt => "'>'".into(),
            Tok::Le => "'<='".into(),
            Tok::Ge => "'>='".into(),
            Tok::At => "'@'".into(),
            Tok::Slash => "'/'".into(),
            Tok::Pipe => "'|'".into(),
        }
    }
}

/// A token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "in" => Tok::KwIn,
        "out" => Tok::KwOut,
        "type" => Tok::KwType,
        "use" => Tok::KwUse,
        "if" => Tok::KwIf,
        "then" => Tok::KwThen,
        "else" => Tok::KwElse,
        "branch" => Tok::KwBranch,
        "match" => Tok::KwMatch,
        "otherwise" => Tok::KwOtherwise,
        "when" => Tok::KwWhen,
        "and" => Tok::KwAnd,
        "or" => Tok::KwOr,
        "not" => Tok::KwNot,
        "with" => Tok::KwWith,
        "as" => Tok::KwAs,
        "true" => Tok::KwTrue,
        "false" => Tok::KwFalse,
        _ => return None,
    })
}

/// Lexes a full source file. Consecutive newlines collapse to one token;
/// identifiers are ASCII only.
pub fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer {
        source,
        bytes: source.as_bytes(),
        pos: 0,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        while self.pos < self.bytes.len() {
            let start = self.pos;
            let c = self.bytes[self.pos];
            match c {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'#' => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'\n' => {
                    self.pos += 1;
                    if !matches!(self.tokens.last(), Some(Token { tok: Tok::Newline, .. }) | None) {
                        self.push(Tok::Newline, start);
                    }
                }
                b'"' => self.lex_string()?,
                b'0'..=b'9' => self.lex_number(false)?,
                b'-' => {
                    if self.peek(1).is_some_and(|b| b.is_ascii_digit()) {
                        self.pos += 1;
                        self.lex_number(true)?;
                    } else if self.peek(1) == Some(b'>') {
                        self.pos += 2;
                        self.push(Tok::Arrow, start);
                    } else {
                        return Err(self.unexpected(start, "'-'"));
                    }
                }
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                    while self
                        .peek(0)
                        .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
                    {
                        self.pos += 1;
                    }
                    let word = &self.source[start..self.pos];
                    let tok = keyword(word).unwrap_or_else(|| Tok::Ident(word.to_string()));
                    self.push(tok, start);
                }
                b'(' => self.single(Tok::LParen),
                b')' => self.single(Tok::RParen),
                b'{' => self.single(Tok::LBrace),
                b'}' => self.single(Tok::RBrace),
                b'[' => self.single(Tok::LBracket),
                b']' => self.single(Tok::RBracket),
                b',' => self.single(Tok::Comma),
                b':' => self.single(Tok::Colon),
                b'.' => self.single(Tok::Dot),
                b'+' => self.single(Tok::Plus),
                b'@' => self.single(Tok::At),
                b'/' => self.single(Tok::Slash),
                b'|' => self.single(Tok::Pipe),
                b'?' => {
                    if self.peek(1) == Some(b'?') {
                        self.pos += 2;
                        self.push(Tok::QuestionQuestion, start);
                    } else {
                        self.single(Tok::Question);
                    }
                }
                b'=' => match self.peek(1) {
                    Some(b'=') => {
                        self.pos += 2;
                        self.push(Tok::EqEq, start);
                    }
                    Some(b'>') => {
                        self.pos += 2;
                        self.push(Tok::FatArrow, start);
                    }
                    _ => self.single(Tok::Assign),
                },
                b'!' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        self.push(Tok::NotEq, start);
                    } else {
                        return Err(self.unexpected(start, "'!'"));
                    }
                }
                b'<' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        self.push(Tok::Le, start);
                    } else {
                        self.single(Tok::Lt);
                    }
                }
                b'>' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        self.push(Tok::Ge, start);
                    } else {
                        self.single(Tok::Gt);
                    }
                }
                other => {
                    return Err(self.unexpected(start, format!("'{}'", other as char)));
                }
            }
        }
        Ok(self.tokens)
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn single(&mut self, tok: Tok) {
        let start = self.pos;
        self.pos += 1;
        self.push(tok, start);
    }

    fn push(&mut self, tok: Tok, start: usize) {
        self.tokens.push(Token {
            tok,
            span: Span::new(start, self.pos),
        });
    }

    fn unexpected(&self, at: usize, what: impl Into<String>) -> ParseError {
        ParseError::new(
            Span::new(at, at + 1),
            format!("unexpected character {}", what.into()),
        )
    }

    fn lex_number(&mut self, negative: bool) -> Result<(), ParseError> {
        let start = if negative { self.pos - 1 } else { self.pos };
        let digits_start = self.pos;
        while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek(0) == Some(b'.') && self.peek(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.source[start..self.pos];

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| ParseError::new(Span::new(start, self.pos), "invalid float literal"))?;
            self.push(Tok::Float(value), start);
            return Ok(());
        }

        // A unit suffix directly after the digits makes a duration literal.
        if !negative {
            if let Some(unit_len) = self.duration_unit_len() {
                let magnitude: u64 = self.source[digits_start..self.pos].parse().map_err(|_| {
                    ParseError::new(Span::new(start, self.pos), "invalid duration magnitude")
                })?;
                let unit = &self.source[self.pos..self.pos + unit_len];
                self.pos += unit_len;
                let duration = match unit {
                    "ms" => Duration::from_millis(magnitude),
                    "s" => Duration::from_secs(magnitude),
                    "min" => Duration::from_secs(magnitude * 60),
                    "h" => Duration::from_secs(magnitude * 3600),
                    "d" => Duration::from_secs(magnitude * 86_400),
                    _ => unreachable!(),
                };
                self.push(Tok::Duration(duration), start);
                return Ok(());
            }
        }

        let value: i64 = text
            .parse()
            .map_err(|_| ParseError::new(Span::new(start, self.pos), "integer literal too large"))?;
        self.push(Tok::Int(value), start);
        Ok(())
    }

    /// Length of a duration unit at the cursor, if the characters after it
    /// do not continue an identifier.
    fn duration_unit_len(&self) -> Option<usize> {
        let rest = &self.source[self.pos..];
        for unit in ["ms", "min", "s", "h", "d"] {
            if let Some(after) = rest.strip_prefix(unit) {
                let next = after.bytes().next();
                if !next.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
                    return Some(unit.len());
                }
            }
        }
        None
    }

    fn lex_string(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut parts: Vec<RawPart> = Vec::new();
        let mut lit = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(ParseError::new(
                    Span::new(start, self.pos),
                    "unterminated string literal",
                ));
            };
            match c {
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    let escaped = self.peek(1).ok_or_else(|| {
                        ParseError::new(Span::new(self.pos, self.pos + 1), "dangling escape")
                    })?;
                    let replacement = match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        b'\\' => '\\',
                        b'"' => '"',
                        b'$' => '$',
                        other => {
                            return Err(ParseError::new(
                                Span::new(self.pos, self.pos + 2),
                                format!("unknown escape '\\{}'", other as char),
                            ))
                        }
                    };
                    lit.push(replacement);
                    self.pos += 2;
                }
                b'$' if self.peek(1) == Some(b'{') => {
                    if !lit.is_empty() {
                        parts.push(RawPart::Lit(std::mem::take(&mut lit)));
                    }
                    self.pos += 2;
                    let expr_start = self.pos;
                    let mut depth = 1usize;
                    while depth > 0 {
                        let Some(c) = self.peek(0) else {
                            return Err(ParseError::new(
                                Span::new(expr_start, self.pos),
                                "unterminated interpolation",
                            ));
                        };
                        match c {
                            b'{' => depth += 1,
                            b'}' => depth -= 1,
                            b'\n' => {
                                return Err(ParseError::new(
                                    Span::new(expr_start, self.pos),
                                    "newline inside interpolation",
                                ))
                            }
                            _ => {}
                        }
                        if depth > 0 {
                            self.pos += 1;
                        }
                    }
                    parts.push(RawPart::Expr {
                        text: self.source[expr_start..self.pos].to_string(),
                        offset: expr_start,
                    });
                    self.pos += 1; // closing brace
                }
                b'\n' => {
                    return Err(ParseError::new(
                        Span::new(start, self.pos),
                        "unterminated string literal",
                    ))
                }
                _ => {
                    // Advance one full UTF-8 character.
                    let ch_len = self.source[self.pos..]
                        .chars()
                        .next()
                        .map_or(1, char::len_utf8);
                    lit.push_str(&self.source[self.pos..self.pos + ch_len]);
                    self.pos += ch_len;
                }
            }
        }
        if !lit.is_empty() || parts.is_empty() {
            parts.push(RawPart::Lit(lit));
        }
        self.push(Tok::Str(parts), start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        lex(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn lexes_declaration_line() {
        assert_eq!(
            toks("in text: String"),
            vec![
                Tok::KwIn,
                Tok::Ident("text".into()),
                Tok::Colon,
                Tok::Ident("String".into()),
            ]
        );
    }

    #[test]
    fn newlines_collapse_and_leading_is_dropped() {
        assert_eq!(
            toks("\n\na = b\n\n\nc = d\n"),
            vec![
                Tok::Ident("a".into()),
                Tok::Assign,
                Tok::Ident("b".into()),
                Tok::Newline,
                Tok::Ident("c".into()),
                Tok::Assign,
                Tok::Ident("d".into()),
                Tok::Newline,
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            toks("a = 1 # the whole rest # is ignored\nb = 2"),
            vec![
                Tok::Ident("a".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Assign,
                Tok::Int(2),
            ]
        );
    }

    #[test]
    fn durations_and_rates() {
        assert_eq!(
            toks("5s 250ms 2min 1h 3d"),
            vec![
                Tok::Duration(Duration::from_secs(5)),
                Tok::Duration(Duration::from_millis(250)),
                Tok::Duration(Duration::from_secs(120)),
                Tok::Duration(Duration::from_secs(3600)),
                Tok::Duration(Duration::from_secs(259_200)),
            ]
        );
        assert_eq!(
            toks("10/1s"),
            vec![
                Tok::Int(10),
                Tok::Slash,
                Tok::Duration(Duration::from_secs(1)),
            ]
        );
    }

    #[test]
    fn unit_suffix_requires_word_boundary() {
        // `5seconds` is not a duration followed by junk; `5` then ident.
        assert_eq!(
            toks("5seconds"),
            vec![Tok::Int(5), Tok::Ident("seconds".into())]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            toks("42 -7 3.25"),
            vec![Tok::Int(42), Tok::Int(-7), Tok::Float(3.25)]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            toks("?? ? -> => == = != <= < >= > + | @"),
            vec![
                Tok::QuestionQuestion,
                Tok::Question,
                Tok::Arrow,
                Tok::FatArrow,
                Tok::EqEq,
                Tok::Assign,
                Tok::NotEq,
                Tok::Le,
                Tok::Lt,
                Tok::Ge,
                Tok::Gt,
                Tok::Plus,
                Tok::Pipe,
                Tok::At,
            ]
        );
    }

    #[test]
    fn plain_string() {
        assert_eq!(
            toks(r#""hello\nworld""#),
            vec![Tok::Str(vec![RawPart::Lit("hello\nworld".into())])]
        );
    }

    #[test]
    fn interpolated_string_splits_parts() {
        let tokens = toks(r#""a ${x.y} b""#);
        let Tok::Str(parts) = &tokens[0] else {
            panic!("expected string token");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], RawPart::Lit("a ".into()));
        assert!(matches!(&parts[1], RawPart::Expr { text, .. } if text == "x.y"));
        assert_eq!(parts[2], RawPart::Lit(" b".into()));
    }

    #[test]
    fn escaped_dollar_is_literal() {
        assert_eq!(
            toks(r#""\${x}""#),
            vec![Tok::Str(vec![RawPart::Lit("${x}".into())])]
        );
    }

    #[test]
    fn empty_string_is_one_empty_part() {
        assert_eq!(toks(r#""""#), vec![Tok::Str(vec![RawPart::Lit(String::new())])]);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex("\"abc").is_err());
    }

    #[test]
    fn spans_are_byte_accurate() {
        let tokens = lex("in  text").unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 2));
        assert_eq!(tokens[1].span, Span::new(4, 8));
    }

    #[test]
    fn non_ascii_identifier_is_rejected() {
        assert!(lex("café = 1").is_err());
    }
}
