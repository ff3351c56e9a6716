//! Tokenizer for map expressions.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source.
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    Identifier,
    LParen, RParen, LBracket, RBracket,
    Comma, Semicolon, Question, Colon,
    Assign,
    Eq, Neq, Lt, Lte, Gt, Gte,
    Plus, Minus, Star, Slash, Percent, Caret,
    And, Or, Not,
    /// Always the last token; its offset is the source length.
    End,
}

/// Symbols, longest spelling first so `<=` wins over `<`.
const SYMBOLS: &[(&str, TokenKind)] = &[
    ("==", TokenKind::Eq),
    ("!=", TokenKind::Neq),
    ("<=", TokenKind::Lte),
    (">=", TokenKind::Gte),
    ("&&", TokenKind::And),
    ("||", TokenKind::Or),
    ("=", TokenKind::Assign),
    ("!", TokenKind::Not),
    ("<", TokenKind::Lt),
    (">", TokenKind::Gt),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    (",", TokenKind::Comma),
    (";", TokenKind::Semicolon),
    ("?", TokenKind::Question),
    (":", TokenKind::Colon),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("^", TokenKind::Caret),
];

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut at = 0;

    while let Some(c) = source[at..].chars().next() {
        let rest = &source[at..];
        if c.is_whitespace() {
            at += c.len_utf8();
            continue;
        }

        let (kind, len) = if c.is_ascii_digit() || (c == '.' && starts_with_digit(&rest[1..])) {
            (TokenKind::Number, number_len(rest))
        } else if c.is_alphabetic() || c == '_' {
            let len = rest
                .find(|d: char| !(d.is_alphanumeric() || d == '_'))
                .unwrap_or(rest.len());
            (TokenKind::Identifier, len)
        } else if let Some(&(text, kind)) = SYMBOLS.iter().find(|entry| rest.starts_with(entry.0)) {
            (kind, text.len())
        } else {
            return Err(Error::SyntaxError {
                position: at,
                message: format!("unexpected character '{c}'"),
            });
        };

        tokens.push(Token { kind, offset: at, text: rest[..len].to_owned() });
        at += len;
    }

    tokens.push(Token { kind: TokenKind::End, offset: source.len(), text: String::new() });
    Ok(tokens)
}

fn starts_with_digit(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_digit())
}

/// Length of the numeric literal at the start of `s`: digits, an optional
/// fraction, and an exponent only when digits follow the `e`.
fn number_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let digits = |from: usize| bytes[from..].iter().take_while(|b| b.is_ascii_digit()).count();

    let mut len = digits(0);
    if bytes.get(len) == Some(&b'.') {
        len += 1 + digits(len + 1);
    }
    if matches!(bytes.get(len), Some(b'e' | b'E')) {
        let mut exp = len + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let n = digits(exp);
        if n > 0 {
            len = exp + n;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use TokenKind::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_scale_expression() {
        assert_eq!(kinds("y=x*100"), vec![Identifier, Assign, Identifier, Star, Number, End]);
    }

    #[test]
    fn test_number_forms() {
        let texts: Vec<String> = tokenize("1.5 .25 2e3 4E-2")
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["1.5", ".25", "2e3", "4E-2", ""]);
        // no digits after the `e`: it is a name
        assert_eq!(kinds("2e"), vec![Number, Identifier, End]);
    }

    #[test]
    fn test_two_character_symbols() {
        assert_eq!(
            kinds("a==b != c <= d && !e || f"),
            vec![
                Identifier, Eq, Identifier, Neq, Identifier, Lte, Identifier, And,
                Not, Identifier, Or, Identifier, End,
            ]
        );
        assert_eq!(kinds("k>0?k:-k"), vec![
            Identifier, Gt, Number, Question, Identifier, Colon, Minus, Identifier, End,
        ]);
    }

    #[test]
    fn test_offsets() {
        let tokens = tokenize("y = x[1]").unwrap();
        let offsets: Vec<usize> = tokens.iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![0, 2, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_unexpected_character() {
        match tokenize("y = x # 2") {
            Err(Error::SyntaxError { position, .. }) => assert_eq!(position, 6),
            other => panic!("expected syntax error, got {other:?}"),
        }
        assert!(tokenize("y = x & 1").is_err());
    }
}
