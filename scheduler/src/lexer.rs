// Lexer for loop-program source files (`.lp`).
//
// Tokenizes the brace syntax used for procedures and instruction
// definitions. Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Loop-program token types.
///
/// Identifiers carry no value; use the span to retrieve the text from the
/// source. Newlines are insignificant: statements end with `;` or `}`.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("proc")]
    Proc,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("seq")]
    Seq,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("pass")]
    Pass,

    // ── Symbols ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token("@")]
    At,
    #[token("=")]
    Equals,
    #[token("+=")]
    PlusEquals,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,

    // ── Literals ──
    /// Non-negative integer literal; negation is a unary operator.
    #[regex(r"[0-9]+", parse_int)]
    Int(i64),

    // ── Identifier ──
    //
    // Placed after keywords; logos prioritises fixed `#[token]` matches
    // over regex for the same length, so `for` matches For, not Ident.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Proc => write!(f, "proc"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Seq => write!(f, "seq"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::Pass => write!(f, "pass"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::At => write!(f, "@"),
            Token::Equals => write!(f, "="),
            Token::PlusEquals => write!(f, "+="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

// ── Public API ──

/// Lex a loop-program source string into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal: errors are collected and
/// the lexer continues past bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(result.errors.is_empty(), "lex errors: {:?}", result.errors);
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("proc for in seq if else pass forx"),
            vec![
                Token::Proc,
                Token::For,
                Token::In,
                Token::Seq,
                Token::If,
                Token::Else,
                Token::Pass,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn compound_operators_win() {
        assert_eq!(
            kinds("+= + <= < >= > == = && ||"),
            vec![
                Token::PlusEquals,
                Token::Plus,
                Token::Le,
                Token::Lt,
                Token::Ge,
                Token::Gt,
                Token::EqEq,
                Token::Equals,
                Token::AndAnd,
                Token::OrOr,
            ]
        );
    }

    #[test]
    fn integers_and_negation() {
        assert_eq!(
            kinds("-16 42"),
            vec![Token::Minus, Token::Int(16), Token::Int(42)]
        );
    }

    #[test]
    fn comments_and_newlines_skipped() {
        assert_eq!(
            kinds("a # trailing comment\n\n  ; # another\n"),
            vec![Token::Ident, Token::Semi]
        );
    }

    #[test]
    fn identifier_spans() {
        let src = "out_tile[ioi]";
        let result = lex(src);
        let (tok, span) = &result.tokens[0];
        assert_eq!(*tok, Token::Ident);
        assert_eq!(&src[span.start..span.end], "out_tile");
    }

    #[test]
    fn bad_character_is_non_fatal() {
        let result = lex("a $ b");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 2, end: 3 });
        assert_eq!(result.tokens.len(), 2);
    }
}
