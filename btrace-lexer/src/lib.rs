use logos::Logos;

/// Unescape a string literal body.
///
/// Recognised escapes are \n \t \\ \" only; anything else keeps its
/// backslash so the printer can reproduce the source form exactly.
fn unescape_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('"') => result.push('"'),
                Some('\\') => result.push('\\'),
                Some(c) => {
                    result.push('\\');
                    result.push(c);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Pull the file name out of an `#include <f>` / `#include "f"` slice.
fn include_file(slice: &str) -> String {
    let start = slice
        .find(['<', '"'])
        .map(|i| i + 1)
        .unwrap_or(slice.len());
    let body = &slice[start..];
    body[..body.len().saturating_sub(1)].to_string()
}

/// Token types for the btrace script language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    // Preprocessor-style includes, preserved as opaque file names
    #[regex(r"#include[ \t]*<[^>\n]+>", |lex| include_file(lex.slice()))]
    IncludeSystem(String),
    #[regex(r#"#include[ \t]*"[^"\n]+""#, |lex| include_file(lex.slice()))]
    IncludeLocal(String),

    // Keywords
    #[token("struct")]
    Struct,
    #[token("BEGIN")]
    Begin,
    #[token("END")]
    End,

    // Provider-qualified attach points, wildcards and character classes
    // included: kprobe:sys_*, uprobe:/bin/sh:foo, tracepoint:syscalls:sys_enter_open,
    // profile:ms:997. Expansion happens in the runtime; the lexer keeps the
    // source text after the provider untouched.
    #[regex(r"(kprobe|kretprobe|uprobe|uretprobe|tracepoint|profile):[^\s,{}]+", |lex| lex.slice().to_string())]
    AttachPoint(String),

    // Sigil-prefixed identifiers; `@` alone names the anonymous map
    #[regex(r"@[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice()[1..].to_string())]
    #[token("@", |_| String::new())]
    MapIdent(String),
    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice()[1..].to_string())]
    VarIdent(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Literals: decimal integers only
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len()-1])
    })]
    Str(String),

    // Operators (compound before single)
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("&&")]
    LAnd,
    #[token("||")]
    LOr,
    #[token("->")]
    Arrow,
    #[token("=")]
    Assign,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
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
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token(".")]
    Dot,

    // Delimiters
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
    Semicolon,

    // Comments (skip)
    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,
    #[regex(r"/\*([^*]|\*[^/])*\*/", logos::skip)]
    BlockComment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub token: Token,
    pub span: std::ops::Range<usize>,
}

pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<TokenSpan, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.inner.next()?;
        let span = self.inner.span();

        match token {
            Ok(tok) => Some(Ok(TokenSpan { token: tok, span })),
            Err(_) => Some(Err(LexError::InvalidToken { span })),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LexError {
    #[error("Invalid token at {span:?}")]
    InvalidToken { span: std::ops::Range<usize> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source).map(|r| r.unwrap().token).collect()
    }

    #[test]
    fn test_probe_header() {
        let toks = tokens("kprobe:sys_open { pid }");
        assert_eq!(toks[0], Token::AttachPoint("kprobe:sys_open".to_string()));
        assert_eq!(toks[1], Token::LBrace);
        assert_eq!(toks[2], Token::Ident("pid".to_string()));
        assert_eq!(toks[3], Token::RBrace);
    }

    #[test]
    fn test_attach_point_wildcards_survive() {
        assert_eq!(
            tokens("kprobe:sys_*")[0],
            Token::AttachPoint("kprobe:sys_*".to_string())
        );
        assert_eq!(
            tokens("kprobe:[Ss]y[Ss]_read")[0],
            Token::AttachPoint("kprobe:[Ss]y[Ss]_read".to_string())
        );
        assert_eq!(
            tokens("uprobe:/bin/sh:foo")[0],
            Token::AttachPoint("uprobe:/bin/sh:foo".to_string())
        );
        assert_eq!(
            tokens("profile:ms:997")[0],
            Token::AttachPoint("profile:ms:997".to_string())
        );
    }

    #[test]
    fn test_sigils() {
        assert_eq!(tokens("@x")[0], Token::MapIdent("x".to_string()));
        assert_eq!(tokens("@")[0], Token::MapIdent(String::new()));
        assert_eq!(tokens("$myvar")[0], Token::VarIdent("myvar".to_string()));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""newline\nand tab\tbackslash\\quote\"here""#)[0],
            Token::Str("newline\nand tab\tbackslash\\quote\"here".to_string())
        );
        // Unknown escapes keep their backslash
        assert_eq!(tokens(r#""\q""#)[0], Token::Str("\\q".to_string()));
    }

    #[test]
    fn test_includes() {
        let toks = tokens("#include <stdio.h> #include \"blah\"");
        assert_eq!(toks[0], Token::IncludeSystem("stdio.h".to_string()));
        assert_eq!(toks[1], Token::IncludeLocal("blah".to_string()));
    }

    #[test]
    fn test_comments_skipped() {
        let toks = tokens("1 // line\n/* block\n comment */ 2");
        assert_eq!(toks, vec![Token::Int(1), Token::Int(2)]);
    }

    #[test]
    fn test_begin_and_keywords() {
        let toks = tokens("BEGIN END struct BEGINx");
        assert_eq!(toks[0], Token::Begin);
        assert_eq!(toks[1], Token::End);
        assert_eq!(toks[2], Token::Struct);
        assert_eq!(toks[3], Token::Ident("BEGINx".to_string()));
    }

    #[test]
    fn test_operators() {
        let toks = tokens("a == b != c <= d && e || f -> g");
        assert_eq!(toks[1], Token::EqEq);
        assert_eq!(toks[3], Token::Ne);
        assert_eq!(toks[5], Token::Le);
        assert_eq!(toks[7], Token::LAnd);
        assert_eq!(toks[9], Token::LOr);
        assert_eq!(toks[11], Token::Arrow);
    }

    #[test]
    fn test_predicate_slashes() {
        let toks = tokens("kprobe:sys_open /100/25/ { 1; }");
        assert_eq!(
            toks,
            vec![
                Token::AttachPoint("kprobe:sys_open".to_string()),
                Token::Slash,
                Token::Int(100),
                Token::Slash,
                Token::Int(25),
                Token::Slash,
                Token::LBrace,
                Token::Int(1),
                Token::Semicolon,
                Token::RBrace,
            ]
        );
    }
}
