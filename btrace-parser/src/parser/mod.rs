// Recursive-descent parser for btrace scripts
// This module organizes the parser into logical components

use std::collections::HashSet;

use crate::ParseError;
use btrace_diagnostics::Span;
use btrace_lexer::{LexError, Lexer, Token, TokenSpan};

// Sub-modules for different parsing responsibilities
mod expressions;
mod probes;
mod structs;

/// C primitive type names accepted in struct fields and casts.
const PRIMITIVE_TYPES: &[&str] = &["int", "char", "short", "long", "unsigned", "void"];

pub struct Parser<'a> {
    pub(crate) tokens: Vec<TokenSpan>,
    pub(crate) current: usize,
    pub(crate) source: &'a str,
    /// Exclusive upper bound while parsing a predicate body; tokens at or
    /// beyond it are treated as end of input.
    pub(crate) limit: Option<usize>,
    /// Struct names declared so far plus the primitive type keywords.
    /// Drives the cast-vs-grouped-expression decision.
    pub(crate) type_names: HashSet<String>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, ParseError> {
        let tokens: Result<Vec<_>, _> = Lexer::new(source).collect();
        let tokens = tokens.map_err(|e| match e {
            LexError::InvalidToken { span } => ParseError::LexerError {
                location: Span::from_offset(source, span).to_string(),
            },
        })?;

        let mut type_names = HashSet::new();
        for name in PRIMITIVE_TYPES {
            type_names.insert((*name).to_string());
        }

        Ok(Self {
            tokens,
            current: 0,
            source,
            limit: None,
            type_names,
        })
    }

    pub fn parse(&mut self) -> Result<btrace_ast::Program, ParseError> {
        let mut includes = Vec::new();
        let mut structs = Vec::new();
        let mut probes = Vec::new();

        while !self.is_at_end() {
            match self.peek() {
                Token::IncludeSystem(file) => {
                    includes.push(btrace_ast::Include {
                        file: file.clone(),
                        system_header: true,
                    });
                    self.advance();
                }
                Token::IncludeLocal(file) => {
                    includes.push(btrace_ast::Include {
                        file: file.clone(),
                        system_header: false,
                    });
                    self.advance();
                }
                Token::Struct => {
                    let decl = self.parse_struct_decl()?;
                    self.type_names.insert(decl.name.clone());
                    structs.push(decl);
                }
                _ => probes.push(self.parse_probe()?),
            }
        }

        if probes.is_empty() {
            return Err(self.error("expected at least one probe"));
        }

        Ok(btrace_ast::Program {
            includes,
            structs,
            probes,
        })
    }

    // ==================== Helper Methods ====================

    pub(crate) fn match_token(&mut self, kind: &Token) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn check(&self, kind: &Token) -> bool {
        if self.is_at_end() {
            false
        } else {
            std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
        }
    }

    pub(crate) fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        &self.tokens[self.current - 1].token
    }

    pub(crate) fn effective_end(&self) -> usize {
        self.limit.unwrap_or(self.tokens.len())
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.current >= self.effective_end()
    }

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current].token
    }

    /// Token at an absolute index, None past the effective end.
    pub(crate) fn token_at(&self, index: usize) -> Option<&Token> {
        if index < self.effective_end() {
            Some(&self.tokens[index].token)
        } else {
            None
        }
    }

    pub(crate) fn current_span(&self) -> Span {
        match self.tokens.get(self.current) {
            Some(ts) => Span::from_offset(self.source, ts.span.clone()),
            None => Span::from_offset(self.source, self.source.len()..self.source.len()),
        }
    }

    pub(crate) fn consume(&mut self, kind: &Token, message: &str) -> Result<(), ParseError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    pub(crate) fn error(&self, message: &str) -> ParseError {
        let location = match self.tokens.get(self.current) {
            Some(ts) => Span::from_offset(self.source, ts.span.clone()).to_string(),
            None => "end of file".to_string(),
        };

        ParseError::SyntaxError {
            location,
            message: message.to_string(),
        }
    }
}
