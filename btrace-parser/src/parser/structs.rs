// C-style struct declarations: `struct Foo { int n; char *s[32]; }`
// Fields may be grouped: `int a,*b,c;`

use super::Parser;
use crate::ParseError;
use btrace_ast::{StructDecl, StructField};
use btrace_lexer::Token;

impl<'a> Parser<'a> {
    pub(crate) fn parse_struct_decl(&mut self) -> Result<StructDecl, ParseError> {
        self.consume(&Token::Struct, "expected 'struct'")?;
        let name = self.consume_ident("expected struct name")?;
        self.consume(&Token::LBrace, "expected '{' after struct name")?;

        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) && !self.is_at_end() {
            self.parse_field_group(&mut fields)?;
        }

        self.consume(&Token::RBrace, "expected '}' after struct fields")?;
        Ok(StructDecl { name, fields })
    }

    /// One declaration line: a type followed by comma-separated
    /// declarators, each `*`-qualified and `[N]`-suffixed independently.
    fn parse_field_group(&mut self, fields: &mut Vec<StructField>) -> Result<(), ParseError> {
        // Nested struct fields name their type as `struct Bar b`; the
        // keyword is dropped from the recorded type name.
        self.match_token(&Token::Struct);
        let type_name = self.consume_ident("expected field type")?;

        loop {
            let is_ptr = self.match_token(&Token::Star);
            let name = self.consume_ident("expected field name")?;

            let mut array_size = 1;
            if self.match_token(&Token::LBracket) {
                array_size = match self.peek().clone() {
                    Token::Int(n) if n > 0 => {
                        self.advance();
                        n as usize
                    }
                    _ => return Err(self.error("expected array length")),
                };
                self.consume(&Token::RBracket, "expected ']'")?;
            }

            fields.push(StructField {
                type_name: type_name.clone(),
                is_ptr,
                array_size,
                name,
            });

            if !self.match_token(&Token::Comma) {
                break;
            }
        }

        self.consume(&Token::Semicolon, "expected ';' after field")?;
        Ok(())
    }

    fn consume_ident(&mut self, message: &str) -> Result<String, ParseError> {
        if self.is_at_end() {
            return Err(self.error(message));
        }
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }
}
