// Probe parsing: attach-point lists, predicates, statement blocks

use super::Parser;
use crate::ParseError;
use btrace_ast::*;
use btrace_lexer::Token;

impl<'a> Parser<'a> {
    pub(crate) fn parse_probe(&mut self) -> Result<Probe, ParseError> {
        let mut attach_points = vec![self.parse_attach_point()?];
        while self.match_token(&Token::Comma) {
            attach_points.push(self.parse_attach_point()?);
        }

        let predicate = if self.check(&Token::Slash) {
            Some(self.parse_predicate()?)
        } else {
            None
        };

        let stmts = self.parse_block()?;

        Ok(Probe {
            attach_points,
            predicate,
            stmts,
        })
    }

    fn parse_attach_point(&mut self) -> Result<AttachPoint, ParseError> {
        if self.is_at_end() {
            return Err(self.error("expected attach point"));
        }
        let span = self.current_span();

        let empty = |provider: &str| AttachPoint {
            provider: provider.to_string(),
            target: String::new(),
            func: String::new(),
            freq: 0,
            span,
        };

        match self.peek().clone() {
            Token::Begin => {
                self.advance();
                Ok(empty("BEGIN"))
            }
            Token::End => {
                self.advance();
                Ok(empty("END"))
            }
            Token::AttachPoint(text) => {
                self.advance();
                self.split_attach_point(&text, span)
            }
            _ => Err(self.error("expected attach point")),
        }
    }

    /// Split the lexer's raw `provider:rest` text into provider fields.
    fn split_attach_point(&self, text: &str, span: btrace_diagnostics::Span) -> Result<AttachPoint, ParseError> {
        let (provider, rest) = match text.split_once(':') {
            Some(parts) => parts,
            None => return Err(self.error("malformed attach point")),
        };

        let mut ap = AttachPoint {
            provider: provider.to_string(),
            target: String::new(),
            func: String::new(),
            freq: 0,
            span,
        };

        match provider {
            "kprobe" | "kretprobe" => {
                ap.func = rest.to_string();
            }
            "uprobe" | "uretprobe" => {
                // The function is the last segment; the path may itself
                // contain colons.
                match rest.rsplit_once(':') {
                    Some((target, func)) if !target.is_empty() && !func.is_empty() => {
                        ap.target = target.to_string();
                        ap.func = func.to_string();
                    }
                    _ => return Err(self.error("expected uprobe:<path>:<func>")),
                }
            }
            "tracepoint" => match rest.split_once(':') {
                Some((target, func)) if !target.is_empty() && !func.is_empty() => {
                    ap.target = target.to_string();
                    ap.func = func.to_string();
                }
                _ => return Err(self.error("expected tracepoint:<target>:<func>")),
            },
            "profile" => match rest.split_once(':') {
                Some((unit, freq)) => {
                    ap.target = unit.to_string();
                    ap.freq = freq
                        .parse()
                        .map_err(|_| self.error("profile frequency must be an integer"))?;
                }
                None => return Err(self.error("expected profile:<unit>:<freq>")),
            },
            _ => return Err(self.error("unknown probe provider")),
        }

        Ok(ap)
    }

    /// Parse `/ expr /`. A `/` inside the predicate is binary division:
    /// the terminator is the last `/` before the probe's `{`, so scan
    /// forward for it instead of taking the first one.
    fn parse_predicate(&mut self) -> Result<Predicate, ParseError> {
        let span = self.current_span();
        self.consume(&Token::Slash, "expected '/'")?;

        let lbrace = (self.current..self.tokens.len())
            .find(|&i| self.tokens[i].token == Token::LBrace)
            .ok_or_else(|| self.error("expected '{' after predicate"))?;
        let close = (self.current..lbrace)
            .rev()
            .find(|&i| self.tokens[i].token == Token::Slash)
            .ok_or_else(|| self.error("unterminated predicate"))?;

        self.limit = Some(close);
        let expr = self.parse_expression()?;
        if self.current != close {
            return Err(self.error("unexpected token in predicate"));
        }
        self.limit = None;
        self.current = close + 1;

        Ok(Predicate { expr, span })
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.consume(&Token::LBrace, "expected '{'")?;
        let mut stmts = Vec::new();

        while !self.check(&Token::RBrace) && !self.is_at_end() {
            stmts.push(self.parse_statement()?);
            // Statements are semicolon-separated; the final semicolon is
            // optional.
            if !self.match_token(&Token::Semicolon) {
                break;
            }
        }

        self.consume(&Token::RBrace, "expected '}'")?;
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        if self.check(&Token::MapIdent(String::new())) {
            let checkpoint = self.current;
            let map = self.parse_map_reference()?;
            if self.match_token(&Token::Assign) {
                let expr = self.parse_expression()?;
                return Ok(Statement::AssignMap { map, expr });
            }
            self.current = checkpoint;
        } else if self.check(&Token::VarIdent(String::new())) {
            let checkpoint = self.current;
            let span = self.current_span();
            let name = match self.advance() {
                Token::VarIdent(name) => name.clone(),
                _ => unreachable!("checked variable token"),
            };
            if self.match_token(&Token::Assign) {
                let var = Expression::new(ExprKind::Variable(name), span);
                let expr = self.parse_expression()?;
                return Ok(Statement::AssignVar { var, expr });
            }
            self.current = checkpoint;
        }

        Ok(Statement::Expr(self.parse_expression()?))
    }
}
