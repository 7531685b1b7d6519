// Expression parsing with C-like precedence

use super::Parser;
use crate::ParseError;
use btrace_ast::*;
use btrace_lexer::Token;

impl<'a> Parser<'a> {
    pub(crate) fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        self.parse_logical_or()
    }

    fn binop(left: Expression, op: BinaryOp, right: Expression) -> Expression {
        let span = left.span;
        Expression::new(
            ExprKind::Binop {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    fn parse_logical_or(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_logical_and()?;
        while self.match_token(&Token::LOr) {
            let right = self.parse_logical_and()?;
            expr = Self::binop(expr, BinaryOp::LOr, right);
        }
        Ok(expr)
    }

    fn parse_logical_and(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_bit_or()?;
        while self.match_token(&Token::LAnd) {
            let right = self.parse_bit_or()?;
            expr = Self::binop(expr, BinaryOp::LAnd, right);
        }
        Ok(expr)
    }

    fn parse_bit_or(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_bit_xor()?;
        while self.match_token(&Token::Pipe) {
            let right = self.parse_bit_xor()?;
            expr = Self::binop(expr, BinaryOp::BitOr, right);
        }
        Ok(expr)
    }

    fn parse_bit_xor(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_bit_and()?;
        while self.match_token(&Token::Caret) {
            let right = self.parse_bit_and()?;
            expr = Self::binop(expr, BinaryOp::BitXor, right);
        }
        Ok(expr)
    }

    fn parse_bit_and(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_equality()?;
        while self.match_token(&Token::Amp) {
            let right = self.parse_equality()?;
            expr = Self::binop(expr, BinaryOp::BitAnd, right);
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = if self.match_token(&Token::EqEq) {
                BinaryOp::Eq
            } else if self.match_token(&Token::Ne) {
                BinaryOp::Ne
            } else {
                return Ok(expr);
            };
            let right = self.parse_comparison()?;
            expr = Self::binop(expr, op, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = if self.match_token(&Token::Le) {
                BinaryOp::Le
            } else if self.match_token(&Token::Ge) {
                BinaryOp::Ge
            } else if self.match_token(&Token::Lt) {
                BinaryOp::Lt
            } else if self.match_token(&Token::Gt) {
                BinaryOp::Gt
            } else {
                return Ok(expr);
            };
            let right = self.parse_additive()?;
            expr = Self::binop(expr, op, right);
        }
    }

    fn parse_additive(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = if self.match_token(&Token::Plus) {
                BinaryOp::Plus
            } else if self.match_token(&Token::Minus) {
                BinaryOp::Minus
            } else {
                return Ok(expr);
            };
            let right = self.parse_multiplicative()?;
            expr = Self::binop(expr, op, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_cast()?;
        loop {
            let op = if self.match_token(&Token::Star) {
                BinaryOp::Mul
            } else if self.match_token(&Token::Slash) {
                BinaryOp::Div
            } else if self.match_token(&Token::Percent) {
                BinaryOp::Mod
            } else {
                return Ok(expr);
            };
            let right = self.parse_cast()?;
            expr = Self::binop(expr, op, right);
        }
    }

    /// `(T)e` or `(T*)e` is a cast only when `T` is a declared struct name
    /// or a primitive type keyword; `(x)*y` with unknown `x` is a grouped
    /// expression multiplied by `y`.
    fn parse_cast(&mut self) -> Result<Expression, ParseError> {
        if let Some((type_name, is_ptr, len)) = self.cast_lookahead() {
            let span = self.current_span();
            self.current += len;
            let operand = self.parse_cast()?;
            return Ok(Expression::new(
                ExprKind::Cast {
                    type_name,
                    is_ptr,
                    expr: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_unary()
    }

    /// Returns (type name, pointer flag, token count) when the upcoming
    /// tokens form a cast prefix.
    fn cast_lookahead(&self) -> Option<(String, bool, usize)> {
        if self.token_at(self.current) != Some(&Token::LParen) {
            return None;
        }
        let name = match self.token_at(self.current + 1) {
            Some(Token::Ident(name)) if self.type_names.contains(name) => name.clone(),
            _ => return None,
        };
        match self.token_at(self.current + 2) {
            Some(Token::RParen) => Some((name, false, 3)),
            Some(Token::Star) if self.token_at(self.current + 3) == Some(&Token::RParen) => {
                Some((name, true, 4))
            }
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        let span = self.current_span();
        let op = if self.match_token(&Token::Bang) {
            UnaryOp::LNot
        } else if self.match_token(&Token::Tilde) {
            UnaryOp::BNot
        } else if self.match_token(&Token::Star) {
            UnaryOp::Deref
        } else {
            return self.parse_postfix();
        };
        let operand = self.parse_unary()?;
        Ok(Expression::new(
            ExprKind::Unop {
                op,
                expr: Box::new(operand),
            },
            span,
        ))
    }

    /// Field access binds tighter than casts and unary operators;
    /// `a->f` is exactly `(*a).f`.
    fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let deref = if self.match_token(&Token::Dot) {
                false
            } else if self.match_token(&Token::Arrow) {
                true
            } else {
                return Ok(expr);
            };
            if self.is_at_end() {
                return Err(self.error("expected field name"));
            }
            let field = match self.peek().clone() {
                Token::Ident(name) => {
                    self.advance();
                    name
                }
                _ => return Err(self.error("expected field name")),
            };
            let span = expr.span;
            if deref {
                expr = Expression::new(
                    ExprKind::Unop {
                        op: UnaryOp::Deref,
                        expr: Box::new(expr),
                    },
                    span,
                );
            }
            expr = Expression::new(
                ExprKind::FieldAccess {
                    expr: Box::new(expr),
                    field,
                },
                span,
            );
        }
    }

    pub(crate) fn parse_map_reference(&mut self) -> Result<Expression, ParseError> {
        let span = self.current_span();
        let ident = match self.advance() {
            Token::MapIdent(ident) => ident.clone(),
            _ => return Err(self.error("expected map")),
        };

        let mut keys = Vec::new();
        if self.match_token(&Token::LBracket) {
            loop {
                keys.push(self.parse_expression()?);
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
            self.consume(&Token::RBracket, "expected ']' after map keys")?;
        }

        Ok(Expression::new(ExprKind::Map { ident, keys }, span))
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let span = self.current_span();

        if self.is_at_end() {
            return Err(self.error("expected expression"));
        }

        match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(Expression::new(ExprKind::Integer(n), span))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expression::new(ExprKind::Str(s), span))
            }
            Token::MapIdent(_) => self.parse_map_reference(),
            Token::VarIdent(name) => {
                self.advance();
                Ok(Expression::new(ExprKind::Variable(name), span))
            }
            Token::Ident(name) => {
                self.advance();
                if self.match_token(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.match_token(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.consume(&Token::RParen, "expected ')' after call arguments")?;
                    Ok(Expression::new(ExprKind::Call { func: name, args }, span))
                } else {
                    Ok(Expression::new(ExprKind::Builtin(name), span))
                }
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.consume(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            _ => Err(self.error("expected expression")),
        }
    }
}
