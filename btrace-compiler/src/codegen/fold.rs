// Constant folding of literal integer subtrees, applied while lowering.
// The only optimisation this compiler performs besides helper inlining.

use btrace_ast::{BinaryOp, ExprKind, Expression, UnaryOp};

pub fn const_eval(expr: &Expression) -> Option<i64> {
    match &expr.kind {
        ExprKind::Integer(n) => Some(*n),
        ExprKind::Binop { op, left, right } => {
            let l = const_eval(left)?;
            let r = const_eval(right)?;
            apply(*op, l, r)
        }
        ExprKind::Unop { op, expr } => {
            let v = const_eval(expr)?;
            match op {
                UnaryOp::LNot => Some((v == 0) as i64),
                UnaryOp::BNot => Some(!v),
                UnaryOp::Deref => None,
            }
        }
        _ => None,
    }
}

/// Mirrors the instruction semantics: signed comparisons, unsigned
/// division and modulo, wrapping arithmetic.
fn apply(op: BinaryOp, l: i64, r: i64) -> Option<i64> {
    Some(match op {
        BinaryOp::Plus => l.wrapping_add(r),
        BinaryOp::Minus => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                return None;
            }
            ((l as u64) / (r as u64)) as i64
        }
        BinaryOp::Mod => {
            if r == 0 {
                return None;
            }
            ((l as u64) % (r as u64)) as i64
        }
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitOr => l | r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::Eq => (l == r) as i64,
        BinaryOp::Ne => (l != r) as i64,
        BinaryOp::Lt => (l < r) as i64,
        BinaryOp::Le => (l <= r) as i64,
        BinaryOp::Gt => (l > r) as i64,
        BinaryOp::Ge => (l >= r) as i64,
        BinaryOp::LAnd => (l != 0 && r != 0) as i64,
        BinaryOp::LOr => (l != 0 || r != 0) as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrace_diagnostics::Span;

    fn int(n: i64) -> Expression {
        Expression::new(ExprKind::Integer(n), Span::unknown())
    }

    fn bin(op: BinaryOp, l: Expression, r: Expression) -> Expression {
        Expression::new(
            ExprKind::Binop {
                op,
                left: Box::new(l),
                right: Box::new(r),
            },
            Span::unknown(),
        )
    }

    #[test]
    fn folds_arithmetic() {
        assert_eq!(const_eval(&bin(BinaryOp::Plus, int(2), int(3))), Some(5));
        assert_eq!(const_eval(&bin(BinaryOp::Div, int(100), int(25))), Some(4));
        assert_eq!(const_eval(&bin(BinaryOp::Le, int(1), int(2))), Some(1));
    }

    #[test]
    fn division_by_zero_stays_runtime() {
        assert_eq!(const_eval(&bin(BinaryOp::Div, int(1), int(0))), None);
    }

    #[test]
    fn complement_is_bitwise() {
        let expr = Expression::new(
            ExprKind::Unop {
                op: UnaryOp::BNot,
                expr: Box::new(int(0)),
            },
            Span::unknown(),
        );
        assert_eq!(const_eval(&expr), Some(-1));
    }

    #[test]
    fn non_literals_do_not_fold() {
        let builtin = Expression::new(ExprKind::Builtin("pid".into()), Span::unknown());
        assert_eq!(const_eval(&bin(BinaryOp::Plus, builtin, int(1))), None);
    }
}
