// Walker contract over the AST.
//
// This is a pre-order external visitor: every method receives a mutable
// reference to its node, and descending into children is the visitor's
// job, via the walk_* helpers or its own traversal. Phases that need a
// different order (the analyser post-orders expressions, the code
// generator is driven by statement shapes) simply do not call the helper.

use crate::*;

pub trait Visitor {
    fn visit_program(&mut self, program: &mut Program) {
        walk_program(self, program);
    }

    fn visit_probe(&mut self, probe: &mut Probe) {
        walk_probe(self, probe);
    }

    fn visit_attach_point(&mut self, _ap: &mut AttachPoint) {}

    fn visit_predicate(&mut self, pred: &mut Predicate) {
        walk_predicate(self, pred);
    }

    fn visit_statement(&mut self, stmt: &mut Statement) {
        walk_statement(self, stmt);
    }

    fn visit_expression(&mut self, expr: &mut Expression) {
        walk_expression(self, expr);
    }
}

pub fn walk_program<V: Visitor + ?Sized>(v: &mut V, program: &mut Program) {
    for probe in &mut program.probes {
        v.visit_probe(probe);
    }
}

pub fn walk_probe<V: Visitor + ?Sized>(v: &mut V, probe: &mut Probe) {
    for ap in &mut probe.attach_points {
        v.visit_attach_point(ap);
    }
    if let Some(pred) = &mut probe.predicate {
        v.visit_predicate(pred);
    }
    for stmt in &mut probe.stmts {
        v.visit_statement(stmt);
    }
}

pub fn walk_predicate<V: Visitor + ?Sized>(v: &mut V, pred: &mut Predicate) {
    v.visit_expression(&mut pred.expr);
}

pub fn walk_statement<V: Visitor + ?Sized>(v: &mut V, stmt: &mut Statement) {
    match stmt {
        Statement::Expr(expr) => v.visit_expression(expr),
        Statement::AssignMap { map, expr } | Statement::AssignVar { var: map, expr } => {
            v.visit_expression(map);
            v.visit_expression(expr);
        }
    }
}

pub fn walk_expression<V: Visitor + ?Sized>(v: &mut V, expr: &mut Expression) {
    match &mut expr.kind {
        ExprKind::Integer(_)
        | ExprKind::Str(_)
        | ExprKind::Builtin(_)
        | ExprKind::Variable(_) => {}
        ExprKind::Call { args, .. } => {
            for arg in args {
                v.visit_expression(arg);
            }
        }
        ExprKind::Map { keys, .. } => {
            for key in keys {
                v.visit_expression(key);
            }
        }
        ExprKind::Binop { left, right, .. } => {
            v.visit_expression(left);
            v.visit_expression(right);
        }
        ExprKind::Unop { expr, .. }
        | ExprKind::FieldAccess { expr, .. }
        | ExprKind::Cast { expr, .. } => v.visit_expression(expr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrace_diagnostics::Span;

    struct IntCounter(usize);

    impl Visitor for IntCounter {
        fn visit_expression(&mut self, expr: &mut Expression) {
            if matches!(expr.kind, ExprKind::Integer(_)) {
                self.0 += 1;
            }
            walk_expression(self, expr);
        }
    }

    #[test]
    fn walker_reaches_nested_expressions() {
        let span = Span::unknown();
        let int = |n| Expression::new(ExprKind::Integer(n), span);
        let sum = Expression::new(
            ExprKind::Binop {
                op: BinaryOp::Plus,
                left: Box::new(int(1)),
                right: Box::new(Expression::new(
                    ExprKind::Map {
                        ident: "x".into(),
                        keys: vec![int(2), int(3)],
                    },
                    span,
                )),
            },
            span,
        );
        let mut program = Program {
            includes: vec![],
            structs: vec![],
            probes: vec![Probe {
                attach_points: vec![],
                predicate: None,
                stmts: vec![Statement::Expr(sum)],
            }],
        };

        let mut counter = IntCounter(0);
        counter.visit_program(&mut program);
        assert_eq!(counter.0, 3);
    }
}
