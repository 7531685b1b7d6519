// Deterministic indented serialization of the AST. This format is the
// golden-output oracle for the parser test corpus; do not change it
// without updating every golden string.

use std::fmt::Write;

use crate::visit::Visitor;
use crate::*;

#[derive(Default)]
pub struct Printer {
    out: String,
    depth: usize,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render includes, struct declarations, then the program tree.
    pub fn print(&mut self, program: &mut Program) -> String {
        for include in &program.includes {
            self.print_include(include);
        }
        for decl in &program.structs {
            self.print_struct(decl);
        }
        self.visit_program(program);
        std::mem::take(&mut self.out)
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{}{}", " ".repeat(self.depth), text);
    }

    fn print_include(&mut self, include: &Include) {
        if include.system_header {
            self.line(&format!("#include <{}>", include.file));
        } else {
            self.line(&format!("#include \"{}\"", include.file));
        }
    }

    fn print_struct(&mut self, decl: &StructDecl) {
        self.line(&format!("struct {}", decl.name));
        self.depth += 1;
        for field in &decl.fields {
            let mut text = field.type_name.clone();
            if field.is_ptr {
                text.push('*');
            }
            if field.array_size > 1 {
                let _ = write!(text, "[{}]", field.array_size);
            }
            let _ = write!(text, " {}", field.name);
            self.line(&text);
        }
        self.depth -= 1;
    }

    /// Inverts exactly the escape set the lexer recognises.
    fn escape(s: &str) -> String {
        s.replace('\\', "\\\\")
            .replace('\n', "\\n")
            .replace('\t', "\\t")
            .replace('"', "\\\"")
    }
}

impl Visitor for Printer {
    fn visit_program(&mut self, program: &mut Program) {
        self.line("Program");
        self.depth += 1;
        for probe in &mut program.probes {
            self.visit_probe(probe);
        }
        self.depth -= 1;
    }

    fn visit_probe(&mut self, probe: &mut Probe) {
        for ap in &mut probe.attach_points {
            self.visit_attach_point(ap);
        }
        self.depth += 1;
        if let Some(pred) = &mut probe.predicate {
            self.visit_predicate(pred);
        }
        for stmt in &mut probe.stmts {
            self.visit_statement(stmt);
        }
        self.depth -= 1;
    }

    fn visit_attach_point(&mut self, ap: &mut AttachPoint) {
        let name = ap.name();
        self.line(&name);
    }

    fn visit_predicate(&mut self, pred: &mut Predicate) {
        self.line("pred");
        self.depth += 1;
        self.visit_expression(&mut pred.expr);
        self.depth -= 1;
    }

    fn visit_statement(&mut self, stmt: &mut Statement) {
        match stmt {
            Statement::Expr(expr) => self.visit_expression(expr),
            Statement::AssignMap { map: lhs, expr } | Statement::AssignVar { var: lhs, expr } => {
                self.line("=");
                self.depth += 1;
                self.visit_expression(lhs);
                self.visit_expression(expr);
                self.depth -= 1;
            }
        }
    }

    fn visit_expression(&mut self, expr: &mut Expression) {
        match &mut expr.kind {
            ExprKind::Integer(n) => {
                let text = format!("int: {}", n);
                self.line(&text);
            }
            ExprKind::Str(s) => {
                let text = format!("string: {}", Self::escape(s));
                self.line(&text);
            }
            ExprKind::Builtin(ident) => {
                let text = format!("builtin: {}", ident);
                self.line(&text);
            }
            ExprKind::Variable(ident) => {
                let text = format!("variable: ${}", ident);
                self.line(&text);
            }
            ExprKind::Call { func, args } => {
                let text = format!("call: {}", func);
                self.line(&text);
                self.depth += 1;
                for arg in args {
                    self.visit_expression(arg);
                }
                self.depth -= 1;
            }
            ExprKind::Map { ident, keys } => {
                let text = format!("map: @{}", ident);
                self.line(&text);
                self.depth += 1;
                for key in keys {
                    self.visit_expression(key);
                }
                self.depth -= 1;
            }
            ExprKind::Binop { op, left, right } => {
                let symbol = op.symbol();
                self.line(symbol);
                self.depth += 1;
                self.visit_expression(left);
                self.visit_expression(right);
                self.depth -= 1;
            }
            ExprKind::Unop { op, expr } => {
                let symbol = op.symbol();
                self.line(symbol);
                self.depth += 1;
                self.visit_expression(expr);
                self.depth -= 1;
            }
            ExprKind::FieldAccess { expr, field } => {
                let field = field.clone();
                self.line(".");
                self.depth += 1;
                self.visit_expression(expr);
                self.line(&field);
                self.depth -= 1;
            }
            ExprKind::Cast {
                type_name,
                is_ptr,
                expr,
            } => {
                let text = if *is_ptr {
                    format!("({}*)", type_name)
                } else {
                    format!("({})", type_name)
                };
                self.line(&text);
                self.depth += 1;
                self.visit_expression(expr);
                self.depth -= 1;
            }
        }
    }
}
