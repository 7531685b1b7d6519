use serde::{Deserialize, Serialize};

use btrace_diagnostics::Span;

pub mod printer;
pub mod types;
pub mod visit;

pub use printer::Printer;
pub use types::{Kind, SizedType, COMM_SIZE, STRING_SIZE};

/// Root of the Abstract Syntax Tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub includes: Vec<Include>,
    pub structs: Vec<StructDecl>,
    pub probes: Vec<Probe>,
}

/// `#include <file>` or `#include "file"`, preserved as an opaque name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Include {
    pub file: String,
    pub system_header: bool,
}

/// A C-style struct declaration: `struct T { int n; char *s[8]; }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub type_name: String,
    pub is_ptr: bool,
    pub array_size: usize,
    pub name: String,
}

/// A probe: one or more attach points, an optional predicate, a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub attach_points: Vec<AttachPoint>,
    pub predicate: Option<Predicate>,
    pub stmts: Vec<Statement>,
}

/// A provider-qualified location where the probe runs.
///
/// Which of `target`/`func`/`freq` are populated depends on the provider;
/// unused fields stay empty. Wildcards in `func`/`target` are kept as
/// source text and expanded by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachPoint {
    pub provider: String,
    pub target: String,
    pub func: String,
    pub freq: u64,
    pub span: Span,
}

impl AttachPoint {
    /// Canonical name, e.g. `kprobe:sys_open` or `uprobe:/bin/sh:foo`.
    pub fn name(&self) -> String {
        match self.provider.as_str() {
            "BEGIN" | "END" => self.provider.clone(),
            "kprobe" | "kretprobe" => format!("{}:{}", self.provider, self.func),
            "profile" => format!("{}:{}:{}", self.provider, self.target, self.freq),
            _ => format!("{}:{}:{}", self.provider, self.target, self.func),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub expr: Expression,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Expr(Expression),
    /// `@map[keys] = expr`; the LHS expression is always `ExprKind::Map`
    AssignMap { map: Expression, expr: Expression },
    /// `$var = expr`; the LHS expression is always `ExprKind::Variable`
    AssignVar { var: Expression, expr: Expression },
}

/// An expression node. `ty` starts as `none` and is filled in by the
/// semantic analyser; structure is never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub kind: ExprKind,
    pub ty: SizedType,
    pub span: Span,
    pub is_literal: bool,
    pub is_variable: bool,
}

impl Expression {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        let is_literal = matches!(kind, ExprKind::Integer(_) | ExprKind::Str(_));
        let is_variable = matches!(kind, ExprKind::Variable(_));
        Self {
            kind,
            ty: SizedType::none(),
            span,
            is_literal,
            is_variable,
        }
    }

    /// The map identifier when this expression is a map reference.
    pub fn map_ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Map { ident, .. } => Some(ident),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Integer(i64),
    Str(String),
    Builtin(String),
    Call {
        func: String,
        args: Vec<Expression>,
    },
    Map {
        ident: String,
        keys: Vec<Expression>,
    },
    Variable(String),
    Binop {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unop {
        op: UnaryOp,
        expr: Box<Expression>,
    },
    FieldAccess {
        expr: Box<Expression>,
        field: String,
    },
    Cast {
        type_name: String,
        is_ptr: bool,
        expr: Box<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Mul,
    Div,
    Mod,
    Plus,
    Minus,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LAnd,
    LOr,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::LAnd => "&&",
            BinaryOp::LOr => "||",
        }
    }

    /// Comparison operators produce a 0/1 result.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    LNot,
    BNot,
    Deref,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::LNot => "!",
            UnaryOp::BNot => "~",
            UnaryOp::Deref => "dereference",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(provider: &str, target: &str, func: &str, freq: u64) -> AttachPoint {
        AttachPoint {
            provider: provider.into(),
            target: target.into(),
            func: func.into(),
            freq,
            span: Span::unknown(),
        }
    }

    #[test]
    fn attach_point_canonical_names() {
        assert_eq!(ap("BEGIN", "", "", 0).name(), "BEGIN");
        assert_eq!(ap("kprobe", "", "sys_open", 0).name(), "kprobe:sys_open");
        assert_eq!(
            ap("uprobe", "/bin/sh", "foo", 0).name(),
            "uprobe:/bin/sh:foo"
        );
        assert_eq!(
            ap("tracepoint", "sched", "sched_switch", 0).name(),
            "tracepoint:sched:sched_switch"
        );
        assert_eq!(ap("profile", "ms", "", 997).name(), "profile:ms:997");
    }

    #[test]
    fn literal_and_variable_flags() {
        let span = Span::unknown();
        assert!(Expression::new(ExprKind::Integer(1), span).is_literal);
        assert!(Expression::new(ExprKind::Str("x".into()), span).is_literal);
        let var = Expression::new(ExprKind::Variable("v".into()), span);
        assert!(var.is_variable && !var.is_literal);
    }

    #[test]
    fn ast_round_trips_through_serde() {
        let prog = Program {
            includes: vec![Include {
                file: "stdio.h".into(),
                system_header: true,
            }],
            structs: vec![],
            probes: vec![Probe {
                attach_points: vec![ap("kprobe", "", "f", 0)],
                predicate: None,
                stmts: vec![Statement::Expr(Expression::new(
                    ExprKind::Builtin("pid".into()),
                    Span::unknown(),
                ))],
            }],
        };
        let json = serde_json::to_string(&prog).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(prog, back);
    }
}
