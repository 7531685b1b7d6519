// Semantic analysis: types every expression, unifies map shapes across
// probes, validates builtins and calls, and records printf metadata.
//
// Runs in two passes. The collect pass builds the global map table so
// that forward references (`@x = @y` before `@y` is assigned) resolve;
// the check pass types everything again, now with the full table, and is
// the only pass that emits diagnostics.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use btrace_ast::*;
use btrace_diagnostics::{closest_match, Diagnostic, Diagnostics, Span};

use crate::arch;

const BUILTINS: &[&str] = &[
    "pid", "tid", "uid", "gid", "nsecs", "cpu", "comm", "stack", "ustack", "retval", "func",
];

const FUNCTIONS: &[&str] = &[
    "count", "quantize", "delete", "str", "sym", "usym", "reg", "printf",
];

/// How a map accumulates values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Plain `@m = expr` assignment
    Scalar,
    /// `@m = count()`
    Count,
    /// `@m = quantize(x)`: keys gain a trailing log2 bucket slot
    Quantize,
}

/// Rendering hint recorded when a map's values flow through sym()/usym().
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintHint {
    Plain,
    KernelSymbol,
    UserSymbol,
}

/// The unified shape of one global map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDef {
    pub name: String,
    pub key_types: Vec<SizedType>,
    pub value_type: SizedType,
    pub aggregation: Aggregation,
    pub print_hint: PrintHint,
    pub first_use: Span,
}

impl MapDef {
    /// Total packed key width. String keys occupy their full size and
    /// everything else an 8-byte slot; quantize maps gain a trailing
    /// log2 bucket slot; empty keys become a single zero integer.
    pub fn key_size(&self) -> usize {
        let mut size: usize = self
            .key_types
            .iter()
            .map(|t| if t.is_string() { t.size } else { 8 })
            .sum();
        if self.aggregation == Aggregation::Quantize {
            size += 8;
        }
        if size == 0 {
            size = 8;
        }
        size
    }
}

/// One printf call site: format string plus the argument types, indexed
/// by a dense zero-based id assigned in source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintfSpec {
    pub fmt: String,
    pub args: Vec<SizedType>,
}

impl PrintfSpec {
    /// Record size on the perf ring: 8-byte id plus each field. String
    /// fields occupy their full buffer; everything else is stored as a
    /// 64-bit word.
    pub fn record_size(&self) -> usize {
        8 + self
            .args
            .iter()
            .map(|t| if t.is_string() { t.size } else { 8 })
            .sum::<usize>()
    }
}

/// Everything later phases need from the analyser.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub maps: BTreeMap<String, MapDef>,
    pub printfs: Vec<PrintfSpec>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Collect,
    Check,
}

/// Assignment target, passed down while typing a statement's RHS instead
/// of the original back-pointer on the expression node.
struct TargetInfo {
    ident: String,
    key_types: Vec<SizedType>,
    span: Span,
}

pub struct Analyser {
    pass: Pass,
    diags: Diagnostics,
    maps: BTreeMap<String, MapDef>,
    printfs: Vec<PrintfSpec>,
    vars: HashMap<String, SizedType>,
}

impl Analyser {
    pub fn analyse(program: &mut Program) -> Result<Analysis, Diagnostics> {
        let mut a = Analyser {
            pass: Pass::Collect,
            diags: Diagnostics::new(),
            maps: BTreeMap::new(),
            printfs: Vec::new(),
            vars: HashMap::new(),
        };

        for pass in [Pass::Collect, Pass::Check] {
            a.pass = pass;
            for probe in &mut program.probes {
                a.vars.clear();
                if let Some(pred) = &mut probe.predicate {
                    a.type_expr(&mut pred.expr, None);
                    if a.pass == Pass::Check && !pred.expr.ty.is_integer() {
                        a.error(
                            format!(
                                "predicate must be an integer expression, found {}",
                                pred.expr.ty
                            ),
                            pred.span,
                        );
                    }
                }
                for stmt in &mut probe.stmts {
                    a.type_stmt(stmt);
                }
            }
        }

        log::debug!(
            "analysed {} map(s), {} printf call(s)",
            a.maps.len(),
            a.printfs.len()
        );

        if a.diags.has_errors() {
            Err(a.diags)
        } else {
            Ok(Analysis {
                maps: a.maps,
                printfs: a.printfs,
            })
        }
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        // Only the check pass reports; the collect pass would duplicate
        // everything.
        if self.pass == Pass::Check {
            self.diags.error(message, span);
        }
    }

    fn type_stmt(&mut self, stmt: &mut Statement) {
        match stmt {
            Statement::Expr(expr) => {
                self.type_expr(expr, None);
                if self.pass == Pass::Check && expr.ty.is_none() {
                    match &expr.kind {
                        // delete() and printf() act for effect only
                        ExprKind::Call { func, .. } if func == "delete" || func == "printf" => {}
                        ExprKind::Call { func, .. } => {
                            let msg =
                                format!("{}() must be assigned to a map", func);
                            self.error(msg, expr.span);
                        }
                        _ => self.error("expression has no value", expr.span),
                    }
                }
            }
            Statement::AssignMap { map, expr } => {
                let target = self.type_map_keys(map);
                self.type_expr(expr, Some(&target));

                if !expr.ty.is_none() {
                    let hint = match &expr.kind {
                        ExprKind::Call { func, .. } if func == "sym" => PrintHint::KernelSymbol,
                        ExprKind::Call { func, .. } if func == "usym" => PrintHint::UserSymbol,
                        _ => PrintHint::Plain,
                    };
                    let value = expr.ty.clone();
                    self.unify_map(&target, value, Aggregation::Scalar, hint);
                } else if self.pass == Pass::Check {
                    match &expr.kind {
                        ExprKind::Call { func, .. }
                            if func == "count" || func == "quantize" => {}
                        ExprKind::Call { func, .. } => {
                            let msg = format!("{}() does not produce a map value", func);
                            self.error(msg, expr.span);
                        }
                        _ => self.error("assigned expression has no value", expr.span),
                    }
                }

                // The LHS map node carries the unified value type.
                map.ty = self
                    .maps
                    .get(&target.ident)
                    .map(|d| d.value_type.clone())
                    .unwrap_or_else(SizedType::none);
            }
            Statement::AssignVar { var, expr } => {
                self.type_expr(expr, None);
                if expr.ty.is_none() {
                    if let ExprKind::Call { func, .. } = &expr.kind {
                        let msg = format!("{}() can only be assigned to a map", func);
                        self.error(msg, expr.span);
                    } else {
                        self.error("assigned expression has no value", expr.span);
                    }
                    return;
                }
                if let ExprKind::Variable(name) = &var.kind {
                    if let Some(existing) = self.vars.get(name) {
                        if !existing.compatible(&expr.ty) {
                            let msg = format!(
                                "variable ${} redefined as {} after earlier use as {}",
                                name, expr.ty, existing
                            );
                            self.error(msg, var.span);
                        }
                    }
                    self.vars.insert(name.clone(), expr.ty.clone());
                    var.ty = expr.ty.clone();
                }
            }
        }
    }

    /// Type a map reference's keys and build the assignment target record.
    fn type_map_keys(&mut self, map: &mut Expression) -> TargetInfo {
        let span = map.span;
        let (ident, keys) = match &mut map.kind {
            ExprKind::Map { ident, keys } => (ident.clone(), keys),
            _ => panic!("assignment target is not a map"),
        };

        let mut key_types = Vec::new();
        for key in keys.iter_mut() {
            self.type_expr(key, None);
            if self.pass == Pass::Check && key.ty.is_none() {
                self.error("map key has no value", key.span);
            }
            key_types.push(key.ty.clone());
        }

        TargetInfo {
            ident,
            key_types,
            span,
        }
    }

    /// Record or check one use of a map against the global table.
    /// Mismatched shapes are fatal; the diagnostic names both sites.
    fn unify_map(
        &mut self,
        target: &TargetInfo,
        value_type: SizedType,
        aggregation: Aggregation,
        print_hint: PrintHint,
    ) {
        let first_use = match self.maps.get(&target.ident) {
            None => {
                self.maps.insert(
                    target.ident.clone(),
                    MapDef {
                        name: target.ident.clone(),
                        key_types: target.key_types.clone(),
                        value_type,
                        aggregation,
                        print_hint,
                        first_use: target.span,
                    },
                );
                return;
            }
            Some(def) => def.first_use,
        };

        let mut mismatch = None;
        {
            let def = &self.maps[&target.ident];
            if def.key_types.len() != target.key_types.len() {
                mismatch = Some(format!(
                    "map @{} used with {} key(s), but earlier use has {}",
                    target.ident,
                    target.key_types.len(),
                    def.key_types.len()
                ));
            } else if let Some((i, (a, b))) = def
                .key_types
                .iter()
                .zip(&target.key_types)
                .enumerate()
                .find(|(_, (a, b))| !a.compatible(b))
            {
                mismatch = Some(format!(
                    "map @{} key {} is {}, but earlier use has {}",
                    target.ident, i, b, a
                ));
            } else if !value_type.is_none() && def.aggregation != aggregation {
                // Reads and delete() pass no value and accept any
                // aggregation.
                mismatch = Some(format!(
                    "map @{} mixes incompatible aggregations",
                    target.ident
                ));
            } else if !def.value_type.is_none()
                && !value_type.is_none()
                && !def.value_type.compatible(&value_type)
            {
                mismatch = Some(format!(
                    "map @{} assigned {}, but earlier use has {}",
                    target.ident, value_type, def.value_type
                ));
            }
        }

        if let Some(message) = mismatch {
            if self.pass == Pass::Check {
                self.diags.error(message, target.span);
                self.diags
                    .push(Diagnostic::note("first use is here", first_use));
            }
            return;
        }

        // Adopt a value type discovered later than the first key-only use.
        if let Some(def) = self.maps.get_mut(&target.ident) {
            if def.value_type.is_none() {
                def.value_type = value_type;
                def.aggregation = aggregation;
            }
            if def.print_hint == PrintHint::Plain {
                def.print_hint = print_hint;
            }
        }
    }

    fn type_expr(&mut self, expr: &mut Expression, target: Option<&TargetInfo>) {
        let span = expr.span;
        match &mut expr.kind {
            ExprKind::Integer(_) => expr.ty = SizedType::integer(),
            ExprKind::Str(_) => expr.ty = SizedType::string(STRING_SIZE),
            ExprKind::Builtin(ident) => expr.ty = self.type_builtin(ident, span),
            ExprKind::Variable(name) => match self.vars.get(name) {
                Some(ty) => expr.ty = ty.clone(),
                None => {
                    let msg = format!("variable ${} used before assignment", name);
                    self.error(msg, span);
                }
            },
            ExprKind::Map { .. } => {
                let target_info = self.type_map_keys(expr);
                self.unify_map(
                    &target_info,
                    SizedType::none(),
                    Aggregation::Scalar,
                    PrintHint::Plain,
                );
                let value = self
                    .maps
                    .get(&target_info.ident)
                    .map(|d| d.value_type.clone())
                    .unwrap_or_else(SizedType::none);
                if self.pass == Pass::Check && value.is_none() {
                    let msg = format!("map @{} is never assigned a value", target_info.ident);
                    self.error(msg, span);
                }
                expr.ty = value;
            }
            ExprKind::Call { .. } => self.type_call(expr, target),
            ExprKind::Binop { .. } => self.type_binop(expr),
            ExprKind::Unop { op, expr: operand } => {
                let op = *op;
                self.type_expr(operand, None);
                if self.pass == Pass::Check {
                    match op {
                        UnaryOp::LNot | UnaryOp::BNot => {
                            if !operand.ty.is_integer() {
                                let msg = format!(
                                    "unary {} requires an integer operand",
                                    op.symbol()
                                );
                                self.error(msg, span);
                            }
                        }
                        UnaryOp::Deref => {
                            let ok = operand.ty.is_integer()
                                || matches!(operand.ty.kind, Kind::Pointer(_));
                            if !ok {
                                self.error("cannot dereference a non-pointer value", span);
                            }
                        }
                    }
                }
                expr.ty = SizedType::integer();
            }
            ExprKind::FieldAccess { expr: operand, .. } => {
                self.type_expr(operand, None);
                self.error("struct field access is not supported yet", span);
                expr.ty = SizedType::integer();
            }
            ExprKind::Cast { expr: operand, .. } => {
                self.type_expr(operand, None);
                self.error("type casts are not supported yet", span);
                expr.ty = SizedType::integer();
            }
        }
    }

    fn type_builtin(&mut self, ident: &str, span: Span) -> SizedType {
        match ident {
            "pid" | "tid" | "uid" | "gid" | "nsecs" | "cpu" | "retval" | "func" => {
                SizedType::integer()
            }
            "comm" => SizedType::string(COMM_SIZE),
            "stack" | "ustack" => SizedType::stack_id(),
            _ => {
                if let Some(n) = arg_number(ident) {
                    if self.pass == Pass::Check && arch::arg_offset(n).is_none() {
                        let msg = format!(
                            "{} is not passed in a register on this architecture",
                            ident
                        );
                        self.error(msg, span);
                    }
                    return SizedType::integer();
                }
                if self.pass == Pass::Check {
                    let mut diag =
                        Diagnostic::error(format!("unknown builtin: {}", ident), span);
                    let mut candidates: Vec<&str> = BUILTINS.to_vec();
                    candidates.extend(["arg0", "retval"]);
                    if let Some(close) = closest_match(ident, &candidates) {
                        diag = diag.with_help(format!("did you mean `{}`?", close));
                    }
                    self.diags.push(diag);
                }
                SizedType::integer()
            }
        }
    }

    fn type_call(&mut self, expr: &mut Expression, target: Option<&TargetInfo>) {
        let span = expr.span;
        let (func, args) = match &mut expr.kind {
            ExprKind::Call { func, args } => (func.clone(), args),
            _ => unreachable!("type_call on non-call"),
        };

        // Type arguments first; count/quantize/delete/reg then inspect them.
        if func != "delete" {
            for arg in args.iter_mut() {
                self.type_expr(arg, None);
            }
        }

        match func.as_str() {
            "count" => {
                if !args.is_empty() {
                    self.error("count() takes no arguments", span);
                }
                match target {
                    Some(t) => self.unify_map(
                        t,
                        SizedType::integer(),
                        Aggregation::Count,
                        PrintHint::Plain,
                    ),
                    None => self.error("count() must be assigned to a map", span),
                }
            }
            "quantize" => {
                if args.len() != 1 {
                    self.error("quantize() takes a single integer argument", span);
                } else if self.pass == Pass::Check && !args[0].ty.is_integer() {
                    self.error("quantize() requires an integer argument", args[0].span);
                }
                match target {
                    Some(t) => self.unify_map(
                        t,
                        SizedType::integer(),
                        Aggregation::Quantize,
                        PrintHint::Plain,
                    ),
                    None => self.error("quantize() must be assigned to a map", span),
                }
            }
            "delete" => {
                if args.len() == 1 && matches!(args[0].kind, ExprKind::Map { .. }) {
                    let target_info = self.type_map_keys(&mut args[0]);
                    self.unify_map(
                        &target_info,
                        SizedType::none(),
                        Aggregation::Scalar,
                        PrintHint::Plain,
                    );
                    args[0].ty = self
                        .maps
                        .get(&target_info.ident)
                        .map(|d| d.value_type.clone())
                        .unwrap_or_else(SizedType::none);
                } else {
                    self.error("delete() takes a map reference", span);
                }
            }
            "str" => {
                if args.len() != 1 {
                    self.error("str() takes a single address argument", span);
                } else if self.pass == Pass::Check && !args[0].ty.is_integer() {
                    self.error("str() requires an address argument", args[0].span);
                }
                expr.ty = SizedType::string(STRING_SIZE);
            }
            "sym" | "usym" => {
                if args.len() != 1 {
                    let msg = format!("{}() takes a single integer argument", func);
                    self.error(msg, span);
                } else if self.pass == Pass::Check && !args[0].ty.is_integer() {
                    let msg = format!("{}() requires an integer argument", func);
                    self.error(msg, args[0].span);
                }
                expr.ty = SizedType::integer();
            }
            "reg" => {
                match args.first() {
                    Some(arg) if args.len() == 1 => match &arg.kind {
                        ExprKind::Str(name) => {
                            if self.pass == Pass::Check
                                && arch::register_offset(name).is_none()
                            {
                                let mut diag = Diagnostic::error(
                                    format!("unknown register: {}", name),
                                    arg.span,
                                );
                                if let Some(close) =
                                    closest_match(name, &arch::register_names())
                                {
                                    diag =
                                        diag.with_help(format!("did you mean `{}`?", close));
                                }
                                self.diags.push(diag);
                            }
                        }
                        _ => self.error("reg() requires a literal register name", arg.span),
                    },
                    _ => self.error("reg() takes a single register name", span),
                }
                expr.ty = SizedType::integer();
            }
            "printf" => {
                match args.first() {
                    Some(arg) => {
                        if !matches!(arg.kind, ExprKind::Str(_)) {
                            self.error(
                                "printf() requires a literal format string",
                                arg.span,
                            );
                        }
                    }
                    None => self.error("printf() requires a format string", span),
                }
                if self.pass == Pass::Check {
                    if let Some(Expression {
                        kind: ExprKind::Str(fmt),
                        ..
                    }) = args.first()
                    {
                        let arg_types = args.iter().skip(1).map(|a| a.ty.clone()).collect();
                        self.printfs.push(PrintfSpec {
                            fmt: fmt.clone(),
                            args: arg_types,
                        });
                    }
                }
            }
            _ => {
                if self.pass == Pass::Check {
                    let mut diag =
                        Diagnostic::error(format!("unknown function: {}", func), span);
                    if let Some(close) = closest_match(&func, FUNCTIONS) {
                        diag = diag.with_help(format!("did you mean `{}`?", close));
                    }
                    self.diags.push(diag);
                }
                // Recover with an integer so one bad call does not cascade.
                expr.ty = SizedType::integer();
            }
        }
    }

    fn type_binop(&mut self, expr: &mut Expression) {
        let span = expr.span;
        if let ExprKind::Binop { op, left, right } = &mut expr.kind {
            let op = *op;
            self.type_expr(left, None);
            self.type_expr(right, None);

            if self.pass == Pass::Check {
                if left.ty.is_none() || right.ty.is_none() {
                    self.error("operand has no value", span);
                } else if left.ty.kind != right.ty.kind {
                    let msg = format!(
                        "type mismatch for {}: {} vs {}",
                        op.symbol(),
                        left.ty,
                        right.ty
                    );
                    self.error(msg, span);
                } else if left.ty.is_string()
                    && !matches!(op, BinaryOp::Eq | BinaryOp::Ne)
                {
                    let msg = format!("strings only support == and !=, not {}", op.symbol());
                    self.error(msg, span);
                } else if matches!(op, BinaryOp::LAnd | BinaryOp::LOr)
                    && !left.ty.is_integer()
                {
                    let msg = format!("{} requires integer operands", op.symbol());
                    self.error(msg, span);
                }
            }
        }
        expr.ty = SizedType::integer();
    }
}

/// `arg0`..`arg9` recognised as probe argument builtins.
fn arg_number(ident: &str) -> Option<usize> {
    let digit = ident.strip_prefix("arg")?;
    if digit.len() == 1 && digit.chars().all(|c| c.is_ascii_digit()) {
        digit.parse().ok()
    } else {
        None
    }
}
