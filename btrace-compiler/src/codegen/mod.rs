// Lowers the typed AST to the stack-machine IR: one function per attach
// point in section `s_<name>`, plus always-inline log2/strcmp helpers in
// the `helpers` section.

pub mod fold;
pub mod interp;
pub mod ir;

use std::collections::HashMap;

use btrace_ast::*;

use crate::analyser::{Analysis, MapDef, PrintfSpec};
use crate::arch;
use ir::{AluOp, Insn, IrFunction, IrMapDef, IrProgram, MapKind};

/// Name of the implicit perf-event-array map backing printf.
pub const PRINTF_MAP: &str = "__printf";

pub struct CodeGen<'a> {
    analysis: &'a Analysis,
    map_index: HashMap<String, u32>,
    insns: Vec<Insn>,
    next_label: u32,
    next_local: u32,
    vars: HashMap<String, u32>,
    /// Analyser-order printf id of the next printf call site.
    printf_cursor: usize,
}

impl<'a> CodeGen<'a> {
    pub fn compile(program: &Program, analysis: &'a Analysis) -> IrProgram {
        let mut maps: Vec<IrMapDef> = analysis
            .maps
            .values()
            .map(|def| IrMapDef {
                name: def.name.clone(),
                kind: MapKind::Hash,
                key_size: def.key_size() as u32,
                value_size: def.value_type.size.max(8) as u32,
                string_value: def.value_type.is_string(),
            })
            .collect();
        if !analysis.printfs.is_empty() {
            maps.push(IrMapDef {
                name: PRINTF_MAP.to_string(),
                kind: MapKind::PerfEventArray,
                key_size: 4,
                value_size: 4,
                string_value: false,
            });
        }

        let map_index = maps
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i as u32))
            .collect();

        let mut cg = CodeGen {
            analysis,
            map_index,
            insns: Vec::new(),
            next_label: 0,
            next_local: 0,
            vars: HashMap::new(),
            printf_cursor: 0,
        };

        let mut functions = vec![log2_function(), strcmp_function()];
        for probe in &program.probes {
            // Every attach point gets its own copy of the probe body and
            // shares the probe's printf ids.
            let base = cg.printf_cursor;
            for ap in &probe.attach_points {
                cg.printf_cursor = base;
                functions.push(cg.gen_probe(&ap.name(), probe));
            }
        }

        log::debug!("lowered {} function(s)", functions.len());
        IrProgram { maps, functions }
    }

    // ==================== Emission helpers ====================

    fn emit(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    fn label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn local(&mut self) -> u32 {
        let n = self.next_local;
        self.next_local += 1;
        n
    }

    fn map_def(&self, ident: &str) -> &MapDef {
        self.analysis
            .maps
            .get(ident)
            .unwrap_or_else(|| panic!("map @{} missing from analysis", ident))
    }

    fn map_slot(&self, ident: &str) -> u32 {
        *self
            .map_index
            .get(ident)
            .unwrap_or_else(|| panic!("map @{} missing from manifest", ident))
    }

    /// Push `base_local + offset` as an address.
    fn emit_addr(&mut self, base_local: u32, offset: usize) {
        self.emit(Insn::LoadLocal(base_local));
        if offset > 0 {
            self.emit(Insn::Imm(offset as i64));
            self.emit(Insn::Binop(AluOp::Add));
        }
    }

    // ==================== Probe lowering ====================

    fn gen_probe(&mut self, name: &str, probe: &Probe) -> IrFunction {
        self.insns.clear();
        self.vars.clear();
        self.next_label = 0;
        self.next_local = 0;

        if let Some(pred) = &probe.predicate {
            // A false predicate returns 0 immediately.
            self.gen_expr(&pred.expr);
            let body = self.label();
            self.emit(Insn::Jnz(body));
            self.emit(Insn::Imm(0));
            self.emit(Insn::Ret);
            self.emit(Insn::Label(body));
        }

        for stmt in &probe.stmts {
            self.gen_stmt(stmt);
        }

        self.emit(Insn::Imm(0));
        self.emit(Insn::Ret);

        IrFunction {
            name: name.to_string(),
            section: format!("s_{}", name),
            always_inline: false,
            insns: std::mem::take(&mut self.insns),
        }
    }

    fn gen_stmt(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Expr(expr) => match &expr.kind {
                ExprKind::Call { func, args } if func == "delete" => self.gen_delete(args),
                ExprKind::Call { func, args } if func == "printf" => self.gen_printf(args),
                _ => {
                    self.gen_expr(expr);
                    self.emit(Insn::Drop);
                }
            },
            Statement::AssignMap { map, expr } => self.gen_assign_map(map, expr),
            Statement::AssignVar { var, expr } => {
                self.gen_expr(expr);
                let name = match &var.kind {
                    ExprKind::Variable(name) => name.clone(),
                    _ => panic!("assignment target is not a variable"),
                };
                let slot = match self.vars.get(&name) {
                    Some(slot) => *slot,
                    None => {
                        let slot = self.local();
                        self.vars.insert(name, slot);
                        slot
                    }
                };
                self.emit(Insn::StoreLocal(slot));
            }
        }
    }

    fn gen_assign_map(&mut self, map: &Expression, expr: &Expression) {
        let (ident, keys) = match &map.kind {
            ExprKind::Map { ident, keys } => (ident.as_str(), keys.as_slice()),
            _ => panic!("assignment target is not a map"),
        };

        match &expr.kind {
            ExprKind::Call { func, .. } if func == "count" => {
                let key = self.gen_map_key(ident, keys, None);
                self.gen_increment(ident, key);
            }
            ExprKind::Call { func, args } if func == "quantize" => {
                self.gen_expr(&args[0]);
                self.emit(Insn::Call("log2".to_string()));
                let bucket = self.local();
                self.emit(Insn::StoreLocal(bucket));
                let key = self.gen_map_key(ident, keys, Some(bucket));
                self.gen_increment(ident, key);
            }
            _ => {
                // Plain assignment: evaluate the RHS, pack the key, and
                // update. String buffers are passed to the map directly;
                // integers go through a stack slot.
                self.gen_expr(expr);
                let value = self.local();
                self.emit(Insn::StoreLocal(value));
                let key = self.gen_map_key(ident, keys, None);

                let value_ptr = if expr.ty.is_string() {
                    value
                } else {
                    let slot = self.local();
                    self.emit(Insn::Alloc { size: 8 });
                    self.emit(Insn::StoreLocal(slot));
                    self.emit(Insn::LoadLocal(value));
                    self.emit(Insn::LoadLocal(slot));
                    self.emit(Insn::Store64);
                    slot
                };

                let map_slot = self.map_slot(ident);
                self.emit(Insn::LoadLocal(value_ptr));
                self.emit(Insn::LoadLocal(key));
                self.emit(Insn::Update { map: map_slot });
            }
        }
    }

    /// lookup; add 1 treating a missing element as 0; update.
    fn gen_increment(&mut self, ident: &str, key: u32) {
        let map = self.map_slot(ident);
        self.emit(Insn::LoadLocal(key));
        self.emit(Insn::Lookup { map });
        self.emit(Insn::Imm(1));
        self.emit(Insn::Binop(AluOp::Add));

        let slot = self.local();
        self.emit(Insn::Alloc { size: 8 });
        self.emit(Insn::StoreLocal(slot));
        self.emit(Insn::LoadLocal(slot));
        self.emit(Insn::Store64);

        self.emit(Insn::LoadLocal(slot));
        self.emit(Insn::LoadLocal(key));
        self.emit(Insn::Update { map });
    }

    fn gen_delete(&mut self, args: &[Expression]) {
        let (ident, keys) = match &args[0].kind {
            ExprKind::Map { ident, keys } => (ident.as_str(), keys.as_slice()),
            _ => panic!("delete() argument is not a map"),
        };
        let key = self.gen_map_key(ident, keys, None);
        let map = self.map_slot(ident);
        self.emit(Insn::LoadLocal(key));
        self.emit(Insn::Delete { map });
    }

    /// Pack a map key into a scratch buffer and return the local holding
    /// its pointer. Integer-like keys occupy 8 bytes, strings their full
    /// size; `bucket` appends the quantize log2 slot.
    fn gen_map_key(&mut self, ident: &str, keys: &[Expression], bucket: Option<u32>) -> u32 {
        let def = self.map_def(ident);
        let total = def.key_size();

        let key = self.local();
        self.emit(Insn::Alloc { size: total as u32 });
        self.emit(Insn::StoreLocal(key));

        // An empty key without a bucket is the single zero integer the
        // zeroed allocation already holds.
        let mut offset = 0;
        for expr in keys {
            self.gen_expr(expr);
            if expr.ty.is_string() {
                let size = expr.ty.size;
                self.emit_addr(key, offset);
                self.emit(Insn::MemCpy { size: size as u32 });
                offset += size;
            } else {
                self.emit_addr(key, offset);
                self.emit(Insn::Store64);
                offset += 8;
            }
        }

        if let Some(bucket) = bucket {
            self.emit(Insn::LoadLocal(bucket));
            self.emit_addr(key, offset);
            self.emit(Insn::Store64);
        }

        key
    }

    fn gen_printf(&mut self, args: &[Expression]) {
        let id = self.printf_cursor;
        self.printf_cursor += 1;
        let spec: &PrintfSpec = &self.analysis.printfs[id];
        let total = spec.record_size();
        let map = self.map_slot(PRINTF_MAP);

        let record = self.local();
        self.emit(Insn::Alloc { size: total as u32 });
        self.emit(Insn::StoreLocal(record));

        self.emit(Insn::Imm(id as i64));
        self.emit(Insn::LoadLocal(record));
        self.emit(Insn::Store64);

        let mut offset = 8;
        for (expr, ty) in args.iter().skip(1).zip(&spec.args) {
            self.gen_expr(expr);
            if ty.is_string() {
                self.emit_addr(record, offset);
                self.emit(Insn::MemCpy {
                    size: ty.size as u32,
                });
                offset += ty.size;
            } else {
                self.emit_addr(record, offset);
                self.emit(Insn::Store64);
                offset += 8;
            }
        }

        self.emit(Insn::LoadLocal(record));
        self.emit(Insn::Output {
            map,
            size: total as u32,
        });
    }

    // ==================== Expression lowering ====================

    fn gen_expr(&mut self, expr: &Expression) {
        if let Some(n) = fold::const_eval(expr) {
            self.emit(Insn::Imm(n));
            return;
        }

        match &expr.kind {
            ExprKind::Integer(n) => self.emit(Insn::Imm(*n)),
            ExprKind::Str(s) => {
                // Room is always left for the terminator.
                let size = expr.ty.size;
                let mut bytes = s.clone().into_bytes();
                bytes.truncate(size.saturating_sub(1));
                self.emit(Insn::Alloc { size: size as u32 });
                self.emit(Insn::Dup);
                self.emit(Insn::WriteBytes { bytes });
            }
            ExprKind::Builtin(ident) => self.gen_builtin(ident),
            ExprKind::Variable(name) => {
                let slot = *self
                    .vars
                    .get(name)
                    .unwrap_or_else(|| panic!("variable ${} has no binding", name));
                self.emit(Insn::LoadLocal(slot));
            }
            ExprKind::Map { ident, keys } => {
                let key = self.gen_map_key(ident, keys, None);
                let map = self.map_slot(ident);
                self.emit(Insn::LoadLocal(key));
                self.emit(Insn::Lookup { map });
            }
            ExprKind::Call { func, args } => self.gen_call(func, args),
            ExprKind::Binop { op, left, right } => self.gen_binop(*op, left, right),
            ExprKind::Unop { op, expr } => {
                self.gen_expr(expr);
                match op {
                    UnaryOp::LNot => self.emit(Insn::Not),
                    UnaryOp::BNot => self.emit(Insn::BitNot),
                    UnaryOp::Deref => self.emit(Insn::ProbeRead { size: 8 }),
                }
            }
            ExprKind::FieldAccess { .. } => {
                panic!("field access reached the code generator")
            }
            ExprKind::Cast { .. } => panic!("cast reached the code generator"),
        }
    }

    fn gen_builtin(&mut self, ident: &str) {
        match ident {
            "pid" => {
                self.emit(Insn::PidTgid);
                self.emit(Insn::Imm(32));
                self.emit(Insn::Binop(AluOp::Rsh));
            }
            "tid" => {
                self.emit(Insn::PidTgid);
                self.emit(Insn::Imm(0xffffffff));
                self.emit(Insn::Binop(AluOp::And));
            }
            "uid" => {
                self.emit(Insn::UidGid);
                self.emit(Insn::Imm(0xffffffff));
                self.emit(Insn::Binop(AluOp::And));
            }
            "gid" => {
                self.emit(Insn::UidGid);
                self.emit(Insn::Imm(32));
                self.emit(Insn::Binop(AluOp::Rsh));
            }
            "nsecs" => self.emit(Insn::Nsecs),
            "cpu" => self.emit(Insn::Cpu),
            "comm" => self.emit(Insn::Comm {
                size: COMM_SIZE as u32,
            }),
            "stack" => self.emit(Insn::StackId { user: false }),
            "ustack" => self.emit(Insn::StackId { user: true }),
            "retval" => self.emit(Insn::ReadCtx {
                offset: (arch::ret_offset() * arch::WORD_SIZE) as i32,
            }),
            "func" => self.emit(Insn::ReadCtx {
                offset: (arch::pc_offset() * arch::WORD_SIZE) as i32,
            }),
            _ => {
                let n: usize = ident
                    .strip_prefix("arg")
                    .and_then(|d| d.parse().ok())
                    .unwrap_or_else(|| panic!("unknown builtin {} reached codegen", ident));
                let offset = arch::arg_offset(n)
                    .unwrap_or_else(|| panic!("arg{} has no register slot", n));
                self.emit(Insn::ReadCtx {
                    offset: (offset * arch::WORD_SIZE) as i32,
                });
            }
        }
    }

    fn gen_call(&mut self, func: &str, args: &[Expression]) {
        match func {
            "str" => {
                self.gen_expr(&args[0]);
                self.emit(Insn::ProbeReadStr {
                    size: STRING_SIZE as u32,
                });
            }
            // The symbolisation tag is runtime-side metadata; the value
            // passes through unchanged.
            "sym" | "usym" => self.gen_expr(&args[0]),
            "reg" => {
                let name = match &args[0].kind {
                    ExprKind::Str(name) => name,
                    _ => panic!("reg() argument is not a literal"),
                };
                let offset = arch::register_offset(name)
                    .unwrap_or_else(|| panic!("unknown register {} reached codegen", name));
                self.emit(Insn::ReadCtx {
                    offset: (offset * arch::WORD_SIZE) as i32,
                });
            }
            _ => panic!("call to {}() reached expression lowering", func),
        }
    }

    fn gen_binop(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        // Short-circuit forms build their own control flow.
        match op {
            BinaryOp::LAnd => {
                let false_l = self.label();
                let merge = self.label();
                self.gen_expr(left);
                self.emit(Insn::Jz(false_l));
                self.gen_expr(right);
                self.emit(Insn::Jz(false_l));
                self.emit(Insn::Imm(1));
                self.emit(Insn::Ja(merge));
                self.emit(Insn::Label(false_l));
                self.emit(Insn::Imm(0));
                self.emit(Insn::Label(merge));
                return;
            }
            BinaryOp::LOr => {
                let true_l = self.label();
                let merge = self.label();
                self.gen_expr(left);
                self.emit(Insn::Jnz(true_l));
                self.gen_expr(right);
                self.emit(Insn::Jnz(true_l));
                self.emit(Insn::Imm(0));
                self.emit(Insn::Ja(merge));
                self.emit(Insn::Label(true_l));
                self.emit(Insn::Imm(1));
                self.emit(Insn::Label(merge));
                return;
            }
            _ => {}
        }

        self.gen_expr(left);
        self.gen_expr(right);

        if left.ty.is_string() {
            // strcmp returns 1 on equal strings.
            self.emit(Insn::Call("strcmp".to_string()));
            if op == BinaryOp::Ne {
                self.emit(Insn::Not);
            }
            return;
        }

        let alu = match op {
            BinaryOp::Mul => AluOp::Mul,
            BinaryOp::Div => AluOp::Div,
            BinaryOp::Mod => AluOp::Mod,
            BinaryOp::Plus => AluOp::Add,
            BinaryOp::Minus => AluOp::Sub,
            BinaryOp::Lt => AluOp::Lt,
            BinaryOp::Le => AluOp::Le,
            BinaryOp::Gt => AluOp::Gt,
            BinaryOp::Ge => AluOp::Ge,
            BinaryOp::Eq => AluOp::Eq,
            BinaryOp::Ne => AluOp::Ne,
            BinaryOp::BitAnd => AluOp::And,
            BinaryOp::BitOr => AluOp::Or,
            BinaryOp::BitXor => AluOp::Xor,
            BinaryOp::LAnd | BinaryOp::LOr => unreachable!("handled above"),
        };
        self.emit(Insn::Binop(alu));
    }
}

// ==================== Synthesized helpers ====================

/// Branchless floor-log2: five conditional shifts ORed together.
fn log2_function() -> IrFunction {
    let mut insns = vec![
        Insn::StoreLocal(0),
        Insn::Imm(0),
        Insn::StoreLocal(1),
    ];
    for i in (0..=4u32).rev() {
        insns.extend([
            Insn::LoadLocal(0),
            Insn::Imm(1i64 << (1u32 << i)),
            Insn::Binop(AluOp::Ge),
            Insn::Imm(i as i64),
            Insn::Binop(AluOp::Lsh),
            Insn::StoreLocal(2),
            Insn::LoadLocal(0),
            Insn::LoadLocal(2),
            Insn::Binop(AluOp::Rsh),
            Insn::StoreLocal(0),
            Insn::LoadLocal(1),
            Insn::LoadLocal(2),
            Insn::Binop(AluOp::Or),
            Insn::StoreLocal(1),
        ]);
    }
    insns.push(Insn::LoadLocal(1));
    insns.push(Insn::Ret);

    IrFunction {
        name: "log2".to_string(),
        section: "helpers".to_string(),
        always_inline: true,
        insns,
    }
}

/// Compares exactly STRING_SIZE bytes; 1 iff every byte matches. The
/// loop is unrolled so the verifier sees straight-line code.
fn strcmp_function() -> IrFunction {
    let not_equal = 0;
    let mut insns = vec![Insn::StoreLocal(1), Insn::StoreLocal(0)];
    for i in 0..STRING_SIZE {
        insns.extend([
            Insn::LoadLocal(0),
            Insn::Imm(i as i64),
            Insn::Binop(AluOp::Add),
            Insn::Load8,
            Insn::LoadLocal(1),
            Insn::Imm(i as i64),
            Insn::Binop(AluOp::Add),
            Insn::Load8,
            Insn::Binop(AluOp::Ne),
            Insn::Jnz(not_equal),
        ]);
    }
    insns.extend([
        Insn::Imm(1),
        Insn::Ret,
        Insn::Label(not_equal),
        Insn::Imm(0),
        Insn::Ret,
    ]);

    IrFunction {
        name: "strcmp".to_string(),
        section: "helpers".to_string(),
        always_inline: true,
        insns,
    }
}
