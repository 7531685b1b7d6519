// Stack-machine low-level IR.
//
// Operand conventions, used consistently by the lowering, the inliner
// and the reference interpreter:
//   - Store64 pops the address, then the value.
//   - MemCpy pops the destination, then the source.
//   - Update pops the key pointer, then the value pointer.
//   - Lookup/Delete pop a key pointer; Output pops a record pointer.
//   - Helper calls take arguments in push order: strcmp pops s2 then s1,
//     log2 pops its single operand.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub type Label = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Insn {
    /// Push a 64-bit constant
    Imm(i64),
    Dup,
    Drop,
    LoadLocal(u32),
    StoreLocal(u32),

    /// Push a pointer to `size` bytes of zeroed scratch memory
    Alloc { size: u32 },
    /// Pop a destination pointer and copy the literal bytes there
    WriteBytes { bytes: Vec<u8> },
    /// Pop a scratch address, push the byte stored there
    Load8,
    /// Pop an address, pop a value, store it as 8 little-endian bytes
    Store64,
    /// Pop a destination, pop a source, copy `size` scratch bytes
    MemCpy { size: u32 },

    /// Push the word at ctx + offset (a probe_read of a register slot)
    ReadCtx { offset: i32 },
    /// Pop a traced address, push the `size`-byte value read from it
    ProbeRead { size: u32 },
    /// Pop a traced address, push a pointer to a fresh NUL-terminated
    /// scratch buffer of `size` bytes read from it
    ProbeReadStr { size: u32 },
    PidTgid,
    UidGid,
    Nsecs,
    Cpu,
    StackId { user: bool },
    /// Push a pointer to a `size`-byte scratch buffer holding comm
    Comm { size: u32 },

    /// Pop rhs, pop lhs, push the 64-bit result
    Binop(AluOp),
    /// Logical not: pop v, push v == 0
    Not,
    /// Bitwise complement
    BitNot,

    Label(Label),
    /// Pop; jump when zero
    Jz(Label),
    /// Pop; jump when non-zero
    Jnz(Label),
    Ja(Label),
    /// Pop the function result and return it
    Ret,

    /// Call a synthesized helper by name; removed by the inline pass
    Call(String),

    /// Pop a key pointer; push the element value (integers by value with
    /// missing elements as 0, string values as a scratch pointer)
    Lookup { map: u32 },
    /// Pop a key pointer, pop a value pointer, update the element
    Update { map: u32 },
    /// Pop a key pointer, remove the element
    Delete { map: u32 },
    /// Pop a record pointer, emit `size` bytes to the perf-event-array
    /// map's ring
    Output { map: u32, size: u32 },
}

/// Signed comparisons, unsigned division and modulo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Lsh,
    Rsh,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapKind {
    Hash,
    PerfEventArray,
}

/// Loader-facing description of one map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrMapDef {
    pub name: String,
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    /// Whether values are string buffers rather than integers; drives
    /// Lookup result representation.
    pub string_value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    pub name: String,
    pub section: String,
    pub always_inline: bool,
    pub insns: Vec<Insn>,
}

/// The loader manifest: every map plus one function per probe section
/// and the helper section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrProgram {
    pub maps: Vec<IrMapDef>,
    pub functions: Vec<IrFunction>,
}

impl IrProgram {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn map_index(&self, name: &str) -> Option<u32> {
        self.maps
            .iter()
            .position(|m| m.name == name)
            .map(|i| i as u32)
    }

    /// Splice every always-inline helper body into its call sites.
    /// Labels and locals are renumbered past the caller's; a helper's
    /// `Ret` becomes a jump to the join point with its result on the
    /// stack.
    pub fn inline_helpers(&mut self) {
        let helpers: HashMap<String, Vec<Insn>> = self
            .functions
            .iter()
            .filter(|f| f.always_inline)
            .map(|f| (f.name.clone(), f.insns.clone()))
            .collect();

        for func in self.functions.iter_mut().filter(|f| !f.always_inline) {
            loop {
                let call = func.insns.iter().position(|i| matches!(i, Insn::Call(_)));
                let idx = match call {
                    Some(idx) => idx,
                    None => break,
                };
                let name = match &func.insns[idx] {
                    Insn::Call(name) => name.clone(),
                    _ => unreachable!(),
                };
                let body = helpers
                    .get(&name)
                    .unwrap_or_else(|| panic!("call to unknown helper {}", name));

                let local_base = max_local(&func.insns);
                let label_base = max_label(&func.insns);
                let join = label_base + max_label(body);

                let mut spliced: Vec<Insn> = body
                    .iter()
                    .map(|insn| remap(insn, local_base, label_base, join))
                    .collect();
                spliced.push(Insn::Label(join));

                func.insns.splice(idx..idx + 1, spliced);
            }
        }
    }

    /// Encode each section's functions to bytes for the loader.
    pub fn encode_sections(&self) -> BTreeMap<String, Vec<u8>> {
        let mut sections = BTreeMap::new();
        for func in &self.functions {
            let buf: &mut Vec<u8> = sections.entry(func.section.clone()).or_default();
            for insn in &func.insns {
                encode_insn(insn, buf);
            }
        }
        sections
    }

    /// Human-readable dump, printed by the debug flag.
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for map in &self.maps {
            let _ = writeln!(
                out,
                "map @{} kind={:?} key_size={} value_size={}",
                map.name, map.kind, map.key_size, map.value_size
            );
        }
        for func in &self.functions {
            let _ = writeln!(
                out,
                "fn {} section={}{}",
                func.name,
                func.section,
                if func.always_inline {
                    " always_inline"
                } else {
                    ""
                }
            );
            for insn in &func.insns {
                let _ = writeln!(out, "  {:?}", insn);
            }
        }
        out
    }
}

fn remap(insn: &Insn, local_base: u32, label_base: u32, join: Label) -> Insn {
    match insn {
        Insn::LoadLocal(n) => Insn::LoadLocal(n + local_base),
        Insn::StoreLocal(n) => Insn::StoreLocal(n + local_base),
        Insn::Label(l) => Insn::Label(l + label_base),
        Insn::Jz(l) => Insn::Jz(l + label_base),
        Insn::Jnz(l) => Insn::Jnz(l + label_base),
        Insn::Ja(l) => Insn::Ja(l + label_base),
        Insn::Ret => Insn::Ja(join),
        other => other.clone(),
    }
}

fn max_local(insns: &[Insn]) -> u32 {
    insns
        .iter()
        .filter_map(|i| match i {
            Insn::LoadLocal(n) | Insn::StoreLocal(n) => Some(n + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn max_label(insns: &[Insn]) -> u32 {
    insns
        .iter()
        .filter_map(|i| match i {
            Insn::Label(l) | Insn::Jz(l) | Insn::Jnz(l) | Insn::Ja(l) => Some(l + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn encode_insn(insn: &Insn, buf: &mut Vec<u8>) {
    match insn {
        Insn::Imm(n) => {
            buf.push(0x01);
            buf.extend(n.to_le_bytes());
        }
        Insn::Dup => buf.push(0x02),
        Insn::Drop => buf.push(0x03),
        Insn::LoadLocal(n) => {
            buf.push(0x04);
            buf.extend(n.to_le_bytes());
        }
        Insn::StoreLocal(n) => {
            buf.push(0x05);
            buf.extend(n.to_le_bytes());
        }
        Insn::Alloc { size } => {
            buf.push(0x06);
            buf.extend(size.to_le_bytes());
        }
        Insn::WriteBytes { bytes } => {
            buf.push(0x07);
            buf.extend((bytes.len() as u32).to_le_bytes());
            buf.extend(bytes);
        }
        Insn::Load8 => buf.push(0x08),
        Insn::Store64 => buf.push(0x09),
        Insn::MemCpy { size } => {
            buf.push(0x0a);
            buf.extend(size.to_le_bytes());
        }
        Insn::ReadCtx { offset } => {
            buf.push(0x0b);
            buf.extend(offset.to_le_bytes());
        }
        Insn::ProbeRead { size } => {
            buf.push(0x0c);
            buf.extend(size.to_le_bytes());
        }
        Insn::ProbeReadStr { size } => {
            buf.push(0x0d);
            buf.extend(size.to_le_bytes());
        }
        Insn::PidTgid => buf.push(0x0e),
        Insn::UidGid => buf.push(0x0f),
        Insn::Nsecs => buf.push(0x10),
        Insn::Cpu => buf.push(0x11),
        Insn::StackId { user } => {
            buf.push(0x12);
            buf.push(*user as u8);
        }
        Insn::Comm { size } => {
            buf.push(0x13);
            buf.extend(size.to_le_bytes());
        }
        Insn::Binop(op) => {
            buf.push(0x14);
            buf.push(*op as u8);
        }
        Insn::Not => buf.push(0x15),
        Insn::BitNot => buf.push(0x16),
        Insn::Label(l) => {
            buf.push(0x17);
            buf.extend(l.to_le_bytes());
        }
        Insn::Jz(l) => {
            buf.push(0x18);
            buf.extend(l.to_le_bytes());
        }
        Insn::Jnz(l) => {
            buf.push(0x19);
            buf.extend(l.to_le_bytes());
        }
        Insn::Ja(l) => {
            buf.push(0x1a);
            buf.extend(l.to_le_bytes());
        }
        Insn::Ret => buf.push(0x1b),
        Insn::Call(name) => {
            buf.push(0x1c);
            buf.extend((name.len() as u32).to_le_bytes());
            buf.extend(name.as_bytes());
        }
        Insn::Lookup { map } => {
            buf.push(0x1d);
            buf.extend(map.to_le_bytes());
        }
        Insn::Update { map } => {
            buf.push(0x1e);
            buf.extend(map.to_le_bytes());
        }
        Insn::Delete { map } => {
            buf.push(0x1f);
            buf.extend(map.to_le_bytes());
        }
        Insn::Output { map, size } => {
            buf.push(0x20);
            buf.extend(map.to_le_bytes());
            buf.extend(size.to_le_bytes());
        }
    }
}
