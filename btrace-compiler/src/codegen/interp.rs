// Reference interpreter for the stack IR.
//
// The kernel's packet-filter VM executes probe sections in production;
// this interpreter gives the test-suite the same semantics in user
// space: an operand stack, locals, scratch memory, a map store, and
// captured perf records. Allocations are padded so the unrolled string
// compare reads zero slack past short buffers, matching the
// zero-initialised probe stack.

use std::collections::{BTreeMap, HashMap};

use btrace_ast::STRING_SIZE;

use super::ir::{AluOp, Insn, IrProgram};

/// Per-invocation sources for builtin reads. Production probes get these
/// from the kernel; tests supply fixed values.
pub trait TraceEnv {
    fn pid_tgid(&self) -> u64;
    fn uid_gid(&self) -> u64;
    fn nsecs(&self) -> u64;
    fn cpu(&self) -> u64;
    fn comm(&self) -> &str;
    fn stack_id(&self, user: bool) -> i64;
    /// Word at `offset` bytes into the probe context (pt_regs).
    fn read_ctx_word(&self, offset: i32) -> u64;
    /// Bounded read of traced memory; false leaves the buffer zeroed.
    fn probe_read(&self, addr: u64, buf: &mut [u8]) -> bool;
}

/// A settable environment for tests.
#[derive(Default)]
pub struct TestEnv {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    pub nsecs: u64,
    pub cpu: u64,
    pub comm: String,
    pub regs: [u64; 21],
    pub memory: HashMap<u64, Vec<u8>>,
}

impl TraceEnv for TestEnv {
    fn pid_tgid(&self) -> u64 {
        ((self.pid as u64) << 32) | self.tid as u64
    }

    fn uid_gid(&self) -> u64 {
        ((self.gid as u64) << 32) | self.uid as u64
    }

    fn nsecs(&self) -> u64 {
        self.nsecs
    }

    fn cpu(&self) -> u64 {
        self.cpu
    }

    fn comm(&self) -> &str {
        &self.comm
    }

    fn stack_id(&self, user: bool) -> i64 {
        if user {
            2
        } else {
            1
        }
    }

    fn read_ctx_word(&self, offset: i32) -> u64 {
        let index = (offset as usize) / 8;
        self.regs.get(index).copied().unwrap_or(0)
    }

    fn probe_read(&self, addr: u64, buf: &mut [u8]) -> bool {
        for (base, region) in &self.memory {
            if addr >= *base && addr < base + region.len() as u64 {
                let start = (addr - base) as usize;
                let avail = &region[start..];
                let n = buf.len().min(avail.len());
                buf[..n].copy_from_slice(&avail[..n]);
                return true;
            }
        }
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterpError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("operand stack underflow at insn {0}")]
    StackUnderflow(usize),
    #[error("jump to unknown label {0}")]
    UnknownLabel(u32),
    #[error("helper call {0} survived inlining")]
    UnresolvedCall(String),
    #[error("map index {0} out of range")]
    BadMap(u32),
    #[error("execution did not reach a return")]
    NoReturn,
}

/// Executes functions from one IrProgram against a shared map store.
pub struct Machine<'a, E: TraceEnv> {
    program: &'a IrProgram,
    env: &'a E,
    /// One ordered table per manifest entry.
    pub maps: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Captured perf records, in emission order.
    pub output: Vec<Vec<u8>>,
}

impl<'a, E: TraceEnv> Machine<'a, E> {
    pub fn new(program: &'a IrProgram, env: &'a E) -> Self {
        Self {
            program,
            env,
            maps: vec![BTreeMap::new(); program.maps.len()],
            output: Vec::new(),
        }
    }

    /// Run one probe function to completion and return its exit value.
    pub fn run(&mut self, name: &str) -> Result<i64, InterpError> {
        let func = self
            .program
            .function(name)
            .ok_or_else(|| InterpError::UnknownFunction(name.to_string()))?;

        let mut labels: HashMap<u32, usize> = HashMap::new();
        for (pc, insn) in func.insns.iter().enumerate() {
            if let Insn::Label(l) = insn {
                labels.insert(*l, pc);
            }
        }

        let mut stack: Vec<i64> = Vec::new();
        let mut locals: Vec<i64> = Vec::new();
        let mut scratch: Vec<u8> = Vec::new();
        let mut pc = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().ok_or(InterpError::StackUnderflow(pc))?
            };
        }

        while pc < func.insns.len() {
            match &func.insns[pc] {
                Insn::Imm(n) => stack.push(*n),
                Insn::Dup => {
                    let v = pop!();
                    stack.push(v);
                    stack.push(v);
                }
                Insn::Drop => {
                    pop!();
                }
                Insn::LoadLocal(n) => {
                    let v = locals.get(*n as usize).copied().unwrap_or(0);
                    stack.push(v);
                }
                Insn::StoreLocal(n) => {
                    let v = pop!();
                    let idx = *n as usize;
                    if locals.len() <= idx {
                        locals.resize(idx + 1, 0);
                    }
                    locals[idx] = v;
                }
                Insn::Alloc { size } => {
                    let base = scratch.len();
                    let padded = (*size as usize).max(STRING_SIZE);
                    scratch.resize(base + padded, 0);
                    stack.push(base as i64);
                }
                Insn::WriteBytes { bytes } => {
                    let dst = pop!() as usize;
                    write_scratch(&mut scratch, dst, bytes);
                }
                Insn::Load8 => {
                    let addr = pop!() as usize;
                    stack.push(scratch.get(addr).copied().unwrap_or(0) as i64);
                }
                Insn::Store64 => {
                    let addr = pop!() as usize;
                    let value = pop!();
                    write_scratch(&mut scratch, addr, &value.to_le_bytes());
                }
                Insn::MemCpy { size } => {
                    let dst = pop!() as usize;
                    let src = pop!() as usize;
                    let bytes = read_scratch(&scratch, src, *size as usize);
                    write_scratch(&mut scratch, dst, &bytes);
                }
                Insn::ReadCtx { offset } => stack.push(self.env.read_ctx_word(*offset) as i64),
                Insn::ProbeRead { size } => {
                    let addr = pop!() as u64;
                    let mut buf = vec![0u8; (*size as usize).max(8)];
                    self.env.probe_read(addr, &mut buf[..*size as usize]);
                    let mut word = [0u8; 8];
                    word.copy_from_slice(&buf[..8]);
                    stack.push(i64::from_le_bytes(word));
                }
                Insn::ProbeReadStr { size } => {
                    let addr = pop!() as u64;
                    let mut buf = vec![0u8; *size as usize];
                    self.env.probe_read(addr, &mut buf);
                    // NUL-terminate and clear the tail like probe_read_str.
                    if let Some(nul) = buf.iter().position(|&b| b == 0) {
                        buf[nul..].fill(0);
                    } else if let Some(last) = buf.last_mut() {
                        *last = 0;
                    }
                    let base = scratch.len();
                    scratch.resize(base + (*size as usize).max(STRING_SIZE), 0);
                    write_scratch(&mut scratch, base, &buf);
                    stack.push(base as i64);
                }
                Insn::PidTgid => stack.push(self.env.pid_tgid() as i64),
                Insn::UidGid => stack.push(self.env.uid_gid() as i64),
                Insn::Nsecs => stack.push(self.env.nsecs() as i64),
                Insn::Cpu => stack.push(self.env.cpu() as i64),
                Insn::StackId { user } => stack.push(self.env.stack_id(*user)),
                Insn::Comm { size } => {
                    let base = scratch.len();
                    scratch.resize(base + (*size as usize).max(STRING_SIZE), 0);
                    let comm = self.env.comm().as_bytes();
                    let n = comm.len().min(*size as usize - 1);
                    write_scratch(&mut scratch, base, &comm[..n]);
                    stack.push(base as i64);
                }
                Insn::Binop(op) => {
                    let r = pop!();
                    let l = pop!();
                    stack.push(alu(*op, l, r));
                }
                Insn::Not => {
                    let v = pop!();
                    stack.push((v == 0) as i64);
                }
                Insn::BitNot => {
                    let v = pop!();
                    stack.push(!v);
                }
                Insn::Label(_) => {}
                Insn::Jz(l) => {
                    if pop!() == 0 {
                        pc = *labels.get(l).ok_or(InterpError::UnknownLabel(*l))?;
                        continue;
                    }
                }
                Insn::Jnz(l) => {
                    if pop!() != 0 {
                        pc = *labels.get(l).ok_or(InterpError::UnknownLabel(*l))?;
                        continue;
                    }
                }
                Insn::Ja(l) => {
                    pc = *labels.get(l).ok_or(InterpError::UnknownLabel(*l))?;
                    continue;
                }
                Insn::Ret => return Ok(pop!()),
                Insn::Call(name) => {
                    return Err(InterpError::UnresolvedCall(name.clone()));
                }
                Insn::Lookup { map } => {
                    let key = pop!() as usize;
                    let def = self
                        .program
                        .maps
                        .get(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?;
                    let key_bytes = read_scratch(&scratch, key, def.key_size as usize);
                    let table = self
                        .maps
                        .get(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?;
                    let value = table.get(&key_bytes).cloned();
                    if def.string_value {
                        let base = scratch.len();
                        scratch.resize(base + (def.value_size as usize).max(STRING_SIZE), 0);
                        if let Some(value) = value {
                            write_scratch(&mut scratch, base, &value);
                        }
                        stack.push(base as i64);
                    } else {
                        let v = value
                            .map(|bytes| {
                                let mut word = [0u8; 8];
                                let n = bytes.len().min(8);
                                word[..n].copy_from_slice(&bytes[..n]);
                                i64::from_le_bytes(word)
                            })
                            .unwrap_or(0);
                        stack.push(v);
                    }
                }
                Insn::Update { map } => {
                    let key = pop!() as usize;
                    let value = pop!() as usize;
                    let def = self
                        .program
                        .maps
                        .get(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?;
                    let key_bytes = read_scratch(&scratch, key, def.key_size as usize);
                    let value_bytes = read_scratch(&scratch, value, def.value_size as usize);
                    self.maps
                        .get_mut(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?
                        .insert(key_bytes, value_bytes);
                }
                Insn::Delete { map } => {
                    let key = pop!() as usize;
                    let def = self
                        .program
                        .maps
                        .get(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?;
                    let key_bytes = read_scratch(&scratch, key, def.key_size as usize);
                    self.maps
                        .get_mut(*map as usize)
                        .ok_or(InterpError::BadMap(*map))?
                        .remove(&key_bytes);
                }
                Insn::Output { map: _, size } => {
                    let record = pop!() as usize;
                    let bytes = read_scratch(&scratch, record, *size as usize);
                    self.output.push(bytes);
                }
            }
            pc += 1;
        }

        Err(InterpError::NoReturn)
    }

    /// The named map's contents, for assertions.
    pub fn map_by_name(&self, name: &str) -> Option<&BTreeMap<Vec<u8>, Vec<u8>>> {
        let idx = self.program.map_index(name)?;
        self.maps.get(idx as usize)
    }
}

fn alu(op: AluOp, l: i64, r: i64) -> i64 {
    match op {
        AluOp::Add => l.wrapping_add(r),
        AluOp::Sub => l.wrapping_sub(r),
        AluOp::Mul => l.wrapping_mul(r),
        AluOp::Div => {
            if r == 0 {
                0
            } else {
                ((l as u64) / (r as u64)) as i64
            }
        }
        AluOp::Mod => {
            if r == 0 {
                0
            } else {
                ((l as u64) % (r as u64)) as i64
            }
        }
        AluOp::And => l & r,
        AluOp::Or => l | r,
        AluOp::Xor => l ^ r,
        AluOp::Lsh => ((l as u64) << (r as u64 & 63)) as i64,
        AluOp::Rsh => ((l as u64) >> (r as u64 & 63)) as i64,
        AluOp::Eq => (l == r) as i64,
        AluOp::Ne => (l != r) as i64,
        AluOp::Lt => (l < r) as i64,
        AluOp::Le => (l <= r) as i64,
        AluOp::Gt => (l > r) as i64,
        AluOp::Ge => (l >= r) as i64,
    }
}

fn read_scratch(scratch: &[u8], addr: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if addr < scratch.len() {
        let avail = &scratch[addr..];
        let n = len.min(avail.len());
        out[..n].copy_from_slice(&avail[..n]);
    }
    out
}

fn write_scratch(scratch: &mut Vec<u8>, addr: usize, bytes: &[u8]) {
    if scratch.len() < addr + bytes.len() {
        scratch.resize(addr + bytes.len(), 0);
    }
    scratch[addr..addr + bytes.len()].copy_from_slice(bytes);
}
