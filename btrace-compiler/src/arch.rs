// x86-64 register table: word offsets into struct pt_regs.
// Probe context reads are expressed as `offset * WORD_SIZE` bytes from the
// ctx pointer.

pub const WORD_SIZE: usize = 8;

const REGISTERS: &[(&str, usize)] = &[
    ("r15", 0),
    ("r14", 1),
    ("r13", 2),
    ("r12", 3),
    ("rbp", 4),
    ("rbx", 5),
    ("r11", 6),
    ("r10", 7),
    ("r9", 8),
    ("r8", 9),
    ("rax", 10),
    ("rcx", 11),
    ("rdx", 12),
    ("rsi", 13),
    ("rdi", 14),
    ("orig_rax", 15),
    ("rip", 16),
    ("cs", 17),
    ("eflags", 18),
    ("rsp", 19),
    ("ss", 20),
];

// Function arguments per the System V calling convention:
// rdi, rsi, rdx, rcx, r8, r9.
const ARG_OFFSETS: &[usize] = &[14, 13, 12, 11, 9, 8];

pub fn register_offset(name: &str) -> Option<usize> {
    REGISTERS
        .iter()
        .find(|(reg, _)| *reg == name)
        .map(|(_, offset)| *offset)
}

pub fn register_names() -> Vec<&'static str> {
    REGISTERS.iter().map(|(reg, _)| *reg).collect()
}

/// Word offset of the n-th function argument, None when the argument is
/// passed on the stack rather than in a register.
pub fn arg_offset(n: usize) -> Option<usize> {
    ARG_OFFSETS.get(n).copied()
}

pub fn ret_offset() -> usize {
    10 // rax
}

pub fn pc_offset() -> usize {
    16 // rip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_registers() {
        assert_eq!(arg_offset(0), Some(14)); // rdi
        assert_eq!(arg_offset(5), Some(8)); // r9
        assert_eq!(arg_offset(6), None);
    }

    #[test]
    fn named_registers() {
        assert_eq!(register_offset("rip"), Some(16));
        assert_eq!(register_offset("rdi"), Some(14));
        assert_eq!(register_offset("nope"), None);
    }
}
