// Behavioural tests: lowered programs are executed by the reference
// interpreter against a fixed trace environment.

use btrace_compiler::analyser::{Analyser, Analysis};
use btrace_compiler::codegen::interp::{Machine, TestEnv};
use btrace_compiler::codegen::ir::IrProgram;
use btrace_compiler::codegen::CodeGen;
use btrace_parser::Parser;

fn compile(source: &str) -> (Analysis, IrProgram) {
    let mut parser = Parser::new(source).expect("lexing failed");
    let mut program = parser.parse().expect("parse failed");
    let analysis = Analyser::analyse(&mut program).expect("analysis failed");
    let mut ir = CodeGen::compile(&program, &analysis);
    ir.inline_helpers();
    (analysis, ir)
}

fn env() -> TestEnv {
    TestEnv {
        pid: 1000,
        tid: 1001,
        uid: 500,
        gid: 501,
        nsecs: 123_456_789,
        cpu: 2,
        comm: "bash".to_string(),
        ..TestEnv::default()
    }
}

fn int_value(bytes: &[u8]) -> i64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(word)
}

const ZERO_KEY: [u8; 8] = [0; 8];

#[test]
fn count_accumulates_per_firing() {
    let (_, ir) = compile("kprobe:f { @c = count(); }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    for _ in 0..5 {
        assert_eq!(machine.run("kprobe:f").unwrap(), 0);
    }
    let map = machine.map_by_name("c").unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(int_value(&map[&ZERO_KEY[..].to_vec()]), 5);
}

#[test]
fn quantize_places_power_of_two_buckets() {
    let (_, ir) = compile("kprobe:f { @q = quantize(arg0); }");
    let mut env = env();

    // Fire once per value, carrying the map store across invocations;
    // arg0 lives in rdi (word offset 14).
    let mut maps = None;
    for value in [1u64, 2, 4, 8] {
        env.regs[14] = value;
        let mut machine = Machine::new(&ir, &env);
        if let Some(saved) = maps.take() {
            machine.maps = saved;
        }
        machine.run("kprobe:f").unwrap();
        maps = Some(machine.maps);
    }

    let idx = ir.map_index("q").unwrap() as usize;
    let maps = maps.unwrap();
    let buckets: Vec<(i64, i64)> = maps[idx]
        .iter()
        .map(|(k, v)| (int_value(k), int_value(v)))
        .collect();
    assert_eq!(buckets, vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
}

#[test]
fn printf_record_carries_id_and_fields() {
    let (analysis, ir) = compile("kprobe:f { printf(\"%d %s\\n\", pid, comm); }");
    assert_eq!(analysis.printfs.len(), 1);
    assert_eq!(analysis.printfs[0].record_size(), 8 + 8 + 16);

    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();

    assert_eq!(machine.output.len(), 1);
    let record = &machine.output[0];
    assert_eq!(record.len(), 32);
    assert_eq!(int_value(&record[0..8]), 0); // printf id
    assert_eq!(int_value(&record[8..16]), 1000); // pid
    assert_eq!(&record[16..20], b"bash");
    assert_eq!(record[20], 0);
}

#[test]
fn printf_ids_are_shared_across_attach_points() {
    let (analysis, ir) = compile("kprobe:a,kprobe:b { printf(\"x\\n\"); }");
    assert_eq!(analysis.printfs.len(), 1);

    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:a").unwrap();
    machine.run("kprobe:b").unwrap();
    assert_eq!(machine.output.len(), 2);
    assert_eq!(int_value(&machine.output[0][0..8]), 0);
    assert_eq!(int_value(&machine.output[1][0..8]), 0);
}

#[test]
fn string_equality_predicate_matches_comm() {
    let source = "kprobe:f /comm == \"bash\"/ { @hit = 1; }";
    let (_, ir) = compile(source);

    let mut env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    assert_eq!(machine.map_by_name("hit").unwrap().len(), 1);

    env.comm = "vim".to_string();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    assert!(machine.map_by_name("hit").unwrap().is_empty());
}

#[test]
fn string_inequality_uses_negated_strcmp() {
    let (_, ir) = compile("kprobe:f /comm != \"bash\"/ { @hit = 1; }");
    let env = env(); // comm is bash
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    assert!(machine.map_by_name("hit").unwrap().is_empty());
}

#[test]
fn false_predicate_returns_zero_without_side_effects() {
    let (_, ir) = compile("kprobe:f /0/ { @x = count(); }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    assert_eq!(machine.run("kprobe:f").unwrap(), 0);
    assert!(machine.map_by_name("x").unwrap().is_empty());
}

#[test]
fn complement_is_bitwise_not_negation() {
    let (_, ir) = compile("kprobe:f { @x = ~0; }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("x").unwrap();
    assert_eq!(int_value(&map[&ZERO_KEY[..].to_vec()]), -1);
}

#[test]
fn logical_operators_yield_zero_or_one() {
    let (_, ir) = compile("kprobe:f { @a = pid && cpu; @b = pid || cpu; @c = !pid; }");
    let mut env = env();
    env.pid = 0;
    env.cpu = 3;
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let key = ZERO_KEY[..].to_vec();
    assert_eq!(int_value(&machine.map_by_name("a").unwrap()[&key]), 0);
    assert_eq!(int_value(&machine.map_by_name("b").unwrap()[&key]), 1);
    assert_eq!(int_value(&machine.map_by_name("c").unwrap()[&key]), 1);
}

#[test]
fn pid_tid_uid_gid_word_splits() {
    let (_, ir) = compile("kprobe:f { @p = pid; @t = tid; @u = uid; @g = gid; }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let key = ZERO_KEY[..].to_vec();
    assert_eq!(int_value(&machine.map_by_name("p").unwrap()[&key]), 1000);
    assert_eq!(int_value(&machine.map_by_name("t").unwrap()[&key]), 1001);
    assert_eq!(int_value(&machine.map_by_name("u").unwrap()[&key]), 500);
    assert_eq!(int_value(&machine.map_by_name("g").unwrap()[&key]), 501);
}

#[test]
fn dereference_reads_traced_memory() {
    let (_, ir) = compile("kprobe:f { @x = *arg0; }");
    let mut env = env();
    env.regs[14] = 0x1000; // rdi
    env.memory.insert(0x1000, 42i64.to_le_bytes().to_vec());
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("x").unwrap();
    assert_eq!(int_value(&map[&ZERO_KEY[..].to_vec()]), 42);
}

#[test]
fn str_reads_nul_terminated_string() {
    let (_, ir) = compile("kprobe:f { @s = str(arg0); }");
    let mut env = env();
    env.regs[14] = 0x2000;
    env.memory.insert(0x2000, b"hello\0junk".to_vec());
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("s").unwrap();
    let value = &map[&ZERO_KEY[..].to_vec()];
    assert_eq!(&value[..6], b"hello\0");
    assert!(value[6..].iter().all(|&b| b == 0));
}

#[test]
fn map_reads_feed_expressions() {
    let (_, ir) = compile("kprobe:f { @x = 7; @y = @x + 1; }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("y").unwrap();
    assert_eq!(int_value(&map[&ZERO_KEY[..].to_vec()]), 8);
}

#[test]
fn variables_rebind_within_a_probe() {
    let (_, ir) = compile("kprobe:f { $a = 3; $a = $a + 4; @x = $a; }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("x").unwrap();
    assert_eq!(int_value(&map[&ZERO_KEY[..].to_vec()]), 7);
}

#[test]
fn delete_removes_the_element() {
    let (_, ir) = compile("kprobe:f { @x = 1; delete(@x); }");
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    assert!(machine.map_by_name("x").unwrap().is_empty());
}

#[test]
fn keyed_count_groups_by_key() {
    let (_, ir) = compile("kprobe:f { @c[pid] = count(); }");
    let mut env = env();
    let mut maps = None;
    for pid in [1u32, 1, 2] {
        env.pid = pid;
        let mut machine = Machine::new(&ir, &env);
        if let Some(saved) = maps.take() {
            machine.maps = saved;
        }
        machine.run("kprobe:f").unwrap();
        maps = Some(machine.maps);
    }
    let maps = maps.unwrap();
    let idx = ir.map_index("c").unwrap() as usize;
    let table = &maps[idx];
    assert_eq!(table.len(), 2);
    let mut counts: Vec<(i64, i64)> = table
        .iter()
        .map(|(k, v)| (int_value(k), int_value(v)))
        .collect();
    counts.sort();
    assert_eq!(counts, vec![(1, 2), (2, 1)]);
}

#[test]
fn string_map_keys_pack_their_full_size() {
    let (analysis, ir) = compile("kprobe:f { @c[comm] = count(); }");
    assert_eq!(analysis.maps["c"].key_size(), 16);
    let env = env();
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let map = machine.map_by_name("c").unwrap();
    let (key, value) = map.iter().next().unwrap();
    assert_eq!(key.len(), 16);
    assert_eq!(&key[..5], b"bash\0");
    assert_eq!(int_value(value), 1);
}

#[test]
fn constant_folding_still_divides_like_the_machine() {
    // 100/25 folds to a constant; arg0/arg1 stays a runtime division.
    let (_, ir) = compile("kprobe:f { @a = 100/25; @b = arg0/arg1; }");
    let f = ir.function("kprobe:f").unwrap();
    use btrace_compiler::codegen::ir::Insn;
    assert!(f.insns.contains(&Insn::Imm(4)));

    let mut env = env();
    env.regs[14] = 100; // rdi = arg0
    env.regs[13] = 25; // rsi = arg1
    let mut machine = Machine::new(&ir, &env);
    machine.run("kprobe:f").unwrap();
    let key = ZERO_KEY[..].to_vec();
    assert_eq!(int_value(&machine.map_by_name("a").unwrap()[&key]), 4);
    assert_eq!(int_value(&machine.map_by_name("b").unwrap()[&key]), 4);
}

#[test]
fn sections_and_helpers_are_emitted() {
    let (_, ir) = compile("kprobe:f { @q = quantize(arg0); } kretprobe:g /1/ { @c = count(); }");
    let sections = ir.encode_sections();
    assert!(sections.contains_key("s_kprobe:f"));
    assert!(sections.contains_key("s_kretprobe:g"));
    assert!(sections.contains_key("helpers"));

    let rendered = ir.render();
    assert!(rendered.contains("fn log2 section=helpers always_inline"));
    assert!(rendered.contains("fn kprobe:f section=s_kprobe:f"));
}
