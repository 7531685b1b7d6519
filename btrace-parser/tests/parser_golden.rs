// Golden printer-output tests: the printed AST is the parsing contract.

use btrace_ast::Printer;
use btrace_parser::Parser;

fn print(input: &str) -> String {
    let mut parser = Parser::new(input).expect("lexing failed");
    let mut program = parser.parse().expect("parse failed");
    Printer::new().print(&mut program)
}

fn test(input: &str, expected: &str) {
    assert_eq!(expected, print(input), "for input: {input}");
}

#[test]
fn builtin_variables() {
    test("kprobe:f { pid }", "Program\n kprobe:f\n  builtin: pid\n");
    test("kprobe:f { tid }", "Program\n kprobe:f\n  builtin: tid\n");
    test("kprobe:f { uid }", "Program\n kprobe:f\n  builtin: uid\n");
    test("kprobe:f { gid }", "Program\n kprobe:f\n  builtin: gid\n");
    test("kprobe:f { nsecs }", "Program\n kprobe:f\n  builtin: nsecs\n");
    test("kprobe:f { cpu }", "Program\n kprobe:f\n  builtin: cpu\n");
    test("kprobe:f { comm }", "Program\n kprobe:f\n  builtin: comm\n");
    test("kprobe:f { stack }", "Program\n kprobe:f\n  builtin: stack\n");
    test("kprobe:f { ustack }", "Program\n kprobe:f\n  builtin: ustack\n");
    test("kprobe:f { arg0 }", "Program\n kprobe:f\n  builtin: arg0\n");
    test("kprobe:f { retval }", "Program\n kprobe:f\n  builtin: retval\n");
    test("kprobe:f { func }", "Program\n kprobe:f\n  builtin: func\n");
}

#[test]
fn map_assign() {
    test(
        "kprobe:sys_open { @x = 1; }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   int: 1\n",
    );
    test(
        "kprobe:sys_open { @x = @y; }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   map: @y\n",
    );
    test(
        "kprobe:sys_open { @x = arg0; }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   builtin: arg0\n",
    );
    test(
        "kprobe:sys_open { @x = count(); }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   call: count\n",
    );
    test(
        "kprobe:sys_open { @x = \"mystring\" }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   string: mystring\n",
    );
    test(
        "kprobe:sys_open { @x = $myvar; }",
        "Program\n kprobe:sys_open\n  =\n   map: @x\n   variable: $myvar\n",
    );
}

#[test]
fn variable_assign() {
    test(
        "kprobe:sys_open { $x = 1; }",
        "Program\n kprobe:sys_open\n  =\n   variable: $x\n   int: 1\n",
    );
}

#[test]
fn map_key() {
    test(
        "kprobe:sys_open { @x[0] = 1; @x[0,1,2] = 1; }",
        "Program\n\
         \x20kprobe:sys_open\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   int: 0\n\
         \x20  int: 1\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   int: 0\n\
         \x20   int: 1\n\
         \x20   int: 2\n\
         \x20  int: 1\n",
    );

    test(
        "kprobe:sys_open { @x[@a] = 1; @x[@a,@b,@c] = 1; }",
        "Program\n\
         \x20kprobe:sys_open\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   map: @a\n\
         \x20  int: 1\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   map: @a\n\
         \x20   map: @b\n\
         \x20   map: @c\n\
         \x20  int: 1\n",
    );

    test(
        "kprobe:sys_open { @x[pid] = 1; @x[tid,uid,arg9] = 1; }",
        "Program\n\
         \x20kprobe:sys_open\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   builtin: pid\n\
         \x20  int: 1\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20   builtin: tid\n\
         \x20   builtin: uid\n\
         \x20   builtin: arg9\n\
         \x20  int: 1\n",
    );
}

#[test]
fn predicate() {
    test(
        "kprobe:sys_open / @x / { 1; }",
        "Program\n kprobe:sys_open\n  pred\n   map: @x\n  int: 1\n",
    );
}

#[test]
fn predicate_containing_division() {
    test(
        "kprobe:sys_open /100/25/ { 1; }",
        "Program\n kprobe:sys_open\n  pred\n   /\n    int: 100\n    int: 25\n  int: 1\n",
    );
}

#[test]
fn expressions() {
    test(
        "kprobe:sys_open / 1 <= 2 && (9 - 4 != 5*10 || ~0) || comm == \"string\" /\n\
         {\n\
         \x20 1;\n\
         }",
        "Program\n\
         \x20kprobe:sys_open\n\
         \x20 pred\n\
         \x20  ||\n\
         \x20   &&\n\
         \x20    <=\n\
         \x20     int: 1\n\
         \x20     int: 2\n\
         \x20    ||\n\
         \x20     !=\n\
         \x20      -\n\
         \x20       int: 9\n\
         \x20       int: 4\n\
         \x20      *\n\
         \x20       int: 5\n\
         \x20       int: 10\n\
         \x20     ~\n\
         \x20      int: 0\n\
         \x20   ==\n\
         \x20    builtin: comm\n\
         \x20    string: string\n\
         \x20 int: 1\n",
    );
}

#[test]
fn call() {
    test(
        "kprobe:sys_open { @x = count(); @y = quantize(1,2,3); delete(@x); }",
        "Program\n\
         \x20kprobe:sys_open\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20  call: count\n\
         \x20 =\n\
         \x20  map: @y\n\
         \x20  call: quantize\n\
         \x20   int: 1\n\
         \x20   int: 2\n\
         \x20   int: 3\n\
         \x20 call: delete\n\
         \x20  map: @x\n",
    );
}

#[test]
fn call_unknown_function() {
    test(
        "kprobe:sys_open { myfunc() }",
        "Program\n kprobe:sys_open\n  call: myfunc\n",
    );
}

#[test]
fn multiple_probes() {
    test(
        "kprobe:sys_open { 1; } kretprobe:sys_open { 2; }",
        "Program\n kprobe:sys_open\n  int: 1\n kretprobe:sys_open\n  int: 2\n",
    );
}

#[test]
fn uprobe() {
    test(
        "uprobe:/my/program:func { 1; }",
        "Program\n uprobe:/my/program:func\n  int: 1\n",
    );
}

#[test]
fn escape_chars() {
    test(
        "kprobe:sys_open { \"newline\\nand tab\\tbackslash\\\\quote\\\"here\" }",
        "Program\n kprobe:sys_open\n  string: newline\\nand tab\\tbackslash\\\\quote\\\"here\n",
    );
}

#[test]
fn begin_probe() {
    test("BEGIN { 1 }", "Program\n BEGIN\n  int: 1\n");
}

#[test]
fn tracepoint_probe() {
    test(
        "tracepoint:sched:sched_switch { 1 }",
        "Program\n tracepoint:sched:sched_switch\n  int: 1\n",
    );
}

#[test]
fn profile_probe() {
    test("profile:ms:997 { 1 }", "Program\n profile:ms:997\n  int: 1\n");
}

#[test]
fn multiple_attach_points_kprobe() {
    test(
        "BEGIN,kprobe:sys_open,uprobe:/bin/sh:foo,tracepoint:syscalls:sys_enter_* { 1 }",
        "Program\n\
         \x20BEGIN\n\
         \x20kprobe:sys_open\n\
         \x20uprobe:/bin/sh:foo\n\
         \x20tracepoint:syscalls:sys_enter_*\n\
         \x20 int: 1\n",
    );
}

#[test]
fn character_class_attach_point() {
    test(
        "kprobe:[Ss]y[Ss]_read { 1 }",
        "Program\n kprobe:[Ss]y[Ss]_read\n  int: 1\n",
    );
}

#[test]
fn wildcard_attach_points() {
    test("kprobe:sys_* { 1 }", "Program\n kprobe:sys_*\n  int: 1\n");
    test("kprobe:*blah { 1 }", "Program\n kprobe:*blah\n  int: 1\n");
    test("kprobe:sys*blah { 1 }", "Program\n kprobe:sys*blah\n  int: 1\n");
    test("kprobe:* { 1 }", "Program\n kprobe:*\n  int: 1\n");
    test(
        "kprobe:sys_* { @x = cpu*retval }",
        "Program\n\
         \x20kprobe:sys_*\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20  *\n\
         \x20   builtin: cpu\n\
         \x20   builtin: retval\n",
    );
    test(
        "kprobe:sys_* { @x = *arg0 }",
        "Program\n\
         \x20kprobe:sys_*\n\
         \x20 =\n\
         \x20  map: @x\n\
         \x20  dereference\n\
         \x20   builtin: arg0\n",
    );
}

#[test]
fn short_map_name() {
    test(
        "kprobe:sys_read { @ = 1 }",
        "Program\n kprobe:sys_read\n  =\n   map: @\n   int: 1\n",
    );
}

#[test]
fn include() {
    test(
        "#include <stdio.h> kprobe:sys_read { @x = 1 }",
        "#include <stdio.h>\nProgram\n kprobe:sys_read\n  =\n   map: @x\n   int: 1\n",
    );
}

#[test]
fn include_quote() {
    test(
        "#include \"stdio.h\" kprobe:sys_read { @x = 1 }",
        "#include \"stdio.h\"\nProgram\n kprobe:sys_read\n  =\n   map: @x\n   int: 1\n",
    );
}

#[test]
fn include_multiple() {
    test(
        "#include <stdio.h> #include \"blah\" #include <foo.h> kprobe:sys_read { @x = 1 }",
        "#include <stdio.h>\n\
         #include \"blah\"\n\
         #include <foo.h>\n\
         Program\n kprobe:sys_read\n  =\n   map: @x\n   int: 1\n",
    );
}

#[test]
fn brackets() {
    test(
        "kprobe:sys_read { (arg0*arg1) }",
        "Program\n kprobe:sys_read\n  *\n   builtin: arg0\n   builtin: arg1\n",
    );
}

// A parenthesised identifier is only a cast when it names a declared
// struct (or a primitive type).

#[test]
fn cast() {
    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype)arg0; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  (mytype)\n   builtin: arg0\n",
    );
}

#[test]
fn cast_ptr() {
    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype*)arg0; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  (mytype*)\n   builtin: arg0\n",
    );
}

#[test]
fn cast_or_expr1() {
    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype)*arg0; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  (mytype)\n   dereference\n    builtin: arg0\n",
    );
}

#[test]
fn cast_or_expr2() {
    // No struct named arg1 is declared, so this is a multiplication.
    test(
        "kprobe:sys_read { (arg1)*arg0; }",
        "Program\n kprobe:sys_read\n  *\n   builtin: arg1\n   builtin: arg0\n",
    );
}

#[test]
fn cast_precedence() {
    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype)arg0.field; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  (mytype)\n   .\n    builtin: arg0\n    field\n",
    );

    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype*)arg0->field; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  (mytype*)\n   .\n    dereference\n     builtin: arg0\n    field\n",
    );

    test(
        "struct mytype { int n; } kprobe:sys_read { (mytype)arg0+123; }",
        "struct mytype\n int n\nProgram\n kprobe:sys_read\n  +\n   (mytype)\n    builtin: arg0\n   int: 123\n",
    );
}

#[test]
fn dereference_precedence() {
    test(
        "kprobe:sys_read { *@x+1 }",
        "Program\n kprobe:sys_read\n  +\n   dereference\n    map: @x\n   int: 1\n",
    );

    test(
        "kprobe:sys_read { *@x**@y }",
        "Program\n kprobe:sys_read\n  *\n   dereference\n    map: @x\n   dereference\n    map: @y\n",
    );

    test(
        "kprobe:sys_read { *@x*@y }",
        "Program\n kprobe:sys_read\n  *\n   dereference\n    map: @x\n   map: @y\n",
    );

    test(
        "kprobe:sys_read { *@x.myfield }",
        "Program\n kprobe:sys_read\n  dereference\n   .\n    map: @x\n    myfield\n",
    );
}

#[test]
fn field_access() {
    test(
        "kprobe:sys_read { @x.myfield; }",
        "Program\n kprobe:sys_read\n  .\n   map: @x\n   myfield\n",
    );

    test(
        "kprobe:sys_read { @x->myfield; }",
        "Program\n kprobe:sys_read\n  .\n   dereference\n    map: @x\n   myfield\n",
    );
}

#[test]
fn field_access_builtin() {
    test(
        "kprobe:sys_read { @x.count; }",
        "Program\n kprobe:sys_read\n  .\n   map: @x\n   count\n",
    );

    test(
        "kprobe:sys_read { @x->count; }",
        "Program\n kprobe:sys_read\n  .\n   dereference\n    map: @x\n   count\n",
    );
}

#[test]
fn cstruct_int() {
    test(
        "struct Foo { int n; } kprobe:sys_read { 1 }",
        "struct Foo\n int n\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_int_ptr() {
    test(
        "struct Foo { int *n; } kprobe:sys_read { 1 }",
        "struct Foo\n int* n\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_int_multi() {
    test(
        "struct Foo { int n; int a,*b,c; } kprobe:sys_read { 1 }",
        "struct Foo\n int n\n int a\n int* b\n int c\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_char_ptr() {
    test(
        "struct Foo { char *str; } kprobe:sys_read { 1 }",
        "struct Foo\n char* str\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_char_array_ptr() {
    test(
        "struct Foo { char *str[32]; } kprobe:sys_read { 1 }",
        "struct Foo\n char*[32] str\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_char_array() {
    test(
        "struct Foo { char str[32]; } kprobe:sys_read { 1 }",
        "struct Foo\n char[32] str\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn cstruct_containing_struct() {
    test(
        "struct Foo { struct Bar b; struct Car *c,d; } kprobe:sys_read { 1 }",
        "struct Foo\n Bar b\n Car* c\n Car d\nProgram\n kprobe:sys_read\n  int: 1\n",
    );
}

#[test]
fn predicate_with_last_slash_terminator() {
    test(
        "kprobe:f /100/25/4/ { 1 }",
        "Program\n kprobe:f\n  pred\n   /\n    /\n     int: 100\n     int: 25\n    int: 4\n  int: 1\n",
    );
}

#[test]
fn print_is_deterministic() {
    let inputs = [
        "kprobe:sys_open { @x[pid, comm] = count(); }",
        "kprobe:sys_open /100/25/ { $a = 1; @y = quantize(arg0); }",
        "#include <stdio.h> struct Foo { int n; } BEGIN { printf(\"%d\\n\", 1) }",
    ];
    for input in inputs {
        assert_eq!(print(input), print(input), "for input: {input}");
    }
}

#[test]
fn syntax_error_reports_location() {
    let mut parser = Parser::new("kprobe:f { + }").expect("lexing failed");
    let err = parser.parse().expect_err("should fail");
    let msg = err.to_string();
    assert!(msg.contains("Parse error"), "got: {msg}");
    assert!(msg.contains("1:12"), "got: {msg}");
}
