// Integration tests for the Moss compiler and chunk tooling.
//
// These drive the compile entry point directly: diagnostics and recovery,
// determinism of emitted bytecode, and the disassembler's instruction walk
// agreeing with the byte stream it prints.

use moss::bytecode::OpCode;
use moss::compiler::compile;
use moss::heap::Heap;
use moss::object::Function;

fn compile_ok(source: &str) -> (Function, Heap) {
    let mut heap = Heap::new();
    let function = compile(source, &mut heap, false).expect("compile failed");
    (function, heap)
}

const SAMPLE: &str = "\
class Shape {
  init(name) { this.name = name; }
  describe() { return \"a \" + this.name; }
}
class Circle < Shape {
  describe() { return super.describe() + \" (round)\"; }
}
fun announce(shape) {
  print shape.describe();
}
for (var i = 0; i < 2; i = i + 1) {
  announce(Circle(\"circle\"));
}";

#[test]
fn chunks_always_end_in_an_implicit_return() {
    let (function, _) = compile_ok("print 1;");
    let code = &function.chunk.code;
    assert_eq!(code[code.len() - 1], OpCode::Return as u8);
    assert_eq!(code[code.len() - 2], OpCode::Nil as u8);
}

#[test]
fn line_table_covers_every_code_byte() {
    let (function, _) = compile_ok(SAMPLE);
    assert_eq!(function.chunk.code.len(), function.chunk.lines.len());
}

#[test]
fn disassembler_walk_consumes_exactly_the_code_bytes() {
    let (function, heap) = compile_ok(SAMPLE);

    // Walk every function in the compile: the script plus each nested one.
    let mut pending = vec![&function];
    while let Some(function) = pending.pop() {
        let chunk = &function.chunk;
        let mut rendered = String::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            offset = chunk.disassemble_instruction(&mut rendered, offset, &heap);
        }
        assert_eq!(offset, chunk.code.len(), "walk overshot the chunk");
        assert!(!rendered.is_empty());

        for value in &chunk.constants {
            if let Some(r) = value.as_obj() {
                if let moss::object::Obj::Function(inner) = heap.get(r) {
                    pending.push(inner);
                }
            }
        }
    }
}

#[test]
fn disassembly_marks_repeated_lines() {
    let (function, heap) = compile_ok("print 1 + 2;");
    let text = function.chunk.disassemble("test", &heap);
    assert!(text.starts_with("== test ==\n"));
    // several instructions come from line 1; all but the first show `|`
    assert!(text.contains('|'), "no line-repeat marker in:\n{text}");
}

#[test]
fn recompiling_the_same_source_yields_identical_bytecode() {
    let mut heap = Heap::new();
    let first = compile(SAMPLE, &mut heap, false).expect("first compile");
    let second = compile(SAMPLE, &mut heap, false).expect("second compile");
    assert_eq!(first.chunk.code, second.chunk.code);
    assert_eq!(first.chunk.lines, second.chunk.lines);
    assert_eq!(first.chunk.constants.len(), second.chunk.constants.len());
}

#[test]
fn string_literals_are_interned_across_compiles() {
    let mut heap = Heap::new();
    let first = compile("var x = \"shared\";", &mut heap, false).expect("first");
    let second = compile("var y = \"shared\";", &mut heap, false).expect("second");
    let find = |f: &Function| {
        f.chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|&r| matches!(heap.get(r), moss::object::Obj::String(s) if s.text.as_ref() == "shared"))
            .expect("literal missing from pool")
    };
    assert_eq!(find(&first), find(&second));
}

// === Diagnostics ===

fn compile_err(source: &str) -> usize {
    let mut heap = Heap::new();
    compile(source, &mut heap, false).expect_err("expected a compile error").errors
}

#[test]
fn missing_semicolon_is_reported() {
    assert!(compile_err("print 1") >= 1);
}

#[test]
fn missing_expression_is_reported() {
    assert!(compile_err("var x = ;") >= 1);
}

#[test]
fn invalid_assignment_targets_are_reported() {
    assert!(compile_err("var a = 1; var b = 1; a + b = 2;") >= 1);
    assert!(compile_err("var a = 1; !a = 2;") >= 1);
}

#[test]
fn recovery_reaches_later_statements() {
    // one error per statement; synchronisation keeps them independent
    assert_eq!(compile_err("var = 1; var = 2; var = 3;"), 3);
}

#[test]
fn class_misuse_is_reported() {
    assert!(compile_err("print this;") >= 1);
    assert!(compile_err("print super.x;") >= 1);
    assert!(compile_err("class A { m() { super.m(); } }") >= 1);
    assert!(compile_err("class A < A {}") >= 1);
}

#[test]
fn return_misuse_is_reported() {
    assert!(compile_err("return;") >= 1);
    assert!(compile_err("class A { init() { return 1; } }") >= 1);
}

#[test]
fn scope_misuse_is_reported() {
    assert!(compile_err("{ var a = 1; var a = 2; }") >= 1);
    assert!(compile_err("{ var a = a; }") >= 1);
}

#[test]
fn too_many_constants_in_one_chunk_is_reported() {
    // each literal statement burns one number constant and each global name
    // another, so 300 statements comfortably exceed the 256-slot pool
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("var v{i} = {i};\n"));
    }
    assert!(compile_err(&source) >= 1);
}

#[test]
fn valid_programs_do_not_regress_under_repeated_compiles() {
    let mut heap = Heap::new();
    for _ in 0..3 {
        assert!(compile(SAMPLE, &mut heap, false).is_ok());
    }
}
