// File: src/compiler.rs
//
// Single-pass bytecode compiler for Moss.
// A Pratt parser drives the scanner directly: each grammar rule emits
// bytecode into the function under construction as it parses, so there is
// no AST. Function and method declarations push a fresh per-function
// compiler onto a stack; name resolution walks that stack outward to turn
// captured variables into upvalues.

use crate::bytecode::{Chunk, OpCode};
use crate::errors::{CompileError, CompileErrorKind};
use crate::heap::Heap;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{Function, Obj, ObjRef};
use crate::value::Value;

/// Locals and upvalues are addressed by a one-byte slot.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles `source` into the top-level script function. Diagnostics go to
/// stderr as they are found; the returned error only summarises how many.
/// With `dump` set, each finished function's chunk is disassembled to
/// stderr.
pub fn compile(source: &str, heap: &mut Heap, dump: bool) -> Result<Function, CompileError> {
    let mut parser = Parser::new(source, heap, dump);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        Err(CompileError { errors: parser.error_count })
    } else {
        Ok(function)
    }
}

/// Binding tightness, weakest first. `parse_precedence(p)` consumes
/// everything that binds at least as tightly as `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// One level tighter; used by left-associative infix rules.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'a> = for<'b> fn(&'b mut Parser<'a>, bool);

/// Pratt table row: how a token behaves in prefix and infix position.
struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

/// The Pratt table. Tokens absent from the expression grammar get an empty
/// row with precedence None.
fn rule<'a>(kind: TokenKind) -> ParseRule<'a> {
    let (prefix, infix, precedence): (Option<ParseFn<'a>>, Option<ParseFn<'a>>, Precedence) =
        match kind {
            TokenKind::LeftParen => {
                (Some(Parser::grouping), Some(Parser::call), Precedence::Call)
            }
            TokenKind::Dot => (None, Some(Parser::dot), Precedence::Call),
            TokenKind::Minus => (Some(Parser::unary), Some(Parser::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Parser::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => (None, Some(Parser::binary), Precedence::Factor),
            TokenKind::Bang => (Some(Parser::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                (None, Some(Parser::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => (None, Some(Parser::binary), Precedence::Comparison),
            TokenKind::Identifier => (Some(Parser::variable), None, Precedence::None),
            TokenKind::String => (Some(Parser::string), None, Precedence::None),
            TokenKind::Number => (Some(Parser::number), None, Precedence::None),
            TokenKind::And => (None, Some(Parser::and_op), Precedence::And),
            TokenKind::Or => (None, Some(Parser::or_op), Precedence::Or),
            TokenKind::False | TokenKind::True | TokenKind::Nil => {
                (Some(Parser::literal), None, Precedence::None)
            }
            TokenKind::Super => (Some(Parser::super_expr), None, Precedence::None),
            TokenKind::This => (Some(Parser::this_expr), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
    ParseRule { prefix, infix, precedence }
}

/// One declared local: where its name lives in the source, how deep its
/// scope is (-1 while the initializer is still running), and whether some
/// inner function captured it.
struct Local<'a> {
    name: &'a str,
    depth: i32,
    is_captured: bool,
}

/// Compile-time record of one captured variable, mirrored byte for byte by
/// the capture operands the VM reads after OpCode::Closure.
#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Per-function compile state. Function declarations nest, so these live on
/// a stack with the innermost function last.
struct FnCompiler<'a> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
}

impl<'a> FnCompiler<'a> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot zero belongs to the callee: it names `this` inside methods
        // and is unnameable everywhere else.
        let receiver = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            function: Function::new(name),
            kind,
            locals: vec![Local { name: receiver, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Tracks `class` nesting so `this` and `super` can be validated.
struct ClassState {
    has_superclass: bool,
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    source: &'a str,
    heap: &'a mut Heap,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    error_count: usize,
    compilers: Vec<FnCompiler<'a>>,
    classes: Vec<ClassState>,
    dump: bool,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, heap: &'a mut Heap, dump: bool) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, start: 0, length: 0, line: 1 };
        Self {
            lexer: Lexer::new(source),
            source,
            heap,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            error_count: 0,
            compilers: vec![FnCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            dump,
        }
    }

    // === Token cursor ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            match self.current.kind {
                TokenKind::Error(message) => self.error_at_current(message),
                _ => break,
            }
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Diagnostics ===

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.error_count += 1;

        let mut report = format!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => report.push_str(" at end"),
            TokenKind::Error(_) => {}
            _ => report.push_str(&format!(" at '{}'", token.lexeme(self.source))),
        }
        eprintln!("{report}: {message}");
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_kind(&mut self, kind: CompileErrorKind) {
        self.error(kind.message());
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skips forward to a statement boundary so one mistake doesn't cascade.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // === Emission ===

    fn compiler(&self) -> &FnCompiler<'a> {
        self.compilers.last().unwrap()
    }

    fn compiler_mut(&mut self) -> &mut FnCompiler<'a> {
        self.compilers.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler_mut().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        // An initializer implicitly returns `this`, which lives in slot 0.
        if self.compiler().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error_kind(CompileErrorKind::TooManyConstants);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    /// Emits a forward jump with a placeholder offset and returns the
    /// position to patch once the target is known.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error_kind(CompileErrorKind::JumpTooLarge);
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error_kind(CompileErrorKind::LoopTooLarge);
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Seals the innermost function and pops its compiler, returning the
    /// finished function together with its capture list (which the caller
    /// encodes after OpCode::Closure).
    fn end_compiler(&mut self) -> (Function, Vec<UpvalueSlot>) {
        self.emit_return();
        let compiler = self.compilers.pop().unwrap();
        if self.dump && !self.had_error {
            let name = match compiler.function.name {
                Some(name) => self.heap.string(name).text.to_string(),
                None => "<script>".to_string(),
            };
            eprint!("{}", compiler.function.chunk.disassemble(&name, self.heap));
        }
        (compiler.function, compiler.upvalues)
    }

    // === Scope handling ===

    fn begin_scope(&mut self) {
        self.compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler_mut().scope_depth -= 1;
        loop {
            let compiler = self.compiler();
            let Some(local) = compiler.locals.last() else { break };
            if local.depth <= compiler.scope_depth {
                break;
            }
            // Captured locals move to the heap as their slot disappears.
            let op = if local.is_captured { OpCode::CloseUpvalue } else { OpCode::Pop };
            self.emit_op(op);
            self.compiler_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'a str) {
        if self.compiler().locals.len() == MAX_LOCALS {
            self.error_kind(CompileErrorKind::TooManyLocals);
            return;
        }
        self.compiler_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme(self.source);
        let compiler = self.compiler();
        let mut duplicate = false;
        for local in compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < compiler.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error_kind(CompileErrorKind::DuplicateLocal);
        }
        self.add_local(name);
    }

    /// Parses a variable name. Locals are declared in place and addressed by
    /// slot; globals go through a name constant, whose index is returned.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme(self.source);
        self.identifier_constant(name)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    fn mark_initialized(&mut self) {
        let compiler = self.compiler_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        if let Some(local) = compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    // === Name resolution ===

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (slot, local) in self.compilers[level].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(slot as u8);
                break;
            }
        }
        if uninitialized {
            self.error_kind(CompileErrorKind::ReadLocalInOwnInitializer);
        }
        found
    }

    /// Looks the name up in enclosing functions, threading an upvalue chain
    /// down to `level`. First-encounter order here must match the VM's
    /// capture order at OpCode::Closure.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(level - 1, name) {
            self.compilers[level - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(level, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return self.add_upvalue(level, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> Option<u8> {
        let slot = UpvalueSlot { index, is_local };
        let compiler = &mut self.compilers[level];
        if let Some(existing) = compiler.upvalues.iter().position(|&u| u == slot) {
            return Some(existing as u8);
        }
        if compiler.upvalues.len() == MAX_UPVALUES {
            self.error_kind(CompileErrorKind::TooManyUpvalues);
            return None;
        }
        compiler.upvalues.push(slot);
        compiler.function.upvalue_count = compiler.upvalues.len() as u16;
        Some((compiler.upvalues.len() - 1) as u8)
    }

    /// Emits the load or store for a name: local slot, upvalue slot, or
    /// global by name constant, in that resolution order.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let innermost = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(innermost, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(innermost, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // === Declarations ===

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // The name is usable inside the body so the function can recurse.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a function body (the name was just consumed) and emits the
    /// OpCode::Closure that materialises it, followed by one capture operand
    /// pair per upvalue.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme(self.source));
        self.compilers.push(FnCompiler::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler().function.arity == u8::MAX {
                    self.error_at_current(CompileErrorKind::TooManyParameters.message());
                } else {
                    self.compiler_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let handle = self.heap.alloc(Obj::Function(function));
        let constant = self.make_constant(Value::Obj(handle));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_lexeme = class_name.lexeme(self.source);
        let name_constant = self.identifier_constant(name_lexeme);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass = self.previous.lexeme(self.source);
            self.named_variable(superclass, false);
            if name_lexeme == superclass {
                self.error_kind(CompileErrorKind::InheritFromSelf);
            }

            // `super` is an ordinary local in a scope wrapping the methods,
            // so method closures capture it like any other variable.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(name_lexeme, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().is_some_and(|c| c.has_superclass) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme(self.source);
        let constant = self.identifier_constant(name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    // === Statements ===

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` desugars to initializer + while + increment. The body jumps
    /// over the increment on first entry; every loop-back runs the increment
    /// before re-testing the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler().kind == FunctionKind::Script {
            self.error_kind(CompileErrorKind::ReturnAtTopLevel);
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler().kind == FunctionKind::Initializer {
                self.error_kind(CompileErrorKind::ReturnValueFromInit);
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // An `=` nobody consumed means the left side wasn't assignable.
        if can_assign && self.matches(TokenKind::Equal) {
            self.error_kind(CompileErrorKind::InvalidAssignmentTarget);
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme(self.source).parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme(self.source);
        let handle = self.heap.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme(self.source);
        self.named_variable(name, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// Short-circuit `and`: on a falsey left side, skip the right side and
    /// leave the left value as the result.
    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// Short-circuit `or`: a truthy left side is the result; otherwise the
    /// right side is.
    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme(self.source));

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenKind::LeftParen) {
            // Fused property access + call: no bound method materialises.
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error_kind(CompileErrorKind::ThisOutsideClass);
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error_kind(CompileErrorKind::SuperOutsideClass);
        } else if !self.classes.last().is_some_and(|c| c.has_superclass) {
            self.error_kind(CompileErrorKind::SuperWithoutSuperclass);
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme(self.source));

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error_kind(CompileErrorKind::TooManyArguments);
                } else {
                    argc += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Function, Heap) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap, false).expect("compile failed");
        (function, heap)
    }

    #[test]
    fn arithmetic_emits_in_precedence_order() {
        let (function, _) = compile_ok("1 + 2 * 3;");
        let code = &function.chunk.code;
        // constants 1, 2, 3, then Multiply before Add
        let mul = code.iter().position(|&b| b == OpCode::Multiply as u8).unwrap();
        let add = code.iter().position(|&b| b == OpCode::Add as u8).unwrap();
        assert!(mul < add);
    }

    #[test]
    fn script_ends_with_implicit_nil_return() {
        let (function, _) = compile_ok("var a = 1;");
        let code = &function.chunk.code;
        assert_eq!(code[code.len() - 2], OpCode::Nil as u8);
        assert_eq!(code[code.len() - 1], OpCode::Return as u8);
    }

    #[test]
    fn closure_operands_match_recorded_captures() {
        let source = "fun outer(x) { fun inner() { return x; } return inner; }";
        let (function, heap) = compile_ok(source);
        // find the Closure op for `outer` in the script chunk
        let code = &function.chunk.code;
        let pos = code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        let outer = heap.function(function.chunk.constants[code[pos + 1] as usize].as_obj().unwrap());
        assert_eq!(outer.arity, 1);
        assert_eq!(outer.upvalue_count, 0);

        // inside `outer`, the Closure for `inner` carries one local capture
        let inner_code = &outer.chunk.code;
        let inner_pos = inner_code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        let inner =
            heap.function(outer.chunk.constants[inner_code[inner_pos + 1] as usize].as_obj().unwrap());
        assert_eq!(inner.upvalue_count, 1);
        assert_eq!(inner_code[inner_pos + 2], 1); // is_local
        assert_eq!(inner_code[inner_pos + 3], 1); // slot of `x`
    }

    #[test]
    fn upvalues_are_deduplicated() {
        let source = "fun f(x) { fun g() { return x + x; } }";
        let (function, heap) = compile_ok(source);
        let code = &function.chunk.code;
        let pos = code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        let outer = heap.function(function.chunk.constants[code[pos + 1] as usize].as_obj().unwrap());
        let inner_code = &outer.chunk.code;
        let inner_pos = inner_code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        let inner =
            heap.function(outer.chunk.constants[inner_code[inner_pos + 1] as usize].as_obj().unwrap());
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn compile_errors_are_counted() {
        let mut heap = Heap::new();
        let err = compile("var x = ;", &mut heap, false).unwrap_err();
        assert!(err.errors >= 1);
    }

    #[test]
    fn error_recovery_reports_multiple_statements() {
        let mut heap = Heap::new();
        let err = compile("var = 1; var = 2;", &mut heap, false).unwrap_err();
        assert_eq!(err.errors, 2);
    }

    #[test]
    fn duplicate_local_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile("{ var a = 1; var a = 2; }", &mut heap, false).is_err());
    }

    #[test]
    fn local_cannot_read_itself_while_initializing() {
        let mut heap = Heap::new();
        assert!(compile("{ var a = a; }", &mut heap, false).is_err());
    }

    #[test]
    fn return_outside_function_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile("return 1;", &mut heap, false).is_err());
    }

    #[test]
    fn this_outside_class_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile("print this;", &mut heap, false).is_err());
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        assert!(compile("class A < A {}", &mut heap, false).is_err());
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile("var a = 1; var b = 2; a + b = 3;", &mut heap, false).is_err());
    }
}
