// File: src/compiler.rs
//
// Single-pass Pratt parser that drives the scanner directly and emits
// bytecode as it goes — no separate AST. Scope resolution, upvalue
// capture, jump patching, and panic-mode recovery all happen inline
// during the one pass, per spec §4.4.

use crate::chunk::{Chunk, OpCode};
use crate::gc::{Heap, RootSource};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{ObjFunction, ObjHandle, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'a> = fn(&mut Parser<'a>, bool);

#[derive(Clone, Copy)]
struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

fn rule<'a>(prefix: Option<ParseFn<'a>>, infix: Option<ParseFn<'a>>, precedence: Precedence) -> ParseRule<'a> {
    ParseRule { prefix, infix, precedence }
}

fn get_rule<'a>(kind: TokenKind) -> ParseRule<'a> {
    use TokenKind::*;
    match kind {
        LeftParen => rule(Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        Dot => rule(None, Some(Parser::dot), Precedence::Call),
        Minus => rule(Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => rule(None, Some(Parser::binary), Precedence::Term),
        Slash => rule(None, Some(Parser::binary), Precedence::Factor),
        Star => rule(None, Some(Parser::binary), Precedence::Factor),
        Percent => rule(None, Some(Parser::binary), Precedence::Factor),
        Bang => rule(Some(Parser::unary), None, Precedence::None),
        BangEqual => rule(None, Some(Parser::binary), Precedence::Equality),
        EqualEqual => rule(None, Some(Parser::binary), Precedence::Equality),
        Greater => rule(None, Some(Parser::binary), Precedence::Comparison),
        GreaterEqual => rule(None, Some(Parser::binary), Precedence::Comparison),
        Less => rule(None, Some(Parser::binary), Precedence::Comparison),
        LessEqual => rule(None, Some(Parser::binary), Precedence::Comparison),
        Identifier => rule(Some(Parser::variable), None, Precedence::None),
        String => rule(Some(Parser::string), None, Precedence::None),
        Number => rule(Some(Parser::number), None, Precedence::None),
        And => rule(None, Some(Parser::and), Precedence::And),
        Or => rule(None, Some(Parser::or), Precedence::Or),
        Question => rule(None, Some(Parser::ternary), Precedence::Ternary),
        False => rule(Some(Parser::literal), None, Precedence::None),
        True => rule(Some(Parser::literal), None, Precedence::None),
        Nil => rule(Some(Parser::literal), None, Precedence::None),
        This => rule(Some(Parser::this), None, Precedence::None),
        Super => rule(Some(Parser::super_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// -1 means "declared, not yet initialized" — guards self-reference
    /// inside its own initializer.
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    loop_start: usize,
    break_jumps: Vec<usize>,
    /// Scope depth the loop body started at. `break`/`continue` must pop
    /// any locals declared deeper than this before jumping, or repeated
    /// iterations leave stale values on the stack and misalign every
    /// local slot index compiled after the loop.
    scope_depth: i32,
}

struct ClassCtx {
    has_superclass: bool,
}

/// One nested function's compilation state. `FunctionCompiler`s form a
/// stack (innermost last) inside `Parser`; `resolve_upvalue` walks it.
struct FunctionCompiler {
    function: ObjFunction,
    function_name: Option<String>,
    kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind) -> Self {
        let function = ObjFunction::new();
        let reserved_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this".to_string()
        } else {
            String::new()
        };
        FunctionCompiler {
            function,
            function_name: None,
            kind,
            // Slot 0 is reserved per spec: "this" for methods, empty (unreferenceable) otherwise.
            locals: vec![Local { name: reserved_name, depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    previous: Token<'a>,
    current: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    heap: &'a mut Heap,
    stack: Vec<FunctionCompiler>,
    classes: Vec<ClassCtx>,
    /// Upvalue descriptors of the most recently finished nested function,
    /// stashed here because `end_compiler` only returns a handle and
    /// `function()` needs them afterward to emit the trailing operand
    /// pairs for `OP_CLOSURE`.
    last_function_upvalues: Vec<(bool, u8)>,
}

/// Publishes every in-progress function's constant pool as GC roots, per
/// the requirement that objects created mid-compile must not be
/// collected before `end_compiler` finalizes them. Built from a borrow of
/// `Parser::stack` alone (never the whole `Parser`) so it can be
/// constructed while `Parser::heap` is simultaneously borrowed mutably.
struct CompilerRoots<'b> {
    stack: &'b [FunctionCompiler],
}

impl<'b> RootSource for CompilerRoots<'b> {
    fn mark_roots(&self, heap: &mut Heap) {
        for compiler in self.stack {
            for constant in &compiler.function.chunk.constants {
                heap.mark_value(*constant);
            }
        }
    }
}

pub fn compile(source: &str, heap: &mut Heap) -> Option<ObjHandle> {
    let mut scanner = Scanner::new(source);
    let first = scanner.scan_token();
    let mut parser = Parser {
        scanner,
        previous: first,
        current: first,
        had_error: false,
        panic_mode: false,
        heap,
        stack: vec![FunctionCompiler::new(FunctionKind::Script)],
        classes: Vec::new(),
        last_function_upvalues: Vec::new(),
    };

    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }
    parser.consume(TokenKind::Eof, "Expect end of expression.");

    let function = parser.end_compiler();
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'a> Parser<'a> {
    fn current_fn(&mut self) -> &mut FunctionCompiler {
        self.stack.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn().function.chunk
    }

    // --- Token stream --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'a>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let mut text = format!("[line {}] Error", token.line);
        if token.kind == TokenKind::Eof {
            text.push_str(" at end");
        } else if token.kind != TokenKind::Error {
            text.push_str(&format!(" at '{}'", token.lexeme));
        }
        text.push_str(&format!(": {}", message));
        eprintln!("{}", text);
    }

    /// Skips tokens until a likely statement boundary, so one source file
    /// can report every distinct compile error in a single pass.
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
                _ => {}
            }
            self.advance();
        }
    }

    // --- Bytecode emission ----------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: u8) {
        self.emit_op(a);
        self.emit_byte(b);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        self.chunk().write_constant(value, line);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk().add_constant(value);
        if index > 255 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let roots = CompilerRoots { stack: &self.stack };
        let handle = self.heap.intern_string(name, &roots);
        self.make_constant(Value::Obj(handle))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().count() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().count() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().count() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // --- Scope / locals ---------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.current_fn().scope_depth - 1;
        self.current_fn().scope_depth = depth;

        while let Some(local) = self.current_fn().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            self.current_fn().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn declare_variable(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_string();
        let depth = self.current_fn().scope_depth;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.current_fn().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let f = self.current_fn();
        if f.scope_depth == 0 {
            return;
        }
        let depth = f.scope_depth;
        if let Some(local) = f.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<u8> {
        for (i, local) in self.stack[frame].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<u8> {
        if frame == 0 {
            return None;
        }
        if let Some(local_index) = self.resolve_local(frame - 1, name) {
            self.stack[frame - 1].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(frame, local_index, true));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(frame - 1, name) {
            return Some(self.add_upvalue(frame, upvalue_index, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> u8 {
        let compiler = &mut self.stack[frame];
        for (i, up) in compiler.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if compiler.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        compiler.upvalues.push(UpvalueDesc { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        (compiler.upvalues.len() - 1) as u8
    }

    // --- Declarations / statements ---------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if self.previous.lexeme == class_name {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable_by_name(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable_by_name(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class itself, left by named_variable above

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(&name);

        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, Some(name));
        self.emit_ops(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme.to_string();
        self.function(FunctionKind::Function, Some(name));
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: Option<String>) {
        let mut compiler = FunctionCompiler::new(kind);
        compiler.function_name = name;
        self.stack.push(compiler);

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                {
                    let f = self.current_fn();
                    f.function.arity += 1;
                    if f.function.arity > 255 {
                        self.error_at_current("Can't have more than 255 parameters.");
                    }
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let handle = self.end_compiler();
        let index = self.make_constant(Value::Obj(handle));
        self.emit_op(OpCode::Closure);
        self.emit_byte(index);

        // One (is_local, index) pair per upvalue the nested function
        // captured, so the VM's OP_CLOSURE handler knows how to build
        // each one — from an enclosing local or from an enclosing upvalue.
        let descs: Vec<(bool, u8)> = self.last_function_upvalues.drain(..).collect();
        for (is_local, index) in descs {
            self.emit_byte(if is_local { 1 } else { 0 });
            self.emit_byte(index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        self.if_body();
    }

    /// Shared by `if` and `elif`: both open a condition-guarded block and
    /// may chain into a following `elif`/`else`.
    fn if_body(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Elif) {
            self.consume(TokenKind::LeftParen, "Expect '(' after 'elif'.");
            self.expression();
            self.consume(TokenKind::RightParen, "Expect ')' after condition.");
            self.if_body();
        } else if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().count();
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let loop_ctx = self.current_fn().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().count();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().count();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        let loop_ctx = self.current_fn().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }

        self.end_scope();
    }

    /// Emits a pop (or close-upvalue) for every local declared deeper than
    /// `target_depth`, without removing them from the compiler's local
    /// list — the enclosing block's own `end_scope` still owns that
    /// bookkeeping once control falls through normally.
    fn pop_locals_above(&mut self, target_depth: i32) {
        let f = self.current_fn();
        let closures: Vec<bool> = f
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > target_depth)
            .map(|l| l.is_captured)
            .collect();
        for captured in closures {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let scope_depth = self.current_fn().loops.last().unwrap().scope_depth;
        self.pop_locals_above(scope_depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.current_fn().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let scope_depth = self.current_fn().loops.last().unwrap().scope_depth;
        self.pop_locals_above(scope_depth);
        let loop_start = self.current_fn().loops.last().unwrap().loop_start;
        self.emit_loop(loop_start);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    /// Finishes the innermost in-progress function and allocates its
    /// `ObjFunction`. The compiler being finished is popped only after
    /// the allocation, so its own constant pool is still reachable
    /// through `CompilerRoots` if the allocation itself triggers a
    /// collection.
    fn end_compiler(&mut self) -> ObjHandle {
        self.emit_return();

        if let Some(name) = self.current_fn().function_name.clone() {
            let roots = CompilerRoots { stack: &self.stack };
            let handle = self.heap.intern_string(&name, &roots);
            self.current_fn().function.name = Some(handle);
        }

        let function = self.current_fn().function.clone();
        let roots = CompilerRoots { stack: &self.stack };
        let handle = self.heap.new_function(function, &roots);

        let compiler = self.stack.pop().unwrap();
        self.last_function_upvalues =
            compiler.upvalues.iter().map(|u| (u.is_local, u.index)).collect();
        handle
    }

    // --- Expressions -------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, min: Precedence) {
        self.advance();
        let prefix_rule = get_rule(self.previous.kind).prefix;
        let prefix_rule = match prefix_rule {
            Some(r) => r,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = min <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while get_rule(self.current.kind).precedence >= min {
            self.advance();
            let infix_rule = get_rule(self.previous.kind).infix.unwrap();
            infix_rule(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let text = raw[1..raw.len() - 1].to_string();
        let roots = CompilerRoots { stack: &self.stack };
        let handle = self.heap.intern_string(&text, &roots);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = get_rule(op_kind);
        self.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(else_jump);
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_ops(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_constant);
            self.emit_byte(argc);
        } else {
            self.emit_ops(OpCode::GetProperty, name_constant);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&method);

        self.named_variable_by_name("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable_by_name("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_constant);
            self.emit_byte(argc);
        } else {
            self.named_variable_by_name("super", false);
            self.emit_ops(OpCode::GetSuper, name_constant);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable_by_name(&name, can_assign);
    }

    fn named_variable_by_name(&mut self, name: &str, can_assign: bool) {
        let frame = self.stack.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(frame, name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(frame, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }
}
