pub mod chunk;
pub mod error;
pub mod heap;
pub mod table;

use chunk::value::{Obj, ObjFunction, Value};
use chunk::{Chunk, OpCode};
use error::CompileError;
use heap::{GcRef, Heap};
use lexer::token::{Token, TokenType};
use lexer::Scanner;
use std::rc::Rc;

const MAX_LOCALS: usize = u8::MAX as usize + 1;
const MAX_UPVALUES: usize = u8::MAX as usize + 1;
const MAX_ARGS: usize = 255;

/// Binding powers, lowest to highest. `parse_precedence` keeps consuming
/// infix operators as long as their own precedence is at least this one.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,
    And,
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
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

    fn of(typ: TokenType) -> Precedence {
        use TokenType::*;
        match typ {
            Or => Precedence::Or,
            And => Precedence::And,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            Plus | Minus => Precedence::Term,
            Star | Slash => Precedence::Factor,
            LeftParen | Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: Token,
    /// `None` until the local's initializer has finished compiling. Lets
    /// `resolve_local` catch `var x = x;`.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Compile-time state for one function body, pushed when the compiler
/// enters a `fun`/method and popped when it closes the body. Slot 0 of
/// `locals` is always reserved: named `this` inside a method, unnamed (so
/// no user identifier can ever collide with it) everywhere else. It's where
/// the running VM places the called closure itself.
struct FunctionScope {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: usize,
}

impl FunctionScope {
    fn new(kind: FunctionKind, name: Option<GcRef>) -> Self {
        let mut scope = Self {
            function: ObjFunction::new(name),
            kind,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        let reserved = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        scope.locals.push(Local {
            name: Token::synthetic(TokenType::This, reserved, 0),
            depth: Some(0),
            is_captured: false,
        });
        scope
    }
}

struct ClassScope {
    has_superclass: bool,
}

/// Single-pass Pratt parser and code generator: there is no intermediate
/// AST. Each grammar production both consumes tokens and emits bytecode
/// into the innermost `FunctionScope`'s chunk as it goes.
struct Compiler<'h> {
    scanner: Scanner,
    heap: &'h mut Heap,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope>,
    class_scopes: Vec<ClassScope>,
}

/// Compiles `source` into a top-level script function. Every diagnosable
/// error is collected via panic-mode recovery rather than stopping at the
/// first one; `Err` carries the whole batch.
pub fn compile(source: &str, heap: &mut Heap) -> Result<GcRef, Vec<CompileError>> {
    let placeholder = Token::eof(Rc::from(""), 0);
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        heap,
        current: placeholder.clone(),
        previous: placeholder,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        scopes: vec![FunctionScope::new(FunctionKind::Script, None)],
        class_scopes: Vec::new(),
    };
    compiler.advance();
    while !compiler.match_token(TokenType::Eof) {
        compiler.declaration();
    }
    let scope = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(compiler.heap.alloc_object(Obj::Function(scope.function)))
    }
}

impl<'h> Compiler<'h> {
    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ() != TokenType::Error {
                break;
            }
            let token = self.current.clone();
            let message = token.lexeme().to_string();
            self.report(CompileError::UnexpectedToken { token, message });
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ() == typ
    }

    fn match_token(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.check(typ) {
            self.advance();
            return;
        }
        let token = self.current.clone();
        self.report(CompileError::UnexpectedToken {
            token,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: impl Into<String>) {
        let token = self.previous.clone();
        self.report(CompileError::UnexpectedToken {
            token,
            message: message.into(),
        });
    }

    /// First error after an unrecovered one is suppressed ("panic mode"):
    /// a single malformed token tends to cascade into dozens of bogus
    /// follow-on errors otherwise.
    fn report(&mut self, err: CompileError) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(err);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ() != TokenType::Eof {
            if self.previous.typ() == TokenType::Semicolon {
                return;
            }
            match self.current.typ() {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission -------------------------------------------------

    fn current_scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("script scope is never popped")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_scope().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line();
        self.current_chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line();
        self.current_chunk().write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.current_scope().kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                let token = self.previous.clone();
                self.report(CompileError::TooManyConstants(token));
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &Token) -> u8 {
        let s = self.heap.intern_string(name.lexeme());
        self.make_constant(Value::Object(s))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.previous.line();
        self.current_chunk().write_u16(0xffff, line);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        if self.current_chunk().patch_jump(operand_offset).is_err() {
            let token = self.previous.clone();
            self.report(CompileError::JumpTooLarge(token));
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            let token = self.previous.clone();
            self.report(CompileError::JumpTooLarge(token));
        }
        let line = self.previous.line();
        self.current_chunk().write_u16(offset as u16, line);
    }

    // ---- scopes, locals, upvalues -------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let scope = self.current_scope();
            scope.scope_depth -= 1;
            scope.scope_depth
        };
        loop {
            let should_pop = matches!(
                self.current_scope().locals.last(),
                Some(local) if local.depth.map_or(false, |d| d > depth)
            );
            if !should_pop {
                break;
            }
            let local = self.current_scope().locals.pop().expect("just checked last()");
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: Token) {
        if self.current_scope().locals.len() >= MAX_LOCALS {
            self.report(CompileError::TooManyLocals(name));
            return;
        }
        self.current_scope().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current_scope().scope_depth == 0 {
            return;
        }
        let name = self.previous.clone();
        let depth = self.current_scope().scope_depth;
        let mut duplicate = false;
        for local in self.current_scope().locals.iter().rev() {
            if let Some(d) = local.depth {
                if d < depth {
                    break;
                }
            }
            if local.name.lexeme() == name.lexeme() {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.report(CompileError::VariableAlreadyDeclared(name));
            return;
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_scope().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current_scope().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn resolve_local(&mut self, scope_index: usize, name: &Token) -> Option<u8> {
        let scope = &self.scopes[scope_index];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name.lexeme() == name.lexeme() {
                if local.depth.is_none() {
                    self.report(CompileError::ReadOwnInitializer(name.clone()));
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, scope_index: usize, name: &Token) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.scopes[scope_index];
        for (i, uv) in scope.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            let name = self.previous.clone();
            self.report(CompileError::TooManyUpvalues(name));
            return 0;
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        scope.function.upvalue_count = scope.upvalues.len();
        (scope.upvalues.len() - 1) as u8
    }

    // ---- expressions -------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.typ(), can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= Precedence::of(self.current.typ()) {
            self.advance();
            self.infix(self.previous.typ(), can_assign);
        }
        if can_assign && self.match_token(TokenType::Equal) {
            let token = self.previous.clone();
            self.report(CompileError::InvalidAssignmentTarget(token));
        }
    }

    fn prefix(&mut self, typ: TokenType, can_assign: bool) -> bool {
        use TokenType::*;
        match typ {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            Identifier => self.variable(can_assign),
            Nil | True | False => self.literal(),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, typ: TokenType, can_assign: bool) {
        use TokenType::*;
        match typ {
            Minus | Plus | Slash | Star | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and_expr(),
            Or => self.or_expr(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            _ => {}
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let lexeme = self.previous.lexeme().to_string();
        let value: f64 = lexeme
            .parse()
            .expect("scanner only emits well-formed numeric lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme();
        let contents = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.intern_string(contents);
        self.emit_constant(Value::Object(obj));
    }

    fn literal(&mut self) {
        match self.previous.typ() {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            TokenType::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal() only dispatched for false/nil/true"),
        }
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let scope_index = self.scopes.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(scope_index, &name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(scope_index, &name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(&name);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };
        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.clone();
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.class_scopes.is_empty() {
            let token = self.previous.clone();
            self.report(CompileError::ThisOutsideClass(token));
            return;
        }
        let name = self.previous.clone();
        self.named_variable(name, false);
    }

    fn super_expr(&mut self) {
        if self.class_scopes.is_empty() {
            let token = self.previous.clone();
            self.report(CompileError::SuperOutsideClass(token));
        } else if !self.class_scopes.last().expect("just checked non-empty").has_superclass {
            let token = self.previous.clone();
            self.report(CompileError::SuperWithoutSuperclass(token));
        }
        let line = self.previous.line();
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.previous.clone();
        let method_constant = self.identifier_constant(&name);

        self.named_variable(Token::synthetic(TokenType::This, "this", line), false);
        if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic(TokenType::Super, "super", line), false);
            self.emit_bytes(OpCode::SuperInvoke, method_constant);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic(TokenType::Super, "super", line), false);
            self.emit_bytes(OpCode::GetSuper, method_constant);
        }
    }

    fn unary(&mut self) {
        let op_type = self.previous.typ();
        self.parse_precedence(Precedence::Unary);
        match op_type {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only dispatched for -/!"),
        }
    }

    fn binary(&mut self) {
        let op_type = self.previous.typ();
        self.parse_precedence(Precedence::of(op_type).next());
        match op_type {
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() only dispatched for binary operators"),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    let token = self.previous.clone();
                    self.report(CompileError::TooManyArguments(token));
                } else {
                    count += 1;
                }
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous.clone();
        let name_constant = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name_constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty, name_constant);
        }
    }

    // ---- statements and declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class, name_constant);
        self.mark_or_define_global(name_constant);

        self.class_scopes.push(ClassScope {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let super_name = self.previous.clone();
            if super_name.lexeme() == class_name.lexeme() {
                self.report(CompileError::SelfInheritance(super_name.clone()));
            }
            self.variable(false);

            self.begin_scope();
            self.add_local(Token::synthetic(TokenType::Super, "super", super_name.line()));
            self.mark_initialized();

            self.named_variable(class_name.clone(), false);
            self.emit_op(OpCode::Inherit);
            self.class_scopes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(class_name.clone(), false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.class_scopes.last().expect("just pushed").has_superclass {
            self.end_scope();
        }
        self.class_scopes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous.clone();
        let name_constant = self.identifier_constant(&name);
        let kind = if name.lexeme() == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, Some(name));
        self.emit_bytes(OpCode::Method, name_constant);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect function name.");
        let name = self.previous.clone();
        self.declare_variable();
        self.mark_initialized();
        self.function(FunctionKind::Function, Some(name.clone()));
        if self.current_scope().scope_depth == 0 {
            let constant = self.identifier_constant(&name);
            self.emit_bytes(OpCode::DefineGlobal, constant);
        }
    }

    /// Shared tail of `class_declaration` and `var_declaration`: a global
    /// needs `OP_DEFINE_GLOBAL`; a local just needs its depth stamped in
    /// once its value is safely on the stack.
    fn mark_or_define_global(&mut self, name_constant: u8) {
        if self.current_scope().scope_depth == 0 {
            self.emit_bytes(OpCode::DefineGlobal, name_constant);
        } else {
            self.mark_initialized();
        }
    }

    fn function(&mut self, kind: FunctionKind, name_token: Option<Token>) {
        let name_ref = name_token.as_ref().map(|t| self.heap.intern_string(t.lexeme()));
        self.scopes.push(FunctionScope::new(kind, name_ref));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = self.current_scope().function.arity as usize;
                if arity >= MAX_ARGS {
                    let token = self.current.clone();
                    self.report(CompileError::TooManyParameters(token));
                } else {
                    self.current_scope().function.arity += 1;
                }
                self.consume(TokenType::Identifier, "Expect parameter name.");
                self.declare_variable();
                self.mark_initialized();
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let scope = self.end_function();
        let upvalues: Vec<UpvalueDesc> = scope.upvalues.clone();
        let function_ref = self.heap.alloc_object(Obj::Function(scope.function));
        let idx = self.make_constant(Value::Object(function_ref));
        self.emit_bytes(OpCode::Closure, idx);
        for uv in upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn end_function(&mut self) -> FunctionScope {
        self.emit_return();
        self.scopes.pop().expect("function() always pushes before calling this")
    }

    fn var_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect variable name.");
        let name = self.previous.clone();
        self.declare_variable();

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        if self.current_scope().scope_depth == 0 {
            let constant = self.identifier_constant(&name);
            self.emit_bytes(OpCode::DefineGlobal, constant);
        } else {
            self.mark_initialized();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
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
        if self.current_scope().kind == FunctionKind::Script {
            let token = self.previous.clone();
            self.report(CompileError::ReturnFromScript(token));
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_scope().kind == FunctionKind::Initializer {
                let token = self.previous.clone();
                self.report(CompileError::ReturnValueFromInitializer(token));
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk::OpCode;

    fn compiled_ops(source: &str) -> Vec<OpCode> {
        let mut heap = Heap::new();
        let function_ref = compile(source, &mut heap).unwrap_or_else(|errs| {
            panic!("unexpected compile errors: {:?}", errs.iter().map(|e| e.to_string()).collect::<Vec<_>>())
        });
        let function = function_ref.as_function().unwrap();
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < function.chunk.len() {
            let op = OpCode::from_u8(function.chunk.byte_at(offset));
            ops.push(op);
            offset += match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::GetProperty
                | OpCode::SetProperty
                | OpCode::GetSuper
                | OpCode::Call => 2,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 3,
                OpCode::Invoke | OpCode::SuperInvoke => 3,
                OpCode::Closure => {
                    let idx = function.chunk.byte_at(offset + 1);
                    let mut size = 2;
                    if let Value::Object(obj) = function.chunk.constant(idx) {
                        if let Some(f) = obj.as_function() {
                            size += f.upvalue_count() * 2;
                        }
                    }
                    size
                }
                _ => 1,
            };
        }
        ops
    }

    #[test]
    fn compiles_a_global_var_declaration() {
        let ops = compiled_ops("var x = 1;");
        assert_eq!(
            ops,
            vec![OpCode::Constant, OpCode::DefineGlobal, OpCode::Nil, OpCode::Return]
        );
    }

    #[test]
    fn compiles_an_if_else() {
        let ops = compiled_ops("if (true) { print 1; } else { print 2; }");
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::Jump));
        assert!(ops.contains(&OpCode::Print));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = a; }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn returning_from_top_level_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn a_class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        let result = compile("class A < A {}", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn panic_mode_collects_more_than_one_error() {
        let mut heap = Heap::new();
        let result = compile("var ; var ;", &mut heap);
        match result {
            Err(errors) => assert!(errors.len() >= 2),
            Ok(_) => panic!("expected compile errors"),
        }
    }
}
