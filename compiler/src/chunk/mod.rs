pub mod value;

use std::fmt;
use value::Value;

/// The bytecode operations this VM executes. Each variant names the operand
/// shape the compiler must emit after the opcode byte; see
/// `Chunk::disassemble_instruction` for the exact byte layout of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl OpCode {
    /// Decodes a raw opcode byte. Only ever called by the VM/disassembler on
    /// bytes this compiler itself emitted, so an unrecognized byte is an
    /// internal-invariant violation, not a user-facing error.
    pub fn from_u8(byte: u8) -> Self {
        const TABLE: &[OpCode] = &[
            OpCode::Constant,
            OpCode::Nil,
            OpCode::True,
            OpCode::False,
            OpCode::Pop,
            OpCode::GetLocal,
            OpCode::SetLocal,
            OpCode::GetGlobal,
            OpCode::DefineGlobal,
            OpCode::SetGlobal,
            OpCode::GetUpvalue,
            OpCode::SetUpvalue,
            OpCode::GetProperty,
            OpCode::SetProperty,
            OpCode::GetSuper,
            OpCode::Equal,
            OpCode::Greater,
            OpCode::Less,
            OpCode::Add,
            OpCode::Subtract,
            OpCode::Multiply,
            OpCode::Divide,
            OpCode::Not,
            OpCode::Negate,
            OpCode::Print,
            OpCode::Jump,
            OpCode::JumpIfFalse,
            OpCode::Loop,
            OpCode::Call,
            OpCode::Invoke,
            OpCode::SuperInvoke,
            OpCode::Closure,
            OpCode::CloseUpvalue,
            OpCode::Return,
            OpCode::Class,
            OpCode::Inherit,
            OpCode::Method,
        ];
        TABLE[byte as usize]
    }
}

/// A packed sequence of opcodes plus a side-table of constants and, in
/// lockstep, the source line each instruction byte came from. `lines[i]` is
/// always the line for `code[i]`, including every operand byte of a
/// multi-byte instruction.
#[derive(Default)]
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn byte_at(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines[offset]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn constant(&self, idx: u8) -> Value {
        self.constants[idx as usize].clone()
    }

    pub fn write_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_u8(op as u8, line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        let [hi, lo] = value.to_be_bytes();
        self.write_u8(hi, line);
        self.write_u8(lo, line);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Patches the two-byte operand written by a prior `write_u16` (used for
    /// forward jumps whose target wasn't known yet) to the distance between
    /// the byte just after the operand and the current end of the chunk.
    pub fn patch_jump(&mut self, operand_offset: usize) -> Result<(), ()> {
        let jump = self.code.len() - (operand_offset + 2);
        if jump > u16::MAX as usize {
            return Err(());
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.code[operand_offset] = hi;
        self.code[operand_offset + 1] = lo;
        Ok(())
    }

    /// Adds a constant to the table, returning its index. `Err` if the
    /// chunk already holds 256 constants; the single-byte `CONSTANT`
    /// operand can't address more.
    pub fn add_constant(&mut self, value: Value) -> Result<u8, ()> {
        if self.constants.len() >= u8::MAX as usize + 1 {
            return Err(());
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }
}

impl fmt::Debug for Chunk {
    /// Disassembly. Purely diagnostic instrumentation; the textual form is
    /// only ever printed behind the `debug-bytecode` feature, so it never
    /// sits on the hot path otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(f, offset)?;
        }
        Ok(())
    }
}

impl Chunk {
    pub fn disassemble_instruction(
        &self,
        f: &mut fmt::Formatter<'_>,
        offset: usize,
    ) -> Result<usize, fmt::Error> {
        write!(f, "{:04} ", offset)?;
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            write!(f, "   | ")?;
        } else {
            write!(f, "{:4} ", self.lines[offset])?;
        }

        let op = OpCode::from_u8(self.code[offset]);
        macro_rules! simple {
            ($name:expr) => {{
                writeln!(f, "{}", $name)?;
                Ok(offset + 1)
            }};
        }
        macro_rules! byte_op {
            ($name:expr) => {{
                let slot = self.code[offset + 1];
                writeln!(f, "{:<16} {:4}", $name, slot)?;
                Ok(offset + 2)
            }};
        }
        macro_rules! const_op {
            ($name:expr) => {{
                let idx = self.code[offset + 1];
                writeln!(f, "{:<16} {:4} '{}'", $name, idx, self.constants[idx as usize])?;
                Ok(offset + 2)
            }};
        }
        macro_rules! jump_op {
            ($name:expr, $sign:expr) => {{
                let jump = self.read_u16(offset + 1);
                let target = if $sign > 0 {
                    offset + 3 + jump as usize
                } else {
                    offset + 3 - jump as usize
                };
                writeln!(f, "{:<16} {:4} -> {}", $name, offset, target)?;
                Ok(offset + 3)
            }};
        }

        match op {
            OpCode::Constant => const_op!("OP_CONSTANT"),
            OpCode::Nil => simple!("OP_NIL"),
            OpCode::True => simple!("OP_TRUE"),
            OpCode::False => simple!("OP_FALSE"),
            OpCode::Pop => simple!("OP_POP"),
            OpCode::GetLocal => byte_op!("OP_GET_LOCAL"),
            OpCode::SetLocal => byte_op!("OP_SET_LOCAL"),
            OpCode::GetGlobal => const_op!("OP_GET_GLOBAL"),
            OpCode::DefineGlobal => const_op!("OP_DEFINE_GLOBAL"),
            OpCode::SetGlobal => const_op!("OP_SET_GLOBAL"),
            OpCode::GetUpvalue => byte_op!("OP_GET_UPVALUE"),
            OpCode::SetUpvalue => byte_op!("OP_SET_UPVALUE"),
            OpCode::GetProperty => const_op!("OP_GET_PROPERTY"),
            OpCode::SetProperty => const_op!("OP_SET_PROPERTY"),
            OpCode::GetSuper => const_op!("OP_GET_SUPER"),
            OpCode::Equal => simple!("OP_EQUAL"),
            OpCode::Greater => simple!("OP_GREATER"),
            OpCode::Less => simple!("OP_LESS"),
            OpCode::Add => simple!("OP_ADD"),
            OpCode::Subtract => simple!("OP_SUBTRACT"),
            OpCode::Multiply => simple!("OP_MULTIPLY"),
            OpCode::Divide => simple!("OP_DIVIDE"),
            OpCode::Not => simple!("OP_NOT"),
            OpCode::Negate => simple!("OP_NEGATE"),
            OpCode::Print => simple!("OP_PRINT"),
            OpCode::Jump => jump_op!("OP_JUMP", 1),
            OpCode::JumpIfFalse => jump_op!("OP_JUMP_IF_FALSE", 1),
            OpCode::Loop => jump_op!("OP_LOOP", -1),
            OpCode::Call => byte_op!("OP_CALL"),
            OpCode::Invoke => {
                let idx = self.code[offset + 1];
                let argc = self.code[offset + 2];
                writeln!(
                    f,
                    "{:<16} ({} args) {:4} '{}'",
                    "OP_INVOKE", argc, idx, self.constants[idx as usize]
                )?;
                Ok(offset + 3)
            }
            OpCode::SuperInvoke => {
                let idx = self.code[offset + 1];
                let argc = self.code[offset + 2];
                writeln!(
                    f,
                    "{:<16} ({} args) {:4} '{}'",
                    "OP_SUPER_INVOKE", argc, idx, self.constants[idx as usize]
                )?;
                Ok(offset + 3)
            }
            OpCode::Closure => {
                let mut o = offset + 1;
                let idx = self.code[o];
                o += 1;
                writeln!(f, "{:<16} {:4} '{}'", "OP_CLOSURE", idx, self.constants[idx as usize])?;
                if let Value::Object(obj) = &self.constants[idx as usize] {
                    if let Some(function) = obj.as_function() {
                        for _ in 0..function.upvalue_count() {
                            let is_local = self.code[o];
                            let index = self.code[o + 1];
                            o += 2;
                            writeln!(
                                f,
                                "{:04}      |                     {} {}",
                                o - 2,
                                if is_local == 1 { "local" } else { "upvalue" },
                                index
                            )?;
                        }
                    }
                }
                Ok(o)
            }
            OpCode::CloseUpvalue => simple!("OP_CLOSE_UPVALUE"),
            OpCode::Return => simple!("OP_RETURN"),
            OpCode::Class => const_op!("OP_CLASS"),
            OpCode::Inherit => simple!("OP_INHERIT"),
            OpCode::Method => const_op!("OP_METHOD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_line_numbers_per_byte() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 2);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(1), 2);
    }

    #[test]
    fn jumps_land_on_an_opcode_boundary() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        let operand = chunk.len();
        chunk.write_u16(0xffff, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.patch_jump(operand).unwrap();
        let jump = chunk.read_u16(operand);
        let target = operand + 2 + jump as usize;
        assert_eq!(target, chunk.len());
        assert_eq!(OpCode::from_u8(chunk.byte_at(target)), OpCode::Nil);
    }

    #[test]
    fn constant_table_rejects_a_257th_entry() {
        let mut chunk = Chunk::new();
        for _ in 0..256 {
            chunk.add_constant(Value::Number(0.0)).unwrap();
        }
        assert!(chunk.add_constant(Value::Number(0.0)).is_err());
    }
}
