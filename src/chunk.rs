// File: src/chunk.rs
//
// Bytecode buffer, constant pool, and source-line mapping for a single
// compiled function body. One `Chunk` belongs to exactly one
// `ObjFunction` for its whole lifetime.

use crate::value::Value;

/// One run of the line table: `line` repeated `run_len` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineRun {
    line: usize,
    run_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    ConstantLong,
    Nil,
    True,
    False,
    Pop,
    Dup,

    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,
    DefineGlobal,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,

    GetProperty,
    SetProperty,
    GetSuper,
    Invoke,
    SuperInvoke,

    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Not,
    Negate,

    Print,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,
    Call,
    Return,
    Class,
    Inherit,
    Method,
    Closure,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> OpCode {
        match byte {
            0 => OpCode::Constant,
            1 => OpCode::ConstantLong,
            2 => OpCode::Nil,
            3 => OpCode::True,
            4 => OpCode::False,
            5 => OpCode::Pop,
            6 => OpCode::Dup,
            7 => OpCode::GetLocal,
            8 => OpCode::SetLocal,
            9 => OpCode::GetGlobal,
            10 => OpCode::SetGlobal,
            11 => OpCode::DefineGlobal,
            12 => OpCode::GetUpvalue,
            13 => OpCode::SetUpvalue,
            14 => OpCode::CloseUpvalue,
            15 => OpCode::GetProperty,
            16 => OpCode::SetProperty,
            17 => OpCode::GetSuper,
            18 => OpCode::Invoke,
            19 => OpCode::SuperInvoke,
            20 => OpCode::Equal,
            21 => OpCode::Greater,
            22 => OpCode::Less,
            23 => OpCode::Add,
            24 => OpCode::Subtract,
            25 => OpCode::Multiply,
            26 => OpCode::Divide,
            27 => OpCode::Modulo,
            28 => OpCode::Not,
            29 => OpCode::Negate,
            30 => OpCode::Print,
            31 => OpCode::Jump,
            32 => OpCode::JumpIfFalse,
            33 => OpCode::JumpIfTrue,
            34 => OpCode::Loop,
            35 => OpCode::Call,
            36 => OpCode::Return,
            37 => OpCode::Class,
            38 => OpCode::Inherit,
            39 => OpCode::Method,
            40 => OpCode::Closure,
            other => panic!("invalid opcode byte {other}"),
        }
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            OpCode::Constant => 0,
            OpCode::ConstantLong => 1,
            OpCode::Nil => 2,
            OpCode::True => 3,
            OpCode::False => 4,
            OpCode::Pop => 5,
            OpCode::Dup => 6,
            OpCode::GetLocal => 7,
            OpCode::SetLocal => 8,
            OpCode::GetGlobal => 9,
            OpCode::SetGlobal => 10,
            OpCode::DefineGlobal => 11,
            OpCode::GetUpvalue => 12,
            OpCode::SetUpvalue => 13,
            OpCode::CloseUpvalue => 14,
            OpCode::GetProperty => 15,
            OpCode::SetProperty => 16,
            OpCode::GetSuper => 17,
            OpCode::Invoke => 18,
            OpCode::SuperInvoke => 19,
            OpCode::Equal => 20,
            OpCode::Greater => 21,
            OpCode::Less => 22,
            OpCode::Add => 23,
            OpCode::Subtract => 24,
            OpCode::Multiply => 25,
            OpCode::Divide => 26,
            OpCode::Modulo => 27,
            OpCode::Not => 28,
            OpCode::Negate => 29,
            OpCode::Print => 30,
            OpCode::Jump => 31,
            OpCode::JumpIfFalse => 32,
            OpCode::JumpIfTrue => 33,
            OpCode::Loop => 34,
            OpCode::Call => 35,
            OpCode::Return => 36,
            OpCode::Class => 37,
            OpCode::Inherit => 38,
            OpCode::Method => 39,
            OpCode::Closure => 40,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineRun>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        match self.lines.last_mut() {
            Some(run) if run.line == line => run.run_len += 1,
            _ => self.lines.push(LineRun { line, run_len: 1 }),
        }
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write_byte(op.to_byte(), line);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Emits `OP_CONSTANT index:u8` when the pool is small enough,
    /// otherwise `OP_CONSTANT_LONG index:u24` (big-endian).
    pub fn write_constant(&mut self, value: Value, line: usize) {
        let index = self.add_constant(value);
        if index < 256 {
            self.write_op(OpCode::Constant, line);
            self.write_byte(index as u8, line);
        } else {
            self.write_op(OpCode::ConstantLong, line);
            self.write_byte(((index >> 16) & 0xff) as u8, line);
            self.write_byte(((index >> 8) & 0xff) as u8, line);
            self.write_byte((index & 0xff) as u8, line);
        }
    }

    /// O(number of line runs); acceptable only on error paths, per spec.
    pub fn line_of(&self, offset: usize) -> usize {
        let mut cumulative = 0usize;
        for run in &self.lines {
            cumulative += run.run_len;
            if offset < cumulative {
                return run.line;
            }
        }
        self.lines.last().map(|r| r.line).unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.code.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_of_round_trips_every_offset() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Return, 2);
        chunk.write_op(OpCode::Return, 3);

        assert_eq!(chunk.line_of(0), 1);
        assert_eq!(chunk.line_of(1), 1);
        assert_eq!(chunk.line_of(2), 2);
        assert_eq!(chunk.line_of(3), 2);
        assert_eq!(chunk.line_of(4), 3);
    }

    #[test]
    fn write_constant_switches_to_long_form_past_256() {
        let mut chunk = Chunk::new();
        for i in 0..300 {
            chunk.write_constant(Value::Number(i as f64), 1);
        }
        assert_eq!(chunk.constants.len(), 300);
        // The 256th constant (index 255) still fits in the short form;
        // index 256 requires the long form. Walk the bytecode to find it.
        let mut ip = 0usize;
        let mut saw_long = false;
        while ip < chunk.code.len() {
            match OpCode::from_byte(chunk.code[ip]) {
                OpCode::Constant => ip += 2,
                OpCode::ConstantLong => {
                    saw_long = true;
                    ip += 4;
                }
                _ => unreachable!(),
            }
        }
        assert!(saw_long);
    }
}
