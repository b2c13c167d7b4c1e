// File: src/debug.rs
//
// Bytecode disassembler, used only behind the `trace_execution` feature
// to print each instruction as the VM executes it. Mirrors the original
// `debug.c` layout: offset, source line (or `|` when it repeats the
// previous line), mnemonic, operands.

use crate::chunk::{Chunk, OpCode};

#[cfg_attr(not(feature = "trace_execution"), allow(dead_code))]
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.count() {
        offset = disassemble_instruction(chunk, offset);
    }
}

#[cfg_attr(not(feature = "trace_execution"), allow(dead_code))]
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    let line = chunk.line_of(offset);
    if offset > 0 && line == chunk.line_of(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", line);
    }

    let instruction = OpCode::from_byte(chunk.code[offset]);
    match instruction {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::ConstantLong => long_constant_instruction("OP_CONSTANT_LONG", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::Dup => simple_instruction("OP_DUP", offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Modulo => simple_instruction("OP_MODULO", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::JumpIfTrue => jump_instruction("OP_JUMP_IF_TRUE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:-16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8 | chunk.code[offset + 2] as u16) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{:-16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    println!("{:-16} {:4} '{}'", name, index, chunk.constants[index]);
    offset + 2
}

fn long_constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = ((chunk.code[offset + 1] as usize) << 16)
        | ((chunk.code[offset + 2] as usize) << 8)
        | chunk.code[offset + 3] as usize;
    println!("{:-16} {:4} '{}'", name, index, chunk.constants[index]);
    offset + 4
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    println!("{:-16} ({} args) {:4} '{}'", name, argc, index, chunk.constants[index]);
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    println!("{:-16} {:4} '{}'", "OP_CLOSURE", index, chunk.constants[index]);
    offset + 2
}
