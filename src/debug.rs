use std::fmt::Write;

use crate::chunk::{Chunk, OpCode, Operands};
use crate::objects::object_manager::ObjectManager;

/// Render every instruction of `chunk` under a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, heap: &ObjectManager, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, heap, offset, &mut out);
    }
    out
}

/// Append one line for the instruction at `offset` and return the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    let line = chunk.token_at(offset).map_or(0, |token| token.line);
    let previous = offset.checked_sub(1).and_then(|prev| chunk.token_at(prev)).map(|token| token.line);
    if previous == Some(line) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", line);
    }

    let Some(byte) = chunk.read_from_offset(offset) else {
        out.push_str("<end>\n");
        return offset + 1;
    };
    let Some(op) = OpCode::from_byte(byte) else {
        let _ = writeln!(out, "Unknown opcode {}", byte);
        return offset + 1;
    };
    let name = op.to_string();
    let next = match op.operands() {
        Operands::None => simple_instruction(&name, offset, out),
        Operands::Byte => byte_instruction(&name, chunk, offset, out),
        Operands::Short => short_instruction(&name, chunk, offset, out),
        Operands::Constant => constant_instruction(&name, chunk, heap, offset, out),
        Operands::Jump => jump_instruction(&name, 1, chunk, offset, out),
        Operands::Loop => jump_instruction(&name, -1, chunk, offset, out),
        Operands::Invoke => invoke_instruction(&name, chunk, heap, offset, out),
        Operands::Class => class_instruction(&name, chunk, heap, offset, out),
        Operands::Import => import_instruction(&name, chunk, heap, offset, out),
        Operands::ConstantPair => pair_instruction(&name, chunk, heap, offset, out),
        Operands::ExportFrom => export_from_instruction(&name, chunk, heap, offset, out),
    };
    next.unwrap_or_else(|| {
        out.push_str(" <truncated>\n");
        chunk.len()
    })
}

fn constant_text(chunk: &Chunk, heap: &ObjectManager, index: u16) -> String {
    match chunk.get_constant(index as usize) {
        Some(value) => heap.display_value(value),
        None => "<bad constant>".to_string(),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> Option<usize> {
    let _ = writeln!(out, "{}", name);
    Some(offset + 1)
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let slot = chunk.read_from_offset(offset + 1)?;
    let _ = writeln!(out, " {:4}", slot);
    Some(offset + 2)
}

fn short_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let count = chunk.read_short_from_offset(offset + 1)?;
    let _ = writeln!(out, " {:4}", count);
    Some(offset + 3)
}

fn constant_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let index = chunk.read_short_from_offset(offset + 1)?;
    let _ = writeln!(out, " {:4} '{}'", index, constant_text(chunk, heap, index));
    Some(offset + 3)
}

fn jump_instruction(name: &str, sign: isize, chunk: &Chunk, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let jump = chunk.read_short_from_offset(offset + 1)? as isize;
    let target = offset as isize + 3 + sign * jump;
    let _ = writeln!(out, " {:4} -> {}", offset, target);
    Some(offset + 3)
}

fn invoke_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let index = chunk.read_short_from_offset(offset + 1)?;
    let argc = chunk.read_from_offset(offset + 3)?;
    let _ = writeln!(out, " ({} args) {:4} '{}'", argc, index, constant_text(chunk, heap, index));
    Some(offset + 4)
}

fn class_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let index = chunk.read_short_from_offset(offset + 1)?;
    let methods = chunk.read_short_from_offset(offset + 3)?;
    let _ = writeln!(out, " {:4} '{}' methods={}", index, constant_text(chunk, heap, index), methods);
    Some(offset + 5)
}

fn import_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let has_alias = chunk.read_from_offset(offset + 1)? != 0;
    let alias = chunk.read_short_from_offset(offset + 2)?;
    if has_alias {
        let _ = writeln!(out, " as '{}'", constant_text(chunk, heap, alias));
    } else {
        out.push('\n');
    }
    Some(offset + 4)
}

fn pair_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let first = chunk.read_short_from_offset(offset + 1)?;
    let second = chunk.read_short_from_offset(offset + 3)?;
    let _ = writeln!(
        out,
        " '{}'.'{}'",
        constant_text(chunk, heap, first),
        constant_text(chunk, heap, second)
    );
    Some(offset + 5)
}

fn export_from_instruction(name: &str, chunk: &Chunk, heap: &ObjectManager, offset: usize, out: &mut String) -> Option<usize> {
    let _ = write!(out, "{:<16}", name);
    let count = chunk.read_short_from_offset(offset + 1)? as usize;
    let mut pairs = Vec::with_capacity(count);
    let mut cursor = offset + 3;
    for _ in 0..count {
        let from = chunk.read_short_from_offset(cursor)?;
        let to = chunk.read_short_from_offset(cursor + 2)?;
        pairs.push(format!("{}->{}", constant_text(chunk, heap, from), constant_text(chunk, heap, to)));
        cursor += 4;
    }
    if pairs.is_empty() {
        let _ = writeln!(out, " {:4} *", count);
    } else {
        let _ = writeln!(out, " {:4} {}", count, pairs.join(", "));
    }
    Some(cursor)
}
