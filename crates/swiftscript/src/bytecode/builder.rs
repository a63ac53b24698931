//! Builder for emitting one chunk of bytecode.
//!
//! Handles operand encoding, forward jumps patched once the target is known,
//! backward loop jumps, the per-byte line table, and max-stack tracking.
//! Capacity violations (a jump beyond the `u16` offset space) surface as
//! [`CompilerError`] rather than silent truncation.

use super::{assembly::Chunk, op::Opcode};
use crate::error::CompilerError;

/// Label for a forward jump awaiting its target.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[derive(Debug, Default)]
pub struct ChunkBuilder {
    code: Vec<u8>,
    line_info: Vec<u32>,
    current_line: u32,
    current_stack_depth: i32,
    max_stack_depth: i32,
}

impl ChunkBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line recorded for subsequently emitted bytes.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    fn push_byte(&mut self, byte: u8) {
        self.code.push(byte);
        self.line_info.push(self.current_line);
    }

    pub fn emit(&mut self, op: Opcode) {
        self.push_byte(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.emit(op);
        self.push_byte(operand);
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.emit(op);
        self.push_operand_u16(operand);
    }

    /// Appends a raw `u16` operand (little-endian) to the current
    /// instruction's operand tail.
    pub fn push_operand_u16(&mut self, operand: u16) {
        let bytes = operand.to_le_bytes();
        self.push_byte(bytes[0]);
        self.push_byte(bytes[1]);
    }

    /// Appends a raw `u8` operand.
    pub fn push_operand_u8(&mut self, operand: u8) {
        self.push_byte(operand);
    }

    /// Emits a forward jump with a placeholder offset; patch with
    /// [`Self::patch_jump`].
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.emit(op);
        let label = JumpLabel(self.code.len());
        self.push_byte(0xFF);
        self.push_byte(0xFF);
        label
    }

    /// Patches a forward jump to land at the current offset. The operand is
    /// the distance from just past the operand to the target.
    pub fn patch_jump(&mut self, label: JumpLabel, line: u32) -> Result<(), CompilerError> {
        let target = self.code.len();
        let offset = target - label.0 - 2;
        let offset = u16::try_from(offset)
            .map_err(|_| CompilerError::new("jump distance exceeds 16-bit offset; body too large", line))?;
        let bytes = offset.to_le_bytes();
        self.code[label.0] = bytes[0];
        self.code[label.0 + 1] = bytes[1];
        Ok(())
    }

    /// Emits `LOOP` jumping back to `start` (an offset previously captured
    /// with [`Self::current_offset`]).
    pub fn emit_loop(&mut self, start: usize, line: u32) -> Result<(), CompilerError> {
        self.emit(Opcode::Loop);
        // +2 accounts for the operand itself.
        let offset = self.code.len() - start + 2;
        let offset = u16::try_from(offset)
            .map_err(|_| CompilerError::new("loop body exceeds 16-bit offset; body too large", line))?;
        self.push_operand_u16(offset);
        Ok(())
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Manual stack-depth adjustment for operand-dependent opcodes (calls,
    /// collection builders) and path-dependent control flow.
    pub fn adjust_stack(&mut self, delta: i16) {
        self.current_stack_depth += i32::from(delta);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }

    #[must_use]
    pub fn build(self) -> Chunk {
        Chunk {
            code: self.code,
            line_info: self.line_info,
            max_stack_depth: u16::try_from(self.max_stack_depth.max(0)).unwrap_or(u16::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn emits_opcode_with_u16_operand() {
        let mut builder = ChunkBuilder::new();
        builder.emit_u16(Opcode::Constant, 0x1234);
        let chunk = builder.build();
        assert_eq!(chunk.code, vec![Opcode::Constant as u8, 0x34, 0x12]);
    }

    #[test]
    fn line_info_parallels_code() {
        let mut builder = ChunkBuilder::new();
        builder.set_line(3);
        builder.emit(Opcode::Nil);
        builder.set_line(4);
        builder.emit_u16(Opcode::Constant, 0);
        let chunk = builder.build();
        assert_eq!(chunk.line_info, vec![3, 4, 4, 4]);
        assert_eq!(chunk.line_at(0), 3);
        assert_eq!(chunk.line_at(2), 4);
    }

    #[test]
    fn forward_jump_patching() {
        let mut builder = ChunkBuilder::new();
        builder.emit(Opcode::Nil);
        let jump = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit(Opcode::Nil);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump, 1).unwrap();
        builder.emit(Opcode::Halt);
        let chunk = builder.build();
        // Offset skips the two bytes after the operand: Nil + Pop.
        assert_eq!(chunk.code, vec![
            Opcode::Nil as u8,
            Opcode::JumpIfFalse as u8,
            2,
            0,
            Opcode::Nil as u8,
            Opcode::Pop as u8,
            Opcode::Halt as u8,
        ]);
    }

    #[test]
    fn loop_offset_points_back_to_start() {
        let mut builder = ChunkBuilder::new();
        builder.emit(Opcode::Nil);
        let start = builder.current_offset();
        builder.emit(Opcode::Nil);
        builder.emit(Opcode::Pop);
        builder.emit_loop(start, 1).unwrap();
        let chunk = builder.build();
        // ip after reading the operand = 6; 6 - 5 = 1 = start.
        assert_eq!(chunk.code[3], Opcode::Loop as u8);
        assert_eq!(u16::from_le_bytes([chunk.code[4], chunk.code[5]]), 5);
    }

    #[test]
    fn tracks_max_stack_depth() {
        let mut builder = ChunkBuilder::new();
        builder.emit(Opcode::Nil);
        builder.emit(Opcode::Nil);
        builder.emit(Opcode::Add);
        let chunk = builder.build();
        assert_eq!(chunk.max_stack_depth, 2);
    }
}
