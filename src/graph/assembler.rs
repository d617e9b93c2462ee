//! Instruction-level assembler for synthesized code.
//!
//! [`BlockAssembler`] appends abstract instructions to a basic block's instruction
//! list. Operands may carry references to graph blocks or to basic blocks of the
//! subgraph under edit; those references travel with the instruction and are turned
//! into block-level references when the [`BlockBuilder`](crate::graph::BlockBuilder)
//! encodes the final bytes.

use iced_x86::{Code, Instruction as RawInstruction, MemoryOperand, Register};

use crate::{
    graph::{
        subgraph::{Instruction, SourceRange},
        BlockId, OperandRef,
    },
    Result,
};

/// A displacement value that may carry a reference.
///
/// When a reference is attached, the numeric value is a placeholder; the reference
/// is authoritative and is materialized at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displacement {
    value: i32,
    reference: Option<OperandRef>,
}

impl Displacement {
    /// Creates a plain numeric displacement.
    #[must_use]
    pub const fn new(value: i32) -> Self {
        Self {
            value,
            reference: None,
        }
    }

    /// Creates a displacement referring to a location in a graph block.
    #[must_use]
    pub const fn with_block(block: BlockId, offset: i32) -> Self {
        Self {
            value: 0,
            reference: Some(OperandRef::Block { block, offset }),
        }
    }

    /// Creates a displacement referring to a basic block of the current subgraph.
    #[must_use]
    pub const fn with_basic_block(index: usize) -> Self {
        Self {
            value: 0,
            reference: Some(OperandRef::BasicBlock(index)),
        }
    }

    /// Returns the numeric displacement value.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Returns the attached reference, if any.
    #[must_use]
    pub const fn reference(&self) -> Option<OperandRef> {
        self.reference
    }
}

/// A memory operand: optional base, optional scaled index, optional displacement.
///
/// This mirrors the operand forms the instrumenter classifies: simple (`[base+disp]`)
/// and complex (`[base+index*scale+disp]`, `[index*scale+disp]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    base: Option<Register>,
    index: Option<Register>,
    scale: u32,
    displacement: Option<Displacement>,
}

impl Operand {
    /// `[base]`
    #[must_use]
    pub const fn base(base: Register) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            displacement: None,
        }
    }

    /// `[base + disp]`
    #[must_use]
    pub const fn base_disp(base: Register, displacement: Displacement) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            displacement: Some(displacement),
        }
    }

    /// `[base + index * scale]`
    #[must_use]
    pub const fn base_index(base: Register, index: Register, scale: u32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            displacement: None,
        }
    }

    /// `[base + index * scale + disp]`
    #[must_use]
    pub const fn base_index_disp(
        base: Register,
        index: Register,
        scale: u32,
        displacement: Displacement,
    ) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            displacement: Some(displacement),
        }
    }

    /// `[index * scale + disp]`
    ///
    /// There is no x86 encoding for a scaled index without a displacement, so this
    /// form always carries one.
    #[must_use]
    pub const fn index_disp(index: Register, scale: u32, displacement: Displacement) -> Self {
        Self {
            base: None,
            index: Some(index),
            scale,
            displacement: Some(displacement),
        }
    }

    /// Returns the base register, if present.
    #[must_use]
    pub const fn base_register(&self) -> Option<Register> {
        self.base
    }

    /// Returns the index register, if present.
    #[must_use]
    pub const fn index_register(&self) -> Option<Register> {
        self.index
    }

    /// Returns the index scale factor.
    #[must_use]
    pub const fn scale(&self) -> u32 {
        self.scale
    }

    /// Returns the displacement, if present.
    #[must_use]
    pub const fn displacement(&self) -> Option<Displacement> {
        self.displacement
    }

    /// Lowers this operand to an iced memory operand.
    ///
    /// A displacement that carries a reference encodes as a 4-byte placeholder so the
    /// builder has a field to patch.
    #[must_use]
    pub(crate) fn to_memory_operand(self) -> MemoryOperand {
        let base = self.base.unwrap_or(Register::None);
        let index = self.index.unwrap_or(Register::None);
        let displ = self.displacement.map_or(0, |d| i64::from(d.value()));
        let displ_size = if self.displacement.is_some() || base == Register::EBP {
            4
        } else {
            0
        };
        MemoryOperand::new(
            base,
            index,
            self.scale,
            displ,
            displ_size,
            false,
            Register::None,
        )
    }

    /// Returns the reference attached to the displacement, if any.
    #[must_use]
    pub fn displacement_reference(&self) -> Option<OperandRef> {
        self.displacement.and_then(|d| d.reference())
    }
}

/// Appends synthesized instructions to a basic block's instruction list.
///
/// When a source range is set, every appended instruction inherits it; the
/// instrumenter uses this to propagate the instrumented instruction's range onto the
/// probe call sequence in debug-friendly mode.
pub struct BlockAssembler<'a> {
    instructions: &'a mut Vec<Instruction>,
    source_range: Option<SourceRange>,
}

impl<'a> BlockAssembler<'a> {
    /// Creates an assembler appending to `instructions`.
    pub fn new(instructions: &'a mut Vec<Instruction>) -> Self {
        Self {
            instructions,
            source_range: None,
        }
    }

    /// Sets the source range inherited by subsequently appended instructions.
    pub fn set_source_range(&mut self, source_range: Option<SourceRange>) {
        self.source_range = source_range;
    }

    fn append(&mut self, raw: RawInstruction) -> &mut Instruction {
        let mut instruction = Instruction::synthesized(raw);
        instruction.set_source_range(self.source_range);
        self.instructions.push(instruction);
        self.instructions.last_mut().expect("just pushed")
    }

    /// `push reg32`
    pub fn push_reg(&mut self, register: Register) -> Result<()> {
        let raw = RawInstruction::with1(Code::Push_r32, register)?;
        self.append(raw);
        Ok(())
    }

    /// `push imm32`
    pub fn push_imm32(&mut self, immediate: u32) -> Result<()> {
        let raw = RawInstruction::with1(Code::Pushd_imm32, immediate as i32)?;
        self.append(raw);
        Ok(())
    }

    /// `push imm32` where the immediate is an absolute reference into a graph block.
    pub fn push_imm32_reference(&mut self, block: BlockId, offset: i32) -> Result<()> {
        let raw = RawInstruction::with1(Code::Pushd_imm32, 0i32)?;
        let instruction = self.append(raw);
        instruction.set_immediate_ref(Some(OperandRef::Block { block, offset }));
        Ok(())
    }

    /// `mov reg32, [mem]`
    pub fn mov(&mut self, destination: Register, operand: &Operand) -> Result<()> {
        let raw = RawInstruction::with2(
            Code::Mov_r32_rm32,
            destination,
            operand.to_memory_operand(),
        )?;
        let instruction = self.append(raw);
        instruction.set_displacement_ref(operand.displacement_reference());
        Ok(())
    }

    /// `lea reg32, [mem]`
    pub fn lea(&mut self, destination: Register, operand: &Operand) -> Result<()> {
        let raw =
            RawInstruction::with2(Code::Lea_r32_m, destination, operand.to_memory_operand())?;
        let instruction = self.append(raw);
        instruction.set_displacement_ref(operand.displacement_reference());
        Ok(())
    }

    /// `ret`
    pub fn ret(&mut self) -> Result<()> {
        self.append(RawInstruction::with(Code::Retnd));
        Ok(())
    }

    /// `ret imm16` (near return with stack cleanup)
    pub fn ret_imm(&mut self, bytes: u16) -> Result<()> {
        let raw = RawInstruction::with1(Code::Retnd_imm16, i32::from(bytes))?;
        self.append(raw);
        Ok(())
    }

    /// `call [abs32]` - an indirect call through an absolute slot, e.g. an IAT entry.
    pub fn call_indirect(&mut self, block: BlockId, offset: i32) -> Result<()> {
        let memory = MemoryOperand::new(Register::None, Register::None, 1, 0, 4, false, Register::None);
        let raw = RawInstruction::with1(Code::Call_rm32, memory)?;
        let instruction = self.append(raw);
        instruction.set_displacement_ref(Some(OperandRef::Block { block, offset }));
        Ok(())
    }

    /// `call rel32` - a direct call to a symbolic target.
    pub fn call_direct(&mut self, block: BlockId, offset: i32) -> Result<()> {
        let raw = RawInstruction::with_branch(Code::Call_rel32_32, 0)?;
        let instruction = self.append(raw);
        instruction.set_immediate_ref(Some(OperandRef::Block { block, offset }));
        Ok(())
    }

    /// `jmp [abs32]` - an indirect jump through an absolute slot.
    pub fn jmp_indirect(&mut self, block: BlockId, offset: i32) -> Result<()> {
        let memory = MemoryOperand::new(Register::None, Register::None, 1, 0, 4, false, Register::None);
        let raw = RawInstruction::with1(Code::Jmp_rm32, memory)?;
        let instruction = self.append(raw);
        instruction.set_displacement_ref(Some(OperandRef::Block { block, offset }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Mnemonic;

    #[test]
    fn test_push_lea_sequence() {
        let mut instructions = Vec::new();
        let mut asm = BlockAssembler::new(&mut instructions);
        asm.push_reg(Register::EDX).unwrap();
        asm.lea(
            Register::EDX,
            &Operand::base_disp(Register::EBX, Displacement::new(7)),
        )
        .unwrap();

        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].raw().mnemonic(), Mnemonic::Push);
        assert_eq!(instructions[1].raw().mnemonic(), Mnemonic::Lea);
        assert_eq!(instructions[1].raw().memory_displacement32(), 7);
    }

    #[test]
    fn test_call_indirect_carries_reference() {
        let mut instructions = Vec::new();
        let mut asm = BlockAssembler::new(&mut instructions);
        let iat = BlockId::from_raw(3);
        asm.call_indirect(iat, 8).unwrap();

        assert_eq!(instructions[0].raw().mnemonic(), Mnemonic::Call);
        assert_eq!(
            instructions[0].displacement_ref(),
            Some(OperandRef::Block {
                block: iat,
                offset: 8
            })
        );
    }

    #[test]
    fn test_source_range_inherited() {
        let mut instructions = Vec::new();
        let mut asm = BlockAssembler::new(&mut instructions);
        let range = SourceRange { offset: 4, length: 2 };
        asm.set_source_range(Some(range));
        asm.ret().unwrap();
        assert_eq!(instructions[0].source_range(), Some(range));
    }
}
