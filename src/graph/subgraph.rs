//! Basic-block decomposition of code blocks.
//!
//! [`decompose`] lifts one code block into a [`BasicBlockSubGraph`]: an ordered set
//! of single-entry, single-exit instruction runs with successor edges. Block-level
//! references whose offsets land inside an instruction's displacement or immediate
//! field are attached to that instruction as [`OperandRef`]s, and intra-block branch
//! targets become basic-block references. The instrumenter edits the subgraph and the
//! [`BlockBuilder`](crate::graph::BlockBuilder) merges it back into the graph.

use std::collections::{BTreeMap, BTreeSet};

use iced_x86::{
    ConstantOffsets, Decoder, DecoderOptions, FlowControl, Instruction as RawInstruction,
    Mnemonic, OpKind, Register,
};

use crate::{
    graph::{Block, BlockAttributes, BlockId, BlockKind, OperandRef, SectionId},
    Error, Result,
};

/// The byte range an instruction occupied in its original block.
///
/// Synthesized instructions inherit the range of the instruction they were inserted
/// for (in debug-friendly mode), which trades a strict 1:1 address mapping for usable
/// stack traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    /// Byte offset within the original block.
    pub offset: u32,
    /// Length in bytes.
    pub length: u32,
}

/// One decoded (or synthesized) instruction plus its operand references.
#[derive(Debug, Clone)]
pub struct Instruction {
    raw: RawInstruction,
    source_range: Option<SourceRange>,
    displacement_ref: Option<OperandRef>,
    immediate_ref: Option<OperandRef>,
}

impl Instruction {
    /// Wraps a synthesized raw instruction with no source range or references.
    #[must_use]
    pub(crate) fn synthesized(raw: RawInstruction) -> Self {
        Self {
            raw,
            source_range: None,
            displacement_ref: None,
            immediate_ref: None,
        }
    }

    /// Returns the decoded representation.
    #[must_use]
    pub const fn raw(&self) -> &RawInstruction {
        &self.raw
    }

    /// Returns the source range of this instruction, if it came from decoded bytes
    /// or inherited one.
    #[must_use]
    pub const fn source_range(&self) -> Option<SourceRange> {
        self.source_range
    }

    /// Sets the source range.
    pub fn set_source_range(&mut self, source_range: Option<SourceRange>) {
        self.source_range = source_range;
    }

    /// Returns the reference carried by the displacement field, if any.
    #[must_use]
    pub const fn displacement_ref(&self) -> Option<OperandRef> {
        self.displacement_ref
    }

    /// Attaches a reference to the displacement field.
    pub fn set_displacement_ref(&mut self, reference: Option<OperandRef>) {
        self.displacement_ref = reference;
    }

    /// Returns the reference carried by the immediate field, if any.
    #[must_use]
    pub const fn immediate_ref(&self) -> Option<OperandRef> {
        self.immediate_ref
    }

    /// Attaches a reference to the immediate field.
    pub fn set_immediate_ref(&mut self, reference: Option<OperandRef>) {
        self.immediate_ref = reference;
    }
}

/// How control leaves a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicBlockExit {
    /// Control transfers only to listed successors within the subgraph.
    Local,
    /// The block ends in a near return.
    Return,
    /// Control may leave the subgraph (indirect jump, branch to another block).
    External,
}

/// A maximal single-entry, single-exit instruction sequence within a code block.
#[derive(Debug, Clone)]
pub struct BasicCodeBlock {
    /// Byte offset of the block's first instruction in the original code block.
    pub(crate) offset: u32,
    /// Ordered instruction list.
    pub instructions: Vec<Instruction>,
    /// Indices of successor basic blocks within the subgraph.
    pub(crate) successors: Vec<usize>,
    /// Exit classification.
    pub(crate) exit: BasicBlockExit,
}

impl BasicCodeBlock {
    /// Returns the original byte offset of this basic block.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns the indices of successor basic blocks.
    #[must_use]
    pub fn successors(&self) -> &[usize] {
        &self.successors
    }

    /// Returns the exit classification.
    #[must_use]
    pub const fn exit(&self) -> BasicBlockExit {
        self.exit
    }
}

/// The decomposition of one code block into basic blocks.
#[derive(Debug)]
pub struct BasicBlockSubGraph {
    original: BlockId,
    name: String,
    section: Option<SectionId>,
    attributes: BlockAttributes,
    /// Basic blocks in ascending address order.
    pub basic_blocks: Vec<BasicCodeBlock>,
}

impl BasicBlockSubGraph {
    /// Returns the id of the block this subgraph was decomposed from.
    #[must_use]
    pub const fn original_block(&self) -> BlockId {
        self.original
    }

    /// Returns the name of the original block.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the section of the original block.
    #[must_use]
    pub const fn section(&self) -> Option<SectionId> {
        self.section
    }

    /// Returns the attributes of the original block.
    #[must_use]
    pub const fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    /// Returns the number of basic blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.basic_blocks.len()
    }
}

/// Returns whether a block can be decomposed and rewritten without risk.
///
/// Gaps, padding, blocks with inline data and blocks upstream tooling marked unsafe
/// are all excluded; so are data blocks and empty blocks.
#[must_use]
pub fn is_safely_decomposable(block: &Block) -> bool {
    let unsafe_attributes = BlockAttributes::GAP
        | BlockAttributes::PADDING
        | BlockAttributes::HAS_INLINE_DATA
        | BlockAttributes::UNSAFE_TO_DECOMPOSE;
    block.kind() == BlockKind::Code
        && !block.data().is_empty()
        && !block.attributes().intersects(unsafe_attributes)
}

/// Decomposes a code block into basic blocks.
///
/// # Errors
///
/// Returns [`Error::Decode`] when the block contains an undecodable instruction,
/// when a branch or reference targets the middle of an instruction, or when a
/// block-level reference does not land in any operand field.
pub fn decompose(block: &Block) -> Result<BasicBlockSubGraph> {
    let data = block.data();
    let length = data.len() as u32;

    // Linear decode of the whole block.
    let mut decoded: Vec<(RawInstruction, ConstantOffsets)> = Vec::new();
    let mut decoder = Decoder::with_ip(32, data, 0, DecoderOptions::NONE);
    while decoder.can_decode() {
        let raw = decoder.decode();
        if raw.is_invalid() {
            return Err(Error::Decode {
                message: "invalid instruction".to_string(),
                offset: raw.ip() as u32,
            });
        }
        let offsets = decoder.get_constant_offsets(&raw);
        decoded.push((raw, offsets));
    }

    let starts: BTreeMap<u32, usize> = decoded
        .iter()
        .enumerate()
        .map(|(index, (raw, _))| (raw.ip() as u32, index))
        .collect();

    // Leader collection: block entry, intra-block branch targets, instructions
    // following a terminator, and targets of self-references (case tables).
    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(0);
    for (raw, _) in &decoded {
        match raw.flow_control() {
            FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch
                if is_near_branch(raw) =>
            {
                let target = raw.near_branch_target() as u32;
                if target < length {
                    if !starts.contains_key(&target) {
                        return Err(Error::Decode {
                            message: "branch into the middle of an instruction".to_string(),
                            offset: target,
                        });
                    }
                    leaders.insert(target);
                }
                let next = raw.next_ip() as u32;
                if next < length {
                    leaders.insert(next);
                }
            }
            // An in-block call target (`call $+5` and friends) must survive the
            // re-layout, so it becomes a leader and a basic-block reference.
            FlowControl::Call if is_near_branch(raw) => {
                let target = raw.near_branch_target() as u32;
                if target < length {
                    if !starts.contains_key(&target) {
                        return Err(Error::Decode {
                            message: "call into the middle of an instruction".to_string(),
                            offset: target,
                        });
                    }
                    leaders.insert(target);
                }
            }
            FlowControl::IndirectBranch | FlowControl::Return | FlowControl::Exception => {
                let next = raw.next_ip() as u32;
                if next < length {
                    leaders.insert(next);
                }
            }
            _ => {}
        }
    }
    for (_, reference) in block.references() {
        if reference.block == block.id() {
            let target = reference.offset as u32;
            if target < length {
                if !starts.contains_key(&target) {
                    return Err(Error::Decode {
                        message: "self-reference into the middle of an instruction".to_string(),
                        offset: target,
                    });
                }
                leaders.insert(target);
            }
        }
    }

    let leader_list: Vec<u32> = leaders.iter().copied().collect();
    let bb_index_of: BTreeMap<u32, usize> = leader_list
        .iter()
        .enumerate()
        .map(|(index, offset)| (*offset, index))
        .collect();

    // Carve instruction runs into basic blocks.
    let mut basic_blocks: Vec<BasicCodeBlock> = Vec::with_capacity(leader_list.len());
    for (bb_index, &start) in leader_list.iter().enumerate() {
        let end = leader_list.get(bb_index + 1).copied().unwrap_or(length);
        let first = starts[&start];
        let mut instructions = Vec::new();
        for (raw, offsets) in decoded.iter().skip(first) {
            let offset = raw.ip() as u32;
            if offset >= end {
                break;
            }
            let mut instruction = Instruction {
                raw: *raw,
                source_range: Some(SourceRange {
                    offset,
                    length: raw.len() as u32,
                }),
                displacement_ref: None,
                immediate_ref: None,
            };
            attach_operand_refs(block, &mut instruction, offsets, &bb_index_of)?;
            instructions.push(instruction);
        }

        let (successors, exit) = classify_exit(
            instructions.last().map(Instruction::raw),
            bb_index,
            leader_list.len(),
            length,
            &bb_index_of,
        );
        basic_blocks.push(BasicCodeBlock {
            offset: start,
            instructions,
            successors,
            exit,
        });
    }

    Ok(BasicBlockSubGraph {
        original: block.id(),
        name: block.name().to_string(),
        section: block.section(),
        attributes: block.attributes(),
        basic_blocks,
    })
}

/// Returns whether an instruction's first operand is a near branch target.
fn is_near_branch(raw: &RawInstruction) -> bool {
    matches!(
        raw.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    )
}

/// Lifts block-level references overlapping this instruction into operand references
/// and resolves intra-block branch targets to basic-block indices.
fn attach_operand_refs(
    block: &Block,
    instruction: &mut Instruction,
    offsets: &ConstantOffsets,
    bb_index_of: &BTreeMap<u32, usize>,
) -> Result<()> {
    let raw = &instruction.raw;
    let start = raw.ip() as u32;
    let end = start + raw.len() as u32;

    // A rel32 branch or call keeps its 4-byte target field at the instruction tail.
    let branch_field = (is_near_branch(raw) && raw.len() >= 4).then(|| end - 4 - start);

    for (offset, reference) in block.references() {
        if offset < start || offset >= end {
            continue;
        }
        let field = offset - start;
        let lifted = if reference.block == block.id() {
            let target = reference.offset as u32;
            let Some(&index) = bb_index_of.get(&target) else {
                return Err(Error::Decode {
                    message: format!(
                        "self-reference targets offset {target:#x}, which is not a basic-block start"
                    ),
                    offset,
                });
            };
            OperandRef::BasicBlock(index)
        } else {
            OperandRef::Block {
                block: reference.block,
                offset: reference.offset,
            }
        };
        if branch_field == Some(field) {
            instruction.immediate_ref = Some(lifted);
        } else if offsets.has_displacement() && field as usize == offsets.displacement_offset() {
            instruction.displacement_ref = Some(lifted);
        } else if offsets.has_immediate() && field as usize == offsets.immediate_offset() {
            instruction.immediate_ref = Some(lifted);
        } else {
            return Err(Error::Decode {
                message: format!(
                    "reference at offset {offset:#x} does not land in an operand field"
                ),
                offset,
            });
        }
    }

    // Intra-block branches and calls become basic-block references on the
    // immediate field.
    if is_near_branch(raw)
        && matches!(
            raw.flow_control(),
            FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
        )
    {
        let target = raw.near_branch_target() as u32;
        if (target as usize) < block.data().len() && instruction.immediate_ref.is_none() {
            instruction.immediate_ref = Some(OperandRef::BasicBlock(bb_index_of[&target]));
        }
    }

    Ok(())
}

/// Computes successor indices and the exit classification for one basic block.
fn classify_exit(
    last: Option<&RawInstruction>,
    bb_index: usize,
    bb_count: usize,
    block_length: u32,
    bb_index_of: &BTreeMap<u32, usize>,
) -> (Vec<usize>, BasicBlockExit) {
    let Some(raw) = last else {
        return (Vec::new(), BasicBlockExit::External);
    };

    let fallthrough = || {
        if bb_index + 1 < bb_count {
            Some(bb_index + 1)
        } else {
            None
        }
    };

    match raw.flow_control() {
        FlowControl::Return => (Vec::new(), BasicBlockExit::Return),
        FlowControl::IndirectBranch | FlowControl::Exception => {
            (Vec::new(), BasicBlockExit::External)
        }
        FlowControl::UnconditionalBranch if is_near_branch(raw) => {
            let target = raw.near_branch_target() as u32;
            if target < block_length {
                (vec![bb_index_of[&target]], BasicBlockExit::Local)
            } else {
                (Vec::new(), BasicBlockExit::External)
            }
        }
        FlowControl::UnconditionalBranch => (Vec::new(), BasicBlockExit::External),
        FlowControl::ConditionalBranch if is_near_branch(raw) => {
            let mut successors = Vec::new();
            let mut exit = BasicBlockExit::Local;
            let target = raw.near_branch_target() as u32;
            if target < block_length {
                successors.push(bb_index_of[&target]);
            } else {
                exit = BasicBlockExit::External;
            }
            if let Some(next) = fallthrough() {
                successors.push(next);
            } else {
                exit = BasicBlockExit::External;
            }
            (successors, exit)
        }
        // Calls and straight-line code fall through to the next basic block.
        _ => match fallthrough() {
            Some(next) => (vec![next], BasicBlockExit::Local),
            None => (Vec::new(), BasicBlockExit::External),
        },
    }
}

/// Returns whether the function performs any stack-pointer manipulation beyond the
/// conventional prologue/epilogue.
///
/// When it does not, accesses based on `ESP`/`EBP` are known to stay on the stack
/// and the instrumenter can skip them ([`StackAccessMode::Safe`]).
///
/// [`StackAccessMode::Safe`]: crate::pass::StackAccessMode::Safe
#[must_use]
pub fn has_unexpected_stack_frame_manipulation(subgraph: &BasicBlockSubGraph) -> bool {
    subgraph
        .basic_blocks
        .iter()
        .flat_map(|bb| bb.instructions.iter())
        .any(|instruction| is_unexpected_stack_write(instruction.raw()))
}

fn writes_frame_register(raw: &RawInstruction) -> Option<Register> {
    if raw.op_count() == 0 || raw.op0_kind() != OpKind::Register {
        return None;
    }
    let full = raw.op0_register().full_register32();
    (full == Register::ESP || full == Register::EBP).then_some(full)
}

fn is_unexpected_stack_write(raw: &RawInstruction) -> bool {
    match raw.mnemonic() {
        // The ordinary mechanics of stack usage.
        Mnemonic::Push
        | Mnemonic::Pop
        | Mnemonic::Pushfd
        | Mnemonic::Popfd
        | Mnemonic::Call
        | Mnemonic::Ret
        | Mnemonic::Leave => false,

        // Frame setup/teardown: mov ebp, esp / mov esp, ebp.
        Mnemonic::Mov => match writes_frame_register(raw) {
            Some(Register::EBP) => {
                !(raw.op1_kind() == OpKind::Register && raw.op1_register() == Register::ESP)
            }
            Some(Register::ESP) => {
                !(raw.op1_kind() == OpKind::Register && raw.op1_register() == Register::EBP)
            }
            _ => false,
        },

        // Frame allocation: sub/add esp, imm.
        Mnemonic::Sub | Mnemonic::Add => match writes_frame_register(raw) {
            Some(Register::ESP) => !matches!(
                raw.op1_kind(),
                OpKind::Immediate8to32 | OpKind::Immediate32
            ),
            Some(Register::EBP) => true,
            Some(_) => false,
            None => false,
        },

        // Everything else writing ESP/EBP (lea esp, and esp, popad, xchg, ...)
        // counts as unexpected.
        Mnemonic::Popad => true,
        _ => writes_frame_register(raw).is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlockGraph, ImageFormat, Reference, ReferenceKind};

    fn graph_with_code(bytes: &[u8]) -> (BlockGraph, BlockId) {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let id = graph.add_block_with_data(BlockKind::Code, "f", bytes.to_vec());
        (graph, id)
    }

    #[test]
    fn test_single_basic_block() {
        // mov eax, [ebx+4]; ret
        let (graph, id) = graph_with_code(&[0x8B, 0x43, 0x04, 0xC3]);
        let subgraph = decompose(graph.block(id).unwrap()).unwrap();
        assert_eq!(subgraph.block_count(), 1);
        let bb = &subgraph.basic_blocks[0];
        assert_eq!(bb.instructions.len(), 2);
        assert_eq!(bb.exit(), BasicBlockExit::Return);
        assert!(bb.successors().is_empty());
    }

    #[test]
    fn test_conditional_branch_splits() {
        // test eax, eax; jz +2; xor eax, eax; ret
        let (graph, id) = graph_with_code(&[0x85, 0xC0, 0x74, 0x02, 0x31, 0xC0, 0xC3]);
        let subgraph = decompose(graph.block(id).unwrap()).unwrap();
        assert_eq!(subgraph.block_count(), 3);

        let first = &subgraph.basic_blocks[0];
        assert_eq!(first.successors(), &[2, 1]);
        assert_eq!(first.exit(), BasicBlockExit::Local);

        // The branch carries a basic-block reference to its target.
        let branch = first.instructions.last().unwrap();
        assert_eq!(branch.immediate_ref(), Some(OperandRef::BasicBlock(2)));
    }

    #[test]
    fn test_block_reference_lands_in_displacement() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let global = graph.add_block_with_data(BlockKind::Data, "g", vec![0u8; 4]);
        // mov eax, [disp32]; ret - absolute displacement at offset 1.
        let id = graph.add_block_with_data(
            BlockKind::Code,
            "f",
            vec![0xA1, 0x00, 0x00, 0x00, 0x00, 0xC3],
        );
        graph
            .block_mut(id)
            .unwrap()
            .set_reference(1, Reference::new(ReferenceKind::Absolute, 4, global, 0));

        let subgraph = decompose(graph.block(id).unwrap()).unwrap();
        let load = &subgraph.basic_blocks[0].instructions[0];
        assert_eq!(
            load.displacement_ref(),
            Some(OperandRef::Block {
                block: global,
                offset: 0
            })
        );
    }

    #[test]
    fn test_undecodable_block_is_rejected() {
        // 0x0F 0x0B is ud2 (fine), but a dangling prefix at the end is invalid.
        let (graph, id) = graph_with_code(&[0x66]);
        assert!(matches!(
            decompose(graph.block(id).unwrap()),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_conventional_frame_is_safe() {
        // push ebp; mov ebp, esp; sub esp, 8; mov eax, [ebp+8]; leave; ret
        let (graph, id) = graph_with_code(&[
            0x55, 0x89, 0xE5, 0x83, 0xEC, 0x08, 0x8B, 0x45, 0x08, 0xC9, 0xC3,
        ]);
        let subgraph = decompose(graph.block(id).unwrap()).unwrap();
        assert!(!has_unexpected_stack_frame_manipulation(&subgraph));
    }

    #[test]
    fn test_stack_alignment_is_unexpected() {
        // and esp, -16; ret
        let (graph, id) = graph_with_code(&[0x83, 0xE4, 0xF0, 0xC3]);
        let subgraph = decompose(graph.block(id).unwrap()).unwrap();
        assert!(has_unexpected_stack_frame_manipulation(&subgraph));
    }
}
