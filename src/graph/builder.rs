//! Building graph blocks from instruction lists.
//!
//! [`BlockBuilder`] turns edited subgraphs and synthesized thunk bodies back into
//! [`Block`](crate::graph::Block)s. Encoding is two-pass: a layout pass fixes every
//! instruction's size (widening intra-block branches to their rel32 forms), then the
//! emit pass encodes final bytes and translates operand references into block-level
//! references using the encoder's constant offsets. Byte fields under a reference are
//! placeholders; the reference entries are what the downstream serializer patches.

use iced_x86::{
    Code, ConditionCode, Encoder, FlowControl, Instruction as RawInstruction, OpKind,
};

use crate::{
    graph::{
        subgraph::{BasicBlockSubGraph, Instruction},
        BlockGraph, BlockId, BlockKind, OperandRef, Reference, ReferenceKind, ReferenceMap,
        SectionId,
    },
    Error, Result,
};

/// A pending block-level reference, collected while encoding.
struct PendingRef {
    offset: u32,
    kind: ReferenceKind,
    size: u8,
    target: PendingTarget,
}

enum PendingTarget {
    Block { block: BlockId, offset: i32 },
    SelfAt(i32),
}

/// Builds new blocks in a graph from instruction lists and edited subgraphs.
pub struct BlockBuilder<'g> {
    graph: &'g mut BlockGraph,
    new_blocks: Vec<BlockId>,
}

impl<'g> BlockBuilder<'g> {
    /// Creates a builder over the given graph.
    pub fn new(graph: &'g mut BlockGraph) -> Self {
        Self {
            graph,
            new_blocks: Vec::new(),
        }
    }

    /// Returns the ids of the blocks this builder has created.
    #[must_use]
    pub fn new_blocks(&self) -> &[BlockId] {
        &self.new_blocks
    }

    /// Encodes a straight-line instruction list into a new code block.
    ///
    /// Used for stubs and thunks. The instructions must not carry basic-block
    /// references (there is no subgraph for them to resolve against).
    pub fn build_code_block(
        &mut self,
        name: &str,
        section: SectionId,
        instructions: &[Instruction],
    ) -> Result<BlockId> {
        let body = vec![instructions.to_vec()];
        let (data, refs, _) = encode_blocks(&body)?;
        let id = self
            .graph
            .add_block_with_data(BlockKind::Code, name, data);
        self.graph
            .expect_block_mut(id)?
            .set_section(section);
        install_refs(self.graph, id, refs)?;
        self.new_blocks.push(id);
        Ok(id)
    }

    /// Replaces the subgraph's original block with a freshly encoded one.
    ///
    /// Inbound references to the original block are redirected to the corresponding
    /// basic-block starts of the new block; an inbound reference that does not target
    /// a basic-block start is an error.
    pub fn merge(&mut self, subgraph: &BasicBlockSubGraph) -> Result<BlockId> {
        let old = subgraph.original_block();
        let instruction_lists: Vec<Vec<Instruction>> = subgraph
            .basic_blocks
            .iter()
            .map(|bb| bb.instructions.clone())
            .collect();
        let (data, refs, bb_offsets) = encode_blocks(&instruction_lists)?;

        let old_block = self.graph.expect_block(old)?;
        let name = old_block.name().to_string();
        let section = old_block.section();
        let attributes = old_block.attributes();

        let new = self
            .graph
            .add_block_with_data(BlockKind::Code, name, data);
        {
            let block = self.graph.expect_block_mut(new)?;
            if let Some(section) = section {
                block.set_section(section);
            }
            block.set_attributes(attributes);
        }
        install_refs(self.graph, new, refs)?;

        // Redirect inbound references from the rest of the graph.
        let mut map = ReferenceMap::default();
        for (bb, &new_offset) in subgraph.basic_blocks.iter().zip(bb_offsets.iter()) {
            map.insert((old, bb.offset() as i32), (new, new_offset as i32));
        }
        for block in self.graph.blocks() {
            for (_, reference) in block.references() {
                if reference.block == old && !map.contains_key(&(old, reference.offset)) {
                    return Err(Error::TransformFailure(format!(
                        "inbound reference targets offset {:#x} of block \"{}\", which is not a basic-block start",
                        reference.offset,
                        subgraph.name()
                    )));
                }
            }
        }
        self.graph.redirect_references(&map);
        self.graph.remove_block(old);

        self.new_blocks.push(new);
        Ok(new)
    }
}

/// Encodes basic blocks back to back, resolving basic-block operand references.
///
/// Returns the encoded bytes, the pending block-level references, and the new byte
/// offset of each basic block.
fn encode_blocks(blocks: &[Vec<Instruction>]) -> Result<(Vec<u8>, Vec<PendingRef>, Vec<u32>)> {
    // Layout pass: fix instruction sizes and basic-block offsets. Branch targets do
    // not affect rel32 instruction lengths, so placeholder targets are fine here.
    let mut bb_offsets = Vec::with_capacity(blocks.len());
    {
        let mut encoder = Encoder::new(32);
        let mut cursor = 0u32;
        for block in blocks {
            bb_offsets.push(cursor);
            for instruction in block {
                let raw = prepare_raw(instruction, None)?;
                let length = encoder.encode(&raw, u64::from(cursor))?;
                cursor += length as u32;
            }
        }
    }

    // Emit pass: encode with resolved targets and collect references.
    let mut encoder = Encoder::new(32);
    let mut refs = Vec::new();
    let mut cursor = 0u32;
    for block in blocks {
        for instruction in block {
            let raw = prepare_raw(instruction, Some(&bb_offsets))?;
            let length = encoder.encode(&raw, u64::from(cursor))?;
            let offsets = encoder.get_constant_offsets();

            if let Some(reference) = instruction.displacement_ref() {
                if !offsets.has_displacement() {
                    return Err(Error::TransformFailure(
                        "displacement reference on an instruction without a displacement field"
                            .to_string(),
                    ));
                }
                refs.push(PendingRef {
                    offset: cursor + offsets.displacement_offset() as u32,
                    kind: ReferenceKind::Absolute,
                    size: offsets.displacement_size() as u8,
                    target: pending_target(reference, &bb_offsets),
                });
            }
            if let Some(reference) = instruction.immediate_ref() {
                let is_branch = raw.op0_kind() == OpKind::NearBranch32;
                let (offset, size) = if is_branch {
                    // Branch displacements are not reported as immediates; the field
                    // is the last 4 bytes of the rel32 form.
                    (cursor + length as u32 - 4, 4u8)
                } else {
                    if !offsets.has_immediate() {
                        return Err(Error::TransformFailure(
                            "immediate reference on an instruction without an immediate field"
                                .to_string(),
                        ));
                    }
                    (
                        cursor + offsets.immediate_offset() as u32,
                        offsets.immediate_size() as u8,
                    )
                };
                refs.push(PendingRef {
                    offset,
                    kind: if is_branch {
                        ReferenceKind::PcRelative
                    } else {
                        ReferenceKind::Absolute
                    },
                    size,
                    target: pending_target(reference, &bb_offsets),
                });
            }

            cursor += length as u32;
        }
    }

    Ok((encoder.take_buffer(), refs, bb_offsets))
}

fn pending_target(reference: OperandRef, bb_offsets: &[u32]) -> PendingTarget {
    match reference {
        OperandRef::Block { block, offset } => PendingTarget::Block { block, offset },
        OperandRef::BasicBlock(index) => PendingTarget::SelfAt(bb_offsets[index] as i32),
    }
}

fn install_refs(graph: &mut BlockGraph, id: BlockId, refs: Vec<PendingRef>) -> Result<()> {
    let block = graph.expect_block_mut(id)?;
    for pending in refs {
        let (target_block, target_offset) = match pending.target {
            PendingTarget::Block { block, offset } => (block, offset),
            PendingTarget::SelfAt(offset) => (id, offset),
        };
        block.set_reference(
            pending.offset,
            Reference::new(pending.kind, pending.size, target_block, target_offset),
        );
    }
    Ok(())
}

/// Produces the encodable form of an instruction.
///
/// Intra-block branches are widened to their rel32 forms so the target field always
/// has four bytes, and their targets are resolved against `bb_offsets` when given.
fn prepare_raw(
    instruction: &Instruction,
    bb_offsets: Option<&[u32]>,
) -> Result<RawInstruction> {
    let mut raw = *instruction.raw();

    let branch_to_bb = matches!(
        raw.flow_control(),
        FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
    ) && matches!(instruction.immediate_ref(), Some(OperandRef::BasicBlock(_)));

    if branch_to_bb {
        // Calls are rel32 already; jumps widen to their rel32 forms.
        if raw.flow_control() != FlowControl::Call {
            raw.set_code(near_branch_code(&raw)?);
        }
        if let (Some(offsets), Some(OperandRef::BasicBlock(index))) =
            (bb_offsets, instruction.immediate_ref())
        {
            raw.set_near_branch32(offsets[index]);
        } else {
            raw.set_near_branch32(0);
        }
    } else if let Some(OperandRef::BasicBlock(index)) = instruction.displacement_ref() {
        // Case-table style displacement into the same block.
        if let Some(offsets) = bb_offsets {
            raw.set_memory_displacement32(offsets[index]);
        }
    }

    Ok(raw)
}

/// Maps a decoded branch onto its rel32 form.
fn near_branch_code(raw: &RawInstruction) -> Result<Code> {
    if raw.flow_control() == FlowControl::UnconditionalBranch {
        return Ok(Code::Jmp_rel32_32);
    }
    let code = match raw.condition_code() {
        ConditionCode::o => Code::Jo_rel32_32,
        ConditionCode::no => Code::Jno_rel32_32,
        ConditionCode::b => Code::Jb_rel32_32,
        ConditionCode::ae => Code::Jae_rel32_32,
        ConditionCode::e => Code::Je_rel32_32,
        ConditionCode::ne => Code::Jne_rel32_32,
        ConditionCode::be => Code::Jbe_rel32_32,
        ConditionCode::a => Code::Ja_rel32_32,
        ConditionCode::s => Code::Js_rel32_32,
        ConditionCode::ns => Code::Jns_rel32_32,
        ConditionCode::p => Code::Jp_rel32_32,
        ConditionCode::np => Code::Jnp_rel32_32,
        ConditionCode::l => Code::Jl_rel32_32,
        ConditionCode::ge => Code::Jge_rel32_32,
        ConditionCode::le => Code::Jle_rel32_32,
        ConditionCode::g => Code::Jg_rel32_32,
        ConditionCode::None => {
            // JECXZ and the LOOP family have no rel32 encoding.
            return Err(Error::TransformFailure(format!(
                "branch {:?} has no rel32 form",
                raw.mnemonic()
            )));
        }
    };
    Ok(code)
}
