//! The per-basic-block instrumentation engine.
//!
//! For each instruction of a basic block, decide whether its memory access needs a
//! probe and, if so, emit the probe call sequence immediately before it:
//!
//! - load/store probes use the EDX convention: `push edx; lea edx, <operand>;
//!   call <probe>`. The probe restores `EDX` and cleans the 4-byte slot, and may
//!   clobber `EFLAGS` only in its `_no_flags` variant.
//! - string-instruction probes are called bare: the addresses are already in
//!   `ESI`/`EDI` and the probe preserves all registers, flags and the stack.
//!
//! Everything else in this module is the skip chain: redundancy, operand references,
//! exempt opcodes, conventional stack traffic, segment overrides, caller filters and
//! sampling.

use iced_x86::Register;
use rand::{rngs::StdRng, Rng};

use crate::{
    graph::{
        has_unexpected_stack_frame_manipulation, BasicBlockSubGraph, BasicCodeBlock,
        BlockAssembler, ImageFormat, Instruction, Operand,
    },
    pass::{
        access::{decode_memory_access, is_exempt_opcode, MemoryAccessInfo, MemoryAccessMode},
        liveness::{LivenessAnalysis, LivenessState},
        probes::ProbeTable,
        redundancy::{MemoryAccessAnalysis, MemoryAccessState},
    },
    Error, Result,
};

/// Whether accesses based on `ESP`/`EBP` are known to stay on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAccessMode {
    /// The function only manipulates the stack conventionally; `ESP`/`EBP` based
    /// accesses are skipped.
    Safe,
    /// The function does something unexpected with the stack pointer; everything is
    /// instrumented.
    Unsafe,
}

/// A caller-provided predicate excluding instructions from instrumentation.
pub type InstructionFilter<'f> = &'f dyn Fn(&Instruction) -> bool;

/// Instruments the basic blocks of one decomposed code block.
pub struct BasicBlockInstrumenter<'a> {
    probes: &'a ProbeTable,
    rng: &'a mut StdRng,
    debug_friendly: bool,
    use_liveness_analysis: bool,
    remove_redundant_checks: bool,
    instrumentation_rate: f64,
    dry_run: bool,
    filter: Option<InstructionFilter<'a>>,
    instrumentation_happened: bool,
    liveness: LivenessAnalysis,
    memory_accesses: MemoryAccessAnalysis,
}

impl<'a> BasicBlockInstrumenter<'a> {
    /// Creates an instrumenter drawing probes from `probes` and sampling decisions
    /// from `rng`.
    pub fn new(probes: &'a ProbeTable, rng: &'a mut StdRng) -> Self {
        Self {
            probes,
            rng,
            debug_friendly: false,
            use_liveness_analysis: false,
            remove_redundant_checks: false,
            instrumentation_rate: 1.0,
            dry_run: false,
            filter: None,
            instrumentation_happened: false,
            liveness: LivenessAnalysis::new(),
            memory_accesses: MemoryAccessAnalysis::new(),
        }
    }

    /// Propagates original source ranges onto inserted instructions.
    pub fn set_debug_friendly(&mut self, debug_friendly: bool) {
        self.debug_friendly = debug_friendly;
    }

    /// Enables flag-liveness analysis and the `_no_flags` probe variants.
    pub fn set_use_liveness_analysis(&mut self, use_liveness_analysis: bool) {
        self.use_liveness_analysis = use_liveness_analysis;
    }

    /// Enables redundant-access elimination.
    pub fn set_remove_redundant_checks(&mut self, remove_redundant_checks: bool) {
        self.remove_redundant_checks = remove_redundant_checks;
    }

    /// Sets the probability of instrumenting any given access, clamped to [0, 1].
    pub fn set_instrumentation_rate(&mut self, instrumentation_rate: f64) {
        self.instrumentation_rate = instrumentation_rate.clamp(0.0, 1.0);
    }

    /// In dry-run mode, accesses are classified and counted but no code is emitted.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Installs a predicate excluding instructions from instrumentation.
    pub fn set_filter(&mut self, filter: Option<InstructionFilter<'a>>) {
        self.filter = filter;
    }

    /// Returns whether any access was (or, in dry-run mode, would have been)
    /// instrumented so far.
    #[must_use]
    pub const fn instrumentation_happened(&self) -> bool {
        self.instrumentation_happened
    }

    /// Instruments every basic block of `subgraph`.
    ///
    /// Runs the enabled analyses once over the whole subgraph, determines the stack
    /// access mode, then rewrites each block.
    pub fn transform_subgraph(
        &mut self,
        format: ImageFormat,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<()> {
        // A rate of exactly zero short-circuits everything.
        if self.instrumentation_rate == 0.0 {
            return Ok(());
        }

        if self.use_liveness_analysis {
            self.liveness.analyze(subgraph);
        }
        if self.remove_redundant_checks {
            self.memory_accesses.analyze(subgraph);
        }

        let stack_mode = if has_unexpected_stack_frame_manipulation(subgraph) {
            StackAccessMode::Unsafe
        } else {
            StackAccessMode::Safe
        };

        for index in 0..subgraph.basic_blocks.len() {
            self.instrument_basic_block(&mut subgraph.basic_blocks[index], index, stack_mode, format)?;
        }
        Ok(())
    }

    /// Instruments one basic block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProbe`] when a classified access has no probe in the
    /// table, which indicates a bug in the probe enumeration.
    pub fn instrument_basic_block(
        &mut self,
        basic_block: &mut BasicCodeBlock,
        index: usize,
        stack_mode: StackAccessMode,
        format: ImageFormat,
    ) -> Result<()> {
        if self.instrumentation_rate == 0.0 {
            return Ok(());
        }

        // Pre-compute per-instruction liveness: the state at each instruction's
        // entry, which is where the probe will execute.
        let mut states: Vec<LivenessState> = Vec::new();
        if self.use_liveness_analysis {
            let mut state = self.liveness.state_at_exit_of(index);
            states.reserve(basic_block.instructions.len());
            for instruction in basic_block.instructions.iter().rev() {
                LivenessAnalysis::propagate_backward(instruction, &mut state);
                states.push(state);
            }
            states.reverse();
        }

        let mut memory_state = if self.remove_redundant_checks {
            self.memory_accesses.state_at_entry_of(index)
        } else {
            MemoryAccessState::new()
        };

        let mut rewritten: Vec<Instruction> =
            Vec::with_capacity(basic_block.instructions.len());
        for (position, instruction) in basic_block.instructions.iter().enumerate() {
            let state = states.get(position).copied();
            if let Some((operand, info)) =
                self.plan_access(instruction, state, &mut memory_state, stack_mode)?
            {
                // Mark before touching the table so dry runs work without probes.
                self.instrumentation_happened = true;

                if !self.dry_run {
                    let probe = self.probes.get(&info).ok_or_else(|| Error::UnknownProbe {
                        name: info.probe_name(format),
                    })?;
                    let mut asm = BlockAssembler::new(&mut rewritten);
                    if self.debug_friendly {
                        asm.set_source_range(instruction.source_range());
                    }
                    if matches!(info.mode, MemoryAccessMode::Read | MemoryAccessMode::Write) {
                        asm.push_reg(Register::EDX)?;
                        asm.lea(Register::EDX, &operand)?;
                    }
                    match format {
                        ImageFormat::Pe => asm.call_indirect(probe.block, probe.offset)?,
                        ImageFormat::Coff => asm.call_direct(probe.block, probe.offset)?,
                    }
                }
            }
            rewritten.push(instruction.clone());
        }
        basic_block.instructions = rewritten;

        Ok(())
    }

    /// Runs the skip chain for one instruction and returns the access to
    /// instrument, if any.
    fn plan_access(
        &mut self,
        instruction: &Instruction,
        state: Option<LivenessState>,
        memory_state: &mut MemoryAccessState,
        stack_mode: StackAccessMode,
    ) -> Result<Option<(Operand, MemoryAccessInfo)>> {
        // Accesses already covered by an earlier check need no probe; the state
        // still moves forward past every instruction.
        if self.remove_redundant_checks {
            let needed = memory_state.has_non_redundant_access(instruction);
            memory_state.propagate_forward(instruction);
            if !needed {
                return Ok(None);
            }
        }

        let Some((operand, mut info)) = decode_memory_access(instruction)? else {
            return Ok(None);
        };

        // A basic-block reference is a computed jump or case-table load; a block
        // reference is a global. Neither is worth checking (globals would need
        // redzoned padding to gain anything).
        if operand.displacement_reference().is_some() {
            return Ok(None);
        }

        if is_exempt_opcode(instruction.raw().mnemonic()) {
            return Ok(None);
        }

        // Conventional stack traffic is known to be mapped.
        if stack_mode == StackAccessMode::Safe
            && matches!(
                operand.base_register(),
                Some(Register::ESP) | Some(Register::EBP)
            )
        {
            return Ok(None);
        }

        // FS holds thread-locals and GS CPU info; neither is shadowed.
        if matches!(
            instruction.raw().segment_prefix(),
            Register::FS | Register::GS
        ) {
            return Ok(None);
        }

        if let Some(filter) = self.filter {
            if filter(instruction) {
                return Ok(None);
            }
        }

        // Sample for partial instrumentation.
        if self.instrumentation_rate < 1.0
            && self.rng.gen::<f64>() >= self.instrumentation_rate
        {
            return Ok(None);
        }

        // When the arithmetic flags are dead here, the probe may clobber them.
        if self.use_liveness_analysis
            && matches!(info.mode, MemoryAccessMode::Read | MemoryAccessMode::Write)
        {
            if let Some(state) = state {
                info.save_flags = state.are_arithmetic_flags_live();
            }
        }

        Ok(Some((operand, info)))
    }
}
