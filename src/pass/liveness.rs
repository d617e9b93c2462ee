//! EFLAGS liveness analysis.
//!
//! A flag is *live* at a program point if some path from that point reaches an
//! instruction that reads the flag before one that redefines it. The instrumenter
//! uses this to pick the cheaper `_no_flags` probe variants: when no arithmetic flag
//! is live where a probe is inserted, the probe is allowed to clobber `EFLAGS`.
//!
//! # Algorithm
//!
//! A standard backward dataflow over the basic blocks of one subgraph:
//!
//! - `OUT[B]` = ∪{IN[S] | S successor of B}, seeded with everything live when
//!   control may leave the subgraph and with nothing live at a return
//! - `IN[B]` is obtained by walking B's instructions in reverse, applying
//!   `live = (live - DEF) ∪ USE` per instruction from iced's rflags tables
//!
//! The instrumenter then replays the same reverse walk per block to get one state
//! per instruction.

use iced_x86::{FlowControl, RflagsBits};

use crate::graph::{BasicBlockExit, BasicBlockSubGraph, Instruction};

/// The arithmetic flags probes care about.
const ARITHMETIC_FLAGS: u32 =
    RflagsBits::OF | RflagsBits::SF | RflagsBits::ZF | RflagsBits::AF | RflagsBits::CF
        | RflagsBits::PF;

/// The set of live flags at one program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState(u32);

impl LivenessState {
    /// A state with every flag live: the conservative assumption.
    #[must_use]
    pub const fn all_live() -> Self {
        Self(u32::MAX)
    }

    /// A state with no flag live.
    #[must_use]
    pub const fn none_live() -> Self {
        Self(0)
    }

    /// Returns whether any arithmetic flag (OF/SF/ZF/AF/CF/PF) is live.
    #[must_use]
    pub const fn are_arithmetic_flags_live(&self) -> bool {
        self.0 & ARITHMETIC_FLAGS != 0
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::all_live()
    }
}

/// Per-subgraph EFLAGS liveness.
#[derive(Debug, Default)]
pub struct LivenessAnalysis {
    exit_states: Vec<LivenessState>,
}

impl LivenessAnalysis {
    /// Creates an empty analysis.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes exit states for every basic block of `subgraph`.
    pub fn analyze(&mut self, subgraph: &BasicBlockSubGraph) {
        let count = subgraph.basic_blocks.len();
        self.exit_states = vec![LivenessState::none_live(); count];

        // Bits only ever grow, so iterating to a fixed point terminates.
        let mut changed = true;
        while changed {
            changed = false;
            for index in (0..count).rev() {
                let bb = &subgraph.basic_blocks[index];
                let mut out = match bb.exit() {
                    // Flags do not survive a return and unknown successors may
                    // read anything.
                    BasicBlockExit::Return => 0,
                    BasicBlockExit::External => u32::MAX,
                    BasicBlockExit::Local => 0,
                };
                for &successor in bb.successors() {
                    out |= self.entry_state(subgraph, successor).0;
                }
                if out != self.exit_states[index].0 {
                    self.exit_states[index] = LivenessState(out);
                    changed = true;
                }
            }
        }
    }

    fn entry_state(&self, subgraph: &BasicBlockSubGraph, index: usize) -> LivenessState {
        let mut state = self.exit_states[index];
        for instruction in subgraph.basic_blocks[index].instructions.iter().rev() {
            Self::propagate_backward(instruction, &mut state);
        }
        state
    }

    /// Returns the liveness state at the exit of basic block `index`.
    ///
    /// Falls back to all-live when the block was not analyzed.
    #[must_use]
    pub fn state_at_exit_of(&self, index: usize) -> LivenessState {
        self.exit_states
            .get(index)
            .copied()
            .unwrap_or_else(LivenessState::all_live)
    }

    /// Moves `state` backward across one instruction: from live-out to live-in.
    pub fn propagate_backward(instruction: &Instruction, state: &mut LivenessState) {
        let raw = instruction.raw();
        match raw.flow_control() {
            // Flags are caller-clobbered and never parameters, so nothing is live
            // going into a call.
            FlowControl::Call | FlowControl::IndirectCall => state.0 = 0,
            // Software interrupts may inspect flags.
            FlowControl::Interrupt | FlowControl::Exception => state.0 = u32::MAX,
            _ => {
                state.0 = (state.0 & !raw.rflags_modified()) | raw.rflags_read();
            }
        }
    }
}
