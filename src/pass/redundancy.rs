//! Redundant memory access elimination.
//!
//! A check is redundant when every path to it already checked the same
//! `[base + disp]` location with at least the same coverage. The state tracks, per
//! base register, the set of `(displacement, size)` pairs known to be checked;
//! redefining a base register drops its entries and a call drops everything (the
//! callee may unmap or free what was checked).
//!
//! The analysis is forward: block entry states are the intersection of predecessor
//! exit states, and the instrumenter replays [`MemoryAccessState::propagate_forward`]
//! instruction by instruction while it walks a block.

use iced_x86::{FlowControl, InstructionInfoFactory, OpAccess, Register};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    graph::{BasicBlockSubGraph, Instruction},
    pass::access::{decode_memory_access, MemoryAccessMode},
};

/// The set of memory locations already checked on every path to one program point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryAccessState {
    accesses: FxHashMap<Register, FxHashSet<(i32, u8)>>,
}

impl MemoryAccessState {
    /// Creates an empty state (nothing checked).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `instruction` performs an access not yet covered by an
    /// earlier check on this path.
    ///
    /// Instructions without a classifiable access return `false` (nothing to
    /// check); accesses the state cannot model (scaled-index forms, operand
    /// references, string instructions) always return `true`.
    #[must_use]
    pub fn has_non_redundant_access(&self, instruction: &Instruction) -> bool {
        let Ok(Some((operand, info))) = decode_memory_access(instruction) else {
            return false;
        };
        if !matches!(info.mode, MemoryAccessMode::Read | MemoryAccessMode::Write) {
            return true;
        }
        let Some(key) = Self::access_key(&operand) else {
            return true;
        };
        !self
            .accesses
            .get(&key.0)
            .is_some_and(|set| set.contains(&(key.1, info.size)))
    }

    /// Moves the state forward across one instruction.
    pub fn propagate_forward(&mut self, instruction: &Instruction) {
        let raw = instruction.raw();

        // Calls invalidate everything: the callee can free or unmap checked memory.
        if matches!(
            raw.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall | FlowControl::Interrupt
        ) {
            self.accesses.clear();
            return;
        }

        // Record the access this instruction performs.
        if let Ok(Some((operand, info))) = decode_memory_access(instruction) {
            if matches!(info.mode, MemoryAccessMode::Read | MemoryAccessMode::Write) {
                if let Some((base, displacement)) = Self::access_key(&operand) {
                    self.accesses
                        .entry(base)
                        .or_default()
                        .insert((displacement, info.size));
                }
            }
        }

        // Drop entries keyed on registers this instruction redefines.
        let mut factory = InstructionInfoFactory::new();
        for used in factory.info(raw).used_registers() {
            if matches!(
                used.access(),
                OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            ) {
                self.accesses.remove(&used.register().full_register32());
            }
        }
    }

    /// Intersects this state with another: only locations checked on both paths
    /// survive.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut accesses = FxHashMap::default();
        for (register, set) in &self.accesses {
            if let Some(other_set) = other.accesses.get(register) {
                let common: FxHashSet<(i32, u8)> =
                    set.intersection(other_set).copied().collect();
                if !common.is_empty() {
                    accesses.insert(*register, common);
                }
            }
        }
        Self { accesses }
    }

    /// Extracts the `(base, displacement)` key of a simple operand, if the state
    /// can model it.
    fn access_key(operand: &crate::graph::Operand) -> Option<(Register, i32)> {
        if operand.index_register().is_some() {
            return None;
        }
        let base = operand.base_register()?;
        let displacement = match operand.displacement() {
            Some(d) if d.reference().is_some() => return None,
            Some(d) => d.value(),
            None => 0,
        };
        Some((base, displacement))
    }
}

/// Per-subgraph redundant-access analysis: entry states per basic block.
#[derive(Debug, Default)]
pub struct MemoryAccessAnalysis {
    entry_states: Vec<Option<MemoryAccessState>>,
}

impl MemoryAccessAnalysis {
    /// Creates an empty analysis.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes entry states for every basic block of `subgraph`.
    pub fn analyze(&mut self, subgraph: &BasicBlockSubGraph) {
        let count = subgraph.basic_blocks.len();
        self.entry_states = vec![None; count];
        if count == 0 {
            return;
        }

        self.entry_states[0] = Some(MemoryAccessState::new());
        let mut worklist = vec![0usize];
        while let Some(index) = worklist.pop() {
            let Some(entry) = self.entry_states[index].clone() else {
                continue;
            };
            let mut state = entry;
            for instruction in &subgraph.basic_blocks[index].instructions {
                state.propagate_forward(instruction);
            }
            for &successor in subgraph.basic_blocks[index].successors() {
                let merged = match &self.entry_states[successor] {
                    None => state.clone(),
                    Some(existing) => existing.intersect(&state),
                };
                if self.entry_states[successor].as_ref() != Some(&merged) {
                    self.entry_states[successor] = Some(merged);
                    worklist.push(successor);
                }
            }
        }
    }

    /// Returns the state at the entry of basic block `index`.
    ///
    /// Unreached or unanalyzed blocks get the empty state (nothing redundant).
    #[must_use]
    pub fn state_at_entry_of(&self, index: usize) -> MemoryAccessState {
        self.entry_states
            .get(index)
            .and_then(Clone::clone)
            .unwrap_or_default()
    }
}
