//! Memory-access classification and probe naming.
//!
//! [`decode_memory_access`] inspects one decoded instruction and reports whether it
//! touches memory, in what mode, and through which operand form. The resulting
//! [`MemoryAccessInfo`] keys the probe table: each distinct shape of access maps to
//! one runtime probe whose mangled name [`MemoryAccessInfo::probe_name`] produces.

use std::cmp::Ordering;

use iced_x86::{InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register};
use strum::EnumIter;

use crate::{
    graph::{Displacement, ImageFormat, Instruction, Operand, OperandRef},
    Error, Result,
};

/// The kind of memory access an instruction performs.
///
/// "No access" is expressed by [`decode_memory_access`] returning `None` rather than
/// by a variant here, so the probe table never sees a null mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryAccessMode {
    /// A plain load.
    Read,
    /// A plain store.
    Write,
    /// A string instruction without a repeat prefix.
    Instr,
    /// A string instruction under `REP`/`REPZ`.
    RepZ,
    /// A string instruction under `REPNZ`.
    RepNZ,
}

/// The string instructions that get dedicated probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter)]
pub enum StringOp {
    /// `CMPS`
    Cmps,
    /// `LODS`
    Lods,
    /// `MOVS`
    Movs,
    /// `STOS`
    Stos,
}

impl StringOp {
    /// Returns the lower-case mnemonic text used in probe names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cmps => "cmps",
            Self::Lods => "lods",
            Self::Movs => "movs",
            Self::Stos => "stos",
        }
    }

    fn from_mnemonic(mnemonic: Mnemonic) -> Option<Self> {
        match mnemonic {
            Mnemonic::Cmpsb | Mnemonic::Cmpsw | Mnemonic::Cmpsd | Mnemonic::Cmpsq => {
                Some(Self::Cmps)
            }
            Mnemonic::Lodsb | Mnemonic::Lodsw | Mnemonic::Lodsd | Mnemonic::Lodsq => {
                Some(Self::Lods)
            }
            Mnemonic::Movsb | Mnemonic::Movsw | Mnemonic::Movsd | Mnemonic::Movsq => {
                Some(Self::Movs)
            }
            Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq => {
                Some(Self::Stos)
            }
            _ => None,
        }
    }
}

/// The shape of one memory access; the key of the probe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAccessInfo {
    /// Access mode.
    pub mode: MemoryAccessMode,
    /// Access size in bytes.
    pub size: u8,
    /// The string operation, populated only for `Instr`/`RepZ`/`RepNZ` modes.
    pub opcode: Option<StringOp>,
    /// Whether the probe must preserve `EFLAGS`.
    pub save_flags: bool,
}

impl MemoryAccessInfo {
    /// Returns the mangled name of the probe that checks this access.
    ///
    /// The shape is `[prefix]asan_check[rep]_<size>_byte_<op>_access[nf]`, where the
    /// prefix is a single underscore for COFF (decorated C name) and empty for PE.
    #[must_use]
    pub fn probe_name(&self, format: ImageFormat) -> String {
        let prefix = match format {
            ImageFormat::Pe => "",
            ImageFormat::Coff => "_",
        };
        let rep = match self.mode {
            MemoryAccessMode::RepZ => "_repz",
            MemoryAccessMode::RepNZ => "_repnz",
            _ => "",
        };
        let op = match (self.mode, self.opcode) {
            (MemoryAccessMode::Read, _) => "read",
            (MemoryAccessMode::Write, _) => "write",
            (_, Some(opcode)) => opcode.name(),
            // Unreachable by construction; the table is enumerated with opcodes.
            (_, None) => "unknown",
        };
        let no_flags = if self.save_flags { "" } else { "_no_flags" };
        format!(
            "{prefix}asan_check{rep}_{}_byte_{op}_access{no_flags}",
            self.size
        )
    }
}

// The table key order is lexicographic on (mode, size, save_flags, opcode); it is
// spelled out rather than derived so the key order is part of the interface.
impl Ord for MemoryAccessInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mode
            .cmp(&other.mode)
            .then(self.size.cmp(&other.size))
            .then(self.save_flags.cmp(&other.save_flags))
            .then(self.opcode.cmp(&other.opcode))
    }
}

impl PartialOrd for MemoryAccessInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns whether an opcode is exempt from instrumentation.
///
/// `LEA` does not access memory; prefetch and cache-line flushes are advisory, and
/// any error they would surface shows up when the memory is actually touched.
#[must_use]
pub fn is_exempt_opcode(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Lea
            | Mnemonic::Clflush
            | Mnemonic::Prefetch
            | Mnemonic::Prefetchnta
            | Mnemonic::Prefetcht0
            | Mnemonic::Prefetcht1
            | Mnemonic::Prefetcht2
            | Mnemonic::Prefetchw
    )
}

/// Classifies the memory access of one instruction, if any.
///
/// Returns the operand form (with the displacement adjusted to address the *last*
/// byte touched) and the access shape, or `None` when the instruction does not
/// access memory in an instrumentable way.
///
/// # Errors
///
/// Returns [`Error::Decode`] for a scaled-index operand with no base and no
/// displacement field, which no decoder should produce.
pub fn decode_memory_access(
    instruction: &Instruction,
) -> Result<Option<(Operand, MemoryAccessInfo)>> {
    let raw = instruction.raw();

    // NOPs often name registers or memory, but nothing is accessed.
    if raw.mnemonic() == Mnemonic::Nop {
        return Ok(None);
    }

    // String instructions use implicit ESI/EDI-based operands and dedicated probes.
    if raw.is_string_instruction() {
        if let Some(opcode) = StringOp::from_mnemonic(raw.mnemonic()) {
            let size = raw.memory_size().size() as u8;
            let mode = if raw.has_repne_prefix() {
                MemoryAccessMode::RepNZ
            } else if raw.has_rep_prefix() {
                MemoryAccessMode::RepZ
            } else {
                MemoryAccessMode::Instr
            };
            // MOVS and CMPS name two memory operands; both use the instruction's
            // single memory size, so the operand sizes agree by construction. The
            // first memory operand wins.
            let base = implicit_string_base(raw)?;
            let operand =
                Operand::base_disp(base, Displacement::new(i32::from(size) - 1));
            return Ok(Some((
                operand,
                MemoryAccessInfo {
                    mode,
                    size,
                    opcode: Some(opcode),
                    save_flags: true,
                },
            )));
        }
        // SCAS/INS/OUTS take no dedicated probe and are not instrumented.
        return Ok(None);
    }

    // Standard instructions: scan operands 0 and 1 for an explicit memory operand.
    let op_count = raw.op_count().min(2);
    let Some(mem_op) = (0..op_count).find(|&i| raw.op_kind(i) == OpKind::Memory) else {
        return Ok(None);
    };

    let base = raw.memory_base();
    let index = raw.memory_index();
    if base == Register::None && index == Register::None {
        // A direct absolute address; these land on globals, which instrumentation
        // has nothing to say about.
        return Ok(None);
    }

    let size = raw.memory_size().size() as u8;

    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(raw);
    let access = if mem_op == 0 {
        info.op0_access()
    } else {
        info.op1_access()
    };
    let written = matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    );
    let mode = if written && mem_op == 0 {
        MemoryAccessMode::Write
    } else {
        MemoryAccessMode::Read
    };

    // Point the displacement at the last byte touched; a displacement that carries a
    // reference keeps the reference and adjusts its offset instead.
    let last_byte = (i32::from(size) - 1).max(0);
    let displacement = match instruction.displacement_ref() {
        Some(OperandRef::Block { block, offset }) => {
            Displacement::with_block(block, offset + last_byte)
        }
        Some(OperandRef::BasicBlock(index)) => Displacement::with_basic_block(index),
        None => Displacement::new((raw.memory_displacement32() as i32).wrapping_add(last_byte)),
    };

    let operand = match (base, index) {
        (base, Register::None) => Operand::base_disp(base, displacement),
        (Register::None, index) => {
            if raw.memory_displ_size() == 0 && instruction.displacement_ref().is_none() {
                return Err(Error::Decode {
                    message: "scaled-index operand without base or displacement".to_string(),
                    offset: raw.ip() as u32,
                });
            }
            Operand::index_disp(index, raw.memory_index_scale(), displacement)
        }
        (base, index) => {
            Operand::base_index_disp(base, index, raw.memory_index_scale(), displacement)
        }
    };

    Ok(Some((
        operand,
        MemoryAccessInfo {
            mode,
            size,
            opcode: None,
            save_flags: true,
        },
    )))
}

/// Returns the implicit base register of the first memory operand of a string
/// instruction.
fn implicit_string_base(raw: &iced_x86::Instruction) -> Result<Register> {
    for i in 0..raw.op_count() {
        match raw.op_kind(i) {
            OpKind::MemorySegSI | OpKind::MemorySegESI | OpKind::MemorySegRSI => {
                return Ok(Register::ESI)
            }
            OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI => {
                return Ok(Register::EDI)
            }
            _ => {}
        }
    }
    Err(Error::Decode {
        message: "string instruction without an implicit memory operand".to_string(),
        offset: raw.ip() as u32,
    })
}
