//! Probe enumeration, import, and IAT bootstrap stubs.
//!
//! Every access shape the instrumenter can produce needs a probe import before any
//! block is rewritten. On PE images the probes arrive as imports from the runtime
//! DLL, whose import descriptor is stamped with timestamp 1 ("bound long ago") so
//! the loader trusts the IAT values already present; those values point at tiny
//! bootstrap stubs emitted here, keeping probe call sites harmless until the real
//! binding happens. On COFF images probes are plain external symbols and the linker
//! provides the bodies, so no stubs are needed.

use std::collections::BTreeMap;

use iced_x86::Register;
use log::error;
use strum::IntoEnumIterator;

use crate::{
    graph::{
        add_imports, BlockAssembler, BlockBuilder, BlockGraph, Displacement, ImageFormat,
        ImportedModule, Operand, Reference, ReferenceKind, SectionCharacteristics, SymbolMode,
    },
    pass::access::{MemoryAccessInfo, MemoryAccessMode, StringOp},
    Error, Result,
};

/// Timestamp 1 is 1970-01-01 00:00:01Z. Stamped into the runtime DLL's import
/// descriptor it reads as a stale binding, which makes the loader use the
/// pre-written IAT values (the bootstrap stubs) until it rebinds the module.
/// Must stay bit-exact for the runtime's early-loader behavior.
pub const DATE_IN_THE_PAST: u32 = 1;

/// Name of the section all emitted stubs and thunks live in.
pub const THUNK_SECTION_NAME: &str = ".thunks";

/// Name prefix of the IAT bootstrap stubs.
pub const ASAN_HOOK_STUB_NAME: &str = "asan_hook_stub";

/// The probe reference table: one resolvable reference per access shape.
#[derive(Debug, Default)]
pub struct ProbeTable {
    probes: BTreeMap<MemoryAccessInfo, Reference>,
}

impl ProbeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a probe reference for an access shape.
    pub fn insert(&mut self, info: MemoryAccessInfo, reference: Reference) {
        self.probes.insert(info, reference);
    }

    /// Looks up the probe for an access shape.
    #[must_use]
    pub fn get(&self, info: &MemoryAccessInfo) -> Option<&Reference> {
        self.probes.get(info)
    }

    /// Returns the number of registered probes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Iterates over `(info, reference)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&MemoryAccessInfo, &Reference)> {
        self.probes.iter()
    }
}

/// Enumerates every probe variant an image may need.
///
/// Read/write probes exist for sizes 1 through 32 plus the 10-byte FPU operand,
/// each with a `_no_flags` twin when liveness analysis is enabled. String probes
/// exist for sizes 1, 2 and 4 in both plain and `repz` forms and always preserve
/// flags.
#[must_use]
pub fn enumerate_probe_variants(use_liveness_analysis: bool) -> Vec<MemoryAccessInfo> {
    let mut variants = Vec::new();

    let mut push_read_write = |size: u8| {
        for mode in [MemoryAccessMode::Read, MemoryAccessMode::Write] {
            let info = MemoryAccessInfo {
                mode,
                size,
                opcode: None,
                save_flags: true,
            };
            variants.push(info);
            if use_liveness_analysis {
                variants.push(MemoryAccessInfo {
                    save_flags: false,
                    ..info
                });
            }
        }
    };

    let mut size = 1u8;
    while size <= 32 {
        push_read_write(size);
        size *= 2;
    }
    push_read_write(10);

    for size in [1u8, 2, 4] {
        for opcode in StringOp::iter() {
            for mode in [MemoryAccessMode::RepZ, MemoryAccessMode::Instr] {
                variants.push(MemoryAccessInfo {
                    mode,
                    size,
                    opcode: Some(opcode),
                    save_flags: true,
                });
            }
        }
    }

    variants
}

/// Imports all probe variants from the runtime DLL and returns the probe table.
///
/// On PE images this also emits the two bootstrap stubs into `.thunks` and points
/// every probe's IAT slot at the appropriate stub.
///
/// # Errors
///
/// Returns [`Error::ImportFailure`] when the import transform fails and
/// [`Error::ThunkBuildFailure`] when a stub cannot be built.
pub fn import_probes(
    graph: &mut BlockGraph,
    runtime_dll: &str,
    use_liveness_analysis: bool,
) -> Result<ProbeTable> {
    let format = graph.image_format();
    let variants = enumerate_probe_variants(use_liveness_analysis);

    // PE call sites reference IAT slots directly, so the slots must hold something
    // callable from the moment the image starts executing.
    let stubs = if format == ImageFormat::Pe {
        let load_store = create_probe_stub(graph, MemoryAccessMode::Read)?;
        let instr = create_probe_stub(graph, MemoryAccessMode::Instr)?;
        Some((load_store, instr))
    } else {
        None
    };

    let mut module = ImportedModule::with_timestamp(runtime_dll, DATE_IN_THE_PAST);
    let symbol_indices: Vec<usize> = variants
        .iter()
        .map(|info| module.add_symbol(info.probe_name(format), SymbolMode::AlwaysImport))
        .collect();

    add_imports(graph, &mut module).map_err(|e| {
        error!("unable to add imports for the Asan runtime DLL: {e}");
        e
    })?;

    let mut table = ProbeTable::new();
    for (info, symbol) in variants.into_iter().zip(symbol_indices) {
        let reference = module.symbol_reference(symbol)?;

        if let Some((load_store, instr)) = stubs {
            let stub = match info.mode {
                MemoryAccessMode::Read | MemoryAccessMode::Write => load_store,
                _ => instr,
            };
            graph
                .expect_block_mut(reference.block)?
                .set_reference(reference.offset as u32, stub);
        }

        table.insert(info, reference);
    }

    Ok(table)
}

/// Builds one IAT bootstrap stub and returns an absolute reference to it.
///
/// The load/store stub undoes the probe calling convention (restores `EDX` from the
/// stack and returns with a 4-byte cleanup); the string-instruction stub is a bare
/// return, since those probes receive no arguments.
fn create_probe_stub(graph: &mut BlockGraph, mode: MemoryAccessMode) -> Result<Reference> {
    let section = graph.find_or_add_section(THUNK_SECTION_NAME, SectionCharacteristics::code());
    let name = format!("{ASAN_HOOK_STUB_NAME}{}", mode as u8);

    let mut instructions = Vec::new();
    let mut asm = BlockAssembler::new(&mut instructions);
    match mode {
        MemoryAccessMode::Read | MemoryAccessMode::Write => {
            asm.mov(
                Register::EDX,
                &Operand::base_disp(Register::ESP, Displacement::new(4)),
            )?;
            asm.ret_imm(4)?;
        }
        _ => {
            asm.ret()?;
        }
    }

    let mut builder = BlockBuilder::new(graph);
    let thunk = builder
        .build_code_block(&name, section, &instructions)
        .map_err(|e| {
            error!("failed to build probe stub \"{name}\": {e}");
            Error::ThunkBuildFailure(e.to_string())
        })?;

    Ok(Reference::new(ReferenceKind::Absolute, 4, thunk, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_counts() {
        // 7 sizes x {read, write} plus 12 string shapes x {repz, instr}.
        assert_eq!(enumerate_probe_variants(false).len(), 14 + 24);
        // Liveness doubles the read/write set with _no_flags twins.
        assert_eq!(enumerate_probe_variants(true).len(), 28 + 24);
    }

    #[test]
    fn test_variant_names_are_unique() {
        let variants = enumerate_probe_variants(true);
        let mut names: Vec<String> = variants
            .iter()
            .map(|v| v.probe_name(ImageFormat::Pe))
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), variants.len());
    }

    #[test]
    fn test_import_probes_pe_installs_stubs() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let table = import_probes(&mut graph, "syzyasan_rtl.dll", true).unwrap();
        assert_eq!(table.len(), 52);
        assert_eq!(graph.pe_import_timestamp("syzyasan_rtl.dll"), Some(1));
        assert!(graph.find_section(THUNK_SECTION_NAME).is_some());

        // Every IAT slot initially points at one of the two stubs.
        let iat = graph.pe_iat_block("syzyasan_rtl.dll").unwrap();
        let mut stub_targets = std::collections::BTreeSet::new();
        for (info, reference) in table.iter() {
            assert_eq!(reference.block, iat);
            let slot = graph
                .block(iat)
                .unwrap()
                .reference(reference.offset as u32)
                .expect("IAT slot must hold a stub reference");
            stub_targets.insert((slot.block, matches!(
                info.mode,
                MemoryAccessMode::Read | MemoryAccessMode::Write
            )));
        }
        // Load/store shapes share one stub, string shapes the other.
        assert_eq!(stub_targets.len(), 2);
    }

    #[test]
    fn test_import_probes_coff_has_no_stubs() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        let table = import_probes(&mut graph, "syzyasan_rtl.dll", false).unwrap();
        assert_eq!(table.len(), 38);
        assert!(graph.find_section(THUNK_SECTION_NAME).is_none());
        assert!(graph.coff_symbol_exists("_asan_check_4_byte_read_access"));
    }
}
