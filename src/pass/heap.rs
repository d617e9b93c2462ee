//! CRT heap-initialization patching.
//!
//! Since VS2012 the CRT defers its allocations to the OS process heap; the runtime
//! library wants to own every allocation instead. The heap-init functions are found
//! by name, and their `GetProcessHeap` references are rewritten to a thunk that
//! calls `HeapCreate(0, 0x1000, 0)`. Because `GetProcessHeap` is reached through an
//! IAT slot, the thunk is paired with a 4-byte data block holding its address and
//! the rewrite targets that data block, keeping every call site's indirection
//! intact.

use log::{debug, error, warn};

use crate::{
    graph::{
        add_imports, BlockAssembler, BlockBuilder, BlockGraph, BlockId, BlockKind,
        ImportedModule, Reference, ReferenceKind, SectionCharacteristics, SymbolMode,
    },
    pass::probes::THUNK_SECTION_NAME,
    Error, Result,
};

/// Name of the `GetProcessHeap` replacement thunk.
const REPLACEMENT_NAME: &str = "asan_get_process_heap_replacement";

/// Finds the CRT heap-initialization blocks of an image.
///
/// VS2012 names the function `_heap_init`, VS2015 `_acrt_initialize_heap`; both are
/// matched by substring so decorated variants are caught too.
#[must_use]
pub fn find_heap_init_blocks(graph: &BlockGraph) -> Vec<BlockId> {
    graph
        .blocks()
        .filter(|block| {
            block.name().contains("_heap_init") || block.name().contains("_acrt_initialize_heap")
        })
        .map(|block| block.id())
        .collect()
}

/// Rewrites `GetProcessHeap` references of the heap-init blocks to a private
/// `HeapCreate(0, 0x1000, 0)` thunk.
///
/// `heap_create_dll` is the module exporting the `HeapCreate` to call: the runtime
/// DLL (as `asan_HeapCreate`) normally, `kernel32.dll` in hot-patching mode. When
/// that module is not kernel32 itself, `GetProcessHeap` is still looked up in
/// kernel32.
pub fn patch_crt_heap_initialization(
    graph: &mut BlockGraph,
    heap_create_dll: &str,
    heap_create_function: &str,
    heap_init_blocks: &[BlockId],
) -> Result<()> {
    const KERNEL32: &str = "kernel32.dll";

    let mut heap_create_module = ImportedModule::new(heap_create_dll);
    let heap_create_index =
        heap_create_module.add_symbol(heap_create_function, SymbolMode::AlwaysImport);

    // GetProcessHeap lives in kernel32; reuse the HeapCreate module when it is
    // kernel32 already.
    let same_module = heap_create_dll.eq_ignore_ascii_case(KERNEL32);
    let mut kernel32_module = if same_module {
        None
    } else {
        Some(ImportedModule::new(KERNEL32))
    };
    let get_process_heap_index = match kernel32_module.as_mut() {
        Some(module) => module.add_symbol("GetProcessHeap", SymbolMode::FindOnly),
        None => heap_create_module.add_symbol("GetProcessHeap", SymbolMode::FindOnly),
    };

    add_imports(graph, &mut heap_create_module).map_err(|e| {
        error!("unable to add or find the imports required to patch the CRT heap initialization: {e}");
        e
    })?;
    if let Some(module) = kernel32_module.as_mut() {
        add_imports(graph, module)?;
    }

    let lookup_module = kernel32_module.as_ref().unwrap_or(&heap_create_module);
    if !lookup_module.symbol_is_imported(get_process_heap_index) {
        // Nothing references GetProcessHeap through the import table; there is
        // nothing to rewrite.
        warn!("heap-init blocks present but GetProcessHeap is not imported; skipping patch");
        return Ok(());
    }
    let get_process_heap_ref = lookup_module.symbol_reference(get_process_heap_index)?;
    let heap_create_ref = heap_create_module.symbol_reference(heap_create_index)?;

    let replacement = create_get_process_heap_replacement(graph, heap_create_ref)?;
    let new_ref = Reference::new(
        ReferenceKind::Absolute,
        get_process_heap_ref.size,
        replacement,
        0,
    );

    for &block_id in heap_init_blocks {
        let block = graph.expect_block(block_id)?;
        debug!("patching {}", block.name());
        let offsets: Vec<u32> = block
            .references()
            .filter(|(_, r)| **r == get_process_heap_ref)
            .map(|(offset, _)| offset)
            .collect();
        let block = graph.expect_block_mut(block_id)?;
        for offset in offsets {
            block.set_reference(offset, new_ref);
        }
    }

    Ok(())
}

/// Builds the `HeapCreate(0, 0x1000, 0)` thunk and the data block that points at
/// it, returning the data block.
///
/// The thunk has the same signature as `GetProcessHeap`; the data block exists so
/// call sites that went `call [IAT slot]` keep one level of indirection.
fn create_get_process_heap_replacement(
    graph: &mut BlockGraph,
    heap_create_ref: Reference,
) -> Result<BlockId> {
    let section = graph.find_or_add_section(THUNK_SECTION_NAME, SectionCharacteristics::code());

    let mut instructions = Vec::new();
    let mut asm = BlockAssembler::new(&mut instructions);
    // Arguments are pushed right to left: HeapCreate(0, 0x1000, 0).
    asm.push_imm32(0)?;
    asm.push_imm32(0x1000)?;
    asm.push_imm32(0)?;
    asm.call_indirect(heap_create_ref.block, heap_create_ref.offset)?;
    asm.ret()?;

    let mut builder = BlockBuilder::new(graph);
    let code_block = builder
        .build_code_block(REPLACEMENT_NAME, section, &instructions)
        .map_err(|e| {
            error!("failed to build thunk block: {e}");
            Error::ThunkBuildFailure(e.to_string())
        })?;

    let data_block = graph.add_block_with_data(
        BlockKind::Data,
        format!("{REPLACEMENT_NAME}_data"),
        vec![0u8; 4],
    );
    {
        let block = graph.expect_block_mut(data_block)?;
        block.set_section(section);
        block.set_reference(0, Reference::new(ReferenceKind::Absolute, 4, code_block, 0));
    }

    Ok(data_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ImageFormat;

    #[test]
    fn test_find_heap_init_blocks() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let a = graph.add_block(BlockKind::Code, "__heap_init");
        let b = graph.add_block(BlockKind::Code, "__acrt_initialize_heap");
        let _ = graph.add_block(BlockKind::Code, "main");
        let found = find_heap_init_blocks(&graph);
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn test_patch_rewrites_get_process_heap_references() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        // The image imports kernel32!GetProcessHeap already.
        let mut kernel32 = ImportedModule::new("kernel32.dll");
        let gph = kernel32.add_symbol("GetProcessHeap", SymbolMode::AlwaysImport);
        add_imports(&mut graph, &mut kernel32).unwrap();
        let gph_ref = kernel32.symbol_reference(gph).unwrap();

        let heap_init = graph.add_block_with_data(BlockKind::Code, "__heap_init", vec![0u8; 16]);
        graph
            .block_mut(heap_init)
            .unwrap()
            .set_reference(4, gph_ref);

        patch_crt_heap_initialization(
            &mut graph,
            "syzyasan_rtl.dll",
            "asan_HeapCreate",
            &[heap_init],
        )
        .unwrap();

        // The reference now goes to the replacement data block, which in turn
        // points at the HeapCreate thunk.
        let patched = *graph.block(heap_init).unwrap().reference(4).unwrap();
        assert_ne!(patched, gph_ref);
        let data_block = graph.block(patched.block).unwrap();
        assert_eq!(data_block.name(), "asan_get_process_heap_replacement_data");
        let thunk_ref = data_block.reference(0).unwrap();
        assert_eq!(
            graph.block(thunk_ref.block).unwrap().name(),
            "asan_get_process_heap_replacement"
        );

        // And the runtime's HeapCreate is imported.
        assert!(graph.pe_iat_block("syzyasan_rtl.dll").is_some());
    }

    #[test]
    fn test_patch_without_import_is_a_no_op() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let heap_init = graph.add_block_with_data(BlockKind::Code, "__heap_init", vec![0u8; 8]);
        patch_crt_heap_initialization(
            &mut graph,
            "syzyasan_rtl.dll",
            "asan_HeapCreate",
            &[heap_init],
        )
        .unwrap();
        assert!(graph.block(heap_init).unwrap().references().count() == 0);
    }
}
