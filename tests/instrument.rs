//! End-to-end instrumentation tests.
//!
//! These tests drive the full pass over crafted block graphs using the public API:
//! 1. Build a graph with code blocks, imports and (optionally) a header block
//! 2. Run [`AsanTransform::apply`]
//! 3. Verify probe call sequences, import plumbing, stubs and sections

use sanweave::{
    graph::{
        decompose, BlockGraph, BlockId, BlockKind, ImageFormat, Reference, ReferenceKind,
    },
    pass::{
        MemoryAccessInfo, MemoryAccessMode, ASAN_PARAMETERS_SECTION_NAME,
        ENTRY_POINT_REF_OFFSET, HOT_PATCHING_METADATA_SECTION_NAME, SYZYASAN_DLL,
        SYZYASAN_HP_DLL, THUNK_SECTION_NAME,
    },
    AsanParameters, AsanTransform, AsanTransformConfig, Error, Result,
};

/// `mov eax, [ebx+4]; ret`
const SIMPLE_LOAD: &[u8] = &[0x8B, 0x43, 0x04, 0xC3];

/// Builds a minimal PE graph holding one function.
fn pe_graph_with(bytes: &[u8]) -> (BlockGraph, BlockId) {
    let mut graph = BlockGraph::new(ImageFormat::Pe);
    let header = graph.add_block_with_data(BlockKind::Data, "header", vec![0u8; 64]);
    graph.set_header_block(header);
    let function = graph.add_block_with_data(BlockKind::Code, "target_function", bytes.to_vec());
    (graph, function)
}

/// Finds a block by name after the pass (merging replaces block ids).
fn block_by_name<'g>(graph: &'g BlockGraph, name: &str) -> &'g sanweave::graph::Block {
    graph
        .blocks()
        .find(|b| b.name() == name)
        .unwrap_or_else(|| panic!("no block named \"{name}\""))
}

#[test]
fn test_simple_load_instrumented_end_to_end() -> Result<()> {
    let (mut graph, _) = pe_graph_with(SIMPLE_LOAD);
    let mut transform = AsanTransform::new(AsanTransformConfig {
        use_liveness_analysis: true,
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;

    // The runtime DLL is imported with the stale-binding timestamp.
    assert_eq!(graph.pe_import_timestamp(SYZYASAN_DLL), Some(1));
    assert!(graph.find_section(THUNK_SECTION_NAME).is_some());

    // The function now starts with push edx; lea edx, [ebx+7]; call [probe].
    let function = block_by_name(&graph, "target_function");
    let subgraph = decompose(function)?;
    let instructions = &subgraph.basic_blocks[0].instructions;
    let mnemonics: Vec<_> = instructions.iter().map(|i| i.raw().mnemonic()).collect();
    assert_eq!(
        mnemonics,
        vec![
            iced_x86::Mnemonic::Push,
            iced_x86::Mnemonic::Lea,
            iced_x86::Mnemonic::Call,
            iced_x86::Mnemonic::Mov,
            iced_x86::Mnemonic::Ret,
        ]
    );
    assert_eq!(instructions[1].raw().memory_displacement32(), 7);

    // The call goes through the runtime's IAT, and flags were dead at the probe, so
    // the _no_flags variant was selected.
    let iat = graph.pe_iat_block(SYZYASAN_DLL).unwrap();
    let call_target = instructions[2].displacement_ref().unwrap();
    let expected = *transform
        .probe_reference(&MemoryAccessInfo {
            mode: MemoryAccessMode::Read,
            size: 4,
            opcode: None,
            save_flags: false,
        })
        .unwrap();
    assert_eq!(expected.block, iat);
    assert_eq!(
        call_target,
        sanweave::graph::OperandRef::Block {
            block: expected.block,
            offset: expected.offset
        }
    );

    // The targeted IAT slot initially holds a bootstrap stub reference.
    let slot = graph
        .block(iat)
        .unwrap()
        .reference(expected.offset as u32)
        .expect("IAT slot must point at a bootstrap stub");
    let stub = graph.block(slot.block).unwrap();
    assert!(stub.name().starts_with("asan_hook_stub"));

    Ok(())
}

#[test]
fn test_reinstrumentation_is_refused() -> Result<()> {
    let (mut graph, _) = pe_graph_with(SIMPLE_LOAD);
    AsanTransform::new(AsanTransformConfig::default()).apply(&mut graph)?;

    let result = AsanTransform::new(AsanTransformConfig::default()).apply(&mut graph);
    assert!(matches!(result, Err(Error::AlreadyInstrumented)));
    Ok(())
}

#[test]
fn test_rate_zero_leaves_instruction_streams_alone() -> Result<()> {
    let (mut graph, _) = pe_graph_with(SIMPLE_LOAD);
    let mut transform = AsanTransform::new(AsanTransformConfig {
        instrumentation_rate: 0.0,
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;

    // Import and .thunks plumbing happens, but the function bytes are untouched.
    assert!(graph.find_section(THUNK_SECTION_NAME).is_some());
    let function = block_by_name(&graph, "target_function");
    assert_eq!(function.data(), SIMPLE_LOAD);
    Ok(())
}

#[test]
fn test_string_instruction_gets_bare_probe_call() -> Result<()> {
    // rep movsd; ret
    let (mut graph, _) = pe_graph_with(&[0xF3, 0xA5, 0xC3]);
    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    transform.apply(&mut graph)?;

    let function = block_by_name(&graph, "target_function");
    let subgraph = decompose(function)?;
    let instructions = &subgraph.basic_blocks[0].instructions;
    let mnemonics: Vec<_> = instructions.iter().map(|i| i.raw().mnemonic()).collect();
    // No push/lea before the probe call for string instructions.
    assert_eq!(
        mnemonics,
        vec![
            iced_x86::Mnemonic::Call,
            iced_x86::Mnemonic::Movsd,
            iced_x86::Mnemonic::Ret,
        ]
    );
    Ok(())
}

#[test]
fn test_coff_probe_calls_are_direct() -> Result<()> {
    let mut graph = BlockGraph::new(ImageFormat::Coff);
    graph.add_block_with_data(BlockKind::Code, "f", SIMPLE_LOAD.to_vec());

    let mut transform = AsanTransform::new(AsanTransformConfig {
        use_liveness_analysis: true,
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;

    // COFF mode emits no stubs and no .thunks section; probes are symbols.
    assert!(graph.find_section(THUNK_SECTION_NAME).is_none());
    assert!(graph.coff_symbol_exists("_asan_check_4_byte_read_access_no_flags"));

    let function = block_by_name(&graph, "f");
    let subgraph = decompose(function)?;
    let call = subgraph.basic_blocks[0]
        .instructions
        .iter()
        .find(|i| i.raw().mnemonic() == iced_x86::Mnemonic::Call)
        .expect("probe call");
    // A direct rel32 call carrying a symbol reference, not an IAT indirection.
    assert_eq!(call.raw().op0_kind(), iced_x86::OpKind::NearBranch32);
    assert!(call.immediate_ref().is_some());
    Ok(())
}

#[test]
fn test_heap_init_patched_end_to_end() -> Result<()> {
    use sanweave::graph::{add_imports, ImportedModule, SymbolMode};

    let (mut graph, _) = pe_graph_with(SIMPLE_LOAD);
    let mut kernel32 = ImportedModule::new("kernel32.dll");
    let gph = kernel32.add_symbol("GetProcessHeap", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut kernel32)?;
    let gph_ref = kernel32.symbol_reference(gph)?;

    let heap_init =
        graph.add_block_with_data(BlockKind::Code, "__acrt_initialize_heap", vec![0u8; 16]);
    graph.block_mut(heap_init).unwrap().set_reference(4, gph_ref);

    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    transform.apply(&mut graph)?;

    // The heap-init block is in the skip set, and its GetProcessHeap reference now
    // goes through the replacement data block.
    let patched = *graph.block(heap_init).unwrap().reference(4).unwrap();
    assert_ne!(patched, gph_ref);
    let data_block = graph.block(patched.block).unwrap();
    assert_eq!(data_block.name(), "asan_get_process_heap_replacement_data");

    // The replacement thunk calls the runtime's HeapCreate wrapper.
    let thunk = graph.block(data_block.reference(0).unwrap().block).unwrap();
    let thunk_graph = decompose(thunk)?;
    let rtl_iat = graph.pe_iat_block(SYZYASAN_DLL).unwrap();
    let call = thunk_graph.basic_blocks[0]
        .instructions
        .iter()
        .find(|i| i.raw().mnemonic() == iced_x86::Mnemonic::Call)
        .expect("HeapCreate call");
    match call.displacement_ref().unwrap() {
        sanweave::graph::OperandRef::Block { block, .. } => assert_eq!(block, rtl_iat),
        other => panic!("unexpected call target {other:?}"),
    }
    Ok(())
}

#[test]
fn test_parameters_are_embedded() -> Result<()> {
    let (mut graph, _) = pe_graph_with(SIMPLE_LOAD);
    let mut transform = AsanTransform::new(AsanTransformConfig {
        asan_parameters: Some(AsanParameters {
            quarantine_size: 1 << 20,
            ..AsanParameters::default()
        }),
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;

    let block_id = transform.parameters_block().expect("parameters block");
    let section = graph.find_section(ASAN_PARAMETERS_SECTION_NAME).unwrap();
    let block = graph.block(block_id).unwrap();
    assert_eq!(block.section(), Some(section.id()));
    // quarantine_size lands at offset 8 of the flat record.
    assert_eq!(
        u32::from_le_bytes(block.data()[8..12].try_into().unwrap()),
        1 << 20
    );
    Ok(())
}

#[test]
fn test_hot_patching_mode_prepares_blocks() -> Result<()> {
    let (mut graph, function) = pe_graph_with(SIMPLE_LOAD);
    // Give the header an entry-point reference for the entry-thunk rewrite.
    let header = graph.header_block().unwrap();
    graph.block_mut(header).unwrap().set_reference(
        ENTRY_POINT_REF_OFFSET,
        Reference::new(ReferenceKind::Absolute, 4, function, 0),
    );

    let mut transform = AsanTransform::new(AsanTransformConfig {
        hot_patching: true,
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;

    // The hot-patching runtime is imported (stale-bound) and the entry point is
    // redirected through the entry thunk.
    assert_eq!(graph.pe_import_timestamp(SYZYASAN_HP_DLL), Some(1));
    let entry_ref = graph
        .block(header)
        .unwrap()
        .reference(ENTRY_POINT_REF_OFFSET)
        .unwrap();
    assert_eq!(
        graph.block(entry_ref.block).unwrap().name(),
        "asan_entry_thunk"
    );

    // The access-bearing block was prepared, but no probe call was emitted.
    assert_eq!(transform.hot_patched_blocks().len(), 1);
    let prepared = graph.block(transform.hot_patched_blocks()[0]).unwrap();
    assert_eq!(prepared.name(), "target_function");
    let subgraph = decompose(prepared)?;
    assert_eq!(subgraph.basic_blocks[0].instructions.len(), 2);

    // The metadata record lists the prepared block.
    let metadata_section = graph
        .find_section(HOT_PATCHING_METADATA_SECTION_NAME)
        .expect("hot-patch metadata section");
    let metadata = graph
        .blocks()
        .find(|b| b.section() == Some(metadata_section.id()))
        .unwrap();
    assert_eq!(
        u32::from_le_bytes(metadata.data()[4..8].try_into().unwrap()),
        1
    );
    assert_eq!(metadata.reference(8).unwrap().block, prepared.id());
    Ok(())
}
