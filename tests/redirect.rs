//! Interceptor redirection tests over the full pass.

use sanweave::{
    graph::{
        add_imports, BlockGraph, BlockKind, ImageFormat, ImportedModule, Reference,
        ReferenceKind, SymbolMode,
    },
    pass::SYZYASAN_DLL,
    AsanTransform, AsanTransformConfig, Error, Result,
};

#[test]
fn test_imported_intercept_redirected_through_pass() -> Result<()> {
    let mut graph = BlockGraph::new(ImageFormat::Pe);

    // The image imports kernel32!HeapAlloc and calls through its IAT slot.
    let mut kernel32 = ImportedModule::new("kernel32.dll");
    let heap_alloc = kernel32.add_symbol("HeapAlloc", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut kernel32)?;
    let original_slot = kernel32.symbol_reference(heap_alloc)?;

    let caller = graph.add_block_with_data(BlockKind::Data, "caller_site", vec![0u8; 8]);
    graph.block_mut(caller).unwrap().set_reference(
        2,
        Reference::new(
            ReferenceKind::Absolute,
            4,
            original_slot.block,
            original_slot.offset,
        ),
    );

    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    transform.apply(&mut graph)?;

    // The call site now goes through the runtime's IAT instead of kernel32's.
    let redirected = graph.block(caller).unwrap().reference(2).unwrap();
    let rtl_iat = graph.pe_iat_block(SYZYASAN_DLL).unwrap();
    assert_eq!(redirected.block, rtl_iat);
    assert_ne!(redirected.block, original_slot.block);
    Ok(())
}

#[test]
fn test_optional_intercepts_require_interceptors_flag() -> Result<()> {
    // ReadFile is an optional intercept: without use_interceptors the import
    // stays untouched.
    let mut graph = BlockGraph::new(ImageFormat::Pe);
    let mut kernel32 = ImportedModule::new("kernel32.dll");
    let read_file = kernel32.add_symbol("ReadFile", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut kernel32)?;
    let original_slot = kernel32.symbol_reference(read_file)?;

    let caller = graph.add_block_with_data(BlockKind::Data, "caller_site", vec![0u8; 8]);
    graph.block_mut(caller).unwrap().set_reference(
        0,
        Reference::new(
            ReferenceKind::Absolute,
            4,
            original_slot.block,
            original_slot.offset,
        ),
    );

    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    transform.apply(&mut graph)?;
    let untouched = graph.block(caller).unwrap().reference(0).unwrap();
    assert_eq!(untouched.block, original_slot.block);

    // With interceptors enabled the same setup is redirected.
    let mut graph = BlockGraph::new(ImageFormat::Pe);
    let mut kernel32 = ImportedModule::new("kernel32.dll");
    let read_file = kernel32.add_symbol("ReadFile", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut kernel32)?;
    let original_slot = kernel32.symbol_reference(read_file)?;
    let caller = graph.add_block_with_data(BlockKind::Data, "caller_site", vec![0u8; 8]);
    graph.block_mut(caller).unwrap().set_reference(
        0,
        Reference::new(
            ReferenceKind::Absolute,
            4,
            original_slot.block,
            original_slot.offset,
        ),
    );

    let mut transform = AsanTransform::new(AsanTransformConfig {
        use_interceptors: true,
        ..AsanTransformConfig::default()
    });
    transform.apply(&mut graph)?;
    let redirected = graph.block(caller).unwrap().reference(0).unwrap();
    assert_ne!(redirected.block, original_slot.block);
    Ok(())
}

#[test]
fn test_coff_symbols_renamed_by_pass() -> Result<()> {
    let mut graph = BlockGraph::new(ImageFormat::Coff);
    let mut object = ImportedModule::new("object");
    object.add_symbol("_memcpy", SymbolMode::AlwaysImport);
    object.add_symbol("__imp__memcpy", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut object)?;

    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    transform.apply(&mut graph)?;

    assert!(!graph.coff_symbol_exists("_memcpy"));
    assert!(graph.coff_symbol_exists("_asan_memcpy"));
    assert!(!graph.coff_symbol_exists("__imp__memcpy"));
    assert!(graph.coff_symbol_exists("__imp__asan_memcpy"));
    Ok(())
}

#[test]
fn test_coff_collision_fails_the_pass() {
    let mut graph = BlockGraph::new(ImageFormat::Coff);
    let mut object = ImportedModule::new("object");
    object.add_symbol("_asan_memcpy", SymbolMode::AlwaysImport);
    add_imports(&mut graph, &mut object).unwrap();

    let mut transform = AsanTransform::new(AsanTransformConfig::default());
    let result = transform.apply(&mut graph);
    assert!(matches!(result, Err(Error::CoffNameCollision { .. })));
}
