//! Redirection of CRT and system functions to runtime interceptors.
//!
//! The intercept table is static data: per function, the module it is imported from
//! (if any), its undecorated and decorated names, whether it is optional, and the
//! content hashes of known statically linked builds. Dynamically imported functions
//! are redirected IAT slot to IAT slot; statically linked copies are recognized by
//! content hash and redirected through a one-instruction `jmp` thunk; COFF objects
//! get their symbols renamed and the linker does the rest.

use std::collections::BTreeSet;

use log::error;
use rustc_hash::FxHashMap;

use crate::{
    graph::{
        add_imports, rename_coff_symbols, BlockAssembler, BlockBuilder, BlockGraph, BlockId,
        ContentHashFilter, ImportedModule, ReferenceMap, SectionCharacteristics, SymbolMode,
    },
    pass::probes::{DATE_IN_THE_PAST, THUNK_SECTION_NAME},
    Error, Result,
};

/// Prefix of undecorated interceptor names in the runtime DLL.
pub const UNDECORATED_INTERCEPT_PREFIX: &str = "asan_";

/// Prefix of undecorated interceptor names in the hot-patching runtime DLL.
pub const UNDECORATED_HP_INTERCEPT_PREFIX: &str = "hp_asan_";

/// Prefix a COFF import thunk symbol carries.
pub const DECORATED_IMPORT_PREFIX: &str = "__imp_";

/// One function the runtime library can intercept.
#[derive(Debug, Clone, Copy)]
pub struct AsanIntercept {
    /// Module the function is imported from; `None` for static-only intercepts.
    pub module: Option<&'static str>,
    /// Undecorated name, used for PE import lookup and interceptor naming.
    pub undecorated_name: &'static str,
    /// Decorated name, used for COFF symbol renaming; `None` skips COFF handling.
    pub decorated_name: Option<&'static str>,
    /// Optional intercepts are only applied when interceptors are enabled.
    pub optional: bool,
    /// md5 digests of known statically linked builds of the function.
    pub content_hashes: &'static [&'static str],
}

/// The functions the runtime library intercepts.
///
/// The hash lists identify statically linked CRT builds; they grow as new CRT
/// versions are catalogued.
pub static ASAN_INTERCEPTS: &[AsanIntercept] = &[
    AsanIntercept {
        module: None,
        undecorated_name: "memcpy",
        decorated_name: Some("_memcpy"),
        optional: false,
        content_hashes: &[
            "8a2c1190094b1d7f1a764f5e8e3416c3",
            "e8e606830fdca5ff5e2c1f3e4fbd3a4e",
        ],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "memmove",
        decorated_name: Some("_memmove"),
        optional: false,
        content_hashes: &["d5e04bdc783f4c9b15a8f8e0bdaf9cf5"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "memset",
        decorated_name: Some("_memset"),
        optional: false,
        content_hashes: &["f4b2aa35dbc53cbf46a4a02392a1fa37"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "memchr",
        decorated_name: Some("_memchr"),
        optional: false,
        content_hashes: &["02f9dbfe12da2cb01f18b2c8f0b32175"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "strlen",
        decorated_name: Some("_strlen"),
        optional: true,
        content_hashes: &["35a0ee09a6866dccd56ed5ba94beb4e1"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "strcmp",
        decorated_name: Some("_strcmp"),
        optional: true,
        content_hashes: &["7dbb98466432bfee27d0c25d8c0a1e7e"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "strstr",
        decorated_name: Some("_strstr"),
        optional: true,
        content_hashes: &["06b2a41627a2a4b51c6c8b83e6e3f2d8"],
    },
    AsanIntercept {
        module: None,
        undecorated_name: "wcschr",
        decorated_name: Some("_wcschr"),
        optional: true,
        content_hashes: &["b7e0fd1e8a74b91bfb7c9e310ef1b7a2"],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "HeapAlloc",
        decorated_name: None,
        optional: false,
        content_hashes: &[],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "HeapFree",
        decorated_name: None,
        optional: false,
        content_hashes: &[],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "HeapReAlloc",
        decorated_name: None,
        optional: false,
        content_hashes: &[],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "HeapSize",
        decorated_name: None,
        optional: false,
        content_hashes: &[],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "ReadFile",
        decorated_name: None,
        optional: true,
        content_hashes: &[],
    },
    AsanIntercept {
        module: Some("kernel32.dll"),
        undecorated_name: "WriteFile",
        decorated_name: None,
        optional: true,
        content_hashes: &[],
    },
];

/// Returns whether an intercept participates under the current configuration.
fn intercept_enabled(intercept: &AsanIntercept, use_interceptors: bool) -> bool {
    use_interceptors || !intercept.optional
}

/// Builds the content-hash filter for statically linked intercepts.
#[must_use]
pub fn build_intercept_filter(
    intercepts: &[AsanIntercept],
    use_interceptors: bool,
) -> ContentHashFilter {
    let mut filter = ContentHashFilter::new();
    for intercept in intercepts {
        if !intercept_enabled(intercept, use_interceptors) {
            continue;
        }
        for hash in intercept.content_hashes {
            filter.add_hash(*hash);
        }
    }
    filter
}

/// Finds blocks that are statically linked copies of intercepted functions.
///
/// The result doubles as a skip set for the instrumenter (the copies are about to be
/// redirected away from, so instrumenting them has no value) and as the input of the
/// static redirection step.
#[must_use]
pub fn pe_find_statically_linked_functions(
    filter: &ContentHashFilter,
    graph: &BlockGraph,
) -> BTreeSet<BlockId> {
    let mut blocks = BTreeSet::new();
    if filter.is_empty() {
        return blocks;
    }
    for block in graph.blocks() {
        if filter.matches(block) {
            blocks.insert(block.id());
        }
    }
    blocks
}

/// Redirects intercepted functions of a PE image to their runtime interceptors.
///
/// Imported intercepts are discovered with find-only import probes, given `asan_`
/// twins in the runtime module, and redirected IAT slot to IAT slot. Statically
/// linked intercepts get a `.thunks` jump thunk through their interceptor's IAT slot
/// and every reference to the original block is redirected to the thunk. In
/// hot-patching mode only the static path runs, under the `hp_asan_` prefix.
pub fn pe_intercept_functions(
    intercepts: &[AsanIntercept],
    graph: &mut BlockGraph,
    runtime_dll: &str,
    use_interceptors: bool,
    hot_patching: bool,
    static_blocks: &BTreeSet<BlockId>,
) -> Result<()> {
    let prefix = if hot_patching {
        UNDECORATED_HP_INTERCEPT_PREFIX
    } else {
        UNDECORATED_INTERCEPT_PREFIX
    };

    let mut import_name_index: FxHashMap<String, usize> = FxHashMap::default();
    let mut asan_rtl = ImportedModule::with_timestamp(runtime_dll, DATE_IN_THE_PAST);

    // Discover which import intercepts the image actually uses. Dynamic imports are
    // only intercepted outside hot-patching mode.
    let mut imported_modules: Vec<ImportedModule> = Vec::new();
    if !hot_patching {
        let mut module_index: FxHashMap<&str, usize> = FxHashMap::default();
        for intercept in intercepts {
            let Some(module_name) = intercept.module else {
                continue;
            };
            if !intercept_enabled(intercept, use_interceptors) {
                continue;
            }
            let index = *module_index.entry(module_name).or_insert_with(|| {
                imported_modules.push(ImportedModule::new(module_name));
                imported_modules.len() - 1
            });
            imported_modules[index].add_symbol(intercept.undecorated_name, SymbolMode::FindOnly);
        }
        for module in &mut imported_modules {
            add_imports(graph, module).map_err(|e| {
                error!("unable to find imports for redirection: {e}");
                e
            })?;
        }

        // Give every found import an interceptor twin in the runtime module.
        for module in &imported_modules {
            for index in 0..module.len() {
                if !module.symbol_is_imported(index) {
                    continue;
                }
                let function_name = module.symbol_name(index).to_string();
                debug_assert!(
                    !import_name_index.contains_key(&function_name),
                    "duplicate entry in the intercept table"
                );
                let symbol =
                    asan_rtl.add_symbol(format!("{prefix}{function_name}"), SymbolMode::AlwaysImport);
                import_name_index.insert(function_name, symbol);
            }
        }
    }

    // Add interceptors for the statically linked copies.
    for &block_id in static_blocks {
        let name = graph.expect_block(block_id)?.name().to_string();
        if import_name_index.contains_key(&name) {
            continue;
        }
        let symbol = asan_rtl.add_symbol(format!("{prefix}{name}"), SymbolMode::AlwaysImport);
        import_name_index.insert(name, symbol);
    }

    // Nothing to intercept, nothing to do.
    if asan_rtl.is_empty() {
        return Ok(());
    }

    add_imports(graph, &mut asan_rtl).map_err(|e| {
        error!("unable to add imports for redirection: {e}");
        e
    })?;

    let mut redirects = ReferenceMap::default();

    // Imported intercepts: original IAT slot -> interceptor IAT slot.
    for module in &imported_modules {
        for index in 0..module.len() {
            if !module.symbol_is_imported(index) {
                continue;
            }
            let source = module.symbol_reference(index)?;
            let symbol = import_name_index[module.symbol_name(index)];
            let destination = asan_rtl.symbol_reference(symbol)?;
            redirects.insert(
                (source.block, source.offset),
                (destination.block, destination.offset),
            );
        }
    }

    // Statically linked intercepts: original block -> jmp thunk.
    if !static_blocks.is_empty() {
        let section =
            graph.find_or_add_section(THUNK_SECTION_NAME, SectionCharacteristics::code());
        let mut thunks: FxHashMap<String, BlockId> = FxHashMap::default();
        for &block_id in static_blocks {
            let name = graph.expect_block(block_id)?.name().to_string();
            let thunk = match thunks.get(&name).copied() {
                Some(thunk) => thunk,
                None => {
                    let import_ref = asan_rtl.symbol_reference(import_name_index[&name])?;
                    let thunk_name = format!("{prefix}{name}_thunk");

                    let mut instructions = Vec::new();
                    let mut asm = BlockAssembler::new(&mut instructions);
                    asm.jmp_indirect(import_ref.block, import_ref.offset)?;

                    let mut builder = BlockBuilder::new(graph);
                    let thunk = builder
                        .build_code_block(&thunk_name, section, &instructions)
                        .map_err(|e| {
                            error!("failed to build thunk block \"{thunk_name}\": {e}");
                            Error::ThunkBuildFailure(e.to_string())
                        })?;
                    thunks.insert(name, thunk);
                    thunk
                }
            };
            redirects.insert((block_id, 0), (thunk, 0));
        }
    }

    graph.redirect_references(&redirects);

    Ok(())
}

/// Renames intercepted symbols of a COFF object to their interceptor forms.
///
/// Both the direct symbol and its `__imp_` twin are renamed. If the object already
/// defines any of the interceptor names, the pass fails rather than silently
/// double-defining them.
pub fn coff_intercept_functions(
    intercepts: &[AsanIntercept],
    graph: &mut BlockGraph,
    use_interceptors: bool,
) -> Result<()> {
    let mut mappings: Vec<(String, String)> = Vec::new();
    let mut collision: Option<String> = None;

    for intercept in intercepts {
        if !intercept_enabled(intercept, use_interceptors) {
            continue;
        }
        let Some(decorated) = intercept.decorated_name else {
            continue;
        };

        let asan_name = decorated_intercept_name(decorated);
        let imp_name = format!("{DECORATED_IMPORT_PREFIX}{decorated}");
        let imp_asan_name = format!("{DECORATED_IMPORT_PREFIX}{asan_name}");

        for name in [&asan_name, &imp_asan_name] {
            if graph.coff_symbol_exists(name) {
                error!("object file being instrumented defines Asan function \"{name}\"");
                collision.get_or_insert_with(|| name.clone());
            }
        }

        mappings.push((decorated.to_string(), asan_name));
        mappings.push((imp_name, imp_asan_name));
    }

    if let Some(name) = collision {
        return Err(Error::CoffNameCollision { name });
    }

    rename_coff_symbols(graph, &mappings);
    Ok(())
}

/// Builds the interceptor form of a decorated name.
///
/// C decoration puts a leading underscore on cdecl names, so `_memcpy` becomes
/// `_asan_memcpy`; names without one are plainly prefixed.
fn decorated_intercept_name(decorated: &str) -> String {
    match decorated.strip_prefix('_') {
        Some(stripped) => format!("_asan_{stripped}"),
        None => format!("asan_{decorated}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{filter::hash_block_contents, BlockKind, ImageFormat};

    #[test]
    fn test_intercept_filter_respects_optional() {
        let all = build_intercept_filter(ASAN_INTERCEPTS, true);
        let required = build_intercept_filter(ASAN_INTERCEPTS, false);
        assert!(!all.is_empty());
        assert!(!required.is_empty());
    }

    #[test]
    fn test_decorated_intercept_name() {
        assert_eq!(decorated_intercept_name("_memcpy"), "_asan_memcpy");
        assert_eq!(decorated_intercept_name("memcpy"), "asan_memcpy");
    }

    #[test]
    fn test_pe_static_intercept_redirects_to_thunk() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        // A fake statically linked memcpy and a caller referencing it.
        let memcpy =
            graph.add_block_with_data(BlockKind::Code, "memcpy", vec![0x8B, 0xC1, 0xC3]);
        let caller = graph.add_block_with_data(BlockKind::Code, "caller", vec![0u8; 8]);
        graph.block_mut(caller).unwrap().set_reference(
            1,
            crate::graph::Reference::new(crate::graph::ReferenceKind::PcRelative, 4, memcpy, 0),
        );

        let mut filter = ContentHashFilter::new();
        filter.add_hash(hash_block_contents(graph.block(memcpy).unwrap()));
        let static_blocks = pe_find_statically_linked_functions(&filter, &graph);
        assert!(static_blocks.contains(&memcpy));

        pe_intercept_functions(
            ASAN_INTERCEPTS,
            &mut graph,
            "syzyasan_rtl.dll",
            false,
            false,
            &static_blocks,
        )
        .unwrap();

        // The caller now references the thunk, not the original.
        let reference = graph.block(caller).unwrap().reference(1).unwrap();
        assert_ne!(reference.block, memcpy);
        let thunk = graph.block(reference.block).unwrap();
        assert_eq!(thunk.name(), "asan_memcpy_thunk");

        // And the interceptor import exists.
        assert!(graph.pe_iat_block("syzyasan_rtl.dll").is_some());
    }

    #[test]
    fn test_pe_imported_intercept_redirects_iat_slot() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        // The image already imports kernel32!HeapAlloc.
        let mut kernel32 = ImportedModule::new("kernel32.dll");
        let heap_alloc = kernel32.add_symbol("HeapAlloc", SymbolMode::AlwaysImport);
        add_imports(&mut graph, &mut kernel32).unwrap();
        let original_slot = kernel32.symbol_reference(heap_alloc).unwrap();

        // A caller going through the IAT slot.
        let caller = graph.add_block_with_data(BlockKind::Code, "caller", vec![0u8; 8]);
        graph.block_mut(caller).unwrap().set_reference(
            2,
            crate::graph::Reference::new(
                crate::graph::ReferenceKind::Absolute,
                4,
                original_slot.block,
                original_slot.offset,
            ),
        );

        pe_intercept_functions(
            ASAN_INTERCEPTS,
            &mut graph,
            "syzyasan_rtl.dll",
            false,
            false,
            &BTreeSet::new(),
        )
        .unwrap();

        let redirected = graph.block(caller).unwrap().reference(2).unwrap();
        let rtl_iat = graph.pe_iat_block("syzyasan_rtl.dll").unwrap();
        assert_eq!(redirected.block, rtl_iat);
    }

    #[test]
    fn test_coff_rename_and_collision() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        let mut module = ImportedModule::new("object");
        module.add_symbol("_memcpy", SymbolMode::AlwaysImport);
        add_imports(&mut graph, &mut module).unwrap();

        coff_intercept_functions(ASAN_INTERCEPTS, &mut graph, false).unwrap();
        assert!(!graph.coff_symbol_exists("_memcpy"));
        assert!(graph.coff_symbol_exists("_asan_memcpy"));

        // A second run collides with the renamed symbol.
        let result = coff_intercept_functions(ASAN_INTERCEPTS, &mut graph, false);
        assert!(matches!(result, Err(Error::CoffNameCollision { .. })));
    }
}
