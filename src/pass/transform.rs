//! The pass driver.
//!
//! [`AsanTransform`] orchestrates the whole rewrite of one image:
//!
//! 1. **Pre-pass**: refuse already-instrumented images, locate the CRT heap-init
//!    blocks, discover statically linked intercepts (PE), import the probes, and in
//!    hot-patching mode rewrite the entry thunk so the runtime loads early.
//! 2. **Per-block**: decompose each eligible code block, run the analyses, drive the
//!    instrumenter over every basic block, and merge the result back. In
//!    hot-patching mode the instrumenter runs dry and blocks that *would* have been
//!    instrumented are prepared for runtime attachment instead.
//! 3. **Post-pass**: redirect intercepted functions, embed the runtime parameters
//!    (PE), patch the CRT heap initialization, and append the hot-patch metadata.
//!
//! The pass is single-threaded and fails atomically: the first per-block error
//! aborts everything.

use std::collections::BTreeSet;

use log::{debug, error};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    graph::{
        add_imports, decompose, is_safely_decomposable, BlockAssembler, BlockBuilder, BlockGraph,
        BlockId, BlockKind, ImageFormat, ImportedModule, Reference, ReferenceKind,
        SectionCharacteristics, SymbolMode,
    },
    pass::{
        access::MemoryAccessInfo,
        heap::{find_heap_init_blocks, patch_crt_heap_initialization},
        instrument::{BasicBlockInstrumenter, InstructionFilter},
        intercepts::{
            build_intercept_filter, coff_intercept_functions, pe_find_statically_linked_functions,
            pe_intercept_functions, ASAN_INTERCEPTS,
        },
        params::{pe_inject_asan_parameters, AsanParameters},
        probes::{import_probes, ProbeTable, DATE_IN_THE_PAST, THUNK_SECTION_NAME},
    },
    Error, Result,
};

/// Default runtime DLL.
pub const SYZYASAN_DLL: &str = "syzyasan_rtl.dll";

/// Default runtime DLL in hot-patching mode.
pub const SYZYASAN_HP_DLL: &str = "syzyasan_hp.dll";

/// Name of the section holding the hot-patch metadata.
pub const HOT_PATCHING_METADATA_SECTION_NAME: &str = ".syzyhp";

/// Entry hook imported by the hot-patching entry thunk.
const ENTRY_HOOK_NAME: &str = "hp_asan_EntryHook";

/// Offset within the header block at which the entry-point reference is modeled.
///
/// Upstream decomposition stores the `AddressOfEntryPoint` reference of a PE image
/// at this offset of the header block.
pub const ENTRY_POINT_REF_OFFSET: u32 = 0;

/// Configuration of one pass invocation.
#[derive(Debug, Clone)]
pub struct AsanTransformConfig {
    /// Propagate original source ranges to inserted instructions.
    pub debug_friendly: bool,
    /// Enable flag-liveness analysis and the `_no_flags` probe variants.
    pub use_liveness_analysis: bool,
    /// Enable redundant-access elimination.
    pub remove_redundant_checks: bool,
    /// Include optional entries of the intercept table.
    pub use_interceptors: bool,
    /// Probability of instrumenting any given access; clamped to [0, 1].
    pub instrumentation_rate: f64,
    /// Dry-run the instrumenter and prepare blocks for runtime attachment instead
    /// of emitting probe calls.
    pub hot_patching: bool,
    /// Override of the runtime DLL name.
    pub asan_dll_name: Option<String>,
    /// Runtime parameters to embed into the image (PE only).
    pub asan_parameters: Option<AsanParameters>,
    /// Seed for the sampling PRNG; random runs are seeded from entropy.
    pub seed: Option<u64>,
}

impl Default for AsanTransformConfig {
    fn default() -> Self {
        Self {
            debug_friendly: false,
            use_liveness_analysis: false,
            remove_redundant_checks: false,
            use_interceptors: false,
            instrumentation_rate: 1.0,
            hot_patching: false,
            asan_dll_name: None,
            asan_parameters: None,
            seed: None,
        }
    }
}

/// The AddressSanitizer instrumentation pass over one block graph.
pub struct AsanTransform<'f> {
    config: AsanTransformConfig,
    filter: Option<InstructionFilter<'f>>,
    probe_table: ProbeTable,
    heap_init_blocks: Vec<BlockId>,
    static_intercepted_blocks: BTreeSet<BlockId>,
    hot_patched_blocks: Vec<BlockId>,
    parameters_block: Option<BlockId>,
    rng: StdRng,
}

impl<'f> AsanTransform<'f> {
    /// Creates a pass with the given configuration.
    #[must_use]
    pub fn new(config: AsanTransformConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            filter: None,
            probe_table: ProbeTable::new(),
            heap_init_blocks: Vec::new(),
            static_intercepted_blocks: BTreeSet::new(),
            hot_patched_blocks: Vec::new(),
            parameters_block: None,
            rng,
        }
    }

    /// Installs a predicate excluding individual instructions from instrumentation.
    pub fn set_filter(&mut self, filter: Option<InstructionFilter<'f>>) {
        self.filter = filter;
    }

    /// Returns the runtime DLL name in effect.
    #[must_use]
    pub fn instrument_dll_name(&self) -> &str {
        match &self.config.asan_dll_name {
            Some(name) => name,
            None if self.config.hot_patching => SYZYASAN_HP_DLL,
            None => SYZYASAN_DLL,
        }
    }

    /// Returns the block the runtime parameters were serialized into, if any.
    #[must_use]
    pub const fn parameters_block(&self) -> Option<BlockId> {
        self.parameters_block
    }

    /// Returns the blocks prepared for hot patching.
    #[must_use]
    pub fn hot_patched_blocks(&self) -> &[BlockId] {
        &self.hot_patched_blocks
    }

    /// Returns the probe reference table built by the pre-pass.
    #[must_use]
    pub const fn probe_table(&self) -> &ProbeTable {
        &self.probe_table
    }

    /// Looks up the probe reference for an access shape.
    #[must_use]
    pub fn probe_reference(&self, info: &MemoryAccessInfo) -> Option<&Reference> {
        self.probe_table.get(info)
    }

    /// Runs the whole pass over `graph`.
    ///
    /// # Errors
    ///
    /// Any error aborts the pass; no partially instrumented graph is produced as a
    /// valid result. See [`Error`] for the taxonomy.
    pub fn apply(&mut self, graph: &mut BlockGraph) -> Result<()> {
        self.pre_graph_iteration(graph)?;
        for id in graph.block_ids() {
            self.on_block(graph, id)?;
        }
        self.post_graph_iteration(graph)
    }

    fn pre_graph_iteration(&mut self, graph: &mut BlockGraph) -> Result<()> {
        // Instrumenting twice would stack probes on probes.
        if graph.find_section(THUNK_SECTION_NAME).is_some() {
            error!("the image is already instrumented");
            return Err(Error::AlreadyInstrumented);
        }

        self.heap_init_blocks = find_heap_init_blocks(graph);

        // Find static intercepts before the block iteration so the instrumenter
        // skips the very functions about to be redirected.
        if graph.image_format() == ImageFormat::Pe {
            let filter = build_intercept_filter(ASAN_INTERCEPTS, self.config.use_interceptors);
            self.static_intercepted_blocks = pe_find_statically_linked_functions(&filter, graph);
        }

        if self.config.hot_patching {
            // The runtime must be resident before user code runs; probes are
            // resolved dynamically at attach time, so no probe imports are needed.
            let dll = self.instrument_dll_name().to_string();
            rewrite_entry_thunk(graph, &dll)?;
        } else {
            let dll = self.instrument_dll_name().to_string();
            self.probe_table =
                import_probes(graph, &dll, self.config.use_liveness_analysis)?;
        }

        debug!(
            "pre-pass complete: {} heap-init blocks, {} static intercepts, {} probes",
            self.heap_init_blocks.len(),
            self.static_intercepted_blocks.len(),
            self.probe_table.len()
        );
        Ok(())
    }

    fn should_skip_block(&self, graph: &BlockGraph, id: BlockId) -> bool {
        // Heap-init blocks and intercepted copies must keep their original bytes.
        if self.heap_init_blocks.contains(&id) || self.static_intercepted_blocks.contains(&id) {
            return true;
        }
        let Some(block) = graph.block(id) else {
            return true;
        };
        // Pass-owned stubs live in .thunks and are never themselves instrumented.
        if let Some(thunks) = graph.find_section(THUNK_SECTION_NAME) {
            if block.section() == Some(thunks.id()) {
                return true;
            }
        }
        !is_safely_decomposable(block)
    }

    fn on_block(&mut self, graph: &mut BlockGraph, id: BlockId) -> Result<()> {
        if self.should_skip_block(graph, id) {
            return Ok(());
        }

        let mut subgraph = decompose(graph.expect_block(id)?)?;

        let mut instrumenter = BasicBlockInstrumenter::new(&self.probe_table, &mut self.rng);
        instrumenter.set_debug_friendly(self.config.debug_friendly);
        instrumenter.set_use_liveness_analysis(self.config.use_liveness_analysis);
        instrumenter.set_remove_redundant_checks(self.config.remove_redundant_checks);
        instrumenter.set_instrumentation_rate(self.config.instrumentation_rate);
        instrumenter.set_filter(self.filter);

        if self.config.hot_patching {
            // Only establish whether the block would be instrumented.
            instrumenter.set_dry_run(true);
            instrumenter.transform_subgraph(graph.image_format(), &mut subgraph)?;
            if instrumenter.instrumentation_happened() {
                let mut builder = BlockBuilder::new(graph);
                let prepared = builder.merge(&subgraph)?;
                self.hot_patched_blocks.push(prepared);
            }
        } else {
            instrumenter.transform_subgraph(graph.image_format(), &mut subgraph)?;
            let mut builder = BlockBuilder::new(graph);
            builder.merge(&subgraph)?;
        }

        Ok(())
    }

    fn post_graph_iteration(&mut self, graph: &mut BlockGraph) -> Result<()> {
        let dll = self.instrument_dll_name().to_string();

        match graph.image_format() {
            ImageFormat::Pe => {
                pe_intercept_functions(
                    ASAN_INTERCEPTS,
                    graph,
                    &dll,
                    self.config.use_interceptors,
                    self.config.hot_patching,
                    &self.static_intercepted_blocks,
                )?;

                if let Some(parameters) = self.config.asan_parameters.clone() {
                    self.parameters_block = Some(pe_inject_asan_parameters(graph, &parameters)?);
                }
            }
            ImageFormat::Coff => {
                coff_intercept_functions(ASAN_INTERCEPTS, graph, self.config.use_interceptors)?;
            }
        }

        if !self.heap_init_blocks.is_empty() {
            // The private heap replaces the process heap; in hot-patching mode the
            // runtime does not wrap HeapCreate, so it comes straight from kernel32.
            let (heap_dll, heap_function) = if self.config.hot_patching {
                ("kernel32.dll", "HeapCreate")
            } else {
                (dll.as_str(), "asan_HeapCreate")
            };
            patch_crt_heap_initialization(
                graph,
                heap_dll,
                heap_function,
                &self.heap_init_blocks,
            )?;
        }

        if self.config.hot_patching {
            add_hot_patching_metadata(graph, &self.hot_patched_blocks)?;
        }

        Ok(())
    }
}

/// Rewrites the image entry point through a thunk that enters the runtime first.
///
/// The thunk pushes the original entry point and jumps through the runtime's entry
/// hook import, which tail-calls the original entry once the runtime is set up.
fn rewrite_entry_thunk(graph: &mut BlockGraph, runtime_dll: &str) -> Result<()> {
    let header = graph.header_block().ok_or_else(|| {
        error!("failed to rewrite DLL entry thunk");
        Error::TransformFailure("image has no header block".to_string())
    })?;
    let original_entry = graph
        .expect_block(header)?
        .reference(ENTRY_POINT_REF_OFFSET)
        .copied()
        .ok_or_else(|| {
            error!("failed to rewrite DLL entry thunk");
            Error::TransformFailure("header block has no entry-point reference".to_string())
        })?;

    let mut module = ImportedModule::with_timestamp(runtime_dll, DATE_IN_THE_PAST);
    let hook = module.add_symbol(ENTRY_HOOK_NAME, SymbolMode::AlwaysImport);
    add_imports(graph, &mut module)?;
    let hook_ref = module.symbol_reference(hook)?;

    let section = graph.find_or_add_section(THUNK_SECTION_NAME, SectionCharacteristics::code());
    let mut instructions = Vec::new();
    let mut asm = BlockAssembler::new(&mut instructions);
    asm.push_imm32_reference(original_entry.block, original_entry.offset)?;
    asm.jmp_indirect(hook_ref.block, hook_ref.offset)?;

    let mut builder = BlockBuilder::new(graph);
    let thunk = builder
        .build_code_block("asan_entry_thunk", section, &instructions)
        .map_err(|e| Error::ThunkBuildFailure(e.to_string()))?;

    graph.expect_block_mut(header)?.set_reference(
        ENTRY_POINT_REF_OFFSET,
        Reference::new(original_entry.kind, original_entry.size, thunk, 0),
    );
    Ok(())
}

/// Appends the hot-patch metadata record: a versioned list of absolute references
/// to every block prepared for runtime attachment.
fn add_hot_patching_metadata(graph: &mut BlockGraph, blocks: &[BlockId]) -> Result<()> {
    let mut data = Vec::with_capacity(8 + blocks.len() * 4);
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    data.resize(8 + blocks.len() * 4, 0);

    let block_id = graph.add_block_with_data(BlockKind::Data, "hot_patching_metadata", data);
    let section = graph.find_or_add_section(
        HOT_PATCHING_METADATA_SECTION_NAME,
        SectionCharacteristics::read_only_data(),
    );
    let metadata = graph.expect_block_mut(block_id)?;
    metadata.set_section(section);
    for (index, &prepared) in blocks.iter().enumerate() {
        metadata.set_reference(
            8 + (index as u32) * 4,
            Reference::new(ReferenceKind::Absolute, 4, prepared, 0),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dll_name_defaults() {
        let transform = AsanTransform::new(AsanTransformConfig::default());
        assert_eq!(transform.instrument_dll_name(), SYZYASAN_DLL);

        let transform = AsanTransform::new(AsanTransformConfig {
            hot_patching: true,
            ..AsanTransformConfig::default()
        });
        assert_eq!(transform.instrument_dll_name(), SYZYASAN_HP_DLL);

        let transform = AsanTransform::new(AsanTransformConfig {
            asan_dll_name: Some("custom.dll".to_string()),
            ..AsanTransformConfig::default()
        });
        assert_eq!(transform.instrument_dll_name(), "custom.dll");
    }
}
