//! Import plumbing for PE images and symbol plumbing for COFF objects.
//!
//! An [`ImportedModule`] describes what the caller wants from one DLL (or, for COFF,
//! from the linker): a list of symbols, each either required (`AlwaysImport`) or
//! looked up only if the image already imports it (`FindOnly`). [`add_imports`]
//! materializes the request against the graph and leaves a resolvable
//! [`Reference`] on every imported symbol: an IAT slot for PE, a symbol-table entry
//! for COFF.

use rustc_hash::FxHashMap;

use crate::{
    graph::{
        BlockGraph, BlockId, BlockKind, ImageFormat, Reference, ReferenceKind,
        SectionCharacteristics,
    },
    Error, Result,
};

/// Size of one IAT slot in a 32-bit image.
const IAT_SLOT_SIZE: u32 = 4;

/// Size of one `IMAGE_SYMBOL` record in a COFF symbol table.
const COFF_SYMBOL_SIZE: u32 = 18;

/// Whether a symbol must be imported or merely located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolMode {
    /// Create the import if the image does not already have it.
    AlwaysImport,
    /// Resolve the symbol only if the image already imports it.
    FindOnly,
}

#[derive(Debug)]
struct ImportSymbol {
    name: String,
    mode: SymbolMode,
    imported: bool,
    reference: Option<Reference>,
}

/// A module (DLL or symbol source) and the symbols wanted from it.
#[derive(Debug)]
pub struct ImportedModule {
    name: String,
    timestamp: Option<u32>,
    symbols: Vec<ImportSymbol>,
}

impl ImportedModule {
    /// Creates a module request with no import-descriptor timestamp override.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: None,
            symbols: Vec::new(),
        }
    }

    /// Creates a module request that stamps the given timestamp into the module's
    /// import descriptor.
    ///
    /// Stamping timestamp `1` marks the descriptor as bound long ago, which makes
    /// the loader trust (and later overwrite) whatever the IAT slots already hold.
    pub fn with_timestamp(name: impl Into<String>, timestamp: u32) -> Self {
        Self {
            name: name.into(),
            timestamp: Some(timestamp),
            symbols: Vec::new(),
        }
    }

    /// Returns the module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a symbol to the request and returns its index within this module.
    pub fn add_symbol(&mut self, name: impl Into<String>, mode: SymbolMode) -> usize {
        self.symbols.push(ImportSymbol {
            name: name.into(),
            mode,
            imported: false,
            reference: None,
        });
        self.symbols.len() - 1
    }

    /// Returns the number of symbols in the request.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Returns `true` if the request has no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Returns the name of the symbol at `index`.
    #[must_use]
    pub fn symbol_name(&self, index: usize) -> &str {
        &self.symbols[index].name
    }

    /// Returns whether the symbol at `index` resolved during [`add_imports`].
    #[must_use]
    pub fn symbol_is_imported(&self, index: usize) -> bool {
        self.symbols.get(index).is_some_and(|s| s.imported)
    }

    /// Returns the reference to the symbol at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImportFailure`] if the symbol did not resolve.
    pub fn symbol_reference(&self, index: usize) -> Result<Reference> {
        self.symbols
            .get(index)
            .and_then(|s| s.reference)
            .ok_or_else(|| {
                Error::ImportFailure(format!(
                    "symbol \"{}\" of module \"{}\" is not imported",
                    self.symbols.get(index).map_or("?", |s| s.name.as_str()),
                    self.name
                ))
            })
    }
}

/// One module's entry in the PE import directory model.
#[derive(Debug)]
pub(crate) struct PeImportEntry {
    pub(crate) module: String,
    pub(crate) timestamp: u32,
    pub(crate) iat_block: BlockId,
    pub(crate) symbols: Vec<String>,
}

/// The PE import directory model carried by a [`BlockGraph`].
#[derive(Debug, Default)]
pub(crate) struct PeImportDirectory {
    pub(crate) entries: Vec<PeImportEntry>,
}

impl PeImportDirectory {
    pub(crate) fn entry(&self, module: &str) -> Option<&PeImportEntry> {
        self.entries
            .iter()
            .find(|e| e.module.eq_ignore_ascii_case(module))
    }

    fn entry_index(&self, module: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.module.eq_ignore_ascii_case(module))
    }
}

/// The COFF symbol table model carried by a [`BlockGraph`].
#[derive(Debug, Default)]
pub(crate) struct CoffSymbolTable {
    pub(crate) block: Option<BlockId>,
    pub(crate) names: Vec<String>,
    pub(crate) index: FxHashMap<String, usize>,
}

impl BlockGraph {
    /// Returns the import-descriptor timestamp stamped for `module`, if the module
    /// is present in the PE import directory.
    #[must_use]
    pub fn pe_import_timestamp(&self, module: &str) -> Option<u32> {
        self.pe_imports.entry(module).map(|e| e.timestamp)
    }

    /// Returns the IAT block of `module`, if present in the PE import directory.
    #[must_use]
    pub fn pe_iat_block(&self, module: &str) -> Option<BlockId> {
        self.pe_imports.entry(module).map(|e| e.iat_block)
    }

    /// Returns whether the COFF symbol table defines `name`.
    #[must_use]
    pub fn coff_symbol_exists(&self, name: &str) -> bool {
        self.coff_symbols.index.contains_key(name)
    }
}

/// Materializes a module request against the graph.
///
/// On PE images every `AlwaysImport` symbol receives (or reuses) an IAT slot; on
/// COFF objects it receives (or reuses) a symbol-table entry. `FindOnly` symbols
/// resolve only when already present. After this call, resolved symbols answer
/// [`ImportedModule::symbol_reference`].
///
/// # Errors
///
/// Returns [`Error::ImportFailure`] if the graph cannot host the import blocks.
pub fn add_imports(graph: &mut BlockGraph, module: &mut ImportedModule) -> Result<()> {
    match graph.image_format() {
        ImageFormat::Pe => pe_add_imports(graph, module),
        ImageFormat::Coff => coff_add_imports(graph, module),
    }
}

fn pe_add_imports(graph: &mut BlockGraph, module: &mut ImportedModule) -> Result<()> {
    let entry_index = match graph.pe_imports.entry_index(&module.name) {
        Some(index) => index,
        None => {
            // Only create a directory entry when something will actually be imported.
            if !module
                .symbols
                .iter()
                .any(|s| s.mode == SymbolMode::AlwaysImport)
            {
                return Ok(());
            }
            let section =
                graph.find_or_add_section(".idata", SectionCharacteristics::read_write_data());
            let iat_name = format!("iat:{}", module.name.to_ascii_lowercase());
            let iat_block = graph.add_block(BlockKind::Data, iat_name);
            graph.expect_block_mut(iat_block)?.set_section(section);
            graph.pe_imports.entries.push(PeImportEntry {
                module: module.name.clone(),
                timestamp: 0,
                iat_block,
                symbols: Vec::new(),
            });
            graph.pe_imports.entries.len() - 1
        }
    };

    if let Some(timestamp) = module.timestamp {
        graph.pe_imports.entries[entry_index].timestamp = timestamp;
    }

    let iat_block = graph.pe_imports.entries[entry_index].iat_block;
    for symbol in &mut module.symbols {
        let slot = {
            let entry = &mut graph.pe_imports.entries[entry_index];
            match entry.symbols.iter().position(|s| s == &symbol.name) {
                Some(slot) => Some(slot),
                None if symbol.mode == SymbolMode::AlwaysImport => {
                    entry.symbols.push(symbol.name.clone());
                    Some(entry.symbols.len() - 1)
                }
                None => None,
            }
        };
        let Some(slot) = slot else { continue };

        // Grow the IAT block to cover the slot.
        let needed = (slot as u32 + 1) * IAT_SLOT_SIZE;
        let block = graph.expect_block_mut(iat_block)?;
        if block.size() < needed {
            let mut data = block.data().to_vec();
            data.resize(needed as usize, 0);
            block.set_data(data);
        }

        symbol.imported = true;
        symbol.reference = Some(Reference::new(
            ReferenceKind::Absolute,
            4,
            iat_block,
            (slot as u32 * IAT_SLOT_SIZE) as i32,
        ));
    }

    Ok(())
}

fn coff_add_imports(graph: &mut BlockGraph, module: &mut ImportedModule) -> Result<()> {
    let symtab = match graph.coff_symbols.block {
        Some(block) => block,
        None => {
            let block = graph.add_block(BlockKind::Data, ".symtab");
            graph.coff_symbols.block = Some(block);
            block
        }
    };

    for symbol in &mut module.symbols {
        let index = match graph.coff_symbols.index.get(&symbol.name).copied() {
            Some(index) => Some(index),
            None if symbol.mode == SymbolMode::AlwaysImport => {
                let index = graph.coff_symbols.names.len();
                graph.coff_symbols.names.push(symbol.name.clone());
                graph.coff_symbols.index.insert(symbol.name.clone(), index);
                let block = graph.expect_block_mut(symtab)?;
                let mut data = block.data().to_vec();
                data.resize(((index as u32 + 1) * COFF_SYMBOL_SIZE) as usize, 0);
                block.set_data(data);
                Some(index)
            }
            None => None,
        };
        let Some(index) = index else { continue };

        symbol.imported = true;
        symbol.reference = Some(Reference::new(
            ReferenceKind::Absolute,
            4,
            symtab,
            (index as u32 * COFF_SYMBOL_SIZE) as i32,
        ));
    }

    Ok(())
}

/// Renames COFF symbols in place.
///
/// Mappings whose source symbol does not exist are ignored, mirroring a rename
/// transform configured with `symbols_must_exist = false`.
pub fn rename_coff_symbols(graph: &mut BlockGraph, mappings: &[(String, String)]) {
    for (old, new) in mappings {
        if let Some(index) = graph.coff_symbols.index.remove(old) {
            graph.coff_symbols.names[index] = new.clone();
            graph.coff_symbols.index.insert(new.clone(), index);
        }
    }
}
