//! The block graph: the in-memory representation of one PE or COFF image.
//!
//! Upstream tooling decomposes an image into named, typed blocks with references
//! between them; this pass mutates that graph and hands it back for serialization.
//! The graph exclusively owns its blocks and sections. Everything the pass emits
//! (stubs, thunks, parameter blocks) is installed here and owned here.

use std::collections::BTreeMap;

use crate::{
    graph::{
        imports::{CoffSymbolTable, PeImportDirectory},
        Block, BlockAttributes, BlockId, BlockKind, ReferenceMap, Section,
        SectionCharacteristics, SectionId,
    },
    Error, Result,
};

/// The on-disk format of the image a block graph was decomposed from.
///
/// The format fixes how imports and probe calls are materialized: PE images route
/// calls through IAT slots, COFF objects reference linker symbols directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// A linked PE executable or DLL.
    Pe,
    /// An unlinked COFF object file.
    Coff,
}

/// An in-memory image: blocks, sections, and format-level metadata.
#[derive(Debug)]
pub struct BlockGraph {
    format: ImageFormat,
    blocks: BTreeMap<BlockId, Block>,
    sections: Vec<Section>,
    header: Option<BlockId>,
    next_block: u32,
    pub(crate) pe_imports: PeImportDirectory,
    pub(crate) coff_symbols: CoffSymbolTable,
}

impl BlockGraph {
    /// Creates an empty graph for an image of the given format.
    #[must_use]
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            blocks: BTreeMap::new(),
            sections: Vec::new(),
            header: None,
            next_block: 1,
            pe_imports: PeImportDirectory::default(),
            coff_symbols: CoffSymbolTable::default(),
        }
    }

    /// Returns the image format.
    #[must_use]
    pub const fn image_format(&self) -> ImageFormat {
        self.format
    }

    /// Adds an empty block of the given kind and returns its id.
    pub fn add_block(&mut self, kind: BlockKind, name: impl Into<String>) -> BlockId {
        self.add_block_with_data(kind, name, Vec::new())
    }

    /// Adds a block with initial byte content and returns its id.
    pub fn add_block_with_data(
        &mut self,
        kind: BlockKind,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> BlockId {
        let id = BlockId::from_raw(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                id,
                name: name.into(),
                kind,
                section: None,
                attributes: BlockAttributes::default(),
                data,
                references: BTreeMap::new(),
            },
        );
        id
    }

    /// Removes a block from the graph, returning it.
    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        self.blocks.remove(&id)
    }

    /// Returns the block with the given id.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    /// Returns the block with the given id, mutably.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    /// Returns the block with the given id, or [`Error::BlockNotFound`].
    pub fn expect_block(&self, id: BlockId) -> Result<&Block> {
        self.block(id).ok_or(Error::BlockNotFound(id))
    }

    /// Returns the block with the given id mutably, or [`Error::BlockNotFound`].
    pub fn expect_block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks.get_mut(&id).ok_or(Error::BlockNotFound(id))
    }

    /// Iterates over all blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Iterates over all blocks in id order, mutably.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.values_mut()
    }

    /// Returns the ids of all blocks, in id order.
    ///
    /// Use this to iterate while mutating individual blocks through
    /// [`BlockGraph::block_mut`].
    #[must_use]
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    /// Returns the number of blocks in the graph.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the header block of the image, if one was designated.
    #[must_use]
    pub const fn header_block(&self) -> Option<BlockId> {
        self.header
    }

    /// Designates the header block of the image.
    pub fn set_header_block(&mut self, id: BlockId) {
        self.header = Some(id);
    }

    /// Finds a section by name.
    #[must_use]
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Finds a section by name, creating it with the given characteristics if absent.
    pub fn find_or_add_section(
        &mut self,
        name: &str,
        characteristics: SectionCharacteristics,
    ) -> SectionId {
        if let Some(section) = self.find_section(name) {
            return section.id;
        }
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(Section {
            id,
            name: name.to_string(),
            characteristics,
        });
        id
    }

    /// Returns the section with the given id.
    #[must_use]
    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(id.0 as usize)
    }

    /// Rewrites the destination of every reference in the graph that matches a key
    /// of `map` to the mapped destination.
    ///
    /// Reference kinds and sizes are preserved; only `(block, offset)` destinations
    /// change.
    pub fn redirect_references(&mut self, map: &ReferenceMap) {
        if map.is_empty() {
            return;
        }
        for block in self.blocks.values_mut() {
            for reference in block.references.values_mut() {
                if let Some(&(new_block, new_offset)) =
                    map.get(&(reference.block, reference.offset))
                {
                    reference.block = new_block;
                    reference.offset = new_offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Reference, ReferenceKind};

    #[test]
    fn test_add_and_lookup_block() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let id = graph.add_block_with_data(BlockKind::Code, "f", vec![0xC3]);
        let block = graph.block(id).unwrap();
        assert_eq!(block.name(), "f");
        assert_eq!(block.size(), 1);
    }

    #[test]
    fn test_find_or_add_section_is_idempotent() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let a = graph.find_or_add_section(".thunks", SectionCharacteristics::code());
        let b = graph.find_or_add_section(".thunks", SectionCharacteristics::code());
        assert_eq!(a, b);
        assert_eq!(graph.find_section(".thunks").unwrap().id(), a);
    }

    #[test]
    fn test_redirect_references() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let old = graph.add_block(BlockKind::Code, "old");
        let new = graph.add_block(BlockKind::Code, "new");
        let caller = graph.add_block_with_data(BlockKind::Code, "caller", vec![0u8; 8]);
        graph
            .block_mut(caller)
            .unwrap()
            .set_reference(1, Reference::new(ReferenceKind::PcRelative, 4, old, 0));

        let mut map = ReferenceMap::default();
        map.insert((old, 0), (new, 0));
        graph.redirect_references(&map);

        let reference = graph.block(caller).unwrap().reference(1).unwrap();
        assert_eq!(reference.block, new);
        assert_eq!(reference.kind, ReferenceKind::PcRelative);
    }
}
