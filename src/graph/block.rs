//! Blocks and sections: the units the image is divided into.
//!
//! A block is a contiguous range of bytes (code or data) with a name, an owning
//! section, and a table of outgoing [`Reference`]s keyed by byte offset. Blocks are
//! created and owned by the [`BlockGraph`](crate::graph::BlockGraph); the pass holds
//! ids, never pointers.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::graph::Reference;

/// Identifier of a block within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// Creates an id from a raw value. Only meaningful for ids handed out by a graph.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Identifier of a section within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub(crate) u32);

/// Whether a block holds machine code or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Executable code.
    Code,
    /// Initialized data.
    Data,
}

bitflags! {
    /// Properties of a block that affect whether it may be decomposed and rewritten.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockAttributes: u32 {
        /// The block covers a gap in the original image.
        const GAP = 0x0001;
        /// The block is padding between functions.
        const PADDING = 0x0002;
        /// The block mixes data into its instruction stream (jump tables etc.).
        const HAS_INLINE_DATA = 0x0004;
        /// Upstream tooling marked the block unsafe to basic-block decompose.
        const UNSAFE_TO_DECOMPOSE = 0x0008;
    }
}

bitflags! {
    /// PE/COFF section characteristics. Only the bits the pass emits are modeled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        /// IMAGE_SCN_CNT_CODE
        const CNT_CODE = 0x0000_0020;
        /// IMAGE_SCN_CNT_INITIALIZED_DATA
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// IMAGE_SCN_MEM_EXECUTE
        const MEM_EXECUTE = 0x2000_0000;
        /// IMAGE_SCN_MEM_READ
        const MEM_READ = 0x4000_0000;
        /// IMAGE_SCN_MEM_WRITE
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionCharacteristics {
    /// Characteristics of an executable code section.
    #[must_use]
    pub const fn code() -> Self {
        Self::CNT_CODE
            .union(Self::MEM_EXECUTE)
            .union(Self::MEM_READ)
    }

    /// Characteristics of a read-only data section.
    #[must_use]
    pub const fn read_only_data() -> Self {
        Self::CNT_INITIALIZED_DATA.union(Self::MEM_READ)
    }

    /// Characteristics of a writable data section.
    #[must_use]
    pub const fn read_write_data() -> Self {
        Self::CNT_INITIALIZED_DATA
            .union(Self::MEM_READ)
            .union(Self::MEM_WRITE)
    }
}

/// A named section of the image.
#[derive(Debug, Clone)]
pub struct Section {
    pub(crate) id: SectionId,
    pub(crate) name: String,
    pub(crate) characteristics: SectionCharacteristics,
}

impl Section {
    /// Returns the section id.
    #[must_use]
    pub const fn id(&self) -> SectionId {
        self.id
    }

    /// Returns the section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the section characteristics.
    #[must_use]
    pub const fn characteristics(&self) -> SectionCharacteristics {
        self.characteristics
    }
}

/// A contiguous range of code or data bytes in the image.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) name: String,
    pub(crate) kind: BlockKind,
    pub(crate) section: Option<SectionId>,
    pub(crate) attributes: BlockAttributes,
    pub(crate) data: Vec<u8>,
    pub(crate) references: BTreeMap<u32, Reference>,
}

impl Block {
    /// Returns the block id.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Returns the block name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this is a code or data block.
    #[must_use]
    pub const fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Returns the owning section, if assigned.
    #[must_use]
    pub const fn section(&self) -> Option<SectionId> {
        self.section
    }

    /// Assigns the owning section.
    pub fn set_section(&mut self, section: SectionId) {
        self.section = Some(section);
    }

    /// Returns the block attributes.
    #[must_use]
    pub const fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    /// Sets the block attributes.
    pub fn set_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes = attributes;
    }

    /// Returns the block's byte content.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the block's byte content.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Returns the size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Installs a reference at `offset`, replacing any existing one.
    ///
    /// Returns `true` if a reference was already present at that offset.
    pub fn set_reference(&mut self, offset: u32, reference: Reference) -> bool {
        self.references.insert(offset, reference).is_some()
    }

    /// Returns the reference at `offset`, if any.
    #[must_use]
    pub fn reference(&self, offset: u32) -> Option<&Reference> {
        self.references.get(&offset)
    }

    /// Removes the reference at `offset`.
    pub fn remove_reference(&mut self, offset: u32) -> Option<Reference> {
        self.references.remove(&offset)
    }

    /// Iterates over `(offset, reference)` pairs in ascending offset order.
    pub fn references(&self) -> impl Iterator<Item = (u32, &Reference)> {
        self.references.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ReferenceKind;

    fn test_block() -> Block {
        Block {
            id: BlockId::from_raw(7),
            name: "blk".to_string(),
            kind: BlockKind::Code,
            section: None,
            attributes: BlockAttributes::default(),
            data: vec![0u8; 16],
            references: BTreeMap::new(),
        }
    }

    #[test]
    fn test_set_reference_replaces() {
        let mut block = test_block();
        let target = BlockId::from_raw(9);
        let first = Reference::new(ReferenceKind::Absolute, 4, target, 0);
        let second = Reference::new(ReferenceKind::Absolute, 4, target, 8);

        assert!(!block.set_reference(4, first));
        assert!(block.set_reference(4, second));
        assert_eq!(block.reference(4), Some(&second));
    }

    #[test]
    fn test_references_ordered_by_offset() {
        let mut block = test_block();
        let target = BlockId::from_raw(9);
        block.set_reference(12, Reference::new(ReferenceKind::Absolute, 4, target, 0));
        block.set_reference(0, Reference::new(ReferenceKind::PcRelative, 4, target, 4));

        let offsets: Vec<u32> = block.references().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 12]);
    }
}
