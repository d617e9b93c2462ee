//! References between blocks and within instruction operands.
//!
//! A [`Reference`] records that some bytes inside one block designate a location in
//! another (or the same) block. The byte content under a reference is a placeholder;
//! the reference entry is authoritative and is patched when the image is serialized.

use rustc_hash::FxHashMap;

use crate::graph::BlockId;

/// How a reference is encoded in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceKind {
    /// An absolute virtual address, relocated by the loader.
    Absolute,
    /// A PC-relative displacement, e.g. the operand of a near `CALL` or `JMP`.
    PcRelative,
}

/// A typed pointer from one location in the image to another.
///
/// The source location is the key under which the reference is stored in the
/// owning [`Block`](crate::graph::Block); the target is carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Encoding of the reference.
    pub kind: ReferenceKind,
    /// Width of the reference field in bytes.
    pub size: u8,
    /// Target block.
    pub block: BlockId,
    /// Byte offset of the target location within the target block.
    pub offset: i32,
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub const fn new(kind: ReferenceKind, size: u8, block: BlockId, offset: i32) -> Self {
        Self {
            kind,
            size,
            block,
            offset,
        }
    }
}

/// Target of an instruction operand field (displacement or immediate).
///
/// During basic-block decomposition, block-level references that land inside an
/// instruction's displacement or immediate field are lifted to this form, and
/// intra-block branch targets become [`OperandRef::BasicBlock`] edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRef {
    /// The field designates a location in some block of the graph.
    Block {
        /// Target block.
        block: BlockId,
        /// Offset within the target block.
        offset: i32,
    },
    /// The field designates a basic block of the subgraph currently being edited,
    /// identified by its index. Computed jumps and case-table loads produce these.
    BasicBlock(usize),
}

/// A destination rewrite map used to redirect references en masse.
///
/// Keys and values are `(block, offset)` destinations; every reference in the graph
/// whose destination matches a key is rewritten to the mapped destination.
pub type ReferenceMap = FxHashMap<(BlockId, i32), (BlockId, i32)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_equality() {
        let a = Reference::new(ReferenceKind::Absolute, 4, BlockId::from_raw(1), 8);
        let b = Reference::new(ReferenceKind::Absolute, 4, BlockId::from_raw(1), 8);
        let c = Reference::new(ReferenceKind::PcRelative, 4, BlockId::from_raw(1), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
