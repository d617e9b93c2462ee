//! The block-graph layer: the image representation the pass rewrites.
//!
//! An image arrives as a [`BlockGraph`]: named, typed blocks (code or data) with
//! references between them, plus image-level metadata (PE or COFF). The modules here
//! supply the primitives the instrumentation pass drives:
//!
//! - [`block`] / [`reference`] / [`image`] - the data model
//! - [`subgraph`] - basic-block decomposition of code blocks
//! - [`assembler`] / [`builder`] - synthesizing instructions and encoding them back
//!   into blocks
//! - [`imports`] - PE import / COFF symbol materialization
//! - [`filter`] - content-hash identification of statically linked functions

pub mod assembler;
pub mod block;
pub mod builder;
pub mod filter;
pub mod image;
pub mod imports;
pub mod reference;
pub mod subgraph;

pub use assembler::{BlockAssembler, Displacement, Operand};
pub use block::{
    Block, BlockAttributes, BlockId, BlockKind, Section, SectionCharacteristics, SectionId,
};
pub use builder::BlockBuilder;
pub use filter::ContentHashFilter;
pub use image::{BlockGraph, ImageFormat};
pub use imports::{add_imports, rename_coff_symbols, ImportedModule, SymbolMode};
pub use reference::{OperandRef, Reference, ReferenceKind, ReferenceMap};
pub use subgraph::{
    decompose, has_unexpected_stack_frame_manipulation, is_safely_decomposable, BasicBlockExit,
    BasicBlockSubGraph, BasicCodeBlock, Instruction, SourceRange,
};
