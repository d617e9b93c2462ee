use thiserror::Error;

use crate::graph::BlockId;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Instrumentation is all-or-nothing per image: any error raised while a block is being
/// rewritten aborts the whole pass, and no partially instrumented graph is handed back.
/// "Skip this access" decisions inside the instrumenter are normal control flow and never
/// surface here.
///
/// # Error Categories
///
/// ## Pass errors
/// - [`Error::AlreadyInstrumented`] - The image already carries a `.thunks` section
/// - [`Error::UnknownProbe`] - A classified access has no entry in the probe table
/// - [`Error::CoffNameCollision`] - The object file already defines an Asan symbol
///
/// ## Block-graph errors
/// - [`Error::ImportFailure`] - The add-imports transform failed
/// - [`Error::ThunkBuildFailure`] - A synthesized stub or thunk could not be built
/// - [`Error::TransformFailure`] - A delegated block-graph transform failed
/// - [`Error::BlockNotFound`] - A block id did not resolve in the graph
///
/// ## Decode/encode errors
/// - [`Error::Decode`] - The x86 decoder rejected a code block
/// - [`Error::Assembler`] - iced-x86 refused an instruction we tried to build or encode
#[derive(Error, Debug)]
pub enum Error {
    /// The image already contains a `.thunks` section.
    ///
    /// Running the pass twice over the same image would double-instrument every access,
    /// so the pre-pass refuses to re-enter.
    #[error("the image is already instrumented")]
    AlreadyInstrumented,

    /// No probe import exists for a computed memory access shape.
    ///
    /// The probe table is enumerated up front; a miss at instrumentation time indicates
    /// a bug in the enumeration, not a property of the input image.
    #[error("no probe registered for access: {name}")]
    UnknownProbe {
        /// Mangled name of the probe that was looked up.
        name: String,
    },

    /// The add-imports transform failed.
    #[error("import transform failed: {0}")]
    ImportFailure(String),

    /// The block builder rejected a synthesized stub or thunk.
    #[error("failed to build thunk block: {0}")]
    ThunkBuildFailure(String),

    /// The COFF object defines a symbol the pass was about to introduce.
    #[error("object file already defines Asan function \"{name}\"")]
    CoffNameCollision {
        /// The colliding symbol name.
        name: String,
    },

    /// A delegated block-graph transform failed.
    #[error("transform failed: {0}")]
    TransformFailure(String),

    /// A block id did not resolve in the graph.
    #[error("block {0:?} not found in graph")]
    BlockNotFound(BlockId),

    /// The decoder could not decompose a code block.
    ///
    /// Carries the byte offset within the block at which decoding failed.
    #[error("decode error at offset {offset:#x}: {message}")]
    Decode {
        /// Description of what was undecodable.
        message: String,
        /// Byte offset within the block.
        offset: u32,
    },

    /// iced-x86 rejected an instruction during construction or encoding.
    #[error("{0}")]
    Assembler(#[from] iced_x86::IcedError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
