//! The instrumentation pass: classification, analyses, probe plumbing, and the
//! driver that ties them together.
//!
//! - [`access`] - decides whether an instruction accesses memory and how
//! - [`probes`] - enumerates and imports the runtime probes, emits IAT stubs
//! - [`liveness`] / [`redundancy`] - the per-subgraph analyses feeding the
//!   instrumenter
//! - [`instrument`] - rewrites one basic block at a time
//! - [`intercepts`] - redirects CRT/system functions to runtime interceptors
//! - [`heap`] - patches the CRT heap initialization
//! - [`params`] - embeds runtime configuration into the image
//! - [`transform`] - the pass driver

pub mod access;
pub mod heap;
pub mod instrument;
pub mod intercepts;
pub mod liveness;
pub mod params;
pub mod probes;
pub mod redundancy;
pub mod transform;

pub use access::{
    decode_memory_access, is_exempt_opcode, MemoryAccessInfo, MemoryAccessMode, StringOp,
};
pub use instrument::{BasicBlockInstrumenter, InstructionFilter, StackAccessMode};
pub use intercepts::{AsanIntercept, ASAN_INTERCEPTS};
pub use liveness::{LivenessAnalysis, LivenessState};
pub use params::{AsanParameters, ASAN_PARAMETERS_SECTION_NAME};
pub use probes::{
    enumerate_probe_variants, import_probes, ProbeTable, DATE_IN_THE_PAST, THUNK_SECTION_NAME,
};
pub use redundancy::{MemoryAccessAnalysis, MemoryAccessState};
pub use transform::{
    AsanTransform, AsanTransformConfig, ENTRY_POINT_REF_OFFSET,
    HOT_PATCHING_METADATA_SECTION_NAME, SYZYASAN_DLL, SYZYASAN_HP_DLL,
};
