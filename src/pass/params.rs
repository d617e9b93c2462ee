//! Serialization of runtime configuration parameters into the image.
//!
//! The runtime library discovers its configuration at startup by looking for a
//! dedicated section. The parameters serialize as a little-endian versioned flat
//! record; the variable-length list of ignored stack ids rides at the tail, with
//! the header's pointer slot wired up as an absolute self-reference so relocation
//! keeps it valid.

use crate::{
    graph::{
        BlockGraph, BlockId, BlockKind, Reference, ReferenceKind, SectionCharacteristics,
    },
    Result,
};

/// Name of the section the runtime scans for its parameters.
pub const ASAN_PARAMETERS_SECTION_NAME: &str = ".syzyasn";

/// Version of the serialized parameter layout.
pub const ASAN_PARAMETERS_VERSION: u32 = 15;

/// Name of the emitted parameter block.
const ASAN_PARAMETERS_BLOCK_NAME: &str = "AsanParameters";

/// Byte offset of the ignored-stack-ids pointer slot in the header.
const IGNORED_STACK_IDS_SLOT: u32 = 40;

/// Byte offset of the tail array holding the ignored stack ids.
const IGNORED_STACK_IDS_DATA: u32 = 48;

/// Runtime configuration embedded into an instrumented image.
#[derive(Debug, Clone)]
pub struct AsanParameters {
    /// Total size of the quarantine in bytes.
    pub quarantine_size: u32,
    /// Maximum size of one quarantined block in bytes.
    pub quarantine_block_size: u32,
    /// Padding appended to every allocation, in bytes.
    pub trailer_padding_size: u32,
    /// Period of the stats reporting, in milliseconds; zero disables it.
    pub reporting_period: u32,
    /// Stack frames to strip from the bottom of captured stacks.
    pub bottom_frames_to_skip: u32,
    /// Maximum number of frames captured per stack.
    pub max_num_frames: u32,
    /// Probability that an allocation receives guard pages.
    pub allocation_guard_rate: f32,
    /// Terminate the process on the first error report.
    pub exit_on_failure: bool,
    /// Run a whole-heap check when an error is found.
    pub check_heap_on_failure: bool,
    /// Stack ids whose reports are suppressed.
    pub ignored_stack_ids: Vec<u32>,
}

impl Default for AsanParameters {
    fn default() -> Self {
        Self {
            quarantine_size: 16 << 20,
            quarantine_block_size: 4 << 20,
            trailer_padding_size: 0,
            reporting_period: 0,
            bottom_frames_to_skip: 0,
            max_num_frames: 62,
            allocation_guard_rate: 1.0,
            exit_on_failure: false,
            check_heap_on_failure: false,
            ignored_stack_ids: Vec::new(),
        }
    }
}

impl AsanParameters {
    /// Serializes the parameters to their flat little-endian layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let total = IGNORED_STACK_IDS_DATA as usize + self.ignored_stack_ids.len() * 4;
        let mut data = Vec::with_capacity(total);
        data.extend_from_slice(&(total as u32).to_le_bytes());
        data.extend_from_slice(&ASAN_PARAMETERS_VERSION.to_le_bytes());
        data.extend_from_slice(&self.quarantine_size.to_le_bytes());
        data.extend_from_slice(&self.trailer_padding_size.to_le_bytes());
        data.extend_from_slice(&self.quarantine_block_size.to_le_bytes());
        data.extend_from_slice(&self.reporting_period.to_le_bytes());
        data.extend_from_slice(&self.bottom_frames_to_skip.to_le_bytes());
        data.extend_from_slice(&self.max_num_frames.to_le_bytes());
        data.extend_from_slice(&self.allocation_guard_rate.to_le_bytes());

        let mut flags = 0u32;
        if self.exit_on_failure {
            flags |= 1;
        }
        if self.check_heap_on_failure {
            flags |= 1 << 1;
        }
        data.extend_from_slice(&flags.to_le_bytes());

        // Pointer slot: zero when absent, otherwise patched via the block
        // reference installed by the injector.
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(self.ignored_stack_ids.len() as u32).to_le_bytes());
        for id in &self.ignored_stack_ids {
            data.extend_from_slice(&id.to_le_bytes());
        }

        debug_assert_eq!(data.len(), total);
        data
    }
}

/// Serializes `parameters` into a new data block in the parameters section.
///
/// Returns the id of the emitted block.
pub fn pe_inject_asan_parameters(
    graph: &mut BlockGraph,
    parameters: &AsanParameters,
) -> Result<BlockId> {
    let data = parameters.serialize();
    let block_id = graph.add_block_with_data(BlockKind::Data, ASAN_PARAMETERS_BLOCK_NAME, data);

    let section = graph.find_or_add_section(
        ASAN_PARAMETERS_SECTION_NAME,
        SectionCharacteristics::read_only_data(),
    );

    let block = graph.expect_block_mut(block_id)?;
    block.set_section(section);
    if !parameters.ignored_stack_ids.is_empty() {
        block.set_reference(
            IGNORED_STACK_IDS_SLOT,
            Reference::new(
                ReferenceKind::Absolute,
                4,
                block_id,
                IGNORED_STACK_IDS_DATA as i32,
            ),
        );
    }

    Ok(block_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ImageFormat;

    #[test]
    fn test_serialized_layout() {
        let parameters = AsanParameters {
            ignored_stack_ids: vec![0xDEAD, 0xBEEF],
            ..AsanParameters::default()
        };
        let data = parameters.serialize();
        assert_eq!(data.len(), 48 + 8);
        // size, then version.
        assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), 56);
        assert_eq!(
            u32::from_le_bytes(data[4..8].try_into().unwrap()),
            ASAN_PARAMETERS_VERSION
        );
        // Ids land at the tail.
        assert_eq!(u32::from_le_bytes(data[48..52].try_into().unwrap()), 0xDEAD);
    }

    #[test]
    fn test_inject_creates_section_and_self_reference() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let parameters = AsanParameters {
            ignored_stack_ids: vec![1],
            ..AsanParameters::default()
        };
        let block_id = pe_inject_asan_parameters(&mut graph, &parameters).unwrap();

        assert!(graph.find_section(ASAN_PARAMETERS_SECTION_NAME).is_some());
        let block = graph.block(block_id).unwrap();
        let reference = block.reference(IGNORED_STACK_IDS_SLOT).unwrap();
        assert_eq!(reference.block, block_id);
        assert_eq!(reference.offset, IGNORED_STACK_IDS_DATA as i32);
    }

    #[test]
    fn test_inject_without_ids_has_no_reference() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let block_id =
            pe_inject_asan_parameters(&mut graph, &AsanParameters::default()).unwrap();
        assert!(graph
            .block(block_id)
            .unwrap()
            .reference(IGNORED_STACK_IDS_SLOT)
            .is_none());
    }
}
