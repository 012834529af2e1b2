//! Region layout planner.
//!
//! Maps an ordered list of [`RegionSpec`]s onto page aligned offsets inside a
//! single shared memory segment. Regions form an arena addressed by index: the
//! declaration order is the index space used by `managed_by` links and by the
//! descriptor table written into the segment.
//!
//! Layout of one region (offsets relative to the region start):
//!
//! ```text
//! 0                        guest->host signal table (2^g2h words)
//!                          guest->host interrupt word
//!                          host->guest signal table (2^h2g words)
//!                          host->guest interrupt word
//! offset_of_region_data    payload, padded up to the page size
//! ```

use crate::descriptor::{
    DEVICE_NAME_SIZE, LAYOUT_DESCRIPTOR_SIZE, REGION_DESCRIPTOR_SIZE, SegmentDescriptor,
};
use crate::errors::VsocError;
use std::collections::HashMap;

/// Size of one signal word. Signal words are futex compatible `u32`s.
pub const SIGNAL_WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Largest accepted signal table, 2^16 words per direction.
pub const MAX_SIGNAL_TABLE_LOG_SIZE: u32 = 16;

/// Page size of the running system, falling back to 4 KiB if unavailable.
pub fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

pub const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Static description of one logical region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: String,
    pub payload_size: usize,
    pub guest_to_host_signal_log_size: u32,
    pub host_to_guest_signal_log_size: u32,
    pub managed_by: Option<String>,
}

impl RegionSpec {
    pub fn new(
        name: impl Into<String>,
        payload_size: usize,
        guest_to_host_signal_log_size: u32,
        host_to_guest_signal_log_size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            payload_size,
            guest_to_host_signal_log_size,
            host_to_guest_signal_log_size,
            managed_by: None,
        }
    }

    pub fn managed_by(mut self, manager: impl Into<String>) -> Self {
        self.managed_by = Some(manager.into());
        self
    }

    /// Bytes taken by both signal tables and their interrupt words.
    pub fn offset_of_region_data(&self) -> usize {
        let guest_to_host = (1usize << self.guest_to_host_signal_log_size) * SIGNAL_WORD_SIZE;
        let host_to_guest = (1usize << self.host_to_guest_signal_log_size) * SIGNAL_WORD_SIZE;
        guest_to_host + host_to_guest + 2 * SIGNAL_WORD_SIZE
    }

    /// Minimum size the region needs for the signalling section and the
    /// payload, aligned to `page_size`.
    pub fn min_region_size(&self, page_size: usize) -> usize {
        align_up(self.offset_of_region_data() + self.payload_size, page_size)
    }

    fn validate(&self) -> Result<(), VsocError> {
        if self.name.is_empty() {
            return Err(VsocError::ConfigurationError(
                "region name cannot be empty".to_string(),
            ));
        }
        if self.name.len() >= DEVICE_NAME_SIZE || self.name.contains('\0') {
            return Err(VsocError::ConfigurationError(format!(
                "region name '{}' must be at most {} bytes without nul",
                self.name,
                DEVICE_NAME_SIZE - 1
            )));
        }
        for log_size in [
            self.guest_to_host_signal_log_size,
            self.host_to_guest_signal_log_size,
        ] {
            if log_size > MAX_SIGNAL_TABLE_LOG_SIZE {
                return Err(VsocError::ConfigurationError(format!(
                    "region '{}' signal table log size {} exceeds {}",
                    self.name, log_size, MAX_SIGNAL_TABLE_LOG_SIZE
                )));
            }
        }
        Ok(())
    }
}

/// Position of one direction's signal table inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalTableLayout {
    pub table_offset: u32,
    pub num_nodes_log2: u32,
    pub interrupt_word_offset: u32,
}

impl SignalTableLayout {
    pub fn num_nodes(&self) -> usize {
        1usize << self.num_nodes_log2
    }

    /// Offset of the first byte after the interrupt word.
    pub fn end_offset(&self) -> u32 {
        self.interrupt_word_offset + SIGNAL_WORD_SIZE as u32
    }

    fn starting_at(offset: u32, log_size: u32) -> Self {
        Self {
            table_offset: offset,
            num_nodes_log2: log_size,
            interrupt_word_offset: offset + (1u32 << log_size) * SIGNAL_WORD_SIZE as u32,
        }
    }
}

/// A region placed inside the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    spec: RegionSpec,
    manager: Option<usize>,
    begin_offset: usize,
    region_size: usize,
}

impl RegionLayout {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &RegionSpec {
        &self.spec
    }

    /// Index of the managing region. Always lower than this region's index.
    pub fn manager(&self) -> Option<usize> {
        self.manager
    }

    pub fn begin_offset(&self) -> usize {
        self.begin_offset
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn end_offset(&self) -> usize {
        self.begin_offset + self.region_size
    }

    pub fn offset_of_region_data(&self) -> usize {
        self.spec.offset_of_region_data()
    }

    pub fn guest_to_host_signal_table(&self) -> SignalTableLayout {
        SignalTableLayout::starting_at(0, self.spec.guest_to_host_signal_log_size)
    }

    pub fn host_to_guest_signal_table(&self) -> SignalTableLayout {
        let previous = self.guest_to_host_signal_table();
        SignalTableLayout::starting_at(previous.end_offset(), self.spec.host_to_guest_signal_log_size)
    }
}

/// Ordered arena of regions plus the size of the whole device.
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    regions: Vec<RegionLayout>,
    index_by_name: HashMap<String, usize>,
    page_size: usize,
    device_size: usize,
}

impl SegmentLayout {
    /// Plan the layout using the system page size.
    pub fn plan(specs: Vec<RegionSpec>) -> Result<Self, VsocError> {
        Self::plan_with_page_size(specs, system_page_size())
    }

    pub fn plan_with_page_size(specs: Vec<RegionSpec>, page_size: usize) -> Result<Self, VsocError> {
        if !page_size.is_power_of_two() {
            return Err(VsocError::ConfigurationError(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }

        let mut regions = Vec::with_capacity(specs.len());
        let mut index_by_name: HashMap<String, usize> = HashMap::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            spec.validate()?;
            if index_by_name.contains_key(&spec.name) {
                return Err(VsocError::ConfigurationError(format!(
                    "{} used for more than one region",
                    spec.name
                )));
            }

            // The name is registered only after its manager is resolved, so a
            // region can reference neither itself nor anything declared later.
            let manager = match &spec.managed_by {
                None => None,
                Some(manager_name) => match index_by_name.get(manager_name) {
                    Some(&manager_index) => Some(manager_index),
                    None => {
                        return Err(VsocError::ConfigurationError(format!(
                            "{} managed by unknown region: {}. Manager regions must be \
                             declared before the regions they manage",
                            spec.name, manager_name
                        )));
                    }
                },
            };

            index_by_name.insert(spec.name.clone(), index);
            let region_size = spec.min_region_size(page_size);
            tracing::debug!(region = %spec.name, region_size, "Planned region");
            regions.push(RegionLayout {
                spec,
                manager,
                begin_offset: 0,
                region_size,
            });
        }

        let mut layout = Self {
            regions,
            index_by_name,
            page_size,
            device_size: 0,
        };
        let first_offset = align_up(layout.descriptor_table_size(), page_size);
        layout.update_offsets_from(first_offset, 0);
        Ok(layout)
    }

    pub fn regions(&self) -> &[RegionLayout] {
        &self.regions
    }

    pub fn region(&self, index: usize) -> Option<&RegionLayout> {
        self.regions.get(index)
    }

    pub fn region_by_name(&self, name: &str) -> Option<&RegionLayout> {
        self.index_of(name).map(|index| &self.regions[index])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Smallest power of two that holds the header and every region.
    pub fn device_size(&self) -> usize {
        self.device_size
    }

    /// Bytes taken by the global header and the region descriptor table.
    pub fn descriptor_table_size(&self) -> usize {
        LAYOUT_DESCRIPTOR_SIZE + self.regions.len() * REGION_DESCRIPTOR_SIZE
    }

    /// Grow or shrink a region so that it spans at least `new_min_size`
    /// bytes, page aligned. Regions after it move; regions before it don't.
    ///
    /// Returns false without touching the layout if the region is unknown or
    /// the size cannot hold the signal tables and the payload.
    pub fn resize(&mut self, name: &str, new_min_size: usize) -> bool {
        let Some(index) = self.index_of(name) else {
            tracing::error!(region = %name, "Unable to resize region: region not found");
            return false;
        };

        let page_size = self.page_size;
        let region = &mut self.regions[index];
        let min_required_size = region.spec.min_region_size(page_size);
        let new_size = align_up(new_min_size, page_size);
        if new_size < min_required_size {
            tracing::error!(
                region = %name,
                requested = new_size,
                min_required_size,
                "Requested region size (after alignment) is too small"
            );
            return false;
        }

        region.region_size = new_size;
        let next_offset = region.end_offset();
        self.update_offsets_from(next_offset, index + 1);
        tracing::info!(region = %name, region_size = new_size, device_size = self.device_size, "Resized region");
        true
    }

    /// Serialize the header and descriptor table at the start of `buffer`.
    pub fn write_layout(&self, buffer: &mut [u8]) -> Result<(), VsocError> {
        SegmentDescriptor::from_layout(self)?.write_to(buffer)
    }

    fn update_offsets_from(&mut self, mut offset: usize, index: usize) {
        for region in &mut self.regions[index..] {
            region.begin_offset = offset;
            offset += region.region_size;
        }
        self.device_size = offset.next_power_of_two();
    }
}
