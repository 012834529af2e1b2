//! Compiled-in device table.
//!
//! Host and guest build the same table, but only the host writes it into the
//! segment. The guest reads whatever descriptor table it finds.

use crate::errors::VsocError;
use crate::layout::{RegionSpec, SegmentLayout};
use crate::paths::{
    AUDIO_DATA_REGION, GRALLOC_MANAGER_REGION, GRALLOC_MEMORY_REGION, INPUT_EVENTS_REGION,
    RIL_REGION, SCREEN_REGION, SOCKET_FORWARD_REGION, WIFI_EXCHANGE_REGION,
};
use crate::socket_forward::REGION_LAYOUT_SIZE;

pub const INPUT_EVENTS_PAYLOAD_SIZE: usize = 3 * 4096;
pub const SCREEN_PAYLOAD_SIZE: usize = 4096;
pub const GRALLOC_MANAGER_PAYLOAD_SIZE: usize = 4096;
/// Sized at runtime with `SegmentLayout::resize`.
pub const GRALLOC_MEMORY_PAYLOAD_SIZE: usize = 0;
pub const WIFI_EXCHANGE_PAYLOAD_SIZE: usize = 4096;
pub const RIL_PAYLOAD_SIZE: usize = 4096;
pub const AUDIO_DATA_PAYLOAD_SIZE: usize = 16 * 4096;

/// log2 of the signal slots per direction for the socket forward region.
/// Larger than other regions because every queue pair signals through it.
pub const SOCKET_FORWARD_SIGNAL_LOG_SIZE: u32 = 7;

const DEFAULT_SIGNAL_LOG_SIZE: u32 = 2;

pub fn default_region_specs() -> Vec<RegionSpec> {
    let d = DEFAULT_SIGNAL_LOG_SIZE;
    vec![
        // Region 0 doubles as the "no manager" sentinel and must not manage.
        RegionSpec::new(INPUT_EVENTS_REGION, INPUT_EVENTS_PAYLOAD_SIZE, d, d),
        RegionSpec::new(SCREEN_REGION, SCREEN_PAYLOAD_SIZE, d, d),
        RegionSpec::new(GRALLOC_MANAGER_REGION, GRALLOC_MANAGER_PAYLOAD_SIZE, d, d),
        RegionSpec::new(GRALLOC_MEMORY_REGION, GRALLOC_MEMORY_PAYLOAD_SIZE, 0, 0)
            .managed_by(GRALLOC_MANAGER_REGION),
        RegionSpec::new(
            SOCKET_FORWARD_REGION,
            REGION_LAYOUT_SIZE,
            SOCKET_FORWARD_SIGNAL_LOG_SIZE,
            SOCKET_FORWARD_SIGNAL_LOG_SIZE,
        ),
        RegionSpec::new(WIFI_EXCHANGE_REGION, WIFI_EXCHANGE_PAYLOAD_SIZE, d, d),
        RegionSpec::new(RIL_REGION, RIL_PAYLOAD_SIZE, d, d),
        RegionSpec::new(AUDIO_DATA_REGION, AUDIO_DATA_PAYLOAD_SIZE, d, d),
    ]
}

pub fn default_layout() -> Result<SegmentLayout, VsocError> {
    SegmentLayout::plan(default_region_specs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SegmentDescriptor;

    #[test]
    fn test_default_layout_plans_and_serializes() {
        let layout = SegmentLayout::plan_with_page_size(default_region_specs(), 4096).unwrap();
        let mut buffer = vec![0u8; layout.descriptor_table_size()];
        layout.write_layout(&mut buffer).unwrap();

        let parsed = SegmentDescriptor::read_from(&buffer).unwrap();
        assert_eq!(parsed.regions.len(), 8);

        let (_, socket_forward) = parsed.region_by_name(SOCKET_FORWARD_REGION).unwrap();
        assert_eq!(socket_forward.guest_to_host_signal_table.num_nodes(), 128);
        assert_eq!(socket_forward.host_to_guest_signal_table.num_nodes(), 128);
        assert!(socket_forward.data_size() >= REGION_LAYOUT_SIZE);
    }

    #[test]
    fn test_gralloc_memory_is_managed() {
        let layout = SegmentLayout::plan_with_page_size(default_region_specs(), 4096).unwrap();
        let manager = layout.index_of(GRALLOC_MANAGER_REGION).unwrap();
        let memory = layout.region_by_name(GRALLOC_MEMORY_REGION).unwrap();

        assert_eq!(memory.manager(), Some(manager));
        assert!(layout.regions()[0].manager().is_none());
    }

    #[test]
    fn test_gralloc_memory_can_grow() {
        let mut layout = SegmentLayout::plan_with_page_size(default_region_specs(), 4096).unwrap();
        let before = layout.device_size();

        assert!(layout.resize(GRALLOC_MEMORY_REGION, 64 * 1024 * 1024));
        assert!(layout.device_size() > before);
    }
}
