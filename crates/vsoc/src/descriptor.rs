//! On-segment layout descriptors.
//!
//! The first bytes of the segment hold a [`LayoutDescriptor`] followed by one
//! [`RegionDescriptor`] per region. Both are encoded little endian with fixed
//! field offsets so that either side can decode them without sharing Rust
//! type layouts:
//!
//! ```text
//! LayoutDescriptor (16 bytes)
//!   0  major_version u16     2  minor_version u16
//!   4  size u32              8  region_count u32
//!  12  region_desc_offset u32
//!
//! RegionDescriptor (60 bytes)
//!   0  current_version u16   2  min_compatible_version u16
//!   4  region_begin_offset   8  region_end_offset
//!  12  offset_of_region_data
//!  16  device_name [u8; 16], nul padded
//!  32  guest_to_host table: table_offset, num_nodes_lg2, interrupt_signalled_offset
//!  44  host_to_guest table: same fields
//!  56  managed_by u32
//! ```

use crate::errors::VsocError;
use crate::layout::{SIGNAL_WORD_SIZE, SegmentLayout, SignalTableLayout};

pub const CURRENT_MAJOR_VERSION: u16 = 2;
pub const CURRENT_MINOR_VERSION: u16 = 0;

pub const LAYOUT_DESCRIPTOR_SIZE: usize = 16;
pub const SIGNAL_TABLE_DESCRIPTOR_SIZE: usize = 12;
pub const REGION_DESCRIPTOR_SIZE: usize = 60;
pub const DEVICE_NAME_SIZE: usize = 16;

/// `managed_by` value of a region without a manager. Index 0 can therefore
/// never act as a manager.
pub const NO_MANAGER: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDescriptor {
    pub major_version: u16,
    pub minor_version: u16,
    pub size: u32,
    pub region_count: u32,
    pub region_desc_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub current_version: u16,
    pub min_compatible_version: u16,
    pub begin_offset: u32,
    pub end_offset: u32,
    pub offset_of_region_data: u32,
    pub device_name: String,
    pub guest_to_host_signal_table: SignalTableLayout,
    pub host_to_guest_signal_table: SignalTableLayout,
    pub managed_by: u32,
}

impl RegionDescriptor {
    pub fn region_size(&self) -> usize {
        (self.end_offset - self.begin_offset) as usize
    }

    /// Bytes available to the region's payload.
    pub fn data_size(&self) -> usize {
        self.region_size() - self.offset_of_region_data as usize
    }

    pub fn manager(&self) -> Option<usize> {
        (self.managed_by != NO_MANAGER).then_some(self.managed_by as usize)
    }
}

/// Decoded header plus descriptor table of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub header: LayoutDescriptor,
    pub regions: Vec<RegionDescriptor>,
}

impl SegmentDescriptor {
    pub fn from_layout(layout: &SegmentLayout) -> Result<Self, VsocError> {
        let header = LayoutDescriptor {
            major_version: CURRENT_MAJOR_VERSION,
            minor_version: CURRENT_MINOR_VERSION,
            size: to_u32(layout.device_size(), "device size")?,
            region_count: to_u32(layout.regions().len(), "region count")?,
            region_desc_offset: LAYOUT_DESCRIPTOR_SIZE as u32,
        };

        let mut regions = Vec::with_capacity(layout.regions().len());
        for region in layout.regions() {
            let managed_by = match region.manager() {
                Some(manager) if manager as u32 == NO_MANAGER => {
                    return Err(VsocError::ConfigurationError(format!(
                        "region '{}' is managed by the region at index {}, which is reserved \
                         for regions without a manager",
                        region.name(),
                        manager
                    )));
                }
                Some(manager) => manager as u32,
                None => NO_MANAGER,
            };

            let guest_to_host = region.guest_to_host_signal_table();
            let host_to_guest = region.host_to_guest_signal_table();
            let offset_of_region_data = region.offset_of_region_data();
            if host_to_guest.end_offset() as usize > offset_of_region_data
                || guest_to_host.end_offset() > host_to_guest.table_offset
            {
                return Err(VsocError::InvalidLayout(format!(
                    "signal tables of region '{}' overlap its data",
                    region.name()
                )));
            }

            regions.push(RegionDescriptor {
                current_version: 0,
                min_compatible_version: 0,
                begin_offset: to_u32(region.begin_offset(), "region begin")?,
                end_offset: to_u32(region.end_offset(), "region end")?,
                offset_of_region_data: to_u32(offset_of_region_data, "region data offset")?,
                device_name: region.name().to_string(),
                guest_to_host_signal_table: guest_to_host,
                host_to_guest_signal_table: host_to_guest,
                managed_by,
            });
        }

        Ok(Self { header, regions })
    }

    /// Bytes needed to encode the header and descriptor table.
    pub fn encoded_size(&self) -> usize {
        self.header.region_desc_offset as usize + self.regions.len() * REGION_DESCRIPTOR_SIZE
    }

    pub fn write_to(&self, buffer: &mut [u8]) -> Result<(), VsocError> {
        let needed = self.encoded_size();
        if buffer.len() < needed {
            return Err(VsocError::SizeMismatch {
                needed,
                available: buffer.len(),
            });
        }

        let header = &self.header;
        put_u16(buffer, 0, header.major_version);
        put_u16(buffer, 2, header.minor_version);
        put_u32(buffer, 4, header.size);
        put_u32(buffer, 8, header.region_count);
        put_u32(buffer, 12, header.region_desc_offset);

        let table = header.region_desc_offset as usize;
        for (index, region) in self.regions.iter().enumerate() {
            let base = table + index * REGION_DESCRIPTOR_SIZE;
            put_u16(buffer, base, region.current_version);
            put_u16(buffer, base + 2, region.min_compatible_version);
            put_u32(buffer, base + 4, region.begin_offset);
            put_u32(buffer, base + 8, region.end_offset);
            put_u32(buffer, base + 12, region.offset_of_region_data);

            let name = &mut buffer[base + 16..base + 16 + DEVICE_NAME_SIZE];
            name.fill(0);
            let bytes = region.device_name.as_bytes();
            let len = bytes.len().min(DEVICE_NAME_SIZE - 1);
            name[..len].copy_from_slice(&bytes[..len]);

            put_signal_table(buffer, base + 32, &region.guest_to_host_signal_table);
            put_signal_table(buffer, base + 44, &region.host_to_guest_signal_table);
            put_u32(buffer, base + 56, region.managed_by);
        }
        Ok(())
    }

    /// Decode and validate the descriptors at the start of `buffer`.
    pub fn read_from(buffer: &[u8]) -> Result<Self, VsocError> {
        if buffer.len() < LAYOUT_DESCRIPTOR_SIZE {
            return Err(VsocError::SizeMismatch {
                needed: LAYOUT_DESCRIPTOR_SIZE,
                available: buffer.len(),
            });
        }

        let header = LayoutDescriptor {
            major_version: get_u16(buffer, 0),
            minor_version: get_u16(buffer, 2),
            size: get_u32(buffer, 4),
            region_count: get_u32(buffer, 8),
            region_desc_offset: get_u32(buffer, 12),
        };

        if header.major_version != CURRENT_MAJOR_VERSION {
            return Err(VsocError::IncompatibleVersion {
                major: header.major_version,
                minor: header.minor_version,
                expected: CURRENT_MAJOR_VERSION,
            });
        }

        let table = header.region_desc_offset as usize;
        let needed = table + header.region_count as usize * REGION_DESCRIPTOR_SIZE;
        if table < LAYOUT_DESCRIPTOR_SIZE || needed > header.size as usize {
            return Err(VsocError::InvalidLayout(format!(
                "descriptor table [{}, {}) does not fit a segment of {} bytes",
                table, needed, header.size
            )));
        }
        if buffer.len() < needed {
            return Err(VsocError::SizeMismatch {
                needed,
                available: buffer.len(),
            });
        }

        let mut regions = Vec::with_capacity(header.region_count as usize);
        for index in 0..header.region_count as usize {
            let base = table + index * REGION_DESCRIPTOR_SIZE;
            let region = RegionDescriptor {
                current_version: get_u16(buffer, base),
                min_compatible_version: get_u16(buffer, base + 2),
                begin_offset: get_u32(buffer, base + 4),
                end_offset: get_u32(buffer, base + 8),
                offset_of_region_data: get_u32(buffer, base + 12),
                device_name: get_name(&buffer[base + 16..base + 16 + DEVICE_NAME_SIZE])?,
                guest_to_host_signal_table: get_signal_table(buffer, base + 32),
                host_to_guest_signal_table: get_signal_table(buffer, base + 44),
                managed_by: get_u32(buffer, base + 56),
            };
            validate_region(&region, index, header.size)?;
            regions.push(region);
        }

        Ok(Self { header, regions })
    }

    pub fn region_by_name(&self, name: &str) -> Option<(usize, &RegionDescriptor)> {
        self.regions
            .iter()
            .enumerate()
            .find(|(_, region)| region.device_name == name)
    }
}

fn validate_region(region: &RegionDescriptor, index: usize, size: u32) -> Result<(), VsocError> {
    let invalid = |reason: &str| {
        Err(VsocError::InvalidLayout(format!(
            "region {} ('{}'): {}",
            index, region.device_name, reason
        )))
    };

    if region.begin_offset > region.end_offset || region.end_offset > size {
        return invalid("region bounds fall outside the segment");
    }
    if region.offset_of_region_data as usize > region.region_size() {
        return invalid("data offset past the end of the region");
    }
    for table in [
        &region.guest_to_host_signal_table,
        &region.host_to_guest_signal_table,
    ] {
        if table.num_nodes_log2 > 31 {
            return invalid("signal table too large");
        }
        let table_end = table.table_offset as u64 + (table.num_nodes() * SIGNAL_WORD_SIZE) as u64;
        let interrupt_end = table.interrupt_word_offset as u64 + SIGNAL_WORD_SIZE as u64;
        if table.table_offset as usize % SIGNAL_WORD_SIZE != 0
            || table.interrupt_word_offset as usize % SIGNAL_WORD_SIZE != 0
            || table_end > region.offset_of_region_data as u64
            || interrupt_end > region.offset_of_region_data as u64
        {
            return invalid("signal table outside the signalling section");
        }
    }
    if region.managed_by != NO_MANAGER && region.managed_by as usize >= index {
        return invalid("manager must precede the managed region");
    }
    Ok(())
}

fn to_u32(value: usize, what: &str) -> Result<u32, VsocError> {
    u32::try_from(value)
        .map_err(|_| VsocError::InvalidLayout(format!("{} {} does not fit in 32 bits", what, value)))
}

fn put_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_signal_table(buffer: &mut [u8], offset: usize, table: &SignalTableLayout) {
    put_u32(buffer, offset, table.table_offset);
    put_u32(buffer, offset + 4, table.num_nodes_log2);
    put_u32(buffer, offset + 8, table.interrupt_word_offset);
}

fn get_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn get_u32(buffer: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_signal_table(buffer: &[u8], offset: usize) -> SignalTableLayout {
    SignalTableLayout {
        table_offset: get_u32(buffer, offset),
        num_nodes_log2: get_u32(buffer, offset + 4),
        interrupt_word_offset: get_u32(buffer, offset + 8),
    }
}

fn get_name(bytes: &[u8]) -> Result<String, VsocError> {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..len].to_vec())
        .map_err(|_| VsocError::InvalidLayout("region name is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RegionSpec;

    fn layout() -> SegmentLayout {
        SegmentLayout::plan_with_page_size(
            vec![
                RegionSpec::new("input_events", 512, 2, 2),
                RegionSpec::new("gralloc_manager", 64, 2, 2),
                RegionSpec::new("gralloc_memory", 0, 0, 0).managed_by("gralloc_manager"),
                RegionSpec::new("socket_forward", 8192, 7, 7),
            ],
            4096,
        )
        .unwrap()
    }

    #[test]
    fn test_descriptor_sizes_match_field_offsets() {
        assert_eq!(SIGNAL_TABLE_DESCRIPTOR_SIZE, 3 * 4);
        assert_eq!(
            REGION_DESCRIPTOR_SIZE,
            16 + DEVICE_NAME_SIZE + 2 * SIGNAL_TABLE_DESCRIPTOR_SIZE + 4
        );
    }

    #[test]
    fn test_written_layout_parses_back() {
        let layout = layout();
        let mut buffer = vec![0u8; layout.descriptor_table_size()];
        layout.write_layout(&mut buffer).unwrap();

        let parsed = SegmentDescriptor::read_from(&buffer).unwrap();
        assert_eq!(parsed.header.major_version, CURRENT_MAJOR_VERSION);
        assert_eq!(parsed.header.size as usize, layout.device_size());
        assert_eq!(parsed.regions.len(), layout.regions().len());

        for (descriptor, region) in parsed.regions.iter().zip(layout.regions()) {
            assert_eq!(descriptor.device_name, region.name());
            assert_eq!(descriptor.begin_offset as usize, region.begin_offset());
            assert_eq!(descriptor.end_offset as usize, region.end_offset());
            assert_eq!(
                descriptor.offset_of_region_data as usize,
                region.offset_of_region_data()
            );
            assert_eq!(
                descriptor.host_to_guest_signal_table,
                region.host_to_guest_signal_table()
            );
        }
    }

    #[test]
    fn test_manager_indices_and_sentinel() {
        let layout = layout();
        let descriptor = SegmentDescriptor::from_layout(&layout).unwrap();

        assert_eq!(descriptor.regions[0].managed_by, NO_MANAGER);
        assert_eq!(descriptor.regions[2].managed_by, 1);
        assert_eq!(descriptor.regions[2].manager(), Some(1));
        assert_eq!(descriptor.regions[3].manager(), None);
    }

    #[test]
    fn test_region_zero_cannot_manage() {
        let layout = SegmentLayout::plan_with_page_size(
            vec![
                RegionSpec::new("manager", 64, 1, 1),
                RegionSpec::new("managed", 64, 1, 1).managed_by("manager"),
            ],
            4096,
        )
        .unwrap();

        let mut buffer = vec![0u8; 4096];
        let err = layout.write_layout(&mut buffer).unwrap_err();
        assert!(matches!(err, VsocError::ConfigurationError(_)));
    }

    #[test]
    fn test_write_into_short_buffer_fails() {
        let layout = layout();
        let mut buffer = vec![0u8; LAYOUT_DESCRIPTOR_SIZE];
        assert!(matches!(
            layout.write_layout(&mut buffer),
            Err(VsocError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_major_version_is_rejected() {
        let layout = layout();
        let mut buffer = vec![0u8; layout.descriptor_table_size()];
        layout.write_layout(&mut buffer).unwrap();
        buffer[0..2].copy_from_slice(&1u16.to_le_bytes());

        match SegmentDescriptor::read_from(&buffer) {
            Err(VsocError::IncompatibleVersion { major, expected, .. }) => {
                assert_eq!(major, 1);
                assert_eq!(expected, CURRENT_MAJOR_VERSION);
            }
            other => panic!("Expected IncompatibleVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_region_past_segment_end_is_rejected() {
        let layout = layout();
        let mut buffer = vec![0u8; layout.descriptor_table_size()];
        layout.write_layout(&mut buffer).unwrap();

        // shrink the advertised segment below the last region's end
        let last_begin = layout.regions().last().unwrap().begin_offset() as u32;
        buffer[4..8].copy_from_slice(&last_begin.to_le_bytes());

        assert!(matches!(
            SegmentDescriptor::read_from(&buffer),
            Err(VsocError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_interrupt_word_at_top_of_address_space_is_rejected() {
        let layout = layout();
        let mut buffer = vec![0u8; layout.descriptor_table_size()];
        layout.write_layout(&mut buffer).unwrap();

        // guest_to_host interrupt word of the first region
        let table = get_u32(&buffer, 12) as usize;
        buffer[table + 40..table + 44].copy_from_slice(&0xFFFF_FFFCu32.to_le_bytes());

        assert!(matches!(
            SegmentDescriptor::read_from(&buffer),
            Err(VsocError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_region_lookup_by_name() {
        let layout = layout();
        let descriptor = SegmentDescriptor::from_layout(&layout).unwrap();

        let (index, region) = descriptor.region_by_name("socket_forward").unwrap();
        assert_eq!(index, 3);
        assert!(region.data_size() >= 8192);
        assert!(descriptor.region_by_name("screen").is_none());
    }
}
