//! Well-known names shared by the host and guest sides.
//!
//! Both processes are built from this crate, so keeping the segment path and
//! region names here avoids mismatches between the side that writes the
//! layout and the side that looks regions up by name.

/// Default backing file for the shared memory segment.
pub const SHARED_MEMORY_PATH: &str = "/dev/shm/vsoc_shared_memory";

pub const INPUT_EVENTS_REGION: &str = "input_events";
pub const SCREEN_REGION: &str = "screen";
pub const GRALLOC_MANAGER_REGION: &str = "gralloc_manager";
pub const GRALLOC_MEMORY_REGION: &str = "gralloc_memory";
pub const SOCKET_FORWARD_REGION: &str = "socket_forward";
pub const WIFI_EXCHANGE_REGION: &str = "wifi_exchange";
pub const RIL_REGION: &str = "ril";
pub const AUDIO_DATA_REGION: &str = "audio_data";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DEVICE_NAME_SIZE;

    #[test]
    fn test_path_is_absolute() {
        assert!(SHARED_MEMORY_PATH.starts_with('/'));
    }

    #[test]
    fn test_region_names_fit_descriptor() {
        for name in [
            INPUT_EVENTS_REGION,
            SCREEN_REGION,
            GRALLOC_MANAGER_REGION,
            GRALLOC_MEMORY_REGION,
            SOCKET_FORWARD_REGION,
            WIFI_EXCHANGE_REGION,
            RIL_REGION,
            AUDIO_DATA_REGION,
        ] {
            assert!(
                name.len() < DEVICE_NAME_SIZE,
                "{} must leave room for the nul terminator",
                name
            );
        }
    }
}
