pub mod descriptor;
pub mod errors;
pub mod layout;
pub mod lock;
pub mod paths;
pub mod regions;
pub mod segment;
pub mod signal;
pub mod socket_forward;

pub use descriptor::{RegionDescriptor, SegmentDescriptor};
pub use errors::VsocError;
pub use layout::{RegionLayout, RegionSpec, SegmentLayout, SignalTableLayout};
pub use segment::{RegionView, SharedSegment};
pub use signal::{Side, SignalWorker};
pub use socket_forward::{Packet, Receiver, Sender, SocketForwardRegion};
