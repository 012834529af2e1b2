pub mod config;
pub mod forward;
pub mod guest;
pub mod host;
pub mod maintainer;

pub use config::{PortPair, ProxyConfig, Role};
pub use forward::{PacketSink, PacketSource, launch_workers};
