//! Multiplexed byte-stream channel over the `socket_forward` region.
//!
//! The region holds a small control block and [`NUM_QUEUES`] queue pairs.
//! Each open connection owns one pair: one ring per direction plus a state
//! word per ring, guarded by a shared spin lock.

pub mod packet;
mod queue;
mod region;

pub use packet::{MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, MessageType, PACKET_HEADER_SIZE, Packet};
pub use queue::QUEUE_BUFFER_SIZE;
pub use region::{
    NUM_QUEUES, QUEUE_PAIR_SIZE, QueueState, REGION_LAYOUT_SIZE, Receiver, Sender,
    SocketForwardRegion,
};
