use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::errors::VsocError;
use crate::lock::SpinLock;
use crate::paths::SOCKET_FORWARD_REGION;
use crate::segment::{RegionView, SharedSegment};
use crate::signal::{POLL_INTERVAL, Side, SignalWorker};

use super::packet::{PACKET_HEADER_SIZE, Packet};
use super::queue::{PacketQueue, QUEUE_SIZE, ReadOutcome, STATE_OFFSET};

/// Number of queue pairs, and therefore of simultaneous connections.
pub const NUM_QUEUES: usize = 16;

// Control block at the start of the region data.
const SEQ_NUM_OFFSET: usize = 0;
const GENERATION_OFFSET: usize = 4;
const TEARDOWN_OFFSET: usize = 8;
const CONTROL_SIZE: usize = 16;

// Queue pair header, followed by the host->guest and guest->host queues.
const PORT_OFFSET: usize = 0;
const STATE_LOCK_OFFSET: usize = 4;
const PAIR_HEADER_SIZE: usize = 16;
pub const QUEUE_PAIR_SIZE: usize = PAIR_HEADER_SIZE + 2 * QUEUE_SIZE;

/// Bytes of region data the socket forward layout needs.
pub const REGION_LAYOUT_SIZE: usize = CONTROL_SIZE + NUM_QUEUES * QUEUE_PAIR_SIZE;

const QUEUES_EXHAUSTED_RETRY: Duration = Duration::from_secs(10);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Inactive = 0,
    HostConnected = 1,
    BothConnected = 2,
    HostClosed = 3,
    GuestClosed = 4,
}

impl QueueState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(QueueState::Inactive),
            1 => Some(QueueState::HostConnected),
            2 => Some(QueueState::BothConnected),
            3 => Some(QueueState::HostClosed),
            4 => Some(QueueState::GuestClosed),
            _ => None,
        }
    }

    fn closed_by(side: Side) -> Self {
        match side {
            Side::Host => QueueState::HostClosed,
            Side::Guest => QueueState::GuestClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    HostToGuest,
    GuestToHost,
}

impl Direction {
    fn written_by(side: Side) -> Self {
        match side {
            Side::Host => Direction::HostToGuest,
            Side::Guest => Direction::GuestToHost,
        }
    }

    fn read_by(side: Side) -> Self {
        Self::written_by(side.peer())
    }
}

/// One side's view of the socket forward region.
///
/// The host opens connections, the guest accepts them. Each connection owns
/// one queue pair until both sides have closed both directions.
pub struct SocketForwardRegion {
    region: RegionView,
    side: Side,
    last_seq: AtomicU32,
    torn_down: AtomicBool,
}

impl SocketForwardRegion {
    pub fn open(segment: &Arc<SharedSegment>, side: Side) -> Result<Arc<Self>, VsocError> {
        Self::new(segment.region(SOCKET_FORWARD_REGION)?, side)
    }

    pub fn new(region: RegionView, side: Side) -> Result<Arc<Self>, VsocError> {
        if region.data_len() < REGION_LAYOUT_SIZE {
            return Err(VsocError::SizeMismatch {
                needed: REGION_LAYOUT_SIZE,
                available: region.data_len(),
            });
        }
        let view = Self {
            region,
            side,
            last_seq: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
        };
        let seq_num = view.control_word(SEQ_NUM_OFFSET).load(Ordering::Acquire);
        view.last_seq.store(seq_num, Ordering::Relaxed);
        Ok(Arc::new(view))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn region(&self) -> &RegionView {
        &self.region
    }

    /// Incremented every time a forwarding process cleans up the region.
    pub fn generation(&self) -> u32 {
        self.control_word(GENERATION_OFFSET).load(Ordering::Acquire)
    }

    pub fn port(&self, connection_id: usize) -> u32 {
        self.pair_word(connection_id, PORT_OFFSET).load(Ordering::Acquire)
    }

    /// This side called `shutdown`. Only then do `open_connection` and
    /// `accept_connection` give up.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Either side called `shutdown` and the peer hasn't cleaned up since.
    /// Live connections end, new ones can still be made.
    fn connections_ended(&self) -> bool {
        self.is_torn_down() || self.control_word(TEARDOWN_OFFSET).load(Ordering::Acquire) != 0
    }

    pub fn start_worker(&self) -> Result<SignalWorker, VsocError> {
        self.region.start_worker(self.side)
    }

    /// Host side. Claim a free queue pair for `port` and block until the
    /// guest accepts it, waiting through guest restarts. `None` once this
    /// side is shut down.
    pub fn open_connection(self: &Arc<Self>, port: u32) -> Option<(Sender, Receiver)> {
        if self.side != Side::Host {
            tracing::error!("Only the host side can open connections");
            return None;
        }

        let connection_id = self.acquire_connection_id(port)?;
        let queue = self.queue(connection_id, Direction::HostToGuest);
        loop {
            let state = self.queue_state(&queue);
            if state != QueueState::HostConnected {
                break;
            }
            if self.is_torn_down() {
                self.reset_queue_states(connection_id);
                return None;
            }
            self.region.wait_for_signal(
                queue.field_offset(STATE_OFFSET),
                state as u32,
                POLL_INTERVAL,
            );
        }

        tracing::info!(connection_id, port, "Opened connection");
        Some(self.connection(connection_id))
    }

    /// Guest side. Block until the host opens a connection and claim it.
    /// `None` once this side is shut down.
    pub fn accept_connection(self: &Arc<Self>) -> Option<(Sender, Receiver)> {
        if self.side != Side::Guest {
            tracing::error!("Only the guest side can accept connections");
            return None;
        }

        loop {
            if !self.wait_for_new_connection() {
                return None;
            }
            if let Some(connection_id) = self.claim_waiting_connection() {
                tracing::info!(connection_id, port = self.port(connection_id), "Accepted connection");
                return Some(self.connection(connection_id));
            }
        }
    }

    /// Discard state a previous instance of this side left behind.
    ///
    /// Connected write queues receive BEGIN and END so the peer's readers
    /// finish, queue states move to closed or inactive, and the generation
    /// number is bumped so stale traffic is ignored.
    pub fn clean_up_previous_connections(&self) {
        let recovered = self.recover();
        let generation = self.generation();
        let mut begin = Packet::make_begin();
        begin.set_generation(generation);
        let mut end = Packet::make_end();
        end.set_generation(generation);

        for connection_id in 0..NUM_QUEUES {
            let queue = self.queue(connection_id, Direction::written_by(self.side));
            let state = {
                let lock = self.state_lock(connection_id);
                let _guard = lock.lock(self.side);
                let mut state = self.queue_state(&queue);
                if self.side == Side::Guest && state == QueueState::HostConnected {
                    self.set_state(&queue, QueueState::BothConnected);
                    let other = self.queue(connection_id, Direction::read_by(self.side));
                    self.set_state(&other, QueueState::BothConnected);
                    state = QueueState::BothConnected;
                }
                state
            };

            if state == QueueState::BothConnected
                || (self.side == Side::Host && state == QueueState::HostConnected)
            {
                tracing::info!(connection_id, "Found connected write queue, sending begin and end");
                if !queue.try_write(self.side, begin.raw_data())
                    || !queue.try_write(self.side, end.raw_data())
                {
                    tracing::warn!(connection_id, "No room to close stale connection");
                }
            }
            self.reset_queue_states(connection_id);
        }

        if self.side == Side::Guest {
            let seq_num = self.control_word(SEQ_NUM_OFFSET).load(Ordering::Acquire);
            self.last_seq.store(seq_num, Ordering::Relaxed);
        }
        self.control_word(TEARDOWN_OFFSET).store(0, Ordering::Release);
        let generation = self
            .control_word(GENERATION_OFFSET)
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        tracing::info!(side = %self.side, generation, recovered, "Cleaned up previous connections");
    }

    /// Stop this side's accept and open loops and end the live connections
    /// of both sides, then wake every waiter. The peer keeps accepting or
    /// opening until this side's next instance cleans up.
    pub fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(side = %self.side, "Tearing down socket forward region");
        self.control_word(TEARDOWN_OFFSET).store(1, Ordering::Release);

        self.region
            .send_signal(self.side, self.control_offset(SEQ_NUM_OFFSET));
        for connection_id in 0..NUM_QUEUES {
            for direction in [Direction::HostToGuest, Direction::GuestToHost] {
                let queue = self.queue(connection_id, direction);
                self.region.send_signal(self.side, queue.head_offset());
                self.region.send_signal(self.side, queue.tail_offset());
                self.region
                    .send_signal(self.side, queue.field_offset(STATE_OFFSET));
            }
        }
    }

    fn acquire_connection_id(&self, port: u32) -> Option<usize> {
        loop {
            for connection_id in 0..NUM_QUEUES {
                let lock = self.state_lock(connection_id);
                let _guard = lock.lock(self.side);
                let host_to_guest = self.queue(connection_id, Direction::HostToGuest);
                let guest_to_host = self.queue(connection_id, Direction::GuestToHost);

                if self.queue_state(&host_to_guest) == QueueState::Inactive
                    && self.queue_state(&guest_to_host) == QueueState::Inactive
                {
                    // Nobody touches an inactive pair, so leftovers of the
                    // previous connection can go.
                    host_to_guest.discard();
                    guest_to_host.discard();
                    self.pair_word(connection_id, PORT_OFFSET)
                        .store(port, Ordering::Release);
                    self.set_state(&host_to_guest, QueueState::HostConnected);
                    self.set_state(&guest_to_host, QueueState::HostConnected);

                    let seq_num = self
                        .control_word(SEQ_NUM_OFFSET)
                        .fetch_add(1, Ordering::AcqRel)
                        .wrapping_add(1);
                    tracing::debug!(connection_id, seq_num, "Acquired queue pair");
                    self.region
                        .send_signal(self.side, self.control_offset(SEQ_NUM_OFFSET));
                    return Some(connection_id);
                }
            }

            tracing::error!("No remaining queues for connection, sleeping");
            let deadline = Instant::now() + QUEUES_EXHAUSTED_RETRY;
            while Instant::now() < deadline {
                if self.is_torn_down() {
                    return None;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn wait_for_new_connection(&self) -> bool {
        let seq_word = self.control_word(SEQ_NUM_OFFSET);
        loop {
            let last = self.last_seq.load(Ordering::Relaxed);
            if seq_word.load(Ordering::Acquire) != last {
                self.last_seq.store(last.wrapping_add(1), Ordering::Relaxed);
                return true;
            }
            if self.is_torn_down() {
                return false;
            }
            self.region.wait_for_signal(
                self.control_offset(SEQ_NUM_OFFSET),
                last,
                POLL_INTERVAL,
            );
        }
    }

    fn claim_waiting_connection(&self) -> Option<usize> {
        for connection_id in 0..NUM_QUEUES {
            let lock = self.state_lock(connection_id);
            let _guard = lock.lock(self.side);
            let host_to_guest = self.queue(connection_id, Direction::HostToGuest);
            let guest_to_host = self.queue(connection_id, Direction::GuestToHost);

            if self.queue_state(&host_to_guest) != QueueState::HostConnected {
                continue;
            }
            if self.queue_state(&guest_to_host) != QueueState::HostConnected {
                tracing::warn!(connection_id, "Queue pair half connected, skipping");
                continue;
            }
            tracing::debug!(connection_id, "Found waiting connection");
            self.set_state(&host_to_guest, QueueState::BothConnected);
            self.set_state(&guest_to_host, QueueState::BothConnected);
            return Some(connection_id);
        }
        None
    }

    fn connection(self: &Arc<Self>, connection_id: usize) -> (Sender, Receiver) {
        let generation = self.generation();
        let sender = Sender::new(self.clone(), connection_id, generation);
        let receiver = Receiver {
            region: self.clone(),
            connection_id,
            generation,
            got_begin: false,
        };
        (sender, receiver)
    }

    fn send_packet(&self, connection_id: usize, packet: &Packet) -> bool {
        let queue = self.queue(connection_id, Direction::written_by(self.side));
        let peer_closed = QueueState::closed_by(self.side.peer());
        {
            let lock = self.state_lock(connection_id);
            let _guard = lock.lock(self.side);
            let state = self.queue_state(&queue);
            if state == peer_closed {
                tracing::debug!(connection_id, "Connection closed, not sending");
                return false;
            }
            if state == QueueState::Inactive {
                tracing::warn!(connection_id, "Sending on inactive queue");
                return false;
            }
        }

        queue.write(self.side, packet.raw_data(), || {
            self.connections_ended() || self.queue_state(&queue) == peer_closed
        })
    }

    /// Read the next record into `packet`. False on teardown, on a closed
    /// and drained queue, or on a malformed record.
    fn recv_packet(&self, connection_id: usize, packet: &mut Packet) -> bool {
        let queue = self.queue(connection_id, Direction::read_by(self.side));
        let peer_closed = QueueState::closed_by(self.side.peer());
        let outcome = queue.read(self.side, packet.raw_buffer_mut(), || {
            if self.connections_ended() {
                return true;
            }
            let state = self.queue_state(&queue);
            state == peer_closed || state == QueueState::Inactive
        });

        match outcome {
            ReadOutcome::Record(length) => {
                let valid = packet
                    .validate()
                    .and_then(|()| {
                        if length == PACKET_HEADER_SIZE + packet.payload_length() {
                            Ok(())
                        } else {
                            Err(VsocError::InvalidPacket(format!(
                                "record of {} bytes for {} payload bytes",
                                length,
                                packet.payload_length()
                            )))
                        }
                    });
                match valid {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(connection_id, %err, "Dropping malformed packet");
                        false
                    }
                }
            }
            ReadOutcome::Aborted => false,
            ReadOutcome::Corrupt => false,
        }
    }

    fn ignore_until_begin(&self, connection_id: usize, generation: u32, packet: &mut Packet) -> bool {
        loop {
            if !self.recv_packet(connection_id, packet) {
                return false;
            }
            if packet.is_begin() && is_current_generation(packet.generation(), generation) {
                return true;
            }
            tracing::debug!(connection_id, ?packet, "Ignoring packet before begin");
        }
    }

    fn mark_queue_disconnected(&self, connection_id: usize, direction: Direction) {
        let queue = self.queue(connection_id, direction);

        if self.side == Side::Host {
            // Let the guest see the connection first so states follow the
            // normal transitions.
            loop {
                let state = {
                    let lock = self.state_lock(connection_id);
                    let _guard = lock.lock(self.side);
                    self.queue_state(&queue)
                };
                if state != QueueState::HostConnected || self.connections_ended() {
                    break;
                }
                tracing::warn!(connection_id, "Closing queue in HOST_CONNECTED state, waiting");
                self.region.wait_for_signal(
                    queue.field_offset(STATE_OFFSET),
                    state as u32,
                    POLL_INTERVAL,
                );
            }
        }

        let lock = self.state_lock(connection_id);
        let _guard = lock.lock(self.side);
        let next = match self.queue_state(&queue) {
            state if state == QueueState::closed_by(self.side.peer()) => QueueState::Inactive,
            QueueState::Inactive => QueueState::Inactive,
            _ => QueueState::closed_by(self.side),
        };
        self.set_state(&queue, next);
    }

    fn reset_queue_states(&self, connection_id: usize) {
        let lock = self.state_lock(connection_id);
        let _guard = lock.lock(self.side);
        let this_closed = QueueState::closed_by(self.side);
        let peer_closed = QueueState::closed_by(self.side.peer());

        for direction in [Direction::HostToGuest, Direction::GuestToHost] {
            let queue = self.queue(connection_id, direction);
            match self.queue_state(&queue) {
                state if state == QueueState::HostConnected || state == peer_closed => {
                    tracing::debug!(connection_id, ?direction, ?state, "Marking queue inactive");
                    self.set_state(&queue, QueueState::Inactive);
                }
                QueueState::BothConnected => {
                    tracing::debug!(connection_id, ?direction, "Marking queue closed by this side");
                    self.set_state(&queue, this_closed);
                }
                _ => {}
            }
        }
    }

    fn recover(&self) -> bool {
        let mut recovered = false;
        for connection_id in 0..NUM_QUEUES {
            recovered |= self.state_lock(connection_id).recover(self.side);
            for direction in [Direction::HostToGuest, Direction::GuestToHost] {
                recovered |= self.queue(connection_id, direction).recover();
            }
        }
        recovered
    }

    fn is_other_side_recv_closed(&self, connection_id: usize) -> bool {
        let queue = self.queue(connection_id, Direction::written_by(self.side));
        let lock = self.state_lock(connection_id);
        let _guard = lock.lock(self.side);
        let state = self.queue_state(&queue);
        state == QueueState::closed_by(self.side.peer()) || state == QueueState::Inactive
    }

    fn queue_state(&self, queue: &PacketQueue<'_>) -> QueueState {
        let raw = queue.state_word().load(Ordering::Acquire);
        QueueState::from_u32(raw).unwrap_or_else(|| {
            tracing::warn!(raw, "Unknown queue state, treating as inactive");
            QueueState::Inactive
        })
    }

    fn set_state(&self, queue: &PacketQueue<'_>, state: QueueState) {
        queue.state_word().store(state as u32, Ordering::Release);
        self.region
            .send_signal(self.side, queue.field_offset(STATE_OFFSET));
    }

    fn queue(&self, connection_id: usize, direction: Direction) -> PacketQueue<'_> {
        let offset = pair_offset(connection_id)
            + PAIR_HEADER_SIZE
            + match direction {
                Direction::HostToGuest => 0,
                Direction::GuestToHost => QUEUE_SIZE,
            };
        PacketQueue::new(&self.region, offset)
    }

    fn state_lock(&self, connection_id: usize) -> SpinLock<'_> {
        SpinLock::new(self.pair_word(connection_id, STATE_LOCK_OFFSET))
    }

    fn pair_word(&self, connection_id: usize, field: usize) -> &AtomicU32 {
        self.region
            .word(self.data_offset(pair_offset(connection_id) + field))
    }

    fn control_word(&self, field: usize) -> &AtomicU32 {
        self.region.word(self.control_offset(field))
    }

    fn control_offset(&self, field: usize) -> u32 {
        self.data_offset(field)
    }

    fn data_offset(&self, offset: usize) -> u32 {
        (self.region.offset_of_region_data() + offset) as u32
    }
}

/// A BEGIN stamped with `packet_generation` opens a stream expecting
/// `generation` unless it predates it. Generations wrap.
fn is_current_generation(packet_generation: u32, generation: u32) -> bool {
    packet_generation.wrapping_sub(generation) < u32::MAX / 2
}

fn pair_offset(connection_id: usize) -> usize {
    assert!(connection_id < NUM_QUEUES, "connection id {} out of range", connection_id);
    CONTROL_SIZE + connection_id * QUEUE_PAIR_SIZE
}

/// Writing half of a connection.
///
/// Announces itself with a BEGIN packet. Dropping it sends END and marks the
/// write queue closed by this side.
pub struct Sender {
    region: Arc<SocketForwardRegion>,
    connection_id: usize,
    generation: u32,
}

impl Sender {
    fn new(region: Arc<SocketForwardRegion>, connection_id: usize, generation: u32) -> Self {
        let mut begin = Packet::make_begin();
        begin.set_generation(generation);
        if !region.send_packet(connection_id, &begin) {
            tracing::debug!(connection_id, "Peer gone before begin was sent");
        }
        Self {
            region,
            connection_id,
            generation,
        }
    }

    /// Queue `packet` for the peer, blocking while the queue is full.
    ///
    /// Returns false once the peer stopped receiving or the channel is torn
    /// down. Empty data packets are not put on the wire.
    pub fn send(&self, packet: &Packet) -> bool {
        if packet.is_empty() {
            return !self.closed();
        }
        if let Err(err) = packet.validate() {
            tracing::error!(connection_id = self.connection_id, %err, "Refusing to send invalid packet");
            return false;
        }
        self.region.send_packet(self.connection_id, packet)
    }

    /// The peer closed its receiving half or the channel is torn down.
    pub fn closed(&self) -> bool {
        self.region.connections_ended() || self.region.is_other_side_recv_closed(self.connection_id)
    }

    pub fn port(&self) -> u32 {
        self.region.port(self.connection_id)
    }

    pub fn connection_id(&self) -> usize {
        self.connection_id
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut end = Packet::make_end();
        end.set_generation(self.generation);
        self.region.send_packet(self.connection_id, &end);
        self.region
            .mark_queue_disconnected(self.connection_id, Direction::written_by(self.region.side));
    }
}

/// Reading half of a connection. Dropping it marks the read queue closed.
pub struct Receiver {
    region: Arc<SocketForwardRegion>,
    connection_id: usize,
    generation: u32,
    got_begin: bool,
}

impl Receiver {
    pub fn recv(&mut self) -> Packet {
        let mut packet = Packet::make_data();
        self.recv_into(&mut packet);
        packet
    }

    /// Block until the next data packet. On END from the peer, teardown or
    /// a malformed packet, `packet` becomes an end-of-stream packet.
    pub fn recv_into(&mut self, packet: &mut Packet) {
        if !self.got_begin {
            if !self
                .region
                .ignore_until_begin(self.connection_id, self.generation, packet)
            {
                packet.reset_to_end(self.generation);
                return;
            }
            self.got_begin = true;
        }

        loop {
            if !self.region.recv_packet(self.connection_id, packet) {
                packet.reset_to_end(self.generation);
                return;
            }
            if packet.is_begin() {
                continue;
            }
            if packet.is_empty() {
                tracing::error!(connection_id = self.connection_id, "Zero length data packet received, closing stream");
                packet.reset_to_end(self.generation);
            }
            return;
        }
    }

    pub fn port(&self) -> u32 {
        self.region.port(self.connection_id)
    }

    pub fn connection_id(&self) -> usize {
        self.connection_id
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.region
            .mark_queue_disconnected(self.connection_id, Direction::read_by(self.region.side));
    }
}
