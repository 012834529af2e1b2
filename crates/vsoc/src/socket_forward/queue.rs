//! Single-producer single-consumer packet ring inside the socket forward region.
//!
//! ```text
//! 0   head   total bytes written (producer only)
//! 4   tail   total bytes consumed (consumer only)
//! 8   state  QueueState of this direction
//! 12  reserved
//! 16  buffer QUEUE_BUFFER_SIZE bytes
//! ```
//!
//! Records are a little endian u32 length followed by that many bytes, padded
//! to 4 bytes. Counters wrap at u32; positions are taken modulo the buffer
//! size, which is a power of two, so a length prefix never straddles the end.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::layout::align_up;
use crate::segment::RegionView;
use crate::signal::{POLL_INTERVAL, Side};

use super::packet::MAX_PACKET_SIZE;

pub const QUEUE_BUFFER_SIZE: usize = 1 << 16;
pub const QUEUE_HEADER_SIZE: usize = 16;
pub const QUEUE_SIZE: usize = QUEUE_HEADER_SIZE + QUEUE_BUFFER_SIZE;

const HEAD_OFFSET: usize = 0;
const TAIL_OFFSET: usize = 4;
pub(crate) const STATE_OFFSET: usize = 8;
const LENGTH_PREFIX_SIZE: usize = 4;

const _: () = assert!(QUEUE_BUFFER_SIZE.is_power_of_two());
const _: () = assert!(record_size(MAX_PACKET_SIZE) <= QUEUE_BUFFER_SIZE);

const fn record_size(length: usize) -> usize {
    LENGTH_PREFIX_SIZE + align_up(length, 4)
}

pub(crate) enum ReadOutcome {
    Record(usize),
    Aborted,
    Corrupt,
}

pub(crate) struct PacketQueue<'a> {
    region: &'a RegionView,
    /// Offset of the queue header relative to the region data.
    offset: usize,
}

impl<'a> PacketQueue<'a> {
    pub(crate) fn new(region: &'a RegionView, offset: usize) -> Self {
        debug_assert!(offset % 4 == 0);
        debug_assert!(offset + QUEUE_SIZE <= region.data_len());
        Self { region, offset }
    }

    /// Region-relative offset of a header field, usable as a signal offset.
    pub(crate) fn field_offset(&self, field: usize) -> u32 {
        (self.region.offset_of_region_data() + self.offset + field) as u32
    }

    fn field(&self, field: usize) -> &'a AtomicU32 {
        self.region.word(self.field_offset(field))
    }

    pub(crate) fn state_word(&self) -> &'a AtomicU32 {
        self.field(STATE_OFFSET)
    }

    pub(crate) fn head_offset(&self) -> u32 {
        self.field_offset(HEAD_OFFSET)
    }

    pub(crate) fn tail_offset(&self) -> u32 {
        self.field_offset(TAIL_OFFSET)
    }

    fn buffer(&self) -> *mut u8 {
        unsafe {
            self.region
                .data_ptr()
                .add(self.offset + QUEUE_HEADER_SIZE)
        }
    }

    fn used(&self) -> usize {
        let head = self.field(HEAD_OFFSET).load(Ordering::Acquire);
        let tail = self.field(TAIL_OFFSET).load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    /// Append one record, blocking while the ring is full.
    ///
    /// Returns false without writing if `abort` turns true first.
    pub(crate) fn write(&self, side: Side, bytes: &[u8], abort: impl Fn() -> bool) -> bool {
        let needed = record_size(bytes.len());
        loop {
            if abort() {
                return false;
            }
            let tail = self.field(TAIL_OFFSET).load(Ordering::Acquire);
            if QUEUE_BUFFER_SIZE - self.used() >= needed {
                break;
            }
            self.region
                .wait_for_signal(self.tail_offset(), tail, POLL_INTERVAL);
        }
        self.push(side, bytes);
        true
    }

    /// Append one record only if it fits right now.
    pub(crate) fn try_write(&self, side: Side, bytes: &[u8]) -> bool {
        if QUEUE_BUFFER_SIZE - self.used() < record_size(bytes.len()) {
            return false;
        }
        self.push(side, bytes);
        true
    }

    fn push(&self, side: Side, bytes: &[u8]) {
        let head_word = self.field(HEAD_OFFSET);
        let head = head_word.load(Ordering::Relaxed);
        let position = head as usize % QUEUE_BUFFER_SIZE;

        self.copy_in(position, &(bytes.len() as u32).to_le_bytes());
        self.copy_in((position + LENGTH_PREFIX_SIZE) % QUEUE_BUFFER_SIZE, bytes);

        head_word.store(
            head.wrapping_add(record_size(bytes.len()) as u32),
            Ordering::Release,
        );
        self.region.send_signal(side, self.head_offset());
    }

    /// Pop one record into `out`, blocking while the ring is empty.
    pub(crate) fn read(&self, side: Side, out: &mut [u8], abort: impl Fn() -> bool) -> ReadOutcome {
        let head_word = self.field(HEAD_OFFSET);
        let tail_word = self.field(TAIL_OFFSET);

        let (head, tail) = loop {
            let tail = tail_word.load(Ordering::Relaxed);
            let head = head_word.load(Ordering::Acquire);
            if head != tail {
                break (head, tail);
            }
            if abort() {
                return ReadOutcome::Aborted;
            }
            self.region
                .wait_for_signal(self.head_offset(), head, POLL_INTERVAL);
        };

        let available = head.wrapping_sub(tail) as usize;
        let position = tail as usize % QUEUE_BUFFER_SIZE;
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.copy_out(position, &mut prefix);
        let length = u32::from_le_bytes(prefix) as usize;

        if available > QUEUE_BUFFER_SIZE || length > out.len() || record_size(length) > available {
            tracing::error!(
                length,
                available,
                capacity = out.len(),
                "Corrupt record in packet queue, discarding queued bytes"
            );
            tail_word.store(head, Ordering::Release);
            self.region.send_signal(side, self.tail_offset());
            return ReadOutcome::Corrupt;
        }

        self.copy_out((position + LENGTH_PREFIX_SIZE) % QUEUE_BUFFER_SIZE, &mut out[..length]);
        tail_word.store(
            tail.wrapping_add(record_size(length) as u32),
            Ordering::Release,
        );
        self.region.send_signal(side, self.tail_offset());
        ReadOutcome::Record(length)
    }

    /// Drop everything queued. Only safe while neither side uses the queue.
    pub(crate) fn discard(&self) {
        let head = self.field(HEAD_OFFSET).load(Ordering::Acquire);
        self.field(TAIL_OFFSET).store(head, Ordering::Release);
    }

    /// Repair counters left inconsistent by a crashed peer.
    pub(crate) fn recover(&self) -> bool {
        if self.used() > QUEUE_BUFFER_SIZE || self.used() % 4 != 0 {
            tracing::warn!(offset = self.offset, "Resetting inconsistent packet queue");
            self.discard();
            return true;
        }
        false
    }

    fn copy_in(&self, position: usize, bytes: &[u8]) {
        let first = bytes.len().min(QUEUE_BUFFER_SIZE - position);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buffer().add(position), first);
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.buffer(), bytes.len() - first);
        }
    }

    fn copy_out(&self, position: usize, out: &mut [u8]) {
        let first = out.len().min(QUEUE_BUFFER_SIZE - position);
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer().add(position), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(self.buffer(), out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{RegionSpec, SegmentLayout};
    use crate::segment::SharedSegment;
    use tempfile::tempdir;

    fn region() -> (tempfile::TempDir, RegionView) {
        let dir = tempdir().unwrap();
        let layout = SegmentLayout::plan(vec![RegionSpec::new("queue", QUEUE_SIZE, 2, 2)]).unwrap();
        let segment = SharedSegment::create(dir.path().join("segment"), &layout).unwrap();
        let region = segment.region("queue").unwrap();
        (dir, region)
    }

    #[test]
    fn test_records_come_out_in_order() {
        let (_dir, region) = region();
        let queue = PacketQueue::new(&region, 0);
        let mut out = vec![0u8; MAX_PACKET_SIZE];

        assert!(queue.write(Side::Host, b"first", || false));
        assert!(queue.write(Side::Host, b"second!", || false));

        match queue.read(Side::Guest, &mut out, || false) {
            ReadOutcome::Record(n) => assert_eq!(&out[..n], b"first"),
            _ => panic!("expected a record"),
        }
        match queue.read(Side::Guest, &mut out, || false) {
            ReadOutcome::Record(n) => assert_eq!(&out[..n], b"second!"),
            _ => panic!("expected a record"),
        }
    }

    #[test]
    fn test_records_wrap_around_the_buffer() {
        let (_dir, region) = region();
        let queue = PacketQueue::new(&region, 0);
        let mut out = vec![0u8; MAX_PACKET_SIZE];

        // odd sizes walk the write position across the end several times
        for round in 0..40u32 {
            let record: Vec<u8> = (0..5001u32).map(|i| (i + round) as u8).collect();
            assert!(queue.write(Side::Host, &record, || false));
            match queue.read(Side::Guest, &mut out, || false) {
                ReadOutcome::Record(n) => assert_eq!(&out[..n], &record[..], "round {}", round),
                _ => panic!("expected a record"),
            }
        }
    }

    #[test]
    fn test_read_aborts_when_empty() {
        let (_dir, region) = region();
        let queue = PacketQueue::new(&region, 0);
        let mut out = vec![0u8; 16];

        assert!(matches!(
            queue.read(Side::Guest, &mut out, || true),
            ReadOutcome::Aborted
        ));
    }

    #[test]
    fn test_write_aborts_when_full() {
        let (_dir, region) = region();
        let queue = PacketQueue::new(&region, 0);
        let record = vec![1u8; MAX_PACKET_SIZE];

        let mut written = 0;
        while queue.try_write(Side::Host, &record) {
            written += 1;
        }
        assert_eq!(written, QUEUE_BUFFER_SIZE / record_size(MAX_PACKET_SIZE));
        assert!(!queue.write(Side::Host, &record, || true));
    }

    #[test]
    fn test_oversized_record_is_corrupt() {
        let (_dir, region) = region();
        let queue = PacketQueue::new(&region, 0);
        let mut small = vec![0u8; 2];

        assert!(queue.write(Side::Host, b"too long", || false));
        assert!(matches!(
            queue.read(Side::Guest, &mut small, || false),
            ReadOutcome::Corrupt
        ));
        assert_eq!(queue.used(), 0, "corrupt bytes are discarded");
    }
}
