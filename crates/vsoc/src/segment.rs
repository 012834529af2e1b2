use crate::descriptor::{LAYOUT_DESCRIPTOR_SIZE, RegionDescriptor, SegmentDescriptor};
use crate::errors::VsocError;
use crate::layout::{SIGNAL_WORD_SIZE, SegmentLayout, SignalTableLayout};
use crate::signal::{SignalTable, SignalWorker, Side, futex_wait, futex_wake};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// A mapped shared memory segment and its decoded descriptor table.
///
/// The descriptor table is read once at map time and treated as immutable;
/// only words inside regions change afterwards, always through atomics.
pub struct SharedSegment {
    _file: File,
    _mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
    descriptor: SegmentDescriptor,
}

// All access to the mapping goes through atomics or through ring buffer
// copies ordered by atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create (or truncate) the backing file, write `layout` into it and
    /// reset every signal table.
    pub fn create(path: impl AsRef<Path>, layout: &SegmentLayout) -> Result<Arc<Self>, VsocError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.set_len(layout.device_size() as u64)?;

        let mut mmap = unsafe { MmapOptions::new().len(layout.device_size()).map_mut(&file)? };
        layout.write_layout(&mut mmap[..])?;
        let descriptor = SegmentDescriptor::read_from(&mmap[..])?;

        let segment = Self::from_parts(file, mmap, descriptor);
        for region in &segment.descriptor.regions {
            segment.signal_table(region, &region.guest_to_host_signal_table).reset();
            segment.signal_table(region, &region.host_to_guest_signal_table).reset();
        }

        tracing::info!(
            path = %path.display(),
            size = segment.len,
            regions = segment.descriptor.regions.len(),
            "Created shared memory segment"
        );
        Ok(Arc::new(segment))
    }

    /// Map an existing segment written by either side.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, VsocError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let file_len = file.metadata()?.len() as usize;
        if file_len < LAYOUT_DESCRIPTOR_SIZE {
            return Err(VsocError::SizeMismatch {
                needed: LAYOUT_DESCRIPTOR_SIZE,
                available: file_len,
            });
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let descriptor = SegmentDescriptor::read_from(&mmap[..])?;
        if descriptor.header.size as usize > mmap.len() {
            return Err(VsocError::SizeMismatch {
                needed: descriptor.header.size as usize,
                available: mmap.len(),
            });
        }

        let segment = Self::from_parts(file, mmap, descriptor);
        tracing::info!(
            path = %path.display(),
            size = segment.len,
            regions = segment.descriptor.regions.len(),
            "Opened shared memory segment"
        );
        Ok(Arc::new(segment))
    }

    /// Open the segment if the file exists, otherwise create it from `layout`.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        layout: &SegmentLayout,
    ) -> Result<Arc<Self>, VsocError> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!(path = %path.display(), "Shared memory file exists, reusing it");
            Self::open(path)
        } else {
            Self::create(path, layout)
        }
    }

    fn from_parts(file: File, mut mmap: MmapMut, descriptor: SegmentDescriptor) -> Self {
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            _file: file,
            _mmap: mmap,
            base,
            len,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn region(self: &Arc<Self>, name: &str) -> Result<RegionView, VsocError> {
        let (index, _) = self
            .descriptor
            .region_by_name(name)
            .ok_or_else(|| VsocError::RegionNotFound(name.to_string()))?;
        Ok(RegionView {
            segment: self.clone(),
            index,
        })
    }

    pub fn region_at(self: &Arc<Self>, index: usize) -> Result<RegionView, VsocError> {
        if index >= self.descriptor.regions.len() {
            return Err(VsocError::RegionNotFound(format!("index {}", index)));
        }
        Ok(RegionView {
            segment: self.clone(),
            index,
        })
    }

    /// `count` consecutive words starting at absolute `offset`.
    fn words(&self, offset: usize, count: usize) -> &[AtomicU32] {
        assert_eq!(offset % SIGNAL_WORD_SIZE, 0, "unaligned word offset {}", offset);
        assert!(
            offset + count * SIGNAL_WORD_SIZE <= self.len,
            "words [{}, +{}) outside the segment",
            offset,
            count
        );
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset) as *const AtomicU32, count)
        }
    }

    fn signal_table(&self, region: &RegionDescriptor, table: &SignalTableLayout) -> SignalTable<'_> {
        let begin = region.begin_offset as usize;
        let slots = self.words(begin + table.table_offset as usize, table.num_nodes());
        let interrupt = &self.words(begin + table.interrupt_word_offset as usize, 1)[0];
        SignalTable::new(slots, interrupt)
    }
}

/// Handle on one region of a mapped segment. Cheap to clone.
#[derive(Clone)]
pub struct RegionView {
    segment: Arc<SharedSegment>,
    index: usize,
}

impl RegionView {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &RegionDescriptor {
        &self.segment.descriptor.regions[self.index]
    }

    pub fn name(&self) -> &str {
        &self.descriptor().device_name
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Region-relative offset where the payload starts.
    pub fn offset_of_region_data(&self) -> usize {
        self.descriptor().offset_of_region_data as usize
    }

    pub fn data_len(&self) -> usize {
        self.descriptor().data_size()
    }

    /// The 32-bit word at region-relative `offset`.
    ///
    /// Panics if the offset is unaligned or outside the region.
    pub fn word(&self, offset: u32) -> &AtomicU32 {
        self.try_word(offset).unwrap_or_else(|| {
            panic!("word offset {} invalid for region '{}'", offset, self.name())
        })
    }

    pub(crate) fn try_word(&self, offset: u32) -> Option<&AtomicU32> {
        let offset = offset as usize;
        if offset % SIGNAL_WORD_SIZE != 0 || offset + SIGNAL_WORD_SIZE > self.descriptor().region_size() {
            return None;
        }
        let begin = self.descriptor().begin_offset as usize;
        Some(&self.segment.words(begin + offset, 1)[0])
    }

    /// Pointer to the first payload byte. Valid for `data_len()` bytes while
    /// the view is alive.
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        let offset = self.descriptor().begin_offset as usize + self.offset_of_region_data();
        unsafe { self.segment.base.as_ptr().add(offset) }
    }

    /// Wake waiters on the word at `offset` on both sides of the mapping.
    pub fn send_signal(&self, side: Side, offset: u32) {
        if let Some(word) = self.try_word(offset) {
            futex_wake(word);
        }
        self.outgoing_signal_table(side).post(offset);
    }

    /// Block while the word at `offset` holds `expected`, at most `timeout`.
    pub fn wait_for_signal(&self, offset: u32, expected: u32, timeout: Duration) {
        futex_wait(self.word(offset), expected, timeout);
    }

    /// Start the thread that turns the peer's posted signals into local
    /// wakeups. Dropping the returned worker stops it.
    pub fn start_worker(&self, side: Side) -> Result<SignalWorker, VsocError> {
        SignalWorker::spawn(self.clone(), side)
    }

    pub(crate) fn outgoing_signal_table(&self, side: Side) -> SignalTable<'_> {
        let region = self.descriptor();
        let table = match side {
            Side::Host => &region.host_to_guest_signal_table,
            Side::Guest => &region.guest_to_host_signal_table,
        };
        self.segment.signal_table(region, table)
    }

    pub(crate) fn incoming_signal_table(&self, side: Side) -> SignalTable<'_> {
        self.outgoing_signal_table(side.peer())
    }
}

impl std::fmt::Debug for RegionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionView")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("data_len", &self.data_len())
            .finish()
    }
}
