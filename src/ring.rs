//! Lock-free rings connecting the producer and consumer threads.
//!
//! [`SampleRing`] carries the resampled audio frames from the protocol thread
//! to the audio thread. Its distinguishing property is the *signed* frame
//! count: the consumer may read past the write position, in which case the
//! shortfall is zero-filled and recorded as owed frames (a negative count).
//! Slews use the same arithmetic in reverse, retracting or pre-arming frames
//! by moving a counter instead of shuffling data.
//!
//! [`TimingRing`](timing_ring) is the only other cross-thread channel: a
//! bounded SPSC queue of device clock ticks, pushed by the audio thread and
//! drained by the protocol thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

/// One device-clock record published per consumer wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    /// Frames moved during the period that just completed.
    pub period_frames: usize,
    /// Predicted wall time of the next wakeup, in nanoseconds.
    pub next_time_ns: i64,
    /// Cumulative frame position at `next_time_ns`.
    pub next_position: i64,
}

/// Capacity of the tick queue. Overruns are not fatal: the newest tick is
/// dropped and the producer-side correction is delayed by one drain.
pub const TICK_CAPACITY: usize = 16;

/// Consumer-side half of the tick queue.
pub struct TimingTx {
    inner: rtrb::Producer<ClockTick>,
}

impl TimingTx {
    /// Publish a tick, silently dropping it if the producer has not drained
    /// the queue for [`TICK_CAPACITY`] periods.
    pub fn publish(&mut self, tick: ClockTick) {
        if self.inner.push(tick).is_err() {
            debug!("timing ring full, dropping tick");
        }
    }
}

/// Producer-side half of the tick queue.
pub struct TimingRx {
    inner: rtrb::Consumer<ClockTick>,
}

impl TimingRx {
    /// Pop the oldest pending tick, if any. Callers drain in a loop.
    pub fn pop(&mut self) -> Option<ClockTick> {
        self.inner.pop().ok()
    }
}

/// Create a connected tick queue pair.
pub fn timing_ring() -> (TimingTx, TimingRx) {
    let (tx, rx) = rtrb::RingBuffer::new(TICK_CAPACITY);
    (TimingTx { inner: tx }, TimingRx { inner: rx })
}

struct Storage {
    capacity_frames: usize,
    data: UnsafeCell<Box<[f32]>>,
}

impl Storage {
    fn new(capacity_frames: usize, channels: usize) -> Box<Self> {
        Box::new(Self {
            capacity_frames,
            data: UnsafeCell::new(vec![0.0f32; capacity_frames * channels].into_boxed_slice()),
        })
    }

    fn slot(&self, position: i64, channels: usize) -> usize {
        position.rem_euclid(self.capacity_frames as i64) as usize * channels
    }
}

/// Ring of interleaved `f32` frames with signed-count semantics.
///
/// Single producer (append side), single consumer (consume side). The count
/// is `appended - consumed` and may be negative; a negative count never
/// yields non-silence on a read. Capacity grows automatically on append, so
/// appends never block and never drop frames. The consumer path performs no
/// allocation and takes no locks; a storage swap in flight is detected with
/// a generation counter and the copy is retried.
pub struct SampleRing {
    channels: usize,
    appended: AtomicI64,
    consumed: AtomicI64,
    generation: AtomicU64,
    storage: AtomicPtr<Storage>,
    // Old storage blocks parked during growth. Only the producer touches
    // this; blocks are freed when the ring is dropped.
    retired: Mutex<Vec<Box<Storage>>>,
}

unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Create a ring holding `capacity_frames` interleaved frames.
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity_frames = capacity_frames.max(1).next_power_of_two();
        Self {
            channels,
            appended: AtomicI64::new(0),
            consumed: AtomicI64::new(0),
            generation: AtomicU64::new(0),
            storage: AtomicPtr::new(Box::into_raw(Storage::new(capacity_frames, channels))),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Interleaved channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Signed frame count: appended minus consumed. Negative when the
    /// consumer has read ahead of the producer.
    pub fn count(&self) -> i64 {
        self.appended.load(Ordering::Acquire) - self.consumed.load(Ordering::Acquire)
    }

    /// Append interleaved frames. Grows the storage if needed.
    pub fn append(&self, frames: &[f32]) {
        let n = (frames.len() / self.channels) as i64;
        if n == 0 {
            return;
        }
        self.reserve(n);
        let start = self.appended.load(Ordering::Relaxed);
        let storage = unsafe { &*self.storage.load(Ordering::Relaxed) };
        self.write_span(storage, start, n, Some(frames));
        self.appended.store(start + n, Ordering::Release);
    }

    /// Append `n` frames of silence, or retract `|n|` unplayed frames when
    /// `n` is negative. Used by slews.
    pub fn append_silence(&self, n: i64) {
        if n == 0 {
            return;
        }
        if n < 0 {
            self.appended.fetch_add(n, Ordering::AcqRel);
            return;
        }
        self.reserve(n);
        let start = self.appended.load(Ordering::Relaxed);
        let storage = unsafe { &*self.storage.load(Ordering::Relaxed) };
        self.write_span(storage, start, n, None);
        self.appended.store(start + n, Ordering::Release);
    }

    /// Fill `dst` with the next frames. When fewer frames are available than
    /// requested the shortfall is zero-filled and the count goes negative.
    /// Never blocks and never allocates.
    pub fn consume(&self, dst: &mut [f32]) {
        let n = (dst.len() / self.channels) as i64;
        if n == 0 {
            return;
        }
        let read = self.consumed.load(Ordering::Relaxed);
        let write = self.appended.load(Ordering::Acquire);
        let readable = (write - read).clamp(0, n);

        if readable > 0 {
            self.read_span(read, &mut dst[..readable as usize * self.channels]);
        }
        dst[readable as usize * self.channels..].fill(0.0);
        self.consumed.store(read + n, Ordering::Release);
    }

    /// Discard `n` frames without copying, or rewind the read position by
    /// `|n|` frames when `n` is negative. Rewinding re-exposes history (or
    /// silence, if nothing was ever written there), which is how the
    /// consumer pre-arms startup silence and absorbs backward slews.
    pub fn discard(&self, n: i64) {
        self.consumed.fetch_add(n, Ordering::AcqRel);
    }

    fn reserve(&self, n: i64) {
        let storage = unsafe { &*self.storage.load(Ordering::Relaxed) };
        let used = (self.appended.load(Ordering::Relaxed) - self.consumed.load(Ordering::Acquire))
            .max(0) as usize;
        let needed = used + n as usize;
        if needed <= storage.capacity_frames {
            return;
        }
        let mut capacity = storage.capacity_frames;
        while capacity < needed {
            capacity *= 2;
        }
        self.grow(capacity);
    }

    fn grow(&self, capacity_frames: usize) {
        let old_ptr = self.storage.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let new = Storage::new(capacity_frames, self.channels);
        let write = self.appended.load(Ordering::Relaxed);
        let lo = write - old.capacity_frames as i64;

        {
            let src = unsafe { &*old.data.get() };
            let dst = unsafe { &mut *new.data.get() };
            for position in lo..write {
                let from = old.slot(position, self.channels);
                let to = new.slot(position, self.channels);
                dst[to..to + self.channels].copy_from_slice(&src[from..from + self.channels]);
            }
        }

        debug!(
            from = old.capacity_frames,
            to = capacity_frames,
            "sample ring grow"
        );

        // Odd generation marks the swap in progress; a concurrent consumer
        // copy retries until it observes a stable even value.
        self.generation.fetch_add(1, Ordering::Release);
        let replaced = self.storage.swap(Box::into_raw(new), Ordering::Release);
        self.generation.fetch_add(1, Ordering::Release);
        self.retired.lock().push(unsafe { Box::from_raw(replaced) });
    }

    fn write_span(&self, storage: &Storage, start: i64, n: i64, frames: Option<&[f32]>) {
        let data = unsafe { &mut *storage.data.get() };
        let capacity = storage.capacity_frames as i64;
        let mut src_offset = 0usize;
        let mut position = start;
        let mut remaining = n;
        while remaining > 0 {
            let slot = storage.slot(position, self.channels);
            let contiguous = (capacity - position.rem_euclid(capacity)).min(remaining) as usize;
            let samples = contiguous * self.channels;
            match frames {
                Some(frames) => {
                    data[slot..slot + samples]
                        .copy_from_slice(&frames[src_offset..src_offset + samples]);
                    src_offset += samples;
                }
                None => data[slot..slot + samples].fill(0.0),
            }
            position += contiguous as i64;
            remaining -= contiguous as i64;
        }
    }

    fn read_span(&self, start: i64, dst: &mut [f32]) {
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            if generation & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let storage = unsafe { &*self.storage.load(Ordering::Acquire) };
            let data = unsafe { &*storage.data.get() };
            let capacity = storage.capacity_frames as i64;
            let n = (dst.len() / self.channels) as i64;
            let mut dst_offset = 0usize;
            let mut position = start;
            let mut remaining = n;
            while remaining > 0 {
                let slot = storage.slot(position, self.channels);
                let contiguous = (capacity - position.rem_euclid(capacity)).min(remaining) as usize;
                let samples = contiguous * self.channels;
                dst[dst_offset..dst_offset + samples].copy_from_slice(&data[slot..slot + samples]);
                dst_offset += samples;
                position += contiguous as i64;
                remaining -= contiguous as i64;
            }
            if self.generation.load(Ordering::Acquire) == generation {
                return;
            }
        }
    }
}

impl Drop for SampleRing {
    fn drop(&mut self) {
        let ptr = self.storage.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Monotonic timestamp in nanoseconds since an arbitrary process-local epoch.
pub fn now_ns() -> i64 {
    static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as i64
}
