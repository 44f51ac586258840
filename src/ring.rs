/*!
Ring-buffer and epoch primitives shared by both bus engines.

Purpose
- Track how many bytes a free-running, self-retriggering DMA channel has
  deposited into a power-of-two ring, using an epoch counter maintained by
  the channel's reload interrupt plus the live transfer-count register.
- Detect overruns (producer lapped the consumer) and post-callback
  overwrites ("bankruptcy": the engine wrapped and clobbered bytes a
  callback was still reading through an interior slice).
- Provide the bounded SPSC byte queue used for staging data between the
  bridge and the engines.

Total-bytes-written protocol
- The reload interrupt and the hardware count register cannot be read
  atomically together, so `RingCursor::total_written` reads the epoch,
  fences, reads the live count, fences, and re-reads the epoch, retrying
  on a mismatch. A second race remains: on reload the count register
  snaps back to `size` before the interrupt has run, so the computed
  total can come out exactly one ring-size low. That case is detected as
  a negative signed delta against the consumer total and corrected by
  adding one ring-size. Both corrections are load-bearing; see the tests.

Notes
- All totals are wrapping `u32` byte counters; comparisons go through
  signed deltas, never direct ordering.
- `read_idx` from the data model is derived (`total_read & mask`), so an
  overrun recovery is a single cursor assignment and the two can never
  disagree.
*/

use core::sync::atomic::{compiler_fence, Ordering};

/// Consumer-side view of a self-retriggering receive DMA channel.
///
/// Implementations read live hardware state: the transfer-count register
/// (mode bits already masked off), the reload-interrupt epoch counter,
/// and the ring memory itself. `sim::SimRxDma` provides the deterministic
/// model used by the test suite and the demo binary.
pub trait RxDma {
    /// Live remaining-transfer count. Counts down from ring size to 0,
    /// then reloads to ring size when the channel re-triggers.
    fn remaining(&self) -> u32;

    /// Number of completed full passes over the ring, advanced by the
    /// channel's reload interrupt (may briefly lag the hardware reload).
    fn epoch(&self) -> u32;

    /// The ring memory. Length equals the configured ring size.
    fn ring(&self) -> &[u8];
}

/// Consumer cursor over an `RxDma` ring.
///
/// Holds the monotonic (wrapping) consumed-byte total; the ring index is
/// derived from it. One cursor per ring, owned by the main-loop consumer.
pub struct RingCursor {
    size: u32,
    mask: u32,
    total_read: u32,
}

impl RingCursor {
    /// Create a cursor for a ring of `size` bytes. `size` must be a
    /// power of two (the hardware address-wrap mode requires it).
    pub fn new(size: u32) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        Self {
            size,
            mask: size - 1,
            total_read: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Ring index of the next unread byte.
    #[inline]
    pub fn read_idx(&self) -> u32 {
        self.total_read & self.mask
    }

    /// Monotonic consumed-byte total (wrapping).
    #[inline]
    pub fn total_read(&self) -> u32 {
        self.total_read
    }

    /// Consume `n` bytes.
    #[inline]
    pub fn advance(&mut self, n: u32) {
        self.total_read = self.total_read.wrapping_add(n);
    }

    /// Jump the cursor to the producer position reported by `total_written`.
    #[inline]
    pub fn resync_to(&mut self, total_written: u32) {
        self.total_read = total_written;
    }

    /// Total bytes the channel has written since start (wrapping).
    ///
    /// Implements the double-read protocol described in the module docs:
    /// epoch snapshot, fence, live count, fence, epoch re-read with
    /// restart on mismatch, then the reload-latency correction against
    /// the consumer total.
    pub fn total_written(&self, dma: &impl RxDma) -> u32 {
        let total = loop {
            let epoch = dma.epoch();
            compiler_fence(Ordering::SeqCst);
            let remaining = dma.remaining();
            compiler_fence(Ordering::SeqCst);
            if epoch == dma.epoch() {
                break epoch
                    .wrapping_mul(self.size)
                    .wrapping_add(self.size.wrapping_sub(remaining));
            }
        };
        // Reload raced the epoch interrupt: count already snapped back to
        // `size` but the epoch has not advanced yet, so `total` is one
        // ring-size low and sits behind the consumer total.
        if (total.wrapping_sub(self.total_read) as i32) < 0 {
            total.wrapping_add(self.size)
        } else {
            total
        }
    }

    /// Bytes produced but not yet consumed.
    #[inline]
    pub fn unread(&self, dma: &impl RxDma) -> u32 {
        self.total_written(dma).wrapping_sub(self.total_read)
    }

    /// Overrun test: true when the producer has lapped the consumer.
    ///
    /// On overrun the cursor is resynchronized to the producer position;
    /// the caller must discard any in-flight parser state and count the
    /// event.
    pub fn check_overrun(&mut self, dma: &impl RxDma) -> bool {
        let total = self.total_written(dma);
        if total.wrapping_sub(self.total_read) > self.size {
            self.total_read = total;
            true
        } else {
            false
        }
    }

    /// Bankruptcy test for a zero-copy span handed to a callback.
    ///
    /// `span_start_total` is the consumer total captured when the span's
    /// first byte was consumed. If the producer has since advanced more
    /// than one full ring past that point, the span's bytes may have been
    /// overwritten while the callback was reading them.
    pub fn span_overwritten(&self, dma: &impl RxDma, span_start_total: u32) -> bool {
        self.total_written(dma).wrapping_sub(span_start_total) > self.size
    }
}

/// Contiguous view of `len` ring bytes starting at `start_idx`.
///
/// When the range does not straddle the ring boundary the returned slice
/// points directly into the ring; otherwise the two pieces are assembled
/// into `scratch` (which must hold at least `len` bytes). Either way the
/// view is only as fresh as the DMA engine allows; callers hand it to a
/// callback and run the bankruptcy test afterwards.
pub fn view_span<'a>(ring: &'a [u8], start_idx: u32, len: usize, scratch: &'a mut [u8]) -> &'a [u8] {
    let size = ring.len();
    let start = start_idx as usize;
    if start + len <= size {
        &ring[start..start + len]
    } else {
        let first = size - start;
        scratch[..first].copy_from_slice(&ring[start..]);
        scratch[first..len].copy_from_slice(&ring[..len - first]);
        &scratch[..len]
    }
}

/// Copy `dst.len()` ring bytes starting at `start_idx` into `dst`,
/// handling boundary wrap. Used when the consumer needs the bytes out of
/// the engine's reach before acting on them; pair with the bankruptcy
/// test to validate the copy window.
pub fn copy_span(ring: &[u8], start_idx: u32, dst: &mut [u8]) {
    let size = ring.len();
    let start = start_idx as usize;
    let len = dst.len();
    if start + len <= size {
        dst.copy_from_slice(&ring[start..start + len]);
    } else {
        let first = size - start;
        dst[..first].copy_from_slice(&ring[start..]);
        dst[first..].copy_from_slice(&ring[..len - first]);
    }
}

/// Bounded single-producer/single-consumer circular byte buffer.
///
/// Backs the SPI TX queue, the SPI RX queue and the per-device TX
/// buffers. Capacity is a power of two so positions wrap with a mask.
pub struct ByteQueue {
    buf: Box<[u8]>,
    mask: usize,
    head: usize, // next byte to read
    tail: usize, // next byte to write
    len: usize,
}

impl ByteQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "queue capacity must be a power of two");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            mask: capacity - 1,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append as many bytes as fit; returns the number accepted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free());
        for &b in &data[..to_write] {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) & self.mask;
        }
        self.len += to_write;
        to_write
    }

    /// Append all bytes or none. Returns false (and leaves the queue
    /// untouched) when `data` does not fit.
    pub fn write_all(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        let written = self.write(data);
        debug_assert_eq!(written, data.len());
        true
    }

    /// Drain up to `dst.len()` bytes into `dst`; returns the count copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let to_read = dst.len().min(self.len);
        for slot in &mut dst[..to_read] {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) & self.mask;
        }
        self.len -= to_read;
        to_read
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}
