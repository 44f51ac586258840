/*!
Parallel-bus slave engine: the 6502-facing side of the bridge.

Purpose
- Capture CPU writes arriving through the PIO RX path and dispatch
  complete `[device][length][payload]` transactions to per-device
  callbacks, reading straight out of the DMA ring.
- Serve CPU read requests (`[device | 0x80]`) byte-by-byte from bounded
  per-device TX buffers via a one-shot response DMA.

Wire protocol (from the CPU's perspective)
- Write: `[device] [length] [payload...]`, device high bit clear,
  length 1..=254 (length 0 is a no-op that returns the parser to idle).
- Read: the CPU writes `[device | 0x80]`, then polls reads. While no
  response is staged the bus returns 0xFF (the output-shift register is
  preloaded to all-ones after every serviced read, and 0xFF cannot
  collide with a length, which is capped at 254). Once staged, reads
  yield `[length] [payload...]`.
- Device 0 is the interrupt-source query: a read request on it answers
  with one byte naming the lowest device with pending data, or 0.

Concurrency
- The RX DMA channel deposits continuously; `task()` consumes per the
  ring cursor's epoch protocol. Overruns reset the parser; a callback
  that was handed an interior ring slice is followed by the bankruptcy
  test, and a hit abandons the transaction and resynchronizes.
- A response DMA stays armed until the CPU drains it; no cancel path.
  A read request that arrives while one is in flight waits its turn.
*/

use log::warn;

use crate::error::Error;
use crate::ring::{view_span, ByteQueue, RingCursor, RxDma};

/// Number of addressable devices (device IDs `0..MAX`).
pub const BUS_MAX_DEVICES: usize = 8;

/// Per-device TX buffer capacity in bytes.
pub const BUS_DEVICE_BUFFER_SIZE: usize = 1024;

/// RX DMA ring size: 2^15 = 32 KiB, base-aligned for address wrap.
pub const BUS_RX_RING_BITS: u32 = 15;
pub const BUS_RX_RING_SIZE: u32 = 1 << BUS_RX_RING_BITS;

/// Longest transfer in either direction (length byte, 0xFF reserved).
pub const BUS_MAX_TRANSFER: usize = 254;

/// Hardware seam for the parallel-bus peripheral: the PIO state machine
/// plus its two DMA channels. `sim::SimBusHw` models it; a board crate
/// implements it over the real peripherals.
pub trait BusHw {
    type Rx: RxDma;

    /// Load the PIO program and claim DMA channels. Fails when the PIO
    /// instruction memory or a DMA channel is unavailable.
    fn configure(&mut self) -> Result<(), Error>;

    /// Enable the PIO state machine (bus becomes live).
    fn enable(&mut self);

    /// Disable the PIO state machine and abort in-flight DMA.
    fn disable(&mut self);

    /// The continuous RX channel depositing CPU writes into the ring.
    fn rx_dma(&self) -> &Self::Rx;

    /// Arm the one-shot response DMA with `[length, payload...]`. The
    /// board widens each byte to a FIFO word and preloads the shift
    /// register sentinel after the transfer drains.
    fn start_tx(&mut self, frame: &[u8]);

    /// True while an armed response has not been fully drained by CPU
    /// reads.
    fn tx_busy(&self) -> bool;
}

/// Callback invoked once per completed CPU write transaction. The slice
/// is only valid for the duration of the call; copy it to keep it.
pub type BusRxCallback = Box<dyn FnMut(u8, &[u8])>;

/// Transaction parser state. `Sending` marks a response DMA in flight;
/// bytes that arrive during it are parsed as a fresh command (the CPU is
/// the only producer and its protocol forces transaction completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtoState {
    Idle,
    GotDevice,
    Receiving,
    Sending,
}

/// Engine statistics. Byte totals are cumulative; event counters tick
/// once per distinct event.
#[derive(Debug, Default, Clone)]
pub struct BusStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dma_overruns: u32,
    pub rx_bankruptcies: u32,
    pub tx_underflows: u32,
    pub invalid_devices: u32,
    /// Bytes refused per device because its TX buffer was full.
    pub device_drops: [u32; BUS_MAX_DEVICES],
}

pub struct BusInterface<H: BusHw> {
    hw: H,
    cursor: RingCursor,
    state: ProtoState,
    current_device: u8,
    transfer_remaining: u16,
    pending_read: Option<u8>,
    underflow_recorded: bool,

    // In-flight write transaction, for zero-copy callback dispatch.
    span_start_idx: u32,
    span_len: u16,
    span_start_total: u32,

    device_buffers: [ByteQueue; BUS_MAX_DEVICES],
    callbacks: [Option<BusRxCallback>; BUS_MAX_DEVICES],

    scratch: [u8; BUS_MAX_TRANSFER],
    staging: [u8; BUS_MAX_TRANSFER + 1],
    stats: BusStats,
}

impl<H: BusHw> BusInterface<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            cursor: RingCursor::new(BUS_RX_RING_SIZE),
            state: ProtoState::Idle,
            current_device: 0,
            transfer_remaining: 0,
            pending_read: None,
            underflow_recorded: false,
            span_start_idx: 0,
            span_len: 0,
            span_start_total: 0,
            device_buffers: core::array::from_fn(|_| ByteQueue::new(BUS_DEVICE_BUFFER_SIZE)),
            callbacks: core::array::from_fn(|_| None),
            scratch: [0; BUS_MAX_TRANSFER],
            staging: [0; BUS_MAX_TRANSFER + 1],
            stats: BusStats::default(),
        }
    }

    /// Configure the peripheral and reset all engine state. Idempotent.
    pub fn init(&mut self) -> Result<(), Error> {
        self.hw.configure()?;
        self.cursor = RingCursor::new(BUS_RX_RING_SIZE);
        self.state = ProtoState::Idle;
        self.pending_read = None;
        self.underflow_recorded = false;
        for buf in &mut self.device_buffers {
            buf.clear();
        }
        self.stats = BusStats::default();
        Ok(())
    }

    /// Enable the bus (the PIO state machine starts sampling PHI2).
    pub fn start(&mut self) {
        self.hw.enable();
    }

    /// Disable the bus and drop any in-flight transaction.
    pub fn stop(&mut self) {
        self.hw.disable();
        self.state = ProtoState::Idle;
    }

    /// Install the callback for a device. Replaces any previous one.
    pub fn register_rx_callback(&mut self, device: u8, callback: BusRxCallback) {
        if (device as usize) < BUS_MAX_DEVICES {
            self.callbacks[device as usize] = Some(callback);
        }
    }

    /// Queue bytes for the CPU to read from `device`. Returns how many
    /// were accepted; the shortfall is added to the device's drop count.
    pub fn device_write(&mut self, device: u8, data: &[u8]) -> usize {
        if (device as usize) >= BUS_MAX_DEVICES {
            return 0;
        }
        let accepted = self.device_buffers[device as usize].write(data);
        let short = data.len() - accepted;
        if short > 0 {
            self.stats.device_drops[device as usize] += short as u32;
        }
        accepted
    }

    /// Bytes queued for the CPU on `device`.
    pub fn device_pending(&self, device: u8) -> usize {
        self.device_buffers
            .get(device as usize)
            .map_or(0, |b| b.len())
    }

    /// Drop everything queued for `device`.
    pub fn device_clear(&mut self, device: u8) {
        if let Some(buf) = self.device_buffers.get_mut(device as usize) {
            buf.clear();
        }
    }

    /// Drive the parser and the read-serving path. Call frequently from
    /// the main loop.
    pub fn task(&mut self) {
        self.process_rx();
        self.feed_tx();
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = BusStats::default();
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    fn process_rx(&mut self) {
        if self.cursor.check_overrun(self.hw.rx_dma()) {
            // Producer lapped us before this task ran; everything in the
            // ring is suspect, including a half-parsed transaction.
            self.stats.rx_dma_overruns += 1;
            self.state = ProtoState::Idle;
            return;
        }

        let mut avail = self.cursor.unread(self.hw.rx_dma());
        while avail > 0 {
            let byte = self.hw.rx_dma().ring()[self.cursor.read_idx() as usize];
            self.cursor.advance(1);
            avail -= 1;
            self.stats.rx_bytes += 1;

            match self.state {
                ProtoState::Idle | ProtoState::Sending => self.begin_command(byte),

                ProtoState::GotDevice => {
                    if byte == 0 {
                        self.state = ProtoState::Idle;
                    } else {
                        self.span_start_idx = self.cursor.read_idx();
                        self.span_len = byte as u16;
                        self.span_start_total = self.cursor.total_read();
                        self.transfer_remaining = byte as u16;
                        self.state = ProtoState::Receiving;
                    }
                }

                ProtoState::Receiving => {
                    self.transfer_remaining -= 1;
                    if self.transfer_remaining == 0 {
                        if self.dispatch_rx_callback() {
                            return;
                        }
                        self.state = ProtoState::Idle;
                    }
                }
            }
        }
    }

    /// First byte of a transaction: device number, bit 7 = read flag.
    fn begin_command(&mut self, byte: u8) {
        let device = byte & 0x7F;
        if (device as usize) >= BUS_MAX_DEVICES {
            self.stats.invalid_devices += 1;
            self.state = ProtoState::Idle;
            return;
        }
        if byte & 0x80 != 0 {
            self.pending_read = Some(device);
            self.underflow_recorded = false;
            self.state = ProtoState::Idle;
        } else {
            self.current_device = device;
            self.state = ProtoState::GotDevice;
        }
    }

    /// Hand the completed transaction to the device callback. Returns
    /// true on bankruptcy, in which case the caller must stop parsing.
    fn dispatch_rx_callback(&mut self) -> bool {
        let device = self.current_device as usize;
        let len = self.span_len as usize;
        if self.callbacks[device].is_none() {
            return false;
        }

        {
            let ring = self.hw.rx_dma().ring();
            let data = view_span(ring, self.span_start_idx, len, &mut self.scratch);
            if let Some(cb) = self.callbacks[device].as_mut() {
                cb(self.current_device, data);
            }
        }

        // The callback read through an interior pointer while the engine
        // kept writing; if it wrapped past the span, the bytes just
        // processed are tainted.
        if self.cursor.span_overwritten(self.hw.rx_dma(), self.span_start_total) {
            warn!(
                "bus rx bankruptcy: DMA overran data during callback (device {}, {} bytes)",
                self.current_device, len
            );
            self.stats.rx_bankruptcies += 1;
            self.state = ProtoState::Idle;
            let total = self.cursor.total_written(self.hw.rx_dma());
            self.cursor.resync_to(total);
            return true;
        }
        false
    }

    fn feed_tx(&mut self) {
        if self.state == ProtoState::Sending && !self.hw.tx_busy() {
            self.state = ProtoState::Idle;
        }

        let Some(device) = self.pending_read else {
            return;
        };
        if self.state == ProtoState::Sending || self.hw.tx_busy() {
            return;
        }

        if device == 0 {
            // Interrupt-source query: one byte naming the next device
            // with pending data. Never touches a buffer.
            let source = self.next_pending_source();
            self.hw.start_tx(&[1, source]);
            self.stats.tx_bytes += 1;
            self.state = ProtoState::Sending;
            self.pending_read = None;
            self.underflow_recorded = false;
            return;
        }

        let buf = &mut self.device_buffers[device as usize];
        if !buf.is_empty() {
            let len = buf.len().min(BUS_MAX_TRANSFER);
            self.staging[0] = len as u8;
            let copied = buf.read(&mut self.staging[1..=len]);
            debug_assert_eq!(copied, len);
            self.stats.tx_bytes += len as u64;
            self.hw.start_tx(&self.staging[..=len]);
            self.state = ProtoState::Sending;
            self.pending_read = None;
            self.underflow_recorded = false;
        } else if !self.underflow_recorded {
            // Nothing to send: leave the FIFO empty and let the sentinel
            // answer the polls. Counted once per request.
            self.stats.tx_underflows += 1;
            self.underflow_recorded = true;
        }
    }

    fn next_pending_source(&self) -> u8 {
        (1..BUS_MAX_DEVICES)
            .find(|&d| !self.device_buffers[d].is_empty())
            .map_or(0, |d| d as u8)
    }
}
