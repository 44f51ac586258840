/*!
SPI slave engine: the host-facing side of the bridge.

Purpose
- Receive WRITE frames from the SPI master through a continuously running
  RX DMA ring and deliver the payloads inward (callback or RX queue).
- Transmit outbound data through fixed-size READ pages, made race-free by
  the request/ready handshake: slave hardware cannot refuse a transaction
  once the master clocks, and loading the TX FIFO takes many bus cycles,
  so the slave signals "TX DMA loaded, you may clock now" on a dedicated
  line and the master promises not to READ before seeing it.

Wire protocol (master-initiated; integers big-endian)
- WRITE:   `[0x01] [LEN_HI] [LEN_LO] [payload]`
- REQUEST: `[0x02]`
- READ:    `[0x03] [0x00 x (PAGE-1)]`, PAGE = 1503. The reply on MISO is
  `[LEN_HI] [LEN_LO] [FREE_UNITS] [payload zero-padded to 1500]`, where
  FREE_UNITS reports inbound headroom in 64-byte units (0xFF = >=16 KiB).

Session machine
- Idle -> Requested on REQUEST (the "I have something" line deasserts:
  the host is handling it). The next `task` drains the TX queue into the
  staging page, programs the one-shot TX DMA, asserts "ready", and moves
  to Ready. Chip-select rising while Ready means the READ completed:
  "ready" deasserts and the session returns to Idle. A REQUEST that is
  never followed by a READ times out back to Idle after a second.

Interrupt handlers touch exactly two words: the chip-select edge handler
snapshots the RX producer index and sets a flag (surfaced here through
`SpiSlaveHw::take_cs_event`), and the DMA reload handler advances the
ring epoch.
*/

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use crate::error::Error;
use crate::ring::{copy_span, view_span, ByteQueue, RingCursor, RxDma};

pub const SPI_CMD_WRITE: u8 = 0x01;
pub const SPI_CMD_REQUEST: u8 = 0x02;
pub const SPI_CMD_READ: u8 = 0x03;

/// READ transfer size: 3-byte header + 1500-byte payload. The payload
/// matches the Ethernet MTU so a network frame fits in one READ.
pub const SPI_READ_SIZE: usize = 1503;
pub const SPI_MAX_PAYLOAD: usize = 1500;

/// RX DMA ring size: 2^13 = 8 KiB.
pub const SPI_RX_RING_BITS: u32 = 13;
pub const SPI_RX_RING_SIZE: u32 = 1 << SPI_RX_RING_BITS;

/// Outbound (slave -> master) byte queue capacity.
pub const SPI_TX_QUEUE_SIZE: usize = 4096;

/// Inbound (master -> slave) byte queue capacity.
pub const SPI_RX_QUEUE_SIZE: usize = 16384;

/// A REQUEST with no READ within this window resets the session.
pub const SPI_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Hardware seam for the SPI slave peripheral: the port itself, both DMA
/// channels, and the two outbound signal lines. Line levels are passed
/// in asserted-terms; active-low polarity is the board's business.
pub trait SpiSlaveHw {
    type Rx: RxDma;

    /// Claim and configure the port, DMA channels and signal pins.
    fn configure(&mut self) -> Result<(), Error>;

    /// The continuous RX channel depositing MOSI bytes into the ring.
    fn rx_dma(&self) -> &Self::Rx;

    /// Program the one-shot TX DMA with a full staging page. The engine
    /// asserts "ready" only after this returns.
    fn load_tx_page(&mut self, page: &[u8]);

    /// Drive the "I have something to say" line.
    fn set_have_data(&mut self, asserted: bool);

    /// Drive the "TX loaded, safe to READ" line.
    fn set_ready(&mut self, asserted: bool);

    /// Consume the chip-select rising-edge event, if one fired since the
    /// last call: the RX producer index snapshotted by the edge handler.
    fn take_cs_event(&mut self) -> Option<u32>;
}

/// Callback invoked once per completed WRITE frame. The slice is only
/// valid for the duration of the call.
pub type SpiRxCallback = Box<dyn FnMut(&[u8])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Idle,
    Requested,
    Ready,
}

#[derive(Debug, Default, Clone)]
pub struct SpiStats {
    pub rx_writes: u64,
    pub rx_bytes: u64,
    pub tx_reads: u64,
    pub tx_bytes: u64,
    pub requests: u64,
    pub proto_errors: u32,
    pub rx_overruns: u32,
    pub rx_bankruptcies: u32,
    pub request_timeouts: u32,
    pub rx_queue_drops: u32,
}

/// Shared handle to the engine's TX queue. The bridge clones one into
/// each callback it registers on the other transport, so data flows into
/// this engine without the callback ever holding the engine itself.
#[derive(Clone)]
pub struct SpiTxQueue {
    inner: Rc<RefCell<ByteQueue>>,
}

impl SpiTxQueue {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ByteQueue::new(SPI_TX_QUEUE_SIZE))),
        }
    }

    /// Enqueue all of `data` or nothing.
    pub fn enqueue(&self, data: &[u8]) -> Result<(), Error> {
        let mut q = self.inner.borrow_mut();
        if q.write_all(data) {
            Ok(())
        } else {
            Err(Error::TxQueueFull {
                need: data.len(),
                free: q.free(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn free(&self) -> usize {
        self.inner.borrow().free()
    }

    fn drain(&self, dst: &mut [u8]) -> usize {
        self.inner.borrow_mut().read(dst)
    }

    fn clear(&self) {
        self.inner.borrow_mut().clear();
    }
}

pub struct SpiSlave<H: SpiSlaveHw> {
    hw: H,
    cursor: RingCursor,
    session: Session,
    request_at_ms: u64,

    tx_queue: SpiTxQueue,
    rx_queue: ByteQueue,
    rx_callback: Option<SpiRxCallback>,

    page: [u8; SPI_READ_SIZE],
    scratch: [u8; SPI_MAX_PAYLOAD],
    stats: SpiStats,
}

impl<H: SpiSlaveHw> SpiSlave<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            cursor: RingCursor::new(SPI_RX_RING_SIZE),
            session: Session::Idle,
            request_at_ms: 0,
            tx_queue: SpiTxQueue::new(),
            rx_queue: ByteQueue::new(SPI_RX_QUEUE_SIZE),
            rx_callback: None,
            page: [0; SPI_READ_SIZE],
            scratch: [0; SPI_MAX_PAYLOAD],
            stats: SpiStats::default(),
        }
    }

    /// Configure hardware, reset engine state, and assert the have-data
    /// line so a freshly booted host can synchronize with a REQUEST/READ
    /// even before anything is queued. Idempotent.
    pub fn init(&mut self) -> Result<(), Error> {
        self.hw.configure()?;
        self.cursor = RingCursor::new(SPI_RX_RING_SIZE);
        self.session = Session::Idle;
        self.tx_queue.clear();
        self.rx_queue.clear();
        self.stats = SpiStats::default();
        self.hw.set_ready(false);
        self.hw.set_have_data(true);
        Ok(())
    }

    /// Install the WRITE-payload callback. While one is registered,
    /// payloads go to it instead of the RX queue.
    pub fn set_rx_callback(&mut self, callback: SpiRxCallback) {
        self.rx_callback = Some(callback);
    }

    /// Clone-able handle to the TX queue for producers that must not
    /// hold the engine.
    pub fn tx_handle(&self) -> SpiTxQueue {
        self.tx_queue.clone()
    }

    /// Queue data for the host to READ; all-or-nothing. If the session
    /// is idle, raises the have-data line immediately.
    pub fn tx_enqueue(&mut self, data: &[u8]) -> Result<(), Error> {
        self.tx_queue.enqueue(data)?;
        if self.session == Session::Idle {
            self.hw.set_have_data(true);
        }
        Ok(())
    }

    /// Copy queued inbound bytes out to the caller; returns the count.
    pub fn rx_drain(&mut self, dst: &mut [u8]) -> usize {
        self.rx_queue.read(dst)
    }

    /// Bytes currently waiting in the RX queue.
    pub fn rx_available(&self) -> usize {
        self.rx_queue.len()
    }

    /// Inbound headroom in 64-byte units, saturating at 255. Counts both
    /// RX-queue usage and unparsed ring backlog, so the figure the host
    /// sees never promises space the parser is about to claim.
    pub fn free_space_units(&self) -> u8 {
        let backlog = self.cursor.unread(self.hw.rx_dma()) as usize;
        let free = SPI_RX_QUEUE_SIZE.saturating_sub(self.rx_queue.len() + backlog);
        (free / 64).min(255) as u8
    }

    pub fn session(&self) -> Session {
        self.session
    }

    pub fn stats(&self) -> &SpiStats {
        &self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = SpiStats::default();
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Drive the session machine. Call from the main loop with a
    /// millisecond clock (used only for the REQUEST timeout).
    pub fn task(&mut self, now_ms: u64) {
        if let Some(snapshot_idx) = self.hw.take_cs_event() {
            if self.session == Session::Ready {
                // The transaction that just ended was the READ.
                self.hw.set_ready(false);
                self.session = Session::Idle;
            }
            self.process_transactions(snapshot_idx, now_ms);
        }

        if self.session == Session::Requested {
            self.prepare_and_load();
        }

        if self.session != Session::Idle
            && now_ms.wrapping_sub(self.request_at_ms) >= SPI_REQUEST_TIMEOUT_MS
        {
            // Host asked for data but never clocked the READ.
            warn!("spi request timed out without a READ; resetting session");
            self.hw.set_ready(false);
            self.session = Session::Idle;
            self.stats.request_timeouts += 1;
        }

        if self.session == Session::Idle && !self.tx_queue.is_empty() {
            self.hw.set_have_data(true);
        }
    }

    /// Parse everything received up to the snapshotted producer index.
    fn process_transactions(&mut self, snapshot_idx: u32, now_ms: u64) {
        if self.cursor.check_overrun(self.hw.rx_dma()) {
            warn!("spi rx ring overrun; discarding backlog");
            self.stats.rx_overruns += 1;
            return;
        }

        let mask = SPI_RX_RING_SIZE - 1;
        let mut avail = snapshot_idx.wrapping_sub(self.cursor.read_idx()) & mask;

        while avail > 0 {
            let cmd = self.hw.rx_dma().ring()[self.cursor.read_idx() as usize];
            self.cursor.advance(1);
            avail -= 1;

            match cmd {
                SPI_CMD_WRITE => {
                    if !self.handle_write(&mut avail) {
                        return;
                    }
                }

                SPI_CMD_REQUEST => {
                    self.stats.requests += 1;
                    self.session = Session::Requested;
                    self.request_at_ms = now_ms;
                    // The host is coming to collect; quiet the line until
                    // the READ settles.
                    self.hw.set_have_data(false);
                }

                SPI_CMD_READ => {
                    // Command byte plus dummy padding; the session change
                    // already happened on the chip-select edge.
                    self.stats.tx_reads += 1;
                    self.cursor.advance(avail);
                    avail = 0;
                }

                _ => {
                    self.stats.proto_errors += 1;
                    self.cursor.advance(avail);
                    avail = 0;
                }
            }
        }
    }

    /// Parse a WRITE frame body. Returns false when parsing must stop
    /// (bankruptcy reset). `avail` is decremented for every byte
    /// consumed, including discards.
    fn handle_write(&mut self, avail: &mut u32) -> bool {
        if *avail < 2 {
            self.stats.proto_errors += 1;
            self.cursor.advance(*avail);
            *avail = 0;
            return true;
        }

        let ring = self.hw.rx_dma().ring();
        let hi = ring[self.cursor.read_idx() as usize];
        self.cursor.advance(1);
        let lo = ring[self.cursor.read_idx() as usize];
        self.cursor.advance(1);
        *avail -= 2;
        let len = ((hi as usize) << 8) | lo as usize;

        if len as u32 > *avail || len > SPI_MAX_PAYLOAD {
            // Truncated or oversize: poison the rest of the transaction.
            self.stats.proto_errors += 1;
            self.cursor.advance(*avail);
            *avail = 0;
            return true;
        }

        let span_start_idx = self.cursor.read_idx();
        let span_start_total = self.cursor.total_read();
        self.cursor.advance(len as u32);
        *avail -= len as u32;

        self.stats.rx_writes += 1;
        self.stats.rx_bytes += len as u64;

        if len == 0 {
            return true;
        }

        if self.rx_callback.is_some() {
            {
                let ring = self.hw.rx_dma().ring();
                let data = view_span(ring, span_start_idx, len, &mut self.scratch);
                if let Some(cb) = self.rx_callback.as_mut() {
                    cb(data);
                }
            }
            if self.cursor.span_overwritten(self.hw.rx_dma(), span_start_total) {
                return self.declare_bankruptcy(len);
            }
        } else {
            // Queue path: the copy out of the ring is the vulnerable
            // window; only a verified-clean copy enters the queue.
            copy_span(self.hw.rx_dma().ring(), span_start_idx, &mut self.scratch[..len]);
            if self.cursor.span_overwritten(self.hw.rx_dma(), span_start_total) {
                return self.declare_bankruptcy(len);
            }
            if !self.rx_queue.write_all(&self.scratch[..len]) {
                self.stats.rx_queue_drops += 1;
            }
        }
        true
    }

    fn declare_bankruptcy(&mut self, len: usize) -> bool {
        warn!("spi rx bankruptcy: DMA overran a WRITE payload mid-read ({len} bytes)");
        self.stats.rx_bankruptcies += 1;
        let total = self.cursor.total_written(self.hw.rx_dma());
        self.cursor.resync_to(total);
        false
    }

    /// Build the staging page, arm the TX DMA, and only then raise the
    /// ready line -- the ordering the whole handshake exists for.
    fn prepare_and_load(&mut self) {
        let payload_len = self.tx_queue.drain(&mut self.page[3..]);
        self.page[0] = (payload_len >> 8) as u8;
        self.page[1] = (payload_len & 0xFF) as u8;
        self.page[2] = self.free_space_units();
        self.page[3 + payload_len..].fill(0);

        self.stats.tx_bytes += payload_len as u64;

        self.hw.load_tx_page(&self.page);
        self.session = Session::Ready;
        self.hw.set_ready(true);
    }
}
