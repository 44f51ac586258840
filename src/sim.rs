/*!
Simulated board: deterministic models of the peripherals the engines run
against.

Purpose
- Give the test suite and the demo binary a board with fully scripted
  timing: DMA deposits, chip-select edges and FIFO pulls happen exactly
  when a test invokes them, so every race window of the epoch protocol
  can be staged on purpose.
- Double as the reference for what a real board crate must implement:
  each model implements the corresponding hardware seam (`RxDma`,
  `BusHw`, `SpiSlaveHw`, `IrqPin`) over plain state instead of
  peripheral registers.

Notes
- `SimRxDma::defer_epoch_irqs` models the reload-interrupt latency: the
  count register snaps back instantly on reload while the epoch counter
  only advances when `deliver_epoch_irqs` runs. Tests use it to force the
  one-ring-size-low reading the cursor must correct.
- The one-shot response DMA on the bus side stays "busy" until the CPU
  has drained every staged byte, matching the behavior that an armed
  response survives until the CPU polls it out.
*/

use std::collections::VecDeque;

use crate::bridge::IrqPin;
use crate::bus::{BusHw, BUS_RX_RING_SIZE};
use crate::error::Error;
use crate::ring::RxDma;
use crate::spi::{SpiSlaveHw, SPI_CMD_READ, SPI_CMD_REQUEST, SPI_CMD_WRITE, SPI_READ_SIZE, SPI_RX_RING_SIZE};

/// Self-retriggering receive DMA channel model.
pub struct SimRxDma {
    buf: Box<[u8]>,
    mask: u32,
    total: u32,
    epoch: u32,
    pending_epochs: u32,
    defer_epoch_irqs: bool,
}

impl SimRxDma {
    pub fn new(size: u32) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        Self {
            buf: vec![0u8; size as usize].into_boxed_slice(),
            mask: size - 1,
            total: 0,
            epoch: 0,
            pending_epochs: 0,
            defer_epoch_irqs: false,
        }
    }

    /// Deposit one byte, as the hardware channel would on a DREQ.
    pub fn push(&mut self, byte: u8) {
        self.buf[(self.total & self.mask) as usize] = byte;
        self.total = self.total.wrapping_add(1);
        if self.total & self.mask == 0 {
            // Channel re-triggered; the reload interrupt may lag.
            if self.defer_epoch_irqs {
                self.pending_epochs += 1;
            } else {
                self.epoch = self.epoch.wrapping_add(1);
            }
        }
    }

    pub fn push_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    /// Current write index (what the channel's write-address register
    /// would report, relative to the ring base).
    #[inline]
    pub fn write_index(&self) -> u32 {
        self.total & self.mask
    }

    /// Hold reload interrupts so the epoch counter lags the hardware.
    pub fn defer_epoch_irqs(&mut self, defer: bool) {
        self.defer_epoch_irqs = defer;
    }

    /// Run the held-off reload interrupts.
    pub fn deliver_epoch_irqs(&mut self) {
        self.epoch = self.epoch.wrapping_add(self.pending_epochs);
        self.pending_epochs = 0;
    }
}

impl RxDma for SimRxDma {
    #[inline]
    fn remaining(&self) -> u32 {
        (self.mask + 1) - (self.total & self.mask)
    }

    #[inline]
    fn epoch(&self) -> u32 {
        self.epoch
    }

    #[inline]
    fn ring(&self) -> &[u8] {
        &self.buf
    }
}

/// Parallel-bus peripheral model: PIO RX path into a DMA ring, plus the
/// one-shot response DMA feeding the TX FIFO the CPU reads from.
pub struct SimBusHw {
    rx: SimRxDma,
    tx_fifo: VecDeque<u8>,
    enabled: bool,
}

impl SimBusHw {
    pub fn new() -> Self {
        Self {
            rx: SimRxDma::new(BUS_RX_RING_SIZE),
            tx_fifo: VecDeque::new(),
            enabled: false,
        }
    }

    /// One CPU write cycle: the PIO program captures the data bus and the
    /// RX DMA deposits it into the ring.
    pub fn cpu_write(&mut self, byte: u8) {
        if self.enabled {
            self.rx.push(byte);
        }
    }

    pub fn cpu_write_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.cpu_write(b);
        }
    }

    /// One CPU read cycle: a non-empty TX FIFO yields the next response
    /// byte; an empty FIFO leaves the output-shift register at its
    /// preloaded 0xFF sentinel.
    pub fn cpu_read(&mut self) -> u8 {
        self.tx_fifo.pop_front().unwrap_or(0xFF)
    }

    pub fn rx_dma_mut(&mut self) -> &mut SimRxDma {
        &mut self.rx
    }
}

impl Default for SimBusHw {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHw for SimBusHw {
    type Rx = SimRxDma;

    fn configure(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.tx_fifo.clear();
    }

    fn rx_dma(&self) -> &SimRxDma {
        &self.rx
    }

    fn start_tx(&mut self, frame: &[u8]) {
        self.tx_fifo.extend(frame);
    }

    fn tx_busy(&self) -> bool {
        !self.tx_fifo.is_empty()
    }
}

/// SPI slave peripheral model, driven from the master's side of the bus.
///
/// Every `master_*` call is one full chip-select transaction: MOSI bytes
/// land in the RX ring through the continuous DMA channel, and the
/// rising edge snapshots the producer index the way the edge interrupt
/// does on hardware.
pub struct SimSpiHw {
    rx: SimRxDma,
    tx_page: Option<Vec<u8>>,
    have_data: bool,
    ready: bool,
    cs_event: Option<u32>,
}

impl SimSpiHw {
    pub fn new() -> Self {
        Self {
            rx: SimRxDma::new(SPI_RX_RING_SIZE),
            tx_page: None,
            have_data: false,
            ready: false,
            cs_event: None,
        }
    }

    /// Master sends a WRITE frame carrying `payload`.
    pub fn master_write(&mut self, payload: &[u8]) {
        self.rx.push(SPI_CMD_WRITE);
        self.rx.push((payload.len() >> 8) as u8);
        self.rx.push((payload.len() & 0xFF) as u8);
        self.rx.push_slice(payload);
        self.cs_rise();
    }

    /// Master sends a single-byte REQUEST.
    pub fn master_request(&mut self) {
        self.rx.push(SPI_CMD_REQUEST);
        self.cs_rise();
    }

    /// Master clocks a full READ transaction and returns the MISO page.
    ///
    /// Full duplex: the READ command byte plus dummy padding land in the
    /// RX ring while the loaded page shifts out. With no page loaded the
    /// shift register repeats idle-high bytes.
    pub fn master_read_page(&mut self) -> Vec<u8> {
        let miso = self.tx_page.take().unwrap_or_else(|| vec![0xFF; SPI_READ_SIZE]);
        self.rx.push(SPI_CMD_READ);
        for _ in 1..SPI_READ_SIZE {
            self.rx.push(0);
        }
        self.cs_rise();
        miso
    }

    /// Master clocks arbitrary bytes in one transaction (malformed
    /// traffic for protocol-error tests).
    pub fn master_send_raw(&mut self, bytes: &[u8]) {
        self.rx.push_slice(bytes);
        self.cs_rise();
    }

    fn cs_rise(&mut self) {
        self.cs_event = Some(self.rx.write_index());
    }

    /// Level of the "I have something" line, in asserted terms.
    pub fn have_data_line(&self) -> bool {
        self.have_data
    }

    /// Level of the "ready" line, in asserted terms.
    pub fn ready_line(&self) -> bool {
        self.ready
    }

    /// The page currently loaded into the one-shot TX DMA, if any.
    pub fn loaded_page(&self) -> Option<&[u8]> {
        self.tx_page.as_deref()
    }

    pub fn rx_dma_mut(&mut self) -> &mut SimRxDma {
        &mut self.rx
    }
}

impl Default for SimSpiHw {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiSlaveHw for SimSpiHw {
    type Rx = SimRxDma;

    fn configure(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn rx_dma(&self) -> &SimRxDma {
        &self.rx
    }

    fn load_tx_page(&mut self, page: &[u8]) {
        self.tx_page = Some(page.to_vec());
    }

    fn set_have_data(&mut self, asserted: bool) {
        self.have_data = asserted;
    }

    fn set_ready(&mut self, asserted: bool) {
        self.ready = asserted;
    }

    fn take_cs_event(&mut self) -> Option<u32> {
        self.cs_event.take()
    }
}

/// 6502-facing interrupt pin model. The level is latched deasserted at
/// construction, before any output-direction change a board would make.
pub struct SimIrqPin {
    asserted: bool,
}

impl SimIrqPin {
    pub fn new() -> Self {
        Self { asserted: false }
    }

    pub fn asserted(&self) -> bool {
        self.asserted
    }
}

impl Default for SimIrqPin {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqPin for SimIrqPin {
    fn set_asserted(&mut self, asserted: bool) {
        self.asserted = asserted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_dma_remaining_counts_down_and_reloads() {
        let mut dma = SimRxDma::new(8);
        assert_eq!(dma.remaining(), 8);
        dma.push(1);
        assert_eq!(dma.remaining(), 7);
        dma.push_slice(&[2, 3, 4, 5, 6, 7]);
        assert_eq!(dma.remaining(), 1);
        dma.push(8);
        // Reload: count snaps back to size, epoch advances with the IRQ.
        assert_eq!(dma.remaining(), 8);
        assert_eq!(dma.epoch(), 1);
        assert_eq!(dma.ring(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn bus_hw_serves_sentinel_when_fifo_empty() {
        let mut hw = SimBusHw::new();
        hw.enable();
        assert_eq!(hw.cpu_read(), 0xFF);
        hw.start_tx(&[3, 0xA, 0xB, 0xC]);
        assert!(hw.tx_busy());
        assert_eq!(hw.cpu_read(), 3);
        assert_eq!(hw.cpu_read(), 0xA);
        assert_eq!(hw.cpu_read(), 0xB);
        assert_eq!(hw.cpu_read(), 0xC);
        assert!(!hw.tx_busy());
        assert_eq!(hw.cpu_read(), 0xFF);
    }

    #[test]
    fn bus_hw_ignores_writes_until_enabled() {
        let mut hw = SimBusHw::new();
        hw.cpu_write(0x42);
        assert_eq!(hw.rx_dma().remaining(), BUS_RX_RING_SIZE);
        hw.enable();
        hw.cpu_write(0x42);
        assert_eq!(hw.rx_dma().remaining(), BUS_RX_RING_SIZE - 1);
    }

    #[test]
    fn spi_hw_write_frames_and_snapshots_cs() {
        let mut hw = SimSpiHw::new();
        hw.master_write(&[0xAA, 0xBB]);
        assert_eq!(hw.take_cs_event(), Some(5));
        assert_eq!(hw.take_cs_event(), None);
        assert_eq!(&hw.rx_dma().ring()[..5], &[0x01, 0x00, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn spi_hw_read_returns_loaded_page_once() {
        let mut hw = SimSpiHw::new();
        let page = vec![7u8; SPI_READ_SIZE];
        hw.load_tx_page(&page);
        assert_eq!(hw.master_read_page(), page);
        // Nothing loaded: idle-high bytes.
        assert_eq!(hw.master_read_page(), vec![0xFF; SPI_READ_SIZE]);
    }
}
