/*!
Bridge multiplexer: routes device-addressed messages between the
parallel-bus engine and the SPI engine.

Framing
- Both directions carry the same TLV shape over the SPI byte stream:
  `[device_id (1)] [length (1)] [payload ...]`. The symmetry with the
  parallel-bus protocol keeps the stream trivially recoverable: an
  invalid device byte discards exactly one byte and retries, so any
  desynchronization resolves within one frame. Inbound, device 0 counts
  as invalid: it is reserved for the interrupt-source query and has no
  consumer for delivered data.

Wiring
- At init the bridge registers a callback on every bus device that
  frames the message and pushes it onto the SPI TX queue through a
  cloned queue handle; inbound, it drains the SPI RX queue through a TLV
  parser and hands complete messages to `BusInterface::device_write`.
  Neither engine ever learns the other exists.
- A message is enqueued outbound as one all-or-nothing unit; a full
  queue drops the whole frame (counted per device), never a header
  without its payload.

The 6502-facing interrupt line is recomputed once per `poll`: asserted
while any device has pending data. The pin seam latches its idle level
before the board flips the pin to output, so the line cannot glitch
during initialization.
*/

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::bus::{BusHw, BusInterface, BUS_MAX_DEVICES, BUS_MAX_TRANSFER};
use crate::error::Error;
use crate::spi::{SpiSlave, SpiSlaveHw};

/// Interval between statistics records in the log.
pub const BRIDGE_STATS_INTERVAL_MS: u64 = 5000;

/// Output pin seam for the 6502 interrupt line. Levels are passed in
/// asserted-terms; the board applies the active-low polarity and must
/// latch the deasserted level before enabling the output direction.
pub trait IrqPin {
    fn set_asserted(&mut self, asserted: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlvState {
    Idle,
    GotDevice,
    Receiving,
}

#[derive(Debug, Default, Clone)]
pub struct BridgeStats {
    pub bus_to_spi_msgs: u64,
    pub bus_to_spi_bytes: u64,
    /// Messages dropped outbound per originating device (TX queue full).
    pub bus_to_spi_drops: [u32; BUS_MAX_DEVICES],
    pub spi_to_bus_msgs: u64,
    pub spi_to_bus_bytes: u64,
    /// Messages that did not fully fit the target device buffer.
    pub spi_to_bus_drops: u32,
    /// Bytes discarded while hunting for a valid device header.
    pub tlv_desyncs: u32,
}

pub struct Bridge<B: BusHw, S: SpiSlaveHw, I: IrqPin> {
    bus: BusInterface<B>,
    spi: SpiSlave<S>,
    irq_pin: I,
    irq_asserted: bool,

    tlv_state: TlvState,
    tlv_device: u8,
    tlv_remaining: u8,
    tlv_pos: usize,
    // Sized for the largest value a length byte can carry.
    tlv_msg: [u8; 255],

    drain_buf: [u8; 512],
    last_stats_ms: u64,
    stats: Rc<RefCell<BridgeStats>>,
}

impl<B: BusHw, S: SpiSlaveHw, I: IrqPin> Bridge<B, S, I> {
    pub fn new(bus: BusInterface<B>, spi: SpiSlave<S>, irq_pin: I) -> Self {
        Self {
            bus,
            spi,
            irq_pin,
            irq_asserted: false,
            tlv_state: TlvState::Idle,
            tlv_device: 0,
            tlv_remaining: 0,
            tlv_pos: 0,
            tlv_msg: [0; 255],
            drain_buf: [0; 512],
            last_stats_ms: 0,
            stats: Rc::new(RefCell::new(BridgeStats::default())),
        }
    }

    /// Initialize both engines and wire the outbound path: one callback
    /// per device, each holding clones of the SPI TX-queue handle and
    /// the bridge counters.
    pub fn init(&mut self) -> Result<(), Error> {
        self.bus.init()?;

        for device in 0..BUS_MAX_DEVICES as u8 {
            let tx = self.spi.tx_handle();
            let stats = Rc::clone(&self.stats);
            self.bus.register_rx_callback(
                device,
                Box::new(move |dev, data| {
                    let mut frame = [0u8; BUS_MAX_TRANSFER + 2];
                    frame[0] = dev;
                    frame[1] = data.len() as u8;
                    frame[2..2 + data.len()].copy_from_slice(data);

                    let mut st = stats.borrow_mut();
                    match tx.enqueue(&frame[..2 + data.len()]) {
                        Ok(()) => {
                            st.bus_to_spi_msgs += 1;
                            st.bus_to_spi_bytes += data.len() as u64;
                        }
                        Err(_) => {
                            st.bus_to_spi_drops[dev as usize] += 1;
                        }
                    }
                }),
            );
        }

        self.bus.start();
        self.spi.init()?;
        Ok(())
    }

    /// One main-loop iteration: engine tasks, inbound TLV parsing, the
    /// 6502 interrupt line, and the periodic stats record.
    pub fn poll(&mut self, now_ms: u64) {
        self.bus.task();
        self.spi.task(now_ms);
        self.drain_spi_rx();
        self.update_irq();
        self.maybe_log_stats(now_ms);
    }

    pub fn bus(&self) -> &BusInterface<B> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusInterface<B> {
        &mut self.bus
    }

    pub fn spi(&self) -> &SpiSlave<S> {
        &self.spi
    }

    pub fn spi_mut(&mut self) -> &mut SpiSlave<S> {
        &mut self.spi
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_asserted
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.borrow().clone()
    }

    fn drain_spi_rx(&mut self) {
        loop {
            let n = self.spi.rx_drain(&mut self.drain_buf);
            if n == 0 {
                break;
            }
            for i in 0..n {
                let byte = self.drain_buf[i];
                self.process_tlv_byte(byte);
            }
        }
    }

    fn process_tlv_byte(&mut self, byte: u8) {
        match self.tlv_state {
            TlvState::Idle => {
                // Device 0 is reserved for the interrupt-source query on
                // the parallel-bus side; nothing ever drains its buffer,
                // so a message addressed there would latch the interrupt
                // line forever. Treat it like any other invalid device.
                if byte != 0 && (byte as usize) < BUS_MAX_DEVICES {
                    self.tlv_device = byte;
                    self.tlv_state = TlvState::GotDevice;
                } else {
                    // Off-frame byte: drop it and retry on the next one.
                    debug!("tlv desync: invalid device byte {byte:#04x}");
                    self.stats.borrow_mut().tlv_desyncs += 1;
                }
            }

            TlvState::GotDevice => {
                if byte == 0 {
                    self.tlv_state = TlvState::Idle;
                } else {
                    self.tlv_remaining = byte;
                    self.tlv_pos = 0;
                    self.tlv_state = TlvState::Receiving;
                }
            }

            TlvState::Receiving => {
                self.tlv_msg[self.tlv_pos] = byte;
                self.tlv_pos += 1;
                self.tlv_remaining -= 1;
                if self.tlv_remaining == 0 {
                    let written = self
                        .bus
                        .device_write(self.tlv_device, &self.tlv_msg[..self.tlv_pos]);
                    let mut st = self.stats.borrow_mut();
                    st.spi_to_bus_msgs += 1;
                    st.spi_to_bus_bytes += self.tlv_pos as u64;
                    if written < self.tlv_pos {
                        st.spi_to_bus_drops += 1;
                    }
                    self.tlv_state = TlvState::Idle;
                }
            }
        }
    }

    fn update_irq(&mut self) {
        // Device 0 carries no deliverable data (its reads answer the
        // interrupt-source query), so it cannot be an interrupt source.
        let any_data =
            (1..BUS_MAX_DEVICES as u8).any(|device| self.bus.device_pending(device) > 0);
        if any_data != self.irq_asserted {
            self.irq_pin.set_asserted(any_data);
            self.irq_asserted = any_data;
        }
    }

    fn maybe_log_stats(&mut self, now_ms: u64) {
        if now_ms.wrapping_sub(self.last_stats_ms) < BRIDGE_STATS_INTERVAL_MS {
            return;
        }
        self.last_stats_ms = now_ms;

        let st = self.stats.borrow();
        let outbound_drops: u32 = st.bus_to_spi_drops.iter().sum();
        info!(
            "[{}s] 6502->host: {} msgs ({} B, {} drops) | host->6502: {} msgs ({} B, {} drops, {} desyncs)",
            now_ms / 1000,
            st.bus_to_spi_msgs,
            st.bus_to_spi_bytes,
            outbound_drops,
            st.spi_to_bus_msgs,
            st.spi_to_bus_bytes,
            st.spi_to_bus_drops,
            st.tlv_desyncs,
        );

        let bs = self.bus.stats();
        info!(
            "  bus: rx={} tx={} overruns={} bankrupt={} underflows={} bad_dev={}",
            bs.rx_bytes,
            bs.tx_bytes,
            bs.rx_dma_overruns,
            bs.rx_bankruptcies,
            bs.tx_underflows,
            bs.invalid_devices,
        );

        let ss = self.spi.stats();
        info!(
            "  spi: wr={} rd={} req={} proto_err={} overruns={} bankrupt={} timeouts={}",
            ss.rx_writes,
            ss.tx_reads,
            ss.requests,
            ss.proto_errors,
            ss.rx_overruns,
            ss.rx_bankruptcies,
            ss.request_timeouts,
        );
    }
}

#[cfg(test)]
mod tests;
