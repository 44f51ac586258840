use super::*;
use crate::bus::{BUS_DEVICE_BUFFER_SIZE, BUS_RX_RING_SIZE};
use crate::sim::{SimBusHw, SimIrqPin, SimSpiHw};
use crate::spi::{SpiSlave, SPI_TX_QUEUE_SIZE};

fn bridge() -> Bridge<SimBusHw, SimSpiHw, SimIrqPin> {
    let mut bridge = Bridge::new(
        BusInterface::new(SimBusHw::new()),
        SpiSlave::new(SimSpiHw::new()),
        SimIrqPin::new(),
    );
    bridge.init().unwrap();
    bridge
}

/// Boot handshake: the bridge comes up announcing itself, and the host's
/// first REQUEST/READ fetches an empty page to synchronize.
#[test]
fn startup_handshake_serves_zero_length_page() {
    let mut bridge = bridge();
    assert!(bridge.spi().hw().have_data_line());
    assert!(!bridge.spi().hw().ready_line());

    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(0);
    assert!(bridge.spi().hw().ready_line());

    let page = bridge.spi_mut().hw_mut().master_read_page();
    assert_eq!(&page[..2], &[0x00, 0x00]);

    bridge.poll(1);
    assert!(!bridge.spi().hw().ready_line());
    assert!(!bridge.spi().hw().have_data_line());
}

#[test]
fn host_write_reaches_device_buffer_and_raises_irq() {
    let mut bridge = bridge();

    // TLV: device 5, length 3, payload 04 02 03.
    bridge
        .spi_mut()
        .hw_mut()
        .master_write(&[0x05, 0x03, 0x04, 0x02, 0x03]);
    bridge.poll(0);

    assert_eq!(bridge.bus().device_pending(5), 3);
    assert!(bridge.irq_asserted());
    assert_eq!(bridge.stats().spi_to_bus_msgs, 1);
    assert_eq!(bridge.stats().spi_to_bus_bytes, 3);

    // The 6502 queries the interrupt source, then collects.
    bridge.bus_mut().hw_mut().cpu_write(0x80);
    bridge.poll(1);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 1);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 5);

    bridge.bus_mut().hw_mut().cpu_write(0x85);
    bridge.poll(2);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 3);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 0x04);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 0x02);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 0x03);

    bridge.poll(3);
    assert!(!bridge.irq_asserted());
}

#[test]
fn cpu_write_is_framed_onto_spi_page() {
    let mut bridge = bridge();

    // Host syncs first so the have-data line is observably data-driven.
    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(0);
    bridge.spi_mut().hw_mut().master_read_page();
    bridge.poll(1);
    assert!(!bridge.spi().hw().have_data_line());

    bridge.bus_mut().hw_mut().cpu_write_all(&[0x07, 0x02, 0xAA, 0xBB]);
    bridge.poll(2);

    assert!(bridge.spi().hw().have_data_line());
    let stats = bridge.stats();
    assert_eq!(stats.bus_to_spi_msgs, 1);
    assert_eq!(stats.bus_to_spi_bytes, 2);

    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(3);
    let page = bridge.spi_mut().hw_mut().master_read_page();
    assert_eq!(page[0], 0x00);
    assert_eq!(page[1], 0x04);
    assert_eq!(&page[3..7], &[0x07, 0x02, 0xAA, 0xBB]);
}

#[test]
fn invalid_tlv_device_counts_on_the_bridge_not_the_spi_engine() {
    let mut bridge = bridge();

    bridge.spi_mut().hw_mut().master_write(&[200]);
    bridge.poll(0);

    assert_eq!(bridge.stats().tlv_desyncs, 1);
    assert_eq!(bridge.spi().stats().proto_errors, 0);
    for device in 0..BUS_MAX_DEVICES as u8 {
        assert_eq!(bridge.bus().device_pending(device), 0);
    }
    assert!(!bridge.irq_asserted());
}

#[test]
fn tlv_addressed_to_device_zero_is_discarded() {
    let mut bridge = bridge();

    // Device 0 has no data consumer; accepting a message for it would
    // leave its buffer non-empty forever and wedge the interrupt line.
    bridge.spi_mut().hw_mut().master_write(&[0x00]);
    bridge.poll(0);

    assert_eq!(bridge.stats().tlv_desyncs, 1);
    assert_eq!(bridge.bus().device_pending(0), 0);
    assert!(!bridge.irq_asserted());

    // The stream resynchronizes and later frames deliver normally.
    bridge.spi_mut().hw_mut().master_write(&[0x04, 0x01, 0x33]);
    bridge.poll(1);
    assert_eq!(bridge.bus().device_pending(4), 1);
    assert!(bridge.irq_asserted());
}

#[test]
fn tlv_parser_recovers_within_one_frame_after_desync() {
    let mut bridge = bridge();

    bridge.spi_mut().hw_mut().master_write(&[0xC8]);
    bridge.poll(0);
    bridge.spi_mut().hw_mut().master_write(&[0x05, 0x01, 0x42]);
    bridge.poll(1);

    assert_eq!(bridge.stats().tlv_desyncs, 1);
    assert_eq!(bridge.bus().device_pending(5), 1);
}

#[test]
fn saturated_tx_queue_drops_whole_messages_per_device() {
    let mut bridge = bridge();

    // Each max-size message frames to 256 bytes; 16 fill the 4 KiB queue
    // exactly, and everything after that is dropped whole.
    let payload = [0x5Au8; 254];
    for _ in 0..20 {
        bridge.bus_mut().hw_mut().cpu_write(0x02);
        bridge.bus_mut().hw_mut().cpu_write(254);
        bridge.bus_mut().hw_mut().cpu_write_all(&payload);
        bridge.poll(0);
    }

    let stats = bridge.stats();
    assert_eq!(stats.bus_to_spi_msgs, 16);
    assert_eq!(stats.bus_to_spi_drops[2], 4);
    assert_eq!(bridge.spi().tx_handle().len(), SPI_TX_QUEUE_SIZE);
    assert_eq!(bridge.spi().tx_handle().free(), 0);

    // Draining one page frees room again.
    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(1);
    bridge.spi_mut().hw_mut().master_read_page();
    bridge.poll(2);

    bridge.bus_mut().hw_mut().cpu_write(0x02);
    bridge.bus_mut().hw_mut().cpu_write(254);
    bridge.bus_mut().hw_mut().cpu_write_all(&payload);
    bridge.poll(3);
    assert_eq!(bridge.stats().bus_to_spi_msgs, 17);
}

#[test]
fn bus_overrun_recovers_and_traffic_resumes() {
    let mut bridge = bridge();

    for _ in 0..=BUS_RX_RING_SIZE {
        bridge.bus_mut().hw_mut().cpu_write(0x00);
    }
    bridge.poll(0);
    assert_eq!(bridge.bus().stats().rx_dma_overruns, 1);

    bridge.bus_mut().hw_mut().cpu_write_all(&[0x02, 0x02, 0xAA, 0xBB]);
    bridge.poll(1);
    assert_eq!(bridge.stats().bus_to_spi_msgs, 1);
    assert_eq!(bridge.bus().stats().rx_dma_overruns, 1);
}

#[test]
fn short_device_write_counts_a_bridge_drop() {
    let mut bridge = bridge();

    // Pre-fill device 1 so the next inbound message cannot fully fit.
    let fill = vec![0u8; BUS_DEVICE_BUFFER_SIZE - 2];
    assert_eq!(bridge.bus_mut().device_write(1, &fill), fill.len());

    let mut tlv = vec![0x01, 0x04];
    tlv.extend_from_slice(&[9, 8, 7, 6]);
    bridge.spi_mut().hw_mut().master_write(&tlv);
    bridge.poll(0);

    let stats = bridge.stats();
    assert_eq!(stats.spi_to_bus_msgs, 1);
    assert_eq!(stats.spi_to_bus_drops, 1);
    assert_eq!(bridge.bus().stats().device_drops[1], 2);
}

#[test]
fn round_trip_echo_through_both_transports() {
    let mut bridge = bridge();

    // Host -> 6502.
    bridge.spi_mut().hw_mut().master_write(&[0x03, 0x02, 0x10, 0x20]);
    bridge.poll(0);
    bridge.bus_mut().hw_mut().cpu_write(0x83);
    bridge.poll(1);
    assert_eq!(bridge.bus_mut().hw_mut().cpu_read(), 2);
    let a = bridge.bus_mut().hw_mut().cpu_read();
    let b = bridge.bus_mut().hw_mut().cpu_read();

    // 6502 echoes the payload back.
    bridge.bus_mut().hw_mut().cpu_write_all(&[0x03, 0x02, a, b]);
    bridge.poll(2);

    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(3);
    let page = bridge.spi_mut().hw_mut().master_read_page();
    assert_eq!(page[1], 4);
    assert_eq!(&page[3..7], &[0x03, 0x02, 0x10, 0x20]);
}
