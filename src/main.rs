//! Demo binary: runs the bridge over the simulated board and scripts a
//! little traffic in both directions, the way the firmware main loop
//! would run it on hardware.

use phibridge::bridge::Bridge;
use phibridge::bus::BusInterface;
use phibridge::sim::{SimBusHw, SimIrqPin, SimSpiHw};
use phibridge::spi::SpiSlave;
use phibridge::Error;

fn main() -> Result<(), Error> {
    env_logger::init();

    let mut bridge = Bridge::new(
        BusInterface::new(SimBusHw::new()),
        SpiSlave::new(SimSpiHw::new()),
        SimIrqPin::new(),
    );
    bridge.init()?;
    println!("bridge up; have-data line asserted for host sync");

    let mut now_ms: u64 = 0;

    // Host boots, sees the line, and syncs with an empty REQUEST/READ.
    bridge.spi_mut().hw_mut().master_request();
    bridge.poll(now_ms);
    let page = bridge.spi_mut().hw_mut().master_read_page();
    now_ms += 1;
    bridge.poll(now_ms);
    println!(
        "host sync page: len={} free_units={}",
        ((page[0] as usize) << 8) | page[1] as usize,
        page[2]
    );

    // Host sends a message to device 5; the 6502 takes the interrupt,
    // queries the source, and collects it.
    bridge
        .spi_mut()
        .hw_mut()
        .master_write(&[0x05, 0x03, 0x68, 0x65, 0x79]);
    now_ms += 1;
    bridge.poll(now_ms);
    println!("6502 irq asserted: {}", bridge.irq_asserted());

    bridge.bus_mut().hw_mut().cpu_write(0x80);
    now_ms += 1;
    bridge.poll(now_ms);
    let len = bridge.bus_mut().hw_mut().cpu_read();
    let source = bridge.bus_mut().hw_mut().cpu_read();
    println!("irq source query: len={len} source={source}");

    bridge.bus_mut().hw_mut().cpu_write(0x80 | source);
    now_ms += 1;
    bridge.poll(now_ms);
    let len = bridge.bus_mut().hw_mut().cpu_read() as usize;
    let mut msg = Vec::with_capacity(len);
    for _ in 0..len {
        msg.push(bridge.bus_mut().hw_mut().cpu_read());
    }
    println!("6502 read {len} bytes from device {source}: {msg:02X?}");

    // The 6502 answers; the host collects it over REQUEST/READ.
    bridge.bus_mut().hw_mut().cpu_write_all(&[0x05, 0x02, 0x6F, 0x6B]);
    now_ms += 1;
    bridge.poll(now_ms);

    bridge.spi_mut().hw_mut().master_request();
    now_ms += 1;
    bridge.poll(now_ms);
    let page = bridge.spi_mut().hw_mut().master_read_page();
    now_ms += 1;
    bridge.poll(now_ms);
    let payload_len = ((page[0] as usize) << 8) | page[1] as usize;
    println!("host read page: {:02X?}", &page[3..3 + payload_len]);

    // Let the periodic stats record fire once.
    now_ms += 5000;
    bridge.poll(now_ms);

    let stats = bridge.stats();
    println!(
        "totals: 6502->host {} msgs, host->6502 {} msgs",
        stats.bus_to_spi_msgs, stats.spi_to_bus_msgs
    );
    Ok(())
}
