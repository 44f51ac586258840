#![doc = r#"
phibridge library crate.

Byte-stream bridge between a 6502 parallel bus and an SPI host: the
firmware core of a microcontroller that presents a single memory-mapped
register to the CPU on one side and a three-command SPI slave protocol to
a Linux-capable host on the other, forwarding device-addressed messages
in both directions.

Modules:
- ring: ring-buffer/epoch primitives shared by both engines (DMA position
  tracking, overrun and bankruptcy detection, bounded byte queues)
- bus: parallel-bus slave engine (CPU-facing transactions, per-device TX
  buffers, read serving through a one-shot response DMA)
- spi: SPI slave engine (WRITE/REQUEST/READ protocol with the
  request/ready handshake, staging pages, RX queue)
- bridge: multiplexer wiring the engines together with TLV framing and
  the 6502-facing interrupt line
- sim: deterministic simulated board implementing the hardware seams,
  used by the test suite and the demo binary
- error: crate error type

Engines are generic over narrow hardware traits (`bus::BusHw`,
`spi::SpiSlaveHw`, `ring::RxDma`, `bridge::IrqPin`); a board crate
implements those over real peripherals, while `sim` implements them over
plain state with scripted timing.
"#]

pub mod bridge;
pub mod bus;
pub mod error;
pub mod ring;
pub mod sim;
pub mod spi;

// Re-export commonly used types at the crate root for convenience.
pub use bridge::Bridge;
pub use bus::BusInterface;
pub use error::Error;
pub use spi::SpiSlave;
