/*!
Crate error type.

Nothing in the running bridge is fatal (overruns, drops and protocol
errors are counted and recovered locally); `Error` covers the fallible
setup surface and queue admission, where a caller can meaningfully react.
*/

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The PIO instruction memory cannot hold the bus program.
    #[error("PIO program does not fit in instruction memory")]
    PioProgramLoad,

    /// No free DMA channel was available to claim.
    #[error("no unused DMA channel available")]
    DmaChannelClaim,

    /// An enqueue did not fit; nothing was written.
    #[error("TX queue full: need {need} bytes, {free} free")]
    TxQueueFull { need: usize, free: usize },
}
