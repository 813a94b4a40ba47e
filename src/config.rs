//! Fixed sizing of the EFCT data path.
//!
//! Values the hot path depends on are compile-time constants; the
//! matching run-time design parameters are checked against them at
//! interface construction.

/// Bytes in one receive superbuffer.
pub const EFCT_RX_SUPERBUF_BYTES: u32 = 1 << 20;

/// Distance between packet slots inside a superbuffer. Each slot starts
/// with a 128-bit metadata header.
pub const EFCT_PKT_STRIDE: u32 = 4096;

/// Receive queues per virtual interface.
pub const MAX_EFCT_RXQS: usize = 8;

/// Superbuffers per receive queue.
pub const MAX_SUPERBUFS: u32 = 2048;

/// Bytes of the transmit header written ahead of every frame.
pub const EFCT_TX_HEADER_BYTES: u32 = 8;

/// Transmit FIFO granularity; every send occupies a multiple of this.
pub const EFCT_TX_ALIGNMENT: u32 = 64;

/// Bogus-but-valid request id stored for CTPIO sends until the fallback
/// call replaces it with the real one.
pub const EFCT_TX_POSTED_ID: u32 = 0xefc7_efc7;

/// Request id treated as "no id"; completions carrying it are skipped
/// when unbundling.
pub const REQUEST_ID_INVALID: u32 = 0x7fff_ffff;

/// Upper bound on completions collected by one unbundle call.
pub const TRANSMIT_BATCH: usize = 64;

/// Unsolicited time-sync events the event queue is sized for.
pub const TIME_SYNC_EVENT_EVQ_CAPACITY: u32 = 64;

/// Well-known fill pattern the NIC leaves in unwritten frame memory.
/// Anything else at the head of the next frame slot means a packet is
/// arriving.
pub const EFCT_DEFAULT_POISON: u64 = 0x0000_ffa0_c09b_0000;
