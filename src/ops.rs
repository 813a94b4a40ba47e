//! Contracts with the outside world: the resource-manager capability
//! set, the adapter's design parameters and the raw device resources a
//! virtual interface is constructed over.

use core::ptr::NonNull;

use log::error;

use crate::config::{EFCT_RX_SUPERBUF_BYTES, EFCT_TX_ALIGNMENT, EFCT_TX_HEADER_BYTES};
use crate::wire::RX_HEADER_NEXT_FRAME_LOC_1;
use crate::{Error, Result};

/// A superbuffer handed out by [`SuperbufOps::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSuperbuf {
	/// Superbuffer index within the queue.
	pub sbid: u32,
	/// Sentinel value the NIC writes into this superbuffer's slots.
	pub sentinel: bool,
	/// Position in the queue's superbuffer sequence; a jump of more
	/// than one means the software queue dropped buffers.
	pub sbseq: u32,
}

/// Capability set the resource manager grants a virtual interface.
///
/// `ix` is the interface-local receive queue index throughout; only
/// [`attach`](Self::attach) names a hardware queue.
pub trait SuperbufOps {
	/// Pops the next unconsumed superbuffer of queue `ix`.
	fn next(&mut self, ix: usize) -> Result<NextSuperbuf>;

	/// Returns a consumed superbuffer.
	fn free(&mut self, ix: usize, sbid: u32);

	/// Reserves a software receive queue on hardware queue `qid`, backed
	/// by at least `n_superbufs` buffers.
	fn attach(&mut self, qid: i32, n_superbufs: u32) -> Result<()>;

	/// Re-reads the queue's mapping metadata after a change.
	fn refresh(&mut self, ix: usize) -> Result<()>;

	/// Whether a rollover target exists right now.
	fn available(&self, ix: usize) -> bool;
}

/// Parameters negotiated with the adapter at interface construction.
///
/// Hot-path values this implementation hard-codes are checked here;
/// the rest are consumed as-is.
#[derive(Debug, Clone, Copy)]
pub struct DesignParameters {
	pub rx_superbuf_bytes: u64,
	pub rx_frame_offset: u64,
	pub tx_aperture_bytes: u64,
	pub tx_fifo_bytes: u64,
	pub timestamp_subnano_bits: u32,
	pub unsol_credit_seq_mask: u32,
}

pub(crate) struct CheckedParameters {
	/// Aperture size mask in 64-bit words.
	pub aperture_mask: u64,
	/// On-NIC cut-through FIFO bytes usable for frames.
	pub ct_fifo_bytes: u32,
	pub ts_subnano_bits: u32,
	pub unsol_credit_seq_mask: u32,
}

impl DesignParameters {
	pub(crate) fn check(&self) -> Result<CheckedParameters> {
		if self.rx_superbuf_bytes != u64::from(EFCT_RX_SUPERBUF_BYTES) {
			error!(
				"unsupported rx_superbuf_bytes {} != {EFCT_RX_SUPERBUF_BYTES}",
				self.rx_superbuf_bytes
			);
			return Err(Error::DesignParameter {
				name: "rx_superbuf_bytes",
				value: self.rx_superbuf_bytes,
			});
		}

		// The fixed frame offset is baked into packet access and the
		// future-peek fast path; a different or variable offset needs
		// NEXT_FRAME_LOC decoding instead.
		if self.rx_frame_offset != RX_HEADER_NEXT_FRAME_LOC_1 as u64 - 2 {
			error!("unsupported rx_frame_offset {}", self.rx_frame_offset);
			return Err(Error::DesignParameter {
				name: "rx_frame_offset",
				value: self.rx_frame_offset,
			});
		}

		// Aperture offsets wrap by masking, so the size must be a power
		// of two; the shift by 3 is for 64-bit word writes.
		if !self.tx_aperture_bytes.is_power_of_two() {
			error!(
				"unsupported tx_aperture_bytes {}, not a power of 2",
				self.tx_aperture_bytes
			);
			return Err(Error::DesignParameter {
				name: "tx_aperture_bytes",
				value: self.tx_aperture_bytes,
			});
		}

		// The FIFO loses one header's worth of bytes per frame and the
		// hardware keeps one cache line back for overflow tracking.
		let ct_fifo_bytes = self
			.tx_fifo_bytes
			.checked_sub(u64::from(EFCT_TX_ALIGNMENT + EFCT_TX_HEADER_BYTES))
			.ok_or(Error::DesignParameter {
				name: "tx_fifo_bytes",
				value: self.tx_fifo_bytes,
			})?;

		Ok(CheckedParameters {
			aperture_mask: (self.tx_aperture_bytes - 1) >> 3,
			ct_fifo_bytes: ct_fifo_bytes as u32,
			ts_subnano_bits: self.timestamp_subnano_bits,
			unsol_credit_seq_mask: self.unsol_credit_seq_mask,
		})
	}
}

/// Raw device resources backing one virtual interface.
///
/// All pointers come from the resource manager's mappings and must stay
/// valid for the interface's lifetime.
pub struct ViConfig {
	/// Write-combined CTPIO aperture.
	pub ctpio_aperture: NonNull<u64>,
	/// Register block holding the unsolicited-credit register.
	pub io: NonNull<u8>,
	/// Event ring base.
	pub evq_base: NonNull<u64>,
	/// Event ring size in bytes, a power of two.
	pub evq_bytes: u32,
	/// Base of the contiguous virtual range all superbuffers of all
	/// queues are mapped into.
	pub superbuf_base: NonNull<u8>,
	/// Mask of actively producing receive queues, published live by the
	/// resource manager.
	pub active_qs: NonNull<u64>,
	/// Transmit ring entries, a power of two.
	pub txq_entries: u32,
	/// Request hardware timestamps for every send.
	pub tx_timestamps: bool,
}

/// Live, NIC-visible fields of one attached receive queue.
///
/// All three are single words the resource manager or NIC updates
/// concurrently; the interface reads them with volatile loads.
pub struct RxqMapping {
	/// Packet capacity of this queue's superbuffers; zero until the
	/// queue is really provisioned, which keeps it inactive.
	pub superbuf_pkts: NonNull<u32>,
	/// Bumped by the resource manager whenever mappings change.
	pub config_generation: NonNull<u32>,
	/// Latest time-sync state for this queue's clock.
	pub time_sync: NonNull<u64>,
}
