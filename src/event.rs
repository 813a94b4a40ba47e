//! Events delivered to the layer above by [`crate::vi::EfctVi::eventq_poll`].

use bitflags::bitflags;

bitflags! {
	/// Reasons a received packet may be reported as a discard.
	///
	/// The set reported with an event is the classification of the
	/// packet masked by the interface's discard mask; packets whose
	/// classification is filtered out entirely arrive as normal
	/// [`Event::RxRef`] events.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct DiscardFlags: u16 {
		const ETH_FCS_ERR = 1 << 0;
		const ETH_LEN_ERR = 1 << 1;
		const L3_CSUM_ERR = 1 << 2;
		const L4_CSUM_ERR = 1 << 3;
		const L2_CLASS_OTHER = 1 << 4;
		const L3_CLASS_OTHER = 1 << 5;
		const L4_CLASS_OTHER = 1 << 6;
	}
}

bitflags! {
	/// Adapter clock state, reported alongside timestamps.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct SyncFlags: u32 {
		const CLOCK_SET = 1 << 0;
		const CLOCK_IN_SYNC = 1 << 1;
	}
}

/// A receive timestamp with the clock state at retrieval time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxTimestamp {
	pub sec: u64,
	pub nsec: u32,
	pub flags: SyncFlags,
}

/// One upward event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	/// A packet arrived. The packet stays referenced until
	/// [`crate::vi::EfctVi::rxpkt_release`] is called with `pkt_id`.
	RxRef {
		pkt_id: u32,
		len: u16,
		q_id: u16,
		filter_id: u16,
		user: u8,
	},
	/// A packet arrived but matched the discard mask. It holds a
	/// reference like a normal packet.
	RxRefDiscard {
		pkt_id: u32,
		len: u16,
		q_id: u16,
		filter_id: u16,
		user: u8,
		flags: DiscardFlags,
	},
	/// Transmits up to `desc_id` (exclusive) completed; the caller
	/// collects their request ids with
	/// [`crate::vi::EfctVi::transmit_unbundle`].
	Tx { desc_id: u32, q_id: u16, ctpio: bool },
	/// A single timestamped transmit completed. This event retires its
	/// descriptor itself; it must not be unbundled.
	///
	/// `nsec` carries the [`SyncFlags`] bits in its two low bits.
	TxWithTimestamp {
		rq_id: u32,
		q_id: u16,
		sec: u64,
		nsec: u32,
		ctpio: bool,
	},
	/// The transmit queue hit a fatal error; the NIC will flush it.
	TxError { desc_id: u32, q_id: u16, reason: u8 },
}
