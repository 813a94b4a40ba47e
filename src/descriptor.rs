//! Bookkeeping descriptors: one per (queue, superbuffer) on the receive
//! side, one per in-flight send on the transmit side.

use crate::config::{MAX_EFCT_RXQS, MAX_SUPERBUFS};

/// Per-superbuffer state, indexed by global superbuffer index.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RxDescriptor {
	/// Outstanding packet references. Preloaded with the superbuffer's
	/// packet capacity at rollover; the transition to zero frees the
	/// superbuffer.
	pub refcnt: u16,
	/// Packet capacity captured at rollover.
	pub superbuf_pkts: u16,
	/// Next superbuffer in the per-queue free stack, -1 for none.
	pub sbid_next: i16,
	/// Timestamp of the final packet, stashed here because the metadata
	/// carrying it lives in the next superbuffer's first slot.
	pub final_ts_status: u8,
	pub final_timestamp: u64,
}

impl Default for RxDescriptor {
	fn default() -> Self {
		RxDescriptor {
			refcnt: 0,
			superbuf_pkts: 0,
			sbid_next: -1,
			final_ts_status: 0,
			final_timestamp: 0,
		}
	}
}

/// In-flight transmit record; `len` is the on-wire length including the
/// 8-byte header and alignment padding.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TxDescriptor {
	pub len: u16,
}

/// Flat descriptor table plus the per-queue intrusive free stacks.
///
/// The stacks are pushed by the interface and by the resource manager
/// when it returns buffers; only the resource manager pops.
pub(crate) struct RxDescriptorTable {
	descriptors: Box<[RxDescriptor]>,
	free_head: [i16; MAX_EFCT_RXQS],
}

impl RxDescriptorTable {
	pub fn new() -> Self {
		RxDescriptorTable {
			descriptors: vec![
				RxDescriptor::default();
				MAX_EFCT_RXQS * MAX_SUPERBUFS as usize
			]
			.into_boxed_slice(),
			free_head: [-1; MAX_EFCT_RXQS],
		}
	}

	pub fn desc(&self, global_ix: u32) -> &RxDescriptor {
		&self.descriptors[global_ix as usize]
	}

	pub fn desc_mut(&mut self, global_ix: u32) -> &mut RxDescriptor {
		&mut self.descriptors[global_ix as usize]
	}

	pub fn free_push(&mut self, ix: usize, sbid: u32) {
		let head = self.free_head[ix];
		self.desc_mut(ix as u32 * MAX_SUPERBUFS + sbid).sbid_next = head;
		self.free_head[ix] = sbid as i16;
	}

	pub fn free_next(&self, ix: usize, sbid: u32) -> i16 {
		self.desc(ix as u32 * MAX_SUPERBUFS + sbid).sbid_next
	}
}
