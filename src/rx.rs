//! Receive engine.
//!
//! The NIC writes packets back-to-back into superbuffers; the metadata
//! header at the head of each packet slot describes the *previous*
//! packet, so consumption always runs one slot ahead of delivery. A
//! per-slot sentinel bit, flipped by the NIC on every traversal, tells
//! fresh metadata from stale.

use core::ptr::NonNull;

use log::{debug, warn};

use crate::config::{EFCT_DEFAULT_POISON, EFCT_PKT_STRIDE, EFCT_RX_SUPERBUF_BYTES};
use crate::event::{DiscardFlags, Event, RxTimestamp, SyncFlags};
use crate::ops::NextSuperbuf;
use crate::pkt_id::{
	self, PKT_ID_PKT_BITS, global_superbuf_ix, index_in_superbuf, local_superbuf_ix, pkt_id_of,
	rxq_ix, sentinel_of,
};
use crate::vi::EfctVi;
use crate::wire::{
	RX_HEADER_CHECK_MASK, RX_HEADER_L2_CLASS_OTHER, RX_HEADER_L2_STATUS_FCS_ERR,
	RX_HEADER_L2_STATUS_LEN_ERR, RX_HEADER_L3_CLASS_IP4, RX_HEADER_L3_CLASS_IP6,
	RX_HEADER_L3_CLASS_OTHER, RX_HEADER_L4_CLASS_OTHER, RX_HEADER_L4_CLASS_TCP,
	RX_HEADER_L4_CLASS_UDP, RX_HEADER_NEXT_FRAME_LOC_1, RxHeader,
};
use crate::{Error, Result};

/// Discard classification of one metadata header, before masking.
fn header_status_flags(header: &RxHeader) -> DiscardFlags {
	let mut flags = DiscardFlags::empty();
	if header.l2_status() == RX_HEADER_L2_STATUS_FCS_ERR {
		flags |= DiscardFlags::ETH_FCS_ERR;
	}
	if header.l2_status() == RX_HEADER_L2_STATUS_LEN_ERR {
		flags |= DiscardFlags::ETH_LEN_ERR;
	}
	if (header.l3_class() == RX_HEADER_L3_CLASS_IP4
		|| header.l3_class() == RX_HEADER_L3_CLASS_IP6)
		&& header.l3_status()
	{
		flags |= DiscardFlags::L3_CSUM_ERR;
	}
	if (header.l4_class() == RX_HEADER_L4_CLASS_TCP
		|| header.l4_class() == RX_HEADER_L4_CLASS_UDP)
		&& header.l4_status()
	{
		flags |= DiscardFlags::L4_CSUM_ERR;
	}
	if header.l4_class() == RX_HEADER_L4_CLASS_OTHER {
		flags |= DiscardFlags::L4_CLASS_OTHER;
	}
	if header.l3_class() == RX_HEADER_L3_CLASS_OTHER {
		flags |= DiscardFlags::L3_CLASS_OTHER;
	}
	if header.l2_class() == RX_HEADER_L2_CLASS_OTHER {
		flags |= DiscardFlags::L2_CLASS_OTHER;
	}
	flags
}

impl EfctVi {
	/// A queue is active once the resource manager has published a
	/// non-zero superbuffer capacity for it.
	pub(crate) fn rxq_is_active(&self, ix: usize) -> bool {
		self.live_superbuf_pkts(ix) != 0
	}

	fn live_superbuf_pkts(&self, ix: usize) -> u32 {
		self.rxqs[ix]
			.live
			.as_ref()
			.map_or(0, |live| live.superbuf_pkts.as_ptr().read())
	}

	fn live_config_generation(&self, ix: usize) -> u32 {
		self.rxqs[ix]
			.live
			.as_ref()
			.map_or(0, |live| live.config_generation.as_ptr().read())
	}

	fn live_time_sync(&self, ix: usize) -> u64 {
		self.rxqs[ix]
			.live
			.as_ref()
			.map_or(0, |live| live.time_sync.as_ptr().read())
	}

	fn rxq_need_rollover(&self, ix: usize) -> bool {
		let rp = &self.ep.rxq.rxq_ptr[ix];
		pkt_id_of(rp.next as u32) >= rp.end
	}

	fn rxq_need_config(&self, ix: usize) -> bool {
		self.live_config_generation(ix) != self.rxqs[ix].config_generation
	}

	/// Base of the packet slot holding `pkt_id`'s frame (and the *next*
	/// packet's metadata). Relies on all superbuffers being mapped
	/// contiguously, indexed by the global superbuffer index.
	fn slot_ptr(&self, pkt_id: u32) -> *const u8 {
		let offset = global_superbuf_ix(pkt_id) as usize * EFCT_RX_SUPERBUF_BYTES as usize
			+ index_in_superbuf(pkt_id) as usize * EFCT_PKT_STRIDE as usize;
		self.superbuf_base.as_ptr().wrapping_add(offset)
	}

	fn rx_header(&self, pkt_id: u32) -> RxHeader {
		unsafe { RxHeader::read(self.slot_ptr(pkt_id).cast::<u64>()) }
	}

	/// The header following the next packet, or `None` while the NIC
	/// has not written it (sentinel mismatch).
	fn rx_next_header(&self, next: u32) -> Option<RxHeader> {
		let header = self.rx_header(pkt_id_of(next));
		(header.sentinel() == sentinel_of(next)).then_some(header)
	}

	/// Mirrors the checks of [`poll_rx`](Self::poll_rx) so no pending
	/// action is missed.
	pub(crate) fn rxq_check_event(&self, ix: usize) -> bool {
		if !self.rxq_is_active(ix) {
			return false;
		}
		if self.rxq_need_rollover(ix) {
			// Only signal when the rollover could actually be done.
			return self.ops.available(ix);
		}
		self.rxq_need_config(ix) || self.rx_next_header(self.ep.rxq.rxq_ptr[ix].next as u32).is_some()
	}

	fn rx_rollover(&mut self, ix: usize) -> Result<()> {
		let superbuf_pkts = self.live_superbuf_pkts(ix);
		let NextSuperbuf {
			sbid,
			sentinel,
			sbseq,
		} = self.ops.next(ix)?;

		let pkt_id = pkt_id::from_superbuf(ix, sbid);
		let mut next = pkt_id | u32::from(sentinel) << 31;

		let rp = self.ep.rxq.rxq_ptr[ix];
		if rp.end == 0 {
			// The first header of a superbuffer describes a packet of
			// the previous one; at queue startup there is none, so skip
			// that slot.
			self.ep.rxq.rxq_ptr[ix].prev = pkt_id;
			next += 1;
		} else if sbseq != ((rp.next >> 32) as u32).wrapping_add(1) {
			// The software queue dropped superbuffers. Startup case
			// again, except the last packet of the previous superbuffer
			// is never delivered; its reference goes here.
			debug!("rxq {ix}: superbuf sequence gap, one packet lost");
			self.rxpkt_release(rp.prev);
			self.ep.rxq.rxq_ptr[ix].prev = pkt_id;
			next += 1;
		}
		self.ep.rxq.rxq_ptr[ix].next = u64::from(sbseq) << 32 | u64::from(next);
		self.ep.rxq.rxq_ptr[ix].end = pkt_id + superbuf_pkts;

		// Preload the refcount with every potential packet; cheaper
		// than counting them in one at a time.
		debug_assert!(superbuf_pkts > 0);
		debug_assert!(superbuf_pkts < 1 << PKT_ID_PKT_BITS);
		let desc = self.descriptors.desc_mut(global_superbuf_ix(pkt_id));
		desc.refcnt = superbuf_pkts as u16;
		desc.superbuf_pkts = superbuf_pkts as u16;
		Ok(())
	}

	pub(crate) fn poll_rx(&mut self, ix: usize, evs: &mut Vec<Event>, budget: usize) -> usize {
		if self.rxq_need_rollover(ix) && self.rx_rollover(ix).is_err() {
			// Event polls never fail; a rollover with nowhere to go
			// just produces nothing this round.
			return 0;
		}

		if self.rxq_need_config(ix) {
			// Cache the generation read *before* refreshing, so a
			// change racing the refresh trips the check again.
			let new_generation = self.live_config_generation(ix);
			if self.ops.refresh(ix).is_err() {
				// Retrying every poll is unlikely to go better; cache
				// it anyway and stop tripping over this queue.
				warn!("rxq {ix}: config refresh failed");
				self.rxqs[ix].config_generation = new_generation;
				return 0;
			}
			self.rxqs[ix].config_generation = new_generation;
		}

		// Never cross a superbuffer within one poll; this bounds the
		// loop so it needs no per-packet rollover check.
		let rp = self.ep.rxq.rxq_ptr[ix];
		let budget = budget.min((rp.end - pkt_id_of(rp.next as u32)) as usize);

		let mut n = 0;
		while n < budget {
			let rp = self.ep.rxq.rxq_ptr[ix];
			let Some(header) = self.rx_next_header(rp.next as u32) else {
				break;
			};
			let pkt_id = rp.prev;
			let global_sb = global_superbuf_ix(pkt_id);

			if header.meta & RX_HEADER_CHECK_MASK != 0 && header.rollover() {
				// The NIC terminated the superbuffer early.
				let prev_sb = local_superbuf_ix(pkt_id);
				let next_sb = local_superbuf_ix(pkt_id_of(rp.next as u32));
				let nskipped = if next_sb == prev_sb {
					// The refcount assumed a full superbuffer; hand
					// back the references for packets that never came.
					rp.end - pkt_id
				} else {
					// The packet under this header is the one
					// straddling the boundary: consume it, and drop the
					// entire next superbuffer, which is the one the NIC
					// wants rid of.
					self.ops.free(ix, next_sb);
					1
				};
				let desc = self.descriptors.desc_mut(global_sb);
				debug_assert!(nskipped > 0);
				debug_assert!(nskipped <= u32::from(desc.refcnt));
				desc.refcnt -= nskipped as u16;
				if desc.refcnt == 0 {
					self.ops.free(ix, prev_sb);
				}
				// Force a rollover on the next poll.
				self.ep.rxq.rxq_ptr[ix].end = 0;
				break;
			}

			let discard_flags = if header.meta & RX_HEADER_CHECK_MASK != 0 {
				header_status_flags(&header) & self.rx_discard_mask
			} else {
				DiscardFlags::empty()
			};

			let q_id = self.rxqs[ix].qid as u16;
			if discard_flags.is_empty() {
				// Fixed frame offset only; checked against the design
				// parameters at construction, so the header must agree.
				debug_assert_eq!(header.next_frame_loc(), 1);
				evs.push(Event::RxRef {
					pkt_id,
					len: header.packet_length(),
					q_id,
					filter_id: header.filter(),
					user: header.user(),
				});
			} else {
				evs.push(Event::RxRefDiscard {
					pkt_id,
					len: header.packet_length(),
					q_id,
					filter_id: header.filter(),
					user: header.user(),
					flags: discard_flags,
				});
			}

			// Only meaningful for the final packet of the superbuffer,
			// whose timestamp rides in the next superbuffer's first
			// header, but storing unconditionally beats branching.
			let desc = self.descriptors.desc_mut(global_sb);
			desc.final_timestamp = header.timestamp;
			desc.final_ts_status = header.timestamp_status();

			self.ep.rxq.rxq_ptr[ix].prev = pkt_id_of(rp.next as u32);
			self.ep.rxq.rxq_ptr[ix].next = rp.next + 1;
			n += 1;
		}
		n
	}

	/// Drops one reference to `pkt_id`'s superbuffer, returning the
	/// buffer to the resource manager on the last one.
	pub fn rxpkt_release(&mut self, pkt_id: u32) {
		let desc = self.descriptors.desc_mut(global_superbuf_ix(pkt_id));
		debug_assert!(desc.refcnt > 0);
		desc.refcnt -= 1;
		if desc.refcnt == 0 {
			self.ops.free(rxq_ix(pkt_id), local_superbuf_ix(pkt_id));
		}
	}

	/// Start of `pkt_id`'s frame.
	pub fn rxpkt_get(&self, pkt_id: u32) -> *const u8 {
		// Fixed frame offset, per the design-parameter check at
		// construction.
		self.slot_ptr(pkt_id).wrapping_add(RX_HEADER_NEXT_FRAME_LOC_1)
	}

	/// Hardware arrival timestamp of `pkt_id`.
	///
	/// The timestamp of a packet is carried by the *following* slot's
	/// header; for the final packet of a superbuffer that slot lives in
	/// the next superbuffer and was stashed in the descriptor while the
	/// metadata went past.
	pub fn rxpkt_get_timestamp(&self, pkt_id: u32) -> Result<RxTimestamp> {
		let desc = self.descriptors.desc(global_superbuf_ix(pkt_id));
		let time_sync = crate::wire::EvqEntry(self.live_time_sync(rxq_ix(pkt_id)));

		let (ts, status) =
			if index_in_superbuf(pkt_id) == u32::from(desc.superbuf_pkts).wrapping_sub(1) {
				(desc.final_timestamp, desc.final_ts_status)
			} else {
				let header = self.rx_header(pkt_id + 1);
				(header.timestamp, header.timestamp_status())
			};

		if status != 1 {
			return Err(Error::NoTimestamp);
		}

		let mut flags = SyncFlags::empty();
		if time_sync.clock_is_set() {
			flags |= SyncFlags::CLOCK_SET;
		}
		if time_sync.clock_in_sync() {
			flags |= SyncFlags::CLOCK_IN_SYNC;
		}
		Ok(RxTimestamp {
			sec: ts >> 32,
			nsec: (ts as u32) >> 2,
			flags,
		})
	}

	/// Cheap "is a packet arriving" probe for busy-wait loops: watches
	/// the next frame slot for the NIC overwriting the poison pattern.
	/// On a hit, records the queue for [`rx_future_poll`](Self::rx_future_poll)
	/// and returns the frame start.
	pub fn rx_future_peek(&mut self) -> Option<NonNull<u8>> {
		let mut qs = self.active_qs.as_ptr().read();
		while qs != 0 {
			let ix = qs.trailing_zeros() as usize;
			qs &= qs - 1;
			// Queues with pending non-packet work are left for the
			// normal poll (or eventq_check_event) to notice.
			if self.rxq_need_rollover(ix) || self.rxq_need_config(ix) {
				continue;
			}
			let rp = self.ep.rxq.rxq_ptr[ix];
			debug_assert!(rp.prev < rp.end);
			let start = self.rxpkt_get(rp.prev);
			let probe = start.wrapping_sub(2).cast::<[u8; 8]>();
			let value = u64::from_ne_bytes(unsafe { probe.read_volatile() });
			if value != EFCT_DEFAULT_POISON {
				self.future_qid = Some(ix);
				return NonNull::new(start.cast_mut());
			}
		}
		None
	}

	/// Polls the queue recorded by a successful
	/// [`rx_future_peek`](Self::rx_future_peek).
	pub fn rx_future_poll(&mut self, evs: &mut Vec<Event>, budget: usize) -> usize {
		debug_assert!(self.future_qid.is_some());
		let Some(ix) = self.future_qid else { return 0 };
		debug_assert!(self.rxq_is_active(ix));
		let count = self.poll_rx(ix, evs, budget);
		if count != 0 {
			self.future_qid = None;
		}
		count
	}

	/// `(sbseq, pktix)` of the next expected packet, for arming a
	/// wakeup at exactly that point.
	pub fn get_wakeup_params(&self, ix: usize) -> Result<(u32, u32)> {
		if !self.rxq_is_active(ix) {
			return Err(Error::InactiveRxq);
		}
		let next = self.ep.rxq.rxq_ptr[ix].next;
		let pktix = index_in_superbuf(next as u32);
		Ok(if pktix >= self.live_superbuf_pkts(ix) {
			(((next >> 32) as u32).wrapping_add(1), 0)
		} else {
			((next >> 32) as u32, pktix)
		})
	}

	/// Packet id the next receive event on `ix` will carry, or `None`
	/// while a config refresh is pending.
	pub fn next_rx_request_id(&self, ix: usize) -> Option<u32> {
		if self.rxq_need_config(ix) {
			return None;
		}
		Some(self.ep.rxq.rxq_ptr[ix].prev)
	}
}
