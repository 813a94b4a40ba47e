//! Transmit engine.
//!
//! Sends stream straight through the write-combined CTPIO aperture: a
//! header qword, the frame bytes in 64-bit words, zero padding to the
//! 64-byte FIFO granularity, then a store fence. The descriptor ring
//! only carries bookkeeping (wire length and request id) for matching
//! hardware completion events against sends.

use bit_field::BitField;
use log::{debug, error};
use smallvec::SmallVec;

use crate::config::{
	EFCT_TX_ALIGNMENT, EFCT_TX_HEADER_BYTES, EFCT_TX_POSTED_ID, REQUEST_ID_INVALID,
	TIME_SYNC_EVENT_EVQ_CAPACITY, TRANSMIT_BATCH,
};
use crate::event::{Event, SyncFlags};
use crate::vi::EfctVi;
use crate::wire::{
	ControlSubtype, EventType, EvqEntry, TX_CT_DISABLE, TX_HEADER_WARM_FLAG_LBN,
	UNSOL_CREDIT_REGISTER_OFFSET, tx_header, unsol_credit,
};
use crate::{Error, Result};

/// Orders write-combined stores before the NIC can observe them. Plain
/// TSO reasoning does not hold for write-combined memory on x86, so an
/// explicit sfence is required there.
fn wmb() {
	#[cfg(target_arch = "x86_64")]
	unsafe {
		core::arch::x86_64::_mm_sfence()
	};
	#[cfg(not(target_arch = "x86_64"))]
	core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// State of one partially-written send.
struct TxState {
	aperture: *mut u64,
	/// Up to 7 bytes left over after writing a block in 64-bit words,
	/// packed high byte first.
	tail: u64,
	tail_len: u32,
	/// Offset from the aperture start in 64-bit words.
	offset: u64,
	/// Keeps the offset within the aperture.
	mask: u64,
}

impl TxState {
	fn word(&mut self, value: u64) {
		unsafe {
			self.aperture
				.add((self.offset & self.mask) as usize)
				.write_volatile(value);
		}
		self.offset += 1;
	}

	fn tail_byte(&mut self, byte: u8) {
		debug_assert!(self.tail_len < 8);
		self.tail = self.tail << 8 | u64::from(byte);
		self.tail_len += 1;
	}

	/// Flushes the tail buffer, first byte to the lowest address.
	fn tail_word(&mut self) {
		self.word(u64::from_ne_bytes(self.tail.to_be_bytes()));
		self.tail = 0;
		self.tail_len = 0;
	}

	fn block(&mut self, mut buf: &[u8]) {
		if self.tail_len != 0 {
			while !buf.is_empty() && self.tail_len < 8 {
				self.tail_byte(buf[0]);
				buf = &buf[1..];
			}
			if self.tail_len == 8 {
				self.tail_word();
			}
		}

		while buf.len() >= 8 {
			self.word(u64::from_ne_bytes(buf[..8].try_into().unwrap()));
			buf = &buf[8..];
		}

		for &byte in buf {
			self.tail_byte(byte);
		}
	}
}

impl EfctVi {
	fn tx_init(&self) -> TxState {
		let offset = self.ep.txq.ct_added;
		debug_assert_eq!(offset % EFCT_TX_ALIGNMENT, 0);
		TxState {
			aperture: self.txq.aperture.as_ptr(),
			tail: 0,
			tail_len: 0,
			offset: u64::from(offset >> 3),
			mask: self.txq.aperture_mask,
		}
	}

	fn tx_pkt_header(&self, length: u32, ct_thresh: u32) -> u64 {
		tx_header(length, ct_thresh, false, false, 0) | self.txq.fixed_header
	}

	/// Bytes the cut-through FIFO can still accept.
	pub fn transmit_space_bytes(&self) -> u32 {
		self.txq.ct_fifo_bytes - self.ep.txq.ct_added.wrapping_sub(self.ep.txq.ct_removed)
	}

	fn tx_check(&self, len: usize) -> bool {
		self.transmit_space_bytes() as usize >= len
	}

	fn tx_complete(&mut self, tx: &mut TxState, dma_id: u32, len: usize) {
		if tx.tail_len != 0 {
			tx.tail <<= (8 - tx.tail_len) * 8;
			tx.tail_word();
		}
		while tx.offset % u64::from(EFCT_TX_ALIGNMENT / 8) != 0 {
			tx.word(0);
		}

		// Limits the reordering the NIC can observe to one packet; the
		// CPU parallelises this fence well enough that skipping it for
		// small packets does not pay.
		wmb();

		let wire_len = (len as u32 + EFCT_TX_HEADER_BYTES).next_multiple_of(EFCT_TX_ALIGNMENT);
		let i = (self.ep.txq.added & self.txq.mask) as usize;
		self.txq.descriptors[i].len = wire_len as u16;
		self.txq.ids[i] = dma_id;
		self.ep.txq.ct_added = self.ep.txq.ct_added.wrapping_add(wire_len);
		self.ep.txq.added = self.ep.txq.added.wrapping_add(1);
	}

	/// Sends one frame with cut-through disabled.
	pub fn transmit(&mut self, frame: &[u8], dma_id: u32) -> Result<()> {
		if !self.tx_check(frame.len()) {
			return Err(Error::Again);
		}
		let mut tx = self.tx_init();
		tx.word(self.tx_pkt_header(frame.len() as u32, TX_CT_DISABLE));
		tx.block(frame);
		self.tx_complete(&mut tx, dma_id, frame.len());
		Ok(())
	}

	/// Sends one frame gathered from `iov` with cut-through disabled.
	pub fn transmitv(&mut self, iov: &[&[u8]], dma_id: u32) -> Result<()> {
		let len = iov.iter().map(|frag| frag.len()).sum::<usize>();
		if !self.tx_check(len) {
			return Err(Error::Again);
		}
		let mut tx = self.tx_init();
		tx.word(self.tx_pkt_header(len as u32, TX_CT_DISABLE));
		for frag in iov {
			tx.block(frag);
		}
		self.tx_complete(&mut tx, dma_id, len);
		Ok(())
	}

	/// CTPIO streams as it goes; there is nothing left to push.
	pub fn transmit_push(&mut self) {}

	fn tx_warm_active(&self) -> bool {
		self.txq.fixed_header.get_bit(TX_HEADER_WARM_FLAG_LBN)
	}

	/// Sends one frame with cut-through enabled below `threshold` bytes.
	///
	/// Admission failure is not reported here; it is latched and
	/// resolved by the following `*_ctpio_fallback` call.
	pub fn transmitv_ctpio(&mut self, frame_len: usize, iov: &[&[u8]], threshold: u32) {
		self.last_ctpio_failed = !self.tx_check(frame_len);
		if self.last_ctpio_failed {
			return;
		}
		let mut tx = self.tx_init();

		// The hardware takes the threshold in 64-byte units including
		// the 8-byte header. Values too big for the field mean
		// cut-through off; test that first to avoid overflow.
		let threshold_extra = EFCT_TX_HEADER_BYTES + EFCT_TX_ALIGNMENT - 1;
		let ct_thresh = if threshold > TX_CT_DISABLE * EFCT_TX_ALIGNMENT - threshold_extra {
			TX_CT_DISABLE
		} else {
			(threshold + threshold_extra) / EFCT_TX_ALIGNMENT
		};

		tx.word(self.tx_pkt_header(frame_len as u32, ct_thresh));
		for frag in iov {
			tx.block(frag);
		}

		// A valid but bogus id, replaced with the real one by the
		// fallback call; unbundle still reports it so callers relying
		// on the completion count see this send. Warm sends get the
		// invalid id instead so reconciliation ignores them.
		let dma_id = if self.tx_warm_active() {
			REQUEST_ID_INVALID
		} else {
			EFCT_TX_POSTED_ID
		};
		self.tx_complete(&mut tx, dma_id, frame_len);
	}

	/// [`transmitv_ctpio`](Self::transmitv_ctpio), additionally copying
	/// the frame into `fallback` for a possible descriptor resend.
	pub fn transmitv_ctpio_copy(
		&mut self,
		frame_len: usize,
		iov: &[&[u8]],
		threshold: u32,
		fallback: &mut [u8],
	) {
		self.transmitv_ctpio(frame_len, iov, threshold);
		let mut offset = 0;
		for frag in iov {
			fallback[offset..offset + frag.len()].copy_from_slice(frag);
			offset += frag.len();
		}
	}

	fn ctpio_fallback(&mut self, dma_id: u32) -> Result<()> {
		let di = (self.ep.txq.added.wrapping_sub(1) & self.txq.mask) as usize;
		debug_assert_ne!(self.ep.txq.added, self.ep.txq.removed);
		debug_assert_eq!(self.txq.ids[di], EFCT_TX_POSTED_ID);
		self.txq.ids[di] = dma_id;
		Ok(())
	}

	/// Resolves the preceding [`transmitv_ctpio`](Self::transmitv_ctpio):
	/// installs the real request id, or retries the send through the
	/// plain path if CTPIO admission failed.
	pub fn transmit_ctpio_fallback(&mut self, frame: &[u8], dma_id: u32) -> Result<()> {
		if self.last_ctpio_failed {
			let rc = self.transmit(frame, dma_id);
			self.last_ctpio_failed = rc == Err(Error::Again);
			return rc;
		}
		self.ctpio_fallback(dma_id)
	}

	/// Vectored variant of
	/// [`transmit_ctpio_fallback`](Self::transmit_ctpio_fallback).
	pub fn transmitv_ctpio_fallback(&mut self, iov: &[&[u8]], dma_id: u32) -> Result<()> {
		if self.last_ctpio_failed {
			let rc = self.transmitv(iov, dma_id);
			self.last_ctpio_failed = rc == Err(Error::Again);
			return rc;
		}
		self.ctpio_fallback(dma_id)
	}

	/// Marks every following send as a warm-up: the NIC exercises the
	/// transmit path but drops the frame.
	pub fn start_transmit_warm(&mut self) {
		debug_assert!(!self.tx_warm_active());
		self.txq.fixed_header.set_bit(TX_HEADER_WARM_FLAG_LBN, true);
	}

	pub fn stop_transmit_warm(&mut self) {
		debug_assert!(self.tx_warm_active());
		self.txq.fixed_header.set_bit(TX_HEADER_WARM_FLAG_LBN, false);
	}

	/// Collects the request ids retired by a preceding [`Event::Tx`].
	pub fn transmit_unbundle(&mut self) -> SmallVec<[u32; TRANSMIT_BATCH]> {
		let mut ids = SmallVec::new();
		while self.ep.txq.removed != self.ep.txq.previous {
			let i = (self.ep.txq.removed & self.txq.mask) as usize;
			let id = self.txq.ids[i];
			if id != REQUEST_ID_INVALID {
				ids.push(id);
			}
			self.ep.txq.removed = self.ep.txq.removed.wrapping_add(1);
		}
		ids
	}

	/// The event at `evq_ptr`, or `None` while the NIC has not written
	/// it yet (phase mismatch).
	fn tx_get_event(&self, evq_ptr: u32) -> Option<EvqEntry> {
		let word_ix = ((evq_ptr & self.evq.mask) >> 3) as usize;
		let event = EvqEntry(unsafe { self.evq.base.as_ptr().add(word_ix).read_volatile() });
		let expect_phase = evq_ptr & self.evq.mask.wrapping_add(1) != 0;
		(event.phase() == expect_phase).then_some(event)
	}

	pub(crate) fn tx_check_event(&self) -> bool {
		self.tx_get_event(self.ep.evq.evq_ptr).is_some()
	}

	pub(crate) fn poll_tx(&mut self, evs: &mut Vec<Event>, budget: usize) -> usize {
		// If the entry behind the cursor no longer matches its lap, the
		// ring has overflowed underneath us.
		debug_assert!(
			self.tx_get_event(self.ep.evq.evq_ptr.wrapping_sub(8))
				.is_some()
		);

		let mut n = 0;
		while n < budget {
			let Some(event) = self.tx_get_event(self.ep.evq.evq_ptr) else {
				break;
			};
			self.ep.evq.evq_ptr = self.ep.evq.evq_ptr.wrapping_add(8);

			match EventType::try_from(event.event_type()) {
				Ok(EventType::Tx) => {
					self.tx_handle_event(event, evs);
					n += 1;
					// At most one transmit completion per poll, so the
					// caller can unbundle it before the completion
					// cursor moves again.
					return n;
				}
				Ok(EventType::Control) => n += self.tx_handle_control_event(event, evs),
				Err(_) => error!("unknown event {:#018x}", event.0),
			}
		}
		n
	}

	fn tx_handle_event(&mut self, event: EvqEntry, evs: &mut Vec<Event>) {
		let seq = event.tx_sequence();
		let seq_mask = 0xff;

		// Walk the completion cursor up to the acknowledged sequence,
		// returning each passed send's bytes to the FIFO budget. The
		// range is fully inclusive on both sides.
		while self.ep.txq.previous & seq_mask != seq.wrapping_add(1) & seq_mask {
			debug_assert_ne!(self.ep.txq.previous, self.ep.txq.added);
			let i = (self.ep.txq.previous & self.txq.mask) as usize;
			self.ep.txq.ct_removed = self
				.ep
				.txq
				.ct_removed
				.wrapping_add(self.txq.descriptors[i].len.into());
			self.ep.txq.previous = self.ep.txq.previous.wrapping_add(1);
		}

		if event.tx_timestamp_status() != 0 {
			debug_assert_eq!(event.tx_timestamp_status(), 1);
			let ptstamp = event.tx_partial_tstamp();
			let ptstamp_seconds = (ptstamp >> 32) as u32;
			let timesync_seconds = self.ep.evq.sync_timestamp_major & 0xff;
			let mut sec = u64::from(self.ep.evq.sync_timestamp_major);
			if ptstamp_seconds == (timesync_seconds + 1) % 256 {
				sec += 1;
			}
			let mut nsec = (ptstamp as u32) >> self.ts_subnano_bits;
			nsec &= !SyncFlags::all().bits();
			nsec |= self.ep.evq.sync_flags.bits();
			let i = (self.ep.txq.previous.wrapping_sub(1) & self.txq.mask) as usize;
			evs.push(Event::TxWithTimestamp {
				rq_id: self.txq.ids[i],
				q_id: event.tx_label(),
				sec,
				nsec,
				ctpio: true,
			});
			// Delivering a timestamped completion counts as removing
			// it: exactly one send is acknowledged and unbundle is not
			// used.
			self.ep.txq.removed = self.ep.txq.removed.wrapping_add(1);
		} else {
			evs.push(Event::Tx {
				desc_id: self.ep.txq.previous,
				q_id: event.tx_label(),
				ctpio: true,
			});
		}
	}

	fn tx_handle_control_event(&mut self, event: EvqEntry, evs: &mut Vec<Event>) -> usize {
		match ControlSubtype::try_from(event.ctrl_subtype()) {
			Ok(ControlSubtype::Error) => {
				// All this queue will see next is a flush while the NIC
				// tears it down; no state fixup is useful.
				self.ep.txq.previous = self.ep.txq.previous.wrapping_add(1);
				evs.push(Event::TxError {
					desc_id: self.ep.txq.previous,
					q_id: event.error_label(),
					reason: event.error_reason(),
				});
				error!(
					"TX error event {} (raw {:#018x}); check transmit parameters",
					event.error_reason(),
					event.0
				);
				1
			}
			Ok(ControlSubtype::Flush) => {
				debug!("saw flush in poll");
				0
			}
			Ok(ControlSubtype::TimeSync) => {
				let time_high = event.time_high();
				self.ep.evq.sync_timestamp_major = (time_high >> 16) as u32;
				self.ep.evq.sync_timestamp_minor = (time_high & 0xffff) as u32;
				let mut flags = SyncFlags::empty();
				if event.clock_in_sync() {
					flags |= SyncFlags::CLOCK_IN_SYNC;
				}
				if event.clock_is_set() {
					flags |= SyncFlags::CLOCK_SET;
				}
				self.ep.evq.sync_flags = flags;
				self.ep.evq.unsol_credit_seq = self.ep.evq.unsol_credit_seq.wrapping_add(1);
				self.grant_unsol_credit(false, self.ep.evq.unsol_credit_seq);
				0
			}
			Ok(ControlSubtype::UnsolOverflow) => {
				debug!("unsolicited credit overflow");
				// Back to the default budget, holding one credit in
				// reserve for the overflow event itself.
				self.ep.evq.unsol_credit_seq = TIME_SYNC_EVENT_EVQ_CAPACITY - 1;
				self.grant_unsol_credit(true, self.ep.evq.unsol_credit_seq);
				0
			}
			Err(_) => 0,
		}
	}

	/// Grants the NIC budget for unsolicited time-sync events. Called on
	/// every time-sync event and on credit overflow.
	fn grant_unsol_credit(&mut self, clear_overflow: bool, credit_seq: u32) {
		let qword = unsol_credit(credit_seq & self.unsol_credit_seq_mask, clear_overflow);
		unsafe {
			self.io
				.as_ptr()
				.add(UNSOL_CREDIT_REGISTER_OFFSET)
				.cast::<u64>()
				.write_volatile(qword);
		}
	}
}
