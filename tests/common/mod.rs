//! Shared fake-NIC harness: heap-backed device memory plus a scripted
//! resource manager.
#![allow(dead_code)]

use std::cell::{RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::rc::Rc;

use efct_vi::config::{EFCT_PKT_STRIDE, EFCT_RX_SUPERBUF_BYTES, MAX_EFCT_RXQS};
use efct_vi::wire::{
	ControlSubtype, EventType, EvqEntry, RX_HEADER_NEXT_FRAME_LOC_1, RxHeader,
	UNSOL_CREDIT_REGISTER_OFFSET,
};
use efct_vi::{
	DesignParameters, EfctVi, Error, Event, NextSuperbuf, Result, RxqMapping, SuperbufOps,
	ViConfig,
};

pub const APERTURE_BYTES: u64 = 0x1_0000;
pub const EVQ_BYTES: u32 = 4096;
pub const TX_FIFO_BYTES: u64 = 32768;
pub const CT_FIFO_BYTES: u32 = (TX_FIFO_BYTES - 64 - 8) as u32;
pub const TXQ_ENTRIES: u32 = 512;
pub const N_TEST_SUPERBUFS: usize = 3;

pub fn params() -> DesignParameters {
	DesignParameters {
		rx_superbuf_bytes: EFCT_RX_SUPERBUF_BYTES.into(),
		rx_frame_offset: RX_HEADER_NEXT_FRAME_LOC_1 as u64 - 2,
		tx_aperture_bytes: APERTURE_BYTES,
		tx_fifo_bytes: TX_FIFO_BYTES,
		timestamp_subnano_bits: 2,
		unsol_credit_seq_mask: 0x7f,
	}
}

/// Everything the resource manager did and is scripted to do.
#[derive(Default)]
pub struct MockState {
	pub next_results: VecDeque<Result<NextSuperbuf>>,
	pub freed: Vec<(usize, u32)>,
	pub attach_calls: Vec<(i32, u32)>,
	pub attach_result: Option<Error>,
	pub refresh_results: VecDeque<Result<()>>,
	pub refresh_calls: usize,
	pub available: bool,
}

pub struct MockOps(pub Rc<RefCell<MockState>>);

impl SuperbufOps for MockOps {
	fn next(&mut self, _ix: usize) -> Result<NextSuperbuf> {
		self.0
			.borrow_mut()
			.next_results
			.pop_front()
			.unwrap_or(Err(Error::NoSuperbuf))
	}

	fn free(&mut self, ix: usize, sbid: u32) {
		self.0.borrow_mut().freed.push((ix, sbid));
	}

	fn attach(&mut self, qid: i32, n_superbufs: u32) -> Result<()> {
		let mut state = self.0.borrow_mut();
		state.attach_calls.push((qid, n_superbufs));
		match state.attach_result {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	fn refresh(&mut self, _ix: usize) -> Result<()> {
		let mut state = self.0.borrow_mut();
		state.refresh_calls += 1;
		state.refresh_results.pop_front().unwrap_or(Ok(()))
	}

	fn available(&self, _ix: usize) -> bool {
		self.0.borrow().available
	}
}

#[derive(Default)]
pub struct LiveCells {
	pub superbuf_pkts: u32,
	pub config_generation: u32,
	pub time_sync: u64,
}

pub struct Harness {
	pub vi: EfctVi,
	pub ops: Rc<RefCell<MockState>>,
	pub evq_wptr: u32,
	aperture_base: *mut u64,
	evq_base: *mut u64,
	sb_base: *mut u64,
	io_base: *mut u64,
	active_qs: Box<UnsafeCell<u64>>,
	live: Vec<Box<UnsafeCell<LiveCells>>>,
	_aperture: Vec<u64>,
	_evq: Vec<u64>,
	_superbufs: Vec<u64>,
	_io: Vec<u64>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_timestamps(false)
	}

	pub fn with_timestamps(tx_timestamps: bool) -> Self {
		let mut aperture = vec![0u64; APERTURE_BYTES as usize / 8];
		// The event ring starts out as invalid-phase poison, like a
		// freshly initialised queue.
		let mut evq = vec![!0u64; EVQ_BYTES as usize / 8];
		let mut superbufs = vec![0u64; N_TEST_SUPERBUFS * EFCT_RX_SUPERBUF_BYTES as usize / 8];
		let mut io = vec![0u64; UNSOL_CREDIT_REGISTER_OFFSET / 8 + 1];
		let active_qs = Box::new(UnsafeCell::new(0u64));
		// One set of cells per plausible hardware qid, not per slot.
		let live: Vec<_> = (0..2 * MAX_EFCT_RXQS)
			.map(|_| Box::new(UnsafeCell::new(LiveCells::default())))
			.collect();

		let aperture_base = aperture.as_mut_ptr();
		let evq_base = evq.as_mut_ptr();
		let sb_base = superbufs.as_mut_ptr();
		let io_base = io.as_mut_ptr();

		let config = ViConfig {
			ctpio_aperture: NonNull::new(aperture_base).unwrap(),
			io: NonNull::new(io_base.cast::<u8>()).unwrap(),
			evq_base: NonNull::new(evq_base).unwrap(),
			evq_bytes: EVQ_BYTES,
			superbuf_base: NonNull::new(sb_base.cast::<u8>()).unwrap(),
			active_qs: NonNull::new(active_qs.get()).unwrap(),
			txq_entries: TXQ_ENTRIES,
			tx_timestamps,
		};

		let state = Rc::new(RefCell::new(MockState::default()));
		let vi = unsafe { EfctVi::new(config, &params(), Box::new(MockOps(state.clone()))) }
			.expect("interface construction");

		Harness {
			vi,
			ops: state,
			evq_wptr: 0,
			aperture_base,
			evq_base,
			sb_base,
			io_base,
			active_qs,
			live,
			_aperture: aperture,
			_evq: evq,
			_superbufs: superbufs,
			_io: io,
		}
	}

	pub fn set_active(&self, mask: u64) {
		unsafe { *self.active_qs.get() = mask };
	}

	pub fn set_live_pkts(&self, ix: usize, pkts: u32) {
		unsafe { (*self.live[ix].get()).superbuf_pkts = pkts };
	}

	pub fn set_live_config(&self, ix: usize, generation: u32) {
		unsafe { (*self.live[ix].get()).config_generation = generation };
	}

	pub fn set_live_time_sync(&self, ix: usize, value: u64) {
		unsafe { (*self.live[ix].get()).time_sync = value };
	}

	/// Attaches hardware queue `qid`, wiring the matching live cells.
	pub fn attach_rxq(&mut self, qid: i32) -> usize {
		self.try_attach_rxq(qid).expect("attach")
	}

	pub fn try_attach_rxq(&mut self, qid: i32) -> efct_vi::Result<usize> {
		let cells = self.live[qid as usize].get();
		unsafe {
			let mapping = RxqMapping {
				superbuf_pkts: NonNull::new(&raw mut (*cells).superbuf_pkts).unwrap(),
				config_generation: NonNull::new(&raw mut (*cells).config_generation).unwrap(),
				time_sync: NonNull::new(&raw mut (*cells).time_sync).unwrap(),
			};
			self.vi.attach_rxq(qid, 1, mapping)
		}
	}

	/// Scripts the next rollover target for `ops.next`.
	pub fn queue_next(&self, sbid: u32, sentinel: bool, sbseq: u32) {
		self.ops.borrow_mut().next_results.push_back(Ok(NextSuperbuf {
			sbid,
			sentinel,
			sbseq,
		}));
	}

	/// Appends an event to the ring with the phase bit of the current
	/// lap, the way the NIC would.
	pub fn push_event(&mut self, mut event: EvqEntry) {
		event.set_phase(self.evq_wptr & EVQ_BYTES != 0);
		let word = ((self.evq_wptr & (EVQ_BYTES - 1)) >> 3) as usize;
		unsafe { self.evq_base.add(word).write(event.0) };
		self.evq_wptr = self.evq_wptr.wrapping_add(8);
	}

	/// Writes a metadata header into queue 0's superbuffer arena.
	pub fn write_header(&self, sbid: u32, slot: u32, header: &RxHeader) {
		let word = (sbid * EFCT_RX_SUPERBUF_BYTES / 8 + slot * EFCT_PKT_STRIDE / 8) as usize;
		unsafe {
			self.sb_base.add(word).write(header.meta);
			self.sb_base.add(word + 1).write(header.timestamp);
		}
	}

	/// Fills the 8 bytes the future-peek probe watches (frame start
	/// minus two) for queue 0.
	pub fn write_frame_probe(&self, sbid: u32, slot: u32, value: u64) {
		let byte = (sbid * EFCT_RX_SUPERBUF_BYTES + slot * EFCT_PKT_STRIDE) as usize
			+ RX_HEADER_NEXT_FRAME_LOC_1
			- 2;
		unsafe {
			self.sb_base
				.cast::<u8>()
				.add(byte)
				.cast::<[u8; 8]>()
				.write_unaligned(value.to_ne_bytes());
		}
	}

	/// Frame start the interface should report for a packet of queue 0.
	pub fn frame_ptr(&self, sbid: u32, slot: u32) -> *const u8 {
		let byte = (sbid * EFCT_RX_SUPERBUF_BYTES + slot * EFCT_PKT_STRIDE) as usize
			+ RX_HEADER_NEXT_FRAME_LOC_1;
		unsafe { self.sb_base.cast::<u8>().add(byte) }
	}

	pub fn aperture_word(&self, ix: usize) -> u64 {
		unsafe { self.aperture_base.add(ix).read() }
	}

	pub fn unsol_register(&self) -> u64 {
		unsafe { self.io_base.add(UNSOL_CREDIT_REGISTER_OFFSET / 8).read() }
	}

	pub fn poll(&mut self, budget: usize) -> Vec<Event> {
		let mut evs = Vec::with_capacity(budget);
		self.vi.eventq_poll(&mut evs, budget);
		evs
	}
}

/// A plain transmit completion acknowledging sequence `seq`.
pub fn tx_event(seq: u32) -> EvqEntry {
	let mut event = EvqEntry::default();
	event.set_event_type(EventType::Tx).set_tx_sequence(seq);
	event
}

pub fn control_event(subtype: ControlSubtype) -> EvqEntry {
	let mut event = EvqEntry::default();
	event
		.set_event_type(EventType::Control)
		.set_ctrl_subtype(subtype);
	event
}

/// A clean metadata header for a packet of the given length.
pub fn rx_header(sentinel: bool, len: u16) -> RxHeader {
	let mut header = RxHeader::default();
	header
		.set_sentinel(sentinel)
		.set_packet_length(len)
		.set_next_frame_loc(1);
	header
}
