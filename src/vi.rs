//! Per-interface state and the operation surface.
//!
//! The state splits the same way the hardware mappings do: [`TxQueue`]
//! and [`Evq`] hold the fixed, device-derived geometry, while
//! [`EndpointState`] holds the mutable counters. The endpoint state is
//! deliberately a plain, readable block so a supervising process can
//! inspect a shared mapping of it.

use core::ptr::NonNull;

use log::debug;
use volatile::VolatileRef;
use volatile::access::ReadOnly;

use crate::config::{EFCT_TX_ALIGNMENT, EFCT_TX_HEADER_BYTES, MAX_EFCT_RXQS};
use crate::descriptor::{RxDescriptorTable, TxDescriptor};
use crate::event::{DiscardFlags, Event, SyncFlags};
use crate::ops::{RxqMapping, SuperbufOps, ViConfig};
use crate::wire::tx_header;
use crate::{DesignParameters, Error, Result};

/// Transmit ring counters. `added - removed` is the number of
/// outstanding descriptors, `ct_added - ct_removed` the bytes occupying
/// the on-NIC cut-through FIFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxQueueState {
	pub added: u32,
	pub removed: u32,
	/// Completion cursor: descriptors below this have been seen in a
	/// transmit event but not necessarily unbundled yet.
	pub previous: u32,
	pub ct_added: u32,
	pub ct_removed: u32,
}

/// Event ring cursor and the time-sync state latched from control
/// events.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvqState {
	pub evq_ptr: u32,
	pub sync_timestamp_major: u32,
	pub sync_timestamp_minor: u32,
	pub sync_flags: SyncFlags,
	pub unsol_credit_seq: u32,
}

/// Consumption state of one receive queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxqPtr {
	/// Low 31 bits: next expected packet id; bit 31: expected sentinel;
	/// high 32 bits: superbuffer sequence number.
	pub next: u64,
	/// Packet id of the last metadata consumed; the subject of the next
	/// header read.
	pub prev: u32,
	/// Exclusive packet-id limit of the current superbuffer. Zero means
	/// a rollover is needed before anything else.
	pub end: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RxqState {
	pub rxq_ptr: [RxqPtr; MAX_EFCT_RXQS],
}

/// The mutable per-interface state block.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointState {
	pub txq: TxQueueState,
	pub evq: EvqState,
	pub rxq: RxqState,
}

pub(crate) struct TxQueue {
	pub aperture: NonNull<u64>,
	/// Aperture size mask in 64-bit words.
	pub aperture_mask: u64,
	pub ct_fifo_bytes: u32,
	/// Ring size minus one.
	pub mask: u32,
	pub descriptors: Box<[TxDescriptor]>,
	pub ids: Box<[u32]>,
	/// OR'd into the header of every send; carries the timestamp and
	/// warm flags.
	pub fixed_header: u64,
}

pub(crate) struct Evq {
	pub base: NonNull<u64>,
	/// Ring size in bytes, minus one.
	pub mask: u32,
}

pub(crate) struct RxqLive {
	pub superbuf_pkts: VolatileRef<'static, u32, ReadOnly>,
	pub config_generation: VolatileRef<'static, u32, ReadOnly>,
	pub time_sync: VolatileRef<'static, u64, ReadOnly>,
}

pub(crate) struct EfctRxq {
	/// Hardware queue id, -1 while idle.
	pub qid: i32,
	/// Generation last seen by a successful (or abandoned) refresh.
	pub config_generation: u32,
	pub live: Option<RxqLive>,
}

/// One process-attached EFCT virtual interface.
pub struct EfctVi {
	pub(crate) ops: Box<dyn SuperbufOps>,
	pub(crate) txq: TxQueue,
	pub(crate) evq: Evq,
	pub(crate) io: NonNull<u8>,
	pub(crate) superbuf_base: NonNull<u8>,
	pub(crate) active_qs: VolatileRef<'static, u64, ReadOnly>,
	pub(crate) rxqs: [EfctRxq; MAX_EFCT_RXQS],
	pub(crate) descriptors: RxDescriptorTable,
	pub(crate) ep: EndpointState,
	pub(crate) rx_discard_mask: DiscardFlags,
	pub(crate) ts_subnano_bits: u32,
	pub(crate) unsol_credit_seq_mask: u32,
	pub(crate) last_ctpio_failed: bool,
	pub(crate) future_qid: Option<usize>,
}

impl EfctVi {
	/// Builds a virtual interface over the given device resources.
	///
	/// # Safety
	///
	/// Every pointer in `config` must honour its documented mapping
	/// contract (size, alignment, concurrent writers) for the lifetime
	/// of the returned interface.
	pub unsafe fn new(
		config: ViConfig,
		params: &DesignParameters,
		ops: Box<dyn SuperbufOps>,
	) -> Result<EfctVi> {
		let checked = params.check()?;

		if !config.evq_bytes.is_power_of_two() {
			return Err(Error::DesignParameter {
				name: "evq_bytes",
				value: config.evq_bytes.into(),
			});
		}
		// Sized for the maximum number of packets the FIFO can hold, so
		// a byte-space check alone admits a send.
		if !config.txq_entries.is_power_of_two()
			|| config.txq_entries
				< (checked.ct_fifo_bytes + EFCT_TX_HEADER_BYTES) / EFCT_TX_ALIGNMENT
		{
			return Err(Error::DesignParameter {
				name: "txq_entries",
				value: config.txq_entries.into(),
			});
		}

		let entries = config.txq_entries as usize;
		Ok(EfctVi {
			txq: TxQueue {
				aperture: config.ctpio_aperture,
				aperture_mask: checked.aperture_mask,
				ct_fifo_bytes: checked.ct_fifo_bytes,
				mask: config.txq_entries - 1,
				descriptors: vec![TxDescriptor::default(); entries].into_boxed_slice(),
				ids: vec![0; entries].into_boxed_slice(),
				fixed_header: tx_header(0, 0, config.tx_timestamps, false, 0),
			},
			evq: Evq {
				base: config.evq_base,
				mask: config.evq_bytes - 1,
			},
			io: config.io,
			superbuf_base: config.superbuf_base,
			active_qs: unsafe { VolatileRef::new_read_only(config.active_qs) },
			rxqs: core::array::from_fn(|_| EfctRxq {
				qid: -1,
				config_generation: 0,
				live: None,
			}),
			descriptors: RxDescriptorTable::new(),
			ep: EndpointState::default(),
			rx_discard_mask: DiscardFlags::ETH_FCS_ERR
				| DiscardFlags::ETH_LEN_ERR
				| DiscardFlags::L3_CSUM_ERR
				| DiscardFlags::L4_CSUM_ERR,
			ts_subnano_bits: checked.ts_subnano_bits,
			unsol_credit_seq_mask: checked.unsol_credit_seq_mask,
			last_ctpio_failed: false,
			future_qid: None,
			ops,
		})
	}

	/// Read-only view of the mutable state block.
	pub fn endpoint_state(&self) -> &EndpointState {
		&self.ep
	}

	/// Polls every active receive queue, then the transmit event ring,
	/// appending at most `budget` events to `evs`.
	pub fn eventq_poll(&mut self, evs: &mut Vec<Event>, budget: usize) -> usize {
		let mut n = 0;
		let mut qs = self.active_qs.as_ptr().read();
		while qs != 0 {
			let ix = qs.trailing_zeros() as usize;
			qs &= qs - 1;
			n += self.poll_rx(ix, evs, budget - n);
		}
		n += self.poll_tx(evs, budget - n);
		n
	}

	/// Whether the next [`eventq_poll`](Self::eventq_poll) would produce
	/// an event.
	pub fn eventq_check_event(&self) -> bool {
		self.tx_check_event() || (0..MAX_EFCT_RXQS).any(|ix| self.rxq_check_event(ix))
	}

	/// Reserves a receive queue slot for hardware queue `qid` and starts
	/// it over the given live mapping.
	///
	/// An already-attached queue reported by the resource manager is
	/// treated as success, matching the upstream contract.
	///
	/// # Safety
	///
	/// The pointers in `mapping` must stay valid, with the resource
	/// manager as their only writer, for the interface's lifetime.
	pub unsafe fn attach_rxq(
		&mut self,
		qid: i32,
		n_superbufs: u32,
		mapping: RxqMapping,
	) -> Result<usize> {
		let ix = self.find_free_rxq(qid)?;
		match self.ops.attach(qid, n_superbufs) {
			Ok(()) | Err(Error::AlreadyAttached) => {}
			Err(err) => return Err(err),
		}
		self.start_rxq(ix, qid, mapping);
		debug!("attached rxq {qid} at slot {ix}");
		Ok(ix)
	}

	fn find_free_rxq(&self, qid: i32) -> Result<usize> {
		for ix in 0..MAX_EFCT_RXQS {
			if self.rxqs[ix].qid == qid {
				return Err(Error::AlreadyAttached);
			}
			if !self.rxq_is_active(ix) {
				return Ok(ix);
			}
		}
		Err(Error::NoRxqSlot)
	}

	fn start_rxq(&mut self, ix: usize, qid: i32, mapping: RxqMapping) {
		self.rxqs[ix].qid = qid;
		self.rxqs[ix].config_generation = 0;
		self.rxqs[ix].live = Some(RxqLive {
			superbuf_pkts: unsafe { VolatileRef::new_read_only(mapping.superbuf_pkts) },
			config_generation: unsafe { VolatileRef::new_read_only(mapping.config_generation) },
			time_sync: unsafe { VolatileRef::new_read_only(mapping.time_sync) },
		});
		self.ep.rxq.rxq_ptr[ix].end = 0;
	}

	/// Restricts which packet classifications are reported as discards.
	pub fn receive_set_discards(&mut self, flags: DiscardFlags) {
		self.rx_discard_mask = flags;
	}

	pub fn receive_get_discards(&self) -> DiscardFlags {
		self.rx_discard_mask
	}

	/// Pushes a superbuffer onto queue `ix`'s free stack on behalf of
	/// the resource manager.
	pub fn sb_free_push(&mut self, ix: usize, sbid: u32) {
		self.descriptors.free_push(ix, sbid);
	}

	/// Successor of `sbid` on queue `ix`'s free stack, -1 for none.
	pub fn sb_free_next(&self, ix: usize, sbid: u32) -> i16 {
		self.descriptors.free_next(ix, sbid)
	}

	// EFCT has no PIO, no alternative queues, no descriptor-posted
	// receive and no remote memcpy; the corresponding operations exist
	// only to complete the surface.

	pub fn transmit_pio(&mut self, _offset: i32, _len: usize, _dma_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_copy_pio(&mut self, _offset: i32, _src: &[u8], _dma_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_pio_warm(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_copy_pio_warm(&mut self, _offset: i32, _src: &[u8]) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_alt_select(&mut self, _alt_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_alt_select_default(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_alt_stop(&mut self, _alt_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_alt_go(&mut self, _alt_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_alt_discard(&mut self, _alt_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_memcpy(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn transmit_memcpy_sync(&mut self, _dma_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn receive_init(&mut self, _addr: u64, _dma_id: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn receive_push(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn eventq_prime(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn eventq_timer_prime(&mut self, _value: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn eventq_timer_run(&mut self, _value: u32) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn eventq_timer_clear(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}

	pub fn eventq_timer_zero(&mut self) -> Result<()> {
		Err(Error::NotSupported)
	}
}
