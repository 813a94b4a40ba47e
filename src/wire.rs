//! NIC-defined wire formats, consumed bit-exact.
//!
//! Three little-endian structures cross the hardware boundary: the
//! 128-bit receive metadata header at the head of every packet slot,
//! the 64-bit transmit header streamed ahead of every frame, and the
//! 64-bit event queue entry. A fourth, the unsolicited-credit register,
//! is write-only.

use bit_field::BitField;
use num_enum::TryFromPrimitive;

const fn mask64(lbn: u32, width: u32) -> u64 {
	(((1u128 << width) - 1) as u64) << lbn
}

// --------------------------- RX metadata header ---------------------------

pub const RX_HEADER_BYTES: usize = 16;

pub const RX_HEADER_L2_STATUS_LBN: u32 = 38;
pub const RX_HEADER_L2_STATUS_WIDTH: u32 = 2;
pub const RX_HEADER_L3_STATUS_LBN: u32 = 40;
pub const RX_HEADER_L3_STATUS_WIDTH: u32 = 1;
pub const RX_HEADER_L4_STATUS_LBN: u32 = 41;
pub const RX_HEADER_L4_STATUS_WIDTH: u32 = 1;
pub const RX_HEADER_ROLLOVER_LBN: u32 = 42;
pub const RX_HEADER_ROLLOVER_WIDTH: u32 = 1;

/// Union of the status and rollover fields; a header with none of these
/// bits set describes a clean packet and skips classification entirely.
pub const RX_HEADER_CHECK_MASK: u64 = mask64(RX_HEADER_L2_STATUS_LBN, RX_HEADER_L2_STATUS_WIDTH)
	| mask64(RX_HEADER_L3_STATUS_LBN, RX_HEADER_L3_STATUS_WIDTH)
	| mask64(RX_HEADER_L4_STATUS_LBN, RX_HEADER_L4_STATUS_WIDTH)
	| mask64(RX_HEADER_ROLLOVER_LBN, RX_HEADER_ROLLOVER_WIDTH);

pub const RX_HEADER_L2_STATUS_FCS_ERR: u64 = 1;
pub const RX_HEADER_L2_STATUS_LEN_ERR: u64 = 2;
pub const RX_HEADER_L2_CLASS_OTHER: u64 = 1;
pub const RX_HEADER_L3_CLASS_IP4: u64 = 0;
pub const RX_HEADER_L3_CLASS_IP6: u64 = 1;
pub const RX_HEADER_L3_CLASS_OTHER: u64 = 2;
pub const RX_HEADER_L4_CLASS_TCP: u64 = 0;
pub const RX_HEADER_L4_CLASS_UDP: u64 = 1;
pub const RX_HEADER_L4_CLASS_OTHER: u64 = 2;

/// `NEXT_FRAME_LOC` value meaning "frame at the fixed offset"; doubles
/// as that offset in bytes from the slot base.
pub const RX_HEADER_NEXT_FRAME_LOC_1: usize = 64;

/// Metadata header preceding each packet slot.
///
/// Note the slot association: the header at slot `n` describes the
/// packet in slot `n - 1`. Only the sentinel refers to slot `n` itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxHeader {
	pub meta: u64,
	pub timestamp: u64,
}

impl RxHeader {
	/// Reads a header from a packet slot the device may be writing
	/// concurrently.
	///
	/// # Safety
	///
	/// `slot` must point to at least [`RX_HEADER_BYTES`] of readable,
	/// 8-byte-aligned memory.
	pub unsafe fn read(slot: *const u64) -> Self {
		unsafe {
			RxHeader {
				meta: slot.read_volatile(),
				timestamp: slot.add(1).read_volatile(),
			}
		}
	}

	pub fn packet_length(&self) -> u16 {
		self.meta.get_bits(0..14) as u16
	}

	pub fn next_frame_loc(&self) -> u8 {
		self.meta.get_bits(14..16) as u8
	}

	pub fn l2_class(&self) -> u64 {
		self.meta.get_bits(32..34)
	}

	pub fn l3_class(&self) -> u64 {
		self.meta.get_bits(34..36)
	}

	pub fn l4_class(&self) -> u64 {
		self.meta.get_bits(36..38)
	}

	pub fn l2_status(&self) -> u64 {
		self.meta.get_bits(38..40)
	}

	pub fn l3_status(&self) -> bool {
		self.meta.get_bit(40)
	}

	pub fn l4_status(&self) -> bool {
		self.meta.get_bit(41)
	}

	pub fn rollover(&self) -> bool {
		self.meta.get_bit(42)
	}

	pub fn sentinel(&self) -> bool {
		self.meta.get_bit(43)
	}

	pub fn timestamp_status(&self) -> u8 {
		self.meta.get_bits(44..46) as u8
	}

	pub fn user(&self) -> u8 {
		self.meta.get_bits(48..56) as u8
	}

	pub fn filter(&self) -> u16 {
		self.meta.get_bits(56..64) as u16
	}

	pub fn set_packet_length(&mut self, v: u16) -> &mut Self {
		self.meta.set_bits(0..14, v.into());
		self
	}

	pub fn set_next_frame_loc(&mut self, v: u8) -> &mut Self {
		self.meta.set_bits(14..16, v.into());
		self
	}

	pub fn set_l2_class(&mut self, v: u64) -> &mut Self {
		self.meta.set_bits(32..34, v);
		self
	}

	pub fn set_l3_class(&mut self, v: u64) -> &mut Self {
		self.meta.set_bits(34..36, v);
		self
	}

	pub fn set_l4_class(&mut self, v: u64) -> &mut Self {
		self.meta.set_bits(36..38, v);
		self
	}

	pub fn set_l2_status(&mut self, v: u64) -> &mut Self {
		self.meta.set_bits(38..40, v);
		self
	}

	pub fn set_l3_status(&mut self, v: bool) -> &mut Self {
		self.meta.set_bit(40, v);
		self
	}

	pub fn set_l4_status(&mut self, v: bool) -> &mut Self {
		self.meta.set_bit(41, v);
		self
	}

	pub fn set_rollover(&mut self, v: bool) -> &mut Self {
		self.meta.set_bit(42, v);
		self
	}

	pub fn set_sentinel(&mut self, v: bool) -> &mut Self {
		self.meta.set_bit(43, v);
		self
	}

	pub fn set_timestamp_status(&mut self, v: u8) -> &mut Self {
		self.meta.set_bits(44..46, v.into());
		self
	}

	pub fn set_user(&mut self, v: u8) -> &mut Self {
		self.meta.set_bits(48..56, v.into());
		self
	}

	pub fn set_filter(&mut self, v: u16) -> &mut Self {
		self.meta.set_bits(56..64, v.into());
		self
	}
}

// ------------------------------- TX header -------------------------------

/// `CT_THRESH` value disabling cut-through (all-ones threshold field).
pub const TX_CT_DISABLE: u32 = 0xff;

pub const TX_HEADER_TIMESTAMP_FLAG_LBN: usize = 22;
pub const TX_HEADER_WARM_FLAG_LBN: usize = 23;

/// Builds a transmit header qword.
pub fn tx_header(
	packet_length: u32,
	ct_thresh: u32,
	timestamp_flag: bool,
	warm_flag: bool,
	action: u32,
) -> u64 {
	debug_assert_eq!(packet_length >> 14, 0);
	debug_assert_eq!(ct_thresh >> 8, 0);
	debug_assert_eq!(action >> 3, 0);

	let mut qword = 0u64;
	qword.set_bits(0..14, packet_length.into());
	qword.set_bits(14..22, ct_thresh.into());
	qword.set_bit(TX_HEADER_TIMESTAMP_FLAG_LBN, timestamp_flag);
	qword.set_bit(TX_HEADER_WARM_FLAG_LBN, warm_flag);
	qword.set_bits(24..27, action.into());
	qword
}

// ------------------------------ Event queue ------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventType {
	Tx = 0,
	Control = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlSubtype {
	Error = 0,
	Flush = 1,
	TimeSync = 2,
	UnsolOverflow = 3,
}

/// One 64-bit event queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvqEntry(pub u64);

impl EvqEntry {
	pub fn phase(&self) -> bool {
		self.0.get_bit(59)
	}

	pub fn event_type(&self) -> u8 {
		self.0.get_bits(60..64) as u8
	}

	pub fn tx_partial_tstamp(&self) -> u64 {
		self.0.get_bits(0..40)
	}

	pub fn tx_sequence(&self) -> u32 {
		self.0.get_bits(40..48) as u32
	}

	pub fn tx_timestamp_status(&self) -> u8 {
		self.0.get_bits(48..50) as u8
	}

	pub fn tx_label(&self) -> u16 {
		self.0.get_bits(50..56) as u16
	}

	pub fn ctrl_subtype(&self) -> u8 {
		self.0.get_bits(53..59) as u8
	}

	pub fn time_high(&self) -> u64 {
		self.0.get_bits(0..48)
	}

	pub fn clock_in_sync(&self) -> bool {
		self.0.get_bit(48)
	}

	pub fn clock_is_set(&self) -> bool {
		self.0.get_bit(49)
	}

	pub fn error_label(&self) -> u16 {
		self.0.get_bits(0..8) as u16
	}

	pub fn error_reason(&self) -> u8 {
		self.0.get_bits(8..16) as u8
	}

	pub fn set_phase(&mut self, v: bool) -> &mut Self {
		self.0.set_bit(59, v);
		self
	}

	pub fn set_event_type(&mut self, v: EventType) -> &mut Self {
		self.0.set_bits(60..64, v as u64);
		self
	}

	pub fn set_tx_partial_tstamp(&mut self, v: u64) -> &mut Self {
		self.0.set_bits(0..40, v);
		self
	}

	pub fn set_tx_sequence(&mut self, v: u32) -> &mut Self {
		self.0.set_bits(40..48, v.into());
		self
	}

	pub fn set_tx_timestamp_status(&mut self, v: u8) -> &mut Self {
		self.0.set_bits(48..50, v.into());
		self
	}

	pub fn set_tx_label(&mut self, v: u16) -> &mut Self {
		self.0.set_bits(50..56, v.into());
		self
	}

	pub fn set_ctrl_subtype(&mut self, v: ControlSubtype) -> &mut Self {
		self.0.set_bits(53..59, v as u64);
		self
	}

	pub fn set_time_high(&mut self, v: u64) -> &mut Self {
		self.0.set_bits(0..48, v);
		self
	}

	pub fn set_clock_in_sync(&mut self, v: bool) -> &mut Self {
		self.0.set_bit(48, v);
		self
	}

	pub fn set_clock_is_set(&mut self, v: bool) -> &mut Self {
		self.0.set_bit(49, v);
		self
	}

	pub fn set_error_label(&mut self, v: u16) -> &mut Self {
		self.0.set_bits(0..8, v.into());
		self
	}

	pub fn set_error_reason(&mut self, v: u8) -> &mut Self {
		self.0.set_bits(8..16, v.into());
		self
	}
}

// ------------------------ Unsolicited-credit register ------------------------

/// Byte offset of the unsolicited-credit register in the register block.
pub const UNSOL_CREDIT_REGISTER_OFFSET: usize = 0x1c70;

/// Builds the unsolicited-credit register value.
pub fn unsol_credit(grant_seq: u32, clear_overflow: bool) -> u64 {
	debug_assert_eq!(grant_seq >> 7, 0);
	let mut qword = 0u64;
	qword.set_bits(0..7, grant_seq.into());
	qword.set_bit(7, clear_overflow);
	qword
}
