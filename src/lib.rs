//! User-space data-path core for EFCT cut-through network adapters.
//!
//! EFCT adapters have no descriptor-posted data path. Transmit streams
//! frame bytes straight into a write-combined aperture (CTPIO); receive
//! consumes packets the NIC has written back-to-back into large
//! "superbuffers", each packet preceded by a metadata header that
//! describes the *previous* packet. A single event ring carries transmit
//! completions and control events.
//!
//! The crate covers exactly that data path: [`vi::EfctVi`] owns the
//! per-interface state and exposes the operation surface; superbuffer
//! allocation, filter plumbing and device probing belong to an external
//! resource manager reached through [`ops::SuperbufOps`].

pub mod config;
mod descriptor;
pub mod event;
pub mod ops;
pub mod pkt_id;
mod rx;
mod tx;
pub mod vi;
pub mod wire;

pub use event::{DiscardFlags, Event, RxTimestamp, SyncFlags};
pub use ops::{DesignParameters, NextSuperbuf, RxqMapping, SuperbufOps, ViConfig};
pub use vi::EfctVi;

use thiserror::Error;

/// Errors reported by the data path.
///
/// Rollover and hardware-flush conditions are reported upward as events,
/// never as errors; these variants cover the remaining, caller-visible
/// failure modes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Transmit back-pressure; the caller must retry.
	#[error("transmit FIFO full")]
	Again,
	/// The receive queue is already attached. Upstream treats this as
	/// success.
	#[error("receive queue already attached")]
	AlreadyAttached,
	/// All receive queue slots of this interface are in use.
	#[error("no free receive queue slot")]
	NoRxqSlot,
	/// The queried receive queue is not active.
	#[error("receive queue not active")]
	InactiveRxq,
	/// No timestamp available; the adapter clock was not synchronised
	/// when the packet arrived.
	#[error("timestamp unavailable")]
	NoTimestamp,
	/// The operation is structurally absent on EFCT adapters.
	#[error("operation not supported on this adapter")]
	NotSupported,
	/// The resource manager has no superbuffer ready for rollover.
	#[error("no superbuffer available")]
	NoSuperbuf,
	/// Re-reading the queue mapping metadata failed.
	#[error("mapping refresh failed")]
	RefreshFailed,
	/// A design parameter reported by the adapter is outside what this
	/// implementation supports.
	#[error("unsupported design parameter {name}: {value}")]
	DesignParameter { name: &'static str, value: u64 },
}

pub type Result<T> = core::result::Result<T, Error>;
