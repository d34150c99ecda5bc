//! Shared-memory plumbing for the Hermes core.
//!
//! A Hermes node maps one fixed-size segment that every cooperating
//! process on the machine attaches to, possibly at a different virtual
//! address. Everything stored inside is therefore addressed by byte
//! offsets from the segment base, never by pointers, and every
//! synchronization primitive lives inside the segment itself.
//!
//! Three pieces live here:
//!
//! * [`Segment`] — creation, attachment and region carve-up of the mapping.
//! * [`Arena`] — monotonic bump allocation of offsets within a region,
//!   with scoped save/restore for per-call scratch.
//! * [`TicketMutex`] — a FIFO-fair spinlock over two atomics that works
//!   across processes because the atomics are in the mapped region.

pub mod arena;
pub mod segment;
pub mod ticket;

pub use arena::{Arena, ArenaHeader, ScopedTemp};
pub use segment::{Region, Segment, SegmentHeader};
pub use ticket::{TicketGuard, TicketMutex};
