//! Receive buffer for a sequence-numbered reliable datagram transport.
//!
//! The buffer sits between the network-facing packet ingestion path and the
//! application-facing read API of a transport session. Packets arrive in
//! arbitrary order (loss, reordering, retransmission); the buffer places them
//! into a fixed-capacity circular cell array indexed by sequence offset,
//! tracks the gaps, and delivers payloads either as framed messages or as a
//! contiguous byte stream, optionally gated by time-stamp-based packet
//! delivery (TSBPD).
//!
//! The entry points are:
//!
//! - [`rcv::buffer::RcvBuffer::insert`] — called by the network thread for
//!   every parsed data packet,
//! - [`rcv::buffer::RcvBuffer::drop_up_to`] and
//!   [`rcv::buffer::RcvBuffer::drop_message`] — called by the retransmission
//!   controller when it gives up on a range,
//! - [`rcv::buffer::RcvBuffer::read_message`] and
//!   [`rcv::buffer::RcvBuffer::read_bytes`] — called by the consumer.
//!
//! All cursor-mutating calls assume the mutual exclusion provided by the
//! enclosing session; only the occupancy counters are independently locked so
//! that observability readers never contend with the receive path.

pub mod data;
pub mod rcv;
pub mod time;

mod trace;

pub use trace::init_tracing;

pub use data::packet::{DataPacket, PacketBoundary};
pub use data::seq::{MsgNo, SeqNo};
pub use data::unit::{HeapPool, Unit, UnitPool};
pub use rcv::buffer::{
    AvailInfo, DropAction, InsertResult, MessageControl, PacketInfo, RcvBuffer, RcvBufferConfig,
    ReadError,
};
pub use rcv::tsbpd::{Tsbpd, TsbpdClock};
pub use time::{MonoClock, MonoTime};
