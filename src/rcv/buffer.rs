//! In-memory circular packet store with positional indexing.
//!
//! ```text
//!   |<---------------------- capacity ---------------------->|
//!   |       |<------------- max_off ------------>|           |
//!   +---+---+---+---+---+---+---+---+---+---+---+---+    +---+
//!   | . | . | A | A | A |   | A | R |   | A | A |   | .. | . |
//!   +---+---+---+---+---+---+---+---+---+---+---+---+    +---+
//!             |           |   |
//!             |           |   `- drop_pos: first deliverable after the gap
//!             |           `- end_pos: first gap after the contiguous head
//!             `- start_pos: next in-order packet
//! ```
//!
//! # Design
//!
//! - Fixed-capacity cell array indexed by sequence offset from `start_seq`;
//!   the occupancy of the used range forms an arbitrary bitmap of holes.
//! - Three derived cursors (`start_pos`, `end_pos`, `drop_pos`) plus the
//!   first-unread and first-out-of-order-message cursors are maintained in
//!   O(1) amortized time per insertion; deliveries, drops, retransmission
//!   queries and readiness checks are O(1) lookups against them.
//! - Packets cleared for out-of-order delivery (message mode, TSBPD off)
//!   become readable as soon as their message is contiguously complete; the
//!   consumed cells are left behind as `Read` fillers until the head sweeps
//!   past them.
//! - Drops requested by the retransmission logic reserve the affected cells
//!   as `Dropped` so a late retransmit cannot resurrect them.
//!
//! The enclosing session serializes every cursor-mutating call; only the
//! occupancy counters have their own lock (see [`crate::rcv::stats`]).

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::data::packet::{DataPacket, PacketBoundary};
use crate::data::seq::{MsgNo, SeqNo};
use crate::data::unit::{Unit, UnitPool};
use crate::rcv::cell::{CellArray, CellState};
use crate::rcv::pos::{Pos, Ring};
use crate::rcv::stats::{ByteCounter, CounterSnapshot, MAvg};
use crate::rcv::tsbpd::{Tsbpd, TsbpdClock};
use crate::time::{Duration, Micros, MonoTime};
use crate::trace::{debug, error, trace, warn};

/// Construction parameters of the receive buffer.
#[derive(Debug, Clone)]
pub struct RcvBufferConfig {
    /// Number of cells; must stay below 2^31.
    pub capacity: usize,
    /// Frame deliveries on message boundaries instead of a raw byte stream.
    pub message_api: bool,
    /// Whether the peer sends the retransmit flag inside the message header.
    pub peer_rexmit: bool,
}

impl RcvBufferConfig {
    fn new_validated(capacity: usize, message_api: bool, peer_rexmit: bool) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!((capacity as u64) < i32::MAX as u64, "capacity must stay below 2^31");
        Self {
            capacity,
            message_api,
            peer_rexmit,
        }
    }

    /// Configuration for live transmission: message framing, TSBPD armed later.
    #[must_use]
    pub fn live() -> Self {
        Self::new_validated(8192, true, true)
    }

    /// Configuration for file transfer in stream mode.
    #[must_use]
    pub fn file_stream() -> Self {
        Self::new_validated(8192, false, true)
    }

    /// Configuration for file transfer in message mode.
    #[must_use]
    pub fn file_message() -> Self {
        Self::new_validated(8192, true, true)
    }

    /// Builder-style setter for the cell count.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!((capacity as u64) < i32::MAX as u64, "capacity must stay below 2^31");
        self.capacity = capacity;
        self
    }

    /// Builder-style setter for the peer retransmit-flag capability.
    #[must_use]
    pub fn with_peer_rexmit(mut self, peer_rexmit: bool) -> Self {
        self.peer_rexmit = peer_rexmit;
        self
    }
}

/// Availability snapshot: the earliest deliverable packet and how many
/// packets are contiguously deliverable from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailInfo {
    pub first_seq: SeqNo,
    pub span: usize,
}

/// Outcome of inserting one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Packet stored. `first_time` is the play time of the new earliest
    /// deliverable packet when the insertion moved it earlier (TSBPD only).
    Inserted {
        avail: Option<AvailInfo>,
        first_time: Option<MonoTime>,
    },
    /// The cell for this sequence is already occupied or reserved.
    Redundant,
    /// The sequence precedes the buffer head; the retransmission arrived
    /// after its position was released.
    Belated,
    /// The sequence is at least a full capacity ahead of the head; the
    /// caller must decide whether to reset the link.
    Discrepancy { avail: Option<AvailInfo> },
}

/// What to do with packets already present when dropping a message range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    /// Drop every cell in the range.
    DropExisting,
    /// Keep single-packet messages that already arrived.
    KeepExisting,
}

/// Delivery metadata filled in by [`RcvBuffer::read_message`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageControl {
    /// Message number, taken from the packet opening the message.
    pub msgno: Option<MsgNo>,
    /// Sequence of the last packet extracted.
    pub pktseq: Option<SeqNo>,
    /// Play time of the packet closing the message (TSBPD only).
    pub src_time: Option<MonoTime>,
    /// First and last sequence of the extracted range.
    pub seq_range: Option<(SeqNo, SeqNo)>,
}

/// Description of one notable packet, as reported by the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub seqno: SeqNo,
    /// The packet follows a gap (or belongs to an out-of-order message).
    pub seq_gap: bool,
    /// Play time under TSBPD; `None` when TSBPD is off.
    pub play_time: Option<MonoTime>,
}

/// Internal-consistency failure surfaced by the streaming read.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// An occupied-looking cell inside the readable region held no unit.
    /// Indicates an invariant violation upstream; the buffer does not
    /// attempt self-repair.
    #[error("cell {0} inside the readable region holds no unit")]
    MissingUnit(usize),
}

/// The receive buffer.
///
/// Generic over the TSBPD clock so tests can substitute a deterministic
/// double; production code uses the default [`Tsbpd`].
pub struct RcvBuffer<C: TsbpdClock = Tsbpd> {
    cells: CellArray,
    ring: Ring,
    pool: Arc<dyn UnitPool>,
    tsbpd: C,

    /// Sequence of the cell at `start_pos`.
    start_seq: SeqNo,
    /// Next in-order packet to deliver.
    start_pos: Pos,
    /// First gap after the contiguous head; equals `start_pos` when the head
    /// cell itself is not available.
    end_pos: Pos,
    /// First available cell strictly after that gap; equals `end_pos` when
    /// there is none.
    drop_pos: Pos,
    /// First position not yet handed to the consumer.
    first_nonread: Pos,
    /// One past the greatest occupied offset from `start_pos`.
    max_off: usize,
    /// Bytes already consumed from the packet at `start_pos` (stream reads).
    notch: usize,

    /// Occupied cells whose packet carries the not-in-order flag.
    num_nonorder: usize,
    /// First cell of a complete out-of-order message, when one is buffered.
    first_nonorder_msg: Option<Pos>,

    peer_rexmit: bool,
    message_api: bool,

    counters: ByteCounter,
    mavg: MAvg,
}

impl RcvBuffer {
    /// Creates a buffer of `capacity` cells with `init_seq` at the head.
    #[must_use]
    pub fn new(init_seq: SeqNo, capacity: usize, pool: Arc<dyn UnitPool>, message_api: bool) -> Self {
        Self::with_config(
            init_seq,
            pool,
            RcvBufferConfig::new_validated(capacity, message_api, true),
        )
    }

    #[must_use]
    pub fn with_config(init_seq: SeqNo, pool: Arc<dyn UnitPool>, config: RcvBufferConfig) -> Self {
        Self::with_tsbpd(init_seq, pool, config, Tsbpd::new())
    }
}

impl<C: TsbpdClock> RcvBuffer<C> {
    /// Creates a buffer driven by a caller-provided TSBPD clock.
    #[must_use]
    pub fn with_tsbpd(init_seq: SeqNo, pool: Arc<dyn UnitPool>, config: RcvBufferConfig, tsbpd: C) -> Self {
        assert!((config.capacity as u64) < i32::MAX as u64, "capacity must stay below 2^31");
        Self {
            cells: CellArray::new(config.capacity),
            ring: Ring::new(config.capacity),
            pool,
            tsbpd,
            start_seq: init_seq,
            start_pos: Pos(0),
            end_pos: Pos(0),
            drop_pos: Pos(0),
            first_nonread: Pos(0),
            max_off: 0,
            notch: 0,
            num_nonorder: 0,
            first_nonorder_msg: None,
            peer_rexmit: config.peer_rexmit,
            message_api: config.message_api,
            counters: ByteCounter::new(),
            mavg: MAvg::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------------

    /// Places one packet at its sequence offset from the head.
    pub fn insert(&mut self, unit: Unit) -> InsertResult {
        let seqno = unit.packet().seq_no();
        let off = seqno - self.start_seq;

        if off < 0 {
            trace!(seq = %seqno, start = %self.start_seq, "belated packet");
            return InsertResult::Belated;
        }
        let off = off as usize;
        if off >= self.ring.size() {
            warn!(seq = %seqno, start = %self.start_seq, "sequence discrepancy, packet a full span ahead");
            return InsertResult::Discrepancy {
                avail: self.avail_info(),
            };
        }
        // The gap may never exceed one wrap of the ring; guaranteed by the
        // discrepancy check above.
        debug_assert!((self.start_pos.0 + off) / self.ring.size() < 2);

        let pos = self.inc(self.start_pos, off);
        let prev_max = self.max_off;
        let mut extended = false;
        if off >= self.max_off {
            self.max_off = off + 1;
            extended = true;
        }

        // An occupied cell always lies below the previous max offset, so the
        // extension above cannot have happened when this check fires.
        if self.cells[pos].state != CellState::Empty {
            trace!(seq = %seqno, "redundant packet");
            return InsertResult::Redundant;
        }
        debug_assert!(self.cells[pos].unit.is_none());

        self.pool.acquire(&unit);
        let (len, ts, in_order) = {
            let pkt = unit.packet();
            (pkt.len(), pkt.timestamp(), pkt.order_flag())
        };
        self.cells[pos].unit = Some(unit);
        self.cells[pos].state = CellState::Avail;
        self.counters.add(1, len as i64);

        let first_time = self.update_pos_info(ts, prev_max, pos, extended);

        // With TSBPD, packets are always treated as in order and the flag is
        // ignored.
        if !self.tsbpd.enabled() && self.message_api && !in_order {
            self.num_nonorder += 1;
            self.on_insert_nonorder(pos);
        }

        self.update_nonread_pos();
        self.debug_state("insert");

        InsertResult::Inserted {
            avail: self.avail_info(),
            first_time,
        }
    }

    /// Re-derives `end_pos`/`drop_pos` after the inserted cell changed the
    /// occupancy bitmap, and reports the play time of the new earliest
    /// deliverable packet if the insertion moved it earlier.
    fn update_pos_info(&mut self, ts: u32, prev_max: usize, newpos: Pos, extended: bool) -> Option<MonoTime> {
        let mut earliest = None;
        let prev_max_pos = self.inc(self.start_pos, prev_max);

        if extended {
            // [A] The used range grew. Only matters if the buffer was
            // contiguous up to the previous end.
            if self.end_pos == prev_max_pos {
                if self.max_off == prev_max + 1 {
                    // Grew by exactly one: the head run extends over it.
                    self.end_pos = self.inc(self.start_pos, self.max_off);
                    self.drop_pos = self.end_pos;
                } else {
                    // The new cell sits past a fresh gap: it is the only
                    // after-gap delivery candidate.
                    self.drop_pos = self.inc(self.start_pos, self.max_off - 1);
                }
            }
            // [B] Extended past an existing gap: neither cursor moves.
        } else if newpos == self.end_pos {
            // [C] Filled the first gap after the contiguous head; the run
            // may now extend further.
            if self.end_pos == self.start_pos {
                // The head itself was empty, so this packet is the new
                // earliest deliverable.
                earliest = self.play_time(ts);
            }
            self.update_gap_info(prev_max_pos);
        } else if self.ring.cmp_from(self.start_pos, newpos, self.drop_pos) == Ordering::Less {
            // [D] Landed between the gap and the previous after-gap
            // candidate: it is the better candidate now.
            self.drop_pos = newpos;
            if self.start_pos == self.end_pos {
                earliest = self.play_time(ts);
            }
        }
        // [E] Landed between drop_pos and the end of the used range: no
        // cursor moves.

        earliest
    }

    /// Walks `end_pos` forward to the first empty cell (bounded by `probe`),
    /// then `drop_pos` to the first available cell after it.
    fn update_gap_info(&mut self, probe: Pos) {
        let mut pos = self.end_pos;
        while pos != probe {
            if self.cells[pos].state == CellState::Empty {
                break;
            }
            pos = self.next(pos);
        }
        if pos == probe {
            // No gap up to the probe.
            self.end_pos = probe;
            self.drop_pos = probe;
            return;
        }
        self.end_pos = pos;
        self.drop_pos = pos;
        while pos != probe {
            if self.cells[pos].state == CellState::Avail {
                self.drop_pos = pos;
                break;
            }
            pos = self.next(pos);
        }
    }

    /// Earliest deliverable packet and contiguous span, for insert reports.
    fn avail_info(&self) -> Option<AvailInfo> {
        if self.cells[self.start_pos].state == CellState::Avail {
            return Some(AvailInfo {
                first_seq: self.start_seq,
                span: self.off(self.start_pos, self.end_pos),
            });
        }
        // No head run. Without TSBPD only a complete out-of-order message is
        // deliverable; with TSBPD the after-drop candidate is.
        let fallback = if !self.tsbpd.enabled() {
            self.first_nonorder_msg
        } else if self.drop_pos != self.end_pos {
            Some(self.drop_pos)
        } else {
            None
        };
        let pos = fallback?;
        Some(AvailInfo {
            first_seq: self.packet_at(pos).seq_no(),
            span: 1,
        })
    }

    // ---------------------------------------------------------------------
    // Drops
    // ---------------------------------------------------------------------

    /// Removes every packet with a sequence earlier than `seqno`, so that
    /// `seqno` becomes the head. Returns the number of vacated positions.
    pub fn drop_up_to(&mut self, seqno: SeqNo) -> usize {
        let len = seqno - self.start_seq;
        if len <= 0 {
            debug!(seq = %seqno, start = %self.start_seq, "nothing to drop");
            return 0;
        }
        let len = len as usize;

        self.max_off = self.max_off.saturating_sub(len);

        // Walking more than one full ring would only re-empty cells.
        let walk = len.min(self.ring.size());
        let mut pos = self.start_pos;
        for _ in 0..walk {
            self.drop_unit_at(pos);
            self.cells[pos].state = CellState::Empty;
            pos = self.next(pos);
        }
        self.start_pos = self.inc(self.start_pos, len % self.ring.size());
        self.start_seq = seqno;

        // Sweep any read/dropped fillers now sitting at the head; this may
        // shift the head further.
        self.release_next_fillers();

        self.end_pos = self.start_pos;
        self.drop_pos = self.start_pos;
        let probe = self.inc(self.start_pos, self.max_off);
        self.update_gap_info(probe);

        if !self.in_used_range(self.first_nonread) {
            self.first_nonread = self.start_pos;
            self.update_nonread_pos();
        }
        if !self.tsbpd.enabled() && self.message_api {
            self.update_first_readable_nonorder();
        }

        self.debug_state("drop_up_to");
        len
    }

    /// Drops the whole buffer content. Returns the number of vacated positions.
    pub fn drop_all(&mut self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let end_seq = self.start_seq + self.max_off as i32;
        self.drop_up_to(end_seq)
    }

    /// Drops the packets of one message, addressed by sequence range and
    /// message number. Cells in the range that are still empty are reserved
    /// as dropped so late retransmits cannot resurrect them. Returns the
    /// number of cells that actually held a packet.
    pub fn drop_message(&mut self, seq_lo: SeqNo, seq_hi: SeqNo, msgno: MsgNo, action: DropAction) -> usize {
        let off_a = seq_lo - self.start_seq;
        let off_b = seq_hi - self.start_seq;
        if off_b < 0 {
            debug!(lo = %seq_lo, hi = %seq_hi, start = %self.start_seq, "message range already released");
            return 0;
        }

        let keep_existing = action == DropAction::KeepExisting;
        let mut count = 0usize;
        let mut min_dropped: Option<usize> = None;

        let start_off = off_a.max(0) as usize;
        let end_off = ((off_b as usize) + 1).min(self.ring.size());
        // The requested range is authoritative; the message number only
        // steers the backward search below.
        let mut drop_by_msgno = msgno.is_data();

        for off in start_off..end_off {
            let pos = self.inc(self.start_pos, off);
            if self.cells[pos].state == CellState::Dropped {
                continue;
            }
            if self.cells[pos].unit.is_none() {
                // Not arrived yet; reserve the slot against retransmits.
                self.cells[pos].state = CellState::Dropped;
                min_dropped.get_or_insert(off);
                continue;
            }

            let (seq, bnd, pkt_msg) = {
                let pkt = self.packet_at(pos);
                (pkt.seq_no(), pkt.boundary(), pkt.msg_seq(self.peer_rexmit))
            };
            if keep_existing && bnd == PacketBoundary::Solo {
                drop_by_msgno = false;
                debug!(seq = %seq, "keeping existing solo packet");
                continue;
            }
            if msgno.is_data() && pkt_msg != msgno {
                warn!(seq = %seq, packet_msg = %pkt_msg, requested = %msgno,
                    "dropping packet whose message number differs from the requested one");
            }
            if drop_by_msgno && bnd == PacketBoundary::First {
                // The opening packet is inside the range; no backward search.
                drop_by_msgno = false;
            }

            self.drop_unit_at(pos);
            self.cells[pos].state = CellState::Dropped;
            count += 1;
            min_dropped.get_or_insert(off);
        }

        if drop_by_msgno {
            // The message may start before the requested range if the sender
            // already forgot its first packets. Search backward for them.
            for off in (0..start_off).rev() {
                let pos = self.inc(self.start_pos, off);
                match self.cells[pos].state {
                    CellState::Empty => break,
                    CellState::Dropped | CellState::Read => continue,
                    CellState::Avail => {}
                }
                let (seq, bnd, pkt_msg) = {
                    let pkt = self.packet_at(pos);
                    (pkt.seq_no(), pkt.boundary(), pkt.msg_seq(self.peer_rexmit))
                };
                if pkt_msg != msgno {
                    break;
                }
                if keep_existing && bnd == PacketBoundary::Solo {
                    debug!(seq = %seq, "keeping existing solo message packet");
                    break;
                }
                self.drop_unit_at(pos);
                self.cells[pos].state = CellState::Dropped;
                count += 1;
                min_dropped = Some(off);
                if bnd.has_first() {
                    break;
                }
            }
        }

        let need_nonread_update = min_dropped.is_some_and(|off| off <= self.data_size());

        self.release_next_fillers();
        self.end_pos = self.start_pos;
        self.drop_pos = self.start_pos;
        let probe = self.inc(self.start_pos, self.max_off);
        self.update_gap_info(probe);

        if need_nonread_update {
            self.first_nonread = self.start_pos;
            self.update_nonread_pos();
        }
        if !self.tsbpd.enabled() && self.message_api {
            if !self.nonorder_msg_complete() {
                self.first_nonorder_msg = None;
            }
            self.update_first_readable_nonorder();
        }

        self.debug_state("drop_message");
        count
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Extracts one message into `dst`. Returns the number of bytes copied;
    /// 0 means nothing was readable (consult [`Self::is_rcv_ready`] first).
    ///
    /// An undersized `dst` still consumes the whole message: what does not
    /// fit is lost and an error-level event is logged.
    pub fn read_message(&mut self, dst: &mut [u8], mut ctrl: Option<&mut MessageControl>) -> usize {
        let can_read_inorder = self.has_readable_inorder();
        let read_pos = if can_read_inorder {
            self.start_pos
        } else {
            match self.first_nonorder_msg {
                Some(pos) => pos,
                None => {
                    warn!("nothing to read; was is_rcv_ready consulted?");
                    return 0;
                }
            }
        };
        let from_start = read_pos == self.start_pos;

        let mut remain = dst.len();
        let mut filled = 0usize;
        let mut bytes_extracted = 0usize;
        let mut seq_lo: Option<SeqNo> = None;
        let mut seq_hi: Option<SeqNo> = None;

        let mut pos = read_pos;
        loop {
            if self.cells[pos].unit.is_none() {
                debug_assert!(false, "null cell while extracting a message");
                error!(pos = pos.0, "null cell while extracting a message");
                break;
            }
            let (pktseq, pktsize, ts, in_order, bnd, pkt_msg, copied) = {
                let pkt = self.packet_at(pos);
                let n = remain.min(pkt.len());
                dst[filled..filled + n].copy_from_slice(&pkt.payload()[..n]);
                (
                    pkt.seq_no(),
                    pkt.len(),
                    pkt.timestamp(),
                    pkt.order_flag(),
                    pkt.boundary(),
                    pkt.msg_seq(self.peer_rexmit),
                    n,
                )
            };
            remain -= copied;
            filled += copied;
            bytes_extracted += pktsize;

            if seq_lo.is_none() {
                seq_lo = Some(pktseq);
            }
            seq_hi = Some(pktseq);

            if self.tsbpd.enabled() {
                self.tsbpd.update_time_base(ts);
            }
            if self.num_nonorder > 0 && !in_order {
                self.num_nonorder -= 1;
            }

            let is_last = bnd.has_last();
            if let Some(c) = ctrl.as_deref_mut() {
                if bnd.has_first() {
                    c.msgno = Some(pkt_msg);
                }
                if is_last {
                    c.src_time = self.play_time(ts);
                }
                c.pktseq = Some(pktseq);
            }

            self.release_unit_at(pos);
            self.counters.sub(1, pktsize as i64);

            if from_start {
                self.start_pos = self.next(pos);
                debug_assert!(self.max_off > 0);
                self.max_off -= 1;
                self.start_seq = pktseq.next();
            } else {
                // Out of order: only mark the slot consumed; the head sweeps
                // it up once it catches up.
                self.cells[pos].state = CellState::Read;
            }

            if is_last {
                if Some(read_pos) == self.first_nonorder_msg {
                    self.first_nonorder_msg = None;
                }
                break;
            }
            pos = self.next(pos);
        }

        self.release_next_fillers();

        if !self.in_used_range(self.first_nonread) {
            self.first_nonread = self.start_pos;
        }

        // With start_pos potentially shifted, re-derive end_pos and drop_pos.
        let pend = self.inc(self.start_pos, self.max_off);
        if self.cells[self.start_pos].state == CellState::Avail {
            let mut end = self.next(self.start_pos);
            while end != pend && self.cells[end].state == CellState::Avail {
                end = self.next(end);
            }
            self.end_pos = end;
            self.drop_pos = end;
        } else {
            self.end_pos = self.start_pos;
            self.drop_pos = self.start_pos;
            if self.start_pos != pend {
                let mut drop = self.start_pos;
                loop {
                    if self.cells[drop].state == CellState::Avail {
                        break;
                    }
                    drop = self.next(drop);
                    if drop == pend {
                        drop = self.end_pos;
                        break;
                    }
                }
                self.drop_pos = drop;
            }
        }

        if !self.tsbpd.enabled() {
            // Needed even after an in-order read: it may have consumed the
            // last readable in-order packets.
            self.update_first_readable_nonorder();
        }

        if filled < bytes_extracted {
            error!(
                copied = filled,
                extracted = bytes_extracted,
                "undersized output buffer, rest of the message lost"
            );
        }
        if let Some(c) = ctrl {
            c.seq_range = seq_lo.zip(seq_hi);
        }
        self.debug_state("read_message");
        filled
    }

    /// Streams up to `len` bytes into `sink`, gated by TSBPD when enabled.
    ///
    /// `sink` receives `(chunk, dst_offset)` and returns whether to continue.
    /// A partially consumed packet resumes at the right byte on the next call.
    pub fn read_bytes<F>(&mut self, len: usize, now: MonoTime, mut sink: F) -> Result<usize, ReadError>
    where
        F: FnMut(&[u8], usize) -> bool,
    {
        let end_pos = self.first_nonread;
        let tsbpd_on = self.tsbpd.enabled();

        let mut pos = self.start_pos;
        let mut rs = len;
        while pos != end_pos && rs > 0 {
            if self.cells[pos].unit.is_none() {
                error!(pos = pos.0, "null cell inside the readable region");
                return Err(ReadError::MissingUnit(pos.0));
            }
            let (pktseq, pktlen, remain_pkt, unitsize, keep_going) = {
                let pkt = self.packet_at(pos);
                if tsbpd_on && self.tsbpd.pkt_play_time(pkt.timestamp()) > now {
                    // Too early for this packet; return whatever was copied.
                    break;
                }
                let notch = self.notch.min(pkt.len());
                let remain_pkt = pkt.len() - notch;
                let unitsize = remain_pkt.min(rs);
                let keep_going = sink(&pkt.payload()[notch..notch + unitsize], len - rs);
                (pkt.seq_no(), pkt.len(), remain_pkt, unitsize, keep_going)
            };
            if !keep_going {
                break;
            }
            if rs >= remain_pkt {
                // Packet fully drained; the head moves over it.
                self.release_unit_at(pos);
                self.counters.sub(1, pktlen as i64);
                pos = self.next(pos);
                self.notch = 0;
                self.start_pos = pos;
                debug_assert!(self.max_off > 0);
                self.max_off -= 1;
                self.start_seq = pktseq.next();
            } else {
                self.notch += rs;
            }
            rs -= unitsize;
        }

        let bytes_read = len - rs;
        if !self.in_used_range(self.first_nonread) {
            self.first_nonread = self.start_pos;
        }
        if bytes_read == 0 {
            debug!(
                start = self.start_pos.0,
                nonread = self.first_nonread.0,
                "streaming read returned no bytes"
            );
        }
        self.debug_state("read_bytes");
        Ok(bytes_read)
    }

    /// Streams into a byte slice; see [`Self::read_bytes`].
    pub fn read_buffer(&mut self, dst: &mut [u8], now: MonoTime) -> Result<usize, ReadError> {
        let len = dst.len();
        self.read_bytes(len, now, |chunk, off| {
            dst[off..off + chunk.len()].copy_from_slice(chunk);
            true
        })
    }

    // ---------------------------------------------------------------------
    // Cursor maintenance
    // ---------------------------------------------------------------------

    /// Sweeps read/dropped fillers at the head, reclaiming their slots.
    fn release_next_fillers(&mut self) {
        while matches!(
            self.cells[self.start_pos].state,
            CellState::Read | CellState::Dropped
        ) {
            self.start_seq = self.start_seq.next();
            self.release_unit_at(self.start_pos);
            self.start_pos = self.next(self.start_pos);
            self.max_off = self.max_off.saturating_sub(1);
        }
    }

    /// Advances `first_nonread` over freshly readable packets: whole messages
    /// in message mode, the contiguous available run otherwise.
    fn update_nonread_pos(&mut self) {
        if self.max_off == 0 {
            return;
        }
        let end = self.inc(self.start_pos, self.max_off);
        loop {
            let pos = self.first_nonread;
            if pos == end || self.cells[pos].state != CellState::Avail {
                break;
            }
            if self.message_api && !self.packet_at(pos).boundary().has_first() {
                break;
            }
            let mut advanced = false;
            let mut i = pos;
            while i != end && self.cells[i].state == CellState::Avail {
                if !self.message_api || self.packet_at(i).boundary().has_last() {
                    // Move one past the closing packet; in message mode the
                    // cell there may well be empty.
                    self.first_nonread = self.next(i);
                    advanced = true;
                    break;
                }
                i = self.next(i);
            }
            if !advanced {
                // The message at the nonread position is not complete yet.
                break;
            }
        }
    }

    /// Reacts to an out-of-order packet insertion: if no out-of-order message
    /// is pending yet, checks whether this packet completed one.
    fn on_insert_nonorder(&mut self, pos: Pos) {
        // An already discovered message is read first; the next search runs
        // when it is read out.
        if self.first_nonorder_msg.is_some() {
            return;
        }
        debug_assert!(self.max_off > 0);
        let (bnd, msgno) = {
            let pkt = self.packet_at(pos);
            (pkt.boundary(), pkt.msg_seq(self.peer_rexmit))
        };
        // The closing packet is expected to arrive last, so check for it first.
        let has_last = bnd.has_last() || self.scan_nonorder_right(pos, msgno).is_some();
        if !has_last {
            return;
        }
        let first = if bnd.has_first() {
            Some(pos)
        } else {
            self.scan_nonorder_left(pos, msgno)
        };
        if first.is_some() {
            self.first_nonorder_msg = first;
        }
    }

    /// Finds the closing packet of `msgno` to the right of `start`, without
    /// crossing a hole or another message.
    fn scan_nonorder_right(&self, start: Pos, msgno: MsgNo) -> Option<Pos> {
        let last_pos = self.inc(self.start_pos, self.max_off - 1);
        if start == last_pos {
            return None;
        }
        let mut pos = start;
        loop {
            pos = self.next(pos);
            self.cells[pos].unit.as_ref()?;
            let pkt = self.packet_at(pos);
            if pkt.msg_seq(self.peer_rexmit) != msgno {
                error!(msgno = %msgno, "message has no closing packet before the next message");
                return None;
            }
            if pkt.boundary().has_last() {
                return Some(pos);
            }
            if pos == last_pos {
                return None;
            }
        }
    }

    /// Finds the opening packet of `msgno` to the left of `start`, without
    /// crossing a hole or another message.
    fn scan_nonorder_left(&self, start: Pos, msgno: MsgNo) -> Option<Pos> {
        if start == self.start_pos {
            return None;
        }
        let mut pos = start;
        loop {
            pos = self.dec(pos);
            self.cells[pos].unit.as_ref()?;
            let pkt = self.packet_at(pos);
            if pkt.msg_seq(self.peer_rexmit) != msgno {
                error!(msgno = %msgno, "message has no opening packet after the previous message");
                return None;
            }
            if pkt.boundary().has_first() {
                return Some(pos);
            }
            if pos == self.start_pos {
                return None;
            }
        }
    }

    /// Whether the message at `first_nonorder_msg` is still contiguously
    /// complete and entirely out-of-order.
    fn nonorder_msg_complete(&self) -> bool {
        if self.num_nonorder == 0 || self.max_off == 0 {
            return false;
        }
        let Some(first) = self.first_nonorder_msg else {
            return false;
        };
        let end = self.inc(self.start_pos, self.max_off);
        let mut msgno: Option<MsgNo> = None;
        let mut pos = first;
        while pos != end {
            let Some(unit) = self.cells[pos].unit.as_ref() else {
                return false;
            };
            let pkt = unit.packet();
            if pkt.order_flag() {
                return false;
            }
            let m = pkt.msg_seq(self.peer_rexmit);
            match msgno {
                None => msgno = Some(m),
                Some(prev) if prev != m => return false,
                _ => {}
            }
            if pkt.boundary().has_last() {
                return true;
            }
            pos = self.next(pos);
        }
        false
    }

    /// Full scan for the earliest complete out-of-order message; only runs
    /// when no in-order packets are readable and no message is pending.
    fn update_first_readable_nonorder(&mut self) {
        if self.has_readable_inorder() || self.num_nonorder == 0 || self.first_nonorder_msg.is_some() {
            return;
        }
        if self.max_off == 0 {
            return;
        }
        let last_pos = self.inc(self.start_pos, self.max_off - 1);
        let mut remain = self.num_nonorder;
        let mut first: Option<Pos> = None;
        let mut msgno: Option<MsgNo> = None;

        let mut pos = self.start_pos;
        while remain > 0 {
            match self.cells[pos].unit.as_ref() {
                None => {
                    first = None;
                    msgno = None;
                }
                Some(unit) => {
                    let pkt = unit.packet();
                    if pkt.order_flag() {
                        first = None;
                        msgno = None;
                    } else {
                        remain -= 1;
                        let m = pkt.msg_seq(self.peer_rexmit);
                        let bnd = pkt.boundary();
                        if bnd.has_first() {
                            first = Some(pos);
                            msgno = Some(m);
                        }
                        if msgno != Some(m) {
                            first = None;
                            msgno = None;
                        } else if bnd.has_last() && first.is_some() {
                            self.first_nonorder_msg = first;
                            return;
                        }
                    }
                }
            }
            if pos == last_pos {
                break;
            }
            pos = self.next(pos);
        }
    }

    // ---------------------------------------------------------------------
    // Query surface
    // ---------------------------------------------------------------------

    /// Whether a read would deliver something: the head is readable in order
    /// or a complete out-of-order message is buffered.
    #[must_use]
    pub fn has_available_packets(&self) -> bool {
        self.has_readable_inorder()
            || (self.num_nonorder > 0 && self.first_nonorder_msg.is_some())
    }

    /// Consumer-visible size in packets.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.off(self.start_pos, self.first_nonread)
    }

    /// Play-time span of the buffered packets in milliseconds; 0 without
    /// TSBPD. Dropped edge cells are skipped by walking inward.
    #[must_use]
    pub fn timespan_ms(&self) -> u64 {
        if !self.tsbpd.enabled() || self.max_off == 0 {
            return 0;
        }
        let mut last = self.inc(self.start_pos, self.max_off - 1);
        while self.cells[last].unit.is_none() && last != self.start_pos {
            last = self.dec(last);
        }
        if self.cells[last].unit.is_none() {
            return 0;
        }
        let mut first = self.start_pos;
        while self.cells[first].unit.is_none() && first != last {
            first = self.next(first);
        }
        let start_time = self.tsbpd.pkt_play_time(self.packet_at(first).timestamp());
        let end_time = self.tsbpd.pkt_play_time(self.packet_at(last).timestamp());
        if end_time < start_time {
            return 0;
        }
        // Count one millisecond as the duration of a packet, so a single
        // buffered packet reports 1 ms.
        (end_time - start_time).as_millis() + 1
    }

    /// The head packet if the head is occupied, else the after-gap candidate
    /// flagged as following a gap, else nothing.
    #[must_use]
    pub fn first_valid_packet_info(&self) -> Option<PacketInfo> {
        let (pos, seq_gap) = if self.cells[self.start_pos].state == CellState::Avail {
            (self.start_pos, false)
        } else if self.drop_pos != self.end_pos {
            (self.drop_pos, true)
        } else {
            return None;
        };
        let pkt = self.packet_at(pos);
        Some(PacketInfo {
            seqno: pkt.seq_no(),
            seq_gap,
            play_time: self.play_time(pkt.timestamp()),
        })
    }

    /// Whether a read at `now` would succeed.
    #[must_use]
    pub fn is_rcv_ready(&self, now: MonoTime) -> bool {
        let has_inorder = self.has_readable_inorder();
        if !self.tsbpd.enabled() {
            if has_inorder {
                return true;
            }
            debug_assert!(self.message_api || self.num_nonorder == 0);
            return self.num_nonorder > 0 && self.first_nonorder_msg.is_some();
        }
        if !has_inorder {
            return false;
        }
        match self.first_valid_packet_info() {
            Some(info) => info.play_time.map_or(true, |t| t <= now),
            None => false,
        }
    }

    /// The packet a read at `now` would start from, if any.
    #[must_use]
    pub fn first_readable_packet_info(&self, now: MonoTime) -> Option<PacketInfo> {
        let has_inorder = self.has_readable_inorder();
        if !self.tsbpd.enabled() {
            if has_inorder {
                let pkt = self.packet_at(self.start_pos);
                return Some(PacketInfo {
                    seqno: pkt.seq_no(),
                    seq_gap: false,
                    play_time: None,
                });
            }
            debug_assert!(self.message_api || self.num_nonorder == 0);
            if let Some(pos) = self.first_nonorder_msg {
                debug_assert!(self.num_nonorder > 0);
                let pkt = self.packet_at(pos);
                return Some(PacketInfo {
                    seqno: pkt.seq_no(),
                    seq_gap: true,
                    play_time: None,
                });
            }
            return None;
        }
        if !has_inorder {
            return None;
        }
        let info = self.first_valid_packet_info()?;
        if info.play_time.map_or(true, |t| t <= now) {
            Some(info)
        } else {
            None
        }
    }

    /// First missing sequence at or after `from`, if `from` is inside the
    /// used range and a loss exists.
    #[must_use]
    pub fn first_loss_seq(&self, from: SeqNo) -> Option<SeqNo> {
        self.first_loss_off(from)
            .map(|off| self.start_seq + off as i32)
    }

    /// First loss at or after `from` together with the inclusive end of its
    /// gap.
    #[must_use]
    pub fn first_loss_range(&self, from: SeqNo) -> Option<(SeqNo, SeqNo)> {
        let lo = self.first_loss_off(from)?;
        for off in lo + 1..self.max_off {
            if self.cells[self.inc(self.start_pos, off)].state != CellState::Empty {
                return Some((self.start_seq + lo as i32, self.start_seq + (off - 1) as i32));
            }
        }
        // The last cell of the used range is always occupied, so a gap not
        // followed by any occupied cell means a packet vanished.
        error!(from = %from, "gap not followed by any occupied cell");
        None
    }

    fn first_loss_off(&self, from: SeqNo) -> Option<usize> {
        let off = from - self.start_seq;
        if off < 0 || off as usize >= self.max_off {
            debug!(from = %from, max_off = self.max_off, "no loss: sequence outside the used range");
            return None;
        }
        let off = off as usize;
        let end_off = self.off(self.start_pos, self.end_pos);
        if off < end_off {
            // Inside the contiguous head: the first loss is right behind it,
            // unless the whole used range is contiguous.
            if end_off != self.max_off {
                Some(end_off)
            } else {
                None
            }
        } else {
            (off..self.max_off).find(|&o| self.cells[self.inc(self.start_pos, o)].state == CellState::Empty)
        }
    }

    /// One past the last sequence of the contiguous head, and whether any
    /// occupied cells exist past it.
    #[must_use]
    pub fn contiguous_end(&self) -> (SeqNo, bool) {
        if self.start_pos == self.end_pos {
            // No contiguous head (including an empty buffer).
            return (self.start_seq, self.max_off > 0);
        }
        let end_off = self.off(self.start_pos, self.end_pos);
        (self.start_seq + end_off as i32, end_off < self.max_off)
    }

    /// First sequence in the buffer and one past the last consumer-visible one.
    #[must_use]
    pub fn available_packets_range(&self) -> (SeqNo, SeqNo) {
        let nonread_off = self.off(self.start_pos, self.first_nonread);
        (self.start_seq, self.start_seq + nonread_off as i32)
    }

    /// Instantaneous `(packets, bytes, timespan_ms)` reading.
    #[must_use]
    pub fn size_snapshot(&self) -> (usize, usize, u64) {
        let snap = self.counters.snapshot();
        (snap.pkts, snap.bytes, self.timespan_ms())
    }

    /// Occupancy counters; safe to call from observability threads through a
    /// shared reference.
    #[must_use]
    pub fn stats(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Smoothed payload size of inserted packets.
    #[must_use]
    pub fn avg_payload_size(&self) -> usize {
        self.counters.snapshot().avg_payload
    }

    /// Refreshes the occupancy moving averages; rate-limited, driven by the
    /// ACK path.
    pub fn update_avg_data_size(&mut self, now: MonoTime) {
        if !self.mavg.is_time_to_update(now) {
            return;
        }
        let (pkts, bytes, timespan) = self.size_snapshot();
        self.mavg.update(now, pkts, bytes, timespan);
    }

    /// Moving-average `(packets, bytes, timespan_ms)` of the buffer occupancy.
    #[must_use]
    pub fn avg_data_size(&self) -> (usize, usize, u64) {
        (self.mavg.pkts(), self.mavg.bytes(), self.mavg.timespan_ms())
    }

    /// Cells free for new packets, counted against the first unacknowledged
    /// sequence.
    #[must_use]
    pub fn avail_size(&self, first_unack: SeqNo) -> usize {
        let used = (first_unack - self.start_seq).max(0) as usize;
        self.ring.size().saturating_sub(used)
    }

    /// Human-readable occupancy report for periodic debug logging.
    #[must_use]
    pub fn fullness(&self, first_unack: SeqNo, now: MonoTime) -> String {
        use std::fmt::Write as _;

        let mut s = String::new();
        let _ = write!(
            s,
            "first_unack={} start_seq={} start_pos={} max_off={}. ",
            first_unack, self.start_seq, self.start_pos.0, self.max_off
        );
        let _ = write!(
            s,
            "space avail {}/{} pkts. ",
            self.avail_size(first_unack),
            self.ring.size()
        );
        if self.tsbpd.enabled() && self.max_off > 0 {
            let _ = s.write_str("(tsbpd ready in ");
            match self.first_valid_packet_info().and_then(|info| info.play_time) {
                Some(t) => {
                    let _ = write!(s, "{}ms", (t.as_u64() as i64 - now.as_u64() as i64) / 1_000);
                    let last = self.inc(self.start_pos, self.max_off - 1);
                    if let Some(unit) = self.cells[last].unit.as_ref() {
                        let span = self.tsbpd.pkt_play_time(unit.packet().timestamp());
                        let _ = write!(s, ", timespan {}ms", (span.as_u64() as i64 - t.as_u64() as i64) / 1_000);
                    }
                }
                None => {
                    let _ = s.write_str("n/a");
                }
            }
            let _ = s.write_str("). ");
        }
        let _ = write!(s, "drift {}ms.", self.tsbpd.drift() / 1_000);
        s
    }

    /// Whether the buffer holds no occupied cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_off == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.size()
    }

    /// Sequence of the cell at the head.
    #[must_use]
    pub fn start_seq(&self) -> SeqNo {
        self.start_seq
    }

    /// Switches the message-number decoding per the peer's capability.
    pub fn set_peer_rexmit(&mut self, peer_rexmit: bool) {
        self.peer_rexmit = peer_rexmit;
    }

    // ---------------------------------------------------------------------
    // TSBPD pass-through
    // ---------------------------------------------------------------------

    /// Arms time-gated delivery.
    pub fn set_tsbpd_mode(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>) {
        self.tsbpd.set_mode(base, wrap, delay);
    }

    /// Adopts base, delay and drift negotiated by a socket group.
    pub fn apply_group_time(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>, drift: i64) {
        self.tsbpd.apply_group_time(base, wrap, delay, drift);
    }

    /// Adopts base and drift from a socket group.
    pub fn apply_group_drift(&mut self, base: MonoTime, wrap: bool, drift: i64) {
        self.tsbpd.apply_group_drift(base, wrap, drift);
    }

    /// Feeds one clock-drift sample from an ACK exchange.
    pub fn add_drift_sample(&mut self, ts: u32, arrival: MonoTime, rtt_us: i64) -> bool {
        self.tsbpd.add_drift_sample(ts, arrival, rtt_us)
    }

    /// Wrap-adjusted local anchor for packet timestamp `ts`.
    #[must_use]
    pub fn tsbpd_time_base(&self, ts: u32) -> MonoTime {
        self.tsbpd.time_base(ts)
    }

    /// Current drift compensation in microseconds.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.tsbpd.drift()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    #[inline]
    fn inc(&self, p: Pos, k: usize) -> Pos {
        self.ring.inc(p, k)
    }

    #[inline]
    fn next(&self, p: Pos) -> Pos {
        self.ring.next(p)
    }

    #[inline]
    fn dec(&self, p: Pos) -> Pos {
        self.ring.dec(p)
    }

    #[inline]
    fn off(&self, from: Pos, to: Pos) -> usize {
        self.ring.off(from, to)
    }

    #[inline]
    fn in_used_range(&self, pos: Pos) -> bool {
        pos == self.start_pos || self.off(self.start_pos, pos) <= self.max_off
    }

    #[inline]
    fn has_readable_inorder(&self) -> bool {
        self.first_nonread != self.start_pos
    }

    fn packet_at(&self, pos: Pos) -> &DataPacket {
        self.cells[pos].unit.as_ref().expect("occupied cell").packet()
    }

    fn play_time(&self, ts: u32) -> Option<MonoTime> {
        if self.tsbpd.enabled() {
            Some(self.tsbpd.pkt_play_time(ts))
        } else {
            None
        }
    }

    /// Takes the unit out of a cell, returns it to the pool and vacates the
    /// slot. Returns the payload length if a unit was present.
    fn release_unit_at(&mut self, pos: Pos) -> Option<usize> {
        let unit = self.cells[pos].unit.take();
        self.cells[pos].state = CellState::Empty;
        match unit {
            Some(unit) => {
                let len = unit.packet().len();
                self.pool.release(unit);
                Some(len)
            }
            None => None,
        }
    }

    /// Releases a cell on behalf of the drop path, maintaining the TSBPD
    /// base / out-of-order accounting. Returns whether a unit was present.
    fn drop_unit_at(&mut self, pos: Pos) -> bool {
        if self.cells[pos].unit.is_none() {
            return false;
        }
        let (ts, in_order) = {
            let pkt = self.packet_at(pos);
            (pkt.timestamp(), pkt.order_flag())
        };
        if self.tsbpd.enabled() {
            self.tsbpd.update_time_base(ts);
        } else if self.message_api && !in_order {
            debug_assert!(self.num_nonorder > 0);
            self.num_nonorder = self.num_nonorder.saturating_sub(1);
            if Some(pos) == self.first_nonorder_msg {
                self.first_nonorder_msg = None;
            }
        }
        if let Some(len) = self.release_unit_at(pos) {
            self.counters.sub(1, len as i64);
        }
        true
    }

    fn debug_state(&self, op: &'static str) {
        trace!(
            op,
            start = self.start_pos.0,
            end = self.end_pos.0,
            drop = self.drop_pos.0,
            max_off = self.max_off,
            start_seq = %self.start_seq,
            "buffer state"
        );
    }
}

impl<C: TsbpdClock> Drop for RcvBuffer<C> {
    fn drop(&mut self) {
        // Every unit still held goes back to the pool exactly once.
        for i in 0..self.cells.len() {
            if let Some(unit) = self.cells[Pos(i)].unit.take() {
                self.pool.release(unit);
            }
        }
    }
}
