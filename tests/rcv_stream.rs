//! End-to-end scenarios driving the receive buffer through its public API.
//!
//! These tests exercise the complete flow a transport session performs:
//! 1. The network thread inserts parsed packets in arrival order
//! 2. The retransmission controller queries losses and drops abandoned ranges
//! 3. The consumer reads messages or bytes, optionally gated by TSBPD

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use weir::time::Duration;
use weir::{
    DataPacket, DropAction, HeapPool, InsertResult, MessageControl, MonoTime, MsgNo,
    PacketBoundary, RcvBuffer, RcvBufferConfig, SeqNo, Unit,
};

const CAP: usize = 64;
const FIRST_SEQ: i32 = 52_000;

/// Packet with a deterministic timestamp: 1 ms per sequence step.
fn packet(seq: i32, msgno: i32, bnd: PacketBoundary, in_order: bool, payload: Vec<u8>) -> Unit {
    let ts = (seq - FIRST_SEQ).max(0) as u32 * 1_000;
    Unit::new(DataPacket::new(
        SeqNo::new(seq),
        MsgNo::new(msgno),
        bnd,
        in_order,
        ts,
        Bytes::from(payload),
    ))
}

/// Splits `data` into `pkt_size`-byte packets forming one message.
fn message_packets(first_seq: i32, msgno: i32, data: &[u8], pkt_size: usize) -> Vec<Unit> {
    let chunks: Vec<&[u8]> = data.chunks(pkt_size).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let bnd = match (i == 0, i == last) {
                (true, true) => PacketBoundary::Solo,
                (true, false) => PacketBoundary::First,
                (false, true) => PacketBoundary::Last,
                (false, false) => PacketBoundary::Middle,
            };
            packet(first_seq + i as i32, msgno, bnd, true, chunk.to_vec())
        })
        .collect()
}

#[test]
fn shuffled_arrival_reassembles_message_stream() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut buf = RcvBuffer::new(SeqNo::new(FIRST_SEQ), CAP, Arc::new(HeapPool), true);

    // Twelve messages of growing length, split into 5-byte packets.
    let mut messages = Vec::new();
    let mut units = Vec::new();
    let mut next_seq = FIRST_SEQ;
    for m in 1..=12i32 {
        let body: Vec<u8> = (0..(m * 3 + 2)).map(|i| (m * 31 + i) as u8).collect();
        let pkts = message_packets(next_seq, m, &body, 5);
        next_seq += pkts.len() as i32;
        messages.push(body);
        units.extend(pkts);
    }

    units.shuffle(&mut rng);
    for u in units {
        assert!(matches!(buf.insert(u), InsertResult::Inserted { .. }));
    }

    // Everything arrived, so the messages read back in order.
    let mut out = Vec::new();
    let mut dst = [0u8; 256];
    while buf.has_available_packets() {
        let mut ctrl = MessageControl::default();
        let n = buf.read_message(&mut dst, Some(&mut ctrl));
        assert!(n > 0);
        assert_eq!(ctrl.msgno, Some(MsgNo::new(out.len() as i32 + 1)));
        out.push(dst[..n].to_vec());
    }
    assert_eq!(out, messages);
    assert!(buf.is_empty());
}

#[test]
fn loss_tracking_guides_retransmission() {
    let mut buf = RcvBuffer::new(SeqNo::new(FIRST_SEQ), CAP, Arc::new(HeapPool), true);
    for off in [0, 1, 2, 5, 6, 9] {
        let s = FIRST_SEQ + off;
        assert!(matches!(
            buf.insert(packet(s, off + 1, PacketBoundary::Solo, true, vec![b'x'; 8])),
            InsertResult::Inserted { .. }
        ));
    }

    // The controller asks for the first hole and "retransmits" it.
    let (lo, hi) = buf.first_loss_range(SeqNo::new(FIRST_SEQ)).unwrap();
    assert_eq!((lo.raw(), hi.raw()), (FIRST_SEQ + 3, FIRST_SEQ + 4));
    for s in lo.raw()..=hi.raw() {
        let off = s - FIRST_SEQ;
        assert!(matches!(
            buf.insert(packet(s, off + 1, PacketBoundary::Solo, true, vec![b'x'; 8])),
            InsertResult::Inserted { .. }
        ));
    }

    // The next hole shows up behind the grown contiguous head.
    let (lo, hi) = buf.first_loss_range(SeqNo::new(FIRST_SEQ)).unwrap();
    assert_eq!((lo.raw(), hi.raw()), (FIRST_SEQ + 7, FIRST_SEQ + 8));
    for s in lo.raw()..=hi.raw() {
        let off = s - FIRST_SEQ;
        assert!(matches!(
            buf.insert(packet(s, off + 1, PacketBoundary::Solo, true, vec![b'x'; 8])),
            InsertResult::Inserted { .. }
        ));
    }

    assert_eq!(buf.first_loss_seq(SeqNo::new(FIRST_SEQ)), None);
    let (end, more) = buf.contiguous_end();
    assert_eq!(end.raw(), FIRST_SEQ + 10);
    assert!(!more);
}

#[test]
fn tsbpd_live_delivery_with_latency() {
    let config = RcvBufferConfig::live().with_capacity(CAP);
    let mut buf = RcvBuffer::with_config(SeqNo::new(FIRST_SEQ), Arc::new(HeapPool), config);
    buf.set_tsbpd_mode(MonoTime::new(10_000), false, Duration::from_millis(120));

    for i in 0..4 {
        let s = FIRST_SEQ + i;
        assert!(matches!(
            buf.insert(packet(s, i + 1, PacketBoundary::Solo, true, vec![0xAB; 100])),
            InsertResult::Inserted { .. }
        ));
    }

    // The head packet plays at base + ts + latency = 130 ms.
    assert!(!buf.is_rcv_ready(MonoTime::new(129_999)));
    assert!(buf.is_rcv_ready(MonoTime::new(130_000)));
    assert_eq!(buf.timespan_ms(), 4);

    buf.update_avg_data_size(MonoTime::new(130_000));
    let (avg_pkts, avg_bytes, _) = buf.avg_data_size();
    assert_eq!((avg_pkts, avg_bytes), (4, 400));

    let report = buf.fullness(SeqNo::new(FIRST_SEQ), MonoTime::new(130_000));
    assert!(report.contains("tsbpd ready"), "{report}");

    // Delivery itself is not time-gated here: the TSBPD worker decides via
    // is_rcv_ready and then extracts.
    let mut dst = [0u8; 128];
    for i in 0..4 {
        let mut ctrl = MessageControl::default();
        assert_eq!(buf.read_message(&mut dst, Some(&mut ctrl)), 100);
        assert_eq!(ctrl.pktseq, Some(SeqNo::new(FIRST_SEQ + i)));
        assert_eq!(ctrl.src_time, Some(MonoTime::new(130_000 + i as u64 * 1_000)));
    }
    assert!(buf.is_empty());
}

#[test]
fn too_late_message_is_dropped_and_stays_dropped() {
    let mut buf = RcvBuffer::new(SeqNo::new(FIRST_SEQ), CAP, Arc::new(HeapPool), true);

    // First message delivers normally.
    assert!(matches!(
        buf.insert(packet(FIRST_SEQ, 1, PacketBoundary::Solo, true, b"hi".to_vec())),
        InsertResult::Inserted { .. }
    ));
    let mut dst = [0u8; 64];
    assert_eq!(buf.read_message(&mut dst, None), 2);

    // Message 3 spans three packets but its opener never arrives.
    assert!(matches!(
        buf.insert(packet(FIRST_SEQ + 2, 3, PacketBoundary::Middle, true, b"bb".to_vec())),
        InsertResult::Inserted { .. }
    ));
    assert!(matches!(
        buf.insert(packet(FIRST_SEQ + 3, 3, PacketBoundary::Last, true, b"cc".to_vec())),
        InsertResult::Inserted { .. }
    ));

    // The sender gives up on the message; the two buffered packets are
    // counted, the missing opener's cell is reserved, and the whole dropped
    // range is immediately swept off the head.
    let dropped = buf.drop_message(
        SeqNo::new(FIRST_SEQ + 1),
        SeqNo::new(FIRST_SEQ + 3),
        MsgNo::new(3),
        DropAction::DropExisting,
    );
    assert_eq!(dropped, 2);
    assert!(buf.is_empty());
    assert_eq!(buf.start_seq(), SeqNo::new(FIRST_SEQ + 4));

    // A straggling retransmit of the dropped range bounces off.
    assert!(matches!(
        buf.insert(packet(FIRST_SEQ + 1, 3, PacketBoundary::First, true, b"aa".to_vec())),
        InsertResult::Belated
    ));

    // The stream continues undisturbed.
    assert!(matches!(
        buf.insert(packet(FIRST_SEQ + 4, 4, PacketBoundary::Solo, true, b"ok".to_vec())),
        InsertResult::Inserted { .. }
    ));
    assert_eq!(buf.read_message(&mut dst, None), 2);
    assert_eq!(&dst[..2], b"ok");
}

#[test]
fn stream_mode_transfers_a_file_image() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = RcvBufferConfig::file_stream().with_capacity(CAP);
    let mut buf = RcvBuffer::with_config(SeqNo::new(FIRST_SEQ), Arc::new(HeapPool), config);

    let image: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
    let mut units: Vec<Unit> = image
        .chunks(40)
        .enumerate()
        .map(|(i, c)| {
            packet(
                FIRST_SEQ + i as i32,
                MsgNo::CONTROL.raw(),
                PacketBoundary::Solo,
                true,
                c.to_vec(),
            )
        })
        .collect();

    // Moderate link reordering: shuffle within windows of four packets.
    for w in units.chunks_mut(4) {
        w.shuffle(&mut rng);
    }
    for u in units {
        assert!(matches!(buf.insert(u), InsertResult::Inserted { .. }));
    }

    // Drain through odd-sized reads to exercise mid-packet resumption.
    let now = MonoTime::new(0);
    let mut out = Vec::new();
    let mut chunk = [0u8; 97];
    loop {
        let n = buf.read_buffer(&mut chunk, now).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(out, image);
    assert!(buf.is_empty());
}

#[test]
fn sequence_numbers_wrap_across_the_ring_boundary() {
    let init = SeqNo::new(0x7FFF_FFFF - 2);
    let mut buf = RcvBuffer::new(init, 16, Arc::new(HeapPool), true);

    for i in 0..6 {
        let u = Unit::new(DataPacket::new(
            init + i,
            MsgNo::new(i + 1),
            PacketBoundary::Solo,
            true,
            0,
            Bytes::from_static(b"wrap!"),
        ));
        assert!(matches!(buf.insert(u), InsertResult::Inserted { .. }));
    }

    let mut dst = [0u8; 16];
    for i in 0..6 {
        let mut ctrl = MessageControl::default();
        assert_eq!(buf.read_message(&mut dst, Some(&mut ctrl)), 5);
        assert_eq!(ctrl.pktseq, Some(init + i));
    }
    assert!(buf.is_empty());
    assert_eq!(buf.start_seq().raw(), 3);
}
