//! Sequence and message numbering for the datagram stream.
//!
//! Sequence numbers live on a 31-bit ring: the wire carries values in
//! `[0, 2^31)` and subtraction is defined modulo 2^31, mapping the upper half
//! of the ring to negative offsets. Two sequences further apart than 2^30 are
//! undefined at the protocol level and never occur on a healthy link.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Span of the sequence ring.
const SEQ_SPAN: i64 = 1 << 31;

/// Half the ring; offsets at or past this point wrap negative.
const SEQ_HALF: i32 = 1 << 30;

/// 31-bit wrap-safe sequence number of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqNo(i32);

impl SeqNo {
    /// Largest representable sequence number.
    pub const MAX: Self = Self(0x7FFF_FFFF);

    /// Creates a sequence number from its wire value.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `value` is outside `[0, 2^31)`.
    #[inline]
    #[must_use]
    pub const fn new(value: i32) -> Self {
        debug_assert!(value >= 0);
        Self(value)
    }

    /// Raw wire value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Following sequence number (wraps at 2^31).
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        self + 1
    }
}

impl core::ops::Add<i32> for SeqNo {
    type Output = Self;

    /// Steps `rhs` positions forward (or backward) along the ring.
    #[inline]
    fn add(self, rhs: i32) -> Self {
        Self((i64::from(self.0) + i64::from(rhs)).rem_euclid(SEQ_SPAN) as i32)
    }
}

impl core::ops::Sub for SeqNo {
    type Output = i32;

    /// Signed ring distance `self - rhs`, in `[-2^30, 2^30)`.
    #[inline]
    fn sub(self, rhs: Self) -> i32 {
        let fwd = (i64::from(self.0) - i64::from(rhs.0)).rem_euclid(SEQ_SPAN);
        if fwd >= i64::from(SEQ_HALF) {
            (fwd - SEQ_SPAN) as i32
        } else {
            fwd as i32
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifier shared by all packets of one application message.
///
/// The wire field is 26 or 27 bits wide depending on whether the peer
/// understands the retransmit flag; see
/// [`DataPacket::msg_seq`](crate::data::packet::DataPacket::msg_seq).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgNo(i32);

impl MsgNo {
    /// No message number available.
    pub const NONE: Self = Self(-1);

    /// Reserved for control traffic.
    pub const CONTROL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// True for application message numbers (excludes `NONE` and `CONTROL`).
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        self.0 > Self::CONTROL.0
    }
}

impl fmt::Display for MsgNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_offset() {
        assert_eq!(SeqNo::new(1005) - SeqNo::new(1000), 5);
        assert_eq!(SeqNo::new(1000) - SeqNo::new(1000), 0);
    }

    #[test]
    fn backward_offset() {
        assert_eq!(SeqNo::new(1000) - SeqNo::new(1005), -5);
    }

    #[test]
    fn offset_across_wrap() {
        let near_max = SeqNo::new(0x7FFF_FFFE);
        let wrapped = near_max + 7;
        assert_eq!(wrapped.raw(), 5);
        assert_eq!(wrapped - near_max, 7);
        assert_eq!(near_max - wrapped, -7);
    }

    #[test]
    fn add_negative_steps_back() {
        assert_eq!((SeqNo::new(3) + -5).raw(), 0x7FFF_FFFE);
    }

    #[test]
    fn next_wraps() {
        assert_eq!(SeqNo::MAX.next().raw(), 0);
        assert_eq!(SeqNo::new(41).next().raw(), 42);
    }

    #[test]
    fn msgno_classes() {
        assert!(!MsgNo::NONE.is_data());
        assert!(!MsgNo::CONTROL.is_data());
        assert!(MsgNo::new(1).is_data());
    }
}
