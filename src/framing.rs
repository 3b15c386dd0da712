//! Ring data model: framing constants and the wrap/pad arithmetic from
//! spec.md §3 (Data Model) and §4.2 (wrap policy).
//!
//! A message physically occupies `HEADER_LEN + payload.len() + FOOTER_LEN`
//! bytes on the wire (the part a sender actually writes) but reserves
//! `FRAME_OVERHEAD + payload.len()` bytes of cursor space (`FRAME_OVERHEAD`
//! = `HEADER_LEN + FOOTER_LEN + TRAILER_LEN`): a fixed 4-byte trailer after
//! the footer is never written explicitly (it relies on the receiver having
//! already zeroed it, per invariant I2/I3) but is still accounted for when
//! advancing `writePos`/`readPos`, so that the footer of message *n* is
//! never mistaken for the header of message *n+1* when a length happens to
//! leave the footer unaligned.

/// Length of the little-endian length header, in bytes.
pub const HEADER_LEN: u64 = 4;
/// Length of the little-endian validity footer, in bytes.
pub const FOOTER_LEN: u64 = 4;
/// Trailing cursor-space reservation after the footer (never written
/// explicitly; relies on the invariant that it is already zero).
pub const TRAILER_LEN: u64 = 4;
/// Total cursor-space overhead of one message, independent of payload size.
pub const FRAME_OVERHEAD: u64 = HEADER_LEN + FOOTER_LEN + TRAILER_LEN;

/// Default XOR mask applied to a message's length to produce its footer.
pub const DEFAULT_VALIDITY_MASK: u32 = 0xDEAD_BEEF;

/// Sentinel header value marking an explicit wrap-padding tail.
///
/// The tail-size threshold in [`is_wrap_padding`] only catches a tail too
/// small to even hold a header (`< FRAME_OVERHEAD`); a tail that can hold
/// a header but not the message that was actually skipped there (any tail
/// in `[FRAME_OVERHEAD, FRAME_OVERHEAD + length)`) would otherwise read as
/// plain zero and be mistaken for "no message yet" rather than padding.
/// The sender writes this value explicitly whenever the tail has room for
/// at least 4 bytes; no real message length can ever equal it, since
/// [`crate::recv::ReceivePath`] rejects any length exceeding a ring's
/// capacity long before it could reach `u32::MAX`.
pub const WRAP_MARKER: u32 = u32::MAX;

/// Footer value for a message of the given length under `mask`.
///
/// Guaranteed non-zero for any well-formed non-empty message: `length` is
/// at least 1 and `mask` is required to be nonzero, so their XOR can only be
/// zero if `length == mask`, which callers must avoid by picking a mask
/// larger than any ring they will ever build (capacities are realistically
/// far below `u32::MAX`).
pub fn footer_value(length: u32, mask: u32) -> u32 {
    length ^ mask
}

/// Total cursor-space bytes a message of `payload_len` bytes consumes,
/// independent of any wrap padding.
pub fn counter_space(payload_len: usize) -> u64 {
    FRAME_OVERHEAD + payload_len as u64
}

/// Physical bytes a sender writes for a message of `payload_len` bytes:
/// header + payload + footer (the trailer is not written).
pub fn wire_len(payload_len: usize) -> u64 {
    HEADER_LEN + payload_len as u64 + FOOTER_LEN
}

/// Where the wrap policy (spec.md §4.2) would land a message of
/// `payload_len` bytes if the producer is currently at `write_pos` in a ring
/// of `capacity` bytes (a power of two).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// The message fits without crossing the physical end of the ring.
    Fits {
        /// Cursor position the message's header will be written at.
        write_pos: u64,
    },
    /// The tail of the ring is reserved as padding; the message itself
    /// starts at the next wrap boundary.
    Wraps {
        /// Cursor position the message's header will be written at, after
        /// skipping the padded tail.
        write_pos: u64,
        /// Bytes of cursor space consumed by the skipped tail.
        pad_bytes: u64,
    },
}

impl WritePlan {
    /// The cursor position the message's header lands at.
    pub fn write_pos(&self) -> u64 {
        match *self {
            WritePlan::Fits { write_pos } => write_pos,
            WritePlan::Wraps { write_pos, .. } => write_pos,
        }
    }

    /// Total cursor-space bytes this plan consumes, including any skipped
    /// padding: what `writePos`/`readPos` must advance by once the message
    /// is fully handled.
    pub fn total_span(&self, payload_len: usize) -> u64 {
        let pad = match *self {
            WritePlan::Fits { .. } => 0,
            WritePlan::Wraps { pad_bytes, .. } => pad_bytes,
        };
        pad + counter_space(payload_len)
    }
}

/// Plan where a message of `payload_len` bytes would land, per spec.md
/// §4.2's wrap policy: if the tail segment can't hold the full `12 +
/// length` of cursor space, treat that tail as padding and start the
/// message at the next wrap boundary.
pub fn plan_write(write_pos: u64, capacity: u64, payload_len: usize) -> WritePlan {
    debug_assert!(capacity.is_power_of_two());
    let mask = capacity - 1;
    let phys = write_pos & mask;
    let needed = counter_space(payload_len);
    if phys + needed <= capacity {
        WritePlan::Fits { write_pos }
    } else {
        let pad_bytes = capacity - phys;
        WritePlan::Wraps {
            write_pos: write_pos + pad_bytes,
            pad_bytes,
        }
    }
}

/// Whether a zero header observed at `read_pos` is genuinely "no data yet"
/// or the wrap-padding marker described in spec.md §4.2/§4.3: the receiver
/// can only be looking at padding if there isn't room left in the ring's
/// physical tail for even an empty frame's fixed overhead.
pub fn is_wrap_padding(read_pos: u64, capacity: u64) -> bool {
    debug_assert!(capacity.is_power_of_two());
    let mask = capacity - 1;
    let phys = read_pos & mask;
    phys + FRAME_OVERHEAD > capacity
}

/// Cursor position after skipping wrap padding found at `read_pos`.
pub fn skip_wrap_padding(read_pos: u64, capacity: u64) -> u64 {
    debug_assert!(capacity.is_power_of_two());
    let mask = capacity - 1;
    let phys = read_pos & mask;
    read_pos + (capacity - phys)
}

/// A contiguous byte view over one endpoint's own registered ring memory,
/// used by the receive path to inspect and mutate its own ring directly
/// (spec.md §4.3: "the receiver reads its own registered memory directly").
pub struct RingView<'a> {
    mem: &'a mut [u8],
    capacity: u64,
}

impl<'a> RingView<'a> {
    /// Wrap a registered memory region of `mem.len()` bytes, which must be
    /// a power of two.
    pub fn new(mem: &'a mut [u8]) -> Self {
        let capacity = mem.len() as u64;
        debug_assert!(capacity.is_power_of_two());
        Self { mem, capacity }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn offset(&self, pos: u64) -> usize {
        (pos & (self.capacity - 1)) as usize
    }

    /// Read a little-endian `u32` at cursor position `pos`. The 4 bytes are
    /// guaranteed contiguous: wrap planning never lets a header or footer
    /// straddle the physical end of the ring.
    pub fn read_u32(&self, pos: u64) -> u32 {
        let off = self.offset(pos);
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.mem[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    /// Copy `len` payload bytes starting at cursor position `pos` into
    /// `dst`.
    pub fn copy_out(&self, pos: u64, dst: &mut [u8], len: usize) {
        let off = self.offset(pos);
        dst[..len].copy_from_slice(&self.mem[off..off + len]);
    }

    /// Zero `len` bytes of cursor space starting at `pos`, satisfying
    /// invariant I3. The range may itself wrap the physical buffer (it is
    /// cursor space, not necessarily one contiguous frame) since it covers
    /// a message's header+payload+footer+trailer which, after wrap
    /// planning, never straddles the end of the ring, but a caller zeroing
    /// skipped padding plus the message in one call legitimately spans the
    /// boundary.
    pub fn zero_range(&mut self, pos: u64, len: u64) {
        let mut remaining = len;
        let mut cursor = pos;
        while remaining > 0 {
            let off = self.offset(cursor);
            let chunk = remaining.min(self.capacity - off as u64);
            self.mem[off..off + chunk as usize].fill(0);
            cursor += chunk;
            remaining -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_xors_length() {
        assert_eq!(footer_value(5, 0xDEAD_BEEF), 5 ^ 0xDEAD_BEEF);
        assert_ne!(footer_value(5, 0xDEAD_BEEF), 0);
    }

    #[test]
    fn plan_fits_when_room_remains() {
        let plan = plan_write(0, 64, 20);
        assert_eq!(plan, WritePlan::Fits { write_pos: 0 });
        assert_eq!(plan.total_span(20), 32);
    }

    #[test]
    fn plan_wraps_at_tail() {
        // capacity 64, two 20-byte messages consume 2*32=64 exactly,
        // landing the third message's write_pos at 64 (mod 64 == 0): fits.
        let plan = plan_write(64, 64, 20);
        assert_eq!(plan, WritePlan::Fits { write_pos: 64 });

        // A write_pos that leaves less than 32 bytes in the tail pads to
        // the boundary instead of splitting the frame.
        let plan = plan_write(50, 64, 20);
        match plan {
            WritePlan::Wraps {
                write_pos,
                pad_bytes,
            } => {
                assert_eq!(write_pos, 64);
                assert_eq!(pad_bytes, 14);
            }
            _ => panic!("expected a wrap"),
        }
    }

    #[test]
    fn wrap_padding_detection_matches_plan() {
        assert!(is_wrap_padding(61, 64)); // 3 bytes left, can't hold 12
        assert!(!is_wrap_padding(40, 64)); // 24 bytes left, plenty
        assert_eq!(skip_wrap_padding(61, 64), 64);
    }

    #[test]
    fn ring_view_roundtrip() {
        let mut mem = vec![0u8; 64];
        {
            let mut view = RingView::new(&mut mem);
            view.mem[0..4].copy_from_slice(&20u32.to_le_bytes());
            assert_eq!(view.read_u32(0), 20);
            view.copy_out(0, &mut [0u8; 4], 4);
            view.zero_range(0, 4);
            assert_eq!(view.read_u32(0), 0);
        }
    }
}
