//! Wire framing: the fixed 12-byte packet header, one-hot flag codes, and
//! the BOP payload layout. All multi-byte fields are big-endian.
//!
//! A small owned struct plus free `encode`/`decode` functions, rather than
//! a `serde`-derived wire format, since the layout is fixed and tiny.

use crate::error::WireError;

/// Size of the fixed packet header, in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest packet RMTP will put on the wire (header + payload).
pub const MAX_PACKET_LEN: usize = 1460;

/// Largest payload that fits after the header in one packet.
pub const DATA_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

/// Largest BOP metadata blob: `DATA_LEN` minus the 6-byte
/// `prodsize ‖ metasize` prefix that precedes it in a BOP payload.
pub const META_MAX: usize = DATA_LEN - 6;

/// Packet kind. Exactly one bit is set per code; receivers must use
/// equality comparison against these values, never a bitmask test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Flags {
    Bop = 0x0001,
    Eop = 0x0002,
    MemData = 0x0004,
    RetxReq = 0x0008,
    RetxRej = 0x0010,
    RetxEnd = 0x0020,
    RetxData = 0x0040,
    BopReq = 0x0080,
    RetxBop = 0x0100,
    RetxEop = 0x0200,
    EopReq = 0x0400,
}

impl Flags {
    /// Recovers a `Flags` value from its wire representation, or `None` if
    /// the value does not correspond to a known one-hot code. Datagrams/
    /// frames bearing an unknown `flags` value are silently dropped rather
    /// than treated as an error.
    pub fn from_u16(v: u16) -> Option<Flags> {
        use Flags::*;
        match v {
            0x0001 => Some(Bop),
            0x0002 => Some(Eop),
            0x0004 => Some(MemData),
            0x0008 => Some(RetxReq),
            0x0010 => Some(RetxRej),
            0x0020 => Some(RetxEnd),
            0x0040 => Some(RetxData),
            0x0080 => Some(BopReq),
            0x0100 => Some(RetxBop),
            0x0200 => Some(RetxEop),
            0x0400 => Some(EopReq),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// True for flags whose payload length is validated against the
    /// product size rather than against an exact expected length (only
    /// `MemData`/`RetxData` carry a variable-length payload).
    #[inline]
    pub fn is_data_bearing(self) -> bool {
        matches!(self, Flags::MemData | Flags::RetxData)
    }
}

/// The fixed 12-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub prodindex: u32,
    /// Byte offset within the product for data packets; 0 otherwise.
    pub seqnum: u32,
    pub payloadlen: u16,
    pub flags: Flags,
}

impl Header {
    pub fn new(prodindex: u32, seqnum: u32, payloadlen: u16, flags: Flags) -> Header {
        Header { prodindex, seqnum, payloadlen, flags }
    }
}

/// Encodes `h` into the first [`HEADER_LEN`] bytes of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than [`HEADER_LEN`] — callers always size
/// their scratch buffers to at least `HEADER_LEN + DATA_LEN`, so this is a
/// programming-error guard, not a runtime condition.
pub fn encode_header(buf: &mut [u8], h: &Header) {
    assert!(buf.len() >= HEADER_LEN, "header buffer too small");
    buf[0..4].copy_from_slice(&h.prodindex.to_be_bytes());
    buf[4..8].copy_from_slice(&h.seqnum.to_be_bytes());
    buf[8..10].copy_from_slice(&h.payloadlen.to_be_bytes());
    buf[10..12].copy_from_slice(&h.flags.as_u16().to_be_bytes());
}

/// Decodes a header from `buf`. Does not validate `payloadlen` against any
/// actual payload present in `buf` — callers with a full datagram/frame in
/// hand should follow up with [`validate_payload_len`].
///
/// Returns `Err(WireError::TooShort)` if `buf` is shorter than
/// [`HEADER_LEN`], and `Ok(None)` (not an error) if the flags field does
/// not match any known one-hot code — such datagrams/frames are silently
/// dropped rather than treated as an error.
pub fn decode_header(buf: &[u8]) -> Result<Option<Header>, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::TooShort { len: buf.len(), min: HEADER_LEN });
    }
    let Some(flags) = Flags::from_u16(u16::from_be_bytes([buf[10], buf[11]])) else {
        return Ok(None);
    };
    Ok(Some(Header {
        prodindex: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        seqnum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        payloadlen: u16::from_be_bytes([buf[8], buf[9]]),
        flags,
    }))
}

/// Validates that a header's declared `payloadlen` matches the number of
/// payload bytes actually present (`actual`). Control packets other than
/// BOP/RETX_BOP must carry `payloadlen == 0`; data-bearing flags are left
/// to the caller to validate against `prodsize`.
pub fn validate_payload_len(h: &Header, actual: u16) -> Result<(), WireError> {
    if h.payloadlen != actual {
        return Err(WireError::PayloadLenMismatch { declared: h.payloadlen, actual });
    }
    Ok(())
}

/// Block index (0-based) of the block starting at byte offset `seqnum`.
#[inline]
pub fn block_index(seqnum: u32) -> u32 {
    seqnum / DATA_LEN as u32
}

/// Number of `DATA_LEN`-sized blocks needed for a product of `prodsize`
/// bytes. `0` for an empty product.
#[inline]
pub fn num_blocks(prodsize: u32) -> u32 {
    if prodsize == 0 {
        0
    } else {
        (prodsize as u64).div_ceil(DATA_LEN as u64) as u32
    }
}

/// Encodes a BOP (or RETX_BOP) payload: `prodsize (4B BE) ‖ metasize (2B
/// BE) ‖ metadata`.
///
/// # Panics
/// Panics if `metadata.len()` exceeds [`META_MAX`]; callers validate this
/// at the `send_product`/retransmit boundary and turn it into a proper
/// `EngineError::MetadataTooLarge` before ever reaching this function.
pub fn encode_bop_payload(prodsize: u32, metadata: &[u8]) -> Vec<u8> {
    assert!(metadata.len() <= META_MAX, "metadata exceeds META_MAX");
    let mut out = Vec::with_capacity(6 + metadata.len());
    out.extend_from_slice(&prodsize.to_be_bytes());
    out.extend_from_slice(&(metadata.len() as u16).to_be_bytes());
    out.extend_from_slice(metadata);
    out
}

/// Decoded BOP payload contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BopPayload {
    pub prodsize: u32,
    pub metadata: Vec<u8>,
}

/// Decodes a BOP/RETX_BOP payload, clamping an oversized declared
/// `metasize` to [`META_MAX`] rather than rejecting the frame.
pub fn decode_bop_payload(buf: &[u8]) -> Result<BopPayload, WireError> {
    if buf.len() < 6 {
        return Err(WireError::TooShort { len: buf.len(), min: 6 });
    }
    let prodsize = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let metasize = (u16::from_be_bytes([buf[4], buf[5]]) as usize).min(META_MAX);
    let available = buf.len() - 6;
    let metasize = metasize.min(available);
    Ok(BopPayload { prodsize, metadata: buf[6..6 + metasize].to_vec() })
}

/// Wrap-aware comparison of two `prodindex` values: `true` iff `a` is
/// strictly "after" `b` in the modulo-2³² sequence (interpret `a - b` as
/// signed 32-bit, never a raw `<`).
#[inline]
pub fn prodindex_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Enumerates every `prodindex` strictly between `low` and `high`
/// (exclusive of both), assuming `high` is [`prodindex_after`] `low`.
/// Used by the receiver to request `MISSING_BOP` for every product it
/// skipped over when a later product's datagram arrives first.
pub fn prodindexes_between(low: u32, high: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut idx = low.wrapping_add(1);
    while idx != high {
        out.push(idx);
        idx = idx.wrapping_add(1);
    }
    out
}

/// Chunks a (possibly multi-block) retransmission request into
/// `DATA_LEN`-aligned blocks: clamp the requested end to `prodlen`, align
/// the start down to a block boundary, then emit `DATA_LEN`-sized blocks
/// (the last may be shorter) until the cursor reaches the clamped end.
pub fn retransmit_chunks(seqnum: u32, payloadlen: u16, prodlen: u32) -> Vec<(u32, u16)> {
    let out = prodlen.min(seqnum.saturating_add(payloadlen as u32));
    let mut start = (seqnum / DATA_LEN as u32) * DATA_LEN as u32;
    let mut chunks = Vec::new();
    while start < out {
        let size = (out - start).min(DATA_LEN as u32) as u16;
        chunks.push((start, size));
        start += DATA_LEN as u32;
    }
    chunks
}

/// Chunks the byte range `[low, high)` into `DATA_LEN`-aligned blocks,
/// assuming `low` already falls on a block boundary (true of every
/// high-water mark this crate produces, since a partial final block never
/// has a successor). Used by the receiver to turn a detected gap between
/// its high-water mark and a newly arrived offset into `MISSING_DATA`
/// requests, without the `u16`-sized `payloadlen` ceiling
/// [`retransmit_chunks`] inherits from the wire format.
pub fn gap_chunks(low: u32, high: u32) -> Vec<(u32, u16)> {
    if high <= low {
        return Vec::new();
    }
    let mut start = (low / DATA_LEN as u32) * DATA_LEN as u32;
    let mut chunks = Vec::new();
    while start < high {
        let size = (high - start).min(DATA_LEN as u32) as u16;
        chunks.push((start, size));
        start += DATA_LEN as u32;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn header_round_trip_identity() {
        let mut rng = rand::thread_rng();
        let all_flags = [
            Flags::Bop, Flags::Eop, Flags::MemData, Flags::RetxReq, Flags::RetxRej,
            Flags::RetxEnd, Flags::RetxData, Flags::BopReq, Flags::RetxBop, Flags::RetxEop,
            Flags::EopReq,
        ];
        for _ in 0..200 {
            let h = Header::new(
                rng.gen(),
                rng.gen(),
                rng.gen(),
                all_flags[rng.gen_range(0..all_flags.len())],
            );
            let mut buf = [0u8; HEADER_LEN];
            encode_header(&mut buf, &h);
            let decoded = decode_header(&buf).unwrap().unwrap();
            assert_eq!(h, decoded);
        }
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; HEADER_LEN - 1];
        let err = decode_header(&buf).unwrap_err();
        assert_eq!(err, WireError::TooShort { len: HEADER_LEN - 1, min: HEADER_LEN });
    }

    #[test]
    fn decode_drops_unknown_flags_without_error() {
        let mut buf = [0u8; HEADER_LEN];
        buf[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        assert_eq!(decode_header(&buf).unwrap(), None);
    }

    #[test]
    fn payload_len_validation() {
        let h = Header::new(0, 0, 10, Flags::MemData);
        assert!(validate_payload_len(&h, 10).is_ok());
        let err = validate_payload_len(&h, 9).unwrap_err();
        assert_eq!(err, WireError::PayloadLenMismatch { declared: 10, actual: 9 });
    }

    #[test]
    fn num_blocks_boundaries() {
        assert_eq!(num_blocks(0), 0);
        assert_eq!(num_blocks(1), 1);
        assert_eq!(num_blocks(DATA_LEN as u32), 1);
        assert_eq!(num_blocks(DATA_LEN as u32 + 1), 2);
    }

    #[test]
    fn block_index_is_byte_offset_divided_by_data_len() {
        assert_eq!(block_index(0), 0);
        assert_eq!(block_index(DATA_LEN as u32), 1);
        assert_eq!(block_index(DATA_LEN as u32 - 1), 0);
    }

    #[test]
    fn bop_payload_round_trip() {
        let meta = b"hello product metadata";
        let encoded = encode_bop_payload(3000, meta);
        assert_eq!(encoded.len(), meta.len() + 6);
        let decoded = decode_bop_payload(&encoded).unwrap();
        assert_eq!(decoded.prodsize, 3000);
        assert_eq!(decoded.metadata, meta);
    }

    #[test]
    fn bop_payload_zero_metadata() {
        let encoded = encode_bop_payload(0, &[]);
        assert_eq!(encoded.len(), 6);
        let decoded = decode_bop_payload(&encoded).unwrap();
        assert_eq!(decoded.prodsize, 0);
        assert!(decoded.metadata.is_empty());
    }

    #[test]
    fn bop_payload_max_metadata() {
        let meta = vec![0xAB; META_MAX];
        let encoded = encode_bop_payload(u32::MAX, &meta);
        assert_eq!(encoded.len(), META_MAX + 6);
        let decoded = decode_bop_payload(&encoded).unwrap();
        assert_eq!(decoded.metadata.len(), META_MAX);
    }

    #[test]
    fn retransmit_chunks_single_aligned_block() {
        let chunks = retransmit_chunks(0, DATA_LEN as u16, 3000);
        assert_eq!(chunks, vec![(0, DATA_LEN as u16)]);
    }

    #[test]
    fn retransmit_chunks_spans_multiple_blocks() {
        // A request for the middle block of a 3000-byte product still
        // chunks out to the end of the product's last (partial) block
        // only if the requested payloadlen reaches that far; here it asks
        // for exactly one block.
        let chunks = retransmit_chunks(DATA_LEN as u32, DATA_LEN as u16, 3000);
        assert_eq!(chunks, vec![(DATA_LEN as u32, (3000 - DATA_LEN as u32) as u16)]);
    }

    #[test]
    fn retransmit_chunks_clamps_to_prodlen() {
        let chunks = retransmit_chunks(0, 10_000, 3000);
        assert_eq!(chunks, vec![(0, DATA_LEN as u16), (DATA_LEN as u32, (3000 - DATA_LEN as u32) as u16)]);
    }

    #[test]
    fn retransmit_chunks_unaligned_start_aligns_down() {
        // seqnum not on a block boundary still yields block-aligned chunks.
        let chunks = retransmit_chunks(10, 50, 3000);
        assert_eq!(chunks, vec![(0, DATA_LEN as u16)]);
    }

    #[test]
    fn prodindex_after_handles_wraparound() {
        assert!(prodindex_after(5, 3));
        assert!(!prodindex_after(3, 5));
        assert!(prodindex_after(0, u32::MAX));
        assert!(!prodindex_after(u32::MAX, 0));
    }

    #[test]
    fn prodindexes_between_enumerates_the_gap() {
        assert_eq!(prodindexes_between(3, 7), vec![4, 5, 6]);
        assert_eq!(prodindexes_between(3, 4), Vec::<u32>::new());
        assert_eq!(prodindexes_between(u32::MAX - 1, 1), vec![u32::MAX, 0]);
    }

    #[test]
    fn gap_chunks_empty_when_no_gap() {
        assert_eq!(gap_chunks(100, 100), Vec::new());
        assert_eq!(gap_chunks(100, 50), Vec::new());
    }

    #[test]
    fn gap_chunks_spans_multiple_blocks() {
        let chunks = gap_chunks(0, 2 * DATA_LEN as u32 + 10);
        assert_eq!(
            chunks,
            vec![(0, DATA_LEN as u16), (DATA_LEN as u32, DATA_LEN as u16), (2 * DATA_LEN as u32, 10)]
        );
    }

    #[test]
    fn bop_payload_clamps_oversized_declared_metasize() {
        // Declares a metasize larger than META_MAX; decoder clamps instead
        // of erroring, matching the BOP handler's documented behavior.
        let mut buf = vec![0u8; 6 + 10];
        buf[4..6].copy_from_slice(&((META_MAX + 500) as u16).to_be_bytes());
        buf[6..16].copy_from_slice(&[1; 10]);
        let decoded = decode_bop_payload(&buf).unwrap();
        assert_eq!(decoded.metadata.len(), 10);
    }
}
