//! Compact encoding of acknowledged sequence numbers.
//!
//! All values are big-endian i32 (so the flag bit lives in the first byte on the wire).
//!
//! ```ascii
//! single form: a lone degenerate range [s,s] is written as 4 bytes, high bit clear
//!   0: s (u32 BE, bit 31 = 0)
//!
//! series form: any other list of up to 127 ranges
//!   0: 0x80 | count (u8)
//!   1: per range, either
//!        s (u32 BE, bit 31 = 0)                   for a degenerate range [s,s]
//!        start | 0x8000_0000, end (2 x u32 BE)    for a true range [start,end]
//! ```
//!
//! A decoder distinguishes the forms by the high bit of the first byte.

use bytes::BufMut;
use crate::error::WireError;
use crate::sequence::{next_seq, seq_distance};
use crate::util::buf_ext::BufExt;

/// maximum number of ranges in a series
pub const MAX_ACKS: usize = 127;

const SERIES_FLAG: u8 = 0x80;
const RANGE_FLAG: u32 = 0x8000_0000;

/// An inclusive range of acknowledged sequence numbers. `start == end` for a single sequence
///  number. A range may wrap from `i32::MAX` to 0, in which case `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub start: i32,
    pub end: i32,
}

impl Ack {
    pub fn single(seq: i32) -> Ack {
        Ack { start: seq, end: seq }
    }

    pub fn range(start: i32, end: i32) -> Ack {
        Ack { start, end }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, seq: i32) -> bool {
        if self.start <= self.end {
            self.start <= seq && seq <= self.end
        }
        else {
            seq >= self.start || seq <= self.end
        }
    }

    /// number of sequence numbers in this range
    pub fn len(&self) -> u64 {
        seq_distance(self.start, self.end) as u64 + 1
    }

    /// all sequence numbers in this range, in ascending (wrapping) order
    pub fn iter(&self) -> impl Iterator<Item = i32> {
        let start = self.start;
        let len = self.len();
        std::iter::successors(Some(start), |seq| Some(next_seq(*seq)))
            .take(len as usize)
    }
}

/// Number of bytes `encode_acks` writes for these acks
pub fn encoded_len(acks: &[Ack]) -> Result<usize, WireError> {
    match acks {
        [] => Ok(0),
        [ack] if ack.is_single() => Ok(4),
        _ if acks.len() > MAX_ACKS => Err(WireError::TooManyAcks(acks.len())),
        _ => Ok(1 + acks.iter()
            .map(|a| if a.is_single() { 4 } else { 8 })
            .sum::<usize>()),
    }
}

/// Writes the acks to the start of `out`, returning the number of bytes written. An empty list
///  is written as nothing.
pub fn encode_acks(acks: &[Ack], out: &mut [u8]) -> Result<usize, WireError> {
    let needed = encoded_len(acks)?;
    if out.len() < needed {
        return Err(WireError::ShortBuffer { needed, available: out.len() });
    }
    for ack in acks {
        if ack.start < 0 || ack.end < 0 {
            return Err(WireError::Encoding(format!("ack {:?} contains a negative sequence number", ack)));
        }
    }

    let mut buf = &mut out[..needed];
    match acks {
        [] => {}
        [ack] if ack.is_single() => buf.put_u32(ack.start as u32),
        _ => {
            buf.put_u8(SERIES_FLAG | acks.len() as u8);
            for ack in acks {
                if ack.is_single() {
                    buf.put_u32(ack.start as u32);
                }
                else {
                    buf.put_u32(ack.start as u32 | RANGE_FLAG);
                    buf.put_u32(ack.end as u32);
                }
            }
        }
    }
    Ok(needed)
}

/// Reads acks from the start of `data`, returning them together with the number of bytes
///  consumed
pub fn decode_acks(data: &[u8]) -> Result<(Vec<Ack>, usize), WireError> {
    if data.len() < 4 {
        return Err(WireError::ShortBuffer { needed: 4, available: data.len() });
    }

    let mut buf = data;
    if data[0] & SERIES_FLAG == 0 {
        let seq = buf.get_u32_checked()? as i32;
        return Ok((vec![Ack::single(seq)], 4));
    }

    let count = (buf.get_u8_checked()? & !SERIES_FLAG) as usize;
    let mut acks = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = buf.get_u32_checked()?;
        if raw & RANGE_FLAG == 0 {
            acks.push(Ack::single(raw as i32));
        }
        else {
            let start = (raw & !RANGE_FLAG) as i32;
            let end = buf.get_u32_checked()?;
            if end & RANGE_FLAG != 0 {
                return Err(WireError::Decoding(format!("range end {:#x} has the range flag set", end)));
            }
            acks.push(Ack::range(start, end as i32));
        }
    }
    Ok((acks, data.len() - buf.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    #[rstest]
    #[case::single(vec![Ack::single(5)], vec![0,0,0,5])]
    #[case::single_large(vec![Ack::single(0x0102_0304)], vec![1,2,3,4])]
    #[case::single_max(vec![Ack::single(i32::MAX)], vec![0x7f,0xff,0xff,0xff])]
    #[case::single_range(vec![Ack::range(1, 3)], vec![0x81, 0x80,0,0,1, 0,0,0,3])]
    #[case::two_singles(vec![Ack::single(1), Ack::single(9)], vec![0x82, 0,0,0,1, 0,0,0,9])]
    #[case::mixed(vec![Ack::single(1), Ack::range(3, 4), Ack::single(7)], vec![0x83, 0,0,0,1, 0x80,0,0,3, 0,0,0,4, 0,0,0,7])]
    fn test_encode_decode(#[case] acks: Vec<Ack>, #[case] expected: Vec<u8>) {
        let mut buf = vec![0u8; 64];
        let n = encode_acks(&acks, &mut buf).unwrap();
        assert_eq!(&buf[..n], expected.as_slice());
        assert_eq!(encoded_len(&acks), Ok(n));

        let (decoded, consumed) = decode_acks(&buf[..n]).unwrap();
        assert_eq!(decoded, acks);
        assert_eq!(consumed, n);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let (acks, consumed) = decode_acks(&[0,0,0,7, 0xaa, 0xbb]).unwrap();
        assert_eq!(acks, vec![Ack::single(7)]);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_empty_encodes_as_nothing() {
        let mut buf = [0u8; 4];
        assert_eq!(encode_acks(&[], &mut buf), Ok(0));
    }

    #[test]
    fn test_max_series() {
        let acks = (0..MAX_ACKS as i32).map(|i| Ack::single(2 * i)).collect::<Vec<_>>();
        let mut buf = vec![0u8; 1024];
        let n = encode_acks(&acks, &mut buf).unwrap();
        assert_eq!(n, 1 + 4 * MAX_ACKS);
        assert_eq!(buf[0], 0xff);
        assert_eq!(decode_acks(&buf[..n]).unwrap().0, acks);
    }

    #[rstest]
    #[case::seed_1(1)]
    #[case::seed_2(2)]
    #[case::seed_3(3)]
    fn test_random_acks_survive_encoding(#[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; 1 + 8 * MAX_ACKS];
        for _ in 0..1_000 {
            let count = rng.gen_range(1..=MAX_ACKS);
            let mut next = rng.gen_range(0..i32::MAX - 2_000 * MAX_ACKS as i32);
            let acks = (0..count)
                .map(|_| {
                    let start = next + rng.gen_range(0..1_000);
                    let end = if rng.gen_bool(0.5) { start } else { start + rng.gen_range(1..1_000) };
                    next = end + 1;
                    Ack::range(start, end)
                })
                .collect::<Vec<_>>();

            let n = encode_acks(&acks, &mut buf).unwrap();
            assert_eq!(encoded_len(&acks), Ok(n));
            if count == 1 && acks[0].is_single() {
                assert_eq!(buf[0] & SERIES_FLAG, 0);
            }
            else {
                assert_eq!(buf[0], SERIES_FLAG | count as u8);
            }

            let (decoded, consumed) = decode_acks(&buf[..n]).unwrap();
            assert_eq!(decoded, acks);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_too_many_acks() {
        let acks = (0..=MAX_ACKS as i32).map(Ack::single).collect::<Vec<_>>();
        let mut buf = vec![0u8; 1024];
        assert_eq!(encode_acks(&acks, &mut buf), Err(WireError::TooManyAcks(128)));
    }

    #[rstest]
    #[case::single(vec![Ack::single(1)], 3)]
    #[case::series(vec![Ack::single(1), Ack::range(2, 5)], 12)]
    fn test_encode_short_buffer(#[case] acks: Vec<Ack>, #[case] buf_len: usize) {
        let mut buf = vec![0u8; buf_len];
        assert!(matches!(encode_acks(&acks, &mut buf), Err(WireError::ShortBuffer { .. })));
    }

    #[test]
    fn test_encode_negative() {
        let mut buf = [0u8; 4];
        assert!(matches!(encode_acks(&[Ack::single(-1)], &mut buf), Err(WireError::Encoding(_))));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::three_bytes(vec![0,0,1])]
    #[case::series_truncated(vec![0x82, 0,0,0,1, 0,0])]
    #[case::range_end_missing(vec![0x81, 0x80,0,0,1])]
    fn test_decode_short(#[case] data: Vec<u8>) {
        assert!(matches!(decode_acks(&data), Err(WireError::ShortBuffer { .. })));
    }

    #[test]
    fn test_decode_flagged_range_end() {
        assert!(matches!(decode_acks(&[0x81, 0x80,0,0,1, 0x80,0,0,2]), Err(WireError::Decoding(_))));
    }

    #[rstest]
    #[case::single(Ack::single(4), vec![4])]
    #[case::range(Ack::range(4, 6), vec![4, 5, 6])]
    #[case::wrapping(Ack::range(i32::MAX - 1, 1), vec![i32::MAX - 1, i32::MAX, 0, 1])]
    fn test_iter_and_contains(#[case] ack: Ack, #[case] expected: Vec<i32>) {
        assert_eq!(ack.iter().collect::<Vec<_>>(), expected);
        assert_eq!(ack.len(), expected.len() as u64);
        for seq in expected {
            assert!(ack.contains(seq));
        }
        assert!(!ack.contains(3));
        assert!(!ack.contains(7));
    }
}
