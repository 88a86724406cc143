//! Part payload codec.
//!
//! Every part travels in a buffer exactly as large as the substrate's
//! payload capacity:
//!
//! ```text
//! [partNum: u16 LE][part bytes ... up to capacity]
//! ```
//!
//! The part area is always the full remaining capacity. Short parts are
//! zero-padded; the receiver trims using the file size from the handshake.

use crate::ProtocolError;

/// Size of the part number header.
pub const PART_NUM_LEN: usize = 2;

/// A single encoded part backed by a fixed-capacity buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMessage {
    data: Vec<u8>,
}

impl PartMessage {
    /// Allocates a zero-filled message of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, ProtocolError> {
        if capacity < PART_NUM_LEN {
            return Err(ProtocolError::PayloadTooSmall(capacity));
        }
        Ok(Self {
            data: vec![0; capacity],
        })
    }

    /// Wraps a received payload.
    pub fn unmarshal(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < PART_NUM_LEN {
            return Err(ProtocolError::PayloadTooSmall(payload.len()));
        }
        Ok(Self {
            data: payload.to_vec(),
        })
    }

    /// Returns the full buffer, header included.
    pub fn marshal(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn part_num(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    pub fn set_part_num(&mut self, part_num: u16) {
        self.data[..PART_NUM_LEN].copy_from_slice(&part_num.to_le_bytes());
    }

    /// Returns the part area, padding included.
    pub fn part(&self) -> &[u8] {
        &self.data[PART_NUM_LEN..]
    }

    /// Copies `part` into the start of the part area.
    ///
    /// # Panics
    ///
    /// Panics if `part` is longer than [`part_size`](Self::part_size).
    pub fn set_part(&mut self, part: &[u8]) {
        let size = self.part_size();
        assert!(
            part.len() <= size,
            "part of {} bytes exceeds part capacity of {size}",
            part.len()
        );
        self.data[PART_NUM_LEN..PART_NUM_LEN + part.len()].copy_from_slice(part);
    }

    /// Bytes available for part data.
    pub fn part_size(&self) -> usize {
        self.data.len() - PART_NUM_LEN
    }
}

/// Number of fingerprints budgeted for a transfer.
///
/// `floor(num_parts * (1 + retry))`, saturating at `u16::MAX`. Negative
/// retry factors are treated as zero so the budget never drops below the
/// part count.
pub fn num_fingerprints(num_parts: u16, retry: f32) -> u16 {
    let retry = retry.max(0.0) as f64;
    let budget = (num_parts as f64 * (1.0 + retry)).floor();
    if budget >= u16::MAX as f64 {
        u16::MAX
    } else {
        budget as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_tiny_capacity() {
        assert!(matches!(
            PartMessage::new(1),
            Err(ProtocolError::PayloadTooSmall(1))
        ));
        assert!(PartMessage::new(2).is_ok());
    }

    #[test]
    fn unmarshal_rejects_tiny_payload() {
        assert!(PartMessage::unmarshal(&[0x01]).is_err());
    }

    #[test]
    fn header_is_little_endian() {
        let mut msg = PartMessage::new(8).unwrap();
        msg.set_part_num(0x0102);
        assert_eq!(&msg.marshal()[..2], &[0x02, 0x01]);
        assert_eq!(msg.part_num(), 0x0102);
    }

    #[test]
    fn short_part_is_zero_padded() {
        let mut msg = PartMessage::new(8).unwrap();
        msg.set_part_num(5);
        msg.set_part(b"abc");

        let decoded = PartMessage::unmarshal(msg.marshal()).unwrap();
        assert_eq!(decoded.part_num(), 5);
        assert_eq!(decoded.part(), b"abc\0\0\0");
        assert_eq!(decoded.part_size(), 6);
    }

    #[test]
    #[should_panic(expected = "exceeds part capacity")]
    fn oversized_part_panics() {
        let mut msg = PartMessage::new(4).unwrap();
        msg.set_part(b"abc");
    }

    #[test]
    fn fingerprint_budget() {
        assert_eq!(num_fingerprints(10, 0.0), 10);
        assert_eq!(num_fingerprints(10, 0.5), 15);
        assert_eq!(num_fingerprints(3, 0.5), 4);
        assert_eq!(num_fingerprints(10, -1.0), 10);
        assert_eq!(num_fingerprints(60_000, 1.0), u16::MAX);
    }
}
