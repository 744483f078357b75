use super::error::DhtError;
use crate::constants::{ID_BITS, ID_LEN};
use bytes::Bytes;
use rand::Rng as _;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, BitXor, Shr};

/// An unsigned integer naming a node or a stored item.
///
/// Identifiers are 160 bits on the wire, but bucket arithmetic needs the
/// exclusive upper bound `2^160`, so the type holds an unsigned integer of any
/// length. The big-endian bytes are stored without leading zeros, which makes
/// equal values compare and hash equal regardless of how they were built.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Id(Bytes);

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Left-pads `bytes` with zeros to `width`. `width` must not be shorter than `bytes`.
fn pad(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    out[width - bytes.len()..].copy_from_slice(bytes);
    out
}

impl Id {
    pub fn zero() -> Self {
        Id(Bytes::new())
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Id(Bytes::copy_from_slice(trim(bytes)))
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut be = bytes.to_vec();
        be.reverse();
        Self::from_be_bytes(&be)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }

    /// Parses a 20-byte identifier as found in KRPC messages.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        Ok(Self::from_be_bytes(bytes))
    }

    /// `2^bits`.
    pub fn pow2(bits: u32) -> Self {
        let mut bytes = vec![0u8; bits as usize / 8 + 1];
        bytes[0] = 1 << (bits % 8);
        Id(Bytes::from(bytes))
    }

    /// Exclusive upper bound of the identifier space, `2^160`.
    pub fn end() -> Self {
        Self::pow2(ID_BITS)
    }

    /// A uniformly random 160-bit identifier.
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id[..]);
        Self::from_be_bytes(&id)
    }

    /// A random identifier in `[min, max)`, or `None` if the range is empty.
    ///
    /// The leading byte is drawn modulo the leading byte of the range width and
    /// a single subtraction folds the result back into range. This is cheap
    /// but not uniform: values in the lower part of the range are up to twice
    /// as likely. Identifiers picked here only steer refresh lookups.
    pub fn random_in_range(min: &Id, max: &Id) -> Option<Id> {
        let width = max.checked_sub(min).filter(|w| !w.is_zero())?;
        let w = width.as_bytes();

        let mut raw = vec![0u8; w.len()];
        rand::rng().fill(&mut raw[..]);
        raw[0] = (u16::from(raw[0]) % (u16::from(w[0]) + 1)) as u8;

        let mut offset = Id::from_be_bytes(&raw);
        if offset >= width {
            offset = offset.checked_sub(&width)?;
        }
        Some(min + &offset)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// Minimal big-endian representation (empty for zero).
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> u32 {
        match self.0.first() {
            None => 0,
            Some(&top) => (self.0.len() as u32 - 1) * 8 + (8 - top.leading_zeros()),
        }
    }

    /// Fixed-width big-endian encoding, `None` if the value needs more than `width` bytes.
    pub fn to_be_bytes(&self, width: usize) -> Option<Vec<u8>> {
        (self.0.len() <= width).then(|| pad(&self.0, width))
    }

    /// Fixed-width little-endian encoding, `None` if the value needs more than `width` bytes.
    pub fn to_le_bytes(&self, width: usize) -> Option<Vec<u8>> {
        let mut bytes = self.to_be_bytes(width)?;
        bytes.reverse();
        Some(bytes)
    }

    /// The 20-byte wire form.
    pub fn to_wire(&self) -> Result<[u8; ID_LEN], DhtError> {
        if self.0.len() > ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut out = [0u8; ID_LEN];
        out[ID_LEN - self.0.len()..].copy_from_slice(&self.0);
        Ok(out)
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &Id) -> Id {
        let width = self.0.len().max(other.0.len());
        let a = pad(&self.0, width);
        let b = pad(&other.0, width);
        let xored: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
        Id::from_be_bytes(&xored)
    }

    /// `self - other`, or `None` if the result would be negative.
    pub fn checked_sub(&self, other: &Id) -> Option<Id> {
        if *self < *other {
            return None;
        }

        let a = &self.0;
        let b = pad(&other.0, a.len());
        let mut out = vec![0u8; a.len()];
        let mut borrow = 0i16;
        for i in (0..a.len()).rev() {
            let mut diff = i16::from(a[i]) - i16::from(b[i]) - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            }
            out[i] = diff as u8;
        }
        Some(Id::from_be_bytes(&out))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.as_ref().cmp(other.0.as_ref()))
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<&Id> for &Id {
    type Output = Id;

    fn add(self, other: &Id) -> Id {
        let width = self.0.len().max(other.0.len()) + 1;
        let a = pad(&self.0, width);
        let b = pad(&other.0, width);
        let mut out = vec![0u8; width];
        let mut carry = 0u16;
        for i in (0..width).rev() {
            let sum = u16::from(a[i]) + u16::from(b[i]) + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Id::from_be_bytes(&out)
    }
}

impl Shr<u32> for &Id {
    type Output = Id;

    fn shr(self, bits: u32) -> Id {
        let byte_shift = (bits / 8) as usize;
        let bit_shift = bits % 8;
        if byte_shift >= self.0.len() {
            return Id::zero();
        }

        let src = &self.0[..self.0.len() - byte_shift];
        let mut out = vec![0u8; src.len()];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = src[i] >> bit_shift;
            if bit_shift > 0 && i > 0 {
                *byte |= src[i - 1] << (8 - bit_shift);
            }
        }
        Id::from_be_bytes(&out)
    }
}

impl BitXor<&Id> for &Id {
    type Output = Id;

    fn bitxor(self, other: &Id) -> Id {
        self.distance(other)
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Id::from_be_bytes(&bytes)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = pad(&self.0, self.0.len().max(ID_LEN));
        write!(f, "Id({:02x}{:02x}..)", head[0], head[1])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in pad(&self.0, self.0.len().max(ID_LEN)) {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
