//! Node identifier, storage key, and the XOR distance metric.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The size of node ids and storage keys in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node ids in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// A 160-bit node id or lookup target.
///
/// Ordering compares ids as big-endian unsigned integers, so ordering the
/// results of [Id::xor] against a target orders nodes by distance to it.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The all-zero id, the lower bound of the id space.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    /// Generates a uniformly random id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();

        Id(rng.gen())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Bitwise XOR of two ids; the result ordered as a big-endian unsigned
    /// integer is the Kademlia distance.
    pub fn xor(&self, other: &Id) -> Id {
        let mut distance = [0; ID_SIZE];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(distance)
    }

    /// Number of leading bits this id shares with `other`.
    pub fn common_prefix_bits(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Returns the bit at `index`, where bit 0 is the most significant.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut bytes = self.0;
        let mask = 0x80 >> (index % 8);

        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }

        Id(bytes)
    }

    /// Random id that keeps the first `prefix` bits of `self` and randomizes
    /// the rest. Used to probe a bucket's range during table maintenance.
    pub fn random_under_prefix(&self, prefix: usize) -> Id {
        let mut rng = rand::thread_rng();
        let mut bytes: [u8; ID_SIZE] = rng.gen();

        let whole = prefix / 8;
        bytes[..whole].clone_from_slice(&self.0[..whole]);

        let rest = prefix % 8;
        if rest > 0 {
            let mask: u8 = 0xff << (8 - rest);
            bytes[whole] = (self.0[whole] & mask) | (bytes[whole] & !mask);
        }

        Id(bytes)
    }

    /// `true` if `self` is strictly closer to `target` than `other` is.
    pub fn closer_to(&self, target: &Id, other: &Id) -> bool {
        self.xor(target) < other.xor(target)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdSize(i))?;
        }

        Ok(Id(bytes))
    }
}
