//! Kademlia node Id or a lookup target
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target.
///
/// Bytes are big-endian, so comparing two Ids compares them as
/// unsigned 160-bit integers.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The smallest Id, `0`.
    pub const MIN: Id = Id([0; ID_SIZE]);
    /// The largest Id, `2^160 - 1`.
    pub const MAX: Id = Id([u8::MAX; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
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

    /// The SHA-1 digest of arbitrary bytes, used to map keys into the Id space.
    pub fn digest<T: AsRef<[u8]>>(bytes: T) -> Id {
        Id(sha1_smol::Sha1::from(bytes).digest().bytes())
    }

    /// XOR distance between this Id and `other`, as an Id.
    ///
    /// Comparing the results of two `xor` calls against the same target
    /// orders nodes by closeness to that target.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Number of leading bits this Id shares with `other`.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                return i * 8 + (a ^ b).leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// `(self + other) / 2`, without overflowing 160 bits.
    pub fn midpoint(&self, other: &Id) -> Id {
        let mut sum = [0_u8; ID_SIZE];
        let mut carry = 0_u16;

        for i in (0..ID_SIZE).rev() {
            let s = self.0[i] as u16 + other.0[i] as u16 + carry;
            sum[i] = s as u8;
            carry = s >> 8;
        }

        // Shift the 161 bit sum right by one.
        let mut result = [0_u8; ID_SIZE];
        let mut high = carry as u8;

        for i in 0..ID_SIZE {
            result[i] = (high << 7) | (sum[i] >> 1);
            high = sum[i] & 1;
        }

        Id(result)
    }

    /// `self + 1`, saturating at [Id::MAX].
    pub fn successor(&self) -> Id {
        if *self == Id::MAX {
            return Id::MAX;
        }

        let mut result = self.0;

        for byte in result.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;

            if !overflow {
                break;
            }
        }

        Id(result)
    }

    /// A random Id within the inclusive range `[lower, upper]`.
    ///
    /// Keeps the prefix `lower` and `upper` share and randomizes the rest,
    /// which is uniform for the prefix aligned ranges produced by bucket splits.
    pub fn random_in_range(lower: &Id, upper: &Id) -> Id {
        let prefix = lower.shared_prefix_len(upper);
        let mut result = Id::random();

        for bit in 0..prefix {
            let byte = bit / 8;
            let mask = 0x80 >> (bit % 8);

            result.0[byte] = (result.0[byte] & !mask) | (lower.0[byte] & mask);
        }

        result.clamp(*lower, *upper)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
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
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Id, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                write!(f, "{ID_SIZE} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Id, E> {
                Id::from_bytes(v).map_err(|_| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id_from_u64(n: u64) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&n.to_be_bytes());
        Id(bytes)
    }

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        assert_eq!(id.xor(&id), Id::MIN);
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.xor(&b), b.xor(&a));
        }
    }

    #[test]
    fn distance_is_integer_xor() {
        let a = id_from_u64(0b1100);
        let b = id_from_u64(0b1010);

        assert_eq!(a.xor(&b), id_from_u64(0b0110));
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(id_from_u64(255) < id_from_u64(256));
        assert!(Id::MIN < Id::MAX);
    }

    #[test]
    fn shared_prefix() {
        let a = Id::MIN;
        let mut b = Id::MIN;
        b.0[2] = 0b0001_0000;

        assert_eq!(a.shared_prefix_len(&b), 19);
        assert_eq!(a.shared_prefix_len(&a), ID_BITS);
        assert_eq!(Id::MIN.shared_prefix_len(&Id::MAX), 0);
    }

    #[test]
    fn midpoint_of_full_range() {
        let mid = Id::MIN.midpoint(&Id::MAX);

        let mut expected = [u8::MAX; ID_SIZE];
        expected[0] = 0x7f;

        assert_eq!(mid, Id(expected));
        let mut successor = [0; ID_SIZE];
        successor[0] = 0x80;

        assert_eq!(mid.successor(), Id(successor));
    }

    #[test]
    fn midpoint_small_numbers() {
        assert_eq!(id_from_u64(10).midpoint(&id_from_u64(20)), id_from_u64(15));
        assert_eq!(id_from_u64(10).midpoint(&id_from_u64(13)), id_from_u64(11));
    }

    #[test]
    fn successor_carries() {
        assert_eq!(id_from_u64(0xff).successor(), id_from_u64(0x100));
        assert_eq!(Id::MAX.successor(), Id::MAX);
    }

    #[test]
    fn random_in_range_stays_in_range() {
        let lower = Id::MIN.midpoint(&Id::MAX).successor();
        let upper = Id::MAX;

        for _ in 0..100 {
            let id = Id::random_in_range(&lower, &upper);
            assert!(id >= lower && id <= upper);
        }

        let lower = id_from_u64(16);
        let upper = id_from_u64(31);

        for _ in 0..100 {
            let id = Id::random_in_range(&lower, &upper);
            assert!(id >= lower && id <= upper);
        }
    }

    #[test]
    fn digest_is_sha1() {
        assert_eq!(
            Id::digest(b"Hello World!").to_string(),
            "2ef7bde608ce5404e97d5f042f95f89f1c232871"
        );
    }

    #[test]
    fn from_str_round_trip() {
        let id = Id::random();
        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);

        assert!(Id::from_str("not hex").is_err());
    }

    #[test]
    fn invalid_size() {
        assert!(matches!(Id::from_bytes([0; 3]), Err(Error::InvalidIdSize(3))));
    }

    #[test]
    fn bencode() {
        let id = Id::random();
        let bytes = serde_bencode::to_bytes(&id).unwrap();

        assert_eq!(bytes.len(), 3 + ID_SIZE);
        assert_eq!(serde_bencode::from_bytes::<Id>(&bytes).unwrap(), id);
    }
}
